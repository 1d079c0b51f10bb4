//! Step timing for the mediator pipelines.
//!
//! Wraps a unit of work in start/finish log lines carrying its wall-clock
//! time, and converts elapsed durations into the fractional seconds stored
//! in the scrape metadata columns and fed to the origin controller.

use slog::Logger;
use std::time::{Duration, Instant};

#[inline]
pub fn log_timed<T, F>(log: &Logger, f: F) -> T
where
    F: FnOnce(&Logger) -> T,
{
    let start = Instant::now();
    info!(log, "Start");
    let res = f(log);
    info!(log, "Finish"; "elapsed" => human_duration(start.elapsed()));
    res
}

/// Fractional seconds of a duration. This is the representation used for
/// `scrape_time_seconds` and for the controller's latency samples.
#[inline]
pub fn duration_secs(d: Duration) -> f64 {
    d.as_secs() as f64 + f64::from(d.subsec_nanos()) * 1e-9
}

/// Renders a duration at a precision suited to its magnitude. Batch steps
/// run for seconds, single fetches for milliseconds, lock operations for
/// less; one fixed unit would make half the log lines unreadable.
pub fn human_duration(d: Duration) -> String {
    let secs = duration_secs(d);
    if secs >= 1.0 {
        format!("{:.3}s", secs)
    } else if secs >= 0.001 {
        format!("{:.3}ms", secs * 1000.0)
    } else {
        format!("{}µs", (secs * 1_000_000.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use time_helpers::*;

    #[test]
    fn test_duration_secs() {
        assert_eq!(0.0, duration_secs(Duration::from_secs(0)));
        assert_eq!(0.5, duration_secs(Duration::from_millis(500)));
        assert_eq!(2.0, duration_secs(Duration::from_secs(2)));
    }

    #[test]
    fn test_human_duration() {
        assert_eq!("2.000s", human_duration(Duration::from_secs(2)));
        assert_eq!("1.500s", human_duration(Duration::from_millis(1500)));
        assert_eq!("250.000ms", human_duration(Duration::from_millis(250)));
        assert_eq!("750µs", human_duration(Duration::from_micros(750)));
    }
}
