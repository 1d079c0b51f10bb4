//! Adaptive per-origin controller.
//!
//! Learns timeout/concurrency/delay recommendations per origin from observed
//! fetch outcomes (exponential moving averages plus Thompson sampling over
//! strategy buckets) and enforces per-origin token-bucket rate limits. All
//! state is in-memory behind one mutex; an optional JSON snapshot can be
//! saved and reloaded, but losing it only degrades recommendation quality.

use errors::*;
use time_helpers::duration_secs;

use rand::distributions::{Distribution, Gamma};
use rand::rngs::StdRng;
use rand::{FromEntropy, SeedableRng};
use serde_json;
use slog::Logger;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

//
// Public constants
//

pub const DEFAULT_LEARNING_RATE: f64 = 0.1;
pub const DEFAULT_MIN_SAMPLES: u64 = 10;

// Token bucket defaults: 10 requests/second with a burst of 20, per origin.
pub const DEFAULT_RATE: f64 = 10.0;
pub const DEFAULT_BURST: f64 = 20.0;

//
// Public types
//

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        *self == Outcome::Success
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strategy {
    Conservative,
    Balanced,
    Aggressive,
    Adaptive,
}

impl Strategy {
    pub fn from_str(s: &str) -> Option<Strategy> {
        match s {
            "conservative" => Some(Strategy::Conservative),
            "balanced" => Some(Strategy::Balanced),
            "aggressive" => Some(Strategy::Aggressive),
            "adaptive" => Some(Strategy::Adaptive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            Strategy::Conservative => "conservative",
            Strategy::Balanced => "balanced",
            Strategy::Aggressive => "aggressive",
            Strategy::Adaptive => "adaptive",
        }
    }
}

/// Effective fetch parameters for one origin, after confidence gating and
/// strategy modifiers have been applied.
#[derive(Clone, Debug)]
pub struct Recommendation {
    pub timeout:              Duration,
    pub concurrency:          u32,
    pub delay:                Duration,
    pub retry_count:          u32,
    pub use_proxy:            bool,
    pub block_resources:      bool,
    pub wait_for_network_idle: bool,
}

pub struct OptimizerOptions {
    pub strategy:         Strategy,
    pub learning_rate:    f64,
    pub min_samples:      u64,
    pub persistence_path: Option<PathBuf>,
    pub rate:             f64,
    pub burst:            f64,

    /// Seed for the Thompson sampler's RNG. Leave unset in production;
    /// setting it makes adaptive strategy selection fully replayable.
    pub seed: Option<u64>,
}

impl Default for OptimizerOptions {
    fn default() -> OptimizerOptions {
        OptimizerOptions {
            strategy:         Strategy::Adaptive,
            learning_rate:    DEFAULT_LEARNING_RATE,
            min_samples:      DEFAULT_MIN_SAMPLES,
            persistence_path: None,
            rate:             DEFAULT_RATE,
            burst:            DEFAULT_BURST,
            seed:             None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OptimizerStats {
    pub strategy:            &'static str,
    pub origins_tracked:     usize,
    pub global_requests:     u64,
    pub global_success_rate: f64,
    pub global_avg_time:     f64,
}

pub struct AdaptiveOptimizer {
    strategy:         Strategy,
    learning_rate:    f64,
    min_samples:      u64,
    persistence_path: Option<PathBuf>,
    default_rate:     f64,
    default_burst:    f64,

    state:   Mutex<State>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl AdaptiveOptimizer {
    pub fn new(log: &Logger, options: OptimizerOptions) -> AdaptiveOptimizer {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let optimizer = AdaptiveOptimizer {
            strategy:         options.strategy,
            learning_rate:    options.learning_rate,
            min_samples:      options.min_samples,
            persistence_path: options.persistence_path,
            default_rate:     options.rate,
            default_burst:    options.burst,
            state:            Mutex::new(State::new(options.learning_rate, rng)),
            buckets:          Mutex::new(HashMap::new()),
        };

        // A missing or corrupt snapshot degrades recommendation quality, not
        // correctness, so failures here are logged and swallowed.
        if let Err(e) = optimizer.load(log) {
            ::error_helpers::print_error(log, &e);
        }

        optimizer
    }

    /// Records one fetch outcome for an origin and, once the origin has
    /// enough samples, re-derives its learned parameters.
    pub fn record(&self, _log: &Logger, origin: &str, outcome: Outcome, latency: Duration) {
        let secs = duration_secs(latency);
        let mut state = lock(&self.state);
        let alpha = self.learning_rate;

        state
            .metrics
            .entry(origin.to_owned())
            .or_insert_with(OriginMetrics::new)
            .record(outcome, secs);
        state.global_metrics.record(outcome, secs);

        let success_value = if outcome.is_success() { 1.0 } else { 0.0 };
        state
            .success_ema
            .entry(origin.to_owned())
            .or_insert_with(|| Ema::new(alpha))
            .update(success_value);
        state
            .latency_ema
            .entry(origin.to_owned())
            .or_insert_with(|| Ema::new(alpha))
            .update(secs);
        state.global_success_ema.update(success_value);

        // Attribute the outcome to the strategy bucket this origin is
        // currently operating under.
        let bucket = {
            let profile = state
                .profiles
                .entry(origin.to_owned())
                .or_insert_with(OriginProfile::new);
            strategy_key(profile.effective_concurrency(), profile.effective_delay())
        };
        state.sampler.record(&bucket, outcome.is_success());

        let total = state.metrics[origin].total();
        if total >= self.min_samples {
            self.optimize_origin(&mut state, origin);
        }
    }

    /// Returns effective fetch parameters for an origin, using learned values
    /// where confident enough and defaults otherwise.
    pub fn recommend(&self, origin: &str) -> Recommendation {
        let mut state = lock(&self.state);

        let (mut timeout, mut concurrency, mut delay, retry_count, block_resources, idle) = {
            let profile = state
                .profiles
                .entry(origin.to_owned())
                .or_insert_with(OriginProfile::new);
            (
                profile.effective_timeout(),
                profile.effective_concurrency(),
                profile.effective_delay(),
                profile.retry_count,
                profile.block_resources,
                profile.wait_for_network_idle,
            )
        };

        match self.strategy {
            Strategy::Conservative => {
                timeout *= 1.5;
                delay *= 1.5;
                concurrency = concurrency.saturating_sub(1).max(1);
            }
            Strategy::Aggressive => {
                timeout *= 0.8;
                delay *= 0.5;
                concurrency = (concurrency + 2).min(10);
            }
            Strategy::Adaptive => {
                let selected = {
                    let State {
                        ref sampler,
                        ref mut rng,
                        ..
                    } = *state;
                    sampler.sample(rng, STRATEGY_BUCKETS)
                };
                if selected == "conservative" {
                    delay *= 1.2;
                } else if selected == "aggressive" {
                    delay *= 0.8;
                }
            }
            Strategy::Balanced => {}
        }

        let use_proxy = state
            .metrics
            .get(origin)
            .map(|m| proxy_heuristic(m, self.min_samples))
            .unwrap_or(false);

        Recommendation {
            timeout: duration_from_secs(timeout),
            concurrency,
            delay: duration_from_secs(delay),
            retry_count,
            use_proxy,
            block_resources,
            wait_for_network_idle: idle,
        }
    }

    /// True when the origin has enough samples and is doing badly enough
    /// (success rate below 50% or more than 20% timeouts) that routing it
    /// through a proxy is advisable.
    pub fn should_use_proxy(&self, origin: &str) -> bool {
        let state = lock(&self.state);
        state
            .metrics
            .get(origin)
            .map(|m| proxy_heuristic(m, self.min_samples))
            .unwrap_or(false)
    }

    /// Waits until the origin's token bucket holds at least `tokens`, then
    /// takes them. The profile mutex is never held while sleeping.
    pub fn acquire(&self, origin: &str, tokens: f64) {
        let wait = {
            let mut buckets = lock(&self.buckets);
            let bucket = buckets
                .entry(origin.to_owned())
                .or_insert_with(|| TokenBucket::new(self.default_rate, self.default_burst));
            bucket.refill();
            if bucket.tokens >= tokens {
                bucket.tokens -= tokens;
                None
            } else {
                let needed = tokens - bucket.tokens;
                Some(duration_from_secs(needed / bucket.rate))
            }
        };

        if let Some(wait) = wait {
            thread::sleep(wait);
            let mut buckets = lock(&self.buckets);
            if let Some(bucket) = buckets.get_mut(origin) {
                bucket.tokens = 0.0;
                bucket.last_update = Instant::now();
            }
        }
    }

    /// Overrides the token bucket for one origin.
    pub fn set_rate_limit(&self, origin: &str, rate: f64, burst: f64) {
        let mut buckets = lock(&self.buckets);
        buckets.insert(origin.to_owned(), TokenBucket::new(rate, burst));
    }

    /// Writes the snapshot (counters, latency tails, profiles, strategy α/β)
    /// to the configured path. The write goes to a temporary file first and
    /// is renamed into place so a crash mid-write can't corrupt the previous
    /// snapshot.
    pub fn save(&self, log: &Logger) -> Result<()> {
        let path = match self.persistence_path {
            Some(ref p) => p.clone(),
            None => return Ok(()),
        };

        let snapshot = {
            let state = lock(&self.state);
            Snapshot::from_state(&state)
        };

        let encoded = serde_json::to_string_pretty(&snapshot)?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, encoded.as_bytes())
            .chain_err(|| format!("Error writing snapshot to {:?}", tmp_path))?;
        fs::rename(&tmp_path, &path)
            .chain_err(|| format!("Error renaming snapshot into place at {:?}", path))?;

        info!(log, "Saved optimizer snapshot"; "path" => format!("{:?}", path));
        Ok(())
    }

    pub fn stats(&self) -> OptimizerStats {
        let state = lock(&self.state);
        OptimizerStats {
            strategy:            self.strategy.as_str(),
            origins_tracked:     state.metrics.len(),
            global_requests:     state.global_metrics.total(),
            global_success_rate: state.global_metrics.success_rate(),
            global_avg_time:     state.global_metrics.avg_time(),
        }
    }

    //
    // Private functions
    //

    fn load(&self, log: &Logger) -> Result<()> {
        let path = match self.persistence_path {
            Some(ref p) => p.clone(),
            None => return Ok(()),
        };
        if !path.exists() {
            return Ok(());
        }

        let encoded = fs::read_to_string(&path)
            .chain_err(|| format!("Error reading snapshot from {:?}", path))?;
        let snapshot: Snapshot = serde_json::from_str(&encoded)?;

        let mut state = lock(&self.state);
        snapshot.restore(&mut state, self.learning_rate);

        info!(log, "Loaded optimizer snapshot";
            "path" => format!("{:?}", path), "origins" => state.metrics.len());
        Ok(())
    }

    fn optimize_origin(&self, state: &mut State, origin: &str) {
        let (p95, total, failure_rate) = {
            let metrics = &state.metrics[origin];
            (
                metrics.p95_time(),
                metrics.total(),
                metrics.failure_count as f64 / metrics.total() as f64,
            )
        };
        let success_trend = state.success_ema.get(origin).and_then(|e| e.get());
        let use_proxy = proxy_heuristic(&state.metrics[origin], self.min_samples);

        let profile = state
            .profiles
            .entry(origin.to_owned())
            .or_insert_with(OriginProfile::new);

        // Timeout tracks 1.5x the p95 latency, clamped so a single
        // pathological origin can't pin a worker for minutes.
        if p95 > 0.0 {
            profile.optimal_timeout = Some((p95 * 1.5).max(MIN_TIMEOUT).min(MAX_TIMEOUT));
            profile.timeout_confidence = (total as f64 / 100.0).min(1.0);
        }

        if let Some(trend) = success_trend {
            profile.optimal_concurrency = Some(if trend >= 0.9 {
                (profile.concurrency + 1).min(10)
            } else if trend < 0.7 {
                profile.concurrency.saturating_sub(1).max(1)
            } else {
                profile.concurrency
            });
            profile.concurrency_confidence = (total as f64 / 50.0).min(1.0);
        }

        profile.optimal_delay = Some(if failure_rate > 0.3 {
            profile.delay_max * 1.5
        } else if failure_rate < 0.1 {
            profile.delay_min
        } else {
            (profile.delay_min + profile.delay_max) / 2.0
        });
        profile.delay_confidence = (total as f64 / 30.0).min(1.0);

        profile.use_proxy = use_proxy;
    }
}

//
// Private constants
//

static STRATEGY_BUCKETS: &'static [&'static str] = &["conservative", "balanced", "aggressive"];

// Clamp bounds for the learned timeout, in seconds.
const MIN_TIMEOUT: f64 = 30.0;
const MAX_TIMEOUT: f64 = 300.0;

// Number of latency samples kept per origin for percentile calculations.
const LATENCY_WINDOW: usize = 100;

//
// Private types
//

struct State {
    metrics:  HashMap<String, OriginMetrics>,
    profiles: HashMap<String, OriginProfile>,

    success_ema: HashMap<String, Ema>,
    latency_ema: HashMap<String, Ema>,

    global_metrics:     OriginMetrics,
    global_success_ema: Ema,

    sampler: ThompsonSampler,
    rng:     StdRng,
}

impl State {
    fn new(learning_rate: f64, rng: StdRng) -> State {
        State {
            metrics:            HashMap::new(),
            profiles:           HashMap::new(),
            success_ema:        HashMap::new(),
            latency_ema:        HashMap::new(),
            global_metrics:     OriginMetrics::new(),
            global_success_ema: Ema::new(learning_rate),
            sampler:            ThompsonSampler::new(),
            rng,
        }
    }
}

#[derive(Clone, Debug)]
struct OriginMetrics {
    success_count: u64,
    failure_count: u64,
    timeout_count: u64,
    total_time:    f64,
    min_time:      f64,
    max_time:      f64,
    times:         Vec<f64>,
}

impl OriginMetrics {
    fn new() -> OriginMetrics {
        OriginMetrics {
            success_count: 0,
            failure_count: 0,
            timeout_count: 0,
            total_time:    0.0,
            min_time:      ::std::f64::INFINITY,
            max_time:      0.0,
            times:         Vec::new(),
        }
    }

    fn record(&mut self, outcome: Outcome, secs: f64) {
        match outcome {
            Outcome::Success => self.success_count += 1,
            Outcome::Failure => self.failure_count += 1,
            Outcome::Timeout => self.timeout_count += 1,
        }

        self.total_time += secs;
        if secs < self.min_time {
            self.min_time = secs;
        }
        if secs > self.max_time {
            self.max_time = secs;
        }

        self.times.push(secs);
        if self.times.len() > LATENCY_WINDOW {
            let excess = self.times.len() - LATENCY_WINDOW;
            self.times.drain(..excess);
        }
    }

    fn total(&self) -> u64 {
        self.success_count + self.failure_count + self.timeout_count
    }

    fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.total() as f64
    }

    fn avg_time(&self) -> f64 {
        if self.times.is_empty() {
            return 0.0;
        }
        self.times.iter().sum::<f64>() / self.times.len() as f64
    }

    // Percentiles are unstable on small windows, so until we've seen 20
    // samples the observed maximum stands in for the p95.
    fn p95_time(&self) -> f64 {
        if self.times.len() < 20 {
            return self.max_time;
        }
        let mut sorted = self.times.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(::std::cmp::Ordering::Equal));
        let index = (sorted.len() as f64 * 0.95) as usize;
        sorted[index.min(sorted.len() - 1)]
    }
}

#[derive(Clone, Debug)]
struct OriginProfile {
    timeout:               f64,
    concurrency:           u32,
    delay_min:             f64,
    delay_max:             f64,
    retry_count:           u32,
    use_proxy:             bool,
    block_resources:       bool,
    wait_for_network_idle: bool,

    optimal_timeout:     Option<f64>,
    optimal_concurrency: Option<u32>,
    optimal_delay:       Option<f64>,

    timeout_confidence:     f64,
    concurrency_confidence: f64,
    delay_confidence:       f64,
}

impl OriginProfile {
    fn new() -> OriginProfile {
        OriginProfile {
            timeout:               120.0,
            concurrency:           3,
            delay_min:             0.5,
            delay_max:             2.0,
            retry_count:           3,
            use_proxy:             false,
            block_resources:       true,
            wait_for_network_idle: false,

            optimal_timeout:     None,
            optimal_concurrency: None,
            optimal_delay:       None,

            timeout_confidence:     0.0,
            concurrency_confidence: 0.0,
            delay_confidence:       0.0,
        }
    }

    fn effective_timeout(&self) -> f64 {
        if self.timeout_confidence > 0.5 {
            self.optimal_timeout.unwrap_or(self.timeout)
        } else {
            self.timeout
        }
    }

    fn effective_concurrency(&self) -> u32 {
        if self.concurrency_confidence > 0.5 {
            self.optimal_concurrency.unwrap_or(self.concurrency)
        } else {
            self.concurrency
        }
    }

    fn effective_delay(&self) -> f64 {
        if self.delay_confidence > 0.5 {
            self.optimal_delay
                .unwrap_or((self.delay_min + self.delay_max) / 2.0)
        } else {
            (self.delay_min + self.delay_max) / 2.0
        }
    }
}

#[derive(Clone, Debug)]
struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    fn new(alpha: f64) -> Ema {
        Ema { alpha, value: None }
    }

    fn update(&mut self, new_value: f64) -> f64 {
        let updated = match self.value {
            Some(v) => self.alpha * new_value + (1.0 - self.alpha) * v,
            None => new_value,
        };
        self.value = Some(updated);
        updated
    }

    fn get(&self) -> Option<f64> {
        self.value
    }
}

struct ThompsonSampler {
    successes: HashMap<String, u64>,
    failures:  HashMap<String, u64>,
}

impl ThompsonSampler {
    fn new() -> ThompsonSampler {
        ThompsonSampler {
            successes: HashMap::new(),
            failures:  HashMap::new(),
        }
    }

    fn record(&mut self, option: &str, success: bool) {
        let counter = if success {
            &mut self.successes
        } else {
            &mut self.failures
        };
        *counter.entry(option.to_owned()).or_insert(0) += 1;
    }

    // Samples each option's Beta(α+1, β+1) posterior and returns the argmax.
    fn sample(&self, rng: &mut StdRng, options: &[&'static str]) -> &'static str {
        let mut best = options[0];
        let mut best_sample = -1.0;

        for option in options {
            let alpha = self.successes.get(*option).cloned().unwrap_or(0) as f64 + 1.0;
            let beta = self.failures.get(*option).cloned().unwrap_or(0) as f64 + 1.0;
            let sample = sample_beta(rng, alpha, beta);
            if sample > best_sample {
                best_sample = sample;
                best = option;
            }
        }

        best
    }
}

struct TokenBucket {
    rate:        f64,
    burst:       f64,
    tokens:      f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> TokenBucket {
        TokenBucket {
            rate,
            burst,
            tokens: burst,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = duration_secs(now.duration_since(self.last_update));
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_update = now;
    }
}

#[derive(Deserialize, Serialize)]
struct MetricsSnapshot {
    success_count: u64,
    failure_count: u64,
    timeout_count: u64,
    total_time:    f64,
    times:         Vec<f64>,
}

#[derive(Deserialize, Serialize)]
struct ProfileSnapshot {
    timeout:               f64,
    concurrency:           u32,
    delay_min:             f64,
    delay_max:             f64,
    retry_count:           u32,
    use_proxy:             bool,
    block_resources:       bool,
    wait_for_network_idle: bool,
    optimal_timeout:       Option<f64>,
    optimal_concurrency:   Option<u32>,
    optimal_delay:         Option<f64>,
    timeout_confidence:    f64,
    concurrency_confidence: f64,
    delay_confidence:      f64,
}

#[derive(Deserialize, Serialize)]
struct Snapshot {
    metrics:            HashMap<String, MetricsSnapshot>,
    profiles:           HashMap<String, ProfileSnapshot>,
    strategy_successes: HashMap<String, u64>,
    strategy_failures:  HashMap<String, u64>,
}

impl Snapshot {
    fn from_state(state: &State) -> Snapshot {
        Snapshot {
            metrics: state
                .metrics
                .iter()
                .map(|(origin, m)| {
                    (
                        origin.clone(),
                        MetricsSnapshot {
                            success_count: m.success_count,
                            failure_count: m.failure_count,
                            timeout_count: m.timeout_count,
                            total_time:    m.total_time,
                            times:         m.times.clone(),
                        },
                    )
                })
                .collect(),
            profiles: state
                .profiles
                .iter()
                .map(|(origin, p)| {
                    (
                        origin.clone(),
                        ProfileSnapshot {
                            timeout:               p.timeout,
                            concurrency:           p.concurrency,
                            delay_min:             p.delay_min,
                            delay_max:             p.delay_max,
                            retry_count:           p.retry_count,
                            use_proxy:             p.use_proxy,
                            block_resources:       p.block_resources,
                            wait_for_network_idle: p.wait_for_network_idle,
                            optimal_timeout:       p.optimal_timeout,
                            optimal_concurrency:   p.optimal_concurrency,
                            optimal_delay:         p.optimal_delay,
                            timeout_confidence:    p.timeout_confidence,
                            concurrency_confidence: p.concurrency_confidence,
                            delay_confidence:      p.delay_confidence,
                        },
                    )
                })
                .collect(),
            strategy_successes: state.sampler.successes.clone(),
            strategy_failures:  state.sampler.failures.clone(),
        }
    }

    fn restore(self, state: &mut State, learning_rate: f64) {
        for (origin, snapshot) in self.metrics {
            let mut metrics = OriginMetrics::new();
            metrics.success_count = snapshot.success_count;
            metrics.failure_count = snapshot.failure_count;
            metrics.timeout_count = snapshot.timeout_count;
            metrics.total_time = snapshot.total_time;
            for secs in &snapshot.times {
                if *secs < metrics.min_time {
                    metrics.min_time = *secs;
                }
                if *secs > metrics.max_time {
                    metrics.max_time = *secs;
                }
            }
            metrics.times = snapshot.times;

            state.success_ema.insert(origin.clone(), Ema::new(learning_rate));
            state.latency_ema.insert(origin.clone(), Ema::new(learning_rate));
            state.metrics.insert(origin, metrics);
        }

        for (origin, snapshot) in self.profiles {
            let mut profile = OriginProfile::new();
            profile.timeout = snapshot.timeout;
            profile.concurrency = snapshot.concurrency;
            profile.delay_min = snapshot.delay_min;
            profile.delay_max = snapshot.delay_max;
            profile.retry_count = snapshot.retry_count;
            profile.use_proxy = snapshot.use_proxy;
            profile.block_resources = snapshot.block_resources;
            profile.wait_for_network_idle = snapshot.wait_for_network_idle;
            profile.optimal_timeout = snapshot.optimal_timeout;
            profile.optimal_concurrency = snapshot.optimal_concurrency;
            profile.optimal_delay = snapshot.optimal_delay;
            profile.timeout_confidence = snapshot.timeout_confidence;
            profile.concurrency_confidence = snapshot.concurrency_confidence;
            profile.delay_confidence = snapshot.delay_confidence;
            state.profiles.insert(origin, profile);
        }

        state.sampler.successes = self.strategy_successes;
        state.sampler.failures = self.strategy_failures;
    }
}

//
// Private functions
//

fn duration_from_secs(secs: f64) -> Duration {
    Duration::from_millis((secs.max(0.0) * 1000.0) as u64)
}

// Recover from poisoning rather than panicking: the state is counters and
// profiles, all of which stay internally consistent under any interleaving.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn proxy_heuristic(metrics: &OriginMetrics, min_samples: u64) -> bool {
    if metrics.total() < min_samples {
        return false;
    }
    if metrics.success_rate() < 0.5 {
        return true;
    }
    metrics.timeout_count as f64 > metrics.total() as f64 * 0.2
}

// Classifies an origin's current operating point into the strategy bucket
// that Thompson sampling learns over.
fn strategy_key(concurrency: u32, delay: f64) -> String {
    if concurrency <= 2 && delay >= 2.0 {
        "conservative".to_owned()
    } else if concurrency >= 5 && delay <= 0.5 {
        "aggressive".to_owned()
    } else {
        "balanced".to_owned()
    }
}

// Beta(α, β) by way of two Gamma draws: X/(X+Y) with X ~ Γ(α, 1) and
// Y ~ Γ(β, 1).
fn sample_beta(rng: &mut StdRng, alpha: f64, beta: f64) -> f64 {
    let x = Gamma::new(alpha, 1.0).sample(rng);
    let y = Gamma::new(beta, 1.0).sample(rng);
    if x + y == 0.0 {
        return 0.5;
    }
    x / (x + y)
}

//
// Tests
//
