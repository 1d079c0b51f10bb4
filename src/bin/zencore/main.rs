#![recursion_limit = "4096"]

#[macro_use]
extern crate chan;
extern crate chan_signal;
extern crate clap;
extern crate diesel;
#[macro_use]
extern crate diesel_migrations;
#[macro_use]
extern crate error_chain;
extern crate isatty;
extern crate openssl_probe;
extern crate r2d2;
extern crate r2d2_diesel;
#[macro_use]
extern crate slog;
extern crate slog_async;
extern crate slog_term;
extern crate uuid;
extern crate zencore;

use zencore::browser_pool::{BrowserPool, HeadlessFetcherFactory};
use zencore::conn_pool::{ConnectionPool, PoolOptions};
use zencore::countries;
use zencore::error_helpers;
use zencore::errors::*;
use zencore::extractor::RegexExtractor;
use zencore::http_requester::HttpRequesterLive;
use zencore::mediators::backlog_counter;
use zencore::mediators::batch_processor;
use zencore::optimizer::{AdaptiveOptimizer, OptimizerOptions, Strategy};
use zencore::origins::UrlOriginResolver;

use chan::Receiver;
use chan_signal::Signal;
use clap::{App, ArgMatches, SubCommand};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use isatty::stdout_isatty;
use r2d2::Pool;
use r2d2_diesel::ConnectionManager;
use slog::{Drain, Logger};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use uuid::Uuid;

// Migrations get pulled into the final binary. This makes it quite a bit
// easier to run them on remote peers without trouble.
embed_migrations!("./migrations");

// Main
//

fn main() {
    // While the various TLS libraries tend to work out of the box on Mac OS,
    // the location of CA certs can vary across Linux distributions. This is
    // a library that helps locate a usable bundle so that we can properly
    // make TLS requests.
    openssl_probe::init_ssl_cert_env_vars();

    // Signal delivery over a channel; must be installed before any other
    // thread spawns.
    let signal = chan_signal::notify(&[Signal::INT, Signal::TERM]);

    // Note that when using `arg_from_usage`, `<arg>` is required and `[arg]`
    // is optional.
    let mut app = App::new("zencore")
        .version("0.1")
        .about("Multi-peer contact enrichment for the zen_contacts work set")
        .arg_from_usage("    --log-async 'Log asynchronously (good for logging on servers)'")
        .arg_from_usage("-c, --num-connections=[NUM] 'Number of Postgres connections'")
        .arg_from_usage(
            "    --pool-timeout=[SECONDS] 'Timeout for getting a database connection from pool'",
        )
        .arg_from_usage("-q, --quiet 'Quiets all output'")
        .subcommand(
            SubCommand::with_name("count")
                .about("Counts pending and completed records in the work set")
                .arg_from_usage("--country=[CC] 'Restrict the pending count to one ISO-2 country'"),
        )
        .subcommand(
            SubCommand::with_name("error")
                .about("Triggers an error (for testing error output)"),
        )
        .subcommand(SubCommand::with_name("migrate").about("Migrates the database"))
        .subcommand(
            SubCommand::with_name("sleep")
                .about("Sleep (useful for attaching to with Docker)")
                .arg_from_usage("<SLEEP_SECONDS>... 'Number of seconds to sleep'"),
        )
        .subcommand(
            SubCommand::with_name("work")
                .about("Claims batches of pending records and enriches them")
                .arg_from_usage("--run-once 'Run only one batch instead of looping'")
                .arg_from_usage("--peer-id=[ID] 'Peer identity recorded as last_scrape_server'")
                .arg_from_usage("--country=[CC] 'Process only records from one ISO-2 country'")
                .arg_from_usage("-b, --batch-size=[NUM] 'Records to claim per batch'")
                .arg_from_usage("--browser-workers=[NUM] 'Number of persistent browser workers'")
                .arg_from_usage(
                    "--scheduler-workers=[NUM] 'Number of in-process scheduler workers'",
                )
                .arg_from_usage(
                    "--direct-http 'Allow fetches without render flags to bypass the browser'",
                )
                .arg_from_usage(
                    "--optimizer-strategy=[STRATEGY] 'conservative|balanced|aggressive|adaptive'",
                )
                .arg_from_usage("--optimizer-state=[PATH] 'Path for the optimizer snapshot'"),
        );

    let matches = app.clone().get_matches();
    let options = parse_global_options(&matches);
    let log = log(&options);

    let res = match matches.subcommand_name() {
        Some("count") => subcommand_count(&log, &matches, &options),
        Some("error") => subcommand_error(&log, &matches, &options),
        Some("migrate") => subcommand_migrate(&log, &matches, &options),
        Some("sleep") => subcommand_sleep(&log, &matches, &options),
        Some("work") => subcommand_work(&log, &matches, &options, &signal),
        None => {
            app.print_help().unwrap();
            Ok(())
        }
        _ => unreachable!(),
    };
    if let Err(ref e) = res {
        handle_error(&log, e);
    };
}

//
// Subcommands
//

fn subcommand_count(log: &Logger, matches: &ArgMatches, options: &GlobalOptions) -> Result<()> {
    let matches = matches.subcommand_matches("count").unwrap();
    let pool = pool(log, options)?;

    let res = backlog_counter::Mediator {
        pool,
        country_filter: matches.value_of("country").map(|c| c.to_owned()),
    }.run(log)?;

    info!(log, "Work set";
        "total" => res.total, "pending" => res.pending, "completed" => res.completed);
    for &(ref country, pending) in res.per_country.iter().take(20) {
        info!(log, "Pending by country"; "country" => country.as_str(), "pending" => pending);
    }
    Ok(())
}

fn subcommand_error(_log: &Logger, matches: &ArgMatches, _options: &GlobalOptions) -> Result<()> {
    let _matches = matches.subcommand_matches("error").unwrap();

    // We chain some extra context on to add a little flavor and to help show
    // what output would look like
    Err(Error::from("Error triggered by user request")
        .chain_err(|| "Chained context 1")
        .chain_err(|| "Chained context 2"))
}

fn subcommand_migrate(log: &Logger, matches: &ArgMatches, options: &GlobalOptions) -> Result<()> {
    let _matches = matches.subcommand_matches("migrate").unwrap();
    let pool = pool(log, options)?;
    let conn = pool.get()?;

    info!(log, "Running migrations");

    if options.quiet {
        embedded_migrations::run(&*conn)
    } else {
        embedded_migrations::run_with_output(&*conn, &mut std::io::stdout())
    }.chain_err(|| "Error running migrations")?;

    info!(log, "Finished migrations");
    Ok(())
}

fn subcommand_sleep(log: &Logger, matches: &ArgMatches, _options: &GlobalOptions) -> Result<()> {
    let matches = matches.subcommand_matches("sleep").unwrap();

    let sleep_seconds = matches
        .value_of("SLEEP_SECONDS")
        .unwrap()
        .parse::<u64>()
        .chain_err(|| "Error parsing integer")?;

    info!(log, "Starting sleep"; "seconds" => sleep_seconds);
    thread::sleep(Duration::from_secs(sleep_seconds));
    info!(log, "Finished sleep");

    Ok(())
}

fn subcommand_work(
    log: &Logger,
    matches: &ArgMatches,
    options: &GlobalOptions,
    signal: &Receiver<Signal>,
) -> Result<()> {
    let matches = matches.subcommand_matches("work").unwrap();
    let run_once = matches.is_present("run-once");

    let peer_id = matches
        .value_of("peer-id")
        .map(|s| s.to_owned())
        .unwrap_or_else(|| env::var("PEER_ID").unwrap_or_else(|_| default_peer_id()));

    let country_filter = matches
        .value_of("country")
        .map(|s| s.to_owned())
        .or_else(|| env::var("COUNTRY_FILTER").ok());
    if let Some(ref country) = country_filter {
        if !countries::is_valid(&country.trim().to_uppercase()) {
            bail!("Invalid country filter: {}", country);
        }
    }

    let batch_size = arg_or_env_u64(matches, "batch-size", "BATCH_SIZE", 100) as i64;
    let browser_workers = arg_or_env_u64(matches, "browser-workers", "BROWSER_WORKERS", 4) as u32;
    let scheduler_workers =
        arg_or_env_u64(matches, "scheduler-workers", "SCHEDULER_WORKERS", 4) as u32;
    let direct_http = matches.is_present("direct-http");

    let strategy_name = matches
        .value_of("optimizer-strategy")
        .map(|s| s.to_owned())
        .unwrap_or_else(|| {
            env::var("OPTIMIZER_STRATEGY").unwrap_or_else(|_| "adaptive".to_owned())
        });
    let strategy = Strategy::from_str(&strategy_name)
        .ok_or_else(|| Error::from(format!("Invalid optimizer strategy: {}", strategy_name)))?;

    let pool = pool(log, options)?;
    verify_schema(log, &pool)?;

    let mut optimizer_options = OptimizerOptions::default();
    optimizer_options.strategy = strategy;
    optimizer_options.learning_rate =
        env_f64("OPTIMIZER_LEARNING_RATE", optimizer_options.learning_rate);
    optimizer_options.min_samples =
        env_u64("OPTIMIZER_MIN_SAMPLES", optimizer_options.min_samples);
    optimizer_options.rate = env_f64("RATE_LIMIT_RATE", optimizer_options.rate);
    optimizer_options.burst = env_f64("RATE_LIMIT_BURST", optimizer_options.burst);
    optimizer_options.persistence_path = matches
        .value_of("optimizer-state")
        .map(PathBuf::from)
        .or_else(|| env::var("OPTIMIZER_STATE").ok().map(PathBuf::from));
    let optimizer = Arc::new(AdaptiveOptimizer::new(log, optimizer_options));

    let conn_pool = Arc::new(ConnectionPool::new(
        log,
        connection_pool_options(),
        Arc::clone(&optimizer),
    )?);
    ConnectionPool::start_cleanup(&conn_pool, log)?;

    let browser_pool = Arc::new(BrowserPool::start(
        log,
        Box::new(HeadlessFetcherFactory { headless: true }),
        browser_workers,
    )?);

    let mut mediator = batch_processor::Mediator {
        pool:            pool.clone(),
        peer_id:         peer_id.clone(),
        batch_size,
        country_filter,
        num_workers:     scheduler_workers,
        direct_http,
        optimizer:       Arc::clone(&optimizer),
        browser_pool:    Arc::clone(&browser_pool),
        http_requester:  Arc::new(HttpRequesterLive {
            pool: Arc::clone(&conn_pool),
        }),
        extractor:       Arc::new(RegexExtractor),
        origin_resolver: Arc::new(UrlOriginResolver),
    };

    info!(log, "Starting work loop";
        "peer_id" => peer_id.as_str(), "batch_size" => batch_size,
        "browser_workers" => browser_workers, "scheduler_workers" => scheduler_workers);

    let mut num_loops = 0;
    let res = loop {
        chan_select! {
            signal.recv() -> sig => {
                info!(log, "Received signal -- shutting down"; "signal" => format!("{:?}", sig));
                break Ok(());
            },
            default => {},
        }

        match mediator.run(log) {
            Ok(res) => {
                num_loops += 1;
                info!(log, "Finished work loop";
                    "num_loops" => num_loops, "num_claimed" => res.num_claimed,
                    "num_upserted" => res.num_upserted, "num_failed" => res.num_failed,
                    "num_invalid" => res.num_invalid);

                if run_once {
                    break Ok(());
                }

                if res.num_claimed < 1 {
                    info!(log, "No records claimed -- sleeping"; "seconds" => SLEEP_SECONDS);
                    let timeout = chan::after(Duration::from_secs(SLEEP_SECONDS));
                    chan_select! {
                        signal.recv() -> sig => {
                            info!(log, "Received signal while sleeping -- shutting down";
                                "signal" => format!("{:?}", sig));
                            break Ok(());
                        },
                        timeout.recv() => {},
                    }
                }
            }
            Err(e) => break Err(e),
        }
    };

    let browser_stats = browser_pool.stats();
    let conn_stats = conn_pool.stats();
    let optimizer_stats = optimizer.stats();
    info!(log, "Run statistics";
        "browser_requests" => browser_stats.requests_completed,
        "browser_failed" => browser_stats.requests_failed,
        "connections_created" => conn_stats.connections_created,
        "connections_reused" => conn_stats.connections_reused,
        "origins_tracked" => optimizer_stats.origins_tracked,
        "global_success_rate" =>
            format!("{:.1}%", optimizer_stats.global_success_rate * 100.0));

    // Shutdown ordering: drain the browser pool, stop the connection pool's
    // cleanup task and close its connections, then persist what the
    // optimizer learned. The database pool drops with the process.
    browser_pool.shutdown(log);
    conn_pool.stop_cleanup(log);
    conn_pool.close_all(log);
    if let Err(e) = optimizer.save(log) {
        error_helpers::print_error(log, &e);
    }

    res
}

//
// Private types/functions
//

// Timeout after which to close idle database connections in the pool. In
// seconds.
const IDLE_TIMEOUT: u64 = 10;

const NUM_CONNECTIONS: u32 = 50;

// Default timeout for blocking on the database pool waiting for a
// connection. In seconds.
const POOL_TIMEOUT: u64 = 10;

// For commands that loop, the number of seconds to sleep between iterations
// where no records were processed.
const SLEEP_SECONDS: u64 = 60;

// Server-side statement timeout applied to every pooled connection, so a
// wedged claim or upsert can't hold advisory locks indefinitely. In
// milliseconds.
const STATEMENT_TIMEOUT_MS: u64 = 60_000;

struct GlobalOptions {
    log_async:       bool,
    num_connections: u32,
    pool_timeout:    Duration,
    quiet:           bool,
}

fn arg_or_env_u64(matches: &ArgMatches, arg: &str, var: &str, default: u64) -> u64 {
    matches
        .value_of(arg)
        .map(|s| s.parse::<u64>().unwrap())
        .unwrap_or_else(|| {
            env::var(var)
                .map(|s| s.parse::<u64>().unwrap())
                .unwrap_or(default)
        })
}

fn connection_pool_options() -> PoolOptions {
    let defaults = PoolOptions::default();
    PoolOptions {
        max_per_host:       env_u64("MAX_CONNECTIONS_PER_HOST", defaults.max_per_host as u64)
            as usize,
        max_total:          env_u64("MAX_TOTAL_CONNECTIONS", defaults.max_total as u64) as usize,
        connection_timeout: Duration::from_secs(env_u64(
            "CONNECTION_TIMEOUT",
            defaults.connection_timeout.as_secs(),
        )),
        idle_timeout:       Duration::from_secs(env_u64(
            "CONNECTION_IDLE_TIMEOUT",
            defaults.idle_timeout.as_secs(),
        )),
        max_age:            Duration::from_secs(env_u64(
            "MAX_CONNECTION_AGE",
            defaults.max_age.as_secs(),
        )),
    }
}

fn default_peer_id() -> String {
    let id = Uuid::new_v4().to_string();
    format!("peer-{}", &id[..8])
}

fn env_f64(var: &str, default: f64) -> f64 {
    env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_u64(var: &str, default: u64) -> u64 {
    env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn handle_error(log: &Logger, e: &Error) {
    error_helpers::print_error(log, e);
    ::std::process::exit(1);
}

fn log(options: &GlobalOptions) -> Logger {
    if options.quiet {
        slog::Logger::root(slog::Discard, o!())
    } else if options.log_async {
        let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let async_drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(async_drain, o!())
    } else {
        let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
        let drain = slog_term::CompactFormat::new(decorator).build().fuse();
        slog::Logger::root(drain, o!())
    }
}

fn parse_global_options(matches: &ArgMatches) -> GlobalOptions {
    GlobalOptions {
        // Go async if we've been explicitly told to do so. Otherwise, detect
        // whether we should go async based on whether stdout is a terminal.
        // Sync is okay for terminals, but quite bad for server logs.
        log_async: if matches.is_present("log-async") {
            true
        } else {
            !stdout_isatty()
        },

        num_connections: matches
            .value_of("num-connections")
            .map(|s| s.parse::<u32>().unwrap())
            .unwrap_or_else(|| {
                env::var("NUM_CONNECTIONS")
                    .map(|s| s.parse::<u32>().unwrap())
                    .unwrap_or(NUM_CONNECTIONS)
            }),

        pool_timeout: Duration::from_secs(
            matches
                .value_of("pool-timeout")
                .map(|s| s.parse::<u64>().unwrap())
                .unwrap_or_else(|| {
                    env::var("POOL_TIMEOUT")
                        .map(|s| s.parse::<u64>().unwrap())
                        .unwrap_or(POOL_TIMEOUT)
                }),
        ),

        quiet: matches.is_present("quiet"),
    }
}

/// Initializes and returns a connection pool suitable for use across
/// threads.
fn pool(log: &Logger, options: &GlobalOptions) -> Result<Pool<ConnectionManager<PgConnection>>> {
    debug!(log, "Initializing connection pool";
        "num_connections" => options.num_connections,
        "pool_timeout" => format!("{:?}", options.pool_timeout));

    let database_url = env::var("DATABASE_URL").chain_err(|| "DATABASE_URL must be set")?;
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder()
        .connection_timeout(options.pool_timeout)
        .connection_customizer(Box::new(StatementTimeoutCustomizer))
        .idle_timeout(Some(Duration::from_secs(IDLE_TIMEOUT)))
        .max_size(options.num_connections)
        // If `min_idle` is not set, then `r2d2` will open a number of connections equal to
        // `max_size` on startup. We'd much prefer a more constrained number of connections than an
        // ultra-hot startup, so keep this set at 0.
        .min_idle(Some(0))
        .build(manager)
        .map_err(Error::from)
}

#[derive(Debug)]
struct StatementTimeoutCustomizer;

impl r2d2::CustomizeConnection<PgConnection, r2d2_diesel::Error> for StatementTimeoutCustomizer {
    fn on_acquire(
        &self,
        conn: &mut PgConnection,
    ) -> ::std::result::Result<(), r2d2_diesel::Error> {
        let timeout_ms = env_u64("STATEMENT_TIMEOUT", STATEMENT_TIMEOUT_MS);
        diesel::sql_query(format!("SET statement_timeout = {}", timeout_ms))
            .execute(conn)
            .map_err(r2d2_diesel::Error::QueryError)?;
        Ok(())
    }
}

/// Fails fast when the target schema is missing so the peer exits non-zero
/// at startup instead of erroring batch after batch.
fn verify_schema(log: &Logger, pool: &Pool<ConnectionManager<PgConnection>>) -> Result<()> {
    let conn = pool.get()?;
    diesel::sql_query("SELECT 1 FROM zen_contacts LIMIT 1")
        .execute(&*conn)
        .chain_err(|| "Table zen_contacts is missing -- run `zencore migrate` first")?;
    debug!(log, "Schema validation passed");
    Ok(())
}
