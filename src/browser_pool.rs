//! Persistent browser worker pool.
//!
//! Launching a browser costs seconds; creating a page in a warm one costs
//! milliseconds. Each pool worker therefore owns a single long-lived browser
//! for its whole lifetime and only pages are created and destroyed per
//! fetch. Work flows over two channels: a request queue any worker may
//! consume from and a result queue drained by a collector thread that
//! signals per-request rendezvous handles. Requests pair with results by
//! monotonic integer id only; no ordering is preserved by the queues.

use errors::*;
use time_helpers::duration_secs;

use chan::{Receiver, Sender};
use headless_chrome::protocol::cdp::Network;
use headless_chrome::{Browser, LaunchOptionsBuilder};
use slog::Logger;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

//
// Public types
//

/// Per-request rendering knobs, carried on the wire with every fetch. These
/// come from the origin controller's recommendation, so two records in the
/// same batch can render differently.
#[derive(Clone, Copy, Debug, Default)]
pub struct RenderOpts {
    pub block_resources:       bool,
    pub wait_for_network_idle: bool,
}

#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub id:      u64,
    pub url:     String,
    pub timeout: Duration,
    pub render:  RenderOpts,
}

#[derive(Clone, Debug)]
pub struct FetchResult {
    pub id:        u64,
    pub ok:        bool,
    pub status:    u16,
    pub html:      String,
    pub final_url: String,
    pub error:     Option<String>,
    pub elapsed:   Duration,
}

/// What a worker's browser came back with for one page.
#[derive(Clone, Debug)]
pub struct BrowserPage {
    pub status:    u16,
    pub html:      String,
    pub final_url: String,
}

pub trait BrowserFetcher {
    fn fetch(&mut self, log: &Logger, req: &FetchRequest) -> Result<BrowserPage>;
}

pub trait BrowserFetcherFactory: Send {
    // This is here because it's difficult to make a trait cloneable.
    fn clone_box(&self) -> Box<BrowserFetcherFactory>;

    /// Creates the fetcher a worker will own for its whole lifetime. For the
    /// live implementation this launches the browser.
    fn create(&self, log: &Logger) -> Result<Box<BrowserFetcher>>;
}

#[derive(Clone, Debug)]
pub struct HeadlessFetcherFactory {
    pub headless: bool,
}

impl BrowserFetcherFactory for HeadlessFetcherFactory {
    fn clone_box(&self) -> Box<BrowserFetcherFactory> {
        Box::new(self.clone())
    }

    fn create(&self, log: &Logger) -> Result<Box<BrowserFetcher>> {
        let options = LaunchOptionsBuilder::default()
            .headless(self.headless)
            .window_size(Some((1920, 1080)))
            // Workers legitimately sit idle between batches; don't let the
            // browser connection reap itself underneath us.
            .idle_browser_timeout(Duration::from_secs(IDLE_BROWSER_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::from(format!("Error building launch options: {}", e)))?;

        let browser = Browser::new(options)
            .map_err(|e| Error::from(format!("Error launching browser: {}", e)))?;
        info!(log, "Browser launched");

        Ok(Box::new(HeadlessFetcher { browser }))
    }
}

pub struct HeadlessFetcher {
    browser: Browser,
}

impl BrowserFetcher for HeadlessFetcher {
    fn fetch(&mut self, _log: &Logger, req: &FetchRequest) -> Result<BrowserPage> {
        let tab = self.browser
            .new_tab()
            .map_err(|e| Error::from(format!("Error creating page: {}", e)))?;
        tab.set_default_timeout(req.timeout);

        let res = (|| -> Result<BrowserPage> {
            tab.set_user_agent(USER_AGENT, Some(ACCEPT_LANGUAGE), None)
                .map_err(|e| Error::from(format!("Error setting user agent: {}", e)))?;

            // Resource blocking is a per-page decision, driven by the
            // request's render flags rather than any browser-wide setting.
            if req.render.block_resources {
                tab.call_method(Network::Enable {
                    max_total_buffer_size:    None,
                    max_resource_buffer_size: None,
                    max_post_data_size:       None,
                    report_direct_socket_traffic: None,
                    enable_durable_messages: None,
                }).map_err(|e| Error::from(format!("Error enabling network domain: {}", e)))?;
                tab.call_method(Network::SetBlockedURLs {
                    urls: BLOCKED_RESOURCE_PATTERNS
                        .iter()
                        .map(|p| (*p).to_owned())
                        .collect(),
                }).map_err(|e| Error::from(format!("Error blocking resource URLs: {}", e)))?;
            }

            tab.navigate_to(&req.url)
                .map_err(|e| Error::from(format!("Error navigating to {}: {}", req.url, e)))?;
            tab.wait_until_navigated()
                .map_err(|e| Error::from(format!("Error waiting for navigation: {}", e)))?;

            // Give client-side rendering a moment to settle before grabbing
            // the document. Pages flagged for network idle get a longer
            // window, since the devtools protocol gives us no direct
            // networkidle event to wait on.
            let settle = if req.render.wait_for_network_idle {
                NETWORK_IDLE_SETTLE_DELAY
            } else {
                SETTLE_DELAY
            };
            thread::sleep(settle);

            let html = tab.get_content()
                .map_err(|e| Error::from(format!("Error reading page content: {}", e)))?;
            let final_url = tab.get_url();

            // The devtools protocol doesn't surface the navigation status
            // here; a page we could read is recorded as a 200.
            Ok(BrowserPage {
                status: 200,
                html,
                final_url,
            })
        })();

        // The page is closed no matter how navigation went. The browser
        // itself lives on for the next request.
        let _ = tab.close(true);

        res
    }
}

#[derive(Clone, Debug)]
pub struct BrowserFetcherFactoryPassThrough {
    pub data: Arc<String>,
}

impl BrowserFetcherFactory for BrowserFetcherFactoryPassThrough {
    fn clone_box(&self) -> Box<BrowserFetcherFactory> {
        Box::new(Self {
            data: Arc::clone(&self.data),
        })
    }

    fn create(&self, _log: &Logger) -> Result<Box<BrowserFetcher>> {
        Ok(Box::new(BrowserFetcherPassThrough {
            data: Arc::clone(&self.data),
        }))
    }
}

pub struct BrowserFetcherPassThrough {
    pub data: Arc<String>,
}

impl BrowserFetcher for BrowserFetcherPassThrough {
    fn fetch(&mut self, _log: &Logger, req: &FetchRequest) -> Result<BrowserPage> {
        Ok(BrowserPage {
            status:    200,
            html:      (*self.data).clone(),
            final_url: req.url.clone(),
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct BrowserPoolStats {
    pub requests_sent:      u64,
    pub requests_completed: u64,
    pub requests_failed:    u64,
    pub total_elapsed_secs: f64,
}

pub struct BrowserPool {
    num_workers: u32,

    request_send: Mutex<Sender<Option<FetchRequest>>>,
    pending:      Arc<Mutex<HashMap<u64, Sender<FetchResult>>>>,
    next_id:      AtomicU64,
    shutdown:     Arc<AtomicBool>,
    stats:        Arc<Mutex<BrowserPoolStats>>,

    workers:   Mutex<Vec<thread::JoinHandle<()>>>,
    collector: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BrowserPool {
    /// Starts `num_workers` workers, each launching its own browser, plus
    /// the result collector.
    pub fn start(
        log: &Logger,
        factory: Box<BrowserFetcherFactory>,
        num_workers: u32,
    ) -> Result<BrowserPool> {
        info!(log, "Starting browser pool"; "num_workers" => num_workers);

        let (request_send, request_recv) = chan::sync(REQUEST_QUEUE_DEPTH);
        let (result_send, result_recv) = chan::sync(REQUEST_QUEUE_DEPTH);
        let shutdown = Arc::new(AtomicBool::new(false));
        let pending: Arc<Mutex<HashMap<u64, Sender<FetchResult>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let stats = Arc::new(Mutex::new(BrowserPoolStats::default()));

        let mut workers = vec![];
        for i in 0..num_workers {
            let thread_name = format!("browser_{:03}", i);
            let log = log.new(o!("thread" => thread_name.clone(), "num_workers" => num_workers));
            let factory_clone = factory.clone_box();
            let request_recv_clone = request_recv.clone();
            let result_send_clone = result_send.clone();
            let shutdown_clone = Arc::clone(&shutdown);

            workers.push(thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    work(
                        &log,
                        &*factory_clone,
                        &request_recv_clone,
                        &result_send_clone,
                        &shutdown_clone,
                    );
                })
                .map_err(Error::from)?);
        }

        // Drop our copy of the result sender so the collector's receive
        // returns `None` once the last worker has exited.
        drop(result_send);

        let collector = {
            let log = log.new(o!("thread" => "browser_collector"));
            let pending_clone = Arc::clone(&pending);
            let stats_clone = Arc::clone(&stats);
            let shutdown_clone = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("browser_collector".to_owned())
                .spawn(move || {
                    collect(&log, &result_recv, &pending_clone, &stats_clone, &shutdown_clone);
                })
                .map_err(Error::from)?
        };

        Ok(BrowserPool {
            num_workers,
            request_send: Mutex::new(request_send),
            pending,
            next_id: AtomicU64::new(1),
            shutdown,
            stats,
            workers: Mutex::new(workers),
            collector: Mutex::new(Some(collector)),
        })
    }

    /// Fetches one URL, blocking up to `timeout` plus the dispatcher grace.
    /// Never fails: fetch problems come back as a result with `ok == false`.
    pub fn fetch(
        &self,
        log: &Logger,
        url: &str,
        timeout: Duration,
        render: RenderOpts,
    ) -> FetchResult {
        let (id, done_recv) = self.submit(url, timeout, render);
        self.wait(log, id, &done_recv, url, timeout + DISPATCH_GRACE)
    }

    /// Fetches a batch, returning results in input order.
    pub fn fetch_batch(
        &self,
        log: &Logger,
        urls: &[String],
        timeout: Duration,
        render: RenderOpts,
    ) -> Vec<FetchResult> {
        let handles: Vec<(u64, Receiver<FetchResult>)> = urls
            .iter()
            .map(|url| self.submit(url, timeout, render))
            .collect();

        handles
            .into_iter()
            .zip(urls.iter())
            .map(|((id, done_recv), url)| {
                self.wait(log, id, &done_recv, url, timeout + DISPATCH_GRACE)
            })
            .collect()
    }

    /// Drains the pool: every worker receives a null sentinel, browsers are
    /// closed on the way out, and the collector is joined.
    pub fn shutdown(&self, log: &Logger) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        info!(log, "Shutting down browser pool");

        {
            let sender = lock(&self.request_send);
            for _ in 0..self.num_workers {
                sender.send(None);
            }
        }

        for handle in lock(&self.workers).drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = lock(&self.collector).take() {
            let _ = handle.join();
        }

        info!(log, "Browser pool shutdown complete");
    }

    pub fn stats(&self) -> BrowserPoolStats {
        lock(&self.stats).clone()
    }

    //
    // Private functions
    //

    fn submit(
        &self,
        url: &str,
        timeout: Duration,
        render: RenderOpts,
    ) -> (u64, Receiver<FetchResult>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done_send, done_recv) = chan::sync(1);

        lock(&self.pending).insert(id, done_send);
        lock(&self.request_send).send(Some(FetchRequest {
            id,
            url: url.to_owned(),
            timeout,
            render,
        }));
        lock(&self.stats).requests_sent += 1;

        (id, done_recv)
    }

    fn wait(
        &self,
        log: &Logger,
        id: u64,
        done_recv: &Receiver<FetchResult>,
        url: &str,
        grace: Duration,
    ) -> FetchResult {
        let deadline = chan::after(grace);
        let mut sel = ::chan::Select::new();
        (chan_select! {
            sel,
            done_recv.recv() -> msg => {
                match msg {
                    Some(result) => result,
                    None => synthetic_failure(id, url, "Result channel closed".to_owned()),
                }
            },
            deadline.recv() => {
                lock(&self.pending).remove(&id);
                warn!(log, "Fetch timed out at dispatcher"; "id" => id, "url" => url);
                synthetic_failure(id, url, format!("Request timeout after {:?}", grace))
            },
        })
    }
}

//
// Private constants
//

const ACCEPT_LANGUAGE: &str = "en-US";

// Wildcard patterns handed to the devtools network domain when a request
// asks for resource blocking.
static BLOCKED_RESOURCE_PATTERNS: &'static [&'static str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.svg", "*.webp", "*.ico",
    "*.woff", "*.woff2", "*.ttf", "*.otf", "*.mp4", "*.webm", "*.mp3",
];

// Extra time the dispatcher allows past a request's own timeout before
// giving up and synthesising a failure. Covers queueing and page setup.
const DISPATCH_GRACE: Duration = Duration::from_secs(10);

const IDLE_BROWSER_TIMEOUT_SECS: u64 = 600;

const REQUEST_QUEUE_DEPTH: usize = 100;

// Extended settle window for pages whose recommendation asks to wait for
// network idle.
const NETWORK_IDLE_SETTLE_DELAY: Duration = Duration::from_millis(3000);

// Fixed settle delay after DOM content load, matching the scraping profile
// the pool was tuned for.
const SETTLE_DELAY: Duration = Duration::from_millis(1000);

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0";

const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(1);
const COLLECTOR_POLL_INTERVAL: Duration = Duration::from_millis(500);

//
// Private functions
//

fn collect(
    log: &Logger,
    result_recv: &Receiver<FetchResult>,
    pending: &Arc<Mutex<HashMap<u64, Sender<FetchResult>>>>,
    stats: &Arc<Mutex<BrowserPoolStats>>,
    shutdown: &Arc<AtomicBool>,
) {
    loop {
        let tick = chan::after(COLLECTOR_POLL_INTERVAL);
        chan_select! {
            result_recv.recv() -> msg => {
                match msg {
                    Some(result) => {
                        {
                            let mut counters = lock(stats);
                            counters.requests_completed += 1;
                            if !result.ok {
                                counters.requests_failed += 1;
                            }
                            counters.total_elapsed_secs += duration_secs(result.elapsed);
                        }

                        match lock(pending).remove(&result.id) {
                            Some(handle) => handle.send(result),
                            // The dispatcher already gave up on this one.
                            None => debug!(log, "Result arrived for abandoned request";
                                "id" => result.id),
                        }
                    }
                    // All workers have exited and dropped their senders.
                    None => break,
                }
            },
            tick.recv() => {
                if shutdown.load(Ordering::Relaxed) && lock(pending).is_empty() {
                    break;
                }
            },
        }
    }
    debug!(log, "Result collector exiting");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn synthetic_failure(id: u64, url: &str, error: String) -> FetchResult {
    FetchResult {
        id,
        ok: false,
        status: 0,
        html: String::new(),
        final_url: url.to_owned(),
        error: Some(error),
        elapsed: Duration::from_secs(0),
    }
}

fn work(
    log: &Logger,
    factory: &BrowserFetcherFactory,
    request_recv: &Receiver<Option<FetchRequest>>,
    result_send: &Sender<FetchResult>,
    shutdown: &Arc<AtomicBool>,
) {
    let mut fetcher = match factory.create(log) {
        Ok(f) => f,
        Err(e) => {
            ::error_helpers::print_error(log, &e);
            return;
        }
    };
    info!(log, "Browser worker ready");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let tick = chan::after(WORKER_POLL_INTERVAL);
        chan_select! {
            request_recv.recv() -> msg => {
                let request = match msg {
                    Some(Some(request)) => request,
                    // A null sentinel or a closed channel both mean exit.
                    Some(None) | None => break,
                };

                let start = Instant::now();
                let page = fetcher.fetch(log, &request);
                let elapsed = start.elapsed();

                let result = match page {
                    Ok(page) => FetchResult {
                        id:        request.id,
                        ok:        true,
                        status:    page.status,
                        html:      page.html,
                        final_url: page.final_url,
                        error:     None,
                        elapsed,
                    },
                    Err(e) => FetchResult {
                        id:        request.id,
                        ok:        false,
                        status:    500,
                        html:      String::new(),
                        final_url: request.url.clone(),
                        error:     Some(error_strings(&e).join(": ")),
                        elapsed,
                    },
                };
                result_send.send(result);
            },
            tick.recv() => {},
        }
    }

    info!(log, "Browser worker shutting down");
}

//
// Tests
//

#[cfg(test)]
mod tests {
    use browser_pool::*;
    use test_helpers;

    #[test]
    fn test_fetch_pass_through() {
        let log = test_helpers::log();
        let pool = BrowserPool::start(&log, pass_through_factory("<html>hi</html>"), 1).unwrap();

        let result = pool.fetch(
            &log,
            "https://example.com/",
            Duration::from_secs(5),
            RenderOpts::default(),
        );
        assert_eq!(true, result.ok);
        assert_eq!(200, result.status);
        assert_eq!("<html>hi</html>", result.html);
        assert_eq!("https://example.com/", result.final_url);
        assert_eq!(None, result.error);

        pool.shutdown(&log);
    }

    #[test]
    fn test_fetch_batch_preserves_order() {
        let log = test_helpers::log();
        let pool = BrowserPool::start(&log, pass_through_factory("<html/>"), 2).unwrap();

        let urls: Vec<String> = (0..3)
            .map(|i| format!("https://example.com/page-{}", i))
            .collect();
        let results = pool.fetch_batch(&log, &urls, Duration::from_secs(5), RenderOpts::default());

        assert_eq!(3, results.len());
        for (i, result) in results.iter().enumerate() {
            assert_eq!(true, result.ok);
            assert_eq!(urls[i], result.final_url);
        }

        // Ids are monotonic and unique.
        let mut ids: Vec<u64> = results.iter().map(|r| r.id).collect();
        ids.dedup();
        assert_eq!(3, ids.len());

        let stats = pool.stats();
        assert_eq!(3, stats.requests_sent);
        assert_eq!(3, stats.requests_completed);
        assert_eq!(0, stats.requests_failed);

        pool.shutdown(&log);
    }

    #[test]
    fn test_fetch_failure_is_a_result() {
        let log = test_helpers::log();
        let pool = BrowserPool::start(&log, Box::new(FailingFetcherFactory), 1).unwrap();

        let result = pool.fetch(
            &log,
            "https://example.com/",
            Duration::from_secs(5),
            RenderOpts::default(),
        );
        assert_eq!(false, result.ok);
        assert_eq!(500, result.status);
        assert_eq!("https://example.com/", result.final_url);
        assert!(result.error.is_some());

        pool.shutdown(&log);
    }

    #[test]
    fn test_dispatcher_synthesises_timeout() {
        let log = test_helpers::log();
        let pool = BrowserPool::start(&log, pass_through_factory("<html/>"), 1).unwrap();

        // A receiver nothing will ever send on stands in for a worker that
        // crashed with the request in flight.
        let (_send, recv) = ::chan::sync::<FetchResult>(1);
        lock(&pool.pending).insert(999, _send.clone());
        let result = pool.wait(&log, 999, &recv, "https://example.com/", Duration::from_millis(50));

        assert_eq!(false, result.ok);
        assert!(result.error.unwrap().contains("timeout"));
        assert!(lock(&pool.pending).get(&999).is_none());

        pool.shutdown(&log);
    }

    #[test]
    fn test_shutdown_drains_workers() {
        let log = test_helpers::log();
        let pool = BrowserPool::start(&log, pass_through_factory("<html/>"), 2).unwrap();

        pool.shutdown(&log);
        assert_eq!(0, lock(&pool.workers).len());
        assert!(lock(&pool.collector).is_none());

        // A second shutdown is a no-op.
        pool.shutdown(&log);
    }

    #[test]
    fn test_render_flags_ride_the_request() {
        let log = test_helpers::log();
        let seen: Arc<Mutex<Vec<RenderOpts>>> = Arc::new(Mutex::new(Vec::new()));
        let pool = BrowserPool::start(
            &log,
            Box::new(RecordingFetcherFactory {
                seen: Arc::clone(&seen),
            }),
            1,
        ).unwrap();

        let render = RenderOpts {
            block_resources:       true,
            wait_for_network_idle: true,
        };
        let result = pool.fetch(&log, "https://example.com/", Duration::from_secs(5), render);
        assert_eq!(true, result.ok);

        let seen = lock(&seen);
        assert_eq!(1, seen.len());
        assert_eq!(true, seen[0].block_resources);
        assert_eq!(true, seen[0].wait_for_network_idle);

        drop(seen);
        pool.shutdown(&log);
    }

    //
    // Private types/functions
    //

    struct FailingFetcher;

    impl BrowserFetcher for FailingFetcher {
        fn fetch(&mut self, _log: &Logger, _req: &FetchRequest) -> Result<BrowserPage> {
            Err(Error::from("Navigation blew up"))
        }
    }

    #[derive(Clone)]
    struct FailingFetcherFactory;

    impl BrowserFetcherFactory for FailingFetcherFactory {
        fn clone_box(&self) -> Box<BrowserFetcherFactory> {
            Box::new(FailingFetcherFactory)
        }

        fn create(&self, _log: &Logger) -> Result<Box<BrowserFetcher>> {
            Ok(Box::new(FailingFetcher))
        }
    }

    struct RecordingFetcher {
        seen: Arc<Mutex<Vec<RenderOpts>>>,
    }

    impl BrowserFetcher for RecordingFetcher {
        fn fetch(&mut self, _log: &Logger, req: &FetchRequest) -> Result<BrowserPage> {
            lock(&self.seen).push(req.render);
            Ok(BrowserPage {
                status:    200,
                html:      String::new(),
                final_url: req.url.clone(),
            })
        }
    }

    #[derive(Clone)]
    struct RecordingFetcherFactory {
        seen: Arc<Mutex<Vec<RenderOpts>>>,
    }

    impl BrowserFetcherFactory for RecordingFetcherFactory {
        fn clone_box(&self) -> Box<BrowserFetcherFactory> {
            Box::new(self.clone())
        }

        fn create(&self, _log: &Logger) -> Result<Box<BrowserFetcher>> {
            Ok(Box::new(RecordingFetcher {
                seen: Arc::clone(&self.seen),
            }))
        }
    }

    fn pass_through_factory(html: &str) -> Box<BrowserFetcherFactory> {
        Box::new(BrowserFetcherFactoryPassThrough {
            data: Arc::new(html.to_owned()),
        })
    }
}
