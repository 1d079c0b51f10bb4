//! Reusable TCP/TLS connections with health tracking.
//!
//! Connections are kept in per-origin deques. Acquiring applies the origin's
//! token bucket, reuses an idle healthy connection when one exists, opens a
//! new one while under the per-host and global caps, and otherwise waits a
//! bounded time for a release. Unhealthy and over-age connections are
//! retired instead of being returned to the pool, and a background thread
//! trims idle connections down to one per origin.

use errors::*;
use optimizer::AdaptiveOptimizer;

use native_tls::{TlsConnector, TlsStream};
use slog::Logger;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use url::Url;

//
// Public types
//

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    Idle,
    Busy,
    Unhealthy,
    Closed,
}

#[derive(Clone, Debug)]
pub struct ConnectionMetrics {
    pub requests:   u64,
    pub errors:     u64,
    pub last_used:  Instant,
    pub created_at: Instant,
}

impl ConnectionMetrics {
    fn new() -> ConnectionMetrics {
        let now = Instant::now();
        ConnectionMetrics {
            requests:   0,
            errors:     0,
            last_used:  now,
            created_at: now,
        }
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.requests + self.errors;
        if total == 0 {
            return 0.0;
        }
        self.errors as f64 / total as f64
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }
}

pub enum PooledStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl Read for PooledStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            PooledStream::Plain(ref mut s) => s.read(buf),
            PooledStream::Tls(ref mut s) => s.read(buf),
        }
    }
}

impl Write for PooledStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            PooledStream::Plain(ref mut s) => s.write(buf),
            PooledStream::Tls(ref mut s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            PooledStream::Plain(ref mut s) => s.flush(),
            PooledStream::Tls(ref mut s) => s.flush(),
        }
    }
}

/// One pooled connection, exclusively owned by whichever caller acquired it
/// until it's released back.
pub struct PooledConnection {
    pub id:      u64,
    pub origin:  String,
    pub host:    String,
    pub port:    u16,
    pub tls:     bool,
    pub status:  ConnectionStatus,
    pub metrics: ConnectionMetrics,

    stream: PooledStream,
    closed: bool,
}

impl PooledConnection {
    pub fn is_healthy(&self) -> bool {
        if self.metrics.error_rate() > 0.3 {
            return false;
        }
        if self.metrics.age() > Duration::from_secs(300) {
            return false;
        }
        if self.closed {
            return false;
        }
        self.status != ConnectionStatus::Unhealthy
    }

    /// Marks the underlying stream as no longer usable, e.g. after the peer
    /// signalled `Connection: close` or an unexpected EOF.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Applies per-request read/write timeouts to the underlying socket.
    pub fn set_io_timeout(&self, timeout: Duration) -> Result<()> {
        let tcp = match self.stream {
            PooledStream::Plain(ref s) => s,
            PooledStream::Tls(ref s) => s.get_ref(),
        };
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.status = ConnectionStatus::Closed;
        self.closed = true;
        let res = match self.stream {
            PooledStream::Plain(ref s) => s.shutdown(::std::net::Shutdown::Both),
            PooledStream::Tls(ref mut s) => s.shutdown().map(|_| ()),
        };
        // A shutdown failure just means the peer beat us to it.
        let _ = res;
    }
}

impl Read for PooledConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for PooledConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub max_per_host:       usize,
    pub max_total:          usize,
    pub connection_timeout: Duration,
    pub idle_timeout:       Duration,
    pub max_age:            Duration,
}

impl Default for PoolOptions {
    fn default() -> PoolOptions {
        PoolOptions {
            max_per_host:       10,
            max_total:          100,
            connection_timeout: Duration::from_secs(30),
            idle_timeout:       Duration::from_secs(60),
            max_age:            Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PoolStats {
    pub connections_created: u64,
    pub connections_reused:  u64,
    pub connections_closed:  u64,
    pub connection_errors:   u64,
    pub requests_made:       u64,
    pub total_connections:   usize,
}

pub struct ConnectionPool {
    options:   PoolOptions,
    optimizer: Arc<AdaptiveOptimizer>,

    inner: Mutex<Inner>,
    stats: Mutex<PoolStats>,
    dns:   DnsCache,
    tls:   TlsConnector,

    next_id: AtomicU64,
    stop:    Arc<AtomicBool>,
    cleanup: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(
        _log: &Logger,
        options: PoolOptions,
        optimizer: Arc<AdaptiveOptimizer>,
    ) -> Result<ConnectionPool> {
        let tls = TlsConnector::new()?;
        Ok(ConnectionPool {
            options,
            optimizer,
            inner: Mutex::new(Inner {
                pools:  HashMap::new(),
                counts: HashMap::new(),
                total:  0,
            }),
            stats: Mutex::new(PoolStats::default()),
            dns: DnsCache::new(DNS_TTL),
            tls,
            next_id: AtomicU64::new(1),
            stop: Arc::new(AtomicBool::new(false)),
            cleanup: Mutex::new(None),
        })
    }

    /// Spawns the background thread that trims idle connections every 30
    /// seconds. Stopped with `stop_cleanup`.
    pub fn start_cleanup(pool: &Arc<ConnectionPool>, log: &Logger) -> Result<()> {
        let pool_clone = Arc::clone(pool);
        let stop = Arc::clone(&pool.stop);
        let log = log.new(o!("thread" => "conn_pool_cleanup"));

        let handle = thread::Builder::new()
            .name("conn_pool_cleanup".to_owned())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    // Sleep in short slices so shutdown isn't delayed by the
                    // full cleanup period.
                    for _ in 0..(CLEANUP_INTERVAL_SECS * 2) {
                        if stop.load(Ordering::Relaxed) {
                            return;
                        }
                        thread::sleep(Duration::from_millis(500));
                    }
                    pool_clone.cleanup_idle(&log);
                }
            })
            .map_err(Error::from)?;

        *lock(&pool.cleanup) = Some(handle);
        Ok(())
    }

    pub fn stop_cleanup(&self, log: &Logger) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = lock(&self.cleanup).take() {
            let _ = handle.join();
        }
        debug!(log, "Connection pool cleanup stopped");
    }

    /// Acquires a connection for a URL, applying the origin's token bucket
    /// first. Fails with a retriable error if the pool is saturated and
    /// nothing is released within the wait window.
    pub fn acquire(&self, log: &Logger, url: &str) -> Result<PooledConnection> {
        let (host, port, use_tls) = parse_origin(url)?;
        let origin = format!("{}:{}", host, port);

        self.optimizer.acquire(&origin, 1.0);

        {
            let mut inner = lock(&self.inner);

            // Reuse an idle connection, retiring any unhealthy ones we find
            // along the way.
            while let Some(mut conn) = inner.pop_idle(&origin) {
                if conn.is_healthy() {
                    conn.status = ConnectionStatus::Busy;
                    conn.metrics.last_used = Instant::now();
                    self.bump(|s| s.connections_reused += 1);
                    return Ok(conn);
                }
                self.retire(&mut inner, conn);
            }

            let host_count = inner.counts.get(&origin).cloned().unwrap_or(0);
            if host_count < self.options.max_per_host && inner.total < self.options.max_total {
                // Reserve the slot before opening so concurrent acquirers
                // can't overshoot the caps while we're connecting.
                *inner.counts.entry(origin.clone()).or_insert(0) += 1;
                inner.total += 1;
                drop(inner);

                match self.open_connection(log, &host, port, use_tls, &origin) {
                    Ok(mut conn) => {
                        conn.status = ConnectionStatus::Busy;
                        self.bump(|s| s.connections_created += 1);
                        return Ok(conn);
                    }
                    Err(e) => {
                        let mut inner = lock(&self.inner);
                        inner.decrement(&origin);
                        self.bump(|s| s.connection_errors += 1);
                        return Err(e);
                    }
                }
            }
        }

        // Saturated: poll for a release.
        for _ in 0..WAIT_POLLS {
            thread::sleep(WAIT_POLL_INTERVAL);
            let mut inner = lock(&self.inner);
            while let Some(mut conn) = inner.pop_idle(&origin) {
                if conn.is_healthy() {
                    conn.status = ConnectionStatus::Busy;
                    conn.metrics.last_used = Instant::now();
                    self.bump(|s| s.connections_reused += 1);
                    return Ok(conn);
                }
                self.retire(&mut inner, conn);
            }
        }

        Err(ErrorKind::ConnectionPoolExhausted(origin).into())
    }

    /// Returns a connection to the pool, or retires it if the request ended
    /// in error, the connection went unhealthy, or it has exceeded its
    /// maximum age.
    pub fn release(&self, _log: &Logger, mut conn: PooledConnection, error: bool) {
        if error {
            conn.metrics.errors += 1;
            self.bump(|s| s.connection_errors += 1);
        } else {
            conn.metrics.requests += 1;
            self.bump(|s| s.requests_made += 1);
        }

        let mut inner = lock(&self.inner);
        if !conn.is_healthy() || conn.metrics.age() > self.options.max_age {
            self.retire(&mut inner, conn);
            return;
        }

        conn.status = ConnectionStatus::Idle;
        let origin = conn.origin.clone();
        inner.pools.entry(origin).or_insert_with(VecDeque::new).push_back(conn);
    }

    /// Closes every pooled connection. Used at shutdown.
    pub fn close_all(&self, log: &Logger) {
        let mut inner = lock(&self.inner);
        let origins: Vec<String> = inner.pools.keys().cloned().collect();
        let mut closed = 0;
        for origin in origins {
            while let Some(conn) = inner.pop_idle(&origin) {
                self.retire(&mut inner, conn);
                closed += 1;
            }
        }
        info!(log, "Closed all pooled connections"; "num_closed" => closed);
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = lock(&self.stats).clone();
        stats.total_connections = lock(&self.inner).total;
        stats
    }

    //
    // Private functions
    //

    fn open_connection(
        &self,
        log: &Logger,
        host: &str,
        port: u16,
        use_tls: bool,
        origin: &str,
    ) -> Result<PooledConnection> {
        let addrs = self.dns.resolve(host, port)?;

        let mut last_err: Option<Error> = None;
        let mut tcp: Option<TcpStream> = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, self.options.connection_timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => last_err = Some(Error::from(e)),
            }
        }
        let tcp = match tcp {
            Some(t) => t,
            None => {
                return Err(last_err
                    .unwrap_or_else(|| Error::from(format!("No addresses for host: {}", host))))
            }
        };

        tcp.set_read_timeout(Some(self.options.connection_timeout))?;
        tcp.set_write_timeout(Some(self.options.connection_timeout))?;

        let stream = if use_tls {
            let tls_stream = self.tls
                .connect(host, tcp)
                .map_err(|e| Error::from(format!("TLS handshake failed for {}: {}", origin, e)))?;
            PooledStream::Tls(tls_stream)
        } else {
            PooledStream::Plain(tcp)
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(log, "Opened connection"; "origin" => origin, "id" => id, "tls" => use_tls);

        Ok(PooledConnection {
            id,
            origin: origin.to_owned(),
            host: host.to_owned(),
            port,
            tls: use_tls,
            status: ConnectionStatus::Idle,
            metrics: ConnectionMetrics::new(),
            stream,
            closed: false,
        })
    }

    fn retire(&self, inner: &mut Inner, mut conn: PooledConnection) {
        conn.shutdown();
        inner.decrement(&conn.origin);
        self.bump(|s| s.connections_closed += 1);
    }

    fn cleanup_idle(&self, log: &Logger) {
        let mut inner = lock(&self.inner);
        let origins: Vec<String> = inner.pools.keys().cloned().collect();
        let mut closed = 0;

        for origin in origins {
            loop {
                let should_close = {
                    let pool = match inner.pools.get(&origin) {
                        Some(p) => p,
                        None => break,
                    };
                    // Always keep one warm connection per origin.
                    pool.len() > 1
                        && pool.front()
                            .map(|c| c.metrics.idle_time() > self.options.idle_timeout)
                            .unwrap_or(false)
                };
                if !should_close {
                    break;
                }
                if let Some(conn) = inner.pop_idle(&origin) {
                    self.retire(&mut inner, conn);
                    closed += 1;
                }
            }
        }

        if closed > 0 {
            debug!(log, "Cleaned up idle connections"; "num_closed" => closed);
        }
    }

    fn bump<F>(&self, f: F)
    where
        F: FnOnce(&mut PoolStats),
    {
        f(&mut lock(&self.stats));
    }
}

//
// Private constants
//

const CLEANUP_INTERVAL_SECS: u64 = 30;
const DNS_TTL: Duration = Duration::from_secs(300);
const WAIT_POLLS: u32 = 10;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

//
// Private types
//

struct Inner {
    pools:  HashMap<String, VecDeque<PooledConnection>>,
    counts: HashMap<String, usize>,
    total:  usize,
}

impl Inner {
    fn pop_idle(&mut self, origin: &str) -> Option<PooledConnection> {
        self.pools.get_mut(origin).and_then(|p| p.pop_front())
    }

    fn decrement(&mut self, origin: &str) {
        if let Some(count) = self.counts.get_mut(origin) {
            *count = count.saturating_sub(1);
        }
        self.total = self.total.saturating_sub(1);
    }
}

struct DnsCache {
    ttl:   Duration,
    cache: Mutex<HashMap<String, (Vec<SocketAddr>, Instant)>>,
}

impl DnsCache {
    fn new(ttl: Duration) -> DnsCache {
        DnsCache {
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let key = format!("{}:{}", host, port);

        {
            let cache = lock(&self.cache);
            if let Some(&(ref addrs, resolved_at)) = cache.get(&key) {
                if resolved_at.elapsed() < self.ttl {
                    return Ok(addrs.clone());
                }
            }
        }

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .chain_err(|| format!("Error resolving host: {}", host))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::from(format!("Host resolved to no addresses: {}", host)));
        }

        lock(&self.cache).insert(key, (addrs.clone(), Instant::now()));
        Ok(addrs)
    }
}

//
// Private functions
//

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn parse_origin(raw_url: &str) -> Result<(String, u16, bool)> {
    let url = Url::parse(raw_url).chain_err(|| format!("Error parsing URL: {}", raw_url))?;
    let host = url.host_str()
        .ok_or_else(|| Error::from(format!("URL has no host: {}", raw_url)))?
        .to_owned();
    let use_tls = url.scheme() == "https";
    let port = url.port()
        .unwrap_or_else(|| if use_tls { 443 } else { 80 });
    Ok((host, port, use_tls))
}

//
// Tests
//

#[cfg(test)]
mod tests {
    use conn_pool::*;
    use optimizer::{AdaptiveOptimizer, OptimizerOptions};
    use test_helpers;

    use std::net::TcpListener;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_acquire_reuses_released_connections() {
        let log = test_helpers::log();
        let (_listener, url) = listener();
        let pool = test_pool(PoolOptions::default());

        let conn = pool.acquire(&log, &url).unwrap();
        assert_eq!(ConnectionStatus::Busy, conn.status);
        assert_eq!(1, pool.stats().connections_created);

        pool.release(&log, conn, false);
        let conn = pool.acquire(&log, &url).unwrap();
        assert_eq!(1, pool.stats().connections_created);
        assert_eq!(1, pool.stats().connections_reused);
        pool.release(&log, conn, false);
    }

    #[test]
    fn test_release_with_error_retires_unhealthy() {
        let log = test_helpers::log();
        let (_listener, url) = listener();
        let pool = test_pool(PoolOptions::default());

        // A connection whose only request errored has a 100% error rate and
        // fails the health predicate on release.
        let conn = pool.acquire(&log, &url).unwrap();
        pool.release(&log, conn, true);

        assert_eq!(1, pool.stats().connections_closed);
        assert_eq!(0, pool.stats().total_connections);
    }

    #[test]
    fn test_acquire_fails_when_saturated() {
        let log = test_helpers::log();
        let (_listener, url) = listener();

        let mut options = PoolOptions::default();
        options.max_per_host = 1;
        options.max_total = 1;
        let pool = test_pool(options);

        let held = pool.acquire(&log, &url).unwrap();
        let res = pool.acquire(&log, &url);
        assert!(res.is_err());

        pool.release(&log, held, false);
    }

    #[test]
    fn test_cleanup_leaves_one_idle_connection() {
        let log = test_helpers::log();
        let (_listener, url) = listener();

        let mut options = PoolOptions::default();
        options.idle_timeout = Duration::from_millis(0);
        let pool = test_pool(options);

        let a = pool.acquire(&log, &url).unwrap();
        let b = pool.acquire(&log, &url).unwrap();
        pool.release(&log, a, false);
        pool.release(&log, b, false);
        assert_eq!(2, pool.stats().total_connections);

        pool.cleanup_idle(&log);
        assert_eq!(1, pool.stats().total_connections);
    }

    #[test]
    fn test_close_all() {
        let log = test_helpers::log();
        let (_listener, url) = listener();
        let pool = test_pool(PoolOptions::default());

        let conn = pool.acquire(&log, &url).unwrap();
        pool.release(&log, conn, false);
        pool.close_all(&log);
        assert_eq!(0, pool.stats().total_connections);
    }

    #[test]
    fn test_parse_origin() {
        assert_eq!(
            ("example.com".to_owned(), 443, true),
            parse_origin("https://example.com/x").unwrap()
        );
        assert_eq!(
            ("example.com".to_owned(), 8080, false),
            parse_origin("http://example.com:8080/").unwrap()
        );
        assert!(parse_origin("not a url").is_err());
    }

    #[test]
    fn test_dns_cache_caches() {
        let dns = DnsCache::new(Duration::from_secs(300));
        let first = dns.resolve("127.0.0.1", 80).unwrap();
        let second = dns.resolve("127.0.0.1", 80).unwrap();
        assert_eq!(first, second);
        assert_eq!(1, lock(&dns.cache).len());
    }

    //
    // Private types/functions
    //

    fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, format!("http://127.0.0.1:{}/", port))
    }

    fn test_pool(options: PoolOptions) -> ConnectionPool {
        let log = test_helpers::log();
        let optimizer = Arc::new(AdaptiveOptimizer::new(&log, OptimizerOptions::default()));
        ConnectionPool::new(&log, options, optimizer).unwrap()
    }
}
