//! Direct HTTP/1.1 fetching over pooled connections.
//!
//! This is the "static" fetch path: a GET written straight onto a connection
//! acquired from the `conn_pool`, with gzip decoding and bounded redirect
//! following. Pages that need rendering go through the browser pool instead.

use conn_pool::{ConnectionPool, PooledConnection};
use errors::*;

use flate2::read::GzDecoder;
use slog::Logger;
use std::io::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

// Maximum number of redirects that we'll follow.
const REDIRECT_LIMIT: i64 = 5;

const USER_AGENT: &str = "zencore/0.1";

//
// HttpRequester trait + implementations
//

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status:    u16,
    pub body:      Vec<u8>,
    pub final_url: String,
}

pub trait HttpRequester: Send + Sync {
    fn get(&self, log: &Logger, raw_url: &str, timeout: Duration) -> Result<HttpResponse>;
}

pub struct HttpRequesterLive {
    pub pool: Arc<ConnectionPool>,
}

impl HttpRequesterLive {
    fn get_inner(
        &self,
        log: &Logger,
        raw_url: &str,
        timeout: Duration,
        redirect_depth: i64,
    ) -> Result<HttpResponse> {
        if redirect_depth >= REDIRECT_LIMIT {
            return Err(Error::from("Hit HTTP redirect limit and not continuing"));
        }

        let url = Url::parse(raw_url).chain_err(|| format!("Error parsing URL: {}", raw_url))?;

        info!(log, "Executing HTTP request"; "redirect_depth" => redirect_depth,
            "uri" => raw_url);

        let mut conn = self.pool.acquire(log, raw_url)?;
        let _ = conn.set_io_timeout(timeout);

        let raw = match request_on(&mut conn, &url) {
            Ok(raw) => {
                if raw.close {
                    conn.mark_closed();
                }
                self.pool.release(log, conn, false);
                raw
            }
            Err(e) => {
                conn.mark_closed();
                self.pool.release(log, conn, true);
                return Err(e).chain_err(|| format!("Error fetching URL: {}", raw_url));
            }
        };

        // Follow redirects. Only a permanent redirect propagates the
        // location we finally landed on, so callers persist the new URL for
        // next time; temporary redirects keep reporting the requested one.
        if raw.status >= 300 && raw.status < 400 {
            let location = match header(&raw.headers, "location") {
                Some(l) => l,
                None => {
                    return Err(Error::from(
                        "Received redirection without `Location` header",
                    ))
                }
            };
            let new_url = url.join(&location)
                .chain_err(|| format!("Error resolving redirect location: {}", location))?;
            let permanent = raw.status == 301 || raw.status == 308;

            let inner = self.get_inner(log, new_url.as_str(), timeout, redirect_depth + 1)?;
            let final_url = if permanent {
                inner.final_url
            } else {
                raw_url.to_owned()
            };

            return Ok(HttpResponse {
                status: inner.status,
                body: inner.body,
                final_url,
            });
        }

        let gzipped = header(&raw.headers, "content-encoding")
            .map(|e| e.to_lowercase().contains("gzip"))
            .unwrap_or(false);

        let mut body = raw.body;
        if gzipped {
            info!(log, "Decoding gzip-encoded body"; "body_length" => body.len());
            let mut body_decoded: Vec<u8> = Vec::new();
            {
                let mut decoder = GzDecoder::new(body.as_slice());
                decoder
                    .read_to_end(&mut body_decoded)
                    .chain_err(|| "Error decoding gzip body")?;
            }
            body = body_decoded;
        }

        Ok(HttpResponse {
            status:    raw.status,
            body,
            final_url: raw_url.to_owned(),
        })
    }
}

impl HttpRequester for HttpRequesterLive {
    fn get(&self, log: &Logger, raw_url: &str, timeout: Duration) -> Result<HttpResponse> {
        self.get_inner(log, raw_url, timeout, 0)
    }
}

#[derive(Clone, Debug)]
pub struct HttpRequesterPassThrough {
    pub data: Arc<Vec<u8>>,
}

impl HttpRequester for HttpRequesterPassThrough {
    fn get(&self, _log: &Logger, raw_url: &str, _timeout: Duration) -> Result<HttpResponse> {
        Ok(HttpResponse {
            status:    200,
            body:      (*self.data).clone(),
            final_url: raw_url.to_owned(),
        })
    }
}

//
// Private types
//

struct RawResponse {
    status:  u16,
    headers: Vec<(String, String)>,
    body:    Vec<u8>,
    close:   bool,
}

// Buffered reader over a pooled connection that's careful to consume exactly
// one response so the connection stays reusable.
struct ResponseReader<'a> {
    conn: &'a mut PooledConnection,
    buf:  Vec<u8>,
    pos:  usize,
}

impl<'a> ResponseReader<'a> {
    fn new(conn: &'a mut PooledConnection) -> ResponseReader<'a> {
        ResponseReader {
            conn,
            buf: Vec::new(),
            pos: 0,
        }
    }

    fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; 8192];
        let n = self.conn.read(&mut chunk).map_err(Error::from)?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(offset) = self.buf[self.pos..].iter().position(|b| *b == b'\n') {
                let end = self.pos + offset;
                let mut line = &self.buf[self.pos..end];
                if line.ends_with(b"\r") {
                    line = &line[..line.len() - 1];
                }
                let s = String::from_utf8_lossy(line).into_owned();
                self.pos = end + 1;
                return Ok(s);
            }
            if self.fill()? == 0 {
                return Err(Error::from("Unexpected EOF while reading response"));
            }
        }
    }

    fn read_exact_body(&mut self, len: usize) -> Result<Vec<u8>> {
        while self.buf.len() - self.pos < len {
            if self.fill()? == 0 {
                return Err(Error::from("Unexpected EOF while reading response body"));
            }
        }
        let body = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(body)
    }

    fn read_to_close(&mut self) -> Result<Vec<u8>> {
        while self.fill()? > 0 {}
        let body = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        Ok(body)
    }
}

//
// Private functions
//

fn header(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|&&(ref k, _)| k == name)
        .map(|&(_, ref v)| v.clone())
}

fn request_on(conn: &mut PooledConnection, url: &Url) -> Result<RawResponse> {
    let host = url.host_str()
        .ok_or_else(|| Error::from(format!("URL has no host: {}", url)))?;
    let default_port = if url.scheme() == "https" { 443 } else { 80 };
    let host_header = match url.port() {
        Some(port) if port != default_port => format!("{}:{}", host, port),
        _ => host.to_owned(),
    };

    let mut path = url.path().to_owned();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: {}\r\n\
         Accept: */*\r\n\
         Accept-Encoding: gzip\r\n\
         Connection: keep-alive\r\n\
         \r\n",
        path, host_header, USER_AGENT
    );
    conn.write_all(request.as_bytes()).map_err(Error::from)?;
    conn.flush().map_err(Error::from)?;

    let mut reader = ResponseReader::new(conn);

    let status_line = reader.read_line()?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("").to_owned();
    let status: u16 = parts.next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::from(format!("Malformed status line: {}", status_line)))?;

    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        let line = reader.read_line()?;
        if line.is_empty() {
            break;
        }
        if let Some(colon) = line.find(':') {
            let key = line[..colon].trim().to_lowercase();
            let value = line[colon + 1..].trim().to_owned();
            headers.push((key, value));
        }
    }

    let chunked = header(&headers, "transfer-encoding")
        .map(|e| e.to_lowercase().contains("chunked"))
        .unwrap_or(false);
    let content_length: Option<usize> =
        header(&headers, "content-length").and_then(|v| v.parse().ok());

    let mut read_until_close = false;
    let body = if status < 200 || status == 204 || status == 304 {
        Vec::new()
    } else if chunked {
        read_chunked_body(&mut reader)?
    } else if let Some(len) = content_length {
        reader.read_exact_body(len)?
    } else {
        read_until_close = true;
        reader.read_to_close()?
    };

    // HTTP/1.0 closes by default; 1.1 only on an explicit `Connection:
    // close`. A body delimited by EOF always consumes the connection.
    let connection = header(&headers, "connection").map(|v| v.to_lowercase());
    let close = read_until_close
        || connection.as_ref().map(|v| v.contains("close")).unwrap_or(false)
        || (version == "HTTP/1.0"
            && !connection.as_ref().map(|v| v.contains("keep-alive")).unwrap_or(false));

    Ok(RawResponse {
        status,
        headers,
        body,
        close,
    })
}

fn read_chunked_body(reader: &mut ResponseReader) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let size_line = reader.read_line()?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .chain_err(|| format!("Malformed chunk size: {}", size_line))?;

        if size == 0 {
            // Trailers, if any, run until the final empty line.
            loop {
                if reader.read_line()?.is_empty() {
                    break;
                }
            }
            return Ok(body);
        }

        body.extend_from_slice(&reader.read_exact_body(size)?);
        reader.read_line()?;
    }
}

//
// Tests
//

#[cfg(test)]
mod tests {
    use conn_pool::{ConnectionPool, PoolOptions};
    use http_requester::*;
    use optimizer::{AdaptiveOptimizer, OptimizerOptions};
    use test_helpers;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_get_with_content_length() {
        let log = test_helpers::log();
        let url = serve(vec![response_with_body("hello world")]);
        let requester = live_requester();

        let res = requester.get(&log, &url, Duration::from_secs(5)).unwrap();
        assert_eq!(200, res.status);
        assert_eq!(b"hello world".to_vec(), res.body);
        assert_eq!(url, res.final_url);
    }

    #[test]
    fn test_get_chunked() {
        let log = test_helpers::log();
        let response = "HTTP/1.1 200 OK\r\n\
                        Transfer-Encoding: chunked\r\n\
                        \r\n\
                        5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
            .as_bytes()
            .to_vec();
        let url = serve(vec![response]);
        let requester = live_requester();

        let res = requester.get(&log, &url, Duration::from_secs(5)).unwrap();
        assert_eq!(200, res.status);
        assert_eq!(b"hello world".to_vec(), res.body);
    }

    #[test]
    fn test_get_gzipped() {
        let log = test_helpers::log();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compressed body").unwrap();
        let gzipped = encoder.finish().unwrap();

        let mut response = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Encoding: gzip\r\n\
             Content-Length: {}\r\n\
             \r\n",
            gzipped.len()
        ).into_bytes();
        response.extend_from_slice(&gzipped);

        let url = serve(vec![response]);
        let requester = live_requester();

        let res = requester.get(&log, &url, Duration::from_secs(5)).unwrap();
        assert_eq!(b"compressed body".to_vec(), res.body);
    }

    #[test]
    fn test_get_follows_permanent_redirect() {
        let log = test_helpers::log();
        let target_url = serve(vec![response_with_body("over here")]);

        let redirect = format!(
            "HTTP/1.1 301 Moved Permanently\r\n\
             Location: {}\r\n\
             Content-Length: 0\r\n\
             \r\n",
            target_url
        ).into_bytes();
        let url = serve(vec![redirect]);
        let requester = live_requester();

        let res = requester.get(&log, &url, Duration::from_secs(5)).unwrap();
        assert_eq!(200, res.status);
        assert_eq!(b"over here".to_vec(), res.body);
        assert_eq!(target_url, res.final_url);
    }

    #[test]
    fn test_get_temporary_redirect_keeps_original_url() {
        let log = test_helpers::log();
        let target_url = serve(vec![response_with_body("elsewhere")]);

        let redirect = format!(
            "HTTP/1.1 302 Found\r\n\
             Location: {}\r\n\
             Content-Length: 0\r\n\
             \r\n",
            target_url
        ).into_bytes();
        let url = serve(vec![redirect]);
        let requester = live_requester();

        let res = requester.get(&log, &url, Duration::from_secs(5)).unwrap();
        assert_eq!(200, res.status);
        assert_eq!(url, res.final_url);
    }

    #[test]
    fn test_pass_through() {
        let log = test_helpers::log();
        let requester = HttpRequesterPassThrough {
            data: Arc::new(b"canned".to_vec()),
        };
        let res = requester
            .get(&log, "http://example.com/", Duration::from_secs(1))
            .unwrap();
        assert_eq!(200, res.status);
        assert_eq!(b"canned".to_vec(), res.body);
        assert_eq!("http://example.com/", res.final_url);
    }

    //
    // Private types/functions
    //

    fn response_with_body(body: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/html\r\n\
             Content-Length: {}\r\n\
             \r\n\
             {}",
            body.len(),
            body
        ).into_bytes()
    }

    // Starts a scripted server that answers each accepted connection with
    // the next canned response, then exits.
    fn serve(responses: Vec<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        thread::spawn(move || {
            for response in responses {
                let (mut stream, _) = match listener.accept() {
                    Ok(pair) => pair,
                    Err(_) => return,
                };

                // Read until the end of the request headers.
                let mut request = Vec::new();
                let mut byte = [0u8; 1];
                while !request.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut byte) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => request.push(byte[0]),
                    }
                }

                let _ = stream.write_all(&response);
                let _ = stream.flush();
            }
        });

        format!("http://127.0.0.1:{}/", port)
    }

    fn live_requester() -> HttpRequesterLive {
        let log = test_helpers::log();
        let optimizer = Arc::new(AdaptiveOptimizer::new(&log, OptimizerOptions::default()));
        let pool =
            Arc::new(ConnectionPool::new(&log, PoolOptions::default(), optimizer).unwrap());
        HttpRequesterLive { pool }
    }
}
