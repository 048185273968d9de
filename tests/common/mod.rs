//! A minimal loopback HTTP/1.1 test server: `GET /hello` returns a fixed
//! 200, `POST /echo` reflects the request body back verbatim, anything else
//! is a 404. Keeps per-route and per-connection counts so scenario tests can
//! check the engine's reported counters against the server's own view.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use apib_engine::{Scheme, UrlInfo};

pub struct ServerStats {
    pub connections_opened: AtomicU64,
    pub successful: AtomicU64,
    pub errors: AtomicU64,
}

pub struct TestServer {
    pub port: u16,
    pub stats: Arc<ServerStats>,
}

impl TestServer {
    pub fn target(&self, path: &str) -> UrlInfo {
        UrlInfo::new(Scheme::Plain, "127.0.0.1", self.port, path)
    }
}

/// Starts the server on an OS-assigned loopback port. The accept loop and
/// every per-connection handler run as detached background threads; they
/// exit on their own once the listener (held alive only by the returned
/// `TestServer`'s background thread) or the peer socket closes, and are not
/// explicitly joined — acceptable for a short-lived test process.
pub fn start_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let port = listener.local_addr().unwrap().port();
    let stats = Arc::new(ServerStats {
        connections_opened: AtomicU64::new(0),
        successful: AtomicU64::new(0),
        errors: AtomicU64::new(0),
    });

    let accept_stats = stats.clone();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            accept_stats.connections_opened.fetch_add(1, Ordering::Relaxed);
            let stats = accept_stats.clone();
            std::thread::spawn(move || handle_connection(stream, stats));
        }
    });

    TestServer { port, stats }
}

fn handle_connection(mut stream: TcpStream, stats: Arc<ServerStats>) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];

    loop {
        let headers_end = loop {
            if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                break pos;
            }
            match stream.read(&mut tmp) {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&tmp[..n]),
            }
        };

        let head = String::from_utf8_lossy(&buf[..headers_end]).into_owned();
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();

        let content_length: usize = lines
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse().ok())
                    .flatten()
            })
            .unwrap_or(0);

        let body_start = headers_end + 4;
        while buf.len() < body_start + content_length {
            match stream.read(&mut tmp) {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&tmp[..n]),
            }
        }
        let body = buf[body_start..body_start + content_length].to_vec();

        let response = if method == "GET" && path == "/hello" {
            stats.successful.fetch_add(1, Ordering::Relaxed);
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()
        } else if method == "POST" && path == "/echo" {
            stats.successful.fetch_add(1, Ordering::Relaxed);
            let mut r =
                format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
            r.extend_from_slice(&body);
            r
        } else {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec()
        };

        if stream.write_all(&response).is_err() {
            return;
        }

        buf.drain(..body_start + content_length);
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
