//! Per-connection lifecycle: connect, write the request, read the response,
//! keep-alive reuse or close, and the think-time delay between cycles.
//!
//! A [`ConnectionState`] is driven by its owning
//! [`crate::iothread::IOThread`] calling exactly one of
//! [`ConnectionState::on_readable`], [`ConnectionState::on_writable`], or
//! [`ConnectionState::on_think_timer`] per wake. A `Token` identifies a
//! connection to the loop's `Slab`, and `register`/`reregister`/`deregister`
//! take a borrowed `&Registry` rather than the connection owning one.
//! Everything here runs on the single thread that owns the connection, so no
//! transition needs synchronization.

use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use rustls::ClientConnection;

use crate::http::{HttpParseError, ResponseObserver, ResponseParser};
use crate::io::{self, IoStatus};
use crate::iothread::IOThreadConfig;
use crate::line_buf::StringBuf;
use crate::rand::RandState;
use crate::reporting::Reporting;
use crate::url::{Scheme, UrlInfo, UrlPool};

const READ_BUF_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Connecting,
    Handshaking,
    Writing,
    Reading,
    Thinking,
    Closing,
}

enum Transport {
    None,
    Plain(TcpStream),
    Tls { stream: TcpStream, tls: Box<ClientConnection> },
}

impl Transport {
    fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        match self {
            Transport::None => None,
            Transport::Plain(s) => Some(s),
            Transport::Tls { stream, .. } => Some(stream),
        }
    }

    fn take(&mut self) -> Transport {
        std::mem::replace(self, Transport::None)
    }
}

/// What the owning event loop should do after a state-machine entry point
/// returns.
pub(crate) enum ConnAction {
    /// Nothing further; the connection already (re)registered itself.
    None,
    /// The connection is back in `Closed` and ready for `open()` to be
    /// called again.
    Reopen,
    /// Arm a one-shot think-time timer `duration` from now, tagged with
    /// [`ConnectionState::timer_generation`] so a superseded timer can later
    /// be recognized as stale.
    ArmThinkTimer(Duration),
    /// The connection is retired or force-closed; deregister and drop it.
    Remove,
}

/// Bundles everything a connection needs from its owner to advance a step,
/// without the connection holding a back-pointer to the thread: ownership
/// stays one-directional, from thread to connection.
pub(crate) struct ConnCtx<'a> {
    pub registry: &'a Registry,
    pub config: &'a IOThreadConfig,
    pub pool: &'a UrlPool,
    pub rand: &'a mut RandState,
    pub reporting: &'a Reporting,
    pub read_count: &'a mut u64,
    pub write_count: &'a mut u64,
    pub read_bytes: &'a mut u64,
    pub write_bytes: &'a mut u64,
    pub latencies: &'a mut Vec<u64>,
}

struct StatusObserver {
    code: u16,
    complete: bool,
}

impl ResponseObserver for StatusObserver {
    fn on_status(&mut self, code: u16) {
        self.code = code;
    }
    fn on_message_complete(&mut self) {
        self.complete = true;
    }
}

/// One live (or retiring) HTTP connection.
pub(crate) struct ConnectionState {
    token: Token,
    keep_running: bool,
    state: State,
    transport: Transport,
    url: Arc<UrlInfo>,
    write_buf: StringBuf,
    write_cursor: usize,
    read_buf: [u8; READ_BUF_SIZE],
    parser: ResponseParser,
    status_code: u16,
    start_time: Instant,
    timer_generation: u64,
}

impl ConnectionState {
    /// Creates a connection in the `Closed` state; call [`ConnectionState::open`]
    /// to begin its first connect cycle. `url` is a placeholder replaced by
    /// the pool's own pick on the first `open()`.
    pub fn new(index: usize, url: Arc<UrlInfo>) -> Self {
        Self {
            token: Token(index),
            keep_running: true,
            state: State::Closed,
            transport: Transport::None,
            url,
            write_buf: StringBuf::new(512),
            write_cursor: 0,
            read_buf: [0; READ_BUF_SIZE],
            parser: ResponseParser::new(),
            status_code: 0,
            start_time: Instant::now(),
            timer_generation: 0,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn timer_generation(&self) -> u64 {
        self.timer_generation
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Whether this connection still counts toward the thread's live target
    /// (`false` once [`ConnectionState::retire`] has been called).
    pub fn keep_running(&self) -> bool {
        self.keep_running
    }

    /// Flags this connection to retire after its current request completes
    /// instead of reopening, the policy used for a down-resize or shutdown.
    pub fn retire(&mut self) {
        self.keep_running = false;
    }

    /// `CLOSED --scheduled--> CONNECTING`: opens a new non-blocking socket
    /// (and, for `https` targets, prepares the TLS session) and registers
    /// for writable readiness.
    pub fn open(&mut self, ctx: &mut ConnCtx<'_>) -> std::io::Result<()> {
        self.url = ctx.pool.pick(ctx.rand);
        let addr = resolve(&self.url)?;
        let mut stream = io::connect_plain(addr)?;
        ctx.registry
            .register(&mut stream, self.token, Interest::WRITABLE)?;

        self.transport = match self.url.scheme {
            Scheme::Plain => Transport::Plain(stream),
            Scheme::Tls => {
                let tls_config = ctx
                    .config
                    .tls_config
                    .clone()
                    .expect("https target requires IOThreadConfig::tls_config");
                let tls = new_client_session(tls_config, &self.url.host);
                Transport::Tls {
                    stream,
                    tls: Box::new(tls),
                }
            }
        };

        self.state = State::Connecting;
        self.parser.reset();
        self.start_time = Instant::now();
        ctx.reporting.record_connection_open();
        Ok(())
    }

    /// Entry point for a readable-readiness event.
    pub fn on_readable(&mut self, ctx: &mut ConnCtx<'_>) -> ConnAction {
        match self.state {
            State::Connecting => self.drive_connecting(ctx),
            State::Handshaking => self.drive_handshake(ctx, false, true),
            State::Writing => self.drive_write(ctx),
            State::Reading => self.drive_read(ctx),
            _ => ConnAction::None,
        }
    }

    /// Entry point for a writable-readiness event.
    pub fn on_writable(&mut self, ctx: &mut ConnCtx<'_>) -> ConnAction {
        match self.state {
            State::Connecting => self.drive_connecting(ctx),
            State::Handshaking => self.drive_handshake(ctx, true, false),
            State::Writing => self.drive_write(ctx),
            // TLS renegotiation mid-response may need a write.
            State::Reading => self.drive_read(ctx),
            _ => ConnAction::None,
        }
    }

    /// `THINKING --timer fires-->`: resumes the same logic `POSTREAD` uses
    /// once think-time has elapsed.
    pub fn on_think_timer(&mut self, ctx: &mut ConnCtx<'_>) -> ConnAction {
        if self.state != State::Thinking {
            return ConnAction::None;
        }
        self.after_response(ctx)
    }

    fn drive_connecting(&mut self, ctx: &mut ConnCtx<'_>) -> ConnAction {
        let stream = self.transport.stream_mut().expect("connecting without a socket");
        match stream.take_error() {
            Ok(None) => {}
            _ => return self.fail(ctx, "connect failed"),
        }

        match &self.transport {
            Transport::Plain(_) => {
                self.state = State::Writing;
                self.build_request(ctx.config);
                self.rearm(ctx, Interest::WRITABLE);
                self.drive_write(ctx)
            }
            Transport::Tls { .. } => {
                self.state = State::Handshaking;
                self.drive_handshake(ctx, true, true)
            }
            Transport::None => unreachable!(),
        }
    }

    fn drive_handshake(&mut self, ctx: &mut ConnCtx<'_>, writable: bool, readable: bool) -> ConnAction {
        let Transport::Tls { stream, tls } = &mut self.transport else {
            return ConnAction::None;
        };

        if writable && tls.wants_write() && io::flush_tls(tls, stream) == IoStatus::TransportError {
            return self.fail(ctx, "TLS handshake write failed");
        }
        if readable && tls.wants_read() {
            let mut scratch = [0u8; READ_BUF_SIZE];
            match io::read_tls(tls, stream, &mut scratch) {
                (IoStatus::TransportError, _) | (IoStatus::Eof, _) => {
                    return self.fail(ctx, "TLS handshake read failed")
                }
                _ => {}
            }
        }

        if tls.is_handshaking() {
            self.rearm_tls(ctx);
            ConnAction::None
        } else {
            self.state = State::Writing;
            self.build_request(ctx.config);
            self.rearm(ctx, Interest::WRITABLE);
            self.drive_write(ctx)
        }
    }

    fn drive_write(&mut self, ctx: &mut ConnCtx<'_>) -> ConnAction {
        loop {
            let remaining = &self.write_buf.get()[self.write_cursor..];
            if remaining.is_empty() {
                self.state = State::Reading;
                self.rearm(ctx, Interest::READABLE);
                return ConnAction::None;
            }

            let (status, n) = match &mut self.transport {
                Transport::Plain(stream) => io::write_plain(stream, remaining),
                Transport::Tls { stream, tls } => io::write_tls(tls, stream, remaining),
                Transport::None => return self.fail(ctx, "write with no transport"),
            };

            match status {
                IoStatus::Ok => {
                    self.write_cursor += n;
                    *ctx.write_count += 1;
                    *ctx.write_bytes += n as u64;
                }
                IoStatus::NeedWrite => {
                    self.rearm(ctx, Interest::WRITABLE);
                    return ConnAction::None;
                }
                IoStatus::NeedRead => {
                    // TLS renegotiation: writer must wait on a read.
                    self.rearm(ctx, Interest::READABLE);
                    return ConnAction::None;
                }
                IoStatus::Eof | IoStatus::TransportError => return self.fail(ctx, "write failed"),
            }
        }
    }

    fn drive_read(&mut self, ctx: &mut ConnCtx<'_>) -> ConnAction {
        loop {
            let (status, n) = match &mut self.transport {
                Transport::Plain(stream) => io::read_plain(stream, &mut self.read_buf),
                Transport::Tls { stream, tls } => io::read_tls(tls, stream, &mut self.read_buf),
                Transport::None => return self.fail(ctx, "read with no transport"),
            };

            match status {
                IoStatus::Ok => {
                    *ctx.read_count += 1;
                    *ctx.read_bytes += n as u64;
                    let mut obs = StatusObserver {
                        code: self.status_code,
                        complete: false,
                    };
                    let parsed = self.parser.feed(&self.read_buf[..n], &mut obs);
                    self.status_code = obs.code;
                    if let Err(
                        HttpParseError::StatusLine
                        | HttpParseError::HeaderLine
                        | HttpParseError::ContentLength
                        | HttpParseError::ChunkFraming,
                    ) = parsed
                    {
                        return self.fail(ctx, "HTTP response parse error");
                    }
                    if obs.complete {
                        let latency = self.start_time.elapsed().as_nanos() as u64;
                        ctx.latencies.push(latency);
                        ctx.reporting.record_result(self.status_code);
                        return self.after_response(ctx);
                    }
                }
                IoStatus::NeedRead => {
                    self.rearm(ctx, Interest::READABLE);
                    return ConnAction::None;
                }
                IoStatus::NeedWrite => {
                    self.rearm(ctx, Interest::WRITABLE);
                    return ConnAction::None;
                }
                IoStatus::Eof => return self.fail(ctx, "peer closed mid-response"),
                IoStatus::TransportError => return self.fail(ctx, "read failed"),
            }
        }
    }

    /// `POSTREAD`: decide between think-time, an immediate keep-alive reuse,
    /// or closing.
    fn after_response(&mut self, ctx: &mut ConnCtx<'_>) -> ConnAction {
        if self.state != State::Thinking {
            let think = ctx.config.think_time;
            if !think.is_zero() {
                self.state = State::Thinking;
                self.timer_generation += 1;
                self.deregister(ctx.registry);
                return ConnAction::ArmThinkTimer(think);
            }
        }

        if self.keep_running && !ctx.config.no_keep_alive {
            self.state = State::Writing;
            self.parser.reset();
            self.status_code = 0;
            self.start_time = Instant::now();
            self.build_request(ctx.config);
            self.rearm(ctx, Interest::WRITABLE);
            ConnAction::None
        } else {
            self.close(ctx, false)
        }
    }

    fn fail(&mut self, ctx: &mut ConnCtx<'_>, reason: &str) -> ConnAction {
        log::debug!("connection {:?} transport error: {}", self.token, reason);
        ctx.reporting.record_socket_error();
        self.close(ctx, true)
    }

    /// `CLOSING`: tear the transport down and either reopen (if keep-alive
    /// policy and the retirement flag allow it) or signal removal.
    fn close(&mut self, ctx: &mut ConnCtx<'_>, after_error: bool) -> ConnAction {
        self.state = State::Closing;
        self.deregister(ctx.registry);

        match self.transport.take() {
            Transport::Plain(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Transport::Tls { mut stream, mut tls } => {
                tls.send_close_notify();
                let _ = io::flush_tls(&mut tls, &mut stream);
            }
            Transport::None => {}
        }

        self.state = State::Closed;

        if self.keep_running && !(after_error && ctx.config.no_keep_alive) {
            ConnAction::Reopen
        } else {
            ConnAction::Remove
        }
    }

    fn build_request(&mut self, config: &IOThreadConfig) {
        self.write_buf.clear();
        self.write_cursor = 0;

        self.write_buf
            .append_fmt(format_args!("{} {} HTTP/1.1\r\n", config.verb, self.url.path));

        let caller_supplied_host = config
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("host"));
        if !(config.host_header_override && caller_supplied_host) {
            self.write_buf
                .append_fmt(format_args!("Host: {}\r\n", self.url.host_header_value()));
        }

        self.write_buf.append("User-Agent: apib-engine\r\n");

        if let Some(body) = &config.body {
            self.write_buf
                .append_fmt(format_args!("Content-Length: {}\r\n", body.len()));
        }

        for (name, value) in &config.headers {
            self.write_buf.append_fmt(format_args!("{name}: {value}\r\n"));
        }

        if let Some(oauth) = &config.oauth {
            let body = config.body.as_deref().map(Vec::as_slice).unwrap_or(&[]);
            let signature = oauth.sign(&config.verb, &self.url.path, body);
            self.write_buf
                .append_fmt(format_args!("Authorization: {signature}\r\n"));
        }

        if config.no_keep_alive {
            self.write_buf.append("Connection: close\r\n");
        }

        self.write_buf.append("\r\n");
        if let Some(body) = &config.body {
            self.write_buf.append_bytes(body);
        }
    }

    fn rearm(&mut self, ctx: &mut ConnCtx<'_>, interest: Interest) {
        if let Some(stream) = self.transport.stream_mut() {
            let _ = ctx.registry.reregister(stream, self.token, interest);
        }
    }

    fn rearm_tls(&mut self, ctx: &mut ConnCtx<'_>) {
        let Transport::Tls { stream, tls } = &mut self.transport else {
            return;
        };
        let interest = match (tls.wants_read(), tls.wants_write()) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            _ => Interest::READABLE,
        };
        let _ = ctx.registry.reregister(stream, self.token, interest);
    }

    fn deregister(&mut self, registry: &Registry) {
        if let Some(stream) = self.transport.stream_mut() {
            let _ = registry.deregister(stream);
        }
    }

    /// Immediate, ungraceful teardown used when the shutdown grace period's
    /// forced-close deadline elapses with this connection still open.
    pub fn force_close(&mut self, registry: &Registry) {
        self.deregister(registry);
        match self.transport.take() {
            Transport::Plain(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Transport::Tls { stream, .. } => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Transport::None => {}
        }
        self.state = State::Closed;
    }
}

fn resolve(url: &UrlInfo) -> std::io::Result<SocketAddr> {
    (url.host.as_str(), url.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address for host"))
}

fn new_client_session(config: Arc<rustls::ClientConfig>, host: &str) -> ClientConnection {
    let name =
        rustls::pki_types::ServerName::try_from(host.to_string()).expect("invalid TLS server name");
    ClientConnection::new(config, name).expect("invalid TLS client configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::tests_support::FixedOAuthSigner;

    fn plain_config(verb: &str, body: Option<Vec<u8>>, no_keep_alive: bool) -> IOThreadConfig {
        IOThreadConfig {
            verb: verb.to_string(),
            body: body.map(Arc::new),
            tls_config: None,
            oauth: None,
            headers: vec![("X-Test".to_string(), "1".to_string())],
            think_time: Duration::ZERO,
            host_header_override: false,
            no_keep_alive,
            initial_connections: 1,
            verbose: false,
            urls: UrlPool::new(vec![UrlInfo::new(Scheme::Plain, "localhost", 8080, "/echo")]),
        }
    }

    #[test]
    fn new_connection_starts_closed() {
        let url = Arc::new(UrlInfo::new(Scheme::Plain, "localhost", 8080, "/hello"));
        let conn = ConnectionState::new(0, url);
        assert!(conn.is_closed());
        assert!(conn.keep_running);
    }

    #[test]
    fn retire_clears_keep_running() {
        let url = Arc::new(UrlInfo::new(Scheme::Plain, "localhost", 8080, "/hello"));
        let mut conn = ConnectionState::new(0, url);
        conn.retire();
        assert!(!conn.keep_running);
    }

    #[test]
    fn build_request_includes_host_verb_and_body_length() {
        let url = Arc::new(UrlInfo::new(Scheme::Plain, "localhost", 8080, "/echo"));
        let mut conn = ConnectionState::new(0, url);
        let cfg = plain_config("POST", Some(b"abcdefghij".repeat(3)), true);
        conn.build_request(&cfg);
        let text = String::from_utf8(conn.write_buf.get().to_vec()).unwrap();
        assert!(text.starts_with("POST /echo HTTP/1.1\r\n"));
        assert!(text.contains("Host: localhost:8080\r\n"));
        assert!(text.contains("Content-Length: 30\r\n"));
        assert!(text.contains("X-Test: 1\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("abcdefghijabcdefghijabcdefghij"));
    }

    #[test]
    fn build_request_signs_with_oauth_when_configured() {
        let url = Arc::new(UrlInfo::new(Scheme::Plain, "localhost", 8080, "/hello"));
        let mut conn = ConnectionState::new(0, url);
        let mut cfg = plain_config("GET", None, false);
        cfg.oauth = Some(Arc::new(FixedOAuthSigner("OAuth signature=abc")));
        conn.build_request(&cfg);
        let text = String::from_utf8(conn.write_buf.get().to_vec()).unwrap();
        assert!(text.contains("Authorization: OAuth signature=abc\r\n"));
    }
}
