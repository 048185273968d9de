//! The per-worker event loop: one [`mio::Poll`] driving a [`slab::Slab`] of
//! [`ConnectionState`]s, plus the control-plane and timer plumbing around it.
//!
//! Each [`IOThread`] owns exactly one OS thread, one `Poll`, and every
//! connection it is responsible for; nothing here is shared with another
//! thread except through the lock-free [`Reporting`] counters and the
//! [`CommandQueue`]. Readiness events carry a connection's `Slab` index as
//! their `Token`.
//!
//! Timers (think-time delays and the forced-shutdown deadline) have no
//! native `mio` primitive, so they are modeled the way `apib_priorityq.c`
//! models them: a min-heap of deadlines drives the `Poll::poll` timeout, and
//! a `timer_generation` counter on each connection lets a superseded timer
//! (a connection that reopened before its think-time timer fired) be
//! recognized as stale and silently dropped rather than removed from the
//! heap, since the heap itself supports no arbitrary deletion.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};
use slab::Slab;

use crate::command::{Command, CommandQueue, CommandSender};
use crate::connection::{ConnAction, ConnCtx, ConnectionState};
use crate::oauth::OAuthSigner;
use crate::rand::RandState;
use crate::reporting::{Reporting, ThreadTally};
use crate::url::UrlPool;

const WAKE_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;
/// Upper bound on how long `poll()` blocks when no timer is armed and the
/// loop isn't stopping, so a dropped `Waker` wake-up can never wedge a
/// thread forever.
const IDLE_POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Static, per-run configuration every connection on a thread shares.
///
/// Built once by the controller and handed to every [`IOThread`] as an
/// `Arc`; nothing here changes after the run starts (resizing and stopping
/// go through [`Command`], not config mutation).
pub struct IOThreadConfig {
    /// HTTP method, e.g. `"GET"` or `"POST"`.
    pub verb: String,
    /// Request body, if any. Shared across every connection and request.
    pub body: Option<Arc<Vec<u8>>>,
    /// Additional request headers, sent verbatim in order.
    pub headers: Vec<(String, String)>,
    /// Delay between a response completing and the next request starting.
    /// Zero means immediate reuse.
    pub think_time: Duration,
    /// If a caller-supplied `Host` header is present, use it verbatim
    /// instead of deriving one from the target URL.
    pub host_header_override: bool,
    /// Send `Connection: close` and never reuse a connection.
    pub no_keep_alive: bool,
    /// Connections this thread opens immediately on start.
    pub initial_connections: usize,
    /// Gate extra per-connection debug logging.
    pub verbose: bool,
    /// Signs each request's `Authorization` header, if OAuth is configured.
    pub oauth: Option<Arc<dyn OAuthSigner>>,
    /// TLS client configuration, required if any target URL uses `https`.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// Target URL(s) connections pick from on every (re)connect.
    pub urls: UrlPool,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Think(usize),
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
struct TimerEvent {
    kind: TimerKind,
    generation: u64,
}

/// A handle to a running [`IOThread`]: the join handle plus the command
/// sender a controller uses to resize or stop it.
pub struct IOThreadHandle {
    join: std::thread::JoinHandle<ThreadTally>,
    sender: CommandSender,
}

impl IOThreadHandle {
    /// Resizes the thread's live connection pool to exactly `new_count`.
    pub fn set_connections(&self, new_count: usize) {
        let _ = self.sender.send(Command::SetConnections { new_count });
    }

    /// Flags every connection to stop reopening and arms a forced-teardown
    /// deadline `timeout_secs` from now.
    pub fn request_stop(&self, timeout_secs: u64) {
        let _ = self.sender.send(Command::Stop { timeout_secs });
    }

    /// Blocks until the thread's loop exits, returning its latency samples
    /// and byte counters for consolidation.
    pub fn join(self) -> ThreadTally {
        self.join.join().unwrap_or_default()
    }
}

/// One I/O worker thread's event loop state.
pub struct IOThread {
    poll: Poll,
    connections: Slab<ConnectionState>,
    command_queue: CommandQueue,
    timers: crate::priority_queue::PriorityQueue<TimerEvent>,
    epoch: Instant,
    rand: RandState,
    config: Arc<IOThreadConfig>,
    reporting: Arc<Reporting>,
    read_count: u64,
    write_count: u64,
    read_bytes: u64,
    write_bytes: u64,
    latencies: Vec<u64>,
    stopping: bool,
}

impl IOThread {
    fn new(config: Arc<IOThreadConfig>, reporting: Arc<Reporting>, seed: u64) -> std::io::Result<(Self, CommandSender)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (sender, command_queue) = CommandQueue::new(waker);
        let thread = Self {
            poll,
            connections: Slab::new(),
            command_queue,
            timers: crate::priority_queue::PriorityQueue::new(),
            epoch: Instant::now(),
            rand: RandState::new(seed),
            config,
            reporting,
            read_count: 0,
            write_count: 0,
            read_bytes: 0,
            write_bytes: 0,
            latencies: Vec::new(),
            stopping: false,
        };
        Ok((thread, sender))
    }

    /// Spawns a new OS thread running the event loop: `initial_connections`
    /// connections open immediately, then readiness/command/timer events
    /// drive the loop until a [`Command::Stop`] empties the connection
    /// table.
    pub fn spawn(
        id: usize,
        config: Arc<IOThreadConfig>,
        reporting: Arc<Reporting>,
        seed: u64,
    ) -> std::io::Result<IOThreadHandle> {
        let (mut thread, sender) = Self::new(config, reporting, seed)?;
        let join = std::thread::Builder::new()
            .name(format!("apib-io-{id}"))
            .spawn(move || {
                thread.open_initial_connections();
                thread.run()
            })?;
        Ok(IOThreadHandle { join, sender })
    }

    fn make_ctx<'a>(
        poll: &'a Poll,
        config: &'a IOThreadConfig,
        rand: &'a mut RandState,
        reporting: &'a Reporting,
        read_count: &'a mut u64,
        write_count: &'a mut u64,
        read_bytes: &'a mut u64,
        write_bytes: &'a mut u64,
        latencies: &'a mut Vec<u64>,
    ) -> ConnCtx<'a> {
        ConnCtx {
            registry: poll.registry(),
            config,
            pool: &config.urls,
            rand,
            reporting,
            read_count,
            write_count,
            read_bytes,
            write_bytes,
            latencies,
        }
    }

    fn open_initial_connections(&mut self) {
        let count = self.config.initial_connections;
        for _ in 0..count {
            self.open_one();
        }
    }

    fn open_one(&mut self) {
        let IOThread {
            poll,
            connections,
            rand,
            config,
            reporting,
            read_count,
            write_count,
            read_bytes,
            write_bytes,
            latencies,
            ..
        } = self;
        let placeholder = config.urls.pick(rand);
        let entry = connections.vacant_entry();
        let index = entry.key();
        let mut conn = ConnectionState::new(index, placeholder);
        let mut ctx = Self::make_ctx(
            poll, config, rand, reporting, read_count, write_count, read_bytes, write_bytes, latencies,
        );
        match conn.open(&mut ctx) {
            Ok(()) => {
                entry.insert(conn);
            }
            Err(e) => log::warn!("connect failed: {e}"),
        }
    }

    fn run(mut self) -> ThreadTally {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            for cmd in self.command_queue.drain() {
                self.apply_command(cmd);
            }

            if self.stopping && self.connections.is_empty() {
                break;
            }

            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                log::warn!("poll failed: {e}");
                break;
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                self.dispatch(event.token().0, event.is_readable(), event.is_writable());
            }

            self.fire_due_timers();

            if self.stopping && self.connections.is_empty() {
                break;
            }
        }

        ThreadTally {
            latencies_nanos: std::mem::take(&mut self.latencies),
            read_bytes: self.read_bytes,
            write_bytes: self.write_bytes,
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        match self.timers.peek_priority() {
            Some(deadline) => {
                let now = self.epoch.elapsed().as_nanos() as u64;
                Some(Duration::from_nanos(deadline.saturating_sub(now)))
            }
            None if self.stopping => Some(IDLE_POLL_TIMEOUT),
            None => None,
        }
    }

    fn dispatch(&mut self, index: usize, readable: bool, writable: bool) {
        let action = {
            let IOThread {
                poll,
                connections,
                rand,
                config,
                reporting,
                read_count,
                write_count,
                read_bytes,
                write_bytes,
                latencies,
                ..
            } = self;
            let Some(conn) = connections.get_mut(index) else {
                return;
            };
            let mut ctx = Self::make_ctx(
                poll, config, rand, reporting, read_count, write_count, read_bytes, write_bytes, latencies,
            );
            let mut action = ConnAction::None;
            if readable {
                action = conn.on_readable(&mut ctx);
            }
            if writable && matches!(action, ConnAction::None) {
                action = conn.on_writable(&mut ctx);
            }
            action
        };
        self.apply_action(index, action);
    }

    fn apply_action(&mut self, index: usize, action: ConnAction) {
        match action {
            ConnAction::None => {}
            ConnAction::ArmThinkTimer(duration) => {
                let Some(generation) = self.connections.get(index).map(ConnectionState::timer_generation) else {
                    return;
                };
                let now = self.epoch.elapsed().as_nanos() as u64;
                let deadline = now + duration.as_nanos() as u64;
                self.timers.push(
                    TimerEvent {
                        kind: TimerKind::Think(index),
                        generation,
                    },
                    deadline,
                );
            }
            ConnAction::Reopen => {
                let opened = {
                    let IOThread {
                        poll,
                        connections,
                        rand,
                        config,
                        reporting,
                        read_count,
                        write_count,
                        read_bytes,
                        write_bytes,
                        latencies,
                        ..
                    } = self;
                    let Some(conn) = connections.get_mut(index) else {
                        return;
                    };
                    let mut ctx = Self::make_ctx(
                        poll, config, rand, reporting, read_count, write_count, read_bytes, write_bytes, latencies,
                    );
                    conn.open(&mut ctx)
                };
                if let Err(e) = opened {
                    log::warn!("reopen failed: {e}");
                    self.connections.remove(index);
                }
            }
            ConnAction::Remove => {
                self.connections.remove(index);
            }
        }
    }

    fn fire_due_timers(&mut self) {
        loop {
            let now = self.epoch.elapsed().as_nanos() as u64;
            match self.timers.peek_priority() {
                Some(deadline) if deadline <= now => {}
                _ => break,
            }
            let Some(event) = self.timers.pop() else { break };

            match event.kind {
                TimerKind::Shutdown => self.force_close_remaining(),
                TimerKind::Think(index) => {
                    let current = self.connections.get(index).map(ConnectionState::timer_generation);
                    if current != Some(event.generation) {
                        continue;
                    }
                    let action = {
                        let IOThread {
                            poll,
                            connections,
                            rand,
                            config,
                            reporting,
                            read_count,
                            write_count,
                            read_bytes,
                            write_bytes,
                            latencies,
                            ..
                        } = self;
                        let Some(conn) = connections.get_mut(index) else {
                            continue;
                        };
                        let mut ctx = Self::make_ctx(
                            poll, config, rand, reporting, read_count, write_count, read_bytes, write_bytes,
                            latencies,
                        );
                        conn.on_think_timer(&mut ctx)
                    };
                    self.apply_action(index, action);
                }
            }
        }
    }

    fn apply_command(&mut self, cmd: Command) {
        match cmd {
            Command::Stop { timeout_secs } => {
                self.stopping = true;
                for (_, conn) in self.connections.iter_mut() {
                    conn.retire();
                }
                let now = self.epoch.elapsed().as_nanos() as u64;
                let deadline = now + Duration::from_secs(timeout_secs).as_nanos() as u64;
                self.timers.push(
                    TimerEvent {
                        kind: TimerKind::Shutdown,
                        generation: 0,
                    },
                    deadline,
                );
            }
            Command::SetConnections { new_count } => self.resize_to(new_count),
        }
    }

    /// Reconciles the live (not-yet-retired) connection count toward
    /// `new_count`. Counts only connections with `keep_running() == true` as
    /// live, since a retired connection stays in the slab (still finishing
    /// its current request or closing) until it actually removes itself —
    /// counting it as live would make a down-resize immediately followed by
    /// an up-resize undercount how many new connections are needed. Shrinking
    /// retires the most recently created live connections first, so the
    /// connections that remain are the ones a caller resizing down in small
    /// steps would expect to survive.
    fn resize_to(&mut self, new_count: usize) {
        let mut live: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.keep_running())
            .map(|(index, _)| index)
            .collect();
        let current = live.len();

        if new_count > current {
            for _ in current..new_count {
                self.open_one();
            }
        } else {
            live.sort_unstable_by(|a, b| b.cmp(a));
            let to_retire = current - new_count;
            for &index in live.iter().take(to_retire) {
                if let Some(conn) = self.connections.get_mut(index) {
                    conn.retire();
                }
            }
        }
    }

    fn force_close_remaining(&mut self) {
        let indices: Vec<usize> = self.connections.iter().map(|(i, _)| i).collect();
        let IOThread { poll, connections, .. } = self;
        for index in indices {
            if let Some(conn) = connections.get_mut(index) {
                conn.force_close(poll.registry());
            }
        }
        self.connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use crate::url::{Scheme, UrlInfo};

    fn spawn_single_reply_server() -> (UrlInfo, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                loop {
                    let n = match stream.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                        let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
                        return;
                    }
                }
            }
        });
        (UrlInfo::new(Scheme::Plain, "127.0.0.1", port, "/hello"), handle)
    }

    #[test]
    fn one_connection_completes_one_request_and_stops_cleanly() {
        let (url, server) = spawn_single_reply_server();
        let config = Arc::new(IOThreadConfig {
            verb: "GET".to_string(),
            body: None,
            headers: Vec::new(),
            think_time: Duration::ZERO,
            host_header_override: false,
            no_keep_alive: true,
            initial_connections: 1,
            verbose: false,
            oauth: None,
            tls_config: None,
            urls: UrlPool::new(vec![url]),
        });
        let reporting = Arc::new(Reporting::new());
        reporting.record_start(1);

        let handle = IOThread::spawn(0, config, reporting.clone(), 7).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        handle.request_stop(1);
        let tally = handle.join();
        reporting.record_stop();
        server.join().unwrap();

        assert_eq!(tally.latencies_nanos.len(), 1);
        reporting.consolidate_latencies(&[tally]);
        let results = reporting.report_results();
        assert_eq!(results.completed_requests, 1);
        assert_eq!(results.successful_requests, 1);
        assert_eq!(results.socket_errors, 0);
    }

    #[test]
    fn resize_to_zero_retires_without_removing_immediately() {
        let config = Arc::new(IOThreadConfig {
            verb: "GET".to_string(),
            body: None,
            headers: Vec::new(),
            think_time: Duration::ZERO,
            host_header_override: false,
            no_keep_alive: false,
            initial_connections: 0,
            verbose: false,
            oauth: None,
            tls_config: None,
            urls: UrlPool::new(vec![UrlInfo::new(Scheme::Plain, "127.0.0.1", 1, "/")]),
        });
        let reporting = Arc::new(Reporting::new());
        let (mut thread, _sender) = IOThread::new(config, reporting, 1).unwrap();
        for i in 0..3 {
            let url = thread.config.urls.pick(&mut thread.rand);
            thread.connections.insert(ConnectionState::new(i, url));
        }
        thread.resize_to(1);
        assert_eq!(thread.connections.len(), 3);
    }
}
