//! Target selection.
//!
//! Full URL parsing, and picking a target from a multi-URL command line, are
//! out of scope for the engine: callers hand the engine an already-parsed
//! [`UrlInfo`] (or a pool of them) and the engine only ever reads it through
//! a borrowed reference. [`UrlPool`] is the minimal, fully-working shared
//! pool a connection can hold a target from — not a URL parser.

use std::sync::Arc;

use crate::rand::RandState;

/// Transport used to reach a [`UrlInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain TCP.
    Plain,
    /// TLS over TCP.
    Tls,
}

/// A parsed, immutable target URL.
#[derive(Debug, Clone)]
pub struct UrlInfo {
    /// Connection scheme.
    pub scheme: Scheme,
    /// Hostname or IP literal used for both `connect` and the `Host` header.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Path plus optional query string, e.g. `/hello?x=1`.
    pub path: String,
}

impl UrlInfo {
    /// Creates a new immutable target.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            path: path.into(),
        }
    }

    /// `host` or `host:port` depending on whether `port` is the scheme's
    /// default, for use in a `Host:` header.
    pub fn host_header_value(&self) -> String {
        let default_port = match self.scheme {
            Scheme::Plain => 80,
            Scheme::Tls => 443,
        };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// A set of target URLs the engine picks from for each new connection cycle.
///
/// `pick()` is called once per reconnect; a pool of one URL (the common case)
/// always returns that URL.
#[derive(Debug, Clone)]
pub struct UrlPool {
    urls: Vec<Arc<UrlInfo>>,
}

impl UrlPool {
    /// Creates a pool over one or more URLs. Panics if `urls` is empty, since
    /// a connection with no target is a caller bug, not a runtime condition.
    pub fn new(urls: Vec<UrlInfo>) -> Self {
        assert!(!urls.is_empty(), "UrlPool requires at least one UrlInfo");
        Self {
            urls: urls.into_iter().map(Arc::new).collect(),
        }
    }

    /// Picks a target URL uniformly at random using the caller's per-thread
    /// RNG state, and hands back a cheap `Arc` clone: connections hold this
    /// rather than a borrow with a lifetime, since a connection's target
    /// must remain valid across reopen cycles. With one URL in the pool,
    /// always returns it.
    pub fn pick(&self, rand: &mut RandState) -> Arc<UrlInfo> {
        if self.urls.len() == 1 {
            self.urls[0].clone()
        } else {
            let idx = (rand.next_u32() as usize) % self.urls.len();
            self.urls[idx].clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_url_pool_always_returns_same_url() {
        let pool = UrlPool::new(vec![UrlInfo::new(Scheme::Plain, "localhost", 8080, "/hello")]);
        let mut rand = RandState::new(1);
        for _ in 0..5 {
            assert_eq!(pool.pick(&mut rand).host, "localhost");
        }
    }

    #[test]
    fn host_header_value_omits_default_port() {
        let plain = UrlInfo::new(Scheme::Plain, "example.com", 80, "/");
        assert_eq!(plain.host_header_value(), "example.com");

        let custom = UrlInfo::new(Scheme::Plain, "example.com", 8080, "/");
        assert_eq!(custom.host_header_value(), "example.com:8080");

        let tls = UrlInfo::new(Scheme::Tls, "example.com", 443, "/");
        assert_eq!(tls.host_header_value(), "example.com");
    }
}
