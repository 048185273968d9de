//! I/O engine core for an HTTP/1.1 load generator.
//!
//! A benchmark run is a fixed number of [`iothread::IOThread`]s, each on its
//! own OS thread, each independently opening, reusing, and closing some
//! share of the total connection count against one or more target URLs
//! (`url::UrlPool`). A controller drives a run through three things: the
//! static [`iothread::IOThreadConfig`] every thread starts from, the
//! [`command::Command`] queue used to resize or stop a running thread, and
//! the shared [`reporting::Reporting`] counters used to read live or final
//! results. Nothing else crosses a thread boundary — each thread's
//! connections, timers, and RNG state are entirely its own.

mod command;
mod connection;
mod http;
mod io;
mod iothread;
mod line_buf;
mod oauth;
mod priority_queue;
mod rand;
mod reporting;
mod url;

pub use command::{Command, CommandQueue, CommandSender};
pub use iothread::{IOThread, IOThreadConfig, IOThreadHandle};
pub use oauth::OAuthSigner;
pub use reporting::{BenchmarkIntervalResults, BenchmarkResults, Reporting, ThreadTally};
pub use url::{Scheme, UrlInfo, UrlPool};
