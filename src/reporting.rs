//! Process-wide benchmark counters and per-thread latency consolidation.
//!
//! Completed/successful/unsuccessful/error/connection/byte counters are
//! atomics so any worker thread can bump them on its own fast path without a
//! lock. Per-request latency samples, by contrast, are collected into a plain
//! `Vec<u64>` (nanoseconds) owned by each [`crate::iothread::IOThread`] and
//! only merged once, in [`consolidate_latencies`], after every thread has
//! joined.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Snapshot returned by [`Reporting::report_results`].
#[derive(Debug, Clone, Default)]
pub struct BenchmarkResults {
    /// Every request that received any complete HTTP response.
    pub completed_requests: u64,
    /// Completed requests whose status was 1xx/2xx/3xx.
    pub successful_requests: u64,
    /// Completed requests whose status was 4xx/5xx.
    pub unsuccessful_requests: u64,
    /// Connect/read/write/TLS/protocol failures; never also `completed`.
    pub socket_errors: u64,
    /// Number of TCP (or TLS) connections opened over the run.
    pub connections_opened: u64,
    /// Total bytes written to the network.
    pub total_bytes_sent: u64,
    /// Total bytes read from the network.
    pub total_bytes_received: u64,
    /// Percentile array, index == percentile, values in milliseconds.
    pub latencies: [f64; 101],
    /// `successful_requests as f64 / elapsed.as_secs_f64()`.
    pub average_throughput: f64,
    /// Wall-clock duration of the run.
    pub elapsed_seconds: f64,
}

/// Snapshot returned by [`Reporting::report_interval`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BenchmarkIntervalResults {
    /// Successful requests completed since the previous interval snapshot.
    pub successful_requests: u64,
    /// `successful_requests as f64 / elapsed_since_previous_snapshot`.
    pub average_throughput: f64,
}

#[derive(Debug)]
struct IntervalState {
    previous_successful: u64,
    previous_time: Instant,
}

/// Process-wide reporting state. One instance is created per benchmark run
/// and shared (via `&` reference, since every field is internally
/// synchronized) across worker threads.
#[derive(Debug)]
pub struct Reporting {
    completed_requests: AtomicU64,
    successful_requests: AtomicU64,
    unsuccessful_requests: AtomicU64,
    socket_errors: AtomicU64,
    connections_opened: AtomicU64,
    total_bytes_sent: AtomicU64,
    total_bytes_received: AtomicU64,
    start_time: Mutex<Option<Instant>>,
    stop_time: Mutex<Option<Instant>>,
    interval: Mutex<IntervalState>,
    latencies: Mutex<[f64; 101]>,
}

impl Default for Reporting {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporting {
    /// Initializes fresh, zeroed reporting state.
    pub fn new() -> Self {
        Self {
            completed_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            unsuccessful_requests: AtomicU64::new(0),
            socket_errors: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            total_bytes_sent: AtomicU64::new(0),
            total_bytes_received: AtomicU64::new(0),
            start_time: Mutex::new(None),
            stop_time: Mutex::new(None),
            interval: Mutex::new(IntervalState {
                previous_successful: 0,
                previous_time: Instant::now(),
            }),
            latencies: Mutex::new([0.0; 101]),
        }
    }

    /// Records that a new connection's socket was opened.
    pub fn record_connection_open(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a transport-level failure. Does not increment `completed`.
    pub fn record_socket_error(&self) {
        self.socket_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Classifies and records one completed HTTP exchange by status code.
    pub fn record_result(&self, status_code: u16) {
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
        if (100..400).contains(&status_code) {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.unsuccessful_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records the wall-clock start of the benchmark run.
    pub fn record_start(&self, _threads_count: usize) {
        let now = Instant::now();
        *self.start_time.lock().unwrap() = Some(now);
        self.interval.lock().unwrap().previous_time = now;
    }

    /// Records the wall-clock end of the benchmark run.
    pub fn record_stop(&self) {
        *self.stop_time.lock().unwrap() = Some(Instant::now());
    }

    /// Snapshot of progress since the previous call (or since
    /// [`Reporting::record_start`], for the first call).
    pub fn report_interval(&self) -> BenchmarkIntervalResults {
        let successful = self.successful_requests.load(Ordering::Relaxed);
        let now = Instant::now();
        let mut interval = self.interval.lock().unwrap();

        let delta_successful = successful.saturating_sub(interval.previous_successful);
        let delta_wall = (now - interval.previous_time).as_secs_f64();
        let throughput = if delta_wall > 0.0 {
            delta_successful as f64 / delta_wall
        } else {
            0.0
        };

        interval.previous_successful = successful;
        interval.previous_time = now;

        BenchmarkIntervalResults {
            successful_requests: delta_successful,
            average_throughput: throughput,
        }
    }

    /// Final consolidated results for the whole run.
    pub fn report_results(&self) -> BenchmarkResults {
        let start = self.start_time.lock().unwrap();
        let stop = self.stop_time.lock().unwrap();
        let elapsed = match (*start, *stop) {
            (Some(s), Some(e)) => (e - s).as_secs_f64(),
            (Some(s), None) => s.elapsed().as_secs_f64(),
            _ => 0.0,
        };
        let successful = self.successful_requests.load(Ordering::Relaxed);
        let throughput = if elapsed > 0.0 {
            successful as f64 / elapsed
        } else {
            0.0
        };

        BenchmarkResults {
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            successful_requests: successful,
            unsuccessful_requests: self.unsuccessful_requests.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            total_bytes_sent: self.total_bytes_sent.load(Ordering::Relaxed),
            total_bytes_received: self.total_bytes_received.load(Ordering::Relaxed),
            latencies: *self.latencies.lock().unwrap(),
            average_throughput: throughput,
            elapsed_seconds: elapsed,
        }
    }

    /// Concatenates every thread's latency samples (nanoseconds) and byte
    /// counters, sorts the combined latencies ascending, converts to
    /// milliseconds, and fills the percentile array returned by
    /// [`Reporting::report_results`]. Percentile `p` is the element at index
    /// `floor(p * (n - 1) / 100)`.
    pub fn consolidate_latencies(&self, threads: &[ThreadTally]) {
        let mut all: Vec<u64> = threads
            .iter()
            .flat_map(|t| t.latencies_nanos.iter().copied())
            .collect();
        all.sort_unstable();

        let mut total_read = 0u64;
        let mut total_written = 0u64;
        for t in threads {
            total_read += t.read_bytes;
            total_written += t.write_bytes;
        }
        self.total_bytes_received
            .fetch_add(total_read, Ordering::Relaxed);
        self.total_bytes_sent
            .fetch_add(total_written, Ordering::Relaxed);

        let mut out = [0.0f64; 101];
        if !all.is_empty() {
            let n = all.len();
            for (p, slot) in out.iter_mut().enumerate() {
                let idx = (p * (n - 1)) / 100;
                *slot = all[idx] as f64 / 1_000_000.0;
            }
        }
        *self.latencies.lock().unwrap() = out;
    }

    /// Releases any state retained across a benchmark run, so `Reporting`
    /// can be reused for another run (or simply dropped).
    pub fn end_reporting(&self) {
        *self.start_time.lock().unwrap() = None;
        *self.stop_time.lock().unwrap() = None;
        *self.latencies.lock().unwrap() = [0.0; 101];
    }
}

/// Per-thread tally fed into [`Reporting::consolidate_latencies`] at the end
/// of a run: one thread's raw latency samples plus its byte counters.
#[derive(Debug, Default, Clone)]
pub struct ThreadTally {
    /// Per-request latencies in nanoseconds, in completion order.
    pub latencies_nanos: Vec<u64>,
    /// Bytes read by this thread's connections.
    pub read_bytes: u64,
    /// Bytes written by this thread's connections.
    pub write_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporting_zero() {
        let r = Reporting::new();
        r.record_start(1);
        r.record_stop();
        let res = r.report_results();
        assert_eq!(res.completed_requests, 0);
        assert_eq!(res.successful_requests, 0);
        assert_eq!(res.unsuccessful_requests, 0);
        assert_eq!(res.socket_errors, 0);
        assert_eq!(res.connections_opened, 0);
        assert_eq!(res.total_bytes_sent, 0);
        assert_eq!(res.total_bytes_received, 0);
    }

    #[test]
    fn reporting_count() {
        let r = Reporting::new();
        r.record_start(1);
        r.record_connection_open();
        r.record_result(200);
        r.record_result(201);
        r.record_result(204);
        r.record_result(403);
        r.record_result(401);
        r.record_result(500);
        r.record_socket_error();
        r.record_connection_open();
        r.record_stop();

        let res = r.report_results();
        assert_eq!(res.completed_requests, 6);
        assert_eq!(res.successful_requests, 3);
        assert_eq!(res.unsuccessful_requests, 3);
        assert_eq!(res.socket_errors, 1);
        assert_eq!(res.connections_opened, 2);
    }

    #[test]
    fn reporting_interval_tracks_deltas() {
        let r = Reporting::new();
        r.record_start(1);
        r.record_connection_open();
        r.record_result(200);
        r.record_result(201);
        r.record_result(400);

        let i1 = r.report_interval();
        assert_eq!(i1.successful_requests, 2);
        assert!(i1.average_throughput >= 0.0);

        r.record_result(204);
        r.record_result(403);
        r.record_result(401);
        r.record_result(500);
        r.record_result(200);

        let i2 = r.report_interval();
        assert_eq!(i2.successful_requests, 2);

        r.record_stop();
        let res = r.report_results();
        assert_eq!(res.completed_requests, 8);
        assert_eq!(res.successful_requests, 4);
        assert_eq!(res.unsuccessful_requests, 4);
        assert_eq!(res.socket_errors, 0);
        assert_eq!(res.connections_opened, 1);
    }

    #[test]
    fn consolidate_latencies_computes_percentiles_and_byte_totals() {
        let r = Reporting::new();
        let t0 = ThreadTally {
            latencies_nanos: vec![100_000_000, 110_000_000, 140_000_000, 100_000_000],
            read_bytes: 123,
            write_bytes: 456,
        };
        let t1 = ThreadTally {
            latencies_nanos: vec![50_000_000, 60_000_000, 70_000_000],
            read_bytes: 999,
            write_bytes: 1000,
        };
        r.consolidate_latencies(&[t0, t1]);

        let res = r.report_results();
        assert_eq!(res.latencies[0], 50.0);
        assert_eq!(res.latencies[100], 140.0);
        assert_eq!(res.total_bytes_received, 123 + 999);
        assert_eq!(res.total_bytes_sent, 456 + 1000);
    }

    #[test]
    fn consolidated_latencies_are_monotonic() {
        let r = Reporting::new();
        let t0 = ThreadTally {
            latencies_nanos: (1..=50).map(|n| n * 1_000_000).collect(),
            ..Default::default()
        };
        let t1 = ThreadTally {
            latencies_nanos: (1..=37).map(|n| n * 2_000_000).collect(),
            ..Default::default()
        };
        r.consolidate_latencies(&[t0, t1]);

        let res = r.report_results();
        for i in 1..=100 {
            assert!(res.latencies[i] >= res.latencies[i - 1]);
        }
    }
}
