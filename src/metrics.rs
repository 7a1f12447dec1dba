//! Server-wide performance metrics.
//!
//! Lightweight, thread-safe collection: atomic counters per operation
//! kind, a bounded rolling window of request latencies for percentile
//! estimates, and a short ring of recent slow requests. One instance per
//! server, shared behind `Arc` with every session handler.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Rolling window of recent request latencies retained for percentiles.
const LATENCY_WINDOW_SIZE: usize = 1000;

/// How many recent slow requests are kept for reporting.
const MAX_SLOW_REQUESTS: usize = 10;

/// Requests slower than this are logged and ring-buffered.
pub const SLOW_REQUEST_THRESHOLD_MS: u64 = 100;

/// Request kinds tracked individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    GetPartition,
    Sample,
    GetFeatures,
    Other,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::GetPartition => "GetPartition",
            Operation::Sample => "Sample",
            Operation::GetFeatures => "GetFeatures",
            Operation::Other => "Other",
        }
    }
}

/// A request that exceeded the slow threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct SlowRequest {
    pub operation: &'static str,
    pub duration_ms: u64,
    /// Offset from server start, in milliseconds.
    pub timestamp_ms: u64,
}

pub struct Metrics {
    request_count: AtomicU64,
    error_count: AtomicU64,
    slow_count: AtomicU64,
    rejected_busy: AtomicU64,
    timed_out: AtomicU64,

    op_get_partition: AtomicU64,
    op_sample: AtomicU64,
    op_get_features: AtomicU64,
    op_other: AtomicU64,

    /// Nodes returned across all Sample responses.
    sampled_nodes: AtomicU64,

    latencies_ms: Mutex<VecDeque<u64>>,
    slow_requests: Mutex<VecDeque<SlowRequest>>,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            slow_count: AtomicU64::new(0),
            rejected_busy: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            op_get_partition: AtomicU64::new(0),
            op_sample: AtomicU64::new(0),
            op_get_features: AtomicU64::new(0),
            op_other: AtomicU64::new(0),
            sampled_nodes: AtomicU64::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            slow_requests: Mutex::new(VecDeque::with_capacity(MAX_SLOW_REQUESTS)),
            started_at: Instant::now(),
        }
    }

    /// Record a completed request.
    pub fn record_request(&self, op: Operation, duration_ms: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        match op {
            Operation::GetPartition => &self.op_get_partition,
            Operation::Sample => &self.op_sample,
            Operation::GetFeatures => &self.op_get_features,
            Operation::Other => &self.op_other,
        }
        .fetch_add(1, Ordering::Relaxed);

        {
            let mut window = self.latencies_ms.lock().unwrap();
            if window.len() == LATENCY_WINDOW_SIZE {
                window.pop_front();
            }
            window.push_back(duration_ms);
        }

        if duration_ms >= SLOW_REQUEST_THRESHOLD_MS {
            self.slow_count.fetch_add(1, Ordering::Relaxed);
            let mut slow = self.slow_requests.lock().unwrap();
            if slow.len() == MAX_SLOW_REQUESTS {
                slow.pop_front();
            }
            slow.push_back(SlowRequest {
                operation: op.name(),
                duration_ms,
                timestamp_ms: self.started_at.elapsed().as_millis() as u64,
            });
        }
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_busy_rejection(&self) {
        self.rejected_busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sampled_nodes(&self, count: usize) {
        self.sampled_nodes.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p95, p99) = {
            let window = self.latencies_ms.lock().unwrap();
            percentiles(&window)
        };
        let top_slow = self.slow_requests.lock().unwrap().iter().cloned().collect();

        MetricsSnapshot {
            request_count: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            slow_count: self.slow_count.load(Ordering::Relaxed),
            rejected_busy: self.rejected_busy.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            get_partition_count: self.op_get_partition.load(Ordering::Relaxed),
            sample_count: self.op_sample.load(Ordering::Relaxed),
            get_features_count: self.op_get_features.load(Ordering::Relaxed),
            sampled_nodes: self.sampled_nodes.load(Ordering::Relaxed),
            latency_p50_ms: p50,
            latency_p95_ms: p95,
            latency_p99_ms: p99,
            top_slow,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all counters, serialized into GetStats.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub error_count: u64,
    pub slow_count: u64,
    pub rejected_busy: u64,
    pub timed_out: u64,
    pub get_partition_count: u64,
    pub sample_count: u64,
    pub get_features_count: u64,
    pub sampled_nodes: u64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    pub top_slow: Vec<SlowRequest>,
    pub uptime_secs: u64,
}

fn percentiles(window: &VecDeque<u64>) -> (u64, u64, u64) {
    if window.is_empty() {
        return (0, 0, 0);
    }
    let mut sorted: Vec<u64> = window.iter().copied().collect();
    sorted.sort_unstable();
    let pick = |p: f64| {
        let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        sorted[idx.min(sorted.len() - 1)]
    };
    (pick(0.50), pick(0.95), pick(0.99))
}
