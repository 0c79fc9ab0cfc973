use std::time::Instant;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

use super::percentiles::LatencySummary;
use super::{Operation, Outcome, Sample};

// ─── Configuration ───────────────────────────────────────────────

/// HdrHistogram range: 1 μs → 60 s, 3 significant figures
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 60_000_000;
const HIST_SIGFIG: u8 = 3;

// ─── Public types ────────────────────────────────────────────────

/// Thread-safe per-worker request statistics.
/// The timing middleware calls `record()`, `GET /stats` calls `snapshot()`.
pub struct ServiceStats {
    started: Instant,
    inner: Mutex<[OperationState; Operation::ALL.len()]>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationStats {
    pub operation: Operation,
    pub latency_us: LatencySummary,
    pub ok: u64,
    pub not_found: u64,
    pub invalid_argument: u64,
    pub internal: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub pid: u32,
    pub uptime_secs: f64,
    pub total_requests: u64,
    pub requests_per_sec: f64,
    pub operations: Vec<OperationStats>,
}

// ─── Internal state ──────────────────────────────────────────────

struct OperationState {
    latency: Histogram<u64>,
    ok: u64,
    not_found: u64,
    invalid_argument: u64,
    internal: u64,
}

impl OperationState {
    fn new() -> Self {
        Self {
            latency: Histogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG)
                .expect("constant histogram bounds are valid"),
            ok: 0,
            not_found: 0,
            invalid_argument: 0,
            internal: 0,
        }
    }

    fn record(&mut self, sample: &Sample) {
        // Clamp into the tracked range instead of dropping outliers
        self.latency.saturating_record(sample.latency_us.clamp(HIST_LOW, HIST_HIGH));
        match sample.outcome {
            Outcome::Ok => self.ok += 1,
            Outcome::NotFound => self.not_found += 1,
            Outcome::InvalidArgument => self.invalid_argument += 1,
            Outcome::Internal => self.internal += 1,
        }
    }

    fn total(&self) -> u64 {
        self.ok + self.not_found + self.invalid_argument + self.internal
    }

    fn stats(&self, operation: Operation) -> OperationStats {
        OperationStats {
            operation,
            latency_us: LatencySummary::from_histogram(&self.latency),
            ok: self.ok,
            not_found: self.not_found,
            invalid_argument: self.invalid_argument,
            internal: self.internal,
        }
    }
}

// ─── ServiceStats impl ───────────────────────────────────────────

impl ServiceStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            inner: Mutex::new(std::array::from_fn(|_| OperationState::new())),
        }
    }

    pub fn record(&self, sample: Sample) {
        self.inner.lock()[sample.operation.index()].record(&sample);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let uptime_secs = self.started.elapsed().as_secs_f64();
        let inner = self.inner.lock();
        let total_requests: u64 = inner.iter().map(OperationState::total).sum();
        let requests_per_sec = if uptime_secs > 0.0 {
            total_requests as f64 / uptime_secs
        } else {
            0.0
        };

        StatsSnapshot {
            pid: std::process::id(),
            uptime_secs,
            total_requests,
            requests_per_sec,
            operations: Operation::ALL
                .iter()
                .map(|&op| inner[op.index()].stats(op))
                .collect(),
        }
    }
}

impl Default for ServiceStats {
    fn default() -> Self {
        Self::new()
    }
}
