use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative counters for one limiter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterStats {
    /// Requests that were granted a token
    pub admitted: u64,
    /// Requests that had to wait in a priority queue
    pub queued: u64,
    /// Queued requests dropped by the weighted-timeout rule
    pub dropped: u64,
    /// Queued requests whose own deadline expired first
    pub timed_out: u64,
    /// Rate changes applied by the feedback controller
    pub rate_changes: u64,
    pub responses: u64,
    pub failures: u64,
}

/// Lock-free counters behind a `LimiterStats` snapshot
#[derive(Debug, Default)]
pub struct StatsCollector {
    admitted: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
    timed_out: AtomicU64,
    rate_changes: AtomicU64,
    responses: AtomicU64,
    failures: AtomicU64,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue counting from a previously persisted snapshot
    pub fn from_snapshot(stats: &LimiterStats) -> Self {
        Self {
            admitted: AtomicU64::new(stats.admitted),
            queued: AtomicU64::new(stats.queued),
            dropped: AtomicU64::new(stats.dropped),
            timed_out: AtomicU64::new(stats.timed_out),
            rate_changes: AtomicU64::new(stats.rate_changes),
            responses: AtomicU64::new(stats.responses),
            failures: AtomicU64::new(stats.failures),
        }
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_change(&self) {
        self.rate_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self, success: bool) {
        self.responses.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> LimiterStats {
        LimiterStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            rate_changes: self.rate_changes.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
