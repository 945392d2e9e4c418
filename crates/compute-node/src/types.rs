use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::backend::BackendInfo;

/// Local, ephemeral record of a request being handled. Exists only for the
/// lifetime of the handler; its unconditional removal is what guarantees
/// at-most-one concurrent handler per request id.
#[derive(Debug, Clone)]
pub struct ProcessingEntry {
    pub request_id: u64,
    pub started_at: Instant,
    pub stage: ProcessingStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    Processing,
    PickedUp,
}

/// Process-wide counters, reset at startup. Monotonically incrementing;
/// readers only ever see snapshots.
#[derive(Debug)]
pub struct Stats {
    total_processed: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    started_at: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_processed: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_success(&self) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        self.successful.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total_processed = self.total_processed.load(Ordering::Relaxed);
        let successful = self.successful.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let success_rate =
            if total_processed == 0 { 0.0 } else { successful as f64 / total_processed as f64 };
        StatsSnapshot { total_processed, successful, failed, success_rate }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
}

/// Read-only snapshot exposed for external monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub uptime_secs: u64,
    pub stats: StatsSnapshot,
    pub currently_processing: Vec<u64>,
    pub backend: BackendInfo,
}
