//! Queue monitor — injected counters and periodic depth samples.
//! Lock-free increment-only counters; the bounded sample history is behind
//! a mutex and snapshots copy before returning, so readers never observe a
//! trim in progress.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Retention window for depth samples.
const HISTORY_SIZE: usize = 24;

/// Aggregated queue counters. Shared as `Arc<QueueMonitor>` — passed
/// explicitly to the poller and workers, never a global.
#[derive(Default)]
pub struct QueueMonitor {
    total_enqueued: AtomicU64,
    total_dequeued: AtomicU64,
    total_succeeded: AtomicU64,
    total_failed: AtomicU64,
    depth_history: Mutex<VecDeque<DepthSample>>,
}

/// One queue-depth observation.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DepthSample {
    pub at: DateTime<Utc>,
    pub depth: i64,
}

/// Point-in-time snapshot of the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub current_depth: i64,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub depth_history: Vec<DepthSample>,
    pub last_updated: DateTime<Utc>,
}

impl QueueMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueue(&self) {
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeue(&self) {
        self.total_dequeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.total_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a depth sample, trimming to the retention window.
    pub fn record_depth(&self, depth: i64) {
        let mut history = match self.depth_history.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.push_back(DepthSample { at: Utc::now(), depth });
        while history.len() > HISTORY_SIZE {
            history.pop_front();
        }
    }

    /// Copy-out snapshot of counters and history.
    pub fn snapshot(&self, current_depth: i64) -> QueueStats {
        let history = match self.depth_history.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        QueueStats {
            current_depth,
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_dequeued: self.total_dequeued.load(Ordering::Relaxed),
            total_succeeded: self.total_succeeded.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            depth_history: history.iter().copied().collect(),
            last_updated: Utc::now(),
        }
    }

    pub fn reset(&self) {
        self.total_enqueued.store(0, Ordering::Relaxed);
        self.total_dequeued.store(0, Ordering::Relaxed);
        self.total_succeeded.store(0, Ordering::Relaxed);
        self.total_failed.store(0, Ordering::Relaxed);
        if let Ok(mut history) = self.depth_history.lock() {
            history.clear();
        }
    }
}
