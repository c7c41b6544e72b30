//! Process-wide gauges snapshot-able by the control surface.
//!
//! Three atomics written by the session manager and the spawn queue, read by
//! `control::Stats`. Snapshots are eventually consistent; no coherence across
//! counters is promised.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// By-value snapshot of the gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tracked_sessions: u64,
    pub pending_sessions: u64,
    pub queue_depth: u64,
}

/// The gauge set.
#[derive(Debug, Default)]
pub struct Metrics {
    tracked_sessions: AtomicU64,
    pending_sessions: AtomicU64,
    queue_depth: AtomicU64,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tracked_sessions(&self, v: u64) {
        self.tracked_sessions.store(v, Ordering::Relaxed);
    }

    pub fn set_pending_sessions(&self, v: u64) {
        self.pending_sessions.store(v, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, v: u64) {
        self.queue_depth.store(v, Ordering::Relaxed);
    }

    /// Read all gauges. Each load is independent; readers must not assume
    /// cross-field coherence.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tracked_sessions: self.tracked_sessions.load(Ordering::Relaxed),
            pending_sessions: self.pending_sessions.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_last_store() {
        let metrics = Metrics::new();
        metrics.set_tracked_sessions(3);
        metrics.set_pending_sessions(1);
        metrics.set_queue_depth(2);
        assert_eq!(
            metrics.snapshot(),
            Snapshot {
                tracked_sessions: 3,
                pending_sessions: 1,
                queue_depth: 2,
            }
        );
    }

    #[test]
    fn snapshot_serializes_with_gauge_names() {
        let json = serde_json::to_string(&Snapshot::default()).unwrap();
        assert!(json.contains("\"tracked_sessions\":0"));
        assert!(json.contains("\"queue_depth\":0"));
    }
}
