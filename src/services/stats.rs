//! Process-wide pipeline counters.
//!
//! The only in-memory global state besides the full-resync flag (which
//! lives in the relational store so it survives restarts). Initialized once
//! at startup, read by the metrics surface, flushed to `sync_stats` by the
//! callers that increment it. All updates are atomic.

use crate::types::SyncStats;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory mirror of the persisted `sync_stats` row.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    events_processed: AtomicU64,
    events_failed: AtomicU64,
    conflicts_detected: AtomicU64,
    conflicts_resolved: AtomicU64,
    full_resyncs: AtomicU64,
}

impl RuntimeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the counters from the persisted row at startup.
    pub fn init_from(&self, stats: &SyncStats) {
        self.events_processed
            .store(stats.events_processed, Ordering::SeqCst);
        self.events_failed.store(stats.events_failed, Ordering::SeqCst);
        self.conflicts_detected
            .store(stats.conflicts_detected, Ordering::SeqCst);
        self.conflicts_resolved
            .store(stats.conflicts_resolved, Ordering::SeqCst);
        self.full_resyncs.store(stats.full_resyncs, Ordering::SeqCst);
    }

    pub fn record_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict_detected(&self) {
        self.conflicts_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict_resolved(&self) {
        self.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_full_resync(&self) {
        self.full_resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncStats {
        SyncStats {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            full_resyncs: self.full_resyncs.load(Ordering::Relaxed),
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = RuntimeStats::new();
        stats.record_processed();
        stats.record_processed();
        stats.record_failed();
        stats.record_conflict_detected();
        stats.record_conflict_resolved();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.events_processed, 2);
        assert_eq!(snapshot.events_failed, 1);
        assert_eq!(snapshot.conflicts_detected, 1);
        assert_eq!(snapshot.conflicts_resolved, 1);
        assert_eq!(snapshot.full_resyncs, 0);
    }

    #[test]
    fn test_init_from_persisted() {
        let stats = RuntimeStats::new();
        stats.init_from(&SyncStats {
            events_processed: 10,
            events_failed: 2,
            conflicts_detected: 1,
            conflicts_resolved: 1,
            full_resyncs: 1,
            updated_at: 0,
        });
        stats.record_processed();
        assert_eq!(stats.snapshot().events_processed, 11);
    }
}
