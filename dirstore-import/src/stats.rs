//! Shared import counters.
//!
//! `entries_read = entries_loaded + entries_rejected + entries_ignored`
//! holds at every point where the counters are quiescent; migrated entries
//! are counted separately (they come from the source store, not the entry
//! stream).

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by workers, mergers, and the progress reporter.
#[derive(Debug, Default)]
pub struct ImportStats {
    read: AtomicU64,
    ignored: AtomicU64,
    rejected: AtomicU64,
    migrated: AtomicU64,
}

impl ImportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_read(&self) {
        self.read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_migrated(&self) {
        self.migrated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a per-entry rejection. Rejection is a value, not an error.
    pub fn reject_entry(&self, name: &str, reason: &str) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(entry = name, reason, "entry rejected");
    }

    /// Record several rejections at once (merge-time duplicate collapse).
    pub fn reject_many(&self, count: u64, name: &str, reason: &str) {
        if count > 0 {
            self.rejected.fetch_add(count, Ordering::Relaxed);
            tracing::debug!(entry = name, reason, count, "entries rejected");
        }
    }

    pub fn entries_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn entries_ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    pub fn entries_rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn entries_migrated(&self) -> u64 {
        self.migrated.load(Ordering::Relaxed)
    }

    /// Entries that made it into the target store.
    pub fn entries_loaded(&self) -> u64 {
        self.entries_read()
            .saturating_sub(self.entries_rejected())
            .saturating_sub(self.entries_ignored())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loaded_balance() {
        let stats = ImportStats::new();
        for _ in 0..10 {
            stats.incr_read();
        }
        stats.incr_ignored();
        stats.reject_entry("a,o=x", "duplicate");
        stats.reject_many(2, "dn.naming", "merged duplicates");
        assert_eq!(stats.entries_read(), 10);
        assert_eq!(stats.entries_loaded(), 6);
        assert_eq!(
            stats.entries_read(),
            stats.entries_loaded() + stats.entries_rejected() + stats.entries_ignored()
        );
    }
}
