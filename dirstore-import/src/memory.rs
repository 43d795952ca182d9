//! Memory planning for both phases.
//!
//! Phase 1 divides its share of the budget between the store cache, the
//! store's transaction-log buffer, and `2 · indexes · workers` sort
//! buffers. Phase 2 divides its share equally among all spill-run segments
//! as read-ahead caches.

use crate::config::{
    MAX_BUFFER_SIZE, MAX_LOG_BUFFER, MAX_STORE_CACHE, MIN_BUFFER_SIZE, MIN_IMPORT_MEMORY,
    MIN_READ_AHEAD_CACHE, MIN_STORE_CACHE, PHASE_ONE_MEM_PCT, PHASE_TWO_MEM_PCT,
};
use crate::error::{ImportError, Result};

/// Phase-1 memory plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPlan {
    /// Capacity of each sort buffer.
    pub buffer_size: usize,
    /// Number of pooled sort buffers (`2 · indexes · workers`).
    pub buffer_count: usize,
    /// Store cache to configure on the backend environment.
    pub store_cache: u64,
    /// Store log-buffer size; 0 disables the dedicated log buffer.
    pub log_buffer: u64,
}

impl MemoryPlan {
    /// Plan Phase 1 from the total memory budget.
    ///
    /// Fails when less than [`MIN_IMPORT_MEMORY`] is available to the
    /// phase. Falls back to a minimal store cache when the comfortable
    /// target leaves buffers under the floor, and pins buffers at the
    /// floor (with a warning) when even that is not enough.
    pub fn plan(total_budget: u64, index_count: usize, worker_count: usize) -> Result<MemoryPlan> {
        let avail = total_budget * PHASE_ONE_MEM_PCT / 100;
        let buffer_count = 2 * index_count * worker_count;
        tracing::info!(
            avail_bytes = avail,
            buffers = buffer_count,
            "phase one memory budget"
        );
        if avail < MIN_IMPORT_MEMORY {
            return Err(ImportError::Resource(format!(
                "import requires at least {} MiB free, have {} MiB",
                MIN_IMPORT_MEMORY / (1024 * 1024),
                avail / (1024 * 1024)
            )));
        }
        if buffer_count == 0 {
            return Err(ImportError::Resource("no indexes to build".into()));
        }

        let buffers = buffer_count as u64;
        let mem = avail.saturating_sub(MAX_STORE_CACHE + MAX_LOG_BUFFER);
        let target = (mem / buffers) as usize;

        let plan = if target >= MIN_BUFFER_SIZE {
            MemoryPlan {
                buffer_size: target.min(MAX_BUFFER_SIZE),
                buffer_count,
                store_cache: MAX_STORE_CACHE,
                log_buffer: MAX_LOG_BUFFER,
            }
        } else {
            // Constrained: minimal store cache, no dedicated log buffer.
            let mem = avail.saturating_sub(MIN_STORE_CACHE + MIN_STORE_CACHE * 7 / 100);
            let fallback = (mem / buffers) as usize;
            if fallback < MIN_BUFFER_SIZE {
                tracing::warn!(
                    buffer_size = MIN_BUFFER_SIZE,
                    "sort buffers pinned at the floor; import may spill heavily"
                );
                MemoryPlan {
                    buffer_size: MIN_BUFFER_SIZE,
                    buffer_count,
                    store_cache: MIN_STORE_CACHE,
                    log_buffer: 0,
                }
            } else {
                // Split the headroom above the floor evenly between the
                // buffers and the store cache.
                let floor_total = buffers * MIN_BUFFER_SIZE as u64;
                let headroom = mem - floor_total;
                MemoryPlan {
                    buffer_size: ((floor_total + headroom / 2) / buffers) as usize,
                    buffer_count,
                    store_cache: MIN_STORE_CACHE + headroom / 2,
                    log_buffer: 0,
                }
            }
        };

        tracing::info!(
            buffer_size = plan.buffer_size,
            store_cache = plan.store_cache,
            log_buffer = plan.log_buffer,
            "phase one memory plan"
        );
        Ok(plan)
    }

    /// Per-segment read-ahead cache for Phase 2 out of free memory.
    pub fn phase_two_cache_size(&self, total_budget: u64, segment_count: usize) -> usize {
        if segment_count == 0 {
            return MIN_READ_AHEAD_CACHE;
        }
        let avail = total_budget * PHASE_TWO_MEM_PCT / 100;
        let per_segment = (avail / segment_count as u64) as usize;
        per_segment
            .max(MIN_READ_AHEAD_CACHE)
            .min(self.buffer_size)
    }

    /// Per-segment read-ahead cache when Phase 2 runs off a single
    /// pre-allocated slab.
    pub fn direct_cache_size(&self, slab_size: usize, segment_count: usize) -> Result<usize> {
        if segment_count == 0 {
            return Ok(MIN_READ_AHEAD_CACHE);
        }
        let per_segment = (slab_size / segment_count).min(self.buffer_size);
        if per_segment < MIN_READ_AHEAD_CACHE {
            return Err(ImportError::Config(format!(
                "direct buffer of {} bytes is too small for {} spill segments",
                slab_size, segment_count
            )));
        }
        Ok(per_segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_comfortable_budget() {
        // 2 GiB budget, 10 indexes, 4 workers: 80 buffers.
        let plan = MemoryPlan::plan(2048 * MB, 10, 4).unwrap();
        assert_eq!(plan.buffer_count, 80);
        assert_eq!(plan.store_cache, MAX_STORE_CACHE);
        assert_eq!(plan.log_buffer, MAX_LOG_BUFFER);
        assert!(plan.buffer_size >= MIN_BUFFER_SIZE);
        assert!(plan.buffer_size <= MAX_BUFFER_SIZE);
    }

    #[test]
    fn test_huge_budget_caps_buffer_size() {
        let plan = MemoryPlan::plan(64 * 1024 * MB, 2, 1).unwrap();
        assert_eq!(plan.buffer_size, MAX_BUFFER_SIZE);
    }

    #[test]
    fn test_constrained_budget_shrinks_store_cache() {
        // 128 MiB budget → 57 MiB for phase one; the comfortable target
        // (cache 128 + log 100) cannot fit.
        let plan = MemoryPlan::plan(128 * MB, 4, 2).unwrap();
        assert_eq!(plan.log_buffer, 0);
        assert!(plan.store_cache >= MIN_STORE_CACHE);
        assert!(plan.buffer_size >= MIN_BUFFER_SIZE);
    }

    #[test]
    fn test_floor_pinned_when_very_tight() {
        // Just above the fatal threshold with many buffers.
        let plan = MemoryPlan::plan(40 * MB, 32, 8).unwrap();
        assert_eq!(plan.buffer_size, MIN_BUFFER_SIZE);
        assert_eq!(plan.store_cache, MIN_STORE_CACHE);
        assert_eq!(plan.log_buffer, 0);
    }

    #[test]
    fn test_fatal_below_minimum() {
        assert!(matches!(
            MemoryPlan::plan(20 * MB, 4, 2),
            Err(ImportError::Resource(_))
        ));
    }

    #[test]
    fn test_phase_two_cache_bounds() {
        let plan = MemoryPlan::plan(2048 * MB, 10, 4).unwrap();
        // Tiny budget per segment → floored.
        assert_eq!(
            plan.phase_two_cache_size(1, 1_000_000),
            MIN_READ_AHEAD_CACHE
        );
        // Huge budget per segment → capped at the buffer size.
        assert_eq!(plan.phase_two_cache_size(2048 * MB, 1), plan.buffer_size);
    }

    #[test]
    fn test_direct_cache_size() {
        let plan = MemoryPlan::plan(2048 * MB, 10, 4).unwrap();
        assert_eq!(plan.direct_cache_size(8192 * 4, 4).unwrap(), 8192);
        assert!(plan.direct_cache_size(1024, 4).is_err());
    }
}
