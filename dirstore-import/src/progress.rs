//! Periodic progress reporting for both phases.
//!
//! Reporter tasks run on their own threads inside the phase scopes and
//! observe shared counters; they never influence the import itself.

use crate::stats::ImportStats;
use dirstore_core::{Backend, BackendStats};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Granularity of the stop-flag poll while waiting out the interval.
const POLL_TICK: Duration = Duration::from_millis(100);

/// Shared Phase-2 state for one index merge.
pub struct MergeProgress {
    name: String,
    total_bytes: u64,
    bytes_read: AtomicU64,
    keys: AtomicU64,
    done: AtomicBool,
}

impl MergeProgress {
    pub fn new(name: &str, total_bytes: u64) -> Self {
        Self {
            name: name.to_string(),
            total_bytes,
            bytes_read: AtomicU64::new(0),
            keys: AtomicU64::new(0),
            done: AtomicBool::new(false),
        }
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn incr_keys(&self) {
        self.keys.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish(&self) {
        self.done.store(true, Ordering::Relaxed);
    }

    pub fn keys(&self) -> u64 {
        self.keys.load(Ordering::Relaxed)
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.total_bytes
            .saturating_sub(self.bytes_read.load(Ordering::Relaxed))
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Relaxed)
    }
}

/// Phase-1 reporter loop: entry counts, ingest rate, and backend
/// environment telemetry.
pub fn run_phase_one_reporter(
    stats: &ImportStats,
    backend: &dyn Backend,
    interval: Duration,
    stop: &AtomicBool,
) {
    let mut previous_count = 0u64;
    let mut previous_time = Instant::now();
    let mut previous_env = backend.stats();

    while wait_interval(interval, stop) {
        let now = Instant::now();
        let read = stats.entries_read();
        let delta = read - previous_count;
        let elapsed = now.duration_since(previous_time).as_secs_f64();
        if elapsed <= 0.0 {
            continue;
        }
        tracing::info!(
            read,
            ignored = stats.entries_ignored(),
            rejected = stats.entries_rejected(),
            migrated = stats.entries_migrated(),
            rate = format!("{:.0}/s", delta as f64 / elapsed),
            "import progress"
        );
        previous_env = report_env_stats(backend, previous_env, delta);
        previous_count = read;
        previous_time = now;
    }
}

/// Phase-2 reporter loop: per-index remaining bytes and key rate.
pub fn run_phase_two_reporter(
    merges: &[std::sync::Arc<MergeProgress>],
    backend: &dyn Backend,
    interval: Duration,
    stop: &AtomicBool,
) {
    let mut previous_keys: Vec<u64> = merges.iter().map(|_| 0).collect();
    let mut previous_time = Instant::now();
    let mut previous_env = backend.stats();

    while wait_interval(interval, stop) {
        let now = Instant::now();
        let elapsed = now.duration_since(previous_time).as_secs_f64();
        if elapsed <= 0.0 {
            continue;
        }
        let mut total_delta = 0u64;
        for (merge, prev) in merges.iter().zip(previous_keys.iter_mut()) {
            if merge.is_done() {
                continue;
            }
            let keys = merge.keys();
            let delta = keys - *prev;
            total_delta += delta;
            tracing::info!(
                index = %merge.name,
                remaining_bytes = merge.remaining_bytes(),
                rate = format!("{:.0} keys/s", delta as f64 / elapsed),
                "index merge progress"
            );
            *prev = keys;
        }
        previous_env = report_env_stats(backend, previous_env, total_delta);
        previous_time = now;
    }
}

/// Log backend telemetry deltas; quiet when the backend reports nothing.
fn report_env_stats(backend: &dyn Backend, previous: BackendStats, delta: u64) -> BackendStats {
    let env = backend.stats();
    if env == BackendStats::default() {
        return env;
    }
    let misses = env.cache_misses - previous.cache_misses;
    let miss_rate = if delta > 0 {
        misses as f64 / delta as f64
    } else {
        0.0
    };
    tracing::info!(
        cache_miss_rate = format!("{:.2}", miss_rate),
        eviction_passes = env.eviction_passes,
        cleaner_runs = env.cleaner_runs,
        checkpoints = env.checkpoints,
        "store cache report"
    );
    env
}

/// Sleep until the next report is due; `false` once stopped.
fn wait_interval(interval: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + interval;
    while Instant::now() < deadline {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        std::thread::sleep(POLL_TICK.min(interval));
    }
    !stop.load(Ordering::Relaxed)
}
