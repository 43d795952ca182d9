//! The import orchestrator.
//!
//! Sequences the two phases over explicit thread pools:
//!
//! 1. initialise suffixes → plan memory → allocate the buffer pool →
//!    migrate-existing → W import workers → migrate-excluded → drain the
//!    sort executor and spill writers;
//! 2. one merge task per run file (the naming run goes through the
//!    naming merger when validation was skipped) → mark indexes trusted →
//!    swap shadow containers → delete the temp directory.
//!
//! Every stage joins all of its tasks before the first error is surfaced.
//! On failure the target store is left with its indexes still marked
//! not-trusted; on cancellation the temp directory is retained for
//! diagnosis.

use crate::config::ImportConfig;
use crate::dn_merge::merge_naming_into_store;
use crate::error::{ImportError, Result};
use crate::memory::MemoryPlan;
use crate::merge::{merge_run_into_store, open_cursors};
use crate::migrate::{migrate_excluded, migrate_existing};
use crate::progress::{run_phase_one_reporter, run_phase_two_reporter, MergeProgress};
use crate::sort_buffer::BufferPool;
use crate::sorter::SortExecutor;
use crate::source::EntrySource;
use crate::spill::{RunIndex, SpillWriterSet};
use crate::stats::ImportStats;
use crate::suffix::{init_suffixes, switch_containers, IndexTable};
use crate::worker::{run_import_worker, WorkerShared};
use dirstore_core::{Backend, IndexKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{Builder, ScopedJoinHandle};
use std::time::{Duration, Instant};

/// Final accounting for one import run.
#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub entries_read: u64,
    pub entries_ignored: u64,
    pub entries_rejected: u64,
    pub entries_migrated: u64,
    pub entries_loaded: u64,
    pub elapsed: Duration,
    pub rate_per_sec: f64,
}

/// A configured bulk import.
pub struct Importer {
    config: ImportConfig,
    cancel: Arc<AtomicBool>,
}

impl Importer {
    /// Validate the configuration and prepare the temp directory (created
    /// if missing, stale spill files removed).
    pub fn new(config: ImportConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.temp_dir).map_err(|e| {
            ImportError::Resource(format!(
                "cannot create temp directory {}: {}",
                config.temp_dir.display(),
                e
            ))
        })?;
        for entry in std::fs::read_dir(&config.temp_dir)? {
            let path = entry?.path();
            if path.is_file() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag polled by every worker and merger; setting it aborts the run.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run the full two-phase import.
    pub fn run(
        &self,
        backend: &dyn Backend,
        source: &dyn EntrySource,
        registry: &dirstore_core::IndexerRegistry,
    ) -> Result<ImportSummary> {
        let start = Instant::now();
        let worker_count = self.config.effective_thread_count();
        tracing::info!(
            workers = worker_count,
            skip_name_validation = self.config.skip_name_validation,
            temp_dir = %self.config.temp_dir.display(),
            "bulk import starting"
        );

        let result = self.run_phases(backend, source, registry, worker_count, start);
        match &result {
            Ok(summary) => {
                let _ = std::fs::remove_dir_all(&self.config.temp_dir);
                tracing::info!(
                    read = summary.entries_read,
                    ignored = summary.entries_ignored,
                    rejected = summary.entries_rejected,
                    migrated = summary.entries_migrated,
                    elapsed_secs = summary.elapsed.as_secs(),
                    rate = format!("{:.0}/s", summary.rate_per_sec),
                    "bulk import complete"
                );
            }
            Err(ImportError::Cancelled) => {
                tracing::warn!(
                    temp_dir = %self.config.temp_dir.display(),
                    "import cancelled; temp files retained for diagnosis"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "import failed");
                let _ = std::fs::remove_dir_all(&self.config.temp_dir);
            }
        }
        result
    }

    fn run_phases(
        &self,
        backend: &dyn Backend,
        source: &dyn EntrySource,
        registry: &dirstore_core::IndexerRegistry,
        worker_count: usize,
        start: Instant,
    ) -> Result<ImportSummary> {
        let (suffixes, table) = init_suffixes(backend, registry, &self.config)?;
        if suffixes.is_empty() {
            return Err(ImportError::Config(
                "no suffix accepts entries under this configuration".into(),
            ));
        }

        let plan = MemoryPlan::plan(self.config.memory_budget_bytes, table.len(), worker_count)?;
        let pool = Arc::new(BufferPool::new(plan.buffer_count, plan.buffer_size));
        let writers = Arc::new(SpillWriterSet::new(
            &self.config.temp_dir,
            Arc::clone(&pool),
            plan.buffer_count + 1,
        ));
        let sorter = SortExecutor::spawn(
            worker_count,
            Arc::clone(&writers),
            Arc::clone(&pool),
            plan.buffer_count,
        )?;
        let stats = ImportStats::new();
        let next_entry_id = AtomicU64::new(1);

        let shared = WorkerShared {
            suffixes: &suffixes,
            registry,
            pool: &pool,
            sorter: &sorter,
            stats: &stats,
            cancel: &self.cancel,
            next_entry_id: &next_entry_id,
            skip_validation: self.config.skip_name_validation,
            replace_existing: self.config.append_to_existing
                && self.config.replace_existing_entries,
        };

        // ---- Phase 1 ----
        let phase_one = self.run_phase_one(&shared, source, backend, worker_count);
        // Drain the pipeline even on failure so every thread is joined.
        let sort_result = sorter.shutdown();
        let runs_result = writers.finish();
        phase_one?;
        sort_result?;
        let runs = runs_result?;
        if self.cancel.load(Ordering::SeqCst) {
            return Err(ImportError::Cancelled);
        }
        tracing::info!(
            runs = runs.len(),
            entries = stats.entries_read(),
            "phase one complete"
        );

        // ---- Phase 2 ----
        self.run_phase_two(backend, &runs, &table, &plan, &stats)?;
        if self.cancel.load(Ordering::SeqCst) {
            return Err(ImportError::Cancelled);
        }

        // ---- Commit ----
        for suffix in &suffixes {
            suffix.container.set_indexes_trusted(true)?;
        }
        switch_containers(backend, &suffixes)?;

        let elapsed = start.elapsed();
        let entries_read = stats.entries_read();
        let rate = if elapsed.as_secs_f64() > 0.0 {
            entries_read as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        Ok(ImportSummary {
            entries_read,
            entries_ignored: stats.entries_ignored() + source.entries_ignored(),
            entries_rejected: stats.entries_rejected(),
            entries_migrated: stats.entries_migrated(),
            entries_loaded: stats.entries_loaded(),
            elapsed,
            rate_per_sec: rate,
        })
    }

    /// Migrate-existing, the import worker pool, then migrate-excluded.
    /// Each stage waits for all of its tasks before the next starts.
    fn run_phase_one(
        &self,
        shared: &WorkerShared<'_>,
        source: &dyn EntrySource,
        backend: &dyn Backend,
        worker_count: usize,
    ) -> Result<()> {
        let stop_reporter = AtomicBool::new(false);
        let mut first_err: Option<ImportError> = None;

        std::thread::scope(|s| {
            let reporter = Builder::new()
                .name("import-progress".into())
                .spawn_scoped(s, || {
                    run_phase_one_reporter(
                        shared.stats,
                        backend,
                        self.config.progress_interval,
                        &stop_reporter,
                    )
                })
                .expect("spawn progress reporter");

            let migrate = spawn_task(s, "migrate-existing", || {
                migrate_existing(shared).map(|count| {
                    if count > 0 {
                        tracing::info!(count, "existing entries migrated");
                    }
                })
            });
            record_err(&mut first_err, join_task(migrate));

            if first_err.is_none() {
                let mut workers = Vec::with_capacity(worker_count);
                for i in 0..worker_count {
                    workers.push(spawn_task(s, &format!("import-{}", i), || {
                        run_import_worker(shared, source)
                    }));
                }
                for handle in workers {
                    record_err(&mut first_err, join_task(handle));
                }
            }

            if first_err.is_none() {
                let migrate = spawn_task(s, "migrate-excluded", || {
                    migrate_excluded(shared).map(|count| {
                        if count > 0 {
                            tracing::info!(count, "excluded-branch entries migrated");
                        }
                    })
                });
                record_err(&mut first_err, join_task(migrate));
            }

            stop_reporter.store(true, Ordering::SeqCst);
            let _ = reporter.join();
        });

        match first_err {
            Some(e) => {
                self.cancel.store(true, Ordering::SeqCst);
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// One merge task per run file; the naming run (present only when
    /// validation was skipped) goes through the naming merger.
    fn run_phase_two(
        &self,
        backend: &dyn Backend,
        runs: &[RunIndex],
        table: &IndexTable,
        plan: &MemoryPlan,
        stats: &ImportStats,
    ) -> Result<()> {
        let total_segments: usize = runs.iter().map(|r| r.segments.len()).sum();
        if total_segments == 0 {
            return Ok(());
        }
        let cache_size = match self.config.direct_buffer_size {
            Some(slab_size) => plan.direct_cache_size(slab_size, total_segments)?,
            None => plan.phase_two_cache_size(self.config.memory_budget_bytes, total_segments),
        };
        tracing::info!(
            runs = runs.len(),
            segments = total_segments,
            cache_size,
            direct = self.config.direct_buffer_size.is_some(),
            "phase two starting"
        );

        // The whole slab lives exactly as long as the phase scope; every
        // merger borrows a disjoint slice of it.
        let mut slab = self.config.direct_buffer_size.map(|n| vec![0u8; n]);
        let mut empty: [u8; 0] = [];
        let mut rest: &mut [u8] = match slab.as_mut() {
            Some(v) => v.as_mut_slice(),
            None => &mut empty,
        };

        let merges: Vec<Arc<MergeProgress>> = runs
            .iter()
            .map(|r| Arc::new(MergeProgress::new(&r.index_key.name(), r.file_len)))
            .collect();
        let stop_reporter = AtomicBool::new(false);
        let mut first_err: Option<ImportError> = None;
        let cancel = &self.cancel;
        let use_slab = slab_in_use(&self.config);

        std::thread::scope(|s| {
            let reporter = Builder::new()
                .name("merge-progress".into())
                .spawn_scoped(s, || {
                    run_phase_two_reporter(
                        &merges,
                        backend,
                        self.config.progress_interval,
                        &stop_reporter,
                    )
                })
                .expect("spawn progress reporter");

            let mut handles = Vec::with_capacity(runs.len());
            for (run, progress) in runs.iter().zip(&merges) {
                let slice = if use_slab {
                    let need = cache_size * run.segments.len();
                    let taken = std::mem::take(&mut rest);
                    let (head, tail) = taken.split_at_mut(need);
                    rest = tail;
                    Some(head)
                } else {
                    None
                };
                let progress = Arc::clone(progress);
                let handle = spawn_task(s, &format!("merge-{}", run.index_key.name()), move || {
                    let cursors = open_cursors(run, cache_size, slice)?;
                    if run.index_key.kind() == IndexKind::Naming {
                        merge_naming_into_store(run, cursors, table, stats, &progress, cancel)
                    } else {
                        merge_run_into_store(run, cursors, table, &progress, cancel)
                    }
                });
                handles.push(handle);
            }
            for handle in handles {
                record_err(&mut first_err, join_task(handle));
            }

            stop_reporter.store(true, Ordering::SeqCst);
            let _ = reporter.join();
        });

        match first_err {
            Some(e) => {
                self.cancel.store(true, Ordering::SeqCst);
                Err(e)
            }
            None => Ok(()),
        }
    }
}

fn slab_in_use(config: &ImportConfig) -> bool {
    config.direct_buffer_size.is_some()
}

fn spawn_task<'scope, 'env, F, T>(
    s: &'scope std::thread::Scope<'scope, 'env>,
    name: &str,
    f: F,
) -> ScopedJoinHandle<'scope, Result<T>>
where
    F: FnOnce() -> Result<T> + Send + 'scope,
    T: Send + 'scope,
{
    Builder::new()
        .name(name.to_string())
        .spawn_scoped(s, f)
        .expect("spawn import task")
}

fn join_task<T>(handle: ScopedJoinHandle<'_, Result<T>>) -> Result<T> {
    let name = handle
        .thread()
        .name()
        .unwrap_or("import task")
        .to_string();
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(ImportError::TaskPanicked(name)),
    }
}

fn record_err<T>(slot: &mut Option<ImportError>, result: Result<T>) {
    if let Err(e) = result {
        if slot.is_none() {
            *slot = Some(e);
        }
    }
}
