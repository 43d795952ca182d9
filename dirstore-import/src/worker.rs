//! Phase-1 import workers.
//!
//! Each worker pulls decoded entries from the shared source, assigns them
//! to a suffix, derives every index key the entry contributes, and appends
//! records into per-(worker, index) sort buffers. Full buffers are handed
//! to the sort executor and replaced from the free pool.
//!
//! With name validation on, the worker checks duplicates and parent
//! existence against the naming index directly and emits children/subtree
//! records itself (it knows the ancestor IDs). With validation skipped,
//! only the naming record is emitted and the Phase-2 naming merger
//! reconstructs the parent/child posting lists.

use crate::error::{ImportError, Result};
use crate::sort_buffer::{BufferPool, RecordOp, SortBuffer};
use crate::sorter::SortExecutor;
use crate::source::EntrySource;
use crate::stats::ImportStats;
use crate::suffix::{find_suffix, Suffix};
use dirstore_core::{Dn, Entry, EntryId, IndexKey, IndexStore, IndexerRegistry};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How many times a missing ancestor lookup is retried before rejecting.
/// Another worker may still be inserting the parent it pulled just ahead
/// of us.
const ANCESTOR_RETRIES: u32 = 3;
const ANCESTOR_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Import-wide context shared by every Phase-1 task.
pub struct WorkerShared<'a> {
    pub suffixes: &'a [Arc<Suffix>],
    pub registry: &'a IndexerRegistry,
    pub pool: &'a Arc<BufferPool>,
    pub sorter: &'a SortExecutor,
    pub stats: &'a ImportStats,
    pub cancel: &'a AtomicBool,
    pub next_entry_id: &'a AtomicU64,
    pub skip_validation: bool,
    pub replace_existing: bool,
}

/// Per-task emission state: one open sort buffer per index stream, plus a
/// cache of the last resolved ancestor chain (entries usually arrive in
/// sibling order, so the chain repeats).
pub struct WorkerState<'a> {
    shared: &'a WorkerShared<'a>,
    buffers: FxHashMap<IndexKey, SortBuffer>,
    chain_cache: Option<(Vec<u8>, Vec<u64>)>,
}

impl<'a> WorkerState<'a> {
    pub fn new(shared: &'a WorkerShared<'a>) -> Self {
        Self {
            shared,
            buffers: FxHashMap::default(),
            chain_cache: None,
        }
    }

    /// Process one admitted entry end to end (all emission paths).
    pub fn process_entry(
        &mut self,
        entry: &Entry,
        entry_id: EntryId,
        suffix: &Suffix,
    ) -> Result<()> {
        let shared = self.shared;
        let dn_key = entry.dn().sorted_bytes();
        let naming = suffix.container.naming_index();

        if shared.replace_existing {
            if let Some(old_id) = naming.get_id(&dn_key)? {
                return self.replace_entry(entry, old_id, suffix);
            }
        }

        if shared.skip_validation {
            self.emit(
                &IndexKey::naming(),
                suffix.naming_index_id,
                &dn_key,
                entry_id,
                RecordOp::Insert,
            )?;
            suffix.container.put_entry(entry_id, entry)?;
        } else {
            if naming.get_id(&dn_key)?.is_some() {
                shared
                    .stats
                    .reject_entry(&entry.dn().to_string(), "entry already exists");
                return Ok(());
            }
            let ancestors = match self.resolve_ancestor_ids(entry.dn(), suffix)? {
                Some(ids) => ids,
                None => {
                    shared
                        .stats
                        .reject_entry(&entry.dn().to_string(), "parent not found");
                    return Ok(());
                }
            };
            if !naming.put_id(&dn_key, entry_id)? {
                shared
                    .stats
                    .reject_entry(&entry.dn().to_string(), "entry already exists");
                return Ok(());
            }
            suffix.container.put_entry(entry_id, entry)?;

            if let Some(&parent_id) = ancestors.first() {
                self.emit(
                    &IndexKey::children(),
                    suffix.children_index_id,
                    &parent_id.to_be_bytes(),
                    entry_id,
                    RecordOp::Insert,
                )?;
                for &ancestor_id in &ancestors {
                    self.emit(
                        &IndexKey::subtree(),
                        suffix.subtree_index_id,
                        &ancestor_id.to_be_bytes(),
                        entry_id,
                        RecordOp::Insert,
                    )?;
                }
            }
        }

        self.emit_attribute_records(entry, entry_id, suffix, RecordOp::Insert)
    }

    /// Append/replace path: the name exists, so the old entry's index keys
    /// are retracted, the new entry's keys inserted, and the EntryID
    /// reused.
    fn replace_entry(&mut self, entry: &Entry, old_id: EntryId, suffix: &Suffix) -> Result<()> {
        let old_entry = suffix.container.get_entry(old_id)?;
        suffix.container.put_entry(old_id, entry)?;
        if let Some(old) = &old_entry {
            self.emit_attribute_records(old, old_id, suffix, RecordOp::Delete)?;
        }
        self.emit_attribute_records(entry, old_id, suffix, RecordOp::Insert)
    }

    fn emit_attribute_records(
        &mut self,
        entry: &Entry,
        entry_id: EntryId,
        suffix: &Suffix,
        op: RecordOp,
    ) -> Result<()> {
        let shared = self.shared;
        for (index_key, index_id) in &suffix.attr_indexes {
            let keys = shared.registry.keys_for_entry(entry, index_key);
            for key in keys {
                self.emit(index_key, *index_id, &key, entry_id, op)?;
            }
        }
        Ok(())
    }

    /// IDs of the parent and every higher ancestor within the base,
    /// nearest first. `None` when an ancestor is missing from the naming
    /// index; an empty vec for entries at the base itself.
    fn resolve_ancestor_ids(&mut self, dn: &Dn, suffix: &Suffix) -> Result<Option<Vec<u64>>> {
        let Some(parent) = dn.parent_within_base(&suffix.base) else {
            return Ok(Some(Vec::new()));
        };
        let parent_key = parent.sorted_bytes();
        if let Some((cached_key, ids)) = &self.chain_cache {
            if *cached_key == parent_key {
                return Ok(Some(ids.clone()));
            }
        }

        let naming = suffix.container.naming_index();
        let mut ids = Vec::new();
        let mut node = Some(parent);
        while let Some(dn) = node {
            match lookup_id_with_retry(naming.as_ref(), &dn.sorted_bytes())? {
                Some(id) => ids.push(id.as_u64()),
                None => return Ok(None),
            }
            node = dn.parent_within_base(&suffix.base);
        }
        self.chain_cache = Some((parent_key, ids.clone()));
        Ok(Some(ids))
    }

    /// Append one record, cycling the buffer through the sort executor
    /// when full.
    pub fn emit(
        &mut self,
        index_key: &IndexKey,
        index_id: u32,
        key: &[u8],
        entry_id: EntryId,
        op: RecordOp,
    ) -> Result<()> {
        let shared = self.shared;
        if !self.buffers.contains_key(index_key) {
            let buf = shared.pool.take()?;
            self.buffers.insert(index_key.clone(), buf);
        }
        let buf = self.buffers.get_mut(index_key).expect("buffer just inserted");
        if buf.put(index_id, key, entry_id.as_u64(), op) {
            return Ok(());
        }

        let mut full = self.buffers.remove(index_key).expect("buffer present");
        full.set_index_key(index_key.clone());
        shared.sorter.submit(full)?;

        let mut fresh = shared.pool.take()?;
        if !fresh.put(index_id, key, entry_id.as_u64(), op) {
            shared.pool.give(fresh);
            return Err(ImportError::Resource(format!(
                "index key of {} bytes exceeds the sort buffer capacity",
                key.len()
            )));
        }
        self.buffers.insert(index_key.clone(), fresh);
        Ok(())
    }

    /// Hand every open buffer to the sort executor (end of this task's
    /// stream).
    pub fn flush(&mut self) -> Result<()> {
        let shared = self.shared;
        for (index_key, mut buf) in self.buffers.drain() {
            if buf.is_empty() {
                shared.pool.give(buf);
                continue;
            }
            buf.set_index_key(index_key);
            shared.sorter.submit(buf)?;
        }
        Ok(())
    }
}

/// One import worker's main loop: contend over the entry source until it
/// is drained or the import is cancelled.
pub fn run_import_worker(shared: &WorkerShared<'_>, source: &dyn EntrySource) -> Result<()> {
    let mut state = WorkerState::new(shared);
    let result = (|| -> Result<()> {
        loop {
            if shared.cancel.load(Ordering::Relaxed) {
                return Err(ImportError::Cancelled);
            }
            let entry = match source.next_entry()? {
                Some(e) => e,
                None => break,
            };
            shared.stats.incr_read();
            let Some(suffix) = find_suffix(entry.dn(), shared.suffixes) else {
                shared.stats.incr_ignored();
                continue;
            };
            if !branch_filters_admit(entry.dn(), suffix) {
                shared.stats.incr_ignored();
                continue;
            }
            let entry_id = EntryId::new(shared.next_entry_id.fetch_add(1, Ordering::SeqCst));
            state.process_entry(&entry, entry_id, suffix)?;
        }
        state.flush()
    })();

    if let Err(e) = result {
        // Propagate end-of-stream to peers blocked on the free pool, then
        // surface the error (the orchestrator joins every task).
        shared.cancel.store(true, Ordering::SeqCst);
        shared.pool.give(SortBuffer::poison());
        return Err(e);
    }
    Ok(())
}

/// Include/exclude branches filter the entry stream: outside every
/// include (when includes are configured) or under any exclude, the entry
/// is ignored — the existing store contents cover those regions.
fn branch_filters_admit(dn: &Dn, suffix: &Suffix) -> bool {
    if !suffix.include_branches.is_empty()
        && !suffix
            .include_branches
            .iter()
            .any(|inc| inc.is_ancestor_or_equal(dn))
    {
        return false;
    }
    !suffix
        .exclude_branches
        .iter()
        .any(|exc| exc.is_ancestor_or_equal(dn))
}

fn lookup_id_with_retry(naming: &dyn IndexStore, key: &[u8]) -> Result<Option<EntryId>> {
    for attempt in 0..=ANCESTOR_RETRIES {
        if let Some(id) = naming.get_id(key)? {
            return Ok(Some(id));
        }
        if attempt < ANCESTOR_RETRIES {
            std::thread::sleep(ANCESTOR_RETRY_DELAY);
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImportConfig;
    use crate::spill::SpillWriterSet;
    use crate::suffix::init_suffixes;
    use crate::source::VecEntrySource;
    use dirstore_core::{AttributeIndexSpec, Backend};
    use dirstore_memory::MemoryBackend;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn registry() -> IndexerRegistry {
        let mut r = IndexerRegistry::new();
        r.register("cn", AttributeIndexSpec::eq_presence());
        r
    }

    struct Fixture {
        backend: MemoryBackend,
        suffixes: Vec<Arc<Suffix>>,
        pool: Arc<BufferPool>,
        sorter: Option<SortExecutor>,
        writers: Arc<SpillWriterSet>,
        stats: ImportStats,
        cancel: AtomicBool,
        next_id: AtomicU64,
        registry: IndexerRegistry,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let backend = MemoryBackend::new();
        backend.create_suffix(&dn("o=x"), &registry).unwrap();
        let (suffixes, _table) =
            init_suffixes(&backend, &registry, &ImportConfig::default()).unwrap();
        let pool = Arc::new(BufferPool::new(16, 1 << 14));
        let writers = Arc::new(SpillWriterSet::new(dir.path(), Arc::clone(&pool), 32));
        let sorter = SortExecutor::spawn(1, Arc::clone(&writers), Arc::clone(&pool), 32).unwrap();
        Fixture {
            backend,
            suffixes,
            pool,
            sorter: Some(sorter),
            writers,
            stats: ImportStats::new(),
            cancel: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            registry,
            _dir: dir,
        }
    }

    fn entry(name: &str) -> Entry {
        Entry::new(dn(name)).with_str_attr("cn", &[name])
    }

    #[test]
    fn test_worker_validates_and_emits() {
        let mut fx = fixture();
        let sorter = fx.sorter.take().unwrap();
        let shared = WorkerShared {
            suffixes: &fx.suffixes,
            registry: &fx.registry,
            pool: &fx.pool,
            sorter: &sorter,
            stats: &fx.stats,
            cancel: &fx.cancel,
            next_entry_id: &fx.next_id,
            skip_validation: false,
            replace_existing: false,
        };
        let source = VecEntrySource::new(vec![
            entry("o=x"),
            entry("a,o=x"),
            entry("a,o=x"),   // duplicate
            entry("c,b,o=x"), // parent b,o=x missing
            Entry::new(dn("o=other")), // outside every base
        ]);

        run_import_worker(&shared, &source).unwrap();
        sorter.shutdown().unwrap();
        let runs = fx.writers.finish().unwrap();

        assert_eq!(fx.stats.entries_read(), 5);
        assert_eq!(fx.stats.entries_rejected(), 2);
        assert_eq!(fx.stats.entries_ignored(), 1);
        assert_eq!(fx.stats.entries_loaded(), 2);

        // Naming entries were written synchronously.
        let container = fx.backend.container(&dn("o=x")).unwrap();
        let naming = container.naming_index();
        assert!(naming.get_id(&dn("o=x").sorted_bytes()).unwrap().is_some());
        assert!(naming.get_id(&dn("a,o=x").sorted_bytes()).unwrap().is_some());
        assert!(naming.get_id(&dn("c,b,o=x").sorted_bytes()).unwrap().is_none());

        // Children/subtree and attribute records went through the pipeline.
        let names: Vec<String> = runs.iter().map(|r| r.index_key.name()).collect();
        assert!(names.contains(&"dn.children".to_string()));
        assert!(names.contains(&"dn.subtree".to_string()));
        assert!(names.contains(&"cn.equality".to_string()));
        assert!(names.contains(&"cn.presence".to_string()));
        // Validation was on, so no naming run file exists.
        assert!(!names.contains(&"dn.naming".to_string()));
    }

    #[test]
    fn test_worker_skip_validation_spills_naming_records() {
        let mut fx = fixture();
        let sorter = fx.sorter.take().unwrap();
        let shared = WorkerShared {
            suffixes: &fx.suffixes,
            registry: &fx.registry,
            pool: &fx.pool,
            sorter: &sorter,
            stats: &fx.stats,
            cancel: &fx.cancel,
            next_entry_id: &fx.next_id,
            skip_validation: true,
            replace_existing: false,
        };
        let source = VecEntrySource::new(vec![entry("o=x"), entry("a,o=x")]);

        run_import_worker(&shared, &source).unwrap();
        sorter.shutdown().unwrap();
        let runs = fx.writers.finish().unwrap();

        let names: Vec<String> = runs.iter().map(|r| r.index_key.name()).collect();
        assert!(names.contains(&"dn.naming".to_string()));
        // No parent lookups happened, so nothing was written synchronously.
        let container = fx.backend.container(&dn("o=x")).unwrap();
        assert_eq!(container.naming_index().key_count(), 0);
        // Entry bodies are stored during Phase 1 either way.
        assert_eq!(container.entry_count(), 2);
    }

    #[test]
    fn test_worker_cancellation_drops_poison() {
        let mut fx = fixture();
        let sorter = fx.sorter.take().unwrap();
        fx.cancel.store(true, Ordering::SeqCst);
        let shared = WorkerShared {
            suffixes: &fx.suffixes,
            registry: &fx.registry,
            pool: &fx.pool,
            sorter: &sorter,
            stats: &fx.stats,
            cancel: &fx.cancel,
            next_entry_id: &fx.next_id,
            skip_validation: false,
            replace_existing: false,
        };
        let source = VecEntrySource::new(vec![entry("o=x")]);

        assert!(matches!(
            run_import_worker(&shared, &source),
            Err(ImportError::Cancelled)
        ));
        // The poison marker wakes the next pool consumer.
        let mut drained = Vec::new();
        loop {
            match fx.pool.take() {
                Ok(b) => drained.push(b),
                Err(_) => break,
            }
        }
        sorter.shutdown().unwrap();
        let _ = fx.writers.finish();
    }
}
