//! Naming-index merger.
//!
//! Used when Phase 1 ran with name validation skipped: the import workers
//! could not look up parent IDs, so this merger both writes the naming
//! records and derives the CHILDREN and SUBTREE posting lists on the fly.
//!
//! It relies on the sorted-name key order: every node's ancestors have
//! already been processed when the node itself arrives. An in-memory
//! parent table maps ancestor name keys to their EntryIDs; whenever
//! processing descends out of a subtree the table is pruned back to the
//! current node's strict ancestors, so it never holds more than one
//! root-to-leaf path.

use crate::error::Result;
use crate::merge::{AggregatedMerge, MergeSource};
use crate::progress::MergeProgress;
use crate::spill::RunIndex;
use crate::stats::ImportStats;
use crate::suffix::IndexTable;
use dirstore_core::{Container, Dn, EntryId, IdSet, IndexStore};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Merge the naming run into the store, rebuilding CHILDREN and SUBTREE.
pub fn merge_naming_into_store<T: MergeSource>(
    run: &RunIndex,
    cursors: Vec<T>,
    table: &IndexTable,
    stats: &ImportStats,
    progress: &MergeProgress,
    cancel: &AtomicBool,
) -> Result<()> {
    let mut merge = AggregatedMerge::new(cursors);
    let mut states: FxHashMap<u32, DnState> = FxHashMap::default();

    while let Some(record) = merge.next_group()? {
        if cancel.load(Ordering::Relaxed) {
            return Err(crate::error::ImportError::Cancelled);
        }

        progress.add_bytes((16 + record.key.len() + 8 * record.insert.ids.len()) as u64);
        let state = states
            .entry(record.index_id)
            .or_insert_with(|| DnState::new(Arc::clone(table.container(record.index_id))));

        // Duplicate names collapse into one record carrying several IDs;
        // the smallest (first-assigned) wins, the rest are rejections.
        let Some(&entry_id) = record.insert.ids.first() else {
            continue;
        };
        if record.insert.ids.len() > 1 {
            let name = display_key(&record.key);
            stats.reject_many(
                record.insert.ids.len() as u64 - 1,
                &name,
                "entry already exists",
            );
        }

        state.process(&record.key, EntryId::new(entry_id), stats)?;
        progress.incr_keys();
    }

    for state in states.values_mut() {
        state.flush()?;
    }
    std::fs::remove_file(&run.path)?;
    progress.finish();
    tracing::info!(index = %run.index_key, "naming merge complete");
    Ok(())
}

/// Per-container merge state: the parent table plus the CHILDREN/SUBTREE
/// accumulators flushed at end of stream.
struct DnState {
    container: Arc<dyn Container>,
    naming: Arc<dyn IndexStore>,
    children_index: Arc<dyn IndexStore>,
    subtree_index: Arc<dyn IndexStore>,
    /// Ancestor name key → EntryID, covering one root-to-leaf path.
    parent_table: BTreeMap<Vec<u8>, u64>,
    /// Previous accepted record, promoted into the table when it turns out
    /// to be a parent.
    last: Option<(Vec<u8>, u64)>,
    /// Parent EntryID (BE bytes) → child ID set.
    children_acc: BTreeMap<Vec<u8>, IdSet>,
    /// Ancestor EntryID (BE bytes) → descendant ID set.
    subtree_acc: BTreeMap<Vec<u8>, IdSet>,
    name_count: u64,
}

impl DnState {
    fn new(container: Arc<dyn Container>) -> Self {
        Self {
            naming: container.naming_index(),
            children_index: container.children_index(),
            subtree_index: container.subtree_index(),
            container,
            parent_table: BTreeMap::new(),
            last: None,
            children_acc: BTreeMap::new(),
            subtree_acc: BTreeMap::new(),
            name_count: 0,
        }
    }

    fn process(&mut self, key: &[u8], entry_id: EntryId, stats: &ImportStats) -> Result<()> {
        let parent = match self.check_parent(key, entry_id) {
            ParentCheck::Root => None,
            ParentCheck::Found { parent_key, parent_id } => Some((parent_key, parent_id)),
            ParentCheck::Missing => {
                stats.reject_entry(&display_key(key), "parent not found");
                return Ok(());
            }
        };

        self.naming.put_id_raw(key, entry_id)?;
        self.name_count += 1;

        if let Some((parent_key, parent_id)) = parent {
            self.add_child(parent_id, entry_id);
            self.add_subtree(&parent_key, parent_id, entry_id)?;
        }
        Ok(())
    }

    /// Locate this record's parent, maintaining the table. Records arrive
    /// in sorted-name order, so a node's parent is either the previous
    /// record (descent into a subtree) or a table entry left over from an
    /// earlier record (sibling, or ascent out of a subtree). The parent
    /// must be the *structural* parent: a mere ancestor with the
    /// intermediate node missing is a dangling-parent rejection.
    fn check_parent(&mut self, key: &[u8], entry_id: EntryId) -> ParentCheck {
        let Some(parent_key) = structural_parent_key(key, &self.container) else {
            // The suffix root itself.
            self.parent_table.insert(key.to_vec(), entry_id.as_u64());
            self.last = Some((key.to_vec(), entry_id.as_u64()));
            return ParentCheck::Root;
        };

        if let Some((last_key, last_id)) = &self.last {
            if *last_key == parent_key {
                // Descending: the previous record becomes the parent and
                // joins the table as an interior node.
                let parent_id = *last_id;
                self.parent_table.insert(parent_key.clone(), parent_id);
                self.last = Some((key.to_vec(), entry_id.as_u64()));
                return ParentCheck::Found { parent_key, parent_id };
            }
        }

        let Some(&parent_id) = self.parent_table.get(&parent_key) else {
            return ParentCheck::Missing;
        };
        // Sibling or ascent: everything deeper than the parent can no
        // longer be an ancestor of later records.
        self.parent_table.split_off(&parent_key);
        self.parent_table.insert(parent_key.clone(), parent_id);
        self.last = Some((key.to_vec(), entry_id.as_u64()));
        ParentCheck::Found { parent_key, parent_id }
    }

    fn add_child(&mut self, parent_id: u64, child: EntryId) {
        let limit = self.children_index.entry_limit();
        let maintain = self.children_index.maintain_count();
        self.children_acc
            .entry(parent_id.to_be_bytes().to_vec())
            .or_insert_with(|| IdSet::new(limit, maintain))
            .add(child);
    }

    /// The child joins the subtree set of the parent and of every higher
    /// ancestor (all present in the parent table).
    fn add_subtree(&mut self, parent_key: &[u8], parent_id: u64, child: EntryId) -> Result<()> {
        let limit = self.subtree_index.entry_limit();
        let maintain = self.subtree_index.maintain_count();
        self.subtree_acc
            .entry(parent_id.to_be_bytes().to_vec())
            .or_insert_with(|| IdSet::new(limit, maintain))
            .add(child);

        let mut node_key = parent_key.to_vec();
        while let Some(ancestor_key) = structural_parent_key(&node_key, &self.container) {
            let Some(&ancestor_id) = self.parent_table.get(&ancestor_key) else {
                break;
            };
            self.subtree_acc
                .entry(ancestor_id.to_be_bytes().to_vec())
                .or_insert_with(|| IdSet::new(limit, maintain))
                .add(child);
            node_key = ancestor_key;
        }
        Ok(())
    }

    /// Bulk-load the accumulated posting lists.
    fn flush(&mut self) -> Result<()> {
        for (key, ids) in std::mem::take(&mut self.children_acc) {
            self.children_index.insert(&key, &ids)?;
        }
        for (key, ids) in std::mem::take(&mut self.subtree_acc) {
            self.subtree_index.insert(&key, &ids)?;
        }
        tracing::info!(
            base = %self.container.base(),
            names = self.name_count,
            "naming index loaded"
        );
        Ok(())
    }
}

enum ParentCheck {
    Root,
    Found { parent_key: Vec<u8>, parent_id: u64 },
    Missing,
}

/// Sorted-name key of the parent within the container's base.
fn structural_parent_key(key: &[u8], container: &Arc<dyn Container>) -> Option<Vec<u8>> {
    let dn = Dn::from_sorted_bytes(key).ok()?;
    dn.parent_within_base(container.base())
        .map(|p| p.sorted_bytes())
}

fn display_key(key: &[u8]) -> String {
    Dn::from_sorted_bytes(key)
        .map(|d| d.to_string())
        .unwrap_or_else(|_| "<unparseable>".into())
}
