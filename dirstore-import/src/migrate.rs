//! Migration of surviving entries from a pre-existing store.
//!
//! When include branches rewrite only part of a base, everything else must
//! survive. Two single-threaded tasks stream those survivors out of the
//! source container and through the same emission path as the import
//! workers, so every index is rebuilt consistently:
//!
//! - *migrate existing* (before the main ingest): every entry whose name
//!   is NOT under an include branch.
//! - *migrate excluded* (after the main ingest): every entry under an
//!   exclude branch.
//!
//! Migrated entries get fresh EntryIDs; cursors skip whole subtrees by
//! seeking past the sorted-key range of a branch.

use crate::error::Result;
use crate::sort_buffer::SortBuffer;
use crate::worker::{WorkerShared, WorkerState};
use dirstore_core::dn::{key_in_subtree, subtree_end};
use dirstore_core::{Container, Dn, EntryId};
use std::sync::atomic::Ordering;

/// Stream every source entry outside the include branches into the import
/// pipeline. Returns the number of entries migrated.
pub fn migrate_existing(shared: &WorkerShared<'_>) -> Result<u64> {
    let mut state = WorkerState::new(shared);
    let mut migrated = 0u64;

    for suffix in shared.suffixes {
        let Some(src) = &suffix.src_container else {
            continue;
        };
        if suffix.include_branches.is_empty() {
            continue;
        }
        tracing::info!(base = %suffix.base, "migrating entries outside include branches");
        let include_keys: Vec<Vec<u8>> = suffix
            .include_branches
            .iter()
            .map(|dn| dn.sorted_bytes())
            .collect();

        let mut cursor = src.naming_index().cursor()?;
        while let Some((key, value)) = cursor.next()? {
            if shared.cancel.load(Ordering::Relaxed) {
                shared.pool.give(SortBuffer::poison());
                return Err(crate::error::ImportError::Cancelled);
            }
            if let Some(inc) = include_keys.iter().find(|inc| key_in_subtree(&key, inc)) {
                // This branch is rebuilt from the entry stream; skip its
                // whole subtree.
                cursor.seek(&subtree_end(inc))?;
                continue;
            }
            migrate_one(&mut state, shared, src.as_ref(), suffix, &key, &value)?;
            migrated += 1;
        }
    }
    state.flush()?;
    Ok(migrated)
}

/// Stream every source entry under an exclude branch into the import
/// pipeline (the survivors of an excluded subtree).
pub fn migrate_excluded(shared: &WorkerShared<'_>) -> Result<u64> {
    let mut state = WorkerState::new(shared);
    let mut migrated = 0u64;

    for suffix in shared.suffixes {
        let Some(src) = &suffix.src_container else {
            continue;
        };
        for branch in &suffix.exclude_branches {
            tracing::info!(base = %suffix.base, %branch, "migrating excluded branch");
            let branch_key = branch.sorted_bytes();
            let mut cursor = src.naming_index().cursor()?;
            cursor.seek(&branch_key)?;
            while let Some((key, value)) = cursor.next()? {
                if shared.cancel.load(Ordering::Relaxed) {
                    shared.pool.give(SortBuffer::poison());
                    return Err(crate::error::ImportError::Cancelled);
                }
                if !key_in_subtree(&key, &branch_key) {
                    break;
                }
                if key == branch_key {
                    // The branch root itself is excluded; only entries
                    // strictly under it survive (and then only if their
                    // parent chain does too).
                    continue;
                }
                migrate_one(&mut state, shared, src.as_ref(), suffix, &key, &value)?;
                migrated += 1;
            }
        }
    }
    state.flush()?;
    Ok(migrated)
}

fn migrate_one(
    state: &mut WorkerState<'_>,
    shared: &WorkerShared<'_>,
    src: &dyn Container,
    suffix: &crate::suffix::Suffix,
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    let old_id = decode_entry_id(value)?;
    let Some(entry) = src.get_entry(old_id)? else {
        let name = Dn::from_sorted_bytes(key)
            .map(|d| d.to_string())
            .unwrap_or_else(|_| "<unparseable>".into());
        tracing::warn!(entry = %name, "naming entry without a body; skipped");
        return Ok(());
    };
    let entry_id = EntryId::new(shared.next_entry_id.fetch_add(1, Ordering::SeqCst));
    state.process_entry(&entry, entry_id, suffix)?;
    shared.stats.incr_migrated();
    Ok(())
}

fn decode_entry_id(value: &[u8]) -> Result<EntryId> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| {
        crate::error::ImportError::Store(dirstore_core::CoreError::CorruptValue(format!(
            "naming value of {} bytes",
            value.len()
        )))
    })?;
    Ok(EntryId::from_be_bytes(bytes))
}
