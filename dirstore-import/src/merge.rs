//! Phase-2 k-way merge of sorted runs.
//!
//! Uses a manual min-heap ordered by `(key, indexID)` to merge the
//! segments of one run file into a single sorted stream, aggregates
//! consecutive records for the same `(key, indexID)`, and bulk-loads the
//! result into the target index. For every `(key, indexID)` the store sees
//! exactly one delete call and one insert call, deletes first.

use crate::error::{ImportError, Result};
use crate::progress::MergeProgress;
use crate::run_file::{CacheBuf, RecordIds, RunCursor, RunRecord};
use crate::spill::RunIndex;
use crate::suffix::IndexTable;
use dirstore_core::{EntryId, IdSet, IndexStore};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

// ============================================================================
// MergeSource
// ============================================================================

/// A buffered, forward-only record stream that can be k-way merged.
pub trait MergeSource {
    /// Current record without consuming it; `None` when exhausted.
    fn peek(&self) -> Option<&RunRecord>;

    /// Take ownership of the current record.
    fn take_current(&mut self) -> Option<RunRecord>;

    /// Decode the next record, refilling from disk as needed.
    fn advance(&mut self) -> io::Result<()>;
}

impl MergeSource for RunCursor<'_> {
    fn peek(&self) -> Option<&RunRecord> {
        RunCursor::peek(self)
    }

    fn take_current(&mut self) -> Option<RunRecord> {
        RunCursor::take_current(self)
    }

    fn advance(&mut self) -> io::Result<()> {
        RunCursor::advance(self)
    }
}

/// Open one cursor per segment of a run, carving read-ahead caches from
/// `slab` when Phase 2 runs off a single pre-allocated buffer.
pub fn open_cursors<'a>(
    run: &RunIndex,
    cache_size: usize,
    slab: Option<&'a mut [u8]>,
) -> io::Result<Vec<RunCursor<'a>>> {
    let mut cursors = Vec::with_capacity(run.segments.len());
    match slab {
        Some(slab) => {
            let mut rest = slab;
            for segment in &run.segments {
                let (cache, tail) = rest.split_at_mut(cache_size);
                rest = tail;
                cursors.push(RunCursor::open_with_cache(
                    &run.path,
                    *segment,
                    CacheBuf::Slab(cache),
                )?);
            }
        }
        None => {
            for segment in &run.segments {
                cursors.push(RunCursor::open(&run.path, *segment, cache_size)?);
            }
        }
    }
    Ok(cursors)
}

// ============================================================================
// KWayMerge — manual min-heap over (key, indexID)
// ============================================================================

/// Heap entry: the ordering fields of a stream's current record.
struct HeapEntry {
    key: Vec<u8>,
    index_id: u32,
    stream_idx: usize,
}

/// K-way merge over sorted record streams.
pub struct KWayMerge<T: MergeSource> {
    heap: Vec<HeapEntry>,
    streams: Vec<T>,
}

impl<T: MergeSource> KWayMerge<T> {
    /// Seed the heap with the first record of every non-empty stream.
    pub fn new(streams: Vec<T>) -> Self {
        let mut heap = Vec::with_capacity(streams.len());
        for (idx, stream) in streams.iter().enumerate() {
            if let Some(rec) = stream.peek() {
                heap.push(HeapEntry {
                    key: rec.key.clone(),
                    index_id: rec.index_id,
                    stream_idx: idx,
                });
            }
        }
        let mut merge = Self { heap, streams };
        if merge.heap.len() > 1 {
            let last_internal = merge.heap.len() / 2 - 1;
            for i in (0..=last_internal).rev() {
                merge.sift_down(i);
            }
        }
        merge
    }

    #[inline]
    fn heap_less(&self, i: usize, j: usize) -> bool {
        let (a, b) = (&self.heap[i], &self.heap[j]);
        (a.key.as_slice(), a.index_id, a.stream_idx) < (b.key.as_slice(), b.index_id, b.stream_idx)
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && self.heap_less(right, left) {
                smallest = right;
            }
            if !self.heap_less(smallest, pos) {
                break;
            }
            self.heap.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.heap_less(pos, parent) {
                break;
            }
            self.heap.swap(pos, parent);
            pos = parent;
        }
    }

    fn heap_pop(&mut self) -> Option<HeapEntry> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let entry = self.heap.pop();
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        entry
    }

    fn heap_push(&mut self, entry: HeapEntry) {
        self.heap.push(entry);
        self.sift_up(self.heap.len() - 1);
    }

    /// Pop the next record in global `(key, indexID)` order.
    pub fn next_record(&mut self) -> io::Result<Option<RunRecord>> {
        let Some(entry) = self.heap_pop() else {
            return Ok(None);
        };
        let idx = entry.stream_idx;
        let record = self.streams[idx]
            .take_current()
            .expect("heap entry without a current record");
        self.streams[idx].advance()?;
        if let Some(next) = self.streams[idx].peek() {
            self.heap_push(HeapEntry {
                key: next.key.clone(),
                index_id: next.index_id,
                stream_idx: idx,
            });
        }
        Ok(Some(record))
    }

    pub fn is_exhausted(&self) -> bool {
        self.heap.is_empty()
    }
}

// ============================================================================
// Duplicate aggregation
// ============================================================================

/// Merge iterator that collapses consecutive records sharing
/// `(key, indexID)` into one aggregated record.
pub struct AggregatedMerge<T: MergeSource> {
    merge: KWayMerge<T>,
}

impl<T: MergeSource> AggregatedMerge<T> {
    pub fn new(streams: Vec<T>) -> Self {
        Self {
            merge: KWayMerge::new(streams),
        }
    }

    /// Next aggregated record: insert/delete ID vectors merged, sorted,
    /// deduplicated; the undefined flags OR-ed.
    pub fn next_group(&mut self) -> io::Result<Option<RunRecord>> {
        let Some(mut acc) = self.merge.next_record()? else {
            return Ok(None);
        };
        loop {
            let same = match self.merge.heap.first() {
                Some(top) => top.key == acc.key && top.index_id == acc.index_id,
                None => false,
            };
            if !same {
                break;
            }
            let dup = self
                .merge
                .next_record()?
                .expect("heap reported a pending duplicate");
            merge_ids(&mut acc.insert, dup.insert);
            merge_ids(&mut acc.delete, dup.delete);
        }
        finalize_ids(&mut acc.insert);
        finalize_ids(&mut acc.delete);
        Ok(Some(acc))
    }
}

fn merge_ids(into: &mut RecordIds, from: RecordIds) {
    into.undefined |= from.undefined;
    into.ids.extend(from.ids);
}

fn finalize_ids(ids: &mut RecordIds) {
    ids.ids.sort_unstable();
    ids.ids.dedup();
}

// ============================================================================
// Store loading
// ============================================================================

/// Merge one non-naming run into its target indexes and delete the run
/// file on success.
pub fn merge_run_into_store(
    run: &RunIndex,
    cursors: Vec<RunCursor<'_>>,
    table: &IndexTable,
    progress: &MergeProgress,
    cancel: &AtomicBool,
) -> Result<()> {
    let mut merge = AggregatedMerge::new(cursors);
    while let Some(record) = merge.next_group()? {
        if cancel.load(Ordering::Relaxed) {
            return Err(ImportError::Cancelled);
        }
        progress.add_bytes(record_weight(&record));
        flush_record(&record, table.index(record.index_id).as_ref())?;
        progress.incr_keys();
    }
    std::fs::remove_file(&run.path)?;
    progress.finish();
    tracing::info!(index = %run.index_key, "index merge complete");
    Ok(())
}

/// Bulk-load one aggregated record: deletes first, then inserts, so a key
/// removed and re-added within one import nets to the insert.
fn flush_record(record: &RunRecord, index: &dyn IndexStore) -> Result<()> {
    let limit = index.entry_limit();
    let maintain = index.maintain_count();
    let delete = to_idset(&record.delete, limit, maintain);
    if !delete.is_empty() {
        index.delete(&record.key, &delete)?;
    }
    let insert = to_idset(&record.insert, limit, maintain);
    if !insert.is_empty() {
        index.insert(&record.key, &insert)?;
    }
    Ok(())
}

fn to_idset(ids: &RecordIds, limit: usize, maintain_count: bool) -> IdSet {
    if ids.undefined {
        return IdSet::undefined(ids.ids.len() as u64, limit, maintain_count);
    }
    let mut set = IdSet::new(limit, maintain_count);
    for &id in &ids.ids {
        set.add(EntryId::new(id));
    }
    set
}

/// Approximate encoded size of a record, for progress accounting.
fn record_weight(record: &RunRecord) -> u64 {
    (16 + record.key.len() + 8 * (record.insert.ids.len() + record.delete.ids.len())) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_file::{write_record, RunSegment};
    use std::fs::File;
    use std::io::{BufWriter, Write};
    use std::path::Path;

    fn ids_bytes(ids: &[u64]) -> Vec<u8> {
        let mut out = Vec::new();
        for id in ids {
            out.extend_from_slice(&id.to_be_bytes());
        }
        out
    }

    /// Write records (already sorted per segment) and return the segments.
    fn write_segments(
        path: &Path,
        segments: &[Vec<(u32, &[u8], Vec<u64>, Vec<u64>)>],
    ) -> Vec<RunSegment> {
        let mut w = BufWriter::new(File::create(path).unwrap());
        let mut offset = 0u64;
        let mut out = Vec::new();
        for records in segments {
            let begin = offset;
            for (index_id, key, ins, del) in records {
                offset +=
                    write_record(&mut w, *index_id, key, &ids_bytes(ins), &ids_bytes(del))
                        .unwrap();
            }
            out.push(RunSegment { begin, end: offset });
        }
        w.flush().unwrap();
        out
    }

    fn open_all(path: &Path, segments: &[RunSegment]) -> Vec<RunCursor<'static>> {
        segments
            .iter()
            .map(|s| RunCursor::open(path, *s, 256).unwrap())
            .collect()
    }

    #[test]
    fn test_kway_merge_global_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.run");
        let segments = write_segments(
            &path,
            &[
                vec![
                    (1, b"a".as_slice(), vec![1], vec![]),
                    (1, b"c", vec![3], vec![]),
                ],
                vec![(1, b"b", vec![2], vec![]), (2, b"b", vec![4], vec![])],
                vec![(1, b"a", vec![5], vec![])],
            ],
        );

        let mut merge = KWayMerge::new(open_all(&path, &segments));
        let mut seen = Vec::new();
        while let Some(rec) = merge.next_record().unwrap() {
            seen.push((rec.key.clone(), rec.index_id));
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 1),
                (b"a".to_vec(), 1),
                (b"b".to_vec(), 1),
                (b"b".to_vec(), 2),
                (b"c".to_vec(), 1),
            ]
        );
        assert!(merge.is_exhausted());
    }

    #[test]
    fn test_aggregation_merges_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agg.run");
        let segments = write_segments(
            &path,
            &[
                vec![(1, b"k".as_slice(), vec![1, 3], vec![9])],
                vec![(1, b"k", vec![2, 3], vec![])],
                vec![(2, b"k", vec![7], vec![])],
            ],
        );

        let mut merge = AggregatedMerge::new(open_all(&path, &segments));
        let group = merge.next_group().unwrap().unwrap();
        assert_eq!(group.key, b"k");
        assert_eq!(group.index_id, 1);
        assert_eq!(group.insert.ids, vec![1, 2, 3]);
        assert_eq!(group.delete.ids, vec![9]);

        let group = merge.next_group().unwrap().unwrap();
        assert_eq!(group.index_id, 2);
        assert_eq!(group.insert.ids, vec![7]);

        assert!(merge.next_group().unwrap().is_none());
    }

    #[test]
    fn test_empty_streams() {
        let merge: KWayMerge<RunCursor<'_>> = KWayMerge::new(Vec::new());
        assert!(merge.is_exhausted());
    }
}
