//! Spill-run writers: one thread and one temp file per index stream.
//!
//! Each writer drains a queue of *sorted* buffers. Within one buffer,
//! consecutive records sharing `(key, indexID)` are coalesced: their
//! entry IDs accumulate into an insert stream and a delete stream, and a
//! single run record is emitted on every key break. Every drained buffer
//! becomes one [`RunSegment`] so Phase 2 knows the sorted-span boundaries,
//! and the buffer itself goes back to the free pool.
//!
//! A poison buffer terminates the writer; it flushes, closes, and reports
//! its [`RunIndex`].

use crate::error::{ImportError, Result};
use crate::run_file::{write_record, RunSegment};
use crate::sort_buffer::{BufferPool, RecordOp, SortBuffer};
use dirstore_core::IndexKey;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Write-side buffering for the run file.
const WRITER_BUF_SIZE: usize = 2 * 1024 * 1024;

/// Description of one finished spill run, carried from Phase 1 to Phase 2.
#[derive(Debug)]
pub struct RunIndex {
    pub index_key: IndexKey,
    pub path: PathBuf,
    pub segments: Vec<RunSegment>,
    pub record_count: u64,
    pub file_len: u64,
}

struct WriterHandle {
    tx: SyncSender<SortBuffer>,
    handle: JoinHandle<Result<RunIndex>>,
}

/// The set of spill-run writers, created lazily per [`IndexKey`].
///
/// Writer creation is serialized (and therefore idempotent) under one
/// mutex; submission afterwards only touches the per-writer queue.
pub struct SpillWriterSet {
    temp_dir: PathBuf,
    pool: Arc<BufferPool>,
    queue_cap: usize,
    writers: Mutex<FxHashMap<IndexKey, WriterHandle>>,
}

impl SpillWriterSet {
    pub fn new(temp_dir: &Path, pool: Arc<BufferPool>, queue_cap: usize) -> Self {
        Self {
            temp_dir: temp_dir.to_path_buf(),
            pool,
            queue_cap: queue_cap.max(1),
            writers: Mutex::new(FxHashMap::default()),
        }
    }

    /// Route a sorted buffer to the writer for its index stream, creating
    /// the writer on first encounter.
    pub fn submit(&self, buf: SortBuffer) -> Result<()> {
        let index_key = buf
            .index_key()
            .cloned()
            .expect("sorted buffer submitted without an index key");
        let mut writers = self.writers.lock();
        if !writers.contains_key(&index_key) {
            let handle = self.spawn_writer(&index_key)?;
            writers.insert(index_key.clone(), handle);
        }
        let writer = writers.get(&index_key).expect("writer just inserted");
        writer.tx.send(buf).map_err(|_| {
            ImportError::Io(std::io::Error::other(format!(
                "spill writer for {} terminated early",
                index_key
            )))
        })
    }

    fn spawn_writer(&self, index_key: &IndexKey) -> Result<WriterHandle> {
        let (tx, rx) = sync_channel(self.queue_cap);
        let path = self.temp_dir.join(index_key.name());
        let pool = Arc::clone(&self.pool);
        let key = index_key.clone();
        tracing::debug!(index = %key, path = %path.display(), "spill writer started");
        let handle = std::thread::Builder::new()
            .name(format!("spill-{}", index_key.name()))
            .spawn(move || writer_loop(rx, path, key, pool))
            .map_err(|e| ImportError::Resource(format!("spawn spill writer: {}", e)))?;
        Ok(WriterHandle { tx, handle })
    }

    /// Terminate every writer (poison + join) and collect the run indexes.
    pub fn finish(&self) -> Result<Vec<RunIndex>> {
        let writers = std::mem::take(&mut *self.writers.lock());
        let mut runs = Vec::with_capacity(writers.len());
        let mut first_err = None;
        for (index_key, writer) in writers {
            let _ = writer.tx.send(SortBuffer::poison());
            match writer.handle.join() {
                Ok(Ok(run)) => runs.push(run),
                Ok(Err(e)) => first_err = first_err.or(Some(e)),
                Err(_) => {
                    first_err = first_err.or(Some(ImportError::TaskPanicked(format!(
                        "spill writer for {}",
                        index_key
                    ))))
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                runs.sort_by_key(|r| r.index_key.name());
                Ok(runs)
            }
        }
    }
}

fn writer_loop(
    rx: Receiver<SortBuffer>,
    path: PathBuf,
    index_key: IndexKey,
    pool: Arc<BufferPool>,
) -> Result<RunIndex> {
    let file = File::create(&path)?;
    let mut w = BufWriter::with_capacity(WRITER_BUF_SIZE, file);
    let mut insert_stream = Vec::new();
    let mut delete_stream = Vec::new();
    let mut segments = Vec::new();
    let mut record_count = 0u64;
    let mut offset = 0u64;

    while let Ok(mut buf) = rx.recv() {
        if buf.is_poison() {
            break;
        }
        let begin = offset;
        let (written, records) =
            write_sorted_buffer(&mut w, &buf, &mut insert_stream, &mut delete_stream)?;
        offset += written;
        record_count += records;
        segments.push(RunSegment { begin, end: offset });
        buf.reset();
        pool.give(buf);
    }

    w.flush()?;
    tracing::debug!(
        index = %index_key,
        segments = segments.len(),
        records = record_count,
        bytes = offset,
        "spill writer finished"
    );
    Ok(RunIndex {
        index_key,
        path,
        segments,
        record_count,
        file_len: offset,
    })
}

/// Emit one sorted buffer as coalesced run records. Returns the bytes
/// written and the record count.
fn write_sorted_buffer<W: Write>(
    w: &mut W,
    buf: &SortBuffer,
    insert_stream: &mut Vec<u8>,
    delete_stream: &mut Vec<u8>,
) -> std::io::Result<(u64, u64)> {
    if buf.is_empty() {
        return Ok((0, 0));
    }
    debug_assert!(buf.is_sorted());
    insert_stream.clear();
    delete_stream.clear();

    let mut written = 0u64;
    let mut records = 0u64;
    let mut head = 0usize;
    for i in 0..buf.len() {
        let rec = buf.record(i);
        let head_rec = buf.record(head);
        if i > 0 && (rec.key != head_rec.key || rec.index_id != head_rec.index_id) {
            written += write_record(
                w,
                head_rec.index_id,
                head_rec.key,
                insert_stream,
                delete_stream,
            )?;
            records += 1;
            insert_stream.clear();
            delete_stream.clear();
            head = i;
        }
        let stream = match rec.op {
            RecordOp::Insert => &mut *insert_stream,
            RecordOp::Delete => &mut *delete_stream,
        };
        stream.extend_from_slice(&rec.entry_id.to_be_bytes());
    }
    let head_rec = buf.record(head);
    written += write_record(
        w,
        head_rec.index_id,
        head_rec.key,
        insert_stream,
        delete_stream,
    )?;
    records += 1;
    Ok((written, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_file::RunCursor;
    use dirstore_core::IndexKind;

    fn sorted_buffer(records: &[(u32, &[u8], u64, RecordOp)]) -> SortBuffer {
        let mut buf = SortBuffer::with_capacity(1 << 16);
        for (index_id, key, entry_id, op) in records {
            assert!(buf.put(*index_id, key, *entry_id, *op));
        }
        buf.set_index_key(IndexKey::new("cn", IndexKind::Equality));
        buf.sort();
        buf
    }

    #[test]
    fn test_writer_coalesces_duplicate_keys() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(BufferPool::new(0, 0));
        let writers = SpillWriterSet::new(dir.path(), pool, 4);

        writers
            .submit(sorted_buffer(&[
                (1, b"alice", 3, RecordOp::Insert),
                (1, b"alice", 1, RecordOp::Insert),
                (1, b"alice", 2, RecordOp::Delete),
                (1, b"bob", 4, RecordOp::Insert),
                (2, b"bob", 5, RecordOp::Insert),
            ]))
            .unwrap();

        let runs = writers.finish().unwrap();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.segments.len(), 1);
        assert_eq!(run.record_count, 3);

        let mut cursor = RunCursor::open(&run.path, run.segments[0], 1024).unwrap();
        let rec = cursor.take_current().unwrap();
        assert_eq!(rec.key, b"alice");
        assert_eq!(rec.index_id, 1);
        assert_eq!(rec.insert.ids, vec![1, 3]);
        assert_eq!(rec.delete.ids, vec![2]);
        cursor.advance().unwrap();

        let rec = cursor.take_current().unwrap();
        assert_eq!(rec.key, b"bob");
        assert_eq!(rec.index_id, 1);
        assert_eq!(rec.insert.ids, vec![4]);
        cursor.advance().unwrap();

        let rec = cursor.take_current().unwrap();
        assert_eq!(rec.index_id, 2);
        assert_eq!(rec.insert.ids, vec![5]);
        cursor.advance().unwrap();
        assert!(cursor.is_exhausted());
    }

    #[test]
    fn test_each_buffer_is_one_segment() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(BufferPool::new(0, 0));
        let writers = SpillWriterSet::new(dir.path(), pool, 4);

        writers
            .submit(sorted_buffer(&[(1, b"a", 1, RecordOp::Insert)]))
            .unwrap();
        writers
            .submit(sorted_buffer(&[(1, b"b", 2, RecordOp::Insert)]))
            .unwrap();

        let runs = writers.finish().unwrap();
        assert_eq!(runs[0].segments.len(), 2);
        assert_eq!(runs[0].segments[0].begin, 0);
        assert_eq!(runs[0].segments[1].begin, runs[0].segments[0].end);
        assert_eq!(runs[0].file_len, runs[0].segments[1].end);
    }

    #[test]
    fn test_drained_buffers_return_to_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(BufferPool::new(0, 0));
        let writers = SpillWriterSet::new(dir.path(), Arc::clone(&pool), 4);

        writers
            .submit(sorted_buffer(&[(1, b"a", 1, RecordOp::Insert)]))
            .unwrap();
        let _ = writers.finish().unwrap();

        let recycled = pool.take().unwrap();
        assert!(recycled.is_empty());
        assert!(!recycled.is_sorted());
    }
}
