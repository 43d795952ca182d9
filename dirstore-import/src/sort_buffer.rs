//! Bounded append-then-sort record buffers and the shared free pool.
//!
//! A [`SortBuffer`] holds records as packed fixed-size slots plus a key-byte
//! tail, accounted against a byte capacity. Buffers cycle through three
//! states: filled by one worker (append), sorted by the sort executor, then
//! drained by a spill-run writer, after which they are reset and returned to
//! the [`BufferPool`]. Buffers are never allocated on the hot path.
//!
//! A zero-capacity "poison" buffer signals end-of-stream (to spill writers)
//! and abort (to workers pulling from the free pool).

use crate::error::{ImportError, Result};
use dirstore_core::IndexKey;
use std::cmp::Ordering;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

/// Accounting size of one record slot (id + offsets + tag + op).
pub const SLOT_BYTES: usize = 24;

/// Insert or delete of one (key, entryID) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOp {
    Insert,
    Delete,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    index_id: u32,
    key_off: u32,
    key_len: u32,
    entry_id: u64,
    op: RecordOp,
}

/// One record as seen through a sorted buffer's cursor.
#[derive(Debug, Clone, Copy)]
pub struct BufferRecord<'a> {
    pub index_id: u32,
    pub key: &'a [u8],
    pub entry_id: u64,
    pub op: RecordOp,
}

/// Fixed-capacity append-then-sort buffer.
pub struct SortBuffer {
    capacity: usize,
    slots: Vec<Slot>,
    keys: Vec<u8>,
    index_key: Option<IndexKey>,
    sorted: bool,
}

impl SortBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::new(),
            keys: Vec::new(),
            index_key: None,
            sorted: false,
        }
    }

    /// End-of-stream / abort marker.
    pub fn poison() -> Self {
        Self::with_capacity(0)
    }

    pub fn is_poison(&self) -> bool {
        self.capacity == 0
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn used_bytes(&self) -> usize {
        self.slots.len() * SLOT_BYTES + self.keys.len()
    }

    /// Whether one more record with this key still fits.
    pub fn space_available(&self, key_len: usize) -> bool {
        self.used_bytes() + SLOT_BYTES + key_len <= self.capacity
    }

    /// Append a record. Returns `false` when the buffer is full (the caller
    /// hands the buffer to the sort executor and retries on a fresh one).
    pub fn put(&mut self, index_id: u32, key: &[u8], entry_id: u64, op: RecordOp) -> bool {
        debug_assert!(!self.sorted, "append into a sorted buffer");
        if !self.space_available(key.len()) {
            return false;
        }
        let key_off = self.keys.len() as u32;
        self.keys.extend_from_slice(key);
        self.slots.push(Slot {
            index_id,
            key_off,
            key_len: key.len() as u32,
            entry_id,
            op,
        });
        true
    }

    /// Tag the buffer with the index stream it belongs to. Set by the owner
    /// before handing the buffer downstream; the sort executor routes on it.
    pub fn set_index_key(&mut self, key: IndexKey) {
        self.index_key = Some(key);
    }

    pub fn index_key(&self) -> Option<&IndexKey> {
        self.index_key.as_ref()
    }

    fn key_of(&self, slot: &Slot) -> &[u8] {
        let start = slot.key_off as usize;
        &self.keys[start..start + slot.key_len as usize]
    }

    /// Sort records into non-decreasing `(key, indexID, entryID)` order.
    pub fn sort(&mut self) {
        let keys = std::mem::take(&mut self.keys);
        self.slots.sort_unstable_by(|a, b| {
            let ka = &keys[a.key_off as usize..(a.key_off + a.key_len) as usize];
            let kb = &keys[b.key_off as usize..(b.key_off + b.key_len) as usize];
            match ka.cmp(kb) {
                Ordering::Equal => (a.index_id, a.entry_id).cmp(&(b.index_id, b.entry_id)),
                other => other,
            }
        });
        self.keys = keys;
        self.sorted = true;
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// The record at position `i` (meaningful order only after `sort`).
    pub fn record(&self, i: usize) -> BufferRecord<'_> {
        let slot = &self.slots[i];
        BufferRecord {
            index_id: slot.index_id,
            key: self.key_of(slot),
            entry_id: slot.entry_id,
            op: slot.op,
        }
    }

    /// Return the buffer to its pristine appendable state for reuse.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.keys.clear();
        self.index_key = None;
        self.sorted = false;
    }
}

/// Multi-producer multi-consumer free-buffer pool.
///
/// Pulling a poison buffer means the import is being aborted; the puller
/// re-arms the poison so every other blocked worker wakes too.
pub struct BufferPool {
    tx: Sender<SortBuffer>,
    rx: Mutex<Receiver<SortBuffer>>,
}

impl BufferPool {
    /// Pool pre-filled with `count` buffers of `buffer_size` bytes.
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let (tx, rx) = channel();
        for _ in 0..count {
            tx.send(SortBuffer::with_capacity(buffer_size))
                .expect("pool receiver alive");
        }
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Block until a free buffer is available.
    ///
    /// Errors with [`ImportError::Cancelled`] when a poison buffer is
    /// drawn (abort in progress).
    pub fn take(&self) -> Result<SortBuffer> {
        let buf = self
            .rx
            .lock()
            .expect("buffer pool poisoned")
            .recv()
            .map_err(|_| ImportError::Cancelled)?;
        if buf.is_poison() {
            // Wake the next blocked worker as well.
            self.give(buf);
            return Err(ImportError::Cancelled);
        }
        Ok(buf)
    }

    /// Return a buffer (or inject a poison marker).
    pub fn give(&self, buf: SortBuffer) {
        let _ = self.tx.send(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_until_full() {
        let mut buf = SortBuffer::with_capacity(3 * (SLOT_BYTES + 2));
        assert!(buf.put(1, b"aa", 1, RecordOp::Insert));
        assert!(buf.put(1, b"bb", 2, RecordOp::Insert));
        assert!(buf.put(1, b"cc", 3, RecordOp::Insert));
        assert!(!buf.put(1, b"dd", 4, RecordOp::Insert));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_sort_orders_by_key_then_index_then_id() {
        let mut buf = SortBuffer::with_capacity(4096);
        buf.put(2, b"b", 10, RecordOp::Insert);
        buf.put(1, b"b", 5, RecordOp::Insert);
        buf.put(1, b"a", 7, RecordOp::Delete);
        buf.put(1, b"b", 3, RecordOp::Insert);
        buf.sort();

        let seen: Vec<(Vec<u8>, u32, u64)> = (0..buf.len())
            .map(|i| {
                let r = buf.record(i);
                (r.key.to_vec(), r.index_id, r.entry_id)
            })
            .collect();
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 1, 7),
                (b"b".to_vec(), 1, 3),
                (b"b".to_vec(), 1, 5),
                (b"b".to_vec(), 2, 10),
            ]
        );
    }

    #[test]
    fn test_reset_for_reuse() {
        let mut buf = SortBuffer::with_capacity(4096);
        buf.put(1, b"key", 1, RecordOp::Insert);
        buf.set_index_key(IndexKey::naming());
        buf.sort();
        buf.reset();
        assert!(buf.is_empty());
        assert!(!buf.is_sorted());
        assert!(buf.index_key().is_none());
        assert!(buf.put(1, b"key", 2, RecordOp::Insert));
    }

    #[test]
    fn test_poison_rejects_put() {
        let mut p = SortBuffer::poison();
        assert!(p.is_poison());
        assert!(!p.put(1, b"k", 1, RecordOp::Insert));
    }

    #[test]
    fn test_pool_cycle() {
        let pool = BufferPool::new(2, 1024);
        let a = pool.take().unwrap();
        let _b = pool.take().unwrap();
        pool.give(a);
        let c = pool.take().unwrap();
        assert_eq!(c.capacity, 1024);
    }

    #[test]
    fn test_pool_poison_cancels_and_rearms() {
        let pool = BufferPool::new(1, 1024);
        let real = pool.take().unwrap();
        pool.give(SortBuffer::poison());
        assert!(matches!(pool.take(), Err(ImportError::Cancelled)));
        // Poison re-armed: a second taker is cancelled too.
        assert!(matches!(pool.take(), Err(ImportError::Cancelled)));
        drop(real);
    }
}
