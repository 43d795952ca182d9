//! The sort executor: a bounded pool that sorts filled buffers and routes
//! them to their spill-run writer.

use crate::error::{ImportError, Result};
use crate::sort_buffer::{BufferPool, SortBuffer};
use crate::spill::SpillWriterSet;
use parking_lot::Mutex;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Pool of sorting workers, sized to the import worker count.
pub struct SortExecutor {
    tx: Option<SyncSender<SortBuffer>>,
    handles: Vec<JoinHandle<()>>,
    first_error: Arc<Mutex<Option<ImportError>>>,
}

impl SortExecutor {
    /// Spawn `threads` sorting workers feeding `writers`. `queue_cap`
    /// should cover the whole buffer pool so producers never block on a
    /// full queue.
    pub fn spawn(
        threads: usize,
        writers: Arc<SpillWriterSet>,
        pool: Arc<BufferPool>,
        queue_cap: usize,
    ) -> Result<Self> {
        let (tx, rx) = sync_channel::<SortBuffer>(queue_cap.max(threads));
        let rx = Arc::new(Mutex::new(rx));
        let first_error = Arc::new(Mutex::new(None));
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = Arc::clone(&rx);
            let writers = Arc::clone(&writers);
            let pool = Arc::clone(&pool);
            let first_error = Arc::clone(&first_error);
            let handle = std::thread::Builder::new()
                .name(format!("sort-{}", i))
                .spawn(move || sort_loop(rx, writers, pool, first_error))
                .map_err(|e| ImportError::Resource(format!("spawn sort worker: {}", e)))?;
            handles.push(handle);
        }
        Ok(Self {
            tx: Some(tx),
            handles,
            first_error,
        })
    }

    /// Hand a filled buffer to the pool. The buffer must carry its index
    /// key for routing.
    pub fn submit(&self, buf: SortBuffer) -> Result<()> {
        debug_assert!(buf.index_key().is_some() || buf.is_poison());
        self.tx
            .as_ref()
            .expect("sort executor already shut down")
            .send(buf)
            .map_err(|_| ImportError::Cancelled)
    }

    /// Close the intake, drain the queue, and join the pool.
    pub fn shutdown(mut self) -> Result<()> {
        self.tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                return Err(ImportError::TaskPanicked("sort worker".into()));
            }
        }
        match self.first_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn sort_loop(
    rx: Arc<Mutex<Receiver<SortBuffer>>>,
    writers: Arc<SpillWriterSet>,
    pool: Arc<BufferPool>,
    first_error: Arc<Mutex<Option<ImportError>>>,
) {
    loop {
        // Hold the lock only for the receive itself so sorting runs in
        // parallel across the pool.
        let mut buf = match rx.lock().recv() {
            Ok(b) => b,
            Err(_) => break,
        };
        buf.sort();
        if let Err(e) = writers.submit(buf) {
            tracing::error!(error = %e, "sort worker failed to route buffer");
            let mut slot = first_error.lock();
            if slot.is_none() {
                *slot = Some(e);
            }
            drop(slot);
            // Wake any worker blocked on the free pool so the import can
            // unwind instead of stalling.
            pool.give(SortBuffer::poison());
        }
    }
}
