//! Entry source contract.
//!
//! The textual parser lives outside this crate; the import engine only
//! needs a shared stream of decoded entries that the worker pool can
//! contend over.

use crate::error::Result;
use dirstore_core::Entry;
use std::collections::VecDeque;
use std::sync::Mutex;

/// A shared, contended stream of decoded entries.
///
/// `next_entry` is called concurrently from every import worker; an
/// implementation hands out each entry exactly once and returns `None`
/// at end of stream.
pub trait EntrySource: Send + Sync {
    fn next_entry(&self) -> Result<Option<Entry>>;

    /// Entries the source itself skipped (filtered or unparseable input).
    fn entries_ignored(&self) -> u64 {
        0
    }
}

/// Entry source backed by an in-memory queue.
pub struct VecEntrySource {
    entries: Mutex<VecDeque<Entry>>,
}

impl VecEntrySource {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            entries: Mutex::new(entries.into()),
        }
    }
}

impl EntrySource for VecEntrySource {
    fn next_entry(&self) -> Result<Option<Entry>> {
        Ok(self.entries.lock().expect("entry source poisoned").pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirstore_core::Dn;

    #[test]
    fn test_vec_source_drains_once() {
        let source = VecEntrySource::new(vec![
            Entry::new(Dn::parse("a,o=x").unwrap()),
            Entry::new(Dn::parse("b,o=x").unwrap()),
        ]);
        assert!(source.next_entry().unwrap().is_some());
        assert!(source.next_entry().unwrap().is_some());
        assert!(source.next_entry().unwrap().is_none());
    }
}
