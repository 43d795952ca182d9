//! Store contracts consumed by the bulk importer.
//!
//! The importer treats the transactional key-value store as an external
//! collaborator behind these traits. The store is assumed exclusive to the
//! importing process for the duration of a load; none of these operations
//! promise isolation against concurrent external writers.

use crate::dn::Dn;
use crate::entry::{Entry, EntryId};
use crate::error::Result;
use crate::idset::IdSet;
use crate::index::IndexKey;
use crate::schema::IndexerRegistry;
use std::sync::Arc;

/// Forward cursor over an index's sorted key space.
pub trait IndexCursor: Send {
    /// Next `(key, raw value)` pair, or `None` at the end.
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>>;

    /// Reposition at the first key `>= key`.
    fn seek(&mut self, key: &[u8]) -> Result<()>;
}

/// One physical index within a container.
///
/// Posting-list indexes store [`IdSet`] values under `insert`/`delete`;
/// the naming index stores a single 8-byte big-endian [`EntryId`] under
/// `put_id`. An index is "trusted" when the store promises it is
/// internally consistent; rebuilt indexes stay untrusted until the import
/// commits.
pub trait IndexStore: Send + Sync {
    fn name(&self) -> String;

    /// Posting-list entry limit `L` for this index.
    fn entry_limit(&self) -> usize;

    /// Whether UNDEFINED posting lists keep a member count.
    fn maintain_count(&self) -> bool;

    /// Merge the IDs into the posting list at `key`.
    fn insert(&self, key: &[u8], ids: &IdSet) -> Result<()>;

    /// Remove the IDs from the posting list at `key`.
    fn delete(&self, key: &[u8], ids: &IdSet) -> Result<()>;

    /// Naming-index put. Returns `false` (and stores nothing) when the key
    /// is already present.
    fn put_id(&self, key: &[u8], id: EntryId) -> Result<bool>;

    /// Naming-index overwrite, used by the merge phase which has already
    /// collapsed duplicates.
    fn put_id_raw(&self, key: &[u8], id: EntryId) -> Result<()>;

    /// Naming-index lookup.
    fn get_id(&self, key: &[u8]) -> Result<Option<EntryId>>;

    /// Posting-list lookup.
    fn get_ids(&self, key: &[u8]) -> Result<Option<IdSet>>;

    fn cursor(&self) -> Result<Box<dyn IndexCursor>>;

    fn key_count(&self) -> usize;

    fn set_trusted(&self, trusted: bool);

    fn is_trusted(&self) -> bool;
}

/// One suffix's storage: the tree-structure indexes, the configured
/// attribute indexes, and the entry bodies.
pub trait Container: Send + Sync {
    /// Base name this container owns.
    fn base(&self) -> &Dn;

    /// Storage name (the canonical prefix, or a temporary name for shadow
    /// containers).
    fn name(&self) -> String;

    /// Rename, used when a shadow container is promoted on import success.
    fn set_name(&self, name: &str);

    fn naming_index(&self) -> Arc<dyn IndexStore>;
    fn children_index(&self) -> Arc<dyn IndexStore>;
    fn subtree_index(&self) -> Arc<dyn IndexStore>;

    fn attribute_index(&self, key: &IndexKey) -> Option<Arc<dyn IndexStore>>;

    /// The attribute index keys this container maintains.
    fn attribute_index_keys(&self) -> Vec<IndexKey>;

    fn put_entry(&self, id: EntryId, entry: &Entry) -> Result<()>;
    fn get_entry(&self, id: EntryId) -> Result<Option<Entry>>;
    fn entry_count(&self) -> usize;

    /// Drop all entries and index contents.
    fn clear(&self) -> Result<()>;

    /// Mark every index of this container trusted or untrusted.
    fn set_indexes_trusted(&self, trusted: bool) -> Result<()>;

    fn lock(&self);
    fn unlock(&self);
}

/// Backend environment statistics surfaced in progress reports. Backends
/// without telemetry return the default (all zero).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub cache_misses: u64,
    pub eviction_passes: u64,
    pub cleaner_runs: u64,
    pub checkpoints: u64,
}

/// The store itself: a registry of containers keyed by base name.
pub trait Backend: Send + Sync {
    /// The container registered for a base name.
    fn container(&self, base: &Dn) -> Option<Arc<dyn Container>>;

    /// Every registered container.
    fn containers(&self) -> Vec<Arc<dyn Container>>;

    /// Open (creating if needed) a container under an explicit storage
    /// name, with attribute indexes drawn from the registry. Does not
    /// register it.
    fn open_container(
        &self,
        base: &Dn,
        name: &str,
        registry: &IndexerRegistry,
    ) -> Result<Arc<dyn Container>>;

    fn register_container(&self, base: &Dn, container: Arc<dyn Container>);

    /// Unregister and return the container for a base, if any.
    fn unregister_container(&self, base: &Dn) -> Option<Arc<dyn Container>>;

    /// Destroy a container's storage by name.
    fn delete_container(&self, name: &str) -> Result<()>;

    /// Environment telemetry for progress reporting.
    fn stats(&self) -> BackendStats {
        BackendStats::default()
    }
}
