//! BTreeMap-backed backend, container, and index implementations.

use dirstore_core::{
    Backend, Container, CoreError, Dn, Entry, EntryId, IdSet, IndexCursor, IndexKey,
    IndexStore, IndexerRegistry, Result,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default posting-list entry limit for freshly opened indexes.
pub const DEFAULT_ENTRY_LIMIT: usize = 4000;

// ============================================================================
// MemoryIndex
// ============================================================================

/// One sorted key space. Keys map to raw values: an 8-byte big-endian
/// entry ID for the naming index, a serialized [`IdSet`] otherwise.
pub struct MemoryIndex {
    name: String,
    entry_limit: usize,
    maintain_count: bool,
    trusted: AtomicBool,
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryIndex {
    fn new(name: String, entry_limit: usize, maintain_count: bool) -> Self {
        Self {
            name,
            entry_limit,
            maintain_count,
            trusted: AtomicBool::new(true),
            map: RwLock::new(BTreeMap::new()),
        }
    }
}

impl IndexStore for MemoryIndex {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn entry_limit(&self) -> usize {
        self.entry_limit
    }

    fn maintain_count(&self) -> bool {
        self.maintain_count
    }

    fn insert(&self, key: &[u8], ids: &IdSet) -> Result<()> {
        let mut map = self.map.write();
        match map.get(key) {
            Some(existing) => {
                let mut set =
                    IdSet::deserialize(existing, self.entry_limit, self.maintain_count)?;
                set.merge(ids);
                map.insert(key.to_vec(), set.serialize());
            }
            None => {
                map.insert(key.to_vec(), ids.serialize());
            }
        }
        Ok(())
    }

    fn delete(&self, key: &[u8], ids: &IdSet) -> Result<()> {
        let mut map = self.map.write();
        if let Some(existing) = map.get(key) {
            let mut set = IdSet::deserialize(existing, self.entry_limit, self.maintain_count)?;
            set.subtract(ids);
            if set.is_empty() {
                map.remove(key);
            } else {
                map.insert(key.to_vec(), set.serialize());
            }
        }
        Ok(())
    }

    fn put_id(&self, key: &[u8], id: EntryId) -> Result<bool> {
        let mut map = self.map.write();
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(key.to_vec(), id.to_be_bytes().to_vec());
        Ok(true)
    }

    fn put_id_raw(&self, key: &[u8], id: EntryId) -> Result<()> {
        self.map
            .write()
            .insert(key.to_vec(), id.to_be_bytes().to_vec());
        Ok(())
    }

    fn get_id(&self, key: &[u8]) -> Result<Option<EntryId>> {
        match self.map.read().get(key) {
            Some(v) => {
                let bytes: [u8; 8] = v.as_slice().try_into().map_err(|_| {
                    CoreError::CorruptValue(format!("{}: id value of {} bytes", self.name, v.len()))
                })?;
                Ok(Some(EntryId::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn get_ids(&self, key: &[u8]) -> Result<Option<IdSet>> {
        match self.map.read().get(key) {
            Some(v) => Ok(Some(IdSet::deserialize(
                v,
                self.entry_limit,
                self.maintain_count,
            )?)),
            None => Ok(None),
        }
    }

    fn cursor(&self) -> Result<Box<dyn IndexCursor>> {
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = self
            .map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(SnapshotCursor { snapshot, pos: 0 }))
    }

    fn key_count(&self) -> usize {
        self.map.read().len()
    }

    fn set_trusted(&self, trusted: bool) {
        self.trusted.store(trusted, Ordering::SeqCst);
    }

    fn is_trusted(&self) -> bool {
        self.trusted.load(Ordering::SeqCst)
    }
}

struct SnapshotCursor {
    snapshot: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
}

impl IndexCursor for SnapshotCursor {
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.pos >= self.snapshot.len() {
            return Ok(None);
        }
        let pair = self.snapshot[self.pos].clone();
        self.pos += 1;
        Ok(Some(pair))
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.pos = self
            .snapshot
            .partition_point(|(k, _)| k.as_slice() < key);
        Ok(())
    }
}

// ============================================================================
// MemoryContainer
// ============================================================================

/// One suffix's in-memory storage.
pub struct MemoryContainer {
    base: Dn,
    name: Mutex<String>,
    naming: Arc<MemoryIndex>,
    children: Arc<MemoryIndex>,
    subtree: Arc<MemoryIndex>,
    attrs: HashMap<IndexKey, Arc<MemoryIndex>>,
    entries: RwLock<BTreeMap<u64, Entry>>,
    locked: AtomicBool,
}

impl MemoryContainer {
    fn new(base: Dn, name: String, registry: &IndexerRegistry, entry_limit: usize) -> Self {
        let mk = |key: &IndexKey| {
            Arc::new(MemoryIndex::new(
                format!("{}/{}", name, key.name()),
                entry_limit,
                true,
            ))
        };
        let mut attrs = HashMap::new();
        for key in registry.attribute_index_keys() {
            let index = mk(&key);
            attrs.insert(key, index);
        }
        Self {
            naming: mk(&IndexKey::naming()),
            children: mk(&IndexKey::children()),
            subtree: mk(&IndexKey::subtree()),
            attrs,
            base,
            name: Mutex::new(name),
            entries: RwLock::new(BTreeMap::new()),
            locked: AtomicBool::new(false),
        }
    }

    fn all_indexes(&self) -> Vec<Arc<MemoryIndex>> {
        let mut all = vec![
            Arc::clone(&self.naming),
            Arc::clone(&self.children),
            Arc::clone(&self.subtree),
        ];
        all.extend(self.attrs.values().cloned());
        all
    }
}

impl Container for MemoryContainer {
    fn base(&self) -> &Dn {
        &self.base
    }

    fn name(&self) -> String {
        self.name.lock().clone()
    }

    fn set_name(&self, name: &str) {
        *self.name.lock() = name.to_string();
    }

    fn naming_index(&self) -> Arc<dyn IndexStore> {
        Arc::clone(&self.naming) as Arc<dyn IndexStore>
    }

    fn children_index(&self) -> Arc<dyn IndexStore> {
        Arc::clone(&self.children) as Arc<dyn IndexStore>
    }

    fn subtree_index(&self) -> Arc<dyn IndexStore> {
        Arc::clone(&self.subtree) as Arc<dyn IndexStore>
    }

    fn attribute_index(&self, key: &IndexKey) -> Option<Arc<dyn IndexStore>> {
        self.attrs
            .get(key)
            .map(|i| Arc::clone(i) as Arc<dyn IndexStore>)
    }

    fn attribute_index_keys(&self) -> Vec<IndexKey> {
        let mut keys: Vec<IndexKey> = self.attrs.keys().cloned().collect();
        keys.sort_by_key(|k| k.name());
        keys
    }

    fn put_entry(&self, id: EntryId, entry: &Entry) -> Result<()> {
        self.entries.write().insert(id.as_u64(), entry.clone());
        Ok(())
    }

    fn get_entry(&self, id: EntryId) -> Result<Option<Entry>> {
        Ok(self.entries.read().get(&id.as_u64()).cloned())
    }

    fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        for index in self.all_indexes() {
            index.map.write().clear();
        }
        tracing::debug!(container = %self.name(), "container cleared");
        Ok(())
    }

    fn set_indexes_trusted(&self, trusted: bool) -> Result<()> {
        for index in self.all_indexes() {
            index.set_trusted(trusted);
        }
        Ok(())
    }

    fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// MemoryBackend
// ============================================================================

/// In-memory store: containers registered by base name.
pub struct MemoryBackend {
    containers: RwLock<HashMap<Dn, Arc<MemoryContainer>>>,
    /// Containers opened but not (or no longer) registered, kept addressable
    /// by storage name so `delete_container` works on shadows.
    by_name: RwLock<HashMap<String, Arc<MemoryContainer>>>,
    entry_limit: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            by_name: RwLock::new(HashMap::new()),
            entry_limit: DEFAULT_ENTRY_LIMIT,
        }
    }

    /// Override the posting-list entry limit applied to newly opened
    /// indexes.
    pub fn with_entry_limit(mut self, limit: usize) -> Self {
        self.entry_limit = limit;
        self
    }

    /// Open and immediately register a container under its canonical name.
    pub fn create_suffix(
        &self,
        base: &Dn,
        registry: &IndexerRegistry,
    ) -> Result<Arc<dyn Container>> {
        let container = self.open_container(base, &base.to_string(), registry)?;
        self.register_container(base, Arc::clone(&container));
        Ok(container)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn container(&self, base: &Dn) -> Option<Arc<dyn Container>> {
        self.containers
            .read()
            .get(base)
            .map(|c| Arc::clone(c) as Arc<dyn Container>)
    }

    fn containers(&self) -> Vec<Arc<dyn Container>> {
        let mut all: Vec<Arc<MemoryContainer>> =
            self.containers.read().values().cloned().collect();
        all.sort_by_key(|c| c.base().sorted_bytes());
        all.into_iter()
            .map(|c| c as Arc<dyn Container>)
            .collect()
    }

    fn open_container(
        &self,
        base: &Dn,
        name: &str,
        registry: &IndexerRegistry,
    ) -> Result<Arc<dyn Container>> {
        if let Some(existing) = self.by_name.read().get(name) {
            return Ok(Arc::clone(existing) as Arc<dyn Container>);
        }
        let container = Arc::new(MemoryContainer::new(
            base.clone(),
            name.to_string(),
            registry,
            self.entry_limit,
        ));
        self.by_name
            .write()
            .insert(name.to_string(), Arc::clone(&container));
        tracing::debug!(%base, name, "container opened");
        Ok(container as Arc<dyn Container>)
    }

    fn register_container(&self, base: &Dn, container: Arc<dyn Container>) {
        // Containers handed back to a MemoryBackend are always MemoryContainers;
        // recover the concrete Arc by identity (the storage name may have
        // changed since the container was opened, e.g. a promoted shadow).
        let target = Arc::as_ptr(&container) as *const ();
        let mut by_name = self.by_name.write();
        let concrete = by_name
            .values()
            .find(|c| Arc::as_ptr(c) as *const () == target)
            .cloned()
            .expect("registering a container this backend did not open");
        by_name.retain(|_, c| Arc::as_ptr(c) as *const () != target);
        by_name.insert(container.name(), Arc::clone(&concrete));
        drop(by_name);
        self.containers.write().insert(base.clone(), concrete);
    }

    fn unregister_container(&self, base: &Dn) -> Option<Arc<dyn Container>> {
        self.containers
            .write()
            .remove(base)
            .map(|c| c as Arc<dyn Container>)
    }

    fn delete_container(&self, name: &str) -> Result<()> {
        if let Some(container) = self.by_name.write().remove(name) {
            container.clear()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirstore_core::AttributeIndexSpec;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn registry() -> IndexerRegistry {
        let mut r = IndexerRegistry::new();
        r.register("cn", AttributeIndexSpec::eq_presence());
        r
    }

    #[test]
    fn test_naming_put_and_duplicate() {
        let backend = MemoryBackend::new();
        let c = backend.create_suffix(&dn("o=x"), &registry()).unwrap();
        let naming = c.naming_index();
        let key = dn("a,o=x").sorted_bytes();

        assert!(naming.put_id(&key, EntryId::new(1)).unwrap());
        assert!(!naming.put_id(&key, EntryId::new(2)).unwrap());
        assert_eq!(naming.get_id(&key).unwrap(), Some(EntryId::new(1)));
    }

    #[test]
    fn test_posting_list_merge_on_insert() {
        let backend = MemoryBackend::new();
        let c = backend.create_suffix(&dn("o=x"), &registry()).unwrap();
        let index = c
            .attribute_index(&IndexKey::new("cn", dirstore_core::IndexKind::Equality))
            .unwrap();

        let a = IdSet::with_id(EntryId::new(1), 10, true);
        let b = IdSet::with_id(EntryId::new(2), 10, true);
        index.insert(b"alice", &a).unwrap();
        index.insert(b"alice", &b).unwrap();

        let stored = index.get_ids(b"alice").unwrap().unwrap();
        assert_eq!(stored.ids(), &[1, 2]);
    }

    #[test]
    fn test_delete_removes_ids_and_empty_keys() {
        let backend = MemoryBackend::new();
        let c = backend.create_suffix(&dn("o=x"), &registry()).unwrap();
        let index = c
            .attribute_index(&IndexKey::new("cn", dirstore_core::IndexKind::Equality))
            .unwrap();

        let mut both = IdSet::new(10, true);
        both.add(EntryId::new(1));
        both.add(EntryId::new(2));
        index.insert(b"k", &both).unwrap();

        index
            .delete(b"k", &IdSet::with_id(EntryId::new(1), 10, true))
            .unwrap();
        assert_eq!(index.get_ids(b"k").unwrap().unwrap().ids(), &[2]);

        index
            .delete(b"k", &IdSet::with_id(EntryId::new(2), 10, true))
            .unwrap();
        assert!(index.get_ids(b"k").unwrap().is_none());
        assert_eq!(index.key_count(), 0);
    }

    #[test]
    fn test_cursor_seek() {
        let backend = MemoryBackend::new();
        let c = backend.create_suffix(&dn("o=x"), &registry()).unwrap();
        let naming = c.naming_index();
        for (i, name) in ["o=x", "a,o=x", "b,o=x"].iter().enumerate() {
            naming
                .put_id(&dn(name).sorted_bytes(), EntryId::new(i as u64 + 1))
                .unwrap();
        }

        let mut cursor = naming.cursor().unwrap();
        cursor.seek(&dn("a,o=x").sorted_bytes()).unwrap();
        let (k, _) = cursor.next().unwrap().unwrap();
        assert_eq!(k, dn("a,o=x").sorted_bytes());
        let (k, _) = cursor.next().unwrap().unwrap();
        assert_eq!(k, dn("b,o=x").sorted_bytes());
        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn test_trusted_flags() {
        let backend = MemoryBackend::new();
        let c = backend.create_suffix(&dn("o=x"), &registry()).unwrap();
        c.set_indexes_trusted(false).unwrap();
        assert!(!c.naming_index().is_trusted());
        c.set_indexes_trusted(true).unwrap();
        assert!(c.naming_index().is_trusted());
    }

    #[test]
    fn test_register_swap_cycle() {
        let backend = MemoryBackend::new();
        let base = dn("o=x");
        let original = backend.create_suffix(&base, &registry()).unwrap();
        let shadow = backend
            .open_container(&base, "o=x_importtmp", &registry())
            .unwrap();

        let unregistered = backend.unregister_container(&base).unwrap();
        assert!(Arc::ptr_eq(&unregistered, &original));

        shadow.set_name("o=x");
        backend.register_container(&base, Arc::clone(&shadow));
        let now = backend.container(&base).unwrap();
        assert_eq!(now.name(), "o=x");
    }
}
