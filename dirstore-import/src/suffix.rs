//! Suffix setup and the index-ID table.
//!
//! A [`Suffix`] is the loading context for one base name: the target
//! container (the original, or a shadow opened under a temporary name when
//! include branches force a partial rebuild), the optional source
//! container to migrate from, and the minimized include/exclude branch
//! sets. Index IDs are assigned here, once, before any worker starts; the
//! [`IndexTable`] mapping an ID to its store and owning container is
//! read-only afterwards.

use crate::config::ImportConfig;
use crate::error::Result;
use dirstore_core::{Backend, Container, Dn, IndexKey, IndexStore, IndexerRegistry};
use std::sync::Arc;

/// Name suffix appended to a base's canonical prefix for shadow containers.
const SHADOW_SUFFIX: &str = "_importtmp";

/// Loading context for one base name.
pub struct Suffix {
    pub base: Dn,
    /// Import target (shadow container when rebuilding include branches).
    pub container: Arc<dyn Container>,
    /// Source for migration, present only when a shadow is in use.
    pub src_container: Option<Arc<dyn Container>>,
    /// Minimized: no include is an ancestor of another.
    pub include_branches: Vec<Dn>,
    /// Restricted to branches under some include.
    pub exclude_branches: Vec<Dn>,
    pub naming_index_id: u32,
    pub children_index_id: u32,
    pub subtree_index_id: u32,
    /// Attribute index streams with their assigned IDs.
    pub attr_indexes: Vec<(IndexKey, u32)>,
}

impl Suffix {
    /// Whether this suffix imports into a shadow that must be swapped in
    /// on success.
    pub fn uses_shadow(&self) -> bool {
        self.src_container.is_some()
    }
}

/// Index-ID registry: `indexID → (store, owning container)`. Populated at
/// suffix init on the orchestrator thread; read-only during both phases.
#[derive(Default)]
pub struct IndexTable {
    indexes: Vec<Arc<dyn IndexStore>>,
    containers: Vec<Arc<dyn Container>>,
}

impl IndexTable {
    pub fn register(&mut self, store: Arc<dyn IndexStore>, container: Arc<dyn Container>) -> u32 {
        let id = self.indexes.len() as u32;
        self.indexes.push(store);
        self.containers.push(container);
        id
    }

    pub fn index(&self, id: u32) -> &Arc<dyn IndexStore> {
        &self.indexes[id as usize]
    }

    pub fn container(&self, id: u32) -> &Arc<dyn Container> {
        &self.containers[id as usize]
    }

    /// Number of registered index streams.
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

/// Build the suffix contexts for every registered container.
///
/// Per container: resolve the include/exclude branches declared against
/// it, decide between clear-in-place and shadow import, mark the target's
/// indexes untrusted, and assign index IDs.
pub fn init_suffixes(
    backend: &dyn Backend,
    registry: &IndexerRegistry,
    config: &ImportConfig,
) -> Result<(Vec<Arc<Suffix>>, IndexTable)> {
    let mut suffixes = Vec::new();
    let mut table = IndexTable::default();

    for container in backend.containers() {
        let Some(prepared) = prepare_suffix(backend, registry, config, container)? else {
            continue;
        };
        let (target, src, includes, excludes) = prepared;

        target.set_indexes_trusted(false)?;

        let naming_index_id = table.register(target.naming_index(), Arc::clone(&target));
        let children_index_id = table.register(target.children_index(), Arc::clone(&target));
        let subtree_index_id = table.register(target.subtree_index(), Arc::clone(&target));
        let mut attr_indexes = Vec::new();
        for key in target.attribute_index_keys() {
            let store = target
                .attribute_index(&key)
                .expect("container advertises an index it cannot open");
            let id = table.register(store, Arc::clone(&target));
            attr_indexes.push((key, id));
        }

        tracing::info!(
            base = %target.base(),
            includes = includes.len(),
            excludes = excludes.len(),
            shadow = src.is_some(),
            "suffix initialized"
        );
        suffixes.push(Arc::new(Suffix {
            base: target.base().clone(),
            container: target,
            src_container: src,
            include_branches: includes,
            exclude_branches: excludes,
            naming_index_id,
            children_index_id,
            subtree_index_id,
            attr_indexes,
        }));
    }
    Ok((suffixes, table))
}

type PreparedSuffix = (
    Arc<dyn Container>,
    Option<Arc<dyn Container>>,
    Vec<Dn>,
    Vec<Dn>,
);

fn prepare_suffix(
    backend: &dyn Backend,
    registry: &IndexerRegistry,
    config: &ImportConfig,
    container: Arc<dyn Container>,
) -> Result<Option<PreparedSuffix>> {
    let base = container.base().clone();

    if config.append_to_existing {
        return Ok(Some((container, None, Vec::new(), Vec::new())));
    }

    let mut includes = Vec::new();
    let mut excludes = Vec::new();

    if !config.clear_backend {
        for dn in &config.exclude_branches {
            if *dn == base {
                // The whole base is excluded from the import.
                return Ok(None);
            }
            if base.is_ancestor_of(dn) {
                excludes.push(dn.clone());
            }
        }

        if !config.include_branches.is_empty() {
            for dn in &config.include_branches {
                if base.is_ancestor_or_equal(dn) {
                    includes.push(dn.clone());
                }
            }
            if includes.is_empty() {
                // Nothing under this base is included; skip it entirely.
                return Ok(None);
            }

            minimize_includes(&mut includes);
            // Excludes outside every include would be migrated wholesale
            // anyway; only those under an include matter.
            excludes.retain(|exc| includes.iter().any(|inc| inc.is_ancestor_of(exc)));

            if includes.len() == 1 && excludes.is_empty() && includes[0] == base {
                // The whole base is rebuilt: clear in place, no shadow.
                container.lock();
                let cleared = container.clear();
                container.unlock();
                cleared?;
                return Ok(Some((container, None, includes, excludes)));
            }

            // Partial rebuild: import into a shadow, migrate the rest.
            let shadow_name = format!("{}{}", base, SHADOW_SUFFIX);
            let shadow = backend.open_container(&base, &shadow_name, registry)?;
            return Ok(Some((shadow, Some(container), includes, excludes)));
        }
    }

    // Full rebuild of this base from the entry stream.
    container.lock();
    let cleared = container.clear();
    container.unlock();
    cleared?;
    Ok(Some((container, None, includes, excludes)))
}

/// Drop any include branch that has an ancestor in the set.
fn minimize_includes(includes: &mut Vec<Dn>) {
    let snapshot = includes.clone();
    includes.retain(|inc| {
        !snapshot
            .iter()
            .any(|other| other != inc && other.is_ancestor_of(inc))
    });
}

/// Route an entry to the suffix owning the nearest ancestor base.
pub fn find_suffix<'s>(dn: &Dn, suffixes: &'s [Arc<Suffix>]) -> Option<&'s Arc<Suffix>> {
    suffixes
        .iter()
        .filter(|s| s.base.is_ancestor_or_equal(dn))
        .max_by_key(|s| s.base.num_components())
}

/// Swap each shadow container into place after a successful import.
///
/// The original container is locked, closed, and deleted; the shadow is
/// renamed to the canonical prefix under lock and re-registered. If the
/// unregistered container is not the expected source, the original is
/// restored and the swap skipped for that suffix.
pub fn switch_containers(backend: &dyn Backend, suffixes: &[Arc<Suffix>]) -> Result<()> {
    for suffix in suffixes {
        let Some(src) = &suffix.src_container else {
            continue;
        };
        let Some(unregistered) = backend.unregister_container(&suffix.base) else {
            tracing::warn!(base = %suffix.base, "no container registered at swap time");
            continue;
        };
        if !Arc::ptr_eq(&unregistered, src) {
            tracing::warn!(
                base = %suffix.base,
                "registered container changed during import; skipping swap"
            );
            backend.register_container(&suffix.base, unregistered);
            continue;
        }

        src.lock();
        let deleted = backend.delete_container(&src.name());
        src.unlock();
        deleted?;

        let target = &suffix.container;
        target.lock();
        target.set_name(&suffix.base.to_string());
        target.unlock();
        backend.register_container(&suffix.base, Arc::clone(target));
        tracing::info!(base = %suffix.base, "shadow container swapped into place");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    #[test]
    fn test_minimize_includes() {
        let mut includes = vec![dn("a,o=x"), dn("c,a,o=x"), dn("b,o=x")];
        minimize_includes(&mut includes);
        assert_eq!(includes, vec![dn("a,o=x"), dn("b,o=x")]);
    }
}
