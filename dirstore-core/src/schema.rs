//! Attribute index configuration and key derivation.
//!
//! The [`IndexerRegistry`] resolves, for an (attribute, index-kind) pair,
//! the set of byte-string keys an entry contributes to that index. Kinds
//! are dispatched through a single match on [`IndexKind`] rather than an
//! indexer object per kind; the presence of a configured kind determines
//! whether records are emitted at all.

use crate::entry::Entry;
use crate::index::{IndexKey, IndexKind};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// The single key under which presence is recorded.
pub const PRESENCE_KEY: &[u8] = b"+";

/// Default substring key length.
pub const DEFAULT_SUBSTRING_LEN: usize = 6;

/// Which index kinds are maintained for one attribute.
#[derive(Debug, Clone, Default)]
pub struct AttributeIndexSpec {
    pub equality: bool,
    pub presence: bool,
    /// Substring indexing with the given fixed key length.
    pub substring: Option<usize>,
    pub ordering: bool,
    pub approximate: bool,
    pub ext_substring: bool,
    pub ext_shared: bool,
}

impl AttributeIndexSpec {
    /// Equality + presence, the common default for looked-up attributes.
    pub fn eq_presence() -> Self {
        Self {
            equality: true,
            presence: true,
            ..Self::default()
        }
    }

    pub fn with_substring(mut self, key_len: usize) -> Self {
        self.substring = Some(key_len);
        self
    }

    pub fn with_ordering(mut self) -> Self {
        self.ordering = true;
        self
    }

    pub fn with_approximate(mut self) -> Self {
        self.approximate = true;
        self
    }
}

/// Per-attribute index configuration for one backend.
#[derive(Debug, Clone, Default)]
pub struct IndexerRegistry {
    attrs: FxHashMap<String, AttributeIndexSpec>,
}

impl IndexerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the index spec for an attribute.
    pub fn register(&mut self, attr: &str, spec: AttributeIndexSpec) {
        self.attrs.insert(attr.to_ascii_lowercase(), spec);
    }

    pub fn spec(&self, attr: &str) -> Option<&AttributeIndexSpec> {
        self.attrs.get(&attr.to_ascii_lowercase())
    }

    /// All configured attribute index keys, in deterministic order.
    pub fn attribute_index_keys(&self) -> Vec<IndexKey> {
        let mut attrs: Vec<&String> = self.attrs.keys().collect();
        attrs.sort();
        let mut keys = Vec::new();
        for attr in attrs {
            let spec = &self.attrs[attr];
            if spec.equality {
                keys.push(IndexKey::new(attr, IndexKind::Equality));
            }
            if spec.presence {
                keys.push(IndexKey::new(attr, IndexKind::Presence));
            }
            if let Some(len) = spec.substring {
                keys.push(IndexKey::substring(attr, len));
            }
            if spec.ordering {
                keys.push(IndexKey::new(attr, IndexKind::Ordering));
            }
            if spec.approximate {
                keys.push(IndexKey::new(attr, IndexKind::Approximate));
            }
            if spec.ext_substring {
                keys.push(IndexKey::new(attr, IndexKind::ExtSubstring));
            }
            if spec.ext_shared {
                keys.push(IndexKey::new(attr, IndexKind::ExtShared));
            }
        }
        keys
    }

    /// Keys the entry contributes to the given index. Empty when the entry
    /// does not carry the attribute (so nothing is emitted — including for
    /// presence).
    pub fn keys_for_entry(&self, entry: &Entry, index: &IndexKey) -> BTreeSet<Vec<u8>> {
        let values = entry.attr_values(index.attr());
        let mut keys = BTreeSet::new();
        if values.is_empty() {
            return keys;
        }
        match index.kind() {
            IndexKind::Presence => {
                keys.insert(PRESENCE_KEY.to_vec());
            }
            IndexKind::Equality | IndexKind::Ordering | IndexKind::ExtShared => {
                for v in values {
                    keys.insert(normalize_value(v));
                }
            }
            IndexKind::Substring | IndexKind::ExtSubstring => {
                let len = index.substr_len().unwrap_or(DEFAULT_SUBSTRING_LEN);
                for v in values {
                    substring_keys(&normalize_value(v), len, &mut keys);
                }
            }
            IndexKind::Approximate => {
                for v in values {
                    keys.insert(approximate_key(v));
                }
            }
            // Tree-structure indexes are keyed by name/ID, not by values.
            IndexKind::Naming | IndexKind::Children | IndexKind::Subtree => {}
        }
        keys
    }
}

/// Matching-rule normalization: trim, fold ASCII case.
fn normalize_value(value: &[u8]) -> Vec<u8> {
    let trimmed = trim_ascii(value);
    trimmed.iter().map(|b| b.to_ascii_lowercase()).collect()
}

/// Approximate matching collapses internal whitespace on top of the
/// equality normalization, so near-identical spellings share a key.
fn approximate_key(value: &[u8]) -> Vec<u8> {
    let normalized = normalize_value(value);
    let mut out = Vec::with_capacity(normalized.len());
    let mut in_space = false;
    for b in normalized {
        if b.is_ascii_whitespace() {
            if !in_space && !out.is_empty() {
                out.push(b' ');
            }
            in_space = true;
        } else {
            in_space = false;
            out.push(b);
        }
    }
    while out.last() == Some(&b' ') {
        out.pop();
    }
    out
}

/// All substrings of length `key_len` (plus the shorter tails) of a value.
fn substring_keys(value: &[u8], key_len: usize, out: &mut BTreeSet<Vec<u8>>) {
    if value.is_empty() || key_len == 0 {
        return;
    }
    for start in 0..value.len() {
        let end = (start + key_len).min(value.len());
        out.insert(value[start..end].to_vec());
    }
}

fn trim_ascii(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(value.len());
    let end = value
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|p| p + 1)
        .unwrap_or(start);
    &value[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::Dn;

    fn registry() -> IndexerRegistry {
        let mut r = IndexerRegistry::new();
        r.register(
            "cn",
            AttributeIndexSpec::eq_presence()
                .with_substring(4)
                .with_approximate(),
        );
        r.register("mail", AttributeIndexSpec::eq_presence());
        r
    }

    fn entry() -> Entry {
        Entry::new(Dn::parse("a,o=x").unwrap()).with_str_attr("cn", &["Alice Smith"])
    }

    #[test]
    fn test_attribute_index_keys_deterministic() {
        let keys = registry().attribute_index_keys();
        let names: Vec<String> = keys.iter().map(|k| k.name()).collect();
        assert_eq!(
            names,
            vec![
                "cn.equality",
                "cn.presence",
                "cn.substring",
                "cn.approximate",
                "mail.equality",
                "mail.presence",
            ]
        );
    }

    #[test]
    fn test_equality_keys_normalized() {
        let keys = registry().keys_for_entry(&entry(), &IndexKey::new("cn", IndexKind::Equality));
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&b"alice smith".to_vec()));
    }

    #[test]
    fn test_presence_key_only_when_attr_present() {
        let r = registry();
        let present = r.keys_for_entry(&entry(), &IndexKey::new("cn", IndexKind::Presence));
        assert_eq!(present.len(), 1);
        assert!(present.contains(&PRESENCE_KEY.to_vec()));

        let absent = r.keys_for_entry(&entry(), &IndexKey::new("mail", IndexKind::Presence));
        assert!(absent.is_empty());
    }

    #[test]
    fn test_substring_keys() {
        let mut keys = BTreeSet::new();
        substring_keys(b"abcde", 3, &mut keys);
        let expected: BTreeSet<Vec<u8>> = [
            b"abc".to_vec(),
            b"bcd".to_vec(),
            b"cde".to_vec(),
            b"de".to_vec(),
            b"e".to_vec(),
        ]
        .into_iter()
        .collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_approximate_collapses_whitespace() {
        assert_eq!(approximate_key(b"  Alice   SMITH "), b"alice smith".to_vec());
        assert_eq!(approximate_key(b"alice smith"), b"alice smith".to_vec());
    }

    #[test]
    fn test_unconfigured_attr_has_no_spec() {
        assert!(registry().spec("sn").is_none());
        assert!(registry().spec("CN").is_some());
    }
}
