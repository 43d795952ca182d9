//! Hierarchical entry names.
//!
//! A [`Dn`] is a sequence of name components written leaf-first
//! (`"cn=c,ou=b,o=x"` names the entry `cn=c` under `ou=b` under the root
//! `o=x`). Components are normalized on parse: surrounding whitespace is
//! trimmed and ASCII case is folded.
//!
//! ## Sorted-name encoding
//!
//! [`Dn::sorted_bytes`] encodes a name as its components in root-first order
//! joined by a `0x00` separator. Under plain byte order this makes every
//! descendant key sort immediately after its ancestor: the ancestor's
//! encoding is a strict prefix of the descendant's, followed by the
//! separator, which is lower than any component byte. The bulk importer and
//! the naming index rely on this: one byte-lexicographic comparator serves
//! every index, and a subtree occupies the contiguous key range
//! `[key, subtree_end(key))`.

use crate::error::{CoreError, Result};
use std::fmt;

/// Separator byte between components in the sorted-name encoding.
const COMPONENT_SEPARATOR: u8 = 0x00;

/// A normalized hierarchical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dn {
    /// Components in leaf-first order (as written).
    components: Vec<String>,
}

impl Dn {
    /// Parse and normalize a name from its textual form.
    ///
    /// Empty input yields an error; so does any empty component
    /// (`"a,,o=x"`).
    pub fn parse(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Err(CoreError::InvalidName("empty name".into()));
        }
        let mut components = Vec::new();
        for raw in s.split(',') {
            let c = normalize_component(raw);
            if c.is_empty() {
                return Err(CoreError::InvalidName(format!(
                    "empty component in {:?}",
                    s
                )));
            }
            components.push(c);
        }
        Ok(Self { components })
    }

    /// Components in leaf-first order.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Number of components.
    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    /// The parent name (all components but the leaf), or `None` for a
    /// single-component name.
    pub fn parent(&self) -> Option<Dn> {
        if self.components.len() <= 1 {
            return None;
        }
        Some(Dn {
            components: self.components[1..].to_vec(),
        })
    }

    /// The parent name, restricted to descendants of `base`.
    ///
    /// Returns `None` when `self` *is* `base`, or when the parent would sit
    /// at or above `base` without being it. The base itself is a valid
    /// parent: `parent_within_base` of a direct child of `base` is `base`.
    pub fn parent_within_base(&self, base: &Dn) -> Option<Dn> {
        if self == base {
            return None;
        }
        let parent = self.parent()?;
        if &parent == base || base.is_ancestor_of(&parent) {
            Some(parent)
        } else {
            None
        }
    }

    /// True when `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &Dn) -> bool {
        let n = self.components.len();
        let m = other.components.len();
        m > n && other.components[m - n..] == self.components[..]
    }

    /// True when `other` equals `self` or sits below it.
    pub fn is_ancestor_or_equal(&self, other: &Dn) -> bool {
        self == other || self.is_ancestor_of(other)
    }

    /// Encode as a sorted-name key (root-first, `0x00`-separated).
    pub fn sorted_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for (i, c) in self.components.iter().rev().enumerate() {
            if i > 0 {
                out.push(COMPONENT_SEPARATOR);
            }
            out.extend_from_slice(c.as_bytes());
        }
        out
    }

    /// Decode a sorted-name key produced by [`Dn::sorted_bytes`].
    pub fn from_sorted_bytes(bytes: &[u8]) -> Result<Dn> {
        if bytes.is_empty() {
            return Err(CoreError::CorruptValue("empty name key".into()));
        }
        let mut components = Vec::new();
        for part in bytes.split(|b| *b == COMPONENT_SEPARATOR) {
            let s = std::str::from_utf8(part)
                .map_err(|e| CoreError::CorruptValue(format!("name key not UTF-8: {}", e)))?;
            if s.is_empty() {
                return Err(CoreError::CorruptValue("empty component in name key".into()));
            }
            components.push(s.to_string());
        }
        components.reverse();
        Ok(Dn { components })
    }

    fn byte_len(&self) -> usize {
        self.components.iter().map(|c| c.len() + 1).sum::<usize>()
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.components.join(","))
    }
}

impl PartialOrd for Dn {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Hierarchical order: ancestors sort before their descendants, siblings
/// sort by component. Matches byte order on [`Dn::sorted_bytes`].
impl Ord for Dn {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sorted_bytes().cmp(&other.sorted_bytes())
    }
}

/// First key past the subtree rooted at the given sorted-name key.
///
/// Descendant keys are `key · 0x00 · ...`, so the subtree (root included)
/// is exactly the range `[key, key · 0x01)`.
pub fn subtree_end(sorted_key: &[u8]) -> Vec<u8> {
    let mut end = Vec::with_capacity(sorted_key.len() + 1);
    end.extend_from_slice(sorted_key);
    end.push(COMPONENT_SEPARATOR + 1);
    end
}

/// True when `key` lies inside the subtree rooted at `root_key`
/// (root included), both in sorted-name encoding.
pub fn key_in_subtree(key: &[u8], root_key: &[u8]) -> bool {
    key == root_key
        || (key.len() > root_key.len()
            && key.starts_with(root_key)
            && key[root_key.len()] == COMPONENT_SEPARATOR)
}

fn normalize_component(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    #[test]
    fn test_parse_normalizes() {
        let d = dn("  CN=Alice , ou=People,o=X ");
        assert_eq!(d.to_string(), "cn=alice,ou=people,o=x");
        assert_eq!(d.num_components(), 3);
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(Dn::parse("").is_err());
        assert!(Dn::parse("a,,o=x").is_err());
    }

    #[test]
    fn test_parent() {
        assert_eq!(dn("a,b,o=x").parent(), Some(dn("b,o=x")));
        assert_eq!(dn("o=x").parent(), None);
    }

    #[test]
    fn test_parent_within_base() {
        let base = dn("o=x");
        assert_eq!(dn("a,b,o=x").parent_within_base(&base), Some(dn("b,o=x")));
        assert_eq!(dn("a,o=x").parent_within_base(&base), Some(dn("o=x")));
        assert_eq!(dn("o=x").parent_within_base(&base), None);
        // Parent would sit outside the base.
        assert_eq!(dn("a,o=y").parent_within_base(&base), None);
    }

    #[test]
    fn test_ancestor() {
        assert!(dn("o=x").is_ancestor_of(&dn("a,o=x")));
        assert!(dn("o=x").is_ancestor_of(&dn("c,b,o=x")));
        assert!(!dn("o=x").is_ancestor_of(&dn("o=x")));
        assert!(!dn("b,o=x").is_ancestor_of(&dn("a,o=x")));
        assert!(dn("o=x").is_ancestor_or_equal(&dn("o=x")));
    }

    #[test]
    fn test_sorted_bytes_round_trip() {
        for s in ["o=x", "a,o=x", "cn=c,ou=b,o=x"] {
            let d = dn(s);
            let key = d.sorted_bytes();
            assert_eq!(Dn::from_sorted_bytes(&key).unwrap(), d);
        }
    }

    #[test]
    fn test_sorted_bytes_hierarchical_order() {
        // Descendants must sort after their ancestor and before the next
        // sibling of the ancestor.
        let root = dn("o=x").sorted_bytes();
        let a = dn("a,o=x").sorted_bytes();
        let ca = dn("c,a,o=x").sorted_bytes();
        let b = dn("b,o=x").sorted_bytes();
        let other = dn("o=y").sorted_bytes();

        assert!(root < a);
        assert!(a < ca);
        assert!(ca < b);
        assert!(b < other);
    }

    #[test]
    fn test_subtree_range() {
        let a = dn("a,o=x").sorted_bytes();
        let end = subtree_end(&a);

        assert!(key_in_subtree(&a, &a));
        assert!(key_in_subtree(&dn("c,a,o=x").sorted_bytes(), &a));
        assert!(!key_in_subtree(&dn("b,o=x").sorted_bytes(), &a));
        // "ab,o=x" shares a byte prefix with "a,o=x" but is not a descendant.
        assert!(!key_in_subtree(&dn("ab,o=x").sorted_bytes(), &a));

        assert!(dn("c,a,o=x").sorted_bytes() < end);
        assert!(dn("b,o=x").sorted_bytes() >= end);
    }

    #[test]
    fn test_dn_ord_matches_key_order() {
        let mut names = vec![dn("b,o=x"), dn("o=x"), dn("c,a,o=x"), dn("a,o=x")];
        names.sort();
        let rendered: Vec<String> = names.iter().map(|d| d.to_string()).collect();
        assert_eq!(rendered, vec!["o=x", "a,o=x", "c,a,o=x", "b,o=x"]);
    }
}
