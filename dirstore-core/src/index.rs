//! Index identification.
//!
//! An [`IndexKey`] names one on-disk index within a suffix: the pair of an
//! attribute and an [`IndexKind`]. Equality and hashing use both fields —
//! the substring key-length hint is carried for key derivation but does not
//! participate in identity.

use std::fmt;
use std::hash::{Hash, Hasher};

/// The kinds of index the import pipeline can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKind {
    /// Name → EntryID map, sorted so descendants follow ancestors.
    Naming,
    /// Parent EntryID → immediate-child ID set.
    Children,
    /// Ancestor EntryID → descendant ID set.
    Subtree,
    Equality,
    Presence,
    Substring,
    Ordering,
    Approximate,
    ExtSubstring,
    ExtShared,
}

impl IndexKind {
    /// Stable lowercase label, used in index and run-file names.
    pub fn label(self) -> &'static str {
        match self {
            IndexKind::Naming => "naming",
            IndexKind::Children => "children",
            IndexKind::Subtree => "subtree",
            IndexKind::Equality => "equality",
            IndexKind::Presence => "presence",
            IndexKind::Substring => "substring",
            IndexKind::Ordering => "ordering",
            IndexKind::Approximate => "approximate",
            IndexKind::ExtSubstring => "ex_substring",
            IndexKind::ExtShared => "ex_shared",
        }
    }
}

/// Identifier for one (attribute, index-kind) stream.
#[derive(Debug, Clone)]
pub struct IndexKey {
    attr: String,
    kind: IndexKind,
    /// Fixed key length hint for substring indexes.
    substr_len: Option<usize>,
}

/// Attribute name used for the three tree-structure indexes.
const DN_ATTR: &str = "dn";

impl IndexKey {
    pub fn new(attr: &str, kind: IndexKind) -> Self {
        Self {
            attr: attr.to_ascii_lowercase(),
            kind,
            substr_len: None,
        }
    }

    /// Substring index key carrying its fixed key-length hint.
    pub fn substring(attr: &str, key_len: usize) -> Self {
        Self {
            attr: attr.to_ascii_lowercase(),
            kind: IndexKind::Substring,
            substr_len: Some(key_len),
        }
    }

    pub fn naming() -> Self {
        Self::new(DN_ATTR, IndexKind::Naming)
    }

    pub fn children() -> Self {
        Self::new(DN_ATTR, IndexKind::Children)
    }

    pub fn subtree() -> Self {
        Self::new(DN_ATTR, IndexKind::Subtree)
    }

    pub fn attr(&self) -> &str {
        &self.attr
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn substr_len(&self) -> Option<usize> {
        self.substr_len
    }

    /// Filesystem-safe stream name: `"<attr>.<kind>"`. Used as the run
    /// file's name and in log output.
    pub fn name(&self) -> String {
        format!("{}.{}", self.attr, self.kind.label())
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.attr == other.attr && self.kind == other.kind
    }
}

impl Eq for IndexKey {}

impl Hash for IndexKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.attr.hash(state);
        self.kind.hash(state);
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(k: &IndexKey) -> u64 {
        let mut h = DefaultHasher::new();
        k.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_name() {
        assert_eq!(IndexKey::new("cn", IndexKind::Equality).name(), "cn.equality");
        assert_eq!(IndexKey::naming().name(), "dn.naming");
        assert_eq!(IndexKey::substring("mail", 6).name(), "mail.substring");
    }

    #[test]
    fn test_identity_ignores_substr_len() {
        let a = IndexKey::substring("mail", 6);
        let b = IndexKey::substring("mail", 4);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let c = IndexKey::new("mail", IndexKind::Equality);
        assert_ne!(a, c);
    }

    #[test]
    fn test_attr_case_folded() {
        assert_eq!(
            IndexKey::new("CN", IndexKind::Equality),
            IndexKey::new("cn", IndexKind::Equality)
        );
    }
}
