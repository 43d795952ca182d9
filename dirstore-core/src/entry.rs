//! Entries and entry identities.

use crate::dn::Dn;
use std::collections::BTreeMap;
use std::fmt;

/// 64-bit entry identity, assigned once at ingest time and monotonically
/// increasing within one import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u64);

impl EntryId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Big-endian key/value encoding of the identity.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A directory entry: a hierarchical name plus multi-valued attributes.
///
/// Produced by the external entry parser; immutable once handed to the
/// import pipeline. Attribute names are normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    dn: Dn,
    attrs: BTreeMap<String, Vec<Vec<u8>>>,
}

impl Entry {
    pub fn new(dn: Dn) -> Self {
        Self {
            dn,
            attrs: BTreeMap::new(),
        }
    }

    /// Builder-style attribute addition (values appended in order).
    pub fn with_attr(mut self, name: &str, values: &[&[u8]]) -> Self {
        let slot = self.attrs.entry(name.to_ascii_lowercase()).or_default();
        for v in values {
            slot.push(v.to_vec());
        }
        self
    }

    /// Convenience for string-valued attributes.
    pub fn with_str_attr(self, name: &str, values: &[&str]) -> Self {
        let bytes: Vec<&[u8]> = values.iter().map(|v| v.as_bytes()).collect();
        self.with_attr(name, &bytes)
    }

    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.contains_key(&name.to_ascii_lowercase())
    }

    /// Values for an attribute, empty when absent.
    pub fn attr_values(&self, name: &str) -> &[Vec<u8>] {
        self.attrs
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Attribute names present on this entry.
    pub fn attr_names(&self) -> impl Iterator<Item = &str> {
        self.attrs.keys().map(|k| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_round_trip() {
        let id = EntryId::new(0x0102_0304_0506_0708);
        assert_eq!(EntryId::from_be_bytes(id.to_be_bytes()), id);
        assert_eq!(id.to_be_bytes()[0], 0x01);
    }

    #[test]
    fn test_entry_attrs() {
        let e = Entry::new(Dn::parse("a,o=x").unwrap())
            .with_str_attr("CN", &["Alice"])
            .with_str_attr("mail", &["a@x", "alice@x"]);
        assert!(e.has_attr("cn"));
        assert!(e.has_attr("Mail"));
        assert!(!e.has_attr("sn"));
        assert_eq!(e.attr_values("mail").len(), 2);
        assert_eq!(e.attr_values("cn")[0], b"Alice");
        assert!(e.attr_values("sn").is_empty());
    }
}
