//! Posting lists ("ID sets") with the defined/undefined spill rule.
//!
//! An [`IdSet`] is a sorted set of entry IDs bounded by a per-index entry
//! limit `L`. While the set holds at most `L` IDs it is DEFINED and stores
//! them explicitly; the moment a membership change would push it past `L`
//! it becomes UNDEFINED and keeps only a count (when count maintenance is
//! enabled). UNDEFINED is a one-way street.
//!
//! ## Wire format (big-endian)
//!
//! ```text
//! DEFINED:    len: u32 (= 8 · n)  |  id: u64 · n
//! UNDEFINED:  0xFFFF_FFFF         |  count: u64
//! ```

use crate::entry::EntryId;
use crate::error::{CoreError, Result};

/// Sentinel length marking an UNDEFINED posting list.
pub const UNDEFINED_LEN: u32 = 0xFFFF_FFFF;

/// A bounded posting list of entry IDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdSet {
    /// Strictly ascending IDs; empty once undefined.
    ids: Vec<u64>,
    undefined: bool,
    /// Element count while undefined (0 when counting is disabled).
    count: u64,
    limit: usize,
    maintain_count: bool,
}

impl IdSet {
    /// Empty DEFINED set with the given entry limit.
    pub fn new(limit: usize, maintain_count: bool) -> Self {
        Self {
            ids: Vec::new(),
            undefined: false,
            count: 0,
            limit,
            maintain_count,
        }
    }

    /// Set holding a single ID.
    pub fn with_id(id: EntryId, limit: usize, maintain_count: bool) -> Self {
        let mut set = Self::new(limit, maintain_count);
        set.add(id);
        set
    }

    /// UNDEFINED set carrying only a count.
    pub fn undefined(count: u64, limit: usize, maintain_count: bool) -> Self {
        Self {
            ids: Vec::new(),
            undefined: true,
            count: if maintain_count { count } else { 0 },
            limit,
            maintain_count,
        }
    }

    pub fn is_defined(&self) -> bool {
        !self.undefined
    }

    pub fn is_empty(&self) -> bool {
        self.is_defined() && self.ids.is_empty()
    }

    /// Member count: exact while DEFINED, the maintained count (possibly 0)
    /// once UNDEFINED.
    pub fn size(&self) -> u64 {
        if self.undefined {
            self.count
        } else {
            self.ids.len() as u64
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn maintain_count(&self) -> bool {
        self.maintain_count
    }

    /// Member IDs; empty once UNDEFINED.
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.ids.binary_search(&id.as_u64()).is_ok()
    }

    /// Add one ID. Flips to UNDEFINED when the set would exceed its limit;
    /// on an UNDEFINED set only the maintained count moves.
    pub fn add(&mut self, id: EntryId) {
        if self.undefined {
            if self.maintain_count {
                self.count += 1;
            }
            return;
        }
        let id = id.as_u64();
        match self.ids.binary_search(&id) {
            Ok(_) => {}
            Err(pos) => {
                if self.ids.len() >= self.limit {
                    self.spill(self.ids.len() as u64 + 1);
                } else {
                    self.ids.insert(pos, id);
                }
            }
        }
    }

    /// Remove one ID (no effect on an UNDEFINED set's membership; the
    /// maintained count is decremented).
    pub fn remove(&mut self, id: EntryId) {
        if self.undefined {
            if self.maintain_count {
                self.count = self.count.saturating_sub(1);
            }
            return;
        }
        if let Ok(pos) = self.ids.binary_search(&id.as_u64()) {
            self.ids.remove(pos);
        }
    }

    /// Union `other` into `self`. The result is UNDEFINED when either side
    /// is, or when the union would exceed the limit.
    pub fn merge(&mut self, other: &IdSet) {
        if self.undefined || other.undefined {
            let total = self.size() + other.size();
            self.spill(total);
            return;
        }
        let mut merged = Vec::with_capacity(self.ids.len() + other.ids.len());
        let (mut i, mut j) = (0, 0);
        while i < self.ids.len() && j < other.ids.len() {
            let (a, b) = (self.ids[i], other.ids[j]);
            if a < b {
                merged.push(a);
                i += 1;
            } else if b < a {
                merged.push(b);
                j += 1;
            } else {
                merged.push(a);
                i += 1;
                j += 1;
            }
        }
        merged.extend_from_slice(&self.ids[i..]);
        merged.extend_from_slice(&other.ids[j..]);

        if merged.len() > self.limit {
            self.spill(merged.len() as u64);
        } else {
            self.ids = merged;
        }
    }

    /// Remove every member of `other` from `self` (UNDEFINED sides keep
    /// the counts as close as they can be kept).
    pub fn subtract(&mut self, other: &IdSet) {
        if self.undefined {
            if self.maintain_count {
                self.count = self.count.saturating_sub(other.size());
            }
            return;
        }
        if other.undefined {
            // Cannot enumerate the removals; the set degrades to UNDEFINED.
            let remaining = self.size().saturating_sub(other.size());
            self.spill(remaining);
            return;
        }
        self.ids.retain(|id| other.ids.binary_search(id).is_err());
    }

    fn spill(&mut self, count: u64) {
        self.undefined = true;
        self.ids = Vec::new();
        self.count = if self.maintain_count { count } else { 0 };
    }

    /// Encode to the wire format.
    pub fn serialize(&self) -> Vec<u8> {
        if self.undefined {
            let mut out = Vec::with_capacity(12);
            out.extend_from_slice(&UNDEFINED_LEN.to_be_bytes());
            out.extend_from_slice(&self.count.to_be_bytes());
            out
        } else {
            let mut out = Vec::with_capacity(4 + self.ids.len() * 8);
            out.extend_from_slice(&((self.ids.len() * 8) as u32).to_be_bytes());
            for id in &self.ids {
                out.extend_from_slice(&id.to_be_bytes());
            }
            out
        }
    }

    /// Decode from the wire format, reproducing the original state.
    pub fn deserialize(bytes: &[u8], limit: usize, maintain_count: bool) -> Result<IdSet> {
        if bytes.len() < 4 {
            return Err(CoreError::CorruptValue("id set truncated".into()));
        }
        let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        if len == UNDEFINED_LEN {
            if bytes.len() < 12 {
                return Err(CoreError::CorruptValue(
                    "undefined id set missing count".into(),
                ));
            }
            let count = u64::from_be_bytes(bytes[4..12].try_into().unwrap());
            return Ok(IdSet::undefined(count, limit, maintain_count));
        }
        let len = len as usize;
        if len % 8 != 0 || bytes.len() < 4 + len {
            return Err(CoreError::CorruptValue(format!(
                "id set length {} does not match payload {}",
                len,
                bytes.len() - 4
            )));
        }
        let mut ids = Vec::with_capacity(len / 8);
        let mut pos = 4;
        while pos < 4 + len {
            ids.push(u64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap()));
            pos += 8;
        }
        let mut set = IdSet::new(limit, maintain_count);
        for id in ids {
            set.add(EntryId::new(id));
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> EntryId {
        EntryId::new(n)
    }

    #[test]
    fn test_add_keeps_sorted_and_dedups() {
        let mut s = IdSet::new(10, false);
        s.add(id(5));
        s.add(id(1));
        s.add(id(5));
        s.add(id(3));
        assert_eq!(s.ids(), &[1, 3, 5]);
        assert_eq!(s.size(), 3);
        assert!(s.is_defined());
    }

    #[test]
    fn test_spill_at_exact_boundary() {
        let mut s = IdSet::new(3, true);
        for n in 1..=3 {
            s.add(id(n));
        }
        assert!(s.is_defined());
        // The fourth member crosses the limit: state flips at size L+1.
        s.add(id(4));
        assert!(!s.is_defined());
        assert_eq!(s.size(), 4);
        // Never flips back.
        s.add(id(5));
        assert!(!s.is_defined());
        assert_eq!(s.size(), 5);
    }

    #[test]
    fn test_undefined_without_count_maintenance() {
        let mut s = IdSet::new(1, false);
        s.add(id(1));
        s.add(id(2));
        assert!(!s.is_defined());
        assert_eq!(s.size(), 0);
        s.add(id(3));
        assert_eq!(s.size(), 0);
    }

    #[test]
    fn test_merge_defined() {
        let mut a = IdSet::new(10, false);
        a.add(id(1));
        a.add(id(3));
        let mut b = IdSet::new(10, false);
        b.add(id(2));
        b.add(id(3));
        a.merge(&b);
        assert_eq!(a.ids(), &[1, 2, 3]);
    }

    #[test]
    fn test_merge_over_limit_goes_undefined() {
        let mut a = IdSet::new(3, true);
        a.add(id(1));
        a.add(id(2));
        let mut b = IdSet::new(3, true);
        b.add(id(3));
        b.add(id(4));
        a.merge(&b);
        assert!(!a.is_defined());
        assert_eq!(a.size(), 4);
    }

    #[test]
    fn test_merge_with_undefined_side() {
        let mut a = IdSet::new(100, true);
        a.add(id(1));
        let b = IdSet::undefined(7, 100, true);
        a.merge(&b);
        assert!(!a.is_defined());
        assert_eq!(a.size(), 8);
    }

    #[test]
    fn test_subtract() {
        let mut a = IdSet::new(10, false);
        for n in 1..=4 {
            a.add(id(n));
        }
        let mut b = IdSet::new(10, false);
        b.add(id(2));
        b.add(id(4));
        a.subtract(&b);
        assert_eq!(a.ids(), &[1, 3]);
    }

    #[test]
    fn test_serialize_round_trip_defined() {
        let mut s = IdSet::new(10, true);
        s.add(id(42));
        s.add(id(7));
        let bytes = s.serialize();
        let restored = IdSet::deserialize(&bytes, 10, true).unwrap();
        assert_eq!(restored, s);
        assert_eq!(restored.ids(), &[7, 42]);
    }

    #[test]
    fn test_serialize_round_trip_undefined() {
        let s = IdSet::undefined(99, 10, true);
        let bytes = s.serialize();
        assert_eq!(&bytes[0..4], &UNDEFINED_LEN.to_be_bytes());
        let restored = IdSet::deserialize(&bytes, 10, true).unwrap();
        assert!(!restored.is_defined());
        assert_eq!(restored.size(), 99);
    }

    #[test]
    fn test_deserialize_rejects_truncation() {
        assert!(IdSet::deserialize(&[0, 0], 10, false).is_err());
        // Claims 16 bytes of IDs, provides 8.
        let mut bytes = vec![0, 0, 0, 16];
        bytes.extend_from_slice(&1u64.to_be_bytes());
        assert!(IdSet::deserialize(&bytes, 10, false).is_err());
    }
}
