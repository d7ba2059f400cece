//! Interval index over values that occupy one or more physical ranges.

use std::collections::BTreeMap;
use std::hash::Hash;

use hashbrown::{HashMap, HashSet};

use crate::memory::{MemoryRange, MultiRange};

#[derive(Clone, Debug)]
struct Entry<V> {
    end: u64,
    value: V,
}

/// Maps physical ranges to the values living in them.
///
/// A value may be inserted with a discontiguous [`MultiRange`]; every mapped sub-range is indexed
/// separately and lookups report each value at most once. Unmapped sub-ranges are not indexed.
#[derive(Clone, Debug)]
pub struct RangeIndex<V> {
    entries: BTreeMap<(u64, u64), Entry<V>>,
    owners: HashMap<V, Vec<(u64, u64)>>,
    max_len: u64,
    next_serial: u64,
}

impl<V> Default for RangeIndex<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            owners: HashMap::new(),
            max_len: 0,
            next_serial: 0,
        }
    }
}

impl<V: Copy + Eq + Hash> RangeIndex<V> {
    pub fn contains(&self, value: &V) -> bool {
        self.owners.contains_key(value)
    }

    /// Indexes `value` at `range`, replacing any previous ranges of the same value.
    pub fn insert(&mut self, value: V, range: &MultiRange) {
        self.remove(&value);

        let mut keys = Vec::with_capacity(range.count());
        for sub in range.mapped() {
            if sub.size == 0 {
                continue;
            }
            let key = (sub.address, self.next_serial);
            self.next_serial += 1;
            self.max_len = self.max_len.max(sub.size);
            self.entries.insert(
                key,
                Entry {
                    end: sub.end_address(),
                    value,
                },
            );
            keys.push(key);
        }
        self.owners.insert(value, keys);
    }

    pub fn remove(&mut self, value: &V) -> bool {
        let Some(keys) = self.owners.remove(value) else {
            return false;
        };
        for key in keys {
            self.entries.remove(&key);
        }
        true
    }

    /// Values with at least one byte inside `[address, address + size)`.
    pub fn find_overlaps_at(&self, address: u64, size: u64) -> Vec<V> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        self.collect(MemoryRange::new(address, size.max(1)), &mut out, &mut seen);
        out
    }

    /// Values with at least one byte inside any mapped part of `range`.
    pub fn find_overlaps(&self, range: &MultiRange) -> Vec<V> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for sub in range.mapped() {
            self.collect(*sub, &mut out, &mut seen);
        }
        out
    }

    fn collect(&self, range: MemoryRange, out: &mut Vec<V>, seen: &mut HashSet<V>) {
        if range.size == 0 || self.entries.is_empty() {
            return;
        }
        let end = range.end_address();
        let low = range.address.saturating_sub(self.max_len);

        for (_, entry) in self.entries.range((low, 0)..(end, 0)) {
            if entry.end > range.address && seen.insert(entry.value) {
                out.push(entry.value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn overlap_queries_report_each_value_once() {
        let mut index = RangeIndex::default();
        index.insert(1u32, &MultiRange::single(0x1000, 0x1000));
        index.insert(
            2,
            &MultiRange::from_ranges([
                MemoryRange::new(0x1800, 0x100),
                MemoryRange::unmapped(0x100),
                MemoryRange::new(0x1a00, 0x100),
            ]),
        );
        index.insert(3, &MultiRange::single(0x4000, 0x10));

        assert_eq!(index.find_overlaps_at(0x1850, 1), vec![1, 2]);
        assert_eq!(index.find_overlaps(&MultiRange::single(0x1000, 0x4000)), vec![1, 2, 3]);
        assert_eq!(index.find_overlaps_at(0x2000, 0x2000), vec![]);
        assert_eq!(index.owners.len(), 3);
    }

    #[test]
    fn reinserting_replaces_ranges() {
        let mut index = RangeIndex::default();
        index.insert(7u32, &MultiRange::single(0x1000, 0x100));
        index.insert(7, &MultiRange::single(0x9000, 0x100));

        assert!(index.find_overlaps_at(0x1000, 0x100).is_empty());
        assert_eq!(index.find_overlaps_at(0x90ff, 1), vec![7]);
        assert!(index.remove(&7));
        assert!(!index.contains(&7));
    }
}
