//! Bounded ownership of textures nothing else references.
//!
//! The cache holds one reference per texture. It only decides *which* textures leave; the
//! texture cache flushes and releases them, since that needs the whole resource graph.

use std::num::NonZeroUsize;

use hashbrown::{HashMap, HashSet};
use lru::LruCache;

use crate::pool::TextureDescriptor;
use crate::TextureId;

#[derive(Clone, Copy, Debug)]
struct ShortCacheEntry {
    descriptor: TextureDescriptor,
    invalidated_sequence: u64,
    /// The texture was also in the main list when it entered the short cache.
    auto_delete: bool,
}

/// A short cache entry that aged out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ExpiredEntry {
    pub(crate) texture: TextureId,
    pub(crate) auto_delete: bool,
}

#[derive(Debug)]
pub(crate) struct AutoDeleteCache {
    textures: LruCache<TextureId, u64>,
    total_size: u64,
    max_count: usize,
    min_count: usize,
    budget: u64,

    short_builder: HashSet<TextureId>,
    short_active: HashSet<TextureId>,
    short_entries: HashMap<TextureId, ShortCacheEntry>,
    short_lookup: HashMap<TextureDescriptor, TextureId>,
}

impl AutoDeleteCache {
    pub(crate) fn new(max_count: usize, min_count: usize, budget: u64) -> Self {
        Self {
            textures: LruCache::unbounded(),
            total_size: 0,
            max_count: NonZeroUsize::new(max_count).map_or(1, NonZeroUsize::get),
            min_count,
            budget,
            short_builder: HashSet::new(),
            short_active: HashSet::new(),
            short_entries: HashMap::new(),
            short_lookup: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.textures.len()
    }

    pub(crate) fn contains(&self, texture: TextureId) -> bool {
        self.textures.contains(&texture)
    }

    fn over_limit(&self) -> bool {
        let count = self.textures.len();
        count > self.max_count || (self.total_size > self.budget && count > self.min_count)
    }

    /// Inserts `texture` as most recently used. Returns `false` if it was already present (it is
    /// lifted instead and the caller must not take another reference).
    ///
    /// Least recently used textures beyond the count ceiling or byte budget are appended to
    /// `evicted`; their references now belong to the caller.
    pub(crate) fn add(&mut self, texture: TextureId, size: u64, evicted: &mut Vec<TextureId>) -> bool {
        if self.textures.get(&texture).is_some() {
            return false;
        }
        self.textures.put(texture, size);
        self.total_size += size;
        self.evict(texture, evicted);
        true
    }

    /// Moves `texture` to the most recently used end. Returns whether it is cached.
    pub(crate) fn lift(&mut self, texture: TextureId) -> bool {
        self.textures.get(&texture).is_some()
    }

    fn evict(&mut self, keep: TextureId, evicted: &mut Vec<TextureId>) {
        while self.over_limit() {
            match self.textures.peek_lru() {
                Some((&oldest, _)) if oldest != keep => {}
                _ => break,
            }
            let Some((oldest, size)) = self.textures.pop_lru() else {
                break;
            };
            self.total_size -= size;
            evicted.push(oldest);
        }
    }

    /// Removes `texture`; the caller takes over its reference if this returns `true`.
    pub(crate) fn remove(&mut self, texture: TextureId) -> bool {
        match self.textures.pop(&texture) {
            Some(size) => {
                self.total_size -= size;
                true
            }
            None => false,
        }
    }

    /// The texture last used with `descriptor`, if it was not invalidated since.
    ///
    /// `invalidated_sequence` reports the texture's current invalidation count, or `None` if it
    /// no longer exists.
    pub(crate) fn find_short_cache(
        &mut self,
        descriptor: &TextureDescriptor,
        invalidated_sequence: impl FnOnce(TextureId) -> Option<u64>,
    ) -> Option<TextureId> {
        let texture = *self.short_lookup.get(descriptor)?;
        let entry = self.short_entries.get(&texture)?;
        if invalidated_sequence(texture) == Some(entry.invalidated_sequence) {
            Some(texture)
        } else {
            self.short_lookup.remove(descriptor);
            None
        }
    }

    /// Keeps `texture` alive for about two ticks under `descriptor`. Returns `true` if the caller
    /// must give the short cache a new reference.
    pub(crate) fn add_short_cache(
        &mut self,
        texture: TextureId,
        descriptor: TextureDescriptor,
        invalidated_sequence: u64,
    ) -> bool {
        let entry = ShortCacheEntry {
            descriptor,
            invalidated_sequence,
            auto_delete: self.contains(texture),
        };
        let fresh = match self.short_entries.insert(texture, entry) {
            Some(previous) => {
                self.short_active.remove(&texture);
                if self.short_lookup.get(&previous.descriptor) == Some(&texture) {
                    self.short_lookup.remove(&previous.descriptor);
                }
                false
            }
            None => true,
        };
        self.short_builder.insert(texture);
        self.short_lookup.insert(descriptor, texture);
        fresh
    }

    /// Drops `texture` from the short cache. Returns `true` if the caller must release the short
    /// cache's reference.
    pub(crate) fn remove_short_cache(&mut self, texture: TextureId) -> bool {
        let Some(entry) = self.short_entries.remove(&texture) else {
            return false;
        };
        self.short_builder.remove(&texture);
        self.short_active.remove(&texture);
        if self.short_lookup.get(&entry.descriptor) == Some(&texture) {
            self.short_lookup.remove(&entry.descriptor);
        }
        true
    }

    /// Expires the older generation and makes the current one older. Every expired texture's
    /// short cache reference belongs to the caller.
    pub(crate) fn process_short_cache(&mut self) -> Vec<ExpiredEntry> {
        let mut expired = Vec::with_capacity(self.short_active.len());
        for texture in self.short_active.drain() {
            let Some(entry) = self.short_entries.remove(&texture) else {
                continue;
            };
            if self.short_lookup.get(&entry.descriptor) == Some(&texture) {
                self.short_lookup.remove(&entry.descriptor);
            }
            expired.push(ExpiredEntry {
                texture,
                auto_delete: entry.auto_delete,
            });
        }
        std::mem::swap(&mut self.short_active, &mut self.short_builder);
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use slotmap::SlotMap;

    fn ids(n: usize) -> Vec<TextureId> {
        let mut keys: SlotMap<TextureId, ()> = SlotMap::with_key();
        (0..n).map(|_| keys.insert(())).collect()
    }

    #[test]
    fn count_ceiling_evicts_least_recently_used() {
        let t = ids(3);
        let mut cache = AutoDeleteCache::new(2, 0, u64::MAX);
        let mut evicted = Vec::new();

        assert!(cache.add(t[0], 10, &mut evicted));
        assert!(cache.add(t[1], 10, &mut evicted));
        assert!(evicted.is_empty());

        assert!(cache.add(t[2], 10, &mut evicted));
        assert_eq!(evicted, vec![t[0]]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_size, 20);
    }

    #[test]
    fn lifted_textures_survive() {
        let t = ids(3);
        let mut cache = AutoDeleteCache::new(2, 0, u64::MAX);
        let mut evicted = Vec::new();
        cache.add(t[0], 1, &mut evicted);
        cache.add(t[1], 1, &mut evicted);
        assert!(cache.lift(t[0]));
        assert!(!cache.add(t[0], 1, &mut evicted));

        cache.add(t[2], 1, &mut evicted);
        assert_eq!(evicted, vec![t[1]]);
        assert!(cache.contains(t[0]));
    }

    #[test]
    fn budget_only_applies_above_the_floor() {
        let t = ids(3);
        let mut cache = AutoDeleteCache::new(16, 2, 100);
        let mut evicted = Vec::new();
        cache.add(t[0], 80, &mut evicted);
        cache.add(t[1], 80, &mut evicted);
        assert!(evicted.is_empty());

        cache.add(t[2], 80, &mut evicted);
        assert_eq!(evicted, vec![t[0]]);
        assert!(cache.remove(t[1]));
        assert!(!cache.remove(t[1]));
        assert_eq!(cache.total_size, 80);
    }

    #[test]
    fn the_newest_texture_is_never_evicted() {
        let t = ids(1);
        let mut cache = AutoDeleteCache::new(4, 0, 10);
        let mut evicted = Vec::new();
        cache.add(t[0], 100, &mut evicted);
        assert!(evicted.is_empty());
        assert!(cache.contains(t[0]));
    }

    #[test]
    fn short_cache_entries_live_two_ticks() {
        let t = ids(1);
        let desc = TextureDescriptor::default();
        let mut cache = AutoDeleteCache::new(4, 0, u64::MAX);

        assert!(cache.add_short_cache(t[0], desc, 0));
        assert_eq!(cache.find_short_cache(&desc, |_| Some(0)), Some(t[0]));

        assert!(cache.process_short_cache().is_empty());
        assert!(cache.short_entries.contains_key(&t[0]));

        let expired = cache.process_short_cache();
        assert_eq!(
            expired,
            vec![ExpiredEntry {
                texture: t[0],
                auto_delete: false
            }]
        );
        assert_eq!(cache.find_short_cache(&desc, |_| Some(0)), None);
    }

    #[test]
    fn invalidated_short_cache_entries_miss() {
        let t = ids(1);
        let desc = TextureDescriptor::default();
        let mut cache = AutoDeleteCache::new(4, 0, u64::MAX);
        cache.add_short_cache(t[0], desc, 3);
        assert_eq!(cache.find_short_cache(&desc, |_| Some(4)), None);
        // The lookup is gone, but the reference is still held until removal.
        assert!(cache.remove_short_cache(t[0]));
        assert!(!cache.remove_short_cache(t[0]));
    }
}
