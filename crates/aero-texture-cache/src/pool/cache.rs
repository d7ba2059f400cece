use lru::LruCache;
use tracing::debug;

use crate::cache::TextureCache;

/// A pool kind the [`PoolCache`] can hold.
pub trait CachedPool: Sized {
    fn create(cache: &mut TextureCache, address: u64, maximum_id: u32) -> Self;
    fn address(&self) -> u64;
    fn dispose(self, cache: &mut TextureCache);
}

#[derive(Debug)]
struct Entry<P> {
    pool: P,
    last_used: u64,
}

/// Keeps the few most recently used pools of one kind alive, keyed by guest address.
///
/// Pools past the capacity are only disposed once they went unused for a minimum number of
/// ticks, so two pools the guest alternates between every frame are not rebuilt each time.
#[derive(Debug)]
pub struct PoolCache<P> {
    pools: LruCache<u64, Entry<P>>,
    capacity: usize,
    min_ticks_before_removal: u64,
    timestamp: u64,
}

impl<P: CachedPool> PoolCache<P> {
    pub fn new(capacity: usize, min_ticks_before_removal: u64) -> Self {
        Self {
            pools: LruCache::unbounded(),
            capacity: capacity.max(1),
            min_ticks_before_removal,
            timestamp: 0,
        }
    }

    /// A cache sized by the texture cache's configuration.
    pub fn from_config(cache: &TextureCache) -> Self {
        let config = cache.context().config();
        Self::new(
            config.pool_cache_capacity,
            config.pool_cache_min_ticks_before_removal,
        )
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn contains(&self, address: u64) -> bool {
        self.pools.contains(&address)
    }

    /// Advances the logical clock. Called once per frame or submission.
    pub fn tick(&mut self) {
        self.timestamp += 1;
    }

    /// The pool at `address`, created if it is not cached. A cached pool is returned as is even
    /// if `maximum_id` differs.
    pub fn find_or_create(
        &mut self,
        cache: &mut TextureCache,
        address: u64,
        maximum_id: u32,
    ) -> &mut P {
        self.evict(cache);

        let timestamp = self.timestamp;
        let entry = self.pools.get_or_insert_mut(address, || Entry {
            pool: P::create(cache, address, maximum_id),
            last_used: timestamp,
        });
        entry.last_used = timestamp;
        &mut entry.pool
    }

    fn evict(&mut self, cache: &mut TextureCache) {
        while self.pools.len() > self.capacity {
            let stale = self.pools.peek_lru().is_some_and(|(_, entry)| {
                self.timestamp - entry.last_used >= self.min_ticks_before_removal
            });
            if !stale {
                break;
            }
            let Some((address, entry)) = self.pools.pop_lru() else {
                break;
            };
            debug!(address, "disposing cached pool");
            entry.pool.dispose(cache);
        }
    }

    /// Disposes every pool.
    pub fn dispose(mut self, cache: &mut TextureCache) {
        while let Some((_, entry)) = self.pools.pop_lru() {
            entry.pool.dispose(cache);
        }
    }
}
