use tracing::{debug, warn};

use super::{CachedPool, ResourcePool, SamplerCreateInfo, SamplerDescriptor};
use crate::backend::HostSamplerId;
use crate::cache::TextureCache;

/// A host sampler built from a guest descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct Sampler {
    host: HostSamplerId,
    info: SamplerCreateInfo,
}

impl Sampler {
    pub fn host(&self) -> HostSamplerId {
        self.host
    }

    pub fn info(&self) -> &SamplerCreateInfo {
        &self.info
    }
}

/// A guest sampler descriptor table.
#[derive(Debug)]
pub struct SamplerPool {
    pool: ResourcePool<SamplerDescriptor, Sampler>,
    /// Anisotropy override the live samplers were created with.
    forced_anisotropy: Option<f32>,
}

impl SamplerPool {
    pub fn new(cache: &mut TextureCache, address: u64, maximum_id: u32) -> Self {
        Self {
            pool: ResourcePool::new(cache.physical().clone(), address, maximum_id),
            forced_anisotropy: cache.context().config().max_anisotropy,
        }
    }

    pub fn address(&self) -> u64 {
        self.pool.address()
    }

    pub fn maximum_id(&self) -> u32 {
        self.pool.maximum_id()
    }

    /// The sampler for slot `id`, created on first use.
    ///
    /// Once per batch of GPU work the pool drops samplers whose descriptors changed, and every
    /// sampler the forced anisotropy applies to if that setting changed.
    pub fn get(&mut self, cache: &mut TextureCache, id: u32) -> Option<&Sampler> {
        if !self.pool.contains(id) {
            warn!(id, maximum_id = self.pool.maximum_id(), "sampler pool id out of range");
            return None;
        }

        if self.pool.needs_sync(cache.context().sequence_number()) {
            let forced = cache.context().config().max_anisotropy;
            if forced != self.forced_anisotropy {
                self.forced_anisotropy = forced;
                self.purge_anisotropic(cache);
            }
            self.synchronize_memory(cache);
        }

        let index = id as usize;
        if self.pool.items.get(index).is_some_and(Option::is_none) {
            let descriptor = self.pool.read_descriptor(id);
            let caps_max = cache.context().capabilities().max_anisotropy;
            let info = descriptor.create_info(self.forced_anisotropy, caps_max);
            let host = cache.renderer().create_sampler(&info);
            if let Some(item) = self.pool.items.get_mut(index) {
                *item = Some(Sampler { host, info });
            }
            if let Some(cached) = self.pool.descriptor_cache.get_mut(index) {
                *cached = descriptor;
            }
        }
        self.pool.items.get(index).and_then(Option::as_ref)
    }

    /// Increases each time a descriptor change or anisotropy purge was detected.
    pub fn check_modified(&mut self, cache: &mut TextureCache) -> u64 {
        if self.pool.needs_sync(cache.context().sequence_number()) {
            self.synchronize_memory(cache);
        }
        self.pool.modified_sequence()
    }

    fn synchronize_memory(&mut self, cache: &mut TextureCache) {
        for slots in self.pool.modified_slots() {
            for id in slots {
                if self.pool.items.get(id as usize).is_some_and(Option::is_some)
                    && self.pool.descriptor_changed(id)
                {
                    self.release(cache, id);
                }
            }
        }
    }

    /// Drops every live sampler the forced anisotropy applies to, so the next use recreates it.
    fn purge_anisotropic(&mut self, cache: &mut TextureCache) {
        let mut purged = 0usize;
        for id in 0..self.pool.items.len() as u32 {
            let applies = self.pool.items[id as usize].is_some()
                && self.pool.read_descriptor(id).accepts_forced_anisotropy();
            if applies {
                self.release(cache, id);
                purged += 1;
            }
        }
        debug!(purged, forced = ?self.forced_anisotropy, "forced anisotropy changed");
        self.pool.bump_modified_sequence();
    }

    fn release(&mut self, cache: &mut TextureCache, id: u32) {
        if let Some(sampler) = self.pool.items.get_mut(id as usize).and_then(Option::take) {
            cache.renderer().release_sampler(sampler.host);
        }
    }

    pub fn dispose(mut self, cache: &mut TextureCache) {
        for id in 0..self.pool.items.len() as u32 {
            self.release(cache, id);
        }
    }
}

impl CachedPool for SamplerPool {
    fn create(cache: &mut TextureCache, address: u64, maximum_id: u32) -> Self {
        Self::new(cache, address, maximum_id)
    }

    fn address(&self) -> u64 {
        self.pool.address()
    }

    fn dispose(self, cache: &mut TextureCache) {
        SamplerPool::dispose(self, cache);
    }
}
