//! The texture cache: every live texture, group and handle, plus the index that finds them by
//! guest physical address.
//!
//! Lookups and all mutation happen on the GPU thread through `&mut TextureCache`. The range
//! index and the partially-mapped set are shared with [`unmap::UnmapHandler`], which the page
//! table calls from whatever thread changes a mapping; it only reads the index and queues work
//! that [`TextureCache::process_pending_unmaps`] applies later.

mod find;
mod unmap;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hashbrown::HashSet;
use slotmap::SlotMap;
use tracing::{debug, trace};

use crate::auto_delete::AutoDeleteCache;
use crate::backend::HostRenderer;
use crate::context::{GpuContext, HostSyncFlags};
use crate::convert::FormatConverter;
use crate::error::Result;
use crate::group::{DependencyGraph, HandleSnapshot, TextureGroup, TextureGroupHandle};
use crate::memory::{GpuVirtualMemory, MemoryRange, MultiRange, PhysicalMemory};
use crate::pool::{PoolRequestQueue, TextureDescriptor};
use crate::range_index::RangeIndex;
use crate::stats::{CacheStats, CacheStatsSnapshot};
use crate::texture::Texture;
use crate::{GroupId, HandleId, PoolId, TextureId};

pub use find::{CopySurface, RenderTarget};

use unmap::{UnmapHandler, UnmapWork};

/// State reachable from the unmap listener.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    index: RwLock<RangeIndex<TextureId>>,
    partially_mapped: Mutex<HashSet<TextureId>>,
    pending: Mutex<VecDeque<UnmapWork>>,
}

impl SharedState {
    fn index(&self) -> RwLockReadGuard<'_, RangeIndex<TextureId>> {
        match self.index.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn index_mut(&self) -> RwLockWriteGuard<'_, RangeIndex<TextureId>> {
        match self.index.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn partially_mapped(&self) -> MutexGuard<'_, HashSet<TextureId>> {
        match self.partially_mapped.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<UnmapWork>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Host copies of guest textures, kept coherent with guest memory.
pub struct TextureCache {
    pub(crate) ctx: GpuContext,
    pub(crate) physical: PhysicalMemory,
    vm: Arc<dyn GpuVirtualMemory>,

    pub(crate) textures: SlotMap<TextureId, Texture>,
    pub(crate) groups: SlotMap<GroupId, TextureGroup>,
    pub(crate) handles: SlotMap<HandleId, TextureGroupHandle>,
    pub(crate) dependencies: DependencyGraph<HandleId>,

    pub(crate) auto_delete: AutoDeleteCache,
    pub(crate) converter: Option<Box<dyn FormatConverter>>,
    pub(crate) pools: SlotMap<PoolId, Arc<PoolRequestQueue>>,
    /// Last tracking owner handed to a group.
    pub(crate) next_owner: u64,
    pub(crate) stats: Arc<CacheStats>,

    shared: Arc<SharedState>,
}

impl fmt::Debug for TextureCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextureCache")
            .field("ctx", &self.ctx)
            .field("textures", &self.textures.len())
            .field("groups", &self.groups.len())
            .field("handles", &self.handles.len())
            .field("auto_delete", &self.auto_delete.len())
            .field("pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}

impl TextureCache {
    /// A cache for textures mapped through `vm` into `physical`.
    ///
    /// Registers an unmap listener with `vm`; unmaps reported from other threads are applied
    /// at the start of the next lookup or [`Self::tick`].
    pub fn new(ctx: GpuContext, physical: PhysicalMemory, vm: Arc<dyn GpuVirtualMemory>) -> Self {
        let config = ctx.config();
        let budget = config.auto_delete_budget(ctx.capabilities().total_memory);
        let auto_delete = AutoDeleteCache::new(
            config.auto_delete_max_count,
            config.auto_delete_min_count,
            budget,
        );
        debug!(budget, max_count = config.auto_delete_max_count, "texture cache created");

        let shared = Arc::new(SharedState::default());
        vm.add_unmap_listener(Arc::new(UnmapHandler::new(shared.clone())));

        Self {
            ctx,
            physical,
            vm,
            textures: SlotMap::with_key(),
            groups: SlotMap::with_key(),
            handles: SlotMap::with_key(),
            dependencies: DependencyGraph::new(),
            auto_delete,
            converter: None,
            pools: SlotMap::with_key(),
            next_owner: 0,
            stats: Arc::new(CacheStats::new()),
            shared,
        }
    }

    /// Installs the decoder used for compressed formats the host cannot sample.
    pub fn set_format_converter(&mut self, converter: impl FormatConverter + 'static) {
        self.converter = Some(Box::new(converter));
    }

    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut GpuContext {
        &mut self.ctx
    }

    pub fn physical(&self) -> &PhysicalMemory {
        &self.physical
    }

    pub(crate) fn renderer(&mut self) -> &mut dyn HostRenderer {
        self.ctx.renderer()
    }

    pub fn texture(&self, id: TextureId) -> Option<&Texture> {
        self.textures.get(id)
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Number of textures owned by the auto-delete cache.
    pub fn auto_delete_len(&self) -> usize {
        self.auto_delete.len()
    }

    pub fn is_partially_mapped(&self, id: TextureId) -> bool {
        self.shared.partially_mapped().contains(&id)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// The live counters, for readers on other threads.
    pub fn stats_handle(&self) -> Arc<CacheStats> {
        self.stats.clone()
    }

    /// Keeps `id` alive until a matching [`Self::release`].
    pub fn retain(&mut self, id: TextureId) {
        self.texture_inc_ref(id);
    }

    /// Drops a reference taken with [`Self::retain`]. Returns whether no references are left.
    pub fn release(&mut self, id: TextureId) -> bool {
        self.texture_dec_ref(id)
    }

    /// Loads guest memory changes into the texture.
    pub fn synchronize_memory(&mut self, id: TextureId) {
        self.process_pending_unmaps();
        self.texture_synchronize_memory(id);
    }

    /// Records a GPU write to the texture.
    pub fn signal_modified(&mut self, id: TextureId) {
        self.texture_signal_modified(id);
    }

    /// The texture was bound as a render target (`bound`) or unbound again.
    pub fn signal_modifying(&mut self, id: TextureId, bound: bool) {
        self.texture_signal_modifying(id, bound);
    }

    /// Replaces the texture's host data with `data`, packed level-major.
    pub fn set_data(&mut self, id: TextureId, data: &[u8]) -> Result<()> {
        self.texture_set_data(id, data)
    }

    /// Writes GPU-modified data back to guest memory. Returns whether anything was written.
    pub fn flush_modified(&mut self, id: TextureId) -> bool {
        self.texture_flush_modified(id, true)
    }

    /// Whether the guest wrote the texture's memory since it was last loaded.
    pub fn check_modified(&mut self, id: TextureId) -> bool {
        self.texture_check_modified(id, false)
    }

    /// The caller overwrites the whole texture; pending loads and copies are dropped.
    pub fn discard_data(&mut self, id: TextureId) {
        self.texture_discard_data(id);
    }

    /// Moves the texture to the most recently used end of the auto-delete cache.
    pub fn lift(&mut self, id: TextureId) {
        self.auto_delete.lift(id);
    }

    /// The tracking handles of the texture's group.
    pub fn handles(&self, id: TextureId) -> Vec<HandleSnapshot> {
        let Some(group) = self.textures.get(id).and_then(|t| t.group) else {
            return Vec::new();
        };
        self.group_handles(group)
            .into_iter()
            .filter_map(|handle| self.handle_snapshot(handle))
            .collect()
    }

    /// Whether every copy dependency edge has its reverse.
    pub fn dependency_graph_is_symmetric(&self) -> bool {
        self.dependencies.check_symmetry()
    }

    pub fn copy_dependency_count(&self) -> usize {
        self.dependencies.edge_count()
    }

    /// Inserts a host fence if handles are waiting for one, or always with
    /// [`HostSyncFlags::FORCE`].
    ///
    /// Handles modified since the previous fence stage their data for the guest first; once the
    /// fence exists they register a flush action so a guest read waits only for it.
    pub fn create_host_sync(&mut self, flags: HostSyncFlags) {
        if !flags.contains(HostSyncFlags::FORCE) && !self.ctx.has_sync_actions() {
            return;
        }
        let syncpoint = flags.contains(HostSyncFlags::SYNCPOINT);
        let actions = self.ctx.take_sync_actions();
        for &handle in &actions {
            self.handle_sync_pre_action(handle, syncpoint);
        }

        let sync = self.ctx.signal_sync();
        trace!(sync, actions = actions.len(), "host sync created");

        let kept = actions
            .into_iter()
            .filter(|&handle| !self.handle_sync_action(handle, syncpoint))
            .collect();
        self.ctx.restore_sync_actions(kept);
    }

    /// The guest is about to access `[address, address + size)`: flushes every GPU-modified
    /// handle whose watchpoint in that range asked for it.
    pub fn flush_for_guest_access(&mut self, address: u64, size: u64) {
        if !self.physical.has_pending_actions(address, size) {
            return;
        }
        let access = MemoryRange::new(address, size);
        let overlaps = self.shared.index().find_overlaps_at(address, size);

        let mut groups = Vec::new();
        for texture in overlaps {
            if let Some(group) = self.textures.get(texture).and_then(|t| t.group) {
                if !groups.contains(&group) {
                    groups.push(group);
                }
            }
        }
        for group in groups {
            for handle in self.group_handles(group) {
                let wants_flush = self.handles.get(handle).is_some_and(|h| {
                    h.action_registered && h.regions.iter().any(|r| r.range().overlaps(&access))
                });
                if wants_flush {
                    self.group_flush_action(handle);
                }
            }
        }
    }

    /// Ages the short cache and applies queued unmaps. Called once per frame.
    pub fn tick(&mut self) {
        self.process_pending_unmaps();
        for expired in self.auto_delete.process_short_cache() {
            if expired.auto_delete && self.auto_delete.remove(expired.texture) {
                self.texture_dec_ref(expired.texture);
            }
            self.texture_dec_ref(expired.texture);
        }
    }

    /// Registers a texture pool; the queue carries the cache's requests for it.
    pub(crate) fn register_pool(&mut self) -> (PoolId, Arc<PoolRequestQueue>) {
        let queue = Arc::new(PoolRequestQueue::default());
        let id = self.pools.insert(queue.clone());
        (id, queue)
    }

    pub(crate) fn unregister_pool(&mut self, id: PoolId) {
        self.pools.remove(id);
    }

    pub(crate) fn find_short_cache(&mut self, descriptor: &TextureDescriptor) -> Option<TextureId> {
        let textures = &self.textures;
        self.auto_delete
            .find_short_cache(descriptor, |id| textures.get(id).map(|t| t.invalidated_sequence))
    }

    pub(crate) fn add_short_cache(&mut self, texture: TextureId, descriptor: TextureDescriptor) {
        let Some(sequence) = self.textures.get(texture).map(|t| t.invalidated_sequence) else {
            return;
        };
        if self.auto_delete.add_short_cache(texture, descriptor, sequence) {
            self.texture_inc_ref(texture);
        }
    }

    /// Adds a texture not owned by a pool to the auto-delete cache, evicting what no longer fits.
    pub(crate) fn auto_delete_add(&mut self, id: TextureId) {
        let Some(size) = self.textures.get(id).map(Texture::size) else {
            return;
        };
        let mut evicted = Vec::new();
        if self.auto_delete.add(id, size, &mut evicted) {
            self.texture_inc_ref(id);
        }
        for texture in evicted {
            self.auto_delete_evict(texture);
        }
    }

    /// Drops the auto-delete cache's reference to an evicted texture, writing back GPU data the
    /// guest has not overwritten.
    fn auto_delete_evict(&mut self, id: TextureId) {
        if !self.texture_check_modified(id, false) {
            if let Some(group) = self.textures.get(id).and_then(|t| t.group) {
                self.group_synchronize_dependents(group, id);
            }
            self.texture_flush_modified(id, false);
        }
        debug!(?id, "evicting texture from auto-delete cache");
        self.stats.inc_evictions();
        self.texture_dec_ref(id);
    }

    /// Takes the texture out of the auto-delete cache, optionally flushing it first.
    pub(crate) fn auto_delete_remove(&mut self, id: TextureId, flush: bool) {
        if !self.auto_delete.remove(id) {
            return;
        }
        if flush {
            self.texture_flush_modified(id, false);
        }
        self.texture_dec_ref(id);
    }

    /// Whether a pool may keep `id` across a remap: a storage texture nothing else depends on.
    pub(crate) fn is_remappable_storage(&self, id: TextureId) -> bool {
        let Some(tex) = self.textures.get(id) else {
            return false;
        };
        let copies = tex
            .group
            .and_then(|g| self.groups.get(g))
            .is_some_and(|g| g.has_copy_dependencies);
        tex.view_storage.is_none() && tex.views.is_empty() && !copies
    }

    pub(crate) fn gpu_physical_regions(&self, address: u64, size: u64) -> MultiRange {
        self.vm.physical_regions(address, size)
    }

    /// Resolves the texture's footprint at GPU address `address` and records whether parts of
    /// it are unmapped.
    pub(crate) fn update_partially_mapped(&mut self, address: u64, id: TextureId) -> MultiRange {
        let size = self.textures.get(id).map_or(0, Texture::size);
        let range = self.vm.physical_regions(address, size);
        let mut partially_mapped = self.shared.partially_mapped();
        if range.has_unmapped() {
            partially_mapped.insert(id);
        } else {
            partially_mapped.remove(&id);
        }
        range
    }

    fn add_to_index(&mut self, id: TextureId) {
        let Some(tex) = self.textures.get(id) else {
            return;
        };
        self.shared.index_mut().insert(id, &tex.range);
        if tex.range.has_unmapped() {
            self.shared.partially_mapped().insert(id);
        }
    }

    pub(crate) fn remove_from_index(&mut self, id: TextureId) {
        self.shared.index_mut().remove(&id);
        self.shared.partially_mapped().remove(&id);
    }

    pub(crate) fn index_overlaps(&self, range: &MultiRange) -> Vec<TextureId> {
        self.shared.index().find_overlaps(range)
    }

    pub(crate) fn index_overlaps_at(&self, address: u64, size: u64) -> Vec<TextureId> {
        self.shared.index().find_overlaps_at(address, size)
    }

    pub fn is_indexed(&self, id: TextureId) -> bool {
        self.shared.index().contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareRenderer;
    use crate::compat::TextureSearchFlags;
    use crate::config::TextureCacheConfig;
    use crate::format::Format;
    use crate::info::TextureInfo;
    use crate::memory::{PageTable, VecGuestMemory};
    use pretty_assertions::assert_eq;

    fn cache() -> (TextureCache, Arc<PageTable>) {
        let vm = Arc::new(PageTable::new());
        vm.map(0x10_0000, 0x1_0000, 0x10_0000);
        let physical = PhysicalMemory::new(VecGuestMemory::new(0x20_0000));
        let ctx = GpuContext::new(SoftwareRenderer::new(), TextureCacheConfig::default());
        (TextureCache::new(ctx, physical, vm.clone()), vm)
    }

    fn info(width: u32, height: u32) -> TextureInfo {
        TextureInfo {
            gpu_address: 0x10_0000,
            width,
            height,
            format_info: Format::R8G8B8A8Unorm.info(),
            ..TextureInfo::default()
        }
    }

    #[test]
    fn released_textures_leave_the_index() {
        let (mut cache, _vm) = cache();
        let id = cache
            .find_or_create_texture(TextureSearchFlags::FOR_SAMPLER, &info(64, 64), 0)
            .unwrap();
        cache.retain(id);
        assert!(cache.is_indexed(id));
        assert_eq!(cache.auto_delete_len(), 0);

        assert!(cache.release(id));
        assert!(!cache.is_indexed(id));
        assert!(cache.texture(id).is_none());
        assert_eq!(cache.texture_count(), 0);
    }

    #[test]
    fn forced_host_sync_advances_the_sync_number() {
        let (mut cache, _vm) = cache();
        cache.create_host_sync(HostSyncFlags::empty());
        assert_eq!(cache.context().sync_number(), 0);
        cache.create_host_sync(HostSyncFlags::FORCE);
        assert_eq!(cache.context().sync_number(), 1);
    }

    #[test]
    fn short_cache_reference_expires_after_two_ticks() {
        let (mut cache, _vm) = cache();
        let id = cache
            .find_or_create_texture(TextureSearchFlags::FOR_SAMPLER, &info(64, 64), 0)
            .unwrap();
        let descriptor = TextureDescriptor::default().with_address(0x10_0000);
        cache.add_short_cache(id, descriptor);
        assert_eq!(cache.texture(id).map(Texture::reference_count), Some(1));
        assert_eq!(cache.find_short_cache(&descriptor), Some(id));

        cache.tick();
        assert!(cache.texture(id).is_some());
        cache.tick();
        assert!(cache.texture(id).is_none());
    }
}
