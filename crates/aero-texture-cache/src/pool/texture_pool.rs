use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, warn};

use super::{
    CachedPool, PoolRequest, PoolRequestQueue, ResourcePool, TextureDescriptor,
    TextureDescriptorType,
};
use crate::cache::TextureCache;
use crate::compat::TextureSearchFlags;
use crate::format::{Format, FormatInfo};
use crate::info::{DepthStencilMode, SwizzleComponent, Target, TextureInfo};
use crate::size::{mip_gob_block_sizes, SizeInfo};
use crate::texture::PoolOwner;
use crate::{PoolId, TextureId};

/// A guest texture descriptor table.
///
/// Each resolved slot holds one reference to its texture. The cache hands slots back through
/// a request queue when their texture is unmapped or superseded; the pool applies those
/// requests before anything else it does.
#[derive(Debug)]
pub struct TexturePool {
    id: PoolId,
    pool: ResourcePool<TextureDescriptor, TextureId>,
    requests: Arc<PoolRequestQueue>,
    /// Textures created for format reinterpretations of a slot's texture. Each holds a
    /// reference.
    alias_lists: HashMap<TextureId, Vec<(Format, TextureId)>>,
}

impl TexturePool {
    /// A pool of `maximum_id + 1` descriptors at guest physical `address`.
    pub fn new(cache: &mut TextureCache, address: u64, maximum_id: u32) -> Self {
        let (id, requests) = cache.register_pool();
        Self {
            id,
            pool: ResourcePool::new(cache.physical().clone(), address, maximum_id),
            requests,
            alias_lists: HashMap::new(),
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn address(&self) -> u64 {
        self.pool.address()
    }

    pub fn maximum_id(&self) -> u32 {
        self.pool.maximum_id()
    }

    /// The descriptor currently in guest memory for slot `id`.
    pub fn descriptor(&self, id: u32) -> Option<TextureDescriptor> {
        self.pool.contains(id).then(|| self.pool.read_descriptor(id))
    }

    /// The texture for slot `id`, synchronizing the pool first if the context started a new
    /// batch of work since it was last checked.
    pub fn get(&mut self, cache: &mut TextureCache, id: u32) -> Option<TextureId> {
        self.get_for_sampler(cache, id, true)
    }

    /// Like [`Self::get`]; a sampler without sRGB conversion sees sRGB textures through a linear
    /// format alias.
    pub fn get_for_sampler(
        &mut self,
        cache: &mut TextureCache,
        id: u32,
        srgb_sampler: bool,
    ) -> Option<TextureId> {
        if !self.pool.contains(id) {
            warn!(id, maximum_id = self.pool.maximum_id(), "texture pool id out of range");
            return None;
        }
        cache.process_pending_unmaps();
        self.synchronize_if_needed(cache);
        self.get_for_binding(cache, id, srgb_sampler)
    }

    /// The texture for slot `id`, assuming the pool was synchronized in this batch.
    pub fn get_for_binding(
        &mut self,
        cache: &mut TextureCache,
        id: u32,
        srgb_sampler: bool,
    ) -> Option<TextureId> {
        if !self.pool.contains(id) {
            return None;
        }
        if !srgb_sampler {
            let descriptor = self.pool.read_descriptor(id);
            let linear = descriptor
                .unpack_format()
                .filter(|_| descriptor.unpack_srgb())
                .and_then(|info| info.format.to_linear());
            if let Some(linear) = linear {
                return self.get_for_format(cache, id, linear);
            }
        }
        self.get_internal(cache, id)
    }

    /// The texture for slot `id` reinterpreted as `format`.
    ///
    /// Reinterpretations are kept per texture, so repeated requests return the same alias
    /// until the slot changes.
    pub fn get_for_format(
        &mut self,
        cache: &mut TextureCache,
        id: u32,
        format: Format,
    ) -> Option<TextureId> {
        let texture = self.get_internal(cache, id)?;
        let current = cache.texture(texture)?.info().format_info.format;
        if current == format {
            return Some(texture);
        }

        let existing = self
            .alias_lists
            .get(&texture)
            .and_then(|aliases| aliases.iter().find(|(f, _)| *f == format))
            .map(|&(_, alias)| alias);
        if let Some(alias) = existing {
            cache.texture_synchronize_memory(alias);
            return Some(alias);
        }

        let (info, layer_size) = texture_info(&self.pool.read_descriptor(id));
        let info = change_format(&info, format.info());
        let alias = cache.find_or_create_texture(TextureSearchFlags::FOR_SAMPLER, &info, layer_size)?;
        cache.texture_inc_ref(alias);
        self.alias_lists
            .entry(texture)
            .or_default()
            .push((format, alias));
        Some(alias)
    }

    /// Revalidates the pool if the context moved on, and returns a number that increases each
    /// time a descriptor change was detected.
    ///
    /// Remaps and removals the cache queued for this pool are applied here too, without
    /// synchronizing any texture.
    pub fn check_modified(&mut self, cache: &mut TextureCache) -> u64 {
        cache.process_pending_unmaps();
        self.process_requests(cache);
        self.synchronize_if_needed(cache);
        self.pool.modified_sequence()
    }

    fn synchronize_if_needed(&mut self, cache: &mut TextureCache) {
        if self.pool.needs_sync(cache.context().sequence_number()) {
            self.synchronize_memory(cache);
        }
    }

    /// Rechecks every slot guest writes touched since the last call.
    pub fn synchronize_memory(&mut self, cache: &mut TextureCache) {
        for slots in self.pool.modified_slots() {
            self.invalidate_slots(cache, slots);
        }
    }

    fn get_internal(&mut self, cache: &mut TextureCache, id: u32) -> Option<TextureId> {
        self.process_requests(cache);

        if let Some(&Some(texture)) = self.pool.items.get(id as usize) {
            cache.texture_synchronize_memory(texture);
            return Some(texture);
        }

        let descriptor = self.pool.read_descriptor(id);
        let texture = match cache.find_short_cache(&descriptor) {
            Some(texture) => {
                cache.texture_synchronize_memory(texture);
                texture
            }
            None => {
                let (info, layer_size) = texture_info(&descriptor);
                cache.find_or_create_texture(TextureSearchFlags::FOR_SAMPLER, &info, layer_size)?
            }
        };

        self.set_slot(id, Some(texture), descriptor);
        cache.texture_inc_pool_ref(
            texture,
            PoolOwner {
                pool: self.id,
                slot: id,
                gpu_address: descriptor.unpack_address(),
            },
        );
        Some(texture)
    }

    fn set_slot(&mut self, id: u32, texture: Option<TextureId>, descriptor: TextureDescriptor) {
        if let Some(item) = self.pool.items.get_mut(id as usize) {
            *item = texture;
        }
        if let Some(cached) = self.pool.descriptor_cache.get_mut(id as usize) {
            *cached = descriptor;
        }
    }

    /// Empties `slot` if it still holds `texture`. Returns whether it did.
    fn clear_slot(&mut self, slot: u32, texture: TextureId) -> bool {
        match self.pool.items.get_mut(slot as usize) {
            Some(item) if *item == Some(texture) => {
                *item = None;
                true
            }
            _ => false,
        }
    }

    fn invalidate_slots(&mut self, cache: &mut TextureCache, slots: std::ops::Range<u32>) {
        self.process_requests(cache);

        for id in slots {
            let Some(&Some(texture)) = self.pool.items.get(id as usize) else {
                continue;
            };
            if !self.pool.descriptor_changed(id) {
                continue;
            }
            let cached = self.pool.descriptor_cache[id as usize];

            // The slot holds the last reference; keep the texture around briefly in case the
            // guest switches back to the old descriptor.
            if cache.texture(texture).is_some_and(|t| t.reference_count() == 1) {
                cache.add_short_cache(texture, cached);
            }

            debug!(pool = ?self.id, id, ?texture, "texture pool slot invalidated");
            self.clear_slot(id, texture);
            cache.texture_dec_pool_ref(texture, self.id, Some(id));
            self.remove_alias_list(cache, texture);
        }
    }

    /// Applies the requests the cache posted for this pool.
    fn process_requests(&mut self, cache: &mut TextureCache) {
        while let Some(request) = self.requests.pop() {
            match request {
                PoolRequest::Released { slot, texture } => {
                    self.clear_slot(slot, texture);
                    self.remove_alias_list(cache, texture);
                }
                PoolRequest::Remove { slot, texture } => {
                    self.clear_slot(slot, texture);
                    cache.texture_dec_ref(texture);
                    self.remove_alias_list(cache, texture);
                }
                PoolRequest::Remap { slot, texture } => self.remap(cache, slot, texture),
            }
        }
    }

    /// Tries to keep `texture` in `slot` after its memory was remapped.
    ///
    /// Only storage textures without views or copy dependencies can follow a remap; anything
    /// else, or a slot whose descriptor changed meanwhile, drops the texture.
    fn remap(&mut self, cache: &mut TextureCache, slot: u32, texture: TextureId) {
        let held = self.clear_slot(slot, texture);
        if !held || !cache.is_remappable_storage(texture) || self.pool.descriptor_changed(slot) {
            cache.texture_dec_ref(texture);
            self.remove_alias_list(cache, texture);
            return;
        }

        let descriptor = self.pool.descriptor_cache[slot as usize];
        let address = descriptor.unpack_address();
        let range = cache.update_partially_mapped(address, texture);
        if range.is_fully_unmapped() {
            cache.texture_dec_ref(texture);
            self.remove_alias_list(cache, texture);
            return;
        }

        // The pool reference was dropped on unmap; take a new one for the restored slot.
        self.set_slot(slot, Some(texture), descriptor);
        cache.texture_inc_pool_ref(
            texture,
            PoolOwner {
                pool: self.id,
                slot,
                gpu_address: address,
            },
        );
        cache.texture_dec_ref(texture);

        // Mappings may have changed again since the request was queued.
        let Some((size, current)) = cache.texture(texture).map(|t| (t.size(), t.range().clone()))
        else {
            self.clear_slot(slot, texture);
            return;
        };
        let range = cache.gpu_physical_regions(address, size);
        if range != current && !cache.update_mapping(texture, range) {
            debug!(?texture, slot, "remapped texture collides with another; dropping it");
            self.clear_slot(slot, texture);
            cache.texture_dec_pool_ref(texture, self.id, Some(slot));
        }
        self.remove_alias_list(cache, texture);
    }

    fn remove_alias_list(&mut self, cache: &mut TextureCache, texture: TextureId) {
        if let Some(aliases) = self.alias_lists.remove(&texture) {
            for (_, alias) in aliases {
                cache.texture_dec_ref(alias);
            }
        }
    }

    /// Releases every slot and alias and detaches the pool from the cache.
    pub fn dispose(mut self, cache: &mut TextureCache) {
        self.process_requests(cache);
        let items = std::mem::take(&mut self.pool.items);
        for (slot, item) in items.into_iter().enumerate() {
            if let Some(texture) = item {
                cache.texture_dec_pool_ref(texture, self.id, Some(slot as u32));
                self.remove_alias_list(cache, texture);
            }
        }
        let remaining: Vec<TextureId> = self.alias_lists.keys().copied().collect();
        for texture in remaining {
            self.remove_alias_list(cache, texture);
        }
        cache.unregister_pool(self.id);
    }
}

impl CachedPool for TexturePool {
    fn create(cache: &mut TextureCache, address: u64, maximum_id: u32) -> Self {
        Self::new(cache, address, maximum_id)
    }

    fn address(&self) -> u64 {
        self.pool.address()
    }

    fn dispose(self, cache: &mut TextureCache) {
        TexturePool::dispose(self, cache);
    }
}

/// Cache description of a texture descriptor, plus the guest layer stride when the descriptor
/// only exposes part of the level chain (`0` otherwise).
pub(crate) fn texture_info(descriptor: &TextureDescriptor) -> (TextureInfo, u64) {
    let mut depth_or_layers = descriptor.unpack_depth();
    let mut levels = descriptor.unpack_levels();

    let msaa = descriptor.unpack_msaa_mode();
    let samples_in_x = msaa.samples_in_x();
    let samples_in_y = msaa.samples_in_y();

    let descriptor_type = descriptor.unpack_descriptor_type();
    let is_linear = descriptor_type == TextureDescriptorType::Pitch;
    let stride = descriptor.unpack_stride();

    let mut target = descriptor
        .unpack_target()
        .convert(samples_in_x * samples_in_y != 1);

    let mut width = if target == Target::TextureBuffer {
        descriptor.unpack_buffer_texture_width()
    } else {
        descriptor.unpack_width()
    };
    let mut height = descriptor.unpack_height();

    if target.is_multisample() {
        // Divided back when the host texture is created.
        width *= samples_in_x;
        height *= samples_in_y;
    }

    // 1D textures are cached as 2D so they can match render targets and copies, whose target
    // is unknown.
    match target {
        Target::Texture1D => {
            target = Target::Texture2D;
            height = 1;
        }
        Target::Texture1DArray => {
            target = Target::Texture2DArray;
            height = 1;
        }
        _ => {}
    }

    let mut gpu_address = descriptor.unpack_address();
    let format_info = match descriptor.unpack_format() {
        Some(info) => info,
        None => {
            if gpu_address != 0 && descriptor.unpack_format_code() != 0 {
                warn!(
                    format = descriptor.unpack_format_code(),
                    srgb = descriptor.unpack_srgb(),
                    "invalid texture format"
                );
            }
            FormatInfo::default()
        }
    };

    let mut gob_blocks_in_y = descriptor.unpack_gob_blocks_in_y();
    let mut gob_blocks_in_z = descriptor.unpack_gob_blocks_in_z();
    let gob_blocks_in_tile_x = descriptor.unpack_gob_blocks_in_tile_x();

    let mut layer_size = 0;
    let min_lod = descriptor.unpack_base_level();
    let max_lod = descriptor.unpack_max_level_inclusive();

    // Linear textures have no mipmaps.
    if (min_lod != 0 || max_lod + 1 != levels) && target != Target::TextureBuffer && !is_linear {
        let full = TextureInfo {
            width,
            height,
            depth_or_layers,
            levels,
            target,
            format_info,
            gob_blocks_in_y,
            gob_blocks_in_z,
            gob_blocks_in_tile_x,
            ..TextureInfo::default()
        };
        let size_info = SizeInfo::block_linear(&full.block_linear_params(), 0);
        layer_size = size_info.layer_size;

        if min_lod != 0 && min_lod < levels {
            gpu_address += size_info.mip_offset(min_lod);
            width = (width >> min_lod).max(1);
            height = (height >> min_lod).max(1);
            if target == Target::Texture3D {
                depth_or_layers = (depth_or_layers >> min_lod).max(1);
            }
            (gob_blocks_in_y, gob_blocks_in_z) = mip_gob_block_sizes(
                height,
                full.depth(),
                format_info.block_height,
                gob_blocks_in_y,
                gob_blocks_in_z,
            );
        }

        levels = (max_lod + 1).saturating_sub(min_lod).max(1);
    }

    levels = clamp_levels(target, width, height, depth_or_layers, levels);

    let mut swizzle = descriptor.unpack_swizzle();
    let depth_stencil_mode = depth_stencil_mode(format_info.format, &swizzle);
    if format_info.format.is_depth_or_stencil() {
        swizzle = [
            SwizzleComponent::Red,
            SwizzleComponent::Red,
            SwizzleComponent::Red,
            match depth_stencil_mode {
                DepthStencilMode::Depth => SwizzleComponent::One,
                DepthStencilMode::Stencil => SwizzleComponent::Red,
            },
        ];
    }

    let info = TextureInfo {
        gpu_address,
        width,
        height,
        depth_or_layers,
        levels,
        samples_in_x,
        samples_in_y,
        stride,
        is_linear,
        gob_blocks_in_y,
        gob_blocks_in_z,
        gob_blocks_in_tile_x,
        target,
        format_info,
        depth_stencil_mode,
        swizzle,
    };
    (info, layer_size)
}

/// No more levels than the largest dimension can halve into.
fn clamp_levels(target: Target, width: u32, height: u32, depth_or_layers: u32, levels: u32) -> u32 {
    let mut max_size = width;
    if !matches!(target, Target::Texture1D | Target::Texture1DArray) {
        max_size = max_size.max(height);
    }
    if target == Target::Texture3D {
        max_size = max_size.max(depth_or_layers);
    }
    levels.min(max_size.max(1).ilog2() + 1)
}

/// Which aspect of a depth-stencil texture is sampled, from the first swizzle component that
/// selects red or green. Red is depth, except on 24-bit depth formats where it is stencil.
fn depth_stencil_mode(format: Format, swizzle: &[SwizzleComponent; 4]) -> DepthStencilMode {
    let Some(&component) = swizzle
        .iter()
        .find(|c| matches!(c, SwizzleComponent::Red | SwizzleComponent::Green))
    else {
        return DepthStencilMode::Depth;
    };

    let red_is_stencil = format == Format::D24UnormS8Uint;
    match (component == SwizzleComponent::Red, red_is_stencil) {
        (true, false) | (false, true) => DepthStencilMode::Depth,
        (true, true) | (false, false) => DepthStencilMode::Stencil,
    }
}

/// `info` reinterpreted as `format`, keeping the row size in bytes.
pub(crate) fn change_format(info: &TextureInfo, format: FormatInfo) -> TextureInfo {
    let mut width = info.width;
    let src_bpp = info.format_info.bytes_per_pixel;
    if src_bpp != format.bytes_per_pixel && format.bytes_per_pixel != 0 {
        width = width * src_bpp / format.bytes_per_pixel;
    }
    TextureInfo {
        width,
        format_info: format,
        ..info.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{DescriptorTarget, TextureMsaaMode};
    use pretty_assertions::assert_eq;

    fn descriptor() -> TextureDescriptor {
        TextureDescriptor::default()
            .with_target(DescriptorTarget::Texture2D)
            .with_address(0x10_0000)
            .with_format(Format::R8G8B8A8Unorm, false)
            .with_swizzle(SwizzleComponent::IDENTITY)
            .with_block_linear(16, 1)
    }

    #[test]
    fn one_dimensional_textures_become_two_dimensional() {
        let desc = descriptor()
            .with_target(DescriptorTarget::Texture1DArray)
            .with_size(256, 7, 3)
            .with_levels(1);
        let (info, layer_size) = texture_info(&desc);
        assert_eq!(info.target, Target::Texture2DArray);
        assert_eq!(info.height, 1);
        assert_eq!(info.depth_or_layers, 3);
        assert_eq!(layer_size, 0);
    }

    #[test]
    fn multisample_width_counts_samples() {
        let desc = descriptor()
            .with_size(64, 32, 1)
            .with_levels(1)
            .with_msaa_mode(TextureMsaaMode::Ms4x2);
        let (info, _) = texture_info(&desc);
        assert_eq!(info.target, Target::Texture2DMultisample);
        assert_eq!((info.width, info.height), (256, 64));
        assert_eq!((info.samples_in_x, info.samples_in_y), (4, 2));
    }

    #[test]
    fn base_level_offsets_the_address_and_shrinks_the_texture() {
        let desc = descriptor()
            .with_size(256, 256, 1)
            .with_levels(9)
            .with_level_range(2, 5);
        let (full, _) = texture_info(&descriptor().with_size(256, 256, 1).with_levels(9));
        let size_info = SizeInfo::block_linear(&full.block_linear_params(), 0);

        let (info, layer_size) = texture_info(&desc);
        assert_eq!(info.gpu_address, 0x10_0000 + size_info.mip_offset(2));
        assert_eq!((info.width, info.height), (64, 64));
        assert_eq!(info.levels, 4);
        assert_eq!(layer_size, size_info.layer_size);
    }

    #[test]
    fn levels_are_clamped_to_the_mip_chain() {
        let desc = descriptor().with_size(16, 4, 1).with_levels(10);
        let (info, _) = texture_info(&desc);
        assert_eq!(info.levels, 5);
    }

    #[test]
    fn depth_formats_sample_red_and_pick_the_aspect_from_swizzle() {
        let depth = descriptor()
            .with_format(Format::D32FloatS8Uint, false)
            .with_size(8, 8, 1)
            .with_levels(1)
            .with_swizzle([
                SwizzleComponent::Green,
                SwizzleComponent::Zero,
                SwizzleComponent::Zero,
                SwizzleComponent::One,
            ]);
        let (info, _) = texture_info(&depth);
        assert_eq!(info.depth_stencil_mode, DepthStencilMode::Stencil);
        assert_eq!(
            info.swizzle,
            [
                SwizzleComponent::Red,
                SwizzleComponent::Red,
                SwizzleComponent::Red,
                SwizzleComponent::Red
            ]
        );

        let packed = depth.with_format(Format::D24UnormS8Uint, false);
        let (info, _) = texture_info(&packed);
        assert_eq!(info.depth_stencil_mode, DepthStencilMode::Depth);
        assert_eq!(info.swizzle[3], SwizzleComponent::One);
    }

    #[test]
    fn unknown_formats_fall_back_to_the_default() {
        let mut desc = descriptor().with_size(8, 8, 1).with_levels(1);
        desc.words[0] = (desc.words[0] & !0xff) | 0xfe;
        let (info, _) = texture_info(&desc);
        assert_eq!(info.format_info, FormatInfo::default());
    }

    #[test]
    fn format_changes_keep_the_row_size() {
        let (info, _) = texture_info(&descriptor().with_size(100, 10, 1).with_levels(1));
        let changed = change_format(&info, Format::R32G32Float.info());
        assert_eq!(changed.width, 50);
        assert_eq!(changed.format_info.format, Format::R32G32Float);
        assert_eq!(changed.height, 10);
    }
}
