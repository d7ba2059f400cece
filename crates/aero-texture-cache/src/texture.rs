//! Live textures and the operations that move their data between guest memory and the host.
//!
//! A [`Texture`] is either a storage texture, which owns its host texture and its
//! [`TextureGroup`](crate::group), or a view sharing a storage's group at a layer and level
//! offset. All operations that touch more than one texture live on [`TextureCache`], which owns
//! every texture, group and handle.

use tracing::{debug, trace, warn};

use crate::backend::{Capabilities, CapabilityFlags, HostTextureId};
use crate::cache::TextureCache;
use crate::compat::{self, TextureMatchQuality, TextureSearchFlags, TextureViewCompatibility};
use crate::convert::convert_to_host;
use crate::error::{Result, TextureCacheError};
use crate::info::{Target, TextureCreateInfo, TextureInfo};
use crate::layout::{decode_slice, decode_texture, encode_texture, SurfaceLayout};
use crate::memory::MultiRange;
use crate::pool::PoolRequest;
use crate::size::SizeInfo;
use crate::{GroupId, PoolId, TextureId};

/// Uploads of a host-converted ASTC texture after which unchanged guest data is skipped.
const BYTE_COMPARISON_SWITCH_THRESHOLD: u32 = 4;

/// Whether a texture may be rendered at a resolution other than the guest's.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureScaleMode {
    /// Can be scaled once it is used as a render target.
    Eligible,
    Scaled,
    /// Scaling is allowed but not wanted; stays at 1x unless a dependency forces otherwise.
    Undesired,
    /// The CPU reads or writes the texture, so it must stay at 1x.
    Blacklisted,
}

/// A pool slot holding a reference to a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PoolOwner {
    pub(crate) pool: PoolId,
    pub(crate) slot: u32,
    pub(crate) gpu_address: u64,
}

#[derive(Debug)]
pub struct Texture {
    pub(crate) info: TextureInfo,
    pub(crate) size_info: SizeInfo,
    pub(crate) range: MultiRange,

    pub(crate) host: Option<HostTextureId>,
    /// 1x copy of a scaled texture kept for flushes.
    pub(crate) flush_host: Option<HostTextureId>,

    pub(crate) group: Option<GroupId>,
    /// Storage this texture is a view of.
    pub(crate) view_storage: Option<TextureId>,
    pub(crate) views: Vec<TextureId>,
    pub(crate) first_layer: u32,
    pub(crate) first_level: u32,

    pub(crate) scale_factor: f32,
    pub(crate) scale_mode: TextureScaleMode,

    pub(crate) ref_count: u32,
    pub(crate) pool_owners: Vec<PoolOwner>,

    /// Guest memory may have changed since the last synchronization.
    pub(crate) dirty: bool,
    /// The next GPU write must be forwarded to the group.
    pub(crate) modified_stale: bool,
    pub(crate) has_data: bool,
    /// The guest VA to physical mapping changed at least once while this texture was alive.
    pub(crate) changed_mapping: bool,
    pub(crate) always_flush_on_overlap: bool,
    /// Bumped whenever the texture's memory is unmapped or remapped.
    pub(crate) invalidated_sequence: u64,

    update_count: u32,
    current_data: Option<Vec<u8>>,
}

impl Texture {
    pub(crate) fn new(
        info: TextureInfo,
        size_info: SizeInfo,
        range: MultiRange,
        scale_mode: TextureScaleMode,
    ) -> Self {
        Self {
            info,
            size_info,
            range,
            host: None,
            flush_host: None,
            group: None,
            view_storage: None,
            views: Vec::new(),
            first_layer: 0,
            first_level: 0,
            scale_factor: 1.0,
            scale_mode,
            ref_count: 0,
            pool_owners: Vec::new(),
            dirty: true,
            modified_stale: true,
            has_data: false,
            changed_mapping: false,
            always_flush_on_overlap: false,
            invalidated_sequence: 0,
            update_count: 0,
            current_data: None,
        }
    }

    pub fn info(&self) -> &TextureInfo {
        &self.info
    }

    pub fn range(&self) -> &MultiRange {
        &self.range
    }

    pub fn size(&self) -> u64 {
        self.size_info.total_size
    }

    pub fn layer_size(&self) -> u64 {
        self.size_info.layer_size
    }

    pub fn host(&self) -> Option<HostTextureId> {
        self.host
    }

    pub fn first_layer(&self) -> u32 {
        self.first_layer
    }

    pub fn first_level(&self) -> u32 {
        self.first_level
    }

    pub fn scale_factor(&self) -> f32 {
        self.scale_factor
    }

    pub fn scale_mode(&self) -> TextureScaleMode {
        self.scale_mode
    }

    pub fn is_view(&self) -> bool {
        self.view_storage.is_some()
    }

    pub fn views(&self) -> &[TextureId] {
        &self.views
    }

    pub fn reference_count(&self) -> u32 {
        self.ref_count
    }

    /// How well this texture matches `info` for reuse as-is.
    pub fn is_exact_match(&self, info: &TextureInfo, flags: TextureSearchFlags) -> TextureMatchQuality {
        let quality = compat::format_matches(
            &self.info,
            info,
            flags.contains(TextureSearchFlags::FOR_SAMPLER),
            flags.contains(TextureSearchFlags::DEPTH_ALIAS),
        );
        if quality == TextureMatchQuality::NoMatch {
            return quality;
        }
        if !compat::layout_matches(&self.info, info) {
            return TextureMatchQuality::NoMatch;
        }
        if !compat::size_matches(&self.info, info, flags.contains(TextureSearchFlags::STRICT)) {
            return TextureMatchQuality::NoMatch;
        }
        if (flags.contains(TextureSearchFlags::FOR_SAMPLER) || flags.contains(TextureSearchFlags::STRICT))
            && !compat::sampler_params_matches(&self.info, info)
        {
            return TextureMatchQuality::NoMatch;
        }

        if flags.contains(TextureSearchFlags::FOR_COPY) {
            // A copy may address one sample plane of a multisample texture as a plain 2D one.
            let ms_to_2d = self.info.target == Target::Texture2DMultisample
                && info.target == Target::Texture2D;
            if !ms_to_2d && !compat::target_and_samples_compatible(&self.info, info) {
                return TextureMatchQuality::NoMatch;
            }
        } else if !compat::target_and_samples_compatible(&self.info, info) {
            return TextureMatchQuality::NoMatch;
        }

        if self.info.levels != info.levels {
            return TextureMatchQuality::NoMatch;
        }
        quality
    }

    /// Whether a texture described by `info` at `range` can be a view of this one.
    ///
    /// Returns the compatibility and the view's first layer and level inside this texture.
    pub fn is_view_compatible(
        &self,
        info: &TextureInfo,
        range: &MultiRange,
        exact_size: bool,
        layer_size: u64,
        caps: &Capabilities,
        flags: TextureSearchFlags,
    ) -> (TextureViewCompatibility, u32, u32) {
        let mut result = compat::view_format_compatible(info, &self.info, caps, flags);
        if result == TextureViewCompatibility::Incompatible {
            return (result, 0, 0);
        }

        result = result.propagate(compat::view_target_compatible(info, &self.info, caps));
        let both_multisample = info.target.is_multisample() && self.info.target.is_multisample();
        if result == TextureViewCompatibility::Incompatible
            || (both_multisample
                && (info.samples_in_x, info.samples_in_y)
                    != (self.info.samples_in_x, self.info.samples_in_y))
        {
            return (TextureViewCompatibility::Incompatible, 0, 0);
        }

        if result == TextureViewCompatibility::Full
            && self.info.format_info.format != info.format_info.format
            && !caps.supports(CapabilityFlags::MISMATCHING_VIEW_FORMAT)
        {
            result = TextureViewCompatibility::CopyOnly;
        }

        let Some(offset) = self.range.find_offset(range) else {
            return (TextureViewCompatibility::LayoutIncompatible, 0, 0);
        };
        let Some((first_layer, first_level)) = self.size_info.find_view(offset) else {
            return (TextureViewCompatibility::LayoutIncompatible, 0, 0);
        };

        if !compat::view_layout_compatible(&self.info, info, first_level) {
            return (TextureViewCompatibility::LayoutIncompatible, 0, 0);
        }
        if info.slices() > 1 && layer_size != self.size_info.layer_size {
            return (TextureViewCompatibility::LayoutIncompatible, 0, 0);
        }

        result = result.propagate(compat::view_size_matches(&self.info, info, exact_size, first_level));
        result = result.propagate(compat::view_sub_images_in_bounds(
            &self.info,
            info,
            first_layer,
            first_level,
        ));
        (result, first_layer, first_level)
    }

    /// Whether this texture's data bytes overlap `other`'s, not just their address ranges.
    pub fn data_overlaps(&self, other: &Texture, compatibility: TextureViewCompatibility) -> bool {
        if compatibility == TextureViewCompatibility::LayoutIncompatible
            && self.info.gob_blocks_in_z > 1
            && self.info.gob_blocks_in_z == other.info.gob_blocks_in_z
        {
            // Slices of 3D textures interleave; equal block depth means disjoint slices.
            return false;
        }

        let regions = self.size_info.all_regions();
        let other_regions = other.size_info.all_regions();
        if regions.len() == 1 && other_regions.len() == 1 {
            return self.range.overlaps_with(&other.range);
        }

        regions.iter().any(|&(offset, size)| {
            let slice = self.range.slice(offset, size);
            other_regions
                .iter()
                .any(|&(o_offset, o_size)| slice.overlaps_with(&other.range.slice(o_offset, o_size)))
        })
    }
}

/// Host creation parameters for a guest texture at `scale`.
pub(crate) fn create_info(info: &TextureInfo, caps: &Capabilities, scale: f32) -> TextureCreateInfo {
    let format = compat::to_host_compatible_format(info, caps);
    let mut width = info.width / info.samples_in_x.max(1);
    let mut height = info.height / info.samples_in_y.max(1);
    if scale != 1.0 {
        width = (width as f32 * scale).ceil() as u32;
        height = (height as f32 * scale).ceil() as u32;
    }

    TextureCreateInfo {
        width: width.max(1),
        height: height.max(1),
        depth: info.depth() * info.layers(),
        levels: info.levels.max(1),
        samples: info.samples(),
        block_width: format.block_width,
        block_height: format.block_height,
        bytes_per_pixel: format.bytes_per_pixel,
        format: format.format,
        depth_stencil_mode: info.depth_stencil_mode,
        target: info.target,
        swizzle: info.swizzle,
    }
}

impl TextureCache {
    pub(crate) fn texture_insert(&mut self, texture: Texture) -> TextureId {
        let id = self.textures.insert(texture);
        self.stats.inc_textures_created();
        id
    }

    fn texture_create_host(&mut self, id: TextureId) {
        let caps = *self.ctx.capabilities();
        let Some(tex) = self.textures.get(id) else {
            return;
        };
        let info = create_info(&tex.info, &caps, tex.scale_factor);
        let host = self.ctx.renderer().create_texture(&info);
        if let Some(tex) = self.textures.get_mut(id) {
            tex.host = Some(host);
        }
    }

    /// Creates the host texture and, with `with_data`, loads it from guest memory.
    ///
    /// Views get their host texture from [`TextureCache::texture_create_view`] instead.
    pub(crate) fn texture_initialize_data(&mut self, id: TextureId, is_view: bool, with_data: bool) {
        let group = self.textures.get(id).and_then(|t| t.group);
        let with_data =
            with_data || group.is_some_and(|g| self.group_flush_incompatible_overlaps_if_needed(g));
        let resolution_scale = self.ctx.config().resolution_scale;

        if with_data {
            self.texture_create_host(id);
            self.texture_synchronize_memory(id);
            if self.textures.get(id).is_some_and(|t| t.scale_mode == TextureScaleMode::Scaled) {
                self.texture_set_scale(id, resolution_scale);
            }
            return;
        }

        let Some(tex) = self.textures.get_mut(id) else {
            return;
        };
        tex.has_data = true;
        if is_view {
            return;
        }
        if tex.scale_mode == TextureScaleMode::Scaled {
            tex.scale_factor = resolution_scale;
        }
        // Data written by the GPU before the guest ever reads it must not be overwritten.
        self.texture_check_modified(id, true);
        self.texture_create_host(id);
    }

    /// Creates a view of `parent` at `(first_layer, first_level)` relative to it.
    pub(crate) fn texture_create_view(
        &mut self,
        parent: TextureId,
        info: TextureInfo,
        size_info: SizeInfo,
        range: MultiRange,
        first_layer: u32,
        first_level: u32,
    ) -> Option<TextureId> {
        let caps = *self.ctx.capabilities();
        let tex = self.textures.get(parent)?;
        let parent_host = tex.host?;
        let storage = tex.view_storage.unwrap_or(parent);
        let (scale_factor, scale_mode) = (tex.scale_factor, tex.scale_mode);

        let mut view = Texture::new(info, size_info, range, scale_mode);
        view.first_layer = tex.first_layer + first_layer;
        view.first_level = tex.first_level + first_level;
        view.scale_factor = scale_factor;
        view.has_data = true;

        let create = create_info(&view.info, &caps, scale_factor);
        let host = match self
            .ctx
            .renderer()
            .create_texture_view(parent_host, &create, first_layer, first_level)
        {
            Ok(host) => host,
            Err(err) => {
                warn!(?err, "failed to create host texture view");
                return None;
            }
        };
        view.host = Some(host);

        let id = self.textures.insert(view);
        self.stats.inc_views_created();
        self.texture_add_view(storage, id);
        debug!(?id, ?storage, first_layer, first_level, "created texture view");
        Some(id)
    }

    /// Makes `view` a view of `storage`; a group `view` owned is merged into the storage's.
    pub(crate) fn texture_add_view(&mut self, storage: TextureId, view: TextureId) {
        let Some(tex) = self.textures.get_mut(storage) else {
            return;
        };
        tex.ref_count += 1;
        tex.views.push(view);
        let views = tex.views.clone();
        let group = tex.group;

        let old_group = match self.textures.get_mut(view) {
            Some(v) => {
                v.view_storage = Some(storage);
                v.group
            }
            None => return,
        };
        let Some(group) = group else {
            return;
        };
        self.group_update_views(group, views, Some(view));

        if let Some(old_group) = old_group.filter(|&g| g != group) {
            let owned = self.groups.get(old_group).is_some_and(|g| g.storage == view);
            if owned {
                self.group_inherit(group, old_group);
                self.dispose_group(old_group);
            }
        }
        if let Some(v) = self.textures.get_mut(view) {
            v.group = Some(group);
        }
    }

    fn texture_remove_view(&mut self, storage: TextureId, view: TextureId) {
        let Some(tex) = self.textures.get_mut(storage) else {
            return;
        };
        tex.views.retain(|&v| v != view);
        let views = tex.views.clone();
        let group = tex.group;
        if let Some(group) = group {
            self.group_remove_view(group, views, view);
        }
        if let Some(v) = self.textures.get_mut(view) {
            v.view_storage = None;
        }
        self.texture_dec_ref(storage);
    }

    /// Turns `id`, until now a storage texture, into a view of `parent`'s storage using the
    /// already created host view `host`. Its own views move along with it.
    pub(crate) fn texture_replace_view(
        &mut self,
        id: TextureId,
        parent: TextureId,
        info: TextureInfo,
        host: HostTextureId,
        first_layer: u32,
        first_level: u32,
    ) {
        let caps = *self.ctx.capabilities();
        let Some(parent_tex) = self.textures.get(parent) else {
            return;
        };
        let parent_storage = parent_tex.view_storage.unwrap_or(parent);
        let (parent_layer, parent_level, parent_host) =
            (parent_tex.first_layer, parent_tex.first_level, parent_tex.host);

        self.texture_inc_ref(id);
        self.texture_synchronize_memory(parent_storage);

        let (views, scale) = match self.textures.get(id) {
            Some(tex) => (tex.views.clone(), tex.scale_factor),
            None => return,
        };
        for view in views {
            let Some(v) = self.textures.get(view) else {
                continue;
            };
            let (layer, level) = (v.first_layer + first_layer, v.first_level + first_level);
            let view_info = v.info.clone();
            let Some(parent_host) = parent_host else {
                continue;
            };
            let create = create_info(&view_info, &caps, scale);
            match self
                .ctx
                .renderer()
                .create_texture_view(parent_host, &create, layer, level)
            {
                Ok(new_host) => {
                    self.texture_replace_view(view, parent, view_info, new_host, layer, level)
                }
                Err(err) => warn!(?err, "failed to move view to its new storage"),
            }
        }

        self.texture_replace_storage(id, host);
        if let Some(old_storage) = self.textures.get(id).and_then(|t| t.view_storage) {
            self.texture_remove_view(old_storage, id);
        }
        if let Some(tex) = self.textures.get_mut(id) {
            tex.first_layer = parent_layer + first_layer;
            tex.first_level = parent_level + first_level;
        }
        self.texture_add_view(parent_storage, id);
        if let Some(tex) = self.textures.get_mut(id) {
            tex.info = info;
        }
        self.texture_dec_ref(id);
    }

    /// Swaps in a new host texture, releasing the old one.
    fn texture_replace_storage(&mut self, id: TextureId, host: HostTextureId) {
        let Some(tex) = self.textures.get_mut(id) else {
            self.ctx.renderer().release_texture(host);
            return;
        };
        let old = tex.host.replace(host);
        let flush = tex.flush_host.take();
        for old in old.into_iter().chain(flush).filter(|&old| old != host) {
            self.ctx.renderer().release_texture(old);
        }
    }

    /// Links `contained`, whose data sits at `(layer, level)` of `id`, by copy dependency.
    pub(crate) fn texture_create_copy_dependency(
        &mut self,
        id: TextureId,
        contained: TextureId,
        layer: u32,
        level: u32,
        copy_to: bool,
    ) {
        let (Some(tex), Some(other)) = (self.textures.get(id), self.textures.get(contained)) else {
            return;
        };
        let Some(group) = tex.group else {
            return;
        };
        if other.group == Some(group) {
            return;
        }
        let (first_layer, first_level) = (tex.first_layer + layer, tex.first_level + level);
        self.group_create_copy_dependency(group, contained, first_layer, first_level, copy_to);
    }

    pub(crate) fn texture_blacklist_scale(&mut self, id: TextureId) {
        if let Some(tex) = self.textures.get_mut(id) {
            tex.scale_mode = TextureScaleMode::Blacklisted;
        }
        self.texture_set_scale(id, 1.0);
    }

    /// Brings `id` and `other` to the same scale so data can be copied between them.
    pub(crate) fn texture_propagate_scale(&mut self, id: TextureId, other: TextureId) {
        let (Some(tex), Some(other_tex)) = (self.textures.get(id), self.textures.get(other)) else {
            return;
        };
        let (mode, other_mode) = (tex.scale_mode, other_tex.scale_mode);
        let (factor, other_factor) = (tex.scale_factor, other_tex.scale_factor);

        let blacklisted = TextureScaleMode::Blacklisted;
        if mode == blacklisted || other_mode == blacklisted {
            if mode != blacklisted {
                self.texture_blacklist_scale(id);
            }
            if other_mode != blacklisted {
                self.texture_blacklist_scale(other);
            }
            return;
        }
        if factor == other_factor {
            return;
        }

        let resolution_scale = self.ctx.config().resolution_scale;
        let scale = if factor == resolution_scale || other_factor == resolution_scale {
            resolution_scale
        } else {
            factor.max(other_factor)
        };
        self.texture_set_scale(id, scale);
        self.texture_set_scale(other, scale);
    }

    /// Changes the resolution scale, recreating the host texture and every view at the new
    /// size. Views forward to their storage.
    pub(crate) fn texture_set_scale(&mut self, id: TextureId, scale: f32) {
        let Some(tex) = self.textures.get(id) else {
            return;
        };
        let unscaled = tex.scale_mode == TextureScaleMode::Blacklisted
            || (tex.scale_mode == TextureScaleMode::Undesired && scale == 1.0);
        let mode = if unscaled {
            tex.scale_mode
        } else {
            TextureScaleMode::Scaled
        };

        if let Some(storage) = tex.view_storage {
            if let Some(s) = self.textures.get_mut(storage) {
                s.scale_mode = mode;
            }
            self.texture_set_scale(storage, scale);
            return;
        }

        let caps = *self.ctx.capabilities();
        let views = tex.views.clone();
        let (first_layer, first_level) = (tex.first_layer, tex.first_level);

        if tex.scale_factor != scale {
            debug!(?id, from = tex.scale_factor, to = scale, "rescaling texture");
            if let Some(old) = tex.host {
                let create = create_info(&tex.info, &caps, scale);
                let scaled = self.ctx.renderer().create_texture(&create);
                if let Err(err) = self.ctx.renderer().copy_texture_scaled(old, scaled) {
                    warn!(?err, "failed to copy texture data into its rescaled storage");
                }
                self.texture_replace_storage(id, scaled);

                for &view in &views {
                    let Some(v) = self.textures.get(view) else {
                        continue;
                    };
                    let create = create_info(&v.info, &caps, scale);
                    let (layer, level) = (
                        v.first_layer.saturating_sub(first_layer),
                        v.first_level.saturating_sub(first_level),
                    );
                    match self
                        .ctx
                        .renderer()
                        .create_texture_view(scaled, &create, layer, level)
                    {
                        Ok(host) => self.texture_replace_storage(view, host),
                        Err(err) => warn!(?err, "failed to recreate view at new scale"),
                    }
                }
            }
            for &view in &views {
                if let Some(v) = self.textures.get_mut(view) {
                    v.scale_factor = scale;
                }
            }
            if let Some(tex) = self.textures.get_mut(id) {
                tex.scale_factor = scale;
            }
        }

        for texture in std::iter::once(id).chain(views) {
            if let Some(tex) = self.textures.get_mut(texture) {
                tex.scale_mode = mode;
            }
        }
    }

    /// The host texture a flush reads from: the texture itself, or a 1x copy of it when it is
    /// scaled.
    pub(crate) fn texture_flush_host(&mut self, id: TextureId) -> Option<HostTextureId> {
        let caps = *self.ctx.capabilities();
        let tex = self.textures.get(id)?;
        let host = tex.host?;
        if tex.scale_factor == 1.0 {
            return Some(host);
        }

        let flush = match tex.flush_host {
            Some(flush) => flush,
            None => {
                let create = create_info(&tex.info, &caps, 1.0);
                let flush = self.ctx.renderer().create_texture(&create);
                if let Some(tex) = self.textures.get_mut(id) {
                    tex.flush_host = Some(flush);
                }
                flush
            }
        };
        if let Err(err) = self.ctx.renderer().copy_texture_scaled(host, flush) {
            warn!(?err, "failed to downscale texture for flush");
            return None;
        }
        Some(flush)
    }

    pub(crate) fn texture_check_modified(&mut self, id: TextureId, consume: bool) -> bool {
        match self.textures.get(id).and_then(|t| t.group) {
            Some(group) => self.group_check_dirty(group, id, consume),
            None => false,
        }
    }

    /// Loads whatever guest memory changed since the last call into the host texture.
    pub(crate) fn texture_synchronize_memory(&mut self, id: TextureId) {
        let Some(tex) = self.textures.get(id) else {
            return;
        };
        if tex.info.target == Target::TextureBuffer {
            return;
        }
        let written = !tex.dirty && tex.group.is_some_and(|g| self.group_has_guest_writes(g, id));
        let Some(tex) = self.textures.get_mut(id) else {
            return;
        };
        if !(tex.dirty || written) {
            return;
        }
        tex.dirty = false;
        let (has_data, group) = (tex.has_data, tex.group);

        let result = match (has_data, group) {
            (true, Some(group)) => self.group_synchronize_memory(group, id),
            _ => {
                if let Some(group) = group {
                    self.group_check_dirty(group, id, true);
                }
                self.texture_synchronize_full(id)
            }
        };
        if let Err(err) = result {
            warn!(?err, ?id, "failed to synchronize texture with guest memory");
        }
    }

    /// Skips the next load: the caller overwrites the whole texture.
    pub(crate) fn texture_discard_data(&mut self, id: TextureId) {
        let Some(tex) = self.textures.get_mut(id) else {
            return;
        };
        tex.dirty = false;
        if let Some(group) = tex.group {
            self.group_discard_data(group, id);
        }
    }

    /// Uploads the whole texture from guest memory.
    pub(crate) fn texture_synchronize_full(&mut self, id: TextureId) -> Result<()> {
        let tex = self
            .textures
            .get(id)
            .ok_or(TextureCacheError::MissingTexture(id))?;
        if tex.has_data || tex.scale_factor != 1.0 {
            self.texture_blacklist_scale(id);
        }

        let caps = *self.ctx.capabilities();
        let tex = self
            .textures
            .get_mut(id)
            .ok_or(TextureCacheError::MissingTexture(id))?;
        let guest = self.physical.read_range(&tex.range)?;

        if tex.info.format_info.format.is_astc() && !caps.supports(CapabilityFlags::ASTC_COMPRESSION) {
            // Decoding is expensive; skip uploads of unchanged data once updates are frequent.
            if tex.update_count < BYTE_COMPARISON_SWITCH_THRESHOLD {
                tex.update_count += 1;
            } else {
                let unchanged = tex.current_data.as_deref() == Some(guest.as_slice());
                if unchanged {
                    trace!(?id, "guest data unchanged, skipping upload");
                    tex.has_data = true;
                    return Ok(());
                }
                tex.current_data = Some(guest.clone());
            }
        }

        let (info, size_info, host) = (tex.info.clone(), tex.size_info.clone(), tex.host);
        let data = self.texture_host_data(&info, &size_info, &guest);
        if let Some(host) = host {
            self.ctx.renderer().set_data(host, &data)?;
            self.stats.inc_uploads();
        }
        if let Some(tex) = self.textures.get_mut(id) {
            tex.has_data = true;
        }
        Ok(())
    }

    /// Host data for a whole texture's guest bytes.
    fn texture_host_data(&self, info: &TextureInfo, size_info: &SizeInfo, guest: &[u8]) -> Vec<u8> {
        let packed = decode_texture(info, size_info, guest);
        let caps = self.ctx.capabilities();
        if !compat::is_format_host_incompatible(info, caps) {
            return packed;
        }

        let host_format = compat::to_host_compatible_format(info, caps).format;
        let converter = self.converter.as_deref();
        let is_3d = size_info.is_3d();
        let layers = if is_3d { 1 } else { info.layers().max(1) };

        let mut out = Vec::with_capacity(packed.len());
        let mut offset = 0;
        for level in 0..size_info.levels() {
            let depth = if is_3d { (info.depth() >> level).max(1) } else { 1 };
            let len = SurfaceLayout::for_level(info, level).packed_size(depth);
            let (width, height) = ((info.width >> level).max(1), (info.height >> level).max(1));
            for _ in 0..layers {
                let chunk = packed.get(offset..offset + len).unwrap_or(&[]).to_vec();
                offset += len;
                out.extend(convert_to_host(
                    info.format_info.format,
                    host_format,
                    width,
                    height,
                    depth,
                    chunk,
                    converter,
                ));
            }
        }
        out
    }

    /// Host data for one slice whose guest bytes start at `guest`.
    pub(crate) fn texture_convert_to_host(
        &self,
        info: &TextureInfo,
        guest: &[u8],
        level: u32,
        single: bool,
    ) -> Vec<u8> {
        let packed = decode_slice(info, level, single, guest);
        let caps = self.ctx.capabilities();
        if !compat::is_format_host_incompatible(info, caps) {
            return packed;
        }
        let host_format = compat::to_host_compatible_format(info, caps).format;
        let depth = if info.target == Target::Texture3D && !single {
            (info.depth() >> level).max(1)
        } else {
            1
        };
        convert_to_host(
            info.format_info.format,
            host_format,
            (info.width >> level).max(1),
            (info.height >> level).max(1),
            depth,
            packed,
            self.converter.as_deref(),
        )
    }

    /// Replaces the whole texture's data with host-format `data` written by the CPU.
    pub(crate) fn texture_set_data(&mut self, id: TextureId, data: &[u8]) -> Result<()> {
        self.texture_blacklist_scale(id);
        self.texture_check_modified(id, true);
        let tex = self
            .textures
            .get_mut(id)
            .ok_or(TextureCacheError::MissingTexture(id))?;
        tex.always_flush_on_overlap = true;
        tex.has_data = true;
        tex.current_data = None;
        if let Some(host) = tex.host {
            self.ctx.renderer().set_data(host, data)?;
            self.stats.inc_uploads();
        }
        Ok(())
    }

    pub(crate) fn texture_set_data_slice(
        &mut self,
        id: TextureId,
        data: &[u8],
        layer: u32,
        level: u32,
    ) -> Result<()> {
        self.texture_blacklist_scale(id);
        let tex = self
            .textures
            .get_mut(id)
            .ok_or(TextureCacheError::MissingTexture(id))?;
        tex.has_data = true;
        tex.current_data = None;
        if let Some(host) = tex.host {
            self.ctx.renderer().set_data_slice(host, layer, level, data)?;
            self.stats.inc_uploads();
        }
        Ok(())
    }

    /// Reads back one slice at 1x. `blacklist` pins the texture to 1x instead of downscaling a
    /// temporary copy.
    pub(crate) fn texture_slice_data(
        &mut self,
        id: TextureId,
        layer: u32,
        level: u32,
        blacklist: bool,
        flush_texture: Option<HostTextureId>,
    ) -> Result<Vec<u8>> {
        if let Some(flush) = flush_texture {
            return Ok(self.ctx.renderer().get_data_slice(flush, layer, level)?);
        }

        let caps = *self.ctx.capabilities();
        let tex = self.textures.get(id).ok_or(TextureCacheError::MissingTexture(id))?;
        if !blacklist && tex.scale_factor != 1.0 {
            let Some(host) = tex.host else {
                return Err(TextureCacheError::MissingTexture(id));
            };
            let create = create_info(&tex.info, &caps, 1.0);
            let renderer = self.ctx.renderer();
            let temp = renderer.create_texture(&create);
            let data = renderer
                .copy_texture_scaled(host, temp)
                .and_then(|()| renderer.get_data_slice(temp, layer, level));
            renderer.release_texture(temp);
            return Ok(data?);
        }

        if blacklist {
            self.texture_blacklist_scale(id);
        }
        let host = self
            .textures
            .get(id)
            .and_then(|t| t.host)
            .ok_or(TextureCacheError::MissingTexture(id))?;
        Ok(self.ctx.renderer().get_data_slice(host, layer, level)?)
    }

    fn texture_data_from_host(&mut self, id: TextureId, blacklist: bool) -> Result<Vec<u8>> {
        let caps = *self.ctx.capabilities();
        let tex = self.textures.get(id).ok_or(TextureCacheError::MissingTexture(id))?;
        let host = tex.host.ok_or(TextureCacheError::MissingTexture(id))?;

        if !blacklist && tex.scale_factor != 1.0 {
            let create = create_info(&tex.info, &caps, 1.0);
            let renderer = self.ctx.renderer();
            let temp = renderer.create_texture(&create);
            let data = renderer
                .copy_texture_scaled(host, temp)
                .and_then(|()| renderer.get_data(temp));
            renderer.release_texture(temp);
            return Ok(data?);
        }

        if blacklist {
            self.texture_blacklist_scale(id);
        }
        let host = self
            .textures
            .get(id)
            .and_then(|t| t.host)
            .ok_or(TextureCacheError::MissingTexture(id))?;
        Ok(self.ctx.renderer().get_data(host)?)
    }

    fn texture_try_flush(&mut self, id: TextureId, tracked: bool) -> Result<()> {
        let packed = self.texture_data_from_host(id, tracked)?;
        let tex = self.textures.get(id).ok_or(TextureCacheError::MissingTexture(id))?;
        let mut guest = self.physical.read_range(&tex.range)?;
        encode_texture(&tex.info, &tex.size_info, &packed, &mut guest);

        let owner = tex
            .group
            .and_then(|g| self.groups.get(g))
            .map(|g| g.owner());
        self.physical
            .write_range(&tex.range, &guest, if tracked { owner } else { None })?;
        self.stats.inc_flushes();
        Ok(())
    }

    /// Writes the whole texture back to guest memory.
    ///
    /// Tracked flushes pin the texture to 1x and notify every other watcher of the memory.
    pub(crate) fn texture_flush(&mut self, id: TextureId, tracked: bool) {
        let flushable = self
            .textures
            .get(id)
            .is_some_and(|t| compat::can_texture_flush(&t.info, self.ctx.capabilities()));
        if !flushable {
            return;
        }
        if let Err(err) = self.texture_try_flush(id, tracked) {
            warn!(?err, ?id, "failed to flush texture to guest memory");
        }
    }

    /// Flushes the GPU-modified parts of the texture. Returns whether anything was written.
    pub(crate) fn texture_flush_modified(&mut self, id: TextureId, tracked: bool) -> bool {
        let Some(tex) = self.textures.get(id) else {
            return false;
        };
        if !compat::can_texture_flush(&tex.info, self.ctx.capabilities()) {
            return false;
        }
        match tex.group {
            Some(group) => self.group_flush_modified(group, id, tracked),
            None => false,
        }
    }

    pub(crate) fn signal_group_dirty(&mut self, id: TextureId) {
        if let Some(tex) = self.textures.get_mut(id) {
            tex.dirty = true;
        }
    }

    pub(crate) fn signal_modified_dirty(&mut self, id: TextureId) {
        if let Some(tex) = self.textures.get_mut(id) {
            tex.modified_stale = true;
        }
    }

    fn texture_take_modified_stale(&mut self, id: TextureId) -> Option<GroupId> {
        let tex = self.textures.get_mut(id)?;
        let group = tex.group?;
        let copies = self.groups.get(group).is_some_and(|g| g.has_copy_dependencies);
        if tex.modified_stale || copies {
            tex.modified_stale = false;
            Some(group)
        } else {
            None
        }
    }

    /// The GPU wrote the texture.
    pub(crate) fn texture_signal_modified(&mut self, id: TextureId) {
        if let Some(group) = self.texture_take_modified_stale(id) {
            self.group_signal_modified(group, id);
        }
        self.auto_delete.lift(id);
    }

    /// The texture is bound as a render target (`bound`) or unbound.
    pub(crate) fn texture_signal_modifying(&mut self, id: TextureId, bound: bool) {
        if let Some(group) = self.texture_take_modified_stale(id) {
            self.group_signal_modifying(group, id, bound);
        }
        self.auto_delete.lift(id);
        if bound {
            self.texture_inc_ref(id);
        } else {
            self.texture_dec_ref(id);
        }
    }

    pub(crate) fn texture_inc_ref(&mut self, id: TextureId) {
        if let Some(tex) = self.textures.get_mut(id) {
            tex.ref_count += 1;
        }
    }

    /// Adds the reference held by `owner`'s pool slot.
    pub(crate) fn texture_inc_pool_ref(&mut self, id: TextureId, owner: PoolOwner) {
        let Some(tex) = self.textures.get_mut(id) else {
            return;
        };
        tex.pool_owners.push(owner);
        tex.ref_count += 1;
        if self.auto_delete.remove_short_cache(id) {
            self.texture_dec_ref(id);
        }
    }

    /// Drops the reference of `pool`'s `slot`, or of every slot of `pool` with `None`.
    ///
    /// Returns whether the texture has no references left.
    pub(crate) fn texture_dec_pool_ref(&mut self, id: TextureId, pool: PoolId, slot: Option<u32>) -> bool {
        let Some(tex) = self.textures.get_mut(id) else {
            return true;
        };
        let before = tex.pool_owners.len();
        tex.pool_owners
            .retain(|o| !(o.pool == pool && slot.map_or(true, |slot| o.slot == slot)));
        let removed = before - tex.pool_owners.len();
        if removed == 0 {
            return tex.ref_count == 0;
        }

        let mut gone = false;
        for _ in 0..removed {
            gone = self.texture_dec_ref(id);
        }
        gone
    }

    /// Drops one reference. Returns whether none are left; the texture is then disposed once
    /// it has no views either.
    pub(crate) fn texture_dec_ref(&mut self, id: TextureId) -> bool {
        let Some(tex) = self.textures.get_mut(id) else {
            return true;
        };
        tex.ref_count = tex.ref_count.saturating_sub(1);
        let remaining = tex.ref_count;
        let storage = tex.view_storage;

        if remaining == 0 {
            if let Some(storage) = storage {
                self.texture_remove_view(storage, id);
            }
            self.remove_from_index(id);
        }
        self.texture_delete_if_not_used(id);
        remaining == 0
    }

    fn texture_delete_if_not_used(&mut self, id: TextureId) {
        let unused = self
            .textures
            .get(id)
            .is_some_and(|t| t.ref_count == 0 && t.views.is_empty());
        if unused {
            self.texture_dispose(id);
        }
    }

    fn texture_dispose(&mut self, id: TextureId) {
        let Some(tex) = self.textures.remove(id) else {
            return;
        };
        trace!(?id, "disposing texture");
        for host in tex.host.into_iter().chain(tex.flush_host) {
            self.ctx.renderer().release_texture(host);
        }
        if let Some(group) = tex.group {
            if self.groups.get(group).is_some_and(|g| g.storage == id) {
                self.dispose_group(group);
            }
        }
    }

    /// The texture's memory was (partly) unmapped; pool slots holding it are asked to
    /// re-resolve.
    pub(crate) fn texture_unmapped(&mut self, id: TextureId, range: &MultiRange) {
        let Some(tex) = self.textures.get_mut(id) else {
            return;
        };
        tex.changed_mapping = true;
        tex.invalidated_sequence += 1;
        let is_storage = tex.view_storage.is_none();
        if let Some(group) = tex.group.filter(|_| is_storage) {
            self.group_unmapped(group, range);
        }
        self.texture_update_pool_mappings(id);
    }

    /// Hands every pool reference back to the pools: slots at the first address seen try to
    /// keep the texture after the remap, the others drop it.
    pub(crate) fn texture_update_pool_mappings(&mut self, id: TextureId) {
        let Some(tex) = self.textures.get_mut(id) else {
            return;
        };
        let owners = std::mem::take(&mut tex.pool_owners);
        let mut address = None;
        for owner in owners {
            let Some(queue) = self.pools.get(owner.pool) else {
                // The pool is gone, so nobody will drop this reference for it.
                self.texture_dec_ref(id);
                continue;
            };
            let request = if address.map_or(true, |a| a == owner.gpu_address) {
                address = Some(owner.gpu_address);
                PoolRequest::Remap {
                    slot: owner.slot,
                    texture: id,
                }
            } else {
                PoolRequest::Remove {
                    slot: owner.slot,
                    texture: id,
                }
            };
            queue.push(request);
        }
    }

    /// Clears every pool slot referencing the texture.
    ///
    /// With `deferred`, the references move into the pools' queues and are dropped when the
    /// pools next run; otherwise they are dropped now.
    pub(crate) fn texture_remove_from_pools(&mut self, id: TextureId, deferred: bool) {
        let Some(tex) = self.textures.get_mut(id) else {
            return;
        };
        let owners = std::mem::take(&mut tex.pool_owners);
        for owner in owners {
            let queue = self.pools.get(owner.pool);
            if deferred {
                if let Some(queue) = queue {
                    queue.push(PoolRequest::Remove {
                        slot: owner.slot,
                        texture: id,
                    });
                    continue;
                }
            } else if let Some(queue) = queue {
                queue.push(PoolRequest::Released {
                    slot: owner.slot,
                    texture: id,
                });
            }
            self.texture_dec_ref(id);
        }
        self.stats.inc_pool_invalidations();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use pretty_assertions::assert_eq;

    fn tiled(width: u32, height: u32, levels: u32, layers: u32) -> TextureInfo {
        TextureInfo {
            width,
            height,
            levels,
            depth_or_layers: layers,
            target: if layers > 1 {
                Target::Texture2DArray
            } else {
                Target::Texture2D
            },
            gob_blocks_in_y: 2,
            format_info: Format::R8G8B8A8Unorm.info(),
            ..TextureInfo::default()
        }
    }

    fn texture(info: TextureInfo, address: u64) -> Texture {
        let size_info = info.calculate_size_info(0);
        let range = MultiRange::single(address, size_info.total_size);
        Texture::new(info, size_info, range, TextureScaleMode::Undesired)
    }

    #[test]
    fn create_info_scales_and_substitutes_formats() {
        let mut info = tiled(100, 50, 1, 1);
        info.format_info = Format::B5G6R5Unorm.info();
        let caps = Capabilities {
            flags: CapabilityFlags::all() - CapabilityFlags::FIVE_BIT_COMPONENT_FORMAT,
            ..Capabilities::default()
        };

        let create = create_info(&info, &caps, 1.5);
        assert_eq!((create.width, create.height), (150, 75));
        assert_eq!(create.format, Format::B8G8R8A8Unorm);
        assert_eq!(create.bytes_per_pixel, 4);
    }

    #[test]
    fn multisample_textures_are_created_at_sample_resolution() {
        let info = TextureInfo {
            width: 128,
            height: 64,
            samples_in_x: 2,
            samples_in_y: 2,
            target: Target::Texture2DMultisample,
            ..tiled(128, 64, 1, 1)
        };
        let create = create_info(&info, &Capabilities::default(), 1.0);
        assert_eq!((create.width, create.height, create.samples), (64, 32, 4));
    }

    #[test]
    fn exact_match_requires_equal_levels_and_sampler_params() {
        let tex = texture(tiled(64, 64, 3, 1), 0x1000);

        let same = tiled(64, 64, 3, 1);
        assert_eq!(
            tex.is_exact_match(&same, TextureSearchFlags::empty()),
            TextureMatchQuality::Perfect
        );

        let fewer_levels = tiled(64, 64, 2, 1);
        assert_eq!(
            tex.is_exact_match(&fewer_levels, TextureSearchFlags::empty()),
            TextureMatchQuality::NoMatch
        );

        let mut swizzled = tiled(64, 64, 3, 1);
        swizzled.swizzle.swap(0, 2);
        assert_eq!(
            tex.is_exact_match(&swizzled, TextureSearchFlags::empty()),
            TextureMatchQuality::Perfect
        );
        assert_eq!(
            tex.is_exact_match(&swizzled, TextureSearchFlags::FOR_SAMPLER),
            TextureMatchQuality::NoMatch
        );
    }

    #[test]
    fn mip_level_view_is_found_at_its_offset() {
        let parent = texture(tiled(64, 64, 4, 4), 0x10_0000);
        let offset = parent.size_info.all_offsets()[4 + 2];

        let mut child = tiled(16, 16, 1, 1);
        child.gob_blocks_in_y = crate::size::mip_gob_block_sizes(16, 1, 1, 2, 1).0;
        let child_size = child.calculate_size_info(0);
        let range = parent.range.slice(offset, child_size.total_size);

        let (compat, layer, level) = parent.is_view_compatible(
            &child,
            &range,
            false,
            child_size.layer_size,
            &Capabilities::default(),
            TextureSearchFlags::empty(),
        );
        assert_eq!((layer, level), (1, 2));
        assert_eq!(compat, TextureViewCompatibility::Full);
    }

    #[test]
    fn misaligned_child_is_layout_incompatible() {
        let parent = texture(tiled(64, 64, 1, 1), 0x10_0000);
        let child = tiled(64, 32, 1, 1);
        let range = MultiRange::single(0x10_0000 + 16, 64);

        let (compat, _, _) = parent.is_view_compatible(
            &child,
            &range,
            false,
            0,
            &Capabilities::default(),
            TextureSearchFlags::empty(),
        );
        assert_eq!(compat, TextureViewCompatibility::LayoutIncompatible);
    }

    #[test]
    fn data_overlap_checks_array_slices() {
        let array = texture(tiled(64, 64, 1, 2), 0x10_0000);
        let layer_size = array.size_info.layer_size;

        let inside = texture(tiled(64, 64, 1, 1), 0x10_0000 + layer_size);
        assert!(array.data_overlaps(&inside, TextureViewCompatibility::CopyOnly));

        let after = texture(tiled(64, 64, 1, 1), 0x10_0000 + 2 * layer_size);
        assert!(!array.data_overlaps(&after, TextureViewCompatibility::CopyOnly));
    }
}
