//! Find-or-create, the lookup every texture binding, render target and copy goes through.
//!
//! A request is served, in order of preference, by an existing texture with the same
//! parameters at the same memory, by a view of a texture that contains it, by new storage
//! linked to a copy-compatible texture, or by new storage that adopts or links to everything
//! it overlaps.

use tracing::{debug, trace, warn};

use super::TextureCache;
use crate::compat::{TextureMatchQuality, TextureSearchFlags, TextureViewCompatibility};
use crate::format::FormatInfo;
use crate::group::IncompatibleOverlap;
use crate::info::{Target, TextureInfo};
use crate::memory::MultiRange;
use crate::size::{SizeInfo, GOB_ALIGNMENT, GOB_STRIDE, STRIDE_ALIGNMENT};
use crate::texture::{create_info, Texture, TextureScaleMode};
use crate::TextureId;

/// A render target as programmed by the guest.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderTarget {
    pub gpu_address: u64,
    /// Width in pixels, or the row pitch in bytes for linear targets.
    pub width_or_stride: u32,
    pub height: u32,
    pub depth: u32,
    pub is_linear: bool,
    pub is_3d: bool,
    /// The target may be rendered with a non-zero layer index.
    pub layered: bool,
    pub samples_in_x: u32,
    pub samples_in_y: u32,
    pub gob_blocks_in_y: u32,
    pub gob_blocks_in_z: u32,
    pub format_info: FormatInfo,
    /// Layer stride in units of four bytes.
    pub layer_size: u32,
}

/// A 2D engine source or destination surface.
#[derive(Clone, Debug, PartialEq)]
pub struct CopySurface {
    pub gpu_address: u64,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub stride: u32,
    pub is_linear: bool,
    pub gob_blocks_in_y: u32,
    pub gob_blocks_in_z: u32,
}

/// A texture overlapping a request, and where the request sits inside it.
#[derive(Clone, Copy, Debug)]
struct Overlap {
    texture: TextureId,
    compatibility: TextureViewCompatibility,
    first_layer: u32,
    first_level: u32,
}

impl TextureCache {
    /// The texture described by `info`, created if no existing texture can serve it.
    ///
    /// Returns `None` if the texture's memory is entirely unmapped, its dimensions are invalid,
    /// or [`TextureSearchFlags::NO_CREATE`] is set and nothing matched exactly. Textures not
    /// requested [`TextureSearchFlags::FOR_SAMPLER`] are owned by the auto-delete cache; sampler
    /// textures live as long as their pool slots reference them.
    pub fn find_or_create_texture(
        &mut self,
        flags: TextureSearchFlags,
        info: &TextureInfo,
        layer_size: u64,
    ) -> Option<TextureId> {
        self.find_or_create(flags, info, layer_size, None)
    }

    /// Like [`Self::find_or_create_texture`] for a texture at an already resolved physical
    /// `range`.
    pub fn find_or_create_texture_in_range(
        &mut self,
        flags: TextureSearchFlags,
        info: &TextureInfo,
        layer_size: u64,
        range: MultiRange,
    ) -> Option<TextureId> {
        self.find_or_create(flags, info, layer_size, Some(range))
    }

    /// The texture bound as color target. `size_hint_width` is the smallest width the draw
    /// needs; tiled targets may be narrowed to it within the same GOB.
    pub fn find_or_create_color_target(
        &mut self,
        target: &RenderTarget,
        size_hint_width: u32,
    ) -> Option<TextureId> {
        let format_info = target.format_info;
        let (width, stride) = if target.is_linear {
            (target.width_or_stride / format_info.bytes_per_pixel.max(1), target.width_or_stride)
        } else {
            (target.width_or_stride, 0)
        };
        let info = TextureInfo {
            gpu_address: target.gpu_address,
            width: minimum_width_in_gob(width, size_hint_width, format_info.bytes_per_pixel, target.is_linear),
            height: target.height,
            depth_or_layers: target.depth,
            levels: 1,
            samples_in_x: target.samples_in_x,
            samples_in_y: target.samples_in_y,
            stride,
            is_linear: target.is_linear,
            gob_blocks_in_y: target.gob_blocks_in_y,
            gob_blocks_in_z: target.gob_blocks_in_z,
            gob_blocks_in_tile_x: 1,
            target: render_target_kind(target),
            format_info,
            ..TextureInfo::default()
        };
        let layer_size = if target.is_linear { 0 } else { target.layer_size as u64 * 4 };

        let texture = self.find_or_create_texture(TextureSearchFlags::WITH_UPSCALE, &info, layer_size)?;
        self.texture_synchronize_memory(texture);
        Some(texture)
    }

    /// The texture bound as depth-stencil target. Depth targets are always tiled.
    pub fn find_or_create_depth_target(
        &mut self,
        target: &RenderTarget,
        size_hint_width: u32,
    ) -> Option<TextureId> {
        let format_info = target.format_info;
        let info = TextureInfo {
            gpu_address: target.gpu_address,
            width: minimum_width_in_gob(target.width_or_stride, size_hint_width, format_info.bytes_per_pixel, false),
            height: target.height,
            depth_or_layers: target.depth,
            levels: 1,
            samples_in_x: target.samples_in_x,
            samples_in_y: target.samples_in_y,
            stride: 0,
            is_linear: false,
            gob_blocks_in_y: target.gob_blocks_in_y,
            gob_blocks_in_z: target.gob_blocks_in_z,
            gob_blocks_in_tile_x: 1,
            target: render_target_kind(target),
            format_info,
            ..TextureInfo::default()
        };

        let texture = self.find_or_create_texture(
            TextureSearchFlags::WITH_UPSCALE,
            &info,
            target.layer_size as u64 * 4,
        )?;
        self.texture_synchronize_memory(texture);
        Some(texture)
    }

    /// The texture a 2D engine copy reads or writes, `offset` bytes into `surface`.
    ///
    /// Without `should_create` only an exact match is returned.
    pub fn find_or_create_copy_texture(
        &mut self,
        surface: &CopySurface,
        offset: u64,
        format_info: FormatInfo,
        should_create: bool,
        prefer_scaling: bool,
        size_hint_width: u32,
    ) -> Option<TextureId> {
        let width = if surface.is_linear {
            surface.stride / format_info.bytes_per_pixel.max(1)
        } else {
            surface.width
        };
        let info = TextureInfo {
            gpu_address: surface.gpu_address + offset,
            width: minimum_width_in_gob(width, size_hint_width, format_info.bytes_per_pixel, surface.is_linear),
            height: surface.height,
            depth_or_layers: surface.depth,
            levels: 1,
            samples_in_x: 1,
            samples_in_y: 1,
            stride: surface.stride,
            is_linear: surface.is_linear,
            gob_blocks_in_y: surface.gob_blocks_in_y,
            gob_blocks_in_z: surface.gob_blocks_in_z,
            gob_blocks_in_tile_x: 1,
            target: Target::Texture2D,
            format_info,
            ..TextureInfo::default()
        };

        let mut flags = TextureSearchFlags::FOR_COPY;
        if prefer_scaling {
            flags |= TextureSearchFlags::WITH_UPSCALE;
        }
        if !should_create {
            flags |= TextureSearchFlags::NO_CREATE;
        }
        let texture = self.find_or_create_texture(flags, &info, 0)?;
        self.texture_synchronize_memory(texture);
        Some(texture)
    }

    /// Fast path for buffer-to-texture copies: a single-image texture at `gpu_va` laid out like
    /// the copy destination.
    ///
    /// Matches in different groups are ambiguous and yield `None`, leaving the copy to the slow
    /// path.
    #[allow(clippy::too_many_arguments)]
    pub fn find_texture(
        &mut self,
        gpu_va: u64,
        bytes_per_pixel: u32,
        stride: u32,
        height: u32,
        x_count: u32,
        y_count: u32,
        linear: bool,
        gob_blocks_in_y: u32,
        gob_blocks_in_z: u32,
    ) -> Option<TextureId> {
        self.process_pending_unmaps();
        let address = self.vm.translate(gpu_va)?;

        let mut found: Option<TextureId> = None;
        for id in self.index_overlaps_at(address, 1) {
            let Some(tex) = self.textures.get(id) else {
                continue;
            };
            let info = &tex.info;
            if info.depth_or_layers > 1 || info.levels > 1 || info.format_info.is_compressed() {
                continue;
            }

            let matches = if linear {
                info.is_linear && info.stride == stride && info.height == y_count
            } else {
                // Widths compare in bytes since the copy's bytes per pixel may differ.
                let copy_width = u64::from(x_count) * u64::from(bytes_per_pixel);
                let texture_width =
                    u64::from(info.width) * u64::from(info.format_info.bytes_per_pixel);
                let size_match = copy_width == texture_width && info.height == height;
                let layout_match = !info.is_linear
                    && info.gob_blocks_in_y == gob_blocks_in_y
                    && info.gob_blocks_in_z == gob_blocks_in_z;
                size_match && layout_match
            };
            if !matches {
                continue;
            }

            match found {
                None => found = Some(id),
                Some(previous) => {
                    let previous_group = self.textures.get(previous).and_then(|t| t.group);
                    if previous_group != tex.group {
                        trace!(gpu_va, "ambiguous texture for buffer copy");
                        return None;
                    }
                }
            }
        }
        found
    }

    fn find_or_create(
        &mut self,
        flags: TextureSearchFlags,
        info: &TextureInfo,
        layer_size: u64,
        range: Option<MultiRange>,
    ) -> Option<TextureId> {
        self.process_pending_unmaps();

        if !has_valid_dimensions(info) {
            debug!(
                width = info.width,
                height = info.height,
                levels = info.levels,
                depth_or_layers = info.depth_or_layers,
                target = ?info.target,
                "rejecting texture with invalid dimensions"
            );
            return None;
        }

        let for_sampler = flags.contains(TextureSearchFlags::FOR_SAMPLER);
        let address = match &range {
            Some(range) => range.mapped().next()?.address,
            None => self.resolve_address(info, layer_size)?,
        };

        if let Some(texture) = self.find_exact_match(flags, info, address, range.as_ref()) {
            if flags.contains(TextureSearchFlags::DISCARD_DATA) {
                self.texture_discard_data(texture);
            } else {
                self.texture_synchronize_memory(texture);
            }
            if !for_sampler {
                self.auto_delete.lift(texture);
            }
            self.stats.inc_textures_reused();
            trace!(?texture, address, "exact texture match");
            return Some(texture);
        }
        if flags.contains(TextureSearchFlags::NO_CREATE) {
            return None;
        }

        let size_info = info.calculate_size_info(layer_size);
        let range = match range {
            Some(range) => range,
            None => self.vm.physical_regions(info.gpu_address, size_info.total_size),
        };

        // Overlaps stay alive while the new texture is wired to them.
        let overlaps = self.index_overlaps(&range);
        for &overlap in &overlaps {
            self.texture_inc_ref(overlap);
        }

        let texture = match self.find_view_or_copy(flags, info, &size_info, &range, &overlaps) {
            Some(texture) => texture,
            None => self.create_storage(flags, info, size_info, range, &overlaps),
        };

        if !for_sampler {
            self.auto_delete_add(texture);
        }
        self.add_to_index(texture);

        for overlap in overlaps {
            self.texture_dec_ref(overlap);
        }
        Some(texture)
    }

    /// Physical address of the texture's first byte, or of its first mapped byte if the start
    /// is unmapped.
    fn resolve_address(&self, info: &TextureInfo, layer_size: u64) -> Option<u64> {
        if let Some(address) = self.vm.translate(info.gpu_address) {
            return Some(address);
        }
        let size = info.calculate_size_info(layer_size).total_size;
        self.vm.translate_first_mapped(info.gpu_address, size)
    }

    /// A texture starting at `address` with `info`'s parameters and the same backing memory.
    /// Among equal matches the most recently GPU-written one wins.
    fn find_exact_match(
        &self,
        flags: TextureSearchFlags,
        info: &TextureInfo,
        address: u64,
        range: Option<&MultiRange>,
    ) -> Option<TextureId> {
        let mut best: Option<(TextureMatchQuality, u64, TextureId)> = None;
        for id in self.index_overlaps_at(address, 1) {
            let Some(tex) = self.textures.get(id) else {
                continue;
            };
            let quality = tex.is_exact_match(info, flags);
            if quality == TextureMatchQuality::NoMatch {
                continue;
            }

            let same_memory = match range {
                Some(range) => tex.range == *range,
                None => {
                    (tex.info.gpu_address == info.gpu_address && !tex.changed_mapping)
                        || self.vm.compare_range(&tex.range, info.gpu_address)
                }
            };
            if !same_memory {
                continue;
            }

            let sequence = self.modified_sequence(id);
            let better = best.map_or(true, |(best_quality, best_sequence, _)| {
                quality > best_quality || (quality == best_quality && sequence > best_sequence)
            });
            if better {
                best = Some((quality, sequence, id));
            }
        }
        best.map(|(_, _, id)| id)
    }

    fn modified_sequence(&self, id: TextureId) -> u64 {
        self.textures
            .get(id)
            .and_then(|t| t.group)
            .and_then(|g| self.groups.get(g))
            .map_or(0, |g| g.modified_sequence)
    }

    /// Serves the request from an overlapping texture: as a view of a fully compatible one, or
    /// as new storage fed by a copy-compatible one. Every other overlap is linked by copy
    /// dependency or registered as incompatible.
    fn find_view_or_copy(
        &mut self,
        flags: TextureSearchFlags,
        info: &TextureInfo,
        size_info: &SizeInfo,
        range: &MultiRange,
        overlaps: &[TextureId],
    ) -> Option<TextureId> {
        let caps = *self.ctx.capabilities();
        let for_sampler = flags.contains(TextureSearchFlags::FOR_SAMPLER);

        let mut classified = Vec::with_capacity(overlaps.len());
        for &id in overlaps {
            let Some(tex) = self.textures.get(id) else {
                continue;
            };
            let (mut compatibility, first_layer, first_level) =
                tex.is_view_compatible(info, range, for_sampler, size_info.layer_size, &caps, flags);
            if compatibility == TextureViewCompatibility::Full && tex.is_view() {
                compatibility = TextureViewCompatibility::CopyOnly;
            }
            classified.push(Overlap {
                texture: id,
                compatibility,
                first_layer,
                first_level,
            });
        }

        let mut parent: Option<(u64, Overlap)> = None;
        for overlap in classified.iter().filter(|o| o.compatibility == TextureViewCompatibility::Full) {
            let sequence = self.modified_sequence(overlap.texture);
            if parent.map_or(true, |(best, _)| sequence > best) {
                parent = Some((sequence, *overlap));
            }
        }

        let texture = if let Some((_, parent)) = parent {
            let parent_info = self.textures.get(parent.texture)?.info.clone();
            let view_info = if for_sampler {
                info.clone()
            } else {
                info_for_level_view(info, &parent_info, parent.first_level)
            };
            let view = self.texture_create_view(
                parent.texture,
                view_info,
                size_info.clone(),
                range.clone(),
                parent.first_layer,
                parent.first_level,
            )?;
            self.texture_synchronize_memory(view);
            view
        } else {
            let source = classified
                .iter()
                .find(|o| o.compatibility == TextureViewCompatibility::CopyOnly)
                .copied()?;
            let scale_mode = self.scale_mode_for(info, flags);
            let id = self.texture_insert(Texture::new(
                info.clone(),
                size_info.clone(),
                range.clone(),
                scale_mode,
            ));
            self.create_group(id, true, true, Vec::new());
            self.texture_initialize_data(id, false, false);
            self.texture_synchronize_memory(source.texture);
            self.texture_create_copy_dependency(
                source.texture,
                id,
                source.first_layer,
                source.first_level,
                true,
            );
            id
        };

        let group = self.textures.get(texture).and_then(|t| t.group);
        for overlap in &classified {
            let Some(other) = self.textures.get(overlap.texture) else {
                continue;
            };
            if overlap.compatibility <= TextureViewCompatibility::LayoutIncompatible {
                let registers = match (self.textures.get(texture), group, other.group) {
                    (Some(tex), Some(group), Some(other_group)) if !other.is_view() => tex
                        .data_overlaps(other, overlap.compatibility)
                        .then_some((group, other_group)),
                    _ => None,
                };
                if let Some((group, other_group)) = registers {
                    self.group_register_incompatible_overlap(
                        group,
                        IncompatibleOverlap {
                            group: other_group,
                            compatibility: overlap.compatibility,
                        },
                        true,
                    );
                }
            } else if other.group != group {
                self.texture_synchronize_memory(overlap.texture);
                self.texture_create_copy_dependency(
                    overlap.texture,
                    texture,
                    overlap.first_layer,
                    overlap.first_level,
                    true,
                );
            }
        }

        self.texture_synchronize_memory(texture);
        Some(texture)
    }

    /// Allocates new storage for the request and takes over what it overlaps: fully compatible
    /// textures become its views, copy-compatible ones get copy dependencies, and incompatible
    /// ones are evicted when their data is superseded.
    fn create_storage(
        &mut self,
        flags: TextureSearchFlags,
        info: &TextureInfo,
        size_info: SizeInfo,
        range: MultiRange,
        overlaps: &[TextureId],
    ) -> TextureId {
        let caps = *self.ctx.capabilities();
        let scale_mode = self.scale_mode_for(info, flags);
        let id = self.texture_insert(Texture::new(info.clone(), size_info, range, scale_mode));

        let mut set_data = flags.contains(TextureSearchFlags::FOR_SAMPLER)
            || overlaps.is_empty()
            || flags.contains(TextureSearchFlags::FOR_COPY);
        let mut view_compatible: Vec<Overlap> = Vec::new();
        let mut fully_compatible = 0;
        let (mut has_layer_views, mut has_mip_views) = (false, false);
        let mut incompatible: Vec<IncompatibleOverlap> = Vec::new();

        for &overlap in overlaps {
            let (Some(tex), Some(other)) = (self.textures.get(id), self.textures.get(overlap)) else {
                continue;
            };
            let (mut compatibility, first_layer, first_level) = tex.is_view_compatible(
                &other.info,
                &other.range,
                true,
                other.layer_size(),
                &caps,
                TextureSearchFlags::empty(),
            );
            if other.is_view() && compatibility == TextureViewCompatibility::Full {
                compatibility = TextureViewCompatibility::CopyOnly;
            }

            if compatibility > TextureViewCompatibility::LayoutIncompatible {
                has_layer_views |= other.info.slices() < tex.info.slices();
                has_mip_views |= other.info.levels < tex.info.levels;
                let entry = Overlap {
                    texture: overlap,
                    compatibility,
                    first_layer,
                    first_level,
                };
                if compatibility == TextureViewCompatibility::Full {
                    view_compatible.insert(fully_compatible, entry);
                    fully_compatible += 1;
                } else {
                    view_compatible.push(entry);
                }
                continue;
            }

            let data_overlaps = tex.data_overlaps(other, compatibility);
            let always_flush = other.always_flush_on_overlap;
            let is_buffer = other.info.target == Target::TextureBuffer;
            if let Some(group) = other.group.filter(|_| !other.is_view() && data_overlaps) {
                if !incompatible.iter().any(|o| o.group == group) {
                    incompatible.push(IncompatibleOverlap {
                        group,
                        compatibility,
                    });
                }
            }

            let in_cache = self.auto_delete.contains(overlap);
            let modified = self.texture_check_modified(overlap, false);
            if in_cache || !set_data {
                // Textures whose bytes interleave without touching keep coexisting.
                if !data_overlaps {
                    continue;
                }
                let flush = in_cache && !modified && always_flush;
                set_data |= modified || flush;
                if in_cache {
                    self.auto_delete_remove(overlap, flush);
                }
            }
            // Guest data written over the overlap belongs to the new texture.
            if modified && !is_buffer {
                self.texture_remove_from_pools(overlap, false);
            }
        }

        self.create_group(id, has_layer_views, has_mip_views, incompatible);
        // Loaded before views are copied in, so a later load cannot overwrite their data.
        self.texture_initialize_data(id, false, set_data);
        let group = self.textures.get(id).and_then(|t| t.group);
        if let Some(group) = group {
            self.group_initialize_overlaps(group);
        }

        for overlap in view_compatible {
            let Some(other) = self.textures.get(overlap.texture) else {
                continue;
            };
            if other.group == group {
                continue;
            }
            let other_scale = other.scale_factor;
            if self.textures.get(id).is_some_and(|t| t.scale_factor != other_scale) {
                self.texture_propagate_scale(id, overlap.texture);
            }

            if overlap.compatibility == TextureViewCompatibility::Full {
                self.adopt_as_view(id, overlap);
            } else {
                self.texture_synchronize_memory(overlap.texture);
                self.texture_create_copy_dependency(
                    id,
                    overlap.texture,
                    overlap.first_layer,
                    overlap.first_level,
                    false,
                );
            }
        }

        self.texture_synchronize_memory(id);
        debug!(
            ?id,
            width = info.width,
            height = info.height,
            format = ?info.format_info.format,
            overlaps = overlaps.len(),
            "created texture storage"
        );
        id
    }

    /// Turns `overlap`, which `storage` fully contains, into a view of it after copying its
    /// data into place.
    fn adopt_as_view(&mut self, storage: TextureId, overlap: Overlap) {
        let caps = *self.ctx.capabilities();
        let (Some(tex), Some(other)) = (self.textures.get(storage), self.textures.get(overlap.texture))
        else {
            return;
        };
        let Some(host) = tex.host else {
            return;
        };
        let other_info = other.info.clone();
        let create = create_info(&other_info, &caps, other.scale_factor);

        let view = match self.ctx.renderer().create_texture_view(
            host,
            &create,
            overlap.first_layer,
            overlap.first_level,
        ) {
            Ok(view) => view,
            Err(err) => {
                warn!(?err, texture = ?overlap.texture, "cannot adopt overlap as view; linking by copy");
                self.texture_synchronize_memory(overlap.texture);
                self.texture_create_copy_dependency(
                    storage,
                    overlap.texture,
                    overlap.first_layer,
                    overlap.first_level,
                    false,
                );
                return;
            }
        };

        self.texture_synchronize_memory(overlap.texture);
        if let Some(source) = self.textures.get(overlap.texture).and_then(|t| t.host) {
            if let Err(err) = self.ctx.renderer().copy_texture(source, view, 0, 0) {
                warn!(?err, texture = ?overlap.texture, "failed to copy overlap into its new storage");
            }
        }
        self.texture_replace_view(
            overlap.texture,
            storage,
            other_info,
            view,
            overlap.first_layer,
            overlap.first_level,
        );
    }

    fn scale_mode_for(&self, info: &TextureInfo, flags: TextureSearchFlags) -> TextureScaleMode {
        upscale_mode(
            info,
            flags.contains(TextureSearchFlags::WITH_UPSCALE),
            self.ctx.config().scale_eligible_min_size,
        )
    }

    /// Moves storage texture `id` to `range` after its GPU mapping changed.
    ///
    /// Refused if another texture at the new range could be a view or copy of it, since the two
    /// would then have to be merged.
    pub(crate) fn update_mapping(&mut self, id: TextureId, range: MultiRange) -> bool {
        let caps = *self.ctx.capabilities();
        let overlaps = self.index_overlaps(&range);
        let Some(tex) = self.textures.get(id) else {
            return false;
        };
        for other_id in overlaps {
            if other_id == id {
                continue;
            }
            let Some(other) = self.textures.get(other_id) else {
                continue;
            };
            let (forward, _, _) = tex.is_view_compatible(
                &other.info,
                &other.range,
                true,
                other.layer_size(),
                &caps,
                TextureSearchFlags::empty(),
            );
            let (backward, _, _) = other.is_view_compatible(
                &tex.info,
                &range,
                true,
                tex.layer_size(),
                &caps,
                TextureSearchFlags::empty(),
            );
            if forward != TextureViewCompatibility::Incompatible
                || backward != TextureViewCompatibility::Incompatible
            {
                return false;
            }
        }

        self.shared.index_mut().remove(&id);
        let group = match self.textures.get_mut(id) {
            Some(tex) => {
                tex.range = range;
                tex.changed_mapping = true;
                tex.group
            }
            None => return false,
        };
        if let Some(group) = group {
            self.group_range_changed(group);
        }
        if let Some(tex) = self.textures.get(id) {
            self.shared.index_mut().insert(id, &tex.range);
        }
        debug!(?id, "texture followed a remap");
        true
    }
}

fn has_valid_dimensions(info: &TextureInfo) -> bool {
    if info.width < 1 || info.height < 1 || info.levels < 1 {
        return false;
    }
    let layered = matches!(
        info.target,
        Target::Texture3D | Target::Texture2DArray | Target::Texture2DMultisampleArray | Target::CubemapArray
    );
    !layered || info.depth_or_layers >= 1
}

fn render_target_kind(target: &RenderTarget) -> Target {
    let layered = target.depth > 1 && target.layered;
    if target.is_3d {
        Target::Texture3D
    } else if (target.samples_in_x | target.samples_in_y) != 1 {
        if layered {
            Target::Texture2DMultisampleArray
        } else {
            Target::Texture2DMultisample
        }
    } else if layered {
        Target::Texture2DArray
    } else {
        Target::Texture2D
    }
}

/// The narrowest width not below `minimum` that tiles like `width`: it stays in the same GOB
/// column count, so no data is lost.
fn minimum_width_in_gob(width: u32, minimum: u32, bytes_per_pixel: u32, linear: bool) -> u32 {
    if linear || minimum >= width {
        return width;
    }
    let alignment = (GOB_STRIDE / bytes_per_pixel.max(1)).max(1);
    let aligned = width.next_multiple_of(alignment);
    (aligned - alignment + 1).clamp(minimum, aligned)
}

/// `info` resized to what level `first_level` of `parent` really is, so uploads to the view
/// match the host texture.
fn info_for_level_view(info: &TextureInfo, parent: &TextureInfo, first_level: u32) -> TextureInfo {
    let mut width = (parent.width >> first_level).max(1);
    let mut height = (parent.height >> first_level).max(1);
    let (parent_format, format) = (&parent.format_info, &info.format_info);
    if parent_format.is_compressed() && !format.is_compressed() {
        width = width.div_ceil(parent_format.block_width);
        height = height.div_ceil(parent_format.block_height);
    } else if !parent_format.is_compressed() && format.is_compressed() {
        width *= format.block_width;
        height *= format.block_height;
    }

    let depth_or_layers = if info.target == Target::Texture3D {
        (parent.depth_or_layers >> first_level).max(1)
    } else {
        info.depth_or_layers
    };

    // A copy may address a multisample texture as plain 2D; the view keeps the samples.
    let (target, samples_in_x, samples_in_y) =
        if info.target == Target::Texture2D && parent.target == Target::Texture2DMultisample {
            (parent.target, parent.samples_in_x, parent.samples_in_y)
        } else {
            (info.target, info.samples_in_x, info.samples_in_y)
        };

    TextureInfo {
        width,
        height,
        depth_or_layers,
        target,
        samples_in_x,
        samples_in_y,
        ..info.clone()
    }
}

fn upscale_mode(info: &TextureInfo, with_upscale: bool, min_size: u32) -> TextureScaleMode {
    let scalable_target = matches!(
        info.target,
        Target::Texture2D | Target::Texture2DArray | Target::Texture2DMultisample
    );
    if !scalable_target || info.format_info.is_compressed() {
        return TextureScaleMode::Blacklisted;
    }
    if !upscale_safe(info, min_size) {
        return TextureScaleMode::Undesired;
    }
    if with_upscale {
        TextureScaleMode::Scaled
    } else {
        TextureScaleMode::Eligible
    }
}

/// Heuristic for render-target-like textures. Deep mip chains, small textures and square
/// color textures are usually sampled assets that scaling would only blur.
fn upscale_safe(info: &TextureInfo, min_size: u32) -> bool {
    if info.levels > 3 || info.width < min_size || info.height < min_size {
        return false;
    }
    let alignment = if info.is_linear { STRIDE_ALIGNMENT } else { GOB_ALIGNMENT };
    let alignment = (alignment / info.format_info.bytes_per_pixel.max(1)).max(1);
    let depth_like = info.format_info.format.is_depth_or_stencil() || info.format_info.components == 1;
    // Widths may be padded, so both sides are compared aligned.
    let possibly_square =
        info.width.next_multiple_of(alignment) == info.height.next_multiple_of(alignment);
    depth_like || !possibly_square
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use pretty_assertions::assert_eq;

    fn rgba(width: u32, height: u32) -> TextureInfo {
        TextureInfo {
            width,
            height,
            format_info: Format::R8G8B8A8Unorm.info(),
            ..TextureInfo::default()
        }
    }

    #[test]
    fn minimum_width_stays_within_the_gob_column() {
        // 16 RGBA8 pixels per GOB row: 100 pads to 112, anything above 96 tiles the same.
        assert_eq!(minimum_width_in_gob(100, 40, 4, false), 97);
        assert_eq!(minimum_width_in_gob(100, 99, 4, false), 99);
        assert_eq!(minimum_width_in_gob(100, 200, 4, false), 100);
        assert_eq!(minimum_width_in_gob(100, 40, 4, true), 100);
    }

    #[test]
    fn only_rectangular_render_targets_upscale() {
        assert_eq!(upscale_mode(&rgba(1280, 720), true, 64), TextureScaleMode::Scaled);
        assert_eq!(upscale_mode(&rgba(1280, 720), false, 64), TextureScaleMode::Eligible);
        assert_eq!(upscale_mode(&rgba(256, 256), true, 64), TextureScaleMode::Undesired);
        assert_eq!(upscale_mode(&rgba(32, 720), true, 64), TextureScaleMode::Undesired);

        let mut mipped = rgba(1280, 720);
        mipped.levels = 4;
        assert_eq!(upscale_mode(&mipped, true, 64), TextureScaleMode::Undesired);

        let mut volume = rgba(1280, 720);
        volume.target = Target::Texture3D;
        assert_eq!(upscale_mode(&volume, true, 64), TextureScaleMode::Blacklisted);

        let mut depth = rgba(256, 256);
        depth.format_info = Format::D32Float.info();
        assert_eq!(upscale_mode(&depth, true, 64), TextureScaleMode::Scaled);
    }

    #[test]
    fn level_views_take_the_parent_level_size() {
        let parent = TextureInfo {
            levels: 4,
            ..rgba(256, 128)
        };
        let view = info_for_level_view(&rgba(1, 1), &parent, 2);
        assert_eq!((view.width, view.height), (64, 32));

        let mut compressed = rgba(64, 64);
        compressed.format_info = Format::Bc1RgbaUnorm.info();
        let view = info_for_level_view(&compressed, &parent, 1);
        assert_eq!((view.width, view.height), (512, 256));
    }

    #[test]
    fn invalid_dimensions_are_rejected() {
        assert!(has_valid_dimensions(&rgba(1, 1)));
        assert!(!has_valid_dimensions(&rgba(0, 1)));
        let mut array = rgba(4, 4);
        array.target = Target::Texture2DArray;
        array.depth_or_layers = 0;
        assert!(!has_valid_dimensions(&array));
    }
}
