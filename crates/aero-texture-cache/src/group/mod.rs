//! Subresource tracking shared by a storage texture and its views.
//!
//! A group splits its storage's bytes into handles. It starts with one handle and subdivides into
//! per-layer and per-level handles once views need that granularity, so dirty and modified state
//! can be tracked for exactly the slices a view covers.

mod dependency;
mod handle;

pub(crate) use dependency::DependencyGraph;
pub(crate) use handle::{HandleEvent, TextureGroupHandle};
pub use handle::{HandleSnapshot, HandleState};

use tracing::{debug, trace, warn};

use crate::backend::{Capabilities, HostBufferId, HostTextureId};
use crate::cache::TextureCache;
use crate::compat::{self, TextureViewCompatibility};
use crate::error::Result;
use crate::info::{Target, TextureInfo};
use crate::layout::{encode_slice, SurfaceLayout};
use crate::memory::{MultiRange, TrackingOwner};
use crate::{GroupId, HandleId, TextureId};

/// A group whose data overlaps ours without being viewable as it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct IncompatibleOverlap {
    pub(crate) group: GroupId,
    pub(crate) compatibility: TextureViewCompatibility,
}

/// `count` consecutive handles starting at `base`. `split` spans are one layer of a view that
/// covers several layers but not every level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct HandleSpan {
    base: usize,
    count: usize,
    split: bool,
}

impl HandleSpan {
    fn new(base: usize, count: usize) -> Self {
        Self {
            base,
            count,
            split: false,
        }
    }
}

/// Slices covered by one handle.
#[derive(Clone, Copy, Debug)]
struct HandleInfo {
    base_layer: u32,
    base_level: u32,
    levels: u32,
    layers: u32,
}

#[derive(Debug)]
pub(crate) struct TextureGroup {
    pub(crate) storage: TextureId,
    owner: TrackingOwner,

    all_offsets: Vec<u64>,
    slice_sizes: Vec<u64>,
    total_size: u64,
    is_3d: bool,
    is_buffer: bool,
    layers: u32,
    levels: u32,

    has_layer_views: bool,
    has_mip_views: bool,

    pub(crate) handles: Vec<HandleId>,
    views: Vec<TextureId>,

    incompatible_overlaps: Vec<IncompatibleOverlap>,
    incompatible_overlaps_dirty: bool,
    flush_incompatible_overlaps: bool,

    pub(crate) has_copy_dependencies: bool,
    pub(crate) modified_sequence: u64,
    flush_buffer: Option<HostBufferId>,
}

impl TextureGroup {
    pub(crate) fn new(
        storage: TextureId,
        info: &TextureInfo,
        caps: &Capabilities,
        owner: TrackingOwner,
        incompatible_overlaps: Vec<IncompatibleOverlap>,
    ) -> Self {
        Self {
            storage,
            owner,
            all_offsets: Vec::new(),
            slice_sizes: Vec::new(),
            total_size: 0,
            is_3d: info.target == Target::Texture3D,
            is_buffer: info.target == Target::TextureBuffer,
            layers: info.slices().max(1),
            levels: info.levels.max(1),
            has_layer_views: false,
            has_mip_views: false,
            handles: Vec::new(),
            views: Vec::new(),
            incompatible_overlaps,
            incompatible_overlaps_dirty: true,
            flush_incompatible_overlaps: compat::is_format_host_incompatible(info, caps),
            has_copy_dependencies: false,
            modified_sequence: 0,
            flush_buffer: None,
        }
    }

    pub(crate) fn owner(&self) -> TrackingOwner {
        self.owner
    }

    pub(crate) fn is_fully_subdivided(&self) -> bool {
        self.has_layer_views && self.has_mip_views
    }

    /// Mip views of an array need per-layer handles too, and layer views of a 3D texture need
    /// per-level handles, so the handle set does not depend on the order views arrive in.
    fn propagate_granularity(&self, layer_views: bool, mip_views: bool) -> (bool, bool) {
        if self.is_3d {
            (layer_views, mip_views || layer_views)
        } else {
            (layer_views || mip_views, mip_views)
        }
    }

    /// First slice index and depth of a 3D level.
    fn level_range_3d(&self, level: u32) -> (usize, usize) {
        let mut index = 0;
        let mut count = self.layers as usize;
        for _ in 0..level {
            index += count;
            count = (count >> 1).max(1);
        }
        (index, count)
    }

    fn layer_level_for_view(&self, index: usize) -> (u32, u32) {
        if self.is_3d {
            let mut index = index;
            let mut level = 0;
            let mut level_layers = self.layers as usize;
            while index >= level_layers {
                index -= level_layers;
                level += 1;
                level_layers = (level_layers >> 1).max(1);
            }
            (index as u32, level)
        } else {
            let levels = self.levels as usize;
            ((index / levels) as u32, (index % levels) as u32)
        }
    }

    pub(crate) fn offset_index(&self, layer: u32, level: u32) -> usize {
        if self.is_3d {
            layer as usize + self.level_range_3d(level).0
        } else {
            (level + layer * self.levels) as usize
        }
    }

    pub(crate) fn offset_of(&self, layer: u32, level: u32) -> u64 {
        self.all_offsets
            .get(self.offset_index(layer, level))
            .copied()
            .unwrap_or(0)
    }

    fn handle_information(&self, handle_index: usize) -> HandleInfo {
        let levels = if self.has_mip_views { 1 } else { self.levels };
        let layers = if self.has_layer_views { 1 } else { self.layers };

        if self.is_3d {
            if self.has_layer_views {
                let (base_layer, base_level) = self.layer_level_for_view(handle_index);
                HandleInfo {
                    base_layer,
                    base_level,
                    levels,
                    layers,
                }
            } else {
                let base_level = handle_index as u32;
                let (_, depth) = self.level_range_3d(base_level);
                HandleInfo {
                    base_layer: 0,
                    base_level,
                    levels,
                    layers: depth as u32,
                }
            }
        } else {
            let index = handle_index as u32;
            let (base_layer, base_level) = if self.has_mip_views {
                (index / self.levels, index % self.levels)
            } else {
                (index, 0)
            };
            HandleInfo {
                base_layer,
                base_level,
                levels,
                layers,
            }
        }
    }

    /// Handles covering `slices` layers and `levels` levels from `(first_layer, first_level)`.
    fn spans(&self, first_layer: u32, first_level: u32, slices: u32, levels: u32) -> Vec<HandleSpan> {
        if self.is_buffer {
            return Vec::new();
        }
        if !(self.has_layer_views || self.has_mip_views) {
            return vec![HandleSpan::new(0, self.handles.len())];
        }

        let target_layer_handles = if self.has_layer_views { slices as usize } else { 1 };
        let target_level_handles = if self.has_mip_views { levels as usize } else { 1 };

        if self.is_3d {
            if !self.has_layer_views {
                return vec![HandleSpan::new(first_level as usize, target_level_handles)];
            }

            let mut spans: Vec<HandleSpan> = Vec::new();
            for i in 0..levels {
                let level = first_level + i;
                if level >= self.levels {
                    break;
                }
                let (index, depth) = self.level_range_3d(level);
                let layer = (first_layer >> i) as usize;
                if layer >= depth {
                    continue;
                }
                let count = ((slices >> i).max(1) as usize).min(depth - layer);
                let base = index + layer;
                match spans.last_mut() {
                    Some(last) if last.base + last.count == base => last.count += count,
                    _ => spans.push(HandleSpan::new(base, count)),
                }
            }
            spans
        } else {
            let level_handles = if self.has_mip_views { self.levels as usize } else { 1 };
            let first_layer = first_layer as usize;
            let first_level = first_level as usize;

            if slices > 1 && levels < self.levels {
                (0..slices as usize)
                    .map(|i| HandleSpan {
                        base: first_level + (first_layer + i) * level_handles,
                        count: target_level_handles,
                        split: true,
                    })
                    .collect()
            } else {
                vec![HandleSpan::new(
                    first_level + first_layer * level_handles,
                    target_level_handles + (target_layer_handles - 1) * level_handles,
                )]
            }
        }
    }

    fn span_handles(&self, span: HandleSpan) -> Vec<HandleId> {
        let end = (span.base + span.count).min(self.handles.len());
        self.handles
            .get(span.base.min(end)..end)
            .map(<[HandleId]>::to_vec)
            .unwrap_or_default()
    }

    /// `(view_start, views)` of every handle the current granularity calls for.
    fn handle_layout(&self) -> Vec<(usize, usize)> {
        if self.is_buffer {
            return Vec::new();
        }
        if !(self.has_layer_views || self.has_mip_views) {
            return vec![(0, self.all_offsets.len())];
        }

        let mut layout = Vec::new();
        let mut layer_handles = if self.has_layer_views { self.layers as usize } else { 1 };
        let level_handles = if self.has_mip_views { self.levels as usize } else { 1 };

        if self.is_3d {
            for level in 0..level_handles {
                let (start, depth) = self.level_range_3d(level as u32);
                for layer in 0..layer_handles {
                    let views = if self.has_layer_views { 1 } else { depth };
                    layout.push((start + layer, views));
                }
                layer_handles = (layer_handles >> 1).max(1);
            }
        } else {
            for layer in 0..layer_handles {
                for level in 0..level_handles {
                    let views = if self.has_mip_views { 1 } else { self.levels as usize };
                    layout.push((level + layer * self.levels as usize, views));
                }
            }
        }
        layout
    }
}

/// Byte extent of each handle in `layout`: from its first slice to the next handle's first
/// slice, so padding between slices belongs to exactly one handle.
fn handle_extents(group: &TextureGroup, layout: &[(usize, usize)]) -> Vec<(u64, u64)> {
    let starts: Vec<u64> = layout
        .iter()
        .map(|&(start, _)| group.all_offsets.get(start).copied().unwrap_or(0))
        .collect();
    starts
        .iter()
        .map(|&start| {
            let end = starts
                .iter()
                .copied()
                .filter(|&other| other > start)
                .min()
                .unwrap_or(group.total_size)
                .max(start);
            (start, end - start)
        })
        .collect()
}

impl TextureCache {
    fn storage_info(&self, group: GroupId) -> Option<(TextureInfo, MultiRange)> {
        let storage = self.groups.get(group)?.storage;
        let texture = self.textures.get(storage)?;
        Some((texture.info.clone(), texture.range.clone()))
    }

    /// Relevant handle spans of `texture` in `group`.
    fn texture_spans(&self, group: GroupId, texture: TextureId) -> Vec<HandleSpan> {
        let (Some(g), Some(tex)) = (self.groups.get(group), self.textures.get(texture)) else {
            return Vec::new();
        };
        if texture == g.storage || !(g.has_mip_views || g.has_layer_views) {
            if g.is_buffer {
                return Vec::new();
            }
            return vec![HandleSpan::new(0, g.handles.len())];
        }
        g.spans(
            tex.first_layer,
            tex.first_level,
            tex.info.slices(),
            tex.info.levels,
        )
    }

    /// Creates the group owned by `storage` and its initial handles.
    pub(crate) fn create_group(
        &mut self,
        storage: TextureId,
        has_layer_views: bool,
        has_mip_views: bool,
        incompatible_overlaps: Vec<IncompatibleOverlap>,
    ) -> Option<GroupId> {
        let tex = self.textures.get(storage)?;
        self.next_owner += 1;
        let mut group = TextureGroup::new(
            storage,
            &tex.info,
            self.ctx.capabilities(),
            TrackingOwner(self.next_owner),
            incompatible_overlaps,
        );

        group.all_offsets = tex.size_info.all_offsets().to_vec();
        group.slice_sizes = tex.size_info.slice_sizes().to_vec();
        group.total_size = tex.size_info.total_size;

        let threshold = self.ctx.config().granular_layer_threshold;
        let has_depth_or_layers = tex.info.depth() > 1 || tex.info.layers() > 1;
        if has_depth_or_layers && tex.info.slices() > threshold {
            group.has_layer_views = true;
            group.has_mip_views = true;
        } else {
            let (layer_views, mip_views) =
                group.propagate_granularity(has_layer_views, has_mip_views);
            group.has_layer_views = layer_views;
            group.has_mip_views = mip_views;
            if tex.range.has_unmapped() {
                group.has_layer_views = true;
                group.has_mip_views = true;
            }
        }

        let id = self.groups.insert(group);
        if let Some(tex) = self.textures.get_mut(storage) {
            tex.group = Some(id);
        }
        self.group_recalculate_handle_regions(id, false);
        Some(id)
    }

    /// Registers this group with the incompatible overlaps it was created with.
    pub(crate) fn group_initialize_overlaps(&mut self, id: GroupId) {
        let Some(overlaps) = self.groups.get(id).map(|g| g.incompatible_overlaps.clone()) else {
            return;
        };
        for overlap in &overlaps {
            if overlap.compatibility == TextureViewCompatibility::LayoutIncompatible {
                self.group_create_group_copy_dependency(id, overlap.group, false);
            }
            if let Some(other) = self.groups.get_mut(overlap.group) {
                other.incompatible_overlaps.push(IncompatibleOverlap {
                    group: id,
                    compatibility: overlap.compatibility,
                });
                other.incompatible_overlaps_dirty = true;
            }
        }
        if !overlaps.is_empty() {
            self.group_signal_incompatible_overlap_modified(id);
        }
    }

    fn group_signal_all_dirty(&mut self, id: GroupId) {
        let Some(group) = self.groups.get(id) else {
            return;
        };
        let mut textures = vec![group.storage];
        textures.extend(group.views.iter().copied());
        for texture in textures {
            self.signal_group_dirty(texture);
        }
    }

    fn group_signal_incompatible_overlap_modified(&mut self, id: GroupId) {
        let Some(group) = self.groups.get_mut(id) else {
            return;
        };
        group.incompatible_overlaps_dirty = true;
        if group.flush_incompatible_overlaps {
            self.group_signal_all_dirty(id);
        }
    }

    /// A converted texture cannot be flushed, so before it is loaded from guest memory every
    /// incompatible overlap must have written its data there.
    pub(crate) fn group_flush_incompatible_overlaps_if_needed(&mut self, id: GroupId) -> bool {
        let Some(group) = self.groups.get_mut(id) else {
            return false;
        };
        if !(group.flush_incompatible_overlaps && group.incompatible_overlaps_dirty) {
            return false;
        }
        group.incompatible_overlaps_dirty = false;
        let overlaps = group.incompatible_overlaps.clone();

        let mut flushed = false;
        for overlap in overlaps {
            if let Some(storage) = self.groups.get(overlap.group).map(|g| g.storage) {
                flushed |= self.texture_flush_modified(storage, true);
            }
        }
        flushed
    }

    /// Whether guest memory under `texture` changed; with `consume` the changes count as loaded.
    pub(crate) fn group_check_dirty(&mut self, id: GroupId, texture: TextureId, consume: bool) -> bool {
        let mut dirty = false;
        for span in self.texture_spans(id, texture) {
            let handles = match self.groups.get(id) {
                Some(group) => group.span_handles(span),
                None => return false,
            };
            for handle in handles {
                self.observe_guest_writes(handle);
                let Some(h) = self.handles.get_mut(handle) else {
                    continue;
                };
                if h.state.is_dirty() {
                    dirty = true;
                    if consume {
                        h.apply(HandleEvent::Reloaded);
                    }
                }
            }
        }
        dirty
    }

    /// Whether the guest wrote any of `texture`'s memory since its handles last looked.
    pub(crate) fn group_has_guest_writes(&self, id: GroupId, texture: TextureId) -> bool {
        let Some(group) = self.groups.get(id) else {
            return false;
        };
        self.texture_spans(id, texture)
            .into_iter()
            .flat_map(|span| group.span_handles(span))
            .any(|handle| self.handles.get(handle).is_some_and(|h| h.has_guest_writes()))
    }

    pub(crate) fn group_discard_data(&mut self, id: GroupId, texture: TextureId) {
        for span in self.texture_spans(id, texture) {
            let handles = match self.groups.get(id) {
                Some(group) => group.span_handles(span),
                None => return,
            };
            for handle in handles {
                self.handle_discard(handle);
            }
        }
    }

    /// Brings `texture`'s host data up to date, loading dirty slices from guest memory and
    /// pulling pending copies from dependencies.
    pub(crate) fn group_synchronize_memory(&mut self, id: GroupId, texture: TextureId) -> Result<()> {
        self.group_flush_incompatible_overlaps_if_needed(id);

        for span in self.texture_spans(id, texture) {
            let (handles, handle_count) = match self.groups.get(id) {
                Some(group) => (group.span_handles(span), group.handles.len()),
                None => return Ok(()),
            };

            let mut dirty = false;
            let mut any_modified = false;
            let mut any_not_dirty = false;
            let mut load_needed = Vec::with_capacity(handles.len());
            let mut reloaded = Vec::new();

            for &handle in &handles {
                self.observe_guest_writes(handle);
                let Some(h) = self.handles.get(handle) else {
                    load_needed.push(false);
                    continue;
                };
                let state = h.state;
                let unmapped = h.unmapped;
                let mut handle_dirty = state.is_dirty();

                if state.deferred_copy().is_some() && self.handle_copy(handle, None) {
                    any_modified = true;
                    handle_dirty = false;
                } else {
                    any_modified |= state.is_modified();
                    dirty |= handle_dirty;
                }

                let still_pending = self
                    .handles
                    .get(handle)
                    .is_some_and(|h| h.state.deferred_copy().is_some());
                if still_pending {
                    self.signal_group_dirty(texture);
                }

                if handle_dirty {
                    reloaded.push(handle);
                }
                let needed = handle_dirty && !unmapped;
                any_not_dirty |= !needed;
                load_needed.push(needed);
            }

            if dirty {
                if any_not_dirty || (handle_count > 1 && (any_modified || span.split)) {
                    self.group_synchronize_partial(id, span.base, &load_needed)?;
                } else {
                    self.texture_synchronize_full(texture)?;
                }
            }

            for handle in reloaded {
                if let Some(h) = self.handles.get_mut(handle) {
                    h.apply(HandleEvent::Reloaded);
                }
            }
        }
        Ok(())
    }

    /// Uploads the slices of every handle flagged in `load_needed`, reading each run of
    /// consecutive handles from guest memory at once.
    fn group_synchronize_partial(
        &mut self,
        id: GroupId,
        base: usize,
        load_needed: &[bool],
    ) -> Result<()> {
        let Some(group) = self.groups.get(id) else {
            return Ok(());
        };
        let storage = group.storage;
        let Some((info, range)) = self.storage_info(id) else {
            return Ok(());
        };

        let mut i = 0;
        while i < load_needed.len() {
            if !load_needed[i] {
                i += 1;
                continue;
            }
            let mut end = i + 1;
            while end < load_needed.len() && load_needed[end] {
                end += 1;
            }

            let Some(group) = self.groups.get(id) else {
                return Ok(());
            };
            let mut slices = Vec::new();
            for index in base + i..base + end {
                let handle = group.handle_information(index);
                for layer in 0..handle.layers {
                    for level in 0..handle.levels {
                        let (layer, level) = (handle.base_layer + layer, handle.base_level + level);
                        let offset = group.offset_of(layer, level);
                        let size = group
                            .slice_sizes
                            .get(level as usize)
                            .copied()
                            .unwrap_or(0)
                            .min(group.total_size.saturating_sub(offset));
                        slices.push((layer, level, offset, size));
                    }
                }
            }

            let span_base = slices.iter().map(|s| s.2).min().unwrap_or(0);
            let span_end = slices.iter().map(|s| s.2 + s.3).max().unwrap_or(span_base);
            let data = self
                .physical
                .read_range(&range.slice(span_base, span_end - span_base))?;

            for (layer, level, offset, _) in slices {
                let start = (offset - span_base) as usize;
                let guest = data.get(start..).unwrap_or(&[]);
                let host = self.texture_convert_to_host(&info, guest, level, true);
                self.texture_set_data_slice(storage, &host, layer, level)?;
            }
            trace!(?id, first = base + i, count = end - i, "partial upload");

            i = end;
        }
        Ok(())
    }

    pub(crate) fn group_synchronize_dependents(&mut self, id: GroupId, texture: TextureId) {
        for span in self.texture_spans(id, texture) {
            let handles = match self.groups.get(id) {
                Some(group) => group.span_handles(span),
                None => return,
            };
            for handle in handles {
                self.handle_synchronize_dependents(handle);
            }
        }
    }

    fn group_should_flush_trigger_tracking(&self, id: GroupId) -> bool {
        let Some(group) = self.groups.get(id) else {
            return false;
        };
        group.incompatible_overlaps.iter().any(|overlap| {
            self.groups
                .get(overlap.group)
                .is_some_and(|g| g.flush_incompatible_overlaps)
        })
    }

    /// Writes slice `index` of the storage back to guest memory.
    fn group_flush_slice(
        &mut self,
        id: GroupId,
        tracked: bool,
        index: usize,
        in_buffer: bool,
        flush_texture: Option<HostTextureId>,
    ) -> Result<()> {
        let Some(group) = self.groups.get(id) else {
            return Ok(());
        };
        let storage = group.storage;
        let owner = group.owner;
        let flush_buffer = group.flush_buffer;
        let (layer, level) = group.layer_level_for_view(index);
        let Some(&offset) = group.all_offsets.get(index) else {
            return Ok(());
        };
        let slice_size = group.slice_sizes.get(level as usize).copied().unwrap_or(0);
        let end = (offset + slice_size).min(group.total_size);
        let Some((info, range)) = self.storage_info(id) else {
            return Ok(());
        };
        let slice_range = range.slice(offset, end.saturating_sub(offset));

        let packed = match (in_buffer, flush_buffer) {
            (true, Some(buffer)) => {
                let len = SurfaceLayout::for_level(&info, level).packed_size(1) as u64;
                self.ctx.renderer().get_buffer_data(buffer, offset, len)?
            }
            _ => self.texture_slice_data(storage, layer, level, tracked, flush_texture)?,
        };

        let mut guest = self.physical.read_range(&slice_range)?;
        encode_slice(&info, level, true, &packed, &mut guest);
        self.physical
            .write_range(&slice_range, &guest, tracked.then_some(owner))?;
        self.stats.inc_flushes();
        Ok(())
    }

    fn group_flush_slice_range(
        &mut self,
        id: GroupId,
        tracked: bool,
        start: usize,
        end: usize,
        in_buffer: bool,
        flush_texture: Option<HostTextureId>,
    ) {
        for index in start..end {
            if let Err(err) = self.group_flush_slice(id, tracked, index, in_buffer, flush_texture) {
                warn!(?err, index, "failed to flush texture slice");
            }
        }
    }

    /// Writes GPU-modified slices of `texture` back to guest memory.
    ///
    /// `tracked` flushes are seen by other watchers of the memory and leave the handles clean;
    /// untracked ones only copy the data.
    pub(crate) fn group_flush_modified(&mut self, id: GroupId, texture: TextureId, tracked: bool) -> bool {
        let tracked = tracked || self.group_should_flush_trigger_tracking(id);
        let mut flushed = false;

        for span in self.texture_spans(id, texture) {
            let handles = match self.groups.get(id) {
                Some(group) => group.span_handles(span),
                None => return flushed,
            };

            let mut start_slice = 0;
            let mut end_slice = 0;
            let mut all_modified = true;

            for handle in handles {
                let Some(h) = self.handles.get_mut(handle) else {
                    continue;
                };
                if !h.state.is_modified() {
                    all_modified = false;
                    continue;
                }

                let (base_slice, slice_count) = (h.base_slice, h.slice_count);
                if tracked {
                    h.apply(HandleEvent::Flushed);
                    let overlaps = h.overlaps.clone();
                    for view in overlaps {
                        self.signal_modified_dirty(view);
                    }
                }

                if end_slice < base_slice {
                    if end_slice > start_slice {
                        self.group_flush_slice_range(id, tracked, start_slice, end_slice, false, None);
                        flushed = true;
                    }
                    start_slice = base_slice;
                }
                end_slice = base_slice + slice_count;
            }

            if end_slice > start_slice {
                if all_modified && !span.split {
                    self.texture_flush(texture, tracked);
                } else {
                    self.group_flush_slice_range(id, tracked, start_slice, end_slice, false, None);
                }
                flushed = true;
            }
        }

        if let Some(storage) = self.groups.get(id).map(|g| g.storage) {
            self.signal_modified_dirty(storage);
        }
        flushed
    }

    /// Stages the handle's slices into the group's flush buffer so a later guest access can
    /// read them without waiting on a texture readback.
    pub(crate) fn group_flush_into_buffer(&mut self, handle: HandleId) {
        let Some(h) = self.handles.get(handle) else {
            return;
        };
        let (id, base_slice, slice_count) = (h.group, h.base_slice, h.slice_count);
        let Some(group) = self.groups.get(id) else {
            return;
        };
        let storage = group.storage;

        if group.flush_buffer.is_none() {
            let Some((info, _)) = self.storage_info(id) else {
                return;
            };
            if !compat::can_texture_flush(&info, self.ctx.capabilities()) {
                return;
            }
            let size = group.total_size;
            let buffer = self.ctx.renderer().create_buffer(size);
            if let Some(group) = self.groups.get_mut(id) {
                group.flush_buffer = Some(buffer);
            }
            self.texture_blacklist_scale(storage);
        }

        let Some(group) = self.groups.get(id) else {
            return;
        };
        let Some(buffer) = group.flush_buffer else {
            return;
        };
        let slices: Vec<(u64, u32, u32)> = (base_slice..base_slice + slice_count)
            .filter_map(|index| {
                let (layer, level) = group.layer_level_for_view(index);
                group.all_offsets.get(index).map(|&offset| (offset, layer, level))
            })
            .collect();

        let Some(host) = self.texture_flush_host(storage) else {
            return;
        };
        for (offset, layer, level) in slices {
            if let Err(err) = self
                .ctx
                .renderer()
                .copy_texture_to_buffer(host, buffer, offset, layer, level)
            {
                warn!(?err, "failed to stage texture slice in flush buffer");
            }
        }
    }

    /// A write to `texture` supersedes GPU data held by incompatible overlaps in its range.
    fn group_clear_incompatible_overlaps(&mut self, id: GroupId, texture: TextureId) {
        let Some(group) = self.groups.get_mut(id) else {
            return;
        };
        if !group.incompatible_overlaps_dirty {
            return;
        }
        group.incompatible_overlaps_dirty = false;
        let overlaps = group.incompatible_overlaps.clone();
        let Some(range) = self.textures.get(texture).map(|t| t.range.clone()) else {
            return;
        };
        for overlap in overlaps {
            self.group_clear_modified(overlap.group, &range, Some(id));
            self.group_signal_incompatible_overlap_modified(overlap.group);
        }
    }

    pub(crate) fn group_signal_modified(&mut self, id: GroupId, texture: TextureId) {
        let sequence = self.ctx.next_modified_sequence();
        if let Some(group) = self.groups.get_mut(id) {
            group.modified_sequence = sequence;
        }
        self.group_clear_incompatible_overlaps(id, texture);

        for span in self.texture_spans(id, texture) {
            let handles = match self.groups.get(id) {
                Some(group) => group.span_handles(span),
                None => return,
            };
            for handle in handles {
                self.handle_signal_modified(handle);
            }
        }
    }

    pub(crate) fn group_signal_modifying(&mut self, id: GroupId, texture: TextureId, bound: bool) {
        let sequence = self.ctx.next_modified_sequence();
        if let Some(group) = self.groups.get_mut(id) {
            group.modified_sequence = sequence;
        }
        self.group_clear_incompatible_overlaps(id, texture);

        for span in self.texture_spans(id, texture) {
            let handles = match self.groups.get(id) {
                Some(group) => group.span_handles(span),
                None => return,
            };
            for handle in handles {
                self.handle_signal_modifying(handle, bound);
            }
        }
    }

    /// Creates tracking for one handle covering `views` slices from `view_start`.
    fn group_generate_handle(
        &mut self,
        id: GroupId,
        view_start: usize,
        views: usize,
        offset: u64,
        size: u64,
    ) -> Option<HandleId> {
        let group = self.groups.get(id)?;
        let (first_layer, first_level) = group.layer_level_for_view(view_start);
        let owner = group.owner;
        let view_list = group.views.clone();
        let texture = self.textures.get(group.storage)?;
        let linear = texture.info.is_linear;
        let regions = self
            .physical
            .begin_tracking(&texture.range.slice(offset, size), Some(owner));

        let mut handle = TextureGroupHandle::new(
            id,
            offset,
            size,
            first_layer,
            first_level,
            view_start,
            views,
            regions,
            linear,
        );
        for view in view_list {
            if let Some((view_offset, view_size)) = self.view_extent(id, view) {
                if handle.overlaps_with(view_offset, view_size) {
                    handle.overlaps.push(view);
                }
            }
        }
        Some(self.handles.insert(handle))
    }

    /// Byte offset and size of a view inside its group's storage.
    fn view_extent(&self, id: GroupId, view: TextureId) -> Option<(u64, u64)> {
        let group = self.groups.get(id)?;
        let tex = self.textures.get(view)?;
        Some((
            group.offset_of(tex.first_layer, tex.first_level),
            tex.size_info.total_size,
        ))
    }

    fn group_recalculate_handle_regions(&mut self, id: GroupId, range_changed: bool) {
        let Some(group) = self.groups.get(id) else {
            return;
        };
        let layout = group.handle_layout();
        let extents = handle_extents(group, &layout);

        let mut handles = Vec::with_capacity(layout.len());
        for (&(view_start, views), &(offset, size)) in layout.iter().zip(&extents) {
            if let Some(handle) = self.group_generate_handle(id, view_start, views, offset, size) {
                handles.push(handle);
            }
        }
        self.group_replace_handles(id, handles, range_changed);
    }

    /// Swaps in a new handle set, carrying over state from the handles it replaces.
    fn group_replace_handles(&mut self, id: GroupId, handles: Vec<HandleId>, range_changed: bool) {
        let Some(group) = self.groups.get_mut(id) else {
            return;
        };
        let old = std::mem::replace(&mut group.handles, handles.clone());

        if old.is_empty() {
            for &handle in &handles {
                if let Some(h) = self.handles.get_mut(handle) {
                    if !h.regions.is_empty() {
                        h.state = HandleState::Dirty;
                    }
                }
            }
            return;
        }

        if range_changed {
            for &handle in &handles {
                let Some(h) = self.handles.get(handle) else {
                    continue;
                };
                let unmatched = h.regions.iter().any(|region| {
                    !old.iter().any(|&old_handle| {
                        self.handles.get(old_handle).is_some_and(|o| {
                            h.overlaps_with(o.offset, o.size)
                                && o.regions.iter().any(|r| r.range() == region.range())
                        })
                    })
                });
                if unmatched {
                    if let Some(h) = self.handles.get_mut(handle) {
                        h.state = HandleState::Dirty;
                    }
                }
            }
        }

        self.group_inherit_handles(&old, &handles, 0);
        for old_handle in old {
            self.dispose_handle(old_handle);
        }
    }

    /// Moves state from `old` handles onto the `new` handles they overlap. `relative_offset` is
    /// where the old handles' storage starts inside ours.
    fn group_inherit_handles(&mut self, old: &[HandleId], new: &[HandleId], relative_offset: u64) {
        for &old_handle in old {
            self.observe_guest_writes(old_handle);
        }

        for &handle in new {
            let Some(h) = self.handles.get(handle) else {
                continue;
            };
            let (offset, size) = (h.offset, h.size);
            let mut dirty = false;

            for &old_handle in old {
                let Some(o) = self.handles.get(old_handle) else {
                    continue;
                };
                let old_offset = o.offset + relative_offset;
                if !(old_offset < offset + size && offset < old_offset + o.size) {
                    continue;
                }
                dirty |= o.state.is_dirty();
                self.handle_inherit(handle, old_handle, offset == old_offset);
            }

            let Some(h) = self.handles.get_mut(handle) else {
                continue;
            };
            if dirty && h.state == HandleState::Clean {
                h.state = HandleState::Dirty;
            }
            if h.state.is_modified() {
                self.register_sync(handle);
            }
        }

        for &old_handle in old {
            if let Some(o) = self.handles.get_mut(old_handle) {
                if o.state.is_modified() {
                    o.state = HandleState::Clean;
                }
            }
        }
    }

    /// Records the views of the group and subdivides if one of them needs finer handles.
    ///
    /// `added` is the view that was just added, if any.
    pub(crate) fn group_update_views(&mut self, id: GroupId, views: Vec<TextureId>, added: Option<TextureId>) {
        let Some(group) = self.groups.get_mut(id) else {
            return;
        };
        group.views = views.clone();

        let mut layer_views = group.has_layer_views;
        let mut mip_views = group.has_mip_views;
        let mut rebuilt = false;

        if !(layer_views && mip_views) {
            let (layers, levels) = (group.layers, group.levels);
            for &view in &views {
                if let Some(tex) = self.textures.get(view) {
                    layer_views |= tex.info.slices() < layers;
                    mip_views |= tex.info.levels < levels;
                }
            }
            let Some(group) = self.groups.get_mut(id) else {
                return;
            };
            let (layer_views, mip_views) = group.propagate_granularity(layer_views, mip_views);
            if layer_views != group.has_layer_views || mip_views != group.has_mip_views {
                debug!(?id, layer_views, mip_views, "subdividing texture group");
                group.has_layer_views = layer_views;
                group.has_mip_views = mip_views;
                self.group_recalculate_handle_regions(id, false);
                rebuilt = true;
            }
        }

        if !rebuilt {
            let handles = self.groups.get(id).map(|g| g.handles.clone()).unwrap_or_default();
            let targets = match added {
                Some(view) => vec![view],
                None => views,
            };
            let extents: Vec<(TextureId, u64, u64)> = targets
                .into_iter()
                .filter_map(|view| self.view_extent(id, view).map(|(o, s)| (view, o, s)))
                .collect();
            for handle in handles {
                let Some(h) = self.handles.get_mut(handle) else {
                    continue;
                };
                if added.is_none() {
                    h.overlaps.clear();
                }
                for &(view, offset, size) in &extents {
                    if h.overlaps_with(offset, size) && !h.overlaps.contains(&view) {
                        h.overlaps.push(view);
                    }
                }
            }
        }

        self.group_signal_all_dirty(id);
    }

    pub(crate) fn group_remove_view(&mut self, id: GroupId, views: Vec<TextureId>, view: TextureId) {
        let Some(group) = self.groups.get_mut(id) else {
            return;
        };
        group.views = views;
        let handles = group.handles.clone();
        for handle in handles {
            if let Some(h) = self.handles.get_mut(handle) {
                h.overlaps.retain(|&v| v != view);
            }
        }
    }

    /// Takes over `other`, a group whose storage just became a view of ours.
    pub(crate) fn group_inherit(&mut self, id: GroupId, other: GroupId) {
        let (Some(group), Some(other_group)) = (self.groups.get(id), self.groups.get(other)) else {
            return;
        };
        let layer_views = group.has_layer_views || other_group.has_layer_views;
        let mip_views = group.has_mip_views || other_group.has_mip_views;
        let overlaps = other_group.incompatible_overlaps.clone();
        let other_handles = other_group.handles.clone();
        let other_storage = other_group.storage;

        if layer_views != group.has_layer_views || mip_views != group.has_mip_views {
            if let Some(group) = self.groups.get_mut(id) {
                group.has_layer_views = layer_views;
                group.has_mip_views = mip_views;
            }
            self.group_recalculate_handle_regions(id, false);
        }

        for overlap in overlaps {
            self.group_register_incompatible_overlap(id, overlap, false);
            if let Some(g) = self.groups.get_mut(overlap.group) {
                g.incompatible_overlaps.retain(|o| o.group != other);
            }
        }

        let relative_offset = match (
            self.groups.get(id).and_then(|g| self.textures.get(g.storage)),
            self.textures.get(other_storage),
        ) {
            (Some(storage), Some(other)) => storage.range.find_offset(&other.range),
            _ => None,
        };
        let handles = self.groups.get(id).map(|g| g.handles.clone()).unwrap_or_default();
        match relative_offset {
            Some(relative_offset) => {
                self.group_inherit_handles(&other_handles, &handles, relative_offset)
            }
            None => self.group_signal_all_dirty(id),
        }
    }

    /// Regenerates every handle after the storage's physical range changed.
    pub(crate) fn group_range_changed(&mut self, id: GroupId) {
        if let Some(group) = self.groups.get_mut(id) {
            group.has_layer_views = true;
            group.has_mip_views = true;
        }
        self.group_recalculate_handle_regions(id, true);
        self.group_signal_all_dirty(id);
    }

    fn group_ensure_full_subdivision(&mut self, id: GroupId) {
        let Some(group) = self.groups.get_mut(id) else {
            return;
        };
        if !group.is_fully_subdivided() {
            group.has_layer_views = true;
            group.has_mip_views = true;
            self.group_recalculate_handle_regions(id, false);
        }
    }

    /// Links the slices of `other` with ours starting at `(first_layer, first_level)`.
    ///
    /// With `copy_to`, our data is copied into `other` now; otherwise `other`'s is copied into
    /// ours.
    pub(crate) fn group_create_copy_dependency(
        &mut self,
        id: GroupId,
        other: TextureId,
        first_layer: u32,
        first_level: u32,
        copy_to: bool,
    ) {
        let Some(other_group) = self.textures.get(other).and_then(|t| t.group) else {
            return;
        };
        self.group_ensure_full_subdivision(id);
        self.group_ensure_full_subdivision(other_group);

        let Some(tex) = self.textures.get(other) else {
            return;
        };
        let (slices, levels) = (tex.info.slices(), tex.info.levels);
        let Some(group) = self.groups.get(id) else {
            return;
        };
        let targets: Vec<HandleId> = group
            .spans(first_layer, first_level, slices, levels)
            .into_iter()
            .flat_map(|span| group.span_handles(span))
            .collect();
        let Some(other_g) = self.groups.get(other_group) else {
            return;
        };
        let sources: Vec<HandleId> = self
            .texture_spans(other_group, other)
            .into_iter()
            .flat_map(|span| other_g.span_handles(span))
            .collect();

        for (handle, other_handle) in targets.into_iter().zip(sources) {
            self.handle_create_copy_dependency(handle, other_handle, copy_to);
            if copy_to {
                self.handle_copy(other_handle, Some(handle));
            } else {
                self.handle_copy(handle, Some(other_handle));
            }
        }
    }

    /// Links every slice of ours with the slice of `other` that starts at the same address and
    /// has a compatible layout.
    pub(crate) fn group_create_group_copy_dependency(&mut self, id: GroupId, other: GroupId, copy_to: bool) {
        let (Some((info, range)), Some((other_info, other_range))) =
            (self.storage_info(id), self.storage_info(other))
        else {
            return;
        };
        let (Some(group), Some(other_group)) = (self.groups.get(id), self.groups.get(other)) else {
            return;
        };

        let slice_base = |range: &MultiRange, offset: u64| {
            let first = range.slice(offset, 1).sub_range(0);
            (!first.is_unmapped()).then_some(first.address)
        };

        let mut pairs = Vec::new();
        for (i, &offset) in group.all_offsets.iter().enumerate() {
            let (_, level) = group.layer_level_for_view(i);
            let Some(base) = slice_base(&range, offset) else {
                continue;
            };
            for (j, &other_offset) in other_group.all_offsets.iter().enumerate() {
                let (_, other_level) = other_group.layer_level_for_view(j);
                if slice_base(&other_range, other_offset) != Some(base) {
                    continue;
                }
                if compat::view_layout_compatible_levels(&info, &other_info, level, other_level)
                    && compat::copy_size_matches(&info, &other_info, level, other_level)
                {
                    pairs.push((i, j));
                }
            }
        }
        if pairs.is_empty() {
            return;
        }

        self.group_ensure_full_subdivision(id);
        self.group_ensure_full_subdivision(other);
        let (Some(group), Some(other_group)) = (self.groups.get(id), self.groups.get(other)) else {
            return;
        };
        let pairs: Vec<(HandleId, HandleId)> = pairs
            .into_iter()
            .filter_map(|(i, j)| Some((*group.handles.get(i)?, *other_group.handles.get(j)?)))
            .collect();

        for (handle, other_handle) in pairs {
            self.handle_create_copy_dependency(handle, other_handle, copy_to);
            if copy_to {
                self.handle_copy(other_handle, Some(handle));
            } else {
                self.handle_copy(handle, Some(other_handle));
            }
        }
    }

    pub(crate) fn group_register_incompatible_overlap(
        &mut self,
        id: GroupId,
        other: IncompatibleOverlap,
        copy: bool,
    ) {
        let known = self
            .groups
            .get(id)
            .is_some_and(|g| g.incompatible_overlaps.iter().any(|o| o.group == other.group));
        if !known {
            if copy && other.compatibility == TextureViewCompatibility::LayoutIncompatible {
                self.group_create_group_copy_dependency(id, other.group, false);
            }
            if let Some(group) = self.groups.get_mut(id) {
                group.incompatible_overlaps.push(other);
            }
            if let Some(group) = self.groups.get_mut(other.group) {
                group.incompatible_overlaps.push(IncompatibleOverlap {
                    group: id,
                    compatibility: other.compatibility,
                });
            }
        }
        self.group_signal_incompatible_overlap_modified(other.group);
        self.group_signal_incompatible_overlap_modified(id);
    }

    /// Drops GPU-modified state in `range`; the data there was overwritten through an alias
    /// or unmapped. Handles linked to `ignore` keep theirs since the copy dependency carries it.
    pub(crate) fn group_clear_modified(&mut self, id: GroupId, range: &MultiRange, ignore: Option<GroupId>) {
        let Some((_, storage_range)) = self.storage_info(id) else {
            return;
        };
        let Some(group) = self.groups.get(id) else {
            return;
        };
        let handles = group.handles.clone();
        let storage = group.storage;
        let views = group.views.clone();

        for handle in handles {
            let Some(h) = self.handles.get(handle) else {
                continue;
            };
            if !h.state.is_modified() {
                continue;
            }
            if !range.overlaps_with(&storage_range.slice(h.offset, h.size)) {
                continue;
            }
            if ignore.is_some_and(|ignore| self.handle_has_dependency_to(handle, ignore)) {
                continue;
            }
            if let Some(h) = self.handles.get_mut(handle) {
                h.apply(HandleEvent::ClearModified);
            }
            self.signal_handle_modified_dirty(handle);
        }

        self.signal_modified_dirty(storage);
        for view in views {
            self.signal_modified_dirty(view);
        }
    }

    /// Handles whose memory intersects the unmapped `range` no longer load from it.
    pub(crate) fn group_unmapped(&mut self, id: GroupId, range: &MultiRange) {
        let Some((_, storage_range)) = self.storage_info(id) else {
            return;
        };
        let handles = self.groups.get(id).map(|g| g.handles.clone()).unwrap_or_default();
        for handle in handles {
            if let Some(h) = self.handles.get_mut(handle) {
                if range.overlaps_with(&storage_range.slice(h.offset, h.size)) {
                    h.unmapped = true;
                }
            }
        }
        self.group_clear_modified(id, range, None);
    }

    /// Flushes a handle because the guest is about to access its memory.
    pub(crate) fn group_flush_action(&mut self, handle: HandleId) {
        let Some(h) = self.handles.get_mut(handle) else {
            return;
        };
        h.action_registered = false;
        for region in &h.regions {
            region.clear_action();
        }
        if !h.state.is_modified() {
            return;
        }
        let (id, base_slice, slice_count) = (h.group, h.base_slice, h.slice_count);

        let in_buffer = self.handle_sync(handle);
        self.signal_handle_modified_dirty(handle);

        let Some((info, _)) = self.storage_info(id) else {
            return;
        };
        if !compat::can_texture_flush(&info, self.ctx.capabilities()) {
            return;
        }
        let Some(storage) = self.groups.get(id).map(|g| g.storage) else {
            return;
        };
        let flush_texture = self.texture_flush_host(storage);
        trace!(?handle, in_buffer, "flushing for guest access");
        self.group_flush_slice_range(
            id,
            false,
            base_slice,
            base_slice + slice_count,
            in_buffer,
            flush_texture,
        );
    }

    pub(crate) fn dispose_group(&mut self, id: GroupId) {
        let Some(group) = self.groups.remove(id) else {
            return;
        };
        for handle in group.handles {
            self.dispose_handle(handle);
        }
        for overlap in group.incompatible_overlaps {
            if let Some(other) = self.groups.get_mut(overlap.group) {
                other.incompatible_overlaps.retain(|o| o.group != id);
            }
        }
        if let Some(buffer) = group.flush_buffer {
            self.ctx.renderer().delete_buffer(buffer);
        }
    }

    /// Ranges of a group's handles, for inspection.
    pub(crate) fn group_handles(&self, id: GroupId) -> Vec<HandleId> {
        self.groups.get(id).map(|g| g.handles.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use pretty_assertions::assert_eq;

    fn group(target: Target, slices: u32, levels: u32) -> TextureGroup {
        let info = TextureInfo {
            width: 64,
            height: 64,
            depth_or_layers: slices,
            levels,
            target,
            format_info: Format::R8G8B8A8Unorm.info(),
            ..TextureInfo::default()
        };
        let size = info.calculate_size_info(0);
        let mut group = TextureGroup::new(
            TextureId::default(),
            &info,
            &Capabilities::default(),
            TrackingOwner(1),
            Vec::new(),
        );
        group.all_offsets = size.all_offsets().to_vec();
        group.slice_sizes = size.slice_sizes().to_vec();
        group.total_size = size.total_size;
        group
    }

    #[test]
    fn granularity_propagates_by_dimension() {
        let array = group(Target::Texture2DArray, 4, 4);
        assert_eq!(array.propagate_granularity(false, true), (true, true));
        assert_eq!(array.propagate_granularity(true, false), (true, false));

        let volume = group(Target::Texture3D, 4, 3);
        assert_eq!(volume.propagate_granularity(true, false), (true, true));
        assert_eq!(volume.propagate_granularity(false, true), (false, true));
    }

    #[test]
    fn array_handles_are_layer_major() {
        let mut g = group(Target::Texture2DArray, 4, 4);
        g.has_layer_views = true;
        g.has_mip_views = true;
        let layout = g.handle_layout();
        assert_eq!(layout.len(), 16);
        assert_eq!(layout[6], (6, 1));
        assert_eq!(g.layer_level_for_view(6), (1, 2));
        assert_eq!(g.offset_index(1, 2), 6);

        g.handles = vec![HandleId::default(); 16];
        assert_eq!(g.spans(1, 2, 1, 1), vec![HandleSpan::new(6, 1)]);
        // Two layers but not every level: one span per layer.
        assert_eq!(
            g.spans(1, 0, 2, 2),
            vec![
                HandleSpan {
                    base: 4,
                    count: 2,
                    split: true
                },
                HandleSpan {
                    base: 8,
                    count: 2,
                    split: true
                },
            ]
        );
        assert_eq!(g.spans(0, 0, 4, 4), vec![HandleSpan::new(0, 16)]);
    }

    #[test]
    fn layer_only_handles_cover_all_levels() {
        let mut g = group(Target::Texture2DArray, 3, 2);
        g.has_layer_views = true;
        let layout = g.handle_layout();
        assert_eq!(layout, vec![(0, 2), (2, 2), (4, 2)]);
        let info = g.handle_information(1);
        assert_eq!((info.base_layer, info.base_level, info.layers, info.levels), (1, 0, 1, 2));
    }

    #[test]
    fn volume_handles_shrink_with_depth() {
        let mut g = group(Target::Texture3D, 4, 3);
        g.has_layer_views = true;
        g.has_mip_views = true;
        assert_eq!(g.level_range_3d(0), (0, 4));
        assert_eq!(g.level_range_3d(1), (4, 2));
        assert_eq!(g.level_range_3d(2), (6, 1));
        assert_eq!(g.handle_layout().len(), 7);
        assert_eq!(g.layer_level_for_view(5), (1, 1));

        g.handles = vec![HandleId::default(); 7];
        // A full-depth view of every level is one contiguous run.
        assert_eq!(g.spans(0, 0, 4, 3), vec![HandleSpan::new(0, 7)]);
        assert_eq!(g.spans(2, 0, 1, 1), vec![HandleSpan::new(2, 1)]);
        assert_eq!(g.spans(0, 1, 2, 2), vec![HandleSpan::new(4, 3)]);
    }

    #[test]
    fn handle_extents_tile_the_storage() {
        let mut g = group(Target::Texture2DArray, 3, 3);
        for (layer_views, mip_views) in [(false, false), (true, false), (true, true)] {
            g.has_layer_views = layer_views;
            g.has_mip_views = mip_views;
            let mut extents = handle_extents(&g, &g.handle_layout());
            extents.sort_unstable();
            let mut cursor = 0;
            for (offset, size) in extents {
                assert_eq!(offset, cursor);
                assert!(size > 0);
                cursor = offset + size;
            }
            assert_eq!(cursor, g.total_size);
        }
    }
}
