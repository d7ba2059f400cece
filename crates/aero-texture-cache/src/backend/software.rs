use std::sync::{Arc, Mutex, MutexGuard};

use hashbrown::HashMap;

use super::{Capabilities, HostBufferId, HostRenderer, HostSamplerId, HostTextureId};
use crate::error::BackendError;
use crate::info::{Target, TextureCreateInfo};
use crate::pool::SamplerCreateInfo;

/// Operation counters of a [`SoftwareRenderer`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoftwareRendererStats {
    pub textures_created: u64,
    pub views_created: u64,
    pub textures_released: u64,
    pub uploads: u64,
    pub readbacks: u64,
    pub copies: u64,
    pub buffer_copies: u64,
    pub samplers_created: u64,
    pub syncs_created: u64,
    pub sync_waits: u64,
}

#[derive(Debug)]
struct Storage {
    info: TextureCreateInfo,
    /// Indexed by `level * layers + layer`.
    slices: Vec<Vec<u8>>,
    refs: u32,
}

impl Storage {
    fn new(info: TextureCreateInfo) -> Self {
        let layers = info.layers();
        let mut slices = Vec::with_capacity((layers * info.levels) as usize);
        for level in 0..info.levels {
            for _ in 0..layers {
                slices.push(vec![0; info.slice_size(level)]);
            }
        }
        Self {
            info,
            slices,
            refs: 0,
        }
    }

    fn slice_index(&self, layer: u32, level: u32) -> Option<usize> {
        let layers = self.info.layers();
        (layer < layers && level < self.info.levels).then(|| (level * layers + layer) as usize)
    }
}

#[derive(Debug)]
struct TextureEntry {
    storage: u32,
    first_layer: u32,
    first_level: u32,
    info: TextureCreateInfo,
}

#[derive(Debug, Default)]
struct Device {
    capabilities: Capabilities,
    storages: HashMap<u32, Storage>,
    textures: HashMap<u32, TextureEntry>,
    buffers: HashMap<u32, Vec<u8>>,
    samplers: HashMap<u32, SamplerCreateInfo>,
    next_id: u32,
    signalled_sync: Option<u64>,
    stats: SoftwareRendererStats,
}

/// Where a view-relative slice lives inside its storage.
struct SliceRef {
    storage: u32,
    index: usize,
    /// Byte range of a single depth plane, when a 3D plane was addressed.
    plane: Option<(usize, usize)>,
}

impl Device {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn entry(&self, texture: HostTextureId) -> Result<&TextureEntry, BackendError> {
        self.textures
            .get(&texture.0)
            .ok_or(BackendError::UnknownTexture(texture.0))
    }

    fn slice_ref(
        &self,
        texture: HostTextureId,
        layer: u32,
        level: u32,
        plane: bool,
    ) -> Result<SliceRef, BackendError> {
        let entry = self.entry(texture)?;
        let storage = self
            .storages
            .get(&entry.storage)
            .ok_or(BackendError::UnknownTexture(texture.0))?;
        let out_of_range = BackendError::SliceOutOfRange {
            texture: texture.0,
            layer,
            level,
        };
        let level = entry.first_level + level;

        if storage.info.target == Target::Texture3D {
            let index = storage.slice_index(0, level).ok_or(out_of_range.clone())?;
            let depth = storage.info.depth_at(level);
            let z = entry.first_layer + layer;
            if !plane {
                return Ok(SliceRef {
                    storage: entry.storage,
                    index,
                    plane: None,
                });
            }
            if z >= depth {
                return Err(out_of_range);
            }
            let plane_size = storage.info.slice_size(level) / depth as usize;
            Ok(SliceRef {
                storage: entry.storage,
                index,
                plane: Some((z as usize * plane_size, plane_size)),
            })
        } else {
            let index = storage
                .slice_index(entry.first_layer + layer, level)
                .ok_or(out_of_range)?;
            Ok(SliceRef {
                storage: entry.storage,
                index,
                plane: None,
            })
        }
    }

    fn read_slice(&self, slice: &SliceRef) -> Vec<u8> {
        let Some(storage) = self.storages.get(&slice.storage) else {
            return Vec::new();
        };
        let data = &storage.slices[slice.index];
        match slice.plane {
            Some((offset, len)) => data[offset..offset + len].to_vec(),
            None => data.clone(),
        }
    }

    fn write_slice(&mut self, slice: &SliceRef, data: &[u8]) {
        let Some(storage) = self.storages.get_mut(&slice.storage) else {
            return;
        };
        let dst = &mut storage.slices[slice.index];
        let dst = match slice.plane {
            Some((offset, len)) => &mut dst[offset..offset + len],
            None => &mut dst[..],
        };
        let n = dst.len().min(data.len());
        dst[..n].copy_from_slice(&data[..n]);
    }

    /// Layer and level counts of a texture as seen through its view.
    fn extent(&self, texture: HostTextureId) -> Result<(u32, u32), BackendError> {
        let entry = self.entry(texture)?;
        Ok((entry.info.layers(), entry.info.levels))
    }
}

/// In-memory [`HostRenderer`].
///
/// Clones share the same device, so a test can keep a handle for inspection after giving one
/// to the cache.
#[derive(Clone, Debug, Default)]
pub struct SoftwareRenderer {
    device: Arc<Mutex<Device>>,
}

impl SoftwareRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        let renderer = Self::default();
        renderer.device().capabilities = capabilities;
        renderer
    }

    fn device(&self) -> MutexGuard<'_, Device> {
        self.device.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn stats(&self) -> SoftwareRendererStats {
        self.device().stats
    }

    /// Number of live textures and views.
    pub fn live_textures(&self) -> usize {
        self.device().textures.len()
    }

    pub fn texture_info(&self, texture: HostTextureId) -> Option<TextureCreateInfo> {
        self.device()
            .textures
            .get(&texture.0)
            .map(|entry| entry.info.clone())
    }

    /// Reads a slice without counting it as a readback.
    pub fn slice_data(&self, texture: HostTextureId, layer: u32, level: u32) -> Option<Vec<u8>> {
        let device = self.device();
        let slice = device.slice_ref(texture, layer, level, false).ok()?;
        Some(device.read_slice(&slice))
    }

    /// Writes a slice as if the GPU had rendered to it.
    pub fn render_to(&self, texture: HostTextureId, layer: u32, level: u32, data: &[u8]) -> bool {
        let mut device = self.device();
        match device.slice_ref(texture, layer, level, false) {
            Ok(slice) => {
                device.write_slice(&slice, data);
                true
            }
            Err(_) => false,
        }
    }

    pub fn live_samplers(&self) -> usize {
        self.device().samplers.len()
    }

    pub fn sampler_info(&self, sampler: HostSamplerId) -> Option<SamplerCreateInfo> {
        self.device().samplers.get(&sampler.0).cloned()
    }

    pub fn last_signalled_sync(&self) -> Option<u64> {
        self.device().signalled_sync
    }
}

impl HostRenderer for SoftwareRenderer {
    fn capabilities(&self) -> Capabilities {
        self.device().capabilities
    }

    fn create_texture(&mut self, info: &TextureCreateInfo) -> HostTextureId {
        let mut device = self.device();
        let storage_id = device.alloc_id();
        let mut storage = Storage::new(info.clone());
        storage.refs = 1;
        device.storages.insert(storage_id, storage);

        let id = device.alloc_id();
        device.textures.insert(
            id,
            TextureEntry {
                storage: storage_id,
                first_layer: 0,
                first_level: 0,
                info: info.clone(),
            },
        );
        device.stats.textures_created += 1;
        HostTextureId(id)
    }

    fn create_texture_view(
        &mut self,
        parent: HostTextureId,
        info: &TextureCreateInfo,
        first_layer: u32,
        first_level: u32,
    ) -> Result<HostTextureId, BackendError> {
        let mut device = self.device();
        let parent = device.entry(parent)?;
        let entry = TextureEntry {
            storage: parent.storage,
            first_layer: parent.first_layer + first_layer,
            first_level: parent.first_level + first_level,
            info: info.clone(),
        };
        if let Some(storage) = device.storages.get_mut(&entry.storage) {
            storage.refs += 1;
        }
        let id = device.alloc_id();
        device.textures.insert(id, entry);
        device.stats.views_created += 1;
        Ok(HostTextureId(id))
    }

    fn release_texture(&mut self, texture: HostTextureId) {
        let mut device = self.device();
        let Some(entry) = device.textures.remove(&texture.0) else {
            return;
        };
        device.stats.textures_released += 1;
        let drop_storage = match device.storages.get_mut(&entry.storage) {
            Some(storage) => {
                storage.refs = storage.refs.saturating_sub(1);
                storage.refs == 0
            }
            None => false,
        };
        if drop_storage {
            device.storages.remove(&entry.storage);
        }
    }

    fn set_data(&mut self, texture: HostTextureId, data: &[u8]) -> Result<(), BackendError> {
        let mut device = self.device();
        let info = device.entry(texture)?.info.clone();
        if data.len() < info.total_size() {
            return Err(BackendError::SizeMismatch {
                expected: info.total_size(),
                actual: data.len(),
            });
        }
        let mut offset = 0;
        for level in 0..info.levels {
            let len = info.slice_size(level);
            for layer in 0..info.layers() {
                let slice = device.slice_ref(texture, layer, level, false)?;
                device.write_slice(&slice, &data[offset..offset + len]);
                offset += len;
            }
        }
        device.stats.uploads += 1;
        Ok(())
    }

    fn set_data_slice(
        &mut self,
        texture: HostTextureId,
        layer: u32,
        level: u32,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let mut device = self.device();
        let is_3d = device.entry(texture)?.info.target == Target::Texture3D;
        let slice = device.slice_ref(texture, layer, level, is_3d)?;
        device.write_slice(&slice, data);
        device.stats.uploads += 1;
        Ok(())
    }

    fn get_data(&mut self, texture: HostTextureId) -> Result<Vec<u8>, BackendError> {
        let mut device = self.device();
        let (layers, levels) = device.extent(texture)?;
        let mut out = Vec::new();
        for level in 0..levels {
            for layer in 0..layers {
                let slice = device.slice_ref(texture, layer, level, false)?;
                out.extend_from_slice(&device.read_slice(&slice));
            }
        }
        device.stats.readbacks += 1;
        Ok(out)
    }

    fn get_data_slice(
        &mut self,
        texture: HostTextureId,
        layer: u32,
        level: u32,
    ) -> Result<Vec<u8>, BackendError> {
        let mut device = self.device();
        let is_3d = device.entry(texture)?.info.target == Target::Texture3D;
        let slice = device.slice_ref(texture, layer, level, is_3d)?;
        device.stats.readbacks += 1;
        Ok(device.read_slice(&slice))
    }

    fn copy_texture(
        &mut self,
        src: HostTextureId,
        dst: HostTextureId,
        dst_layer: u32,
        dst_level: u32,
    ) -> Result<(), BackendError> {
        let mut device = self.device();
        let (layers, levels) = device.extent(src)?;
        for level in 0..levels {
            for layer in 0..layers {
                let from = device.slice_ref(src, layer, level, false)?;
                let Ok(to) = device.slice_ref(dst, dst_layer + layer, dst_level + level, false)
                else {
                    continue;
                };
                let data = device.read_slice(&from);
                device.write_slice(&to, &data);
            }
        }
        device.stats.copies += 1;
        Ok(())
    }

    fn copy_texture_slice(
        &mut self,
        src: HostTextureId,
        dst: HostTextureId,
        src_layer: u32,
        dst_layer: u32,
        src_level: u32,
        dst_level: u32,
    ) -> Result<(), BackendError> {
        let mut device = self.device();
        let src_3d = device.entry(src)?.info.target == Target::Texture3D;
        let dst_3d = device.entry(dst)?.info.target == Target::Texture3D;
        let from = device.slice_ref(src, src_layer, src_level, src_3d)?;
        let to = device.slice_ref(dst, dst_layer, dst_level, dst_3d)?;
        let data = device.read_slice(&from);
        device.write_slice(&to, &data);
        device.stats.copies += 1;
        Ok(())
    }

    fn copy_texture_scaled(
        &mut self,
        src: HostTextureId,
        dst: HostTextureId,
    ) -> Result<(), BackendError> {
        let mut device = self.device();
        let src_info = device.entry(src)?.info.clone();
        let dst_info = device.entry(dst)?.info.clone();
        let texel = (src_info.bytes_per_pixel * src_info.samples.max(1)) as usize;

        let levels = src_info.levels.min(dst_info.levels);
        let layers = src_info.layers().min(dst_info.layers());
        for level in 0..levels {
            for layer in 0..layers {
                let from = device.slice_ref(src, layer, level, false)?;
                let to = device.slice_ref(dst, layer, level, false)?;
                let data = device.read_slice(&from);

                let sw = (src_info.width >> level).max(1).div_ceil(src_info.block_width) as usize;
                let sh = (src_info.height >> level).max(1).div_ceil(src_info.block_height) as usize;
                let dw = (dst_info.width >> level).max(1).div_ceil(dst_info.block_width) as usize;
                let dh = (dst_info.height >> level).max(1).div_ceil(dst_info.block_height) as usize;
                let planes = src_info.depth_at(level).min(dst_info.depth_at(level)) as usize;

                let mut out = vec![0u8; dw * dh * planes * texel];
                for z in 0..planes {
                    for y in 0..dh {
                        let sy = y * sh / dh;
                        for x in 0..dw {
                            let sx = x * sw / dw;
                            let s = ((z * sh + sy) * sw + sx) * texel;
                            let d = ((z * dh + y) * dw + x) * texel;
                            if let Some(px) = data.get(s..s + texel) {
                                out[d..d + texel].copy_from_slice(px);
                            }
                        }
                    }
                }
                device.write_slice(&to, &out);
            }
        }
        device.stats.copies += 1;
        Ok(())
    }

    fn create_buffer(&mut self, size: u64) -> HostBufferId {
        let mut device = self.device();
        let id = device.alloc_id();
        device.buffers.insert(id, vec![0; size as usize]);
        HostBufferId(id)
    }

    fn delete_buffer(&mut self, buffer: HostBufferId) {
        self.device().buffers.remove(&buffer.0);
    }

    fn copy_texture_to_buffer(
        &mut self,
        texture: HostTextureId,
        buffer: HostBufferId,
        offset: u64,
        layer: u32,
        level: u32,
    ) -> Result<(), BackendError> {
        let mut device = self.device();
        let is_3d = device.entry(texture)?.info.target == Target::Texture3D;
        let slice = device.slice_ref(texture, layer, level, is_3d)?;
        let data = device.read_slice(&slice);
        let target = device
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::UnknownBuffer(buffer.0))?;
        let start = (offset as usize).min(target.len());
        let n = (target.len() - start).min(data.len());
        target[start..start + n].copy_from_slice(&data[..n]);
        device.stats.buffer_copies += 1;
        Ok(())
    }

    fn get_buffer_data(
        &mut self,
        buffer: HostBufferId,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, BackendError> {
        let device = self.device();
        let data = device
            .buffers
            .get(&buffer.0)
            .ok_or(BackendError::UnknownBuffer(buffer.0))?;
        let start = offset as usize;
        let end = start + size as usize;
        data.get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or(BackendError::SizeMismatch {
                expected: end,
                actual: data.len(),
            })
    }

    fn create_sampler(&mut self, info: &SamplerCreateInfo) -> HostSamplerId {
        let mut device = self.device();
        let id = device.alloc_id();
        device.samplers.insert(id, info.clone());
        device.stats.samplers_created += 1;
        HostSamplerId(id)
    }

    fn release_sampler(&mut self, sampler: HostSamplerId) {
        self.device().samplers.remove(&sampler.0);
    }

    fn create_sync(&mut self, id: u64) {
        let mut device = self.device();
        // Work completes immediately, so the fence is signalled as soon as it is created.
        device.signalled_sync = Some(device.signalled_sync.map_or(id, |s| s.max(id)));
        device.stats.syncs_created += 1;
    }

    fn wait_sync(&mut self, _id: u64) {
        self.device().stats.sync_waits += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::info::{DepthStencilMode, SwizzleComponent};
    use pretty_assertions::assert_eq;

    fn create_info(width: u32, height: u32, layers: u32, levels: u32) -> TextureCreateInfo {
        TextureCreateInfo {
            width,
            height,
            depth: layers,
            levels,
            samples: 1,
            block_width: 1,
            block_height: 1,
            bytes_per_pixel: 4,
            format: Format::R8G8B8A8Unorm,
            depth_stencil_mode: DepthStencilMode::Depth,
            target: if layers > 1 {
                Target::Texture2DArray
            } else {
                Target::Texture2D
            },
            swizzle: SwizzleComponent::IDENTITY,
        }
    }

    #[test]
    fn views_alias_their_parent_storage() -> anyhow::Result<()> {
        let mut renderer = SoftwareRenderer::new();
        let parent = renderer.create_texture(&create_info(4, 4, 2, 3));
        let view = renderer.create_texture_view(parent, &create_info(2, 2, 1, 1), 1, 1)?;

        renderer.set_data_slice(view, 0, 0, &[9; 16])?;
        assert_eq!(renderer.slice_data(parent, 1, 1), Some(vec![9; 16]));

        renderer.release_texture(parent);
        assert_eq!(renderer.slice_data(view, 0, 0), Some(vec![9; 16]));
        renderer.release_texture(view);
        assert_eq!(renderer.live_textures(), 0);
        Ok(())
    }

    #[test]
    fn full_upload_is_level_major() -> anyhow::Result<()> {
        let mut renderer = SoftwareRenderer::new();
        let info = create_info(2, 2, 2, 2);
        let texture = renderer.create_texture(&info);
        let mut data = vec![0u8; info.total_size()];
        // Level 1 of layer 0 sits right after both level 0 slices.
        data[32..36].copy_from_slice(&[1, 2, 3, 4]);
        renderer.set_data(texture, &data)?;
        assert_eq!(renderer.slice_data(texture, 0, 1), Some(vec![1, 2, 3, 4]));
        assert_eq!(renderer.get_data(texture)?, data);
        assert_eq!(renderer.stats().uploads, 1);
        assert_eq!(renderer.stats().readbacks, 1);
        Ok(())
    }

    #[test]
    fn scaled_copy_resamples_nearest() -> anyhow::Result<()> {
        let mut renderer = SoftwareRenderer::new();
        let small = renderer.create_texture(&create_info(1, 1, 1, 1));
        let large = renderer.create_texture(&create_info(2, 2, 1, 1));
        renderer.set_data(small, &[5, 6, 7, 8])?;
        renderer.copy_texture_scaled(small, large)?;
        assert_eq!(renderer.slice_data(large, 0, 0), Some([5, 6, 7, 8].repeat(4)));
        Ok(())
    }
}
