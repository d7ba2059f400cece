//! [`HostRenderer`] backed by a `wgpu::Device`.
//!
//! The cache only ever uploads, reads back and copies texture data, so every texture is created
//! with copy usage and a format that `wgpu` can copy byte-exactly. Guest formats without a
//! copyable `wgpu` equivalent (depth/stencil, packed 16-bit, compressed formats the adapter does
//! not support) are stored as raw unsigned-integer texels of the same size.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::{Capabilities, CapabilityFlags, HostBufferId, HostRenderer, HostSamplerId, HostTextureId};
use crate::error::BackendError;
use crate::format::Format;
use crate::info::{Target, TextureCreateInfo};
use crate::pool::{AddressMode, CompareOp, Filter, MipFilter, SamplerCreateInfo};

const ALIGN: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

fn env_var_truthy(name: &str) -> bool {
    let Ok(raw) = std::env::var(name) else {
        return false;
    };
    let v = raw.trim();
    v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
}

/// Env var that stops the renderer from requesting texture compression features, which forces
/// the cache onto its decompression path.
pub const DISABLE_TEXTURE_COMPRESSION_ENV: &str = "AERO_DISABLE_WGPU_TEXTURE_COMPRESSION";

fn negotiated_features(available: wgpu::Features, disable_texture_compression: bool) -> wgpu::Features {
    let mut requested = available & wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER;
    if !disable_texture_compression {
        for feature in [
            wgpu::Features::TEXTURE_COMPRESSION_BC,
            wgpu::Features::TEXTURE_COMPRESSION_ETC2,
            wgpu::Features::TEXTURE_COMPRESSION_ASTC,
        ] {
            if available.contains(feature) {
                requested |= feature;
            }
        }
    }
    requested
}

fn capabilities_for(features: wgpu::Features) -> Capabilities {
    let mut flags = CapabilityFlags::CUBEMAP_VIEW;
    if features.contains(wgpu::Features::TEXTURE_COMPRESSION_BC) {
        flags |= CapabilityFlags::BC123_COMPRESSION
            | CapabilityFlags::BC45_COMPRESSION
            | CapabilityFlags::BC67_COMPRESSION;
    }
    if features.contains(wgpu::Features::TEXTURE_COMPRESSION_ETC2) {
        flags |= CapabilityFlags::ETC2_COMPRESSION;
    }
    if features.contains(wgpu::Features::TEXTURE_COMPRESSION_ASTC) {
        flags |= CapabilityFlags::ASTC_COMPRESSION;
    }
    Capabilities {
        flags,
        max_anisotropy: 16.0,
        total_memory: None,
    }
}

fn astc(block: wgpu::AstcBlock, srgb: bool) -> wgpu::TextureFormat {
    wgpu::TextureFormat::Astc {
        block,
        channel: if srgb {
            wgpu::AstcChannel::UnormSrgb
        } else {
            wgpu::AstcChannel::Unorm
        },
    }
}

/// Native `wgpu` format for a guest format, if there is one that copies byte-exactly.
fn native_format(format: Format, features: wgpu::Features) -> Option<wgpu::TextureFormat> {
    use wgpu::TextureFormat as W;

    let bc = features.contains(wgpu::Features::TEXTURE_COMPRESSION_BC);
    let etc2 = features.contains(wgpu::Features::TEXTURE_COMPRESSION_ETC2);
    let astc_ok = features.contains(wgpu::Features::TEXTURE_COMPRESSION_ASTC);

    let mapped = match format {
        Format::R8Unorm => W::R8Unorm,
        Format::R8Snorm => W::R8Snorm,
        Format::R8Uint => W::R8Uint,
        Format::R8G8Unorm => W::Rg8Unorm,
        Format::R8G8Snorm => W::Rg8Snorm,
        Format::R16Float => W::R16Float,
        Format::R16Uint => W::R16Uint,
        Format::R32Float => W::R32Float,
        Format::R32Uint => W::R32Uint,
        Format::R16G16Float => W::Rg16Float,
        Format::R32G32Float => W::Rg32Float,
        Format::R8G8B8A8Unorm => W::Rgba8Unorm,
        Format::R8G8B8A8Srgb => W::Rgba8UnormSrgb,
        Format::B8G8R8A8Unorm => W::Bgra8Unorm,
        Format::B8G8R8A8Srgb => W::Bgra8UnormSrgb,
        Format::R10G10B10A2Unorm => W::Rgb10a2Unorm,
        Format::R16G16B16A16Float => W::Rgba16Float,
        Format::R32G32B32A32Float => W::Rgba32Float,
        Format::R32G32B32A32Uint => W::Rgba32Uint,

        Format::Bc1RgbaUnorm if bc => W::Bc1RgbaUnorm,
        Format::Bc1RgbaSrgb if bc => W::Bc1RgbaUnormSrgb,
        Format::Bc2Unorm if bc => W::Bc2RgbaUnorm,
        Format::Bc2Srgb if bc => W::Bc2RgbaUnormSrgb,
        Format::Bc3Unorm if bc => W::Bc3RgbaUnorm,
        Format::Bc3Srgb if bc => W::Bc3RgbaUnormSrgb,
        Format::Bc4Unorm if bc => W::Bc4RUnorm,
        Format::Bc4Snorm if bc => W::Bc4RSnorm,
        Format::Bc5Unorm if bc => W::Bc5RgUnorm,
        Format::Bc5Snorm if bc => W::Bc5RgSnorm,
        Format::Bc6HSfloat if bc => W::Bc6hRgbFloat,
        Format::Bc6HUfloat if bc => W::Bc6hRgbUfloat,
        Format::Bc7Unorm if bc => W::Bc7RgbaUnorm,
        Format::Bc7Srgb if bc => W::Bc7RgbaUnormSrgb,

        Format::Etc2RgbUnorm if etc2 => W::Etc2Rgb8Unorm,
        Format::Etc2RgbSrgb if etc2 => W::Etc2Rgb8UnormSrgb,
        Format::Etc2RgbPtaUnorm if etc2 => W::Etc2Rgb8A1Unorm,
        Format::Etc2RgbPtaSrgb if etc2 => W::Etc2Rgb8A1UnormSrgb,
        Format::Etc2RgbaUnorm if etc2 => W::Etc2Rgba8Unorm,
        Format::Etc2RgbaSrgb if etc2 => W::Etc2Rgba8UnormSrgb,

        Format::Astc4x4Unorm if astc_ok => astc(wgpu::AstcBlock::B4x4, false),
        Format::Astc4x4Srgb if astc_ok => astc(wgpu::AstcBlock::B4x4, true),
        Format::Astc5x5Unorm if astc_ok => astc(wgpu::AstcBlock::B5x5, false),
        Format::Astc5x5Srgb if astc_ok => astc(wgpu::AstcBlock::B5x5, true),
        Format::Astc6x6Unorm if astc_ok => astc(wgpu::AstcBlock::B6x6, false),
        Format::Astc6x6Srgb if astc_ok => astc(wgpu::AstcBlock::B6x6, true),
        Format::Astc8x8Unorm if astc_ok => astc(wgpu::AstcBlock::B8x8, false),
        Format::Astc8x8Srgb if astc_ok => astc(wgpu::AstcBlock::B8x8, true),
        Format::Astc10x10Unorm if astc_ok => astc(wgpu::AstcBlock::B10x10, false),
        Format::Astc10x10Srgb if astc_ok => astc(wgpu::AstcBlock::B10x10, true),
        Format::Astc12x12Unorm if astc_ok => astc(wgpu::AstcBlock::B12x12, false),
        Format::Astc12x12Srgb if astc_ok => astc(wgpu::AstcBlock::B12x12, true),

        _ => return None,
    };
    Some(mapped)
}

fn raw_format(bytes_per_texel: u32) -> Option<wgpu::TextureFormat> {
    match bytes_per_texel {
        1 => Some(wgpu::TextureFormat::R8Uint),
        2 => Some(wgpu::TextureFormat::R16Uint),
        4 => Some(wgpu::TextureFormat::R32Uint),
        8 => Some(wgpu::TextureFormat::Rg32Uint),
        16 => Some(wgpu::TextureFormat::Rgba32Uint),
        _ => None,
    }
}

/// How a guest texture is laid out in its `wgpu` texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct StorageFormat {
    format: wgpu::TextureFormat,
    block_width: u32,
    block_height: u32,
    bytes_per_block: u32,
    /// One `wgpu` texel per guest block.
    raw: bool,
}

fn storage_format(info: &TextureCreateInfo, features: wgpu::Features) -> StorageFormat {
    if !info.format.is_depth_or_stencil() {
        if let Some(format) = native_format(info.format, features) {
            return StorageFormat {
                format,
                block_width: info.block_width,
                block_height: info.block_height,
                bytes_per_block: info.bytes_per_pixel,
                raw: false,
            };
        }
    }
    let format = raw_format(info.bytes_per_pixel).unwrap_or_else(|| {
        warn!(format = ?info.format, bytes = info.bytes_per_pixel, "no raw host format, storing bytes");
        wgpu::TextureFormat::R8Uint
    });
    let bytes_per_block = if raw_format(info.bytes_per_pixel).is_some() {
        info.bytes_per_pixel
    } else {
        1
    };
    StorageFormat {
        format,
        block_width: 1,
        block_height: 1,
        bytes_per_block,
        raw: true,
    }
}

/// Whether `copy_texture_to_texture` may copy between the two formats.
fn copy_compatible(a: wgpu::TextureFormat, b: wgpu::TextureFormat) -> bool {
    a.remove_srgb_suffix() == b.remove_srgb_suffix()
}

fn padded_row(row_bytes: u32) -> u32 {
    row_bytes.div_ceil(ALIGN) * ALIGN
}

fn resample_nearest(
    data: &[u8],
    src: (usize, usize),
    dst: (usize, usize),
    planes: usize,
    texel: usize,
) -> Vec<u8> {
    let (sw, sh) = src;
    let (dw, dh) = dst;
    let mut out = vec![0u8; dw * dh * planes * texel];
    for z in 0..planes {
        for y in 0..dh {
            let sy = y * sh / dh;
            for x in 0..dw {
                let sx = x * sw / dw;
                let s = ((z * sh + sy) * sw + sx) * texel;
                let d = ((z * dh + y) * dw + x) * texel;
                if let (Some(px), Some(to)) = (data.get(s..s + texel), out.get_mut(d..d + texel)) {
                    to.copy_from_slice(px);
                }
            }
        }
    }
    out
}

#[derive(Debug)]
struct Storage {
    texture: wgpu::Texture,
    format: StorageFormat,
    dimension: wgpu::TextureDimension,
    size: wgpu::Extent3d,
    levels: u32,
}

impl Storage {
    fn layers(&self) -> u32 {
        match self.dimension {
            wgpu::TextureDimension::D3 => 1,
            _ => self.size.depth_or_array_layers,
        }
    }

    /// Copyable size of `level`, rounded up to whole blocks.
    fn level_size(&self, level: u32) -> wgpu::Extent3d {
        let size = self.size.mip_level_size(level, self.dimension);
        wgpu::Extent3d {
            width: size.width.div_ceil(self.format.block_width) * self.format.block_width,
            height: size.height.div_ceil(self.format.block_height) * self.format.block_height,
            depth_or_array_layers: size.depth_or_array_layers,
        }
    }
}

#[derive(Debug)]
struct TextureEntry {
    storage: Arc<Storage>,
    first_layer: u32,
    first_level: u32,
    info: TextureCreateInfo,
}

/// A copyable box of one storage level.
#[derive(Clone, Debug)]
struct Region {
    storage: Arc<Storage>,
    level: u32,
    z: u32,
    extent: wgpu::Extent3d,
}

impl Region {
    fn blocks(&self) -> (u32, u32) {
        let format = &self.storage.format;
        (
            self.extent.width / format.block_width,
            self.extent.height / format.block_height,
        )
    }

    fn row_bytes(&self) -> u32 {
        self.blocks().0 * self.storage.format.bytes_per_block
    }

    fn len(&self) -> usize {
        self.row_bytes() as usize * self.blocks().1 as usize * self.extent.depth_or_array_layers as usize
    }

    fn copy_texture(&self) -> wgpu::ImageCopyTexture<'_> {
        wgpu::ImageCopyTexture {
            texture: &self.storage.texture,
            mip_level: self.level,
            origin: wgpu::Origin3d {
                x: 0,
                y: 0,
                z: self.z,
            },
            aspect: wgpu::TextureAspect::All,
        }
    }
}

fn intersect(a: wgpu::Extent3d, b: wgpu::Extent3d) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: a.width.min(b.width),
        height: a.height.min(b.height),
        depth_or_array_layers: a.depth_or_array_layers.min(b.depth_or_array_layers),
    }
}

/// A texture-to-buffer copy whose data is still on the GPU.
#[derive(Debug)]
struct PendingReadback {
    staging: wgpu::Buffer,
    offset: u64,
    row_bytes: u32,
    rows: u32,
    images: u32,
}

#[derive(Debug, Default)]
struct StoredBuffer {
    data: Vec<u8>,
    pending: Vec<PendingReadback>,
}

/// `wgpu` implementation of [`HostRenderer`].
pub struct WgpuRenderer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    features: wgpu::Features,
    capabilities: Capabilities,
    max_dimension_2d: u32,
    max_dimension_3d: u32,
    max_layers: u32,

    textures: HashMap<u32, TextureEntry>,
    buffers: HashMap<u32, StoredBuffer>,
    samplers: HashMap<u32, wgpu::Sampler>,
    next_id: u32,
    fences: BTreeMap<u64, wgpu::SubmissionIndex>,
}

impl fmt::Debug for WgpuRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuRenderer")
            .field("features", &self.features)
            .field("capabilities", &self.capabilities)
            .field("textures", &self.textures.len())
            .field("buffers", &self.buffers.len())
            .field("samplers", &self.samplers.len())
            .finish_non_exhaustive()
    }
}

impl WgpuRenderer {
    /// Wraps an existing device. Only features enabled on `device` are used.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        device.on_uncaptured_error(Box::new(|err| {
            error!(%err, "wgpu error in texture cache backend");
        }));
        let features = device.features();
        let limits = device.limits();
        Self {
            capabilities: capabilities_for(features),
            features,
            max_dimension_2d: limits.max_texture_dimension_2d,
            max_dimension_3d: limits.max_texture_dimension_3d,
            max_layers: limits.max_texture_array_layers,
            device,
            queue,
            textures: HashMap::new(),
            buffers: HashMap::new(),
            samplers: HashMap::new(),
            next_id: 0,
            fences: BTreeMap::new(),
        }
    }

    /// Creates a renderer on its own device without a presentation surface.
    ///
    /// Intended for tests and offscreen tools; blocks on adapter and device creation.
    pub fn new_headless() -> Result<Self, BackendError> {
        pollster::block_on(Self::new_headless_async())
    }

    async fn new_headless_async() -> Result<Self, BackendError> {
        let options = wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        };
        // Prefer GL on Linux; some Vulkan software adapters are unstable in CI.
        let preferred = if cfg!(target_os = "linux") {
            wgpu::Backends::GL
        } else {
            wgpu::Backends::PRIMARY
        };
        let mut adapter = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: preferred,
            ..Default::default()
        })
        .request_adapter(&options)
        .await;
        if adapter.is_none() && preferred != wgpu::Backends::PRIMARY {
            adapter = wgpu::Instance::new(wgpu::InstanceDescriptor {
                backends: wgpu::Backends::PRIMARY,
                ..Default::default()
            })
            .request_adapter(&options)
            .await;
        }
        let adapter =
            adapter.ok_or_else(|| BackendError::Other("no suitable wgpu adapter found".into()))?;

        let features = negotiated_features(
            adapter.features(),
            env_var_truthy(DISABLE_TEXTURE_COMPRESSION_ENV),
        );
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("aero texture cache"),
                    required_features: features,
                    required_limits: wgpu::Limits::downlevel_defaults()
                        .using_resolution(adapter.limits()),
                },
                None,
            )
            .await
            .map_err(|err| BackendError::Other(err.to_string()))?;
        debug!(adapter = ?adapter.get_info().name, ?features, "created headless wgpu device");
        Ok(Self::new(device, queue))
    }

    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn entry(&self, texture: HostTextureId) -> Result<&TextureEntry, BackendError> {
        self.textures
            .get(&texture.0)
            .ok_or(BackendError::UnknownTexture(texture.0))
    }

    /// Resolves a view-relative slice. With `plane` set, a 3D level is narrowed to one depth
    /// plane; otherwise the whole level is addressed.
    fn region(
        &self,
        texture: HostTextureId,
        layer: u32,
        level: u32,
        plane: bool,
    ) -> Result<Region, BackendError> {
        let entry = self.entry(texture)?;
        let storage = &entry.storage;
        let out_of_range = BackendError::SliceOutOfRange {
            texture: texture.0,
            layer,
            level,
        };
        let abs_level = entry.first_level + level;
        if level >= entry.info.levels || abs_level >= storage.levels {
            return Err(out_of_range);
        }
        let size = storage.level_size(abs_level);

        let (z, depth) = if storage.dimension == wgpu::TextureDimension::D3 {
            if plane {
                let z = entry.first_layer + layer;
                if z >= size.depth_or_array_layers {
                    return Err(out_of_range);
                }
                (z, 1)
            } else {
                (0, size.depth_or_array_layers)
            }
        } else {
            let z = entry.first_layer + layer;
            if layer >= entry.info.layers() || z >= storage.layers() {
                return Err(out_of_range);
            }
            (z, 1)
        };

        Ok(Region {
            storage: storage.clone(),
            level: abs_level,
            z,
            extent: wgpu::Extent3d {
                width: size.width,
                height: size.height,
                depth_or_array_layers: depth,
            },
        })
    }

    fn is_3d(&self, texture: HostTextureId) -> Result<bool, BackendError> {
        Ok(self.entry(texture)?.info.target == Target::Texture3D)
    }

    fn write_region(&self, region: &Region, data: &[u8]) {
        let len = region.len();
        let padded;
        let data = if data.len() < len {
            padded = {
                let mut buf = data.to_vec();
                buf.resize(len, 0);
                buf
            };
            &padded[..]
        } else {
            &data[..len]
        };
        self.queue.write_texture(
            region.copy_texture(),
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(region.row_bytes()),
                rows_per_image: Some(region.blocks().1),
            },
            region.extent,
        );
    }

    /// Records a copy of `region` into a mappable staging buffer and submits it.
    fn start_readback(&self, region: &Region, offset: u64) -> PendingReadback {
        let row_bytes = region.row_bytes();
        let rows = region.blocks().1;
        let images = region.extent.depth_or_array_layers;
        let padded = padded_row(row_bytes);
        let size = (padded as u64 * rows as u64 * images as u64).max(wgpu::COPY_BUFFER_ALIGNMENT);

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("aero texture cache readback"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("aero texture cache readback"),
            });
        encoder.copy_texture_to_buffer(
            region.copy_texture(),
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(rows),
                },
            },
            region.extent,
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        PendingReadback {
            staging,
            offset,
            row_bytes,
            rows,
            images,
        }
    }

    /// Waits for a readback and returns its rows tightly packed.
    fn finish_readback(&self, readback: &PendingReadback) -> Result<Vec<u8>, BackendError> {
        let slice = readback.staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| BackendError::Other("readback map callback dropped".into()))?
            .map_err(|err| BackendError::Other(format!("readback map failed: {err:?}")))?;

        let padded = padded_row(readback.row_bytes) as usize;
        let row = readback.row_bytes as usize;
        let mut out = Vec::with_capacity(row * readback.rows as usize * readback.images as usize);
        {
            let mapped = slice.get_mapped_range();
            for index in 0..(readback.rows * readback.images) as usize {
                let start = index * padded;
                if let Some(bytes) = mapped.get(start..start + row) {
                    out.extend_from_slice(bytes);
                }
            }
        }
        readback.staging.unmap();
        Ok(out)
    }

    fn read_region(&self, region: &Region) -> Result<Vec<u8>, BackendError> {
        let readback = self.start_readback(region, 0);
        self.finish_readback(&readback)
    }

    /// Copies each `(src, dst)` pair. Pairs `wgpu` can copy directly share one submission; the
    /// rest go through host memory afterwards.
    fn copy_regions(&self, pairs: &[(Region, Region)]) -> Result<(), BackendError> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("aero texture cache copy"),
            });
        let mut staged = Vec::new();
        for (src, dst) in pairs {
            let same_blocks = src.storage.format.block_width == dst.storage.format.block_width
                && src.storage.format.block_height == dst.storage.format.block_height;
            if same_blocks && copy_compatible(src.storage.format.format, dst.storage.format.format) {
                encoder.copy_texture_to_texture(
                    src.copy_texture(),
                    dst.copy_texture(),
                    intersect(src.extent, dst.extent),
                );
            } else {
                staged.push((src, dst));
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        for (src, dst) in staged {
            let data = self.read_region(src)?;
            self.write_region(dst, &data);
        }
        Ok(())
    }

    fn flush_buffer(&mut self, buffer: HostBufferId) -> Result<(), BackendError> {
        let pending = match self.buffers.get_mut(&buffer.0) {
            Some(stored) => std::mem::take(&mut stored.pending),
            None => return Err(BackendError::UnknownBuffer(buffer.0)),
        };
        let mut resolved = Vec::with_capacity(pending.len());
        for readback in &pending {
            resolved.push((readback.offset, self.finish_readback(readback)?));
        }
        let stored = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::UnknownBuffer(buffer.0))?;
        for (offset, bytes) in resolved {
            let start = (offset as usize).min(stored.data.len());
            let n = (stored.data.len() - start).min(bytes.len());
            stored.data[start..start + n].copy_from_slice(&bytes[..n]);
        }
        Ok(())
    }
}

fn map_filter(filter: Filter) -> wgpu::FilterMode {
    match filter {
        Filter::Nearest => wgpu::FilterMode::Nearest,
        Filter::Linear => wgpu::FilterMode::Linear,
    }
}

fn map_compare(op: CompareOp) -> wgpu::CompareFunction {
    match op {
        CompareOp::Never => wgpu::CompareFunction::Never,
        CompareOp::Less => wgpu::CompareFunction::Less,
        CompareOp::Equal => wgpu::CompareFunction::Equal,
        CompareOp::LessOrEqual => wgpu::CompareFunction::LessEqual,
        CompareOp::Greater => wgpu::CompareFunction::Greater,
        CompareOp::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareOp::GreaterOrEqual => wgpu::CompareFunction::GreaterEqual,
        CompareOp::Always => wgpu::CompareFunction::Always,
    }
}

fn map_address_mode(mode: AddressMode, border: bool) -> wgpu::AddressMode {
    match mode {
        AddressMode::Repeat => wgpu::AddressMode::Repeat,
        AddressMode::MirroredRepeat
        | AddressMode::MirrorClampToEdge
        | AddressMode::MirrorClampToBorder
        | AddressMode::MirrorClamp => wgpu::AddressMode::MirrorRepeat,
        AddressMode::ClampToBorder if border => wgpu::AddressMode::ClampToBorder,
        AddressMode::ClampToEdge | AddressMode::ClampToBorder | AddressMode::Clamp => {
            wgpu::AddressMode::ClampToEdge
        }
    }
}

fn map_border_color(color: [f32; 4]) -> wgpu::SamplerBorderColor {
    let [r, g, b, a] = color;
    if a < 0.5 {
        wgpu::SamplerBorderColor::TransparentBlack
    } else if r + g + b < 1.5 {
        wgpu::SamplerBorderColor::OpaqueBlack
    } else {
        wgpu::SamplerBorderColor::OpaqueWhite
    }
}

impl HostRenderer for WgpuRenderer {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn create_texture(&mut self, info: &TextureCreateInfo) -> HostTextureId {
        let format = storage_format(info, self.features);
        let is_3d = info.target == Target::Texture3D;
        let (dimension, max_dim) = if is_3d {
            (wgpu::TextureDimension::D3, self.max_dimension_3d)
        } else {
            (wgpu::TextureDimension::D2, self.max_dimension_2d)
        };

        let (mut width, mut height) = (info.width.max(1), info.height.max(1));
        if format.raw {
            width = width.div_ceil(info.block_width.max(1));
            height = height.div_ceil(info.block_height.max(1));
        }
        let depth_or_layers = if is_3d {
            info.depth.clamp(1, max_dim)
        } else {
            info.layers().clamp(1, self.max_layers)
        };
        let size = wgpu::Extent3d {
            width: width.min(max_dim),
            height: height.min(max_dim),
            depth_or_array_layers: depth_or_layers,
        };
        let max_extent = if is_3d {
            size.width.max(size.height).max(size.depth_or_array_layers)
        } else {
            size.width.max(size.height)
        };
        let max_levels = 32u32.saturating_sub(max_extent.leading_zeros());
        let levels = info.levels.clamp(1, max_levels.max(1));
        if levels != info.levels || size.width != width || size.height != height {
            warn!(
                ?info.format,
                width = info.width,
                height = info.height,
                levels = info.levels,
                "host texture clamped to device limits"
            );
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("aero guest texture"),
            size,
            mip_level_count: levels,
            sample_count: 1,
            dimension,
            format: format.format,
            usage: wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let storage = Arc::new(Storage {
            texture,
            format,
            dimension,
            size,
            levels,
        });
        let id = self.alloc_id();
        self.textures.insert(
            id,
            TextureEntry {
                storage,
                first_layer: 0,
                first_level: 0,
                info: info.clone(),
            },
        );
        HostTextureId(id)
    }

    fn create_texture_view(
        &mut self,
        parent: HostTextureId,
        info: &TextureCreateInfo,
        first_layer: u32,
        first_level: u32,
    ) -> Result<HostTextureId, BackendError> {
        let parent_entry = self.entry(parent)?;
        let storage = parent_entry.storage.clone();
        let view_format = storage_format(info, self.features);
        if !copy_compatible(view_format.format, storage.format.format)
            || view_format.bytes_per_block != storage.format.bytes_per_block
        {
            return Err(BackendError::Other(format!(
                "view format {:?} cannot alias storage format {:?}",
                info.format, storage.format.format
            )));
        }
        let entry = TextureEntry {
            storage,
            first_layer: parent_entry.first_layer + first_layer,
            first_level: parent_entry.first_level + first_level,
            info: info.clone(),
        };
        if entry.first_level >= entry.storage.levels {
            return Err(BackendError::SliceOutOfRange {
                texture: parent.0,
                layer: first_layer,
                level: first_level,
            });
        }
        let id = self.alloc_id();
        self.textures.insert(id, entry);
        Ok(HostTextureId(id))
    }

    fn release_texture(&mut self, texture: HostTextureId) {
        // The storage goes away with its last view.
        self.textures.remove(&texture.0);
    }

    fn set_data(&mut self, texture: HostTextureId, data: &[u8]) -> Result<(), BackendError> {
        let info = self.entry(texture)?.info.clone();
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
                let region = self.region(texture, layer, level, false)?;
                self.write_region(&region, &data[offset..offset + len]);
                offset += len;
            }
        }
        Ok(())
    }

    fn set_data_slice(
        &mut self,
        texture: HostTextureId,
        layer: u32,
        level: u32,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let plane = self.is_3d(texture)?;
        let region = self.region(texture, layer, level, plane)?;
        self.write_region(&region, data);
        Ok(())
    }

    fn get_data(&mut self, texture: HostTextureId) -> Result<Vec<u8>, BackendError> {
        let info = self.entry(texture)?.info.clone();
        let mut readbacks = Vec::new();
        for level in 0..info.levels {
            for layer in 0..info.layers() {
                let region = self.region(texture, layer, level, false)?;
                readbacks.push(self.start_readback(&region, 0));
            }
        }
        let mut out = Vec::with_capacity(info.total_size());
        for readback in &readbacks {
            out.extend_from_slice(&self.finish_readback(readback)?);
        }
        Ok(out)
    }

    fn get_data_slice(
        &mut self,
        texture: HostTextureId,
        layer: u32,
        level: u32,
    ) -> Result<Vec<u8>, BackendError> {
        let plane = self.is_3d(texture)?;
        let region = self.region(texture, layer, level, plane)?;
        self.read_region(&region)
    }

    fn copy_texture(
        &mut self,
        src: HostTextureId,
        dst: HostTextureId,
        dst_layer: u32,
        dst_level: u32,
    ) -> Result<(), BackendError> {
        let info = self.entry(src)?.info.clone();
        let mut pairs = Vec::new();
        for level in 0..info.levels {
            for layer in 0..info.layers() {
                let from = self.region(src, layer, level, false)?;
                let Ok(to) = self.region(dst, dst_layer + layer, dst_level + level, false) else {
                    continue;
                };
                pairs.push((from, to));
            }
        }
        self.copy_regions(&pairs)
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
        let from = self.region(src, src_layer, src_level, self.is_3d(src)?)?;
        let to = self.region(dst, dst_layer, dst_level, self.is_3d(dst)?)?;
        self.copy_regions(&[(from, to)])
    }

    fn copy_texture_scaled(
        &mut self,
        src: HostTextureId,
        dst: HostTextureId,
    ) -> Result<(), BackendError> {
        let src_info = self.entry(src)?.info.clone();
        let dst_info = self.entry(dst)?.info.clone();
        let levels = src_info.levels.min(dst_info.levels);
        let layers = src_info.layers().min(dst_info.layers());

        for level in 0..levels {
            for layer in 0..layers {
                let from = self.region(src, layer, level, false)?;
                let to = self.region(dst, layer, level, false)?;
                let (sw, sh) = from.blocks();
                let (dw, dh) = to.blocks();
                let planes = from
                    .extent
                    .depth_or_array_layers
                    .min(to.extent.depth_or_array_layers);
                let texel = from.storage.format.bytes_per_block as usize;
                let data = self.read_region(&from)?;
                let out = resample_nearest(
                    &data,
                    (sw as usize, sh as usize),
                    (dw as usize, dh as usize),
                    planes as usize,
                    texel,
                );
                self.write_region(&to, &out);
            }
        }
        Ok(())
    }

    fn create_buffer(&mut self, size: u64) -> HostBufferId {
        let id = self.alloc_id();
        self.buffers.insert(
            id,
            StoredBuffer {
                data: vec![0; size as usize],
                pending: Vec::new(),
            },
        );
        HostBufferId(id)
    }

    fn delete_buffer(&mut self, buffer: HostBufferId) {
        self.buffers.remove(&buffer.0);
    }

    fn copy_texture_to_buffer(
        &mut self,
        texture: HostTextureId,
        buffer: HostBufferId,
        offset: u64,
        layer: u32,
        level: u32,
    ) -> Result<(), BackendError> {
        if !self.buffers.contains_key(&buffer.0) {
            return Err(BackendError::UnknownBuffer(buffer.0));
        }
        let plane = self.is_3d(texture)?;
        let region = self.region(texture, layer, level, plane)?;
        let readback = self.start_readback(&region, offset);
        if let Some(stored) = self.buffers.get_mut(&buffer.0) {
            stored.pending.push(readback);
        }
        Ok(())
    }

    fn get_buffer_data(
        &mut self,
        buffer: HostBufferId,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, BackendError> {
        self.flush_buffer(buffer)?;
        let stored = self
            .buffers
            .get(&buffer.0)
            .ok_or(BackendError::UnknownBuffer(buffer.0))?;
        let start = offset as usize;
        let end = start + size as usize;
        stored
            .data
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or(BackendError::SizeMismatch {
                expected: end,
                actual: stored.data.len(),
            })
    }

    fn create_sampler(&mut self, info: &SamplerCreateInfo) -> HostSamplerId {
        let border = self
            .features
            .contains(wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER);
        let address_u = map_address_mode(info.address_u, border);
        let address_v = map_address_mode(info.address_v, border);
        let address_w = map_address_mode(info.address_p, border);
        let uses_border = [address_u, address_v, address_w].contains(&wgpu::AddressMode::ClampToBorder);

        let lod_min_clamp = info.min_lod.max(0.0);
        let (mipmap_filter, lod_max_clamp) = match info.mip_filter {
            // No mipmapping: sample only the base level.
            MipFilter::None => (wgpu::FilterMode::Nearest, lod_min_clamp + 0.25),
            MipFilter::Nearest => (wgpu::FilterMode::Nearest, info.max_lod.max(lod_min_clamp)),
            MipFilter::Linear => (wgpu::FilterMode::Linear, info.max_lod.max(lod_min_clamp)),
        };
        let all_linear = info.min_filter == Filter::Linear
            && info.mag_filter == Filter::Linear
            && mipmap_filter == wgpu::FilterMode::Linear;
        let anisotropy_clamp = if all_linear {
            info.max_anisotropy.clamp(1.0, 16.0) as u16
        } else {
            1
        };
        if info.lod_bias != 0.0 {
            debug!(lod_bias = info.lod_bias, "wgpu samplers have no LOD bias, ignoring");
        }

        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("aero guest sampler"),
            address_mode_u: address_u,
            address_mode_v: address_v,
            address_mode_w: address_w,
            mag_filter: map_filter(info.mag_filter),
            min_filter: map_filter(info.min_filter),
            mipmap_filter,
            lod_min_clamp,
            lod_max_clamp,
            compare: info.compare.map(map_compare),
            anisotropy_clamp,
            border_color: uses_border.then(|| map_border_color(info.border_color)),
        });
        let id = self.alloc_id();
        self.samplers.insert(id, sampler);
        HostSamplerId(id)
    }

    fn release_sampler(&mut self, sampler: HostSamplerId) {
        self.samplers.remove(&sampler.0);
    }

    fn create_sync(&mut self, id: u64) {
        let index = self.queue.submit(std::iter::empty());
        self.fences.insert(id, index);
    }

    fn wait_sync(&mut self, id: u64) {
        let Some(index) = self.fences.get(&id).cloned() else {
            return;
        };
        let _ = self
            .device
            .poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        self.fences = self.fences.split_off(&(id + 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{DepthStencilMode, SwizzleComponent};
    use pretty_assertions::assert_eq;

    fn create_info(format: Format) -> TextureCreateInfo {
        let format_info = format.info();
        TextureCreateInfo {
            width: 64,
            height: 32,
            depth: 1,
            levels: 1,
            samples: 1,
            block_width: format_info.block_width,
            block_height: format_info.block_height,
            bytes_per_pixel: format_info.bytes_per_pixel,
            format,
            depth_stencil_mode: DepthStencilMode::Depth,
            target: Target::Texture2D,
            swizzle: SwizzleComponent::IDENTITY,
        }
    }

    #[test]
    fn depth_formats_are_stored_as_raw_texels() {
        let storage = storage_format(&create_info(Format::D24UnormS8Uint), wgpu::Features::empty());
        assert_eq!(storage.format, wgpu::TextureFormat::R32Uint);
        assert!(storage.raw);

        let storage = storage_format(&create_info(Format::D32FloatS8Uint), wgpu::Features::empty());
        assert_eq!(storage.format, wgpu::TextureFormat::Rg32Uint);
    }

    #[test]
    fn compressed_formats_need_the_device_feature() {
        let info = create_info(Format::Bc1RgbaUnorm);

        let without = storage_format(&info, wgpu::Features::empty());
        assert!(without.raw);
        assert_eq!(without.format, wgpu::TextureFormat::Rg32Uint);

        let with = storage_format(&info, wgpu::Features::TEXTURE_COMPRESSION_BC);
        assert!(!with.raw);
        assert_eq!(with.format, wgpu::TextureFormat::Bc1RgbaUnorm);
        assert_eq!((with.block_width, with.block_height), (4, 4));
    }

    #[test]
    fn srgb_variants_copy_between_each_other() {
        assert!(copy_compatible(
            wgpu::TextureFormat::Rgba8Unorm,
            wgpu::TextureFormat::Rgba8UnormSrgb
        ));
        assert!(!copy_compatible(
            wgpu::TextureFormat::Rgba8Unorm,
            wgpu::TextureFormat::R32Uint
        ));
    }

    #[test]
    fn compression_opt_out_keeps_other_features() {
        let available = wgpu::Features::TEXTURE_COMPRESSION_BC
            | wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER;
        assert_eq!(negotiated_features(available, false), available);
        assert_eq!(
            negotiated_features(available, true),
            wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER
        );
        let caps = capabilities_for(wgpu::Features::TEXTURE_COMPRESSION_BC);
        assert!(caps.supports(CapabilityFlags::BC67_COMPRESSION));
        assert!(!caps.supports(CapabilityFlags::R4G4_FORMAT));
    }

    #[test]
    fn readback_rows_are_padded_to_the_copy_alignment() {
        assert_eq!(padded_row(4), 256);
        assert_eq!(padded_row(256), 256);
        assert_eq!(padded_row(260), 512);
    }

    #[test]
    fn nearest_resample_doubles_texels() {
        let out = resample_nearest(&[1, 2], (2, 1), (4, 1), 1, 1);
        assert_eq!(out, vec![1, 1, 2, 2]);
    }

    #[test]
    fn headless_round_trip_when_an_adapter_exists() -> anyhow::Result<()> {
        let Ok(mut renderer) = WgpuRenderer::new_headless() else {
            eprintln!("skipping: no wgpu adapter");
            return Ok(());
        };
        let mut info = create_info(Format::R8G8B8A8Unorm);
        info.width = 4;
        info.height = 4;
        let texture = renderer.create_texture(&info);
        let data: Vec<u8> = (0..64).collect();
        renderer.set_data(texture, &data)?;
        assert_eq!(renderer.get_data(texture)?, data);

        let copy = renderer.create_texture(&info);
        renderer.copy_texture(texture, copy, 0, 0)?;
        assert_eq!(renderer.get_data_slice(copy, 0, 0)?, data);
        Ok(())
    }
}
