#![allow(dead_code)]

use std::sync::Arc;

use aero_texture_cache::backend::SoftwareRenderer;
use aero_texture_cache::format::Format;
use aero_texture_cache::memory::{PageTable, PhysicalMemory, VecGuestMemory};
use aero_texture_cache::{GpuContext, Target, TextureCache, TextureCacheConfig, TextureInfo};

/// GPU virtual base of the test window.
pub const GPU_BASE: u64 = 0x10_0000;
/// Guest physical address `GPU_BASE` maps to.
pub const PHYS_BASE: u64 = 0x1_0000;
pub const WINDOW_SIZE: u64 = 0x10_0000;

pub const GUEST_MEMORY_SIZE: usize = 0x20_0000;

pub struct Harness {
    pub cache: TextureCache,
    pub renderer: SoftwareRenderer,
    pub vm: Arc<PageTable>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(TextureCacheConfig::default())
    }

    pub fn with_config(config: TextureCacheConfig) -> Self {
        init_tracing();
        let vm = Arc::new(PageTable::new());
        vm.map(GPU_BASE, PHYS_BASE, WINDOW_SIZE);
        let physical = PhysicalMemory::new(VecGuestMemory::new(GUEST_MEMORY_SIZE));
        let renderer = SoftwareRenderer::new();
        let ctx = GpuContext::new(renderer.clone(), config);
        let cache = TextureCache::new(ctx, physical, vm.clone());
        Self { cache, renderer, vm }
    }

    pub fn write_guest(&self, gpu_address: u64, data: &[u8]) -> anyhow::Result<()> {
        self.cache.physical().write(phys(gpu_address), data)?;
        Ok(())
    }

    pub fn read_guest(&self, gpu_address: u64, len: usize) -> anyhow::Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.cache.physical().read(phys(gpu_address), &mut out)?;
        Ok(out)
    }

    /// Host contents of `(layer, level)` of a cached texture.
    pub fn host_slice(&self, id: aero_texture_cache::TextureId, layer: u32, level: u32) -> Option<Vec<u8>> {
        let host = self.cache.texture(id)?.host()?;
        self.renderer.slice_data(host, layer, level)
    }
}

pub fn phys(gpu_address: u64) -> u64 {
    gpu_address - GPU_BASE + PHYS_BASE
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A pitch-linear RGBA8 texture whose rows are tightly packed.
pub fn linear_rgba(gpu_address: u64, width: u32, height: u32) -> TextureInfo {
    TextureInfo {
        gpu_address,
        width,
        height,
        stride: width * 4,
        is_linear: true,
        format_info: Format::R8G8B8A8Unorm.info(),
        ..TextureInfo::default()
    }
}

pub fn tiled(gpu_address: u64, format: Format, width: u32, height: u32) -> TextureInfo {
    TextureInfo {
        gpu_address,
        width,
        height,
        format_info: format.info(),
        ..TextureInfo::default()
    }
}

pub fn tiled_array(gpu_address: u64, width: u32, height: u32, layers: u32, levels: u32) -> TextureInfo {
    TextureInfo {
        gpu_address,
        width,
        height,
        depth_or_layers: layers,
        levels,
        target: if layers > 1 {
            Target::Texture2DArray
        } else {
            Target::Texture2D
        },
        format_info: Format::R8G8B8A8Unorm.info(),
        ..TextureInfo::default()
    }
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
