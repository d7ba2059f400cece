//! Host graphics backend interface.
//!
//! The cache never touches a graphics API directly; it drives an implementation of
//! [`HostRenderer`] through opaque resource ids. [`SoftwareRenderer`] keeps resources in host
//! memory and is what the tests run against; the `wgpu` feature adds a real device backend.

mod software;
#[cfg(feature = "wgpu")]
mod wgpu_backend;

pub use software::{SoftwareRenderer, SoftwareRendererStats};
#[cfg(feature = "wgpu")]
pub use wgpu_backend::WgpuRenderer;

use bitflags::bitflags;

use crate::error::BackendError;
use crate::info::TextureCreateInfo;
use crate::pool::SamplerCreateInfo;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostTextureId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostBufferId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostSamplerId(pub u32);

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct CapabilityFlags: u32 {
        const ASTC_COMPRESSION = 1 << 0;
        const BC123_COMPRESSION = 1 << 1;
        const BC45_COMPRESSION = 1 << 2;
        const BC67_COMPRESSION = 1 << 3;
        const ETC2_COMPRESSION = 1 << 4;
        const THREE_D_TEXTURE_COMPRESSION = 1 << 5;
        const R4G4_FORMAT = 1 << 6;
        const R4G4B4A4_FORMAT = 1 << 7;
        const FIVE_BIT_COMPONENT_FORMAT = 1 << 8;
        const CUBEMAP_VIEW = 1 << 9;
        /// Views may use a different format than their storage.
        const MISMATCHING_VIEW_FORMAT = 1 << 10;
    }
}

/// What the host backend can do.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Capabilities {
    pub flags: CapabilityFlags,
    pub max_anisotropy: f32,
    /// Dedicated GPU memory, when the backend can report it.
    pub total_memory: Option<u64>,
}

impl Capabilities {
    pub fn supports(&self, flags: CapabilityFlags) -> bool {
        self.flags.contains(flags)
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            flags: CapabilityFlags::all(),
            max_anisotropy: 16.0,
            total_memory: None,
        }
    }
}

/// Operations the texture cache needs from the host graphics API.
///
/// Slices are addressed as `(layer, level)` relative to the texture (or view) passed in. For 3D
/// textures `layer` selects a depth plane of the level.
pub trait HostRenderer {
    fn capabilities(&self) -> Capabilities;

    fn create_texture(&mut self, info: &TextureCreateInfo) -> HostTextureId;
    fn create_texture_view(
        &mut self,
        parent: HostTextureId,
        info: &TextureCreateInfo,
        first_layer: u32,
        first_level: u32,
    ) -> Result<HostTextureId, BackendError>;
    fn release_texture(&mut self, texture: HostTextureId);

    /// Uploads packed data for every slice, level-major.
    fn set_data(&mut self, texture: HostTextureId, data: &[u8]) -> Result<(), BackendError>;
    fn set_data_slice(
        &mut self,
        texture: HostTextureId,
        layer: u32,
        level: u32,
        data: &[u8],
    ) -> Result<(), BackendError>;
    fn get_data(&mut self, texture: HostTextureId) -> Result<Vec<u8>, BackendError>;
    fn get_data_slice(
        &mut self,
        texture: HostTextureId,
        layer: u32,
        level: u32,
    ) -> Result<Vec<u8>, BackendError>;

    /// Copies every slice of `src` into `dst`, starting at `(dst_layer, dst_level)`.
    fn copy_texture(
        &mut self,
        src: HostTextureId,
        dst: HostTextureId,
        dst_layer: u32,
        dst_level: u32,
    ) -> Result<(), BackendError>;
    #[allow(clippy::too_many_arguments)]
    fn copy_texture_slice(
        &mut self,
        src: HostTextureId,
        dst: HostTextureId,
        src_layer: u32,
        dst_layer: u32,
        src_level: u32,
        dst_level: u32,
    ) -> Result<(), BackendError>;
    /// Copies `src` into `dst` resampling to `dst`'s size.
    fn copy_texture_scaled(
        &mut self,
        src: HostTextureId,
        dst: HostTextureId,
    ) -> Result<(), BackendError>;

    fn create_buffer(&mut self, size: u64) -> HostBufferId;
    fn delete_buffer(&mut self, buffer: HostBufferId);
    fn copy_texture_to_buffer(
        &mut self,
        texture: HostTextureId,
        buffer: HostBufferId,
        offset: u64,
        layer: u32,
        level: u32,
    ) -> Result<(), BackendError>;
    fn get_buffer_data(
        &mut self,
        buffer: HostBufferId,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, BackendError>;

    fn create_sampler(&mut self, info: &SamplerCreateInfo) -> HostSamplerId;
    fn release_sampler(&mut self, sampler: HostSamplerId);

    /// Inserts a fence that signals sync number `id` once prior work completes.
    fn create_sync(&mut self, id: u64);
    /// Blocks until the fence for sync number `id` has signalled.
    fn wait_sync(&mut self, id: u64);
}
