//! `aero-texture-cache` keeps host copies of guest GPU textures coherent with guest memory.
//!
//! Currently this crate provides:
//! - A texture cache that finds, creates and aliases host textures for guest texture
//!   descriptions, including views, copy dependencies and incompatible overlaps
//!   (see [`TextureCache`]).
//! - Per-subresource dirty tracking with deferred copies and flushes back to guest memory
//!   (see [`TextureCache::flush_for_guest_access`] and [`TextureCache::create_host_sync`]).
//! - Guest descriptor tables for textures and samplers, and a per-channel LRU of those tables
//!   (see [`pool`]).
//! - In-process guest memory, GPU page table and software host backend used by tests and by
//!   embedders without their own implementations (see [`memory`] and [`backend`]).
//!
//! All cache mutation happens on one thread, the GPU thread. Guest memory unmaps may be
//! reported from any thread; their effects are queued and applied at the start of the next
//! cache operation.

mod auto_delete;
mod cache;
mod context;
mod convert;
mod error;
mod group;
mod layout;
mod range_index;
mod texture;

pub mod backend;
pub mod compat;
pub mod config;
pub mod format;
pub mod info;
pub mod memory;
pub mod pool;
pub mod size;
pub mod stats;

pub use cache::{CopySurface, RenderTarget, TextureCache};
pub use compat::{TextureMatchQuality, TextureSearchFlags, TextureViewCompatibility};
pub use config::TextureCacheConfig;
pub use context::{GpuContext, HostSyncFlags};
pub use convert::FormatConverter;
pub use error::{BackendError, GuestMemoryError, Result, TextureCacheError};
pub use group::{HandleSnapshot, HandleState};
pub use info::{DepthStencilMode, SwizzleComponent, Target, TextureCreateInfo, TextureInfo};
pub use texture::{Texture, TextureScaleMode};

slotmap::new_key_type! {
    /// A texture (storage or view) owned by a [`TextureCache`].
    pub struct TextureId;
    /// A storage texture's subresource tracking state, shared with its views.
    pub struct GroupId;
    /// One tracked subresource range of a group.
    pub struct HandleId;
    /// One direction of a copy dependency edge.
    pub struct DependencyId;
    /// A descriptor pool registered with a [`TextureCache`].
    pub struct PoolId;
}
