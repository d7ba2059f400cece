//! Guest memory services the cache consumes.
//!
//! The emulator owns the real implementations; the types here define the interface and provide
//! in-process versions good enough for tests and for embedders without their own memory system.

mod guest;
mod physical;
mod range;
mod tracking;
mod vm;

pub use guest::{GuestMemory, VecGuestMemory};
pub use physical::PhysicalMemory;
pub use range::{MemoryRange, MultiRange, PTE_UNMAPPED};
pub use tracking::{GranularTracking, RegionHandle, TrackingOwner};
pub use vm::{GpuVirtualMemory, PageTable, RemapAction, UnmapEvent, UnmapListener, PAGE_SIZE};
