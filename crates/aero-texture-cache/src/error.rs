use thiserror::Error;

/// Guest physical memory access that fell outside the backing store.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("guest memory access out of bounds: gpa=0x{gpa:x}, len=0x{len:x}")]
pub struct GuestMemoryError {
    pub gpa: u64,
    pub len: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("unknown host texture {0}")]
    UnknownTexture(u32),
    #[error("unknown host buffer {0}")]
    UnknownBuffer(u32),
    #[error("slice (layer {layer}, level {level}) is out of range for host texture {texture}")]
    SliceOutOfRange { texture: u32, layer: u32, level: u32 },
    #[error("host data size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("host backend error: {0}")]
    Other(String),
}

/// Internal failures of the texture cache.
///
/// Public lookup operations never surface these: a failed upload or readback is logged and the
/// affected texture keeps whatever data it had.
#[derive(Debug, Error)]
pub enum TextureCacheError {
    #[error(transparent)]
    GuestMemory(#[from] GuestMemoryError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("texture {0:?} no longer exists")]
    MissingTexture(crate::TextureId),
    #[error("texture layout is invalid: {0}")]
    InvalidLayout(&'static str),
}

pub type Result<T, E = TextureCacheError> = std::result::Result<T, E>;
