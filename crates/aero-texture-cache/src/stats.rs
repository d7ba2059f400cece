use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of [`CacheStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub textures_created: u64,
    pub views_created: u64,
    pub textures_reused: u64,
    pub copy_dependencies: u64,
    pub deferred_copies: u64,
    pub uploads: u64,
    pub flushes: u64,
    pub evictions: u64,
    pub pool_invalidations: u64,
}

/// Counters for the texture cache.
///
/// Cheap to update on the GPU thread and safe to read from elsewhere.
#[derive(Debug, Default)]
pub struct CacheStats {
    textures_created: AtomicU64,
    views_created: AtomicU64,
    textures_reused: AtomicU64,
    copy_dependencies: AtomicU64,
    deferred_copies: AtomicU64,
    uploads: AtomicU64,
    flushes: AtomicU64,
    evictions: AtomicU64,
    pool_invalidations: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_textures_created(&self) {
        self.textures_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_views_created(&self) {
        self.views_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_textures_reused(&self) {
        self.textures_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_copy_dependencies(&self) {
        self.copy_dependencies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deferred_copies(&self) {
        self.deferred_copies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_uploads(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flushes(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_evictions(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pool_invalidations(&self) {
        self.pool_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            textures_created: self.textures_created.load(Ordering::Relaxed),
            views_created: self.views_created.load(Ordering::Relaxed),
            textures_reused: self.textures_reused.load(Ordering::Relaxed),
            copy_dependencies: self.copy_dependencies.load(Ordering::Relaxed),
            deferred_copies: self.deferred_copies.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            pool_invalidations: self.pool_invalidations.load(Ordering::Relaxed),
        }
    }
}
