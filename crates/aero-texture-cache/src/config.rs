/// Tunables for the texture cache and its pools.
///
/// The defaults match what a desktop-class host with a few GiB of video memory wants; tests
/// shrink the auto-delete bounds to exercise eviction with a handful of textures.
#[derive(Clone, Debug, PartialEq)]
pub struct TextureCacheConfig {
    /// Maximum number of textures owned by the auto-delete cache.
    pub auto_delete_max_count: usize,
    /// Population floor below which the auto-delete cache never evicts.
    pub auto_delete_min_count: usize,
    /// Fraction of the host-reported GPU memory that cache-owned textures may occupy.
    pub auto_delete_memory_fraction: f64,
    /// Byte budget used when the host does not report its memory size.
    pub auto_delete_default_budget: u64,
    /// Lower clamp for the byte budget.
    pub auto_delete_min_budget: u64,
    /// Upper clamp for the byte budget.
    pub auto_delete_max_budget: u64,

    /// Number of descriptor pools kept alive per pool kind.
    pub pool_cache_capacity: usize,
    /// Ticks a pool must go unused before it may be evicted from the pool cache.
    pub pool_cache_min_ticks_before_removal: u64,

    /// Layer/depth count above which array and 3D textures subdivide eagerly.
    pub granular_layer_threshold: u32,

    /// Stage frequently flushed handles into persistent host buffers.
    pub flush_buffers: bool,

    /// Render target resolution scale. `1.0` disables scaling.
    pub resolution_scale: f32,
    /// Smallest width/height (in pixels) a texture needs to be considered for scaling.
    pub scale_eligible_min_size: u32,

    /// Forced maximum anisotropy for samplers. `None` uses the value in the sampler descriptor.
    pub max_anisotropy: Option<f32>,
}

impl Default for TextureCacheConfig {
    fn default() -> Self {
        Self {
            auto_delete_max_count: 2048,
            auto_delete_min_count: 32,
            auto_delete_memory_fraction: 0.5,
            auto_delete_default_budget: 1 << 30,
            auto_delete_min_budget: 512 << 20,
            auto_delete_max_budget: 4 << 30,
            pool_cache_capacity: 2,
            pool_cache_min_ticks_before_removal: 10,
            granular_layer_threshold: 8,
            flush_buffers: true,
            resolution_scale: 1.0,
            scale_eligible_min_size: 64,
            max_anisotropy: None,
        }
    }
}

impl TextureCacheConfig {
    /// Byte budget for cache-owned textures given the host's reported memory size.
    pub fn auto_delete_budget(&self, host_memory: Option<u64>) -> u64 {
        match host_memory {
            Some(bytes) if bytes > 0 => {
                let scaled = (bytes as f64 * self.auto_delete_memory_fraction) as u64;
                scaled.clamp(self.auto_delete_min_budget, self.auto_delete_max_budget)
            }
            _ => self.auto_delete_default_budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_defaults_when_host_memory_is_unknown() {
        let config = TextureCacheConfig::default();
        assert_eq!(config.auto_delete_budget(None), 1 << 30);
        assert_eq!(config.auto_delete_budget(Some(0)), 1 << 30);
    }

    #[test]
    fn budget_is_clamped_fraction_of_host_memory() {
        let config = TextureCacheConfig::default();
        assert_eq!(config.auto_delete_budget(Some(4 << 30)), 2 << 30);
        assert_eq!(config.auto_delete_budget(Some(256 << 20)), 512 << 20);
        assert_eq!(config.auto_delete_budget(Some(64 << 30)), 4 << 30);
    }
}
