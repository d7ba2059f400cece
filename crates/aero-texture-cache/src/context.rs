use std::fmt;

use bitflags::bitflags;

use crate::backend::{Capabilities, HostRenderer};
use crate::config::TextureCacheConfig;
use crate::HandleId;

bitflags! {
    /// Conditions under which [`crate::TextureCache::create_host_sync`] inserts a fence.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct HostSyncFlags: u32 {
        /// The guest is waiting on a syncpoint; handles with pending flushes get a fence.
        const SYNCPOINT = 1 << 0;
        /// Create a fence even if nothing asked for one.
        const FORCE = 1 << 1;
    }
}

/// Host renderer plus the counters that order GPU work against guest accesses.
///
/// `sequence_number` advances once per submitted batch and lets pools skip descriptor
/// revalidation within a batch. `sync_number` names the next host fence; handles remember the
/// fence that covers their last modification so a guest read only waits as long as it must.
pub struct GpuContext {
    renderer: Box<dyn HostRenderer + Send>,
    capabilities: Capabilities,
    config: TextureCacheConfig,

    sequence_number: u64,
    sync_number: u64,
    modified_sequence: u64,

    sync_actions: Vec<HandleId>,
}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext")
            .field("capabilities", &self.capabilities)
            .field("sequence_number", &self.sequence_number)
            .field("sync_number", &self.sync_number)
            .field("pending_sync_actions", &self.sync_actions.len())
            .finish_non_exhaustive()
    }
}

impl GpuContext {
    pub fn new(renderer: impl HostRenderer + Send + 'static, config: TextureCacheConfig) -> Self {
        let capabilities = renderer.capabilities();
        Self {
            renderer: Box::new(renderer),
            capabilities,
            config,
            sequence_number: 1,
            sync_number: 0,
            modified_sequence: 0,
            sync_actions: Vec::new(),
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn config(&self) -> &TextureCacheConfig {
        &self.config
    }

    /// Sampler pools pick the new value up at their next synchronization.
    pub fn set_max_anisotropy(&mut self, max_anisotropy: Option<f32>) {
        self.config.max_anisotropy = max_anisotropy;
    }

    pub fn renderer(&mut self) -> &mut dyn HostRenderer {
        self.renderer.as_mut()
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Marks the start of a new batch of GPU work.
    pub fn advance_sequence(&mut self) {
        self.sequence_number += 1;
    }

    /// Number of the next host fence.
    pub fn sync_number(&self) -> u64 {
        self.sync_number
    }

    pub(crate) fn next_modified_sequence(&mut self) -> u64 {
        self.modified_sequence += 1;
        self.modified_sequence
    }

    pub(crate) fn register_sync_action(&mut self, handle: HandleId) {
        if !self.sync_actions.contains(&handle) {
            self.sync_actions.push(handle);
        }
    }

    pub(crate) fn has_sync_actions(&self) -> bool {
        !self.sync_actions.is_empty()
    }

    pub(crate) fn take_sync_actions(&mut self) -> Vec<HandleId> {
        std::mem::take(&mut self.sync_actions)
    }

    /// Puts back actions that asked to stay registered, ahead of any registered meanwhile.
    pub(crate) fn restore_sync_actions(&mut self, mut kept: Vec<HandleId>) {
        for handle in self.sync_actions.drain(..) {
            if !kept.contains(&handle) {
                kept.push(handle);
            }
        }
        self.sync_actions = kept;
    }

    pub(crate) fn forget_sync_action(&mut self, handle: HandleId) {
        self.sync_actions.retain(|&h| h != handle);
    }

    /// Inserts the next host fence and returns its number.
    pub(crate) fn signal_sync(&mut self) -> u64 {
        let id = self.sync_number;
        self.renderer.create_sync(id);
        self.sync_number += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareRenderer;
    use pretty_assertions::assert_eq;
    use slotmap::SlotMap;

    #[test]
    fn sync_numbers_advance_per_fence() {
        let renderer = SoftwareRenderer::new();
        let mut ctx = GpuContext::new(renderer.clone(), TextureCacheConfig::default());

        assert_eq!(ctx.signal_sync(), 0);
        assert_eq!(ctx.signal_sync(), 1);
        assert_eq!(ctx.sync_number(), 2);
        assert_eq!(renderer.last_signalled_sync(), Some(1));
    }

    #[test]
    fn kept_sync_actions_are_not_duplicated() {
        let mut keys: SlotMap<HandleId, ()> = SlotMap::with_key();
        let a = keys.insert(());
        let b = keys.insert(());

        let mut ctx = GpuContext::new(SoftwareRenderer::new(), TextureCacheConfig::default());
        ctx.register_sync_action(a);
        ctx.register_sync_action(a);
        let taken = ctx.take_sync_actions();
        assert_eq!(taken, vec![a]);

        ctx.register_sync_action(b);
        ctx.register_sync_action(a);
        ctx.restore_sync_actions(vec![a]);
        assert_eq!(ctx.take_sync_actions(), vec![a, b]);
        assert!(!ctx.has_sync_actions());
    }
}
