//! Guest memory unmaps.
//!
//! The page table reports unmaps on the thread that changes the mapping. The handler only looks
//! up affected textures in the shared index and queues the work; the GPU thread applies it at
//! the start of its next cache operation.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use super::{SharedState, TextureCache};
use crate::memory::{MultiRange, RemapAction, UnmapEvent, UnmapListener};
use crate::TextureId;

#[derive(Debug)]
pub(crate) enum UnmapWork {
    /// `range` no longer backs `textures`.
    Unmapped {
        textures: Vec<TextureId>,
        range: MultiRange,
    },
    /// The mapping change completed. Pools re-resolve partially mapped textures other than
    /// `unmapped`, whose references were already handed back.
    Remapped { unmapped: Vec<TextureId> },
}

pub(crate) struct UnmapHandler {
    shared: Arc<SharedState>,
}

impl fmt::Debug for UnmapHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnmapHandler").finish_non_exhaustive()
    }
}

impl UnmapHandler {
    pub(crate) fn new(shared: Arc<SharedState>) -> Self {
        Self { shared }
    }
}

impl UnmapListener for UnmapHandler {
    fn memory_unmapped(&self, event: &UnmapEvent) -> Option<RemapAction> {
        let textures = self.shared.index().find_overlaps(&event.regions);
        if textures.is_empty() && self.shared.partially_mapped().is_empty() {
            return None;
        }
        trace!(
            address = event.address,
            size = event.size,
            textures = textures.len(),
            "texture memory unmapped"
        );

        if !textures.is_empty() {
            self.shared.pending().push_back(UnmapWork::Unmapped {
                textures: textures.clone(),
                range: event.regions.clone(),
            });
        }
        let shared = self.shared.clone();
        Some(Box::new(move || {
            shared
                .pending()
                .push_back(UnmapWork::Remapped { unmapped: textures });
        }))
    }
}

impl TextureCache {
    fn pop_unmap_work(&self) -> Option<UnmapWork> {
        self.shared.pending().pop_front()
    }

    /// Applies unmaps reported since the last call.
    ///
    /// Runs at the start of every lookup and pool access, so callers normally never need it.
    pub fn process_pending_unmaps(&mut self) {
        while let Some(work) = self.pop_unmap_work() {
            match work {
                UnmapWork::Unmapped { textures, range } => {
                    for texture in textures {
                        self.texture_unmapped(texture, &range);
                    }
                }
                UnmapWork::Remapped { unmapped } => {
                    let remaining: Vec<TextureId> = {
                        let mut partially_mapped = self.shared.partially_mapped();
                        for texture in &unmapped {
                            partially_mapped.remove(texture);
                        }
                        partially_mapped.iter().copied().collect()
                    };
                    for texture in remaining {
                        self.texture_update_pool_mappings(texture);
                    }
                }
            }
        }
    }
}
