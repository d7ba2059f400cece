//! Per-subresource tracking state and its transitions.

use tracing::trace;

use crate::cache::TextureCache;
use crate::memory::RegionHandle;
use crate::{GroupId, HandleId, TextureId};

const FLUSH_BALANCE_INCREMENT: i32 = 6;
const FLUSH_BALANCE_WRITE_COST: i32 = 1;
const FLUSH_BALANCE_THRESHOLD: i32 = 7;
const FLUSH_BALANCE_MAX: i32 = 60;
const FLUSH_BALANCE_MIN: i32 = -10;

/// Which copy of a subresource is authoritative.
///
/// `H` names the source handle of a pending copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleState<H> {
    /// Host and guest agree.
    Clean,
    /// The guest wrote the backing memory; the host copy is stale.
    Dirty,
    /// The GPU wrote the host copy; guest memory is stale until flushed.
    Modified,
    /// Another handle holds newer data that must be copied in before use.
    PendingCopy(H),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleEvent<H> {
    /// The guest CPU wrote the handle's memory.
    GuestWrite,
    /// The GPU wrote the handle's subresource.
    GpuWrite,
    /// A dependency was written on the GPU; pull from it before the next use.
    DeferCopy(H),
    /// Guest memory was uploaded to the host.
    Reloaded,
    /// A copy from a dependency finished.
    CopyCompleted {
        source_modified: bool,
        /// The source is still bound for writing and must be pulled again on the next use.
        keep_pending: bool,
    },
    /// Host data was written back to guest memory.
    Flushed,
    /// The contents are about to be fully overwritten; any pending load is pointless.
    Discarded,
    /// The GPU data was superseded by a write through an incompatible alias.
    ClearModified,
}

/// Where a synchronization has to fetch the handle's data from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncSource<H> {
    Copy(H),
    Guest,
    None,
}

impl<H: Copy> HandleState<H> {
    /// Applies `event`. Events are applied in the order they happened, so the latest writer
    /// always wins.
    pub fn transition(self, event: HandleEvent<H>) -> Self {
        use HandleState::*;

        match event {
            HandleEvent::GuestWrite => Dirty,
            HandleEvent::GpuWrite => Modified,
            HandleEvent::DeferCopy(source) => PendingCopy(source),
            HandleEvent::Reloaded => match self {
                Dirty => Clean,
                other => other,
            },
            HandleEvent::CopyCompleted {
                source_modified,
                keep_pending,
            } => match self {
                PendingCopy(_) if keep_pending => self,
                PendingCopy(_) if source_modified => Modified,
                PendingCopy(_) => Clean,
                _ if source_modified => Modified,
                other => other,
            },
            HandleEvent::Flushed => match self {
                Modified => Clean,
                other => other,
            },
            HandleEvent::Discarded => match self {
                Dirty | PendingCopy(_) => Clean,
                other => other,
            },
            HandleEvent::ClearModified => match self {
                Modified | PendingCopy(_) => Clean,
                other => other,
            },
        }
    }

    pub fn is_modified(&self) -> bool {
        matches!(self, HandleState::Modified)
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self, HandleState::Dirty)
    }

    pub fn deferred_copy(&self) -> Option<H> {
        match *self {
            HandleState::PendingCopy(source) => Some(source),
            _ => None,
        }
    }

    pub fn sync_source(&self) -> SyncSource<H> {
        match *self {
            HandleState::PendingCopy(source) => SyncSource::Copy(source),
            HandleState::Dirty => SyncSource::Guest,
            HandleState::Clean | HandleState::Modified => SyncSource::None,
        }
    }
}

/// A tracked byte range of a group covering `slice_count` consecutive slices.
#[derive(Debug)]
pub(crate) struct TextureGroupHandle {
    pub(crate) group: GroupId,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) base_slice: usize,
    pub(crate) slice_count: usize,
    pub(crate) first_layer: u32,
    pub(crate) first_level: u32,

    /// Views whose data intersects this handle.
    pub(crate) overlaps: Vec<TextureId>,
    pub(crate) regions: Vec<RegionHandle>,
    pub(crate) state: HandleState<HandleId>,
    /// Backing memory was unmapped since the regions were created.
    pub(crate) unmapped: bool,

    pub(crate) bind_count: u32,
    flush_balance: i32,
    registered_sync: u64,
    registered_buffer_sync: u64,
    registered_buffer_guest_sync: u64,
    modified_sync: u64,
    sync_action_registered: bool,
    pub(crate) action_registered: bool,
}

impl TextureGroupHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        group: GroupId,
        offset: u64,
        size: u64,
        first_layer: u32,
        first_level: u32,
        base_slice: usize,
        slice_count: usize,
        regions: Vec<RegionHandle>,
        linear: bool,
    ) -> Self {
        Self {
            group,
            offset,
            size,
            base_slice,
            slice_count,
            first_layer,
            first_level,
            overlaps: Vec::new(),
            regions,
            state: HandleState::Clean,
            unmapped: false,
            bind_count: 0,
            flush_balance: if linear {
                FLUSH_BALANCE_THRESHOLD + FLUSH_BALANCE_INCREMENT
            } else {
                0
            },
            registered_sync: 0,
            registered_buffer_sync: u64::MAX,
            registered_buffer_guest_sync: u64::MAX,
            modified_sync: 0,
            sync_action_registered: false,
            action_registered: false,
        }
    }

    pub(crate) fn overlaps_with(&self, offset: u64, size: u64) -> bool {
        self.offset < offset + size && offset < self.offset + self.size
    }

    pub(crate) fn apply(&mut self, event: HandleEvent<HandleId>) {
        self.state = self.state.transition(event);
    }

    fn next_sync_copies(&self) -> bool {
        self.flush_balance - FLUSH_BALANCE_WRITE_COST > FLUSH_BALANCE_THRESHOLD
    }

    fn modify_flush_balance(&mut self, modifier: i32) -> bool {
        self.flush_balance =
            (self.flush_balance + modifier).clamp(FLUSH_BALANCE_MIN, FLUSH_BALANCE_MAX);
        self.flush_balance > FLUSH_BALANCE_THRESHOLD
    }

    /// Consumes watchpoint hits. Returns whether the guest wrote since the last call.
    fn consume_guest_writes(&mut self) -> bool {
        let mut written = false;
        for region in &self.regions {
            if region.is_dirty() {
                region.reprotect();
                written = true;
            }
        }
        written
    }

    /// Whether a watchpoint fired since the last [`Self::consume_guest_writes`].
    pub(crate) fn has_guest_writes(&self) -> bool {
        self.regions.iter().any(RegionHandle::is_dirty)
    }
}

/// Read-only view of a handle for inspection and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleSnapshot {
    pub offset: u64,
    pub size: u64,
    pub base_slice: usize,
    pub slice_count: usize,
    pub first_layer: u32,
    pub first_level: u32,
    pub state: HandleState<HandleId>,
    pub bind_count: u32,
    pub dependencies: usize,
    pub regions: usize,
}

impl TextureCache {
    pub(crate) fn handle_snapshot(&self, id: HandleId) -> Option<HandleSnapshot> {
        let handle = self.handles.get(id)?;
        Some(HandleSnapshot {
            offset: handle.offset,
            size: handle.size,
            base_slice: handle.base_slice,
            slice_count: handle.slice_count,
            first_layer: handle.first_layer,
            first_level: handle.first_level,
            state: handle.state,
            bind_count: handle.bind_count,
            dependencies: self.dependencies.neighbours(id).len(),
            regions: handle.regions.len(),
        })
    }

    pub(crate) fn handle_storage(&self, id: HandleId) -> Option<TextureId> {
        let handle = self.handles.get(id)?;
        self.groups.get(handle.group).map(|group| group.storage)
    }

    /// Storage and overlapping views of a handle.
    fn handle_textures(&self, id: HandleId) -> Vec<TextureId> {
        let Some(handle) = self.handles.get(id) else {
            return Vec::new();
        };
        let mut textures = Vec::with_capacity(handle.overlaps.len() + 1);
        if let Some(group) = self.groups.get(handle.group) {
            textures.push(group.storage);
        }
        textures.extend(handle.overlaps.iter().copied());
        textures
    }

    pub(crate) fn signal_handle_dirty(&mut self, id: HandleId) {
        for texture in self.handle_textures(id) {
            self.signal_group_dirty(texture);
        }
    }

    pub(crate) fn signal_handle_modified_dirty(&mut self, id: HandleId) {
        for texture in self.handle_textures(id) {
            self.signal_modified_dirty(texture);
        }
    }

    /// Folds guest writes seen by the handle's watchpoints into its state.
    pub(crate) fn observe_guest_writes(&mut self, id: HandleId) -> bool {
        let Some(handle) = self.handles.get_mut(id) else {
            return false;
        };
        if !handle.consume_guest_writes() {
            return false;
        }
        handle.apply(HandleEvent::GuestWrite);
        trace!(?id, "guest write observed");
        self.signal_handle_dirty(id);
        true
    }

    pub(crate) fn register_flush_action(&mut self, id: HandleId) {
        if let Some(handle) = self.handles.get_mut(id) {
            if !handle.action_registered {
                handle.action_registered = true;
                for region in &handle.regions {
                    region.register_action();
                }
            }
        }
    }

    pub(crate) fn register_sync(&mut self, id: HandleId) {
        let sync_number = self.ctx.sync_number();
        let Some(handle) = self.handles.get_mut(id) else {
            return;
        };
        if !handle.sync_action_registered {
            handle.modified_sync = sync_number;
            handle.sync_action_registered = true;
            self.ctx.register_sync_action(id);
        }
        self.register_flush_action(id);
    }

    pub(crate) fn handle_signal_modified(&mut self, id: HandleId) {
        self.observe_guest_writes(id);
        let Some(handle) = self.handles.get_mut(id) else {
            return;
        };
        handle.apply(HandleEvent::GpuWrite);
        handle.modify_flush_balance(-FLUSH_BALANCE_WRITE_COST);

        for peer in self.dependencies.neighbours(id) {
            self.handle_defer_copy(peer, id);
        }
        self.register_sync(id);
    }

    pub(crate) fn handle_signal_modifying(&mut self, id: HandleId, bound: bool) {
        self.handle_signal_modified(id);

        let Some(handle) = self.handles.get(id) else {
            return;
        };
        if !bound && handle.sync_action_registered && handle.next_sync_copies() {
            self.create_host_sync(crate::context::HostSyncFlags::FORCE);
        }

        if let Some(handle) = self.handles.get_mut(id) {
            handle.bind_count = if bound {
                handle.bind_count + 1
            } else {
                handle.bind_count.saturating_sub(1)
            };
        }
    }

    pub(crate) fn handle_defer_copy(&mut self, id: HandleId, from: HandleId) {
        self.observe_guest_writes(id);
        let Some(handle) = self.handles.get_mut(id) else {
            return;
        };
        handle.apply(HandleEvent::DeferCopy(from));
        self.stats.inc_deferred_copies();
        self.signal_handle_dirty(id);
    }

    /// Pulls data into handle `id`.
    ///
    /// With `from == None` the pending deferred copy is performed. With an explicit source the
    /// copy only happens if the source has data worth taking: it is not stale against guest
    /// memory, and it is GPU-written or this handle is not.
    pub(crate) fn handle_copy(&mut self, id: HandleId, from: Option<HandleId>) -> bool {
        let Some(handle) = self.handles.get(id) else {
            return false;
        };

        let (source, deferred) = match from {
            None => match handle.state.deferred_copy() {
                Some(source) => (source, true),
                None => return false,
            },
            Some(source) => {
                self.observe_guest_writes(source);
                let Some(src) = self.handles.get(source) else {
                    return false;
                };
                let dst_modified = self
                    .handles
                    .get(id)
                    .is_some_and(|h| h.state.is_modified());
                let should_copy =
                    !src.state.is_dirty() && (src.state.is_modified() || !dst_modified);
                if !should_copy {
                    return false;
                }
                (source, false)
            }
        };

        let Some(src) = self.handles.get(source) else {
            if deferred {
                // The source went away; guest memory is the best remaining copy.
                if let Some(handle) = self.handles.get_mut(id) {
                    handle.state = HandleState::Dirty;
                }
            }
            return false;
        };
        let source_modified = src.state.is_modified();
        let keep_pending = deferred && src.bind_count > 0;
        let (src_layer, src_level) = (src.first_layer, src.first_level);

        let (Some(from_tex), Some(to_tex)) = (self.handle_storage(source), self.handle_storage(id))
        else {
            return false;
        };
        let Some(handle) = self.handles.get(id) else {
            return false;
        };
        let (dst_layer, dst_level) = (handle.first_layer, handle.first_level);

        let scales_differ = match (self.textures.get(from_tex), self.textures.get(to_tex)) {
            (Some(from), Some(to)) => from.scale_factor != to.scale_factor,
            _ => return false,
        };
        if scales_differ {
            self.texture_propagate_scale(to_tex, from_tex);
        }

        let src_host = self.textures.get(from_tex).and_then(|t| t.host);
        let dst_host = self.textures.get(to_tex).and_then(|t| t.host);
        let (Some(src_host), Some(dst_host)) = (src_host, dst_host) else {
            return false;
        };
        if let Err(err) = self.ctx.renderer().copy_texture_slice(
            src_host, dst_host, src_layer, dst_layer, src_level, dst_level,
        ) {
            tracing::warn!(?err, "copy between dependent textures failed");
            return false;
        }
        trace!(?id, ?source, deferred, "dependency copy");

        if let Some(handle) = self.handles.get_mut(id) {
            handle.apply(HandleEvent::CopyCompleted {
                source_modified,
                keep_pending,
            });
        }
        if source_modified {
            self.register_sync(id);
        }
        true
    }

    /// Synchronizes every dependent still waiting to pull from `id`.
    pub(crate) fn handle_synchronize_dependents(&mut self, id: HandleId) {
        for peer in self.dependencies.neighbours(id) {
            let waits_on_us = self
                .handles
                .get(peer)
                .is_some_and(|h| h.state.deferred_copy() == Some(id));
            if waits_on_us {
                if let Some(storage) = self.handle_storage(peer) {
                    self.texture_synchronize_memory(storage);
                }
            }
        }
    }

    pub(crate) fn handle_discard(&mut self, id: HandleId) {
        if let Some(handle) = self.handles.get_mut(id) {
            handle.consume_guest_writes();
            handle.apply(HandleEvent::Discarded);
        }
    }

    pub(crate) fn handle_has_dependency_to(&self, id: HandleId, group: GroupId) -> bool {
        self.dependencies
            .neighbours(id)
            .into_iter()
            .any(|peer| self.handles.get(peer).is_some_and(|h| h.group == group))
    }

    /// Links `id` and `other` as copies of the same data. With `copy_to_other`, a GPU-written
    /// `id` also defers a copy into `other`'s existing dependents.
    pub(crate) fn handle_create_copy_dependency(
        &mut self,
        id: HandleId,
        other: HandleId,
        copy_to_other: bool,
    ) {
        let Some(linked) = self.dependencies.connect(id, other) else {
            return;
        };
        self.stats.inc_copy_dependencies();

        for handle in [id, other] {
            if let Some(group) = self.handles.get(handle).map(|h| h.group) {
                if let Some(group) = self.groups.get_mut(group) {
                    group.has_copy_dependencies = true;
                }
            }
        }

        let modified = self.handles.get(id).is_some_and(|h| h.state.is_modified());
        if copy_to_other && modified {
            for peer in linked {
                self.handle_defer_copy(peer, id);
            }
        }
    }

    /// Takes over the state of `old`, a handle of a group being replaced.
    pub(crate) fn handle_inherit(&mut self, id: HandleId, old: HandleId, with_copies: bool) {
        let Some(old_handle) = self.handles.get(old) else {
            return;
        };
        let old_state = old_handle.state;

        if old_state.is_modified() {
            if let Some(handle) = self.handles.get_mut(id) {
                if handle.state.deferred_copy().is_none() {
                    handle.state = HandleState::Modified;
                }
            }
        }

        if with_copies {
            for peer in self.dependencies.neighbours(old) {
                if peer == id {
                    continue;
                }
                self.handle_create_copy_dependency(id, peer, false);
                if let Some(peer_handle) = self.handles.get_mut(peer) {
                    if peer_handle.state.deferred_copy() == Some(old) {
                        peer_handle.state = HandleState::PendingCopy(id);
                    }
                }
            }
            if let (Some(source), Some(handle)) =
                (old_state.deferred_copy(), self.handles.get_mut(id))
            {
                handle.state = HandleState::PendingCopy(source);
            }
        }
    }

    /// Stages the handle's slices in the group's flush buffer when it is flushed often enough.
    pub(crate) fn handle_sync_pre_action(&mut self, id: HandleId, syncpoint: bool) {
        if !self.ctx.config().flush_buffers {
            return;
        }
        let Some(handle) = self.handles.get_mut(id) else {
            return;
        };
        if (syncpoint || handle.next_sync_copies())
            && handle.modify_flush_balance(0)
            && handle.registered_buffer_sync != handle.modified_sync
        {
            let modified_sync = handle.modified_sync;
            self.group_flush_into_buffer(id);
            if let Some(handle) = self.handles.get_mut(id) {
                handle.registered_buffer_sync = modified_sync;
            }
        }
    }

    /// Runs once the fence covering the handle's last modification was created.
    ///
    /// Returns `true` when the action is done and can be dropped.
    pub(crate) fn handle_sync_action(&mut self, id: HandleId, syncpoint: bool) -> bool {
        let Some(storage) = self.handle_storage(id) else {
            return true;
        };
        self.signal_modified_dirty(storage);

        let Some(handle) = self.handles.get_mut(id) else {
            return true;
        };
        let last_in_buffer = handle.registered_buffer_sync == handle.modified_sync;
        if !last_in_buffer {
            handle.registered_buffer_sync = u64::MAX;
        }
        handle.registered_sync = handle.modified_sync;
        handle.sync_action_registered = false;
        if syncpoint {
            handle.registered_buffer_guest_sync = handle.registered_buffer_sync;
        }

        self.signal_handle_modified_dirty(id);
        self.register_flush_action(id);

        syncpoint || !last_in_buffer
    }

    /// Waits for the fence covering the handle's modification before a guest access.
    ///
    /// Returns whether the data can be read from the flush buffer.
    pub(crate) fn handle_sync(&mut self, id: HandleId) -> bool {
        let sync_number = self.ctx.sync_number();
        let Some(handle) = self.handles.get_mut(id) else {
            return false;
        };
        let in_buffer = handle.registered_buffer_guest_sync != u64::MAX;
        let sync = if in_buffer {
            handle.registered_buffer_guest_sync
        } else {
            handle.registered_sync
        };
        handle.modify_flush_balance(FLUSH_BALANCE_INCREMENT);

        if (sync_number.wrapping_sub(sync) as i64) <= 0 {
            return false;
        }

        let modified_since = (handle.modified_sync.wrapping_sub(sync) as i64) > 0;
        if !modified_since {
            handle.apply(HandleEvent::Flushed);
        }
        self.ctx.renderer().wait_sync(sync);
        in_buffer
    }

    /// Drops a handle: its watchpoints stop, its edges go, and dependents waiting on it fall
    /// back to guest memory.
    pub(crate) fn dispose_handle(&mut self, id: HandleId) {
        if self.handles.remove(id).is_none() {
            return;
        }
        self.ctx.forget_sync_action(id);
        for peer in self.dependencies.remove_handle(id) {
            if let Some(handle) = self.handles.get_mut(peer) {
                if handle.state.deferred_copy() == Some(id) {
                    handle.state = HandleState::Dirty;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    type State = HandleState<u32>;
    type Event = HandleEvent<u32>;

    #[test]
    fn latest_writer_wins() {
        let s = State::Clean
            .transition(Event::GpuWrite)
            .transition(Event::GuestWrite);
        assert_eq!(s, State::Dirty);

        let s = State::Clean
            .transition(Event::GuestWrite)
            .transition(Event::GpuWrite);
        assert_eq!(s, State::Modified);

        let s = State::Dirty.transition(Event::DeferCopy(3));
        assert_eq!(s, State::PendingCopy(3));
        assert_eq!(s.sync_source(), SyncSource::Copy(3));

        let s = s.transition(Event::GuestWrite);
        assert_eq!(s.sync_source(), SyncSource::Guest);
    }

    #[test]
    fn reload_and_flush_only_clear_their_own_state() {
        assert_eq!(State::Dirty.transition(Event::Reloaded), State::Clean);
        assert_eq!(State::Modified.transition(Event::Reloaded), State::Modified);
        assert_eq!(State::Modified.transition(Event::Flushed), State::Clean);
        assert_eq!(State::Dirty.transition(Event::Flushed), State::Dirty);
        assert_eq!(
            State::PendingCopy(1).transition(Event::Reloaded),
            State::PendingCopy(1)
        );
    }

    #[test]
    fn completed_copies_follow_the_source() {
        let pending = State::PendingCopy(7);
        let done = |source_modified, keep_pending| Event::CopyCompleted {
            source_modified,
            keep_pending,
        };

        assert_eq!(pending.transition(done(false, false)), State::Clean);
        assert_eq!(pending.transition(done(true, false)), State::Modified);
        assert_eq!(pending.transition(done(true, true)), pending);
        assert_eq!(State::Clean.transition(done(true, false)), State::Modified);
        assert_eq!(State::Dirty.transition(done(false, false)), State::Dirty);
    }

    #[test]
    fn discard_and_clear_modified() {
        assert_eq!(State::Dirty.transition(Event::Discarded), State::Clean);
        assert_eq!(State::PendingCopy(2).transition(Event::Discarded), State::Clean);
        assert_eq!(State::Modified.transition(Event::Discarded), State::Modified);

        assert_eq!(State::Modified.transition(Event::ClearModified), State::Clean);
        assert_eq!(
            State::PendingCopy(2).transition(Event::ClearModified),
            State::Clean
        );
        assert_eq!(State::Dirty.transition(Event::ClearModified), State::Dirty);
    }

    #[test]
    fn sync_sources() {
        assert_eq!(State::Clean.sync_source(), SyncSource::None);
        assert_eq!(State::Modified.sync_source(), SyncSource::None);
        assert_eq!(State::Dirty.sync_source(), SyncSource::Guest);
        assert!(State::Modified.is_modified());
        assert_eq!(State::PendingCopy(4).deferred_copy(), Some(4));
    }
}
