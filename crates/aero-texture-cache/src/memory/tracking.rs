//! Write tracking over guest physical memory.
//!
//! A [`RegionHandle`] watches one contiguous physical range. Writes through
//! [`super::PhysicalMemory`] mark the handles they touch and stamp them with the global write
//! sequence, so a consumer can tell "written since I last looked" by comparing sequence numbers
//! instead of receiving callbacks.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use hashbrown::HashMap;

use super::{MemoryRange, MultiRange};
use crate::range_index::RangeIndex;

/// Identifies who performed a tracked write, so a writer can skip its own watchpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TrackingOwner(pub u64);

#[derive(Default)]
pub(crate) struct Registry {
    index: RangeIndex<u64>,
    regions: HashMap<u64, Weak<RegionState>>,
    next_id: u64,
}

impl Registry {
    pub(crate) fn register(&mut self, state: &Arc<RegionState>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.index.insert(
            id,
            &MultiRange::single(state.range.address, state.range.size),
        );
        self.regions.insert(id, Arc::downgrade(state));
        id
    }

    fn unregister(&mut self, id: u64) {
        self.index.remove(&id);
        self.regions.remove(&id);
    }

    /// Live regions overlapping `[address, address + size)`.
    pub(crate) fn overlapping(&self, address: u64, size: u64) -> Vec<Arc<RegionState>> {
        self.index
            .find_overlaps_at(address, size)
            .into_iter()
            .filter_map(|id| self.regions.get(&id).and_then(Weak::upgrade))
            .collect()
    }
}

pub(crate) fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) struct RegionState {
    range: MemoryRange,
    owner: Option<TrackingOwner>,
    granularity: u64,
    dirty: Vec<AtomicBool>,
    last_write: AtomicU64,
    precise_writes: AtomicU64,
    action: AtomicBool,
}

impl RegionState {
    pub(crate) fn new(range: MemoryRange, owner: Option<TrackingOwner>, granularity: u64) -> Self {
        let granularity = granularity.clamp(1, range.size.max(1));
        let granules = range.size.div_ceil(granularity).max(1) as usize;
        Self {
            range,
            owner,
            granularity,
            dirty: (0..granules).map(|_| AtomicBool::new(false)).collect(),
            last_write: AtomicU64::new(0),
            precise_writes: AtomicU64::new(0),
            action: AtomicBool::new(false),
        }
    }

    pub(crate) fn owner(&self) -> Option<TrackingOwner> {
        self.owner
    }

    pub(crate) fn has_action(&self) -> bool {
        self.action.load(Ordering::Acquire)
    }

    pub(crate) fn signal(&self, address: u64, size: u64, sequence: u64, precise: bool) {
        let start = address.max(self.range.address);
        let end = address
            .saturating_add(size)
            .min(self.range.end_address());
        if start >= end {
            return;
        }

        let first = ((start - self.range.address) / self.granularity) as usize;
        let last = ((end - 1 - self.range.address) / self.granularity) as usize;
        for granule in &self.dirty[first..=last.min(self.dirty.len() - 1)] {
            granule.store(true, Ordering::Release);
        }

        self.last_write.fetch_max(sequence, Ordering::AcqRel);
        if precise {
            self.precise_writes.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// A watchpoint on one contiguous physical range. Dropping it stops tracking.
pub struct RegionHandle {
    id: u64,
    state: Arc<RegionState>,
    registry: Weak<Mutex<Registry>>,
}

impl RegionHandle {
    pub(crate) fn new(state: Arc<RegionState>, registry: &Arc<Mutex<Registry>>) -> Self {
        let id = lock_registry(registry).register(&state);
        Self {
            id,
            state,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn range(&self) -> MemoryRange {
        self.state.range
    }

    pub fn address(&self) -> u64 {
        self.state.range.address
    }

    pub fn size(&self) -> u64 {
        self.state.range.size
    }

    pub fn owner(&self) -> Option<TrackingOwner> {
        self.state.owner
    }

    /// Whether any byte of the region was written since the last [`RegionHandle::reprotect`].
    pub fn is_dirty(&self) -> bool {
        self.state
            .dirty
            .iter()
            .any(|granule| granule.load(Ordering::Acquire))
    }

    /// Write sequence number of the most recent write into this region.
    pub fn last_write(&self) -> u64 {
        self.state.last_write.load(Ordering::Acquire)
    }

    /// Re-arms the watchpoint, clearing the dirty state.
    pub fn reprotect(&self) {
        for granule in &self.state.dirty {
            granule.store(false, Ordering::Release);
        }
    }

    /// Marks the region as needing a flush before the guest may access it.
    ///
    /// Returns `true` if no action was registered yet.
    pub fn register_action(&self) -> bool {
        !self.state.action.swap(true, Ordering::AcqRel)
    }

    pub fn clear_action(&self) {
        self.state.action.store(false, Ordering::Release);
    }

    pub fn has_action(&self) -> bool {
        self.state.has_action()
    }
}

impl Drop for RegionHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock_registry(&registry).unregister(self.id);
        }
    }
}

impl fmt::Debug for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionHandle")
            .field("range", &self.state.range)
            .field("dirty", &self.is_dirty())
            .field("last_write", &self.last_write())
            .finish()
    }
}

/// Tracking for a large range that reports modifications at a fixed granularity.
///
/// Descriptor pools use this to find which descriptors changed without rescanning the table.
#[derive(Debug)]
pub struct GranularTracking {
    handle: RegionHandle,
}

impl GranularTracking {
    pub(crate) fn new(handle: RegionHandle) -> Self {
        Self { handle }
    }

    pub fn range(&self) -> MemoryRange {
        self.handle.range()
    }

    /// Calls `f(address, size)` for each run of modified granules and re-arms them.
    pub fn query_modified(&self, mut f: impl FnMut(u64, u64)) {
        let state = &self.handle.state;
        let mut run: Option<(usize, usize)> = None;

        for (index, granule) in state.dirty.iter().enumerate() {
            if granule.swap(false, Ordering::AcqRel) {
                run = match run {
                    Some((start, end)) if end == index => Some((start, index + 1)),
                    Some((start, end)) => {
                        Self::emit(state, start, end, &mut f);
                        Some((index, index + 1))
                    }
                    None => Some((index, index + 1)),
                };
            }
        }

        if let Some((start, end)) = run {
            Self::emit(state, start, end, &mut f);
        }
    }

    fn emit(state: &RegionState, start: usize, end: usize, f: &mut impl FnMut(u64, u64)) {
        let address = state.range.address + start as u64 * state.granularity;
        let end_address =
            (state.range.address + end as u64 * state.granularity).min(state.range.end_address());
        f(address, end_address - address);
    }

    /// Number of precise writes observed so far.
    pub fn precise_writes(&self) -> u64 {
        self.handle.state.precise_writes.load(Ordering::Acquire)
    }

    pub fn last_write(&self) -> u64 {
        self.handle.last_write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> Arc<Mutex<Registry>> {
        Arc::new(Mutex::new(Registry::default()))
    }

    #[test]
    fn dropping_a_handle_unregisters_it() {
        let registry = registry();
        let handle = RegionHandle::new(
            Arc::new(RegionState::new(MemoryRange::new(0x1000, 0x100), None, 0x100)),
            &registry,
        );
        assert_eq!(lock_registry(&registry).overlapping(0x1080, 4).len(), 1);

        drop(handle);
        assert!(lock_registry(&registry).overlapping(0x1080, 4).is_empty());
    }

    #[test]
    fn granular_query_coalesces_adjacent_granules() {
        let registry = registry();
        let state = Arc::new(RegionState::new(MemoryRange::new(0, 0x100), None, 0x20));
        let tracking = GranularTracking::new(RegionHandle::new(state.clone(), &registry));

        state.signal(0x20, 0x30, 1, false);
        state.signal(0xe0, 0x10, 2, true);

        let mut runs = Vec::new();
        tracking.query_modified(|address, size| runs.push((address, size)));
        assert_eq!(runs, vec![(0x20, 0x40), (0xe0, 0x20)]);
        assert_eq!(tracking.precise_writes(), 1);
        assert_eq!(tracking.last_write(), 2);

        runs.clear();
        tracking.query_modified(|address, size| runs.push((address, size)));
        assert!(runs.is_empty());
    }

    #[test]
    fn actions_register_once_until_cleared() {
        let registry = registry();
        let handle = RegionHandle::new(
            Arc::new(RegionState::new(MemoryRange::new(0, 0x40), None, 0x40)),
            &registry,
        );
        assert!(handle.register_action());
        assert!(!handle.register_action());
        assert!(handle.has_action());
        handle.clear_action();
        assert!(!handle.has_action());
    }
}
