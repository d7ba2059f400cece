//! Guest descriptor tables materialized into cache resources.
//!
//! A pool is a guest physical array of 32 byte descriptors. Slots resolve lazily on first use
//! and keep a copy of the descriptor they were built from; a granular watchpoint over the table
//! tells the pool which slots to recheck once per batch of GPU work.

mod cache;
mod descriptor;
mod sampler_pool;
mod texture_pool;

pub use cache::{CachedPool, PoolCache};
pub use descriptor::{
    AddressMode, CompareOp, DescriptorTarget, Filter, MipFilter, SamplerCreateInfo,
    SamplerDescriptor, TextureDescriptor, TextureDescriptorType, TextureMsaaMode, DESCRIPTOR_SIZE,
};
pub use sampler_pool::{Sampler, SamplerPool};
pub use texture_pool::TexturePool;

use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard};

use bytemuck::Pod;
use tracing::warn;

use crate::memory::{GranularTracking, PhysicalMemory, PAGE_SIZE};
use crate::TextureId;

/// A slot reference handed back to a texture pool by the cache.
///
/// `Remove` and `Remap` carry one reference to `texture` that the pool must drop (or keep, for
/// a successful remap). `Released` carries none; the reference was already dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PoolRequest {
    Remove { slot: u32, texture: TextureId },
    Released { slot: u32, texture: TextureId },
    Remap { slot: u32, texture: TextureId },
}

/// Requests posted by the cache for a texture pool, applied on the pool's next use.
#[derive(Debug, Default)]
pub(crate) struct PoolRequestQueue {
    requests: Mutex<VecDeque<PoolRequest>>,
}

impl PoolRequestQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<PoolRequest>> {
        match self.requests.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn push(&self, request: PoolRequest) {
        self.lock().push_back(request);
    }

    pub(crate) fn pop(&self) -> Option<PoolRequest> {
        self.lock().pop_front()
    }
}

/// Descriptor table state shared by texture and sampler pools.
pub(crate) struct ResourcePool<D, T> {
    physical: PhysicalMemory,
    address: u64,
    size: u64,
    maximum_id: u32,

    pub(crate) items: Vec<Option<T>>,
    pub(crate) descriptor_cache: Vec<D>,

    tracking: GranularTracking,
    precise_writes_seen: u64,

    sequence_number: u64,
    modified_sequence: u64,
}

impl<D, T> fmt::Debug for ResourcePool<D, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("address", &self.address)
            .field("maximum_id", &self.maximum_id)
            .field("sequence_number", &self.sequence_number)
            .field("modified_sequence", &self.modified_sequence)
            .finish_non_exhaustive()
    }
}

impl<D: Pod + Default + PartialEq, T> ResourcePool<D, T> {
    /// A pool of `maximum_id + 1` descriptors at guest physical `address`.
    pub(crate) fn new(physical: PhysicalMemory, address: u64, maximum_id: u32) -> Self {
        let count = maximum_id as usize + 1;
        let size = count as u64 * DESCRIPTOR_SIZE;
        let tracking = physical.begin_granular_tracking(address, size, PAGE_SIZE);
        let precise_writes_seen = tracking.precise_writes();
        Self {
            physical,
            address,
            size,
            maximum_id,
            items: (0..count).map(|_| None).collect(),
            descriptor_cache: vec![D::default(); count],
            tracking,
            precise_writes_seen,
            sequence_number: 0,
            modified_sequence: 0,
        }
    }

    pub(crate) fn address(&self) -> u64 {
        self.address
    }

    pub(crate) fn maximum_id(&self) -> u32 {
        self.maximum_id
    }

    pub(crate) fn modified_sequence(&self) -> u64 {
        self.modified_sequence
    }

    pub(crate) fn bump_modified_sequence(&mut self) {
        self.modified_sequence += 1;
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        (id as usize) < self.items.len()
    }

    /// The descriptor currently in guest memory. Unreadable descriptors read as default.
    pub(crate) fn read_descriptor(&self, id: u32) -> D {
        self.read_descriptor_at(self.address + id as u64 * DESCRIPTOR_SIZE)
    }

    fn read_descriptor_at(&self, address: u64) -> D {
        let mut bytes = [0u8; DESCRIPTOR_SIZE as usize];
        match self.physical.read(address, &mut bytes) {
            Ok(()) => bytemuck::pod_read_unaligned(&bytes),
            Err(err) => {
                warn!(address, %err, "descriptor read failed");
                D::default()
            }
        }
    }

    /// Whether slot `id`'s descriptor differs from the one its item was built from.
    pub(crate) fn descriptor_changed(&self, id: u32) -> bool {
        match self.descriptor_cache.get(id as usize) {
            Some(cached) => self.read_descriptor(id) != *cached,
            None => true,
        }
    }

    /// Whether the pool must look for modified descriptors before trusting its slots.
    ///
    /// Called on every access with the context's sequence number. Within one sequence the pool
    /// is checked once, unless a precise write hit the table since; that also counts as a
    /// modification for consumers that only compare [`Self::modified_sequence`].
    pub(crate) fn needs_sync(&mut self, sequence: u64) -> bool {
        let precise = self.tracking.precise_writes();
        if precise != self.precise_writes_seen {
            self.precise_writes_seen = precise;
            if self.sequence_number == sequence {
                self.modified_sequence += 1;
                return true;
            }
        }
        if self.sequence_number != sequence {
            self.sequence_number = sequence;
            return true;
        }
        false
    }

    /// Slot ranges covered by guest writes since the last query.
    pub(crate) fn modified_slots(&mut self) -> Vec<Range<u32>> {
        let mut slots = Vec::new();
        let base = self.address;
        let end = self.address + self.size;
        self.tracking.query_modified(|address, size| {
            let start = address.max(base);
            let stop = (address + size).min(end);
            if start < stop {
                let first = ((start - base) / DESCRIPTOR_SIZE) as u32;
                let last = (stop - base).div_ceil(DESCRIPTOR_SIZE) as u32;
                slots.push(first..last);
            }
        });
        if !slots.is_empty() {
            self.modified_sequence += 1;
        }
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::VecGuestMemory;
    use pretty_assertions::assert_eq;

    fn pool() -> (PhysicalMemory, ResourcePool<TextureDescriptor, u32>) {
        let physical = PhysicalMemory::new(VecGuestMemory::new(0x10000));
        let pool = ResourcePool::new(physical.clone(), 0x2000, 255);
        (physical, pool)
    }

    #[test]
    fn writes_report_the_slots_they_touch() {
        let (physical, mut pool) = pool();
        assert!(pool.needs_sync(1));
        assert!(pool.modified_slots().is_empty());
        assert_eq!(pool.modified_sequence(), 0);

        let desc = TextureDescriptor::default().with_address(0x1_0000);
        physical.write(0x2000 + 3 * DESCRIPTOR_SIZE, desc.as_bytes()).unwrap();

        assert!(!pool.needs_sync(1));
        assert!(pool.needs_sync(2));
        // Granules are a page, so the whole first page of slots is reported.
        assert_eq!(pool.modified_slots(), vec![0..128]);
        assert_eq!(pool.modified_sequence(), 1);
        assert_eq!(pool.read_descriptor(3), desc);
    }

    #[test]
    fn precise_writes_force_a_recheck_within_a_sequence() {
        let (physical, mut pool) = pool();
        assert!(pool.needs_sync(5));
        assert!(!pool.needs_sync(5));

        physical
            .write_precise(0x2000 + 200 * DESCRIPTOR_SIZE, &[1; 4])
            .unwrap();
        assert!(pool.needs_sync(5));
        assert_eq!(pool.modified_sequence(), 1);
        assert_eq!(pool.modified_slots(), vec![128..256]);
        assert!(!pool.needs_sync(5));
    }

    #[test]
    fn request_queue_is_fifo() {
        let mut keys: slotmap::SlotMap<TextureId, ()> = slotmap::SlotMap::with_key();
        let texture = keys.insert(());
        let queue = PoolRequestQueue::default();
        queue.push(PoolRequest::Remap { slot: 1, texture });
        queue.push(PoolRequest::Remove { slot: 2, texture });
        assert_eq!(queue.pop(), Some(PoolRequest::Remap { slot: 1, texture }));
        assert_eq!(queue.pop(), Some(PoolRequest::Remove { slot: 2, texture }));
        assert_eq!(queue.pop(), None);
    }
}
