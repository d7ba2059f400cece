use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::tracking::{lock_registry, RegionState, Registry};
use super::{GranularTracking, GuestMemory, MultiRange, RegionHandle, TrackingOwner};
use crate::error::GuestMemoryError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteKind {
    Guest,
    Precise,
    Except(TrackingOwner),
}

struct Inner {
    memory: Box<dyn GuestMemory + Send + Sync>,
    registry: Arc<Mutex<Registry>>,
    write_sequence: AtomicU64,
}

/// Guest physical memory with write tracking.
///
/// Cloning is cheap and every clone observes the same memory and watchpoints.
#[derive(Clone)]
pub struct PhysicalMemory {
    inner: Arc<Inner>,
}

impl fmt::Debug for PhysicalMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalMemory")
            .field("write_sequence", &self.write_sequence())
            .finish_non_exhaustive()
    }
}

impl PhysicalMemory {
    pub fn new(memory: impl GuestMemory + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                memory: Box::new(memory),
                registry: Arc::new(Mutex::new(Registry::default())),
                write_sequence: AtomicU64::new(1),
            }),
        }
    }

    /// Sequence number of the most recent tracked write.
    pub fn write_sequence(&self) -> u64 {
        self.inner.write_sequence.load(Ordering::Acquire)
    }

    pub fn read(&self, address: u64, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
        self.inner.memory.read(address, dst)
    }

    /// Reads every sub-range of `range` back to back. Unmapped sub-ranges read as zero.
    pub fn read_range(&self, range: &MultiRange) -> Result<Vec<u8>, GuestMemoryError> {
        let mut out = vec![0u8; range.total_size() as usize];
        let mut offset = 0usize;
        for sub in range.ranges() {
            let len = sub.size as usize;
            if !sub.is_unmapped() {
                self.read(sub.address, &mut out[offset..offset + len])?;
            }
            offset += len;
        }
        Ok(out)
    }

    /// A guest CPU write: every watchpoint covering the bytes is marked dirty.
    pub fn write(&self, address: u64, data: &[u8]) -> Result<(), GuestMemoryError> {
        self.inner.memory.write(address, data)?;
        self.signal(address, data.len() as u64, WriteKind::Guest);
        Ok(())
    }

    /// A write that must be observed even by consumers that already synchronized in the current
    /// sequence (GPU inline writes into descriptor tables).
    pub fn write_precise(&self, address: u64, data: &[u8]) -> Result<(), GuestMemoryError> {
        self.inner.memory.write(address, data)?;
        self.signal(address, data.len() as u64, WriteKind::Precise);
        Ok(())
    }

    /// Writes without notifying any watchpoint.
    pub fn write_untracked(&self, address: u64, data: &[u8]) -> Result<(), GuestMemoryError> {
        self.inner.memory.write(address, data)
    }

    /// Notifies every watchpoint except the ones registered by `owner`.
    pub fn write_tracked_except(
        &self,
        address: u64,
        data: &[u8],
        owner: TrackingOwner,
    ) -> Result<(), GuestMemoryError> {
        self.inner.memory.write(address, data)?;
        self.signal(address, data.len() as u64, WriteKind::Except(owner));
        Ok(())
    }

    /// Scatters `data` over the mapped sub-ranges of `range`; bytes for unmapped sub-ranges are
    /// dropped.
    pub(crate) fn write_range(
        &self,
        range: &MultiRange,
        data: &[u8],
        tracked_by: Option<TrackingOwner>,
    ) -> Result<(), GuestMemoryError> {
        let mut offset = 0usize;
        for sub in range.ranges() {
            let len = sub.size as usize;
            if offset >= data.len() {
                break;
            }
            let end = (offset + len).min(data.len());
            if !sub.is_unmapped() {
                let chunk = &data[offset..end];
                match tracked_by {
                    Some(owner) => self.write_tracked_except(sub.address, chunk, owner)?,
                    None => self.write_untracked(sub.address, chunk)?,
                }
            }
            offset += len;
        }
        Ok(())
    }

    fn signal(&self, address: u64, size: u64, kind: WriteKind) {
        let sequence = self.inner.write_sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let regions = lock_registry(&self.inner.registry).overlapping(address, size);
        for region in regions {
            if let WriteKind::Except(owner) = kind {
                if region.owner() == Some(owner) {
                    continue;
                }
            }
            region.signal(address, size, sequence, kind == WriteKind::Precise);
        }
    }

    /// Whether a watchpoint in the range has a flush registered that must run before the guest
    /// accesses the bytes.
    pub fn has_pending_actions(&self, address: u64, size: u64) -> bool {
        lock_registry(&self.inner.registry)
            .overlapping(address, size)
            .iter()
            .any(|region| region.has_action())
    }

    /// Starts tracking every mapped sub-range of `range`.
    pub fn begin_tracking(
        &self,
        range: &MultiRange,
        owner: Option<TrackingOwner>,
    ) -> Vec<RegionHandle> {
        range
            .mapped()
            .map(|sub| {
                RegionHandle::new(
                    Arc::new(RegionState::new(*sub, owner, sub.size)),
                    &self.inner.registry,
                )
            })
            .collect()
    }

    pub fn begin_granular_tracking(
        &self,
        address: u64,
        size: u64,
        granularity: u64,
    ) -> GranularTracking {
        let state = RegionState::new(super::MemoryRange::new(address, size), None, granularity);
        GranularTracking::new(RegionHandle::new(Arc::new(state), &self.inner.registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRange, VecGuestMemory};
    use pretty_assertions::assert_eq;

    #[test]
    fn guest_writes_mark_overlapping_regions() {
        let memory = PhysicalMemory::new(VecGuestMemory::new(0x4000));
        let handles = memory.begin_tracking(
            &MultiRange::from_ranges([
                MemoryRange::new(0x1000, 0x100),
                MemoryRange::unmapped(0x100),
                MemoryRange::new(0x3000, 0x100),
            ]),
            None,
        );
        assert_eq!(handles.len(), 2);

        memory.write(0x3010, &[1, 2, 3]).unwrap();
        assert!(!handles[0].is_dirty());
        assert!(handles[1].is_dirty());
        assert_eq!(handles[1].last_write(), memory.write_sequence());

        handles[1].reprotect();
        assert!(!handles[1].is_dirty());
    }

    #[test]
    fn tracked_writes_skip_their_owner() {
        let memory = PhysicalMemory::new(VecGuestMemory::new(0x2000));
        let own = memory.begin_tracking(&MultiRange::single(0, 0x100), Some(TrackingOwner(7)));
        let other = memory.begin_tracking(&MultiRange::single(0x80, 0x100), Some(TrackingOwner(8)));

        memory.write_tracked_except(0x80, &[0xff; 16], TrackingOwner(7)).unwrap();
        assert!(!own[0].is_dirty());
        assert!(other[0].is_dirty());

        memory.write_untracked(0x80, &[0; 16]).unwrap();
        let mut bytes = [0xaa; 16];
        memory.read(0x80, &mut bytes).unwrap();
        assert_eq!(bytes, [0; 16]);
    }

    #[test]
    fn unmapped_sub_ranges_read_as_zero() {
        let memory = PhysicalMemory::new(VecGuestMemory::new(0x2000));
        memory.write(0x100, &[9; 4]).unwrap();
        let range = MultiRange::from_ranges([
            MemoryRange::new(0x100, 4),
            MemoryRange::unmapped(4),
        ]);
        assert_eq!(memory.read_range(&range).unwrap(), vec![9, 9, 9, 9, 0, 0, 0, 0]);
    }
}
