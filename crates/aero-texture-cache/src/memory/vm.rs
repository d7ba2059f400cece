//! GPU virtual address space.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hashbrown::HashMap;
use tracing::debug;

use super::{MemoryRange, MultiRange, PTE_UNMAPPED};

pub const PAGE_SIZE: u64 = 0x1000;
const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// A GPU virtual range is about to change its mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnmapEvent {
    pub address: u64,
    pub size: u64,
    /// Physical backing of the range before the change.
    pub regions: MultiRange,
}

/// Work to run once the mapping change has been applied.
pub type RemapAction = Box<dyn FnOnce() + Send>;

/// Receives notifications before a GPU virtual range is unmapped or remapped.
///
/// Called on the thread that changes the mapping, which need not be the GPU thread.
pub trait UnmapListener: Send + Sync {
    fn memory_unmapped(&self, event: &UnmapEvent) -> Option<RemapAction>;
}

/// GPU virtual to guest physical translation, consumed as a service.
pub trait GpuVirtualMemory: Send + Sync {
    /// Physical address of `va`, if it is mapped.
    fn translate(&self, va: u64) -> Option<u64>;

    /// Physical address of the first mapped byte in `[va, va + size)`.
    fn translate_first_mapped(&self, va: u64, size: u64) -> Option<u64>;

    /// Physical regions backing `[va, va + size)`, with [`PTE_UNMAPPED`] holes.
    fn physical_regions(&self, va: u64, size: u64) -> MultiRange;

    /// Whether `range` is still the backing of the virtual range starting at `va`.
    fn compare_range(&self, range: &MultiRange, va: u64) -> bool {
        self.physical_regions(va, range.total_size()) == *range
    }

    fn add_unmap_listener(&self, listener: Arc<dyn UnmapListener>);
}

/// Page-granular GPU page table.
#[derive(Default)]
pub struct PageTable {
    pages: RwLock<HashMap<u64, u64>>,
    listeners: RwLock<Vec<Arc<dyn UnmapListener>>>,
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable")
            .field("mapped_pages", &self.read_pages().len())
            .finish_non_exhaustive()
    }
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_pages(&self) -> RwLockReadGuard<'_, HashMap<u64, u64>> {
        match self.pages.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_pages(&self) -> RwLockWriteGuard<'_, HashMap<u64, u64>> {
        match self.pages.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn UnmapListener>> {
        match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Maps `[va, va + size)` to `[pa, pa + size)`. Page aligned.
    pub fn map(&self, va: u64, pa: u64, size: u64) {
        debug!(va, pa, size, "gpu map");
        self.change_mapping(va, size, |pages, page| {
            pages.insert(page, pa + (page - (va & !PAGE_MASK)));
        });
    }

    pub fn unmap(&self, va: u64, size: u64) {
        debug!(va, size, "gpu unmap");
        self.change_mapping(va, size, |pages, page| {
            pages.remove(&page);
        });
    }

    fn change_mapping(&self, va: u64, size: u64, mut apply: impl FnMut(&mut HashMap<u64, u64>, u64)) {
        let event = UnmapEvent {
            address: va,
            size,
            regions: self.physical_regions(va, size),
        };
        let actions: Vec<RemapAction> = self
            .listeners()
            .iter()
            .filter_map(|listener| listener.memory_unmapped(&event))
            .collect();

        {
            let mut pages = self.write_pages();
            let start = va & !PAGE_MASK;
            let end = (va + size + PAGE_MASK) & !PAGE_MASK;
            for page in (start..end).step_by(PAGE_SIZE as usize) {
                apply(&mut pages, page);
            }
        }

        for action in actions {
            action();
        }
    }
}

impl GpuVirtualMemory for PageTable {
    fn translate(&self, va: u64) -> Option<u64> {
        self.read_pages()
            .get(&(va & !PAGE_MASK))
            .map(|pa| pa + (va & PAGE_MASK))
    }

    fn translate_first_mapped(&self, va: u64, size: u64) -> Option<u64> {
        let pages = self.read_pages();
        let end = va.saturating_add(size);
        let mut page = va & !PAGE_MASK;
        while page < end {
            if let Some(pa) = pages.get(&page) {
                let offset = va.max(page) - page;
                return Some(pa + offset);
            }
            page += PAGE_SIZE;
        }
        None
    }

    fn physical_regions(&self, va: u64, size: u64) -> MultiRange {
        let pages = self.read_pages();
        let end = va.saturating_add(size);
        let mut regions = Vec::new();
        let mut cursor = va;
        while cursor < end {
            let page = cursor & !PAGE_MASK;
            let chunk = (page + PAGE_SIZE).min(end) - cursor;
            let address = pages
                .get(&page)
                .map_or(PTE_UNMAPPED, |pa| pa + (cursor - page));
            regions.push(MemoryRange::new(address, chunk));
            cursor += chunk;
        }
        MultiRange::from_ranges(regions)
    }

    fn add_unmap_listener(&self, listener: Arc<dyn UnmapListener>) {
        match self.listeners.write() {
            Ok(mut guard) => guard.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[test]
    fn regions_merge_contiguous_pages_and_report_holes() {
        let vm = PageTable::new();
        vm.map(0x10000, 0x4000, 0x2000);
        vm.map(0x13000, 0x8000, 0x1000);

        let regions = vm.physical_regions(0x10800, 0x3000);
        assert_eq!(
            regions.ranges(),
            &[
                MemoryRange::new(0x4800, 0x1800),
                MemoryRange::unmapped(0x1000),
                MemoryRange::new(0x8000, 0x800),
            ]
        );
        assert_eq!(vm.translate(0x12000), None);
        assert_eq!(vm.translate_first_mapped(0x12000, 0x2000), Some(0x8000));
        assert!(vm.compare_range(&regions, 0x10800));
    }

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl UnmapListener for Recorder {
        fn memory_unmapped(&self, event: &UnmapEvent) -> Option<RemapAction> {
            let log = self.0.clone();
            log.lock().unwrap().push(format!("unmap {:x}", event.address));
            Some(Box::new(move || log.lock().unwrap().push("remapped".into())))
        }
    }

    #[test]
    fn listeners_see_old_regions_and_actions_run_after() {
        let vm = PageTable::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        vm.add_unmap_listener(Arc::new(Recorder(log.clone())));

        vm.map(0x1000, 0x1000, 0x1000);
        vm.unmap(0x1000, 0x1000);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["unmap 1000", "remapped", "unmap 1000", "remapped"]
        );
        assert_eq!(vm.translate(0x1000), None);
    }
}
