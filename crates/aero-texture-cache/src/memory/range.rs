/// Physical address used for pages of a range that have no backing memory.
pub const PTE_UNMAPPED: u64 = u64::MAX;

/// A contiguous range of guest physical memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryRange {
    pub address: u64,
    pub size: u64,
}

impl MemoryRange {
    pub const fn new(address: u64, size: u64) -> Self {
        Self { address, size }
    }

    pub const fn unmapped(size: u64) -> Self {
        Self {
            address: PTE_UNMAPPED,
            size,
        }
    }

    pub fn is_unmapped(&self) -> bool {
        self.address == PTE_UNMAPPED
    }

    pub fn end_address(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    pub fn overlaps(&self, other: &MemoryRange) -> bool {
        !self.is_unmapped()
            && !other.is_unmapped()
            && self.address < other.end_address()
            && other.address < self.end_address()
    }

    pub fn contains(&self, other: &MemoryRange) -> bool {
        !self.is_unmapped()
            && !other.is_unmapped()
            && self.address <= other.address
            && other.end_address() <= self.end_address()
    }
}

/// A possibly discontiguous range of guest physical memory, in guest virtual order.
///
/// Pages without backing memory show up as sub-ranges at [`PTE_UNMAPPED`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MultiRange {
    ranges: Vec<MemoryRange>,
}

impl MultiRange {
    pub fn single(address: u64, size: u64) -> Self {
        Self {
            ranges: vec![MemoryRange::new(address, size)],
        }
    }

    /// Builds a range from sub-ranges, merging neighbours that are physically contiguous.
    pub fn from_ranges(ranges: impl IntoIterator<Item = MemoryRange>) -> Self {
        let mut merged: Vec<MemoryRange> = Vec::new();
        for range in ranges {
            if range.size == 0 {
                continue;
            }
            if let Some(last) = merged.last_mut() {
                let contiguous = if last.is_unmapped() {
                    range.is_unmapped()
                } else {
                    !range.is_unmapped() && last.end_address() == range.address
                };
                if contiguous {
                    last.size += range.size;
                    continue;
                }
            }
            merged.push(range);
        }
        Self { ranges: merged }
    }

    pub fn ranges(&self) -> &[MemoryRange] {
        &self.ranges
    }

    pub fn count(&self) -> usize {
        self.ranges.len()
    }

    pub fn sub_range(&self, index: usize) -> MemoryRange {
        self.ranges[index]
    }

    /// Mapped sub-ranges only.
    pub fn mapped(&self) -> impl Iterator<Item = &MemoryRange> + '_ {
        self.ranges.iter().filter(|range| !range.is_unmapped())
    }

    pub fn total_size(&self) -> u64 {
        self.ranges.iter().map(|range| range.size).sum()
    }

    pub fn has_unmapped(&self) -> bool {
        self.ranges.iter().any(MemoryRange::is_unmapped)
    }

    pub fn is_fully_unmapped(&self) -> bool {
        !self.ranges.is_empty() && self.ranges.iter().all(MemoryRange::is_unmapped)
    }

    pub fn min_address(&self) -> Option<u64> {
        self.mapped().map(|range| range.address).min()
    }

    pub fn max_address(&self) -> Option<u64> {
        self.mapped().map(|range| range.end_address()).max()
    }

    /// The part of this range starting `offset` bytes in and spanning `size` bytes.
    pub fn slice(&self, offset: u64, size: u64) -> MultiRange {
        let mut out = Vec::new();
        let mut base = 0u64;
        let end = offset.saturating_add(size);

        for range in &self.ranges {
            let range_end = base + range.size;
            if range_end > offset && base < end {
                let start_in = offset.saturating_sub(base);
                let end_in = (end - base).min(range.size);
                let address = if range.is_unmapped() {
                    PTE_UNMAPPED
                } else {
                    range.address + start_in
                };
                out.push(MemoryRange::new(address, end_in - start_in));
            }
            base = range_end;
            if base >= end {
                break;
            }
        }

        MultiRange::from_ranges(out)
    }

    /// Byte offset at which `other` starts inside this range, if `other` is laid out as a
    /// contiguous part of it.
    pub fn find_offset(&self, other: &MultiRange) -> Option<u64> {
        let first = other.ranges.first()?;
        if first.is_unmapped() {
            return None;
        }

        let mut base = 0u64;
        for range in &self.ranges {
            if range.contains(&MemoryRange::new(first.address, 1)) {
                let offset = base + (first.address - range.address);
                if self.slice(offset, other.total_size()) == *other {
                    return Some(offset);
                }
            }
            base += range.size;
        }

        None
    }

    pub fn overlaps_with(&self, other: &MultiRange) -> bool {
        self.mapped()
            .any(|range| other.mapped().any(|candidate| range.overlaps(candidate)))
    }

    /// Whether every mapped byte of `other` is also part of this range.
    pub fn contains(&self, other: &MultiRange) -> bool {
        other.mapped().all(|candidate| {
            let mut covered = 0;
            for range in self.mapped() {
                if range.overlaps(candidate) {
                    let start = range.address.max(candidate.address);
                    let end = range.end_address().min(candidate.end_address());
                    covered += end - start;
                }
            }
            covered >= candidate.size
        })
    }
}

impl From<MemoryRange> for MultiRange {
    fn from(range: MemoryRange) -> Self {
        MultiRange::from_ranges([range])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn split() -> MultiRange {
        MultiRange::from_ranges([
            MemoryRange::new(0x1000, 0x1000),
            MemoryRange::unmapped(0x1000),
            MemoryRange::new(0x8000, 0x2000),
        ])
    }

    #[test]
    fn contiguous_sub_ranges_merge() {
        let range = MultiRange::from_ranges([
            MemoryRange::new(0x1000, 0x1000),
            MemoryRange::new(0x2000, 0x1000),
            MemoryRange::unmapped(0x1000),
            MemoryRange::unmapped(0x1000),
        ]);
        assert_eq!(
            range.ranges(),
            &[MemoryRange::new(0x1000, 0x2000), MemoryRange::unmapped(0x2000)]
        );
    }

    #[test]
    fn slice_crosses_holes() {
        let range = split();
        assert_eq!(
            range.slice(0x800, 0x1000).ranges(),
            &[MemoryRange::new(0x1800, 0x800), MemoryRange::unmapped(0x800)]
        );
        assert_eq!(range.slice(0x2100, 0x100), MultiRange::single(0x8100, 0x100));
        assert_eq!(range.total_size(), 0x4000);
    }

    #[test]
    fn find_offset_requires_matching_layout() {
        let range = split();
        assert_eq!(range.find_offset(&MultiRange::single(0x8800, 0x100)), Some(0x2800));
        assert_eq!(range.find_offset(&MultiRange::single(0x1f00, 0x200)), None);
        assert_eq!(range.find_offset(&range.slice(0x400, 0x1000)), Some(0x400));
    }

    #[test]
    fn overlap_ignores_holes() {
        let range = split();
        assert!(range.overlaps_with(&MultiRange::single(0x9fff, 1)));
        assert!(!range.overlaps_with(&MultiRange::single(0x2000, 0x6000)));
        assert!(!range.overlaps_with(&MultiRange::from(MemoryRange::unmapped(0x1000))));
        assert!(range.contains(&MultiRange::single(0x8000, 0x2000)));
        assert!(!range.contains(&MultiRange::single(0x8000, 0x2001)));
    }
}
