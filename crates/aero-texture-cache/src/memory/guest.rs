//! Guest physical memory backing store.
//!
//! The emulator provides an implementation backed by its memory system; the cache only needs
//! byte-range reads and writes. Write tracking lives one level up in [`super::PhysicalMemory`].

use std::sync::{Mutex, MutexGuard};

use crate::error::GuestMemoryError;

/// Byte-addressed access to guest physical memory.
pub trait GuestMemory {
    fn read(&self, gpa: u64, dst: &mut [u8]) -> Result<(), GuestMemoryError>;
    fn write(&self, gpa: u64, src: &[u8]) -> Result<(), GuestMemoryError>;
}

/// Guest physical memory held in one host allocation starting at address 0.
#[derive(Debug)]
pub struct VecGuestMemory {
    mem: Mutex<Vec<u8>>,
}

impl VecGuestMemory {
    pub fn new(size_bytes: usize) -> Self {
        Self {
            mem: Mutex::new(vec![0u8; size_bytes]),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        match self.mem.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn span(gpa: u64, len: usize) -> Result<std::ops::Range<usize>, GuestMemoryError> {
        let start = usize::try_from(gpa).map_err(|_| GuestMemoryError { gpa, len })?;
        let end = start
            .checked_add(len)
            .ok_or(GuestMemoryError { gpa, len })?;
        Ok(start..end)
    }
}

impl GuestMemory for VecGuestMemory {
    fn read(&self, gpa: u64, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
        let span = Self::span(gpa, dst.len())?;
        let mem = self.lock();
        let slice = mem.get(span).ok_or(GuestMemoryError {
            gpa,
            len: dst.len(),
        })?;
        dst.copy_from_slice(slice);
        Ok(())
    }

    fn write(&self, gpa: u64, src: &[u8]) -> Result<(), GuestMemoryError> {
        let span = Self::span(gpa, src.len())?;
        let mut mem = self.lock();
        let slice = mem.get_mut(span).ok_or(GuestMemoryError {
            gpa,
            len: src.len(),
        })?;
        slice.copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_access_is_reported() {
        let mem = VecGuestMemory::new(16);
        mem.write(8, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 4];
        mem.read(8, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        assert_eq!(
            mem.read(14, &mut buf),
            Err(GuestMemoryError { gpa: 14, len: 4 })
        );
        assert!(mem.write(u64::MAX, &[0]).is_err());
    }
}
