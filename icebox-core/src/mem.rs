use super::{MemoryAccessError, MemoryAccessResult, PhysicalAddress};

/// Read access to guest physical memory.
///
/// Implemented by raw buffers for tests and offline images, and adapted over
/// the hypervisor channel for live guests.
pub trait PhysicalMemory {
    fn size(&self) -> u64;

    fn read_physical(&self, addr: PhysicalAddress, buf: &mut [u8]) -> MemoryAccessResult<()>;

    #[inline]
    fn is_valid(&self, addr: PhysicalAddress, len: usize) -> bool {
        addr.0.checked_add(len as u64).is_some_and(|end| end <= self.size())
    }

    #[inline]
    fn read_value<T: bytemuck::Pod>(&self, addr: PhysicalAddress) -> MemoryAccessResult<T> {
        let mut value = bytemuck::Zeroable::zeroed();
        self.read_physical(addr, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    /// Looks for a pattern within `[addr, addr + len)`, returning the offset
    /// of the first match.
    ///
    /// `buf` is caller-provided scratch space; it must be larger than the
    /// needle and is reused across chunks to bound allocations.
    fn search(
        &self,
        addr: PhysicalAddress,
        len: u64,
        finder: &memchr::memmem::Finder,
        buf: &mut [u8],
    ) -> MemoryAccessResult<Option<u64>> {
        let needle_len = finder.needle().len() as u64;
        debug_assert!(buf.len() as u64 > needle_len);

        let mut offset = 0;
        while offset + needle_len <= len {
            let chunk = u64::min(buf.len() as u64, len - offset) as usize;
            let buf = &mut buf[..chunk];
            self.read_physical(addr + offset, buf)?;

            if let Some(i) = finder.find(buf) {
                return Ok(Some(offset + i as u64));
            }

            // Overlap chunks so a match across the boundary is not lost
            offset += (chunk as u64).saturating_sub(needle_len - 1).max(1);
        }

        Ok(None)
    }
}

impl PhysicalMemory for [u8] {
    #[inline]
    fn size(&self) -> u64 {
        self.len() as u64
    }

    #[inline]
    fn read_physical(&self, addr: PhysicalAddress, buf: &mut [u8]) -> MemoryAccessResult<()> {
        (|| {
            let offset = addr.0.try_into().ok()?;
            let this = self.get(offset..)?;
            let len = buf.len();
            (this.len() >= len).then(|| buf.copy_from_slice(&this[..len]))
        })()
        .ok_or(MemoryAccessError::OutOfBounds)
    }
}

impl PhysicalMemory for alloc::vec::Vec<u8> {
    #[inline]
    fn size(&self) -> u64 {
        (**self).size()
    }

    #[inline]
    fn read_physical(&self, addr: PhysicalAddress, buf: &mut [u8]) -> MemoryAccessResult<()> {
        (**self).read_physical(addr, buf)
    }
}

impl<M: PhysicalMemory + ?Sized> PhysicalMemory for &'_ M {
    #[inline]
    fn size(&self) -> u64 {
        (**self).size()
    }

    #[inline]
    fn read_physical(&self, addr: PhysicalAddress, buf: &mut [u8]) -> MemoryAccessResult<()> {
        (**self).read_physical(addr, buf)
    }
}

impl<M: PhysicalMemory + ?Sized> PhysicalMemory for alloc::boxed::Box<M> {
    #[inline]
    fn size(&self) -> u64 {
        (**self).size()
    }

    #[inline]
    fn read_physical(&self, addr: PhysicalAddress, buf: &mut [u8]) -> MemoryAccessResult<()> {
        (**self).read_physical(addr, buf)
    }
}
