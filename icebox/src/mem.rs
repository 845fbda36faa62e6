//! Virtual memory reads through guest page tables.

use std::cell::Cell;

use ibc::{
    Channel, IceError, IceResult, PhysicalAddress, Process, TranslationError, VirtualAddress,
};

use crate::state::Vm;

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    virt_page: u64,
    phys_page: u64,
}

/// Reads guest virtual memory through a directory table.
///
/// The reader caches the last page translation; linear scans (list walks,
/// string reads) hit the same page repeatedly, so one entry amortizes most
/// of the table walks. The cache is keyed on the VM resume epoch and drops
/// itself whenever the guest has run.
pub struct Reader<'a, C: Channel> {
    vm: &'a Vm<C>,
    pgd: PhysicalAddress,
    proc: Option<Process>,
    pointer_width: usize,
    tlb: Cell<Option<TlbEntry>>,
    epoch: Cell<u64>,
}

impl<'a, C: Channel> Reader<'a, C> {
    pub fn new(vm: &'a Vm<C>, pgd: PhysicalAddress) -> Self {
        Self {
            vm,
            pgd,
            proc: None,
            pointer_width: 8,
            tlb: Cell::new(None),
            epoch: Cell::new(vm.resume_epoch()),
        }
    }

    /// Binds a process context, used by OS layers to tag diagnostics and by
    /// 32-bit guests to size pointers.
    pub fn with_process(mut self, proc: Process, is_32bit: bool) -> Self {
        self.proc = Some(proc);
        self.pointer_width = if is_32bit { 4 } else { 8 };
        self
    }

    #[inline]
    pub fn pgd(&self) -> PhysicalAddress {
        self.pgd
    }

    #[inline]
    pub fn process(&self) -> Option<Process> {
        self.proc
    }

    fn translate_page(&self, page: VirtualAddress) -> IceResult<PhysicalAddress> {
        if self.epoch.get() != self.vm.resume_epoch() {
            self.tlb.set(None);
            self.epoch.set(self.vm.resume_epoch());
        }

        if let Some(tlb) = self.tlb.get() {
            if tlb.virt_page == page.0 {
                return Ok(PhysicalAddress(tlb.phys_page));
            }
        }

        let phys = match self.vm.virtual_to_physical(self.pgd, page) {
            Ok(phys) => phys,
            Err(TranslationError::Memory(err)) => return Err(err.into()),
            Err(TranslationError::Invalid(_)) => return Err(IceError::unmapped_page(page)),
        };

        self.tlb.set(Some(TlbEntry {
            virt_page: page.0,
            phys_page: phys.0 & !0xfff,
        }));
        Ok(PhysicalAddress(phys.0 & !0xfff) + page.page_offset())
    }

    /// Reads `buf.len()` bytes at `addr`, assembling across page boundaries.
    /// Fails with the faulting address when a page is unmapped.
    pub fn read(&self, addr: VirtualAddress, buf: &mut [u8]) -> IceResult<()> {
        ibc::read_virtual_memory(addr, buf, |addr, buf| {
            let phys = self.translate_page(addr.page_base())? + addr.page_offset();
            Ok(self.vm.read_physical(phys, buf)?)
        })
    }

    /// Reads like [`Reader::read`] but leaves unmapped pages zeroed.
    pub fn try_read(&self, addr: VirtualAddress, buf: &mut [u8]) -> IceResult<()> {
        ibc::read_virtual_memory(addr, buf, |addr, buf| {
            match self.translate_page(addr.page_base()) {
                Ok(phys) => Ok(self.vm.read_physical(phys + addr.page_offset(), buf)?),
                Err(err) => {
                    log::trace!("Skipping unmapped page: {err}");
                    Ok(())
                }
            }
        })
    }

    pub fn write(&self, addr: VirtualAddress, buf: &[u8]) -> IceResult<()> {
        ibc::write_virtual_memory(addr, buf, |addr, buf| {
            let phys = self.translate_page(addr.page_base())? + addr.page_offset();
            Ok(self.vm.write_physical(phys, buf)?)
        })
    }

    #[inline]
    pub fn read_value<T: bytemuck::Pod>(&self, addr: VirtualAddress) -> IceResult<T> {
        let mut value = bytemuck::Zeroable::zeroed();
        self.read(addr, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    #[inline]
    pub fn read_u8(&self, addr: VirtualAddress) -> IceResult<u8> {
        self.read_value(addr)
    }

    #[inline]
    pub fn read_u16(&self, addr: VirtualAddress) -> IceResult<u16> {
        self.read_value(addr).map(u16::from_le)
    }

    #[inline]
    pub fn read_u32(&self, addr: VirtualAddress) -> IceResult<u32> {
        self.read_value(addr).map(u32::from_le)
    }

    #[inline]
    pub fn read_u64(&self, addr: VirtualAddress) -> IceResult<u64> {
        self.read_value(addr).map(u64::from_le)
    }

    /// Reads a guest pointer, sized by the bound process's bitness.
    pub fn read_pointer(&self, addr: VirtualAddress) -> IceResult<VirtualAddress> {
        let value = match self.pointer_width {
            4 => self.read_u32(addr)? as u64,
            _ => self.read_u64(addr)?,
        };
        Ok(VirtualAddress(value))
    }

    /// Reads a NUL-terminated UTF-16 string, bounded by `max_chars`.
    pub fn read_utf16(&self, addr: VirtualAddress, max_chars: usize) -> IceResult<String> {
        let mut units = vec![0u16; max_chars];
        self.try_read(addr, bytemuck::cast_slice_mut(&mut units))?;

        let len = units.iter().position(|&c| c == 0).unwrap_or(units.len());
        Ok(String::from_utf16_lossy(&units[..len]))
    }

    /// Reads a NUL-terminated byte string, bounded by `max_len`.
    pub fn read_cstring(&self, addr: VirtualAddress, max_len: usize) -> IceResult<String> {
        let mut bytes = vec![0u8; max_len];
        self.try_read(addr, &mut bytes)?;

        let len = memchr::memchr(0, &bytes).unwrap_or(bytes.len());
        bytes.truncate(len);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl<C: Channel> std::fmt::Debug for Reader<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("pgd", &format_args!("0x{:x}", self.pgd))
            .field("proc", &self.proc)
            .finish_non_exhaustive()
    }
}
