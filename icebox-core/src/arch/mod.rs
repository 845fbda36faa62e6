pub mod x86_64;

use crate::{
    addr::MmuEntry, mask, MemoryAccessResult, PhysicalAddress, TranslationError,
    TranslationResult, VirtualAddress,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuId(pub usize);

/// Active paging mode, derived from control registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// 4-level long mode (1G/2M/4K pages).
    LongMode,
    /// 3-level PAE (2M/4K pages).
    Pae,
}

impl PagingMode {
    /// Decodes the paging mode of a vCPU from CR0, CR4 and EFER.
    pub fn from_control_regs(cr0: u64, cr4: u64, efer: u64) -> TranslationResult<PagingMode> {
        const CR0_PG: u64 = 1 << 31;
        const CR4_PAE: u64 = 1 << 5;
        const EFER_LMA: u64 = 1 << 10;

        if cr0 & CR0_PG == 0 {
            return Err(TranslationError::Invalid(cr0));
        }
        if efer & EFER_LMA != 0 {
            Ok(PagingMode::LongMode)
        } else if cr4 & CR4_PAE != 0 {
            Ok(PagingMode::Pae)
        } else {
            // Legacy 2-level 32 bit paging uses 4-byte entries, which no
            // supported guest runs anymore.
            Err(TranslationError::Invalid(cr4))
        }
    }
}

/// The description of how a MMU works
///
/// x86 paging modes share the same entry format over a varying number of
/// levels, so translation is written once against this trait.
trait MmuDesc {
    /// The number of significant bits in an address.
    const ADDR_BITS: u32 = 48;

    /// The bits at which an index can be found for each table level.
    ///
    /// The boolean is `true` if a large page can be encountered at this
    /// level.
    const LEVELS: &'static [(u32, bool)];

    #[inline]
    fn is_valid(mmu_entry: MmuEntry) -> bool {
        mmu_entry.0 & 1 != 0
    }

    #[inline]
    fn is_large(mmu_entry: MmuEntry) -> bool {
        mmu_entry.0 & (1 << 7) != 0
    }
}

struct LongMode;

impl MmuDesc for LongMode {
    const LEVELS: &'static [(u32, bool)] = &[(39, false), (30, true), (21, true), (12, false)];
}

struct Pae;

impl MmuDesc for Pae {
    const ADDR_BITS: u32 = 40;
    const LEVELS: &'static [(u32, bool)] = &[(30, false), (21, true), (12, false)];
}

fn walk<Mmu: MmuDesc, M: crate::PhysicalMemory + ?Sized>(
    memory: &M,
    mmu_addr: PhysicalAddress,
    addr: VirtualAddress,
) -> TranslationResult<PhysicalAddress> {
    let mut mmu_entry = MmuEntry(mmu_addr.0);

    for &(shift, has_large) in Mmu::LEVELS {
        let table_addr = mmu_entry.take_bits(12, Mmu::ADDR_BITS);
        let index = (addr.0 >> shift) & mask(9);

        // Entries are 64 bits in every supported mode
        memory.read_physical(
            table_addr + 8 * index,
            bytemuck::bytes_of_mut(&mut mmu_entry),
        )?;
        if !Mmu::is_valid(mmu_entry) {
            return Err(TranslationError::Invalid(mmu_entry.0));
        }

        // If we encounter a large page, we are done
        if has_large && Mmu::is_large(mmu_entry) {
            let base = mmu_entry.take_bits(shift, Mmu::ADDR_BITS);
            return Ok(base + (addr.0 & mask(shift)));
        }
    }

    Ok(mmu_entry.take_bits(12, Mmu::ADDR_BITS) + (addr.0 & mask(12)))
}

/// Translates a virtual address by walking the tables rooted at `mmu_addr`.
pub fn virtual_to_physical<M: crate::PhysicalMemory + ?Sized>(
    memory: &M,
    mode: PagingMode,
    mmu_addr: PhysicalAddress,
    addr: VirtualAddress,
) -> TranslationResult<PhysicalAddress> {
    match mode {
        PagingMode::LongMode => walk::<LongMode, M>(memory, mmu_addr, addr),
        PagingMode::Pae => walk::<Pae, M>(memory, mmu_addr, addr),
    }
}

/// Recursively walks the translation table, searching mapped pages for the
/// pattern.
///
/// The buffer is reused by every level to avoid reallocating.
fn find_in_kernel_memory_inner<Mmu: MmuDesc, M: crate::PhysicalMemory + ?Sized>(
    memory: &M,
    table_addr: PhysicalAddress,
    base_search_addr: VirtualAddress,
    finder: &memchr::memmem::Finder,
    buf: &mut [u8],
    levels: &[(u32, bool)],
) -> MemoryAccessResult<Option<VirtualAddress>> {
    let (shift, has_large, rest) = match levels {
        [] => return Ok(None),
        [(shift, has_large), rest @ ..] => (*shift, *has_large, rest),
    };

    let mut table = [MmuEntry(0u64); 512];
    match memory.read_physical(table_addr, bytemuck::cast_slice_mut(&mut table)) {
        Err(crate::MemoryAccessError::OutOfBounds) => return Ok(None),
        Err(err) => return Err(err),
        _ => (),
    }
    let page_size = 1 << shift;

    // The search address splits in a prefix kept for the final address, an
    // index where this level starts, and a rest handed to the next level.
    let prefix = VirtualAddress(base_search_addr.0 & !mask(shift + 9));
    let base_index = ((base_search_addr.0 >> shift) & mask(9)) as usize;
    let search_rest = base_search_addr.0 & mask(shift);

    for (index, entry) in table
        .into_iter()
        .enumerate()
        .skip(base_index)
        .filter(|(_, mmu_entry)| Mmu::is_valid(*mmu_entry))
    {
        let base_addr = prefix + index as u64 * page_size;
        let offset = if index == base_index { search_rest } else { 0 };

        if rest.is_empty() || (has_large && Mmu::is_large(entry)) {
            let addr = entry.take_bits(shift, Mmu::ADDR_BITS);
            match memory.search(addr + offset, page_size - offset, finder, buf) {
                Ok(Some(i)) => return Ok(Some(base_addr + offset + i)),
                Ok(None) | Err(crate::MemoryAccessError::OutOfBounds) => (),
                Err(err) => return Err(err),
            }
        } else {
            let table_addr = entry.take_bits(12, Mmu::ADDR_BITS);
            let base_search_addr = base_addr + offset;
            let result = find_in_kernel_memory_inner::<Mmu, M>(
                memory,
                table_addr,
                base_search_addr,
                finder,
                buf,
                rest,
            )?;
            if let Some(addr) = result {
                return Ok(Some(addr));
            }
        }
    }

    Ok(None)
}

/// Finds a pattern in mapped kernel memory starting at `base_search_addr`.
///
/// This will probably miss a pattern that overlaps two non-contiguous pages.
pub fn find_in_kernel_memory_raw<M: crate::PhysicalMemory + ?Sized>(
    memory: &M,
    mode: PagingMode,
    mmu_addr: PhysicalAddress,
    base_search_addr: VirtualAddress,
    finder: &memchr::memmem::Finder,
    buf: &mut [u8],
) -> MemoryAccessResult<Option<VirtualAddress>> {
    let table_addr = MmuEntry(mmu_addr.0).take_bits(12, LongMode::ADDR_BITS);

    match mode {
        PagingMode::LongMode => find_in_kernel_memory_inner::<LongMode, M>(
            memory,
            table_addr,
            base_search_addr,
            finder,
            buf,
            LongMode::LEVELS,
        ),
        PagingMode::Pae => find_in_kernel_memory_inner::<Pae, M>(
            memory,
            table_addr,
            base_search_addr,
            finder,
            buf,
            Pae::LEVELS,
        ),
    }
}

pub fn find_in_kernel_memory<M: crate::PhysicalMemory + ?Sized>(
    memory: &M,
    mode: PagingMode,
    mmu_addr: PhysicalAddress,
    needle: &[u8],
    base_search_addr: VirtualAddress,
) -> MemoryAccessResult<Option<VirtualAddress>> {
    let mut buf = alloc::vec![0; (1 << 21) + needle.len()];
    let finder = memchr::memmem::Finder::new(needle);

    find_in_kernel_memory_raw::<M>(memory, mode, mmu_addr, base_search_addr, &finder, &mut buf)
}

/// Iterates every match of a pattern in kernel memory, page-aligned hits
/// first served.
pub fn iter_in_kernel_memory<'a, M: crate::PhysicalMemory + ?Sized>(
    memory: &'a M,
    mode: PagingMode,
    mmu_addr: PhysicalAddress,
    needle: &'a [u8],
) -> impl Iterator<Item = MemoryAccessResult<VirtualAddress>> + 'a {
    let finder = memchr::memmem::Finder::new(needle);
    let mut buf = alloc::vec![0; (1 << 21) + needle.len()];
    let mut next = Some(VirtualAddress(x86_64::KERNEL_START));

    core::iter::from_fn(move || {
        let base = next?;
        match find_in_kernel_memory_raw(memory, mode, mmu_addr, base, &finder, &mut buf) {
            Ok(Some(addr)) => {
                next = (addr.0 < u64::MAX).then(|| addr + 1u64);
                Some(Ok(addr))
            }
            Ok(None) => {
                next = None;
                None
            }
            Err(err) => {
                next = None;
                Some(Err(err))
            }
        }
    })
}

fn try_all_addresses(test: impl Fn(PhysicalAddress) -> bool) -> Option<PhysicalAddress> {
    log::debug!("Trying all addresses to guess kernel PGD");

    for addr in (0..u32::MAX as u64).step_by(0x1000) {
        let addr = PhysicalAddress(addr);
        if test(addr) {
            return Some(addr);
        }
    }

    None
}

/// Finds the kernel page directory by validating candidate roots against a
/// set of addresses known to be mapped in kernel space.
///
/// CR3 values are tried first, then all of low physical memory.
pub fn find_kernel_pgd<M: crate::PhysicalMemory + ?Sized>(
    memory: &M,
    mode: PagingMode,
    cr3s: &[PhysicalAddress],
    test_addrs: &[VirtualAddress],
) -> Option<PhysicalAddress> {
    if test_addrs.is_empty() {
        return None;
    }
    let mem_size = memory.size();

    let test = |addr: PhysicalAddress| {
        test_addrs.iter().all(|&test_addr| {
            match virtual_to_physical(memory, mode, addr, test_addr) {
                Ok(addr) => addr.0 < mem_size,
                Err(_) => false,
            }
        })
    };

    for &cr3 in cr3s {
        // CR3 low bits carry PCID flags, not address bits
        let addr = MmuEntry(cr3.0).take_bits(12, LongMode::ADDR_BITS);
        if test(addr) {
            return Some(addr);
        }
    }

    try_all_addresses(test)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Identity-ish tables: virt `KERNEL_START + x` maps to phys `x` with 2M
    /// pages, plus one 4K fine-grained page at the end.
    fn build_tables(mem: &mut [u8]) {
        let entry = |addr: u64, flags: u64| (addr | flags).to_le_bytes();

        // PML4[0x100] -> PDPT at 0x1000
        let pml4e = 0x100 * 8;
        mem[pml4e..pml4e + 8].copy_from_slice(&entry(0x1000, 1));
        // PDPT[0] -> PD at 0x2000
        mem[0x1000..0x1008].copy_from_slice(&entry(0x2000, 1));
        // PD[0] -> 2M large page at phys 0
        mem[0x2000..0x2008].copy_from_slice(&entry(0, 1 | (1 << 7)));
        // PD[1] -> PT at 0x3000
        mem[0x2008..0x2010].copy_from_slice(&entry(0x3000, 1));
        // PT[0] -> 4K page at phys 0x4000
        mem[0x3000..0x3008].copy_from_slice(&entry(0x4000, 1));
    }

    #[test]
    fn long_mode_walk() {
        let mut mem = alloc::vec![0u8; 0x10000];
        build_tables(&mut mem);

        let pgd = PhysicalAddress(0);
        let base = VirtualAddress(x86_64::KERNEL_START);

        let phys =
            virtual_to_physical(&mem, PagingMode::LongMode, pgd, base + 0x1234u64).unwrap();
        assert_eq!(phys, PhysicalAddress(0x1234));

        // Through the 4K mapping behind PD[1]
        let phys =
            virtual_to_physical(&mem, PagingMode::LongMode, pgd, base + 0x200042u64).unwrap();
        assert_eq!(phys, PhysicalAddress(0x4042));

        // PD[2] is not present
        let err = virtual_to_physical(&mem, PagingMode::LongMode, pgd, base + 0x400000u64);
        assert!(matches!(err, Err(TranslationError::Invalid(0))));
    }

    #[test]
    fn pattern_search() {
        let mut mem = alloc::vec![0u8; 0x10000];
        build_tables(&mut mem);
        mem[0x4100..0x4110].copy_from_slice(b"Linux version 5_");

        let base = VirtualAddress(x86_64::KERNEL_START);
        let found = find_in_kernel_memory(
            &mem,
            PagingMode::LongMode,
            PhysicalAddress(0),
            b"Linux version",
            base,
        )
        .unwrap();

        // The pattern is also visible through the low 2M mapping at offset
        // 0x4100, which comes first.
        assert_eq!(found, Some(base + 0x4100u64));
    }

    #[test]
    fn pgd_guess() {
        let mut mem = alloc::vec![0u8; 0x10000];
        build_tables(&mut mem);

        let base = VirtualAddress(x86_64::KERNEL_START);
        let found = find_kernel_pgd(
            &mem,
            PagingMode::LongMode,
            &[PhysicalAddress(0x123)],
            &[base + 0x1000u64],
        );
        assert_eq!(found, Some(PhysicalAddress(0)));
    }
}
