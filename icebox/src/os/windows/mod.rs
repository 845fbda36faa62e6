//! The Windows/NT guest backend.

mod profile;

use std::ops::ControlFlow;
use std::sync::Arc;

use ibc::symbols::{self, Codeview, SymbolLoader, SymbolsIndexer};
use ibc::{
    Channel, Driver, IceError, IceResult, MmuEntry, Module, PhysicalAddress, Process, Thread,
    VcpuId, VirtualAddress,
};

use super::pointer::{HasLayout, Pointer, Space};
use super::{ArgLoc, Buildable, CallConvention, OsBuilder, OsVm};
use crate::mem::Reader;
use crate::state::{ResolveThread, Vm};
use profile::{
    Eprocess, Ethread, Kpcr, LdrDataTableEntry, ListEntry, PebLdrData, Profile, UnicodeString,
};

const KERNEL_PDB_STR: &str = "ntkrnlmp.pdb";

/// Fixed mapping of `KUSER_SHARED_DATA`, present on every NT build.
const USER_SHARED_DATA: VirtualAddress = VirtualAddress(0xfffff780_00000000);

macro_rules! impl_has_layout {
    ( $( $layout:ident ),* $(,)? ) => {$(
        impl<C: Channel> HasLayout<profile::$layout> for Windows<C> {
            #[inline]
            fn get_layout(&self) -> &profile::$layout {
                &self.profile.layouts.$layout
            }
        }
    )*};
}

impl_has_layout! {
    ListEntry, UnicodeString, Kpcr, Kprcb, Kprocess, Eprocess, Kthread, ClientId,
    Ethread, Peb, PebLdrData, LdrDataTableEntry,
}

pub struct Windows<C: Channel> {
    vm: Vm<C>,
    symbols: SymbolsIndexer,
    loader: Box<dyn SymbolLoader>,
    profile: Profile,
    kpgd: PhysicalAddress,
    base_addr: VirtualAddress,
}

/// `SizeOfImage` from an in-memory PE, read page by page.
fn pe_size_of_image(
    read: impl Fn(u64, &mut [u8]) -> IceResult<()>,
) -> IceResult<Option<u64>> {
    let mut dos = [0u8; 0x40];
    read(0, &mut dos)?;
    if &dos[..2] != b"MZ" {
        return Ok(None);
    }
    let e_lfanew = u32::from_le_bytes(dos[0x3c..0x40].try_into().unwrap()) as u64;
    if e_lfanew == 0 || e_lfanew > 0x1000 {
        return Ok(None);
    }

    let mut signature = [0u8; 4];
    read(e_lfanew, &mut signature)?;
    if &signature != b"PE\0\0" {
        return Ok(None);
    }

    // SizeOfImage sits at offset 0x38 of the 64-bit optional header
    let mut size = [0u8; 4];
    read(e_lfanew + 4 + 20 + 0x38, &mut size)?;
    let size = u32::from_le_bytes(size) as u64;
    Ok((size != 0 && size <= 0x4000_0000).then_some(size))
}

fn find_kernel_pgd<C: Channel>(vm: &Vm<C>) -> IceResult<PhysicalAddress> {
    let mut cr3s = Vec::with_capacity(vm.channel().vcpus_count());
    let mut test_addrs = vec![USER_SHARED_DATA];

    for vcpu in 0..vm.channel().vcpus_count() {
        let vcpu = VcpuId(vcpu);
        cr3s.push(PhysicalAddress(vm.special_registers(vcpu)?.cr3));
        if let Some(per_cpu) = vm.kernel_per_cpu(vcpu)? {
            test_addrs.push(per_cpu);
        }
    }

    ibc::arch::find_kernel_pgd(&vm.memory(), vm.paging_mode(), &cr3s, &test_addrs)
        .ok_or_else(|| IceError::new("could not find the kernel PGD"))
}

fn find_kernel<C: Channel>(
    vm: &Vm<C>,
    kpgd: PhysicalAddress,
) -> IceResult<Option<(String, VirtualAddress)>> {
    let memory = vm.memory();
    let mode = vm.paging_mode();

    for addr in ibc::arch::iter_in_kernel_memory(&memory, mode, kpgd, b"MZ")
        .map_while(|addr| addr.ok())
        .filter(|addr| addr.0 & 0xfff == 0)
    {
        let try_read = |offset: u64, buf: &mut [u8]| -> IceResult<()> {
            ibc::try_read_virtual_memory(addr + offset, buf, |addr, buf| {
                let phys = vm.virtual_to_physical(kpgd, addr)?;
                Ok(vm.read_physical(phys, buf)?)
            })?;
            Ok(())
        };

        let Some(size) = pe_size_of_image(&try_read)? else {
            continue;
        };

        let codeview =
            symbols::scan_codeview(addr, size, |at, buf| try_read((at - addr) as u64, buf));
        if let Ok(Some(codeview)) = codeview {
            if codeview.name() == Some(KERNEL_PDB_STR) {
                return Ok(Some((codeview.pdb_id(), addr)));
            }
        }
    }

    Ok(None)
}

/// Does a loader-list entry name match what the caller asked for, with or
/// without its extension?
fn module_name_matches(entry: &str, wanted: &str) -> bool {
    if entry.eq_ignore_ascii_case(wanted) {
        return true;
    }
    match entry.rsplit_once('.') {
        Some((stem, _)) => stem.eq_ignore_ascii_case(wanted),
        None => false,
    }
}

impl<'a, C: Channel> Pointer<'a, UnicodeString, Windows<C>> {
    fn read_unicode_string(self) -> IceResult<String> {
        let length = self.read_field(|s| s.Length)?;
        let buffer = self.read_pointer_field(|s| s.Buffer)?;

        let mut name = vec![0u16; length as usize / 2];
        buffer.read_bytes(0, bytemuck::cast_slice_mut(&mut name))?;
        Ok(String::from_utf16_lossy(&name))
    }
}

impl<C: Channel> Windows<C> {
    pub fn create(vm: Vm<C>, symbols: SymbolsIndexer) -> IceResult<Self> {
        super::os_builder().with_symbols(symbols).build(vm)
    }

    #[inline]
    fn kernel_ptr<T>(&self, addr: VirtualAddress) -> Pointer<T, Self> {
        Pointer::new(addr, self, Space::Kernel)
    }

    #[inline]
    fn eproc(&self, proc: Process) -> Pointer<Eprocess, Self> {
        self.kernel_ptr(proc.addr)
    }

    #[inline]
    fn ethread(&self, thread: Thread) -> Pointer<Ethread, Self> {
        self.kernel_ptr(thread.addr)
    }

    fn kpcr(&self, vcpu: VcpuId) -> IceResult<Pointer<Kpcr, Self>> {
        let per_cpu = self
            .vm
            .kernel_per_cpu(vcpu)?
            .ok_or_else(|| IceError::new("failed to get the kernel per-cpu area"))?;
        Ok(self.kernel_ptr(per_cpu))
    }

    /// Reader through the address space the vCPU currently runs in.
    fn vcpu_reader(&self, vcpu: VcpuId) -> IceResult<Reader<C>> {
        let cr3 = self.vm.special_registers(vcpu)?.cr3;
        let pgd = MmuEntry(cr3).take_bits(12, 48);
        Ok(Reader::new(&self.vm, pgd))
    }

    fn module_codeview(
        &self,
        proc: Process,
        module: Module,
    ) -> IceResult<Option<Codeview>> {
        use ibc::Os;

        let (start, end) = self.module_span(module, proc)?;
        let pgd = self.process_pgd(proc)?;
        let reader = Reader::new(&self.vm, pgd);

        symbols::scan_codeview(start, (end - start) as u64, |addr, buf| {
            reader.try_read(addr, buf)
        })
    }

    /// Loads (once) and returns the symbols of a process module, identified
    /// by the CodeView record inside its image.
    pub fn module_symbols(
        &self,
        proc: Process,
        module: Module,
    ) -> IceResult<Option<Arc<ibc::ModuleSymbols>>> {
        use ibc::Os;

        let name = self.module_name(module, proc)?;
        self.symbols.load_module(&name, &mut |_| {
            let codeview = self.module_codeview(proc, module)?;

            let module = match codeview {
                Some(codeview) => {
                    let pdb_name = codeview
                        .name()
                        .ok_or_else(|| IceError::new("unreadable CodeView name"))?;
                    self.loader.load(pdb_name, &codeview.pdb_id())?
                }
                None => None,
            };

            Ok(module.map(Arc::new))
        })
    }
}

impl<C: Channel> Buildable<C> for Windows<C> {
    fn quick_check(vm: &Vm<C>) -> Option<OsBuilder> {
        let kpgd = find_kernel_pgd(vm).ok()?;
        let (pdb_id, kaslr) = find_kernel(vm, kpgd).ok()??;
        Some(OsBuilder {
            kpgd: Some(kpgd),
            kaslr: Some(kaslr),
            version: Some(pdb_id),
            symbols: None,
            loader: None,
        })
    }

    fn build(vm: Vm<C>, builder: OsBuilder) -> IceResult<Self> {
        let kpgd = match builder.kpgd {
            Some(kpgd) => kpgd,
            None => find_kernel_pgd(&vm)?,
        };
        log::debug!("Found Windows PGD at 0x{kpgd:x}");

        let (pdb_id, base_addr) = match (builder.kaslr, builder.version) {
            (Some(kaslr), Some(pdb_id)) => (pdb_id, kaslr),
            _ => find_kernel(&vm, kpgd)?
                .ok_or_else(|| IceError::new("failed to find the NT kernel image"))?,
        };
        log::info!("Found kernel at 0x{base_addr:x} (PDB: {pdb_id})");

        let loader = match builder.loader {
            Some(loader) => loader,
            None => Box::new(symbols::PdbLoader::with_default_root()?),
        };

        let symbols = builder.symbols.unwrap_or_default();
        let kernel = symbols
            .load_module("ntoskrnl.exe", &mut |_| {
                Ok(loader.load(KERNEL_PDB_STR, &pdb_id)?.map(Arc::new))
            })?
            .ok_or_else(|| IceError::missing_module("ntoskrnl.exe"))?;
        let profile = Profile::new(kernel)?;

        Ok(Windows {
            vm,
            symbols,
            loader,
            profile,
            kpgd,
            base_addr,
        })
    }
}

impl<C: Channel> ibc::Os for Windows<C> {
    fn kernel_pgd(&self) -> PhysicalAddress {
        self.kpgd
    }

    fn read_virtual_memory(
        &self,
        mmu_addr: PhysicalAddress,
        addr: VirtualAddress,
        buf: &mut [u8],
    ) -> IceResult<()> {
        Reader::new(&self.vm, mmu_addr).read(addr, buf)
    }

    fn read_process_memory(
        &self,
        proc: Process,
        addr: VirtualAddress,
        buf: &mut [u8],
    ) -> IceResult<()> {
        let pgd = self.process_pgd(proc)?;
        Reader::new(&self.vm, pgd).read(addr, buf)
    }

    fn write_virtual_memory(
        &self,
        mmu_addr: PhysicalAddress,
        addr: VirtualAddress,
        buf: &[u8],
    ) -> IceResult<()> {
        self.vm.write_virtual(mmu_addr, addr, buf)
    }

    fn init_process(&self) -> IceResult<Process> {
        let addr = self.base_addr + self.profile.fast_syms.PsInitialSystemProcess;
        let proc = Reader::new(&self.vm, self.kpgd).read_pointer(addr)?;
        Ok(Process::new(proc))
    }

    fn current_thread(&self, vcpu: VcpuId) -> IceResult<Thread> {
        let thread = self
            .kpcr(vcpu)?
            .field(|kpcr| kpcr.Prcb)?
            .read_pointer_field(|kprcb| kprcb.CurrentThread)?;
        Ok(Thread::new(thread.addr))
    }

    fn for_each_process(
        &self,
        f: &mut dyn FnMut(Process) -> IceResult<ControlFlow<()>>,
    ) -> IceResult<()> {
        let head = self.base_addr + self.profile.fast_syms.PsActiveProcessHead;
        let offset = self.profile.layouts.Eprocess.ActiveProcessLinks.offset;

        self.kernel_ptr::<ListEntry>(head)
            .iterate_list(offset, |addr| f(Process::new(addr)))
    }

    fn process_id(&self, proc: Process) -> IceResult<u64> {
        self.eproc(proc).read_field(|e| e.UniqueProcessId)
    }

    fn process_name(&self, proc: Process) -> IceResult<String> {
        let name = self.eproc(proc).read_field(|e| e.ImageFileName)?;

        let name = match memchr::memchr(0, &name) {
            Some(i) => &name[..i],
            None => &name[..],
        };
        Ok(String::from_utf8_lossy(name).into_owned())
    }

    fn process_parent(&self, proc: Process) -> IceResult<Process> {
        let parent_pid = self
            .eproc(proc)
            .read_field(|e| e.InheritedFromUniqueProcessId)?;
        Ok(self.find_process_by_id(parent_pid)?.unwrap_or(proc))
    }

    fn process_pgd(&self, proc: Process) -> IceResult<PhysicalAddress> {
        let kproc = self.eproc(proc).field(|e| e.Pcb)?;

        // KVA-shadow kernels keep the real user tables aside
        if let Some(offset) = self.profile.layouts.Kprocess.UserDirectoryTableBase {
            let dtb: PhysicalAddress = kproc.read_field(|_| offset)?;
            if dtb.0 != 0 && dtb.0 != 1 {
                return Ok(MmuEntry(dtb.0).take_bits(12, 48));
            }
        }

        let dtb = kproc.read_field(|k| k.DirectoryTableBase)?;
        Ok(MmuEntry(dtb.0).take_bits(12, 48))
    }

    fn process_is_kernel(&self, proc: Process) -> IceResult<bool> {
        let peb = self.eproc(proc).read_pointer_field(|e| e.Peb)?;
        Ok(peb.is_null())
    }

    fn process_is_32bit(&self, proc: Process) -> IceResult<bool> {
        match self.profile.layouts.Eprocess.Wow64Process {
            Some(offset) => {
                let wow64 = self.eproc(proc).read_pointer_field(|_| offset)?;
                Ok(!wow64.is_null())
            }
            None => Ok(false),
        }
    }

    fn process_for_each_thread(
        &self,
        proc: Process,
        f: &mut dyn FnMut(Thread) -> IceResult<ControlFlow<()>>,
    ) -> IceResult<()> {
        let offset = self.profile.layouts.Ethread.ThreadListEntry.offset;
        self.eproc(proc)
            .field(|e| e.ThreadListHead)?
            .iterate_list(offset, |addr| f(Thread::new(addr)))
    }

    fn process_for_each_module(
        &self,
        proc: Process,
        f: &mut dyn FnMut(Module) -> IceResult<ControlFlow<()>>,
    ) -> IceResult<()> {
        let peb = self.eproc(proc).read_pointer_field(|e| e.Peb)?;
        if peb.is_null() {
            return Ok(());
        }

        let offset = self.profile.layouts.LdrDataTableEntry.InLoadOrderLinks.offset;
        peb.switch_to_userspace(proc)
            .read_pointer_field(|peb| peb.Ldr)?
            .field(|ldr: &PebLdrData| ldr.InLoadOrderModuleList)?
            .iterate_list(offset, |addr| f(Module::new(addr)))
    }

    fn module_name(&self, module: Module, proc: Process) -> IceResult<String> {
        self.kernel_ptr::<LdrDataTableEntry>(module.addr)
            .switch_to_userspace(proc)
            .field(|m| m.BaseDllName)?
            .read_unicode_string()
    }

    fn module_span(
        &self,
        module: Module,
        proc: Process,
    ) -> IceResult<(VirtualAddress, VirtualAddress)> {
        let module = self
            .kernel_ptr::<LdrDataTableEntry>(module.addr)
            .switch_to_userspace(proc);
        let base = module.read_field(|m| m.DllBase)?;
        let size = module.read_field(|m| m.SizeOfImage)?;
        Ok((base, base + size as u64))
    }

    fn for_each_driver(
        &self,
        f: &mut dyn FnMut(Driver) -> IceResult<ControlFlow<()>>,
    ) -> IceResult<()> {
        let head = self.base_addr + self.profile.fast_syms.PsLoadedModuleList;
        let offset = self.profile.layouts.LdrDataTableEntry.InLoadOrderLinks.offset;

        self.kernel_ptr::<ListEntry>(head)
            .iterate_list(offset, |addr| f(Driver::new(addr)))
    }

    fn driver_name(&self, driver: Driver) -> IceResult<String> {
        self.kernel_ptr::<LdrDataTableEntry>(driver.addr)
            .field(|m| m.BaseDllName)?
            .read_unicode_string()
    }

    fn driver_span(&self, driver: Driver) -> IceResult<(VirtualAddress, VirtualAddress)> {
        let driver = self.kernel_ptr::<LdrDataTableEntry>(driver.addr);
        let base = driver.read_field(|m| m.DllBase)?;
        let size = driver.read_field(|m| m.SizeOfImage)?;
        Ok((base, base + size as u64))
    }

    fn thread_process(&self, thread: Thread) -> IceResult<Process> {
        let proc = self
            .ethread(thread)
            .field(|t| t.Tcb)?
            .read_pointer_field(|k| k.Process)?;
        Ok(Process::new(proc.addr))
    }

    fn thread_id(&self, thread: Thread) -> IceResult<u64> {
        self.ethread(thread)
            .field(|t| t.Cid)?
            .read_field(|cid| cid.UniqueThread)
    }

    fn thread_name(&self, thread: Thread) -> IceResult<Option<String>> {
        let Some(offset) = self.profile.layouts.Ethread.ThreadName else {
            return Ok(None);
        };

        self.ethread(thread)
            .read_pointer_field(|_| offset)?
            .map_non_null(|name| name.read_unicode_string())
    }

    fn read_arg(&self, vcpu: VcpuId, index: usize) -> IceResult<u64> {
        match CallConvention::WindowsX64.arg_location(index) {
            ArgLoc::Reg(reg) => self.vm.read_register(vcpu, reg),
            ArgLoc::Stack(offset) => {
                let rsp = self.vm.registers(vcpu)?.rsp;
                self.vcpu_reader(vcpu)?
                    .read_u64(VirtualAddress(rsp) + offset)
            }
        }
    }

    fn write_arg(&self, vcpu: VcpuId, index: usize, value: u64) -> IceResult<()> {
        match CallConvention::WindowsX64.arg_location(index) {
            ArgLoc::Reg(reg) => self.vm.write_register(vcpu, reg, value),
            ArgLoc::Stack(offset) => {
                let rsp = self.vm.registers(vcpu)?.rsp;
                self.vcpu_reader(vcpu)?
                    .write(VirtualAddress(rsp) + offset, &value.to_le_bytes())
            }
        }
    }

    fn return_address(&self, vcpu: VcpuId) -> IceResult<VirtualAddress> {
        let rsp = self.vm.registers(vcpu)?.rsp;
        self.vcpu_reader(vcpu)?.read_pointer(VirtualAddress(rsp))
    }

    fn resolve_symbol(
        &self,
        proc: Process,
        module: &str,
        name: &str,
    ) -> IceResult<VirtualAddress> {
        if module_name_matches("ntoskrnl.exe", module)
            || module_name_matches(KERNEL_PDB_STR, module)
        {
            let offset = self.profile.syms.require_symbol(name)?;
            return Ok(self.base_addr + offset);
        }

        let mut found = None;
        self.process_for_each_module(proc, &mut |m| {
            Ok(if module_name_matches(&self.module_name(m, proc)?, module) {
                found = Some(m);
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            })
        })?;
        let m = found.ok_or_else(|| IceError::missing_module(module))?;

        let syms = self
            .module_symbols(proc, m)?
            .ok_or_else(|| IceError::missing_module(module))?;
        let offset = syms.require_symbol(name)?;
        let (base, _) = self.module_span(m, proc)?;
        Ok(base + offset)
    }
}

impl<C: Channel> ResolveThread for Windows<C> {
    fn current_thread_id(&self, vcpu: VcpuId) -> IceResult<u64> {
        use ibc::Os;
        Ok(self.current_thread(vcpu)?.id)
    }
}

impl<C: Channel + 'static> OsVm<C> for Windows<C> {
    #[inline]
    fn vm(&self) -> &Vm<C> {
        &self.vm
    }
}

impl<C: Channel> std::fmt::Debug for Windows<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Windows")
            .field("kpgd", &format_args!("0x{:x}", self.kpgd))
            .field("base_addr", &format_args!("0x{:x}", self.base_addr))
            .finish_non_exhaustive()
    }
}
