//! The Linux guest backend.

mod profile;

use std::ops::ControlFlow;

use ibc::{
    Channel, Driver, IceError, IceResult, MmuEntry, Module, PhysicalAddress, Process, Thread,
    VcpuId, VirtualAddress,
};

use super::{ArgLoc, Buildable, CallConvention, OsBuilder, OsVm};
use crate::mem::Reader;
use crate::state::{ResolveThread, Vm};
use profile::Profile;

/// Where the kernel text may live; the banner scan starts here.
const KERNEL_TEXT_BASE: VirtualAddress = VirtualAddress(0xffff_ffff_8000_0000);

const BANNER: &[u8] = b"Linux version ";

pub struct Linux<C: Channel> {
    vm: Vm<C>,
    profile: Profile,
    kpgd: PhysicalAddress,
    kaslr: i64,
}

fn find_kernel_pgd<C: Channel>(vm: &Vm<C>) -> IceResult<PhysicalAddress> {
    let mut cr3s = Vec::with_capacity(vm.channel().vcpus_count());
    let mut test_addrs = Vec::new();

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

fn find_banner<C: Channel>(
    vm: &Vm<C>,
    kpgd: PhysicalAddress,
) -> IceResult<Option<VirtualAddress>> {
    let addr = ibc::arch::find_in_kernel_memory(
        &vm.memory(),
        vm.paging_mode(),
        kpgd,
        BANNER,
        KERNEL_TEXT_BASE,
    )?;
    Ok(addr)
}

impl<C: Channel> Linux<C> {
    pub fn create(vm: Vm<C>, symbols: ibc::SymbolsIndexer) -> IceResult<Self> {
        super::os_builder().with_symbols(symbols).build(vm)
    }

    #[inline]
    fn kernel_reader(&self) -> Reader<C> {
        Reader::new(&self.vm, self.kpgd)
    }

    /// Unslid symbol value to a live virtual address.
    #[inline]
    fn slide(&self, addr: u64) -> VirtualAddress {
        VirtualAddress(addr) + self.kaslr
    }

    fn offsets(&self) -> &profile::FastOffsets {
        &self.profile.fast_offsets
    }

    /// Walks a `list_head` ring, yielding each node address (head excluded).
    fn iterate_list(
        &self,
        head: VirtualAddress,
        f: &mut dyn FnMut(VirtualAddress) -> IceResult<ControlFlow<()>>,
    ) -> IceResult<()> {
        let reader = self.kernel_reader();
        let next_offset = self.offsets().list_head_next;
        let mut pos = head;

        loop {
            pos = reader.read_pointer(pos + next_offset)?;
            if pos == head || pos.is_null() {
                break;
            }
            if f(pos)?.is_break() {
                break;
            }
        }

        Ok(())
    }

    fn task_mm(&self, proc: Process) -> IceResult<VirtualAddress> {
        let reader = self.kernel_reader();
        let mm = reader.read_pointer(proc.addr + self.offsets().task_struct_mm)?;
        if !mm.is_null() {
            return Ok(mm);
        }
        reader.read_pointer(proc.addr + self.offsets().task_struct_active_mm)
    }

    fn vcpu_reader(&self, vcpu: VcpuId) -> IceResult<Reader<C>> {
        let cr3 = self.vm.special_registers(vcpu)?.cr3;
        let pgd = MmuEntry(cr3).take_bits(12, 48);
        Ok(Reader::new(&self.vm, pgd))
    }

    fn vma_file_name(&self, vma: VirtualAddress) -> IceResult<Option<String>> {
        let offsets = self.offsets();
        let (Some(vma_file), Some(f_path), Some(path_dentry), Some(d_name), Some(qstr_name)) = (
            offsets.vma_file,
            offsets.file_f_path,
            offsets.path_dentry,
            offsets.dentry_d_name,
            offsets.qstr_name,
        ) else {
            return Ok(None);
        };

        let reader = self.kernel_reader();
        let file = reader.read_pointer(vma + vma_file)?;
        if file.is_null() {
            return Ok(None);
        }

        let dentry = reader.read_pointer(file + f_path + path_dentry)?;
        if dentry.is_null() {
            return Ok(None);
        }

        let name = reader.read_pointer(dentry + d_name + qstr_name)?;
        if name.is_null() {
            return Ok(None);
        }

        Ok(Some(reader.read_cstring(name, 0x100)?))
    }
}

impl<C: Channel> Buildable<C> for Linux<C> {
    fn quick_check(vm: &Vm<C>) -> Option<OsBuilder> {
        let kpgd = find_kernel_pgd(vm).ok()?;
        let banner = find_banner(vm, kpgd).ok()??;
        Some(OsBuilder {
            kpgd: Some(kpgd),
            kaslr: Some(banner),
            version: None,
            symbols: None,
            loader: None,
        })
    }

    fn build(vm: Vm<C>, builder: OsBuilder) -> IceResult<Self> {
        let kpgd = match builder.kpgd {
            Some(kpgd) => kpgd,
            None => find_kernel_pgd(&vm)?,
        };
        log::debug!("Found Linux PGD at 0x{kpgd:x}");

        let banner_addr = match builder.kaslr {
            Some(banner) => banner,
            None => find_banner(&vm, kpgd)?
                .ok_or_else(|| IceError::new("could not find the Linux banner"))?,
        };

        let symbols = builder.symbols.unwrap_or_default();
        let kernel = symbols.require("vmlinux")?;
        let profile = Profile::new(kernel)?;

        let kaslr = banner_addr.0.overflowing_sub(profile.fast_syms.linux_banner).0 as i64;
        log::info!("Found Linux banner at 0x{banner_addr:x} (kaslr {kaslr:#x})");

        Ok(Linux {
            vm,
            profile,
            kpgd,
            kaslr,
        })
    }
}

impl<C: Channel> ibc::Os for Linux<C> {
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
        Ok(Process::new(self.slide(self.profile.fast_syms.init_task)))
    }

    fn current_thread(&self, vcpu: VcpuId) -> IceResult<Thread> {
        let per_cpu = self
            .vm
            .kernel_per_cpu(vcpu)?
            .ok_or_else(|| IceError::new("failed to get the per-cpu area"))?;

        let syms = &self.profile.fast_syms;
        let current_task = per_cpu + (syms.current_task - syms.per_cpu_start);
        let task = self.kernel_reader().read_pointer(current_task)?;
        Ok(Thread::new(task))
    }

    fn for_each_process(
        &self,
        f: &mut dyn FnMut(Process) -> IceResult<ControlFlow<()>>,
    ) -> IceResult<()> {
        let init = self.init_process()?;
        if f(init)?.is_break() {
            return Ok(());
        }

        let tasks = self.offsets().task_struct_tasks;
        self.iterate_list(init.addr + tasks, &mut |node| f(Process::new(node - tasks)))
    }

    fn process_id(&self, proc: Process) -> IceResult<u64> {
        let tgid = self
            .kernel_reader()
            .read_u32(proc.addr + self.offsets().task_struct_tgid)?;
        Ok(tgid as u64)
    }

    fn process_name(&self, proc: Process) -> IceResult<String> {
        let mut comm = [0u8; 16];
        self.kernel_reader()
            .read(proc.addr + self.offsets().task_struct_comm, &mut comm)?;

        let len = memchr::memchr(0, &comm).unwrap_or(comm.len());
        Ok(String::from_utf8_lossy(&comm[..len]).into_owned())
    }

    fn process_parent(&self, proc: Process) -> IceResult<Process> {
        let parent = self
            .kernel_reader()
            .read_pointer(proc.addr + self.offsets().task_struct_real_parent)?;
        Ok(if parent.is_null() {
            proc
        } else {
            Process::new(parent)
        })
    }

    fn process_pgd(&self, proc: Process) -> IceResult<PhysicalAddress> {
        let mm = self.task_mm(proc)?;
        if mm.is_null() {
            return Ok(self.kpgd);
        }

        let pgd = self
            .kernel_reader()
            .read_pointer(mm + self.offsets().mm_struct_pgd)?;
        match self.vm.virtual_to_physical(self.kpgd, pgd) {
            Ok(phys) => Ok(phys),
            Err(_) => Err(IceError::unmapped_page(pgd)),
        }
    }

    fn process_is_kernel(&self, proc: Process) -> IceResult<bool> {
        let mm = self
            .kernel_reader()
            .read_pointer(proc.addr + self.offsets().task_struct_mm)?;
        Ok(mm.is_null())
    }

    fn process_is_32bit(&self, _proc: Process) -> IceResult<bool> {
        Ok(false)
    }

    fn process_for_each_thread(
        &self,
        proc: Process,
        f: &mut dyn FnMut(Thread) -> IceResult<ControlFlow<()>>,
    ) -> IceResult<()> {
        let leader = self
            .kernel_reader()
            .read_pointer(proc.addr + self.offsets().task_struct_group_leader)?;
        let leader = if leader.is_null() { proc.addr } else { leader };

        if f(Thread::new(leader))?.is_break() {
            return Ok(());
        }

        let thread_group = self.offsets().task_struct_thread_group;
        self.iterate_list(leader + thread_group, &mut |node| {
            f(Thread::new(node - thread_group))
        })
    }

    fn process_for_each_module(
        &self,
        proc: Process,
        f: &mut dyn FnMut(Module) -> IceResult<ControlFlow<()>>,
    ) -> IceResult<()> {
        let offsets = self.offsets();
        let (Some(mmap), Some(vma_next), Some(vma_pgoff), Some(vma_file)) = (
            offsets.mm_struct_mmap,
            offsets.vma_next,
            offsets.vma_pgoff,
            offsets.vma_file,
        ) else {
            // Maple-tree kernels dropped the linear VMA list
            return Err(IceError::unsupported());
        };

        let mm = self.task_mm(proc)?;
        if mm.is_null() {
            return Ok(());
        }

        let reader = self.kernel_reader();
        let mut vma = reader.read_pointer(mm + mmap)?;

        while !vma.is_null() {
            // Only the head segment of a mapped file starts a module; the
            // data segments of the same file carry a non-zero page offset
            let file = reader.read_pointer(vma + vma_file)?;
            let pgoff = reader.read_u64(vma + vma_pgoff)?;
            if !file.is_null() && pgoff == 0 && f(Module::new(vma))?.is_break() {
                break;
            }
            vma = reader.read_pointer(vma + vma_next)?;
        }

        Ok(())
    }

    fn module_name(&self, module: Module, _proc: Process) -> IceResult<String> {
        match self.vma_file_name(module.addr)? {
            Some(name) => Ok(name),
            None => Err(IceError::unsupported()),
        }
    }

    fn module_span(
        &self,
        module: Module,
        _proc: Process,
    ) -> IceResult<(VirtualAddress, VirtualAddress)> {
        let offsets = self.offsets();
        let (Some(vma_start), Some(vma_end), Some(vma_next), Some(vma_file)) = (
            offsets.vma_start,
            offsets.vma_end,
            offsets.vma_next,
            offsets.vma_file,
        ) else {
            return Err(IceError::unsupported());
        };

        let reader = self.kernel_reader();
        let file = reader.read_pointer(module.addr + vma_file)?;
        let start = reader.read_pointer(module.addr + vma_start)?;

        // A module spans every following VMA backed by the same file
        let mut current = module.addr;
        loop {
            let next = reader.read_pointer(current + vma_next)?;

            if next.is_null() || reader.read_pointer(next + vma_file)? != file {
                let end = reader.read_pointer(current + vma_end)?;
                break Ok((start, end));
            }

            current = next;
        }
    }

    fn for_each_driver(
        &self,
        f: &mut dyn FnMut(Driver) -> IceResult<ControlFlow<()>>,
    ) -> IceResult<()> {
        let Some(modules) = self.profile.fast_syms.modules else {
            return Err(IceError::missing_symbol("modules"));
        };
        let Some(list) = self.offsets().module_list else {
            return Err(IceError::missing_field("list", "module"));
        };

        self.iterate_list(self.slide(modules), &mut |node| f(Driver::new(node - list)))
    }

    fn driver_name(&self, driver: Driver) -> IceResult<String> {
        let Some(name) = self.offsets().module_name else {
            return Err(IceError::missing_field("name", "module"));
        };
        self.kernel_reader().read_cstring(driver.addr + name, 56)
    }

    fn driver_span(&self, driver: Driver) -> IceResult<(VirtualAddress, VirtualAddress)> {
        let offsets = self.offsets();
        let (Some(core_layout), Some(base), Some(size)) = (
            offsets.module_core_layout,
            offsets.module_layout_base,
            offsets.module_layout_size,
        ) else {
            return Err(IceError::unsupported());
        };

        let reader = self.kernel_reader();
        let layout = driver.addr + core_layout;
        let start = reader.read_pointer(layout + base)?;
        let len = reader.read_u32(layout + size)? as u64;
        Ok((start, start + len))
    }

    fn thread_process(&self, thread: Thread) -> IceResult<Process> {
        let leader = self
            .kernel_reader()
            .read_pointer(thread.addr + self.offsets().task_struct_group_leader)?;
        Ok(if leader.is_null() {
            Process::new(thread.addr)
        } else {
            Process::new(leader)
        })
    }

    fn thread_id(&self, thread: Thread) -> IceResult<u64> {
        let pid = self
            .kernel_reader()
            .read_u32(thread.addr + self.offsets().task_struct_pid)?;
        Ok(pid as u64)
    }

    fn thread_name(&self, thread: Thread) -> IceResult<Option<String>> {
        self.process_name(Process::new(thread.addr)).map(Some)
    }

    fn read_arg(&self, vcpu: VcpuId, index: usize) -> IceResult<u64> {
        match CallConvention::SysVAmd64.arg_location(index) {
            ArgLoc::Reg(reg) => self.vm.read_register(vcpu, reg),
            ArgLoc::Stack(offset) => {
                let rsp = self.vm.registers(vcpu)?.rsp;
                self.vcpu_reader(vcpu)?
                    .read_u64(VirtualAddress(rsp) + offset)
            }
        }
    }

    fn write_arg(&self, vcpu: VcpuId, index: usize, value: u64) -> IceResult<()> {
        match CallConvention::SysVAmd64.arg_location(index) {
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
        _proc: Process,
        module: &str,
        name: &str,
    ) -> IceResult<VirtualAddress> {
        if module != "vmlinux" && module != "kernel" {
            return Err(IceError::missing_module(module));
        }

        let offset = self.profile.syms.require_symbol(name)?;
        Ok(self.slide(offset))
    }
}

impl<C: Channel> ResolveThread for Linux<C> {
    fn current_thread_id(&self, vcpu: VcpuId) -> IceResult<u64> {
        use ibc::Os;
        Ok(self.current_thread(vcpu)?.id)
    }
}

impl<C: Channel + 'static> OsVm<C> for Linux<C> {
    #[inline]
    fn vm(&self) -> &Vm<C> {
        &self.vm
    }
}

impl<C: Channel> std::fmt::Debug for Linux<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Linux")
            .field("kpgd", &format_args!("0x{:x}", self.kpgd))
            .field("kaslr", &format_args!("{:#x}", self.kaslr))
            .finish_non_exhaustive()
    }
}
