//! A fully synthetic guest: scripted channel, handcrafted page tables and
//! kernel object graphs, so the whole engine can be exercised hermetically.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use ibc::arch::x86_64::{Register, Registers, SpecialRegisters};
use ibc::symbols::{ModuleSymbols, ModuleSymbolsBuilder, SymbolLoader, SymbolsIndexer};
use ibc::{
    BreakpointKind, Channel, ChannelBreakpoint, ChannelError, ChannelResult, Event, IceResult,
    MemoryAccessError, MemoryAccessResult, PhysicalAddress, VcpuId, VirtualAddress,
};

pub const MEM_SIZE: usize = 0x80_0000;
pub const KPGD: u64 = 0x1000;

/// Base of the canonical kernel half mapping (phys `x` at `KMAP + x`).
pub const KMAP: u64 = 0xffff_8000_0000_0000;
/// Kernel text mapping used by the Linux fixture.
pub const KTEXT: u64 = 0xffff_ffff_8000_0000;

struct InstalledBp {
    phys: u64,
    original: u8,
    kind: BreakpointKind,
}

/// One scripted guest action: register writes applied when the event is
/// delivered.
pub struct Step {
    pub writes: Vec<(usize, Register, u64)>,
    pub event: Event,
}

struct Inner {
    mem: Vec<u8>,
    regs: Vec<Registers>,
    sregs: Vec<SpecialRegisters>,
    msrs: HashMap<(usize, u32), u64>,
    breakpoints: HashMap<u64, InstalledBp>,
    next_bp: u64,
    paused: bool,
    attached: bool,
    script: VecDeque<Step>,
}

/// Scripted stand-in for a debug-capable hypervisor.
pub struct FakeVm {
    inner: RefCell<Inner>,
}

impl FakeVm {
    pub fn new(mem: Vec<u8>, vcpus: usize) -> Self {
        FakeVm {
            inner: RefCell::new(Inner {
                mem,
                regs: vec![bytemuck::Zeroable::zeroed(); vcpus],
                sregs: vec![bytemuck::Zeroable::zeroed(); vcpus],
                msrs: HashMap::new(),
                breakpoints: HashMap::new(),
                next_bp: 1,
                paused: false,
                attached: true,
                script: VecDeque::new(),
            }),
        }
    }

    pub fn set_regs(&self, vcpu: usize, f: impl FnOnce(&mut Registers)) {
        f(&mut self.inner.borrow_mut().regs[vcpu]);
    }

    pub fn set_sregs(&self, vcpu: usize, f: impl FnOnce(&mut SpecialRegisters)) {
        f(&mut self.inner.borrow_mut().sregs[vcpu]);
    }

    pub fn poke(&self, phys: u64, bytes: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        inner.mem[phys as usize..phys as usize + bytes.len()].copy_from_slice(bytes);
    }

    pub fn poke_u64(&self, phys: u64, value: u64) {
        self.poke(phys, &value.to_le_bytes());
    }

    pub fn byte_at(&self, phys: u64) -> u8 {
        self.inner.borrow().mem[phys as usize]
    }

    pub fn breakpoint_count(&self) -> usize {
        self.inner.borrow().breakpoints.len()
    }

    pub fn script_event(&self, writes: Vec<(usize, Register, u64)>, event: Event) {
        self.inner
            .borrow_mut()
            .script
            .push_back(Step { writes, event });
    }

    pub fn hit(&self, phys: u64, writes: Vec<(usize, Register, u64)>) {
        self.script_event(
            writes,
            Event::Breakpoint(ibc::BreakpointHit {
                phys_addr: PhysicalAddress(phys),
                vcpu: VcpuId(0),
            }),
        );
    }
}

impl Channel for FakeVm {
    fn vcpus_count(&self) -> usize {
        self.inner.borrow().regs.len()
    }

    fn memory_size(&self) -> u64 {
        self.inner.borrow().mem.len() as u64
    }

    fn pause(&self) -> ChannelResult<()> {
        self.inner.borrow_mut().paused = true;
        Ok(())
    }

    fn resume(&self) -> ChannelResult<()> {
        self.inner.borrow_mut().paused = false;
        Ok(())
    }

    fn step_once(&self, _vcpu: VcpuId) -> ChannelResult<()> {
        Ok(())
    }

    fn registers(&self, vcpu: VcpuId) -> ChannelResult<Registers> {
        self.inner
            .borrow()
            .regs
            .get(vcpu.0)
            .copied()
            .ok_or(ChannelError::InvalidAddress)
    }

    fn special_registers(&self, vcpu: VcpuId) -> ChannelResult<SpecialRegisters> {
        self.inner
            .borrow()
            .sregs
            .get(vcpu.0)
            .copied()
            .ok_or(ChannelError::InvalidAddress)
    }

    fn read_register(&self, vcpu: VcpuId, register: Register) -> ChannelResult<u64> {
        Ok(self.registers(vcpu)?.get(register))
    }

    fn write_register(&self, vcpu: VcpuId, register: Register, value: u64) -> ChannelResult<()> {
        let mut inner = self.inner.borrow_mut();
        let regs = inner
            .regs
            .get_mut(vcpu.0)
            .ok_or(ChannelError::InvalidAddress)?;
        regs.set(register, value);
        Ok(())
    }

    fn read_msr(&self, vcpu: VcpuId, msr: u32) -> ChannelResult<u64> {
        Ok(*self
            .inner
            .borrow()
            .msrs
            .get(&(vcpu.0, msr))
            .unwrap_or(&0))
    }

    fn write_msr(&self, vcpu: VcpuId, msr: u32, value: u64) -> ChannelResult<()> {
        self.inner.borrow_mut().msrs.insert((vcpu.0, msr), value);
        Ok(())
    }

    fn read_physical(&self, addr: PhysicalAddress, buf: &mut [u8]) -> MemoryAccessResult<()> {
        let inner = self.inner.borrow();
        let start = addr.0 as usize;
        let end = start + buf.len();
        if end > inner.mem.len() {
            return Err(MemoryAccessError::OutOfBounds);
        }
        buf.copy_from_slice(&inner.mem[start..end]);
        Ok(())
    }

    fn write_physical(&self, addr: PhysicalAddress, buf: &[u8]) -> MemoryAccessResult<()> {
        let mut inner = self.inner.borrow_mut();
        let start = addr.0 as usize;
        let end = start + buf.len();
        if end > inner.mem.len() {
            return Err(MemoryAccessError::OutOfBounds);
        }
        inner.mem[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn add_breakpoint(
        &self,
        addr: PhysicalAddress,
        kind: BreakpointKind,
    ) -> ChannelResult<ChannelBreakpoint> {
        let mut inner = self.inner.borrow_mut();
        if addr.0 as usize >= inner.mem.len() {
            return Err(ChannelError::InvalidAddress);
        }

        let id = inner.next_bp;
        inner.next_bp += 1;

        let original = inner.mem[addr.0 as usize];
        if kind == BreakpointKind::SoftExec {
            inner.mem[addr.0 as usize] = 0xcc;
        }
        inner.breakpoints.insert(
            id,
            InstalledBp {
                phys: addr.0,
                original,
                kind,
            },
        );
        Ok(ChannelBreakpoint(id))
    }

    fn remove_breakpoint(&self, breakpoint: ChannelBreakpoint) -> ChannelResult<()> {
        let mut inner = self.inner.borrow_mut();
        let bp = inner
            .breakpoints
            .remove(&breakpoint.0)
            .ok_or(ChannelError::InvalidAddress)?;
        if bp.kind == BreakpointKind::SoftExec {
            inner.mem[bp.phys as usize] = bp.original;
        }
        Ok(())
    }

    fn wait_for_event(&self, _timeout: Duration) -> ChannelResult<Event> {
        let mut inner = self.inner.borrow_mut();
        match inner.script.pop_front() {
            Some(step) => {
                for (vcpu, register, value) in step.writes {
                    inner.regs[vcpu].set(register, value);
                }
                inner.paused = true;
                Ok(step.event)
            }
            None => Ok(Event::Timeout),
        }
    }

    fn detach(&self) -> ChannelResult<()> {
        self.inner.borrow_mut().attached = false;
        Ok(())
    }
}

/// Long-mode page tables mapping phys `0..8M` three times: identity (user),
/// at `KMAP` and at `KTEXT`, all through shared 2M entries.
pub fn build_page_tables(mem: &mut [u8]) {
    let entry = |addr: u64, flags: u64| (addr | flags).to_le_bytes();
    let write = |mem: &mut [u8], at: usize, value: [u8; 8]| {
        mem[at..at + 8].copy_from_slice(&value);
    };

    // PML4 at 0x1000
    write(mem, 0x1000, entry(0x2000, 3)); // [0] user identity
    write(mem, 0x1000 + 256 * 8, entry(0x2000, 3)); // [256] KMAP
    write(mem, 0x1000 + 511 * 8, entry(0x4000, 3)); // [511] KTEXT
    // PDPT at 0x2000 for the low mappings
    write(mem, 0x2000, entry(0x3000, 3));
    // PDPT at 0x4000 for KTEXT (index 510 of that PML4 slot)
    write(mem, 0x4000 + 510 * 8, entry(0x3000, 3));
    // PD at 0x3000: four 2M pages
    for i in 0..4u64 {
        write(mem, (0x3000 + i * 8) as usize, entry(i << 21, 3 | (1 << 7)));
    }
}

/// Serves prebuilt symbol modules by name, consuming each once.
pub struct TestLoader {
    modules: RefCell<Vec<(String, Option<ModuleSymbols>)>>,
}

impl TestLoader {
    pub fn new(modules: Vec<(&str, ModuleSymbols)>) -> Self {
        TestLoader {
            modules: RefCell::new(
                modules
                    .into_iter()
                    .map(|(name, syms)| (name.to_owned(), Some(syms)))
                    .collect(),
            ),
        }
    }
}

impl SymbolLoader for TestLoader {
    fn load(&self, name: &str, _id: &str) -> IceResult<Option<ModuleSymbols>> {
        let mut modules = self.modules.borrow_mut();
        Ok(modules
            .iter_mut()
            .find(|(n, _)| n == name)
            .and_then(|(_, syms)| syms.take()))
    }
}

pub mod nt {
    use super::*;
    use icebox::os::{OsBuilder, Windows};
    use icebox::state::Vm;
    use std::rc::Rc;

    // Kernel image
    pub const KERNEL_PHYS: u64 = 0x10_0000;
    pub const KERNEL_BASE: u64 = KMAP + KERNEL_PHYS;
    const PS_ACTIVE_HEAD: u64 = 0x2000;
    const PS_INITIAL_SYSTEM: u64 = 0x2100;
    const PS_LOADED_LIST: u64 = 0x2200;

    // Kernel objects (physical)
    pub const IDLE_EPROC: u64 = 0x20_0000;
    pub const SYSTEM_EPROC: u64 = 0x20_1000;
    pub const NOTEPAD_EPROC: u64 = 0x20_2000;
    pub const NOTEPAD_THREAD: u64 = 0x20_3000;
    pub const SYSTEM_THREAD: u64 = 0x20_4000;
    pub const KPCR: u64 = 0x20_5000;

    // User space of notepad (identity mapped)
    const PEB: u64 = 0x30_0000;
    const LDR_DATA: u64 = 0x30_1000;
    const NTDLL_ENTRY: u64 = 0x30_2000;
    const NTDLL_NAME: u64 = 0x30_3000;
    pub const NTDLL_BASE: u64 = 0x40_0000;
    pub const NTDLL_SIZE: u64 = 0x3000;

    pub const ALLOC_FN: u64 = NTDLL_BASE + 0x500;
    pub const PSP_EXIT: u64 = KERNEL_PHYS + 0x3000;
    pub const RET_SITE: u64 = 0x50_0000;
    pub const STACK_TOP: u64 = 0x60_0800;
    pub const HEAP_HANDLE: u64 = 0xdead_0000;

    pub const NOTEPAD_TID: u64 = 0x1234;

    // Synthetic _EPROCESS layout
    const EP_DTB: u64 = 0x28; // Pcb (at 0) + DirectoryTableBase
    const EP_PID: u64 = 0x440;
    const EP_LINKS: u64 = 0x448;
    const EP_PPID: u64 = 0x540;
    const EP_PEB: u64 = 0x550;
    const EP_NAME: u64 = 0x5a8;
    const EP_THREADS: u64 = 0x5e0;

    // Synthetic _ETHREAD layout
    const ET_KPROC: u64 = 0x220; // Tcb (at 0) + Process
    const ET_CID: u64 = 0x478;
    const ET_LINKS: u64 = 0x4e8;

    const KPCR_PRCB: u64 = 0x180;
    const KPRCB_CURRENT: u64 = 0x8;

    pub fn kernel_symbols() -> ModuleSymbols {
        let mut b = ModuleSymbolsBuilder::with_identity("ntkrnlmp.pdb", "TESTKERNEL1");
        b.push(VirtualAddress(PS_ACTIVE_HEAD), "PsActiveProcessHead");
        b.push(VirtualAddress(PS_INITIAL_SYSTEM), "PsInitialSystemProcess");
        b.push(VirtualAddress(PS_LOADED_LIST), "PsLoadedModuleList");
        b.push(VirtualAddress(PSP_EXIT - KERNEL_PHYS), "PspExitThread");

        b.add_struc("_LIST_ENTRY", 0x10, [("Flink", 0u64), ("Blink", 8)]);
        b.add_struc(
            "_UNICODE_STRING",
            0x10,
            [("Length", 0u64), ("MaximumLength", 2), ("Buffer", 8)],
        );
        b.add_struc("_KPCR", 0x8000, [("Prcb", KPCR_PRCB)]);
        b.add_struc("_KPRCB", 0x8000, [("CurrentThread", KPRCB_CURRENT)]);
        b.add_struc("_KPROCESS", 0x438, [("DirectoryTableBase", EP_DTB)]);
        b.add_struc(
            "_EPROCESS",
            0x700,
            [
                ("Pcb", 0u64),
                ("UniqueProcessId", EP_PID),
                ("ActiveProcessLinks", EP_LINKS),
                ("InheritedFromUniqueProcessId", EP_PPID),
                ("Peb", EP_PEB),
                ("ImageFileName", EP_NAME),
                ("ThreadListHead", EP_THREADS),
            ],
        );
        b.add_struc("_KTHREAD", 0x430, [("Process", ET_KPROC)]);
        b.add_struc(
            "_CLIENT_ID",
            0x10,
            [("UniqueProcess", 0u64), ("UniqueThread", 8)],
        );
        b.add_struc(
            "_ETHREAD",
            0x600,
            [("Tcb", 0u64), ("Cid", ET_CID), ("ThreadListEntry", ET_LINKS)],
        );
        b.add_struc("_PEB", 0x2c0, [("Ldr", 0x18u64)]);
        b.add_struc("_PEB_LDR_DATA", 0x58, [("InLoadOrderModuleList", 0x10u64)]);
        b.add_struc(
            "_LDR_DATA_TABLE_ENTRY",
            0x98,
            [
                ("InLoadOrderLinks", 0u64),
                ("DllBase", 0x30),
                ("SizeOfImage", 0x40),
                ("FullDllName", 0x48),
                ("BaseDllName", 0x58),
            ],
        );
        b.build()
    }

    pub fn ntdll_symbols() -> ModuleSymbols {
        let mut b = ModuleSymbolsBuilder::with_identity("ntdll.pdb", "TESTNTDLL1");
        b.push(VirtualAddress(0x500), "RtlpAllocateHeapInternal");
        b.push(VirtualAddress(0x600), "RtlFreeHeap");
        b.push(VirtualAddress(0x700), "RtlSizeHeap");
        b.push(VirtualAddress(0x800), "RtlpReAllocateHeapInternal");
        b.push(VirtualAddress(0x900), "RtlSetUserValueHeap");
        b.push(VirtualAddress(0xa00), "RtlGetUserInfoHeap");
        b.build()
    }

    fn write_eprocess(vm: &FakeVm, at: u64, pid: u64, ppid: u64, name: &[u8], peb: u64) {
        vm.poke_u64(at + EP_DTB, KPGD);
        vm.poke_u64(at + EP_PID, pid);
        vm.poke_u64(at + EP_PPID, ppid);
        vm.poke_u64(at + EP_PEB, peb);
        vm.poke(at + EP_NAME, name);
        // Empty thread list
        vm.poke_u64(at + EP_THREADS, KMAP + at + EP_THREADS);
        vm.poke_u64(at + EP_THREADS + 8, KMAP + at + EP_THREADS);
    }

    fn link(vm: &FakeVm, from_phys: u64, to_phys: u64) {
        vm.poke_u64(from_phys, KMAP + to_phys); // Flink
        vm.poke_u64(to_phys + 8, KMAP + from_phys); // Blink
    }

    fn write_utf16(vm: &FakeVm, at: u64, text: &str) -> u16 {
        let mut len = 0;
        for (i, unit) in text.encode_utf16().enumerate() {
            vm.poke(at + 2 * i as u64, &unit.to_le_bytes());
            len += 2;
        }
        vm.poke(at + len, &[0, 0]);
        len as u16
    }

    /// A complete paused NT guest with Idle, System and notepad.exe.
    pub fn build() -> Rc<Windows<FakeVm>> {
        let mut mem = vec![0u8; MEM_SIZE];
        build_page_tables(&mut mem);
        let vm = FakeVm::new(mem, 1);

        vm.set_sregs(0, |sregs| {
            sregs.cr0 = 1 | (1 << 31);
            sregs.cr3 = KPGD;
            sregs.cr4 = 1 << 5;
            sregs.efer = (1 << 8) | (1 << 10);
            sregs.gs.base = KMAP + KPCR;
            sregs.kernel_gs_base = 0;
        });

        // Process list: head <-> Idle <-> System <-> notepad
        let head = KERNEL_PHYS + PS_ACTIVE_HEAD;
        write_eprocess(&vm, IDLE_EPROC, 0, 0, b"Idle\0", 0);
        write_eprocess(&vm, SYSTEM_EPROC, 4, 0, b"System\0", 0);
        write_eprocess(&vm, NOTEPAD_EPROC, 0x30, 4, b"notepad.exe\0", PEB);
        link(&vm, head, IDLE_EPROC + EP_LINKS);
        link(&vm, IDLE_EPROC + EP_LINKS, SYSTEM_EPROC + EP_LINKS);
        link(&vm, SYSTEM_EPROC + EP_LINKS, NOTEPAD_EPROC + EP_LINKS);
        link(&vm, NOTEPAD_EPROC + EP_LINKS, head);

        vm.poke_u64(KERNEL_PHYS + PS_INITIAL_SYSTEM, KMAP + SYSTEM_EPROC);
        // Empty driver list
        link(
            &vm,
            KERNEL_PHYS + PS_LOADED_LIST,
            KERNEL_PHYS + PS_LOADED_LIST,
        );

        // Threads
        vm.poke_u64(NOTEPAD_THREAD + ET_KPROC, KMAP + NOTEPAD_EPROC);
        vm.poke_u64(NOTEPAD_THREAD + ET_CID, 0x30);
        vm.poke_u64(NOTEPAD_THREAD + ET_CID + 8, NOTEPAD_TID);
        link(
            &vm,
            NOTEPAD_EPROC + EP_THREADS,
            NOTEPAD_THREAD + ET_LINKS,
        );
        link(&vm, NOTEPAD_THREAD + ET_LINKS, NOTEPAD_EPROC + EP_THREADS);

        vm.poke_u64(SYSTEM_THREAD + ET_KPROC, KMAP + SYSTEM_EPROC);
        vm.poke_u64(SYSTEM_THREAD + ET_CID, 4);
        vm.poke_u64(SYSTEM_THREAD + ET_CID + 8, 8);
        link(&vm, SYSTEM_EPROC + EP_THREADS, SYSTEM_THREAD + ET_LINKS);
        link(&vm, SYSTEM_THREAD + ET_LINKS, SYSTEM_EPROC + EP_THREADS);

        // Current thread: notepad's
        vm.poke_u64(
            KPCR + KPCR_PRCB + KPRCB_CURRENT,
            KMAP + NOTEPAD_THREAD,
        );

        // notepad's loader list with one entry: ntdll.dll
        vm.poke_u64(PEB + 0x18, LDR_DATA);
        link_user(&vm, LDR_DATA + 0x10, NTDLL_ENTRY);
        link_user(&vm, NTDLL_ENTRY, LDR_DATA + 0x10);
        vm.poke_u64(NTDLL_ENTRY + 0x30, NTDLL_BASE);
        vm.poke(NTDLL_ENTRY + 0x40, &(NTDLL_SIZE as u32).to_le_bytes());
        let len = write_utf16(&vm, NTDLL_NAME, "ntdll.dll");
        for field in [0x48u64, 0x58] {
            vm.poke(NTDLL_ENTRY + field, &len.to_le_bytes());
            vm.poke_u64(NTDLL_ENTRY + field + 8, NTDLL_NAME);
        }

        // ntdll image: MZ header and a CodeView record naming ntdll.pdb
        vm.poke(NTDLL_BASE, b"MZ");
        vm.poke(NTDLL_BASE + 0x100, b"RSDS");
        vm.poke(NTDLL_BASE + 0x104, &[0x11u8; 16]);
        vm.poke(NTDLL_BASE + 0x114, &1u32.to_le_bytes());
        vm.poke(NTDLL_BASE + 0x118, b"ntdll.pdb\0");

        // The caller's stack: return address on top
        vm.poke_u64(STACK_TOP, RET_SITE);

        let loader = TestLoader::new(vec![
            ("ntkrnlmp.pdb", kernel_symbols()),
            ("ntdll.pdb", ntdll_symbols()),
        ]);

        let vm = Vm::new(vm).expect("failed to attach");
        let os = OsBuilder::new()
            .with_kpgd(PhysicalAddress(KPGD))
            .with_kaslr(VirtualAddress(KERNEL_BASE))
            .with_version("TESTKERNEL1".into())
            .with_loader(Box::new(loader))
            .build(vm)
            .expect("failed to build the NT backend");
        Rc::new(os)
    }

    fn link_user(vm: &FakeVm, from_phys: u64, to_phys: u64) {
        vm.poke_u64(from_phys, to_phys); // Flink, identity mapped
        vm.poke_u64(to_phys + 8, from_phys); // Blink
    }
}

pub mod linux {
    use super::*;
    use icebox::os::{Linux, OsBuilder};
    use icebox::state::Vm;
    use std::rc::Rc;

    pub const BANNER_PHYS: u64 = 0x10_0100;
    pub const INIT_TASK: u64 = 0x18_0000;
    pub const BASH_TASK: u64 = 0x19_0000;
    pub const BASH_MM: u64 = 0x1a_0000;
    pub const PER_CPU: u64 = 0x22_0000;
    pub const OPENAT_PHYS: u64 = 0x15_0000;
    pub const DO_EXIT_PHYS: u64 = 0x15_1000;
    pub const FILENAME: u64 = 0x70_0000;

    // A two-segment shared library plus an anonymous mapping
    const LIB_TEXT_VMA: u64 = 0x1b_0000;
    const LIB_DATA_VMA: u64 = 0x1b_1000;
    const ANON_VMA: u64 = 0x1b_2000;
    const LIB_FILE: u64 = 0x1c_0000;
    const LIB_DENTRY: u64 = 0x1c_1000;
    const LIB_NAME: u64 = 0x1c_2000;
    pub const LIB_BASE: u64 = 0x40_0000;
    pub const LIB_END: u64 = 0x40_3000;

    // One loaded kernel module
    const MODULES_HEAD: u64 = 0x1d_0000;
    const FAKEMOD: u64 = 0x1d_1000;
    pub const FAKEMOD_BASE: u64 = KTEXT + 0x16_0000;
    pub const FAKEMOD_SIZE: u64 = 0x2000;

    const CURRENT_TASK: u64 = 0x16d00;

    // task_struct offsets
    const TS_TASKS: u64 = 0x398;
    const TS_MM: u64 = 0x3f8;
    const TS_ACTIVE_MM: u64 = 0x400;
    const TS_PID: u64 = 0x4e8;
    const TS_TGID: u64 = 0x4ec;
    const TS_PARENT: u64 = 0x518;
    const TS_LEADER: u64 = 0x528;
    const TS_THREAD_GROUP: u64 = 0x5c8;
    const TS_COMM: u64 = 0x660;

    const MM_PGD: u64 = 0x48;
    const MM_MMAP: u64 = 0x20;

    // vm_area_struct and the dentry chain behind vm_file
    const VMA_START: u64 = 0;
    const VMA_END: u64 = 8;
    const VMA_NEXT: u64 = 0x10;
    const VMA_PGOFF: u64 = 0x50;
    const VMA_FILE: u64 = 0x90;
    const FILE_F_PATH: u64 = 0x10;
    const PATH_DENTRY: u64 = 8;
    const DENTRY_D_NAME: u64 = 0x20;
    const QSTR_NAME: u64 = 8;

    // struct module
    const MOD_LIST: u64 = 0x8;
    const MOD_NAME: u64 = 0x18;
    const MOD_CORE_LAYOUT: u64 = 0x140;
    const LAYOUT_BASE: u64 = 0;
    const LAYOUT_SIZE: u64 = 8;

    pub fn vmlinux_symbols() -> ModuleSymbols {
        let mut b = ModuleSymbolsBuilder::with_identity("vmlinux", "testbuildid");
        b.push(VirtualAddress(KTEXT + BANNER_PHYS), "linux_banner");
        b.push(VirtualAddress(KTEXT + INIT_TASK), "init_task");
        b.push(VirtualAddress(0), "__per_cpu_start");
        b.push(VirtualAddress(CURRENT_TASK), "current_task");
        b.push(VirtualAddress(KTEXT + OPENAT_PHYS), "__x64_sys_openat");
        b.push(VirtualAddress(KTEXT + DO_EXIT_PHYS), "do_exit");
        b.push(VirtualAddress(KTEXT + MODULES_HEAD), "modules");

        b.add_struc("list_head", 0x10, [("next", 0u64), ("prev", 8)]);
        b.add_struc(
            "task_struct",
            0xa00,
            [
                ("tasks", TS_TASKS),
                ("mm", TS_MM),
                ("active_mm", TS_ACTIVE_MM),
                ("pid", TS_PID),
                ("tgid", TS_TGID),
                ("real_parent", TS_PARENT),
                ("group_leader", TS_LEADER),
                ("thread_group", TS_THREAD_GROUP),
                ("comm", TS_COMM),
            ],
        );
        b.add_struc("mm_struct", 0x500, [("mmap", MM_MMAP), ("pgd", MM_PGD)]);
        b.add_struc(
            "vm_area_struct",
            0xc8,
            [
                ("vm_start", VMA_START),
                ("vm_end", VMA_END),
                ("vm_next", VMA_NEXT),
                ("vm_pgoff", VMA_PGOFF),
                ("vm_file", VMA_FILE),
            ],
        );
        b.add_struc("file", 0x100, [("f_path", FILE_F_PATH)]);
        b.add_struc("path", 0x10, [("mnt", 0u64), ("dentry", PATH_DENTRY)]);
        b.add_struc("dentry", 0xc0, [("d_name", DENTRY_D_NAME)]);
        b.add_struc("qstr", 0x10, [("hash_len", 0u64), ("name", QSTR_NAME)]);
        b.add_struc(
            "module",
            0x300,
            [
                ("list", MOD_LIST),
                ("name", MOD_NAME),
                ("core_layout", MOD_CORE_LAYOUT),
            ],
        );
        b.add_struc(
            "module_layout",
            0x20,
            [("base", LAYOUT_BASE), ("size", LAYOUT_SIZE)],
        );
        b.build()
    }

    fn write_task(
        vm: &FakeVm,
        at: u64,
        pid: u32,
        comm: &[u8],
        mm: u64,
        parent: u64,
        leader: u64,
    ) {
        vm.poke(at + TS_PID, &pid.to_le_bytes());
        vm.poke(at + TS_TGID, &pid.to_le_bytes());
        vm.poke(at + TS_COMM, comm);
        vm.poke_u64(at + TS_MM, mm);
        vm.poke_u64(at + TS_ACTIVE_MM, mm);
        vm.poke_u64(at + TS_PARENT, parent);
        vm.poke_u64(at + TS_LEADER, leader);
        // Single-threaded: the ring points back at itself
        vm.poke_u64(at + TS_THREAD_GROUP, KTEXT + at + TS_THREAD_GROUP);
        vm.poke_u64(at + TS_THREAD_GROUP + 8, KTEXT + at + TS_THREAD_GROUP);
    }

    /// A complete paused Linux guest with init and one bash process.
    pub fn build() -> Rc<Linux<FakeVm>> {
        let mut mem = vec![0u8; MEM_SIZE];
        build_page_tables(&mut mem);
        let vm = FakeVm::new(mem, 1);

        vm.set_sregs(0, |sregs| {
            sregs.cr0 = 1 | (1 << 31);
            sregs.cr3 = KPGD;
            sregs.cr4 = 1 << 5;
            sregs.efer = (1 << 8) | (1 << 10);
            sregs.gs.base = KMAP + PER_CPU;
            sregs.kernel_gs_base = 0;
        });

        vm.poke(BANNER_PHYS, b"Linux version 5.10.0-test\0");

        write_task(&vm, INIT_TASK, 0, b"swapper/0\0", 0, KTEXT + INIT_TASK, KTEXT + INIT_TASK);
        write_task(
            &vm,
            BASH_TASK,
            651,
            b"bash\0",
            KTEXT + BASH_MM,
            KTEXT + INIT_TASK,
            KTEXT + BASH_TASK,
        );

        // tasks ring: init <-> bash
        vm.poke_u64(INIT_TASK + TS_TASKS, KTEXT + BASH_TASK + TS_TASKS);
        vm.poke_u64(BASH_TASK + TS_TASKS, KTEXT + INIT_TASK + TS_TASKS);

        // bash's page tables are the shared fixture tables
        vm.poke_u64(BASH_MM + MM_PGD, KMAP + KPGD);

        // bash's mappings: libtest.so as text + data segments, then an
        // anonymous region
        vm.poke_u64(BASH_MM + MM_MMAP, KTEXT + LIB_TEXT_VMA);

        vm.poke_u64(LIB_TEXT_VMA + VMA_START, LIB_BASE);
        vm.poke_u64(LIB_TEXT_VMA + VMA_END, LIB_BASE + 0x1000);
        vm.poke_u64(LIB_TEXT_VMA + VMA_NEXT, KTEXT + LIB_DATA_VMA);
        vm.poke_u64(LIB_TEXT_VMA + VMA_PGOFF, 0);
        vm.poke_u64(LIB_TEXT_VMA + VMA_FILE, KTEXT + LIB_FILE);

        vm.poke_u64(LIB_DATA_VMA + VMA_START, LIB_BASE + 0x1000);
        vm.poke_u64(LIB_DATA_VMA + VMA_END, LIB_END);
        vm.poke_u64(LIB_DATA_VMA + VMA_NEXT, KTEXT + ANON_VMA);
        vm.poke_u64(LIB_DATA_VMA + VMA_PGOFF, 1);
        vm.poke_u64(LIB_DATA_VMA + VMA_FILE, KTEXT + LIB_FILE);

        vm.poke_u64(ANON_VMA + VMA_START, 0x50_0000);
        vm.poke_u64(ANON_VMA + VMA_END, 0x50_1000);
        vm.poke_u64(ANON_VMA + VMA_NEXT, 0);
        vm.poke_u64(ANON_VMA + VMA_PGOFF, 0);
        vm.poke_u64(ANON_VMA + VMA_FILE, 0);

        // file -> path -> dentry -> qstr -> "libtest.so"
        vm.poke_u64(LIB_FILE + FILE_F_PATH + PATH_DENTRY, KTEXT + LIB_DENTRY);
        vm.poke_u64(LIB_DENTRY + DENTRY_D_NAME + QSTR_NAME, KTEXT + LIB_NAME);
        vm.poke(LIB_NAME, b"libtest.so\0");

        // One loaded kernel module
        vm.poke_u64(MODULES_HEAD, KTEXT + FAKEMOD + MOD_LIST);
        vm.poke_u64(FAKEMOD + MOD_LIST, KTEXT + MODULES_HEAD);
        vm.poke(FAKEMOD + MOD_NAME, b"fakemod\0");
        vm.poke_u64(FAKEMOD + MOD_CORE_LAYOUT + LAYOUT_BASE, FAKEMOD_BASE);
        vm.poke(
            FAKEMOD + MOD_CORE_LAYOUT + LAYOUT_SIZE,
            &(FAKEMOD_SIZE as u32).to_le_bytes(),
        );

        // Per-cpu current task
        vm.poke_u64(PER_CPU + CURRENT_TASK, KTEXT + BASH_TASK);

        vm.poke(FILENAME, b"/etc/hosts\0");

        let symbols = SymbolsIndexer::new();
        symbols.insert("vmlinux", Arc::new(vmlinux_symbols()));

        let vm = Vm::new(vm).expect("failed to attach");
        let os = OsBuilder::new()
            .with_kpgd(PhysicalAddress(KPGD))
            .with_symbols(symbols)
            .build(vm)
            .expect("failed to build the Linux backend");
        Rc::new(os)
    }
}
