//! Client side of the FDP shared-memory debug protocol.
//!
//! A debug-capable hypervisor exposes one POSIX shared-memory region per VM,
//! named `/FDP_<vm>`. The region starts with a fixed header, followed by a
//! command mailbox and a one-page data window. Requests are strictly
//! serialized: the client bumps `sequence`, the hypervisor processes the
//! command and echoes it into `ack`.

use std::cell::Cell;
use std::ffi::CString;
use std::time::Duration;
use std::{io, ptr};

use bytemuck::{Pod, Zeroable};

use ibc::arch::x86_64::{Register, Registers, SpecialRegisters};
use ibc::{
    BreakpointHit, BreakpointKind, Channel, ChannelBreakpoint, ChannelError, ChannelResult, Event,
    MemoryAccessError, MemoryAccessResult, PhysicalAddress, VcpuId, VirtualAddress,
};

const FDP_MAGIC: u64 = u64::from_le_bytes(*b"FDP_SHM1");
const FDP_VERSION: u32 = 1;

const DATA_SIZE: usize = 0x1000;
const SPIN_LIMIT: u64 = 500_000_000;

mod command {
    pub const PAUSE: u32 = 1;
    pub const RESUME: u32 = 2;
    pub const STEP: u32 = 3;
    pub const READ_REG: u32 = 4;
    pub const WRITE_REG: u32 = 5;
    pub const READ_MSR: u32 = 6;
    pub const WRITE_MSR: u32 = 7;
    pub const READ_PHYS: u32 = 8;
    pub const WRITE_PHYS: u32 = 9;
    pub const ADD_BP: u32 = 10;
    pub const REMOVE_BP: u32 = 11;
    pub const WAIT_EVENT: u32 = 12;
    pub const GET_REGS: u32 = 13;
    pub const GET_SREGS: u32 = 14;
}

mod status {
    pub const OK: u32 = 0;
    pub const INVALID_ADDRESS: u32 = 1;
    pub const VM_GONE: u32 = 2;
    pub const UNSUPPORTED: u32 = 3;
    pub const TIMEOUT: u32 = 4;
}

mod event_kind {
    pub const BREAKPOINT: u32 = 1;
    pub const SINGLE_STEP: u32 = 2;
    pub const PAGE_FAULT: u32 = 3;
    pub const INTERRUPT: u32 = 4;
    pub const CRASH: u32 = 5;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Header {
    magic: u64,
    version: u32,
    vcpu_count: u32,
    mem_size: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RawEvent {
    kind: u32,
    vcpu: u32,
    addr: u64,
    vector: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Mailbox {
    sequence: u64,
    ack: u64,
    command: u32,
    status: u32,
    vcpu: u32,
    register: u32,
    msr: u32,
    bp_kind: u32,
    addr: u64,
    length: u64,
    value: u64,
    bp_id: u64,
    timeout_ms: u64,
    event: RawEvent,
}

const HEADER_OFFSET: usize = 0;
const MAILBOX_OFFSET: usize = 0x40;
const DATA_OFFSET: usize = 0x100;
const MIN_REGION: usize = DATA_OFFSET + DATA_SIZE;

fn status_error(status: u32) -> ChannelError {
    match status {
        status::INVALID_ADDRESS => ChannelError::InvalidAddress,
        status::VM_GONE => ChannelError::VmGone,
        status::UNSUPPORTED => ChannelError::Unsupported,
        _ => ChannelError::CorruptFrame,
    }
}

/// An attached FDP client.
pub struct Fdp {
    map: *mut u8,
    map_len: usize,
    vcpu_count: usize,
    mem_size: u64,
    attached: Cell<bool>,
}

impl Fdp {
    /// Opens the shared region of the named VM.
    pub fn attach(name: &str) -> ChannelResult<Fdp> {
        let shm_name = CString::new(format!("/FDP_{name}"))
            .map_err(|_| ChannelError::InvalidAddress)?;

        let fd = unsafe { libc::shm_open(shm_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let map = (|| {
            let mut stat: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut stat) } < 0 {
                return Err(io::Error::last_os_error());
            }
            let map_len = stat.st_size as usize;
            if map_len < MIN_REGION {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "FDP region too small",
                ));
            }

            let map = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    map_len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                )
            };
            if map == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok((map.cast::<u8>(), map_len))
        })();
        unsafe { libc::close(fd) };
        let (map, map_len) = map?;

        let mut this = Fdp {
            map,
            map_len,
            vcpu_count: 0,
            mem_size: 0,
            attached: Cell::new(true),
        };

        let header: Header = unsafe { this.read_at(HEADER_OFFSET) };
        if header.magic != FDP_MAGIC || header.version != FDP_VERSION {
            return Err(ChannelError::CorruptFrame);
        }

        log::info!(
            "Attached to \"{name}\": {} vCPUs, 0x{:x} bytes of memory",
            header.vcpu_count,
            header.mem_size
        );

        this.vcpu_count = header.vcpu_count as usize;
        this.mem_size = header.mem_size;
        Ok(this)
    }

    unsafe fn read_at<T: Pod>(&self, offset: usize) -> T {
        debug_assert!(offset + std::mem::size_of::<T>() <= self.map_len);
        unsafe { ptr::read_volatile(self.map.add(offset).cast()) }
    }

    unsafe fn write_at<T: Pod>(&self, offset: usize, value: T) {
        debug_assert!(offset + std::mem::size_of::<T>() <= self.map_len);
        unsafe { ptr::write_volatile(self.map.add(offset).cast(), value) }
    }

    fn read_data(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() <= DATA_SIZE);
        unsafe {
            ptr::copy_nonoverlapping(self.map.add(DATA_OFFSET), buf.as_mut_ptr(), buf.len());
        }
    }

    fn write_data(&self, buf: &[u8]) {
        debug_assert!(buf.len() <= DATA_SIZE);
        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr(), self.map.add(DATA_OFFSET), buf.len());
        }
    }

    /// Submits one command and spins until the hypervisor acknowledges it.
    fn post(&self, setup: impl FnOnce(&mut Mailbox)) -> ChannelResult<Mailbox> {
        if !self.attached.get() {
            return Err(ChannelError::Closed);
        }

        let previous: Mailbox = unsafe { self.read_at(MAILBOX_OFFSET) };
        let sequence = previous.sequence.wrapping_add(1);
        let mut mailbox = Mailbox {
            sequence,
            ..Zeroable::zeroed()
        };
        setup(&mut mailbox);
        mailbox.sequence = sequence;
        unsafe { self.write_at(MAILBOX_OFFSET, mailbox) };

        let mut spins = 0u64;
        loop {
            let current: Mailbox = unsafe { self.read_at(MAILBOX_OFFSET) };
            if current.ack == sequence {
                return match current.status {
                    status::OK | status::TIMEOUT => Ok(current),
                    status => Err(status_error(status)),
                };
            }

            spins += 1;
            if spins > SPIN_LIMIT {
                return Err(ChannelError::Closed);
            }
            if spins % 0x1000 == 0 {
                std::thread::yield_now();
            }
            std::hint::spin_loop();
        }
    }

    fn check_vcpu(&self, vcpu: VcpuId) -> ChannelResult<u32> {
        if vcpu.0 >= self.vcpu_count {
            return Err(ChannelError::InvalidAddress);
        }
        Ok(vcpu.0 as u32)
    }
}

impl Drop for Fdp {
    fn drop(&mut self) {
        let _ = Channel::detach(self);
        unsafe { libc::munmap(self.map.cast(), self.map_len) };
    }
}

impl std::fmt::Debug for Fdp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Fdp")
            .field("vcpu_count", &self.vcpu_count)
            .field("mem_size", &self.mem_size)
            .field("attached", &self.attached.get())
            .finish()
    }
}

impl Channel for Fdp {
    fn vcpus_count(&self) -> usize {
        self.vcpu_count
    }

    fn memory_size(&self) -> u64 {
        self.mem_size
    }

    fn pause(&self) -> ChannelResult<()> {
        self.post(|m| m.command = command::PAUSE)?;
        Ok(())
    }

    fn resume(&self) -> ChannelResult<()> {
        self.post(|m| m.command = command::RESUME)?;
        Ok(())
    }

    fn step_once(&self, vcpu: VcpuId) -> ChannelResult<()> {
        let vcpu = self.check_vcpu(vcpu)?;
        self.post(|m| {
            m.command = command::STEP;
            m.vcpu = vcpu;
        })?;
        Ok(())
    }

    fn registers(&self, vcpu: VcpuId) -> ChannelResult<Registers> {
        let vcpu = self.check_vcpu(vcpu)?;
        self.post(|m| {
            m.command = command::GET_REGS;
            m.vcpu = vcpu;
        })?;

        let mut registers = Registers::zeroed();
        self.read_data(bytemuck::bytes_of_mut(&mut registers));
        Ok(registers)
    }

    fn special_registers(&self, vcpu: VcpuId) -> ChannelResult<SpecialRegisters> {
        let vcpu = self.check_vcpu(vcpu)?;
        self.post(|m| {
            m.command = command::GET_SREGS;
            m.vcpu = vcpu;
        })?;

        let mut registers = SpecialRegisters::zeroed();
        self.read_data(bytemuck::bytes_of_mut(&mut registers));
        Ok(registers)
    }

    fn read_register(&self, vcpu: VcpuId, register: Register) -> ChannelResult<u64> {
        let vcpu = self.check_vcpu(vcpu)?;
        let mailbox = self.post(|m| {
            m.command = command::READ_REG;
            m.vcpu = vcpu;
            m.register = register as u32;
        })?;
        Ok(mailbox.value)
    }

    fn write_register(&self, vcpu: VcpuId, register: Register, value: u64) -> ChannelResult<()> {
        let vcpu = self.check_vcpu(vcpu)?;
        self.post(|m| {
            m.command = command::WRITE_REG;
            m.vcpu = vcpu;
            m.register = register as u32;
            m.value = value;
        })?;
        Ok(())
    }

    fn read_msr(&self, vcpu: VcpuId, msr: u32) -> ChannelResult<u64> {
        let vcpu = self.check_vcpu(vcpu)?;
        let mailbox = self.post(|m| {
            m.command = command::READ_MSR;
            m.vcpu = vcpu;
            m.msr = msr;
        })?;
        Ok(mailbox.value)
    }

    fn write_msr(&self, vcpu: VcpuId, msr: u32, value: u64) -> ChannelResult<()> {
        let vcpu = self.check_vcpu(vcpu)?;
        self.post(|m| {
            m.command = command::WRITE_MSR;
            m.vcpu = vcpu;
            m.msr = msr;
            m.value = value;
        })?;
        Ok(())
    }

    fn read_physical(&self, addr: PhysicalAddress, buf: &mut [u8]) -> MemoryAccessResult<()> {
        if addr.0 + buf.len() as u64 > self.mem_size {
            return Err(MemoryAccessError::OutOfBounds);
        }

        for (i, chunk) in buf.chunks_mut(DATA_SIZE).enumerate() {
            let offset = (i * DATA_SIZE) as u64;
            self.post(|m| {
                m.command = command::READ_PHYS;
                m.addr = addr.0 + offset;
                m.length = chunk.len() as u64;
            })?;
            self.read_data(chunk);
        }
        Ok(())
    }

    fn write_physical(&self, addr: PhysicalAddress, buf: &[u8]) -> MemoryAccessResult<()> {
        if addr.0 + buf.len() as u64 > self.mem_size {
            return Err(MemoryAccessError::OutOfBounds);
        }

        for (i, chunk) in buf.chunks(DATA_SIZE).enumerate() {
            let offset = (i * DATA_SIZE) as u64;
            self.write_data(chunk);
            self.post(|m| {
                m.command = command::WRITE_PHYS;
                m.addr = addr.0 + offset;
                m.length = chunk.len() as u64;
            })?;
        }
        Ok(())
    }

    fn add_breakpoint(
        &self,
        addr: PhysicalAddress,
        kind: BreakpointKind,
    ) -> ChannelResult<ChannelBreakpoint> {
        let kind = match kind {
            BreakpointKind::SoftExec => 0,
            BreakpointKind::HardExec => 1,
            BreakpointKind::Read => 2,
            BreakpointKind::Write => 3,
            BreakpointKind::ReadWrite => 4,
        };
        let mailbox = self.post(|m| {
            m.command = command::ADD_BP;
            m.addr = addr.0;
            m.bp_kind = kind;
        })?;
        Ok(ChannelBreakpoint(mailbox.bp_id))
    }

    fn remove_breakpoint(&self, breakpoint: ChannelBreakpoint) -> ChannelResult<()> {
        self.post(|m| {
            m.command = command::REMOVE_BP;
            m.bp_id = breakpoint.0;
        })?;
        Ok(())
    }

    fn wait_for_event(&self, timeout: Duration) -> ChannelResult<Event> {
        let mailbox = self.post(|m| {
            m.command = command::WAIT_EVENT;
            m.timeout_ms = timeout.as_millis() as u64;
        })?;

        if mailbox.status == status::TIMEOUT {
            return Ok(Event::Timeout);
        }

        let event = mailbox.event;
        Ok(match event.kind {
            event_kind::BREAKPOINT => Event::Breakpoint(BreakpointHit {
                phys_addr: PhysicalAddress(event.addr),
                vcpu: VcpuId(event.vcpu as usize),
            }),
            event_kind::SINGLE_STEP => Event::SingleStepDone {
                vcpu: VcpuId(event.vcpu as usize),
            },
            event_kind::PAGE_FAULT => Event::PageFault {
                vcpu: VcpuId(event.vcpu as usize),
                virt: VirtualAddress(event.addr),
            },
            event_kind::INTERRUPT => Event::Interrupt {
                vcpu: VcpuId(event.vcpu as usize),
                vector: event.vector as u8,
            },
            event_kind::CRASH => Event::Crash,
            kind => {
                log::error!("Unknown event kind from hypervisor: {kind}");
                return Err(ChannelError::CorruptFrame);
            }
        })
    }

    fn detach(&self) -> ChannelResult<()> {
        if self.attached.replace(false) {
            log::debug!("Detached from FDP region");
        }
        Ok(())
    }
}
