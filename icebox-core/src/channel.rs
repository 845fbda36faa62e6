//! Control channel to a paused, debug-capable hypervisor.
//!
//! Every operation is synchronous with a single outstanding request per
//! channel, and none of them retries internally: transport failures reach the
//! caller as [`ChannelError`]s.

use core::time::Duration;

use crate::arch::x86_64::{Register, Registers, SpecialRegisters};
use crate::{ChannelResult, MemoryAccessResult, PhysicalAddress, VcpuId, VirtualAddress};

/// Identifies a breakpoint slot inside the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelBreakpoint(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    /// Byte overwrite at the physical address.
    SoftExec,
    /// Hypervisor-assisted execution breakpoint.
    HardExec,
    Read,
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointHit {
    pub phys_addr: PhysicalAddress,
    pub vcpu: VcpuId,
}

/// What the guest did while it was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Breakpoint(BreakpointHit),
    SingleStepDone { vcpu: VcpuId },
    PageFault { vcpu: VcpuId, virt: VirtualAddress },
    Interrupt { vcpu: VcpuId, vector: u8 },
    Timeout,
    Crash,
}

/// The shared-memory debug surface of a cooperative hypervisor.
///
/// Invariant: once `pause` returns, no guest progress occurs until `resume`,
/// `step_once` or an event pump resumes execution. While a breakpoint added
/// with [`BreakpointKind::SoftExec`] is installed, the byte at its physical
/// address is replaced; `remove_breakpoint` restores the original byte.
pub trait Channel {
    fn vcpus_count(&self) -> usize;

    fn memory_size(&self) -> u64;

    fn pause(&self) -> ChannelResult<()>;

    fn resume(&self) -> ChannelResult<()>;

    fn step_once(&self, vcpu: VcpuId) -> ChannelResult<()>;

    fn registers(&self, vcpu: VcpuId) -> ChannelResult<Registers>;

    fn special_registers(&self, vcpu: VcpuId) -> ChannelResult<SpecialRegisters>;

    fn read_register(&self, vcpu: VcpuId, register: Register) -> ChannelResult<u64>;

    fn write_register(&self, vcpu: VcpuId, register: Register, value: u64) -> ChannelResult<()>;

    fn read_msr(&self, vcpu: VcpuId, msr: u32) -> ChannelResult<u64>;

    fn write_msr(&self, vcpu: VcpuId, msr: u32, value: u64) -> ChannelResult<()>;

    fn read_physical(&self, addr: PhysicalAddress, buf: &mut [u8]) -> MemoryAccessResult<()>;

    fn write_physical(&self, addr: PhysicalAddress, buf: &[u8]) -> MemoryAccessResult<()>;

    fn add_breakpoint(
        &self,
        addr: PhysicalAddress,
        kind: BreakpointKind,
    ) -> ChannelResult<ChannelBreakpoint>;

    fn remove_breakpoint(&self, breakpoint: ChannelBreakpoint) -> ChannelResult<()>;

    /// Blocks until the guest reports an event or the timeout elapses, in
    /// which case [`Event::Timeout`] is returned.
    fn wait_for_event(&self, timeout: Duration) -> ChannelResult<Event>;

    /// Closes the shared region. Idempotent.
    fn detach(&self) -> ChannelResult<()>;
}

impl<C: Channel + ?Sized> Channel for &'_ C {
    #[inline]
    fn vcpus_count(&self) -> usize {
        (**self).vcpus_count()
    }

    #[inline]
    fn memory_size(&self) -> u64 {
        (**self).memory_size()
    }

    #[inline]
    fn pause(&self) -> ChannelResult<()> {
        (**self).pause()
    }

    #[inline]
    fn resume(&self) -> ChannelResult<()> {
        (**self).resume()
    }

    #[inline]
    fn step_once(&self, vcpu: VcpuId) -> ChannelResult<()> {
        (**self).step_once(vcpu)
    }

    #[inline]
    fn registers(&self, vcpu: VcpuId) -> ChannelResult<Registers> {
        (**self).registers(vcpu)
    }

    #[inline]
    fn special_registers(&self, vcpu: VcpuId) -> ChannelResult<SpecialRegisters> {
        (**self).special_registers(vcpu)
    }

    #[inline]
    fn read_register(&self, vcpu: VcpuId, register: Register) -> ChannelResult<u64> {
        (**self).read_register(vcpu, register)
    }

    #[inline]
    fn write_register(&self, vcpu: VcpuId, register: Register, value: u64) -> ChannelResult<()> {
        (**self).write_register(vcpu, register, value)
    }

    #[inline]
    fn read_msr(&self, vcpu: VcpuId, msr: u32) -> ChannelResult<u64> {
        (**self).read_msr(vcpu, msr)
    }

    #[inline]
    fn write_msr(&self, vcpu: VcpuId, msr: u32, value: u64) -> ChannelResult<()> {
        (**self).write_msr(vcpu, msr, value)
    }

    #[inline]
    fn read_physical(&self, addr: PhysicalAddress, buf: &mut [u8]) -> MemoryAccessResult<()> {
        (**self).read_physical(addr, buf)
    }

    #[inline]
    fn write_physical(&self, addr: PhysicalAddress, buf: &[u8]) -> MemoryAccessResult<()> {
        (**self).write_physical(addr, buf)
    }

    #[inline]
    fn add_breakpoint(
        &self,
        addr: PhysicalAddress,
        kind: BreakpointKind,
    ) -> ChannelResult<ChannelBreakpoint> {
        (**self).add_breakpoint(addr, kind)
    }

    #[inline]
    fn remove_breakpoint(&self, breakpoint: ChannelBreakpoint) -> ChannelResult<()> {
        (**self).remove_breakpoint(breakpoint)
    }

    #[inline]
    fn wait_for_event(&self, timeout: Duration) -> ChannelResult<Event> {
        (**self).wait_for_event(timeout)
    }

    #[inline]
    fn detach(&self) -> ChannelResult<()> {
        (**self).detach()
    }
}

/// Adapter exposing a channel's guest memory as [`PhysicalMemory`].
///
/// [`PhysicalMemory`]: crate::PhysicalMemory
#[derive(Debug, Clone, Copy)]
pub struct ChannelMemory<'a, C: ?Sized>(pub &'a C);

impl<C: Channel + ?Sized> crate::PhysicalMemory for ChannelMemory<'_, C> {
    #[inline]
    fn size(&self) -> u64 {
        self.0.memory_size()
    }

    #[inline]
    fn read_physical(&self, addr: PhysicalAddress, buf: &mut [u8]) -> MemoryAccessResult<()> {
        self.0.read_physical(addr, buf)
    }
}
