//! Guest run lifecycle and the breakpoint registry.
//!
//! A [`Vm`] owns the hypervisor channel and everything keyed on it: the
//! pause/resume/step state machine, the physical breakpoint slots shared by
//! logical breakpoints, and the event pump. The introspector is single
//! threaded by design, so all interior state lives behind `Cell`/`RefCell`
//! and callbacks run on the pump loop while the guest is paused.

use std::cell::{Cell, RefCell};
use std::ops::ControlFlow;
use std::rc::{Rc, Weak};
use std::time::Duration;

use hashbrown::HashMap;

use ibc::arch::x86_64::{Register, Registers, SpecialRegisters};
use ibc::channel::ChannelMemory;
use ibc::{
    BreakpointHit, BreakpointKind, Channel, ChannelBreakpoint, Event, IceError, IceResult,
    MemoryAccessResult, PagingMode, PhysicalAddress, TranslationError, TranslationResult, VcpuId,
    VirtualAddress,
};

const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Paused,
    Running,
    Detached,
}

/// Resolves the thread currently scheduled on a vCPU, for breakpoint thread
/// filters. Implemented by the OS layers.
pub trait ResolveThread {
    fn current_thread_id(&self, vcpu: VcpuId) -> IceResult<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BpId(u64);

#[derive(Debug, Clone, Copy)]
pub struct BreakpointOpts {
    /// Only fire when this thread id is current.
    pub thread: Option<u64>,
    /// Remove the breakpoint the first time it fires, before its callback
    /// runs, so the callback may re-arm safely.
    pub one_shot: bool,
    pub kind: BreakpointKind,
}

impl Default for BreakpointOpts {
    fn default() -> Self {
        Self {
            thread: None,
            one_shot: false,
            kind: BreakpointKind::SoftExec,
        }
    }
}

type BpCallback = Box<dyn FnMut(&BreakpointHit) -> IceResult<ControlFlow<()>>>;

struct LogicalBp {
    phys: PhysicalAddress,
    thread_filter: Option<u64>,
    one_shot: bool,
    // Taken out of the slot while firing, so a callback never observes
    // itself through the registry
    callback: Option<BpCallback>,
}

struct Slot {
    channel_bp: ChannelBreakpoint,
    kind: BreakpointKind,
    entries: Vec<BpId>,
}

#[derive(Default)]
struct Registry {
    slots: HashMap<u64, Slot>,
    entries: HashMap<BpId, LogicalBp>,
    next_id: u64,
    // Channel slots whose last logical holder is gone; the byte restore
    // happens on the next flush, before the guest resumes
    channel_removals: Vec<ChannelBreakpoint>,
}

impl Registry {
    /// Drops a logical entry, returning its slot's channel breakpoint for
    /// removal when this was the last holder.
    fn release(&mut self, id: BpId) -> Option<()> {
        let entry = self.entries.remove(&id)?;

        if let Some(slot) = self.slots.get_mut(&entry.phys.0) {
            slot.entries.retain(|&e| e != id);
            if slot.entries.is_empty() {
                let slot = self.slots.remove(&entry.phys.0).unwrap();
                self.channel_removals.push(slot.channel_bp);
            }
        }

        Some(())
    }
}

/// Owning handle on a logical breakpoint.
///
/// Dropping it unregisters the entry; the underlying guest byte is restored
/// once no logical breakpoint shares the physical slot anymore.
pub struct Breakpoint {
    id: BpId,
    registry: Weak<RefCell<Registry>>,
}

impl Breakpoint {
    #[inline]
    pub fn id(&self) -> BpId {
        self.id
    }
}

impl Drop for Breakpoint {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.borrow_mut().release(self.id);
        }
    }
}

impl std::fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Breakpoint").field(&self.id).finish()
    }
}

/// A paused guest and the state the introspector keeps about it.
pub struct Vm<C: Channel> {
    channel: C,
    run_state: Cell<RunState>,
    resume_epoch: Cell<u64>,
    paging_mode: PagingMode,
    registry: Rc<RefCell<Registry>>,
    event_timeout: Cell<Duration>,
}

impl<C: Channel> Vm<C> {
    /// Attaches to the guest: pauses it and snapshots its paging mode.
    pub fn new(channel: C) -> IceResult<Self> {
        channel.pause()?;

        let sregs = channel.special_registers(VcpuId(0))?;
        let paging_mode = PagingMode::from_control_regs(sregs.cr0, sregs.cr4, sregs.efer)
            .map_err(|_| IceError::unsupported_architecture())?;

        Ok(Self {
            channel,
            run_state: Cell::new(RunState::Paused),
            resume_epoch: Cell::new(0),
            paging_mode,
            registry: Rc::new(RefCell::new(Registry::default())),
            event_timeout: Cell::new(DEFAULT_EVENT_TIMEOUT),
        })
    }

    #[inline]
    pub fn channel(&self) -> &C {
        &self.channel
    }

    #[inline]
    pub fn memory(&self) -> ChannelMemory<C> {
        ChannelMemory(&self.channel)
    }

    #[inline]
    pub fn run_state(&self) -> RunState {
        self.run_state.get()
    }

    #[inline]
    pub fn paging_mode(&self) -> PagingMode {
        self.paging_mode
    }

    /// Bumped every time the guest makes progress; caches keyed on guest
    /// memory (TLBs) are stale when this moves.
    #[inline]
    pub fn resume_epoch(&self) -> u64 {
        self.resume_epoch.get()
    }

    pub fn set_event_timeout(&self, timeout: Duration) {
        self.event_timeout.set(timeout);
    }

    fn check_attached(&self) -> IceResult<()> {
        match self.run_state.get() {
            RunState::Detached => Err(IceError::bad_state("the VM is detached")),
            _ => Ok(()),
        }
    }

    pub fn pause(&self) -> IceResult<()> {
        self.check_attached()?;
        if self.run_state.get() == RunState::Paused {
            return Ok(());
        }
        self.channel.pause()?;
        self.run_state.set(RunState::Paused);
        Ok(())
    }

    pub fn resume(&self) -> IceResult<()> {
        self.check_attached()?;
        if self.run_state.get() == RunState::Running {
            return Ok(());
        }
        self.flush_pending();
        self.channel.resume()?;
        self.resume_epoch.set(self.resume_epoch.get() + 1);
        self.run_state.set(RunState::Running);
        Ok(())
    }

    /// Retires exactly one instruction, leaving the guest paused.
    pub fn step_once(&self, vcpu: VcpuId) -> IceResult<Event> {
        self.check_attached()?;
        if self.run_state.get() != RunState::Paused {
            return Err(IceError::bad_state("single step requires a paused VM"));
        }

        self.flush_pending();
        self.channel.step_once(vcpu)?;
        self.resume_epoch.set(self.resume_epoch.get() + 1);
        let event = self.channel.wait_for_event(self.event_timeout.get())?;
        Ok(event)
    }

    pub fn registers(&self, vcpu: VcpuId) -> IceResult<Registers> {
        Ok(self.channel.registers(vcpu)?)
    }

    pub fn special_registers(&self, vcpu: VcpuId) -> IceResult<SpecialRegisters> {
        Ok(self.channel.special_registers(vcpu)?)
    }

    pub fn read_register(&self, vcpu: VcpuId, register: Register) -> IceResult<u64> {
        Ok(self.channel.read_register(vcpu, register)?)
    }

    pub fn write_register(&self, vcpu: VcpuId, register: Register, value: u64) -> IceResult<()> {
        Ok(self.channel.write_register(vcpu, register, value)?)
    }

    pub fn read_msr(&self, vcpu: VcpuId, msr: u32) -> IceResult<u64> {
        Ok(self.channel.read_msr(vcpu, msr)?)
    }

    pub fn write_msr(&self, vcpu: VcpuId, msr: u32, value: u64) -> IceResult<()> {
        Ok(self.channel.write_msr(vcpu, msr, value)?)
    }

    #[inline]
    pub fn read_physical(&self, addr: PhysicalAddress, buf: &mut [u8]) -> MemoryAccessResult<()> {
        self.channel.read_physical(addr, buf)
    }

    #[inline]
    pub fn write_physical(&self, addr: PhysicalAddress, buf: &[u8]) -> MemoryAccessResult<()> {
        self.channel.write_physical(addr, buf)
    }

    #[inline]
    pub fn virtual_to_physical(
        &self,
        pgd: PhysicalAddress,
        addr: VirtualAddress,
    ) -> TranslationResult<PhysicalAddress> {
        ibc::arch::virtual_to_physical(&self.memory(), self.paging_mode, pgd, addr)
    }

    /// Convenience virtual read, emulated as translate-then-read-physical.
    pub fn read_virtual(
        &self,
        pgd: PhysicalAddress,
        addr: VirtualAddress,
        buf: &mut [u8],
    ) -> IceResult<()> {
        ibc::read_virtual_memory(addr, buf, |addr, buf| match self
            .virtual_to_physical(pgd, addr)
        {
            Ok(phys) => Ok(self.channel.read_physical(phys, buf)?),
            Err(TranslationError::Memory(err)) => Err(err.into()),
            Err(TranslationError::Invalid(_)) => Err(IceError::unmapped_page(addr)),
        })
    }

    pub fn write_virtual(
        &self,
        pgd: PhysicalAddress,
        addr: VirtualAddress,
        buf: &[u8],
    ) -> IceResult<()> {
        ibc::write_virtual_memory(addr, buf, |addr, buf| match self
            .virtual_to_physical(pgd, addr)
        {
            Ok(phys) => Ok(self.channel.write_physical(phys, buf)?),
            Err(TranslationError::Memory(err)) => Err(err.into()),
            Err(TranslationError::Invalid(_)) => Err(IceError::unmapped_page(addr)),
        })
    }

    /// The per-CPU kernel pointer of a vCPU, from its GS bases.
    pub fn kernel_per_cpu(&self, vcpu: VcpuId) -> IceResult<Option<VirtualAddress>> {
        let sregs = self.channel.special_registers(vcpu)?;
        Ok(ibc::arch::x86_64::kernel_per_cpu(
            sregs.gs.base,
            sregs.kernel_gs_base,
        ))
    }

    fn flush_pending(&self) {
        let removals = std::mem::take(&mut self.registry.borrow_mut().channel_removals);
        for channel_bp in removals {
            if let Err(err) = self.channel.remove_breakpoint(channel_bp) {
                log::error!("Failed to remove channel breakpoint: {err}");
            }
        }
    }

    /// Registers a logical breakpoint at a physical address.
    ///
    /// Multiple logical breakpoints may share one physical slot; the guest
    /// byte is only patched on the first registration. Registering a
    /// different kind on an already-patched address is a conflict.
    pub fn set_breakpoint(
        &self,
        phys: PhysicalAddress,
        opts: BreakpointOpts,
        callback: impl FnMut(&BreakpointHit) -> IceResult<ControlFlow<()>> + 'static,
    ) -> IceResult<Breakpoint> {
        self.check_attached()?;
        self.flush_pending();

        let mut registry = self.registry.borrow_mut();

        if let Some(slot) = registry.slots.get(&phys.0) {
            if slot.kind != opts.kind {
                return Err(IceError::breakpoint_conflict(phys));
            }
        } else {
            let channel_bp = self.channel.add_breakpoint(phys, opts.kind)?;
            registry.slots.insert(
                phys.0,
                Slot {
                    channel_bp,
                    kind: opts.kind,
                    entries: Vec::new(),
                },
            );
        }

        let id = BpId(registry.next_id);
        registry.next_id += 1;

        registry.entries.insert(
            id,
            LogicalBp {
                phys,
                thread_filter: opts.thread,
                one_shot: opts.one_shot,
                callback: Some(Box::new(callback)),
            },
        );
        registry.slots.get_mut(&phys.0).unwrap().entries.push(id);

        Ok(Breakpoint {
            id,
            registry: Rc::downgrade(&self.registry),
        })
    }

    /// Explicit removal by id, for holders that gave their guard away.
    pub fn remove_breakpoint(&self, id: BpId) -> IceResult<()> {
        self.registry
            .borrow_mut()
            .release(id)
            .ok_or_else(IceError::unknown_breakpoint)?;
        self.flush_pending();
        Ok(())
    }

    /// Fires every logical breakpoint registered at the hit address, in
    /// insertion order. Returns whether a callback requested a stop.
    fn dispatch(&self, threads: &dyn ResolveThread, hit: &BreakpointHit) -> IceResult<bool> {
        let ids = match self.registry.borrow().slots.get(&hit.phys_addr.0) {
            Some(slot) => slot.entries.clone(),
            None => {
                log::warn!("Breakpoint hit at unregistered address 0x{:x}", hit.phys_addr);
                return Ok(false);
            }
        };

        // Resolved at most once per event, and only when a filter needs it
        let mut current_thread: Option<Option<u64>> = None;
        let mut stop = false;

        for id in ids {
            let filter = match self.registry.borrow().entries.get(&id) {
                Some(entry) => entry.thread_filter,
                None => continue,
            };

            if let Some(filter) = filter {
                let thread = *current_thread.get_or_insert_with(|| {
                    threads
                        .current_thread_id(hit.vcpu)
                        .map_err(|err| {
                            log::warn!("Failed to resolve current thread: {err:#}");
                        })
                        .ok()
                });
                // An unresolvable thread aborts filtered entries, not the
                // whole dispatch
                match thread {
                    Some(thread) if thread == filter => (),
                    _ => continue,
                }
            }

            let (callback, one_shot) = {
                let mut registry = self.registry.borrow_mut();
                let Some(entry) = registry.entries.get_mut(&id) else {
                    continue;
                };
                (entry.callback.take(), entry.one_shot)
            };
            let Some(mut callback) = callback else {
                continue;
            };

            if one_shot {
                // One-shots leave the registry before firing, so the
                // callback can re-arm the same address
                self.registry.borrow_mut().release(id);
            }

            let flow = callback(hit);

            if !one_shot {
                if let Some(entry) = self.registry.borrow_mut().entries.get_mut(&id) {
                    entry.callback = Some(callback);
                }
            }

            match flow {
                Ok(ControlFlow::Break(())) => stop = true,
                Ok(ControlFlow::Continue(())) => (),
                Err(err) if err.is_transport() => return Err(err),
                Err(err) => log::error!("Breakpoint callback failed: {err:#}"),
            }
        }

        Ok(stop)
    }

    /// Resumes the guest and pumps events until the predicate matches or a
    /// callback requests a stop.
    ///
    /// Timeouts are returned to the caller, never delivered to callbacks.
    /// Transport failures surface as [`Event::Crash`].
    pub fn run_until(
        &self,
        threads: &dyn ResolveThread,
        mut predicate: impl FnMut(&Event) -> bool,
    ) -> IceResult<Event> {
        self.check_attached()?;

        loop {
            self.resume()?;

            let event = match self.channel.wait_for_event(self.event_timeout.get()) {
                Ok(event) => event,
                Err(err) => {
                    log::error!("Event transport failed: {err}");
                    self.run_state.set(RunState::Detached);
                    return Ok(Event::Crash);
                }
            };
            self.run_state.set(RunState::Paused);

            match event {
                Event::Timeout => return Ok(Event::Timeout),
                Event::Crash => {
                    self.run_state.set(RunState::Detached);
                    return Ok(Event::Crash);
                }
                Event::Breakpoint(hit) => {
                    let stop = match self.dispatch(threads, &hit) {
                        Ok(stop) => stop,
                        Err(err) => {
                            log::error!("Fatal dispatch failure: {err:#}");
                            self.run_state.set(RunState::Detached);
                            return Ok(Event::Crash);
                        }
                    };
                    if stop || predicate(&event) {
                        return Ok(event);
                    }
                }
                event => {
                    if predicate(&event) {
                        return Ok(event);
                    }
                }
            }
        }
    }

    /// Unregisters everything and closes the channel. All patched guest
    /// bytes are restored first.
    pub fn detach(&self) -> IceResult<()> {
        if self.run_state.get() == RunState::Detached {
            return Ok(());
        }

        {
            let mut registry = self.registry.borrow_mut();
            let ids: Vec<BpId> = registry.entries.keys().copied().collect();
            for id in ids {
                registry.release(id);
            }
        }
        self.flush_pending();

        self.channel.detach()?;
        self.run_state.set(RunState::Detached);
        Ok(())
    }
}

impl<C: Channel> Drop for Vm<C> {
    fn drop(&mut self) {
        if self.run_state.get() != RunState::Detached {
            if let Err(err) = self.detach() {
                log::error!("Failed to detach from the VM: {err:#}");
            }
        }
    }
}

impl<C: Channel> std::fmt::Debug for Vm<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("run_state", &self.run_state.get())
            .field("paging_mode", &self.paging_mode)
            .finish_non_exhaustive()
    }
}
