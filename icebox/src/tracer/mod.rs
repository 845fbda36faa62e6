//! Function-entry interception and argument marshalling.
//!
//! Hook targets are declared once in [`schema`]; the `hook_functions!` macro
//! expands each entry into a [`FunctionSchema`] type whose generated stub
//! resolves the symbol, decodes typed arguments through the guest calling
//! convention and drives the user callback. Callbacks may rewrite arguments
//! before the callee runs and may request a one-shot return hook keyed on
//! (return address, thread).

/// Expands the declarative hook schema into one [`FunctionSchema`] type per
/// entry, grouped in a module per target.
macro_rules! hook_functions {
    ($(
        $( #[$mod_attr:meta] )*
        pub mod $mod_name:ident (module = $module:literal) {
            $( family $family:literal {
                $( fn $fname:ident ( $( $arg:ident : $typ:ty ),* $(,)? ); )*
            } )*
        }
    )*) => {$(
        $( #[$mod_attr] )*
        pub mod $mod_name {
            #[allow(unused_imports)]
            use crate::tracer::*;

            $($(
                #[allow(non_camel_case_types)]
                #[derive(Debug)]
                pub struct $fname;

                impl FunctionSchema for $fname {
                    const MODULE: &'static str = $module;
                    const NAME: &'static str = stringify!($fname);
                    const FAMILY: &'static str = $family;

                    type Args = ( $( Option<<$typ as ArgDecode>::Out>, )* );

                    fn decode<C: ibc::Channel + 'static, O: crate::os::OsVm<C>>(
                        cx: &HookCx<C, O>,
                    ) -> Self::Args {
                        let mut index = 0usize;
                        let args = ( $( {
                            let value = <$typ as ArgDecode>::decode(cx, index);
                            index += 1;
                            value
                        }, )* );
                        let _ = index;
                        args
                    }
                }
            )*)*
        }
    )*};
}

mod schema;
pub use schema::{heaps, syscalls};

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::ops::ControlFlow;
use std::rc::Rc;

use hashbrown::{HashMap, HashSet};

use ibc::arch::x86_64::Register;
use ibc::{
    BreakpointKind, Channel, IceError, IceResult, Process, Thread, VcpuId, VirtualAddress,
};

use crate::os::OsVm;
use crate::state::{Breakpoint, BreakpointOpts};

/// One traced guest function, generated from the declarative schema.
pub trait FunctionSchema: 'static {
    const MODULE: &'static str;
    const NAME: &'static str;
    /// Re-entrancy domain: nested entries of the same family on one thread
    /// are filtered out.
    const FAMILY: &'static str;

    type Args;

    fn decode<C: Channel + 'static, O: OsVm<C>>(cx: &HookCx<C, O>) -> Self::Args;
}

/// How one declared parameter type is pulled out of the guest.
///
/// A failed read surfaces as `None`, never as an error: the callback decides
/// what an absent argument means.
pub trait ArgDecode {
    type Out;

    fn decode<C: Channel + 'static, O: OsVm<C>>(cx: &HookCx<C, O>, index: usize) -> Option<Self::Out>;
}

macro_rules! integer_args {
    ( $( $marker:ident => $out:ty ),* $(,)? ) => {$(
        #[derive(Debug)]
        pub struct $marker;

        impl ArgDecode for $marker {
            type Out = $out;

            fn decode<C: Channel + 'static, O: OsVm<C>>(
                cx: &HookCx<C, O>,
                index: usize,
            ) -> Option<Self::Out> {
                cx.arg_opt(index).map(|v| v as $out)
            }
        }
    )*};
}

integer_args! {
    U32 => u32,
    U64 => u64,
    USize => u64,
    Handle => u64,
    Ptr => u64,
}

/// UTF-16 guest string, dereferenced and bounded at decode time.
#[derive(Debug)]
pub struct WStr<const MAX: usize>;

impl<const MAX: usize> ArgDecode for WStr<MAX> {
    type Out = String;

    fn decode<C: Channel + 'static, O: OsVm<C>>(cx: &HookCx<C, O>, index: usize) -> Option<String> {
        let addr = cx.arg_opt(index)?;
        if addr == 0 {
            return None;
        }
        cx.read_wstr(VirtualAddress(addr), MAX).ok()
    }
}

/// NUL-terminated guest string, dereferenced and bounded at decode time.
#[derive(Debug)]
pub struct CStr<const MAX: usize>;

impl<const MAX: usize> ArgDecode for CStr<MAX> {
    type Out = String;

    fn decode<C: Channel + 'static, O: OsVm<C>>(cx: &HookCx<C, O>, index: usize) -> Option<String> {
        let addr = cx.arg_opt(index)?;
        if addr == 0 {
            return None;
        }
        cx.read_cstr(VirtualAddress(addr), MAX).ok()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracerStats {
    /// Entry hits silently skipped by the re-entrancy filter.
    pub reentrant_skips: u64,
    /// Arguments that could not be read and were passed as absent.
    pub failed_args: u64,
    /// Hooks aborted because the current thread could not be resolved.
    pub failed_hooks: u64,
}

#[derive(Default)]
struct TracerState {
    in_flight: HashMap<&'static str, HashSet<u64>>,
    ret_hooks: HashMap<(u64, u64), Breakpoint>,
    stats: TracerStats,
}

impl TracerState {
    /// Drops the pending return hooks and in-flight flags of one thread.
    fn cancel_thread(&mut self, tid: u64) {
        self.ret_hooks.retain(|&(_, thread), _| thread != tid);
        for set in self.in_flight.values_mut() {
            set.remove(&tid);
        }
    }
}

/// Installs entry hooks generated from the schema and owns their shared
/// bookkeeping.
pub struct Tracer<C: Channel, O: OsVm<C>> {
    os: Rc<O>,
    state: Rc<RefCell<TracerState>>,
    _channel: PhantomData<fn() -> C>,
}

impl<C: Channel + 'static, O: OsVm<C>> Tracer<C, O> {
    pub fn new(os: Rc<O>) -> Self {
        Self {
            os,
            state: Rc::new(RefCell::new(TracerState::default())),
            _channel: PhantomData,
        }
    }

    #[inline]
    pub fn os(&self) -> &Rc<O> {
        &self.os
    }

    pub fn stats(&self) -> TracerStats {
        self.state.borrow().stats
    }

    /// Cancels every pending return hook of a terminated thread and clears
    /// its in-flight flags.
    pub fn cancel_thread(&self, thread: Thread) {
        self.state.borrow_mut().cancel_thread(thread.id);
    }

    /// Hooks the kernel's thread-termination routine so the pending return
    /// hooks of a dying thread are consumed by cancellation instead of
    /// leaking.
    pub fn watch_thread_exits(&self) -> IceResult<Breakpoint> {
        let init = self.os.init_process()?;
        let addr = self
            .os
            .resolve_symbol(init, "ntoskrnl.exe", "PspExitThread")
            .or_else(|_| self.os.resolve_symbol(init, "vmlinux", "do_exit"))?;
        let phys = self
            .os
            .vm()
            .virtual_to_physical(self.os.kernel_pgd(), addr)
            .map_err(|_| IceError::unmapped_page(addr))?;

        log::debug!("Watching thread exits at 0x{addr:x} (phys 0x{phys:x})");

        let os = Rc::downgrade(&self.os);
        let state = self.state.clone();

        self.os
            .vm()
            .set_breakpoint(phys, BreakpointOpts::default(), move |hit| {
                let Some(os) = os.upgrade() else {
                    return Ok(ControlFlow::Continue(()));
                };

                match os.current_thread(hit.vcpu) {
                    Ok(thread) => state.borrow_mut().cancel_thread(thread.id),
                    Err(err) => log::warn!("Exiting thread unknown: {err:#}"),
                }
                Ok(ControlFlow::Continue(()))
            })
    }

    /// Installs the entry hook for `F` in `proc`.
    ///
    /// The callback runs at function entry, before the callee's first
    /// instruction, with the declared arguments decoded; hits from other
    /// processes or from nested same-family calls on one thread are
    /// filtered out.
    pub fn hook_function<F: FunctionSchema>(
        &self,
        proc: Process,
        mut callback: impl FnMut(&HookCx<C, O>, F::Args) -> IceResult<()> + 'static,
    ) -> IceResult<Breakpoint> {
        let addr = self.os.resolve_symbol(proc, F::MODULE, F::NAME)?;
        let pgd = self.os.process_pgd(proc)?;
        let phys = self
            .os
            .vm()
            .virtual_to_physical(pgd, addr)
            .map_err(|_| IceError::unmapped_page(addr))?;

        log::debug!(
            "Hooking {}!{} at 0x{addr:x} (phys 0x{phys:x})",
            F::MODULE,
            F::NAME
        );

        let os = Rc::downgrade(&self.os);
        let state = self.state.clone();

        self.os
            .vm()
            .set_breakpoint(phys, BreakpointOpts::default(), move |hit| {
                let Some(os) = os.upgrade() else {
                    return Ok(ControlFlow::Continue(()));
                };

                let context: IceResult<(Thread, Process)> = (|| {
                    let thread = os.current_thread(hit.vcpu)?;
                    let current = os.thread_process(thread)?;
                    Ok((thread, current))
                })();
                let (thread, current) = match context {
                    Ok(context) => context,
                    Err(err) => {
                        log::warn!("Aborting hook, current thread unknown: {err:#}");
                        state.borrow_mut().stats.failed_hooks += 1;
                        return Ok(ControlFlow::Continue(()));
                    }
                };

                if current != proc {
                    return Ok(ControlFlow::Continue(()));
                }

                {
                    let mut state = state.borrow_mut();
                    let in_flight = state.in_flight.entry(F::FAMILY).or_default();
                    if !in_flight.insert(thread.id) {
                        state.stats.reentrant_skips += 1;
                        log::trace!("Skipping re-entrant {} on thread {:x}", F::NAME, thread.id);
                        return Ok(ControlFlow::Continue(()));
                    }
                }

                let cx = HookCx {
                    os: os.clone(),
                    state: state.clone(),
                    vcpu: hit.vcpu,
                    proc,
                    thread,
                    family: F::FAMILY,
                    hooked_return: Cell::new(false),
                    _channel: PhantomData,
                };

                let args = F::decode(&cx);
                let result = callback(&cx, args);

                // Without a return hook the call is over for us; drop the
                // in-flight flag right away
                if !cx.hooked_return.get() {
                    let mut state = state.borrow_mut();
                    if let Some(set) = state.in_flight.get_mut(F::FAMILY) {
                        set.remove(&thread.id);
                    }
                }

                result.map(|()| ControlFlow::Continue(()))
            })
    }
}

impl<C: Channel + 'static, O: OsVm<C>> std::fmt::Debug for Tracer<C, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Context handed to entry callbacks.
pub struct HookCx<C: Channel, O: OsVm<C>> {
    os: Rc<O>,
    state: Rc<RefCell<TracerState>>,
    pub vcpu: VcpuId,
    pub proc: Process,
    pub thread: Thread,
    family: &'static str,
    hooked_return: Cell<bool>,
    _channel: PhantomData<fn() -> C>,
}

impl<C: Channel + 'static, O: OsVm<C>> HookCx<C, O> {
    #[inline]
    pub fn os(&self) -> &O {
        &self.os
    }

    #[inline]
    pub fn arg(&self, index: usize) -> IceResult<u64> {
        self.os.read_arg(self.vcpu, index)
    }

    fn arg_opt(&self, index: usize) -> Option<u64> {
        match self.arg(index) {
            Ok(value) => Some(value),
            Err(err) => {
                log::debug!("Failed to read argument {index}: {err:#}");
                self.state.borrow_mut().stats.failed_args += 1;
                None
            }
        }
    }

    /// Rewrites an argument before the callee executes.
    ///
    /// When several hooks on the same function rewrite the same argument,
    /// the last registered hook wins.
    #[inline]
    pub fn set_arg(&self, index: usize, value: u64) -> IceResult<()> {
        self.os.write_arg(self.vcpu, index, value)
    }

    #[inline]
    pub fn return_address(&self) -> IceResult<VirtualAddress> {
        self.os.return_address(self.vcpu)
    }

    pub fn read_wstr(&self, addr: VirtualAddress, max_chars: usize) -> IceResult<String> {
        let mut units = vec![0u16; max_chars];
        self.os
            .read_process_memory(self.proc, addr, bytemuck::cast_slice_mut(&mut units))?;
        let len = units.iter().position(|&c| c == 0).unwrap_or(units.len());
        Ok(String::from_utf16_lossy(&units[..len]))
    }

    pub fn read_cstr(&self, addr: VirtualAddress, max_len: usize) -> IceResult<String> {
        let mut bytes = vec![0u8; max_len];
        self.os.read_process_memory(self.proc, addr, &mut bytes)?;
        let len = memchr::memchr(0, &bytes).unwrap_or(bytes.len());
        bytes.truncate(len);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Installs a one-shot breakpoint at the caller's return address,
    /// filtered on the current thread.
    ///
    /// Returns `false` without installing anything when a hook is already
    /// pending for this (return address, thread): re-entrant calls are
    /// rejected at registration time.
    pub fn hook_return(
        &self,
        callback: impl FnOnce(&RetCx<C, O>) -> IceResult<()> + 'static,
    ) -> IceResult<bool> {
        let ret_addr = self.return_address()?;
        let key = (ret_addr.0, self.thread.id);

        if self.state.borrow().ret_hooks.contains_key(&key) {
            log::debug!("Return hook already pending at 0x{ret_addr:x}, rejecting");
            return Ok(false);
        }

        let pgd = self.os.process_pgd(self.proc)?;
        let phys = self
            .os
            .vm()
            .virtual_to_physical(pgd, ret_addr)
            .map_err(|_| IceError::unmapped_page(ret_addr))?;

        let os = Rc::downgrade(&self.os);
        let state = self.state.clone();
        let family = self.family;
        let thread = self.thread;
        let mut callback = Some(callback);

        let opts = BreakpointOpts {
            thread: Some(thread.id),
            one_shot: true,
            kind: BreakpointKind::SoftExec,
        };
        let bp = self.os.vm().set_breakpoint(phys, opts, move |hit| {
            let Some(os) = os.upgrade() else {
                return Ok(ControlFlow::Continue(()));
            };

            {
                let mut state = state.borrow_mut();
                state.ret_hooks.remove(&key);
                if let Some(set) = state.in_flight.get_mut(family) {
                    set.remove(&thread.id);
                }
            }

            if let Some(callback) = callback.take() {
                let cx = RetCx {
                    os,
                    vcpu: hit.vcpu,
                    thread,
                    _channel: PhantomData,
                };
                callback(&cx)?;
            }
            Ok(ControlFlow::Continue(()))
        })?;

        self.state.borrow_mut().ret_hooks.insert(key, bp);
        self.hooked_return.set(true);
        Ok(true)
    }
}

/// Context handed to return callbacks.
pub struct RetCx<C: Channel, O: OsVm<C>> {
    os: Rc<O>,
    pub vcpu: VcpuId,
    pub thread: Thread,
    _channel: PhantomData<fn() -> C>,
}

impl<C: Channel + 'static, O: OsVm<C>> RetCx<C, O> {
    #[inline]
    pub fn os(&self) -> &O {
        &self.os
    }

    /// The function's return value.
    #[inline]
    pub fn ret_value(&self) -> IceResult<u64> {
        self.os.vm().read_register(self.vcpu, Register::Rax)
    }

    #[inline]
    pub fn set_ret_value(&self, value: u64) -> IceResult<()> {
        self.os.vm().write_register(self.vcpu, Register::Rax, value)
    }
}
