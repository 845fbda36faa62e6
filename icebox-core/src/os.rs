use alloc::string::String;
use core::hash::{Hash, Hasher};
use core::ops::ControlFlow;

use crate::{IceResult, PhysicalAddress, VcpuId, VirtualAddress};

macro_rules! guest_handles {
    ( $( $(#[$attr:meta])* $name:ident; )* ) => {$(
        $(#[$attr])*
        /// Identity is the integer `id` alone; `addr` is kept for structural
        /// access to the backing kernel object.
        #[derive(Debug, Clone, Copy)]
        pub struct $name {
            pub id: u64,
            pub addr: VirtualAddress,
        }

        impl $name {
            #[inline]
            pub const fn new(addr: VirtualAddress) -> Self {
                Self { id: addr.0, addr }
            }
        }

        impl PartialEq for $name {
            #[inline]
            fn eq(&self, other: &Self) -> bool {
                self.id == other.id
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            #[inline]
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.id.hash(state)
            }
        }
    )*};
}

guest_handles! {
    Process;
    Thread;
    Module;
    Driver;
}

#[inline]
fn find<'a, T: Copy>(
    result: &'a mut Option<T>,
    mut predicate: impl FnMut(T) -> IceResult<bool> + 'a,
) -> impl FnMut(T) -> IceResult<ControlFlow<()>> + 'a {
    move |item| {
        Ok(if predicate(item)? {
            *result = Some(item);
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        })
    }
}

/// Guest-OS semantics reconstructed from raw memory and registers.
///
/// Backends exist for Windows/NT and Linux; both expose the same capability
/// set so plugins stay OS-agnostic.
pub trait Os {
    fn kernel_pgd(&self) -> PhysicalAddress;

    fn read_virtual_memory(
        &self,
        mmu_addr: PhysicalAddress,
        addr: VirtualAddress,
        buf: &mut [u8],
    ) -> IceResult<()>;

    fn read_kernel_memory(&self, addr: VirtualAddress, buf: &mut [u8]) -> IceResult<()> {
        self.read_virtual_memory(self.kernel_pgd(), addr, buf)
    }

    fn read_process_memory(
        &self,
        proc: Process,
        addr: VirtualAddress,
        buf: &mut [u8],
    ) -> IceResult<()>;

    fn write_virtual_memory(
        &self,
        mmu_addr: PhysicalAddress,
        addr: VirtualAddress,
        buf: &[u8],
    ) -> IceResult<()>;

    fn init_process(&self) -> IceResult<Process>;

    fn current_thread(&self, vcpu: VcpuId) -> IceResult<Thread>;

    fn current_process(&self, vcpu: VcpuId) -> IceResult<Process> {
        let thread = self.current_thread(vcpu)?;
        self.thread_process(thread)
    }

    fn for_each_process(
        &self,
        f: &mut dyn FnMut(Process) -> IceResult<ControlFlow<()>>,
    ) -> IceResult<()>;

    fn process_id(&self, proc: Process) -> IceResult<u64>;
    fn process_name(&self, proc: Process) -> IceResult<String>;
    fn process_parent(&self, proc: Process) -> IceResult<Process>;
    fn process_pgd(&self, proc: Process) -> IceResult<PhysicalAddress>;
    fn process_is_kernel(&self, proc: Process) -> IceResult<bool>;
    fn process_is_32bit(&self, proc: Process) -> IceResult<bool>;

    fn process_for_each_thread(
        &self,
        proc: Process,
        f: &mut dyn FnMut(Thread) -> IceResult<ControlFlow<()>>,
    ) -> IceResult<()>;

    fn process_for_each_module(
        &self,
        proc: Process,
        f: &mut dyn FnMut(Module) -> IceResult<ControlFlow<()>>,
    ) -> IceResult<()>;

    fn module_name(&self, module: Module, proc: Process) -> IceResult<String>;
    fn module_span(
        &self,
        module: Module,
        proc: Process,
    ) -> IceResult<(VirtualAddress, VirtualAddress)>;

    fn for_each_driver(
        &self,
        f: &mut dyn FnMut(Driver) -> IceResult<ControlFlow<()>>,
    ) -> IceResult<()>;

    fn driver_name(&self, driver: Driver) -> IceResult<String>;
    fn driver_span(&self, driver: Driver) -> IceResult<(VirtualAddress, VirtualAddress)>;

    fn thread_process(&self, thread: Thread) -> IceResult<Process>;
    fn thread_id(&self, thread: Thread) -> IceResult<u64>;
    fn thread_name(&self, thread: Thread) -> IceResult<Option<String>>;

    /// Reads the `index`-th argument of the function the vCPU just entered,
    /// following the guest calling convention.
    fn read_arg(&self, vcpu: VcpuId, index: usize) -> IceResult<u64>;

    /// Rewrites an argument before the callee executes its first instruction.
    fn write_arg(&self, vcpu: VcpuId, index: usize, value: u64) -> IceResult<()>;

    /// The caller-provided return address, read from the top of the stack.
    fn return_address(&self, vcpu: VcpuId) -> IceResult<VirtualAddress>;

    /// Resolves `module!name` to a virtual address inside `proc`.
    fn resolve_symbol(
        &self,
        proc: Process,
        module: &str,
        name: &str,
    ) -> IceResult<VirtualAddress>;

    fn find_process_by_name(&self, name: &str) -> IceResult<Option<Process>> {
        let mut proc = None;
        self.for_each_process(&mut find(&mut proc, |p| Ok(self.process_name(p)? == name)))?;
        Ok(proc)
    }

    fn find_process_by_id(&self, pid: u64) -> IceResult<Option<Process>> {
        let mut proc = None;
        self.for_each_process(&mut find(&mut proc, |p| Ok(self.process_id(p)? == pid)))?;
        Ok(proc)
    }
}
