mod pointer;

pub mod linux;
pub use linux::Linux;
pub mod windows;
pub use windows::Windows;

use ibc::arch::x86_64::Register;
use ibc::symbols::{SymbolLoader, SymbolsIndexer};
use ibc::{Channel, Event, IceResult, PhysicalAddress, VirtualAddress};

use crate::state::{ResolveThread, Vm};

/// An OS backend able to identify itself and build from a paused guest.
pub trait Buildable<C: Channel>: Sized {
    /// Cheap probe: does this guest look like our OS? Returns a pre-filled
    /// builder when it does.
    fn quick_check(vm: &Vm<C>) -> Option<OsBuilder>;

    fn build(vm: Vm<C>, builder: OsBuilder) -> IceResult<Self>;
}

#[derive(Default)]
pub struct OsBuilder {
    pub symbols: Option<SymbolsIndexer>,
    pub loader: Option<Box<dyn SymbolLoader>>,
    pub kpgd: Option<PhysicalAddress>,
    pub kaslr: Option<VirtualAddress>,
    pub version: Option<String>,
}

impl OsBuilder {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_symbols(mut self, symbols: SymbolsIndexer) -> Self {
        self.symbols = Some(symbols);
        self
    }

    #[inline]
    pub fn with_loader(mut self, loader: Box<dyn SymbolLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    #[inline]
    pub fn with_kpgd(mut self, kpgd: PhysicalAddress) -> Self {
        self.kpgd = Some(kpgd);
        self
    }

    #[inline]
    pub fn with_kaslr(mut self, kaslr: VirtualAddress) -> Self {
        self.kaslr = Some(kaslr);
        self
    }

    #[inline]
    pub fn with_version(mut self, version: String) -> Self {
        self.version = Some(version);
        self
    }

    #[inline]
    pub fn build<C: Channel, Os: Buildable<C>>(self, vm: Vm<C>) -> IceResult<Os> {
        Os::build(vm, self)
    }
}

impl std::fmt::Debug for OsBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("OsBuilder")
            .field("kpgd", &self.kpgd)
            .field("kaslr", &self.kaslr)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

#[inline]
pub fn os_builder() -> OsBuilder {
    OsBuilder::new()
}

/// The OS capability set plus access to the underlying VM, which is what the
/// tracer needs to install hooks.
///
/// `'static` because tracer callbacks keep weak handles to the backend.
pub trait OsVm<C: Channel>: ibc::Os + ResolveThread + 'static {
    fn vm(&self) -> &Vm<C>;

    /// Pumps events until the predicate matches or a callback stops the run.
    fn run_until(&self, predicate: impl FnMut(&Event) -> bool) -> IceResult<Event>
    where
        Self: Sized,
    {
        self.vm().run_until(self, predicate)
    }
}

/// Where an integer argument of a function call lives at function entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLoc {
    Reg(Register),
    /// Offset from the stack pointer, return address included.
    Stack(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConvention {
    /// RCX, RDX, R8, R9, then stack (with 0x20 bytes of shadow space).
    WindowsX64,
    /// RDI, RSI, RDX, RCX, R8, R9, then stack.
    SysVAmd64,
}

impl CallConvention {
    pub fn arg_location(self, index: usize) -> ArgLoc {
        use Register::{Rcx, Rdi, Rdx, Rsi, R8, R9};

        match self {
            CallConvention::WindowsX64 => match index {
                0 => ArgLoc::Reg(Rcx),
                1 => ArgLoc::Reg(Rdx),
                2 => ArgLoc::Reg(R8),
                3 => ArgLoc::Reg(R9),
                // [rsp] is the return address, then four shadow slots
                n => ArgLoc::Stack(8 * (n as u64 + 1)),
            },
            CallConvention::SysVAmd64 => match index {
                0 => ArgLoc::Reg(Rdi),
                1 => ArgLoc::Reg(Rsi),
                2 => ArgLoc::Reg(Rdx),
                3 => ArgLoc::Reg(Rcx),
                4 => ArgLoc::Reg(R8),
                5 => ArgLoc::Reg(R9),
                n => ArgLoc::Stack(8 * (n as u64 - 5)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Register::*;

    #[test]
    fn windows_x64_args() {
        let conv = CallConvention::WindowsX64;
        assert_eq!(conv.arg_location(0), ArgLoc::Reg(Rcx));
        assert_eq!(conv.arg_location(1), ArgLoc::Reg(Rdx));
        assert_eq!(conv.arg_location(2), ArgLoc::Reg(R8));
        assert_eq!(conv.arg_location(3), ArgLoc::Reg(R9));
        // Fifth argument: return address + 4 shadow slots
        assert_eq!(conv.arg_location(4), ArgLoc::Stack(0x28));
        assert_eq!(conv.arg_location(5), ArgLoc::Stack(0x30));
    }

    #[test]
    fn sysv_args() {
        let conv = CallConvention::SysVAmd64;
        assert_eq!(conv.arg_location(0), ArgLoc::Reg(Rdi));
        assert_eq!(conv.arg_location(5), ArgLoc::Reg(R9));
        assert_eq!(conv.arg_location(6), ArgLoc::Stack(8));
        assert_eq!(conv.arg_location(7), ArgLoc::Stack(16));
    }
}
