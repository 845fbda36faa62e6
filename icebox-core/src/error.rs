use alloc::{
    boxed::Box,
    string::{String, ToString},
};
use core::fmt;

#[cfg(feature = "std")]
pub use std::error::Error;

use crate::seal;

#[cfg(not(feature = "std"))]
pub trait Error: fmt::Display + fmt::Debug {
    #[inline]
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

#[cfg(not(feature = "std"))]
impl<E> From<E> for Box<dyn Error + Send + Sync>
where
    E: Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Box::new(err)
    }
}

/// Transport-level failure of the hypervisor channel.
///
/// The channel never retries on its own, so each of these reaches the caller
/// exactly as the transport reported it.
#[derive(Debug)]
#[non_exhaustive]
pub enum ChannelError {
    Closed,
    VmGone,
    CorruptFrame,
    InvalidAddress,
    Unsupported,
    #[cfg(feature = "std")]
    Io(std::io::Error),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("channel is closed"),
            Self::VmGone => f.write_str("VM is gone"),
            Self::CorruptFrame => f.write_str("corrupt channel frame"),
            Self::InvalidAddress => f.write_str("invalid address"),
            Self::Unsupported => f.write_str("unsupported channel operation"),
            #[cfg(feature = "std")]
            Self::Io(err) => err.fmt(f),
        }
    }
}

impl Error for ChannelError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            #[cfg(feature = "std")]
            Self::Io(err) => err.source(),
            _ => None,
        }
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for ChannelError {
    #[cold]
    #[inline]
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum MemoryAccessError {
    OutOfBounds,
    Channel(ChannelError),
    #[cfg(feature = "std")]
    Io(std::io::Error),
}

pub type MemoryAccessResult<T> = Result<T, MemoryAccessError>;

impl fmt::Display for MemoryAccessError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OutOfBounds => f.write_str("out of bounds memory access"),
            Self::Channel(err) => err.fmt(f),
            #[cfg(feature = "std")]
            Self::Io(_) => f.write_str("i/o error"),
        }
    }
}

impl Error for MemoryAccessError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Channel(err) => Some(err),
            #[cfg(feature = "std")]
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ChannelError> for MemoryAccessError {
    #[cold]
    #[inline]
    fn from(error: ChannelError) -> Self {
        Self::Channel(error)
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for MemoryAccessError {
    #[cold]
    #[inline]
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

/// Failure to translate a virtual address through guest page tables.
///
/// `Invalid` carries the raw MMU entry that stopped the walk.
#[derive(Debug)]
pub enum TranslationError {
    Memory(MemoryAccessError),
    Invalid(u64),
}

pub type TranslationResult<T> = Result<T, TranslationError>;

impl From<MemoryAccessError> for TranslationError {
    fn from(err: MemoryAccessError) -> Self {
        Self::Memory(err)
    }
}

impl fmt::Display for TranslationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Memory(err) => err.fmt(f),
            Self::Invalid(_) => f.write_str("invalid MMU entry"),
        }
    }
}

impl Error for TranslationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Memory(err) => err.source(),
            Self::Invalid(_) => None,
        }
    }
}

#[derive(Debug)]
pub enum VcpuError {
    InvalidId,
    UnknownRegister,
    Channel(ChannelError),
}

pub type VcpuResult<T> = Result<T, VcpuError>;

impl fmt::Display for VcpuError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidId => f.write_str("invalid vCPU ID"),
            Self::UnknownRegister => f.write_str("unknown register"),
            Self::Channel(err) => err.fmt(f),
        }
    }
}

impl Error for VcpuError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Channel(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ChannelError> for VcpuError {
    #[cold]
    #[inline]
    fn from(error: ChannelError) -> Self {
        Self::Channel(error)
    }
}

#[derive(Debug)]
enum Repr {
    Channel(ChannelError),
    Memory(MemoryAccessError),
    Vcpu(VcpuError),
    UnmappedPage(u64),
    InvalidMmuEntry(u64),

    UnsupportedArchitecture,
    Unsupported,

    MissingModule(Box<str>),
    MissingSymbol(Box<str>),
    MissingField(Box<str>, Box<str>),

    BreakpointConflict(u64),
    UnknownBreakpoint,
    BadState(Box<str>),

    NullPtr,

    #[cfg(feature = "std")]
    Io(std::io::Error),
    Other(Box<dyn Error + Send + Sync>),
    Context(Box<str>, Option<Box<dyn Error + Send + Sync>>),
}

#[derive(Debug)]
#[repr(transparent)]
pub struct IceError {
    repr: Box<Repr>,
}

pub type IceResult<T> = Result<T, IceError>;

impl IceError {
    #[inline]
    fn from_repr(repr: Repr) -> Self {
        Self {
            repr: Box::new(repr),
        }
    }

    #[cold]
    pub fn missing_module(name: &str) -> Self {
        Self::from_repr(Repr::MissingModule(name.into()))
    }

    #[cold]
    pub fn missing_symbol(sym: &str) -> Self {
        Self::from_repr(Repr::MissingSymbol(sym.into()))
    }

    #[cold]
    pub fn missing_field(field: &str, typ: &str) -> Self {
        Self::from_repr(Repr::MissingField(field.into(), typ.into()))
    }

    #[cold]
    pub fn unmapped_page(addr: crate::VirtualAddress) -> Self {
        Self::from_repr(Repr::UnmappedPage(addr.0))
    }

    #[cold]
    pub fn breakpoint_conflict(addr: crate::PhysicalAddress) -> Self {
        Self::from_repr(Repr::BreakpointConflict(addr.0))
    }

    #[cold]
    pub fn unknown_breakpoint() -> Self {
        Self::from_repr(Repr::UnknownBreakpoint)
    }

    #[cold]
    pub fn bad_state(msg: impl fmt::Display) -> Self {
        Self::from_repr(Repr::BadState(msg.to_string().into()))
    }

    #[cold]
    pub fn deref_null_ptr() -> Self {
        Self::from_repr(Repr::NullPtr)
    }

    #[cold]
    pub fn unsupported_architecture() -> Self {
        Self::from_repr(Repr::UnsupportedArchitecture)
    }

    #[cold]
    pub fn unsupported() -> Self {
        Self::from_repr(Repr::Unsupported)
    }

    #[cold]
    pub fn new(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::from_repr(Repr::Other(err.into()))
    }

    #[cold]
    pub fn with_context(msg: impl ToString, err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::from_repr(Repr::Context(msg.to_string().into(), Some(err.into())))
    }

    /// Transport failures are fatal for the current session and unwind to the
    /// event loop as a `Crash` event.
    #[inline]
    pub fn is_transport(&self) -> bool {
        matches!(&*self.repr, Repr::Channel(_))
    }

    pub fn print_backtrace(&self) -> String {
        let mut trace = String::new();
        fmt::write(&mut trace, format_args!("{self:#}")).unwrap();
        trace
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Repr::Channel(_) => f.write_str("hypervisor channel failure"),
            Repr::Memory(_) => f.write_str("failed to access physical memory"),
            Repr::Vcpu(_) => f.write_str("failed to access registers"),
            Repr::UnmappedPage(addr) => {
                f.write_fmt(format_args!("unmapped virtual address 0x{addr:x}"))
            }
            Repr::InvalidMmuEntry(entry) => {
                f.write_fmt(format_args!("invalid MMU entry 0x{entry:x}"))
            }
            Repr::UnsupportedArchitecture => {
                f.write_str("operation unsupported by the architecture")
            }
            Repr::Unsupported => f.write_str("unsupported operation"),
            Repr::MissingModule(name) => {
                f.write_fmt(format_args!("missing required module \"{name}\""))
            }
            Repr::MissingSymbol(sym) => {
                f.write_fmt(format_args!("missing required symbol \"{sym}\""))
            }
            Repr::MissingField(field, typ) => f.write_fmt(format_args!(
                "missing required field \"{field}\" in type \"{typ}\""
            )),
            Repr::BreakpointConflict(addr) => f.write_fmt(format_args!(
                "a breakpoint of an incompatible kind is already set at 0x{addr:x}"
            )),
            Repr::UnknownBreakpoint => f.write_str("unknown breakpoint id"),
            Repr::BadState(msg) => f.write_str(msg),
            Repr::NullPtr => f.write_str("attempted to deref NULL pointer"),
            #[cfg(feature = "std")]
            Repr::Io(_) => f.write_str("I/O error"),
            Repr::Context(msg, _) => f.write_str(msg),
            Repr::Other(err) => err.fmt(f),
        }
    }
}

impl fmt::Display for IceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            f.write_fmt(format_args!("{}", self.repr))?;

            let mut current = self.source();

            if current.is_some() {
                f.write_str("\n\nCaused by:")?;
            }

            while let Some(cause) = current {
                f.write_fmt(format_args!("\n    {cause}"))?;
                current = cause.source();
            }

            Ok(())
        } else {
            self.repr.fmt(f)
        }
    }
}

impl Error for IceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &*self.repr {
            Repr::Channel(err) => Some(err),
            Repr::Memory(err) => Some(err),
            Repr::Vcpu(err) => Some(err),
            #[cfg(feature = "std")]
            Repr::Io(err) => Some(err),
            Repr::Context(_, err) => Some(&**err.as_ref()?),
            Repr::Other(err) => err.source(),
            _ => None,
        }
    }
}

impl From<&str> for IceError {
    #[cold]
    fn from(msg: &str) -> Self {
        Self::from_repr(Repr::Context(msg.into(), None))
    }
}

impl From<String> for IceError {
    #[cold]
    fn from(msg: String) -> Self {
        Self::from_repr(Repr::Context(msg.into(), None))
    }
}

impl From<ChannelError> for IceError {
    #[cold]
    fn from(err: ChannelError) -> Self {
        Self::from_repr(Repr::Channel(err))
    }
}

impl From<MemoryAccessError> for IceError {
    #[cold]
    fn from(err: MemoryAccessError) -> Self {
        Self::from_repr(Repr::Memory(err))
    }
}

impl From<VcpuError> for IceError {
    #[cold]
    fn from(err: VcpuError) -> Self {
        Self::from_repr(Repr::Vcpu(err))
    }
}

impl From<TranslationError> for IceError {
    #[cold]
    fn from(err: TranslationError) -> Self {
        match err {
            TranslationError::Memory(err) => err.into(),
            TranslationError::Invalid(entry) => Self::from_repr(Repr::InvalidMmuEntry(entry)),
        }
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for IceError {
    #[cold]
    fn from(error: std::io::Error) -> Self {
        Self::from_repr(Repr::Io(error))
    }
}

pub trait TranslationResultExt<T>: seal::Sealed {
    /// Turns an invalid translation into `None`, keeping transport failures.
    fn maybe_invalid(self) -> MemoryAccessResult<Option<T>>;
}

impl<T> TranslationResultExt<T> for TranslationResult<T> {
    fn maybe_invalid(self) -> MemoryAccessResult<Option<T>> {
        match self {
            Ok(x) => Ok(Some(x)),
            Err(TranslationError::Invalid(_)) => Ok(None),
            Err(TranslationError::Memory(err)) => Err(err),
        }
    }
}

pub trait ResultExt<T>: seal::Sealed {
    fn context(self, msg: impl ToString) -> IceResult<T>;

    fn with_context<F, S>(self, msg: F) -> IceResult<T>
    where
        F: FnOnce() -> S,
        S: ToString;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Box<dyn Error + Send + Sync>>,
{
    fn context(self, msg: impl ToString) -> IceResult<T> {
        self.map_err(|err| IceError::with_context(msg.to_string(), err))
    }

    fn with_context<F, S>(self, msg: F) -> IceResult<T>
    where
        F: FnOnce() -> S,
        S: ToString,
    {
        self.map_err(|err| IceError::with_context(msg().to_string(), err))
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn context(self, msg: impl ToString) -> IceResult<T> {
        self.ok_or_else(|| IceError::new(msg.to_string()))
    }

    fn with_context<F, S>(self, msg: F) -> IceResult<T>
    where
        F: FnOnce() -> S,
        S: ToString,
    {
        self.ok_or_else(|| IceError::new(msg().to_string()))
    }
}
