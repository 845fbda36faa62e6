//! Typed pointers into guest structures.
//!
//! A [`Pointer`] pairs a guest virtual address with the layout type of the
//! structure it points at; field accesses go through the OS profile so every
//! offset comes from debug data, never from hardcoded constants.

use core::fmt;
use core::marker::PhantomData;
use core::ops::ControlFlow;

use ibc::{IceError, IceResult, Process, VirtualAddress};

/// Implemented by OS backends for each guest structure they know the layout
/// of.
pub trait HasLayout<L>: ibc::Os {
    fn get_layout(&self) -> &L;
}

/// The offset of one field, tagged with the field's type.
pub struct StructOffset<T> {
    pub offset: u64,
    _typ: PhantomData<T>,
}

impl<T> fmt::Debug for StructOffset<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructOffset")
            .field("offset", &self.offset)
            .finish()
    }
}

impl<T> Clone for StructOffset<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StructOffset<T> {}

impl<T> StructOffset<T> {
    #[inline]
    pub fn new(layout: ibc::symbols::StructRef, field_name: &str) -> IceResult<Self> {
        let offset = layout.require_offset(field_name)?;
        Ok(Self::from_offset(offset))
    }

    #[inline]
    pub const fn from_offset(offset: u64) -> Self {
        Self {
            offset,
            _typ: PhantomData,
        }
    }
}

/// Marker for pointer-typed fields: the field holds the guest address of a
/// `T`.
pub struct Ptr<T>(PhantomData<T>);

/// Which address space dereferences go through.
#[derive(Clone, Copy, Debug)]
pub enum Space {
    Kernel,
    Process(Process),
}

fn read_space<Os: ibc::Os + ?Sized>(
    os: &Os,
    space: Space,
    addr: VirtualAddress,
    buf: &mut [u8],
) -> IceResult<()> {
    match space {
        Space::Kernel => os.read_kernel_memory(addr, buf),
        // Kernel halves stay visible from process context
        Space::Process(_) if addr.is_kernel() => os.read_kernel_memory(addr, buf),
        Space::Process(proc) => os.read_process_memory(proc, addr, buf),
    }
}

pub struct Pointer<'a, T, Os: ?Sized> {
    pub addr: VirtualAddress,
    pub os: &'a Os,
    pub space: Space,
    _typ: PhantomData<T>,
}

impl<T, Os: ?Sized> Clone for Pointer<'_, T, Os> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, Os: ?Sized> Copy for Pointer<'_, T, Os> {}

impl<T, U, Os: ?Sized> PartialEq<Pointer<'_, U, Os>> for Pointer<'_, T, Os> {
    #[inline]
    fn eq(&self, other: &Pointer<U, Os>) -> bool {
        self.addr == other.addr
    }
}

impl<T, Os: ?Sized> Eq for Pointer<'_, T, Os> {}

impl<T, Os: ?Sized> fmt::Debug for Pointer<'_, T, Os> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

impl<'a, T, Os: ?Sized> Pointer<'a, T, Os> {
    #[inline]
    pub fn new(addr: VirtualAddress, os: &'a Os, space: Space) -> Self {
        Pointer {
            addr,
            os,
            space,
            _typ: PhantomData,
        }
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.addr.is_null()
    }

    #[inline]
    pub fn map_non_null<U>(self, f: impl FnOnce(Self) -> IceResult<U>) -> IceResult<Option<U>> {
        if self.addr.is_null() {
            Ok(None)
        } else {
            Some(f(self)).transpose()
        }
    }

    #[inline]
    pub fn cast<U>(self) -> Pointer<'a, U, Os> {
        Pointer::new(self.addr, self.os, self.space)
    }
}

impl<'a, L, Os: ibc::Os + ?Sized> Pointer<'a, L, Os> {
    /// Pointer to a field within the structure.
    #[inline]
    pub fn field<U, F>(self, get_offset: F) -> IceResult<Pointer<'a, U, Os>>
    where
        F: FnOnce(&L) -> StructOffset<U>,
        Os: HasLayout<L>,
    {
        if self.addr.is_null() {
            return Err(IceError::deref_null_ptr());
        }

        let offset = get_offset(self.os.get_layout()).offset;
        Ok(Pointer::new(self.addr + offset, self.os, self.space))
    }

    /// Reads the value of a field.
    #[inline]
    pub fn read_field<U, F>(self, get_offset: F) -> IceResult<U>
    where
        F: FnOnce(&L) -> StructOffset<U>,
        U: bytemuck::Pod,
        Os: HasLayout<L>,
    {
        if self.addr.is_null() {
            return Err(IceError::deref_null_ptr());
        }

        let offset = get_offset(self.os.get_layout()).offset;
        let mut value = bytemuck::Zeroable::zeroed();
        read_space(
            self.os,
            self.space,
            self.addr + offset,
            bytemuck::bytes_of_mut(&mut value),
        )?;
        Ok(value)
    }

    /// Follows a pointer-typed field.
    #[inline]
    pub fn read_pointer_field<U, F>(self, get_offset: F) -> IceResult<Pointer<'a, U, Os>>
    where
        F: FnOnce(&L) -> StructOffset<Ptr<U>>,
        Os: HasLayout<L>,
    {
        if self.addr.is_null() {
            return Err(IceError::deref_null_ptr());
        }

        let offset = get_offset(self.os.get_layout()).offset;
        let mut value = VirtualAddress(0);
        read_space(
            self.os,
            self.space,
            self.addr + offset,
            bytemuck::bytes_of_mut(&mut value),
        )?;
        Ok(Pointer::new(value, self.os, self.space))
    }

    /// Re-binds the pointer to a process address space.
    #[inline]
    pub fn switch_to_userspace(self, proc: Process) -> Pointer<'a, L, Os> {
        Pointer::new(self.addr, self.os, Space::Process(proc))
    }

    pub fn read_bytes(self, offset: u64, buf: &mut [u8]) -> IceResult<()> {
        read_space(self.os, self.space, self.addr + offset, buf)
    }
}

/// Intrusive doubly-linked list support, shared by both OS backends.
pub trait ListLayout {
    /// Offset of the forward link inside the list node.
    fn next_offset(&self) -> u64;
}

impl<'a, L, Os: ibc::Os + ?Sized> Pointer<'a, L, Os>
where
    Os: HasLayout<L>,
    L: ListLayout,
{
    /// Walks an intrusive circular list, yielding the address of each
    /// containing structure (`node - container_offset`), head excluded.
    pub fn iterate_list<F>(self, container_offset: u64, mut f: F) -> IceResult<()>
    where
        F: FnMut(VirtualAddress) -> IceResult<ControlFlow<()>>,
    {
        let next = self.os.get_layout().next_offset();
        let mut pos = self.addr;

        loop {
            let mut value = VirtualAddress(0);
            read_space(
                self.os,
                self.space,
                pos + next,
                bytemuck::bytes_of_mut(&mut value),
            )?;
            pos = value;

            if pos == self.addr || pos.is_null() {
                break;
            }

            if f(pos - container_offset)?.is_break() {
                break;
            }
        }

        Ok(())
    }
}
