use super::mask;
use core::fmt;
use core::ops::{Add, Sub, SubAssign};

/// A guest physical address, typically the root of or an entry inside guest
/// page tables.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(transparent)]
pub struct PhysicalAddress(pub u64);

impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::UpperHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = PhysicalAddress;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<u64> for PhysicalAddress {
    type Output = PhysicalAddress;

    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0 - rhs)
    }
}

#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    bytemuck::Pod,
    bytemuck::Zeroable,
)]
#[repr(transparent)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Canonical kernel-half addresses have their high bit set on all
    /// supported guests.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        (self.0 as i64) < 0
    }

    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & mask(12)
    }

    #[inline]
    pub const fn page_base(self) -> VirtualAddress {
        VirtualAddress(self.0 & !mask(12))
    }
}

impl Add<u64> for VirtualAddress {
    type Output = VirtualAddress;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Add<i64> for VirtualAddress {
    type Output = VirtualAddress;

    fn add(self, rhs: i64) -> Self::Output {
        let (res, o) = self.0.overflowing_add(rhs as u64);

        if cfg!(debug_assertions) && (o ^ (rhs < 0)) {
            panic!("attempt to add with overflow");
        }

        Self(res)
    }
}

impl Sub<VirtualAddress> for VirtualAddress {
    type Output = i64;

    fn sub(self, rhs: VirtualAddress) -> i64 {
        self.0.overflowing_sub(rhs.0).0 as i64
    }
}

impl Sub<u64> for VirtualAddress {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self {
        Self(self.0 - rhs)
    }
}

impl SubAssign<u64> for VirtualAddress {
    fn sub_assign(&mut self, rhs: u64) {
        self.0 -= rhs;
    }
}

impl fmt::LowerHex for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::UpperHex for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A raw translation table entry, valid at any level of the table.
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(transparent)]
pub struct MmuEntry(pub u64);

impl MmuEntry {
    /// Extracts the address bits between `from` and `to`.
    #[inline]
    pub const fn take_bits(self, from: u32, to: u32) -> PhysicalAddress {
        PhysicalAddress(self.0 & (mask(to - from) << from))
    }
}

impl fmt::LowerHex for MmuEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}
