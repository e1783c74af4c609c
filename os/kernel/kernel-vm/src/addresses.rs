//! # Virtual and Physical Page Addresses
//!
//! Thin `u64` newtypes that keep user virtual addresses and physical frame
//! addresses apart at compile time. The VM core only ever deals in base
//! (4 KiB) pages, so unlike the paging code there is no page-size parameter:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | Any byte address in a process's address space. |
//! | [`VirtualPage`] | A page-aligned virtual address; the key of the SPT. |
//! | [`PhysicalAddress`] | Any byte address in physical memory. |
//! | [`PhysicalPage`] | A page-aligned physical address; the base of a frame. |
//!
//! ```rust
//! # use kernel_vm::addresses::*;
//! let va = VirtualAddress::new(0x4000_1234);
//! let page = va.page();
//! assert_eq!(page.base().as_u64(), 0x4000_1000);
//! assert_eq!(va.offset(), 0x234);
//! ```

use core::fmt;
use core::ops::{Add, Sub};

/// Size of a base page (and of a frame) in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2([`PAGE_SIZE`]).
pub const PAGE_SHIFT: u32 = 12;

/// [`PAGE_SIZE`] as a `usize`, for buffer lengths.
#[allow(clippy::cast_possible_truncation)]
pub const PAGE_BYTES: usize = PAGE_SIZE as usize;

const OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Virtual memory address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The page containing this address (lower bits zeroed).
    #[inline]
    #[must_use]
    pub const fn page(self) -> VirtualPage {
        VirtualPage(self.0 & !OFFSET_MASK)
    }

    /// The offset of this address within its page.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.offset() == 0
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, rhs: u64) -> Self {
        Self(self.0.saturating_sub(rhs))
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<VirtualPage> for VirtualAddress {
    #[inline]
    fn from(value: VirtualPage) -> Self {
        value.base()
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0 - rhs)
    }
}

/// A page-aligned virtual address.
///
/// ### Invariants
/// - The low [`PAGE_SHIFT`] bits are always zero. Construct through
///   [`VirtualPage::containing`] or [`VirtualAddress::page`].
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(u64);

impl VirtualPage {
    /// The page containing `va` (rounds down).
    #[inline]
    #[must_use]
    pub const fn containing(va: VirtualAddress) -> Self {
        va.page()
    }

    /// Returns `None` unless `va` is page-aligned.
    #[inline]
    #[must_use]
    pub const fn from_aligned(va: VirtualAddress) -> Option<Self> {
        if va.is_page_aligned() {
            Some(Self(va.as_u64()))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.0)
    }

    /// The page `n` pages above this one.
    #[inline]
    #[must_use]
    pub const fn forward(self, n: u64) -> Self {
        Self(self.0 + n * PAGE_SIZE)
    }

    /// The page `n` pages below this one.
    #[inline]
    #[must_use]
    pub const fn backward(self, n: u64) -> Self {
        Self(self.0 - n * PAGE_SIZE)
    }

    /// The page directly after this one, if it does not overflow.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(PAGE_SIZE) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

/// Physical memory address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn page(self) -> PhysicalPage {
        PhysicalPage(self.0 & !OFFSET_MASK)
    }

    #[inline]
    #[must_use]
    pub const fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<PhysicalPage> for PhysicalAddress {
    #[inline]
    fn from(value: PhysicalPage) -> Self {
        value.base()
    }
}

/// The page-aligned base address of one physical frame.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(u64);

impl PhysicalPage {
    /// The frame containing `pa` (rounds down).
    #[inline]
    #[must_use]
    pub const fn containing(pa: PhysicalAddress) -> Self {
        pa.page()
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0)
    }

    /// Physical frame number (`base >> PAGE_SHIFT`).
    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// The frame with frame number `pfn`.
    #[inline]
    #[must_use]
    pub const fn from_number(pfn: u64) -> Self {
        Self(pfn << PAGE_SHIFT)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.base(), f)
    }
}

/// Number of pages needed to hold `bytes` bytes.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}
