//! Physical and Virtual Memory Addressing Schemes.
//!
//! This module provides abstractions for virtual address and physical
//! address of the simulated 32-bit machine. Every user environment sees a
//! private 4 GiB virtual address space, translated into physical frames by a
//! two-level page table (see [`page_table`]).
//!
//! The module defines two types for memory addresses: [`Va`] for virtual
//! address and [`Pa`] for physical address. Both are equipped with methods to
//! facilitate page alignment and arithmetic operations on addresses.
//!
//! ## Arithmetic Operations
//!
//! Both `Pa` and `Va` types implement various arithmetic operations such as
//! addition, subtraction, and bitwise operations. These operations allow for
//! easy manipulation of addresses, such as incrementing or decrementing by
//! a specific number of bytes or performing logical operations on addresses.
//!
//! ## Example Usage:
//!
//! ```
//! use exokern::addressing::{PAGE_SIZE, Va};
//!
//! let va = Va::new(0x1234).unwrap();
//! assert_eq!(va.page_down().into_usize(), 0x1000);
//! assert_eq!((va + PAGE_SIZE).page_down().into_usize(), 0x2000);
//! ```
//!
//! [`page_table`]: crate::mm::page_table

/// The size of a single page in memory, in bytes.
///
/// This constant represents the size of a memory page, which is 4 KiB
/// (kilobytes). Both frames and page tables are exactly one page large.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page index from a given address.
pub const PAGE_SHIFT: usize = 12; // 12 bits (log2 of 4 KB)

/// A mask for extracting the offset within a page from a given address.
///
/// ## Example:
/// ```
/// # let address = 0x1234usize;
/// # use exokern::addressing::PAGE_MASK;
/// let offset_within_page = address & PAGE_MASK;
/// assert_eq!(offset_within_page, 0x234);
/// ```
pub const PAGE_MASK: usize = 0xfff;

/// Upper bound (exclusive) of both address spaces.
const ADDRESS_LIMIT: usize = 1 << 32;

/// Represents a physical address.
///
/// The `Pa` (Physical Address) struct is a wrapper around the `usize` type,
/// which represents a physical address of the simulated machine. A frame
/// number `n` lives at physical address `n << PAGE_SHIFT`.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// The physical address `0`.
    ///
    /// Frame zero is never handed out, so this address never names a page.
    pub const ZERO: Self = Self(0);

    /// Creates a new physical address if the address is valid.
    ///
    /// # Arguments
    /// - `addr`: A `usize` representing the physical address.
    ///
    /// # Returns
    /// - `Some(Pa)` if the address fits in 32 bits.
    /// - `None` if the address is outside the valid range.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < ADDRESS_LIMIT {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast the physical address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align down the physical address to the page boundary.
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align up to the physical address to the page boundary.
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the page offset from the physical address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Represents a virtual address.
///
/// The [`Va`] (Virtual Address) struct represents an address in the virtual
/// memory space of a user environment.
///
/// This abstraction provides utility methods for validation, alignment, and
/// address manipulation, ensuring safe and consistent handling of virtual
/// addresses.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is valid.
    ///
    /// This method checks whether the given address falls within the 32-bit
    /// virtual address range. If it does, a `Some(Va)` is returned;
    /// otherwise, `None` is returned.
    ///
    /// # Arguments
    /// - `addr`: A `usize` representing the virtual address.
    ///
    /// # Returns
    /// - `Some(Va)`: If the address is within the valid virtual memory range.
    /// - `None`: If the address is invalid.
    ///
    /// # Example
    /// ```
    /// # use exokern::addressing::Va;
    /// assert!(Va::new(0xeebf_f000).is_some());
    /// assert!(Va::new(0x1_0000_0000).is_none());
    /// ```
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < ADDRESS_LIMIT {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Returns the raw `usize` representation of the virtual address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Aligns the virtual address down to the nearest page boundary.
    ///
    /// # Example
    /// ```
    /// # use exokern::addressing::Va;
    /// let va = Va::new(0x1234_5678).unwrap();
    /// assert_eq!(va.page_down().into_usize(), 0x1234_5000);
    /// ```
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Aligns the virtual address up to the nearest page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the offset within the memory page from the virtual address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Returns `true` if the address lies on a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.offset() == 0
    }

    /// The virtual page number of this address.
    ///
    /// This is the index of the page's entry in the linear array of all page
    /// table entries, as exposed by the [`Vpt`] view.
    ///
    /// [`Vpt`]: crate::mm::vpt::Vpt
    #[inline]
    pub const fn pgnum(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// The first address of virtual page number `pn`.
    ///
    /// Returns `None` when `pn` lies past the end of the address space.
    #[inline]
    pub const fn from_pgnum(pn: usize) -> Option<Self> {
        Self::new(pn << PAGE_SHIFT)
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 = self.0 - other
            }
        }
        impl core::ops::BitOr<usize> for $t {
            type Output = Self;

            fn bitor(self, other: usize) -> Self {
                Self(self.0 | other)
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:08x})", self.0)
    }
}
impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}
impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:08x})", self.0)
    }
}
impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_arithmetic() {
        let va = Va::new(0x0080_0123).unwrap();
        assert_eq!(va.page_down(), Va::new(0x0080_0000).unwrap());
        assert_eq!(va.page_up(), Va::new(0x0080_1000).unwrap());
        assert_eq!(va.offset(), 0x123);
        assert_eq!(va.pgnum(), 0x800);
        assert_eq!(Va::from_pgnum(0x800), Some(va.page_down()));
        assert!(!va.is_page_aligned());
        assert_eq!(va.page_down() + PAGE_SIZE - va.page_down(), PAGE_SIZE);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(Va::new(0xffff_ffff).is_some());
        assert!(Va::new(0x1_0000_0000).is_none());
        assert!(Pa::new(0x1_0000_0000).is_none());
        assert!(Va::from_pgnum(1 << 20).is_none());
    }
}
