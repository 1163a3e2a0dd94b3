//! Layout of a user environment's virtual address space.
//!
//! ```text
//!    4 Gig -------->  +------------------------------+
//!                     :              .               :
//!                     :  kernel, never mapped here   :
//!    UTOP,UXSTACKTOP  +------------------------------+ 0xeec00000
//!                     |     User Exception Stack     | RW/RW  PGSIZE
//!                     +------------------------------+ 0xeebff000
//!                     |       Empty Memory (*)       | --/--  PGSIZE
//!    USTACKTOP  --->  +------------------------------+ 0xeebfe000
//!                     |      Normal User Stack       | RW/RW  PGSIZE
//!                     +------------------------------+ 0xeebfd000
//!                     :              .               :
//!    UTEXT, UTHISENV  +------------------------------+ 0x00800000
//!    PFTEMP ------->  |       Empty Memory (*)       |
//!                     |                              |
//!    UTEMP -------->  +------------------------------+ 0x00400000
//!                     |       Empty Memory (*)       |
//!    0 ------------>  +------------------------------+
//! ```
//!
//! Everything below [`UTOP`] is under the control of the environment itself
//! through the page system calls.

use crate::addressing::{PAGE_SHIFT, PAGE_SIZE, Va};

/// Bytes mapped by a page.
pub const PGSIZE: usize = PAGE_SIZE;
/// log2(PGSIZE).
pub const PGSHIFT: usize = PAGE_SHIFT;
/// Page directory entries per page directory.
pub const NPDENTRIES: usize = 1024;
/// Page table entries per page table.
pub const NPTENTRIES: usize = 1024;
/// Bytes mapped by a page directory entry.
pub const PTSIZE: usize = PGSIZE * NPTENTRIES;
/// log2(PTSIZE).
pub const PDXSHIFT: usize = 22;

/// Top of the user-controlled part of the address space.
pub const UTOP: usize = 0xeec0_0000;
/// Top of one-page user exception stack.
pub const UXSTACKTOP: usize = UTOP;
/// Top of normal user stack. Next page down from the exception stack, with
/// an unmapped guard page in between.
pub const USTACKTOP: usize = UTOP - 2 * PGSIZE;

/// Where user programs generally begin.
pub const UTEXT: usize = 2 * PTSIZE;
/// Page holding the environment's self pointer (its id, in the first word).
pub const UTHISENV: usize = UTEXT;
/// Scratch region for temporary page mappings.
pub const UTEMP: usize = PTSIZE;
/// Used for temporary page mappings for the user page-fault handler.
///
/// Reserved: the copy-on-write fault handler and `fork` map and unmap this
/// page freely, so a user page placed here would be lost. Both refuse to run
/// while something else is mapped here.
pub const PFTEMP: usize = UTEMP + PTSIZE - PGSIZE;

/// [`UTOP`] as a virtual address.
pub const UTOP_VA: Va = Va::new(UTOP).unwrap();
/// The single page of the user exception stack.
pub const UXSTACK_VA: Va = Va::new(UXSTACKTOP - PGSIZE).unwrap();
/// The lowest page of the normal user stack.
pub const USTACK_VA: Va = Va::new(USTACKTOP - PGSIZE).unwrap();
/// [`UTHISENV`] as a virtual address.
pub const UTHISENV_VA: Va = Va::new(UTHISENV).unwrap();
/// [`PFTEMP`] as a virtual address.
pub const PFTEMP_VA: Va = Va::new(PFTEMP).unwrap();

/// Page directory index of a virtual address.
#[inline]
pub const fn pdx(va: Va) -> usize {
    (va.into_usize() >> PDXSHIFT) & (NPDENTRIES - 1)
}

/// Page table index of a virtual address.
#[inline]
pub const fn ptx(va: Va) -> usize {
    (va.into_usize() >> PGSHIFT) & (NPTENTRIES - 1)
}
