//! # Two-Level Page Table of the simulated 32-bit machine
//!
//! Every environment owns a [`PageDir`]: a page directory of
//! [`NPDENTRIES`] entries, each of which may point to a page table of
//! [`NPTENTRIES`] entries. A page table entry maps one 4 KiB virtual page to
//! one physical frame.
//!
//! ```text
//! 31                   22 21                   12 11                    0
//! +----------------------+----------------------+-----------------------+
//! |   Page Directory     |     Page Table       |    Offset within Page |
//! |       Index          |       Index          |                       |
//! +----------------------+----------------------+-----------------------+
//!  \--- pdx(va) --------/ \--- ptx(va) --------/
//! ```
//!
//! Each entry is a 32-bit word: the upper 20 bits hold the physical frame, the
//! lower 12 bits hold [`PteFlags`]. The three bits in [`PteFlags::AVAIL`] are
//! ignored by the MMU and left for software use; the user library keeps its
//! copy-on-write marker there.
//!
//! Tables are created lazily on the first mapping inside their 4 MiB region
//! and each consumes one frame from the machine's [`FrameAllocator`], so the
//! cost of page tables is visible to resource exhaustion. Page directory
//! entries are always `P | W | U`; the effective permission of a page is
//! decided by its page table entry alone.
//!
//! The directory owns a [`Page`] handle for every mapped frame. Mapping the
//! same frame into several directories therefore keeps it alive until the last
//! mapping goes away.

use super::{FrameAllocator, Page};
use crate::{
    KernelError,
    addressing::{Pa, Va},
    memlayout::{NPDENTRIES, NPTENTRIES, PDXSHIFT, PGSHIFT, pdx, ptx},
    trap::PFErrorCode,
};
use std::sync::Arc;

bitflags::bitflags! {
    /// Flags for page directory and page table entries.
    pub struct PteFlags: u32 {
        /// Present.
        const P = 1 << 0;
        /// Writeable.
        const W = 1 << 1;
        /// User.
        const U = 1 << 2;
        /// Write-Through.
        const PWT = 1 << 3;
        /// Cache-Disable.
        const PCD = 1 << 4;
        /// Accessed.
        const A = 1 << 5;
        /// Dirty.
        const D = 1 << 6;
        /// Page Size.
        const PS = 1 << 7;
        /// Global.
        const G = 1 << 8;
        /// Available for software use; the MMU ignores these bits.
        const AVAIL = 0xe00;
        /// Only flags in this mask may be used in system calls.
        const SYSCALL = Self::P.bits | Self::W.bits | Self::U.bits | Self::AVAIL.bits;
    }
}

/// Page Table Entry (PTE).
///
/// A raw 32-bit entry word: the physical address of the mapped frame ORed
/// with its [`PteFlags`]. An entry whose `P` bit is clear maps nothing.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pte(pub u32);

impl Pte {
    /// Build an entry mapping `pa` with `flags`.
    #[inline]
    pub const fn new(pa: Pa, flags: PteFlags) -> Self {
        Self((pa.into_usize() as u32 & !0xfff) | flags.bits())
    }

    /// Get the physical address pointed to by this entry.
    ///
    /// # Returns
    /// - `Some(Pa)` if the page is present, containing the physical address.
    /// - `None` if the page is not present (i.e., the "P" flag is not set).
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.is_present() {
            Pa::new((self.0 & !0xfff) as usize)
        } else {
            None
        }
    }

    /// Get the flags associated with this page table entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Returns `true` if the entry maps a page.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.0 & PteFlags::P.bits() != 0
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.pa() {
            Some(pa) => write!(f, "Pte({:?}, {:?})", pa, self.flags()),
            None => write!(f, "Pte(.)"),
        }
    }
}

/// Page Directory Entry (PDE).
///
/// Same encoding as a [`Pte`], pointing to the frame of a page table.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pde(pub u32);

impl Pde {
    /// Get the physical address of the page table this entry points to.
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        Pte(self.0).pa()
    }

    /// Get the flags associated with this page directory entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Returns `true` if a page table is installed.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.0 & PteFlags::P.bits() != 0
    }
}

impl core::fmt::Debug for Pde {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.pa() {
            Some(pa) => write!(f, "Pde({:?}, {:?})", pa, self.flags()),
            None => write!(f, "Pde(.)"),
        }
    }
}

/// Page Table Mapping Error.
///
/// This enum represents errors that can occur when working with page table
/// mappings in the virtual memory system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableMappingError {
    /// Unaligned address.
    ///
    /// This error is returned when an address provided for a page table entry
    /// is not properly aligned to the page size.
    Unaligned,

    /// Not exist.
    ///
    /// This error is returned when a requested page table entry does not exist
    /// or is invalid.
    NotExist,

    /// No frame is left to hold a new page table.
    NoMemory,
}

impl From<PageTableMappingError> for KernelError {
    fn from(e: PageTableMappingError) -> Self {
        match e {
            PageTableMappingError::Unaligned | PageTableMappingError::NotExist => {
                KernelError::InvalidArgument
            }
            PageTableMappingError::NoMemory => KernelError::NoMemory,
        }
    }
}

/// Represents page table indices for a given virtual address (VA).
///
/// This structure extracts the index values for both levels of the paging
/// hierarchy from a page-aligned virtual address.
pub struct PtIndices {
    /// The virtual address (VA) associated with this page table index
    /// breakdown.
    pub va: Va,

    /// Page Directory Index (PDEI).
    pub pdei: usize,

    /// Page Table Index (PTEI).
    pub ptei: usize,
}

impl PtIndices {
    /// Extracts page table indices from a given virtual address ([`Va`]).
    ///
    /// # Returns
    /// - `Ok(Self)`: If `va` is page-aligned (i.e., lower 12 bits are zero).
    /// - `Err(PageTableMappingError::Unaligned)`: If `va` is not page-aligned.
    pub fn from_va(va: Va) -> Result<Self, PageTableMappingError> {
        if va.is_page_aligned() {
            Ok(Self {
                va,
                pdei: pdx(va),
                ptei: ptx(va),
            })
        } else {
            Err(PageTableMappingError::Unaligned)
        }
    }
}

/// A mapped slot: the owning handle plus the flags of its entry.
struct Mapping {
    page: Page,
    flags: PteFlags,
}

/// One second-level table. Lives in its own frame.
struct PageTable {
    frame: Page,
    entries: Box<[Option<Mapping>]>,
    mapped: usize,
}

impl PageTable {
    fn new(allocator: &Arc<FrameAllocator>) -> Result<Self, PageTableMappingError> {
        let frame = Page::new(allocator).map_err(|_| PageTableMappingError::NoMemory)?;
        Ok(Self {
            frame,
            entries: (0..NPTENTRIES).map(|_| None).collect(),
            mapped: 0,
        })
    }
}

/// Page directory of one address space.
///
/// This implements the two-level page table structure. It provides methods for
/// mapping virtual addresses (VAs) to physical pages with different permission
/// levels, unmapping pages, and walking the page table to find page table
/// entries (PTEs) for given virtual addresses.
pub struct PageDir {
    frame: Page,
    tables: Box<[Option<PageTable>]>,
    allocator: Arc<FrameAllocator>,
}

impl PageDir {
    /// Create an empty page directory.
    ///
    /// # Returns
    /// - `Err(KernelError::NoMemory)` if no frame is left for the directory
    ///   itself.
    pub fn new(allocator: &Arc<FrameAllocator>) -> Result<Self, KernelError> {
        Ok(Self {
            frame: Page::new(allocator)?,
            tables: (0..NPDENTRIES).map(|_| None).collect(),
            allocator: allocator.clone(),
        })
    }

    /// Get physical address of this page directory.
    pub fn pa(&self) -> Pa {
        self.frame.pa()
    }

    /// Map a virtual address (`va`) to a physical page (`pg`) with the
    /// specified flags.
    ///
    /// `P` is always added to `flags`. If `va` is already mapped, the old
    /// mapping is replaced in one step and its page is returned; there is no
    /// moment in which `va` is unmapped. The page table covering `va` is
    /// allocated first, so a failure leaves the directory untouched.
    ///
    /// # Arguments
    /// - `va`: The virtual address to map.
    /// - `pg`: The physical page to map to the virtual address.
    /// - `flags`: The flags of the new entry.
    ///
    /// # Returns
    /// - `Ok(Some(Page))` with the replaced page.
    /// - `Ok(None)` if `va` was not mapped before.
    /// - `Err(PageTableMappingError::Unaligned)` if `va` is not page-aligned.
    /// - `Err(PageTableMappingError::NoMemory)` if a page table was needed but
    ///   no frame is left.
    pub fn map(
        &mut self,
        va: Va,
        pg: Page,
        flags: PteFlags,
    ) -> Result<Option<Page>, PageTableMappingError> {
        let indices = PtIndices::from_va(va)?;
        let table = match &mut self.tables[indices.pdei] {
            Some(table) => table,
            slot => slot.insert(PageTable::new(&self.allocator)?),
        };
        let old = table.entries[indices.ptei].replace(Mapping {
            page: pg,
            flags: flags | PteFlags::P,
        });
        if old.is_none() {
            table.mapped += 1;
        }
        Ok(old.map(|mapping| mapping.page))
    }

    /// Unmap the given virtual address (`va`) and return the physical page that
    /// was mapped to it.
    ///
    /// # Returns
    /// - `Ok(Page)`: the page that was mapped at `va`.
    /// - `Err(PageTableMappingError::NotExist)`: `va` was not mapped.
    /// - `Err(PageTableMappingError::Unaligned)`: `va` is not page-aligned.
    pub fn unmap(&mut self, va: Va) -> Result<Page, PageTableMappingError> {
        let indices = PtIndices::from_va(va)?;
        let table = self.tables[indices.pdei]
            .as_mut()
            .ok_or(PageTableMappingError::NotExist)?;
        let mapping = table.entries[indices.ptei]
            .take()
            .ok_or(PageTableMappingError::NotExist)?;
        table.mapped -= 1;
        Ok(mapping.page)
    }

    /// Walk through the page table to find the page table entry (PTE) for the
    /// given virtual address (`va`).
    ///
    /// # Returns
    /// - `Ok(Pte)`: the present entry mapping `va`.
    /// - `Err(PageTableMappingError::NotExist)`: nothing is mapped at `va`.
    /// - `Err(PageTableMappingError::Unaligned)`: `va` is not page-aligned.
    pub fn walk(&self, va: Va) -> Result<Pte, PageTableMappingError> {
        let indices = PtIndices::from_va(va)?;
        self.tables[indices.pdei]
            .as_ref()
            .and_then(|table| table.entries[indices.ptei].as_ref())
            .map(|mapping| Pte::new(mapping.page.pa(), mapping.flags))
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Find the page mapped at `va` along with the flags of its entry.
    pub fn lookup(&self, va: Va) -> Option<(&Page, PteFlags)> {
        let indices = PtIndices::from_va(va).ok()?;
        self.tables[indices.pdei]
            .as_ref()
            .and_then(|table| table.entries[indices.ptei].as_ref())
            .map(|mapping| (&mapping.page, mapping.flags))
    }

    /// The directory entry covering `va`.
    pub fn pde(&self, va: Va) -> Pde {
        match &self.tables[pdx(va)] {
            Some(table) => {
                Pde(Pte::new(table.frame.pa(), PteFlags::P | PteFlags::W | PteFlags::U).0)
            }
            None => Pde(0),
        }
    }

    /// Check a user-mode access to `va` the way the MMU does.
    ///
    /// # Returns
    /// - `Ok(Page)`: the page backing `va`, if the access is allowed.
    /// - `Err(PFErrorCode)`: the error code of the resulting page fault.
    ///   [`PFErrorCode::PRESENT`] is set if a page is mapped but the access
    ///   violates its protection.
    pub fn translate(&self, va: Va, write: bool) -> Result<Page, PFErrorCode> {
        let mut err = PFErrorCode::USER;
        if write {
            err |= PFErrorCode::WRITE;
        }
        match self.lookup(va.page_down()) {
            None => Err(err),
            Some((_, flags)) if !flags.contains(PteFlags::U) => Err(err | PFErrorCode::PRESENT),
            Some((_, flags)) if write && !flags.contains(PteFlags::W) => {
                Err(err | PFErrorCode::PRESENT)
            }
            Some((page, _)) => Ok(page.clone()),
        }
    }

    /// Every present mapping, in address order.
    pub fn mappings(&self) -> Vec<(Va, Pte)> {
        self.tables
            .iter()
            .enumerate()
            .filter_map(|(pdei, table)| table.as_ref().map(|table| (pdei, table)))
            .flat_map(|(pdei, table)| {
                table
                    .entries
                    .iter()
                    .enumerate()
                    .filter_map(move |(ptei, mapping)| {
                        let mapping = mapping.as_ref()?;
                        let va = Va::new((pdei << PDXSHIFT) | (ptei << PGSHIFT))?;
                        Some((va, Pte::new(mapping.page.pa(), mapping.flags)))
                    })
            })
            .collect()
    }

    /// Number of frames held by the directory structure itself: the
    /// directory page plus one frame per page table.
    pub fn table_frames(&self) -> usize {
        1 + self.tables.iter().flatten().count()
    }

    /// Clears all entries from the page directory and deallocates associated
    /// pages.
    ///
    /// Every mapped page handle is dropped and every page table is freed,
    /// leaving only the directory page itself. Frames still mapped by
    /// another address space stay alive.
    ///
    /// This method is automatically called when a [`PageDir`] is dropped.
    pub fn clear(&mut self) {
        for slot in self.tables.iter_mut() {
            if let Some(table) = slot.take() {
                debug_assert_eq!(
                    table.mapped,
                    table.entries.iter().flatten().count(),
                    "page table bookkeeping is out of sync"
                );
            }
        }
    }
}

impl Drop for PageDir {
    fn drop(&mut self) {
        self.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    #[test]
    fn entry_encoding() {
        let pa = Pa::new(0x0012_3000).unwrap();
        let pte = Pte::new(pa, PteFlags::P | PteFlags::U | PteFlags::from_bits_truncate(0x800));
        assert_eq!(pte.0, 0x0012_3805);
        assert_eq!(pte.pa(), Some(pa));
        assert!(pte.flags().contains(PteFlags::U));
        assert_eq!(Pte(0x0012_3004).pa(), None);
        assert!(!Pte::default().is_present());
    }

    #[test]
    fn unaligned_is_rejected() {
        assert!(matches!(
            PtIndices::from_va(va(0x1234)),
            Err(PageTableMappingError::Unaligned)
        ));
        let idx = PtIndices::from_va(va(0xeebf_f000)).unwrap();
        assert_eq!((idx.pdei, idx.ptei), (0x3ba, 0x3ff));
    }

    #[test]
    fn tables_are_charged_to_the_pool() {
        let allocator = FrameAllocator::new(3);
        let mut pgdir = PageDir::new(&allocator).unwrap();
        let page = Page::new(&allocator).unwrap();
        // Directory + page leave one frame for the table.
        assert!(pgdir.map(va(0x1000), page.clone(), PteFlags::U).unwrap().is_none());
        assert_eq!(allocator.free_frames(), 0);
        assert_eq!(
            pgdir.map(va(0x40_0000), page.clone(), PteFlags::U).unwrap_err(),
            PageTableMappingError::NoMemory
        );
        assert!(pgdir.walk(va(0x40_0000)).is_err());
        assert_eq!(pgdir.table_frames(), 2);
        drop(page);
        drop(pgdir);
        assert_eq!(allocator.free_frames(), 3);
    }

    #[test]
    fn translate_reports_fault_codes() {
        let allocator = FrameAllocator::new(8);
        let mut pgdir = PageDir::new(&allocator).unwrap();
        pgdir
            .map(va(0x1000), Page::new(&allocator).unwrap(), PteFlags::U)
            .unwrap();
        pgdir
            .map(va(0x2000), Page::new(&allocator).unwrap(), PteFlags::empty())
            .unwrap();

        assert!(pgdir.translate(va(0x1234), false).is_ok());
        assert_eq!(
            pgdir.translate(va(0x1234), true).unwrap_err(),
            PFErrorCode::USER | PFErrorCode::WRITE | PFErrorCode::PRESENT
        );
        assert_eq!(
            pgdir.translate(va(0x2000), false).unwrap_err(),
            PFErrorCode::USER | PFErrorCode::PRESENT
        );
        assert_eq!(
            pgdir.translate(va(0x3000), true).unwrap_err(),
            PFErrorCode::USER | PFErrorCode::WRITE
        );
    }
}
