//! Read-only view of an environment's own page tables.
//!
//! A user environment may inspect, but never modify, the entries that map its
//! address space. On real hardware this is done with a recursive mapping of
//! the page directory into itself; here the same information is offered by
//! [`Vpt`], which borrows the directory immutably. All mutation goes through
//! the page system calls.

use super::page_table::{PageDir, Pde, Pte};
use crate::addressing::Va;

/// A read-only reflection of one address space.
///
/// Lookups never fail: an address whose page table is missing simply yields
/// an empty entry.
#[derive(Clone, Copy)]
pub struct Vpt<'a> {
    pgdir: Option<&'a PageDir>,
}

impl<'a> Vpt<'a> {
    pub(crate) fn new(pgdir: Option<&'a PageDir>) -> Self {
        Self { pgdir }
    }

    /// The page directory entry covering `va`.
    pub fn pde(&self, va: Va) -> Pde {
        self.pgdir.map(|pgdir| pgdir.pde(va)).unwrap_or_default()
    }

    /// The page table entry of the page containing `va`.
    pub fn pte(&self, va: Va) -> Pte {
        self.pgdir
            .and_then(|pgdir| pgdir.walk(va.page_down()).ok())
            .unwrap_or_default()
    }

    /// The page table entry of virtual page number `pn`.
    pub fn pte_at(&self, pn: usize) -> Pte {
        Va::from_pgnum(pn).map(|va| self.pte(va)).unwrap_or_default()
    }

    /// Every present page in `[start, end)`, in address order.
    ///
    /// Regions whose directory entry is absent are skipped as a whole. The
    /// result is a snapshot: later changes to the address space are not
    /// reflected in it.
    pub fn present_pages(&self, start: Va, end: Va) -> Vec<Va> {
        self.pgdir
            .map(|pgdir| {
                pgdir
                    .mappings()
                    .into_iter()
                    .map(|(va, _)| va)
                    .filter(|va| *va >= start && *va < end)
                    .collect()
            })
            .unwrap_or_default()
    }
}
