//! Page-table lookups of the running environment.
//!
//! Thin helpers over [`UserCtx::vpt`], named after the classic
//! `uvpd`/`uvpt` self-mapped arrays: `uvpd` is indexed by page directory
//! index, `uvpt` by virtual page number.

use exokern::{
    UserCtx,
    addressing::Va,
    memlayout::{PDXSHIFT, PGSHIFT},
    mm::page_table::{Pde, Pte},
};

/// Virtual page number of `va`.
#[inline]
pub fn pgnum(va: Va) -> usize {
    va.pgnum()
}

/// First address of virtual page number `pn`, if it exists.
#[inline]
pub fn pgaddr(pn: usize) -> Option<Va> {
    Va::from_pgnum(pn)
}

/// Entry `pdx` of the page directory.
pub fn uvpd(ctx: &UserCtx<'_>, pdx: usize) -> Pde {
    match Va::new(pdx << PDXSHIFT) {
        Some(va) => ctx.vpt().pde(va),
        None => Pde::default(),
    }
}

/// Page table entry of virtual page number `pn`.
pub fn uvpt(ctx: &UserCtx<'_>, pn: usize) -> Pte {
    ctx.vpt().pte_at(pn)
}

/// Returns `true` if virtual page number `pn` is mapped.
pub fn is_present(ctx: &UserCtx<'_>, pn: usize) -> bool {
    uvpd(ctx, pn >> (PDXSHIFT - PGSHIFT)).is_present() && uvpt(ctx, pn).is_present()
}
