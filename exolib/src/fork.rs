//! Copy-on-write fork.
//!
//! [`fork`] creates a child with [`UserCtx::sys_exofork`] and populates its
//! address space from user mode. No page is copied eagerly: every writable
//! page is mapped into both environments read-only and marked with
//! [`PTE_COW`]. The first write to such a page, from either side, traps
//! into [`pgfault`], which gives the writer a private copy.
//!
//! Two pages are treated differently:
//!
//! - the exception stack is never shared; the child gets a fresh one.
//! - the page at [`UTHISENV`] is copied at once, with the self pointer
//!   rewritten to the child's id.
//!
//! [`UTHISENV`]: exokern::memlayout::UTHISENV

use crate::{
    OrAbort,
    pgfault::set_pgfault_handler,
    vpt::{pgaddr, uvpt},
};
use exokern::{
    Abort, Exofork, UserCtx,
    addressing::Va,
    env::{EnvId, EnvStatus},
    memlayout::{PFTEMP_VA, PGSIZE, UTHISENV_VA, UTOP_VA, UXSTACK_VA},
    mm::page_table::PteFlags,
    trap::{PFErrorCode, UTrapframe},
};

/// Marks a page shared copy-on-write. One of the [`PteFlags::AVAIL`] bits.
pub const PTE_COW: PteFlags = PteFlags::from_bits_truncate(0x800);

/// Custom page fault handler: resolve a write to a copy-on-write page.
///
/// Allocates a new page at [`PFTEMP`], copies the faulting page into it,
/// and maps it over the faulting page writable. Any other fault is fatal.
///
/// # Returns
/// - `Err(Abort::Panic)` if the fault is not a write to a present page, the
///   page is not copy-on-write, the page is [`PFTEMP`] itself, or a system
///   call fails.
///
/// [`PFTEMP`]: exokern::memlayout::PFTEMP
pub fn pgfault(ctx: &mut UserCtx<'_>, utf: &UTrapframe) -> Result<(), Abort> {
    let me = ctx.env_id();
    let addr = utf.fault_va;

    if !utf.err.contains(PFErrorCode::PRESENT | PFErrorCode::WRITE) {
        return Err(Abort::Panic {
            env: me,
            msg: "pgfault: not a write to a present page".to_owned(),
            va: Some(addr),
            cause: None,
        });
    }
    if addr.page_down() == PFTEMP_VA {
        return Err(Abort::Panic {
            env: me,
            msg: "pgfault: fault on the scratch page".to_owned(),
            va: Some(addr),
            cause: None,
        });
    }
    let pte = ctx.vpt().pte(addr);
    if !pte.is_present() || !pte.flags().contains(PTE_COW) {
        return Err(Abort::Panic {
            env: me,
            msg: "pgfault: not a copy-on-write page".to_owned(),
            va: Some(addr),
            cause: None,
        });
    }

    let addr = addr.page_down();
    ctx.sys_page_alloc(EnvId::CURRENT, PFTEMP_VA, PteFlags::U | PteFlags::W)
        .or_abort(me, "pgfault: sys_page_alloc", Some(addr))?;
    let mut buf = vec![0; PGSIZE];
    ctx.read(addr, &mut buf)?;
    ctx.write(PFTEMP_VA, &buf)?;
    ctx.sys_page_map(
        EnvId::CURRENT,
        PFTEMP_VA,
        EnvId::CURRENT,
        addr,
        PteFlags::U | PteFlags::W,
    )
    .or_abort(me, "pgfault: sys_page_map", Some(addr))?;
    ctx.sys_page_unmap(EnvId::CURRENT, PFTEMP_VA)
        .or_abort(me, "pgfault: sys_page_unmap", Some(PFTEMP_VA))?;
    log::debug!("[{}] copied page {} on write", me, addr);
    Ok(())
}

/// Map our virtual page `pn` into the target `child` at the same address.
///
/// If the page is writable or copy-on-write, the new mapping is
/// copy-on-write, and then our own mapping is marked copy-on-write as well.
/// The child is mapped first: once our entry loses [`PteFlags::W`], the
/// page could no longer be mapped into the child writable by mistake.
/// Read-only pages are shared with their permission unchanged.
///
/// # Returns
/// - `Err(Abort::Panic)` if a system call fails.
pub fn duppage(ctx: &mut UserCtx<'_>, child: EnvId, pn: usize) -> Result<(), Abort> {
    let me = ctx.env_id();
    let Some(va) = pgaddr(pn) else {
        return Err(Abort::panic(me, format!("duppage: bad page number {:#x}", pn)));
    };
    let flags = uvpt(ctx, pn).flags();

    if flags.intersects(PteFlags::W | PTE_COW) {
        let perm = PteFlags::U | PTE_COW;
        ctx.sys_page_map(EnvId::CURRENT, va, child, va, perm)
            .or_abort(me, "duppage: sys_page_map", Some(va))?;
        ctx.sys_page_map(EnvId::CURRENT, va, EnvId::CURRENT, va, perm)
            .or_abort(me, "duppage: sys_page_map", Some(va))?;
    } else {
        ctx.sys_page_map(EnvId::CURRENT, va, child, va, flags & PteFlags::SYSCALL)
            .or_abort(me, "duppage: sys_page_map", Some(va))?;
    }
    Ok(())
}

/// Give `child` its own copy of the page at [`UTHISENV`], pointing at
/// `child`.
///
/// [`UTHISENV`]: exokern::memlayout::UTHISENV
fn copy_thisenv(ctx: &mut UserCtx<'_>, child: EnvId) -> Result<(), Abort> {
    let me = ctx.env_id();
    ctx.sys_page_alloc(EnvId::CURRENT, PFTEMP_VA, PteFlags::U | PteFlags::W)
        .or_abort(me, "fork: sys_page_alloc", Some(PFTEMP_VA))?;
    let mut buf = vec![0; PGSIZE];
    ctx.read(UTHISENV_VA, &mut buf)?;
    buf[..4].copy_from_slice(&child.0.to_le_bytes());
    ctx.write(PFTEMP_VA, &buf)?;
    ctx.sys_page_map(
        EnvId::CURRENT,
        PFTEMP_VA,
        child,
        UTHISENV_VA,
        PteFlags::U | PteFlags::W,
    )
    .or_abort(me, "fork: sys_page_map", Some(UTHISENV_VA))?;
    ctx.sys_page_unmap(EnvId::CURRENT, PFTEMP_VA)
        .or_abort(me, "fork: sys_page_unmap", Some(PFTEMP_VA))
}

/// Copy our address space and page fault handler setup to `child`.
fn populate(ctx: &mut UserCtx<'_>, child: EnvId) -> Result<(), Abort> {
    let me = ctx.env_id();
    let upcall = ctx
        .env_info(EnvId::CURRENT)
        .and_then(|info| info.pgfault_upcall);
    ctx.sys_env_set_pgfault_upcall(child, upcall)
        .or_abort(me, "fork: sys_env_set_pgfault_upcall", None)?;

    let start = Va::new(0).ok_or_else(|| Abort::panic(me, "fork: bad address"))?;
    let pages = ctx.vpt().present_pages(start, UTOP_VA);
    for va in pages {
        if va == UXSTACK_VA {
            ctx.sys_page_alloc(child, va, PteFlags::U | PteFlags::W)
                .or_abort(me, "fork: sys_page_alloc", Some(va))?;
        } else if va == UTHISENV_VA {
            copy_thisenv(ctx, child)?;
        } else {
            duppage(ctx, child, va.pgnum())?;
        }
    }
    Ok(())
}

/// Tear down a child that failed to be set up.
fn abandon(ctx: &mut UserCtx<'_>, child: EnvId) {
    if let Err(e) = ctx.sys_env_destroy(child) {
        log::warn!("[{}] fork: cannot destroy {}: {}", ctx.env_id(), child, e);
    }
}

/// User-level fork with copy-on-write.
///
/// Sets up our page fault handler, creates a child, copies our address
/// space and page fault handler setup to the child, then marks the child as
/// runnable. Both sides continue in `then`: the parent right away with
/// [`Exofork::Parent`] carrying the child's id, the child once it is
/// scheduled with [`Exofork::Child`].
///
/// The child never runs until its address space is complete. If any step
/// after its creation fails, the child is destroyed before the error is
/// returned. [`PFTEMP`] is reserved for the copies made here and in
/// [`pgfault`], so it must not be mapped when `fork` is called.
///
/// # Returns
/// - The value returned by `then` in the parent.
/// - `Err(Abort::Panic)` if [`PFTEMP`] is mapped or a system call fails.
///
/// [`PFTEMP`]: exokern::memlayout::PFTEMP
pub fn fork<F>(ctx: &mut UserCtx<'_>, then: F) -> Result<i32, Abort>
where
    F: FnOnce(&mut UserCtx<'_>, Exofork) -> Result<i32, Abort> + Clone + 'static,
{
    let me = ctx.env_id();
    if ctx.vpt().pte(PFTEMP_VA).is_present() {
        return Err(Abort::Panic {
            env: me,
            msg: "fork: scratch page is mapped".to_owned(),
            va: Some(PFTEMP_VA),
            cause: None,
        });
    }
    set_pgfault_handler(ctx, pgfault)?;

    let child = ctx
        .sys_exofork(then.clone())
        .or_abort(me, "fork: sys_exofork", None)?;
    if let Err(abort) = populate(ctx, child) {
        abandon(ctx, child);
        return Err(abort);
    }
    if let Err(e) = ctx.sys_env_set_status(child, EnvStatus::Runnable) {
        abandon(ctx, child);
        return Err(Abort::Panic {
            env: me,
            msg: "fork: sys_env_set_status".to_owned(),
            va: None,
            cause: Some(e),
        });
    }
    log::info!("[{}] forked {}", me, child);
    then(ctx, Exofork::Parent(child))
}
