//! User-level page fault handler support.
//!
//! The kernel calls a single upcall for every page fault of an environment.
//! This module installs [`pgfault_upcall`] as that upcall and lets the
//! program choose the handler it dispatches to.
//!
//! The upcall runs on the *exception stack*, one page just below
//! [`UXSTACKTOP`]. That page belongs to one environment only: it is never
//! shared and never copy-on-write, because the code resolving a
//! copy-on-write fault cannot itself run on a page that might fault.
//!
//! [`UXSTACKTOP`]: exokern::memlayout::UXSTACKTOP

use crate::OrAbort;
use exokern::{
    Abort, UserCtx,
    env::EnvId,
    memlayout::UXSTACK_VA,
    mm::page_table::PteFlags,
    trap::{UTrapframe, Upcall},
};

/// The upcall registered with the kernel.
///
/// Dispatches to the handler stored by [`set_pgfault_handler`] in the
/// environment's task-local storage.
pub fn pgfault_upcall(ctx: &mut UserCtx<'_>, utf: &UTrapframe) -> Result<(), Abort> {
    match ctx.tls().pgfault_handler {
        Some(handler) => handler(ctx, utf),
        None => Err(Abort::UnhandledFault {
            env: ctx.env_id(),
            va: utf.fault_va,
            err: utf.err,
        }),
    }
}

/// Set the page fault handler function.
///
/// The first time a handler is registered, the exception stack is allocated
/// (unless it is already mapped) and [`pgfault_upcall`] is registered with
/// the kernel. Later calls only replace the handler.
///
/// # Returns
/// - `Err(Abort::Panic)` if the exception stack cannot be allocated or the
///   upcall cannot be registered.
pub fn set_pgfault_handler(ctx: &mut UserCtx<'_>, handler: Upcall) -> Result<(), Abort> {
    let me = ctx.env_id();
    let mut tls = ctx.tls();
    if tls.pgfault_handler.is_none() {
        // First time through!
        if !ctx.vpt().pte(UXSTACK_VA).is_present() {
            ctx.sys_page_alloc(EnvId::CURRENT, UXSTACK_VA, PteFlags::U | PteFlags::W)
                .or_abort(me, "set_pgfault_handler: sys_page_alloc", Some(UXSTACK_VA))?;
        }
        ctx.sys_env_set_pgfault_upcall(EnvId::CURRENT, Some(pgfault_upcall))
            .or_abort(me, "set_pgfault_handler: sys_env_set_pgfault_upcall", None)?;
        log::debug!("[{}] exception stack ready", me);
    }
    tls.pgfault_handler = Some(handler);
    ctx.set_tls(tls);
    Ok(())
}
