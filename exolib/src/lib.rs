//! # exolib: user-level library on top of `exokern`
//!
//! The kernel only exports raw mechanisms: map and unmap pages, create a
//! blank environment, deliver page faults back to user space. This library
//! builds policy on top of them, entirely in user mode:
//!
//! - [`vpt`]: read the environment's own page tables.
//! - [`pgfault`]: register a page-fault handler; the library allocates the
//!   exception stack and installs the trampoline the kernel calls.
//! - [`fork`]: duplicate the calling environment with copy-on-write
//!   sharing, resolving write faults on shared pages lazily.
//!
//! ## Program entry
//!
//! User programs are written as closures run through [`libmain`], which sets
//! up the self pointer at [`UTHISENV`] before calling the program body:
//!
//! ```
//! use exokern::{ExitStatus, Kernel, UserCtx};
//! use exolib::{libmain, thisenv};
//!
//! let mut kernel = Kernel::builder().npages(64).build();
//! let id = kernel
//!     .spawn(libmain(|ctx: &mut UserCtx<'_>| {
//!         assert_eq!(thisenv(ctx)?, ctx.sys_getenvid());
//!         Ok(0)
//!     }))
//!     .unwrap();
//! kernel.run();
//! assert_eq!(kernel.exit_status(id), Some(&ExitStatus::Exited(0)));
//! ```
//!
//! ## Failures
//!
//! System calls report errors as [`KernelError`]; none of the operations in
//! this library can recover from one. [`OrAbort::or_abort`] turns such an
//! error into an [`Abort::Panic`] naming the operation, the address and the
//! environment, which terminates the environment once propagated.
//!
//! [`UTHISENV`]: exokern::memlayout::UTHISENV

pub mod fork;
pub mod pgfault;
pub mod vpt;

pub use fork::{PTE_COW, duppage, fork, pgfault};
pub use pgfault::set_pgfault_handler;

use exokern::{
    Abort, KernelError, UserCtx, addressing::Va, env::EnvId, memlayout::UTHISENV_VA,
};

/// Convert a failed system call into a fatal [`Abort`].
pub trait OrAbort<T> {
    /// Map the error to [`Abort::Panic`] attributed to environment `env`.
    ///
    /// `op` names the failing operation, `va` the address it was working on.
    fn or_abort(self, env: EnvId, op: &str, va: Option<Va>) -> Result<T, Abort>;
}

impl<T> OrAbort<T> for Result<T, KernelError> {
    fn or_abort(self, env: EnvId, op: &str, va: Option<Va>) -> Result<T, Abort> {
        self.map_err(|e| Abort::Panic {
            env,
            msg: op.to_owned(),
            va,
            cause: Some(e),
        })
    }
}

/// The id stored in the running environment's self pointer.
pub fn thisenv(ctx: &mut UserCtx<'_>) -> Result<EnvId, Abort> {
    ctx.read_u32(UTHISENV_VA).map(EnvId)
}

pub(crate) fn set_thisenv(ctx: &mut UserCtx<'_>, id: EnvId) -> Result<(), Abort> {
    ctx.write_u32(UTHISENV_VA, id.0)
}

/// Wrap a program body with the library prologue.
///
/// The prologue points the self pointer at the running environment.
pub fn libmain<F>(umain: F) -> impl FnOnce(&mut UserCtx<'_>) -> Result<i32, Abort> + 'static
where
    F: FnOnce(&mut UserCtx<'_>) -> Result<i32, Abort> + 'static,
{
    move |ctx: &mut UserCtx<'_>| {
        let id = ctx.sys_getenvid();
        set_thisenv(ctx, id)?;
        umain(ctx)
    }
}
