//! # exokern: a simulated exokernel for user-level virtual memory
//!
//! `exokern` models a small exokernel in the style of a teaching operating
//! system: a single core, a 32-bit two-level page table per environment, and
//! a system call interface that exposes raw page mapping to user space. The
//! kernel deliberately knows nothing about copy-on-write or process
//! duplication. It only offers the mechanisms:
//!
//! - **Page primitives**: allocate a zeroed page, map a page from one address
//!   space into another with chosen permissions, unmap a page
//!   ([`UserCtx::sys_page_alloc`], [`UserCtx::sys_page_map`],
//!   [`UserCtx::sys_page_unmap`]).
//! - **Environment primitives**: create a blank, not-yet-runnable child
//!   ([`UserCtx::sys_exofork`]), change its run state
//!   ([`UserCtx::sys_env_set_status`]), destroy it
//!   ([`UserCtx::sys_env_destroy`]).
//! - **Page-fault upcalls**: a fault in user mode is reflected back to the
//!   faulting environment on its own exception stack
//!   ([`UserCtx::sys_env_set_pgfault_upcall`], see [`trap`]).
//! - **A read-only view** of the environment's own page tables
//!   ([`UserCtx::vpt`]).
//!
//! Policies such as copy-on-write `fork` are built on top of these in user
//! space.
//!
//! ## Execution model
//!
//! User programs are Rust closures running against a [`UserCtx`], the handle
//! through which an environment touches its memory and issues system calls.
//! Scheduling is cooperative round-robin: a [`Kernel`] runs one environment
//! at a time until its current continuation returns. An environment gives up
//! the CPU with [`UserCtx::sys_yield`], handing the kernel the continuation to
//! resume later; returning without one ends the environment.
//!
//! A fatal condition inside an environment is an [`Abort`]. It travels back
//! to the scheduler with `?` and terminates only that environment, whose
//! [`ExitStatus`] is then recorded for inspection.
//!
//! ## Getting Started
//!
//! ```
//! use exokern::{
//!     ExitStatus, Kernel, UserCtx, addressing::Va, env::EnvId, mm::page_table::PteFlags,
//! };
//!
//! let mut kernel = Kernel::builder().npages(64).build();
//! let id = kernel
//!     .spawn(|ctx: &mut UserCtx<'_>| {
//!         let va = Va::new(0x1000).unwrap();
//!         ctx.sys_page_alloc(EnvId::CURRENT, va, PteFlags::U | PteFlags::W)
//!             .expect("sys_page_alloc");
//!         ctx.write(va, b"hello")?;
//!         Ok(0)
//!     })
//!     .unwrap();
//! kernel.run();
//! assert_eq!(kernel.exit_status(id), Some(&ExitStatus::Exited(0)));
//! ```

pub mod addressing;
pub mod env;
pub mod memlayout;
pub mod mm;
pub mod sched;
pub mod syscall;
pub mod trap;

mod abort;

pub use abort::{Abort, ExitStatus};
pub use sched::{Kernel, KernelBuilder};
pub use syscall::{Exofork, UserCtx};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Enum representing errors that can occur during a kernel operation.
///
/// This enum is used to categorize errors encountered by a system call.
/// Each variant corresponds to a specific type of error that might
/// occur during the handling of a kernel operation. These errors are
/// returned to the user program to indicate the nature of the failure.
///
/// Each variant carries its traditional negative error number, available
/// through `i32::from` and parsed back with `KernelError::try_from`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum KernelError {
    /// Environment doesn't exist or otherwise cannot be used in the requested
    /// action. (E_BAD_ENV)
    BadEnv = -2,
    /// Invalid parameter. (E_INVAL)
    InvalidArgument = -3,
    /// Request failed due to memory shortage. (E_NO_MEM)
    NoMemory = -4,
    /// Attempt to create a new environment beyond the maximum allowed.
    /// (E_NO_FREE_ENV)
    NoFreeEnv = -5,
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            KernelError::BadEnv => "bad environment",
            KernelError::InvalidArgument => "invalid parameter",
            KernelError::NoMemory => "out of memory",
            KernelError::NoFreeEnv => "out of environments",
        })
    }
}

impl std::error::Error for KernelError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_conversion() {
        for e in [
            KernelError::BadEnv,
            KernelError::InvalidArgument,
            KernelError::NoMemory,
            KernelError::NoFreeEnv,
        ] {
            let errno = i32::from(e);
            assert!(errno < 0);
            assert_eq!(KernelError::try_from(errno).unwrap(), e);
        }
        assert_eq!(i32::from(KernelError::NoMemory), -4);
        assert!(KernelError::try_from(0).is_err());
        assert!(KernelError::try_from(-1).is_err());
    }

    #[test]
    fn messages() {
        assert_eq!(KernelError::NoFreeEnv.to_string(), "out of environments");
    }
}
