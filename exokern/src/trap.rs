//! Page-fault upcalls.
//!
//! The kernel does not resolve user page faults itself. When an access by a
//! user environment violates its page table, the kernel reflects the fault
//! back to the environment:
//!
//! 1. If the environment has not registered an upcall with
//!    [`UserCtx::sys_env_set_pgfault_upcall`], it is destroyed.
//! 2. Otherwise a [`UTrapframe`] describing the fault is pushed onto the
//!    environment's *user exception stack*, the single page just below
//!    [`UXSTACKTOP`]. If the environment is already running on that stack
//!    (a fault inside the handler), the new frame is pushed below the
//!    current one, leaving one empty word in between. The stack page must be
//!    mapped present, user and writable, and the frame must fit in it;
//!    otherwise the environment is destroyed.
//! 3. The upcall runs. When it returns successfully, the faulting access is
//!    retried.
//!
//! ```text
//!                     <-- UXSTACKTOP
//! trap-time esp
//! trap-time err
//! fault_va            <-- esp of the upcall
//! ```
//!
//! An upcall that keeps reporting success without making the access
//! possible would retry forever; after [`MAX_FAULT_DELIVERIES`] consecutive
//! deliveries for the same access the environment is destroyed.

use crate::{
    Abort,
    addressing::Va,
    memlayout::{PGSIZE, USTACKTOP, UXSTACK_VA, UXSTACKTOP},
    mm::page_table::PteFlags,
    syscall::UserCtx,
};

bitflags::bitflags! {
    /// Error code of a page fault.
    pub struct PFErrorCode: u32 {
        /// The fault was caused by a page-level protection violation. If
        /// clear, the page was not present.
        const PRESENT = 1 << 0;
        /// The access causing the fault was a write.
        const WRITE = 1 << 1;
        /// The access causing the fault originated in user mode.
        const USER = 1 << 2;
    }
}

/// Upper bound of back-to-back deliveries for a single access.
pub const MAX_FAULT_DELIVERIES: usize = 16;

/// The frame pushed on the user exception stack for a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UTrapframe {
    /// The faulting virtual address.
    pub fault_va: Va,
    /// The page-fault error code.
    pub err: PFErrorCode,
    /// The stack pointer at the time of the fault.
    pub esp: usize,
}

impl UTrapframe {
    /// Size of the frame on the exception stack, in bytes.
    pub const SIZE: usize = 12;

    /// The in-memory layout of the frame.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        bytes[0..4].copy_from_slice(&(self.fault_va.into_usize() as u32).to_le_bytes());
        bytes[4..8].copy_from_slice(&self.err.bits().to_le_bytes());
        bytes[8..12].copy_from_slice(&(self.esp as u32).to_le_bytes());
        bytes
    }

    /// Parses a frame from its in-memory layout.
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Option<Self> {
        let word = |i: usize| {
            u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]) as usize
        };
        Some(Self {
            fault_va: Va::new(word(0))?,
            err: PFErrorCode::from_bits(word(4) as u32)?,
            esp: word(8),
        })
    }
}

/// Entry point invoked on a page fault.
///
/// The same signature serves both as the kernel-visible upcall and as the
/// user-level handler it dispatches to. Returning `Err` terminates the
/// environment with that reason.
pub type Upcall = fn(&mut UserCtx<'_>, &UTrapframe) -> Result<(), Abort>;

impl UserCtx<'_> {
    /// Deliver a page fault at `fault_va` to the current environment.
    ///
    /// Returns once the upcall has finished. The caller retries the access.
    pub(crate) fn page_fault(&mut self, fault_va: Va, err: PFErrorCode) -> Result<(), Abort> {
        let envid = self.env;
        let env = self.cur_mut()?;
        let Some(upcall) = env.pgfault_upcall else {
            log::warn!("[{}] user fault va {} err {:?}", envid, fault_va, err);
            return Err(Abort::UnhandledFault {
                env: envid,
                va: fault_va,
                err,
            });
        };

        // Push below the current frame if the fault happened on the exception
        // stack, leaving an empty word in between.
        let prev = env.utf_esp;
        let top = prev.map(|esp| esp - 4).unwrap_or(UXSTACKTOP);
        let base = UXSTACKTOP - PGSIZE;
        let esp = top.saturating_sub(UTrapframe::SIZE);
        let xstack = match env.pgdir.lookup(UXSTACK_VA) {
            Some((page, flags))
                if esp >= base && flags.contains(PteFlags::P | PteFlags::U | PteFlags::W) =>
            {
                page.clone()
            }
            _ => {
                log::warn!("[{}] bad exception stack for fault at va {}", envid, fault_va);
                return Err(Abort::BadExceptionStack {
                    env: envid,
                    va: fault_va,
                });
            }
        };

        let utf = UTrapframe {
            fault_va,
            err,
            esp: prev.unwrap_or(USTACKTOP),
        };
        xstack.write(esp - base, &utf.to_bytes());
        env.utf_esp = Some(esp);
        log::debug!("[{}] page fault upcall va {} err {:?}", envid, fault_va, err);

        let result = upcall(self, &utf);
        if let Ok(env) = self.cur_mut() {
            env.utf_esp = prev;
        }
        result
    }
}
