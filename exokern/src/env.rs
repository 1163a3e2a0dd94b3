//! User environments.
//!
//! An environment is the unit of protection and scheduling: an address space
//! plus the little state the kernel keeps about it. Environments live in a
//! fixed table of [`NENV`] slots and are named by an [`EnvId`], which packs
//! the slot index together with a generation number so that a stale id never
//! names a recycled slot:
//!
//! ```text
//! +1+---------------21-----------------+--------10--------+
//! |0|          Uniqueifier             |   Environment    |
//! | |                                  |      Index       |
//! +------------------------------------+------------------+
//!                                       \--- ENVX(eid) --/
//! ```
//!
//! The id `0` never names an environment; system calls read it as "the
//! calling environment" ([`EnvId::CURRENT`]).

use crate::{
    Abort, KernelError,
    mm::{FrameAllocator, page_table::PageDir},
    syscall::UserCtx,
    trap::Upcall,
};
use arrayvec::ArrayVec;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::sync::Arc;

/// log2 of the number of environment slots.
pub const LOG2NENV: u32 = 10;
/// Number of environment slots.
pub const NENV: usize = 1 << LOG2NENV;
/// Shift of the generation number inside an [`EnvId`].
const ENVGENSHIFT: u32 = 12;

/// Identifier of an environment.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EnvId(pub u32);

impl EnvId {
    /// Names the calling environment in system calls.
    pub const CURRENT: EnvId = EnvId(0);

    /// Slot index of this id.
    #[inline]
    pub const fn envx(self) -> usize {
        self.0 as usize & (NENV - 1)
    }
}

impl core::fmt::Display for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl core::fmt::Debug for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

/// Run state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum EnvStatus {
    /// The slot holds no environment.
    Free = 0,
    /// Destroyed while running; reclaimed once it gives up the CPU.
    Dying = 1,
    /// Waiting in the run queue.
    Runnable = 2,
    /// Currently on the CPU.
    Running = 3,
    /// Exists but must not be scheduled.
    NotRunnable = 4,
}

/// A continuation of a user program.
///
/// The scheduler runs it to completion. It either registers a further
/// continuation with [`UserCtx::sys_yield`] or ends the environment with its
/// result.
pub type Resume = Box<dyn FnOnce(&mut UserCtx<'_>) -> Result<i32, Abort>>;

/// Task-local storage of a user environment.
///
/// This is ordinary user state that happens to be kept by the kernel: it
/// belongs to the environment, is freely changed by it, and is duplicated
/// into the child by [`UserCtx::sys_exofork`] exactly like the rest of the
/// caller's registers.
#[derive(Clone, Copy, Default)]
pub struct Tls {
    /// The handler the user-level fault trampoline dispatches to.
    pub pgfault_handler: Option<Upcall>,
}

impl core::fmt::Debug for Tls {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tls")
            .field("pgfault_handler", &self.pgfault_handler.is_some())
            .finish()
    }
}

/// Saved execution state of an environment.
#[derive(Default)]
pub(crate) struct Trapframe {
    /// Where to continue when next scheduled.
    pub(crate) resume: Option<Resume>,
    pub(crate) tls: Tls,
}

/// A user environment.
pub(crate) struct Env {
    pub(crate) id: EnvId,
    pub(crate) parent_id: EnvId,
    pub(crate) status: EnvStatus,
    pub(crate) pgdir: PageDir,
    pub(crate) pgfault_upcall: Option<Upcall>,
    pub(crate) tf: Trapframe,
    /// Top of the frame on the exception stack while a fault is delivered.
    pub(crate) utf_esp: Option<usize>,
    pub(crate) runs: u32,
}

/// A read-only snapshot of an environment's kernel state.
///
/// Any environment may look at any other one this way; this is how a forking
/// environment finds out which upcall it has registered.
#[derive(Debug, Clone, Copy)]
pub struct EnvInfo {
    /// Id of the environment.
    pub id: EnvId,
    /// Id of the environment that created it, [`EnvId::CURRENT`] for
    /// environments created by the kernel.
    pub parent_id: EnvId,
    /// Run state.
    pub status: EnvStatus,
    /// The registered page-fault upcall.
    pub pgfault_upcall: Option<Upcall>,
    /// Number of times it has been scheduled.
    pub runs: u32,
}

impl From<&Env> for EnvInfo {
    fn from(env: &Env) -> Self {
        Self {
            id: env.id,
            parent_id: env.parent_id,
            status: env.status,
            pgfault_upcall: env.pgfault_upcall,
            runs: env.runs,
        }
    }
}

struct Slot {
    /// Id of the last environment that lived in this slot.
    last_id: u32,
    env: Option<Box<Env>>,
}

/// The environment table.
pub(crate) struct EnvTable {
    slots: Box<ArrayVec<Slot, NENV>>,
    limit: usize,
}

impl EnvTable {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            slots: Box::default(),
            limit: limit.min(NENV),
        }
    }

    /// The environment named by exactly `id`.
    pub(crate) fn get(&self, id: EnvId) -> Option<&Env> {
        self.slots
            .get(id.envx())
            .and_then(|slot| slot.env.as_deref())
            .filter(|env| env.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.slots
            .get_mut(id.envx())
            .and_then(|slot| slot.env.as_deref_mut())
            .filter(|env| env.id == id)
    }

    /// Converts an envid to an env, on behalf of environment `cur`.
    ///
    /// [`EnvId::CURRENT`] resolves to `cur` itself. If `checkperm` is set, the
    /// target must be `cur` or one of its immediate children.
    ///
    /// # Returns
    /// - `Err(KernelError::BadEnv)` if the environment does not exist or the
    ///   caller has no permission to touch it.
    pub(crate) fn envid2env(
        &mut self,
        cur: EnvId,
        id: EnvId,
        checkperm: bool,
    ) -> Result<&mut Env, KernelError> {
        let id = if id == EnvId::CURRENT { cur } else { id };
        let env = self.get_mut(id).ok_or(KernelError::BadEnv)?;
        if env.status == EnvStatus::Free {
            return Err(KernelError::BadEnv);
        }
        if checkperm && env.id != cur && env.parent_id != cur {
            return Err(KernelError::BadEnv);
        }
        Ok(env)
    }

    /// Allocates and initializes a new environment.
    ///
    /// The new environment has an empty address space, no upcall, and is
    /// [`EnvStatus::NotRunnable`].
    ///
    /// # Returns
    /// - `Err(KernelError::NoFreeEnv)` if all slots are in use.
    /// - `Err(KernelError::NoMemory)` if no frame is left for the page
    ///   directory.
    pub(crate) fn alloc(
        &mut self,
        parent_id: EnvId,
        allocator: &Arc<FrameAllocator>,
    ) -> Result<EnvId, KernelError> {
        let idx = match self.slots.iter().position(|slot| slot.env.is_none()) {
            Some(idx) => idx,
            None if self.slots.len() < self.limit => {
                self.slots.push(Slot {
                    last_id: 0,
                    env: None,
                });
                self.slots.len() - 1
            }
            None => return Err(KernelError::NoFreeEnv),
        };
        let pgdir = PageDir::new(allocator)?;

        let slot = &mut self.slots[idx];
        // Generate an env_id for this environment.
        let mut generation = slot.last_id.wrapping_add(1 << ENVGENSHIFT) & !((NENV as u32) - 1);
        if generation as i32 <= 0 {
            // Don't create a negative env_id.
            generation = 1 << ENVGENSHIFT;
        }
        let id = EnvId(generation | idx as u32);
        slot.last_id = id.0;
        slot.env = Some(Box::new(Env {
            id,
            parent_id,
            status: EnvStatus::NotRunnable,
            pgdir,
            pgfault_upcall: None,
            tf: Trapframe::default(),
            utf_esp: None,
            runs: 0,
        }));
        Ok(id)
    }

    /// Removes `id` from the table, handing it back for teardown.
    pub(crate) fn remove(&mut self, id: EnvId) -> Option<Box<Env>> {
        let slot = self.slots.get_mut(id.envx())?;
        if slot.env.as_ref().is_some_and(|env| env.id == id) {
            slot.env.take()
        } else {
            None
        }
    }

    /// Live environments, in slot order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Env> {
        self.slots.iter().filter_map(|slot| slot.env.as_deref())
    }
}
