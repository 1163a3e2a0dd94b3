//! System calls.
//!
//! A user environment reaches the kernel only through its [`UserCtx`]. The
//! context names the calling environment and offers two kinds of services:
//!
//! - **Memory access**: [`UserCtx::read`] and [`UserCtx::write`] touch the
//!   environment's memory the way its instructions would. Every access is
//!   checked against the page table, and a violation raises a page fault that
//!   is delivered to the environment's upcall (see [`trap`]).
//! - **System calls**: the `sys_*` methods. They never terminate the caller;
//!   failures are reported as [`KernelError`] and it is up to the caller to
//!   decide whether they are fatal.
//!
//! Environment arguments accept [`EnvId::CURRENT`] for the caller. Except for
//! the read-only [`UserCtx::env_info`], a system call may only act on the
//! caller itself or on one of its immediate children.
//!
//! ## Page permissions
//!
//! The `perm` argument of the page calls must contain [`PteFlags::U`] and
//! nothing outside [`PteFlags::SYSCALL`]; [`PteFlags::P`] is implied. The
//! [`PteFlags::AVAIL`] bits are kept in the entry untouched, for the
//! caller's own use.
//!
//! [`trap`]: crate::trap

use crate::{
    Abort, ExitStatus, KernelError,
    addressing::{PAGE_SIZE, Va},
    env::{Env, EnvId, EnvInfo, EnvStatus, Tls},
    memlayout::UTOP,
    mm::{
        Page,
        page_table::{PageTableMappingError, PteFlags},
        vpt::Vpt,
    },
    sched::Kernel,
    trap::{MAX_FAULT_DELIVERIES, PFErrorCode, Upcall},
};

/// The two results of [`UserCtx::sys_exofork`].
///
/// The creating environment continues with `Parent`, carrying the id of the
/// new child. The child, once it is first scheduled, starts with `Child`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exofork {
    /// Seen by the creator: the id of the new environment.
    Parent(EnvId),
    /// Seen by the new environment.
    Child,
}

/// The execution context of the running user environment.
///
/// A `UserCtx` exists only while its environment is on the CPU. It is handed
/// to the environment's continuation by the scheduler and to its page-fault
/// upcall by the trap path.
pub struct UserCtx<'k> {
    pub(crate) kernel: &'k mut Kernel,
    pub(crate) env: EnvId,
}

fn check_user_va(va: Va) -> Result<(), KernelError> {
    if va.into_usize() >= UTOP || !va.is_page_aligned() {
        Err(KernelError::InvalidArgument)
    } else {
        Ok(())
    }
}

fn check_perm(perm: PteFlags) -> Result<(), KernelError> {
    if !perm.contains(PteFlags::U) || !PteFlags::SYSCALL.contains(perm) {
        Err(KernelError::InvalidArgument)
    } else {
        Ok(())
    }
}

impl<'k> UserCtx<'k> {
    pub(crate) fn new(kernel: &'k mut Kernel, env: EnvId) -> Self {
        Self { kernel, env }
    }

    pub(crate) fn cur(&self) -> Result<&Env, Abort> {
        self.kernel
            .envs
            .get(self.env)
            .ok_or(Abort::Killed { env: self.env })
    }

    pub(crate) fn cur_mut(&mut self) -> Result<&mut Env, Abort> {
        self.kernel
            .envs
            .get_mut(self.env)
            .ok_or(Abort::Killed { env: self.env })
    }

    /// Id of the running environment.
    #[inline]
    pub fn env_id(&self) -> EnvId {
        self.env
    }

    /// Read-only view of the running environment's page tables.
    pub fn vpt(&self) -> Vpt<'_> {
        Vpt::new(self.kernel.envs.get(self.env).map(|env| &env.pgdir))
    }

    /// Snapshot of any environment's kernel state.
    ///
    /// Returns `None` if `id` names no live environment.
    pub fn env_info(&self, id: EnvId) -> Option<EnvInfo> {
        let id = if id == EnvId::CURRENT { self.env } else { id };
        self.kernel.envs.get(id).map(EnvInfo::from)
    }

    /// The running environment's task-local storage.
    pub fn tls(&self) -> Tls {
        self.kernel
            .envs
            .get(self.env)
            .map(|env| env.tf.tls)
            .unwrap_or_default()
    }

    /// Replace the running environment's task-local storage.
    pub fn set_tls(&mut self, tls: Tls) {
        if let Some(env) = self.kernel.envs.get_mut(self.env) {
            env.tf.tls = tls;
        }
    }

    /// Find the page backing a user access, delivering page faults until
    /// the access is allowed.
    fn translate(&mut self, va: Va, write: bool) -> Result<Page, Abort> {
        let mut deliveries = 0;
        loop {
            let env = self.cur()?;
            if env.status == EnvStatus::Dying {
                return Err(Abort::Killed { env: self.env });
            }
            let err = match env.pgdir.translate(va, write) {
                Ok(page) => return Ok(page),
                Err(err) => err,
            };
            if deliveries == MAX_FAULT_DELIVERIES {
                log::warn!(
                    "[{}] fault at va {} persists after {} upcalls",
                    self.env,
                    va,
                    deliveries
                );
                return Err(Abort::UnhandledFault {
                    env: self.env,
                    va,
                    err,
                });
            }
            deliveries += 1;
            self.page_fault(va, err)?;
        }
    }

    /// Walk `[va, va + len)` page by page.
    fn access(
        &mut self,
        va: Va,
        len: usize,
        write: bool,
        mut f: impl FnMut(&Page, usize, core::ops::Range<usize>),
    ) -> Result<(), Abort> {
        let mut done = 0;
        while done < len {
            let Some(cur) = Va::new(va.into_usize() + done) else {
                let mut err = PFErrorCode::USER;
                err.set(PFErrorCode::WRITE, write);
                return Err(Abort::UnhandledFault {
                    env: self.env,
                    va,
                    err,
                });
            };
            let page = self.translate(cur, write)?;
            let n = (PAGE_SIZE - cur.offset()).min(len - done);
            f(&page, cur.offset(), done..done + n);
            done += n;
        }
        Ok(())
    }

    /// Load `buf.len()` bytes from user memory at `va`.
    pub fn read(&mut self, va: Va, buf: &mut [u8]) -> Result<(), Abort> {
        self.access(va, buf.len(), false, |page, offset, range| {
            page.read(offset, &mut buf[range])
        })
    }

    /// Store `buf` into user memory at `va`.
    pub fn write(&mut self, va: Va, buf: &[u8]) -> Result<(), Abort> {
        self.access(va, buf.len(), true, |page, offset, range| {
            page.write(offset, &buf[range])
        })
    }

    /// Load a little-endian word from user memory.
    pub fn read_u32(&mut self, va: Va) -> Result<u32, Abort> {
        let mut word = [0; 4];
        self.read(va, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Store a little-endian word into user memory.
    pub fn write_u32(&mut self, va: Va, value: u32) -> Result<(), Abort> {
        self.write(va, &value.to_le_bytes())
    }

    /// Returns the current environment's envid.
    pub fn sys_getenvid(&self) -> EnvId {
        self.env
    }

    /// Allocate a page of memory and map it at `va` with permission `perm` in
    /// the address space of `envid`.
    ///
    /// The page's contents are set to 0. If a page is already mapped at `va`,
    /// that page is unmapped as a side effect.
    ///
    /// # Returns
    /// - `Err(KernelError::BadEnv)` if `envid` doesn't currently exist, or the
    ///   caller doesn't have permission to change `envid`.
    /// - `Err(KernelError::InvalidArgument)` if `va >= UTOP`, or `va` is not
    ///   page-aligned, or `perm` is inappropriate.
    /// - `Err(KernelError::NoMemory)` if there's no memory to allocate the new
    ///   page, or to allocate any necessary page tables.
    pub fn sys_page_alloc(
        &mut self,
        envid: EnvId,
        va: Va,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        check_user_va(va)?;
        check_perm(perm)?;
        self.kernel.envs.envid2env(self.env, envid, true)?;
        let page = Page::new(&self.kernel.allocator)?;
        let env = self.kernel.envs.envid2env(self.env, envid, true)?;
        env.pgdir.map(va, page, perm | PteFlags::P)?;
        Ok(())
    }

    /// Map the page of memory at `srcva` in `srcenvid`'s address space at
    /// `dstva` in `dstenvid`'s address space with permission `perm`.
    ///
    /// Whatever was mapped at `dstva` before is replaced in one step. Mapping
    /// a page onto itself only changes its permission.
    ///
    /// # Returns
    /// - `Err(KernelError::BadEnv)` if `srcenvid` and/or `dstenvid` doesn't
    ///   currently exist, or the caller doesn't have permission to change one
    ///   of them.
    /// - `Err(KernelError::InvalidArgument)` if `srcva` or `dstva` is at or
    ///   above `UTOP` or not page-aligned, or `srcva` is not mapped in
    ///   `srcenvid`'s address space, or `perm` is inappropriate, or `perm`
    ///   asks for [`PteFlags::W`] but `srcva` is read-only.
    /// - `Err(KernelError::NoMemory)` if there's no memory to allocate any
    ///   necessary page tables.
    pub fn sys_page_map(
        &mut self,
        srcenvid: EnvId,
        srcva: Va,
        dstenvid: EnvId,
        dstva: Va,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        check_user_va(srcva)?;
        check_user_va(dstva)?;
        check_perm(perm)?;
        let src = self.kernel.envs.envid2env(self.env, srcenvid, true)?;
        let (page, flags) = src
            .pgdir
            .lookup(srcva)
            .ok_or(KernelError::InvalidArgument)?;
        if perm.contains(PteFlags::W) && !flags.contains(PteFlags::W) {
            return Err(KernelError::InvalidArgument);
        }
        let page = page.clone();
        let dst = self.kernel.envs.envid2env(self.env, dstenvid, true)?;
        dst.pgdir.map(dstva, page, perm | PteFlags::P)?;
        Ok(())
    }

    /// Unmap the page of memory at `va` in the address space of `envid`.
    ///
    /// If no page is mapped, the function silently succeeds.
    ///
    /// # Returns
    /// - `Err(KernelError::BadEnv)` if `envid` doesn't currently exist, or the
    ///   caller doesn't have permission to change `envid`.
    /// - `Err(KernelError::InvalidArgument)` if `va >= UTOP`, or `va` is not
    ///   page-aligned.
    pub fn sys_page_unmap(&mut self, envid: EnvId, va: Va) -> Result<(), KernelError> {
        check_user_va(va)?;
        let env = self.kernel.envs.envid2env(self.env, envid, true)?;
        match env.pgdir.unmap(va) {
            Ok(_) | Err(PageTableMappingError::NotExist) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Allocate a new environment.
    ///
    /// The new environment has an empty address space, no page-fault upcall,
    /// and is left [`EnvStatus::NotRunnable`]. Its task-local storage is a
    /// copy of the caller's. Once it is made runnable and scheduled, it
    /// starts by calling `resume` with [`Exofork::Child`]; the caller
    /// continues right away and receives the new id.
    ///
    /// # Returns
    /// - `Ok(EnvId)`: the id of the new environment.
    /// - `Err(KernelError::NoFreeEnv)` if no free environment is available.
    /// - `Err(KernelError::NoMemory)` on memory exhaustion.
    pub fn sys_exofork<F>(&mut self, resume: F) -> Result<EnvId, KernelError>
    where
        F: FnOnce(&mut UserCtx<'_>, Exofork) -> Result<i32, Abort> + 'static,
    {
        let tls = self.tls();
        let id = self.kernel.envs.alloc(self.env, &self.kernel.allocator)?;
        if let Some(child) = self.kernel.envs.get_mut(id) {
            child.tf.tls = tls;
            child.tf.resume = Some(Box::new(move |ctx: &mut UserCtx<'_>| {
                resume(ctx, Exofork::Child)
            }));
        }
        log::info!("[{}] new env {}", self.env, id);
        Ok(id)
    }

    /// Set `envid`'s run state to `status`, which must be
    /// [`EnvStatus::Runnable`] or [`EnvStatus::NotRunnable`].
    ///
    /// # Returns
    /// - `Err(KernelError::BadEnv)` if `envid` doesn't currently exist, or the
    ///   caller doesn't have permission to change `envid`.
    /// - `Err(KernelError::InvalidArgument)` if `status` is not a valid status
    ///   for an environment.
    pub fn sys_env_set_status(
        &mut self,
        envid: EnvId,
        status: EnvStatus,
    ) -> Result<(), KernelError> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(KernelError::InvalidArgument);
        }
        let env = self.kernel.envs.envid2env(self.env, envid, true)?;
        env.status = status;
        let id = env.id;
        if status == EnvStatus::Runnable
            && id != self.env
            && !self.kernel.run_queue.contains(&id)
        {
            self.kernel.run_queue.push_back(id);
        }
        Ok(())
    }

    /// Set the page fault upcall for `envid`. `None` removes it.
    ///
    /// # Returns
    /// - `Err(KernelError::BadEnv)` if `envid` doesn't currently exist, or the
    ///   caller doesn't have permission to change `envid`.
    pub fn sys_env_set_pgfault_upcall(
        &mut self,
        envid: EnvId,
        upcall: Option<Upcall>,
    ) -> Result<(), KernelError> {
        let env = self.kernel.envs.envid2env(self.env, envid, true)?;
        env.pgfault_upcall = upcall;
        Ok(())
    }

    /// Destroy a given environment (possibly the currently running
    /// environment).
    ///
    /// Another environment is torn down immediately. The caller itself is
    /// torn down once its current continuation returns; until then every
    /// memory access fails with [`Abort::Killed`].
    ///
    /// # Returns
    /// - `Err(KernelError::BadEnv)` if `envid` doesn't currently exist, or the
    ///   caller doesn't have permission to change `envid`.
    pub fn sys_env_destroy(&mut self, envid: EnvId) -> Result<(), KernelError> {
        let env = self.kernel.envs.envid2env(self.env, envid, true)?;
        if env.id == self.env {
            log::info!("[{}] exiting gracefully", self.env);
            env.status = EnvStatus::Dying;
        } else {
            let id = env.id;
            log::info!("[{}] destroying {}", self.env, id);
            self.kernel.env_free(self.env, id, ExitStatus::Destroyed);
        }
        Ok(())
    }

    /// Give up the CPU.
    ///
    /// `resume` becomes the environment's continuation. Once the current one
    /// returns, the environment goes to the back of the run queue and
    /// `resume` runs when it is next scheduled. The value returned by the
    /// current continuation is discarded.
    pub fn sys_yield<F>(&mut self, resume: F)
    where
        F: FnOnce(&mut UserCtx<'_>) -> Result<i32, Abort> + 'static,
    {
        if let Some(env) = self.kernel.envs.get_mut(self.env) {
            env.tf.resume = Some(Box::new(resume));
        }
    }
}
