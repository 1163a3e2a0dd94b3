//! The machine and its round-robin scheduler.
//!
//! [`Kernel`] owns everything: the frame pool, the environment table, the
//! run queue, and the exit records of environments that have ended. It is
//! configured through a [`KernelBuilder`].
//!
//! Scheduling is cooperative. [`Kernel::step`] takes the environment at the
//! front of the FIFO run queue and runs its current continuation to
//! completion. Afterwards:
//!
//! - if the continuation failed, the environment is torn down with
//!   [`ExitStatus::Aborted`];
//! - if it destroyed itself, it is torn down with [`ExitStatus::Destroyed`];
//! - if it registered a new continuation with [`UserCtx::sys_yield`], it
//!   goes to the back of the queue;
//! - otherwise it is torn down with [`ExitStatus::Exited`].
//!
//! The remaining methods are inspection hooks for diagnosis and tests: they
//! look into any environment without going through its page-fault path.

use crate::{
    Abort, ExitStatus, KernelError, UserCtx,
    addressing::Va,
    env::{EnvId, EnvInfo, EnvStatus, EnvTable, NENV},
    memlayout::{USTACK_VA, UTHISENV_VA},
    mm::{
        FrameAllocator, Page,
        page_table::{Pte, PteFlags},
    },
};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

/// A builder for the machine configuration.
///
/// ```
/// use exokern::Kernel;
///
/// let kernel = Kernel::builder().npages(32).max_envs(4).build();
/// assert_eq!(kernel.total_frames(), 32);
/// ```
#[derive(Debug, Clone)]
pub struct KernelBuilder {
    npages: usize,
    max_envs: usize,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self {
            npages: 1024,
            max_envs: NENV,
        }
    }
}

impl KernelBuilder {
    /// Sets the number of physical page frames.
    pub fn npages(mut self, npages: usize) -> Self {
        self.npages = npages;
        self
    }

    /// Sets the maximum number of live environments, capped at [`NENV`].
    pub fn max_envs(mut self, max_envs: usize) -> Self {
        self.max_envs = max_envs.min(NENV);
        self
    }

    /// Boots the machine.
    pub fn build(self) -> Kernel {
        log::info!(
            "Memory: {} pages, {} environments",
            self.npages,
            self.max_envs
        );
        Kernel {
            allocator: FrameAllocator::new(self.npages),
            envs: EnvTable::new(self.max_envs),
            run_queue: VecDeque::new(),
            exits: BTreeMap::new(),
        }
    }
}

/// The simulated machine.
pub struct Kernel {
    pub(crate) allocator: Arc<FrameAllocator>,
    pub(crate) envs: EnvTable,
    pub(crate) run_queue: VecDeque<EnvId>,
    exits: BTreeMap<EnvId, ExitStatus>,
}

impl Default for Kernel {
    fn default() -> Self {
        KernelBuilder::default().build()
    }
}

impl Kernel {
    /// Returns a builder with the default configuration.
    pub fn builder() -> KernelBuilder {
        KernelBuilder::default()
    }

    /// Create a new runnable environment running `program`.
    ///
    /// The environment starts with two zeroed, writable pages: the top page of
    /// its normal stack and the page at [`UTHISENV`].
    ///
    /// # Returns
    /// - `Err(KernelError::NoFreeEnv)` or `Err(KernelError::NoMemory)` if the
    ///   environment cannot be set up; nothing is left behind in that case.
    ///
    /// [`UTHISENV`]: crate::memlayout::UTHISENV
    pub fn spawn<F>(&mut self, program: F) -> Result<EnvId, KernelError>
    where
        F: FnOnce(&mut UserCtx<'_>) -> Result<i32, Abort> + 'static,
    {
        let id = self.envs.alloc(EnvId::CURRENT, &self.allocator)?;
        if let Err(e) = self.load(id) {
            self.envs.remove(id);
            return Err(e);
        }
        if let Some(env) = self.envs.get_mut(id) {
            env.tf.resume = Some(Box::new(program));
            env.status = EnvStatus::Runnable;
        }
        self.run_queue.push_back(id);
        log::info!("[{}] new env {}", EnvId::CURRENT, id);
        Ok(id)
    }

    fn load(&mut self, id: EnvId) -> Result<(), KernelError> {
        for va in [USTACK_VA, UTHISENV_VA] {
            let page = Page::new(&self.allocator)?;
            let env = self.envs.get_mut(id).ok_or(KernelError::BadEnv)?;
            env.pgdir.map(va, page, PteFlags::U | PteFlags::W)?;
        }
        Ok(())
    }

    /// Run the next runnable environment for one slice.
    ///
    /// # Returns
    /// - `Some(EnvId)`: the environment that ran.
    /// - `None`: nothing is runnable.
    pub fn step(&mut self) -> Option<EnvId> {
        while let Some(id) = self.run_queue.pop_front() {
            let Some(env) = self.envs.get_mut(id) else {
                continue;
            };
            if env.status != EnvStatus::Runnable {
                continue;
            }
            let Some(resume) = env.tf.resume.take() else {
                log::warn!("[{}] runnable without a continuation", id);
                self.env_free(id, id, ExitStatus::Destroyed);
                continue;
            };
            env.status = EnvStatus::Running;
            env.runs += 1;

            let result = resume(&mut UserCtx::new(self, id));
            self.finish(id, result);
            return Some(id);
        }
        None
    }

    fn finish(&mut self, id: EnvId, result: Result<i32, Abort>) {
        let Some(env) = self.envs.get_mut(id) else {
            return;
        };
        match result {
            _ if env.status == EnvStatus::Dying => self.env_free(id, id, ExitStatus::Destroyed),
            Err(abort) => {
                log::warn!("{}", abort);
                self.env_free(id, id, ExitStatus::Aborted(abort));
            }
            Ok(code) if env.tf.resume.is_none() => {
                log::info!("[{}] exiting gracefully", id);
                self.env_free(id, id, ExitStatus::Exited(code));
            }
            Ok(_) => {
                if env.status == EnvStatus::Running {
                    env.status = EnvStatus::Runnable;
                }
                if env.status == EnvStatus::Runnable && !self.run_queue.contains(&id) {
                    self.run_queue.push_back(id);
                }
            }
        }
    }

    /// Run until no environment is runnable.
    pub fn run(&mut self) {
        while self.step().is_some() {}
        log::info!("No runnable environments in the system!");
    }

    /// Tear down environment `id` on behalf of `by`, releasing all its frames.
    pub(crate) fn env_free(&mut self, by: EnvId, id: EnvId, status: ExitStatus) {
        if let Some(mut env) = self.envs.remove(id) {
            env.pgdir.clear();
            log::info!("[{}] free env {}", by, id);
            self.exits.insert(id, status);
        }
    }

    /// How environment `id` ended, if it has.
    pub fn exit_status(&self, id: EnvId) -> Option<&ExitStatus> {
        self.exits.get(&id)
    }

    /// Every environment that has ended, in id order.
    pub fn exits(&self) -> impl Iterator<Item = (EnvId, &ExitStatus)> {
        self.exits.iter().map(|(id, status)| (*id, status))
    }

    /// Kernel state of a live environment.
    pub fn env_info(&self, id: EnvId) -> Option<EnvInfo> {
        self.envs.get(id).map(EnvInfo::from)
    }

    /// Number of live environments.
    pub fn live_envs(&self) -> usize {
        self.envs.iter().count()
    }

    /// The page table entry of `va` in environment `id`.
    ///
    /// Empty if the environment or the mapping does not exist.
    pub fn pte(&self, id: EnvId, va: Va) -> Pte {
        self.envs
            .get(id)
            .and_then(|env| env.pgdir.walk(va.page_down()).ok())
            .unwrap_or_default()
    }

    /// Every present mapping of environment `id`, in address order.
    pub fn mappings(&self, id: EnvId) -> Vec<(Va, Pte)> {
        self.envs
            .get(id)
            .map(|env| env.pgdir.mappings())
            .unwrap_or_default()
    }

    /// Copy `len` bytes at `va` out of environment `id`, bypassing
    /// protection.
    ///
    /// Returns `None` if any byte of the range is not mapped.
    pub fn peek(&self, id: EnvId, va: Va, len: usize) -> Option<Vec<u8>> {
        let env = self.envs.get(id)?;
        let mut buf = vec![0; len];
        let mut done = 0;
        while done < len {
            let cur = Va::new(va.into_usize() + done)?;
            let (page, _) = env.pgdir.lookup(cur.page_down())?;
            let n = (crate::addressing::PAGE_SIZE - cur.offset()).min(len - done);
            page.read(cur.offset(), &mut buf[done..done + n]);
            done += n;
        }
        Some(buf)
    }

    /// Number of unused physical frames.
    pub fn free_frames(&self) -> usize {
        self.allocator.free_frames()
    }

    /// Number of physical frames of the machine.
    pub fn total_frames(&self) -> usize {
        self.allocator.total_frames()
    }
}
