//! Fatal termination of an environment.

use crate::{KernelError, addressing::Va, env::EnvId, trap::PFErrorCode};

/// Why an environment was terminated.
///
/// An `Abort` is the error half of every user continuation. It is propagated
/// with `?` up to the scheduler, which ends the environment and records the
/// reason in its [`ExitStatus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Abort {
    /// A page fault occurred and no upcall was registered, or the upcall
    /// never made the access succeed.
    UnhandledFault {
        /// The faulting environment.
        env: EnvId,
        /// The faulting address.
        va: Va,
        /// The fault's error code.
        err: PFErrorCode,
    },
    /// A page fault could not be delivered because the exception stack is
    /// missing, not writable, or overflowed.
    BadExceptionStack {
        /// The faulting environment.
        env: EnvId,
        /// The faulting address.
        va: Va,
    },
    /// The environment gave up on an unrecoverable condition.
    Panic {
        /// The panicking environment.
        env: EnvId,
        /// What was being done.
        msg: String,
        /// The address involved, if any.
        va: Option<Va>,
        /// The failing system call's error, if any.
        cause: Option<KernelError>,
    },
    /// The environment was destroyed while it was running.
    Killed {
        /// The destroyed environment.
        env: EnvId,
    },
}

impl Abort {
    /// A user panic with a message only.
    pub fn panic(env: EnvId, msg: impl Into<String>) -> Self {
        Abort::Panic {
            env,
            msg: msg.into(),
            va: None,
            cause: None,
        }
    }

    /// The environment that was terminated.
    pub fn env(&self) -> EnvId {
        match self {
            Abort::UnhandledFault { env, .. }
            | Abort::BadExceptionStack { env, .. }
            | Abort::Panic { env, .. }
            | Abort::Killed { env } => *env,
        }
    }
}

impl core::fmt::Display for Abort {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Abort::UnhandledFault { env, va, err } => {
                write!(f, "[{}] user fault va {} err {:?}", env, va, err)
            }
            Abort::BadExceptionStack { env, va } => {
                write!(f, "[{}] bad user exception stack, fault va {}", env, va)
            }
            Abort::Panic {
                env,
                msg,
                va,
                cause,
            } => {
                write!(f, "[{}] user panic: {}", env, msg)?;
                if let Some(va) = va {
                    write!(f, " at va {}", va)?;
                }
                if let Some(cause) = cause {
                    write!(f, ": {}", cause)?;
                }
                Ok(())
            }
            Abort::Killed { env } => write!(f, "[{}] destroyed while running", env),
        }
    }
}

impl std::error::Error for Abort {}

/// How an environment ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// Its last continuation returned `Ok` with this code.
    Exited(i32),
    /// It was terminated by a fatal condition.
    Aborted(Abort),
    /// It was destroyed by itself or by its parent.
    Destroyed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_name_env_and_address() {
        let abort = Abort::Panic {
            env: EnvId(0x1001),
            msg: "duppage: sys_page_map".into(),
            va: Va::new(0x1000),
            cause: Some(KernelError::NoMemory),
        };
        assert_eq!(
            abort.to_string(),
            "[00001001] user panic: duppage: sys_page_map at va 00001000: out of memory"
        );
        assert_eq!(abort.env(), EnvId(0x1001));
        assert_eq!(
            Abort::panic(EnvId(0x1000), "boom").to_string(),
            "[00001000] user panic: boom"
        );
    }
}
