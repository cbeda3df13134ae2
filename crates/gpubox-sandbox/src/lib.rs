//! Thread-scoped syscall sandboxing for render workers.

use std::{cell::Cell, path::PathBuf};

use thiserror::Error;

mod policy;
#[cfg(target_os = "linux")]
mod seccomp;

pub use policy::{PolicyKind, SandboxPolicy, SandboxSettings};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("policy {0:?} requires a path")]
    MissingPath(PolicyKind),
    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is not a filter program: {reason}", path.display())]
    InvalidProgram { path: PathBuf, reason: &'static str },
    #[error("failed to parse policy {}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("policy {} has no `worker` filter", path.display())]
    MissingFilter { path: PathBuf },
    #[error("seccomp does not support this architecture: {0}")]
    Architecture(String),
    #[cfg(target_os = "linux")]
    #[error("failed to compile policy {}", path.display())]
    Compile {
        path: PathBuf,
        #[source]
        source: seccompiler::Error,
    },
    #[cfg(target_os = "linux")]
    #[error("failed to apply the compiled policy")]
    Apply(#[source] seccompiler::Error),
    #[error("failed to install the filter program")]
    Install(#[source] std::io::Error),
    #[error("sandboxing is not supported on this platform")]
    Unsupported,
}

thread_local! {
    static ENTERED: Cell<bool> = const { Cell::new(false) };
}

/// A loaded sandbox policy, ready to be entered by worker threads.
///
/// Filters are installed per thread and stack, so each thread enters at most once.
pub struct Sandbox {
    policy: SandboxPolicy,
    #[cfg(target_os = "linux")]
    program: Option<seccomp::Program>,
}

impl Sandbox {
    /// Loads and compiles the policy. Nothing is installed until [`Sandbox::enter`].
    #[tracing::instrument(level = "debug", err)]
    pub fn new(policy: SandboxPolicy) -> Result<Self, SandboxError> {
        #[cfg(target_os = "linux")]
        let program = seccomp::Program::load(&policy)?;

        #[cfg(not(target_os = "linux"))]
        if policy.kind != PolicyKind::None {
            return Err(SandboxError::Unsupported);
        }

        Ok(Self {
            policy,
            #[cfg(target_os = "linux")]
            program,
        })
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// Confines the calling thread. Repeated calls on the same thread do nothing.
    pub fn enter(&self) -> Result<(), SandboxError> {
        if Self::entered() {
            return Ok(());
        }

        #[cfg(target_os = "linux")]
        if let Some(program) = &self.program {
            program.install()?;
        }

        ENTERED.with(|v| v.set(true));
        tracing::debug!(kind = ?self.policy.kind, "entered sandbox");
        Ok(())
    }

    /// Whether the calling thread has entered a sandbox.
    pub fn entered() -> bool {
        ENTERED.with(Cell::get)
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
