use std::path::PathBuf;

use serde::Deserialize;

/// Sandbox options as they arrive from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// A raw seccomp program.
    pub seccomp_bpf: Option<PathBuf>,
    /// A declarative seccomp policy.
    pub seccomp_policy: Option<PathBuf>,
    /// Log violations of the declarative policy instead of enforcing it.
    pub seccomp_log: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    None,
    SeccompBpf,
    SeccompPolicy,
    SeccompPolicyAudit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPolicy {
    pub kind: PolicyKind,
    pub path: Option<PathBuf>,
}

impl SandboxPolicy {
    pub const NONE: Self = Self {
        kind: PolicyKind::None,
        path: None,
    };

    /// Picks exactly one policy from the settings.
    ///
    /// An audited declarative policy wins over a raw program, which wins over an enforced declarative policy.
    pub fn select(settings: &SandboxSettings) -> Self {
        let (kind, path) = match settings {
            SandboxSettings {
                seccomp_policy: Some(path),
                seccomp_log: true,
                ..
            } => (PolicyKind::SeccompPolicyAudit, path),
            SandboxSettings {
                seccomp_bpf: Some(path),
                ..
            } => (PolicyKind::SeccompBpf, path),
            SandboxSettings {
                seccomp_policy: Some(path),
                ..
            } => (PolicyKind::SeccompPolicy, path),
            _ => return Self::NONE,
        };

        Self {
            kind,
            path: Some(path.clone()),
        }
    }
}
