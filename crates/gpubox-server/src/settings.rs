use std::os::fd::RawFd;

use gpubox_sandbox::SandboxSettings;
use gpubox_util::PoolConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// The inherited descriptor connected to the client.
    #[serde(default)]
    pub socket_fd: Option<RawFd>,

    #[serde(default)]
    pub sandbox: SandboxSettings,

    #[serde(default)]
    pub pool: PoolConfig,

    /// Upper bound on concurrently running contexts.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            socket_fd: None,
            sandbox: SandboxSettings::default(),
            pool: PoolConfig::default(),
            max_workers: default_max_workers(),
        }
    }
}

fn default_max_workers() -> usize {
    256
}
