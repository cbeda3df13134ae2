use std::{
    os::fd::{FromRawFd, OwnedFd, RawFd},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};

use anyhow::{bail, Context};
use clap::Parser;
use config::Environment;
use gpubox_server::{NoopRenderer, Server, Settings};
use nix::fcntl::{fcntl, FcntlArg};
use tracing_subscriber::prelude::*;

/// Runs render contexts for a single client in sandboxed worker threads.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Inherited sequenced-packet socket connected to the client.
    #[arg(long, value_name = "FD")]
    socket_fd: Option<RawFd>,

    /// Raw seccomp program installed on every worker thread.
    #[arg(long, value_name = "PATH")]
    worker_seccomp_bpf: Option<PathBuf>,

    /// Declarative seccomp policy installed on every worker thread.
    #[arg(long, value_name = "PATH")]
    worker_seccomp_policy: Option<PathBuf>,

    /// Log violations of the declarative policy instead of enforcing it.
    #[arg(long)]
    worker_seccomp_log: bool,

    /// Upper bound on concurrently running contexts.
    #[arg(long, value_name = "COUNT")]
    max_workers: Option<u64>,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(?error, "render server failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let settings = load_settings(args).context("failed to load settings")?;
    let fd = settings.socket_fd.context("no client socket was given")?;
    let fd = inherit(fd)?;

    #[cfg(target_os = "linux")]
    if let Err(error) = prctl::set_name("gpubox-server") {
        tracing::warn!(?error, "failed to set the process name");
    }

    let mut server = Server::new(fd, &settings, Arc::new(NoopRenderer))
        .context("failed to start the server")?;
    server.run()?;

    Ok(())
}

fn load_settings(args: Args) -> anyhow::Result<Settings> {
    let path = |v: Option<PathBuf>| v.map(|v| v.to_string_lossy().into_owned());

    let config = config::Config::builder()
        .add_source(Environment::with_prefix("gpubox").separator("__"))
        .set_override_option("socket_fd", args.socket_fd)?
        .set_override_option("sandbox.seccomp_bpf", path(args.worker_seccomp_bpf))?
        .set_override_option("sandbox.seccomp_policy", path(args.worker_seccomp_policy))?
        .set_override_option("sandbox.seccomp_log", args.worker_seccomp_log.then_some(true))?
        .set_override_option("max_workers", args.max_workers)?
        .build()?;

    Ok(config.try_deserialize()?)
}

/// Takes ownership of a descriptor inherited from the parent.
fn inherit(fd: RawFd) -> anyhow::Result<OwnedFd> {
    if fd < 0 {
        bail!("invalid client socket {fd}");
    }

    fcntl(fd, FcntlArg::F_GETFD).with_context(|| format!("client socket {fd} is not open"))?;

    // SAFETY: the descriptor is open and was handed to this process to own; nothing else in the process uses it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
