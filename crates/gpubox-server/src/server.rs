use std::{
    os::fd::{AsFd, OwnedFd},
    sync::Arc,
};

use gpubox_sandbox::{Sandbox, SandboxError, SandboxPolicy};
use gpubox_util::{Discipline, TransportError};
use thiserror::Error;

use crate::{
    client::{Client, ClientError, Dispatch},
    context::Workers,
    interpreter::InterpreterFactory,
    settings::Settings,
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("the client socket must be a sequenced-packet socket, not {0:?}")]
    InvalidDiscipline(Discipline),
    #[error("the client descriptor is not a usable socket")]
    Transport(#[from] TransportError),
    #[error("failed to create the sandbox")]
    Sandbox(#[from] SandboxError),
    #[error("the client connection failed")]
    Client(#[from] ClientError),
    #[error("the server has already stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Stopped,
}

/// Serves a single client over an inherited socket until it disconnects.
#[derive(Debug)]
pub struct Server {
    state: State,
    client: Option<Client>,
    sandbox: Option<Arc<Sandbox>>,
    workers: Workers,
    /// Set only until ownership moves into the client.
    client_fd: Option<OwnedFd>,
}

impl Server {
    /// Takes ownership of the client socket and prepares the sandbox.
    ///
    /// Nothing else is built when the socket is not a sequenced-packet socket.
    pub fn new(
        fd: OwnedFd,
        settings: &Settings,
        factory: Arc<dyn InterpreterFactory>,
    ) -> Result<Self, ServerError> {
        match Discipline::probe(fd.as_fd())? {
            Discipline::Datagram => {}
            other => return Err(ServerError::InvalidDiscipline(other)),
        }

        let mut server = Self {
            state: State::Running,
            client: None,
            sandbox: None,
            workers: Workers::new(settings.pool.clone(), settings.max_workers),
            client_fd: Some(fd),
        };

        let policy = SandboxPolicy::select(&settings.sandbox);
        tracing::info!(kind = ?policy.kind, path = ?policy.path, "selected sandbox policy");
        server.sandbox = Some(Arc::new(Sandbox::new(policy)?));

        if let Some(fd) = server.client_fd.take() {
            server.client = Some(Client::new(fd, factory)?);
        }

        Ok(server)
    }

    /// Dispatches client requests until the client disconnects, then tears down.
    ///
    /// Only a clean disconnect is a success.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn run(&mut self) -> Result<(), ServerError> {
        if self.state == State::Stopped {
            return Err(ServerError::Stopped);
        }

        let result = loop {
            let (Some(client), Some(sandbox)) = (&mut self.client, &self.sandbox) else {
                break Err(ServerError::Stopped);
            };

            match client.dispatch(&mut self.workers, sandbox) {
                Ok(Dispatch::Continue) => {}
                Ok(Dispatch::Disconnected) => {
                    tracing::info!("client disconnected");
                    break Ok(());
                }
                Err(error) => break Err(error.into()),
            }
        };

        self.teardown();
        result
    }

    /// Releases everything in dependency order. Calling it again does nothing.
    pub fn teardown(&mut self) {
        if let Some(client) = self.client.take() {
            client.destroy(&mut self.workers);
        }

        assert_eq!(
            self.workers.current(),
            0,
            "context workers outlived their client"
        );
        self.workers.drain();

        self.sandbox.take();
        self.client_fd.take();

        if self.state == State::Running {
            tracing::debug!("server stopped");
            self.state = State::Stopped;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod test {
    use std::{os::fd::OwnedFd, path::PathBuf, sync::Arc, time::Duration};

    use gpubox_util::{Connection, Discipline};
    use rstest::rstest;

    use super::{Server, ServerError};
    use crate::{noop::NoopRenderer, settings::Settings};

    fn settings_with_broken_sandbox() -> Settings {
        let mut settings = Settings::default();
        settings.sandbox.seccomp_bpf = Some(PathBuf::from("/nonexistent/gpubox/worker.bpf"));
        settings
    }

    #[rstest]
    #[timeout(Duration::from_secs(2))]
    fn stream_socket_is_rejected_before_the_sandbox() -> anyhow::Result<()> {
        let (fd, _peer) = Connection::pair(Discipline::Stream)?;

        let result = Server::new(
            OwnedFd::from(fd),
            &settings_with_broken_sandbox(),
            Arc::new(NoopRenderer),
        );
        assert!(matches!(
            result,
            Err(ServerError::InvalidDiscipline(Discipline::Stream))
        ));
        Ok(())
    }

    #[rstest]
    #[timeout(Duration::from_secs(2))]
    fn sandbox_failure_closes_the_descriptor() -> anyhow::Result<()> {
        let (fd, peer) = Connection::pair(Discipline::Datagram)?;

        let result = Server::new(
            OwnedFd::from(fd),
            &settings_with_broken_sandbox(),
            Arc::new(NoopRenderer),
        );
        assert!(matches!(result, Err(ServerError::Sandbox(_))));
        assert!(!peer.is_connected());
        Ok(())
    }

    #[rstest]
    #[timeout(Duration::from_secs(2))]
    fn teardown_is_idempotent() -> anyhow::Result<()> {
        let (fd, _peer) = Connection::pair(Discipline::Datagram)?;
        let mut server = Server::new(OwnedFd::from(fd), &Settings::default(), Arc::new(NoopRenderer))?;

        server.teardown();
        server.teardown();
        assert!(matches!(server.run(), Err(ServerError::Stopped)));
        Ok(())
    }
}
