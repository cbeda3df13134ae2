//! Render contexts, each served by its own worker on the pool.

use std::{
    os::fd::AsFd,
    sync::Arc,
};

use gpubox_sandbox::{Sandbox, SandboxError};
use gpubox_util::{
    Connection, Discipline, PoolConfig, PoolError, Saturation, TransportError, WorkerPool,
    MAX_HANDLES,
};
use thiserror::Error;

use crate::interpreter::{ContextInfo, InterpretError, InterpreterFactory, Request};

/// Largest request a context accepts.
pub const CONTEXT_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("all {0} context workers are in use")]
    Limit(usize),
    #[error("failed to start the context worker")]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to enter the sandbox")]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Interpret(#[from] InterpretError),
}

/// Counts the context workers running on the pool.
#[derive(Debug)]
pub struct Workers {
    pool: WorkerPool,
    current: usize,
    max: usize,
}

impl Workers {
    pub fn new(mut config: PoolConfig, max: usize) -> Self {
        // A context holds its worker until the client destroys it, and the client is waiting on the reply.
        if config.max_threads.is_some() && config.saturation == Saturation::Wait {
            tracing::warn!("a bounded pool cannot wait for context workers, rejecting instead");
            config.saturation = Saturation::Reject;
        }

        Self {
            pool: WorkerPool::new(config),
            current: 0,
            max,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn drain(&self) {
        self.pool.drain();
    }
}

/// A running context as seen by the control loop.
#[derive(Debug)]
pub struct ContextRecord {
    info: ContextInfo,
    connection: Arc<Connection>,
    exited: flume::Receiver<Result<(), ContextError>>,
}

impl ContextRecord {
    /// Starts a worker for the context and returns the client end of its connection.
    pub fn spawn(
        info: ContextInfo,
        workers: &mut Workers,
        sandbox: &Arc<Sandbox>,
        factory: &Arc<dyn InterpreterFactory>,
    ) -> Result<(Self, Connection), ContextError> {
        if workers.current >= workers.max {
            return Err(ContextError::Limit(workers.max));
        }

        let (server, client) = Connection::pair(Discipline::Datagram)?;
        let connection = Arc::new(server);
        let (tx, exited) = flume::bounded(1);

        {
            let info = info.clone();
            let connection = connection.clone();
            let sandbox = sandbox.clone();
            let factory = factory.clone();
            workers.pool.run(move || {
                let result = serve(&info, &connection, &sandbox, factory.as_ref());
                if let Err(error) = &result {
                    tracing::warn!(?error, ctx_id = info.ctx_id, "context worker failed");
                    // no reply is coming, so hang up on the client
                    if let Err(error) = connection.shutdown() {
                        tracing::warn!(?error, ctx_id = info.ctx_id, "failed to shut down context connection");
                    }
                }
                let _ = tx.send(result);
            })?;
        }

        workers.current += 1;
        tracing::debug!(ctx_id = info.ctx_id, name = %info.name, "context started");
        Ok((
            Self {
                info,
                connection,
                exited,
            },
            client,
        ))
    }

    pub fn info(&self) -> &ContextInfo {
        &self.info
    }

    /// Stops the worker and waits for it to finish.
    pub fn reap(self, workers: &mut Workers) {
        if let Err(error) = self.connection.shutdown() {
            tracing::warn!(?error, ctx_id = self.info.ctx_id, "failed to shut down context connection");
        }

        if self.exited.recv().is_err() {
            tracing::error!(ctx_id = self.info.ctx_id, "context worker exited without reporting");
        }

        workers.current -= 1;
        tracing::debug!(ctx_id = self.info.ctx_id, "context reaped");
    }
}

#[tracing::instrument(level = "debug", skip_all, fields(ctx_id = info.ctx_id))]
fn serve(
    info: &ContextInfo,
    connection: &Connection,
    sandbox: &Sandbox,
    factory: &dyn InterpreterFactory,
) -> Result<(), ContextError> {
    sandbox.enter()?;
    let mut interpreter = factory.create(info)?;
    let mut buffer = vec![0u8; CONTEXT_BUFFER_SIZE];

    loop {
        let received = match connection.receive(&mut buffer, MAX_HANDLES) {
            Ok(received) => received,
            Err(TransportError::Disconnected) => return Ok(()),
            Err(error) => return Err(error.into()),
        };

        let request = Request {
            ctx_id: info.ctx_id,
            payload: &buffer[..received.len],
            handles: received.handles,
        };

        let Some(reply) = interpreter.interpret(request)? else {
            continue;
        };

        let handles = reply.handles.iter().map(AsFd::as_fd).collect::<Vec<_>>();
        match connection.send(&reply.payload, &handles) {
            Ok(()) => {}
            Err(TransportError::Disconnected) => return Ok(()),
            Err(error) => return Err(error.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use gpubox_sandbox::{Sandbox, SandboxPolicy};
    use gpubox_util::{Connection, PoolConfig, Saturation, TransportError};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::{ContextError, ContextRecord, Workers};
    use crate::{
        interpreter::{
            CommandInterpreter, ContextInfo, InterpretError, InterpreterFactory, Reply, Request,
        },
        noop::NoopRenderer,
    };

    struct Echo;

    impl CommandInterpreter for Echo {
        fn interpret(&mut self, request: Request<'_>) -> Result<Option<Reply>, InterpretError> {
            Ok(Some(Reply {
                payload: request.payload.to_vec(),
                handles: request.handles,
            }))
        }
    }

    struct EchoFactory;

    impl InterpreterFactory for EchoFactory {
        fn create(&self, _info: &ContextInfo) -> Result<Box<dyn CommandInterpreter>, InterpretError> {
            Ok(Box::new(Echo))
        }
    }

    struct RefusingFactory;

    impl InterpreterFactory for RefusingFactory {
        fn create(&self, info: &ContextInfo) -> Result<Box<dyn CommandInterpreter>, InterpretError> {
            Err(InterpretError::Rejected {
                ctx_id: info.ctx_id,
                reason: "no device".into(),
            })
        }
    }

    fn info(ctx_id: u32) -> ContextInfo {
        ContextInfo {
            ctx_id,
            flags: 0,
            name: format!("ctx-{ctx_id}"),
        }
    }

    fn fixtures() -> anyhow::Result<(Arc<Sandbox>, Arc<dyn InterpreterFactory>)> {
        Ok((
            Arc::new(Sandbox::new(SandboxPolicy::NONE)?),
            Arc::new(EchoFactory),
        ))
    }

    fn echo(client: &Connection, message: &[u8]) -> anyhow::Result<Vec<u8>> {
        client.send(message, &[])?;
        let mut buffer = [0u8; 64];
        let received = client.receive(&mut buffer, 0)?;
        Ok(buffer[..received.len].to_vec())
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn serves_until_reaped() -> anyhow::Result<()> {
        let (sandbox, factory) = fixtures()?;
        let mut workers = Workers::new(PoolConfig::default(), 4);

        let (record, client) = ContextRecord::spawn(info(1), &mut workers, &sandbox, &factory)?;
        assert_eq!(workers.current(), 1);
        assert_eq!(echo(&client, b"hello")?, b"hello");

        record.reap(&mut workers);
        assert_eq!(workers.current(), 0);
        assert!(!client.is_connected());

        workers.drain();
        Ok(())
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn client_disconnect_ends_the_worker() -> anyhow::Result<()> {
        let (sandbox, factory) = fixtures()?;
        let mut workers = Workers::new(PoolConfig::default(), 4);

        let (record, client) = ContextRecord::spawn(info(1), &mut workers, &sandbox, &factory)?;
        drop(client);

        assert!(matches!(record.exited.recv()?, Ok(())));
        workers.current -= 1;
        workers.drain();
        Ok(())
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn worker_limit() -> anyhow::Result<()> {
        let (sandbox, factory) = fixtures()?;
        let mut workers = Workers::new(PoolConfig::default(), 2);

        let a = ContextRecord::spawn(info(1), &mut workers, &sandbox, &factory)?;
        let b = ContextRecord::spawn(info(2), &mut workers, &sandbox, &factory)?;
        assert!(matches!(
            ContextRecord::spawn(info(3), &mut workers, &sandbox, &factory),
            Err(ContextError::Limit(2))
        ));

        a.0.reap(&mut workers);
        let c = ContextRecord::spawn(info(3), &mut workers, &sandbox, &factory)?;
        assert_eq!(echo(&c.1, b"third")?, b"third");

        b.0.reap(&mut workers);
        c.0.reap(&mut workers);
        assert_eq!(workers.current(), 0);
        Ok(())
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn bounded_pool_rejects_instead_of_waiting() -> anyhow::Result<()> {
        let (sandbox, factory) = fixtures()?;
        let config = PoolConfig {
            max_threads: Some(1),
            saturation: Saturation::Wait,
            ..PoolConfig::default()
        };
        let mut workers = Workers::new(config, 8);

        let (record, _client) = ContextRecord::spawn(info(1), &mut workers, &sandbox, &factory)?;
        assert!(matches!(
            ContextRecord::spawn(info(2), &mut workers, &sandbox, &factory),
            Err(ContextError::Pool(_))
        ));
        assert_eq!(workers.current(), 1);

        record.reap(&mut workers);
        Ok(())
    }

    fn assert_hung_up(client: &Connection) {
        let mut buffer = [0u8; 64];
        assert!(matches!(
            client.receive(&mut buffer, 0),
            Err(TransportError::Disconnected)
        ));
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn malformed_request_hangs_up_on_the_client() -> anyhow::Result<()> {
        let sandbox = Arc::new(Sandbox::new(SandboxPolicy::NONE)?);
        let factory: Arc<dyn InterpreterFactory> = Arc::new(NoopRenderer);
        let mut workers = Workers::new(PoolConfig::default(), 4);

        let (record, client) = ContextRecord::spawn(info(1), &mut workers, &sandbox, &factory)?;
        client.send(&[0xff, 0xff], &[])?;
        assert_hung_up(&client);

        record.reap(&mut workers);
        assert_eq!(workers.current(), 0);
        workers.drain();
        Ok(())
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn factory_failure_hangs_up_on_the_client() -> anyhow::Result<()> {
        let sandbox = Arc::new(Sandbox::new(SandboxPolicy::NONE)?);
        let factory: Arc<dyn InterpreterFactory> = Arc::new(RefusingFactory);
        let mut workers = Workers::new(PoolConfig::default(), 4);

        let (record, client) = ContextRecord::spawn(info(1), &mut workers, &sandbox, &factory)?;
        assert_hung_up(&client);
        assert!(matches!(
            record.exited.recv()?,
            Err(ContextError::Interpret(InterpretError::Rejected { ctx_id: 1, .. }))
        ));

        workers.current -= 1;
        assert_eq!(workers.current(), 0);
        workers.drain();
        Ok(())
    }
}
