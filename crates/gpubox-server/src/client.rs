use std::{
    collections::HashMap,
    os::fd::{AsFd, OwnedFd},
    sync::Arc,
};

use gpubox_sandbox::Sandbox;
use gpubox_util::{Connection, TransportError, MAX_HANDLES};
use thiserror::Error;

use crate::{
    context::{ContextRecord, Workers},
    interpreter::{ContextInfo, InterpreterFactory},
    proto::{ClientReply, ClientRequest, ContextId},
};

/// Largest control request the client may send.
pub const CLIENT_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed control message")]
    Codec(#[from] postcard::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Disconnected,
}

/// The single client of a server and the contexts it created.
pub struct Client {
    connection: Connection,
    factory: Arc<dyn InterpreterFactory>,
    contexts: HashMap<ContextId, ContextRecord>,
    flags: Option<u32>,
    buffer: Vec<u8>,
}

impl Client {
    pub fn new(fd: OwnedFd, factory: Arc<dyn InterpreterFactory>) -> Result<Self, ClientError> {
        Ok(Self {
            connection: Connection::new(fd)?,
            factory,
            contexts: HashMap::new(),
            flags: None,
            buffer: vec![0u8; CLIENT_BUFFER_SIZE],
        })
    }

    /// Reads, handles and answers one control request.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn dispatch(
        &mut self,
        workers: &mut Workers,
        sandbox: &Arc<Sandbox>,
    ) -> Result<Dispatch, ClientError> {
        let received = match self.connection.receive(&mut self.buffer, MAX_HANDLES) {
            Ok(received) => received,
            Err(TransportError::Disconnected) => return Ok(Dispatch::Disconnected),
            Err(error) => return Err(error.into()),
        };

        if !received.handles.is_empty() {
            tracing::debug!(count = received.handles.len(), "closing handles sent with a control request");
        }
        drop(received.handles);

        let request: ClientRequest = postcard::from_bytes(&self.buffer[..received.len])?;
        tracing::trace!(?request, "control request");

        let (reply, context) = match request {
            ClientRequest::Nop => return Ok(Dispatch::Continue),
            ClientRequest::Init { flags } => (ClientReply::Init { ok: self.init(flags) }, None),
            ClientRequest::Reset => {
                self.reset(workers);
                return Ok(Dispatch::Continue);
            }
            ClientRequest::CreateContext {
                ctx_id,
                flags,
                name,
            } => {
                let info = ContextInfo {
                    ctx_id,
                    flags,
                    name,
                };
                let context = self.create_context(info, workers, sandbox);
                let reply = ClientReply::CreateContext {
                    ok: context.is_some(),
                };
                (reply, context)
            }
            ClientRequest::DestroyContext { ctx_id } => {
                self.destroy_context(ctx_id, workers);
                return Ok(Dispatch::Continue);
            }
        };

        let payload = postcard::to_allocvec(&reply)?;
        let handles = context.iter().map(AsFd::as_fd).collect::<Vec<_>>();
        match self.connection.send(&payload, &handles) {
            Ok(()) => Ok(Dispatch::Continue),
            Err(TransportError::Disconnected) => Ok(Dispatch::Disconnected),
            Err(error) => Err(error.into()),
        }
    }

    /// Reaps every context.
    pub fn destroy(mut self, workers: &mut Workers) {
        self.reset(workers);
    }

    fn init(&mut self, flags: u32) -> bool {
        match self.flags {
            None => {
                self.flags = Some(flags);
                true
            }
            Some(current) => current == flags,
        }
    }

    fn reset(&mut self, workers: &mut Workers) {
        for (_, context) in self.contexts.drain() {
            context.reap(workers);
        }
        self.flags = None;
    }

    fn create_context(
        &mut self,
        info: ContextInfo,
        workers: &mut Workers,
        sandbox: &Arc<Sandbox>,
    ) -> Option<Connection> {
        if self.contexts.contains_key(&info.ctx_id) {
            tracing::warn!(ctx_id = info.ctx_id, "context already exists");
            return None;
        }

        let ctx_id = info.ctx_id;
        match ContextRecord::spawn(info, workers, sandbox, &self.factory) {
            Ok((record, connection)) => {
                self.contexts.insert(ctx_id, record);
                Some(connection)
            }
            Err(error) => {
                tracing::warn!(?error, ctx_id, "failed to create context");
                None
            }
        }
    }

    fn destroy_context(&mut self, ctx_id: ContextId, workers: &mut Workers) {
        match self.contexts.remove(&ctx_id) {
            Some(context) => context.reap(workers),
            None => tracing::debug!(ctx_id, "destroying unknown context"),
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.connection)
            .field("contexts", &self.contexts.len())
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}
