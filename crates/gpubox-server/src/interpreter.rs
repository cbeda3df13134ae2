//! The boundary between a context worker and the code that executes its commands.

use std::os::fd::OwnedFd;

use thiserror::Error;

use crate::proto::ContextId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextInfo {
    pub ctx_id: ContextId,
    pub flags: u32,
    pub name: String,
}

/// One message received on a context connection.
#[derive(Debug)]
pub struct Request<'a> {
    pub ctx_id: ContextId,
    pub payload: &'a [u8],
    pub handles: Vec<OwnedFd>,
}

#[derive(Debug, Default)]
pub struct Reply {
    pub payload: Vec<u8>,
    pub handles: Vec<OwnedFd>,
}

#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("malformed request")]
    Decode(#[from] postcard::Error),
    #[error("an i/o error occurred")]
    IO(#[from] std::io::Error),
    #[error("context {ctx_id} rejected: {reason}")]
    Rejected { ctx_id: ContextId, reason: String },
}

/// Executes the commands of one context. Runs on the context's worker thread, inside the sandbox.
pub trait CommandInterpreter: Send {
    /// Returns the reply to send, if any.
    fn interpret(&mut self, request: Request<'_>) -> Result<Option<Reply>, InterpretError>;
}

pub trait InterpreterFactory: Send + Sync + 'static {
    fn create(&self, info: &ContextInfo) -> Result<Box<dyn CommandInterpreter>, InterpretError>;
}
