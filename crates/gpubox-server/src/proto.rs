//! Messages exchanged with the client on the control connection.

use serde::{Deserialize, Serialize};

pub type ContextId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    Nop,
    Init {
        flags: u32,
    },
    /// Destroys every context.
    Reset,
    /// Answered with the client end of the new context's connection.
    CreateContext {
        ctx_id: ContextId,
        flags: u32,
        name: String,
    },
    DestroyContext {
        ctx_id: ContextId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientReply {
    Init { ok: bool },
    CreateContext { ok: bool },
}
