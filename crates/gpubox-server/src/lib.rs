//! A render server that runs untrusted command streams in sandboxed worker threads.

pub mod client;
pub mod context;
pub mod interpreter;
pub mod noop;
pub mod proto;
pub mod server;
pub mod settings;

pub use interpreter::{CommandInterpreter, ContextInfo, InterpretError, InterpreterFactory, Reply, Request};
pub use noop::NoopRenderer;
pub use server::{Server, ServerError};
pub use settings::Settings;
