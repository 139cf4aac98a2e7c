//! JSON-RPC layer - message model, correlation and inbound dispatch
//!
//! - **Message**: the wire envelope and request ids
//! - **Connection**: outgoing request correlation plus the dispatcher task
//! - **Handlers**: how requests initiated by the agent get answered

pub mod connection;
pub mod error;
pub mod handlers;
pub mod jsonrpc_utils;
pub mod message;

#[cfg(test)]
pub mod testing;

pub use connection::{CallbackError, ClientState, Connection, ConnectionBuilder};
pub use error::AcpError;
pub use handlers::{FallbackHandler, HandlerError, HandlerRegistry};
pub use message::{JsonRpcErrorObject, JsonRpcMessage, MessageKind, RequestId};
