//! Client-side engine for the Agent Client Protocol
//!
//! Talks JSON-RPC 2.0 to an agent subprocess over newline-delimited stdio.
//! [`Connection`] correlates requests with responses and dispatches whatever
//! the agent sends unprompted; [`AcpClient`] adds the session lifecycle.

pub mod client;
pub mod io;
pub mod logging;
pub mod rpc;

#[cfg(test)]
mod test_utils;

pub use client::{AcpClient, ClientCapabilities, ClientInfo};
pub use io::{ProcessConfig, ProcessTransport, StdioTransport, Transport};
pub use rpc::{AcpError, ClientState, Connection, ConnectionBuilder, HandlerError, HandlerRegistry};
