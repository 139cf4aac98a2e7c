//! Errors surfaced to callers of the connection and client APIs

use serde_json::Value;
use std::time::Duration;

use crate::io::{ProcessError, TransportError};
use crate::rpc::connection::ClientState;
use crate::rpc::message::JsonRpcErrorObject;

/// Every way a send/await operation can fail
#[derive(Debug, thiserror::Error)]
pub enum AcpError {
    /// The connection or its transport was closed, locally or by a write failure
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The agent's stream ended while the request was outstanding
    #[error("Connection lost: agent stream ended")]
    ConnectionLost,

    #[error("Transport timed out after {0:?}")]
    TransportTimeout(Duration),

    #[error("Protocol version mismatch: client speaks {expected}, agent answered {actual}")]
    VersionMismatch { expected: u64, actual: String },

    #[error("Cannot {operation} in state {actual:?} (requires {expected:?})")]
    InvalidState {
        operation: String,
        expected: ClientState,
        actual: ClientState,
    },

    /// Error object returned by the agent
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No active session")]
    NoActiveSession,

    #[error("Request '{method}' timed out after {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to start agent: {0}")]
    Process(#[from] ProcessError),
}

impl AcpError {
    /// JSON-RPC error code, for errors that came off the wire
    pub fn code(&self) -> Option<i32> {
        match self {
            AcpError::JsonRpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True for failures that mean the connection is no longer usable
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            AcpError::ConnectionClosed(_) | AcpError::ConnectionLost
        )
    }
}

impl From<JsonRpcErrorObject> for AcpError {
    fn from(error: JsonRpcErrorObject) -> Self {
        AcpError::JsonRpc {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

impl From<TransportError> for AcpError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Closed => AcpError::ConnectionClosed("transport closed".to_string()),
            TransportError::Io(e) => AcpError::ConnectionClosed(format!("write failed: {e}")),
            TransportError::Serialize(e) => AcpError::Serialization(e),
            TransportError::Timeout(duration) => AcpError::TransportTimeout(duration),
        }
    }
}
