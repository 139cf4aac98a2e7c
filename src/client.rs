//! Session-level client built on [`Connection`]
//!
//! Walks the connection through its lifecycle: `initialize`, `session/new`,
//! then any number of prompts against the active session.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{Level, debug, info, warn};

use crate::io::{ProcessConfig, ProcessTransport};
use crate::log_timing;
use crate::rpc::connection::{ClientState, Connection, ConnectionBuilder};
use crate::rpc::error::AcpError;
use crate::rpc::jsonrpc_utils::error_codes;

/// Protocol version this client speaks
pub const PROTOCOL_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemCapability {
    pub read_text_file: bool,
    pub write_text_file: bool,
}

/// What the client offers to answer when the agent calls back.
/// Advertise only methods that have a handler registered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    pub fs: FileSystemCapability,
    pub terminal: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    protocol_version: u64,
    client_capabilities: ClientCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_info: Option<ClientInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewSessionParams {
    cwd: String,
    mcp_servers: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSessionResult {
    session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PromptParams<'a> {
    session_id: &'a str,
    prompt: Vec<ContentBlock<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock<'a> {
    Text { text: &'a str },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionParams<'a> {
    session_id: &'a str,
}

/// Client side of one agent connection
#[derive(Debug)]
pub struct AcpClient {
    connection: Connection,
    capabilities: ClientCapabilities,
    request_timeout: Option<Duration>,
    session_id: Mutex<Option<String>>,
}

impl AcpClient {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            capabilities: ClientCapabilities::default(),
            request_timeout: None,
            session_id: Mutex::new(None),
        }
    }

    /// Spawn the agent described by `config` and connect to it
    pub fn spawn(config: ProcessConfig, builder: ConnectionBuilder) -> Result<Self, AcpError> {
        let transport = ProcessTransport::spawn(config)?;
        Ok(Self::new(builder.connect(transport)))
    }

    pub fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Bound the handshake requests; prompts are never timed out
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn state(&self) -> ClientState {
        self.connection.state()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn active_session(&self) -> Result<String, AcpError> {
        self.session_id().ok_or(AcpError::NoActiveSession)
    }

    /// Negotiate the protocol version. Returns the agent's initialize result.
    pub async fn initialize(&self, client_info: Option<ClientInfo>) -> Result<Value, AcpError> {
        self.connection
            .ensure_state(ClientState::Created, "initialize")?;

        let started = Instant::now();
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION,
            client_capabilities: self.capabilities.clone(),
            client_info,
        };
        let result = self
            .connection
            .send_request("initialize", Some(params), self.request_timeout)
            .await?;

        match result.get("protocolVersion") {
            Some(Value::Number(version)) if version.as_u64() == Some(PROTOCOL_VERSION) => {}
            Some(other) => {
                return Err(AcpError::VersionMismatch {
                    expected: PROTOCOL_VERSION,
                    actual: other.to_string(),
                });
            }
            None => warn!("Agent did not report a protocol version"),
        }

        self.connection.advance_state(ClientState::Initialized)?;
        log_timing!(Level::DEBUG, "initialize", started.elapsed());
        info!("Agent initialized");
        Ok(result)
    }

    /// Create a session rooted at `cwd` and make it the active one
    pub async fn new_session(&self, cwd: impl AsRef<Path>) -> Result<String, AcpError> {
        self.connection
            .ensure_state(ClientState::Initialized, "create session")?;

        let params = NewSessionParams {
            cwd: cwd.as_ref().to_string_lossy().into_owned(),
            mcp_servers: Vec::new(),
        };
        let result: NewSessionResult = self
            .connection
            .request("session/new", Some(params), self.request_timeout)
            .await?;

        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(result.session_id.clone());
        self.connection.advance_state(ClientState::SessionActive)?;

        info!("Session {} active", result.session_id);
        Ok(result.session_id)
    }

    /// Send a text prompt to the active session; the agent's result is returned as-is
    pub async fn prompt(&self, text: &str) -> Result<Value, AcpError> {
        let session_id = self.active_session()?;
        let params = PromptParams {
            session_id: &session_id,
            prompt: vec![ContentBlock::Text { text }],
        };

        let result = self
            .connection
            .send_request("session/prompt", Some(params), None)
            .await;

        match result {
            Err(error) if error.code() == Some(error_codes::RESOURCE_NOT_FOUND) => {
                debug!("Agent does not know session {}: {}", session_id, error);
                Err(AcpError::SessionNotFound(session_id))
            }
            other => other,
        }
    }

    /// Ask the agent to stop the prompt turn in progress
    pub async fn cancel(&self) -> Result<(), AcpError> {
        let session_id = self.active_session()?;
        self.connection
            .send_notification(
                "session/cancel",
                Some(SessionParams {
                    session_id: &session_id,
                }),
            )
            .await
    }

    pub async fn close(&self) -> Result<(), AcpError> {
        self.connection.close().await
    }
}
