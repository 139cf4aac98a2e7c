//! Connection - request correlation and inbound dispatch
//!
//! A [`Connection`] owns one [`Transport`] and a background dispatcher task.
//! Outgoing requests get a fresh numeric id and park a oneshot waiter in the
//! pending table; the dispatcher routes every inbound message:
//!
//! - responses wake the waiter registered under the same id
//! - requests from the agent run through the [`HandlerRegistry`] on their own task
//! - notifications go to the registered callbacks
//!
//! When the stream ends every waiter fails with [`AcpError::ConnectionLost`]
//! and the disconnect callback fires once. Answers to requests the agent sent
//! before hanging up are still written; new outbound traffic is refused.
//!
//! The dispatcher only holds a weak reference. Dropping the last handle
//! without [`Connection::close`] stops it and closes the transport.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, Span, debug, error, info, trace, warn};

use crate::io::Transport;
use crate::log_acp_message;
use crate::rpc::error::AcpError;
use crate::rpc::handlers::{HandlerRegistry, dispatch_route};
use crate::rpc::message::{JsonRpcMessage, MessageKind, RequestId};

pub const SESSION_UPDATE_METHOD: &str = "session/update";

/// Lifecycle of a client connection; only moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ClientState {
    Created = 0,
    Initialized = 1,
    SessionActive = 2,
    Closed = 3,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ClientState::Created,
            1 => ClientState::Initialized,
            2 => ClientState::SessionActive,
            _ => ClientState::Closed,
        }
    }
}

/// Error type callbacks may return; it is logged and otherwise ignored
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

pub type SessionUpdateCallback = Arc<dyn Fn(Value) -> Result<(), CallbackError> + Send + Sync>;
pub type NotificationCallback =
    Arc<dyn Fn(&str, Option<Value>) -> Result<(), CallbackError> + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(&Connection) + Send + Sync>;

#[derive(Clone, Default)]
struct Callbacks {
    session_update: Option<SessionUpdateCallback>,
    notification: Option<NotificationCallback>,
    disconnect: Option<DisconnectCallback>,
}

type Waiter = oneshot::Sender<Result<JsonRpcMessage, AcpError>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rw: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rw: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    transport: Arc<dyn Transport>,
    next_id: AtomicI64,
    /// Waiters keyed by the string form of the request id
    pending: Mutex<HashMap<String, Waiter>>,
    state: AtomicU8,
    handlers: RwLock<HandlerRegistry>,
    callbacks: RwLock<Callbacks>,
    disconnect_notified: AtomicBool,
    /// Set by the dispatcher once the agent's stream ended or failed
    peer_gone: AtomicBool,
    shutdown: CancellationToken,
    span: Span,
}

impl Inner {
    fn fail_pending(&self, make_error: impl Fn() -> AcpError) {
        let waiters: Vec<Waiter> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        if !waiters.is_empty() {
            debug!("Failing {} pending request(s)", waiters.len());
        }
        for waiter in waiters {
            let _ = waiter.send(Err(make_error()));
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Removes a pending entry however the waiting future ends
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, Waiter>>,
    key: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.key);
    }
}

/// Configure handlers and callbacks before the dispatcher starts
#[derive(Default)]
pub struct ConnectionBuilder {
    handlers: HandlerRegistry,
    callbacks: Callbacks,
    span: Option<Span>,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Called with the `session/update` params, after discriminator normalization
    pub fn on_session_update<F>(mut self, callback: F) -> Self
    where
        F: Fn(Value) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.callbacks.session_update = Some(Arc::new(callback));
        self
    }

    /// Called for every other notification
    pub fn on_notification<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Option<Value>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.callbacks.notification = Some(Arc::new(callback));
        self
    }

    /// Called once when the agent's stream ends
    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.callbacks.disconnect = Some(Arc::new(callback));
        self
    }

    /// Span that the dispatcher and handler tasks run in
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Start dispatching over `transport`. Must be called within a tokio runtime.
    pub fn connect(self, transport: impl Transport + 'static) -> Connection {
        self.connect_shared(Arc::new(transport))
    }

    pub fn connect_shared(self, transport: Arc<dyn Transport>) -> Connection {
        let span = self
            .span
            .unwrap_or_else(|| tracing::info_span!("acp_connection"));

        let inner = Arc::new(Inner {
            transport,
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            state: AtomicU8::new(ClientState::Created as u8),
            handlers: RwLock::new(self.handlers),
            callbacks: RwLock::new(self.callbacks),
            disconnect_notified: AtomicBool::new(false),
            peer_gone: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            span: span.clone(),
        });

        tokio::spawn(
            run_dispatcher(
                Arc::downgrade(&inner),
                Arc::clone(&inner.transport),
                inner.shutdown.clone(),
            )
            .instrument(span),
        );

        Connection { inner }
    }
}

/// Handle to a running connection; clones share the same dispatcher
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Connect with no handlers or callbacks registered
    pub fn new(transport: impl Transport + 'static) -> Self {
        ConnectionBuilder::new().connect(transport)
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// True after [`Connection::close`], once the transport is gone, or once
    /// the agent's stream has ended
    pub fn is_closed(&self) -> bool {
        self.state() == ClientState::Closed
            || self.inner.peer_gone.load(Ordering::SeqCst)
            || self.inner.transport.is_closed()
    }

    /// Number of requests still waiting for a response
    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Fail unless the connection is in `expected`.
    /// A live session also satisfies a requirement of `Initialized`.
    pub fn ensure_state(&self, expected: ClientState, operation: &str) -> Result<(), AcpError> {
        let actual = self.state();
        let satisfied = actual == expected
            || (expected == ClientState::Initialized && actual == ClientState::SessionActive);
        if satisfied {
            Ok(())
        } else {
            Err(AcpError::InvalidState {
                operation: operation.to_string(),
                expected,
                actual,
            })
        }
    }

    /// Move the state forward to `to`; staying put is allowed, going back is not.
    /// `Closed` is only reached through [`Connection::close`].
    pub fn advance_state(&self, to: ClientState) -> Result<(), AcpError> {
        let result = self
            .inner
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let current = ClientState::from_u8(current);
                let allowed =
                    current != ClientState::Closed && to != ClientState::Closed && to >= current;
                allowed.then_some(to as u8)
            });

        match result {
            Ok(previous) => {
                let previous = ClientState::from_u8(previous);
                if previous != to {
                    debug!("Connection state {:?} -> {:?}", previous, to);
                }
                Ok(())
            }
            Err(actual) => Err(AcpError::InvalidState {
                operation: format!("move to {to:?}"),
                expected: to,
                actual: ClientState::from_u8(actual),
            }),
        }
    }

    /// Send a request and wait for its response.
    ///
    /// With `timeout` set, the wait gives up with [`AcpError::RequestTimeout`]
    /// and a late response is dropped. The pending entry never outlives this call.
    pub async fn send_request<P: Serialize>(
        &self,
        method: &str,
        params: Option<P>,
        timeout: Option<Duration>,
    ) -> Result<Value, AcpError> {
        if self.is_closed() {
            return Err(AcpError::ConnectionClosed("connection is closed".to_string()));
        }

        let params = params.map(serde_json::to_value).transpose()?;
        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();

        let _guard = PendingGuard {
            pending: &self.inner.pending,
            key: id.key(),
        };
        lock(&self.inner.pending).insert(id.key(), tx);

        // close() and the dispatcher drain the table after marking the
        // connection closed; a request that registered after the drain would
        // otherwise wait forever
        if self.is_closed() {
            return Err(AcpError::ConnectionClosed("connection is closed".to_string()));
        }

        log_acp_message!(Level::DEBUG, "outgoing", method, &params);
        self.inner
            .transport
            .send(&JsonRpcMessage::request(id.clone(), method, params))
            .await?;

        let delivered = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(delivered) => delivered,
                Err(_) => {
                    warn!("Request {} ({}) timed out after {:?}", id, method, limit);
                    return Err(AcpError::RequestTimeout {
                        method: method.to_string(),
                        timeout: limit,
                    });
                }
            },
            None => rx.await,
        };

        let response = delivered
            .map_err(|_| AcpError::ConnectionClosed("response channel dropped".to_string()))??;

        if let Some(error) = response.error {
            debug!("Request {} ({}) failed with code {}", id, method, error.code);
            return Err(error.into());
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// [`Connection::send_request`] with the result decoded into `R`
    pub async fn request<P, R>(
        &self,
        method: &str,
        params: Option<P>,
        timeout: Option<Duration>,
    ) -> Result<R, AcpError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let result = self.send_request(method, params, timeout).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Fire-and-forget message with no id
    pub async fn send_notification<P: Serialize>(
        &self,
        method: &str,
        params: Option<P>,
    ) -> Result<(), AcpError> {
        if self.is_closed() {
            return Err(AcpError::ConnectionClosed("connection is closed".to_string()));
        }

        let params = params.map(serde_json::to_value).transpose()?;
        log_acp_message!(Level::DEBUG, "outgoing", method, &params);
        self.inner
            .transport
            .send(&JsonRpcMessage::notification(method, params))
            .await?;
        Ok(())
    }

    /// Modify the handler registry of a live connection
    pub fn with_handlers(&self, update: impl FnOnce(&mut HandlerRegistry)) {
        update(&mut write(&self.inner.handlers));
    }

    pub fn on_session_update<F>(&self, callback: F)
    where
        F: Fn(Value) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        write(&self.inner.callbacks).session_update = Some(Arc::new(callback));
    }

    pub fn on_notification<F>(&self, callback: F)
    where
        F: Fn(&str, Option<Value>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        write(&self.inner.callbacks).notification = Some(Arc::new(callback));
    }

    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        write(&self.inner.callbacks).disconnect = Some(Arc::new(callback));
    }

    /// Close the connection. Outstanding requests fail with
    /// [`AcpError::ConnectionClosed`]; calling it again does nothing.
    pub async fn close(&self) -> Result<(), AcpError> {
        let previous = self
            .inner
            .state
            .swap(ClientState::Closed as u8, Ordering::SeqCst);
        if ClientState::from_u8(previous) == ClientState::Closed {
            return Ok(());
        }

        info!(parent: &self.inner.span, "Closing connection");
        self.inner
            .fail_pending(|| AcpError::ConnectionClosed("client closed".to_string()));
        self.inner.shutdown.cancel();

        if let Err(e) = self.inner.transport.close().await {
            warn!(parent: &self.inner.span, "Error while closing transport: {}", e);
        }
        Ok(())
    }
}

async fn run_dispatcher(
    inner: Weak<Inner>,
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
) {
    debug!("Dispatcher started");

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => {
                // Cancelled either by close() or by the last handle dropping
                if inner.upgrade().is_none() {
                    release_transport(transport.as_ref()).await;
                } else {
                    debug!("Dispatcher stopped by close");
                }
                return;
            }
            received = transport.receive(None) => received,
        };

        let Some(strong) = inner.upgrade() else {
            release_transport(transport.as_ref()).await;
            return;
        };

        match received {
            Ok(Some(message)) => route_message(&strong, message),
            Ok(None) => {
                debug!("Agent stream ended");
                break;
            }
            Err(e) => {
                error!("Transport receive failed: {}", e);
                break;
            }
        }
    }

    let Some(inner) = inner.upgrade() else {
        release_transport(transport.as_ref()).await;
        return;
    };

    inner.peer_gone.store(true, Ordering::SeqCst);
    inner.fail_pending(|| AcpError::ConnectionLost);

    if !inner.disconnect_notified.swap(true, Ordering::SeqCst) {
        let callback = read(&inner.callbacks).disconnect.clone();
        if let Some(callback) = callback {
            let connection = Connection {
                inner: Arc::clone(&inner),
            };
            if catch_unwind(AssertUnwindSafe(|| callback(&connection))).is_err() {
                error!("Disconnect callback panicked");
            }
        }
    }

    debug!("Dispatcher stopped");
}

async fn release_transport(transport: &dyn Transport) {
    debug!("All connection handles dropped, closing transport");
    if let Err(e) = transport.close().await {
        warn!("Error while closing transport: {}", e);
    }
}

fn route_message(inner: &Arc<Inner>, message: JsonRpcMessage) {
    match message.kind() {
        MessageKind::Request => {
            let (Some(id), Some(method)) = (message.id, message.method) else {
                return;
            };
            log_acp_message!(Level::DEBUG, "incoming", &method, &message.params);
            let route = read(&inner.handlers).route(&method);
            let transport = Arc::clone(&inner.transport);
            let params = message.params;

            tokio::spawn(
                async move {
                    let response = dispatch_route(route, id, method, params).await;
                    if let Err(e) = transport.send(&response).await {
                        warn!("Failed to answer agent request: {}", e);
                    }
                }
                .instrument(inner.span.clone()),
            );
        }
        MessageKind::Response => {
            let Some(key) = message.id.as_ref().map(RequestId::key) else {
                return;
            };
            let waiter = lock(&inner.pending).remove(&key);
            match waiter {
                Some(waiter) => {
                    trace!("Delivering response for request {}", key);
                    if waiter.send(Ok(message)).is_err() {
                        debug!("Waiter for request {} gave up before its response arrived", key);
                    }
                }
                None => debug!("Dropping response for unknown request {}", key),
            }
        }
        MessageKind::Notification => {
            let Some(method) = message.method else {
                return;
            };
            log_acp_message!(Level::TRACE, "incoming", &method, &message.params);
            route_notification(inner, &method, message.params);
        }
        MessageKind::Malformed => warn!("Dropping message with neither id nor method"),
    }
}

fn route_notification(inner: &Inner, method: &str, params: Option<Value>) {
    let callbacks = read(&inner.callbacks).clone();

    if method == SESSION_UPDATE_METHOD {
        match callbacks.session_update {
            Some(callback) => {
                let payload = normalize_session_update(params.unwrap_or(Value::Null));
                invoke_callback(method, || callback(payload));
            }
            None => trace!("No session update callback registered"),
        }
    } else {
        match callbacks.notification {
            Some(callback) => invoke_callback(method, || callback(method, params)),
            None => trace!("No notification callback registered for {}", method),
        }
    }
}

fn invoke_callback(method: &str, callback: impl FnOnce() -> Result<(), CallbackError>) {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Callback for {} failed: {}", method, e),
        Err(_) => error!("Callback for {} panicked", method),
    }
}

/// Agents that tag `update` with `type` instead of `sessionUpdate` get the
/// field renamed, so callbacks only see one discriminator.
pub fn normalize_session_update(mut params: Value) -> Value {
    if let Some(update) = params.get_mut("update").and_then(Value::as_object_mut) {
        if !update.contains_key("sessionUpdate") {
            if let Some(kind) = update.remove("type") {
                update.insert("sessionUpdate".to_string(), kind);
            }
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::handlers::{HandlerError, REQUEST_PERMISSION_METHOD};
    use crate::rpc::jsonrpc_utils::error_codes;
    use crate::rpc::testing::MockAgent;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    #[cfg(feature = "test-logging")]
    crate::setup_test_logging!();

    const NO_PARAMS: Option<Value> = None;

    fn connect(builder: ConnectionBuilder) -> (Connection, MockAgent) {
        let (transport, agent) = MockAgent::pair();
        (builder.connect(transport), agent)
    }

    #[tokio::test]
    async fn test_first_request_uses_id_one() {
        let (conn, mut agent) = connect(Connection::builder());

        let call = tokio::spawn({
            let conn = conn.clone();
            async move {
                conn.send_request("initialize", Some(json!({"protocolVersion": 1})), None)
                    .await
            }
        });

        let request = agent.recv_value().await;
        assert_eq!(request["jsonrpc"], "2.0");
        assert_eq!(request["id"], 1);
        assert_eq!(request["method"], "initialize");
        assert_eq!(request["params"]["protocolVersion"], 1);

        agent
            .send_value(json!({"jsonrpc": "2.0", "id": 1, "result": {"protocolVersion": 1}}))
            .await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result, json!({"protocolVersion": 1}));
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (conn, mut agent) = connect(Connection::builder());

        let mut calls = Vec::new();
        for n in 0..3 {
            let conn = conn.clone();
            calls.push(tokio::spawn(async move {
                let result = conn
                    .send_request("echo", Some(json!({"n": n})), None)
                    .await
                    .unwrap();
                (n, result)
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(agent.recv_value().await);
        }

        for request in requests.iter().rev() {
            agent
                .send_value(json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "result": {"n": request["params"]["n"]}
                }))
                .await;
        }

        for call in calls {
            let (n, result) = call.await.unwrap();
            assert_eq!(result["n"], n);
        }
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_distinct_increasing_ids() {
        let (conn, mut agent) = connect(Connection::builder());

        let calls: Vec<_> = (0..20)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.send_request("ping", NO_PARAMS, None).await })
            })
            .collect();

        let mut ids = Vec::new();
        for _ in 0..20 {
            let request = agent.recv_value().await;
            ids.push(request["id"].as_i64().unwrap());
            agent
                .send_value(json!({"jsonrpc": "2.0", "id": request["id"], "result": null}))
                .await;
        }

        for call in calls {
            assert!(call.await.unwrap().is_ok());
        }

        ids.sort_unstable();
        assert_eq!(ids, (1..=20).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let (conn, mut agent) = connect(Connection::builder());

        let result = conn
            .send_request("slow", NO_PARAMS, Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(
            result,
            Err(AcpError::RequestTimeout { ref method, .. }) if method == "slow"
        ));
        assert_eq!(conn.pending_requests(), 0);

        // A late response is dropped and the connection keeps working
        let late = agent.recv_value().await;
        agent
            .send_value(json!({"jsonrpc": "2.0", "id": late["id"], "result": "late"}))
            .await;

        let call = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_request("next", NO_PARAMS, None).await }
        });
        let next = agent.recv_value().await;
        assert_eq!(next["id"], 2);
        agent
            .send_value(json!({"jsonrpc": "2.0", "id": 2, "result": "ok"}))
            .await;
        assert_eq!(call.await.unwrap().unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_error_response_surfaces_code() {
        let (conn, mut agent) = connect(Connection::builder());

        let call = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_request("session/load", NO_PARAMS, None).await }
        });

        let request = agent.recv_value().await;
        agent
            .send_value(json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -32002, "message": "Resource not found"}
            }))
            .await;

        let error = call.await.unwrap().unwrap_err();
        assert_eq!(error.code(), Some(error_codes::RESOURCE_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_string_response_id_matches_numeric_request() {
        let (conn, mut agent) = connect(Connection::builder());

        let call = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_request("ping", NO_PARAMS, None).await }
        });

        agent.recv_value().await;
        agent
            .send_value(json!({"jsonrpc": "2.0", "id": "1", "result": "pong"}))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped() {
        let (conn, mut agent) = connect(Connection::builder());

        let call = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_request("ping", NO_PARAMS, None).await }
        });

        agent.recv_value().await;
        agent.send_raw("{not json").await;
        agent
            .send_value(json!({"jsonrpc": "2.0", "id": 1, "result": "pong"}))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_typed_request_decodes_result() {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct NewSession {
            session_id: String,
        }

        let (conn, mut agent) = connect(Connection::builder());

        let call = tokio::spawn({
            let conn = conn.clone();
            async move {
                conn.request::<_, NewSession>("session/new", Some(json!({"cwd": "/"})), None)
                    .await
            }
        });

        agent.recv_value().await;
        agent
            .send_value(json!({"jsonrpc": "2.0", "id": 1, "result": {"sessionId": "s-1"}}))
            .await;

        assert_eq!(call.await.unwrap().unwrap().session_id, "s-1");
    }

    #[tokio::test]
    async fn test_notification_has_no_id() {
        let (conn, mut agent) = connect(Connection::builder());

        conn.send_notification("session/cancel", Some(json!({"sessionId": "s-1"})))
            .await
            .unwrap();

        let message = agent.recv_value().await;
        assert_eq!(message["method"], "session/cancel");
        assert!(message.get("id").is_none());
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_is_idempotent() {
        let (conn, mut agent) = connect(Connection::builder());

        let call = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_request("slow", NO_PARAMS, None).await }
        });
        agent.recv_value().await;

        conn.close().await.unwrap();
        let error = call.await.unwrap().unwrap_err();
        assert!(matches!(error, AcpError::ConnectionClosed(_)));

        assert_eq!(conn.state(), ClientState::Closed);
        assert!(conn.close().await.is_ok());

        assert!(matches!(
            conn.send_request("ping", NO_PARAMS, None).await,
            Err(AcpError::ConnectionClosed(_))
        ));
        assert!(matches!(
            conn.send_notification("ping", NO_PARAMS).await,
            Err(AcpError::ConnectionClosed(_))
        ));
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_end_of_stream_fails_all_pending_and_disconnects_once() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (conn, mut agent) = connect(Connection::builder().on_disconnect({
            let disconnects = Arc::clone(&disconnects);
            move |_| {
                disconnects.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let calls: Vec<_> = (0..2)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.send_request("slow", NO_PARAMS, None).await })
            })
            .collect();
        agent.recv_value().await;
        agent.recv_value().await;

        agent.hang_up();

        for call in calls {
            assert!(matches!(
                call.await.unwrap(),
                Err(AcpError::ConnectionLost)
            ));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(conn.pending_requests(), 0);

        // Later requests fail immediately instead of hanging
        assert!(
            conn.send_request("ping", NO_PARAMS, None)
                .await
                .unwrap_err()
                .is_disconnect()
        );
    }

    #[tokio::test]
    async fn test_inbound_request_before_end_of_stream_is_answered() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("fs/read_text_file", |params: Value| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, HandlerError>(json!({"content": params["path"]}))
        });
        let (conn, mut agent) = connect(Connection::builder().handlers(handlers));

        agent
            .send_raw(
                r#"{"jsonrpc":"2.0","id":9,"method":"fs/read_text_file","params":{"path":"/tmp/a.txt"}}"#,
            )
            .await;
        agent.hang_up();

        let response = tokio::time::timeout(Duration::from_secs(1), agent.recv_value())
            .await
            .expect("answer written after end-of-stream");
        assert_eq!(response["id"], 9);
        assert_eq!(response["result"]["content"], "/tmp/a.txt");

        // New outbound traffic is refused once the agent hung up
        assert!(conn.is_closed());
        assert!(
            conn.send_request("ping", NO_PARAMS, None)
                .await
                .unwrap_err()
                .is_disconnect()
        );
        assert!(conn.send_notification("ping", NO_PARAMS).await.is_err());
        assert!(conn.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_panicking_disconnect_callback_is_contained() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (conn, mut agent) = connect(Connection::builder().on_disconnect({
            let disconnects = Arc::clone(&disconnects);
            move |_| {
                disconnects.fetch_add(1, Ordering::SeqCst);
                panic!("disconnect callback blew up");
            }
        }));

        let call = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_request("slow", NO_PARAMS, None).await }
        });
        agent.recv_value().await;

        agent.hang_up();

        assert!(matches!(call.await.unwrap(), Err(AcpError::ConnectionLost)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(conn.pending_requests(), 0);
        assert!(conn.close().await.is_ok());
        assert_eq!(conn.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn test_dropping_last_handle_releases_transport() {
        let (conn, mut agent) = connect(Connection::builder());
        let other = conn.clone();

        drop(conn);
        // One handle is still alive, so the agent's input stays open
        assert!(
            tokio::time::timeout(Duration::from_millis(100), agent.recv())
                .await
                .is_err()
        );

        drop(other);
        let received = tokio::time::timeout(Duration::from_secs(1), agent.recv())
            .await
            .expect("agent input closed after the last handle dropped");
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_close_from_disconnect_callback() {
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let (conn, mut agent) = connect(Connection::builder().on_disconnect(move |conn| {
            let conn = conn.clone();
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let result = conn.close().await;
                let _ = closed_tx.send((result.is_ok(), conn.state()));
            });
        }));

        agent.hang_up();

        let (ok, state) = closed_rx.recv().await.unwrap();
        assert!(ok);
        assert_eq!(state, ClientState::Closed);
        assert!(conn.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_agent_request_gets_method_not_found() {
        let (_conn, mut agent) = connect(Connection::builder());

        agent
            .send_value(json!({"jsonrpc": "2.0", "id": "x", "method": "unknown/method", "params": {}}))
            .await;

        let response = agent.recv_value().await;
        assert_eq!(response["id"], "x");
        assert_eq!(response["error"]["code"], error_codes::METHOD_NOT_FOUND);
        assert!(response.get("result").is_none());
    }

    #[tokio::test]
    async fn test_failing_permission_fallback_answers_cancelled() {
        let mut handlers = HandlerRegistry::new();
        handlers.set_fallback_fn(|_method: String, _params: Option<Value>| async move {
            Err::<Value, _>(HandlerError::failed("user went away"))
        });
        let (_conn, mut agent) = connect(Connection::builder().handlers(handlers));

        agent
            .send_value(json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": REQUEST_PERMISSION_METHOD,
                "params": {"sessionId": "s-1", "options": []}
            }))
            .await;

        let response = agent.recv_value().await;
        assert_eq!(response["id"], 7);
        assert_eq!(response["result"]["outcome"]["outcome"], "cancelled");
    }

    #[tokio::test]
    async fn test_handler_registered_after_connect() {
        let (conn, mut agent) = connect(Connection::builder());

        conn.with_handlers(|handlers| {
            handlers.register("fs/read_text_file", |params: Value| async move {
                Ok::<_, HandlerError>(json!({"content": params["path"]}))
            });
        });

        agent
            .send_value(json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "fs/read_text_file",
                "params": {"path": "/tmp/a.txt"}
            }))
            .await;

        let response = agent.recv_value().await;
        assert_eq!(response["id"], 3);
        assert_eq!(response["result"]["content"], "/tmp/a.txt");
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_dispatch() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("slow", |_: Value| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok::<_, HandlerError>(json!("slow"))
        });
        handlers.register("fast", |_: Value| async move { Ok::<_, HandlerError>(json!("fast")) });
        let (_conn, mut agent) = connect(Connection::builder().handlers(handlers));

        agent
            .send_value(json!({"jsonrpc": "2.0", "id": 1, "method": "slow"}))
            .await;
        agent
            .send_value(json!({"jsonrpc": "2.0", "id": 2, "method": "fast"}))
            .await;

        let first = agent.recv_value().await;
        assert_eq!(first["id"], 2);
        let second = agent.recv_value().await;
        assert_eq!(second["id"], 1);
    }

    #[tokio::test]
    async fn test_session_update_discriminator_is_normalized() {
        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
        let (_conn, mut agent) = connect(Connection::builder().on_session_update(move |update| {
            updates_tx.send(update)?;
            Ok(())
        }));

        agent
            .send_value(json!({
                "jsonrpc": "2.0",
                "method": "session/update",
                "params": {
                    "sessionId": "s-1",
                    "update": {"type": "agent_message_chunk", "content": {"type": "text", "text": "hi"}}
                }
            }))
            .await;

        let update = updates_rx.recv().await.unwrap();
        assert_eq!(update["sessionId"], "s-1");
        assert_eq!(update["update"]["sessionUpdate"], "agent_message_chunk");
        assert!(update["update"].get("type").is_none());
        assert_eq!(update["update"]["content"]["type"], "text");
    }

    #[tokio::test]
    async fn test_failing_callbacks_do_not_stop_dispatch() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let (conn, mut agent) = connect(
            Connection::builder()
                .on_session_update(|_| panic!("update callback exploded"))
                .on_notification(move |method, _| {
                    seen_tx.send(method.to_string())?;
                    Err("not interested".into())
                }),
        );

        let call = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_request("ping", NO_PARAMS, None).await }
        });
        agent.recv_value().await;

        agent
            .send_value(json!({"jsonrpc": "2.0", "method": "session/update", "params": {"update": {}}}))
            .await;
        agent
            .send_value(json!({"jsonrpc": "2.0", "method": "custom/event"}))
            .await;
        agent
            .send_value(json!({"jsonrpc": "2.0", "id": 1, "result": "pong"}))
            .await;

        assert_eq!(seen_rx.recv().await.unwrap(), "custom/event");
        assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_ensure_state() {
        let (conn, _agent) = connect(Connection::builder());

        let error = conn
            .ensure_state(ClientState::Initialized, "create session")
            .unwrap_err();
        assert!(matches!(
            error,
            AcpError::InvalidState {
                expected: ClientState::Initialized,
                actual: ClientState::Created,
                ..
            }
        ));
        assert_eq!(conn.state(), ClientState::Created);

        conn.advance_state(ClientState::SessionActive).unwrap();
        assert!(conn.ensure_state(ClientState::Initialized, "prompt").is_ok());
        assert!(conn.ensure_state(ClientState::Created, "initialize").is_err());
    }

    #[tokio::test]
    async fn test_state_only_moves_forward() {
        let (conn, _agent) = connect(Connection::builder());

        conn.advance_state(ClientState::Initialized).unwrap();
        conn.advance_state(ClientState::Initialized).unwrap();
        assert!(conn.advance_state(ClientState::Created).is_err());
        assert!(conn.advance_state(ClientState::Closed).is_err());

        conn.close().await.unwrap();
        assert!(conn.advance_state(ClientState::SessionActive).is_err());
        assert_eq!(conn.state(), ClientState::Closed);
    }

    #[test]
    fn test_normalize_keeps_existing_discriminator() {
        let params = json!({"update": {"sessionUpdate": "plan", "type": "other"}});
        let normalized = normalize_session_update(params.clone());
        assert_eq!(normalized, params);

        assert_eq!(normalize_session_update(Value::Null), Value::Null);
    }
}
