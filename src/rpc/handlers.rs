//! Handler dispatch chain for calls initiated by the agent
//!
//! Resolution order for an inbound request:
//!
//! 1. a typed handler registered for the exact method name
//! 2. the generic fallback handler
//! 3. a `Method not found` error
//!
//! Every path yields exactly one response message. Handler errors and panics
//! become `Internal error` responses, except that a failing fallback for
//! `session/request_permission` answers with a cancelled outcome instead: the
//! user's choice failed, not the protocol.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::rpc::jsonrpc_utils::{
    error_codes, error_object_response, error_response, method_not_found_response,
    success_response,
};
use crate::rpc::message::{JsonRpcErrorObject, JsonRpcMessage, RequestId};

/// Inbound method whose fallback failures answer "cancelled"
pub const REQUEST_PERMISSION_METHOD: &str = "session/request_permission";

/// Result sent back when a permission request could not be answered
pub fn cancelled_permission_outcome() -> Value {
    json!({ "outcome": { "outcome": "cancelled" } })
}

// ============================================================================
// Handler errors
// ============================================================================

/// Failure reported by a handler
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Generic failure, answered with `Internal error`
    #[error("{0}")]
    Failed(String),

    /// Specific protocol error to send back verbatim
    #[error("JSON-RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcErrorObject),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    pub fn rpc(code: i32, message: impl Into<String>) -> Self {
        HandlerError::Rpc(JsonRpcErrorObject {
            code,
            message: message.into(),
            data: None,
        })
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        HandlerError::Failed(error.to_string())
    }
}

/// Why a typed handler produced no result
#[derive(Debug)]
pub(crate) enum TypedFailure {
    InvalidParams(serde_json::Error),
    Handler(HandlerError),
    Serialize(serde_json::Error),
}

// ============================================================================
// Handler traits
// ============================================================================

/// Handler for any inbound method without a typed handler
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, HandlerError>;
}

/// Adapts an async closure into a [`FallbackHandler`]
pub struct FnFallback<F>(pub F);

#[async_trait]
impl<F, Fut> FallbackHandler for FnFallback<F>
where
    F: Fn(String, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, HandlerError> {
        (self.0)(method.to_string(), params).await
    }
}

/// Typed handler with its parameter/result types erased
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn call(&self, params: Option<Value>) -> Result<Value, TypedFailure>;
}

struct TypedHandler<P, R, F> {
    handler: F,
    _types: PhantomData<fn(P) -> R>,
}

#[async_trait]
impl<P, R, F, Fut> ErasedHandler for TypedHandler<P, R, F>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    async fn call(&self, params: Option<Value>) -> Result<Value, TypedFailure> {
        let params: P = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(TypedFailure::InvalidParams)?;
        let result = (self.handler)(params)
            .await
            .map_err(TypedFailure::Handler)?;
        serde_json::to_value(result).map_err(TypedFailure::Serialize)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Where an inbound method will be dispatched
#[derive(Clone)]
pub(crate) enum Route {
    Typed(Arc<dyn ErasedHandler>),
    Fallback(Arc<dyn FallbackHandler>),
    NotFound,
}

/// Handlers for calls initiated by the agent
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    typed: HashMap<String, Arc<dyn ErasedHandler>>,
    fallback: Option<Arc<dyn FallbackHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("typed", &self.typed.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for `method`, replacing any previous one
    ///
    /// Parameters that do not decode into `P` are answered with
    /// `Invalid params` without calling the handler.
    pub fn register<P, R, F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let handler = TypedHandler {
            handler,
            _types: PhantomData,
        };
        self.typed.insert(method.into(), Arc::new(handler));
    }

    /// Install the generic fallback handler
    pub fn set_fallback(&mut self, handler: impl FallbackHandler + 'static) {
        self.fallback = Some(Arc::new(handler));
    }

    /// Install an async closure as the generic fallback handler
    pub fn set_fallback_fn<F, Fut>(&mut self, handler: F)
    where
        F: Fn(String, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.set_fallback(FnFallback(handler));
    }

    pub fn has_typed_handler(&self, method: &str) -> bool {
        self.typed.contains_key(method)
    }

    pub(crate) fn route(&self, method: &str) -> Route {
        if let Some(handler) = self.typed.get(method) {
            Route::Typed(Arc::clone(handler))
        } else if let Some(fallback) = &self.fallback {
            Route::Fallback(Arc::clone(fallback))
        } else {
            Route::NotFound
        }
    }

    /// Run the dispatch chain and build the response to send back
    pub async fn dispatch(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> JsonRpcMessage {
        dispatch_route(self.route(method), id, method.to_string(), params).await
    }
}

/// Invoke a resolved route; handlers run on their own task so panics are contained
pub(crate) async fn dispatch_route(
    route: Route,
    id: RequestId,
    method: String,
    params: Option<Value>,
) -> JsonRpcMessage {
    match route {
        Route::Typed(handler) => {
            let outcome = tokio::spawn(async move { handler.call(params).await })
                .await
                .unwrap_or_else(|e| {
                    Err(TypedFailure::Handler(HandlerError::Panicked(join_error_message(e))))
                });

            match outcome {
                Ok(result) => success_response(id, result),
                Err(TypedFailure::InvalidParams(e)) => {
                    debug!(method = %method, error = %e, "Rejecting inbound request with invalid params");
                    error_response(
                        id,
                        error_codes::INVALID_PARAMS,
                        format!("Invalid params: {e}"),
                        None,
                    )
                }
                Err(TypedFailure::Handler(e)) => handler_error_response(id, &method, e),
                Err(TypedFailure::Serialize(e)) => handler_error_response(
                    id,
                    &method,
                    HandlerError::Failed(format!("failed to serialize result: {e}")),
                ),
            }
        }
        Route::Fallback(handler) => {
            let task_method = method.clone();
            let outcome = tokio::spawn(async move { handler.handle(&task_method, params).await })
                .await
                .unwrap_or_else(|e| Err(HandlerError::Panicked(join_error_message(e))));

            match outcome {
                Ok(result) => success_response(id, result),
                Err(e) if method == REQUEST_PERMISSION_METHOD => {
                    warn!(error = %e, "Permission handler failed; answering cancelled");
                    success_response(id, cancelled_permission_outcome())
                }
                Err(e) => handler_error_response(id, &method, e),
            }
        }
        Route::NotFound => {
            debug!(method = %method, "No handler for inbound request");
            method_not_found_response(id, &method)
        }
    }
}

fn handler_error_response(id: RequestId, method: &str, error: HandlerError) -> JsonRpcMessage {
    match error {
        HandlerError::Rpc(object) => error_object_response(id, object),
        other => {
            warn!(method = %method, error = %other, "Inbound request handler failed");
            error_response(id, error_codes::INTERNAL_ERROR, other.to_string(), None)
        }
    }
}

fn join_error_message(error: tokio::task::JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload: Box<dyn Any + Send> = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
