//! JSON-RPC 2.0 wire messages
//!
//! A single envelope type covers every shape the protocol puts on the wire.
//! Classification into request, response or notification is decided by which
//! of `id` and `method` are present, never by field values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::rpc::jsonrpc_utils::JSONRPC_VERSION;

// ============================================================================
// Request identifiers
// ============================================================================

/// Identifier of a request, as permitted by JSON-RPC 2.0
///
/// The client only ever emits [`RequestId::Number`], but inbound calls and
/// responses may carry either shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// String form used as the correlation-table key
    ///
    /// `1` and `"1"` map to the same key, matching peers that echo numeric ids
    /// back as strings.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

// ============================================================================
// Message envelope
// ============================================================================

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    /// Error code
    pub code: i32,

    /// Error message
    pub message: String,

    /// Optional additional data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any JSON-RPC 2.0 message read from or written to the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    /// Protocol version token, `"2.0"` for everything this crate emits
    #[serde(default)]
    pub jsonrpc: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

/// Routing class of an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `id` and `method`: a call the peer expects us to answer
    Request,
    /// `id` only: an answer to something we sent
    Response,
    /// `method` only: one-way message
    Notification,
    /// Neither `id` nor `method`
    Malformed,
}

impl JsonRpcMessage {
    /// Build an outbound request
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// Build an outbound notification
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// Classify the message by presence of `id` and `method`
    pub fn kind(&self) -> MessageKind {
        match (&self.id, &self.method) {
            (Some(_), Some(_)) => MessageKind::Request,
            (Some(_), None) => MessageKind::Response,
            (None, Some(_)) => MessageKind::Notification,
            (None, None) => MessageKind::Malformed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classification() {
        let request: JsonRpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": "x", "method": "a/b"})).unwrap();
        assert_eq!(request.kind(), MessageKind::Request);

        let response: JsonRpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 3, "result": {}})).unwrap();
        assert_eq!(response.kind(), MessageKind::Response);

        let notification: JsonRpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "method": "session/update"}))
                .unwrap();
        assert_eq!(notification.kind(), MessageKind::Notification);

        let neither: JsonRpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "result": 1})).unwrap();
        assert_eq!(neither.kind(), MessageKind::Malformed);
    }

    #[test]
    fn test_request_id_shapes() {
        let numeric: RequestId = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(numeric, RequestId::Number(42));
        assert_eq!(numeric.key(), "42");

        let text: RequestId = serde_json::from_value(json!("req-7")).unwrap();
        assert_eq!(text, RequestId::String("req-7".to_string()));
        assert_eq!(text.key(), "req-7");

        // Keys collapse the two shapes onto one string form
        assert_eq!(RequestId::from(5).key(), RequestId::from("5").key());
    }

    #[test]
    fn test_notification_has_no_id_on_the_wire() {
        let message = JsonRpcMessage::notification("session/cancel", Some(json!({"sessionId": "s"})));
        let wire = serde_json::to_value(&message).unwrap();

        assert_eq!(
            wire,
            json!({"jsonrpc": "2.0", "method": "session/cancel", "params": {"sessionId": "s"}})
        );
    }

    #[test]
    fn test_error_object_data_is_optional() {
        let message: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "nope"}
        }))
        .unwrap();

        let error = message.error.unwrap();
        assert_eq!(error.code, -32601);
        assert!(error.data.is_none());
    }
}
