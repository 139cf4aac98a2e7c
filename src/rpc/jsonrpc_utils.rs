//! JSON-RPC 2.0 protocol utilities
//!
//! Provides constants, error codes and response builders for the JSON-RPC 2.0
//! protocol as per https://www.jsonrpc.org/specification, plus the codes the
//! Agent Client Protocol reserves on top of it.

use crate::rpc::message::{JsonRpcErrorObject, JsonRpcMessage, RequestId};
use serde_json::Value;

// ============================================================================
// JSON-RPC 2.0 Constants
// ============================================================================

/// JSON-RPC 2.0 version identifier
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 Error Codes (as per JSON-RPC specification)
/// https://www.jsonrpc.org/specification#error_object
pub mod error_codes {
    /// Parse error - Invalid JSON was received by the server.
    pub const PARSE_ERROR: i32 = -32700;

    /// Invalid Request - The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;

    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;

    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;

    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;

    /// Server error range start - Reserved for implementation-defined server-errors.
    pub const SERVER_ERROR_START: i32 = -32099;

    /// Server error range end - Reserved for implementation-defined server-errors.
    pub const SERVER_ERROR_END: i32 = -32000;

    /// ACP: the agent requires authentication before this call.
    pub const AUTH_REQUIRED: i32 = -32000;

    /// ACP: the referenced resource (file, session, ...) does not exist.
    pub const RESOURCE_NOT_FOUND: i32 = -32002;
}

/// Known error codes, for matching on responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum JsonRpcErrorCode {
    ParseError = error_codes::PARSE_ERROR,
    InvalidRequest = error_codes::INVALID_REQUEST,
    MethodNotFound = error_codes::METHOD_NOT_FOUND,
    InvalidParams = error_codes::INVALID_PARAMS,
    InternalError = error_codes::INTERNAL_ERROR,
    AuthRequired = error_codes::AUTH_REQUIRED,
    ResourceNotFound = error_codes::RESOURCE_NOT_FOUND,
}

impl JsonRpcErrorCode {
    /// Map a raw code onto a known variant
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            error_codes::PARSE_ERROR => Some(Self::ParseError),
            error_codes::INVALID_REQUEST => Some(Self::InvalidRequest),
            error_codes::METHOD_NOT_FOUND => Some(Self::MethodNotFound),
            error_codes::INVALID_PARAMS => Some(Self::InvalidParams),
            error_codes::INTERNAL_ERROR => Some(Self::InternalError),
            error_codes::AUTH_REQUIRED => Some(Self::AuthRequired),
            error_codes::RESOURCE_NOT_FOUND => Some(Self::ResourceNotFound),
            _ => None,
        }
    }

    /// Check if the given code is in the server error range (-32099 to -32000)
    pub fn is_server_error(code: i32) -> bool {
        (error_codes::SERVER_ERROR_START..=error_codes::SERVER_ERROR_END).contains(&code)
    }
}

// ============================================================================
// JSON-RPC Response Builders
// ============================================================================

/// Create a successful JSON-RPC response
pub fn success_response(id: RequestId, result: Value) -> JsonRpcMessage {
    JsonRpcMessage {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id: Some(id),
        method: None,
        params: None,
        result: Some(result),
        error: None,
    }
}

/// Create a JSON-RPC error response
pub fn error_response(
    id: RequestId,
    code: i32,
    message: String,
    data: Option<Value>,
) -> JsonRpcMessage {
    error_object_response(
        id,
        JsonRpcErrorObject {
            code,
            message,
            data,
        },
    )
}

/// Create a JSON-RPC error response from an existing error object
pub fn error_object_response(id: RequestId, error: JsonRpcErrorObject) -> JsonRpcMessage {
    JsonRpcMessage {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id: Some(id),
        method: None,
        params: None,
        result: None,
        error: Some(error),
    }
}

/// Create a "method not found" error response
pub fn method_not_found_response(id: RequestId, method: &str) -> JsonRpcMessage {
    error_response(
        id,
        error_codes::METHOD_NOT_FOUND,
        format!("Method not found: {method}"),
        None,
    )
}
