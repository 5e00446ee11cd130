//! Error types for the store bridge.
//!
//! A single [`BridgeError`] enum covers both protocols and both sides of the
//! gateway. Every variant maps onto a JSON-RPC error code (for control-plane
//! responses) and an HTTP status (for the REST facade), so callers never have
//! to translate between error taxonomies by hand.
//!
//! Version conflicts are intentionally absent: a host that receives a
//! `client.setState` with a stale `expectedVersion` drops it and logs, it
//! does not produce an error. See [`crate::client::ApplyOutcome`].

use crate::protocol::rpc::codes;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors produced by the gateway, the control-plane client, and the host client.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No host is registered for the target store id.
    #[error("store not found: {0}")]
    StoreNotFound(String),

    /// Neither `(pageId, storeKey)` nor the page's store list yielded a store.
    #[error("no store resolved for page {page_id} (storeKey: {store_key:?})")]
    ResolveFailed {
        /// Page that was queried
        page_id: String,
        /// Store key that was queried, if any
        store_key: Option<String>,
    },

    /// The host did not answer a forwarded command before its deadline.
    #[error("forward {0} timed out waiting for the host")]
    ForwardTimeout(u64),

    /// The host owning the target store went away while the forward was pending.
    #[error("host for store {0} disconnected")]
    HostDisconnected(String),

    /// An envelope failed structural validation.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A control-plane request object was not well formed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Control-plane method is not known to the gateway.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Control-plane params did not match the method's shape.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Error response received from the gateway by a control-plane client.
    #[error("gateway error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// Human readable message
        message: String,
    },

    /// A control-plane client gave up waiting for a response.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Method that was called
        method: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// The transport closed before a reply arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// WebSocket transport failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O failure (bind, accept).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// JSON-RPC error code reported to control-plane callers.
    pub fn rpc_code(&self) -> i64 {
        match self {
            BridgeError::StoreNotFound(_) => codes::STORE_NOT_FOUND,
            BridgeError::ResolveFailed { .. } => codes::RESOLVE_FAILED,
            BridgeError::ForwardTimeout(_) => codes::FORWARD_TIMEOUT,
            BridgeError::HostDisconnected(_) => codes::HOST_DISCONNECTED,
            BridgeError::MalformedMessage(_) | BridgeError::Json(_) => codes::PARSE_ERROR,
            BridgeError::InvalidRequest(_) => codes::INVALID_REQUEST,
            BridgeError::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            BridgeError::InvalidParams(_) => codes::INVALID_PARAMS,
            BridgeError::Rpc { code, .. } => *code,
            _ => codes::INTERNAL_ERROR,
        }
    }

    /// HTTP status code reported by the REST facade.
    pub fn http_status(&self) -> u16 {
        match self {
            BridgeError::StoreNotFound(_) | BridgeError::ResolveFailed { .. } => 404,
            BridgeError::MalformedMessage(_)
            | BridgeError::InvalidRequest(_)
            | BridgeError::InvalidParams(_)
            | BridgeError::Json(_) => 400,
            BridgeError::Rpc { code, .. }
                if *code == codes::STORE_NOT_FOUND || *code == codes::RESOLVE_FAILED =>
            {
                404
            }
            _ => 500,
        }
    }

    /// Whether the error means "nothing is registered under that name".
    pub fn is_not_found(&self) -> bool {
        self.http_status() == 404
    }

    /// Rebuild an error from a control-plane error response.
    pub fn from_rpc(code: i64, message: impl Into<String>) -> Self {
        BridgeError::Rpc {
            code,
            message: message.into(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::WebSocket(err.to_string())
    }
}
