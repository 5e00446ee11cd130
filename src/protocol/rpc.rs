//! Control-plane protocol: JSON-RPC 2.0 style envelopes used by subscribers and CLI clients.
//!
//! Requests carry a caller-chosen `id`; each id receives exactly one response
//! holding either `result` or `error`. Messages without an `id` are
//! notifications. The only notification the gateway emits is
//! `store.stateChanged`, and it is never matched against pending requests.

use crate::error::{BridgeError, Result};
use crate::protocol::constants::{methods, JSONRPC_VERSION};
use crate::types::{PageId, RpcId, StoreId, StoreKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC error codes.
pub mod codes {
    /// Invalid JSON
    pub const PARSE_ERROR: i64 = -32700;
    /// Not a valid request object
    pub const INVALID_REQUEST: i64 = -32600;
    /// Unknown method
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Params do not match the method
    pub const INVALID_PARAMS: i64 = -32602;
    /// Gateway-internal failure
    pub const INTERNAL_ERROR: i64 = -32603;
    /// No host registered for the store
    pub const STORE_NOT_FOUND: i64 = -32001;
    /// Page/key resolution failed
    pub const RESOLVE_FAILED: i64 = -32002;
    /// Host did not answer a forward in time
    pub const FORWARD_TIMEOUT: i64 = -32003;
    /// Host vanished while a forward was pending
    pub const HOST_DISCONNECTED: i64 = -32004;
}

/// Control-plane request (or notification when `id` is absent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Always `"2.0"`
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    /// Correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RpcId>,
    /// Method name
    pub method: String,
    /// Method params
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_string()
}

impl RpcRequest {
    /// Build a request.
    pub fn new(id: impl Into<RpcId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    /// Decode `params` into a method-specific struct.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        let params = if self.params.is_null() {
            Value::Object(Default::default())
        } else {
            self.params.clone()
        };
        serde_json::from_value(params)
            .map_err(|e| BridgeError::InvalidParams(format!("{}: {}", self.method, e)))
    }
}

/// Error object inside a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// Error code (see [`codes`])
    pub code: i64,
    /// Human readable message
    pub message: String,
    /// Optional extra data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&BridgeError> for RpcErrorObject {
    fn from(err: &BridgeError) -> Self {
        let message = match err {
            BridgeError::Rpc { message, .. } => message.clone(),
            other => other.to_string(),
        };
        RpcErrorObject {
            code: err.rpc_code(),
            message,
            data: None,
        }
    }
}

/// Control-plane response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Always `"2.0"`
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    /// Id of the request being answered; `null` when the request could not be parsed
    pub id: Option<RpcId>,
    /// Success value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    /// Successful response.
    pub fn success(id: Option<RpcId>, result: Value) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response.
    pub fn failure(id: Option<RpcId>, err: &BridgeError) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id,
            result: None,
            error: Some(err.into()),
        }
    }

    /// Build from an operation outcome.
    pub fn from_result(id: Option<RpcId>, outcome: Result<Value>) -> Self {
        match outcome {
            Ok(value) => Self::success(id, value),
            Err(err) => Self::failure(id, &err),
        }
    }

    /// Convert back into an operation outcome (client side).
    pub fn into_result(self) -> Result<Value> {
        match (self.result, self.error) {
            (_, Some(err)) => Err(BridgeError::from_rpc(err.code, err.message)),
            (Some(value), None) => Ok(value),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Server-initiated notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNotification {
    /// Always `"2.0"`
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    /// Notification name
    pub method: String,
    /// Notification body
    #[serde(default)]
    pub params: Value,
}

impl RpcNotification {
    /// `store.stateChanged` notification for subscribers.
    pub fn state_changed(change: &StateChangedParams) -> Result<Self> {
        Ok(Self {
            jsonrpc: default_jsonrpc(),
            method: methods::STATE_CHANGED.to_string(),
            params: serde_json::to_value(change)?,
        })
    }
}

/// Params of the `store.stateChanged` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangedParams {
    /// Store that changed
    pub store_id: StoreId,
    /// Version after the change
    pub version: u64,
    /// State after the change
    pub state: Value,
}

/// `page.resolve` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveParams {
    /// Page to look under
    pub page_id: PageId,
    /// Store key; `None` resolves to the page's only store, if any
    #[serde(default)]
    pub store_key: Option<StoreKey>,
}

/// `page.listStores` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageParams {
    /// Page to list
    pub page_id: PageId,
}

/// Params of methods that only name a store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreParams {
    /// Target store
    pub store_id: StoreId,
}

/// `store.dispatch` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchParams {
    /// Target store
    pub store_id: StoreId,
    /// Action to run on the host
    pub action: Value,
}

/// `store.setState` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetStateParams {
    /// Target store
    pub store_id: StoreId,
    /// Replacement state
    pub state: Value,
    /// Optimistic-concurrency guard
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

/// Control-plane methods understood by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `page.resolve`
    PageResolve,
    /// `page.listStores`
    PageListStores,
    /// `store.list`
    StoreList,
    /// `store.get`
    StoreGet,
    /// `store.subscribe`
    Subscribe,
    /// `store.unsubscribe`
    Unsubscribe,
    /// `store.getState`
    GetState,
    /// `store.dispatch`
    Dispatch,
    /// `store.setState`
    SetState,
}

impl Method {
    /// Look up a method by wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            methods::PAGE_RESOLVE => Method::PageResolve,
            methods::PAGE_LIST_STORES => Method::PageListStores,
            methods::STORE_LIST => Method::StoreList,
            methods::STORE_GET => Method::StoreGet,
            methods::SUBSCRIBE => Method::Subscribe,
            methods::UNSUBSCRIBE => Method::Unsubscribe,
            methods::GET_STATE => Method::GetState,
            methods::DISPATCH => Method::Dispatch,
            methods::SET_STATE => Method::SetState,
            _ => return None,
        })
    }

    /// Whether the method is forwarded to the owning host.
    pub fn is_forwarded(self) -> bool {
        matches!(self, Method::Dispatch | Method::SetState)
    }
}

/// A frame received by a control-plane client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Answer to a request
    Response(RpcResponse),
    /// Unsolicited notification
    Notification(RpcNotification),
}

impl ServerFrame {
    /// Classify a frame: anything with a `method` and no `id` is a notification.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| BridgeError::MalformedMessage(format!("invalid JSON: {}", e)))?;
        let has_id = value.get("id").map(|id| !id.is_null()).unwrap_or(false);
        if value.get("method").is_some() && !has_id {
            let notification = serde_json::from_value(value)
                .map_err(|e| BridgeError::MalformedMessage(format!("notification: {}", e)))?;
            return Ok(ServerFrame::Notification(notification));
        }
        let response = serde_json::from_value(value)
            .map_err(|e| BridgeError::MalformedMessage(format!("response: {}", e)))?;
        Ok(ServerFrame::Response(response))
    }
}
