//! Wire protocols spoken over the gateway's WebSocket.
//!
//! Two protocols share one transport:
//!
//! - **[host]** - `{type, payload}` envelopes between a state-owning page and the gateway
//! - **[rpc]** - JSON-RPC 2.0 style requests, responses and notifications for subscribers
//!
//! A single connection may speak either (or, in principle, both). The gateway
//! tells them apart per message with [`InboundFrame::parse`]: objects with a
//! `type` field are host messages, objects with a `method` field are
//! control-plane requests.

pub mod host;
pub mod rpc;

use crate::error::{BridgeError, Result};
use serde_json::Value;

pub use host::{GatewayCommand, HostMessage};
pub use rpc::{RpcNotification, RpcRequest, RpcResponse, ServerFrame};

/// Protocol constants.
pub mod constants {
    /// JSON-RPC version tag.
    pub const JSONRPC_VERSION: &str = "2.0";

    /// Default WebSocket path of the gateway.
    pub const DEFAULT_WS_PATH: &str = "/_bridge";

    /// Mount point of the REST facade.
    pub const REST_PREFIX: &str = "/api/bridge";

    /// Host-sync envelope types.
    pub mod host_types {
        /// Host registers a store
        pub const REGISTER: &str = "store.register";
        /// Host state advanced
        pub const STATE_CHANGED: &str = "store.stateChanged";
        /// Host liveness ping
        pub const HEARTBEAT: &str = "store.heartbeat";
        /// Host leaves voluntarily
        pub const DISCONNECT: &str = "store.disconnect";
        /// Gateway replaces host state
        pub const CLIENT_SET_STATE: &str = "client.setState";
        /// Gateway forwards an action
        pub const CLIENT_DISPATCH: &str = "client.dispatch";
        /// Gateway liveness ping
        pub const CLIENT_PING: &str = "client.ping";
    }

    /// Control-plane method names.
    pub mod methods {
        /// Resolve `(pageId, storeKey)` to a store id
        pub const PAGE_RESOLVE: &str = "page.resolve";
        /// List stores under a page
        pub const PAGE_LIST_STORES: &str = "page.listStores";
        /// List every registered store
        pub const STORE_LIST: &str = "store.list";
        /// Store metadata
        pub const STORE_GET: &str = "store.get";
        /// Subscribe to a store's change feed
        pub const SUBSCRIBE: &str = "store.subscribe";
        /// Leave a store's change feed
        pub const UNSUBSCRIBE: &str = "store.unsubscribe";
        /// Cached state and version
        pub const GET_STATE: &str = "store.getState";
        /// Forward an action to the host
        pub const DISPATCH: &str = "store.dispatch";
        /// Forward a state replacement to the host
        pub const SET_STATE: &str = "store.setState";
        /// Notification pushed to subscribers
        pub const STATE_CHANGED: &str = "store.stateChanged";
    }
}

/// A message received by the gateway, classified by protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Host-sync envelope
    Host(HostMessage),
    /// Control-plane request or client notification
    Rpc(RpcRequest),
}

impl InboundFrame {
    /// Parse and classify one text frame.
    ///
    /// An RPC request that carries an id but cannot be decoded is reported
    /// together with the recovered id, so the caller can still answer it.
    pub fn parse(text: &str) -> std::result::Result<Self, (Option<crate::types::RpcId>, BridgeError)> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| (None, BridgeError::MalformedMessage(format!("invalid JSON: {}", e))))?;

        if !value.is_object() {
            return Err((None, BridgeError::MalformedMessage("expected a JSON object".into())));
        }

        if value.get("type").is_some() {
            return HostMessage::from_value(value)
                .map(InboundFrame::Host)
                .map_err(|e| (None, e));
        }

        if value.get("method").is_some() {
            let id = value
                .get("id")
                .cloned()
                .and_then(|id| serde_json::from_value(id).ok());
            return serde_json::from_value::<RpcRequest>(value)
                .map(InboundFrame::Rpc)
                .map_err(|e| match id {
                    Some(id) => (Some(id), BridgeError::InvalidRequest(e.to_string())),
                    None => (None, BridgeError::MalformedMessage(format!("request: {}", e))),
                });
        }

        Err((
            None,
            BridgeError::MalformedMessage("message has neither 'type' nor 'method'".into()),
        ))
    }
}

/// Serialize any outbound message to a text frame.
pub fn encode<T: serde::Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}
