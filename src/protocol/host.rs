//! Host-sync protocol: the envelope spoken between a state-owning page and the gateway.
//!
//! Every message is a type-tagged JSON object:
//!
//! ```text
//! { "type": "store.stateChanged", "payload": { "storeId": "...", "state": {...}, "version": 3 } }
//! ```
//!
//! | Direction | Type | Effect |
//! |-----------|------|--------|
//! | host → gateway | `store.register` | install host, seed `(initialState, 0)` |
//! | host → gateway | `store.stateChanged` | update cache, fan out to subscribers |
//! | host → gateway | `store.heartbeat` | liveness only |
//! | host → gateway | `store.disconnect` | voluntary teardown |
//! | gateway → host | `client.setState` | replace state unless `expectedVersion` is stale |
//! | gateway → host | `client.dispatch` | run an action through the host's reducer |
//! | gateway → host | `client.ping` | liveness only |
//!
//! `payload` may be omitted for the payload-less types. Decoding goes through
//! [`Envelope`] so that a bad payload is reported as a
//! [`BridgeError::MalformedMessage`] naming the offending type.

use crate::error::{BridgeError, Result};
use crate::protocol::constants::host_types;
use crate::types::{PageId, StoreDescription, StoreId, StoreKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw `{type, payload}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message discriminator
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific body; `null` when absent
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Decode the payload into `T`, reporting failures against this envelope's type.
    fn payload<T: DeserializeOwned>(self) -> Result<T> {
        let kind = self.kind;
        serde_json::from_value(self.payload)
            .map_err(|e| BridgeError::MalformedMessage(format!("{}: {}", kind, e)))
    }
}

/// `store.register` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    /// Store identity chosen by the host
    pub store_id: StoreId,
    /// Page the store lives on
    pub page_id: PageId,
    /// Optional store key within the page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_key: Option<StoreKey>,
    /// Optional self-description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<StoreDescription>,
    /// State at registration time
    #[serde(default)]
    pub initial_state: Value,
}

/// `store.stateChanged` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangedPayload {
    /// Store whose state changed
    pub store_id: StoreId,
    /// New state
    pub state: Value,
    /// Host's counter after the change
    pub version: u64,
    /// Free-form origin tag (`"host"`, `"browser"`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Forward this change answers, when it results from a forwarded command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_id: Option<u64>,
}

/// Messages a host sends to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum HostMessage {
    /// Install this connection as the host of a store
    #[serde(rename = "store.register")]
    Register(RegisterPayload),
    /// The host's state advanced
    #[serde(rename = "store.stateChanged")]
    StateChanged(StateChangedPayload),
    /// Liveness ping
    #[serde(rename = "store.heartbeat")]
    Heartbeat,
    /// Voluntary teardown
    #[serde(rename = "store.disconnect")]
    Disconnect,
}

impl HostMessage {
    /// Decode a host message from an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| BridgeError::MalformedMessage(format!("host envelope: {}", e)))?;
        match envelope.kind.as_str() {
            host_types::REGISTER => Ok(HostMessage::Register(envelope.payload()?)),
            host_types::STATE_CHANGED => Ok(HostMessage::StateChanged(envelope.payload()?)),
            host_types::HEARTBEAT => Ok(HostMessage::Heartbeat),
            host_types::DISCONNECT => Ok(HostMessage::Disconnect),
            other => Err(BridgeError::MalformedMessage(format!(
                "unknown host message type '{}'",
                other
            ))),
        }
    }

    /// Envelope type tag.
    pub fn kind(&self) -> &'static str {
        match self {
            HostMessage::Register(_) => host_types::REGISTER,
            HostMessage::StateChanged(_) => host_types::STATE_CHANGED,
            HostMessage::Heartbeat => host_types::HEARTBEAT,
            HostMessage::Disconnect => host_types::DISCONNECT,
        }
    }
}

/// `client.setState` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetStatePayload {
    /// Replacement state
    pub state: Value,
    /// Apply only if the host's local version equals this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
    /// Forward to echo in the resulting `store.stateChanged`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_id: Option<u64>,
}

/// `client.dispatch` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchPayload {
    /// Action object, conventionally `{type, payload}`
    pub action: Value,
    /// Forward to echo in the resulting `store.stateChanged`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_id: Option<u64>,
}

/// Commands the gateway sends to a host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum GatewayCommand {
    /// Replace the host's state
    #[serde(rename = "client.setState")]
    SetState(SetStatePayload),
    /// Run an action through the host's reducer
    #[serde(rename = "client.dispatch")]
    Dispatch(DispatchPayload),
    /// Liveness ping
    #[serde(rename = "client.ping")]
    Ping,
}

impl GatewayCommand {
    /// Decode a gateway command from an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| BridgeError::MalformedMessage(format!("gateway envelope: {}", e)))?;
        match envelope.kind.as_str() {
            host_types::CLIENT_SET_STATE => Ok(GatewayCommand::SetState(envelope.payload()?)),
            host_types::CLIENT_DISPATCH => Ok(GatewayCommand::Dispatch(envelope.payload()?)),
            host_types::CLIENT_PING => Ok(GatewayCommand::Ping),
            other => Err(BridgeError::MalformedMessage(format!(
                "unknown gateway command type '{}'",
                other
            ))),
        }
    }

    /// Forward id carried by this command, if any.
    pub fn forward_id(&self) -> Option<u64> {
        match self {
            GatewayCommand::SetState(p) => p.forward_id,
            GatewayCommand::Dispatch(p) => p.forward_id,
            GatewayCommand::Ping => None,
        }
    }
}
