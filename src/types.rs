//! Core data types shared by the gateway and its clients.
//!
//! Store identities are plain strings supplied by the host page; the gateway
//! never invents them. Connections, on the other hand, are identified by an
//! opaque [`ConnId`] handed out at accept time so that registry cleanup never
//! has to compare live transport objects.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Logical page identity, opaque to the gateway.
pub type PageId = String;

/// Name of a store within a page (e.g. `"main"`).
pub type StoreKey = String;

/// Globally unique store identity, `pageId#suffix`.
pub type StoreId = String;

/// Opaque identifier of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocate a fresh, process-unique connection id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value, for logging.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Caller-chosen JSON-RPC correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    /// Numeric id
    Num(i64),
    /// String id
    Str(String),
}

impl From<i64> for RpcId {
    fn from(n: i64) -> Self {
        RpcId::Num(n)
    }
}

impl From<&str> for RpcId {
    fn from(s: &str) -> Self {
        RpcId::Str(s.to_string())
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcId::Num(n) => write!(f, "{}", n),
            RpcId::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Self-description a host publishes at registration.
///
/// `schema`, `actions` and `events` are JSON Schema fragments produced by the
/// page; the gateway passes them through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDescription {
    /// Page the store lives on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_id: Option<PageId>,
    /// Store key within the page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_key: Option<StoreKey>,
    /// JSON Schema of the state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    /// Action name to `{description, payload}` schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Value>,
    /// Event name to `{description, payload}` schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Value>,
}

/// Row of a store listing (`page.listStores`, `store.list`, `GET /stores`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSummary {
    /// Store identity
    pub store_id: StoreId,
    /// Owning page
    pub page_id: PageId,
    /// Store key within the page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_key: Option<StoreKey>,
    /// Last cached version
    pub version: u64,
    /// Registration time, milliseconds since the Unix epoch
    pub connected_at: u64,
}

/// Full metadata of one store (`store.get`, `GET /stores/:id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreInfo {
    /// Store identity
    pub store_id: StoreId,
    /// Owning page
    pub page_id: PageId,
    /// Store key within the page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_key: Option<StoreKey>,
    /// Host-published description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<StoreDescription>,
    /// Last cached version
    pub version: u64,
    /// Registration time, milliseconds since the Unix epoch
    pub connected_at: u64,
    /// Last message from the host, milliseconds since the Unix epoch
    pub last_activity: u64,
}

/// Cached `(state, version)` of one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Store identity
    pub store_id: StoreId,
    /// Opaque state value
    pub state: Value,
    /// Host-owned version counter
    pub version: u64,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
