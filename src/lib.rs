#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! # Store Bridge: live store state over WebSocket
//!
//! A gateway that relays the client-side store state of web pages to external
//! controllers, and carries mutations back.
//!
//! ## Overview
//!
//! Three kinds of peers meet at the gateway:
//!
//! 1. **Hosts** - pages that own a store's state. They register the store,
//!    push every change, and apply commands sent by the gateway.
//! 2. **Subscribers** - control-plane clients that discover stores, subscribe
//!    to their changes, and request mutations over JSON-RPC.
//! 3. **REST callers** - the same read/mutate operations over plain HTTP.
//!
//! A mutation requested by a subscriber is forwarded to the owning host,
//! tagged with a forward id. The host applies it and echoes the id in the
//! resulting `store.stateChanged`, which resolves the original request. Host
//! disconnects fail outstanding forwards immediately; silent hosts time out.
//!
//! ## Server Usage
//!
//! ```ignore
//! use store_bridge::server::{serve, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> store_bridge::Result<()> {
//!     serve(GatewayConfig::default()).await
//! }
//! ```
//!
//! ## Client Usage
//!
//! ```ignore
//! use store_bridge::client::BridgeClient;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> store_bridge::Result<()> {
//!     let client = BridgeClient::connect("ws://localhost:8787/_bridge").await?;
//!     let mut changes = client.notifications().expect("notifications taken once");
//!
//!     let store_id = client.resolve("demo", Some("main")).await?;
//!     client.subscribe(&store_id).await?;
//!     client.dispatch(&store_id, json!({"type": "counter.add", "payload": {"n": 5}})).await?;
//!
//!     if let Some(change) = changes.next().await {
//!         println!("v{}: {}", change.version, change.state);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Host Usage
//!
//! ```ignore
//! use store_bridge::client::{ClientConfig, HostClient, HostStore};
//! use serde_json::{json, Value};
//!
//! let store = HostStore::new("demo", json!({"count": 0})).with_reducer(
//!     |state: &Value, action: &Value| match action["type"].as_str()? {
//!         "counter.add" => Some(json!({"count": state["count"].as_i64()? + action["payload"]["n"].as_i64()?})),
//!         _ => None,
//!     },
//! );
//! let host = HostClient::connect("ws://localhost:8787/_bridge", store, ClientConfig::default()).await?;
//! ```
//!
//! ## Module Structure
//!
//! - **[types]** - Identifiers and store metadata
//! - **[error]** - Error types and result handling
//! - **[protocol]** - Host-sync envelopes and control-plane JSON-RPC messages
//! - **[server]** - The gateway: registry, forwarding, WebSocket and REST
//! - **[client]** - Control-plane and host clients

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod types;

pub use client::{BridgeClient, ClientConfig, HostClient, HostStore};
pub use error::{BridgeError, Result};
pub use server::{Gateway, GatewayConfig};
pub use types::{ConnId, PageId, RpcId, StoreId, StoreInfo, StoreKey, StoreSnapshot, StoreSummary};
