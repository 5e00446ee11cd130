//! Clients of the bridge gateway.
//!
//! Both roles a peer can play are covered:
//!
//! - **Control plane** - [`BridgeClient`] discovers stores, subscribes, and
//!   issues mutations over JSON-RPC. State changes arrive on a [`Subscription`].
//! - **Host** - [`HostStore`] owns a store's state and version counter;
//!   [`HostClient`] runs it against a gateway.
//!
//! # Module Organization
//!
//! ```text
//! client/
//! ├── rpc          - BridgeClient and request correlation
//! ├── host         - HostStore, Reducer, HostClient
//! ├── subscription - stream of state-change notifications
//! ├── config       - client configuration
//! └── utils        - backoff, url validation, store ids
//! ```
//!
//! # Examples
//!
//! ```
//! use store_bridge::client::{exponential_backoff, ClientConfig};
//! use std::time::Duration;
//!
//! let config = ClientConfig {
//!     max_retries: 5,
//!     ..Default::default()
//! };
//! assert_eq!(config.request_timeout(), Duration::from_secs(10));
//! assert_eq!(exponential_backoff(2, 100), Duration::from_millis(400));
//! ```

mod config;
mod host;
mod rpc;
mod subscription;
mod utils;

pub use config::ClientConfig;
pub use host::{ApplyOutcome, HostClient, HostStore, Reducer, DEFAULT_STORE_KEY, HOST_SOURCE};
pub use rpc::BridgeClient;
pub use subscription::Subscription;
pub use utils::*;
