//! Utility functions for the bridge clients.

use super::config::ClientConfig;
use crate::error::{BridgeError, Result};
use crate::types::{PageId, StoreId};
use std::time::Duration;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::warn;
use url::Url;

/// Client side of a gateway WebSocket.
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Default gateway endpoint.
pub const DEFAULT_GATEWAY_URL: &str = "ws://localhost:8787/_bridge";

/// Exponential backoff delay calculation
pub fn exponential_backoff(attempt: u32, base_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2_u64.pow(attempt.min(10)));
    Duration::from_millis(delay_ms)
}

/// Check that `url` is a `ws://` or `wss://` URL.
pub fn validate_gateway_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| BridgeError::Config(format!("invalid gateway url '{}': {}", url, e)))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(BridgeError::Config(format!(
            "gateway url must use ws:// or wss://, got {}://",
            other
        ))),
    }
}

/// Generate a store id of the form `pageId#xxxxxxxx`.
pub fn generate_store_id(page_id: &str) -> StoreId {
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{}#{}", page_id, suffix)
}

/// Page part of a store id, if it has one.
pub fn page_of(store_id: &str) -> Option<PageId> {
    store_id.split_once('#').map(|(page, _)| page.to_string())
}

/// Open a WebSocket to the gateway, retrying with exponential backoff.
pub async fn connect_with_retries(url: &str, config: &ClientConfig) -> Result<WsStream> {
    let url = validate_gateway_url(url)?;
    let mut attempt = 0;
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _response)) => return Ok(ws),
            Err(e) if attempt < config.max_retries => {
                let delay = exponential_backoff(attempt, config.retry_delay_ms);
                warn!(
                    "Connect failed (attempt {}), retrying after {:?}: {}",
                    attempt + 1,
                    delay,
                    e
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
