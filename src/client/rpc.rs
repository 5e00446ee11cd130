//! Control-plane client.
//!
//! [`BridgeClient`] speaks the gateway's JSON-RPC protocol over a WebSocket.
//! Requests are correlated by a monotonically increasing numeric id; the
//! `store.stateChanged` notifications the gateway pushes are never matched
//! against pending requests and are routed to a [`Subscription`] instead.
//!
//! ```ignore
//! use store_bridge::client::BridgeClient;
//! use serde_json::json;
//!
//! let client = BridgeClient::connect("ws://localhost:8787/_bridge").await?;
//! let store_id = client.resolve("demo", Some("main")).await?;
//! client.dispatch(&store_id, json!({"type": "counter.add", "payload": {"n": 5}})).await?;
//! ```

use super::config::ClientConfig;
use super::subscription::Subscription;
use super::utils::connect_with_retries;
use crate::error::{BridgeError, Result};
use crate::protocol::constants::methods;
use crate::protocol::rpc::StateChangedParams;
use crate::protocol::{encode, RpcRequest, ServerFrame};
use crate::types::{RpcId, StoreId, StoreInfo, StoreSnapshot, StoreSummary};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

type PendingMap = Arc<Mutex<HashMap<RpcId, oneshot::Sender<Result<Value>>>>>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveResult {
    store_id: StoreId,
}

#[derive(Deserialize)]
struct StoresResult {
    stores: Vec<StoreSummary>,
}

/// A control-plane connection to the gateway.
pub struct BridgeClient {
    config: ClientConfig,
    outbound: mpsc::Sender<Message>,
    pending: PendingMap,
    next_id: AtomicI64,
    notifications: Mutex<Option<mpsc::Receiver<StateChangedParams>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeClient {
    /// Connect with the default configuration.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, ClientConfig::default()).await
    }

    /// Connect, retrying with exponential backoff per `config`.
    pub async fn connect_with_config(url: &str, config: ClientConfig) -> Result<Self> {
        let ws = connect_with_retries(url, &config).await?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(64);
        let (notify_tx, notify_rx) = mpsc::channel(config.notification_buffer.max(1));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = ws_tx.send(message).await {
                    debug!("control-plane send failed: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let reader = {
            let pending = pending.clone();
            tokio::spawn(async move {
                while let Some(message) = ws_rx.next().await {
                    match message {
                        Ok(Message::Text(text)) => route_frame(text.as_str(), &pending, &notify_tx),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!("control-plane receive failed: {}", e);
                            break;
                        }
                    }
                }
                // Dropping the senders fails every waiter with ConnectionClosed.
                pending.lock().clear();
            })
        };

        Ok(Self {
            config,
            outbound,
            pending,
            next_id: AtomicI64::new(1),
            notifications: Mutex::new(Some(notify_rx)),
            tasks: vec![writer, reader],
        })
    }

    /// Take the notification stream. Returns `None` after the first call.
    pub fn notifications(&self) -> Option<Subscription> {
        self.notifications.lock().take().map(Subscription::new)
    }

    /// Send a raw request and wait for its result.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = RpcId::Num(self.next_id.fetch_add(1, Ordering::Relaxed));
        let frame = encode(&RpcRequest::new(id.clone(), method, params))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        if self.outbound.send(Message::Text(frame.into())).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(BridgeError::ConnectionClosed);
        }

        match tokio::time::timeout(self.config.request_timeout(), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(BridgeError::RequestTimeout {
                    method: method.to_string(),
                    timeout_ms: self.config.request_timeout_ms,
                })
            }
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// `page.resolve`: find the store id for a page and optional key.
    pub async fn resolve(&self, page_id: &str, store_key: Option<&str>) -> Result<StoreId> {
        let mut params = json!({ "pageId": page_id });
        if let Some(key) = store_key {
            params["storeKey"] = json!(key);
        }
        let result: ResolveResult = self.call(methods::PAGE_RESOLVE, params).await?;
        Ok(result.store_id)
    }

    /// `page.listStores`
    pub async fn list_page_stores(&self, page_id: &str) -> Result<Vec<StoreSummary>> {
        let result: StoresResult = self
            .call(methods::PAGE_LIST_STORES, json!({ "pageId": page_id }))
            .await?;
        Ok(result.stores)
    }

    /// `store.list`
    pub async fn list_stores(&self) -> Result<Vec<StoreSummary>> {
        let result: StoresResult = self.call(methods::STORE_LIST, json!({})).await?;
        Ok(result.stores)
    }

    /// `store.get`
    pub async fn get_store(&self, store_id: &str) -> Result<StoreInfo> {
        self.call(methods::STORE_GET, json!({ "storeId": store_id })).await
    }

    /// `store.subscribe`
    pub async fn subscribe(&self, store_id: &str) -> Result<()> {
        self.request(methods::SUBSCRIBE, json!({ "storeId": store_id })).await?;
        Ok(())
    }

    /// `store.unsubscribe`
    pub async fn unsubscribe(&self, store_id: &str) -> Result<()> {
        self.request(methods::UNSUBSCRIBE, json!({ "storeId": store_id })).await?;
        Ok(())
    }

    /// `store.getState`
    pub async fn get_state(&self, store_id: &str) -> Result<StoreSnapshot> {
        self.call(methods::GET_STATE, json!({ "storeId": store_id })).await
    }

    /// `store.dispatch`: resolves once the host reports the resulting change.
    pub async fn dispatch(&self, store_id: &str, action: Value) -> Result<Value> {
        self.request(methods::DISPATCH, json!({ "storeId": store_id, "action": action }))
            .await
    }

    /// `store.setState`
    pub async fn set_state(
        &self,
        store_id: &str,
        state: Value,
        expected_version: Option<u64>,
    ) -> Result<Value> {
        let mut params = json!({ "storeId": store_id, "state": state });
        if let Some(version) = expected_version {
            params["expectedVersion"] = json!(version);
        }
        self.request(methods::SET_STATE, params).await
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Close the connection. Pending requests fail with `ConnectionClosed`.
    pub async fn close(mut self) {
        let _ = self.outbound.send(Message::Close(None)).await;
        let mut tasks = std::mem::take(&mut self.tasks);
        drop(self);
        // The writer exits once the outbound queue is dropped and drained.
        if let Some(writer) = tasks.first_mut() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
        }
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn route_frame(
    text: &str,
    pending: &PendingMap,
    notify: &mpsc::Sender<StateChangedParams>,
) {
    match ServerFrame::parse(text) {
        Ok(ServerFrame::Response(response)) => {
            let waiter = response.id.as_ref().and_then(|id| pending.lock().remove(id));
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response.into_result());
                }
                None => debug!("response for unknown request {:?}", response.id),
            }
        }
        Ok(ServerFrame::Notification(note)) if note.method == methods::STATE_CHANGED => {
            match serde_json::from_value::<StateChangedParams>(note.params) {
                Ok(change) => {
                    if notify.try_send(change).is_err() {
                        warn!("notification buffer full or closed, dropping state change");
                    }
                }
                Err(e) => warn!("malformed stateChanged notification: {}", e),
            }
        }
        Ok(ServerFrame::Notification(note)) => debug!("ignoring notification {}", note.method),
        Err(e) => warn!("ignoring malformed frame: {}", e),
    }
}
