//! Host side of the sync protocol.
//!
//! A host owns the authoritative state of one store. [`HostStore`] is the
//! transport-free state machine: it keeps the version counter, applies
//! gateway commands, and produces the `store.stateChanged` messages the
//! gateway expects. [`HostClient`] runs a `HostStore` over a WebSocket,
//! registering on connect and sending heartbeats.
//!
//! Every change, local or forwarded, bumps the version by exactly one. A
//! change caused by a forwarded command echoes the command's `forwardId`.

use super::config::ClientConfig;
use super::utils::{connect_with_retries, generate_store_id};
use crate::error::{BridgeError, Result};
use crate::protocol::host::{
    DispatchPayload, HostMessage, RegisterPayload, SetStatePayload, StateChangedPayload,
};
use crate::protocol::{encode, GatewayCommand};
use crate::types::{PageId, StoreDescription, StoreId, StoreKey};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Default store key within a page.
pub const DEFAULT_STORE_KEY: &str = "main";

/// `source` tag on changes emitted by this host.
pub const HOST_SOURCE: &str = "host";

/// Applies actions to a store's state.
///
/// Returning `None` means the action is not understood; the state is left
/// untouched and nothing is emitted.
pub trait Reducer: Send + Sync + 'static {
    /// Compute the state after `action`.
    fn reduce(&self, state: &Value, action: &Value) -> Option<Value>;
}

impl<F> Reducer for F
where
    F: Fn(&Value, &Value) -> Option<Value> + Send + Sync + 'static,
{
    fn reduce(&self, state: &Value, action: &Value) -> Option<Value> {
        self(state, action)
    }
}

/// Result of applying a gateway command to a [`HostStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// State changed; send this `store.stateChanged` to the gateway
    Changed(HostMessage),
    /// `client.setState` carried a stale `expectedVersion` and was dropped
    VersionConflict {
        /// Version the sender expected
        expected: u64,
        /// Version the host is at
        local: u64,
    },
    /// Nothing to do (ping, or an action the reducer does not handle)
    Ignored,
}

/// Host-side state machine for one store.
pub struct HostStore {
    store_id: StoreId,
    page_id: PageId,
    store_key: StoreKey,
    description: Option<StoreDescription>,
    state: Value,
    version: u64,
    reducer: Option<Box<dyn Reducer>>,
}

impl HostStore {
    /// Create a store for `page_id` with a freshly generated store id.
    pub fn new(page_id: impl Into<PageId>, initial_state: Value) -> Self {
        let page_id = page_id.into();
        Self {
            store_id: generate_store_id(&page_id),
            page_id,
            store_key: DEFAULT_STORE_KEY.to_string(),
            description: None,
            state: initial_state,
            version: 0,
            reducer: None,
        }
    }

    /// Use a fixed store id instead of a generated one.
    pub fn with_store_id(mut self, store_id: impl Into<StoreId>) -> Self {
        self.store_id = store_id.into();
        self
    }

    /// Set the store key (default `main`).
    pub fn with_store_key(mut self, store_key: impl Into<StoreKey>) -> Self {
        self.store_key = store_key.into();
        self
    }

    /// Publish a description at registration.
    pub fn with_description(mut self, description: StoreDescription) -> Self {
        self.description = Some(description);
        self
    }

    /// Install the reducer used for `client.dispatch`.
    pub fn with_reducer(mut self, reducer: impl Reducer) -> Self {
        self.reducer = Some(Box::new(reducer));
        self
    }

    /// Store identity.
    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    /// Current state.
    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Current version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The `store.register` message for this store.
    pub fn register_message(&self) -> HostMessage {
        let description = self.description.clone().unwrap_or_else(|| StoreDescription {
            page_id: Some(self.page_id.clone()),
            store_key: Some(self.store_key.clone()),
            ..Default::default()
        });
        HostMessage::Register(RegisterPayload {
            store_id: self.store_id.clone(),
            page_id: self.page_id.clone(),
            store_key: Some(self.store_key.clone()),
            description: Some(description),
            initial_state: self.state.clone(),
        })
    }

    /// Replace the state locally and return the change to report.
    pub fn set_local(&mut self, state: Value) -> HostMessage {
        self.commit(state, None)
    }

    /// Run `action` through the reducer locally.
    pub fn dispatch_local(&mut self, action: &Value) -> Option<HostMessage> {
        let next = self.reduce(action)?;
        Some(self.commit(next, None))
    }

    /// Apply a command received from the gateway.
    pub fn apply(&mut self, command: GatewayCommand) -> ApplyOutcome {
        match command {
            GatewayCommand::SetState(SetStatePayload {
                state,
                expected_version,
                forward_id,
            }) => {
                if let Some(expected) = expected_version {
                    if expected != self.version {
                        warn!(
                            store_id = %self.store_id,
                            expected,
                            local = self.version,
                            "version mismatch, ignoring setState"
                        );
                        return ApplyOutcome::VersionConflict {
                            expected,
                            local: self.version,
                        };
                    }
                }
                ApplyOutcome::Changed(self.commit(state, forward_id))
            }
            GatewayCommand::Dispatch(DispatchPayload { action, forward_id }) => {
                match self.reduce(&action) {
                    Some(next) => ApplyOutcome::Changed(self.commit(next, forward_id)),
                    None => {
                        warn!(store_id = %self.store_id, ?action, "action not handled");
                        ApplyOutcome::Ignored
                    }
                }
            }
            GatewayCommand::Ping => ApplyOutcome::Ignored,
        }
    }

    fn reduce(&self, action: &Value) -> Option<Value> {
        self.reducer.as_ref()?.reduce(&self.state, action)
    }

    fn commit(&mut self, state: Value, forward_id: Option<u64>) -> HostMessage {
        self.state = state;
        self.version += 1;
        HostMessage::StateChanged(StateChangedPayload {
            store_id: self.store_id.clone(),
            state: self.state.clone(),
            version: self.version,
            source: Some(HOST_SOURCE.to_string()),
            forward_id,
        })
    }
}

/// A [`HostStore`] connected to a gateway.
pub struct HostClient {
    store: Arc<Mutex<HostStore>>,
    outbound: mpsc::Sender<Message>,
    task: JoinHandle<()>,
}

impl HostClient {
    /// Connect, register `store`, and start serving gateway commands.
    pub async fn connect(url: &str, store: HostStore, config: ClientConfig) -> Result<Self> {
        let ws = connect_with_retries(url, &config).await?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        ws_tx
            .send(Message::Text(encode(&store.register_message())?.into()))
            .await?;
        info!(store_id = %store.store_id(), "host registered");

        let store = Arc::new(Mutex::new(store));
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(64);
        let heartbeat_every = config.heartbeat_interval();
        let heartbeat = encode(&HostMessage::Heartbeat)?;

        let task = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut heartbeat_timer = heartbeat_every.map(|every| {
                    tokio::time::interval_at(tokio::time::Instant::now() + every, every)
                });
                loop {
                    let frame = tokio::select! {
                        msg = ws_rx.next() => match msg {
                            Some(Ok(Message::Text(text))) => match handle_command(&store, text.as_str()) {
                                Some(reply) => Message::Text(reply.into()),
                                None => continue,
                            },
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                debug!("host receive failed: {}", e);
                                break;
                            }
                        },
                        out = outbound_rx.recv() => match out {
                            Some(message) => message,
                            None => break,
                        },
                        _ = async {
                            match heartbeat_timer.as_mut() {
                                Some(timer) => { timer.tick().await; }
                                None => std::future::pending::<()>().await,
                            }
                        } => Message::Text(heartbeat.clone().into()),
                    };
                    let closing = matches!(frame, Message::Close(_));
                    if let Err(e) = ws_tx.send(frame).await {
                        debug!("host send failed: {}", e);
                        break;
                    }
                    if closing {
                        break;
                    }
                }
            })
        };

        Ok(Self {
            store,
            outbound,
            task,
        })
    }

    /// Store identity.
    pub fn store_id(&self) -> StoreId {
        self.store.lock().store_id().to_string()
    }

    /// Current state and version.
    pub fn snapshot(&self) -> (Value, u64) {
        let store = self.store.lock();
        (store.state().clone(), store.version())
    }

    /// Change the state locally and report it.
    pub async fn set_state(&self, state: Value) -> Result<()> {
        let message = self.store.lock().set_local(state);
        self.send(&message).await
    }

    /// Run an action locally and report the change, if any.
    pub async fn dispatch(&self, action: &Value) -> Result<bool> {
        let message = self.store.lock().dispatch_local(action);
        match message {
            Some(message) => self.send(&message).await.map(|_| true),
            None => Ok(false),
        }
    }

    async fn send(&self, message: &HostMessage) -> Result<()> {
        let frame = encode(message)?;
        self.outbound
            .send(Message::Text(frame.into()))
            .await
            .map_err(|_| BridgeError::ConnectionClosed)
    }

    /// Leave voluntarily: send `store.disconnect` and close the socket.
    pub async fn disconnect(self) -> Result<()> {
        self.send(&HostMessage::Disconnect).await?;
        let _ = self.outbound.send(Message::Close(None)).await;
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), self.task).await;
        Ok(())
    }
}

fn handle_command(store: &Mutex<HostStore>, text: &str) -> Option<String> {
    let command = serde_json::from_str(text)
        .map_err(BridgeError::from)
        .and_then(GatewayCommand::from_value);
    let command = match command {
        Ok(command) => command,
        Err(e) => {
            warn!("ignoring gateway message: {}", e);
            return None;
        }
    };
    match store.lock().apply(command) {
        ApplyOutcome::Changed(message) => match encode(&message) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("failed to encode state change: {}", e);
                None
            }
        },
        ApplyOutcome::VersionConflict { .. } | ApplyOutcome::Ignored => None,
    }
}
