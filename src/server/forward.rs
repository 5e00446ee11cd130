//! Forwarding coordinator: turns control-plane mutations into host commands.
//!
//! # Algorithm
//!
//! 1. Look up the store's host. None registered: fail with `StoreNotFound`, record nothing.
//! 2. Allocate a forward id `F` and record `F -> (caller, request id, deadline)`.
//! 3. Send `client.dispatch` / `client.setState` tagged with `forwardId: F` to the host.
//! 4. Wait. The forward resolves when the host emits a `store.stateChanged`
//!    carrying `forwardId: F` (see [`crate::server::Gateway`]), fails with
//!    `HostDisconnected` when the host goes away, or expires with
//!    `ForwardTimeout` at its deadline.
//!
//! Untagged state changes never resolve a forward. A host that drops a
//! `client.setState` because of a stale `expectedVersion` emits nothing, so
//! that forward ends in a timeout.
//!
//! If the caller disconnects first, [`ConnectionRegistry::remove_connection`]
//! drops the pending entry and the waiting future ends with
//! `ConnectionClosed`; nothing is sent back.

use super::registry::{ConnectionRegistry, PendingForward};
use crate::error::{BridgeError, Result};
use crate::protocol::encode;
use crate::protocol::host::{DispatchPayload, GatewayCommand, SetStatePayload};
use crate::types::{ConnId, RpcId};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A mutation that must be carried out by the store's host.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardRequest {
    /// Run an action through the host's reducer
    Dispatch {
        /// Action object
        action: Value,
    },
    /// Replace the host's state
    SetState {
        /// Replacement state
        state: Value,
        /// Optimistic-concurrency guard
        expected_version: Option<u64>,
    },
}

impl ForwardRequest {
    fn into_command(self, forward_id: u64) -> GatewayCommand {
        match self {
            ForwardRequest::Dispatch { action } => GatewayCommand::Dispatch(DispatchPayload {
                action,
                forward_id: Some(forward_id),
            }),
            ForwardRequest::SetState {
                state,
                expected_version,
            } => GatewayCommand::SetState(SetStatePayload {
                state,
                expected_version,
                forward_id: Some(forward_id),
            }),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ForwardRequest::Dispatch { .. } => "dispatch",
            ForwardRequest::SetState { .. } => "setState",
        }
    }
}

/// A forward that reached its host and is waiting for an answer.
#[derive(Debug)]
pub struct InFlight {
    forward_id: u64,
    deadline: Instant,
    rx: oneshot::Receiver<Result<Value>>,
}

impl InFlight {
    /// Forward id echoed by the host.
    pub fn forward_id(&self) -> u64 {
        self.forward_id
    }
}

/// Bridges control-plane mutations to host commands and back.
#[derive(Clone)]
pub struct ForwardCoordinator {
    registry: ConnectionRegistry,
    timeout: Duration,
}

impl ForwardCoordinator {
    /// Create a coordinator over `registry` with a per-forward `timeout`.
    pub fn new(registry: ConnectionRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Forward `request` to the host of `store_id` and wait for its outcome.
    ///
    /// Only the returned future waits; the registry is never held across the
    /// wait, so other connections proceed unhindered.
    pub async fn forward(
        &self,
        caller: ConnId,
        request_id: Option<RpcId>,
        store_id: &str,
        request: ForwardRequest,
    ) -> Result<Value> {
        let in_flight = self.start(caller, request_id, store_id, request)?;
        self.await_outcome(in_flight).await
    }

    /// Record the forward and hand the command to the host, without waiting.
    ///
    /// Once this returns, the pending entry is visible to
    /// [`ConnectionRegistry::remove_connection`] for both the caller and the host.
    pub fn start(
        &self,
        caller: ConnId,
        request_id: Option<RpcId>,
        store_id: &str,
        request: ForwardRequest,
    ) -> Result<InFlight> {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + self.timeout;
        let pending = PendingForward::new(caller, request_id, store_id.to_string(), deadline, tx);

        let label = request.label();
        let (forward_id, host) = self.registry.begin_forward(pending)?;

        let delivered = encode(&request.into_command(forward_id))
            .map(|frame| host.try_send(frame))
            .unwrap_or(false);
        if !delivered {
            self.registry.take_forward(forward_id);
            warn!(forward_id, store_id, "host queue unavailable, forward abandoned");
            return Err(BridgeError::HostDisconnected(store_id.to_string()));
        }

        debug!(forward_id, store_id, %caller, kind = label, "forwarded to host {}", host.id());
        Ok(InFlight {
            forward_id,
            deadline,
            rx,
        })
    }

    /// Wait for a started forward to resolve, fail, or reach its deadline.
    pub async fn await_outcome(&self, in_flight: InFlight) -> Result<Value> {
        let InFlight {
            forward_id,
            deadline,
            mut rx,
        } = in_flight;
        tokio::select! {
            outcome = &mut rx => outcome.unwrap_or(Err(BridgeError::ConnectionClosed)),
            _ = tokio::time::sleep_until(deadline) => {
                match self.registry.take_forward(forward_id) {
                    Some(expired) => {
                        warn!(forward_id, store_id = %expired.store_id, "forward timed out");
                        Err(BridgeError::ForwardTimeout(forward_id))
                    }
                    // Someone took it just now; their outcome is on the way.
                    None => rx.await.unwrap_or(Err(BridgeError::ConnectionClosed)),
                }
            }
        }
    }

    /// Resolve a forward answered by a `store.stateChanged` at `version`.
    pub fn complete(&self, pending: PendingForward, version: u64) {
        debug!(forward_id = pending.forward_id, version, "forward resolved");
        pending.resolve(Ok(json!({ "ok": true, "version": version })));
    }

    /// Fail forwards whose host went away.
    pub fn fail_stranded(&self, stranded: Vec<PendingForward>) {
        for pending in stranded {
            debug!(forward_id = pending.forward_id, "failing forward, host gone");
            let store_id = pending.store_id.clone();
            pending.resolve(Err(BridgeError::HostDisconnected(store_id)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::registry::{ConnectionHandle, HostConnection, StateChange};
    use crate::protocol::host::StateChangedPayload;
    use tokio::sync::mpsc;

    fn setup(timeout_ms: u64) -> (ConnectionRegistry, ForwardCoordinator, ConnectionHandle, mpsc::Receiver<String>) {
        let registry = ConnectionRegistry::new();
        let coordinator = ForwardCoordinator::new(registry.clone(), Duration::from_millis(timeout_ms));
        let (tx, rx) = mpsc::channel(8);
        let host = ConnectionHandle::new(ConnId::next(), tx);
        registry.set_host(HostConnection::new(
            host.clone(),
            "demo#ab12cd".into(),
            "demo".into(),
            Some("main".into()),
            None,
            json!({"count": 0}),
        ));
        (registry, coordinator, host, rx)
    }

    #[tokio::test]
    async fn test_missing_host_fails_without_pending() {
        let registry = ConnectionRegistry::new();
        let coordinator = ForwardCoordinator::new(registry.clone(), Duration::from_secs(1));
        let err = coordinator
            .forward(
                ConnId::next(),
                Some(RpcId::Num(1)),
                "demo#ab12cd",
                ForwardRequest::Dispatch { action: json!({"type": "counter.add"}) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::StoreNotFound(_)));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_tagged_state_change_resolves_forward() {
        let (registry, coordinator, host, mut host_rx) = setup(2_000);

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .forward(
                        ConnId::next(),
                        Some(RpcId::Num(7)),
                        "demo#ab12cd",
                        ForwardRequest::Dispatch {
                            action: json!({"type": "counter.add", "payload": {"n": 5}}),
                        },
                    )
                    .await
            })
        };

        let frame = host_rx.recv().await.unwrap();
        let command = GatewayCommand::from_value(serde_json::from_str(&frame).unwrap()).unwrap();
        let forward_id = command.forward_id().unwrap();

        let change = StateChangedPayload {
            store_id: "demo#ab12cd".into(),
            state: json!({"count": 5}),
            version: 1,
            source: Some("host".into()),
            forward_id: Some(forward_id),
        };
        match registry.record_state_change(host.id(), &change) {
            StateChange::Accepted { resolved: Some(p), .. } => coordinator.complete(p, 1),
            other => panic!("unexpected {:?}", other),
        }

        let result = task.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(result["version"], 1);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unanswered_forward_times_out() {
        let (registry, coordinator, _host, _host_rx) = setup(50);
        let err = coordinator
            .forward(
                ConnId::next(),
                None,
                "demo#ab12cd",
                ForwardRequest::SetState { state: json!({}), expected_version: Some(3) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ForwardTimeout(_)));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_host_disconnect_fails_fast() {
        let (registry, coordinator, host, mut host_rx) = setup(10_000);

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .forward(
                        ConnId::next(),
                        None,
                        "demo#ab12cd",
                        ForwardRequest::Dispatch { action: json!({"type": "noop"}) },
                    )
                    .await
            })
        };

        host_rx.recv().await.unwrap();
        let removal = registry.remove_connection(host.id());
        coordinator.fail_stranded(removal.stranded);

        let err = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("forward should fail before its timeout")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BridgeError::HostDisconnected(_)));
    }

    #[tokio::test]
    async fn test_start_records_forward_before_waiting() {
        let (registry, coordinator, _host, mut host_rx) = setup(10_000);
        let caller = ConnId::next();

        let in_flight = coordinator
            .start(caller, Some(RpcId::Num(3)), "demo#ab12cd", ForwardRequest::Dispatch { action: json!({}) })
            .unwrap();
        assert!(registry.has_forward(in_flight.forward_id()));
        assert!(host_rx.try_recv().is_ok());

        registry.remove_connection(caller);
        let err = coordinator.await_outcome(in_flight).await.unwrap_err();
        assert!(matches!(err, BridgeError::ConnectionClosed));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_caller_disconnect_drops_forward() {
        let (registry, coordinator, _host, mut host_rx) = setup(10_000);
        let caller = ConnId::next();

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .forward(caller, Some(RpcId::Num(1)), "demo#ab12cd", ForwardRequest::Dispatch { action: json!({}) })
                    .await
            })
        };

        host_rx.recv().await.unwrap();
        let removal = registry.remove_connection(caller);
        assert_eq!(removal.abandoned, 1);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::ConnectionClosed));
        assert!(registry.forwards_of(caller).is_empty());
    }
}
