//! The bridge gateway: routes both protocols onto the registry and coordinator.
//!
//! [`Gateway`] is transport-agnostic. The WebSocket layer hands it text frames
//! together with the sending connection's [`ConnectionHandle`], and the REST
//! facade calls its programmatic surface ([`Gateway::list_stores`],
//! [`Gateway::get_state`], [`Gateway::dispatch`], ...). Replies and
//! notifications leave through connection handles; the gateway never touches
//! a socket.

use super::config::GatewayConfig;
use super::forward::{ForwardCoordinator, ForwardRequest, InFlight};
use super::registry::{ConnectionHandle, ConnectionRegistry, HostConnection, StateChange};
use crate::error::{BridgeError, Result};
use crate::protocol::host::{HostMessage, RegisterPayload, StateChangedPayload};
use crate::protocol::rpc::{
    DispatchParams, Method, PageParams, ResolveParams, RpcRequest, RpcResponse, SetStateParams,
    StateChangedParams, StoreParams,
};
use crate::protocol::{encode, InboundFrame, RpcNotification};
use crate::types::{ConnId, RpcId, StoreId, StoreInfo, StoreSnapshot, StoreSummary};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What the transport should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading
    Continue,
    /// The peer asked to leave; close the transport
    Close,
}

/// Shared gateway state. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    registry: ConnectionRegistry,
    coordinator: ForwardCoordinator,
}

impl Gateway {
    /// Create a gateway with an empty registry.
    pub fn new(config: GatewayConfig) -> Self {
        let registry = ConnectionRegistry::new();
        let coordinator = ForwardCoordinator::new(registry.clone(), config.forward_timeout());
        Self {
            config: Arc::new(config),
            registry,
            coordinator,
        }
    }

    /// Gateway configuration.
    #[inline]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The underlying registry.
    #[inline]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    // ========== Connection lifecycle ==========

    /// Allocate an id and a bounded outbound queue for a new connection.
    pub fn open_connection(&self) -> (ConnectionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer);
        let handle = ConnectionHandle::new(ConnId::next(), tx);
        debug!(conn = %handle.id(), "connection opened");
        (handle, rx)
    }

    /// Tear down everything `conn` owned.
    ///
    /// Forwards it issued are dropped without reply; forwards aimed at it as
    /// a host fail immediately. Safe to call more than once.
    pub fn close_connection(&self, conn: ConnId, voluntary: bool) {
        let removal = self.registry.remove_connection(conn);
        if removal.is_empty() {
            debug!(%conn, voluntary, "connection closed");
            return;
        }

        info!(
            %conn,
            voluntary,
            hosted = ?removal.hosted,
            subscriptions = removal.subscriptions,
            abandoned_forwards = removal.abandoned,
            stranded_forwards = removal.stranded.len(),
            "{}",
            if voluntary { "host disconnected voluntarily" } else { "connection closed" }
        );
        self.coordinator.fail_stranded(removal.stranded);
    }

    /// Whether `conn` currently hosts at least one store.
    pub fn is_host(&self, conn: ConnId) -> bool {
        !self.registry.stores_hosted_by(conn).is_empty()
    }

    // ========== Inbound frames ==========

    /// Handle one text frame received from `handle`.
    ///
    /// Malformed frames are logged and ignored; the connection stays open.
    pub async fn handle_text(&self, handle: &ConnectionHandle, text: &str) -> Flow {
        match InboundFrame::parse(text) {
            Ok(InboundFrame::Host(message)) => self.handle_host_message(handle, message),
            Ok(InboundFrame::Rpc(request)) => {
                self.handle_request(handle, request).await;
                Flow::Continue
            }
            Err((Some(id), err)) => {
                warn!(conn = %handle.id(), "malformed request: {}", err);
                self.reply(handle, &RpcResponse::failure(Some(id), &err)).await;
                Flow::Continue
            }
            Err((None, err)) => {
                warn!(conn = %handle.id(), "ignoring malformed message: {}", err);
                Flow::Continue
            }
        }
    }

    /// Handle one host-sync message.
    pub fn handle_host_message(&self, handle: &ConnectionHandle, message: HostMessage) -> Flow {
        debug!(conn = %handle.id(), kind = message.kind(), "host message");
        match message {
            HostMessage::Register(payload) => {
                self.register_host(handle, payload);
                Flow::Continue
            }
            HostMessage::StateChanged(change) => {
                self.apply_state_change(handle.id(), change);
                Flow::Continue
            }
            HostMessage::Heartbeat => {
                self.registry.touch(handle.id());
                Flow::Continue
            }
            HostMessage::Disconnect => {
                self.close_connection(handle.id(), true);
                Flow::Close
            }
        }
    }

    fn register_host(&self, handle: &ConnectionHandle, payload: RegisterPayload) {
        let RegisterPayload {
            store_id,
            page_id,
            store_key,
            description,
            initial_state,
        } = payload;

        let host = HostConnection::new(
            handle.clone(),
            store_id.clone(),
            page_id.clone(),
            store_key.clone(),
            description,
            initial_state,
        );
        let replacement = self.registry.set_host(host);

        match replacement.previous {
            Some(prev) if prev != handle.id() => info!(
                %store_id, %page_id, ?store_key, conn = %handle.id(), previous = %prev,
                "store re-registered by a new host"
            ),
            Some(_) => info!(%store_id, %page_id, ?store_key, conn = %handle.id(), "store re-registered"),
            None => info!(%store_id, %page_id, ?store_key, conn = %handle.id(), "store registered"),
        }
        self.coordinator.fail_stranded(replacement.stranded);
    }

    fn apply_state_change(&self, conn: ConnId, change: StateChangedPayload) {
        match self.registry.record_state_change(conn, &change) {
            StateChange::Accepted {
                subscribers,
                resolved,
            } => {
                if let Some(pending) = resolved {
                    self.coordinator.complete(pending, change.version);
                }
                self.fan_out(change, subscribers);
            }
            StateChange::UnknownStore => {
                warn!(%conn, store_id = %change.store_id, "state change for unregistered store ignored");
            }
            StateChange::NotOwner => {
                warn!(%conn, store_id = %change.store_id, "state change from a non-owning connection ignored");
            }
            StateChange::Stale { cached } => {
                warn!(
                    %conn, store_id = %change.store_id, version = change.version, cached,
                    "stale state change ignored"
                );
            }
        }
    }

    /// Push a `store.stateChanged` notification to every subscriber, never waiting.
    fn fan_out(&self, change: StateChangedPayload, subscribers: Vec<ConnectionHandle>) {
        if subscribers.is_empty() {
            return;
        }
        let params = StateChangedParams {
            store_id: change.store_id,
            version: change.version,
            state: change.state,
        };
        let frame = match RpcNotification::state_changed(&params).and_then(|n| encode(&n)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(store_id = %params.store_id, "failed to encode notification: {}", e);
                return;
            }
        };

        for subscriber in subscribers {
            if !subscriber.try_send(frame.clone()) {
                warn!(
                    conn = %subscriber.id(), store_id = %params.store_id, version = params.version,
                    "subscriber queue full or closed, notification dropped"
                );
            }
        }
    }

    /// Handle one control-plane request.
    ///
    /// Forwarded methods are recorded and sent to the host before this
    /// returns; only the wait for the host runs on a separate task, so the
    /// connection keeps reading while the host works.
    pub async fn handle_request(&self, handle: &ConnectionHandle, request: RpcRequest) {
        let Some(id) = request.id.clone() else {
            debug!(conn = %handle.id(), method = %request.method, "ignoring client notification");
            return;
        };

        let Some(method) = Method::parse(&request.method) else {
            let err = BridgeError::MethodNotFound(request.method.clone());
            self.reply(handle, &RpcResponse::failure(Some(id), &err)).await;
            return;
        };

        if method.is_forwarded() {
            match self.start_forward(handle.id(), id.clone(), method, &request) {
                Ok(in_flight) => {
                    let gateway = self.clone();
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        let outcome = gateway.coordinator.await_outcome(in_flight).await;
                        if matches!(outcome, Err(BridgeError::ConnectionClosed)) {
                            return;
                        }
                        gateway.reply(&handle, &RpcResponse::from_result(Some(id), outcome)).await;
                    });
                }
                Err(err) => self.reply(handle, &RpcResponse::failure(Some(id), &err)).await,
            }
            return;
        }

        let outcome = self.call(handle, method, &request);
        self.reply(handle, &RpcResponse::from_result(Some(id), outcome)).await;
    }

    fn start_forward(
        &self,
        caller: ConnId,
        id: RpcId,
        method: Method,
        request: &RpcRequest,
    ) -> Result<InFlight> {
        let (store_id, forward) = match method {
            Method::Dispatch => {
                let params: DispatchParams = request.params()?;
                (params.store_id, ForwardRequest::Dispatch { action: params.action })
            }
            Method::SetState => {
                let params: SetStateParams = request.params()?;
                (
                    params.store_id,
                    ForwardRequest::SetState {
                        state: params.state,
                        expected_version: params.expected_version,
                    },
                )
            }
            other => return Err(BridgeError::MethodNotFound(format!("{:?}", other))),
        };
        self.coordinator.start(caller, Some(id), &store_id, forward)
    }

    fn call(&self, handle: &ConnectionHandle, method: Method, request: &RpcRequest) -> Result<Value> {
        match method {
            Method::PageResolve => {
                let params: ResolveParams = request.params()?;
                let store_id = self.resolve(&params.page_id, params.store_key.as_deref())?;
                Ok(json!({ "storeId": store_id }))
            }
            Method::PageListStores => {
                let params: PageParams = request.params()?;
                Ok(json!({ "stores": self.page_stores(&params.page_id) }))
            }
            Method::StoreList => Ok(json!({ "stores": self.list_stores() })),
            Method::StoreGet => {
                let params: StoreParams = request.params()?;
                let info = self
                    .get_store(&params.store_id)
                    .ok_or(BridgeError::StoreNotFound(params.store_id))?;
                Ok(serde_json::to_value(info)?)
            }
            Method::Subscribe => {
                let params: StoreParams = request.params()?;
                self.subscribe(handle, &params.store_id)?;
                Ok(json!({ "ok": true, "storeId": params.store_id }))
            }
            Method::Unsubscribe => {
                let params: StoreParams = request.params()?;
                let removed = self.registry.remove_subscriber(&params.store_id, handle.id());
                Ok(json!({ "ok": removed, "storeId": params.store_id }))
            }
            Method::GetState => {
                let params: StoreParams = request.params()?;
                let snapshot = self
                    .get_state(&params.store_id)
                    .ok_or(BridgeError::StoreNotFound(params.store_id))?;
                Ok(serde_json::to_value(snapshot)?)
            }
            Method::Dispatch | Method::SetState => {
                Err(BridgeError::MethodNotFound(request.method.clone()))
            }
        }
    }

    fn subscribe(&self, handle: &ConnectionHandle, store_id: &str) -> Result<()> {
        let limit = self.config.max_subscriptions;
        if self.registry.subscription_count(handle.id()) >= limit
            && !self
                .registry
                .subscribers(store_id)
                .iter()
                .any(|s| s.id() == handle.id())
        {
            return Err(BridgeError::InvalidParams(format!(
                "subscription limit of {} reached",
                limit
            )));
        }
        if self.registry.add_subscriber(store_id, handle.clone()) {
            debug!(conn = %handle.id(), %store_id, "subscribed");
        }
        Ok(())
    }

    async fn reply(&self, handle: &ConnectionHandle, response: &RpcResponse) {
        match encode(response) {
            Ok(frame) => {
                if !handle.send(frame).await {
                    debug!(conn = %handle.id(), "reply dropped, connection gone");
                }
            }
            Err(e) => warn!(conn = %handle.id(), "failed to encode response: {}", e),
        }
    }

    // ========== Programmatic surface ==========

    /// Every registered store.
    pub fn list_stores(&self) -> Vec<StoreSummary> {
        self.registry.list_stores()
    }

    /// Stores hosted under one page; empty for an unknown page.
    pub fn page_stores(&self, page_id: &str) -> Vec<StoreSummary> {
        self.registry.page_summaries(page_id)
    }

    /// Resolve `(page_id, store_key)` to a store id.
    ///
    /// Without a key, the first store listed under the page is used.
    pub fn resolve(&self, page_id: &str, store_key: Option<&str>) -> Result<StoreId> {
        let found = match store_key {
            Some(key) => self.registry.resolve_by_page_and_key(page_id, key),
            None => self.registry.list_stores_under_page(page_id).into_iter().next(),
        };
        found.ok_or_else(|| BridgeError::ResolveFailed {
            page_id: page_id.to_string(),
            store_key: store_key.map(str::to_string),
        })
    }

    /// Metadata of one store.
    pub fn get_store(&self, store_id: &str) -> Option<StoreInfo> {
        self.registry.store_info(store_id)
    }

    /// Cached state of one store.
    pub fn get_state(&self, store_id: &str) -> Option<StoreSnapshot> {
        self.registry.snapshot(store_id)
    }

    /// Ask the host to replace its state; resolves when the host reports the change.
    pub async fn set_state(&self, store_id: &str, state: Value, expected_version: Option<u64>) -> Result<Value> {
        self.coordinator
            .forward(
                ConnId::next(),
                None,
                store_id,
                ForwardRequest::SetState {
                    state,
                    expected_version,
                },
            )
            .await
    }

    /// Ask the host to run an action; resolves when the host reports the change.
    pub async fn dispatch(&self, store_id: &str, action: Value) -> Result<Value> {
        self.coordinator
            .forward(ConnId::next(), None, store_id, ForwardRequest::Dispatch { action })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::host::GatewayCommand;
    use crate::protocol::rpc::codes;
    use serde_json::json;
    use std::time::Duration;

    fn gateway() -> Gateway {
        Gateway::new(GatewayConfig {
            forward_timeout_ms: 1_000,
            ..Default::default()
        })
    }

    async fn recv_json(rx: &mut mpsc::Receiver<String>) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("queue closed");
        serde_json::from_str(&frame).unwrap()
    }

    async fn register(gw: &Gateway, handle: &ConnectionHandle, store_id: &str) {
        let frame = json!({
            "type": "store.register",
            "payload": {
                "storeId": store_id,
                "pageId": "demo",
                "storeKey": "main",
                "initialState": {"count": 0}
            }
        });
        assert_eq!(gw.handle_text(handle, &frame.to_string()).await, Flow::Continue);
    }

    async fn rpc(gw: &Gateway, handle: &ConnectionHandle, id: i64, method: &str, params: Value) {
        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        gw.handle_text(handle, &frame.to_string()).await;
    }

    #[tokio::test]
    async fn test_subscriber_receives_state_change() {
        let gw = gateway();
        let (host, _host_rx) = gw.open_connection();
        let (sub, mut sub_rx) = gw.open_connection();

        register(&gw, &host, "demo#ab12cd").await;
        rpc(&gw, &sub, 1, "store.subscribe", json!({"storeId": "demo#ab12cd"})).await;
        let ack = recv_json(&mut sub_rx).await;
        assert_eq!(ack["id"], 1);
        assert_eq!(ack["result"]["ok"], true);

        let change = json!({
            "type": "store.stateChanged",
            "payload": {"storeId": "demo#ab12cd", "state": {"count": 5}, "version": 1, "source": "host"}
        });
        gw.handle_text(&host, &change.to_string()).await;

        let note = recv_json(&mut sub_rx).await;
        assert_eq!(note["method"], "store.stateChanged");
        assert!(note.get("id").is_none());
        assert_eq!(note["params"]["version"], 1);
        assert_eq!(note["params"]["state"]["count"], 5);
        assert!(sub_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_without_host_is_store_not_found() {
        let gw = gateway();
        let (sub, mut sub_rx) = gw.open_connection();

        rpc(
            &gw,
            &sub,
            2,
            "store.dispatch",
            json!({"storeId": "demo#ab12cd", "action": {"type": "counter.add", "payload": {"n": 5}}}),
        )
        .await;

        let resp = recv_json(&mut sub_rx).await;
        assert_eq!(resp["id"], 2);
        assert_eq!(resp["error"]["code"], codes::STORE_NOT_FOUND);
        assert_eq!(gw.registry().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_round_trip() {
        let gw = gateway();
        let (host, mut host_rx) = gw.open_connection();
        let (sub, mut sub_rx) = gw.open_connection();
        register(&gw, &host, "demo#ab12cd").await;

        rpc(
            &gw,
            &sub,
            7,
            "store.dispatch",
            json!({"storeId": "demo#ab12cd", "action": {"type": "counter.add", "payload": {"n": 5}}}),
        )
        .await;

        let command = GatewayCommand::from_value(recv_json(&mut host_rx).await).unwrap();
        let forward_id = command.forward_id().unwrap();
        assert!(matches!(command, GatewayCommand::Dispatch(_)));

        let change = json!({
            "type": "store.stateChanged",
            "payload": {"storeId": "demo#ab12cd", "state": {"count": 5}, "version": 1, "forwardId": forward_id}
        });
        gw.handle_text(&host, &change.to_string()).await;

        let resp = recv_json(&mut sub_rx).await;
        assert_eq!(resp["id"], 7);
        assert_eq!(resp["result"]["version"], 1);
        assert_eq!(gw.get_state("demo#ab12cd").unwrap().state["count"], 5);
    }

    #[tokio::test]
    async fn test_resolve_and_list() {
        let gw = gateway();
        let (host, _host_rx) = gw.open_connection();
        register(&gw, &host, "demo#ab12cd").await;

        assert_eq!(gw.resolve("demo", Some("main")).unwrap(), "demo#ab12cd");
        assert_eq!(gw.resolve("demo", None).unwrap(), "demo#ab12cd");
        assert!(matches!(
            gw.resolve("demo", Some("other")),
            Err(BridgeError::ResolveFailed { .. })
        ));
        assert!(gw.resolve("nowhere", None).is_err());
        assert_eq!(gw.page_stores("demo").len(), 1);
        assert!(gw.page_stores("nowhere").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let gw = gateway();
        let (conn, mut rx) = gw.open_connection();
        rpc(&gw, &conn, 3, "store.teleport", json!({})).await;
        let resp = recv_json(&mut rx).await;
        assert_eq!(resp["error"]["code"], codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_state_unknown_store() {
        let gw = gateway();
        let (conn, mut rx) = gw.open_connection();
        rpc(&gw, &conn, 4, "store.getState", json!({"storeId": "missing#1"})).await;
        let resp = recv_json(&mut rx).await;
        assert_eq!(resp["error"]["code"], codes::STORE_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_voluntary_disconnect_unregisters() {
        let gw = gateway();
        let (host, _rx) = gw.open_connection();
        register(&gw, &host, "demo#ab12cd").await;
        assert!(gw.is_host(host.id()));

        let flow = gw.handle_text(&host, r#"{"type":"store.disconnect"}"#).await;
        assert_eq!(flow, Flow::Close);
        assert!(gw.get_store("demo#ab12cd").is_none());
        assert!(!gw.is_host(host.id()));
    }

    #[tokio::test]
    async fn test_malformed_message_is_ignored() {
        let gw = gateway();
        let (conn, mut rx) = gw.open_connection();
        assert_eq!(gw.handle_text(&conn, "{oops").await, Flow::Continue);
        assert_eq!(gw.handle_text(&conn, r#"{"type":"store.nope"}"#).await, Flow::Continue);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscription_limit() {
        let gw = Gateway::new(GatewayConfig {
            max_subscriptions: 1,
            ..Default::default()
        });
        let (conn, mut rx) = gw.open_connection();
        rpc(&gw, &conn, 1, "store.subscribe", json!({"storeId": "a#1"})).await;
        assert_eq!(recv_json(&mut rx).await["result"]["ok"], true);
        rpc(&gw, &conn, 2, "store.subscribe", json!({"storeId": "a#1"})).await;
        assert_eq!(recv_json(&mut rx).await["result"]["ok"], true);
        rpc(&gw, &conn, 3, "store.subscribe", json!({"storeId": "b#1"})).await;
        assert_eq!(recv_json(&mut rx).await["error"]["code"], codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_forward_correlates_to_originating_connection() {
        let gw = gateway();
        let (host, mut host_rx) = gw.open_connection();
        let (c1, mut c1_rx) = gw.open_connection();
        let (c2, mut c2_rx) = gw.open_connection();
        register(&gw, &host, "demo#ab12cd").await;

        rpc(&gw, &c1, 7, "store.dispatch", json!({"storeId": "demo#ab12cd", "action": {"type": "a"}})).await;
        let first = GatewayCommand::from_value(recv_json(&mut host_rx).await).unwrap();
        rpc(&gw, &c2, 7, "store.dispatch", json!({"storeId": "demo#ab12cd", "action": {"type": "b"}})).await;
        let second = GatewayCommand::from_value(recv_json(&mut host_rx).await).unwrap();
        assert_ne!(first.forward_id(), second.forward_id());

        let change = json!({
            "type": "store.stateChanged",
            "payload": {"storeId": "demo#ab12cd", "state": {}, "version": 1, "forwardId": first.forward_id()}
        });
        gw.handle_text(&host, &change.to_string()).await;

        let resp = recv_json(&mut c1_rx).await;
        assert_eq!(resp["id"], 7);
        assert_eq!(resp["result"]["ok"], true);
        assert!(c2_rx.try_recv().is_err());
        assert_eq!(gw.registry().pending_count(), 1);
    }

    #[tokio::test]
    async fn test_caller_disconnect_right_after_dispatch_leaves_nothing_pending() {
        let gw = gateway();
        let (host, mut host_rx) = gw.open_connection();
        let (sub, mut sub_rx) = gw.open_connection();
        register(&gw, &host, "demo#ab12cd").await;

        rpc(&gw, &sub, 7, "store.dispatch", json!({"storeId": "demo#ab12cd", "action": {"type": "a"}})).await;
        gw.close_connection(sub.id(), false);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(gw.registry().pending_count(), 0);
        assert!(gw.registry().forwards_of(sub.id()).is_empty());
        let command = GatewayCommand::from_value(recv_json(&mut host_rx).await).unwrap();
        assert!(command.forward_id().is_some());

        // A late answer from the host resolves nothing and produces no reply.
        let change = json!({
            "type": "store.stateChanged",
            "payload": {"storeId": "demo#ab12cd", "state": {}, "version": 1, "forwardId": command.forward_id()}
        });
        gw.handle_text(&host, &change.to_string()).await;
        tokio::task::yield_now().await;
        assert!(sub_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_subscriber_queue_does_not_stall_others() {
        let gw = Gateway::new(GatewayConfig {
            outbound_buffer: 1,
            ..Default::default()
        });
        let (host, _host_rx) = gw.open_connection();
        let (slow, mut slow_rx) = gw.open_connection();
        let (fast, mut fast_rx) = gw.open_connection();
        register(&gw, &host, "demo#ab12cd").await;

        // The subscribe ack fills the slow connection's single slot.
        rpc(&gw, &slow, 1, "store.subscribe", json!({"storeId": "demo#ab12cd"})).await;
        rpc(&gw, &fast, 1, "store.subscribe", json!({"storeId": "demo#ab12cd"})).await;
        assert_eq!(recv_json(&mut fast_rx).await["result"]["ok"], true);

        for version in 1..=2 {
            let change = json!({
                "type": "store.stateChanged",
                "payload": {"storeId": "demo#ab12cd", "state": {"count": version}, "version": version}
            });
            let flow = tokio::time::timeout(Duration::from_millis(200), gw.handle_text(&host, &change.to_string()))
                .await
                .expect("host frame blocked on a full subscriber");
            assert_eq!(flow, Flow::Continue);

            let note = recv_json(&mut fast_rx).await;
            assert_eq!(note["method"], "store.stateChanged");
            assert_eq!(note["params"]["version"], version);
        }

        assert_eq!(recv_json(&mut slow_rx).await["id"], 1);
        assert!(slow_rx.try_recv().is_err());
        assert_eq!(gw.registry().subscribers("demo#ab12cd").len(), 2);
        assert_eq!(gw.get_state("demo#ab12cd").unwrap().version, 2);
    }
}
