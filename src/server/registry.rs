//! Process-wide connection registry.
//!
//! The registry is the authoritative in-memory directory of who owns which
//! store, who watches which store, and which forwarded mutations are still in
//! flight. It performs no I/O: every method is a total function over the
//! current index state, and absence is reported as `None`/`false`, never as
//! an error (the one exception is [`ConnectionRegistry::begin_forward`], which
//! reports a missing host so the coordinator can fail the caller).
//!
//! # Locking
//!
//! All index maps live inside one `Indexes` value behind a single
//! `RwLock`. Multi-map updates (host table plus both page indexes, or the
//! three-family sweep in [`ConnectionRegistry::remove_connection`]) therefore
//! happen under one write guard and are atomic from every other task's point
//! of view. Nothing awaits while a guard is held.
//!
//! # Invariants
//!
//! - At most one host per store id; a replacement unindexes the old host
//!   before the new one is indexed, inside the same guard.
//! - `page_to_stores` and `page_to_store_keys` mirror the host table exactly.
//! - A pending forward never outlives the connection that issued it.
//! - A store's cached version never decreases.

use crate::error::{BridgeError, Result};
use crate::protocol::host::StateChangedPayload;
use crate::types::{
    now_millis, ConnId, PageId, RpcId, StoreDescription, StoreId, StoreInfo, StoreKey,
    StoreSnapshot, StoreSummary,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Handle to a live connection's outbound queue.
///
/// Equality is by [`ConnId`] only; the sender is just the delivery path.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnId,
    tx: mpsc::Sender<String>,
}

impl ConnectionHandle {
    /// Wrap an outbound queue.
    pub fn new(id: ConnId, tx: mpsc::Sender<String>) -> Self {
        Self { id, tx }
    }

    /// Connection id.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Queue a text frame without waiting.
    ///
    /// Returns `false` if the queue is full or the connection is gone.
    pub fn try_send(&self, frame: String) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    /// Queue a text frame, waiting for room. Returns `false` if the connection is gone.
    pub async fn send(&self, frame: String) -> bool {
        self.tx.send(frame).await.is_ok()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

/// The single authoritative owner of one store.
#[derive(Debug, Clone)]
pub struct HostConnection {
    /// Owning connection
    pub handle: ConnectionHandle,
    /// Store identity
    pub store_id: StoreId,
    /// Page the store lives on
    pub page_id: PageId,
    /// Optional key within the page
    pub store_key: Option<StoreKey>,
    /// Host-published description
    pub description: Option<StoreDescription>,
    /// Last state reported by the host
    pub state: Value,
    /// Last version reported by the host
    pub version: u64,
    /// Registration time (ms since epoch)
    pub connected_at: u64,
    /// Last message from the host (ms since epoch)
    pub last_activity: u64,
}

impl HostConnection {
    /// Freshly registered host at version 0.
    pub fn new(
        handle: ConnectionHandle,
        store_id: StoreId,
        page_id: PageId,
        store_key: Option<StoreKey>,
        description: Option<StoreDescription>,
        initial_state: Value,
    ) -> Self {
        let now = now_millis();
        Self {
            handle,
            store_id,
            page_id,
            store_key,
            description,
            state: initial_state,
            version: 0,
            connected_at: now,
            last_activity: now,
        }
    }

    fn summary(&self) -> StoreSummary {
        StoreSummary {
            store_id: self.store_id.clone(),
            page_id: self.page_id.clone(),
            store_key: self.store_key.clone(),
            version: self.version,
            connected_at: self.connected_at,
        }
    }

    fn info(&self) -> StoreInfo {
        StoreInfo {
            store_id: self.store_id.clone(),
            page_id: self.page_id.clone(),
            store_key: self.store_key.clone(),
            description: self.description.clone(),
            version: self.version,
            connected_at: self.connected_at,
            last_activity: self.last_activity,
        }
    }
}

/// An in-flight forwarded mutation.
#[derive(Debug)]
pub struct PendingForward {
    /// Gateway-assigned forward id
    pub forward_id: u64,
    /// Connection that issued the original request
    pub caller: ConnId,
    /// Id of the original request (absent for REST callers)
    pub request_id: Option<RpcId>,
    /// Store the mutation targets
    pub store_id: StoreId,
    /// Host connection the command was sent to
    pub host: ConnId,
    /// Point after which the forward is expired
    pub deadline: Instant,
    reply: oneshot::Sender<Result<Value>>,
}

impl PendingForward {
    /// Build a pending forward; the id is assigned by the registry.
    pub fn new(
        caller: ConnId,
        request_id: Option<RpcId>,
        store_id: StoreId,
        deadline: Instant,
        reply: oneshot::Sender<Result<Value>>,
    ) -> Self {
        Self {
            forward_id: 0,
            caller,
            request_id,
            store_id,
            host: caller,
            deadline,
            reply,
        }
    }

    /// Deliver the outcome to whoever awaits this forward.
    pub fn resolve(self, outcome: Result<Value>) {
        // The awaiting side may have given up already.
        let _ = self.reply.send(outcome);
    }
}

/// What a host replacement displaced.
#[derive(Debug, Default)]
pub struct HostReplacement {
    /// Connection that owned the store before, if any
    pub previous: Option<ConnId>,
    /// Forwards that were waiting on the previous owner
    pub stranded: Vec<PendingForward>,
}

/// Everything [`ConnectionRegistry::remove_connection`] tore down.
#[derive(Debug, Default)]
pub struct Removal {
    /// Stores the connection was hosting
    pub hosted: Vec<StoreId>,
    /// Number of subscriptions dropped
    pub subscriptions: usize,
    /// Forwards the connection had issued; dropped without reply
    pub abandoned: usize,
    /// Forwards other callers had sent to this connection as host
    pub stranded: Vec<PendingForward>,
}

impl Removal {
    /// Whether the connection held nothing.
    pub fn is_empty(&self) -> bool {
        self.hosted.is_empty()
            && self.subscriptions == 0
            && self.abandoned == 0
            && self.stranded.is_empty()
    }
}

/// Result of feeding a host's `store.stateChanged` into the registry.
#[derive(Debug)]
pub enum StateChange {
    /// Cache updated; notify these subscribers
    Accepted {
        /// Current subscribers of the store
        subscribers: Vec<ConnectionHandle>,
        /// Forward answered by this change, if it carried a known forward id
        resolved: Option<PendingForward>,
    },
    /// No host is registered under that store id
    UnknownStore,
    /// The sender is not the store's current host
    NotOwner,
    /// Version went backwards
    Stale {
        /// Version currently cached
        cached: u64,
    },
}

#[derive(Default)]
struct Indexes {
    hosts: HashMap<StoreId, HostConnection>,
    subscribers: HashMap<StoreId, HashMap<ConnId, ConnectionHandle>>,
    page_to_stores: HashMap<PageId, BTreeSet<StoreId>>,
    page_to_store_keys: HashMap<PageId, HashMap<StoreKey, StoreId>>,
    pending: HashMap<u64, PendingForward>,
    forward_seq: u64,
}

impl Indexes {
    fn index_host(&mut self, host: &HostConnection) {
        self.page_to_stores
            .entry(host.page_id.clone())
            .or_default()
            .insert(host.store_id.clone());

        if let Some(key) = &host.store_key {
            self.page_to_store_keys
                .entry(host.page_id.clone())
                .or_default()
                .insert(key.clone(), host.store_id.clone());
        }
    }

    fn unindex_host(&mut self, host: &HostConnection) {
        if let Some(set) = self.page_to_stores.get_mut(&host.page_id) {
            set.remove(&host.store_id);
            if set.is_empty() {
                self.page_to_stores.remove(&host.page_id);
            }
        }

        if let Some(key) = &host.store_key {
            if let Some(map) = self.page_to_store_keys.get_mut(&host.page_id) {
                // Another store may have claimed the key since; leave it alone.
                if map.get(key) == Some(&host.store_id) {
                    map.remove(key);
                }
                if map.is_empty() {
                    self.page_to_store_keys.remove(&host.page_id);
                }
            }
        }
    }

    fn take_forwards_where(&mut self, pred: impl Fn(&PendingForward) -> bool) -> Vec<PendingForward> {
        let ids: Vec<u64> = self
            .pending
            .values()
            .filter(|p| pred(*p))
            .map(|p| p.forward_id)
            .collect();
        let mut taken: Vec<PendingForward> =
            ids.iter().filter_map(|id| self.pending.remove(id)).collect();
        taken.sort_by_key(|p| p.forward_id);
        taken
    }
}

/// Thread-safe directory of hosts, subscribers and pending forwards.
///
/// Cloning yields another handle to the same indexes.
///
/// # Examples
///
/// ```ignore
/// use store_bridge::server::ConnectionRegistry;
///
/// let registry = ConnectionRegistry::new();
/// assert!(registry.get_host("demo#ab12cd").is_none());
/// assert!(registry.list_stores().is_empty());
/// ```
pub struct ConnectionRegistry {
    inner: Arc<RwLock<Indexes>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Indexes::default())),
        }
    }

    // ========== Hosts ==========

    /// Install `host` as the owner of its store id.
    ///
    /// Last registration wins: any prior host for the same id is unindexed
    /// first, and forwards that were waiting on a *different* prior
    /// connection are handed back so the caller can fail them.
    pub fn set_host(&self, host: HostConnection) -> HostReplacement {
        let mut idx = self.inner.write();
        let mut replacement = HostReplacement::default();

        if let Some(prev) = idx.hosts.remove(&host.store_id) {
            idx.unindex_host(&prev);
            let prev_conn = prev.handle.id();
            if prev_conn != host.handle.id() {
                let store_id = host.store_id.clone();
                replacement.stranded =
                    idx.take_forwards_where(|p| p.host == prev_conn && p.store_id == store_id);
            }
            replacement.previous = Some(prev_conn);
        }

        idx.index_host(&host);
        idx.hosts.insert(host.store_id.clone(), host);
        replacement
    }

    /// Current host of a store.
    pub fn get_host(&self, store_id: &str) -> Option<HostConnection> {
        self.inner.read().hosts.get(store_id).cloned()
    }

    /// Store registered under `(page_id, store_key)`.
    pub fn resolve_by_page_and_key(&self, page_id: &str, store_key: &str) -> Option<StoreId> {
        self.inner
            .read()
            .page_to_store_keys
            .get(page_id)
            .and_then(|keys| keys.get(store_key))
            .cloned()
    }

    /// Store ids hosted under a page. Order carries no meaning.
    pub fn list_stores_under_page(&self, page_id: &str) -> Vec<StoreId> {
        self.inner
            .read()
            .page_to_stores
            .get(page_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Summaries of the stores hosted under a page.
    pub fn page_summaries(&self, page_id: &str) -> Vec<StoreSummary> {
        let idx = self.inner.read();
        idx.page_to_stores
            .get(page_id)
            .map(|set| {
                set.iter()
                    .filter_map(|id| idx.hosts.get(id))
                    .map(HostConnection::summary)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Summaries of every registered store, ordered by store id.
    pub fn list_stores(&self) -> Vec<StoreSummary> {
        let idx = self.inner.read();
        let mut stores: Vec<StoreSummary> = idx.hosts.values().map(HostConnection::summary).collect();
        stores.sort_by(|a, b| a.store_id.cmp(&b.store_id));
        stores
    }

    /// Metadata of one store.
    pub fn store_info(&self, store_id: &str) -> Option<StoreInfo> {
        self.inner.read().hosts.get(store_id).map(HostConnection::info)
    }

    /// Cached `(state, version)` of one store.
    pub fn snapshot(&self, store_id: &str) -> Option<StoreSnapshot> {
        self.inner.read().hosts.get(store_id).map(|h| StoreSnapshot {
            store_id: h.store_id.clone(),
            state: h.state.clone(),
            version: h.version,
        })
    }

    /// Store ids currently hosted by `conn`.
    pub fn stores_hosted_by(&self, conn: ConnId) -> Vec<StoreId> {
        let mut ids: Vec<StoreId> = self
            .inner
            .read()
            .hosts
            .values()
            .filter(|h| h.handle.id() == conn)
            .map(|h| h.store_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Record liveness for every store hosted by `conn`.
    pub fn touch(&self, conn: ConnId) {
        let now = now_millis();
        let mut idx = self.inner.write();
        for host in idx.hosts.values_mut().filter(|h| h.handle.id() == conn) {
            host.last_activity = now;
        }
    }

    /// Apply a host's state change to the cache.
    ///
    /// Only the store's current host may advance it, and never backwards.
    /// On acceptance the current subscriber set is captured under the same
    /// guard, so notifications follow the order the host emitted them.
    pub fn record_state_change(&self, conn: ConnId, change: &StateChangedPayload) -> StateChange {
        let mut guard = self.inner.write();
        let idx = &mut *guard;

        let Some(host) = idx.hosts.get_mut(&change.store_id) else {
            return StateChange::UnknownStore;
        };
        if host.handle.id() != conn {
            return StateChange::NotOwner;
        }
        if change.version < host.version {
            return StateChange::Stale {
                cached: host.version,
            };
        }

        host.state = change.state.clone();
        host.version = change.version;
        host.last_activity = now_millis();

        let resolved = change
            .forward_id
            .filter(|fid| {
                idx.pending
                    .get(fid)
                    .map(|p| p.host == conn && p.store_id == change.store_id)
                    .unwrap_or(false)
            })
            .and_then(|fid| idx.pending.remove(&fid));

        let subscribers = idx
            .subscribers
            .get(&change.store_id)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default();

        StateChange::Accepted {
            subscribers,
            resolved,
        }
    }

    // ========== Subscribers ==========

    /// Add `handle` to a store's subscriber set. Returns `false` if already present.
    pub fn add_subscriber(&self, store_id: &str, handle: ConnectionHandle) -> bool {
        let mut idx = self.inner.write();
        idx.subscribers
            .entry(store_id.to_string())
            .or_default()
            .insert(handle.id(), handle)
            .is_none()
    }

    /// Remove `conn` from a store's subscriber set. Returns `false` if it was absent.
    pub fn remove_subscriber(&self, store_id: &str, conn: ConnId) -> bool {
        let mut idx = self.inner.write();
        let Some(subs) = idx.subscribers.get_mut(store_id) else {
            return false;
        };
        let removed = subs.remove(&conn).is_some();
        if subs.is_empty() {
            idx.subscribers.remove(store_id);
        }
        removed
    }

    /// Current subscribers of a store.
    pub fn subscribers(&self, store_id: &str) -> Vec<ConnectionHandle> {
        self.inner
            .read()
            .subscribers
            .get(store_id)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of stores `conn` is subscribed to.
    pub fn subscription_count(&self, conn: ConnId) -> usize {
        self.inner
            .read()
            .subscribers
            .values()
            .filter(|subs| subs.contains_key(&conn))
            .count()
    }

    // ========== Pending forwards ==========

    /// Look up the host of `store_id` and record a pending forward against it.
    ///
    /// Lookup and insertion share one guard, so a forward is never recorded
    /// against a host that has already been removed.
    pub fn begin_forward(&self, mut pending: PendingForward) -> Result<(u64, ConnectionHandle)> {
        let mut idx = self.inner.write();
        let host = idx
            .hosts
            .get(&pending.store_id)
            .map(|h| h.handle.clone())
            .ok_or_else(|| BridgeError::StoreNotFound(pending.store_id.clone()))?;

        idx.forward_seq += 1;
        let forward_id = idx.forward_seq;
        pending.forward_id = forward_id;
        pending.host = host.id();
        idx.pending.insert(forward_id, pending);
        Ok((forward_id, host))
    }

    /// Remove and return a pending forward.
    pub fn take_forward(&self, forward_id: u64) -> Option<PendingForward> {
        self.inner.write().pending.remove(&forward_id)
    }

    /// Whether a forward is still outstanding.
    pub fn has_forward(&self, forward_id: u64) -> bool {
        self.inner.read().pending.contains_key(&forward_id)
    }

    /// Outstanding forward ids issued by `conn`.
    pub fn forwards_of(&self, conn: ConnId) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .inner
            .read()
            .pending
            .values()
            .filter(|p| p.caller == conn)
            .map(|p| p.forward_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of outstanding forwards.
    pub fn pending_count(&self) -> usize {
        self.inner.read().pending.len()
    }

    // ========== Cleanup ==========

    /// Remove every entry that references `conn`.
    ///
    /// Sweeps hosts (with their page indexes), subscriber sets, and pending
    /// forwards in one write guard. Forwards `conn` issued are dropped
    /// silently; forwards other callers sent to `conn` as a host are returned
    /// in [`Removal::stranded`] so they can fail fast. Idempotent.
    pub fn remove_connection(&self, conn: ConnId) -> Removal {
        let mut idx = self.inner.write();
        let mut removal = Removal::default();

        let hosted: Vec<StoreId> = idx
            .hosts
            .iter()
            .filter(|(_, h)| h.handle.id() == conn)
            .map(|(id, _)| id.clone())
            .collect();
        for store_id in &hosted {
            if let Some(host) = idx.hosts.remove(store_id) {
                idx.unindex_host(&host);
            }
        }
        removal.hosted = hosted;

        idx.subscribers.retain(|_, subs| {
            if subs.remove(&conn).is_some() {
                removal.subscriptions += 1;
            }
            !subs.is_empty()
        });

        removal.abandoned = idx.take_forwards_where(|p| p.caller == conn).len();
        removal.stranded = idx.take_forwards_where(|p| p.host == conn);

        removal
    }
}

impl Clone for ConnectionRegistry {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn handle() -> (ConnectionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (ConnectionHandle::new(ConnId::next(), tx), rx)
    }

    fn host(h: &ConnectionHandle, store_id: &str, page_id: &str, key: Option<&str>) -> HostConnection {
        HostConnection::new(
            h.clone(),
            store_id.to_string(),
            page_id.to_string(),
            key.map(str::to_string),
            None,
            json!({"count": 0}),
        )
    }

    fn pending(caller: ConnId, store_id: &str) -> (PendingForward, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + Duration::from_secs(5);
        (
            PendingForward::new(caller, Some(RpcId::Num(7)), store_id.to_string(), deadline, tx),
            rx,
        )
    }

    fn change(store_id: &str, version: u64, forward_id: Option<u64>) -> StateChangedPayload {
        StateChangedPayload {
            store_id: store_id.to_string(),
            state: json!({"count": version}),
            version,
            source: None,
            forward_id,
        }
    }

    #[test]
    fn test_set_and_get_host() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = handle();
        registry.set_host(host(&h, "demo#ab12cd", "demo", Some("main")));

        let got = registry.get_host("demo#ab12cd").unwrap();
        assert_eq!(got.version, 0);
        assert_eq!(got.state["count"], 0);
        assert_eq!(
            registry.resolve_by_page_and_key("demo", "main").as_deref(),
            Some("demo#ab12cd")
        );
        assert_eq!(registry.list_stores_under_page("demo"), vec!["demo#ab12cd".to_string()]);
    }

    #[test]
    fn test_replacement_unindexes_previous_owner() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = handle();
        let (b, _rb) = handle();

        registry.set_host(host(&a, "s#1", "page-a", Some("main")));
        let replaced = registry.set_host(host(&b, "s#1", "page-b", Some("other")));

        assert_eq!(replaced.previous, Some(a.id()));
        assert_eq!(registry.get_host("s#1").unwrap().handle.id(), b.id());
        assert!(registry.resolve_by_page_and_key("page-a", "main").is_none());
        assert!(registry.list_stores_under_page("page-a").is_empty());
        assert_eq!(
            registry.resolve_by_page_and_key("page-b", "other").as_deref(),
            Some("s#1")
        );
        assert_eq!(registry.list_stores().len(), 1);
    }

    #[test]
    fn test_replacement_strands_forwards_of_old_host() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = handle();
        let (b, _rb) = handle();
        let caller = ConnId::next();

        registry.set_host(host(&a, "s#1", "p", None));
        let (p, _rx) = pending(caller, "s#1");
        let (fid, _) = registry.begin_forward(p).unwrap();

        let replaced = registry.set_host(host(&b, "s#1", "p", None));
        assert_eq!(replaced.stranded.len(), 1);
        assert_eq!(replaced.stranded[0].forward_id, fid);
        assert!(!registry.has_forward(fid));
    }

    #[test]
    fn test_reregistration_by_same_connection_keeps_forwards() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = handle();
        registry.set_host(host(&a, "s#1", "p", None));
        let (p, _rx) = pending(ConnId::next(), "s#1");
        let (fid, _) = registry.begin_forward(p).unwrap();

        let replaced = registry.set_host(host(&a, "s#1", "p", None));
        assert!(replaced.stranded.is_empty());
        assert!(registry.has_forward(fid));
    }

    #[test]
    fn test_key_claimed_by_newer_store_survives_old_removal() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = handle();
        let (b, _rb) = handle();
        registry.set_host(host(&a, "p#old", "p", Some("main")));
        registry.set_host(host(&b, "p#new", "p", Some("main")));

        registry.remove_connection(a.id());
        assert_eq!(registry.resolve_by_page_and_key("p", "main").as_deref(), Some("p#new"));
        assert_eq!(registry.list_stores_under_page("p"), vec!["p#new".to_string()]);
    }

    #[test]
    fn test_remove_connection_cleans_every_index() {
        let registry = ConnectionRegistry::new();
        let (host_h, _rh) = handle();
        let (sub_h, _rs) = handle();

        registry.set_host(host(&host_h, "s#1", "p", Some("main")));
        registry.add_subscriber("s#1", sub_h.clone());
        registry.add_subscriber("s#2", sub_h.clone());
        let (p, _rx) = pending(sub_h.id(), "s#1");
        registry.begin_forward(p).unwrap();

        let removal = registry.remove_connection(sub_h.id());
        assert_eq!(removal.subscriptions, 2);
        assert_eq!(removal.abandoned, 1);
        assert!(registry.subscribers("s#1").is_empty());
        assert!(registry.forwards_of(sub_h.id()).is_empty());
        assert_eq!(registry.subscription_count(sub_h.id()), 0);

        assert_eq!(registry.stores_hosted_by(host_h.id()), vec!["s#1".to_string()]);
        let removal = registry.remove_connection(host_h.id());
        assert!(registry.stores_hosted_by(host_h.id()).is_empty());
        assert_eq!(removal.hosted, vec!["s#1".to_string()]);
        assert!(registry.get_host("s#1").is_none());
        assert!(registry.resolve_by_page_and_key("p", "main").is_none());
        assert!(registry.list_stores_under_page("p").is_empty());
    }

    #[test]
    fn test_remove_connection_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = handle();
        registry.set_host(host(&h, "s#1", "p", None));

        assert!(!registry.remove_connection(h.id()).is_empty());
        assert!(registry.remove_connection(h.id()).is_empty());
    }

    #[test]
    fn test_host_removal_strands_forwards_sent_to_it() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = handle();
        registry.set_host(host(&h, "s#1", "p", None));
        let (p, _reply) = pending(ConnId::next(), "s#1");
        let (fid, _) = registry.begin_forward(p).unwrap();

        let removal = registry.remove_connection(h.id());
        assert_eq!(removal.stranded.len(), 1);
        assert_eq!(removal.stranded[0].forward_id, fid);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_begin_forward_without_host_fails() {
        let registry = ConnectionRegistry::new();
        let (p, _rx) = pending(ConnId::next(), "missing#1");
        let err = registry.begin_forward(p).unwrap_err();
        assert!(matches!(err, BridgeError::StoreNotFound(_)));
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_forward_ids_increase() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = handle();
        registry.set_host(host(&h, "s#1", "p", None));
        let (p1, _r1) = pending(ConnId::next(), "s#1");
        let (p2, _r2) = pending(ConnId::next(), "s#1");
        let (f1, _) = registry.begin_forward(p1).unwrap();
        let (f2, _) = registry.begin_forward(p2).unwrap();
        assert!(f2 > f1);
    }

    #[test]
    fn test_version_never_decreases() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = handle();
        registry.set_host(host(&h, "s#1", "p", None));

        assert!(matches!(
            registry.record_state_change(h.id(), &change("s#1", 3, None)),
            StateChange::Accepted { .. }
        ));
        assert!(matches!(
            registry.record_state_change(h.id(), &change("s#1", 2, None)),
            StateChange::Stale { cached: 3 }
        ));
        assert_eq!(registry.snapshot("s#1").unwrap().version, 3);
    }

    #[test]
    fn test_only_owner_advances_state() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = handle();
        registry.set_host(host(&h, "s#1", "p", None));

        let outcome = registry.record_state_change(ConnId::next(), &change("s#1", 5, None));
        assert!(matches!(outcome, StateChange::NotOwner));
        assert!(matches!(
            registry.record_state_change(h.id(), &change("nope", 1, None)),
            StateChange::UnknownStore
        ));
        assert_eq!(registry.snapshot("s#1").unwrap().version, 0);
    }

    #[test]
    fn test_tagged_change_resolves_its_forward() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = handle();
        let (sub, _rs) = handle();
        registry.set_host(host(&h, "s#1", "p", None));
        registry.add_subscriber("s#1", sub.clone());
        let (p, _reply) = pending(ConnId::next(), "s#1");
        let (fid, _) = registry.begin_forward(p).unwrap();

        match registry.record_state_change(h.id(), &change("s#1", 1, Some(fid))) {
            StateChange::Accepted { subscribers, resolved } => {
                assert_eq!(subscribers, vec![sub]);
                assert_eq!(resolved.unwrap().forward_id, fid);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!registry.has_forward(fid));
    }

    #[test]
    fn test_subscriber_set_semantics() {
        let registry = ConnectionRegistry::new();
        let (sub, _rx) = handle();
        assert!(registry.add_subscriber("s#1", sub.clone()));
        assert!(!registry.add_subscriber("s#1", sub.clone()));
        assert_eq!(registry.subscribers("s#1").len(), 1);
        assert!(registry.remove_subscriber("s#1", sub.id()));
        assert!(!registry.remove_subscriber("s#1", sub.id()));
    }

    #[test]
    fn test_clone_shares_indexes() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = handle();
        let other = registry.clone();
        registry.set_host(host(&h, "s#1", "p", None));
        assert!(other.get_host("s#1").is_some());
    }
}
