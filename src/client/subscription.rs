//! Subscription handling for state-change notifications.
//!
//! A [`Subscription`] receives the `store.stateChanged` notifications pushed
//! by the gateway to a [`BridgeClient`](super::BridgeClient). Notifications
//! for every store the client subscribed to arrive on the same stream, in the
//! order the gateway sent them.
//!
//! # Examples
//!
//! ```ignore
//! use store_bridge::client::BridgeClient;
//! use futures::stream::StreamExt;
//!
//! let client = BridgeClient::connect("ws://localhost:8787/_bridge").await?;
//! let mut changes = client.notifications().expect("first call");
//! client.subscribe("demo#ab12cd").await?;
//!
//! while let Some(change) = changes.next().await {
//!     println!("{} -> v{}", change.store_id, change.version);
//! }
//! ```

use crate::protocol::rpc::StateChangedParams;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// A live feed of `store.stateChanged` notifications.
///
/// Ends (yields `None`) when the underlying connection closes.
pub struct Subscription {
    receiver: mpsc::Receiver<StateChangedParams>,
}

impl Subscription {
    /// Create a subscription from a receiver channel.
    pub fn new(receiver: mpsc::Receiver<StateChangedParams>) -> Self {
        Subscription { receiver }
    }

    /// Receive the next notification.
    pub async fn next(&mut self) -> Option<StateChangedParams> {
        self.receiver.recv().await
    }

    /// Receive the next notification for `store_id`, skipping others.
    pub async fn next_for(&mut self, store_id: &str) -> Option<StateChangedParams> {
        while let Some(change) = self.receiver.recv().await {
            if change.store_id == store_id {
                return Some(change);
            }
        }
        None
    }
}

impl Stream for Subscription {
    type Item = StateChangedParams;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn change(store_id: &str, version: u64) -> StateChangedParams {
        StateChangedParams {
            store_id: store_id.into(),
            version,
            state: json!({"count": version}),
        }
    }

    #[tokio::test]
    async fn test_subscription_yields_in_order() {
        let (tx, rx) = mpsc::channel(10);
        let mut subscription = Subscription::new(rx);

        tx.send(change("a#1", 1)).await.unwrap();
        tx.send(change("a#1", 2)).await.unwrap();
        drop(tx);

        assert_eq!(subscription.next().await.unwrap().version, 1);
        assert_eq!(StreamExt::next(&mut subscription).await.unwrap().version, 2);
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn test_next_for_skips_other_stores() {
        let (tx, rx) = mpsc::channel(10);
        let mut subscription = Subscription::new(rx);

        tx.send(change("b#1", 4)).await.unwrap();
        tx.send(change("a#1", 7)).await.unwrap();

        let got = subscription.next_for("a#1").await.unwrap();
        assert_eq!(got.version, 7);
    }
}
