//! The publish/subscribe bus.
//!
//! A plain `broadcast::Sender` per channel isn't quite enough here: callers
//! need explicit per-subscriber eviction on a failed send and an exact
//! subscriber count, and `broadcast` can give neither (a lagging receiver
//! can only ever be told it lagged, never be dropped by the sender, and
//! subscriber counts become approximate once drops have happened). So each
//! channel holds a `Vec` of individually addressable subscribers, each
//! backed by its own `mpsc::UnboundedSender`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::instrument;

/// Opaque per-connection subscriber identity, handed back by `Bus::register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SubscriberId(u64);

/// `{"channel": ..., "message": ...}`, written back out on a subscriber's
/// socket by its connection task.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct BusMessage {
    pub(crate) channel: String,
    pub(crate) message: Value,
}

struct Subscription {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<BusMessage>,
}

struct State {
    channels: HashMap<String, Vec<Subscription>>,
}

/// Named channels, subscriber registration, and best-effort fan-out.
#[derive(Clone)]
pub(crate) struct Bus {
    shared: Arc<Mutex<State>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus").finish_non_exhaustive()
    }
}

impl Bus {
    pub(crate) fn new() -> Bus {
        Bus {
            shared: Arc::new(Mutex::new(State {
                channels: HashMap::new(),
            })),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Allocates a fresh subscriber identity for a connection. Call once per
    /// connection and reuse the id across all of that connection's
    /// `subscribe`/`unsubscribe` calls.
    pub(crate) fn new_subscriber_id(&self) -> SubscriberId {
        SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Adds `id` to `channel`'s subscriber set (idempotent: re-subscribing
    /// replaces the previous sender for that id rather than duplicating it).
    #[instrument(skip(self, tx))]
    pub(crate) fn subscribe(&self, channel: &str, id: SubscriberId, tx: mpsc::UnboundedSender<BusMessage>) {
        let mut state = self.shared.lock().unwrap();
        let subs = state.channels.entry(channel.to_string()).or_default();
        subs.retain(|s| s.id != id);
        subs.push(Subscription { id, tx });
    }

    /// Removes the `(channel, id)` pair. Drops the channel entirely once its
    /// subscriber set is empty — a channel with no subscribers does not
    /// exist. Returns whether anything changed.
    #[instrument(skip(self))]
    pub(crate) fn unsubscribe(&self, channel: &str, id: SubscriberId) -> bool {
        let mut state = self.shared.lock().unwrap();
        let Some(subs) = state.channels.get_mut(channel) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != id);
        let changed = subs.len() != before;
        if subs.is_empty() {
            state.channels.remove(channel);
        }
        changed
    }

    /// Removes `id` from every channel it is subscribed to. Used when a
    /// connection disconnects.
    pub(crate) fn unsubscribe_all(&self, id: SubscriberId) {
        let mut state = self.shared.lock().unwrap();
        state.channels.retain(|_, subs| {
            subs.retain(|s| s.id != id);
            !subs.is_empty()
        });
    }

    /// Attempts delivery to every current subscriber of `channel` while
    /// holding the bus lock; subscribers whose send fails are evicted before
    /// this call returns. Returns whether the channel existed at entry —
    /// *not* whether delivery succeeded to anyone, so a publish to a channel
    /// with zero subscribers reports failure even though nothing errored.
    #[instrument(skip(self, message))]
    pub(crate) fn publish(&self, channel: &str, message: Value) -> bool {
        let mut state = self.shared.lock().unwrap();
        let Some(subs) = state.channels.get_mut(channel) else {
            return false;
        };

        subs.retain(|sub| {
            sub.tx
                .send(BusMessage {
                    channel: channel.to_string(),
                    message: message.clone(),
                })
                .is_ok()
        });

        if subs.is_empty() {
            state.channels.remove(channel);
        }

        true
    }

    /// Publishes `message` to every currently existing channel.
    pub(crate) fn broadcast(&self, message: Value) {
        let channels = {
            let state = self.shared.lock().unwrap();
            state.channels.keys().cloned().collect::<Vec<_>>()
        };
        for channel in channels {
            self.publish(&channel, message.clone());
        }
    }

    pub(crate) fn list_channels(&self) -> Vec<String> {
        self.shared.lock().unwrap().channels.keys().cloned().collect()
    }

    pub(crate) fn list_subscribers(&self, channel: &str) -> usize {
        self.shared
            .lock()
            .unwrap()
            .channels
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publish_with_no_subscribers_reports_not_found() {
        let bus = Bus::new();
        assert!(!bus.publish("news", json!("hi")));
    }

    #[test]
    fn subscribe_then_publish_delivers() {
        let bus = Bus::new();
        let id = bus.new_subscriber_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("news", id, tx);

        assert!(bus.publish("news", json!("hi")));
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.channel, "news");
        assert_eq!(msg.message, json!("hi"));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = Bus::new();
        let id = bus.new_subscriber_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("news", id, tx);
        assert!(bus.unsubscribe("news", id));

        assert!(!bus.publish("news", json!("hi")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dead_subscriber_is_evicted_on_publish() {
        let bus = Bus::new();
        let id = bus.new_subscriber_id();
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe("news", id, tx);
        drop(rx);

        assert!(bus.publish("news", json!("hi")));
        assert_eq!(bus.list_subscribers("news"), 0);
    }

    #[test]
    fn list_subscribers_counts_live_connections() {
        let bus = Bus::new();
        assert_eq!(bus.list_subscribers("news"), 0);

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        bus.subscribe("news", bus.new_subscriber_id(), tx1);
        bus.subscribe("news", bus.new_subscriber_id(), tx2);

        assert_eq!(bus.list_subscribers("news"), 2);
    }

    #[test]
    fn broadcast_publishes_to_every_channel() {
        let bus = Bus::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        bus.subscribe("a", bus.new_subscriber_id(), tx_a);
        bus.subscribe("b", bus.new_subscriber_id(), tx_b);

        bus.broadcast(json!("hello"));

        assert_eq!(rx_a.try_recv().unwrap().message, json!("hello"));
        assert_eq!(rx_b.try_recv().unwrap().message, json!("hello"));
    }
}
