use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// Per-subscriber channel depth. Slow subscribers lose chunks rather than
/// stall the producer.
const SUBSCRIBER_BUFFER: usize = 64;

type SubscriberList = Vec<(u64, mpsc::Sender<Vec<u8>>)>;

#[derive(Debug)]
struct HubInner {
    subscribers: HashMap<String, SubscriberList>,
    next_id: u64,
}

/// Fan-out of per-server raw console bytes to any number of subscribers.
#[derive(Clone, Debug)]
pub struct BroadcastHub {
    inner: Arc<Mutex<HubInner>>,
}

impl BroadcastHub {
    /// An empty hub.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                subscribers: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Register a subscriber for `server`'s byte stream.
    ///
    /// The subscription unregisters itself when dropped.
    pub fn subscribe(&self, server: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut inner = self.inner.lock().expect("hub lock");
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .subscribers
            .entry(server.to_string())
            .or_default()
            .push((id, tx));

        Subscription {
            rx,
            hub: self.clone(),
            server: server.to_string(),
            id,
        }
    }

    /// Fan `data` out to every subscriber of `server`.
    ///
    /// Sends are non-blocking: a full subscriber channel drops this chunk for
    /// that subscriber, a closed one is pruned.
    pub fn publish(&self, server: &str, data: &[u8]) {
        let mut inner = self.inner.lock().expect("hub lock");
        let Some(subs) = inner.subscribers.get_mut(server) else {
            return;
        };

        subs.retain(|(_, tx)| match tx.try_send(data.to_vec()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true, // drop chunk, keep subscriber
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Number of live subscribers for `server`.
    pub fn subscriber_count(&self, server: &str) -> usize {
        let inner = self.inner.lock().expect("hub lock");
        inner.subscribers.get(server).map_or(0, Vec::len)
    }

    fn unsubscribe(&self, server: &str, id: u64) {
        let mut inner = self.inner.lock().expect("hub lock");
        if let Some(subs) = inner.subscribers.get_mut(server) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                inner.subscribers.remove(server);
            }
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription to one server's console stream.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Vec<u8>>,
    hub: BroadcastHub,
    server: String,
    id: u64,
}

impl Subscription {
    /// Receive the next chunk; `None` once the subscription is dead.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.server, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_after_subscribe() {
        let hub = BroadcastHub::new();

        hub.publish("srv", b"before"); // nobody listening, silently dropped

        let mut sub = hub.subscribe("srv");
        hub.publish("srv", b"one");
        hub.publish("srv", b"two");

        assert_eq!(sub.recv().await.unwrap(), b"one");
        assert_eq!(sub.recv().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn slow_subscriber_drops_chunks_without_stalling() {
        let hub = BroadcastHub::new();
        let mut sub = hub.subscribe("srv");

        // Overfill: the channel holds SUBSCRIBER_BUFFER chunks, the rest drop.
        for i in 0..(SUBSCRIBER_BUFFER + 10) {
            hub.publish("srv", format!("chunk{i}").as_bytes());
        }

        let mut received = 0;
        while sub.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
        assert_eq!(hub.subscriber_count("srv"), 1);
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let hub = BroadcastHub::new();
        let sub = hub.subscribe("srv");
        assert_eq!(hub.subscriber_count("srv"), 1);

        drop(sub);
        assert_eq!(hub.subscriber_count("srv"), 0);

        // Publishing to a server with no subscribers is a no-op.
        hub.publish("srv", b"data");
    }

    #[tokio::test]
    async fn independent_servers_do_not_cross() {
        let hub = BroadcastHub::new();
        let mut a = hub.subscribe("a");
        let mut b = hub.subscribe("b");

        hub.publish("a", b"alpha");

        assert_eq!(a.recv().await.unwrap(), b"alpha");
        assert!(b.try_recv().is_none());
    }
}
