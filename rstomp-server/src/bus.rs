//! Publish/subscribe bus that bridged destinations forward to.

use bytes::Bytes;
use dashmap::DashMap;
use rstomp_protocol::Headers;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A message travelling on the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub address: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl BusMessage {
    pub fn new(address: impl Into<String>, headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            address: address.into(),
            headers,
            body: body.into(),
        }
    }

    /// Body parsed as JSON, if it is JSON.
    pub fn json_body(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// External publish/subscribe system.
pub trait MessageBus: Send + Sync {
    /// Publishes a message. Returns the number of receivers reached.
    fn publish(&self, message: BusMessage) -> usize;

    /// Opens a receiver for every message published to `address`.
    fn subscribe(&self, address: &str) -> broadcast::Receiver<BusMessage>;
}

/// In-process bus with one broadcast channel per address.
pub struct LocalBus {
    channels: DashMap<String, broadcast::Sender<BusMessage>>,
    channel_capacity: usize,
}

impl LocalBus {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            channel_capacity,
        }
    }

    /// Number of addresses with an open channel.
    pub fn address_count(&self) -> usize {
        self.channels.len()
    }

    /// Drops channels nobody listens to anymore.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, message: BusMessage) -> usize {
        match self.channels.get(&message.address) {
            // Ignore send errors (no receivers)
            Some(sender) => sender.send(message).unwrap_or(0),
            None => 0,
        }
    }

    fn subscribe(&self, address: &str) -> broadcast::Receiver<BusMessage> {
        self.channels
            .entry(address.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe()
    }
}

/// Creates a shared in-process bus.
pub fn create_local_bus(channel_capacity: usize) -> Arc<LocalBus> {
    Arc::new(LocalBus::new(channel_capacity))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = LocalBus::default();
        let mut rx = bus.subscribe("orders");

        let delivered = bus.publish(BusMessage::new("orders", Headers::new(), "hello"));
        assert_eq!(delivered, 1);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.address, "orders");
        assert_eq!(msg.body.as_ref(), b"hello");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = LocalBus::default();
        assert_eq!(bus.publish(BusMessage::new("nobody", Headers::new(), "x")), 0);
    }

    #[test]
    fn test_prune() {
        let bus = LocalBus::default();
        let rx = bus.subscribe("a");
        let _keep = bus.subscribe("b");
        assert_eq!(bus.address_count(), 2);
        drop(rx);
        bus.prune();
        assert_eq!(bus.address_count(), 1);
    }

    #[test]
    fn test_json_body() {
        let msg = BusMessage::new("a", Headers::new(), r#"{"kind":"order"}"#);
        assert_eq!(msg.json_body().unwrap()["kind"], "order");
        let msg = BusMessage::new("a", Headers::new(), "not json");
        assert!(msg.json_body().is_none());
    }
}
