//! Destinations: routing strategies over a set of subscriptions.
//!
//! - [`Topic`] delivers every frame to every subscription.
//! - [`Queue`] delivers each frame to one subscription, round robin.
//! - [`Bridge`] forwards to and from an external [`MessageBus`](crate::bus::MessageBus).
//! - [`CustomDestination`] lets embedders plug their own routing.

use crate::bridge::Bridge;
use crate::error::ServerError;
use crate::session::{ConnectionHandle, ConnectionId};
use crate::subscription::{AckMode, Acknowledgement, Subscription};
use parking_lot::{Mutex, RwLock};
use rstomp_protocol::{headers, Frame};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A routing point clients subscribe and send to.
pub enum Destination {
    Topic(Topic),
    Queue(Queue),
    Bridge(Bridge),
    Custom(Arc<dyn CustomDestination>),
}

impl Destination {
    pub fn topic(address: impl Into<String>) -> Self {
        Destination::Topic(Topic::new(address))
    }

    pub fn queue(address: impl Into<String>) -> Self {
        Destination::Queue(Queue::new(address))
    }

    /// Address the destination was created for.
    pub fn address(&self) -> &str {
        match self {
            Destination::Topic(t) => &t.address,
            Destination::Queue(q) => &q.address,
            Destination::Bridge(b) => b.address(),
            Destination::Custom(c) => c.address(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Destination::Topic(_) => "topic",
            Destination::Queue(_) => "queue",
            Destination::Bridge(_) => "bridge",
            Destination::Custom(_) => "custom",
        }
    }

    /// Routes a SEND frame. Returns the number of subscriptions reached.
    pub fn dispatch(&self, source: &ConnectionHandle, frame: &Frame) -> Result<usize, ServerError> {
        match self {
            Destination::Topic(t) => Ok(t.dispatch(frame)),
            Destination::Queue(q) => Ok(q.dispatch(frame)),
            Destination::Bridge(b) => b.dispatch(source, frame),
            Destination::Custom(c) => c.dispatch(source, frame),
        }
    }

    pub fn subscribe(&self, subscription: Subscription) -> Result<(), ServerError> {
        match self {
            Destination::Topic(t) => {
                t.subscriptions.write().push(Arc::new(subscription));
                Ok(())
            }
            Destination::Queue(q) => {
                q.state.lock().subscriptions.push(Arc::new(subscription));
                Ok(())
            }
            Destination::Bridge(b) => b.subscribe(subscription),
            Destination::Custom(c) => c.subscribe(subscription),
        }
    }

    /// Removes the subscription `id` of `connection`.
    pub fn unsubscribe(&self, connection: ConnectionId, id: &str) -> bool {
        match self {
            Destination::Topic(t) => {
                let mut subs = t.subscriptions.write();
                let before = subs.len();
                subs.retain(|s| !s.is(connection, id));
                subs.len() != before
            }
            Destination::Queue(q) => q.remove_where(|s| s.is(connection, id)) > 0,
            Destination::Bridge(b) => b.unsubscribe(connection, id),
            Destination::Custom(c) => c.unsubscribe(connection, id),
        }
    }

    /// Removes every subscription owned by `connection`.
    pub fn unsubscribe_connection(&self, connection: ConnectionId) -> usize {
        match self {
            Destination::Topic(t) => {
                let mut subs = t.subscriptions.write();
                let before = subs.len();
                subs.retain(|s| s.connection_id() != connection);
                before - subs.len()
            }
            Destination::Queue(q) => q.remove_where(|s| s.connection_id() == connection),
            Destination::Bridge(b) => b.unsubscribe_connection(connection),
            Destination::Custom(c) => c.unsubscribe_connection(connection),
        }
    }

    pub fn subscription_count(&self) -> usize {
        match self {
            Destination::Topic(t) => t.subscriptions.read().len(),
            Destination::Queue(q) => q.state.lock().subscriptions.len(),
            Destination::Bridge(b) => b.subscription_count(),
            Destination::Custom(c) => c.subscription_count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subscription_count() == 0
    }

    /// Whether this destination handles `address`.
    pub fn matches(&self, address: &str) -> bool {
        match self {
            Destination::Bridge(b) => b.matches(address),
            Destination::Custom(c) => c.matches(address),
            _ => self.address() == address,
        }
    }

    /// Acknowledges `message_id` on the subscription of `connection` holding it.
    pub fn acknowledge(
        &self,
        connection: ConnectionId,
        message_id: &str,
    ) -> Option<Acknowledgement> {
        match self {
            Destination::Topic(t) => acknowledge_in(&t.subscriptions.read(), connection, message_id),
            Destination::Queue(q) => {
                acknowledge_in(&q.state.lock().subscriptions, connection, message_id)
            }
            Destination::Bridge(b) => b.acknowledge(connection, message_id),
            Destination::Custom(c) => c.acknowledge(connection, message_id),
        }
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("kind", &self.kind())
            .field("address", &self.address())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

pub(crate) fn acknowledge_in(
    subscriptions: &[Arc<Subscription>],
    connection: ConnectionId,
    message_id: &str,
) -> Option<Acknowledgement> {
    subscriptions
        .iter()
        .filter(|s| s.connection_id() == connection)
        .find_map(|s| s.acknowledge(message_id))
}

/// Builds the MESSAGE frame delivered to `subscription` for a SEND frame.
///
/// `receipt` and `transaction` belong to the sender and are not forwarded.
pub fn build_message(frame: &Frame, subscription: &Subscription) -> Frame {
    let mut message_headers = frame.headers().clone();
    message_headers.remove(headers::RECEIPT);
    message_headers.remove(headers::TRANSACTION);

    let message_id = Uuid::new_v4().to_string();
    message_headers.set(headers::DESTINATION, subscription.destination());
    message_headers.set(headers::SUBSCRIPTION, subscription.id());
    message_headers.set(headers::MESSAGE_ID, message_id.as_str());
    if subscription.ack_mode() != AckMode::Auto {
        message_headers.set(headers::ACK, message_id);
    } else {
        message_headers.remove(headers::ACK);
    }

    Frame::message(message_headers, frame.body().cloned())
}

/// Fan-out destination.
///
/// A subscriber whose connection is over its outbound high-water mark misses
/// the messages published while it stays there.
pub struct Topic {
    address: String,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
}

impl Topic {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    fn dispatch(&self, frame: &Frame) -> usize {
        // deliver outside the lock
        let subscriptions = self.subscriptions.read().clone();
        let mut reached = 0;
        for subscription in &subscriptions {
            let connection = subscription.connection();
            if !connection.is_writable() {
                debug!(
                    "[{}] Outbound queue full, {} skips a message on {}",
                    connection.remote_addr(),
                    subscription.id(),
                    self.address
                );
                continue;
            }
            subscription.deliver(build_message(frame, subscription));
            reached += 1;
        }
        reached
    }
}

struct QueueState {
    subscriptions: Vec<Arc<Subscription>>,
    last_used: Option<usize>,
}

/// Single-consumer destination.
///
/// Subscribers are served round robin in subscription order. A subscriber
/// whose connection is over its outbound high-water mark is skipped when
/// another one is writable; if none is writable the next one in turn gets the
/// frame anyway. Removing a subscriber keeps the rotation pointing at the
/// subscriber that would have been served next.
pub struct Queue {
    address: String,
    state: Mutex<QueueState>,
}

impl Queue {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: Mutex::new(QueueState {
                subscriptions: Vec::new(),
                last_used: None,
            }),
        }
    }

    /// Picks the subscription that receives the next frame.
    fn next_subscription(&self) -> Option<Arc<Subscription>> {
        let mut state = self.state.lock();
        let count = state.subscriptions.len();
        if count == 0 {
            return None;
        }
        let start = state.last_used.map_or(0, |i| (i + 1) % count);
        let chosen = (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&i| state.subscriptions[i].connection().is_writable())
            .unwrap_or(start);
        state.last_used = Some(chosen);
        Some(state.subscriptions[chosen].clone())
    }

    fn dispatch(&self, frame: &Frame) -> usize {
        match self.next_subscription() {
            Some(subscription) => {
                subscription.deliver(build_message(frame, &subscription));
                1
            }
            None => 0,
        }
    }

    fn remove_where(&self, predicate: impl Fn(&Subscription) -> bool) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;
        let mut i = 0;
        while i < state.subscriptions.len() {
            if !predicate(&state.subscriptions[i]) {
                i += 1;
                continue;
            }
            state.subscriptions.remove(i);
            removed += 1;
            if let Some(last) = state.last_used {
                if i <= last {
                    state.last_used = last.checked_sub(1);
                }
            }
        }
        if state.subscriptions.is_empty() {
            state.last_used = None;
        }
        removed
    }
}

/// Destination implemented outside this crate.
pub trait CustomDestination: Send + Sync {
    fn address(&self) -> &str;

    fn dispatch(&self, source: &ConnectionHandle, frame: &Frame) -> Result<usize, ServerError>;

    fn subscribe(&self, subscription: Subscription) -> Result<(), ServerError>;

    fn unsubscribe(&self, connection: ConnectionId, id: &str) -> bool;

    fn unsubscribe_connection(&self, connection: ConnectionId) -> usize;

    fn subscription_count(&self) -> usize;

    fn matches(&self, address: &str) -> bool {
        self.address() == address
    }

    fn acknowledge(&self, _connection: ConnectionId, _message_id: &str) -> Option<Acknowledgement> {
        None
    }
}

/// Creates destinations on first use. Returning `None` rejects the address.
pub trait DestinationFactory: Send + Sync {
    fn create(&self, address: &str) -> Option<Destination>;
}

impl<F> DestinationFactory for F
where
    F: Fn(&str) -> Option<Destination> + Send + Sync,
{
    fn create(&self, address: &str) -> Option<Destination> {
        self(address)
    }
}

/// Creates a topic for every address.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicFactory;

impl DestinationFactory for TopicFactory {
    fn create(&self, address: &str) -> Option<Destination> {
        Some(Destination::topic(address))
    }
}

/// Creates queues for addresses with a configured prefix and topics otherwise.
#[derive(Debug, Clone, Default)]
pub struct PrefixFactory {
    queue_prefixes: Vec<String>,
}

impl PrefixFactory {
    pub fn new(queue_prefixes: Vec<String>) -> Self {
        Self { queue_prefixes }
    }
}

impl DestinationFactory for PrefixFactory {
    fn create(&self, address: &str) -> Option<Destination> {
        if self.queue_prefixes.iter().any(|p| address.starts_with(p)) {
            Some(Destination::queue(address))
        } else {
            Some(Destination::topic(address))
        }
    }
}
