//! Bridge between STOMP destinations and an external [`MessageBus`].
//!
//! Clients SEND to permitted inbound addresses and the frame is published on
//! the bus. Clients SUBSCRIBE to permitted outbound addresses and bus messages
//! published there are delivered as MESSAGE frames. A forwarder task per
//! address runs while the address has at least one subscription.

use crate::bus::{BusMessage, MessageBus};
use crate::error::ServerError;
use crate::session::{ConnectionHandle, ConnectionId};
use crate::subscription::{AckMode, Acknowledgement, Subscription};
use parking_lot::Mutex;
use regex::Regex;
use rstomp_protocol::{headers, Frame, Headers};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// One permitted address entry, as written in configuration.
///
/// An entry without `address` and `address_regex` permits every address.
/// `match` is a JSON value the message body must structurally contain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermittedOptions {
    pub address: Option<String>,
    pub address_regex: Option<String>,
    #[serde(rename = "match")]
    pub match_body: Option<Value>,
}

impl PermittedOptions {
    pub fn address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }

    pub fn address_regex(pattern: impl Into<String>) -> Self {
        Self {
            address_regex: Some(pattern.into()),
            ..Default::default()
        }
    }

    pub fn with_match(mut self, value: Value) -> Self {
        self.match_body = Some(value);
        self
    }

    /// Compiles the entry. The regex must match the whole address.
    pub fn compile(&self) -> Result<Permission, regex::Error> {
        let regex = match &self.address_regex {
            Some(pattern) => Some(Regex::new(&format!("^(?:{})$", pattern))?),
            None => None,
        };
        Ok(Permission {
            address: self.address.clone(),
            regex,
            match_body: self.match_body.clone(),
        })
    }
}

/// A compiled [`PermittedOptions`].
#[derive(Debug, Clone)]
pub struct Permission {
    address: Option<String>,
    regex: Option<Regex>,
    match_body: Option<Value>,
}

impl Permission {
    pub fn accepts_address(&self, address: &str) -> bool {
        if let Some(expected) = &self.address {
            if expected != address {
                return false;
            }
        }
        if let Some(regex) = &self.regex {
            if !regex.is_match(address) {
                return false;
            }
        }
        true
    }

    /// Checks the address and, when a `match` is configured, the JSON body.
    pub fn accepts(&self, address: &str, body: Option<&[u8]>) -> bool {
        if !self.accepts_address(address) {
            return false;
        }
        match &self.match_body {
            None => true,
            Some(expected) => body
                .and_then(|b| serde_json::from_slice::<Value>(b).ok())
                .map(|actual| json_contains(&actual, expected))
                .unwrap_or(false),
        }
    }
}

/// Whether `actual` contains every field of `expected`, recursively.
fn json_contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => expected
            .iter()
            .all(|(k, v)| actual.get(k).is_some_and(|a| json_contains(a, v))),
        _ => actual == expected,
    }
}

/// Bridge settings.
#[derive(Debug, Clone, Default)]
pub struct BridgeOptions {
    pub inbound: Vec<PermittedOptions>,
    pub outbound: Vec<PermittedOptions>,
    /// Deliver each bus message to one subscription instead of all.
    pub point_to_point: bool,
}

impl BridgeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_inbound(mut self, permitted: PermittedOptions) -> Self {
        self.inbound.push(permitted);
        self
    }

    pub fn add_outbound(mut self, permitted: PermittedOptions) -> Self {
        self.outbound.push(permitted);
        self
    }

    pub fn with_point_to_point(mut self, point_to_point: bool) -> Self {
        self.point_to_point = point_to_point;
        self
    }
}

struct AddressState {
    subscriptions: Vec<Arc<Subscription>>,
    last_used: Option<usize>,
    forwarder: Option<JoinHandle<()>>,
}

impl AddressState {
    fn targets(&mut self, point_to_point: bool) -> Vec<Arc<Subscription>> {
        if !point_to_point {
            return self.subscriptions.clone();
        }
        if self.subscriptions.is_empty() {
            return Vec::new();
        }
        let count = self.subscriptions.len();
        let start = self.last_used.map_or(0, |i| (i + 1) % count);
        let next = (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&i| self.subscriptions[i].connection().is_writable())
            .unwrap_or(start);
        self.last_used = Some(next);
        vec![self.subscriptions[next].clone()]
    }

    fn remove_where(&mut self, predicate: impl Fn(&Subscription) -> bool) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| !predicate(s));
        // restart rotation on churn
        if self.subscriptions.len() != before {
            self.last_used = None;
        }
        before - self.subscriptions.len()
    }
}

impl Drop for AddressState {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

struct BridgeInner {
    name: String,
    bus: Arc<dyn MessageBus>,
    inbound: Vec<Permission>,
    outbound: Vec<Permission>,
    point_to_point: bool,
    addresses: Mutex<HashMap<String, AddressState>>,
}

impl BridgeInner {
    fn forward(&self, message: &BusMessage) {
        if !self
            .outbound
            .iter()
            .any(|p| p.accepts(&message.address, Some(&message.body)))
        {
            debug!("Bus message on {} filtered out", message.address);
            return;
        }
        let targets = {
            let mut addresses = self.addresses.lock();
            match addresses.get_mut(&message.address) {
                Some(state) => state.targets(self.point_to_point),
                None => return,
            }
        };
        for subscription in targets {
            if !self.point_to_point && !subscription.connection().is_writable() {
                debug!(
                    "[{}] Outbound queue full, bus message on {} skipped",
                    subscription.connection().remote_addr(),
                    message.address
                );
                continue;
            }
            subscription.deliver(bus_message_to_frame(message, &subscription));
        }
    }
}

/// Converts a bus message into the MESSAGE frame for `subscription`.
fn bus_message_to_frame(message: &BusMessage, subscription: &Subscription) -> Frame {
    let message_id = Uuid::new_v4().to_string();
    let mut frame_headers = Headers::new();
    frame_headers.set(headers::SUBSCRIPTION, subscription.id());
    frame_headers.set(headers::MESSAGE_ID, message_id.as_str());
    frame_headers.set(headers::DESTINATION, message.address.as_str());
    if subscription.ack_mode() != AckMode::Auto {
        frame_headers.set(headers::ACK, message_id.as_str());
    }
    for (key, value) in message.headers.iter() {
        if key != headers::CONTENT_LENGTH {
            frame_headers.add(key, value);
        }
    }
    frame_headers.set(headers::CONTENT_LENGTH, message.body.len().to_string());
    Frame::message(frame_headers, Some(message.body.clone()))
}

/// Destination forwarding to and from a [`MessageBus`].
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// Creates a bridge. Fails if a permitted regex does not compile.
    pub fn new(options: BridgeOptions, bus: Arc<dyn MessageBus>) -> Result<Self, regex::Error> {
        Self::named("bridge", options, bus)
    }

    pub fn named(
        name: impl Into<String>,
        options: BridgeOptions,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Self, regex::Error> {
        let inbound = options
            .inbound
            .iter()
            .map(PermittedOptions::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let outbound = options
            .outbound
            .iter()
            .map(PermittedOptions::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            inner: Arc::new(BridgeInner {
                name: name.into(),
                bus,
                inbound,
                outbound,
                point_to_point: options.point_to_point,
                addresses: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn address(&self) -> &str {
        &self.inner.name
    }

    /// Whether any inbound or outbound entry permits `address`.
    pub fn matches(&self, address: &str) -> bool {
        self.inner
            .inbound
            .iter()
            .chain(self.inner.outbound.iter())
            .any(|p| p.accepts_address(address))
    }

    /// Publishes a SEND frame on the bus.
    pub fn dispatch(&self, source: &ConnectionHandle, frame: &Frame) -> Result<usize, ServerError> {
        let address = frame.destination().unwrap_or_default();
        let body = frame.body().map(|b| b.as_ref());
        if !self.inner.inbound.iter().any(|p| p.accepts(address, body)) {
            return Err(ServerError::AccessDenied(address.to_string()));
        }

        let mut bus_headers = frame.headers().clone();
        bus_headers.remove(headers::RECEIPT);
        bus_headers.remove(headers::TRANSACTION);
        let message = BusMessage::new(
            address,
            bus_headers,
            frame.body().cloned().unwrap_or_default(),
        );
        let reached = self.inner.bus.publish(message);
        debug!(
            "[{}] Published to bus address {} ({} receivers)",
            source.remote_addr(),
            address,
            reached
        );
        Ok(reached)
    }

    /// Adds a subscription, starting the forwarder for its address if needed.
    pub fn subscribe(&self, subscription: Subscription) -> Result<(), ServerError> {
        let address = subscription.destination().to_string();
        if !self
            .inner
            .outbound
            .iter()
            .any(|p| p.accepts_address(&address))
        {
            return Err(ServerError::AccessDenied(address));
        }

        let mut addresses = self.inner.addresses.lock();
        let state = addresses
            .entry(address.clone())
            .or_insert_with(|| AddressState {
                subscriptions: Vec::new(),
                last_used: None,
                forwarder: None,
            });
        if state.forwarder.is_none() {
            state.forwarder = Some(spawn_forwarder(
                Arc::downgrade(&self.inner),
                self.inner.bus.subscribe(&address),
                address,
            ));
        }
        state.subscriptions.push(Arc::new(subscription));
        Ok(())
    }

    pub fn unsubscribe(&self, connection: ConnectionId, id: &str) -> bool {
        self.remove_where(|s| s.is(connection, id)) > 0
    }

    pub fn unsubscribe_connection(&self, connection: ConnectionId) -> usize {
        self.remove_where(|s| s.connection_id() == connection)
    }

    fn remove_where(&self, predicate: impl Fn(&Subscription) -> bool) -> usize {
        let mut addresses = self.inner.addresses.lock();
        let removed = addresses
            .values_mut()
            .map(|state| state.remove_where(&predicate))
            .sum();
        // dropping an empty state stops its forwarder
        addresses.retain(|_, state| !state.subscriptions.is_empty());
        removed
    }

    pub fn subscription_count(&self) -> usize {
        self.inner
            .addresses
            .lock()
            .values()
            .map(|s| s.subscriptions.len())
            .sum()
    }

    /// Number of addresses with a running forwarder.
    pub fn forwarded_addresses(&self) -> usize {
        self.inner.addresses.lock().len()
    }

    pub fn acknowledge(
        &self,
        connection: ConnectionId,
        message_id: &str,
    ) -> Option<Acknowledgement> {
        let addresses = self.inner.addresses.lock();
        addresses.values().find_map(|state| {
            crate::destination::acknowledge_in(&state.subscriptions, connection, message_id)
        })
    }
}

fn spawn_forwarder(
    bridge: Weak<BridgeInner>,
    mut rx: tokio::sync::broadcast::Receiver<BusMessage>,
    address: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => match bridge.upgrade() {
                    Some(inner) => inner.forward(&message),
                    None => break,
                },
                Err(RecvError::Lagged(n)) => {
                    warn!("Bridge forwarder for {} lagged by {} messages", address, n);
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Bridge forwarder for {} stopped", address);
    })
}
