//! Destination registry shared by all connections of a server.

use crate::destination::{Destination, DestinationFactory, TopicFactory};
use crate::error::ServerError;
use crate::session::ConnectionId;
use crate::subscription::{Acknowledgement, Subscription};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Exact-address destinations plus pattern destinations.
///
/// Pattern destinations (bridges, custom destinations matching many
/// addresses) are consulted first, in registration order, and live as long as
/// the registry. Exact destinations are created by the factory on first
/// SUBSCRIBE and removed once their last subscription goes away.
pub struct DestinationRegistry {
    destinations: DashMap<String, Arc<Destination>>,
    patterns: RwLock<Vec<Arc<Destination>>>,
    factory: Arc<dyn DestinationFactory>,
}

impl DestinationRegistry {
    pub fn new(factory: Arc<dyn DestinationFactory>) -> Self {
        Self {
            destinations: DashMap::new(),
            patterns: RwLock::new(Vec::new()),
            factory,
        }
    }

    pub fn set_factory(&mut self, factory: Arc<dyn DestinationFactory>) {
        self.factory = factory;
    }

    /// Registers a destination matched through [`Destination::matches`].
    pub fn add_pattern(&self, destination: Destination) {
        self.patterns.write().push(Arc::new(destination));
    }

    fn find_pattern(&self, address: &str) -> Option<Arc<Destination>> {
        self.patterns
            .read()
            .iter()
            .find(|d| d.matches(address))
            .cloned()
    }

    /// Finds the destination for `address` without creating it.
    pub fn lookup(&self, address: &str) -> Option<Arc<Destination>> {
        self.find_pattern(address)
            .or_else(|| self.destinations.get(address).map(|d| d.clone()))
    }

    /// Subscribes, creating the destination through the factory if needed.
    pub fn subscribe(&self, subscription: Subscription) -> Result<(), ServerError> {
        let address = subscription.destination().to_string();
        if let Some(pattern) = self.find_pattern(&address) {
            return pattern.subscribe(subscription);
        }

        // the entry guard keeps a concurrent unsubscribe from dropping the destination
        match self.destinations.entry(address.clone()) {
            Entry::Occupied(entry) => entry.get().subscribe(subscription),
            Entry::Vacant(entry) => {
                let destination = self
                    .factory
                    .create(&address)
                    .ok_or_else(|| ServerError::DestinationRejected(address.clone()))?;
                debug!("Created {} destination {}", destination.kind(), address);
                let destination = entry.insert(Arc::new(destination));
                destination.subscribe(subscription)
            }
        }
    }

    /// Removes subscription `id` of `connection` from `address`.
    pub fn unsubscribe(&self, address: &str, connection: ConnectionId, id: &str) -> bool {
        if let Some(pattern) = self.find_pattern(address) {
            return pattern.unsubscribe(connection, id);
        }
        let removed = match self.destinations.get(address) {
            Some(destination) => destination.unsubscribe(connection, id),
            None => false,
        };
        if removed {
            self.evict_if_empty(address);
        }
        removed
    }

    /// Removes every subscription of `connection` everywhere.
    pub fn unsubscribe_connection(&self, connection: ConnectionId) -> usize {
        let mut removed: usize = self
            .patterns
            .read()
            .iter()
            .map(|d| d.unsubscribe_connection(connection))
            .sum();

        let addresses: Vec<String> = self
            .destinations
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for address in addresses {
            let count = self
                .destinations
                .get(&address)
                .map(|d| d.unsubscribe_connection(connection))
                .unwrap_or(0);
            if count > 0 {
                removed += count;
                self.evict_if_empty(&address);
            }
        }
        removed
    }

    fn evict_if_empty(&self, address: &str) {
        if self
            .destinations
            .remove_if(address, |_, d| d.is_empty())
            .is_some()
        {
            debug!("Removed empty destination {}", address);
        }
    }

    /// Acknowledges `message_id` for `connection` on whichever destination holds it.
    pub fn acknowledge(
        &self,
        connection: ConnectionId,
        message_id: &str,
    ) -> Option<Acknowledgement> {
        if let Some(ack) = self
            .patterns
            .read()
            .iter()
            .find_map(|d| d.acknowledge(connection, message_id))
        {
            return Some(ack);
        }
        self.destinations
            .iter()
            .find_map(|d| d.acknowledge(connection, message_id))
    }

    /// Number of exact-address destinations.
    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    /// Snapshot of every destination, patterns first.
    pub fn destinations(&self) -> Vec<Arc<Destination>> {
        let mut all: Vec<_> = self.patterns.read().clone();
        all.extend(self.destinations.iter().map(|d| d.clone()));
        all
    }

    pub fn subscription_count(&self) -> usize {
        self.destinations().iter().map(|d| d.subscription_count()).sum()
    }
}

impl Default for DestinationRegistry {
    fn default() -> Self {
        Self::new(Arc::new(TopicFactory))
    }
}
