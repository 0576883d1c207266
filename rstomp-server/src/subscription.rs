//! Subscriptions and acknowledgement tracking.

use crate::session::{ConnectionHandle, ConnectionId};
use parking_lot::Mutex;
use rstomp_protocol::headers;
use rstomp_protocol::Frame;
use std::collections::VecDeque;
use std::fmt;

/// How delivered messages must be acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckMode {
    /// No acknowledgement; messages are forgotten once written.
    Auto,
    /// Cumulative: acknowledging a message covers every earlier one.
    Client,
    /// Each message is acknowledged on its own.
    ClientIndividual,
}

impl AckMode {
    /// Parses an `ack` header. A missing header means `auto`.
    pub fn parse(value: Option<&str>) -> Option<Self> {
        match value {
            None | Some("auto") => Some(AckMode::Auto),
            Some("client") => Some(AckMode::Client),
            Some("client-individual") => Some(AckMode::ClientIndividual),
            Some(_) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages surfaced by a single ACK or NACK.
#[derive(Debug, Clone)]
pub struct Acknowledgement {
    pub connection: ConnectionHandle,
    pub subscription_id: String,
    pub destination: String,
    pub ack_mode: AckMode,
    /// Acknowledged MESSAGE frames in delivery order.
    pub frames: Vec<Frame>,
}

/// A client's subscription to a destination.
pub struct Subscription {
    connection: ConnectionHandle,
    id: String,
    destination: String,
    ack_mode: AckMode,
    pending: Mutex<VecDeque<Frame>>,
}

impl Subscription {
    pub fn new(
        connection: ConnectionHandle,
        id: impl Into<String>,
        destination: impl Into<String>,
        ack_mode: AckMode,
    ) -> Self {
        Self {
            connection,
            id: id.into(),
            destination: destination.into(),
            ack_mode,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Whether this subscription belongs to `connection` and has id `id`.
    pub fn is(&self, connection: ConnectionId, id: &str) -> bool {
        self.connection.id() == connection && self.id == id
    }

    /// Writes a MESSAGE to the subscriber, tracking it when acks are required.
    pub fn deliver(&self, message: Frame) -> bool {
        if self.ack_mode != AckMode::Auto {
            self.pending.lock().push_back(message.clone());
        }
        self.connection.write(message)
    }

    /// Whether `message_id` is awaiting acknowledgement.
    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending
            .lock()
            .iter()
            .any(|f| f.header(headers::MESSAGE_ID) == Some(message_id))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.pending
            .lock()
            .iter()
            .filter_map(|f| f.header(headers::MESSAGE_ID).map(str::to_string))
            .collect()
    }

    /// Removes and returns the messages covered by acknowledging `message_id`.
    ///
    /// Client mode takes every message up to and including the match, client
    /// individual mode only the match. Returns `None` when the id is not
    /// pending, leaving the pending list unchanged.
    pub fn acknowledge(&self, message_id: &str) -> Option<Acknowledgement> {
        let mut pending = self.pending.lock();
        let pos = pending
            .iter()
            .position(|f| f.header(headers::MESSAGE_ID) == Some(message_id))?;

        let frames: Vec<Frame> = match self.ack_mode {
            AckMode::Client => pending.drain(..=pos).collect(),
            AckMode::ClientIndividual => pending.remove(pos).into_iter().collect(),
            AckMode::Auto => return None,
        };
        drop(pending);

        Some(Acknowledgement {
            connection: self.connection.clone(),
            subscription_id: self.id.clone(),
            destination: self.destination.clone(),
            ack_mode: self.ack_mode,
            frames,
        })
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("connection", &self.connection.id())
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("ack_mode", &self.ack_mode)
            .field("pending", &self.pending_count())
            .finish()
    }
}
