//! Per-connection state.
//!
//! A [`Session`] is owned by the task that drives its connection, so it needs
//! no locking. Other connections reach it only through the cloneable
//! [`ConnectionHandle`], which feeds the connection's outbound queue.

use rstomp_protocol::Frame;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifier of a connection, unique within one server.
pub type ConnectionId = u64;

/// An item waiting to be written to the transport.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    Heartbeat,
}

/// Cloneable write side of a connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    session_id: Arc<str>,
    remote_addr: SocketAddr,
    tx: mpsc::UnboundedSender<Outbound>,
    queued: Arc<AtomicUsize>,
    high_water_mark: usize,
}

impl ConnectionHandle {
    /// Creates a handle and the queue the connection task drains.
    pub fn channel(
        id: ConnectionId,
        remote_addr: SocketAddr,
        high_water_mark: usize,
    ) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let handle = Self {
            id,
            session_id: Arc::from(Uuid::new_v4().to_string()),
            remote_addr,
            tx,
            queued: queued.clone(),
            high_water_mark,
        };
        (handle, OutboundQueue { rx, queued })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Session id reported in CONNECTED.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Queues a frame. Returns `false` if the connection is gone.
    pub fn write(&self, frame: Frame) -> bool {
        self.push(Outbound::Frame(frame))
    }

    /// Queues a heartbeat.
    pub fn write_heartbeat(&self) -> bool {
        self.push(Outbound::Heartbeat)
    }

    fn push(&self, item: Outbound) -> bool {
        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(item).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Whether the outbound queue is below its high-water mark.
    pub fn is_writable(&self) -> bool {
        !self.tx.is_closed() && self.queued() < self.high_water_mark
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Number of items waiting to be written.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("remote_addr", &self.remote_addr)
            .field("queued", &self.queued())
            .finish()
    }
}

/// Read side of a connection's outbound channel.
pub struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<Outbound>,
    queued: Arc<AtomicUsize>,
}

impl OutboundQueue {
    pub async fn recv(&mut self) -> Option<Outbound> {
        let item = self.rx.recv().await;
        if item.is_some() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    /// Takes an item without waiting.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        let item = self.rx.try_recv().ok();
        if item.is_some() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    /// Stops accepting new items. Already queued items can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport is up, waiting for CONNECT or STOMP.
    AwaitingConnect,
    /// Handshake complete.
    Connected,
    /// An ERROR frame was queued; the connection closes after flushing.
    Errored,
    /// DISCONNECT received or transport closed.
    Closed,
}

/// Negotiated heartbeat periods, in milliseconds (0 = disabled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatPeriods {
    pub ping: u64,
    pub pong: u64,
}

/// State of one STOMP connection.
pub struct Session {
    handle: ConnectionHandle,
    state: SessionState,
    version: Option<String>,
    login: Option<String>,
    heartbeat: HeartbeatPeriods,
    /// subscription id -> destination
    subscriptions: HashMap<String, String>,
    created_at: Instant,
    last_activity: Instant,
    frames_received: u64,
    cleaned_up: bool,
}

impl Session {
    pub fn new(handle: ConnectionHandle) -> Self {
        let now = Instant::now();
        Self {
            handle,
            state: SessionState::AwaitingConnect,
            version: None,
            login: None,
            heartbeat: HeartbeatPeriods::default(),
            subscriptions: HashMap::new(),
            created_at: now,
            last_activity: now,
            frames_received: 0,
            cleaned_up: false,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn session_id(&self) -> &str {
        self.handle.session_id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.handle.remote_addr()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Whether the connection should stop reading and close.
    pub fn is_closing(&self) -> bool {
        matches!(self.state, SessionState::Errored | SessionState::Closed)
    }

    /// Completes the handshake.
    pub fn complete_handshake(
        &mut self,
        version: String,
        login: Option<String>,
        heartbeat: HeartbeatPeriods,
    ) {
        self.version = Some(version);
        self.login = login;
        self.heartbeat = heartbeat;
        self.state = SessionState::Connected;
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn login(&self) -> Option<&str> {
        self.login.as_deref()
    }

    pub fn heartbeat(&self) -> HeartbeatPeriods {
        self.heartbeat
    }

    /// Records inbound traffic (frame or heartbeat).
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn record_frame(&mut self) {
        self.frames_received += 1;
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Registers a subscription id. Returns `false` if the id is taken.
    pub fn add_subscription(&mut self, id: &str, destination: &str) -> bool {
        if self.subscriptions.contains_key(id) {
            return false;
        }
        self.subscriptions
            .insert(id.to_string(), destination.to_string());
        true
    }

    /// Removes a subscription id, returning its destination.
    pub fn remove_subscription(&mut self, id: &str) -> Option<String> {
        self.subscriptions.remove(id)
    }

    pub fn subscription_destination(&self, id: &str) -> Option<&str> {
        self.subscriptions.get(id).map(String::as_str)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Destinations this connection subscribed to, deduplicated.
    pub fn subscribed_destinations(&self) -> Vec<String> {
        let mut destinations: Vec<String> = self.subscriptions.values().cloned().collect();
        destinations.sort();
        destinations.dedup();
        destinations
    }

    /// Marks cleanup as done. Returns `true` only on the first call.
    pub fn begin_cleanup(&mut self) -> bool {
        self.state = SessionState::Closed;
        !std::mem::replace(&mut self.cleaned_up, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstomp_protocol::Command;

    fn addr() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    #[test]
    fn test_session_lifecycle() {
        let (handle, _queue) = ConnectionHandle::channel(1, addr(), 16);
        let mut session = Session::new(handle);
        assert_eq!(session.state(), SessionState::AwaitingConnect);
        assert!(!session.is_closing());

        session.complete_handshake(
            "1.2".to_string(),
            Some("alice".to_string()),
            HeartbeatPeriods { ping: 10, pong: 20 },
        );
        assert!(session.is_connected());
        assert_eq!(session.version(), Some("1.2"));
        assert_eq!(session.login(), Some("alice"));
        assert_eq!(session.heartbeat().pong, 20);

        session.set_state(SessionState::Errored);
        assert!(session.is_closing());
    }

    #[test]
    fn test_cleanup_runs_once() {
        let (handle, _queue) = ConnectionHandle::channel(1, addr(), 16);
        let mut session = Session::new(handle);
        assert!(session.begin_cleanup());
        assert!(!session.begin_cleanup());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_subscription_ids() {
        let (handle, _queue) = ConnectionHandle::channel(1, addr(), 16);
        let mut session = Session::new(handle);
        assert!(session.add_subscription("0", "/queue/a"));
        assert!(!session.add_subscription("0", "/queue/b"));
        assert!(session.add_subscription("1", "/queue/a"));
        assert_eq!(session.subscribed_destinations(), vec!["/queue/a"]);
        assert_eq!(session.remove_subscription("0").as_deref(), Some("/queue/a"));
        assert_eq!(session.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_handle_write_and_writability() {
        let (handle, mut queue) = ConnectionHandle::channel(7, addr(), 2);
        assert!(handle.is_writable());

        assert!(handle.write(Frame::new(Command::Receipt)));
        assert!(handle.write_heartbeat());
        assert_eq!(handle.queued(), 2);
        assert!(!handle.is_writable());

        assert!(matches!(queue.recv().await, Some(Outbound::Frame(_))));
        assert!(handle.is_writable());
        assert!(matches!(queue.try_recv(), Some(Outbound::Heartbeat)));
        assert_eq!(handle.queued(), 0);
    }

    #[test]
    fn test_write_after_close() {
        let (handle, queue) = ConnectionHandle::channel(7, addr(), 2);
        drop(queue);
        assert!(handle.is_closed());
        assert!(!handle.write(Frame::new(Command::Receipt)));
        assert_eq!(handle.queued(), 0);
        assert!(!handle.is_writable());
    }

    #[test]
    fn test_handles_compare_by_id() {
        let (a, _qa) = ConnectionHandle::channel(1, addr(), 2);
        let (b, _qb) = ConnectionHandle::channel(2, addr(), 2);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_ne!(a.session_id(), b.session_id());
    }
}
