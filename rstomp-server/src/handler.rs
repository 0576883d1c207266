//! STOMP command handling.
//!
//! [`StompHandler`] holds the state shared by every connection of a server
//! (destination registry, transaction table, authenticated users) and the
//! optional hooks embedders plug in. The connection task calls
//! [`StompHandler::handle`] for each decoded frame, in order.

use crate::auth::{AuthProvider, CredentialStore, User};
use crate::bridge::Bridge;
use crate::config::Config;
use crate::config::StompOptions;
use crate::destination::{Destination, DestinationFactory, PrefixFactory};
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::registry::DestinationRegistry;
use crate::session::{ConnectionHandle, ConnectionId, HeartbeatPeriods, Session, SessionState};
use crate::subscription::{AckMode, Acknowledgement, Subscription};
use crate::transaction::{TransactionError, Transactions};
use dashmap::DashMap;
use rstomp_protocol::{headers, Command, Frame, Heartbeat, ProtocolError, DEFAULT_VERSION};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Value of the `server` header in CONNECTED.
pub const SERVER_NAME: &str = concat!("rstomp/", env!("CARGO_PKG_VERSION"));

/// Observer of an inbound frame.
pub type FrameHook = Arc<dyn Fn(&Session, &Frame) + Send + Sync>;
/// Observer of an outbound frame, called before it is encoded.
pub type WriteHook = Arc<dyn Fn(&ConnectionHandle, &Frame) + Send + Sync>;
/// Receives the messages covered by an ACK or NACK.
pub type AckHook = Arc<dyn Fn(&Acknowledgement) + Send + Sync>;
pub type CloseHook = Arc<dyn Fn(&Session) + Send + Sync>;
/// Replaces the default heartbeat writer.
pub type PingHook = Arc<dyn Fn(&ConnectionHandle) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    commands: HashMap<Command, FrameHook>,
    received_frame: Option<FrameHook>,
    writing_frame: Option<WriteHook>,
    on_ack: Option<AckHook>,
    on_nack: Option<AckHook>,
    on_close: Option<CloseHook>,
    ping: Option<PingHook>,
}

/// Server-side STOMP engine shared by all connections of one server.
pub struct StompHandler {
    options: StompOptions,
    secured: bool,
    registry: DestinationRegistry,
    transactions: Transactions,
    /// Authenticated users by session id.
    users: DashMap<String, User>,
    auth_provider: Option<Arc<dyn AuthProvider>>,
    metrics: Option<Arc<Metrics>>,
    hooks: Hooks,
}

impl StompHandler {
    pub fn new(options: StompOptions) -> Self {
        let transactions = Transactions::new(options.max_frames_in_transaction);
        Self {
            options,
            secured: false,
            registry: DestinationRegistry::default(),
            transactions,
            users: DashMap::new(),
            auth_provider: None,
            metrics: None,
            hooks: Hooks::default(),
        }
    }

    /// Builds a handler from the broker configuration: options, credential
    /// store and prefix-based destination factory.
    pub fn from_config(config: &Config) -> Self {
        let mut handler = Self::new(config.stomp.clone())
            .with_secured(config.auth.secured)
            .with_destination_factory(Arc::new(PrefixFactory::new(
                config.destinations.queue_prefixes.clone(),
            )));
        if config.auth.secured {
            let store = CredentialStore::new(
                config
                    .auth
                    .users
                    .iter()
                    .map(|u| (u.login.clone(), u.passcode_hash.clone())),
            );
            handler = handler.with_auth_provider(Arc::new(store));
        }
        handler
    }

    pub fn with_secured(mut self, secured: bool) -> Self {
        self.secured = secured;
        self
    }

    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth_provider = Some(provider);
        self
    }

    pub fn with_destination_factory(mut self, factory: Arc<dyn DestinationFactory>) -> Self {
        self.registry.set_factory(factory);
        self
    }

    /// Registers a bridge, consulted before exact destinations.
    pub fn with_bridge(self, bridge: Bridge) -> Self {
        self.registry.add_pattern(Destination::Bridge(bridge));
        self
    }

    /// Registers a destination matched through its `matches` method.
    pub fn with_pattern_destination(self, destination: Destination) -> Self {
        self.registry.add_pattern(destination);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Observer called after the built-in processing of `command` succeeded.
    pub fn on_command(mut self, command: Command, hook: FrameHook) -> Self {
        self.hooks.commands.insert(command, hook);
        self
    }

    pub fn on_received_frame(mut self, hook: FrameHook) -> Self {
        self.hooks.received_frame = Some(hook);
        self
    }

    pub fn on_writing_frame(mut self, hook: WriteHook) -> Self {
        self.hooks.writing_frame = Some(hook);
        self
    }

    pub fn on_ack(mut self, hook: AckHook) -> Self {
        self.hooks.on_ack = Some(hook);
        self
    }

    pub fn on_nack(mut self, hook: AckHook) -> Self {
        self.hooks.on_nack = Some(hook);
        self
    }

    pub fn on_close(mut self, hook: CloseHook) -> Self {
        self.hooks.on_close = Some(hook);
        self
    }

    pub fn on_ping(mut self, hook: PingHook) -> Self {
        self.hooks.ping = Some(hook);
        self
    }

    pub fn options(&self) -> &StompOptions {
        &self.options
    }

    pub fn registry(&self) -> &DestinationRegistry {
        &self.registry
    }

    pub fn transactions(&self) -> &Transactions {
        &self.transactions
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// User authenticated on `session_id`, if any.
    pub fn user(&self, session_id: &str) -> Option<User> {
        self.users.get(session_id).map(|u| u.clone())
    }

    /// Writes a heartbeat to `connection`, or runs the ping hook.
    pub fn ping(&self, connection: &ConnectionHandle) {
        match &self.hooks.ping {
            Some(hook) => hook(connection),
            None => {
                connection.write_heartbeat();
            }
        }
    }

    /// Called by the connection task before a frame is encoded.
    pub fn writing(&self, connection: &ConnectionHandle, frame: &Frame) {
        if let Some(ref metrics) = self.metrics {
            metrics.frames_sent_total.inc();
        }
        if let Some(hook) = &self.hooks.writing_frame {
            hook(connection, frame);
        }
    }

    /// Handles one inbound frame.
    pub async fn handle(&self, session: &mut Session, frame: Frame) {
        session.record_frame();
        let command = frame.command();
        if let Some(ref metrics) = self.metrics {
            metrics
                .frames_received_total
                .with_label_values(&[command.as_str()])
                .inc();
        }
        if let Some(hook) = &self.hooks.received_frame {
            hook(session, &frame);
        }
        debug!("[{}] Received {}", session.remote_addr(), command);

        match self.dispatch(session, &frame).await {
            Ok(()) => {
                if let Some(hook) = self.hooks.commands.get(&command) {
                    hook(session, &frame);
                }
            }
            Err(e) => self.report(session, &e, Some(&frame)),
        }
    }

    /// Reports a fatal framing error on the connection.
    pub fn framing_error(&self, session: &mut Session, error: ProtocolError) {
        self.report(session, &ServerError::Protocol(error), None);
    }

    /// Queues the ERROR frame for `error`, marking the session errored if the
    /// error closes the connection.
    pub fn report(&self, session: &mut Session, error: &ServerError, offending: Option<&Frame>) {
        let message = error.to_string();
        warn!("[{}] {}", session.remote_addr(), message);
        if let Some(ref metrics) = self.metrics {
            metrics
                .errors_total
                .with_label_values(&[message.as_str()])
                .inc();
        }
        session.handle().write(error.to_error_frame(offending));
        if error.closes_connection() {
            session.set_state(SessionState::Errored);
        }
    }

    async fn dispatch(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        match frame.command() {
            Command::Connect | Command::Stomp => self.handle_connect(session, frame).await,
            _ if !session.is_connected() => Err(ServerError::NotConnected),
            Command::Send => self.handle_send(session, frame),
            Command::Subscribe => self.handle_subscribe(session, frame),
            Command::Unsubscribe => self.handle_unsubscribe(session, frame),
            Command::Ack | Command::Nack => self.handle_ack(session, frame),
            Command::Begin => self.handle_begin(session, frame),
            Command::Commit => self.handle_commit(session, frame).await,
            Command::Abort => self.handle_abort(session, frame),
            Command::Disconnect => {
                self.send_receipt(session, frame);
                session.set_state(SessionState::Closed);
                info!("[{}] Disconnected", session.remote_addr());
                Ok(())
            }
            command @ (Command::Connected
            | Command::Message
            | Command::Receipt
            | Command::Error
            | Command::Unknown) => Err(ServerError::UnsupportedCommand(command)),
        }
    }

    fn send_receipt(&self, session: &Session, frame: &Frame) {
        if let Some(receipt) = frame.receipt_header() {
            session.handle().write(Frame::receipt(receipt));
        }
    }

    /// Picks the first supported version the client accepts.
    fn negotiate_version(&self, accept_version: Option<&str>) -> Result<String, ServerError> {
        let requested: Vec<&str> = accept_version
            .unwrap_or(DEFAULT_VERSION)
            .split(',')
            .map(str::trim)
            .collect();
        self.options
            .supported_versions
            .iter()
            .find(|v| requested.contains(&v.as_str()))
            .cloned()
            .ok_or_else(|| ServerError::IncompatibleVersions {
                supported: self.options.supported_versions.join(","),
            })
    }

    async fn handle_connect(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        if session.is_connected() {
            return Err(ServerError::AlreadyConnected);
        }
        let version = self.negotiate_version(frame.header(headers::ACCEPT_VERSION))?;
        let login = frame.header(headers::LOGIN);

        if self.secured {
            let provider = self
                .auth_provider
                .as_ref()
                .ok_or(ServerError::AuthenticationFailed)?;
            match provider
                .authenticate(login, frame.header(headers::PASSCODE))
                .await
            {
                Ok(user) => {
                    self.users.insert(session.session_id().to_string(), user);
                }
                Err(e) => {
                    warn!("[{}] Authentication failed: {}", session.remote_addr(), e);
                    return Err(ServerError::AuthenticationFailed);
                }
            }
        }

        let client = Heartbeat::parse(frame.header(headers::HEARTBEAT))?;
        let server = self.options.heartbeat;
        let periods = HeartbeatPeriods {
            ping: Heartbeat::compute_ping_period(&server, &client),
            pong: Heartbeat::compute_pong_period(&server, &client),
        };
        session.complete_handshake(version.clone(), login.map(str::to_string), periods);

        let connected = Frame::new(Command::Connected)
            .with_header(headers::VERSION, version.as_str())
            .with_header(headers::SERVER, SERVER_NAME)
            .with_header(headers::SESSION, session.session_id())
            .with_header(headers::HEARTBEAT, server.to_string());
        session.handle().write(connected);
        info!(
            "[{}] Connected (version {}, session {}, ping {}ms, pong {}ms)",
            session.remote_addr(),
            version,
            session.session_id(),
            periods.ping,
            periods.pong
        );
        Ok(())
    }

    fn handle_send(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        if frame.destination().is_none() {
            return Err(ServerError::missing_header(
                Command::Send,
                "Destination header missing",
            ));
        }
        match frame.transaction() {
            Some(tx) => self.add_to_transaction(session.id(), tx, frame)?,
            None => self.deliver(session.handle(), frame)?,
        }
        self.send_receipt(session, frame);
        Ok(())
    }

    /// Routes a SEND frame to its destination, if one exists.
    fn deliver(&self, source: &ConnectionHandle, frame: &Frame) -> Result<(), ServerError> {
        let address = frame.destination().unwrap_or_default();
        match self.registry.lookup(address) {
            Some(destination) => {
                let reached = destination.dispatch(source, frame)?;
                if let Some(ref metrics) = self.metrics {
                    metrics
                        .messages_dispatched_total
                        .with_label_values(&[destination.kind()])
                        .inc_by(reached as f64);
                }
                debug!(
                    "[{}] Dispatched to {} ({} subscriptions)",
                    source.remote_addr(),
                    address,
                    reached
                );
                Ok(())
            }
            None if self.options.send_error_on_no_subscriptions => {
                Err(ServerError::NoSubscriptions(address.to_string()))
            }
            None => {
                debug!(
                    "[{}] No subscriptions on {}, frame dropped",
                    source.remote_addr(),
                    address
                );
                Ok(())
            }
        }
    }

    fn add_to_transaction(
        &self,
        connection: ConnectionId,
        tx: &str,
        frame: &Frame,
    ) -> Result<(), ServerError> {
        match self.transactions.add_frame(connection, tx, frame.clone()) {
            Ok(_) => Ok(()),
            Err(TransactionError::Unknown(id)) => Err(ServerError::NoTransaction(id)),
            Err(e) => {
                self.transactions.on_connection_closed(connection);
                self.update_transaction_gauge();
                Err(e.into())
            }
        }
    }

    fn handle_subscribe(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        let (id, destination) = match (frame.id(), frame.destination()) {
            (Some(id), Some(destination)) => (id, destination),
            _ => return Err(ServerError::InvalidSubscription(frame.to_string())),
        };
        let ack_mode = AckMode::parse(frame.ack())
            .ok_or_else(|| ServerError::InvalidSubscription(frame.to_string()))?;
        if session.subscription_destination(id).is_some() {
            return Err(ServerError::DuplicateSubscription(id.to_string()));
        }
        let max = self.options.max_subscriptions_by_client;
        if session.subscription_count() >= max {
            return Err(ServerError::TooManySubscriptions { max });
        }

        self.registry.subscribe(Subscription::new(
            session.handle().clone(),
            id,
            destination,
            ack_mode,
        ))?;
        session.add_subscription(id, destination);
        if let Some(ref metrics) = self.metrics {
            metrics.subscriptions_active.inc();
        }
        debug!(
            "[{}] Subscribed {} to {} ({})",
            session.remote_addr(),
            id,
            destination,
            ack_mode
        );
        self.send_receipt(session, frame);
        Ok(())
    }

    fn handle_unsubscribe(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        let id = frame
            .id()
            .ok_or_else(|| ServerError::missing_header(Command::Unsubscribe, "Invalid unsubscribe"))?;
        let destination = session
            .remove_subscription(id)
            .ok_or_else(|| ServerError::UnknownSubscription(id.to_string()))?;
        if self.registry.unsubscribe(&destination, session.id(), id) {
            if let Some(ref metrics) = self.metrics {
                metrics.subscriptions_active.dec();
            }
        }
        self.send_receipt(session, frame);
        Ok(())
    }

    fn handle_ack(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        if frame.id().is_none() {
            return Err(ServerError::missing_header(
                frame.command(),
                "Id header missing",
            ));
        }
        match frame.transaction() {
            Some(tx) => self.add_to_transaction(session.id(), tx, frame)?,
            None => self.apply_ack(session.handle(), frame),
        }
        self.send_receipt(session, frame);
        Ok(())
    }

    fn apply_ack(&self, connection: &ConnectionHandle, frame: &Frame) {
        let message_id = frame.id().unwrap_or_default();
        let nack = frame.command() == Command::Nack;
        let Some(ack) = self.registry.acknowledge(connection.id(), message_id) else {
            debug!(
                "[{}] No pending message {} to {}",
                connection.remote_addr(),
                message_id,
                frame.command()
            );
            return;
        };
        let hook = if nack {
            &self.hooks.on_nack
        } else {
            &self.hooks.on_ack
        };
        match hook {
            Some(hook) => hook(&ack),
            None if nack => warn!(
                "[{}] {} message(s) not acknowledged on {}",
                connection.remote_addr(),
                ack.frames.len(),
                ack.destination
            ),
            None => info!(
                "[{}] {} message(s) acknowledged on {}",
                connection.remote_addr(),
                ack.frames.len(),
                ack.destination
            ),
        }
    }

    fn transaction_id<'a>(frame: &'a Frame) -> Result<&'a str, ServerError> {
        frame
            .transaction()
            .ok_or_else(|| ServerError::missing_header(frame.command(), "Missing transaction id"))
    }

    fn handle_begin(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        let tx = Self::transaction_id(frame)?;
        self.transactions.begin(session.id(), tx)?;
        self.update_transaction_gauge();
        self.send_receipt(session, frame);
        Ok(())
    }

    async fn handle_commit(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        let tx = Self::transaction_id(frame)?;
        let frames = match self.transactions.commit(session.id(), tx) {
            Ok(frames) => frames,
            Err(e) => return Err(self.transaction_failed(session.id(), e)),
        };
        self.update_transaction_gauge();
        if let Some(ref metrics) = self.metrics {
            metrics
                .transaction_commit_size
                .with_label_values(&["committed"])
                .observe(frames.len() as f64);
        }

        let chunk_size = self.options.transaction_chunk_size.max(1);
        let mut dropped = 0usize;
        for chunk in frames.chunks(chunk_size) {
            for buffered in chunk {
                match buffered.command() {
                    Command::Send => {
                        // Replay never stops halfway: an undeliverable SEND is dropped.
                        if let Err(e) = self.deliver(session.handle(), buffered) {
                            dropped += 1;
                            warn!(
                                "[{}] Transaction {}: SEND to {} dropped: {}",
                                session.remote_addr(),
                                tx,
                                buffered.destination().unwrap_or_default(),
                                e
                            );
                        }
                    }
                    Command::Ack | Command::Nack => self.apply_ack(session.handle(), buffered),
                    _ => {}
                }
            }
            if frames.len() > chunk_size {
                tokio::task::yield_now().await;
            }
        }
        debug!(
            "[{}] Committed transaction {} ({} frames, {} dropped)",
            session.remote_addr(),
            tx,
            frames.len(),
            dropped
        );
        self.send_receipt(session, frame);
        Ok(())
    }

    fn handle_abort(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        let tx = Self::transaction_id(frame)?;
        if let Err(e) = self.transactions.abort(session.id(), tx) {
            return Err(self.transaction_failed(session.id(), e));
        }
        self.update_transaction_gauge();
        self.send_receipt(session, frame);
        Ok(())
    }

    /// Drops every transaction of the connection after a failed COMMIT or ABORT.
    fn transaction_failed(&self, connection: ConnectionId, error: TransactionError) -> ServerError {
        self.transactions.on_connection_closed(connection);
        self.update_transaction_gauge();
        error.into()
    }

    fn update_transaction_gauge(&self) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .transactions_active
                .set(self.transactions.count() as f64);
        }
    }

    /// Releases everything the connection owns. Runs once per session.
    pub fn close(&self, session: &mut Session) {
        if !session.begin_cleanup() {
            return;
        }
        let removed = self.registry.unsubscribe_connection(session.id());
        let aborted = self.transactions.on_connection_closed(session.id());
        self.users.remove(session.session_id());
        if let Some(ref metrics) = self.metrics {
            metrics.subscriptions_active.sub(removed as f64);
        }
        self.update_transaction_gauge();
        if let Some(hook) = &self.hooks.on_close {
            hook(session);
        }
        debug!(
            "[{}] Connection cleaned up ({} subscriptions removed, {} transactions aborted)",
            session.remote_addr(),
            removed,
            aborted
        );
    }
}

impl Default for StompHandler {
    fn default() -> Self {
        Self::new(StompOptions::default())
    }
}
