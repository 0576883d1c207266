//! TCP server implementation.
//!
//! Every accepted connection is driven by one task that owns its [`Session`].
//! The task multiplexes inbound bytes, the connection's outbound queue,
//! heartbeat timers and server shutdown in a single `select!` loop.

use crate::config::Config;
use crate::error::ServerError;
use crate::handler::StompHandler;
use crate::session::{ConnectionHandle, ConnectionId, Outbound, OutboundQueue, Session};
use crate::stream::Transport;
use rstomp_protocol::{Decoder, Encoder, StompItem};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, trace, warn};

const READ_BUFFER_SIZE: usize = 8192;

/// A peer is dropped once it has been silent for this many pong periods.
const PONG_TOLERANCE: u64 = 2;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Time a client has to complete the handshake (zero disables the check).
    pub connect_timeout: Duration,
    /// Maximum concurrent connections (0 = unlimited).
    pub max_connections: usize,
    /// TLS acceptor (if TLS is enabled).
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("connect_timeout", &self.connect_timeout)
            .field("max_connections", &self.max_connections)
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, rstomp_protocol::DEFAULT_PORT)),
            connect_timeout: Duration::from_secs(30),
            max_connections: 0,
            tls_acceptor: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Network settings taken from a loaded [`Config`]. TLS is wired separately.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            connect_timeout: config.network.connect_timeout(),
            max_connections: config.network.max_connections,
            tls_acceptor: None,
        }
    }

    /// Sets the TLS acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub frames_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub errors_total: AtomicU64,
}

/// STOMP server.
pub struct Server {
    config: ServerConfig,
    handler: Arc<StompHandler>,
    stats: Arc<ServerStats>,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
    next_connection_id: Arc<AtomicU64>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<StompHandler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            handler,
            stats: Arc::new(ServerStats::default()),
            shutdown_tx,
            running: AtomicBool::new(false),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn handler(&self) -> &Arc<StompHandler> {
        &self.handler
    }

    /// Binds the configured address and accepts connections until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        self.running.store(true, Ordering::SeqCst);
        let tls_enabled = self.config.tls_acceptor.is_some();
        info!(
            "STOMP server listening on {} (TLS: {})",
            local_addr,
            if tls_enabled { "enabled" } else { "disabled" }
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            let max = self.config.max_connections;
                            if max > 0
                                && self.stats.connections_active.load(Ordering::Relaxed) >= max as u64
                            {
                                warn!("Max connections reached, rejecting {}", addr);
                                drop(stream);
                                continue;
                            }
                            let context = self.context();
                            let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            let tls_acceptor = self.config.tls_acceptor.clone();

                            tokio::spawn(async move {
                                let transport = match Transport::accept(stream, tls_acceptor.as_deref()).await {
                                    Ok(transport) => transport,
                                    Err(e) => {
                                        warn!("[{}] Transport setup failed: {}", addr, e);
                                        context.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                        return;
                                    }
                                };
                                if transport.is_tls() {
                                    debug!("[{}] TLS handshake completed", addr);
                                }
                                if let Err(e) = context.serve(transport, addr, connection_id, shutdown_rx).await {
                                    // already counted and logged by serve
                                    trace!("[{}] Connection task ended: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Drives one connection over an arbitrary byte stream until it closes.
    pub async fn serve_stream<S>(&self, stream: S, addr: SocketAddr) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.context()
            .serve(stream, addr, connection_id, self.shutdown_tx.subscribe())
            .await
    }

    /// Signals the accept loop and every connection to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    fn context(&self) -> ConnectionContext {
        ConnectionContext {
            handler: self.handler.clone(),
            stats: self.stats.clone(),
            connect_timeout: self.config.connect_timeout,
        }
    }
}

/// Everything a connection task needs from its server.
#[derive(Clone)]
struct ConnectionContext {
    handler: Arc<StompHandler>,
    stats: Arc<ServerStats>,
    connect_timeout: Duration,
}

impl ConnectionContext {
    async fn serve<S>(
        self,
        stream: S,
        addr: SocketAddr,
        connection_id: ConnectionId,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = self.handler.metrics() {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }
        info!("[{}] Client connected", addr);

        let high_water_mark = self.handler.options().outbound_high_water_mark;
        let (handle, mut outbound) = ConnectionHandle::channel(connection_id, addr, high_water_mark);
        let mut session = Session::new(handle);
        let (mut reader, mut writer) = tokio::io::split(stream);

        let result = self
            .drive(
                &mut session,
                &mut outbound,
                &mut reader,
                &mut writer,
                &mut shutdown_rx,
            )
            .await;

        // Flush what is already queued (ERROR, RECEIPT) before the transport goes away.
        outbound.close();
        while let Some(item) = outbound.try_recv() {
            if self.write_item(&mut writer, session.handle(), item).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
        self.handler.close(&mut session);

        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        if let Some(metrics) = self.handler.metrics() {
            metrics.connections_active.dec();
        }
        match &result {
            Ok(()) | Err(ServerError::ShuttingDown) => {
                info!("[{}] Client disconnected", addr);
            }
            Err(e) => {
                self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                debug!("[{}] Connection error: {}", addr, e);
            }
        }
        result
    }

    async fn drive<R, W>(
        &self,
        session: &mut Session,
        outbound: &mut OutboundQueue,
        reader: &mut R,
        writer: &mut W,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let options = self.handler.options();
        let time_factor = u64::from(options.time_factor.max(1));
        let mut decoder = Decoder::with_limits(options.frame_limits());
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let mut heartbeats_started = false;
        let mut ping_timer: Option<Interval> = None;
        let mut pong_timer: Option<Interval> = None;

        let connect_deadline = tokio::time::sleep(self.connect_timeout);
        tokio::pin!(connect_deadline);
        let enforce_connect_timeout = !self.connect_timeout.is_zero();

        loop {
            if session.is_closing() {
                return Ok(());
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    debug!("[{}] Closing connection for shutdown", session.remote_addr());
                    return Err(ServerError::ShuttingDown);
                }

                Some(item) = outbound.recv() => {
                    self.write_item(writer, session.handle(), item).await?;
                }

                result = reader.read(&mut buf) => {
                    let n = match result {
                        Ok(0) => {
                            debug!("[{}] Connection closed by peer", session.remote_addr());
                            return Ok(());
                        }
                        Ok(n) => n,
                        Err(e) => return Err(e.into()),
                    };
                    session.touch();
                    decoder.extend(&buf[..n]);
                    self.process(session, &mut decoder).await;

                    if !heartbeats_started && session.is_connected() {
                        heartbeats_started = true;
                        let periods = session.heartbeat();
                        ping_timer = periodic(periods.ping * time_factor);
                        pong_timer = periodic(periods.pong * time_factor);
                        trace!(
                            "[{}] Heartbeats: ping every {}ms, pong every {}ms",
                            session.remote_addr(),
                            periods.ping,
                            periods.pong
                        );
                    }
                }

                _ = tick(&mut ping_timer) => {
                    self.handler.ping(session.handle());
                }

                _ = tick(&mut pong_timer) => {
                    let limit = Duration::from_millis(
                        session.heartbeat().pong * time_factor * PONG_TOLERANCE,
                    );
                    let idle = session.idle_for();
                    if idle > limit {
                        warn!(
                            "[{}] No data received for {:?}, closing connection",
                            session.remote_addr(),
                            idle
                        );
                        return Ok(());
                    }
                }

                _ = &mut connect_deadline, if enforce_connect_timeout && !session.is_connected() => {
                    warn!(
                        "[{}] No CONNECT received within {:?}, closing connection",
                        session.remote_addr(),
                        self.connect_timeout
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Feeds every complete item in the decoder buffer to the handler.
    async fn process(&self, session: &mut Session, decoder: &mut Decoder) {
        loop {
            match decoder.decode() {
                Ok(Some(StompItem::Frame(frame))) => {
                    self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                    self.handler.handle(session, frame).await;
                    if session.is_closing() {
                        break;
                    }
                }
                Ok(Some(StompItem::Heartbeat)) => {
                    trace!("[{}] Heartbeat received", session.remote_addr());
                    if let Some(metrics) = self.handler.metrics() {
                        metrics.heartbeats_received_total.inc();
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    self.handler.framing_error(session, e);
                    break;
                }
            }
        }
    }

    async fn write_item<W>(
        &self,
        writer: &mut W,
        connection: &ConnectionHandle,
        item: Outbound,
    ) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match item {
            Outbound::Frame(frame) => {
                self.handler.writing(connection, &frame);
                let encoded = Encoder::encode_frame(&frame, self.handler.options().trailing_line);
                writer.write_all(&encoded).await?;
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Outbound::Heartbeat => {
                writer.write_all(Encoder::encode_heartbeat()).await?;
            }
        }
        writer.flush().await
    }
}

fn periodic(period_ms: u64) -> Option<Interval> {
    if period_ms == 0 {
        return None;
    }
    let period = Duration::from_millis(period_ms);
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StompOptions;
    use rstomp_protocol::{Command, Frame};

    fn test_addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), rstomp_protocol::DEFAULT_PORT);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert!(config.tls_acceptor.is_none());
        assert!(format!("{:?}", config).contains("tls_enabled: false"));
    }

    #[test]
    fn test_server_config_from_config() {
        let mut config = Config::default();
        config.network.max_connections = 7;
        config.network.connect_timeout_secs = 3;
        let server_config = ServerConfig::from_config(&config);
        assert_eq!(server_config.max_connections, 7);
        assert_eq!(server_config.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_server_creation() {
        let server = Server::new(ServerConfig::default(), Arc::new(StompHandler::default()));
        assert!(!server.is_running());
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_send_before_connect_gets_error() {
        let offending = Frame::new(Command::Send)
            .with_header("destination", "/a")
            .with_body("hi")
            .unwrap();
        let expected = ServerError::NotConnected
            .to_error_frame(Some(&offending))
            .encode(false);

        let stream = tokio_test::io::Builder::new()
            .read(b"SEND\ndestination:/a\n\nhi\0")
            .write(&expected)
            .build();

        let server = Server::new(ServerConfig::default(), Arc::new(StompHandler::default()));
        server.serve_stream(stream, test_addr()).await.unwrap();

        let stats = server.stats();
        assert_eq!(stats.frames_received.load(Ordering::Relaxed), 1);
        assert_eq!(stats.frames_sent.load(Ordering::Relaxed), 1);
        assert_eq!(stats.connections_active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_heartbeats_before_eof() {
        let stream = tokio_test::io::Builder::new().read(b"\n\r\n").build();
        let server = Server::new(ServerConfig::default(), Arc::new(StompHandler::default()));
        server.serve_stream(stream, test_addr()).await.unwrap();
        assert_eq!(server.stats().frames_received.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let options = StompOptions {
            max_body_length: 4,
            ..StompOptions::default()
        };
        let handler = Arc::new(StompHandler::new(options));
        let stream = tokio_test::io::Builder::new()
            .read(b"SEND\ndestination:/a\ncontent-length:10\n\n0123456789\0")
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let server = Server::new(ServerConfig::default(), handler);
        server.serve_stream(stream, test_addr()).await.unwrap();
        assert_eq!(server.stats().errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (client, server_side) = tokio::io::duplex(1024);
        let server = Server::new(
            ServerConfig::default().with_connect_timeout(Duration::from_millis(50)),
            Arc::new(StompHandler::default()),
        );
        server.serve_stream(server_side, test_addr()).await.unwrap();
        drop(client);
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_periodic_disabled() {
        assert!(periodic(0).is_none());
    }
}
