//! Connection management.
//!
//! A [`Connection`] is opened by sending CONNECT and waiting for CONNECTED.
//! After the handshake a background task reads frames and routes them:
//! RECEIPT frames resolve pending receipts, MESSAGE frames go to the channel
//! of their subscription and ERROR frames are broadcast. A second task sends
//! and checks heartbeats when the negotiation enabled them.

use crate::error::ClientError;
use crate::stream::ClientStream;
use crate::tls::TlsClientConfig;
use parking_lot::{Mutex, RwLock};
use rstomp_protocol::{
    headers, Command, Decoder, Encoder, Frame, FrameLimits, Heartbeat, StompItem, DEFAULT_VERSION,
    SUPPORTED_VERSIONS,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

const ERROR_CHANNEL_CAPACITY: usize = 64;

/// The server is considered gone after this many silent pong periods.
const PONG_TOLERANCE: u32 = 2;

/// Connection options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server address.
    pub addr: SocketAddr,
    /// Versions offered in `accept-version`, most preferred first.
    pub accepted_versions: Vec<String>,
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// Value of the `host` header. Defaults to the server IP.
    pub virtual_host: Option<String>,
    /// Omit the `host` header from CONNECT.
    pub bypass_host_header: bool,
    /// Add `content-length` to SEND frames that do not carry one.
    pub auto_compute_content_length: bool,
    /// Open with a STOMP frame instead of CONNECT.
    pub use_stomp_frame: bool,
    pub heartbeat: Heartbeat,
    /// Append an extra LF after every frame.
    pub trailing_line: bool,
    /// Applies to the TCP connect and to the STOMP handshake separately.
    pub connect_timeout: Duration,
    pub read_buffer_size: usize,
    pub tls: Option<TlsClientConfig>,
    pub frame_limits: FrameLimits,
}

impl ClientOptions {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            accepted_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            login: None,
            passcode: None,
            virtual_host: None,
            bypass_host_header: false,
            auto_compute_content_length: true,
            use_stomp_frame: false,
            heartbeat: Heartbeat::default(),
            trailing_line: false,
            connect_timeout: Duration::from_secs(10),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            tls: None,
            frame_limits: FrameLimits::default(),
        }
    }

    pub fn with_credentials(mut self, login: impl Into<String>, passcode: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.passcode = Some(passcode.into());
        self
    }

    pub fn with_virtual_host(mut self, host: impl Into<String>) -> Self {
        self.virtual_host = Some(host.into());
        self
    }

    pub fn with_bypass_host_header(mut self, bypass: bool) -> Self {
        self.bypass_host_header = bypass;
        self
    }

    pub fn with_accepted_versions(mut self, versions: &[&str]) -> Self {
        self.accepted_versions = versions.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_stomp_frame(mut self, use_stomp_frame: bool) -> Self {
        self.use_stomp_frame = use_stomp_frame;
        self
    }

    pub fn with_auto_compute_content_length(mut self, enabled: bool) -> Self {
        self.auto_compute_content_length = enabled;
        self
    }

    pub fn with_trailing_line(mut self, trailing_line: bool) -> Self {
        self.trailing_line = trailing_line;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    pub fn with_frame_limits(mut self, limits: FrameLimits) -> Self {
        self.frame_limits = limits;
        self
    }

    /// Builds the CONNECT (or STOMP) frame opening a session.
    pub fn connect_frame(&self) -> Frame {
        let command = if self.use_stomp_frame {
            Command::Stomp
        } else {
            Command::Connect
        };
        let mut frame =
            Frame::new(command).with_header(headers::ACCEPT_VERSION, self.accepted_versions.join(","));
        if !self.bypass_host_header {
            let host = self
                .virtual_host
                .clone()
                .unwrap_or_else(|| self.addr.ip().to_string());
            frame = frame.with_header(headers::HOST, host);
        }
        if let Some(login) = &self.login {
            frame = frame.with_header(headers::LOGIN, login.as_str());
        }
        if let Some(passcode) = &self.passcode {
            frame = frame.with_header(headers::PASSCODE, passcode.as_str());
        }
        frame.with_header(headers::HEARTBEAT, self.heartbeat.to_string())
    }
}

/// Observer of a frame.
pub type FrameHook = Arc<dyn Fn(&Frame) + Send + Sync>;
/// Observer of a connection event.
pub type EventHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Hooks {
    received_frame: Option<FrameHook>,
    writing_frame: Option<FrameHook>,
    error: Option<FrameHook>,
    dropped: Option<EventHook>,
    closed: Option<EventHook>,
}

/// Values agreed on during the handshake.
#[derive(Debug)]
struct Negotiated {
    version: String,
    session: Option<String>,
    server: Option<String>,
    ping: u64,
    pong: u64,
}

type PendingReceipt = oneshot::Sender<Result<Frame, ClientError>>;

/// A connection to a STOMP server.
pub struct Connection {
    options: ClientOptions,
    negotiated: Negotiated,
    writer: tokio::sync::Mutex<Option<WriteHalf<ClientStream>>>,
    connected: AtomicBool,
    /// receipt id -> waiter
    pending: Mutex<HashMap<String, PendingReceipt>>,
    /// subscription id -> MESSAGE channel
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<Frame>>>,
    errors: broadcast::Sender<Frame>,
    last_activity: Mutex<Instant>,
    hooks: RwLock<Hooks>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Connects to the server and performs the STOMP handshake.
    pub async fn open(options: ClientOptions) -> Result<Arc<Self>, ClientError> {
        debug!("Connecting to {}...", options.addr);

        let tcp_stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(options.addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        tcp_stream.set_nodelay(true).ok();

        let stream = match options.tls.as_ref().filter(|tls| tls.enabled) {
            Some(tls) => {
                let (connector, server_name) = tls.connector(&options.addr.ip().to_string())?;
                debug!("Performing TLS handshake...");
                let tls_stream = connector
                    .connect(server_name, tcp_stream)
                    .await
                    .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
                ClientStream::tls(tls_stream)
            }
            None => ClientStream::plain(tcp_stream),
        };

        Self::handshake(options, stream).await
    }

    async fn handshake(options: ClientOptions, stream: ClientStream) -> Result<Arc<Self>, ClientError> {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let connect = options.connect_frame();
        writer
            .write_all(&Encoder::encode_frame(&connect, options.trailing_line))
            .await?;
        writer.flush().await?;

        let mut decoder = Decoder::with_limits(options.frame_limits);
        let mut buf = vec![0u8; options.read_buffer_size];
        let reply = tokio::time::timeout(
            options.connect_timeout,
            read_reply(&mut reader, &mut decoder, &mut buf),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;

        if reply.command() == Command::Error {
            debug!("Server refused the connection: {:?}", reply.header(headers::MESSAGE));
            return Err(ClientError::from_error_frame(&reply));
        }

        let server_heartbeat = Heartbeat::parse(reply.header(headers::HEARTBEAT))?;
        let negotiated = Negotiated {
            version: reply
                .header(headers::VERSION)
                .unwrap_or(DEFAULT_VERSION)
                .to_string(),
            session: reply.header(headers::SESSION).map(str::to_string),
            server: reply.header(headers::SERVER).map(str::to_string),
            ping: Heartbeat::compute_ping_period(&options.heartbeat, &server_heartbeat),
            pong: Heartbeat::compute_pong_period(&options.heartbeat, &server_heartbeat),
        };
        debug!(
            "Connected to {} (version {}, ping {}ms, pong {}ms)",
            options.addr, negotiated.version, negotiated.ping, negotiated.pong
        );

        let (ping, pong) = (negotiated.ping, negotiated.pong);
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let connection = Arc::new(Self {
            options,
            negotiated,
            writer: tokio::sync::Mutex::new(Some(writer)),
            connected: AtomicBool::new(true),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            errors,
            last_activity: Mutex::new(Instant::now()),
            hooks: RwLock::new(Hooks::default()),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = vec![tokio::spawn(read_loop(
            Arc::downgrade(&connection),
            reader,
            decoder,
            buf,
        ))];
        if ping > 0 || pong > 0 {
            tasks.push(tokio::spawn(heartbeat_loop(
                Arc::downgrade(&connection),
                ping,
                pong,
            )));
        }
        *connection.tasks.lock() = tasks;

        Ok(connection)
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> &str {
        &self.negotiated.version
    }

    /// Session id assigned by the server.
    pub fn session(&self) -> Option<&str> {
        self.negotiated.session.as_deref()
    }

    /// Server name and version reported in CONNECTED.
    pub fn server(&self) -> Option<&str> {
        self.negotiated.server.as_deref()
    }

    /// Negotiated (ping, pong) periods in milliseconds.
    pub fn heartbeat_periods(&self) -> (u64, u64) {
        (self.negotiated.ping, self.negotiated.pong)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// ERROR frames received from now on.
    pub fn errors(&self) -> broadcast::Receiver<Frame> {
        self.errors.subscribe()
    }

    pub fn on_received_frame(&self, hook: impl Fn(&Frame) + Send + Sync + 'static) {
        self.hooks.write().received_frame = Some(Arc::new(hook));
    }

    /// Called with every frame before it is written.
    pub fn on_writing_frame(&self, hook: impl Fn(&Frame) + Send + Sync + 'static) {
        self.hooks.write().writing_frame = Some(Arc::new(hook));
    }

    pub fn on_error(&self, hook: impl Fn(&Frame) + Send + Sync + 'static) {
        self.hooks.write().error = Some(Arc::new(hook));
    }

    /// Called when the transport ends without [`Connection::close`], including
    /// heartbeat timeouts.
    pub fn on_dropped(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.write().dropped = Some(Arc::new(hook));
    }

    pub fn on_closed(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.write().closed = Some(Arc::new(hook));
    }

    /// Writes a frame without waiting for a receipt.
    pub async fn write_frame(&self, frame: Frame) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let hook = self.hooks.read().writing_frame.clone();
        if let Some(hook) = hook {
            hook(&frame);
        }
        trace!("Sending {}", frame.command());
        let encoded = Encoder::encode_frame(&frame, self.options.trailing_line);
        self.write_bytes(&encoded).await
    }

    async fn write_heartbeat(&self) -> Result<(), ClientError> {
        trace!("Sending heartbeat");
        self.write_bytes(Encoder::encode_heartbeat()).await
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<(), ClientError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Writes a frame with a fresh `receipt` header and waits for the RECEIPT.
    ///
    /// Fails with [`ClientError::ServerError`] if an ERROR frame arrives first
    /// and with [`ClientError::ConnectionClosed`] if the connection ends.
    pub async fn request(&self, mut frame: Frame) -> Result<Frame, ClientError> {
        let receipt = Uuid::new_v4().to_string();
        frame.set_header(headers::RECEIPT, receipt.as_str());

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(receipt.clone(), tx);

        if let Err(e) = self.write_frame(frame).await {
            self.pending.lock().remove(&receipt);
            return Err(e);
        }

        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Number of receipts still awaited.
    pub fn pending_receipts(&self) -> usize {
        self.pending.lock().len()
    }

    /// Registers the channel MESSAGE frames for `id` are routed to.
    pub(crate) fn register_subscription(
        &self,
        id: &str,
    ) -> Result<mpsc::UnboundedReceiver<Frame>, ClientError> {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(id) {
            return Err(ClientError::DuplicateSubscription(id.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        subscriptions.insert(id.to_string(), tx);
        Ok(rx)
    }

    pub(crate) fn remove_subscription(&self, id: &str) -> bool {
        self.subscriptions.lock().remove(id).is_some()
    }

    pub fn has_subscription(&self, id: &str) -> bool {
        self.subscriptions.lock().contains_key(id)
    }

    pub fn subscription_ids(&self) -> Vec<String> {
        self.subscriptions.lock().keys().cloned().collect()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn route(&self, frame: Frame) {
        let hook = self.hooks.read().received_frame.clone();
        if let Some(hook) = hook {
            hook(&frame);
        }

        match frame.command() {
            Command::Receipt => {
                let receipt_id = frame.header(headers::RECEIPT_ID).unwrap_or_default();
                let waiter = self.pending.lock().remove(receipt_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(frame));
                    }
                    None => debug!("Receipt {} matches no pending frame", receipt_id),
                }
            }
            Command::Message => {
                let subscription = frame.header(headers::SUBSCRIPTION).unwrap_or_default();
                let sender = self.subscriptions.lock().get(subscription).cloned();
                match sender {
                    Some(tx) => {
                        if tx.send(frame).is_err() {
                            trace!("Subscription receiver dropped, message discarded");
                        }
                    }
                    None => debug!("MESSAGE for unknown subscription '{}'", subscription),
                }
            }
            Command::Error => {
                warn!(
                    "[{}] Server error: {}",
                    self.options.addr,
                    frame.header(headers::MESSAGE).unwrap_or_default()
                );
                let waiters: Vec<_> = self.pending.lock().drain().collect();
                for (_, tx) in waiters {
                    let _ = tx.send(Err(ClientError::from_error_frame(&frame)));
                }
                let hook = self.hooks.read().error.clone();
                if let Some(hook) = hook {
                    hook(&frame);
                }
                let _ = self.errors.send(frame);
            }
            other => debug!("Ignoring {} frame", other),
        }
    }

    /// Transport ended on its own: read EOF, read error or heartbeat timeout.
    async fn connection_lost(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!("[{}] Connection to server lost", self.options.addr);
        let hook = self.hooks.read().dropped.clone();
        if let Some(hook) = hook {
            hook();
        }
        self.teardown().await;
    }

    /// Closes the transport. Pending receipts fail with
    /// [`ClientError::ConnectionClosed`] and subscriptions end.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!("Closing connection to {}", self.options.addr);
            self.teardown().await;
        }
        Ok(())
    }

    async fn teardown(&self) {
        let waiters: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in waiters {
            let _ = tx.send(Err(ClientError::ConnectionClosed));
        }
        self.subscriptions.lock().clear();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }

        let hook = self.hooks.read().closed.clone();
        if let Some(hook) = hook {
            hook();
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.options.addr)
            .field("version", &self.negotiated.version)
            .field("session", &self.negotiated.session)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Reads until the server answers the handshake with CONNECTED or ERROR.
async fn read_reply(
    reader: &mut ReadHalf<ClientStream>,
    decoder: &mut Decoder,
    buf: &mut [u8],
) -> Result<Frame, ClientError> {
    loop {
        while let Some(item) = decoder.decode()? {
            match item {
                StompItem::Frame(frame)
                    if matches!(frame.command(), Command::Connected | Command::Error) =>
                {
                    return Ok(frame);
                }
                StompItem::Frame(frame) => {
                    debug!("Ignoring {} received before CONNECTED", frame.command());
                }
                StompItem::Heartbeat => {}
            }
        }
        let n = reader.read(buf).await?;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        decoder.extend(&buf[..n]);
    }
}

async fn read_loop(
    connection: Weak<Connection>,
    mut reader: ReadHalf<ClientStream>,
    mut decoder: Decoder,
    mut buf: Vec<u8>,
) {
    let result = read_frames(&connection, &mut reader, &mut decoder, &mut buf).await;
    if let Err(e) = result {
        debug!("Read loop ended: {}", e);
    }
    if let Some(connection) = connection.upgrade() {
        connection.connection_lost().await;
    }
}

async fn read_frames(
    connection: &Weak<Connection>,
    reader: &mut ReadHalf<ClientStream>,
    decoder: &mut Decoder,
    buf: &mut [u8],
) -> Result<(), ClientError> {
    loop {
        {
            let Some(connection) = connection.upgrade() else {
                return Ok(());
            };
            while let Some(item) = decoder.decode()? {
                match item {
                    StompItem::Frame(frame) => connection.route(frame),
                    StompItem::Heartbeat => trace!("Heartbeat received"),
                }
            }
        }

        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(());
        }
        decoder.extend(&buf[..n]);
        if let Some(connection) = connection.upgrade() {
            connection.touch();
        }
    }
}

async fn heartbeat_loop(connection: Weak<Connection>, ping: u64, pong: u64) {
    let mut ping_timer = periodic(ping);
    let mut pong_timer = periodic(pong);

    loop {
        tokio::select! {
            _ = tick(&mut ping_timer) => {
                let Some(connection) = connection.upgrade() else {
                    return;
                };
                if connection.write_heartbeat().await.is_err() {
                    return;
                }
            }
            _ = tick(&mut pong_timer) => {
                let Some(connection) = connection.upgrade() else {
                    return;
                };
                let limit = Duration::from_millis(pong) * PONG_TOLERANCE;
                let idle = connection.idle_for();
                if idle > limit {
                    warn!(
                        "[{}] No data from server for {:?}, dropping connection",
                        connection.options.addr,
                        idle
                    );
                    connection.connection_lost().await;
                    return;
                }
            }
        }
    }
}

fn periodic(period_ms: u64) -> Option<Interval> {
    if period_ms == 0 {
        return None;
    }
    let period = Duration::from_millis(period_ms);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
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
pub(crate) mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    /// Scripted server end of a connection.
    pub(crate) struct FakeServer {
        stream: TcpStream,
        decoder: Decoder,
    }

    impl FakeServer {
        pub(crate) async fn next_frame(&mut self) -> Option<Frame> {
            let mut buf = [0u8; 4096];
            loop {
                while let Some(item) = self.decoder.decode().unwrap() {
                    if let StompItem::Frame(frame) = item {
                        return Some(frame);
                    }
                }
                let n = self.stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return None;
                }
                self.decoder.extend(&buf[..n]);
            }
        }

        pub(crate) async fn send(&mut self, frame: Frame) {
            self.stream.write_all(&frame.encode(false)).await.unwrap();
        }

        pub(crate) async fn accept_connect(&mut self) -> Frame {
            let connect = self.next_frame().await.unwrap();
            self.send(
                Frame::new(Command::Connected)
                    .with_header("version", "1.2")
                    .with_header("session", "s-1")
                    .with_header("server", "fake/1.0")
                    .with_header("heart-beat", "0,0"),
            )
            .await;
            connect
        }
    }

    pub(crate) async fn spawn_fake_server<F, Fut>(script: F) -> (SocketAddr, JoinHandle<()>)
    where
        F: FnOnce(FakeServer) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            script(FakeServer {
                stream,
                decoder: Decoder::new(),
            })
            .await;
        });
        (addr, handle)
    }

    #[test]
    fn test_options_defaults() {
        let options = ClientOptions::new("127.0.0.1:61613".parse().unwrap());
        assert_eq!(options.accepted_versions, vec!["1.2", "1.1", "1.0"]);
        assert_eq!(options.heartbeat, Heartbeat::new(1000, 1000));
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert!(options.auto_compute_content_length);
        assert!(!options.use_stomp_frame);
    }

    #[test]
    fn test_read_buffer_clamping() {
        let addr: SocketAddr = "127.0.0.1:61613".parse().unwrap();
        assert_eq!(
            ClientOptions::new(addr).with_read_buffer_size(100).read_buffer_size,
            MIN_READ_BUFFER_SIZE
        );
        assert_eq!(
            ClientOptions::new(addr)
                .with_read_buffer_size(10 * 1024 * 1024)
                .read_buffer_size,
            MAX_READ_BUFFER_SIZE
        );
    }

    #[test]
    fn test_connect_frame() {
        let options = ClientOptions::new("10.0.0.5:61613".parse().unwrap())
            .with_credentials("admin", "secret")
            .with_heartbeat(Heartbeat::new(500, 0));
        let frame = options.connect_frame();
        assert_eq!(frame.command(), Command::Connect);
        assert_eq!(frame.header("accept-version"), Some("1.2,1.1,1.0"));
        assert_eq!(frame.header("host"), Some("10.0.0.5"));
        assert_eq!(frame.header("login"), Some("admin"));
        assert_eq!(frame.header("passcode"), Some("secret"));
        assert_eq!(frame.header("heart-beat"), Some("500,0"));
    }

    #[test]
    fn test_stomp_frame_without_host() {
        let options = ClientOptions::new("10.0.0.5:61613".parse().unwrap())
            .with_stomp_frame(true)
            .with_bypass_host_header(true);
        let frame = options.connect_frame();
        assert_eq!(frame.command(), Command::Stomp);
        assert_eq!(frame.header("host"), None);

        let frame = ClientOptions::new("10.0.0.5:61613".parse().unwrap())
            .with_virtual_host("broker.example")
            .connect_frame();
        assert_eq!(frame.header("host"), Some("broker.example"));
    }

    #[tokio::test]
    async fn test_handshake() {
        let (addr, server) = spawn_fake_server(|mut server| async move {
            let connect = server.accept_connect().await;
            assert_eq!(connect.header("accept-version"), Some("1.2,1.1,1.0"));
            assert_eq!(connect.header("host"), Some("127.0.0.1"));
            assert!(server.next_frame().await.is_none());
        })
        .await;

        let connection = Connection::open(ClientOptions::new(addr)).await.unwrap();
        assert!(connection.is_connected());
        assert_eq!(connection.version(), "1.2");
        assert_eq!(connection.session(), Some("s-1"));
        assert_eq!(connection.server(), Some("fake/1.0"));
        assert_eq!(connection.heartbeat_periods(), (0, 0));

        connection.close().await.unwrap();
        assert!(!connection.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_error() {
        let (addr, _server) = spawn_fake_server(|mut server| async move {
            server.next_frame().await.unwrap();
            server
                .send(Frame::error("Authentication failed", "bad credentials"))
                .await;
        })
        .await;

        match Connection::open(ClientOptions::new(addr)).await {
            Err(ClientError::ServerError { message, body }) => {
                assert_eq!(message, "Authentication failed");
                assert_eq!(body, "bad credentials");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receipt_resolves_request() {
        let (addr, _server) = spawn_fake_server(|mut server| async move {
            server.accept_connect().await;
            let frame = server.next_frame().await.unwrap();
            let receipt = frame.receipt_header().unwrap().to_string();
            server.send(Frame::receipt(&receipt)).await;
            server.next_frame().await;
        })
        .await;

        let connection = Connection::open(ClientOptions::new(addr)).await.unwrap();
        let receipt = connection
            .request(Frame::new(Command::Begin).with_header("transaction", "tx"))
            .await
            .unwrap();
        assert_eq!(receipt.command(), Command::Receipt);
        assert_eq!(connection.pending_receipts(), 0);
    }

    #[tokio::test]
    async fn test_pending_receipt_fails_when_server_goes_away() {
        let (addr, _server) = spawn_fake_server(|mut server| async move {
            server.accept_connect().await;
            server.next_frame().await.unwrap();
        })
        .await;

        let connection = Connection::open(ClientOptions::new(addr)).await.unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));
        let counter = dropped.clone();
        connection.on_dropped(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = connection
            .request(Frame::new(Command::Begin).with_header("transaction", "tx"))
            .await;
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
        assert!(!connection.is_connected());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(matches!(
            connection.write_frame(Frame::new(Command::Begin)).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_message_routed_to_subscription() {
        let (addr, _server) = spawn_fake_server(|mut server| async move {
            server.accept_connect().await;
            server.next_frame().await.unwrap();
            let mut headers = rstomp_protocol::Headers::new();
            headers.add("destination", "/queue/a");
            headers.add("subscription", "sub-1");
            headers.add("message-id", "m-1");
            server
                .send(Frame::message(headers, Some(bytes::Bytes::from_static(b"hello"))))
                .await;
            server.next_frame().await;
        })
        .await;

        let connection = Connection::open(ClientOptions::new(addr)).await.unwrap();
        let mut rx = connection.register_subscription("sub-1").unwrap();
        assert!(matches!(
            connection.register_subscription("sub-1"),
            Err(ClientError::DuplicateSubscription(_))
        ));
        connection
            .write_frame(
                Frame::new(Command::Subscribe)
                    .with_header("destination", "/queue/a")
                    .with_header("id", "sub-1"),
            )
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.header("message-id"), Some("m-1"));
        assert_eq!(message.body_as_string(), "hello");
    }

    #[tokio::test]
    async fn test_error_frame_fails_receipt_and_is_broadcast() {
        let (addr, _server) = spawn_fake_server(|mut server| async move {
            server.accept_connect().await;
            server.next_frame().await.unwrap();
            server
                .send(Frame::error("Unknown transaction", "COMMIT\n\n^@"))
                .await;
            server.next_frame().await;
        })
        .await;

        let connection = Connection::open(ClientOptions::new(addr)).await.unwrap();
        let mut errors = connection.errors();
        let hooked = Arc::new(AtomicUsize::new(0));
        let counter = hooked.clone();
        connection.on_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = connection
            .request(Frame::new(Command::Commit).with_header("transaction", "nope"))
            .await;
        match result {
            Err(ClientError::ServerError { message, .. }) => {
                assert_eq!(message, "Unknown transaction")
            }
            other => panic!("unexpected {:?}", other),
        }
        let error = errors.recv().await.unwrap();
        assert_eq!(error.header("message"), Some("Unknown transaction"));
        assert_eq!(hooked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_writing_hook_sees_frames() {
        let (addr, _server) = spawn_fake_server(|mut server| async move {
            server.accept_connect().await;
            server.next_frame().await;
        })
        .await;

        let connection = Connection::open(ClientOptions::new(addr)).await.unwrap();
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        connection.on_writing_frame(move |frame| sink.lock().push(frame.command()));
        connection
            .write_frame(Frame::new(Command::Begin).with_header("transaction", "t"))
            .await
            .unwrap();
        assert_eq!(*written.lock(), vec![Command::Begin]);
    }
}
