//! Broker configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RSTOMP_CONFIG)
//! 3. Environment variables

use crate::bridge::{BridgeOptions, PermittedOptions};
use rstomp_protocol::{FrameLimits, Heartbeat, SUPPORTED_VERSIONS};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Broker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// STOMP protocol options.
    pub stomp: StompOptions,
    /// Destination creation rules.
    pub destinations: DestinationsConfig,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// TLS configuration.
    pub tls: TlsConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
    /// Event bus bridge configuration.
    pub bridge: BridgeConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RSTOMP_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.stomp.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.tls.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Loads user credentials from the external secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        self.auth.load_secrets()
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stomp.validate()?;
        self.tls.validate()?;
        self.bridge.validate()?;
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.to_lowercase() == "true")
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Seconds a client has to send CONNECT after the transport is up.
    pub connect_timeout_secs: u64,
    /// Maximum concurrent connections (0 = unlimited).
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, rstomp_protocol::DEFAULT_PORT)),
            connect_timeout_secs: 30,
            max_connections: 0,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("RSTOMP_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("RSTOMP_CONNECT_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.connect_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("RSTOMP_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }

    /// Returns the CONNECT timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// STOMP protocol options shared by every connection of a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StompOptions {
    /// Versions offered to clients, most preferred first.
    pub supported_versions: Vec<String>,
    /// Heartbeat declaration sent in CONNECTED.
    pub heartbeat: Heartbeat,
    pub max_header_length: usize,
    pub max_headers: usize,
    pub max_body_length: usize,
    /// Frames a single transaction may buffer before it is dropped.
    pub max_frames_in_transaction: usize,
    /// Frames replayed per scheduling slice on COMMIT.
    pub transaction_chunk_size: usize,
    pub max_subscriptions_by_client: usize,
    /// Answer SEND to a destination without subscribers with an ERROR.
    pub send_error_on_no_subscriptions: bool,
    /// Append an extra LF after every outbound frame.
    pub trailing_line: bool,
    /// Multiplier applied to heartbeat timers.
    pub time_factor: u32,
    /// Outbound frames queued before a connection counts as unwritable.
    pub outbound_high_water_mark: usize,
}

impl Default for StompOptions {
    fn default() -> Self {
        Self {
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            heartbeat: Heartbeat::default(),
            max_header_length: rstomp_protocol::DEFAULT_MAX_HEADER_LENGTH,
            max_headers: rstomp_protocol::DEFAULT_MAX_HEADERS,
            max_body_length: rstomp_protocol::DEFAULT_MAX_BODY_LENGTH,
            max_frames_in_transaction: 1000,
            transaction_chunk_size: 1000,
            max_subscriptions_by_client: 1000,
            send_error_on_no_subscriptions: false,
            trailing_line: false,
            time_factor: 1,
            outbound_high_water_mark: 1024,
        }
    }
}

impl StompOptions {
    fn apply_env_overrides(&mut self) {
        if let Ok(heartbeat) = std::env::var("RSTOMP_HEARTBEAT") {
            if let Ok(parsed) = heartbeat.parse() {
                self.heartbeat = parsed;
            }
        }

        if let Ok(max) = std::env::var("RSTOMP_MAX_FRAMES_IN_TRANSACTION") {
            if let Ok(n) = max.parse() {
                self.max_frames_in_transaction = n;
            }
        }

        if let Ok(max) = std::env::var("RSTOMP_MAX_SUBSCRIPTIONS") {
            if let Ok(n) = max.parse() {
                self.max_subscriptions_by_client = n;
            }
        }

        if let Ok(max) = std::env::var("RSTOMP_MAX_BODY_LENGTH") {
            if let Ok(n) = max.parse() {
                self.max_body_length = n;
            }
        }

        if let Some(flag) = env_flag("RSTOMP_TRAILING_LINE") {
            self.trailing_line = flag;
        }

        if let Some(flag) = env_flag("RSTOMP_SEND_ERROR_ON_NO_SUBSCRIPTIONS") {
            self.send_error_on_no_subscriptions = flag;
        }
    }

    /// Limits applied by the frame decoder.
    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_header_length: self.max_header_length,
            max_headers: self.max_headers,
            max_body_length: self.max_body_length,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supported_versions.is_empty() {
            return Err(ConfigError::ValidationError(
                "stomp.supported_versions must not be empty".to_string(),
            ));
        }
        if let Some(v) = self
            .supported_versions
            .iter()
            .find(|v| !SUPPORTED_VERSIONS.contains(&v.as_str()))
        {
            return Err(ConfigError::ValidationError(format!(
                "unsupported STOMP version '{}'",
                v
            )));
        }
        if self.transaction_chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "stomp.transaction_chunk_size must be positive".to_string(),
            ));
        }
        if self.time_factor == 0 {
            return Err(ConfigError::ValidationError(
                "stomp.time_factor must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rules used by the default destination factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationsConfig {
    /// Addresses starting with one of these prefixes are created as queues.
    pub queue_prefixes: Vec<String>,
}

impl Default for DestinationsConfig {
    fn default() -> Self {
        Self {
            queue_prefixes: vec!["/queue/".to_string()],
        }
    }
}

/// A configured user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub login: String,
    /// SHA-256 hex hash of the passcode.
    /// Generate with: `rstomp-cli hash-passcode <passcode>`
    pub passcode_hash: String,
}

impl UserEntry {
    /// Parses a `login:hash` line.
    fn parse(line: &str) -> Option<Self> {
        let (login, hash) = line.split_once(':')?;
        Some(Self {
            login: login.trim().to_string(),
            passcode_hash: hash.trim().to_string(),
        })
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether CONNECT frames must carry valid credentials.
    pub secured: bool,
    pub users: Vec<UserEntry>,
    /// Optional path to a secrets file with `login:hash` lines.
    pub secrets_file: Option<PathBuf>,
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(flag) = env_flag("RSTOMP_SECURED") {
            self.secured = flag;
        }

        if let Ok(user) = std::env::var("RSTOMP_AUTH_USER") {
            if let Some(entry) = UserEntry::parse(&user) {
                self.users.push(entry);
            }
        }

        if let Ok(path) = std::env::var("RSTOMP_AUTH_SECRETS_FILE") {
            self.secrets_file = Some(PathBuf::from(path));
        }
    }

    /// Loads users from the secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.secrets_file {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.clone(), e))?;
            for (n, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let entry = UserEntry::parse(line).ok_or_else(|| {
                    ConfigError::ParseError(
                        path.clone(),
                        format!("line {}: expected 'login:hash'", n + 1),
                    )
                })?;
                self.users.push(entry);
            }
        }
        Ok(())
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Path to PEM-encoded server certificate file.
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key file.
    pub key_path: Option<PathBuf>,
    /// Require client certificate authentication (mTLS).
    pub require_client_cert: bool,
    /// Path to PEM-encoded CA certificate(s) for verifying client certs.
    pub client_ca_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(flag) = env_flag("RSTOMP_TLS_ENABLED") {
            self.enabled = flag;
        }
        if let Ok(path) = std::env::var("RSTOMP_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("RSTOMP_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Some(flag) = env_flag("RSTOMP_TLS_REQUIRE_CLIENT_CERT") {
            self.require_client_cert = flag;
        }
        if let Ok(path) = std::env::var("RSTOMP_TLS_CLIENT_CA") {
            self.client_ca_path = Some(PathBuf::from(path));
        }
    }

    /// Validates TLS configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.cert_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but cert_path not set".to_string(),
            ));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but key_path not set".to_string(),
            ));
        }
        if self.require_client_cert && self.client_ca_path.is_none() {
            return Err(ConfigError::ValidationError(
                "mTLS enabled but client_ca_path not set".to_string(),
            ));
        }

        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(flag) = env_flag("RSTOMP_METRICS_ENABLED") {
            self.enabled = flag;
        }
        if let Ok(addr) = std::env::var("RSTOMP_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Bridge between STOMP destinations and the in-process event bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub enabled: bool,
    /// Addresses clients may SEND to.
    pub inbound: Vec<PermittedOptions>,
    /// Addresses clients may SUBSCRIBE to.
    pub outbound: Vec<PermittedOptions>,
    /// Deliver each bus message to a single subscriber.
    pub point_to_point: bool,
}

impl BridgeConfig {
    /// Checks that every `address_regex` compiles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for permitted in self.inbound.iter().chain(self.outbound.iter()) {
            permitted.compile().map_err(|e| {
                ConfigError::ValidationError(format!("invalid bridge address_regex: {}", e))
            })?;
        }
        Ok(())
    }

    pub fn to_options(&self) -> BridgeOptions {
        BridgeOptions {
            inbound: self.inbound.clone(),
            outbound: self.outbound.clone(),
            point_to_point: self.point_to_point,
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde module for SocketAddr (as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
