//! # rstomp-server
//!
//! STOMP broker engine for rstomp.
//!
//! This crate provides:
//! - TCP connection handling with async I/O and optional TLS
//! - Version and heartbeat negotiation, authentication
//! - Topic, queue, bridge and custom destinations
//! - Transactions and client / client-individual acknowledgement
//! - An event bus bridge with inbound and outbound permissions
//! - Prometheus metrics

pub mod auth;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod destination;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod stream;
pub mod subscription;
pub mod tls;
pub mod transaction;

pub use auth::{AuthProvider, CredentialStore, User};
pub use bridge::{Bridge, BridgeOptions, PermittedOptions};
pub use bus::{create_local_bus, BusMessage, LocalBus, MessageBus};
pub use config::{Config, StompOptions, TlsConfig};
pub use destination::{CustomDestination, Destination, DestinationFactory, PrefixFactory};
pub use error::ServerError;
pub use handler::StompHandler;
pub use metrics::Metrics;
pub use registry::DestinationRegistry;
pub use server::{Server, ServerConfig};
pub use session::{ConnectionHandle, Session};
pub use subscription::{AckMode, Acknowledgement, Subscription};
pub use transaction::Transactions;
