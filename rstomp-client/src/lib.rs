//! # rstomp-client
//!
//! Async STOMP client for rstomp.
//!
//! This crate provides:
//! - Connection establishment with version and heartbeat negotiation
//! - Receipt tracking for frames that need confirmation
//! - Subscriptions delivering MESSAGE frames over channels
//! - Transactions and acknowledgements
//! - Optional TLS support

pub mod client;
pub mod connection;
pub mod error;
pub mod stream;
pub mod tls;

pub use client::{Ack, Client, Subscription};
pub use connection::{ClientOptions, Connection};
pub use tls::TlsClientConfig;
pub use error::ClientError;
