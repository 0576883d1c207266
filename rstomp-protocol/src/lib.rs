//! # rstomp-protocol
//!
//! STOMP wire protocol implementation (versions 1.0, 1.1 and 1.2).
//!
//! This crate provides:
//! - The STOMP command set and frame type with body validation
//! - Header escaping rules, including the literal encoding of CONNECT-like frames
//! - A streaming decoder that turns arbitrary byte chunks into frames and heartbeats
//! - Heartbeat declarations and ping/pong period negotiation

pub mod codec;
pub mod command;
pub mod error;
pub mod frame;
pub mod headers;
pub mod heartbeat;

pub use codec::{Decoder, Encoder, FrameLimits, StompItem};
pub use command::Command;
pub use error::ProtocolError;
pub use frame::Frame;
pub use headers::Headers;
pub use heartbeat::Heartbeat;

/// Default port for STOMP servers.
pub const DEFAULT_PORT: u16 = 61613;

/// Protocol versions supported by this implementation, most preferred first.
pub const SUPPORTED_VERSIONS: [&str; 3] = ["1.2", "1.1", "1.0"];

/// Version assumed when a CONNECT frame carries no `accept-version` header.
pub const DEFAULT_VERSION: &str = "1.0";

/// Maximum length of a header key or value.
pub const DEFAULT_MAX_HEADER_LENGTH: usize = 10 * 1024;

/// Maximum number of headers in a single frame.
pub const DEFAULT_MAX_HEADERS: usize = 1000;

/// Maximum frame body size (100 MiB).
pub const DEFAULT_MAX_BODY_LENGTH: usize = 100 * 1024 * 1024;
