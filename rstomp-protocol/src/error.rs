//! Framing error types.

use thiserror::Error;

/// Framing errors raised while building, decoding or encoding frames.
///
/// Every variant is fatal for the connection that produced it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("The frame {0} cannot have a body")]
    BodyNotAllowed(&'static str),

    #[error("Invalid header line: {0}")]
    InvalidHeaderLine(String),

    #[error("Incorrect header value - the header uses an illegal escaped character")]
    IllegalEscape,

    #[error("Number of headers exceeded (max {max})")]
    TooManyHeaders { max: usize },

    #[error("Header length exceeded: {size} bytes (max {max})")]
    HeaderTooLong { size: usize, max: usize },

    #[error("Body size exceeded: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("Malformed frame received: {0}")]
    MalformedFrame(&'static str),

    #[error("invalid heart-beat header: {0:?}")]
    InvalidHeartbeat(String),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
