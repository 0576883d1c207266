//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] rstomp_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,

    #[error("server error: {message}")]
    ServerError { message: String, body: String },

    #[error("subscription id already in use: {0}")]
    DuplicateSubscription(String),

    #[error("invalid ack mode: {0}")]
    InvalidAckMode(String),

    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ClientError {
    /// Returns whether reconnecting and retrying may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Timeout | ClientError::ConnectionClosed
        )
    }

    /// Builds the error reported for an ERROR frame.
    pub(crate) fn from_error_frame(frame: &rstomp_protocol::Frame) -> Self {
        ClientError::ServerError {
            message: frame
                .header(rstomp_protocol::headers::MESSAGE)
                .unwrap_or_default()
                .to_string(),
            body: frame.body_as_string().into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstomp_protocol::Frame;

    #[test]
    fn test_retryable() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(!ClientError::NotConnected.is_retryable());
        assert!(!ClientError::UnknownSubscription("s".into()).is_retryable());
    }

    #[test]
    fn test_from_error_frame() {
        let frame = Frame::error("Access denied", "SEND\n\n^@");
        match ClientError::from_error_frame(&frame) {
            ClientError::ServerError { message, body } => {
                assert_eq!(message, "Access denied");
                assert_eq!(body, "SEND\n\n^@");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
