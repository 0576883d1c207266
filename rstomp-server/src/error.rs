//! Server error types.
//!
//! Protocol and application errors carry the text of the `message` header of
//! the ERROR frame they produce.

use crate::transaction::TransactionError;
use rstomp_protocol::{Command, Frame};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame received")]
    Protocol(#[from] rstomp_protocol::ProtocolError),

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Incompatible versions")]
    IncompatibleVersions { supported: String },

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("{message}")]
    MissingHeader {
        command: Command,
        message: &'static str,
    },

    #[error("Invalid subscription")]
    InvalidSubscription(String),

    #[error("'id' already used by this connection.")]
    DuplicateSubscription(String),

    #[error("Too many subscriptions")]
    TooManySubscriptions { max: usize },

    #[error("No subscription associated with the given 'id'")]
    UnknownSubscription(String),

    #[error("Destination rejected")]
    DestinationRejected(String),

    #[error("No subscriptions")]
    NoSubscriptions(String),

    #[error("Access denied")]
    AccessDenied(String),

    #[error("No transaction")]
    NoTransaction(String),

    #[error("Frame not added to transaction")]
    TransactionOverflow { id: String, max: usize },

    #[error("Already existing transaction")]
    TransactionExists(String),

    #[error("Unknown transaction")]
    UnknownTransaction(String),

    #[error("Unsupported command")]
    UnsupportedCommand(Command),

    #[error("server shutting down")]
    ShuttingDown,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ServerError {
    /// Wraps a header-missing condition for `command`.
    pub fn missing_header(command: Command, message: &'static str) -> Self {
        ServerError::MissingHeader { command, message }
    }

    /// Whether the connection must be closed after the ERROR frame.
    pub fn closes_connection(&self) -> bool {
        !matches!(
            self,
            ServerError::DestinationRejected(_) | ServerError::UnsupportedCommand(_)
        )
    }

    /// Builds the ERROR frame reported to the peer.
    pub fn to_error_frame(&self, offending: Option<&Frame>) -> Frame {
        let message = self.to_string();
        match self {
            ServerError::IncompatibleVersions { supported } => {
                let detail = format!(
                    "Client protocol requirement does not mach versions supported by the server. \
                     Supported protocol versions are {}",
                    supported
                );
                let mut frame = Frame::error(&message, &detail);
                frame.set_header(rstomp_protocol::headers::VERSION, supported.as_str());
                frame
            }
            ServerError::AuthenticationFailed => Frame::error(
                &message,
                "The connection frame does not contain valid credentials.",
            ),
            ServerError::Protocol(e) => Frame::error(&message, &e.to_string()),
            ServerError::TransactionOverflow { id, max } => Frame::error(
                &message,
                &format!("Transaction '{}' exceeded {} buffered frames", id, max),
            ),
            _ => {
                let detail = offending.map(|f| f.to_string()).unwrap_or_default();
                Frame::error(&message, &detail)
            }
        }
    }
}

impl From<TransactionError> for ServerError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::AlreadyExists(id) => ServerError::TransactionExists(id),
            TransactionError::Unknown(id) => ServerError::UnknownTransaction(id),
            TransactionError::LimitExceeded { id, max } => {
                ServerError::TransactionOverflow { id, max }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstomp_protocol::Command;

    #[test]
    fn test_error_messages() {
        assert_eq!(ServerError::NotConnected.to_string(), "Not connected");
        assert_eq!(
            ServerError::missing_header(Command::Send, "Destination header missing").to_string(),
            "Destination header missing"
        );
        assert_eq!(
            ServerError::UnknownTransaction("tx".into()).to_string(),
            "Unknown transaction"
        );
    }

    #[test]
    fn test_incompatible_versions_frame() {
        let err = ServerError::IncompatibleVersions {
            supported: "1.2,1.1,1.0".to_string(),
        };
        let frame = err.to_error_frame(None);
        assert_eq!(frame.command(), Command::Error);
        assert_eq!(frame.header("message"), Some("Incompatible versions"));
        assert_eq!(frame.header("version"), Some("1.2,1.1,1.0"));
        assert_eq!(frame.header("content-type"), Some("text/plain"));
        assert!(frame.body_as_string().ends_with("1.2,1.1,1.0"));
    }

    #[test]
    fn test_error_frame_carries_offending_frame() {
        let offending = Frame::new(Command::Begin).with_header("transaction", "tx");
        let frame = ServerError::TransactionExists("tx".into()).to_error_frame(Some(&offending));
        assert!(frame.body_as_string().starts_with("BEGIN\ntransaction:tx"));
    }

    #[test]
    fn test_closes_connection() {
        assert!(ServerError::NotConnected.closes_connection());
        assert!(ServerError::UnknownTransaction("tx".into()).closes_connection());
        assert!(!ServerError::DestinationRejected("/a".into()).closes_connection());
        assert!(!ServerError::UnsupportedCommand(Command::Unknown).closes_connection());
    }

    #[test]
    fn test_from_transaction_error() {
        let err: ServerError = TransactionError::LimitExceeded {
            id: "tx".into(),
            max: 2,
        }
        .into();
        assert_eq!(err.to_string(), "Frame not added to transaction");
    }
}
