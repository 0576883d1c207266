//! STOMP commands.

use std::fmt;

/// A STOMP frame command.
///
/// Unrecognised command lines decode as [`Command::Unknown`] so the
/// connection state machine decides how to answer them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
    Stomp,
    Unknown,
}

impl Command {
    /// All commands, in declaration order.
    pub const ALL: [Command; 16] = [
        Command::Connect,
        Command::Connected,
        Command::Send,
        Command::Subscribe,
        Command::Unsubscribe,
        Command::Ack,
        Command::Nack,
        Command::Begin,
        Command::Commit,
        Command::Abort,
        Command::Disconnect,
        Command::Message,
        Command::Receipt,
        Command::Error,
        Command::Stomp,
        Command::Unknown,
    ];

    /// Parses a command line. Never fails.
    pub fn parse(line: &str) -> Self {
        match line {
            "CONNECT" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "STOMP" => Command::Stomp,
            _ => Command::Unknown,
        }
    }

    /// Returns the wire name of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Stomp => "STOMP",
            Command::Unknown => "UNKNOWN",
        }
    }

    /// Whether frames with this command may carry a non-empty body.
    pub fn accepts_body(&self) -> bool {
        matches!(
            self,
            Command::Send | Command::Message | Command::Error | Command::Unknown
        )
    }

    /// CONNECT, CONNECTED and STOMP use literal header values on the wire.
    pub fn is_connect_like(&self) -> bool {
        matches!(self, Command::Connect | Command::Connected | Command::Stomp)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        for command in Command::ALL {
            if command == Command::Unknown {
                continue;
            }
            assert_eq!(Command::parse(command.as_str()), command);
        }
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(Command::parse("FOO"), Command::Unknown);
        assert_eq!(Command::parse("send"), Command::Unknown);
        assert_eq!(Command::parse(""), Command::Unknown);
    }

    #[test]
    fn test_accepts_body() {
        assert!(Command::Send.accepts_body());
        assert!(Command::Message.accepts_body());
        assert!(Command::Error.accepts_body());
        assert!(Command::Unknown.accepts_body());
        assert!(!Command::Connect.accepts_body());
        assert!(!Command::Subscribe.accepts_body());
        assert!(!Command::Receipt.accepts_body());
    }

    #[test]
    fn test_connect_like() {
        assert!(Command::Connect.is_connect_like());
        assert!(Command::Connected.is_connect_like());
        assert!(Command::Stomp.is_connect_like());
        assert!(!Command::Send.is_connect_like());
    }
}
