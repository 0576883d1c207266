//! STOMP frames.
//!
//! Wire layout:
//!
//! ```text
//! COMMAND LF
//! key:value LF        (zero or more, escaped per command)
//! LF
//! body                (content-length bytes, or up to the NUL)
//! NUL [LF]            (LF only in trailing-line mode)
//! ```

use crate::command::Command;
use crate::error::ProtocolError;
use crate::headers::{self, escape, Headers};
use bytes::{BufMut, Bytes, BytesMut};
use std::borrow::Cow;
use std::fmt;

/// A single STOMP frame: command, ordered headers and optional body.
///
/// An absent body (`None`) is distinct from an empty one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: Command,
    headers: Headers,
    body: Option<Bytes>,
}

impl Frame {
    /// Creates a frame with no headers and no body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Headers::new(),
            body: None,
        }
    }

    /// Creates a frame, rejecting bodies on commands that cannot carry one.
    pub fn try_new(
        command: Command,
        headers: Headers,
        body: Option<Bytes>,
    ) -> Result<Self, ProtocolError> {
        check_body(command, body.as_ref())?;
        Ok(Self {
            command,
            headers,
            body,
        })
    }

    /// Builds an ERROR frame with a `message` header and a plain-text body.
    pub fn error(message: &str, detail: &str) -> Self {
        let mut frame = Frame::new(Command::Error)
            .with_header(headers::MESSAGE, message)
            .with_header(headers::CONTENT_TYPE, "text/plain");
        if !detail.is_empty() {
            frame
                .headers
                .set(headers::CONTENT_LENGTH, detail.len().to_string());
            frame.body = Some(Bytes::copy_from_slice(detail.as_bytes()));
        }
        frame
    }

    /// Builds a MESSAGE frame. MESSAGE frames always accept a body.
    pub fn message(headers: Headers, body: Option<Bytes>) -> Self {
        Self {
            command: Command::Message,
            headers,
            body,
        }
    }

    /// Builds a RECEIPT frame answering `receipt_id`.
    pub fn receipt(receipt_id: &str) -> Self {
        Frame::new(Command::Receipt).with_header(headers::RECEIPT_ID, receipt_id)
    }

    /// Adds a header unless it is already present.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(key, value);
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let body = body.into();
        check_body(self.command, Some(&body))?;
        self.body = Some(body);
        Ok(self)
    }

    /// Sets a header, replacing any existing value.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.set(key, value);
    }

    pub fn remove_header(&mut self, key: &str) -> Option<String> {
        self.headers.remove(key)
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn has_body(&self) -> bool {
        self.body.as_ref().is_some_and(|b| !b.is_empty())
    }

    /// Body decoded as UTF-8, lossily. Empty when there is no body.
    pub fn body_as_string(&self) -> Cow<'_, str> {
        match &self.body {
            Some(body) => String::from_utf8_lossy(body),
            None => Cow::Borrowed(""),
        }
    }

    pub fn into_parts(self) -> (Command, Headers, Option<Bytes>) {
        (self.command, self.headers, self.body)
    }

    pub fn destination(&self) -> Option<&str> {
        self.header(headers::DESTINATION)
    }

    pub fn id(&self) -> Option<&str> {
        self.header(headers::ID)
    }

    pub fn receipt_header(&self) -> Option<&str> {
        self.header(headers::RECEIPT)
    }

    pub fn transaction(&self) -> Option<&str> {
        self.header(headers::TRANSACTION)
    }

    pub fn ack(&self) -> Option<&str> {
        self.header(headers::ACK)
    }

    /// Parsed `content-length`, if present and valid.
    pub fn content_length(&self) -> Option<usize> {
        self.header(headers::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
    }

    /// The `charset` parameter of `content-type`, defaulting to UTF-8.
    pub fn charset(&self) -> &str {
        self.header(headers::CONTENT_TYPE)
            .and_then(|ct| {
                ct.split(';')
                    .skip(1)
                    .filter_map(|p| p.trim().strip_prefix("charset="))
                    .next()
            })
            .unwrap_or("utf-8")
    }

    /// Encodes the frame to wire bytes.
    pub fn encode(&self, trailing_line: bool) -> BytesMut {
        let body_len = self.body.as_ref().map_or(0, |b| b.len());
        let mut buf = BytesMut::with_capacity(64 + self.headers.len() * 32 + body_len);

        buf.put_slice(self.command.as_str().as_bytes());
        buf.put_u8(b'\n');

        for (key, value) in self.headers.iter() {
            buf.put_slice(escape(key, self.command).as_bytes());
            buf.put_u8(b':');
            buf.put_slice(escape(value, self.command).as_bytes());
            buf.put_u8(b'\n');
        }
        buf.put_u8(b'\n');

        if let Some(body) = &self.body {
            buf.put_slice(body);
        }
        buf.put_u8(0);
        if trailing_line {
            buf.put_u8(b'\n');
        }
        buf
    }
}

fn check_body(command: Command, body: Option<&Bytes>) -> Result<(), ProtocolError> {
    let Some(body) = body else {
        return Ok(());
    };
    if matches!(command, Command::Connect | Command::Connected)
        || (!body.is_empty() && !command.accepts_body())
    {
        return Err(ProtocolError::BodyNotAllowed(command.as_str()));
    }
    Ok(())
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.command)?;
        for (key, value) in self.headers.iter() {
            if key == headers::PASSCODE {
                writeln!(f, "{}:********", key)?;
            } else {
                writeln!(f, "{}:{}", key, value)?;
            }
        }
        writeln!(f)?;
        write!(f, "{}^@", self.body_as_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Decoder, StompItem};

    fn decode_one(bytes: &[u8]) -> Frame {
        let mut decoder = Decoder::new();
        decoder.extend(bytes);
        match decoder.decode().unwrap() {
            Some(StompItem::Frame(frame)) => frame,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_send() {
        let frame = Frame::new(Command::Send)
            .with_header("destination", "/queue/a")
            .with_body("hello")
            .unwrap();
        assert_eq!(
            &frame.encode(false)[..],
            b"SEND\ndestination:/queue/a\n\nhello\0"
        );
        assert_eq!(
            &frame.encode(true)[..],
            b"SEND\ndestination:/queue/a\n\nhello\0\n"
        );
    }

    #[test]
    fn test_connect_with_body_fails() {
        let result = Frame::try_new(
            Command::Connect,
            Headers::new(),
            Some(Bytes::from_static(b"body")),
        );
        assert!(matches!(result, Err(ProtocolError::BodyNotAllowed("CONNECT"))));

        let result = Frame::new(Command::Connected).with_body("x");
        assert!(matches!(
            result,
            Err(ProtocolError::BodyNotAllowed("CONNECTED"))
        ));

        // even an empty body is refused on the handshake frames
        let result = Frame::try_new(Command::Connect, Headers::new(), Some(Bytes::new()));
        assert!(result.is_err());
    }

    #[test]
    fn test_body_rules_for_other_commands() {
        assert!(Frame::new(Command::Subscribe).with_body("x").is_err());
        assert!(Frame::new(Command::Subscribe).with_body("").is_ok());
        assert!(Frame::new(Command::Message).with_body("x").is_ok());
        assert!(Frame::new(Command::Error).with_body("x").is_ok());
    }

    #[test]
    fn test_headers_roundtrip_with_escaping() {
        let frame = Frame::new(Command::Send)
            .with_header("destination", "/a")
            .with_header("weird", "a:b\nc\rd\\e")
            .with_header("k:ey", "v");
        let decoded = decode_one(&frame.encode(false));
        assert_eq!(decoded.headers(), frame.headers());
    }

    #[test]
    fn test_connect_headers_roundtrip_literal() {
        let frame = Frame::new(Command::Connect)
            .with_header("accept-version", "1.2")
            .with_header("host", "broker:61613")
            .with_header("login", "a\\b");
        let encoded = frame.encode(false);
        assert!(std::str::from_utf8(&encoded)
            .unwrap()
            .contains("host:broker:61613\n"));
        let decoded = decode_one(&encoded);
        assert_eq!(decoded.headers(), frame.headers());
        assert_eq!(decoded.body(), None);
    }

    #[test]
    fn test_error_frame() {
        let frame = Frame::error("Not connected", "detail");
        assert_eq!(frame.command(), Command::Error);
        assert_eq!(frame.header("message"), Some("Not connected"));
        assert_eq!(frame.header("content-type"), Some("text/plain"));
        assert_eq!(frame.content_length(), Some(6));
        assert_eq!(frame.body_as_string(), "detail");
    }

    #[test]
    fn test_receipt_frame() {
        let frame = Frame::receipt("r-1");
        assert_eq!(frame.command(), Command::Receipt);
        assert_eq!(frame.header("receipt-id"), Some("r-1"));
        assert!(!frame.has_body());
    }

    #[test]
    fn test_display_masks_passcode() {
        let frame = Frame::new(Command::Connect)
            .with_header("login", "admin")
            .with_header("passcode", "secret");
        let text = frame.to_string();
        assert!(text.contains("passcode:********"));
        assert!(!text.contains("secret"));
        assert!(text.ends_with("^@"));
    }

    #[test]
    fn test_charset() {
        let frame = Frame::new(Command::Send);
        assert_eq!(frame.charset(), "utf-8");
        let frame = frame.with_header("content-type", "text/plain;charset=iso-8859-1");
        assert_eq!(frame.charset(), "iso-8859-1");
    }

    #[test]
    fn test_accessors() {
        let frame = Frame::new(Command::Ack)
            .with_header("id", "m-1")
            .with_header("transaction", "tx")
            .with_header("receipt", "r");
        assert_eq!(frame.id(), Some("m-1"));
        assert_eq!(frame.transaction(), Some("tx"));
        assert_eq!(frame.receipt_header(), Some("r"));
        assert_eq!(frame.destination(), None);
    }
}
