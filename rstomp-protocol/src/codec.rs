//! Streaming encoder and decoder for STOMP frames.

use crate::command::Command;
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::headers::{self, unescape, Headers};
use crate::{DEFAULT_MAX_BODY_LENGTH, DEFAULT_MAX_HEADERS, DEFAULT_MAX_HEADER_LENGTH};
use bytes::{Buf, Bytes, BytesMut};

/// Heartbeat payload: a single end-of-line.
pub const HEARTBEAT: &[u8] = b"\n";

/// Encodes frames and heartbeats.
pub struct Encoder;

impl Encoder {
    /// Encodes a frame, optionally followed by an extra LF.
    pub fn encode_frame(frame: &Frame, trailing_line: bool) -> BytesMut {
        frame.encode(trailing_line)
    }

    /// Returns the heartbeat bytes.
    pub fn encode_heartbeat() -> &'static [u8] {
        HEARTBEAT
    }
}

/// Size limits enforced while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_header_length: usize,
    pub max_headers: usize,
    pub max_body_length: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_header_length: DEFAULT_MAX_HEADER_LENGTH,
            max_headers: DEFAULT_MAX_HEADERS,
            max_body_length: DEFAULT_MAX_BODY_LENGTH,
        }
    }
}

/// An item produced by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum StompItem {
    Frame(Frame),
    /// A bare end-of-line received outside of a frame.
    Heartbeat,
}

#[derive(Debug)]
enum State {
    Command,
    Headers {
        command: Command,
        headers: Headers,
    },
    Body {
        command: Command,
        headers: Headers,
        length: Option<usize>,
        scanned: usize,
    },
}

/// Incremental frame decoder.
///
/// Bytes may arrive in any fragmentation. After a fatal error the decoder
/// must be discarded.
pub struct Decoder {
    buffer: BytesMut,
    limits: FrameLimits,
    state: State,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_limits(FrameLimits::default())
    }

    pub fn with_limits(limits: FrameLimits) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            limits,
            state: State::Command,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame or heartbeat.
    ///
    /// Returns `Ok(None)` when more data is needed.
    pub fn decode(&mut self) -> Result<Option<StompItem>, ProtocolError> {
        loop {
            match std::mem::replace(&mut self.state, State::Command) {
                State::Command => {
                    let Some(line) = self.next_line("command")? else {
                        return Ok(None);
                    };
                    // only a bare EOL is a heartbeat
                    if line.is_empty() {
                        return Ok(Some(StompItem::Heartbeat));
                    }
                    self.state = State::Headers {
                        command: Command::parse(&line),
                        headers: Headers::new(),
                    };
                }
                State::Headers {
                    command,
                    mut headers,
                } => {
                    let Some(line) = self.next_line("header")? else {
                        self.state = State::Headers { command, headers };
                        return Ok(None);
                    };
                    if line.is_empty() {
                        // malformed content-length falls back to NUL scanning
                        let length = headers
                            .get(headers::CONTENT_LENGTH)
                            .and_then(|v| v.trim().parse::<usize>().ok());
                        if let Some(len) = length {
                            if len > self.limits.max_body_length {
                                return Err(self.body_too_large(len));
                            }
                        }
                        self.state = State::Body {
                            command,
                            headers,
                            length,
                            scanned: 0,
                        };
                        continue;
                    }
                    parse_header(&line, command, &mut headers, &self.limits)?;
                    self.state = State::Headers { command, headers };
                }
                State::Body {
                    command,
                    headers,
                    length,
                    mut scanned,
                } => {
                    let Some(body) = self.take_body(length, &mut scanned)? else {
                        self.state = State::Body {
                            command,
                            headers,
                            length,
                            scanned,
                        };
                        return Ok(None);
                    };
                    let body = if body.is_empty() && !command.accepts_body() {
                        None
                    } else {
                        Some(body)
                    };
                    return Frame::try_new(command, headers, body)
                        .map(|frame| Some(StompItem::Frame(frame)));
                }
            }
        }
    }

    /// Takes the body and its NUL terminator off the buffer.
    fn take_body(
        &mut self,
        length: Option<usize>,
        scanned: &mut usize,
    ) -> Result<Option<Bytes>, ProtocolError> {
        if let Some(len) = length {
            if self.buffer.len() < len + 1 {
                return Ok(None);
            }
            let body = self.buffer.split_to(len).freeze();
            if self.buffer[0] != 0 {
                return Err(ProtocolError::MalformedFrame("missing NUL after body"));
            }
            self.buffer.advance(1);
            return Ok(Some(body));
        }

        let start = *scanned;
        match self.buffer[start..].iter().position(|&b| b == 0) {
            Some(pos) => {
                let end = start + pos;
                if end > self.limits.max_body_length {
                    return Err(self.body_too_large(end));
                }
                let body = self.buffer.split_to(end).freeze();
                self.buffer.advance(1);
                Ok(Some(body))
            }
            None => {
                if self.buffer.len() > self.limits.max_body_length {
                    return Err(self.body_too_large(self.buffer.len()));
                }
                *scanned = self.buffer.len();
                Ok(None)
            }
        }
    }

    /// Attempts to decode the next frame, skipping heartbeats.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match self.decode()? {
                Some(StompItem::Frame(frame)) => return Ok(Some(frame)),
                Some(StompItem::Heartbeat) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer and any partially decoded frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::Command;
    }

    pub fn limits(&self) -> &FrameLimits {
        &self.limits
    }

    /// Takes one line off the buffer, without its EOL (LF or CRLF).
    fn next_line(&mut self, what: &'static str) -> Result<Option<String>, ProtocolError> {
        let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
            // key, colon and value of the longest acceptable header
            let max_line = self.limits.max_header_length * 2 + 1;
            if self.buffer.len() > max_line {
                return Err(ProtocolError::HeaderTooLong {
                    size: self.buffer.len(),
                    max: max_line,
                });
            }
            return Ok(None);
        };
        let mut line = self.buffer.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }
        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|_| ProtocolError::InvalidUtf8(what))
    }

    fn body_too_large(&self, size: usize) -> ProtocolError {
        ProtocolError::BodyTooLarge {
            size,
            max: self.limits.max_body_length,
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_header(
    line: &str,
    command: Command,
    headers: &mut Headers,
    limits: &FrameLimits,
) -> Result<(), ProtocolError> {
    let (key, value) = line
        .split_once(':')
        .ok_or_else(|| ProtocolError::InvalidHeaderLine(line.to_string()))?;

    for part in [key, value] {
        if part.len() > limits.max_header_length {
            return Err(ProtocolError::HeaderTooLong {
                size: part.len(),
                max: limits.max_header_length,
            });
        }
    }
    if headers.len() >= limits.max_headers {
        return Err(ProtocolError::TooManyHeaders {
            max: limits.max_headers,
        });
    }

    let key = unescape(key, command)?;
    let value = unescape(value, command)?;
    headers.add(key.into_owned(), value.into_owned());
    Ok(())
}
