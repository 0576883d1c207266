//! Frame headers and the header escaping rules.
//!
//! Header values are escaped on the wire as follows:
//!
//! ```text
//! +-----------+---------+------------------------------+
//! | character | escaped | CONNECT / CONNECTED / STOMP  |
//! +-----------+---------+------------------------------+
//! | \         | \\      | \\                           |
//! | LF        | \n      | literal                      |
//! | CR        | \r      | literal                      |
//! | :         | \c      | literal                      |
//! +-----------+---------+------------------------------+
//! ```

use crate::command::Command;
use crate::error::ProtocolError;
use std::borrow::Cow;

pub const CONTENT_LENGTH: &str = "content-length";
pub const CONTENT_TYPE: &str = "content-type";
pub const HOST: &str = "host";
pub const VERSION: &str = "version";
pub const ACCEPT_VERSION: &str = "accept-version";
pub const SESSION: &str = "session";
pub const SERVER: &str = "server";
pub const LOGIN: &str = "login";
pub const PASSCODE: &str = "passcode";
pub const HEARTBEAT: &str = "heart-beat";
pub const DESTINATION: &str = "destination";
pub const RECEIPT: &str = "receipt";
pub const RECEIPT_ID: &str = "receipt-id";
pub const ACK: &str = "ack";
pub const ID: &str = "id";
pub const SUBSCRIPTION: &str = "subscription";
pub const MESSAGE_ID: &str = "message-id";
pub const TRANSACTION: &str = "transaction";
pub const MESSAGE: &str = "message";

/// Ordered, case-sensitive header list.
///
/// The first value stored for a key wins when frames are decoded, which is
/// what [`Headers::add`] implements. [`Headers::set`] replaces in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Returns the value stored for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Inserts the header unless the key is already present.
    ///
    /// Returns `true` if the header was inserted.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if self.contains(&key) {
            return false;
        }
        self.entries.push((key, value.into()));
        true
    }

    /// Inserts the header, replacing any existing value for the key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.add(k, v);
        }
        headers
    }
}

/// Escapes a header key or value for the given command.
pub fn escape(value: &str, command: Command) -> Cow<'_, str> {
    let connect_like = command.is_connect_like();
    let needs_escape = value
        .chars()
        .any(|c| c == '\\' || (!connect_like && matches!(c, '\n' | '\r' | ':')));
    if !needs_escape {
        return Cow::Borrowed(value);
    }

    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' if !connect_like => out.push_str("\\n"),
            '\r' if !connect_like => out.push_str("\\r"),
            ':' if !connect_like => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

/// Reverses [`escape`].
///
/// For CONNECT-like commands only `\\` is decoded and every other backslash
/// sequence is kept as is. For other commands an unknown escape sequence is a
/// framing error.
pub fn unescape(value: &str, command: Command) -> Result<Cow<'_, str>, ProtocolError> {
    if !value.contains('\\') {
        return Ok(Cow::Borrowed(value));
    }

    let connect_like = command.is_connect_like();
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some(next) if connect_like => {
                out.push('\\');
                out.push(next);
            }
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(_) => return Err(ProtocolError::IllegalEscape),
            // trailing backslash
            None => out.push('\\'),
        }
    }
    Ok(Cow::Owned(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_add_keeps_first_value() {
        let mut headers = Headers::new();
        assert!(headers.add("foo", "1"));
        assert!(!headers.add("foo", "2"));
        assert_eq!(headers.get("foo"), Some("1"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut headers: Headers = [("a", "1"), ("b", "2")].into_iter().collect();
        headers.set("a", "3");
        headers.set("c", "4");
        let keys: Vec<_> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(headers.get("a"), Some("3"));
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        let headers: Headers = [("Foo", "1")].into_iter().collect();
        assert_eq!(headers.get("foo"), None);
        assert_eq!(headers.get("Foo"), Some("1"));
    }

    #[test]
    fn test_remove() {
        let mut headers: Headers = [("a", "1"), ("b", "2")].into_iter().collect();
        assert_eq!(headers.remove("a"), Some("1".to_string()));
        assert_eq!(headers.remove("a"), None);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_escape_regular_frame() {
        assert_eq!(escape("a:b\nc\rd\\e", Command::Send), "a\\cb\\nc\\rd\\\\e");
        assert!(matches!(escape("plain", Command::Send), Cow::Borrowed(_)));
    }

    #[test]
    fn test_escape_connect_frame() {
        assert_eq!(escape("a:b", Command::Connect), "a:b");
        assert_eq!(escape("a\\b", Command::Connected), "a\\\\b");
        assert_eq!(escape("host:61613", Command::Stomp), "host:61613");
    }

    #[test]
    fn test_unescape_regular_frame() {
        assert_eq!(
            unescape("a\\cb\\nc\\rd\\\\e", Command::Message).unwrap(),
            "a:b\nc\rd\\e"
        );
    }

    #[test]
    fn test_unescape_connect_frame_is_literal() {
        assert_eq!(unescape("a\\nb", Command::Connect).unwrap(), "a\\nb");
        assert_eq!(unescape("a\\\\b", Command::Connect).unwrap(), "a\\b");
    }

    #[test]
    fn test_unescape_illegal_sequence() {
        let result = unescape("a\\tb", Command::Send);
        assert!(matches!(result, Err(ProtocolError::IllegalEscape)));
    }

    #[test]
    fn test_unescape_trailing_backslash() {
        assert_eq!(unescape("abc\\", Command::Send).unwrap(), "abc\\");
    }

    proptest! {
        #[test]
        fn test_escape_roundtrip(value in "[a-z:\\\\\r\n ]{0,32}") {
            let escaped = escape(&value, Command::Send);
            prop_assert!(!escaped.contains('\n'));
            prop_assert!(!escaped.contains(':'));
            let decoded = unescape(&escaped, Command::Send).unwrap();
            prop_assert_eq!(decoded.as_ref(), value.as_str());
        }
    }
}
