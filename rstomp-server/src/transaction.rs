//! Server-wide transaction table.
//!
//! Transactions are keyed by `(connection, transaction id)` so independent
//! connections may reuse the same id.

use crate::session::ConnectionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rstomp_protocol::Frame;
use thiserror::Error;

/// Transaction table errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("transaction '{0}' already exists")]
    AlreadyExists(String),

    #[error("unknown transaction '{0}'")]
    Unknown(String),

    #[error("transaction '{id}' exceeded {max} frames")]
    LimitExceeded { id: String, max: usize },
}

#[derive(Debug)]
struct Transaction {
    frames: Vec<Frame>,
}

/// Open transactions of every connection.
#[derive(Debug)]
pub struct Transactions {
    open: DashMap<(ConnectionId, String), Transaction>,
    max_frames: usize,
}

impl Transactions {
    /// Creates a table allowing at most `max_frames` buffered frames per transaction.
    pub fn new(max_frames: usize) -> Self {
        Self {
            open: DashMap::new(),
            max_frames,
        }
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn begin(&self, connection: ConnectionId, id: &str) -> Result<(), TransactionError> {
        match self.open.entry((connection, id.to_string())) {
            Entry::Occupied(_) => Err(TransactionError::AlreadyExists(id.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(Transaction { frames: Vec::new() });
                Ok(())
            }
        }
    }

    pub fn exists(&self, connection: ConnectionId, id: &str) -> bool {
        self.open.contains_key(&(connection, id.to_string()))
    }

    /// Buffers a frame. On overflow the whole transaction is dropped.
    pub fn add_frame(
        &self,
        connection: ConnectionId,
        id: &str,
        frame: Frame,
    ) -> Result<usize, TransactionError> {
        let key = (connection, id.to_string());
        {
            let mut tx = self
                .open
                .get_mut(&key)
                .ok_or_else(|| TransactionError::Unknown(id.to_string()))?;
            if tx.frames.len() < self.max_frames {
                tx.frames.push(frame);
                return Ok(tx.frames.len());
            }
        }
        // shard guard released above
        self.open.remove(&key);
        Err(TransactionError::LimitExceeded {
            id: id.to_string(),
            max: self.max_frames,
        })
    }

    /// Removes the transaction and returns its frames in insertion order.
    pub fn commit(&self, connection: ConnectionId, id: &str) -> Result<Vec<Frame>, TransactionError> {
        self.open
            .remove(&(connection, id.to_string()))
            .map(|(_, tx)| tx.frames)
            .ok_or_else(|| TransactionError::Unknown(id.to_string()))
    }

    /// Removes the transaction, discarding its frames.
    pub fn abort(&self, connection: ConnectionId, id: &str) -> Result<usize, TransactionError> {
        self.commit(connection, id).map(|frames| frames.len())
    }

    /// Aborts every transaction of `connection`. Returns how many were open.
    pub fn on_connection_closed(&self, connection: ConnectionId) -> usize {
        let before = self.open.len();
        self.open.retain(|(owner, _), _| *owner != connection);
        before.saturating_sub(self.open.len())
    }

    pub fn count(&self) -> usize {
        self.open.len()
    }

    pub fn count_for(&self, connection: ConnectionId) -> usize {
        self.open.iter().filter(|e| e.key().0 == connection).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstomp_protocol::Command;

    fn send(body: &str) -> Frame {
        Frame::new(Command::Send)
            .with_header("destination", "/queue/a")
            .with_body(body.to_string())
            .unwrap()
    }

    #[test]
    fn test_begin_twice_fails() {
        let txs = Transactions::new(10);
        txs.begin(1, "tx").unwrap();
        assert_eq!(
            txs.begin(1, "tx"),
            Err(TransactionError::AlreadyExists("tx".into()))
        );
        // other connections are independent
        txs.begin(2, "tx").unwrap();
        assert_eq!(txs.count(), 2);
    }

    #[test]
    fn test_id_reusable_after_commit_or_abort() {
        let txs = Transactions::new(10);
        txs.begin(1, "tx").unwrap();
        txs.commit(1, "tx").unwrap();
        txs.begin(1, "tx").unwrap();
        txs.abort(1, "tx").unwrap();
        txs.begin(1, "tx").unwrap();
    }

    #[test]
    fn test_commit_preserves_order() {
        let txs = Transactions::new(10);
        txs.begin(1, "tx").unwrap();
        for body in ["a", "b", "c"] {
            txs.add_frame(1, "tx", send(body)).unwrap();
        }
        let frames = txs.commit(1, "tx").unwrap();
        let bodies: Vec<_> = frames.iter().map(|f| f.body_as_string().to_string()).collect();
        assert_eq!(bodies, vec!["a", "b", "c"]);
        assert!(!txs.exists(1, "tx"));
    }

    #[test]
    fn test_unknown_transaction() {
        let txs = Transactions::new(10);
        assert_eq!(
            txs.commit(1, "nope").unwrap_err(),
            TransactionError::Unknown("nope".into())
        );
        assert_eq!(
            txs.abort(1, "nope").unwrap_err(),
            TransactionError::Unknown("nope".into())
        );
        assert_eq!(
            txs.add_frame(1, "nope", send("x")).unwrap_err(),
            TransactionError::Unknown("nope".into())
        );
    }

    #[test]
    fn test_overflow_drops_transaction() {
        let txs = Transactions::new(2);
        txs.begin(1, "tx").unwrap();
        txs.add_frame(1, "tx", send("1")).unwrap();
        txs.add_frame(1, "tx", send("2")).unwrap();
        assert_eq!(
            txs.add_frame(1, "tx", send("3")).unwrap_err(),
            TransactionError::LimitExceeded {
                id: "tx".into(),
                max: 2
            }
        );
        assert!(!txs.exists(1, "tx"));
        assert!(txs.commit(1, "tx").is_err());
    }

    #[test]
    fn test_connection_closed_aborts_all() {
        let txs = Transactions::new(10);
        txs.begin(1, "a").unwrap();
        txs.begin(1, "b").unwrap();
        txs.begin(2, "a").unwrap();
        assert_eq!(txs.count_for(1), 2);
        assert_eq!(txs.on_connection_closed(1), 2);
        assert_eq!(txs.on_connection_closed(1), 0);
        assert_eq!(txs.count(), 1);
        assert!(txs.exists(2, "a"));
    }
}
