//! High-level client API.

use crate::connection::{ClientOptions, Connection};
use crate::error::ClientError;
use bytes::Bytes;
use rstomp_protocol::{headers, Command, Frame, Headers};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Acknowledgement mode requested in SUBSCRIBE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ack {
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl Ack {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ack::Auto => "auto",
            Ack::Client => "client",
            Ack::ClientIndividual => "client-individual",
        }
    }
}

impl std::str::FromStr for Ack {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Ack::Auto),
            "client" => Ok(Ack::Client),
            "client-individual" => Ok(Ack::ClientIndividual),
            other => Err(format!("unknown ack mode: {}", other)),
        }
    }
}

/// MESSAGE frames delivered to one subscription.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    destination: String,
    ack: Ack,
    messages: mpsc::UnboundedReceiver<Frame>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn ack_mode(&self) -> Ack {
        self.ack
    }

    /// Waits for the next message. `None` once the subscription or the
    /// connection is closed.
    pub async fn next(&mut self) -> Option<Frame> {
        self.messages.recv().await
    }

    pub fn try_next(&mut self) -> Option<Frame> {
        self.messages.try_recv().ok()
    }
}

/// High-level STOMP client.
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Connects to the server described by `options`.
    pub async fn connect(options: ClientOptions) -> Result<Self, ClientError> {
        Ok(Self {
            conn: Connection::open(options).await?,
        })
    }

    /// Returns the underlying connection (hooks, raw frames).
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn version(&self) -> &str {
        self.conn.version()
    }

    pub fn session(&self) -> Option<&str> {
        self.conn.session()
    }

    pub fn server(&self) -> Option<&str> {
        self.conn.server()
    }

    /// ERROR frames received from now on.
    pub fn errors(&self) -> broadcast::Receiver<Frame> {
        self.conn.errors()
    }

    fn send_frame(
        &self,
        destination: &str,
        mut headers: Headers,
        body: Bytes,
    ) -> Result<Frame, ClientError> {
        headers.set(headers::DESTINATION, destination);
        if self.conn.options().auto_compute_content_length {
            headers.add(headers::CONTENT_LENGTH, body.len().to_string());
        }
        Ok(Frame::try_new(Command::Send, headers, Some(body))?)
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Sends `body` to `destination`.
    pub async fn send(&self, destination: &str, body: impl Into<Bytes>) -> Result<(), ClientError> {
        self.send_with_headers(destination, Headers::new(), body).await
    }

    pub async fn send_with_headers(
        &self,
        destination: &str,
        headers: Headers,
        body: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        let frame = self.send_frame(destination, headers, body.into())?;
        self.conn.write_frame(frame).await
    }

    /// Sends and waits until the server confirms with a RECEIPT.
    pub async fn send_with_receipt(
        &self,
        destination: &str,
        headers: Headers,
        body: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        let frame = self.send_frame(destination, headers, body.into())?;
        self.conn.request(frame).await?;
        Ok(())
    }

    /// Subscribes to `destination` with the destination as subscription id.
    pub async fn subscribe(&self, destination: &str, ack: Ack) -> Result<Subscription, ClientError> {
        let mut headers = Headers::new();
        headers.set(headers::ACK, ack.as_str());
        self.subscribe_with_headers(destination, headers).await
    }

    /// Subscribes with caller-provided headers. The `id` header defaults to the
    /// destination. Returns once the server has confirmed the subscription.
    pub async fn subscribe_with_headers(
        &self,
        destination: &str,
        mut headers: Headers,
    ) -> Result<Subscription, ClientError> {
        let id = headers.get(headers::ID).unwrap_or(destination).to_string();
        let ack = match headers.get(headers::ACK) {
            Some(mode) => mode
                .parse()
                .map_err(|_| ClientError::InvalidAckMode(mode.to_string()))?,
            None => Ack::Auto,
        };
        headers.set(headers::DESTINATION, destination);
        headers.set(headers::ID, id.as_str());

        let messages = self.conn.register_subscription(&id)?;
        let frame = Frame::try_new(Command::Subscribe, headers, None)?;
        if let Err(e) = self.conn.request(frame).await {
            self.conn.remove_subscription(&id);
            return Err(e);
        }

        Ok(Subscription {
            id,
            destination: destination.to_string(),
            ack,
            messages,
        })
    }

    /// Cancels the subscription `id` and waits for the server to confirm.
    pub async fn unsubscribe(&self, id: &str) -> Result<(), ClientError> {
        if !self.conn.has_subscription(id) {
            return Err(ClientError::UnknownSubscription(id.to_string()));
        }
        let frame = Frame::new(Command::Unsubscribe).with_header(headers::ID, id);
        self.conn.request(frame).await?;
        self.conn.remove_subscription(id);
        Ok(())
    }

    /// Acknowledges a message, by the value of its `ack` (1.2) or
    /// `message-id` header.
    pub async fn ack(&self, id: &str, transaction: Option<&str>) -> Result<(), ClientError> {
        self.acknowledge(Command::Ack, id, transaction).await
    }

    pub async fn nack(&self, id: &str, transaction: Option<&str>) -> Result<(), ClientError> {
        self.acknowledge(Command::Nack, id, transaction).await
    }

    /// Acknowledges a received MESSAGE frame.
    pub async fn ack_message(&self, message: &Frame) -> Result<(), ClientError> {
        let id = message
            .header(headers::ACK)
            .or_else(|| message.header(headers::MESSAGE_ID))
            .unwrap_or_default();
        self.ack(id, None).await
    }

    async fn acknowledge(
        &self,
        command: Command,
        id: &str,
        transaction: Option<&str>,
    ) -> Result<(), ClientError> {
        let mut frame = Frame::new(command).with_header(headers::ID, id);
        if let Some(tx) = transaction {
            frame.set_header(headers::TRANSACTION, tx);
        }
        self.conn.write_frame(frame).await
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Opens a transaction. A random id is used when none is given.
    pub async fn begin(&self, id: Option<&str>) -> Result<String, ClientError> {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let frame = Frame::new(Command::Begin).with_header(headers::TRANSACTION, id.as_str());
        self.conn.write_frame(frame).await?;
        Ok(id)
    }

    /// Commits and waits until every buffered frame has been applied.
    pub async fn commit(&self, id: &str) -> Result<(), ClientError> {
        let frame = Frame::new(Command::Commit).with_header(headers::TRANSACTION, id);
        self.conn.request(frame).await?;
        Ok(())
    }

    pub async fn abort(&self, id: &str) -> Result<(), ClientError> {
        let frame = Frame::new(Command::Abort).with_header(headers::TRANSACTION, id);
        self.conn.request(frame).await?;
        Ok(())
    }

    /// Sends `body` to `destination` as part of transaction `tx`.
    pub async fn send_in_transaction(
        &self,
        tx: &str,
        destination: &str,
        body: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        let mut headers = Headers::new();
        headers.set(headers::TRANSACTION, tx);
        self.send_with_headers(destination, headers, body).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Sends DISCONNECT, waits for its receipt and closes the transport.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let result = self.conn.request(Frame::new(Command::Disconnect)).await;
        self.conn.close().await?;
        result.map(|_| ())
    }

    /// Closes the transport without DISCONNECT.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::spawn_fake_server;

    #[test]
    fn test_ack_parse() {
        assert_eq!("client".parse::<Ack>().unwrap(), Ack::Client);
        assert_eq!(
            "client-individual".parse::<Ack>().unwrap(),
            Ack::ClientIndividual
        );
        assert!("manual".parse::<Ack>().is_err());
        assert_eq!(Ack::default().as_str(), "auto");
    }

    #[tokio::test]
    async fn test_send_computes_content_length() {
        let (addr, server) = spawn_fake_server(|mut server| async move {
            server.accept_connect().await;
            let send = server.next_frame().await.unwrap();
            assert_eq!(send.command(), Command::Send);
            assert_eq!(send.header("destination"), Some("/queue/a"));
            assert_eq!(send.header("content-length"), Some("5"));
            assert_eq!(send.body_as_string(), "hello");
        })
        .await;

        let client = Client::connect(ClientOptions::new(addr)).await.unwrap();
        client.send("/queue/a", "hello").await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let (addr, _server) = spawn_fake_server(|mut server| async move {
            server.accept_connect().await;
            let subscribe = server.next_frame().await.unwrap();
            assert_eq!(subscribe.header("id"), Some("/topic/t"));
            assert_eq!(subscribe.header("ack"), Some("client"));
            server
                .send(Frame::receipt(subscribe.receipt_header().unwrap()))
                .await;
            let unsubscribe = server.next_frame().await.unwrap();
            assert_eq!(unsubscribe.header("id"), Some("/topic/t"));
            server
                .send(Frame::receipt(unsubscribe.receipt_header().unwrap()))
                .await;
            server.next_frame().await;
        })
        .await;

        let client = Client::connect(ClientOptions::new(addr)).await.unwrap();
        let subscription = client.subscribe("/topic/t", Ack::Client).await.unwrap();
        assert_eq!(subscription.id(), "/topic/t");
        assert_eq!(subscription.ack_mode(), Ack::Client);

        assert!(matches!(
            client.subscribe("/topic/t", Ack::Auto).await,
            Err(ClientError::DuplicateSubscription(_))
        ));

        client.unsubscribe("/topic/t").await.unwrap();
        assert!(matches!(
            client.unsubscribe("/topic/t").await,
            Err(ClientError::UnknownSubscription(_))
        ));
    }

    #[tokio::test]
    async fn test_transaction_frames() {
        let (addr, _server) = spawn_fake_server(|mut server| async move {
            server.accept_connect().await;
            let begin = server.next_frame().await.unwrap();
            assert_eq!(begin.command(), Command::Begin);
            let tx = begin.transaction().unwrap().to_string();
            let send = server.next_frame().await.unwrap();
            assert_eq!(send.transaction(), Some(tx.as_str()));
            let ack = server.next_frame().await.unwrap();
            assert_eq!(ack.command(), Command::Ack);
            assert_eq!(ack.header("id"), Some("m-1"));
            assert_eq!(ack.transaction(), Some(tx.as_str()));
            let commit = server.next_frame().await.unwrap();
            assert_eq!(commit.transaction(), Some(tx.as_str()));
            server
                .send(Frame::receipt(commit.receipt_header().unwrap()))
                .await;
            server.next_frame().await;
        })
        .await;

        let client = Client::connect(ClientOptions::new(addr)).await.unwrap();
        let tx = client.begin(None).await.unwrap();
        client.send_in_transaction(&tx, "/queue/a", "x").await.unwrap();
        client.ack("m-1", Some(&tx)).await.unwrap();
        client.commit(&tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_receipt() {
        let (addr, _server) = spawn_fake_server(|mut server| async move {
            server.accept_connect().await;
            let disconnect = server.next_frame().await.unwrap();
            assert_eq!(disconnect.command(), Command::Disconnect);
            server
                .send(Frame::receipt(disconnect.receipt_header().unwrap()))
                .await;
        })
        .await;

        let client = Client::connect(ClientOptions::new(addr)).await.unwrap();
        client.disconnect().await.unwrap();
        assert!(!client.is_connected());
    }
}
