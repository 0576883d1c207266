//! Transport stream accepted by the broker: plain TCP or TLS over TCP.

use pin_project_lite::pin_project;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

pin_project! {
    #[project = TransportProj]
    pub enum Transport {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: Box<TlsStream<TcpStream>> },
    }
}

trait Io: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> Io for T {}

impl Transport {
    /// Wraps a freshly accepted socket, running the TLS handshake when an
    /// acceptor is configured.
    pub async fn accept(stream: TcpStream, acceptor: Option<&TlsAcceptor>) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        match acceptor {
            Some(acceptor) => Ok(Transport::Tls {
                stream: Box::new(acceptor.accept(stream).await?),
            }),
            None => Ok(Transport::Plain { stream }),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls { .. })
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            Transport::Plain { stream } => stream,
            Transport::Tls { stream } => stream.get_ref().0,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    fn io(self: Pin<&mut Self>) -> Pin<&mut dyn Io> {
        match self.project() {
            TransportProj::Plain { stream } => stream,
            TransportProj::Tls { stream } => stream,
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.io().poll_read(cx, buf)
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.io().poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.io().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.io().poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut socket = TcpStream::connect(addr).await.unwrap();
            socket.write_all(b"CONNECT\n\n\0").await.unwrap();
            let mut reply = Vec::new();
            socket.read_to_end(&mut reply).await.unwrap();
            (socket.local_addr().unwrap(), reply)
        });

        let (socket, _) = listener.accept().await.unwrap();
        let mut transport = Transport::accept(socket, None).await.unwrap();
        assert!(!transport.is_tls());

        let mut frame = [0u8; 10];
        transport.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame, b"CONNECT\n\n\0");
        let peer = transport.peer_addr().unwrap();

        transport.write_all(b"\n").await.unwrap();
        transport.shutdown().await.unwrap();
        drop(transport);

        let (client_addr, reply) = client.await.unwrap();
        assert_eq!(peer, client_addr);
        assert_eq!(reply, b"\n");
    }
}
