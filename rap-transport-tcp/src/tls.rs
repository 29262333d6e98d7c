use std::sync::Arc;

use async_trait::async_trait;
use rap_core::conn::Connection;
use rap_core::error::CloseConnError;
use rap_core::wire::Frame;
use tokio::io::{split, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, TlsAcceptor};
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;

use crate::framed::FramedConnection;

enum Stream {
    Client(ClientTlsStream<TcpStream>),
    Server(ServerTlsStream<TcpStream>),
}

impl tokio::io::AsyncRead for Stream {
    fn poll_read(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &mut tokio::io::ReadBuf<'_>) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Client(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            Stream::Server(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for Stream {
    fn poll_write(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &[u8]) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Client(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            Stream::Server(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Client(s) => std::pin::Pin::new(s).poll_flush(cx),
            Stream::Server(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Client(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            Stream::Server(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A [`Connection`] over a `rustls`-encrypted TCP stream, client or server
/// side.
pub struct TlsConnection {
    inner: FramedConnection<ReadHalf<Stream>, WriteHalf<Stream>>,
}

impl TlsConnection {
    pub async fn connect(addr: &str, server_name: rustls_pki_types::ServerName<'static>, connector: TlsConnector) -> std::io::Result<Arc<Self>> {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        let peer = tcp.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".to_string());
        let tls = connector.connect(server_name, tcp).await?;
        let (read_half, write_half) = split(Stream::Client(tls));
        Ok(Arc::new(Self { inner: FramedConnection::new(read_half, write_half, peer) }))
    }

    pub async fn accept(tcp: TcpStream, acceptor: TlsAcceptor) -> std::io::Result<Arc<Self>> {
        tcp.set_nodelay(true)?;
        let peer = tcp.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".to_string());
        let tls = acceptor.accept(tcp).await?;
        let (read_half, write_half) = split(Stream::Server(tls));
        Ok(Arc::new(Self { inner: FramedConnection::new(read_half, write_half, peer) }))
    }
}

#[async_trait]
impl Connection for TlsConnection {
    async fn write_frame(&self, frame: &Frame) -> Result<(), CloseConnError> {
        self.inner.write_frame(frame).await
    }

    async fn read_frame(&self) -> Result<Frame, CloseConnError> {
        self.inner.read_frame().await
    }

    fn close(&self) {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn peer(&self) -> String {
        self.inner.peer()
    }
}
