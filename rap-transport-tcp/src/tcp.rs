use std::sync::Arc;

use async_trait::async_trait;
use rap_core::conn::Connection;
use rap_core::error::CloseConnError;
use rap_core::wire::Frame;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::framed::FramedConnection;

/// A [`Connection`] over a plain (unencrypted) TCP stream.
pub struct TcpConnection {
    inner: FramedConnection<OwnedReadHalf, OwnedWriteHalf>,
}

impl TcpConnection {
    /// Dial `addr`, disabling Nagle's algorithm (rap frames are typically
    /// small and latency-sensitive).
    pub async fn connect(addr: &str) -> std::io::Result<Arc<Self>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-accepted stream (server side).
    pub fn from_stream(stream: TcpStream) -> Arc<Self> {
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();
        Arc::new(Self { inner: FramedConnection::new(read_half, write_half, peer) })
    }
}

#[async_trait]
impl Connection for TcpConnection {
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

/// Accepts plain TCP connections for a rap server (spec.md §4.7).
pub struct TcpListener {
    listener: tokio::net::TcpListener,
}

impl TcpListener {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        Ok(Self { listener: tokio::net::TcpListener::bind(addr).await? })
    }

    pub async fn accept(&self) -> std::io::Result<Arc<TcpConnection>> {
        let (stream, _addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(TcpConnection::from_stream(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_frame_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            conn.read_frame().await.unwrap()
        });

        let client = TcpConnection::connect(&addr).await.unwrap();
        let mut header = rap_core::wire::Header::new();
        header.insert(rap_core::wire::header_keys::TARGET.to_string(), rmpv::Value::String("echo/default/sum".into()));
        let frame = Frame::new(rap_core::wire::MsgType::MsgRequest, 1, header, rmpv::Value::from(1));
        client.write_frame(&frame).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received.correlation_id, 1);
        assert_eq!(received.target(), Some("echo/default/sum"));
    }
}
