//! Concrete [`rap_core::conn::Connection`] implementations over Tokio TCP
//! and TLS streams.

mod framed;
mod tcp;
mod tls;

pub use tcp::TcpConnection;
pub use tls::TlsConnection;
