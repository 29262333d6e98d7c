//! The [`Connection`] trait: one TCP (optionally TLS) duplex stream,
//! framed with the wire codec (spec.md §4.2).
//!
//! `rap-core` never imports a concrete socket type — `rap-transport-tcp`
//! supplies `TcpConnection`/`TlsConnection`. This mirrors the teacher
//! workspace's split between `spark-core`'s transport *contract* and
//! `spark-transport-tcp`'s concrete Tokio implementation.
//!
//! Concurrent writes are **not** serialized by the connection itself —
//! that is the transport's job (spec.md §4.2) — but `write_frame` still
//! takes `&self` so the transport can hold only a shared reference while a
//! mutex internal to the implementation orders the actual socket writes.

use async_trait::async_trait;

use crate::error::CloseConnError;
use crate::wire::Frame;

/// One framed duplex connection. Implementors own the underlying socket.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Serialize and flush one frame. Implementations must ensure this is
    /// safe to call concurrently from multiple tasks (internally
    /// serialized), since the transport multiplexes many logical requests
    /// over one connection.
    async fn write_frame(&self, frame: &Frame) -> Result<(), CloseConnError>;

    /// Read the next complete frame, or an error once the connection has
    /// terminated (EOF or I/O failure). After the first error, every
    /// subsequent call must return the same terminal error (idempotent
    /// close, spec.md §4.2).
    async fn read_frame(&self) -> Result<Frame, CloseConnError>;

    /// Idempotently tear down the connection. Wakes any pending
    /// `read_frame` with `CloseConnError::LocalClose`.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// A human-readable peer description (`host:port`), for logging and
    /// the context's `conn` field.
    fn peer(&self) -> String;
}
