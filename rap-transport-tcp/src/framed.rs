//! Generic frame-on-stream plumbing shared by the plain-TCP and TLS
//! connection types: a mutex-serialized writer half and a buffered reader
//! loop driving `rap_core::wire::Decoder`.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rap_core::conn::Connection;
use rap_core::error::CloseConnError;
use rap_core::wire::{encode, Decoder, Frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

const READ_CHUNK: usize = 8 * 1024;

/// Wraps any split-capable async duplex stream with the rap wire codec.
pub struct FramedConnection<R, W> {
    reader: Mutex<ReaderState<R>>,
    writer: Mutex<W>,
    peer: String,
    closed: AtomicBool,
}

struct ReaderState<R> {
    stream: R,
    decoder: Decoder,
}

impl<R, W> FramedConnection<R, W>
where
    R: tokio::io::AsyncRead + Unpin + Send,
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    pub fn new(read_half: R, write_half: W, peer: String) -> Self {
        Self {
            reader: Mutex::new(ReaderState { stream: read_half, decoder: Decoder::new() }),
            writer: Mutex::new(write_half),
            peer,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<R, W> Connection for FramedConnection<R, W>
where
    R: tokio::io::AsyncRead + Unpin + Send,
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    async fn write_frame(&self, frame: &Frame) -> Result<(), CloseConnError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CloseConnError::LocalClose);
        }
        let bytes = encode(frame).map_err(|err| CloseConnError::Eof(err.to_string()))?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await.map_err(|err| {
            self.closed.store(true, Ordering::Release);
            CloseConnError::Eof(err.to_string())
        })?;
        writer.flush().await.map_err(|err| {
            self.closed.store(true, Ordering::Release);
            CloseConnError::Eof(err.to_string())
        })
    }

    async fn read_frame(&self) -> Result<Frame, CloseConnError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CloseConnError::LocalClose);
        }
        let mut state = self.reader.lock().await;
        loop {
            if let Some(frame) = state.decoder.poll().map_err(|err| CloseConnError::Eof(err.to_string()))? {
                return Ok(frame);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = state.stream.read(&mut chunk).await.map_err(|err| {
                self.closed.store(true, Ordering::Release);
                CloseConnError::Eof(err.to_string())
            })?;
            if n == 0 {
                self.closed.store(true, Ordering::Release);
                return Err(CloseConnError::Eof("peer closed the connection".to_string()));
            }
            state.decoder.feed(&chunk[..n]);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
