//! Streaming channels (spec.md §4.4): a bidirectional stream sharing one
//! correlation id with a DECLARE → MSG* → DROP lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rmpv::Value;
use tokio::sync::mpsc;

use crate::error::RapError;
use crate::wire::{CorrelationId, LifeCycle};

/// How long [`Channel::close`] waits for the remote to finish draining
/// in-flight frames before giving up (spec.md §4.4).
pub const CHANNEL_CLOSE_DRAIN: Duration = Duration::from_secs(3);

/// One item delivered into a channel's inbound queue.
#[derive(Debug, Clone)]
pub struct ChannelFrame {
    pub life_cycle: LifeCycle,
    pub body: Value,
}

/// The sending half installed into a transport's (or server connection's)
/// correlation-id → queue table. Shared between the reader loop (which
/// pushes frames in) and the owning [`Channel`]/`ServerChannel` (which can
/// observe a backpressure error after the queue overflowed).
pub struct ChannelQueue {
    tx: mpsc::Sender<ChannelFrame>,
    overflow: Mutex<Option<RapError>>,
}

impl ChannelQueue {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<ChannelFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Self { tx, overflow: Mutex::new(None) }), rx)
    }

    /// Non-blocking enqueue used by the reader loop (spec.md §4.3:
    /// "enqueue into channel queue (non-blocking; if queue full, the
    /// producer (transport) drops behind and the channel is closed with
    /// backpressure error)").
    pub fn push(&self, frame: ChannelFrame) {
        if let Err(err) = self.tx.try_send(frame) {
            let mut overflow = self.overflow.lock();
            if overflow.is_none() {
                *overflow = Some(RapError::channel(format!(
                    "channel queue overflowed, dropping behind: {err}"
                )));
            }
        }
    }

    pub fn take_overflow(&self) -> Option<RapError> {
        self.overflow.lock().take()
    }
}

/// Client-side handle to a streaming channel.
pub struct Channel<W> {
    correlation_id: CorrelationId,
    rx: mpsc::Receiver<ChannelFrame>,
    queue: Arc<ChannelQueue>,
    writer: W,
    closed: AtomicBool,
}

/// Abstracts "write a CHANNEL_REQUEST frame with this life cycle and body"
/// so `Channel` does not need to know about `Transport`/`ServerConnection`
/// directly.
#[async_trait::async_trait]
pub trait ChannelWriter: Send + Sync {
    async fn write_channel_frame(&self, correlation_id: CorrelationId, life_cycle: LifeCycle, body: Value) -> Result<(), RapError>;
}

impl<W: ChannelWriter> Channel<W> {
    pub fn new(correlation_id: CorrelationId, rx: mpsc::Receiver<ChannelFrame>, queue: Arc<ChannelQueue>, writer: W) -> Self {
        Self { correlation_id, rx, queue, writer, closed: AtomicBool::new(false) }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Pop the next body from the channel. Returns `Err` once DROP has
    /// been received or the queue overflowed; never delivers a body after
    /// a DROP (spec.md §8 invariant 4).
    pub async fn recv(&mut self) -> Result<Option<Value>, RapError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        // Backpressure overflow closes the channel immediately (spec.md
        // §4.3/§5): once the queue drops a frame behind, the channel does
        // not keep draining what was already buffered.
        if let Some(err) = self.queue.take_overflow() {
            self.closed.store(true, Ordering::Release);
            return Err(err);
        }
        match self.rx.recv().await {
            None => {
                self.closed.store(true, Ordering::Release);
                if let Some(err) = self.queue.take_overflow() {
                    Err(err)
                } else {
                    Ok(None)
                }
            }
            Some(frame) => match frame.life_cycle {
                LifeCycle::Msg => Ok(Some(frame.body)),
                LifeCycle::Drop => {
                    self.closed.store(true, Ordering::Release);
                    Err(RapError::channel("recv drop event"))
                }
                LifeCycle::Declare => Err(RapError::channel("unexpected DECLARE mid-stream")),
            },
        }
    }

    /// Emit a `CHANNEL_REQUEST` with `life_cycle=MSG` (spec.md §4.4).
    pub async fn send(&self, body: Value) -> Result<(), RapError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RapError::channel("channel is closed"));
        }
        self.writer.write_channel_frame(self.correlation_id, LifeCycle::Msg, body).await
    }

    /// Emit `life_cycle=DROP`, then drain incoming frames for up to
    /// [`CHANNEL_CLOSE_DRAIN`], warning on timeout. Idempotent.
    pub async fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.writer.write_channel_frame(self.correlation_id, LifeCycle::Drop, Value::Nil).await {
            tracing::debug!(correlation_id = self.correlation_id, %err, "failed to send DROP while closing channel");
        }
        let drained = tokio::time::timeout(CHANNEL_CLOSE_DRAIN, async {
            while self.rx.recv().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(correlation_id = self.correlation_id, "timed out draining channel on close");
        }
    }

    /// Iterate bodies until DROP or a remote error (spec.md §4.4: "a
    /// restartable finite lazy sequence of bodies").
    pub async fn next(&mut self) -> Option<Result<Value, RapError>> {
        match self.recv().await {
            Ok(Some(body)) => Some(Ok(body)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingWriter {
        sent: Arc<Mutex<Vec<(LifeCycle, Value)>>>,
    }

    #[async_trait::async_trait]
    impl ChannelWriter for RecordingWriter {
        async fn write_channel_frame(&self, _correlation_id: CorrelationId, life_cycle: LifeCycle, body: Value) -> Result<(), RapError> {
            self.sent.lock().push((life_cycle, body));
            Ok(())
        }
    }

    fn test_channel(capacity: usize) -> (Channel<RecordingWriter>, Arc<ChannelQueue>, Arc<Mutex<Vec<(LifeCycle, Value)>>>) {
        let (queue, rx) = ChannelQueue::new(capacity);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let writer = RecordingWriter { sent: sent.clone() };
        (Channel::new(1, rx, queue.clone(), writer), queue, sent)
    }

    #[tokio::test]
    async fn recv_yields_msg_bodies_in_order() {
        let (mut ch, queue, _sent) = test_channel(8);
        queue.push(ChannelFrame { life_cycle: LifeCycle::Msg, body: Value::from("hello!") });
        queue.push(ChannelFrame { life_cycle: LifeCycle::Msg, body: Value::from("hello!") });
        assert_eq!(ch.recv().await.unwrap(), Some(Value::from("hello!")));
        assert_eq!(ch.recv().await.unwrap(), Some(Value::from("hello!")));
    }

    #[tokio::test]
    async fn drop_frame_terminates_with_channel_error() {
        let (mut ch, queue, _sent) = test_channel(8);
        queue.push(ChannelFrame { life_cycle: LifeCycle::Msg, body: Value::from("hello!") });
        queue.push(ChannelFrame { life_cycle: LifeCycle::Drop, body: Value::Nil });

        assert_eq!(ch.recv().await.unwrap(), Some(Value::from("hello!")));
        let err = ch.recv().await.unwrap_err();
        assert_eq!(err.exc_name(), "ChannelError");
        assert_eq!(err.to_string(), "Channel Error. recv drop event");
        assert!(ch.is_closed());
    }

    #[tokio::test]
    async fn no_body_is_delivered_after_drop() {
        let (mut ch, queue, _sent) = test_channel(8);
        queue.push(ChannelFrame { life_cycle: LifeCycle::Drop, body: Value::Nil });
        assert!(ch.recv().await.is_err());
        // Further recv calls must not yield a body (invariant 4).
        assert_eq!(ch.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (mut ch, _queue, _sent) = test_channel(8);
        ch.close().await;
        let err = ch.send(Value::Nil).await.unwrap_err();
        assert_eq!(err.exc_name(), "ChannelError");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut ch, _queue, sent) = test_channel(8);
        ch.close().await;
        ch.close().await;
        assert_eq!(sent.lock().iter().filter(|(lc, _)| *lc == LifeCycle::Drop).count(), 1);
    }

    #[tokio::test]
    async fn overflow_closes_channel_with_backpressure_error() {
        let (mut ch, queue, _sent) = test_channel(1);
        // Fill the single slot, then force an overflow (capacity 1 is
        // already occupied by this push).
        queue.push(ChannelFrame { life_cycle: LifeCycle::Msg, body: Value::from(1) });
        queue.push(ChannelFrame { life_cycle: LifeCycle::Msg, body: Value::from(2) }); // dropped, overflow recorded

        let err = ch.recv().await.unwrap_err();
        assert_eq!(err.exc_name(), "ChannelError");
        assert!(ch.is_closed());
    }
}
