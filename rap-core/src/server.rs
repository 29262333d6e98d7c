//! The server dispatcher (spec.md §4.7): accepts connections, decodes
//! frames, routes them to registered handlers, and propagates deadlines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rmpv::Value;

use crate::channel::{Channel, ChannelFrame, ChannelQueue, ChannelWriter};
use crate::conn::Connection;
use crate::context::Context;
use crate::deadline::{Deadline, DeadlinePolicy};
use crate::error::{RapError, RapErrorKind};
use crate::processor::ProcessorChain;
use crate::registry::{Handler, Registry};
use crate::semaphore::InflightSemaphore;
use crate::transport::Response;
use crate::wire::{header_keys, events, CorrelationId, Frame, Header, LifeCycle, MsgType, Target};

pub use crate::config::ServerConfig;

/// Channel inbound queue depth for server-side channel handlers
/// (spec.md §4.4).
const CHANNEL_QUEUE_CAPACITY: usize = 64;

/// Writes channel frames back to the client that opened a channel, on
/// behalf of a server-side `ChannelFn` handler. Outbound frames pass
/// through the processor chain in reverse order like every other server
/// reply (spec.md §4.7 point 5).
#[derive(Clone)]
pub struct ServerChannelWriter {
    connection: Arc<dyn Connection>,
    processors: ProcessorChain,
}

#[async_trait::async_trait]
impl ChannelWriter for ServerChannelWriter {
    async fn write_channel_frame(&self, correlation_id: CorrelationId, life_cycle: LifeCycle, body: Value) -> Result<(), RapError> {
        let mut header = Header::new();
        header.insert(header_keys::CHANNEL_LIFE_CYCLE.to_string(), Value::String(life_cycle.as_str().into()));
        let response = Response { correlation_id, header, body };
        let response = match self.processors.run_response(response).await {
            Ok(response) => response,
            Err((_response, err)) => return Err(err),
        };
        let frame = Frame::new(MsgType::ChannelResponse, correlation_id, response.header, response.body);
        self.connection.write_frame(&frame).await.map_err(|_| RapError::channel("connection closed while writing"))
    }
}

/// One accepted connection, dispatching every frame it receives.
pub struct ServerConnection {
    connection: Arc<dyn Connection>,
    registry: Arc<Registry>,
    processors: ProcessorChain,
    config: ServerConfig,
    inflight: Arc<InflightSemaphore>,
    channel_queues: DashMap<CorrelationId, Arc<ChannelQueue>>,
    closed: AtomicBool,
}

impl ServerConnection {
    pub fn new(connection: Arc<dyn Connection>, registry: Arc<Registry>, processors: ProcessorChain, config: ServerConfig) -> Arc<Self> {
        let inflight = Arc::new(InflightSemaphore::new(config.max_inflight));
        Arc::new(Self { connection, registry, processors, config, inflight, channel_queues: DashMap::new(), closed: AtomicBool::new(false) })
    }

    pub fn peer(&self) -> String {
        self.connection.peer()
    }

    /// Read frames until the connection closes, dispatching each onto its
    /// own task so a slow handler never blocks the reader (spec.md §4.7).
    pub async fn serve(self: Arc<Self>) {
        loop {
            let frame = match tokio::time::timeout(self.config.keep_alive, self.connection.read_frame()).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(reason)) => {
                    tracing::debug!(peer = %self.peer(), %reason, "server connection closed");
                    self.closed.store(true, Ordering::Release);
                    return;
                }
                Err(_) => {
                    tracing::debug!(peer = %self.peer(), "idle connection exceeded keep_alive, closing");
                    self.connection.close();
                    self.closed.store(true, Ordering::Release);
                    return;
                }
            };
            let this = self.clone();
            tokio::spawn(async move { this.dispatch(frame).await });
        }
    }

    async fn dispatch(self: Arc<Self>, frame: Frame) {
        match frame.msg_type {
            MsgType::ClientEvent => self.handle_client_event(frame).await,
            MsgType::MsgRequest => self.handle_request(frame).await,
            MsgType::ChannelRequest => match frame.life_cycle() {
                Some(LifeCycle::Declare) | None => self.handle_channel_request(frame).await,
                Some(life_cycle) => self.feed_channel_queue(frame.correlation_id, life_cycle, frame.body),
            },
            other => tracing::debug!(?other, "server received a response-shaped frame; dropping"),
        }
    }

    /// Route a MSG/DROP channel frame into the queue opened by an earlier
    /// DECLARE (spec.md §4.4/§4.7). DROP evicts the table entry: no more
    /// frames are expected for this correlation id once the handler sees it.
    fn feed_channel_queue(&self, correlation_id: CorrelationId, life_cycle: LifeCycle, body: Value) {
        let drop = life_cycle == LifeCycle::Drop;
        match self.channel_queues.get(&correlation_id) {
            Some(queue) => queue.push(ChannelFrame { life_cycle, body }),
            None => tracing::debug!(correlation_id, "channel frame for unknown correlation id; dropping"),
        }
        if drop {
            self.channel_queues.remove(&correlation_id);
        }
    }

    async fn handle_client_event(self: &Arc<Self>, frame: Frame) {
        let event_name = frame.target().unwrap_or_default().rsplit('/').next().unwrap_or_default().to_string();
        match event_name.as_str() {
            events::DECLARE => {
                let conn_id = uuid_like_id();
                let mut header = Header::new();
                self.annotate(&mut header);
                let body = Value::Map(vec![(Value::from("conn_id"), Value::String(conn_id.into()))]);
                let reply = Frame::new(MsgType::ClientEvent, frame.correlation_id, header, body);
                self.send_reply(reply).await;
            }
            events::PING => {
                let mut header = Header::new();
                self.annotate(&mut header);
                let body = Value::Map(vec![(Value::from("mos"), Value::from(5))]);
                let reply = Frame::new(MsgType::ServerEvent, frame.correlation_id, header, body);
                self.send_reply(reply).await;
            }
            other => tracing::debug!(event = other, "unrecognized client event"),
        }
    }

    fn annotate(&self, header: &mut Header) {
        header.entry(header_keys::VERSION.to_string()).or_insert_with(|| Value::String(crate::wire::PROTOCOL_VERSION.into()));
        header.entry(header_keys::HOST.to_string()).or_insert_with(|| Value::String(self.config.app_name.clone().into()));
    }

    fn deadline_from_header(&self, frame: &Frame) -> Option<Deadline> {
        frame
            .header
            .get(header_keys::DEADLINE)
            .and_then(|v| v.as_u64())
            .map(|secs| Deadline::from_unix_secs(secs, DeadlinePolicy::Raise))
    }

    /// `MSG_REQUEST` → normal handler dispatch (spec.md §4.7).
    async fn handle_request(self: &Arc<Self>, frame: Frame) {
        let _permit = self.inflight.acquire().await;
        let target = frame.target().unwrap_or_default().to_string();
        let deadline = self.deadline_from_header(&frame);
        let ctx = Arc::new({
            let mut ctx = Context::new(self.config.app_name.clone(), self.peer(), frame.correlation_id, target.clone());
            if let Some(d) = deadline {
                ctx = ctx.with_deadline(d);
            }
            ctx
        });

        let result = self.call_normal(&target, frame.body.clone(), ctx.clone(), deadline).await;
        let reply = match result {
            Ok(body) => Frame::new(MsgType::MsgResponse, frame.correlation_id, Header::new(), body),
            Err(err) => self.error_frame(frame.correlation_id, &err),
        };
        self.send_reply(reply).await;
    }

    async fn call_normal(self: &Arc<Self>, target: &str, body: Value, ctx: Arc<Context>, deadline: Option<Deadline>) -> Result<Value, RapError> {
        let args = match body {
            Value::Array(items) => items,
            Value::Nil => Vec::new(),
            other => vec![other],
        };
        let func = match self.registry.get(target) {
            Some(Handler::Normal { func, signature }) => {
                signature.check(&args)?;
                func.clone()
            }
            Some(Handler::Channel { .. }) => return Err(RapError::new(RapErrorKind::LifeCycleError, Some("target is a channel function"))),
            None => return Err(RapError::func_not_found(target)),
        };

        let call = func.call(args, ctx);
        match deadline {
            Some(deadline) => match deadline.race(call).await {
                Ok(result) => result,
                Err(_) => Err(RapError::new(RapErrorKind::RpcRunTimeError, Some("handler cancelled at deadline"))),
            },
            None => call.await,
        }
    }

    fn error_frame(&self, correlation_id: CorrelationId, err: &RapError) -> Frame {
        let mut header = Header::new();
        header.insert(header_keys::STATUS_CODE.to_string(), Value::from(err.status_code()));
        self_annotate(&self.config, &mut header);
        let body = Value::Array(vec![Value::String(err.exc_name().into()), Value::String(err.to_string().into())]);
        Frame::new(MsgType::ServerErrorResponse, correlation_id, header, body)
    }

    /// `CHANNEL_REQUEST` with `life_cycle=declare` spawns a background task
    /// running the registered channel handler; subsequent MSG/DROP frames
    /// for the same correlation id feed its queue (spec.md §4.4/§4.7).
    async fn handle_channel_request(self: &Arc<Self>, frame: Frame) {
        let target = frame.target().unwrap_or_default().to_string();
        let handler = match self.registry.get(&target) {
            Some(Handler::Channel { func }) => func.clone(),
            Some(Handler::Normal { .. }) => {
                self.reply_channel_error(frame.correlation_id, RapError::new(RapErrorKind::LifeCycleError, Some("target is a normal function"))).await;
                return;
            }
            None => {
                self.reply_channel_error(frame.correlation_id, RapError::func_not_found(&target)).await;
                return;
            }
        };

        let (queue, rx) = ChannelQueue::new(CHANNEL_QUEUE_CAPACITY);
        let writer = ServerChannelWriter { connection: self.connection.clone(), processors: self.processors.clone() };
        let channel = Channel::new(frame.correlation_id, rx, queue.clone(), writer);

        // Register before acking so a MSG frame the client sends the moment
        // it sees the ack can never race ahead of the table entry existing.
        self.register_channel_queue(frame.correlation_id, queue);

        let mut ack_header = Header::new();
        ack_header.insert(header_keys::CHANNEL_LIFE_CYCLE.to_string(), Value::String(LifeCycle::Declare.as_str().into()));
        let ack = Frame::new(MsgType::ChannelResponse, frame.correlation_id, ack_header, Value::Nil);
        if !self.send_reply(ack).await {
            self.channel_queues.remove(&frame.correlation_id);
            return;
        }

        let ctx = Arc::new(Context::new(self.config.app_name.clone(), self.peer(), frame.correlation_id, target));
        let this = self.clone();
        let correlation_id = frame.correlation_id;
        tokio::spawn(async move {
            handler.call(channel, ctx).await;
            this.channel_queues.remove(&correlation_id);
        });
    }

    async fn reply_channel_error(&self, correlation_id: CorrelationId, err: RapError) {
        let reply = self.error_frame(correlation_id, &err);
        self.send_reply(reply).await;
    }

    fn register_channel_queue(&self, correlation_id: CorrelationId, queue: Arc<ChannelQueue>) {
        self.channel_queues.insert(correlation_id, queue);
    }

    /// Run `frame` through the processor chain's response stage, reverse
    /// order, before writing it (spec.md §4.7 point 5: "All outbound frames
    /// pass through the processor chain in reverse order"). A processor
    /// error replaces the frame with the funneled error instead of sending
    /// what the handler produced. Returns whether a frame reached the wire.
    async fn send_reply(&self, frame: Frame) -> bool {
        let msg_type = frame.msg_type;
        let response = Response { correlation_id: frame.correlation_id, header: frame.header, body: frame.body };
        let outgoing = match self.processors.run_response(response).await {
            Ok(response) => Frame::new(msg_type, response.correlation_id, response.header, response.body),
            Err((_response, err)) => self.error_frame(frame.correlation_id, &err),
        };
        match self.connection.write_frame(&outgoing).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(%err, "failed to write outbound frame");
                false
            }
        }
    }
}

fn self_annotate(config: &ServerConfig, header: &mut Header) {
    header.entry(header_keys::HOST.to_string()).or_insert_with(|| Value::String(config.app_name.clone().into()));
}

fn uuid_like_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..16).map(|_| format!("{:x}", rng.gen_range(0..16))).collect()
}

/// Top-level server: owns the registry/processors shared across
/// connections and the accept loop.
pub struct Server {
    pub registry: Arc<Registry>,
    pub processors: ProcessorChain,
    pub config: ServerConfig,
}

impl Server {
    pub fn new(mut registry: Registry, processors: ProcessorChain, config: ServerConfig) -> Self {
        processors.register_functions(&mut registry);
        Self { registry: Arc::new(registry), processors, config }
    }

    /// Accept connections from `acceptor`, spawning a [`ServerConnection`]
    /// per connection until it returns `None` (spec.md §4.7).
    pub async fn serve<A, F>(&self, mut acceptor: A)
    where
        A: FnMut() -> F,
        F: std::future::Future<Output = Option<Arc<dyn Connection>>>,
    {
        while let Some(connection) = acceptor().await {
            let registry = self.registry.clone();
            let processors = self.processors.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                let conn = ServerConnection::new(connection, registry, processors, config);
                conn.serve().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ArgSpec, Signature};

    #[tokio::test]
    async fn signature_arity_check_runs_before_invoking_handler() {
        let mut registry = Registry::new();
        registry
            .register_normal("echo/default/sum", Signature::new(vec![ArgSpec::int("a"), ArgSpec::int("b")]), |args: Vec<Value>, _ctx| async move {
                Ok(Value::from(args[0].as_i64().unwrap() + args[1].as_i64().unwrap()))
            })
            .unwrap();
        let handler = registry.get("echo/default/sum").unwrap();
        match handler {
            Handler::Normal { signature, .. } => assert!(signature.check(&[Value::from(1)]).is_err()),
            Handler::Channel { .. } => panic!("expected normal handler"),
        }
    }

    #[test]
    fn target_round_trips_through_display() {
        let t = Target::new("echo", "sum");
        assert_eq!(t.to_string(), "echo/default/sum");
    }
}
