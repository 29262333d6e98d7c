//! The client-side transport multiplexer (spec.md §4.3): turns a single
//! [`Connection`] into a logical RPC channel that multiplexes many
//! concurrent calls via correlation ids.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rmpv::Value;
use tokio::sync::{oneshot, Notify};

use crate::channel::{Channel, ChannelFrame, ChannelQueue, ChannelWriter};
use crate::conn::Connection;
use crate::context::Context;
use crate::deadline::Deadline;
use crate::error::{CallError, CloseConnError, RapError};
use crate::processor::ProcessorChain;
use crate::semaphore::{InflightSemaphore, SharedInflightSemaphore};
use crate::wire::{header_keys, events, CorrelationId, Frame, Header, LifeCycle, MsgType, Target};

/// An outbound request as seen by the processor chain (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct Request {
    pub target: String,
    pub args: Value,
    pub header: Header,
    pub correlation_id: CorrelationId,
}

/// An inbound response as seen by the processor chain and by callers.
#[derive(Debug, Clone)]
pub struct Response {
    pub correlation_id: CorrelationId,
    pub header: Header,
    pub body: Value,
}

impl Response {
    pub fn into_body(self) -> Value {
        self.body
    }
}

/// Tunables for one transport (spec.md §4.3/§4.6/§5).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_inflight: usize,
    pub declare_deadline: Duration,
    pub weight: f64,
    pub channel_queue_capacity: usize,
    pub user_agent: String,
    pub host: String,
    pub app: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_inflight: 100,
            declare_deadline: Duration::from_secs(9),
            weight: 10.0,
            channel_queue_capacity: 64,
            user_agent: format!("rap-rust-{}", env!("CARGO_PKG_VERSION")),
            host: "rap-client".to_string(),
            app: "rap-client".to_string(),
        }
    }
}

/// EWMA decay constant for RTT/MOS smoothing (spec.md §4.3).
const SCORE_DECAY_SECS: f64 = 600.0;

struct ScoreState {
    weight: f64,
    score: f64,
    rtt: f64,
    mos: i32,
    available: bool,
    available_level: i32,
    inflight_history: VecDeque<usize>,
    last_ping_ts: Instant,
}

impl ScoreState {
    fn new(weight: f64) -> Self {
        Self {
            weight,
            score: 0.0,
            rtt: 0.0,
            mos: 5,
            available: false,
            available_level: 5,
            inflight_history: VecDeque::with_capacity(3),
            last_ping_ts: Instant::now(),
        }
    }

    fn push_inflight_sample(&mut self, sample: usize) {
        if self.inflight_history.len() == 3 {
            self.inflight_history.pop_front();
        }
        self.inflight_history.push_back(sample);
    }

    fn inflight_avg(&self) -> f64 {
        if self.inflight_history.is_empty() {
            return 0.0;
        }
        self.inflight_history.iter().sum::<usize>() as f64 / self.inflight_history.len() as f64
    }

    /// Apply one ping sample using the EWMA update from spec.md §4.3.
    fn apply_ping_sample(&mut self, rtt_sample: f64, mos_sample: i32) {
        let now = Instant::now();
        let td = now.saturating_duration_since(self.last_ping_ts).as_secs_f64();
        self.last_ping_ts = now;

        let w = if self.rtt <= 0.0 { 0.0 } else { (-td / SCORE_DECAY_SECS).exp() };
        let rtt_sample = rtt_sample.max(0.0);
        self.rtt = self.rtt * w + rtt_sample * (1.0 - w);
        self.mos = (self.mos as f64 * w + mos_sample as f64 * (1.0 - w)).floor() as i32;
        self.score = if self.rtt > 0.0 { (self.weight * self.mos as f64) / self.rtt } else { self.weight * self.mos as f64 };
    }
}

enum ResponseSlot {
    Unary(oneshot::Sender<Result<Frame, CloseConnError>>),
    Channel(Arc<ChannelQueue>),
}

/// A callback invoked when the transport's reader loop terminates, letting
/// the owning `Endpoint`/`TransportGroup` drop it from rotation
/// (spec.md §4.6 "create_one ... install a done-callback that removes the
/// transport from its group").
pub type OnClosed = Arc<dyn Fn() + Send + Sync>;

pub struct Transport {
    connection: Arc<dyn Connection>,
    config: TransportConfig,
    correlation_seq: AtomicU16,
    slots: DashMap<CorrelationId, ResponseSlot>,
    contexts: DashMap<CorrelationId, Arc<Context>>,
    inflight: SharedInflightSemaphore,
    score: parking_lot::Mutex<ScoreState>,
    closed: AtomicBool,
    close_notify: Notify,
    processors: Option<ProcessorChain>,
    conn_id: parking_lot::Mutex<Option<String>>,
    on_closed: parking_lot::Mutex<Option<OnClosed>>,
    close_soon_scheduled: AtomicBool,
}

impl Transport {
    /// Open a connection, start the reader task, run the DECLARE
    /// handshake, and mark the transport available (spec.md §4.3).
    pub async fn connect(
        connection: Arc<dyn Connection>,
        config: TransportConfig,
        processors: Option<ProcessorChain>,
    ) -> Result<Arc<Self>, CallError> {
        let start_id: u16 = rand::random::<u16>() | 1; // odd start (spec.md §9 open question resolution)
        let transport = Arc::new(Self {
            connection,
            inflight: Arc::new(InflightSemaphore::new(config.max_inflight)),
            correlation_seq: AtomicU16::new(start_id),
            slots: DashMap::new(),
            contexts: DashMap::new(),
            score: parking_lot::Mutex::new(ScoreState::new(config.weight)),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            processors,
            conn_id: parking_lot::Mutex::new(None),
            on_closed: parking_lot::Mutex::new(None),
            close_soon_scheduled: AtomicBool::new(false),
            config,
        });

        let reader_transport = transport.clone();
        tokio::spawn(async move { reader_transport.response_handler().await });

        let declare_id = transport.next_correlation_id();
        let (tx, rx) = oneshot::channel();
        transport.slots.insert(declare_id, ResponseSlot::Unary(tx));
        let mut header = Header::new();
        header.insert(header_keys::TARGET.to_string(), Value::String(Target::event(events::DECLARE).into()));
        transport.annotate(&mut header);
        let frame = Frame::new(MsgType::ClientEvent, declare_id, header, Value::Nil);
        if let Err(err) = transport.connection.write_frame(&frame).await {
            transport.slots.remove(&declare_id);
            return Err(err.into());
        }

        let deadline = Deadline::after(transport.config.declare_deadline, crate::deadline::DeadlinePolicy::Raise);
        let reply = deadline
            .race(rx)
            .await
            .map_err(|_| CallError::Timeout)?
            .map_err(|_| CallError::Closed(CloseConnError::LocalClose))?;
        let reply = reply?;
        if let Some(conn_id) = map_get(&reply.body, "conn_id").and_then(|v| v.as_str()) {
            *transport.conn_id.lock() = Some(conn_id.to_string());
        }

        {
            let mut score = transport.score.lock();
            score.available = true;
            score.available_level = 5;
        }
        Ok(transport)
    }

    pub fn set_on_closed(&self, cb: OnClosed) {
        *self.on_closed.lock() = Some(cb);
    }

    pub fn peer(&self) -> String {
        self.connection.peer()
    }

    pub fn is_available(&self) -> bool {
        self.score.lock().available && !self.closed.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn score(&self) -> f64 {
        self.score.lock().score
    }

    pub fn available_level(&self) -> i32 {
        self.score.lock().available_level
    }

    pub fn inflight(&self) -> usize {
        self.inflight.inflight()
    }

    pub fn capacity(&self) -> usize {
        self.inflight.capacity()
    }

    /// Score used by the picker: `score * (1 - inflight/capacity)` when
    /// there is in-flight work, else the raw score (spec.md §4.6).
    pub fn effective_score(&self) -> f64 {
        let score = self.score();
        let inflight = self.inflight() as f64;
        let capacity = self.capacity().max(1) as f64;
        if inflight > 0.0 {
            score * (1.0 - inflight / capacity)
        } else {
            score
        }
    }

    fn next_correlation_id(&self) -> CorrelationId {
        loop {
            let id = self.correlation_seq.fetch_add(2, Ordering::AcqRel);
            if !self.slots.contains_key(&id) {
                return id;
            }
        }
    }

    fn annotate(&self, header: &mut Header) {
        header.entry(header_keys::HOST.to_string()).or_insert_with(|| Value::String(self.config.host.clone().into()));
        header
            .entry(header_keys::VERSION.to_string())
            .or_insert_with(|| Value::String(crate::wire::PROTOCOL_VERSION.into()));
        header
            .entry(header_keys::USER_AGENT.to_string())
            .or_insert_with(|| Value::String(self.config.user_agent.clone().into()));
        header
            .entry(header_keys::REQUEST_ID.to_string())
            .or_insert_with(|| Value::String(uuid_like_id().into()));
    }

    /// `request(target, args, header?) → Response` (spec.md §4.3).
    pub async fn request(
        self: &Arc<Self>,
        target: &Target,
        args: Value,
        header: Option<Header>,
        deadline: Option<Deadline>,
    ) -> Result<Value, CallError> {
        if !self.is_available() {
            return Err(CallError::Closed(CloseConnError::LocalClose));
        }
        let _permit = self.inflight.acquire().await;
        let correlation_id = self.next_correlation_id();

        let mut header = header.unwrap_or_default();
        header.insert(header_keys::TARGET.to_string(), Value::String(target.to_string().into()));
        self.annotate(&mut header);
        if let Some(deadline) = deadline {
            header.insert(header_keys::DEADLINE.to_string(), Value::from(deadline.unix_secs()));
        }

        let mut request = Request { target: target.to_string(), args, header, correlation_id };
        if let Some(chain) = &self.processors {
            request = chain.run_request(request).await?;
        }

        let ctx = Arc::new(Context::new(self.config.app.clone(), self.peer(), correlation_id, request.target.clone()));
        self.contexts.insert(correlation_id, ctx);

        let (tx, rx) = oneshot::channel();
        self.slots.insert(correlation_id, ResponseSlot::Unary(tx));

        let frame = Frame::new(MsgType::MsgRequest, correlation_id, request.header, request.args);
        if let Err(err) = self.connection.write_frame(&frame).await {
            self.slots.remove(&correlation_id);
            self.contexts.remove(&correlation_id);
            return Err(err.into());
        }

        let result = tokio::select! {
            reply = rx => reply.map_err(|_| CallError::Closed(CloseConnError::LocalClose))?,
            () = self.close_notify.notified() => Err(CloseConnError::RemoteEventClose),
        };
        self.contexts.remove(&correlation_id);

        let frame = result?;
        let mut response = Response { correlation_id: frame.correlation_id, header: frame.header.clone(), body: frame.body.clone() };
        if let Some(status_code) = frame.status_code() {
            let exc_name = frame.body.as_array().and_then(|a| a.first()).and_then(|v| v.as_str()).unwrap_or("RpcRunTimeError");
            let exc_info = frame.body.as_array().and_then(|a| a.get(1)).and_then(|v| v.as_str()).unwrap_or_default();
            let err = RapError::from_remote(status_code, exc_name, exc_info);
            if let Some(chain) = &self.processors {
                let (_resp, err) = chain.run_exc(response, err).await;
                return Err(CallError::Rap(err));
            }
            return Err(CallError::Rap(err));
        }

        if let Some(chain) = &self.processors {
            response = match chain.run_response(response).await {
                Ok(resp) => resp,
                Err((_resp, err)) => return Err(CallError::Rap(err)),
            };
        }
        Ok(response.into_body())
    }

    /// `channel(target) → Channel` (spec.md §4.3/§4.4).
    pub async fn channel(self: &Arc<Self>, target: &Target) -> Result<Channel<TransportChannelWriter>, CallError> {
        if !self.is_available() {
            return Err(CallError::Closed(CloseConnError::LocalClose));
        }
        let correlation_id = self.next_correlation_id();
        let (queue, rx) = ChannelQueue::new(self.config.channel_queue_capacity);
        self.slots.insert(correlation_id, ResponseSlot::Channel(queue.clone()));

        let mut header = Header::new();
        header.insert(header_keys::TARGET.to_string(), Value::String(target.to_string().into()));
        header.insert(header_keys::CHANNEL_LIFE_CYCLE.to_string(), Value::String(LifeCycle::Declare.as_str().into()));
        self.annotate(&mut header);

        // The server's DECLARE ack arrives as a CHANNEL_RESPONSE, which
        // response_handler already routes into `queue`; no separate ack slot
        // is needed.
        let frame = Frame::new(MsgType::ChannelRequest, correlation_id, header, Value::Nil);
        if let Err(err) = self.connection.write_frame(&frame).await {
            self.slots.remove(&correlation_id);
            return Err(err.into());
        }

        let mut rx = rx;
        let first = tokio::select! {
            frame = rx.recv() => frame,
            () = self.close_notify.notified() => None,
        };
        match first {
            Some(ChannelFrame { life_cycle: LifeCycle::Declare, .. }) => {
                Ok(Channel::new(correlation_id, rx, queue, TransportChannelWriter { transport: self.clone() }))
            }
            Some(_) => {
                self.slots.remove(&correlation_id);
                Err(CallError::Rap(RapError::new(crate::error::RapErrorKind::LifeCycleError, Some("expected DECLARE ack"))))
            }
            None => {
                self.slots.remove(&correlation_id);
                Err(CallError::Closed(CloseConnError::RemoteEventClose))
            }
        }
    }

    /// `ping()`: N=3 parallel ping requests, EWMA-smoothed RTT/MOS → score
    /// (spec.md §4.3).
    pub async fn ping(self: &Arc<Self>) -> Result<(), CallError> {
        const N: usize = 3;
        let mut rtt_total = 0.0;
        let mut mos_total = 0i64;
        for _ in 0..N {
            let correlation_id = self.next_correlation_id();
            let (tx, rx) = oneshot::channel();
            self.slots.insert(correlation_id, ResponseSlot::Unary(tx));

            let mut header = Header::new();
            header.insert(header_keys::TARGET.to_string(), Value::String(Target::event(events::PING).into()));
            self.annotate(&mut header);
            let frame = Frame::new(MsgType::ClientEvent, correlation_id, header, Value::Nil);

            let start = Instant::now();
            if let Err(err) = self.connection.write_frame(&frame).await {
                self.slots.remove(&correlation_id);
                return Err(err.into());
            }
            let reply = rx.await.map_err(|_| CallError::Closed(CloseConnError::LocalClose))??;
            rtt_total += start.elapsed().as_secs_f64();
            mos_total += map_get(&reply.body, "mos").and_then(|v| v.as_i64()).unwrap_or(5);
        }
        let rtt_avg = rtt_total / N as f64;
        let mos_avg = (mos_total / N as i64) as i32;
        self.score.lock().apply_ping_sample(rtt_avg, mos_avg);
        Ok(())
    }

    pub fn push_inflight_sample(&self) {
        let sample = self.inflight();
        self.score.lock().push_inflight_sample(sample);
    }

    pub fn inflight_avg(&self) -> f64 {
        self.score.lock().inflight_avg()
    }

    pub fn set_available_level(&self, f: impl FnOnce(i32) -> i32) -> i32 {
        let mut score = self.score.lock();
        score.available_level = f(score.available_level).clamp(0, 5);
        score.available_level
    }

    pub fn set_available(&self, available: bool) {
        self.score.lock().available = available;
    }

    /// Cancel reader/ping tasks, close the connection, and resolve all
    /// outstanding futures/queues with `CloseConnException` (spec.md §4.3).
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.score.lock().available = false;
        self.connection.close();
        self.broadcast_close(CloseConnError::LocalClose);
        if let Some(cb) = self.on_closed.lock().take() {
            cb();
        }
    }

    /// Schedule a close after `after` instead of closing synchronously
    /// (spec.md §4.6: "`available_level <= 0` => Schedule `close_soon`
    /// (~60s)"). Debounced so repeated elasticity ticks while the transport
    /// sits at `available_level == 0` don't stack timers.
    pub fn close_soon(self: &Arc<Self>, after: Duration) {
        if self.close_soon_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let transport = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            transport.close();
        });
    }

    pub async fn await_close(&self) {
        while !self.closed.load(Ordering::Acquire) {
            self.close_notify.notified().await;
        }
    }

    fn broadcast_close(&self, reason: CloseConnError) {
        self.close_notify.notify_waiters();
        let keys: Vec<CorrelationId> = self.slots.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, ResponseSlot::Unary(tx))) = self.slots.remove(&key) {
                let _ = tx.send(Err(reason.clone()));
            }
        }
    }

    /// The reader loop: for each frame, route it to the right sink
    /// (spec.md §4.3 `response_handler`).
    async fn response_handler(self: Arc<Self>) {
        loop {
            let frame = match self.connection.read_frame().await {
                Ok(frame) => frame,
                Err(reason) => {
                    tracing::debug!(peer = %self.peer(), %reason, "transport reader loop terminated");
                    self.closed.store(true, Ordering::Release);
                    self.score.lock().available = false;
                    self.broadcast_close(reason);
                    if let Some(cb) = self.on_closed.lock().take() {
                        cb();
                    }
                    return;
                }
            };

            match frame.msg_type {
                MsgType::ServerEvent => self.handle_server_event(frame).await,
                MsgType::ClientEvent => {
                    if let Some((_, ResponseSlot::Unary(tx))) = self.slots.remove(&frame.correlation_id) {
                        let _ = tx.send(Ok(frame));
                    } else {
                        tracing::debug!(correlation_id = frame.correlation_id, "dropped unrouted CLIENT_EVENT reply");
                    }
                }
                MsgType::ChannelResponse => {
                    if let Some(slot) = self.slots.get(&frame.correlation_id) {
                        if let ResponseSlot::Channel(queue) = slot.value() {
                            let life_cycle = frame.life_cycle().unwrap_or(LifeCycle::Msg);
                            queue.push(ChannelFrame { life_cycle, body: frame.body });
                        }
                    } else {
                        tracing::debug!(correlation_id = frame.correlation_id, "dropped unrouted CHANNEL_RESPONSE");
                    }
                }
                MsgType::MsgResponse | MsgType::ServerErrorResponse => {
                    if let Some((_, ResponseSlot::Unary(tx))) = self.slots.remove(&frame.correlation_id) {
                        let _ = tx.send(Ok(frame));
                    } else {
                        tracing::debug!(correlation_id = frame.correlation_id, "dropped unrouted response");
                    }
                }
                MsgType::MsgRequest | MsgType::ChannelRequest => {
                    tracing::debug!(correlation_id = frame.correlation_id, "client transport received a request-shaped frame; dropping");
                }
            }
        }
    }

    async fn handle_server_event(self: &Arc<Self>, frame: Frame) {
        let event_name = frame.target().unwrap_or_default().rsplit('/').next().unwrap_or_default().to_string();
        match event_name.as_str() {
            events::EVENT_CLOSE_CONN => {
                self.score.lock().available = false;
                self.broadcast_close(CloseConnError::RemoteEventClose);
            }
            events::PING => {
                let mut header = Header::new();
                header.insert(header_keys::TARGET.to_string(), Value::String(Target::event(events::PING).into()));
                self.annotate(&mut header);
                let reply = Frame::new(MsgType::ServerEvent, frame.correlation_id, header, rmpv::Value::Map(vec![(Value::from("mos"), Value::from(self.score.lock().mos))]));
                if let Err(err) = self.connection.write_frame(&reply).await {
                    tracing::debug!(%err, "failed to reply to server ping event");
                }
            }
            other => {
                if self.contexts.contains_key(&frame.correlation_id) {
                    tracing::debug!(correlation_id = frame.correlation_id, event = other, "server event for a tracked context");
                } else {
                    tracing::debug!(correlation_id = frame.correlation_id, event = other, "transient server event context");
                }
            }
        }
    }
}

/// Writes channel frames for a client-held [`Channel`] by delegating back
/// to the owning transport's connection.
#[derive(Clone)]
pub struct TransportChannelWriter {
    transport: Arc<Transport>,
}

#[async_trait::async_trait]
impl ChannelWriter for TransportChannelWriter {
    async fn write_channel_frame(&self, correlation_id: CorrelationId, life_cycle: LifeCycle, body: Value) -> Result<(), RapError> {
        let mut header = Header::new();
        header.insert(header_keys::CHANNEL_LIFE_CYCLE.to_string(), Value::String(life_cycle.as_str().into()));
        self.transport.annotate(&mut header);
        let frame = Frame::new(MsgType::ChannelRequest, correlation_id, header, body);
        self.transport
            .connection
            .write_frame(&frame)
            .await
            .map_err(|_| RapError::channel("connection closed while writing"))
    }
}

/// `rmpv::Value::Map` is a `Vec<(Value, Value)>`, not a lookup table; this
/// linear-scans it for a string key.
fn map_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.as_map()?.iter().find(|(k, _)| k.as_str() == Some(key)).map(|(_, v)| v)
}

fn uuid_like_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..16).map(|_| format!("{:x}", rng.gen_range(0..16))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_scores_a_fast_low_latency_link_higher() {
        let mut fast = ScoreState::new(10.0);
        let mut slow = ScoreState::new(10.0);
        fast.last_ping_ts = Instant::now() - Duration::from_secs(1000);
        slow.last_ping_ts = Instant::now() - Duration::from_secs(1000);
        fast.apply_ping_sample(0.01, 5);
        slow.apply_ping_sample(0.5, 3);
        assert!(fast.score > slow.score);
    }

    #[test]
    fn inflight_history_is_bounded_to_three_samples() {
        let mut state = ScoreState::new(10.0);
        for sample in [10, 20, 30, 40] {
            state.push_inflight_sample(sample);
        }
        assert_eq!(state.inflight_history.len(), 3);
        assert_eq!(state.inflight_avg(), (20 + 30 + 40) as f64 / 3.0);
    }
}
