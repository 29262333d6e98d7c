//! The wire protocol: message types, correlation ids, targets and the frame
//! codec.
//!
//! Every frame on the wire is exactly one top-level 4-tuple
//! `(msg_type, correlation_id, header, body)`, MessagePack-encoded. The
//! encoder produces deterministic bytes and the decoder consumes arbitrary
//! byte chunks, yielding complete frames as soon as they are available —
//! mirroring `msgpack.Unpacker.feed`/`next` in the original Python
//! implementation this protocol is derived from.

use std::collections::BTreeMap;
use std::io::Cursor;

use bytes::{Buf, BytesMut};
use rmpv::Value;

use crate::error::ProtocolError;

/// Protocol version advertised in the `version` header on every frame.
pub const PROTOCOL_VERSION: &str = "0.1";

/// Closed set of wire message types (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    ServerErrorResponse,
    MsgRequest,
    ChannelRequest,
    ClientEvent,
    MsgResponse,
    ChannelResponse,
    ServerEvent,
}

impl MsgType {
    pub const fn code(self) -> i64 {
        match self {
            MsgType::ServerErrorResponse => 100,
            MsgType::MsgRequest => 101,
            MsgType::ChannelRequest => 102,
            MsgType::ClientEvent => 103,
            MsgType::MsgResponse => 201,
            MsgType::ChannelResponse => 202,
            MsgType::ServerEvent => 203,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            100 => MsgType::ServerErrorResponse,
            101 => MsgType::MsgRequest,
            102 => MsgType::ChannelRequest,
            103 => MsgType::ClientEvent,
            201 => MsgType::MsgResponse,
            202 => MsgType::ChannelResponse,
            203 => MsgType::ServerEvent,
            _ => return None,
        })
    }
}

/// A 16-bit correlation id, unique per in-flight operation on one
/// connection. Wraps modulo 65,535 (spec.md §3).
pub type CorrelationId = u16;

/// Reserved header keys (spec.md §3/§6).
pub mod header_keys {
    pub const TARGET: &str = "target";
    pub const STATUS_CODE: &str = "status_code";
    pub const HOST: &str = "host";
    pub const VERSION: &str = "version";
    pub const USER_AGENT: &str = "user_agent";
    pub const REQUEST_ID: &str = "request_id";
    pub const CHANNEL_LIFE_CYCLE: &str = "channel_life_cycle";
    pub const CHANNEL_ID: &str = "channel_id";
    pub const DEADLINE: &str = "X-rap-deadline";
}

/// Reserved event/func names used with `CLIENT_EVENT`/`SERVER_EVENT`.
pub mod events {
    pub const DECLARE: &str = "declare";
    pub const PING: &str = "ping";
    pub const EVENT_CLOSE_CONN: &str = "event_close_conn";
}

/// Channel life-cycle markers carried in the `channel_life_cycle` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifeCycle {
    Declare,
    Msg,
    Drop,
}

impl LifeCycle {
    pub fn as_str(self) -> &'static str {
        match self {
            LifeCycle::Declare => "declare",
            LifeCycle::Msg => "MSG",
            LifeCycle::Drop => "drop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "declare" => Some(LifeCycle::Declare),
            "MSG" => Some(LifeCycle::Msg),
            "drop" => Some(LifeCycle::Drop),
            _ => None,
        }
    }
}

/// A mapping from short string keys to arbitrary msgpack values.
pub type Header = BTreeMap<String, Value>;

/// Target string `"<server_name>/<group>/<func_name>"`. Group defaults to
/// `"default"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub server_name: String,
    pub group: String,
    pub func_name: String,
}

pub const DEFAULT_GROUP: &str = "default";

impl Target {
    pub fn new(server_name: impl Into<String>, func_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            group: DEFAULT_GROUP.to_string(),
            func_name: func_name.into(),
        }
    }

    pub fn with_group(
        server_name: impl Into<String>,
        group: impl Into<String>,
        func_name: impl Into<String>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            group: group.into(),
            func_name: func_name.into(),
        }
    }

    /// Lifecycle target for the given event name, e.g. `/_event/ping`.
    pub fn event(event_name: &str) -> String {
        format!("/_event/{event_name}")
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.server_name, self.group, self.func_name)
    }
}

impl std::str::FromStr for Target {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        let server_name = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProtocolError::MalformedTarget(s.to_string()))?;
        let group = parts.next().filter(|s| !s.is_empty()).unwrap_or(DEFAULT_GROUP);
        let func_name = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProtocolError::MalformedTarget(s.to_string()))?;
        Ok(Target::with_group(server_name, group, func_name))
    }
}

/// One wire frame: the 4-tuple `(msg_type, correlation_id, header, body)`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: MsgType,
    pub correlation_id: CorrelationId,
    pub header: Header,
    pub body: Value,
}

impl Frame {
    pub fn new(msg_type: MsgType, correlation_id: CorrelationId, header: Header, body: Value) -> Self {
        Self { msg_type, correlation_id, header, body }
    }

    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.header.get(key).and_then(|v| v.as_str())
    }

    pub fn target(&self) -> Option<&str> {
        self.header_str(header_keys::TARGET)
    }

    pub fn status_code(&self) -> Option<i64> {
        self.header.get(header_keys::STATUS_CODE).and_then(|v| v.as_i64())
    }

    pub fn life_cycle(&self) -> Option<LifeCycle> {
        self.header_str(header_keys::CHANNEL_LIFE_CYCLE).and_then(LifeCycle::parse)
    }
}

fn header_to_value(header: &Header) -> Value {
    Value::Map(
        header
            .iter()
            .map(|(k, v)| (Value::String(k.as_str().into()), v.clone()))
            .collect(),
    )
}

fn value_to_header(value: Value) -> Result<Header, ProtocolError> {
    let Value::Map(entries) = value else {
        return Err(ProtocolError::MalformedFrame("header is not a map"));
    };
    let mut header = Header::new();
    for (k, v) in entries {
        let key = k.as_str().ok_or(ProtocolError::MalformedFrame("header key is not a string"))?;
        header.insert(key.to_string(), v);
    }
    Ok(header)
}

/// Encode one frame into deterministic MessagePack bytes.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let tuple = Value::Array(vec![
        Value::Integer(frame.msg_type.code().into()),
        Value::Integer(frame.correlation_id.into()),
        header_to_value(&frame.header),
        frame.body.clone(),
    ]);
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &tuple).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

/// A stateful decoder that consumes arbitrary byte chunks and yields
/// complete frames as they become decodable. Truncated input simply causes
/// [`Decoder::poll`] to return `Ok(None)` until more bytes arrive.
#[derive(Default)]
pub struct Decoder {
    buf: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Attempt to decode one complete frame from the buffered bytes.
    /// Returns `Ok(None)` if more bytes are needed.
    pub fn poll(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&self.buf[..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                let frame = value_to_frame(value)?;
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            Err(rmpv::decode::Error::InvalidMarkerRead(e) | rmpv::decode::Error::InvalidDataRead(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                Ok(None)
            }
            Err(e) => Err(ProtocolError::Decode(e.to_string())),
        }
    }
}

fn value_to_frame(value: Value) -> Result<Frame, ProtocolError> {
    let Value::Array(mut items) = value else {
        return Err(ProtocolError::MalformedFrame("top-level value is not an array"));
    };
    if items.len() != 4 {
        return Err(ProtocolError::MalformedFrame("frame tuple does not have 4 elements"));
    }
    let body = items.pop().unwrap();
    let header_value = items.pop().unwrap();
    let correlation_id = items
        .pop()
        .unwrap()
        .as_u64()
        .and_then(|v| u16::try_from(v).ok())
        .ok_or(ProtocolError::MalformedFrame("correlation_id is not u16"))?;
    let msg_type_code = items
        .pop()
        .unwrap()
        .as_i64()
        .ok_or(ProtocolError::MalformedFrame("msg_type is not an integer"))?;
    let msg_type = MsgType::from_code(msg_type_code)
        .ok_or(ProtocolError::MalformedFrame("unknown msg_type"))?;
    let header = value_to_header(header_value)?;
    Ok(Frame::new(msg_type, correlation_id, header, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        let mut header = Header::new();
        header.insert(header_keys::TARGET.to_string(), Value::String("echo/default/sum".into()));
        header.insert(header_keys::VERSION.to_string(), Value::String(PROTOCOL_VERSION.into()));
        Frame::new(MsgType::MsgRequest, 1, header, Value::Array(vec![Value::from(1), Value::from(2)]))
    }

    #[test]
    fn encode_decode_round_trip() {
        let frame = sample_frame();
        let bytes = encode(&frame).unwrap();
        let mut decoder = Decoder::new();
        decoder.feed(&bytes);
        let decoded = decoder.poll().unwrap().expect("frame should decode");
        assert_eq!(decoded.msg_type, frame.msg_type);
        assert_eq!(decoded.correlation_id, frame.correlation_id);
        assert_eq!(decoded.target(), Some("echo/default/sum"));
    }

    #[test]
    fn decoder_feeds_incrementally() {
        let frame = sample_frame();
        let bytes = encode(&frame).unwrap();
        let (first, second) = bytes.split_at(bytes.len() / 2);
        let mut decoder = Decoder::new();
        decoder.feed(first);
        assert!(decoder.poll().unwrap().is_none(), "truncated frame must not decode");
        decoder.feed(second);
        let decoded = decoder.poll().unwrap().expect("frame completes once fed fully");
        assert_eq!(decoded.correlation_id, 1);
    }

    #[test]
    fn decoder_yields_two_back_to_back_frames() {
        let a = encode(&sample_frame()).unwrap();
        let mut b_frame = sample_frame();
        b_frame.correlation_id = 3;
        let b = encode(&b_frame).unwrap();

        let mut decoder = Decoder::new();
        decoder.feed(&a);
        decoder.feed(&b);
        let first = decoder.poll().unwrap().unwrap();
        let second = decoder.poll().unwrap().unwrap();
        assert_eq!(first.correlation_id, 1);
        assert_eq!(second.correlation_id, 3);
        assert!(decoder.poll().unwrap().is_none());
    }

    #[test]
    fn target_parses_with_default_group() {
        let t: Target = "echo/sum".parse().unwrap();
        assert_eq!(t.group, DEFAULT_GROUP);
        assert_eq!(t.to_string(), "echo/default/sum");
    }

    #[test]
    fn target_parses_explicit_group() {
        let t: Target = "echo/rpc/sum".parse().unwrap();
        assert_eq!(t.group, "rpc");
        assert_eq!(t.func_name, "sum");
    }
}
