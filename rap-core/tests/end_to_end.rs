//! End-to-end scenarios (spec.md §8) driven over an in-memory duplex pipe,
//! so these tests never depend on `rap-transport-tcp`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rap_core::conn::Connection;
use rap_core::error::CloseConnError;
use rap_core::registry::{ArgSpec, Registry, Signature};
use rap_core::server::{Server, ServerConfig, ServerConnection};
use rap_core::transport::{Transport, TransportConfig};
use rap_core::processor::ProcessorChain;
use rap_core::wire::{encode, Decoder, Frame, Target};
use rmpv::Value;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;

struct DuplexConnection {
    read: Mutex<(DuplexStream, Decoder)>,
    write: Mutex<DuplexStream>,
    closed: AtomicBool,
}

impl DuplexConnection {
    fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_r, b_w) = duplex(64 * 1024);
        let (b_r, a_w) = duplex(64 * 1024);
        let a = Arc::new(Self { read: Mutex::new((a_r, Decoder::new())), write: Mutex::new(a_w), closed: AtomicBool::new(false) });
        let b = Arc::new(Self { read: Mutex::new((b_r, Decoder::new())), write: Mutex::new(b_w), closed: AtomicBool::new(false) });
        (a, b)
    }
}

#[async_trait]
impl Connection for DuplexConnection {
    async fn write_frame(&self, frame: &Frame) -> Result<(), CloseConnError> {
        let bytes = encode(frame).map_err(|e| CloseConnError::Eof(e.to_string()))?;
        let mut w = self.write.lock().await;
        w.write_all(&bytes).await.map_err(|e| CloseConnError::Eof(e.to_string()))?;
        w.flush().await.map_err(|e| CloseConnError::Eof(e.to_string()))
    }

    async fn read_frame(&self) -> Result<Frame, CloseConnError> {
        let mut guard = self.read.lock().await;
        loop {
            if let Some(frame) = guard.1.poll().map_err(|e| CloseConnError::Eof(e.to_string()))? {
                return Ok(frame);
            }
            let mut buf = [0u8; 4096];
            let (stream, _decoder) = &mut *guard;
            let n = stream.read(&mut buf).await.map_err(|e| CloseConnError::Eof(e.to_string()))?;
            if n == 0 {
                self.closed.store(true, Ordering::Release);
                return Err(CloseConnError::Eof("peer closed".to_string()));
            }
            guard.1.feed(&buf[..n]);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn peer(&self) -> String {
        "duplex".to_string()
    }
}

fn test_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register_normal(
            "echo/default/sum",
            Signature::new(vec![ArgSpec::int("a"), ArgSpec::int("b")]),
            |args: Vec<Value>, _ctx| async move { Ok(Value::from(args[0].as_i64().unwrap() + args[1].as_i64().unwrap())) },
        )
        .unwrap();
    registry
        .register_normal("echo/default/raise_msg_exc", Signature::new(vec![]), |_args: Vec<Value>, _ctx| async move {
            Err(rap_core::error::RapError::custom("ZeroDivisionError", "division by zero"))
        })
        .unwrap();
    registry
        .register_normal("echo/default/greet", Signature::new(vec![]), |_args: Vec<Value>, _ctx| async move { Ok(Value::from("hi")) })
        .unwrap();
    registry
        .register_channel("echo/default/echo_body", |mut channel: rap_core::Channel<rap_core::server::ServerChannelWriter>, _ctx| async move {
            while let Some(Ok(body)) = channel.next().await {
                if channel.send(body).await.is_err() {
                    break;
                }
            }
            channel.close().await;
        })
        .unwrap();
    registry
}

async fn spawn_server() -> Arc<DuplexConnection> {
    spawn_server_with_processors(ProcessorChain::default()).await
}

async fn spawn_server_with_processors(processors: ProcessorChain) -> Arc<DuplexConnection> {
    let (server_conn, client_conn) = DuplexConnection::pair();
    let server = Server::new(test_registry(), processors, ServerConfig::default());
    tokio::spawn(async move {
        let conn = ServerConnection::new(server_conn, server.registry.clone(), server.processors.clone(), server.config.clone());
        conn.serve().await;
    });
    client_conn
}

#[tokio::test]
async fn unary_call_returns_the_sum() {
    let client_conn = spawn_server().await;
    let transport = Transport::connect(client_conn, TransportConfig::default(), None).await.unwrap();
    let target: Target = "echo/default/sum".parse().unwrap();
    let result = transport.request(&target, Value::Array(vec![Value::from(2), Value::from(3)]), None, None).await.unwrap();
    assert_eq!(result.as_i64(), Some(5));
}

#[tokio::test]
async fn unknown_target_surfaces_func_not_found() {
    let client_conn = spawn_server().await;
    let transport = Transport::connect(client_conn, TransportConfig::default(), None).await.unwrap();
    let target: Target = "echo/default/absent_func".parse().unwrap();
    let err = transport.request(&target, Value::Nil, None, None).await.unwrap_err();
    match err {
        rap_core::error::CallError::Rap(rap_err) => assert_eq!(rap_err.exc_name(), "FuncNotFoundError"),
        other => panic!("expected a rap error, got {other:?}"),
    }
}

#[tokio::test]
async fn remote_exception_round_trips_as_a_typed_error() {
    let client_conn = spawn_server().await;
    let transport = Transport::connect(client_conn, TransportConfig::default(), None).await.unwrap();
    let target: Target = "echo/default/raise_msg_exc".parse().unwrap();
    let err = transport.request(&target, Value::Nil, None, None).await.unwrap_err();
    match err {
        rap_core::error::CallError::Rap(rap_err) => {
            assert_eq!(rap_err.status_code(), 505);
            assert_eq!(rap_err.exc_name(), "ZeroDivisionError");
        }
        other => panic!("expected a rap error, got {other:?}"),
    }
}

#[tokio::test]
async fn channel_echoes_every_message_until_closed() {
    let client_conn = spawn_server().await;
    let transport = Transport::connect(client_conn, TransportConfig::default(), None).await.unwrap();
    let target: Target = "echo/default/echo_body".parse().unwrap();
    let mut channel = transport.channel(&target).await.unwrap();

    channel.send(Value::from("hello!")).await.unwrap();
    let echoed = channel.recv().await.unwrap();
    assert_eq!(echoed, Some(Value::from("hello!")));

    channel.close().await;
}

struct UppercasingProcessor;

#[async_trait]
impl rap_core::processor::Processor for UppercasingProcessor {
    async fn process_response(
        &self,
        mut resp: rap_core::transport::Response,
    ) -> Result<rap_core::transport::Response, (rap_core::transport::Response, rap_core::error::RapError)> {
        if let Some(text) = resp.body.as_str() {
            resp.body = Value::String(text.to_uppercase().into());
        }
        Ok(resp)
    }
}

#[tokio::test]
async fn server_outbound_frames_pass_through_the_processor_chain() {
    let processors = ProcessorChain::new(vec![Arc::new(UppercasingProcessor)]);
    let client_conn = spawn_server_with_processors(processors).await;
    let transport = Transport::connect(client_conn, TransportConfig::default(), None).await.unwrap();
    let target: Target = "echo/default/greet".parse().unwrap();
    let result = transport.request(&target, Value::Nil, None, None).await.unwrap();
    assert_eq!(result.as_str(), Some("HI"));
}
