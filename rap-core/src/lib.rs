//! `rap-core`: the transport-agnostic contract for the rap RPC protocol —
//! wire codec, correlation-id multiplexing, streaming channels, the
//! processor middleware chain, the function registry, and the client/server
//! orchestration built on top of them.
//!
//! Concrete socket implementations (TCP, TLS) live in `rap-transport-tcp`
//! and implement the [`conn::Connection`] trait defined here.

pub mod channel;
pub mod config;
pub mod context;
pub mod conn;
pub mod deadline;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod processor;
pub mod registry;
pub mod semaphore;
pub mod server;
pub mod transport;
pub mod wire;

pub use channel::{Channel, ChannelFrame, ChannelWriter};
pub use config::{ClientConfig, PoolConfig};
pub use conn::Connection;
pub use context::Context;
pub use deadline::{Deadline, DeadlinePolicy};
pub use discovery::{Discovery, DiscoveredAddress, StaticDiscovery};
pub use endpoint::{BalancePolicy, Endpoint, Picker, PrivateLease, PrivatePicker};
pub use error::{CallError, CloseConnError, RapError, RapErrorKind};
pub use processor::{IgnoreNextProcessor, Processor, ProcessorChain};
pub use registry::{ArgSpec, Handler, Registry, Signature};
pub use server::{Server, ServerConfig, ServerConnection};
pub use transport::{Request, Response, Transport, TransportConfig};
pub use wire::{Frame, Header, LifeCycle, MsgType, Target};
