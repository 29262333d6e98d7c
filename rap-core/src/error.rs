//! The rap error taxonomy (spec.md §6/§7), grounded in
//! `examples/original_source/rap/common/exceptions.py`.
//!
//! `RapError` is the typed, status-coded error a client reconstructs out of
//! a `SERVER_ERROR_RESPONSE` body. It is distinct from transport-level
//! failures (`ConnectionError`, `ProtocolError`), which are never wrapped in
//! a status code — they fail the caller's future directly, per spec.md §7.

use thiserror::Error;

/// Error raised while framing or parsing the wire protocol itself
/// (malformed tuples, unknown message types, truncated frames on close).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("malformed target: {0}")]
    MalformedTarget(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("connection closed with a truncated frame")]
    TruncatedOnClose,
}

/// Error raised when a connection terminates (EOF, I/O failure, or an
/// explicit local close). Any future or channel queue waiting on that
/// connection is resolved with this error (spec.md §4.2/§4.3).
#[derive(Debug, Error, Clone)]
pub enum CloseConnError {
    #[error("connection closed: {0}")]
    Eof(String),
    #[error("connection closed locally")]
    LocalClose,
    #[error("server sent event_close_conn")]
    RemoteEventClose,
}

/// The closed set of rap status codes (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RapErrorKind {
    AuthError,
    FuncNotFoundError,
    TooManyRequest,
    RpcError,
    LifeCycleError,
    ParseError,
    ProtocolError,
    RegisteredError,
    RpcRunTimeError,
    ServerError,
    CryptoError,
    ChannelError,
}

impl RapErrorKind {
    pub const fn status_code(self) -> i64 {
        match self {
            RapErrorKind::AuthError => 401,
            RapErrorKind::FuncNotFoundError => 402,
            RapErrorKind::TooManyRequest => 403,
            RapErrorKind::RpcError => 500,
            RapErrorKind::LifeCycleError => 501,
            RapErrorKind::ParseError => 502,
            RapErrorKind::ProtocolError => 503,
            RapErrorKind::RegisteredError => 504,
            RapErrorKind::RpcRunTimeError => 505,
            RapErrorKind::ServerError => 506,
            RapErrorKind::CryptoError => 507,
            RapErrorKind::ChannelError => 508,
        }
    }

    pub const fn exc_name(self) -> &'static str {
        match self {
            RapErrorKind::AuthError => "AuthError",
            RapErrorKind::FuncNotFoundError => "FuncNotFoundError",
            RapErrorKind::TooManyRequest => "TooManyRequest",
            RapErrorKind::RpcError => "RPCError",
            RapErrorKind::LifeCycleError => "LifeCycleError",
            RapErrorKind::ParseError => "ParseError",
            RapErrorKind::ProtocolError => "ProtocolError",
            RapErrorKind::RegisteredError => "RegisteredError",
            RapErrorKind::RpcRunTimeError => "RpcRunTimeError",
            RapErrorKind::ServerError => "ServerError",
            RapErrorKind::CryptoError => "CryptoError",
            RapErrorKind::ChannelError => "ChannelError",
        }
    }

    const fn default_message(self) -> &'static str {
        match self {
            RapErrorKind::AuthError => "Auth Error",
            RapErrorKind::FuncNotFoundError => "Not found func",
            RapErrorKind::TooManyRequest => {
                "This user has exceeded an allotted request count. Try again later."
            }
            RapErrorKind::RpcError => "Rpc error",
            RapErrorKind::LifeCycleError => "Life cycle error",
            RapErrorKind::ParseError => "Parse error",
            RapErrorKind::ProtocolError => "Invalid protocol",
            RapErrorKind::RegisteredError => "Register Error",
            RapErrorKind::RpcRunTimeError => "Rpc run time error",
            RapErrorKind::ServerError => "Server error",
            RapErrorKind::CryptoError => "crypto error",
            RapErrorKind::ChannelError => "Channel Error",
        }
    }

    fn from_status_code(status_code: i64) -> Self {
        match status_code {
            401 => RapErrorKind::AuthError,
            402 => RapErrorKind::FuncNotFoundError,
            403 => RapErrorKind::TooManyRequest,
            500 => RapErrorKind::RpcError,
            501 => RapErrorKind::LifeCycleError,
            502 => RapErrorKind::ParseError,
            503 => RapErrorKind::ProtocolError,
            504 => RapErrorKind::RegisteredError,
            506 => RapErrorKind::ServerError,
            507 => RapErrorKind::CryptoError,
            508 => RapErrorKind::ChannelError,
            // Unknown codes fall back to RpcRunTimeError (spec.md §7).
            _ => RapErrorKind::RpcRunTimeError,
        }
    }
}

/// A typed rap error: a status code (spec.md §6) plus a human message,
/// optionally naming the remote exception type it was reconstructed from.
#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct RapError {
    kind: RapErrorKind,
    message: String,
    /// Set when this error was reconstructed from a remote
    /// `SERVER_ERROR_RESPONSE` whose `exc_name` did not match any known
    /// rap error class (spec.md §7: "falls back to RpcRunTimeError"), or
    /// when a handler raised a [`RapError::custom`] exception class.
    remote_exc_name: Option<String>,
    /// Set only by [`RapError::ignore_next_processor`]. A local-only
    /// control-flow signal (spec.md §4.5's `IgnoreNextProcessor`): never
    /// carried on the wire, never matches a §6 status code; recognized by
    /// `ProcessorChain::run_response` and short-circuits the chain instead
    /// of funneling into `process_exc`.
    ignore_next_processor: bool,
}

impl RapError {
    pub fn new(kind: RapErrorKind, extra_msg: Option<&str>) -> Self {
        let message = match extra_msg {
            Some(extra) => format!("{}. {extra}", kind.default_message()),
            None => kind.default_message().to_string(),
        };
        Self { kind, message, remote_exc_name: None, ignore_next_processor: false }
    }

    /// A handler-raised error carrying an arbitrary exception class name
    /// (spec.md §7: "Server-side handler exceptions → SERVER_ERROR_RESPONSE
    /// carrying `(type_name, str(exc))`"). Status code falls back to
    /// `RpcRunTimeError` (505), the same code an unrecognized remote
    /// `exc_name` reconstructs to on the client via [`RapError::from_remote`].
    pub fn custom(exc_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: RapErrorKind::RpcRunTimeError,
            message: message.into(),
            remote_exc_name: Some(exc_name.into()),
            ignore_next_processor: false,
        }
    }

    /// The "ignore the rest of the chain" signal a processor raises to stop
    /// `process_response`/`process_exc` from running any further (spec.md
    /// §4.5).
    pub fn ignore_next_processor() -> Self {
        Self {
            kind: RapErrorKind::RpcRunTimeError,
            message: String::new(),
            remote_exc_name: None,
            ignore_next_processor: true,
        }
    }

    pub fn is_ignore_next_processor(&self) -> bool {
        self.ignore_next_processor
    }

    pub fn status_code(&self) -> i64 {
        self.kind.status_code()
    }

    pub fn exc_name(&self) -> &str {
        self.remote_exc_name.as_deref().unwrap_or(self.kind.exc_name())
    }

    pub fn kind(&self) -> RapErrorKind {
        self.kind
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        RapError::new(RapErrorKind::ChannelError, Some(&msg.into()))
    }

    pub fn func_not_found(target: &str) -> Self {
        RapError::new(RapErrorKind::FuncNotFoundError, Some(&format!("target: {target}")))
    }

    /// Reconstruct a typed error from the `(exc_name, exc_info)` body
    /// carried by `SERVER_ERROR_RESPONSE` plus the `status_code` header
    /// (spec.md §6/§7). If `exc_name` is not one of rap's known classes the
    /// remote name is preserved for display but the error still falls back
    /// to `RpcRunTimeError`'s status code/kind.
    pub fn from_remote(status_code: i64, exc_name: &str, exc_info: &str) -> Self {
        let kind = RapErrorKind::from_status_code(status_code);
        let known = kind.exc_name() == exc_name;
        let mut err = RapError::new(kind, Some(exc_info));
        if !known {
            err.remote_exc_name = Some(exc_name.to_string());
        }
        err
    }

    /// Whether a transport that produced this error should keep serving
    /// other in-flight requests — the spec's closest analogue to the
    /// teacher's `ErrorCategory` driving automated retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, RapErrorKind::TooManyRequest | RapErrorKind::RpcRunTimeError)
    }
}

/// Errors a client-facing call can fail with: either a typed rap error
/// reconstructed from a server response, or a connection-level failure
/// (spec.md §7: "either a rap typed error or a connection error").
#[derive(Debug, Error, Clone)]
pub enum CallError {
    #[error(transparent)]
    Rap(#[from] RapError),
    #[error(transparent)]
    Closed(#[from] CloseConnError),
    #[error("call timed out")]
    Timeout,
}
