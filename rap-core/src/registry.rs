//! The server-side function registry: `target → {fn, kind, signature}`
//! (spec.md §3/§4.7).
//!
//! Handlers are type-erased behind a boxed future, the same "decode/encode
//! at the boundary, dyn-dispatch in the middle" shape the teacher's
//! `service::auto_dyn` bridge uses to turn a typed `Service` into an
//! object-safe handle — here applied directly since rap has no code
//! generation step (spec.md §1 Non-goals) to produce typed stubs from.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rmpv::Value;

use crate::channel::Channel;
use crate::context::Context;
use crate::error::RapError;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RapError>> + Send>>;
pub type ChannelHandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// One positional argument's expected name and a loose type predicate used
/// to reject obviously-wrong calls before they reach the handler
/// (spec.md §4.7: "bind arguments by signature (name+type checked;
/// mismatched type → ParseError)").
pub struct ArgSpec {
    pub name: &'static str,
    pub type_check: fn(&Value) -> bool,
}

impl ArgSpec {
    pub fn any(name: &'static str) -> Self {
        Self { name, type_check: |_| true }
    }

    pub fn int(name: &'static str) -> Self {
        Self { name, type_check: |v| v.is_i64() || v.is_u64() }
    }

    pub fn string(name: &'static str) -> Self {
        Self { name, type_check: |v| v.is_str() }
    }
}

pub struct Signature {
    pub args: Vec<ArgSpec>,
}

impl Signature {
    pub fn new(args: Vec<ArgSpec>) -> Self {
        Self { args }
    }

    pub fn check(&self, args: &[Value]) -> Result<(), RapError> {
        if args.len() != self.args.len() {
            return Err(RapError::new(
                crate::error::RapErrorKind::ParseError,
                Some(&format!("expected {} args, got {}", self.args.len(), args.len())),
            ));
        }
        for (spec, value) in self.args.iter().zip(args) {
            if !(spec.type_check)(value) {
                return Err(RapError::new(
                    crate::error::RapErrorKind::ParseError,
                    Some(&format!("argument `{}` has the wrong type", spec.name)),
                ));
            }
        }
        Ok(())
    }
}

/// A registered normal (unary) handler.
pub trait NormalFn: Send + Sync {
    fn call(&self, args: Vec<Value>, ctx: Arc<Context>) -> HandlerFuture;
}

impl<F, Fut> NormalFn for F
where
    F: Fn(Vec<Value>, Arc<Context>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RapError>> + Send + 'static,
{
    fn call(&self, args: Vec<Value>, ctx: Arc<Context>) -> HandlerFuture {
        Box::pin((self)(args, ctx))
    }
}

/// A registered channel handler. Driven by the server dispatcher in a
/// background task once the DECLARE handshake completes (spec.md §4.4).
pub trait ChannelFn: Send + Sync {
    fn call(&self, channel: Channel<crate::server::ServerChannelWriter>, ctx: Arc<Context>) -> ChannelHandlerFuture;
}

impl<F, Fut> ChannelFn for F
where
    F: Fn(Channel<crate::server::ServerChannelWriter>, Arc<Context>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, channel: Channel<crate::server::ServerChannelWriter>, ctx: Arc<Context>) -> ChannelHandlerFuture {
        Box::pin((self)(channel, ctx))
    }
}

pub enum Handler {
    Normal { func: Arc<dyn NormalFn>, signature: Signature },
    Channel { func: Arc<dyn ChannelFn> },
}

impl Handler {
    pub fn kind(&self) -> &'static str {
        match self {
            Handler::Normal { .. } => "normal",
            Handler::Channel { .. } => "channel",
        }
    }
}

/// `target → Handler`. Registration is only mutated during server init (and
/// by processors in their init hooks), per spec.md §5.
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<String, Handler>,
}

#[derive(Debug, thiserror::Error)]
#[error("target `{0}` is already registered")]
pub struct AlreadyRegistered(pub String);

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_normal(
        &mut self,
        target: impl Into<String>,
        signature: Signature,
        func: impl NormalFn + 'static,
    ) -> Result<(), AlreadyRegistered> {
        let target = target.into();
        if self.handlers.contains_key(&target) {
            return Err(AlreadyRegistered(target));
        }
        self.handlers.insert(target, Handler::Normal { func: Arc::new(func), signature });
        Ok(())
    }

    pub fn register_channel(
        &mut self,
        target: impl Into<String>,
        func: impl ChannelFn + 'static,
    ) -> Result<(), AlreadyRegistered> {
        let target = target.into();
        if self.handlers.contains_key(&target) {
            return Err(AlreadyRegistered(target));
        }
        self.handlers.insert(target, Handler::Channel { func: Arc::new(func) });
        Ok(())
    }

    pub fn get(&self, target: &str) -> Option<&Handler> {
        self.handlers.get(target)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_registration_fails() {
        let mut reg = Registry::new();
        reg.register_normal("s/default/sum", Signature::new(vec![ArgSpec::int("a"), ArgSpec::int("b")]), |args: Vec<Value>, _ctx| async move {
            let a = args[0].as_i64().unwrap();
            let b = args[1].as_i64().unwrap();
            Ok(Value::from(a + b))
        })
        .unwrap();

        let err = reg
            .register_normal("s/default/sum", Signature::new(vec![]), |_args: Vec<Value>, _ctx| async move { Ok(Value::Nil) })
            .unwrap_err();
        assert_eq!(err.0, "s/default/sum");
    }

    #[test]
    fn signature_rejects_wrong_arity() {
        let sig = Signature::new(vec![ArgSpec::int("a"), ArgSpec::int("b")]);
        let err = sig.check(&[Value::from(1)]).unwrap_err();
        assert_eq!(err.exc_name(), "ParseError");
    }

    #[test]
    fn signature_rejects_wrong_type() {
        let sig = Signature::new(vec![ArgSpec::int("a")]);
        let err = sig.check(&[Value::from("nope")]).unwrap_err();
        assert_eq!(err.exc_name(), "ParseError");
    }
}
