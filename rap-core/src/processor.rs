//! The processor chain: the middleware contract wrapping every
//! request/response/exception (spec.md §4.5).

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RapError;
use crate::registry::Registry;
use crate::transport::{Request, Response};

/// Raised by a processor to short-circuit the *remaining* chain at the
/// current stage only (spec.md §4.5) — request processing keeps the
/// request as already transformed by prior processors, it simply stops
/// asking later ones to look at it. Converts into a [`RapError`] so it can
/// travel through the same `Result` shape as any other `process_response`
/// failure; `ProcessorChain::run_response` recognizes it and stops instead
/// of funneling it into `process_exc`.
pub struct IgnoreNextProcessor;

impl From<IgnoreNextProcessor> for RapError {
    fn from(_: IgnoreNextProcessor) -> Self {
        RapError::ignore_next_processor()
    }
}

/// One processor in the chain. All three hooks are optional; the default
/// implementations are identity functions.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process_request(&self, req: Request) -> Result<Request, (Request, RapError)> {
        Ok(req)
    }

    /// Any error other than [`IgnoreNextProcessor`] is funneled into
    /// `process_exc`, reverse-order, starting from the full chain (spec.md
    /// §4.5: "any other exception thrown during response processing is
    /// funneled into process_exc").
    async fn process_response(&self, resp: Response) -> Result<Response, (Response, RapError)> {
        Ok(resp)
    }

    /// Any exception raised while processing a response — including one
    /// raised by a processor's own `process_response` — is funneled here
    /// in reverse chain order (spec.md §4.5).
    async fn process_exc(&self, resp: Response, err: RapError) -> (Response, RapError) {
        (resp, err)
    }

    /// Processors may register additional RPC functions at server start by
    /// mutating the registry (spec.md §4.5).
    fn register_functions(&self, _registry: &mut Registry) {}
}

/// An ordered chain of processors.
#[derive(Clone, Default)]
pub struct ProcessorChain {
    processors: Vec<Arc<dyn Processor>>,
}

impl ProcessorChain {
    pub fn new(processors: Vec<Arc<dyn Processor>>) -> Self {
        Self { processors }
    }

    pub fn register_functions(&self, registry: &mut Registry) {
        for p in &self.processors {
            p.register_functions(registry);
        }
    }

    /// Requests traverse the chain in registration order (spec.md §4.5).
    /// A processor-raised error aborts the send entirely (spec.md §7:
    /// "Processor exceptions in request phase: bubble up, abort the
    /// send.").
    pub async fn run_request(&self, mut req: Request) -> Result<Request, RapError> {
        for p in &self.processors {
            req = match p.process_request(req).await {
                Ok(req) => req,
                Err((_req, err)) => return Err(err),
            };
        }
        Ok(req)
    }

    /// Responses traverse the chain in **reverse** registration order
    /// (spec.md §4.5). `IgnoreNextProcessor` short-circuits the remaining
    /// chain at this stage; any other error is funneled into `process_exc`
    /// across the full chain, reverse order.
    pub async fn run_response(&self, mut resp: Response) -> Result<Response, (Response, RapError)> {
        for p in self.processors.iter().rev() {
            match p.process_response(resp).await {
                Ok(next) => resp = next,
                Err((r, err)) if err.is_ignore_next_processor() => return Ok(r),
                Err((r, err)) => return Err(self.run_exc(r, err).await),
            }
        }
        Ok(resp)
    }

    /// Run the exception-handling stage in reverse order, starting from
    /// the full chain (spec.md §4.5).
    pub async fn run_exc(&self, mut resp: Response, mut err: RapError) -> (Response, RapError) {
        for p in self.processors.iter().rev() {
            let (next_resp, next_err) = p.process_exc(resp, err).await;
            resp = next_resp;
            err = next_err;
        }
        (resp, err)
    }
}
