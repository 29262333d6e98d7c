//! Per-call [`Context`] (spec.md §3).
//!
//! A context is created when a request is initiated (client side) or a new
//! correlation id is first seen (server side) and destroyed when the
//! corresponding response/stream terminates. It carries the deadline (if
//! any) and an `Extensions` map processors and handlers can stash
//! per-request state in — the spec's analogue of the teacher's
//! `pipeline::context` per-request extension map, used here so processors
//! don't need to mutate `self` for per-request state (spec.md §9 redesign
//! flag).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::time::Instant;

use crate::deadline::Deadline;
use crate::wire::CorrelationId;

/// A typed per-request side-channel. Keyed by `TypeId` so unrelated
/// processors cannot accidentally collide on the same slot.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|b| b.downcast::<T>().ok())
            .map(|b| *b)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map.get(&TypeId::of::<T>()).and_then(|b| b.downcast_ref::<T>())
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.map.get_mut(&TypeId::of::<T>()).and_then(|b| b.downcast_mut::<T>())
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.map.remove(&TypeId::of::<T>()).and_then(|b| b.downcast::<T>().ok()).map(|b| *b)
    }
}

/// Per-correlation-id, per-side call context (spec.md §3).
pub struct Context {
    /// Opaque application/server name this context belongs to.
    pub app: String,
    /// Human-readable identifier of the connection (e.g. `peer:port`).
    pub conn: String,
    pub correlation_id: CorrelationId,
    pub target: String,
    pub start_time: Instant,
    pub deadline: Option<Deadline>,
    pub extensions: Extensions,
}

impl Context {
    pub fn new(app: impl Into<String>, conn: impl Into<String>, correlation_id: CorrelationId, target: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            conn: conn.into(),
            correlation_id,
            target: target.into(),
            start_time: Instant::now(),
            deadline: None,
            extensions: Extensions::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Remaining time before the propagated deadline, if any
    /// (spec.md §4.7 "server handlers may read the remaining time via
    /// context").
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline.map(|d| d.remaining())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_round_trip_distinct_types() {
        let mut ext = Extensions::new();
        ext.insert(42u32);
        ext.insert("scope".to_string());
        assert_eq!(ext.get::<u32>(), Some(&42));
        assert_eq!(ext.get::<String>(), Some(&"scope".to_string()));
        assert_eq!(ext.get::<u64>(), None);
    }

    #[test]
    fn context_tracks_correlation_id_and_target() {
        let ctx = Context::new("app", "127.0.0.1:1", 7, "echo/default/sum");
        assert_eq!(ctx.correlation_id, 7);
        assert_eq!(ctx.target, "echo/default/sum");
        assert!(ctx.remaining().is_none());
    }
}
