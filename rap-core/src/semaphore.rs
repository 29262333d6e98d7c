//! An in-flight-aware semaphore (spec.md §5/§8 invariant 3):
//! `inflight + free == capacity` at all times.
//!
//! Wraps `tokio::sync::Semaphore` and additionally tracks the current
//! in-flight count so the picker's score-ranking (spec.md §4.6) and the
//! ping-driven elasticity loop (spec.md §4.6 decision table) can read it
//! without acquiring a permit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

pub struct InflightSemaphore {
    inner: Semaphore,
    capacity: usize,
    inflight: AtomicUsize,
}

pub struct InflightGuard<'a> {
    _permit: SemaphorePermit<'a>,
    inflight: &'a AtomicUsize,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl InflightSemaphore {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Semaphore::new(capacity), capacity, inflight: AtomicUsize::new(0) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Acquire one slot, suspending (spec.md §5 suspension points) if the
    /// `(max_inflight + 1)`-th request arrives while all slots are taken
    /// (spec.md §8 boundary behavior).
    pub async fn acquire(&self) -> InflightGuard<'_> {
        let permit = self
            .inner
            .acquire()
            .await
            .expect("semaphore is never closed while the transport is alive");
        self.inflight.fetch_add(1, Ordering::AcqRel);
        InflightGuard { _permit: permit, inflight: &self.inflight }
    }

    pub fn try_acquire(&self) -> Option<InflightGuard<'_>> {
        let permit = self.inner.try_acquire().ok()?;
        self.inflight.fetch_add(1, Ordering::AcqRel);
        Some(InflightGuard { _permit: permit, inflight: &self.inflight })
    }
}

pub type SharedInflightSemaphore = Arc<InflightSemaphore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inflight_plus_free_equals_capacity() {
        let sem = InflightSemaphore::new(3);
        let g1 = sem.acquire().await;
        let g2 = sem.acquire().await;
        assert_eq!(sem.inflight(), 2);
        assert_eq!(sem.capacity() - sem.inflight(), 1);
        drop(g1);
        assert_eq!(sem.inflight(), 1);
        drop(g2);
        assert_eq!(sem.inflight(), 0);
    }

    #[tokio::test]
    async fn nth_plus_one_request_suspends_until_slot_frees() {
        let sem = Arc::new(InflightSemaphore::new(1));
        let guard = sem.acquire().await;
        assert!(sem.try_acquire().is_none(), "capacity is exhausted");

        let sem2 = sem.clone();
        let waiter = tokio::spawn(async move {
            let _g = sem2.acquire().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "waiter must suspend while capacity is exhausted");
        drop(guard);
        waiter.await.unwrap();
    }
}
