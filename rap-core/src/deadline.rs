//! Propagatable deadlines with cancellation (spec.md §5/§7).
//!
//! A `Deadline` is a wall-clock instant a call must complete by. It can be
//! carried across the wire in the `X-rap-deadline` header (absolute UNIX
//! seconds, spec.md §6) and raced against any future via
//! [`Deadline::race`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// What to do when a deadline expires while a call is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlinePolicy {
    /// Cancel and raise a timeout to the caller.
    Raise,
    /// Cancel silently; the caller observes `None` rather than an error.
    Ignore,
}

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    unix_secs: u64,
    policy: DeadlinePolicy,
}

impl Deadline {
    pub fn after(duration: Duration, policy: DeadlinePolicy) -> Self {
        let unix_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .saturating_add(duration)
            .as_secs();
        Self { at: Instant::now() + duration, unix_secs, policy }
    }

    /// Reconstruct a deadline from the absolute UNIX-second value carried in
    /// the `X-rap-deadline` header.
    pub fn from_unix_secs(unix_secs: u64, policy: DeadlinePolicy) -> Self {
        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let remaining = unix_secs.saturating_sub(now_unix);
        Self {
            at: Instant::now() + Duration::from_secs(remaining),
            unix_secs,
            policy,
        }
    }

    pub fn unix_secs(&self) -> u64 {
        self.unix_secs
    }

    pub fn policy(&self) -> DeadlinePolicy {
        self.policy
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Race `fut` against this deadline. Returns `Ok(None)` when the
    /// deadline policy is `Ignore` and time expired first; the caller
    /// decides how to surface a `Raise` timeout as its own error type.
    pub async fn race<F, T>(&self, fut: F) -> Result<T, DeadlineExpired>
    where
        F: std::future::Future<Output = T>,
    {
        match tokio::time::timeout_at(self.at, fut).await {
            Ok(v) => Ok(v),
            Err(_) => Err(DeadlineExpired { policy: self.policy }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeadlineExpired {
    pub policy: DeadlinePolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn race_completes_before_deadline() {
        let deadline = Deadline::after(Duration::from_millis(200), DeadlinePolicy::Raise);
        let result = deadline.race(async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn race_expires_on_slow_future() {
        let deadline = Deadline::after(Duration::from_millis(10), DeadlinePolicy::Raise);
        let result = deadline
            .race(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                42
            })
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn from_unix_secs_round_trips() {
        let d = Deadline::after(Duration::from_secs(9), DeadlinePolicy::Raise);
        let restored = Deadline::from_unix_secs(d.unix_secs(), DeadlinePolicy::Raise);
        assert_eq!(d.unix_secs(), restored.unix_secs());
    }
}
