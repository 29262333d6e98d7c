//! Plain configuration structs (spec.md §5). rap has no hot-reload or
//! layered-config story, so these are simple value types constructed once
//! at startup — see `SPEC_FULL.md`'s Ambient Stack section for why this
//! departs from a dynamic config layer.

use std::time::Duration;

use crate::endpoint::BalancePolicy;

/// Client-side pool/transport defaults (spec.md §5).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_inflight: usize,
    pub declare_deadline: Duration,
    /// Per-transport ping task sleeps a random interval in
    /// `[min_ping_interval, max_ping_interval]` between pings (spec.md
    /// §4.6).
    pub min_ping_interval: Duration,
    pub max_ping_interval: Duration,
    /// Consecutive missed ping intervals (`max_ping_interval * ping_fail_cnt`
    /// with no successful ping) before a transport is marked unavailable and
    /// its listen loop exits (spec.md §4.6).
    pub ping_fail_cnt: u32,
    pub weight: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_inflight: 100,
            declare_deadline: Duration::from_secs(9),
            min_ping_interval: Duration::from_secs(40),
            max_ping_interval: Duration::from_secs(60),
            ping_fail_cnt: 3,
            weight: 10.0,
        }
    }
}

/// Server-side defaults (spec.md §5).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub app_name: String,
    pub max_inflight: usize,
    pub keep_alive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { app_name: "rap-server".to_string(), max_inflight: 100, keep_alive: Duration::from_secs(1200) }
    }
}

/// Elastic-pool sizing (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub min_ping_interval: Duration,
    pub max_ping_interval: Duration,
    pub ping_fail_cnt: u32,
    /// How `Endpoint::picker` selects among an address's candidate
    /// transports (spec.md §4.6 `picker(cnt, private?)`).
    pub balance_policy: BalancePolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 1,
            max_pool_size: 8,
            min_ping_interval: Duration::from_secs(40),
            max_ping_interval: Duration::from_secs(60),
            ping_fail_cnt: 3,
            balance_policy: BalancePolicy::RoundRobin,
        }
    }
}
