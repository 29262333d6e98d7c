//! Endpoint address discovery (spec.md §4.6, supplemented from
//! `examples/original_source/rap/client/transport/local.py`'s
//! `LocalDeregisterClient` static-address pattern — concrete etcd/consul
//! backends are out of scope, see `SPEC_FULL.md`).

use async_trait::async_trait;

/// One `(host, port)` a logical server name resolves to, plus the
/// per-address tunables spec.md §6's Discovery interface carries:
/// `{host, port, weight, max_conn_inflight?}`.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredAddress {
    pub host: String,
    pub port: u16,
    pub weight: f64,
    pub max_conn_inflight: Option<usize>,
}

impl DiscoveredAddress {
    pub fn new(host: impl Into<String>, port: u16, weight: f64) -> Self {
        Self { host: host.into(), port, weight, max_conn_inflight: None }
    }

    pub fn with_max_conn_inflight(mut self, max_conn_inflight: usize) -> Self {
        self.max_conn_inflight = Some(max_conn_inflight);
        self
    }

    pub fn dial_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where to dial for one logical server name. Implementors may poll a
/// registry; `StaticDiscovery` never changes after construction.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn resolve(&self, server_name: &str) -> Vec<DiscoveredAddress>;
}

/// A fixed, pre-configured set of addresses per server name.
pub struct StaticDiscovery {
    addresses: std::collections::HashMap<String, Vec<DiscoveredAddress>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self { addresses: std::collections::HashMap::new() }
    }

    pub fn with(mut self, server_name: impl Into<String>, addresses: Vec<DiscoveredAddress>) -> Self {
        self.addresses.insert(server_name.into(), addresses);
        self
    }
}

impl Default for StaticDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn resolve(&self, server_name: &str) -> Vec<DiscoveredAddress> {
        self.addresses.get(server_name).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_registered_server_names() {
        let discovery = StaticDiscovery::new().with("echo", vec![DiscoveredAddress::new("127.0.0.1", 9000, 10.0)]);
        assert_eq!(discovery.resolve("echo").await, vec![DiscoveredAddress::new("127.0.0.1", 9000, 10.0)]);
        assert!(discovery.resolve("missing").await.is_empty());
    }

    #[tokio::test]
    async fn carries_per_address_weight_and_inflight_cap() {
        let discovery = StaticDiscovery::new().with("echo", vec![DiscoveredAddress::new("10.0.0.1", 9000, 25.0).with_max_conn_inflight(50)]);
        let resolved = discovery.resolve("echo").await;
        assert_eq!(resolved[0].weight, 25.0);
        assert_eq!(resolved[0].max_conn_inflight, Some(50));
        assert_eq!(resolved[0].dial_addr(), "10.0.0.1:9000");
    }
}
