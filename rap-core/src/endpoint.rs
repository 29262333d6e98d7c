//! Endpoint connection pooling and the transport picker (spec.md §4.6).
//!
//! An [`Endpoint`] owns one elastic [`TransportGroup`] per discovered
//! `(host, port)` for a logical server name, plus the ordered key list that
//! picking round-robins over. [`Picker`] runs the two-phase selection
//! spec.md §4.6 describes (select keys by policy, rotate each selected
//! group, score-rank the heads); [`PrivatePicker`] dials a brand-new
//! dedicated transport out of band for callers that need connection
//! affinity (spec.md §9 supplemented feature, grounded in
//! `examples/original_source/rap/client/transport/transport.py`'s
//! `_use_transport_list`/private-transport bookkeeping).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::seq::SliceRandom;

use crate::config::PoolConfig;
use crate::conn::Connection;
use crate::discovery::{Discovery, DiscoveredAddress};
use crate::error::CallError;
use crate::processor::ProcessorChain;
use crate::transport::{Transport, TransportConfig};

/// Seconds an `available_level <= 0` transport is given before it is
/// actually closed (spec.md §4.6).
const CLOSE_SOON_DELAY: Duration = Duration::from_secs(60);

/// Per-transport inflight-average thresholds driving elastic grow/shrink
/// (spec.md §4.6 decision table, literal 80/20).
const GROW_THRESHOLD_PCT: f64 = 0.8;
const SHRINK_THRESHOLD_PCT: f64 = 0.2;

/// How [`Picker`] selects which `(host, port)` keys to consider on a pick
/// (spec.md §4.6 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancePolicy {
    Random,
    RoundRobin,
}

/// The ordered rotation of transports dialed for one `(host, port)`
/// (spec.md §4.6: "A group is an ordered rotation (insertion order, rotated
/// by one on each pick to spread load intra-group)").
pub struct TransportGroup {
    host: String,
    port: u16,
    transports: RwLock<Vec<Arc<Transport>>>,
}

impl TransportGroup {
    fn new(host: String, port: u16) -> Self {
        Self { host, port, transports: RwLock::new(Vec::new()) }
    }

    fn connected_count(&self) -> usize {
        self.transports.read().iter().filter(|t| !t.is_closed()).count()
    }

    fn push(&self, transport: Arc<Transport>) {
        self.transports.write().push(transport);
    }

    fn retain_open(&self) {
        self.transports.write().retain(|t| !t.is_closed());
    }

    fn snapshot(&self) -> Vec<Arc<Transport>> {
        self.transports.read().clone()
    }

    /// Rotate the group by one and return the new head (spec.md §4.6 step
    /// 2). `None` if the group is empty.
    fn rotate_head(&self) -> Option<Arc<Transport>> {
        let mut transports = self.transports.write();
        if transports.is_empty() {
            return None;
        }
        transports.rotate_left(1);
        transports.first().cloned()
    }
}

/// One logical server name's discovered addresses: an ordered key list (for
/// round-robin key selection) plus the per-key [`TransportGroup`]
/// (spec.md §4.6: "Maintains one `TransportGroup` per `(host,port)`").
struct ServerPool {
    keys: RwLock<Vec<(String, u16)>>,
    groups: RwLock<HashMap<(String, u16), Arc<TransportGroup>>>,
    key_cursor: AtomicUsize,
}

impl ServerPool {
    fn new() -> Self {
        Self { keys: RwLock::new(Vec::new()), groups: RwLock::new(HashMap::new()), key_cursor: AtomicUsize::new(0) }
    }

    fn group_for(&self, host: &str, port: u16) -> Arc<TransportGroup> {
        let key = (host.to_string(), port);
        if let Some(group) = self.groups.read().get(&key) {
            return group.clone();
        }
        let mut groups = self.groups.write();
        let group = groups.entry(key.clone()).or_insert_with(|| Arc::new(TransportGroup::new(host.to_string(), port))).clone();
        let mut keys = self.keys.write();
        if !keys.contains(&key) {
            keys.push(key);
        }
        group
    }

    fn all_groups(&self) -> Vec<Arc<TransportGroup>> {
        self.groups.read().values().cloned().collect()
    }

    fn connected_count(&self) -> usize {
        self.all_groups().iter().map(|g| g.connected_count()).sum()
    }

    fn retain_open(&self) {
        for group in self.all_groups() {
            group.retain_open();
        }
        let mut keys = self.keys.write();
        let groups = self.groups.read();
        keys.retain(|key| groups.get(key).map(|g| g.connected_count() > 0).unwrap_or(false));
    }

    /// Select `min(cnt, |keys|)` keys by policy (spec.md §4.6 step 1).
    fn select_keys(&self, cnt: usize, policy: BalancePolicy) -> Vec<(String, u16)> {
        let keys = self.keys.read();
        if keys.is_empty() {
            return Vec::new();
        }
        let cnt = cnt.min(keys.len());
        match policy {
            BalancePolicy::Random => {
                let mut rng = rand::thread_rng();
                (0..cnt).filter_map(|_| keys.choose(&mut rng).cloned()).collect()
            }
            BalancePolicy::RoundRobin => {
                let start = self.key_cursor.fetch_add(cnt, Ordering::Relaxed) % keys.len();
                (0..cnt).map(|i| keys[(start + i) % keys.len()].clone()).collect()
            }
        }
    }
}

/// Selects one transport out of an [`Endpoint`]'s pool for a given server
/// name: select candidate keys, rotate each key's group by one, filter
/// unavailable heads, then score-rank what remains (spec.md §4.6
/// `picker(cnt, private?)`).
pub struct Picker {
    policy: BalancePolicy,
}

impl Picker {
    pub fn new(policy: BalancePolicy) -> Self {
        Self { policy }
    }

    fn candidate_heads(&self, pool: &ServerPool, cnt: usize) -> Vec<Arc<Transport>> {
        pool.select_keys(cnt, self.policy)
            .into_iter()
            .filter_map(|(host, port)| pool.groups.read().get(&(host, port)).cloned())
            .filter_map(|group| group.rotate_head())
            .filter(|t| t.is_available())
            .collect()
    }

    /// Pick the single best transport among `cnt` candidate keys
    /// (spec.md §4.6 steps 1-4).
    fn pick_n(&self, pool: &ServerPool, cnt: usize) -> Option<Arc<Transport>> {
        self.candidate_heads(pool, cnt)
            .into_iter()
            .max_by(|a, b| a.effective_score().partial_cmp(&b.effective_score()).unwrap_or(std::cmp::Ordering::Equal))
    }

    fn pick(&self, pool: &ServerPool) -> Option<Arc<Transport>> {
        let key_count = pool.keys.read().len();
        self.pick_n(pool, key_count)
    }
}

/// A transport dialed fresh and held exclusively by one caller
/// (spec.md §4.6: "A private picker creates a *new dedicated transport* on
/// the same (host,port,weight,capacity) on acquire, and destroys it on
/// release"). Never enters a [`TransportGroup`]'s rotation, so ordinary
/// [`Picker::pick`] can never observe it.
pub struct PrivateLease {
    transport: Arc<Transport>,
    released: AtomicBool,
}

impl PrivateLease {
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Destroy the dedicated transport now instead of waiting on drop.
    pub fn release(self) {
        self.close_once();
    }

    fn close_once(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.close();
    }
}

impl Drop for PrivateLease {
    fn drop(&mut self) {
        self.close_once();
    }
}

/// Dedicated picker for leasing a transport out of shared rotation.
pub struct PrivatePicker;

impl PrivatePicker {
    /// Dial a fresh transport on `(host, port)` with `weight` applied to a
    /// clone of `transport_config`, never registering it in any
    /// [`TransportGroup`] (spec.md §4.6 private-lease semantics).
    pub async fn lease<D, F>(
        host: &str,
        port: u16,
        weight: f64,
        transport_config: &TransportConfig,
        processors: Option<ProcessorChain>,
        mut dial: D,
    ) -> Result<PrivateLease, CallError>
    where
        D: FnMut(String) -> F,
        F: Future<Output = Result<Arc<dyn Connection>, CallError>>,
    {
        let mut config = transport_config.clone();
        config.weight = weight;
        let connection = dial(format!("{host}:{port}")).await?;
        let transport = Transport::connect(connection, config, processors).await?;
        Ok(PrivateLease { transport, released: AtomicBool::new(false) })
    }
}

/// Owns every [`ServerPool`] for every server name this client talks to,
/// plus the discovery source and elastic-pool policy (spec.md §4.6).
pub struct Endpoint {
    discovery: Arc<dyn Discovery>,
    pool_config: PoolConfig,
    transport_config: TransportConfig,
    processors: Option<ProcessorChain>,
    pools: RwLock<HashMap<String, Arc<ServerPool>>>,
}

impl Endpoint {
    pub fn new(discovery: Arc<dyn Discovery>, pool_config: PoolConfig, transport_config: TransportConfig, processors: Option<ProcessorChain>) -> Arc<Self> {
        Arc::new(Self { discovery, pool_config, transport_config, processors, pools: RwLock::new(HashMap::new()) })
    }

    fn pool_for(&self, server_name: &str) -> Arc<ServerPool> {
        if let Some(pool) = self.pools.read().get(server_name) {
            return pool.clone();
        }
        let mut pools = self.pools.write();
        pools.entry(server_name.to_string()).or_insert_with(|| Arc::new(ServerPool::new())).clone()
    }

    fn dial_config(&self, address: &DiscoveredAddress) -> TransportConfig {
        let mut config = self.transport_config.clone();
        config.weight = address.weight;
        if let Some(max_conn_inflight) = address.max_conn_inflight {
            config.max_inflight = max_conn_inflight;
        }
        config
    }

    async fn dial_one<D, F>(self: &Arc<Self>, group: &Arc<TransportGroup>, address: &DiscoveredAddress, dial: &mut D) -> Result<(), CallError>
    where
        D: FnMut(String) -> F,
        F: Future<Output = Result<Arc<dyn Connection>, CallError>>,
    {
        let connection = dial(address.dial_addr()).await?;
        let transport = Transport::connect(connection, self.dial_config(address), self.processors.clone()).await?;
        let weak_group = Arc::downgrade(group);
        let to_remove = transport.clone();
        transport.set_on_closed(Arc::new(move || {
            if let Some(group) = weak_group.upgrade() {
                group.transports.write().retain(|t| !Arc::ptr_eq(t, &to_remove));
            }
        }));
        group.push(transport);
        Ok(())
    }

    /// Ensure at least `min_pool_size` open transports exist for
    /// `server_name`, dialing fresh connections via `dial` as needed
    /// (spec.md §4.6: "create_one installs a done-callback removing the
    /// transport from its group on close").
    pub async fn ensure_min_pool<D, F>(self: &Arc<Self>, server_name: &str, mut dial: D) -> Result<(), CallError>
    where
        D: FnMut(String) -> F,
        F: Future<Output = Result<Arc<dyn Connection>, CallError>>,
    {
        let pool = self.pool_for(server_name);
        pool.retain_open();
        let addresses = self.discovery.resolve(server_name).await;
        if addresses.is_empty() {
            return Ok(());
        }
        let mut idx = 0;
        while pool.connected_count() < self.pool_config.min_pool_size {
            let address = &addresses[idx % addresses.len()];
            idx += 1;
            let group = pool.group_for(&address.host, address.port);
            self.dial_one(&group, address, &mut dial).await?;
        }
        Ok(())
    }

    /// Ping-driven elasticity: ping every open transport, recover or decay
    /// `available_level`, schedule `close_soon` once a transport bottoms
    /// out, then grow/shrink each `(host,port)` group against the literal
    /// 80/20 `inflight_avg()` thresholds (spec.md §4.6 decision table).
    pub async fn run_elasticity_tick<D, F>(self: &Arc<Self>, server_name: &str, mut dial: D) -> Result<(), CallError>
    where
        D: FnMut(String) -> F,
        F: Future<Output = Result<Arc<dyn Connection>, CallError>>,
    {
        let pool = self.pool_for(server_name);
        let addresses = self.discovery.resolve(server_name).await;
        let address_by_key: HashMap<(String, u16), &DiscoveredAddress> =
            addresses.iter().map(|a| ((a.host.clone(), a.port), a)).collect();

        for group in pool.all_groups() {
            let transports = group.snapshot();
            for transport in &transports {
                if transport.ping().await.is_err() {
                    transport.set_available_level(|level| level - 1);
                } else if transport.available_level() < 5 {
                    transport.set_available_level(|level| level + 1);
                }
                if transport.available_level() <= 0 {
                    transport.close_soon(CLOSE_SOON_DELAY);
                }
                transport.push_inflight_sample();
            }
            group.retain_open();

            let connected = group.connected_count();
            let grown = transports.iter().any(|t| t.inflight_avg() >= t.capacity() as f64 * GROW_THRESHOLD_PCT);
            if grown && connected < self.pool_config.max_pool_size {
                if let Some(&address) = address_by_key.get(&(group.host.clone(), group.port)) {
                    self.dial_one(&group, address, &mut dial).await?;
                }
            } else if connected > self.pool_config.min_pool_size {
                if let Some(victim) = transports.iter().find(|t| t.inflight_avg() < t.capacity() as f64 * SHRINK_THRESHOLD_PCT) {
                    victim.set_available_level(|level| level - 1);
                }
            }
        }
        pool.retain_open();
        Ok(())
    }

    /// Build a [`Picker`] using the configured balance policy
    /// (spec.md §4.6 `picker(cnt, private?)`).
    pub fn picker(&self) -> Picker {
        Picker::new(self.pool_config.balance_policy)
    }

    /// Pick one transport for `server_name` across every discovered key
    /// (spec.md §4.6 steps 1-4, `cnt = |keys|`).
    pub fn pick(&self, server_name: &str) -> Option<Arc<Transport>> {
        self.picker().pick(&self.pool_for(server_name))
    }

    /// Lease a brand-new dedicated transport on one of `server_name`'s
    /// discovered addresses, chosen by the configured policy among keys
    /// (spec.md §4.6 private-lease semantics). Dials fresh via `dial`;
    /// never touches the shared rotation.
    pub async fn lease_private<D, F>(self: &Arc<Self>, server_name: &str, dial: D) -> Result<PrivateLease, CallError>
    where
        D: FnMut(String) -> F,
        F: Future<Output = Result<Arc<dyn Connection>, CallError>>,
    {
        let addresses = self.discovery.resolve(server_name).await;
        let address = self
            .picker()
            .policy_pick_address(&addresses)
            .ok_or_else(|| CallError::Closed(crate::error::CloseConnError::LocalClose))?;
        PrivatePicker::lease(&address.host, address.port, address.weight, &self.transport_config, self.processors.clone(), dial).await
    }
}

impl Picker {
    /// Policy-select one address out of a freshly resolved set, mirroring
    /// step 1's key selection for a private lease that has no existing
    /// `ServerPool` key list to draw from yet.
    fn policy_pick_address<'a>(&self, addresses: &'a [DiscoveredAddress]) -> Option<&'a DiscoveredAddress> {
        if addresses.is_empty() {
            return None;
        }
        match self.policy {
            BalancePolicy::Random => addresses.choose(&mut rand::thread_rng()),
            BalancePolicy::RoundRobin => addresses.first(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Connection;
    use crate::error::CloseConnError;
    use crate::wire::{encode, Decoder, Frame};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool as StdAtomicBool;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::Mutex as TokioMutex;

    struct LoopbackConnection {
        read: TokioMutex<(DuplexStream, Decoder)>,
        write: TokioMutex<DuplexStream>,
        closed: StdAtomicBool,
    }

    impl LoopbackConnection {
        fn pair() -> (Arc<Self>, Arc<Self>) {
            let (a_r, b_w) = duplex(64 * 1024);
            let (b_r, a_w) = duplex(64 * 1024);
            let a = Arc::new(Self { read: TokioMutex::new((a_r, Decoder::new())), write: TokioMutex::new(a_w), closed: StdAtomicBool::new(false) });
            let b = Arc::new(Self { read: TokioMutex::new((b_r, Decoder::new())), write: TokioMutex::new(b_w), closed: StdAtomicBool::new(false) });
            (a, b)
        }
    }

    #[async_trait]
    impl Connection for LoopbackConnection {
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
            "loopback".to_string()
        }
    }

    fn echo_registry() -> crate::registry::Registry {
        crate::registry::Registry::new()
    }

    async fn spawn_echo_server() -> Arc<LoopbackConnection> {
        let (server_conn, client_conn) = LoopbackConnection::pair();
        let server = crate::server::Server::new(echo_registry(), ProcessorChain::default(), crate::server::ServerConfig::default());
        tokio::spawn(async move {
            let conn = crate::server::ServerConnection::new(server_conn, server.registry.clone(), server.processors.clone(), server.config.clone());
            conn.serve().await;
        });
        client_conn
    }

    async fn connected_transport() -> Arc<Transport> {
        let conn = spawn_echo_server().await;
        Transport::connect(conn, TransportConfig::default(), None).await.unwrap()
    }

    #[tokio::test]
    async fn round_robin_visits_each_key_exactly_once_per_n_calls() {
        let pool = ServerPool::new();
        let mut transports = Vec::new();
        for i in 0..3u16 {
            let group = pool.group_for("host", 9000 + i);
            let transport = connected_transport().await;
            group.push(transport.clone());
            transports.push(transport);
        }
        let picker = Picker::new(BalancePolicy::RoundRobin);
        let mut visited = Vec::new();
        for _ in 0..3 {
            let picked = picker.pick_n(&pool, 1).expect("a transport");
            let idx = transports.iter().position(|t| Arc::ptr_eq(t, &picked)).expect("a known transport");
            visited.push(idx);
        }
        visited.sort_unstable();
        assert_eq!(visited, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn unavailable_transport_is_never_picked() {
        let pool = ServerPool::new();
        let group = pool.group_for("host", 9000);
        let transport = connected_transport().await;
        transport.set_available(false);
        group.push(transport);

        let picker = Picker::new(BalancePolicy::RoundRobin);
        assert!(picker.pick(&pool).is_none());
    }

    #[tokio::test]
    async fn private_lease_dials_a_fresh_transport_and_closes_it_on_release() {
        let conn = spawn_echo_server().await;
        let lease = PrivatePicker::lease("irrelevant", 0, 10.0, &TransportConfig::default(), None, |_addr| {
            let conn = conn.clone();
            async move { Ok(conn as Arc<dyn Connection>) }
        })
        .await
        .unwrap();
        assert!(!lease.transport().is_closed());
        let transport = lease.transport().clone();
        lease.release();
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn private_lease_never_enters_the_shared_group() {
        let pool = ServerPool::new();
        let group = pool.group_for("host", 9000);
        group.push(connected_transport().await);

        let conn = spawn_echo_server().await;
        let _lease = PrivatePicker::lease("host", 9000, 10.0, &TransportConfig::default(), None, |_addr| {
            let conn = conn.clone();
            async move { Ok(conn as Arc<dyn Connection>) }
        })
        .await
        .unwrap();

        assert_eq!(group.snapshot().len(), 1);
    }
}
