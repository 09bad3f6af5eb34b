//! Neighbor registry: known peers and their liveness

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

/// Identity of a neighbor: its address and TCP package port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NeighborKey(SocketAddr);

impl NeighborKey {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(address, port))
    }

    pub fn address(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for NeighborKey {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for NeighborKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A peer learned from a heartbeat response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborRecord {
    /// Advisory only, never used for identity
    pub host_name: String,
    pub address: IpAddr,
    pub tcp_port: u16,
    pub last_seen: Instant,
}

impl NeighborRecord {
    pub fn key(&self) -> NeighborKey {
        NeighborKey::new(self.address, self.tcp_port)
    }

    /// Alive while strictly less than `survival_timeout` has passed since last seen
    pub fn is_alive_at(&self, now: Instant, survival_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) < survival_timeout
    }
}

/// In-memory neighbor table guarded by a single lock
#[derive(Debug, Clone)]
pub struct NeighborRegistry {
    neighbors: Arc<RwLock<HashMap<NeighborKey, NeighborRecord>>>,
    survival_timeout: Duration,
}

impl NeighborRegistry {
    pub fn new(survival_timeout: Duration) -> Self {
        Self {
            neighbors: Arc::new(RwLock::new(HashMap::new())),
            survival_timeout,
        }
    }

    pub fn survival_timeout(&self) -> Duration {
        self.survival_timeout
    }

    /// Insert or refresh a neighbor, stamping it as seen now.
    ///
    /// Returns `true` if the key was not present or had gone stale.
    pub async fn upsert(&self, key: NeighborKey, host_name: &str) -> bool {
        let now = Instant::now();
        let record = NeighborRecord {
            host_name: host_name.to_string(),
            address: key.address(),
            tcp_port: key.port(),
            last_seen: now,
        };

        let previous = self.neighbors.write().await.insert(key, record);
        match previous {
            Some(old) => !old.is_alive_at(now, self.survival_timeout),
            None => true,
        }
    }

    /// Drop a neighbor, returning its record if it was known
    pub async fn remove(&self, key: &NeighborKey) -> Option<NeighborRecord> {
        self.neighbors.write().await.remove(key)
    }

    /// Look up a neighbor regardless of liveness
    pub async fn get(&self, key: &NeighborKey) -> Option<NeighborRecord> {
        self.neighbors.read().await.get(key).cloned()
    }

    /// Snapshot of every neighbor that is currently alive, ordered by key
    pub async fn live_neighbors(&self) -> Vec<NeighborRecord> {
        let now = Instant::now();
        let mut live: Vec<_> = self
            .neighbors
            .read()
            .await
            .values()
            .filter(|n| n.is_alive_at(now, self.survival_timeout))
            .cloned()
            .collect();
        live.sort_by_key(|n| n.key());
        live
    }

    /// Key of the only live neighbor at `address`.
    ///
    /// `None` when no live neighbor has that address or several do.
    pub async fn unique_key_for(&self, address: IpAddr) -> Option<NeighborKey> {
        let now = Instant::now();
        let neighbors = self.neighbors.read().await;
        let mut matching = neighbors
            .values()
            .filter(|n| n.address == address && n.is_alive_at(now, self.survival_timeout))
            .map(|n| n.key());

        let key = matching.next()?;
        matching.next().is_none().then_some(key)
    }

    /// Evict stale neighbors, returning the evicted keys
    pub async fn sweep(&self) -> Vec<NeighborKey> {
        let now = Instant::now();
        let timeout = self.survival_timeout;
        let mut evicted = Vec::new();

        self.neighbors.write().await.retain(|key, record| {
            let alive = record.is_alive_at(now, timeout);
            if !alive {
                evicted.push(*key);
            }
            alive
        });

        if !evicted.is_empty() {
            tracing::debug!(removed = evicted.len(), "expired neighbor registry entries");
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.neighbors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.neighbors.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const TIMEOUT: Duration = Duration::from_millis(12_000);

    fn key(last_octet: u8, port: u16) -> NeighborKey {
        NeighborKey::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, last_octet)), port)
    }

    #[test]
    fn test_key_display() {
        assert_eq!(key(7, 9001).to_string(), "192.168.1.7:9001");
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let registry = NeighborRegistry::new(TIMEOUT);
        assert!(registry.upsert(key(2, 9001), "host-b").await);
        assert!(!registry.upsert(key(2, 9001), "host-b").await);

        let record = registry.get(&key(2, 9001)).await.unwrap();
        assert_eq!(record.host_name, "host-b");
        assert_eq!(record.tcp_port, 9001);
        assert_eq!(record.key(), key(2, 9001));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_same_address_different_port_are_distinct() {
        let registry = NeighborRegistry::new(TIMEOUT);
        registry.upsert(key(2, 9001), "b").await;
        registry.upsert(key(2, 9002), "b").await;
        assert_eq!(registry.live_neighbors().await.len(), 2);
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = NeighborRegistry::new(TIMEOUT);
        registry.upsert(key(2, 9001), "b").await;
        assert!(registry.remove(&key(2, 9001)).await.is_some());
        assert!(registry.remove(&key(2, 9001)).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_threshold() {
        let registry = NeighborRegistry::new(TIMEOUT);
        registry.upsert(key(2, 9001), "b").await;

        tokio::time::advance(TIMEOUT - Duration::from_millis(1)).await;
        assert_eq!(registry.live_neighbors().await.len(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(registry.live_neighbors().await.is_empty());

        // Stale but not yet evicted
        assert!(registry.get(&key(2, 9001)).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_liveness() {
        let registry = NeighborRegistry::new(TIMEOUT);
        registry.upsert(key(2, 9001), "b").await;

        tokio::time::advance(TIMEOUT / 2).await;
        registry.upsert(key(2, 9001), "b").await;
        tokio::time::advance(TIMEOUT / 2).await;

        assert_eq!(registry.live_neighbors().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_upsert_reports_rediscovery() {
        let registry = NeighborRegistry::new(TIMEOUT);
        registry.upsert(key(2, 9001), "b").await;
        tokio::time::advance(TIMEOUT).await;
        assert!(registry.upsert(key(2, 9001), "b").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_stale() {
        let registry = NeighborRegistry::new(TIMEOUT);
        registry.upsert(key(2, 9001), "b").await;
        tokio::time::advance(TIMEOUT).await;
        registry.upsert(key(3, 9001), "c").await;

        let evicted = registry.sweep().await;
        assert_eq!(evicted, vec![key(2, 9001)]);
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(&key(3, 9001)).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unique_key_for_address() {
        let registry = NeighborRegistry::new(Duration::from_secs(12));
        let addr = key(2, 0).address();
        assert_eq!(registry.unique_key_for(addr).await, None);

        registry.upsert(key(2, 9001), "b").await;
        registry.upsert(key(3, 9001), "c").await;
        assert_eq!(registry.unique_key_for(addr).await, Some(key(2, 9001)));

        // Two live records on one address cannot be told apart
        registry.upsert(key(2, 9002), "b2").await;
        assert_eq!(registry.unique_key_for(addr).await, None);

        // Stale records do not count
        tokio::time::advance(Duration::from_secs(8)).await;
        registry.upsert(key(2, 9002), "b2").await;
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(registry.unique_key_for(addr).await, Some(key(2, 9002)));
    }
}
