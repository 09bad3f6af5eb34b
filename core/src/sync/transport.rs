//! Package routing to neighbors over pooled TCP connections

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::discovery::{NeighborKey, NeighborRegistry};
use crate::protocol::constants::MAX_CONNECT_BACKOFF_MS;
use crate::protocol::DataPackage;
use crate::sync::connection::{read_loop, Connection, Role};
use crate::sync::framing::encode_package;
use crate::sync::pool::ConnectionPool;
use crate::{Config, Error, Result};

/// Event from the transport layer
#[derive(Debug)]
pub enum SyncEvent {
    /// A complete package arrived on a connection
    PackageReceived {
        from: NeighborKey,
        role: Role,
        package: DataPackage,
    },
    /// A connection was registered in the pool
    Connected { key: NeighborKey, role: Role },
    /// A connection closed and left the pool
    Disconnected { key: NeighborKey, role: Role },
}

/// Bounded connect retries with exponential backoff, plus the write limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub send_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            attempts: config.connect_attempts.max(1),
            connect_timeout: config.connect_timeout(),
            initial_backoff: config.connect_backoff(),
            max_backoff: Duration::from_millis(MAX_CONNECT_BACKOFF_MS),
            send_timeout: config.send_timeout(),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

struct TransportInner {
    registry: NeighborRegistry,
    pool: ConnectionPool,
    retry: RetryPolicy,
    events: mpsc::Sender<SyncEvent>,
    next_id: AtomicU64,
}

/// Sends packages to neighbors and owns both connection pools
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    pub fn new(
        registry: NeighborRegistry,
        retry: RetryPolicy,
        events: mpsc::Sender<SyncEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                registry,
                pool: ConnectionPool::new(),
                retry,
                events,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn registry(&self) -> &NeighborRegistry {
        &self.inner.registry
    }

    /// Send one package to a neighbor.
    ///
    /// Reuses an open outbound or inbound connection when there is one;
    /// otherwise dials the neighbor's registered package port. A write that
    /// stalls past the send timeout drops the connection and fails this send
    /// without redialing.
    pub async fn send_to_neighbor(&self, key: NeighborKey, package: &DataPackage) -> Result<()> {
        let frame = encode_package(package)?;
        let limit = self.inner.retry.send_timeout;

        if let Some(conn) = self.inner.pool.usable(&key).await {
            tracing::debug!(neighbor = %key, role = %conn.role(), "reusing connection");
            match conn.send(&frame, limit).await {
                Ok(()) => return Ok(()),
                Err(e @ Error::SendTimeout { .. }) => {
                    self.discard(&conn).await;
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(neighbor = %key, role = %conn.role(), error = %e, "send failed, redialing");
                    self.discard(&conn).await;
                }
            }
        }

        let conn = self.dial(key).await?;
        if let Err(e) = conn.send(&frame, limit).await {
            self.discard(&conn).await;
            return Err(e);
        }
        Ok(())
    }

    /// Close a failed connection and drop it from the pool if still registered
    async fn discard(&self, conn: &Connection) {
        conn.close().await;
        self.inner.pool.remove_if_current(conn).await;
    }

    /// Connect to a neighbor, retrying with backoff
    async fn dial(&self, key: NeighborKey) -> Result<Arc<Connection>> {
        let record = self
            .inner
            .registry
            .get(&key)
            .await
            .ok_or(Error::UnknownNeighbor(key))?;
        let addr = record.key().socket_addr();
        let retry = self.inner.retry;

        for attempt in 1..=retry.attempts {
            match tokio::time::timeout(retry.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    tracing::info!(neighbor = %key, attempt, "connected");
                    return Ok(self.register(stream, key, Role::Outbound).await);
                }
                Ok(Err(e)) => {
                    tracing::warn!(neighbor = %key, attempt, error = %e, "connect failed");
                }
                Err(_) => {
                    tracing::warn!(neighbor = %key, attempt, timeout = ?retry.connect_timeout, "connect timed out");
                }
            }

            if attempt < retry.attempts {
                tokio::time::sleep(retry.backoff(attempt)).await;
            }
        }

        tracing::error!(neighbor = %key, attempts = retry.attempts, "giving up on neighbor for this send");
        Err(Error::ConnectFailed {
            key,
            attempts: retry.attempts,
        })
    }

    /// Put a fresh connection into the pool and start reading from it
    pub(crate) async fn register(&self, stream: TcpStream, key: NeighborKey, role: Role) -> Arc<Connection> {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!(neighbor = %key, error = %e, "TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, key, role, writer));

        self.inner.pool.replace(conn.clone()).await;
        let _ = self.inner.events.try_send(SyncEvent::Connected { key, role });

        let handle = tokio::spawn(read_loop(
            reader,
            conn.clone(),
            self.inner.pool.clone(),
            self.inner.events.clone(),
        ));
        conn.attach_reader(handle);
        conn
    }

    /// Close every pooled connection
    pub async fn close_all(&self) {
        self.inner.pool.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::Payload;
    use crate::sync::framing::decode_package;
    use crate::sync::framing::PackageDecode;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            connect_timeout: Duration::from_millis(500),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            send_timeout: Duration::from_millis(200),
        }
    }

    fn transport() -> (Transport, mpsc::Receiver<SyncEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let registry = NeighborRegistry::new(Duration::from_secs(12));
        (Transport::new(registry, fast_retry(), tx), rx)
    }

    async fn read_package(stream: &mut TcpStream, buf: &mut Vec<u8>) -> DataPackage {
        let mut chunk = [0u8; 1024];
        loop {
            if let PackageDecode::Package(p) = decode_package(buf).unwrap() {
                return p;
            }
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "peer closed before a full package arrived");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = fast_retry();
        assert_eq!(retry.backoff(1), Duration::from_millis(10));
        assert_eq!(retry.backoff(2), Duration::from_millis(20));
        assert_eq!(retry.backoff(3), Duration::from_millis(40));
        assert_eq!(retry.backoff(4), Duration::from_millis(40));
        assert_eq!(retry.backoff(64), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_unknown_neighbor() {
        let (transport, _rx) = transport();
        let key = NeighborKey::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9);
        let result = transport.send_to_neighbor(key, &DataPackage::default()).await;
        assert!(matches!(result, Err(Error::UnknownNeighbor(k)) if k == key));
    }

    #[tokio::test]
    async fn test_dial_gives_up_after_attempts() {
        // Grab a free port and release it so nothing is listening there
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (transport, _rx) = transport();
        let key = NeighborKey::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        transport.registry().upsert(key, "nobody").await;

        let result = transport.send_to_neighbor(key, &DataPackage::default()).await;
        assert!(matches!(result, Err(Error::ConnectFailed { attempts: 3, .. })));
        assert!(transport.pool().is_empty().await);
    }

    #[tokio::test]
    async fn test_dials_once_then_reuses_outbound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (transport, _rx) = transport();
        let key = NeighborKey::from(addr);
        transport.registry().upsert(key, "peer").await;

        let first = DataPackage::from_payload(&Payload::text("one"), "a", "png");
        let second = DataPackage::from_payload(&Payload::text("two"), "a", "png");

        transport.send_to_neighbor(key, &first).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        transport.send_to_neighbor(key, &second).await.unwrap();

        let mut buf = Vec::new();
        assert_eq!(read_package(&mut peer, &mut buf).await, first);
        assert_eq!(read_package(&mut peer, &mut buf).await, second);

        let conn = transport.pool().get(&key, Role::Outbound).await.unwrap();
        assert!(conn.is_open());
        assert_eq!(transport.pool().len().await, 1);
    }

    #[tokio::test]
    async fn test_outbound_connection_receives_packages() {
        use tokio::io::AsyncWriteExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (transport, mut rx) = transport();
        let key = NeighborKey::from(addr);
        transport.registry().upsert(key, "peer").await;

        transport.send_to_neighbor(key, &DataPackage::default()).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        let reply = DataPackage::from_payload(&Payload::text("reply"), "b", "png");
        peer.write_all(&encode_package(&reply).unwrap()).await.unwrap();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let SyncEvent::PackageReceived { from, role, package } = event {
                assert_eq!(from, key);
                assert_eq!(role, Role::Outbound);
                assert_eq!(package, reply);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_closed_connection_is_redialed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (transport, mut rx) = transport();
        let key = NeighborKey::from(addr);
        transport.registry().upsert(key, "peer").await;

        transport.send_to_neighbor(key, &DataPackage::default()).await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);

        // Wait for the read loop to notice the hangup
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, SyncEvent::Disconnected { .. }) {
                break;
            }
        }
        assert!(transport.pool().is_empty().await);

        let package = DataPackage::from_payload(&Payload::text("again"), "a", "png");
        transport.send_to_neighbor(key, &package).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        assert_eq!(read_package(&mut peer, &mut Vec::new()).await, package);
    }

    #[tokio::test]
    async fn test_stalled_reader_times_out_and_is_dropped() {
        let stalled = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let healthy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (transport, _rx) = transport();
        let stalled_key = NeighborKey::from(stalled.local_addr().unwrap());
        let healthy_key = NeighborKey::from(healthy.local_addr().unwrap());
        transport.registry().upsert(stalled_key, "frozen").await;
        transport.registry().upsert(healthy_key, "peer").await;

        // 6 MiB of text, 8 MiB once base64 encoded; the peer never reads, so
        // the socket buffers fill after a frame or two
        let big = DataPackage::from_payload(&Payload::text("x".repeat(6 * 1024 * 1024)), "a", "png");
        let mut stalled_peer = None;
        let mut outcome = Ok(());
        for _ in 0..8 {
            outcome = tokio::time::timeout(
                Duration::from_secs(5),
                transport.send_to_neighbor(stalled_key, &big),
            )
            .await
            .expect("send was not bounded by the send timeout");
            if stalled_peer.is_none() {
                stalled_peer = Some(stalled.accept().await.unwrap());
            }
            if outcome.is_err() {
                break;
            }
        }
        assert!(matches!(outcome, Err(Error::SendTimeout { key, .. }) if key == stalled_key));
        assert!(transport.pool().get(&stalled_key, Role::Outbound).await.is_none());

        // Other neighbors are unaffected
        let small = DataPackage::from_payload(&Payload::text("still here"), "a", "png");
        transport.send_to_neighbor(healthy_key, &small).await.unwrap();
        let (mut peer, _) = healthy.accept().await.unwrap();
        assert_eq!(read_package(&mut peer, &mut Vec::new()).await, small);
    }
}
