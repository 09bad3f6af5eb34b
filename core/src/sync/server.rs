//! TCP server accepting package connections from neighbors

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::discovery::{NeighborKey, NeighborRegistry};
use crate::protocol::constants::{ACCEPT_ERROR_BACKOFF_MS, MAX_ACCEPT_ERROR_BACKOFF_MS};
use crate::sync::connection::Role;
use crate::sync::transport::{RetryPolicy, SyncEvent, Transport};
use crate::{Error, Result};

/// TCP package server
pub struct SyncServer {
    listener: TcpListener,
    port: u16,
    transport: Transport,
    events: mpsc::Receiver<SyncEvent>,
}

impl SyncServer {
    /// Bind to a port and create the server
    pub async fn bind(port: u16, registry: NeighborRegistry, retry: RetryPolicy) -> Result<Self> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        Self::bind_addr(addr, registry, retry).await
    }

    /// Bind to a specific address
    pub async fn bind_addr(
        addr: SocketAddr,
        registry: NeighborRegistry,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Network(format!("failed to bind {}: {}", addr, e)))?;

        let actual_port = listener.local_addr()
            .map_err(|e| Error::Network(e.to_string()))?
            .port();

        tracing::info!("package server listening on port {}", actual_port);

        let (tx, rx) = mpsc::channel(64);
        Ok(Self {
            listener,
            port: actual_port,
            transport: Transport::new(registry, retry, tx),
            events: rx,
        })
    }

    /// Get the port we're listening on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start accepting connections
    pub fn start(self) -> (mpsc::Receiver<SyncEvent>, SyncServerHandle) {
        let transport = self.transport.clone();
        let listener = self.listener;

        let task = tokio::spawn({
            let transport = transport.clone();
            async move {
                let mut failures = 0u32;
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            failures = 0;
                            let key = inbound_key(transport.registry(), addr).await;
                            tracing::info!(peer = %addr, neighbor = %key, "client connected");
                            transport.register(stream, key, Role::Inbound).await;
                        }
                        Err(e) => {
                            failures = failures.saturating_add(1);
                            let delay = accept_error_delay(failures);
                            tracing::error!(error = %e, ?delay, "accept error");
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        });

        (
            self.events,
            SyncServerHandle {
                port: self.port,
                transport,
                task,
            },
        )
    }
}

/// Pool key for an accepted connection.
///
/// A peer whose address matches exactly one live neighbor is filed under that
/// neighbor's key, so replies can reuse the connection. Otherwise the peer's
/// socket address is used.
async fn inbound_key(registry: &NeighborRegistry, peer: SocketAddr) -> NeighborKey {
    match registry.unique_key_for(peer.ip()).await {
        Some(key) => key,
        None => NeighborKey::from(peer),
    }
}

/// Pause after the `failures`-th consecutive accept error
fn accept_error_delay(failures: u32) -> Duration {
    let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
    Duration::from_millis(ACCEPT_ERROR_BACKOFF_MS)
        .saturating_mul(factor)
        .min(Duration::from_millis(MAX_ACCEPT_ERROR_BACKOFF_MS))
}

/// Handle to the running package server
pub struct SyncServerHandle {
    port: u16,
    transport: Transport,
    task: tokio::task::JoinHandle<()>,
}

impl SyncServerHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Transport for sending packages through this server's pools
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Stop accepting and close every connection
    pub async fn shutdown(self) {
        self.task.abort();
        self.transport.close_all().await;
    }
}
