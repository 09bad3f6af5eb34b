//! A single TCP connection to a neighbor

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::discovery::NeighborKey;
use crate::sync::framing::{decode_package, write_frame, PackageDecode};
use crate::sync::pool::ConnectionPool;
use crate::sync::transport::SyncEvent;
use crate::{Error, Result};

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// We dialed the neighbor
    Outbound,
    /// The neighbor dialed us
    Inbound,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Outbound => f.write_str("outbound"),
            Role::Inbound => f.write_str("inbound"),
        }
    }
}

/// Live connection registered in the pool under `key` and `role`
pub struct Connection {
    id: u64,
    key: NeighborKey,
    role: Role,
    writer: Mutex<OwnedWriteHalf>,
    open: AtomicBool,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(id: u64, key: NeighborKey, role: Role, writer: OwnedWriteHalf) -> Self {
        Self {
            id,
            key,
            role,
            writer: Mutex::new(writer),
            open: AtomicBool::new(true),
            reader: std::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> NeighborKey {
        self.key
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// False once the peer hung up, a write failed, or the connection was closed
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Write one framed package, giving up after `limit`.
    ///
    /// Any failure, including the timeout, leaves the connection marked closed.
    pub async fn send(&self, frame: &[u8], limit: Duration) -> Result<()> {
        let write = async {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, frame).await
        };

        match tokio::time::timeout(limit, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.mark_closed();
                Err(e)
            }
            Err(_) => {
                tracing::warn!(neighbor = %self.key, role = %self.role, timeout = ?limit, "write stalled");
                self.mark_closed();
                Err(Error::SendTimeout {
                    key: self.key,
                    timeout: limit,
                })
            }
        }
    }

    pub(crate) fn attach_reader(&self, handle: JoinHandle<()>) {
        if let Ok(mut reader) = self.reader.lock() {
            if self.is_open() {
                *reader = Some(handle);
            } else {
                handle.abort();
            }
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Mark closed and stop the read loop
    pub(crate) fn abort(&self) {
        self.mark_closed();
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }

    /// Send FIN to the peer
    pub(crate) async fn shutdown_writer(&self) {
        if let Err(e) = self.writer.lock().await.shutdown().await {
            tracing::trace!(neighbor = %self.key, error = %e, "shutdown on closed connection");
        }
    }

    /// Tear the connection down
    pub async fn close(&self) {
        self.abort();
        self.shutdown_writer().await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("role", &self.role)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Read frames until the peer hangs up, forwarding each package in order
pub(crate) async fn read_loop(
    mut reader: OwnedReadHalf,
    conn: Arc<Connection>,
    pool: ConnectionPool,
    events: mpsc::Sender<SyncEvent>,
) {
    let key = conn.key();
    let role = conn.role();
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 16 * 1024];

    'read: loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                tracing::debug!(neighbor = %key, %role, "connection closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(neighbor = %key, %role, error = %e, "connection read failed");
                break;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        loop {
            match decode_package(&mut buf) {
                Ok(PackageDecode::Package(package)) => {
                    tracing::debug!(
                        neighbor = %key,
                        formats = package.mime_formats.len(),
                        sender = %package.sender,
                        "package received"
                    );
                    let event = SyncEvent::PackageReceived { from: key, role, package };
                    if events.send(event).await.is_err() {
                        break 'read;
                    }
                }
                Ok(PackageDecode::NeedMoreBytes) => break,
                Ok(PackageDecode::Malformed(e)) => {
                    tracing::warn!(neighbor = %key, error = %e, "discarding malformed package");
                }
                Err(e) => {
                    tracing::warn!(neighbor = %key, error = %e, "unrecoverable framing error, closing");
                    break 'read;
                }
            }
        }
    }

    conn.mark_closed();
    conn.shutdown_writer().await;
    if pool.remove_if_current(&conn).await {
        tracing::info!(neighbor = %key, %role, "connection removed");
        let _ = events.try_send(SyncEvent::Disconnected { key, role });
    }
}
