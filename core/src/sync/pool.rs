//! Connection pools keyed by neighbor identity and role

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::discovery::NeighborKey;
use crate::sync::connection::{Connection, Role};

/// At most one connection per `(key, role)`; a newcomer replaces and closes
/// the incumbent.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPool {
    entries: Arc<Mutex<HashMap<(NeighborKey, Role), Arc<Connection>>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn`, tearing down any previous connection with the same
    /// key and role before the new one is inserted. Returns the old one.
    pub async fn replace(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let old = {
            let mut entries = self.entries.lock().await;
            let old = entries.remove(&(conn.key(), conn.role()));
            if let Some(old) = &old {
                tracing::warn!(
                    neighbor = %old.key(),
                    role = %old.role(),
                    "connection already exists, closing the old one"
                );
                old.abort();
            }
            entries.insert((conn.key(), conn.role()), conn);
            old
        };

        if let Some(old) = &old {
            old.shutdown_writer().await;
        }
        old
    }

    /// First open connection for `key`, preferring outbound over inbound.
    ///
    /// Dead entries found along the way are dropped.
    pub async fn usable(&self, key: &NeighborKey) -> Option<Arc<Connection>> {
        let mut entries = self.entries.lock().await;

        for role in [Role::Outbound, Role::Inbound] {
            let Some(conn) = entries.get(&(*key, role)) else {
                continue;
            };
            if conn.is_open() {
                return Some(conn.clone());
            }

            tracing::warn!(neighbor = %key, %role, "dropping dead connection");
            if let Some(dead) = entries.remove(&(*key, role)) {
                dead.abort();
            }
        }

        None
    }

    pub async fn get(&self, key: &NeighborKey, role: Role) -> Option<Arc<Connection>> {
        self.entries.lock().await.get(&(*key, role)).cloned()
    }

    /// Remove `conn` only if it is still the registered entry for its key
    /// and role. A newer connection that replaced it is left alone.
    pub async fn remove_if_current(&self, conn: &Connection) -> bool {
        let mut entries = self.entries.lock().await;
        let slot = (conn.key(), conn.role());
        match entries.get(&slot) {
            Some(current) if current.id() == conn.id() => {
                entries.remove(&slot);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Close and forget every connection
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.entries.lock().await.drain().map(|(_, c)| c).collect();
        for conn in drained {
            conn.close().await;
        }
    }
}
