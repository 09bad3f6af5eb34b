//! High-level Clipmesh service that coordinates all components

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::clipboard::{self, ChangeTracker, ClipboardProvider, Payload};
use crate::discovery::{HeartbeatEvent, HeartbeatHandle, HeartbeatService, NeighborKey, NeighborRecord, NeighborRegistry};
use crate::protocol::DataPackage;
use crate::sync::{RetryPolicy, SyncEvent, SyncServer, SyncServerHandle, Transport};
use crate::{Config, LocalIdentity, Result};

/// Events emitted by the Clipmesh service
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// A neighbor answered our heartbeat
    NeighborFound(NeighborRecord),
    /// A neighbor went offline or stopped answering
    NeighborLost(NeighborKey),
    /// A package from a neighbor was applied to the local clipboard
    PackageReceived { from: NeighborKey, sender: String, payload: Payload },
    /// A local clipboard change was delivered to these neighbors
    PayloadSent { to_neighbors: Vec<NeighborKey> },
    /// Error occurred
    Error(String),
}

/// The two clipboard-facing operations: fan out local changes, apply received packages
#[derive(Clone)]
pub struct SyncCore {
    identity: LocalIdentity,
    transport: Transport,
    default_image_format: String,
    tracker: ChangeTracker,
}

impl SyncCore {
    pub fn new(identity: LocalIdentity, transport: Transport, default_image_format: String) -> Self {
        Self {
            identity,
            transport,
            default_image_format,
            tracker: ChangeTracker::new(),
        }
    }

    pub fn registry(&self) -> &NeighborRegistry {
        self.transport.registry()
    }

    /// Change tracker the clipboard monitor must share to skip applied packages
    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    /// Build one package from `payload` and send it to every live neighbor.
    ///
    /// Targets are the live neighbors at the moment of the call; sends run
    /// concurrently. Returns the neighbors that accepted the package.
    pub async fn on_local_payload_changed(&self, payload: &Payload) -> Vec<NeighborKey> {
        let neighbors = self.registry().live_neighbors().await;
        if neighbors.is_empty() {
            tracing::debug!("clipboard changed, no live neighbors");
            return Vec::new();
        }

        let package = DataPackage::from_payload(payload, &self.identity.name, &self.default_image_format);
        tracing::info!(
            formats = package.mime_formats.len(),
            neighbors = neighbors.len(),
            "sending clipboard"
        );

        let mut sends = JoinSet::new();
        for neighbor in neighbors {
            let key = neighbor.key();
            let transport = self.transport.clone();
            let mut package = package.clone();
            package.receiver = key.to_string();

            sends.spawn(async move {
                match transport.send_to_neighbor(key, &package).await {
                    Ok(()) => Some(key),
                    Err(e) => {
                        tracing::warn!(neighbor = %key, error = %e, "send to neighbor failed");
                        None
                    }
                }
            });
        }

        let mut delivered = Vec::new();
        while let Some(result) = sends.join_next().await {
            match result {
                Ok(Some(key)) => delivered.push(key),
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "send task failed"),
            }
        }
        delivered.sort();
        delivered
    }

    /// Decode a received package and apply it to `sink`, once per call.
    ///
    /// Duplicate packages are applied again; there is no package id to
    /// deduplicate on. The payload is registered with the tracker before it
    /// is applied so the monitor never mistakes it for a local copy.
    pub fn on_package_received(
        &self,
        package: &DataPackage,
        sink: &dyn ClipboardProvider,
    ) -> Result<Payload> {
        let payload = package.to_payload()?;
        for format in &package.mime_formats {
            tracing::debug!(sender = %package.sender, "received format {}", format);
        }

        self.tracker.expect_incoming(&payload);
        if let Err(e) = sink.apply_received_payload(&payload) {
            self.tracker.cancel_incoming(&payload);
            return Err(e);
        }

        // The provider may store a normalized form; remember what it reads back
        if let Ok(Some(applied)) = sink.current_payload() {
            if applied != payload {
                self.tracker.cancel_incoming(&payload);
            }
            self.tracker.mark_seen(&applied);
        }
        Ok(payload)
    }
}

/// Main Clipmesh service
pub struct ClipMeshService {
    config: Config,
    identity: LocalIdentity,
    registry: NeighborRegistry,
    server: Option<SyncServerHandle>,
    heartbeat: Option<HeartbeatHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl ClipMeshService {
    /// Create a new service named after this host
    pub fn new(config: Config) -> Self {
        Self::with_identity(LocalIdentity::from_hostname(), config)
    }

    /// Create with an explicit identity
    pub fn with_identity(identity: LocalIdentity, config: Config) -> Self {
        let registry = NeighborRegistry::new(config.survival_timeout());
        Self {
            config,
            identity,
            registry,
            server: None,
            heartbeat: None,
            tasks: Vec::new(),
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &NeighborRegistry {
        &self.registry
    }

    /// TCP port actually bound, once started
    pub fn package_port(&self) -> Option<u16> {
        self.server.as_ref().map(|s| s.port())
    }

    /// Bind both sockets, start every background task, and return the event channel.
    ///
    /// Bind failures are returned; nothing is left running in that case.
    pub async fn start(
        &mut self,
        provider: Arc<dyn ClipboardProvider>,
    ) -> Result<mpsc::Receiver<ServiceEvent>> {
        let (tx, rx) = mpsc::channel(64);

        // Start package server
        let server = SyncServer::bind(
            self.config.package_port,
            self.registry.clone(),
            RetryPolicy::from_config(&self.config),
        )
        .await?;
        let port = server.port();

        // Start heartbeat
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(32);
        let heartbeat = HeartbeatService::bind(&self.config, self.registry.clone(), port)?
            .with_events(heartbeat_tx);

        let (mut server_rx, server_handle) = server.start();
        let core = SyncCore::new(
            self.identity.clone(),
            server_handle.transport().clone(),
            self.config.default_image_format.clone(),
        );
        self.server = Some(server_handle);
        self.heartbeat = Some(heartbeat.start());

        // Forward registry changes
        let tx_discovery = tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = heartbeat_rx.recv().await {
                let service_event = match event {
                    HeartbeatEvent::NeighborFound(record) => ServiceEvent::NeighborFound(record),
                    HeartbeatEvent::NeighborOffline(key) | HeartbeatEvent::NeighborExpired(key) => {
                        ServiceEvent::NeighborLost(key)
                    }
                };
                if tx_discovery.send(service_event).await.is_err() {
                    break;
                }
            }
        }));

        // Apply received packages
        let tx_server = tx.clone();
        let sink = provider.clone();
        let receive_core = core.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = server_rx.recv().await {
                let (from, package) = match event {
                    SyncEvent::PackageReceived { from, package, .. } => (from, package),
                    other => {
                        tracing::trace!(?other, "transport event");
                        continue;
                    }
                };

                let service_event = match receive_core.on_package_received(&package, sink.as_ref()) {
                    Ok(payload) => ServiceEvent::PackageReceived {
                        from,
                        sender: package.sender.clone(),
                        payload,
                    },
                    Err(e) => {
                        tracing::warn!(neighbor = %from, error = %e, "failed to apply package");
                        ServiceEvent::Error(format!("package from {}: {}", from, e))
                    }
                };
                let _ = tx_server.send(service_event).await;
            }
        }));

        // Fan out local clipboard changes
        let tx_clipboard = tx.clone();
        let poll_interval = self.config.clipboard_poll_interval();
        self.tasks.push(tokio::spawn(async move {
            let tracker = core.tracker().clone();
            let (mut changes, monitor) = clipboard::start_monitor(provider, tracker, poll_interval);

            while let Some(payload) = changes.recv().await {
                let sent_to = core.on_local_payload_changed(&payload).await;
                if !sent_to.is_empty() {
                    let _ = tx_clipboard.send(ServiceEvent::PayloadSent { to_neighbors: sent_to }).await;
                }
            }
            monitor.abort();
        }));

        tracing::info!(
            name = %self.identity.name,
            package_port = port,
            heartbeat_port = self.config.heartbeat_port,
            "clipmesh service started"
        );
        Ok(rx)
    }

    /// Announce departure and stop everything
    pub async fn shutdown(mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.shutdown().await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
        tracing::info!("clipmesh service stopped");
    }
}
