//! UDP multicast heartbeat service
//!
//! Periodically multicasts `Heartbeat` frames, answers other hosts'
//! heartbeats with a `Response` carrying our package port, and feeds
//! responses into the neighbor registry.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::discovery::registry::{NeighborKey, NeighborRecord, NeighborRegistry};
use crate::protocol::constants::{HEARTBEAT_FRAME_LEN, MULTICAST_TTL};
use crate::protocol::{decode_heartbeat, encode_heartbeat, HeartbeatCommand, InvalidFrame};
use crate::{Config, Error, Result};

/// Registry changes observed by the heartbeat service
#[derive(Debug, Clone)]
pub enum HeartbeatEvent {
    /// A neighbor answered for the first time, or again after going stale
    NeighborFound(NeighborRecord),
    /// A neighbor announced it is going offline
    NeighborOffline(NeighborKey),
    /// A neighbor stopped answering and was evicted
    NeighborExpired(NeighborKey),
}

/// What a single datagram did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Not a valid frame; discarded
    Invalid(InvalidFrame),
    /// Sent by this host; discarded
    LocalEcho,
    /// A heartbeat that must be answered with this frame
    Reply([u8; HEARTBEAT_FRAME_LEN]),
    /// A response refreshed the registry
    Refreshed { record: NeighborRecord, is_new: bool },
    /// An offline notice removed the neighbor (if it was known)
    Removed(NeighborKey),
    /// Well-formed frame with nothing to do
    Ignored(HeartbeatCommand),
}

/// Per-datagram state machine, independent of the socket
#[derive(Debug, Clone)]
pub struct HeartbeatHandler {
    registry: NeighborRegistry,
    local_addrs: Arc<RwLock<Vec<IpAddr>>>,
    package_port: u16,
}

impl HeartbeatHandler {
    pub fn new(registry: NeighborRegistry, local_addrs: Vec<IpAddr>, package_port: u16) -> Self {
        Self {
            registry,
            local_addrs: Arc::new(RwLock::new(local_addrs)),
            package_port,
        }
    }

    pub fn registry(&self) -> &NeighborRegistry {
        &self.registry
    }

    /// Whether `addr` belongs to one of this host's interfaces
    pub fn is_local(&self, addr: IpAddr) -> bool {
        self.local_addrs
            .read()
            .map(|addrs| addrs.contains(&addr))
            .unwrap_or(false)
    }

    /// Replace the set of addresses treated as this host
    pub fn set_local_addrs(&self, addrs: Vec<IpAddr>) {
        if let Ok(mut local) = self.local_addrs.write() {
            if *local != addrs {
                tracing::debug!(?addrs, "local interface addresses changed");
                *local = addrs;
            }
        }
    }

    /// The `Response` frame this host answers heartbeats with
    pub fn response_frame(&self) -> [u8; HEARTBEAT_FRAME_LEN] {
        encode_heartbeat(HeartbeatCommand::Response, u32::from(self.package_port))
    }

    /// Apply one received datagram
    pub async fn handle(&self, data: &[u8], sender: SocketAddr) -> HeartbeatOutcome {
        let frame = match decode_heartbeat(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(%sender, error = %e, "invalid heartbeat datagram");
                tracing::trace!(%sender, bytes = %hex::encode(data), "invalid heartbeat content");
                return HeartbeatOutcome::Invalid(e);
            }
        };

        if self.is_local(sender.ip()) {
            tracing::trace!(%sender, command = %frame.command, "ignoring local heartbeat");
            return HeartbeatOutcome::LocalEcho;
        }

        match frame.command {
            HeartbeatCommand::Heartbeat => {
                tracing::trace!(%sender, "heartbeat");
                HeartbeatOutcome::Reply(self.response_frame())
            }
            HeartbeatCommand::Response => {
                let Some(key) = neighbor_key(sender.ip(), frame.port) else {
                    tracing::warn!(%sender, port = frame.port, "response carries an out-of-range port");
                    return HeartbeatOutcome::Ignored(frame.command);
                };

                let host_name = sender.ip().to_string();
                let is_new = self.registry.upsert(key, &host_name).await;
                if is_new {
                    tracing::info!(neighbor = %key, "neighbor discovered");
                } else {
                    tracing::trace!(neighbor = %key, "neighbor refreshed");
                }

                match self.registry.get(&key).await {
                    Some(record) => HeartbeatOutcome::Refreshed { record, is_new },
                    None => HeartbeatOutcome::Ignored(frame.command),
                }
            }
            HeartbeatCommand::Offline => {
                let Some(key) = neighbor_key(sender.ip(), frame.port) else {
                    tracing::warn!(%sender, port = frame.port, "offline notice carries an out-of-range port");
                    return HeartbeatOutcome::Ignored(frame.command);
                };

                if self.registry.remove(&key).await.is_some() {
                    tracing::info!(neighbor = %key, "neighbor went offline");
                }
                HeartbeatOutcome::Removed(key)
            }
            HeartbeatCommand::BroadcastPort => {
                tracing::warn!(%sender, port = frame.port, "unexpected BroadcastPort frame");
                HeartbeatOutcome::Ignored(frame.command)
            }
        }
    }
}

fn neighbor_key(address: IpAddr, port: u32) -> Option<NeighborKey> {
    match u16::try_from(port) {
        Ok(port) if port != 0 => Some(NeighborKey::new(address, port)),
        _ => None,
    }
}

/// Owns the heartbeat socket and drives the periodic send and receive loop
pub struct HeartbeatService {
    socket: UdpSocket,
    handler: HeartbeatHandler,
    group: SocketAddr,
    heartbeat_port: u16,
    interval: Duration,
    events: Option<mpsc::Sender<HeartbeatEvent>>,
    local_addr_source: Option<fn() -> Vec<IpAddr>>,
}

impl HeartbeatService {
    /// Bind the heartbeat port and join the configured multicast group
    pub fn bind(config: &Config, registry: NeighborRegistry, package_port: u16) -> Result<Self> {
        let socket = make_multicast_socket(config.heartbeat_port, config.multicast_group)?;
        let socket = UdpSocket::from_std(socket)
            .map_err(|e| Error::Discovery(format!("failed to register heartbeat socket: {}", e)))?;

        let local_addrs = crate::discovery::local_addresses();
        tracing::debug!(?local_addrs, "local interface addresses");

        tracing::info!(
            port = config.heartbeat_port,
            group = %config.multicast_group,
            "heartbeat socket bound"
        );

        Ok(Self::from_socket(
            socket,
            HeartbeatHandler::new(registry, local_addrs, package_port),
            SocketAddr::V4(SocketAddrV4::new(config.multicast_group, config.heartbeat_port)),
            config.heartbeat_port,
            config.heartbeat_interval(),
        )
        .with_local_addr_source(crate::discovery::local_addresses))
    }

    /// Build a service around an already bound socket
    pub fn from_socket(
        socket: UdpSocket,
        handler: HeartbeatHandler,
        group: SocketAddr,
        heartbeat_port: u16,
        interval: Duration,
    ) -> Self {
        Self {
            socket,
            handler,
            group,
            heartbeat_port,
            interval,
            events: None,
            local_addr_source: None,
        }
    }

    /// Report registry changes on `events`
    pub fn with_events(mut self, events: mpsc::Sender<HeartbeatEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Re-read this host's addresses from `source` on every tick
    pub fn with_local_addr_source(mut self, source: fn() -> Vec<IpAddr>) -> Self {
        self.local_addr_source = Some(source);
        self
    }

    /// Spawn the heartbeat loop
    pub fn start(self) -> HeartbeatHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        HeartbeatHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = [0u8; 512];

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.refresh_local_addrs();
                    self.send_frame(HeartbeatCommand::Heartbeat, self.group).await;
                    for key in self.handler.registry().sweep().await {
                        tracing::info!(neighbor = %key, "neighbor expired");
                        self.emit(HeartbeatEvent::NeighborExpired(key));
                    }
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, sender)) => self.on_datagram(&buf[..len], sender).await,
                    Err(e) => tracing::warn!(error = %e, "heartbeat recv_from failed"),
                },
            }
        }

        // Best effort, the socket closes right after
        self.send_frame(HeartbeatCommand::Offline, self.group).await;
        tracing::info!("heartbeat service stopped");
    }

    fn refresh_local_addrs(&self) {
        let Some(source) = self.local_addr_source else {
            return;
        };
        let addrs = source();
        // An empty list means enumeration failed; keep what we had
        if !addrs.is_empty() {
            self.handler.set_local_addrs(addrs);
        }
    }

    async fn on_datagram(&self, data: &[u8], sender: SocketAddr) {
        match self.handler.handle(data, sender).await {
            HeartbeatOutcome::Reply(frame) => {
                let dest = SocketAddr::new(sender.ip(), self.heartbeat_port);
                if let Err(e) = self.socket.send_to(&frame, dest).await {
                    tracing::warn!(%dest, error = %e, "heartbeat response failed");
                }
            }
            HeartbeatOutcome::Refreshed { record, is_new: true } => {
                self.emit(HeartbeatEvent::NeighborFound(record));
            }
            HeartbeatOutcome::Removed(key) => {
                self.emit(HeartbeatEvent::NeighborOffline(key));
            }
            _ => {}
        }
    }

    async fn send_frame(&self, command: HeartbeatCommand, dest: SocketAddr) {
        let frame = encode_heartbeat(command, u32::from(self.handler.package_port));
        match self.socket.send_to(&frame, dest).await {
            Ok(_) => tracing::trace!(%dest, %command, "heartbeat sent"),
            Err(e) => tracing::warn!(%dest, %command, error = %e, "heartbeat send failed"),
        }
    }

    fn emit(&self, event: HeartbeatEvent) {
        if let Some(events) = &self.events {
            // Never stall the loop on a slow consumer
            if events.try_send(event).is_err() {
                tracing::debug!("heartbeat event dropped");
            }
        }
    }
}

/// Handle to the running heartbeat loop
pub struct HeartbeatHandle {
    shutdown: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Broadcast `Offline` and stop
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "heartbeat task ended abnormally");
        }
    }

    /// Stop immediately without announcing departure
    pub fn abort(self) {
        self.task.abort();
    }
}

/// Create a UDP socket bound to `port` and joined to `group`
fn make_multicast_socket(port: u16, group: Ipv4Addr) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::Discovery(format!("socket(): {}", e)))?;

    socket.set_reuse_address(true)
        .map_err(|e| Error::Discovery(format!("SO_REUSEADDR: {}", e)))?;
    socket.set_nonblocking(true)
        .map_err(|e| Error::Discovery(format!("set_nonblocking: {}", e)))?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into())
        .map_err(|e| Error::Discovery(format!("failed to bind heartbeat port {}: {}", port, e)))?;

    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| Error::Discovery(format!("failed to join {}: {}", group, e)))?;
    // Loopback is also filtered by address; this only saves the round trip
    socket.set_multicast_loop_v4(false)
        .map_err(|e| Error::Discovery(format!("IP_MULTICAST_LOOP: {}", e)))?;
    socket.set_multicast_ttl_v4(MULTICAST_TTL)
        .map_err(|e| Error::Discovery(format!("IP_MULTICAST_TTL: {}", e)))?;

    Ok(socket.into())
}
