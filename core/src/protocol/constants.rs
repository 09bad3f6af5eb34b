//! Centralized protocol constants
//!
//! All protocol-level constants and configuration defaults live here so the
//! wire format and the config layer agree on them.

use std::net::Ipv4Addr;

/// Magic prefix of every heartbeat datagram ("csf")
pub const HEARTBEAT_MAGIC: [u8; 3] = [0x63, 0x73, 0x66];

/// Exact size of a heartbeat datagram: magic + command + port
pub const HEARTBEAT_FRAME_LEN: usize = HEARTBEAT_MAGIC.len() + 1 + 4;

/// Default UDP port for heartbeats
pub const DEFAULT_HEARTBEAT_PORT: u16 = 41688;

/// Default TCP port for package exchange
pub const DEFAULT_PACKAGE_PORT: u16 = 41690;

/// Default multicast group joined by the heartbeat socket
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 99, 115, 102);

/// Default heartbeat broadcast interval in milliseconds
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 4000;

/// Default neighbor survival timeout in milliseconds (3 heartbeats)
pub const DEFAULT_SURVIVAL_TIMEOUT_MS: u64 = 3 * DEFAULT_HEARTBEAT_INTERVAL_MS;

/// Image format used when an attachment carries no format of its own
pub const DEFAULT_IMAGE_FORMAT: &str = "png";

/// Default timeout for a single TCP connect attempt in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

/// Default number of connect attempts per send
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;

/// Delay before the second connect attempt; doubles after each failure
pub const DEFAULT_CONNECT_BACKOFF_MS: u64 = 250;

/// Upper bound on the delay between connect attempts
pub const MAX_CONNECT_BACKOFF_MS: u64 = 5000;

/// Pause after a failed accept; doubles while failures continue
pub const ACCEPT_ERROR_BACKOFF_MS: u64 = 10;

/// Upper bound on the pause between failed accepts
pub const MAX_ACCEPT_ERROR_BACKOFF_MS: u64 = 1000;

/// Default limit on writing one package to a neighbor, in milliseconds
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5000;

/// Maximum package frame size (10 MB)
pub const MAX_PACKAGE_SIZE: usize = 10 * 1024 * 1024;

/// Clipboard polling interval in milliseconds
pub const CLIPBOARD_POLL_INTERVAL_MS: u64 = 500;

/// Multicast TTL for heartbeats; keeps them inside the local segment
pub const MULTICAST_TTL: u32 = 1;
