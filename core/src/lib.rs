//! Clipmesh Core - serverless clipboard sharing on a local network
//!
//! Hosts find each other with a UDP multicast heartbeat, keep a registry of
//! live neighbors, and exchange clipboard packages over length-prefixed TCP
//! connections that either side may have opened.

pub mod clipboard;
pub mod discovery;
pub mod protocol;
pub mod service;
pub mod sync;

mod error;

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use error::{Error, Result};

use protocol::constants;

/// Local host identity stamped on outgoing packages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub name: String,
}

impl LocalIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Identity named after this machine's host name
    pub fn from_hostname() -> Self {
        let name = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "clipmesh".to_string());
        Self { name }
    }
}

/// Configuration for the Clipmesh service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// UDP port for heartbeats
    pub heartbeat_port: u16,
    /// Interval between heartbeat broadcasts
    pub heartbeat_interval_ms: u64,
    /// Multicast group the heartbeat socket joins
    pub multicast_group: Ipv4Addr,
    /// Silence after which a neighbor is considered gone
    pub survival_timeout_ms: u64,
    /// TCP port for incoming packages
    pub package_port: u16,
    /// Format assumed for images that do not carry one
    pub default_image_format: String,
    pub connect_timeout_ms: u64,
    pub connect_attempts: u32,
    pub connect_backoff_ms: u64,
    /// Limit on writing one package; a neighbor that stops reading is dropped
    pub send_timeout_ms: u64,
    pub clipboard_poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_port: constants::DEFAULT_HEARTBEAT_PORT,
            heartbeat_interval_ms: constants::DEFAULT_HEARTBEAT_INTERVAL_MS,
            multicast_group: constants::DEFAULT_MULTICAST_GROUP,
            survival_timeout_ms: constants::DEFAULT_SURVIVAL_TIMEOUT_MS,
            package_port: constants::DEFAULT_PACKAGE_PORT,
            default_image_format: constants::DEFAULT_IMAGE_FORMAT.to_string(),
            connect_timeout_ms: constants::DEFAULT_CONNECT_TIMEOUT_MS,
            connect_attempts: constants::DEFAULT_CONNECT_ATTEMPTS,
            connect_backoff_ms: constants::DEFAULT_CONNECT_BACKOFF_MS,
            send_timeout_ms: constants::DEFAULT_SEND_TIMEOUT_MS,
            clipboard_poll_interval_ms: constants::CLIPBOARD_POLL_INTERVAL_MS,
        }
    }
}

impl Config {
    /// Default config file location: `~/.clipmesh/config.json`
    pub fn default_path() -> PathBuf {
        dirs_home().join(".clipmesh").join("config.json")
    }

    /// Load a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise use defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("no config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::Config("heartbeatIntervalMs must be positive".to_string()));
        }
        if self.survival_timeout_ms <= self.heartbeat_interval_ms {
            return Err(Error::Config(
                "survivalTimeoutMs must exceed heartbeatIntervalMs".to_string(),
            ));
        }
        if !self.multicast_group.is_multicast() {
            return Err(Error::Config(format!(
                "{} is not a multicast address",
                self.multicast_group
            )));
        }
        if self.send_timeout_ms == 0 {
            return Err(Error::Config("sendTimeoutMs must be positive".to_string()));
        }
        if self.default_image_format.is_empty() {
            return Err(Error::Config("defaultImageFormat must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn survival_timeout(&self) -> Duration {
        Duration::from_millis(self.survival_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn clipboard_poll_interval(&self) -> Duration {
        Duration::from_millis(self.clipboard_poll_interval_ms)
    }
}

fn dirs_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

// Re-export key types for convenience
pub use clipboard::{ClipboardProvider, Payload};
pub use discovery::{NeighborKey, NeighborRecord, NeighborRegistry};
pub use protocol::DataPackage;
pub use service::{ClipMeshService, ServiceEvent, SyncCore};
