//! Multicast heartbeat discovery of peers on the local network

pub mod heartbeat;
pub mod registry;

use std::net::IpAddr;

pub use heartbeat::{HeartbeatEvent, HeartbeatHandle, HeartbeatHandler, HeartbeatOutcome, HeartbeatService};
pub use registry::{NeighborKey, NeighborRecord, NeighborRegistry};

/// Get local IP addresses (non-loopback)
pub fn get_local_ips() -> Vec<IpAddr> {
    local_addresses()
        .into_iter()
        .filter(|ip| !ip.is_loopback())
        .collect()
}

/// Every address assigned to one of this host's interfaces, loopback included
pub fn local_addresses() -> Vec<IpAddr> {
    match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces.iter().map(|iface| iface.ip()).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to enumerate network interfaces");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ips_exclude_loopback() {
        let ips = get_local_ips();
        assert!(ips.iter().all(|ip| !ip.is_loopback()));
        for ip in &ips {
            assert!(local_addresses().contains(ip));
        }
    }
}
