//! Info command implementation.

use clipmesh_core::{Config, LocalIdentity};

/// Display host information and the effective config.
pub fn show_info(identity: &LocalIdentity, config: &Config) -> anyhow::Result<()> {
    println!("\n\x1b[1mClipmesh Host Info\x1b[0m");
    println!("═══════════════════════════════════════");
    println!("\x1b[1mName:\x1b[0m       {}", identity.name);
    println!("\x1b[1mHeartbeat:\x1b[0m  {}:{}", config.multicast_group, config.heartbeat_port);
    println!("\x1b[1mPackages:\x1b[0m   tcp/{}", config.package_port);

    println!("\n\x1b[1mLocal IPs:\x1b[0m");
    for ip in clipmesh_core::discovery::get_local_ips() {
        println!("  • {}", ip);
    }

    println!("\n\x1b[1mConfig:\x1b[0m");
    println!("{}", serde_json::to_string_pretty(config)?);
    println!();
    Ok(())
}
