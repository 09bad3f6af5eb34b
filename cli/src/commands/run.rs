//! Run command implementation.

use std::sync::Arc;

use clipmesh_core::clipboard::SystemClipboard;
use clipmesh_core::{ClipMeshService, Config, LocalIdentity, Payload, ServiceEvent};

use crate::ui::print_banner;

/// Run the clipmesh service until Ctrl+C.
pub async fn run_service(identity: LocalIdentity, config: Config) -> anyhow::Result<()> {
    print_banner();

    let mut service = ClipMeshService::with_identity(identity, config);

    println!("\x1b[1mHost:\x1b[0m      {}", service.identity().name);
    println!(
        "\x1b[1mHeartbeat:\x1b[0m {}:{}",
        service.config().multicast_group,
        service.config().heartbeat_port
    );

    let mut events = service.start(Arc::new(SystemClipboard::new())).await?;

    if let Some(port) = service.package_port() {
        println!("\x1b[1mPackages:\x1b[0m  tcp/{}", port);
    }
    println!("\n\x1b[1;32m✓\x1b[0m Listening for neighbors and clipboard changes...");
    println!("\x1b[2mPress Ctrl+C to stop.\x1b[0m\n");

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.blocking_send(());
    })?;

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                handle_event(event);
            }
            _ = rx.recv() => {
                println!("\n\x1b[1;33mShutting down...\x1b[0m");
                break;
            }
        }
    }

    // Neighbors drop us right away instead of waiting out the survival timeout
    service.shutdown().await;
    Ok(())
}

/// Handle a service event and print appropriate output.
fn handle_event(event: ServiceEvent) {
    match event {
        ServiceEvent::NeighborFound(record) => {
            println!(
                "\x1b[1;32m⬤\x1b[0m Found: \x1b[1m{}\x1b[0m at {}",
                record.host_name,
                record.key()
            );
        }
        ServiceEvent::NeighborLost(key) => {
            println!("\x1b[1;31m⬤\x1b[0m Lost: {}", key);
        }
        ServiceEvent::PackageReceived { from, sender, payload } => {
            println!(
                "\x1b[1;34m📋\x1b[0m Received from {} ({}): \"{}\"",
                sender,
                from,
                format_preview(&payload)
            );
        }
        ServiceEvent::PayloadSent { to_neighbors } => {
            println!("\x1b[1;34m📤\x1b[0m Sent to {} neighbor(s)", to_neighbors.len());
        }
        ServiceEvent::Error(e) => {
            eprintln!("\x1b[1;31m✗\x1b[0m Error: {}", e);
        }
    }
}

/// Format a payload for preview display.
fn format_preview(payload: &Payload) -> String {
    const MAX_PREVIEW_CHARS: usize = 50;

    let Some(text) = payload.plain_text() else {
        let formats: Vec<&str> = payload.entries.iter().map(|e| e.format.as_str()).collect();
        return match &payload.image {
            Some(image) => format!("<{} image>", image.format),
            None => format!("<{}>", formats.join(", ")),
        };
    };

    if text.chars().count() > MAX_PREVIEW_CHARS {
        let head: String = text.chars().take(MAX_PREVIEW_CHARS).collect();
        format!("{}...", head)
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(60);
        let preview = format_preview(&Payload::text(long));
        assert_eq!(preview.chars().count(), 53);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_preview_short_text() {
        assert_eq!(format_preview(&Payload::text("hi")), "hi");
    }
}
