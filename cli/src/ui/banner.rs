//! Banner and header printing.

/// Print the application banner.
pub fn print_banner() {
    let title = format!("Clipmesh v{}", env!("CARGO_PKG_VERSION"));
    println!("\n\x1b[1;36m╔══════════════════════════════════════╗\x1b[0m");
    println!("\x1b[1;36m║\x1b[0m  \x1b[1m{:<36}\x1b[0m\x1b[1;36m║\x1b[0m", title);
    println!("\x1b[1;36m║\x1b[0m  {:<36}\x1b[1;36m║\x1b[0m", "Serverless LAN clipboard sharing");
    println!("\x1b[1;36m╚══════════════════════════════════════╝\x1b[0m\n");
}
