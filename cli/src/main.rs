//! Clipmesh CLI - serverless LAN clipboard sharing.

mod commands;
mod ui;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use clipmesh_core::{Config, LocalIdentity};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clipmesh")]
#[command(about = "Share the clipboard with hosts on the local network", long_about = None)]
struct Cli {
    /// Host name stamped on outgoing packages
    #[arg(short, long, default_value_t = default_host_name())]
    name: String,

    /// Config file (defaults to ~/.clipmesh/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP heartbeat port
    #[arg(long)]
    heartbeat_port: Option<u16>,

    /// TCP package port
    #[arg(long)]
    package_port: Option<u16>,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn default_host_name() -> String {
    LocalIdentity::from_hostname().name
}

#[derive(Subcommand)]
enum Commands {
    /// Start sharing the clipboard (default)
    Run,
    /// Show host info and effective config
    Info,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<Config> {
        let path = self.config.clone().unwrap_or_else(Config::default_path);
        let mut config = Config::load_or_default(&path)
            .with_context(|| format!("loading {}", path.display()))?;

        if let Some(port) = self.heartbeat_port {
            config.heartbeat_port = port;
        }
        if let Some(port) = self.package_port {
            config.package_port = port;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("clipmesh=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    let identity = LocalIdentity::new(cli.name.clone());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => commands::run_service(identity, config).await?,
        Commands::Info => commands::show_info(&identity, &config)?,
    }

    Ok(())
}
