//! Clipshare CLI - LAN clipboard sharing.

mod commands;
mod ui;

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clipshare_core::protocol::constants::{DISCOVERY_PORT, SESSION_PORT};
use clipshare_core::Config;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clipshare")]
#[command(about = "Share the clipboard with devices on your LAN", long_about = None)]
struct Cli {
    /// Device name to advertise
    #[arg(short, long, default_value_t = default_device_name())]
    name: String,

    /// TCP port for connection requests and sessions
    #[arg(short, long, default_value_t = SESSION_PORT)]
    port: u16,

    /// UDP port for discovery
    #[arg(long, default_value_t = DISCOVERY_PORT)]
    discovery_port: u16,

    /// Local address to bind and dial from (picked automatically if omitted)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Directory for received files
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Accept incoming connection requests (declined otherwise)
    #[arg(long)]
    accept: bool,

    /// Ask this device to connect on startup (repeatable)
    #[arg(long, value_name = "IP")]
    connect: Vec<IpAddr>,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "clipshare-device".to_string())
}

#[derive(Subcommand)]
enum Commands {
    /// Start the clipshare service (default)
    Run,
    /// Run one discovery round and list devices
    Scan {
        /// Devices per page
        #[arg(long, default_value_t = 8)]
        page_size: usize,
    },
    /// Show device info
    Info,
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config {
            device_name: self.name.clone(),
            local_ip: self.bind,
            session_port: self.port,
            discovery_port: self.discovery_port,
            ..Config::default()
        };
        if let Some(dir) = &self.download_dir {
            config.download_dir = dir.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("clipshare=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => commands::run_service(config, cli.accept, cli.connect).await?,
        Commands::Scan { page_size } => commands::scan_devices(config, page_size).await?,
        Commands::Info => commands::show_info(config),
    }

    Ok(())
}
