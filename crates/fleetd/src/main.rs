//! fleetd: the Fleetgate daemon.
//!
//! Single binary that assembles the update server:
//! - State store (redb)
//! - Catalog, statistics ledger and protocol handler
//! - Rollout metrics
//! - HTTP API (check-ins, events, admin, `/metrics`)
//!
//! # Usage
//!
//! ```text
//! fleetd serve --config /etc/fleetgate/fleetd.toml --listen 0.0.0.0:8000
//! fleetd print-config --data-dir /var/lib/fleetgate
//! ```

mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use fleet_core::FleetConfig;

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleetgate update server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve check-ins, event reports and the admin API.
    Serve(ConfigArgs),
    /// Print the effective configuration as TOML and exit.
    PrintConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Path to fleetd.toml.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides `[server] listen`).
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Data directory for persistent state (overrides `[store] data_dir`).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Emit JSON logs (overrides `[log] json`).
    #[arg(long)]
    json_logs: bool,
}

impl ConfigArgs {
    fn resolve(self) -> anyhow::Result<FleetConfig> {
        let mut config = match &self.config {
            Some(path) => FleetConfig::from_file(path)?,
            None => FleetConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.server.listen = listen;
        }
        if let Some(data_dir) = self.data_dir {
            config.store.data_dir = data_dir;
        }
        if self.json_logs {
            config.log.json = true;
        }
        Ok(config)
    }
}

fn init_tracing(config: &FleetConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => {
            let config = args.resolve()?;
            init_tracing(&config);
            server::run(config).await
        }
        Command::PrintConfig(args) => {
            let config = args.resolve()?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
