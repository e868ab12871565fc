//! hullsync - dedicated replication server.

mod config;

use anyhow::Result;
use clap::Parser;
use hullsync_server::MultiplayerHost;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (TOML)
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Fail on a missing or invalid settings file instead of using defaults
    #[arg(long)]
    strict: bool,

    /// Address to bind, overriding the settings file
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Session password, overriding the settings file
    #[arg(short, long)]
    password: Option<String>,

    /// Write the effective settings to the settings file and exit
    #[arg(long)]
    write_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with INFO level by default (can be overridden via RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting hullsync v{}", env!("CARGO_PKG_VERSION"));
    let args = Args::parse();

    let mut settings = if args.strict {
        config::load_settings_strict(&args.config)?
    } else {
        config::load_settings(&args.config)
    };
    if let Some(bind) = args.bind {
        settings.bind_addr = bind;
    }
    if let Some(password) = args.password {
        settings.password = Some(password);
    }

    if args.write_config {
        config::save_settings(&settings, &args.config)?;
        info!("Wrote settings to {}", args.config.display());
        return Ok(());
    }

    let host = MultiplayerHost::bind(settings)?;
    info!("Listening on {}", host.local_addr());
    host.run(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    })
    .await
}
