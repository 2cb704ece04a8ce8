//! PeerLink Relay
//!
//! WebSocket signaling relay and session API.
//!
//! # Usage
//!
//! ```bash
//! peerlink-relay --port 8080
//!
//! # Drop session records after an hour
//! peerlink-relay --session-max-age 3600
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use peerlink_core::Config;
use peerlink_signal::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "peerlink-relay")]
#[command(about = "PeerLink signaling relay")]
#[command(version)]
struct Args {
    /// Port to listen on (default 8080)
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Drop session records older than this many seconds
    #[arg(long)]
    session_max_age: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    let mut relay_config = config.relay;
    if let Some(port) = args.port {
        relay_config.port = port;
    }
    if let Some(bind) = &args.bind {
        relay_config.bind = bind.parse()?;
    }
    if args.session_max_age.is_some() {
        relay_config.session_max_age_secs = args.session_max_age;
    }

    let addr = SocketAddr::new(relay_config.bind, relay_config.port);
    info!("Starting PeerLink relay on {}", addr);

    let server = RelayServer::new(relay_config);
    tokio::select! {
        result = server.serve(addr) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
