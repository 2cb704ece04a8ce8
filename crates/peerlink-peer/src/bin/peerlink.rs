//! PeerLink CLI - Share files directly between two machines
//!
//! Usage:
//!   peerlink relay                     Run the signaling relay
//!   peerlink session create            Create a session
//!   peerlink host [--send <file>...]   Host a session
//!   peerlink view <id> [--send ...]    Join a session as viewer
//!   peerlink config show|init          Inspect or write the config file

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use peerlink_core::{Config, Role};
use peerlink_peer::RelayApi;
use peerlink_signal::RelayServer;

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(about = "P2P file sharing over a direct connection", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Relay WebSocket URL
    #[arg(long, global = true)]
    relay_url: Option<String>,

    /// Relay HTTP API URL
    #[arg(long, global = true)]
    api_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Manage sessions on the relay
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Host a session and wait for a viewer
    Host {
        /// Reuse an existing session instead of creating one
        #[arg(short, long)]
        session: Option<String>,

        /// Files to send once the direct channel opens
        #[arg(long)]
        send: Vec<PathBuf>,

        /// Where received files are saved
        #[arg(short, long)]
        download_dir: Option<PathBuf>,
    },

    /// Join a session as viewer
    View {
        /// Session ID shared by the host
        session: String,

        /// Files to send once the direct channel opens
        #[arg(long)]
        send: Vec<PathBuf>,

        /// Where received files are saved
        #[arg(short, long)]
        download_dir: Option<PathBuf>,
    },

    /// Show or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Create a new session
    Create,
    /// Look up a session
    Get { id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(url) = cli.relay_url {
        config.peer.relay_url = url;
    }
    if let Some(url) = cli.api_url {
        config.peer.api_url = url;
    }

    match cli.command {
        Commands::Relay { port, bind } => run_relay(config, port, bind).await?,
        Commands::Session { action } => run_session(&config, action).await?,
        Commands::Host {
            session,
            send,
            download_dir,
        } => {
            let session_id = match session {
                Some(id) => id,
                None => {
                    let session = RelayApi::new(&config.peer.api_url).create_session().await?;
                    info!("");
                    info!("  Session ID: {}", session.id);
                    info!("");
                    info!("  Run on another machine:");
                    info!("    peerlink view {}", session.id);
                    info!("");
                    session.id
                }
            };
            let dir = download_dir.unwrap_or_else(Config::default_download_dir);
            live::run(config, Role::Host, session_id, send, dir).await?;
        }
        Commands::View {
            session,
            send,
            download_dir,
        } => {
            let dir = download_dir.unwrap_or_else(Config::default_download_dir);
            live::run(config, Role::Viewer, session, send, dir).await?;
        }
        Commands::Config { action } => run_config(&cli.config, &config, action)?,
    }

    Ok(())
}

async fn run_relay(
    config: Config,
    port: Option<u16>,
    bind: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut relay = config.relay;
    if let Some(port) = port {
        relay.port = port;
    }
    if let Some(bind) = bind {
        relay.bind = bind.parse()?;
    }

    let addr = SocketAddr::new(relay.bind, relay.port);
    info!("Starting PeerLink relay on {}", addr);

    let server = RelayServer::new(relay);
    tokio::select! {
        result = server.serve(addr) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }
    Ok(())
}

async fn run_session(config: &Config, action: SessionAction) -> Result<(), Box<dyn std::error::Error>> {
    let api = RelayApi::new(&config.peer.api_url);
    let session = match action {
        SessionAction::Create => api.create_session().await?,
        SessionAction::Get { id } => api.get_session(&id).await?,
    };
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}

fn run_config(
    path: &Option<PathBuf>,
    config: &Config,
    action: ConfigAction,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        ConfigAction::Show => print!("{}", config.to_toml()?),
        ConfigAction::Init { force } => {
            let path = path
                .clone()
                .or_else(Config::default_path)
                .ok_or("no config directory on this platform")?;
            if path.exists() && !force {
                return Err(format!("{} already exists (use --force)", path.display()).into());
            }
            Config::default().save_to(&path)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

#[cfg(feature = "webrtc")]
mod live {
    use std::path::PathBuf;
    use std::sync::Arc;

    use tokio::sync::broadcast::error::RecvError;
    use tracing::{debug, error, info, warn};

    use peerlink_core::{format_bytes, Config, Role, TransferStatus};
    use peerlink_peer::transport::WebRtcTransport;
    use peerlink_peer::{ParticipantEvent, ParticipantHandle, ParticipantOptions, SignalingClient};

    pub async fn run(
        config: Config,
        role: Role,
        session_id: String,
        send: Vec<PathBuf>,
        download_dir: PathBuf,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let (transport, transport_events) = WebRtcTransport::new(&config.peer.stun_servers).await?;
        let signals = SignalingClient::connect(&config.peer.relay_url, config.peer.connect_timeout()).await?;

        let options = ParticipantOptions {
            session_id: peerlink_core::ids::normalize_session_id(&session_id),
            role,
            transfer: config.transfer.clone(),
            download_dir,
            api: Some(peerlink_peer::RelayApi::new(&config.peer.api_url)),
        };
        let (handle, mut events) =
            ParticipantHandle::spawn(options, Arc::new(transport), transport_events, signals);

        let mut pending = send;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ParticipantEvent::DataChannelOpen) => {
                        info!("Direct channel open");
                        for path in pending.drain(..) {
                            match handle.send_file(&path).await {
                                Ok(t) => info!("Sending {} ({})", t.filename, format_bytes(t.total_size)),
                                Err(e) => error!("Cannot send {}: {}", path.display(), e),
                            }
                        }
                    }
                    Ok(ParticipantEvent::Closed) => break,
                    Ok(event) => report(&event),
                    Err(RecvError::Lagged(n)) => debug!("Skipped {} events", n),
                    Err(RecvError::Closed) => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down...");
                    handle.close().await?;
                    break;
                }
            }
        }

        let stats = handle.stats();
        info!(
            "Sent {} files, received {} files ({} total)",
            stats.files_sent,
            stats.files_received,
            format_bytes(stats.total_bytes())
        );
        Ok(())
    }

    fn report(event: &ParticipantEvent) {
        match event {
            ParticipantEvent::Joined { session_id, role } => {
                info!("Joined {} as {}", session_id, role)
            }
            ParticipantEvent::PeerJoined { role } => info!("A {} joined", role),
            ParticipantEvent::SessionError(message) => error!("Relay: {}", message),
            ParticipantEvent::StateChanged(state) => info!("Connection: {:?}", state),
            ParticipantEvent::DataChannelClosed => warn!("Direct channel closed"),
            ParticipantEvent::RemoteTrack(track) => info!("Remote {:?} track {}", track.kind, track.id),
            ParticipantEvent::RemoteTrackRemoved(id) => info!("Remote track {} ended", id),
            ParticipantEvent::TransferUpdated(t) => match t.status {
                TransferStatus::Completed => info!("{} done ({})", t.filename, format_bytes(t.total_size)),
                TransferStatus::Failed => warn!("{} failed", t.filename),
                _ => debug!("{}: {}%", t.filename, t.percent()),
            },
            ParticipantEvent::FileReceived { transfer, path } => {
                info!("Saved {} to {}", transfer.filename, path.display())
            }
            ParticipantEvent::DataChannelOpen | ParticipantEvent::Closed => {}
        }
    }
}

#[cfg(not(feature = "webrtc"))]
mod live {
    use std::path::PathBuf;

    use peerlink_core::{Config, Role};

    pub async fn run(
        _config: Config,
        _role: Role,
        _session_id: String,
        _send: Vec<PathBuf>,
        _download_dir: PathBuf,
    ) -> Result<(), Box<dyn std::error::Error>> {
        Err("peerlink was built without the `webrtc` feature; rebuild with --features webrtc".into())
    }
}
