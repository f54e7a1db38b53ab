//! robolink - Self-healing WebRTC signaling client for robot camera streaming

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use robolink::config::{FileConfig, SupervisorConfig};
use robolink::identity::{
    generate_robot_id, read_mac_address, FileIdentityStore, DEFAULT_IDENTITY_FILE,
};

#[derive(Parser)]
#[command(name = "robolink")]
#[command(about = "Self-healing WebRTC signaling client for robot camera streaming")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Args)]
struct IdentityArgs {
    /// File caching the robot id
    #[arg(long)]
    identity_file: Option<PathBuf>,

    /// Device name the robot id is derived from (defaults to the MAC address)
    #[arg(long, env = "ROBOT_ID")]
    robot_name: Option<String>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the signaling server and stream until interrupted
    Run {
        #[command(flatten)]
        identity: IdentityArgs,

        /// Signaling server URL (e.g., wss://example.com:8443)
        #[arg(short, long, env = "SIGNALING_SERVER_URL")]
        server: Option<String>,

        /// Seconds to wait before reconnecting
        #[arg(long)]
        retry_interval: Option<u64>,

        /// Skip TLS certificate verification for the signaling server
        #[arg(long)]
        insecure_tls: bool,

        /// STUN server URL (replaces the configured ICE servers)
        #[arg(long)]
        stun_server: Option<String>,
    },

    /// Print the robot id, creating the cache file if needed
    Identity {
        #[command(flatten)]
        identity: IdentityArgs,
    },
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_file_config(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(path) => FileConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(FileConfig::default()),
    }
}

/// Layer defaults, config file and command line into the supervisor config
fn resolve(args: &IdentityArgs) -> Result<(SupervisorConfig, PathBuf)> {
    let file = load_file_config(args.config.as_deref())?;
    let identity_file = args
        .identity_file
        .clone()
        .or_else(|| file.identity_file.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_IDENTITY_FILE));

    let mut config = SupervisorConfig::default();
    file.apply(&mut config);

    if let Some(name) = &args.robot_name {
        config.robot_name = Some(name.clone());
    }
    if config.robot_name.is_none() {
        config.robot_name = read_mac_address(Path::new("/sys"));
    }

    Ok((config, identity_file))
}

async fn show_identity(args: IdentityArgs) -> Result<()> {
    let (config, identity_file) = resolve(&args)?;
    let store = FileIdentityStore::new(identity_file);
    let identity = generate_robot_id(&store, config.robot_name.as_deref())?;
    println!("{}", identity);
    Ok(())
}

#[cfg(feature = "webrtc-engine")]
async fn run(
    args: IdentityArgs,
    server: Option<String>,
    retry_interval: Option<u64>,
    insecure_tls: bool,
    stun_server: Option<String>,
) -> Result<()> {
    use std::sync::Arc;
    use std::time::Duration;

    use robolink::pipeline::{IceServer, WebRtcEngine};
    use robolink::ReconnectSupervisor;
    use tokio_util::sync::CancellationToken;

    let (mut config, identity_file) = resolve(&args)?;
    if let Some(server) = server {
        config.server_url = server;
    }
    if let Some(secs) = retry_interval {
        config.retry_interval = Duration::from_secs(secs);
    }
    if insecure_tls {
        config.tls.insecure = true;
    }
    if let Some(stun) = stun_server {
        config.pipeline.ice_servers = vec![IceServer::stun(stun)];
    }

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Interrupted, shutting down...");
        on_signal.cancel();
    });

    let identity = Arc::new(FileIdentityStore::new(identity_file));
    let mut supervisor = ReconnectSupervisor::new(Arc::new(WebRtcEngine::new()), identity);
    supervisor.start(config, shutdown).await?;

    info!("Goodbye");
    Ok(())
}

#[cfg(not(feature = "webrtc-engine"))]
async fn run(
    _args: IdentityArgs,
    _server: Option<String>,
    _retry_interval: Option<u64>,
    _insecure_tls: bool,
    _stun_server: Option<String>,
) -> Result<()> {
    anyhow::bail!("robolink was built without a media engine (enable the `webrtc-engine` feature)")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A TLS crypto provider was already installed");
    }

    match cli.command {
        Commands::Run {
            identity,
            server,
            retry_interval,
            insecure_tls,
            stun_server,
        } => run(identity, server, retry_interval, insecure_tls, stun_server).await,
        Commands::Identity { identity } => show_identity(identity).await,
    }
}
