//! chainchat daemon: peer-to-peer chat over a proof-of-work archive.
//!
//! # Usage
//!
//! ```bash
//! chainchatd <bootstrap_peer> <public_ip>      # join via a known peer
//! chainchatd --config /path/to/config.toml    # take both from the config
//! chainchatd --log-dir /tmp/peer-logs ...     # redirect per-peer logs
//! ```
//!
//! Stdin is the operator prompt: every line becomes a chat message,
//! sealed with proof-of-work, appended to the archive, and broadcast to
//! all connected peers. The line `exit` quits; `peers` lists the
//! currently connected peer addresses.
//!
//! # Architecture
//!
//! The daemon runs these concurrent tasks:
//! 1. TCP listener on port 51511 (tokio task)
//! 2. Per peer: a receiver task and a periodic requester task
//! 3. The operator prompt on the main task

mod dial;
mod listener;
mod peer;
mod peer_log;
mod state;

use anyhow::{bail, Context, Result};
use chainchat_core::config::AppConfig;
use clap::Parser;
use state::NodeState;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// chainchat gossip daemon.
#[derive(Parser, Debug)]
#[command(name = "chainchatd", about = "chainchat gossip daemon")]
struct Cli {
    /// Host or IPv4 address of the initial peer to connect to.
    /// Falls back to `bootstrap_peer` in the config file.
    bootstrap_peer: Option<String>,

    /// Public IPv4 address of this machine, used to skip self-dials when
    /// our own address comes back in a gossiped peer list.
    /// Falls back to `public_ip` in the config file.
    public_ip: Option<Ipv4Addr>,

    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory receiving the per-peer log files.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::config_file_path().context("could not determine config directory")?,
    };
    let config = match AppConfig::load_from(&config_path)? {
        Some(config) => {
            info!(path = %config_path.display(), "loaded config");
            config
        }
        None => AppConfig::default(),
    };

    // CLI arguments override the config file.
    let bootstrap_peer = cli.bootstrap_peer.or(config.bootstrap_peer);
    let public_ip = cli.public_ip.or(config.public_ip);

    let Some(public_ip) = public_ip else {
        bail!(
            "no public IP given; pass it as the second argument or set `public_ip` in {}",
            config_path.display()
        );
    };
    let Some(bootstrap_peer) = bootstrap_peer else {
        bail!(
            "no bootstrap peer given; pass it as the first argument or set `bootstrap_peer` in {}",
            config_path.display()
        );
    };

    let log_dir = cli
        .log_dir
        .or(config.log_dir)
        .or_else(AppConfig::data_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("could not create log directory {}", log_dir.display()))?;

    let state = Arc::new(NodeState::new(public_ip, log_dir));
    info!(%public_ip, "chainchat node starting");

    // Accept incoming peers on the fixed protocol port.
    let listener = listener::Listener::bind().context("failed to bind listen socket")?;
    tokio::spawn(listener.accept_loop(Arc::clone(&state)));

    // Dial the initial peer. Failure is not fatal: gossip can still reach
    // us through inbound connections.
    match dial::connect(&bootstrap_peer).await {
        Ok(stream) => peer::spawn_peer(Arc::clone(&state), stream),
        Err(e) => warn!(peer = %bootstrap_peer, error = %e, "failed to connect to initial peer"),
    }

    prompt_loop(state).await
}

/// The operator prompt: one chat message per line, `exit` to quit,
/// `peers` to list connections.
async fn prompt_loop(state: Arc<NodeState>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        println!("Input a chat message to send (255 chars max):");
        let Some(line) = lines.next_line().await? else {
            info!("stdin closed, shutting down");
            return Ok(());
        };

        match line.as_str() {
            "exit" => std::process::exit(0),
            "peers" => {
                let peers = state.list_peers().await;
                println!("{} connected peer(s):", peers.len());
                for ip in peers {
                    println!("  {ip}");
                }
            }
            _ => match state.submit_message(line.as_bytes()).await {
                Ok(rendered) => {
                    println!("Message successfully added to archive!");
                    println!("New active archive:");
                    println!("{rendered}");
                }
                Err(e) => eprintln!("Invalid message ({e}), try again"),
            },
        }
    }
}

/// Initializes the tracing infrastructure.
///
/// Sets up a layered subscriber that writes to stderr and, when the data
/// directory is available, to an append-mode `chainchatd.log` there. The
/// log level is controlled by the `CHAINCHAT_LOG` environment variable
/// and defaults to `info`.
fn init_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_env("CHAINCHAT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let file_layer = AppConfig::data_dir()
        .and_then(|dir| {
            std::fs::create_dir_all(&dir).ok()?;
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("chainchatd.log"))
                .ok()
        })
        .map(|file| {
            fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
        });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}
