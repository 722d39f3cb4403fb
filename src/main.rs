//! P2P node command line
//!
//! Generates node keys and runs a networking node on an in-memory chain.

use chain_p2p::chain::{ChainService, MemoryChain};
use chain_p2p::config::{ClientConfig, P2pConfig};
use chain_p2p::crypto::KeyPair;
use chain_p2p::network::{Node, NodeEvent};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How often the running node logs its status
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "p2pnode")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer networking node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a node key and print its peer id
    Key {
        /// Write a default config carrying the key to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Start the P2P node
    Start {
        /// JSON config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen multiaddress, e.g. /ip4/0.0.0.0/tcp/30333
        #[arg(short, long)]
        listen: Option<String>,

        /// Bootstrap peers (comma-separated /ip4/../tcp/../p2p/<id>)
        #[arg(short, long)]
        bootstrap: Option<String>,

        /// Hex-encoded node private key
        #[arg(short, long)]
        key: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Key { output } => cmd_key(output),
        Commands::Start {
            config,
            listen,
            bootstrap,
            key,
        } => {
            let cfg = build_config(config, listen, bootstrap, key)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_node(cfg))
        }
    }
}

fn cmd_key(output: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let key = KeyPair::generate();
    println!("Peer ID:     {}", key.peer_id());
    println!("Public key:  {}", key.public_key_hex());
    println!("Private key: {}", key.private_key_hex());

    if let Some(path) = output {
        let cfg = ClientConfig::with_p2p(P2pConfig {
            private_key: key.private_key_hex(),
            ..P2pConfig::default()
        });
        cfg.save(&path)?;
        println!("Config written to {}", path.display());
    }

    Ok(())
}

/// Config file (if any) overridden by command line flags
fn build_config(
    path: Option<PathBuf>,
    listen: Option<String>,
    bootstrap: Option<String>,
    key: Option<String>,
) -> Result<ClientConfig, Box<dyn std::error::Error + Send + Sync>> {
    let mut cfg = match path {
        Some(path) => ClientConfig::load(&path)?,
        None => ClientConfig::default(),
    };
    let p2p = cfg.p2p.get_or_insert_with(P2pConfig::default);

    if let Some(listen) = listen {
        p2p.listen_address = listen;
    }
    if let Some(peers) = bootstrap {
        p2p.bootstrap_peers = peers
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(key) = key {
        p2p.private_key = key;
    }
    if p2p.private_key.is_empty() {
        log::warn!("No node key configured, generating an ephemeral one");
        p2p.private_key = KeyPair::generate().private_key_hex();
    }

    Ok(cfg)
}

async fn run_node(cfg: ClientConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cancel = CancellationToken::new();
    let (events_tx, mut events_rx) = mpsc::channel(256);
    let chain: Arc<dyn ChainService> = Arc::new(MemoryChain::new());

    let node = Node::new(cancel.clone(), events_tx, Some(cfg), Some(chain))?;
    node.start().await?;

    let status = node.status().await?;
    println!("Peer ID: {}", status.peer_id);
    for addr in &status.listen_addrs {
        println!("Listening on {}", addr);
    }

    let mut status_tick = tokio::time::interval(STATUS_INTERVAL);
    status_tick.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down node...");
                break;
            }
            _ = cancel.cancelled() => break,
            Some(event) = events_rx.recv() => log_event(event),
            _ = status_tick.tick() => match node.status().await {
                Ok(s) => log::info!(
                    "{} known peers, {} connected, {} queued dials",
                    s.peers,
                    s.connected,
                    s.queued_dials
                ),
                Err(e) => log::warn!("Status unavailable: {}", e),
            },
        }
    }

    node.stop()?;
    node.wait_stopped().await;
    log::info!("Node stopped");
    Ok(())
}

fn log_event(event: NodeEvent) {
    match event {
        NodeEvent::PeerConnected { peer } => log::info!("Peer connected: {}", peer),
        NodeEvent::Message { peer, message } => {
            log::info!("{:?} from {}", message.kind(), peer)
        }
    }
}
