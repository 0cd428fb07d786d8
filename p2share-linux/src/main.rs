// P2Share Linux: LAN transport, directory catalog, daemon and CLI.

mod catalog;
mod config;
mod lan;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use p2share_core::{Engine, EngineEvent, PeerAddress, TransferStatus};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::catalog::DirCatalog;
use crate::lan::LanTransport;

#[derive(Parser)]
#[command(name = "p2share", version, about = "Share files with nearby peers")]
struct Cli {
    /// Config file (default: ~/.config/p2share/config.toml, then /etc/p2share/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Share the share directory and answer peers until interrupted
    Serve,
    /// Scan once and print peers offering the service
    Peers,
    /// List the files a peer shares
    List {
        /// Peer address (ip:port)
        peer: String,
    },
    /// Download a file from a peer into the download directory
    Get {
        peer: String,
        /// File id or name as shown by `list`
        file: String,
    },
    /// Measure round-trip time to a peer
    Ping { peer: String },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let transport = Arc::new(LanTransport::new(cfg.discovery_port, cfg.transport_port));
        let catalog = Arc::new(DirCatalog::new(&cfg.share_dir, &cfg.download_dir));
        let engine = Engine::new(cfg.engine.clone(), transport, catalog);

        match cli.command {
            Command::Serve => serve(&engine, &cfg).await,
            Command::Peers => {
                let hits = engine.scan_now().await?;
                if hits == 0 {
                    println!("no peers found");
                }
                for peer in engine.peers().await {
                    println!("{}\t{}", peer.address, peer.display_name);
                }
                Ok(())
            }
            Command::List { peer } => {
                let files = engine.list_files(&PeerAddress::new(peer)).await?;
                for f in files {
                    println!("{}\t{}\t{}", f.id, f.size, f.hash);
                }
                Ok(())
            }
            Command::Get { peer, file } => {
                let peer = PeerAddress::new(peer);
                let files = engine.list_files(&peer).await?;
                let Some(entry) = files
                    .iter()
                    .find(|f| f.id.as_str() == file || f.name == file)
                else {
                    bail!("{peer} does not share {file}");
                };
                let report = engine.download(&peer, entry).await?;
                println!(
                    "{}: {} bytes in {:.1?}, sha256 {}",
                    report.file_id, report.bytes, report.elapsed, report.hash
                );
                Ok(())
            }
            Command::Ping { peer } => {
                let rtt = engine.ping(&PeerAddress::new(peer)).await?;
                println!("rtt {rtt:.1?}");
                Ok(())
            }
        }
    })
}

async fn serve(engine: &Engine, cfg: &config::Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cfg.share_dir)
        .with_context(|| format!("creating {}", cfg.share_dir.display()))?;
    info!(
        share_dir = %cfg.share_dir.display(),
        download_dir = %cfg.download_dir.display(),
        port = cfg.transport_port,
        "p2share {}",
        env!("CARGO_PKG_VERSION")
    );
    let mut events = engine.subscribe();
    engine.start();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => report(event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    shutdown_signal().await?;
    info!("shutting down");
    engine.shutdown().await;
    reporter.abort();
    Ok(())
}

fn report(event: EngineEvent) {
    match event {
        EngineEvent::TransferFinished {
            peer,
            file_id,
            direction,
            status: TransferStatus::Completed { bytes, .. },
        } => info!(peer = %peer, file_id = %file_id, ?direction, bytes, "transfer finished"),
        EngineEvent::TransferFinished {
            peer,
            file_id,
            direction,
            status: TransferStatus::Failed(kind),
        } => warn!(peer = %peer, file_id = %file_id, ?direction, ?kind, "transfer failed"),
        EngineEvent::PeersChanged(peers) => info!(count = peers.len(), "peer list changed"),
        _ => {}
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
