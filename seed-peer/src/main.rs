// Seed peer daemon: registers with the tracker, serves local files, fetches the ones asked for.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use seed_peer::{config, FetchOutcome, Peer};

/// Peer-to-peer file sharing client.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Config file (TOML). Defaults to ~/.config/seed/peer.toml or /etc/seed/peer.toml.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// File id to download after registering. Repeat for several files.
    #[arg(short, long = "fetch", value_name = "FILE_ID")]
    fetch: Vec<u32>,
}

fn main() {
    // Set RUST_LOG to control verbosity.
    env_logger::init();
    if let Err(e) = run(Cli::parse()) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = config::load(cli.config.as_deref()).context("loading config")?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let peer = Peer::start(cfg).await.context("starting peer")?;
        log::info!(
            "peer {} up, serving on port {}",
            peer.client_id(),
            peer.service_port()
        );

        for file_id in cli.fetch {
            match peer.fetch(file_id).await {
                Ok(FetchOutcome::Downloaded { holder, transfer }) => log::info!(
                    "file {} fetched from {} into {}",
                    file_id,
                    holder,
                    transfer.path.display()
                ),
                Ok(FetchOutcome::NoHolder) => log::warn!("file {}: no holder", file_id),
                Ok(FetchOutcome::SelfHeld) => log::info!("file {}: already ours", file_id),
                Err(e) => log::error!("file {}: {}", file_id, e),
            }
        }

        let mut alive = peer.tracker().alive();
        tokio::select! {
            r = shutdown_signal() => {
                r?;
                log::info!("shutdown requested");
            }
            _ = alive.wait_for(|up| !*up) => log::error!("tracker gone, shutting down"),
        }
        peer.shutdown().await?;
        Ok::<_, anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
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
