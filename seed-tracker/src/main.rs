// Seed tracker daemon: registry and lookup service for peers.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use seed_tracker::{config, Tracker};

/// Peer registry and file lookup service.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Config file (TOML). Defaults to ~/.config/seed/tracker.toml or /etc/seed/tracker.toml.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Listen address, overriding the config file.
    #[arg(short, long)]
    bind: Option<SocketAddr>,
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
    let mut cfg = config::load(cli.config.as_deref()).context("loading config")?;
    if let Some(bind) = cli.bind {
        cfg.bind = bind;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let bind = cfg.bind;
        let tracker = Tracker::bind(cfg)
            .await
            .with_context(|| format!("binding {}", bind))?;
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let server = tokio::spawn(tracker.serve(stop_rx));
        shutdown_signal().await?;
        log::info!("shutdown requested");
        let _ = stop_tx.send(true);
        server.await??;
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
