//! Tracker accept loop: one session task per connection, periodic reaping, drain on shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use seed_core::Registry;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::config::TrackerConfig;
use crate::session::{cancelled, run_session, SharedRegistry};

/// A bound tracker, ready to serve.
pub struct Tracker {
    listener: TcpListener,
    registry: SharedRegistry,
    config: TrackerConfig,
}

impl Tracker {
    /// Bind the control channel and write the identity file.
    pub async fn bind(config: TrackerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        let addr = listener.local_addr()?;
        if let Some(path) = &config.identity_file {
            std::fs::write(path, format!("tracker {}\n", addr))?;
        }
        log::info!("tracker listening on {}", addr);
        Ok(Self {
            listener,
            registry: Arc::new(RwLock::new(Registry::new())),
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Accept until shutdown, then stop accepting and wait for every session to close.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let limits = self.config.session_limits();
        let mut sessions: Vec<JoinHandle<()>> = Vec::new();
        let mut reaper = tokio::time::interval(self.config.reap_interval());
        reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancelled(&mut shutdown) => break,
                _ = reaper.tick() => {
                    let before = sessions.len();
                    sessions.retain(|h| !h.is_finished());
                    if sessions.len() != before {
                        log::debug!("reaped {} finished sessions", before - sessions.len());
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        log::debug!("connection from {}", peer);
                        let (reader, writer) = stream.into_split();
                        sessions.push(tokio::spawn(run_session(
                            reader,
                            writer,
                            peer,
                            self.registry.clone(),
                            limits,
                            shutdown.clone(),
                        )));
                    }
                    Err(e) => log::warn!("accept failed: {}", e),
                },
            }
        }

        drop(self.listener);
        log::info!("tracker shutting down, closing {} sessions", sessions.len());
        for handle in sessions {
            if let Err(e) = handle.await {
                log::error!("session task failed: {}", e);
            }
        }
        Ok(())
    }
}
