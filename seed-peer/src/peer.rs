//! A running peer: catalog, UDP listener, tracker registration and the fetch flow.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use seed_core::{parse_bitmap, MessageError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::catalog::{Catalog, CatalogError};
use crate::config::PeerConfig;
use crate::listener::PeerListener;
use crate::requester::{PeerRequester, TransferError, TransferOutcome};
use crate::tracker_client::{TrackerClient, TrackerClientError};

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("invalid file bitmap: {0}")]
    Bitmap(MessageError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("binding {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error(transparent)]
    Tracker(#[from] TrackerClientError),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("file id {0} out of range")]
    BadFileId(u32),
    #[error(transparent)]
    Tracker(#[from] TrackerClientError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Downloaded and verified; the tracker was told.
    Downloaded {
        holder: String,
        transfer: TransferOutcome,
    },
    /// `PORT:-1:-1`: nobody holds it. No P2P session was opened.
    NoHolder,
    /// The tracker pointed back at us.
    SelfHeld,
}

pub struct Peer {
    client_id: String,
    catalog: Arc<Catalog>,
    tracker: TrackerClient,
    requester: PeerRequester,
    service_port: u16,
    stop: watch::Sender<bool>,
    listener: JoinHandle<io::Result<()>>,
}

impl Peer {
    /// Check local files, bind the service socket, then register with the tracker.
    pub async fn start(config: PeerConfig) -> Result<Self, PeerError> {
        let bitmap = parse_bitmap(&config.file_bitmap).map_err(PeerError::Bitmap)?;
        let catalog = Arc::new(Catalog::new(
            &config.share_dir,
            &config.download_dir(),
            bitmap,
        )?);
        let addr = config.service_addr();
        let listener = PeerListener::bind(addr, catalog.clone(), config.arq.clone())
            .await
            .map_err(|source| PeerError::Bind { addr, source })?;
        let service_port = listener
            .local_addr()
            .map_err(|source| PeerError::Bind { addr, source })?
            .port();

        let tracker = TrackerClient::connect(
            config.tracker,
            &config.client_id,
            catalog.bitmap(),
            service_port,
            config.control_settings(),
        )
        .await?;

        let (stop, stop_rx) = watch::channel(false);
        let listener = tokio::spawn(listener.run(stop_rx));
        let requester = PeerRequester::new(config.arq.clone(), tracker.alive());
        Ok(Self {
            client_id: config.client_id,
            catalog,
            tracker,
            requester,
            service_port,
            stop,
            listener,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn service_port(&self) -> u16 {
        self.service_port
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn tracker(&self) -> &TrackerClient {
        &self.tracker
    }

    /// Look the file up, download it from the holder, verify it and report the completion.
    pub async fn fetch(&self, file_id: u32) -> Result<FetchOutcome, FetchError> {
        let id = u8::try_from(file_id).map_err(|_| FetchError::BadFileId(file_id))?;
        let Some(holder) = self.tracker.lookup(file_id).await? else {
            log::info!("no peer holds file {}", file_id);
            return Ok(FetchOutcome::NoHolder);
        };
        if holder.port == self.service_port || holder.client_id == self.client_id {
            log::info!("file {} is served by this peer", file_id);
            return Ok(FetchOutcome::SelfHeld);
        }
        let addr = SocketAddr::new(self.tracker.tracker_ip(), holder.port);
        let transfer = self
            .requester
            .fetch_from(addr, id, &self.catalog.download_path(id))
            .await?;
        if let Err(e) = self
            .tracker
            .report_completion(file_id, &holder.client_id)
            .await
        {
            log::warn!("could not report download of file {}: {}", file_id, e);
        }
        Ok(FetchOutcome::Downloaded {
            holder: holder.client_id,
            transfer,
        })
    }

    /// Leave the tracker, refuse new requests, and wait for in-flight transfers to drain.
    pub async fn shutdown(self) -> io::Result<()> {
        self.tracker.quit().await;
        let _ = self.stop.send(true);
        self.listener
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}
