//! Downloading side: one sequential request to one holder over a fresh UDP socket.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

use seed_core::integrity;
use seed_core::protocol::BUFFER_SIZE;
use seed_core::{
    decode_datagram, encode_datagram, AbortReason, ArqConfig, ArqReceiver, ChunkWriter, Datagram,
    ReceiveStatus,
};
use tokio::net::UdpSocket;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("holder does not have the file")]
    FileNotFound,
    #[error("holder aborted the transfer")]
    PeerAborted,
    #[error("holder stopped responding")]
    RetriesExhausted,
    #[error("tracker connection lost during transfer")]
    TrackerLost,
    #[error("received file does not match its digest")]
    HashMismatch,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<AbortReason> for TransferError {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::FileNotFound => TransferError::FileNotFound,
            AbortReason::PeerAborted => TransferError::PeerAborted,
            AbortReason::RetriesExhausted => TransferError::RetriesExhausted,
            AbortReason::TrackerLost => TransferError::TrackerLost,
        }
    }
}

/// A finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub path: PathBuf,
    pub bytes: u64,
    /// False only for an empty file, which carries no digest.
    pub verified: bool,
}

/// Fetches files from serving peers, one at a time.
pub struct PeerRequester {
    arq: ArqConfig,
    tracker_alive: watch::Receiver<bool>,
}

impl PeerRequester {
    /// `tracker_alive` turning `false` aborts any download in progress.
    pub fn new(arq: ArqConfig, tracker_alive: watch::Receiver<bool>) -> Self {
        Self { arq, tracker_alive }
    }

    /// Download `file_id` from `holder` into `dest`. Partial output is deleted on any failure.
    pub async fn fetch_from(
        &self,
        holder: SocketAddr,
        file_id: u8,
        dest: &Path,
    ) -> Result<TransferOutcome, TransferError> {
        let socket = UdpSocket::bind(unspecified_for(holder)).await?;
        socket.connect(holder).await?;
        let mut writer = ChunkWriter::create(dest)?;
        let mut receiver = ArqReceiver::new(file_id, self.arq.receiver_retries);
        let mut alive = self.tracker_alive.clone();
        let wait = self.arq.receive_timeout();
        let mut buf = vec![0u8; BUFFER_SIZE];

        log::info!("requesting file {} from {}", file_id, holder);
        send(&socket, &receiver.request()).await;
        let status = loop {
            let step = tokio::select! {
                biased;
                _ = tracker_lost(&mut alive) => receiver.on_tracker_lost(),
                received = tokio::time::timeout(wait, socket.recv(&mut buf)) => match received {
                    Err(_) => receiver.on_timeout(),
                    Ok(Ok(n)) => match decode_datagram(&buf[..n]) {
                        Ok(d) => receiver.on_datagram(&d),
                        Err(e) => {
                            log::debug!("dropping datagram from {}: {}", holder, e);
                            continue;
                        }
                    },
                    Ok(Err(e)) => {
                        // Typically ICMP unreachable; wait out the slot like a timeout.
                        log::debug!("recv from {} failed: {}", holder, e);
                        tokio::time::sleep(wait).await;
                        receiver.on_timeout()
                    }
                },
            };
            if let Some(reply) = &step.reply {
                send(&socket, reply).await;
            }
            for block in &step.deliver {
                if let Err(e) = writer.write_chunk(block) {
                    let _ = writer.discard();
                    return Err(e.into());
                }
            }
            if step.status != ReceiveStatus::Pending {
                break step.status;
            }
        };

        match status {
            ReceiveStatus::Aborted(reason) => {
                log::warn!("download of file {} from {} failed: {:?}", file_id, holder, reason);
                writer.discard()?;
                Err(reason.into())
            }
            _ => finalize(writer, receiver.expected_hash().map(str::to_string)).await,
        }
    }
}

async fn finalize(
    writer: ChunkWriter,
    expected: Option<String>,
) -> Result<TransferOutcome, TransferError> {
    let path = writer.finish()?;
    let bytes = std::fs::metadata(&path)?.len();
    let Some(expected) = expected else {
        log::info!("received empty file {}", path.display());
        return Ok(TransferOutcome {
            path,
            bytes,
            verified: false,
        });
    };
    let check = path.clone();
    let ok = tokio::task::spawn_blocking(move || integrity::verify_file(&expected, &check))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
    if !ok {
        log::error!("digest mismatch, deleting {}", path.display());
        std::fs::remove_file(&path)?;
        return Err(TransferError::HashMismatch);
    }
    log::info!("received {} ({} bytes, digest verified)", path.display(), bytes);
    Ok(TransferOutcome {
        path,
        bytes,
        verified: true,
    })
}

async fn send(socket: &UdpSocket, d: &Datagram) {
    match encode_datagram(d) {
        Ok(bytes) => {
            if let Err(e) = socket.send(&bytes).await {
                log::debug!("send failed: {}", e);
            }
        }
        Err(e) => log::error!("cannot encode datagram: {}", e),
    }
}

/// Resolves once the tracker is reported gone. Never resolves if nobody reports.
async fn tracker_lost(alive: &mut watch::Receiver<bool>) {
    let reported = alive.wait_for(|up| !*up).await.is_ok();
    if !reported {
        std::future::pending::<()>().await;
    }
}

fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}
