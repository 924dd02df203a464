//! One control-channel connection: AWAIT_INIT -> ACTIVE -> CLOSED.
//!
//! Every receive races the shutdown token; once shutdown is set the next event answers `HB-`,
//! purges the registration and closes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use seed_core::protocol::BUFFER_SIZE;
use seed_core::wire::parse_request;
use seed_core::{
    ClientRecord, Frame, LineFramer, Registry, RegistryError, TrackerReply, TrackerRequest,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;

/// Registry shared by every session: read lock for lookups, write lock for register/remove/log.
pub type SharedRegistry = Arc<RwLock<Registry>>;

/// Timeouts and retry bounds for one session.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub init_timeout: Duration,
    pub init_retries: u32,
    pub idle_cycle: Duration,
    pub idle_cycles: u32,
}

enum Event {
    Line(String),
    /// Over-long or undecodable line.
    Garbled,
    Timeout,
    Closed,
    Shutdown,
}

/// Drive one connection to completion. Never fails: I/O errors close the session.
pub async fn run_session<R, W>(
    reader: R,
    writer: W,
    peer: SocketAddr,
    registry: SharedRegistry,
    limits: SessionLimits,
    shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut session = TrackerSession {
        reader,
        framer: LineFramer::new(BUFFER_SIZE),
        buf: vec![0u8; BUFFER_SIZE],
        writer,
        peer,
        registry,
        limits,
        shutdown,
    };
    let Some(client_id) = session.await_init().await else {
        log::debug!("{}: closed before registration", peer);
        return;
    };
    session.active(&client_id).await;
    if session.registry.write().await.remove(&client_id).is_some() {
        log::info!("{}: client {} removed", peer, client_id);
    }
}

struct TrackerSession<R, W> {
    reader: R,
    framer: LineFramer,
    buf: Vec<u8>,
    writer: W,
    peer: SocketAddr,
    registry: SharedRegistry,
    limits: SessionLimits,
    shutdown: watch::Receiver<bool>,
}

impl<R, W> TrackerSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Returns the registered client id, or `None` if the connection closed without registering.
    async fn await_init(&mut self) -> Option<String> {
        let mut failures = 0u32;
        while failures < self.limits.init_retries {
            match self.next_event(self.limits.init_timeout).await {
                Event::Shutdown => {
                    let _ = self.reply(TrackerReply::HeartbeatRefused).await;
                    return None;
                }
                Event::Closed => return None,
                Event::Timeout => failures += 1,
                Event::Garbled => {
                    log::debug!("{}: garbled INIT line", self.peer);
                    failures += 1;
                    self.reply(TrackerReply::Malformed).await.ok()?;
                }
                Event::Line(line) => match parse_request(&line) {
                    Ok(TrackerRequest::Init {
                        client_id,
                        bitmap,
                        service_port,
                    }) => return self.register(client_id, bitmap, service_port).await,
                    Ok(_) | Err(_) => {
                        log::debug!("{}: malformed INIT {:?}", self.peer, line);
                        failures += 1;
                        self.reply(TrackerReply::Malformed).await.ok()?;
                    }
                },
            }
        }
        log::warn!("{}: no valid INIT after {} attempts", self.peer, failures);
        None
    }

    async fn register(
        &mut self,
        client_id: String,
        bitmap: seed_core::FileBitmap,
        service_port: u16,
    ) -> Option<String> {
        if *self.shutdown.borrow() {
            let _ = self.reply(TrackerReply::HeartbeatRefused).await;
            return None;
        }
        let record = ClientRecord {
            client_id: client_id.clone(),
            bitmap,
            service_port,
        };
        let registered = self.registry.write().await.register(record);
        match registered {
            Ok(()) => {
                log::info!(
                    "{}: registered {} on port {}",
                    self.peer,
                    client_id,
                    service_port
                );
                if self.reply(TrackerReply::Success).await.is_err() {
                    self.registry.write().await.remove(&client_id);
                    return None;
                }
                Some(client_id)
            }
            Err(RegistryError::Duplicate(id)) => {
                log::warn!("{}: duplicate client id {}", self.peer, id);
                let _ = self.reply(TrackerReply::HeartbeatRefused).await;
                None
            }
        }
    }

    async fn active(&mut self, client_id: &str) {
        let mut idle = 0u32;
        loop {
            let line = match self.next_event(self.limits.idle_cycle).await {
                Event::Shutdown => {
                    let _ = self.reply(TrackerReply::HeartbeatRefused).await;
                    return;
                }
                Event::Closed => return,
                Event::Timeout => {
                    idle += 1;
                    if idle >= self.limits.idle_cycles {
                        log::warn!("{}: {} silent for {} cycles, presumed dead", self.peer, client_id, idle);
                        return;
                    }
                    continue;
                }
                Event::Garbled => {
                    log::debug!("{}: garbled line from {}", self.peer, client_id);
                    idle = 0;
                    if self.reply(TrackerReply::Malformed).await.is_err() {
                        return;
                    }
                    continue;
                }
                Event::Line(line) => line,
            };
            idle = 0;
            let reply = match parse_request(&line) {
                Ok(TrackerRequest::Heartbeat) => TrackerReply::HeartbeatOk,
                Ok(TrackerRequest::File { file_id }) => {
                    let holder = match u32::try_from(file_id) {
                        Ok(id) => self.registry.read().await.lookup(id),
                        Err(_) => None,
                    };
                    match holder {
                        Some(holder) => TrackerReply::Port {
                            port: holder.port,
                            holder: holder.client_id,
                        },
                        None => TrackerReply::NoHolder,
                    }
                }
                Ok(TrackerRequest::Log {
                    file_id,
                    client_id: holder,
                }) => {
                    self.registry
                        .write()
                        .await
                        .record_completion(file_id, &holder);
                    log::info!("{} downloaded file {} from {}", client_id, file_id, holder);
                    TrackerReply::LogDone
                }
                Ok(TrackerRequest::Quit) => {
                    log::info!("{}: {} quit", self.peer, client_id);
                    return;
                }
                Ok(TrackerRequest::Init { .. }) | Err(_) => {
                    log::debug!("{}: unrecognized {:?}", self.peer, line);
                    TrackerReply::Malformed
                }
            };
            if self.reply(reply).await.is_err() {
                return;
            }
        }
    }

    /// Next line, garbled line, timeout, close or shutdown. Bytes that trickle in without
    /// completing a line do not extend `wait`.
    async fn next_event(&mut self, wait: Duration) -> Event {
        let deadline = Instant::now() + wait;
        loop {
            if *self.shutdown.borrow() {
                return Event::Shutdown;
            }
            match self.framer.pop_frame() {
                Some(Frame::Line(line)) => return Event::Line(line),
                Some(Frame::Invalid) => return Event::Garbled,
                None => {}
            }
            tokio::select! {
                biased;
                _ = cancelled(&mut self.shutdown) => return Event::Shutdown,
                r = tokio::time::timeout_at(deadline, self.reader.read(&mut self.buf)) => match r {
                    Err(_) => return Event::Timeout,
                    Ok(Ok(0)) => return Event::Closed,
                    Ok(Ok(n)) => self.framer.push(&self.buf[..n]),
                    Ok(Err(e)) => {
                        log::debug!("{}: read failed: {}", self.peer, e);
                        return Event::Closed;
                    }
                },
            }
        }
    }

    async fn reply(&mut self, reply: TrackerReply) -> io::Result<()> {
        let line = format!("{}\n", reply);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }
}

/// Resolves once shutdown is requested (or the token's owner is gone).
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
