//! Serving side: one UDP socket, one receive loop, one task per requesting address.
//!
//! The receive loop only decodes and routes. Each session task owns its [`ArqSender`] and its
//! retransmit deadline, so acks and timer expiries for one requester are handled by a single
//! writer. The address table is locked only to insert, look up or remove a route.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use seed_core::protocol::BUFFER_SIZE;
use seed_core::{
    decode_datagram, encode_datagram, AckOutcome, ArqConfig, ArqSender, ChunkReader, Datagram,
    PacketKind, TimeoutOutcome,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::catalog::Catalog;

const INBOX_DEPTH: usize = 64;
const DRAIN_POLL: Duration = Duration::from_millis(50);

struct Route {
    id: u64,
    inbox: mpsc::Sender<Datagram>,
}

type SessionTable = Arc<Mutex<HashMap<SocketAddr, Route>>>;

/// What a new session will do.
#[derive(Debug, Clone, Copy)]
enum Plan {
    Serve(u8),
    NotFound(u8),
    Terminate,
}

/// UDP file server.
pub struct PeerListener {
    socket: Arc<UdpSocket>,
    catalog: Arc<Catalog>,
    arq: ArqConfig,
    sessions: SessionTable,
    next_id: u64,
}

impl PeerListener {
    pub async fn bind(addr: SocketAddr, catalog: Arc<Catalog>, arq: ArqConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        log::info!("serving files on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            catalog,
            arq,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive and route until shutdown. After shutdown, new requests are refused with
    /// END_ABNORMAL and the loop returns once every session has finished.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut draining = false;
        loop {
            if draining && self.sessions.lock().await.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = cancelled(&mut shutdown), if !draining => {
                    draining = true;
                    log::info!(
                        "listener draining {} sessions",
                        self.sessions.lock().await.len()
                    );
                }
                _ = tokio::time::sleep(DRAIN_POLL), if draining => {}
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, from)) => self.route(&buf[..n], from, draining).await,
                    Err(e) => log::debug!("recv failed: {}", e),
                },
            }
        }
        log::info!("listener stopped");
        Ok(())
    }

    async fn route(&mut self, bytes: &[u8], from: SocketAddr, draining: bool) {
        let d = match decode_datagram(bytes) {
            Ok(d) => d,
            Err(e) => {
                log::debug!("dropping datagram from {}: {}", from, e);
                return;
            }
        };
        let mut table = self.sessions.lock().await;
        let d = match table.get(&from) {
            Some(route) => match route.inbox.try_send(d) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    log::debug!("inbox for {} full, dropping datagram", from);
                    return;
                }
                Err(TrySendError::Closed(d)) => {
                    table.remove(&from);
                    d
                }
            },
            None => d,
        };

        let plan = if d.is_request() {
            let file_id = d.payload[0];
            if draining {
                Plan::Terminate
            } else if self.catalog.contains(file_id) {
                Plan::Serve(file_id)
            } else {
                Plan::NotFound(file_id)
            }
        } else if d.kind == PacketKind::Ack {
            // Acks for a session we no longer know: tell the requester to give up.
            Plan::Terminate
        } else {
            log::debug!("ignoring {:?} from {} with no session", d.kind, from);
            return;
        };
        log::info!("new session for {}: {:?}", from, plan);

        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        let id = self.next_id;
        self.next_id += 1;
        table.insert(from, Route { id, inbox: tx });
        drop(table);

        let session = Session {
            socket: self.socket.clone(),
            peer: from,
            arq: self.arq.clone(),
            table: self.sessions.clone(),
            id,
        };
        let catalog = self.catalog.clone();
        tokio::spawn(session.run(plan, catalog, rx));
    }
}

struct Session {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    arq: ArqConfig,
    table: SessionTable,
    id: u64,
}

impl Session {
    async fn run(self, plan: Plan, catalog: Arc<Catalog>, inbox: mpsc::Receiver<Datagram>) {
        let max = self.arq.sender_retries;
        let opened = match plan {
            Plan::Serve(file_id) => {
                let chunk_size = self.arq.chunk_size;
                let reader = tokio::task::spawn_blocking(move || {
                    catalog.open_reader(file_id, chunk_size)
                })
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
                .and_then(|r| r)
                .and_then(|reader| ArqSender::open(reader, max));
                match reader {
                    Ok(opened) => opened,
                    Err(e) => {
                        log::error!("cannot serve file {} to {}: {}", file_id, self.peer, e);
                        let (s, d) = ArqSender::terminate(max);
                        (s, vec![d])
                    }
                }
            }
            Plan::NotFound(file_id) => {
                log::warn!("{} asked for file {}, which we do not hold", self.peer, file_id);
                let (s, d) = ArqSender::not_found(max);
                (s, vec![d])
            }
            Plan::Terminate => {
                let (s, d) = ArqSender::terminate(max);
                (s, vec![d])
            }
        };
        let (sender, first) = opened;
        self.drive(sender, first, inbox).await;

        let mut table = self.table.lock().await;
        if table.get(&self.peer).is_some_and(|r| r.id == self.id) {
            table.remove(&self.peer);
        }
    }

    async fn drive(
        &self,
        mut sender: ArqSender<ChunkReader>,
        first: Vec<Datagram>,
        mut inbox: mpsc::Receiver<Datagram>,
    ) {
        let timeout = self.arq.retransmit_timeout();
        self.send_burst(&first).await;
        let mut deadline = Instant::now() + timeout;
        loop {
            tokio::select! {
                msg = inbox.recv() => {
                    let Some(d) = msg else { return };
                    match d.kind {
                        PacketKind::Ack => match sender.on_ack(d.seq) {
                            Ok(AckOutcome::Stale) => {}
                            Ok(AckOutcome::Hold) => deadline = Instant::now() + timeout,
                            Ok(AckOutcome::Retransmit(out)) => {
                                self.send_burst(&out).await;
                                deadline = Instant::now() + timeout;
                            }
                            Ok(AckOutcome::Finished) => {
                                log::info!("transfer to {} complete", self.peer);
                                return;
                            }
                            Err(e) => {
                                log::error!("read failed while serving {}: {}", self.peer, e);
                                self.send_burst(&[Datagram::control(0, PacketKind::EndAbnormal)])
                                    .await;
                                return;
                            }
                        },
                        PacketKind::EndAck => {
                            log::info!("{} closed the session ({:?})", self.peer, sender.status());
                            return;
                        }
                        other => log::debug!("ignoring {:?} from {}", other, self.peer),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => match sender.on_timeout() {
                    TimeoutOutcome::Resend(out) => {
                        log::warn!(
                            "no ack from {}, resending ({} retries left)",
                            self.peer,
                            sender.retries_left()
                        );
                        self.send_burst(&out).await;
                        deadline = Instant::now() + timeout;
                    }
                    TimeoutOutcome::Expired => {
                        log::warn!("{} declared dead", self.peer);
                        return;
                    }
                },
            }
        }
    }

    async fn send_burst(&self, datagrams: &[Datagram]) {
        let gap = self.arq.packet_gap();
        for (i, d) in datagrams.iter().enumerate() {
            if i > 0 && !gap.is_zero() {
                tokio::time::sleep(gap).await;
            }
            match encode_datagram(d) {
                Ok(bytes) => {
                    if let Err(e) = self.socket.send_to(&bytes, self.peer).await {
                        log::debug!("send to {} failed: {}", self.peer, e);
                    }
                }
                Err(e) => log::error!("cannot encode datagram for {}: {}", self.peer, e),
            }
        }
    }
}

async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
