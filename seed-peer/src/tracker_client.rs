//! Peer side of the tracker control channel.
//!
//! One TCP connection, one line per message. Every request/reply exchange, the background
//! heartbeat included, holds the channel mutex for its full duration, so replies never interleave.
//! Loss of the tracker (closed socket, `HB-`, or a reply that never comes) flips the `alive` watch.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use seed_core::protocol::BUFFER_SIZE;
use seed_core::wire::parse_reply;
use seed_core::{FileBitmap, Frame, Holder, LineFramer, TrackerReply, TrackerRequest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum TrackerClientError {
    #[error("cannot reach tracker at {addr}: {source}")]
    Connect { addr: SocketAddr, source: io::Error },
    #[error("tracker refused registration (duplicate client id or shutting down)")]
    Refused,
    #[error("tracker rejected registration as malformed")]
    Malformed,
    #[error("tracker connection lost")]
    Lost,
    #[error("unexpected tracker reply {0:?}")]
    Unexpected(String),
}

/// Control-channel timing.
#[derive(Debug, Clone, Copy)]
pub struct ControlSettings {
    pub connect_retries: u32,
    pub connect_backoff: Duration,
    pub reply_timeout: Duration,
    pub reply_retries: u32,
    pub heartbeat: Duration,
}

struct Channel {
    reader: OwnedReadHalf,
    framer: LineFramer,
    buf: Vec<u8>,
    writer: OwnedWriteHalf,
}

enum Received {
    Frame(Frame),
    Timeout,
    Closed,
}

impl Channel {
    fn new(reader: OwnedReadHalf, writer: OwnedWriteHalf) -> Self {
        Self {
            reader,
            framer: LineFramer::new(BUFFER_SIZE),
            buf: vec![0u8; BUFFER_SIZE],
            writer,
        }
    }

    /// Next reply frame within `wait`.
    async fn receive(&mut self, wait: Duration) -> Received {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(frame) = self.framer.pop_frame() {
                return Received::Frame(frame);
            }
            match tokio::time::timeout_at(deadline, self.reader.read(&mut self.buf)).await {
                Err(_) => return Received::Timeout,
                Ok(Ok(0)) => return Received::Closed,
                Ok(Ok(n)) => self.framer.push(&self.buf[..n]),
                Ok(Err(e)) => {
                    log::debug!("tracker read failed: {}", e);
                    return Received::Closed;
                }
            }
        }
    }
}

struct Shared {
    channel: Mutex<Channel>,
    alive: watch::Sender<bool>,
    settings: ControlSettings,
}

impl Shared {
    /// Send one request and wait for its reply. Any failure marks the tracker lost.
    async fn exchange(&self, request: &TrackerRequest) -> Result<TrackerReply, TrackerClientError> {
        if !*self.alive.borrow() {
            return Err(TrackerClientError::Lost);
        }
        let mut ch = self.channel.lock().await;
        let result = exchange_on(&mut ch, request, &self.settings).await;
        if matches!(
            result,
            Err(TrackerClientError::Lost) | Ok(TrackerReply::HeartbeatRefused)
        ) {
            self.mark_lost();
        }
        result
    }

    fn mark_lost(&self) {
        if self.alive.send_replace(false) {
            log::warn!("tracker connection lost");
        }
    }
}

async fn exchange_on(
    ch: &mut Channel,
    request: &TrackerRequest,
    settings: &ControlSettings,
) -> Result<TrackerReply, TrackerClientError> {
    let line = format!("{}\n", request);
    if let Err(e) = write_line(&mut ch.writer, &line).await {
        log::debug!("tracker write failed: {}", e);
        return Err(TrackerClientError::Lost);
    }
    let mut timeouts = 0u32;
    loop {
        match ch.receive(settings.reply_timeout).await {
            Received::Frame(Frame::Line(reply)) => {
                return parse_reply(&reply).map_err(|_| TrackerClientError::Unexpected(reply));
            }
            Received::Frame(Frame::Invalid) => {
                return Err(TrackerClientError::Unexpected("<garbled line>".to_string()));
            }
            Received::Closed => return Err(TrackerClientError::Lost),
            Received::Timeout => {
                timeouts += 1;
                log::warn!("tracker reply timed out ({}/{})", timeouts, settings.reply_retries);
                if timeouts > settings.reply_retries {
                    return Err(TrackerClientError::Lost);
                }
            }
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Registered control channel to the tracker.
pub struct TrackerClient {
    shared: Arc<Shared>,
    tracker: SocketAddr,
    heartbeat: JoinHandle<()>,
}

impl TrackerClient {
    /// Connect (with retries), register with INIT, and start heartbeating.
    pub async fn connect(
        tracker: SocketAddr,
        client_id: &str,
        bitmap: &FileBitmap,
        service_port: u16,
        settings: ControlSettings,
    ) -> Result<Self, TrackerClientError> {
        let stream = connect_with_retries(tracker, &settings).await?;
        let tracker = stream.peer_addr().unwrap_or(tracker);
        let (r, w) = stream.into_split();
        let mut channel = Channel::new(r, w);
        let init = TrackerRequest::Init {
            client_id: client_id.to_string(),
            bitmap: bitmap.clone(),
            service_port,
        };
        match exchange_on(&mut channel, &init, &settings).await? {
            TrackerReply::Success => {}
            TrackerReply::HeartbeatRefused => return Err(TrackerClientError::Refused),
            TrackerReply::Malformed => return Err(TrackerClientError::Malformed),
            other => return Err(TrackerClientError::Unexpected(other.to_string())),
        }
        log::info!("registered with tracker {} as {}", tracker, client_id);

        let (alive, _) = watch::channel(true);
        let shared = Arc::new(Shared {
            channel: Mutex::new(channel),
            alive,
            settings,
        });
        let heartbeat = tokio::spawn(heartbeat(shared.clone()));
        Ok(Self {
            shared,
            tracker,
            heartbeat,
        })
    }

    /// Host that holders are reached on: peers share the tracker's host.
    pub fn tracker_ip(&self) -> IpAddr {
        self.tracker.ip()
    }

    pub fn is_alive(&self) -> bool {
        *self.shared.alive.borrow()
    }

    /// Watch that turns `false` once the tracker is gone.
    pub fn alive(&self) -> watch::Receiver<bool> {
        self.shared.alive.subscribe()
    }

    /// `FILE:<id>`: the oldest registered holder, or `None` for `PORT:-1:-1`.
    pub async fn lookup(&self, file_id: u32) -> Result<Option<Holder>, TrackerClientError> {
        let request = TrackerRequest::File {
            file_id: file_id.into(),
        };
        match self.shared.exchange(&request).await? {
            TrackerReply::Port { port, holder } => Ok(Some(Holder {
                client_id: holder,
                port,
            })),
            TrackerReply::NoHolder => Ok(None),
            TrackerReply::HeartbeatRefused => Err(TrackerClientError::Lost),
            other => Err(TrackerClientError::Unexpected(other.to_string())),
        }
    }

    /// `LOG:<id>:<holder>` after a verified download.
    pub async fn report_completion(
        &self,
        file_id: u32,
        holder: &str,
    ) -> Result<(), TrackerClientError> {
        let request = TrackerRequest::Log {
            file_id,
            client_id: holder.to_string(),
        };
        match self.shared.exchange(&request).await? {
            TrackerReply::LogDone => Ok(()),
            TrackerReply::HeartbeatRefused => Err(TrackerClientError::Lost),
            other => Err(TrackerClientError::Unexpected(other.to_string())),
        }
    }

    /// Stop heartbeating and send `QUIT`. Best effort: the tracker may already be gone.
    pub async fn quit(self) {
        self.heartbeat.abort();
        let mut ch = self.shared.channel.lock().await;
        if *self.shared.alive.borrow() {
            if let Err(e) = write_line(&mut ch.writer, "QUIT\n").await {
                log::debug!("sending QUIT failed: {}", e);
            }
            let _ = ch.writer.shutdown().await;
        }
        self.shared.alive.send_replace(false);
        log::info!("left tracker {}", self.tracker);
    }
}

impl Drop for TrackerClient {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

async fn connect_with_retries(
    addr: SocketAddr,
    settings: &ControlSettings,
) -> Result<TcpStream, TrackerClientError> {
    let mut attempt = 1;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(source) if attempt >= settings.connect_retries => {
                return Err(TrackerClientError::Connect { addr, source });
            }
            Err(e) => {
                log::warn!("tracker {} unreachable (attempt {}): {}", addr, attempt, e);
                attempt += 1;
                tokio::time::sleep(settings.connect_backoff).await;
            }
        }
    }
}

async fn heartbeat(shared: Arc<Shared>) {
    let mut tick = tokio::time::interval(shared.settings.heartbeat);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        tick.tick().await;
        match shared.exchange(&TrackerRequest::Heartbeat).await {
            Ok(TrackerReply::HeartbeatOk) => log::debug!("heartbeat acknowledged"),
            Ok(TrackerReply::HeartbeatRefused) => {
                log::info!("tracker is shutting down");
                return;
            }
            Ok(other) => {
                log::error!("unexpected heartbeat reply {}", other);
                shared.mark_lost();
                return;
            }
            Err(e) => {
                log::error!("heartbeat failed: {}", e);
                shared.mark_lost();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seed_core::parse_bitmap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn settings() -> ControlSettings {
        ControlSettings {
            connect_retries: 1,
            connect_backoff: Duration::from_millis(10),
            reply_timeout: Duration::from_secs(2),
            reply_retries: 0,
            heartbeat: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn endless_reply_line_is_rejected_without_its_newline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tracker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(&vec![b'x'; 64 * 1024]).await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let bitmap = parse_bitmap("01").unwrap();
        let result = TrackerClient::connect(addr, "A", &bitmap, 9000, settings()).await;
        match result {
            Err(TrackerClientError::Unexpected(_)) => {}
            Err(e) => panic!("wrong error: {}", e),
            Ok(_) => panic!("registered against a garbled reply"),
        }
        tracker.abort();
    }

    #[tokio::test]
    async fn registration_succeeds_on_success_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tracker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"INIT:A:01:9000"));
            stream.write_all(b"Succ").await.unwrap();
            stream.write_all(b"ess!\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let bitmap = parse_bitmap("01").unwrap();
        let client = TrackerClient::connect(addr, "A", &bitmap, 9000, settings())
            .await
            .unwrap_or_else(|e| panic!("connect failed: {}", e));
        assert!(client.is_alive());
        tracker.abort();
    }
}
