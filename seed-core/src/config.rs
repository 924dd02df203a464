//! Transfer tunables shared by the serving and downloading sides.

use serde::Deserialize;
use std::time::Duration;

use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::receiver::DEFAULT_RECEIVER_RETRIES;
use crate::sender::DEFAULT_SENDER_RETRIES;

/// ARQ timing and retry settings. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArqConfig {
    /// Sender retransmit timer (default 1000).
    #[serde(default = "default_retransmit_ms")]
    pub retransmit_ms: u64,
    /// Retransmissions before the sender drops a silent requester (default 10).
    #[serde(default = "default_sender_retries")]
    pub sender_retries: u32,
    /// Receiver wait per datagram (default 400).
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    /// Receive timeouts tolerated before a download is abandoned (default 10).
    #[serde(default = "default_receiver_retries")]
    pub receiver_retries: u32,
    /// Pause between consecutive datagrams of one burst (default 2).
    #[serde(default = "default_packet_gap_ms")]
    pub packet_gap_ms: u64,
    /// File block size in bytes, clamped to what fits in one datagram.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_retransmit_ms() -> u64 {
    1000
}
fn default_sender_retries() -> u32 {
    DEFAULT_SENDER_RETRIES
}
fn default_receive_timeout_ms() -> u64 {
    400
}
fn default_receiver_retries() -> u32 {
    DEFAULT_RECEIVER_RETRIES
}
fn default_packet_gap_ms() -> u64 {
    2
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            retransmit_ms: default_retransmit_ms(),
            sender_retries: default_sender_retries(),
            receive_timeout_ms: default_receive_timeout_ms(),
            receiver_retries: default_receiver_retries(),
            packet_gap_ms: default_packet_gap_ms(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl ArqConfig {
    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn packet_gap(&self) -> Duration {
        Duration::from_millis(self.packet_gap_ms)
    }
}
