//! Go-Back-N send side for one requesting peer.
//!
//! [`ArqSender`] holds up to [`WINDOW_SIZE`] unacknowledged units keyed by sequence number.
//! The window only slides past an acknowledged head; an ack for a later slot is recorded
//! but never moves the window on its own.
//!
//! This module only manages state; socket I/O and the retransmit deadline belong to the host.

use std::collections::VecDeque;
use std::io;

use crate::chunk::Chunk;
use crate::protocol::{next_seq, Datagram, PacketKind, WINDOW_SIZE};

/// Default retransmissions before a silent requester is presumed dead.
pub const DEFAULT_SENDER_RETRIES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderStatus {
    /// Streaming the requested file.
    Active,
    /// We do not hold the file; repeating FILE_NOT_FOUND until acknowledged or expired.
    NotFound,
    /// Shutting down; repeating END_ABNORMAL until acknowledged or expired.
    Terminate,
}

/// What the host should do after an ACK.
#[derive(Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// Not in the window or already acknowledged. Leave the timer as it is.
    Stale,
    /// A non-head slot was acknowledged. Send nothing; rearm the timer.
    Hold,
    /// The window slid. Send these and rearm the timer.
    Retransmit(Vec<Datagram>),
    /// END was acknowledged and nothing is left; drop the session.
    Finished,
}

/// What the host should do when the retransmit timer fires.
#[derive(Debug, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Send these and rearm the timer.
    Resend(Vec<Datagram>),
    /// Retries exhausted; drop the session.
    Expired,
}

#[derive(Debug)]
struct Slot {
    seq: u8,
    chunk: Chunk,
    acked: bool,
}

/// Send-side state for one requester address.
pub struct ArqSender<S> {
    status: SenderStatus,
    source: Option<S>,
    window: VecDeque<Slot>,
    next_seq: u8,
    end_loaded: bool,
    retries_left: u32,
    max_retries: u32,
}

impl<S> ArqSender<S>
where
    S: Iterator<Item = io::Result<Chunk>>,
{
    /// Start streaming from `source`: fill the window from seq 0 and return the first datagrams.
    pub fn open(source: S, max_retries: u32) -> io::Result<(Self, Vec<Datagram>)> {
        let mut s = Self::with_status(SenderStatus::Active, Some(source), max_retries);
        s.fill()?;
        let out = s.unacked();
        Ok((s, out))
    }

    /// Session for a file we do not hold. Returns the FILE_NOT_FOUND packet to send.
    pub fn not_found(max_retries: u32) -> (Self, Datagram) {
        let s = Self::with_status(SenderStatus::NotFound, None, max_retries);
        let d = s.control_packet();
        (s, d)
    }

    /// Session refused because we are shutting down. Returns the END_ABNORMAL packet to send.
    pub fn terminate(max_retries: u32) -> (Self, Datagram) {
        let s = Self::with_status(SenderStatus::Terminate, None, max_retries);
        let d = s.control_packet();
        (s, d)
    }

    fn with_status(status: SenderStatus, source: Option<S>, max_retries: u32) -> Self {
        Self {
            status,
            source,
            window: VecDeque::with_capacity(WINDOW_SIZE as usize),
            next_seq: 0,
            end_loaded: false,
            retries_left: max_retries,
            max_retries,
        }
    }

    pub fn status(&self) -> SenderStatus {
        self.status
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    /// Entries still in the window (acknowledged or not).
    pub fn in_window(&self) -> usize {
        self.window.len()
    }

    /// Sequence number at the left window edge.
    pub fn head_seq(&self) -> Option<u8> {
        self.window.front().map(|s| s.seq)
    }

    /// Process an ACK for `seq`.
    pub fn on_ack(&mut self, seq: u8) -> io::Result<AckOutcome> {
        if self.status != SenderStatus::Active {
            return Ok(AckOutcome::Stale);
        }
        let Some(pos) = self.window.iter().position(|s| s.seq == seq) else {
            return Ok(AckOutcome::Stale);
        };
        if self.window[pos].acked {
            return Ok(AckOutcome::Stale);
        }
        self.window[pos].acked = true;
        self.retries_left = self.max_retries;
        if pos != 0 {
            return Ok(AckOutcome::Hold);
        }
        while self.window.front().is_some_and(|s| s.acked) {
            self.window.pop_front();
        }
        self.fill()?;
        if self.window.is_empty() {
            self.source = None;
            return Ok(AckOutcome::Finished);
        }
        Ok(AckOutcome::Retransmit(self.unacked()))
    }

    /// Retransmit timer fired.
    pub fn on_timeout(&mut self) -> TimeoutOutcome {
        let Some(left) = self.retries_left.checked_sub(1) else {
            log::debug!("sender {:?} expired after {} retries", self.status, self.max_retries);
            return TimeoutOutcome::Expired;
        };
        self.retries_left = left;
        match self.status {
            SenderStatus::NotFound | SenderStatus::Terminate => {
                TimeoutOutcome::Resend(vec![self.control_packet()])
            }
            SenderStatus::Active if self.window.is_empty() => TimeoutOutcome::Expired,
            SenderStatus::Active => TimeoutOutcome::Resend(self.unacked()),
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        while self.window.len() < WINDOW_SIZE as usize && !self.end_loaded {
            let next = match self.source.as_mut() {
                Some(src) => src.next(),
                None => None,
            };
            match next {
                Some(Ok(chunk)) => {
                    if chunk.kind == PacketKind::End {
                        self.end_loaded = true;
                    }
                    self.window.push_back(Slot {
                        seq: self.next_seq,
                        chunk,
                        acked: false,
                    });
                    self.next_seq = next_seq(self.next_seq);
                }
                Some(Err(e)) => return Err(e),
                None => self.end_loaded = true,
            }
        }
        Ok(())
    }

    fn unacked(&self) -> Vec<Datagram> {
        self.window
            .iter()
            .filter(|s| !s.acked)
            .map(|s| Datagram::new(s.seq, s.chunk.kind, s.chunk.payload.clone()))
            .collect()
    }

    fn control_packet(&self) -> Datagram {
        let kind = match self.status {
            SenderStatus::NotFound => PacketKind::FileNotFound,
            _ => PacketKind::EndAbnormal,
        };
        Datagram::control(0, kind)
    }
}
