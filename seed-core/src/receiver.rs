//! Go-Back-N receive side for one download.
//!
//! [`ArqReceiver`] expects the two-slot window `[head, head+1]`. A datagram at the head is
//! accepted and the window advances; one at the second slot is buffered once and acknowledged
//! without advancing; anything else is acknowledged and dropped so the sender keeps sliding.
//! The first accepted unit is the file digest, everything after it is file content.
//!
//! No I/O here: the host sends `reply`, appends `deliver` to the output file and acts on `status`.

use crate::protocol::{next_seq, Datagram, PacketKind};

/// Default receive timeouts tolerated before giving up on the serving peer.
pub const DEFAULT_RECEIVER_RETRIES: u32 = 10;

/// Why a download was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The addressed peer does not hold the file.
    FileNotFound,
    /// The serving peer sent END_ABNORMAL.
    PeerAborted,
    /// Receive timeouts exhausted.
    RetriesExhausted,
    /// The tracker control channel went away mid-transfer.
    TrackerLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    Pending,
    Complete,
    Aborted(AbortReason),
}

/// Actions for the host after one event.
#[derive(Debug, PartialEq, Eq)]
pub struct Step {
    /// Datagram to send back to the serving peer, if any.
    pub reply: Option<Datagram>,
    /// Blocks to append to the output, in order.
    pub deliver: Vec<Vec<u8>>,
    pub status: ReceiveStatus,
}

impl Step {
    fn pending(reply: Option<Datagram>) -> Self {
        Self {
            reply,
            deliver: Vec::new(),
            status: ReceiveStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Request sent, nothing heard yet.
    Requested,
    /// Waiting for the digest at the head slot.
    Digest,
    Payload,
    Done,
}

/// Receive-side state for one download from one serving peer.
#[derive(Debug)]
pub struct ArqReceiver {
    file_id: u8,
    phase: Phase,
    head: u8,
    buffered: Option<Vec<u8>>,
    buffered_end: bool,
    digest: Option<String>,
    retries_left: u32,
    max_retries: u32,
}

impl ArqReceiver {
    pub fn new(file_id: u8, max_retries: u32) -> Self {
        Self {
            file_id,
            phase: Phase::Requested,
            head: 0,
            buffered: None,
            buffered_end: false,
            digest: None,
            retries_left: max_retries,
            max_retries,
        }
    }

    /// The request datagram that opens the session.
    pub fn request(&self) -> Datagram {
        Datagram::request(self.file_id)
    }

    /// Digest received from the peer. `None` until received, and for an empty file.
    pub fn expected_hash(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    /// Process one datagram from the serving peer.
    pub fn on_datagram(&mut self, d: &Datagram) -> Step {
        if self.phase == Phase::Done {
            return Step::pending(None);
        }
        if self.phase == Phase::Requested {
            self.phase = Phase::Digest;
        }
        self.retries_left = self.max_retries;
        match d.kind {
            PacketKind::FileNotFound => return self.abort(AbortReason::FileNotFound, d.seq),
            PacketKind::EndAbnormal => return self.abort(AbortReason::PeerAborted, d.seq),
            PacketKind::Ack | PacketKind::EndAck => return Step::pending(None),
            PacketKind::Data | PacketKind::End => {}
        }
        if d.seq == self.head {
            self.on_head(d)
        } else if d.seq == next_seq(self.head) {
            if self.buffered.is_none() {
                self.buffered = Some(d.payload.clone());
                self.buffered_end = d.kind == PacketKind::End;
            }
            Step::pending(Some(Datagram::ack(d.seq)))
        } else {
            Step::pending(Some(Datagram::ack(d.seq)))
        }
    }

    fn on_head(&mut self, d: &Datagram) -> Step {
        let reply = Some(Datagram::ack(d.seq));
        let mut deliver = Vec::new();
        let mut end = false;
        match self.phase {
            Phase::Digest if d.kind == PacketKind::End => {
                // Empty file: no digest, nothing to write.
                self.phase = Phase::Done;
                return Step {
                    reply,
                    deliver,
                    status: ReceiveStatus::Complete,
                };
            }
            Phase::Digest => {
                self.digest = Some(String::from_utf8_lossy(&d.payload).into_owned());
                self.phase = Phase::Payload;
            }
            _ => {
                if !d.payload.is_empty() {
                    deliver.push(d.payload.clone());
                }
                end = d.kind == PacketKind::End;
            }
        }
        self.head = next_seq(self.head);
        if let Some(block) = self.buffered.take() {
            if !block.is_empty() {
                deliver.push(block);
            }
            end |= self.buffered_end;
            self.buffered_end = false;
            self.head = next_seq(self.head);
        }
        let status = if end {
            self.phase = Phase::Done;
            ReceiveStatus::Complete
        } else {
            ReceiveStatus::Pending
        };
        Step {
            reply,
            deliver,
            status,
        }
    }

    /// A receive timed out. Before anything is heard the request is resent.
    pub fn on_timeout(&mut self) -> Step {
        if self.phase == Phase::Done {
            return Step::pending(None);
        }
        match self.retries_left.checked_sub(1) {
            Some(left) => {
                self.retries_left = left;
                let reply = (self.phase == Phase::Requested).then(|| self.request());
                Step::pending(reply)
            }
            None => self.abort(AbortReason::RetriesExhausted, self.head),
        }
    }

    /// The tracker connection was lost; abandon the download.
    pub fn on_tracker_lost(&mut self) -> Step {
        if self.phase == Phase::Done {
            return Step::pending(None);
        }
        self.abort(AbortReason::TrackerLost, self.head)
    }

    fn abort(&mut self, reason: AbortReason, seq: u8) -> Step {
        log::debug!("download of file {} aborted: {:?}", self.file_id, reason);
        // Nothing to close if the peer never answered.
        let reply = (self.phase != Phase::Requested).then(|| Datagram::end_ack(seq));
        self.phase = Phase::Done;
        self.buffered = None;
        Step {
            reply,
            deliver: Vec::new(),
            status: ReceiveStatus::Aborted(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::sender::{AckOutcome, ArqSender};
    use std::io;

    fn data(seq: u8, payload: &[u8]) -> Datagram {
        Datagram::new(seq, PacketKind::Data, payload.to_vec())
    }

    fn end(seq: u8, payload: &[u8]) -> Datagram {
        Datagram::new(seq, PacketKind::End, payload.to_vec())
    }

    #[test]
    fn empty_file_completes_without_digest() {
        let mut r = ArqReceiver::new(3, 10);
        assert_eq!(r.request(), Datagram::request(3));
        let step = r.on_datagram(&end(0, b""));
        assert_eq!(step.reply, Some(Datagram::ack(0)));
        assert!(step.deliver.is_empty());
        assert_eq!(step.status, ReceiveStatus::Complete);
        assert_eq!(r.expected_hash(), None);
    }

    #[test]
    fn in_order_stream() {
        let mut r = ArqReceiver::new(1, 10);
        let s = r.on_datagram(&data(0, b"cafe"));
        assert!(s.deliver.is_empty());
        assert_eq!(r.expected_hash(), Some("cafe"));
        let s = r.on_datagram(&data(1, b"ab"));
        assert_eq!(s.deliver, vec![b"ab".to_vec()]);
        let s = r.on_datagram(&end(2, b"cd"));
        assert_eq!(s.deliver, vec![b"cd".to_vec()]);
        assert_eq!(s.status, ReceiveStatus::Complete);
        assert!(r.is_done());
    }

    #[test]
    fn second_slot_buffered_then_flushed() {
        let mut r = ArqReceiver::new(1, 10);
        r.on_datagram(&data(0, b"cafe"));
        let s = r.on_datagram(&data(2, b"cd"));
        assert_eq!(s.reply, Some(Datagram::ack(2)));
        assert!(s.deliver.is_empty());
        let s = r.on_datagram(&data(1, b"ab"));
        assert_eq!(s.deliver, vec![b"ab".to_vec(), b"cd".to_vec()]);
        // Window is now [3, 0].
        let s = r.on_datagram(&end(3, b"ef"));
        assert_eq!(s.status, ReceiveStatus::Complete);
    }

    #[test]
    fn duplicate_second_slot_buffered_once() {
        let mut r = ArqReceiver::new(1, 10);
        r.on_datagram(&data(0, b"cafe"));
        r.on_datagram(&data(2, b"cd"));
        r.on_datagram(&data(2, b"cd"));
        let s = r.on_datagram(&data(1, b"ab"));
        assert_eq!(s.deliver, vec![b"ab".to_vec(), b"cd".to_vec()]);
    }

    #[test]
    fn duplicate_head_after_advance_is_acked_not_written() {
        let mut r = ArqReceiver::new(1, 10);
        r.on_datagram(&data(0, b"cafe"));
        r.on_datagram(&data(1, b"ab"));
        let s = r.on_datagram(&data(1, b"ab"));
        assert_eq!(s.reply, Some(Datagram::ack(1)));
        assert!(s.deliver.is_empty());
        let s = r.on_datagram(&data(0, b"cafe"));
        assert_eq!(s.reply, Some(Datagram::ack(0)));
        assert!(s.deliver.is_empty());
    }

    #[test]
    fn buffered_end_completes_on_head() {
        let mut r = ArqReceiver::new(1, 10);
        let s = r.on_datagram(&end(1, b"tail"));
        assert_eq!(s.status, ReceiveStatus::Pending);
        let s = r.on_datagram(&data(0, b"cafe"));
        assert_eq!(s.deliver, vec![b"tail".to_vec()]);
        assert_eq!(s.status, ReceiveStatus::Complete);
        assert_eq!(r.expected_hash(), Some("cafe"));
    }

    #[test]
    fn file_not_found_aborts_with_close_ack() {
        let mut r = ArqReceiver::new(9, 10);
        let s = r.on_datagram(&Datagram::control(0, PacketKind::FileNotFound));
        assert_eq!(s.status, ReceiveStatus::Aborted(AbortReason::FileNotFound));
        assert_eq!(s.reply, Some(Datagram::end_ack(0)));
        assert!(r.is_done());
    }

    #[test]
    fn end_abnormal_mid_transfer_aborts() {
        let mut r = ArqReceiver::new(1, 10);
        r.on_datagram(&data(0, b"cafe"));
        let s = r.on_datagram(&Datagram::control(0, PacketKind::EndAbnormal));
        assert_eq!(s.status, ReceiveStatus::Aborted(AbortReason::PeerAborted));
    }

    #[test]
    fn timeouts_before_first_datagram_resend_request() {
        let mut r = ArqReceiver::new(4, 2);
        assert_eq!(r.on_timeout().reply, Some(Datagram::request(4)));
        assert_eq!(r.on_timeout().reply, Some(Datagram::request(4)));
        let s = r.on_timeout();
        assert_eq!(s.status, ReceiveStatus::Aborted(AbortReason::RetriesExhausted));
        assert_eq!(s.reply, None);
    }

    #[test]
    fn timeouts_after_first_datagram_end_with_close_ack() {
        let mut r = ArqReceiver::new(4, 1);
        r.on_datagram(&data(0, b"cafe"));
        assert_eq!(r.on_timeout().reply, None);
        let s = r.on_timeout();
        assert_eq!(s.status, ReceiveStatus::Aborted(AbortReason::RetriesExhausted));
        assert_eq!(s.reply, Some(Datagram::end_ack(1)));
    }

    #[test]
    fn datagram_resets_retries() {
        let mut r = ArqReceiver::new(4, 3);
        r.on_timeout();
        r.on_timeout();
        assert_eq!(r.retries_left(), 1);
        r.on_datagram(&data(0, b"cafe"));
        assert_eq!(r.retries_left(), 3);
    }

    #[test]
    fn tracker_loss_aborts() {
        let mut r = ArqReceiver::new(4, 3);
        r.on_datagram(&data(0, b"cafe"));
        let s = r.on_tracker_lost();
        assert_eq!(s.status, ReceiveStatus::Aborted(AbortReason::TrackerLost));
        assert!(r.on_datagram(&data(1, b"x")).deliver.is_empty());
    }

    /// Drive a sender and receiver against each other, delivering every window twice and
    /// in reverse order, and feeding every ack back twice.
    #[test]
    fn lossless_exchange_with_duplication_and_reordering() {
        let content: Vec<Vec<u8>> = (0..11u8).map(|i| vec![i; 5]).collect();
        let mut units: Vec<io::Result<Chunk>> = vec![Ok(Chunk::data(b"digest".to_vec()))];
        for (i, block) in content.iter().enumerate() {
            if i + 1 == content.len() {
                units.push(Ok(Chunk::end(block.clone())));
            } else {
                units.push(Ok(Chunk::data(block.clone())));
            }
        }
        let (mut sender, mut in_flight) = ArqSender::open(units.into_iter(), 10).unwrap();
        let mut receiver = ArqReceiver::new(1, 10);
        let mut written: Vec<u8> = Vec::new();
        let mut done = false;

        for _ in 0..200 {
            let mut burst: Vec<Datagram> = in_flight.iter().rev().cloned().collect();
            burst.extend(in_flight.iter().cloned());
            let mut acks = Vec::new();
            for d in &burst {
                let step = receiver.on_datagram(d);
                for block in step.deliver {
                    written.extend(block);
                }
                if let Some(reply) = step.reply {
                    acks.push(reply);
                }
            }
            let mut next = Vec::new();
            for ack in acks.iter().chain(acks.iter()) {
                match sender.on_ack(ack.seq).unwrap() {
                    AckOutcome::Retransmit(out) => next = out,
                    AckOutcome::Finished => done = true,
                    AckOutcome::Hold | AckOutcome::Stale => {}
                }
            }
            if done {
                break;
            }
            if !next.is_empty() {
                in_flight = next;
            }
        }

        assert!(done);
        assert!(receiver.is_done());
        assert_eq!(receiver.expected_hash(), Some("digest"));
        assert_eq!(written, content.concat());
    }
}
