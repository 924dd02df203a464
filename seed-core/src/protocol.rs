//! Seed wire protocol: P2P packet kinds, datagram layout constants and tracker control messages.

use std::fmt;

/// Go-Back-N window size (entries in flight per requester).
pub const WINDOW_SIZE: u8 = 2;

/// Sequence space. Twice the window so one outstanding window never aliases across a wrap.
pub const MAX_SEQ: u8 = 2 * WINDOW_SIZE;

/// Largest datagram either side will send or accept.
pub const BUFFER_SIZE: usize = 4096;

/// `[seq:1][kind:1]`
pub const HEADER_LEN: usize = 2;

/// Largest payload that fits in one datagram.
pub const MAX_PAYLOAD: usize = BUFFER_SIZE - HEADER_LEN;

/// File ids travel as one byte in the initial request, so a bitmap covers at most this many files.
pub const MAX_FILES: usize = 256;

/// Next sequence number after `seq`, wrapping at [`MAX_SEQ`].
pub fn next_seq(seq: u8) -> u8 {
    (seq + 1) % MAX_SEQ
}

/// Datagram kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Data = 0,
    Ack = 1,
    End = 2,
    EndAbnormal = 3,
    EndAck = 4,
    FileNotFound = 5,
}

impl PacketKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Data),
            1 => Some(Self::Ack),
            2 => Some(Self::End),
            3 => Some(Self::EndAbnormal),
            4 => Some(Self::EndAck),
            5 => Some(Self::FileNotFound),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One P2P datagram: header fields plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub seq: u8,
    pub kind: PacketKind,
    pub payload: Vec<u8>,
}

impl Datagram {
    pub fn new(seq: u8, kind: PacketKind, payload: Vec<u8>) -> Self {
        Self { seq, kind, payload }
    }

    /// Header-only datagram (acks and control packets).
    pub fn control(seq: u8, kind: PacketKind) -> Self {
        Self::new(seq, kind, Vec::new())
    }

    /// Initial request: `seq=0, kind=DATA, payload=[file_id]`.
    pub fn request(file_id: u8) -> Self {
        Self::new(0, PacketKind::Data, vec![file_id])
    }

    pub fn ack(seq: u8) -> Self {
        Self::control(seq, PacketKind::Ack)
    }

    pub fn end_ack(seq: u8) -> Self {
        Self::control(seq, PacketKind::EndAck)
    }

    /// True for a datagram shaped like a new file request.
    pub fn is_request(&self) -> bool {
        self.seq == 0 && self.kind == PacketKind::Data && self.payload.len() == 1
    }
}

/// Messages a peer sends to the tracker, one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerRequest {
    /// `INIT:<clientId>:<fileBitmap>:<servicePort>`
    Init {
        client_id: String,
        bitmap: FileBitmap,
        service_port: u16,
    },
    /// `HB`
    Heartbeat,
    /// `FILE:<fileId>`. Negative or oversized ids are kept so they can be answered with no holder.
    File { file_id: i64 },
    /// `LOG:<fileId>:<clientId>`
    Log { file_id: u32, client_id: String },
    /// `QUIT`
    Quit,
}

impl fmt::Display for TrackerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerRequest::Init {
                client_id,
                bitmap,
                service_port,
            } => write!(f, "INIT:{}:{}:{}", client_id, bitmap, service_port),
            TrackerRequest::Heartbeat => f.write_str("HB"),
            TrackerRequest::File { file_id } => write!(f, "FILE:{}", file_id),
            TrackerRequest::Log { file_id, client_id } => {
                write!(f, "LOG:{}:{}", file_id, client_id)
            }
            TrackerRequest::Quit => f.write_str("QUIT"),
        }
    }
}

/// Messages the tracker sends back, one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerReply {
    /// `Success!`: registration accepted.
    Success,
    /// `ERR:MALFORM`
    Malformed,
    /// `HB+`
    HeartbeatOk,
    /// `HB-`: duplicate registration, or the tracker is shutting down.
    HeartbeatRefused,
    /// `PORT:<port>:<holderId>`
    Port { port: u16, holder: String },
    /// `PORT:-1:-1`
    NoHolder,
    /// `LOG:DONE`
    LogDone,
}

impl fmt::Display for TrackerReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerReply::Success => f.write_str("Success!"),
            TrackerReply::Malformed => f.write_str("ERR:MALFORM"),
            TrackerReply::HeartbeatOk => f.write_str("HB+"),
            TrackerReply::HeartbeatRefused => f.write_str("HB-"),
            TrackerReply::Port { port, holder } => write!(f, "PORT:{}:{}", port, holder),
            TrackerReply::NoHolder => f.write_str("PORT:-1:-1"),
            TrackerReply::LogDone => f.write_str("LOG:DONE"),
        }
    }
}

/// Which files a client holds: bit `i` set means the client serves file `i`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileBitmap(Vec<bool>);

impl FileBitmap {
    pub fn from_bits(bits: Vec<bool>) -> Self {
        Self(bits)
    }

    /// Number of file slots the bitmap describes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn holds(&self, file_id: usize) -> bool {
        self.0.get(file_id).copied().unwrap_or(false)
    }

    /// Ids of every set bit, ascending.
    pub fn held_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, &set)| set.then_some(i))
    }
}

impl fmt::Display for FileBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &bit in &self.0 {
            f.write_str(if bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}
