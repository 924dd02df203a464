//! Seed protocol core.
//! Host-driven: no sockets here; hosts feed datagrams and timeouts, and act on the returned outcomes.

pub mod chunk;
pub mod config;
pub mod integrity;
pub mod protocol;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod wire;

pub use chunk::{Chunk, ChunkReader, ChunkWriter};
pub use config::ArqConfig;
pub use protocol::{Datagram, FileBitmap, PacketKind, TrackerReply, TrackerRequest};
pub use receiver::{AbortReason, ArqReceiver, ReceiveStatus, Step};
pub use registry::{ClientRecord, Holder, Registry, RegistryError};
pub use sender::{AckOutcome, ArqSender, SenderStatus, TimeoutOutcome};
pub use wire::{
    decode_datagram, encode_datagram, parse_bitmap, parse_reply, parse_request, Frame, LineFramer,
    MessageError, WireError,
};
