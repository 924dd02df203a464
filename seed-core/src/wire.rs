//! Framing: binary P2P datagrams (`[seq][kind][payload]`) and line-based tracker messages.

use std::collections::VecDeque;

use crate::protocol::{
    Datagram, FileBitmap, PacketKind, TrackerReply, TrackerRequest, BUFFER_SIZE, HEADER_LEN,
    MAX_FILES, MAX_SEQ,
};

/// Encode a datagram into a single UDP payload.
pub fn encode_datagram(d: &Datagram) -> Result<Vec<u8>, WireError> {
    if HEADER_LEN + d.payload.len() > BUFFER_SIZE {
        return Err(WireError::TooLarge(HEADER_LEN + d.payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + d.payload.len());
    out.push(d.seq);
    out.push(d.kind.as_byte());
    out.extend_from_slice(&d.payload);
    Ok(out)
}

/// Decode one received UDP payload.
pub fn decode_datagram(bytes: &[u8]) -> Result<Datagram, WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::TooShort);
    }
    if bytes.len() > BUFFER_SIZE {
        return Err(WireError::TooLarge(bytes.len()));
    }
    let seq = bytes[0];
    if seq >= MAX_SEQ {
        return Err(WireError::BadSeq(seq));
    }
    let kind = PacketKind::from_byte(bytes[1]).ok_or(WireError::UnknownKind(bytes[1]))?;
    Ok(Datagram {
        seq,
        kind,
        payload: bytes[HEADER_LEN..].to_vec(),
    })
}

/// Error encoding or decoding a datagram.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram shorter than the 2-byte header")]
    TooShort,
    #[error("datagram of {0} bytes exceeds buffer size")]
    TooLarge(usize),
    #[error("sequence number {0} outside sequence space")]
    BadSeq(u8),
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
}

/// Parse one control-channel line sent by a peer. Surrounding whitespace is ignored.
pub fn parse_request(line: &str) -> Result<TrackerRequest, MessageError> {
    let line = line.trim();
    if line.len() > BUFFER_SIZE {
        return Err(MessageError::TooLong);
    }
    let fields: Vec<&str> = line.split(':').collect();
    match fields.as_slice() {
        ["INIT", client_id, bitmap, port] => {
            if client_id.is_empty() {
                return Err(MessageError::BadField("clientId"));
            }
            Ok(TrackerRequest::Init {
                client_id: client_id.to_string(),
                bitmap: parse_bitmap(bitmap)?,
                service_port: port.parse().map_err(|_| MessageError::BadField("port"))?,
            })
        }
        ["INIT", ..] => Err(MessageError::FieldCount),
        ["HB"] => Ok(TrackerRequest::Heartbeat),
        ["FILE", file_id] => Ok(TrackerRequest::File {
            file_id: file_id
                .parse()
                .map_err(|_| MessageError::BadField("fileId"))?,
        }),
        ["LOG", file_id, client_id] => Ok(TrackerRequest::Log {
            file_id: file_id
                .parse()
                .map_err(|_| MessageError::BadField("fileId"))?,
            client_id: client_id.to_string(),
        }),
        ["QUIT"] => Ok(TrackerRequest::Quit),
        _ => Err(MessageError::Unrecognized),
    }
}

/// Parse one control-channel line sent by the tracker.
pub fn parse_reply(line: &str) -> Result<TrackerReply, MessageError> {
    let line = line.trim();
    match line {
        "Success!" => return Ok(TrackerReply::Success),
        "ERR:MALFORM" => return Ok(TrackerReply::Malformed),
        "HB+" => return Ok(TrackerReply::HeartbeatOk),
        "HB-" => return Ok(TrackerReply::HeartbeatRefused),
        "PORT:-1:-1" => return Ok(TrackerReply::NoHolder),
        "LOG:DONE" => return Ok(TrackerReply::LogDone),
        _ => {}
    }
    match line.split(':').collect::<Vec<_>>().as_slice() {
        ["PORT", port, holder] if !holder.is_empty() => Ok(TrackerReply::Port {
            port: port.parse().map_err(|_| MessageError::BadField("port"))?,
            holder: holder.to_string(),
        }),
        _ => Err(MessageError::Unrecognized),
    }
}

/// Parse a `0`/`1` file bitmap of at most [`MAX_FILES`] characters.
pub fn parse_bitmap(s: &str) -> Result<FileBitmap, MessageError> {
    if s.is_empty() || s.len() > MAX_FILES {
        return Err(MessageError::BadField("fileBitmap"));
    }
    let bits = s
        .chars()
        .map(|c| match c {
            '0' => Ok(false),
            '1' => Ok(true),
            _ => Err(MessageError::BadField("fileBitmap")),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FileBitmap::from_bits(bits))
}

/// A control-channel line that is not a valid message.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("wrong field count")]
    FieldCount,
    #[error("invalid {0}")]
    BadField(&'static str),
    #[error("line too long")]
    TooLong,
    #[error("unrecognized message")]
    Unrecognized,
}

/// One unit cut from the control-channel byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line, newline stripped.
    Line(String),
    /// Over-long or not UTF-8. Answered as malformed; the stream stays usable.
    Invalid,
}

/// Splits a control-channel byte stream into newline-terminated lines.
///
/// Never buffers more than `max_line` bytes. A line that outgrows the cap is reported as
/// [`Frame::Invalid`] as soon as it does, and the rest of it up to the next newline is dropped.
#[derive(Debug)]
pub struct LineFramer {
    max_line: usize,
    partial: Vec<u8>,
    discarding: bool,
    ready: VecDeque<Frame>,
}

impl LineFramer {
    pub fn new(max_line: usize) -> Self {
        Self {
            max_line,
            partial: Vec::new(),
            discarding: false,
            ready: VecDeque::new(),
        }
    }

    /// Feed bytes as they arrive from the socket.
    pub fn push(&mut self, mut bytes: &[u8]) {
        while let Some(pos) = bytes.iter().position(|&b| b == b'\n') {
            let head = &bytes[..pos];
            if self.discarding {
                self.discarding = false;
            } else if self.partial.len() + head.len() > self.max_line {
                self.partial.clear();
                self.ready.push_back(Frame::Invalid);
            } else {
                self.partial.extend_from_slice(head);
                let line = std::mem::take(&mut self.partial);
                self.ready.push_back(match String::from_utf8(line) {
                    Ok(line) => Frame::Line(line),
                    Err(_) => Frame::Invalid,
                });
            }
            bytes = &bytes[pos + 1..];
        }
        if self.discarding {
            return;
        }
        if self.partial.len() + bytes.len() > self.max_line {
            self.partial.clear();
            self.discarding = true;
            self.ready.push_back(Frame::Invalid);
        } else {
            self.partial.extend_from_slice(bytes);
        }
    }

    /// Next complete frame, oldest first.
    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.ready.pop_front()
    }

    /// Bytes held for the line in progress.
    pub fn buffered(&self) -> usize {
        self.partial.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_layout_on_wire() {
        let d = Datagram::new(3, PacketKind::End, b"tail".to_vec());
        let bytes = encode_datagram(&d).unwrap();
        assert_eq!(&bytes[..2], &[3, 2]);
        assert_eq!(&bytes[2..], b"tail");
        assert_eq!(decode_datagram(&bytes).unwrap(), d);
    }

    #[test]
    fn header_only_datagram() {
        let bytes = encode_datagram(&Datagram::ack(1)).unwrap();
        assert_eq!(bytes, vec![1, 1]);
        let d = decode_datagram(&bytes).unwrap();
        assert!(d.payload.is_empty());
    }

    #[test]
    fn decode_rejects_bad_input() {
        assert_eq!(decode_datagram(&[0]), Err(WireError::TooShort));
        assert_eq!(decode_datagram(&[MAX_SEQ, 0]), Err(WireError::BadSeq(MAX_SEQ)));
        assert_eq!(decode_datagram(&[0, 9]), Err(WireError::UnknownKind(9)));
        let huge = vec![0u8; BUFFER_SIZE + 1];
        assert!(matches!(decode_datagram(&huge), Err(WireError::TooLarge(_))));
    }

    #[test]
    fn encode_rejects_oversize_payload() {
        let d = Datagram::new(0, PacketKind::Data, vec![0; BUFFER_SIZE]);
        assert!(matches!(encode_datagram(&d), Err(WireError::TooLarge(_))));
    }

    #[test]
    fn parse_init() {
        let req = parse_request("INIT:A:0100:9001\n").unwrap();
        match req {
            TrackerRequest::Init {
                client_id,
                bitmap,
                service_port,
            } => {
                assert_eq!(client_id, "A");
                assert_eq!(bitmap.held_ids().collect::<Vec<_>>(), vec![1]);
                assert_eq!(service_port, 9001);
            }
            other => panic!("expected Init, got {:?}", other),
        }
    }

    #[test]
    fn init_wrong_field_count_is_malformed() {
        assert_eq!(parse_request("INIT:A:0100"), Err(MessageError::FieldCount));
        assert_eq!(
            parse_request("INIT:A:0100:9001:extra"),
            Err(MessageError::FieldCount)
        );
    }

    #[test]
    fn init_bad_fields() {
        assert_eq!(
            parse_request("INIT:A:01x0:9001"),
            Err(MessageError::BadField("fileBitmap"))
        );
        assert_eq!(
            parse_request("INIT:A:0100:99999"),
            Err(MessageError::BadField("port"))
        );
        assert_eq!(
            parse_request("INIT::0100:9001"),
            Err(MessageError::BadField("clientId"))
        );
    }

    #[test]
    fn parse_simple_requests() {
        assert_eq!(parse_request("HB"), Ok(TrackerRequest::Heartbeat));
        assert_eq!(parse_request("QUIT"), Ok(TrackerRequest::Quit));
        assert_eq!(parse_request("FILE:12"), Ok(TrackerRequest::File { file_id: 12 }));
        assert_eq!(
            parse_request("LOG:1:A"),
            Ok(TrackerRequest::Log {
                file_id: 1,
                client_id: "A".into()
            })
        );
        assert_eq!(parse_request("HELLO"), Err(MessageError::Unrecognized));
        assert!(parse_request("FILE:x").is_err());
        assert_eq!(parse_request("FILE:-1"), Ok(TrackerRequest::File { file_id: -1 }));
        assert_eq!(
            parse_request("FILE:99999999999"),
            Ok(TrackerRequest::File {
                file_id: 99_999_999_999
            })
        );
    }

    #[test]
    fn request_display_parses_back() {
        let req = TrackerRequest::Init {
            client_id: "7".into(),
            bitmap: FileBitmap::from_bits(vec![true, false]),
            service_port: 4000,
        };
        assert_eq!(req.to_string(), "INIT:7:10:4000");
        assert_eq!(parse_request(&req.to_string()), Ok(req));
    }

    #[test]
    fn parse_replies() {
        assert_eq!(parse_reply("Success!\n"), Ok(TrackerReply::Success));
        assert_eq!(parse_reply("HB-"), Ok(TrackerReply::HeartbeatRefused));
        assert_eq!(parse_reply("PORT:-1:-1"), Ok(TrackerReply::NoHolder));
        assert_eq!(
            parse_reply("PORT:9001:A"),
            Ok(TrackerReply::Port {
                port: 9001,
                holder: "A".into()
            })
        );
        assert_eq!(parse_reply("LOG:DONE"), Ok(TrackerReply::LogDone));
        assert_eq!(parse_reply(""), Err(MessageError::Unrecognized));
    }

    fn drain(framer: &mut LineFramer) -> Vec<Frame> {
        std::iter::from_fn(|| framer.pop_frame()).collect()
    }

    #[test]
    fn framer_joins_lines_split_across_reads() {
        let mut f = LineFramer::new(BUFFER_SIZE);
        f.push(b"HB\nFI");
        assert_eq!(drain(&mut f), vec![Frame::Line("HB".into())]);
        f.push(b"LE:1\nQUIT\n");
        assert_eq!(
            drain(&mut f),
            vec![Frame::Line("FILE:1".into()), Frame::Line("QUIT".into())]
        );
        assert_eq!(f.buffered(), 0);
    }

    #[test]
    fn framer_flags_invalid_utf8_and_recovers() {
        let mut f = LineFramer::new(BUFFER_SIZE);
        f.push(b"\xff\xfe\nHB\n");
        assert_eq!(drain(&mut f), vec![Frame::Invalid, Frame::Line("HB".into())]);
    }

    #[test]
    fn framer_caps_buffered_bytes() {
        let mut f = LineFramer::new(8);
        f.push(b"0123456");
        assert!(drain(&mut f).is_empty());
        f.push(b"789");
        assert_eq!(drain(&mut f), vec![Frame::Invalid]);
        assert_eq!(f.buffered(), 0);
        f.push(&[b'x'; 1000]);
        assert!(drain(&mut f).is_empty());
        assert_eq!(f.buffered(), 0);
        f.push(b"tail\nHB\n");
        assert_eq!(drain(&mut f), vec![Frame::Line("HB".into())]);
    }

    #[test]
    fn framer_rejects_long_line_ending_in_same_read() {
        let mut f = LineFramer::new(4);
        f.push(b"toolong\nok\n");
        assert_eq!(drain(&mut f), vec![Frame::Invalid, Frame::Line("ok".into())]);
    }
}
