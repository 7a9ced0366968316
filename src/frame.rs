//! On-wire frame format and the incremental codec that parses it out of a
//! byte stream.
//!
//! Wire layout (little-endian multi-byte fields):
//!
//! ```text
//! +------+------+-----+-----+---------+--------+------+
//! | SYNC | TYPE | SEQ | LEN | PAYLOAD | CRC16  | EOF  |
//! +------+------+-----+-----+---------+--------+------+
//!   2B     1B    2B    2B     LEN B      2B      1B
//! ```
//!
//! SYNC is fixed, TYPE selects the frame kind, CRC16 is CRC-16/CCITT-FALSE
//! over TYPE..PAYLOAD. A `START` frame's payload is a `StartMetadata` record.

use crate::crc::ccitt_false;
use std::collections::VecDeque;

pub const SYNC: [u8; 2] = [0xA5, 0x5A];

const HEADER_LEN: usize = 2 + 1 + 2 + 2; // SYNC + TYPE + SEQ + LEN
const TRAILER_LEN: usize = 2 + 1; // CRC + EOF
const EOF_BYTE: u8 = 0x7E;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Ack,
    Nak,
    Start,
    End,
    Heartbeat,
}

impl FrameType {
    fn to_byte(self) -> u8 {
        match self {
            FrameType::Data => 0x01,
            FrameType::Ack => 0x02,
            FrameType::Nak => 0x03,
            FrameType::Start => 0x04,
            FrameType::End => 0x05,
            FrameType::Heartbeat => 0x06,
        }
    }

    fn from_byte(b: u8) -> Option<FrameType> {
        match b {
            0x01 => Some(FrameType::Data),
            0x02 => Some(FrameType::Ack),
            0x03 => Some(FrameType::Nak),
            0x04 => Some(FrameType::Start),
            0x05 => Some(FrameType::End),
            0x06 => Some(FrameType::Heartbeat),
            _ => None,
        }
    }
}

/// A decoded wire record.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub sequence: u16,
    pub payload: Vec<u8>,
    pub valid: bool,
}

/// Session-initiation payload carried by a `START` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartMetadata {
    pub version: u8,
    pub flags: u8,
    pub session_id: u16,
    pub file_size: u64,
    pub modify_time: u64,
    pub file_name: String,
}

impl StartMetadata {
    fn encode(&self) -> Vec<u8> {
        let name_bytes = self.file_name.as_bytes();
        let mut out = Vec::with_capacity(2 + 2 + 8 + 8 + 2 + name_bytes.len());
        out.push(self.version);
        out.push(self.flags);
        out.extend_from_slice(&self.session_id.to_le_bytes());
        out.extend_from_slice(&self.file_size.to_le_bytes());
        out.extend_from_slice(&self.modify_time.to_le_bytes());
        out.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(name_bytes);
        out
    }

    fn decode(payload: &[u8]) -> Option<StartMetadata> {
        if payload.len() < 20 {
            return None;
        }
        let version = payload[0];
        let flags = payload[1];
        let session_id = u16::from_le_bytes([payload[2], payload[3]]);
        let file_size = u64::from_le_bytes(payload[4..12].try_into().ok()?);
        let modify_time = u64::from_le_bytes(payload[12..20].try_into().ok()?);
        let name_len = u16::from_le_bytes([payload[20], payload[21]]) as usize;
        let name_bytes = payload.get(22..22 + name_len)?;
        let file_name = std::str::from_utf8(name_bytes).ok()?.to_string();
        Some(StartMetadata {
            version,
            flags,
            session_id,
            file_size,
            modify_time,
            file_name,
        })
    }
}

/// Incremental parser over an accumulating byte buffer.
///
/// Never blocks: it is a pure state machine driven entirely by `append` and
/// `try_get_frame`.
pub struct FrameCodec {
    buffer: VecDeque<u8>,
    max_payload_size: usize,
    invalid_count: u64,
}

impl FrameCodec {
    pub fn new(max_payload_size: usize) -> FrameCodec {
        FrameCodec {
            buffer: VecDeque::new(),
            max_payload_size,
            invalid_count: 0,
        }
    }

    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.max_payload_size = max_payload_size;
    }

    pub fn invalid_count(&self) -> u64 {
        self.invalid_count
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend(bytes.iter().copied());
    }

    fn encode(frame_type: FrameType, sequence: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
        out.extend_from_slice(&SYNC);
        out.push(frame_type.to_byte());
        out.extend_from_slice(&sequence.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(payload);
        let crc = ccitt_false(&out[2..]);
        out.extend_from_slice(&crc.to_le_bytes());
        out.push(EOF_BYTE);
        out
    }

    pub fn encode_data(seq: u16, payload: &[u8]) -> Vec<u8> {
        Self::encode(FrameType::Data, seq, payload)
    }

    pub fn encode_ack(seq: u16) -> Vec<u8> {
        Self::encode(FrameType::Ack, seq, &[])
    }

    pub fn encode_nak(seq: u16) -> Vec<u8> {
        Self::encode(FrameType::Nak, seq, &[])
    }

    pub fn encode_start(seq: u16, meta: &StartMetadata) -> Vec<u8> {
        Self::encode(FrameType::Start, seq, &meta.encode())
    }

    pub fn encode_end(seq: u16) -> Vec<u8> {
        Self::encode(FrameType::End, seq, &[])
    }

    pub fn encode_heartbeat(seq: u16) -> Vec<u8> {
        Self::encode(FrameType::Heartbeat, seq, &[])
    }

    pub fn decode_start_metadata(payload: &[u8]) -> Option<StartMetadata> {
        StartMetadata::decode(payload)
    }

    /// Find the index of the next SYNC marker in the buffer, if any.
    fn find_sync(&self) -> Option<usize> {
        let len = self.buffer.len();
        if len < 2 {
            return None;
        }
        for i in 0..=len - 2 {
            if self.buffer[i] == SYNC[0] && self.buffer[i + 1] == SYNC[1] {
                return Some(i);
            }
        }
        None
    }

    /// Consume one whole frame if available, resynchronizing on SYNC after
    /// discarding any invalid frame or garbage bytes.
    pub fn try_get_frame(&mut self) -> Option<Frame> {
        loop {
            let sync_at = self.find_sync()?;
            if sync_at > 0 {
                for _ in 0..sync_at {
                    self.buffer.pop_front();
                }
            }

            if self.buffer.len() < HEADER_LEN {
                return None;
            }

            let type_byte = self.buffer[2];
            let seq = u16::from_le_bytes([self.buffer[3], self.buffer[4]]);
            let len = u16::from_le_bytes([self.buffer[5], self.buffer[6]]) as usize;

            let frame_type = match FrameType::from_byte(type_byte) {
                Some(t) => t,
                None => {
                    // Unrecognized type byte: drop the SYNC and rescan.
                    self.buffer.pop_front();
                    self.buffer.pop_front();
                    self.invalid_count += 1;
                    continue;
                }
            };

            if len > self.max_payload_size {
                self.buffer.pop_front();
                self.buffer.pop_front();
                self.invalid_count += 1;
                return Some(Frame {
                    frame_type,
                    sequence: seq,
                    payload: Vec::new(),
                    valid: false,
                });
            }

            let total_len = HEADER_LEN + len + TRAILER_LEN;
            if self.buffer.len() < total_len {
                return None;
            }

            let frame_bytes: Vec<u8> = self.buffer.iter().take(total_len).copied().collect();
            let payload = frame_bytes[HEADER_LEN..HEADER_LEN + len].to_vec();
            let crc_received =
                u16::from_le_bytes([frame_bytes[HEADER_LEN + len], frame_bytes[HEADER_LEN + len + 1]]);
            let eof = frame_bytes[total_len - 1];
            let crc_computed = ccitt_false(&frame_bytes[2..HEADER_LEN + len]);

            let valid = eof == EOF_BYTE && crc_received == crc_computed;

            if !valid {
                // Discard the SYNC bytes only and rescan; a corrupted LEN may
                // have made total_len wrong, but it doesn't matter, we just
                // retry byte-by-byte from the next position.
                self.buffer.pop_front();
                self.buffer.pop_front();
                self.invalid_count += 1;
                return Some(Frame {
                    frame_type,
                    sequence: seq,
                    payload,
                    valid: false,
                });
            }

            for _ in 0..total_len {
                self.buffer.pop_front();
            }

            return Some(Frame {
                frame_type,
                sequence: seq,
                payload,
                valid: true,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_data_frame() {
        let mut codec = FrameCodec::new(1024);
        let bytes = FrameCodec::encode_data(42, b"hello");
        codec.append(&bytes);
        let frame = codec.try_get_frame().expect("frame");
        assert!(frame.valid);
        assert_eq!(frame.frame_type, FrameType::Data);
        assert_eq!(frame.sequence, 42);
        assert_eq!(frame.payload, b"hello");
    }

    #[test]
    fn round_trip_control_frames() {
        let mut codec = FrameCodec::new(1024);
        for bytes in [
            FrameCodec::encode_ack(1),
            FrameCodec::encode_nak(2),
            FrameCodec::encode_end(3),
            FrameCodec::encode_heartbeat(4),
        ] {
            codec.append(&bytes);
        }
        let expect = [
            (FrameType::Ack, 1u16),
            (FrameType::Nak, 2),
            (FrameType::End, 3),
            (FrameType::Heartbeat, 4),
        ];
        for (ty, seq) in expect {
            let frame = codec.try_get_frame().expect("frame");
            assert!(frame.valid);
            assert_eq!(frame.frame_type, ty);
            assert_eq!(frame.sequence, seq);
            assert!(frame.payload.is_empty());
        }
    }

    #[test]
    fn start_metadata_round_trip() {
        let meta = StartMetadata {
            version: 1,
            flags: 0,
            session_id: 7,
            file_size: 123456,
            modify_time: 999,
            file_name: "report.bin".to_string(),
        };
        let bytes = FrameCodec::encode_start(5, &meta);
        let mut codec = FrameCodec::new(1024);
        codec.append(&bytes);
        let frame = codec.try_get_frame().unwrap();
        assert!(frame.valid);
        let decoded = FrameCodec::decode_start_metadata(&frame.payload).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn idempotent_under_arbitrary_chunking() {
        let mut all_bytes = Vec::new();
        for i in 0..20u16 {
            all_bytes.extend(FrameCodec::encode_data(i, &[i as u8; 3]));
        }

        let mut whole = FrameCodec::new(1024);
        whole.append(&all_bytes);
        let mut whole_frames = Vec::new();
        while let Some(f) = whole.try_get_frame() {
            whole_frames.push(f.sequence);
        }

        // Feed the same bytes one at a time.
        let mut chunked = FrameCodec::new(1024);
        let mut chunked_frames = Vec::new();
        for b in &all_bytes {
            chunked.append(std::slice::from_ref(b));
            while let Some(f) = chunked.try_get_frame() {
                chunked_frames.push(f.sequence);
            }
        }

        assert_eq!(whole_frames, chunked_frames);
        assert_eq!(whole_frames, (0..20).collect::<Vec<u16>>());
    }

    #[test]
    fn resynchronizes_after_garbage() {
        let mut codec = FrameCodec::new(1024);
        codec.append(&[0xde, 0xad, 0xbe, 0xef]);
        codec.append(&FrameCodec::encode_data(9, b"ok"));
        let frame = codec.try_get_frame().expect("frame");
        assert!(frame.valid);
        assert_eq!(frame.sequence, 9);
        assert_eq!(frame.payload, b"ok");
    }

    #[test]
    fn oversize_payload_rejected_during_encode_parse() {
        let mut codec = FrameCodec::new(4);
        let bytes = FrameCodec::encode_data(1, b"toolong");
        codec.append(&bytes);
        // LEN (7) exceeds max_payload_size (4): rejected the same way a
        // CRC mismatch is, as an invalid frame rather than silent dropping.
        let frame = codec.try_get_frame().expect("frame");
        assert!(!frame.valid);
        assert_eq!(frame.sequence, 1);
        assert_eq!(codec.invalid_count(), 1);
    }

    #[test]
    fn corrupted_crc_reports_invalid_and_resyncs() {
        let mut codec = FrameCodec::new(1024);
        let mut bytes = FrameCodec::encode_data(1, b"hi");
        let last = bytes.len() - 2; // flip a CRC byte
        bytes[last] ^= 0xff;
        codec.append(&bytes);
        codec.append(&FrameCodec::encode_data(2, b"next"));

        let first = codec.try_get_frame().unwrap();
        assert!(!first.valid);
        let second = codec.try_get_frame().unwrap();
        assert!(second.valid);
        assert_eq!(second.sequence, 2);
    }
}
