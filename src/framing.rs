//! Frame codec for the ground link.
//!
//! ```text
//! +------------+-----------+-------------------+-----------+
//! | 0xDEADBEEF | size: u32 | payload (size B)  | CRC-32    |
//! +------------+-----------+-------------------+-----------+
//! ```
//!
//! All integers are big-endian. The CRC covers the start word, the size and
//! the payload. The first four payload bytes hold the [`PacketType`].

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use std::ops::Range;
use thiserror::Error;

pub const START_WORD: u32 = 0xDEAD_BEEF;
pub const HEADER_SIZE: usize = 8;
pub const CHECKSUM_SIZE: usize = 4;
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + CHECKSUM_SIZE;
pub const PACKET_TYPE_SIZE: usize = 4;

const_assert_eq!(FRAME_OVERHEAD, 12);

const START_BYTES: [u8; 4] = START_WORD.to_be_bytes();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketType {
    Command,
    Telemetry,
    Log,
    File,
    PacketizedTlm,
    Idle,
}

impl PacketType {
    pub fn code(self) -> u32 {
        match self {
            PacketType::Command => 0,
            PacketType::Telemetry => 1,
            PacketType::Log => 2,
            PacketType::File => 3,
            PacketType::PacketizedTlm => 4,
            PacketType::Idle => 5,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(PacketType::Command),
            1 => Some(PacketType::Telemetry),
            2 => Some(PacketType::Log),
            3 => Some(PacketType::File),
            4 => Some(PacketType::PacketizedTlm),
            5 => Some(PacketType::Idle),
            _ => None,
        }
    }

    /// Reads the packet type at the head of `payload`.
    pub fn of(payload: &[u8]) -> Option<Self> {
        read_u32(payload, 0).and_then(Self::from_code)
    }
}

/// Prefixes `body` with the packet type code.
pub fn packet(packet_type: PacketType, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PACKET_TYPE_SIZE + body.len());
    out.extend_from_slice(&packet_type.code().to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let word = bytes.get(at..at + 4)?;
    Some(u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
}

pub fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    let half = bytes.get(at..at + 2)?;
    Some(u16::from_be_bytes([half[0], half[1]]))
}

const CRC_TABLE: [u32; 256] = crc_table();

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC-32 (IEEE 802.3, reflected).
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc = CRC_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize] ^ (crc >> 8);
    }
    !crc
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame of {needed} bytes does not fit {available}")]
    TooSmall { needed: usize, available: usize },
    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeframeOutcome {
    /// At least this many more bytes are needed.
    NeedMore(usize),
    /// Drop this many leading bytes and try again.
    Discard(usize),
    Frame { payload: Range<usize>, consumed: usize },
}

pub trait FramingProtocol: Send {
    fn frame_size(&self, payload_len: usize) -> usize;

    /// Writes the frame for `payload` into `out`, returning its length.
    fn frame(&self, payload: &[u8], out: &mut [u8]) -> Result<usize, FrameError>;

    /// Inspects the head of `bytes` for one frame.
    fn deframe(&self, bytes: &[u8]) -> DeframeOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FprimeFraming {
    max_payload: usize,
}

impl FprimeFraming {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Frames into a fresh vector; for ground-side tooling.
    pub fn frame_to_vec(&self, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut out = vec![0u8; self.frame_size(payload.len())];
        let written = self.frame(payload, &mut out)?;
        out.truncate(written);
        Ok(out)
    }
}

/// Offset of the next position that could begin a start word.
fn next_candidate(bytes: &[u8]) -> usize {
    (1..bytes.len())
        .find(|&at| {
            let tail = &bytes[at..];
            let n = tail.len().min(START_BYTES.len());
            tail[..n] == START_BYTES[..n]
        })
        .unwrap_or(bytes.len())
}

impl FramingProtocol for FprimeFraming {
    fn frame_size(&self, payload_len: usize) -> usize {
        payload_len + FRAME_OVERHEAD
    }

    fn frame(&self, payload: &[u8], out: &mut [u8]) -> Result<usize, FrameError> {
        if payload.len() > self.max_payload {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        let needed = self.frame_size(payload.len());
        if out.len() < needed {
            return Err(FrameError::TooSmall {
                needed,
                available: out.len(),
            });
        }
        let size = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;
        out[..4].copy_from_slice(&START_BYTES);
        out[4..HEADER_SIZE].copy_from_slice(&size.to_be_bytes());
        let body_end = HEADER_SIZE + payload.len();
        out[HEADER_SIZE..body_end].copy_from_slice(payload);
        let checksum = crc32(&out[..body_end]);
        out[body_end..needed].copy_from_slice(&checksum.to_be_bytes());
        Ok(needed)
    }

    fn deframe(&self, bytes: &[u8]) -> DeframeOutcome {
        let prefix = bytes.len().min(START_BYTES.len());
        if bytes[..prefix] != START_BYTES[..prefix] {
            return DeframeOutcome::Discard(next_candidate(bytes));
        }
        if bytes.len() < HEADER_SIZE {
            return DeframeOutcome::NeedMore(HEADER_SIZE - bytes.len());
        }

        let size = read_u32(bytes, 4).map_or(0, |s| s as usize);
        if size == 0 || size > self.max_payload {
            return DeframeOutcome::Discard(1);
        }
        let total = HEADER_SIZE + size + CHECKSUM_SIZE;
        if bytes.len() < total {
            return DeframeOutcome::NeedMore(total - bytes.len());
        }

        let body_end = HEADER_SIZE + size;
        if read_u32(bytes, body_end) != Some(crc32(&bytes[..body_end])) {
            return DeframeOutcome::Discard(1);
        }
        DeframeOutcome::Frame {
            payload: HEADER_SIZE..body_end,
            consumed: total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_frame_layout() {
        let framing = FprimeFraming::new(64);
        let frame = framing.frame_to_vec(&[1, 2, 3]).unwrap();
        assert_eq!(frame.len(), 3 + FRAME_OVERHEAD);
        assert_eq!(&frame[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&frame[4..8], &[0, 0, 0, 3]);
        assert_eq!(&frame[8..11], &[1, 2, 3]);
        assert_eq!(read_u32(&frame, 11), Some(crc32(&frame[..11])));
    }

    #[test]
    fn test_partial_frame_needs_more() {
        let framing = FprimeFraming::new(64);
        let frame = framing.frame_to_vec(b"hello").unwrap();
        assert_eq!(framing.deframe(&frame[..2]), DeframeOutcome::NeedMore(6));
        assert_eq!(framing.deframe(&frame[..10]), DeframeOutcome::NeedMore(frame.len() - 10));
        assert_eq!(
            framing.deframe(&frame),
            DeframeOutcome::Frame {
                payload: 8..13,
                consumed: frame.len()
            }
        );
    }

    #[test]
    fn test_garbage_skips_to_next_start_word() {
        let framing = FprimeFraming::new(64);
        let mut bytes = vec![0x00, 0x11, 0xDE, 0x22];
        bytes.extend(framing.frame_to_vec(b"x").unwrap());
        // 0xDE at offset 2 could start a word but 0x22 rules it out.
        assert_eq!(framing.deframe(&bytes), DeframeOutcome::Discard(4));
    }

    #[test]
    fn test_bad_checksum_discards_one_byte() {
        let framing = FprimeFraming::new(64);
        let mut frame = framing.frame_to_vec(b"abc").unwrap();
        frame[9] ^= 0xFF;
        assert_eq!(framing.deframe(&frame), DeframeOutcome::Discard(1));
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let framing = FprimeFraming::new(2);
        assert_eq!(framing.frame_to_vec(b"abc"), Err(FrameError::PayloadTooLarge(3)));
    }

    #[test]
    fn test_packet_type_prefix() {
        let bytes = packet(PacketType::File, &[9]);
        assert_eq!(PacketType::of(&bytes), Some(PacketType::File));
        assert_eq!(PacketType::of(&[0, 0]), None);
    }
}
