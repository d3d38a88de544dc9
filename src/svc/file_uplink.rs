//! File uplink: reassembles files sent from the ground as FILE packets.
//!
//! Packet body, after the packet type word:
//!
//! ```text
//! kind: u8 | sequence: u32 | ...
//!   START  file_size: u32 | name_len: u8 | name
//!   DATA   offset: u32 | len: u16 | bytes
//!   END    crc32: u32
//!   CANCEL
//! ```
//!
//! Sequence numbers start at 0 with START and increase by one per packet.

use crate::component::{Component, ComponentKind, PortContext};
use crate::events::Severity;
use crate::framing::{crc32, packet, read_u16, read_u32, PacketType, PACKET_TYPE_SIZE};
use crate::port::{InvocationMode, PortArgs, PortError, PortResult, PortSpec, PortType};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_MAX_FILE_SIZE: usize = 64 * 1024;
pub const MAX_COMPLETED: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UplinkError {
    #[error("malformed file packet")]
    Malformed,
    #[error("packet {got} out of order, expected {expected}")]
    OutOfOrder { expected: u32, got: u32 },
    #[error("no file transfer in progress")]
    NotReceiving,
    #[error("file of {0} bytes exceeds the uplink limit")]
    TooLarge(usize),
    #[error("data at {offset}+{len} overruns a {size} byte file")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("received {received} of {size} bytes")]
    Incomplete { received: usize, size: usize },
    #[error("checksum {got:#010x} does not match {expected:#010x}")]
    Checksum { expected: u32, got: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePacket {
    Start { seq: u32, size: u32, name: String },
    Data { seq: u32, offset: u32, bytes: Vec<u8> },
    End { seq: u32, checksum: u32 },
    Cancel { seq: u32 },
}

impl FilePacket {
    const START: u8 = 0;
    const DATA: u8 = 1;
    const END: u8 = 2;
    const CANCEL: u8 = 3;

    pub fn seq(&self) -> u32 {
        match self {
            FilePacket::Start { seq, .. }
            | FilePacket::Data { seq, .. }
            | FilePacket::End { seq, .. }
            | FilePacket::Cancel { seq } => *seq,
        }
    }

    /// Encodes with the FILE packet type prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            FilePacket::Start { seq, size, name } => {
                body.push(Self::START);
                body.extend_from_slice(&seq.to_be_bytes());
                body.extend_from_slice(&size.to_be_bytes());
                let name = &name.as_bytes()[..name.len().min(usize::from(u8::MAX))];
                body.push(name.len() as u8);
                body.extend_from_slice(name);
            }
            FilePacket::Data { seq, offset, bytes } => {
                body.push(Self::DATA);
                body.extend_from_slice(&seq.to_be_bytes());
                body.extend_from_slice(&offset.to_be_bytes());
                let bytes = &bytes[..bytes.len().min(usize::from(u16::MAX))];
                body.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                body.extend_from_slice(bytes);
            }
            FilePacket::End { seq, checksum } => {
                body.push(Self::END);
                body.extend_from_slice(&seq.to_be_bytes());
                body.extend_from_slice(&checksum.to_be_bytes());
            }
            FilePacket::Cancel { seq } => {
                body.push(Self::CANCEL);
                body.extend_from_slice(&seq.to_be_bytes());
            }
        }
        packet(PacketType::File, &body)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, UplinkError> {
        if PacketType::of(bytes) != Some(PacketType::File) {
            return Err(UplinkError::Malformed);
        }
        let body = &bytes[PACKET_TYPE_SIZE..];
        let kind = *body.first().ok_or(UplinkError::Malformed)?;
        let seq = read_u32(body, 1).ok_or(UplinkError::Malformed)?;
        match kind {
            Self::START => {
                let size = read_u32(body, 5).ok_or(UplinkError::Malformed)?;
                let len = usize::from(*body.get(9).ok_or(UplinkError::Malformed)?);
                let name = body.get(10..10 + len).ok_or(UplinkError::Malformed)?;
                let name = String::from_utf8(name.to_vec()).map_err(|_| UplinkError::Malformed)?;
                Ok(FilePacket::Start { seq, size, name })
            }
            Self::DATA => {
                let offset = read_u32(body, 5).ok_or(UplinkError::Malformed)?;
                let len = usize::from(read_u16(body, 9).ok_or(UplinkError::Malformed)?);
                let data = body.get(11..11 + len).ok_or(UplinkError::Malformed)?;
                Ok(FilePacket::Data {
                    seq,
                    offset,
                    bytes: data.to_vec(),
                })
            }
            Self::END => {
                let checksum = read_u32(body, 5).ok_or(UplinkError::Malformed)?;
                Ok(FilePacket::End { seq, checksum })
            }
            Self::CANCEL => Ok(FilePacket::Cancel { seq }),
            _ => Err(UplinkError::Malformed),
        }
    }

    /// Splits `data` into START, DATA and END packets.
    pub fn split(name: &str, data: &[u8], chunk: usize) -> Vec<FilePacket> {
        let mut packets = vec![FilePacket::Start {
            seq: 0,
            size: data.len() as u32,
            name: name.to_string(),
        }];
        let mut seq = 1;
        for (i, piece) in data.chunks(chunk.max(1)).enumerate() {
            packets.push(FilePacket::Data {
                seq,
                offset: (i * chunk.max(1)) as u32,
                bytes: piece.to_vec(),
            });
            seq += 1;
        }
        packets.push(FilePacket::End {
            seq,
            checksum: crc32(data),
        });
        packets
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkedFile {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct Transfer {
    name: String,
    data: Vec<u8>,
    received: usize,
    next_seq: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkStats {
    pub files: u32,
    pub packets: u32,
    pub errors: u32,
}

pub struct FileUplink {
    max_file_size: usize,
    transfer: Option<Transfer>,
    completed: VecDeque<UplinkedFile>,
    stats: UplinkStats,
}

impl FileUplink {
    pub const BUFFER_SEND_IN: usize = 0;
    pub const BUFFER_RETURN_OUT: usize = 1;
    pub const LOG: usize = 2;
    pub const PING_IN: usize = 3;
    pub const PING_OUT: usize = 4;

    pub const EVENT_STARTED: u32 = 0;
    pub const EVENT_RECEIVED: u32 = 1;
    pub const EVENT_FAILED: u32 = 2;
    pub const EVENT_CANCELED: u32 = 3;

    pub fn new(max_file_size: usize) -> Self {
        Self {
            max_file_size,
            transfer: None,
            completed: VecDeque::with_capacity(MAX_COMPLETED),
            stats: UplinkStats::default(),
        }
    }

    pub fn stats(&self) -> UplinkStats {
        self.stats
    }

    pub fn take_completed(&mut self) -> Vec<UplinkedFile> {
        self.completed.drain(..).collect()
    }

    /// Applies one packet to the transfer state.
    pub fn apply(&mut self, packet: FilePacket) -> Result<Option<&UplinkedFile>, UplinkError> {
        self.stats.packets += 1;
        if let FilePacket::Start { size, name, .. } = &packet {
            if packet.seq() != 0 {
                return Err(UplinkError::OutOfOrder {
                    expected: 0,
                    got: packet.seq(),
                });
            }
            let size = *size as usize;
            if size > self.max_file_size {
                return Err(UplinkError::TooLarge(size));
            }
            self.transfer = Some(Transfer {
                name: name.clone(),
                data: vec![0; size],
                received: 0,
                next_seq: 1,
            });
            return Ok(None);
        }

        let transfer = self.transfer.as_mut().ok_or(UplinkError::NotReceiving)?;
        if packet.seq() != transfer.next_seq {
            let expected = transfer.next_seq;
            self.transfer = None;
            return Err(UplinkError::OutOfOrder {
                expected,
                got: packet.seq(),
            });
        }
        transfer.next_seq += 1;

        match packet {
            FilePacket::Data { offset, bytes, .. } => {
                let offset = offset as usize;
                let size = transfer.data.len();
                let Some(target) = transfer.data.get_mut(offset..offset + bytes.len()) else {
                    self.transfer = None;
                    return Err(UplinkError::OutOfBounds {
                        offset,
                        len: bytes.len(),
                        size,
                    });
                };
                target.copy_from_slice(&bytes);
                transfer.received += bytes.len();
                Ok(None)
            }
            FilePacket::End { checksum, .. } => {
                let Some(transfer) = self.transfer.take() else {
                    return Err(UplinkError::NotReceiving);
                };
                if transfer.received != transfer.data.len() {
                    return Err(UplinkError::Incomplete {
                        received: transfer.received,
                        size: transfer.data.len(),
                    });
                }
                let got = crc32(&transfer.data);
                if got != checksum {
                    return Err(UplinkError::Checksum {
                        expected: checksum,
                        got,
                    });
                }
                if self.completed.len() == MAX_COMPLETED {
                    self.completed.pop_front();
                }
                self.completed.push_back(UplinkedFile {
                    name: transfer.name,
                    data: transfer.data,
                });
                self.stats.files += 1;
                Ok(self.completed.back())
            }
            FilePacket::Cancel { .. } => {
                self.transfer = None;
                Ok(None)
            }
            FilePacket::Start { .. } => Ok(None),
        }
    }
}

impl Component for FileUplink {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Active
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("bufferSendIn", PortType::Buffer, InvocationMode::Async),
            PortSpec::output("bufferReturnOut", PortType::Buffer),
            PortSpec::output("Log", PortType::Log),
            PortSpec::input("PingIn", PortType::Ping, InvocationMode::Async),
            PortSpec::output("PingOut", PortType::Ping),
        ]
    }

    fn handle(
        &mut self,
        ctx: &PortContext<'_>,
        port: usize,
        _index: usize,
        args: PortArgs,
    ) -> PortResult {
        match (port, args) {
            (Self::BUFFER_SEND_IN, PortArgs::Buffer(buffer)) => {
                let decoded = FilePacket::decode(buffer.as_slice());
                ctx.invoke(Self::BUFFER_RETURN_OUT, 0, PortArgs::Buffer(buffer))?;

                let outcome = decoded.and_then(|packet| {
                    let started = match &packet {
                        FilePacket::Start { name, size, .. } => Some(format!("receiving {name} ({size} bytes)")),
                        FilePacket::Cancel { .. } => {
                            ctx.log(Self::LOG, Self::EVENT_CANCELED, Severity::ActivityHi, "file uplink canceled");
                            None
                        }
                        _ => None,
                    };
                    let done = self
                        .apply(packet)?
                        .map(|file| format!("received {} ({} bytes)", file.name, file.data.len()));
                    Ok((started, done))
                });

                match outcome {
                    Ok((started, done)) => {
                        if let Some(text) = started {
                            ctx.log(Self::LOG, Self::EVENT_STARTED, Severity::ActivityLo, &text);
                        }
                        if let Some(text) = done {
                            ctx.log(Self::LOG, Self::EVENT_RECEIVED, Severity::ActivityHi, &text);
                        }
                    }
                    Err(e) => {
                        self.stats.errors += 1;
                        debug!(error = %e, "file packet rejected");
                        ctx.log(Self::LOG, Self::EVENT_FAILED, Severity::WarningHi, &e.to_string());
                    }
                }
                Ok(None)
            }
            (Self::PING_IN, PortArgs::Ping { key }) => ctx.invoke(Self::PING_OUT, 0, PortArgs::Ping { key }),
            _ => Err(PortError::Unhandled { port: "FileUplink" }),
        }
    }
}
