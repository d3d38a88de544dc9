//! Framer and deframer components wrapping a [`FramingProtocol`].

use super::buffer_manager::request_buffer;
use crate::buffer::Buffer;
use crate::component::{Component, ComponentKind, PortContext};
use crate::events::Severity;
use crate::framing::{DeframeOutcome, FramingProtocol, PacketType};
use crate::port::{InvocationMode, PortArgs, PortError, PortResult, PortSpec, PortType};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramerStats {
    pub frames: u32,
    pub bytes: u64,
    pub failures: u32,
}

/// Frames outgoing packets into freshly allocated buffers.
///
/// Sits on the synchronous downlink path, so it reports through `tracing`
/// only; a log port here would close a call cycle through the event logger.
pub struct Framer {
    protocol: Box<dyn FramingProtocol>,
    stats: FramerStats,
}

impl Framer {
    pub const COM_IN: usize = 0;
    pub const BUFFER_GET_OUT: usize = 1;
    pub const FRAMED_OUT: usize = 2;
    pub const DATA_RETURN_OUT: usize = 3;

    pub fn new(protocol: Box<dyn FramingProtocol>) -> Self {
        Self {
            protocol,
            stats: FramerStats::default(),
        }
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    fn frame(&mut self, ctx: &PortContext<'_>, source: Buffer) -> PortResult {
        let size = self.protocol.frame_size(source.len());
        let mut framed = match request_buffer(ctx, Self::BUFFER_GET_OUT, size) {
            Ok(framed) => framed,
            Err(e) => {
                self.stats.failures += 1;
                ctx.invoke(Self::DATA_RETURN_OUT, 0, PortArgs::Buffer(source))?;
                return Err(e);
            }
        };

        let written = self
            .protocol
            .frame(source.as_slice(), framed.storage_mut())
            .map_err(|e| PortError::Rejected(e.to_string()))
            .and_then(|n| framed.set_size(n).map(|()| n).map_err(PortError::from));
        ctx.invoke(Self::DATA_RETURN_OUT, 0, PortArgs::Buffer(source))?;

        match written {
            Ok(n) => {
                self.stats.frames += 1;
                self.stats.bytes += n as u64;
                debug!(bytes = n, "frame out");
                ctx.invoke(Self::FRAMED_OUT, 0, PortArgs::Buffer(framed))
            }
            Err(e) => {
                self.stats.failures += 1;
                warn!(error = %e, "framing failed");
                ctx.invoke(Self::DATA_RETURN_OUT, 0, PortArgs::Buffer(framed))?;
                Err(e)
            }
        }
    }
}

impl Component for Framer {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Passive
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("comIn", PortType::Buffer, InvocationMode::Guarded).mandatory(),
            PortSpec::output("bufferGetOut", PortType::BufferGet),
            PortSpec::output("framedOut", PortType::Buffer),
            PortSpec::output("dataReturnOut", PortType::Buffer),
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
            (Self::COM_IN, PortArgs::Buffer(source)) => self.frame(ctx, source),
            _ => Err(PortError::Unhandled { port: "Framer" }),
        }
    }
}

pub const DEFAULT_RING_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeframerStats {
    pub frames: u32,
    pub commands: u32,
    pub files: u32,
    pub discarded_bytes: u64,
    pub dropped_bytes: u64,
    pub unknown_packets: u32,
}

/// Reassembles frames from raw link bytes and routes their packets.
///
/// Corrupted input costs only the offending bytes: the accumulator skips
/// forward to the next candidate start word and carries on.
pub struct Deframer {
    protocol: Box<dyn FramingProtocol>,
    pending: Vec<u8>,
    capacity: usize,
    stats: DeframerStats,
}

impl Deframer {
    pub const FRAMED_IN: usize = 0;
    pub const BUFFER_RETURN_OUT: usize = 1;
    pub const BUFFER_GET_OUT: usize = 2;
    pub const COM_OUT: usize = 3;
    pub const FILE_OUT: usize = 4;
    pub const LOG: usize = 5;
    pub const PING_IN: usize = 6;
    pub const PING_OUT: usize = 7;

    pub const EVENT_DISCARDED: u32 = 0;
    pub const EVENT_OVERFLOW: u32 = 1;
    pub const EVENT_UNKNOWN_PACKET: u32 = 2;

    pub fn new(protocol: Box<dyn FramingProtocol>) -> Self {
        Self::with_capacity(protocol, DEFAULT_RING_SIZE)
    }

    pub fn with_capacity(protocol: Box<dyn FramingProtocol>, capacity: usize) -> Self {
        Self {
            protocol,
            pending: Vec::with_capacity(capacity),
            capacity,
            stats: DeframerStats::default(),
        }
    }

    pub fn stats(&self) -> DeframerStats {
        self.stats
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    fn accept(&mut self, ctx: &PortContext<'_>, raw: Buffer) -> Result<(), PortError> {
        let room = self.capacity - self.pending.len();
        let take = raw.len().min(room);
        self.pending.extend_from_slice(&raw.as_slice()[..take]);
        let dropped = raw.len() - take;
        ctx.invoke(Self::BUFFER_RETURN_OUT, 0, PortArgs::Buffer(raw))?;
        if dropped > 0 {
            self.stats.dropped_bytes += dropped as u64;
            ctx.log(
                Self::LOG,
                Self::EVENT_OVERFLOW,
                Severity::WarningHi,
                &format!("accumulator full, dropped {dropped} bytes"),
            );
        }

        let mut discarded = 0usize;
        loop {
            match self.protocol.deframe(&self.pending) {
                DeframeOutcome::NeedMore(_) => break,
                DeframeOutcome::Discard(n) => {
                    let n = n.clamp(1, self.pending.len());
                    self.pending.drain(..n);
                    discarded += n;
                    if self.pending.is_empty() {
                        break;
                    }
                }
                DeframeOutcome::Frame { payload, consumed } => {
                    self.stats.frames += 1;
                    let routed = Self::route(ctx, &self.pending[payload]);
                    self.pending.drain(..consumed);
                    match routed {
                        Ok(Some(PacketType::Command)) => self.stats.commands += 1,
                        Ok(Some(PacketType::File)) => self.stats.files += 1,
                        Ok(_) => {
                            self.stats.unknown_packets += 1;
                            ctx.log(
                                Self::LOG,
                                Self::EVENT_UNKNOWN_PACKET,
                                Severity::WarningLo,
                                "frame with unroutable packet type dropped",
                            );
                        }
                        Err(e) => warn!(error = %e, "deframed packet not delivered"),
                    }
                }
            }
        }

        if discarded > 0 {
            self.stats.discarded_bytes += discarded as u64;
            ctx.log(
                Self::LOG,
                Self::EVENT_DISCARDED,
                Severity::WarningHi,
                &format!("discarded {discarded} bytes while resynchronizing"),
            );
        }
        Ok(())
    }

    fn route(ctx: &PortContext<'_>, payload: &[u8]) -> Result<Option<PacketType>, PortError> {
        let packet_type = PacketType::of(payload);
        let port = match packet_type {
            Some(PacketType::Command) => Self::COM_OUT,
            Some(PacketType::File) => Self::FILE_OUT,
            _ => return Ok(None),
        };
        let mut buffer = request_buffer(ctx, Self::BUFFER_GET_OUT, payload.len())?;
        if let Err(e) = buffer.fill_from(payload) {
            ctx.invoke(Self::BUFFER_RETURN_OUT, 0, PortArgs::Buffer(buffer))?;
            return Err(e.into());
        }
        ctx.invoke(port, 0, PortArgs::Buffer(buffer))?;
        Ok(packet_type)
    }
}

impl Component for Deframer {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Active
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("framedIn", PortType::Buffer, InvocationMode::Async),
            PortSpec::output("bufferReturnOut", PortType::Buffer),
            PortSpec::output("bufferGetOut", PortType::BufferGet),
            PortSpec::output("comOut", PortType::Buffer),
            PortSpec::output("fileOut", PortType::Buffer),
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
            (Self::FRAMED_IN, PortArgs::Buffer(raw)) => {
                self.accept(ctx, raw)?;
                Ok(None)
            }
            (Self::PING_IN, PortArgs::Ping { key }) => ctx.invoke(Self::PING_OUT, 0, PortArgs::Ping { key }),
            _ => Err(PortError::Unhandled { port: "Deframer" }),
        }
    }
}
