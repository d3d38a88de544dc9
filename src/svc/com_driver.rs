//! Link driver: pushes framed bytes to a [`Transport`] and polls it for
//! uplink data.

use super::buffer_manager::request_buffer;
use crate::buffer::Buffer;
use crate::component::{Component, ComponentKind, PortContext};
use crate::port::{ComStatus, InvocationMode, PortArgs, PortError, PortResult, PortSpec, PortType};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::io;
use tracing::{debug, info, warn};

pub const DEFAULT_RECV_CHUNK: usize = 3000;

/// Byte pipe to the ground segment.
pub trait Transport: Send {
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Non-blocking read into `buf`. `WouldBlock` when nothing is waiting.
    fn receive(&mut self, buf: &mut [u8]) -> nb::Result<usize, io::Error>;

    fn is_connected(&self) -> bool {
        true
    }
}

/// In-process transport backed by channels. The [`TransportPeer`] is the
/// ground end: it reads what was downlinked and injects uplink bytes.
#[derive(Debug)]
pub struct ChannelTransport {
    downlink: Sender<Vec<u8>>,
    uplink: Receiver<Vec<u8>>,
    leftover: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TransportPeer {
    pub downlink: Receiver<Vec<u8>>,
    pub uplink: Sender<Vec<u8>>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, TransportPeer) {
        let (down_tx, down_rx) = unbounded();
        let (up_tx, up_rx) = unbounded();
        (
            Self {
                downlink: down_tx,
                uplink: up_rx,
                leftover: Vec::new(),
            },
            TransportPeer {
                downlink: down_rx,
                uplink: up_tx,
            },
        )
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.downlink
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "ground end closed"))
    }

    fn receive(&mut self, buf: &mut [u8]) -> nb::Result<usize, io::Error> {
        if self.leftover.is_empty() {
            match self.uplink.try_recv() {
                Ok(chunk) => self.leftover = chunk,
                Err(TryRecvError::Empty) => return Err(nb::Error::WouldBlock),
                Err(TryRecvError::Disconnected) => {
                    return Err(nb::Error::Other(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "ground end closed",
                    )))
                }
            }
        }
        let n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComDriverStats {
    pub frames_sent: u32,
    pub send_failures: u32,
    pub bytes_received: u64,
    pub receive_errors: u32,
}

/// Passive driver. `comDataIn` is guarded since the rate group polls
/// `schedIn` from another thread.
pub struct ComDriver {
    transport: Box<dyn Transport>,
    recv_chunk: usize,
    announced: bool,
    stats: ComDriverStats,
}

impl ComDriver {
    pub const COM_DATA_IN: usize = 0;
    pub const SCHED_IN: usize = 1;
    pub const COM_STATUS_OUT: usize = 2;
    pub const RECV_OUT: usize = 3;
    pub const BUFFER_GET_OUT: usize = 4;
    pub const BUFFER_RETURN_OUT: usize = 5;

    /// Upper bound on reads per poll.
    const MAX_READS_PER_POLL: usize = 16;

    pub fn new(transport: Box<dyn Transport>, recv_chunk: usize) -> Self {
        Self {
            transport,
            recv_chunk,
            announced: false,
            stats: ComDriverStats::default(),
        }
    }

    pub fn stats(&self) -> ComDriverStats {
        self.stats
    }

    fn send(&mut self, ctx: &PortContext<'_>, frame: Buffer) -> PortResult {
        let status = match self.transport.send(frame.as_slice()) {
            Ok(()) => {
                self.stats.frames_sent += 1;
                ComStatus::Ready
            }
            Err(e) => {
                self.stats.send_failures += 1;
                warn!(error = %e, "send failed");
                ComStatus::Failure
            }
        };
        ctx.invoke(Self::BUFFER_RETURN_OUT, 0, PortArgs::Buffer(frame))?;
        ctx.invoke(Self::COM_STATUS_OUT, 0, PortArgs::ComStatus(status))
    }

    fn poll(&mut self, ctx: &PortContext<'_>) -> Result<(), PortError> {
        if !self.transport.is_connected() {
            return Ok(());
        }
        if !self.announced {
            // First contact: let the com queue start draining.
            self.announced = true;
            info!(instance = ctx.name(), "link up");
            ctx.invoke(Self::COM_STATUS_OUT, 0, PortArgs::ComStatus(ComStatus::Ready))?;
        }

        for _ in 0..Self::MAX_READS_PER_POLL {
            let mut chunk = request_buffer(ctx, Self::BUFFER_GET_OUT, self.recv_chunk)?;
            match self.transport.receive(chunk.storage_mut()) {
                Ok(n) if n > 0 => {
                    chunk.set_size(n)?;
                    self.stats.bytes_received += n as u64;
                    debug!(bytes = n, "uplink bytes");
                    ctx.invoke(Self::RECV_OUT, 0, PortArgs::Buffer(chunk))?;
                }
                Ok(_) | Err(nb::Error::WouldBlock) => {
                    ctx.invoke(Self::BUFFER_RETURN_OUT, 0, PortArgs::Buffer(chunk))?;
                    break;
                }
                Err(nb::Error::Other(e)) => {
                    self.stats.receive_errors += 1;
                    warn!(error = %e, "receive failed");
                    ctx.invoke(Self::BUFFER_RETURN_OUT, 0, PortArgs::Buffer(chunk))?;
                    break;
                }
            }
        }
        Ok(())
    }
}

impl Component for ComDriver {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Passive
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("comDataIn", PortType::Buffer, InvocationMode::Guarded),
            PortSpec::input("schedIn", PortType::Sched, InvocationMode::Guarded),
            PortSpec::output("comStatusOut", PortType::ComStatus),
            PortSpec::output("recvOut", PortType::Buffer),
            PortSpec::output("bufferGetOut", PortType::BufferGet),
            PortSpec::output("bufferReturnOut", PortType::Buffer),
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
            (Self::COM_DATA_IN, PortArgs::Buffer(frame)) => self.send(ctx, frame),
            (Self::SCHED_IN, PortArgs::Sched { .. }) => {
                self.poll(ctx)?;
                Ok(None)
            }
            _ => Err(PortError::Unhandled { port: "ComDriver" }),
        }
    }
}
