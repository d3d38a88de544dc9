//! Port declarations and the typed arguments carried across connections.
//!
//! Every port has a direction, a [`PortType`] that fixes which
//! [`PortArgs`] variant it carries, and an [`InvocationMode`] that fixes how
//! an input is executed when invoked. Ports may be arrays; each index is an
//! independent connection point.

use crate::buffer::{Buffer, BufferError};
use crate::events::EventRecord;
use crate::svc::com_queue::ComQueueError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub usize);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationMode {
    /// Runs on the caller's thread.
    Sync,
    /// Runs on the caller's thread under the instance lock; the only mode
    /// that tolerates several producers on one input index.
    Guarded,
    /// Enqueued on the target's message queue; the caller returns at once.
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    Sched,
    Ping,
    Buffer,
    BufferGet,
    ComStatus,
    Cmd,
    CmdReg,
    CmdResponse,
    Log,
    FatalAnnounce,
    Watchdog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComStatus {
    Ready,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResponse {
    Ok,
    InvalidOpcode,
    ValidationError,
    FormatError,
    ExecutionError,
    Busy,
}

/// Static description of one port, as declared by a component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub name: &'static str,
    pub direction: PortDirection,
    pub port_type: PortType,
    pub mode: InvocationMode,
    pub size: usize,
    pub mandatory: bool,
    pub multi_producer: bool,
}

impl PortSpec {
    pub fn input(name: &'static str, port_type: PortType, mode: InvocationMode) -> Self {
        Self {
            name,
            direction: PortDirection::Input,
            port_type,
            mode,
            size: 1,
            mandatory: false,
            multi_producer: false,
        }
    }

    pub fn output(name: &'static str, port_type: PortType) -> Self {
        Self {
            name,
            direction: PortDirection::Output,
            port_type,
            mode: InvocationMode::Sync,
            size: 1,
            mandatory: false,
            multi_producer: false,
        }
    }

    pub fn array(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Every index must have at least one producer at build time.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Several outputs may target the same index. Only meaningful for
    /// guarded or async inputs.
    pub fn multi_producer(mut self) -> Self {
        self.multi_producer = true;
        self
    }

    pub fn is_input(&self) -> bool {
        self.direction == PortDirection::Input
    }
}

/// One end of a connection: a specific index of a specific port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub instance: InstanceId,
    pub port: usize,
    pub index: usize,
}

/// Arguments carried by a port invocation. Ownership of any contained
/// [`Buffer`] moves with the call.
#[derive(Debug)]
pub enum PortArgs {
    Sched { context: u32 },
    Ping { key: u32 },
    Buffer(Buffer),
    BufferGet { size: usize },
    ComStatus(ComStatus),
    Cmd { opcode: u32, seq: u32, args: Vec<u8> },
    CmdReg { opcode: u32 },
    CmdResponse { opcode: u32, seq: u32, response: CommandResponse },
    Log(EventRecord),
    FatalAnnounce { instance: String },
    Watchdog { code: u32 },
}

impl PortArgs {
    pub fn port_type(&self) -> PortType {
        match self {
            PortArgs::Sched { .. } => PortType::Sched,
            PortArgs::Ping { .. } => PortType::Ping,
            PortArgs::Buffer(_) => PortType::Buffer,
            PortArgs::BufferGet { .. } => PortType::BufferGet,
            PortArgs::ComStatus(_) => PortType::ComStatus,
            PortArgs::Cmd { .. } => PortType::Cmd,
            PortArgs::CmdReg { .. } => PortType::CmdReg,
            PortArgs::CmdResponse { .. } => PortType::CmdResponse,
            PortArgs::Log(_) => PortType::Log,
            PortArgs::FatalAnnounce { .. } => PortType::FatalAnnounce,
            PortArgs::Watchdog { .. } => PortType::Watchdog,
        }
    }

    pub fn into_buffer(self) -> Option<Buffer> {
        match self {
            PortArgs::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }
}

/// A queued invocation of one of the owner's async inputs.
#[derive(Debug)]
pub struct Message {
    pub port: usize,
    pub index: usize,
    pub args: PortArgs,
    pub enqueued_at: Instant,
}

/// Synchronous ports may hand a value back to the caller.
pub type PortResult = Result<Option<PortArgs>, PortError>;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("{instance} has no port {port}")]
    NoSuchPort { instance: String, port: String },
    #[error("{instance}.{port} cannot be invoked in this direction")]
    WrongDirection { instance: String, port: &'static str },
    #[error("index {index} out of range for {instance}.{port}[{size}]")]
    PortIndexOutOfRange {
        instance: String,
        port: &'static str,
        index: usize,
        size: usize,
    },
    #[error("{port} carries {expected:?}, got {got:?}")]
    TypeMismatch {
        port: &'static str,
        expected: PortType,
        got: PortType,
    },
    #[error("message queue of {instance} is full")]
    QueueFull { instance: String },
    #[error("message queue of {instance} overflowed")]
    QueueOverflow { instance: String },
    #[error("message queue of {instance} is closed")]
    QueueClosed { instance: String },
    #[error("{port} received arguments it does not handle")]
    Unhandled { port: &'static str },
    #[error("unexpected reply from {port}")]
    UnexpectedReply { port: &'static str },
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    ComQueue(#[from] ComQueueError),
    #[error("{0}")]
    Rejected(String),
}
