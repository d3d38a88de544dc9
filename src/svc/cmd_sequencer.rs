//! Command sequencer.
//!
//! A sequence is a flat list of records, each `opcode: u32` then
//! `arg_len: u16` then the argument bytes, closed by a terminator opcode.
//! The sequencer copies it into a pooled buffer, sends one command at a
//! time, and waits for that command's response before advancing.
//!
//! ```text
//! Idle -> Loading -> Running -> WaitingResponse -> Running -> ... -> Complete
//!                                     |
//!                                     +-> Error (failed response or timeout)
//! ```

use crate::buffer::{Buffer, BufferError, BufferManager};
use crate::component::{Component, ComponentKind, PortContext};
use crate::events::Severity;
use crate::framing::{read_u16, read_u32};
use crate::port::{CommandResponse, InvocationMode, PortArgs, PortError, PortResult, PortSpec, PortType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const TERMINATOR: u32 = 0xFFFF_FFFF;
pub const RECORD_HEADER_SIZE: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequencerError {
    #[error("a sequence is already running")]
    Busy,
    #[error("sequence of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("malformed sequence record at byte {0}")]
    Format(usize),
    #[error("command argument of {0} bytes is too long")]
    ArgumentTooLong(usize),
    #[error("no command is awaiting a response")]
    NotWaiting,
    #[error("response for {got:#x} while waiting on {expected:#x}")]
    UnexpectedResponse { expected: u32, got: u32 },
    #[error("command {opcode:#x} failed with {response:?}")]
    CommandFailed { opcode: u32, response: CommandResponse },
    #[error("timed out waiting for command {opcode:#x}")]
    Timeout { opcode: u32 },
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record<'a> {
    Command {
        opcode: u32,
        args: &'a [u8],
        next: usize,
    },
    End,
}

pub fn decode_record(bytes: &[u8], at: usize) -> Result<Record<'_>, SequencerError> {
    let opcode = read_u32(bytes, at).ok_or(SequencerError::Format(at))?;
    if opcode == TERMINATOR {
        return Ok(Record::End);
    }
    let len = usize::from(read_u16(bytes, at + 4).ok_or(SequencerError::Format(at))?);
    let start = at + RECORD_HEADER_SIZE;
    let args = bytes
        .get(start..start + len)
        .ok_or(SequencerError::Format(at))?;
    Ok(Record::Command {
        opcode,
        args,
        next: start + len,
    })
}

/// Walks every record; returns the command count.
pub fn validate(bytes: &[u8]) -> Result<usize, SequencerError> {
    let mut at = 0;
    let mut count = 0;
    loop {
        match decode_record(bytes, at)? {
            Record::Command { next, .. } => {
                count += 1;
                at = next;
            }
            Record::End => {
                if at + 4 != bytes.len() {
                    return Err(SequencerError::Format(at + 4));
                }
                return Ok(count);
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SequenceBuilder {
    bytes: Vec<u8>,
}

impl SequenceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command(mut self, opcode: u32, args: &[u8]) -> Result<Self, SequencerError> {
        let len = u16::try_from(args.len()).map_err(|_| SequencerError::ArgumentTooLong(args.len()))?;
        self.bytes.extend_from_slice(&opcode.to_be_bytes());
        self.bytes.extend_from_slice(&len.to_be_bytes());
        self.bytes.extend_from_slice(args);
        Ok(self)
    }

    pub fn build(mut self) -> Vec<u8> {
        self.bytes.extend_from_slice(&TERMINATOR.to_be_bytes());
        self.bytes
    }
}

/// JSON form of a sequence, as authored on the ground.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceFile {
    pub commands: Vec<SequenceStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceStep {
    pub opcode: u32,
    #[serde(with = "serde_bytes", default)]
    pub args: Vec<u8>,
}

impl SequenceFile {
    pub fn encode(&self) -> Result<Vec<u8>, SequencerError> {
        let builder = self
            .commands
            .iter()
            .try_fold(SequenceBuilder::new(), |builder, step| builder.command(step.opcode, &step.args))?;
        Ok(builder.build())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequencerState {
    Idle,
    Loading,
    Running,
    WaitingResponse,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Send { opcode: u32, args: Vec<u8> },
    Complete,
    Idle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerStats {
    pub loaded: u32,
    pub completed: u32,
    pub failed: u32,
    pub commands_sent: u32,
    pub timeouts: u32,
}

/// Port-free sequencing state. Complete and Error are terminal for a run;
/// a new `load` is accepted from either.
pub struct Sequencer {
    manager: Arc<BufferManager>,
    max_size: usize,
    timeout_ticks: u32,
    state: SequencerState,
    buffer: Option<Buffer>,
    cursor: usize,
    next: usize,
    in_flight: Option<u32>,
    waited: u32,
    stats: SequencerStats,
}

impl Sequencer {
    /// `timeout_ticks == 0` waits forever.
    pub fn new(manager: Arc<BufferManager>, max_size: usize, timeout_ticks: u32) -> Self {
        Self {
            manager,
            max_size,
            timeout_ticks,
            state: SequencerState::Idle,
            buffer: None,
            cursor: 0,
            next: 0,
            in_flight: None,
            waited: 0,
            stats: SequencerStats::default(),
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn stats(&self) -> SequencerStats {
        self.stats
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self.state,
            SequencerState::Loading | SequencerState::Running | SequencerState::WaitingResponse
        )
    }

    pub fn load(&mut self, encoded: &[u8]) -> Result<usize, SequencerError> {
        if self.is_busy() {
            return Err(SequencerError::Busy);
        }
        if encoded.len() > self.max_size {
            return Err(SequencerError::TooLarge {
                size: encoded.len(),
                limit: self.max_size,
            });
        }
        self.state = SequencerState::Loading;

        let loaded = validate(encoded).and_then(|count| {
            let mut buffer = self.manager.allocate(encoded.len())?;
            if let Err(e) = buffer.fill_from(encoded) {
                let _ = self.manager.deallocate(buffer);
                return Err(e.into());
            }
            Ok((count, buffer))
        });
        match loaded {
            Ok((count, buffer)) => {
                self.buffer = Some(buffer);
                self.cursor = 0;
                self.next = 0;
                self.in_flight = None;
                self.waited = 0;
                self.state = SequencerState::Running;
                self.stats.loaded += 1;
                debug!(commands = count, bytes = encoded.len(), "sequence loaded");
                Ok(count)
            }
            Err(e) => {
                self.state = SequencerState::Error;
                self.stats.failed += 1;
                Err(e)
            }
        }
    }

    pub fn step(&mut self) -> Result<Step, SequencerError> {
        if self.state != SequencerState::Running {
            return Ok(Step::Idle);
        }
        let decoded = match self.buffer.as_ref() {
            Some(buffer) => match decode_record(buffer.as_slice(), self.cursor) {
                Ok(Record::Command { opcode, args, next }) => Ok(Some((opcode, args.to_vec(), next))),
                Ok(Record::End) => Ok(None),
                Err(e) => Err(e),
            },
            None => Err(SequencerError::Format(self.cursor)),
        };

        match decoded {
            Ok(Some((opcode, args, next))) => {
                self.next = next;
                self.in_flight = Some(opcode);
                self.waited = 0;
                self.state = SequencerState::WaitingResponse;
                self.stats.commands_sent += 1;
                Ok(Step::Send { opcode, args })
            }
            Ok(None) => {
                self.release();
                self.state = SequencerState::Complete;
                self.stats.completed += 1;
                Ok(Step::Complete)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    pub fn response(&mut self, opcode: u32, response: CommandResponse) -> Result<(), SequencerError> {
        let (SequencerState::WaitingResponse, Some(expected)) = (self.state, self.in_flight) else {
            return Err(SequencerError::NotWaiting);
        };
        if expected != opcode {
            return Err(SequencerError::UnexpectedResponse {
                expected,
                got: opcode,
            });
        }
        self.in_flight = None;
        if response == CommandResponse::Ok {
            self.cursor = self.next;
            self.state = SequencerState::Running;
            Ok(())
        } else {
            self.abort();
            Err(SequencerError::CommandFailed { opcode, response })
        }
    }

    /// Counts one schedule tick against the command in flight.
    pub fn tick(&mut self) -> Result<(), SequencerError> {
        if self.state != SequencerState::WaitingResponse || self.timeout_ticks == 0 {
            return Ok(());
        }
        self.waited += 1;
        if self.waited < self.timeout_ticks {
            return Ok(());
        }
        let opcode = self.in_flight.unwrap_or(0);
        self.stats.timeouts += 1;
        self.abort();
        Err(SequencerError::Timeout { opcode })
    }

    /// Stops the current run and releases its buffer. Returns whether a run
    /// was active.
    pub fn cancel(&mut self) -> bool {
        if !self.is_busy() {
            return false;
        }
        self.release();
        self.in_flight = None;
        self.state = SequencerState::Idle;
        true
    }

    pub fn abort(&mut self) {
        self.release();
        self.in_flight = None;
        self.state = SequencerState::Error;
        self.stats.failed += 1;
    }

    fn release(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if let Err(e) = self.manager.deallocate(buffer) {
                warn!(error = %e, "sequence buffer not returned");
            }
        }
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct CmdSequencer {
    sequencer: Sequencer,
    next_seq: u32,
    awaiting: Option<u32>,
}

impl CmdSequencer {
    pub const CMD_IN: usize = 0;
    pub const CMD_REG_OUT: usize = 1;
    pub const CMD_RESPONSE_OUT: usize = 2;
    pub const COM_CMD_OUT: usize = 3;
    pub const CMD_RESPONSE_IN: usize = 4;
    pub const SCHED_IN: usize = 5;
    pub const LOG: usize = 6;
    pub const PING_IN: usize = 7;
    pub const PING_OUT: usize = 8;

    pub const OPCODE_CS_RUN: u32 = 0;
    pub const OPCODE_CS_CANCEL: u32 = 1;

    pub const EVENT_LOADED: u32 = 0;
    pub const EVENT_COMPLETE: u32 = 1;
    pub const EVENT_COMMAND_FAILED: u32 = 2;
    pub const EVENT_TIMEOUT: u32 = 3;
    pub const EVENT_BUSY: u32 = 4;
    pub const EVENT_LOAD_FAILED: u32 = 5;
    pub const EVENT_CANCELED: u32 = 6;

    pub fn new(sequencer: Sequencer) -> Self {
        Self {
            sequencer,
            next_seq: 0,
            awaiting: None,
        }
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    fn advance(&mut self, ctx: &PortContext<'_>) {
        match self.sequencer.step() {
            Ok(Step::Send { opcode, args }) => {
                let seq = self.next_seq;
                self.next_seq = self.next_seq.wrapping_add(1);
                self.awaiting = Some(seq);
                if let Err(e) = ctx.invoke(Self::COM_CMD_OUT, 0, PortArgs::Cmd { opcode, seq, args }) {
                    self.awaiting = None;
                    self.sequencer.abort();
                    ctx.log(
                        Self::LOG,
                        Self::EVENT_COMMAND_FAILED,
                        Severity::WarningHi,
                        &format!("could not send {opcode:#x}: {e}"),
                    );
                }
            }
            Ok(Step::Complete) => ctx.log(
                Self::LOG,
                Self::EVENT_COMPLETE,
                Severity::ActivityHi,
                &format!("sequence complete ({} runs)", self.sequencer.stats().completed),
            ),
            Ok(Step::Idle) => {}
            Err(e) => ctx.log(
                Self::LOG,
                Self::EVENT_COMMAND_FAILED,
                Severity::WarningHi,
                &format!("sequence aborted: {e}"),
            ),
        }
    }

    fn run_command(&mut self, ctx: &PortContext<'_>, opcode: u32, args: &[u8]) -> CommandResponse {
        match opcode.wrapping_sub(ctx.base_id()) {
            Self::OPCODE_CS_RUN => match self.sequencer.load(args) {
                Ok(count) => {
                    ctx.log(
                        Self::LOG,
                        Self::EVENT_LOADED,
                        Severity::ActivityHi,
                        &format!("sequence loaded with {count} commands"),
                    );
                    self.advance(ctx);
                    CommandResponse::Ok
                }
                Err(SequencerError::Busy) => {
                    ctx.log(Self::LOG, Self::EVENT_BUSY, Severity::WarningHi, "sequencer busy");
                    CommandResponse::Busy
                }
                Err(e) => {
                    ctx.log(
                        Self::LOG,
                        Self::EVENT_LOAD_FAILED,
                        Severity::WarningHi,
                        &format!("sequence rejected: {e}"),
                    );
                    match e {
                        SequencerError::Buffer(_) => CommandResponse::ExecutionError,
                        _ => CommandResponse::ValidationError,
                    }
                }
            },
            Self::OPCODE_CS_CANCEL => {
                if self.sequencer.cancel() {
                    self.awaiting = None;
                    ctx.log(Self::LOG, Self::EVENT_CANCELED, Severity::ActivityHi, "sequence canceled");
                }
                CommandResponse::Ok
            }
            _ => CommandResponse::InvalidOpcode,
        }
    }
}

impl Component for CmdSequencer {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Active
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("cmdIn", PortType::Cmd, InvocationMode::Async),
            PortSpec::output("cmdRegOut", PortType::CmdReg),
            PortSpec::output("cmdResponseOut", PortType::CmdResponse),
            PortSpec::output("comCmdOut", PortType::Cmd),
            PortSpec::input("cmdResponseIn", PortType::CmdResponse, InvocationMode::Async),
            PortSpec::input("schedIn", PortType::Sched, InvocationMode::Async),
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
            (Self::CMD_IN, PortArgs::Cmd { opcode, seq, args }) => {
                let response = self.run_command(ctx, opcode, &args);
                ctx.invoke(
                    Self::CMD_RESPONSE_OUT,
                    0,
                    PortArgs::CmdResponse { opcode, seq, response },
                )
            }
            (Self::CMD_RESPONSE_IN, PortArgs::CmdResponse { opcode, seq, response }) => {
                if self.awaiting != Some(seq) {
                    warn!(opcode, seq, "stale command response ignored");
                    return Ok(None);
                }
                self.awaiting = None;
                match self.sequencer.response(opcode, response) {
                    Ok(()) => self.advance(ctx),
                    Err(e) => ctx.log(
                        Self::LOG,
                        Self::EVENT_COMMAND_FAILED,
                        Severity::WarningHi,
                        &format!("sequence aborted: {e}"),
                    ),
                }
                Ok(None)
            }
            (Self::SCHED_IN, PortArgs::Sched { .. }) => {
                if let Err(e) = self.sequencer.tick() {
                    self.awaiting = None;
                    ctx.log(Self::LOG, Self::EVENT_TIMEOUT, Severity::WarningHi, &e.to_string());
                }
                Ok(None)
            }
            (Self::PING_IN, PortArgs::Ping { key }) => ctx.invoke(Self::PING_OUT, 0, PortArgs::Ping { key }),
            _ => Err(PortError::Unhandled { port: "CmdSequencer" }),
        }
    }

    fn register_commands(&mut self, ctx: &PortContext<'_>) -> Result<(), PortError> {
        for opcode in [Self::OPCODE_CS_RUN, Self::OPCODE_CS_CANCEL] {
            ctx.invoke(
                Self::CMD_REG_OUT,
                0,
                PortArgs::CmdReg {
                    opcode: ctx.base_id() + opcode,
                },
            )?;
        }
        Ok(())
    }

    fn teardown(&mut self, _ctx: &PortContext<'_>) {
        self.sequencer.cancel();
    }
}
