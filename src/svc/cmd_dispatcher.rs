//! Command dispatcher.
//!
//! Components register opcodes on `compCmdReg[i]`; the dispatcher then
//! routes matching commands out of `compCmdSend[i]` and matches the
//! asynchronous responses on `compCmdStat[i]` back to whoever issued the
//! command: a sequencer on `seqCmdIn[k]`, or the ground via `cmdBuffIn`.

use crate::component::{Component, ComponentKind, PortContext};
use crate::events::Severity;
use crate::framing::{read_u32, PacketType, PACKET_TYPE_SIZE};
use crate::port::{CommandResponse, InvocationMode, PortArgs, PortError, PortResult, PortSpec, PortType};
use heapless::FnvIndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const MAX_OPCODES: usize = 128;
pub const MAX_PENDING: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Ground,
    Sequencer { port: usize, seq: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    opcode: u32,
    origin: Origin,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub dispatched: u32,
    pub completed: u32,
    pub failed: u32,
    pub invalid: u32,
}

pub struct CommandDispatcher {
    handlers: usize,
    sequencers: usize,
    opcodes: FnvIndexMap<u32, usize, MAX_OPCODES>,
    pending: FnvIndexMap<u32, Pending, MAX_PENDING>,
    next_seq: u32,
    stats: DispatcherStats,
}

impl CommandDispatcher {
    pub const COMP_CMD_SEND: usize = 0;
    pub const COMP_CMD_STAT: usize = 1;
    pub const COMP_CMD_REG: usize = 2;
    pub const SEQ_CMD_IN: usize = 3;
    pub const SEQ_CMD_STATUS: usize = 4;
    pub const CMD_BUFF_IN: usize = 5;
    pub const BUFFER_RETURN_OUT: usize = 6;
    pub const LOG: usize = 7;
    pub const PING_IN: usize = 8;
    pub const PING_OUT: usize = 9;

    pub const OPCODE_NO_OP: u32 = 0;
    pub const OPCODE_CLEAR_TRACKING: u32 = 1;

    pub const EVENT_DISPATCHED: u32 = 0;
    pub const EVENT_COMPLETED: u32 = 1;
    pub const EVENT_FAILED: u32 = 2;
    pub const EVENT_INVALID_OPCODE: u32 = 3;
    pub const EVENT_MALFORMED: u32 = 4;
    pub const EVENT_NO_OP: u32 = 5;
    pub const EVENT_DUPLICATE_OPCODE: u32 = 6;

    pub fn new(handlers: usize, sequencers: usize) -> Self {
        Self {
            handlers: handlers.max(1),
            sequencers: sequencers.max(1),
            opcodes: FnvIndexMap::new(),
            pending: FnvIndexMap::new(),
            next_seq: 0,
            stats: DispatcherStats::default(),
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats
    }

    pub fn registered(&self, opcode: u32) -> Option<usize> {
        self.opcodes.get(&opcode).copied()
    }

    pub fn opcode_count(&self) -> usize {
        self.opcodes.len()
    }

    fn register(&mut self, ctx: &PortContext<'_>, port: usize, opcode: u32) -> Result<(), PortError> {
        if let Some(&existing) = self.opcodes.get(&opcode) {
            ctx.log(
                Self::LOG,
                Self::EVENT_DUPLICATE_OPCODE,
                Severity::WarningHi,
                &format!("opcode {opcode:#x} already registered on port {existing}"),
            );
            return Err(PortError::Rejected(format!("duplicate opcode {opcode:#x}")));
        }
        self.opcodes
            .insert(opcode, port)
            .map_err(|_| PortError::Rejected(format!("opcode table full at {opcode:#x}")))?;
        debug!(opcode, port, "opcode registered");
        Ok(())
    }

    fn dispatch(&mut self, ctx: &PortContext<'_>, opcode: u32, args: Vec<u8>, origin: Origin) {
        let local = opcode.wrapping_sub(ctx.base_id());
        if local == Self::OPCODE_NO_OP {
            ctx.log(Self::LOG, Self::EVENT_NO_OP, Severity::ActivityHi, "no-op received");
            self.finish(ctx, opcode, origin, CommandResponse::Ok);
            return;
        }
        if local == Self::OPCODE_CLEAR_TRACKING {
            self.pending.clear();
            self.finish(ctx, opcode, origin, CommandResponse::Ok);
            return;
        }

        let Some(&port) = self.opcodes.get(&opcode) else {
            self.stats.invalid += 1;
            ctx.log(
                Self::LOG,
                Self::EVENT_INVALID_OPCODE,
                Severity::WarningHi,
                &format!("invalid opcode {opcode:#x}"),
            );
            self.respond(ctx, opcode, origin, CommandResponse::InvalidOpcode);
            return;
        };

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        if self.pending.insert(seq, Pending { opcode, origin }).is_err() {
            warn!(opcode, "command tracking table full");
            self.respond(ctx, opcode, origin, CommandResponse::Busy);
            return;
        }

        self.stats.dispatched += 1;
        ctx.log(
            Self::LOG,
            Self::EVENT_DISPATCHED,
            Severity::Command,
            &format!("opcode {opcode:#x} dispatched to port {port}"),
        );
        if let Err(e) = ctx.invoke(Self::COMP_CMD_SEND, port, PortArgs::Cmd { opcode, seq, args }) {
            warn!(opcode, error = %e, "command not delivered");
            self.pending.remove(&seq);
            self.finish(ctx, opcode, origin, CommandResponse::ExecutionError);
        }
    }

    fn complete(&mut self, ctx: &PortContext<'_>, opcode: u32, seq: u32, response: CommandResponse) {
        let Some(pending) = self.pending.remove(&seq) else {
            warn!(opcode, seq, "response for untracked command");
            return;
        };
        if pending.opcode != opcode {
            warn!(expected = pending.opcode, got = opcode, seq, "response opcode mismatch");
        }
        self.finish(ctx, pending.opcode, pending.origin, response);
    }

    fn finish(&mut self, ctx: &PortContext<'_>, opcode: u32, origin: Origin, response: CommandResponse) {
        if response == CommandResponse::Ok {
            self.stats.completed += 1;
            ctx.log(
                Self::LOG,
                Self::EVENT_COMPLETED,
                Severity::Command,
                &format!("opcode {opcode:#x} completed"),
            );
        } else {
            self.stats.failed += 1;
            ctx.log(
                Self::LOG,
                Self::EVENT_FAILED,
                Severity::Command,
                &format!("opcode {opcode:#x} failed: {response:?}"),
            );
        }
        self.respond(ctx, opcode, origin, response);
    }

    fn respond(&self, ctx: &PortContext<'_>, opcode: u32, origin: Origin, response: CommandResponse) {
        if let Origin::Sequencer { port, seq } = origin {
            let status = PortArgs::CmdResponse { opcode, seq, response };
            if let Err(e) = ctx.invoke(Self::SEQ_CMD_STATUS, port, status) {
                warn!(port, error = %e, "sequencer status not delivered");
            }
        }
    }

    /// Command packet layout: packet type, opcode, then argument bytes.
    fn parse_packet(bytes: &[u8]) -> Option<(u32, Vec<u8>)> {
        if PacketType::of(bytes)? != PacketType::Command {
            return None;
        }
        let opcode = read_u32(bytes, PACKET_TYPE_SIZE)?;
        Some((opcode, bytes[PACKET_TYPE_SIZE + 4..].to_vec()))
    }
}

/// Builds the ground command packet consumed on `cmdBuffIn`.
pub fn command_packet(opcode: u32, args: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + args.len());
    body.extend_from_slice(&opcode.to_be_bytes());
    body.extend_from_slice(args);
    crate::framing::packet(PacketType::Command, &body)
}

impl Component for CommandDispatcher {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Active
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::output("compCmdSend", PortType::Cmd).array(self.handlers),
            PortSpec::input("compCmdStat", PortType::CmdResponse, InvocationMode::Async)
                .array(self.handlers),
            PortSpec::input("compCmdReg", PortType::CmdReg, InvocationMode::Guarded)
                .array(self.handlers),
            PortSpec::input("seqCmdIn", PortType::Cmd, InvocationMode::Async).array(self.sequencers),
            PortSpec::output("seqCmdStatus", PortType::CmdResponse).array(self.sequencers),
            PortSpec::input("cmdBuffIn", PortType::Buffer, InvocationMode::Async),
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
        index: usize,
        args: PortArgs,
    ) -> PortResult {
        match (port, args) {
            (Self::COMP_CMD_REG, PortArgs::CmdReg { opcode }) => {
                self.register(ctx, index, opcode)?;
                Ok(None)
            }
            (Self::SEQ_CMD_IN, PortArgs::Cmd { opcode, seq, args }) => {
                self.dispatch(ctx, opcode, args, Origin::Sequencer { port: index, seq });
                Ok(None)
            }
            (Self::CMD_BUFF_IN, PortArgs::Buffer(buffer)) => {
                let parsed = Self::parse_packet(buffer.as_slice());
                ctx.invoke(Self::BUFFER_RETURN_OUT, 0, PortArgs::Buffer(buffer))?;
                match parsed {
                    Some((opcode, args)) => self.dispatch(ctx, opcode, args, Origin::Ground),
                    None => ctx.log(
                        Self::LOG,
                        Self::EVENT_MALFORMED,
                        Severity::WarningHi,
                        "malformed command packet",
                    ),
                }
                Ok(None)
            }
            (Self::COMP_CMD_STAT, PortArgs::CmdResponse { opcode, seq, response }) => {
                self.complete(ctx, opcode, seq, response);
                Ok(None)
            }
            (Self::PING_IN, PortArgs::Ping { key }) => ctx.invoke(Self::PING_OUT, 0, PortArgs::Ping { key }),
            _ => Err(PortError::Unhandled { port: "CommandDispatcher" }),
        }
    }
}
