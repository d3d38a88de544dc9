//! Ping-based liveness monitoring.
//!
//! Every monitor cycle the health component pings each enabled entry and
//! counts one miss against it. A matching ping response clears the count.
//! Reaching the warning threshold emits one warning; reaching the fatal
//! threshold emits one FATAL and announces it on the fatal port. FATAL is
//! sticky until the entry is reset by command.
//!
//! The component is queued: ping responses and commands accumulate on its
//! queue and are dispatched at the start of each `Run` call, before the new
//! round of pings goes out.

use crate::component::{Component, ComponentKind, PortContext};
use crate::config::ConfigError;
use crate::events::Severity;
use crate::port::{CommandResponse, InvocationMode, PortArgs, PortError, PortResult, PortSpec, PortType};
use heapless::Vec as BoundedVec;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const MAX_PING_ENTRIES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingEntry {
    pub name: String,
    pub warn_cycles: u32,
    pub fatal_cycles: u32,
}

impl PingEntry {
    pub fn new(name: &str, warn_cycles: u32, fatal_cycles: u32) -> Self {
        Self {
            name: name.to_string(),
            warn_cycles,
            fatal_cycles,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingState {
    Ok,
    Warn,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingTracker {
    pub entry: PingEntry,
    pub state: PingState,
    pub misses: u32,
    pub last_key: u32,
    pub enabled: bool,
}

/// Things the monitor wants done on its ports after a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAction {
    Ping { entry: usize, key: u32 },
    Warn { entry: usize, misses: u32 },
    Fatal { entry: usize, misses: u32 },
    Stroke { code: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    Cleared,
    Recovered,
    WrongKey { expected: u32 },
    UnknownEntry,
}

/// Port-free monitoring state.
#[derive(Debug)]
pub struct HealthMonitor {
    entries: BoundedVec<PingTracker, MAX_PING_ENTRIES>,
    enabled: bool,
    key: u32,
    watchdog_code: u32,
}

impl HealthMonitor {
    pub fn new(entries: &[PingEntry], watchdog_code: u32) -> Result<Self, ConfigError> {
        let mut trackers = BoundedVec::new();
        for entry in entries {
            if entry.warn_cycles == 0 || entry.fatal_cycles <= entry.warn_cycles {
                return Err(ConfigError::Invalid(format!(
                    "ping entry {}: need 0 < warn ({}) < fatal ({})",
                    entry.name, entry.warn_cycles, entry.fatal_cycles
                )));
            }
            trackers
                .push(PingTracker {
                    entry: entry.clone(),
                    state: PingState::Ok,
                    misses: 0,
                    last_key: 0,
                    enabled: true,
                })
                .map_err(|_| ConfigError::Invalid(format!("at most {MAX_PING_ENTRIES} ping entries")))?;
        }
        Ok(Self {
            entries: trackers,
            enabled: true,
            key: 0,
            watchdog_code,
        })
    }

    pub fn entries(&self) -> &[PingTracker] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&PingTracker> {
        self.entries.iter().find(|t| t.entry.name == name)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn reset(&mut self, name: &str) -> bool {
        match self.entries.iter_mut().find(|t| t.entry.name == name) {
            Some(tracker) => {
                tracker.state = PingState::Ok;
                tracker.misses = 0;
                true
            }
            None => false,
        }
    }

    pub fn run_cycle(&mut self) -> Vec<HealthAction> {
        let mut actions = Vec::new();
        if !self.enabled {
            return actions;
        }
        self.key = self.key.wrapping_add(1);
        for (index, tracker) in self.entries.iter_mut().enumerate() {
            if !tracker.enabled || tracker.state == PingState::Fatal {
                continue;
            }
            tracker.misses += 1;
            tracker.last_key = self.key;
            actions.push(HealthAction::Ping {
                entry: index,
                key: self.key,
            });

            if tracker.misses == tracker.entry.fatal_cycles {
                tracker.state = PingState::Fatal;
                actions.push(HealthAction::Fatal {
                    entry: index,
                    misses: tracker.misses,
                });
            } else if tracker.misses == tracker.entry.warn_cycles && tracker.state == PingState::Ok {
                tracker.state = PingState::Warn;
                actions.push(HealthAction::Warn {
                    entry: index,
                    misses: tracker.misses,
                });
            }
        }
        actions.push(HealthAction::Stroke {
            code: self.watchdog_code,
        });
        actions
    }

    pub fn ping_response(&mut self, entry: usize, key: u32) -> PingOutcome {
        let Some(tracker) = self.entries.get_mut(entry) else {
            return PingOutcome::UnknownEntry;
        };
        if key != tracker.last_key {
            return PingOutcome::WrongKey {
                expected: tracker.last_key,
            };
        }
        tracker.misses = 0;
        match tracker.state {
            PingState::Warn => {
                tracker.state = PingState::Ok;
                PingOutcome::Recovered
            }
            PingState::Ok | PingState::Fatal => PingOutcome::Cleared,
        }
    }
}

pub struct Health {
    monitor: HealthMonitor,
}

impl Health {
    pub const RUN: usize = 0;
    pub const PING_RETURN: usize = 1;
    pub const PING_SEND: usize = 2;
    pub const CMD_IN: usize = 3;
    pub const CMD_REG_OUT: usize = 4;
    pub const CMD_RESPONSE_OUT: usize = 5;
    pub const LOG: usize = 6;
    pub const WDOG_STROKE: usize = 7;
    pub const FATAL_ANNOUNCE: usize = 8;

    pub const OPCODE_HLTH_ENABLE: u32 = 0;
    pub const OPCODE_HLTH_RESET_ENTRY: u32 = 1;

    pub const EVENT_PING_WARN: u32 = 0;
    pub const EVENT_PING_LATE: u32 = 1;
    pub const EVENT_PING_WRONG_KEY: u32 = 2;
    pub const EVENT_CHECK_ENABLED: u32 = 3;
    pub const EVENT_ENTRY_RESET: u32 = 4;

    pub fn new(monitor: HealthMonitor) -> Self {
        Self { monitor }
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    fn dispatch_pending(&mut self, ctx: &PortContext<'_>) {
        while let Some(message) = ctx.next_message() {
            if let Err(e) = self.handle_queued(ctx, message.port, message.index, message.args) {
                warn!(error = %e, "queued health message failed");
            }
        }
    }

    fn handle_queued(
        &mut self,
        ctx: &PortContext<'_>,
        port: usize,
        index: usize,
        args: PortArgs,
    ) -> Result<(), PortError> {
        match (port, args) {
            (Self::PING_RETURN, PortArgs::Ping { key }) => {
                match self.monitor.ping_response(index, key) {
                    PingOutcome::Cleared => {}
                    PingOutcome::Recovered => {
                        debug!(entry = index, "ping entry recovered");
                    }
                    PingOutcome::WrongKey { expected } => {
                        let name = self.entry_name(index);
                        ctx.log(
                            Self::LOG,
                            Self::EVENT_PING_WRONG_KEY,
                            Severity::WarningHi,
                            &format!("{name} answered key {key}, expected {expected}"),
                        );
                    }
                    PingOutcome::UnknownEntry => {
                        warn!(entry = index, "ping response for unknown entry");
                    }
                }
                Ok(())
            }
            (Self::CMD_IN, PortArgs::Cmd { opcode, seq, args }) => {
                let response = self.run_command(ctx, opcode, &args);
                ctx.invoke(
                    Self::CMD_RESPONSE_OUT,
                    0,
                    PortArgs::CmdResponse {
                        opcode,
                        seq,
                        response,
                    },
                )?;
                Ok(())
            }
            _ => Err(PortError::Unhandled { port: "Health" }),
        }
    }

    fn run_command(&mut self, ctx: &PortContext<'_>, opcode: u32, args: &[u8]) -> CommandResponse {
        match opcode.wrapping_sub(ctx.base_id()) {
            Self::OPCODE_HLTH_ENABLE => match args {
                [flag] if *flag <= 1 => {
                    self.monitor.set_enabled(*flag == 1);
                    ctx.log(
                        Self::LOG,
                        Self::EVENT_CHECK_ENABLED,
                        Severity::ActivityHi,
                        if *flag == 1 {
                            "health checks enabled"
                        } else {
                            "health checks disabled"
                        },
                    );
                    CommandResponse::Ok
                }
                _ => CommandResponse::FormatError,
            },
            Self::OPCODE_HLTH_RESET_ENTRY => {
                let Ok(name) = std::str::from_utf8(args) else {
                    return CommandResponse::FormatError;
                };
                if self.monitor.reset(name) {
                    ctx.log(
                        Self::LOG,
                        Self::EVENT_ENTRY_RESET,
                        Severity::ActivityHi,
                        &format!("ping entry {name} reset"),
                    );
                    CommandResponse::Ok
                } else {
                    CommandResponse::ValidationError
                }
            }
            _ => CommandResponse::InvalidOpcode,
        }
    }

    fn entry_name(&self, index: usize) -> String {
        self.monitor
            .entries()
            .get(index)
            .map_or_else(|| format!("entry {index}"), |t| t.entry.name.clone())
    }

    fn apply(&mut self, ctx: &PortContext<'_>, actions: Vec<HealthAction>) {
        for action in actions {
            match action {
                HealthAction::Ping { entry, key } => {
                    if let Err(e) = ctx.invoke(Self::PING_SEND, entry, PortArgs::Ping { key }) {
                        warn!(entry, error = %e, "ping not delivered");
                    }
                }
                HealthAction::Warn { entry, misses } => {
                    let name = self.entry_name(entry);
                    ctx.log(
                        Self::LOG,
                        Self::EVENT_PING_WARN,
                        Severity::WarningHi,
                        &format!("{name} missed {misses} pings"),
                    );
                }
                HealthAction::Fatal { entry, misses } => {
                    let name = self.entry_name(entry);
                    ctx.log(
                        Self::LOG,
                        Self::EVENT_PING_LATE,
                        Severity::Fatal,
                        &format!("{name} missed {misses} pings"),
                    );
                    if let Err(e) = ctx.invoke(Self::FATAL_ANNOUNCE, 0, PortArgs::FatalAnnounce { instance: name }) {
                        warn!(error = %e, "fatal announcement not delivered");
                    }
                }
                HealthAction::Stroke { code } => {
                    if let Err(e) = ctx.invoke(Self::WDOG_STROKE, 0, PortArgs::Watchdog { code }) {
                        warn!(error = %e, "watchdog stroke not delivered");
                    }
                }
            }
        }
    }
}

impl Component for Health {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Queued
    }

    fn ports(&self) -> Vec<PortSpec> {
        let entries = self.monitor.entries().len().max(1);
        vec![
            PortSpec::input("Run", PortType::Sched, InvocationMode::Sync),
            PortSpec::input("PingReturn", PortType::Ping, InvocationMode::Async).array(entries),
            PortSpec::output("PingSend", PortType::Ping).array(entries),
            PortSpec::input("CmdIn", PortType::Cmd, InvocationMode::Async),
            PortSpec::output("CmdRegOut", PortType::CmdReg),
            PortSpec::output("CmdResponseOut", PortType::CmdResponse),
            PortSpec::output("Log", PortType::Log),
            PortSpec::output("WdogStroke", PortType::Watchdog),
            PortSpec::output("FatalAnnounce", PortType::FatalAnnounce),
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
            (Self::RUN, PortArgs::Sched { .. }) => {
                self.dispatch_pending(ctx);
                let actions = self.monitor.run_cycle();
                self.apply(ctx, actions);
                Ok(None)
            }
            _ => Err(PortError::Unhandled { port: "Health" }),
        }
    }

    fn register_commands(&mut self, ctx: &PortContext<'_>) -> Result<(), PortError> {
        for opcode in [Self::OPCODE_HLTH_ENABLE, Self::OPCODE_HLTH_RESET_ENTRY] {
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
}
