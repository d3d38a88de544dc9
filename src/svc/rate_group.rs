//! Rate group driver and active rate groups.
//!
//! The driver turns one periodic tick into per-group cycles: group `g` with
//! divider `(d, o)` fires on tick `t` iff `(t + o) mod d == 0`. Each active
//! rate group then invokes its members in declared order on its own thread.

use crate::component::{Component, ComponentKind, PortContext};
use crate::config::ConfigError;
use crate::events::Severity;
use crate::port::{InvocationMode, PortArgs, PortError, PortResult, PortSpec, PortType};
use heapless::Vec as BoundedVec;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const MAX_DIVIDERS: usize = 8;
pub const MAX_MEMBERS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Divider {
    pub divisor: u32,
    pub offset: u32,
}

impl Divider {
    pub const fn new(divisor: u32, offset: u32) -> Self {
        Self { divisor, offset }
    }

    pub fn fires_on(&self, tick: u64) -> bool {
        (tick + u64::from(self.offset)) % u64::from(self.divisor) == 0
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

pub struct RateGroupDriver {
    dividers: BoundedVec<Divider, MAX_DIVIDERS>,
    tick: u64,
    rollover: u64,
}

impl RateGroupDriver {
    pub const CYCLE_IN: usize = 0;
    pub const CYCLE_OUT: usize = 1;

    pub fn new(dividers: &[Divider]) -> Result<Self, ConfigError> {
        if dividers.is_empty() {
            return Err(ConfigError::Invalid("rate group driver needs a divider".into()));
        }
        if dividers.iter().any(|d| d.divisor == 0) {
            return Err(ConfigError::Invalid("divisor must be non-zero".into()));
        }
        let dividers: BoundedVec<Divider, MAX_DIVIDERS> = BoundedVec::from_slice(dividers)
            .map_err(|()| ConfigError::Invalid(format!("at most {MAX_DIVIDERS} dividers")))?;

        // The schedule repeats every lcm(divisors) ticks.
        let rollover = dividers.iter().fold(1u64, |acc, d| {
            let divisor = u64::from(d.divisor);
            acc / gcd(acc, divisor) * divisor
        });

        Ok(Self {
            dividers,
            tick: 0,
            rollover,
        })
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Groups that fire on the current tick; advances the tick counter.
    pub fn advance(&mut self) -> BoundedVec<usize, MAX_DIVIDERS> {
        let fired = self
            .dividers
            .iter()
            .enumerate()
            .filter(|(_, divider)| divider.fires_on(self.tick))
            .map(|(group, _)| group)
            .collect();
        self.tick = (self.tick + 1) % self.rollover;
        fired
    }
}

impl Component for RateGroupDriver {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Passive
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("CycleIn", PortType::Sched, InvocationMode::Sync),
            PortSpec::output("CycleOut", PortType::Sched).array(self.dividers.len()),
        ]
    }

    fn handle(
        &mut self,
        ctx: &PortContext<'_>,
        port: usize,
        _index: usize,
        args: PortArgs,
    ) -> PortResult {
        if port != Self::CYCLE_IN || !matches!(args, PortArgs::Sched { .. }) {
            return Err(PortError::Unhandled { port: "CycleIn" });
        }
        for group in self.advance() {
            // A group that cannot take the cycle misses it; it is not retried.
            if let Err(e) = ctx.invoke(Self::CYCLE_OUT, group, PortArgs::Sched { context: 0 }) {
                warn!(group, error = %e, "rate group missed a cycle");
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateGroupStats {
    pub cycles: u64,
    pub slips: u64,
    pub max_cycle_time_us: u64,
}

pub struct ActiveRateGroup {
    contexts: BoundedVec<u32, MAX_MEMBERS>,
    stats: RateGroupStats,
    max_cycle_time: Duration,
}

impl ActiveRateGroup {
    pub const CYCLE_IN: usize = 0;
    pub const RATE_GROUP_MEMBER_OUT: usize = 1;
    pub const PING_IN: usize = 2;
    pub const PING_OUT: usize = 3;
    pub const LOG: usize = 4;

    pub const EVENT_CYCLE_SLIP: u32 = 0;

    /// One context token per member; the member count is the token count.
    pub fn new(contexts: &[u32]) -> Result<Self, ConfigError> {
        let contexts = BoundedVec::from_slice(contexts)
            .map_err(|()| ConfigError::Invalid(format!("at most {MAX_MEMBERS} members")))?;
        Ok(Self {
            contexts,
            stats: RateGroupStats::default(),
            max_cycle_time: Duration::ZERO,
        })
    }

    pub fn stats(&self) -> RateGroupStats {
        self.stats
    }

    fn cycle(&mut self, ctx: &PortContext<'_>) {
        let start = Instant::now();
        for (member, &context) in self.contexts.iter().enumerate() {
            if !ctx.is_connected(Self::RATE_GROUP_MEMBER_OUT, member) {
                continue;
            }
            if let Err(e) = ctx.invoke(Self::RATE_GROUP_MEMBER_OUT, member, PortArgs::Sched { context }) {
                warn!(group = ctx.name(), member, error = %e, "member invocation failed");
            }
        }
        let elapsed = start.elapsed();
        self.max_cycle_time = self.max_cycle_time.max(elapsed);
        self.stats.cycles += 1;
        self.stats.max_cycle_time_us = self.max_cycle_time.as_micros() as u64;

        // Another tick already waiting means this cycle overran its period.
        if ctx.pending_messages() > 0 {
            self.stats.slips += 1;
            ctx.log(
                Self::LOG,
                Self::EVENT_CYCLE_SLIP,
                Severity::WarningHi,
                &format!("cycle slip ({} total)", self.stats.slips),
            );
        }
        debug!(group = ctx.name(), elapsed_us = elapsed.as_micros() as u64, "cycle done");
    }
}

impl Component for ActiveRateGroup {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Active
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("CycleIn", PortType::Sched, InvocationMode::Async).mandatory(),
            PortSpec::output("RateGroupMemberOut", PortType::Sched).array(self.contexts.len()),
            PortSpec::input("PingIn", PortType::Ping, InvocationMode::Async),
            PortSpec::output("PingOut", PortType::Ping),
            PortSpec::output("Log", PortType::Log),
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
            (Self::CYCLE_IN, PortArgs::Sched { .. }) => {
                self.cycle(ctx);
                Ok(None)
            }
            (Self::PING_IN, PortArgs::Ping { key }) => ctx.invoke(Self::PING_OUT, 0, PortArgs::Ping { key }),
            _ => Err(PortError::Unhandled { port: "ActiveRateGroup" }),
        }
    }
}
