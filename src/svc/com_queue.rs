//! Prioritized downlink queue.
//!
//! Producers push pooled buffers into bounded lanes. One item leaves per
//! drain step, taken from the non-empty lane with the lowest priority value
//! (ties go to the lower lane index). A drain step runs when the link
//! reports ready, or on enqueue if the link is already idle and ready.

use crate::buffer::Buffer;
use crate::component::{Component, ComponentKind, PortContext};
use crate::port::{ComStatus, InvocationMode, PortArgs, PortError, PortResult, PortSpec, PortType};
use heapless::Vec as BoundedVec;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, warn};

pub const MAX_LANES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneConfig {
    pub depth: usize,
    /// Lower values drain first.
    pub priority: u32,
}

impl LaneConfig {
    pub const fn new(depth: usize, priority: u32) -> Self {
        Self { depth, priority }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComQueueError {
    #[error("lane {lane} is full ({depth} items)")]
    LaneFull { lane: usize, depth: usize },
    #[error("no lane {0}")]
    NoSuchLane(usize),
    #[error("invalid lane configuration: {0}")]
    InvalidLanes(&'static str),
}

/// An enqueue that was refused, with the item handed back.
#[derive(Debug)]
pub struct Rejected<T> {
    pub error: ComQueueError,
    pub item: T,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneStats {
    pub pending: usize,
    pub high_water: usize,
    pub overflows: u32,
    pub sent: u32,
}

#[derive(Debug)]
struct Lane<T> {
    config: LaneConfig,
    items: VecDeque<T>,
    stats: LaneStats,
}

/// The lane set, independent of any port wiring.
#[derive(Debug)]
pub struct PriorityLanes<T> {
    lanes: BoundedVec<Lane<T>, MAX_LANES>,
}

impl<T> PriorityLanes<T> {
    pub fn new(configs: &[LaneConfig]) -> Result<Self, ComQueueError> {
        if configs.is_empty() {
            return Err(ComQueueError::InvalidLanes("no lanes configured"));
        }
        if configs.iter().any(|c| c.depth == 0) {
            return Err(ComQueueError::InvalidLanes("lane depth must be non-zero"));
        }
        let mut lanes = BoundedVec::new();
        for config in configs {
            lanes
                .push(Lane {
                    config: *config,
                    items: VecDeque::with_capacity(config.depth),
                    stats: LaneStats::default(),
                })
                .map_err(|_| ComQueueError::InvalidLanes("too many lanes"))?;
        }
        Ok(Self { lanes })
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn enqueue(&mut self, lane: usize, item: T) -> Result<(), Rejected<T>> {
        let Some(target) = self.lanes.get_mut(lane) else {
            return Err(Rejected {
                error: ComQueueError::NoSuchLane(lane),
                item,
            });
        };
        if target.items.len() >= target.config.depth {
            target.stats.overflows = target.stats.overflows.wrapping_add(1);
            return Err(Rejected {
                error: ComQueueError::LaneFull {
                    lane,
                    depth: target.config.depth,
                },
                item,
            });
        }
        target.items.push_back(item);
        target.stats.pending = target.items.len();
        target.stats.high_water = target.stats.high_water.max(target.items.len());
        Ok(())
    }

    /// Removes the next item by priority, returning it with its lane index.
    pub fn drain(&mut self) -> Option<(usize, T)> {
        let (lane, _) = self
            .lanes
            .iter()
            .enumerate()
            .filter(|(_, lane)| !lane.items.is_empty())
            .min_by_key(|(index, lane)| (lane.config.priority, *index))?;
        let target = &mut self.lanes[lane];
        let item = target.items.pop_front()?;
        target.stats.pending = target.items.len();
        target.stats.sent = target.stats.sent.wrapping_add(1);
        Some((lane, item))
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(|lane| lane.items.is_empty())
    }

    pub fn stats(&self) -> Vec<LaneStats> {
        self.lanes.iter().map(|lane| lane.stats).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Waiting,
    Ready,
}

/// Active component wrapping [`PriorityLanes`] of pooled buffers.
pub struct ComQueue {
    lanes: PriorityLanes<Buffer>,
    link: LinkState,
    failures: u32,
    send_failures: u32,
}

impl ComQueue {
    pub const COM_QUEUE_IN: usize = 0;
    pub const COM_STATUS_IN: usize = 1;
    pub const COM_QUEUE_SEND: usize = 2;
    pub const BUFFER_RETURN_OUT: usize = 3;
    pub const PING_IN: usize = 4;
    pub const PING_OUT: usize = 5;

    pub fn new(lanes: &[LaneConfig]) -> Result<Self, ComQueueError> {
        Ok(Self {
            lanes: PriorityLanes::new(lanes)?,
            link: LinkState::Waiting,
            failures: 0,
            send_failures: 0,
        })
    }

    pub fn lane_stats(&self) -> Vec<LaneStats> {
        self.lanes.stats()
    }

    pub fn link_failures(&self) -> u32 {
        self.failures
    }

    /// Items dropped because forwarding them to the framer failed.
    pub fn send_failures(&self) -> u32 {
        self.send_failures
    }

    /// Forwards one item if any is queued. A send that fails downstream never
    /// reaches the link, so no status will come back for it: the item is
    /// lost and the link stays ready for the next one.
    fn drain_one(&mut self, ctx: &PortContext<'_>) {
        let Some((lane, buffer)) = self.lanes.drain() else {
            self.link = LinkState::Ready;
            return;
        };
        debug!(lane, bytes = buffer.len(), "downlinking");
        self.link = LinkState::Waiting;
        if let Err(e) = ctx.invoke(Self::COM_QUEUE_SEND, 0, PortArgs::Buffer(buffer)) {
            self.send_failures = self.send_failures.wrapping_add(1);
            warn!(lane, error = %e, "downlink item lost before reaching the link");
            self.link = LinkState::Ready;
        }
    }
}

impl Component for ComQueue {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Active
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("comQueueIn", PortType::Buffer, InvocationMode::Guarded)
                .array(self.lanes.lane_count())
                .multi_producer(),
            PortSpec::input("comStatusIn", PortType::ComStatus, InvocationMode::Async),
            PortSpec::output("comQueueSend", PortType::Buffer),
            PortSpec::output("bufferReturnOut", PortType::Buffer),
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
            (Self::COM_QUEUE_IN, PortArgs::Buffer(buffer)) => {
                if let Err(rejected) = self.lanes.enqueue(index, buffer) {
                    warn!(lane = index, error = %rejected.error, "downlink item rejected");
                    ctx.invoke(Self::BUFFER_RETURN_OUT, 0, PortArgs::Buffer(rejected.item))?;
                    return Err(PortError::ComQueue(rejected.error));
                }
                if self.link == LinkState::Ready {
                    self.drain_one(ctx);
                }
                Ok(None)
            }
            (Self::COM_STATUS_IN, PortArgs::ComStatus(status)) => {
                if status == ComStatus::Failure {
                    self.failures = self.failures.wrapping_add(1);
                    warn!(failures = self.failures, "link reported a send failure");
                }
                self.drain_one(ctx);
                Ok(None)
            }
            (Self::PING_IN, PortArgs::Ping { key }) => {
                ctx.invoke(Self::PING_OUT, 0, PortArgs::Ping { key })?;
                Ok(None)
            }
            _ => Err(PortError::Unhandled { port: "ComQueue" }),
        }
    }
}
