//! Deployment configuration.
//!
//! Everything a deployment needs to size and wire itself lives in one
//! [`TopologyConfig`], loaded from JSON or taken from
//! [`TopologyConfig::reference`].

use crate::buffer::{BinConfig, MAX_BINS};
use crate::events::Severity;
use crate::framing::FRAME_OVERHEAD;
use crate::queue::{OverflowPolicy, QueueConfig};
use crate::svc::com_queue::{LaneConfig, MAX_LANES};
use crate::svc::fatal_handler::FatalPolicy;
use crate::svc::health::{PingEntry, MAX_PING_ENTRIES};
use crate::svc::rate_group::{Divider, MAX_DIVIDERS, MAX_MEMBERS};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

pub const COM_BUFFER_MAX_SIZE: usize = 512;
/// Largest uplink packet: a file data chunk plus its packet header.
pub const MAX_PACKET_SIZE: usize = COM_BUFFER_MAX_SIZE + 4;
pub const FRAMER_BUFFER_SIZE: usize = MAX_PACKET_SIZE + FRAME_OVERHEAD;
pub const DEFRAMER_BUFFER_SIZE: usize = MAX_PACKET_SIZE;
pub const COM_DRIVER_BUFFER_SIZE: usize = 3000;
pub const BUFFERS_PER_BIN: usize = 30;
pub const BUFFER_MANAGER_ID: u32 = 200;
pub const CMD_SEQ_BUFFER_SIZE: usize = 5 * 1024;
pub const HEALTH_WATCHDOG_CODE: u32 = 0x123;
pub const PING_WARN_CYCLES: u32 = 3;
pub const PING_FATAL_CYCLES: u32 = 5;

pub const EVENTS_LANE: usize = 0;
pub const TELEMETRY_LANE: usize = 1;
pub const FILE_LANE: usize = 2;

const_assert!(FRAMER_BUFFER_SIZE < COM_DRIVER_BUFFER_SIZE);
const_assert!(COM_DRIVER_BUFFER_SIZE < CMD_SEQ_BUFFER_SIZE);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("configuration is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub buffer_manager_id: u32,
    pub buffer_bins: Vec<BinConfig>,
    pub rate_group_dividers: Vec<Divider>,
    /// One context list per rate group; its length is the member count.
    pub rate_group_contexts: Vec<Vec<u32>>,
    pub ping_entries: Vec<PingEntry>,
    pub health_watchdog_code: u32,
    pub com_queue_lanes: Vec<LaneConfig>,
    pub cmd_seq_buffer_size: usize,
    /// Sequencer schedule ticks to wait for a command response; 0 waits forever.
    pub cmd_seq_timeout_cycles: u32,
    pub max_frame_payload: usize,
    pub max_uplink_file_size: usize,
    /// Queue settings for every queued and active instance.
    pub queue: QueueConfig,
    pub event_filter: Severity,
    #[serde(default)]
    pub fatal_policy: FatalPolicy,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self::reference()
    }
}

impl TopologyConfig {
    /// Instance names monitored by health in the reference deployment.
    pub const MONITORED: [&'static str; 8] = [
        "rateGroup1",
        "rateGroup2",
        "rateGroup3",
        "cmdDisp",
        "cmdSeq",
        "comQueue",
        "deframer",
        "fileUplink",
    ];

    pub fn reference() -> Self {
        Self {
            buffer_manager_id: BUFFER_MANAGER_ID,
            buffer_bins: vec![
                BinConfig::new(FRAMER_BUFFER_SIZE, BUFFERS_PER_BIN),
                BinConfig::new(DEFRAMER_BUFFER_SIZE, BUFFERS_PER_BIN),
                BinConfig::new(COM_DRIVER_BUFFER_SIZE, BUFFERS_PER_BIN),
                BinConfig::new(CMD_SEQ_BUFFER_SIZE, 2),
            ],
            rate_group_dividers: vec![Divider::new(1, 0), Divider::new(2, 0), Divider::new(4, 0)],
            rate_group_contexts: vec![vec![0; MAX_MEMBERS]; 3],
            ping_entries: Self::MONITORED
                .iter()
                .map(|name| PingEntry::new(name, PING_WARN_CYCLES, PING_FATAL_CYCLES))
                .collect(),
            health_watchdog_code: HEALTH_WATCHDOG_CODE,
            com_queue_lanes: vec![
                LaneConfig::new(100, 0),
                LaneConfig::new(500, 2),
                LaneConfig::new(100, 1),
            ],
            cmd_seq_buffer_size: CMD_SEQ_BUFFER_SIZE,
            cmd_seq_timeout_cycles: 10,
            max_frame_payload: COM_DRIVER_BUFFER_SIZE - FRAME_OVERHEAD,
            max_uplink_file_size: 64 * 1024,
            queue: QueueConfig::with_depth(64).overflow(OverflowPolicy::Drop),
            event_filter: Severity::Diagnostic,
            fatal_policy: FatalPolicy::Log,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn largest_bin(&self) -> usize {
        self.buffer_bins.iter().map(|b| b.buffer_size).max().unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.buffer_bins.is_empty() || self.buffer_bins.len() > MAX_BINS {
            return invalid(format!("need 1 to {MAX_BINS} buffer bins"));
        }
        if let Some(bin) = self
            .buffer_bins
            .iter()
            .find(|b| b.buffer_size == 0 || b.num_buffers == 0)
        {
            return invalid(format!("bin {bin:?} has a zero size or count"));
        }

        if self.rate_group_dividers.is_empty() || self.rate_group_dividers.len() > MAX_DIVIDERS {
            return invalid(format!("need 1 to {MAX_DIVIDERS} rate group dividers"));
        }
        if self.rate_group_dividers.iter().any(|d| d.divisor == 0) {
            return invalid("rate group divisor of zero".into());
        }
        if self.rate_group_contexts.len() != self.rate_group_dividers.len() {
            return invalid(format!(
                "{} context lists for {} rate groups",
                self.rate_group_contexts.len(),
                self.rate_group_dividers.len()
            ));
        }
        if self.rate_group_contexts.iter().any(|c| c.len() > MAX_MEMBERS) {
            return invalid(format!("a rate group has more than {MAX_MEMBERS} members"));
        }

        if self.ping_entries.len() > MAX_PING_ENTRIES {
            return invalid(format!("more than {MAX_PING_ENTRIES} ping entries"));
        }
        let mut names = HashSet::new();
        for entry in &self.ping_entries {
            if !names.insert(entry.name.as_str()) {
                return invalid(format!("duplicate ping entry {}", entry.name));
            }
            if entry.warn_cycles == 0 || entry.warn_cycles >= entry.fatal_cycles {
                return invalid(format!(
                    "ping entry {} needs 0 < warn ({}) < fatal ({})",
                    entry.name, entry.warn_cycles, entry.fatal_cycles
                ));
            }
        }

        if self.com_queue_lanes.is_empty() || self.com_queue_lanes.len() > MAX_LANES {
            return invalid(format!("need 1 to {MAX_LANES} com queue lanes"));
        }
        if self.com_queue_lanes.iter().any(|l| l.depth == 0) {
            return invalid("com queue lane of depth zero".into());
        }

        if self.queue.depth == 0 {
            return invalid("message queue depth of zero".into());
        }

        let largest = self.largest_bin();
        if self.cmd_seq_buffer_size == 0 || self.cmd_seq_buffer_size > largest {
            return invalid(format!(
                "sequence buffer of {} bytes does not fit the largest bin ({largest})",
                self.cmd_seq_buffer_size
            ));
        }
        if self.max_frame_payload == 0 || self.max_frame_payload + FRAME_OVERHEAD > largest {
            return invalid(format!(
                "frames of {} payload bytes do not fit the largest bin ({largest})",
                self.max_frame_payload
            ));
        }
        Ok(())
    }
}
