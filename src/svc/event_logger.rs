use super::buffer_manager::request_buffer;
use crate::component::{Component, ComponentKind, PortContext};
use crate::events::{EventRecord, Severity};
use crate::framing::{PacketType, PACKET_TYPE_SIZE};
use crate::port::{InvocationMode, PortArgs, PortError, PortResult, PortSpec, PortType};
use heapless::HistoryBuffer;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

pub const RECENT_EVENTS: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLoggerStats {
    pub received: u32,
    pub filtered: u32,
    pub downlinked: u32,
    pub dropped: u32,
}

/// Serializes events into LOG packets for the downlink events lane.
///
/// Keeps the most recent records for inspection. It has no log port of its
/// own; its failures go to `tracing`.
pub struct EventLogger {
    filter: Severity,
    recent: HistoryBuffer<EventRecord, RECENT_EVENTS>,
    stats: EventLoggerStats,
}

impl EventLogger {
    pub const LOG_IN: usize = 0;
    pub const BUFFER_GET_OUT: usize = 1;
    pub const COM_OUT: usize = 2;

    /// Records below `filter` are counted and dropped.
    pub fn new(filter: Severity) -> Self {
        Self {
            filter,
            recent: HistoryBuffer::new(),
            stats: EventLoggerStats::default(),
        }
    }

    pub fn stats(&self) -> EventLoggerStats {
        self.stats
    }

    /// Retained records, oldest first.
    pub fn recent(&self) -> Vec<EventRecord> {
        self.recent.oldest_ordered().cloned().collect()
    }

    pub fn set_filter(&mut self, filter: Severity) {
        self.filter = filter;
    }

    fn downlink(&mut self, ctx: &PortContext<'_>, record: &EventRecord) -> Result<(), PortError> {
        let json = serde_json::to_vec(record).map_err(|e| PortError::Rejected(e.to_string()))?;
        let mut buffer = request_buffer(ctx, Self::BUFFER_GET_OUT, PACKET_TYPE_SIZE + json.len())?;
        {
            let storage = buffer.storage_mut();
            storage[..PACKET_TYPE_SIZE].copy_from_slice(&PacketType::Log.code().to_be_bytes());
            storage[PACKET_TYPE_SIZE..PACKET_TYPE_SIZE + json.len()].copy_from_slice(&json);
        }
        // A rejected buffer goes back to the pool from the com queue.
        ctx.invoke(Self::COM_OUT, 0, PortArgs::Buffer(buffer))?;
        Ok(())
    }
}

impl Component for EventLogger {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Passive
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("logIn", PortType::Log, InvocationMode::Guarded).multi_producer(),
            PortSpec::output("bufferGetOut", PortType::BufferGet),
            PortSpec::output("comOut", PortType::Buffer),
        ]
    }

    fn handle(
        &mut self,
        ctx: &PortContext<'_>,
        port: usize,
        _index: usize,
        args: PortArgs,
    ) -> PortResult {
        let (Self::LOG_IN, PortArgs::Log(record)) = (port, args) else {
            return Err(PortError::Unhandled { port: "EventLogger" });
        };
        self.stats.received += 1;
        if record.severity < self.filter {
            self.stats.filtered += 1;
            trace!(id = record.id, "event filtered");
            return Ok(None);
        }
        if ctx.is_connected(Self::COM_OUT, 0) {
            match self.downlink(ctx, &record) {
                Ok(()) => self.stats.downlinked += 1,
                Err(e) => {
                    self.stats.dropped += 1;
                    warn!(id = record.id, error = %e, "event not downlinked");
                }
            }
        }
        self.recent.write(record);
        Ok(None)
    }
}
