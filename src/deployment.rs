//! Reference deployment: instantiates and wires the service components.
//!
//! Setup runs in a fixed order: instances, connections, build and
//! validation, command registration, then task start. Teardown reverses it:
//! tasks stop and are joined, then instances are torn down newest first, so
//! the sequencer's buffer is returned before the buffer manager releases its
//! region.

use crate::buffer::{BackingAllocator, BufferError, BufferManager, BufferManagerStats, HeapAllocator};
use crate::config::{ConfigError, TopologyConfig, EVENTS_LANE};
use crate::events::EventRecord;
use crate::framing::{FprimeFraming, FRAME_OVERHEAD};
use crate::port::{InstanceId, PortArgs, PortError};
use crate::svc::com_queue::ComQueueError;
use crate::svc::framer::DEFAULT_RING_SIZE;
use crate::svc::{
    ActiveRateGroup, BufferManagerComponent, CmdSequencer, ComDriver, ComQueue, CommandDispatcher,
    Deframer, EventLogger, FatalHandler, FileUplink, Framer, Health, HealthMonitor, RateGroupDriver,
    Sequencer, Transport,
};
use crate::topology::{Topology, TopologyBuilder, TopologyError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    ComQueue(#[from] ComQueueError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentIds {
    pub buffer_manager: InstanceId,
    pub rate_group_driver: InstanceId,
    pub rate_groups: Vec<InstanceId>,
    pub cmd_disp: InstanceId,
    pub cmd_seq: InstanceId,
    pub health: InstanceId,
    pub event_logger: InstanceId,
    pub fatal_handler: InstanceId,
    pub file_uplink: InstanceId,
    pub com_queue: InstanceId,
    pub framer: InstanceId,
    pub deframer: InstanceId,
    pub com_driver: InstanceId,
}

/// Rate group members in schedule order: member `m` joins group
/// `min(m, groups - 1)`.
const MEMBERS: [(&str, &str); 3] = [("comDriver", "schedIn"), ("cmdSeq", "schedIn"), ("health", "Run")];

const HEALTH_CMD_PORT: usize = 0;
const SEQ_CMD_PORT: usize = 1;

pub struct Deployment {
    topology: Topology,
    manager: Arc<BufferManager>,
    ids: DeploymentIds,
    halt: Arc<AtomicBool>,
}

impl Deployment {
    pub fn setup(config: &TopologyConfig, transport: Box<dyn Transport>) -> Result<Self, DeploymentError> {
        Self::setup_with_allocator(config, transport, Arc::new(HeapAllocator::new()))
    }

    pub fn setup_with_allocator(
        config: &TopologyConfig,
        transport: Box<dyn Transport>,
        allocator: Arc<dyn BackingAllocator>,
    ) -> Result<Self, DeploymentError> {
        config.validate()?;
        let manager = Arc::new(BufferManager::setup(
            config.buffer_manager_id,
            allocator,
            &config.buffer_bins,
        )?);
        let halt = Arc::new(AtomicBool::new(false));
        let queue = config.queue;
        let mut b = TopologyBuilder::new();

        // Instances. The buffer manager goes first so it is torn down last.
        let buffer_manager = b.add_instance("bufferManager", 0x2400, BufferManagerComponent::new(manager.clone()))?;
        let rate_group_driver = b.add_instance(
            "rateGroupDriver",
            0x0100,
            RateGroupDriver::new(&config.rate_group_dividers)?,
        )?;
        let mut rate_groups = Vec::with_capacity(config.rate_group_contexts.len());
        for (i, contexts) in config.rate_group_contexts.iter().enumerate() {
            rate_groups.push(b.add_instance_with_queue(
                &format!("rateGroup{}", i + 1),
                0x0200 + 0x0100 * i as u32,
                ActiveRateGroup::new(contexts)?,
                queue,
            )?);
        }
        let cmd_disp = b.add_instance_with_queue("cmdDisp", 0x1000, CommandDispatcher::new(2, 1), queue)?;
        let cmd_seq = b.add_instance_with_queue(
            "cmdSeq",
            0x1100,
            CmdSequencer::new(Sequencer::new(
                manager.clone(),
                config.cmd_seq_buffer_size,
                config.cmd_seq_timeout_cycles,
            )),
            queue,
        )?;
        let health = b.add_instance_with_queue(
            "health",
            0x1200,
            Health::new(HealthMonitor::new(&config.ping_entries, config.health_watchdog_code)?),
            queue,
        )?;
        let event_logger = b.add_instance("eventLogger", 0x1300, EventLogger::new(config.event_filter))?;
        let fatal_handler = b.add_instance("fatalHandler", 0x1400, FatalHandler::new(config.fatal_policy, halt.clone()))?;
        let file_uplink =
            b.add_instance_with_queue("fileUplink", 0x1500, FileUplink::new(config.max_uplink_file_size), queue)?;
        let com_queue = b.add_instance_with_queue("comQueue", 0x2000, ComQueue::new(&config.com_queue_lanes)?, queue)?;
        let framer = b.add_instance(
            "framer",
            0x2100,
            Framer::new(Box::new(FprimeFraming::new(config.max_frame_payload))),
        )?;
        let deframer = b.add_instance_with_queue(
            "deframer",
            0x2200,
            Deframer::with_capacity(
                Box::new(FprimeFraming::new(config.max_frame_payload)),
                DEFAULT_RING_SIZE,
            ),
            queue,
        )?;
        let com_driver = b.add_instance(
            "comDriver",
            0x2300,
            ComDriver::new(transport, config.max_frame_payload + FRAME_OVERHEAD),
        )?;

        // Scheduling.
        for (group, &id) in rate_groups.iter().enumerate() {
            b.wire((rate_group_driver, "CycleOut", group), (id, "CycleIn", 0))?;
        }
        let mut next_member = vec![0usize; rate_groups.len()];
        for (m, &(name, port)) in MEMBERS.iter().enumerate() {
            let group = m.min(rate_groups.len() - 1);
            let target = b
                .instance(name)
                .ok_or_else(|| TopologyError::UnknownInstance(name.to_string()))?;
            b.wire(
                (rate_groups[group], "RateGroupMemberOut", next_member[group]),
                (target, port, 0),
            )?;
            next_member[group] += 1;
        }

        // Health.
        for (i, entry) in config.ping_entries.iter().enumerate() {
            let target = b
                .instance(&entry.name)
                .ok_or_else(|| TopologyError::UnknownInstance(entry.name.clone()))?;
            b.wire((health, "PingSend", i), (target, "PingIn", 0))?;
            b.wire((target, "PingOut", 0), (health, "PingReturn", i))?;
        }
        b.wire((health, "FatalAnnounce", 0), (fatal_handler, "FatalReceive", 0))?;

        // Commanding.
        for (port, id, cmd_in, reg_out, response_out) in [
            (HEALTH_CMD_PORT, health, "CmdIn", "CmdRegOut", "CmdResponseOut"),
            (SEQ_CMD_PORT, cmd_seq, "cmdIn", "cmdRegOut", "cmdResponseOut"),
        ] {
            b.wire((cmd_disp, "compCmdSend", port), (id, cmd_in, 0))?;
            b.wire((id, reg_out, 0), (cmd_disp, "compCmdReg", port))?;
            b.wire((id, response_out, 0), (cmd_disp, "compCmdStat", port))?;
        }
        b.wire((cmd_seq, "comCmdOut", 0), (cmd_disp, "seqCmdIn", 0))?;
        b.wire((cmd_disp, "seqCmdStatus", 0), (cmd_seq, "cmdResponseIn", 0))?;

        // Events.
        for id in rate_groups
            .iter()
            .copied()
            .chain([health, cmd_disp, cmd_seq, deframer, file_uplink])
        {
            b.wire((id, "Log", 0), (event_logger, "logIn", 0))?;
        }
        b.wire((event_logger, "bufferGetOut", 0), (buffer_manager, "bufferGetCallee", 0))?;
        b.wire((event_logger, "comOut", 0), (com_queue, "comQueueIn", EVENTS_LANE))?;

        // Downlink.
        b.wire((com_queue, "comQueueSend", 0), (framer, "comIn", 0))?;
        b.wire((framer, "framedOut", 0), (com_driver, "comDataIn", 0))?;
        b.wire((com_driver, "comStatusOut", 0), (com_queue, "comStatusIn", 0))?;

        // Uplink.
        b.wire((com_driver, "recvOut", 0), (deframer, "framedIn", 0))?;
        b.wire((deframer, "comOut", 0), (cmd_disp, "cmdBuffIn", 0))?;
        b.wire((deframer, "fileOut", 0), (file_uplink, "bufferSendIn", 0))?;

        // Buffer traffic.
        for (id, get) in [(framer, "bufferGetOut"), (deframer, "bufferGetOut"), (com_driver, "bufferGetOut")] {
            b.wire((id, get, 0), (buffer_manager, "bufferGetCallee", 0))?;
        }
        for (id, ret) in [
            (com_queue, "bufferReturnOut"),
            (framer, "dataReturnOut"),
            (com_driver, "bufferReturnOut"),
            (deframer, "bufferReturnOut"),
            (cmd_disp, "bufferReturnOut"),
            (file_uplink, "bufferReturnOut"),
        ] {
            b.wire((id, ret, 0), (buffer_manager, "bufferSendIn", 0))?;
        }

        let mut topology = b.build()?;
        topology.register_commands()?;
        topology.start()?;
        info!(instances = topology.instance_count(), "deployment up");

        Ok(Self {
            topology,
            manager,
            ids: DeploymentIds {
                buffer_manager,
                rate_group_driver,
                rate_groups,
                cmd_disp,
                cmd_seq,
                health,
                event_logger,
                fatal_handler,
                file_uplink,
                com_queue,
                framer,
                deframer,
                com_driver,
            },
            halt,
        })
    }

    /// One tick of the rate group driver.
    pub fn cycle(&self) -> Result<(), PortError> {
        self.topology
            .invoke(self.ids.rate_group_driver, "CycleIn", 0, PortArgs::Sched { context: 0 })
            .map(|_| ())
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn ids(&self) -> &DeploymentIds {
        &self.ids
    }

    pub fn buffer_stats(&self) -> BufferManagerStats {
        self.manager.stats()
    }

    /// True once a FATAL has been announced under the halt policy.
    pub fn halt_requested(&self) -> bool {
        self.halt.load(Ordering::Acquire)
    }

    pub fn recent_events(&self) -> Vec<EventRecord> {
        self.topology
            .with_component(self.ids.event_logger, |logger: &mut EventLogger| logger.recent())
            .unwrap_or_default()
    }

    pub fn teardown(mut self) {
        self.topology.teardown();
        info!(stats = ?self.manager.stats(), "deployment down");
    }
}
