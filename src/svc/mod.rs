//! Service components wired together by a deployment.

pub mod buffer_manager;
pub mod cmd_dispatcher;
pub mod cmd_sequencer;
pub mod com_driver;
pub mod com_queue;
pub mod event_logger;
pub mod fatal_handler;
pub mod file_uplink;
pub mod framer;
pub mod health;
pub mod rate_group;

pub use buffer_manager::BufferManagerComponent;
pub use cmd_dispatcher::CommandDispatcher;
pub use cmd_sequencer::{CmdSequencer, Sequencer, SequencerError, SequencerState};
pub use com_driver::{ChannelTransport, ComDriver, Transport, TransportPeer};
pub use com_queue::{ComQueue, ComQueueError, LaneConfig, PriorityLanes};
pub use event_logger::EventLogger;
pub use fatal_handler::{FatalHandler, FatalPolicy};
pub use file_uplink::{FilePacket, FileUplink};
pub use framer::{Deframer, Framer};
pub use health::{Health, HealthMonitor, PingEntry, PingState};
pub use rate_group::{ActiveRateGroup, Divider, RateGroupDriver};
