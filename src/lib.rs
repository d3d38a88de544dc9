//! # Flight Software Topology Runtime
//!
//! A component runtime for flight software: components expose typed ports,
//! a topology wires them together and validates the graph, and active
//! components run their own task draining a bounded message queue.
//!
//! ## Features
//!
//! - **Port dispatch**: synchronous, guarded and asynchronous invocation over a static connection graph
//! - **Message queues**: bounded FIFO mailboxes with block, drop or fatal overflow policies
//! - **Rate groups**: a divider-driven driver fanning one tick out to scheduled members
//! - **Buffer manager**: fixed-size pooled buffers in bins, no allocation after setup
//! - **Downlink**: prioritized com queue lanes, F Prime style framing and a pluggable transport
//! - **Uplink**: deframing, command dispatch and file reassembly
//! - **Health**: ping-based liveness with WARN and FATAL thresholds
//! - **Sequencing**: binary command sequences run one command at a time
//!
//! ## Quick Start
//!
//! ```rust
//! use fswrt::svc::ChannelTransport;
//! use fswrt::{Deployment, TopologyConfig};
//!
//! let (transport, _ground) = ChannelTransport::pair();
//! let deployment = Deployment::setup(&TopologyConfig::reference(), Box::new(transport))?;
//! for _ in 0..4 {
//!     deployment.cycle()?;
//! }
//! deployment.teardown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - [`port`] - Port types, arguments and errors
//! - [`queue`] - Bounded message queues
//! - [`component`] - The component trait and its port context
//! - [`topology`] - Graph construction, validation and task lifecycle
//! - [`buffer`] - Pooled buffer management
//! - [`framing`] - Frame codec
//! - [`svc`] - Service components
//! - [`deployment`] - The reference topology

#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod component;
pub mod config;
pub mod deployment;
pub mod events;
pub mod framing;
pub mod port;
pub mod queue;
pub mod svc;
pub mod topology;

// Re-export main public types for convenience
pub use buffer::{BinConfig, Buffer, BufferError, BufferManager, HeapAllocator};
pub use component::{Component, ComponentKind, PortContext};
pub use config::{ConfigError, TopologyConfig};
pub use deployment::{Deployment, DeploymentError};
pub use events::{EventRecord, Severity};
pub use port::{InstanceId, InvocationMode, PortArgs, PortError, PortSpec, PortType};
pub use queue::{OverflowPolicy, QueueConfig};
pub use topology::{Topology, TopologyBuilder, TopologyError};
