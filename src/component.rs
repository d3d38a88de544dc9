//! The component contract.
//!
//! A component declares its ports once and receives every invocation of its
//! inputs through [`Component::handle`]. It never holds references to its
//! peers; outputs are reached through the [`PortContext`] passed to each
//! handler, which resolves them against the topology's connection table.

use crate::events::{self, EventRecord};
use crate::port::{InstanceId, Message, PortArgs, PortError, PortResult, PortSpec};
use crate::topology::Wiring;
use serde::{Deserialize, Serialize};
use std::any::Any;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentKind {
    /// No queue, no thread. Inputs run on the caller.
    Passive,
    /// Has a queue but no thread; drains it when one of its sync inputs runs.
    Queued,
    /// Has a queue and a dedicated worker thread.
    Active,
}

impl ComponentKind {
    pub fn has_queue(self) -> bool {
        !matches!(self, ComponentKind::Passive)
    }
}

pub trait AsAny {
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub trait Component: AsAny + Send + 'static {
    fn kind(&self) -> ComponentKind;

    /// Port declarations. Indices into this list are the `port` numbers
    /// used by [`Component::handle`] and [`PortContext::invoke`].
    fn ports(&self) -> Vec<PortSpec>;

    fn handle(&mut self, ctx: &PortContext<'_>, port: usize, index: usize, args: PortArgs)
        -> PortResult;

    /// Called once after the topology is built and before tasks start.
    fn register_commands(&mut self, _ctx: &PortContext<'_>) -> Result<(), PortError> {
        Ok(())
    }

    /// Called once after all workers have stopped.
    fn teardown(&mut self, _ctx: &PortContext<'_>) {}
}

/// A component's view of its own wiring during a handler call.
pub struct PortContext<'a> {
    pub(crate) wiring: &'a Wiring,
    pub(crate) instance: InstanceId,
}

impl<'a> PortContext<'a> {
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn name(&self) -> &str {
        self.wiring.name(self.instance)
    }

    pub fn base_id(&self) -> u32 {
        self.wiring.base_id(self.instance)
    }

    /// Invokes index `index` of output `port`. An unconnected output is a
    /// no-op returning `Ok(None)`.
    pub fn invoke(&self, port: usize, index: usize, args: PortArgs) -> PortResult {
        self.wiring.invoke_output(self.instance, port, index, args)
    }

    pub fn is_connected(&self, port: usize, index: usize) -> bool {
        self.wiring.is_connected(self.instance, port, index)
    }

    pub fn port_size(&self, port: usize) -> usize {
        self.wiring.port_size(self.instance, port)
    }

    /// Next message on this instance's own queue, if any. Queued components
    /// call this from a sync handler to dispatch what has accumulated.
    pub fn next_message(&self) -> Option<Message> {
        self.wiring.try_next(self.instance)
    }

    pub fn pending_messages(&self) -> usize {
        self.wiring.pending(self.instance)
    }

    /// Builds an [`EventRecord`] with id `base_id + local_id` and emits it
    /// out of `port`.
    pub fn log(&self, port: usize, local_id: u32, severity: events::Severity, text: &str) {
        let record = EventRecord::new(self.base_id() + local_id, severity, self.name(), text);
        events::emit(self, port, record);
    }
}
