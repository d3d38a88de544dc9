//! Topology construction and the port dispatcher.
//!
//! Instances live in an arena indexed by [`InstanceId`]. Each output index
//! holds at most one [`PortRef`]; the table is frozen once
//! [`TopologyBuilder::build`] has validated it, and is shared read-only with
//! every worker thread.
//!
//! Build-time checks:
//! - every index of a mandatory input has a producer
//! - an input index has one producer unless it is declared multi-producer
//! - async inputs only exist on queued or active instances
//! - connected ports carry the same argument type
//! - sync and guarded edges form no cycle, so no handler can wait on a lock
//!   further up its own call chain

use crate::component::{Component, ComponentKind, PortContext};
use crate::port::{
    InstanceId, InvocationMode, Message, PortArgs, PortDirection, PortError, PortRef, PortResult,
    PortSpec,
};
use crate::queue::{MessageQueue, QueueConfig, QueueStats, ShutdownPolicy};
use crossbeam_channel::{select, Receiver};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("instance name {0} is already in use")]
    DuplicateInstance(String),
    #[error("no instance {0}")]
    UnknownInstance(String),
    #[error("{instance} has no port named {port}")]
    UnknownPort { instance: String, port: String },
    #[error("{from} -> {to}: connections run from an output to an input")]
    WrongDirection { from: String, to: String },
    #[error("index {index} out of range for {port}[{size}]")]
    PortIndexOutOfRange { port: String, index: usize, size: usize },
    #[error("{from} -> {to}: port types differ")]
    TypeMismatch { from: String, to: String },
    #[error("output {0} is already connected")]
    AlreadyConnected(String),
    #[error("input {port} has {producers} producers but is not multi-producer")]
    FanIn { port: String, producers: usize },
    #[error("mandatory input {0} is not connected")]
    UnconnectedInput(String),
    #[error("async input {0} belongs to a passive instance")]
    AsyncOnPassive(String),
    #[error("synchronous call cycle: {0}")]
    SynchronousCycle(String),
    #[error("invalid queue depth 0 for {0}")]
    InvalidQueue(String),
    #[error("command registration failed for {instance}: {source}")]
    Registration {
        instance: String,
        #[source]
        source: PortError,
    },
    #[error("failed to spawn worker for {instance}: {source}")]
    Spawn {
        instance: String,
        #[source]
        source: std::io::Error,
    },
}

struct PendingInstance {
    name: String,
    base_id: u32,
    kind: ComponentKind,
    ports: Vec<PortSpec>,
    component: Box<dyn Component>,
    queue: QueueConfig,
}

#[derive(Default)]
pub struct TopologyBuilder {
    instances: Vec<PendingInstance>,
    names: HashMap<String, InstanceId>,
    edges: Vec<(PortRef, PortRef)>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instance<C: Component>(
        &mut self,
        name: &str,
        base_id: u32,
        component: C,
    ) -> Result<InstanceId, TopologyError> {
        self.add_instance_with_queue(name, base_id, component, QueueConfig::default())
    }

    pub fn add_instance_with_queue<C: Component>(
        &mut self,
        name: &str,
        base_id: u32,
        component: C,
        queue: QueueConfig,
    ) -> Result<InstanceId, TopologyError> {
        if self.names.contains_key(name) {
            return Err(TopologyError::DuplicateInstance(name.to_string()));
        }
        let kind = component.kind();
        let ports = component.ports();

        if kind.has_queue() && queue.depth == 0 {
            return Err(TopologyError::InvalidQueue(name.to_string()));
        }
        if kind == ComponentKind::Passive {
            if let Some(port) = ports
                .iter()
                .find(|p| p.is_input() && p.mode == InvocationMode::Async)
            {
                return Err(TopologyError::AsyncOnPassive(format!("{name}.{}", port.name)));
            }
        }

        let id = InstanceId(self.instances.len());
        debug!(instance = name, base_id, ?kind, ports = ports.len(), "instance added");
        self.names.insert(name.to_string(), id);
        self.instances.push(PendingInstance {
            name: name.to_string(),
            base_id,
            kind,
            ports,
            component: Box::new(component),
            queue,
        });
        Ok(id)
    }

    pub fn instance(&self, name: &str) -> Option<InstanceId> {
        self.names.get(name).copied()
    }

    /// Resolves `instance.port[index]` to a [`PortRef`].
    pub fn port(
        &self,
        instance: InstanceId,
        port: &str,
        index: usize,
    ) -> Result<PortRef, TopologyError> {
        let pending = self
            .instances
            .get(instance.0)
            .ok_or_else(|| TopologyError::UnknownInstance(instance.to_string()))?;
        let position = pending
            .ports
            .iter()
            .position(|p| p.name == port)
            .ok_or_else(|| TopologyError::UnknownPort {
                instance: pending.name.clone(),
                port: port.to_string(),
            })?;
        Ok(PortRef {
            instance,
            port: position,
            index,
        })
    }

    pub fn connect(&mut self, from: PortRef, to: PortRef) -> Result<(), TopologyError> {
        let out = self.spec(from)?;
        let input = self.spec(to)?;
        let from_label = self.label(from);
        let to_label = self.label(to);

        if out.direction != PortDirection::Output || input.direction != PortDirection::Input {
            return Err(TopologyError::WrongDirection {
                from: from_label,
                to: to_label,
            });
        }
        for (port, spec) in [(from, &out), (to, &input)] {
            if port.index >= spec.size {
                return Err(TopologyError::PortIndexOutOfRange {
                    port: self.label(port),
                    index: port.index,
                    size: spec.size,
                });
            }
        }
        if out.port_type != input.port_type {
            return Err(TopologyError::TypeMismatch {
                from: from_label,
                to: to_label,
            });
        }
        if self.edges.iter().any(|(f, _)| *f == from) {
            return Err(TopologyError::AlreadyConnected(from_label));
        }

        trace!(from = %from_label, to = %to_label, "connected");
        self.edges.push((from, to));
        Ok(())
    }

    /// Shorthand for `connect(port(..), port(..))`.
    pub fn wire(
        &mut self,
        from: (InstanceId, &str, usize),
        to: (InstanceId, &str, usize),
    ) -> Result<(), TopologyError> {
        let from = self.port(from.0, from.1, from.2)?;
        let to = self.port(to.0, to.1, to.2)?;
        self.connect(from, to)
    }

    fn spec(&self, port: PortRef) -> Result<PortSpec, TopologyError> {
        let pending = self
            .instances
            .get(port.instance.0)
            .ok_or_else(|| TopologyError::UnknownInstance(port.instance.to_string()))?;
        pending
            .ports
            .get(port.port)
            .cloned()
            .ok_or_else(|| TopologyError::UnknownPort {
                instance: pending.name.clone(),
                port: port.port.to_string(),
            })
    }

    fn label(&self, port: PortRef) -> String {
        match self.instances.get(port.instance.0) {
            Some(pending) => {
                let name = pending.ports.get(port.port).map_or("?", |p| p.name);
                format!("{}.{}[{}]", pending.name, name, port.index)
            }
            None => format!("{}.{}[{}]", port.instance, port.port, port.index),
        }
    }

    pub fn build(self) -> Result<Topology, TopologyError> {
        let mut producers: HashMap<PortRef, usize> = HashMap::new();
        for (_, to) in &self.edges {
            *producers.entry(*to).or_default() += 1;
        }

        for (i, pending) in self.instances.iter().enumerate() {
            for (p, spec) in pending.ports.iter().enumerate() {
                if !spec.is_input() {
                    continue;
                }
                for index in 0..spec.size {
                    let port = PortRef {
                        instance: InstanceId(i),
                        port: p,
                        index,
                    };
                    let count = producers.get(&port).copied().unwrap_or(0);
                    if spec.mandatory && count == 0 {
                        return Err(TopologyError::UnconnectedInput(self.label(port)));
                    }
                    if count > 1 && !spec.multi_producer {
                        return Err(TopologyError::FanIn {
                            port: self.label(port),
                            producers: count,
                        });
                    }
                }
            }
        }

        self.check_sync_cycles()?;

        let mut instances = Vec::with_capacity(self.instances.len());
        for pending in self.instances {
            let mut outputs: Vec<Vec<Option<PortRef>>> = pending
                .ports
                .iter()
                .map(|spec| match spec.direction {
                    PortDirection::Output => vec![None; spec.size],
                    PortDirection::Input => Vec::new(),
                })
                .collect();
            let id = InstanceId(instances.len());
            for (from, to) in self.edges.iter().filter(|(from, _)| from.instance == id) {
                outputs[from.port][from.index] = Some(*to);
            }
            let queue = pending
                .kind
                .has_queue()
                .then(|| MessageQueue::new(&pending.name, pending.queue));
            instances.push(Instance {
                name: pending.name,
                base_id: pending.base_id,
                kind: pending.kind,
                ports: pending.ports,
                outputs,
                queue,
                state: Mutex::new(pending.component),
            });
        }

        info!(
            instances = instances.len(),
            connections = self.edges.len(),
            "topology built"
        );

        Ok(Topology {
            wiring: Arc::new(Wiring { instances }),
            workers: Vec::new(),
            torn_down: false,
        })
    }

    fn check_sync_cycles(&self) -> Result<(), TopologyError> {
        let count = self.instances.len();
        let mut graph: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (from, to) in &self.edges {
            let target = &self.instances[to.instance.0].ports[to.port];
            if target.mode != InvocationMode::Async && !graph[from.instance.0].contains(&to.instance.0)
            {
                graph[from.instance.0].push(to.instance.0);
            }
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        fn visit(
            node: usize,
            graph: &[Vec<usize>],
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            marks[node] = Mark::OnStack;
            stack.push(node);
            for &next in &graph[node] {
                match marks[next] {
                    Mark::OnStack => {
                        let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(next, graph, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            stack.pop();
            marks[node] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::Unvisited; count];
        for node in 0..count {
            if marks[node] != Mark::Unvisited {
                continue;
            }
            let mut stack = Vec::new();
            if let Some(cycle) = visit(node, &graph, &mut marks, &mut stack) {
                let path: Vec<&str> = cycle
                    .iter()
                    .map(|&n| self.instances[n].name.as_str())
                    .collect();
                return Err(TopologyError::SynchronousCycle(path.join(" -> ")));
            }
        }
        Ok(())
    }
}

pub(crate) struct Instance {
    name: String,
    base_id: u32,
    kind: ComponentKind,
    ports: Vec<PortSpec>,
    outputs: Vec<Vec<Option<PortRef>>>,
    queue: Option<MessageQueue>,
    state: Mutex<Box<dyn Component>>,
}

/// Frozen connection table plus instance state, shared with workers.
pub(crate) struct Wiring {
    instances: Vec<Instance>,
}

impl Wiring {
    pub(crate) fn name(&self, id: InstanceId) -> &str {
        self.instances.get(id.0).map_or("?", |i| i.name.as_str())
    }

    pub(crate) fn base_id(&self, id: InstanceId) -> u32 {
        self.instances.get(id.0).map_or(0, |i| i.base_id)
    }

    fn instance(&self, id: InstanceId) -> Result<&Instance, PortError> {
        self.instances.get(id.0).ok_or_else(|| PortError::NoSuchPort {
            instance: id.to_string(),
            port: String::new(),
        })
    }

    fn output_target(&self, id: InstanceId, port: usize, index: usize) -> Option<PortRef> {
        self.instances
            .get(id.0)
            .and_then(|i| i.outputs.get(port))
            .and_then(|indices| indices.get(index))
            .copied()
            .flatten()
    }

    pub(crate) fn is_connected(&self, id: InstanceId, port: usize, index: usize) -> bool {
        self.output_target(id, port, index).is_some()
    }

    pub(crate) fn port_size(&self, id: InstanceId, port: usize) -> usize {
        self.instances
            .get(id.0)
            .and_then(|i| i.ports.get(port))
            .map_or(0, |spec| spec.size)
    }

    pub(crate) fn invoke_output(
        &self,
        from: InstanceId,
        port: usize,
        index: usize,
        args: PortArgs,
    ) -> PortResult {
        let instance = self.instance(from)?;
        let spec = instance.ports.get(port).ok_or_else(|| PortError::NoSuchPort {
            instance: instance.name.clone(),
            port: port.to_string(),
        })?;
        if spec.direction != PortDirection::Output {
            return Err(PortError::WrongDirection {
                instance: instance.name.clone(),
                port: spec.name,
            });
        }
        if index >= spec.size {
            error!(instance = %instance.name, port = spec.name, index, "port index out of range");
            return Err(PortError::PortIndexOutOfRange {
                instance: instance.name.clone(),
                port: spec.name,
                index,
                size: spec.size,
            });
        }
        match instance.outputs[port][index] {
            Some(target) => self.deliver(target, args),
            None => {
                trace!(instance = %instance.name, port = spec.name, index, "unconnected output");
                Ok(None)
            }
        }
    }

    /// Runs or enqueues an invocation of input `target`.
    pub(crate) fn deliver(&self, target: PortRef, args: PortArgs) -> PortResult {
        let instance = self.instance(target.instance)?;
        let spec = instance
            .ports
            .get(target.port)
            .ok_or_else(|| PortError::NoSuchPort {
                instance: instance.name.clone(),
                port: target.port.to_string(),
            })?;
        if target.index >= spec.size {
            return Err(PortError::PortIndexOutOfRange {
                instance: instance.name.clone(),
                port: spec.name,
                index: target.index,
                size: spec.size,
            });
        }
        if args.port_type() != spec.port_type {
            return Err(PortError::TypeMismatch {
                port: spec.name,
                expected: spec.port_type,
                got: args.port_type(),
            });
        }

        match spec.mode {
            InvocationMode::Async => {
                let queue = instance.queue.as_ref().ok_or_else(|| PortError::QueueClosed {
                    instance: instance.name.clone(),
                })?;
                queue.send(Message {
                    port: target.port,
                    index: target.index,
                    args,
                    enqueued_at: Instant::now(),
                })?;
                Ok(None)
            }
            InvocationMode::Sync | InvocationMode::Guarded => {
                let mut component = instance.state.lock();
                let ctx = PortContext {
                    wiring: self,
                    instance: target.instance,
                };
                component.handle(&ctx, target.port, target.index, args)
            }
        }
    }

    pub(crate) fn try_next(&self, id: InstanceId) -> Option<Message> {
        self.instances
            .get(id.0)
            .and_then(|i| i.queue.as_ref())
            .and_then(MessageQueue::try_recv)
    }

    pub(crate) fn pending(&self, id: InstanceId) -> usize {
        self.instances
            .get(id.0)
            .and_then(|i| i.queue.as_ref())
            .map_or(0, MessageQueue::len)
    }

    fn dispatch(&self, id: InstanceId, message: Message) {
        let Some(instance) = self.instances.get(id.0) else {
            return;
        };
        let mut component = instance.state.lock();
        let ctx = PortContext { wiring: self, instance: id };
        let port = message.port;
        if let Err(e) = component.handle(&ctx, message.port, message.index, message.args) {
            warn!(instance = %instance.name, port, error = %e, "handler failed");
        }
    }

    fn run_worker(
        &self,
        id: InstanceId,
        messages: Receiver<Message>,
        stop: Receiver<()>,
        policy: ShutdownPolicy,
    ) {
        loop {
            select! {
                recv(messages) -> message => match message {
                    Ok(message) => self.dispatch(id, message),
                    Err(_) => break,
                },
                recv(stop) -> _ => {
                    // Producers blocked on a full queue must not outlive the worker.
                    if let Some(queue) = self.instances.get(id.0).and_then(|i| i.queue.as_ref()) {
                        queue.close();
                    }
                    match policy {
                        ShutdownPolicy::Drain => {
                            while let Ok(message) = messages.try_recv() {
                                self.dispatch(id, message);
                            }
                        }
                        ShutdownPolicy::Discard => {
                            let discarded = messages.try_iter().count();
                            if discarded > 0 {
                                warn!(instance = self.name(id), discarded, "discarded pending messages");
                            }
                        }
                    }
                    break;
                }
            }
        }
        debug!(instance = self.name(id), "worker exiting");
    }
}

/// A built, validated topology.
pub struct Topology {
    wiring: Arc<Wiring>,
    workers: Vec<(InstanceId, JoinHandle<()>)>,
    torn_down: bool,
}

impl Topology {
    pub fn instance(&self, name: &str) -> Option<InstanceId> {
        self.wiring
            .instances
            .iter()
            .position(|i| i.name == name)
            .map(InstanceId)
    }

    pub fn name(&self, id: InstanceId) -> &str {
        self.wiring.name(id)
    }

    pub fn kind(&self, id: InstanceId) -> Option<ComponentKind> {
        self.wiring.instances.get(id.0).map(|i| i.kind)
    }

    pub fn instance_count(&self) -> usize {
        self.wiring.instances.len()
    }

    /// Invokes input `port[index]` of `id` from outside the topology, as a
    /// hardware interrupt or test harness would.
    pub fn invoke(&self, id: InstanceId, port: &str, index: usize, args: PortArgs) -> PortResult {
        let instance = self.wiring.instance(id)?;
        let position = instance
            .ports
            .iter()
            .position(|p| p.name == port)
            .ok_or_else(|| PortError::NoSuchPort {
                instance: instance.name.clone(),
                port: port.to_string(),
            })?;
        if !instance.ports[position].is_input() {
            return Err(PortError::WrongDirection {
                instance: instance.name.clone(),
                port: instance.ports[position].name,
            });
        }
        self.wiring.deliver(
            PortRef {
                instance: id,
                port: position,
                index,
            },
            args,
        )
    }

    pub fn register_commands(&self) -> Result<(), TopologyError> {
        for (i, instance) in self.wiring.instances.iter().enumerate() {
            let ctx = PortContext {
                wiring: &self.wiring,
                instance: InstanceId(i),
            };
            instance
                .state
                .lock()
                .register_commands(&ctx)
                .map_err(|source| TopologyError::Registration {
                    instance: instance.name.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Spawns one worker thread per active instance.
    pub fn start(&mut self) -> Result<(), TopologyError> {
        if !self.workers.is_empty() {
            return Ok(());
        }
        for (i, instance) in self.wiring.instances.iter().enumerate() {
            if instance.kind != ComponentKind::Active {
                continue;
            }
            let Some(queue) = instance.queue.as_ref() else {
                continue;
            };
            let id = InstanceId(i);
            let messages = queue.receiver();
            let stop = queue.stop_receiver();
            let policy = queue.config().on_shutdown;
            let wiring = Arc::clone(&self.wiring);
            let handle = thread::Builder::new()
                .name(instance.name.clone())
                .spawn(move || wiring.run_worker(id, messages, stop, policy))
                .map_err(|source| TopologyError::Spawn {
                    instance: instance.name.clone(),
                    source,
                })?;
            self.workers.push((id, handle));
        }
        info!(workers = self.workers.len(), "tasks started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Signals every worker, then joins them. Pending messages are drained
    /// or discarded per each queue's shutdown policy.
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for (id, _) in &self.workers {
            if let Some(queue) = self.wiring.instances[id.0].queue.as_ref() {
                queue.signal_stop();
            }
        }
        for (id, handle) in self.workers.drain(..) {
            if handle.join().is_err() {
                error!(instance = self.wiring.name(id), "worker panicked");
            }
        }
        info!("tasks stopped");
    }

    /// Stops workers, then gives every instance its teardown call in
    /// reverse construction order. Runs once.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.stop();
        for (i, instance) in self.wiring.instances.iter().enumerate().rev() {
            let ctx = PortContext {
                wiring: &self.wiring,
                instance: InstanceId(i),
            };
            instance.state.lock().teardown(&ctx);
        }
        self.torn_down = true;
        info!("topology torn down");
    }

    /// Runs `f` against the instance's component if it is a `C`.
    pub fn with_component<C: Component, R>(
        &self,
        id: InstanceId,
        f: impl FnOnce(&mut C) -> R,
    ) -> Option<R> {
        let instance = self.wiring.instances.get(id.0)?;
        let mut guard = instance.state.lock();
        let component: &mut dyn Component = &mut **guard;
        component.as_any_mut().downcast_mut::<C>().map(f)
    }

    pub fn queue_stats(&self, id: InstanceId) -> Option<QueueStats> {
        self.wiring
            .instances
            .get(id.0)
            .and_then(|i| i.queue.as_ref())
            .map(MessageQueue::stats)
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        self.stop();
    }
}
