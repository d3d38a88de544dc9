#![allow(dead_code)]

use fswrt::port::{PortArgs, PortResult, PortSpec};
use fswrt::{Component, ComponentKind, PortContext};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Received {
    pub port: usize,
    pub index: usize,
    pub args: PortArgs,
    pub thread: Option<String>,
}

pub type Journal = Arc<Mutex<Vec<Received>>>;

/// Test component with configurable ports. Every input invocation is
/// journaled; optional behaviours forward, reply or drain the queue.
pub struct Probe {
    kind: ComponentKind,
    ports: Vec<PortSpec>,
    journal: Journal,
    forward: Option<(usize, usize)>,
    reply: Option<fn(&PortArgs) -> Option<PortArgs>>,
    drain_on: Option<usize>,
    teardowns: Option<Arc<Mutex<Vec<String>>>>,
}

impl Probe {
    pub fn new(kind: ComponentKind, ports: Vec<PortSpec>) -> (Self, Journal) {
        let journal = Journal::default();
        (
            Self {
                kind,
                ports,
                journal: journal.clone(),
                forward: None,
                reply: None,
                drain_on: None,
                teardowns: None,
            },
            journal,
        )
    }

    /// Invocations of `input` are passed on out of `output`, same index.
    pub fn forwarding(mut self, input: usize, output: usize) -> Self {
        self.forward = Some((input, output));
        self
    }

    pub fn replying(mut self, reply: fn(&PortArgs) -> Option<PortArgs>) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Invoking `port` drains this instance's queue into the journal.
    pub fn draining_on(mut self, port: usize) -> Self {
        self.drain_on = Some(port);
        self
    }

    pub fn recording_teardown(mut self, order: Arc<Mutex<Vec<String>>>) -> Self {
        self.teardowns = Some(order);
        self
    }
}

impl Component for Probe {
    fn kind(&self) -> ComponentKind {
        self.kind
    }

    fn ports(&self) -> Vec<PortSpec> {
        self.ports.clone()
    }

    fn handle(&mut self, ctx: &PortContext<'_>, port: usize, index: usize, args: PortArgs) -> PortResult {
        if let Some((input, output)) = self.forward {
            if input == port {
                return ctx.invoke(output, index, args);
            }
        }
        let reply = self.reply.and_then(|f| f(&args));
        self.journal.lock().push(Received {
            port,
            index,
            args,
            thread: std::thread::current().name().map(str::to_string),
        });
        if self.drain_on == Some(port) {
            while let Some(message) = ctx.next_message() {
                self.journal.lock().push(Received {
                    port: message.port,
                    index: message.index,
                    args: message.args,
                    thread: std::thread::current().name().map(str::to_string),
                });
            }
        }
        Ok(reply)
    }

    fn teardown(&mut self, ctx: &PortContext<'_>) {
        if let Some(order) = &self.teardowns {
            order.lock().push(ctx.name().to_string());
        }
    }
}

pub fn contexts(journal: &Journal) -> Vec<u32> {
    journal
        .lock()
        .iter()
        .filter_map(|r| match r.args {
            PortArgs::Sched { context } => Some(context),
            _ => None,
        })
        .collect()
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
