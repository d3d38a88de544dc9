mod common;

use common::{contexts, wait_for, Probe};
use fswrt::port::PortType;
use fswrt::port::PortResult;
use fswrt::queue::{OverflowPolicy, ShutdownPolicy};
use fswrt::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn sched_in(mode: InvocationMode) -> PortSpec {
    PortSpec::input("in", PortType::Sched, mode)
}

fn sched_out() -> PortSpec {
    PortSpec::output("out", PortType::Sched)
}

#[test]
fn test_async_messages_are_handled_in_fifo_order() {
    let (probe, journal) = Probe::new(ComponentKind::Active, vec![sched_in(InvocationMode::Async)]);
    let mut b = TopologyBuilder::new();
    let id = b.add_instance_with_queue("worker", 0x100, probe, QueueConfig::with_depth(32)).unwrap();
    let mut topology = b.build().unwrap();
    topology.start().unwrap();

    for context in 0..20 {
        let result = topology.invoke(id, "in", 0, PortArgs::Sched { context }).unwrap();
        assert!(result.is_none());
    }
    assert!(wait_for(Duration::from_secs(2), || journal.lock().len() == 20));
    topology.stop();

    assert_eq!(contexts(&journal), (0..20).collect::<Vec<_>>());
    let journal = journal.lock();
    assert!(journal.iter().all(|r| r.thread.as_deref() == Some("worker")));
}

#[test]
fn test_sync_input_returns_value_to_caller() {
    let (probe, journal) = Probe::new(ComponentKind::Passive, vec![sched_in(InvocationMode::Sync)]);
    let probe = probe.replying(|args| match args {
        PortArgs::Sched { context } => Some(PortArgs::Sched { context: context + 1 }),
        _ => None,
    });
    let mut b = TopologyBuilder::new();
    let id = b.add_instance("callee", 0, probe).unwrap();
    let topology = b.build().unwrap();

    let reply = topology.invoke(id, "in", 0, PortArgs::Sched { context: 5 }).unwrap();
    assert!(matches!(reply, Some(PortArgs::Sched { context: 6 })));
    assert_eq!(journal.lock().len(), 1);
}

#[test]
fn test_unconnected_output_is_a_no_op() {
    let (probe, journal) = Probe::new(
        ComponentKind::Passive,
        vec![sched_in(InvocationMode::Sync), sched_out()],
    );
    let mut b = TopologyBuilder::new();
    let id = b.add_instance("relay", 0, probe.forwarding(0, 1)).unwrap();
    let topology = b.build().unwrap();

    let reply = topology.invoke(id, "in", 0, PortArgs::Sched { context: 1 }).unwrap();
    assert!(reply.is_none());
    assert!(journal.lock().is_empty());
}

#[test]
fn test_output_reaches_connected_input() {
    let (relay, _) = Probe::new(
        ComponentKind::Passive,
        vec![sched_in(InvocationMode::Sync), sched_out()],
    );
    let (sink, journal) = Probe::new(ComponentKind::Passive, vec![sched_in(InvocationMode::Guarded)]);
    let mut b = TopologyBuilder::new();
    let relay = b.add_instance("relay", 0, relay.forwarding(0, 1)).unwrap();
    let sink = b.add_instance("sink", 0, sink).unwrap();
    b.wire((relay, "out", 0), (sink, "in", 0)).unwrap();
    let topology = b.build().unwrap();

    topology.invoke(relay, "in", 0, PortArgs::Sched { context: 9 }).unwrap();
    assert_eq!(contexts(&journal), vec![9]);
}

#[test]
fn test_invoking_an_output_from_outside_fails() {
    let (probe, _) = Probe::new(ComponentKind::Passive, vec![sched_out()]);
    let mut b = TopologyBuilder::new();
    let id = b.add_instance("p", 0, probe).unwrap();
    let topology = b.build().unwrap();
    assert!(matches!(
        topology.invoke(id, "out", 0, PortArgs::Sched { context: 0 }),
        Err(PortError::WrongDirection { .. })
    ));
    assert!(matches!(
        topology.invoke(id, "missing", 0, PortArgs::Sched { context: 0 }),
        Err(PortError::NoSuchPort { .. })
    ));
}

#[test]
fn test_wrong_argument_type_is_rejected() {
    let (probe, journal) = Probe::new(ComponentKind::Passive, vec![sched_in(InvocationMode::Sync)]);
    let mut b = TopologyBuilder::new();
    let id = b.add_instance("p", 0, probe).unwrap();
    let topology = b.build().unwrap();
    assert!(matches!(
        topology.invoke(id, "in", 0, PortArgs::Ping { key: 1 }),
        Err(PortError::TypeMismatch { .. })
    ));
    assert!(journal.lock().is_empty());
}

#[test]
fn test_duplicate_instance_name() {
    let mut b = TopologyBuilder::new();
    b.add_instance("p", 0, Probe::new(ComponentKind::Passive, vec![]).0).unwrap();
    let err = b.add_instance("p", 0, Probe::new(ComponentKind::Passive, vec![]).0).unwrap_err();
    assert!(matches!(err, TopologyError::DuplicateInstance(_)));
}

#[test]
fn test_async_input_on_passive_instance_is_rejected() {
    let (probe, _) = Probe::new(ComponentKind::Passive, vec![sched_in(InvocationMode::Async)]);
    let mut b = TopologyBuilder::new();
    assert!(matches!(
        b.add_instance("p", 0, probe),
        Err(TopologyError::AsyncOnPassive(_))
    ));
}

#[test]
fn test_connection_validation() {
    let (a, _) = Probe::new(
        ComponentKind::Passive,
        vec![sched_out(), PortSpec::output("ping", PortType::Ping)],
    );
    let (c, _) = Probe::new(ComponentKind::Passive, vec![sched_in(InvocationMode::Sync).array(2)]);
    let mut b = TopologyBuilder::new();
    let a = b.add_instance("a", 0, a).unwrap();
    let c = b.add_instance("c", 0, c).unwrap();

    assert!(matches!(
        b.wire((c, "in", 0), (a, "out", 0)),
        Err(TopologyError::WrongDirection { .. })
    ));
    assert!(matches!(
        b.wire((a, "out", 0), (c, "in", 2)),
        Err(TopologyError::PortIndexOutOfRange { index: 2, size: 2, .. })
    ));
    assert!(matches!(
        b.wire((a, "ping", 0), (c, "in", 0)),
        Err(TopologyError::TypeMismatch { .. })
    ));
    assert!(matches!(
        b.wire((a, "nope", 0), (c, "in", 0)),
        Err(TopologyError::UnknownPort { .. })
    ));
    b.wire((a, "out", 0), (c, "in", 0)).unwrap();
    assert!(matches!(
        b.wire((a, "out", 0), (c, "in", 1)),
        Err(TopologyError::AlreadyConnected(_))
    ));
}

#[test]
fn test_fan_in_needs_multi_producer() {
    let build = |multi: bool| {
        let input = if multi {
            sched_in(InvocationMode::Guarded).multi_producer()
        } else {
            sched_in(InvocationMode::Guarded)
        };
        let mut b = TopologyBuilder::new();
        let x = b.add_instance("x", 0, Probe::new(ComponentKind::Passive, vec![sched_out()]).0).unwrap();
        let y = b.add_instance("y", 0, Probe::new(ComponentKind::Passive, vec![sched_out()]).0).unwrap();
        let sink = b.add_instance("sink", 0, Probe::new(ComponentKind::Passive, vec![input]).0).unwrap();
        b.wire((x, "out", 0), (sink, "in", 0)).unwrap();
        b.wire((y, "out", 0), (sink, "in", 0)).unwrap();
        b.build()
    };
    assert!(matches!(build(false), Err(TopologyError::FanIn { producers: 2, .. })));
    assert!(build(true).is_ok());
}

#[test]
fn test_mandatory_input_must_be_connected() {
    let (probe, _) = Probe::new(
        ComponentKind::Passive,
        vec![sched_in(InvocationMode::Sync).mandatory()],
    );
    let mut b = TopologyBuilder::new();
    b.add_instance("p", 0, probe).unwrap();
    assert!(matches!(b.build(), Err(TopologyError::UnconnectedInput(_))));
}

#[test]
fn test_synchronous_cycle_is_rejected() {
    let ports = |mode| vec![sched_in(mode), sched_out()];
    let mut b = TopologyBuilder::new();
    let a = b.add_instance("a", 0, Probe::new(ComponentKind::Passive, ports(InvocationMode::Sync)).0).unwrap();
    let c = b.add_instance("c", 0, Probe::new(ComponentKind::Passive, ports(InvocationMode::Guarded)).0).unwrap();
    b.wire((a, "out", 0), (c, "in", 0)).unwrap();
    b.wire((c, "out", 0), (a, "in", 0)).unwrap();
    match b.build() {
        Err(TopologyError::SynchronousCycle(path)) => {
            assert!(path.contains('a') && path.contains('c'));
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("cycle accepted"),
    }
}

#[test]
fn test_cycle_through_async_edge_is_allowed() {
    let mut b = TopologyBuilder::new();
    let a = b
        .add_instance(
            "a",
            0,
            Probe::new(ComponentKind::Passive, vec![sched_in(InvocationMode::Sync), sched_out()]).0,
        )
        .unwrap();
    let c = b
        .add_instance(
            "c",
            0,
            Probe::new(ComponentKind::Active, vec![sched_in(InvocationMode::Async), sched_out()]).0,
        )
        .unwrap();
    b.wire((a, "out", 0), (c, "in", 0)).unwrap();
    b.wire((c, "out", 0), (a, "in", 0)).unwrap();
    assert!(b.build().is_ok());
}

#[test]
fn test_zero_depth_queue_is_rejected() {
    let (probe, _) = Probe::new(ComponentKind::Active, vec![sched_in(InvocationMode::Async)]);
    let mut b = TopologyBuilder::new();
    assert!(matches!(
        b.add_instance_with_queue("w", 0, probe, QueueConfig::with_depth(0)),
        Err(TopologyError::InvalidQueue(_))
    ));
}

#[test]
fn test_drop_policy_reports_full_queue() {
    let (probe, _) = Probe::new(ComponentKind::Active, vec![sched_in(InvocationMode::Async)]);
    let mut b = TopologyBuilder::new();
    let id = b
        .add_instance_with_queue(
            "w",
            0,
            probe,
            QueueConfig::with_depth(2).overflow(OverflowPolicy::Drop),
        )
        .unwrap();
    // Not started, so nothing drains.
    let topology = b.build().unwrap();
    topology.invoke(id, "in", 0, PortArgs::Sched { context: 0 }).unwrap();
    topology.invoke(id, "in", 0, PortArgs::Sched { context: 1 }).unwrap();
    assert!(matches!(
        topology.invoke(id, "in", 0, PortArgs::Sched { context: 2 }),
        Err(PortError::QueueFull { .. })
    ));
    let stats = topology.queue_stats(id).unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.enqueued, 2);
    assert_eq!(stats.rejected, 1);
}

#[test]
fn test_fatal_policy_reports_overflow() {
    let (probe, _) = Probe::new(ComponentKind::Active, vec![sched_in(InvocationMode::Async)]);
    let mut b = TopologyBuilder::new();
    let id = b
        .add_instance_with_queue(
            "w",
            0,
            probe,
            QueueConfig::with_depth(1).overflow(OverflowPolicy::Fatal),
        )
        .unwrap();
    let topology = b.build().unwrap();
    topology.invoke(id, "in", 0, PortArgs::Sched { context: 0 }).unwrap();
    assert!(matches!(
        topology.invoke(id, "in", 0, PortArgs::Sched { context: 1 }),
        Err(PortError::QueueOverflow { .. })
    ));
}

#[test]
fn test_queued_instance_drains_on_sync_input() {
    let (probe, journal) = Probe::new(
        ComponentKind::Queued,
        vec![sched_in(InvocationMode::Async), PortSpec::input("run", PortType::Sched, InvocationMode::Sync)],
    );
    let mut b = TopologyBuilder::new();
    let id = b.add_instance("q", 0, probe.draining_on(1)).unwrap();
    let mut topology = b.build().unwrap();
    topology.start().unwrap();
    assert!(!topology.is_running());

    for context in 1..=3 {
        topology.invoke(id, "in", 0, PortArgs::Sched { context }).unwrap();
    }
    assert!(journal.lock().is_empty());

    topology.invoke(id, "run", 0, PortArgs::Sched { context: 100 }).unwrap();
    assert_eq!(contexts(&journal), vec![100, 1, 2, 3]);
}

#[test]
fn test_stop_drains_pending_messages() {
    let (probe, journal) = Probe::new(ComponentKind::Active, vec![sched_in(InvocationMode::Async)]);
    let mut b = TopologyBuilder::new();
    let id = b.add_instance_with_queue("w", 0, probe, QueueConfig::with_depth(16)).unwrap();
    let mut topology = b.build().unwrap();
    for context in 0..8 {
        topology.invoke(id, "in", 0, PortArgs::Sched { context }).unwrap();
    }
    topology.start().unwrap();
    topology.stop();
    assert_eq!(contexts(&journal), (0..8).collect::<Vec<_>>());
    assert!(!topology.is_running());
}

#[test]
fn test_stop_with_discard_policy_leaves_handlers_idle() {
    let (probe, journal) = Probe::new(ComponentKind::Active, vec![sched_in(InvocationMode::Async)]);
    let mut b = TopologyBuilder::new();
    let id = b
        .add_instance_with_queue(
            "w",
            0,
            probe,
            QueueConfig::with_depth(16).on_shutdown(ShutdownPolicy::Discard),
        )
        .unwrap();
    let mut topology = b.build().unwrap();
    topology.start().unwrap();
    topology.stop();
    // A stopped worker's queue refuses new messages.
    assert!(matches!(
        topology.invoke(id, "in", 0, PortArgs::Sched { context: 1 }),
        Err(PortError::QueueClosed { .. })
    ));
    assert!(journal.lock().is_empty());
}

/// Active component that sends `count` messages out of port 1 for every
/// message it gets on port 0, whatever the outcome of each send.
struct Burst {
    count: u32,
    refused: Arc<Mutex<u32>>,
}

impl Component for Burst {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Active
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![sched_in(InvocationMode::Async), sched_out()]
    }

    fn handle(&mut self, ctx: &PortContext<'_>, _port: usize, _index: usize, _args: PortArgs) -> PortResult {
        for context in 0..self.count {
            if ctx.invoke(1, 0, PortArgs::Sched { context }).is_err() {
                *self.refused.lock() += 1;
            }
        }
        Ok(None)
    }
}

/// Active component that takes its time over every message.
struct Slow(Duration);

impl Component for Slow {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Active
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![sched_in(InvocationMode::Async)]
    }

    fn handle(&mut self, _ctx: &PortContext<'_>, _port: usize, _index: usize, _args: PortArgs) -> PortResult {
        std::thread::sleep(self.0);
        Ok(None)
    }
}

#[test]
fn test_stop_releases_producer_blocked_on_full_queue() {
    let refused = Arc::new(Mutex::new(0));
    let mut b = TopologyBuilder::new();
    let burst = b
        .add_instance_with_queue(
            "burst",
            0,
            Burst {
                count: 20,
                refused: refused.clone(),
            },
            QueueConfig::with_depth(4),
        )
        .unwrap();
    let sink = b
        .add_instance_with_queue(
            "sink",
            0,
            Slow(Duration::from_millis(20)),
            QueueConfig::with_depth(1)
                .overflow(OverflowPolicy::Block)
                .on_shutdown(ShutdownPolicy::Discard),
        )
        .unwrap();
    b.wire((burst, "out", 0), (sink, "in", 0)).unwrap();
    let mut topology = b.build().unwrap();
    topology.start().unwrap();

    topology.invoke(burst, "in", 0, PortArgs::Sched { context: 0 }).unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        topology.queue_stats(sink).unwrap().pending == 1
    }));

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let stopper = std::thread::spawn(move || {
        topology.stop();
        let _ = done_tx.send(());
        topology
    });
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    let topology = stopper.join().unwrap();
    assert!(!topology.is_running());
    // The sends still waiting when the sink stopped were refused, not lost.
    assert!(*refused.lock() > 0);
}

#[test]
fn test_port_index_is_checked_at_runtime() {
    let (probe, _) = Probe::new(ComponentKind::Passive, vec![sched_in(InvocationMode::Guarded)]);
    let mut b = TopologyBuilder::new();
    let id = b.add_instance("p", 0, probe).unwrap();
    let topology = b.build().unwrap();
    assert!(matches!(
        topology.invoke(id, "in", 1, PortArgs::Sched { context: 0 }),
        Err(PortError::PortIndexOutOfRange { index: 1, size: 1, .. })
    ));

    // A handler reaching past the end of its own output array.
    let (probe, _) = Probe::new(
        ComponentKind::Passive,
        vec![PortSpec::input("in", PortType::Sched, InvocationMode::Sync).array(2), sched_out()],
    );
    let mut b = TopologyBuilder::new();
    let id = b.add_instance("fwd", 0, probe.forwarding(0, 1)).unwrap();
    let topology = b.build().unwrap();
    assert!(topology.invoke(id, "in", 0, PortArgs::Sched { context: 0 }).is_ok());
    assert!(matches!(
        topology.invoke(id, "in", 1, PortArgs::Sched { context: 0 }),
        Err(PortError::PortIndexOutOfRange { index: 1, size: 1, .. })
    ));
}

/// Guarded component that records how many of its handlers run at once.
struct Overlap {
    inside: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Component for Overlap {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Passive
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![sched_in(InvocationMode::Guarded).multi_producer()]
    }

    fn handle(&mut self, _ctx: &PortContext<'_>, _port: usize, _index: usize, _args: PortArgs) -> PortResult {
        let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(2));
        self.inside.fetch_sub(1, Ordering::SeqCst);
        Ok(None)
    }
}

#[test]
fn test_guarded_input_runs_one_call_at_a_time() {
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut b = TopologyBuilder::new();
    let id = b
        .add_instance(
            "guarded",
            0,
            Overlap {
                inside: inside.clone(),
                peak: peak.clone(),
            },
        )
        .unwrap();
    let topology = b.build().unwrap();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for context in 0..10 {
                    topology.invoke(id, "in", 0, PortArgs::Sched { context }).unwrap();
                }
            });
        }
    });
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(inside.load(Ordering::SeqCst), 0);
}

#[test]
fn test_teardown_runs_in_reverse_order_once() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut b = TopologyBuilder::new();
    for name in ["first", "second", "third"] {
        let (probe, _) = Probe::new(ComponentKind::Passive, vec![]);
        b.add_instance(name, 0, probe.recording_teardown(order.clone())).unwrap();
    }
    let mut topology = b.build().unwrap();
    topology.teardown();
    topology.teardown();
    assert_eq!(*order.lock(), vec!["third", "second", "first"]);
}

#[test]
fn test_with_component_downcasts() {
    let mut b = TopologyBuilder::new();
    let id = b.add_instance("p", 0, Probe::new(ComponentKind::Passive, vec![]).0).unwrap();
    let topology = b.build().unwrap();
    assert_eq!(topology.with_component(id, |_: &mut Probe| 7), Some(7));
    assert_eq!(topology.with_component(id, |_: &mut svc::FatalHandler| 7), None);
    assert_eq!(topology.name(id), "p");
    assert_eq!(topology.kind(id), Some(ComponentKind::Passive));
}
