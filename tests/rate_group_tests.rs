mod common;

use common::{contexts, wait_for, Probe};
use fswrt::port::PortType;
use fswrt::svc::rate_group::RateGroupStats;
use fswrt::svc::{ActiveRateGroup, Divider, RateGroupDriver};
use fswrt::*;
use std::time::Duration;

fn member(size: usize) -> (Probe, common::Journal) {
    Probe::new(
        ComponentKind::Passive,
        vec![PortSpec::input("schedIn", PortType::Sched, InvocationMode::Guarded).array(size)],
    )
}

#[test]
fn test_driver_divides_ticks_across_groups() {
    let dividers = [Divider::new(1, 0), Divider::new(2, 0), Divider::new(4, 0)];
    let mut b = TopologyBuilder::new();
    let driver = b
        .add_instance("rateGroupDriver", 0x100, RateGroupDriver::new(&dividers).unwrap())
        .unwrap();
    let mut journals = Vec::new();
    for group in 0..3 {
        let rg = b
            .add_instance_with_queue(
                &format!("rateGroup{}", group + 1),
                0x200,
                ActiveRateGroup::new(&[group as u32]).unwrap(),
                QueueConfig::with_depth(16),
            )
            .unwrap();
        let (probe, journal) = member(1);
        let target = b.add_instance(&format!("member{group}"), 0, probe).unwrap();
        b.wire((driver, "CycleOut", group), (rg, "CycleIn", 0)).unwrap();
        b.wire((rg, "RateGroupMemberOut", 0), (target, "schedIn", 0)).unwrap();
        journals.push(journal);
    }
    let mut topology = b.build().unwrap();
    topology.start().unwrap();

    for _ in 0..8 {
        topology
            .invoke(driver, "CycleIn", 0, PortArgs::Sched { context: 0 })
            .unwrap();
    }
    assert!(wait_for(Duration::from_secs(2), || {
        journals.iter().map(|j| j.lock().len()).collect::<Vec<_>>() == vec![8, 4, 2]
    }));
    topology.stop();

    assert_eq!(contexts(&journals[2]), vec![2, 2]);
    assert_eq!(topology.with_component(driver, |d: &mut RateGroupDriver| d.tick()), Some(0));
}

#[test]
fn test_offset_shifts_which_ticks_fire() {
    let mut driver = RateGroupDriver::new(&[Divider::new(2, 1), Divider::new(3, 0)]).unwrap();
    let fired: Vec<Vec<usize>> = (0..6).map(|_| driver.advance().to_vec()).collect();
    assert_eq!(
        fired,
        vec![vec![1], vec![0], vec![], vec![0, 1], vec![], vec![0]]
    );
}

#[test]
fn test_members_run_in_order_on_group_thread() {
    let mut b = TopologyBuilder::new();
    let rg = b
        .add_instance_with_queue(
            "rg",
            0x200,
            ActiveRateGroup::new(&[10, 20, 30]).unwrap(),
            QueueConfig::with_depth(4),
        )
        .unwrap();
    let (probe, journal) = member(3);
    let target = b.add_instance("member", 0, probe).unwrap();
    for i in 0..3 {
        b.wire((rg, "RateGroupMemberOut", i), (target, "schedIn", i)).unwrap();
    }
    let mut topology = b.build().unwrap();
    topology.start().unwrap();
    topology.invoke(rg, "CycleIn", 0, PortArgs::Sched { context: 0 }).unwrap();
    assert!(wait_for(Duration::from_secs(2), || journal.lock().len() == 3));
    topology.stop();

    assert_eq!(contexts(&journal), vec![10, 20, 30]);
    let journal = journal.lock();
    assert_eq!(journal.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(journal.iter().all(|r| r.thread.as_deref() == Some("rg")));
}

#[test]
fn test_unconnected_members_are_skipped() {
    let mut b = TopologyBuilder::new();
    let rg = b
        .add_instance_with_queue("rg", 0, ActiveRateGroup::new(&[1, 2, 3]).unwrap(), QueueConfig::with_depth(4))
        .unwrap();
    let (probe, journal) = member(1);
    let target = b.add_instance("member", 0, probe).unwrap();
    b.wire((rg, "RateGroupMemberOut", 1), (target, "schedIn", 0)).unwrap();
    let mut topology = b.build().unwrap();
    topology.start().unwrap();
    topology.invoke(rg, "CycleIn", 0, PortArgs::Sched { context: 0 }).unwrap();
    assert!(wait_for(Duration::from_secs(2), || journal.lock().len() == 1));
    topology.stop();
    assert_eq!(contexts(&journal), vec![2]);
}

#[test]
fn test_backlogged_cycles_count_as_slips() {
    let mut b = TopologyBuilder::new();
    let rg = b
        .add_instance_with_queue("rg", 0x300, ActiveRateGroup::new(&[0]).unwrap(), QueueConfig::with_depth(8))
        .unwrap();
    let (log, events) = Probe::new(
        ComponentKind::Passive,
        vec![PortSpec::input("logIn", PortType::Log, InvocationMode::Guarded)],
    );
    let logger = b.add_instance("log", 0, log).unwrap();
    b.wire((rg, "Log", 0), (logger, "logIn", 0)).unwrap();
    let mut topology = b.build().unwrap();

    // Three ticks queued before the task runs: the first two find a
    // successor already waiting.
    for _ in 0..3 {
        topology.invoke(rg, "CycleIn", 0, PortArgs::Sched { context: 0 }).unwrap();
    }
    topology.start().unwrap();
    topology.stop();

    let stats = topology
        .with_component(rg, |g: &mut ActiveRateGroup| g.stats())
        .unwrap();
    assert_eq!(
        stats,
        RateGroupStats {
            cycles: 3,
            slips: 2,
            max_cycle_time_us: stats.max_cycle_time_us
        }
    );
    let events = events.lock();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|r| matches!(
        &r.args,
        PortArgs::Log(record) if record.id == 0x300 + ActiveRateGroup::EVENT_CYCLE_SLIP
            && record.severity == Severity::WarningHi
    )));
}

#[test]
fn test_ping_is_echoed() {
    let mut b = TopologyBuilder::new();
    let rg = b
        .add_instance_with_queue("rg", 0, ActiveRateGroup::new(&[]).unwrap(), QueueConfig::with_depth(4))
        .unwrap();
    let (probe, journal) = Probe::new(
        ComponentKind::Passive,
        vec![PortSpec::input("pingReturn", PortType::Ping, InvocationMode::Guarded)],
    );
    let health = b.add_instance("health", 0, probe).unwrap();
    b.wire((rg, "PingOut", 0), (health, "pingReturn", 0)).unwrap();
    let mut topology = b.build().unwrap();
    topology.start().unwrap();
    topology.invoke(rg, "PingIn", 0, PortArgs::Ping { key: 42 }).unwrap();
    assert!(wait_for(Duration::from_secs(2), || journal.lock().len() == 1));
    topology.stop();
    assert!(matches!(journal.lock()[0].args, PortArgs::Ping { key: 42 }));
}
