use fswrt::buffer::{BackingAllocator, Exhaustion};
use fswrt::svc::BufferManagerComponent;
use fswrt::*;
use std::sync::Arc;

fn manager(id: u32, bins: &[BinConfig]) -> (Arc<BufferManager>, Arc<HeapAllocator>) {
    let allocator = Arc::new(HeapAllocator::new());
    let backing: Arc<dyn BackingAllocator> = allocator.clone();
    (Arc::new(BufferManager::setup(id, backing, bins).unwrap()), allocator)
}

fn get(topology: &Topology, id: InstanceId, size: usize) -> Result<Buffer, PortError> {
    match topology.invoke(id, "bufferGetCallee", 0, PortArgs::BufferGet { size })? {
        Some(PortArgs::Buffer(buffer)) => Ok(buffer),
        other => panic!("unexpected reply {other:?}"),
    }
}

#[test]
fn test_allocation_through_ports() {
    let (manager, _) = manager(7, &[BinConfig::new(64, 2), BinConfig::new(256, 1)]);
    let mut b = TopologyBuilder::new();
    let bm = b.add_instance("bufferManager", 0, BufferManagerComponent::new(manager.clone())).unwrap();
    let topology = b.build().unwrap();

    let mut small = get(&topology, bm, 10).unwrap();
    assert_eq!(small.manager_id(), 7);
    assert_eq!(small.bin(), 0);
    assert_eq!(small.len(), 10);
    assert_eq!(small.capacity(), 64);
    small.fill_from(b"telemetry").unwrap();
    assert_eq!(small.as_slice(), b"telemetry");

    let large = get(&topology, bm, 100).unwrap();
    assert_eq!(large.bin(), 1);
    assert_eq!(manager.stats().current_allocated, 2);

    topology
        .invoke(bm, "bufferSendIn", 0, PortArgs::Buffer(small))
        .unwrap();
    topology
        .invoke(bm, "bufferSendIn", 0, PortArgs::Buffer(large))
        .unwrap();
    let stats = manager.stats();
    assert_eq!(stats.current_allocated, 0);
    assert_eq!(stats.high_water, 2);
    assert_eq!(stats.allocations, 2);
    assert_eq!(manager.free_counts(), vec![2, 1]);
}

#[test]
fn test_smaller_bin_overflows_into_larger() {
    let (manager, _) = manager(1, &[BinConfig::new(64, 1), BinConfig::new(128, 1)]);
    let first = manager.allocate(32).unwrap();
    let second = manager.allocate(32).unwrap();
    assert_eq!(first.bin(), 0);
    assert_eq!(second.bin(), 1);

    let err = manager.allocate(32).unwrap_err();
    assert_eq!(
        err,
        BufferError::OutOfBuffers {
            requested: 32,
            reason: Exhaustion::NoFreeSlot
        }
    );
    assert_eq!(manager.stats().no_free_slot, 1);
    manager.deallocate(first).unwrap();
    manager.deallocate(second).unwrap();
}

#[test]
fn test_exhaustion_reported_to_port_caller() {
    let (manager, _) = manager(1, &[BinConfig::new(16, 1)]);
    let mut b = TopologyBuilder::new();
    let bm = b.add_instance("bufferManager", 0, BufferManagerComponent::new(manager)).unwrap();
    let topology = b.build().unwrap();

    let held = get(&topology, bm, 16).unwrap();
    assert!(matches!(
        get(&topology, bm, 1),
        Err(PortError::Buffer(BufferError::OutOfBuffers {
            reason: Exhaustion::NoFreeSlot,
            ..
        }))
    ));
    assert!(matches!(
        get(&topology, bm, 17),
        Err(PortError::Buffer(BufferError::OutOfBuffers {
            reason: Exhaustion::NoBinLargeEnough,
            ..
        }))
    ));
    topology.invoke(bm, "bufferSendIn", 0, PortArgs::Buffer(held)).unwrap();
}

#[test]
fn test_foreign_buffer_is_refused() {
    let (ours, _) = manager(1, &[BinConfig::new(32, 2)]);
    let (theirs, _) = manager(2, &[BinConfig::new(32, 2)]);
    let stranger = theirs.allocate(8).unwrap();

    let mut b = TopologyBuilder::new();
    let bm = b.add_instance("bufferManager", 0, BufferManagerComponent::new(ours.clone())).unwrap();
    let topology = b.build().unwrap();

    let err = topology
        .invoke(bm, "bufferSendIn", 0, PortArgs::Buffer(stranger))
        .unwrap_err();
    assert!(matches!(
        err,
        PortError::Buffer(BufferError::ForeignDescriptor { manager: 1, owner: 2, .. })
    ));
    assert_eq!(ours.stats().foreign_returns, 1);
    assert_eq!(ours.stats().current_allocated, 0);
}

#[test]
fn test_topology_teardown_frees_region_once() {
    let (manager, allocator) = manager(3, &[BinConfig::new(100, 4), BinConfig::new(1000, 2)]);
    assert_eq!(allocator.allocation_count(), 1);
    assert_eq!(allocator.outstanding_bytes(), 2400);

    let mut b = TopologyBuilder::new();
    b.add_instance("bufferManager", 0, BufferManagerComponent::new(manager.clone())).unwrap();
    let mut topology = b.build().unwrap();
    topology.teardown();
    manager.teardown();
    drop(topology);
    drop(manager);

    assert_eq!(allocator.free_count(), 1);
    assert_eq!(allocator.outstanding_bytes(), 0);
}

#[test]
fn test_buffers_move_between_threads() {
    let (manager, _) = manager(9, &[BinConfig::new(64, 8)]);
    let (tx, rx) = crossbeam_channel::unbounded();
    let producer = {
        let manager = manager.clone();
        std::thread::spawn(move || {
            for i in 0..8u8 {
                let mut buffer = manager.allocate(1).unwrap();
                buffer.fill_from(&[i]).unwrap();
                tx.send(buffer).unwrap();
            }
        })
    };
    let mut seen = Vec::new();
    for buffer in rx.iter().take(8) {
        seen.push(buffer.as_slice()[0]);
        manager.deallocate(buffer).unwrap();
    }
    producer.join().unwrap();
    assert_eq!(seen, (0..8).collect::<Vec<_>>());
    assert_eq!(manager.stats().current_allocated, 0);
}
