mod common;

use common::{wait_for, Journal, Probe};
use fswrt::buffer::BackingAllocator;
use fswrt::framing::{packet, FprimeFraming, PacketType};
use fswrt::port::PortType;
use fswrt::svc::cmd_dispatcher::command_packet;
use fswrt::svc::framer::DeframerStats;
use fswrt::svc::{BufferManagerComponent, Deframer, Framer};
use fswrt::*;
use std::sync::Arc;
use std::time::Duration;

const MAX_PAYLOAD: usize = 1024;
const DEFRAMER_BASE: u32 = 0x4200;

struct Bench {
    topology: Topology,
    deframer: InstanceId,
    manager: Arc<BufferManager>,
    commands: Journal,
    files: Journal,
    events: Journal,
}

fn pool() -> Arc<BufferManager> {
    let backing: Arc<dyn BackingAllocator> = Arc::new(HeapAllocator::new());
    Arc::new(BufferManager::setup(5, backing, &[BinConfig::new(2048, 8)]).unwrap())
}

fn buffer_sink(name: &'static str) -> (Probe, Journal) {
    Probe::new(
        ComponentKind::Passive,
        vec![PortSpec::input(name, PortType::Buffer, InvocationMode::Guarded)],
    )
}

fn deframer_bench() -> Bench {
    let manager = pool();
    let mut b = TopologyBuilder::new();
    let bm = b
        .add_instance("bufferManager", 0, BufferManagerComponent::new(manager.clone()))
        .unwrap();
    let deframer = b
        .add_instance_with_queue(
            "deframer",
            DEFRAMER_BASE,
            Deframer::new(Box::new(FprimeFraming::new(MAX_PAYLOAD))),
            QueueConfig::with_depth(8),
        )
        .unwrap();
    let (cmd, commands) = buffer_sink("cmdIn");
    let cmd = b.add_instance("cmd", 0, cmd).unwrap();
    let (file, files) = buffer_sink("fileIn");
    let file = b.add_instance("file", 0, file).unwrap();
    let (log, events) = Probe::new(
        ComponentKind::Passive,
        vec![PortSpec::input("logIn", PortType::Log, InvocationMode::Guarded)],
    );
    let log = b.add_instance("log", 0, log).unwrap();

    b.wire((deframer, "bufferGetOut", 0), (bm, "bufferGetCallee", 0)).unwrap();
    b.wire((deframer, "bufferReturnOut", 0), (bm, "bufferSendIn", 0)).unwrap();
    b.wire((deframer, "comOut", 0), (cmd, "cmdIn", 0)).unwrap();
    b.wire((deframer, "fileOut", 0), (file, "fileIn", 0)).unwrap();
    b.wire((deframer, "Log", 0), (log, "logIn", 0)).unwrap();
    let mut topology = b.build().unwrap();
    topology.start().unwrap();
    Bench {
        topology,
        deframer,
        manager,
        commands,
        files,
        events,
    }
}

impl Bench {
    fn feed(&self, bytes: &[u8]) {
        let mut raw = self.manager.allocate(bytes.len()).unwrap();
        raw.fill_from(bytes).unwrap();
        self.topology
            .invoke(self.deframer, "framedIn", 0, PortArgs::Buffer(raw))
            .unwrap();
    }

    fn payloads(journal: &Journal) -> Vec<Vec<u8>> {
        journal
            .lock()
            .iter()
            .filter_map(|r| match &r.args {
                PortArgs::Buffer(buffer) => Some(buffer.as_slice().to_vec()),
                _ => None,
            })
            .collect()
    }

    fn stats(&self) -> DeframerStats {
        self.topology
            .with_component(self.deframer, |d: &mut Deframer| d.stats())
            .unwrap()
    }

    fn event_ids(&self) -> Vec<u32> {
        self.events
            .lock()
            .iter()
            .filter_map(|r| match &r.args {
                PortArgs::Log(record) => Some(record.id),
                _ => None,
            })
            .collect()
    }
}

fn frame(payload: &[u8]) -> Vec<u8> {
    FprimeFraming::new(MAX_PAYLOAD).frame_to_vec(payload).unwrap()
}

#[test]
fn test_corrupted_middle_frame_is_skipped() {
    let bench = deframer_bench();
    let packets: Vec<Vec<u8>> = (1..=3).map(|i| command_packet(0x1000 + i, &[i as u8; 6])).collect();
    let frames: Vec<Vec<u8>> = packets.iter().map(|p| frame(p)).collect();
    let mut corrupted = frames[1].clone();
    corrupted[10] ^= 0x01;

    let mut stream = frames[0].clone();
    stream.extend_from_slice(&corrupted);
    stream.extend_from_slice(&frames[2]);
    bench.feed(&stream);

    assert!(wait_for(Duration::from_secs(2), || bench.commands.lock().len() == 2));
    assert!(wait_for(Duration::from_secs(2), || bench.stats().discarded_bytes > 0));
    assert_eq!(
        Bench::payloads(&bench.commands),
        vec![packets[0].clone(), packets[2].clone()]
    );
    let stats = bench.stats();
    assert_eq!(stats.frames, 2);
    assert_eq!(stats.commands, 2);
    assert_eq!(stats.discarded_bytes, corrupted.len() as u64);
    assert_eq!(
        bench.event_ids(),
        vec![DEFRAMER_BASE + Deframer::EVENT_DISCARDED]
    );
}

#[test]
fn test_frame_split_across_reads() {
    let bench = deframer_bench();
    let payload = command_packet(0x1000, b"split");
    let bytes = frame(&payload);
    let (head, tail) = bytes.split_at(7);
    bench.feed(head);
    assert!(wait_for(Duration::from_secs(2), || {
        bench.topology.with_component(bench.deframer, |d: &mut Deframer| d.pending_bytes()) == Some(7)
    }));
    assert!(bench.commands.lock().is_empty());

    bench.feed(tail);
    assert!(wait_for(Duration::from_secs(2), || bench.commands.lock().len() == 1));
    assert_eq!(Bench::payloads(&bench.commands), vec![payload]);
}

#[test]
fn test_packets_routed_by_type() {
    let bench = deframer_bench();
    let file = packet(PacketType::File, b"chunk");
    let telemetry = packet(PacketType::Telemetry, b"not for us");
    let mut stream = frame(&file);
    stream.extend_from_slice(&frame(&telemetry));
    bench.feed(&stream);

    assert!(wait_for(Duration::from_secs(2), || bench.stats().frames == 2));
    assert_eq!(Bench::payloads(&bench.files), vec![file]);
    assert!(bench.commands.lock().is_empty());
    let stats = bench.stats();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.unknown_packets, 1);
    assert_eq!(
        bench.event_ids(),
        vec![DEFRAMER_BASE + Deframer::EVENT_UNKNOWN_PACKET]
    );
}

#[test]
fn test_raw_buffers_go_back_to_pool() {
    let bench = deframer_bench();
    bench.feed(&frame(&command_packet(0x1000, &[])));
    assert!(wait_for(Duration::from_secs(2), || bench.commands.lock().len() == 1));
    // Only the routed packet is still out.
    assert_eq!(bench.manager.stats().current_allocated, 1);
}

/// Framer fed by a forwarding probe, since its data input is mandatory.
fn framer_bench(max_payload: usize) -> (Topology, InstanceId, Arc<BufferManager>, Journal) {
    let manager = pool();
    let mut b = TopologyBuilder::new();
    let bm = b
        .add_instance("bufferManager", 0, BufferManagerComponent::new(manager.clone()))
        .unwrap();
    let framer = b
        .add_instance("framer", 0, Framer::new(Box::new(FprimeFraming::new(max_payload))))
        .unwrap();
    let (source, _) = Probe::new(
        ComponentKind::Passive,
        vec![
            PortSpec::input("dataIn", PortType::Buffer, InvocationMode::Guarded),
            PortSpec::output("dataOut", PortType::Buffer),
        ],
    );
    let source = b.add_instance("source", 0, source.forwarding(0, 1)).unwrap();
    let (link, sent) = buffer_sink("comDataIn");
    let link = b.add_instance("link", 0, link).unwrap();
    b.wire((source, "dataOut", 0), (framer, "comIn", 0)).unwrap();
    b.wire((framer, "bufferGetOut", 0), (bm, "bufferGetCallee", 0)).unwrap();
    b.wire((framer, "dataReturnOut", 0), (bm, "bufferSendIn", 0)).unwrap();
    b.wire((framer, "framedOut", 0), (link, "comDataIn", 0)).unwrap();
    (b.build().unwrap(), source, manager, sent)
}

#[test]
fn test_framer_frames_into_pooled_buffer() {
    let (topology, source, manager, sent) = framer_bench(MAX_PAYLOAD);
    let payload = packet(PacketType::Log, b"{\"id\":1}");
    let mut data = manager.allocate(payload.len()).unwrap();
    data.fill_from(&payload).unwrap();
    topology.invoke(source, "dataIn", 0, PortArgs::Buffer(data)).unwrap();

    assert_eq!(Bench::payloads(&sent), vec![frame(&payload)]);
    // The source went back; only the frame held by the link is out.
    assert_eq!(manager.stats().current_allocated, 1);
}

#[test]
fn test_framer_returns_source_when_oversize() {
    let (topology, source, manager, sent) = framer_bench(16);
    let mut data = manager.allocate(64).unwrap();
    data.fill_from(&[7; 64]).unwrap();
    assert!(topology.invoke(source, "dataIn", 0, PortArgs::Buffer(data)).is_err());
    assert!(sent.lock().is_empty());
    assert_eq!(manager.stats().current_allocated, 0);
}
