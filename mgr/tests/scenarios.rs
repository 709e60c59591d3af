// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! End-to-end scenarios: a full manager wired to in-process NF workers over
//! a queue-backed port driver.

#![allow(clippy::unwrap_used)]

use chain::{ChainEntry, FlowKey, ServiceChain};
use config::{BackpressureMode, EXTRACT_PERIOD_TICKS, FeatureConfig};
use parking_lot::Mutex;
use pkt::{Frame, NfAction};
use pretty_assertions::assert_eq;
use registry::{NfId, NfStatus, ServiceId, WakeHandle};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use steer::{Worker, rx_iteration, tx_iteration};
use steerd_mgr::drivers::QueueDriver;
use steerd_mgr::{BootParams, Manager, boot};
use wake::ipc::ParkWake;

fn hop(action: NfAction, destination: u16) -> ChainEntry {
    ChainEntry {
        action,
        destination,
    }
}

struct Bench {
    manager: Manager,
    driver: Arc<QueueDriver>,
}

fn bench(cfg: FeatureConfig, nf_ring_size: usize, default_chain: Vec<ChainEntry>) -> Bench {
    let mut manager = boot(BootParams {
        cfg,
        portmask: 0b1,
        default_chain,
        frame_pool_size: 4096,
        nf_ring_size,
    })
    .unwrap();
    manager.set_wake_factory(Box::new(|_| Arc::new(Box::new(ParkWake::default()))));
    let driver = Arc::new(QueueDriver::new(Arc::clone(&manager.ctx.pool)));
    Bench { manager, driver }
}

impl Bench {
    fn start_nf(
        &self,
        service: u16,
        instance: Option<u16>,
        tag: &str,
    ) -> Result<nf::NfHandle, nf::NfError> {
        let shm = Arc::clone(&self.manager.shm);
        let stop = Arc::clone(&self.manager.ctx.stop);
        let tag = tag.to_string();
        let worker = std::thread::spawn(move || {
            let args = nf::NfArgs {
                instance,
                service,
                tag,
                core: 0,
            };
            nf::start(&shm, &args, stop)
        });
        while !worker.is_finished() {
            self.manager.master_tick();
            std::thread::yield_now();
        }
        worker.join().unwrap()
    }

    fn inject_udp(&self, count: usize, dst_port: u16) {
        for _ in 0..count {
            let mut frame = self.manager.ctx.pool.take().unwrap();
            frame.set_payload(&udp_frame_bytes(dst_port));
            self.driver.inject(0, frame);
        }
    }

    fn slot_counters(&self, instance: u16) -> stats::NfCounters {
        self.manager
            .ctx
            .registry
            .slot_raw(instance)
            .unwrap()
            .stats
            .snapshot()
    }
}

fn udp_frame_bytes(dst_port: u16) -> Vec<u8> {
    let mut bytes = vec![
        2, 0, 0, 0, 0, 2, // dst mac
        2, 0, 0, 0, 0, 1, // src mac
        0x08, 0x00, // IPv4
        0x45, 0x00, 0x00, 0x1c, // ver/ihl, tos, total len
        0x00, 0x00, 0x00, 0x00, // id, flags
        0x40, 0x11, 0x00, 0x00, // ttl, proto UDP, csum
        10, 0, 0, 1, // src
        10, 0, 0, 2, // dst
    ];
    bytes.extend_from_slice(&4321_u16.to_be_bytes());
    bytes.extend_from_slice(&dst_port.to_be_bytes());
    bytes.extend_from_slice(&8_u16.to_be_bytes());
    bytes.extend_from_slice(&[0, 0]);
    bytes
}

fn verdict(action: NfAction, destination: u16) -> impl FnMut(&mut Frame) {
    move |frame: &mut Frame| {
        let mut meta = frame.meta();
        meta.action = action;
        meta.destination = destination;
        frame.set_meta(meta);
    }
}

/// S1: default chain delivers to the single NF, which drops everything.
#[test]
fn s1_single_nf_drops_the_batch() {
    let bench = bench(FeatureConfig::default(), 1024, vec![hop(NfAction::ToNf, 1)]);
    let ctx = &bench.manager.ctx;
    let mut nf1 = bench.start_nf(1, None, "sink").unwrap();

    bench.inject_udp(32, 7000);
    let mut rx_worker = Worker::new(0);
    rx_iteration(ctx, &mut rx_worker, bench.driver.as_ref());
    assert_eq!(bench.slot_counters(1).rx, 32);

    assert_eq!(nf1.poll_once(&mut verdict(NfAction::Drop, 0)), 32);
    let mut tx_worker = Worker::new(0);
    tx_iteration(ctx, &mut tx_worker, bench.driver.as_ref(), 1, 16);

    let counters = bench.slot_counters(1);
    assert_eq!(counters.act_drop, 32);
    assert_eq!(counters.tx, 32);
    assert_eq!(bench.driver.transmitted(0), 0);
    assert_eq!(ctx.pool.outstanding(), 0, "pool back to baseline");
}

/// S2: a two-NF chain ending at a port; every frame visits both NFs and
/// egresses.
#[test]
fn s2_two_nf_chain_egresses_out_the_port() {
    let bench = bench(
        FeatureConfig::default(),
        1024,
        vec![
            hop(NfAction::ToNf, 1),
            hop(NfAction::ToNf, 2),
            hop(NfAction::Out, 0),
        ],
    );
    let ctx = &bench.manager.ctx;
    let mut nf1 = bench.start_nf(1, None, "first").unwrap();
    let mut nf2 = bench.start_nf(2, None, "second").unwrap();

    bench.inject_udp(64, 7001);
    let mut rx_worker = Worker::new(0);
    let mut tx_worker = Worker::new(0);
    for _ in 0..8 {
        rx_iteration(ctx, &mut rx_worker, bench.driver.as_ref());
        nf1.poll_once(&mut verdict(NfAction::Next, 0));
        tx_iteration(ctx, &mut tx_worker, bench.driver.as_ref(), 1, 16);
        nf2.poll_once(&mut verdict(NfAction::Next, 0));
        tx_iteration(ctx, &mut tx_worker, bench.driver.as_ref(), 1, 16);
    }

    assert_eq!(bench.slot_counters(1).act_next, 64);
    assert_eq!(bench.slot_counters(2).act_out, 64);
    assert_eq!(bench.driver.transmitted(0), 64);
    let port_stats = ctx.ports.stats(0).unwrap();
    assert_eq!(port_stats.tx.load(Ordering::Relaxed), 64);
    assert_eq!(ctx.pool.outstanding(), 0);
}

/// S3: a stalled downstream NF crosses its high watermark, marks the chain,
/// and upstream frames start dropping; draining below the low watermark
/// clears the mark within one scan.
#[test]
fn s3_backpressure_marks_then_clears_with_hysteresis() {
    let cfg = FeatureConfig {
        backpressure: BackpressureMode::DropUpstream,
        ..FeatureConfig::default()
    };
    // Ring of 128: high water 96, low water 64.
    let bench = bench(cfg, 128, vec![hop(NfAction::ToNf, 1)]);
    let ctx = &bench.manager.ctx;
    let mut nf1 = bench.start_nf(1, None, "first").unwrap();
    let mut nf2 = bench.start_nf(2, None, "stalled").unwrap();

    let chain = Arc::new(
        ServiceChain::new([hop(NfAction::ToNf, 1), hop(NfAction::ToNf, 2)]).unwrap(),
    );
    let key = FlowKey::parse(&udp_frame_bytes(7002)).unwrap();
    let entry = ctx.flows.insert(key, Arc::clone(&chain));

    let mut rx_worker = Worker::new(0);
    let mut tx_worker = Worker::new(0);
    // 1024 frames while NF2 never polls.
    for _ in 0..32 {
        bench.inject_udp(32, 7002);
        rx_iteration(ctx, &mut rx_worker, bench.driver.as_ref());
        nf1.poll_once(&mut verdict(NfAction::Next, 0));
        tx_iteration(ctx, &mut tx_worker, bench.driver.as_ref(), 1, 16);
    }

    assert_eq!(chain.bottleneck_mask() & 0b100, 0b100, "chain bit 2 set");
    let marked = bench.slot_counters(1).bkpr_drop;
    assert!(marked >= 1, "upstream drops counted against NF1");
    assert_eq!(entry.marked_by(), Some(2));
    assert!(nf2.rx_backlog() >= 96, "NF2 reached its high watermark");

    // Resume NF2 until its ring is under the low watermark, then one TX
    // scan clears the mark.
    while nf2.rx_backlog() >= 64 {
        nf2.poll_once(&mut verdict(NfAction::Drop, 0));
    }
    tx_iteration(ctx, &mut tx_worker, bench.driver.as_ref(), 1, 16);

    assert_eq!(chain.bottleneck_mask(), 0, "mark cleared after drain");
    let slot2 = ctx.registry.slot_raw(2).unwrap();
    assert!(slot2.bft.is_empty());
    assert!(!slot2.is_bottleneck.load(Ordering::Acquire));

    // With the bottleneck gone the drop counter stops moving.
    let settled = bench.slot_counters(1).bkpr_drop;
    bench.inject_udp(32, 7002);
    rx_iteration(ctx, &mut rx_worker, bench.driver.as_ref());
    nf1.poll_once(&mut verdict(NfAction::Next, 0));
    tx_iteration(ctx, &mut tx_worker, bench.driver.as_ref(), 1, 16);
    nf2.poll_once(&mut verdict(NfAction::Drop, 0));
    assert_eq!(bench.slot_counters(1).bkpr_drop, settled);
}

/// S4: a crashed NF is reaped within one master tick and its service stops
/// resolving.
#[test]
fn s4_crashed_nf_is_reaped_and_traffic_drops() {
    let bench = bench(FeatureConfig::default(), 1024, vec![hop(NfAction::ToNf, 1)]);
    let ctx = &bench.manager.ctx;
    let nf1 = bench.start_nf(1, None, "doomed").unwrap();

    // Simulate the crash: the recorded pid no longer exists.
    nf1.info.set_pid(i32::MAX - 1);
    bench.manager.master_tick();

    assert_eq!(ctx.registry.admitted(), 0);
    assert!(ctx.registry.slot_raw(1).unwrap().info.load().is_none());
    assert!(
        ctx.registry
            .service_instances(ServiceId::new(1).unwrap())
            .is_empty()
    );

    // Subsequent traffic to service 1 is dropped wholesale.
    bench.inject_udp(32, 7003);
    let mut rx_worker = Worker::new(0);
    rx_iteration(ctx, &mut rx_worker, bench.driver.as_ref());
    assert_eq!(ctx.pool.outstanding(), 0);
}

/// S5: claiming a live instance id is rejected with the conflict exit code
/// and the holder keeps its slot.
#[test]
fn s5_duplicate_id_is_rejected_with_code_5() {
    let bench = bench(FeatureConfig::default(), 1024, vec![hop(NfAction::ToNf, 1)]);
    let holder = bench.start_nf(1, Some(3), "holder").unwrap();
    assert_eq!(holder.info.instance_raw(), 3);

    let err = bench.start_nf(1, Some(3), "pretender").unwrap_err();
    assert!(matches!(err, nf::NfError::IdConflict));
    assert_eq!(err.exit_code(), 5);

    let slot = bench.manager.ctx.registry.slot_raw(3).unwrap();
    let resident = slot.info.load_full().unwrap();
    assert!(Arc::ptr_eq(&resident, &holder.info), "slot 3 untouched");
    assert_eq!(resident.status(), NfStatus::Running);
}

/// A port that refuses part of a burst: the refused tail is dropped and
/// counted against both the port and the emitting NF.
#[test]
fn partial_transmit_drops_the_refused_tail() {
    let bench = bench(FeatureConfig::default(), 1024, vec![hop(NfAction::ToNf, 1)]);
    let ctx = &bench.manager.ctx;
    let mut nf1 = bench.start_nf(1, None, "emitter").unwrap();
    *bench.driver.tx_refusal.lock() = 8;

    bench.inject_udp(32, 7004);
    let mut rx_worker = Worker::new(0);
    let mut tx_worker = Worker::new(0);
    rx_iteration(ctx, &mut rx_worker, bench.driver.as_ref());
    nf1.poll_once(&mut verdict(NfAction::Out, 0));
    tx_iteration(ctx, &mut tx_worker, bench.driver.as_ref(), 1, 16);

    let port_stats = ctx.ports.stats(0).unwrap();
    assert_eq!(port_stats.tx.load(Ordering::Relaxed), 24);
    assert_eq!(port_stats.tx_drop.load(Ordering::Relaxed), 8);
    assert_eq!(bench.slot_counters(1).tx_drop, 8);
    assert_eq!(ctx.pool.outstanding(), 0);
}

/// S6: with both NFs parked on one core, a single wake tick signals the
/// higher-load NF first and clears both park flags.
#[test]
fn s6_wake_tick_prioritises_by_load() {
    #[derive(Debug)]
    struct RecordingWake {
        instance: u16,
        order: Arc<Mutex<Vec<u16>>>,
        inner: ParkWake,
    }
    impl WakeHandle for RecordingWake {
        fn post(&self) {
            self.order.lock().push(self.instance);
            self.inner.post();
        }
        fn wait(&self) {
            self.inner.wait();
        }
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut manager = boot(BootParams {
        cfg: FeatureConfig::default(),
        portmask: 0b1,
        default_chain: vec![hop(NfAction::ToNf, 1)],
        frame_pool_size: 256,
        nf_ring_size: 128,
    })
    .unwrap();
    let order_for_factory = Arc::clone(&order);
    manager.set_wake_factory(Box::new(move |id: NfId| {
        Arc::new(Box::new(RecordingWake {
            instance: id.get(),
            order: Arc::clone(&order_for_factory),
            inner: ParkWake::default(),
        }))
    }));
    let driver = Arc::new(QueueDriver::new(Arc::clone(&manager.ctx.pool)));
    let bench = Bench { manager, driver };

    // B admitted first so wake order cannot be admission order.
    let nf_b = bench.start_nf(1, None, "light").unwrap();
    let nf_a = bench.start_nf(2, None, "heavy").unwrap();
    let ctx = &bench.manager.ctx;
    let (a, b) = (nf_a.info.instance_raw(), nf_b.info.instance_raw());

    let slot_a = ctx.registry.slot_raw(a).unwrap();
    let slot_b = ctx.registry.slot_raw(b).unwrap();
    slot_a.stats.add(&slot_a.stats.rx, 1000);
    slot_b.stats.add(&slot_b.stats.rx, 10);

    let mut sched = wake::WakeScheduler::new(Arc::clone(ctx), Box::new(wake::NullSink));
    for _ in 0..EXTRACT_PERIOD_TICKS - 1 {
        sched.tick();
    }
    for slot in [slot_a, slot_b] {
        let frame = ctx.pool.take().unwrap();
        slot.rx.load_full().unwrap().enqueue(frame).map_err(|_| ()).unwrap();
        let info = slot.info.load_full().unwrap();
        info.please_block.store(true, Ordering::Release);
    }
    sched.tick();

    assert_eq!(order.lock().as_slice(), &[a, b], "heavy NF signalled first");
    assert_eq!(bench.slot_counters(a).wakeup_count, 1);
    assert_eq!(bench.slot_counters(b).wakeup_count, 1);
    for slot in [slot_a, slot_b] {
        let info = slot.info.load_full().unwrap();
        assert!(!info.please_block.load(Ordering::Acquire));
    }
}
