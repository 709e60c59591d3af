// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![allow(clippy::unwrap_used)]

use crate::ipc::ParkWake;
use crate::{NullSink, WakeScheduler, weights};
use chain::{ChainEntry, ServiceChain};
use config::{BackpressureMode, DEFAULT_NF_SHARE, EXTRACT_PERIOD_TICKS, FeatureConfig};
use parking_lot::Mutex;
use pkt::{FramePool, NfAction};
use pretty_assertions::assert_eq;
use registry::{InfoPool, NfId, NfStatus, Registry, WakeHandle};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use steer::Ctx;
use steer::backpressure::GlobalBackpressure;
use steer::ports::Ports;

/// Park-style handle that records the order it is posted in.
#[derive(Debug)]
struct RecordingWake {
    instance: u16,
    order: Arc<Mutex<Vec<u16>>>,
}

impl WakeHandle for RecordingWake {
    fn post(&self) {
        self.order.lock().push(self.instance);
    }
    fn wait(&self) {}
}

fn ctx_with(cfg: FeatureConfig) -> (Arc<Ctx>, InfoPool) {
    let ctx = Ctx {
        cfg,
        pool: Arc::new(FramePool::new("pool", 256)),
        registry: Arc::new(Registry::new(shm::Shm::new(), 128)),
        flows: Arc::new(chain::FlowTable::new()),
        default_chain: Arc::new(
            ServiceChain::new([ChainEntry {
                action: NfAction::ToNf,
                destination: 1,
            }])
            .unwrap(),
        ),
        ports: Ports::from_mask(0),
        global_bp: GlobalBackpressure::default(),
        stop: Arc::new(AtomicBool::new(false)),
    };
    (Arc::new(ctx), InfoPool::new(16))
}

fn running_nf(
    ctx: &Ctx,
    pool: &InfoPool,
    service: u16,
    handle: Arc<Box<dyn WakeHandle>>,
) -> NfId {
    let info = pool.get().unwrap();
    info.set_service_raw(service);
    let id = ctx.registry.admit(&info).unwrap();
    ctx.registry.provision(id, handle).unwrap();
    info.set_status(NfStatus::Running);
    id
}

fn seed_rx_ring(ctx: &Ctx, id: NfId) {
    let frame = ctx.pool.take().unwrap();
    let rx = ctx.registry.slot(id).rx.load_full().unwrap();
    rx.enqueue(frame).map_err(|_| ()).unwrap();
}

#[test]
fn higher_load_nf_is_signalled_first() {
    let (ctx, pool) = ctx_with(FeatureConfig::default());
    let order = Arc::new(Mutex::new(Vec::new()));

    let handle = |instance| -> Arc<Box<dyn WakeHandle>> {
        Arc::new(Box::new(RecordingWake {
            instance,
            order: Arc::clone(&order),
        }))
    };
    // B admitted first so priority order cannot be admission order.
    let b = running_nf(&ctx, &pool, 1, handle(1));
    let a = running_nf(&ctx, &pool, 2, handle(2));

    let slot_a = ctx.registry.slot(a);
    let slot_b = ctx.registry.slot(b);
    slot_a.stats.add(&slot_a.stats.rx, 1000);
    slot_b.stats.add(&slot_b.stats.rx, 10);

    // Idle ticks up to just before the extraction tick, then park both NFs
    // with frames pending and let the single extraction tick wake them.
    let mut sched = WakeScheduler::new(Arc::clone(&ctx), Box::new(NullSink));
    for _ in 0..EXTRACT_PERIOD_TICKS - 1 {
        sched.tick();
    }
    seed_rx_ring(&ctx, a);
    seed_rx_ring(&ctx, b);
    for slot in [slot_a, slot_b] {
        let info = slot.info.load_full().unwrap();
        info.please_block.store(true, Ordering::Release);
    }
    sched.tick();

    assert_eq!(order.lock().as_slice(), &[a.get(), b.get()]);
    assert_eq!(sched.num_wakeups(), 2);
    for slot in [ctx.registry.slot(a), ctx.registry.slot(b)] {
        let info = slot.info.load_full().unwrap();
        assert!(!info.please_block.load(Ordering::Acquire));
        assert_eq!(slot.stats.snapshot().wakeup_count, 1);
    }
}

#[test]
fn throttled_nf_is_forced_to_park_not_woken() {
    let cfg = FeatureConfig {
        backpressure: BackpressureMode::ScheduleThrottle,
        ..FeatureConfig::default()
    };
    let (ctx, pool) = ctx_with(cfg);
    let order = Arc::new(Mutex::new(Vec::new()));
    let id = running_nf(
        &ctx,
        &pool,
        1,
        Arc::new(Box::new(RecordingWake {
            instance: 1,
            order: Arc::clone(&order),
        })),
    );
    seed_rx_ring(&ctx, id);
    let slot = ctx.registry.slot(id);
    slot.throttle_this_upstream.store(true, Ordering::Release);

    let mut sched = WakeScheduler::new(Arc::clone(&ctx), Box::new(NullSink));
    sched.tick();

    let info = slot.info.load_full().unwrap();
    assert!(info.please_block.load(Ordering::Acquire), "forced block");
    assert!(order.lock().is_empty(), "no wake while throttled");
    assert_eq!(slot.stats.snapshot().throttle_count, 1);

    // Throttle lifts, ring still has frames: next tick wakes it.
    slot.throttle_this_upstream.store(false, Ordering::Release);
    sched.tick();
    assert_eq!(order.lock().as_slice(), &[1]);
    assert!(!info.please_block.load(Ordering::Acquire));
}

#[test]
fn static_weights_split_the_core_by_cost() {
    let (ctx, pool) = ctx_with(FeatureConfig::default());
    let noop = |instance| -> Arc<Box<dyn WakeHandle>> {
        Arc::new(Box::new(RecordingWake {
            instance,
            order: Arc::new(Mutex::new(Vec::new())),
        }))
    };
    let a = running_nf(&ctx, &pool, 1, noop(1));
    let b = running_nf(&ctx, &pool, 2, noop(2));
    ctx.registry
        .slot(a)
        .sched
        .comp_cost
        .store(100, Ordering::Relaxed);
    ctx.registry
        .slot(b)
        .sched
        .comp_cost
        .store(300, Ordering::Relaxed);

    weights::assign(&ctx, &NullSink);

    let share_a = ctx.registry.slot(a).sched.cpu_share.load(Ordering::Relaxed);
    let share_b = ctx.registry.slot(b).sched.cpu_share.load(Ordering::Relaxed);
    assert_eq!(share_a, 2 * DEFAULT_NF_SHARE * 100 / 400);
    assert_eq!(share_b, 2 * DEFAULT_NF_SHARE * 300 / 400);
    assert!(share_b > share_a);
}

#[test]
fn park_wake_round_trip_across_threads() {
    let handle = Arc::new(ParkWake::default());
    let waiter = Arc::clone(&handle);
    let joined = std::thread::spawn(move || {
        waiter.wait();
        true
    });
    // Give the waiter a moment to park, then post.
    std::thread::sleep(std::time::Duration::from_millis(20));
    handle.post();
    assert!(joined.join().unwrap());
}
