// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The wake-up scheduler.
//!
//! NFs using a blocking IPC primitive park when their RX ring drains and the
//! manager has set their please-block flag. Every wake tick this module
//! decides, per NF and in descending-load order within each core, whether to
//! signal it awake, leave it alone, or force it to stay parked because a
//! downstream bottleneck wants its upstreams throttled. Every few ticks it
//! re-extracts load and cost measurements and refreshes scheduler weights.

#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

pub mod ipc;
mod weights;

pub use weights::{CgroupSink, NullSink, ShareSink};

use arrayvec::ArrayVec;
use config::{BackpressureMode, EXTRACT_PERIOD_TICKS, MAX_CORES, MAX_NFS, WAKE_THRESHOLD, WAKE_TICK};
use registry::{NfStatus, ServiceId};
use stats::{Ewma, NfCounters};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use steer::Ctx;
use tracing::info;

/// Per-NF verdict of one wake pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Nothing,
    Wake,
    ForceBlock,
}

/// Periodic scheduler state. One instance, owned by the wake thread.
pub struct WakeScheduler {
    ctx: Arc<Ctx>,
    sink: Box<dyn ShareSink>,
    tick_count: u32,
    prev: Vec<NfCounters>,
    avg_load: Vec<Ewma>,
    avg_svc: Vec<Ewma>,
    /// Per-core NF ids, descending load, rebuilt at every extraction.
    priority: Vec<ArrayVec<registry::NfId, MAX_NFS>>,
    num_wakeups: u64,
}

impl WakeScheduler {
    #[must_use]
    pub fn new(ctx: Arc<Ctx>, sink: Box<dyn ShareSink>) -> Self {
        Self {
            ctx,
            sink,
            tick_count: 0,
            prev: (0..MAX_NFS).map(|_| NfCounters::default()).collect(),
            avg_load: vec![Ewma::default(); MAX_NFS],
            avg_svc: vec![Ewma::default(); MAX_NFS],
            priority: (0..MAX_CORES).map(|_| ArrayVec::new()).collect(),
            num_wakeups: 0,
        }
    }

    /// Total wake signals issued so far.
    #[must_use]
    pub fn num_wakeups(&self) -> u64 {
        self.num_wakeups
    }

    /// One wake tick: occasionally refresh measurements and weights, then
    /// run the wake pass.
    pub fn tick(&mut self) {
        self.tick_count = self.tick_count.wrapping_add(1);
        if self.tick_count % EXTRACT_PERIOD_TICKS == 0 {
            self.extract();
            weights::assign(&self.ctx, self.sink.as_ref());
            self.sort_priorities();
        }
        self.wake_pass();
    }

    /// Pull per-NF load and cost measurements out of the counters.
    fn extract(&mut self) {
        let registry = Arc::clone(&self.ctx.registry);
        for slot in registry.slots() {
            let index = slot.instance().index();
            let Some(info) = slot.info.load_full() else {
                self.prev[index] = NfCounters::default();
                continue;
            };
            if info.status() != NfStatus::Running {
                slot.sched.load.store(0, Ordering::Relaxed);
                slot.sched.svc_rate.store(0, Ordering::Relaxed);
                continue;
            }
            let now = slot.stats.snapshot();
            let delta = now.delta(&self.prev[index]);
            self.prev[index] = now;

            slot.sched.load.store(delta.offered_load(), Ordering::Relaxed);
            slot.sched
                .avg_load
                .store(self.avg_load[index].update(delta.offered_load()), Ordering::Relaxed);
            slot.sched.svc_rate.store(delta.tx, Ordering::Relaxed);
            slot.sched
                .avg_svc
                .store(self.avg_svc[index].update(delta.tx), Ordering::Relaxed);

            // Median of the sampled histogram; the worker's running estimate
            // is the fallback before enough samples land.
            let cost = info
                .cost_hist
                .median()
                .unwrap_or_else(|| info.comp_cost.load(Ordering::Relaxed));
            slot.sched.comp_cost.store(cost, Ordering::Relaxed);
        }
    }

    /// Rebuild the per-core priority lists, descending by load. A stable
    /// insertion keeps tied NFs in id order; the table is tiny.
    fn sort_priorities(&mut self) {
        let mut per_core: Vec<Vec<(registry::NfId, u64)>> =
            (0..MAX_CORES).map(|_| Vec::new()).collect();
        for slot in self.ctx.registry.slots() {
            if slot.status() != Some(NfStatus::Running) {
                continue;
            }
            let Some(info) = slot.info.load_full() else {
                continue;
            };
            let core = usize::from(info.core()).min(MAX_CORES - 1);
            let load = slot.sched.load.load(Ordering::Relaxed);
            let list = &mut per_core[core];
            let at = list
                .iter()
                .position(|&(_, other)| other < load)
                .unwrap_or(list.len());
            list.insert(at, (slot.instance(), load));
        }
        for (core, list) in per_core.into_iter().enumerate() {
            self.priority[core].clear();
            for (id, _) in list {
                let _ = self.priority[core].try_push(id);
            }
        }
    }

    fn verdict(&self, slot: &registry::NfSlot) -> Verdict {
        let Some(rx) = slot.rx.load_full() else {
            return Verdict::Nothing;
        };
        if self.ctx.cfg.backpressure == BackpressureMode::ScheduleThrottle {
            if slot.throttle_this_upstream.load(Ordering::Acquire) {
                return Verdict::ForceBlock;
            }
            if self.ctx.global_bp.active() {
                if let Some(info) = slot.info.load_full() {
                    if let Some(service) = ServiceId::new(info.service_raw()) {
                        if self.ctx.global_bp.names_upstream(service) {
                            return Verdict::ForceBlock;
                        }
                    }
                }
            }
        }
        if rx.count() >= WAKE_THRESHOLD {
            return Verdict::Wake;
        }
        Verdict::Nothing
    }

    fn wake_one(&mut self, id: registry::NfId) {
        let registry = Arc::clone(&self.ctx.registry);
        let slot = registry.slot(id);
        let Some(info) = slot.info.load_full() else {
            return;
        };
        match self.verdict(slot) {
            Verdict::Nothing => {}
            Verdict::Wake => {
                // Only signal a worker that actually parked.
                if info.please_block.swap(false, Ordering::AcqRel) {
                    if let Some(handle) = slot.wake.load_full() {
                        handle.post();
                        slot.stats.add(&slot.stats.wakeup_count, 1);
                        self.num_wakeups += 1;
                    }
                }
            }
            Verdict::ForceBlock => {
                info.please_block.store(true, Ordering::Release);
                slot.stats.add(&slot.stats.throttle_count, 1);
            }
        }
    }

    /// Signal parked NFs, higher-load first within each core.
    fn wake_pass(&mut self) {
        let mut any_sorted = false;
        for core in 0..MAX_CORES {
            if self.priority[core].is_empty() {
                continue;
            }
            any_sorted = true;
            let ids: ArrayVec<registry::NfId, MAX_NFS> = self.priority[core].clone();
            for id in ids {
                self.wake_one(id);
            }
        }
        if !any_sorted {
            // No extraction yet; sweep the table in slot order.
            let ids: Vec<registry::NfId> = self
                .ctx
                .registry
                .slots()
                .filter(|slot| slot.status() == Some(NfStatus::Running))
                .map(registry::NfSlot::instance)
                .collect();
            for id in ids {
                self.wake_one(id);
            }
        }
    }
}

/// Wake-thread entry: tick until the stop flag flips.
pub fn wake_loop(mut sched: WakeScheduler) {
    let stop = Arc::clone(&sched.ctx.stop);
    info!("wake scheduler running ({:?} tick)", WAKE_TICK);
    while !stop.load(Ordering::Acquire) {
        sched.tick();
        std::thread::sleep(WAKE_TICK);
    }
}

#[cfg(test)]
mod test;
