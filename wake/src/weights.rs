// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use config::{DEFAULT_NF_SHARE, EPOCH, MAX_CORES};
use registry::NfStatus;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use steer::Ctx;
use tracing::debug;

/// Sink for computed scheduler shares; the OS knob lives behind it.
pub trait ShareSink: Send + Sync {
    fn set_share(&self, nf: registry::NfId, share: u64);
}

/// Discards shares; used when dynamic weighting is off or in tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl ShareSink for NullSink {
    fn set_share(&self, _nf: registry::NfId, _share: u64) {}
}

/// Writes shares to the group-scheduler knob under a cgroup root.
#[derive(Debug)]
pub struct CgroupSink {
    root: PathBuf,
}

impl CgroupSink {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl ShareSink for CgroupSink {
    fn set_share(&self, nf: registry::NfId, share: u64) {
        let path = self.root.join(format!("nf_{nf}")).join("cpu.weight");
        if let Err(e) = std::fs::write(&path, share.to_string()) {
            debug!("cannot push share for NF {nf} to {path:?}: {e}");
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct CoreDemand {
    total_cost: u64,
    total_load_cost: u64,
    nf_count: u64,
}

/// Compute and push per-NF scheduler shares.
///
/// Static mode apportions each core's shares by computation cost alone;
/// dynamic mode weighs cost by offered load so a busy NF outranks an
/// expensive idle one. Each NF on a core gets
/// `N × DEFAULT_SHARE × cost / Σ cost`, and its exec period is its cost
/// share of the scheduling epoch.
pub fn assign(ctx: &Ctx, sink: &dyn ShareSink) {
    let mut demand = [CoreDemand::default(); MAX_CORES];

    for slot in ctx.registry.slots() {
        if slot.status() != Some(NfStatus::Running) {
            continue;
        }
        let Some(info) = slot.info.load_full() else {
            continue;
        };
        let core = usize::from(info.core()).min(MAX_CORES - 1);
        let cost = slot.sched.comp_cost.load(Ordering::Relaxed);
        let load = slot.sched.load.load(Ordering::Relaxed);
        demand[core].total_cost += cost;
        demand[core].total_load_cost += cost.saturating_mul(load);
        demand[core].nf_count += 1;
    }

    let epoch_nanos = u64::try_from(EPOCH.as_nanos()).unwrap_or(u64::MAX);
    for slot in ctx.registry.slots() {
        if slot.status() != Some(NfStatus::Running) {
            continue;
        }
        let Some(info) = slot.info.load_full() else {
            continue;
        };
        let core = usize::from(info.core()).min(MAX_CORES - 1);
        let cost = slot.sched.comp_cost.load(Ordering::Relaxed);
        let load = slot.sched.load.load(Ordering::Relaxed);
        let demand = demand[core];

        let (weight, total) = if ctx.cfg.dynamic_weights {
            (cost.saturating_mul(load), demand.total_load_cost)
        } else {
            (cost, demand.total_cost)
        };
        let (share, exec_period) = if total == 0 {
            (DEFAULT_NF_SHARE, 0)
        } else {
            (
                demand.nf_count * DEFAULT_NF_SHARE * weight / total,
                weight.saturating_mul(epoch_nanos) / total,
            )
        };
        slot.sched.cpu_share.store(share, Ordering::Relaxed);
        slot.sched.exec_period.store(exec_period, Ordering::Relaxed);
        sink.set_share(slot.instance(), share);
    }
}
