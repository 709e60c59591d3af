// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::{NfId, NfInfo, NfStatus};
use arc_swap::ArcSwapOption;
use chain::FlowEntry;
use config::BFT_SIZE;
use parking_lot::Mutex;
use pkt::Frame;
use ring::Ring;
use stats::NfStats;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Manager-side wake primitive for one NF. Posting unparks the worker; the
/// worker-side wait lives with the IPC implementations.
pub trait WakeHandle: Send + Sync + std::fmt::Debug {
    fn post(&self);
    fn wait(&self);
}

/// Bottleneck-flow table: a bounded queue of `(flow, chain_index)` pairs this
/// NF marked, so clearing is a drain instead of a table scan.
#[derive(Debug, Default)]
pub struct Bft {
    entries: Mutex<VecDeque<(Arc<FlowEntry>, u8)>>,
}

impl Bft {
    /// Record a mark; false (and the mark is not recorded) when the table is
    /// at capacity.
    pub fn push(&self, entry: Arc<FlowEntry>, chain_index: u8) -> bool {
        let mut entries = self.entries.lock();
        if entries.len() >= BFT_SIZE {
            return false;
        }
        entries.push_back((entry, chain_index));
        true
    }

    /// Take every recorded mark.
    #[must_use]
    pub fn drain(&self) -> Vec<(Arc<FlowEntry>, u8)> {
        self.entries.lock().drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Scheduler-facing measurements for one NF, written by the load extractor.
#[derive(Debug, Default)]
pub struct SchedState {
    pub load: AtomicU64,
    pub avg_load: AtomicU64,
    pub svc_rate: AtomicU64,
    pub avg_svc: AtomicU64,
    pub comp_cost: AtomicU64,
    pub cpu_share: AtomicU64,
    pub exec_period: AtomicU64,
}

impl SchedState {
    pub fn clear(&self) {
        for field in [
            &self.load,
            &self.avg_load,
            &self.svc_rate,
            &self.avg_svc,
            &self.comp_cost,
            &self.cpu_share,
            &self.exec_period,
        ] {
            field.store(0, Ordering::Relaxed);
        }
    }
}

/// One descriptor slot of the fixed NF table.
#[derive(Debug)]
pub struct NfSlot {
    instance: NfId,
    pub info: ArcSwapOption<NfInfo>,
    pub rx: ArcSwapOption<Ring<Frame>>,
    pub tx: ArcSwapOption<Ring<Frame>>,
    pub wake: ArcSwapOption<Box<dyn WakeHandle>>,
    pub stats: NfStats,
    pub sched: SchedState,
    pub bft: Bft,
    /// Backpressure state machine: set while this NF is a marked bottleneck.
    pub is_bottleneck: AtomicBool,
    /// Set when a downstream bottleneck wants this NF kept off the CPU.
    pub throttle_this_upstream: AtomicBool,
}

impl NfSlot {
    #[must_use]
    pub fn new(instance: NfId) -> Self {
        Self {
            instance,
            info: ArcSwapOption::empty(),
            rx: ArcSwapOption::empty(),
            tx: ArcSwapOption::empty(),
            wake: ArcSwapOption::empty(),
            stats: NfStats::default(),
            sched: SchedState::default(),
            bft: Bft::default(),
            is_bottleneck: AtomicBool::new(false),
            throttle_this_upstream: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn instance(&self) -> NfId {
        self.instance
    }

    /// Status of the resident NF, if any.
    #[must_use]
    pub fn status(&self) -> Option<NfStatus> {
        self.info.load().as_ref().map(|info| info.status())
    }

    /// Frames may be steered here: the NF is Running and its RX ring exists.
    #[must_use]
    pub fn is_dispatchable(&self) -> bool {
        self.status() == Some(NfStatus::Running) && self.rx.load().is_some()
    }

    pub(crate) fn clear(&self) {
        self.info.store(None);
        self.rx.store(None);
        self.tx.store(None);
        self.wake.store(None);
        self.stats.clear();
        self.sched.clear();
        let _ = self.bft.drain();
        self.is_bottleneck.store(false, Ordering::Release);
        self.throttle_this_upstream.store(false, Ordering::Release);
    }
}
