// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::NfStatus;
use parking_lot::Mutex;
use stats::CostHistogram;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU16, AtomicU64, Ordering};

/// The record an NF shares with the manager.
///
/// Every field the two sides exchange is an indexed atomic; neither side ever
/// follows a pointer owned by the other. The NF writes its identity and
/// measurements, the manager writes the verdicts (assigned id, status).
#[derive(Debug, Default)]
pub struct NfInfo {
    instance: AtomicU16,
    service: AtomicU16,
    status: AtomicU8,
    pid: AtomicI32,
    core: AtomicU16,
    /// Set by the manager to ask the worker to park on its next empty poll.
    pub please_block: AtomicBool,
    /// Cycles-per-packet running estimate maintained by the worker.
    pub comp_cost: AtomicU64,
    /// Sampled cost histogram; the extractor prefers its median.
    pub cost_hist: CostHistogram,
    tag: Mutex<String>,
}

impl NfInfo {
    /// Requested or assigned instance id; 0 while unassigned.
    #[must_use]
    pub fn instance_raw(&self) -> u16 {
        self.instance.load(Ordering::Acquire)
    }

    pub fn set_instance_raw(&self, id: u16) {
        self.instance.store(id, Ordering::Release);
    }

    #[must_use]
    pub fn service_raw(&self) -> u16 {
        self.service.load(Ordering::Acquire)
    }

    pub fn set_service_raw(&self, service: u16) {
        self.service.store(service, Ordering::Release);
    }

    #[must_use]
    pub fn status(&self) -> NfStatus {
        NfStatus::from_wire(self.status.load(Ordering::Acquire)).unwrap_or(NfStatus::Stopped)
    }

    pub fn set_status(&self, status: NfStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn set_pid(&self, pid: i32) {
        self.pid.store(pid, Ordering::Release);
    }

    #[must_use]
    pub fn core(&self) -> u16 {
        self.core.load(Ordering::Relaxed)
    }

    pub fn set_core(&self, core: u16) {
        self.core.store(core, Ordering::Relaxed);
    }

    #[must_use]
    pub fn tag(&self) -> String {
        self.tag.lock().clone()
    }

    pub fn set_tag(&self, tag: &str) {
        *self.tag.lock() = tag.to_string();
    }

    /// Reset for reuse out of the pool.
    fn reset(&self) {
        self.instance.store(0, Ordering::Release);
        self.service.store(0, Ordering::Release);
        self.status
            .store(NfStatus::WaitingForId as u8, Ordering::Release);
        self.pid.store(0, Ordering::Release);
        self.core.store(0, Ordering::Relaxed);
        self.please_block.store(false, Ordering::Release);
        self.comp_cost.store(0, Ordering::Relaxed);
        self.cost_hist.clear();
        self.tag.lock().clear();
    }
}

/// Fixed pool of reusable info records, the `NF_INFO_MEMPOOL` counterpart.
#[derive(Debug)]
pub struct InfoPool {
    free: Mutex<Vec<Arc<NfInfo>>>,
}

impl InfoPool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let free = (0..capacity).map(|_| Arc::new(NfInfo::default())).collect();
        Self {
            free: Mutex::new(free),
        }
    }

    /// Take a fresh record in `WaitingForId` state; `None` when exhausted.
    #[must_use]
    pub fn get(&self) -> Option<Arc<NfInfo>> {
        let info = self.free.lock().pop()?;
        info.reset();
        Some(info)
    }

    pub fn put(&self, info: Arc<NfInfo>) {
        self.free.lock().push(info);
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}
