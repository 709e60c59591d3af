// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::{InfoPool, NfId, NfInfo, NfSlot, NfStatus, ServiceId, WakeHandle};
use arc_swap::ArcSwap;
use config::{MAX_NFS, MAX_NFS_PER_SERVICE, MAX_SERVICES, high_watermark, low_watermark, names};
use parking_lot::Mutex;
use pkt::Frame;
use ring::{Params, Ring};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AdmitError {
    #[error("instance id {0} is already live")]
    IdConflict(u16),
    #[error("no instance ids available")]
    NoIds,
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Ring(#[from] ring::err::InvalidArgument),
    #[error(transparent)]
    Shm(#[from] shm::ShmError),
}

/// The NF descriptor table and service map.
pub struct Registry {
    slots: Vec<NfSlot>,
    services: Vec<ArcSwap<Vec<NfId>>>,
    /// Rolling id cursor; doubles as the admission lock, so admit/retire are
    /// serialised while resolution stays lock-free.
    cursor: Mutex<u16>,
    admitted: AtomicUsize,
    shm: Arc<shm::Shm>,
    nf_ring_size: usize,
}

impl Registry {
    #[must_use]
    pub fn new(shm: Arc<shm::Shm>, nf_ring_size: usize) -> Self {
        let slots = (0..MAX_NFS as u16)
            .map(|raw| NfSlot::new(NfId(raw)))
            .collect();
        let services = (0..MAX_SERVICES)
            .map(|_| ArcSwap::from_pointee(Vec::new()))
            .collect();
        Self {
            slots,
            services,
            cursor: Mutex::new(1),
            admitted: AtomicUsize::new(0),
            shm,
            nf_ring_size,
        }
    }

    #[must_use]
    pub fn slot(&self, id: NfId) -> &NfSlot {
        &self.slots[id.index()]
    }

    /// Slot holding the given raw instance id, if it is a valid id.
    #[must_use]
    pub fn slot_raw(&self, raw: u16) -> Option<&NfSlot> {
        NfId::new(raw).map(|id| self.slot(id))
    }

    /// All slots with valid ids (slot 0 excluded).
    pub fn slots(&self) -> impl Iterator<Item = &NfSlot> {
        self.slots.iter().skip(1)
    }

    /// NFs currently admitted (Starting or further along).
    #[must_use]
    pub fn admitted(&self) -> usize {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Current instance list for a service.
    #[must_use]
    pub fn service_instances(&self, service: ServiceId) -> Arc<Vec<NfId>> {
        self.services[service.index()].load_full()
    }

    /// Pick the instance serving `service` for a flow hash; `None` when the
    /// service has no instances. The caller still checks dispatchability.
    #[must_use]
    pub fn resolve(&self, service: ServiceId, flow_hash: u64) -> Option<NfId> {
        let instances = self.services[service.index()].load();
        if instances.is_empty() {
            return None;
        }
        let index = usize::try_from(flow_hash).unwrap_or(usize::MAX) % instances.len();
        instances.get(index).copied()
    }

    /// A slot is live while an NF anywhere between submission and shutdown
    /// resides in it.
    fn is_live(&self, id: NfId) -> bool {
        !matches!(
            self.slot(id).status(),
            None | Some(NfStatus::Stopped | NfStatus::IdConflict | NfStatus::NoIds)
        )
    }

    /// Next free id from the rolling cursor: scan at most `MAX_NFS` slots,
    /// skipping slot 0, first non-live slot wins.
    fn next_free_id(&self, cursor: &mut u16) -> Option<NfId> {
        for _ in 0..MAX_NFS {
            if *cursor == 0 || *cursor >= MAX_NFS as u16 {
                *cursor = 1;
            }
            let candidate = NfId(*cursor);
            *cursor += 1;
            if !self.is_live(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Admit a submitted NF: assign (or honour) its instance id and register
    /// it with its service. The status stays `WaitingForId` until the rings
    /// are provisioned; on failure the rejection status is stored in the info
    /// record for the NF to observe.
    ///
    /// # Errors
    ///
    /// `IdConflict` when the requested id is live, `NoIds` when the table or
    /// the service is saturated.
    pub fn admit(&self, info: &Arc<NfInfo>) -> Result<NfId, AdmitError> {
        let mut cursor = self.cursor.lock();

        let id = match info.instance_raw() {
            0 => self.next_free_id(&mut cursor).ok_or(AdmitError::NoIds),
            requested => match NfId::new(requested) {
                None => Err(AdmitError::NoIds),
                Some(id) if self.is_live(id) => Err(AdmitError::IdConflict(requested)),
                Some(id) => Ok(id),
            },
        };
        let id = match id {
            Ok(id) => id,
            Err(e) => {
                info.set_status(match e {
                    AdmitError::IdConflict(_) => NfStatus::IdConflict,
                    AdmitError::NoIds => NfStatus::NoIds,
                });
                return Err(e);
            }
        };

        let Some(service) = ServiceId::new(info.service_raw()) else {
            warn!("rejecting NF asking for out-of-range service {}", info.service_raw());
            info.set_status(NfStatus::NoIds);
            return Err(AdmitError::NoIds);
        };
        let instances = self.services[service.index()].load();
        if instances.len() >= MAX_NFS_PER_SERVICE {
            warn!("service {service} is saturated; rejecting NF");
            info.set_status(NfStatus::NoIds);
            return Err(AdmitError::NoIds);
        }
        let mut instances = (**instances).clone();
        instances.push(id);
        self.services[service.index()].store(Arc::new(instances));

        info.set_instance_raw(id.get());
        self.slot(id).info.store(Some(Arc::clone(info)));
        self.admitted.fetch_add(1, Ordering::Relaxed);
        info!("admitted NF instance {id} for service {service}");
        Ok(id)
    }

    /// Create and publish the per-NF rings and wake handle.
    ///
    /// # Errors
    ///
    /// Fails when a ring cannot be built or a shared name is already taken.
    pub fn provision(
        &self,
        id: NfId,
        wake: Arc<Box<dyn WakeHandle>>,
    ) -> Result<(), ProvisionError> {
        let rx = Arc::new(Ring::<Frame>::new(Params {
            name: names::nf_rx_ring(id.get()),
            size: self.nf_ring_size,
            watermarks: Some((
                high_watermark(self.nf_ring_size),
                low_watermark(self.nf_ring_size),
            )),
        })?);
        let tx = Arc::new(Ring::<Frame>::new(Params {
            name: names::nf_tx_ring(id.get()),
            size: self.nf_ring_size,
            watermarks: None,
        })?);
        self.shm.publish(&names::nf_rx_ring(id.get()), Arc::clone(&rx))?;
        self.shm.publish(&names::nf_tx_ring(id.get()), Arc::clone(&tx))?;
        self.shm.publish(&names::nf_wake(id.get()), Arc::clone(&wake))?;

        let slot = self.slot(id);
        slot.rx.store(Some(rx));
        slot.tx.store(Some(tx));
        slot.wake.store(Some(wake));
        Ok(())
    }

    /// Undo everything `admit`/`provision` did for an NF; the admission lock
    /// must be held. Returns the freed id, or `None` when the info is not the
    /// resident of its slot.
    fn unregister_locked(&self, info: &Arc<NfInfo>) -> Option<NfId> {
        let id = NfId::new(info.instance_raw())?;
        let slot = self.slot(id);
        let resident = slot.info.load();
        if !resident
            .as_ref()
            .is_some_and(|resident| Arc::ptr_eq(resident, info))
        {
            debug!("unregister for NF {id} does not match the resident info; ignoring");
            return None;
        }
        drop(resident);

        slot.clear();
        if let Some(service) = ServiceId::new(info.service_raw()) {
            // Left-shift compaction: order of the survivors is preserved.
            let instances: Vec<NfId> = self.services[service.index()]
                .load()
                .iter()
                .copied()
                .filter(|&instance| instance != id)
                .collect();
            self.services[service.index()].store(Arc::new(instances));
        }
        self.shm.retract(&names::nf_rx_ring(id.get()));
        self.shm.retract(&names::nf_tx_ring(id.get()));
        self.shm.retract(&names::nf_wake(id.get()));
        self.admitted.fetch_sub(1, Ordering::Relaxed);
        Some(id)
    }

    /// Reclaim a slot: clear it, compact the service map, retract the shared
    /// names, and hand the info record back to the pool.
    pub fn retire(&self, info: &Arc<NfInfo>, pool: &InfoPool) {
        let _cursor = self.cursor.lock();
        if let Some(id) = self.unregister_locked(info) {
            pool.put(Arc::clone(info));
            info!("retired NF instance {id}");
        }
    }

    /// Drain the submission queue: admit `WaitingForId` records, retire
    /// `Stopped` ones. New admissions get their channels from `wake_factory`.
    pub fn check_new_nfs(
        &self,
        queue: &Ring<Arc<NfInfo>>,
        pool: &InfoPool,
        wake_factory: &dyn Fn(NfId) -> Arc<Box<dyn WakeHandle>>,
    ) {
        let mut batch: arrayvec::ArrayVec<Arc<NfInfo>, { MAX_NFS }> = arrayvec::ArrayVec::new();
        loop {
            if queue.dequeue_burst(&mut batch, MAX_NFS) == 0 {
                break;
            }
            for submitted in batch.drain(..) {
                match submitted.status() {
                    NfStatus::WaitingForId => {
                        let Ok(id) = self.admit(&submitted) else {
                            // The rejection status is in the record; the NF
                            // returns it to the pool itself.
                            continue;
                        };
                        match self.provision(id, wake_factory(id)) {
                            // Rings exist; now the NF may proceed.
                            Ok(()) => submitted.set_status(NfStatus::Starting),
                            Err(e) => {
                                warn!("failed to provision NF {id}: {e}");
                                let _cursor = self.cursor.lock();
                                let _ = self.unregister_locked(&submitted);
                                drop(_cursor);
                                submitted.set_status(NfStatus::NoIds);
                            }
                        }
                    }
                    NfStatus::Stopped => self.retire(&submitted, pool),
                    status => warn!("ignoring NF submission in state {status:?}"),
                }
            }
        }
    }

    /// Probe every Running NF's process; reap the ones that are gone.
    /// Returns the number reaped.
    pub fn probe_liveness(&self, pool: &InfoPool, alive: &dyn Fn(i32) -> bool) -> usize {
        let mut reaped = 0;
        for slot in self.slots() {
            if slot.status() != Some(NfStatus::Running) {
                continue;
            }
            let Some(info) = slot.info.load_full() else {
                continue;
            };
            let pid = info.pid();
            if pid != 0 && !alive(pid) {
                warn!("NF instance {} (pid {pid}) is gone; reaping", slot.instance());
                info.set_status(NfStatus::Stopped);
                self.retire(&info, pool);
                reaped += 1;
            }
        }
        reaped
    }
}

/// Default liveness probe: signal 0 to the pid.
#[must_use]
pub fn process_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug)]
    struct NoopWake;
    impl WakeHandle for NoopWake {
        fn post(&self) {}
        fn wait(&self) {}
    }

    fn noop_wake(_: NfId) -> Arc<Box<dyn WakeHandle>> {
        Arc::new(Box::new(NoopWake))
    }

    fn registry() -> (Registry, InfoPool) {
        (Registry::new(shm::Shm::new(), 128), InfoPool::new(MAX_NFS))
    }

    fn submit(pool: &InfoPool, instance: u16, service: u16) -> Arc<NfInfo> {
        let info = pool.get().unwrap();
        info.set_instance_raw(instance);
        info.set_service_raw(service);
        info
    }

    #[test]
    fn admission_assigns_sequential_ids_and_registers_service() {
        let (reg, pool) = registry();
        let a = submit(&pool, 0, 1);
        let b = submit(&pool, 0, 1);
        assert_eq!(reg.admit(&a).unwrap().get(), 1);
        assert_eq!(reg.admit(&b).unwrap().get(), 2);
        // Starting is only signalled once the rings exist.
        assert_eq!(a.status(), NfStatus::WaitingForId);
        assert_eq!(a.instance_raw(), 1);

        let service = ServiceId::new(1).unwrap();
        let instances = reg.service_instances(service);
        assert_eq!(instances.len(), 2);
        assert_eq!(reg.admitted(), 2);
    }

    #[test]
    fn explicit_id_conflict_leaves_the_slot_untouched() {
        let (reg, pool) = registry();
        let holder = submit(&pool, 3, 1);
        reg.admit(&holder).unwrap();
        holder.set_status(NfStatus::Running);

        let pretender = submit(&pool, 3, 1);
        assert!(matches!(
            reg.admit(&pretender),
            Err(AdmitError::IdConflict(3))
        ));
        assert_eq!(pretender.status(), NfStatus::IdConflict);
        let slot = reg.slot(NfId::new(3).unwrap());
        assert!(slot
            .info
            .load()
            .as_ref()
            .is_some_and(|resident| Arc::ptr_eq(resident, &holder)));
    }

    #[test]
    fn table_saturation_yields_no_ids() {
        let (reg, pool) = registry();
        for _ in 1..MAX_NFS {
            let info = submit(&pool, 0, 1);
            // Spread across services to dodge the per-service cap.
            info.set_service_raw(u16::try_from(reg.admitted() % MAX_SERVICES).unwrap());
            reg.admit(&info).unwrap();
        }
        let overflow = submit(&pool, 0, 1);
        assert!(matches!(reg.admit(&overflow), Err(AdmitError::NoIds)));
        assert_eq!(overflow.status(), NfStatus::NoIds);
    }

    #[test]
    fn retirement_compacts_the_service_map_in_order() {
        let (reg, pool) = registry();
        let infos: Vec<_> = (0..3).map(|_| submit(&pool, 0, 2)).collect();
        for info in &infos {
            reg.admit(info).unwrap();
        }
        // Retire the middle instance (id 2).
        infos[1].set_status(NfStatus::Stopped);
        reg.retire(&infos[1], &pool);

        let service = ServiceId::new(2).unwrap();
        let instances = reg.service_instances(service);
        let raw: Vec<u16> = instances.iter().map(|id| id.get()).collect();
        assert_eq!(raw, vec![1, 3]);
        assert_eq!(reg.admitted(), 2);
    }

    #[test]
    fn cursor_reuses_retired_ids_after_wrapping() {
        let (reg, pool) = registry();
        let first = submit(&pool, 0, 1);
        reg.admit(&first).unwrap();
        first.set_status(NfStatus::Stopped);
        reg.retire(&first, &pool);

        // The cursor moved past 1, so the next allocation is 2, and slot 1
        // is only handed out again once the cursor wraps to it.
        let second = submit(&pool, 0, 1);
        assert_eq!(reg.admit(&second).unwrap().get(), 2);
    }

    #[test]
    fn resolve_hashes_across_instances_and_handles_empty() {
        let (reg, pool) = registry();
        let service = ServiceId::new(4).unwrap();
        assert_eq!(reg.resolve(service, 99), None);

        for _ in 0..2 {
            reg.admit(&submit(&pool, 0, 4)).unwrap();
        }
        let picks: Vec<u16> = (0..4_u64)
            .map(|hash| reg.resolve(service, hash).unwrap().get())
            .collect();
        assert_eq!(picks, vec![1, 2, 1, 2]);
    }

    #[test]
    fn check_new_nfs_admits_and_provisions_rings() {
        let (reg, pool) = registry();
        let queue: Ring<Arc<NfInfo>> = Ring::new(Params {
            name: "NF_INFO_QUEUE".to_string(),
            size: 32,
            watermarks: None,
        })
        .unwrap();
        let info = submit(&pool, 0, 1);
        queue.enqueue(Arc::clone(&info)).map_err(|_| ()).unwrap();

        reg.check_new_nfs(&queue, &pool, &noop_wake);
        assert_eq!(info.status(), NfStatus::Starting);
        let slot = reg.slot(NfId::new(1).unwrap());
        assert!(slot.rx.load().is_some());
        assert!(slot.tx.load().is_some());
        assert!(slot.wake.load().is_some());
    }

    #[test]
    fn liveness_probe_reaps_dead_pids() {
        let (reg, pool) = registry();
        let info = submit(&pool, 0, 1);
        let id = reg.admit(&info).unwrap();
        reg.provision(id, noop_wake(id)).unwrap();
        info.set_pid(424_242);
        info.set_status(NfStatus::Running);

        assert_eq!(reg.probe_liveness(&pool, &|_| false), 1);
        assert_eq!(reg.slot(id).status(), None);
        assert!(reg
            .service_instances(ServiceId::new(1).unwrap())
            .is_empty());
    }

    #[test]
    fn nonexistent_pid_probe_fails() {
        // Largest pid namespace value plus change; nothing should live there.
        assert!(!process_alive(i32::MAX - 1));
        assert!(process_alive(std::process::id().try_into().unwrap()));
    }
}
