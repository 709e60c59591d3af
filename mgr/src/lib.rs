// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Manager assembly: shared-object boot, the master loop, and worker
//! spawning for the `steerd` binary.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

pub mod args;
pub mod drivers;

use chain::{ChainEntry, ChainError, FlowTable, ServiceChain};
use config::{FeatureConfig, NF_QUEUE_SIZE, names};
use pkt::FramePool;
use registry::{InfoPool, NfId, NfInfo, NfStatus, Registry, WakeHandle, process_alive};
use ring::{Params, Ring};
use stats::{NfRow, PortRow};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use steer::backpressure::GlobalBackpressure;
use steer::ports::Ports;
use steer::Ctx;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error(transparent)]
    Shm(#[from] shm::ShmError),
    #[error(transparent)]
    Ring(#[from] ring::err::InvalidArgument),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("need at least {need} CPUs for {rx} RX + {tx} TX workers, have {have}")]
    NotEnoughCpus {
        need: usize,
        have: usize,
        rx: usize,
        tx: usize,
    },
    #[error("cannot spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("cannot install the stop handler: {0}")]
    StopHandler(#[from] ctrlc::Error),
}

/// Builder of per-NF wake handles, invoked at provisioning time.
pub type WakeFactory = Box<dyn Fn(NfId) -> Arc<Box<dyn WakeHandle>> + Send + Sync>;

/// Everything the manager owns, wired together at boot.
pub struct Manager {
    pub shm: Arc<shm::Shm>,
    pub ctx: Arc<Ctx>,
    pub info_pool: Arc<InfoPool>,
    pub queue: Arc<Ring<Arc<NfInfo>>>,
    wake_factory: WakeFactory,
}

/// Dimensioning knobs that differ between production and the test bench.
pub struct BootParams {
    pub cfg: FeatureConfig,
    pub portmask: u32,
    pub default_chain: Vec<ChainEntry>,
    pub frame_pool_size: usize,
    pub nf_ring_size: usize,
}

/// Create and publish every shared object, then assemble the context.
///
/// # Errors
///
/// Any missing or ill-formed shared object is fatal here, before workers
/// exist.
pub fn boot(params: BootParams) -> Result<Manager, BootError> {
    let shm = shm::Shm::new();

    let pool = Arc::new(FramePool::new(names::FRAME_POOL, params.frame_pool_size));
    shm.publish(names::FRAME_POOL, Arc::clone(&pool))?;

    let info_pool = Arc::new(InfoPool::new(config::MAX_NFS * 2));
    shm.publish(names::NF_INFO_POOL, Arc::clone(&info_pool))?;

    let queue = Arc::new(Ring::<Arc<NfInfo>>::new(Params {
        name: names::NF_INFO_QUEUE.to_string(),
        size: NF_QUEUE_SIZE,
        watermarks: None,
    })?);
    shm.publish(names::NF_INFO_QUEUE, Arc::clone(&queue))?;

    let flows = Arc::new(FlowTable::new());
    shm.publish(names::FLOW_TABLE, Arc::clone(&flows))?;

    let default_chain = Arc::new(ServiceChain::new(params.default_chain)?);
    shm.publish(names::DEFAULT_CHAIN, Arc::clone(&default_chain))?;

    let registry = Arc::new(Registry::new(Arc::clone(&shm), params.nf_ring_size));

    let cfg = params.cfg;
    let ctx = Arc::new(Ctx {
        cfg,
        pool,
        registry,
        flows,
        default_chain,
        ports: Ports::from_mask(params.portmask),
        global_bp: GlobalBackpressure::default(),
        stop: Arc::new(AtomicBool::new(false)),
    });

    // Signal wake needs the worker pid, which is in the slot by the time
    // the factory runs (admission precedes provisioning).
    let kind = cfg.ipc;
    let registry_for_wake = Arc::clone(&ctx.registry);
    let wake_factory: WakeFactory = Box::new(move |id: NfId| {
        let pid = registry_for_wake
            .slot(id)
            .info
            .load_full()
            .map_or(0, |info| info.pid());
        wake::ipc::open(kind, id.get(), pid)
    });

    Ok(Manager {
        shm,
        ctx,
        info_pool,
        queue,
        wake_factory,
    })
}

impl Manager {
    /// Swap the wake-handle builder (tests install in-process handles).
    pub fn set_wake_factory(&mut self, factory: WakeFactory) {
        self.wake_factory = factory;
    }

    /// One master pass: drain the submission queue, then reap dead workers.
    pub fn master_tick(&self) {
        let registry = &self.ctx.registry;
        registry.check_new_nfs(&self.queue, &self.info_pool, &|id| {
            (self.wake_factory)(id)
        });
        registry.probe_liveness(&self.info_pool, &process_alive);
    }

    /// Render the periodic stats table.
    #[must_use]
    pub fn render_stats(&self) -> String {
        let ports: Vec<PortRow> = self
            .ctx
            .ports
            .enabled()
            .iter()
            .filter_map(|&port| {
                self.ctx.ports.stats(port).map(|stats| PortRow {
                    port,
                    rx: stats.rx.load(Ordering::Relaxed),
                    tx: stats.tx.load(Ordering::Relaxed),
                    tx_drop: stats.tx_drop.load(Ordering::Relaxed),
                })
            })
            .collect();
        let nfs: Vec<NfRow> = self
            .ctx
            .registry
            .slots()
            .filter_map(|slot| {
                let info = slot.info.load_full()?;
                (info.status() == NfStatus::Running).then(|| NfRow {
                    instance: slot.instance().get(),
                    service: info.service_raw(),
                    tag: info.tag(),
                    counters: slot.stats.snapshot(),
                })
            })
            .collect();
        stats::render(&ports, &nfs)
    }

    /// Flip the stop flag and unpark every worker so it observes it.
    pub fn shutdown(&self) {
        self.ctx.stop.store(true, Ordering::Release);
        for slot in self.ctx.registry.slots() {
            if let Some(handle) = slot.wake.load_full() {
                handle.post();
            }
        }
        info!("stop requested; workers draining");
    }
}

/// Split `total` NF slots across `tx_workers` round-robin: worker `i` owns
/// `[first, last)`. With no fixed NF count the whole table is distributed.
#[must_use]
pub fn tx_slot_range(tx_workers: usize, worker: usize, total: usize) -> (u16, u16) {
    let total = total.clamp(1, config::MAX_NFS);
    let per_worker = total.div_ceil(tx_workers.max(1));
    let first = (worker * per_worker + 1).min(total);
    let last = ((worker + 1) * per_worker + 1).min(total);
    (first as u16, last as u16)
}
