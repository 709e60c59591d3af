// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! NF-side runtime: the startup handshake with the manager and the worker
//! loop.
//!
//! An NF allocates an info record from the shared pool, submits it on the
//! admission queue, spins until the manager delivers a verdict, attaches to
//! its rings by name, and then consumes RX batches through its packet
//! handler. When its ring drains and the manager has asked it to park, it
//! blocks on its wake primitive.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

mod args;

pub use args::NfArgs;

use config::{BATCH, COST_SAMPLING_RATE, names};
use pkt::{Frame, FramePool};
use registry::{InfoPool, NfInfo, NfStatus, WakeHandle};
use ring::Ring;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Exit code for an id conflict rejection.
pub const EXIT_ID_CONFLICT: i32 = 5;
/// Exit code when the manager is out of instance ids.
pub const EXIT_NO_IDS: i32 = 6;

#[derive(Debug, thiserror::Error)]
pub enum NfError {
    #[error("the shared info pool is exhausted")]
    InfoPoolExhausted,
    #[error("cannot submit the info record to the manager")]
    QueueUnavailable,
    #[error("instance id already in use")]
    IdConflict,
    #[error("no instance ids available")]
    NoIds,
    #[error("stopped before the manager answered")]
    StoppedDuringStartup,
    #[error("manager left the NF in unexpected state {0:?}")]
    UnexpectedStatus(NfStatus),
    #[error(transparent)]
    Shm(#[from] shm::ShmError),
}

impl NfError {
    /// Process exit code for this failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::IdConflict => EXIT_ID_CONFLICT,
            Self::NoIds => EXIT_NO_IDS,
            _ => 1,
        }
    }
}

/// Counters the worker keeps for itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStats {
    pub rx_processed: u64,
    pub tx: u64,
    pub tx_drop: u64,
}

/// A started NF, attached to its rings.
#[derive(Debug)]
pub struct NfHandle {
    pub info: Arc<NfInfo>,
    rx: Arc<Ring<Frame>>,
    tx: Arc<Ring<Frame>>,
    wake: Arc<Box<dyn WakeHandle>>,
    pool: Arc<FramePool>,
    info_pool: Arc<InfoPool>,
    queue: Arc<Ring<Arc<NfInfo>>>,
    stop: Arc<AtomicBool>,
    pub local: LocalStats,
}

/// Run the admission handshake and attach to the per-instance objects.
///
/// # Errors
///
/// Rejections surface as [`NfError::IdConflict`] / [`NfError::NoIds`] (the
/// caller exits with codes 5 / 6); missing shared objects are fatal startup
/// errors naming the object.
pub fn start(shm: &shm::Shm, args: &NfArgs, stop: Arc<AtomicBool>) -> Result<NfHandle, NfError> {
    let info_pool = shm.lookup::<InfoPool>(names::NF_INFO_POOL)?;
    let queue = shm.lookup::<Ring<Arc<NfInfo>>>(names::NF_INFO_QUEUE)?;
    let pool = shm.lookup::<FramePool>(names::FRAME_POOL)?;

    let nf_info = info_pool.get().ok_or(NfError::InfoPoolExhausted)?;
    nf_info.set_instance_raw(args.instance.unwrap_or(0));
    nf_info.set_service_raw(args.service);
    nf_info.set_tag(&args.tag);
    nf_info.set_core(args.core);
    nf_info.set_pid(std::process::id().try_into().unwrap_or(0));
    nf_info.set_status(NfStatus::WaitingForId);

    if queue.enqueue(Arc::clone(&nf_info)).is_err() {
        info_pool.put(nf_info);
        return Err(NfError::QueueUnavailable);
    }

    // The manager answers on its next master tick.
    while nf_info.status() == NfStatus::WaitingForId {
        if stop.load(Ordering::Acquire) {
            return Err(NfError::StoppedDuringStartup);
        }
        std::thread::yield_now();
    }
    match nf_info.status() {
        NfStatus::Starting => {}
        NfStatus::IdConflict => {
            info_pool.put(nf_info);
            return Err(NfError::IdConflict);
        }
        NfStatus::NoIds => {
            info_pool.put(nf_info);
            return Err(NfError::NoIds);
        }
        status => {
            info_pool.put(nf_info);
            return Err(NfError::UnexpectedStatus(status));
        }
    }

    let instance = nf_info.instance_raw();
    let rx = shm.lookup::<Ring<Frame>>(&names::nf_rx_ring(instance))?;
    let tx = shm.lookup::<Ring<Frame>>(&names::nf_tx_ring(instance))?;
    let wake = shm.lookup::<Box<dyn WakeHandle>>(&names::nf_wake(instance))?;

    info!(
        "NF {:?} running as instance {instance}, service {}",
        args.tag, args.service
    );
    nf_info.set_status(NfStatus::Running);
    Ok(NfHandle {
        info: nf_info,
        rx,
        tx,
        wake,
        pool,
        info_pool,
        queue,
        stop,
        local: LocalStats::default(),
    })
}

impl NfHandle {
    /// One RX pass: dequeue a batch, run the handler over it, and batch the
    /// results onto the TX ring. Returns how many frames moved.
    ///
    /// The handler rewrites each frame's metadata sidecar to its verdict
    /// (action + destination).
    pub fn poll_once(&mut self, handler: &mut dyn FnMut(&mut Frame)) -> usize {
        let mut batch: arrayvec::ArrayVec<Frame, BATCH> = arrayvec::ArrayVec::new();
        let mut n = self.rx.dequeue_bulk(&mut batch, BATCH);
        if n == 0 {
            n = self.rx.dequeue_burst(&mut batch, BATCH);
        }
        if n == 0 {
            return 0;
        }

        for frame in &mut batch {
            // Sample the per-packet cost once per sampling window.
            self.local.rx_processed += 1;
            if self.local.rx_processed % COST_SAMPLING_RATE == 0 {
                let begin = Instant::now();
                handler(frame);
                let cost = u64::try_from(begin.elapsed().as_nanos()).unwrap_or(u64::MAX);
                self.info.cost_hist.record(cost);
                let prev = self.info.comp_cost.load(Ordering::Relaxed);
                let next = if prev == 0 { cost } else { u64::midpoint(prev, cost) };
                self.info.comp_cost.store(next, Ordering::Relaxed);
            } else {
                handler(frame);
            }
        }

        let moved = batch.len() as u64;
        match self.tx.enqueue_bulk(&mut batch) {
            Ok(_) => self.local.tx += moved,
            Err(_) => {
                self.local.tx_drop += moved;
                for frame in batch.drain(..) {
                    if let Err(e) = self.pool.put(frame) {
                        debug!("frame return failed: {e}");
                    }
                }
            }
        }
        n
    }

    /// Worker loop: poll until stopped, parking when drained and asked to.
    pub fn run(&mut self, handler: &mut dyn FnMut(&mut Frame)) {
        while !self.stop.load(Ordering::Acquire) {
            if self.poll_once(handler) > 0 {
                continue;
            }
            if self.info.please_block.load(Ordering::Acquire) {
                self.wake.wait();
            } else {
                std::thread::yield_now();
            }
        }
        self.shutdown();
    }

    /// Announce the stop to the manager.
    pub fn shutdown(&mut self) {
        self.info.set_status(NfStatus::Stopped);
        if self.queue.enqueue(Arc::clone(&self.info)).is_err() {
            // Queue gone or full at teardown; the liveness probe will reap us.
            self.info_pool.put(Arc::clone(&self.info));
        }
    }

    /// Occupancy of this NF's RX ring.
    #[must_use]
    pub fn rx_backlog(&self) -> usize {
        self.rx.count()
    }
}
