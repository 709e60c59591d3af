// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The steering core: RX and TX pipelines, the per-NF enqueue engine, and
//! the backpressure engine.
//!
//! Workers share nothing on the hot path except the rings themselves: every
//! RX/TX thread owns a private [`Worker`] with per-NF and per-port staging
//! buffers, and all cross-thread state is a single-word atomic somewhere in
//! the shared [`Ctx`].

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

pub mod backpressure;
mod enqueue;
pub mod ports;
mod rx;
mod tx;

pub use enqueue::enqueue_nf;
pub use rx::{process_rx_batch, rx_iteration, rx_loop};
pub use tx::{flush_all_nfs, flush_all_ports, process_tx_batch, tx_iteration, tx_loop};

use arrayvec::ArrayVec;
use backpressure::GlobalBackpressure;
use chain::{FlowTable, ServiceChain};
use config::{BATCH, FeatureConfig, MAX_NFS, MAX_PORTS};
use pkt::{Frame, FramePool};
use ports::Ports;
use registry::Registry;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::error;

/// A batch of frames as moved by one bulk ring operation.
pub type FrameBatch = ArrayVec<Frame, BATCH>;

/// Poll-mode port driver seam. The real PMD lives outside this crate; tests
/// plug in loopback doubles.
pub trait PortDriver: Send + Sync {
    /// Fill `out` with up to its remaining capacity of frames from the given
    /// port/queue; returns how many were delivered.
    fn rx_burst(&self, port: u16, queue: u16, out: &mut FrameBatch) -> usize;

    /// Transmit staged frames. Consumes the frames it accepts and leaves the
    /// refused tail in `frames` for the caller to drop and count.
    fn tx_burst(&self, port: u16, queue: u16, frames: &mut FrameBatch) -> usize;
}

/// Shared manager state carried through every worker.
pub struct Ctx {
    pub cfg: FeatureConfig,
    pub pool: Arc<FramePool>,
    pub registry: Arc<Registry>,
    pub flows: Arc<FlowTable>,
    pub default_chain: Arc<ServiceChain>,
    pub ports: Ports,
    pub global_bp: GlobalBackpressure,
    pub stop: Arc<AtomicBool>,
}

/// Thread-local staging state of one RX or TX worker.
pub struct Worker {
    pub queue: u16,
    nf_staging: Vec<FrameBatch>,
    port_staging: Vec<FrameBatch>,
}

impl Worker {
    #[must_use]
    pub fn new(queue: u16) -> Self {
        Self {
            queue,
            nf_staging: (0..MAX_NFS).map(|_| FrameBatch::new()).collect(),
            port_staging: (0..MAX_PORTS).map(|_| FrameBatch::new()).collect(),
        }
    }
}

/// Release a frame to the pool. A pool refusal means frame accounting is
/// broken; it is logged as fatal but the worker carries on.
pub fn drop_frame(ctx: &Ctx, frame: Frame) {
    if let Err(e) = ctx.pool.put(frame) {
        error!("frame accounting violated: {e}");
    }
}

/// Release a whole batch.
pub fn drop_batch(ctx: &Ctx, batch: &mut FrameBatch) {
    for frame in batch.drain(..) {
        drop_frame(ctx, frame);
    }
}
