// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Port drivers available to the manager binary.
//!
//! The poll-mode NIC driver proper is an external collaborator; what lives
//! here is the seam implementation the binary runs with when no NIC is
//! attached, plus the queue-backed double the scenario tests inject traffic
//! through.

use parking_lot::Mutex;
use pkt::{Frame, FramePool};
use stats::PortStats;
use std::collections::VecDeque;
use std::sync::Arc;
use steer::{FrameBatch, PortDriver};
use tracing::error;

/// Driver with no attached hardware: receives nothing, and anything
/// transmitted is released straight back to the pool.
pub struct IdleDriver {
    pool: Arc<FramePool>,
}

impl IdleDriver {
    #[must_use]
    pub fn new(pool: Arc<FramePool>) -> Self {
        Self { pool }
    }
}

impl PortDriver for IdleDriver {
    fn rx_burst(&self, _port: u16, _queue: u16, _out: &mut FrameBatch) -> usize {
        0
    }

    fn tx_burst(&self, _port: u16, _queue: u16, frames: &mut FrameBatch) -> usize {
        let n = frames.len();
        for frame in frames.drain(..) {
            if let Err(e) = self.pool.put(frame) {
                error!("frame accounting violated at TX: {e}");
            }
        }
        n
    }
}

/// Queue-backed driver double: tests push frames in, the RX pipeline pulls
/// them out, and transmitted frames are counted then returned to the pool.
pub struct QueueDriver {
    pool: Arc<FramePool>,
    rx_pending: Mutex<VecDeque<(u16, Frame)>>,
    tx_done: Vec<PortStats>,
    /// Frames per port the driver refuses per burst, for partial-TX tests.
    pub tx_refusal: Mutex<usize>,
}

impl QueueDriver {
    #[must_use]
    pub fn new(pool: Arc<FramePool>) -> Self {
        Self {
            pool,
            rx_pending: Mutex::new(VecDeque::new()),
            tx_done: (0..config::MAX_PORTS).map(|_| PortStats::default()).collect(),
            tx_refusal: Mutex::new(0),
        }
    }

    /// Queue a frame for delivery on `port`.
    pub fn inject(&self, port: u16, frame: Frame) {
        self.rx_pending.lock().push_back((port, frame));
    }

    /// Frames transmitted out `port` so far.
    #[must_use]
    pub fn transmitted(&self, port: u16) -> u64 {
        self.tx_done
            .get(usize::from(port))
            .map_or(0, |stats| stats.tx.load(std::sync::atomic::Ordering::Relaxed))
    }
}

impl PortDriver for QueueDriver {
    fn rx_burst(&self, port: u16, _queue: u16, out: &mut FrameBatch) -> usize {
        let mut pending = self.rx_pending.lock();
        let mut taken = 0;
        while taken < out.remaining_capacity() {
            match pending.front() {
                Some((p, _)) if *p == port => {
                    if let Some((_, frame)) = pending.pop_front() {
                        let _ = out.try_push(frame);
                        taken += 1;
                    }
                }
                _ => break,
            }
        }
        taken
    }

    fn tx_burst(&self, port: u16, _queue: u16, frames: &mut FrameBatch) -> usize {
        let refuse = (*self.tx_refusal.lock()).min(frames.len());
        let accept = frames.len() - refuse;
        for frame in frames.drain(..accept) {
            if let Some(stats) = self.tx_done.get(usize::from(port)) {
                stats.add_tx(1);
            }
            if let Err(e) = self.pool.put(frame) {
                error!("frame accounting violated at TX: {e}");
            }
        }
        accept
    }
}
