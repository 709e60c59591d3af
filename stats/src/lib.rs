// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Counters and load estimation for NFs and ports.
//!
//! Counters are single-word atomics bumped from the hot path; every reader
//! (load extraction, console rendering) tolerates stale values. Delta
//! snapshots against the previous extraction drive the wake scheduler's
//! notion of offered load.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

mod cost;
mod display;

pub use cost::CostHistogram;
pub use display::{NfRow, PortRow, render};

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-NF counter block, one per descriptor slot.
#[derive(Debug, Default)]
pub struct NfStats {
    /// Frames delivered into the NF's RX ring.
    pub rx: AtomicU64,
    /// Frames dropped because the RX ring refused them.
    pub rx_drop: AtomicU64,
    /// Frames the NF emitted that the TX pipeline picked up.
    pub tx: AtomicU64,
    /// Frames lost between the NF and the wire.
    pub tx_drop: AtomicU64,
    /// Frames dropped upstream by backpressure policy.
    pub bkpr_drop: AtomicU64,
    pub act_drop: AtomicU64,
    pub act_next: AtomicU64,
    pub act_tonf: AtomicU64,
    pub act_out: AtomicU64,
    pub wakeup_count: AtomicU64,
    pub throttle_count: AtomicU64,
    pub max_rx_depth: AtomicU64,
    pub max_tx_depth: AtomicU64,
}

impl NfStats {
    /// Bump one of this block's counters.
    #[allow(clippy::unused_self)]
    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Track high-water queue depths.
    pub fn observe_depths(&self, rx_depth: usize, tx_depth: usize) {
        self.max_rx_depth
            .fetch_max(rx_depth as u64, Ordering::Relaxed);
        self.max_tx_depth
            .fetch_max(tx_depth as u64, Ordering::Relaxed);
    }

    /// Reset every counter; used when a slot is reclaimed.
    pub fn clear(&self) {
        for counter in [
            &self.rx,
            &self.rx_drop,
            &self.tx,
            &self.tx_drop,
            &self.bkpr_drop,
            &self.act_drop,
            &self.act_next,
            &self.act_tonf,
            &self.act_out,
            &self.wakeup_count,
            &self.throttle_count,
            &self.max_rx_depth,
            &self.max_tx_depth,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> NfCounters {
        NfCounters {
            rx: self.rx.load(Ordering::Relaxed),
            rx_drop: self.rx_drop.load(Ordering::Relaxed),
            tx: self.tx.load(Ordering::Relaxed),
            tx_drop: self.tx_drop.load(Ordering::Relaxed),
            bkpr_drop: self.bkpr_drop.load(Ordering::Relaxed),
            act_drop: self.act_drop.load(Ordering::Relaxed),
            act_next: self.act_next.load(Ordering::Relaxed),
            act_tonf: self.act_tonf.load(Ordering::Relaxed),
            act_out: self.act_out.load(Ordering::Relaxed),
            wakeup_count: self.wakeup_count.load(Ordering::Relaxed),
            throttle_count: self.throttle_count.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value image of [`NfStats`] at one instant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NfCounters {
    pub rx: u64,
    pub rx_drop: u64,
    pub tx: u64,
    pub tx_drop: u64,
    pub bkpr_drop: u64,
    pub act_drop: u64,
    pub act_next: u64,
    pub act_tonf: u64,
    pub act_out: u64,
    pub wakeup_count: u64,
    pub throttle_count: u64,
}

impl NfCounters {
    /// Per-interval deltas against the previous snapshot.
    #[must_use]
    pub fn delta(&self, prev: &NfCounters) -> NfDelta {
        NfDelta {
            rx: self.rx.saturating_sub(prev.rx),
            rx_drop: self.rx_drop.saturating_sub(prev.rx_drop),
            tx: self.tx.saturating_sub(prev.tx),
        }
    }
}

/// Interval deltas feeding the load extractor: `load = rx + rx_drop`
/// (offered), `tx` (served).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NfDelta {
    pub rx: u64,
    pub rx_drop: u64,
    pub tx: u64,
}

impl NfDelta {
    #[must_use]
    pub fn offered_load(&self) -> u64 {
        self.rx + self.rx_drop
    }
}

/// Two-point running average, seeded by the first observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ewma(u64);

impl Ewma {
    pub fn update(&mut self, value: u64) -> u64 {
        self.0 = if self.0 == 0 {
            value
        } else {
            u64::midpoint(self.0, value)
        };
        self.0
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Per-port counter block.
#[derive(Debug, Default)]
pub struct PortStats {
    pub rx: AtomicU64,
    pub tx: AtomicU64,
    pub tx_drop: AtomicU64,
}

impl PortStats {
    pub fn add_rx(&self, n: u64) {
        self.rx.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tx(&self, n: u64) {
        self.tx.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tx_drop(&self, n: u64) {
        self.tx_drop.fetch_add(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deltas_are_against_the_previous_snapshot() {
        let stats = NfStats::default();
        stats.add(&stats.rx, 10);
        stats.add(&stats.rx_drop, 2);
        let first = stats.snapshot();
        stats.add(&stats.rx, 5);
        stats.add(&stats.tx, 7);
        let delta = stats.snapshot().delta(&first);
        assert_eq!(delta.rx, 5);
        assert_eq!(delta.rx_drop, 0);
        assert_eq!(delta.tx, 7);
        assert_eq!(delta.offered_load(), 5);
    }

    #[test]
    fn clear_zeroes_everything() {
        let stats = NfStats::default();
        stats.add(&stats.bkpr_drop, 3);
        stats.observe_depths(100, 50);
        stats.clear();
        assert_eq!(stats.snapshot(), NfCounters::default());
        assert_eq!(stats.max_rx_depth.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn ewma_seeds_then_averages() {
        let mut ewma = Ewma::default();
        assert_eq!(ewma.update(100), 100);
        assert_eq!(ewma.update(50), 75);
        assert_eq!(ewma.get(), 75);
    }

    #[test]
    fn depth_observation_keeps_the_maximum() {
        let stats = NfStats::default();
        stats.observe_depths(10, 1);
        stats.observe_depths(4, 9);
        assert_eq!(stats.max_rx_depth.load(Ordering::Relaxed), 10);
        assert_eq!(stats.max_tx_depth.load(Ordering::Relaxed), 9);
    }
}
