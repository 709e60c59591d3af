// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Dimensioning constants, feature switches, and shared-object naming for the
//! steering dataplane.
//!
//! Every optional behaviour is a field of [`FeatureConfig`], so one build
//! supports every combination and the scenario tests can exercise them all.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

pub mod names;

use std::time::Duration;
use strum::{Display, EnumString};

/// Total number of NF slots, slot 0 included. Slot 0 is reserved.
pub const MAX_NFS: usize = 16;
/// Total number of distinct service ids.
pub const MAX_SERVICES: usize = 16;
/// Upper bound on instances fulfilling one service.
pub const MAX_NFS_PER_SERVICE: usize = 8;
/// Longest supported service chain.
pub const MAX_CHAIN_LENGTH: usize = 4;
/// Upper bound on NIC ports.
pub const MAX_PORTS: usize = 16;
/// Frames moved per bulk ring operation.
pub const BATCH: usize = 32;
/// Per-NF RX/TX ring capacity (slots). Must be a power of two.
pub const NF_RING_SIZE: usize = 16384;
/// Capacity of the per-NF bottleneck-flow-table ring.
pub const BFT_SIZE: usize = 1024;
/// Capacity of the new-NF submission queue.
pub const NF_QUEUE_SIZE: usize = MAX_NFS * 2;

/// Interval between wake-scheduler passes.
pub const WAKE_TICK: Duration = Duration::from_micros(100);
/// Wake ticks between load/cost extractions.
pub const EXTRACT_PERIOD_TICKS: u32 = 10;
/// Master loop cadence.
pub const MASTER_TICK: Duration = Duration::from_secs(1);
/// NF ring occupancy at which a parked NF is worth signalling.
pub const WAKE_THRESHOLD: usize = 1;
/// Packets between computation-cost samples in the NF worker loop.
pub const COST_SAMPLING_RATE: u64 = 1_000_000;
/// Baseline scheduler share handed to an NF before weighting.
pub const DEFAULT_NF_SHARE: u64 = 1024;
/// Scheduling epoch used when converting comp-cost into an exec period.
pub const EPOCH: Duration = Duration::from_micros(100);
/// Upper bound on cores the weight assigner tracks.
pub const MAX_CORES: usize = 64;

/// High watermark for a ring of `capacity` slots: 75 % occupancy.
#[must_use]
pub const fn high_watermark(capacity: usize) -> usize {
    capacity / 4 * 3
}

/// Low watermark for a ring of `capacity` slots: 50 % occupancy.
#[must_use]
pub const fn low_watermark(capacity: usize) -> usize {
    capacity / 2
}

/// How the manager reacts when a downstream NF ring crosses its high
/// watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum BackpressureMode {
    /// No upstream reaction; frames drop at the full ring only.
    None,
    /// Drop frames at upstream chain positions while the bottleneck persists.
    #[default]
    DropUpstream,
    /// Refuse to schedule upstream NFs while the bottleneck persists.
    ScheduleThrottle,
}

/// IPC primitive used to park and wake NF workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum IpcKind {
    /// POSIX named semaphore.
    #[default]
    Semaphore,
    /// SIGUSR1 to the worker pid.
    Signal,
    /// Named pipe.
    Fifo,
    /// Unix datagram socket.
    Socket,
    /// No IPC; the worker busy-polls.
    Poll,
}

/// Optional-behaviour switches, fixed at manager start.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureConfig {
    pub backpressure: BackpressureMode,
    /// Throttle only the immediate upstream hop instead of every upstream.
    pub hop_by_hop: bool,
    /// Drop marked flows only at chain index 1 (ingress) instead of at every
    /// upstream index.
    pub drop_only_at_ingress: bool,
    /// Set the IPv4 ECN CE bits on frames staged for a congested NF.
    pub ecn_ce: bool,
    pub ipc: IpcKind,
    /// Weight scheduler shares by load × cost instead of cost alone.
    pub dynamic_weights: bool,
    /// On a full ring, hold the staged batch for retry instead of dropping
    /// it. Off by default: holding risks head-of-line blocking a TX worker.
    pub hold_on_bottleneck: bool,
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    #[test]
    fn watermarks_keep_hysteresis_gap() {
        assert_eq!(high_watermark(128), 96);
        assert_eq!(low_watermark(128), 64);
        assert!(low_watermark(NF_RING_SIZE) < high_watermark(NF_RING_SIZE));
    }

    #[test]
    fn mode_round_trips_through_cli_names() {
        for mode in [
            BackpressureMode::None,
            BackpressureMode::DropUpstream,
            BackpressureMode::ScheduleThrottle,
        ] {
            assert_eq!(BackpressureMode::from_str(&mode.to_string()), Ok(mode));
        }
        assert_eq!(IpcKind::from_str("semaphore"), Ok(IpcKind::Semaphore));
        assert!(IpcKind::from_str("shared-nothing").is_err());
    }
}
