// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The NF registry: descriptor slots, identifier allocation, the per-service
//! instance map, and liveness.
//!
//! The descriptor table is a fixed array owned by the manager; the service
//! map stores plain instance ids and is republished as an immutable snapshot
//! on every change, so steering workers resolve without taking a lock.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

mod info;
mod slot;
mod table;

pub use info::{InfoPool, NfInfo};
pub use slot::{Bft, NfSlot, SchedState, WakeHandle};
pub use table::{AdmitError, ProvisionError, Registry, process_alive};

use config::{MAX_NFS, MAX_SERVICES};

/// An NF instance identifier. Slot 0 is reserved for the manager, so valid
/// ids live in `[1, MAX_NFS)`; "no instance" is `Option::None`, never 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NfId(pub(crate) u16);

impl NfId {
    #[must_use]
    pub fn new(raw: u16) -> Option<Self> {
        (1..MAX_NFS as u16).contains(&raw).then_some(Self(raw))
    }

    #[must_use]
    pub fn get(self) -> u16 {
        self.0
    }

    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl std::fmt::Display for NfId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A service identifier in `[0, MAX_SERVICES)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(pub(crate) u16);

impl ServiceId {
    #[must_use]
    pub fn new(raw: u16) -> Option<Self> {
        (raw < MAX_SERVICES as u16).then_some(Self(raw))
    }

    #[must_use]
    pub fn get(self) -> u16 {
        self.0
    }

    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// NF lifecycle states, shared between manager and NF through the info
/// record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NfStatus {
    /// Submitted, waiting for the manager to assign an id.
    WaitingForId = 0,
    /// Admitted; the NF is attaching to its rings.
    Starting = 1,
    Running = 2,
    Paused = 3,
    /// Shut down or reaped; the slot is reclaimable.
    Stopped = 4,
    /// Rejected: the requested id is live.
    IdConflict = 5,
    /// Rejected: the descriptor table is saturated.
    NoIds = 6,
}

impl NfStatus {
    #[must_use]
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::WaitingForId),
            1 => Some(Self::Starting),
            2 => Some(Self::Running),
            3 => Some(Self::Paused),
            4 => Some(Self::Stopped),
            5 => Some(Self::IdConflict),
            6 => Some(Self::NoIds),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn id_zero_and_out_of_range_are_invalid() {
        assert_eq!(NfId::new(0), None);
        assert_eq!(NfId::new(MAX_NFS as u16), None);
        assert_eq!(NfId::new(1).map(NfId::get), Some(1));
        assert_eq!(NfId::new(15).map(NfId::get), Some(15));
    }

    #[test]
    fn status_wire_round_trip() {
        for status in [
            NfStatus::WaitingForId,
            NfStatus::Starting,
            NfStatus::Running,
            NfStatus::Paused,
            NfStatus::Stopped,
            NfStatus::IdConflict,
            NfStatus::NoIds,
        ] {
            assert_eq!(NfStatus::from_wire(status as u8), Some(status));
        }
        assert_eq!(NfStatus::from_wire(7), None);
    }
}
