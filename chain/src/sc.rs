// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use arrayvec::ArrayVec;
use config::MAX_CHAIN_LENGTH;
use pkt::NfAction;
use std::sync::atomic::{AtomicU8, AtomicU16, Ordering};

/// One hop of a service chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    pub action: NfAction,
    /// Service id for `ToNf`, port id for `Out`, unused otherwise.
    pub destination: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("service chain length {0} exceeds the maximum of {MAX_CHAIN_LENGTH}")]
    TooLong(usize),
    #[error("service chains must have at least one hop")]
    Empty,
}

/// An ordered service chain with its congestion-steering state.
///
/// Chain indices as carried in frame metadata are 1-based after the first
/// resolution (the RX pipeline resolves hop `k` while `chain_index == k`,
/// then increments). The bitmap and the instance cache are indexed by that
/// 1-based value.
#[derive(Debug)]
pub struct ServiceChain {
    entries: ArrayVec<ChainEntry, MAX_CHAIN_LENGTH>,
    /// Bit `k` set: the NF serving chain index `k` is over its high watermark.
    bottleneck_mask: AtomicU8,
    /// Instance observed serving each chain index; 0 = not yet seen.
    cached_instance: [AtomicU16; MAX_CHAIN_LENGTH + 1],
}

impl ServiceChain {
    /// Build a chain from its hops.
    ///
    /// # Errors
    ///
    /// Fails on an empty chain or one longer than [`MAX_CHAIN_LENGTH`].
    pub fn new(hops: impl IntoIterator<Item = ChainEntry>) -> Result<Self, ChainError> {
        let mut entries = ArrayVec::new();
        for (i, hop) in hops.into_iter().enumerate() {
            entries.try_push(hop).map_err(|_| ChainError::TooLong(i + 1))?;
        }
        if entries.is_empty() {
            return Err(ChainError::Empty);
        }
        Ok(Self {
            entries,
            bottleneck_mask: AtomicU8::new(0),
            cached_instance: Default::default(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The hop resolved while a frame carries `chain_index` (0-based).
    /// `None` past the end of the chain; the caller drops.
    #[must_use]
    pub fn hop(&self, chain_index: u8) -> Option<ChainEntry> {
        self.entries.get(usize::from(chain_index)).copied()
    }

    /// Set bit `chain_index`; true if it was newly set.
    pub fn mark_bottleneck(&self, chain_index: u8) -> bool {
        let bit = 1_u8 << chain_index;
        self.bottleneck_mask.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    pub fn clear_bottleneck(&self, chain_index: u8) {
        self.bottleneck_mask
            .fetch_and(!(1_u8 << chain_index), Ordering::AcqRel);
    }

    #[must_use]
    pub fn bottleneck_mask(&self) -> u8 {
        self.bottleneck_mask.load(Ordering::Acquire)
    }

    /// Highest congested chain index, if any bit is set.
    #[must_use]
    pub fn highest_bottleneck(&self) -> Option<u8> {
        match self.bottleneck_mask() {
            0 => None,
            mask => u8::try_from(mask.ilog2()).ok(),
        }
    }

    /// Remember which instance served `chain_index`.
    pub fn cache_instance(&self, chain_index: u8, instance: u16) {
        if let Some(slot) = self.cached_instance.get(usize::from(chain_index)) {
            slot.store(instance, Ordering::Relaxed);
        }
    }

    /// The instance last observed serving `chain_index`.
    #[must_use]
    pub fn cached_instance(&self, chain_index: u8) -> Option<u16> {
        self.cached_instance
            .get(usize::from(chain_index))
            .map(|slot| slot.load(Ordering::Relaxed))
            .filter(|&id| id != 0)
    }
}
