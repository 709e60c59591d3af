// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::sync::atomic::{AtomicU64, Ordering};

const BUCKETS: usize = 40;

/// Log2-bucketed histogram of per-packet computation cost samples.
///
/// The NF worker records a sample every `COST_SAMPLING_RATE` packets; the
/// load extractor pulls the median, which rides out the scheduling spikes a
/// running average would absorb.
#[derive(Debug)]
pub struct CostHistogram {
    buckets: [AtomicU64; BUCKETS],
}

impl Default for CostHistogram {
    fn default() -> Self {
        Self {
            buckets: [const { AtomicU64::new(0) }; BUCKETS],
        }
    }
}

impl CostHistogram {
    pub fn record(&self, cost: u64) {
        let bucket = (64 - cost.leading_zeros() as usize).min(BUCKETS - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// Median cost, reported as the lower bound of the median bucket.
    /// `None` until at least one sample lands.
    #[must_use]
    pub fn median(&self) -> Option<u64> {
        let counts: Vec<u64> = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return None;
        }
        let mut seen = 0;
        for (bucket, count) in counts.iter().enumerate() {
            seen += count;
            if seen * 2 >= total {
                return Some(if bucket == 0 { 0 } else { 1 << (bucket - 1) });
            }
        }
        None
    }

    pub fn clear(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
    }
}
