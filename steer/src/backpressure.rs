// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Backpressure: turning a congested downstream ring into upstream drops or
//! scheduling throttles.
//!
//! Marking happens when an NF's RX ring refuses a batch at its high
//! watermark; clearing happens when that ring drains under the low watermark
//! (hysteresis keeps the two apart). Flows with a table entry mark bits on
//! their chain and are recorded in the bottleneck NF's BFT for O(1) clearing;
//! default-chain traffic falls back to a global service-id bitmap.

use crate::Ctx;
use chain::FlowKey;
use config::BackpressureMode;
use pkt::Frame;
use registry::{NfSlot, ServiceId};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use tracing::{debug, warn};

/// Fallback congestion state for traffic riding the default chain, which has
/// no flow entry to hang bits off. Works when chain services are ordered by
/// id, which holds for the boot-time default chain.
#[derive(Debug, Default)]
pub struct GlobalBackpressure {
    overflow: AtomicBool,
    service_mask: AtomicU16,
}

impl GlobalBackpressure {
    pub fn mark(&self, service: ServiceId) {
        self.service_mask
            .fetch_or(1 << service.get(), Ordering::AcqRel);
        self.overflow.store(true, Ordering::Release);
    }

    pub fn clear(&self, service: ServiceId) {
        let left = self
            .service_mask
            .fetch_and(!(1 << service.get()), Ordering::AcqRel)
            & !(1 << service.get());
        if left == 0 {
            self.overflow.store(false, Ordering::Release);
        }
    }

    #[must_use]
    pub fn active(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    /// Whether `service` sits upstream of the highest marked service.
    #[must_use]
    pub fn names_upstream(&self, service: ServiceId) -> bool {
        let mask = self.service_mask.load(Ordering::Acquire);
        if mask == 0 {
            return false;
        }
        u32::from(service.get()) < mask.ilog2()
    }
}

fn highest_bit(mask: u8) -> u8 {
    debug_assert!(mask != 0);
    u8::try_from(mask.ilog2()).unwrap_or(7)
}

/// Upstream-drop policy check, consulted by the enqueue engine before a frame
/// is staged. True means the frame must be dropped and counted as
/// `bkpr_drop`.
#[must_use]
pub fn should_drop_upstream(ctx: &Ctx, flow: Option<&chain::FlowEntry>, chain_index: u8) -> bool {
    if ctx.cfg.backpressure != BackpressureMode::DropUpstream {
        return false;
    }
    if let Some(flow) = flow {
        let mask = flow.chain.bottleneck_mask();
        if mask == 0 {
            return false;
        }
        if ctx.cfg.drop_only_at_ingress {
            return chain_index == 1;
        }
        return chain_index < highest_bit(mask);
    }
    false
}

/// Global-fallback drop check for frames without a flow entry.
#[must_use]
pub fn should_drop_global(ctx: &Ctx, dst_service: ServiceId, chain_index: u8) -> bool {
    if ctx.cfg.backpressure != BackpressureMode::DropUpstream || !ctx.global_bp.active() {
        return false;
    }
    if ctx.cfg.drop_only_at_ingress {
        return chain_index == 1;
    }
    ctx.global_bp.names_upstream(dst_service)
}

/// Mark `slot` as a bottleneck on behalf of the staged frames its ring just
/// refused.
pub fn mark(ctx: &Ctx, slot: &NfSlot, staged: &[Frame]) {
    slot.is_bottleneck.store(true, Ordering::Release);

    for frame in staged {
        let chain_index = frame.meta().chain_index;
        if chain_index < 1 {
            continue;
        }
        let flow = FlowKey::parse(frame.payload()).and_then(|key| ctx.flows.get(&key));
        match flow {
            Some(entry) => {
                if !entry.chain.mark_bottleneck(chain_index) {
                    continue;
                }
                entry.record_mark(chain_index, slot.instance().get());
                if !slot.bft.push(entry.clone(), chain_index) {
                    warn!(
                        "BFT of NF {} overflowed; mark at chain index {chain_index} will clear late",
                        slot.instance()
                    );
                }
                if ctx.cfg.backpressure == BackpressureMode::ScheduleThrottle {
                    throttle_upstreams(ctx, &entry, chain_index);
                }
            }
            None => {
                if let Some(info) = slot.info.load_full() {
                    if let Some(service) = ServiceId::new(info.service_raw()) {
                        ctx.global_bp.mark(service);
                    }
                }
            }
        }
    }
}

/// Flag every upstream hop of `chain_index` for schedule throttling, or just
/// the immediate one under hop-by-hop.
fn throttle_upstreams(ctx: &Ctx, entry: &chain::FlowEntry, chain_index: u8) {
    for upstream in (1..chain_index).rev() {
        let Some(instance) = entry.chain.cached_instance(upstream) else {
            continue;
        };
        if let Some(slot) = ctx.registry.slot_raw(instance) {
            slot.throttle_this_upstream.store(true, Ordering::Release);
        }
        if ctx.cfg.hop_by_hop {
            break;
        }
    }
}

/// Hysteresis clear pass, run by the TX worker that owns `slot` after it
/// dequeues. Clears everything this NF marked once its RX ring has drained
/// under the low watermark.
pub fn check_and_clear(ctx: &Ctx, slot: &NfSlot) {
    if !slot.is_bottleneck.load(Ordering::Acquire) && !ctx.global_bp.active() {
        return;
    }
    let Some(rx) = slot.rx.load_full() else {
        return;
    };
    if !rx.below_low_water() {
        return;
    }

    if ctx.global_bp.active() {
        if let Some(info) = slot.info.load_full() {
            if let Some(service) = ServiceId::new(info.service_raw()) {
                ctx.global_bp.clear(service);
            }
        }
    }

    for (entry, chain_index) in slot.bft.drain() {
        entry.chain.clear_bottleneck(chain_index);
        entry.clear_mark(chain_index);
        if ctx.cfg.backpressure == BackpressureMode::ScheduleThrottle {
            // Un-throttle from the new highest congested index up to the one
            // just cleared; anything below a surviving mark stays throttled.
            let from = entry.chain.highest_bottleneck().map_or(1, |bit| bit);
            for upstream in from..chain_index {
                let Some(instance) = entry.chain.cached_instance(upstream) else {
                    continue;
                };
                if let Some(upstream_slot) = ctx.registry.slot_raw(instance) {
                    upstream_slot
                        .throttle_this_upstream
                        .store(false, Ordering::Release);
                }
            }
        }
    }
    if slot.bft.is_empty() {
        slot.is_bottleneck.store(false, Ordering::Release);
        debug!("NF {} backpressure cleared", slot.instance());
    }
}

/// Set the IPv4 ECN CE bits in place, checksum untouched. Advisory only.
pub fn set_ecn_ce(frame: &mut Frame) {
    let payload = frame.payload_mut();
    // Untagged Ethernet II, IPv4 ethertype; ToS is the second IPv4 byte.
    if payload.len() > 15 && payload[12] == 0x08 && payload[13] == 0x00 {
        payload[15] |= 0x03;
    }
}

/// Apply CE marking to a whole staged batch when configured.
pub fn maybe_mark_ecn(ctx: &Ctx, staged: &mut [Frame]) {
    if !ctx.cfg.ecn_ce {
        return;
    }
    for frame in staged {
        set_ecn_ce(frame);
    }
}
