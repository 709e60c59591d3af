// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::{Ctx, Worker, backpressure, drop_frame};
use chain::FlowEntry;
use config::BATCH;
use pkt::Frame;
use registry::{NfId, ServiceId};
use ring::EnqueueError;
use std::sync::Arc;
use tracing::trace;

/// Steer one frame towards an instance of `dst_service`.
///
/// Resolution failures (no instance, instance not Running) are equivalent to
/// a drop. A frame whose chain is marked congested downstream of it is
/// dropped here and counted as a backpressure drop. Everything else lands in
/// the worker's staging buffer for that instance, flushed at `BATCH`.
pub fn enqueue_nf(
    ctx: &Ctx,
    worker: &mut Worker,
    dst_service: u16,
    frame: Frame,
    flow: Option<&Arc<FlowEntry>>,
) {
    let Some(service) = ServiceId::new(dst_service) else {
        drop_frame(ctx, frame);
        return;
    };
    let Some(id) = ctx.registry.resolve(service, frame.flow_hash) else {
        drop_frame(ctx, frame);
        return;
    };
    let slot = ctx.registry.slot(id);
    if !slot.is_dispatchable() {
        drop_frame(ctx, frame);
        return;
    }

    let chain_index = frame.meta().chain_index;
    if let Some(flow) = flow {
        // Remember who serves this hop so throttling can name upstreams.
        flow.chain.cache_instance(chain_index, id.get());
        if backpressure::should_drop_upstream(ctx, Some(flow.as_ref()), chain_index) {
            slot.stats.add(&slot.stats.bkpr_drop, 1);
            drop_frame(ctx, frame);
            return;
        }
    } else if backpressure::should_drop_global(ctx, service, chain_index) {
        slot.stats.add(&slot.stats.bkpr_drop, 1);
        slot.stats.add(&slot.stats.throttle_count, 1);
        drop_frame(ctx, frame);
        return;
    }

    let staging = &mut worker.nf_staging[id.index()];
    if staging.is_full() {
        // Possible when a held batch could not flush; try again, then shed
        // the newcomer rather than the held frames.
        flush_nf(ctx, worker, id);
        let staging = &mut worker.nf_staging[id.index()];
        if staging.is_full() {
            slot.stats.add(&slot.stats.rx_drop, 1);
            drop_frame(ctx, frame);
            return;
        }
    }
    let staging = &mut worker.nf_staging[id.index()];
    if let Err(overflow) = staging.try_push(frame) {
        slot.stats.add(&slot.stats.rx_drop, 1);
        drop_frame(ctx, overflow.element());
        return;
    }
    if staging.len() == BATCH {
        flush_nf(ctx, worker, id);
    }
}

/// Flush this worker's staging buffer for one NF into its RX ring.
pub fn flush_nf(ctx: &Ctx, worker: &mut Worker, id: NfId) {
    let slot = ctx.registry.slot(id);
    let staging = &mut worker.nf_staging[id.index()];
    if staging.is_empty() {
        return;
    }
    if !slot.is_dispatchable() {
        // The NF died with frames staged for it; shed them.
        let n = staging.len() as u64;
        slot.stats.add(&slot.stats.rx_drop, n);
        for frame in staging.drain(..) {
            drop_frame(ctx, frame);
        }
        return;
    }
    let Some(rx) = slot.rx.load_full() else {
        return;
    };
    let Some(tx) = slot.tx.load_full() else {
        return;
    };
    slot.stats.observe_depths(rx.count(), tx.count());

    let n = staging.len() as u64;
    match rx.enqueue_bulk(staging) {
        Ok(_) => {
            slot.stats.add(&slot.stats.rx, n);
        }
        Err(EnqueueError::OverWatermark) => {
            trace!("NF {id} RX ring over watermark");
            backpressure::mark(ctx, slot, staging.as_slice());
            backpressure::maybe_mark_ecn(ctx, staging.as_mut_slice());
            if ctx.cfg.hold_on_bottleneck {
                // Mode B: keep the batch staged for the next flush and do
                // not credit rx.
                return;
            }
            slot.stats.add(&slot.stats.rx_drop, n);
            for frame in staging.drain(..) {
                drop_frame(ctx, frame);
            }
        }
        Err(EnqueueError::Full) => {
            slot.stats.add(&slot.stats.rx_drop, n);
            for frame in staging.drain(..) {
                drop_frame(ctx, frame);
            }
        }
    }
}
