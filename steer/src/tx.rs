// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::{
    Ctx, FrameBatch, PortDriver, Worker, backpressure, drop_frame, enqueue_nf, enqueue::flush_nf,
};
use chain::{FlowEntry, FlowKey};
use config::{BATCH, MAX_CHAIN_LENGTH, MAX_NFS, MAX_PORTS};
use pkt::{Frame, NfAction};
use registry::NfSlot;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::warn;

fn lookup_flow(ctx: &Ctx, frame: &Frame) -> Option<Arc<FlowEntry>> {
    FlowKey::parse(frame.payload()).and_then(|key| ctx.flows.get(&key))
}

/// Dispatch one frame leaving an NF, by its sidecar action.
fn dispatch(ctx: &Ctx, worker: &mut Worker, driver: &dyn PortDriver, mut frame: Frame, slot: &NfSlot, depth: usize) {
    if !frame.action_is_valid() {
        warn!("NF {} emitted an invalid action; dropping", slot.instance());
        drop_frame(ctx, frame);
        return;
    }
    let mut meta = frame.meta();
    match meta.action {
        NfAction::Drop => {
            slot.stats.add(&slot.stats.act_drop, 1);
            drop_frame(ctx, frame);
        }
        NfAction::Next => {
            slot.stats.add(&slot.stats.act_next, 1);
            if depth >= MAX_CHAIN_LENGTH {
                warn!("chain for NF {} ran past its length; dropping", slot.instance());
                drop_frame(ctx, frame);
                return;
            }
            let flow = lookup_flow(ctx, &frame);
            let chain = flow
                .as_ref()
                .map_or(&ctx.default_chain, |entry| &entry.chain);
            match chain.hop(meta.chain_index) {
                Some(hop) => {
                    meta.action = hop.action;
                    meta.destination = hop.destination;
                    frame.set_meta(meta);
                    dispatch(ctx, worker, driver, frame, slot, depth + 1);
                }
                None => {
                    // Walked off the end of the chain; terminal drop.
                    slot.stats.add(&slot.stats.act_drop, 1);
                    drop_frame(ctx, frame);
                }
            }
        }
        NfAction::ToNf => {
            slot.stats.add(&slot.stats.act_tonf, 1);
            if usize::from(meta.chain_index) >= MAX_CHAIN_LENGTH {
                warn!(
                    "chain index {} would exceed the chain bound; dropping",
                    meta.chain_index
                );
                drop_frame(ctx, frame);
                return;
            }
            meta.chain_index += 1;
            frame.set_meta(meta);
            let flow = lookup_flow(ctx, &frame);
            enqueue_nf(ctx, worker, meta.destination, frame, flow.as_ref());
        }
        NfAction::Out => {
            slot.stats.add(&slot.stats.act_out, 1);
            enqueue_port(ctx, worker, driver, meta.destination, frame);
        }
    }
}

/// Process a batch dequeued from one NF's TX ring.
pub fn process_tx_batch(
    ctx: &Ctx,
    worker: &mut Worker,
    driver: &dyn PortDriver,
    batch: &mut FrameBatch,
    slot: &NfSlot,
) {
    for mut frame in batch.drain(..) {
        let mut meta = frame.meta();
        meta.src = slot.instance().get();
        frame.set_meta(meta);
        dispatch(ctx, worker, driver, frame, slot, 0);
    }
}

/// Stage a frame for port TX, flushing the port buffer at `BATCH`.
pub fn enqueue_port(ctx: &Ctx, worker: &mut Worker, driver: &dyn PortDriver, port: u16, frame: Frame) {
    if usize::from(port) >= MAX_PORTS {
        drop_frame(ctx, frame);
        return;
    }
    let staging = &mut worker.port_staging[usize::from(port)];
    if let Err(overflow) = staging.try_push(frame) {
        drop_frame(ctx, overflow.element());
        return;
    }
    if staging.len() == BATCH {
        flush_port(ctx, worker, driver, port);
    }
}

/// Burst one port's staged frames to the driver; frames the port refuses are
/// dropped and counted against the port and the emitting NF.
pub fn flush_port(ctx: &Ctx, worker: &mut Worker, driver: &dyn PortDriver, port: u16) {
    let staging = &mut worker.port_staging[usize::from(port)];
    if staging.is_empty() {
        return;
    }
    let sent = driver.tx_burst(port, worker.queue, staging);
    if let Some(stats) = ctx.ports.stats(port) {
        stats.add_tx(sent as u64);
        stats.add_tx_drop(staging.len() as u64);
    }
    for frame in staging.drain(..) {
        if let Some(src) = ctx.registry.slot_raw(frame.meta().src) {
            src.stats.add(&src.stats.tx_drop, 1);
        }
        drop_frame(ctx, frame);
    }
}

/// Flush every port staging buffer this worker owns.
pub fn flush_all_ports(ctx: &Ctx, worker: &mut Worker, driver: &dyn PortDriver) {
    for port in 0..MAX_PORTS as u16 {
        flush_port(ctx, worker, driver, port);
    }
}

/// Flush every NF staging buffer this worker owns.
pub fn flush_all_nfs(ctx: &Ctx, worker: &mut Worker) {
    for raw in 1..MAX_NFS as u16 {
        if let Some(id) = ctx.registry.slot_raw(raw).map(NfSlot::instance) {
            flush_nf(ctx, worker, id);
        }
    }
}

/// One TX pass over this worker's slot range `[first, last)`.
pub fn tx_iteration(
    ctx: &Ctx,
    worker: &mut Worker,
    driver: &dyn PortDriver,
    first: u16,
    last: u16,
) {
    let mut batch = FrameBatch::new();
    for raw in first..last {
        let Some(slot) = ctx.registry.slot_raw(raw) else {
            continue;
        };
        if !slot.is_dispatchable() {
            continue;
        }
        let Some(tx_ring) = slot.tx.load_full() else {
            continue;
        };
        // Try a full batch first; fall back to whatever is available.
        let mut n = tx_ring.dequeue_bulk(&mut batch, BATCH);
        if n == 0 {
            n = tx_ring.dequeue_burst(&mut batch, BATCH);
        }
        if n > 0 {
            slot.stats.add(&slot.stats.tx, n as u64);
            process_tx_batch(ctx, worker, driver, &mut batch, slot);
        }
        backpressure::check_and_clear(ctx, slot);
    }
    flush_all_ports(ctx, worker, driver);
    flush_all_nfs(ctx, worker);
}

/// Busy-poll TX worker loop over its assigned slot range.
pub fn tx_loop(
    ctx: &Ctx,
    worker: &mut Worker,
    driver: &dyn PortDriver,
    first: u16,
    last: u16,
) {
    while !ctx.stop.load(Ordering::Acquire) {
        tx_iteration(ctx, worker, driver, first, last);
    }
}
