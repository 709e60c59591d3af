// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::{Ctx, FrameBatch, PortDriver, Worker, drop_batch, enqueue_nf, flush_all_nfs};
use chain::FlowKey;
use config::BATCH;
use pkt::FrameMeta;
use std::sync::atomic::Ordering;

/// Classify and steer one batch fresh off a port.
///
/// Every frame starts its chain here: source zeroed, chain index reset, flow
/// classified once (key and hash travel with the frame), first hop resolved,
/// then handed to the enqueue engine. Staging buffers are flushed after the
/// whole batch so the ring sees bulk operations.
pub fn process_rx_batch(ctx: &Ctx, worker: &mut Worker, batch: &mut FrameBatch) {
    for mut frame in batch.drain(..) {
        let key = FlowKey::parse(frame.payload());
        frame.flow_hash = key.map(|key| key.hash64()).unwrap_or_default();
        let flow = key.and_then(|key| ctx.flows.get(&key));

        let chain = flow
            .as_ref()
            .map_or(&ctx.default_chain, |entry| &entry.chain);
        let (action, destination) = chain
            .hop(0)
            .map_or((pkt::NfAction::Drop, 0), |hop| (hop.action, hop.destination));

        let meta = FrameMeta {
            action,
            destination,
            src: 0,
            chain_index: 1,
        };
        frame.set_meta(meta);

        enqueue_nf(ctx, worker, meta.destination, frame, flow.as_ref());
    }
    flush_all_nfs(ctx, worker);
}

/// One RX pass: burst every enabled port on this worker's queue index.
pub fn rx_iteration(ctx: &Ctx, worker: &mut Worker, driver: &dyn PortDriver) {
    let mut batch = FrameBatch::new();
    for &port in ctx.ports.enabled() {
        let n = driver.rx_burst(port, worker.queue, &mut batch);
        if n == 0 {
            continue;
        }
        if let Some(stats) = ctx.ports.stats(port) {
            stats.add_rx(n as u64);
        }
        if ctx.registry.admitted() == 0 {
            // Nobody to steer to; shed the whole batch.
            drop_batch(ctx, &mut batch);
            continue;
        }
        process_rx_batch(ctx, worker, &mut batch);
        debug_assert!(batch.is_empty());
        debug_assert!(n <= BATCH);
    }
}

/// Busy-poll RX worker loop.
pub fn rx_loop(ctx: &Ctx, worker: &mut Worker, driver: &dyn PortDriver) {
    while !ctx.stop.load(Ordering::Acquire) {
        rx_iteration(ctx, worker, driver);
    }
}
