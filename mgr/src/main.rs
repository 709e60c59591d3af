// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]

use clap::Parser;
use config::{MASTER_TICK, NF_RING_SIZE};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use steerd_mgr::args::CmdArgs;
use steerd_mgr::drivers::IdleDriver;
use steerd_mgr::{BootError, BootParams, Manager, boot, tx_slot_range};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const FRAME_POOL_SIZE: usize = 32 * 1024;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_names(true)
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

fn check_cpus(rx: usize, tx: usize) -> Result<(), BootError> {
    let have = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    // RX + TX workers, the master, and the wake thread.
    let need = rx + tx + 2;
    if have < need {
        return Err(BootError::NotEnoughCpus { need, have, rx, tx });
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn spawn_workers(
    manager: &Arc<Manager>,
    driver: &Arc<IdleDriver>,
    rx_workers: usize,
    tx_workers: usize,
    total_nfs: usize,
) -> Result<Vec<std::thread::JoinHandle<()>>, BootError> {
    let mut workers = Vec::new();
    for queue in 0..rx_workers {
        let ctx = Arc::clone(&manager.ctx);
        let driver = Arc::clone(driver);
        workers.push(
            std::thread::Builder::new()
                .name(format!("rx-{queue}"))
                .spawn(move || {
                    let mut worker = steer::Worker::new(queue as u16);
                    steer::rx_loop(&ctx, &mut worker, driver.as_ref());
                })?,
        );
    }
    for index in 0..tx_workers {
        let ctx = Arc::clone(&manager.ctx);
        let driver = Arc::clone(driver);
        let (first, last) = tx_slot_range(tx_workers, index, total_nfs);
        workers.push(
            std::thread::Builder::new()
                .name(format!("tx-{index}"))
                .spawn(move || {
                    let mut worker = steer::Worker::new(index as u16);
                    steer::tx_loop(&ctx, &mut worker, driver.as_ref(), first, last);
                })?,
        );
    }
    Ok(workers)
}

fn run(args: &CmdArgs) -> Result<(), BootError> {
    let rx_workers = usize::from(args.rx_workers);
    let tx_workers = usize::from(args.tx_workers);
    check_cpus(rx_workers, tx_workers)?;

    let manager = Arc::new(boot(BootParams {
        cfg: args.features(),
        portmask: args.portmask,
        default_chain: args.chain_entries(),
        frame_pool_size: FRAME_POOL_SIZE,
        nf_ring_size: NF_RING_SIZE,
    })?);
    info!(
        "manager up: portmask {:#x}, {rx_workers} RX / {tx_workers} TX workers",
        args.portmask
    );

    let stop = Arc::clone(&manager.ctx.stop);
    let shutdown_manager = Arc::clone(&manager);
    ctrlc::set_handler(move || shutdown_manager.shutdown())?;

    let driver = Arc::new(IdleDriver::new(Arc::clone(&manager.ctx.pool)));
    let total_nfs = args.num_nfs.map_or(config::MAX_NFS, usize::from);
    let mut workers = spawn_workers(&manager, &driver, rx_workers, tx_workers, total_nfs)?;

    if args.features().ipc != config::IpcKind::Poll {
        let sink: Box<dyn wake::ShareSink> = if args.features().dynamic_weights {
            Box::new(wake::CgroupSink::new("/sys/fs/cgroup/steerd".into()))
        } else {
            Box::new(wake::NullSink)
        };
        let sched = wake::WakeScheduler::new(Arc::clone(&manager.ctx), sink);
        workers.push(
            std::thread::Builder::new()
                .name("wake".to_string())
                .spawn(move || wake::wake_loop(sched))?,
        );
    }

    // Master loop: admission, liveness, stats, once a second.
    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(MASTER_TICK);
        manager.master_tick();
        println!("{}", manager.render_stats());
    }

    for worker in workers {
        let _ = worker.join();
    }
    info!("manager down");
    Ok(())
}

fn main() {
    init_logging();
    let args = CmdArgs::parse();
    if let Err(e) = run(&args) {
        error!("startup failed: {e}");
        std::process::exit(1);
    }
}
