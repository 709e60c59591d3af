// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use chain::ChainEntry;
use clap::Parser;
use config::{BackpressureMode, FeatureConfig, IpcKind};
use pkt::NfAction;
use std::str::FromStr;

/// One hop of the default chain on the command line, `action:destination`
/// (e.g. `tonf:1`, `out:0`, `drop`).
#[derive(Debug, Clone, Copy)]
pub struct ChainHopArg(pub ChainEntry);

impl FromStr for ChainHopArg {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (action, destination) = match input.split_once(':') {
            Some((action, dest)) => {
                let destination: u16 = dest
                    .parse()
                    .map_err(|e| format!("bad chain destination {dest:?}: {e}"))?;
                (action, destination)
            }
            None => (input, 0),
        };
        let action = match action {
            "drop" => NfAction::Drop,
            "next" => NfAction::Next,
            "tonf" => NfAction::ToNf,
            "out" => NfAction::Out,
            other => return Err(format!("unknown chain action {other:?}")),
        };
        Ok(Self(ChainEntry {
            action,
            destination,
        }))
    }
}

#[derive(Debug, Parser)]
#[command(name = "steerd")]
#[command(about = "Userspace NF-steering dataplane manager", long_about = None)]
#[allow(clippy::struct_excessive_bools)]
pub struct CmdArgs {
    /// Hex bitmask of enabled ports.
    #[arg(short = 'p', long = "portmask", value_parser = parse_portmask, default_value = "1")]
    pub portmask: u32,

    /// Fixed NF count to split across TX workers; defaults to the whole
    /// descriptor table (dynamic NF mode).
    #[arg(short = 'n', long = "num-nfs",
          value_parser = clap::value_parser!(u16).range(1..=config::MAX_NFS as i64))]
    pub num_nfs: Option<u16>,

    /// RX worker threads (one NIC queue index each).
    #[arg(long = "rx", default_value_t = 1,
          value_parser = clap::value_parser!(u16).range(1..=8))]
    pub rx_workers: u16,

    /// TX worker threads (disjoint NF slot ranges).
    #[arg(long = "tx", default_value_t = 1,
          value_parser = clap::value_parser!(u16).range(1..=8))]
    pub tx_workers: u16,

    /// Default service chain for flows without a table entry.
    #[arg(long = "default-chain", value_delimiter = ',', default_value = "tonf:1")]
    pub default_chain: Vec<ChainHopArg>,

    #[arg(long, default_value_t = BackpressureMode::DropUpstream)]
    pub backpressure: BackpressureMode,

    #[arg(long, default_value_t = IpcKind::Semaphore)]
    pub ipc: IpcKind,

    /// Throttle only the immediate upstream hop.
    #[arg(long)]
    pub hop_by_hop: bool,

    /// Drop marked flows only at the chain ingress.
    #[arg(long)]
    pub drop_only_at_ingress: bool,

    /// Mark ECN CE on frames staged for congested NFs.
    #[arg(long)]
    pub ecn_ce: bool,

    /// Weight scheduler shares by load as well as cost.
    #[arg(long)]
    pub dynamic_weights: bool,

    /// Hold staged batches for congested NFs instead of dropping them.
    #[arg(long)]
    pub hold_on_bottleneck: bool,
}

fn parse_portmask(input: &str) -> Result<u32, String> {
    let raw = input.trim_start_matches("0x");
    let mask = u32::from_str_radix(raw, 16).map_err(|e| format!("bad portmask {input:?}: {e}"))?;
    if mask == 0 {
        return Err("portmask enables no ports".to_string());
    }
    Ok(mask)
}

impl CmdArgs {
    #[must_use]
    pub fn features(&self) -> FeatureConfig {
        FeatureConfig {
            backpressure: self.backpressure,
            hop_by_hop: self.hop_by_hop,
            drop_only_at_ingress: self.drop_only_at_ingress,
            ecn_ce: self.ecn_ce,
            ipc: self.ipc,
            dynamic_weights: self.dynamic_weights,
            hold_on_bottleneck: self.hold_on_bottleneck,
        }
    }

    #[must_use]
    pub fn chain_entries(&self) -> Vec<ChainEntry> {
        self.default_chain.iter().map(|hop| hop.0).collect()
    }
}
