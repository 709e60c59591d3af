// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use clap::Parser;
use config::{MAX_NFS, MAX_SERVICES};

/// Command-line surface shared by NF binaries.
///
/// Service id 0 is reserved for flow-rule installation and rejected here, as
/// is any instance id outside the descriptor table.
#[derive(Debug, Parser)]
#[command(name = "steerd-nf")]
#[command(about = "A steerd network function worker", long_about = None)]
pub struct NfArgs {
    /// Claim a specific instance id instead of letting the manager assign
    /// one.
    #[arg(short = 'n', long = "instance",
          value_parser = clap::value_parser!(u16).range(1..MAX_NFS as i64))]
    pub instance: Option<u16>,

    /// Service this NF fulfils.
    #[arg(short = 'r', long = "service", required = true,
          value_parser = clap::value_parser!(u16).range(1..MAX_SERVICES as i64))]
    pub service: u16,

    /// Human-readable name shown in the manager's stats.
    #[arg(long, default_value = "nf")]
    pub tag: String,

    /// Core this worker considers itself pinned to.
    #[arg(long, default_value_t = 0)]
    pub core: u16,
}
