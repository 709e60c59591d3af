// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Canonical names of the objects shared between the manager and NFs.
//!
//! NFs find their rings, the frame pool, and the submission queue by these
//! names; the manager creates them under the same names at boot.

/// Frame buffer pool.
pub const FRAME_POOL: &str = "MProc_pktmbuf_pool";
/// Pool of reusable NF info records.
pub const NF_INFO_POOL: &str = "NF_INFO_MEMPOOL";
/// Queue on which NFs submit info records for admission and teardown.
pub const NF_INFO_QUEUE: &str = "NF_INFO_QUEUE";
/// Port table memzone.
pub const PORT_INFO: &str = "MProc_port_info";
/// NF descriptor table memzone.
pub const CLIENT_INFO: &str = "MProc_client_info";
/// Default service chain memzone.
pub const DEFAULT_CHAIN: &str = "MProc_scp_info";
/// Flow table memzone.
pub const FLOW_TABLE: &str = "MProc_ftp_info";

/// RX ring of the NF with the given instance id.
#[must_use]
pub fn nf_rx_ring(instance: u16) -> String {
    format!("MProc_Client_{instance}_RX")
}

/// TX ring of the NF with the given instance id.
#[must_use]
pub fn nf_tx_ring(instance: u16) -> String {
    format!("MProc_Client_{instance}_TX")
}

/// Wake primitive of the NF with the given instance id.
#[must_use]
pub fn nf_wake(instance: u16) -> String {
    format!("MProc_Client_{instance}_SEM")
}
