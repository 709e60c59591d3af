// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Service chains and the flow table that selects them.
//!
//! A chain is an ordered list of `(action, destination)` hops plus two pieces
//! of mutable steering state: a bottleneck bitmap (one bit per chain index,
//! set while the NF at that index is congested) and an opportunistic cache of
//! the instance serving each index, filled in as packets traverse so the
//! backpressure engine can name upstream NFs without a resolver pass.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

mod flow;
mod sc;

pub use flow::{FlowEntry, FlowKey, FlowTable};
pub use sc::{ChainEntry, ChainError, ServiceChain};

pub use pkt::NfAction;
