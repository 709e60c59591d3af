// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::ServiceChain;
use ahash::RandomState;
use dashmap::DashMap;
use etherparse::{EtherType, Ethernet2Header, IpNumber, Ipv4Header, TcpHeader, UdpHeader};
use std::hash::BuildHasher;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU16, Ordering};
use tracing::debug;

/// IPv4 5-tuple identifying a flow. Port fields are zero for transports
/// without ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
}

fn hasher_state() -> &'static RandomState {
    use std::sync::OnceLock;
    static HASHER_STATE: OnceLock<RandomState> = OnceLock::new();
    // Fixed seeds: the same flow must hash identically on every thread.
    HASHER_STATE.get_or_init(|| RandomState::with_seeds(0, 0, 0, 0))
}

impl FlowKey {
    /// Extract the 5-tuple from an Ethernet frame. `None` for anything the
    /// steering core does not classify (non-IPv4, truncated headers); such
    /// frames ride the default chain.
    #[must_use]
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let (eth, after_eth) = Ethernet2Header::from_slice(payload).ok()?;
        if eth.ether_type != EtherType::IPV4 {
            return None;
        }
        let (ip, after_ip) = Ipv4Header::from_slice(after_eth).ok()?;
        let (src_port, dst_port) = if ip.protocol == IpNumber::UDP {
            UdpHeader::from_slice(after_ip)
                .map(|(udp, _)| (udp.source_port, udp.destination_port))
                .ok()?
        } else if ip.protocol == IpNumber::TCP {
            TcpHeader::from_slice(after_ip)
                .map(|(tcp, _)| (tcp.source_port, tcp.destination_port))
                .ok()?
        } else {
            (0, 0)
        };
        Some(Self {
            src: Ipv4Addr::from(ip.source),
            dst: Ipv4Addr::from(ip.destination),
            src_port,
            dst_port,
            proto: ip.protocol.0,
        })
    }

    /// RSS-style hash used for instance selection and flow lookup.
    #[must_use]
    pub fn hash64(&self) -> u64 {
        hasher_state().hash_one(self)
    }
}

/// A flow-table entry binding a flow to its chain, plus this flow's share of
/// the congestion marking state: which chain indices this flow marked and the
/// NF that last marked it.
#[derive(Debug)]
pub struct FlowEntry {
    pub chain: Arc<ServiceChain>,
    bottleneck_chain_mask: AtomicU8,
    marked_by_nf: AtomicU16,
}

impl FlowEntry {
    #[must_use]
    pub fn new(chain: Arc<ServiceChain>) -> Self {
        Self {
            chain,
            bottleneck_chain_mask: AtomicU8::new(0),
            marked_by_nf: AtomicU16::new(0),
        }
    }

    pub fn record_mark(&self, chain_index: u8, marked_by: u16) {
        self.bottleneck_chain_mask
            .fetch_or(1 << chain_index, Ordering::AcqRel);
        self.marked_by_nf.store(marked_by, Ordering::Relaxed);
    }

    pub fn clear_mark(&self, chain_index: u8) {
        self.bottleneck_chain_mask
            .fetch_and(!(1 << chain_index), Ordering::AcqRel);
    }

    #[must_use]
    pub fn marks(&self) -> u8 {
        self.bottleneck_chain_mask.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn marked_by(&self) -> Option<u16> {
        match self.marked_by_nf.load(Ordering::Relaxed) {
            0 => None,
            nf => Some(nf),
        }
    }
}

/// Read-mostly flow table. The only writer is the flow-installer; steering
/// workers just look flows up.
pub struct FlowTable {
    table: DashMap<FlowKey, Arc<FlowEntry>, RandomState>,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self {
            table: DashMap::with_hasher(hasher_state().clone()),
        }
    }
}

impl FlowTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `key` to `chain`, returning the entry now in place.
    pub fn insert(&self, key: FlowKey, chain: Arc<ServiceChain>) -> Arc<FlowEntry> {
        let entry = Arc::new(FlowEntry::new(chain));
        debug!("flow table insert for {key:?}");
        self.table.insert(key, Arc::clone(&entry));
        entry
    }

    #[must_use]
    pub fn get(&self, key: &FlowKey) -> Option<Arc<FlowEntry>> {
        self.table.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Arc<FlowEntry>> {
        self.table.remove(key).map(|(_, entry)| entry)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
