// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Frame buffers and their steering metadata.
//!
//! A [`Frame`] is an opaque buffer plus an 8-byte metadata sidecar packed
//! into a reserved user word. Frames are owned values: enqueueing one transfers
//! ownership, so a frame can sit in at most one ring at a time and a second
//! release of the same buffer is unrepresentable.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

mod meta;
mod pool;

pub use meta::{FrameMeta, NfAction};
pub use pool::{FramePool, PoolError};

/// Default payload capacity of a pooled frame buffer.
pub const FRAME_CAPACITY: usize = 2048;

/// A frame buffer with its packed steering sidecar.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    /// Packed [`FrameMeta`], mutated in place by the resolver and pipelines.
    user: u64,
    /// RSS-style hash of the frame's 5-tuple, computed once at RX.
    pub flow_hash: u64,
    pub(crate) pool_id: u32,
}

impl Frame {
    /// Unpack the metadata sidecar.
    #[must_use]
    pub fn meta(&self) -> FrameMeta {
        FrameMeta::unpack(self.user)
    }

    /// Pack `meta` back into the sidecar word.
    pub fn set_meta(&mut self, meta: FrameMeta) {
        self.user = meta.pack();
    }

    /// Whether the sidecar's raw action byte names a known action. Dispatch
    /// drops and logs frames that fail this.
    #[must_use]
    pub fn action_is_valid(&self) -> bool {
        NfAction::from_wire((self.user & 0xFF) as u8).is_some()
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replace the payload, truncating to the buffer capacity.
    pub fn set_payload(&mut self, bytes: &[u8]) {
        let take = bytes.len().min(FRAME_CAPACITY);
        self.data.clear();
        self.data.extend_from_slice(&bytes[..take]);
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sidecar_survives_a_pack_unpack_cycle() {
        let pool = FramePool::new("pool", 4);
        let mut frame = pool.take().unwrap();
        frame.set_meta(FrameMeta {
            action: NfAction::ToNf,
            destination: 0x0201,
            src: 7,
            chain_index: 3,
        });
        let meta = frame.meta();
        assert_eq!(meta.action, NfAction::ToNf);
        assert_eq!(meta.destination, 0x0201);
        assert_eq!(meta.src, 7);
        assert_eq!(meta.chain_index, 3);
        pool.put(frame).unwrap();
    }

    #[test]
    fn payload_is_truncated_to_capacity() {
        let pool = FramePool::new("pool", 1);
        let mut frame = pool.take().unwrap();
        frame.set_payload(&vec![0xAB; FRAME_CAPACITY * 2]);
        assert_eq!(frame.payload().len(), FRAME_CAPACITY);
        pool.put(frame).unwrap();
    }
}
