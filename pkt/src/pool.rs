// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::{FRAME_CAPACITY, Frame, FrameMeta};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A frame from another pool was returned here. Frame accounting is
    /// corrupt; treated as fatal by callers.
    #[error("pool {pool:?} received a frame owned by pool id {frame_pool}")]
    ForeignFrame { pool: String, frame_pool: u32 },
    /// More frames returned than were ever taken.
    #[error("pool {0:?} over-returned: free count exceeds capacity")]
    OverReturn(String),
}

/// Preallocated pool of frame buffers.
///
/// Take transfers ownership out, put transfers it back; the pool verifies the
/// buffer is its own and that it never holds more buffers than it was born
/// with, which is how a conservation bug surfaces.
#[derive(Debug)]
pub struct FramePool {
    name: String,
    id: u32,
    capacity: usize,
    free: Mutex<Vec<Frame>>,
}

impl FramePool {
    #[must_use]
    pub fn new(name: &str, capacity: usize) -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let free = (0..capacity)
            .map(|_| Frame {
                data: Vec::with_capacity(FRAME_CAPACITY),
                user: 0,
                flow_hash: 0,
                pool_id: id,
            })
            .collect();
        Self {
            name: name.to_string(),
            id,
            capacity,
            free: Mutex::new(free),
        }
    }

    /// Take a frame, or `None` when the pool is exhausted.
    #[must_use]
    pub fn take(&self) -> Option<Frame> {
        self.free.lock().pop()
    }

    /// Return a frame to the pool.
    ///
    /// # Errors
    ///
    /// Fails on a frame from a different pool or when the pool would exceed
    /// its capacity; both indicate broken frame accounting.
    pub fn put(&self, mut frame: Frame) -> Result<(), PoolError> {
        if frame.pool_id != self.id {
            return Err(PoolError::ForeignFrame {
                pool: self.name.clone(),
                frame_pool: frame.pool_id,
            });
        }
        frame.data.clear();
        frame.set_meta(FrameMeta::default());
        frame.flow_hash = 0;
        let mut free = self.free.lock();
        if free.len() >= self.capacity {
            return Err(PoolError::OverReturn(self.name.clone()));
        }
        free.push(frame);
        Ok(())
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently out of the pool.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.capacity - self.free.lock().len()
    }
}
