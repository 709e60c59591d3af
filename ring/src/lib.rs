// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Bounded batch rings connecting the manager and NF workers.
//!
//! The algorithm is the classic two-stage head/tail reservation: producers
//! race on `prod_head`, fill their reserved slots, then publish in order via
//! `prod_tail` (consumers mirror this). Bulk enqueue is all-or-nothing and
//! distinguishes a full ring from a watermark rejection because the
//! backpressure engine reacts differently to the two.

#![deny(clippy::all, clippy::pedantic, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use arrayvec::ArrayVec;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

pub mod err;

/// Parameters for a new ring.
#[derive(Debug, Clone)]
pub struct Params {
    pub name: String,
    /// Slot count; must be a power of two.
    pub size: usize,
    /// High/low occupancy watermarks; `None` disables watermark admission.
    pub watermarks: Option<(usize, usize)>,
}

impl Params {
    pub const MAX_NAME_LENGTH: usize = 127;

    fn validate(self) -> Result<Self, err::InvalidArgument> {
        if !self.size.is_power_of_two() || self.size == 0 {
            return Err(err::InvalidArgument::SizeNotPowerOfTwo(self));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(err::InvalidArgument::IllegalCharacters(self));
        }
        if self.name.len() > Params::MAX_NAME_LENGTH {
            return Err(err::InvalidArgument::NameTooLong(self));
        }
        if let Some((high, low)) = self.watermarks {
            if high > self.size || low >= high {
                return Err(err::InvalidArgument::BadWatermarks(self));
            }
        }
        Ok(self)
    }
}

/// Rejected bulk enqueue; the caller keeps the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    /// Not enough free slots for the whole batch (ENOBUFS analogue).
    #[error("ring full")]
    Full,
    /// Occupancy at or above the high watermark (EDQUOT analogue).
    #[error("ring over high watermark")]
    OverWatermark,
}

struct Slot<T>(UnsafeCell<MaybeUninit<T>>);

/// A bounded MPMC ring of `T`.
pub struct Ring<T> {
    name: String,
    mask: usize,
    capacity: usize,
    high_water: usize,
    low_water: usize,
    slots: Box<[Slot<T>]>,
    prod_head: AtomicUsize,
    prod_tail: AtomicUsize,
    cons_head: AtomicUsize,
    cons_tail: AtomicUsize,
}

// Slots are only touched between a successful head reservation and the
// matching tail publication, which hands exclusive access to one thread.
#[allow(unsafe_code)]
unsafe impl<T: Send> Send for Ring<T> {}
#[allow(unsafe_code)]
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Create a ring from validated parameters.
    ///
    /// # Errors
    ///
    /// Fails on a non-power-of-two size, an illegal name, or inverted
    /// watermarks.
    pub fn new(params: Params) -> Result<Self, err::InvalidArgument> {
        let params = params.validate()?;
        let (high_water, low_water) = params.watermarks.unwrap_or((params.size, 0));
        let slots = (0..params.size)
            .map(|_| Slot(UnsafeCell::new(MaybeUninit::uninit())))
            .collect();
        Ok(Self {
            name: params.name,
            mask: params.size - 1,
            capacity: params.size,
            high_water,
            low_water,
            slots,
            prod_head: AtomicUsize::new(0),
            prod_tail: AtomicUsize::new(0),
            cons_head: AtomicUsize::new(0),
            cons_tail: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current occupancy. Racy by nature; callers tolerate staleness.
    #[must_use]
    pub fn count(&self) -> usize {
        self.prod_tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.cons_tail.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Occupancy has drained under the low watermark (hysteresis clear point).
    #[must_use]
    pub fn below_low_water(&self) -> bool {
        self.count() < self.low_water
    }

    /// Reserve `n` producer slots, honouring watermark admission.
    fn reserve_prod(&self, n: usize) -> Result<usize, EnqueueError> {
        loop {
            let head = self.prod_head.load(Ordering::Acquire);
            let tail = self.cons_tail.load(Ordering::Acquire);
            let used = head.wrapping_sub(tail);
            if self.capacity - used < n {
                return Err(EnqueueError::Full);
            }
            if used >= self.high_water {
                return Err(EnqueueError::OverWatermark);
            }
            if self
                .prod_head
                .compare_exchange_weak(
                    head,
                    head.wrapping_add(n),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(head);
            }
        }
    }

    fn publish(tail: &AtomicUsize, from: usize, to: usize) {
        // Earlier reservations publish first so slots become visible in order.
        while tail.load(Ordering::Acquire) != from {
            core::hint::spin_loop();
        }
        tail.store(to, Ordering::Release);
    }

    /// Enqueue a whole batch or nothing.
    ///
    /// On success the batch is drained into the ring. On failure the batch is
    /// left untouched: [`EnqueueError::Full`] means there was no room,
    /// [`EnqueueError::OverWatermark`] means the ring is congested past its
    /// high watermark and admission is suspended until it drains.
    ///
    /// # Errors
    ///
    /// See above; both variants leave ownership with the caller.
    pub fn enqueue_bulk<const N: usize>(
        &self,
        batch: &mut ArrayVec<T, N>,
    ) -> Result<(), EnqueueError> {
        let n = batch.len();
        if n == 0 {
            return Ok(());
        }
        let head = self.reserve_prod(n)?;
        for (i, item) in batch.drain(..).enumerate() {
            let slot = &self.slots[head.wrapping_add(i) & self.mask];
            #[allow(unsafe_code)]
            // Exclusive: this range was reserved above and not yet published.
            unsafe {
                (*slot.0.get()).write(item);
            }
        }
        Self::publish(&self.prod_tail, head, head.wrapping_add(n));
        Ok(())
    }

    /// Enqueue one item, returning it on rejection.
    ///
    /// # Errors
    ///
    /// Same admission rules as [`Ring::enqueue_bulk`].
    pub fn enqueue(&self, item: T) -> Result<(), (T, EnqueueError)> {
        match self.reserve_prod(1) {
            Ok(head) => {
                let slot = &self.slots[head & self.mask];
                #[allow(unsafe_code)]
                unsafe {
                    (*slot.0.get()).write(item);
                }
                Self::publish(&self.prod_tail, head, head.wrapping_add(1));
                Ok(())
            }
            Err(e) => Err((item, e)),
        }
    }

    fn reserve_cons(&self, want: usize, all_or_nothing: bool) -> Option<(usize, usize)> {
        loop {
            let head = self.cons_head.load(Ordering::Acquire);
            let tail = self.prod_tail.load(Ordering::Acquire);
            let available = tail.wrapping_sub(head);
            let n = if all_or_nothing {
                if available < want {
                    return None;
                }
                want
            } else {
                want.min(available)
            };
            if n == 0 {
                return None;
            }
            if self
                .cons_head
                .compare_exchange_weak(
                    head,
                    head.wrapping_add(n),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some((head, n));
            }
        }
    }

    fn read_reserved<const N: usize>(&self, head: usize, n: usize, out: &mut ArrayVec<T, N>) {
        for i in 0..n {
            let slot = &self.slots[head.wrapping_add(i) & self.mask];
            #[allow(unsafe_code)]
            // Exclusive: this range was reserved above and not yet published.
            let item = unsafe { (*slot.0.get()).assume_init_read() };
            // Reserved n <= out capacity, checked by callers.
            let _ = out.try_push(item);
        }
        Self::publish(&self.cons_tail, head, head.wrapping_add(n));
    }

    /// Dequeue exactly `want` items or none at all.
    pub fn dequeue_bulk<const N: usize>(&self, out: &mut ArrayVec<T, N>, want: usize) -> usize {
        let want = want.min(out.remaining_capacity());
        match self.reserve_cons(want, true) {
            Some((head, n)) => {
                self.read_reserved(head, n, out);
                n
            }
            None => 0,
        }
    }

    /// Dequeue up to `want` items, taking whatever is available.
    pub fn dequeue_burst<const N: usize>(&self, out: &mut ArrayVec<T, N>, want: usize) -> usize {
        let want = want.min(out.remaining_capacity());
        match self.reserve_cons(want, false) {
            Some((head, n)) => {
                self.read_reserved(head, n, out);
                n
            }
            None => 0,
        }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let head = self.cons_tail.load(Ordering::Acquire);
        let tail = self.prod_tail.load(Ordering::Acquire);
        let mut at = head;
        while at != tail {
            let slot = &self.slots[at & self.mask];
            #[allow(unsafe_code)]
            // &mut self: no concurrent access remains.
            unsafe {
                (*slot.0.get()).assume_init_drop();
            }
            at = at.wrapping_add(1);
        }
    }
}

impl<T> std::fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("count", &self.count())
            .field("high_water", &self.high_water)
            .field("low_water", &self.low_water)
            .finish()
    }
}
