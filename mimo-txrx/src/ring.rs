//! Slot ring: a slab of fixed-size packet slots with a per-slot status table.
//!
//! This is the only storage shared between an I/O worker and the consumer of
//! its output. Ownership of a slot moves through its status cell, never by
//! copying bytes:
//!
//! ```text
//!            try_fill()            commit()
//!   Empty ───────────────> Busy ───────────────> Full
//!     ^                     │                      │
//!     │   (fill dropped)    │                      │ try_take()
//!     └─────────────────────┘                      v
//!     ^                                          Busy
//!     │            (take dropped / release())      │
//!     └────────────────────────────────────────────┘
//! ```
//!
//! Every transition is a compare-exchange with acquire/release ordering, so a
//! reader that observes `Full` also observes every byte the writer stored, and
//! a writer that observes `Empty` cannot race a reader still holding the
//! slot. A slot therefore alternates strictly between filled and released;
//! filling a slot that is not `Empty` fails instead of overwriting it.
//!
//! Both the receive rings (worker fills, compute takes) and the transmit ring
//! (compute fills, worker takes) use this type.

use std::cell::UnsafeCell;
use std::fmt;
use std::slice::ChunksExactMut;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

use crate::packet::{Packet, PacketError, PacketMut};

/// Observable state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SlotStatus {
    /// Free for the producer side.
    Empty = 0,
    /// Holds a packet owned by the consumer side.
    Full = 1,
    /// Claimed by one side that is reading or writing the bytes right now.
    Busy = 2,
}

impl SlotStatus {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Empty,
            1 => Self::Full,
            _ => Self::Busy,
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "empty",
            Self::Full => "full",
            Self::Busy => "busy",
        };
        f.write_str(name)
    }
}

/// Slot claim errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("slot {offset} is out of range for a {capacity}-slot ring")]
    OutOfRange { offset: usize, capacity: usize },
    /// The slot is not in the state the claim needs.
    #[error("slot {offset} is {found}, expected {expected}")]
    Status {
        offset: usize,
        found: SlotStatus,
        expected: SlotStatus,
    },
}

/// Fixed-capacity slab of `capacity` slots of `slot_len` bytes each.
pub struct SlotRing {
    slot_len: usize,
    status: Box<[AtomicU8]>,
    /// Contiguous storage. Never borrowed as a whole; each claim builds a
    /// slice over its own slots only.
    arena: Box<[UnsafeCell<u8>]>,
}

// SAFETY: The arena is only accessed through `FillGuard` and `TakeGuard`.
// A guard exists only after a successful compare-exchange moved its slots to
// `Busy`, so at most one guard covers any slot at a time. The Release store
// that ends a guard pairs with the Acquire in the next claim, ordering the
// byte accesses of successive owners.
unsafe impl Sync for SlotRing {}

impl SlotRing {
    /// Allocates a zeroed ring. Every slot starts `Empty`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` or `slot_len` is zero.
    #[must_use]
    pub fn new(capacity: usize, slot_len: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be greater than 0");
        assert!(slot_len > 0, "slot length must be greater than 0");
        Self {
            slot_len,
            status: (0..capacity).map(|_| AtomicU8::new(SlotStatus::Empty as u8)).collect(),
            arena: (0..capacity * slot_len).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.status.len()
    }

    #[must_use]
    pub const fn slot_len(&self) -> usize {
        self.slot_len
    }

    /// Current status of `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is out of range.
    #[must_use]
    pub fn status(&self, offset: usize) -> SlotStatus {
        SlotStatus::from_u8(self.status[offset].load(Ordering::Acquire))
    }

    /// Number of slots currently `Full`.
    #[must_use]
    pub fn full_count(&self) -> usize {
        self.status
            .iter()
            .filter(|s| s.load(Ordering::Acquire) == SlotStatus::Full as u8)
            .count()
    }

    /// Direct access to a slot while the ring is not shared, e.g. to
    /// pre-populate payloads before handing the ring to workers.
    pub fn slot_mut(&mut self, offset: usize) -> &mut [u8] {
        // SAFETY: `&mut self` rules out any live guard.
        unsafe { self.run_mut(offset, 1) }
    }

    /// Claims `count` consecutive `Empty` slots starting at `offset` for writing.
    ///
    /// Either every slot is claimed or none is.
    ///
    /// # Errors
    ///
    /// [`SlotError::Status`] names the first slot that was not `Empty`;
    /// [`SlotError::OutOfRange`] if the run does not fit in the ring.
    pub fn try_fill(&self, offset: usize, count: usize) -> Result<FillGuard<'_>, SlotError> {
        self.check_range(offset, count)?;
        for i in 0..count {
            if let Err(found) = self.transition(offset + i, SlotStatus::Empty, SlotStatus::Busy) {
                for claimed in offset..offset + i {
                    self.store(claimed, SlotStatus::Empty);
                }
                return Err(SlotError::Status {
                    offset: offset + i,
                    found,
                    expected: SlotStatus::Empty,
                });
            }
        }
        Ok(FillGuard { ring: self, offset, count, committed: false })
    }

    /// Claims a `Full` slot for reading. Dropping the guard releases the slot
    /// back to `Empty`.
    ///
    /// # Errors
    ///
    /// [`SlotError::Status`] if the slot is not `Full`.
    pub fn try_take(&self, offset: usize) -> Result<TakeGuard<'_>, SlotError> {
        self.check_range(offset, 1)?;
        self.transition(offset, SlotStatus::Full, SlotStatus::Busy)
            .map_err(|found| SlotError::Status { offset, found, expected: SlotStatus::Full })?;
        Ok(TakeGuard { ring: self, offset, restore: false })
    }

    fn check_range(&self, offset: usize, count: usize) -> Result<(), SlotError> {
        let capacity = self.capacity();
        if count == 0 || offset >= capacity || capacity - offset < count {
            return Err(SlotError::OutOfRange { offset, capacity });
        }
        Ok(())
    }

    fn transition(&self, offset: usize, from: SlotStatus, to: SlotStatus) -> Result<(), SlotStatus> {
        self.status[offset]
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SlotStatus::from_u8)
    }

    fn store(&self, offset: usize, status: SlotStatus) {
        self.status[offset].store(status as u8, Ordering::Release);
    }

    /// # Safety
    ///
    /// The caller must hold a guard covering every slot in the run.
    unsafe fn run(&self, offset: usize, count: usize) -> &[u8] {
        let cells = &self.arena[offset * self.slot_len..(offset + count) * self.slot_len];
        // SAFETY: layout as below; the guard keeps writers away.
        unsafe { std::slice::from_raw_parts(UnsafeCell::raw_get(cells.as_ptr()), cells.len()) }
    }

    /// # Safety
    ///
    /// The caller must hold a guard covering every slot in the run, and no
    /// other reference into the run may be live.
    #[allow(clippy::mut_from_ref)]
    unsafe fn run_mut(&self, offset: usize, count: usize) -> &mut [u8] {
        let cells = &self.arena[offset * self.slot_len..(offset + count) * self.slot_len];
        // SAFETY: `UnsafeCell<u8>` has the layout of `u8`, and the guard held
        // by the caller makes this the only live reference to these bytes.
        unsafe { std::slice::from_raw_parts_mut(UnsafeCell::raw_get(cells.as_ptr()), cells.len()) }
    }
}

impl fmt::Debug for SlotRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotRing")
            .field("capacity", &self.capacity())
            .field("slot_len", &self.slot_len)
            .field("full", &self.full_count())
            .finish_non_exhaustive()
    }
}

/// Write claim over a run of slots. [`commit`](Self::commit) marks them
/// `Full`; dropping without committing returns them to `Empty`.
pub struct FillGuard<'a> {
    ring: &'a SlotRing,
    offset: usize,
    count: usize,
    committed: bool,
}

impl FillGuard<'_> {
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// All claimed bytes, slot after slot.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: this guard covers the run.
        unsafe { self.ring.run_mut(self.offset, self.count) }
    }

    /// Bytes of the `index`-th claimed slot.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        assert!(index < self.count, "slot index {index} outside claimed run of {}", self.count);
        // SAFETY: this guard covers the run, which contains `offset + index`.
        unsafe { self.ring.run_mut(self.offset + index, 1) }
    }

    pub fn slots_mut(&mut self) -> ChunksExactMut<'_, u8> {
        let slot_len = self.ring.slot_len;
        self.bytes_mut().chunks_exact_mut(slot_len)
    }

    /// Publishes the run: every slot becomes `Full`.
    pub fn commit(mut self) {
        for offset in self.offset..self.offset + self.count {
            self.ring.store(offset, SlotStatus::Full);
        }
        self.committed = true;
    }
}

impl Drop for FillGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            for offset in self.offset..self.offset + self.count {
                self.ring.store(offset, SlotStatus::Empty);
            }
        }
    }
}

/// Read claim over one `Full` slot. Dropping it (or calling
/// [`release`](Self::release)) hands the slot back as `Empty`.
pub struct TakeGuard<'a> {
    ring: &'a SlotRing,
    offset: usize,
    restore: bool,
}

impl TakeGuard<'_> {
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: this guard covers the slot; the shared borrow of `self`
        // keeps `bytes_mut` from handing out an overlapping reference.
        unsafe { self.ring.run(self.offset, 1) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: this guard covers the slot.
        unsafe { self.ring.run_mut(self.offset, 1) }
    }

    /// The slot's packet.
    ///
    /// # Errors
    ///
    /// Fails only if the slot length cannot hold a packet.
    pub fn packet(&self) -> Result<Packet<'_>, PacketError> {
        Packet::parse(self.bytes())
    }

    /// Mutable packet view, e.g. to stamp a header before transmit.
    ///
    /// # Errors
    ///
    /// Fails only if the slot length cannot hold a packet.
    pub fn packet_mut(&mut self) -> Result<PacketMut<'_>, PacketError> {
        PacketMut::over(self.bytes_mut())
    }

    /// Hands the slot back to the producer side.
    pub fn release(self) {}

    /// Ends the claim but leaves the slot `Full` for a later take.
    pub fn keep(mut self) {
        self.restore = true;
    }
}

impl Drop for TakeGuard<'_> {
    fn drop(&mut self) {
        let status = if self.restore { SlotStatus::Full } else { SlotStatus::Empty };
        self.ring.store(self.offset, status);
    }
}
