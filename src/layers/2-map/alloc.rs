// SPDX-License-Identifier: MPL-2.0

//! Spare sector allocation.
//!
//! Each spare device carries one bitmap with a bit per sector; a set bit
//! means the sector is taken, either by a metadata reservation or by
//! exactly one remap entry. Allocation hands out the lowest clear bit and
//! only ever runs on the error path or behind operator commands, so a
//! single mutex over the bitmap is enough; the hot path never looks here.

use core::{
    ops::Range,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use crate::{os::Mutex, prelude::*, util::BitMap};

/// The sector allocator of one spare device.
pub struct SpareAlloc {
    bitmap: Mutex<BitMap>,
    next_avail: AtomicUsize,
    capacity: Sector,
    reserved: Vec<Range<Sector>>,
    used: AtomicU64,
}

impl SpareAlloc {
    /// Creates an allocator for `capacity` sectors with the metadata
    /// regions pre-reserved.
    pub fn new(capacity: Sector, reserved: Vec<Range<Sector>>) -> Self {
        let mut bitmap = BitMap::repeat(false, capacity as usize);
        for region in &reserved {
            bitmap.set_range(region.start as usize..region.end as usize);
        }
        Self {
            bitmap: Mutex::new(bitmap),
            next_avail: AtomicUsize::new(0),
            capacity,
            reserved,
            used: AtomicU64::new(0),
        }
    }

    /// Claims the lowest free sector.
    pub fn allocate(&self) -> Result<Sector> {
        let mut bitmap = self.bitmap.lock();
        let next_avail = self.next_avail.load(Ordering::Acquire);

        let ssa = if next_avail < bitmap.len() {
            bitmap.first_zero(next_avail).or_else(|| bitmap.first_zero(0))
        } else {
            bitmap.first_zero(0)
        };
        let Some(ssa) = ssa else {
            return_errno_with_msg!(AllocatorExhausted, "spare device has no free sector");
        };
        bitmap.set_bit(ssa);

        self.next_avail.store(ssa + 1, Ordering::Release);
        self.used.fetch_add(1, Ordering::Relaxed);
        Ok(ssa as Sector)
    }

    /// Releases a sector. Device-destroy only; live entries never free.
    pub fn free(&self, ssa: Sector) {
        let mut bitmap = self.bitmap.lock();
        if self.in_reserved(ssa) || !bitmap.test_bit(ssa as usize) {
            return;
        }
        bitmap.clear_bit(ssa as usize);
        self.used.fetch_sub(1, Ordering::Relaxed);
    }

    /// Re-claims a specific sector while rebuilding state from metadata.
    pub fn restore(&self, ssa: Sector) -> Result<()> {
        if ssa >= self.capacity {
            return_errno_with_msg!(MetadataCorrupt, "restored sector beyond the spare");
        }
        if self.in_reserved(ssa) {
            return_errno_with_msg!(MetadataCorrupt, "restored sector inside a metadata region");
        }
        let mut bitmap = self.bitmap.lock();
        if bitmap.test_bit(ssa as usize) {
            return_errno_with_msg!(MetadataCorrupt, "restored sector claimed twice");
        }
        bitmap.set_bit(ssa as usize);
        self.used.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Whether the sector is taken, by a remap or a reservation.
    pub fn is_allocated(&self, ssa: Sector) -> bool {
        self.bitmap.lock().test_bit(ssa as usize)
    }

    /// Whether the sector lies inside a metadata reservation.
    pub fn in_reserved(&self, ssa: Sector) -> bool {
        self.reserved.iter().any(|r| r.contains(&ssa))
    }

    /// The spare's total size in sectors.
    pub fn capacity(&self) -> Sector {
        self.capacity
    }

    /// Sectors handed out to remap entries.
    pub fn used_sectors(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Sectors still available for new remaps.
    pub fn free_sectors(&self) -> u64 {
        let reserved: u64 = self.reserved.iter().map(|r| r.end - r.start).sum();
        self.capacity - reserved - self.used_sectors()
    }
}
