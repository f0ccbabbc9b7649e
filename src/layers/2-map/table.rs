// SPDX-License-Identifier: MPL-2.0

//! The remap table.
//!
//! A chained hash table from logical sector to remap entry, tuned for one
//! question asked on every user I/O: "is anything remapped at all?". The
//! `active_count` atomic answers it with a single acquire load, so a device
//! with no remaps never touches the buckets. Inserts publish the entry
//! under the writer lock before the release increment, which pairs with
//! the acquire load in `lookup`.

use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashSet;

use crate::{
    layers::meta::{RemapEntry, RemapFlags},
    os::RwLock,
    prelude::*,
};

/// The smallest bucket count the table ever uses.
pub const MIN_BUCKETS: usize = 64;

/// Grow when `active * 100 / buckets` exceeds this.
const LOAD_HIGH: u64 = 150;
/// Shrink when `active * 100 / buckets` falls below this.
const LOAD_LOW: u64 = 50;

struct Buckets {
    slots: Vec<Vec<RemapEntry>>,
    // Secondary uniqueness index over (spare_index, ssa).
    taken: HashSet<(u16, Sector)>,
}

impl Buckets {
    fn slot_of(&self, lsa: Sector) -> usize {
        (mix64(lsa) & (self.slots.len() as u64 - 1)) as usize
    }

    fn rehash(&mut self, new_len: usize) {
        let mut new_slots: Vec<Vec<RemapEntry>> = (0..new_len).map(|_| Vec::new()).collect();
        for slot in self.slots.drain(..) {
            for entry in slot {
                let index = (mix64(entry.lsa) & (new_len as u64 - 1)) as usize;
                new_slots[index].push(entry);
            }
        }
        self.slots = new_slots;
    }

    fn resize_if_needed(&mut self, active: u64) {
        let len = self.slots.len() as u64;
        let load_scaled = active * 100 / len;
        if load_scaled > LOAD_HIGH {
            self.rehash(self.slots.len() * 2);
        } else if load_scaled < LOAD_LOW && self.slots.len() > MIN_BUCKETS {
            self.rehash(self.slots.len() / 2);
        }
    }
}

/// The logical-to-spare sector index of one remap device.
pub struct RemapTable {
    buckets: RwLock<Buckets>,
    active_count: AtomicU64,
    // Counts bucket walks; stays zero while the table is empty.
    traversals: AtomicU64,
}

impl RemapTable {
    /// Creates an empty table with `initial_buckets` hash buckets.
    pub fn new(initial_buckets: usize) -> Result<Self> {
        if !initial_buckets.is_power_of_two() || initial_buckets < MIN_BUCKETS {
            return_errno_with_msg!(InvalidArgs, "bucket count must be a power of two >= 64");
        }
        Ok(Self {
            buckets: RwLock::new(Buckets {
                slots: (0..initial_buckets).map(|_| Vec::new()).collect(),
                taken: HashSet::new(),
            }),
            active_count: AtomicU64::new(0),
            traversals: AtomicU64::new(0),
        })
    }

    /// The hot-path query: where does `lsa` live now?
    ///
    /// The empty case costs one atomic load and a predicted branch; the
    /// hash store is only consulted while remaps exist.
    #[inline]
    pub fn lookup(&self, lsa: Sector) -> Option<(Sector, u16)> {
        if self.active_count.load(Ordering::Acquire) == 0 {
            return None;
        }
        self.traversals.fetch_add(1, Ordering::Relaxed);
        let buckets = self.buckets.read();
        let slot = &buckets.slots[buckets.slot_of(lsa)];
        slot.iter()
            .find(|e| e.lsa == lsa)
            .map(|e| (e.ssa, e.spare_index))
    }

    /// Whether no remap is installed, by the same load `lookup` uses.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active_count.load(Ordering::Acquire) == 0
    }

    /// Installs a new entry.
    ///
    /// Both the logical sector and the `(spare, ssa)` target must be
    /// unused; the entry is visible to `lookup` as soon as this returns.
    pub fn insert(&self, entry: RemapEntry) -> Result<()> {
        let mut buckets = self.buckets.write();
        let index = buckets.slot_of(entry.lsa);
        if buckets.slots[index].iter().any(|e| e.lsa == entry.lsa) {
            return_errno_with_msg!(DuplicateRemap, "logical sector is already remapped");
        }
        if !buckets.taken.insert((entry.spare_index, entry.ssa)) {
            return_errno_with_msg!(DuplicateRemap, "spare sector is already a remap target");
        }
        buckets.slots[index].push(entry);
        let active = self.active_count.fetch_add(1, Ordering::Release) + 1;
        buckets.resize_if_needed(active);
        Ok(())
    }

    /// Removes the entry for `lsa`, if any.
    ///
    /// Operator and shutdown use only; the freed spare sector remains
    /// reserved by the allocator.
    pub fn remove(&self, lsa: Sector) -> Option<RemapEntry> {
        let mut buckets = self.buckets.write();
        let index = buckets.slot_of(lsa);
        let pos = buckets.slots[index].iter().position(|e| e.lsa == lsa)?;
        let entry = buckets.slots[index].swap_remove(pos);
        buckets.taken.remove(&(entry.spare_index, entry.ssa));
        let active = self.active_count.fetch_sub(1, Ordering::Release) - 1;
        buckets.resize_if_needed(active);
        Some(entry)
    }

    /// Visits every entry under the reader lock.
    pub fn for_each(&self, mut f: impl FnMut(&RemapEntry)) {
        let buckets = self.buckets.read();
        for slot in &buckets.slots {
            for entry in slot {
                f(entry);
            }
        }
    }

    /// Clones the whole table, for persistence snapshots.
    pub fn entries(&self) -> Vec<RemapEntry> {
        let mut out = Vec::with_capacity(self.len() as usize);
        self.for_each(|e| out.push(*e));
        out
    }

    /// Whether any entry targets the given spare device.
    pub fn any_on_spare(&self, spare_index: u16) -> bool {
        let buckets = self.buckets.read();
        buckets.taken.iter().any(|&(index, _)| index == spare_index)
    }

    /// The number of installed entries.
    pub fn len(&self) -> u64 {
        self.active_count.load(Ordering::Acquire)
    }

    /// The current bucket count.
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().slots.len()
    }

    /// How many lookups walked a bucket since creation.
    pub fn traversals(&self) -> u64 {
        self.traversals.load(Ordering::Relaxed)
    }

    /// How auto and manual entries split, for the status line.
    pub fn count_by_origin(&self) -> (u64, u64) {
        let mut auto = 0;
        let mut manual = 0;
        self.for_each(|e| {
            if e.flags.contains(RemapFlags::AUTO) {
                auto += 1;
            } else {
                manual += 1;
            }
        });
        (auto, manual)
    }
}

/// A 64-bit avalanche mix; every input bit disturbs every output bit.
#[inline]
fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
