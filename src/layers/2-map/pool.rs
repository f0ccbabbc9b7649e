// SPDX-License-Identifier: MPL-2.0

//! The spare pool.
//!
//! An ordered collection of spare devices. Order matters twice: first-fit
//! allocation walks it front to back, and the position of a spare is the
//! `spare_index` remap entries persist, so indices must stay stable for
//! the lifetime of the entries that use them.

use super::{alloc::SpareAlloc, table::RemapTable};
use crate::{
    layers::{
        bio::BlockSet,
        meta::{PlacementPlan, SpareDesc},
    },
    os::RwLock,
    prelude::*,
};

/// One spare device: its disk, its copy layout and its allocator.
pub struct SpareDevice<D> {
    disk: D,
    uuid: [u8; 16],
    plan: PlacementPlan,
    alloc: SpareAlloc,
}

impl<D> core::fmt::Debug for SpareDevice<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpareDevice").finish_non_exhaustive()
    }
}

impl<D: BlockSet> SpareDevice<D> {
    /// Adopts a disk as a spare holding record images of `record_sectors`
    /// sectors, planning its metadata placement and reserving the regions.
    pub fn new(disk: D, record_sectors: Sector, uuid: [u8; 16]) -> Result<Self> {
        let capacity = disk.nsectors();
        let plan = PlacementPlan::plan(capacity, record_sectors)?;
        let alloc = SpareAlloc::new(capacity, plan.reserved_regions());
        Ok(Self {
            disk,
            uuid,
            plan,
            alloc,
        })
    }

    /// The underlying disk.
    pub fn disk(&self) -> &D {
        &self.disk
    }

    /// The UUID the spare was adopted under.
    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    /// The metadata copy layout of this spare.
    pub fn plan(&self) -> &PlacementPlan {
        &self.plan
    }

    /// The sector allocator of this spare.
    pub fn alloc(&self) -> &SpareAlloc {
        &self.alloc
    }

    /// Capacity in sectors.
    pub fn capacity(&self) -> Sector {
        self.alloc.capacity()
    }

    /// This spare's line in the pool descriptor.
    pub fn descriptor(&self) -> SpareDesc {
        SpareDesc {
            capacity: self.capacity(),
            uuid: self.uuid,
        }
    }
}

/// The ordered spare devices of one remap device.
pub struct SparePool<D> {
    spares: RwLock<Vec<Arc<SpareDevice<D>>>>,
}

impl<D: BlockSet> SparePool<D> {
    /// A pool starting with its first spare.
    pub fn new(first: SpareDevice<D>) -> Self {
        Self {
            spares: RwLock::new(vec![Arc::new(first)]),
        }
    }

    /// Appends a spare, returning its pool index.
    pub fn add(&self, spare: SpareDevice<D>) -> Result<usize> {
        let mut spares = self.spares.write();
        if spares.len() >= crate::layers::meta::MAX_POOL_SPARES {
            return_errno_with_msg!(InvalidArgs, "spare pool is full");
        }
        spares.push(Arc::new(spare));
        Ok(spares.len() - 1)
    }

    /// Drops the spare at `index`.
    ///
    /// Refused while any remap entry targets it, for the last remaining
    /// spare, and for interior spares (later indices are persisted inside
    /// remap entries and must not shift).
    pub fn remove(&self, index: usize, table: &RemapTable) -> Result<()> {
        let mut spares = self.spares.write();
        if index >= spares.len() {
            return_errno_with_msg!(InvalidArgs, "no spare at this index");
        }
        if spares.len() == 1 {
            return_errno_with_msg!(InvalidArgs, "cannot remove the last spare");
        }
        if index != spares.len() - 1 {
            return_errno_with_msg!(EntryInUse, "only the newest spare can be removed");
        }
        if table.any_on_spare(index as u16) {
            return_errno_with_msg!(EntryInUse, "spare still holds remapped sectors");
        }
        spares.pop();
        Ok(())
    }

    /// First-fit allocation across the pool, in insertion order.
    pub fn allocate(&self) -> Result<(u16, Sector)> {
        let spares = self.spares.read();
        for (index, spare) in spares.iter().enumerate() {
            match spare.alloc().allocate() {
                Ok(ssa) => return Ok((index as u16, ssa)),
                Err(e) if e.errno() == AllocatorExhausted => continue,
                Err(e) => return Err(e),
            }
        }
        return_errno_with_msg!(NoSpaceForRemap, "every spare in the pool is exhausted");
    }

    /// The spare at `index`.
    pub fn get(&self, index: u16) -> Result<Arc<SpareDevice<D>>> {
        self.spares
            .read()
            .get(index as usize)
            .cloned()
            .ok_or(Error::with_msg(InvalidArgs, "no spare at this index"))
    }

    /// A snapshot of the pool, in order.
    pub fn snapshot(&self) -> Vec<Arc<SpareDevice<D>>> {
        self.spares.read().clone()
    }

    /// The pool descriptor for persistence.
    pub fn descriptors(&self) -> Vec<SpareDesc> {
        self.spares.read().iter().map(|s| s.descriptor()).collect()
    }

    /// The number of spares.
    pub fn len(&self) -> usize {
        self.spares.read().len()
    }

    /// Sectors available for remaps across the pool.
    pub fn total_capacity(&self) -> u64 {
        self.spares
            .read()
            .iter()
            .map(|s| s.alloc().free_sectors() + s.alloc().used_sectors())
            .sum()
    }

    /// Sectors handed out to remaps across the pool.
    pub fn total_used(&self) -> u64 {
        self.spares
            .read()
            .iter()
            .map(|s| s.alloc().used_sectors())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Errno,
        layers::{
            bio::MemDisk,
            meta::{RemapEntry, RemapFlags},
        },
    };

    // A 14-sector spare stores two-sector records in five copies and keeps
    // exactly four allocatable sectors: 2, 5, 8 and 11.
    const TINY_CAPACITY: u64 = 14;
    const TINY_RECORD_SECTORS: u64 = 2;

    fn tiny_spare(uuid_byte: u8) -> SpareDevice<MemDisk> {
        let disk = MemDisk::create(TINY_CAPACITY).unwrap();
        SpareDevice::new(disk, TINY_RECORD_SECTORS, [uuid_byte; 16]).unwrap()
    }

    fn entry(lsa: u64, ssa: u64, spare_index: u16) -> RemapEntry {
        RemapEntry {
            lsa,
            ssa,
            spare_index,
            flags: RemapFlags::AUTO,
            created_at: 0,
            hit_count: 0,
        }
    }

    #[test]
    fn tiny_spare_has_four_slots() {
        let spare = tiny_spare(1);
        assert_eq!(spare.alloc().free_sectors(), 4);
        assert_eq!(spare.plan().offsets().len(), 5);
    }

    #[test]
    fn first_fit_spills_to_the_second_spare() {
        let pool = SparePool::new(tiny_spare(1));
        for _ in 0..4 {
            let (index, _) = pool.allocate().unwrap();
            assert_eq!(index, 0);
        }
        let err = pool.allocate().unwrap_err();
        assert_eq!(err.errno(), Errno::NoSpaceForRemap);

        assert_eq!(pool.add(tiny_spare(2)).unwrap(), 1);
        let (index, ssa) = pool.allocate().unwrap();
        assert_eq!(index, 1);
        assert!(!pool.get(1).unwrap().alloc().in_reserved(ssa));
    }

    #[test]
    fn remove_guards() {
        let pool = SparePool::new(tiny_spare(1));
        let table = RemapTable::new(64).unwrap();

        // The last spare never leaves.
        assert!(pool.remove(0, &table).is_err());

        pool.add(tiny_spare(2)).unwrap();
        let (index, ssa) = {
            let spare = pool.get(1).unwrap();
            let ssa = spare.alloc().allocate().unwrap();
            (1u16, ssa)
        };
        table.insert(entry(77, ssa, index)).unwrap();
        assert_eq!(
            pool.remove(1, &table).unwrap_err().errno(),
            Errno::EntryInUse
        );

        // Gone from the table, the spare can leave; the pool is back to one.
        table.remove(77);
        pool.remove(1, &table).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn interior_removal_is_refused() {
        let pool = SparePool::new(tiny_spare(1));
        pool.add(tiny_spare(2)).unwrap();
        pool.add(tiny_spare(3)).unwrap();
        let table = RemapTable::new(64).unwrap();
        assert_eq!(
            pool.remove(1, &table).unwrap_err().errno(),
            Errno::EntryInUse
        );
        pool.remove(2, &table).unwrap();
    }

    #[test]
    fn rejects_spares_below_the_minimum() {
        let disk = MemDisk::create(2).unwrap();
        let err = SpareDevice::new(disk, TINY_RECORD_SECTORS, [9; 16]).unwrap_err();
        assert_eq!(err.errno(), Errno::SpareTooSmall);
    }
}
