// SPDX-License-Identifier: MPL-2.0

//! Writing, recovering and repairing the metadata copy set.
//!
//! The store owns the flush protocol: snapshot the in-memory state, bump
//! the sequence number, then write every planned copy on every spare. A
//! flush succeeds if at least one copy lands durably; stale or damaged
//! copies are brought back in line by `repair` after recovery picks the
//! winning record.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{
    placement::{PlacementPlan, GEOMETRIC_OFFSETS},
    record::{record_size_for, DecodedCopy, DeviceIdentity, MetaRecord, RemapEntry, SpareDesc},
};
use crate::{
    layers::bio::{BlockSet, Buf},
    os::Mutex,
    prelude::*,
};

/// Where one spare device keeps its metadata copies.
pub struct FlushSite<'a, D> {
    /// The spare's disk.
    pub disk: &'a D,
    /// The copy layout planned for this spare.
    pub plan: &'a PlacementPlan,
    /// The spare's capacity in sectors.
    pub capacity: Sector,
}

/// The persistence manager of one remap device.
pub struct MetaStore {
    identity: DeviceIdentity,
    created_at: u64,
    sequence: AtomicU64,
    dirty: AtomicBool,
    // Serializes flushes; concurrent triggers coalesce behind the holder.
    flush_lock: Mutex<()>,
}

impl MetaStore {
    /// A store for a freshly formatted device. The state starts dirty so
    /// the first flush writes an initial record.
    pub fn format(identity: DeviceIdentity, created_at: u64) -> Self {
        Self {
            identity,
            created_at,
            sequence: AtomicU64::new(0),
            dirty: AtomicBool::new(true),
            flush_lock: Mutex::new(()),
        }
    }

    /// A store resuming from a recovered record.
    pub fn open(record: &MetaRecord) -> Self {
        Self {
            identity: record.identity.clone(),
            created_at: record.created_at,
            sequence: AtomicU64::new(record.sequence),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        }
    }

    /// The identity every record written by this store carries.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// The current in-memory sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Records that in-memory state has diverged from disk.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Whether a flush is owed.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Runs the flush protocol.
    ///
    /// `snapshot` is called with the flush serialized to clone the pool
    /// descriptor and the remap table. Returns `(written, planned)` copy
    /// counts; the flush fails only when no copy at all could be written,
    /// in which case the state is dirty again.
    pub fn flush<D, F>(&self, snapshot: F, sites: &[FlushSite<'_, D>]) -> Result<(usize, usize)>
    where
        D: BlockSet,
        F: FnOnce() -> (Vec<SpareDesc>, Vec<RemapEntry>),
    {
        let _serial = self.flush_lock.lock();
        // dirty -> flushing; a mutation during the writes re-dirties.
        self.dirty.store(false, Ordering::Release);

        let (spares, entries) = snapshot();
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let record = MetaRecord {
            sequence,
            created_at: self.created_at,
            updated_at: crate::os::timestamp_secs(),
            identity: self.identity.clone(),
            spares,
            entries,
        };

        let (written, planned) = self.write_copies(&record, sites);
        if written == 0 {
            self.dirty.store(true, Ordering::Release);
            return_errno_with_msg!(IoFailed, "no metadata copy could be written");
        }
        Ok((written, planned))
    }

    /// Rewrites `record` at every copy offset of every site, unchanged.
    ///
    /// Used after recovery to overwrite stale or damaged copies with the
    /// winning record. Individual failures are logged, never fatal; the
    /// next flush retries them.
    pub fn repair<D: BlockSet>(&self, record: &MetaRecord, sites: &[FlushSite<'_, D>]) -> usize {
        let (written, planned) = self.write_copies(record, sites);
        if written < planned {
            warn!(
                "metadata repair incomplete: {}/{} copies written",
                written, planned
            );
        }
        written
    }

    fn write_copies<D: BlockSet>(
        &self,
        record: &MetaRecord,
        sites: &[FlushSite<'_, D>],
    ) -> (usize, usize) {
        let mut written = 0;
        let mut planned = 0;
        for site in sites {
            for (copy_index, &offset) in site.plan.offsets().iter().enumerate() {
                planned += 1;
                let res = record
                    .encode(site.plan, copy_index as u32, site.capacity)
                    .and_then(|image| site.disk.write(offset, image.as_ref()))
                    .and_then(|_| site.disk.flush());
                match res {
                    Ok(()) => written += 1,
                    Err(e) => {
                        warn!("metadata copy {} at sector {} failed: {}", copy_index, offset, e);
                    }
                }
            }
        }
        (written, planned)
    }

    /// Reads back the newest intact record from one spare device.
    ///
    /// Tries the preferred geometric offsets first, then every offset named
    /// inside any copy that decodes. `Ok(None)` means the spare holds no
    /// intact copy; divergent same-sequence copies are a hard error.
    pub fn recover<D: BlockSet>(disk: &D, capacity: Sector) -> Result<Option<DecodedCopy>> {
        let record_bytes = record_size_for(capacity);
        let record_sectors = sectors_for(record_bytes);

        let mut candidates: Vec<Sector> = GEOMETRIC_OFFSETS
            .iter()
            .copied()
            .filter(|&o| o + record_sectors <= capacity)
            .collect();
        // The plan is deterministic in the capacity, so the offsets this
        // spare would have been formatted with are also worth probing.
        if let Ok(plan) = PlacementPlan::plan(capacity, record_sectors) {
            candidates.extend(plan.offsets());
        }

        let mut tried: Vec<Sector> = Vec::new();
        let mut copies: Vec<(DecodedCopy, Buf)> = Vec::new();
        while let Some(offset) = candidates.pop() {
            if tried.contains(&offset) {
                continue;
            }
            tried.push(offset);

            let mut image = Buf::alloc(record_sectors as usize)?;
            if let Err(e) = disk.read(offset, image.as_mut()) {
                debug!("metadata read at sector {} failed: {}", offset, e);
                continue;
            }
            let decoded = match MetaRecord::decode(image.as_slice()) {
                Ok(decoded) => decoded,
                Err(e) if e.errno() == VersionUnsupported => return Err(e),
                Err(e) => {
                    debug!("metadata copy at sector {} rejected: {}", offset, e);
                    continue;
                }
            };
            // A valid copy names its siblings; chase the ones not yet tried.
            for &named in &decoded.copy_offsets {
                if named + record_sectors <= capacity && !tried.contains(&named) {
                    candidates.push(named);
                }
            }
            copies.push((decoded, image));
        }

        let Some(best_seq) = copies.iter().map(|(c, _)| c.record.sequence).max() else {
            return Ok(None);
        };

        let mut winner: Option<(DecodedCopy, Buf)> = None;
        for (copy, image) in copies {
            if copy.record.sequence != best_seq {
                continue;
            }
            match &winner {
                None => winner = Some((copy, image)),
                Some((best, best_image)) => {
                    if copy.body(image.as_slice()) != best.body(best_image.as_slice()) {
                        return_errno_with_msg!(
                            MetadataDivergent,
                            "copies share a sequence number but differ"
                        );
                    }
                }
            }
        }
        Ok(winner.map(|(copy, _)| copy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::bio::{FaultDisk, MemDisk};

    const CAPACITY: Sector = 16384;

    fn test_store() -> MetaStore {
        let identity = DeviceIdentity {
            main_fingerprint: DeviceIdentity::fingerprint("/dev/main", 409600),
            spare_uuid: [7; 16],
            spare_size: CAPACITY,
            sector_size: SECTOR_SIZE as u32,
        };
        MetaStore::format(identity, 1_700_000_000)
    }

    fn test_plan() -> PlacementPlan {
        let record_sectors = sectors_for(record_size_for(CAPACITY));
        PlacementPlan::plan(CAPACITY, record_sectors).unwrap()
    }

    fn descriptors() -> Vec<SpareDesc> {
        vec![SpareDesc {
            capacity: CAPACITY,
            uuid: [7; 16],
        }]
    }

    #[test]
    fn flush_then_recover() {
        let disk = MemDisk::create(CAPACITY).unwrap();
        let store = test_store();
        let plan = test_plan();
        let sites = [FlushSite {
            disk: &disk,
            plan: &plan,
            capacity: CAPACITY,
        }];

        let entries = vec![RemapEntry {
            lsa: 2000,
            ssa: 9000,
            spare_index: 0,
            flags: crate::layers::meta::RemapFlags::AUTO,
            created_at: 1,
            hit_count: 0,
        }];
        let cloned = entries.clone();
        let (written, planned) = store
            .flush(move || (descriptors(), cloned), &sites)
            .unwrap();
        assert_eq!(written, planned);
        assert!(!store.is_dirty());

        let copy = MetaStore::recover(&disk, CAPACITY).unwrap().unwrap();
        assert_eq!(copy.record.sequence, 1);
        assert_eq!(copy.record.entries, entries);
        assert_eq!(copy.record.spares, descriptors());
    }

    #[test]
    fn recover_survives_damaged_copies() {
        let disk = MemDisk::create(CAPACITY).unwrap();
        let store = test_store();
        let plan = test_plan();
        let sites = [FlushSite {
            disk: &disk,
            plan: &plan,
            capacity: CAPACITY,
        }];
        store.flush(|| (descriptors(), Vec::new()), &sites).unwrap();

        // Zero every copy but the last; the survivor must win.
        let record_sectors = plan.record_sectors() as usize;
        let zeros = Buf::alloc(record_sectors).unwrap();
        for &offset in &plan.offsets()[..plan.offsets().len() - 1] {
            disk.write(offset, zeros.as_ref()).unwrap();
        }

        let copy = MetaStore::recover(&disk, CAPACITY).unwrap().unwrap();
        assert_eq!(copy.record.sequence, 1);
    }

    #[test]
    fn recover_empty_spare_yields_none() {
        let disk = MemDisk::create(CAPACITY).unwrap();
        assert!(MetaStore::recover(&disk, CAPACITY).unwrap().is_none());
    }

    #[test]
    fn stale_copy_loses_to_newer_sequence() {
        let disk = MemDisk::create(CAPACITY).unwrap();
        let store = test_store();
        let plan = test_plan();
        let sites = [FlushSite {
            disk: &disk,
            plan: &plan,
            capacity: CAPACITY,
        }];

        store.flush(|| (descriptors(), Vec::new()), &sites).unwrap();
        // Keep a stale image of copy 0, then flush a newer record.
        let record_sectors = plan.record_sectors() as usize;
        let mut stale = Buf::alloc(record_sectors).unwrap();
        disk.read(plan.offsets()[0], stale.as_mut()).unwrap();

        let entries = vec![RemapEntry {
            lsa: 5,
            ssa: 9001,
            spare_index: 0,
            flags: crate::layers::meta::RemapFlags::MANUAL,
            created_at: 2,
            hit_count: 0,
        }];
        let cloned = entries.clone();
        store.flush(move || (descriptors(), cloned), &sites).unwrap();
        disk.write(plan.offsets()[0], stale.as_ref()).unwrap();

        let copy = MetaStore::recover(&disk, CAPACITY).unwrap().unwrap();
        assert_eq!(copy.record.sequence, 2);
        assert_eq!(copy.record.entries, entries);
    }

    #[test]
    fn divergent_same_sequence_copies_are_fatal() {
        let disk = MemDisk::create(CAPACITY).unwrap();
        let store = test_store();
        let plan = test_plan();
        let sites = [FlushSite {
            disk: &disk,
            plan: &plan,
            capacity: CAPACITY,
        }];
        store.flush(|| (descriptors(), Vec::new()), &sites).unwrap();

        // Forge a same-sequence copy with a different body at offset 0.
        let record = MetaRecord {
            sequence: 1,
            created_at: 1_700_000_000,
            updated_at: 9,
            identity: store.identity().clone(),
            spares: descriptors(),
            entries: vec![RemapEntry {
                lsa: 42,
                ssa: 9002,
                spare_index: 0,
                flags: crate::layers::meta::RemapFlags::AUTO,
                created_at: 3,
                hit_count: 0,
            }],
        };
        let forged = record.encode(&plan, 0, CAPACITY).unwrap();
        disk.write(plan.offsets()[0], forged.as_ref()).unwrap();

        let err = MetaStore::recover(&disk, CAPACITY).unwrap_err();
        assert_eq!(err.errno(), crate::error::Errno::MetadataDivergent);
    }

    #[test]
    fn flush_fails_only_when_no_copy_lands() {
        let disk = FaultDisk::new(MemDisk::create(CAPACITY).unwrap());
        let store = test_store();
        let plan = test_plan();
        let sites = [FlushSite {
            disk: &disk,
            plan: &plan,
            capacity: CAPACITY,
        }];

        // Break all but the last copy region: the flush still succeeds.
        for &offset in &plan.offsets()[..plan.offsets().len() - 1] {
            disk.fail_writes(offset);
        }
        let (written, planned) = store.flush(|| (descriptors(), Vec::new()), &sites).unwrap();
        assert_eq!(written, 1);
        assert_eq!(planned, plan.offsets().len());
        assert!(!store.is_dirty());

        // Break the last one too: now the flush fails and stays dirty.
        disk.fail_writes(*plan.offsets().last().unwrap());
        store.mark_dirty();
        assert!(store
            .flush(|| (descriptors(), Vec::new()), &sites)
            .is_err());
        assert!(store.is_dirty());
    }

    #[test]
    fn repair_rewrites_stale_copies() {
        let disk = MemDisk::create(CAPACITY).unwrap();
        let store = test_store();
        let plan = test_plan();
        let sites = [FlushSite {
            disk: &disk,
            plan: &plan,
            capacity: CAPACITY,
        }];
        store.flush(|| (descriptors(), Vec::new()), &sites).unwrap();

        // Zero all copies except the last, recover, repair, then zero the
        // survivor: recovery must now succeed from a repaired copy.
        let record_sectors = plan.record_sectors() as usize;
        let zeros = Buf::alloc(record_sectors).unwrap();
        let last = *plan.offsets().last().unwrap();
        for &offset in &plan.offsets()[..plan.offsets().len() - 1] {
            disk.write(offset, zeros.as_ref()).unwrap();
        }

        let copy = MetaStore::recover(&disk, CAPACITY).unwrap().unwrap();
        let written = store.repair(&copy.record, &sites);
        assert_eq!(written, plan.offsets().len());

        disk.write(last, zeros.as_ref()).unwrap();
        let copy = MetaStore::recover(&disk, CAPACITY).unwrap().unwrap();
        assert_eq!(copy.record.sequence, 1);
    }
}
