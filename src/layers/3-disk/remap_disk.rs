// SPDX-License-Identifier: MPL-2.0

//! RemapDisk as a block device.
//!
//! API: create(), open(), read(), write(), submit(), save(), remap(),
//! unremap(), add_spare(), remove_spare(), detach().
//!
//! The device interposes on every sector I/O. The common case is a device
//! with no remaps: one atomic load short-circuits straight to the main
//! device. While remaps exist, each request is split at sector boundaries
//! so every fragment targets exactly one device. I/O failures are handed
//! to the background worker, which installs a replacement mapping and
//! re-issues the fragment against the spare pool.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use super::{
    bio::{BioReq, BioType},
    control::TargetArgs,
    worker::{Task, TaskQueue},
};
use crate::{
    layers::{
        bio::{BlockSet, Buf, BufMut, BufRef},
        map::{HealthStats, RemapTable, SpareDevice, SparePool},
        meta::{
            record_size_for, DeviceIdentity, FlushSite, MetaStore, RemapEntry, RemapFlags,
        },
    },
    os::{self, Condvar, CvarMutex, Mutex, Weak},
    prelude::*,
    util::Rng as _,
};

const STATE_RUNNING: u8 = 0;
const STATE_QUIESCING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Which device failed a sector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Origin {
    Main,
    Spare,
}

/// One sector an in-flight request could not transfer.
#[derive(Clone, Copy, Debug)]
pub(super) struct FailedSector {
    pub(super) lsa: Sector,
    pub(super) origin: Origin,
}

/// A failed sector packaged with an owned one-sector buffer, so recovery
/// can run on the worker while the caller's borrow stays on its own stack.
struct Fragment {
    failed: FailedSector,
    data: Buf,
}

/// A one-shot completion latch.
struct Completion {
    result: CvarMutex<Option<Result<()>>>,
    cvar: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            result: CvarMutex::new(None),
            cvar: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<()>) {
        let mut slot = self.result.lock().unwrap();
        *slot = Some(result);
        self.cvar.notify_all();
    }

    fn wait(&self) -> Result<()> {
        let mut slot = self.result.lock().unwrap();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = self.cvar.wait(slot).unwrap();
        }
    }
}

/// Keeps the in-flight count nonzero for as long as a request, or its
/// deferred recovery, is alive.
struct IoGuard<D: BlockSet + 'static>(Arc<DiskInner<D>>);

impl<D: BlockSet + 'static> IoGuard<D> {
    fn enter(inner: &Arc<DiskInner<D>>) -> Result<Self> {
        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        if inner.state.load(Ordering::Acquire) != STATE_RUNNING {
            inner.in_flight.fetch_sub(1, Ordering::Release);
            return_errno_with_msg!(Quiesced, "device is not accepting I/O");
        }
        Ok(Self(inner.clone()))
    }
}

impl<D: BlockSet + 'static> Drop for IoGuard<D> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Release);
    }
}

/// Opens a spare device by handle, for control-channel `add_spare`.
pub type SpareResolver<D> = Box<dyn Fn(&str) -> Result<D> + Send + Sync>;

/// A sector-remapping block device.
pub struct RemapDisk<D: BlockSet + 'static> {
    pub(super) inner: Arc<DiskInner<D>>,
}

impl<D: BlockSet + 'static> core::fmt::Debug for RemapDisk<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RemapDisk").finish_non_exhaustive()
    }
}

/// Inner structures of `RemapDisk`.
pub(super) struct DiskInner<D: BlockSet> {
    /// The device whose bad sectors are being papered over.
    pub(super) main: D,
    pub(super) main_capacity: Sector,
    /// The spares remapped sectors land on.
    pub(super) pool: SparePool<D>,
    /// Logical-to-spare lookup, consulted on every request.
    pub(super) table: RemapTable,
    pub(super) stats: HealthStats,
    pub(super) store: MetaStore,
    pub(super) auto_remap: AtomicBool,
    pub(super) autosave_secs: u64,
    state: AtomicU8,
    in_flight: AtomicU64,
    queue: Mutex<Option<TaskQueue>>,
    pub(super) resolver: Mutex<Option<SpareResolver<D>>>,
}

fn fresh_uuid() -> [u8; 16] {
    let rng = os::Rng::new(&[]);
    let mut uuid = [0u8; 16];
    rng.fill_bytes(&mut uuid).unwrap_or_default();
    uuid
}

fn carve_spare<D: BlockSet>(spare: D, start: Sector, len: Sector) -> Result<D> {
    if len == 0 || start + len > spare.nsectors() {
        return_errno_with_msg!(InvalidArgs, "spare range is empty or out of bounds");
    }
    spare.subset(start..start + len)
}

impl<D: BlockSet + 'static> RemapDisk<D> {
    /// Formats a fresh remap device over `main`, with one spare region.
    ///
    /// An initial metadata record is written before any I/O is accepted.
    pub fn create(main: D, spare: D, args: &TargetArgs) -> Result<Self> {
        let spare = carve_spare(spare, args.spare_start, args.spare_len)?;
        let main_capacity = main.nsectors();
        let spare_capacity = spare.nsectors();
        let record_sectors = sectors_for(record_size_for(spare_capacity));

        let uuid = fresh_uuid();
        let identity = DeviceIdentity {
            main_fingerprint: DeviceIdentity::fingerprint(&args.main_handle, main_capacity),
            spare_uuid: uuid,
            spare_size: spare_capacity,
            sector_size: SECTOR_SIZE as u32,
        };
        let first_spare = SpareDevice::new(spare, record_sectors, uuid)?;

        let inner = Arc::new(DiskInner {
            main,
            main_capacity,
            pool: SparePool::new(first_spare),
            table: RemapTable::new(args.initial_hash_size)?,
            stats: HealthStats::new(),
            store: MetaStore::format(identity, os::timestamp_secs()),
            auto_remap: AtomicBool::new(args.auto_remap),
            autosave_secs: args.autosave_interval_secs,
            state: AtomicU8::new(STATE_RUNNING),
            in_flight: AtomicU64::new(0),
            queue: Mutex::new(None),
            resolver: Mutex::new(None),
        });
        inner.do_flush(true)?;
        Self::start_worker(&inner);

        debug!("remap device formatted: main={} sectors", main_capacity);
        Ok(Self { inner })
    }

    /// Attaches to an existing remap device, rebuilding every mapping from
    /// the newest intact metadata copy and repairing the stale ones.
    ///
    /// `spares` must list the same devices, in the same order, as the
    /// recorded pool. Any metadata problem is fatal to the attach.
    pub fn open(main: D, spares: Vec<D>, args: &TargetArgs) -> Result<Self> {
        let mut spares = spares;
        if spares.is_empty() {
            return_errno_with_msg!(InvalidArgs, "at least one spare is required");
        }
        let first = spares.remove(0);
        spares.insert(0, carve_spare(first, args.spare_start, args.spare_len)?);

        let mut winner = None;
        for disk in &spares {
            if let Some(copy) = MetaStore::recover(disk, disk.nsectors())? {
                winner = Some(copy);
                break;
            }
        }
        let Some(copy) = winner else {
            return_errno_with_msg!(MetadataCorrupt, "no spare holds an intact metadata record");
        };
        let record = copy.record;

        let main_capacity = main.nsectors();
        let fingerprint = DeviceIdentity::fingerprint(&args.main_handle, main_capacity);
        if record.identity.main_fingerprint != fingerprint {
            return_errno_with_msg!(MetadataCorrupt, "metadata belongs to a different main device");
        }
        if record.spares.len() != spares.len() {
            return_errno_with_msg!(InvalidArgs, "spare count differs from the recorded pool");
        }
        for (desc, disk) in record.spares.iter().zip(&spares) {
            if desc.capacity != disk.nsectors() {
                return_errno_with_msg!(InvalidArgs, "spare capacity differs from the record");
            }
        }

        let record_sectors = sectors_for(record_size_for(record.spares[0].capacity));
        let mut disks = spares.into_iter();
        let mut descs = record.spares.iter();
        let first = SpareDevice::new(
            disks.next().unwrap(),
            record_sectors,
            descs.next().unwrap().uuid,
        )?;
        let pool = SparePool::new(first);
        for (disk, desc) in disks.zip(descs) {
            pool.add(SpareDevice::new(disk, record_sectors, desc.uuid)?)?;
        }

        let table = RemapTable::new(args.initial_hash_size)?;
        for entry in &record.entries {
            let spare = pool.get(entry.spare_index)?;
            spare.alloc().restore(entry.ssa)?;
            table
                .insert(*entry)
                .map_err(|_| Error::with_msg(MetadataCorrupt, "record holds conflicting entries"))?;
        }

        let inner = Arc::new(DiskInner {
            main,
            main_capacity,
            pool,
            table,
            stats: HealthStats::new(),
            store: MetaStore::open(&record),
            auto_remap: AtomicBool::new(args.auto_remap),
            autosave_secs: args.autosave_interval_secs,
            state: AtomicU8::new(STATE_RUNNING),
            in_flight: AtomicU64::new(0),
            queue: Mutex::new(None),
            resolver: Mutex::new(None),
        });

        // Bring every copy back to the winning record.
        let snapshot = inner.pool.snapshot();
        let sites: Vec<_> = snapshot
            .iter()
            .map(|s| FlushSite {
                disk: s.disk(),
                plan: s.plan(),
                capacity: s.capacity(),
            })
            .collect();
        inner.store.repair(&record, &sites);

        Self::start_worker(&inner);
        debug!(
            "remap device attached: {} entries, sequence {}",
            record.entries.len(),
            record.sequence
        );
        Ok(Self { inner })
    }

    fn start_worker(inner: &Arc<DiskInner<D>>) {
        let tick = (inner.autosave_secs > 0).then(|| Duration::from_secs(inner.autosave_secs));
        let weak: Weak<DiskInner<D>> = Arc::downgrade(inner);
        let queue = TaskQueue::start(
            tick,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.autosave_tick();
                }
            }),
        );
        *inner.queue.lock() = Some(queue);
    }

    /// Reads whole sectors at `sector` through the remap layer.
    pub fn read(&self, sector: Sector, mut buf: BufMut) -> Result<()> {
        let guard = IoGuard::enter(&self.inner)?;
        self.inner.stats.record_read();
        let failed = self.inner.route_read(sector, buf.as_mut_slice())?;
        if failed.is_empty() {
            return Ok(());
        }

        let (shared, completion) =
            self.defer_recovery(BioType::Read, sector, buf.as_slice(), failed, guard)?;
        completion.wait()?;
        // Merge the recovered sectors back into the caller's buffer.
        let frags = shared.lock();
        for frag in frags.iter() {
            let offset = (frag.failed.lsa - sector) as usize * SECTOR_SIZE;
            buf.as_mut_slice()[offset..offset + SECTOR_SIZE].copy_from_slice(frag.data.as_slice());
        }
        Ok(())
    }

    /// Writes whole sectors at `sector` through the remap layer.
    pub fn write(&self, sector: Sector, buf: BufRef) -> Result<()> {
        let guard = IoGuard::enter(&self.inner)?;
        self.inner.stats.record_write();
        let failed = self.inner.route_write(sector, buf.as_slice())?;
        if failed.is_empty() {
            return Ok(());
        }

        let (_shared, completion) =
            self.defer_recovery(BioType::Write, sector, buf.as_slice(), failed, guard)?;
        completion.wait()
    }

    /// Packages failed sectors into owned fragments and hands them to the
    /// worker; the caller blocks on the returned completion.
    fn defer_recovery(
        &self,
        kind: BioType,
        start: Sector,
        bytes: &[u8],
        failed: Vec<FailedSector>,
        guard: IoGuard<D>,
    ) -> Result<(Arc<Mutex<Vec<Fragment>>>, Arc<Completion>)> {
        let mut frags = Vec::with_capacity(failed.len());
        for failed in failed {
            let mut data = Buf::alloc(1)?;
            if kind == BioType::Write {
                let offset = (failed.lsa - start) as usize * SECTOR_SIZE;
                data.as_mut_slice()
                    .copy_from_slice(&bytes[offset..offset + SECTOR_SIZE]);
            }
            frags.push(Fragment { failed, data });
        }

        let shared = Arc::new(Mutex::new(frags));
        let completion = Arc::new(Completion::new());
        let task: Task = {
            let inner = self.inner.clone();
            let shared = shared.clone();
            let completion = completion.clone();
            Box::new(move || {
                let result = inner.run_recovery(kind, &mut shared.lock());
                completion.complete(result);
                drop(guard);
            })
        };
        self.inner.submit_task(task);
        Ok((shared, completion))
    }

    /// Accepts an asynchronous request; completion is signalled on the
    /// request itself, possibly from the worker thread.
    pub fn submit(&self, req: &Arc<BioReq>) -> Result<()> {
        req.submit();
        let guard = match IoGuard::enter(&self.inner) {
            Ok(guard) => guard,
            Err(e) => {
                req.complete(Err(e.clone()));
                return Err(e);
            }
        };

        if req.type_() == BioType::Sync {
            let task: Task = {
                let inner = self.inner.clone();
                let req = req.clone();
                Box::new(move || {
                    let result = inner.do_flush(true).map(|_| ());
                    req.complete(result);
                    drop(guard);
                })
            };
            self.inner.submit_task(task);
            return Ok(());
        }

        match req.type_() {
            BioType::Read => self.inner.stats.record_read(),
            BioType::Write => self.inner.stats.record_write(),
            BioType::Sync => unreachable!(),
        }

        let routed = req.access_mut_bufs_with(|bufs| {
            let mut addr = req.addr();
            let mut failed = Vec::new();
            for buf in bufs.iter_mut() {
                let fails = match req.type_() {
                    BioType::Read => self.inner.route_read(addr, buf.as_mut_slice())?,
                    BioType::Write => self.inner.route_write(addr, buf.as_slice())?,
                    BioType::Sync => unreachable!(),
                };
                failed.extend(fails);
                addr += buf.nsectors() as Sector;
            }
            Ok(failed)
        });
        let failed = match routed {
            Ok(failed) => failed,
            Err(e) => {
                req.complete(Err(e));
                return Ok(());
            }
        };
        if failed.is_empty() {
            req.complete(Ok(()));
            return Ok(());
        }

        let task: Task = {
            let inner = self.inner.clone();
            let req = req.clone();
            Box::new(move || {
                let result = req.access_mut_bufs_with(|bufs| {
                    inner.recover_into_bufs(req.type_(), req.addr(), bufs, &failed)
                });
                req.complete(result);
                drop(guard);
            })
        };
        self.inner.submit_task(task);
        Ok(())
    }

    /// Manually remaps `lsa`, preserving its current content when the
    /// sector is still readable. Returns the spare sector.
    pub fn remap(&self, lsa: Sector) -> Result<Sector> {
        let _guard = IoGuard::enter(&self.inner)?;
        let inner = &self.inner;
        if lsa >= inner.main_capacity {
            return_errno_with_msg!(InvalidArgs, "sector is beyond the device");
        }
        if inner.table.lookup(lsa).is_some() {
            return_errno_with_msg!(DuplicateRemap, "sector is already remapped");
        }

        let (spare_index, ssa) = inner.pool.allocate()?;
        let spare = inner.pool.get(spare_index)?;

        let mut data = Buf::alloc(1)?;
        match inner.main.read(lsa, data.as_mut()) {
            Ok(()) => {}
            // An unreadable sector starts over with a zeroed replacement.
            Err(e) if e.errno() == IoFailed => {}
            Err(e) => {
                spare.alloc().free(ssa);
                return Err(e);
            }
        }
        if let Err(e) = spare.disk().write(ssa, data.as_ref()) {
            spare.alloc().free(ssa);
            return Err(e);
        }

        let entry = RemapEntry {
            lsa,
            ssa,
            spare_index,
            flags: RemapFlags::MANUAL,
            created_at: os::timestamp_secs(),
            hit_count: 0,
        };
        if let Err(e) = inner.table.insert(entry) {
            spare.alloc().free(ssa);
            return Err(e);
        }
        inner.stats.record_allocation();
        inner.stats.record_manual_remap();
        inner.store.mark_dirty();
        Ok(ssa)
    }

    /// Removes the remap for `lsa`. Advisory: the spare sector stays
    /// reserved and is never handed out again.
    pub fn unremap(&self, lsa: Sector) -> Result<()> {
        let _guard = IoGuard::enter(&self.inner)?;
        match self.inner.table.remove(lsa) {
            Some(_) => {
                self.inner.store.mark_dirty();
                Ok(())
            }
            None => Err(Error::with_msg(InvalidArgs, "no remap installed for this sector")),
        }
    }

    /// Appends a spare device to the pool, returning its index.
    pub fn add_spare(&self, spare: D) -> Result<usize> {
        let _guard = IoGuard::enter(&self.inner)?;
        let record_sectors = self.inner.pool.get(0)?.plan().record_sectors();
        let device = SpareDevice::new(spare, record_sectors, fresh_uuid())?;
        let index = self.inner.pool.add(device)?;
        self.inner.store.mark_dirty();
        Ok(index)
    }

    /// Removes the spare at `index`; refused while it holds live entries.
    pub fn remove_spare(&self, index: usize) -> Result<()> {
        let _guard = IoGuard::enter(&self.inner)?;
        self.inner.pool.remove(index, &self.inner.table)?;
        self.inner.store.mark_dirty();
        Ok(())
    }

    /// Forces a synchronous metadata flush; `(written, planned)` copies.
    pub fn save(&self) -> Result<(usize, usize)> {
        let _guard = IoGuard::enter(&self.inner)?;
        self.inner.do_flush(true)
    }

    /// Toggles error-path auto-remap; returns the new setting.
    pub fn set_auto_remap(&self, enabled: bool) -> bool {
        self.inner.auto_remap.store(enabled, Ordering::Release);
        enabled
    }

    /// Installs the opener used by the control-channel `add_spare`.
    pub fn set_spare_resolver(&self, resolver: SpareResolver<D>) {
        *self.inner.resolver.lock() = Some(resolver);
    }

    /// The logical capacity consumers see.
    pub fn capacity(&self) -> Sector {
        self.inner.main_capacity
    }

    /// The number of installed remap entries.
    pub fn remapped(&self) -> u64 {
        self.inner.table.len()
    }

    /// Quiesces, drains in-flight I/O, flushes, and stops the worker.
    ///
    /// Idempotent; I/O arriving after this starts fails with `Quiesced`.
    pub fn detach(&self) -> Result<()> {
        if self
            .inner
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_QUIESCING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }

        while self.inner.in_flight.load(Ordering::Acquire) != 0 {
            os::yield_now();
        }

        let flush_res = self.inner.do_flush(false).map(|_| ());
        if let Err(e) = &flush_res {
            error!("final metadata flush failed: {}", e);
        }
        if let Some(queue) = self.inner.queue.lock().take() {
            queue.shutdown();
        }
        self.inner.state.store(STATE_STOPPED, Ordering::Release);
        flush_res
    }
}

impl<D: BlockSet + 'static> Drop for RemapDisk<D> {
    fn drop(&mut self) {
        let _ = self.detach();
    }
}

impl<D: BlockSet + 'static> BlockSet for RemapDisk<D> {
    fn read(&self, pos: Sector, buf: BufMut) -> Result<()> {
        RemapDisk::read(self, pos, buf)
    }

    fn write(&self, pos: Sector, buf: BufRef) -> Result<()> {
        RemapDisk::write(self, pos, buf)
    }

    fn subset(&self, _range: core::ops::Range<Sector>) -> Result<Self> {
        return_errno_with_msg!(InvalidArgs, "a remap device cannot be subset");
    }

    fn flush(&self) -> Result<()> {
        self.inner.main.flush()?;
        for spare in self.inner.pool.snapshot() {
            spare.disk().flush()?;
        }
        self.save().map(|_| ())
    }

    fn nsectors(&self) -> Sector {
        self.inner.main_capacity
    }
}

impl<D: BlockSet> DiskInner<D> {
    fn submit_task(&self, task: Task) {
        let queue = self.queue.lock();
        match queue.as_ref() {
            Some(queue) => queue.submit(task),
            None => {
                drop(queue);
                task();
            }
        }
    }

    fn autosave_tick(&self) {
        if self.state.load(Ordering::Acquire) != STATE_RUNNING {
            return;
        }
        if !self.store.is_dirty() {
            return;
        }
        if let Err(e) = self.do_flush(false) {
            warn!("periodic metadata flush failed: {}", e);
        }
    }

    pub(super) fn do_flush(&self, force: bool) -> Result<(usize, usize)> {
        if !force && !self.store.is_dirty() {
            return Ok((0, 0));
        }
        let snapshot = self.pool.snapshot();
        let sites: Vec<_> = snapshot
            .iter()
            .map(|s| FlushSite {
                disk: s.disk(),
                plan: s.plan(),
                capacity: s.capacity(),
            })
            .collect();
        let result = self
            .store
            .flush(|| (self.pool.descriptors(), self.table.entries()), &sites);
        match &result {
            Ok(_) => self.stats.record_flush_ok(),
            Err(_) => self.stats.record_flush_failure(),
        }
        result
    }

    /// Routes a read, returning the sectors that failed with an I/O error.
    fn route_read(&self, start: Sector, buf: &mut [u8]) -> Result<Vec<FailedSector>> {
        let nsectors = buf.len() / SECTOR_SIZE;
        if start + nsectors as Sector > self.main_capacity {
            return_errno_with_msg!(InvalidArgs, "read is beyond the device");
        }
        let mut failed = Vec::new();

        // The no-remap case: one lookup, one dispatch, nothing else.
        if self.table.lookup(start).is_none() && self.table.is_empty() {
            match self.main.read(start, BufMut::from_slice(&mut *buf)?) {
                Ok(()) => return Ok(failed),
                Err(e) if e.errno() == IoFailed => {
                    self.isolate_read_failures(start, buf, &mut failed)?;
                    return Ok(failed);
                }
                Err(e) => return Err(e),
            }
        }

        let mut idx = 0;
        while idx < nsectors {
            let lsa = start + idx as Sector;
            if let Some((ssa, spare_index)) = self.table.lookup(lsa) {
                let chunk = &mut buf[idx * SECTOR_SIZE..(idx + 1) * SECTOR_SIZE];
                match self
                    .pool
                    .get(spare_index)?
                    .disk()
                    .read(ssa, BufMut::from_slice(chunk)?)
                {
                    Ok(()) => {}
                    Err(e) if e.errno() == IoFailed => failed.push(FailedSector {
                        lsa,
                        origin: Origin::Spare,
                    }),
                    Err(e) => return Err(e),
                }
                idx += 1;
            } else {
                // Batch the run of unmapped sectors into one transfer.
                let run = idx;
                idx += 1;
                while idx < nsectors && self.table.lookup(start + idx as Sector).is_none() {
                    idx += 1;
                }
                let chunk = &mut buf[run * SECTOR_SIZE..idx * SECTOR_SIZE];
                match self
                    .main
                    .read(start + run as Sector, BufMut::from_slice(&mut *chunk)?)
                {
                    Ok(()) => {}
                    Err(e) if e.errno() == IoFailed => {
                        self.isolate_read_failures(start + run as Sector, chunk, &mut failed)?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(failed)
    }

    /// Routes a write, returning the sectors that failed with an I/O error.
    fn route_write(&self, start: Sector, buf: &[u8]) -> Result<Vec<FailedSector>> {
        let nsectors = buf.len() / SECTOR_SIZE;
        if start + nsectors as Sector > self.main_capacity {
            return_errno_with_msg!(InvalidArgs, "write is beyond the device");
        }
        let mut failed = Vec::new();

        if self.table.lookup(start).is_none() && self.table.is_empty() {
            match self.main.write(start, BufRef::from_slice(&*buf)?) {
                Ok(()) => return Ok(failed),
                Err(e) if e.errno() == IoFailed => {
                    self.isolate_write_failures(start, buf, &mut failed)?;
                    return Ok(failed);
                }
                Err(e) => return Err(e),
            }
        }

        let mut idx = 0;
        while idx < nsectors {
            let lsa = start + idx as Sector;
            if let Some((ssa, spare_index)) = self.table.lookup(lsa) {
                let chunk = &buf[idx * SECTOR_SIZE..(idx + 1) * SECTOR_SIZE];
                match self
                    .pool
                    .get(spare_index)?
                    .disk()
                    .write(ssa, BufRef::from_slice(chunk)?)
                {
                    Ok(()) => {}
                    Err(e) if e.errno() == IoFailed => failed.push(FailedSector {
                        lsa,
                        origin: Origin::Spare,
                    }),
                    Err(e) => return Err(e),
                }
                idx += 1;
            } else {
                let run = idx;
                idx += 1;
                while idx < nsectors && self.table.lookup(start + idx as Sector).is_none() {
                    idx += 1;
                }
                let chunk = &buf[run * SECTOR_SIZE..idx * SECTOR_SIZE];
                match self.main.write(start + run as Sector, BufRef::from_slice(chunk)?) {
                    Ok(()) => {}
                    Err(e) if e.errno() == IoFailed => {
                        self.isolate_write_failures(start + run as Sector, chunk, &mut failed)?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(failed)
    }

    /// Re-reads a failed run sector by sector to find the bad ones.
    fn isolate_read_failures(
        &self,
        start: Sector,
        buf: &mut [u8],
        failed: &mut Vec<FailedSector>,
    ) -> Result<()> {
        for (i, sector) in BufMut::from_slice(buf)?.sectors_mut().enumerate() {
            let lsa = start + i as Sector;
            match self.main.read(lsa, sector) {
                Ok(()) => {}
                Err(e) if e.errno() == IoFailed => failed.push(FailedSector {
                    lsa,
                    origin: Origin::Main,
                }),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Re-writes a failed run sector by sector to find the bad ones.
    fn isolate_write_failures(
        &self,
        start: Sector,
        buf: &[u8],
        failed: &mut Vec<FailedSector>,
    ) -> Result<()> {
        for (i, sector) in BufRef::from_slice(buf)?.sectors().enumerate() {
            let lsa = start + i as Sector;
            match self.main.write(lsa, sector) {
                Ok(()) => {}
                Err(e) if e.errno() == IoFailed => failed.push(FailedSector {
                    lsa,
                    origin: Origin::Main,
                }),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Worker-side recovery into owned fragments.
    fn run_recovery(&self, kind: BioType, frags: &mut [Fragment]) -> Result<()> {
        let mut result = Ok(());
        for frag in frags.iter_mut() {
            let r = match kind {
                BioType::Read => self.recover_read_sector(
                    frag.failed.lsa,
                    frag.failed.origin,
                    frag.data.as_mut_slice(),
                ),
                BioType::Write => self.recover_write_sector(
                    frag.failed.lsa,
                    frag.failed.origin,
                    frag.data.as_slice(),
                ),
                BioType::Sync => Ok(()),
            };
            if result.is_ok() {
                result = r;
            }
        }
        result
    }

    /// Worker-side recovery straight into a request's buffers.
    fn recover_into_bufs(
        &self,
        kind: BioType,
        addr: Sector,
        bufs: &mut [Buf],
        failed: &[FailedSector],
    ) -> Result<()> {
        let mut result = Ok(());
        for f in failed {
            let rel = (f.lsa - addr) as usize;
            let slice = sector_slice(bufs, rel);
            let r = match kind {
                BioType::Read => self.recover_read_sector(f.lsa, f.origin, slice),
                BioType::Write => self.recover_write_sector(f.lsa, f.origin, slice),
                BioType::Sync => Ok(()),
            };
            if result.is_ok() {
                result = r;
            }
        }
        result
    }

    /// The error path for one failed read sector.
    ///
    /// Runs on the worker. Installs an auto-remap when policy allows and
    /// re-issues the read against the spare; never blocks on a flush.
    fn recover_read_sector(&self, lsa: Sector, origin: Origin, out: &mut [u8]) -> Result<()> {
        if origin == Origin::Spare {
            self.stats.record_spare_error();
            return_errno_with_msg!(IoFailed, "spare sector failed; not remapping again");
        }
        self.stats.record_read_error();

        // A racing request may have installed the mapping already.
        if let Some((ssa, spare_index)) = self.table.lookup(lsa) {
            return self
                .pool
                .get(spare_index)?
                .disk()
                .read(ssa, BufMut::from_slice(out)?);
        }

        let (spare_index, ssa) = self.install_auto_remap(lsa)?;
        // A fresh spare sector reads back zeros; the bad sector's content
        // was already lost to the medium.
        self.pool
            .get(spare_index)?
            .disk()
            .read(ssa, BufMut::from_slice(out)?)
    }

    /// The error path for one failed write sector.
    fn recover_write_sector(&self, lsa: Sector, origin: Origin, data: &[u8]) -> Result<()> {
        if origin == Origin::Spare {
            self.stats.record_spare_error();
            return_errno_with_msg!(IoFailed, "spare sector failed; not remapping again");
        }
        self.stats.record_write_error();

        if let Some((ssa, spare_index)) = self.table.lookup(lsa) {
            return self
                .pool
                .get(spare_index)?
                .disk()
                .write(ssa, BufRef::from_slice(data)?);
        }

        let (spare_index, ssa) = self.install_auto_remap(lsa)?;
        self.pool
            .get(spare_index)?
            .disk()
            .write(ssa, BufRef::from_slice(data)?)
    }

    /// Allocates a spare sector and publishes the mapping. The new entry
    /// is visible to lookups the moment the insertion completes; the
    /// record is only marked dirty, never flushed from here.
    fn install_auto_remap(&self, lsa: Sector) -> Result<(u16, Sector)> {
        if !self.auto_remap.load(Ordering::Acquire) {
            return_errno_with_msg!(IoFailed, "auto-remap is disabled");
        }
        let (spare_index, ssa) = self.pool.allocate()?;
        self.stats.record_allocation();

        let entry = RemapEntry {
            lsa,
            ssa,
            spare_index,
            flags: RemapFlags::AUTO,
            created_at: os::timestamp_secs(),
            hit_count: 0,
        };
        if let Err(e) = self.table.insert(entry) {
            // Lost a race to another installer; yield the sector back.
            self.pool.get(spare_index)?.alloc().free(ssa);
            if e.errno() == DuplicateRemap {
                if let Some(existing) = self.table.lookup(lsa) {
                    return Ok((existing.1, existing.0));
                }
            }
            return Err(e);
        }
        self.stats.record_auto_remap();
        self.store.mark_dirty();
        debug!("auto-remapped sector {} to spare {}:{}", lsa, spare_index, ssa);
        Ok((spare_index, ssa))
    }
}

/// The sector-sized slice at relative sector `rel` across a buffer chain.
fn sector_slice(bufs: &mut [Buf], mut rel: usize) -> &mut [u8] {
    for buf in bufs.iter_mut() {
        let n = buf.nsectors();
        if rel < n {
            return &mut buf.as_mut_slice()[rel * SECTOR_SIZE..(rel + 1) * SECTOR_SIZE];
        }
        rel -= n;
    }
    panic!("failed sector is outside the request's buffers");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Errno,
        layers::{
            bio::{FaultDisk, MemDisk},
            disk::bio::BioReqBuilder,
            meta::MetaRecord,
        },
    };

    type TestDisk = FaultDisk<MemDisk>;

    const MAIN_SECTORS: Sector = 8192;
    const SPARE_SECTORS: Sector = 2048;

    fn test_args(spare_len: Sector) -> TargetArgs {
        TargetArgs {
            main_handle: "/dev/test-main".to_string(),
            spare_handle: "/dev/test-spare".to_string(),
            spare_start: 0,
            spare_len,
            auto_remap: true,
            autosave_interval_secs: 0,
            initial_hash_size: 64,
        }
    }

    fn test_disks(main_sectors: Sector, spare_sectors: Sector) -> (TestDisk, TestDisk) {
        (
            FaultDisk::new(MemDisk::create(main_sectors).unwrap()),
            FaultDisk::new(MemDisk::create(spare_sectors).unwrap()),
        )
    }

    fn one_sector(fill: u8) -> Buf {
        let mut buf = Buf::alloc(1).unwrap();
        buf.as_mut_slice().fill(fill);
        buf
    }

    fn read_sector<D: BlockSet + 'static>(disk: &RemapDisk<D>, sector: Sector) -> Buf {
        let mut buf = Buf::alloc(1).unwrap();
        disk.read(sector, buf.as_mut()).unwrap();
        buf
    }

    /// Every installed entry must hold a bit in the right spare's bitmap,
    /// outside any metadata region.
    fn check_invariants<D: BlockSet + 'static>(disk: &RemapDisk<D>) {
        let mut count = 0;
        disk.inner.table.for_each(|e| {
            count += 1;
            let spare = disk.inner.pool.get(e.spare_index).unwrap();
            assert!(spare.alloc().is_allocated(e.ssa));
            assert!(!spare.alloc().in_reserved(e.ssa));
        });
        assert_eq!(count, disk.inner.table.len());
    }

    #[test]
    fn fresh_attach_write_read_reattach() {
        let (main, spare) = test_disks(MAIN_SECTORS, SPARE_SECTORS);
        let args = test_args(SPARE_SECTORS);

        let disk = RemapDisk::create(main.clone(), spare.clone(), &args).unwrap();
        let pattern = [0xAAu8; 64];
        disk.write_at(1000 * SECTOR_SIZE, &pattern).unwrap();

        let mut readback = [0u8; 64];
        disk.read_at(1000 * SECTOR_SIZE, &mut readback).unwrap();
        assert_eq!(readback, pattern);

        assert_eq!(disk.remapped(), 0);
        assert!(disk.inner.stats.snapshot().flush_ok >= 1);
        disk.detach().unwrap();

        let disk = RemapDisk::open(main, vec![spare], &args).unwrap();
        let mut readback = [0u8; 64];
        disk.read_at(1000 * SECTOR_SIZE, &mut readback).unwrap();
        assert_eq!(readback, pattern);
        assert_eq!(disk.remapped(), 0);
    }

    #[test]
    fn failed_read_installs_a_remap() {
        let (main, spare) = test_disks(MAIN_SECTORS, SPARE_SECTORS);
        let args = test_args(SPARE_SECTORS);
        let disk = RemapDisk::create(main.clone(), spare.clone(), &args).unwrap();

        disk.write(2000, one_sector(0x5A).as_ref()).unwrap();
        main.fail_reads(2000);
        main.fail_writes(2000);

        // The read succeeds; the lost content is replaced by a fresh
        // (zeroed) spare sector.
        let buf = read_sector(&disk, 2000);
        assert_eq!(buf.as_slice(), [0u8; SECTOR_SIZE]);

        let (ssa, spare_index) = disk.inner.table.lookup(2000).unwrap();
        assert_eq!(spare_index, 0);
        let entries = disk.inner.table.entries();
        assert!(entries[0].flags.contains(RemapFlags::AUTO));

        let snap = disk.inner.stats.snapshot();
        assert_eq!(snap.read_errors, 1);
        assert_eq!(snap.auto_remaps, 1);
        assert_eq!(snap.allocations, 1);

        // Subsequent traffic to the sector never touches the main device.
        disk.write(2000, one_sector(0xBB).as_ref()).unwrap();
        assert_eq!(read_sector(&disk, 2000).as_slice(), [0xBBu8; SECTOR_SIZE]);
        check_invariants(&disk);

        // The mapping survives a save/detach/reattach cycle.
        disk.save().unwrap();
        disk.detach().unwrap();
        let disk = RemapDisk::open(main, vec![spare], &args).unwrap();
        assert_eq!(disk.inner.table.lookup(2000), Some((ssa, 0)));
        assert_eq!(read_sector(&disk, 2000).as_slice(), [0xBBu8; SECTOR_SIZE]);
        check_invariants(&disk);
    }

    #[test]
    fn failed_write_installs_a_remap() {
        let (main, spare) = test_disks(MAIN_SECTORS, SPARE_SECTORS);
        let disk = RemapDisk::create(main.clone(), spare, &test_args(SPARE_SECTORS)).unwrap();

        main.fail_writes(3000);
        disk.write(3000, one_sector(0xCC).as_ref()).unwrap();

        assert!(disk.inner.table.lookup(3000).is_some());
        assert_eq!(read_sector(&disk, 3000).as_slice(), [0xCCu8; SECTOR_SIZE]);
        assert_eq!(disk.inner.stats.snapshot().write_errors, 1);
    }

    #[test]
    fn multi_sector_io_splits_around_remaps() {
        let (main, spare) = test_disks(MAIN_SECTORS, SPARE_SECTORS);
        let disk = RemapDisk::create(main.clone(), spare, &test_args(SPARE_SECTORS)).unwrap();

        // Remap the middle sector of a three-sector span.
        main.fail_writes(101);
        let mut buf = Buf::alloc(3).unwrap();
        for (i, chunk) in buf.as_mut_slice().chunks_mut(SECTOR_SIZE).enumerate() {
            chunk.fill(i as u8 + 1);
        }
        disk.write(100, buf.as_ref()).unwrap();
        assert!(disk.inner.table.lookup(101).is_some());
        assert!(disk.inner.table.lookup(100).is_none());

        let mut readback = Buf::alloc(3).unwrap();
        disk.read(100, readback.as_mut()).unwrap();
        assert_eq!(readback.as_slice(), buf.as_slice());
    }

    #[test]
    fn spare_exhaustion_and_second_spare() {
        // A 14-sector spare stores 2-sector records in 5 copies, leaving
        // exactly 4 allocatable sectors.
        let (main, spare) = test_disks(256, 14);
        let disk = RemapDisk::create(main, spare, &test_args(14)).unwrap();

        for lsa in 0..4 {
            disk.remap(lsa).unwrap();
        }
        let err = disk.remap(4).unwrap_err();
        assert_eq!(err.errno(), Errno::NoSpaceForRemap);

        let second = FaultDisk::new(MemDisk::create(14).unwrap());
        assert_eq!(disk.add_spare(second).unwrap(), 1);
        let ssa = disk.remap(4).unwrap();
        assert_eq!(disk.inner.table.lookup(4), Some((ssa, 1)));
        check_invariants(&disk);

        let snap = disk.inner.stats.snapshot();
        assert_eq!(snap.manual_remaps, 5);
        assert_eq!(snap.allocations, 5);
    }

    #[test]
    fn duplicate_manual_remap_leaks_nothing() {
        let (main, spare) = test_disks(256, 14);
        let disk = RemapDisk::create(main, spare, &test_args(14)).unwrap();

        disk.remap(7).unwrap();
        let before = disk.inner.pool.total_used();
        let err = disk.remap(7).unwrap_err();
        assert_eq!(err.errno(), Errno::DuplicateRemap);
        assert_eq!(disk.inner.pool.total_used(), before);
    }

    #[test]
    fn manual_remap_preserves_readable_content() {
        let (main, spare) = test_disks(MAIN_SECTORS, SPARE_SECTORS);
        let disk = RemapDisk::create(main, spare, &test_args(SPARE_SECTORS)).unwrap();

        disk.write(50, one_sector(0x77).as_ref()).unwrap();
        disk.remap(50).unwrap();
        assert_eq!(read_sector(&disk, 50).as_slice(), [0x77u8; SECTOR_SIZE]);
    }

    #[test]
    fn unremap_keeps_the_spare_sector_reserved() {
        let (main, spare) = test_disks(256, 14);
        let disk = RemapDisk::create(main, spare, &test_args(14)).unwrap();

        let ssa = disk.remap(9).unwrap();
        disk.unremap(9).unwrap();
        assert!(disk.inner.table.lookup(9).is_none());
        // The sector is not handed out again.
        let other = disk.remap(10).unwrap();
        assert_ne!(other, ssa);
        assert_eq!(
            disk.unremap(9).unwrap_err().errno(),
            Errno::InvalidArgs
        );
    }

    #[test]
    fn spare_sector_failure_is_not_remapped_again() {
        let (main, spare) = test_disks(MAIN_SECTORS, SPARE_SECTORS);
        let disk = RemapDisk::create(main, spare.clone(), &test_args(SPARE_SECTORS)).unwrap();

        let ssa = disk.remap(5).unwrap();
        spare.fail_reads(ssa);

        let mut buf = Buf::alloc(1).unwrap();
        let err = disk.read(5, buf.as_mut()).unwrap_err();
        assert_eq!(err.errno(), Errno::IoFailed);
        assert_eq!(disk.inner.stats.snapshot().spare_errors, 1);
        assert_eq!(disk.remapped(), 1);
    }

    #[test]
    fn disabled_auto_remap_fails_upward() {
        let (main, spare) = test_disks(MAIN_SECTORS, SPARE_SECTORS);
        let disk = RemapDisk::create(main.clone(), spare, &test_args(SPARE_SECTORS)).unwrap();

        disk.set_auto_remap(false);
        main.fail_reads(1234);
        let mut buf = Buf::alloc(1).unwrap();
        let err = disk.read(1234, buf.as_mut()).unwrap_err();
        assert_eq!(err.errno(), Errno::IoFailed);
        assert_eq!(disk.remapped(), 0);

        disk.set_auto_remap(true);
        disk.read(1234, buf.as_mut()).unwrap();
        assert_eq!(disk.remapped(), 1);
    }

    #[test]
    fn metadata_repair_after_losing_all_but_one_copy() {
        let (main, spare) = test_disks(MAIN_SECTORS, SPARE_SECTORS);
        let args = test_args(SPARE_SECTORS);
        let disk = RemapDisk::create(main.clone(), spare.clone(), &args).unwrap();

        disk.remap(11).unwrap();
        disk.save().unwrap();
        disk.remap(12).unwrap();
        disk.save().unwrap();
        let offsets = disk.inner.pool.get(0).unwrap().plan().offsets().to_vec();
        let record_sectors = disk.inner.pool.get(0).unwrap().plan().record_sectors();
        assert!(offsets.len() >= 2);
        disk.detach().unwrap();

        // Zero every copy except the last.
        let zeros = Buf::alloc(record_sectors as usize).unwrap();
        for &offset in &offsets[..offsets.len() - 1] {
            spare.write(offset, zeros.as_ref()).unwrap();
        }

        let disk = RemapDisk::open(main, vec![spare.clone()], &args).unwrap();
        assert_eq!(disk.remapped(), 2);
        check_invariants(&disk);

        // Attach repaired the damaged offsets with the winning record.
        let mut image = Buf::alloc(record_sectors as usize).unwrap();
        let mut sequences = Vec::new();
        for &offset in &offsets {
            spare.read(offset, image.as_mut()).unwrap();
            sequences.push(MetaRecord::decode(image.as_slice()).unwrap().record.sequence);
        }
        assert!(sequences.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn attach_with_no_intact_copy_is_fatal() {
        let (main, spare) = test_disks(MAIN_SECTORS, SPARE_SECTORS);
        let args = test_args(SPARE_SECTORS);
        let disk = RemapDisk::create(main.clone(), spare.clone(), &args).unwrap();
        let offsets = disk.inner.pool.get(0).unwrap().plan().offsets().to_vec();
        let record_sectors = disk.inner.pool.get(0).unwrap().plan().record_sectors();
        disk.detach().unwrap();

        let zeros = Buf::alloc(record_sectors as usize).unwrap();
        for &offset in &offsets {
            spare.write(offset, zeros.as_ref()).unwrap();
        }
        let err = RemapDisk::open(main, vec![spare], &args).unwrap_err();
        assert_eq!(err.errno(), Errno::MetadataCorrupt);
    }

    #[test]
    fn attach_rejects_a_foreign_main_device() {
        let (main, spare) = test_disks(MAIN_SECTORS, SPARE_SECTORS);
        let args = test_args(SPARE_SECTORS);
        RemapDisk::create(main.clone(), spare.clone(), &args)
            .unwrap()
            .detach()
            .unwrap();

        let mut foreign = args.clone();
        foreign.main_handle = "/dev/other-main".to_string();
        let err = RemapDisk::open(main, vec![spare], &foreign).unwrap_err();
        assert_eq!(err.errno(), Errno::MetadataCorrupt);
    }

    #[test]
    fn ultra_fast_path_never_walks_buckets() {
        let (main, spare) = test_disks(4096, SPARE_SECTORS);
        let disk = RemapDisk::create(main, spare, &test_args(SPARE_SECTORS)).unwrap();

        let mut buf = Buf::alloc(1).unwrap();
        for i in 0..1_000_000u64 {
            disk.read(i % 4096, buf.as_mut()).unwrap();
        }
        assert_eq!(disk.inner.table.traversals(), 0);
        assert_eq!(disk.inner.stats.snapshot().total_reads, 1_000_000);
    }

    #[test]
    fn ten_thousand_remaps_grow_the_table() {
        let (main, spare) = test_disks(16384, 16384);
        let disk = RemapDisk::create(main, spare, &test_args(16384)).unwrap();

        for lsa in 0..10_000 {
            disk.remap(lsa).unwrap();
        }
        assert!(disk.inner.table.bucket_count() >= 8192);
        for lsa in 0..10_000 {
            assert!(disk.inner.table.lookup(lsa).is_some());
        }
        check_invariants(&disk);
    }

    #[test]
    fn reattach_reproduces_table_and_bitmaps() {
        let (main, spare) = test_disks(MAIN_SECTORS, SPARE_SECTORS);
        let args = test_args(SPARE_SECTORS);
        let disk = RemapDisk::create(main.clone(), spare.clone(), &args).unwrap();

        for lsa in [3u64, 999, 4095, 8000] {
            disk.remap(lsa).unwrap();
        }
        let mut before = disk.inner.table.entries();
        before.sort_by_key(|e| e.lsa);
        disk.save().unwrap();
        disk.detach().unwrap();

        let disk = RemapDisk::open(main, vec![spare], &args).unwrap();
        let mut after = disk.inner.table.entries();
        after.sort_by_key(|e| e.lsa);
        assert_eq!(before, after);
        check_invariants(&disk);
    }

    #[test]
    fn detached_device_rejects_io() {
        let (main, spare) = test_disks(256, 14);
        let disk = RemapDisk::create(main, spare, &test_args(14)).unwrap();
        disk.detach().unwrap();
        // A second detach is a no-op.
        disk.detach().unwrap();

        let mut buf = Buf::alloc(1).unwrap();
        assert_eq!(
            disk.read(0, buf.as_mut()).unwrap_err().errno(),
            Errno::Quiesced
        );
        assert_eq!(
            disk.write(0, buf.as_ref()).unwrap_err().errno(),
            Errno::Quiesced
        );
        assert_eq!(disk.remap(0).unwrap_err().errno(), Errno::Quiesced);
    }

    #[test]
    fn async_requests_complete_with_remapping() {
        let (main, spare) = test_disks(MAIN_SECTORS, SPARE_SECTORS);
        let disk = RemapDisk::create(main.clone(), spare, &test_args(SPARE_SECTORS)).unwrap();

        main.fail_writes(301);
        let mut buf = Buf::alloc(2).unwrap();
        buf.as_mut_slice().fill(0xDD);
        let req = Arc::new(
            BioReqBuilder::new(BioType::Write)
                .addr(300)
                .bufs(vec![buf])
                .build(),
        );
        disk.submit(&req).unwrap();
        req.wait().unwrap();
        assert!(disk.inner.table.lookup(301).is_some());

        let req = Arc::new(
            BioReqBuilder::new(BioType::Read)
                .addr(300)
                .bufs(vec![Buf::alloc(2).unwrap()])
                .build(),
        );
        disk.submit(&req).unwrap();
        req.wait().unwrap();
        req.access_bufs_with(|bufs| {
            assert_eq!(bufs[0].as_slice(), [0xDDu8; 2 * SECTOR_SIZE]);
        });

        let req = Arc::new(BioReqBuilder::new(BioType::Sync).build());
        disk.submit(&req).unwrap();
        req.wait().unwrap();
        assert!(!disk.inner.store.is_dirty());
    }

    #[test]
    fn autosave_flushes_in_the_background() {
        let (main, spare) = test_disks(256, 14);
        let mut args = test_args(14);
        args.autosave_interval_secs = 1;
        let disk = RemapDisk::create(main, spare, &args).unwrap();

        disk.remap(1).unwrap();
        assert!(disk.inner.store.is_dirty());
        for _ in 0..50 {
            if !disk.inner.store.is_dirty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        assert!(!disk.inner.store.is_dirty());
    }

    #[test]
    fn concurrent_reads_and_remaps() {
        let (main, spare) = test_disks(4096, SPARE_SECTORS);
        let disk = Arc::new(
            RemapDisk::create(main, spare, &test_args(SPARE_SECTORS)).unwrap(),
        );

        let readers: Vec<_> = (0..4u64)
            .map(|t| {
                let disk = disk.clone();
                os::spawn(move || {
                    let mut buf = Buf::alloc(1).unwrap();
                    for i in 0..1000u64 {
                        disk.read((t * 1000 + i) % 4096, buf.as_mut()).unwrap();
                    }
                })
            })
            .collect();
        for lsa in 0..100 {
            disk.remap(lsa).unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(disk.remapped(), 100);
        check_invariants(&disk);
    }
}
