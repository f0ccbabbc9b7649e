// SPDX-License-Identifier: MPL-2.0

//! The sector I/O interface.

use core::ops::Range;

use super::{Buf, BufMut, BufRef, Sector};
use crate::{
    os::{HashSet, Mutex},
    prelude::*,
};

/// Random-access sector storage.
///
/// # Thread safety
///
/// Implementations are interiorly mutable and safe to drive from many
/// threads at once. Single-sector atomicity is the contract: a concurrent
/// reader of any one sector observes its old bytes or its new bytes,
/// never a blend.
pub trait BlockSet: Send + Sync {
    /// Reads whole sectors starting at `pos`.
    fn read(&self, pos: Sector, buf: BufMut) -> Result<()>;

    /// Writes whole sectors starting at `pos`.
    fn write(&self, pos: Sector, buf: BufRef) -> Result<()>;

    /// Narrows to the sectors in `range`.
    fn subset(&self, range: Range<Sector>) -> Result<Self>
    where
        Self: Sized;

    /// Makes completed writes durable.
    fn flush(&self) -> Result<()>;

    /// The device size in sectors.
    fn nsectors(&self) -> Sector;

    /// Reads `buf.len()` bytes at the byte `offset`.
    ///
    /// The sector-aligned body of the span moves directly into `buf`;
    /// only a partial head or tail sector goes through a one-sector
    /// scratch buffer.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let span = ByteSpan::of(self, offset, buf.len())?;

        let mut pos = span.first;
        let mut filled = 0;
        if span.head != 0 {
            let mut scratch = Buf::alloc(1)?;
            self.read(pos, scratch.as_mut())?;
            let take = (SECTOR_SIZE - span.head).min(buf.len());
            buf[..take].copy_from_slice(&scratch.as_slice()[span.head..span.head + take]);
            filled = take;
            pos += 1;
        }

        let body = (buf.len() - filled) / SECTOR_SIZE * SECTOR_SIZE;
        if body != 0 {
            self.read(pos, BufMut::from_slice(&mut buf[filled..filled + body])?)?;
            filled += body;
            pos += (body / SECTOR_SIZE) as Sector;
        }

        if filled < buf.len() {
            let mut scratch = Buf::alloc(1)?;
            self.read(pos, scratch.as_mut())?;
            let rest = buf.len() - filled;
            buf[filled..].copy_from_slice(&scratch.as_slice()[..rest]);
        }
        Ok(())
    }

    /// Writes `buf.len()` bytes at the byte `offset`.
    ///
    /// Partial head and tail sectors are read-modify-written through a
    /// one-sector scratch; the aligned body is written straight from
    /// `buf`.
    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<()> {
        let span = ByteSpan::of(self, offset, buf.len())?;

        let mut pos = span.first;
        let mut taken = 0;
        if span.head != 0 {
            let mut scratch = Buf::alloc(1)?;
            self.read(pos, scratch.as_mut())?;
            let take = (SECTOR_SIZE - span.head).min(buf.len());
            scratch.as_mut_slice()[span.head..span.head + take].copy_from_slice(&buf[..take]);
            self.write(pos, scratch.as_ref())?;
            taken = take;
            pos += 1;
        }

        let body = (buf.len() - taken) / SECTOR_SIZE * SECTOR_SIZE;
        if body != 0 {
            self.write(pos, BufRef::from_slice(&buf[taken..taken + body])?)?;
            taken += body;
            pos += (body / SECTOR_SIZE) as Sector;
        }

        if taken < buf.len() {
            let mut scratch = Buf::alloc(1)?;
            self.read(pos, scratch.as_mut())?;
            let rest = buf.len() - taken;
            scratch.as_mut_slice()[..rest].copy_from_slice(&buf[taken..]);
            self.write(pos, scratch.as_ref())?;
        }
        Ok(())
    }
}

/// A validated byte span: its first sector and the offset into it.
struct ByteSpan {
    first: Sector,
    head: usize,
}

impl ByteSpan {
    fn of<D: BlockSet + ?Sized>(disk: &D, offset: usize, len: usize) -> Result<Self> {
        let Some(end) = offset.checked_add(len) else {
            return_errno_with_msg!(InvalidArgs, "byte span overflows");
        };
        if len == 0 || (end as u64).div_ceil(SECTOR_SIZE as u64) > disk.nsectors() {
            return_errno_with_msg!(InvalidArgs, "byte span is empty or past the end");
        }
        Ok(Self {
            first: (offset / SECTOR_SIZE) as Sector,
            head: offset % SECTOR_SIZE,
        })
    }
}

/// Memory-backed sector storage.
///
/// Clones share the same backing bytes and `subset` narrows the visible
/// window, so one allocation can stand in for a disk and any number of
/// partitions of it.
#[derive(Clone)]
pub struct MemDisk {
    bytes: Arc<Mutex<Box<[u8]>>>,
    base: Sector,
    len: Sector,
}

impl MemDisk {
    /// A zero-filled disk of `num_sectors` sectors.
    pub fn create(num_sectors: Sector) -> Result<Self> {
        if num_sectors == 0 {
            return_errno_with_msg!(InvalidArgs, "a disk needs at least one sector");
        }
        let bytes = vec![0u8; num_sectors as usize * SECTOR_SIZE].into_boxed_slice();
        Ok(Self {
            bytes: Arc::new(Mutex::new(bytes)),
            base: 0,
            len: num_sectors,
        })
    }

    fn byte_range(&self, pos: Sector, nsectors: usize) -> Result<Range<usize>> {
        if pos + nsectors as Sector > self.len {
            return_errno_with_msg!(InvalidArgs, "I/O runs past the end of the disk");
        }
        let start = (self.base + pos) as usize * SECTOR_SIZE;
        Ok(start..start + nsectors * SECTOR_SIZE)
    }
}

impl BlockSet for MemDisk {
    fn read(&self, pos: Sector, mut buf: BufMut) -> Result<()> {
        let range = self.byte_range(pos, buf.nsectors())?;
        let bytes = self.bytes.lock();
        buf.as_mut_slice().copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write(&self, pos: Sector, buf: BufRef) -> Result<()> {
        let range = self.byte_range(pos, buf.nsectors())?;
        let mut bytes = self.bytes.lock();
        bytes[range].copy_from_slice(buf.as_slice());
        Ok(())
    }

    fn subset(&self, range: Range<Sector>) -> Result<Self> {
        if range.start > range.end || range.end > self.len {
            return_errno_with_msg!(InvalidArgs, "subset range is outside the disk");
        }
        Ok(Self {
            bytes: self.bytes.clone(),
            base: self.base + range.start,
            len: range.end - range.start,
        })
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn nsectors(&self) -> Sector {
        self.len
    }
}

/// A `BlockSet` wrapper that injects I/O failures on chosen sectors.
///
/// Remapping layers exist to keep failing hardware in service, so the crate
/// ships a reproducible way to fail: any sector can be marked bad for reads,
/// writes, or both, and healed again. An I/O touching a marked sector fails
/// with `IoFailed` without reaching the inner device.
#[derive(Clone)]
pub struct FaultDisk<D> {
    inner: D,
    bad_reads: Arc<Mutex<HashSet<Sector>>>,
    bad_writes: Arc<Mutex<HashSet<Sector>>>,
}

impl<D: BlockSet> FaultDisk<D> {
    /// Wrap a `BlockSet` with fault injection; all sectors start healthy.
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            bad_reads: Arc::new(Mutex::new(HashSet::new())),
            bad_writes: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Make reads of `sector` fail.
    pub fn fail_reads(&self, sector: Sector) {
        self.bad_reads.lock().insert(sector);
    }

    /// Make writes of `sector` fail.
    pub fn fail_writes(&self, sector: Sector) {
        self.bad_writes.lock().insert(sector);
    }

    /// Clear any injected fault on `sector`.
    pub fn heal(&self, sector: Sector) {
        self.bad_reads.lock().remove(&sector);
        self.bad_writes.lock().remove(&sector);
    }

    fn hits(set: &Mutex<HashSet<Sector>>, pos: Sector, nsectors: usize) -> bool {
        let set = set.lock();
        if set.is_empty() {
            return false;
        }
        (pos..pos + nsectors as Sector).any(|s| set.contains(&s))
    }
}

impl<D: BlockSet> BlockSet for FaultDisk<D> {
    fn read(&self, pos: Sector, buf: BufMut) -> Result<()> {
        if Self::hits(&self.bad_reads, pos, buf.nsectors()) {
            return_errno_with_msg!(IoFailed, "injected read fault");
        }
        self.inner.read(pos, buf)
    }

    fn write(&self, pos: Sector, buf: BufRef) -> Result<()> {
        if Self::hits(&self.bad_writes, pos, buf.nsectors()) {
            return_errno_with_msg!(IoFailed, "injected write fault");
        }
        self.inner.write(pos, buf)
    }

    fn subset(&self, range: Range<Sector>) -> Result<Self> {
        // Fault marks address the wrapper's own sector space; a shifted
        // subset would silently re-address them.
        if range.start != 0 {
            return_errno_with_msg!(InvalidArgs, "fault disk subset must start at 0");
        }
        Ok(Self {
            inner: self.inner.subset(range)?,
            bad_reads: self.bad_reads.clone(),
            bad_writes: self.bad_writes.clone(),
        })
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn nsectors(&self) -> Sector {
        self.inner.nsectors()
    }
}
