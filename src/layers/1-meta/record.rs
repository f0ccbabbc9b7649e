// SPDX-License-Identifier: MPL-2.0

//! The on-disk metadata record.
//!
//! One record image holds everything needed to rebuild a remap device:
//! the device identity, the spare-pool descriptor and the full remap table.
//! Every copy of a given sequence number is bytewise identical except for
//! its `copy_index` header field, and every copy is self-describing: the
//! header names all copy offsets, so any surviving copy locates the rest.
//!
//! All multi-byte integers are little-endian. The header is a fixed 128
//! bytes; the body is padded with zeros to `record_size_total`, which is
//! fixed when the device is formatted.

use bitflags::bitflags;
use sha2::{Digest, Sha256};
use static_assertions::const_assert_eq;

use super::placement::{PlacementPlan, PlacementStrategy};
use crate::{
    layers::bio::Buf,
    prelude::*,
};

/// "RMAP" in little-endian byte order.
pub const META_MAGIC: u32 = u32::from_le_bytes(*b"RMAP");
/// The only record format this crate reads or writes.
pub const FORMAT_VERSION: u32 = 3;
/// The fixed header length in bytes.
pub const HEADER_SIZE: usize = 128;
/// The hard cap on one record image.
pub const MAX_RECORD_SIZE: usize = 16 << 20;
/// The most spare devices one pool can hold.
pub const MAX_POOL_SPARES: usize = 8;

/// Header slots for copy offsets; at most `MAX_COPIES` are in use.
const COPY_OFFSET_SLOTS: usize = 8;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_RECORD_SIZE: usize = 8;
const OFF_HEADER_CSUM: usize = 12;
const OFF_BODY_CSUM: usize = 16;
const OFF_SEQUENCE: usize = 20;
const OFF_CREATED: usize = 28;
const OFF_UPDATED: usize = 36;
const OFF_COPY_INDEX: usize = 44;
const OFF_TOTAL_COPIES: usize = 48;
const OFF_STRATEGY: usize = 52;
const OFF_SPARE_CAPACITY: usize = 56;
const OFF_COPY_OFFSETS: usize = 64;

const_assert_eq!(OFF_COPY_OFFSETS + 8 * COPY_OFFSET_SLOTS, HEADER_SIZE);

/// Bytes of the device identity block at the start of the body.
const IDENTITY_SIZE: usize = 32 + 16 + 8 + 4;
/// Worst-case bytes of the spare-pool descriptor.
const POOL_DESC_MAX: usize = 4 + MAX_POOL_SPARES * (8 + 16);
/// Bytes of one packed remap entry.
const ENTRY_SIZE: usize = 36;
/// Bytes of everything in a record except the packed entries.
const RECORD_FIXED: usize = HEADER_SIZE + IDENTITY_SIZE + POOL_DESC_MAX + 8;

/// The record image size, in bytes, for a spare of the given capacity.
///
/// Sized for one entry per spare sector so the image never outgrows its
/// reservation, capped at `MAX_RECORD_SIZE` and rounded up to whole sectors.
pub fn record_size_for(spare_capacity: Sector) -> usize {
    let max_entries = (spare_capacity as usize).min((MAX_RECORD_SIZE - RECORD_FIXED) / ENTRY_SIZE);
    align_up(RECORD_FIXED + max_entries * ENTRY_SIZE, SECTOR_SIZE)
}

bitflags! {
    /// How a remap entry came to exist.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RemapFlags: u16 {
        /// Installed by the error path after an I/O failure.
        const AUTO = 1 << 0;
        /// Installed by an operator command.
        const MANUAL = 1 << 1;
    }
}

/// One durable binding of a logical sector to a spare sector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemapEntry {
    /// The logical sector this entry redirects.
    pub lsa: Sector,
    /// The replacement sector on the spare device.
    pub ssa: Sector,
    /// Position of the spare device in the pool.
    pub spare_index: u16,
    /// Origin of the entry.
    pub flags: RemapFlags,
    /// Seconds since the epoch at installation.
    pub created_at: u64,
    /// Advisory access count; persisted but never advanced.
    pub hit_count: u32,
}

/// Identity of the devices a record belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// SHA-256 of the main device's handle and size.
    pub main_fingerprint: [u8; 32],
    /// UUID of the primary spare device.
    pub spare_uuid: [u8; 16],
    /// Capacity of the primary spare at format time, in sectors.
    pub spare_size: u64,
    /// The sector size every device must share.
    pub sector_size: u32,
}

impl DeviceIdentity {
    /// Fingerprints a main device from its handle string and size.
    pub fn fingerprint(handle: &str, nsectors: Sector) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(handle.as_bytes());
        hasher.update(nsectors.to_le_bytes());
        hasher.finalize().into()
    }
}

/// One spare device as recorded in the pool descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpareDesc {
    /// Capacity in sectors.
    pub capacity: Sector,
    /// UUID assigned when the spare joined the pool.
    pub uuid: [u8; 16],
}

/// The logical content of a metadata record, shared by all copies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaRecord {
    /// Monotonic flush sequence number.
    pub sequence: u64,
    /// Seconds since the epoch when the device was formatted.
    pub created_at: u64,
    /// Seconds since the epoch at the last flush.
    pub updated_at: u64,
    /// Main/spare identity block.
    pub identity: DeviceIdentity,
    /// The spare-pool descriptor, in pool order.
    pub spares: Vec<SpareDesc>,
    /// The remap table payload.
    pub entries: Vec<RemapEntry>,
}

/// A record image decoded from one copy, with its per-copy header fields.
#[derive(Clone, Debug)]
pub struct DecodedCopy {
    /// The copy-independent record content.
    pub record: MetaRecord,
    /// Which copy this image was written as.
    pub copy_index: u32,
    /// How many copies were written at this sequence.
    pub total_copies: u32,
    /// The placement strategy of the copy set.
    pub strategy: PlacementStrategy,
    /// All copy offsets of the set, as named by this copy.
    pub copy_offsets: Vec<Sector>,
    /// The full image size in bytes.
    pub record_size_total: u32,
    /// Capacity of the hosting spare when this copy was written.
    pub spare_capacity_at_write: u64,
}

impl DecodedCopy {
    /// The body bytes of this copy, for divergence comparison.
    pub fn body<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        &image[HEADER_SIZE..self.record_size_total as usize]
    }
}

fn crc32_of(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn put_u16(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return_errno_with_msg!(MetadataCorrupt, "record body truncated");
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

impl MetaRecord {
    /// Serializes this record as copy `copy_index` of the given placement.
    ///
    /// The image length is `plan.record_sectors()` sectors; both checksums
    /// are recomputed.
    pub fn encode(
        &self,
        plan: &PlacementPlan,
        copy_index: u32,
        spare_capacity: Sector,
    ) -> Result<Buf> {
        let total = plan.record_sectors() as usize * SECTOR_SIZE;
        let needed = HEADER_SIZE
            + IDENTITY_SIZE
            + 4
            + self.spares.len() * 24
            + 8
            + self.entries.len() * ENTRY_SIZE;
        if total > MAX_RECORD_SIZE || needed > total {
            return_errno_with_msg!(InvalidArgs, "record image overflows its reservation");
        }
        if self.spares.len() > MAX_POOL_SPARES {
            return_errno_with_msg!(InvalidArgs, "too many spares for the pool descriptor");
        }
        if copy_index as usize >= plan.offsets().len() {
            return_errno_with_msg!(InvalidArgs, "copy index out of range");
        }

        let mut image = Buf::alloc(plan.record_sectors() as usize)?;
        let bytes = image.as_mut_slice();

        let mut w = Writer::new(bytes);
        w.put_u32(META_MAGIC);
        w.put_u32(FORMAT_VERSION);
        w.put_u32(total as u32);
        w.put_u32(0); // header checksum, patched below
        w.put_u32(0); // body checksum, patched below
        w.put_u64(self.sequence);
        w.put_u64(self.created_at);
        w.put_u64(self.updated_at);
        w.put_u32(copy_index);
        w.put_u32(plan.offsets().len() as u32);
        w.put_u32(plan.strategy() as u32);
        w.put_u64(spare_capacity);
        for slot in 0..COPY_OFFSET_SLOTS {
            w.put_u64(plan.offsets().get(slot).copied().unwrap_or(0));
        }
        debug_assert_eq!(w.pos, HEADER_SIZE);

        w.put(&self.identity.main_fingerprint);
        w.put(&self.identity.spare_uuid);
        w.put_u64(self.identity.spare_size);
        w.put_u32(self.identity.sector_size);
        w.put_u32(self.spares.len() as u32);
        for spare in &self.spares {
            w.put_u64(spare.capacity);
            w.put(&spare.uuid);
        }
        w.put_u64(self.entries.len() as u64);
        for entry in &self.entries {
            w.put_u64(entry.lsa);
            w.put_u64(entry.ssa);
            w.put_u16(entry.spare_index);
            w.put_u16(entry.flags.bits());
            w.put_u64(entry.created_at);
            w.put_u32(entry.hit_count);
            w.put_u32(0);
        }

        let body_csum = crc32_of(&[&bytes[HEADER_SIZE..total]]);
        bytes[OFF_BODY_CSUM..OFF_BODY_CSUM + 4].copy_from_slice(&body_csum.to_le_bytes());
        let header_csum = crc32_of(&[&bytes[..OFF_HEADER_CSUM], &bytes[OFF_BODY_CSUM..HEADER_SIZE]]);
        bytes[OFF_HEADER_CSUM..OFF_HEADER_CSUM + 4].copy_from_slice(&header_csum.to_le_bytes());

        Ok(image)
    }

    /// Deserializes one copy image.
    ///
    /// Validation order: header checksum, stated record size against the
    /// buffer, body checksum, magic, version. A checksum failure yields
    /// `MetadataCorrupt` so the caller can try another copy; an unknown
    /// version is `VersionUnsupported` and final.
    pub fn decode(bytes: &[u8]) -> Result<DecodedCopy> {
        if bytes.len() < HEADER_SIZE {
            return_errno_with_msg!(MetadataCorrupt, "record shorter than its header");
        }

        let header_csum = u32::from_le_bytes(
            bytes[OFF_HEADER_CSUM..OFF_HEADER_CSUM + 4]
                .try_into()
                .unwrap(),
        );
        let computed = crc32_of(&[&bytes[..OFF_HEADER_CSUM], &bytes[OFF_BODY_CSUM..HEADER_SIZE]]);
        if header_csum != computed {
            return_errno_with_msg!(MetadataCorrupt, "header checksum mismatch");
        }

        let record_size = u32::from_le_bytes(
            bytes[OFF_RECORD_SIZE..OFF_RECORD_SIZE + 4]
                .try_into()
                .unwrap(),
        ) as usize;
        if record_size < HEADER_SIZE + IDENTITY_SIZE
            || record_size > MAX_RECORD_SIZE
            || record_size > bytes.len()
        {
            return_errno_with_msg!(MetadataCorrupt, "stated record size out of range");
        }

        let body_csum =
            u32::from_le_bytes(bytes[OFF_BODY_CSUM..OFF_BODY_CSUM + 4].try_into().unwrap());
        if body_csum != crc32_of(&[&bytes[HEADER_SIZE..record_size]]) {
            return_errno_with_msg!(MetadataCorrupt, "body checksum mismatch");
        }

        let magic = u32::from_le_bytes(bytes[OFF_MAGIC..OFF_MAGIC + 4].try_into().unwrap());
        if magic != META_MAGIC {
            return_errno_with_msg!(MetadataCorrupt, "bad magic");
        }
        let version = u32::from_le_bytes(bytes[OFF_VERSION..OFF_VERSION + 4].try_into().unwrap());
        if version != FORMAT_VERSION {
            return_errno_with_msg!(VersionUnsupported, "unknown record format version");
        }

        let mut r = Reader::new(&bytes[OFF_SEQUENCE..HEADER_SIZE]);
        let sequence = r.get_u64()?;
        let created_at = r.get_u64()?;
        let updated_at = r.get_u64()?;
        let copy_index = r.get_u32()?;
        let total_copies = r.get_u32()?;
        let strategy = PlacementStrategy::from_raw(r.get_u32()?)?;
        let spare_capacity_at_write = r.get_u64()?;
        let mut copy_offsets = Vec::with_capacity(COPY_OFFSET_SLOTS);
        for _ in 0..COPY_OFFSET_SLOTS {
            copy_offsets.push(r.get_u64()?);
        }
        if total_copies == 0
            || total_copies as usize > super::placement::MAX_COPIES
            || copy_index >= total_copies
        {
            return_errno_with_msg!(MetadataCorrupt, "copy bookkeeping out of range");
        }
        copy_offsets.truncate(total_copies as usize);

        let mut r = Reader::new(&bytes[HEADER_SIZE..record_size]);
        let mut main_fingerprint = [0u8; 32];
        main_fingerprint.copy_from_slice(r.take(32)?);
        let mut spare_uuid = [0u8; 16];
        spare_uuid.copy_from_slice(r.take(16)?);
        let spare_size = r.get_u64()?;
        let sector_size = r.get_u32()?;
        if sector_size as usize != SECTOR_SIZE {
            return_errno_with_msg!(MetadataCorrupt, "record uses a foreign sector size");
        }

        let nspares = r.get_u32()? as usize;
        if nspares == 0 || nspares > MAX_POOL_SPARES {
            return_errno_with_msg!(MetadataCorrupt, "spare count out of range");
        }
        let mut spares = Vec::with_capacity(nspares);
        for _ in 0..nspares {
            let capacity = r.get_u64()?;
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(r.take(16)?);
            spares.push(SpareDesc { capacity, uuid });
        }

        let nentries = r.get_u64()? as usize;
        if nentries > (record_size - HEADER_SIZE) / ENTRY_SIZE {
            return_errno_with_msg!(MetadataCorrupt, "entry count exceeds the record body");
        }
        let mut entries = Vec::with_capacity(nentries);
        for _ in 0..nentries {
            let lsa = r.get_u64()?;
            let ssa = r.get_u64()?;
            let spare_index = r.get_u16()?;
            let flags = RemapFlags::from_bits_truncate(r.get_u16()?);
            let created_at = r.get_u64()?;
            let hit_count = r.get_u32()?;
            let _reserved = r.get_u32()?;
            if spare_index as usize >= nspares {
                return_errno_with_msg!(MetadataCorrupt, "entry names a spare outside the pool");
            }
            entries.push(RemapEntry {
                lsa,
                ssa,
                spare_index,
                flags,
                created_at,
                hit_count,
            });
        }

        Ok(DecodedCopy {
            record: MetaRecord {
                sequence,
                created_at,
                updated_at,
                identity: DeviceIdentity {
                    main_fingerprint,
                    spare_uuid,
                    spare_size,
                    sector_size,
                },
                spares,
                entries,
            },
            copy_index,
            total_copies,
            strategy,
            copy_offsets,
            record_size_total: record_size as u32,
            spare_capacity_at_write,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::Errno, layers::meta::placement::PlacementPlan};

    fn sample_record() -> MetaRecord {
        MetaRecord {
            sequence: 7,
            created_at: 1_700_000_000,
            updated_at: 1_700_000_060,
            identity: DeviceIdentity {
                main_fingerprint: DeviceIdentity::fingerprint("/dev/sda", 409600),
                spare_uuid: [0xAB; 16],
                spare_size: 16384,
                sector_size: SECTOR_SIZE as u32,
            },
            spares: vec![SpareDesc {
                capacity: 16384,
                uuid: [0xAB; 16],
            }],
            entries: vec![
                RemapEntry {
                    lsa: 2000,
                    ssa: 1160,
                    spare_index: 0,
                    flags: RemapFlags::AUTO,
                    created_at: 1_700_000_030,
                    hit_count: 0,
                },
                RemapEntry {
                    lsa: 31,
                    ssa: 1161,
                    spare_index: 0,
                    flags: RemapFlags::MANUAL,
                    created_at: 1_700_000_040,
                    hit_count: 0,
                },
            ],
        }
    }

    fn sample_plan() -> PlacementPlan {
        let record_sectors = sectors_for(record_size_for(16384));
        PlacementPlan::plan(16384, record_sectors).unwrap()
    }

    #[test]
    fn encode_decode_round_trip() {
        let record = sample_record();
        let plan = sample_plan();
        let image = record.encode(&plan, 1, 16384).unwrap();

        let decoded = MetaRecord::decode(image.as_slice()).unwrap();
        assert_eq!(decoded.record, record);
        assert_eq!(decoded.copy_index, 1);
        assert_eq!(decoded.total_copies as usize, plan.offsets().len());
        assert_eq!(decoded.strategy, plan.strategy());
        assert_eq!(decoded.copy_offsets, plan.offsets());
        assert_eq!(decoded.spare_capacity_at_write, 16384);

        // Re-encoding the decoded record reproduces the image bit for bit.
        let replan = PlacementPlan::from_parts(
            decoded.strategy,
            decoded.copy_offsets.clone(),
            sectors_for(decoded.record_size_total as usize),
        )
        .unwrap();
        let reimage = decoded
            .record
            .encode(&replan, decoded.copy_index, decoded.spare_capacity_at_write)
            .unwrap();
        assert_eq!(reimage.as_slice(), image.as_slice());
    }

    #[test]
    fn header_checksum_guards_every_byte() {
        let image = sample_record().encode(&sample_plan(), 0, 16384).unwrap();

        for tamper in [0usize, 5, 9, 21, 45, 57, 70, 127] {
            let mut bytes = image.as_slice().to_vec();
            bytes[tamper] ^= 0x40;
            let err = MetaRecord::decode(&bytes).unwrap_err();
            assert_eq!(err.errno(), Errno::MetadataCorrupt, "offset {}", tamper);
        }
    }

    #[test]
    fn body_checksum_guards_entries() {
        let image = sample_record().encode(&sample_plan(), 0, 16384).unwrap();
        let mut bytes = image.as_slice().to_vec();
        bytes[HEADER_SIZE + 100] ^= 0x01;
        let err = MetaRecord::decode(&bytes).unwrap_err();
        assert_eq!(err.errno(), Errno::MetadataCorrupt);
    }

    #[test]
    fn unknown_version_is_final() {
        let image = sample_record().encode(&sample_plan(), 0, 16384).unwrap();
        let mut bytes = image.as_slice().to_vec();
        // Patch the version and both checksums so only the version is wrong.
        bytes[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&99u32.to_le_bytes());
        let header_csum = crc32_of(&[&bytes[..OFF_HEADER_CSUM], &bytes[OFF_BODY_CSUM..HEADER_SIZE]]);
        bytes[OFF_HEADER_CSUM..OFF_HEADER_CSUM + 4].copy_from_slice(&header_csum.to_le_bytes());

        let err = MetaRecord::decode(&bytes).unwrap_err();
        assert_eq!(err.errno(), Errno::VersionUnsupported);
    }

    #[test]
    fn truncated_image_is_corrupt() {
        let image = sample_record().encode(&sample_plan(), 0, 16384).unwrap();
        let err = MetaRecord::decode(&image.as_slice()[..64]).unwrap_err();
        assert_eq!(err.errno(), Errno::MetadataCorrupt);
    }

    #[test]
    fn zeroed_image_is_corrupt() {
        let zeros = vec![0u8; record_size_for(16384)];
        assert!(MetaRecord::decode(&zeros).is_err());
    }

    #[test]
    fn record_size_is_sector_aligned_and_capped() {
        for capacity in [14u64, 100, 16384, 1 << 30] {
            let size = record_size_for(capacity);
            assert_eq!(size % SECTOR_SIZE, 0);
            assert!(size <= MAX_RECORD_SIZE);
        }
        assert_eq!(record_size_for(1 << 40), record_size_for(1 << 41));
    }
}
