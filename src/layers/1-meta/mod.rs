// SPDX-License-Identifier: MPL-2.0

//! The layer of persistent metadata.
//!
//! A remap device stores one flat, checksummed metadata record in several
//! redundant copies on each spare device. `record` defines the byte-exact
//! image and its codec, `placement` chooses where the copies live on a spare
//! of a given size, and `store` writes, recovers and repairs the copy set.

mod placement;
mod record;
mod store;

pub use self::{
    placement::{PlacementPlan, PlacementStrategy, GEOMETRIC_OFFSETS, MAX_COPIES},
    record::{
        record_size_for, DecodedCopy, DeviceIdentity, MetaRecord, RemapEntry, RemapFlags,
        SpareDesc, FORMAT_VERSION, HEADER_SIZE, MAX_POOL_SPARES, MAX_RECORD_SIZE,
    },
    store::{FlushSite, MetaStore},
};
