// SPDX-License-Identifier: MPL-2.0

//! A transparent bad-sector remapping layer over block devices.
//!
//! A `RemapDisk` interposes on every sector I/O of a main device. When the
//! medium fails a sector, the error path allocates a replacement on a pool
//! of spare devices, installs a permanent redirection, and re-issues the
//! transfer, so consumers keep seeing an ordinary block device of the same
//! size. The mapping survives restarts through redundant, checksummed
//! metadata records stored on the spares themselves.

#![deny(unsafe_code)]

mod error;
mod layers;
mod os;
mod prelude;
mod util;

pub use self::{
    error::{Errno, Error},
    layers::{
        bio::{BlockSet, Buf, BufMut, BufRef, FaultDisk, MemDisk, Sector, SECTOR_SIZE},
        disk::{
            global_config, init_global_config, teardown_global_config, BioReq, BioReqBuilder,
            BioReqOnCompleteFn, BioResp, BioType, GlobalConfig, RemapDisk, SpareResolver,
            TargetArgs,
        },
        map::{HealthState, HealthStats, RemapTable, SpareAlloc, SpareDevice, SparePool,
            StatsSnapshot},
        meta::{
            DeviceIdentity, MetaRecord, MetaStore, PlacementPlan, PlacementStrategy, RemapEntry,
            RemapFlags, SpareDesc,
        },
    },
};
