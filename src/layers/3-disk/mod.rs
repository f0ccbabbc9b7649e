// SPDX-License-Identifier: MPL-2.0

//! The layer of the remap device itself.
//!
//! `remap_disk` owns the hot-path router, the deferred error path and the
//! device lifecycle; `bio` is its asynchronous request surface, `worker`
//! its background thread, and `control` its operator channel.

mod bio;
mod control;
mod remap_disk;
mod worker;

pub use self::{
    bio::{BioReq, BioReqBuilder, BioReqOnCompleteFn, BioResp, BioType},
    control::{
        global_config, init_global_config, teardown_global_config, GlobalConfig, TargetArgs,
    },
    remap_disk::{RemapDisk, SpareResolver},
};
