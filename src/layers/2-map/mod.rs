// SPDX-License-Identifier: MPL-2.0

//! The layer of in-memory mapping state.
//!
//! `table` answers the per-request question "is this sector remapped?",
//! `alloc` hands out replacement sectors on one spare, `pool` orders the
//! spares and spreads allocation across them, and `stats` keeps the
//! counters a remap device reports.

mod alloc;
mod pool;
mod stats;
mod table;

pub use self::{
    alloc::SpareAlloc,
    pool::{SpareDevice, SparePool},
    stats::{HealthState, HealthStats, StatsSnapshot},
    table::RemapTable,
};
