// SPDX-License-Identifier: MPL-2.0

//! The layer of raw sector I/O.

mod block_buf;
mod block_set;

use static_assertions::const_assert_eq;

pub use self::{
    block_buf::{Buf, BufMut, BufRef},
    block_set::{BlockSet, FaultDisk, MemDisk},
};

/// An index of a sector on some device.
pub type Sector = u64;
/// The unit of all device I/O, in bytes.
pub const SECTOR_SIZE: usize = 512;

// This definition of `Sector` assumes the target architecture is 64-bit.
const_assert_eq!(core::mem::size_of::<Sector>(), 8);
const_assert_eq!(core::mem::size_of::<usize>(), 8);
