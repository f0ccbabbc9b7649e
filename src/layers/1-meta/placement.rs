// SPDX-License-Identifier: MPL-2.0

//! Metadata copy placement.
//!
//! Given the capacity of a spare device and the sector-rounded size of one
//! metadata record image, the planner picks where the redundant copies go.
//! Spread-out copies survive localized media damage, so the widely spaced
//! geometric pattern is preferred, then an evenly spaced linear layout, and
//! as a last resort copies packed end-to-end from sector 0.

use core::ops::Range;

use crate::prelude::*;

/// The preferred copy offsets, in sectors.
pub const GEOMETRIC_OFFSETS: [Sector; 5] = [0, 1024, 2048, 4096, 8192];

/// The most copies ever placed on one spare device.
pub const MAX_COPIES: usize = 5;

/// How the copy offsets of a spare device were chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PlacementStrategy {
    /// Copies packed end-to-end from sector 0.
    Minimal = 0,
    /// Copies at the largest equal spacing that fits.
    Linear = 1,
    /// Copies at the fixed spread-out offsets.
    Geometric = 2,
}

impl PlacementStrategy {
    /// Decodes the on-disk strategy tag.
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Minimal),
            1 => Ok(Self::Linear),
            2 => Ok(Self::Geometric),
            _ => Err(Error::with_msg(MetadataCorrupt, "unknown placement strategy")),
        }
    }
}

/// The copy layout chosen for one spare device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementPlan {
    strategy: PlacementStrategy,
    offsets: Vec<Sector>,
    record_sectors: Sector,
}

impl PlacementPlan {
    /// Chooses copy offsets for a spare of `capacity` sectors holding record
    /// images of `record_sectors` sectors each.
    pub fn plan(capacity: Sector, record_sectors: Sector) -> Result<Self> {
        debug_assert!(record_sectors > 0);
        // The smallest usable spare holds one copy plus one allocatable sector.
        if capacity < record_sectors + 1 {
            return_errno_with_msg!(SpareTooSmall, "spare cannot hold metadata and one sector");
        }

        if let Some(plan) = Self::plan_geometric(capacity, record_sectors) {
            return Ok(plan);
        }
        if let Some(plan) = Self::plan_linear(capacity, record_sectors) {
            return Ok(plan);
        }
        Ok(Self::plan_minimal(capacity, record_sectors))
    }

    /// The longest usable prefix of `GEOMETRIC_OFFSETS`; `None` unless it
    /// yields the two copies needed for redundancy.
    fn plan_geometric(capacity: Sector, record_sectors: Sector) -> Option<Self> {
        let mut offsets = Vec::new();
        for &offset in GEOMETRIC_OFFSETS.iter() {
            if offset + record_sectors > capacity {
                break;
            }
            if let Some(&prev) = offsets.last() {
                if offset < prev + record_sectors {
                    break;
                }
            }
            offsets.push(offset);
        }
        if offsets.len() < 2 {
            return None;
        }
        Some(Self {
            strategy: PlacementStrategy::Geometric,
            offsets,
            record_sectors,
        })
    }

    /// The largest `k` in 2..=5 copies at the widest equal spacing, first
    /// copy at sector 0.
    fn plan_linear(capacity: Sector, record_sectors: Sector) -> Option<Self> {
        let k = (2..=MAX_COPIES as Sector)
            .rev()
            .find(|k| k * record_sectors <= capacity)?;
        let spacing = (capacity - record_sectors) / (k - 1);
        let offsets = (0..k).map(|i| i * spacing).collect();
        Some(Self {
            strategy: PlacementStrategy::Linear,
            offsets,
            record_sectors,
        })
    }

    fn plan_minimal(capacity: Sector, record_sectors: Sector) -> Self {
        let count = (capacity / record_sectors).clamp(1, MAX_COPIES as Sector);
        let offsets = (0..count).map(|i| i * record_sectors).collect();
        Self {
            strategy: PlacementStrategy::Minimal,
            offsets,
            record_sectors,
        }
    }

    /// Rebuilds the plan recorded inside a decoded metadata copy.
    pub fn from_parts(
        strategy: PlacementStrategy,
        offsets: Vec<Sector>,
        record_sectors: Sector,
    ) -> Result<Self> {
        if offsets.is_empty() || offsets.len() > MAX_COPIES {
            return_errno_with_msg!(MetadataCorrupt, "copy offset count out of range");
        }
        if !offsets.windows(2).all(|w| w[0] + record_sectors <= w[1]) {
            return_errno_with_msg!(MetadataCorrupt, "copy offsets overlap or not increasing");
        }
        Ok(Self {
            strategy,
            offsets,
            record_sectors,
        })
    }

    /// How the offsets were chosen.
    pub fn strategy(&self) -> PlacementStrategy {
        self.strategy
    }

    /// The copy offsets, strictly increasing.
    pub fn offsets(&self) -> &[Sector] {
        &self.offsets
    }

    /// The length of one copy region, in sectors.
    pub fn record_sectors(&self) -> Sector {
        self.record_sectors
    }

    /// The sector regions the allocator must keep away from.
    pub fn reserved_regions(&self) -> Vec<Range<Sector>> {
        self.offsets
            .iter()
            .map(|&o| o..o + self.record_sectors)
            .collect()
    }
}
