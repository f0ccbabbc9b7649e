// SPDX-License-Identifier: MPL-2.0

//! Health counters and the derived health score.
//!
//! Counters are plain atomics: writers increment with relaxed ordering,
//! observers read without any lock. The score is computed on demand from a
//! snapshot, in integer arithmetic only, with a deduction schedule that is
//! monotone in every counter and pinned by the tests below.

use core::sync::atomic::{AtomicU64, Ordering};

/// The monotone counters of one remap device.
#[derive(Default)]
pub struct HealthStats {
    total_reads: AtomicU64,
    total_writes: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    spare_errors: AtomicU64,
    auto_remaps: AtomicU64,
    manual_remaps: AtomicU64,
    allocations: AtomicU64,
    flush_ok: AtomicU64,
    flush_failures: AtomicU64,
}

impl HealthStats {
    /// A zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self) {
        self.total_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.total_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spare_error(&self) {
        self.spare_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auto_remap(&self) {
        self.auto_remaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_manual_remap(&self) {
        self.manual_remaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_ok(&self) {
        self.flush_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// One unsynchronized pass over the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_reads: self.total_reads.load(Ordering::Relaxed),
            total_writes: self.total_writes.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            spare_errors: self.spare_errors.load(Ordering::Relaxed),
            auto_remaps: self.auto_remaps.load(Ordering::Relaxed),
            manual_remaps: self.manual_remaps.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            flush_ok: self.flush_ok.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_reads: u64,
    pub total_writes: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub spare_errors: u64,
    pub auto_remaps: u64,
    pub manual_remaps: u64,
    pub allocations: u64,
    pub flush_ok: u64,
    pub flush_failures: u64,
}

impl StatsSnapshot {
    /// The 0..=100 health score.
    ///
    /// Starts at 100 and deducts, saturating at zero:
    /// two points per read error (up to 30), three per write error (up to
    /// 30), five per spare error (up to 20), and 2/5/10/20 points once the
    /// remap density reaches 25/50/75/90 percent of `spare_capacity`.
    pub fn health_score(&self, remapped: u64, spare_capacity: u64) -> u8 {
        let mut deduction = self.read_errors.saturating_mul(2).min(30);
        deduction += self.write_errors.saturating_mul(3).min(30);
        deduction += self.spare_errors.saturating_mul(5).min(20);

        let density_pct = if spare_capacity == 0 {
            100
        } else {
            remapped * 100 / spare_capacity
        };
        deduction += match density_pct {
            0..=24 => 0,
            25..=49 => 2,
            50..=74 => 5,
            75..=89 => 10,
            _ => 20,
        };

        100u64.saturating_sub(deduction) as u8
    }
}

/// The coarse health bands reported on the control channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthState {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl HealthState {
    /// Bands: 90+, 75+, 50+, 25+, below.
    pub fn from_score(score: u8) -> Self {
        match score {
            90..=100 => Self::Excellent,
            75..=89 => Self::Good,
            50..=74 => Self::Fair,
            25..=49 => Self::Poor,
            _ => Self::Critical,
        }
    }

    /// The token used in control replies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Critical => "critical",
        }
    }
}
