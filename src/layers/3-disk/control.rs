// SPDX-License-Identifier: MPL-2.0

//! The operator surface: construction arguments, process-wide defaults,
//! control messages and the status line.
//!
//! Replies are single text lines. Commands that fail answer with the
//! error token of their `Errno`; malformed or unknown commands answer
//! `invalid_argument`. Nothing here ever touches the I/O path.

use core::sync::atomic::Ordering;

use super::remap_disk::RemapDisk;
use crate::{
    layers::{
        bio::BlockSet,
        map::{HealthState, StatsSnapshot},
        meta::FORMAT_VERSION,
    },
    os::RwLock,
    prelude::*,
};

/// Process-wide defaults, read by `TargetArgs::parse` for every device
/// constructed afterwards. Initialized once before the first attach and
/// torn down after the last detach; read-only in between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalConfig {
    /// Default seconds between periodic flushes; 0 disables them.
    pub autosave_interval_secs: u64,
    /// Default state of error-path auto-remap.
    pub auto_remap: bool,
    /// Default initial hash-bucket count, a power of two.
    pub initial_hash_size: usize,
    /// Master switch for the periodic flush timer.
    pub periodic_flush: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            autosave_interval_secs: 60,
            auto_remap: true,
            initial_hash_size: 64,
            periodic_flush: true,
        }
    }
}

static GLOBAL_CONFIG: RwLock<Option<GlobalConfig>> = RwLock::new(None);

/// Installs the process-wide defaults. Refused once set.
pub fn init_global_config(config: GlobalConfig) -> Result<()> {
    let mut slot = GLOBAL_CONFIG.write();
    if slot.is_some() {
        return_errno_with_msg!(InvalidArgs, "global configuration is already initialized");
    }
    *slot = Some(config);
    Ok(())
}

/// The current defaults, or the built-in ones when never initialized.
pub fn global_config() -> GlobalConfig {
    GLOBAL_CONFIG.read().unwrap_or_default()
}

/// Clears the process-wide defaults, after the last device detaches.
pub fn teardown_global_config() {
    *GLOBAL_CONFIG.write() = None;
}

/// Parsed construction arguments of one remap device.
#[derive(Clone, Debug)]
pub struct TargetArgs {
    /// Handle of the main device, fingerprinted into the metadata.
    pub main_handle: String,
    /// Handle of the first spare device.
    pub spare_handle: String,
    /// First sector of the spare region.
    pub spare_start: Sector,
    /// Length of the spare region in sectors.
    pub spare_len: Sector,
    /// Whether the error path installs remaps.
    pub auto_remap: bool,
    /// Seconds between periodic flushes; 0 disables them.
    pub autosave_interval_secs: u64,
    /// Initial hash-bucket count, a power of two.
    pub initial_hash_size: usize,
}

impl TargetArgs {
    /// Parses `<main> <spare> <spare-start> <spare-length>` plus optional
    /// trailing `key=value` pairs, with defaults from the global config.
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let (Some(main_handle), Some(spare_handle)) = (tokens.next(), tokens.next()) else {
            return_errno_with_msg!(InvalidArgs, "expected main and spare device handles");
        };
        let (Some(start), Some(len)) = (tokens.next(), tokens.next()) else {
            return_errno_with_msg!(InvalidArgs, "expected spare start and length");
        };
        let spare_start: Sector = start
            .parse()
            .map_err(|_| Error::with_msg(InvalidArgs, "bad spare start sector"))?;
        let spare_len: Sector = len
            .parse()
            .map_err(|_| Error::with_msg(InvalidArgs, "bad spare length"))?;

        let defaults = global_config();
        let mut args = Self {
            main_handle: main_handle.to_string(),
            spare_handle: spare_handle.to_string(),
            spare_start,
            spare_len,
            auto_remap: defaults.auto_remap,
            autosave_interval_secs: if defaults.periodic_flush {
                defaults.autosave_interval_secs
            } else {
                0
            },
            initial_hash_size: defaults.initial_hash_size,
        };

        for pair in tokens {
            let Some((key, value)) = pair.split_once('=') else {
                return_errno_with_msg!(InvalidArgs, "options must be key=value");
            };
            match key {
                "auto_remap" => {
                    args.auto_remap = match value {
                        "on" => true,
                        "off" => false,
                        _ => return_errno_with_msg!(InvalidArgs, "auto_remap takes on|off"),
                    }
                }
                "autosave_interval_secs" => {
                    args.autosave_interval_secs = value
                        .parse()
                        .map_err(|_| Error::with_msg(InvalidArgs, "bad autosave interval"))?;
                }
                "initial_hash_size" => {
                    let size: usize = value
                        .parse()
                        .map_err(|_| Error::with_msg(InvalidArgs, "bad hash size"))?;
                    if !size.is_power_of_two() || size < 64 {
                        return_errno_with_msg!(
                            InvalidArgs,
                            "initial_hash_size must be a power of two >= 64"
                        );
                    }
                    args.initial_hash_size = size;
                }
                _ => return_errno_with_msg!(InvalidArgs, "unknown construction option"),
            }
        }
        Ok(args)
    }

    /// Arguments for tests and embedders that construct devices directly.
    pub fn with_defaults(main_handle: &str, spare_len: Sector) -> Self {
        let defaults = global_config();
        Self {
            main_handle: main_handle.to_string(),
            spare_handle: String::new(),
            spare_start: 0,
            spare_len,
            auto_remap: defaults.auto_remap,
            autosave_interval_secs: if defaults.periodic_flush {
                defaults.autosave_interval_secs
            } else {
                0
            },
            initial_hash_size: defaults.initial_hash_size,
        }
    }
}

impl<D: BlockSet + 'static> RemapDisk<D> {
    /// Handles one control message, always answering with a reply line.
    pub fn message(&self, line: &str) -> String {
        let mut tokens = line.split_whitespace();
        let Some(command) = tokens.next() else {
            return "invalid_argument".to_string();
        };
        let reply = match command {
            "remap" => match (tokens.next().map(str::parse::<Sector>), tokens.next()) {
                (Some(Ok(lsa)), None) => self
                    .remap(lsa)
                    .map(|ssa| format!("ok spare={}", ssa))
                    .unwrap_or_else(|e| e.errno().token().to_string()),
                _ => "invalid_argument".to_string(),
            },
            "unremap" => match (tokens.next().map(str::parse::<Sector>), tokens.next()) {
                (Some(Ok(lsa)), None) => self
                    .unremap(lsa)
                    .map(|_| "ok".to_string())
                    .unwrap_or_else(|e| e.errno().token().to_string()),
                _ => "invalid_argument".to_string(),
            },
            "save" | "sync" if tokens.next().is_none() => match self.save() {
                Ok((written, planned)) => format!("ok copies={}/{}", written, planned),
                Err(e) => e.errno().token().to_string(),
            },
            "add_spare" => self.message_add_spare(&mut tokens),
            "remove_spare" => match (tokens.next().map(str::parse::<usize>), tokens.next()) {
                (Some(Ok(index)), None) => match self.remove_spare(index) {
                    Ok(()) => "ok".to_string(),
                    Err(e) if e.errno() == EntryInUse => "in_use".to_string(),
                    Err(e) => e.errno().token().to_string(),
                },
                _ => "invalid_argument".to_string(),
            },
            "set_auto_remap" => match (tokens.next(), tokens.next()) {
                (Some("on"), None) => format!("ok state={}", self.set_auto_remap(true)),
                (Some("off"), None) => format!("ok state={}", self.set_auto_remap(false)),
                _ => "invalid_argument".to_string(),
            },
            "stats" if tokens.next().is_none() => self.stats_line(),
            "health" if tokens.next().is_none() => {
                let (score, state) = self.health();
                format!("score={} state={}", score, state.as_str())
            }
            "scan" if tokens.next().is_none() => format!(
                "remapped={} capacity={}",
                self.inner.table.len(),
                self.inner.pool.total_capacity()
            ),
            _ => "invalid_argument".to_string(),
        };
        reply
    }

    fn message_add_spare(&self, tokens: &mut core::str::SplitWhitespace<'_>) -> String {
        let (Some(handle), Some(start), Some(len), None) =
            (tokens.next(), tokens.next(), tokens.next(), tokens.next())
        else {
            return "invalid_argument".to_string();
        };
        let (Ok(start), Ok(len)) = (start.parse::<Sector>(), len.parse::<Sector>()) else {
            return "invalid_argument".to_string();
        };

        let resolver = self.inner.resolver.lock();
        let Some(resolver) = resolver.as_ref() else {
            return "invalid_argument".to_string();
        };
        let added = resolver(handle)
            .and_then(|disk| {
                if len == 0 || start + len > disk.nsectors() {
                    return_errno_with_msg!(InvalidArgs, "spare range is empty or out of bounds");
                }
                disk.subset(start..start + len)
            })
            .and_then(|disk| self.add_spare(disk));
        match added {
            Ok(index) => format!("ok index={}", index),
            Err(e) => e.errno().token().to_string(),
        }
    }

    /// The current counters as one `key=value` line.
    pub fn stats_line(&self) -> String {
        let snap = self.inner.stats.snapshot();
        format!(
            "reads={} writes={} read_errors={} write_errors={} spare_errors={} \
             auto_remaps={} manual_remaps={} allocations={} remapped={} saves={}/{}",
            snap.total_reads,
            snap.total_writes,
            snap.read_errors,
            snap.write_errors,
            snap.spare_errors,
            snap.auto_remaps,
            snap.manual_remaps,
            snap.allocations,
            self.inner.table.len(),
            snap.flush_ok,
            snap.flush_ok + snap.flush_failures,
        )
    }

    /// The health score and its band.
    pub fn health(&self) -> (u8, HealthState) {
        let snap: StatsSnapshot = self.inner.stats.snapshot();
        let score = snap.health_score(self.inner.table.len(), self.inner.pool.total_capacity());
        (score, HealthState::from_score(score))
    }

    /// The version-tagged status line; field order is an external contract.
    pub fn status(&self, start: Sector, length: Sector) -> String {
        let snap = self.inner.stats.snapshot();
        let (auto, manual) = self.inner.table.count_by_origin();
        let (score, _) = self.health();
        let healthy = if score >= 50 { 1 } else { 0 };
        let autosave = if self.inner.autosave_secs > 0 {
            "active"
        } else {
            "idle"
        };
        format!(
            "{} {} remap v{}.0 {}/{} {}/{} {}/{} health={} errors=W{}:R{} \
             auto_remaps={} manual_remaps={} scan=0% metadata=enabled autosave={} saves={}/{}",
            start,
            length,
            FORMAT_VERSION,
            self.inner.pool.total_used(),
            self.inner.pool.total_capacity(),
            snap.read_errors,
            snap.write_errors,
            auto,
            manual,
            healthy,
            snap.write_errors,
            snap.read_errors,
            snap.auto_remaps,
            snap.manual_remaps,
            autosave,
            snap.flush_ok,
            snap.flush_ok + snap.flush_failures,
        )
    }

    /// Whether error-path auto-remap is currently enabled.
    pub fn auto_remap_enabled(&self) -> bool {
        self.inner.auto_remap.load(Ordering::Acquire)
    }
}
