// SPDX-License-Identifier: MPL-2.0

//! OS-specific or OS-dependent APIs.
//!
//! Everything above this module is OS-independent: locks, condition
//! variables, threads, timestamps and randomness all come from here, so
//! porting the crate to another environment means swapping this module only.

pub use std::{
    boxed::Box,
    string::{String, ToString},
    sync::{Arc, Weak},
    vec::Vec,
};
use core::fmt::{self, Debug, Formatter};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        PoisonError,
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

pub use hashbrown::{HashMap, HashSet};

use crate::prelude::Result;

/// A mutual exclusion lock.
///
/// Unlike the `std` counterpart, `lock()` does not surface poisoning:
/// a panicked holder does not take the protected data down with it.
pub struct Mutex<T: ?Sized>(std::sync::Mutex<T>);

pub type MutexGuard<'a, T> = std::sync::MutexGuard<'a, T>;

impl<T> Mutex<T> {
    /// Creates a new mutex protecting the given data.
    pub const fn new(t: T) -> Self {
        Self(std::sync::Mutex::new(t))
    }

    /// Acquires the lock and gives the caller access to the data protected by it.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Debug> Debug for Mutex<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Mutex").field(&self.0).finish()
    }
}

/// A reader-writer lock.
pub struct RwLock<T: ?Sized>(std::sync::RwLock<T>);

pub type RwLockReadGuard<'a, T> = std::sync::RwLockReadGuard<'a, T>;
pub type RwLockWriteGuard<'a, T> = std::sync::RwLockWriteGuard<'a, T>;

impl<T> RwLock<T> {
    /// Creates a new reader-writer lock protecting the given data.
    pub const fn new(t: T) -> Self {
        Self(std::sync::RwLock::new(t))
    }

    /// Acquires the lock for shared read access.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires the lock for exclusive write access.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A `Condvar` (Condition Variable) is a synchronization primitive that can block threads
/// until a certain condition becomes true.
pub struct Condvar(std::sync::Condvar);

impl Condvar {
    /// Creates a new condition variable.
    pub const fn new() -> Self {
        Self(std::sync::Condvar::new())
    }

    /// Atomically releases the given `MutexGuard`,
    /// blocking the current thread until the condition variable
    /// is notified, after which the mutex will be reacquired.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> Result<MutexGuard<'a, T>> {
        Ok(self.0.wait(guard).unwrap_or_else(PoisonError::into_inner))
    }

    /// Like `wait`, but gives up after `timeout`.
    ///
    /// The boolean in the result is `true` if the wait timed out.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> Result<(MutexGuard<'a, T>, bool)> {
        let (guard, res) = self
            .0
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        Ok((guard, res.timed_out()))
    }

    /// Wakes up one blocked thread waiting on this condition variable.
    pub fn notify_one(&self) {
        self.0.notify_one();
    }

    /// Wakes up all blocked threads waiting on this condition variable.
    pub fn notify_all(&self) {
        self.0.notify_all();
    }
}

impl Debug for Condvar {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar").finish_non_exhaustive()
    }
}

/// A mutex for pairing with `Condvar`.
#[repr(transparent)]
pub struct CvarMutex<T> {
    inner: std::sync::Mutex<T>,
}

impl<T> CvarMutex<T> {
    /// Constructs a new mutex usable with `Condvar::wait`.
    pub const fn new(t: T) -> Self {
        Self {
            inner: std::sync::Mutex::new(t),
        }
    }

    /// Acquires the lock and gives the caller access to the data protected by it.
    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Spawns a new thread, returning a `JoinHandle` for it.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    JoinHandle {
        handle: thread::spawn(f),
    }
}

/// An owned permission to join on a thread (block on its termination).
///
/// This struct is created by the `spawn` function.
pub struct JoinHandle<T> {
    handle: thread::JoinHandle<T>,
}

impl<T> JoinHandle<T> {
    /// Checks if the associated thread has finished running its main function.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the associated thread to finish.
    pub fn join(self) -> Result<T> {
        self.handle.join().map_err(|_| {
            crate::Error::with_msg(crate::Errno::InvalidArgs, "joined thread panicked")
        })
    }
}

impl<T> Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle").finish_non_exhaustive()
    }
}

/// Yields the current thread's timeslice.
pub fn yield_now() {
    thread::yield_now();
}

/// Seconds since the UNIX epoch, or zero when the wall clock predates it.
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A random number generator.
///
/// A 64-bit mixing generator seeded from the wall clock and a process-wide
/// counter. Not cryptographic; used for spare-device UUIDs only.
pub struct Rng(AtomicU64);

static RNG_NONCE: AtomicU64 = AtomicU64::new(0);

impl crate::util::Rng for Rng {
    fn new(seed: &[u8]) -> Self {
        let mut state = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
            ^ RNG_NONCE.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
        for chunk in seed.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            state ^= u64::from_le_bytes(word);
        }
        Self(AtomicU64::new(state))
    }

    fn fill_bytes(&self, dest: &mut [u8]) -> Result<()> {
        let mut next = || {
            let mut x = self.0.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
            x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            x ^ (x >> 31)
        };
        let mut chunks = dest.chunks_exact_mut(8);
        for chunk in chunks.by_ref() {
            chunk.copy_from_slice(&next().to_le_bytes());
        }
        let remain = chunks.into_remainder();
        let len = remain.len();
        remain.copy_from_slice(&next().to_le_bytes()[..len]);
        Ok(())
    }
}
