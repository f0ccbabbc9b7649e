// SPDX-License-Identifier: MPL-2.0

//! Block I/O (BIO) requests.
//!
//! The asynchronous face of a remap device: a `BioReq` carries a
//! sector-addressed read, write or sync, an optional completion callback
//! with typed extension context, and a waiter for callers that want to
//! block on the outcome.

use core::any::{Any, TypeId};

use hashbrown::HashMap;

use crate::{
    layers::bio::Buf,
    os::{Condvar, CvarMutex, Mutex, MutexGuard},
    prelude::*,
};

/// A block I/O request.
pub struct BioReq {
    type_: BioType,
    addr: Sector,
    nsectors: u32,
    bufs: Mutex<Vec<Buf>>,
    status: CvarMutex<BioStatus>,
    status_cvar: Condvar,
    on_complete: Option<BioReqOnCompleteFn>,
    ext: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

/// The type of a block request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BioType {
    /// A read request.
    Read,
    /// A write request.
    Write,
    /// A sync request.
    Sync,
}

/// A response from a block device.
pub type BioResp = Result<()>;

/// The type of the callback function invoked upon the completion of
/// a block I/O request.
pub type BioReqOnCompleteFn = fn(/* req = */ &BioReq, /* resp = */ &BioResp);

/// The status describing a block I/O request.
#[derive(Clone, Debug)]
enum BioStatus {
    Init,
    Submitted,
    Completed(BioResp),
}

impl BioReq {
    /// Returns the type of the request.
    pub fn type_(&self) -> BioType {
        self.type_
    }

    /// Returns the starting sector of the request.
    ///
    /// The return value is meaningless if the request is not a read or write.
    pub fn addr(&self) -> Sector {
        self.addr
    }

    /// Access the immutable buffers with a closure.
    pub fn access_bufs_with<F, R>(&self, mut f: F) -> R
    where
        F: FnMut(&[Buf]) -> R,
    {
        let bufs = self.bufs.lock();
        (f)(&bufs)
    }

    /// Access the mutable buffers with a closure.
    pub(super) fn access_mut_bufs_with<F, R>(&self, mut f: F) -> R
    where
        F: FnMut(&mut [Buf]) -> R,
    {
        let mut bufs = self.bufs.lock();
        (f)(&mut bufs)
    }

    /// Returns the number of sectors to read or write by this request.
    ///
    /// If the request is a sync, then the returned value is meaningless.
    pub fn nsectors(&self) -> usize {
        self.nsectors as usize
    }

    /// Returns the extensions of the request.
    ///
    /// The extensions of a request is a set of objects that may be added, removed,
    /// or accessed by block devices and their users. Each of the extension objects
    /// must have a different type. To avoid conflicts, it is recommended to use only
    /// private types for the extension objects.
    pub fn ext(&self) -> MutexGuard<'_, HashMap<TypeId, Box<dyn Any + Send + Sync>>> {
        self.ext.lock()
    }

    /// Blocks until the request completes, returning the response.
    pub fn wait(&self) -> BioResp {
        let mut status = self.status.lock().unwrap();
        loop {
            if let BioStatus::Completed(resp) = &*status {
                return resp.clone();
            }
            status = self.status_cvar.wait(status).unwrap();
        }
    }

    /// Update the status of the request to "completed" by giving the response
    /// to the request.
    ///
    /// # Panics
    ///
    /// If the request has not been submitted yet, or has been completed already,
    /// this method will panic.
    pub(super) fn complete(&self, resp: BioResp) {
        let mut status = self.status.lock().unwrap();
        match *status {
            BioStatus::Submitted => {
                if let Some(on_complete) = self.on_complete {
                    (on_complete)(self, &resp);
                }

                *status = BioStatus::Completed(resp);
                self.status_cvar.notify_all();
            }
            _ => panic!("cannot complete before submitting or complete twice"),
        }
    }

    /// Mark the request as submitted.
    pub(super) fn submit(&self) {
        let mut status = self.status.lock().unwrap();
        match *status {
            BioStatus::Init => *status = BioStatus::Submitted,
            _ => unreachable!(),
        }
    }
}

/// A builder for `BioReq`.
pub struct BioReqBuilder {
    type_: BioType,
    addr: Option<Sector>,
    bufs: Option<Vec<Buf>>,
    on_complete: Option<BioReqOnCompleteFn>,
    ext: Option<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl BioReqBuilder {
    /// Creates a builder of a block request of the given type.
    pub fn new(type_: BioType) -> Self {
        Self {
            type_,
            addr: None,
            bufs: None,
            on_complete: None,
            ext: None,
        }
    }

    /// Specify the starting sector of the request.
    pub fn addr(mut self, addr: Sector) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Give the buffers of the request.
    pub fn bufs(mut self, bufs: Vec<Buf>) -> Self {
        self.bufs = Some(bufs);
        self
    }

    /// Specify a callback invoked when the request is complete.
    pub fn on_complete(mut self, on_complete: BioReqOnCompleteFn) -> Self {
        self.on_complete = Some(on_complete);
        self
    }

    /// Add an extension object to the request.
    pub fn ext<T: Any + Send + Sync + Sized>(mut self, obj: T) -> Self {
        if self.ext.is_none() {
            self.ext = Some(HashMap::new());
        }
        let _ = self
            .ext
            .as_mut()
            .unwrap()
            .insert(TypeId::of::<T>(), Box::new(obj));
        self
    }

    /// Build the request.
    pub fn build(mut self) -> BioReq {
        let type_ = self.type_;
        if type_ == BioType::Sync {
            debug_assert!(
                self.addr.is_none(),
                "addr is only meaningful for a read or write",
            );
            debug_assert!(
                self.bufs.is_none(),
                "bufs is only meaningful for a read or write",
            );
        }

        let addr = self.addr.unwrap_or(0 as Sector);

        let bufs = self.bufs.take().unwrap_or_default();
        let nsectors = {
            let nbytes = bufs
                .iter()
                .map(|buf| buf.as_slice().len())
                .fold(0_usize, |sum, len| sum.saturating_add(len));
            (nbytes / SECTOR_SIZE) as u32
        };

        let ext = self.ext.take().unwrap_or_default();
        let on_complete = self.on_complete.take();

        BioReq {
            type_,
            addr,
            nsectors,
            bufs: Mutex::new(bufs),
            status: CvarMutex::new(BioStatus::Init),
            status_cvar: Condvar::new(),
            on_complete,
            ext: Mutex::new(ext),
        }
    }
}
