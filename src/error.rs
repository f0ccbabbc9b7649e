// SPDX-License-Identifier: MPL-2.0

use core::fmt;

/// The error types used in this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Errno {
    /// The underlying device reported an I/O failure.
    IoFailed,
    /// A transfer moved fewer bytes than requested.
    ShortIo,
    /// The spare pool has no sector left for a new remap.
    NoSpaceForRemap,
    /// A remap already exists for the logical sector.
    DuplicateRemap,
    /// The resource still holds live remap entries.
    EntryInUse,
    /// The spare device cannot hold even one metadata copy.
    SpareTooSmall,
    /// No metadata copy decoded to a valid record.
    MetadataCorrupt,
    /// Two copies share the highest sequence number but differ in content.
    MetadataDivergent,
    /// The on-disk record carries an unknown format version.
    VersionUnsupported,
    /// A spare device's allocation bitmap is full.
    AllocatorExhausted,
    /// Invalid arguments.
    InvalidArgs,
    /// The device is quiescing or stopped and rejects new I/O.
    Quiesced,
}

impl Errno {
    /// The wire token used in control-channel replies.
    pub fn token(&self) -> &'static str {
        match self {
            Errno::IoFailed => "io_error",
            Errno::ShortIo => "short_io",
            Errno::NoSpaceForRemap => "no_space_for_remap",
            Errno::DuplicateRemap => "duplicate_remap",
            Errno::EntryInUse => "entry_in_use",
            Errno::SpareTooSmall => "spare_too_small",
            Errno::MetadataCorrupt => "metadata_corrupt",
            Errno::MetadataDivergent => "metadata_divergent",
            Errno::VersionUnsupported => "version_unsupported",
            Errno::AllocatorExhausted => "allocator_exhausted",
            Errno::InvalidArgs => "invalid_argument",
            Errno::Quiesced => "quiesced",
        }
    }
}

/// The error with an error type and an error message used in this crate.
#[derive(Clone, Debug)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    /// Creates a new error with the given error type and no error message.
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    /// Creates a new error with the given error type and the error message.
    pub const fn with_msg(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    /// Returns the error type.
    pub fn errno(&self) -> Errno {
        self.errno
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return core::result::Result::Err($crate::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_msg {
    ($errno: expr, $msg: expr) => {
        return core::result::Result::Err($crate::Error::with_msg($errno, $msg))
    };
}
