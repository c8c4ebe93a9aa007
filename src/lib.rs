// Library crate for the FAT engine. Host `cargo test` builds against std
// (the fatfs oracle needs it); everything else is no_std.
#![cfg_attr(not(test), no_std)]

//! A stripped-down FAT16/FAT32 filesystem over a block device.
//!
//! All paths are taken relative to the root directory; there is no concept
//! of a current working directory (mount points are a higher layer's
//! problem). Files can be read, written, seeked and deleted. Long filenames
//! are read but never written. Access and modification times are pinned to
//! the 1980 epoch.
//!
//! All I/O goes through the [`BlockDev`] the volume was mounted with. A
//! mounted [`Volume`] owns a single-sector write-back cache through which
//! every FAT and directory access is serialized; file data bypasses it.
//! A `Volume` is not safe to share between execution contexts.

mod cache;
mod dir;
mod file;
mod table;

pub mod dev;
pub mod layout;
pub mod volume;

#[cfg(test)]
pub(crate) mod testutil;

pub use dev::{BlockDev, DeviceError};
pub use file::{File, OpenMode, SeekFrom};
pub use volume::{DirItem, FatType, Stats, Volume};

/// Errors surfaced by filesystem operations.
///
/// Read and write return the bytes transferred so far when they stop early;
/// a partial transfer is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatError {
    /// Lookup failed and the open mode did not ask for creation.
    NotFound,
    /// `CREATE | EXCL` named a file that already exists.
    Exists,
    /// A directory was named where a file operation was requested.
    IsDir,
    /// A file was named where a directory was required.
    NotDir,
    /// The cluster allocator found no free cluster.
    NoSpace,
    /// Write on a handle that was not opened writable.
    InvalidMode,
    /// Mount-time layout check failed: unknown partition type, missing
    /// partition table or signature, zero sector/cluster geometry.
    BadVolume,
    /// The block device reported a failure.
    Io,
}

impl From<DeviceError> for FatError {
    fn from(_: DeviceError) -> Self {
        FatError::Io
    }
}
