//! Filesystem seams for file-backed redirections.
//!
//! File-backed backing stores live as regular files on a FAT volume managed
//! by an external filesystem implementation. The core needs very little from
//! it: mounting, opening by path, positioned reads and writes, and the
//! cluster-link-map accelerator that makes seeks in multi-gigabyte backing
//! files O(1).

use alloc::boxed::Box;

/// Errors reported by the filesystem collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    /// Path does not exist (or is not openable in read-write mode).
    #[error("not found")]
    NotFound,
    /// The underlying volume I/O failed.
    #[error("volume I/O failed")]
    Io,
    /// Offset or length beyond the end of the file.
    #[error("offset out of bounds")]
    OutOfBounds,
    /// The cluster-link-map accelerator ran out of entries for this file.
    #[error("cluster map exhausted")]
    MapExhausted,
}

/// An open file on a backing volume.
pub trait FsFile: Send {
    /// Current file size in bytes.
    fn size(&self) -> u64;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FsError>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), FsError>;

    /// Flushes cached data for this file to the volume.
    fn sync(&mut self) -> Result<(), FsError>;

    /// Registers a pre-allocated cluster-link-map of `entries` entries for
    /// this file. Every backing file must register one before it is used for
    /// I/O; failure is fatal to the caller.
    fn reserve_cluster_map(&mut self, entries: usize) -> Result<(), FsError>;
}

/// A mountable FAT volume.
///
/// Two volumes are bound at startup: the system volume (the FAT partition on
/// the eMMC GPP) and the SD card volume. Mount/unmount calls are refcounted
/// by the core, so implementations see each physical transition exactly once.
pub trait FsVolume: Send + Sync {
    fn mount(&self) -> Result<(), FsError>;
    fn unmount(&self) -> Result<(), FsError>;

    /// Opens an existing file for read-write access. Paths are relative to
    /// the volume root, ASCII, `/`-separated.
    fn open(&self, path: &str) -> Result<Box<dyn FsFile>, FsError>;

    /// Whether `path` names an existing directory. Configuration validation
    /// uses this to reject file-backed redirections whose directory is
    /// missing, before the volume's first refcounted mount, so it must not
    /// require a prior `mount` call.
    fn dir_exists(&self, path: &str) -> bool;
}
