//! A directory-backed [`FsVolume`] for hosts with `std`.
//!
//! Backing files are plain files under a root directory; the volume is
//! "mounted" by verifying the root exists. Cluster-link-map registration is
//! recorded but has no effect, since `std::fs` seeks are already O(1).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::fs::{FsError, FsFile, FsVolume};

pub struct DirVolume {
    root: PathBuf,
}

impl DirVolume {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FsVolume for DirVolume {
    fn mount(&self) -> Result<(), FsError> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(FsError::NotFound)
        }
    }

    fn unmount(&self) -> Result<(), FsError> {
        Ok(())
    }

    fn open(&self, path: &str) -> Result<Box<dyn FsFile>, FsError> {
        let full = self.root.join(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&full)
            .map_err(|_| FsError::NotFound)?;
        let len = file.metadata().map_err(|_| FsError::Io)?.len();
        Ok(Box::new(DirFile {
            file,
            len,
            clmt_entries: 0,
        }))
    }

    fn dir_exists(&self, path: &str) -> bool {
        self.root.join(path).is_dir()
    }
}

pub struct DirFile {
    file: File,
    len: u64,
    clmt_entries: usize,
}

impl FsFile for DirFile {
    fn size(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FsError> {
        if offset + buf.len() as u64 > self.len {
            return Err(FsError::OutOfBounds);
        }
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|_| FsError::Io)?;
        self.file.read_exact(buf).map_err(|_| FsError::Io)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), FsError> {
        // Backing files never grow; a write past the end mirrors a FAT write
        // beyond the last linked cluster.
        if offset + buf.len() as u64 > self.len {
            return Err(FsError::OutOfBounds);
        }
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|_| FsError::Io)?;
        self.file.write_all(buf).map_err(|_| FsError::Io)
    }

    fn sync(&mut self) -> Result<(), FsError> {
        self.file.sync_data().map_err(|_| FsError::Io)
    }

    fn reserve_cluster_map(&mut self, entries: usize) -> Result<(), FsError> {
        self.clmt_entries = entries;
        Ok(())
    }
}
