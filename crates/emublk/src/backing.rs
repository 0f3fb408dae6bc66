//! File-backed backing stores.
//!
//! A file-backed redirection keeps its bytes in ordinary files on a FAT
//! volume: `BOOT0` and `BOOT1` images plus a sequence `00`, `01`, … holding
//! the GPP data. Large images are split so they fit FAT32's 4 GiB file
//! limit; every part except possibly the last has the size of part `00`.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use emublk_core::{FsError, FsFile, FsVolume, SECTOR_SHIFT};

/// Maximum number of split parts for a file-backed eMMC GPP image.
pub const EMUMMC_FILE_MAX_PARTS: usize = 32;

/// Maximum number of split parts for a file-backed SD image.
pub const EMUSD_FILE_MAX_PARTS: usize = 32;

/// Cluster-link-map entries reserved per backing file.
pub const FP_CLMT_COUNT: usize = 0x400;

/// Failures while opening a backing file set. All of these are fatal to the
/// caller; the variants exist so the lifecycle manager can pick the right
/// abort reason.
#[derive(Debug)]
pub enum OpenError {
    /// A mandatory file (part `00`, `BOOT0`, `BOOT1`) could not be opened.
    Open(FsError),
    /// Part `00` is empty, so no part geometry can be derived.
    EmptyFirstPart,
    /// The filesystem could not register a cluster-link-map.
    ClusterMap,
}

/// An ordered set of equally-sized backing files presenting one contiguous
/// sector range.
pub struct SplitStore {
    parts: Vec<Box<dyn FsFile>>,
    /// Sectors per part, derived from part `00`.
    part_size: u64,
    total_sectors: u64,
}

impl SplitStore {
    /// Opens `<base>00`, `<base>01`, … until `max_parts` or the first missing
    /// part. Every opened part gets a cluster-link-map so later seeks are
    /// O(1).
    pub fn open(
        volume: &dyn FsVolume,
        base: &str,
        max_parts: usize,
    ) -> Result<Self, OpenError> {
        let mut first = volume.open(&part_path(base, 0)).map_err(OpenError::Open)?;
        first
            .reserve_cluster_map(FP_CLMT_COUNT)
            .map_err(|_| OpenError::ClusterMap)?;

        let part_size = first.size() >> SECTOR_SHIFT;
        if part_size == 0 {
            return Err(OpenError::EmptyFirstPart);
        }

        let mut parts: Vec<Box<dyn FsFile>> = Vec::new();
        parts.push(first);
        let mut total_sectors = part_size;

        for idx in 1..max_parts {
            let Ok(mut part) = volume.open(&part_path(base, idx)) else {
                break;
            };
            part.reserve_cluster_map(FP_CLMT_COUNT)
                .map_err(|_| OpenError::ClusterMap)?;
            total_sectors += part.size() >> SECTOR_SHIFT;
            parts.push(part);
        }

        log::debug!(
            "opened split set {base:?}: {} part(s), {total_sectors:#x} sectors",
            parts.len()
        );

        Ok(Self {
            parts,
            part_size,
            total_sectors,
        })
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Single-file sets skip the striping arithmetic entirely.
    pub fn is_striped(&self) -> bool {
        self.parts.len() > 1
    }

    pub fn read(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), FsError> {
        self.io(lba, buf, false)
    }

    pub fn write(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), FsError> {
        self.io(lba, buf, true)
    }

    /// Transfers `buf.len() / 512` sectors starting at `lba`, fragmenting
    /// requests that cross part boundaries. A failed fragment aborts the
    /// whole operation; completed fragments are not rolled back.
    pub fn io(&mut self, mut lba: u64, buf: &mut [u8], is_write: bool) -> Result<(), FsError> {
        let count = (buf.len() >> SECTOR_SHIFT) as u64;
        if lba + count > self.total_sectors {
            return Err(FsError::OutOfBounds);
        }

        if !self.is_striped() {
            return file_io(&mut self.parts[0], lba << SECTOR_SHIFT, buf, is_write);
        }

        let mut part = (lba / self.part_size) as usize;
        lba %= self.part_size;

        let mut done = 0usize;
        let mut remaining = count;
        while remaining > 0 {
            let cur_sectors = remaining.min(self.part_size - lba);
            let cur_bytes = (cur_sectors as usize) << SECTOR_SHIFT;
            file_io(
                &mut self.parts[part],
                lba << SECTOR_SHIFT,
                &mut buf[done..done + cur_bytes],
                is_write,
            )?;
            done += cur_bytes;
            remaining -= cur_sectors;
            lba = 0;
            part += 1;
        }
        Ok(())
    }
}

fn file_io(
    file: &mut Box<dyn FsFile>,
    offset: u64,
    buf: &mut [u8],
    is_write: bool,
) -> Result<(), FsError> {
    if is_write {
        file.write_at(offset, buf)
    } else {
        file.read_at(offset, buf)
    }
}

fn part_path(base: &str, idx: usize) -> String {
    format!("{base}{idx:02}")
}

/// The full file backing of an eMMC redirection: the two boot-partition
/// images plus the split GPP set.
pub struct EmmcFileSet {
    pub boot0: Box<dyn FsFile>,
    pub boot1: Box<dyn FsFile>,
    pub gpp: SplitStore,
}

impl EmmcFileSet {
    /// Opens `<prefix>/eMMC/{BOOT0,BOOT1,00,01,…}` on the given volume.
    pub fn open(volume: &dyn FsVolume, prefix: &str) -> Result<Self, OpenError> {
        let base = format!("{prefix}/eMMC/");
        let boot0 = open_boot(volume, &base, "BOOT0")?;
        let boot1 = open_boot(volume, &base, "BOOT1")?;
        let gpp = SplitStore::open(volume, &base, EMUMMC_FILE_MAX_PARTS)?;
        Ok(Self { boot0, boot1, gpp })
    }
}

fn open_boot(
    volume: &dyn FsVolume,
    base: &str,
    name: &str,
) -> Result<Box<dyn FsFile>, OpenError> {
    let mut file = volume
        .open(&format!("{base}{name}"))
        .map_err(OpenError::Open)?;
    file.reserve_cluster_map(FP_CLMT_COUNT)
        .map_err(|_| OpenError::ClusterMap)?;
    Ok(file)
}

/// Opens the split set of a file-backed SD redirection,
/// `<prefix>/SD/{00,01,…}`.
pub fn open_sd_set(volume: &dyn FsVolume, prefix: &str) -> Result<SplitStore, OpenError> {
    SplitStore::open(volume, &format!("{prefix}/SD/"), EMUSD_FILE_MAX_PARTS)
}
