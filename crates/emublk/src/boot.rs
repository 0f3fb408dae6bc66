//! On-disk partition tables of the backing store.
//!
//! The boot path needs two lookups from the raw backing bytes: the GPT of the
//! virtual eMMC GPP (to find the `BCPKG2-1-Normal-Main` partition package2 is
//! read from) and, for a partition-backed SD redirection, the MBR at the
//! start of the region (to sanity-check that the region fits the device).

use bytemuck::{Pod, Zeroable};
use emublk_core::{SECTOR_SHIFT, SECTOR_SIZE};

pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";

/// Header plus 128 entries of 0x80 bytes: the 33 sectors starting at LBA 1.
pub const GPT_SECTORS: usize = 33;

pub const GPT_MAX_ENTRIES: u32 = 128;

/// Name of the GPP partition package2 is read from.
pub const PACKAGE2_PARTITION_NAME: &str = "BCPKG2-1-Normal-Main";

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GptHeader {
    pub signature: [u8; 8],
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub reserved0: u32,
    pub my_lba: u64,
    pub alt_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub partition_entry_lba: u64,
    pub number_of_partition_entries: u32,
    pub size_of_partition_entry: u32,
    pub partition_entry_array_crc32: u32,
    pub reserved1: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<GptHeader>(), 0x60);

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GptEntry {
    pub partition_type_guid: [u8; 16],
    pub unique_partition_guid: [u8; 16],
    pub starting_lba: u64,
    pub ending_lba: u64,
    pub attributes: u64,
    /// UTF-16LE, NUL-terminated.
    pub partition_name: [u16; 36],
}

static_assertions::const_assert_eq!(core::mem::size_of::<GptEntry>(), 0x80);

/// A contiguous sector range on the GPP backing store. The last LBA is
/// inclusive, as in the GPT itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRange {
    pub first_lba: u64,
    pub last_lba: u64,
}

impl PartitionRange {
    pub fn sector_count(&self) -> u64 {
        self.last_lba + 1 - self.first_lba
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GptError {
    #[error("buffer does not hold the full table")]
    Truncated,
    #[error("invalid GPT signature")]
    BadSignature,
    #[error("too many GPT entries")]
    TooManyEntries,
    #[error("unsupported GPT entry size")]
    BadEntrySize,
    #[error("partition not found")]
    NotFound,
}

/// Finds a partition by name in the raw table bytes.
///
/// `gpt` holds the [`GPT_SECTORS`] sectors starting at LBA 1 of the backing
/// store, i.e. the header sector followed by the entry array.
pub fn locate_partition(gpt: &[u8], name: &str) -> Result<PartitionRange, GptError> {
    if gpt.len() < GPT_SECTORS * SECTOR_SIZE {
        return Err(GptError::Truncated);
    }

    let header: GptHeader =
        bytemuck::pod_read_unaligned(&gpt[..core::mem::size_of::<GptHeader>()]);
    if header.signature != GPT_SIGNATURE {
        return Err(GptError::BadSignature);
    }
    if header.number_of_partition_entries > GPT_MAX_ENTRIES {
        return Err(GptError::TooManyEntries);
    }
    if header.size_of_partition_entry as usize != core::mem::size_of::<GptEntry>() {
        return Err(GptError::BadEntrySize);
    }

    // The buffer starts at LBA 1; the header records where the array lives.
    let array_offset = (header
        .partition_entry_lba
        .saturating_sub(1)
        .min(GPT_SECTORS as u64) as usize)
        << SECTOR_SHIFT;

    let mut name_utf16 = [0u16; 36];
    let mut name_len = 0;
    for (dst, ch) in name_utf16.iter_mut().zip(name.encode_utf16()) {
        *dst = ch;
        name_len += 1;
    }

    for index in 0..header.number_of_partition_entries as usize {
        let offset = array_offset + index * core::mem::size_of::<GptEntry>();
        let Some(bytes) = gpt.get(offset..offset + core::mem::size_of::<GptEntry>()) else {
            return Err(GptError::Truncated);
        };
        let entry: GptEntry = bytemuck::pod_read_unaligned(bytes);

        // Entries below the usable area are protective leftovers.
        if entry.starting_lba < header.first_usable_lba {
            continue;
        }
        if entry.partition_name[..name_len] == name_utf16[..name_len]
            && entry.partition_name.get(name_len).copied().unwrap_or(0) == 0
        {
            return Ok(PartitionRange {
                first_lba: entry.starting_lba,
                last_lba: entry.ending_lba,
            });
        }
    }

    Err(GptError::NotFound)
}

/// Finds the package2 partition.
pub fn locate_package2(gpt: &[u8]) -> Result<PartitionRange, GptError> {
    locate_partition(gpt, PACKAGE2_PARTITION_NAME)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MbrPartitionEntry {
    pub boot_flag: u8,
    pub chs_start: [u8; 3],
    pub kind: u8,
    pub chs_end: [u8; 3],
    pub start_sector: u32,
    pub sector_count: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<MbrPartitionEntry>(), 16);

const MBR_MAGIC: u16 = 0xAA55;
const MBR_ENTRIES_OFFSET: usize = 446;
const MBR_MAGIC_OFFSET: usize = 510;

/// The sector span of the emuSD image described by the MBR sector at the
/// start of a partition-backed SD region: first-partition start plus size,
/// relative to the region. `None` when the sector holds no usable MBR.
pub fn emusd_region_sectors(sector: &[u8]) -> Option<u64> {
    if sector.len() < SECTOR_SIZE {
        return None;
    }
    let magic = u16::from_le_bytes([sector[MBR_MAGIC_OFFSET], sector[MBR_MAGIC_OFFSET + 1]]);
    if magic != MBR_MAGIC {
        return None;
    }
    let entry: MbrPartitionEntry = bytemuck::pod_read_unaligned(
        &sector[MBR_ENTRIES_OFFSET..MBR_ENTRIES_OFFSET + core::mem::size_of::<MbrPartitionEntry>()],
    );
    if entry.sector_count == 0 {
        return None;
    }
    Some(entry.start_sector as u64 + entry.sector_count as u64)
}

/// Builds the MBR sector describing an emuSD image of `sector_count` sectors
/// starting `start_sector` into the region. Used by tooling that formats
/// backing regions.
pub fn build_emusd_mbr(start_sector: u32, sector_count: u32) -> [u8; SECTOR_SIZE] {
    let mut sector = [0u8; SECTOR_SIZE];
    let entry = MbrPartitionEntry {
        boot_flag: 0,
        chs_start: [0xFE, 0xFF, 0xFF],
        kind: 0x0C, // FAT32 LBA
        chs_end: [0xFE, 0xFF, 0xFF],
        start_sector,
        sector_count,
    };
    sector[MBR_ENTRIES_OFFSET..MBR_ENTRIES_OFFSET + core::mem::size_of::<MbrPartitionEntry>()]
        .copy_from_slice(bytemuck::bytes_of(&entry));
    sector[MBR_MAGIC_OFFSET..].copy_from_slice(&MBR_MAGIC.to_le_bytes());
    sector
}
