//! Emublk core
//!
//! Shared vocabulary for the emublk block redirection layer: logical device
//! ids, the eMMC hardware-partition selector, sector constants, host ABI
//! result codes, and the trait seams behind which the host's storage driver,
//! FAT volumes, mutexes, device accessors and fatal reporter live.
//!
//! The redirection core itself lives in the `emublk` crate; everything here
//! is deliberately implementation-free so hosts and tests can provide their
//! own collaborators.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod device;
pub mod fs;
pub mod host;

#[cfg(feature = "std")]
pub mod dir;

pub use device::{BusWidth, DeviceError, MmcHost, MmcTiming, SdHost};
pub use fs::{FsError, FsFile, FsVolume};
pub use host::{DeviceAccessor, FatalReason, FatalReporter, HostMutex, HostPlatform};

/// Logical sector size shared by every device and backing store.
pub const SECTOR_SIZE: usize = 512;

/// log2 of [`SECTOR_SIZE`], for sector/byte conversions.
pub const SECTOR_SHIFT: u32 = 9;

/// Size of each eMMC hardware boot partition in sectors (4 MiB).
pub const BOOT_PARTITION_SIZE: u64 = 0x2000;

/// Success code in the host ABI.
pub const RC_OK: u64 = 0;

/// Failure sentinel returned to the host when a redirected read or write
/// could not be completed.
pub const FS_READ_WRITE_ERROR: u64 = 0x164002;

/// Logical devices addressable through the redirection layer, with the raw
/// ids the host filesystem uses on the wire.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceId {
    Emmc = 0,
    Sd = 1,
    Gc = 2,
}

impl DeviceId {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Emmc),
            1 => Some(Self::Sd),
            2 => Some(Self::Gc),
            _ => None,
        }
    }
}

/// Value of the shared hardware-partition selector word when no partition is
/// selected. The selector otherwise holds a [`MmcPartition`] discriminant.
pub const PARTITION_INVALID: u32 = 3;

/// Hardware partitions of the physical eMMC.
///
/// The discriminant doubles as the partition index used for sector
/// multiplexing on partition-backed redirections: BOOT0 adds no offset,
/// BOOT1 one boot partition, GPP two.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MmcPartition {
    Boot0 = 0,
    Boot1 = 1,
    Gpp = 2,
}

impl MmcPartition {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Boot0),
            1 => Some(Self::Boot1),
            2 => Some(Self::Gpp),
            _ => None,
        }
    }

    /// Index used for the `sector + index * BOOT_PARTITION_SIZE` multiplex.
    pub fn index(self) -> u64 {
        self as u64
    }
}

/// Host filesystem ABI revision carried in the configuration record.
///
/// The core treats this as opaque; hosts compare against the revisions they
/// know about when selecting syscall variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FsVersion(pub u32);
