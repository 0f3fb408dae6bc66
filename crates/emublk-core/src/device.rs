//! Storage-driver seams.
//!
//! The low-level SD/MMC host-controller driver is an external collaborator;
//! the redirection core only ever talks to it through [`SdHost`] and
//! [`MmcHost`]. Buffers are always whole sectors: `buf.len()` must be a
//! multiple of [`crate::SECTOR_SIZE`] and determines the transfer length.

use crate::MmcPartition;

/// Errors reported by a storage driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The transfer failed on the controller. Can happen at any time and is
    /// reported back to the host as a read/write error.
    #[error("controller I/O failed")]
    Io,
    /// The requested range lies outside the device.
    #[error("sector range out of bounds")]
    OutOfBounds,
    /// The controller has not been initialized, or initialization failed.
    #[error("device not ready")]
    NotReady,
}

/// Bus widths the eMMC controller can be brought up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusWidth {
    One,
    Four,
    Eight,
}

/// Timing modes for eMMC initialization, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmcTiming {
    Hs400,
    Hs200,
    Hs52,
}

/// Driver interface for the physical SD card controller.
pub trait SdHost: Send + Sync {
    /// Brings the card up. `power_cycle` requests a full power cycle first.
    fn init(&self, power_cycle: bool) -> Result<(), DeviceError>;

    /// Releases the controller.
    fn end(&self) -> Result<(), DeviceError>;

    /// Whether the card regulator is currently powered. The host's boot
    /// sysmodule may cut SD power behind the core's back; this is how the
    /// core notices.
    fn power_enabled(&self) -> bool;

    /// Capacity of the card in sectors.
    fn sector_count(&self) -> u64;

    fn read(&self, sector: u64, buf: &mut [u8]) -> Result<(), DeviceError>;
    fn write(&self, sector: u64, buf: &[u8]) -> Result<(), DeviceError>;
}

/// Driver interface for the physical eMMC controller.
///
/// A single `init` call performs one bring-up attempt at the given bus
/// parameters; the adaptive mode ladder that steps down through slower modes
/// lives in the redirection core, not in the driver.
pub trait MmcHost: Send + Sync {
    fn init(&self, bus_width: BusWidth, timing: MmcTiming) -> Result<(), DeviceError>;

    /// Releases the controller (also used to power cycle between ladder
    /// steps).
    fn end(&self) -> Result<(), DeviceError>;

    /// Switches the controller to the given hardware partition. The shared
    /// selector word observed by the core is owned by the host and is not
    /// written here.
    fn set_partition(&self, partition: MmcPartition) -> Result<(), DeviceError>;

    /// Capacity of the user-data (GPP) area in sectors.
    fn sector_count(&self) -> u64;

    /// Reads from the currently selected hardware partition.
    fn read(&self, sector: u64, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Writes to the currently selected hardware partition.
    fn write(&self, sector: u64, buf: &[u8]) -> Result<(), DeviceError>;
}
