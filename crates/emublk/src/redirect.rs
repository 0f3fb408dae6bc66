//! The process-wide state record and the request dispatcher.
//!
//! [`Redirector`] owns everything mutable in the redirection layer and is the
//! object the host's storage hooks call into. The four public entry points
//! (`read`, `write`, `controller_open`, `controller_close`) return raw host
//! ABI codes; everything beneath them is `Result`-based and only the boundary
//! translates.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::AtomicU32;

use emublk_core::{
    BOOT_PARTITION_SIZE, DeviceAccessor, DeviceError, DeviceId, FS_READ_WRITE_ERROR, FatalReason,
    FatalReporter, FsError, FsFile, FsVersion, FsVolume, HostMutex, HostPlatform, MmcHost,
    MmcPartition, RC_OK, SECTOR_SHIFT, SdHost,
};

use crate::config::{EmuConfig, PhysicalDevice, RawEmuConfig, Redirection, Topology};
use crate::lifecycle::Runtime;
use crate::locks::MutexComposer;

/// Everything the host process hands over at startup: drivers, volumes,
/// accessor vtables, mutexes, the shared partition selector and the fatal
/// reporter.
pub struct HostBindings {
    pub sd: Arc<dyn SdHost>,
    pub emmc: Arc<dyn MmcHost>,
    /// The FAT volume on the eMMC GPP (`sys:`).
    pub sys_volume: Arc<dyn FsVolume>,
    /// The FAT volume on the SD card (`sdmc:`).
    pub sd_volume: Arc<dyn FsVolume>,
    pub sd_accessor: Arc<dyn DeviceAccessor>,
    pub nand_accessor: Arc<dyn DeviceAccessor>,
    pub gc_accessor: Arc<dyn DeviceAccessor>,
    pub sd_mutex: Arc<dyn HostMutex>,
    pub nand_mutex: Arc<dyn HostMutex>,
    /// The host's hardware-partition selector word. Read-only for the core.
    pub active_partition: Arc<AtomicU32>,
    pub platform: Arc<dyn HostPlatform>,
    pub fatal: Arc<dyn FatalReporter>,
    /// Whether the core owns the SD driver (and therefore the SD mutex).
    pub custom_driver: bool,
}

/// Why a redirected transfer did not complete. Only the ABI boundary sees
/// this; both variants map to [`FS_READ_WRITE_ERROR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RwFailure {
    OutOfBounds,
    Backing,
}

/// A reference to one of the two physical storage drivers.
pub(crate) enum StorageRef<'a> {
    Sd(&'a dyn SdHost),
    Mmc(&'a dyn MmcHost),
}

impl StorageRef<'_> {
    pub(crate) fn sector_count(&self) -> u64 {
        match self {
            StorageRef::Sd(dev) => dev.sector_count(),
            StorageRef::Mmc(dev) => dev.sector_count(),
        }
    }

    pub(crate) fn read(&self, sector: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        match self {
            StorageRef::Sd(dev) => dev.read(sector, buf),
            StorageRef::Mmc(dev) => dev.read(sector, buf),
        }
    }

    pub(crate) fn write(&self, sector: u64, buf: &[u8]) -> Result<(), DeviceError> {
        match self {
            StorageRef::Sd(dev) => dev.write(sector, buf),
            StorageRef::Mmc(dev) => dev.write(sector, buf),
        }
    }
}

/// The redirection core. One per process, created at startup, never torn
/// down.
pub struct Redirector {
    pub(crate) topology: Topology,
    id: u32,
    fs_version: FsVersion,
    nintendo_path: String,
    pub(crate) sd: Arc<dyn SdHost>,
    pub(crate) emmc: Arc<dyn MmcHost>,
    pub(crate) fs_sys: Arc<dyn FsVolume>,
    pub(crate) fs_sdmc: Arc<dyn FsVolume>,
    acc_sd: Arc<dyn DeviceAccessor>,
    acc_nand: Arc<dyn DeviceAccessor>,
    acc_gc: Arc<dyn DeviceAccessor>,
    composer: MutexComposer,
    pub(crate) platform: Arc<dyn HostPlatform>,
    pub(crate) fatal: Arc<dyn FatalReporter>,
    pub(crate) state: spin::Mutex<Runtime>,
}

impl Redirector {
    pub fn new(config: EmuConfig, host: HostBindings) -> Self {
        let runtime = Runtime::new(host.active_partition.clone());
        Self {
            topology: config.topology,
            id: config.id,
            fs_version: config.fs_version,
            nintendo_path: config.nintendo_path,
            sd: host.sd,
            emmc: host.emmc,
            fs_sys: host.sys_volume,
            fs_sdmc: host.sd_volume,
            acc_sd: host.sd_accessor,
            acc_nand: host.nand_accessor,
            acc_gc: host.gc_accessor,
            composer: MutexComposer::new(host.sd_mutex, host.nand_mutex, host.custom_driver),
            platform: host.platform,
            fatal: host.fatal,
            state: spin::Mutex::new(runtime),
        }
    }

    /// Builds the redirector straight from the boot payload's record,
    /// validating it against the bound volumes (file-backed variants must
    /// point at an existing directory). A record that fails validation is a
    /// corrupt or unsupported setup and aborts the process.
    pub fn from_raw(raw: &RawEmuConfig, host: HostBindings) -> Self {
        match EmuConfig::from_raw(raw, host.sys_volume.as_ref(), host.sd_volume.as_ref()) {
            Ok(config) => Self::new(config, host),
            Err(err) => {
                log::debug!("invalid configuration record: {err}");
                host.fatal.fatal(FatalReason::InvalidConfig)
            }
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn fs_version(&self) -> FsVersion {
        self.fs_version
    }

    /// The redirected Nintendo-data directory from the configuration record.
    pub fn nintendo_path(&self) -> &str {
        &self.nintendo_path
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub(crate) fn storage(&self, device: PhysicalDevice) -> StorageRef<'_> {
        match device {
            PhysicalDevice::Sd => StorageRef::Sd(self.sd.as_ref()),
            PhysicalDevice::Emmc => StorageRef::Mmc(self.emmc.as_ref()),
        }
    }

    /// Host read hook. Returns `0` on success or [`FS_READ_WRITE_ERROR`].
    pub fn read(&self, device: DeviceId, sector: u64, count: u32, buf: &mut [u8]) -> u64 {
        self.read_write(device, sector, count, buf, false)
    }

    /// Host write hook. Returns `0` on success or [`FS_READ_WRITE_ERROR`].
    pub fn write(&self, device: DeviceId, sector: u64, count: u32, buf: &mut [u8]) -> u64 {
        self.read_write(device, sector, count, buf, true)
    }

    fn read_write(
        &self,
        device: DeviceId,
        sector: u64,
        count: u32,
        buf: &mut [u8],
        is_write: bool,
    ) -> u64 {
        match device {
            // GC always passes through untouched.
            DeviceId::Gc => return self.acc_gc.read_write(sector, count, buf, !is_write),
            // So does the SD when it is not redirected; the host accessor
            // takes its own locks.
            DeviceId::Sd if !self.topology.sd.is_redirected() => {
                return self.acc_sd.read_write(sector, count, buf, !is_write);
            }
            _ => {}
        }

        let len = (count as usize) << SECTOR_SHIFT;
        let Some(buf) = buf.get_mut(..len) else {
            return FS_READ_WRITE_ERROR;
        };

        let _locks = self.composer.for_request(device, &self.topology);
        let mut rt = self.state.lock();
        self.ensure_attached(&mut rt);
        self.ensure_initialized(&mut rt, device);

        let result = if device == DeviceId::Emmc {
            self.emmc_rw(&mut rt, sector, count, buf, is_write)
        } else {
            self.sd_rw(&mut rt, sector, count, buf, is_write)
        };
        drop(rt);

        match result {
            Ok(()) => RC_OK,
            Err(_) => FS_READ_WRITE_ERROR,
        }
    }

    /// Redirected eMMC transfer.
    fn emmc_rw(
        &self,
        rt: &mut Runtime,
        sector: u64,
        count: u32,
        buf: &mut [u8],
        is_write: bool,
    ) -> Result<(), RwFailure> {
        match &self.topology.emmc {
            Redirection::None | Redirection::Partition { .. } => {
                let mut sector = sector;
                if let Redirection::Partition { start_sector, .. } = &self.topology.emmc {
                    // The raw region packs BOOT0, BOOT1 and GPP back to back;
                    // the partition the host selected picks the slice.
                    let requested = rt.partition.host_selected(self.fatal.as_ref());
                    sector += start_sector + requested.index() * BOOT_PARTITION_SIZE;
                }

                let target = self.topology.emmc.target();
                let dev = self.storage(target);
                if sector + count as u64 > dev.sector_count() {
                    if target == PhysicalDevice::Sd {
                        // Running off the end of the raw SD region would
                        // clobber foreign data.
                        log::debug!(
                            "OOB eMMC-on-SD access: sector {sector:#x} count {count:#x}"
                        );
                        self.fatal.fatal(FatalReason::OutOfBounds);
                    }
                    // Expected after a backing resize (nand patrol).
                    return Err(RwFailure::OutOfBounds);
                }

                if self.topology.emmc.is_redirected() && target == PhysicalDevice::Emmc {
                    rt.partition
                        .ensure(self.emmc.as_ref(), self.fatal.as_ref(), MmcPartition::Gpp);
                }
                let result = if is_write {
                    dev.write(sector, buf)
                } else {
                    dev.read(sector, buf)
                };
                rt.partition.restore(self.emmc.as_ref(), self.fatal.as_ref());
                result.map_err(|_| RwFailure::Backing)
            }
            Redirection::File { device, .. } => {
                let requested = if *device == PhysicalDevice::Emmc {
                    // The backing files live on the GPP FAT volume.
                    rt.partition
                        .ensure(self.emmc.as_ref(), self.fatal.as_ref(), MmcPartition::Gpp)
                } else {
                    rt.partition.host_selected(self.fatal.as_ref())
                };

                let Some(files) = rt.emmc_files.as_mut() else {
                    self.fatal.fatal(FatalReason::FsFileOpen)
                };
                let result = match requested {
                    MmcPartition::Boot0 => file_rw(&mut files.boot0, sector, buf, is_write),
                    MmcPartition::Boot1 => file_rw(&mut files.boot1, sector, buf, is_write),
                    MmcPartition::Gpp => files.gpp.io(sector, buf, is_write),
                };
                rt.partition.restore(self.emmc.as_ref(), self.fatal.as_ref());
                result.map_err(|err| match err {
                    FsError::OutOfBounds => RwFailure::OutOfBounds,
                    _ => RwFailure::Backing,
                })
            }
        }
    }

    /// Redirected SD transfer. Unlike the eMMC side, a bounds violation here
    /// cannot legitimately happen and aborts instead of soft-failing.
    fn sd_rw(
        &self,
        rt: &mut Runtime,
        sector: u64,
        count: u32,
        buf: &mut [u8],
        is_write: bool,
    ) -> Result<(), RwFailure> {
        match &self.topology.sd {
            Redirection::None => {
                // Passthrough was forwarded before the dispatch.
                self.fatal.fatal(FatalReason::InvalidEnum)
            }
            Redirection::Partition {
                device,
                start_sector,
            } => {
                let sector = sector + start_sector;
                let dev = self.storage(*device);
                if sector + count as u64 > dev.sector_count() {
                    log::debug!(
                        "OOB SD access: sector {sector:#x} count {count:#x} size {:#x}",
                        dev.sector_count()
                    );
                    self.fatal.fatal(FatalReason::OutOfBounds);
                }

                if *device == PhysicalDevice::Emmc {
                    rt.partition
                        .ensure(self.emmc.as_ref(), self.fatal.as_ref(), MmcPartition::Gpp);
                }
                let result = if is_write {
                    dev.write(sector, buf)
                } else {
                    dev.read(sector, buf)
                };
                rt.partition.restore(self.emmc.as_ref(), self.fatal.as_ref());
                result.map_err(|_| RwFailure::Backing)
            }
            Redirection::File { device, .. } => {
                if *device == PhysicalDevice::Emmc {
                    rt.partition
                        .ensure(self.emmc.as_ref(), self.fatal.as_ref(), MmcPartition::Gpp);
                }
                let Some(store) = rt.sd_files.as_mut() else {
                    self.fatal.fatal(FatalReason::FsFileOpen)
                };
                let result = store.io(sector, buf, is_write);
                rt.partition.restore(self.emmc.as_ref(), self.fatal.as_ref());
                match result {
                    Ok(()) => Ok(()),
                    Err(FsError::OutOfBounds) => {
                        log::debug!("OOB SD file access: sector {sector:#x} count {count:#x}");
                        self.fatal.fatal(FatalReason::OutOfBounds)
                    }
                    Err(_) => Err(RwFailure::Backing),
                }
            }
        }
    }

    /// Host controller-open hook.
    pub fn controller_open(&self, device: DeviceId) -> u64 {
        match device {
            DeviceId::Sd => {
                // Hold both device locks so no redirected I/O races the
                // host's controller re-init.
                let _locks = self.composer.for_controller_open();
                log::debug!("controller open SD");
                self.acc_sd.open()
            }
            DeviceId::Emmc => self.acc_nand.open(),
            DeviceId::Gc => self.acc_gc.open(),
        }
    }

    /// Host controller-close hook. Closing a controller another redirection
    /// still depends on is deferred until that redirection's own close.
    pub fn controller_close(&self, device: DeviceId) -> u64 {
        match device {
            DeviceId::Sd => {
                let mut rt = self.state.lock();
                log::debug!("controller close SD");
                self.finalize_sd_files(&mut rt);
                if self.topology.emmc_target() == PhysicalDevice::Sd {
                    // The eMMC redirection still lives on the card.
                    log::debug!("SD still in use, deferring close");
                    return RC_OK;
                }
                rt.sd_initialized = false;
                rt.sd_first_init_done = false;
                drop(rt);
                self.acc_sd.close()
            }
            DeviceId::Emmc => {
                let mut rt = self.state.lock();
                log::debug!("controller close eMMC");
                self.finalize_emmc_files(&mut rt);
                if self.topology.emmc_target() == PhysicalDevice::Sd {
                    // Now the deferred SD close can happen.
                    rt.sd_initialized = false;
                    rt.sd_first_init_done = false;
                    let _ = self.acc_sd.close();
                }
                drop(rt);
                self.acc_nand.close()
            }
            DeviceId::Gc => self.acc_gc.close(),
        }
    }
}

fn file_rw(
    file: &mut alloc::boxed::Box<dyn FsFile>,
    sector: u64,
    buf: &mut [u8],
    is_write: bool,
) -> Result<(), FsError> {
    let offset = sector << SECTOR_SHIFT;
    if is_write {
        file.write_at(offset, buf)
    } else {
        file.read_at(offset, buf)
    }
}
