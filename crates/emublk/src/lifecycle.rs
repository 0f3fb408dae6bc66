//! Backing-store lifecycle: lazy initialization, power-loss recovery,
//! refcounted mounts, the eMMC bus-mode ladder and the nand-patrol sanity
//! pass.

use alloc::sync::Arc;
use core::sync::atomic::AtomicU32;

use bytemuck::{Pod, Zeroable};
use emublk_core::{
    BusWidth, DeviceId, FatalReason, FatalReporter, FsVolume, MmcPartition, MmcTiming,
    SECTOR_SHIFT, SECTOR_SIZE,
};

use crate::backing::{EmmcFileSet, OpenError, SplitStore, open_sd_set};
use crate::boot;
use crate::config::{PhysicalDevice, Redirection};
use crate::partition::PartitionTracker;
use crate::redirect::Redirector;

/// Sector of the nand-patrol record, relative to the start of the backing
/// store.
pub const NAND_PATROL_SECTOR: u64 = 0x4400;

/// Byte offset of the nand-patrol record in a file-backed BOOT0 image.
pub const NAND_PATROL_OFFSET: u64 = NAND_PATROL_SECTOR << SECTOR_SHIFT;

/// The background health-check record the host filesystem keeps on the
/// device. Only the last patrolled offset matters to the core: after a
/// backing store was shrunk it can point past the end and must be reset.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct NandPatrolRecord {
    pub offset: u32,
    pub count: u32,
    _reserved: [u8; 504],
}

static_assertions::const_assert_eq!(core::mem::size_of::<NandPatrolRecord>(), SECTOR_SIZE);

/// A refcounted mount of one FAT volume. The physical mount happens on the
/// 0→1 transition, the unmount on 1→0, and a decrement from zero means the
/// core's bookkeeping is broken.
pub(crate) struct MountRef {
    count: u32,
}

impl MountRef {
    fn new() -> Self {
        Self { count: 0 }
    }

    pub(crate) fn mount(&mut self, volume: &dyn FsVolume, fatal: &dyn FatalReporter) {
        if self.count == 0 {
            if volume.mount().is_err() {
                log::debug!("volume mount failed");
                fatal.fatal(FatalReason::FsMount);
            }
        }
        self.count += 1;
    }

    pub(crate) fn unmount(&mut self, volume: &dyn FsVolume, fatal: &dyn FatalReporter) {
        if self.count == 0 {
            log::debug!("unmount before mount");
            fatal.fatal(FatalReason::MountUnderflow);
        }
        self.count -= 1;
        if self.count == 0 {
            let _ = volume.unmount();
        }
    }

    pub(crate) fn held(&self) -> u32 {
        self.count
    }
}

/// Bus modes of the adaptive eMMC init ladder, slowest first so stepping
/// down is a decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmmcBusMode {
    InitFail,
    Hs52OneBit,
    Hs52EightBit,
    Hs200,
    Hs400,
}

impl EmmcBusMode {
    fn step_down(self) -> Self {
        match self {
            EmmcBusMode::Hs400 => EmmcBusMode::Hs200,
            EmmcBusMode::Hs200 => EmmcBusMode::Hs52EightBit,
            EmmcBusMode::Hs52EightBit => EmmcBusMode::Hs52OneBit,
            EmmcBusMode::Hs52OneBit | EmmcBusMode::InitFail => EmmcBusMode::InitFail,
        }
    }

    /// Init parameters for this rung; `None` once the floor is reached.
    fn params(self) -> Option<(BusWidth, MmcTiming)> {
        match self {
            EmmcBusMode::InitFail => None,
            EmmcBusMode::Hs52OneBit => Some((BusWidth::One, MmcTiming::Hs52)),
            EmmcBusMode::Hs52EightBit => Some((BusWidth::Eight, MmcTiming::Hs52)),
            EmmcBusMode::Hs200 => Some((BusWidth::Eight, MmcTiming::Hs200)),
            EmmcBusMode::Hs400 => Some((BusWidth::Eight, MmcTiming::Hs400)),
        }
    }
}

/// All mutable runtime state, guarded by the redirector's state cell and, at
/// the outside, by the composite device locks.
pub(crate) struct Runtime {
    pub sd_initialized: bool,
    pub emmc_initialized: bool,
    /// First SD bring-up happened.
    pub sd_first_init_done: bool,
    /// The one-shot recovery after the boot sysmodule cuts SD power ran.
    pub sd_reinit_done: bool,
    pub emmc_bus_mode: EmmcBusMode,
    pub das_attached: bool,
    pub nand_patrol_checked: bool,
    pub sd_region_checked: bool,
    pub mount_sys: MountRef,
    pub mount_sdmc: MountRef,
    pub emmc_files: Option<EmmcFileSet>,
    pub sd_files: Option<SplitStore>,
    pub partition: PartitionTracker,
}

impl Runtime {
    pub(crate) fn new(selector: Arc<AtomicU32>) -> Self {
        Self {
            sd_initialized: false,
            emmc_initialized: false,
            sd_first_init_done: false,
            sd_reinit_done: false,
            emmc_bus_mode: EmmcBusMode::Hs400,
            das_attached: false,
            nand_patrol_checked: false,
            sd_region_checked: false,
            mount_sys: MountRef::new(),
            mount_sdmc: MountRef::new(),
            emmc_files: None,
            sd_files: None,
            partition: PartitionTracker::new(selector),
        }
    }
}

impl Redirector {
    /// Attaches the device address space exactly once, even if the host
    /// filesystem never did.
    pub(crate) fn ensure_attached(&self, rt: &mut Runtime) {
        if !rt.das_attached {
            self.platform.attach_device_address_space();
            rt.das_attached = true;
        }
    }

    /// Brings up whatever physical device the request is about to touch, and
    /// runs the one-shot sanity passes.
    pub(crate) fn ensure_initialized(&self, rt: &mut Runtime, device: DeviceId) {
        let Some(target) = self.topology.target(device) else {
            return;
        };
        match target {
            PhysicalDevice::Sd => self.ensure_sd(rt),
            PhysicalDevice::Emmc => self.ensure_emmc(rt),
        }
        if device == DeviceId::Sd {
            self.validate_sd_region(rt);
        }
        self.nand_patrol_check(rt);
    }

    fn ensure_sd(&self, rt: &mut Runtime) {
        if !rt.sd_first_init_done {
            self.initialize_sd(rt);
            rt.sd_first_init_done = true;
        } else if !rt.sd_reinit_done && !self.sd.power_enabled() {
            // The boot sysmodule killed SD power behind us; bring the card
            // back once and stop watching.
            self.finalize_sd(rt);
            self.initialize_sd(rt);
            rt.sd_reinit_done = true;
        }

        // A controller close drops the file handles without necessarily
        // powering the card down; reopen whatever lives on the SD volume.
        self.open_file_sets_on(rt, PhysicalDevice::Sd);
    }

    fn ensure_emmc(&self, rt: &mut Runtime) {
        self.initialize_emmc(rt);
    }

    fn initialize_sd(&self, rt: &mut Runtime) {
        if rt.sd_initialized {
            return;
        }
        let mut retries = 3;
        while retries > 0 {
            if self.sd.init(false).is_ok() {
                rt.sd_initialized = true;
                break;
            }
            retries -= 1;
        }
        if !rt.sd_initialized {
            log::debug!("SD initialize failed");
            self.fatal.fatal(FatalReason::InitSd);
        }
        self.open_file_sets_on(rt, PhysicalDevice::Sd);
    }

    pub(crate) fn finalize_sd(&self, rt: &mut Runtime) {
        if self.sd.end().is_err() {
            log::debug!("SD end failed");
            self.fatal.fatal(FatalReason::InitSd);
        }
        rt.sd_initialized = false;
    }

    fn initialize_emmc(&self, rt: &mut Runtime) {
        if rt.emmc_initialized {
            return;
        }
        if !self.emmc_ladder(rt) {
            log::debug!("eMMC initialize failed");
            self.fatal.fatal(FatalReason::InitMmc);
        }
        // Come up on whatever the host believes is selected.
        let selected = rt.partition.host_selected(self.fatal.as_ref());
        if self.emmc.set_partition(selected).is_err() {
            self.fatal.fatal(FatalReason::InitMmc);
        }
        rt.emmc_initialized = true;
        self.open_file_sets_on(rt, PhysicalDevice::Emmc);
    }

    /// Walks the bus-mode ladder: try the current mode, power cycle and step
    /// down on failure, give up at the floor. A later reset restarts from
    /// HS400.
    fn emmc_ladder(&self, rt: &mut Runtime) -> bool {
        if rt.emmc_bus_mode == EmmcBusMode::InitFail {
            rt.emmc_bus_mode = EmmcBusMode::Hs400;
        }
        let mut ok = self.emmc_init_step(rt, false);
        while !ok {
            if rt.emmc_bus_mode == EmmcBusMode::InitFail {
                let _ = self.emmc.end();
                return false;
            }
            ok = self.emmc_init_step(rt, true);
        }
        true
    }

    fn emmc_init_step(&self, rt: &mut Runtime, power_cycle: bool) -> bool {
        if power_cycle {
            rt.emmc_bus_mode = rt.emmc_bus_mode.step_down();
            let _ = self.emmc.end();
        }
        match rt.emmc_bus_mode.params() {
            None => false,
            Some((width, timing)) => self.emmc.init(width, timing).is_ok(),
        }
    }

    /// Opens every file-backed set whose volume lives on `device` and is not
    /// open yet, taking a mount reference for each.
    fn open_file_sets_on(&self, rt: &mut Runtime, device: PhysicalDevice) {
        if let Redirection::File {
            device: file_device,
            base_path,
        } = &self.topology.emmc
        {
            if *file_device == device && rt.emmc_files.is_none() {
                let base_path = base_path.clone();
                let (volume, mount) = self.volume_on(rt, device);
                mount.mount(volume.as_ref(), self.fatal.as_ref());
                match EmmcFileSet::open(volume.as_ref(), &base_path) {
                    Ok(set) => rt.emmc_files = Some(set),
                    Err(err) => self.open_failure(err),
                }
            }
        }

        if let Redirection::File {
            device: file_device,
            base_path,
        } = &self.topology.sd
        {
            if *file_device == device && rt.sd_files.is_none() {
                let base_path = base_path.clone();
                let (volume, mount) = self.volume_on(rt, device);
                mount.mount(volume.as_ref(), self.fatal.as_ref());
                match open_sd_set(volume.as_ref(), &base_path) {
                    Ok(store) => rt.sd_files = Some(store),
                    Err(err) => self.open_failure(err),
                }
            }
        }
    }

    fn volume_on<'a>(
        &'a self,
        rt: &'a mut Runtime,
        device: PhysicalDevice,
    ) -> (&'a Arc<dyn FsVolume>, &'a mut MountRef) {
        match device {
            PhysicalDevice::Emmc => (&self.fs_sys, &mut rt.mount_sys),
            PhysicalDevice::Sd => (&self.fs_sdmc, &mut rt.mount_sdmc),
        }
    }

    fn open_failure(&self, err: OpenError) -> ! {
        match err {
            OpenError::ClusterMap => {
                log::debug!("cluster map registration failed");
                self.fatal.fatal(FatalReason::FsMapExhaustion)
            }
            OpenError::Open(fs_err) => {
                log::debug!("backing file open failed: {fs_err}");
                self.fatal.fatal(FatalReason::FsFileOpen)
            }
            OpenError::EmptyFirstPart => {
                log::debug!("backing part 00 is empty");
                self.fatal.fatal(FatalReason::FsFileOpen)
            }
        }
    }

    /// Closes the eMMC file set and releases its mount reference. Called on
    /// controller close; dropping the handles closes them.
    pub(crate) fn finalize_emmc_files(&self, rt: &mut Runtime) {
        let Redirection::File { device, .. } = &self.topology.emmc else {
            return;
        };
        if rt.emmc_files.take().is_some() {
            let device = *device;
            let (volume, mount) = self.volume_on(rt, device);
            mount.unmount(volume.as_ref(), self.fatal.as_ref());
        }
    }

    /// Closes the SD split set and releases its mount reference.
    pub(crate) fn finalize_sd_files(&self, rt: &mut Runtime) {
        let Redirection::File { device, .. } = &self.topology.sd else {
            return;
        };
        if rt.sd_files.take().is_some() {
            let device = *device;
            let (volume, mount) = self.volume_on(rt, device);
            mount.unmount(volume.as_ref(), self.fatal.as_ref());
        }
    }

    /// Sanity check for a partition-backed SD redirection: the region must
    /// carry an MBR whose first partition fits inside the backing device.
    fn validate_sd_region(&self, rt: &mut Runtime) {
        if rt.sd_region_checked {
            return;
        }
        let Redirection::Partition {
            device,
            start_sector,
        } = &self.topology.sd
        else {
            rt.sd_region_checked = true;
            return;
        };

        let device = *device;
        let start_sector = *start_sector;
        let dev = self.storage(device);
        let mut buf = [0u8; SECTOR_SIZE];
        if device == PhysicalDevice::Emmc {
            rt.partition
                .ensure(self.emmc.as_ref(), self.fatal.as_ref(), MmcPartition::Gpp);
        }
        let read = dev.read(start_sector, &mut buf);
        if device == PhysicalDevice::Emmc {
            rt.partition.restore(self.emmc.as_ref(), self.fatal.as_ref());
        }

        if read.is_err() {
            log::debug!("emuSD MBR read failed");
            self.fatal.fatal(FatalReason::InvalidConfig);
        }
        match boot::emusd_region_sectors(&buf) {
            Some(region) if start_sector + region <= dev.sector_count() => {}
            _ => {
                log::debug!("invalid emuSD region at sector {start_sector:#x}");
                self.fatal.fatal(FatalReason::InvalidConfig);
            }
        }
        rt.sd_region_checked = true;
    }

    /// Once per lifetime: read the nand-patrol record and zero it in place if
    /// its offset points past the (possibly resized) backing store. Failures
    /// along the way are swallowed.
    fn nand_patrol_check(&self, rt: &mut Runtime) {
        if rt.nand_patrol_checked {
            return;
        }

        match &self.topology.emmc {
            Redirection::None | Redirection::Partition { .. } => {
                let start = match &self.topology.emmc {
                    Redirection::Partition { start_sector, .. } => *start_sector,
                    _ => 0,
                };
                let patrol_sector = start + NAND_PATROL_SECTOR;
                let dev = self.storage(self.topology.emmc.target());

                // Passthrough keeps the record in the physical BOOT0; a raw
                // backing packs it at the start of the region.
                let target = if self.topology.emmc.is_redirected() {
                    MmcPartition::Gpp
                } else {
                    MmcPartition::Boot0
                };
                rt.partition
                    .ensure(self.emmc.as_ref(), self.fatal.as_ref(), target);

                let mut buf = [0u8; SECTOR_SIZE];
                if dev.read(patrol_sector, &mut buf).is_ok() {
                    let record: NandPatrolRecord = bytemuck::pod_read_unaligned(&buf);
                    if record.offset as u64 > dev.sector_count() {
                        buf.fill(0);
                        let _ = dev.write(patrol_sector, &buf);
                    }
                }
                rt.partition.restore(self.emmc.as_ref(), self.fatal.as_ref());
            }
            Redirection::File { .. } => {
                if let Some(files) = rt.emmc_files.as_mut() {
                    let total_sectors = files.gpp.total_sectors();
                    let mut buf = [0u8; SECTOR_SIZE];
                    if files.boot0.read_at(NAND_PATROL_OFFSET, &mut buf).is_ok() {
                        let record: NandPatrolRecord = bytemuck::pod_read_unaligned(&buf);
                        if record.offset as u64 > total_sectors {
                            buf.fill(0);
                            if files.boot0.write_at(NAND_PATROL_OFFSET, &buf).is_ok() {
                                let _ = files.boot0.sync();
                            }
                        }
                    }
                }
            }
        }

        rt.nand_patrol_checked = true;
    }
}
