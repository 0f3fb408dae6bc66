//! A mock host process: RAM-backed storage drivers, directory-backed FAT
//! volumes, counting mutexes and a panicking fatal reporter.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use emublk::{EmuConfig, HostBindings, Redirector, Topology};
use emublk_core::dir::DirVolume;
use emublk_core::{
    BusWidth, DeviceAccessor, DeviceError, FatalReason, FatalReporter, FsVersion, HostMutex,
    HostPlatform, MmcHost, MmcPartition, MmcTiming, SECTOR_SIZE, SdHost,
};
use tempfile::TempDir;

/// Shared, ordered record of lock/unlock/forward events.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub struct RamSd {
    pub data: Mutex<Vec<u8>>,
    pub powered: AtomicBool,
    /// Number of upcoming `init` calls that should fail.
    pub init_failures: AtomicU32,
    pub init_calls: AtomicU32,
    pub end_calls: AtomicU32,
}

impl RamSd {
    pub fn new(sectors: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; sectors * SECTOR_SIZE]),
            powered: AtomicBool::new(true),
            init_failures: AtomicU32::new(0),
            init_calls: AtomicU32::new(0),
            end_calls: AtomicU32::new(0),
        }
    }

    pub fn fill(&self, sector: u64, bytes: &[u8]) {
        let mut data = self.data.lock().unwrap();
        let offset = sector as usize * SECTOR_SIZE;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn snapshot(&self, sector: u64, len: usize) -> Vec<u8> {
        let data = self.data.lock().unwrap();
        let offset = sector as usize * SECTOR_SIZE;
        data[offset..offset + len].to_vec()
    }
}

impl SdHost for RamSd {
    fn init(&self, _power_cycle: bool) -> Result<(), DeviceError> {
        self.init_calls.fetch_add(1, Ordering::Relaxed);
        if self.init_failures.load(Ordering::Relaxed) > 0 {
            self.init_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(DeviceError::NotReady);
        }
        Ok(())
    }

    fn end(&self) -> Result<(), DeviceError> {
        self.end_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn power_enabled(&self) -> bool {
        self.powered.load(Ordering::Relaxed)
    }

    fn sector_count(&self) -> u64 {
        (self.data.lock().unwrap().len() / SECTOR_SIZE) as u64
    }

    fn read(&self, sector: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let data = self.data.lock().unwrap();
        let offset = sector as usize * SECTOR_SIZE;
        if offset + buf.len() > data.len() {
            return Err(DeviceError::OutOfBounds);
        }
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&self, sector: u64, buf: &[u8]) -> Result<(), DeviceError> {
        let mut data = self.data.lock().unwrap();
        let offset = sector as usize * SECTOR_SIZE;
        if offset + buf.len() > data.len() {
            return Err(DeviceError::OutOfBounds);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

pub struct RamMmc {
    pub boot0: Mutex<Vec<u8>>,
    pub boot1: Mutex<Vec<u8>>,
    pub gpp: Mutex<Vec<u8>>,
    /// What the controller is physically switched to right now.
    pub hw_partition: AtomicU32,
    pub switches: Mutex<Vec<MmcPartition>>,
    pub fail_switch: AtomicBool,
    /// Number of upcoming `init` calls that should fail.
    pub init_failures: AtomicU32,
    pub init_log: Mutex<Vec<(BusWidth, MmcTiming)>>,
    pub end_calls: AtomicU32,
}

impl RamMmc {
    pub fn new(gpp_sectors: usize) -> Self {
        Self {
            boot0: Mutex::new(vec![0u8; 0x2000 * SECTOR_SIZE]),
            boot1: Mutex::new(vec![0u8; 0x2000 * SECTOR_SIZE]),
            gpp: Mutex::new(vec![0u8; gpp_sectors * SECTOR_SIZE]),
            hw_partition: AtomicU32::new(MmcPartition::Gpp as u32),
            switches: Mutex::new(Vec::new()),
            fail_switch: AtomicBool::new(false),
            init_failures: AtomicU32::new(0),
            init_log: Mutex::new(Vec::new()),
            end_calls: AtomicU32::new(0),
        }
    }

    pub fn hw(&self) -> MmcPartition {
        MmcPartition::from_raw(self.hw_partition.load(Ordering::Relaxed)).unwrap()
    }

    pub fn fill_gpp(&self, sector: u64, bytes: &[u8]) {
        let mut gpp = self.gpp.lock().unwrap();
        let offset = sector as usize * SECTOR_SIZE;
        gpp[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn snapshot_gpp(&self, sector: u64, len: usize) -> Vec<u8> {
        let gpp = self.gpp.lock().unwrap();
        let offset = sector as usize * SECTOR_SIZE;
        gpp[offset..offset + len].to_vec()
    }

    fn buffer(&self) -> &Mutex<Vec<u8>> {
        match self.hw() {
            MmcPartition::Boot0 => &self.boot0,
            MmcPartition::Boot1 => &self.boot1,
            MmcPartition::Gpp => &self.gpp,
        }
    }
}

impl MmcHost for RamMmc {
    fn init(&self, bus_width: BusWidth, timing: MmcTiming) -> Result<(), DeviceError> {
        self.init_log.lock().unwrap().push((bus_width, timing));
        if self.init_failures.load(Ordering::Relaxed) > 0 {
            self.init_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(DeviceError::NotReady);
        }
        Ok(())
    }

    fn end(&self) -> Result<(), DeviceError> {
        self.end_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn set_partition(&self, partition: MmcPartition) -> Result<(), DeviceError> {
        if self.fail_switch.load(Ordering::Relaxed) {
            return Err(DeviceError::Io);
        }
        self.switches.lock().unwrap().push(partition);
        self.hw_partition.store(partition as u32, Ordering::Relaxed);
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        (self.gpp.lock().unwrap().len() / SECTOR_SIZE) as u64
    }

    fn read(&self, sector: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let data = self.buffer().lock().unwrap();
        let offset = sector as usize * SECTOR_SIZE;
        if offset + buf.len() > data.len() {
            return Err(DeviceError::OutOfBounds);
        }
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&self, sector: u64, buf: &[u8]) -> Result<(), DeviceError> {
        let mut data = self.buffer().lock().unwrap();
        let offset = sector as usize * SECTOR_SIZE;
        if offset + buf.len() > data.len() {
            return Err(DeviceError::OutOfBounds);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// Host mutex that records events and rejects nesting.
pub struct LoggingMutex {
    name: &'static str,
    held: AtomicI32,
    pub acquisitions: AtomicU32,
    log: EventLog,
}

impl LoggingMutex {
    pub fn new(name: &'static str, log: EventLog) -> Self {
        Self {
            name,
            held: AtomicI32::new(0),
            acquisitions: AtomicU32::new(0),
            log,
        }
    }

    pub fn held(&self) -> i32 {
        self.held.load(Ordering::Relaxed)
    }
}

impl HostMutex for LoggingMutex {
    fn lock(&self) {
        let prev = self.held.fetch_add(1, Ordering::Relaxed);
        assert_eq!(prev, 0, "nested lock of {}", self.name);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.log.lock().unwrap().push(format!("lock {}", self.name));
    }

    fn unlock(&self) {
        let prev = self.held.fetch_sub(1, Ordering::Relaxed);
        assert_eq!(prev, 1, "unlock of unheld {}", self.name);
        self.log
            .lock()
            .unwrap()
            .push(format!("unlock {}", self.name));
    }
}

/// Host accessor that records forwards and returns a fixed code.
pub struct RecordingAccessor {
    name: &'static str,
    pub opens: AtomicU32,
    pub closes: AtomicU32,
    pub reads: AtomicU32,
    pub writes: AtomicU32,
    pub last_sector: AtomicU64,
    log: EventLog,
}

impl RecordingAccessor {
    pub fn new(name: &'static str, log: EventLog) -> Self {
        Self {
            name,
            opens: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
            last_sector: AtomicU64::new(0),
            log,
        }
    }
}

impl DeviceAccessor for RecordingAccessor {
    fn open(&self) -> u64 {
        self.opens.fetch_add(1, Ordering::Relaxed);
        self.log.lock().unwrap().push(format!("open {}", self.name));
        0
    }

    fn close(&self) -> u64 {
        self.closes.fetch_add(1, Ordering::Relaxed);
        self.log
            .lock()
            .unwrap()
            .push(format!("close {}", self.name));
        0
    }

    fn read_write(&self, sector: u64, _count: u32, _buf: &mut [u8], is_read: bool) -> u64 {
        if is_read {
            self.reads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        self.last_sector.store(sector, Ordering::Relaxed);
        self.log
            .lock()
            .unwrap()
            .push(format!("forward {}", self.name));
        0
    }
}

pub struct PanicFatal;

impl FatalReporter for PanicFatal {
    fn fatal(&self, reason: FatalReason) -> ! {
        panic!("fatal abort: {reason:?}")
    }
}

pub struct NoopPlatform {
    pub attaches: AtomicU32,
}

impl HostPlatform for NoopPlatform {
    fn attach_device_address_space(&self) {
        self.attaches.fetch_add(1, Ordering::Relaxed);
    }
}

/// The assembled mock host plus handles the tests poke at.
pub struct TestHost {
    pub sd: Arc<RamSd>,
    pub mmc: Arc<RamMmc>,
    pub selector: Arc<AtomicU32>,
    pub sd_mutex: Arc<LoggingMutex>,
    pub nand_mutex: Arc<LoggingMutex>,
    pub acc_sd: Arc<RecordingAccessor>,
    pub acc_nand: Arc<RecordingAccessor>,
    pub acc_gc: Arc<RecordingAccessor>,
    pub platform: Arc<NoopPlatform>,
    pub events: EventLog,
    pub sys_dir: TempDir,
    pub sd_dir: TempDir,
}

impl TestHost {
    pub fn new(sd_sectors: usize, gpp_sectors: usize) -> Self {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        Self {
            sd: Arc::new(RamSd::new(sd_sectors)),
            mmc: Arc::new(RamMmc::new(gpp_sectors)),
            selector: Arc::new(AtomicU32::new(MmcPartition::Gpp as u32)),
            sd_mutex: Arc::new(LoggingMutex::new("sd", events.clone())),
            nand_mutex: Arc::new(LoggingMutex::new("nand", events.clone())),
            acc_sd: Arc::new(RecordingAccessor::new("sd", events.clone())),
            acc_nand: Arc::new(RecordingAccessor::new("nand", events.clone())),
            acc_gc: Arc::new(RecordingAccessor::new("gc", events.clone())),
            platform: Arc::new(NoopPlatform {
                attaches: AtomicU32::new(0),
            }),
            events,
            sys_dir: TempDir::new().unwrap(),
            sd_dir: TempDir::new().unwrap(),
        }
    }

    pub fn select(&self, partition: MmcPartition) {
        self.selector.store(partition as u32, Ordering::Relaxed);
        self.mmc
            .hw_partition
            .store(partition as u32, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn redirector(&self, topology: Topology, custom_driver: bool) -> Redirector {
        let config = EmuConfig {
            id: 1,
            fs_version: FsVersion(3),
            topology,
            nintendo_path: String::from("emu/Nintendo"),
        };
        let bindings = HostBindings {
            sd: self.sd.clone(),
            emmc: self.mmc.clone(),
            sys_volume: Arc::new(DirVolume::new(self.sys_dir.path())),
            sd_volume: Arc::new(DirVolume::new(self.sd_dir.path())),
            sd_accessor: self.acc_sd.clone(),
            nand_accessor: self.acc_nand.clone(),
            gc_accessor: self.acc_gc.clone(),
            sd_mutex: self.sd_mutex.clone(),
            nand_mutex: self.nand_mutex.clone(),
            active_partition: self.selector.clone(),
            platform: self.platform.clone(),
            fatal: Arc::new(PanicFatal),
            custom_driver,
        };
        Redirector::new(config, bindings)
    }
}

/// Creates a (sparse) backing file of `sectors` sectors.
pub fn make_backing_file(root: &Path, rel: &str, sectors: u64) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = fs::File::create(&path).unwrap();
    file.set_len(sectors * SECTOR_SIZE as u64).unwrap();
}

/// Writes bytes at a byte offset inside an existing backing file.
pub fn patch_file(root: &Path, rel: &str, offset: u64, bytes: &[u8]) {
    use std::io::{Seek, SeekFrom, Write};
    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(root.join(rel))
        .unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
}

/// Reads bytes at a byte offset from a backing file.
pub fn read_file_at(root: &Path, rel: &str, offset: u64, len: usize) -> Vec<u8> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = fs::File::open(root.join(rel)).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).unwrap();
    buf
}

/// A sector filled with one marker byte.
pub fn sector_of(byte: u8) -> Vec<u8> {
    vec![byte; SECTOR_SIZE]
}

/// Standard file-backed eMMC tree: BOOT0, BOOT1 and `parts` GPP files of
/// `part_sectors` each, under `<root>/<prefix>/eMMC/`.
pub fn make_emmc_tree(root: &Path, prefix: &str, parts: usize, part_sectors: u64) {
    make_backing_file(root, &format!("{prefix}/eMMC/BOOT0"), 0x2000);
    make_backing_file(root, &format!("{prefix}/eMMC/BOOT1"), 0x2000);
    for idx in 0..parts {
        make_backing_file(root, &format!("{prefix}/eMMC/{idx:02}"), part_sectors);
    }
}
