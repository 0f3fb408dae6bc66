//! The mutex composer.
//!
//! The host filesystem serializes its physical controllers with two opaque
//! mutexes, one for the SD card and one for the NAND. Because a redirected
//! logical device may live on either physical device, the set of mutexes a
//! request must hold depends on the whole topology, not just on the device
//! being addressed.
//!
//! The acquisition matrix is encoded as a static table keyed by
//! `(logical device, SD target, eMMC target, custom_driver)`. Two rules are
//! structural: the SD mutex is always taken before the NAND mutex, and
//! release happens in exact reverse order.

use alloc::sync::Arc;

use bitflags::bitflags;
use emublk_core::{DeviceId, HostMutex};

use crate::config::{PhysicalDevice, Topology};

bitflags! {
    /// The mutexes a request holds while it runs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LockSet: u8 {
        const SD = 1 << 0;
        const NAND = 1 << 1;
    }
}

struct MatrixEntry {
    /// Taken regardless of who owns the SD driver.
    always: LockSet,
    /// Additionally taken when the core owns the SD driver (`custom_driver`).
    custom: LockSet,
}

const fn entry(always: LockSet, custom: LockSet) -> MatrixEntry {
    MatrixEntry { always, custom }
}

/// Indexed `[logical device][SD target][eMMC target]`, devices ordered
/// `Emmc, Sd` and targets ordered `Sd, Emmc`.
const MATRIX: [[[MatrixEntry; 2]; 2]; 2] = [
    // Requests on the logical eMMC.
    [
        [
            entry(LockSet::NAND, LockSet::SD),   // SD→sd, eMMC→sd
            entry(LockSet::empty(), LockSet::NAND), // SD→sd, eMMC→emmc
        ],
        [
            entry(LockSet::NAND, LockSet::SD), // SD→emmc, eMMC→sd
            entry(LockSet::SD, LockSet::NAND), // SD→emmc, eMMC→emmc
        ],
    ],
    // Requests on the logical SD.
    [
        [
            entry(LockSet::NAND, LockSet::SD),    // SD→sd, eMMC→sd
            entry(LockSet::empty(), LockSet::SD), // SD→sd, eMMC→emmc
        ],
        [
            entry(LockSet::SD, LockSet::NAND), // SD→emmc, eMMC→sd
            entry(LockSet::SD, LockSet::NAND), // SD→emmc, eMMC→emmc
        ],
    ],
];

/// The lock set for a request on `device` under the given targets.
pub fn lock_set(
    device: DeviceId,
    sd_target: PhysicalDevice,
    emmc_target: PhysicalDevice,
    custom_driver: bool,
) -> LockSet {
    let d = match device {
        DeviceId::Emmc => 0,
        DeviceId::Sd => 1,
        // GC never touches the redirected controllers.
        DeviceId::Gc => return LockSet::empty(),
    };
    let s = match sd_target {
        PhysicalDevice::Sd => 0,
        PhysicalDevice::Emmc => 1,
    };
    let e = match emmc_target {
        PhysicalDevice::Sd => 0,
        PhysicalDevice::Emmc => 1,
    };
    let entry = &MATRIX[d][s][e];
    if custom_driver {
        entry.always | entry.custom
    } else {
        entry.always
    }
}

/// Owns the two host mutexes and the acquisition discipline.
pub struct MutexComposer {
    sd_mutex: Arc<dyn HostMutex>,
    nand_mutex: Arc<dyn HostMutex>,
    custom_driver: bool,
}

impl MutexComposer {
    pub fn new(
        sd_mutex: Arc<dyn HostMutex>,
        nand_mutex: Arc<dyn HostMutex>,
        custom_driver: bool,
    ) -> Self {
        Self {
            sd_mutex,
            nand_mutex,
            custom_driver,
        }
    }

    pub fn custom_driver(&self) -> bool {
        self.custom_driver
    }

    /// Acquires the composite lock set for a request on `device`; the guard
    /// releases it in reverse order when dropped.
    pub fn for_request(&self, device: DeviceId, topology: &Topology) -> CompositeGuard<'_> {
        let set = lock_set(
            device,
            topology.sd_target(),
            topology.emmc_target(),
            self.custom_driver,
        );
        self.acquire(set)
    }

    /// The lock set held around a host-driven SD controller re-init: both
    /// device locks, so no redirected I/O can race it.
    pub fn for_controller_open(&self) -> CompositeGuard<'_> {
        let mut set = LockSet::NAND;
        if self.custom_driver {
            set |= LockSet::SD;
        }
        self.acquire(set)
    }

    fn acquire(&self, set: LockSet) -> CompositeGuard<'_> {
        if set.contains(LockSet::SD) {
            self.sd_mutex.lock();
        }
        if set.contains(LockSet::NAND) {
            self.nand_mutex.lock();
        }
        CompositeGuard {
            composer: self,
            set,
        }
    }

    fn release(&self, set: LockSet) {
        if set.contains(LockSet::NAND) {
            self.nand_mutex.unlock();
        }
        if set.contains(LockSet::SD) {
            self.sd_mutex.unlock();
        }
    }
}

pub struct CompositeGuard<'a> {
    composer: &'a MutexComposer,
    set: LockSet,
}

impl CompositeGuard<'_> {
    pub fn set(&self) -> LockSet {
        self.set
    }
}

impl Drop for CompositeGuard<'_> {
    fn drop(&mut self) {
        self.composer.release(self.set);
    }
}
