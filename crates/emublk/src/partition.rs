//! The hardware-partition coordinator.
//!
//! The physical eMMC controller is switched between BOOT0, BOOT1 and GPP by a
//! single selector. The host filesystem owns a shared word recording which
//! partition *it* selected; redirected accesses may have to move the
//! controller somewhere else (file- and partition-backed stores live behind
//! GPP) and must put it back before returning.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use emublk_core::{FatalReason, FatalReporter, MmcHost, MmcPartition};

/// Tracks the one outstanding partition override.
///
/// `ensure`/`restore` must be called as a pair around each redirected
/// request; nesting is not supported, the outermost pair wins.
pub struct PartitionTracker {
    selector: Arc<AtomicU32>,
    should_restore: bool,
    saved: MmcPartition,
}

impl PartitionTracker {
    pub fn new(selector: Arc<AtomicU32>) -> Self {
        Self {
            selector,
            should_restore: false,
            saved: MmcPartition::Gpp,
        }
    }

    /// The partition the host currently has selected. An invalid selector
    /// word means the host state is corrupt.
    pub fn host_selected(&self, fatal: &dyn FatalReporter) -> MmcPartition {
        let raw = self.selector.load(Ordering::Acquire);
        match MmcPartition::from_raw(raw) {
            Some(partition) => partition,
            None => {
                log::debug!("invalid partition selector {raw}");
                fatal.fatal(FatalReason::InvalidPartition)
            }
        }
    }

    /// Switches the controller to `target` if the host selected something
    /// else, arming the restore. Returns the host-selected partition so the
    /// caller can pick the backing the host actually addressed.
    pub fn ensure(
        &mut self,
        mmc: &dyn MmcHost,
        fatal: &dyn FatalReporter,
        target: MmcPartition,
    ) -> MmcPartition {
        let current = self.host_selected(fatal);
        if current != target {
            switch(mmc, fatal, target);
            self.saved = current;
            self.should_restore = true;
        }
        current
    }

    /// Puts the controller back on the partition captured by `ensure`, if a
    /// switch happened.
    pub fn restore(&mut self, mmc: &dyn MmcHost, fatal: &dyn FatalReporter) {
        if self.should_restore {
            switch(mmc, fatal, self.saved);
            self.should_restore = false;
        }
    }
}

fn switch(mmc: &dyn MmcHost, fatal: &dyn FatalReporter, partition: MmcPartition) {
    if mmc.set_partition(partition).is_err() {
        // The controller is in an unknown state now.
        log::debug!("partition switch to {partition:?} failed");
        fatal.fatal(FatalReason::PartitionSwitch)
    }
}
