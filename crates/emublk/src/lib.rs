//! A block redirection layer for console eMMC and SD storage
//!
//! This crate intercepts sector-level requests the host filesystem issues
//! against its internal eMMC or external SD card and redirects them to an
//! alternate backing store: a raw region on another physical device, or a set
//! of regular files on a FAT volume. The host keeps seeing a full physical
//! eMMC with its three hardware partitions (BOOT0, BOOT1, GPP) while the real
//! bytes live elsewhere.
//!
//! The two redirections (eMMC and SD) are independent and composable; each
//! can be off, partition-backed or file-backed. The topology is fixed at
//! startup by a validated configuration record (see [`config`]).
//!
//! The entry point is [`redirect::Redirector`], the process-wide state record
//! owning the topology, the backing handles and the host collaborators bound
//! through the `emublk-core` traits.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

// Sector images and on-disk records are reinterpreted in place.
#[cfg(not(target_endian = "little"))]
compile_error!("This crate only supports little endian systems");

pub mod backing;
pub mod boot;
pub mod config;
pub mod lifecycle;
pub mod locks;
pub mod partition;
pub mod redirect;

pub use config::{ConfigError, EmuConfig, PhysicalDevice, RawEmuConfig, Redirection, Topology};
pub use redirect::{HostBindings, Redirector};
