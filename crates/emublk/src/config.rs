//! The startup configuration record and the validated topology built from it.
//!
//! Configuration arrives from the boot payload as a 0x200-byte in-memory
//! record ([`RawEmuConfig`]). Validation happens once, at startup, and
//! produces an immutable [`Topology`] that the dispatcher pattern-matches on
//! for the rest of the process lifetime.

use alloc::string::String;

use bytemuck::{Pod, Zeroable};
use emublk_core::{DeviceId, FsVersion, FsVolume};

/// `"EFS0"`.
pub const CONFIG_MAGIC: u32 = 0x3053_4645;

/// Maximum length of a backing-directory path, excluding the NUL.
pub const PATH_MAX: usize = 0x80;

/// The raw configuration record, exactly as the boot payload hands it over.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct RawEmuConfig {
    pub magic: u32,
    pub id: u32,
    pub fs_version: u32,
    pub emmc_type: u32,
    pub sd_type: u32,
    _pad: u32,
    /// Start sector of the raw eMMC backing region (partition variants).
    pub emmc_start: u64,
    /// Start sector of the raw SD backing region (partition variants).
    pub sd_start: u64,
    /// NUL-terminated ASCII directory prefix on the backing filesystem.
    pub path: [u8; PATH_MAX + 1],
    /// NUL-terminated ASCII path of the redirected Nintendo-data directory.
    pub nintendo_path: [u8; PATH_MAX + 1],
    _reserved: [u8; 214],
}

static_assertions::const_assert_eq!(core::mem::size_of::<RawEmuConfig>(), 0x200);

impl RawEmuConfig {
    pub fn new(
        id: u32,
        fs_version: u32,
        emmc_type: u32,
        sd_type: u32,
        emmc_start: u64,
        sd_start: u64,
        path: &str,
        nintendo_path: &str,
    ) -> Result<Self, ConfigError> {
        let mut cfg = Self::zeroed();
        cfg.magic = CONFIG_MAGIC;
        cfg.id = id;
        cfg.fs_version = fs_version;
        cfg.emmc_type = emmc_type;
        cfg.sd_type = sd_type;
        cfg.emmc_start = emmc_start;
        cfg.sd_start = sd_start;
        copy_path(&mut cfg.path, path)?;
        copy_path(&mut cfg.nintendo_path, nintendo_path)?;
        Ok(cfg)
    }
}

fn copy_path(dst: &mut [u8; PATH_MAX + 1], src: &str) -> Result<(), ConfigError> {
    if src.len() > PATH_MAX || !src.is_ascii() || src.bytes().any(|b| b == 0) {
        return Err(ConfigError::BadPath);
    }
    dst[..src.len()].copy_from_slice(src.as_bytes());
    Ok(())
}

fn read_path(raw: &[u8; PATH_MAX + 1]) -> Result<String, ConfigError> {
    let len = raw
        .iter()
        .position(|&b| b == 0)
        .ok_or(ConfigError::BadPath)?;
    let bytes = &raw[..len];
    if !bytes.is_ascii() {
        return Err(ConfigError::BadPath);
    }
    Ok(String::from_utf8(bytes.to_vec()).expect("checked ascii"))
}

/// Validation failures for the configuration record. At startup every one of
/// these is fatal; the error type exists so tooling can report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("bad config magic {0:#010x}")]
    BadMagic(u32),
    #[error("invalid eMMC redirection type {0}")]
    InvalidEmmcType(u32),
    #[error("invalid SD redirection type {0}")]
    InvalidSdType(u32),
    #[error("partition redirection requires a nonzero start sector")]
    ZeroStartSector,
    #[error("backing path is empty, too long or not NUL-terminated ASCII")]
    BadPath,
    #[error("backing directory does not exist on the chosen filesystem")]
    MissingDirectory,
}

/// The two physical devices a redirection can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalDevice {
    Sd,
    Emmc,
}

/// One redirection slot of the topology.
///
/// `File` carries the directory prefix from the configuration record; the
/// `eMMC/` or `SD/` component and the part names are appended when the
/// backing files are opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirection {
    None,
    Partition {
        device: PhysicalDevice,
        start_sector: u64,
    },
    File {
        device: PhysicalDevice,
        base_path: String,
    },
}

impl Redirection {
    /// The physical device a request through this slot ends up touching.
    /// Passthrough eMMC still touches the real eMMC.
    pub fn target(&self) -> PhysicalDevice {
        match self {
            Redirection::None => PhysicalDevice::Emmc,
            Redirection::Partition { device, .. } | Redirection::File { device, .. } => *device,
        }
    }

    pub fn is_redirected(&self) -> bool {
        !matches!(self, Redirection::None)
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Redirection::File { .. })
    }
}

/// The immutable redirection topology. Both slots are fixed after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub emmc: Redirection,
    pub sd: Redirection,
}

impl Topology {
    /// Physical device touched by requests on the logical eMMC.
    pub fn emmc_target(&self) -> PhysicalDevice {
        self.emmc.target()
    }

    /// Physical device touched by requests on the logical SD. Passthrough SD
    /// touches the real card.
    pub fn sd_target(&self) -> PhysicalDevice {
        match &self.sd {
            Redirection::None => PhysicalDevice::Sd,
            other => other.target(),
        }
    }

    /// Target for a logical device id. GC requests never reach the
    /// redirection layer, so only eMMC and SD are meaningful here.
    pub fn target(&self, device: DeviceId) -> Option<PhysicalDevice> {
        match device {
            DeviceId::Emmc => Some(self.emmc_target()),
            DeviceId::Sd => Some(self.sd_target()),
            DeviceId::Gc => None,
        }
    }
}

/// A validated configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EmuConfig {
    pub id: u32,
    pub fs_version: FsVersion,
    pub topology: Topology,
    pub nintendo_path: String,
}

impl EmuConfig {
    /// Validates a raw record against the two backing volumes. Any failure
    /// here means a corrupt record or an unsupported combination and aborts
    /// startup.
    ///
    /// File variants require their directory to exist on the volume the
    /// redirection targets, so the check runs here, before any backing
    /// handle is built.
    pub fn from_raw(
        raw: &RawEmuConfig,
        sys_volume: &dyn FsVolume,
        sd_volume: &dyn FsVolume,
    ) -> Result<Self, ConfigError> {
        if raw.magic != CONFIG_MAGIC {
            return Err(ConfigError::BadMagic(raw.magic));
        }

        let path = read_path(&raw.path)?;
        let nintendo_path = read_path(&raw.nintendo_path)?;

        let emmc = match raw.emmc_type {
            0 => Redirection::None,
            1 => partition(PhysicalDevice::Sd, raw.emmc_start)?,
            2 => file(PhysicalDevice::Sd, &path, sd_volume)?,
            3 => partition(PhysicalDevice::Emmc, raw.emmc_start)?,
            4 => file(PhysicalDevice::Emmc, &path, sys_volume)?,
            other => return Err(ConfigError::InvalidEmmcType(other)),
        };

        // Only passthrough and eMMC-partition-backed SD redirections are
        // supported; everything else is rejected here.
        let sd = match raw.sd_type {
            0 => Redirection::None,
            3 => partition(PhysicalDevice::Emmc, raw.sd_start)?,
            other => return Err(ConfigError::InvalidSdType(other)),
        };

        Ok(Self {
            id: raw.id,
            fs_version: FsVersion(raw.fs_version),
            topology: Topology { emmc, sd },
            nintendo_path,
        })
    }
}

fn partition(device: PhysicalDevice, start_sector: u64) -> Result<Redirection, ConfigError> {
    if start_sector == 0 {
        return Err(ConfigError::ZeroStartSector);
    }
    Ok(Redirection::Partition {
        device,
        start_sector,
    })
}

fn file(
    device: PhysicalDevice,
    path: &str,
    volume: &dyn FsVolume,
) -> Result<Redirection, ConfigError> {
    if path.is_empty() {
        return Err(ConfigError::BadPath);
    }
    if !volume.dir_exists(path) {
        return Err(ConfigError::MissingDirectory);
    }
    Ok(Redirection::File {
        device,
        base_path: String::from(path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use emublk_core::{FsError, FsFile};

    /// A volume that only answers directory lookups.
    struct FakeVolume {
        dirs: &'static [&'static str],
    }

    impl FsVolume for FakeVolume {
        fn mount(&self) -> Result<(), FsError> {
            Ok(())
        }
        fn unmount(&self) -> Result<(), FsError> {
            Ok(())
        }
        fn open(&self, _path: &str) -> Result<Box<dyn FsFile>, FsError> {
            Err(FsError::NotFound)
        }
        fn dir_exists(&self, path: &str) -> bool {
            self.dirs.contains(&path)
        }
    }

    const BACKING: FakeVolume = FakeVolume {
        dirs: &["emummc/SD00"],
    };
    const EMPTY: FakeVolume = FakeVolume { dirs: &[] };

    fn raw(emmc_type: u32, sd_type: u32, emmc_start: u64, sd_start: u64) -> RawEmuConfig {
        RawEmuConfig::new(
            1,
            3,
            emmc_type,
            sd_type,
            emmc_start,
            sd_start,
            "emummc/SD00",
            "emummc/Nintendo",
        )
        .unwrap()
    }

    #[test]
    fn accepts_all_emmc_kinds() {
        for (kind, expected) in [
            (0, Redirection::None),
            (
                1,
                Redirection::Partition {
                    device: PhysicalDevice::Sd,
                    start_sector: 0x1000,
                },
            ),
            (
                2,
                Redirection::File {
                    device: PhysicalDevice::Sd,
                    base_path: String::from("emummc/SD00"),
                },
            ),
            (
                3,
                Redirection::Partition {
                    device: PhysicalDevice::Emmc,
                    start_sector: 0x1000,
                },
            ),
            (
                4,
                Redirection::File {
                    device: PhysicalDevice::Emmc,
                    base_path: String::from("emummc/SD00"),
                },
            ),
        ] {
            let cfg = EmuConfig::from_raw(&raw(kind, 0, 0x1000, 0), &BACKING, &BACKING).unwrap();
            assert_eq!(cfg.topology.emmc, expected);
            assert_eq!(cfg.topology.sd, Redirection::None);
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut r = raw(0, 0, 0, 0);
        r.magic = 0x12345678;
        assert_eq!(
            EmuConfig::from_raw(&r, &BACKING, &BACKING),
            Err(ConfigError::BadMagic(0x12345678))
        );
    }

    #[test]
    fn rejects_unsupported_sd_kinds() {
        for kind in [1, 2, 4, 5] {
            assert_eq!(
                EmuConfig::from_raw(&raw(0, kind, 0, 0x1000), &BACKING, &BACKING),
                Err(ConfigError::InvalidSdType(kind))
            );
        }
    }

    #[test]
    fn rejects_zero_start_sector() {
        assert_eq!(
            EmuConfig::from_raw(&raw(3, 0, 0, 0), &BACKING, &BACKING),
            Err(ConfigError::ZeroStartSector)
        );
        assert_eq!(
            EmuConfig::from_raw(&raw(0, 3, 0, 0), &BACKING, &BACKING),
            Err(ConfigError::ZeroStartSector)
        );
    }

    #[test]
    fn rejects_out_of_range_emmc_kind() {
        assert_eq!(
            EmuConfig::from_raw(&raw(5, 0, 0, 0), &BACKING, &BACKING),
            Err(ConfigError::InvalidEmmcType(5))
        );
    }

    #[test]
    fn path_must_fit_and_be_ascii() {
        let long = "a".repeat(PATH_MAX + 1);
        assert_eq!(
            RawEmuConfig::new(0, 0, 0, 0, 0, 0, &long, "").err(),
            Some(ConfigError::BadPath)
        );
        assert_eq!(
            RawEmuConfig::new(0, 0, 0, 0, 0, 0, "sd/\u{00e9}mu", "").err(),
            Some(ConfigError::BadPath)
        );
    }

    #[test]
    fn file_variant_requires_directory_on_chosen_volume() {
        // A file-backed eMMC on the SD card looks the directory up on the SD
        // volume, not the system volume.
        let cfg = EmuConfig::from_raw(&raw(2, 0, 0, 0), &EMPTY, &BACKING).unwrap();
        assert_eq!(
            cfg.topology.emmc,
            Redirection::File {
                device: PhysicalDevice::Sd,
                base_path: String::from("emummc/SD00"),
            }
        );
        assert_eq!(
            EmuConfig::from_raw(&raw(2, 0, 0, 0), &BACKING, &EMPTY).unwrap_err(),
            ConfigError::MissingDirectory
        );

        // And the eMMC-hosted variant looks it up on the system volume.
        let cfg = EmuConfig::from_raw(&raw(4, 0, 0, 0), &BACKING, &EMPTY).unwrap();
        assert_eq!(
            cfg.topology.emmc,
            Redirection::File {
                device: PhysicalDevice::Emmc,
                base_path: String::from("emummc/SD00"),
            }
        );
        assert_eq!(
            EmuConfig::from_raw(&raw(4, 0, 0, 0), &EMPTY, &BACKING).unwrap_err(),
            ConfigError::MissingDirectory
        );
    }

    #[test]
    fn targets_follow_redirection() {
        use emublk_core::DeviceId;

        let cfg = EmuConfig::from_raw(&raw(1, 3, 0x8000, 0x4000), &BACKING, &BACKING).unwrap();
        assert_eq!(cfg.topology.emmc_target(), PhysicalDevice::Sd);
        assert_eq!(cfg.topology.sd_target(), PhysicalDevice::Emmc);

        let cfg = EmuConfig::from_raw(&raw(0, 0, 0, 0), &BACKING, &BACKING).unwrap();
        assert_eq!(cfg.topology.emmc_target(), PhysicalDevice::Emmc);
        assert_eq!(cfg.topology.sd_target(), PhysicalDevice::Sd);
        assert_eq!(cfg.topology.target(DeviceId::Gc), None);
    }
}
