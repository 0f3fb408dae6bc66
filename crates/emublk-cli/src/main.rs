//! Assembles the 0x200-byte configuration record the redirection core
//! consumes at startup from the `emummc/emummc.ini` and `emusd/emusd.ini`
//! files a user keeps on the SD card, and inspects existing records and
//! backing images.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Parser;
use emublk::boot;
use emublk::config::{EmuConfig, RawEmuConfig};
use emublk_core::dir::DirVolume;
use emublk_core::{SECTOR_SHIFT, SECTOR_SIZE};

#[derive(Debug, Parser)]
#[command(name = "emublk", about = "emublk configuration tooling")]
struct Arguments {
    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Build a configuration record from the ini files under an SD root.
    Assemble {
        /// SD card root holding emummc/emummc.ini and emusd/emusd.ini.
        #[arg(long, default_value = ".")]
        root: PathBuf,
        /// Where to write the 0x200-byte record.
        #[arg(long)]
        out: PathBuf,
    },
    /// Print the validated topology of an existing record.
    Inspect {
        record: PathBuf,
        /// Root the record's backing directories are resolved against.
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Locate the package2 partition in a GPP backing image.
    Gpt { image: PathBuf },
}

fn main() -> anyhow::Result<()> {
    match Arguments::parse().subcommand {
        Subcommand::Assemble { root, out } => assemble(&root, &out),
        Subcommand::Inspect { record, root } => inspect(&record, &root),
        Subcommand::Gpt { image } => gpt(&image),
    }
}

fn assemble(root: &Path, out: &Path) -> anyhow::Result<()> {
    let emummc = read_ini_section(&root.join("emummc/emummc.ini"), "emummc")?;
    let emusd = read_ini_section(&root.join("emusd/emusd.ini"), "emusd")?;

    let enabled: u32 = emummc.get_dec("enabled").unwrap_or(0);
    let id: u32 = emummc.get_hex("id").unwrap_or(0);
    let sector: u64 = emummc.get_hex("sector").map(u64::from).unwrap_or(0);
    let path = emummc.get_str("path").unwrap_or_default();
    let nintendo_path = emummc.get_str("nintendo_path").unwrap_or_default();

    let (emmc_type, emmc_start) = match enabled {
        0 => (0, 0),
        // SD based
        1 => {
            if sector > 0 {
                (1, sector)
            } else if !path.is_empty() && root.join(&path).is_dir() {
                (2, 0)
            } else {
                bail!("invalid emummc setting: no sector and no usable path");
            }
        }
        // eMMC based; the eMMC FAT partition is not reachable from here, so
        // the tree under the SD root stands in for it when the record is
        // validated below.
        4 => {
            if sector > 0 {
                (3, sector)
            } else if !path.is_empty() {
                (4, 0)
            } else {
                bail!("invalid emummc setting: no sector and no path");
            }
        }
        other => bail!("invalid emummc setting: enabled={other}"),
    };

    let sd_enabled: u32 = emusd.get_dec("enabled").unwrap_or(0);
    let sd_sector: u64 = emusd.get_hex("sector").map(u64::from).unwrap_or(0);
    let (sd_type, sd_start) = match sd_enabled {
        0 => (0, 0),
        4 => {
            if sd_sector > 0 {
                (3, sd_sector)
            } else {
                bail!("invalid emusd setting: no sector");
            }
        }
        other => bail!("invalid emusd setting: enabled={other}"),
    };

    let raw = RawEmuConfig::new(
        id,
        0,
        emmc_type,
        sd_type,
        emmc_start,
        sd_start,
        &path,
        &nintendo_path,
    )
    .context("building configuration record")?;

    // Validate before writing so a broken record never lands on disk. Both
    // backing volumes are resolved against the SD root.
    let volume = DirVolume::new(root);
    let config =
        EmuConfig::from_raw(&raw, &volume, &volume).context("validating configuration record")?;
    fs::write(out, bytemuck::bytes_of(&raw))
        .with_context(|| format!("writing {}", out.display()))?;

    println!("wrote {}: {:?}", out.display(), config.topology);
    Ok(())
}

fn inspect(record: &Path, root: &Path) -> anyhow::Result<()> {
    let bytes = fs::read(record).with_context(|| format!("reading {}", record.display()))?;
    if bytes.len() < std::mem::size_of::<RawEmuConfig>() {
        bail!("record too short: {} bytes", bytes.len());
    }
    let raw: RawEmuConfig =
        bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<RawEmuConfig>()]);
    let volume = DirVolume::new(root);
    let config =
        EmuConfig::from_raw(&raw, &volume, &volume).context("validating configuration record")?;

    println!("id:            {:#x}", config.id);
    println!("fs version:    {}", config.fs_version.0);
    println!("eMMC:          {:?}", config.topology.emmc);
    println!("SD:            {:?}", config.topology.sd);
    println!("nintendo path: {}", config.nintendo_path);
    Ok(())
}

fn gpt(image: &Path) -> anyhow::Result<()> {
    let bytes = fs::read(image).with_context(|| format!("reading {}", image.display()))?;
    let table_start = SECTOR_SIZE; // LBA 1
    let table_len = boot::GPT_SECTORS << SECTOR_SHIFT;
    if bytes.len() < table_start + table_len {
        bail!("image too short for a GPT");
    }
    let range = boot::locate_package2(&bytes[table_start..table_start + table_len])
        .context("locating package2 partition")?;
    println!(
        "{}: sectors {:#x}..={:#x} ({} sectors)",
        boot::PACKAGE2_PARTITION_NAME,
        range.first_lba,
        range.last_lba,
        range.sector_count()
    );
    Ok(())
}

/// The key/value pairs of one ini section. Unknown keys are ignored, like
/// the boot payload does.
#[derive(Debug, Default)]
struct IniSection {
    entries: Vec<(String, String)>,
}

impl IniSection {
    fn get_str(&self, key: &str) -> Option<String> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn get_dec(&self, key: &str) -> Option<u32> {
        self.get_str(key)?.parse().ok()
    }

    fn get_hex(&self, key: &str) -> Option<u32> {
        let value = self.get_str(key)?;
        let trimmed = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .unwrap_or(&value);
        u32::from_str_radix(trimmed, 16).ok()
    }
}

/// Reads one section of an ini file. A missing file is an empty section,
/// matching the payload's lenient parse.
fn read_ini_section(path: &Path, section: &str) -> anyhow::Result<IniSection> {
    let Ok(text) = fs::read_to_string(path) else {
        return Ok(IniSection::default());
    };

    let mut current = String::new();
    let mut out = IniSection::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = name.trim().to_string();
            continue;
        }
        if current != section {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            out.entries
                .push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(out)
}
