//! Stateless parameter validation for disks and VMs.
//!
//! Each function checks one rule family and returns the first violation as a
//! [`CoreError`] whose message is suitable for showing to the user. Nothing
//! here touches the registries; uniqueness and disk resolution are checked
//! by the managers.

use crate::disk::DiskFormat;
use crate::error::{CoreError, EntityKind, Result};
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

/// Minimum VM memory in MB.
pub const MIN_MEMORY_MB: i64 = 128;

/// Maximum VM memory in MB (32 GB).
pub const MAX_MEMORY_MB: i64 = 32768;

/// Maximum vCPU count.
pub const MAX_CPUS: i64 = 16;

/// Extensions accepted for installation media.
pub const ISO_EXTENSIONS: &[&str] = &["iso", "img"];

fn name_re() -> &'static Regex {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("valid name regex"))
}

fn size_re() -> &'static Regex {
    static SIZE_RE: OnceLock<Regex> = OnceLock::new();
    SIZE_RE.get_or_init(|| Regex::new(r"^(\d+)([KMGT])$").expect("valid size regex"))
}

/// Check that `name` is usable as a registry key for `kind`.
pub fn validate_name(kind: EntityKind, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CoreError::InvalidName(format!("{kind} name cannot be empty")));
    }
    if !name_re().is_match(name) {
        return Err(CoreError::InvalidName(format!(
            "{kind} name can only contain letters, numbers, underscores, hyphens, and periods"
        )));
    }
    Ok(())
}

/// Parse a disk format name.
pub fn parse_format(format: &str) -> Result<DiskFormat> {
    format
        .parse()
        .map_err(|_| CoreError::InvalidFormat(format.to_string()))
}

/// Binary size unit accepted by the disk tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnit {
    Kilo,
    Mega,
    Giga,
    Tera,
}

impl SizeUnit {
    fn from_suffix(c: char) -> Option<Self> {
        match c {
            'K' => Some(SizeUnit::Kilo),
            'M' => Some(SizeUnit::Mega),
            'G' => Some(SizeUnit::Giga),
            'T' => Some(SizeUnit::Tera),
            _ => None,
        }
    }

    /// Single-letter suffix.
    pub fn suffix(&self) -> char {
        match self {
            SizeUnit::Kilo => 'K',
            SizeUnit::Mega => 'M',
            SizeUnit::Giga => 'G',
            SizeUnit::Tera => 'T',
        }
    }

    /// Bytes per unit.
    pub fn multiplier(&self) -> u64 {
        match self {
            SizeUnit::Kilo => 1 << 10,
            SizeUnit::Mega => 1 << 20,
            SizeUnit::Giga => 1 << 30,
            SizeUnit::Tera => 1 << 40,
        }
    }

    /// Largest amount accepted for this unit.
    pub fn ceiling(&self) -> u64 {
        match self {
            SizeUnit::Kilo => 1_048_576,
            SizeUnit::Mega => 10_240,
            SizeUnit::Giga => 1_024,
            SizeUnit::Tera => 64,
        }
    }
}

/// A validated disk size such as `10G`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSize {
    /// Numeric part, always positive.
    pub amount: u64,
    /// Unit suffix.
    pub unit: SizeUnit,
}

impl DiskSize {
    /// Size in bytes.
    pub fn bytes(&self) -> u64 {
        self.amount * self.unit.multiplier()
    }
}

impl fmt::Display for DiskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit.suffix())
    }
}

/// Parse and range-check a size string.
pub fn parse_size(size: &str) -> Result<DiskSize> {
    let invalid = || CoreError::InvalidSize(format!("Invalid size format: {size}. Examples: 10G, 500M, 2T"));

    let caps = size_re().captures(size).ok_or_else(invalid)?;
    let unit = caps[2]
        .chars()
        .next()
        .and_then(SizeUnit::from_suffix)
        .ok_or_else(invalid)?;

    // Digits too long for u64 are necessarily above every ceiling.
    let amount: u64 = match caps[1].parse() {
        Ok(amount) => amount,
        Err(_) => {
            return Err(CoreError::SizeOutOfRange {
                requested: size.to_string(),
                max: unit.ceiling(),
                unit: unit.suffix(),
            })
        }
    };

    if amount == 0 {
        return Err(CoreError::InvalidSize(
            "Disk size must be greater than zero".to_string(),
        ));
    }
    if amount > unit.ceiling() {
        return Err(CoreError::SizeOutOfRange {
            requested: size.to_string(),
            max: unit.ceiling(),
            unit: unit.suffix(),
        });
    }

    Ok(DiskSize { amount, unit })
}

/// Range-check VM memory in MB.
pub fn validate_memory(memory_mb: i64) -> Result<u32> {
    if memory_mb <= 0 {
        return Err(CoreError::InvalidMemory(
            "Memory must be greater than zero".to_string(),
        ));
    }
    if memory_mb < MIN_MEMORY_MB {
        return Err(CoreError::InvalidMemory(format!(
            "Memory must be at least {MIN_MEMORY_MB} MB"
        )));
    }
    if memory_mb > MAX_MEMORY_MB {
        return Err(CoreError::InvalidMemory(
            "Memory exceeds maximum allowed (32 GB)".to_string(),
        ));
    }
    Ok(memory_mb as u32)
}

/// Range-check the vCPU count.
pub fn validate_cpus(cpus: i64) -> Result<u32> {
    if cpus <= 0 {
        return Err(CoreError::InvalidCpuCount(
            "CPU count must be greater than zero".to_string(),
        ));
    }
    if cpus > MAX_CPUS {
        return Err(CoreError::InvalidCpuCount(format!(
            "CPU count exceeds maximum allowed ({MAX_CPUS})"
        )));
    }
    Ok(cpus as u32)
}

/// Check that an installation medium exists and looks like one.
pub fn validate_iso(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(CoreError::not_found(
            EntityKind::Iso,
            path.display().to_string(),
        ));
    }
    if !has_iso_extension(path) {
        return Err(CoreError::InvalidIso(path.to_path_buf()));
    }
    Ok(())
}

/// Whether `path` ends in one of [`ISO_EXTENSIONS`], ignoring case.
pub fn has_iso_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            ISO_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}
