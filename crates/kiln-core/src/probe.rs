//! Ground-truth metadata for disk images.
//!
//! The registry never trusts its own idea of a disk's format or size. After
//! creation and during adoption it asks the image tool what is really on
//! disk, through the [`Probe`] trait.

use crate::disk::DiskFormat;
use crate::tool::run_tool;
use async_trait::async_trait;
use serde::Deserialize;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::instrument;

/// Metadata reported by the image tool for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInfo {
    /// Detected image format.
    pub format: DiskFormat,
    /// Virtual size in bytes.
    pub size_bytes: u64,
}

/// Why a probe could not determine metadata.
///
/// This is a value, not an error to propagate: callers treat it as
/// "unknown" and skip whatever depended on the metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    /// The tool could not be started.
    Spawn(String),
    /// The tool exited non-zero.
    Exit { code: i32, stderr: String },
    /// The tool's output was not the expected JSON document.
    Parse(String),
    /// The detected format is not one Kiln manages.
    UnsupportedFormat(String),
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::Spawn(e) => write!(f, "could not run image tool: {e}"),
            ProbeFailure::Exit { code, stderr } => {
                write!(f, "image tool exited with status {code}: {}", stderr.trim())
            }
            ProbeFailure::Parse(e) => write!(f, "could not parse image tool output: {e}"),
            ProbeFailure::UnsupportedFormat(other) => write!(f, "unsupported image format: {other}"),
        }
    }
}

/// Source of authoritative disk metadata.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Inspect the image at `path`.
    async fn probe(&self, path: &Path) -> Result<DiskInfo, ProbeFailure>;
}

#[derive(Debug, Deserialize)]
struct QemuImgInfo {
    format: String,
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
}

/// Parse the JSON document printed by `qemu-img info --output=json`.
pub fn parse_info(json: &str) -> Result<DiskInfo, ProbeFailure> {
    let info: QemuImgInfo =
        serde_json::from_str(json).map_err(|e| ProbeFailure::Parse(e.to_string()))?;
    let format = DiskFormat::from_qemu_driver(&info.format)
        .ok_or_else(|| ProbeFailure::UnsupportedFormat(info.format.clone()))?;
    Ok(DiskInfo {
        format,
        size_bytes: info.virtual_size,
    })
}

/// [`Probe`] backed by `qemu-img info`.
#[derive(Debug, Clone)]
pub struct QemuImgProbe {
    binary: PathBuf,
}

impl QemuImgProbe {
    /// Create a probe that runs the given `qemu-img` binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl Probe for QemuImgProbe {
    #[instrument(skip_all, fields(path = %path.display()))]
    async fn probe(&self, path: &Path) -> Result<DiskInfo, ProbeFailure> {
        let out = run_tool(
            &self.binary,
            [OsStr::new("info"), OsStr::new("--output=json"), path.as_os_str()],
        )
        .await
        .map_err(|e| ProbeFailure::Spawn(e.to_string()))?;

        if !out.success() {
            return Err(ProbeFailure::Exit {
                code: out.exit_code,
                stderr: out.stderr,
            });
        }
        parse_info(&out.stdout)
    }
}
