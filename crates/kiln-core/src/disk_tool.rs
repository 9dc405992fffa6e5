//! Creation of disk images through the image tool.

use crate::disk::DiskFormat;
use crate::tool::run_tool;
use crate::validate::DiskSize;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::instrument;

/// Why the image tool could not create an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateFailure(pub String);

impl std::fmt::Display for CreateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something that can materialize a new disk image on the filesystem.
#[async_trait]
pub trait DiskTool: Send + Sync {
    /// Create an image of `format` and `size` at `path`.
    async fn create(
        &self,
        path: &Path,
        format: DiskFormat,
        size: DiskSize,
    ) -> Result<(), CreateFailure>;
}

/// [`DiskTool`] backed by `qemu-img create`.
#[derive(Debug, Clone)]
pub struct QemuImg {
    binary: PathBuf,
}

impl QemuImg {
    /// Create a wrapper around the given `qemu-img` binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Arguments passed to `qemu-img` for a create call.
    pub fn create_args(path: &Path, format: DiskFormat, size: DiskSize) -> Vec<String> {
        vec![
            "create".to_string(),
            "-f".to_string(),
            format.qemu_driver().to_string(),
            path.display().to_string(),
            size.to_string(),
        ]
    }
}

#[async_trait]
impl DiskTool for QemuImg {
    #[instrument(skip_all, fields(path = %path.display(), %format, %size))]
    async fn create(
        &self,
        path: &Path,
        format: DiskFormat,
        size: DiskSize,
    ) -> Result<(), CreateFailure> {
        let args = Self::create_args(path, format, size);
        tracing::info!(
            command = %format!("{} {}", self.binary.display(), args.join(" ")),
            "Running command"
        );

        let out = run_tool(&self.binary, &args)
            .await
            .map_err(|e| CreateFailure(e.to_string()))?;

        if !out.success() {
            return Err(CreateFailure(out.failure_reason()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::parse_size;

    #[test]
    fn test_create_args() {
        let args = QemuImg::create_args(
            Path::new("/data/disks/alpha.qcow2"),
            DiskFormat::Qcow2,
            parse_size("10G").unwrap(),
        );
        assert_eq!(
            args,
            vec!["create", "-f", "qcow2", "/data/disks/alpha.qcow2", "10G"]
        );
    }

    #[test]
    fn test_create_args_vhd_uses_vpc_driver() {
        let args = QemuImg::create_args(
            Path::new("/data/disks/win.vhd"),
            DiskFormat::Vhd,
            parse_size("1G").unwrap(),
        );
        assert_eq!(args, vec!["create", "-f", "vpc", "/data/disks/win.vhd", "1G"]);
    }

    #[tokio::test]
    async fn test_missing_binary_fails() {
        let tool = QemuImg::new("/nonexistent/qemu-img");
        let result = tool
            .create(
                Path::new("/tmp/x.raw"),
                DiskFormat::Raw,
                parse_size("1M").unwrap(),
            )
            .await;
        assert!(result.is_err());
    }
}
