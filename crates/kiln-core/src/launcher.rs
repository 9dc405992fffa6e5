//! Launching VM processes.
//!
//! A launch is fire-and-forget: the process is spawned detached, given a
//! short grace interval, and only reported as failed if it has already
//! exited by then. Kiln does not track the process afterwards.

use crate::disk::DiskFormat;
use async_trait::async_trait;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info};

/// Default interval to wait before declaring a launch successful.
pub const DEFAULT_LAUNCH_GRACE: Duration = Duration::from_secs(2);

/// Fully resolved parameters for one VM launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// VM name, used for logging.
    pub name: String,
    /// Memory in MB.
    pub memory_mb: u32,
    /// Virtual CPU count.
    pub cpus: u32,
    /// Backing disk image.
    pub disk_path: PathBuf,
    /// Format of the backing disk.
    pub disk_format: DiskFormat,
    /// Installation medium to boot from, if any.
    pub boot_medium: Option<PathBuf>,
    /// Display backend passed to `-display`.
    pub display: String,
    /// File receiving the process's stdout and stderr.
    pub log_path: PathBuf,
}

impl LaunchSpec {
    /// Start building a spec for the named VM.
    pub fn builder(name: impl Into<String>) -> LaunchSpecBuilder {
        LaunchSpecBuilder::new(name)
    }

    /// Command-line arguments for the VM-launch tool.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            self.memory_mb.to_string(),
            "-smp".to_string(),
            self.cpus.to_string(),
            "-drive".to_string(),
            format!(
                "file={},format={}",
                self.disk_path.display(),
                self.disk_format.qemu_driver()
            ),
        ];

        if let Some(iso) = &self.boot_medium {
            args.push("-cdrom".to_string());
            args.push(iso.display().to_string());
            args.push("-boot".to_string());
            args.push("order=dc".to_string());
        }

        args.push("-display".to_string());
        args.push(self.display.clone());
        args
    }
}

/// Fluent builder for [`LaunchSpec`].
#[derive(Debug, Clone)]
pub struct LaunchSpecBuilder {
    spec: LaunchSpec,
}

impl LaunchSpecBuilder {
    /// Create a builder with 512 MB, one CPU and a raw disk.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            spec: LaunchSpec {
                name: name.into(),
                memory_mb: 512,
                cpus: 1,
                disk_path: PathBuf::new(),
                disk_format: DiskFormat::Raw,
                boot_medium: None,
                display: "gtk".to_string(),
                log_path: PathBuf::from("vm.log"),
            },
        }
    }

    /// Set the memory in MB.
    pub fn memory_mb(mut self, mb: u32) -> Self {
        self.spec.memory_mb = mb;
        self
    }

    /// Set the CPU count.
    pub fn cpus(mut self, cpus: u32) -> Self {
        self.spec.cpus = cpus;
        self
    }

    /// Attach the backing disk.
    pub fn disk(mut self, path: impl Into<PathBuf>, format: DiskFormat) -> Self {
        self.spec.disk_path = path.into();
        self.spec.disk_format = format;
        self
    }

    /// Attach an installation medium and boot from it first.
    pub fn boot_medium(mut self, iso: impl Into<PathBuf>) -> Self {
        self.spec.boot_medium = Some(iso.into());
        self
    }

    /// Set the display backend.
    pub fn display(mut self, display: impl Into<String>) -> Self {
        self.spec.display = display.into();
        self
    }

    /// Set the file receiving the process output.
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.log_path = path.into();
        self
    }

    /// Finish building.
    pub fn build(self) -> LaunchSpec {
        self.spec
    }
}

/// A process that survived the launch grace interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchHandle {
    /// OS process id, when the platform reports one.
    pub pid: Option<u32>,
}

/// Why a launch was judged to have failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchFailure(pub String);

impl std::fmt::Display for LaunchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Starts VM processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn the VM described by `spec` and check that it stays alive.
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchHandle, LaunchFailure>;
}

/// [`Launcher`] that runs `qemu-system-*`.
#[derive(Debug, Clone)]
pub struct QemuLauncher {
    binary: PathBuf,
    grace: Duration,
}

impl QemuLauncher {
    /// Create a launcher for the given binary with the default grace interval.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            grace: DEFAULT_LAUNCH_GRACE,
        }
    }

    /// Override the launch grace interval.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn read_log(path: &Path) -> String {
        std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Launcher for QemuLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchHandle, LaunchFailure> {
        if let Some(parent) = spec.log_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LaunchFailure(format!("cannot create log directory: {e}")))?;
        }
        let stdout_file = File::create(&spec.log_path)
            .map_err(|e| LaunchFailure(format!("cannot create launch log: {e}")))?;
        let stderr_file = stdout_file
            .try_clone()
            .map_err(|e| LaunchFailure(format!("cannot create launch log: {e}")))?;

        let args = spec.args();
        info!(
            vm = %spec.name,
            command = %format!("{} {}", self.binary.display(), args.join(" ")),
            "Starting VM"
        );

        // Output goes to a file: a pipe nobody drains would eventually block
        // the guest once the buffer fills.
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .map_err(|e| LaunchFailure(e.to_string()))?;

        tokio::time::sleep(self.grace).await;

        match child.try_wait() {
            Ok(Some(status)) => {
                let output = Self::read_log(&spec.log_path);
                error!(vm = %spec.name, %status, output = %output, "VM process exited immediately");
                if output.is_empty() {
                    Err(LaunchFailure(format!("process exited with {status}")))
                } else {
                    Err(LaunchFailure(output))
                }
            }
            Ok(None) => {
                let pid = child.id();
                info!(vm = %spec.name, ?pid, "VM process running detached");
                Ok(LaunchHandle { pid })
            }
            Err(e) => Err(LaunchFailure(format!("cannot query VM process: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> LaunchSpecBuilder {
        LaunchSpec::builder("vm1")
            .memory_mb(1024)
            .cpus(2)
            .disk("/data/disks/d.qcow2", DiskFormat::Qcow2)
    }

    #[test]
    fn test_builder_defaults() {
        let spec = LaunchSpec::builder("vm").build();
        assert_eq!(spec.memory_mb, 512);
        assert_eq!(spec.cpus, 1);
        assert_eq!(spec.disk_format, DiskFormat::Raw);
        assert!(spec.boot_medium.is_none());
        assert_eq!(spec.display, "gtk");
    }

    #[test]
    fn test_args_without_boot_medium() {
        let args = base_spec().build().args();
        assert_eq!(
            args,
            vec![
                "-m",
                "1024",
                "-smp",
                "2",
                "-drive",
                "file=/data/disks/d.qcow2,format=qcow2",
                "-display",
                "gtk"
            ]
        );
    }

    #[test]
    fn test_args_vhd_disk_uses_vpc_driver() {
        let args = LaunchSpec::builder("win")
            .disk("/data/disks/win.vhd", DiskFormat::Vhd)
            .build()
            .args();
        assert!(args.contains(&"file=/data/disks/win.vhd,format=vpc".to_string()));
    }

    #[test]
    fn test_args_with_boot_medium() {
        let args = base_spec()
            .boot_medium("/data/isos/install.iso")
            .display("none")
            .build()
            .args();
        let cdrom = args.iter().position(|a| a == "-cdrom").unwrap();
        assert_eq!(args[cdrom + 1], "/data/isos/install.iso");
        let boot = args.iter().position(|a| a == "-boot").unwrap();
        assert_eq!(args[boot + 1], "order=dc");
        assert_eq!(args.last().unwrap(), "none");
    }

    #[tokio::test]
    async fn test_launch_reports_early_exit_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-qemu.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'could not open disk' >&2\nexit 1\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let launcher = QemuLauncher::new(&script).with_grace(Duration::from_millis(300));
        let spec = base_spec().log_path(dir.path().join("vm1.log")).build();
        let err = launcher.launch(&spec).await.unwrap_err();
        assert!(err.0.contains("could not open disk"), "{err}");
    }

    #[tokio::test]
    async fn test_launch_detaches_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-qemu.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 2\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let launcher = QemuLauncher::new(&script).with_grace(Duration::from_millis(100));
        let spec = base_spec().log_path(dir.path().join("logs/vm1.log")).build();
        let handle = launcher.launch(&spec).await.unwrap();
        assert!(handle.pid.is_some());
        assert!(dir.path().join("logs/vm1.log").exists());
    }
}
