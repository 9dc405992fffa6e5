//! Runtime configuration.
//!
//! Configuration is loaded from environment variables with defaults relative
//! to the working directory, so a fresh checkout works without any setup.

use crate::error::{CoreError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default data directory.
pub const DEFAULT_DATA_DIR: &str = "data";

/// Default launch grace interval in milliseconds.
pub const DEFAULT_LAUNCH_GRACE_MS: u64 = 2000;

/// Where Kiln keeps its state and which tools it drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KilnConfig {
    /// Root for registry documents and the default subdirectories.
    pub data_dir: PathBuf,
    /// Managed disk images.
    pub disks_dir: PathBuf,
    /// VM configuration documents.
    pub vms_dir: PathBuf,
    /// Installation media offered to `vm isos`.
    pub isos_dir: PathBuf,
    /// Launch logs, one per VM.
    pub logs_dir: PathBuf,
    /// `qemu-img` binary.
    pub qemu_img: PathBuf,
    /// `qemu-system-*` binary used to launch VMs.
    pub qemu_system: PathBuf,
    /// Container engine binary.
    pub docker: PathBuf,
    /// How long a launched VM must survive to count as started.
    pub launch_grace: Duration,
    /// Display backend passed to the VM launcher.
    pub display: String,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl KilnConfig {
    /// Create a new config builder.
    pub fn builder() -> KilnConfigBuilder {
        KilnConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `KILN_DATA_DIR` | `data` |
    /// | `KILN_DISKS_DIR` | `<data>/disks` |
    /// | `KILN_VMS_DIR` | `<data>/vms` |
    /// | `KILN_ISOS_DIR` | `<data>/isos` |
    /// | `KILN_LOGS_DIR` | `<data>/logs` |
    /// | `KILN_QEMU_IMG` | `qemu-img` |
    /// | `KILN_QEMU_SYSTEM` | `qemu-system-x86_64` |
    /// | `KILN_DOCKER` | `docker` |
    /// | `KILN_LAUNCH_GRACE_MS` | `2000` |
    /// | `KILN_DISPLAY` | `gtk` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);

        let mut builder = Self::builder();
        if let Some(dir) = path("KILN_DATA_DIR") {
            builder = builder.data_dir(dir);
        }
        if let Some(dir) = path("KILN_DISKS_DIR") {
            builder = builder.disks_dir(dir);
        }
        if let Some(dir) = path("KILN_VMS_DIR") {
            builder = builder.vms_dir(dir);
        }
        if let Some(dir) = path("KILN_ISOS_DIR") {
            builder = builder.isos_dir(dir);
        }
        if let Some(dir) = path("KILN_LOGS_DIR") {
            builder = builder.logs_dir(dir);
        }
        if let Some(bin) = path("KILN_QEMU_IMG") {
            builder = builder.qemu_img(bin);
        }
        if let Some(bin) = path("KILN_QEMU_SYSTEM") {
            builder = builder.qemu_system(bin);
        }
        if let Some(bin) = path("KILN_DOCKER") {
            builder = builder.docker(bin);
        }
        match lookup("KILN_LAUNCH_GRACE_MS").map(|v| v.parse::<u64>()) {
            Some(Ok(ms)) => builder = builder.launch_grace(Duration::from_millis(ms)),
            Some(Err(_)) => tracing::warn!("KILN_LAUNCH_GRACE_MS is not a number, using default"),
            None => {}
        }
        if let Some(display) = lookup("KILN_DISPLAY").filter(|v| !v.is_empty()) {
            builder = builder.display(display);
        }
        builder.build()
    }

    /// Path of the persisted disk registry.
    pub fn disk_registry_path(&self) -> PathBuf {
        self.data_dir.join("disk_registry.json")
    }

    /// Path of the persisted VM registry.
    pub fn vm_registry_path(&self) -> PathBuf {
        self.data_dir.join("vm_registry.json")
    }

    /// Create every configured directory.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.data_dir,
            &self.disks_dir,
            &self.vms_dir,
            &self.isos_dir,
            &self.logs_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|source| CoreError::Persistence {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Log a warning for each configured tool that cannot be found.
    ///
    /// Missing tools only matter once an operation needs them, so this never
    /// fails.
    pub fn validate_warn(&self) {
        for (what, bin) in [
            ("qemu-img", &self.qemu_img),
            ("qemu-system", &self.qemu_system),
            ("docker", &self.docker),
        ] {
            if !binary_available(bin) {
                tracing::warn!(tool = what, path = %bin.display(), "Tool not found");
            }
        }
    }
}

/// Whether `bin` names an existing file, either directly or on `PATH`.
fn binary_available(bin: &Path) -> bool {
    if bin.components().count() > 1 {
        return bin.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(bin).is_file()))
        .unwrap_or(false)
}

/// Builder for [`KilnConfig`].
///
/// Subdirectories not set explicitly are derived from the data directory at
/// [`build`](Self::build) time.
#[derive(Debug, Default)]
pub struct KilnConfigBuilder {
    data_dir: Option<PathBuf>,
    disks_dir: Option<PathBuf>,
    vms_dir: Option<PathBuf>,
    isos_dir: Option<PathBuf>,
    logs_dir: Option<PathBuf>,
    qemu_img: Option<PathBuf>,
    qemu_system: Option<PathBuf>,
    docker: Option<PathBuf>,
    launch_grace: Option<Duration>,
    display: Option<String>,
}

impl KilnConfigBuilder {
    /// Set the data directory.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Set the disks directory.
    pub fn disks_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.disks_dir = Some(dir.into());
        self
    }

    /// Set the VM configuration directory.
    pub fn vms_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.vms_dir = Some(dir.into());
        self
    }

    /// Set the installation media directory.
    pub fn isos_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.isos_dir = Some(dir.into());
        self
    }

    /// Set the launch log directory.
    pub fn logs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = Some(dir.into());
        self
    }

    /// Set the `qemu-img` binary.
    pub fn qemu_img(mut self, bin: impl Into<PathBuf>) -> Self {
        self.qemu_img = Some(bin.into());
        self
    }

    /// Set the VM launch binary.
    pub fn qemu_system(mut self, bin: impl Into<PathBuf>) -> Self {
        self.qemu_system = Some(bin.into());
        self
    }

    /// Set the container engine binary.
    pub fn docker(mut self, bin: impl Into<PathBuf>) -> Self {
        self.docker = Some(bin.into());
        self
    }

    /// Set the launch grace interval.
    pub fn launch_grace(mut self, grace: Duration) -> Self {
        self.launch_grace = Some(grace);
        self
    }

    /// Set the display backend.
    pub fn display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> KilnConfig {
        let data_dir = self
            .data_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        KilnConfig {
            disks_dir: self.disks_dir.unwrap_or_else(|| data_dir.join("disks")),
            vms_dir: self.vms_dir.unwrap_or_else(|| data_dir.join("vms")),
            isos_dir: self.isos_dir.unwrap_or_else(|| data_dir.join("isos")),
            logs_dir: self.logs_dir.unwrap_or_else(|| data_dir.join("logs")),
            qemu_img: self.qemu_img.unwrap_or_else(|| PathBuf::from("qemu-img")),
            qemu_system: self
                .qemu_system
                .unwrap_or_else(|| PathBuf::from("qemu-system-x86_64")),
            docker: self.docker.unwrap_or_else(|| PathBuf::from("docker")),
            launch_grace: self
                .launch_grace
                .unwrap_or(Duration::from_millis(DEFAULT_LAUNCH_GRACE_MS)),
            display: self.display.unwrap_or_else(|| "gtk".to_string()),
            data_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = KilnConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.disks_dir, PathBuf::from("data/disks"));
        assert_eq!(config.vms_dir, PathBuf::from("data/vms"));
        assert_eq!(config.logs_dir, PathBuf::from("data/logs"));
        assert_eq!(config.qemu_system, PathBuf::from("qemu-system-x86_64"));
        assert_eq!(config.launch_grace, Duration::from_secs(2));
        assert_eq!(config.display, "gtk");
        assert_eq!(
            config.disk_registry_path(),
            PathBuf::from("data/disk_registry.json")
        );
        assert_eq!(
            config.vm_registry_path(),
            PathBuf::from("data/vm_registry.json")
        );
    }

    #[test]
    fn test_from_lookup_derives_subdirectories() {
        let vars: HashMap<&str, &str> = [
            ("KILN_DATA_DIR", "/srv/kiln"),
            ("KILN_ISOS_DIR", "/media/isos"),
            ("KILN_LAUNCH_GRACE_MS", "50"),
            ("KILN_DISPLAY", "none"),
        ]
        .into_iter()
        .collect();
        let config = KilnConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.disks_dir, PathBuf::from("/srv/kiln/disks"));
        assert_eq!(config.isos_dir, PathBuf::from("/media/isos"));
        assert_eq!(config.launch_grace, Duration::from_millis(50));
        assert_eq!(config.display, "none");
        assert_eq!(config.qemu_img, PathBuf::from("qemu-img"));
    }

    #[test]
    fn test_from_lookup_ignores_bad_values() {
        let config = KilnConfig::from_lookup(|k| match k {
            "KILN_LAUNCH_GRACE_MS" => Some("soon".into()),
            "KILN_DATA_DIR" => Some(String::new()),
            _ => None,
        });
        assert_eq!(config, KilnConfig::default());
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = KilnConfig::builder().data_dir(dir.path().join("d")).build();
        config.ensure_directories().unwrap();
        assert!(config.disks_dir.is_dir());
        assert!(config.vms_dir.is_dir());
        assert!(config.isos_dir.is_dir());
        assert!(config.logs_dir.is_dir());
    }

    #[test]
    fn test_binary_available() {
        assert!(!binary_available(Path::new("/nonexistent/qemu-img")));
        assert!(!binary_available(Path::new("kiln-no-such-tool-xyz")));
    }
}
