//! Virtual disk registry and lifecycle.

use crate::disk_tool::{DiskTool, QemuImg};
use crate::error::{CoreError, EntityKind, Result};
use crate::probe::{Probe, QemuImgProbe};
use crate::registry::{file_created_at, Adopter, ReconcileReport, RegistryEntry, RegistryStore};
use crate::space::{required_with_margin, FreeSpace, HostFreeSpace};
use crate::validate::{parse_format, parse_size, validate_name};
use crate::config::KilnConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Disk image formats Kiln can create and manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vmdk,
    Vdi,
    Vhd,
}

impl DiskFormat {
    /// Every supported format, in the order shown to users.
    pub const ALL: [DiskFormat; 5] = [
        DiskFormat::Qcow2,
        DiskFormat::Raw,
        DiskFormat::Vmdk,
        DiskFormat::Vdi,
        DiskFormat::Vhd,
    ];

    /// User-facing name, also used as the file extension.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vdi => "vdi",
            DiskFormat::Vhd => "vhd",
        }
    }

    /// Driver name qemu uses for this format. VHD is `vpc` to qemu.
    pub fn qemu_driver(&self) -> &'static str {
        match self {
            DiskFormat::Vhd => "vpc",
            other => other.as_str(),
        }
    }

    /// Format for a driver name reported by `qemu-img info`.
    pub fn from_qemu_driver(driver: &str) -> Option<Self> {
        DiskFormat::ALL
            .into_iter()
            .find(|format| format.qemu_driver() == driver)
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no supported format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFormat;

impl FromStr for DiskFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        DiskFormat::ALL
            .into_iter()
            .find(|format| format.as_str() == s)
            .ok_or(UnknownFormat)
    }
}

/// Registry record for one disk image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskEntry {
    /// Backing image file.
    pub path: PathBuf,
    /// Format reported by the image tool.
    pub format: DiskFormat,
    /// Virtual size in bytes reported by the image tool.
    pub size_bytes: u64,
    /// When the image file was created.
    pub created_at: DateTime<Utc>,
}

impl RegistryEntry for DiskEntry {
    const KIND: EntityKind = EntityKind::Disk;

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Adopts orphaned disk images by probing them.
struct DiskAdopter<'a> {
    probe: &'a dyn Probe,
}

#[async_trait]
impl Adopter<DiskEntry> for DiskAdopter<'_> {
    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| ext == "img" || ext.parse::<DiskFormat>().is_ok())
    }

    async fn adopt(&self, name: &str, path: &Path, created_at: DateTime<Utc>) -> Option<DiskEntry> {
        match self.probe.probe(path).await {
            Ok(info) => Some(DiskEntry {
                path: path.to_path_buf(),
                format: info.format,
                size_bytes: info.size_bytes,
                created_at,
            }),
            Err(failure) => {
                tracing::warn!(disk = %name, error = %failure, "Could not get info for disk");
                None
            }
        }
    }
}

/// External collaborators used by a [`DiskManager`].
#[derive(Clone)]
pub struct DiskBackends {
    /// Creates image files.
    pub tool: Arc<dyn DiskTool>,
    /// Reports real image metadata.
    pub probe: Arc<dyn Probe>,
    /// Reports free space on the disks volume.
    pub space: Arc<dyn FreeSpace>,
}

impl DiskBackends {
    /// Backends driving the configured `qemu-img` and the host's disk table.
    pub fn qemu(config: &KilnConfig) -> Self {
        Self {
            tool: Arc::new(QemuImg::new(&config.qemu_img)),
            probe: Arc::new(QemuImgProbe::new(&config.qemu_img)),
            space: Arc::new(HostFreeSpace),
        }
    }
}

/// Owns the disk registry and every operation that changes it.
///
/// All operations hold the registry lock from validation through
/// persistence, so two concurrent creates of the same name cannot both
/// pass the uniqueness check.
pub struct DiskManager {
    disks_dir: PathBuf,
    registry: Mutex<RegistryStore<DiskEntry>>,
    backends: DiskBackends,
    opening: ReconcileReport,
}

impl DiskManager {
    /// Open the disk registry described by `config` with qemu backends.
    pub async fn open(config: &KilnConfig) -> Result<Self> {
        Self::open_with(
            &config.disks_dir,
            config.disk_registry_path(),
            DiskBackends::qemu(config),
        )
        .await
    }

    /// Open a registry over `disks_dir` persisted at `document`.
    ///
    /// Creates `disks_dir` if needed, loads the document and reconciles it
    /// against the directory once.
    pub async fn open_with(
        disks_dir: impl AsRef<Path>,
        document: impl Into<PathBuf>,
        backends: DiskBackends,
    ) -> Result<Self> {
        let disks_dir = disks_dir.as_ref();
        std::fs::create_dir_all(disks_dir)?;
        let disks_dir = std::fs::canonicalize(disks_dir)?;

        let mut manager = Self {
            registry: Mutex::new(RegistryStore::load(document)),
            disks_dir,
            backends,
            opening: ReconcileReport::default(),
        };
        manager.opening = manager.reconcile().await?;
        Ok(manager)
    }

    /// What the reconciliation run by `open` changed.
    pub fn opening_report(&self) -> &ReconcileReport {
        &self.opening
    }

    /// Directory holding managed disk images.
    pub fn disks_dir(&self) -> &Path {
        &self.disks_dir
    }

    /// Re-synchronise the registry with the disks directory.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let adopter = DiskAdopter {
            probe: self.backends.probe.as_ref(),
        };
        let mut registry = self.registry.lock().await;
        registry.reconcile(&self.disks_dir, &adopter).await
    }

    /// Create a new disk image and register it.
    pub async fn create(&self, name: &str, size: &str, format: &str) -> Result<DiskEntry> {
        validate_name(EntityKind::Disk, name)?;
        let format = parse_format(format)?;
        let size = parse_size(size)?;

        let mut registry = self.registry.lock().await;
        if registry.contains(name) {
            return Err(CoreError::AlreadyExists {
                kind: EntityKind::Disk,
                name: name.to_string(),
            });
        }

        let path = self.disks_dir.join(format!("{name}.{format}"));
        if path.exists() {
            return Err(CoreError::PathCollision {
                kind: EntityKind::Disk,
                name: name.to_string(),
                path,
            });
        }

        let required = required_with_margin(size.bytes());
        match self.backends.space.available_bytes(&self.disks_dir) {
            Some(available) if available < required => {
                return Err(CoreError::InsufficientSpace {
                    required,
                    available,
                });
            }
            Some(available) => {
                tracing::debug!(required, available, "Free space check passed");
            }
            None => {
                tracing::warn!(
                    dir = %self.disks_dir.display(),
                    "Could not determine free space, proceeding with disk creation"
                );
            }
        }

        self.backends
            .tool
            .create(&path, format, size)
            .await
            .map_err(|failure| {
                tracing::error!(disk = %name, error = %failure, "Failed to create disk");
                CoreError::CreationFailed {
                    kind: EntityKind::Disk,
                    reason: failure.0,
                }
            })?;

        // A probe failure here leaves the file behind unregistered; the next
        // reconcile adopts it.
        let info = self
            .backends
            .probe
            .probe(&path)
            .await
            .map_err(|failure| CoreError::ExternalTool {
                tool: "qemu-img info".to_string(),
                reason: failure.to_string(),
            })?;

        let entry = DiskEntry {
            path: path.clone(),
            format: info.format,
            size_bytes: info.size_bytes,
            created_at: file_created_at(&path),
        };
        registry.insert_and_save(name, entry.clone())?;

        tracing::info!(
            disk = %name,
            %size,
            %format,
            size_bytes = entry.size_bytes,
            "Successfully created disk"
        );
        Ok(entry)
    }

    /// Delete a disk image and its registry entry.
    ///
    /// A backing file that is already gone is not an error.
    pub async fn delete(&self, name: &str) -> Result<DiskEntry> {
        let mut registry = self.registry.lock().await;
        let path = registry
            .get(name)
            .map(|entry| entry.path.clone())
            .ok_or_else(|| CoreError::not_found(EntityKind::Disk, name))?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(disk = %name, path = %path.display(), "Disk file already missing");
            }
            Err(source) => {
                return Err(CoreError::DeleteFailed {
                    kind: EntityKind::Disk,
                    name: name.to_string(),
                    source,
                })
            }
        }

        let entry = registry
            .remove_and_save(name)?
            .ok_or_else(|| CoreError::not_found(EntityKind::Disk, name))?;
        tracing::info!(disk = %name, "Successfully deleted disk");
        Ok(entry)
    }

    /// Snapshot of every registered disk, in name order.
    pub async fn list(&self) -> Vec<(String, DiskEntry)> {
        let registry = self.registry.lock().await;
        registry
            .entries()
            .map(|(name, entry)| (name.to_string(), entry.clone()))
            .collect()
    }

    /// Look up one disk by name.
    pub async fn get(&self, name: &str) -> Option<DiskEntry> {
        self.registry.lock().await.get(name).cloned()
    }

    /// Backing path of the named disk.
    pub async fn path_of(&self, name: &str) -> Option<PathBuf> {
        self.registry
            .lock()
            .await
            .get(name)
            .map(|entry| entry.path.clone())
    }

    /// The registered disk backed by `path`, if any.
    pub async fn find_by_path(&self, path: &Path) -> Option<(String, DiskEntry)> {
        self.registry
            .lock()
            .await
            .find_by_path(path)
            .map(|(name, entry)| (name.to_string(), entry.clone()))
    }
}

impl fmt::Debug for DiskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskManager")
            .field("disks_dir", &self.disks_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_round_trip_names() {
        for format in DiskFormat::ALL {
            assert_eq!(format.as_str().parse::<DiskFormat>(), Ok(format));
        }
        assert!("QCOW2".parse::<DiskFormat>().is_err());
        assert!("iso".parse::<DiskFormat>().is_err());
    }

    #[test]
    fn test_format_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&DiskFormat::Qcow2).unwrap(),
            "\"qcow2\""
        );
        let parsed: DiskFormat = serde_json::from_str("\"vhd\"").unwrap();
        assert_eq!(parsed, DiskFormat::Vhd);
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = DiskEntry {
            path: PathBuf::from("/data/disks/alpha.qcow2"),
            format: DiskFormat::Qcow2,
            size_bytes: 10_737_418_240,
            created_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["format"], "qcow2");
        assert_eq!(json["size_bytes"], 10_737_418_240u64);
        assert_eq!(json["path"], "/data/disks/alpha.qcow2");
    }

    #[test]
    fn test_adopter_accepts_known_extensions() {
        struct NoProbe;
        #[async_trait]
        impl Probe for NoProbe {
            async fn probe(
                &self,
                _: &Path,
            ) -> std::result::Result<crate::probe::DiskInfo, crate::probe::ProbeFailure> {
                Err(crate::probe::ProbeFailure::Spawn("unused".into()))
            }
        }

        let adopter = DiskAdopter { probe: &NoProbe };
        assert!(adopter.accepts(Path::new("/d/a.qcow2")));
        assert!(adopter.accepts(Path::new("/d/a.img")));
        assert!(adopter.accepts(Path::new("/d/a.vhd")));
        assert!(!adopter.accepts(Path::new("/d/notes.txt")));
        assert!(!adopter.accepts(Path::new("/d/noext")));
    }

    #[test]
    fn test_vhd_uses_vpc_driver() {
        assert_eq!(DiskFormat::Vhd.qemu_driver(), "vpc");
        assert_eq!(DiskFormat::Qcow2.qemu_driver(), "qcow2");
        assert_eq!(DiskFormat::from_qemu_driver("vpc"), Some(DiskFormat::Vhd));
        assert_eq!(DiskFormat::from_qemu_driver("raw"), Some(DiskFormat::Raw));
        assert_eq!(DiskFormat::from_qemu_driver("vhd"), None);
    }
}
