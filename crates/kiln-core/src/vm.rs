//! Virtual machine registry and lifecycle.
//!
//! A VM's backing resource is its JSON configuration document in the VMs
//! directory. The document is what survives outside the registry: it is
//! written on create, adopted on reconcile when the registry has lost track
//! of it, and updated when the first boot from installation media completes.
//! Deleting a VM removes the document and never touches the disk.

use crate::config::KilnConfig;
use crate::disk::{DiskFormat, DiskManager};
use crate::error::{CoreError, EntityKind, Result};
use crate::launcher::{LaunchHandle, LaunchSpec, Launcher, QemuLauncher};
use crate::registry::{file_created_at, same_file, Adopter, ReconcileReport, RegistryEntry, RegistryStore};
use crate::validate::{validate_cpus, validate_iso, validate_memory, validate_name};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Memory assumed for adopted documents that do not specify it.
pub const DEFAULT_MEMORY_MB: u32 = 512;

/// CPU count assumed for adopted documents that do not specify it.
pub const DEFAULT_CPUS: u32 = 1;

// ============================================================================
// Registry entry
// ============================================================================

/// Non-owning reference from a VM to the disk it boots from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRef {
    /// Registry name of the disk at VM creation time.
    pub name: String,
    /// Backing path of the disk at VM creation time.
    pub path: PathBuf,
}

/// Registry record for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmEntry {
    /// The VM's configuration document.
    pub path: PathBuf,
    /// Memory in MB.
    pub memory_mb: u32,
    /// Virtual CPU count.
    pub cpu_count: u32,
    /// Disk the VM boots from.
    pub disk: DiskRef,
    /// Installation medium given at creation.
    pub iso_path: Option<PathBuf>,
    /// Whether the next start should boot from the installation medium.
    pub first_boot_pending: bool,
    /// When the configuration document was created.
    pub created_at: DateTime<Utc>,
}

impl RegistryEntry for VmEntry {
    const KIND: EntityKind = EntityKind::Vm;

    fn path(&self) -> &Path {
        &self.path
    }
}

// ============================================================================
// Configuration document
// ============================================================================

/// On-disk VM configuration, one JSON file per VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDocument {
    /// VM name as given at creation.
    #[serde(default)]
    pub name: String,
    /// Memory in MB.
    #[serde(default = "default_memory")]
    pub memory: u32,
    /// Virtual CPU count.
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    /// Backing disk path.
    #[serde(default)]
    pub disk: PathBuf,
    /// Registry name of the backing disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_name: Option<String>,
    /// Installation medium; an empty string means none.
    #[serde(
        default,
        deserialize_with = "empty_path_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub iso: Option<PathBuf>,
    /// Whether the installation medium is still to be booted.
    #[serde(default)]
    pub first_boot: bool,
}

fn default_memory() -> u32 {
    DEFAULT_MEMORY_MB
}

fn default_cpus() -> u32 {
    DEFAULT_CPUS
}

fn empty_path_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(PathBuf::from))
}

impl VmDocument {
    /// Read and parse the document at `path`.
    pub async fn read(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the document to `path` through a temporary sibling file.
    pub async fn write(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut tmp = path.to_path_buf().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await
    }
}

/// Adopts orphaned VM configuration documents.
struct VmAdopter<'a> {
    disks: &'a DiskManager,
}

#[async_trait]
impl Adopter<VmEntry> for VmAdopter<'_> {
    fn accepts(&self, path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "json")
    }

    async fn adopt(&self, name: &str, path: &Path, created_at: DateTime<Utc>) -> Option<VmEntry> {
        let doc = match VmDocument::read(path).await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(vm = %name, error = %e, "Could not load VM config, skipping");
                return None;
            }
        };

        if let Err(e) = validate_memory(i64::from(doc.memory))
            .and_then(|_| validate_cpus(i64::from(doc.cpus)))
        {
            tracing::warn!(vm = %name, error = %e, "VM config out of range, skipping");
            return None;
        }

        let disk_name = match &doc.disk_name {
            Some(disk_name) => disk_name.clone(),
            None => match self.disks.find_by_path(&doc.disk).await {
                Some((disk_name, _)) => disk_name,
                None => doc
                    .disk
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            },
        };

        Some(VmEntry {
            path: path.to_path_buf(),
            memory_mb: doc.memory,
            cpu_count: doc.cpus,
            disk: DiskRef {
                name: disk_name,
                path: doc.disk,
            },
            first_boot_pending: doc.first_boot && doc.iso.is_some(),
            iso_path: doc.iso,
            created_at,
        })
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Filesystem layout and launch settings for a [`VmManager`].
#[derive(Debug, Clone)]
pub struct VmLayout {
    /// Directory holding VM configuration documents.
    pub vms_dir: PathBuf,
    /// Directory listed by [`VmManager::list_isos`].
    pub isos_dir: PathBuf,
    /// Directory receiving launch logs.
    pub logs_dir: PathBuf,
    /// Persisted VM registry.
    pub document: PathBuf,
    /// Display backend for launched VMs.
    pub display: String,
}

impl VmLayout {
    /// Layout described by `config`.
    pub fn from_config(config: &KilnConfig) -> Self {
        Self {
            vms_dir: config.vms_dir.clone(),
            isos_dir: config.isos_dir.clone(),
            logs_dir: config.logs_dir.clone(),
            document: config.vm_registry_path(),
            display: config.display.clone(),
        }
    }
}

/// Owns the VM registry and every operation that changes it.
///
/// Lock order is VM registry, then disk registry. The disk manager never
/// takes the VM lock.
pub struct VmManager {
    layout: VmLayout,
    registry: Mutex<RegistryStore<VmEntry>>,
    disks: Arc<DiskManager>,
    launcher: Arc<dyn Launcher>,
    opening: ReconcileReport,
}

impl VmManager {
    /// Open the VM registry described by `config`, launching with qemu.
    pub async fn open(config: &KilnConfig, disks: Arc<DiskManager>) -> Result<Self> {
        let launcher = QemuLauncher::new(&config.qemu_system).with_grace(config.launch_grace);
        Self::open_with(VmLayout::from_config(config), disks, Arc::new(launcher)).await
    }

    /// Open a registry with an explicit layout and launcher.
    pub async fn open_with(
        mut layout: VmLayout,
        disks: Arc<DiskManager>,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self> {
        for dir in [&layout.vms_dir, &layout.isos_dir, &layout.logs_dir] {
            std::fs::create_dir_all(dir)?;
        }
        layout.vms_dir = std::fs::canonicalize(&layout.vms_dir)?;

        let mut manager = Self {
            registry: Mutex::new(RegistryStore::load(&layout.document)),
            layout,
            disks,
            launcher,
            opening: ReconcileReport::default(),
        };
        manager.opening = manager.reconcile().await?;
        Ok(manager)
    }

    /// What the reconciliation run by `open` changed.
    pub fn opening_report(&self) -> &ReconcileReport {
        &self.opening
    }

    /// The disk manager VMs resolve their disks against.
    pub fn disks(&self) -> &Arc<DiskManager> {
        &self.disks
    }

    /// Re-synchronise the registry with the VMs directory.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let adopter = VmAdopter {
            disks: self.disks.as_ref(),
        };
        let mut registry = self.registry.lock().await;
        registry.reconcile(&self.layout.vms_dir, &adopter).await
    }

    /// Create a VM configuration and register it.
    pub async fn create(
        &self,
        name: &str,
        memory_mb: i64,
        cpus: i64,
        disk_name: &str,
        iso: Option<&Path>,
    ) -> Result<VmEntry> {
        validate_name(EntityKind::Vm, name)?;
        let memory_mb = validate_memory(memory_mb)?;
        let cpu_count = validate_cpus(cpus)?;

        let mut registry = self.registry.lock().await;
        if registry.contains(name) {
            return Err(CoreError::AlreadyExists {
                kind: EntityKind::Vm,
                name: name.to_string(),
            });
        }

        if disk_name.is_empty() {
            return Err(CoreError::InvalidName("Disk name cannot be empty".to_string()));
        }
        let disk_path = self
            .disks
            .path_of(disk_name)
            .await
            .ok_or_else(|| CoreError::not_found(EntityKind::Disk, disk_name))?;

        if let Some(iso) = iso {
            validate_iso(iso)?;
        }

        let path = self.layout.vms_dir.join(format!("{name}.json"));
        if path.exists() {
            return Err(CoreError::PathCollision {
                kind: EntityKind::Vm,
                name: name.to_string(),
                path,
            });
        }

        let document = VmDocument {
            name: name.to_string(),
            memory: memory_mb,
            cpus: cpu_count,
            disk: disk_path.clone(),
            disk_name: Some(disk_name.to_string()),
            iso: iso.map(Path::to_path_buf),
            first_boot: iso.is_some(),
        };
        document
            .write(&path)
            .await
            .map_err(|e| CoreError::CreationFailed {
                kind: EntityKind::Vm,
                reason: e.to_string(),
            })?;

        // Register what actually landed on disk.
        let written = VmDocument::read(&path)
            .await
            .map_err(|e| CoreError::CreationFailed {
                kind: EntityKind::Vm,
                reason: e.to_string(),
            })?;

        let entry = VmEntry {
            path: path.clone(),
            memory_mb: written.memory,
            cpu_count: written.cpus,
            disk: DiskRef {
                name: disk_name.to_string(),
                path: written.disk,
            },
            first_boot_pending: written.first_boot && written.iso.is_some(),
            iso_path: written.iso,
            created_at: file_created_at(&path),
        };
        registry.insert_and_save(name, entry.clone())?;

        tracing::info!(vm = %name, disk = %disk_name, memory_mb, cpu_count, "Successfully created VM");
        Ok(entry)
    }

    /// Delete a VM's configuration and registry entry. The disk is kept.
    pub async fn delete(&self, name: &str) -> Result<VmEntry> {
        let mut registry = self.registry.lock().await;
        let path = registry
            .get(name)
            .map(|entry| entry.path.clone())
            .ok_or_else(|| CoreError::not_found(EntityKind::Vm, name))?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(vm = %name, path = %path.display(), "VM config already missing");
            }
            Err(source) => {
                return Err(CoreError::DeleteFailed {
                    kind: EntityKind::Vm,
                    name: name.to_string(),
                    source,
                })
            }
        }

        let entry = registry
            .remove_and_save(name)?
            .ok_or_else(|| CoreError::not_found(EntityKind::Vm, name))?;
        tracing::info!(vm = %name, "Successfully deleted VM");
        Ok(entry)
    }

    /// Launch a registered VM.
    ///
    /// The installation medium is attached only while the first boot is
    /// pending; after a successful launch with it attached the flag is
    /// cleared in both the document and the registry.
    pub async fn start(&self, name: &str) -> Result<LaunchHandle> {
        let mut registry = self.registry.lock().await;
        let entry = registry
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::not_found(EntityKind::Vm, name))?;

        if !entry.disk.path.exists() {
            return Err(CoreError::not_found(
                EntityKind::Disk,
                entry.disk.path.display().to_string(),
            ));
        }

        let format = self
            .disks
            .find_by_path(&entry.disk.path)
            .await
            .map(|(_, disk)| disk.format)
            .unwrap_or(DiskFormat::Raw);
        tracing::info!(vm = %name, disk = %entry.disk.path.display(), %format, "Using disk");

        let mut builder = LaunchSpec::builder(name)
            .memory_mb(entry.memory_mb)
            .cpus(entry.cpu_count)
            .disk(&entry.disk.path, format)
            .display(&self.layout.display)
            .log_path(self.layout.logs_dir.join(format!("{name}.log")));

        let boot_iso = match (&entry.iso_path, entry.first_boot_pending) {
            (Some(iso), true) => {
                if !iso.exists() {
                    return Err(CoreError::not_found(
                        EntityKind::Iso,
                        iso.display().to_string(),
                    ));
                }
                builder = builder.boot_medium(iso);
                true
            }
            _ => false,
        };

        let handle = self
            .launcher
            .launch(&builder.build())
            .await
            .map_err(|failure| CoreError::LaunchFailed(failure.0))?;

        if boot_iso {
            self.complete_first_boot(&mut registry, name, &entry).await?;
        }

        tracing::info!(vm = %name, pid = ?handle.pid, "Successfully started VM");
        Ok(handle)
    }

    async fn complete_first_boot(
        &self,
        registry: &mut RegistryStore<VmEntry>,
        name: &str,
        entry: &VmEntry,
    ) -> Result<()> {
        let mut document = match VmDocument::read(&entry.path).await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(vm = %name, error = %e, "VM config unreadable, rewriting from registry");
                VmDocument {
                    name: name.to_string(),
                    memory: entry.memory_mb,
                    cpus: entry.cpu_count,
                    disk: entry.disk.path.clone(),
                    disk_name: Some(entry.disk.name.clone()),
                    iso: entry.iso_path.clone(),
                    first_boot: true,
                }
            }
        };
        document.first_boot = false;
        document
            .write(&entry.path)
            .await
            .map_err(|source| CoreError::Persistence {
                path: entry.path.clone(),
                source,
            })?;

        let mut stored = registry.get(name).cloned().unwrap_or_else(|| entry.clone());
        stored.first_boot_pending = false;
        registry.insert_and_save(name, stored)?;
        tracing::debug!(vm = %name, "First boot from installation media recorded");
        Ok(())
    }

    /// Snapshot of every registered VM, in name order.
    pub async fn list(&self) -> Vec<(String, VmEntry)> {
        let registry = self.registry.lock().await;
        registry
            .entries()
            .map(|(name, entry)| (name.to_string(), entry.clone()))
            .collect()
    }

    /// Look up one VM by name.
    pub async fn get(&self, name: &str) -> Option<VmEntry> {
        self.registry.lock().await.get(name).cloned()
    }

    /// Installation media available in the ISOs directory, sorted.
    pub async fn list_isos(&self) -> Vec<PathBuf> {
        let mut isos = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(&self.layout.isos_dir).await else {
            return isos;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            let is_iso = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("iso"));
            if is_iso && path.is_file() {
                isos.push(path);
            }
        }
        isos.sort();
        isos
    }

    /// Hold the VM registry lock, e.g. while deleting a disk it may reference.
    pub(crate) async fn lock_registry(&self) -> MutexGuard<'_, RegistryStore<VmEntry>> {
        self.registry.lock().await
    }
}

/// First VM (by name) whose disk reference matches the given disk.
pub(crate) fn vm_referencing(
    registry: &RegistryStore<VmEntry>,
    disk_name: &str,
    disk_path: &Path,
) -> Option<String> {
    registry
        .entries()
        .find(|(_, vm)| vm.disk.name == disk_name || same_file(&vm.disk.path, disk_path))
        .map(|(name, _)| name.to_string())
}

impl fmt::Debug for VmManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmManager")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}
