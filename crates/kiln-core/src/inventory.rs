//! Single entry point owning both managers.
//!
//! Operations that span disks and VMs live here, so the rule that a disk
//! cannot be deleted while a VM boots from it is enforced in one place.

use crate::config::KilnConfig;
use crate::disk::{DiskBackends, DiskEntry, DiskManager};
use crate::error::{CoreError, EntityKind, Result};
use crate::launcher::Launcher;
use crate::registry::ReconcileReport;
use crate::vm::{vm_referencing, VmLayout, VmManager};
use std::sync::Arc;

/// Disk and VM managers opened over the same data directory.
#[derive(Debug)]
pub struct Inventory {
    disks: Arc<DiskManager>,
    vms: VmManager,
}

impl Inventory {
    /// Open both registries described by `config`, reconciling each once.
    pub async fn open(config: &KilnConfig) -> Result<Self> {
        config.ensure_directories()?;
        let disks = Arc::new(DiskManager::open(config).await?);
        let vms = VmManager::open(config, Arc::clone(&disks)).await?;
        tracing::info!(
            data_dir = %config.data_dir.display(),
            "Inventory opened"
        );
        Ok(Self { disks, vms })
    }

    /// Open with explicit backends, e.g. fakes in tests.
    pub async fn open_with(
        config: &KilnConfig,
        backends: DiskBackends,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self> {
        config.ensure_directories()?;
        let disks = Arc::new(
            DiskManager::open_with(&config.disks_dir, config.disk_registry_path(), backends)
                .await?,
        );
        let vms =
            VmManager::open_with(VmLayout::from_config(config), Arc::clone(&disks), launcher)
                .await?;
        Ok(Self { disks, vms })
    }

    /// The disk manager.
    pub fn disks(&self) -> &DiskManager {
        &self.disks
    }

    /// The VM manager.
    pub fn vms(&self) -> &VmManager {
        &self.vms
    }

    /// Delete a disk unless a registered VM still references it.
    pub async fn delete_disk(&self, name: &str) -> Result<DiskEntry> {
        // Held across the delete so no VM can start referencing the disk
        // between the check and the removal.
        let vms = self.vms.lock_registry().await;

        let path = self
            .disks
            .path_of(name)
            .await
            .ok_or_else(|| CoreError::not_found(EntityKind::Disk, name))?;
        if let Some(vm) = vm_referencing(&vms, name, &path) {
            tracing::warn!(disk = %name, vm = %vm, "Refusing to delete disk attached to VM");
            return Err(CoreError::DiskInUse {
                disk: name.to_string(),
                vm,
            });
        }

        self.disks.delete(name).await
    }

    /// What the reconciliation passes run while opening changed, disks
    /// then VMs.
    pub fn opening_reports(&self) -> (&ReconcileReport, &ReconcileReport) {
        (self.disks.opening_report(), self.vms.opening_report())
    }

    /// Reconcile disks first, then VMs (which resolve disk names).
    pub async fn reconcile(&self) -> Result<(ReconcileReport, ReconcileReport)> {
        let disks = self.disks.reconcile().await?;
        let vms = self.vms.reconcile().await?;
        Ok((disks, vms))
    }
}
