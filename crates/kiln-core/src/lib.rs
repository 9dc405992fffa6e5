//! # kiln-core
//!
//! Registries for virtual disks and virtual machines, kept consistent with
//! the filesystem and with the qemu tooling that actually owns the images.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                         Inventory                          │
//! │            delete_disk() refuses disks in use              │
//! ├─────────────────────────────┬──────────────────────────────┤
//! │        DiskManager          │          VmManager           │
//! │  create / delete / list     │  create / delete / start     │
//! │            │                │        │          │          │
//! │            ▼                │        ▼          ▼          │
//! │  RegistryStore<DiskEntry>   │ RegistryStore  Launcher      │
//! │  DiskTool, Probe, FreeSpace │  <VmEntry>    (qemu-system)  │
//! │  (qemu-img, sysinfo)        │                              │
//! └─────────────────────────────┴──────────────────────────────┘
//!            │                              │
//!            ▼                              ▼
//!   data/disk_registry.json        data/vm_registry.json
//!   data/disks/*.{qcow2,raw,..}    data/vms/*.json
//! ```
//!
//! Each registry is reconciled once when its manager opens: entries whose
//! file vanished are pruned, and orphaned files are adopted after asking
//! the image tool (or parsing the VM document) what they are.
//!
//! ## Quick Start
//!
//! ```ignore
//! use kiln_core::{Inventory, KilnConfig};
//!
//! # async fn example() -> kiln_core::Result<()> {
//! let config = KilnConfig::from_env();
//! let inventory = Inventory::open(&config).await?;
//!
//! inventory.disks().create("alpha", "10G", "qcow2").await?;
//! inventory.vms().create("vm1", 1024, 2, "alpha", None).await?;
//! inventory.vms().start("vm1").await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod disk;
mod disk_tool;
mod error;
mod inventory;
mod launcher;
mod probe;
mod registry;
mod space;
mod tool;
mod validate;
mod vm;

pub use config::{KilnConfig, KilnConfigBuilder, DEFAULT_DATA_DIR, DEFAULT_LAUNCH_GRACE_MS};
pub use disk::{DiskBackends, DiskEntry, DiskFormat, DiskManager, UnknownFormat};
pub use disk_tool::{CreateFailure, DiskTool, QemuImg};
pub use error::{CoreError, EntityKind, ErrorKind, Result};
pub use inventory::Inventory;
pub use launcher::{
    LaunchFailure, LaunchHandle, LaunchSpec, LaunchSpecBuilder, Launcher, QemuLauncher,
    DEFAULT_LAUNCH_GRACE,
};
pub use probe::{parse_info, DiskInfo, Probe, ProbeFailure, QemuImgProbe};
pub use registry::{Adopter, ReconcileReport, RegistryEntry, RegistryStore};
pub use space::{required_with_margin, FreeSpace, HostFreeSpace};
pub use tool::{run_tool, ToolOutput};
pub use validate::{
    has_iso_extension, parse_format, parse_size, validate_cpus, validate_iso, validate_memory,
    validate_name, DiskSize, SizeUnit, ISO_EXTENSIONS, MAX_CPUS, MAX_MEMORY_MB, MIN_MEMORY_MB,
};
pub use vm::{DiskRef, VmDocument, VmEntry, VmLayout, VmManager, DEFAULT_CPUS, DEFAULT_MEMORY_MB};
