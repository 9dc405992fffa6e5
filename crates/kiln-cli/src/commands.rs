//! Subcommand handlers.
//!
//! Each handler performs one library call and renders the result, either
//! as plain text on stdout or, with `--json`, as one JSON document.

use crate::cli::{Command, ContainerCommand, DiskCommand, ImageCommand, VmCommand};
use anyhow::Result;
use kiln_core::{DiskEntry, Inventory, KilnConfig, ReconcileReport, VmEntry};
use kiln_image::ContainerEngine;
use serde_json::{json, Value};
use std::io::Write;
use tracing::debug;

/// Shared state for one invocation.
pub struct App {
    config: KilnConfig,
    json: bool,
}

impl App {
    pub fn new(config: KilnConfig, json: bool) -> Self {
        Self { config, json }
    }

    pub async fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Disk(cmd) => self.disk(cmd).await,
            Command::Vm(cmd) => self.vm(cmd).await,
            Command::Image(cmd) => self.image(cmd).await,
            Command::Container(cmd) => self.container(cmd).await,
            Command::Reconcile => self.reconcile().await,
        }
    }

    async fn inventory(&self) -> Result<Inventory> {
        debug!(data_dir = %self.config.data_dir.display(), "Opening inventory");
        Ok(Inventory::open(&self.config).await?)
    }

    fn engine(&self) -> ContainerEngine {
        ContainerEngine::new(self.config.docker.clone())
    }

    /// Print `value` in JSON mode, otherwise each line of `text`.
    fn emit(&self, value: Value, text: impl FnOnce() -> Vec<String>) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        if self.json {
            writeln!(stdout, "{}", serde_json::to_string_pretty(&value)?)?;
        } else {
            for line in text() {
                writeln!(stdout, "{line}")?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Disks
    // ========================================================================

    async fn disk(&self, cmd: DiskCommand) -> Result<()> {
        let inventory = self.inventory().await?;
        match cmd {
            DiskCommand::Create(args) => {
                let entry = inventory
                    .disks()
                    .create(&args.name, &args.size, &args.format)
                    .await?;
                self.emit(disk_json(&args.name, &entry), || {
                    vec![format!("Successfully created disk {}", args.name)]
                })
            }
            DiskCommand::Delete { name } => {
                inventory.delete_disk(&name).await?;
                self.emit(json!({ "deleted": name }), || {
                    vec![format!("Successfully deleted disk {name}")]
                })
            }
            DiskCommand::List => {
                let disks = inventory.disks().list().await;
                let value = Value::Array(disks.iter().map(|(n, e)| disk_json(n, e)).collect());
                self.emit(value, || {
                    if disks.is_empty() {
                        return vec!["No disks registered".to_string()];
                    }
                    disks
                        .iter()
                        .map(|(name, entry)| {
                            format!(
                                "{name:<20} {:<6} {:>10}  {}",
                                entry.format,
                                human_size(entry.size_bytes),
                                entry.path.display()
                            )
                        })
                        .collect()
                })
            }
        }
    }

    // ========================================================================
    // VMs
    // ========================================================================

    async fn vm(&self, cmd: VmCommand) -> Result<()> {
        let inventory = self.inventory().await?;
        let vms = inventory.vms();
        match cmd {
            VmCommand::Create(args) => {
                let entry = vms
                    .create(
                        &args.name,
                        args.memory,
                        args.cpus,
                        &args.disk,
                        args.iso.as_deref(),
                    )
                    .await?;
                self.emit(vm_json(&args.name, &entry), || {
                    vec![format!("Successfully created VM {}", args.name)]
                })
            }
            VmCommand::Delete { name } => {
                vms.delete(&name).await?;
                self.emit(json!({ "deleted": name }), || {
                    vec![format!("Successfully deleted VM {name}")]
                })
            }
            VmCommand::Start { name } => {
                let handle = vms.start(&name).await?;
                self.emit(json!({ "started": name, "pid": handle.pid }), || {
                    vec![format!("Successfully started VM {name}")]
                })
            }
            VmCommand::List => {
                let entries = vms.list().await;
                let value = Value::Array(entries.iter().map(|(n, e)| vm_json(n, e)).collect());
                self.emit(value, || {
                    if entries.is_empty() {
                        return vec!["No VMs registered".to_string()];
                    }
                    entries
                        .iter()
                        .map(|(name, entry)| {
                            let boot = if entry.first_boot_pending {
                                " (first boot pending)"
                            } else {
                                ""
                            };
                            format!(
                                "{name:<20} {:>6} MB {:>3} cpu  disk {}{boot}",
                                entry.memory_mb, entry.cpu_count, entry.disk.name
                            )
                        })
                        .collect()
                })
            }
            VmCommand::Isos => {
                let isos = vms.list_isos().await;
                let value = json!(isos);
                self.emit(value, || {
                    isos.iter().map(|p| p.display().to_string()).collect()
                })
            }
        }
    }

    // ========================================================================
    // Images and containers
    // ========================================================================

    async fn image(&self, cmd: ImageCommand) -> Result<()> {
        let engine = self.engine();
        engine.check_installed().await?;
        match cmd {
            ImageCommand::List => {
                let images = engine.list_images().await?;
                self.emit(json!(images), || {
                    images
                        .iter()
                        .map(|i| {
                            format!(
                                "{:<40} {:<14} {:>10}  {}",
                                i.name_tag, i.id, i.size, i.created_at
                            )
                        })
                        .collect()
                })
            }
            ImageCommand::Search { term } => {
                let images = engine.search_local(&term).await?;
                self.emit(json!(images), || {
                    images
                        .iter()
                        .map(|i| format!("{:<40} {:<14} {:>10}", i.name_tag, i.id, i.size))
                        .collect()
                })
            }
            ImageCommand::Hub { term } => {
                let results = engine.search_hub(&term).await?;
                self.emit(json!(results), || {
                    results
                        .iter()
                        .map(|r| {
                            let official = if r.official { " [official]" } else { "" };
                            format!("{:<40} {:>7}{official}  {}", r.name, r.stars, r.description)
                        })
                        .collect()
                })
            }
            ImageCommand::Pull { image } => {
                engine
                    .pull(&image, |pct| {
                        let mut stderr = std::io::stderr().lock();
                        let _ = write!(stderr, "\rPulling {image}: {pct:>3}%");
                        let _ = stderr.flush();
                    })
                    .await
                    .inspect_err(|_| eprintln!())?;
                eprintln!();
                self.emit(json!({ "pulled": image }), || {
                    vec![format!("Successfully pulled image {image}")]
                })
            }
        }
    }

    async fn container(&self, cmd: ContainerCommand) -> Result<()> {
        let engine = self.engine();
        match cmd {
            ContainerCommand::List => {
                let containers = engine.list_containers().await?;
                self.emit(json!(containers), || {
                    containers
                        .iter()
                        .map(|c| {
                            format!(
                                "{:<14} {:<20} {:<30} {:<24} {}",
                                c.id, c.name, c.image, c.status, c.ports
                            )
                        })
                        .collect()
                })
            }
        }
    }

    async fn reconcile(&self) -> Result<()> {
        let inventory = self.inventory().await?;
        let (disks, vms) = reconcile_reports(&inventory).await?;
        let value = json!({ "disks": report_json(&disks), "vms": report_json(&vms) });
        self.emit(value, || {
            vec![report_line("disks", &disks), report_line("vms", &vms)]
        })
    }
}

/// Opening already reconciled, so report that pass folded with a fresh one.
async fn reconcile_reports(
    inventory: &Inventory,
) -> Result<(ReconcileReport, ReconcileReport)> {
    let (opened_disks, opened_vms) = inventory.opening_reports();
    let (mut disks, mut vms) = (opened_disks.clone(), opened_vms.clone());
    let (later_disks, later_vms) = inventory.reconcile().await?;
    disks.absorb(later_disks);
    vms.absorb(later_vms);
    Ok((disks, vms))
}

// ============================================================================
// Rendering
// ============================================================================

fn disk_json(name: &str, entry: &DiskEntry) -> Value {
    json!({
        "name": name,
        "path": entry.path,
        "format": entry.format,
        "size_bytes": entry.size_bytes,
        "created_at": entry.created_at,
    })
}

fn vm_json(name: &str, entry: &VmEntry) -> Value {
    json!({
        "name": name,
        "path": entry.path,
        "memory_mb": entry.memory_mb,
        "cpu_count": entry.cpu_count,
        "disk": entry.disk.name,
        "disk_path": entry.disk.path,
        "iso_path": entry.iso_path,
        "first_boot_pending": entry.first_boot_pending,
        "created_at": entry.created_at,
    })
}

fn report_json(report: &ReconcileReport) -> Value {
    json!({
        "pruned": report.pruned,
        "adopted": report.adopted,
        "skipped": report.skipped,
    })
}

fn report_line(label: &str, report: &ReconcileReport) -> String {
    format!(
        "{label}: {} pruned, {} adopted, {} skipped",
        report.pruned.len(),
        report.adopted.len(),
        report.skipped.len()
    )
}

/// Binary-unit size with one decimal, e.g. `10.0 GiB`.
fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(1536), "1.5 KiB");
        assert_eq!(human_size(10_737_418_240), "10.0 GiB");
        assert_eq!(human_size(3 * 1024u64.pow(4)), "3.0 TiB");
    }

    #[tokio::test]
    async fn test_reconcile_reports_include_opening_pass() {
        let dir = tempfile::tempdir().unwrap();
        let config = KilnConfig::builder()
            .data_dir(dir.path().join("data"))
            .build();
        config.ensure_directories().unwrap();
        let stale = json!({
            "gone": {
                "path": config.disks_dir.join("gone.qcow2"),
                "format": "qcow2",
                "size_bytes": 1073741824u64,
                "created_at": "2024-01-01T00:00:00Z"
            }
        });
        std::fs::write(config.disk_registry_path(), stale.to_string()).unwrap();

        let inventory = Inventory::open(&config).await.unwrap();
        let (disks, vms) = reconcile_reports(&inventory).await.unwrap();
        assert_eq!(disks.pruned, vec!["gone".to_string()]);
        assert!(disks.adopted.is_empty());
        assert!(!vms.changed());
        assert!(inventory.disks().get("gone").await.is_none());
    }

    #[test]
    fn test_report_line() {
        let report = ReconcileReport {
            pruned: vec!["gone".into()],
            adopted: vec!["a".into(), "b".into()],
            skipped: Vec::new(),
        };
        assert_eq!(
            report_line("disks", &report),
            "disks: 1 pruned, 2 adopted, 0 skipped"
        );
    }
}
