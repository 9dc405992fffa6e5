//! Command-line arguments.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Manage qemu disks and VMs, and docker images, from one place.
#[derive(Debug, Parser)]
#[command(name = "kiln", version, about)]
pub struct Cli {
    /// Print results as JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Virtual disk images.
    #[command(subcommand)]
    Disk(DiskCommand),

    /// Virtual machines.
    #[command(subcommand)]
    Vm(VmCommand),

    /// Container images.
    #[command(subcommand)]
    Image(ImageCommand),

    /// Containers.
    #[command(subcommand)]
    Container(ContainerCommand),

    /// Re-synchronise both registries with the data directory.
    Reconcile,
}

// ============================================================================
// Disks
// ============================================================================

#[derive(Debug, Subcommand)]
pub enum DiskCommand {
    /// Create a disk image.
    Create(CreateDiskArgs),

    /// Delete a disk image that no VM uses.
    Delete {
        /// Disk name.
        name: String,
    },

    /// List registered disks.
    List,
}

#[derive(Debug, Args)]
pub struct CreateDiskArgs {
    /// Disk name (letters, digits, `_`, `-`, `.`).
    pub name: String,

    /// Size with unit suffix, e.g. 10G, 500M, 2T.
    #[arg(short, long)]
    pub size: String,

    /// Image format: qcow2, raw, vmdk, vdi or vhd.
    #[arg(short, long, default_value = "qcow2")]
    pub format: String,
}

// ============================================================================
// VMs
// ============================================================================

#[derive(Debug, Subcommand)]
pub enum VmCommand {
    /// Create a VM configuration.
    Create(CreateVmArgs),

    /// Delete a VM configuration. Its disk is kept.
    Delete {
        /// VM name.
        name: String,
    },

    /// Launch a VM.
    Start {
        /// VM name.
        name: String,
    },

    /// List registered VMs.
    List,

    /// List installation media in the ISOs directory.
    Isos,
}

#[derive(Debug, Args)]
pub struct CreateVmArgs {
    /// VM name (letters, digits, `_`, `-`, `.`).
    pub name: String,

    /// Memory in MB.
    #[arg(short, long, default_value_t = 1024, allow_negative_numbers = true)]
    pub memory: i64,

    /// Virtual CPU count.
    #[arg(short, long, default_value_t = 1, allow_negative_numbers = true)]
    pub cpus: i64,

    /// Name of a registered disk to boot from.
    #[arg(short, long)]
    pub disk: String,

    /// Installation medium attached for the first boot.
    #[arg(short, long)]
    pub iso: Option<PathBuf>,
}

// ============================================================================
// Images and containers
// ============================================================================

#[derive(Debug, Subcommand)]
pub enum ImageCommand {
    /// List local images.
    List,

    /// Search local images by name or tag.
    Search {
        /// Case-insensitive substring of `name:tag`.
        term: String,
    },

    /// Search the public registry.
    Hub {
        /// Search term.
        term: String,
    },

    /// Pull an image, showing progress.
    Pull {
        /// Image reference, e.g. nginx:latest.
        image: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ContainerCommand {
    /// List all containers.
    List,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_disk_create() {
        let cli = Cli::try_parse_from(["kiln", "disk", "create", "alpha", "-s", "10G"]).unwrap();
        match cli.command {
            Command::Disk(DiskCommand::Create(args)) => {
                assert_eq!(args.name, "alpha");
                assert_eq!(args.size, "10G");
                assert_eq!(args.format, "qcow2");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_vm_create_keeps_out_of_range_values() {
        let cli = Cli::try_parse_from([
            "kiln", "--json", "vm", "create", "vm1", "--memory", "100", "--cpus", "-1", "--disk",
            "alpha",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Command::Vm(VmCommand::Create(args)) => {
                assert_eq!(args.memory, 100);
                assert_eq!(args.cpus, -1);
                assert!(args.iso.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
