//! Free-space lookup for the volume holding managed disks.

use std::fs;
use std::path::Path;
use sysinfo::Disks;

/// Reports how many bytes are available on the volume containing a path.
pub trait FreeSpace: Send + Sync {
    /// Available bytes, or `None` when the volume cannot be identified.
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

/// [`FreeSpace`] backed by the host's mounted-disk table.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFreeSpace;

impl FreeSpace for HostFreeSpace {
    fn available_bytes(&self, path: &Path) -> Option<u64> {
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();

        // Longest mount point that prefixes the path wins.
        disks
            .iter()
            .filter(|disk| canonical.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().components().count())
            .map(|disk| disk.available_space())
    }
}

/// Bytes required for a disk of `requested` bytes including the 10% margin.
pub fn required_with_margin(requested: u64) -> u64 {
    requested.saturating_add(requested / 10)
}
