//! Error types for kiln-core.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kiln-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// The kind of resource an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// A virtual disk image.
    Disk,
    /// A virtual machine configuration.
    Vm,
    /// An installation medium.
    Iso,
}

impl EntityKind {
    /// Lowercase noun used inside sentences ("Failed to create disk").
    pub fn noun(&self) -> &'static str {
        match self {
            EntityKind::Disk => "disk",
            EntityKind::Vm => "VM",
            EntityKind::Iso => "ISO file",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Disk => write!(f, "Disk"),
            EntityKind::Vm => write!(f, "VM"),
            EntityKind::Iso => write!(f, "ISO file"),
        }
    }
}

/// Coarse classification of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Syntax or range problem in caller-supplied parameters.
    InvalidInput,
    /// The request clashes with existing state.
    Conflict,
    /// An entity, referenced disk or ISO does not exist.
    NotFound,
    /// Not enough host resources to satisfy the request.
    ResourceExhausted,
    /// An external tool exited non-zero or produced unusable output.
    ExternalToolFailure,
    /// Durable state could not be written.
    PersistenceFailure,
}

/// Errors that can occur during registry and lifecycle operations.
///
/// The `Display` output of every variant is the human-readable message shown
/// to the caller.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Name is empty or contains forbidden characters.
    #[error("{0}")]
    InvalidName(String),

    /// Disk format is not one of the supported formats.
    #[error("Invalid disk format: {0}. Supported formats: qcow2, raw, vmdk, vdi, vhd")]
    InvalidFormat(String),

    /// Size string is malformed or not positive.
    #[error("{0}")]
    InvalidSize(String),

    /// Size exceeds the ceiling for its unit.
    #[error("Disk size {requested} exceeds maximum allowed ({max}{unit})")]
    SizeOutOfRange {
        /// The size string as supplied
        requested: String,
        /// Ceiling for the unit
        max: u64,
        /// Unit suffix
        unit: char,
    },

    /// Memory outside the accepted range.
    #[error("{0}")]
    InvalidMemory(String),

    /// CPU count outside the accepted range.
    #[error("{0}")]
    InvalidCpuCount(String),

    /// ISO path has an unrecognized extension.
    #[error("ISO file {0} has an unsupported extension (expected .iso or .img)")]
    InvalidIso(PathBuf),

    /// An entity with this name is already registered.
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Kind of entity
        kind: EntityKind,
        /// Conflicting name
        name: String,
    },

    /// The canonical backing path is occupied by an unregistered file.
    #[error("{kind} {name} is not registered but {} already exists", .path.display())]
    PathCollision {
        /// Kind of entity
        kind: EntityKind,
        /// Requested name
        name: String,
        /// Occupied path
        path: PathBuf,
    },

    /// A disk cannot be removed while a VM still references it.
    #[error("Disk {disk} is still attached to VM {vm}")]
    DiskInUse {
        /// Disk name
        disk: String,
        /// First VM found referencing the disk
        vm: String,
    },

    /// Entity, referenced disk or ISO not found.
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of entity
        kind: EntityKind,
        /// Name (or path, for ISO files)
        name: String,
    },

    /// The managed volume lacks space for the requested disk.
    #[error(
        "Insufficient disk space: {required} bytes required (including 10% margin), {available} bytes available"
    )]
    InsufficientSpace {
        /// Bytes needed including the safety margin
        required: u64,
        /// Bytes free on the volume
        available: u64,
    },

    /// The external creation command failed.
    #[error("Failed to create {}: {reason}", .kind.noun())]
    CreationFailed {
        /// Kind of entity
        kind: EntityKind,
        /// Captured tool output or spawn error
        reason: String,
    },

    /// An external tool failed or produced unusable output.
    #[error("{tool} failed: {reason}")]
    ExternalTool {
        /// Tool name
        tool: String,
        /// Failure description
        reason: String,
    },

    /// The VM process exited during the launch grace interval.
    #[error("Failed to start VM: {0}")]
    LaunchFailed(String),

    /// Removing a backing resource failed.
    #[error("Failed to delete {} {name}: {source}", .kind.noun())]
    DeleteFailed {
        /// Kind of entity
        kind: EntityKind,
        /// Entity name
        name: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// A registry or configuration document could not be written.
    #[error("Failed to save {}: {source}", .path.display())]
    Persistence {
        /// Document path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Shorthand for [`CoreError::NotFound`].
    pub fn not_found(kind: EntityKind, name: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidName(_)
            | CoreError::InvalidFormat(_)
            | CoreError::InvalidSize(_)
            | CoreError::SizeOutOfRange { .. }
            | CoreError::InvalidMemory(_)
            | CoreError::InvalidCpuCount(_)
            | CoreError::InvalidIso(_) => ErrorKind::InvalidInput,
            CoreError::AlreadyExists { .. }
            | CoreError::PathCollision { .. }
            | CoreError::DiskInUse { .. } => ErrorKind::Conflict,
            CoreError::NotFound { .. } => ErrorKind::NotFound,
            CoreError::InsufficientSpace { .. } => ErrorKind::ResourceExhausted,
            CoreError::CreationFailed { .. }
            | CoreError::ExternalTool { .. }
            | CoreError::LaunchFailed(_)
            | CoreError::DeleteFailed { .. } => ErrorKind::ExternalToolFailure,
            CoreError::Persistence { .. } | CoreError::Json(_) | CoreError::Io(_) => {
                ErrorKind::PersistenceFailure
            }
        }
    }

    /// Check if this error indicates a not-found condition.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_messages() {
        assert_eq!(
            CoreError::not_found(EntityKind::Disk, "missing").to_string(),
            "Disk missing not found"
        );
        assert_eq!(
            CoreError::not_found(EntityKind::Vm, "vm9").to_string(),
            "VM vm9 not found"
        );
        assert_eq!(
            CoreError::not_found(EntityKind::Iso, "/isos/a.iso").to_string(),
            "ISO file /isos/a.iso not found"
        );
    }

    #[test]
    fn test_already_exists_message() {
        let err = CoreError::AlreadyExists {
            kind: EntityKind::Vm,
            name: "test_vm".into(),
        };
        assert_eq!(err.to_string(), "VM test_vm already exists");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_creation_failed_uses_lowercase_noun() {
        let err = CoreError::CreationFailed {
            kind: EntityKind::Disk,
            reason: "boom".into(),
        };
        assert_eq!(err.to_string(), "Failed to create disk: boom");
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            CoreError::InvalidMemory("x".into()).kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            CoreError::InsufficientSpace {
                required: 2,
                available: 1
            }
            .kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(
            CoreError::LaunchFailed("x".into()).kind(),
            ErrorKind::ExternalToolFailure
        );
        assert!(CoreError::not_found(EntityKind::Disk, "d").is_not_found());
        assert!(!CoreError::InvalidName("x".into()).is_not_found());
    }
}
