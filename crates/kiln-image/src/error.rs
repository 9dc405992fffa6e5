//! Error types for kiln-image.

use thiserror::Error;

/// Result type alias for container engine operations.
pub type Result<T> = std::result::Result<T, ImageError>;

/// Errors that can occur while talking to the container engine.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The engine binary is missing or `--version` failed.
    #[error("Docker is not installed or not accessible: {0}")]
    NotInstalled(String),

    /// The engine daemon is not reachable.
    #[error("Docker is not accessible: {0}")]
    Unavailable(String),

    /// An engine command exited non-zero.
    #[error("Failed to {action}: {stderr}")]
    CommandFailed {
        /// What was being attempted, e.g. "list Docker images"
        action: &'static str,
        /// Captured error output
        stderr: String,
    },

    /// `docker pull` exited non-zero.
    #[error("Failed to pull image: {0}")]
    PullFailed(String),

    /// The engine process could not be started or read.
    #[error("Error running docker: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = ImageError::CommandFailed {
            action: "list Docker images",
            stderr: "permission denied".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to list Docker images: permission denied"
        );
        assert_eq!(
            ImageError::PullFailed("manifest unknown".into()).to_string(),
            "Failed to pull image: manifest unknown"
        );
    }
}
