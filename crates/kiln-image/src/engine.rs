//! Client for the `docker` command-line engine.

use crate::error::{ImageError, Result};
use crate::models::{
    filter_images, parse_containers, parse_hub_results, parse_images, ContainerSummary,
    HubResult, ImageSummary, CONTAINERS_FORMAT, IMAGES_FORMAT,
};
use crate::progress::PullProgress;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, instrument, trace};

/// Captured output of a finished engine command.
struct EngineOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Thin wrapper over the engine CLI.
#[derive(Debug, Clone)]
pub struct ContainerEngine {
    binary: PathBuf,
}

impl Default for ContainerEngine {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ContainerEngine {
    /// Drive the engine through the given binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// The engine binary in use.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn run<I, S>(&self, args: I) -> Result<EngineOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        debug!(command = ?cmd.as_std(), "Running engine command");

        let out = cmd.output().await?;
        Ok(EngineOutput {
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }

    /// Check that the engine binary runs; returns its version string.
    pub async fn check_installed(&self) -> Result<String> {
        let out = self
            .run(["--version"])
            .await
            .map_err(|e| ImageError::NotInstalled(e.to_string()))?;
        if !out.success {
            error!(stderr = %out.stderr, "Docker is not installed or not accessible");
            return Err(ImageError::NotInstalled(out.stderr));
        }
        let version = out.stdout.trim().to_string();
        info!(version = %version, "Docker is installed");
        Ok(version)
    }

    /// All local images.
    pub async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        info!("Listing Docker images");
        let out = self.run(["images", "--format", IMAGES_FORMAT]).await?;
        if !out.success {
            return Err(ImageError::CommandFailed {
                action: "list Docker images",
                stderr: out.stderr,
            });
        }
        Ok(parse_images(&out.stdout))
    }

    /// All containers, running or not. Requires a reachable daemon.
    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let info = self.run(["info"]).await?;
        if !info.success {
            error!(stderr = %info.stderr, "Docker is not accessible");
            return Err(ImageError::Unavailable(info.stderr));
        }

        info!("Listing all Docker containers");
        let out = self
            .run(["ps", "-a", "--format", CONTAINERS_FORMAT])
            .await?;
        if !out.success {
            return Err(ImageError::CommandFailed {
                action: "list containers",
                stderr: out.stderr,
            });
        }
        trace!(raw = %out.stdout, "Container listing");
        Ok(parse_containers(&out.stdout))
    }

    /// Local images whose `name:tag` contains `term`, ignoring case.
    pub async fn search_local(&self, term: &str) -> Result<Vec<ImageSummary>> {
        let found = filter_images(self.list_images().await?, term);
        info!(term = %term, count = found.len(), "Searched local images");
        Ok(found)
    }

    /// Search the public registry.
    pub async fn search_hub(&self, term: &str) -> Result<Vec<HubResult>> {
        info!(term = %term, "Searching DockerHub");
        let out = self
            .run(["search", "--format", "{{json .}}", term])
            .await?;
        if !out.success {
            return Err(ImageError::CommandFailed {
                action: "search DockerHub",
                stderr: out.stderr,
            });
        }
        let results = parse_hub_results(&out.stdout);
        info!(term = %term, count = results.len(), "DockerHub search finished");
        Ok(results)
    }

    /// Pull `image`, calling `on_progress` with non-decreasing values in
    /// `1..=100`. `100` is reported once, and only if the pull succeeds.
    #[instrument(skip(self, on_progress))]
    pub async fn pull<F>(&self, image: &str, mut on_progress: F) -> Result<()>
    where
        F: FnMut(u8) + Send,
    {
        info!("Pulling Docker image");
        let mut child = Command::new(&self.binary)
            .args(["pull", image])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain stderr concurrently so a chatty failure cannot block stdout.
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut progress = PullProgress::new();
        let mut read_error = None;
        if let Some(stdout) = child.stdout.take() {
            // Lines are decoded lossily; stray bytes must not end the pull.
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let decoded = String::from_utf8_lossy(&buf);
                        let line = decoded.trim_end_matches(['\r', '\n']);
                        debug!(line = %line.trim(), "Docker pull output");
                        for value in progress.observe(line) {
                            on_progress(value);
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to read pull output");
                        read_error = Some(e);
                        break;
                    }
                }
            }
        }

        // Always reap the engine, even when its output could not be read.
        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if let Some(e) = read_error {
            progress.finish(false);
            return Err(e.into());
        }

        if status.success() {
            if let Some(value) = progress.finish(true) {
                on_progress(value);
            }
            info!("Successfully pulled image");
            Ok(())
        } else {
            progress.finish(false);
            let stderr = stderr.trim().to_string();
            error!(stderr = %stderr, "Failed to pull image");
            Err(ImageError::PullFailed(stderr))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::{Arc, Mutex};

    /// Write an executable shell script standing in for the engine.
    fn fake_engine(dir: &Path, body: &str) -> ContainerEngine {
        let path = dir.join("docker");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        ContainerEngine::new(path)
    }

    #[tokio::test]
    async fn test_pull_reports_monotonic_progress_then_100() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine(
            dir.path(),
            r#"cat <<'EOF'
latest: Pulling from library/alpine
aaa: Pulling fs layer
aaa: Downloading [==>  ] 1MB/3MB
aaa: Verifying Checksum
aaa: Download complete
aaa: Extracting [=====>] 3MB/3MB
aaa: Pull complete
Digest: sha256:abc
Status: Downloaded newer image for alpine:latest
EOF"#,
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine
            .pull("alpine", move |v| sink.lock().unwrap().push(v))
            .await
            .unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.first(), Some(&1));
        assert_eq!(seen.last(), Some(&100));
        assert_eq!(seen.iter().filter(|&&v| v == 100).count(), 1);
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
    }

    #[tokio::test]
    async fn test_pull_survives_undecodable_output() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine(
            dir.path(),
            r#"echo 'latest: Pulling from library/alpine'
printf '\377\376 junk\n'
echo 'aaa: Pulling fs layer'
echo 'aaa: Pull complete'
echo 'Status: Downloaded newer image for alpine:latest'"#,
        );

        let mut seen = Vec::new();
        engine.pull("alpine", |v| seen.push(v)).await.unwrap();
        assert_eq!(seen.first(), Some(&1));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
    }

    #[tokio::test]
    async fn test_pull_failure_surfaces_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine(
            dir.path(),
            "echo 'latest: Pulling from library/nope'\necho 'manifest unknown' >&2\nexit 1",
        );

        let mut seen = Vec::new();
        let err = engine.pull("nope", |v| seen.push(v)).await.unwrap_err();
        assert_eq!(err.to_string(), "Failed to pull image: manifest unknown");
        assert_eq!(seen, vec![1]);
    }

    #[tokio::test]
    async fn test_list_containers_requires_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine(
            dir.path(),
            r#"if [ "$1" = "info" ]; then echo 'Cannot connect to the Docker daemon' >&2; exit 1; fi"#,
        );
        let err = engine.list_containers().await.unwrap_err();
        assert!(matches!(err, ImageError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_list_and_search_local_images() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine(
            dir.path(),
            r#"printf 'alpine:latest\ta1\t7MB\tyesterday\nnginx:1.25\tb2\t180MB\ttoday\n'"#,
        );
        assert_eq!(engine.list_images().await.unwrap().len(), 2);
        let found = engine.search_local("NGINX").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "b2");
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_installed() {
        let engine = ContainerEngine::new("/nonexistent/docker");
        assert!(matches!(
            engine.check_installed().await,
            Err(ImageError::NotInstalled(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_real_engine_version() {
        let version = ContainerEngine::default().check_installed().await.unwrap();
        assert!(version.to_lowercase().contains("docker"));
    }
}
