//! Blocking-style invocation of external command-line tools.
//!
//! Short-lived collaborators such as `qemu-img` are driven through
//! [`run_tool`], which captures exit status and output without imposing a
//! timeout. Long-running VM processes go through [`crate::launcher`] instead.

use std::ffi::OsStr;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// Maximum captured output size in bytes (1 MB).
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Captured result of a finished tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code, `-1` if the process was killed by a signal.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ToolOutput {
    /// Whether the tool exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Best description of a failure: stderr if present, else stdout, else the code.
    pub fn failure_reason(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("exited with status {}", self.exit_code)
    }
}

/// Truncate a string to max bytes, preserving UTF-8 boundaries.
pub(crate) fn truncate_output(s: String, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_string();
    truncated.push_str("\n... [output truncated]");
    truncated
}

/// Run `program` with `args` to completion and capture its output.
///
/// Only spawn failures (binary missing, permission denied) are returned as
/// `Err`; a non-zero exit is reported through [`ToolOutput::exit_code`].
pub async fn run_tool<I, S>(program: &Path, args: I) -> std::io::Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args);
    debug!(command = ?cmd.as_std(), "running external tool");

    let out = cmd.output().await.map_err(|e| {
        warn!(program = %program.display(), error = %e, "failed to spawn external tool");
        e
    })?;

    let exit_code = out.status.code().unwrap_or(-1);
    let stdout = truncate_output(
        String::from_utf8_lossy(&out.stdout).into_owned(),
        MAX_OUTPUT_SIZE,
    );
    let stderr = truncate_output(
        String::from_utf8_lossy(&out.stderr).into_owned(),
        MAX_OUTPUT_SIZE,
    );
    debug!(
        exit_code,
        stdout_len = stdout.len(),
        stderr_len = stderr.len(),
        "external tool completed"
    );
    trace!(stdout = %stdout, stderr = %stderr, "external tool output");

    Ok(ToolOutput {
        exit_code,
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_truncate_output_respects_char_boundary() {
        let s = "aé".repeat(4);
        let out = truncate_output(s, 2);
        assert!(out.starts_with('a'));
        assert!(out.ends_with("[output truncated]"));
    }

    #[test]
    fn test_failure_reason_prefers_stderr() {
        let out = ToolOutput {
            exit_code: 1,
            stdout: "out".into(),
            stderr: " err \n".into(),
        };
        assert_eq!(out.failure_reason(), "err");

        let out = ToolOutput {
            exit_code: 3,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(out.failure_reason(), "exited with status 3");
    }

    #[tokio::test]
    async fn test_run_tool_captures_exit_code() {
        let out = run_tool(&PathBuf::from("sh"), ["-c", "echo hi; echo oops >&2; exit 4"])
            .await
            .unwrap();
        assert_eq!(out.exit_code, 4);
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_run_tool_missing_binary() {
        let result = run_tool(&PathBuf::from("/nonexistent/kiln-tool"), ["x"]).await;
        assert!(result.is_err());
    }
}
