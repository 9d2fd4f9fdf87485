//! Bounded shell command execution.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Captured result of one shell command.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    /// Exit code; `None` when killed by a signal or on timeout
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, for failure diagnostics.
    pub fn combined(&self) -> String {
        match (self.stdout.trim_end(), self.stderr.trim_end()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }

    /// One-line description of a failure.
    pub fn failure_reason(&self, limit: Duration) -> String {
        if self.timed_out {
            return format!("timed out after {}s", limit.as_secs());
        }
        let detail = self
            .stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| format!(": {}", l.trim()))
            .unwrap_or_default();
        match self.exit_code {
            Some(code) => format!("exited with code {}{}", code, detail),
            None => format!("terminated by signal{}", detail),
        }
    }
}

/// Run `command` through `sh -c` in `cwd`, killing it when `limit` expires.
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    limit: Duration,
    env: &[(&str, String)],
) -> Result<ShellOutput> {
    let start = Instant::now();
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn command: {}", command))?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let out_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(ref mut s) = stdout {
            let _ = s.read_to_end(&mut buf).await;
        }
        buf
    });
    let err_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(ref mut s) = stderr {
            let _ = s.read_to_end(&mut buf).await;
        }
        buf
    });

    let (exit_code, timed_out) = match timeout(limit, child.wait()).await {
        Ok(status) => {
            let status = status.context("Failed to wait for command")?;
            (status.code(), false)
        }
        Err(_) => {
            tracing::warn!(command, secs = limit.as_secs(), "command timed out, killing");
            let _ = child.kill().await;
            (None, true)
        }
    };

    // A grandchild holding the pipes open must not stall collection.
    let grace = Duration::from_secs(2);
    let stdout = timeout(grace, out_task).await.ok().and_then(|r| r.ok()).unwrap_or_default();
    let stderr = timeout(grace, err_task).await.ok().and_then(|r| r.ok()).unwrap_or_default();

    Ok(ShellOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
        timed_out,
        duration: start.elapsed(),
    })
}
