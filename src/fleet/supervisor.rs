//! Process supervisor abstraction and the pm2 implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use super::ServiceSpec;
use crate::errors::FleetError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Online,
    Launching,
    Stopping,
    Stopped,
    Errored,
    Unknown,
}

impl ProcessStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "online" => ProcessStatus::Online,
            "launching" => ProcessStatus::Launching,
            "stopping" => ProcessStatus::Stopping,
            "stopped" => ProcessStatus::Stopped,
            "errored" => ProcessStatus::Errored,
            _ => ProcessStatus::Unknown,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, ProcessStatus::Online)
    }
}

/// One supervised process instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Supervisor-assigned instance id
    pub id: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub restarts: u32,
    /// Start time in milliseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
}

/// Operations the fleet healer needs from a process supervisor.
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn list(&self) -> Result<Vec<ProcessInfo>, FleetError>;

    /// Stop and remove one instance.
    async fn stop(&self, id: u64) -> Result<(), FleetError>;

    async fn start(&self, spec: &ServiceSpec) -> Result<(), FleetError>;

    /// Last `lines` lines of a service's logs.
    async fn logs(&self, name: &str, lines: usize) -> Result<String, FleetError>;
}

/// Supervisor backed by the `pm2` CLI.
pub struct Pm2Supervisor {
    program: String,
    prefix_args: Vec<String>,
    command_timeout: Duration,
}

impl Pm2Supervisor {
    /// `command` may carry leading arguments, e.g. `npx pm2`.
    pub fn new(command: &str, command_timeout: Duration) -> Self {
        let mut parts = command.split_whitespace().map(String::from);
        let program = parts.next().unwrap_or_else(|| "pm2".to_string());
        Self {
            program,
            prefix_args: parts.collect(),
            command_timeout,
        }
    }

    async fn exec(&self, args: &[&str], cwd: Option<&std::path::Path>) -> Result<String, FleetError> {
        let display = format!("{} {}", self.program, args.join(" "));
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| FleetError::CommandFailed {
            command: display.clone(),
            message: e.to_string(),
        })?;

        let output = match timeout(self.command_timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| FleetError::CommandFailed {
                command: display.clone(),
                message: e.to_string(),
            })?,
            Err(_) => {
                return Err(FleetError::Timeout {
                    command: display,
                    secs: self.command_timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            return Err(FleetError::CommandFailed {
                command: display,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Supervisor for Pm2Supervisor {
    async fn list(&self) -> Result<Vec<ProcessInfo>, FleetError> {
        let out = self.exec(&["jlist"], None).await?;
        parse_jlist(&out)
    }

    async fn stop(&self, id: u64) -> Result<(), FleetError> {
        self.exec(&["delete", &id.to_string()], None).await.map(|_| ())
    }

    async fn start(&self, spec: &ServiceSpec) -> Result<(), FleetError> {
        self.exec(
            &["start", &spec.command, "--name", &spec.name],
            spec.cwd.as_deref(),
        )
        .await
        .map(|_| ())
    }

    async fn logs(&self, name: &str, lines: usize) -> Result<String, FleetError> {
        self.exec(
            &["logs", name, "--lines", &lines.to_string(), "--nostream", "--raw"],
            None,
        )
        .await
    }
}

/// Parse `pm2 jlist` output.
///
/// pm2 may print banner lines before the JSON array, so parsing starts at the
/// first `[` that opens a valid array.
pub fn parse_jlist(output: &str) -> Result<Vec<ProcessInfo>, FleetError> {
    let items = output
        .match_indices('[')
        .find_map(|(idx, _)| {
            let mut stream =
                serde_json::Deserializer::from_str(&output[idx..]).into_iter::<serde_json::Value>();
            match stream.next() {
                Some(Ok(serde_json::Value::Array(items))) => Some(items),
                _ => None,
            }
        })
        .ok_or_else(|| FleetError::BadProcessList("no JSON array in output".to_string()))?;

    let mut processes = Vec::with_capacity(items.len());
    for item in items {
        let name = item
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FleetError::BadProcessList("process without name".to_string()))?;
        let env = item.get("pm2_env");
        processes.push(ProcessInfo {
            id: item.get("pm_id").and_then(|v| v.as_u64()).unwrap_or_default(),
            name: name.to_string(),
            pid: item
                .get("pid")
                .and_then(|v| v.as_u64())
                .filter(|&p| p > 0)
                .map(|p| p as u32),
            status: env
                .and_then(|e| e.get("status"))
                .and_then(|v| v.as_str())
                .map(ProcessStatus::parse)
                .unwrap_or(ProcessStatus::Unknown),
            restarts: env
                .and_then(|e| e.get("restart_time"))
                .and_then(|v| v.as_u64())
                .unwrap_or_default() as u32,
            started_at_ms: env.and_then(|e| e.get("pm_uptime")).and_then(|v| v.as_i64()),
        });
    }
    Ok(processes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jlist() {
        let output = r#"[PM2] Spawning PM2 daemon
[{"pid":4242,"name":"executor","pm_id":0,"pm2_env":{"status":"online","restart_time":2,"pm_uptime":1700000000000}},
 {"pid":0,"name":"executor","pm_id":3,"pm2_env":{"status":"errored","restart_time":15}},
 {"name":"sla","pm_id":1,"pm2_env":{"status":"one-launch-status"}}]"#;
        let procs = parse_jlist(output).unwrap();
        assert_eq!(procs.len(), 3);
        assert_eq!(procs[0].pid, Some(4242));
        assert!(procs[0].status.is_online());
        assert_eq!(procs[0].restarts, 2);
        assert_eq!(procs[1].pid, None);
        assert_eq!(procs[1].status, ProcessStatus::Errored);
        assert_eq!(procs[2].status, ProcessStatus::Unknown);
    }

    #[test]
    fn test_parse_jlist_rejects_garbage() {
        assert!(parse_jlist("pm2 not running").is_err());
        assert!(parse_jlist("[{\"pm_id\": 1}]").is_err());
    }

    #[test]
    fn test_supervisor_command_with_prefix() {
        let sup = Pm2Supervisor::new("npx pm2", Duration::from_secs(5));
        assert_eq!(sup.program, "npx");
        assert_eq!(sup.prefix_args, vec!["pm2"]);
    }

    #[tokio::test]
    async fn test_missing_binary_is_command_failure() {
        let sup = Pm2Supervisor::new("patchwork-no-such-supervisor", Duration::from_secs(5));
        match sup.list().await {
            Err(FleetError::CommandFailed { .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
