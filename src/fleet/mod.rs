//! Fleet healer: keeps supervised long-running services converged to an
//! allowlist.
//!
//! Each cycle dedupes instances, recovers missing or failed services and
//! verifies the result. Only allowlisted names are ever touched; anything else
//! the supervisor runs is reported as drift.

mod healer;
mod supervisor;

pub use healer::{FleetHealer, Reconciliation, ServiceState};
pub use supervisor::{Pm2Supervisor, ProcessInfo, ProcessStatus, Supervisor, parse_jlist};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// An allowlisted service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// Command the supervisor starts
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

/// Body of the `fleet-drift` report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriftReport {
    /// Running names that are not allowlisted
    pub unexpected: Vec<String>,
    /// Allowlisted names with no running instance
    pub absent: Vec<String>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.unexpected.is_empty() && self.absent.is_empty()
    }
}

/// Compare what the supervisor runs with the allowlist without acting.
pub async fn drift(
    supervisor: &dyn Supervisor,
    services: &[ServiceSpec],
) -> Result<DriftReport, crate::errors::FleetError> {
    let processes = supervisor.list().await?;
    let mut unexpected: Vec<String> = processes
        .iter()
        .filter(|p| !services.iter().any(|s| s.name == p.name))
        .map(|p| p.name.clone())
        .collect();
    unexpected.sort();
    unexpected.dedup();

    let absent = services
        .iter()
        .filter(|s| !processes.iter().any(|p| p.name == s.name))
        .map(|s| s.name.clone())
        .collect();

    for name in &unexpected {
        tracing::warn!(service = %name, "service running outside the allowlist");
    }
    Ok(DriftReport { unexpected, absent })
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory supervisor for healer and SLA tests.

    use super::*;
    use crate::errors::FleetError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeSupervisor {
        pub processes: Mutex<Vec<ProcessInfo>>,
        next_id: Mutex<u64>,
        /// Names whose starts produce an errored instance
        broken: HashSet<String>,
        /// 1-based `list` calls that fail with a timeout
        failing_lists: HashSet<usize>,
        list_calls: Mutex<usize>,
        pub stops: Mutex<Vec<u64>>,
    }

    impl FakeSupervisor {
        pub fn with(processes: Vec<ProcessInfo>) -> Self {
            let next = processes.iter().map(|p| p.id + 1).max().unwrap_or(0);
            Self {
                processes: Mutex::new(processes),
                next_id: Mutex::new(next),
                ..Default::default()
            }
        }

        pub fn with_broken(processes: Vec<ProcessInfo>, broken: &[&str]) -> Self {
            Self {
                broken: broken.iter().map(|n| n.to_string()).collect(),
                ..Self::with(processes)
            }
        }

        /// Make the given `list` calls fail.
        pub fn failing_lists(mut self, calls: impl IntoIterator<Item = usize>) -> Self {
            self.failing_lists = calls.into_iter().collect();
            self
        }

        pub fn process(id: u64, name: &str, status: ProcessStatus, restarts: u32) -> ProcessInfo {
            ProcessInfo {
                id,
                name: name.to_string(),
                pid: status.is_online().then_some(1000 + id as u32),
                status,
                restarts,
                started_at_ms: None,
            }
        }
    }

    #[async_trait]
    impl Supervisor for FakeSupervisor {
        async fn list(&self) -> Result<Vec<ProcessInfo>, FleetError> {
            let mut calls = self.list_calls.lock().unwrap();
            *calls += 1;
            if self.failing_lists.contains(&*calls) {
                return Err(FleetError::Timeout {
                    command: "pm2 jlist".into(),
                    secs: 1,
                });
            }
            Ok(self.processes.lock().unwrap().clone())
        }

        async fn stop(&self, id: u64) -> Result<(), FleetError> {
            self.stops.lock().unwrap().push(id);
            self.processes.lock().unwrap().retain(|p| p.id != id);
            Ok(())
        }

        async fn start(&self, spec: &ServiceSpec) -> Result<(), FleetError> {
            let mut next = self.next_id.lock().unwrap();
            let status = if self.broken.contains(&spec.name) {
                ProcessStatus::Errored
            } else {
                ProcessStatus::Online
            };
            self.processes
                .lock()
                .unwrap()
                .push(Self::process(*next, &spec.name, status, 0));
            *next += 1;
            Ok(())
        }

        async fn logs(&self, name: &str, _lines: usize) -> Result<String, FleetError> {
            Ok(format!("{}: crashed on startup", name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeSupervisor;
    use super::*;

    fn spec(name: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.into(),
            command: format!("run-{}", name),
            cwd: None,
        }
    }

    #[tokio::test]
    async fn test_drift_lists_unallowlisted_without_acting() {
        let sup = FakeSupervisor::with(vec![
            FakeSupervisor::process(0, "executor", ProcessStatus::Online, 0),
            FakeSupervisor::process(1, "rogue", ProcessStatus::Online, 0),
            FakeSupervisor::process(2, "rogue", ProcessStatus::Stopped, 0),
        ]);
        let report = drift(&sup, &[spec("executor"), spec("sla")]).await.unwrap();
        assert_eq!(report.unexpected, vec!["rogue"]);
        assert_eq!(report.absent, vec!["sla"]);
        assert!(!report.is_clean());
        assert!(sup.stops.lock().unwrap().is_empty());
        assert_eq!(sup.processes.lock().unwrap().len(), 3);
    }
}
