use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{ProcessInfo, ProcessStatus, ServiceSpec, Supervisor};
use crate::patchwork_config::FleetSection;
use crate::util;

/// Final state of one allowlisted service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    pub status: ProcessStatus,
    pub instances: usize,
}

/// Outcome of a heal run; written as the `fleet` report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reconciliation {
    /// Cycles that took action
    pub cycles: u32,
    pub converged: bool,
    pub services: BTreeMap<String, ServiceState>,
    /// Services that had more than one instance at some point
    pub duplicates: Vec<String>,
    /// Services that had no instance at some point
    pub missing: Vec<String>,
    /// Services still not converged at the end
    pub unresolved: Vec<String>,
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<PathBuf>,
}

pub struct FleetHealer<'a> {
    supervisor: &'a dyn Supervisor,
    section: &'a FleetSection,
    diagnostics_dir: PathBuf,
}

impl<'a> FleetHealer<'a> {
    pub fn new(supervisor: &'a dyn Supervisor, section: &'a FleetSection, diagnostics_dir: &Path) -> Self {
        Self {
            supervisor,
            section,
            diagnostics_dir: diagnostics_dir.to_path_buf(),
        }
    }

    /// Instances of allowlisted services, grouped by name.
    fn group<'p>(&self, processes: &'p [ProcessInfo]) -> BTreeMap<&'a str, Vec<&'p ProcessInfo>> {
        let mut groups: BTreeMap<&'a str, Vec<&'p ProcessInfo>> = self
            .section
            .services
            .iter()
            .map(|s| (s.name.as_str(), Vec::new()))
            .collect();
        for p in processes {
            if let Some(list) = groups.get_mut(p.name.as_str()) {
                list.push(p);
            }
        }
        groups
    }

    /// Allowlisted names without exactly one online instance.
    fn unconverged(&self, processes: &[ProcessInfo]) -> Vec<String> {
        self.group(processes)
            .into_iter()
            .filter(|(_, instances)| !(instances.len() == 1 && instances[0].status.is_online()))
            .map(|(name, _)| name.to_string())
            .collect()
    }

    fn converged(&self, processes: &[ProcessInfo]) -> bool {
        self.unconverged(processes).is_empty()
    }

    /// List supervised processes; a failure is recorded as an action.
    async fn list(&self, actions: &mut Vec<String>) -> Option<Vec<ProcessInfo>> {
        match self.supervisor.list().await {
            Ok(processes) => Some(processes),
            Err(e) => {
                tracing::warn!(error = %e, "failed to list supervised processes");
                actions.push(format!("failed to list services: {}", e));
                None
            }
        }
    }

    /// Run dedupe → recover → verify cycles until converged or out of cycles.
    ///
    /// Supervisor failures never escape; they end up in `actions` and, when
    /// the final state cannot be read, every service is left unresolved.
    pub async fn heal(&self) -> Reconciliation {
        let mut rec = Reconciliation::default();
        let mut duplicates = BTreeSet::new();
        let mut missing = BTreeSet::new();
        let mut captured_last = Vec::new();

        for cycle in 1..=self.section.max_cycles {
            captured_last.clear();
            let Some(processes) = self.list(&mut rec.actions).await else {
                rec.cycles = cycle;
                continue;
            };
            if self.converged(&processes) {
                break;
            }
            rec.cycles = cycle;
            tracing::info!(cycle, "fleet heal cycle");

            self.dedupe(&processes, &mut rec.actions, &mut duplicates).await;

            let Some(processes) = self.list(&mut rec.actions).await else {
                continue;
            };
            self.recover(&processes, &mut rec.actions, &mut missing).await;

            let failing = self.verify(&mut rec.actions).await;
            if failing.is_empty() {
                break;
            }
            for name in failing {
                tracing::warn!(service = %name, cycle, "service failed verification");
                if let Some(path) = self.capture_diagnostics(&name, &format!("cycle{}", cycle)).await {
                    rec.diagnostics.push(path);
                }
                captured_last.push(name);
            }
        }

        match self.list(&mut rec.actions).await {
            Some(processes) => {
                for (name, instances) in self.group(&processes) {
                    let status = instances
                        .iter()
                        .find(|p| p.status.is_online())
                        .or(instances.first())
                        .map(|p| p.status.clone())
                        .unwrap_or(ProcessStatus::Stopped);
                    let ok = instances.len() == 1 && status.is_online();
                    if !ok {
                        rec.unresolved.push(name.to_string());
                    }
                    rec.services.insert(
                        name.to_string(),
                        ServiceState {
                            status,
                            instances: instances.len(),
                        },
                    );
                }
            }
            None => {
                for spec in &self.section.services {
                    rec.unresolved.push(spec.name.clone());
                    rec.services.insert(
                        spec.name.clone(),
                        ServiceState {
                            status: ProcessStatus::Unknown,
                            instances: 0,
                        },
                    );
                }
            }
        }
        rec.converged = rec.unresolved.is_empty();
        rec.duplicates = duplicates.into_iter().collect();
        rec.missing = missing.into_iter().collect();

        // Services already captured by the last failed cycle are not captured twice.
        for name in rec.unresolved.clone() {
            if captured_last.contains(&name) {
                continue;
            }
            if let Some(path) = self.capture_diagnostics(&name, "final").await {
                rec.diagnostics.push(path);
            }
        }

        if rec.converged {
            tracing::info!(cycles = rec.cycles, "fleet converged");
        } else {
            tracing::error!(unresolved = ?rec.unresolved, "fleet did not converge");
        }
        rec
    }

    /// Keep one instance per name: the online one with the fewest restarts,
    /// then the lowest id.
    async fn dedupe(
        &self,
        processes: &[ProcessInfo],
        actions: &mut Vec<String>,
        duplicates: &mut BTreeSet<String>,
    ) {
        for (name, mut instances) in self.group(processes) {
            if instances.len() <= 1 {
                continue;
            }
            duplicates.insert(name.to_string());
            instances.sort_by_key(|p| (!p.status.is_online(), p.restarts, p.id));
            for extra in &instances[1..] {
                match self.supervisor.stop(extra.id).await {
                    Ok(()) => actions.push(format!("stopped duplicate {} (id {})", name, extra.id)),
                    Err(e) => {
                        tracing::warn!(service = name, id = extra.id, error = %e, "failed to stop duplicate");
                        actions.push(format!("failed to stop duplicate {} (id {}): {}", name, extra.id, e));
                    }
                }
            }
        }
    }

    /// Start missing services and replace failed single instances.
    async fn recover(
        &self,
        processes: &[ProcessInfo],
        actions: &mut Vec<String>,
        missing: &mut BTreeSet<String>,
    ) {
        let groups = self.group(processes);
        for spec in &self.section.services {
            let instances = groups.get(spec.name.as_str()).cloned().unwrap_or_default();
            match instances.as_slice() {
                [] => {
                    missing.insert(spec.name.clone());
                    self.start(spec, actions).await;
                }
                [only] if !only.status.is_online() && only.status != ProcessStatus::Launching => {
                    match self.supervisor.stop(only.id).await {
                        Ok(()) => {
                            actions.push(format!("removed {} instance of {}", status_name(&only.status), spec.name));
                            self.start(spec, actions).await;
                        }
                        Err(e) => actions.push(format!("failed to remove {}: {}", spec.name, e)),
                    }
                }
                _ => {}
            }
        }
    }

    async fn start(&self, spec: &ServiceSpec, actions: &mut Vec<String>) {
        match self.supervisor.start(spec).await {
            Ok(()) => actions.push(format!("started {}", spec.name)),
            Err(e) => {
                tracing::warn!(service = %spec.name, error = %e, "failed to start service");
                actions.push(format!("failed to start {}: {}", spec.name, e));
            }
        }
    }

    /// Poll until every service is converged or polls run out. Returns the
    /// services still failing; all of them if no poll could list processes.
    async fn verify(&self, actions: &mut Vec<String>) -> Vec<String> {
        let interval = Duration::from_millis(self.section.verify_interval_ms);
        let mut failing = None;
        for poll in 0..self.section.verify_polls.max(1) {
            if poll > 0 {
                tokio::time::sleep(interval).await;
            }
            let Some(processes) = self.list(actions).await else {
                continue;
            };
            let names = self.unconverged(&processes);
            if names.is_empty() {
                return names;
            }
            failing = Some(names);
        }
        failing.unwrap_or_else(|| self.section.services.iter().map(|s| s.name.clone()).collect())
    }

    async fn capture_diagnostics(&self, name: &str, label: &str) -> Option<PathBuf> {
        let tail = self
            .supervisor
            .logs(name, self.section.log_tail_lines)
            .await
            .unwrap_or_else(|e| format!("<logs unavailable: {}>", e));
        let path = self.diagnostics_dir.join(format!(
            "{}-{}-{}.log",
            name,
            label,
            Utc::now().format("%Y-%m-%dT%H-%M-%S")
        ));
        match util::write_atomic(&path, util::tail_lines(&tail, self.section.log_tail_lines).as_bytes()) {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!(service = %name, error = %format!("{:#}", e), "failed to capture diagnostics");
                None
            }
        }
    }
}

fn status_name(status: &ProcessStatus) -> &'static str {
    match status {
        ProcessStatus::Online => "online",
        ProcessStatus::Launching => "launching",
        ProcessStatus::Stopping => "stopping",
        ProcessStatus::Stopped => "stopped",
        ProcessStatus::Errored => "errored",
        ProcessStatus::Unknown => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::testing::FakeSupervisor;
    use tempfile::tempdir;

    fn section(names: &[&str]) -> FleetSection {
        FleetSection {
            max_cycles: 3,
            verify_polls: 2,
            verify_interval_ms: 1,
            services: names
                .iter()
                .map(|n| ServiceSpec {
                    name: n.to_string(),
                    command: format!("run-{}", n),
                    cwd: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_converged_fleet_takes_no_action() {
        let dir = tempdir().unwrap();
        let sup = FakeSupervisor::with(vec![FakeSupervisor::process(
            0,
            "executor",
            ProcessStatus::Online,
            0,
        )]);
        let section = section(&["executor"]);
        let rec = FleetHealer::new(&sup, &section, dir.path()).heal().await;
        assert!(rec.converged);
        assert_eq!(rec.cycles, 0);
        assert!(rec.actions.is_empty());
    }

    #[tokio::test]
    async fn test_heal_dedupes_and_recovers() {
        let dir = tempdir().unwrap();
        let sup = FakeSupervisor::with(vec![
            FakeSupervisor::process(0, "executor", ProcessStatus::Errored, 9),
            FakeSupervisor::process(1, "executor", ProcessStatus::Online, 1),
            FakeSupervisor::process(2, "sla", ProcessStatus::Stopped, 0),
            FakeSupervisor::process(3, "rogue", ProcessStatus::Online, 0),
        ]);
        let section = section(&["executor", "sla", "hygiene"]);
        let rec = FleetHealer::new(&sup, &section, dir.path()).heal().await;

        assert!(rec.converged);
        assert_eq!(rec.cycles, 1);
        assert_eq!(rec.duplicates, vec!["executor"]);
        assert_eq!(rec.missing, vec!["hygiene"]);
        assert_eq!(rec.services["executor"].instances, 1);
        assert_eq!(rec.services["sla"].status, ProcessStatus::Online);
        assert_eq!(sup.stops.lock().unwrap().as_slice(), &[0, 2]);

        // Unallowlisted services are never touched
        assert!(sup.processes.lock().unwrap().iter().any(|p| p.name == "rogue"));
    }

    #[tokio::test]
    async fn test_unconverged_service_gets_diagnostics() {
        let dir = tempdir().unwrap();
        let sup = FakeSupervisor::with_broken(Vec::new(), &["executor"]);
        let section = section(&["executor"]);
        let rec = FleetHealer::new(&sup, &section, dir.path()).heal().await;

        assert!(!rec.converged);
        assert_eq!(rec.cycles, 3);
        assert_eq!(rec.unresolved, vec!["executor"]);
        // One capture per failed cycle, none repeated at the end
        assert_eq!(rec.diagnostics.len(), 3);
        for (cycle, path) in rec.diagnostics.iter().enumerate() {
            let file = path.file_name().unwrap().to_string_lossy().to_string();
            assert!(file.starts_with(&format!("executor-cycle{}-", cycle + 1)));
            let log = std::fs::read_to_string(path).unwrap();
            assert!(log.contains("crashed on startup"));
        }
    }

    #[tokio::test]
    async fn test_failed_list_is_recorded_and_healing_continues() {
        let dir = tempdir().unwrap();
        // The listing after dedupe in the first cycle times out
        let sup = FakeSupervisor::with(Vec::new()).failing_lists([2]);
        let section = section(&["executor"]);
        let rec = FleetHealer::new(&sup, &section, dir.path()).heal().await;

        assert!(rec.converged);
        assert_eq!(rec.cycles, 2);
        assert!(rec.actions.iter().any(|a| a.starts_with("failed to list services")));
        assert!(rec.actions.contains(&"started executor".to_string()));
        assert_eq!(rec.services["executor"].status, ProcessStatus::Online);
    }

    #[tokio::test]
    async fn test_unreachable_supervisor_leaves_services_unresolved() {
        let dir = tempdir().unwrap();
        let sup = FakeSupervisor::with(Vec::new()).failing_lists(1..=100);
        let section = section(&["executor", "sla"]);
        let rec = FleetHealer::new(&sup, &section, dir.path()).heal().await;

        assert!(!rec.converged);
        assert_eq!(rec.unresolved, vec!["executor", "sla"]);
        assert_eq!(rec.services["sla"].status, ProcessStatus::Unknown);
        assert_eq!(rec.services["sla"].instances, 0);
        assert_eq!(rec.diagnostics.len(), 2);
        assert!(sup.stops.lock().unwrap().is_empty());
    }
}
