//! SLA enforcer.
//!
//! Samples queue and fleet state, compares it with the `[sla]` thresholds and,
//! in enforce mode, writes the control records the sequencer honours:
//! `control/halt.json` for a critical violation, `control/backoff.json` for
//! anything else. Check mode only reports.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::config::Layout;
use crate::context::PipelineContext;
use crate::fleet::Supervisor;
use crate::patchwork_config::SlaSection;
use crate::unit::{Patch, json_files};
use crate::util;

const HALT_FILE: &str = "halt.json";
const BACKOFF_FILE: &str = "backoff.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    QueueWait,
    RunDuration,
    Restarts,
    QueueDepth,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ViolationKind::QueueWait => "queue_wait",
            ViolationKind::RunDuration => "run_duration",
            ViolationKind::Restarts => "restarts",
            ViolationKind::QueueDepth => "queue_depth",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub observed: u64,
    pub threshold: u64,
    pub detail: String,
}

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaSample {
    /// Units in `queued` and `staged`
    pub queue_depth: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_queued_secs: Option<u64>,
    /// Time since the active unit was dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_run_secs: Option<u64>,
    /// Restart counts per supervised service
    #[serde(default)]
    pub restarts: BTreeMap<String, u32>,
    pub sampled_at: DateTime<Utc>,
}

/// `control/halt.json`. Stays until cleared by an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltRecord {
    pub at: DateTime<Utc>,
    pub reason: String,
    pub violations: Vec<Violation>,
}

/// `control/backoff.json`. Expires on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffRecord {
    pub at: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub reason: String,
}

impl BackoffRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.until > now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SlaAction {
    None,
    Backoff { until: DateTime<Utc> },
    Halt,
}

/// Body of the `sla` report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaReport {
    pub enforce: bool,
    pub sample: SlaSample,
    pub violations: Vec<Violation>,
    pub action: SlaAction,
}

impl SlaReport {
    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }
}

pub fn halt_path(layout: &Layout) -> PathBuf {
    layout.control_dir.join(HALT_FILE)
}

pub fn backoff_path(layout: &Layout) -> PathBuf {
    layout.control_dir.join(BACKOFF_FILE)
}

pub fn read_halt(layout: &Layout) -> Result<Option<HaltRecord>> {
    util::read_json_opt(&halt_path(layout))
}

/// The backoff record, if one exists and has not expired.
pub fn read_backoff(layout: &Layout) -> Result<Option<BackoffRecord>> {
    Ok(util::read_json_opt::<BackoffRecord>(&backoff_path(layout))?
        .filter(|b| b.is_active(Utc::now())))
}

pub fn clear_halt(layout: &Layout) -> Result<bool> {
    let removed = util::remove_if_exists(&halt_path(layout))?;
    if removed {
        tracing::info!("emergency halt cleared");
    }
    Ok(removed)
}

/// Compare a sample with the thresholds. Absent thresholds are not checked.
pub fn evaluate(sample: &SlaSample, section: &SlaSection) -> Vec<Violation> {
    let severity = |kind: ViolationKind| {
        if section.halt_on.contains(&kind) {
            Severity::Critical
        } else {
            Severity::Warning
        }
    };
    let mut violations = Vec::new();

    if let (Some(max), Some(observed)) = (section.max_queue_wait_secs, sample.oldest_queued_secs)
        && observed > max
    {
        violations.push(Violation {
            kind: ViolationKind::QueueWait,
            severity: severity(ViolationKind::QueueWait),
            observed,
            threshold: max,
            detail: format!("oldest pending unit has waited {}s", observed),
        });
    }

    if let (Some(max), Some(observed)) = (section.max_run_secs, sample.active_run_secs)
        && observed > max
    {
        violations.push(Violation {
            kind: ViolationKind::RunDuration,
            severity: severity(ViolationKind::RunDuration),
            observed,
            threshold: max,
            detail: format!("active unit has run for {}s", observed),
        });
    }

    if let Some(max) = section.max_restarts {
        for (name, &restarts) in &sample.restarts {
            if restarts > max {
                violations.push(Violation {
                    kind: ViolationKind::Restarts,
                    severity: severity(ViolationKind::Restarts),
                    observed: u64::from(restarts),
                    threshold: u64::from(max),
                    detail: format!("service {} restarted {} times", name, restarts),
                });
            }
        }
    }

    if let Some(max) = section.max_queue_depth
        && sample.queue_depth > max
    {
        violations.push(Violation {
            kind: ViolationKind::QueueDepth,
            severity: severity(ViolationKind::QueueDepth),
            observed: sample.queue_depth as u64,
            threshold: max as u64,
            detail: format!("{} units pending", sample.queue_depth),
        });
    }

    violations
}

fn age_secs(modified: SystemTime) -> u64 {
    SystemTime::now()
        .duration_since(modified)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct SlaEnforcer<'a> {
    ctx: &'a PipelineContext,
    supervisor: Option<&'a dyn Supervisor>,
}

impl<'a> SlaEnforcer<'a> {
    pub fn new(ctx: &'a PipelineContext, supervisor: Option<&'a dyn Supervisor>) -> Self {
        Self { ctx, supervisor }
    }

    /// Read-only sample of queue and fleet state.
    pub async fn sample(&self) -> Result<SlaSample> {
        let layout = self.ctx.layout();
        let now = Utc::now();

        let mut pending = json_files(&layout.queued_dir)?;
        pending.extend(json_files(&layout.staged_dir)?);

        // Queue wait counts from submission; fall back to the file's mtime.
        let oldest_queued_secs = pending
            .iter()
            .filter_map(|path| {
                let submitted = util::read_json::<Patch>(path)
                    .ok()
                    .and_then(|p| p.submitted_at)
                    .map(|at| (now - at).num_seconds().max(0) as u64);
                submitted.or_else(|| {
                    std::fs::metadata(path)
                        .and_then(|m| m.modified())
                        .ok()
                        .map(age_secs)
                })
            })
            .max();

        let active_run_secs = json_files(&layout.active_dir)?
            .first()
            .and_then(|path| std::fs::metadata(path).and_then(|m| m.modified()).ok())
            .map(age_secs);

        let mut restarts = BTreeMap::new();
        if let Some(supervisor) = self.supervisor {
            match supervisor.list().await {
                Ok(processes) => {
                    for p in processes {
                        let entry = restarts.entry(p.name).or_insert(0);
                        *entry = (*entry).max(p.restarts);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "could not sample supervisor restarts"),
            }
        }

        Ok(SlaSample {
            queue_depth: pending.len(),
            oldest_queued_secs,
            active_run_secs,
            restarts,
            sampled_at: now,
        })
    }

    /// Sample, evaluate and (in enforce mode) write control records.
    pub async fn run(&self, enforce: bool) -> Result<SlaReport> {
        let section = &self.ctx.settings().sla;
        let sample = self.sample().await?;
        let violations = evaluate(&sample, section);

        for v in &violations {
            tracing::warn!(kind = %v.kind, observed = v.observed, threshold = v.threshold, "SLA violation");
        }

        let action = if !enforce || violations.is_empty() {
            SlaAction::None
        } else if violations.iter().any(|v| v.severity == Severity::Critical) {
            let reason = violations
                .iter()
                .filter(|v| v.severity == Severity::Critical)
                .map(|v| v.detail.clone())
                .collect::<Vec<_>>()
                .join("; ");
            let record = HaltRecord {
                at: Utc::now(),
                reason,
                violations: violations.clone(),
            };
            util::write_json_atomic(&halt_path(self.ctx.layout()), &record)?;
            tracing::error!(reason = %record.reason, "emergency halt engaged");
            SlaAction::Halt
        } else {
            let at = Utc::now();
            let secs = i64::try_from(section.backoff_secs)
                .unwrap_or(i64::MAX)
                .min(i64::MAX / 1000);
            let until = at
                .checked_add_signed(ChronoDuration::seconds(secs))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            let record = BackoffRecord {
                at,
                until,
                reason: violations
                    .iter()
                    .map(|v| v.detail.clone())
                    .collect::<Vec<_>>()
                    .join("; "),
            };
            util::write_json_atomic(&backoff_path(self.ctx.layout()), &record)?;
            tracing::warn!(%until, "dispatch backoff applied");
            SlaAction::Backoff { until }
        };

        let report = SlaReport {
            enforce,
            sample,
            violations,
            action,
        };
        self.ctx.reports.write("sla", &report)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fleet::ProcessStatus;
    use crate::fleet::testing::FakeSupervisor;
    use crate::patchwork_config::PatchworkToml;
    use crate::unit::{Phases, Step, UnitId};
    use tempfile::TempDir;

    fn make_ctx(sla: SlaSection) -> (PipelineContext, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut settings = PatchworkToml::default();
        settings.sla = sla;
        let config = Config::with_settings(dir.path(), settings);
        (PipelineContext::open(config).unwrap(), dir)
    }

    fn deposit(ctx: &PipelineContext, id: &str) {
        let p = Patch::new(
            UnitId::parse(id).unwrap(),
            Phases {
                mutation: vec![Step::write("a.txt", "a")],
                ..Default::default()
            },
        );
        ctx.store.deposit(&p).unwrap();
    }

    fn sample(depth: usize) -> SlaSample {
        SlaSample {
            queue_depth: depth,
            oldest_queued_secs: Some(10),
            active_run_secs: Some(600),
            restarts: [("executor".to_string(), 12)].into_iter().collect(),
            sampled_at: Utc::now(),
        }
    }

    #[test]
    fn test_evaluate_assigns_severity_from_halt_on() {
        let section = SlaSection {
            max_queue_wait_secs: Some(60),
            max_run_secs: Some(300),
            max_restarts: Some(10),
            max_queue_depth: Some(5),
            ..Default::default()
        };
        let violations = evaluate(&sample(8), &section);
        let kinds: Vec<_> = violations.iter().map(|v| v.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ViolationKind::RunDuration,
                ViolationKind::Restarts,
                ViolationKind::QueueDepth
            ]
        );
        assert_eq!(violations[0].severity, Severity::Critical);
        assert_eq!(violations[1].severity, Severity::Warning);
    }

    #[test]
    fn test_evaluate_skips_absent_thresholds() {
        assert!(evaluate(&sample(100), &SlaSection::default()).is_empty());
    }

    #[tokio::test]
    async fn test_check_mode_never_writes_control_files() {
        let (ctx, _dir) = make_ctx(SlaSection {
            max_queue_depth: Some(0),
            halt_on: vec![ViolationKind::QueueDepth],
            ..Default::default()
        });
        deposit(&ctx, "1.1-a");
        let before = json_files(&ctx.layout().queued_dir).unwrap();

        let enforcer = SlaEnforcer::new(&ctx, None);
        let first = enforcer.run(false).await.unwrap();
        let second = enforcer.run(false).await.unwrap();

        assert!(first.has_violations());
        assert_eq!(first.action, SlaAction::None);
        assert_eq!(first.sample.queue_depth, second.sample.queue_depth);
        assert!(read_halt(ctx.layout()).unwrap().is_none());
        assert!(read_backoff(ctx.layout()).unwrap().is_none());
        assert_eq!(json_files(&ctx.layout().queued_dir).unwrap(), before);
        assert!(ctx.reports.latest_path("sla").exists());
    }

    #[tokio::test]
    async fn test_enforce_critical_writes_halt() {
        let (ctx, _dir) = make_ctx(SlaSection {
            max_queue_depth: Some(0),
            halt_on: vec![ViolationKind::QueueDepth],
            ..Default::default()
        });
        deposit(&ctx, "1.1-a");

        let report = SlaEnforcer::new(&ctx, None).run(true).await.unwrap();
        assert_eq!(report.action, SlaAction::Halt);
        let halt = read_halt(ctx.layout()).unwrap().unwrap();
        assert!(halt.reason.contains("1 units pending"));

        assert!(clear_halt(ctx.layout()).unwrap());
        assert!(read_halt(ctx.layout()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enforce_warning_writes_backoff() {
        let (ctx, _dir) = make_ctx(SlaSection {
            max_restarts: Some(3),
            backoff_secs: 120,
            ..Default::default()
        });
        let sup = FakeSupervisor::with(vec![
            FakeSupervisor::process(0, "executor", ProcessStatus::Online, 7),
            FakeSupervisor::process(1, "executor", ProcessStatus::Errored, 2),
        ]);

        let report = SlaEnforcer::new(&ctx, Some(&sup)).run(true).await.unwrap();
        assert_eq!(report.sample.restarts["executor"], 7);
        assert!(matches!(report.action, SlaAction::Backoff { .. }));
        let backoff = read_backoff(ctx.layout()).unwrap().unwrap();
        assert!(backoff.until > backoff.at);
        assert!(read_halt(ctx.layout()).unwrap().is_none());
    }

    #[test]
    fn test_expired_backoff_is_ignored() {
        let (ctx, _dir) = make_ctx(SlaSection::default());
        let at = Utc::now() - ChronoDuration::seconds(120);
        let record = BackoffRecord {
            at,
            until: at + ChronoDuration::seconds(60),
            reason: "old".into(),
        };
        util::write_json_atomic(&backoff_path(ctx.layout()), &record).unwrap();
        assert!(read_backoff(ctx.layout()).unwrap().is_none());
    }
}
