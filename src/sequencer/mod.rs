//! The sequencer: a single-active-unit scheduler.
//!
//! Each [`Sequencer::tick`] makes one decision: self-heal quarantined units,
//! honour blocked markers and SLA control records, pick the lowest-keyed ready
//! unit, dispatch it into the active queue, wait (bounded) for its outcome and
//! hand failures to the repair loop.
//!
//! While any blocked marker exists nothing is dispatched.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::context::PipelineContext;
use crate::deps::Resolver;
use crate::errors::UnitError;
use crate::executor::{Executor, Outcome, OutcomeRecord};
use crate::patchwork_config::ExecutorMode;
use crate::quarantine::Quarantine;
use crate::repair::{RepairDecision, RepairLoop};
use crate::sla;
use crate::unit::{Completion, CompletionSource, Patch, UnitId, UnitStatus};

/// Result of one decision step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tick", rename_all = "snake_case")]
pub enum Tick {
    /// Nothing is ready
    Idle,
    Halted { reason: String },
    BackingOff { until: DateTime<Utc> },
    /// Blocked markers exist
    Blocked { units: Vec<UnitId> },
    /// The active queue is occupied
    Busy {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<UnitId>,
    },
    Completed {
        unit: UnitId,
        attempts: u32,
        via: CompletionSource,
    },
    Retrying {
        unit: UnitId,
        attempt: u32,
        strategy: String,
    },
    Quarantined { unit: UnitId, reason: String },
}

impl Tick {
    /// Whether another tick right away could make progress.
    pub fn made_progress(&self) -> bool {
        matches!(
            self,
            Tick::Completed { .. } | Tick::Retrying { .. } | Tick::Quarantined { .. }
        )
    }

    fn from_decision(unit: UnitId, decision: RepairDecision) -> Self {
        match decision {
            RepairDecision::Completed { attempts } => Tick::Completed {
                unit,
                attempts,
                via: CompletionSource::QuickWin,
            },
            RepairDecision::Retrying { attempt, strategy } => Tick::Retrying {
                unit,
                attempt,
                strategy,
            },
            RepairDecision::Quarantined { reason, .. } => Tick::Quarantined { unit, reason },
        }
    }
}

/// Outcome of [`Sequencer::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Dispatched,
    /// The active queue already holds a unit; nothing was moved
    Busy,
}

/// Body of the `sequencer` report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: ExecutorMode,
    pub max_ticks: u32,
    pub ticks: Vec<Tick>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    pub fn last(&self) -> Option<&Tick> {
        self.ticks.last()
    }

    pub fn completed(&self) -> usize {
        self.ticks
            .iter()
            .filter(|t| matches!(t, Tick::Completed { .. }))
            .count()
    }

    /// Whether the run ended blocked, halted or with quarantines.
    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
            || self.ticks.iter().any(|t| {
                matches!(
                    t,
                    Tick::Blocked { .. } | Tick::Halted { .. } | Tick::Quarantined { .. }
                )
            })
    }
}

pub struct Sequencer<'a> {
    ctx: &'a PipelineContext,
    mode: ExecutorMode,
    repair: RepairLoop<'a>,
    quarantine: Quarantine<'a>,
}

impl<'a> Sequencer<'a> {
    pub fn new(ctx: &'a PipelineContext) -> Self {
        Self::with_mode(ctx, ctx.settings().sequencer.executor)
    }

    pub fn with_mode(ctx: &'a PipelineContext, mode: ExecutorMode) -> Self {
        Self {
            ctx,
            mode,
            repair: RepairLoop::new(ctx),
            quarantine: Quarantine::new(ctx),
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.ctx.settings().sequencer.poll_interval_ms.max(1))
    }

    fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.ctx.settings().sequencer.dispatch_timeout_secs)
    }

    /// Lowest-keyed dependency-ready unit in `queued ∪ staged`.
    ///
    /// Returns `None` while any blocked marker or SLA halt exists. Writes the
    /// `dependencies` report.
    pub fn select_candidate(&self) -> Result<Option<Patch>> {
        if self.quarantine.has_markers()? {
            return Ok(None);
        }
        if sla::read_halt(self.ctx.layout())?.is_some() {
            return Ok(None);
        }

        let resolver = Resolver::load(&self.ctx.store)?;
        let report = resolver.report()?;
        self.ctx.reports.write("dependencies", &report)?;

        let mut pending = self.ctx.store.list(UnitStatus::Queued)?;
        pending.extend(self.ctx.store.list(UnitStatus::Staged)?);
        pending.sort_by(|a, b| a.id.cmp(&b.id));

        for patch in pending {
            let resolution = resolver.resolve(&patch);
            if resolution.readiness.is_ready() {
                return Ok(Some(patch));
            }
            tracing::debug!(unit = %patch.id, readiness = ?resolution.readiness, "skipping unit");
        }
        Ok(None)
    }

    /// Move a unit into the active queue. A no-op while the queue is occupied.
    pub fn dispatch(&self, patch: &mut Patch) -> Result<Dispatch> {
        if !self.ctx.store.active_is_empty()? {
            return Ok(Dispatch::Busy);
        }
        if patch.status == UnitStatus::Queued {
            self.ctx.store.transition(patch, UnitStatus::Staged)?;
        }
        self.ctx.outcomes.clear(&patch.id)?;
        self.ctx.store.transition(patch, UnitStatus::Dispatched)?;
        tracing::info!(unit = %patch.id, "unit dispatched");
        Ok(Dispatch::Dispatched)
    }

    /// Poll for the unit's outcome until `dispatch_timeout`; unknown after.
    pub async fn await_outcome(&self, id: &UnitId) -> Result<OutcomeRecord> {
        self.await_outcome_for(id, self.dispatch_timeout()).await
    }

    async fn await_outcome_for(&self, id: &UnitId, limit: Duration) -> Result<OutcomeRecord> {
        let deadline = Instant::now() + limit;
        let interval = self.poll_interval();
        loop {
            if let Some(record) = self.ctx.outcomes.read(id)? {
                return Ok(record);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }

        tracing::warn!(unit = %id, secs = limit.as_secs(), "no outcome before dispatch timeout");
        let record = OutcomeRecord::unresolved(id.clone());
        self.ctx.outcomes.write(&record)?;
        Ok(record)
    }

    /// One decision step.
    pub async fn tick(&self) -> Result<Tick> {
        let healed = self.quarantine.self_heal().await?;
        if !healed.is_empty() {
            tracing::info!(units = ?healed, "blocked units cleared by quick-win recheck");
        }

        if self.quarantine.has_markers()? {
            let units = self
                .quarantine
                .markers()?
                .into_iter()
                .map(|m| m.unit_id)
                .collect();
            return Ok(Tick::Blocked { units });
        }
        if let Some(halt) = sla::read_halt(self.ctx.layout())? {
            return Ok(Tick::Halted {
                reason: halt.reason,
            });
        }
        if let Some(backoff) = sla::read_backoff(self.ctx.layout())? {
            return Ok(Tick::BackingOff {
                until: backoff.until,
            });
        }

        if !self.ctx.store.active_is_empty()? {
            return self.resume_active().await;
        }

        if let Some(tick) = self.structural_intake().await? {
            return Ok(tick);
        }

        let Some(mut patch) = self.select_candidate()? else {
            return Ok(Tick::Idle);
        };
        if self.dispatch(&mut patch)? == Dispatch::Busy {
            return Ok(Tick::Busy {
                unit: Some(patch.id),
            });
        }

        if self.mode == ExecutorMode::Inline {
            self.run_inline().await?;
        }
        let outcome = self.await_outcome(&patch.id).await?;
        self.finish(patch, outcome).await
    }

    /// A unit was left in the active queue by an earlier invocation.
    async fn resume_active(&self) -> Result<Tick> {
        let Some(patch) = self.ctx.store.active()?.into_iter().next() else {
            return Ok(Tick::Busy { unit: None });
        };

        if let Some(outcome) = self.ctx.outcomes.read(&patch.id)? {
            return self.finish(patch, outcome).await;
        }
        if self.mode == ExecutorMode::Inline {
            self.run_inline().await?;
            let outcome = self.await_outcome(&patch.id).await?;
            return self.finish(patch, outcome).await;
        }

        // Dispatch time is the active file's mtime.
        let path = self.ctx.store.path_for(&patch.id, UnitStatus::Dispatched);
        let elapsed = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or_default();
        if elapsed >= self.dispatch_timeout() {
            let outcome = self.await_outcome_for(&patch.id, Duration::ZERO).await?;
            return self.finish(patch, outcome).await;
        }
        Ok(Tick::Busy {
            unit: Some(patch.id),
        })
    }

    async fn run_inline(&self) -> Result<()> {
        Executor::new(self.ctx.executor_settings())
            .run_active(&self.ctx.store, &self.ctx.outcomes)
            .await?;
        Ok(())
    }

    /// Route one parseable but structurally invalid pending unit through the
    /// repair loop.
    async fn structural_intake(&self) -> Result<Option<Tick>> {
        for status in [UnitStatus::Queued, UnitStatus::Staged] {
            for entry in self.ctx.store.scan(status)? {
                let reason = match entry.result {
                    Ok(_) => continue,
                    Err(UnitError::Malformed { reason, .. }) => reason,
                    Err(e) => {
                        tracing::warn!(path = %entry.path.display(), error = %e, "unreadable unit left for hygiene");
                        continue;
                    }
                };
                let mut patch = match self.ctx.store.load_raw(&entry.path) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(path = %entry.path.display(), error = %e, "unreadable unit left for hygiene");
                        continue;
                    }
                };
                tracing::error!(unit = %patch.id, reason = %reason, "structurally invalid unit at intake");

                patch.status = status;
                if status == UnitStatus::Queued {
                    self.ctx.store.transition(&mut patch, UnitStatus::Staged)?;
                }
                self.ctx.store.transition(&mut patch, UnitStatus::Failed)?;
                let outcome = OutcomeRecord::failed(patch.id.clone(), format!("structural: {}", reason));
                let id = patch.id.clone();
                let decision = self.repair.handle_failure(patch, &outcome).await?;
                return Ok(Some(Tick::from_decision(id, decision)));
            }
        }
        Ok(None)
    }

    /// Complete the unit or hand the failure to the repair loop.
    async fn finish(&self, mut patch: Patch, outcome: OutcomeRecord) -> Result<Tick> {
        if outcome.outcome == Outcome::Completed {
            let attempts = self.ctx.retries.attempts(&patch.id)?;
            patch.completion = Some(Completion {
                completed_at: outcome.finished_at,
                attempts,
                via: CompletionSource::Executor,
            });
            self.ctx.store.transition(&mut patch, UnitStatus::Completed)?;
            self.ctx.retries.remove(&patch.id)?;
            self.ctx.store.remove_snapshot(&patch.id)?;
            for soft in &outcome.soft_failures {
                tracing::warn!(unit = %patch.id, step = %soft.step, reason = %soft.reason, "soft validate failure");
            }
            tracing::info!(unit = %patch.id, attempts, "unit completed");
            return Ok(Tick::Completed {
                unit: patch.id,
                attempts,
                via: CompletionSource::Executor,
            });
        }

        tracing::warn!(
            unit = %patch.id,
            outcome = %outcome.outcome,
            reason = outcome.reason.as_deref().unwrap_or(""),
            "attempt failed"
        );
        self.ctx.store.transition(&mut patch, UnitStatus::Failed)?;
        let id = patch.id.clone();
        let decision = self.repair.handle_failure(patch, &outcome).await?;
        Ok(Tick::from_decision(id, decision))
    }

    /// Tick until nothing more can happen now or `max_ticks` is reached.
    ///
    /// The `sequencer` report is written on every exit path.
    pub async fn run(&self, max_ticks: u32) -> Result<RunSummary> {
        let mut summary = RunSummary {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            mode: self.mode,
            max_ticks,
            ticks: Vec::new(),
            error: None,
        };

        let mut result = Ok(());
        for _ in 0..max_ticks {
            match self.tick().await {
                Ok(tick) => {
                    tracing::debug!(?tick, "tick");
                    let progress = tick.made_progress();
                    summary.ticks.push(tick);
                    if !progress {
                        break;
                    }
                }
                Err(e) => {
                    summary.error = Some(format!("{:#}", e));
                    result = Err(e);
                    break;
                }
            }
        }
        if summary.ticks.len() as u32 >= max_ticks && summary.error.is_none() {
            tracing::info!(max_ticks, "tick ceiling reached");
        }

        summary.finished_at = Utc::now();
        self.ctx
            .reports
            .write("sequencer", &summary)
            .context("Failed to write sequencer report")?;
        result.map(|()| summary)
    }
}

/// Read a unit's retry state into a short status line.
pub fn describe_attempts(ctx: &PipelineContext, id: &UnitId) -> Result<String> {
    Ok(match ctx.retries.load(id)? {
        Some(state) => format!(
            "{} / {} attempts",
            state.attempts,
            ctx.settings().sequencer.max_retries
        ),
        None => "no failures".to_string(),
    })
}

/// Whether a halt or backoff currently applies, for status output.
pub fn control_state(ctx: &PipelineContext) -> Result<Option<String>> {
    if let Some(halt) = sla::read_halt(ctx.layout())? {
        return Ok(Some(format!("halted since {}: {}", halt.at, halt.reason)));
    }
    if let Some(backoff) = sla::read_backoff(ctx.layout())? {
        return Ok(Some(format!("backing off until {}", backoff.until)));
    }
    Ok(None)
}
