//! Retry/repair loop.
//!
//! Handles every failed or unresolved dispatch:
//!
//! 1. snapshot the unit before its first repair;
//! 2. quick-win recheck: if the unit's effect is already present, complete it
//!    without consuming an attempt;
//! 3. quarantine once the retry budget is spent (or after one repair for a
//!    structural failure);
//! 4. otherwise pick a strategy from the table, apply it, consume exactly one
//!    attempt and re-stage the unit.

pub mod manual;
pub mod quick_win;
pub mod safe_transform;
mod state;

pub use state::{RetryHistoryEntry, RetryState, RetryStateStore};

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::context::PipelineContext;
use crate::executor::{Outcome, OutcomeRecord};
use crate::quarantine::Quarantine;
use crate::unit::{Completion, CompletionSource, Patch, UnitId, UnitStatus};
use manual::{FamilyTable, apply_edits};
use quick_win::QuickWin;
use safe_transform::SafeTransformer;

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// A step failed
    Transient,
    /// The executor never reported
    Unresolved,
    /// The unit record itself is invalid
    Structural,
}

impl FailureClass {
    pub fn classify(patch: &Patch, outcome: &OutcomeRecord) -> Self {
        if patch.validate().is_err() {
            return FailureClass::Structural;
        }
        match outcome.outcome {
            Outcome::Unknown => FailureClass::Unresolved,
            _ => FailureClass::Transient,
        }
    }
}

/// Inputs a strategy decides on.
pub struct RepairContext<'a> {
    pub class: FailureClass,
    /// Repairs already spent on this unit
    pub repairs_spent: u32,
    pub outcome: &'a OutcomeRecord,
}

/// One entry in the repair strategy table.
pub trait RepairStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn applies(&self, patch: &Patch, ctx: &RepairContext<'_>) -> bool;

    /// Edit the unit; returns a description of each change.
    fn apply(&self, patch: &mut Patch, ctx: &RepairContext<'_>) -> Vec<String>;
}

/// First repair: idempotent normalisation.
pub struct SafeTransformStrategy {
    transformer: SafeTransformer,
}

impl RepairStrategy for SafeTransformStrategy {
    fn name(&self) -> &str {
        "safe-transform"
    }

    fn applies(&self, _patch: &Patch, ctx: &RepairContext<'_>) -> bool {
        ctx.repairs_spent == 0
    }

    fn apply(&self, patch: &mut Patch, _ctx: &RepairContext<'_>) -> Vec<String> {
        self.transformer.apply(patch)
    }
}

/// Later repairs: failure-family edits.
pub struct ManualRepairStrategy {
    families: FamilyTable,
    step_timeout_secs: u64,
}

impl RepairStrategy for ManualRepairStrategy {
    fn name(&self) -> &str {
        "manual-repair"
    }

    fn applies(&self, patch: &Patch, ctx: &RepairContext<'_>) -> bool {
        ctx.repairs_spent > 0 && self.families.find(patch, ctx.outcome).is_some()
    }

    fn apply(&self, patch: &mut Patch, ctx: &RepairContext<'_>) -> Vec<String> {
        let Some(family) = self.families.find(patch, ctx.outcome).cloned() else {
            return Vec::new();
        };
        let mut changes = vec![format!("family {}", family.name)];
        changes.extend(apply_edits(patch, &family.edits, self.step_timeout_secs));
        changes
    }
}

/// Fallback: re-dispatch unchanged.
pub struct RetryAsIs;

impl RepairStrategy for RetryAsIs {
    fn name(&self) -> &str {
        "retry-as-is"
    }

    fn applies(&self, _patch: &Patch, _ctx: &RepairContext<'_>) -> bool {
        true
    }

    fn apply(&self, _patch: &mut Patch, _ctx: &RepairContext<'_>) -> Vec<String> {
        Vec::new()
    }
}

/// The default strategy table built from `[repair]`.
pub fn default_strategies(ctx: &PipelineContext) -> Vec<Box<dyn RepairStrategy>> {
    let section = &ctx.settings().repair;
    vec![
        Box::new(SafeTransformStrategy {
            transformer: SafeTransformer::from_config(section),
        }),
        Box::new(ManualRepairStrategy {
            families: FamilyTable::from_config(section),
            step_timeout_secs: ctx.settings().sequencer.step_timeout_secs,
        }),
        Box::new(RetryAsIs),
    ]
}

/// What the loop decided for a failed unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RepairDecision {
    /// Quick-win recheck passed
    Completed { attempts: u32 },
    Retrying { attempt: u32, strategy: String },
    Quarantined { attempts: u32, reason: String },
}

/// Body of the `retry-plan` report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPlan {
    pub unit_id: UnitId,
    pub class: FailureClass,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub decision: RepairDecision,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<String>,
}

pub struct RepairLoop<'a> {
    ctx: &'a PipelineContext,
    strategies: Vec<Box<dyn RepairStrategy>>,
}

impl<'a> RepairLoop<'a> {
    pub fn new(ctx: &'a PipelineContext) -> Self {
        Self {
            strategies: default_strategies(ctx),
            ctx,
        }
    }

    pub fn with_strategies(ctx: &'a PipelineContext, strategies: Vec<Box<dyn RepairStrategy>>) -> Self {
        Self { ctx, strategies }
    }

    /// Handle a failed attempt. `patch` must already be in the failed store.
    pub async fn handle_failure(
        &self,
        mut patch: Patch,
        outcome: &OutcomeRecord,
    ) -> Result<RepairDecision> {
        let max_retries = self.ctx.settings().sequencer.max_retries;
        let class = FailureClass::classify(&patch, outcome);
        let mut state = self.ctx.retries.load_or_new(&patch.id)?;
        state.last_status = UnitStatus::Failed;

        self.ctx.store.write_snapshot(&patch)?;

        let workspace = self.ctx.config.workspace();
        let quick_win = QuickWin::new(&workspace, self.ctx.step_timeout());
        if quick_win.check(&patch).await.passed() {
            let attempts = state.attempts;
            patch.completion = Some(Completion {
                completed_at: Utc::now(),
                attempts,
                via: CompletionSource::QuickWin,
            });
            self.ctx.store.transition(&mut patch, UnitStatus::Completed)?;
            self.ctx.retries.remove(&patch.id)?;
            self.ctx.store.remove_snapshot(&patch.id)?;
            let decision = RepairDecision::Completed { attempts };
            self.write_plan(&patch.id, class, outcome, &decision, Vec::new())?;
            tracing::info!(unit = %patch.id, attempts, "completed by quick-win recheck");
            return Ok(decision);
        }

        let exhausted = state.attempts >= max_retries;
        let structural_spent = class == FailureClass::Structural && state.attempts >= 1;
        if exhausted || structural_spent {
            let reason = if exhausted {
                format!(
                    "retry budget exhausted after {} repairs: {}",
                    state.attempts,
                    outcome.reason.as_deref().unwrap_or("failed")
                )
            } else {
                format!(
                    "structural failure persists after repair: {}",
                    patch
                        .validate()
                        .err()
                        .map(|e| e.to_string())
                        .unwrap_or_default()
                )
            };
            return self.quarantine(patch, state, class, outcome, reason);
        }

        let repair_ctx = RepairContext {
            class,
            repairs_spent: state.attempts,
            outcome,
        };
        let Some(strategy) = self
            .strategies
            .iter()
            .find(|s| s.applies(&patch, &repair_ctx))
        else {
            let reason = "no repair strategy applies".to_string();
            return self.quarantine(patch, state, class, outcome, reason);
        };

        let changes = strategy.apply(&mut patch, &repair_ctx);
        state.attempts += 1;
        state.last_status = UnitStatus::Staged;
        state.record(
            outcome.outcome,
            strategy.name(),
            outcome.reason.clone(),
            changes.clone(),
        );
        self.ctx.retries.save(&state)?;

        if class != FailureClass::Structural
            && let Err(e) = patch.validate()
        {
            let reason = format!("repair produced an invalid unit: {}", e);
            return self.quarantine(patch, state, class, outcome, reason);
        }

        self.ctx.store.transition(&mut patch, UnitStatus::Staged)?;
        let decision = RepairDecision::Retrying {
            attempt: state.attempts,
            strategy: strategy.name().to_string(),
        };
        self.write_plan(&patch.id, class, outcome, &decision, changes)?;
        tracing::info!(
            unit = %patch.id,
            attempt = state.attempts,
            strategy = strategy.name(),
            "unit re-staged for retry"
        );
        Ok(decision)
    }

    fn quarantine(
        &self,
        mut patch: Patch,
        mut state: RetryState,
        class: FailureClass,
        outcome: &OutcomeRecord,
        reason: String,
    ) -> Result<RepairDecision> {
        state.last_status = UnitStatus::Blocked;
        state.record(outcome.outcome, "quarantine", Some(reason.clone()), Vec::new());
        self.ctx.retries.save(&state)?;

        Quarantine::new(self.ctx).quarantine(&mut patch, &reason, state.attempts)?;
        let decision = RepairDecision::Quarantined {
            attempts: state.attempts,
            reason,
        };
        self.write_plan(&patch.id, class, outcome, &decision, Vec::new())?;
        Ok(decision)
    }

    fn write_plan(
        &self,
        unit_id: &UnitId,
        class: FailureClass,
        outcome: &OutcomeRecord,
        decision: &RepairDecision,
        changes: Vec<String>,
    ) -> Result<()> {
        let plan = RetryPlan {
            unit_id: unit_id.clone(),
            class,
            outcome: outcome.outcome,
            reason: outcome.reason.clone(),
            decision: decision.clone(),
            changes,
        };
        self.ctx.reports.write("retry-plan", &plan)?;
        Ok(())
    }
}
