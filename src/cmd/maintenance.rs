//! Periodic maintenance: `patchwork sla`, `patchwork hygiene`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::time::Duration;

use patchwork::context::PipelineContext;
use patchwork::fleet::{Pm2Supervisor, Supervisor};
use patchwork::hygiene::{EntryClass, Hygiene};
use patchwork::sla::{self, Severity, SlaAction, SlaEnforcer};

use super::{Status, interrupted, open_context};
use crate::Cli;

async fn sla_once(
    ctx: &PipelineContext,
    supervisor: Option<&dyn Supervisor>,
    enforce: bool,
) -> Result<Status> {
    let report = SlaEnforcer::new(ctx, supervisor).run(enforce).await?;
    let sample = &report.sample;

    println!(
        "queue depth {}, oldest queued {}, active run {}",
        sample.queue_depth,
        sample
            .oldest_queued_secs
            .map(|s| format!("{}s", s))
            .unwrap_or_else(|| "-".into()),
        sample
            .active_run_secs
            .map(|s| format!("{}s", s))
            .unwrap_or_else(|| "-".into()),
    );
    for v in &report.violations {
        let label = match v.severity {
            Severity::Critical => style("CRITICAL").red().bold(),
            Severity::Warning => style("WARNING").yellow(),
        };
        println!(
            "  {} {}: {} > {} ({})",
            label, v.kind, v.observed, v.threshold, v.detail
        );
    }
    match &report.action {
        SlaAction::None if report.has_violations() && !enforce => {
            println!("Dry run; pass --enforce to write control records.")
        }
        SlaAction::None => {}
        SlaAction::Backoff { until } => {
            println!("{} until {}", style("Backing off").yellow(), until)
        }
        SlaAction::Halt => println!(
            "{} dispatch halted; clear with `patchwork sla --clear-halt`",
            style("HALT").red().bold()
        ),
    }
    if !report.has_violations() {
        println!("{}", style("Within SLA").green());
    }
    Ok(Status::from_clean(!report.has_violations()))
}

pub async fn cmd_sla(
    project_dir: &Path,
    cli: &Cli,
    enforce: bool,
    interval: Option<u64>,
    clear_halt: bool,
) -> Result<Status> {
    let ctx = open_context(project_dir, cli)?;

    if clear_halt {
        if sla::clear_halt(ctx.layout())? {
            println!("Halt cleared.");
        } else {
            println!("No halt in place.");
        }
        return Ok(Status::Ok);
    }

    // Restart counts are only sampled when there are services to watch.
    let fleet = &ctx.settings().fleet;
    let pm2 = (!fleet.services.is_empty()).then(|| {
        Pm2Supervisor::new(
            &fleet.supervisor_cmd,
            Duration::from_secs(fleet.command_timeout_secs),
        )
    });
    let supervisor = pm2.as_ref().map(|s| s as &dyn Supervisor);

    loop {
        let status = sla_once(&ctx, supervisor, enforce).await?;
        let Some(secs) = interval else {
            return Ok(status);
        };
        if interrupted(Duration::from_secs(secs)).await {
            return Ok(status);
        }
    }
}

pub async fn cmd_hygiene(
    project_dir: &Path,
    cli: &Cli,
    apply: bool,
    max: Option<usize>,
    interval: Option<u64>,
) -> Result<Status> {
    let ctx = open_context(project_dir, cli)?;

    loop {
        let report = Hygiene::new(&ctx).run(apply, max)?;
        println!(
            "Scanned {} queue entries, {} candidate(s), cap {}",
            report.scanned,
            report.plan.len(),
            report.max_removals
        );
        for entry in &report.plan {
            let class = match entry.class {
                EntryClass::Corrupt => style("corrupt").red(),
                EntryClass::Stale => style("stale").yellow(),
            };
            let action = if !apply {
                "would remove"
            } else if entry.trashed_to.is_some() {
                "removed"
            } else if entry.vanished {
                "gone"
            } else {
                "kept (cap)"
            };
            println!(
                "  {:<12} {} {} ({}, {}s old)",
                action,
                class,
                entry.path.display(),
                entry.reason,
                entry.age_secs
            );
        }
        if !apply && !report.plan.is_empty() {
            println!("Dry run; pass --apply to move entries to the trash.");
        }

        let Some(secs) = interval else {
            return Ok(Status::Ok);
        };
        if interrupted(Duration::from_secs(secs)).await {
            return Ok(Status::Ok);
        }
    }
}
