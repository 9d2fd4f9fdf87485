//! Queue and sequencer commands: `submit`, `run`, `tick`, `execute`,
//! `status`, `deps`, `unblock`, `restore`.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;
use std::time::Duration;

use patchwork::deps::{DepState, Readiness, Resolver};
use patchwork::executor::{Executor, Outcome};
use patchwork::patchwork_config::ExecutorMode;
use patchwork::quarantine::Quarantine;
use patchwork::sequencer::{self, Sequencer, Tick};
use patchwork::unit::{UnitId, UnitStatus};

use super::{Status, interrupted, open_context};
use crate::Cli;

fn describe_tick(tick: &Tick) -> String {
    match tick {
        Tick::Idle => format!("{} nothing ready", style("idle").dim()),
        Tick::Halted { reason } => format!("{} {}", style("halted").red().bold(), reason),
        Tick::BackingOff { until } => {
            format!("{} until {}", style("backing off").yellow(), until)
        }
        Tick::Blocked { units } => {
            let ids: Vec<_> = units.iter().map(|u| u.to_string()).collect();
            format!("{} by {}", style("blocked").red().bold(), ids.join(", "))
        }
        Tick::Busy { unit } => match unit {
            Some(id) => format!("{} {} is active", style("busy").yellow(), id),
            None => format!("{}", style("busy").yellow()),
        },
        Tick::Completed {
            unit,
            attempts,
            via,
        } => format!(
            "{} {} ({} attempt(s), via {:?})",
            style("completed").green(),
            unit,
            attempts,
            via
        ),
        Tick::Retrying {
            unit,
            attempt,
            strategy,
        } => format!(
            "{} {} attempt {} ({})",
            style("retrying").yellow(),
            unit,
            attempt,
            strategy
        ),
        Tick::Quarantined { unit, reason } => {
            format!("{} {}: {}", style("quarantined").red().bold(), unit, reason)
        }
    }
}

fn dep_state(state: DepState) -> &'static str {
    match state {
        DepState::Completed => "completed",
        DepState::Failed => "failed",
        DepState::Staged => "staged",
        DepState::Queued => "queued",
        DepState::Dispatched => "dispatched",
        DepState::Missing => "missing",
    }
}

fn sequencer_for(ctx: &patchwork::context::PipelineContext, inline: bool) -> Sequencer<'_> {
    if inline {
        Sequencer::with_mode(ctx, ExecutorMode::Inline)
    } else {
        Sequencer::new(ctx)
    }
}

pub fn cmd_submit(project_dir: &Path, cli: &Cli, file: &Path) -> Result<Status> {
    let ctx = open_context(project_dir, cli)?;
    let path = ctx
        .store
        .deposit_file(file)
        .with_context(|| format!("Failed to submit {}", file.display()))?;
    println!("Queued {}", path.display());
    Ok(Status::Ok)
}

pub async fn cmd_run(
    project_dir: &Path,
    cli: &Cli,
    max_ticks: Option<u32>,
    inline: bool,
) -> Result<Status> {
    let ctx = open_context(project_dir, cli)?;
    let max_ticks = max_ticks.unwrap_or(ctx.settings().sequencer.max_ticks);
    let summary = sequencer_for(&ctx, inline).run(max_ticks).await?;

    for tick in &summary.ticks {
        println!("  {}", describe_tick(tick));
    }
    println!();
    println!(
        "{} tick(s), {} completed",
        summary.ticks.len(),
        summary.completed()
    );
    Ok(Status::from_clean(!summary.is_degraded()))
}

pub async fn cmd_tick(project_dir: &Path, cli: &Cli, inline: bool) -> Result<Status> {
    let ctx = open_context(project_dir, cli)?;
    let tick = sequencer_for(&ctx, inline).tick().await?;
    println!("{}", describe_tick(&tick));
    Ok(Status::from_clean(!matches!(
        tick,
        Tick::Blocked { .. } | Tick::Halted { .. } | Tick::Quarantined { .. }
    )))
}

pub async fn cmd_execute(
    project_dir: &Path,
    cli: &Cli,
    watch: bool,
    poll_ms: Option<u64>,
) -> Result<Status> {
    let ctx = open_context(project_dir, cli)?;
    let executor = Executor::new(ctx.executor_settings());
    let period = Duration::from_millis(
        poll_ms
            .unwrap_or(ctx.settings().sequencer.poll_interval_ms)
            .max(1),
    );

    let mut status = Status::Ok;
    loop {
        match executor.run_active(&ctx.store, &ctx.outcomes).await? {
            Some(record) => {
                println!("{} {}", record.unit_id, record.outcome);
                if let Some(reason) = &record.reason {
                    println!("  {}", style(reason).dim());
                }
                status = Status::from_clean(record.outcome == Outcome::Completed);
            }
            None if !watch => println!("No active unit awaiting an outcome."),
            None => {}
        }
        if !watch || interrupted(period).await {
            return Ok(status);
        }
    }
}

pub fn cmd_status(project_dir: &Path, cli: &Cli) -> Result<Status> {
    let ctx = open_context(project_dir, cli)?;
    let quarantine = Quarantine::new(&ctx);

    println!();
    println!("Patchwork Status");
    println!("================");
    println!();
    println!("State dir: {}", ctx.layout().root.display());
    println!();

    for state in [
        UnitStatus::Queued,
        UnitStatus::Staged,
        UnitStatus::Dispatched,
        UnitStatus::Completed,
        UnitStatus::Failed,
    ] {
        let entries = ctx.store.scan(state)?;
        let unreadable = entries.iter().filter(|e| e.result.is_err()).count();
        if unreadable > 0 {
            println!(
                "  {:<11} {:>4}  ({} unreadable)",
                state.as_str(),
                entries.len(),
                unreadable
            );
        } else {
            println!("  {:<11} {:>4}", state.as_str(), entries.len());
        }
    }
    println!();

    for patch in ctx.store.active()? {
        println!("Active: {}", style(&patch.id).cyan());
    }

    let markers = quarantine.markers()?;
    if markers.is_empty() {
        println!("Quarantine: empty");
    } else {
        println!("Quarantine:");
        for marker in &markers {
            println!(
                "  {} {} ({} attempts, {})",
                style("✗").red(),
                marker.unit_id,
                marker.attempts,
                marker.timestamp.format("%Y-%m-%d %H:%M:%S")
            );
            println!("      {}", style(&marker.reason).dim());
        }
    }

    for patch in ctx.store.list(UnitStatus::Failed)? {
        if markers.iter().all(|m| m.unit_id != patch.id) {
            println!(
                "Failed: {} ({})",
                patch.id,
                sequencer::describe_attempts(&ctx, &patch.id)?
            );
        }
    }

    let control = sequencer::control_state(&ctx)?;
    match &control {
        Some(state) => println!("Control: {}", style(state).yellow()),
        None => println!("Control: running"),
    }
    println!();

    Ok(Status::from_clean(markers.is_empty() && control.is_none()))
}

pub fn cmd_deps(project_dir: &Path, cli: &Cli, id: &str) -> Result<Status> {
    let ctx = open_context(project_dir, cli)?;
    let id = UnitId::parse(id)?;
    let patch = ctx.store.find(&id)?;
    let resolver = Resolver::load(&ctx.store)?;
    let resolution = resolver.resolve(&patch);

    println!("{} ({})", style(&patch.id).bold(), patch.status);
    if resolution.dependencies.is_empty() {
        println!("  no dependencies");
    }
    for dep in &resolution.dependencies {
        let mark = if dep.state == DepState::Completed {
            style("✓").green()
        } else {
            style("·").yellow()
        };
        println!(
            "  {} {} [{}] {:?}",
            mark,
            dep.id,
            dep_state(dep.state),
            dep.source
        );
    }
    let verdict = match resolution.readiness {
        Readiness::Ready => style("ready").green(),
        Readiness::Waiting => style("waiting").yellow(),
        Readiness::BlockedOnDependency => style("blocked on a dependency").red(),
        Readiness::Cyclic => style("part of a dependency cycle").red(),
    };
    println!("  => {}", verdict);

    Ok(Status::from_clean(!matches!(
        resolution.readiness,
        Readiness::BlockedOnDependency | Readiness::Cyclic
    )))
}

pub fn cmd_unblock(project_dir: &Path, cli: &Cli, id: &str) -> Result<Status> {
    let ctx = open_context(project_dir, cli)?;
    let id = UnitId::parse(id)?;
    if !Quarantine::new(&ctx).clear(&id)? {
        bail!("No blocked marker for {}", id);
    }
    println!("Cleared blocked marker for {}", id);
    println!("The unit stays in the failed store; use `patchwork restore {}` to retry it.", id);
    Ok(Status::Ok)
}

pub fn cmd_restore(project_dir: &Path, cli: &Cli, id: &str) -> Result<Status> {
    let ctx = open_context(project_dir, cli)?;
    let id = UnitId::parse(id)?;
    let patch = Quarantine::new(&ctx).restore(&id)?;
    println!("Restored {} to {}", patch.id, patch.status);
    Ok(Status::Ok)
}
