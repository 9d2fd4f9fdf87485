//! Supervised service reconciliation: `patchwork fleet`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::time::Duration;

use patchwork::context::PipelineContext;
use patchwork::fleet::{self, FleetHealer, Pm2Supervisor};

use super::super::FleetCommands;
use super::{Status, interrupted, open_context};
use crate::Cli;

fn supervisor(ctx: &PipelineContext) -> Pm2Supervisor {
    let section = &ctx.settings().fleet;
    Pm2Supervisor::new(
        &section.supervisor_cmd,
        Duration::from_secs(section.command_timeout_secs),
    )
}

async fn heal_once(ctx: &PipelineContext, supervisor: &Pm2Supervisor) -> Result<Status> {
    let section = &ctx.settings().fleet;
    let healer = FleetHealer::new(supervisor, section, &ctx.layout().diagnostics_dir);
    let result = healer.heal().await;
    ctx.reports
        .write("fleet", &result)
        .context("Failed to write fleet report")?;

    for action in &result.actions {
        println!("  {}", action);
    }
    for (name, state) in &result.services {
        let mark = if state.status.is_online() && state.instances == 1 {
            style("✓").green()
        } else {
            style("✗").red()
        };
        println!(
            "  {} {} ({:?}, {} instance(s))",
            mark, name, state.status, state.instances
        );
    }
    for path in &result.diagnostics {
        println!("  diagnostics: {}", path.display());
    }

    if result.converged {
        println!("{} after {} cycle(s)", style("Converged").green(), result.cycles);
    } else {
        println!(
            "{} unresolved: {}",
            style("Not converged").red().bold(),
            result.unresolved.join(", ")
        );
    }
    Ok(Status::from_clean(result.converged))
}

pub async fn cmd_fleet(project_dir: &Path, cli: &Cli, command: FleetCommands) -> Result<Status> {
    let ctx = open_context(project_dir, cli)?;
    let supervisor = supervisor(&ctx);

    match command {
        FleetCommands::Heal { interval } => loop {
            if ctx.settings().fleet.services.is_empty() {
                println!("No services configured under [[fleet.services]].");
                return Ok(Status::Ok);
            }
            let status = heal_once(&ctx, &supervisor).await?;
            let Some(secs) = interval else {
                return Ok(status);
            };
            if interrupted(Duration::from_secs(secs)).await {
                return Ok(status);
            }
        },
        FleetCommands::Drift => {
            let report = fleet::drift(&supervisor, &ctx.settings().fleet.services).await?;
            ctx.reports
                .write("fleet-drift", &report)
                .context("Failed to write fleet-drift report")?;

            for name in &report.unexpected {
                println!("  {} {} is not allowlisted", style("!").yellow(), name);
            }
            for name in &report.absent {
                println!("  {} {} is not running", style("✗").red(), name);
            }
            if report.is_clean() {
                println!("No drift.");
            }
            Ok(Status::from_clean(report.is_clean()))
        }
    }
}
