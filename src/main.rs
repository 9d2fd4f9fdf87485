use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use patchwork::telemetry::{TelemetryOptions, init_tracing};

mod cmd;

use cmd::Status;

#[derive(Parser)]
#[command(name = "patchwork")]
#[command(version, about = "Sequence, execute, repair and quarantine versioned patch units")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json: bool,

    #[arg(long, global = true, env = "PATCHWORK_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the .patchwork state directory
    Init,
    /// Deposit a unit file into the queue
    Submit { file: PathBuf },
    /// Tick the sequencer until idle, blocked or halted
    Run {
        /// Tick ceiling (defaults to sequencer.max_ticks)
        #[arg(long)]
        max_ticks: Option<u32>,
        /// Run dispatched units with the built-in executor
        #[arg(long)]
        inline: bool,
    },
    /// Make a single sequencer decision
    Tick {
        #[arg(long)]
        inline: bool,
    },
    /// Run the built-in executor against the active queue
    Execute {
        /// Keep watching the active queue until interrupted
        #[arg(long)]
        watch: bool,
        /// Poll interval in milliseconds while watching
        #[arg(long)]
        poll_ms: Option<u64>,
    },
    /// Show queue, quarantine and control state
    Status,
    /// Show how a unit's dependencies resolve
    Deps { id: String },
    /// Delete a unit's blocked marker, leaving the unit in the failed store
    Unblock { id: String },
    /// Roll a quarantined unit back to its snapshot and re-stage it
    Restore { id: String },
    /// Write a checksum manifest for tracked files
    Lock {
        /// Files, directories or globs (defaults to integrity.tracked)
        files: Vec<String>,
        /// sha256 or sha512 (defaults to integrity.algorithm)
        #[arg(long)]
        algorithm: Option<String>,
    },
    /// Verify tracked files against the checksum manifest
    Verify,
    /// Keep supervised services converged to the allowlist
    Fleet {
        #[command(subcommand)]
        command: FleetCommands,
    },
    /// Check SLA thresholds
    Sla {
        /// Write backoff/halt control records for violations
        #[arg(long)]
        enforce: bool,
        /// Repeat every N seconds until interrupted
        #[arg(long)]
        interval: Option<u64>,
        /// Remove an emergency halt and exit
        #[arg(long)]
        clear_halt: bool,
    },
    /// Remove stale or corrupt queue entries
    Hygiene {
        /// Move entries to the trash (default is a dry run)
        #[arg(long)]
        apply: bool,
        /// Removal cap for this invocation (defaults to hygiene.max_removals)
        #[arg(long)]
        max: Option<usize>,
        #[arg(long)]
        interval: Option<u64>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum FleetCommands {
    /// Dedupe, recover and verify allowlisted services
    Heal {
        #[arg(long)]
        interval: Option<u64>,
    },
    /// List running services outside the allowlist without acting
    Drift,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default patchwork.toml
    Init,
}

async fn dispatch(cli: &Cli) -> Result<Status> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir),
        Commands::Submit { file } => cmd::cmd_submit(&project_dir, cli, file),
        Commands::Run { max_ticks, inline } => {
            cmd::cmd_run(&project_dir, cli, *max_ticks, *inline).await
        }
        Commands::Tick { inline } => cmd::cmd_tick(&project_dir, cli, *inline).await,
        Commands::Execute { watch, poll_ms } => {
            cmd::cmd_execute(&project_dir, cli, *watch, *poll_ms).await
        }
        Commands::Status => cmd::cmd_status(&project_dir, cli),
        Commands::Deps { id } => cmd::cmd_deps(&project_dir, cli, id),
        Commands::Unblock { id } => cmd::cmd_unblock(&project_dir, cli, id),
        Commands::Restore { id } => cmd::cmd_restore(&project_dir, cli, id),
        Commands::Lock { files, algorithm } => {
            cmd::cmd_lock(&project_dir, cli, files, algorithm.as_deref())
        }
        Commands::Verify => cmd::cmd_verify(&project_dir, cli),
        Commands::Fleet { command } => cmd::cmd_fleet(&project_dir, cli, command.clone()).await,
        Commands::Sla {
            enforce,
            interval,
            clear_halt,
        } => cmd::cmd_sla(&project_dir, cli, *enforce, *interval, *clear_halt).await,
        Commands::Hygiene {
            apply,
            max,
            interval,
        } => cmd::cmd_hygiene(&project_dir, cli, *apply, *max, *interval).await,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_dir = cli
        .project_dir
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .map(|dir| patchwork::config::Layout::new(dir.join(patchwork::config::STATE_DIR)).log_dir);
    let _guard = init_tracing(
        TelemetryOptions::from_verbosity(cli.verbose, cli.json),
        log_dir.as_deref(),
    );

    match dispatch(&cli).await {
        Ok(Status::Ok) => ExitCode::SUCCESS,
        Ok(Status::Degraded) => ExitCode::from(1),
        Err(e) => {
            eprintln!("{} {:#}", console::style("Error:").red().bold(), e);
            ExitCode::from(2)
        }
    }
}
