//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                          |
//! |-----------------|------------------------------------------------------------|
//! | `project`       | `Init`                                                    |
//! | `pipeline`      | `Submit`, `Run`, `Tick`, `Execute`, `Status`, `Deps`,     |
//! |                 | `Unblock`, `Restore`                                      |
//! | `integrity`     | `Lock`, `Verify`                                          |
//! | `fleet`         | `Fleet`                                                   |
//! | `maintenance`   | `Sla`, `Hygiene`                                          |
//! | `config`        | `Config`                                                  |

pub mod config;
pub mod fleet;
pub mod integrity;
pub mod maintenance;
pub mod pipeline;
pub mod project;

pub use config::cmd_config;
pub use fleet::cmd_fleet;
pub use integrity::{cmd_lock, cmd_verify};
pub use maintenance::{cmd_hygiene, cmd_sla};
pub use pipeline::{
    cmd_deps, cmd_execute, cmd_restore, cmd_status, cmd_submit, cmd_tick, cmd_unblock, cmd_run,
};
pub use project::cmd_init;

use anyhow::Result;
use std::path::Path;
use std::time::Duration;

use patchwork::config::Config;
use patchwork::context::PipelineContext;

/// How a command finished, mapped to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Exit 0
    Ok,
    /// Exit 1: the command ran but found violations, failures or blocked work
    Degraded,
}

impl Status {
    pub fn from_clean(clean: bool) -> Self {
        if clean { Status::Ok } else { Status::Degraded }
    }
}

/// Load configuration and open the state directory for a command.
pub fn open_context(project_dir: &Path, cli: &crate::Cli) -> Result<PipelineContext> {
    let config = Config::load(project_dir, cli.verbose)?;
    PipelineContext::open(config)
}

/// Sleep for `period`, returning true if Ctrl+C arrived first.
pub async fn interrupted(period: Duration) -> bool {
    tokio::select! {
        Ok(()) = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
            true
        }
        _ = tokio::time::sleep(period) => false,
    }
}
