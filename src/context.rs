//! Shared handles for one pipeline invocation.

use anyhow::Result;
use std::time::Duration;

use crate::config::{Config, Layout};
use crate::executor::{ExecutorSettings, OutcomeStore};
use crate::patchwork_config::PatchworkToml;
use crate::repair::RetryStateStore;
use crate::report::ReportWriter;
use crate::unit::UnitStore;

/// Everything a component needs, passed explicitly.
pub struct PipelineContext {
    pub config: Config,
    pub store: UnitStore,
    pub outcomes: OutcomeStore,
    pub retries: RetryStateStore,
    pub reports: ReportWriter,
}

impl PipelineContext {
    pub fn new(config: Config) -> Self {
        let layout = config.layout.clone();
        Self {
            outcomes: OutcomeStore::new(&layout.outcomes_dir),
            retries: RetryStateStore::new(&layout.retries_dir),
            reports: ReportWriter::new(&layout.reports_dir),
            store: UnitStore::new(layout),
            config,
        }
    }

    /// Build a context and create the state directories.
    pub fn open(config: Config) -> Result<Self> {
        config.ensure_directories()?;
        Ok(Self::new(config))
    }

    pub fn layout(&self) -> &Layout {
        &self.config.layout
    }

    pub fn settings(&self) -> &PatchworkToml {
        &self.config.settings
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings::from_config(&self.config)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.settings().sequencer.step_timeout_secs)
    }
}
