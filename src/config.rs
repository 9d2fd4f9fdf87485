use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::patchwork_config::{CONFIG_FILE, PatchworkToml};
use crate::unit::UnitStatus;

/// Name of the state directory inside a project.
pub const STATE_DIR: &str = ".patchwork";

/// Paths of every state directory and well-known file under `.patchwork/`.
#[derive(Debug, Clone)]
pub struct Layout {
    pub root: PathBuf,
    pub config_file: PathBuf,
    pub order_manifest: PathBuf,
    pub queued_dir: PathBuf,
    pub staged_dir: PathBuf,
    pub active_dir: PathBuf,
    pub completed_dir: PathBuf,
    pub failed_dir: PathBuf,
    pub outcomes_dir: PathBuf,
    pub retries_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub blocked_dir: PathBuf,
    pub control_dir: PathBuf,
    pub integrity_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub diagnostics_dir: PathBuf,
    pub trash_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Layout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let queue = root.join("queue");
        Self {
            config_file: root.join(CONFIG_FILE),
            order_manifest: root.join("order.manifest"),
            queued_dir: queue.join("queued"),
            staged_dir: queue.join("staged"),
            active_dir: queue.join("active"),
            completed_dir: queue.join("completed"),
            failed_dir: queue.join("failed"),
            outcomes_dir: root.join("outcomes"),
            retries_dir: root.join("retries"),
            snapshots_dir: root.join("snapshots"),
            blocked_dir: root.join("blocked"),
            control_dir: root.join("control"),
            integrity_dir: root.join("integrity"),
            reports_dir: root.join("reports"),
            diagnostics_dir: root.join("fleet").join("diagnostics"),
            trash_dir: root.join("trash"),
            log_dir: root.join("logs"),
            root,
        }
    }

    /// Directory that holds units in the given lifecycle state.
    ///
    /// Blocked units live in the failed store; their marker lives in `blocked/`.
    pub fn state_dir(&self, status: UnitStatus) -> &Path {
        match status {
            UnitStatus::Queued => &self.queued_dir,
            UnitStatus::Staged => &self.staged_dir,
            UnitStatus::Dispatched => &self.active_dir,
            UnitStatus::Completed => &self.completed_dir,
            UnitStatus::Failed | UnitStatus::Blocked => &self.failed_dir,
        }
    }

    /// Every directory the pipeline writes to.
    pub fn all_dirs(&self) -> Vec<&Path> {
        vec![
            &self.queued_dir,
            &self.staged_dir,
            &self.active_dir,
            &self.completed_dir,
            &self.failed_dir,
            &self.outcomes_dir,
            &self.retries_dir,
            &self.snapshots_dir,
            &self.blocked_dir,
            &self.control_dir,
            &self.integrity_dir,
            &self.reports_dir,
            &self.diagnostics_dir,
            &self.trash_dir,
            &self.log_dir,
        ]
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in self.all_dirs() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Runtime configuration for patchwork.
///
/// Bridges the parsed `patchwork.toml` with the paths and CLI overrides of one
/// invocation. Passed explicitly to every component; nothing is cached
/// globally.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub layout: Layout,
    pub settings: PatchworkToml,
    pub verbose: bool,
}

impl Config {
    /// Load configuration for a project directory.
    ///
    /// Reads `.patchwork/patchwork.toml` (defaults if absent) and applies
    /// environment overrides.
    pub fn load(project_dir: impl AsRef<Path>, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .as_ref()
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let layout = Layout::new(project_dir.join(STATE_DIR));
        let mut settings = PatchworkToml::load_or_default(&layout.root)?;
        settings.apply_env();

        Ok(Self {
            project_dir,
            layout,
            settings,
            verbose,
        })
    }

    /// Build a configuration from already-parsed settings (no env layering).
    pub fn with_settings(project_dir: impl AsRef<Path>, settings: PatchworkToml) -> Self {
        let project_dir = project_dir.as_ref().to_path_buf();
        let layout = Layout::new(project_dir.join(STATE_DIR));
        Self {
            project_dir,
            layout,
            settings,
            verbose: false,
        }
    }

    /// Directory that command steps run in and mutation targets resolve against.
    pub fn workspace(&self) -> PathBuf {
        match self.settings.sequencer.workspace {
            Some(ref ws) if ws.is_absolute() => ws.clone(),
            Some(ref ws) => self.project_dir.join(ws),
            None => self.project_dir.clone(),
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        self.layout.ensure_directories()
    }
}
