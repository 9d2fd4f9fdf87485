//! `patchwork init`: create the `.patchwork/` state directory.
//!
//! ```text
//! .patchwork/
//! ├── patchwork.toml     # configuration (defaults written on first init)
//! ├── order.manifest     # optional total order, one unit id per line
//! ├── queue/{queued,staged,active,completed,failed}/
//! ├── outcomes/  retries/  snapshots/  blocked/  control/
//! ├── integrity/  reports/  fleet/diagnostics/  trash/
//! └── logs/
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{Layout, STATE_DIR};
use crate::patchwork_config::PatchworkToml;
use crate::util;

const MANIFEST_HEADER: &str = "\
# Total order of work units, one id per line.
# Every unit listed before another is an implicit dependency of it.
";

/// Result of initializing a project.
#[derive(Debug)]
pub struct InitResult {
    pub state_dir: PathBuf,
    /// False if the state directory already existed
    pub created: bool,
    /// Files written by this invocation
    pub written: Vec<PathBuf>,
}

/// Create or complete the state directory. Existing files are never
/// overwritten.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let state_dir = state_dir(project_dir);
    let created = !state_dir.exists();
    let layout = Layout::new(&state_dir);
    layout.ensure_directories()?;

    let mut written = Vec::new();
    if !layout.config_file.exists() {
        PatchworkToml::default()
            .save(&layout.config_file)
            .with_context(|| format!("Failed to write {}", layout.config_file.display()))?;
        written.push(layout.config_file.clone());
    }
    if !layout.order_manifest.exists() {
        util::write_atomic(&layout.order_manifest, MANIFEST_HEADER.as_bytes())?;
        written.push(layout.order_manifest.clone());
    }

    tracing::info!(dir = %state_dir.display(), created, "state directory ready");
    Ok(InitResult {
        state_dir,
        created,
        written,
    })
}

pub fn is_initialized(project_dir: &Path) -> bool {
    state_dir(project_dir).exists()
}

pub fn state_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(STATE_DIR)
}
