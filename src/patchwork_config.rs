//! Unified configuration file for patchwork.
//!
//! Reads `.patchwork/patchwork.toml`. Every field has a default, so an absent
//! file or an empty section is valid. Layering is file → environment → CLI:
//! the CLI layer is applied by [`crate::config::Config`].
//!
//! # Configuration File Format
//!
//! ```toml
//! [sequencer]
//! max_retries = 3
//! poll_interval_ms = 500
//! dispatch_timeout_secs = 900
//! step_timeout_secs = 300
//! soft_validate = false
//! executor = "external"
//!
//! [repair]
//! builtin_transforms = true
//! builtin_families = true
//!
//! [[repair.safe_transforms]]
//! name = "no-force-push"
//! pattern = "git push --force"
//! replacement = "git push"
//! applies_to = "command"
//!
//! [[repair.families]]
//! name = "lockfile"
//! reason_pattern = "lock file"
//! edits = [{ kind = "extend_timeouts", factor = 2 }]
//!
//! [integrity]
//! algorithm = "sha256"
//! tracked = ["config/*.toml", "deploy/"]
//!
//! [fleet]
//! supervisor_cmd = "pm2"
//! max_cycles = 3
//!
//! [[fleet.services]]
//! name = "executor"
//! command = "patchwork execute --watch"
//!
//! [sla]
//! max_queue_wait_secs = 3600
//! max_run_secs = 1800
//! max_restarts = 10
//! max_queue_depth = 50
//! backoff_secs = 60
//! halt_on = ["run_duration"]
//!
//! [hygiene]
//! stale_after_secs = 86400
//! min_size_bytes = 16
//! max_removals = 10
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::fleet::ServiceSpec;
use crate::integrity::DigestAlgorithm;
use crate::repair::manual::RepairEdit;
use crate::sla::ViolationKind;

/// File name of the configuration inside the state directory.
pub const CONFIG_FILE: &str = "patchwork.toml";

/// How dispatched units reach an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorMode {
    /// Another process watches the active queue and writes outcome files.
    #[default]
    External,
    /// The built-in executor runs the active unit inside the sequencer process.
    Inline,
}

impl std::fmt::Display for ExecutorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorMode::External => write!(f, "external"),
            ExecutorMode::Inline => write!(f, "inline"),
        }
    }
}

impl std::str::FromStr for ExecutorMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "external" => Ok(ExecutorMode::External),
            "inline" => Ok(ExecutorMode::Inline),
            _ => anyhow::bail!("Invalid executor mode '{}'. Valid values: external, inline", s),
        }
    }
}

/// Sequencer and executor bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerSection {
    /// Maximum repair attempts before a unit is quarantined
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Sleep between outcome polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long to wait for an executor outcome before treating it as unknown
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
    /// Default per-step timeout for command steps
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Whether validate-phase failures are logged instead of failing the attempt
    #[serde(default)]
    pub soft_validate: bool,
    /// Executor mode
    #[serde(default)]
    pub executor: ExecutorMode,
    /// Tick ceiling for one `run` invocation
    #[serde(default = "default_max_ticks")]
    pub max_ticks: u32,
    /// Directory that command steps run in and mutation targets resolve against.
    /// Relative paths are resolved against the project directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_dispatch_timeout_secs() -> u64 {
    900
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_max_ticks() -> u32 {
    100
}

impl Default for SequencerSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            poll_interval_ms: default_poll_interval_ms(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
            step_timeout_secs: default_step_timeout_secs(),
            soft_validate: false,
            executor: ExecutorMode::default(),
            max_ticks: default_max_ticks(),
            workspace: None,
        }
    }
}

/// Which part of a unit a safe-transform rule rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformTarget {
    /// Command step text
    Command,
    /// Mutation task content
    Content,
    #[default]
    Both,
}

/// A user-defined safe-transform rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformRuleConfig {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
    #[serde(default)]
    pub applies_to: TransformTarget,
}

/// A user-defined failure family for guided manual repair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyConfig {
    pub name: String,
    /// Regex matched against the unit id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_pattern: Option<String>,
    /// Regex matched against the failure reason and output tail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_pattern: Option<String>,
    /// Only match failures in this phase (camelCase phase name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default)]
    pub edits: Vec<RepairEdit>,
}

/// Repair strategy table configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairSection {
    /// Include the built-in normalization rules
    #[serde(default = "default_true")]
    pub builtin_transforms: bool,
    /// Include the built-in failure families
    #[serde(default = "default_true")]
    pub builtin_families: bool,
    #[serde(default)]
    pub safe_transforms: Vec<TransformRuleConfig>,
    #[serde(default)]
    pub families: Vec<FamilyConfig>,
}

fn default_true() -> bool {
    true
}

impl Default for RepairSection {
    fn default() -> Self {
        Self {
            builtin_transforms: true,
            builtin_families: true,
            safe_transforms: Vec::new(),
            families: Vec::new(),
        }
    }
}

/// Checksum lock configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegritySection {
    #[serde(default)]
    pub algorithm: DigestAlgorithm,
    /// Files, directories or glob patterns relative to the project directory
    #[serde(default)]
    pub tracked: Vec<String>,
}

/// Fleet healer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSection {
    /// Process supervisor CLI
    #[serde(default = "default_supervisor_cmd")]
    pub supervisor_cmd: String,
    /// Timeout for each supervisor command
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Polls after a start before giving up on the service for this cycle
    #[serde(default = "default_verify_polls")]
    pub verify_polls: u32,
    #[serde(default = "default_verify_interval_ms")]
    pub verify_interval_ms: u64,
    /// Lines of log captured when a service fails to come online
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
    /// Allowlisted services
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

fn default_supervisor_cmd() -> String {
    "pm2".to_string()
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_max_cycles() -> u32 {
    3
}

fn default_verify_polls() -> u32 {
    10
}

fn default_verify_interval_ms() -> u64 {
    1000
}

fn default_log_tail_lines() -> usize {
    50
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            supervisor_cmd: default_supervisor_cmd(),
            command_timeout_secs: default_command_timeout_secs(),
            max_cycles: default_max_cycles(),
            verify_polls: default_verify_polls(),
            verify_interval_ms: default_verify_interval_ms(),
            log_tail_lines: default_log_tail_lines(),
            services: Vec::new(),
        }
    }
}

/// SLA thresholds. An absent threshold is not checked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue_wait_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_run_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue_depth: Option<usize>,
    /// Dispatch delay applied on a non-critical violation
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    /// Violation kinds that trigger an emergency halt
    #[serde(default = "default_halt_on")]
    pub halt_on: Vec<ViolationKind>,
}

fn default_backoff_secs() -> u64 {
    60
}

fn default_halt_on() -> Vec<ViolationKind> {
    vec![ViolationKind::RunDuration]
}

impl Default for SlaSection {
    fn default() -> Self {
        Self {
            max_queue_wait_secs: None,
            max_run_secs: None,
            max_restarts: None,
            max_queue_depth: None,
            backoff_secs: default_backoff_secs(),
            halt_on: default_halt_on(),
        }
    }
}

/// Queue hygiene configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HygieneSection {
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Entries smaller than this are implausible and treated as corrupt
    #[serde(default = "default_min_size_bytes")]
    pub min_size_bytes: u64,
    /// Upper bound on removals per apply-mode invocation
    #[serde(default = "default_max_removals")]
    pub max_removals: usize,
}

fn default_stale_after_secs() -> u64 {
    86_400
}

fn default_min_size_bytes() -> u64 {
    16
}

fn default_max_removals() -> usize {
    10
}

impl Default for HygieneSection {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            min_size_bytes: default_min_size_bytes(),
            max_removals: default_max_removals(),
        }
    }
}

/// The complete patchwork.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchworkToml {
    #[serde(default)]
    pub sequencer: SequencerSection,
    #[serde(default)]
    pub repair: RepairSection,
    #[serde(default)]
    pub integrity: IntegritySection,
    #[serde(default)]
    pub fleet: FleetSection,
    #[serde(default)]
    pub sla: SlaSection,
    #[serde(default)]
    pub hygiene: HygieneSection,
}

impl PatchworkToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse patchwork.toml")
    }

    /// Load configuration from `<state_dir>/patchwork.toml`.
    /// Returns default configuration if the file doesn't exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize patchwork.toml")?;
        crate::util::write_atomic(path, content.as_bytes())
    }

    /// Apply environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        if let Some(n) = std::env::var("PATCHWORK_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            self.sequencer.max_retries = n;
        }
        if let Ok(cmd) = std::env::var("PATCHWORK_SUPERVISOR_CMD")
            && !cmd.trim().is_empty()
        {
            self.fleet.supervisor_cmd = cmd;
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.sequencer.max_retries == 0 {
            warnings.push(
                "sequencer.max_retries is 0: every failure will be quarantined immediately"
                    .to_string(),
            );
        }
        if self.sequencer.poll_interval_ms == 0 {
            warnings.push("sequencer.poll_interval_ms must be greater than 0".to_string());
        }
        if self.fleet.max_cycles == 0 {
            warnings.push("fleet.max_cycles is 0: the healer will never act".to_string());
        }

        for rule in &self.repair.safe_transforms {
            if let Err(e) = regex::Regex::new(&rule.pattern) {
                warnings.push(format!(
                    "Invalid pattern in safe transform '{}': {}",
                    rule.name, e
                ));
            }
        }

        for family in &self.repair.families {
            for pattern in [&family.id_pattern, &family.reason_pattern]
                .into_iter()
                .flatten()
            {
                if let Err(e) = regex::Regex::new(pattern) {
                    warnings.push(format!(
                        "Invalid pattern in repair family '{}': {}",
                        family.name, e
                    ));
                }
            }
            if let Some(ref phase) = family.phase
                && crate::unit::PhaseKind::from_name(phase).is_none()
            {
                warnings.push(format!(
                    "Unknown phase '{}' in repair family '{}'",
                    phase, family.name
                ));
            }
            if family.edits.is_empty() {
                warnings.push(format!("Repair family '{}' has no edits", family.name));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for service in &self.fleet.services {
            if !seen.insert(service.name.as_str()) {
                warnings.push(format!("Duplicate fleet service '{}'", service.name));
            }
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = PatchworkToml::parse("").unwrap();
        assert_eq!(config.sequencer.max_retries, 3);
        assert_eq!(config.sequencer.executor, ExecutorMode::External);
        assert!(!config.sequencer.soft_validate);
        assert!(config.repair.builtin_families);
        assert_eq!(config.fleet.supervisor_cmd, "pm2");
        assert_eq!(config.hygiene.max_removals, 10);
        assert_eq!(config.sla.halt_on, vec![ViolationKind::RunDuration]);
    }

    #[test]
    fn test_parse_full_config() {
        let content = r#"
[sequencer]
max_retries = 5
soft_validate = true
executor = "inline"

[[repair.safe_transforms]]
name = "no-force"
pattern = "--force"
applies_to = "command"

[[repair.families]]
name = "lockfile"
reason_pattern = "lock file"
edits = [{ kind = "extend_timeouts", factor = 3 }]

[integrity]
algorithm = "sha512"
tracked = ["conf/*.toml"]

[[fleet.services]]
name = "executor"
command = "patchwork execute --watch"

[sla]
max_queue_depth = 20
halt_on = ["queue_depth", "restarts"]
"#;
        let config = PatchworkToml::parse(content).unwrap();
        assert_eq!(config.sequencer.max_retries, 5);
        assert!(config.sequencer.soft_validate);
        assert_eq!(config.sequencer.executor, ExecutorMode::Inline);
        assert_eq!(config.repair.safe_transforms.len(), 1);
        assert_eq!(
            config.repair.safe_transforms[0].applies_to,
            TransformTarget::Command
        );
        assert_eq!(config.repair.families[0].edits.len(), 1);
        assert_eq!(config.integrity.algorithm, DigestAlgorithm::Sha512);
        assert_eq!(config.fleet.services[0].name, "executor");
        assert_eq!(config.sla.max_queue_depth, Some(20));
        assert_eq!(config.sla.halt_on.len(), 2);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_validate_reports_bad_regex_and_duplicates() {
        let content = r#"
[[repair.safe_transforms]]
name = "broken"
pattern = "("

[[fleet.services]]
name = "a"
command = "x"

[[fleet.services]]
name = "a"
command = "y"
"#;
        let config = PatchworkToml::parse(content).unwrap();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("broken")));
        assert!(warnings.iter().any(|w| w.contains("Duplicate fleet service")));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let mut config = PatchworkToml::default();
        config.sequencer.max_retries = 7;
        let path = dir.path().join(CONFIG_FILE);
        config.save(&path).unwrap();

        let loaded = PatchworkToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.sequencer.max_retries, 7);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let config = PatchworkToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config.sequencer.max_retries, 3);
    }

    #[test]
    fn test_executor_mode_from_str() {
        assert_eq!("inline".parse::<ExecutorMode>().unwrap(), ExecutorMode::Inline);
        assert_eq!(
            "EXTERNAL".parse::<ExecutorMode>().unwrap(),
            ExecutorMode::External
        );
        assert!("nope".parse::<ExecutorMode>().is_err());
    }
}
