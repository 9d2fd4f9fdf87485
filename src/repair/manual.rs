//! Guided manual repair: failure families mapped to unit edits.
//!
//! A family matches a failure by unit id, failure text and failing phase; the
//! first matching family's edits are applied. Configured families are
//! consulted before the built-in ones.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::executor::OutcomeRecord;
use crate::patchwork_config::{FamilyConfig, RepairSection};
use crate::unit::{CommandStep, Patch, PhaseKind, Step};

fn default_factor() -> u32 {
    2
}

/// An edit applied to a unit by a repair family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepairEdit {
    /// Tolerate validate-phase failures for this unit
    SoftenValidate,
    /// Multiply every command timeout
    ExtendTimeouts {
        #[serde(default = "default_factor")]
        factor: u32,
    },
    /// Create the parent directories of mutation targets before mutating
    EnsureParentDirs,
    /// Regex replace in commands and mutation contents
    Replace {
        pattern: String,
        #[serde(default)]
        replacement: String,
    },
    /// Remove command steps matching the pattern
    DropSteps { pattern: String },
}

#[derive(Debug, Clone)]
pub struct FailureFamily {
    pub name: String,
    id_pattern: Option<Regex>,
    reason_pattern: Option<Regex>,
    phase: Option<PhaseKind>,
    pub edits: Vec<RepairEdit>,
}

impl FailureFamily {
    pub fn from_config(config: &FamilyConfig) -> Result<Self, String> {
        let compile = |p: &Option<String>| -> Result<Option<Regex>, String> {
            p.as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|e| e.to_string())
        };
        let phase = match config.phase {
            Some(ref name) => Some(
                PhaseKind::from_name(name).ok_or_else(|| format!("unknown phase '{}'", name))?,
            ),
            None => None,
        };
        Ok(Self {
            name: config.name.clone(),
            id_pattern: compile(&config.id_pattern)?,
            reason_pattern: compile(&config.reason_pattern)?,
            phase,
            edits: config.edits.clone(),
        })
    }

    pub fn matches(&self, patch: &Patch, outcome: &OutcomeRecord) -> bool {
        if let Some(ref re) = self.id_pattern
            && !re.is_match(patch.id.as_str())
        {
            return false;
        }
        if let Some(ref re) = self.reason_pattern
            && !re.is_match(&outcome.failure_text())
        {
            return false;
        }
        if let Some(phase) = self.phase
            && outcome.failed_phase != Some(phase)
        {
            return false;
        }
        true
    }
}

/// Built-in families: timeouts and missing directories. Softening validate is
/// never built in; an operator opts into it through a configured family.
pub fn builtin_families() -> Vec<FailureFamily> {
    let configs = [
        FamilyConfig {
            name: "timeout".into(),
            id_pattern: None,
            reason_pattern: Some(r"(?i)timed out".into()),
            phase: None,
            edits: vec![RepairEdit::ExtendTimeouts { factor: 2 }],
        },
        FamilyConfig {
            name: "missing-path".into(),
            id_pattern: None,
            reason_pattern: Some("No such file or directory".into()),
            phase: None,
            edits: vec![RepairEdit::EnsureParentDirs],
        },
    ];
    configs
        .iter()
        .filter_map(|c| FailureFamily::from_config(c).ok())
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct FamilyTable {
    families: Vec<FailureFamily>,
}

impl FamilyTable {
    pub fn new(families: Vec<FailureFamily>) -> Self {
        Self { families }
    }

    pub fn from_config(section: &RepairSection) -> Self {
        let mut families = Vec::new();
        for config in &section.families {
            match FailureFamily::from_config(config) {
                Ok(f) => families.push(f),
                Err(e) => {
                    tracing::warn!(family = %config.name, error = %e, "skipping invalid repair family")
                }
            }
        }
        if section.builtin_families {
            families.extend(builtin_families());
        }
        Self { families }
    }

    pub fn families(&self) -> &[FailureFamily] {
        &self.families
    }

    pub fn find(&self, patch: &Patch, outcome: &OutcomeRecord) -> Option<&FailureFamily> {
        self.families.iter().find(|f| f.matches(patch, outcome))
    }
}

/// Apply edits to a unit. Returns a description of each edit that changed it.
pub fn apply_edits(patch: &mut Patch, edits: &[RepairEdit], step_timeout_secs: u64) -> Vec<String> {
    let mut changes = Vec::new();
    for edit in edits {
        if let Some(change) = apply_edit(patch, edit, step_timeout_secs) {
            changes.push(change);
        }
    }
    changes
}

fn apply_edit(patch: &mut Patch, edit: &RepairEdit, step_timeout_secs: u64) -> Option<String> {
    match edit {
        RepairEdit::SoftenValidate => {
            if patch.validate_soft == Some(true) {
                return None;
            }
            patch.validate_soft = Some(true);
            Some("validate softened".to_string())
        }
        RepairEdit::ExtendTimeouts { factor } => {
            let factor = u64::from((*factor).max(1));
            let mut count = 0;
            for kind in PhaseKind::all() {
                for step in patch.phases.steps_mut(*kind) {
                    if let Step::Command(c) = step {
                        let current = c.timeout_secs.unwrap_or(step_timeout_secs);
                        c.timeout_secs = Some(current.saturating_mul(factor));
                        count += 1;
                    }
                }
            }
            (count > 0 && factor > 1)
                .then(|| format!("extended {} command timeouts x{}", count, factor))
        }
        RepairEdit::EnsureParentDirs => {
            let mut parents: Vec<String> = patch
                .mutation_tasks()
                .iter()
                .filter_map(|t| t.target.parent())
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.display().to_string())
                .collect();
            parents.sort();
            parents.dedup();

            let mut added = Vec::new();
            for parent in parents {
                let run = format!("mkdir -p {}", shell_quote(&parent));
                let present = patch
                    .phases
                    .pre_mutation
                    .iter()
                    .any(|s| matches!(s, Step::Command(c) if c.run == run));
                if !present {
                    patch.phases.pre_mutation.push(Step::Command(CommandStep {
                        run,
                        timeout_secs: None,
                        cwd: None,
                    }));
                    added.push(parent);
                }
            }
            (!added.is_empty()).then(|| format!("ensure parent dirs: {}", added.join(", ")))
        }
        RepairEdit::Replace {
            pattern,
            replacement,
        } => {
            let re = Regex::new(pattern).ok()?;
            let mut hits = 0;
            for kind in PhaseKind::all() {
                for step in patch.phases.steps_mut(*kind) {
                    let text = match step {
                        Step::Command(c) => &mut c.run,
                        Step::Mutation(m) => &mut m.content,
                    };
                    let replaced = re.replace_all(text, replacement.as_str()).into_owned();
                    if replaced != *text {
                        *text = replaced;
                        hits += 1;
                    }
                }
            }
            (hits > 0).then(|| format!("replaced '{}' in {} steps", pattern, hits))
        }
        RepairEdit::DropSteps { pattern } => {
            let re = Regex::new(pattern).ok()?;
            let mut trial = patch.phases.clone();
            let before = trial.step_count();
            for kind in PhaseKind::all() {
                trial
                    .steps_mut(*kind)
                    .retain(|s| !matches!(s, Step::Command(c) if re.is_match(&c.run)));
            }
            let dropped = before - trial.step_count();
            // A unit must keep at least one step
            if dropped == 0 || trial.step_count() == 0 {
                return None;
            }
            patch.phases = trial;
            Some(format!("dropped {} steps matching '{}'", dropped, pattern))
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
