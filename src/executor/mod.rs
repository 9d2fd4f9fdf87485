//! Built-in executor.
//!
//! Consumes the unit in the active queue, runs its phases in order and writes
//! exactly one outcome artifact. The sequencer never depends on this module
//! directly for correctness: any process honouring the same active-queue and
//! outcome-file contract can take its place.

mod outcome;
pub mod process;

pub use outcome::{Outcome, OutcomeRecord, OutcomeStore, SoftFailure};

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Config;
use crate::unit::{MutationMode, MutationTask, Patch, PhaseKind, Step, UnitStore};
use crate::util;

/// Lines of step output kept in a failure outcome.
pub const OUTPUT_TAIL_LINES: usize = 40;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub workspace: PathBuf,
    pub step_timeout: Duration,
    /// Default for units that do not set `validate_soft`
    pub soft_validate: bool,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workspace: config.workspace(),
            step_timeout: Duration::from_secs(config.settings.sequencer.step_timeout_secs),
            soft_validate: config.settings.sequencer.soft_validate,
        }
    }
}

/// Result of a single step.
enum StepResult {
    Ok,
    Failed {
        reason: String,
        exit_code: Option<i32>,
        output: String,
    },
}

pub struct Executor {
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self { settings }
    }

    pub fn workspace(&self) -> &Path {
        &self.settings.workspace
    }

    /// Execute every phase of a unit and describe the outcome.
    ///
    /// A step failure aborts the attempt, except in the validate phase under
    /// soft validation, where the failure is recorded and execution continues.
    pub async fn run(&self, patch: &Patch) -> OutcomeRecord {
        let soft = patch.validate_soft.unwrap_or(self.settings.soft_validate);
        let mut soft_failures = Vec::new();

        tracing::info!(unit = %patch.id, steps = patch.phases.step_count(), "executing unit");

        for &phase in PhaseKind::all() {
            for (index, step) in patch.phases.steps(phase).iter().enumerate() {
                let label = format!("{}[{}] {}", phase, index, step.describe());
                match self.run_step(patch, phase, step).await {
                    StepResult::Ok => {
                        tracing::debug!(unit = %patch.id, step = %label, "step ok");
                    }
                    StepResult::Failed { reason, .. } if soft && phase == PhaseKind::Validate => {
                        tracing::warn!(unit = %patch.id, step = %label, %reason, "soft validate failure");
                        soft_failures.push(SoftFailure {
                            phase,
                            step: label,
                            reason,
                        });
                    }
                    StepResult::Failed {
                        reason,
                        exit_code,
                        output,
                    } => {
                        tracing::info!(unit = %patch.id, step = %label, %reason, "step failed");
                        let mut record = OutcomeRecord::failed(patch.id.clone(), reason);
                        record.failed_phase = Some(phase);
                        record.failed_step = Some(label);
                        record.exit_code = exit_code;
                        record.soft_failures = soft_failures;
                        record.output_tail = util::tail_lines(&output, OUTPUT_TAIL_LINES);
                        return record;
                    }
                }
            }
        }

        let mut record = OutcomeRecord::completed(patch.id.clone());
        record.soft_failures = soft_failures;
        record
    }

    async fn run_step(&self, patch: &Patch, phase: PhaseKind, step: &Step) -> StepResult {
        match step {
            Step::Command(c) => {
                let cwd = match c.cwd {
                    Some(ref dir) => self.settings.workspace.join(dir),
                    None => self.settings.workspace.clone(),
                };
                let limit = c
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.settings.step_timeout);
                let env = [
                    ("PATCHWORK_UNIT_ID", patch.id.to_string()),
                    ("PATCHWORK_PHASE", phase.to_string()),
                    (
                        "PATCHWORK_WORKSPACE",
                        self.settings.workspace.display().to_string(),
                    ),
                ];
                match process::run_shell(&c.run, &cwd, limit, &env).await {
                    Ok(out) if out.success() => StepResult::Ok,
                    Ok(out) => StepResult::Failed {
                        reason: out.failure_reason(limit),
                        exit_code: out.exit_code,
                        output: out.combined(),
                    },
                    Err(e) => StepResult::Failed {
                        reason: format!("{:#}", e),
                        exit_code: None,
                        output: String::new(),
                    },
                }
            }
            Step::Mutation(m) => match apply_mutation(&self.settings.workspace, m) {
                Ok(()) => StepResult::Ok,
                Err(e) => StepResult::Failed {
                    reason: format!("{:#}", e),
                    exit_code: None,
                    output: String::new(),
                },
            },
        }
    }

    /// Run the unit currently in the active queue, if it has no outcome yet.
    pub async fn run_active(
        &self,
        store: &UnitStore,
        outcomes: &OutcomeStore,
    ) -> Result<Option<OutcomeRecord>> {
        let Some(patch) = store.active()?.into_iter().next() else {
            return Ok(None);
        };
        if outcomes.read(&patch.id)?.is_some() {
            return Ok(None);
        }
        let record = self.run(&patch).await;
        outcomes
            .write(&record)
            .with_context(|| format!("Failed to write outcome for {}", patch.id))?;
        tracing::info!(unit = %patch.id, outcome = %record.outcome, "outcome written");
        Ok(Some(record))
    }
}

/// Apply a mutation task under `workspace`. Parent directories are not created.
pub fn apply_mutation(workspace: &Path, task: &MutationTask) -> Result<()> {
    let path = workspace.join(&task.target);
    match task.mode {
        MutationMode::Write => fs::write(&path, &task.content)
            .with_context(|| format!("Failed to write {}", task.target.display())),
        MutationMode::Append => {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open {}", task.target.display()))?;
            file.write_all(task.content.as_bytes())
                .with_context(|| format!("Failed to append to {}", task.target.display()))
        }
        MutationMode::EnsureLine => {
            let line = task.content.trim_end_matches('\n');
            let existing = match fs::read_to_string(&path) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to read {}", task.target.display()));
                }
            };
            if existing.lines().any(|l| l == line) {
                return Ok(());
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open {}", task.target.display()))?;
            let prefix = if existing.is_empty() || existing.ends_with('\n') {
                ""
            } else {
                "\n"
            };
            writeln!(file, "{}{}", prefix, line)
                .with_context(|| format!("Failed to append to {}", task.target.display()))
        }
    }
}

/// Whether the effect of a mutation task is already present.
pub fn mutation_applied(workspace: &Path, task: &MutationTask) -> bool {
    let Ok(current) = fs::read_to_string(workspace.join(&task.target)) else {
        return false;
    };
    match task.mode {
        MutationMode::Write => current == task.content,
        MutationMode::Append => current.contains(&task.content),
        MutationMode::EnsureLine => {
            let line = task.content.trim_end_matches('\n');
            current.lines().any(|l| l == line)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{CommandStep, Phases, UnitId};
    use tempfile::tempdir;

    fn executor(workspace: &Path, soft: bool) -> Executor {
        Executor::new(ExecutorSettings {
            workspace: workspace.to_path_buf(),
            step_timeout: Duration::from_secs(10),
            soft_validate: soft,
        })
    }

    fn patch(phases: Phases) -> Patch {
        Patch::new(UnitId::parse("1.1-a").unwrap(), phases)
    }

    #[tokio::test]
    async fn test_run_executes_phases_in_order() {
        let dir = tempdir().unwrap();
        let p = patch(Phases {
            pre_mutation: vec![Step::command("echo pre >> log.txt")],
            mutation: vec![Step::write("conf.txt", "key=1\n")],
            validate: vec![Step::command("grep -q key conf.txt && echo validate >> log.txt")],
            post_mutation_build: vec![Step::command("echo post >> log.txt")],
        });
        let record = executor(dir.path(), false).run(&p).await;
        assert_eq!(record.outcome, Outcome::Completed);
        let log = fs::read_to_string(dir.path().join("log.txt")).unwrap();
        assert_eq!(log, "pre\nvalidate\npost\n");
    }

    #[tokio::test]
    async fn test_failure_aborts_attempt() {
        let dir = tempdir().unwrap();
        let p = patch(Phases {
            pre_mutation: vec![Step::command("echo nope >&2; exit 4")],
            post_mutation_build: vec![Step::command("touch should-not-exist")],
            ..Default::default()
        });
        let record = executor(dir.path(), false).run(&p).await;
        assert_eq!(record.outcome, Outcome::Failed);
        assert_eq!(record.failed_phase, Some(PhaseKind::PreMutation));
        assert_eq!(record.exit_code, Some(4));
        assert!(record.output_tail.contains("nope"));
        assert!(!dir.path().join("should-not-exist").exists());
    }

    #[tokio::test]
    async fn test_soft_validate_continues() {
        let dir = tempdir().unwrap();
        let p = patch(Phases {
            validate: vec![Step::command("exit 1")],
            post_mutation_build: vec![Step::command("touch built")],
            ..Default::default()
        });
        let record = executor(dir.path(), true).run(&p).await;
        assert_eq!(record.outcome, Outcome::Completed);
        assert_eq!(record.soft_failures.len(), 1);
        assert!(dir.path().join("built").exists());

        let mut strict = p.clone();
        strict.validate_soft = Some(false);
        let record = executor(dir.path(), true).run(&strict).await;
        assert_eq!(record.outcome, Outcome::Failed);
        assert_eq!(record.failed_phase, Some(PhaseKind::Validate));
    }

    #[tokio::test]
    async fn test_step_timeout_override() {
        let dir = tempdir().unwrap();
        let p = patch(Phases {
            validate: vec![Step::Command(CommandStep {
                run: "sleep 20".into(),
                timeout_secs: Some(1),
                cwd: None,
            })],
            ..Default::default()
        });
        let record = executor(dir.path(), false).run(&p).await;
        assert_eq!(record.outcome, Outcome::Failed);
        assert_eq!(record.reason.as_deref(), Some("timed out after 1s"));
    }

    #[tokio::test]
    async fn test_mutation_into_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let p = patch(Phases {
            mutation: vec![Step::write("missing/conf.txt", "x")],
            ..Default::default()
        });
        let record = executor(dir.path(), false).run(&p).await;
        assert_eq!(record.outcome, Outcome::Failed);
        assert!(record.reason.unwrap().contains("No such file or directory"));
    }

    #[test]
    fn test_mutation_modes() {
        let dir = tempdir().unwrap();
        let ensure = MutationTask {
            target: PathBuf::from("hosts"),
            content: "127.0.0.1 app\n".into(),
            mode: MutationMode::EnsureLine,
        };
        fs::write(dir.path().join("hosts"), "::1 localhost").unwrap();
        assert!(!mutation_applied(dir.path(), &ensure));
        apply_mutation(dir.path(), &ensure).unwrap();
        apply_mutation(dir.path(), &ensure).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("hosts")).unwrap(),
            "::1 localhost\n127.0.0.1 app\n"
        );
        assert!(mutation_applied(dir.path(), &ensure));

        let append = MutationTask {
            target: PathBuf::from("log"),
            content: "a".into(),
            mode: MutationMode::Append,
        };
        apply_mutation(dir.path(), &append).unwrap();
        apply_mutation(dir.path(), &append).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("log")).unwrap(), "aa");
    }
}
