//! Quick-win recheck: is the unit's intended effect already present?
//!
//! Declared postconditions are evaluated when present. Otherwise the checks are
//! derived from the unit's mutation tasks. A unit with neither has nothing to
//! check and never quick-wins.

use regex::Regex;
use std::path::Path;
use std::time::Duration;

use crate::executor::{mutation_applied, process};
use crate::unit::{Patch, Postcondition};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuickWinResult {
    /// Nothing to check
    NotApplicable,
    Passed,
    /// Descriptions of the checks that did not hold
    Failed(Vec<String>),
}

impl QuickWinResult {
    pub fn passed(&self) -> bool {
        matches!(self, QuickWinResult::Passed)
    }
}

pub struct QuickWin<'a> {
    workspace: &'a Path,
    command_timeout: Duration,
}

impl<'a> QuickWin<'a> {
    pub fn new(workspace: &'a Path, command_timeout: Duration) -> Self {
        Self {
            workspace,
            command_timeout,
        }
    }

    pub async fn check(&self, patch: &Patch) -> QuickWinResult {
        let mut failures = Vec::new();

        if !patch.postconditions.is_empty() {
            for post in &patch.postconditions {
                if let Err(reason) = self.evaluate(post).await {
                    failures.push(reason);
                }
            }
        } else {
            let tasks = patch.mutation_tasks();
            if tasks.is_empty() {
                return QuickWinResult::NotApplicable;
            }
            for task in tasks {
                if !mutation_applied(self.workspace, task) {
                    failures.push(format!(
                        "{} not applied to {}",
                        task.mode.as_str(),
                        task.target.display()
                    ));
                }
            }
        }

        if failures.is_empty() {
            tracing::info!(unit = %patch.id, "quick-win check passed");
            QuickWinResult::Passed
        } else {
            tracing::debug!(unit = %patch.id, ?failures, "quick-win check failed");
            QuickWinResult::Failed(failures)
        }
    }

    async fn evaluate(&self, post: &Postcondition) -> Result<(), String> {
        match post {
            Postcondition::FileExists { path } => {
                if self.workspace.join(path).exists() {
                    Ok(())
                } else {
                    Err(format!("{} does not exist", path.display()))
                }
            }
            Postcondition::FileAbsent { path } => {
                if self.workspace.join(path).exists() {
                    Err(format!("{} still exists", path.display()))
                } else {
                    Ok(())
                }
            }
            Postcondition::FileContains { path, pattern } => {
                let re = Regex::new(pattern).map_err(|e| format!("bad pattern: {}", e))?;
                let content = std::fs::read_to_string(self.workspace.join(path))
                    .map_err(|e| format!("{}: {}", path.display(), e))?;
                if re.is_match(&content) {
                    Ok(())
                } else {
                    Err(format!("{} does not match '{}'", path.display(), pattern))
                }
            }
            Postcondition::FileEquals { path, content } => {
                let current = std::fs::read_to_string(self.workspace.join(path))
                    .map_err(|e| format!("{}: {}", path.display(), e))?;
                if &current == content {
                    Ok(())
                } else {
                    Err(format!("{} differs from expected content", path.display()))
                }
            }
            Postcondition::CommandSucceeds { run, timeout_secs } => {
                let limit = timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.command_timeout);
                match process::run_shell(run, self.workspace, limit, &[]).await {
                    Ok(out) if out.success() => Ok(()),
                    Ok(out) => Err(format!("'{}' {}", run, out.failure_reason(limit))),
                    Err(e) => Err(format!("'{}': {:#}", run, e)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Phases, Step, UnitId};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn patch(phases: Phases) -> Patch {
        Patch::new(UnitId::parse("1.1-a").unwrap(), phases)
    }

    fn commands_only() -> Phases {
        Phases {
            validate: vec![Step::command("exit 1")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_not_applicable_without_checks() {
        let dir = tempdir().unwrap();
        let qw = QuickWin::new(dir.path(), Duration::from_secs(5));
        assert_eq!(qw.check(&patch(commands_only())).await, QuickWinResult::NotApplicable);
    }

    #[tokio::test]
    async fn test_derived_from_mutation_tasks() {
        let dir = tempdir().unwrap();
        let qw = QuickWin::new(dir.path(), Duration::from_secs(5));
        let p = patch(Phases {
            mutation: vec![Step::write("conf.txt", "key=1\n")],
            validate: vec![Step::command("exit 1")],
            ..Default::default()
        });
        assert!(!qw.check(&p).await.passed());
        std::fs::write(dir.path().join("conf.txt"), "key=1\n").unwrap();
        assert!(qw.check(&p).await.passed());
    }

    #[tokio::test]
    async fn test_declared_postconditions() {
        let dir = tempdir().unwrap();
        let qw = QuickWin::new(dir.path(), Duration::from_secs(5));
        let p = patch(commands_only()).with_postconditions(vec![
            Postcondition::FileContains {
                path: PathBuf::from("ready.txt"),
                pattern: "^ok".into(),
            },
            Postcondition::FileAbsent {
                path: PathBuf::from("lock"),
            },
            Postcondition::CommandSucceeds {
                run: "test -f ready.txt".into(),
                timeout_secs: None,
            },
        ]);

        match qw.check(&p).await {
            QuickWinResult::Failed(reasons) => assert_eq!(reasons.len(), 2),
            other => panic!("unexpected {:?}", other),
        }

        std::fs::write(dir.path().join("ready.txt"), "ok\n").unwrap();
        assert!(qw.check(&p).await.passed());

        std::fs::write(dir.path().join("lock"), "").unwrap();
        assert!(!qw.check(&p).await.passed());
    }
}
