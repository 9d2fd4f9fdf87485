//! Outcome artifacts exchanged between the sequencer and an executor.
//!
//! The executor writes exactly one of `outcomes/<id>.completed.json` or
//! `outcomes/<id>.failed.json`; the sequencer polls for either.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::unit::{PhaseKind, UnitId};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
    /// No artifact appeared before the dispatch timeout
    Unknown,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Failed => "failed",
            Outcome::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validate-phase failure tolerated under soft validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftFailure {
    pub phase: PhaseKind,
    pub step: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub unit_id: UnitId,
    pub outcome: Outcome,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<PhaseKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub soft_failures: Vec<SoftFailure>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_tail: String,
}

impl OutcomeRecord {
    pub fn completed(unit_id: UnitId) -> Self {
        Self {
            unit_id,
            outcome: Outcome::Completed,
            finished_at: Utc::now(),
            failed_phase: None,
            failed_step: None,
            reason: None,
            exit_code: None,
            soft_failures: Vec::new(),
            output_tail: String::new(),
        }
    }

    pub fn failed(unit_id: UnitId, reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failed,
            reason: Some(reason.into()),
            ..Self::completed(unit_id)
        }
    }

    /// Synthesised when the executor never answered.
    pub fn unresolved(unit_id: UnitId) -> Self {
        Self {
            outcome: Outcome::Unknown,
            reason: Some("unresolved".to_string()),
            ..Self::completed(unit_id)
        }
    }

    /// Text the repair loop matches failure families against.
    pub fn failure_text(&self) -> String {
        let mut text = self.reason.clone().unwrap_or_default();
        if !self.output_tail.is_empty() {
            text.push('\n');
            text.push_str(&self.output_tail);
        }
        text
    }
}

pub struct OutcomeStore {
    dir: PathBuf,
}

impl OutcomeStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path(&self, id: &UnitId, outcome: Outcome) -> PathBuf {
        self.dir.join(format!("{}.{}.json", id, outcome.as_str()))
    }

    /// Persist a record. Unknown outcomes are never written as artifacts.
    pub fn write(&self, record: &OutcomeRecord) -> Result<PathBuf> {
        let outcome = match record.outcome {
            Outcome::Unknown => Outcome::Failed,
            other => other,
        };
        let path = self.path(&record.unit_id, outcome);
        util::write_json_atomic(&path, record)?;
        Ok(path)
    }

    /// Read the artifact for `id`, if any. A failure artifact wins over a
    /// completion artifact if both are present.
    pub fn read(&self, id: &UnitId) -> Result<Option<OutcomeRecord>> {
        if let Some(record) = util::read_json_opt(&self.path(id, Outcome::Failed))? {
            return Ok(Some(record));
        }
        util::read_json_opt(&self.path(id, Outcome::Completed))
    }

    /// Remove any artifact for `id` so a new dispatch starts clean.
    pub fn clear(&self, id: &UnitId) -> Result<()> {
        util::remove_if_exists(&self.path(id, Outcome::Completed))?;
        util::remove_if_exists(&self.path(id, Outcome::Failed))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn id() -> UnitId {
        UnitId::parse("1.1-a").unwrap()
    }

    #[test]
    fn test_write_read_clear() {
        let dir = tempdir().unwrap();
        let store = OutcomeStore::new(dir.path());
        assert!(store.read(&id()).unwrap().is_none());

        let path = store.write(&OutcomeRecord::completed(id())).unwrap();
        assert!(path.ends_with("1.1-a.completed.json"));
        assert_eq!(store.read(&id()).unwrap().unwrap().outcome, Outcome::Completed);

        store.clear(&id()).unwrap();
        assert!(store.read(&id()).unwrap().is_none());
    }

    #[test]
    fn test_failed_artifact_wins() {
        let dir = tempdir().unwrap();
        let store = OutcomeStore::new(dir.path());
        store.write(&OutcomeRecord::completed(id())).unwrap();
        store.write(&OutcomeRecord::failed(id(), "boom")).unwrap();
        let record = store.read(&id()).unwrap().unwrap();
        assert_eq!(record.outcome, Outcome::Failed);
        assert_eq!(record.reason.as_deref(), Some("boom"));
    }

    #[test]
    fn test_failure_text_includes_output_tail() {
        let mut record = OutcomeRecord::failed(id(), "exited with code 1");
        record.output_tail = "No such file or directory".into();
        assert_eq!(
            record.failure_text(),
            "exited with code 1\nNo such file or directory"
        );
        assert_eq!(OutcomeRecord::unresolved(id()).reason.as_deref(), Some("unresolved"));
    }
}
