//! Per-unit retry state: `retries/<id>.json`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::executor::Outcome;
use crate::unit::{UnitId, UnitStatus};
use crate::util;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryHistoryEntry {
    /// Attempt count after this entry was recorded
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub outcome: Outcome,
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    pub unit_id: UnitId,
    /// Repairs spent so far
    pub attempts: u32,
    pub last_status: UnitStatus,
    pub first_failure_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<RetryHistoryEntry>,
}

impl RetryState {
    pub fn new(unit_id: UnitId) -> Self {
        let now = Utc::now();
        Self {
            unit_id,
            attempts: 0,
            last_status: UnitStatus::Failed,
            first_failure_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    /// Append a history entry without consuming an attempt.
    pub fn record(
        &mut self,
        outcome: Outcome,
        strategy: &str,
        reason: Option<String>,
        changes: Vec<String>,
    ) {
        self.updated_at = Utc::now();
        self.history.push(RetryHistoryEntry {
            attempt: self.attempts,
            at: self.updated_at,
            outcome,
            strategy: strategy.to_string(),
            reason,
            changes,
        });
    }
}

pub struct RetryStateStore {
    dir: PathBuf,
}

impl RetryStateStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path(&self, id: &UnitId) -> PathBuf {
        self.dir.join(id.file_name())
    }

    pub fn load(&self, id: &UnitId) -> Result<Option<RetryState>> {
        util::read_json_opt(&self.path(id))
    }

    pub fn load_or_new(&self, id: &UnitId) -> Result<RetryState> {
        Ok(self
            .load(id)?
            .unwrap_or_else(|| RetryState::new(id.clone())))
    }

    pub fn attempts(&self, id: &UnitId) -> Result<u32> {
        Ok(self.load(id)?.map(|s| s.attempts).unwrap_or(0))
    }

    pub fn save(&self, state: &RetryState) -> Result<()> {
        util::write_json_atomic(&self.path(&state.unit_id), state)
    }

    pub fn remove(&self, id: &UnitId) -> Result<bool> {
        util::remove_if_exists(&self.path(id))
    }
}
