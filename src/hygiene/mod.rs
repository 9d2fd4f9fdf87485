//! Queue hygiene.
//!
//! Classifies pending queue entries (`queued` and `staged`) as corrupt or
//! stale. Apply mode moves at most `max_removals` of them into `trash/`,
//! corrupt entries first and then the oldest; dry-run reports the full plan and
//! removes nothing.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::context::PipelineContext;
use crate::errors::UnitError;
use crate::unit::{UnitStatus, json_files};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryClass {
    Corrupt,
    Stale,
}

/// A queue entry selected for removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HygieneEntry {
    pub path: PathBuf,
    /// `queued` or `staged`
    pub state: UnitStatus,
    pub class: EntryClass,
    pub age_secs: u64,
    pub size: u64,
    pub reason: String,
    /// Where apply mode moved the entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trashed_to: Option<PathBuf>,
    /// The entry left its queue before it could be moved
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub vanished: bool,
}

/// Body of the `hygiene` report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HygieneReport {
    pub apply: bool,
    pub scanned: usize,
    pub max_removals: usize,
    /// Every candidate, in removal order
    pub plan: Vec<HygieneEntry>,
    /// Trash paths of the entries actually moved
    pub removed: Vec<PathBuf>,
}

pub struct Hygiene<'a> {
    ctx: &'a PipelineContext,
}

impl<'a> Hygiene<'a> {
    pub fn new(ctx: &'a PipelineContext) -> Self {
        Self { ctx }
    }

    fn classify_file(&self, path: &Path, state: UnitStatus) -> Result<Option<HygieneEntry>> {
        let section = &self.ctx.settings().hygiene;
        // The sequencer moves entries concurrently; one that is gone is skipped.
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "queue entry vanished before stat");
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat {}", path.display()));
            }
        };
        let size = meta.len();
        let age_secs = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let corrupt = if size < section.min_size_bytes {
            Some(format!("{} bytes is below the {} byte minimum", size, section.min_size_bytes))
        } else {
            // Parseable but invalid units belong to structural intake, not here.
            match self.ctx.store.load_raw(path) {
                Ok(_) | Err(UnitError::Malformed { .. }) | Err(UnitError::InvalidId { .. }) => None,
                Err(UnitError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "queue entry vanished before read");
                    return Ok(None);
                }
                Err(e) => Some(e.to_string()),
            }
        };

        let (class, reason) = match corrupt {
            Some(reason) => (EntryClass::Corrupt, reason),
            None if age_secs >= section.stale_after_secs => (
                EntryClass::Stale,
                format!("untouched for {}s", age_secs),
            ),
            None => return Ok(None),
        };

        Ok(Some(HygieneEntry {
            path: path.to_path_buf(),
            state,
            class,
            age_secs,
            size,
            reason,
            trashed_to: None,
            vanished: false,
        }))
    }

    /// Candidates in removal order: corrupt first, then oldest.
    pub fn plan(&self) -> Result<(usize, Vec<HygieneEntry>)> {
        let mut scanned = 0;
        let mut plan = Vec::new();
        for state in [UnitStatus::Queued, UnitStatus::Staged] {
            for path in json_files(self.ctx.layout().state_dir(state))? {
                scanned += 1;
                if let Some(entry) = self.classify_file(&path, state)? {
                    plan.push(entry);
                }
            }
        }
        plan.sort_by(|a, b| {
            a.class
                .cmp(&b.class)
                .then(b.age_secs.cmp(&a.age_secs))
                .then(a.path.cmp(&b.path))
        });
        Ok((scanned, plan))
    }

    /// Classify and, in apply mode, move up to `max` entries to the trash.
    pub fn run(&self, apply: bool, max: Option<usize>) -> Result<HygieneReport> {
        let max_removals = max.unwrap_or(self.ctx.settings().hygiene.max_removals);
        let (scanned, mut plan) = self.plan()?;

        let mut removed = Vec::new();
        if apply {
            for entry in plan.iter_mut() {
                if removed.len() >= max_removals {
                    break;
                }
                match self.trash(entry)? {
                    Some(dest) => {
                        tracing::info!(
                            path = %entry.path.display(),
                            class = ?entry.class,
                            reason = %entry.reason,
                            "queue entry moved to trash"
                        );
                        entry.trashed_to = Some(dest.clone());
                        removed.push(dest);
                    }
                    None => entry.vanished = true,
                }
            }
        } else {
            tracing::info!(candidates = plan.len(), "hygiene dry run");
        }

        let report = HygieneReport {
            apply,
            scanned,
            max_removals,
            plan,
            removed,
        };
        self.ctx.reports.write("hygiene", &report)?;
        Ok(report)
    }

    /// Move an entry into the trash; `None` if it already left its queue.
    fn trash(&self, entry: &HygieneEntry) -> Result<Option<PathBuf>> {
        let trash_dir = &self.ctx.layout().trash_dir;
        std::fs::create_dir_all(trash_dir)
            .with_context(|| format!("Failed to create {}", trash_dir.display()))?;
        let name = entry
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "entry".to_string());
        let dest = trash_dir.join(format!(
            "{}-{}.{}",
            entry.state,
            name,
            Utc::now().format("%Y%m%dT%H%M%S%.3f")
        ));
        match std::fs::rename(&entry.path, &dest) {
            Ok(()) => Ok(Some(dest)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %entry.path.display(), "queue entry vanished before removal");
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| {
                format!(
                    "Failed to move {} to {}",
                    entry.path.display(),
                    dest.display()
                )
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::patchwork_config::PatchworkToml;
    use crate::unit::{Patch, Phases, Step, UnitId};
    use std::time::Duration;
    use tempfile::TempDir;

    fn make_ctx() -> (PipelineContext, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut settings = PatchworkToml::default();
        settings.hygiene.stale_after_secs = 3600;
        let config = Config::with_settings(dir.path(), settings);
        (PipelineContext::open(config).unwrap(), dir)
    }

    fn deposit(ctx: &PipelineContext, id: &str, age: Duration) -> PathBuf {
        let p = Patch::new(
            UnitId::parse(id).unwrap(),
            Phases {
                mutation: vec![Step::write("a.txt", "a")],
                ..Default::default()
            },
        );
        let path = ctx.store.deposit(&p).unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
        path
    }

    fn queued_count(ctx: &PipelineContext) -> usize {
        json_files(&ctx.layout().queued_dir).unwrap().len()
    }

    #[test]
    fn test_apply_removes_at_most_max() {
        let (ctx, _dir) = make_ctx();
        for i in 1..=5 {
            deposit(&ctx, &format!("1.{}-old", i), Duration::from_secs(7200 + i));
        }
        deposit(&ctx, "2.1-fresh", Duration::ZERO);

        let hygiene = Hygiene::new(&ctx);
        let dry = hygiene.run(false, Some(2)).unwrap();
        assert_eq!(dry.plan.len(), 5);
        assert!(dry.removed.is_empty());
        assert_eq!(queued_count(&ctx), 6);

        let applied = hygiene.run(true, Some(2)).unwrap();
        assert_eq!(applied.removed.len(), 2);
        assert_eq!(queued_count(&ctx), 4);
        assert_eq!(json_files(&ctx.layout().trash_dir).unwrap().len(), 0);
        assert_eq!(std::fs::read_dir(&ctx.layout().trash_dir).unwrap().count(), 2);

        // Oldest went first
        assert!(ctx.store.locate(&UnitId::parse("1.5-old").unwrap()).is_none());
        assert!(ctx.store.locate(&UnitId::parse("1.4-old").unwrap()).is_none());
        assert!(ctx.store.locate(&UnitId::parse("1.1-old").unwrap()).is_some());
    }

    #[test]
    fn test_corrupt_entries_go_first() {
        let (ctx, _dir) = make_ctx();
        deposit(&ctx, "1.1-old", Duration::from_secs(90_000));
        std::fs::write(ctx.layout().queued_dir.join("3.1-tiny.json"), "{}").unwrap();
        std::fs::write(
            ctx.layout().staged_dir.join("3.2-garbage.json"),
            "this is not json at all, definitely",
        )
        .unwrap();

        let report = Hygiene::new(&ctx).run(true, Some(2)).unwrap();
        assert_eq!(report.plan.len(), 3);
        assert_eq!(report.plan[0].class, EntryClass::Corrupt);
        assert_eq!(report.plan[1].class, EntryClass::Corrupt);
        assert_eq!(report.plan[2].class, EntryClass::Stale);
        assert_eq!(report.removed.len(), 2);
        assert!(ctx.store.locate(&UnitId::parse("1.1-old").unwrap()).is_some());
    }

    #[test]
    fn test_entry_gone_before_apply_is_skipped() {
        let (ctx, _dir) = make_ctx();
        let first = deposit(&ctx, "1.1-old", Duration::from_secs(9000));
        deposit(&ctx, "1.2-old", Duration::from_secs(8000));
        deposit(&ctx, "1.3-old", Duration::from_secs(7500));

        let hygiene = Hygiene::new(&ctx);
        let (_, plan) = hygiene.plan().unwrap();
        assert_eq!(plan[0].path, first);

        // Picked up by the sequencer between planning and removal
        std::fs::remove_file(&first).unwrap();
        assert!(hygiene.trash(&plan[0]).unwrap().is_none());

        std::fs::rename(&plan[1].path, ctx.layout().staged_dir.join("1.2-old.json")).unwrap();
        let report = hygiene.run(true, Some(5)).unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.removed.len(), 2);
        assert!(report.plan.iter().all(|e| e.trashed_to.is_some()));

        let latest: crate::report::Report<HygieneReport> =
            ctx.reports.latest("hygiene").unwrap().unwrap();
        assert_eq!(latest.body.removed.len(), 2);
    }

    #[test]
    fn test_malformed_but_parseable_unit_is_not_corrupt() {
        let (ctx, _dir) = make_ctx();
        std::fs::write(
            ctx.layout().queued_dir.join("4.1-empty.json"),
            r#"{"id": "4.1-empty", "phases": {}}"#,
        )
        .unwrap();
        let (_, plan) = Hygiene::new(&ctx).plan().unwrap();
        assert!(plan.is_empty());
    }
}
