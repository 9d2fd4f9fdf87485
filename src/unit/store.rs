//! Filesystem-backed store of work units.
//!
//! Each lifecycle state is a directory; a unit's record is `<id>.json` in the
//! directory of its current state. Transitions write the record into the new
//! directory before removing the old one, so a crash leaves at most a
//! duplicate (resolved in favour of the more advanced state by [`UnitStore::locate`]),
//! never a lost unit.

use super::{Patch, UnitId, UnitStatus};
use crate::config::Layout;
use crate::errors::UnitError;
use crate::util;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

/// Result of reading one file from a state directory.
#[derive(Debug)]
pub struct ScanEntry {
    pub path: PathBuf,
    pub result: Result<Patch, UnitError>,
}

pub struct UnitStore {
    layout: Layout,
}

impl UnitStore {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn path_for(&self, id: &UnitId, status: UnitStatus) -> PathBuf {
        self.layout.state_dir(status).join(id.file_name())
    }

    /// Deposit a new unit into the queued state.
    ///
    /// Fails if the unit is structurally invalid or its id is already known in
    /// any state: identifiers are unique and immutable.
    pub fn deposit(&self, patch: &Patch) -> Result<PathBuf, UnitError> {
        patch.validate()?;
        if let Some(state) = self.locate(&patch.id) {
            return Err(UnitError::AlreadyExists {
                id: patch.id.to_string(),
                state: state.to_string(),
            });
        }
        if let Some((existing, state)) = self.find_alias(&patch.id)? {
            return Err(UnitError::AlreadyExists {
                id: format!("{} (stored as {})", patch.id, existing),
                state: state.to_string(),
            });
        }

        let mut record = patch.clone();
        record.status = UnitStatus::Queued;
        record.completion = None;
        record.submitted_at.get_or_insert_with(Utc::now);

        let path = self.path_for(&record.id, UnitStatus::Queued);
        self.write(&path, &record)?;
        tracing::info!(unit = %record.id, "unit deposited");
        Ok(path)
    }

    /// Read a unit file from anywhere and deposit it.
    pub fn deposit_file(&self, path: &Path) -> Result<PathBuf, UnitError> {
        let content = fs::read_to_string(path).map_err(|e| UnitError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let patch: Patch = serde_json::from_str(&content).map_err(|e| UnitError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.deposit(&patch)
    }

    /// Load and validate a unit file. The file stem must equal the declared id.
    pub fn load_from(&self, path: &Path) -> Result<Patch, UnitError> {
        let patch = self.load_raw(path)?;
        patch.validate()?;
        Ok(patch)
    }

    /// Parse a unit file and check its name without structural validation.
    ///
    /// Used to route a parseable but invalid unit into repair and quarantine.
    pub fn load_raw(&self, path: &Path) -> Result<Patch, UnitError> {
        let content = fs::read_to_string(path).map_err(|e| UnitError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let patch: Patch = serde_json::from_str(&content).map_err(|e| UnitError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        if stem != patch.id.as_str() {
            return Err(UnitError::IdMismatch {
                path: path.to_path_buf(),
                declared: patch.id.to_string(),
                file_stem: stem,
            });
        }
        Ok(patch)
    }

    pub fn load(&self, id: &UnitId, status: UnitStatus) -> Result<Patch, UnitError> {
        let path = self.path_for(id, status);
        if !path.exists() {
            return Err(UnitError::NotFound {
                id: id.to_string(),
                state: status.to_string(),
            });
        }
        self.load_from(&path)
    }

    /// Load a unit from wherever it currently lives.
    pub fn find(&self, id: &UnitId) -> Result<Patch, UnitError> {
        let status = self.locate(id).ok_or_else(|| UnitError::NotFound {
            id: id.to_string(),
            state: "any".to_string(),
        })?;
        self.load(id, status)
    }

    /// Read every unit file in a state directory, keeping failures.
    pub fn scan(&self, status: UnitStatus) -> Result<Vec<ScanEntry>, UnitError> {
        let dir = self.layout.state_dir(status);
        Ok(json_files(dir)?
            .into_iter()
            .map(|path| {
                let result = self.load_from(&path);
                ScanEntry { path, result }
            })
            .collect())
    }

    /// Valid units in a state directory, sorted by ordering key.
    ///
    /// The failed store holds both failed and blocked units; the record's own
    /// status tells them apart.
    pub fn list(&self, status: UnitStatus) -> Result<Vec<Patch>, UnitError> {
        let mut units: Vec<Patch> = self
            .scan(status)?
            .into_iter()
            .filter_map(|entry| match entry.result {
                Ok(patch) => Some(patch),
                Err(e) => {
                    tracing::warn!(path = %entry.path.display(), error = %e, "skipping unreadable unit");
                    None
                }
            })
            .filter(|p| match status {
                UnitStatus::Failed | UnitStatus::Blocked => p.status == status,
                _ => true,
            })
            .collect();
        units.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(units)
    }

    /// Find the current state of a unit by probing the state directories.
    ///
    /// Probes in order of lifecycle progress, so a duplicate left by an
    /// interrupted transition resolves to the more advanced state.
    pub fn locate(&self, id: &UnitId) -> Option<UnitStatus> {
        let probes = [
            UnitStatus::Completed,
            UnitStatus::Failed,
            UnitStatus::Dispatched,
            UnitStatus::Staged,
            UnitStatus::Queued,
        ];
        for status in probes {
            let path = self.path_for(id, status);
            if !path.exists() {
                continue;
            }
            if status == UnitStatus::Failed {
                // Distinguish blocked from failed by the stored record.
                return match util::read_json::<Patch>(&path) {
                    Ok(p) if p.status == UnitStatus::Blocked => Some(UnitStatus::Blocked),
                    _ => Some(UnitStatus::Failed),
                };
            }
            return Some(status);
        }
        None
    }

    /// A stored unit that names the same unit under another spelling, such as
    /// `patch-1.1-a` for `1.1-a`.
    fn find_alias(&self, id: &UnitId) -> Result<Option<(UnitId, UnitStatus)>, UnitError> {
        for status in [
            UnitStatus::Completed,
            UnitStatus::Failed,
            UnitStatus::Dispatched,
            UnitStatus::Staged,
            UnitStatus::Queued,
        ] {
            for path in json_files(self.layout.state_dir(status))? {
                let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                    continue;
                };
                if let Ok(other) = UnitId::parse(&stem)
                    && other.same_unit(id)
                {
                    return Ok(Some((other, status)));
                }
            }
        }
        Ok(None)
    }

    /// Move a unit to a new lifecycle state, rewriting its record.
    pub fn transition(&self, patch: &mut Patch, to: UnitStatus) -> Result<(), UnitError> {
        let from = patch.status;
        if !from.can_transition_to(to) {
            return Err(UnitError::Malformed {
                id: patch.id.to_string(),
                reason: format!("illegal transition {} -> {}", from, to),
            });
        }

        let old_path = self.path_for(&patch.id, from);
        let new_path = self.path_for(&patch.id, to);
        patch.status = to;
        self.write(&new_path, patch)?;
        if old_path != new_path {
            util::remove_if_exists(&old_path).map_err(|e| UnitError::Io {
                path: old_path.clone(),
                source: std::io::Error::other(e.to_string()),
            })?;
        }
        tracing::debug!(unit = %patch.id, %from, %to, "unit transitioned");
        Ok(())
    }

    /// Rewrite a unit in place (e.g. after a repair pass edited it).
    pub fn save(&self, patch: &Patch) -> Result<(), UnitError> {
        let path = self.path_for(&patch.id, patch.status);
        self.write(&path, patch)
    }

    /// Whether the externally watched active queue holds any unit.
    pub fn active_is_empty(&self) -> Result<bool, UnitError> {
        Ok(json_files(&self.layout.active_dir)?.is_empty())
    }

    /// Units currently in the active queue.
    pub fn active(&self) -> Result<Vec<Patch>, UnitError> {
        self.list(UnitStatus::Dispatched)
    }

    /// Record the unit's content before the first repair. Never overwrites.
    pub fn write_snapshot(&self, patch: &Patch) -> Result<bool, UnitError> {
        let path = self.layout.snapshots_dir.join(patch.id.file_name());
        if path.exists() {
            return Ok(false);
        }
        self.write(&path, patch)?;
        Ok(true)
    }

    pub fn load_snapshot(&self, id: &UnitId) -> Result<Option<Patch>, UnitError> {
        let path = self.layout.snapshots_dir.join(id.file_name());
        if !path.exists() {
            return Ok(None);
        }
        util::read_json(&path)
            .map(Some)
            .map_err(|e| UnitError::Malformed {
                id: id.to_string(),
                reason: format!("snapshot unreadable: {:#}", e),
            })
    }

    pub fn remove_snapshot(&self, id: &UnitId) -> Result<(), UnitError> {
        let path = self.layout.snapshots_dir.join(id.file_name());
        util::remove_if_exists(&path).map_err(|e| UnitError::Io {
            path,
            source: std::io::Error::other(e.to_string()),
        })?;
        Ok(())
    }

    fn write(&self, path: &Path, patch: &Patch) -> Result<(), UnitError> {
        util::write_json_atomic(path, patch).map_err(|e| UnitError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::other(format!("{:#}", e)),
        })
    }
}

/// `*.json` files in a directory, skipping dot-prefixed temp files, sorted by name.
pub(crate) fn json_files(dir: &Path) -> Result<Vec<PathBuf>, UnitError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|e| UnitError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
        .filter(|p| {
            !p.file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(true)
        })
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Phases, Step};
    use tempfile::TempDir;

    fn make_store() -> (UnitStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path().join(".patchwork"));
        layout.ensure_directories().unwrap();
        (UnitStore::new(layout), dir)
    }

    fn patch(id: &str) -> Patch {
        Patch::new(
            UnitId::parse(id).unwrap(),
            Phases {
                validate: vec![Step::command("true")],
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_deposit_and_locate() {
        let (store, _dir) = make_store();
        let p = patch("1.1-a");
        let path = store.deposit(&p).unwrap();
        assert!(path.ends_with("queue/queued/1.1-a.json"));
        assert_eq!(store.locate(&p.id), Some(UnitStatus::Queued));

        let loaded = store.load(&p.id, UnitStatus::Queued).unwrap();
        assert!(loaded.submitted_at.is_some());
    }

    #[test]
    fn test_deposit_rejects_duplicate_ids() {
        let (store, _dir) = make_store();
        let p = patch("1.1-a");
        store.deposit(&p).unwrap();
        let err = store.deposit(&p).unwrap_err();
        assert!(matches!(err, UnitError::AlreadyExists { .. }));
    }

    #[test]
    fn test_deposit_rejects_prefixed_alias() {
        let (store, _dir) = make_store();
        store.deposit(&patch("1.1-a")).unwrap();

        let err = store.deposit(&patch("patch-1.1-a")).unwrap_err();
        assert!(matches!(err, UnitError::AlreadyExists { .. }));
        assert!(err.to_string().contains("stored as 1.1-a"));

        // Same ordering key, different slug: a distinct unit
        store.deposit(&patch("patch-1.1-b")).unwrap();
        assert_eq!(store.list(UnitStatus::Queued).unwrap().len(), 2);
    }

    #[test]
    fn test_transition_moves_file() {
        let (store, _dir) = make_store();
        let mut p = patch("1.1-a");
        store.deposit(&p).unwrap();
        store.transition(&mut p, UnitStatus::Staged).unwrap();
        assert!(!store.path_for(&p.id, UnitStatus::Queued).exists());
        assert!(store.path_for(&p.id, UnitStatus::Staged).exists());
        assert_eq!(store.locate(&p.id), Some(UnitStatus::Staged));

        store.transition(&mut p, UnitStatus::Dispatched).unwrap();
        assert!(!store.active_is_empty().unwrap());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let (store, _dir) = make_store();
        let mut p = patch("1.1-a");
        store.deposit(&p).unwrap();
        assert!(store.transition(&mut p, UnitStatus::Completed).is_err());
        assert_eq!(p.status, UnitStatus::Queued);
    }

    #[test]
    fn test_blocked_located_in_failed_store() {
        let (store, _dir) = make_store();
        let mut p = patch("1.1-a");
        store.deposit(&p).unwrap();
        store.transition(&mut p, UnitStatus::Staged).unwrap();
        store.transition(&mut p, UnitStatus::Failed).unwrap();
        assert_eq!(store.locate(&p.id), Some(UnitStatus::Failed));
        store.transition(&mut p, UnitStatus::Blocked).unwrap();
        assert_eq!(store.locate(&p.id), Some(UnitStatus::Blocked));
        assert_eq!(store.list(UnitStatus::Blocked).unwrap().len(), 1);
        assert!(store.list(UnitStatus::Failed).unwrap().is_empty());
    }

    #[test]
    fn test_scan_reports_mismatched_file_name() {
        let (store, _dir) = make_store();
        let p = patch("1.1-a");
        let wrong = store.layout().queued_dir.join("1.2-b.json");
        std::fs::write(&wrong, serde_json::to_string(&p).unwrap()).unwrap();
        std::fs::write(store.layout().queued_dir.join("junk.json"), "{not json").unwrap();

        let entries = store.scan(UnitStatus::Queued).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.result.is_err()));
        assert!(store.list(UnitStatus::Queued).unwrap().is_empty());
    }

    #[test]
    fn test_list_sorted_by_ordering_key() {
        let (store, _dir) = make_store();
        for id in ["2.10-c", "2.2-b", "1.5-a"] {
            store.deposit(&patch(id)).unwrap();
        }
        let ids: Vec<String> = store
            .list(UnitStatus::Queued)
            .unwrap()
            .into_iter()
            .map(|p| p.id.to_string())
            .collect();
        assert_eq!(ids, vec!["1.5-a", "2.2-b", "2.10-c"]);
    }

    #[test]
    fn test_snapshot_written_once() {
        let (store, _dir) = make_store();
        let mut p = patch("1.1-a");
        assert!(store.write_snapshot(&p).unwrap());
        p.description = "edited".into();
        assert!(!store.write_snapshot(&p).unwrap());
        let snap = store.load_snapshot(&p.id).unwrap().unwrap();
        assert!(snap.description.is_empty());
        store.remove_snapshot(&p.id).unwrap();
        assert!(store.load_snapshot(&p.id).unwrap().is_none());
    }

    #[test]
    fn test_json_files_skips_temp_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.json"), "{}").unwrap();
        std::fs::write(dir.path().join(".a.json.1234.tmp"), "{}").unwrap();
        std::fs::write(dir.path().join(".hidden.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        let files = json_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
    }
}
