//! Quarantine controller.
//!
//! A unit whose repairs are exhausted is moved to the failed store with status
//! `blocked`, and a marker is written to `blocked/<id>.json`. While any marker
//! exists the sequencer dispatches nothing. Markers are cleared by an operator
//! (`unblock`, `restore`) or by the self-heal pass when a quick-win recheck
//! shows the unit's effect is already present.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::context::PipelineContext;
use crate::repair::quick_win::QuickWin;
use crate::unit::{Completion, CompletionSource, Patch, UnitId, UnitStatus};
use crate::util;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedMarker {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub unit_id: UnitId,
    pub attempts: u32,
}

pub struct Quarantine<'a> {
    ctx: &'a PipelineContext,
}

impl<'a> Quarantine<'a> {
    pub fn new(ctx: &'a PipelineContext) -> Self {
        Self { ctx }
    }

    fn marker_path(&self, id: &UnitId) -> PathBuf {
        self.ctx.layout().blocked_dir.join(id.file_name())
    }

    /// Quarantine a unit that is currently failed (or queued, for intake
    /// failures). The marker is written before the unit moves so dispatch halts
    /// even if the move is interrupted.
    pub fn quarantine(&self, patch: &mut Patch, reason: &str, attempts: u32) -> Result<BlockedMarker> {
        let marker = BlockedMarker {
            timestamp: Utc::now(),
            reason: reason.to_string(),
            unit_id: patch.id.clone(),
            attempts,
        };
        util::write_json_atomic(&self.marker_path(&patch.id), &marker)?;

        if patch.status != UnitStatus::Failed {
            self.ctx.store.transition(patch, UnitStatus::Failed)?;
        }
        self.ctx.store.transition(patch, UnitStatus::Blocked)?;

        tracing::error!(unit = %patch.id, attempts, reason, "unit quarantined");
        Ok(marker)
    }

    /// Whether any marker file exists, readable or not.
    pub fn has_markers(&self) -> Result<bool> {
        Ok(!crate::unit::json_files(&self.ctx.layout().blocked_dir)?.is_empty())
    }

    pub fn markers(&self) -> Result<Vec<BlockedMarker>> {
        let mut markers = Vec::new();
        for path in crate::unit::json_files(&self.ctx.layout().blocked_dir)? {
            match util::read_json::<BlockedMarker>(&path) {
                Ok(m) => markers.push(m),
                Err(e) => tracing::warn!(path = %path.display(), error = %format!("{:#}", e), "unreadable blocked marker"),
            }
        }
        markers.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        Ok(markers)
    }

    pub fn marker(&self, id: &UnitId) -> Result<Option<BlockedMarker>> {
        util::read_json_opt(&self.marker_path(id))
    }

    /// Delete one marker. The unit stays in the failed store.
    pub fn clear(&self, id: &UnitId) -> Result<bool> {
        let removed = util::remove_if_exists(&self.marker_path(id))?;
        if removed {
            tracing::info!(unit = %id, "blocked marker cleared");
        }
        Ok(removed)
    }

    /// Quick-win recheck every quarantined unit; complete the ones whose
    /// effect is present and clear their markers.
    pub async fn self_heal(&self) -> Result<Vec<UnitId>> {
        let workspace = self.ctx.config.workspace();
        let quick_win = QuickWin::new(&workspace, self.ctx.step_timeout());
        let mut healed = Vec::new();

        for marker in self.markers()? {
            let path = self.ctx.store.path_for(&marker.unit_id, UnitStatus::Blocked);
            let mut patch = match self.ctx.store.load_raw(&path) {
                Ok(p) if p.status == UnitStatus::Blocked => p,
                Ok(_) | Err(_) => {
                    tracing::debug!(unit = %marker.unit_id, "no blocked record behind marker");
                    continue;
                }
            };
            if !quick_win.check(&patch).await.passed() {
                continue;
            }

            patch.completion = Some(Completion {
                completed_at: Utc::now(),
                attempts: marker.attempts,
                via: CompletionSource::QuickWin,
            });
            self.ctx.store.transition(&mut patch, UnitStatus::Completed)?;
            self.ctx.retries.remove(&patch.id)?;
            self.ctx.store.remove_snapshot(&patch.id)?;
            self.clear(&patch.id)?;
            tracing::info!(unit = %patch.id, "quarantined unit self-healed");
            healed.push(patch.id);
        }
        Ok(healed)
    }

    /// Roll a quarantined unit back to its pre-repair content and re-stage it
    /// with a fresh retry budget.
    pub fn restore(&self, id: &UnitId) -> Result<Patch> {
        let status = self.ctx.store.locate(id);
        if !matches!(status, Some(UnitStatus::Blocked) | Some(UnitStatus::Failed)) {
            bail!(
                "Unit {} is not quarantined (state: {})",
                id,
                status.map(|s| s.to_string()).unwrap_or_else(|| "missing".into())
            );
        }
        let current = self
            .ctx
            .store
            .load_raw(&self.ctx.store.path_for(id, UnitStatus::Failed))
            .with_context(|| format!("Failed to read quarantined unit {}", id))?;

        let mut restored = match self.ctx.store.load_snapshot(id)? {
            Some(snapshot) => snapshot,
            None => current.clone(),
        };
        restored
            .validate()
            .with_context(|| format!("Unit {} cannot be restored", id))?;
        restored.status = current.status;
        restored.completion = None;

        self.ctx.store.transition(&mut restored, UnitStatus::Staged)?;
        self.ctx.retries.remove(id)?;
        self.ctx.store.remove_snapshot(id)?;
        self.clear(id)?;
        tracing::info!(unit = %id, "unit restored and re-staged");
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::patchwork_config::PatchworkToml;
    use crate::unit::{Phases, Step};
    use tempfile::TempDir;

    fn make_ctx() -> (PipelineContext, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Config::with_settings(dir.path(), PatchworkToml::default());
        (PipelineContext::open(config).unwrap(), dir)
    }

    fn failed_unit(ctx: &PipelineContext, id: &str, phases: Phases) -> Patch {
        let mut p = Patch::new(UnitId::parse(id).unwrap(), phases);
        ctx.store.deposit(&p).unwrap();
        ctx.store.transition(&mut p, UnitStatus::Failed).unwrap();
        p
    }

    fn writes_conf() -> Phases {
        Phases {
            mutation: vec![Step::write("conf.txt", "key=1\n")],
            validate: vec![Step::command("exit 1")],
            ..Default::default()
        }
    }

    #[test]
    fn test_quarantine_writes_marker_and_moves_unit() {
        let (ctx, _dir) = make_ctx();
        let q = Quarantine::new(&ctx);
        let mut p = failed_unit(&ctx, "1.1-a", writes_conf());

        q.quarantine(&mut p, "retries exhausted", 3).unwrap();
        assert_eq!(ctx.store.locate(&p.id), Some(UnitStatus::Blocked));
        assert!(q.has_markers().unwrap());
        let markers = q.markers().unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].attempts, 3);
        assert_eq!(markers[0].reason, "retries exhausted");

        assert!(q.clear(&p.id).unwrap());
        assert!(!q.has_markers().unwrap());
        assert_eq!(ctx.store.locate(&p.id), Some(UnitStatus::Blocked));
    }

    #[test]
    fn test_quarantine_from_queued_intake() {
        let (ctx, _dir) = make_ctx();
        let q = Quarantine::new(&ctx);
        let mut p = Patch::new(UnitId::parse("1.1-a").unwrap(), writes_conf());
        ctx.store.deposit(&p).unwrap();
        q.quarantine(&mut p, "structural", 0).unwrap();
        assert_eq!(ctx.store.locate(&p.id), Some(UnitStatus::Blocked));
    }

    #[tokio::test]
    async fn test_self_heal_completes_when_effect_present() {
        let (ctx, dir) = make_ctx();
        let q = Quarantine::new(&ctx);
        let mut p = failed_unit(&ctx, "1.1-a", writes_conf());
        q.quarantine(&mut p, "retries exhausted", 3).unwrap();

        assert!(q.self_heal().await.unwrap().is_empty());
        assert!(q.has_markers().unwrap());

        std::fs::write(dir.path().join("conf.txt"), "key=1\n").unwrap();
        let healed = q.self_heal().await.unwrap();
        assert_eq!(healed, vec![p.id.clone()]);
        assert!(!q.has_markers().unwrap());

        let done = ctx.store.load(&p.id, UnitStatus::Completed).unwrap();
        let completion = done.completion.unwrap();
        assert_eq!(completion.via, CompletionSource::QuickWin);
        assert_eq!(completion.attempts, 3);
    }

    #[test]
    fn test_restore_uses_snapshot_and_resets_retries() {
        let (ctx, _dir) = make_ctx();
        let q = Quarantine::new(&ctx);
        let mut p = failed_unit(&ctx, "1.1-a", writes_conf());
        ctx.store.write_snapshot(&p).unwrap();

        p.validate_soft = Some(true);
        ctx.store.save(&p).unwrap();
        let mut state = ctx.retries.load_or_new(&p.id).unwrap();
        state.attempts = 3;
        ctx.retries.save(&state).unwrap();
        q.quarantine(&mut p, "retries exhausted", 3).unwrap();

        let restored = q.restore(&p.id).unwrap();
        assert_eq!(restored.status, UnitStatus::Staged);
        assert_eq!(restored.validate_soft, None);
        assert_eq!(ctx.store.locate(&p.id), Some(UnitStatus::Staged));
        assert!(ctx.retries.load(&p.id).unwrap().is_none());
        assert!(!q.has_markers().unwrap());
    }

    #[test]
    fn test_restore_rejects_unquarantined_unit() {
        let (ctx, _dir) = make_ctx();
        let q = Quarantine::new(&ctx);
        let p = Patch::new(UnitId::parse("1.1-a").unwrap(), writes_conf());
        ctx.store.deposit(&p).unwrap();
        assert!(q.restore(&p.id).is_err());
        assert!(q.restore(&UnitId::parse("9.9-nope").unwrap()).is_err());
    }
}
