//! Dependency resolution for work units.
//!
//! A unit's dependencies are the union of the ids it declares in `depends_on`
//! and every id listed before it in the order manifest. Declared edges form a
//! graph that is checked for cycles with Kahn's algorithm; units on a cycle are
//! reported and never become eligible. Cycles are surfaced, not broken.

mod manifest;

pub use manifest::OrderManifest;

use crate::unit::{Patch, UnitId, UnitStatus, UnitStore};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Where a dependency edge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepSource {
    Declared,
    Manifest,
}

/// Current state of a dependency as seen by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepState {
    Completed,
    /// Failed or quarantined
    Failed,
    Staged,
    Queued,
    Dispatched,
    Missing,
}

impl From<Option<UnitStatus>> for DepState {
    fn from(status: Option<UnitStatus>) -> Self {
        match status {
            Some(UnitStatus::Completed) => DepState::Completed,
            Some(UnitStatus::Failed | UnitStatus::Blocked) => DepState::Failed,
            Some(UnitStatus::Staged) => DepState::Staged,
            Some(UnitStatus::Queued) => DepState::Queued,
            Some(UnitStatus::Dispatched) => DepState::Dispatched,
            None => DepState::Missing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: UnitId,
    pub source: DepSource,
    pub state: DepState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Every dependency is completed
    Ready,
    /// Some dependency is still pending
    Waiting,
    /// Some dependency failed or does not exist
    BlockedOnDependency,
    /// The unit is part of a dependency cycle
    Cyclic,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Resolved dependencies of one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub unit_id: UnitId,
    pub dependencies: Vec<Dependency>,
    pub readiness: Readiness,
}

impl Resolution {
    /// Dependencies that keep the unit from being ready.
    pub fn unsatisfied(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies
            .iter()
            .filter(|d| d.state != DepState::Completed)
    }
}

/// Body of the `dependencies` report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyReport {
    pub cycles: Vec<UnitId>,
    pub resolutions: Vec<Resolution>,
}

/// Combine declared and manifest dependencies, declared first, deduplicated.
pub fn dependency_ids(patch: &Patch, manifest: &OrderManifest) -> Vec<(UnitId, DepSource)> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for dep in &patch.depends_on {
        if seen.insert(dep.clone()) {
            out.push((dep.clone(), DepSource::Declared));
        }
    }
    for dep in manifest.predecessors(&patch.id) {
        if dep != &patch.id && seen.insert(dep.clone()) {
            out.push((dep.clone(), DepSource::Manifest));
        }
    }
    out
}

/// Ids of units that lie on a cycle of declared dependencies.
///
/// Kahn's algorithm removes every node that is not downstream of a cycle; the
/// remainder is then pruned from the other side so units that merely depend on
/// a cycle are not reported as part of it.
pub fn find_cycles(units: &[Patch]) -> Vec<UnitId> {
    let index: HashMap<&UnitId, usize> = units.iter().enumerate().map(|(i, u)| (&u.id, i)).collect();
    let n = units.len();
    let mut forward: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut reverse: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (to, unit) in units.iter().enumerate() {
        for dep in &unit.depends_on {
            if let Some(&from) = index.get(dep) {
                forward[from].push(to);
                reverse[to].push(from);
            }
        }
    }

    let mut remaining = vec![true; n];

    let mut in_degree: Vec<usize> = reverse.iter().map(|d| d.len()).collect();
    let mut queue: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    while let Some(node) = queue.pop() {
        remaining[node] = false;
        for &dependent in &forward[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push(dependent);
            }
        }
    }

    let mut out_degree: Vec<usize> = (0..n)
        .map(|i| forward[i].iter().filter(|&&j| remaining[j]).count())
        .collect();
    let mut queue: Vec<usize> = (0..n)
        .filter(|&i| remaining[i] && out_degree[i] == 0)
        .collect();
    while let Some(node) = queue.pop() {
        remaining[node] = false;
        for &dep in &reverse[node] {
            if remaining[dep] {
                out_degree[dep] -= 1;
                if out_degree[dep] == 0 {
                    queue.push(dep);
                }
            }
        }
    }

    let mut cyclic: Vec<UnitId> = (0..n)
        .filter(|&i| remaining[i])
        .map(|i| units[i].id.clone())
        .collect();
    cyclic.sort();
    cyclic
}

/// Resolves dependencies against the live store.
pub struct Resolver<'a> {
    store: &'a UnitStore,
    manifest: OrderManifest,
    cycles: BTreeSet<UnitId>,
}

impl<'a> Resolver<'a> {
    /// Load the manifest and run cycle detection over every known unit.
    pub fn load(store: &'a UnitStore) -> Result<Self> {
        let manifest = OrderManifest::load(&store.layout().order_manifest)?;
        let mut known = Vec::new();
        for status in [
            UnitStatus::Queued,
            UnitStatus::Staged,
            UnitStatus::Dispatched,
            UnitStatus::Completed,
            UnitStatus::Failed,
            UnitStatus::Blocked,
        ] {
            known.extend(store.list(status)?);
        }

        let cycles: BTreeSet<UnitId> = find_cycles(&known).into_iter().collect();
        if !cycles.is_empty() {
            let err = crate::errors::DependencyError::Cycle {
                units: cycles.iter().map(|id| id.to_string()).collect(),
            };
            tracing::error!(error = %err, "dependency configuration error");
        }

        Ok(Self {
            store,
            manifest,
            cycles,
        })
    }

    pub fn cycles(&self) -> Vec<UnitId> {
        self.cycles.iter().cloned().collect()
    }

    pub fn manifest(&self) -> &OrderManifest {
        &self.manifest
    }

    pub fn resolve(&self, patch: &Patch) -> Resolution {
        let dependencies: Vec<Dependency> = dependency_ids(patch, &self.manifest)
            .into_iter()
            .map(|(id, source)| {
                let state = DepState::from(self.store.locate(&id));
                Dependency { id, source, state }
            })
            .collect();

        let readiness = if self.cycles.contains(&patch.id) {
            Readiness::Cyclic
        } else if dependencies
            .iter()
            .any(|d| matches!(d.state, DepState::Failed | DepState::Missing))
        {
            Readiness::BlockedOnDependency
        } else if dependencies.iter().all(|d| d.state == DepState::Completed) {
            Readiness::Ready
        } else {
            Readiness::Waiting
        };

        Resolution {
            unit_id: patch.id.clone(),
            dependencies,
            readiness,
        }
    }

    /// Resolve every pending unit for the `dependencies` report.
    pub fn report(&self) -> Result<DependencyReport> {
        let mut resolutions = Vec::new();
        for status in [UnitStatus::Queued, UnitStatus::Staged] {
            for patch in self.store.list(status)? {
                resolutions.push(self.resolve(&patch));
            }
        }
        resolutions.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        Ok(DependencyReport {
            cycles: self.cycles(),
            resolutions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Layout;
    use crate::unit::{Phases, Step};
    use tempfile::TempDir;

    fn id(s: &str) -> UnitId {
        UnitId::parse(s).unwrap()
    }

    fn patch(s: &str, deps: &[&str]) -> Patch {
        Patch::new(
            id(s),
            Phases {
                validate: vec![Step::command("true")],
                ..Default::default()
            },
        )
        .with_dependencies(deps.iter().map(|d| id(d)).collect())
    }

    fn make_store() -> (UnitStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path().join(".patchwork"));
        layout.ensure_directories().unwrap();
        (UnitStore::new(layout), dir)
    }

    fn complete(store: &UnitStore, p: &Patch) {
        let mut p = p.clone();
        store.deposit(&p).unwrap();
        store.transition(&mut p, UnitStatus::Staged).unwrap();
        store.transition(&mut p, UnitStatus::Dispatched).unwrap();
        store.transition(&mut p, UnitStatus::Completed).unwrap();
    }

    #[test]
    fn test_find_cycles_reports_only_cycle_members() {
        let units = vec![
            patch("1.1-a", &["1.2-b"]),
            patch("1.2-b", &["1.1-a"]),
            patch("1.3-c", &["1.1-a"]),
            patch("1.4-d", &[]),
        ];
        let cycles = find_cycles(&units);
        assert_eq!(cycles, vec![id("1.1-a"), id("1.2-b")]);
    }

    #[test]
    fn test_find_cycles_empty_for_dag() {
        let units = vec![
            patch("1.1-a", &[]),
            patch("1.2-b", &["1.1-a"]),
            patch("1.3-c", &["1.1-a", "1.2-b"]),
        ];
        assert!(find_cycles(&units).is_empty());
    }

    #[test]
    fn test_dependency_ids_merge_manifest() {
        let manifest = OrderManifest::parse("1.0-x\n1.1-a\n1.5-c\n").unwrap();
        let p = patch("1.5-c", &["1.1-a", "1.2-b"]);
        let deps = dependency_ids(&p, &manifest);
        assert_eq!(
            deps,
            vec![
                (id("1.1-a"), DepSource::Declared),
                (id("1.2-b"), DepSource::Declared),
                (id("1.0-x"), DepSource::Manifest),
            ]
        );
    }

    #[test]
    fn test_resolve_readiness() {
        let (store, _dir) = make_store();
        let base = patch("1.1-base", &[]);
        complete(&store, &base);

        let ready = patch("1.2-ready", &["1.1-base"]);
        let waiting = patch("1.3-waiting", &["1.2-ready"]);
        let orphan = patch("1.4-orphan", &["9.9-nowhere"]);
        for p in [&ready, &waiting, &orphan] {
            store.deposit(p).unwrap();
        }

        let resolver = Resolver::load(&store).unwrap();
        assert_eq!(resolver.resolve(&ready).readiness, Readiness::Ready);
        assert_eq!(resolver.resolve(&waiting).readiness, Readiness::Waiting);

        let orphan_res = resolver.resolve(&orphan);
        assert_eq!(orphan_res.readiness, Readiness::BlockedOnDependency);
        assert_eq!(orphan_res.unsatisfied().next().unwrap().state, DepState::Missing);
    }

    #[test]
    fn test_resolve_manifest_predecessor_failed() {
        let (store, _dir) = make_store();
        std::fs::write(&store.layout().order_manifest, "1.1-a\n1.2-b\n").unwrap();
        let mut a = patch("1.1-a", &[]);
        store.deposit(&a).unwrap();
        store.transition(&mut a, UnitStatus::Failed).unwrap();
        let b = patch("1.2-b", &[]);
        store.deposit(&b).unwrap();

        let resolver = Resolver::load(&store).unwrap();
        let res = resolver.resolve(&b);
        assert_eq!(res.readiness, Readiness::BlockedOnDependency);
        assert_eq!(res.dependencies[0].source, DepSource::Manifest);
    }

    #[test]
    fn test_cyclic_units_never_ready() {
        let (store, _dir) = make_store();
        let a = patch("1.1-a", &["1.2-b"]);
        let b = patch("1.2-b", &["1.1-a"]);
        store.deposit(&a).unwrap();
        store.deposit(&b).unwrap();

        let resolver = Resolver::load(&store).unwrap();
        assert_eq!(resolver.resolve(&a).readiness, Readiness::Cyclic);
        let report = resolver.report().unwrap();
        assert_eq!(report.cycles.len(), 2);
        assert_eq!(report.resolutions.len(), 2);
    }
}
