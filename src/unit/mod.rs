//! Work units ("patches") and their on-disk store.
//!
//! A patch is an identified, ordered set of phases. Each phase is a list of
//! atomic steps: shell commands run by the executor, or mutation tasks that
//! write content to a target path. The identifier carries the ordering key
//! used by the sequencer.
//!
//! ```json
//! {
//!   "id": "12.3-add-retry-logic",
//!   "depends_on": ["12.1-create-config"],
//!   "phases": {
//!     "preMutation": [{ "run": "mkdir -p conf" }],
//!     "mutation": [{ "target": "conf/app.toml", "content": "retries = 3\n" }],
//!     "validate": [{ "run": "grep -q retries conf/app.toml", "timeout_secs": 30 }]
//!   }
//! }
//! ```

mod store;

pub use store::{ScanEntry, UnitStore};
pub(crate) use store::json_files;

use crate::errors::UnitError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Component, PathBuf};
use std::sync::LazyLock;

static UNIT_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:patch-)?(\d{1,9})[.-](\d{1,9})-([A-Za-z0-9][A-Za-z0-9._-]*)$").unwrap()
});

/// Unit identifier: `<major>.<minor>-<slug>`, optionally prefixed with `patch-`.
///
/// Ordering compares `(major, minor, slug)` numerically, so `2.10-x` sorts after
/// `2.9-x`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitId {
    raw: String,
    major: u32,
    minor: u32,
    slug: String,
}

impl UnitId {
    pub fn parse(raw: &str) -> Result<Self, UnitError> {
        let raw = raw.trim();
        let caps = UNIT_ID_REGEX.captures(raw).ok_or_else(|| UnitError::InvalidId {
            id: raw.to_string(),
            reason: "expected <major>.<minor>-<slug>".to_string(),
        })?;
        let major = caps[1].parse::<u32>().map_err(|e| UnitError::InvalidId {
            id: raw.to_string(),
            reason: e.to_string(),
        })?;
        let minor = caps[2].parse::<u32>().map_err(|e| UnitError::InvalidId {
            id: raw.to_string(),
            reason: e.to_string(),
        })?;
        if caps[3].contains("..") {
            return Err(UnitError::InvalidId {
                id: raw.to_string(),
                reason: "slug may not contain '..'".to_string(),
            });
        }
        Ok(Self {
            raw: raw.to_string(),
            major,
            minor,
            slug: caps[3].to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// The `(major, minor)` ordering key.
    pub fn ordering_key(&self) -> (u32, u32) {
        (self.major, self.minor)
    }

    /// Whether two ids name the same unit, ignoring the `patch-` prefix and
    /// the major/minor separator.
    pub fn same_unit(&self, other: &UnitId) -> bool {
        (self.major, self.minor, &self.slug) == (other.major, other.minor, &other.slug)
    }

    /// File name used for every per-unit record.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.raw)
    }
}

impl Ord for UnitId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, &self.slug, &self.raw).cmp(&(
            other.major,
            other.minor,
            &other.slug,
            &other.raw,
        ))
    }
}

impl PartialOrd for UnitId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for UnitId {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for UnitId {
    type Error = UnitError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UnitId> for String {
    fn from(id: UnitId) -> Self {
        id.raw
    }
}

/// The four phases of a patch, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PhaseKind {
    PreMutation,
    Mutation,
    Validate,
    PostMutationBuild,
}

impl PhaseKind {
    /// All phases in execution order.
    pub fn all() -> &'static [PhaseKind] {
        &[
            PhaseKind::PreMutation,
            PhaseKind::Mutation,
            PhaseKind::Validate,
            PhaseKind::PostMutationBuild,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::PreMutation => "preMutation",
            PhaseKind::Mutation => "mutation",
            PhaseKind::Validate => "validate",
            PhaseKind::PostMutationBuild => "postMutationBuild",
        }
    }

    /// Accepts the camelCase and snake_case spellings.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "preMutation" | "pre_mutation" => Some(PhaseKind::PreMutation),
            "mutation" => Some(PhaseKind::Mutation),
            "validate" => Some(PhaseKind::Validate),
            "postMutationBuild" | "post_mutation_build" => Some(PhaseKind::PostMutationBuild),
            _ => None,
        }
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A shell command step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandStep {
    pub run: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Working directory relative to the workspace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

/// How a mutation task applies its content to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationMode {
    /// Replace the file content
    #[default]
    Write,
    /// Append content to the file
    Append,
    /// Append content as a line unless an identical line is present
    EnsureLine,
}

impl MutationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationMode::Write => "write",
            MutationMode::Append => "append",
            MutationMode::EnsureLine => "ensure_line",
        }
    }
}

/// A structured mutation: put `content` into `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MutationTask {
    /// Path relative to the workspace
    pub target: PathBuf,
    pub content: String,
    #[serde(default)]
    pub mode: MutationMode,
}

/// One atomic step within a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Step {
    Command(CommandStep),
    Mutation(MutationTask),
}

impl Step {
    pub fn command(run: &str) -> Self {
        Step::Command(CommandStep {
            run: run.to_string(),
            timeout_secs: None,
            cwd: None,
        })
    }

    pub fn write(target: &str, content: &str) -> Self {
        Step::Mutation(MutationTask {
            target: PathBuf::from(target),
            content: content.to_string(),
            mode: MutationMode::Write,
        })
    }

    /// Short human-readable description used in logs and outcome records.
    pub fn describe(&self) -> String {
        match self {
            Step::Command(c) => format!("run: {}", c.run),
            Step::Mutation(m) => format!("{} {}", m.mode.as_str(), m.target.display()),
        }
    }
}

/// Steps grouped by phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Phases {
    #[serde(default, alias = "pre_mutation", skip_serializing_if = "Vec::is_empty")]
    pub pre_mutation: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutation: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validate: Vec<Step>,
    #[serde(
        default,
        alias = "post_mutation_build",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub post_mutation_build: Vec<Step>,
}

impl Phases {
    pub fn steps(&self, kind: PhaseKind) -> &[Step] {
        match kind {
            PhaseKind::PreMutation => &self.pre_mutation,
            PhaseKind::Mutation => &self.mutation,
            PhaseKind::Validate => &self.validate,
            PhaseKind::PostMutationBuild => &self.post_mutation_build,
        }
    }

    pub fn steps_mut(&mut self, kind: PhaseKind) -> &mut Vec<Step> {
        match kind {
            PhaseKind::PreMutation => &mut self.pre_mutation,
            PhaseKind::Mutation => &mut self.mutation,
            PhaseKind::Validate => &mut self.validate,
            PhaseKind::PostMutationBuild => &mut self.post_mutation_build,
        }
    }

    pub fn step_count(&self) -> usize {
        PhaseKind::all().iter().map(|k| self.steps(*k).len()).sum()
    }

    /// Iterate over every step with its phase, in execution order.
    pub fn iter(&self) -> impl Iterator<Item = (PhaseKind, &Step)> {
        PhaseKind::all()
            .iter()
            .flat_map(move |k| self.steps(*k).iter().map(move |s| (*k, s)))
    }
}

/// A declarative check that a unit's intended effect is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Postcondition {
    FileExists { path: PathBuf },
    FileAbsent { path: PathBuf },
    /// The file content matches the regex `pattern`
    FileContains { path: PathBuf, pattern: String },
    FileEquals { path: PathBuf, content: String },
    CommandSucceeds {
        run: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
}

/// Lifecycle state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    #[default]
    Queued,
    Staged,
    Dispatched,
    Completed,
    Failed,
    Blocked,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Queued => "queued",
            UnitStatus::Staged => "staged",
            UnitStatus::Dispatched => "dispatched",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
            UnitStatus::Blocked => "blocked",
        }
    }

    /// Completed and Blocked admit no automatic transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::Blocked)
    }

    /// Check the lifecycle state machine.
    ///
    /// `Blocked → Staged` and `Blocked → Completed` are allowed because clearing
    /// a quarantine (restore or quick-win) is an explicit operation.
    pub fn can_transition_to(&self, to: UnitStatus) -> bool {
        use UnitStatus::*;
        matches!(
            (self, to),
            (Queued, Staged)
                | (Staged, Dispatched)
                | (Staged, Failed)
                | (Dispatched, Completed)
                | (Dispatched, Failed)
                | (Failed, Staged)
                | (Failed, Completed)
                | (Failed, Blocked)
                | (Blocked, Staged)
                | (Blocked, Completed)
        )
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a completed unit reached completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    Executor,
    QuickWin,
}

/// Completion record stored on completed units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub completed_at: DateTime<Utc>,
    pub attempts: u32,
    pub via: CompletionSource,
}

/// A work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub id: UnitId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<UnitId>,
    pub phases: Phases,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub postconditions: Vec<Postcondition>,
    /// Overrides `sequencer.soft_validate` for this unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_soft: Option<bool>,
    #[serde(default)]
    pub status: UnitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<Completion>,
}

impl Patch {
    pub fn new(id: UnitId, phases: Phases) -> Self {
        Self {
            id,
            description: String::new(),
            depends_on: Vec::new(),
            phases,
            postconditions: Vec::new(),
            validate_soft: None,
            status: UnitStatus::Queued,
            submitted_at: None,
            completion: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<UnitId>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_postconditions(mut self, postconditions: Vec<Postcondition>) -> Self {
        self.postconditions = postconditions;
        self
    }

    /// Parse a unit from JSON text and check its structure.
    pub fn from_json(content: &str) -> Result<Self, UnitError> {
        let patch: Patch = serde_json::from_str(content).map_err(|e| UnitError::Malformed {
            id: "<unparsed>".to_string(),
            reason: e.to_string(),
        })?;
        patch.validate()?;
        Ok(patch)
    }

    /// Structural validation performed at the store boundary.
    ///
    /// Checks shape only; the semantic content of steps is opaque.
    pub fn validate(&self) -> Result<(), UnitError> {
        let malformed = |reason: String| UnitError::Malformed {
            id: self.id.to_string(),
            reason,
        };

        if self.phases.step_count() == 0 {
            return Err(malformed("unit has no steps in any phase".to_string()));
        }

        for (kind, step) in self.phases.iter() {
            match step {
                Step::Command(c) => {
                    if c.run.trim().is_empty() {
                        return Err(malformed(format!("empty command in phase {}", kind)));
                    }
                    if c.timeout_secs == Some(0) {
                        return Err(malformed(format!("zero timeout in phase {}", kind)));
                    }
                    if let Some(ref cwd) = c.cwd {
                        check_relative(cwd).map_err(|r| malformed(format!("cwd {}", r)))?;
                    }
                }
                Step::Mutation(m) => {
                    check_relative(&m.target)
                        .map_err(|r| malformed(format!("mutation target {}", r)))?;
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        for dep in &self.depends_on {
            if dep == &self.id {
                return Err(malformed("unit depends on itself".to_string()));
            }
            if !seen.insert(dep) {
                return Err(malformed(format!("duplicate dependency {}", dep)));
            }
        }

        for post in &self.postconditions {
            match post {
                Postcondition::FileExists { path }
                | Postcondition::FileAbsent { path }
                | Postcondition::FileEquals { path, .. } => {
                    check_relative(path).map_err(|r| malformed(format!("postcondition {}", r)))?;
                }
                Postcondition::FileContains { path, pattern } => {
                    check_relative(path).map_err(|r| malformed(format!("postcondition {}", r)))?;
                    Regex::new(pattern).map_err(|e| {
                        malformed(format!("postcondition pattern '{}': {}", pattern, e))
                    })?;
                }
                Postcondition::CommandSucceeds { run, .. } => {
                    if run.trim().is_empty() {
                        return Err(malformed("empty postcondition command".to_string()));
                    }
                }
            }
        }

        Ok(())
    }

    /// All mutation tasks across phases.
    pub fn mutation_tasks(&self) -> Vec<&MutationTask> {
        self.phases
            .iter()
            .filter_map(|(_, step)| match step {
                Step::Mutation(m) => Some(m),
                Step::Command(_) => None,
            })
            .collect()
    }
}

fn check_relative(path: &std::path::Path) -> Result<(), String> {
    if path.as_os_str().is_empty() {
        return Err("is empty".to_string());
    }
    for component in path.components() {
        match component {
            Component::ParentDir => return Err(format!("'{}' escapes the workspace", path.display())),
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("'{}' must be relative", path.display()));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> UnitId {
        UnitId::parse(s).unwrap()
    }

    #[test]
    fn test_unit_id_parse() {
        let uid = id("12.3-add-retry");
        assert_eq!(uid.major(), 12);
        assert_eq!(uid.minor(), 3);
        assert_eq!(uid.slug(), "add-retry");
        assert_eq!(uid.file_name(), "12.3-add-retry.json");

        let prefixed = id("patch-4-2-fix_auth");
        assert_eq!(prefixed.ordering_key(), (4, 2));
        assert_eq!(prefixed.slug(), "fix_auth");
    }

    #[test]
    fn test_unit_id_rejects_bad_ids() {
        for bad in ["", "abc", "1.2", "1.2-", "1.2-../x", "1.2-a/b", "x1.2-a"] {
            assert!(UnitId::parse(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_unit_id_ordering_is_numeric() {
        let mut ids = vec![id("2.10-a"), id("2.9-a"), id("1.20-z"), id("2.9-0")];
        ids.sort();
        let raw: Vec<&str> = ids.iter().map(|i| i.as_str()).collect();
        assert_eq!(raw, vec!["1.20-z", "2.9-0", "2.9-a", "2.10-a"]);
    }

    #[test]
    fn test_unit_id_serde_as_string() {
        let uid = id("3.1-x");
        let json = serde_json::to_string(&uid).unwrap();
        assert_eq!(json, "\"3.1-x\"");
        let back: UnitId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uid);
        assert!(serde_json::from_str::<UnitId>("\"nope\"").is_err());
    }

    #[test]
    fn test_patch_from_json_accepts_both_phase_spellings() {
        let camel = r#"{"id":"1.1-a","phases":{"preMutation":[{"run":"true"}],"postMutationBuild":[{"run":"true"}]}}"#;
        let snake = r#"{"id":"1.1-a","phases":{"pre_mutation":[{"run":"true"}],"post_mutation_build":[{"run":"true"}]}}"#;
        let a = Patch::from_json(camel).unwrap();
        let b = Patch::from_json(snake).unwrap();
        assert_eq!(a.phases, b.phases);
        assert_eq!(a.status, UnitStatus::Queued);
    }

    #[test]
    fn test_patch_step_variants() {
        let json = r#"{"id":"1.1-a","phases":{
            "mutation":[{"target":"conf/a.txt","content":"x","mode":"ensure_line"}],
            "validate":[{"run":"test -f conf/a.txt","timeout_secs":5}]}}"#;
        let patch = Patch::from_json(json).unwrap();
        match &patch.phases.mutation[0] {
            Step::Mutation(m) => assert_eq!(m.mode, MutationMode::EnsureLine),
            _ => panic!("Expected mutation"),
        }
        match &patch.phases.validate[0] {
            Step::Command(c) => assert_eq!(c.timeout_secs, Some(5)),
            _ => panic!("Expected command"),
        }
        assert_eq!(patch.mutation_tasks().len(), 1);
    }

    #[test]
    fn test_patch_rejects_unknown_phase() {
        let json = r#"{"id":"1.1-a","phases":{"deploy":[{"run":"true"}]}}"#;
        assert!(Patch::from_json(json).is_err());
    }

    #[test]
    fn test_patch_validation_failures() {
        let cases = [
            r#"{"id":"1.1-a","phases":{}}"#,
            r#"{"id":"1.1-a","phases":{"validate":[{"run":"  "}]}}"#,
            r#"{"id":"1.1-a","phases":{"mutation":[{"target":"/etc/passwd","content":"x"}]}}"#,
            r#"{"id":"1.1-a","phases":{"mutation":[{"target":"../x","content":"x"}]}}"#,
            r#"{"id":"1.1-a","depends_on":["1.1-a"],"phases":{"validate":[{"run":"true"}]}}"#,
            r#"{"id":"1.1-a","depends_on":["1.0-b","1.0-b"],"phases":{"validate":[{"run":"true"}]}}"#,
            r#"{"id":"1.1-a","phases":{"validate":[{"run":"true","timeout_secs":0}]}}"#,
        ];
        for case in cases {
            let err = Patch::from_json(case).unwrap_err();
            assert!(err.is_structural(), "{} should be structural", case);
        }
    }

    #[test]
    fn test_status_transitions() {
        use UnitStatus::*;
        assert!(Queued.can_transition_to(Staged));
        assert!(Staged.can_transition_to(Dispatched));
        assert!(Dispatched.can_transition_to(Completed));
        assert!(Failed.can_transition_to(Staged));
        assert!(Failed.can_transition_to(Blocked));
        assert!(!Completed.can_transition_to(Staged));
        assert!(!Queued.can_transition_to(Dispatched));
        assert!(!Queued.can_transition_to(Failed));
        assert!(Completed.is_terminal());
        assert!(Blocked.is_terminal());
        assert!(!Failed.is_terminal());
    }

    #[test]
    fn test_phases_iter_in_execution_order() {
        let phases = Phases {
            pre_mutation: vec![Step::command("a")],
            mutation: vec![Step::write("f", "x")],
            validate: vec![Step::command("b")],
            post_mutation_build: vec![Step::command("c")],
        };
        let kinds: Vec<PhaseKind> = phases.iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, PhaseKind::all().to_vec());
        assert_eq!(phases.step_count(), 4);
    }
}
