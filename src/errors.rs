//! Typed error hierarchy for the patchwork pipeline.
//!
//! Four enums cover the seams where callers need to match on a failure:
//! - `UnitError`: work-unit parsing, validation and store transitions
//! - `DependencyError`: dependency graph configuration errors
//! - `IntegrityError`: checksum lock/verify failures that abort a run
//! - `FleetError`: process supervisor failures
//!
//! Orchestration code above these seams uses `anyhow::Result` with context.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the work-unit store and the structural validator.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("Invalid unit identifier '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    #[error("Unit {id} is malformed: {reason}")]
    Malformed { id: String, reason: String },

    #[error("Failed to parse unit file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unit file {path} declares id '{declared}' but is named '{file_stem}'")]
    IdMismatch {
        path: PathBuf,
        declared: String,
        file_stem: String,
    },

    #[error("Unit {id} not found in state '{state}'")]
    NotFound { id: String, state: String },

    #[error("Unit {id} already exists in state '{state}'")]
    AlreadyExists { id: String, state: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl UnitError {
    /// True for failures caused by the unit's content rather than the environment.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            UnitError::InvalidId { .. }
                | UnitError::Malformed { .. }
                | UnitError::Parse { .. }
                | UnitError::IdMismatch { .. }
        )
    }
}

/// Configuration errors in the dependency graph.
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("Dependency cycle detected among units: {}", units.join(", "))]
    Cycle { units: Vec<String> },

    #[error("Unit {unit} depends on itself")]
    SelfDependency { unit: String },

    #[error("Failed to read order manifest {path}: {source}")]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Order manifest line {line}: invalid unit id '{id}'")]
    ManifestEntry { line: usize, id: String },
}

/// Errors that abort an integrity lock or verify run as a whole.
///
/// Per-file problems are recorded inline in the manifest or report instead.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("Checksum manifest not found at {0}")]
    ManifestMissing(PathBuf),

    #[error("Checksum manifest {path} is unreadable: {reason}")]
    ManifestCorrupt { path: PathBuf, reason: String },

    #[error("Unsupported digest algorithm '{0}'. Valid values: sha256, sha512")]
    UnsupportedAlgorithm(String),

    #[error("Invalid tracked-file pattern '{pattern}': {reason}")]
    BadPattern { pattern: String, reason: String },

    #[error("No files to lock")]
    NothingToLock,

    #[error("Failed to write {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// Errors from the process supervisor backing the fleet healer.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Supervisor command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Supervisor command '{command}' timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("Failed to parse supervisor process list: {0}")]
    BadProcessList(String),

    #[error("Service '{0}' is not in the allowlist")]
    NotAllowlisted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_error_structural_classification() {
        let err = UnitError::Malformed {
            id: "1.1-a".into(),
            reason: "no steps".into(),
        };
        assert!(err.is_structural());

        let err = UnitError::NotFound {
            id: "1.1-a".into(),
            state: "queued".into(),
        };
        assert!(!err.is_structural());

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = UnitError::Io {
            path: PathBuf::from("/tmp/x"),
            source: io,
        };
        assert!(!err.is_structural());
    }

    #[test]
    fn cycle_error_lists_units() {
        let err = DependencyError::Cycle {
            units: vec!["1.1-a".into(), "1.2-b".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("1.1-a"));
        assert!(msg.contains("1.2-b"));
    }

    #[test]
    fn fleet_timeout_carries_seconds() {
        let err = FleetError::Timeout {
            command: "pm2 jlist".into(),
            secs: 15,
        };
        match &err {
            FleetError::Timeout { secs, .. } => assert_eq!(*secs, 15),
            _ => panic!("Expected Timeout"),
        }
        assert!(err.to_string().contains("15"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&UnitError::InvalidId {
            id: "x".into(),
            reason: "y".into(),
        });
        assert_std_error(&DependencyError::SelfDependency { unit: "x".into() });
        assert_std_error(&IntegrityError::NothingToLock);
        assert_std_error(&FleetError::NotAllowlisted("x".into()));
    }
}
