//! Checksum lock and verify for tracked configuration artifacts.
//!
//! `lock` digests every tracked file into `integrity/manifest.json` and signs
//! the manifest bytes into `integrity/manifest.sig.json`. `verify` recomputes
//! digests and compares; it never touches the manifest. A mismatch is an
//! operator-visible fault and is never repaired automatically.
//!
//! Unreadable files do not abort a lock: the entry records the error inline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::digest::DynDigest;
use sha2::{Digest, Sha256, Sha512};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::context::PipelineContext;
use crate::errors::IntegrityError;
use crate::report::ReportWriter;
use crate::util;

const MANIFEST_FILE: &str = "manifest.json";
const SIGNATURE_FILE: &str = "manifest.sig.json";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    fn hasher(&self) -> Box<dyn DynDigest> {
        match self {
            DigestAlgorithm::Sha256 => Box::new(Sha256::new()),
            DigestAlgorithm::Sha512 => Box::new(Sha512::new()),
        }
    }

    /// Hex digest of a byte slice.
    pub fn digest_bytes(&self, bytes: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Hex digest and size of a file, read in chunks.
    pub fn digest_file(&self, path: &Path) -> std::io::Result<(String, u64)> {
        let mut file = File::open(path)?;
        let mut hasher = self.hasher();
        let mut buf = [0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        Ok((hex::encode(hasher.finalize()), size))
    }
}

impl std::fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DigestAlgorithm::Sha256 => write!(f, "sha256"),
            DigestAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

impl std::str::FromStr for DigestAlgorithm {
    type Err = IntegrityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(IntegrityError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub algorithm: DigestAlgorithm,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

/// Manifest entry: a digest, or the error that prevented one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ManifestEntry {
    Digest(FileDigest),
    Error { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub algorithm: DigestAlgorithm,
    pub created_at: DateTime<Utc>,
    /// Keyed by path relative to the project directory
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn error_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, ManifestEntry::Error { .. }))
            .count()
    }
}

/// Tamper evidence for the manifest file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub algorithm: DigestAlgorithm,
    /// Digest of the manifest file bytes
    pub manifest_digest: String,
    pub signed_at: DateTime<Utc>,
    pub entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Verified,
    Modified,
    Missing,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCheck {
    pub path: String,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Body of the `integrity` report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub verdict: Verdict,
    pub signature_valid: bool,
    pub counts: BTreeMap<FileStatus, usize>,
    pub files: Vec<FileCheck>,
}

impl VerifyReport {
    pub fn count(&self, status: FileStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

pub struct Integrity<'a> {
    project_dir: &'a Path,
    dir: &'a Path,
    reports: &'a ReportWriter,
}

impl<'a> Integrity<'a> {
    pub fn new(ctx: &'a PipelineContext) -> Self {
        Self {
            project_dir: &ctx.config.project_dir,
            dir: &ctx.layout().integrity_dir,
            reports: &ctx.reports,
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn signature_path(&self) -> PathBuf {
        self.dir.join(SIGNATURE_FILE)
    }

    /// Expand tracked patterns into project-relative file paths.
    ///
    /// A pattern is a literal file, a directory (walked recursively) or a glob.
    /// Literal paths that do not exist are kept so the lock records an error
    /// entry for them.
    pub fn expand(&self, patterns: &[String]) -> Result<Vec<String>, IntegrityError> {
        let mut files = Vec::new();
        for pattern in patterns {
            let full = self.project_dir.join(pattern);
            if full.is_dir() {
                for entry in WalkDir::new(&full).follow_links(false).sort_by_file_name() {
                    let entry = entry.map_err(|e| IntegrityError::BadPattern {
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    })?;
                    if entry.file_type().is_file() {
                        files.push(self.relative(entry.path()));
                    }
                }
            } else if pattern.contains(['*', '?', '[']) {
                let full_pattern = full.to_string_lossy().to_string();
                let paths = glob::glob(&full_pattern).map_err(|e| IntegrityError::BadPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
                for path in paths.flatten() {
                    if path.is_file() {
                        files.push(self.relative(&path));
                    }
                }
            } else {
                files.push(pattern.trim_start_matches("./").to_string());
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(self.project_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Digest `files` and write the manifest and its signature.
    pub fn lock(&self, files: &[String], algorithm: DigestAlgorithm) -> Result<Manifest, IntegrityError> {
        if files.is_empty() {
            return Err(IntegrityError::NothingToLock);
        }

        let mut entries = BTreeMap::new();
        for file in files {
            let path = self.project_dir.join(file);
            let entry = match algorithm.digest_file(&path) {
                Ok((digest, size)) => ManifestEntry::Digest(FileDigest {
                    algorithm,
                    digest,
                    size,
                    modified: std::fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .ok()
                        .map(DateTime::<Utc>::from),
                }),
                Err(e) => {
                    tracing::warn!(file = %file, error = %e, "could not digest tracked file");
                    ManifestEntry::Error {
                        error: e.to_string(),
                    }
                }
            };
            entries.insert(file.clone(), entry);
        }

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            algorithm,
            created_at: Utc::now(),
            entries,
        };
        let bytes = serde_json::to_vec_pretty(&manifest).map_err(|e| IntegrityError::Write {
            path: self.manifest_path(),
            reason: e.to_string(),
        })?;
        let signature = Signature {
            algorithm,
            manifest_digest: algorithm.digest_bytes(&bytes),
            signed_at: Utc::now(),
            entries: manifest.entries.len(),
        };

        let manifest_path = self.manifest_path();
        util::write_atomic(&manifest_path, &bytes).map_err(|e| IntegrityError::Write {
            path: manifest_path.clone(),
            reason: format!("{:#}", e),
        })?;
        let signature_path = self.signature_path();
        util::write_json_atomic(&signature_path, &signature).map_err(|e| {
            IntegrityError::Write {
                path: signature_path.clone(),
                reason: format!("{:#}", e),
            }
        })?;

        tracing::info!(
            files = manifest.entries.len(),
            errors = manifest.error_count(),
            %algorithm,
            "checksum manifest locked"
        );
        Ok(manifest)
    }

    fn read_manifest(&self) -> Result<(Manifest, Vec<u8>), IntegrityError> {
        let path = self.manifest_path();
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IntegrityError::ManifestMissing(path));
            }
            Err(e) => {
                return Err(IntegrityError::ManifestCorrupt {
                    path,
                    reason: e.to_string(),
                });
            }
        };
        let manifest = serde_json::from_slice(&bytes).map_err(|e| IntegrityError::ManifestCorrupt {
            path,
            reason: e.to_string(),
        })?;
        Ok((manifest, bytes))
    }

    fn signature_valid(&self, manifest_bytes: &[u8]) -> bool {
        match util::read_json_opt::<Signature>(&self.signature_path()) {
            Ok(Some(sig)) => sig.algorithm.digest_bytes(manifest_bytes) == sig.manifest_digest,
            Ok(None) => {
                tracing::warn!("manifest signature missing");
                false
            }
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "manifest signature unreadable");
                false
            }
        }
    }

    /// Recompute every digest and compare. Read-only apart from the report.
    pub fn verify(&self) -> Result<VerifyReport, IntegrityError> {
        let (manifest, bytes) = self.read_manifest()?;
        let signature_valid = self.signature_valid(&bytes);

        let mut files = Vec::with_capacity(manifest.entries.len());
        for (file, entry) in &manifest.entries {
            files.push(self.check(file, entry));
        }

        let mut counts = BTreeMap::new();
        for check in &files {
            *counts.entry(check.status).or_insert(0) += 1;
        }
        let all_verified = files.iter().all(|f| f.status == FileStatus::Verified);
        let verdict = if all_verified && signature_valid {
            Verdict::Pass
        } else {
            Verdict::Fail
        };

        for check in files.iter().filter(|f| f.status != FileStatus::Verified) {
            tracing::error!(file = %check.path, status = ?check.status, "integrity check failed");
        }

        let report = VerifyReport {
            verdict,
            signature_valid,
            counts,
            files,
        };
        self.reports
            .write("integrity", &report)
            .map_err(|e| IntegrityError::Write {
                path: self.reports.latest_path("integrity"),
                reason: format!("{:#}", e),
            })?;
        Ok(report)
    }

    fn check(&self, file: &str, entry: &ManifestEntry) -> FileCheck {
        let expected = match entry {
            ManifestEntry::Digest(d) => d,
            ManifestEntry::Error { error } => {
                return FileCheck {
                    path: file.to_string(),
                    status: FileStatus::Error,
                    expected: None,
                    actual: None,
                    detail: Some(format!("not digested at lock time: {}", error)),
                };
            }
        };

        let path = self.project_dir.join(file);
        let (status, actual, detail) = match expected.algorithm.digest_file(&path) {
            Ok((digest, _)) if digest == expected.digest => (FileStatus::Verified, Some(digest), None),
            Ok((digest, _)) => (FileStatus::Modified, Some(digest), None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (FileStatus::Missing, None, None),
            Err(e) => (FileStatus::Error, None, Some(e.to_string())),
        };
        FileCheck {
            path: file.to_string(),
            status,
            expected: Some(expected.digest.clone()),
            actual,
            detail,
        }
    }
}
