//! Checksum lock and verify: `patchwork lock`, `patchwork verify`.

use anyhow::Result;
use console::style;
use std::path::Path;

use patchwork::integrity::{DigestAlgorithm, FileStatus, Integrity, ManifestEntry, Verdict};

use super::{Status, open_context};
use crate::Cli;

pub fn cmd_lock(
    project_dir: &Path,
    cli: &Cli,
    files: &[String],
    algorithm: Option<&str>,
) -> Result<Status> {
    let ctx = open_context(project_dir, cli)?;
    let integrity = Integrity::new(&ctx);

    let algorithm: DigestAlgorithm = match algorithm {
        Some(name) => name.parse()?,
        None => ctx.settings().integrity.algorithm,
    };
    let patterns = if files.is_empty() {
        ctx.settings().integrity.tracked.clone()
    } else {
        files.to_vec()
    };
    let files = integrity.expand(&patterns)?;
    let manifest = integrity.lock(&files, algorithm)?;

    for (path, entry) in &manifest.entries {
        match entry {
            ManifestEntry::Digest(d) => {
                println!("  {} {}  {}", style("✓").green(), &d.digest[..12.min(d.digest.len())], path)
            }
            ManifestEntry::Error { error } => {
                println!("  {} {}: {}", style("✗").red(), path, error)
            }
        }
    }
    println!();
    println!(
        "Locked {} file(s) with {} into {}",
        manifest.entries.len() - manifest.error_count(),
        manifest.algorithm,
        integrity.manifest_path().display()
    );
    if manifest.error_count() > 0 {
        println!(
            "{} {} file(s) could not be read",
            style("Warning:").yellow().bold(),
            manifest.error_count()
        );
    }

    Ok(Status::from_clean(manifest.error_count() == 0))
}

pub fn cmd_verify(project_dir: &Path, cli: &Cli) -> Result<Status> {
    let ctx = open_context(project_dir, cli)?;
    let report = Integrity::new(&ctx).verify()?;

    for check in &report.files {
        let mark = match check.status {
            FileStatus::Verified => style("VERIFIED").green(),
            FileStatus::Modified => style("MODIFIED").red(),
            FileStatus::Missing => style("MISSING").red(),
            FileStatus::Error => style("ERROR").red(),
        };
        match &check.detail {
            Some(detail) => println!("  {:<8} {} ({})", mark, check.path, detail),
            None => println!("  {:<8} {}", mark, check.path),
        }
    }
    if !report.signature_valid {
        println!("  {} manifest signature", style("INVALID").red().bold());
    }
    println!();

    let verdict = match report.verdict {
        Verdict::Pass => style("PASS").green().bold(),
        Verdict::Fail => style("FAIL").red().bold(),
    };
    println!(
        "{}: {} verified, {} modified, {} missing, {} error",
        verdict,
        report.count(FileStatus::Verified),
        report.count(FileStatus::Modified),
        report.count(FileStatus::Missing),
        report.count(FileStatus::Error)
    );

    Ok(Status::from_clean(report.verdict == Verdict::Pass))
}
