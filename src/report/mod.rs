//! Structured JSON reports.
//!
//! Every component writes one report per invocation into `.patchwork/reports/`:
//! a timestamped file plus `<component>-latest.json`, which dashboards poll.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::util;

/// Envelope around a component's report body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report<T> {
    pub report_id: Uuid,
    pub component: String,
    pub generated_at: DateTime<Utc>,
    pub body: T,
}

pub struct ReportWriter {
    reports_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(reports_dir: &Path) -> Self {
        Self {
            reports_dir: reports_dir.to_path_buf(),
        }
    }

    /// Write a report and refresh the component's latest pointer.
    pub fn write<T: Serialize>(&self, component: &str, body: &T) -> Result<PathBuf> {
        let report = Report {
            report_id: Uuid::new_v4(),
            component: component.to_string(),
            generated_at: Utc::now(),
            body,
        };

        let filename = format!(
            "{}-{}_{}.json",
            component,
            report.generated_at.format("%Y-%m-%dT%H-%M-%S"),
            &report.report_id.simple().to_string()[..8]
        );
        let path = self.reports_dir.join(filename);
        util::write_json_atomic(&path, &report)?;
        util::write_json_atomic(&self.latest_path(component), &report)?;

        tracing::debug!(component, path = %path.display(), "report written");
        Ok(path)
    }

    pub fn latest_path(&self, component: &str) -> PathBuf {
        self.reports_dir.join(format!("{}-latest.json", component))
    }

    /// Read the latest report of a component, if any.
    pub fn latest<T: for<'de> Deserialize<'de>>(&self, component: &str) -> Result<Option<Report<T>>> {
        util::read_json_opt(&self.latest_path(component))
    }
}
