//! The total-order manifest: one unit id per line, `#` starts a comment.

use crate::errors::DependencyError;
use crate::unit::UnitId;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct OrderManifest {
    entries: Vec<UnitId>,
    positions: HashMap<UnitId, usize>,
}

impl OrderManifest {
    /// Load the manifest. An absent file is an empty manifest.
    pub fn load(path: &Path) -> Result<Self, DependencyError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| DependencyError::ManifestRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, DependencyError> {
        let mut manifest = Self::default();
        for (n, line) in content.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let id = UnitId::parse(line).map_err(|_| DependencyError::ManifestEntry {
                line: n + 1,
                id: line.to_string(),
            })?;
            // First occurrence wins
            if !manifest.positions.contains_key(&id) {
                manifest.positions.insert(id.clone(), manifest.entries.len());
                manifest.entries.push(id);
            }
        }
        Ok(manifest)
    }

    pub fn entries(&self) -> &[UnitId] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every id listed before `id`. Empty if `id` is not in the manifest.
    pub fn predecessors(&self, id: &UnitId) -> &[UnitId] {
        match self.positions.get(id) {
            Some(&pos) => &self.entries[..pos],
            None => &[],
        }
    }
}
