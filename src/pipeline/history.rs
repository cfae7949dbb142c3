//! Successful releases, newest last

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Releases kept on disk
pub const HISTORY_LIMIT: usize = 20;

/// A release that passed verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub run_id: String,
    pub commit: String,
    /// Service to image reference as written to the host
    pub images: BTreeMap<String, String>,
    pub finished_at: DateTime<Utc>,
}

/// Release history
#[derive(Debug, Default)]
pub struct ReleaseHistory {
    path: Option<PathBuf>,
    releases: Vec<Release>,
}

impl ReleaseHistory {
    /// History that is never written to disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load history from a file; a missing file is an empty history
    pub fn load(path: &Path) -> Result<Self> {
        let releases = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            Vec::new()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            releases,
        })
    }

    /// Most recent release
    pub fn latest(&self) -> Option<&Release> {
        self.releases.last()
    }

    pub fn releases(&self) -> &[Release] {
        &self.releases
    }

    /// Append a release and persist
    pub fn record(&mut self, release: Release) -> Result<()> {
        debug!("Recording release {} ({})", release.run_id, release.commit);
        self.releases.push(release);
        if self.releases.len() > HISTORY_LIMIT {
            let excess = self.releases.len() - HISTORY_LIMIT;
            self.releases.drain(..excess);
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&self.releases)?)?;
        Ok(())
    }
}
