//! Per-target extraction checkpoints.

use super::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Active,
    /// The list was walked to its end (or the per-target cap was hit).
    Exhausted,
}

/// Everything accepted so far from one target's list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionCheckpoint {
    pub campaign: String,
    pub target_id: String,
    /// Acceptance order. Used as a set.
    pub seen_identities: Vec<String>,
    pub seen_count: u64,
    pub estimated_total: Option<u64>,
    pub status: CheckpointStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ExtractionCheckpoint {
    pub fn new(campaign: impl Into<String>, target_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            campaign: campaign.into(),
            target_id: target_id.into(),
            seen_identities: Vec::new(),
            seen_count: 0,
            estimated_total: None,
            status: CheckpointStatus::Active,
            created_at: now,
            last_updated: now,
        }
    }

    /// Last accepted identity; where scrolling picks up after a restart.
    pub fn resume_hint(&self) -> Option<&str> {
        self.seen_identities.last().map(String::as_str)
    }

    pub fn is_exhausted(&self) -> bool {
        self.status == CheckpointStatus::Exhausted
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.seen_identities.iter().any(|s| s == identity)
    }

    /// Set union that keeps acceptance order. Returns how many were new.
    pub fn merge(&mut self, identities: &[String]) -> usize {
        let mut known: HashSet<&str> = self.seen_identities.iter().map(String::as_str).collect();
        let fresh: Vec<String> = identities
            .iter()
            .filter(|id| known.insert(id.as_str()))
            .cloned()
            .collect();
        let added = fresh.len();
        self.seen_identities.extend(fresh);
        self.seen_count = self.seen_identities.len() as u64;
        if added > 0 {
            self.last_updated = Utc::now();
        }
        added
    }
}

/// Durable checkpoint storage for one campaign.
///
/// Every method returns only after the change is on disk.
pub trait CheckpointStore: Send + Sync {
    /// `None` when the target has never been started.
    fn load(&self, target: &str) -> Result<Option<ExtractionCheckpoint>, StoreError>;

    /// Merge a detector-confirmed batch and persist it.
    fn append(&self, target: &str, identities: &[String])
        -> Result<ExtractionCheckpoint, StoreError>;

    fn record_estimate(
        &self,
        target: &str,
        total: Option<u64>,
    ) -> Result<ExtractionCheckpoint, StoreError>;

    fn mark_exhausted(&self, target: &str) -> Result<ExtractionCheckpoint, StoreError>;
}

/// One pretty-printed JSON file per target under `<dir>/<campaign>/`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    campaign: String,
}

impl FileCheckpointStore {
    pub fn new(root: impl AsRef<Path>, campaign: &str) -> Result<Self, StoreError> {
        let dir = root.as_ref().join(sanitize(campaign));
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self {
            dir,
            campaign: campaign.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, target: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(target)))
    }

    /// All checkpoints of the campaign, sorted by target.
    pub fn list(&self) -> Result<Vec<ExtractionCheckpoint>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        let mut out = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            out.push(read_checkpoint(&path)?);
        }
        out.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        Ok(out)
    }

    fn load_or_new(&self, target: &str) -> Result<ExtractionCheckpoint, StoreError> {
        Ok(self
            .load(target)?
            .unwrap_or_else(|| ExtractionCheckpoint::new(&self.campaign, target)))
    }

    fn save(&self, checkpoint: &ExtractionCheckpoint) -> Result<(), StoreError> {
        let path = self.path_for(&checkpoint.target_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(checkpoint).map_err(|e| StoreError::json(&path, e))?;

        let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(&json).map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        drop(file);
        fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;

        debug!(
            "Checkpoint {}/{}: {} seen ({:?})",
            checkpoint.campaign, checkpoint.target_id, checkpoint.seen_count, checkpoint.status
        );
        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, target: &str) -> Result<Option<ExtractionCheckpoint>, StoreError> {
        let path = self.path_for(target);
        if !path.exists() {
            return Ok(None);
        }
        read_checkpoint(&path).map(Some)
    }

    fn append(
        &self,
        target: &str,
        identities: &[String],
    ) -> Result<ExtractionCheckpoint, StoreError> {
        let mut checkpoint = self.load_or_new(target)?;
        if checkpoint.merge(identities) > 0 || !self.path_for(target).exists() {
            self.save(&checkpoint)?;
        }
        Ok(checkpoint)
    }

    fn record_estimate(
        &self,
        target: &str,
        total: Option<u64>,
    ) -> Result<ExtractionCheckpoint, StoreError> {
        let mut checkpoint = self.load_or_new(target)?;
        checkpoint.estimated_total = total;
        checkpoint.last_updated = Utc::now();
        self.save(&checkpoint)?;
        Ok(checkpoint)
    }

    fn mark_exhausted(&self, target: &str) -> Result<ExtractionCheckpoint, StoreError> {
        let mut checkpoint = self.load_or_new(target)?;
        checkpoint.status = CheckpointStatus::Exhausted;
        checkpoint.last_updated = Utc::now();
        self.save(&checkpoint)?;
        Ok(checkpoint)
    }
}

fn read_checkpoint(path: &Path) -> Result<ExtractionCheckpoint, StoreError> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::json(path, e))
}

/// File-name-safe form of a campaign or target name.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
