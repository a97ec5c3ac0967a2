//! Directory layout and configuration
//!
//! Bundles the paths shared by branches and snapshots: where objects
//! live, where snapshot files go, and where per-peer branch state is
//! kept. Stored as `sync-options.json` when persisted.

use crate::version::UserId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Paths used by the sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Content-addressed object files
    pub objects_dir: PathBuf,
    /// Snapshot state files, one per name tag
    pub snapshots_dir: PathBuf,
    /// Per-peer branch state files
    pub branches_dir: PathBuf,
}

impl SyncOptions {
    /// Standard layout under a single root directory
    pub fn under(root: &Path) -> Self {
        Self {
            objects_dir: root.join("objects"),
            snapshots_dir: root.join("snapshots"),
            branches_dir: root.join("branches"),
        }
    }

    /// Create all directories of the layout
    pub fn create_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.objects_dir)
            .with_context(|| format!("Failed to create {:?}", self.objects_dir))?;
        fs::create_dir_all(&self.snapshots_dir)
            .with_context(|| format!("Failed to create {:?}", self.snapshots_dir))?;
        fs::create_dir_all(&self.branches_dir)
            .with_context(|| format!("Failed to create {:?}", self.branches_dir))?;
        Ok(())
    }

    /// State file path for the branch of the given peer
    pub fn branch_state_path(&self, user: &UserId) -> PathBuf {
        self.branches_dir.join(user.to_string())
    }

    /// Load options from `root/sync-options.json`, falling back to the
    /// standard layout when the file does not exist.
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join("sync-options.json");
        if !config_path.exists() {
            return Ok(Self::under(root));
        }
        let data = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read options from {:?}", config_path))?;
        let options: SyncOptions =
            serde_json::from_str(&data).with_context(|| "Failed to parse options JSON")?;
        Ok(options)
    }

    /// Save options to `root/sync-options.json`.
    pub fn save(&self, root: &Path) -> Result<()> {
        let config_path = root.join("sync-options.json");
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }
}
