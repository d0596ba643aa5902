use std::path::{Path, PathBuf};

use crate::config::EngineConfig;
use crate::models::BatchId;

/// Refuses deletion of a batch that has no on-disk backup.
///
/// A batch's backup lives at `<backup_root>/batch_<id>/` and counts only if it
/// holds at least one regular file.
#[derive(Debug, Clone)]
pub struct RetentionGuard {
    enabled: bool,
    backup_root: PathBuf,
}

impl RetentionGuard {
    pub fn new(enabled: bool, backup_root: impl Into<PathBuf>) -> Self {
        Self {
            enabled,
            backup_root: backup_root.into(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, PathBuf::new())
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.retention_guard, config.retention_backup_dir.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    pub fn backup_dir(&self, batch_id: BatchId) -> PathBuf {
        self.backup_root.join(format!("batch_{batch_id}"))
    }

    /// Whether a backup with at least one regular file exists.
    /// Unreadable directories count as no backup.
    pub fn has_backup(&self, batch_id: BatchId) -> bool {
        let Ok(entries) = std::fs::read_dir(self.backup_dir(batch_id)) else {
            return false;
        };
        entries
            .flatten()
            .any(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
    }

    pub fn allows_delete(&self, batch_id: BatchId) -> bool {
        !self.enabled || self.has_backup(batch_id)
    }
}
