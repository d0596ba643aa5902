//! Classification cache keyed by file path.
//!
//! An entry is valid while the file's size and modification time match what
//! was recorded. The cache can be persisted as JSON; persistence is
//! best-effort and never blocks a run.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::IntakeFile;
use crate::pipeline::detection::ClassificationResult;

/// What the file looked like when it was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Fingerprint {
    size_bytes: u64,
    /// Milliseconds since the epoch; `None` when the file is not on disk.
    modified_ms: Option<i64>,
}

impl Fingerprint {
    fn of(file: &IntakeFile) -> Self {
        let modified_ms = std::fs::metadata(file.path())
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64);
        Self {
            size_bytes: file.size_bytes,
            modified_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    fingerprint: Fingerprint,
    result: ClassificationResult,
    cached_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ClassificationCache {
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
    persist_path: Option<PathBuf>,
}

impl ClassificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache backed by a JSON file. A missing or corrupt file starts empty.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<HashMap<PathBuf, CacheEntry>>(&bytes) {
                Ok(entries) => {
                    tracing::debug!(path = %path.display(), entries = entries.len(), "Classification cache loaded");
                    entries
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Classification cache unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            entries: Mutex::new(entries),
            persist_path: Some(path),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached result if the file is unchanged since it was classified.
    pub fn get(&self, file: &IntakeFile) -> Option<ClassificationResult> {
        let entries = self.entries();
        let entry = entries.get(file.path())?;
        if entry.fingerprint == Fingerprint::of(file) {
            Some(entry.result.clone())
        } else {
            tracing::debug!(file = %file.filename(), "Cached classification is stale");
            None
        }
    }

    pub fn insert(&self, file: &IntakeFile, result: ClassificationResult) {
        self.entries().insert(
            file.path().to_path_buf(),
            CacheEntry {
                fingerprint: Fingerprint::of(file),
                result,
                cached_at: Utc::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn persist_path(&self) -> Option<&Path> {
        self.persist_path.as_deref()
    }

    /// Write the cache to its backing file, if it has one.
    ///
    /// Each save goes through its own temp file in the target directory, so
    /// overlapping saves never share a partially written file.
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let json = serde_json::to_vec(&*self.entries())?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}
