//! On-disk usage state.
//!
//! The file is read by tools outside this process (dashboards, optimizer scripts), so every
//! write goes to a temp file in the same directory and is renamed over the target.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use super::counters::{QuotaRegistration, UsageCounters};

pub const USAGE_FILE_VERSION: u32 = 1;

/// Parse retries before giving up on a file another process may be replacing.
const LOAD_ATTEMPTS: u32 = 3;
const LOAD_RETRY_DELAY: Duration = Duration::from_millis(25);

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("usage file I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize usage state: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("usage file {path} is not valid: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persisted record of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedProvider {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<QuotaRegistration>,
    #[serde(flatten)]
    pub counters: UsageCounters,
}

/// Whole usage file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedUsage {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub providers: BTreeMap<String, PersistedProvider>,
}

impl PersistedUsage {
    #[must_use]
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self { version: USAGE_FILE_VERSION, updated_at: now, providers: BTreeMap::new() }
    }
}

/// Location of the usage file plus the lock serializing writers in this process.
#[derive(Debug)]
pub struct UsageStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl UsageStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the file, or returns `None` if it does not exist yet.
    ///
    /// A parse failure is retried a few times since an external writer may be mid-rename.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Io`] or, after the retries, [`PersistenceError::Parse`].
    pub fn load(&self) -> Result<Option<PersistedUsage>, PersistenceError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let raw = match std::fs::read(&self.path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(source) => return Err(PersistenceError::Io { path: self.path.clone(), source }),
            };

            match serde_json::from_slice::<PersistedUsage>(&raw) {
                Ok(usage) => return Ok(Some(usage)),
                Err(source) if attempt >= LOAD_ATTEMPTS => {
                    return Err(PersistenceError::Parse { path: self.path.clone(), source });
                }
                Err(e) => {
                    tracing::debug!(
                        path = %self.path.display(),
                        attempt = attempt,
                        error = %e,
                        "usage file unreadable, retrying"
                    );
                    std::thread::sleep(LOAD_RETRY_DELAY);
                }
            }
        }
    }

    /// Loads the file, creating it with an empty state if it is missing.
    ///
    /// # Errors
    ///
    /// Propagates load and save failures.
    pub fn load_or_init(&self) -> Result<PersistedUsage, PersistenceError> {
        if let Some(usage) = self.load()? {
            return Ok(usage);
        }
        let empty = PersistedUsage::empty(Utc::now());
        self.save(&empty)?;
        tracing::info!(path = %self.path.display(), "created usage file");
        Ok(empty)
    }

    /// Atomically replaces the file with `usage`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Serialize`] or [`PersistenceError::Io`].
    pub fn save(&self, usage: &PersistedUsage) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock();
        self.write_locked(usage)
    }

    /// Like [`UsageStore::save`], but builds the state while holding the write lock.
    ///
    /// Concurrent callers that snapshot live state this way land on disk in the order they
    /// took their snapshots, so an older snapshot never overwrites a newer one.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Serialize`] or [`PersistenceError::Io`].
    pub fn save_with<F>(&self, build: F) -> Result<(), PersistenceError>
    where
        F: FnOnce() -> PersistedUsage,
    {
        let _guard = self.write_lock.lock();
        self.write_locked(&build())
    }

    fn write_locked(&self, usage: &PersistedUsage) -> Result<(), PersistenceError> {
        let content = serde_json::to_vec_pretty(usage).map_err(PersistenceError::Serialize)?;
        write_atomic(&self.path, &content)
            .map_err(|source| PersistenceError::Io { path: self.path.clone(), source })
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("usage.json");
    let temp_path = parent.join(format!(".{file_name}.tmp.{}", std::process::id()));

    {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}
