//! Persisted fallback store for cached values
//!
//! Stores each cache entry as a JSON document on disk so that stale values
//! survive process restarts. One directory per cache namespace, one file per
//! key.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use directories::ProjectDirs;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::StoreError;

/// Counter for unique temporary file names within this process
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Document written to disk for a single key
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry<T> {
    /// The cache key this document belongs to
    key: String,
    /// The cache namespace (faculties, courses, schedule, ...)
    #[serde(rename = "type")]
    kind: String,
    /// The cached value
    value: T,
    /// When the value was written
    cached_at: DateTime<Utc>,
    /// When the value stops being fresh
    expires_at: DateTime<Utc>,
}

/// Just enough of a stored document to decide whether to purge it
#[derive(Debug, Deserialize)]
struct ExpiryHeader {
    expires_at: DateTime<Utc>,
}

/// A value read back from the persisted store
#[derive(Debug, Clone)]
pub struct Persisted<T> {
    /// The stored value
    pub value: T,
    /// When the value was written
    pub cached_at: DateTime<Utc>,
    /// When the value stops being fresh
    pub expires_at: DateTime<Utc>,
}

impl<T> Persisted<T> {
    /// Whether the stored value has passed its expiry time
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// File-backed key/value store for one cache namespace
///
/// Documents live under `<root>/<kind>/`. Writes go to a temporary file first
/// and are renamed into place, so readers never observe a partial document.
#[derive(Debug, Clone)]
pub struct PersistedStore {
    /// Directory holding this namespace's documents
    dir: PathBuf,
    /// Namespace name, recorded in every document
    kind: String,
}

impl PersistedStore {
    /// Creates a store for `kind` below `root`
    pub fn new(root: impl Into<PathBuf>, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        let dir = root.into().join(&kind);
        Self { dir, kind }
    }

    /// Returns the XDG-compliant default root directory
    ///
    /// Uses `~/.cache/timetable-cache/` on Linux. Returns `None` if the
    /// directory cannot be determined (e.g., no home directory).
    pub fn default_root() -> Option<PathBuf> {
        let project_dirs = ProjectDirs::from("", "", "timetable-cache")?;
        Some(project_dirs.cache_dir().to_path_buf())
    }

    /// The namespace this store writes
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The directory holding this namespace's documents
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }

    /// Writes `value` for `key`, replacing any previous document
    pub fn write<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;

        let entry = StoredEntry {
            key: key.to_string(),
            kind: self.kind.clone(),
            value,
            cached_at: Utc::now(),
            expires_at,
        };
        let json = serde_json::to_string_pretty(&entry)?;

        let path = self.entry_path(key);
        let temp = path.with_extension(format!(
            "{}.{}.tmp",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&temp, json)?;
        if let Err(err) = fs::rename(&temp, &path) {
            let _ = fs::remove_file(&temp);
            return Err(err.into());
        }
        Ok(())
    }

    /// Reads the document for `key`
    ///
    /// Returns `Ok(None)` when there is no document, or when the document on
    /// disk belongs to a different key or namespace.
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Persisted<T>>, StoreError> {
        let content = match fs::read_to_string(self.entry_path(key)) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let entry: StoredEntry<T> = serde_json::from_str(&content)?;
        if entry.key != key || entry.kind != self.kind {
            return Ok(None);
        }

        Ok(Some(Persisted {
            value: entry.value,
            cached_at: entry.cached_at,
            expires_at: entry.expires_at,
        }))
    }

    /// Deletes the document for `key`, if any
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.entry_path(key)) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    /// Deletes the document for `key` if it still carries `expires_at`
    ///
    /// A document rewritten since then is left alone. Returns whether a file
    /// was removed.
    pub fn remove_if_expires_at(
        &self,
        key: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let path = self.entry_path(key);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let header: ExpiryHeader = serde_json::from_str(&content)?;
        if header.expires_at != expires_at {
            return Ok(false);
        }

        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes documents that expired more than `grace` ago
    ///
    /// Unreadable documents are deleted as well. Returns the number of files
    /// removed.
    pub fn purge_expired(&self, grace: Duration) -> Result<usize, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let grace = ChronoDuration::from_std(grace).unwrap_or(ChronoDuration::MAX);
        let now = Utc::now();
        let mut removed = 0;

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            let purge = match fs::read_to_string(&path)
                .map_err(StoreError::from)
                .and_then(|content| {
                    serde_json::from_str::<ExpiryHeader>(&content).map_err(StoreError::from)
                })
            {
                Ok(header) => now.signed_duration_since(header.expires_at) > grace,
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "purging unreadable store document");
                    true
                }
            };

            if purge {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Ok(removed)
    }
}

/// Turns an arbitrary key into a portable file name
///
/// ASCII alphanumerics, `-` and `_` are kept; every other byte becomes `%XX`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}
