//! Persistent conversion cache.
//!
//! ## Layout
//!
//! ```text
//! {dir}/
//!   3f/
//!     3fa1…e9.json   ← sha256("{identifier}\0{version}")
//! ```
//!
//! One JSON document per entry holds the key, `created_at` and the full
//! [`ConversionResult`]. An in-memory index built at [`CacheStore::open`]
//! answers lookups without touching the disk for misses. Writes go to a
//! temporary file in the shard directory and are renamed into place, so a
//! reader sees either the old entry or the new one, never a torn file.

use crate::config::MethodPreference;
use crate::error::PipelineError;
use crate::identifier::ItemIdentifier;
use crate::output::ConversionResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Temp files younger than this may belong to a writer in another process.
const STALE_TEMP_AGE: Duration = Duration::from_secs(10 * 60);

/// Cache key: normalized identifier plus conversion version tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub identifier: String,
    pub version: String,
}

impl CacheKey {
    pub fn new(identifier: &ItemIdentifier, version: impl Into<String>) -> Self {
        Self {
            identifier: identifier.as_str().to_string(),
            version: version.into(),
        }
    }

    /// Key for results produced under `method`.
    pub fn for_method(identifier: &ItemIdentifier, method: MethodPreference) -> Self {
        Self::new(identifier, method.version_tag())
    }

    fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.identifier.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.version.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    key: CacheKey,
    created_at: DateTime<Utc>,
    result: ConversionResult,
}

/// Leading fields of an entry; enough to rebuild the index.
#[derive(Deserialize)]
struct EntryHeader {
    key: CacheKey,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct IndexRecord {
    path: PathBuf,
    created_at: DateTime<Utc>,
}

/// On-disk cache of conversion results.
#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    index: RwLock<HashMap<CacheKey, IndexRecord>>,
}

impl CacheStore {
    /// Open (creating if needed) the cache at `dir` and index its entries.
    ///
    /// Undecodable entries and stray temporary files are removed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let dir = dir.into();
        let scan_dir = dir.clone();
        let index = tokio::task::spawn_blocking(move || scan(&scan_dir))
            .await
            .map_err(|e| PipelineError::Internal(format!("cache scan task: {e}")))??;
        debug!("cache at {} holds {} entries", dir.display(), index.len());
        Ok(Self {
            dir,
            index: RwLock::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.read_index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.read_index().contains_key(key)
    }

    /// Look up `key`. A miss is `Ok(None)`.
    ///
    /// # Errors
    /// [`PipelineError::CacheIo`] if the entry cannot be read, and
    /// [`PipelineError::CacheEncoding`] if it cannot be decoded; in the
    /// latter case the entry has already been evicted.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<ConversionResult>, PipelineError> {
        let Some(record) = self.read_index().get(key).cloned() else {
            return Ok(None);
        };

        let bytes = match tokio::fs::read(&record.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.write_index().remove(key);
                return Ok(None);
            }
            Err(source) => {
                return Err(PipelineError::CacheIo {
                    path: record.path,
                    source,
                })
            }
        };

        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.key == *key => Ok(Some(entry.result)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!("evicting corrupt cache entry {}: {}", record.path.display(), e);
                self.write_index().remove(key);
                let _ = tokio::fs::remove_file(&record.path).await;
                Err(PipelineError::CacheEncoding {
                    path: record.path,
                    detail: e.to_string(),
                })
            }
        }
    }

    /// Store `result` under `key`, replacing any previous entry.
    pub async fn put(&self, key: &CacheKey, result: &ConversionResult) -> Result<(), PipelineError> {
        let path = self.entry_path(key);
        let created_at = Utc::now();
        let entry = CacheEntry {
            key: key.clone(),
            created_at,
            result: result.clone(),
        };
        let json = serde_json::to_vec(&entry).map_err(|e| PipelineError::CacheEncoding {
            path: path.clone(),
            detail: e.to_string(),
        })?;

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&target, &json))
            .await
            .map_err(|e| PipelineError::Internal(format!("cache write task: {e}")))??;

        self.write_index()
            .insert(key.clone(), IndexRecord { path, created_at });
        Ok(())
    }

    /// Remove the entry for `key`. Returns whether one existed.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool, PipelineError> {
        let indexed = self.write_index().remove(key).is_some();
        let path = self.entry_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(indexed),
            Err(source) => Err(PipelineError::CacheIo { path, source }),
        }
    }

    /// Remove entries created more than `age` ago. Returns how many were
    /// removed.
    pub async fn purge_older_than(&self, age: Duration) -> Result<usize, PipelineError> {
        let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let expired: Vec<(CacheKey, PathBuf)> = self
            .read_index()
            .iter()
            .filter(|(_, r)| r.created_at <= cutoff)
            .map(|(k, r)| (k.clone(), r.path.clone()))
            .collect();

        let mut removed = 0;
        for (key, path) in expired {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(PipelineError::CacheIo { path, source }),
            }
            self.write_index().remove(&key);
        }
        debug!("purged {} cache entries", removed);
        Ok(removed)
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let digest = key.digest();
        self.dir.join(&digest[..2]).join(format!("{digest}.json"))
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, HashMap<CacheKey, IndexRecord>> {
        self.index.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_index(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<CacheKey, IndexRecord>> {
        self.index.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
    move |source| PipelineError::CacheIo {
        path: path.to_path_buf(),
        source,
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let shard = path.parent().unwrap_or(path);
    std::fs::create_dir_all(shard).map_err(io_error(shard))?;
    let mut tmp = tempfile::NamedTempFile::new_in(shard).map_err(io_error(shard))?;
    tmp.write_all(bytes).map_err(io_error(tmp.path()))?;
    tmp.as_file().sync_all().map_err(io_error(path))?;
    tmp.persist(path).map_err(|e| PipelineError::CacheIo {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

fn scan(dir: &Path) -> Result<HashMap<CacheKey, IndexRecord>, PipelineError> {
    std::fs::create_dir_all(dir).map_err(io_error(dir))?;
    let mut index = HashMap::new();

    for shard in std::fs::read_dir(dir).map_err(io_error(dir))? {
        let shard = shard.map_err(io_error(dir))?.path();
        if !shard.is_dir() {
            continue;
        }
        for file in std::fs::read_dir(&shard).map_err(io_error(&shard))? {
            let path = file.map_err(io_error(&shard))?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if name.starts_with(".tmp") {
                if is_stale(&path, STALE_TEMP_AGE) {
                    debug!("removing abandoned temp file {}", path.display());
                    let _ = std::fs::remove_file(&path);
                }
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let header = std::fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|b| serde_json::from_slice::<EntryHeader>(&b).map_err(|e| e.to_string()));
            match header {
                Ok(h) => {
                    index.insert(
                        h.key,
                        IndexRecord {
                            path,
                            created_at: h.created_at,
                        },
                    );
                }
                Err(e) => {
                    warn!("removing unreadable cache entry {}: {}", path.display(), e);
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }
    Ok(index)
}

fn is_stale(path: &Path, age: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .is_some_and(|elapsed| elapsed >= age)
}
