//! File-backed storage: a single JSON document guarded by a directory lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use super::{CredentialStore, apply_usage_delta};
use crate::record::{CredentialRecord, CredentialStats};

const LOCK_RETRIES: u32 = 10;
const LOCK_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Serialize, Deserialize, Default)]
struct Document {
    keys: Vec<CredentialRecord>,
}

/// A `<path>.lock` directory, created with `mkdir` (atomic on POSIX) and
/// removed on every exit path — success, error, or panic.
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    async fn acquire(data_path: &Path) -> Result<Self> {
        let lock_path = lock_path_for(data_path);
        for attempt in 0..LOCK_RETRIES {
            match fs::create_dir(&lock_path).await {
                Ok(()) => return Ok(Self { path: lock_path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt + 1 == LOCK_RETRIES {
                        break;
                    }
                    debug!(attempt, path = %lock_path.display(), "credential file lock held; retrying");
                    tokio::time::sleep(LOCK_BACKOFF).await;
                }
                Err(e) => {
                    return Err(Error::unavailable(format!(
                        "failed to acquire file lock {}: {e}",
                        lock_path.display()
                    )));
                }
            }
        }
        warn!(path = %lock_path.display(), retries = LOCK_RETRIES, "gave up acquiring credential file lock");
        Err(Error::unavailable(format!(
            "timed out acquiring file lock {}",
            lock_path.display()
        )))
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // Best-effort: a failed removal leaves a stale lock that the next
        // acquire will eventually have to fight past; there is no
        // synchronous cleanup path from a sync Drop anyway.
        let _ = std::fs::remove_dir(&self.path);
    }
}

fn lock_path_for(data_path: &Path) -> PathBuf {
    let mut s = data_path.as_os_str().to_owned();
    s.push(".lock");
    PathBuf::from(s)
}

fn tmp_path_for(data_path: &Path) -> PathBuf {
    let mut s = data_path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

/// Single-JSON-document credential store.
///
/// Mutating operations hold the directory lock for their full duration;
/// read-only operations skip it, accepting a possibly-stale read.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `path`. Does not touch the filesystem
    /// until [`initialize`](CredentialStore::initialize) or a read/write
    /// call is made.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_document(&self) -> Result<Document> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::internal(format!("corrupt credential file: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::default()),
            Err(e) => Err(Error::unavailable(format!("read credential file: {e}"))),
        }
    }

    async fn write_document(&self, doc: &Document) -> Result<()> {
        let tmp = tmp_path_for(&self.path);
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| Error::internal(format!("serialize credential file: {e}")))?;
        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| Error::unavailable(format!("write tmp credential file: {e}")))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::unavailable(format!("rename credential file: {e}")))
    }

    /// Drop fully-expired usage windows across all keys. Not part of the
    /// request path; invoked opportunistically by maintenance tasks.
    pub async fn compact(&self, now: DateTime<Utc>) -> Result<()> {
        let _lock = DirLock::acquire(&self.path).await?;
        let mut doc = self.read_document().await?;
        let span = chrono::Duration::hours(5);
        let mut purged = 0usize;
        for record in &mut doc.keys {
            let before = record.usage_windows.len();
            record.usage_windows.retain(|w| w.window_start >= now - span);
            purged += before - record.usage_windows.len();
        }
        if purged > 0 {
            debug!(purged, keys = doc.keys.len(), "compacted stale usage windows");
        }
        self.write_document(&doc).await
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn initialize(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::unavailable(format!("create data dir: {e}")))?;
            }
        }
        if fs::metadata(&self.path).await.is_err() {
            let _lock = DirLock::acquire(&self.path).await?;
            if fs::metadata(&self.path).await.is_err() {
                self.write_document(&Document::default()).await?;
            }
        }
        Ok(())
    }

    async fn find(&self, key: &str) -> Result<Option<CredentialRecord>> {
        let doc = self.read_document().await?;
        Ok(doc.keys.into_iter().find(|r| r.key == key))
    }

    async fn update_usage(
        &self,
        key: &str,
        tokens_used: i64,
        _model: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let _lock = DirLock::acquire(&self.path).await?;
        let mut doc = self.read_document().await?;
        let record = doc
            .keys
            .iter_mut()
            .find(|r| r.key == key)
            .ok_or_else(|| Error::internal(format!("unknown credential key {key}")))?;

        apply_usage_delta(&mut record.usage_windows, tokens_used, now);
        if tokens_used > 0 {
            record.total_lifetime_tokens =
                record.total_lifetime_tokens.saturating_add(tokens_used as u64);
        }
        record.last_used = Some(now);

        self.write_document(&doc).await
    }

    async fn stats(&self, key: &str) -> Result<Option<CredentialStats>> {
        let Some(record) = self.find(key).await? else {
            return Ok(None);
        };
        let now = gateway_core::now();
        let span = chrono::Duration::hours(5);
        let used: u64 = record
            .usage_windows
            .iter()
            .filter(|w| w.window_start >= now - span)
            .map(|w| w.tokens_used)
            .sum();
        Ok(Some(CredentialStats {
            tokens_used_in_current_window: used,
            remaining_tokens: record.token_limit_per_5h.saturating_sub(used),
            is_expired: record.is_expired(now),
            total_lifetime_tokens: record.total_lifetime_tokens,
        }))
    }
}

/// Admin-surface helper: insert or replace a record. Not part of the
/// request path — exercised by tests and by whatever eventually
/// implements the `/admin/api/keys` surface.
pub async fn upsert(store: &FileStore, record: CredentialRecord) -> Result<()> {
    let _lock = DirLock::acquire(&store.path).await?;
    let mut doc = store.read_document().await?;
    let mut by_key: HashMap<String, CredentialRecord> =
        doc.keys.drain(..).map(|r| (r.key.clone(), r)).collect();
    by_key.insert(record.key.clone(), record);
    doc.keys = by_key.into_values().collect();
    store.write_document(&doc).await
}
