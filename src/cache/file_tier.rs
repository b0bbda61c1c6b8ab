//! Durable on-disk tier
//!
//! One JSON file per key. The filename is a sanitized prefix of the key plus
//! the key's SHA-256, so any key maps to a legal, bounded-length name. The
//! file body is the serialized `CacheEntry` with the original key alongside.
//!
//! Writes land in a `tmp_<uuid>` file first and are renamed into place, so a
//! reader sees either the old record or the new one, never a partial write.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::backend::{StorageKind, TierBackend};
use super::entry::CacheEntry;
use super::error::CacheError;
use super::keys::sha256_hex;
use super::stats::{TierCounters, TierStats};

const READABLE_PREFIX_LEN: usize = 48;
const TEMP_PREFIX: &str = "tmp_";
const EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    key: String,
    #[serde(flatten)]
    entry: CacheEntry,
}

/// Directory-backed tier
pub struct FileTier {
    dir: PathBuf,
    counters: TierCounters,
}

impl FileTier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counters: TierCounters::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Filename for `key`
    pub fn file_name(key: &str) -> String {
        let prefix: String = key
            .chars()
            .take(READABLE_PREFIX_LEN)
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}-{}.{}", prefix, sha256_hex(key.as_bytes()), EXTENSION)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(Self::file_name(key))
    }

    fn is_record_file(path: &Path) -> bool {
        let is_json = path.extension().map(|e| e == EXTENSION).unwrap_or(false);
        let is_temp = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(TEMP_PREFIX))
            .unwrap_or(false);
        is_json && !is_temp
    }

    async fn read_record(path: &Path) -> Result<Option<FileRecord>, CacheError> {
        let bytes = match fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: FileRecord =
            serde_json::from_slice(&bytes).map_err(|e| CacheError::CorruptEntry {
                key: path.display().to_string(),
                reason: e.to_string(),
            })?;
        record
            .entry
            .validate()
            .map_err(|reason| CacheError::CorruptEntry {
                key: record.key.clone(),
                reason,
            })?;
        Ok(Some(record))
    }

    async fn record_paths(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut paths = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(paths),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if Self::is_record_file(&path) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    async fn remove_path(path: &Path) -> Result<bool, CacheError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete temp files left behind by an interrupted write
    async fn remove_temp_files(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let is_temp = item
                .file_name()
                .to_str()
                .map(|n| n.starts_with(TEMP_PREFIX))
                .unwrap_or(false);
            if is_temp && Self::remove_path(&item.path()).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl TierBackend for FileTier {
    fn kind(&self) -> StorageKind {
        StorageKind::File
    }

    async fn init(&self) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).await?;
        let orphans = self.remove_temp_files().await?;
        if orphans > 0 {
            debug!(dir = %self.dir.display(), removed = orphans, "Removed orphaned temp files");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let result = Self::read_record(&self.path_for(key)).await;
        match result {
            Ok(Some(record)) if record.key == key => {
                self.counters.record_hit();
                Ok(Some(record.entry))
            }
            Ok(Some(record)) => Err(CacheError::CorruptEntry {
                key: key.to_string(),
                reason: format!("file holds key {}", record.key),
            }),
            Ok(None) => {
                self.counters.record_miss();
                Ok(None)
            }
            Err(CacheError::CorruptEntry { reason, .. }) => {
                self.counters.record_error();
                Err(CacheError::CorruptEntry {
                    key: key.to_string(),
                    reason,
                })
            }
            Err(e) => {
                self.counters.record_error();
                Err(e)
            }
        }
    }

    async fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let record = FileRecord {
            key: key.to_string(),
            entry: entry.clone(),
        };
        let bytes = serde_json::to_vec(&record)?;

        let temp_path = self
            .dir
            .join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4()));
        let final_path = self.path_for(key);

        if let Err(e) = fs::write(&temp_path, &bytes).await {
            self.counters.record_error();
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp_path, &final_path).await {
            self.counters.record_error();
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        self.counters.record_write();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Self::remove_path(&self.path_for(key)).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize, CacheError> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for path in self.record_paths().await? {
            let stale = match Self::read_record(&path).await {
                Ok(Some(record)) => record.entry.is_expired(),
                Ok(None) => false,
                Err(e) if e.is_corrupt() => {
                    warn!(path = %path.display(), error = %e, "Removing corrupt cache file");
                    true
                }
                Err(e) => return Err(e),
            };
            if stale && Self::remove_path(&path).await? {
                removed += 1;
            }
        }
        self.counters.record_expirations(removed as u64);
        Ok(removed)
    }

    async fn clear(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for path in self.record_paths().await? {
            if Self::remove_path(&path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn stats(&self) -> TierStats {
        let item_count = self.record_paths().await.map(|p| p.len()).unwrap_or(0);
        let mut stats = TierStats {
            tier: "file",
            enabled: true,
            connected: true,
            item_count,
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        stats
    }

    /// Reads each file once instead of `keys` + `get`
    async fn entries(&self) -> Result<Vec<(String, CacheEntry)>, CacheError> {
        let mut out = Vec::new();
        for path in self.record_paths().await? {
            match Self::read_record(&path).await {
                Ok(Some(record)) => out.push((record.key, record.entry)),
                Ok(None) => {}
                Err(e) if e.is_corrupt() => {
                    debug!(path = %path.display(), "Skipping corrupt cache file");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::Headers;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    async fn tier() -> (tempfile::TempDir, FileTier) {
        let dir = tempfile::tempdir().unwrap();
        let tier = FileTier::new(dir.path());
        tier.init().await.unwrap();
        (dir, tier)
    }

    fn entry(ttl: u64) -> CacheEntry {
        CacheEntry::new(json!({"items": [1, 2, 3]}), Headers::new(), 200, ttl)
    }

    #[test]
    fn test_file_name_is_sanitized_and_bounded() {
        let key = format!("GET::https://example.com/a?b=c&d=e::{}", "x".repeat(500));
        let name = FileTier::file_name(&key);
        assert!(name.ends_with(".json"));
        assert!(name.len() <= READABLE_PREFIX_LEN + 1 + 64 + 5);
        assert!(!name.contains('/'));
        assert!(!name.contains(':'));
        assert!(!name.contains('?'));
        assert_ne!(name, FileTier::file_name("GET::https://example.com/a?b=c&d=f"));
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (_dir, tier) = tier().await;
        let e = entry(60);
        tier.put("GET::/items", &e).await.unwrap();

        let got = tier.get("GET::/items").await.unwrap().unwrap();
        assert_eq!(got, e);
        assert_eq!(tier.keys().await.unwrap(), vec!["GET::/items".to_string()]);

        assert!(tier.delete("GET::/items").await.unwrap());
        assert!(!tier.delete("GET::/items").await.unwrap());
        assert!(tier.get("GET::/items").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_is_atomic_replace() {
        let (dir, tier) = tier().await;
        tier.put("k", &entry(60)).await.unwrap();
        tier.put("k", &entry(120)).await.unwrap();

        assert_eq!(tier.get("k").await.unwrap().unwrap().ttl_seconds, 120);
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_reported() {
        let (dir, tier) = tier().await;
        std::fs::write(dir.path().join(FileTier::file_name("bad")), b"{not json").unwrap();

        let err = tier.get("bad").await.unwrap_err();
        assert!(err.is_corrupt());
        // Listing skips it, purge removes it
        assert!(tier.keys().await.unwrap().is_empty());
        assert_eq!(tier.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_live() {
        let (_dir, tier) = tier().await;
        let mut stale = entry(1);
        stale.created_at = Utc::now() - ChronoDuration::seconds(5);
        stale.last_accessed_at = stale.created_at;
        tier.put("stale", &stale).await.unwrap();
        tier.put("live", &entry(60)).await.unwrap();

        assert_eq!(tier.purge_expired().await.unwrap(), 1);
        assert_eq!(tier.keys().await.unwrap(), vec!["live".to_string()]);
    }

    #[tokio::test]
    async fn test_init_removes_orphaned_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tmp_orphan"), b"junk").unwrap();
        let tier = FileTier::new(dir.path());
        tier.init().await.unwrap();
        assert!(!dir.path().join("tmp_orphan").exists());
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let (_dir, tier) = tier().await;
        tier.put("a", &entry(60)).await.unwrap();
        tier.put("b", &entry(60)).await.unwrap();
        assert_eq!(tier.stats().await.item_count, 2);
        assert_eq!(tier.clear().await.unwrap(), 2);
        assert_eq!(tier.stats().await.item_count, 0);
    }
}
