//! Persisted map of migrated descriptor ids to their destination paths.
//!
//! The cache file holds one `{descriptor_id}_{destination_path}` record per
//! line. It is loaded fully at startup and only ever appended to.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::path::DestinationPath;

#[derive(Debug, Default)]
pub struct DedupCache {
    path: PathBuf,
    entries: HashMap<String, String>,
}

impl DedupCache {
    /// Load the cache file at `path`. A missing file yields an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = HashMap::new();

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(Error::CacheIo { path, source }),
        };

        for (n, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once('_') {
                Some((id, target)) if !id.is_empty() && !target.is_empty() => {
                    entries.insert(id.to_string(), target.to_string());
                }
                _ => warn!(path = %path.display(), line = n + 1, "Skipping malformed cache line"),
            }
        }

        debug!(path = %path.display(), count = entries.len(), "Loaded dedup cache");
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, descriptor_id: u64) -> bool {
        self.entries.contains_key(&descriptor_id.to_string())
    }

    /// Destination previously recorded for `descriptor_id`.
    pub fn get(&self, descriptor_id: u64) -> Option<&str> {
        self.entries.get(&descriptor_id.to_string()).map(String::as_str)
    }

    /// Record a delivered message and append it to the cache file.
    ///
    /// Already-known ids are left untouched. The in-memory entry is kept
    /// even when the append fails.
    pub async fn insert(&mut self, destination: &DestinationPath) -> Result<()> {
        let id = destination.descriptor_id().to_string();
        if self.entries.contains_key(&id) {
            return Ok(());
        }
        let target = destination.to_string();
        let line = format!("{id}_{target}\n");
        self.entries.insert(id, target);
        self.append(line.as_bytes()).await
    }

    async fn append(&self, line: &[u8]) -> Result<()> {
        let cache_io = |source| Error::CacheIo {
            path: self.path.clone(),
            source,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(cache_io)?;
        file.write_all(line).await.map_err(cache_io)?;
        file.flush().await.map_err(cache_io)?;
        file.sync_data().await.map_err(cache_io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use tempfile::tempdir;

    use super::*;

    fn destination(id: u64) -> DestinationPath {
        DestinationPath::new(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), id, None)
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let cache = DedupCache::load(dir.path().join("absent.cache")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_load_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.cache");
        std::fs::write(&path, "12_2024-05-01/12.eml\ngarbage\n\n13_2024-05-01/13_a.eml\n").unwrap();

        let cache = DedupCache::load(&path).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(13), Some("2024-05-01/13_a.eml"));
        assert!(!cache.contains(99));
    }

    #[tokio::test]
    async fn test_insert_appends_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.cache");

        let mut cache = DedupCache::load(&path).unwrap();
        cache.insert(&destination(1)).await.unwrap();
        cache.insert(&destination(2)).await.unwrap();
        cache.insert(&destination(1)).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "1_2024-05-01/1.eml\n2_2024-05-01/2.eml\n");

        let reloaded = DedupCache::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains(2));
    }

    #[tokio::test]
    async fn test_insert_failure_keeps_memory_entry() {
        let dir = tempdir().unwrap();
        // A directory cannot be opened for appending.
        let mut cache = DedupCache::load(dir.path()).unwrap_or_default();
        cache.path = dir.path().to_path_buf();

        let err = cache.insert(&destination(7)).await.unwrap_err();
        assert!(matches!(err, Error::CacheIo { .. }));
        assert!(cache.contains(7));
    }
}
