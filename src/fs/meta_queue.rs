//! Bounded computation of per-file metadata snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::{Result, SyncError};
use crate::fs::hash::hash_file_async;

/// Hash reported for every directory; directories are never hashed.
pub const DIRECTORY_HASH: &str = "directory";

/// Canonical snapshot of one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncData {
    /// Tree-relative, slash-separated name.
    pub name: String,
    pub exists: bool,
    pub is_directory: bool,
    /// Hex digest, [`DIRECTORY_HASH`] for directories, empty if missing.
    pub hash_code: String,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
}

impl SyncData {
    pub fn missing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exists: false,
            is_directory: false,
            hash_code: String::new(),
            modified: None,
        }
    }

    /// Whether both snapshots describe the same content.
    pub fn same_content(&self, other: &SyncData) -> bool {
        self.exists == other.exists
            && self.is_directory == other.is_directory
            && self.hash_code == other.hash_code
    }
}

/// Fixed-concurrency queue of metadata jobs.
///
/// Jobs above the limit wait on a fair semaphore, so they start in the
/// order they were submitted.
#[derive(Debug, Clone)]
pub struct FileMetaQueue {
    permits: Arc<Semaphore>,
}

impl FileMetaQueue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Stat `path` and, for regular files, hash its content.
    pub async fn compute(&self, path: &Path, name: &str) -> Result<SyncData> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SyncError::Protocol("metadata queue closed".into()))?;

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(SyncData::missing(name));
            }
            Err(e) => return Err(SyncError::filesystem(e, "reading metadata of", path)),
        };

        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);

        if metadata.is_dir() {
            return Ok(SyncData {
                name: name.to_string(),
                exists: true,
                is_directory: true,
                hash_code: DIRECTORY_HASH.to_string(),
                modified,
            });
        }

        let hash_code = hash_file_async(path)
            .await
            .map_err(|e| SyncError::filesystem(e, "hashing", path))?;

        Ok(SyncData {
            name: name.to_string(),
            exists: true,
            is_directory: false,
            hash_code,
            modified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::hash::hash_bytes;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempdir().unwrap();
        let queue = FileMetaQueue::new(2);

        let data = queue.compute(&dir.path().join("nope"), "nope").await.unwrap();
        assert_eq!(data, SyncData::missing("nope"));
    }

    #[tokio::test]
    async fn test_directory_uses_sentinel() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let queue = FileMetaQueue::new(2);

        let data = queue.compute(&dir.path().join("sub"), "sub").await.unwrap();
        assert!(data.exists);
        assert!(data.is_directory);
        assert_eq!(data.hash_code, DIRECTORY_HASH);
        assert!(data.modified.is_some());
    }

    #[tokio::test]
    async fn test_file_is_hashed() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        let queue = FileMetaQueue::new(1);

        let data = queue.compute(&dir.path().join("a.txt"), "a.txt").await.unwrap();
        assert!(data.exists);
        assert!(!data.is_directory);
        assert_eq!(data.hash_code, hash_bytes(b"alpha"));
    }

    #[tokio::test]
    async fn test_many_jobs_through_single_slot() {
        let dir = tempdir().unwrap();
        for i in 0..8 {
            std::fs::write(dir.path().join(format!("f{}", i)), format!("{}", i)).unwrap();
        }
        let queue = FileMetaQueue::new(1);

        let jobs = (0..8).map(|i| {
            let queue = queue.clone();
            let path = dir.path().join(format!("f{}", i));
            async move { queue.compute(&path, &format!("f{}", i)).await }
        });
        let results = futures::future::join_all(jobs).await;

        for (i, result) in results.into_iter().enumerate() {
            let data = result.unwrap();
            assert_eq!(data.hash_code, hash_bytes(format!("{}", i).as_bytes()));
        }
    }

    #[test]
    fn test_wire_field_names() {
        let data = SyncData::missing("x");
        let value = serde_json::to_value(&data).unwrap();
        assert!(value.get("isDirectory").is_some());
        assert!(value.get("hashCode").is_some());
    }
}
