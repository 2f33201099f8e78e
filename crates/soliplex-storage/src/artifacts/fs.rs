//! Filesystem artifact backend.
//!
//! Layout: `<root>/<storage_root>/<hash[0:2]>/<hash>/<kind>` with raw
//! bytes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use soliplex_core::ArtifactKind;

use super::{shard_prefix, ArtifactError, ArtifactStore};

/// Artifact store backed by a local directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
    storage_root: String,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>, storage_root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            storage_root: storage_root.into(),
        }
    }

    fn hash_dir(&self, hash: &str) -> PathBuf {
        self.root
            .join(&self.storage_root)
            .join(shard_prefix(hash))
            .join(hash)
    }

    fn artifact_path(&self, hash: &str, kind: ArtifactKind) -> PathBuf {
        self.hash_dir(hash).join(kind.as_str())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, hash: &str, kind: ArtifactKind, bytes: &[u8]) -> Result<(), ArtifactError> {
        let dir = self.hash_dir(hash);
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.artifact_path(hash, kind);
        tokio::fs::write(&path, bytes).await?;

        debug!(%hash, %kind, size = bytes.len(), "stored artifact");
        Ok(())
    }

    async fn get(&self, hash: &str, kind: ArtifactKind) -> Result<Vec<u8>, ArtifactError> {
        match tokio::fs::read(self.artifact_path(hash, kind)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ArtifactError::NotFound {
                hash: hash.to_string(),
                kind,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, hash: &str, kind: ArtifactKind) -> Result<bool, ArtifactError> {
        Ok(tokio::fs::try_exists(self.artifact_path(hash, kind)).await?)
    }

    async fn delete_all_for(&self, hash: &str) -> Result<usize, ArtifactError> {
        let dir = self.hash_dir(hash);

        let mut count = 0;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while entries.next_entry().await?.is_some() {
            count += 1;
        }

        tokio::fs::remove_dir_all(&dir).await?;
        debug!(%hash, count, "deleted artifacts");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "default");
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (_dir, store) = store();
        let hash = soliplex_core::content_hash(b"payload");

        store.put(&hash, ArtifactKind::Raw, b"payload").await.unwrap();
        assert_eq!(store.get(&hash, ArtifactKind::Raw).await.unwrap(), b"payload");
        assert!(store.exists(&hash, ArtifactKind::Raw).await.unwrap());
        assert!(!store.exists(&hash, ArtifactKind::Chunks).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_is_overwrite_idempotent() {
        let (_dir, store) = store();
        let hash = soliplex_core::content_hash(b"same");

        store.put(&hash, ArtifactKind::Raw, b"same").await.unwrap();
        store.put(&hash, ArtifactKind::Raw, b"same").await.unwrap();
        assert_eq!(store.get(&hash, ArtifactKind::Raw).await.unwrap(), b"same");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_dir, store) = store();
        let err = store.get("deadbeef", ArtifactKind::Raw).await.unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_sharded_layout() {
        let (dir, store) = store();
        let hash = "ab".to_string() + &"c".repeat(62);
        store.put(&hash, ArtifactKind::Raw, b"x").await.unwrap();

        let expected = dir.path().join("default").join("ab").join(&hash).join("raw");
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn test_delete_all_for_removes_every_kind() {
        let (_dir, store) = store();
        let hash = soliplex_core::content_hash(b"doc");

        store.put(&hash, ArtifactKind::Raw, b"doc").await.unwrap();
        store.put(&hash, ArtifactKind::ParsedText, b"text").await.unwrap();
        store.put(&hash, ArtifactKind::Chunks, b"[]").await.unwrap();

        assert_eq!(store.delete_all_for(&hash).await.unwrap(), 3);
        assert!(!store.exists(&hash, ArtifactKind::Raw).await.unwrap());
        // Deleting again is a no-op
        assert_eq!(store.delete_all_for(&hash).await.unwrap(), 0);
    }
}
