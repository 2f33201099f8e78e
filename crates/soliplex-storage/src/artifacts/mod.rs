//! Content-addressed artifact storage.
//!
//! Artifacts are typed byte blobs keyed by (content hash, artifact kind,
//! storage root). The store never interprets bytes; `put` is
//! overwrite-idempotent. The backend is selected by configuration, not by
//! type hierarchy: each backend is a variant satisfying the same
//! capability interface.

mod db;
mod fs;
mod s3;

use async_trait::async_trait;

use soliplex_core::ArtifactKind;

pub use db::DbArtifactStore;
pub use fs::FsArtifactStore;
pub use s3::S3ArtifactStore;

/// Error type for artifact operations
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// No artifact stored under (hash, kind)
    #[error("artifact not found: {hash}/{kind}")]
    NotFound { hash: String, kind: ArtifactKind },

    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Object-store or database failure
    #[error("backend error: {0}")]
    Backend(String),
}

/// Capability interface every artifact backend satisfies.
///
/// All operations are safe to call concurrently for distinct keys.
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    /// Store bytes under (hash, kind). Writing the same bytes twice is a
    /// no-op observationally.
    async fn put(&self, hash: &str, kind: ArtifactKind, bytes: &[u8]) -> Result<(), ArtifactError>;

    /// Fetch the bytes under (hash, kind).
    async fn get(&self, hash: &str, kind: ArtifactKind) -> Result<Vec<u8>, ArtifactError>;

    async fn exists(&self, hash: &str, kind: ArtifactKind) -> Result<bool, ArtifactError>;

    /// Remove every artifact kind stored for the hash, returning how many
    /// were removed. Used only by cascading deletion; any backend error
    /// must fail the enclosing transaction.
    async fn delete_all_for(&self, hash: &str) -> Result<usize, ArtifactError>;
}

/// Two-character shard prefix used in storage paths.
pub(crate) fn shard_prefix(hash: &str) -> &str {
    &hash[..hash.len().min(2)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_prefix() {
        assert_eq!(shard_prefix("abcdef"), "ab");
        assert_eq!(shard_prefix("a"), "a");
        assert_eq!(shard_prefix(""), "");
    }
}
