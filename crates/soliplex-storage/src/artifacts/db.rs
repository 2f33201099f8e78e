//! Database artifact backend.
//!
//! Stores bytes in the `document_bytes` table keyed by (hash, kind,
//! storage root), sharing the relational store's pool.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::debug;

use soliplex_core::ArtifactKind;

use super::{ArtifactError, ArtifactStore};

/// Artifact store backed by the relational database.
#[derive(Debug, Clone)]
pub struct DbArtifactStore {
    pool: PgPool,
    storage_root: String,
}

impl DbArtifactStore {
    pub fn new(pool: PgPool, storage_root: impl Into<String>) -> Self {
        Self {
            pool,
            storage_root: storage_root.into(),
        }
    }
}

fn db_err(e: sqlx::Error) -> ArtifactError {
    ArtifactError::Backend(e.to_string())
}

#[async_trait]
impl ArtifactStore for DbArtifactStore {
    async fn put(&self, hash: &str, kind: ArtifactKind, bytes: &[u8]) -> Result<(), ArtifactError> {
        sqlx::query(
            r#"
            INSERT INTO document_bytes (hash, kind, storage_root, bytes, size_bytes)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (hash, kind, storage_root) DO UPDATE SET
                bytes = EXCLUDED.bytes,
                size_bytes = EXCLUDED.size_bytes
            "#,
        )
        .bind(hash)
        .bind(kind.as_str())
        .bind(&self.storage_root)
        .bind(bytes)
        .bind(bytes.len() as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(%hash, %kind, size = bytes.len(), "stored artifact");
        Ok(())
    }

    async fn get(&self, hash: &str, kind: ArtifactKind) -> Result<Vec<u8>, ArtifactError> {
        let row = sqlx::query(
            r#"
            SELECT bytes FROM document_bytes
            WHERE hash = $1 AND kind = $2 AND storage_root = $3
            "#,
        )
        .bind(hash)
        .bind(kind.as_str())
        .bind(&self.storage_root)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ArtifactError::NotFound {
            hash: hash.to_string(),
            kind,
        })?;

        Ok(row.get("bytes"))
    }

    async fn exists(&self, hash: &str, kind: ArtifactKind) -> Result<bool, ArtifactError> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS present FROM document_bytes
            WHERE hash = $1 AND kind = $2 AND storage_root = $3
            "#,
        )
        .bind(hash)
        .bind(kind.as_str())
        .bind(&self.storage_root)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.is_some())
    }

    async fn delete_all_for(&self, hash: &str) -> Result<usize, ArtifactError> {
        let result = sqlx::query(
            r#"
            DELETE FROM document_bytes
            WHERE hash = $1 AND storage_root = $2
            "#,
        )
        .bind(hash)
        .bind(&self.storage_root)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let count = result.rows_affected() as usize;
        debug!(%hash, count, "deleted artifacts");
        Ok(count)
    }
}
