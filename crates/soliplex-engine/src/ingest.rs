//! Ingest service: batches, content-hash dedup, and raw artifacts.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use soliplex_core::{content_hash, ArtifactKind, JsonMap};
use soliplex_storage::{
    ArtifactStore, BatchRow, DeletionReport, IngestOutcome, IngestRecord, IngestStore, NewBatch,
    SourceDiff,
};

use crate::error::EngineError;

/// What the caller gets back from ingesting bytes.
#[derive(Debug, Clone)]
pub struct IngestedDocument {
    pub document_hash: String,
    pub outcome: IngestOutcome,
}

/// Front door for document ingestion.
///
/// Hashes incoming bytes, records the document/URI rows, and persists the
/// `raw` artifact. Re-ingesting identical bytes under the same (uri,
/// source) is a no-op that reports the original batch.
pub struct IngestService {
    store: Arc<dyn IngestStore>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl IngestService {
    pub fn new(store: Arc<dyn IngestStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { store, artifacts }
    }

    pub async fn create_batch(
        &self,
        name: impl Into<String>,
        source: impl Into<String>,
        params: JsonMap,
    ) -> Result<BatchRow, EngineError> {
        let batch = self
            .store
            .create_batch(NewBatch {
                name: name.into(),
                source: source.into(),
                params,
            })
            .await?;
        Ok(batch)
    }

    /// Ingest one document's bytes under a (uri, source) pair.
    #[instrument(skip(self, bytes, metadata), fields(size = bytes.len()))]
    pub async fn ingest_document(
        &self,
        batch_id: Uuid,
        uri: &str,
        source: &str,
        bytes: &[u8],
        mime_type: &str,
        metadata: JsonMap,
    ) -> Result<IngestedDocument, EngineError> {
        if uri.trim().is_empty() {
            return Err(EngineError::Validation("uri must not be empty".into()));
        }
        if source.trim().is_empty() {
            return Err(EngineError::Validation("source must not be empty".into()));
        }

        let hash = content_hash(bytes);

        let outcome = self
            .store
            .record_ingest(IngestRecord {
                batch_id,
                uri: uri.to_string(),
                source: source.to_string(),
                document_hash: hash.clone(),
                mime_type: mime_type.to_string(),
                size_bytes: bytes.len() as i64,
                metadata,
            })
            .await?;

        // The raw artifact is the dedupe anchor for every later step.
        // Content addressing makes the write idempotent; on the unchanged
        // path we only backfill if it somehow went missing.
        match &outcome {
            IngestOutcome::Created { .. } | IngestOutcome::Updated { .. } => {
                self.artifacts.put(&hash, ArtifactKind::Raw, bytes).await?;
            }
            IngestOutcome::Unchanged { .. } => {
                if !self.artifacts.exists(&hash, ArtifactKind::Raw).await? {
                    self.artifacts.put(&hash, ArtifactKind::Raw, bytes).await?;
                }
            }
        }

        debug!(%hash, ?outcome, "ingested document");
        Ok(IngestedDocument {
            document_hash: hash,
            outcome,
        })
    }

    /// Compare a source listing against persisted state; read-only.
    pub async fn source_status(
        &self,
        source: &str,
        listing: &BTreeMap<String, String>,
    ) -> Result<SourceDiff, EngineError> {
        Ok(self.store.source_status(source, listing).await?)
    }

    /// Cascading delete of a document URI (and, on the last reference, the
    /// document with its runs and artifacts).
    pub async fn delete_document_uri(
        &self,
        uri: &str,
        source: &str,
    ) -> Result<DeletionReport, EngineError> {
        let report = self
            .store
            .delete_document_uri(uri, source, self.artifacts.as_ref())
            .await?;
        Ok(report)
    }

    /// Cascading delete of a run group.
    pub async fn delete_run_group(&self, group_id: Uuid) -> Result<DeletionReport, EngineError> {
        Ok(self.store.delete_run_group(group_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soliplex_storage::MemoryStore;

    fn service() -> (tempfile::TempDir, IngestService, Arc<MemoryStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let artifacts = Arc::new(soliplex_storage::FsArtifactStore::new(dir.path(), "default"));
        let service = IngestService::new(store.clone(), artifacts);
        (dir, service, store)
    }

    #[tokio::test]
    async fn test_ingest_writes_raw_artifact() {
        let (dir, service, store) = service();
        let batch = service.create_batch("b", "s", JsonMap::new()).await.unwrap();

        let ingested = service
            .ingest_document(batch.id, "/a", "s", b"bytes", "text/plain", JsonMap::new())
            .await
            .unwrap();

        assert_eq!(ingested.document_hash, content_hash(b"bytes"));
        let doc = store
            .get_document(&ingested.document_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.size_bytes, 5);

        let artifacts = soliplex_storage::FsArtifactStore::new(dir.path(), "default");
        assert!(artifacts
            .exists(&ingested.document_hash, ArtifactKind::Raw)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_reingest_reports_original_batch() {
        let (_dir, service, _store) = service();
        let batch1 = service.create_batch("b1", "s", JsonMap::new()).await.unwrap();
        let batch2 = service.create_batch("b2", "s", JsonMap::new()).await.unwrap();

        service
            .ingest_document(batch1.id, "/a", "s", b"B", "text/plain", JsonMap::new())
            .await
            .unwrap();
        let second = service
            .ingest_document(batch2.id, "/a", "s", b"B", "text/plain", JsonMap::new())
            .await
            .unwrap();

        match second.outcome {
            IngestOutcome::Unchanged { original_batch, .. } => {
                assert_eq!(original_batch, batch1.id)
            }
            other => panic!("expected Unchanged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_uri_rejected() {
        let (_dir, service, _store) = service();
        let batch = service.create_batch("b", "s", JsonMap::new()).await.unwrap();

        let err = service
            .ingest_document(batch.id, "  ", "s", b"x", "text/plain", JsonMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
