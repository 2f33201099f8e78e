//! S3-compatible object store artifact backend.
//!
//! Uses the same key layout as the filesystem backend, within a bucket:
//! `<storage_root>/<hash[0:2]>/<hash>/<kind>`.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use tracing::debug;

use soliplex_core::ArtifactKind;

use super::{shard_prefix, ArtifactError, ArtifactStore};

/// Artifact store backed by an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct S3ArtifactStore {
    client: Client,
    bucket: String,
    storage_root: String,
}

impl S3ArtifactStore {
    pub fn new(client: Client, bucket: impl Into<String>, storage_root: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            storage_root: storage_root.into(),
        }
    }

    /// Build a store from the ambient AWS environment (credentials chain,
    /// region, endpoint overrides).
    pub async fn from_env(bucket: impl Into<String>, storage_root: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), bucket, storage_root)
    }

    fn hash_prefix(&self, hash: &str) -> String {
        format!("{}/{}/{}/", self.storage_root, shard_prefix(hash), hash)
    }

    fn key(&self, hash: &str, kind: ArtifactKind) -> String {
        format!("{}{}", self.hash_prefix(hash), kind.as_str())
    }
}

fn backend_err(e: impl std::fmt::Display) -> ArtifactError {
    ArtifactError::Backend(e.to_string())
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put(&self, hash: &str, kind: ArtifactKind, bytes: &[u8]) -> Result<(), ArtifactError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(hash, kind))
            .body(ByteStream::from(bytes.to_vec()))
            .content_length(bytes.len() as i64)
            .send()
            .await
            .map_err(backend_err)?;

        debug!(%hash, %kind, size = bytes.len(), "stored artifact");
        Ok(())
    }

    async fn get(&self, hash: &str, kind: ArtifactKind) -> Result<Vec<u8>, ArtifactError> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(hash, kind))
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let service_err = e.into_service_error();
                return if service_err.is_no_such_key() {
                    Err(ArtifactError::NotFound {
                        hash: hash.to_string(),
                        kind,
                    })
                } else {
                    Err(backend_err(service_err))
                };
            }
        };

        let bytes = output.body.collect().await.map_err(backend_err)?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn exists(&self, hash: &str, kind: ArtifactKind) -> Result<bool, ArtifactError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(hash, kind))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(backend_err(service_err))
                }
            }
        }
    }

    async fn delete_all_for(&self, hash: &str) -> Result<usize, ArtifactError> {
        let prefix = self.hash_prefix(hash);
        let mut deleted = 0usize;
        let mut continuation: Option<String> = None;

        loop {
            let listing = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(backend_err)?;

            let keys: Vec<ObjectIdentifier> = listing
                .contents()
                .iter()
                .filter_map(|o| o.key())
                .map(|k| {
                    ObjectIdentifier::builder()
                        .key(k)
                        .build()
                        .map_err(backend_err)
                })
                .collect::<Result<_, _>>()?;

            if !keys.is_empty() {
                deleted += keys.len();
                let delete = Delete::builder()
                    .set_objects(Some(keys))
                    .build()
                    .map_err(backend_err)?;
                self.client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(backend_err)?;
            }

            match listing.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        debug!(%hash, count = deleted, "deleted artifacts");
        Ok(deleted)
    }
}
