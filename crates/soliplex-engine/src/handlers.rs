//! Built-in step handlers.
//!
//! Only steps the engine can satisfy without external collaborators are
//! implemented here: `validate`, a plain-text `parse`, `enrich`, `route`,
//! and `chunk`. Rich parsers, embedding, and vector-store handlers talk to
//! external services and are registered by the embedding process alongside
//! these.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use soliplex_core::{
    ArtifactKind, HandlerError, HandlerRegistry, JsonMap, StepContext, StepHandler,
};
use soliplex_storage::{ArtifactStore, IngestStore, StoreError};

/// Handler keys for the built-in steps.
pub mod names {
    pub const VALIDATE: &str = "soliplex.steps.validate";
    pub const PARSE: &str = "soliplex.steps.parse";
    pub const ENRICH: &str = "soliplex.steps.enrich";
    pub const ROUTE: &str = "soliplex.steps.route";
    pub const CHUNK: &str = "soliplex.steps.chunk";
}

/// A registry pre-populated with the built-in handlers.
pub fn builtin_handlers(
    store: Arc<dyn IngestStore>,
    artifacts: Arc<dyn ArtifactStore>,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(names::VALIDATE, Arc::new(ValidateHandler::new(store.clone())));
    registry.register(
        names::PARSE,
        Arc::new(ParseTextHandler::new(store.clone(), artifacts.clone())),
    );
    registry.register(names::ENRICH, Arc::new(EnrichHandler::new(store)));
    registry.register(names::ROUTE, Arc::new(RouteHandler));
    registry.register(names::CHUNK, Arc::new(ChunkHandler::new(artifacts)));
    registry
}

fn require_hash(ctx: &StepContext) -> Result<&str, HandlerError> {
    ctx.document_hash
        .as_deref()
        .ok_or_else(|| HandlerError::fatal("step requires a document"))
}

fn store_failure(e: StoreError) -> HandlerError {
    match e {
        StoreError::NotFound { entity, key } => {
            HandlerError::fatal(format!("{entity} not found: {key}"))
        }
        other => HandlerError::retryable(other.to_string()),
    }
}

// ============================================
// validate
// ============================================

/// Rejects malformed inputs by mime type and size.
///
/// Options: `allowed_mime_types` (list of strings), `max_size_bytes`.
/// Violations are fatal; no retry makes a bad document good.
pub struct ValidateHandler {
    store: Arc<dyn IngestStore>,
}

impl ValidateHandler {
    pub fn new(store: Arc<dyn IngestStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StepHandler for ValidateHandler {
    async fn execute(&self, ctx: StepContext) -> Result<JsonMap, HandlerError> {
        let hash = require_hash(&ctx)?;

        let doc = self
            .store
            .get_document(hash)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| HandlerError::fatal(format!("document not found: {hash}")))?;

        if let Some(Value::Array(allowed)) = ctx.option("allowed_mime_types") {
            let permitted = allowed
                .iter()
                .filter_map(Value::as_str)
                .any(|m| m == doc.mime_type);
            if !permitted {
                return Err(HandlerError::fatal(format!(
                    "mime type {} is not allowed",
                    doc.mime_type
                )));
            }
        }

        if let Some(max) = ctx.option("max_size_bytes").and_then(Value::as_i64) {
            if doc.size_bytes > max {
                return Err(HandlerError::fatal(format!(
                    "document is {} bytes, limit is {max}",
                    doc.size_bytes
                )));
            }
        }

        let mut out = JsonMap::new();
        out.insert("mime_type".into(), json!(doc.mime_type));
        out.insert("size_bytes".into(), json!(doc.size_bytes));
        Ok(out)
    }
}

// ============================================
// parse
// ============================================

/// Plain-text parser: promotes the raw artifact to `parsed-text`.
///
/// Handles text-like mime types without any external parser service.
/// Documents that need real parsing (PDF, OCR, table extraction) use a
/// collaborator-backed handler registered by the deployment in its place.
/// Idempotent: an existing parsed-text artifact is reused.
pub struct ParseTextHandler {
    store: Arc<dyn IngestStore>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl ParseTextHandler {
    pub fn new(store: Arc<dyn IngestStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { store, artifacts }
    }
}

fn is_text_mime(mime: &str) -> bool {
    mime.starts_with("text/")
        || matches!(
            mime,
            "application/json" | "application/xml" | "application/x-yaml" | "application/yaml"
        )
}

#[async_trait]
impl StepHandler for ParseTextHandler {
    async fn execute(&self, ctx: StepContext) -> Result<JsonMap, HandlerError> {
        let hash = require_hash(&ctx)?;

        if self
            .artifacts
            .exists(hash, ArtifactKind::ParsedText)
            .await
            .map_err(|e| HandlerError::retryable(e.to_string()))?
        {
            let mut out = JsonMap::new();
            out.insert("reused".into(), json!(true));
            return Ok(out);
        }

        let doc = self
            .store
            .get_document(hash)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| HandlerError::fatal(format!("document not found: {hash}")))?;

        if !is_text_mime(&doc.mime_type) {
            return Err(HandlerError::fatal(format!(
                "cannot parse {} as text; register a parser handler for it",
                doc.mime_type
            )));
        }

        let raw = match self.artifacts.get(hash, ArtifactKind::Raw).await {
            Ok(bytes) => bytes,
            Err(soliplex_storage::ArtifactError::NotFound { .. }) => {
                return Err(HandlerError::fatal(format!("no raw artifact for {hash}")))
            }
            Err(e) => return Err(HandlerError::retryable(e.to_string())),
        };

        let text = String::from_utf8(raw)
            .map_err(|e| HandlerError::fatal(format!("raw bytes are not UTF-8: {e}")))?;

        self.artifacts
            .put(hash, ArtifactKind::ParsedText, text.as_bytes())
            .await
            .map_err(|e| HandlerError::retryable(e.to_string()))?;

        let mut out = JsonMap::new();
        out.insert("characters".into(), json!(text.chars().count()));
        Ok(out)
    }
}

// ============================================
// enrich
// ============================================

/// Merges the step's configured fields into the document metadata.
pub struct EnrichHandler {
    store: Arc<dyn IngestStore>,
}

impl EnrichHandler {
    pub fn new(store: Arc<dyn IngestStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StepHandler for EnrichHandler {
    async fn execute(&self, ctx: StepContext) -> Result<JsonMap, HandlerError> {
        let hash = require_hash(&ctx)?;

        // The whole step config is the field set; enrich options are
        // handler-specific.
        let fields = ctx.step_config.clone();
        let count = fields.len();
        if count > 0 {
            self.store
                .merge_document_metadata(hash, fields)
                .await
                .map_err(store_failure)?;
        }

        let mut out = JsonMap::new();
        out.insert("enriched_fields".into(), json!(count));
        Ok(out)
    }
}

// ============================================
// route
// ============================================

/// Conditional transition marker.
///
/// Steps progress strictly linearly; route evaluates its predicate against
/// the cumulative config and records the chosen branch in its output
/// metadata for downstream handlers to consult.
///
/// Options: `predicate` (key into the cumulative config), `true_branch`,
/// `false_branch`.
pub struct RouteHandler;

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[async_trait]
impl StepHandler for RouteHandler {
    async fn execute(&self, ctx: StepContext) -> Result<JsonMap, HandlerError> {
        let predicate = ctx
            .option("predicate")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::fatal("route requires a predicate option"))?;

        let matched = ctx
            .cumulative_config
            .get(predicate)
            .map(truthy)
            .unwrap_or(false);

        let branch_key = if matched { "true_branch" } else { "false_branch" };
        let branch = ctx.option(branch_key).and_then(Value::as_str);

        let mut out = JsonMap::new();
        out.insert("predicate".into(), json!(predicate));
        out.insert("matched".into(), json!(matched));
        if let Some(branch) = branch {
            out.insert("branch".into(), json!(branch));
        }
        Ok(out)
    }
}

// ============================================
// chunk
// ============================================

/// Splits the parsed text into overlapping character windows.
///
/// Options: `target_tokens` (approximated at four characters per token),
/// `overlap_chars`. Reads `parsed-text`, writes `chunks` as a JSON array
/// of strings. Idempotent: an existing chunks artifact is reused.
pub struct ChunkHandler {
    artifacts: Arc<dyn ArtifactStore>,
}

impl ChunkHandler {
    pub fn new(artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { artifacts }
    }
}

const DEFAULT_TARGET_TOKENS: i64 = 512;
const CHARS_PER_TOKEN: i64 = 4;

fn split_chunks(text: &str, target_chars: usize, overlap_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![];
    }

    let window = target_chars.max(1);
    let stride = window.saturating_sub(overlap_chars).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + window).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += stride;
    }
    chunks
}

#[async_trait]
impl StepHandler for ChunkHandler {
    async fn execute(&self, ctx: StepContext) -> Result<JsonMap, HandlerError> {
        let hash = require_hash(&ctx)?;

        // Reuse an existing chunks artifact from a prior attempt.
        match self.artifacts.get(hash, ArtifactKind::Chunks).await {
            Ok(existing) => {
                let chunks: Vec<String> = serde_json::from_slice(&existing)
                    .map_err(|e| HandlerError::fatal(format!("corrupt chunks artifact: {e}")))?;
                let mut out = JsonMap::new();
                out.insert("chunks".into(), json!(chunks.len()));
                out.insert("reused".into(), json!(true));
                return Ok(out);
            }
            Err(soliplex_storage::ArtifactError::NotFound { .. }) => {}
            Err(e) => return Err(HandlerError::retryable(e.to_string())),
        }

        let text_bytes = match self.artifacts.get(hash, ArtifactKind::ParsedText).await {
            Ok(bytes) => bytes,
            Err(soliplex_storage::ArtifactError::NotFound { .. }) => {
                return Err(HandlerError::fatal(format!(
                    "no parsed-text artifact for {hash}"
                )))
            }
            Err(e) => return Err(HandlerError::retryable(e.to_string())),
        };
        let text = String::from_utf8(text_bytes)
            .map_err(|e| HandlerError::fatal(format!("parsed text is not UTF-8: {e}")))?;

        let target_tokens = ctx
            .option("target_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_TARGET_TOKENS)
            .max(1);
        let overlap = ctx
            .option("overlap_chars")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .max(0);

        let chunks = split_chunks(
            &text,
            (target_tokens * CHARS_PER_TOKEN) as usize,
            overlap as usize,
        );

        let payload = serde_json::to_vec(&chunks)
            .map_err(|e| HandlerError::fatal(format!("failed to encode chunks: {e}")))?;
        self.artifacts
            .put(hash, ArtifactKind::Chunks, &payload)
            .await
            .map_err(|e| HandlerError::retryable(e.to_string()))?;

        let mut out = JsonMap::new();
        out.insert("chunks".into(), json!(chunks.len()));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soliplex_core::content_hash;
    use soliplex_storage::{FsArtifactStore, IngestRecord, MemoryStore, NewBatch};

    fn ctx(hash: Option<&str>, config: JsonMap) -> StepContext {
        StepContext {
            batch_id: None,
            document_hash: hash.map(str::to_string),
            source: Some("test".into()),
            cumulative_config: config.clone(),
            step_config: config,
        }
    }

    async fn seed_document(store: &MemoryStore, bytes: &[u8], mime: &str) -> String {
        let batch = store
            .create_batch(NewBatch {
                name: "b".into(),
                source: "test".into(),
                params: JsonMap::new(),
            })
            .await
            .unwrap();
        let hash = content_hash(bytes);
        store
            .record_ingest(IngestRecord {
                batch_id: batch.id,
                uri: "/doc".into(),
                source: "test".into(),
                document_hash: hash.clone(),
                mime_type: mime.into(),
                size_bytes: bytes.len() as i64,
                metadata: JsonMap::new(),
            })
            .await
            .unwrap();
        hash
    }

    #[tokio::test]
    async fn test_validate_accepts_allowed_document() {
        let store = Arc::new(MemoryStore::new());
        let hash = seed_document(&store, b"hello", "text/plain").await;
        let handler = ValidateHandler::new(store);

        let mut config = JsonMap::new();
        config.insert("allowed_mime_types".into(), json!(["text/plain"]));
        config.insert("max_size_bytes".into(), json!(100));

        let out = handler.execute(ctx(Some(&hash), config)).await.unwrap();
        assert_eq!(out["mime_type"], "text/plain");
        assert_eq!(out["size_bytes"], 5);
    }

    #[tokio::test]
    async fn test_validate_rejects_mime_and_size() {
        let store = Arc::new(MemoryStore::new());
        let hash = seed_document(&store, b"hello", "application/zip").await;
        let handler = ValidateHandler::new(store);

        let mut config = JsonMap::new();
        config.insert("allowed_mime_types".into(), json!(["text/plain"]));
        let err = handler
            .execute(ctx(Some(&hash), config))
            .await
            .unwrap_err();
        assert!(err.is_fatal());

        let mut config = JsonMap::new();
        config.insert("max_size_bytes".into(), json!(3));
        let err = handler
            .execute(ctx(Some(&hash), config))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_validate_missing_document_is_fatal() {
        let handler = ValidateHandler::new(Arc::new(MemoryStore::new()));
        let err = handler
            .execute(ctx(Some("deadbeef"), JsonMap::new()))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_enrich_merges_metadata() {
        let store = Arc::new(MemoryStore::new());
        let hash = seed_document(&store, b"hello", "text/plain").await;
        let handler = EnrichHandler::new(store.clone());

        let mut config = JsonMap::new();
        config.insert("department".into(), json!("legal"));

        let out = handler.execute(ctx(Some(&hash), config)).await.unwrap();
        assert_eq!(out["enriched_fields"], 1);

        let doc = store.get_document(&hash).await.unwrap().unwrap();
        assert_eq!(doc.metadata["department"], "legal");
    }

    #[tokio::test]
    async fn test_route_picks_branch() {
        let mut config = JsonMap::new();
        config.insert("predicate".into(), json!("ocr"));
        config.insert("true_branch".into(), json!("ocr_parse"));
        config.insert("false_branch".into(), json!("plain_parse"));
        config.insert("ocr".into(), json!(true));

        let out = RouteHandler.execute(ctx(None, config)).await.unwrap();
        assert_eq!(out["matched"], true);
        assert_eq!(out["branch"], "ocr_parse");

        let mut config = JsonMap::new();
        config.insert("predicate".into(), json!("ocr"));
        config.insert("false_branch".into(), json!("plain_parse"));
        let out = RouteHandler.execute(ctx(None, config)).await.unwrap();
        assert_eq!(out["matched"], false);
        assert_eq!(out["branch"], "plain_parse");
    }

    #[tokio::test]
    async fn test_chunk_splits_and_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Arc::new(FsArtifactStore::new(dir.path(), "default"));
        let handler = ChunkHandler::new(artifacts.clone());

        let hash = content_hash(b"doc");
        let text = "a".repeat(100);
        artifacts
            .put(&hash, ArtifactKind::ParsedText, text.as_bytes())
            .await
            .unwrap();

        let mut config = JsonMap::new();
        // 10 tokens * 4 chars = 40-char windows over 100 chars
        config.insert("target_tokens".into(), json!(10));

        let out = handler
            .execute(ctx(Some(&hash), config.clone()))
            .await
            .unwrap();
        assert_eq!(out["chunks"], 3);

        let stored: Vec<String> = serde_json::from_slice(
            &artifacts.get(&hash, ArtifactKind::Chunks).await.unwrap(),
        )
        .unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].len(), 40);
        assert_eq!(stored[2].len(), 20);

        // Second invocation reuses the artifact
        let out = handler.execute(ctx(Some(&hash), config)).await.unwrap();
        assert_eq!(out["reused"], true);
    }

    #[tokio::test]
    async fn test_chunk_without_parsed_text_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ChunkHandler::new(Arc::new(FsArtifactStore::new(dir.path(), "default")));

        let err = handler
            .execute(ctx(Some(&content_hash(b"missing")), JsonMap::new()))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_split_chunks_overlap() {
        let chunks = split_chunks("abcdefghij", 4, 2);
        assert_eq!(chunks, vec!["abcd", "cdef", "efgh", "ghij"]);

        assert!(split_chunks("", 4, 0).is_empty());
        // Overlap >= window still terminates
        let chunks = split_chunks("abcdef", 2, 5);
        assert_eq!(chunks[0], "ab");
        assert!(chunks.len() <= 6);
    }

    #[tokio::test]
    async fn test_parse_text_promotes_raw() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Arc::new(FsArtifactStore::new(dir.path(), "default"));
        let store = Arc::new(MemoryStore::new());
        let hash = seed_document(&store, b"plain body", "text/plain").await;
        artifacts
            .put(&hash, ArtifactKind::Raw, b"plain body")
            .await
            .unwrap();

        let handler = ParseTextHandler::new(store, artifacts.clone());
        let out = handler
            .execute(ctx(Some(&hash), JsonMap::new()))
            .await
            .unwrap();
        assert_eq!(out["characters"], 10);
        assert_eq!(
            artifacts.get(&hash, ArtifactKind::ParsedText).await.unwrap(),
            b"plain body"
        );

        let out = handler
            .execute(ctx(Some(&hash), JsonMap::new()))
            .await
            .unwrap();
        assert_eq!(out["reused"], true);
    }

    #[tokio::test]
    async fn test_parse_text_rejects_binary_mime() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Arc::new(FsArtifactStore::new(dir.path(), "default"));
        let store = Arc::new(MemoryStore::new());
        let hash = seed_document(&store, b"%PDF-1.7", "application/pdf").await;

        let handler = ParseTextHandler::new(store, artifacts);
        let err = handler
            .execute(ctx(Some(&hash), JsonMap::new()))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_truthy() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!("x")));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!(null)));
    }
}
