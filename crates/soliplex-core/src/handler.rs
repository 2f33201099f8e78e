//! The step handler contract and the registry that resolves handlers by
//! fully-qualified name.
//!
//! Workflow definitions reference handlers as opaque string keys. The
//! registry is populated once at process startup; definitions that name an
//! unregistered key fail at load time, not at execution time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::JsonMap;

/// Failure signalled by a step handler.
///
/// The engine reacts to the variant, not to the call stack: `Retryable`
/// moves the step back through the retry machinery, `Fatal` fails the run
/// immediately regardless of remaining retries.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// Transient fault (network timeout, overloaded collaborator)
    #[error("retryable: {0}")]
    Retryable(String),

    /// Permanent impossibility (corrupt input, unsupported format)
    #[error("fatal: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Everything a handler may consult about the step it is executing.
///
/// The cumulative config snapshot is the single source of truth for "what
/// this step was told to do"; handlers must not reach for ambient state.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Batch the document was ingested under, if any
    pub batch_id: Option<uuid::Uuid>,

    /// Content hash of the document being processed
    pub document_hash: Option<String>,

    /// Source tag of the originating ingest
    pub source: Option<String>,

    /// This step's own config, materialized from the parameter set
    pub step_config: JsonMap,

    /// Configs of this and all prior steps, merged in step order
    pub cumulative_config: JsonMap,
}

impl StepContext {
    /// Look up an option in this step's config.
    pub fn option(&self, key: &str) -> Option<&serde_json::Value> {
        self.step_config.get(key)
    }
}

/// One step of a workflow, implemented against external collaborators or
/// in-engine logic.
///
/// Handlers MUST be idempotent by content hash: re-invocation with the same
/// inputs either reproduces the same artifact or finds and reuses the
/// existing one through the artifact store.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Execute the step, returning metadata to record on the run.
    async fn execute(&self, ctx: StepContext) -> Result<JsonMap, HandlerError>;
}

/// Registry of step handlers keyed by fully-qualified name.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under its fully-qualified name.
    ///
    /// Later registrations under the same key replace earlier ones; the
    /// embedding process decides its final handler set before loading any
    /// workflow definitions.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// All registered handler names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl StepHandler for EchoHandler {
        async fn execute(&self, ctx: StepContext) -> Result<JsonMap, HandlerError> {
            let mut out = JsonMap::new();
            out.insert("echo".into(), json!(ctx.document_hash));
            Ok(out)
        }
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let mut registry = HandlerRegistry::new();
        registry.register("soliplex.steps.echo", Arc::new(EchoHandler));

        assert!(registry.contains("soliplex.steps.echo"));
        assert!(!registry.contains("soliplex.steps.missing"));

        let handler = registry.get("soliplex.steps.echo").unwrap();
        let ctx = StepContext {
            batch_id: Some(uuid::Uuid::now_v7()),
            document_hash: Some("abc".into()),
            source: None,
            step_config: JsonMap::new(),
            cumulative_config: JsonMap::new(),
        };

        let out = handler.execute(ctx).await.unwrap();
        assert_eq!(out.get("echo"), Some(&json!("abc")));
    }

    #[test]
    fn test_error_classification() {
        assert!(HandlerError::fatal("bad bytes").is_fatal());
        assert!(!HandlerError::retryable("timeout").is_fatal());
    }

    #[test]
    fn test_registry_debug() {
        let mut registry = HandlerRegistry::new();
        registry.register("a.b.c", Arc::new(EchoHandler));
        assert!(format!("{registry:?}").contains("a.b.c"));
    }
}
