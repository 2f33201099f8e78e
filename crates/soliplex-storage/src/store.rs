//! The [`IngestStore`] trait both persistence backends implement.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use soliplex_core::JsonMap;

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::models::*;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Entity missing; cascading deletion uses this to fail loudly
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// A concurrent modification won the race; the caller retries
    #[error("conflict: {0}")]
    Conflict(String),

    /// Bad input; never retried
    #[error("validation error: {0}")]
    Validation(String),

    /// An impossible state was observed
    #[error("engine invariant violated: {0}")]
    Invariant(String),

    /// Artifact backend failure inside a cascading delete
    #[error("artifact store error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }
}

/// Persistence contract for the ingestion engine.
///
/// Both backends provide identical observable semantics. Every operation
/// that changes run/step state writes its lifecycle history rows in the
/// same transaction, and claim operations uphold the invariants of the
/// scheduler: at most one worker per step, at most one running step per
/// run, and strictly linear step progression.
#[async_trait]
pub trait IngestStore: Send + Sync + 'static {
    // =========================================================================
    // Batches and ingest
    // =========================================================================

    /// Create a new batch.
    async fn create_batch(&self, input: NewBatch) -> Result<BatchRow, StoreError>;

    async fn get_batch(&self, id: Uuid) -> Result<Option<BatchRow>, StoreError>;

    /// Record one ingested document: content-hash dedup on the document
    /// table, version bump on the URI when its hash changed, and an
    /// append-only history row for every transition.
    async fn record_ingest(&self, record: IngestRecord) -> Result<IngestOutcome, StoreError>;

    async fn get_document(&self, hash: &str) -> Result<Option<DocumentRow>, StoreError>;

    /// Merge fields into a document's metadata map.
    async fn merge_document_metadata(
        &self,
        hash: &str,
        fields: JsonMap,
    ) -> Result<(), StoreError>;

    async fn get_document_uri(
        &self,
        uri: &str,
        source: &str,
    ) -> Result<Option<DocumentUriRow>, StoreError>;

    /// History rows for a URI, oldest first.
    async fn uri_history(&self, uri_id: Uuid) -> Result<Vec<UriHistoryRow>, StoreError>;

    /// Compare a source listing against persisted state. Read-only.
    async fn source_status(
        &self,
        source: &str,
        listing: &BTreeMap<String, String>,
    ) -> Result<SourceDiff, StoreError>;

    // =========================================================================
    // Workflow launch
    // =========================================================================

    /// Materialize a run group, one run per document, and each run's first
    /// step as pending, in a single transaction. Step configs are
    /// deduplicated by (type, config, cumulative snapshot).
    async fn create_run_group(&self, seed: GroupSeed) -> Result<RunGroupRow, StoreError>;

    // =========================================================================
    // Scheduler
    // =========================================================================

    /// Claim up to `limit` eligible pending steps for a worker.
    ///
    /// Eligible: pending, past its not-before time, no running sibling in
    /// the same run, and its predecessor completed (or it is step 1).
    /// Ordered by (priority desc, step created_at asc, run id asc). The
    /// first claim of a run transitions the run (and, if needed, its
    /// group) to running and records the matching lifecycle events.
    async fn claim_steps(
        &self,
        worker_id: &str,
        limit: usize,
    ) -> Result<Vec<ClaimedStep>, StoreError>;

    /// Mark a claimed step completed and advance the run.
    ///
    /// `next` must be the seed for the following step when the completed
    /// step is not the last; the new step is inserted pending in the same
    /// transaction. On the last step the run completes, and when it was
    /// the last non-terminal run, so do the group and (once every group is
    /// terminal) the batch.
    ///
    /// Fails with [`StoreError::Conflict`] when the step is not running
    /// under this worker.
    async fn complete_step(
        &self,
        step_id: Uuid,
        worker_id: &str,
        metadata: JsonMap,
        next: Option<StepSeed>,
    ) -> Result<CompletionOutcome, StoreError>;

    /// Record a step failure and advance the retry state machine.
    ///
    /// A transient failure with retries remaining requeues the step as
    /// pending with `not_before = now + retry_delay`; otherwise the step
    /// and its run fail, and the group moves to error (other runs still in
    /// flight) or failed (all terminal).
    async fn fail_step(
        &self,
        step_id: Uuid,
        worker_id: &str,
        error: &str,
        kind: FailureKind,
        retry_delay: Duration,
    ) -> Result<FailureOutcome, StoreError>;

    /// Reset running steps owned by stale workers back to pending.
    ///
    /// A worker is stale when its last check-in is older than the
    /// threshold (or its check-in row is gone). Records a `step_failed`
    /// lifecycle event per reclaimed step. This is the only path that
    /// unsticks running steps.
    async fn reclaim_stale_steps(&self, stale_threshold: Duration)
        -> Result<Vec<Uuid>, StoreError>;

    // =========================================================================
    // Worker check-ins
    // =========================================================================

    /// Upsert the worker's check-in row (first-seen on insert, last-seen
    /// always).
    async fn worker_heartbeat(&self, worker_id: &str) -> Result<(), StoreError>;

    /// Remove the worker's check-in row on explicit shutdown.
    async fn remove_worker(&self, worker_id: &str) -> Result<(), StoreError>;

    async fn list_workers(&self) -> Result<Vec<WorkerCheckinRow>, StoreError>;

    // =========================================================================
    // Inspection
    // =========================================================================

    async fn get_group(&self, id: Uuid) -> Result<Option<RunGroupRow>, StoreError>;

    async fn list_groups_for_batch(&self, batch_id: Uuid)
        -> Result<Vec<RunGroupRow>, StoreError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<WorkflowRunRow>, StoreError>;

    async fn list_runs_for_group(
        &self,
        group_id: Uuid,
    ) -> Result<Vec<WorkflowRunRow>, StoreError>;

    async fn get_step(&self, id: Uuid) -> Result<Option<RunStepRow>, StoreError>;

    /// Steps of a run in step-number order.
    async fn list_steps_for_run(&self, run_id: Uuid) -> Result<Vec<RunStepRow>, StoreError>;

    /// Lifecycle history for a group in start-time order.
    async fn lifecycle_for_group(
        &self,
        group_id: Uuid,
    ) -> Result<Vec<LifecycleEventRow>, StoreError>;

    // =========================================================================
    // Cascading deletion
    // =========================================================================

    /// Delete a run group with its runs, steps, and lifecycle history.
    /// Fails with NotFound when the group does not exist.
    async fn delete_run_group(&self, id: Uuid) -> Result<DeletionReport, StoreError>;

    /// Delete a document URI. When it is the last reference to its
    /// document, also delete the document, its runs/steps/history, and
    /// every artifact for the hash through the given artifact store; an
    /// artifact backend error fails the whole operation with no rows
    /// removed.
    async fn delete_document_uri(
        &self,
        uri: &str,
        source: &str,
        artifacts: &dyn ArtifactStore,
    ) -> Result<DeletionReport, StoreError>;
}
