// Database models (internal rows plus the inputs used to create them)

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use soliplex_core::{JsonMap, LifecycleEventKind, RunStatus, StepStatus, StepType};

// ============================================
// Batches and documents
// ============================================

/// Batch row from database
#[derive(Debug, Clone, FromRow)]
pub struct BatchRow {
    pub id: Uuid,
    pub name: String,
    pub source: String,
    pub params: Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for creating a batch
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub name: String,
    pub source: String,
    pub params: JsonMap,
}

/// Document row from database; identity is the content hash
#[derive(Debug, Clone, FromRow)]
pub struct DocumentRow {
    pub hash: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// DocumentURI row; unique on (uri, source)
#[derive(Debug, Clone, FromRow)]
pub struct DocumentUriRow {
    pub id: Uuid,
    pub uri: String,
    pub source: String,
    pub document_hash: String,
    pub version: i32,
    pub batch_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only history row for a DocumentURI transition
#[derive(Debug, Clone, FromRow)]
pub struct UriHistoryRow {
    pub id: Uuid,
    pub uri_id: Uuid,
    pub version: i32,
    pub document_hash: String,
    pub action: String,
    pub batch_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Action recorded in DocumentURI history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriAction {
    Created,
    Updated,
    Deleted,
}

impl UriAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

/// Input for recording one ingested document
#[derive(Debug, Clone)]
pub struct IngestRecord {
    pub batch_id: Uuid,
    pub uri: String,
    pub source: String,
    pub document_hash: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub metadata: JsonMap,
}

/// Result of recording an ingest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First time this (uri, source) was seen
    Created { uri_id: Uuid, version: i32 },

    /// The URI existed with different content; version was bumped
    Updated {
        uri_id: Uuid,
        version: i32,
        previous_hash: String,
    },

    /// Identical content already recorded under this URI; nothing changed.
    /// Carries the batch that first ingested it.
    Unchanged { uri_id: Uuid, original_batch: Uuid },
}

/// Result of comparing a source listing against persisted state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceDiff {
    /// URIs present in the input but unknown to persistence
    pub new: Vec<String>,

    /// URIs present in both but with a different hash
    pub changed: Vec<String>,

    /// URIs persisted under this source but absent from the input
    pub missing: Vec<String>,
}

// ============================================
// Run groups, runs, steps
// ============================================

/// RunGroup row from database
#[derive(Debug, Clone, FromRow)]
pub struct RunGroupRow {
    pub id: Uuid,
    pub name: String,
    pub workflow_id: String,
    pub parameter_set_id: String,
    pub batch_id: Uuid,
    pub status: String,
    pub status_message: Option<String>,
    pub status_metadata: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunGroupRow {
    pub fn run_status(&self) -> Option<RunStatus> {
        RunStatus::parse(&self.status)
    }
}

/// WorkflowRun row from database
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRunRow {
    pub id: Uuid,
    pub workflow_id: String,
    pub group_id: Uuid,
    pub batch_id: Uuid,
    pub document_hash: String,
    pub priority: i32,
    pub status: String,
    pub status_message: Option<String>,
    pub status_metadata: Value,
    pub run_params: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRunRow {
    pub fn run_status(&self) -> Option<RunStatus> {
        RunStatus::parse(&self.status)
    }
}

/// RunStep row from database
#[derive(Debug, Clone, FromRow)]
pub struct RunStepRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_number: i32,
    pub step_name: String,
    pub step_type: String,
    pub step_config_id: Uuid,
    pub is_last: bool,
    pub retry: i32,
    pub retries: i32,
    pub status: String,
    pub worker_id: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunStepRow {
    pub fn step_status(&self) -> Option<StepStatus> {
        StepStatus::parse(&self.status)
    }
}

/// StepConfig row; immutable once created, deduplicated by content
#[derive(Debug, Clone, FromRow)]
pub struct StepConfigRow {
    pub id: Uuid,
    pub step_type: String,
    pub config: Value,
    pub cumulative_config: Value,
    pub created_at: DateTime<Utc>,
}

/// Seed for one run step, computed by the engine from the workflow
/// definition and parameter set
#[derive(Debug, Clone)]
pub struct StepSeed {
    pub step_number: u32,
    pub step_name: String,
    pub step_type: StepType,
    pub is_last: bool,
    pub retries: u32,
    pub config: JsonMap,
    pub cumulative_config: JsonMap,
}

/// Seed for one workflow run within a new group
#[derive(Debug, Clone)]
pub struct RunSeed {
    pub document_hash: String,
    pub priority: i32,
    pub run_params: JsonMap,
    pub first_step: StepSeed,
}

/// Seed for a new run group and all of its runs
#[derive(Debug, Clone)]
pub struct GroupSeed {
    pub name: String,
    pub workflow_id: String,
    pub parameter_set_id: String,
    pub batch_id: Uuid,
    pub runs: Vec<RunSeed>,
}

/// A step claimed for execution, joined with everything a handler needs
#[derive(Debug, Clone)]
pub struct ClaimedStep {
    pub step_id: Uuid,
    pub run_id: Uuid,
    pub group_id: Uuid,
    pub batch_id: Uuid,
    pub workflow_id: String,
    pub parameter_set_id: String,
    pub document_hash: String,
    pub source: String,
    pub step_number: u32,
    pub step_name: String,
    pub step_type: StepType,
    pub is_last: bool,
    pub retry: u32,
    pub retries: u32,
    pub step_config: JsonMap,
    pub cumulative_config: JsonMap,
}

/// What happened when a step completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The next step was seeded as pending
    NextSeeded { step_id: Uuid },

    /// The run completed; its group still has non-terminal runs
    RunCompleted,

    /// The run completed and it was the last non-terminal run: the group
    /// is terminal too
    GroupCompleted { group_failed: bool },
}

/// What happened when a step failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Requeued for retry after the backoff delay
    WillRetry {
        retry: u32,
        not_before: DateTime<Utc>,
    },

    /// The step and its run are failed; the group may still be running
    RunFailed { group_terminal: bool },
}

/// Classification of a step failure reported by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient; eligible for retry while attempts remain
    Transient,

    /// Permanent; fails the run regardless of remaining retries
    Fatal,
}

// ============================================
// Workers and lifecycle history
// ============================================

/// Worker check-in row
#[derive(Debug, Clone, FromRow)]
pub struct WorkerCheckinRow {
    pub worker_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Lifecycle history row
#[derive(Debug, Clone, FromRow)]
pub struct LifecycleEventRow {
    pub id: Uuid,
    /// Insertion order; ties on created_at are broken by this
    pub seq: i64,
    pub kind: String,
    pub group_id: Uuid,
    pub run_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub status: String,
    pub message: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl LifecycleEventRow {
    pub fn event_kind(&self) -> Option<LifecycleEventKind> {
        LifecycleEventKind::parse(&self.kind)
    }
}

/// Per-table row counts removed by a cascading delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub run_steps: u64,
    pub lifecycle_events: u64,
    pub workflow_runs: u64,
    pub run_groups: u64,
    pub uri_history: u64,
    pub document_uris: u64,
    pub documents: u64,
    pub artifacts: u64,
}

impl DeletionReport {
    pub fn total(&self) -> u64 {
        self.run_steps
            + self.lifecycle_events
            + self.workflow_runs
            + self.run_groups
            + self.uri_history
            + self.document_uris
            + self.documents
            + self.artifacts
    }
}
