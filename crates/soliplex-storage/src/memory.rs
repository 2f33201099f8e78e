//! Embedded in-memory implementation of [`IngestStore`].
//!
//! The single-writer development backend. All mutation happens under one
//! writer lock, so the claim path uses the conditional-update variant: a
//! step is claimed by checking and flipping its status in one critical
//! section, which yields the same at-most-one-claimer invariant the SQL
//! backend gets from row locks.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use soliplex_core::{JsonMap, LifecycleEventKind, RunStatus, StepStatus, StepType};

use crate::artifacts::ArtifactStore;
use crate::models::*;
use crate::store::{IngestStore, StoreError};

#[derive(Default)]
struct Inner {
    batches: HashMap<Uuid, BatchRow>,
    documents: HashMap<String, DocumentRow>,
    uris: HashMap<Uuid, DocumentUriRow>,
    uri_history: Vec<UriHistoryRow>,
    groups: HashMap<Uuid, RunGroupRow>,
    runs: HashMap<Uuid, WorkflowRunRow>,
    steps: HashMap<Uuid, RunStepRow>,
    step_configs: HashMap<Uuid, StepConfigRow>,
    checkins: HashMap<String, WorkerCheckinRow>,
    lifecycle: Vec<LifecycleEventRow>,
    next_seq: i64,
}

/// In-memory implementation of [`IngestStore`].
///
/// Provides the same observable semantics as the PostgreSQL backend and is
/// the embedded store used for development and tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of steps currently pending.
    pub fn pending_step_count(&self) -> usize {
        self.inner
            .read()
            .steps
            .values()
            .filter(|s| s.status == "pending")
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }

    /// Rewind a worker's last check-in by `age` (for testing stale-worker
    /// recovery without waiting out the threshold).
    pub fn backdate_worker(&self, worker_id: &str, age: Duration) {
        let mut inner = self.inner.write();
        if let Some(row) = inner.checkins.get_mut(worker_id) {
            let shifted = Utc::now()
                - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
            row.first_seen = row.first_seen.min(shifted);
            row.last_seen = shifted;
        }
    }

    /// Clear a pending step's not-before time (for testing retries without
    /// waiting out the backoff).
    pub fn clear_not_before(&self, step_id: Uuid) {
        let mut inner = self.inner.write();
        if let Some(step) = inner.steps.get_mut(&step_id) {
            step.not_before = None;
        }
    }
}

impl Inner {
    fn record_event(
        &mut self,
        kind: LifecycleEventKind,
        group_id: Uuid,
        run_id: Option<Uuid>,
        step_id: Option<Uuid>,
        status: &str,
        message: Option<&str>,
        metadata: serde_json::Value,
    ) {
        self.next_seq += 1;
        self.lifecycle.push(LifecycleEventRow {
            id: Uuid::now_v7(),
            seq: self.next_seq,
            kind: kind.to_string(),
            group_id,
            run_id,
            step_id,
            status: status.to_string(),
            message: message.map(str::to_string),
            metadata,
            created_at: Utc::now(),
        });
    }

    fn find_or_create_step_config(&mut self, seed: &StepSeed) -> Uuid {
        let config = serde_json::Value::Object(seed.config.clone());
        let cumulative = serde_json::Value::Object(seed.cumulative_config.clone());

        if let Some(existing) = self.step_configs.values().find(|c| {
            c.step_type == seed.step_type.as_str()
                && c.config == config
                && c.cumulative_config == cumulative
        }) {
            return existing.id;
        }

        let id = Uuid::now_v7();
        self.step_configs.insert(
            id,
            StepConfigRow {
                id,
                step_type: seed.step_type.as_str().to_string(),
                config,
                cumulative_config: cumulative,
                created_at: Utc::now(),
            },
        );
        id
    }

    fn insert_step(&mut self, run_id: Uuid, seed: &StepSeed) -> Uuid {
        let config_id = self.find_or_create_step_config(seed);
        let id = Uuid::now_v7();
        self.steps.insert(
            id,
            RunStepRow {
                id,
                run_id,
                step_number: seed.step_number as i32,
                step_name: seed.step_name.clone(),
                step_type: seed.step_type.as_str().to_string(),
                step_config_id: config_id,
                is_last: seed.is_last,
                retry: 0,
                retries: seed.retries as i32,
                status: StepStatus::Pending.to_string(),
                worker_id: None,
                not_before: None,
                error: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
            },
        );
        id
    }

    fn open_run_count(&self, group_id: Uuid) -> usize {
        self.runs
            .values()
            .filter(|r| r.group_id == group_id && !matches!(&r.status, s if s == "completed" || s == "failed"))
            .count()
    }

    fn settle_group(&mut self, group_id: Uuid, batch_id: Uuid, message: Option<&str>) -> bool {
        let group_failed = self
            .runs
            .values()
            .any(|r| r.group_id == group_id && r.status == "failed");

        let status = if group_failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        if let Some(group) = self.groups.get_mut(&group_id) {
            group.status = status.to_string();
            if let Some(msg) = message {
                group.status_message = Some(msg.to_string());
            }
            group.completed_at = Some(Utc::now());
        }

        self.record_event(
            LifecycleEventKind::GroupEnd,
            group_id,
            None,
            None,
            &status.to_string(),
            message,
            serde_json::json!({}),
        );

        let open_groups = self
            .groups
            .values()
            .filter(|g| g.batch_id == batch_id && !matches!(&g.status, s if s == "completed" || s == "failed"))
            .count();
        if open_groups == 0 {
            if let Some(batch) = self.batches.get_mut(&batch_id) {
                if batch.completed_at.is_none() {
                    batch.completed_at = Some(Utc::now());
                }
            }
        }

        group_failed
    }

    fn uri_by_key(&self, uri: &str, source: &str) -> Option<&DocumentUriRow> {
        self.uris
            .values()
            .find(|u| u.uri == uri && u.source == source)
    }
}

fn to_map(value: &serde_json::Value) -> JsonMap {
    match value {
        serde_json::Value::Object(map) => map.clone(),
        _ => JsonMap::new(),
    }
}

#[async_trait]
impl IngestStore for MemoryStore {
    async fn create_batch(&self, input: NewBatch) -> Result<BatchRow, StoreError> {
        let row = BatchRow {
            id: Uuid::now_v7(),
            name: input.name,
            source: input.source,
            params: serde_json::Value::Object(input.params),
            created_at: Utc::now(),
            completed_at: None,
        };
        self.inner.write().batches.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<BatchRow>, StoreError> {
        Ok(self.inner.read().batches.get(&id).cloned())
    }

    async fn record_ingest(&self, record: IngestRecord) -> Result<IngestOutcome, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let existing = inner
            .uri_by_key(&record.uri, &record.source)
            .map(|u| (u.id, u.document_hash.clone(), u.version));

        if let Some((uri_id, hash, _)) = &existing {
            if *hash == record.document_hash {
                let original_batch = inner.uris[uri_id].batch_id;
                return Ok(IngestOutcome::Unchanged {
                    uri_id: *uri_id,
                    original_batch,
                });
            }
        }

        inner
            .documents
            .entry(record.document_hash.clone())
            .or_insert_with(|| DocumentRow {
                hash: record.document_hash.clone(),
                mime_type: record.mime_type.clone(),
                size_bytes: record.size_bytes,
                metadata: serde_json::Value::Object(record.metadata.clone()),
                created_at: now,
            });

        let outcome = match existing {
            Some((uri_id, previous_hash, version)) => {
                let version = version + 1;
                let uri = inner
                    .uris
                    .get_mut(&uri_id)
                    .ok_or_else(|| StoreError::not_found("document uri", uri_id))?;
                uri.document_hash = record.document_hash.clone();
                uri.version = version;
                uri.batch_id = record.batch_id;
                uri.updated_at = now;

                inner.uri_history.push(UriHistoryRow {
                    id: Uuid::now_v7(),
                    uri_id,
                    version,
                    document_hash: record.document_hash.clone(),
                    action: UriAction::Updated.as_str().to_string(),
                    batch_id: record.batch_id,
                    created_at: now,
                });

                IngestOutcome::Updated {
                    uri_id,
                    version,
                    previous_hash,
                }
            }
            None => {
                let uri_id = Uuid::now_v7();
                inner.uris.insert(
                    uri_id,
                    DocumentUriRow {
                        id: uri_id,
                        uri: record.uri.clone(),
                        source: record.source.clone(),
                        document_hash: record.document_hash.clone(),
                        version: 1,
                        batch_id: record.batch_id,
                        created_at: now,
                        updated_at: now,
                    },
                );

                inner.uri_history.push(UriHistoryRow {
                    id: Uuid::now_v7(),
                    uri_id,
                    version: 1,
                    document_hash: record.document_hash.clone(),
                    action: UriAction::Created.as_str().to_string(),
                    batch_id: record.batch_id,
                    created_at: now,
                });

                IngestOutcome::Created { uri_id, version: 1 }
            }
        };

        Ok(outcome)
    }

    async fn get_document(&self, hash: &str) -> Result<Option<DocumentRow>, StoreError> {
        Ok(self.inner.read().documents.get(hash).cloned())
    }

    async fn merge_document_metadata(
        &self,
        hash: &str,
        fields: JsonMap,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let doc = inner
            .documents
            .get_mut(hash)
            .ok_or_else(|| StoreError::not_found("document", hash))?;
        if let serde_json::Value::Object(metadata) = &mut doc.metadata {
            metadata.extend(fields);
        } else {
            doc.metadata = serde_json::Value::Object(fields);
        }
        Ok(())
    }

    async fn get_document_uri(
        &self,
        uri: &str,
        source: &str,
    ) -> Result<Option<DocumentUriRow>, StoreError> {
        Ok(self.inner.read().uri_by_key(uri, source).cloned())
    }

    async fn uri_history(&self, uri_id: Uuid) -> Result<Vec<UriHistoryRow>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<_> = inner
            .uri_history
            .iter()
            .filter(|h| h.uri_id == uri_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(rows)
    }

    async fn source_status(
        &self,
        source: &str,
        listing: &BTreeMap<String, String>,
    ) -> Result<SourceDiff, StoreError> {
        let inner = self.inner.read();
        let persisted: BTreeMap<&str, &str> = inner
            .uris
            .values()
            .filter(|u| u.source == source)
            .map(|u| (u.uri.as_str(), u.document_hash.as_str()))
            .collect();

        let mut diff = SourceDiff::default();
        for (uri, hash) in listing {
            match persisted.get(uri.as_str()) {
                None => diff.new.push(uri.clone()),
                Some(existing) if *existing != hash => diff.changed.push(uri.clone()),
                Some(_) => {}
            }
        }
        for uri in persisted.keys() {
            if !listing.contains_key(*uri) {
                diff.missing.push((*uri).to_string());
            }
        }

        Ok(diff)
    }

    async fn create_run_group(&self, seed: GroupSeed) -> Result<RunGroupRow, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let group = RunGroupRow {
            id: Uuid::now_v7(),
            name: seed.name.clone(),
            workflow_id: seed.workflow_id.clone(),
            parameter_set_id: seed.parameter_set_id.clone(),
            batch_id: seed.batch_id,
            status: RunStatus::Pending.to_string(),
            status_message: None,
            status_metadata: serde_json::json!({}),
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        inner.groups.insert(group.id, group.clone());

        for run in &seed.runs {
            let run_id = Uuid::now_v7();
            inner.runs.insert(
                run_id,
                WorkflowRunRow {
                    id: run_id,
                    workflow_id: seed.workflow_id.clone(),
                    group_id: group.id,
                    batch_id: seed.batch_id,
                    document_hash: run.document_hash.clone(),
                    priority: run.priority,
                    status: RunStatus::Pending.to_string(),
                    status_message: None,
                    status_metadata: serde_json::json!({}),
                    run_params: serde_json::Value::Object(run.run_params.clone()),
                    created_at: Utc::now(),
                    started_at: None,
                    completed_at: None,
                },
            );
            inner.insert_step(run_id, &run.first_step);
        }

        Ok(group)
    }

    async fn claim_steps(
        &self,
        worker_id: &str,
        limit: usize,
    ) -> Result<Vec<ClaimedStep>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let mut inner = self.inner.write();
        let now = Utc::now();

        // Conditional-update claim: eligibility is evaluated and the status
        // flipped inside the same critical section.
        let mut eligible: Vec<(i32, chrono::DateTime<Utc>, Uuid, Uuid)> = inner
            .steps
            .values()
            .filter(|s| {
                s.status == "pending"
                    && s.not_before.map(|nb| nb <= now).unwrap_or(true)
                    && !inner
                        .steps
                        .values()
                        .any(|sib| sib.run_id == s.run_id && sib.status == "running")
                    && (s.step_number == 1
                        || inner.steps.values().any(|prev| {
                            prev.run_id == s.run_id
                                && prev.step_number == s.step_number - 1
                                && prev.status == "completed"
                        }))
            })
            .map(|s| {
                let priority = inner.runs.get(&s.run_id).map(|r| r.priority).unwrap_or(0);
                (priority, s.created_at, s.run_id, s.id)
            })
            .collect();

        // priority desc, then step age, then run id, then step id
        eligible.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
                .then(a.3.cmp(&b.3))
        });
        eligible.truncate(limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, _, run_id, step_id) in eligible {
            {
                let step = inner
                    .steps
                    .get_mut(&step_id)
                    .ok_or_else(|| StoreError::not_found("run step", step_id))?;
                step.status = StepStatus::Running.to_string();
                step.worker_id = Some(worker_id.to_string());
                step.started_at = Some(Utc::now());
            }

            let run = inner
                .runs
                .get(&run_id)
                .cloned()
                .ok_or_else(|| StoreError::not_found("workflow run", run_id))?;
            let group_id = run.group_id;

            if inner.groups.get(&group_id).map(|g| g.status.clone()) == Some("pending".into()) {
                if let Some(group) = inner.groups.get_mut(&group_id) {
                    group.status = RunStatus::Running.to_string();
                    group.started_at = Some(Utc::now());
                }
                inner.record_event(
                    LifecycleEventKind::GroupStart,
                    group_id,
                    None,
                    None,
                    "running",
                    None,
                    serde_json::json!({}),
                );
            }

            if run.status == "pending" {
                if let Some(run) = inner.runs.get_mut(&run_id) {
                    run.status = RunStatus::Running.to_string();
                    run.started_at = Some(Utc::now());
                }
                inner.record_event(
                    LifecycleEventKind::ItemStart,
                    group_id,
                    Some(run_id),
                    None,
                    "running",
                    None,
                    serde_json::json!({}),
                );
            }

            let step = inner.steps[&step_id].clone();
            inner.record_event(
                LifecycleEventKind::StepStart,
                group_id,
                Some(run_id),
                Some(step_id),
                "running",
                None,
                serde_json::json!({ "step_name": step.step_name, "worker_id": worker_id }),
            );

            let group = inner
                .groups
                .get(&group_id)
                .ok_or_else(|| StoreError::not_found("run group", group_id))?;
            let batch = inner
                .batches
                .get(&run.batch_id)
                .ok_or_else(|| StoreError::not_found("batch", run.batch_id))?;
            let config = inner
                .step_configs
                .get(&step.step_config_id)
                .ok_or_else(|| StoreError::not_found("step config", step.step_config_id))?;
            let step_type = StepType::parse(&step.step_type).ok_or_else(|| {
                StoreError::Invariant(format!("unknown step type in storage: {}", step.step_type))
            })?;

            claimed.push(ClaimedStep {
                step_id,
                run_id,
                group_id,
                batch_id: run.batch_id,
                workflow_id: run.workflow_id.clone(),
                parameter_set_id: group.parameter_set_id.clone(),
                document_hash: run.document_hash.clone(),
                source: batch.source.clone(),
                step_number: step.step_number as u32,
                step_name: step.step_name.clone(),
                step_type,
                is_last: step.is_last,
                retry: step.retry as u32,
                retries: step.retries as u32,
                step_config: to_map(&config.config),
                cumulative_config: to_map(&config.cumulative_config),
            });
        }

        Ok(claimed)
    }

    async fn complete_step(
        &self,
        step_id: Uuid,
        worker_id: &str,
        metadata: JsonMap,
        next: Option<StepSeed>,
    ) -> Result<CompletionOutcome, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let (run_id, is_last, step_name) = {
            let step = inner
                .steps
                .get_mut(&step_id)
                .filter(|s| s.status == "running" && s.worker_id.as_deref() == Some(worker_id))
                .ok_or_else(|| {
                    StoreError::Conflict(format!(
                        "step {step_id} is not running under worker {worker_id}"
                    ))
                })?;
            step.status = StepStatus::Completed.to_string();
            step.completed_at = Some(now);
            (step.run_id, step.is_last, step.step_name.clone())
        };

        let run = inner
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("workflow run", run_id))?;
        let group_id = run.group_id;

        inner.record_event(
            LifecycleEventKind::StepEnd,
            group_id,
            Some(run_id),
            Some(step_id),
            "completed",
            None,
            serde_json::json!({ "step_name": step_name, "output": metadata }),
        );

        let outcome = match (is_last, next) {
            (false, Some(seed)) => {
                let next_id = inner.insert_step(run_id, &seed);
                CompletionOutcome::NextSeeded { step_id: next_id }
            }
            (true, None) => {
                if let Some(run) = inner.runs.get_mut(&run_id) {
                    run.status = RunStatus::Completed.to_string();
                    run.completed_at = Some(Utc::now());
                }
                inner.record_event(
                    LifecycleEventKind::ItemEnd,
                    group_id,
                    Some(run_id),
                    None,
                    "completed",
                    None,
                    serde_json::json!({}),
                );

                if inner.open_run_count(group_id) == 0 {
                    let group_failed = inner.settle_group(group_id, run.batch_id, None);
                    CompletionOutcome::GroupCompleted { group_failed }
                } else {
                    CompletionOutcome::RunCompleted
                }
            }
            (false, None) => {
                return Err(StoreError::Invariant(format!(
                    "step {step_id} is not last but no successor was provided"
                )))
            }
            (true, Some(_)) => {
                return Err(StoreError::Invariant(format!(
                    "step {step_id} is last but a successor was provided"
                )))
            }
        };

        Ok(outcome)
    }

    async fn fail_step(
        &self,
        step_id: Uuid,
        worker_id: &str,
        error_msg: &str,
        kind: FailureKind,
        retry_delay: Duration,
    ) -> Result<FailureOutcome, StoreError> {
        let mut inner = self.inner.write();

        let (run_id, step_name, retry, retries) = {
            let step = inner
                .steps
                .get(&step_id)
                .filter(|s| s.status == "running" && s.worker_id.as_deref() == Some(worker_id))
                .ok_or_else(|| {
                    StoreError::Conflict(format!(
                        "step {step_id} is not running under worker {worker_id}"
                    ))
                })?;
            (step.run_id, step.step_name.clone(), step.retry, step.retries)
        };

        let run = inner
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("workflow run", run_id))?;
        let group_id = run.group_id;

        let can_retry = matches!(kind, FailureKind::Transient) && retry < retries;

        let outcome = if can_retry {
            let not_before = Utc::now()
                + chrono::Duration::from_std(retry_delay)
                    .unwrap_or_else(|_| chrono::Duration::zero());

            if let Some(step) = inner.steps.get_mut(&step_id) {
                step.status = StepStatus::Pending.to_string();
                step.retry += 1;
                step.worker_id = None;
                step.started_at = None;
                step.not_before = Some(not_before);
                step.error = Some(error_msg.to_string());
            }

            inner.record_event(
                LifecycleEventKind::StepFailed,
                group_id,
                Some(run_id),
                Some(step_id),
                "pending",
                Some(error_msg),
                serde_json::json!({
                    "step_name": step_name,
                    "retry": retry + 1,
                    "not_before": not_before,
                }),
            );

            FailureOutcome::WillRetry {
                retry: (retry + 1) as u32,
                not_before,
            }
        } else {
            if let Some(step) = inner.steps.get_mut(&step_id) {
                step.status = StepStatus::Failed.to_string();
                step.completed_at = Some(Utc::now());
                step.error = Some(error_msg.to_string());
            }

            inner.record_event(
                LifecycleEventKind::StepFailed,
                group_id,
                Some(run_id),
                Some(step_id),
                "failed",
                Some(error_msg),
                serde_json::json!({ "step_name": step_name, "fatal": kind == FailureKind::Fatal }),
            );

            if let Some(run) = inner.runs.get_mut(&run_id) {
                run.status = RunStatus::Failed.to_string();
                run.completed_at = Some(Utc::now());
                run.status_message = Some(error_msg.to_string());
            }

            inner.record_event(
                LifecycleEventKind::ItemFailed,
                group_id,
                Some(run_id),
                None,
                "failed",
                Some(error_msg),
                serde_json::json!({ "step_name": step_name }),
            );

            if inner.open_run_count(group_id) == 0 {
                inner.settle_group(group_id, run.batch_id, Some(error_msg));
                FailureOutcome::RunFailed {
                    group_terminal: true,
                }
            } else {
                if let Some(group) = inner.groups.get_mut(&group_id) {
                    if group.status != "completed" && group.status != "failed" {
                        group.status = RunStatus::Error.to_string();
                        group.status_message = Some(error_msg.to_string());
                    }
                }
                FailureOutcome::RunFailed {
                    group_terminal: false,
                }
            }
        };

        Ok(outcome)
    }

    async fn reclaim_stale_steps(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.inner.write();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_threshold).unwrap_or_else(|_| chrono::Duration::zero());

        let stale: Vec<(Uuid, Uuid, String, Option<String>)> = inner
            .steps
            .values()
            .filter(|s| s.status == "running")
            .filter(|s| match &s.worker_id {
                Some(worker) => inner
                    .checkins
                    .get(worker)
                    .map(|c| c.last_seen < cutoff)
                    .unwrap_or(true),
                None => true,
            })
            .map(|s| (s.id, s.run_id, s.step_name.clone(), s.worker_id.clone()))
            .collect();

        let mut reclaimed = Vec::with_capacity(stale.len());
        for (step_id, run_id, step_name, stale_worker) in stale {
            if let Some(step) = inner.steps.get_mut(&step_id) {
                step.status = StepStatus::Pending.to_string();
                step.worker_id = None;
                step.started_at = None;
            }

            let group_id = inner
                .runs
                .get(&run_id)
                .map(|r| r.group_id)
                .ok_or_else(|| StoreError::not_found("workflow run", run_id))?;

            inner.record_event(
                LifecycleEventKind::StepFailed,
                group_id,
                Some(run_id),
                Some(step_id),
                "pending",
                Some("reclaimed from stale worker"),
                serde_json::json!({ "step_name": step_name, "stale_worker": stale_worker }),
            );

            reclaimed.push(step_id);
        }

        Ok(reclaimed)
    }

    async fn worker_heartbeat(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        inner
            .checkins
            .entry(worker_id.to_string())
            .and_modify(|row| row.last_seen = now)
            .or_insert_with(|| WorkerCheckinRow {
                worker_id: worker_id.to_string(),
                first_seen: now,
                last_seen: now,
            });
        Ok(())
    }

    async fn remove_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        self.inner.write().checkins.remove(worker_id);
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerCheckinRow>, StoreError> {
        let mut rows: Vec<_> = self.inner.read().checkins.values().cloned().collect();
        rows.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(rows)
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<RunGroupRow>, StoreError> {
        Ok(self.inner.read().groups.get(&id).cloned())
    }

    async fn list_groups_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<RunGroupRow>, StoreError> {
        let mut rows: Vec<_> = self
            .inner
            .read()
            .groups
            .values()
            .filter(|g| g.batch_id == batch_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(rows)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<WorkflowRunRow>, StoreError> {
        Ok(self.inner.read().runs.get(&id).cloned())
    }

    async fn list_runs_for_group(
        &self,
        group_id: Uuid,
    ) -> Result<Vec<WorkflowRunRow>, StoreError> {
        let mut rows: Vec<_> = self
            .inner
            .read()
            .runs
            .values()
            .filter(|r| r.group_id == group_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(rows)
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<RunStepRow>, StoreError> {
        Ok(self.inner.read().steps.get(&id).cloned())
    }

    async fn list_steps_for_run(&self, run_id: Uuid) -> Result<Vec<RunStepRow>, StoreError> {
        let mut rows: Vec<_> = self
            .inner
            .read()
            .steps
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.step_number);
        Ok(rows)
    }

    async fn lifecycle_for_group(
        &self,
        group_id: Uuid,
    ) -> Result<Vec<LifecycleEventRow>, StoreError> {
        let mut rows: Vec<_> = self
            .inner
            .read()
            .lifecycle
            .iter()
            .filter(|e| e.group_id == group_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.seq);
        Ok(rows)
    }

    async fn delete_run_group(&self, id: Uuid) -> Result<DeletionReport, StoreError> {
        let mut inner = self.inner.write();

        if !inner.groups.contains_key(&id) {
            return Err(StoreError::not_found("run group", id));
        }

        let run_ids: Vec<Uuid> = inner
            .runs
            .values()
            .filter(|r| r.group_id == id)
            .map(|r| r.id)
            .collect();

        let mut report = DeletionReport::default();

        let before = inner.steps.len();
        inner.steps.retain(|_, s| !run_ids.contains(&s.run_id));
        report.run_steps = (before - inner.steps.len()) as u64;

        let before = inner.lifecycle.len();
        inner.lifecycle.retain(|e| e.group_id != id);
        report.lifecycle_events = (before - inner.lifecycle.len()) as u64;

        let before = inner.runs.len();
        inner.runs.retain(|_, r| r.group_id != id);
        report.workflow_runs = (before - inner.runs.len()) as u64;

        inner.groups.remove(&id);
        report.run_groups = 1;

        Ok(report)
    }

    async fn delete_document_uri(
        &self,
        uri: &str,
        source: &str,
        artifacts: &dyn ArtifactStore,
    ) -> Result<DeletionReport, StoreError> {
        // Determine scope first; artifact deletion happens before any row
        // is removed so a backend failure leaves the rows intact.
        let (uri_id, hash, last_reference) = {
            let inner = self.inner.read();
            let row = inner
                .uri_by_key(uri, source)
                .ok_or_else(|| StoreError::not_found("document uri", format!("{uri} ({source})")))?;
            let references = inner
                .uris
                .values()
                .filter(|u| u.document_hash == row.document_hash)
                .count();
            (row.id, row.document_hash.clone(), references == 1)
        };

        let mut report = DeletionReport::default();

        if last_reference {
            report.artifacts = artifacts.delete_all_for(&hash).await? as u64;
        }

        let mut inner = self.inner.write();
        if !inner.uris.contains_key(&uri_id) {
            return Err(StoreError::not_found(
                "document uri",
                format!("{uri} ({source})"),
            ));
        }

        if last_reference {
            let run_ids: Vec<Uuid> = inner
                .runs
                .values()
                .filter(|r| r.document_hash == hash)
                .map(|r| r.id)
                .collect();

            let before = inner.steps.len();
            inner.steps.retain(|_, s| !run_ids.contains(&s.run_id));
            report.run_steps = (before - inner.steps.len()) as u64;

            let before = inner.lifecycle.len();
            inner
                .lifecycle
                .retain(|e| !e.run_id.map(|r| run_ids.contains(&r)).unwrap_or(false));
            report.lifecycle_events = (before - inner.lifecycle.len()) as u64;

            let before = inner.runs.len();
            inner.runs.retain(|_, r| r.document_hash != hash);
            report.workflow_runs = (before - inner.runs.len()) as u64;

            inner.documents.remove(&hash);
            report.documents = 1;
        }

        let before = inner.uri_history.len();
        inner.uri_history.retain(|h| h.uri_id != uri_id);
        report.uri_history = (before - inner.uri_history.len()) as u64;

        inner.uris.remove(&uri_id);
        report.document_uris = 1;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soliplex_core::content_hash;

    fn step_seed(number: u32, name: &str, retries: u32, is_last: bool) -> StepSeed {
        StepSeed {
            step_number: number,
            step_name: name.to_string(),
            step_type: StepType::Parse,
            is_last,
            retries,
            config: JsonMap::new(),
            cumulative_config: JsonMap::new(),
        }
    }

    async fn seed_group(store: &MemoryStore, hashes: &[&str]) -> (Uuid, RunGroupRow) {
        let batch = store
            .create_batch(NewBatch {
                name: "batch".into(),
                source: "test".into(),
                params: JsonMap::new(),
            })
            .await
            .unwrap();

        for hash in hashes {
            store
                .record_ingest(IngestRecord {
                    batch_id: batch.id,
                    uri: format!("/{hash}"),
                    source: "test".into(),
                    document_hash: hash.to_string(),
                    mime_type: "text/plain".into(),
                    size_bytes: 3,
                    metadata: JsonMap::new(),
                })
                .await
                .unwrap();
        }

        let group = store
            .create_run_group(GroupSeed {
                name: "group".into(),
                workflow_id: "wf".into(),
                parameter_set_id: "default".into(),
                batch_id: batch.id,
                runs: hashes
                    .iter()
                    .map(|h| RunSeed {
                        document_hash: h.to_string(),
                        priority: 0,
                        run_params: JsonMap::new(),
                        first_step: step_seed(1, "parse", 1, false),
                    })
                    .collect(),
            })
            .await
            .unwrap();

        (batch.id, group)
    }

    #[tokio::test]
    async fn test_ingest_same_bytes_twice_is_noop() {
        let store = MemoryStore::new();
        let hash = content_hash(b"B");

        let batch1 = store
            .create_batch(NewBatch {
                name: "b1".into(),
                source: "s".into(),
                params: JsonMap::new(),
            })
            .await
            .unwrap();
        let batch2 = store
            .create_batch(NewBatch {
                name: "b2".into(),
                source: "s".into(),
                params: JsonMap::new(),
            })
            .await
            .unwrap();

        let record = |batch_id| IngestRecord {
            batch_id,
            uri: "/a".into(),
            source: "s".into(),
            document_hash: hash.clone(),
            mime_type: "text/plain".into(),
            size_bytes: 1,
            metadata: JsonMap::new(),
        };

        let first = store.record_ingest(record(batch1.id)).await.unwrap();
        assert!(matches!(first, IngestOutcome::Created { version: 1, .. }));

        let second = store.record_ingest(record(batch2.id)).await.unwrap();
        match second {
            IngestOutcome::Unchanged { original_batch, .. } => {
                assert_eq!(original_batch, batch1.id)
            }
            other => panic!("expected Unchanged, got {other:?}"),
        }

        // No version bump, still one document
        let uri = store.get_document_uri("/a", "s").await.unwrap().unwrap();
        assert_eq!(uri.version, 1);
    }

    #[tokio::test]
    async fn test_two_uris_share_one_document() {
        let store = MemoryStore::new();
        let hash = content_hash(b"B");
        let batch = store
            .create_batch(NewBatch {
                name: "b".into(),
                source: "s".into(),
                params: JsonMap::new(),
            })
            .await
            .unwrap();

        for uri in ["/a", "/b"] {
            store
                .record_ingest(IngestRecord {
                    batch_id: batch.id,
                    uri: uri.into(),
                    source: "s".into(),
                    document_hash: hash.clone(),
                    mime_type: "text/plain".into(),
                    size_bytes: 1,
                    metadata: JsonMap::new(),
                })
                .await
                .unwrap();
        }

        assert!(store.get_document(&hash).await.unwrap().is_some());
        assert_eq!(store.inner.read().documents.len(), 1);
        assert_eq!(store.inner.read().uris.len(), 2);
    }

    #[tokio::test]
    async fn test_changed_content_bumps_version_and_history() {
        let store = MemoryStore::new();
        let batch = store
            .create_batch(NewBatch {
                name: "b".into(),
                source: "s".into(),
                params: JsonMap::new(),
            })
            .await
            .unwrap();

        let record = |hash: String| IngestRecord {
            batch_id: batch.id,
            uri: "/a".into(),
            source: "s".into(),
            document_hash: hash,
            mime_type: "text/plain".into(),
            size_bytes: 1,
            metadata: JsonMap::new(),
        };

        store.record_ingest(record(content_hash(b"v1"))).await.unwrap();
        let outcome = store.record_ingest(record(content_hash(b"v2"))).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Updated { version: 2, .. }));

        let uri = store.get_document_uri("/a", "s").await.unwrap().unwrap();
        assert_eq!(uri.version, 2);
        assert_eq!(uri.document_hash, content_hash(b"v2"));

        let history = store.uri_history(uri.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, "created");
        assert_eq!(history[1].action, "updated");
        assert_eq!(history[1].version, uri.version);
        assert_eq!(history[1].document_hash, uri.document_hash);
    }

    #[tokio::test]
    async fn test_claim_is_disjoint_under_contention() {
        let store = MemoryStore::new();
        let hashes: Vec<String> = (0..20).map(|i| content_hash(format!("doc{i}").as_bytes())).collect();
        let refs: Vec<&str> = hashes.iter().map(String::as_str).collect();
        seed_group(&store, &refs).await;

        store.worker_heartbeat("w1").await.unwrap();
        store.worker_heartbeat("w2").await.unwrap();

        let a = store.claim_steps("w1", 12).await.unwrap();
        let b = store.claim_steps("w2", 12).await.unwrap();

        assert_eq!(a.len(), 12);
        assert_eq!(b.len(), 8);
        let mut seen: Vec<Uuid> = a.iter().chain(b.iter()).map(|c| c.step_id).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn test_at_most_one_running_step_per_run() {
        let store = MemoryStore::new();
        let hash = content_hash(b"doc");
        let (_, group) = seed_group(&store, &[&hash]).await;

        let claimed = store.claim_steps("w1", 5).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let step = &claimed[0];

        // Seed step 2 and complete step 1; before completion nothing else
        // in the run is claimable.
        assert!(store.claim_steps("w2", 5).await.unwrap().is_empty());

        store
            .complete_step(
                step.step_id,
                "w1",
                JsonMap::new(),
                Some(step_seed(2, "chunk", 0, true)),
            )
            .await
            .unwrap();

        let next = store.claim_steps("w2", 5).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].step_number, 2);

        let runs = store.list_runs_for_group(group.id).await.unwrap();
        assert_eq!(runs[0].status, "running");
    }

    #[tokio::test]
    async fn test_priority_and_age_order_claims() {
        let store = MemoryStore::new();
        let batch = store
            .create_batch(NewBatch {
                name: "b".into(),
                source: "s".into(),
                params: JsonMap::new(),
            })
            .await
            .unwrap();

        let low = content_hash(b"low");
        let high = content_hash(b"high");
        for (hash, _) in [(&low, 0), (&high, 5)] {
            store
                .record_ingest(IngestRecord {
                    batch_id: batch.id,
                    uri: format!("/{hash}"),
                    source: "s".into(),
                    document_hash: hash.clone(),
                    mime_type: "text/plain".into(),
                    size_bytes: 1,
                    metadata: JsonMap::new(),
                })
                .await
                .unwrap();
        }

        store
            .create_run_group(GroupSeed {
                name: "g".into(),
                workflow_id: "wf".into(),
                parameter_set_id: "default".into(),
                batch_id: batch.id,
                runs: vec![
                    RunSeed {
                        document_hash: low.clone(),
                        priority: 0,
                        run_params: JsonMap::new(),
                        first_step: step_seed(1, "parse", 0, true),
                    },
                    RunSeed {
                        document_hash: high.clone(),
                        priority: 5,
                        run_params: JsonMap::new(),
                        first_step: step_seed(1, "parse", 0, true),
                    },
                ],
            })
            .await
            .unwrap();

        let claimed = store.claim_steps("w1", 2).await.unwrap();
        assert_eq!(claimed[0].document_hash, high);
        assert_eq!(claimed[1].document_hash, low);
    }

    #[tokio::test]
    async fn test_retry_requeues_with_not_before() {
        let store = MemoryStore::new();
        let hash = content_hash(b"doc");
        seed_group(&store, &[&hash]).await;

        let claimed = store.claim_steps("w1", 1).await.unwrap();
        let step = &claimed[0];

        let outcome = store
            .fail_step(
                step.step_id,
                "w1",
                "parser overloaded",
                FailureKind::Transient,
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::WillRetry { retry: 1, .. }));

        // Not claimable while not_before is in the future
        assert!(store.claim_steps("w1", 1).await.unwrap().is_empty());

        store.clear_not_before(step.step_id);
        let reclaimed = store.claim_steps("w1", 1).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].retry, 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_run_and_group() {
        let store = MemoryStore::new();
        let hash = content_hash(b"doc");
        let (batch_id, group) = seed_group(&store, &[&hash]).await;

        // retries = 1: first transient failure requeues, second fails
        let step = store.claim_steps("w1", 1).await.unwrap().remove(0);
        store
            .fail_step(step.step_id, "w1", "boom", FailureKind::Transient, Duration::ZERO)
            .await
            .unwrap();
        store.clear_not_before(step.step_id);

        let step = store.claim_steps("w1", 1).await.unwrap().remove(0);
        let outcome = store
            .fail_step(step.step_id, "w1", "boom again", FailureKind::Transient, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::RunFailed { group_terminal: true });

        let group = store.get_group(group.id).await.unwrap().unwrap();
        assert_eq!(group.status, "failed");
        assert!(group.completed_at.is_some());

        let batch = store.get_batch(batch_id).await.unwrap().unwrap();
        assert!(batch.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_fatal_failure_skips_retries() {
        let store = MemoryStore::new();
        let hash = content_hash(b"doc");
        let (_, group) = seed_group(&store, &[&hash]).await;

        let step = store.claim_steps("w1", 1).await.unwrap().remove(0);
        assert_eq!(step.retries, 1);

        let outcome = store
            .fail_step(step.step_id, "w1", "corrupt input", FailureKind::Fatal, Duration::ZERO)
            .await
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::RunFailed { .. }));

        let row = store.get_step(step.step_id).await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.retry, 0);

        let runs = store.list_runs_for_group(group.id).await.unwrap();
        assert_eq!(runs[0].status, "failed");
    }

    #[tokio::test]
    async fn test_group_error_while_sibling_still_running() {
        let store = MemoryStore::new();
        let h1 = content_hash(b"one");
        let h2 = content_hash(b"two");
        let (_, group) = seed_group(&store, &[&h1, &h2]).await;

        let claimed = store.claim_steps("w1", 2).await.unwrap();
        assert_eq!(claimed.len(), 2);

        let failing = claimed.iter().find(|c| c.document_hash == h1).unwrap();
        let outcome = store
            .fail_step(failing.step_id, "w1", "bad", FailureKind::Fatal, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::RunFailed { group_terminal: false });

        // Group surfaces the failure but is not terminal
        let row = store.get_group(group.id).await.unwrap().unwrap();
        assert_eq!(row.status, "error");
        assert!(row.completed_at.is_none());

        // The sibling proceeds independently
        let other = claimed.iter().find(|c| c.document_hash == h2).unwrap();
        store
            .complete_step(other.step_id, "w1", JsonMap::new(), Some(step_seed(2, "chunk", 0, true)))
            .await
            .unwrap();
        let last = store.claim_steps("w1", 1).await.unwrap().remove(0);
        let outcome = store
            .complete_step(last.step_id, "w1", JsonMap::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome, CompletionOutcome::GroupCompleted { group_failed: true });

        let row = store.get_group(group.id).await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
    }

    #[tokio::test]
    async fn test_complete_step_requires_owning_worker() {
        let store = MemoryStore::new();
        let hash = content_hash(b"doc");
        seed_group(&store, &[&hash]).await;

        let step = store.claim_steps("w1", 1).await.unwrap().remove(0);
        let err = store
            .complete_step(step.step_id, "w2", JsonMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_stale_worker_reclaim() {
        let store = MemoryStore::new();
        let hash = content_hash(b"doc");
        seed_group(&store, &[&hash]).await;

        store.worker_heartbeat("w1").await.unwrap();
        let step = store.claim_steps("w1", 1).await.unwrap().remove(0);

        // Fresh worker: nothing to reclaim
        let reclaimed = store
            .reclaim_stale_steps(Duration::from_secs(600))
            .await
            .unwrap();
        assert!(reclaimed.is_empty());

        store.backdate_worker("w1", Duration::from_secs(700));
        let reclaimed = store
            .reclaim_stale_steps(Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(reclaimed, vec![step.step_id]);

        let row = store.get_step(step.step_id).await.unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert!(row.worker_id.is_none());

        // Another worker can now claim it
        let again = store.claim_steps("w2", 1).await.unwrap();
        assert_eq!(again[0].step_id, step.step_id);
    }

    #[tokio::test]
    async fn test_source_status_diff() {
        let store = MemoryStore::new();
        let batch = store
            .create_batch(NewBatch {
                name: "b".into(),
                source: "s".into(),
                params: JsonMap::new(),
            })
            .await
            .unwrap();

        for (uri, bytes) in [("/kept", b"kept" as &[u8]), ("/changed", b"old"), ("/gone", b"gone")] {
            store
                .record_ingest(IngestRecord {
                    batch_id: batch.id,
                    uri: uri.into(),
                    source: "s".into(),
                    document_hash: content_hash(bytes),
                    mime_type: "text/plain".into(),
                    size_bytes: bytes.len() as i64,
                    metadata: JsonMap::new(),
                })
                .await
                .unwrap();
        }

        let listing: BTreeMap<String, String> = [
            ("/kept".to_string(), content_hash(b"kept")),
            ("/changed".to_string(), content_hash(b"new")),
            ("/new".to_string(), content_hash(b"new doc")),
        ]
        .into();

        let diff = store.source_status("s", &listing).await.unwrap();
        assert_eq!(diff.new, vec!["/new"]);
        assert_eq!(diff.changed, vec!["/changed"]);
        assert_eq!(diff.missing, vec!["/gone"]);

        // Different source sees everything as new
        let diff = store.source_status("other", &listing).await.unwrap();
        assert_eq!(diff.new.len(), 3);
        assert!(diff.missing.is_empty());
    }

    #[tokio::test]
    async fn test_delete_run_group_cascades_and_is_not_idempotent() {
        let store = MemoryStore::new();
        let hash = content_hash(b"doc");
        let (_, group) = seed_group(&store, &[&hash]).await;

        let step = store.claim_steps("w1", 1).await.unwrap().remove(0);
        store
            .complete_step(step.step_id, "w1", JsonMap::new(), Some(step_seed(2, "chunk", 0, true)))
            .await
            .unwrap();

        let report = store.delete_run_group(group.id).await.unwrap();
        assert_eq!(report.run_steps, 2);
        assert_eq!(report.workflow_runs, 1);
        assert_eq!(report.run_groups, 1);
        assert!(report.lifecycle_events > 0);

        assert!(store.get_group(group.id).await.unwrap().is_none());
        assert!(store.lifecycle_for_group(group.id).await.unwrap().is_empty());

        // Second delete: NotFound, nothing changed
        let err = store.delete_run_group(group.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_last_uri_removes_document_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = crate::artifacts::FsArtifactStore::new(dir.path(), "default");
        let store = MemoryStore::new();
        let hash = content_hash(b"doc");
        let (_, group) = seed_group(&store, &[&hash]).await;

        artifacts
            .put(&hash, soliplex_core::ArtifactKind::Raw, b"doc")
            .await
            .unwrap();

        let report = store
            .delete_document_uri(&format!("/{hash}"), "test", &artifacts)
            .await
            .unwrap();
        assert_eq!(report.documents, 1);
        assert_eq!(report.document_uris, 1);
        assert_eq!(report.artifacts, 1);
        assert_eq!(report.workflow_runs, 1);
        assert_eq!(report.run_steps, 1);

        assert!(store.get_document(&hash).await.unwrap().is_none());
        // Group-level rows survive; only run-scoped history was removed
        assert!(store.get_group(group.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_uri_keeps_shared_document() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = crate::artifacts::FsArtifactStore::new(dir.path(), "default");
        let store = MemoryStore::new();
        let hash = content_hash(b"shared");

        let batch = store
            .create_batch(NewBatch {
                name: "b".into(),
                source: "s".into(),
                params: JsonMap::new(),
            })
            .await
            .unwrap();
        for uri in ["/a", "/b"] {
            store
                .record_ingest(IngestRecord {
                    batch_id: batch.id,
                    uri: uri.into(),
                    source: "s".into(),
                    document_hash: hash.clone(),
                    mime_type: "text/plain".into(),
                    size_bytes: 6,
                    metadata: JsonMap::new(),
                })
                .await
                .unwrap();
        }
        artifacts
            .put(&hash, soliplex_core::ArtifactKind::Raw, b"shared")
            .await
            .unwrap();

        let report = store.delete_document_uri("/a", "s", &artifacts).await.unwrap();
        assert_eq!(report.document_uris, 1);
        assert_eq!(report.documents, 0);
        assert_eq!(report.artifacts, 0);

        assert!(store.get_document(&hash).await.unwrap().is_some());
        assert!(artifacts
            .exists(&hash, soliplex_core::ArtifactKind::Raw)
            .await
            .unwrap());
        assert!(store.get_document_uri("/b", "s").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_merge_document_metadata() {
        let store = MemoryStore::new();
        let hash = content_hash(b"doc");
        seed_group(&store, &[&hash]).await;

        let mut fields = JsonMap::new();
        fields.insert("language".into(), serde_json::json!("en"));
        store.merge_document_metadata(&hash, fields).await.unwrap();

        let doc = store.get_document(&hash).await.unwrap().unwrap();
        assert_eq!(doc.metadata["language"], "en");

        let err = store
            .merge_document_metadata("missing", JsonMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
