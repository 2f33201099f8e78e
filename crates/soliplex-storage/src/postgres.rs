//! PostgreSQL implementation of [`IngestStore`].
//!
//! Production persistence for multi-worker deployments:
//! - Step claiming with `FOR UPDATE SKIP LOCKED`
//! - Lifecycle history written in the same transaction as every state
//!   transition
//! - Cascading deletes as single transactions

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use soliplex_core::{JsonMap, LifecycleEventKind, RunStatus};

use crate::artifacts::ArtifactStore;
use crate::models::*;
use crate::store::{IngestStore, StoreError};

/// PostgreSQL implementation of [`IngestStore`].
///
/// Uses a connection pool; safe to clone and share across workers.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database and run pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(db_err)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn to_map(value: serde_json::Value) -> JsonMap {
    match value {
        serde_json::Value::Object(map) => map,
        _ => JsonMap::new(),
    }
}

/// Insert one lifecycle history row inside the caller's transaction.
async fn record_event(
    conn: &mut PgConnection,
    kind: LifecycleEventKind,
    group_id: Uuid,
    run_id: Option<Uuid>,
    step_id: Option<Uuid>,
    status: &str,
    message: Option<&str>,
    metadata: serde_json::Value,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO lifecycle_history (id, kind, group_id, run_id, step_id, status, message, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(kind.to_string())
    .bind(group_id)
    .bind(run_id)
    .bind(step_id)
    .bind(status)
    .bind(message)
    .bind(metadata)
    .execute(conn)
    .await
    .map_err(db_err)?;

    Ok(())
}

/// Find a step config matching (type, config, cumulative) or insert one.
async fn find_or_create_step_config(
    conn: &mut PgConnection,
    seed: &StepSeed,
) -> Result<Uuid, StoreError> {
    let config = serde_json::Value::Object(seed.config.clone());
    let cumulative = serde_json::Value::Object(seed.cumulative_config.clone());

    let existing = sqlx::query(
        r#"
        SELECT id FROM step_configs
        WHERE step_type = $1 AND config = $2 AND cumulative_config = $3
        LIMIT 1
        "#,
    )
    .bind(seed.step_type.as_str())
    .bind(&config)
    .bind(&cumulative)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;

    if let Some(row) = existing {
        return Ok(row.get("id"));
    }

    let id = Uuid::now_v7();
    sqlx::query(
        r#"
        INSERT INTO step_configs (id, step_type, config, cumulative_config)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(id)
    .bind(seed.step_type.as_str())
    .bind(&config)
    .bind(&cumulative)
    .execute(conn)
    .await
    .map_err(db_err)?;

    Ok(id)
}

/// Insert a pending run step from its seed.
async fn insert_step(
    conn: &mut PgConnection,
    run_id: Uuid,
    seed: &StepSeed,
) -> Result<Uuid, StoreError> {
    let config_id = find_or_create_step_config(&mut *conn, seed).await?;

    let id = Uuid::now_v7();
    sqlx::query(
        r#"
        INSERT INTO run_steps (
            id, run_id, step_number, step_name, step_type, step_config_id,
            is_last, retry, retries, status
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, 'pending')
        "#,
    )
    .bind(id)
    .bind(run_id)
    .bind(seed.step_number as i32)
    .bind(&seed.step_name)
    .bind(seed.step_type.as_str())
    .bind(config_id)
    .bind(seed.is_last)
    .bind(seed.retries as i32)
    .execute(conn)
    .await
    .map_err(db_err)?;

    Ok(id)
}

/// Settle a group whose last run just went terminal, and complete the batch
/// once every group of the batch is terminal. Returns whether the group
/// failed.
async fn settle_group(
    conn: &mut PgConnection,
    group_id: Uuid,
    batch_id: Uuid,
    message: Option<&str>,
) -> Result<bool, StoreError> {
    let failed_runs: i64 = sqlx::query(
        r#"
        SELECT COUNT(*) AS n FROM workflow_runs
        WHERE group_id = $1 AND status = 'failed'
        "#,
    )
    .bind(group_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)?
    .get("n");

    let group_failed = failed_runs > 0;
    let status = if group_failed {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };

    sqlx::query(
        r#"
        UPDATE run_groups
        SET status = $2,
            status_message = COALESCE($3, status_message),
            completed_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(group_id)
    .bind(status.to_string())
    .bind(message)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    record_event(
        &mut *conn,
        LifecycleEventKind::GroupEnd,
        group_id,
        None,
        None,
        &status.to_string(),
        message,
        serde_json::json!({}),
    )
    .await?;

    let open_groups: i64 = sqlx::query(
        r#"
        SELECT COUNT(*) AS n FROM run_groups
        WHERE batch_id = $1 AND status NOT IN ('completed', 'failed')
        "#,
    )
    .bind(batch_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)?
    .get("n");

    if open_groups == 0 {
        sqlx::query(
            r#"
            UPDATE batches SET completed_at = NOW()
            WHERE id = $1 AND completed_at IS NULL
            "#,
        )
        .bind(batch_id)
        .execute(conn)
        .await
        .map_err(db_err)?;
    }

    Ok(group_failed)
}

#[async_trait]
impl IngestStore for PostgresStore {
    #[instrument(skip(self, input))]
    async fn create_batch(&self, input: NewBatch) -> Result<BatchRow, StoreError> {
        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            INSERT INTO batches (id, name, source, params)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, source, params, created_at, completed_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&input.name)
        .bind(&input.source)
        .bind(serde_json::Value::Object(input.params))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(batch_id = %row.id, name = %row.name, "created batch");
        Ok(row)
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<BatchRow>, StoreError> {
        sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT id, name, source, params, created_at, completed_at
            FROM batches WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    #[instrument(skip(self, record), fields(uri = %record.uri, source = %record.source))]
    async fn record_ingest(&self, record: IngestRecord) -> Result<IngestOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let existing = sqlx::query(
            r#"
            SELECT id, document_hash, version, batch_id
            FROM document_uris
            WHERE uri = $1 AND source = $2
            FOR UPDATE
            "#,
        )
        .bind(&record.uri)
        .bind(&record.source)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(row) = &existing {
            let current_hash: String = row.get("document_hash");
            if current_hash == record.document_hash {
                // Same bytes under the same (uri, source): nothing changes,
                // report the batch that first recorded them.
                return Ok(IngestOutcome::Unchanged {
                    uri_id: row.get("id"),
                    original_batch: row.get("batch_id"),
                });
            }
        }

        // One document row per distinct content; metadata from the first
        // ingest of a hash wins.
        sqlx::query(
            r#"
            INSERT INTO documents (hash, mime_type, size_bytes, metadata)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (hash) DO NOTHING
            "#,
        )
        .bind(&record.document_hash)
        .bind(&record.mime_type)
        .bind(record.size_bytes)
        .bind(serde_json::Value::Object(record.metadata.clone()))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let outcome = match existing {
            Some(row) => {
                let uri_id: Uuid = row.get("id");
                let previous_hash: String = row.get("document_hash");
                let version: i32 = row.get::<i32, _>("version") + 1;

                sqlx::query(
                    r#"
                    UPDATE document_uris
                    SET document_hash = $2, version = $3, batch_id = $4, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(uri_id)
                .bind(&record.document_hash)
                .bind(version)
                .bind(record.batch_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                append_uri_history(
                    &mut *tx,
                    uri_id,
                    version,
                    &record.document_hash,
                    UriAction::Updated,
                    record.batch_id,
                )
                .await?;

                IngestOutcome::Updated {
                    uri_id,
                    version,
                    previous_hash,
                }
            }
            None => {
                let uri_id = Uuid::now_v7();
                sqlx::query(
                    r#"
                    INSERT INTO document_uris (id, uri, source, document_hash, version, batch_id)
                    VALUES ($1, $2, $3, $4, 1, $5)
                    "#,
                )
                .bind(uri_id)
                .bind(&record.uri)
                .bind(&record.source)
                .bind(&record.document_hash)
                .bind(record.batch_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                append_uri_history(
                    &mut *tx,
                    uri_id,
                    1,
                    &record.document_hash,
                    UriAction::Created,
                    record.batch_id,
                )
                .await?;

                IngestOutcome::Created { uri_id, version: 1 }
            }
        };

        tx.commit().await.map_err(db_err)?;
        debug!(hash = %record.document_hash, ?outcome, "recorded ingest");
        Ok(outcome)
    }

    async fn get_document(&self, hash: &str) -> Result<Option<DocumentRow>, StoreError> {
        sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT hash, mime_type, size_bytes, metadata, created_at
            FROM documents WHERE hash = $1
            "#,
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn merge_document_metadata(
        &self,
        hash: &str,
        fields: JsonMap,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE documents SET metadata = metadata || $2 WHERE hash = $1
            "#,
        )
        .bind(hash)
        .bind(serde_json::Value::Object(fields))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("document", hash));
        }
        Ok(())
    }

    async fn get_document_uri(
        &self,
        uri: &str,
        source: &str,
    ) -> Result<Option<DocumentUriRow>, StoreError> {
        sqlx::query_as::<_, DocumentUriRow>(
            r#"
            SELECT id, uri, source, document_hash, version, batch_id, created_at, updated_at
            FROM document_uris WHERE uri = $1 AND source = $2
            "#,
        )
        .bind(uri)
        .bind(source)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn uri_history(&self, uri_id: Uuid) -> Result<Vec<UriHistoryRow>, StoreError> {
        sqlx::query_as::<_, UriHistoryRow>(
            r#"
            SELECT id, uri_id, version, document_hash, action, batch_id, created_at
            FROM document_uri_history
            WHERE uri_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(uri_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    #[instrument(skip(self, listing))]
    async fn source_status(
        &self,
        source: &str,
        listing: &BTreeMap<String, String>,
    ) -> Result<SourceDiff, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT uri, document_hash FROM document_uris WHERE source = $1
            "#,
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let persisted: BTreeMap<String, String> = rows
            .into_iter()
            .map(|r| (r.get("uri"), r.get("document_hash")))
            .collect();

        let mut diff = SourceDiff::default();
        for (uri, hash) in listing {
            match persisted.get(uri) {
                None => diff.new.push(uri.clone()),
                Some(existing) if existing != hash => diff.changed.push(uri.clone()),
                Some(_) => {}
            }
        }
        for uri in persisted.keys() {
            if !listing.contains_key(uri) {
                diff.missing.push(uri.clone());
            }
        }

        Ok(diff)
    }

    #[instrument(skip(self, seed), fields(workflow = %seed.workflow_id, runs = seed.runs.len()))]
    async fn create_run_group(&self, seed: GroupSeed) -> Result<RunGroupRow, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let group = sqlx::query_as::<_, RunGroupRow>(
            r#"
            INSERT INTO run_groups (id, name, workflow_id, parameter_set_id, batch_id, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            RETURNING id, name, workflow_id, parameter_set_id, batch_id, status,
                      status_message, status_metadata, created_at, started_at, completed_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&seed.name)
        .bind(&seed.workflow_id)
        .bind(&seed.parameter_set_id)
        .bind(seed.batch_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        for run in &seed.runs {
            let run_id = Uuid::now_v7();
            sqlx::query(
                r#"
                INSERT INTO workflow_runs (
                    id, workflow_id, group_id, batch_id, document_hash,
                    priority, status, run_params
                )
                VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7)
                "#,
            )
            .bind(run_id)
            .bind(&seed.workflow_id)
            .bind(group.id)
            .bind(seed.batch_id)
            .bind(&run.document_hash)
            .bind(run.priority)
            .bind(serde_json::Value::Object(run.run_params.clone()))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            insert_step(&mut *tx, run_id, &run.first_step).await?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!(group_id = %group.id, "created run group");
        Ok(group)
    }

    #[instrument(skip(self))]
    async fn claim_steps(
        &self,
        worker_id: &str,
        limit: usize,
    ) -> Result<Vec<ClaimedStep>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Eligible: pending, past its not-before time, no running sibling,
        // predecessor completed (or first step). SKIP LOCKED keeps
        // concurrent claimers disjoint.
        let claimed_ids: Vec<Uuid> = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT s.id
                FROM run_steps s
                JOIN workflow_runs r ON r.id = s.run_id
                WHERE s.status = 'pending'
                  AND (s.not_before IS NULL OR s.not_before <= NOW())
                  AND NOT EXISTS (
                      SELECT 1 FROM run_steps sib
                      WHERE sib.run_id = s.run_id AND sib.status = 'running'
                  )
                  AND (
                      s.step_number = 1
                      OR EXISTS (
                          SELECT 1 FROM run_steps prev
                          WHERE prev.run_id = s.run_id
                            AND prev.step_number = s.step_number - 1
                            AND prev.status = 'completed'
                      )
                  )
                ORDER BY r.priority DESC, s.created_at ASC, r.id ASC, s.id ASC
                LIMIT $2
                FOR UPDATE OF s SKIP LOCKED
            )
            UPDATE run_steps t
            SET status = 'running',
                worker_id = $1,
                started_at = NOW()
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id
            "#,
        )
        .bind(worker_id)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?
        .iter()
        .map(|r| r.get("id"))
        .collect();

        let mut claimed = Vec::with_capacity(claimed_ids.len());
        for step_id in claimed_ids {
            let row = sqlx::query(
                r#"
                SELECT s.id AS step_id, s.run_id, s.step_number, s.step_name, s.step_type,
                       s.is_last, s.retry, s.retries,
                       r.group_id, r.batch_id, r.workflow_id, r.document_hash, r.status AS run_status,
                       g.parameter_set_id, g.status AS group_status,
                       b.source,
                       c.config, c.cumulative_config
                FROM run_steps s
                JOIN workflow_runs r ON r.id = s.run_id
                JOIN run_groups g ON g.id = r.group_id
                JOIN batches b ON b.id = r.batch_id
                JOIN step_configs c ON c.id = s.step_config_id
                WHERE s.id = $1
                "#,
            )
            .bind(step_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

            let run_id: Uuid = row.get("run_id");
            let group_id: Uuid = row.get("group_id");
            let group_status: String = row.get("group_status");
            let run_status: String = row.get("run_status");

            // First claim within a group starts the group; first claim of a
            // run starts the run. Events go in outer-to-inner order so
            // history reads naturally.
            if group_status == "pending" {
                sqlx::query(
                    r#"
                    UPDATE run_groups SET status = 'running', started_at = NOW()
                    WHERE id = $1 AND status = 'pending'
                    "#,
                )
                .bind(group_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                record_event(
                    &mut *tx,
                    LifecycleEventKind::GroupStart,
                    group_id,
                    None,
                    None,
                    "running",
                    None,
                    serde_json::json!({}),
                )
                .await?;
            }

            if run_status == "pending" {
                sqlx::query(
                    r#"
                    UPDATE workflow_runs SET status = 'running', started_at = NOW()
                    WHERE id = $1 AND status = 'pending'
                    "#,
                )
                .bind(run_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                record_event(
                    &mut *tx,
                    LifecycleEventKind::ItemStart,
                    group_id,
                    Some(run_id),
                    None,
                    "running",
                    None,
                    serde_json::json!({}),
                )
                .await?;
            }

            let step_name: String = row.get("step_name");
            record_event(
                &mut *tx,
                LifecycleEventKind::StepStart,
                group_id,
                Some(run_id),
                Some(step_id),
                "running",
                None,
                serde_json::json!({ "step_name": step_name, "worker_id": worker_id }),
            )
            .await?;

            let step_type_str: String = row.get("step_type");
            let step_type = soliplex_core::StepType::parse(&step_type_str).ok_or_else(|| {
                StoreError::Invariant(format!("unknown step type in storage: {step_type_str}"))
            })?;

            claimed.push(ClaimedStep {
                step_id,
                run_id,
                group_id,
                batch_id: row.get("batch_id"),
                workflow_id: row.get("workflow_id"),
                parameter_set_id: row.get("parameter_set_id"),
                document_hash: row.get("document_hash"),
                source: row.get("source"),
                step_number: row.get::<i32, _>("step_number") as u32,
                step_name,
                step_type,
                is_last: row.get("is_last"),
                retry: row.get::<i32, _>("retry") as u32,
                retries: row.get::<i32, _>("retries") as u32,
                step_config: to_map(row.get("config")),
                cumulative_config: to_map(row.get("cumulative_config")),
            });
        }

        tx.commit().await.map_err(db_err)?;

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed steps");
        }
        Ok(claimed)
    }

    #[instrument(skip(self, metadata, next))]
    async fn complete_step(
        &self,
        step_id: Uuid,
        worker_id: &str,
        metadata: JsonMap,
        next: Option<StepSeed>,
    ) -> Result<CompletionOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Ownership is enforced in the WHERE clause: only the claiming
        // worker may write to a running step.
        let row = sqlx::query(
            r#"
            UPDATE run_steps
            SET status = 'completed', completed_at = NOW()
            WHERE id = $1 AND worker_id = $2 AND status = 'running'
            RETURNING run_id, step_name, is_last
            "#,
        )
        .bind(step_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| {
            StoreError::Conflict(format!(
                "step {step_id} is not running under worker {worker_id}"
            ))
        })?;

        let run_id: Uuid = row.get("run_id");
        let is_last: bool = row.get("is_last");
        let step_name: String = row.get("step_name");

        let run = sqlx::query(
            r#"
            SELECT group_id, batch_id FROM workflow_runs WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let group_id: Uuid = run.get("group_id");
        let batch_id: Uuid = run.get("batch_id");

        record_event(
            &mut *tx,
            LifecycleEventKind::StepEnd,
            group_id,
            Some(run_id),
            Some(step_id),
            "completed",
            None,
            serde_json::json!({ "step_name": step_name, "output": metadata }),
        )
        .await?;

        let outcome = match (is_last, next) {
            (false, Some(seed)) => {
                let next_id = insert_step(&mut *tx, run_id, &seed).await?;
                CompletionOutcome::NextSeeded { step_id: next_id }
            }
            (true, None) => {
                sqlx::query(
                    r#"
                    UPDATE workflow_runs
                    SET status = 'completed', completed_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(run_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                record_event(
                    &mut *tx,
                    LifecycleEventKind::ItemEnd,
                    group_id,
                    Some(run_id),
                    None,
                    "completed",
                    None,
                    serde_json::json!({}),
                )
                .await?;

                let open_runs: i64 = sqlx::query(
                    r#"
                    SELECT COUNT(*) AS n FROM workflow_runs
                    WHERE group_id = $1 AND status NOT IN ('completed', 'failed')
                    "#,
                )
                .bind(group_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?
                .get("n");

                if open_runs == 0 {
                    let group_failed = settle_group(&mut *tx, group_id, batch_id, None).await?;
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

        tx.commit().await.map_err(db_err)?;
        debug!(%step_id, ?outcome, "completed step");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn fail_step(
        &self,
        step_id: Uuid,
        worker_id: &str,
        error_msg: &str,
        kind: FailureKind,
        retry_delay: Duration,
    ) -> Result<FailureOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT s.run_id, s.step_name, s.retry, s.retries, r.group_id, r.batch_id
            FROM run_steps s
            JOIN workflow_runs r ON r.id = s.run_id
            WHERE s.id = $1 AND s.worker_id = $2 AND s.status = 'running'
            FOR UPDATE OF s
            "#,
        )
        .bind(step_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| {
            StoreError::Conflict(format!(
                "step {step_id} is not running under worker {worker_id}"
            ))
        })?;

        let run_id: Uuid = row.get("run_id");
        let group_id: Uuid = row.get("group_id");
        let batch_id: Uuid = row.get("batch_id");
        let step_name: String = row.get("step_name");
        let retry: i32 = row.get("retry");
        let retries: i32 = row.get("retries");

        let can_retry = matches!(kind, FailureKind::Transient) && retry < retries;

        let outcome = if can_retry {
            let not_before = Utc::now()
                + chrono::Duration::from_std(retry_delay).unwrap_or_else(|_| chrono::Duration::zero());

            sqlx::query(
                r#"
                UPDATE run_steps
                SET status = 'pending',
                    retry = retry + 1,
                    worker_id = NULL,
                    started_at = NULL,
                    not_before = $2,
                    error = $3
                WHERE id = $1
                "#,
            )
            .bind(step_id)
            .bind(not_before)
            .bind(error_msg)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            record_event(
                &mut *tx,
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
            )
            .await?;

            FailureOutcome::WillRetry {
                retry: (retry + 1) as u32,
                not_before,
            }
        } else {
            sqlx::query(
                r#"
                UPDATE run_steps
                SET status = 'failed', completed_at = NOW(), error = $2
                WHERE id = $1
                "#,
            )
            .bind(step_id)
            .bind(error_msg)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            record_event(
                &mut *tx,
                LifecycleEventKind::StepFailed,
                group_id,
                Some(run_id),
                Some(step_id),
                "failed",
                Some(error_msg),
                serde_json::json!({ "step_name": step_name, "fatal": kind == FailureKind::Fatal }),
            )
            .await?;

            sqlx::query(
                r#"
                UPDATE workflow_runs
                SET status = 'failed', completed_at = NOW(), status_message = $2
                WHERE id = $1
                "#,
            )
            .bind(run_id)
            .bind(error_msg)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            record_event(
                &mut *tx,
                LifecycleEventKind::ItemFailed,
                group_id,
                Some(run_id),
                None,
                "failed",
                Some(error_msg),
                serde_json::json!({ "step_name": step_name }),
            )
            .await?;

            let open_runs: i64 = sqlx::query(
                r#"
                SELECT COUNT(*) AS n FROM workflow_runs
                WHERE group_id = $1 AND status NOT IN ('completed', 'failed')
                "#,
            )
            .bind(group_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?
            .get("n");

            if open_runs == 0 {
                settle_group(&mut *tx, group_id, batch_id, Some(error_msg)).await?;
                FailureOutcome::RunFailed {
                    group_terminal: true,
                }
            } else {
                // Other runs are still in flight: the group surfaces the
                // failure without going terminal.
                sqlx::query(
                    r#"
                    UPDATE run_groups
                    SET status = 'error', status_message = $2
                    WHERE id = $1 AND status NOT IN ('completed', 'failed')
                    "#,
                )
                .bind(group_id)
                .bind(error_msg)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                FailureOutcome::RunFailed {
                    group_terminal: false,
                }
            }
        };

        tx.commit().await.map_err(db_err)?;
        debug!(%step_id, ?outcome, "failed step");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn reclaim_stale_steps(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_threshold).unwrap_or_else(|_| chrono::Duration::zero());

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // A running step whose worker stopped checking in (or whose
        // check-in row is gone) is stuck; this is the only path that
        // unsticks it.
        let stale = sqlx::query(
            r#"
            SELECT s.id, s.run_id, s.step_name, s.worker_id, r.group_id
            FROM run_steps s
            JOIN workflow_runs r ON r.id = s.run_id
            LEFT JOIN worker_checkins w ON w.worker_id = s.worker_id
            WHERE s.status = 'running'
              AND (w.worker_id IS NULL OR w.last_seen < $1)
            FOR UPDATE OF s SKIP LOCKED
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut reclaimed = Vec::with_capacity(stale.len());
        for row in stale {
            let id: Uuid = row.get("id");
            let run_id: Uuid = row.get("run_id");
            let group_id: Uuid = row.get("group_id");
            let step_name: String = row.get("step_name");
            let stale_worker: Option<String> = row.get("worker_id");

            sqlx::query(
                r#"
                UPDATE run_steps
                SET status = 'pending', worker_id = NULL, started_at = NULL
                WHERE id = $1
                "#,
            )
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            record_event(
                &mut *tx,
                LifecycleEventKind::StepFailed,
                group_id,
                Some(run_id),
                Some(id),
                "pending",
                Some("reclaimed from stale worker"),
                serde_json::json!({ "step_name": step_name, "stale_worker": stale_worker }),
            )
            .await?;

            reclaimed.push(id);
        }

        tx.commit().await.map_err(db_err)?;

        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed stale steps");
        }
        Ok(reclaimed)
    }

    async fn worker_heartbeat(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO worker_checkins (worker_id, first_seen, last_seen)
            VALUES ($1, NOW(), NOW())
            ON CONFLICT (worker_id) DO UPDATE SET last_seen = NOW()
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn remove_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM worker_checkins WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        debug!(worker_id, "removed worker check-in");
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerCheckinRow>, StoreError> {
        sqlx::query_as::<_, WorkerCheckinRow>(
            r#"
            SELECT worker_id, first_seen, last_seen
            FROM worker_checkins
            ORDER BY worker_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<RunGroupRow>, StoreError> {
        sqlx::query_as::<_, RunGroupRow>(
            r#"
            SELECT id, name, workflow_id, parameter_set_id, batch_id, status,
                   status_message, status_metadata, created_at, started_at, completed_at
            FROM run_groups WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_groups_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<RunGroupRow>, StoreError> {
        sqlx::query_as::<_, RunGroupRow>(
            r#"
            SELECT id, name, workflow_id, parameter_set_id, batch_id, status,
                   status_message, status_metadata, created_at, started_at, completed_at
            FROM run_groups WHERE batch_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<WorkflowRunRow>, StoreError> {
        sqlx::query_as::<_, WorkflowRunRow>(
            r#"
            SELECT id, workflow_id, group_id, batch_id, document_hash, priority, status,
                   status_message, status_metadata, run_params, created_at, started_at, completed_at
            FROM workflow_runs WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_runs_for_group(
        &self,
        group_id: Uuid,
    ) -> Result<Vec<WorkflowRunRow>, StoreError> {
        sqlx::query_as::<_, WorkflowRunRow>(
            r#"
            SELECT id, workflow_id, group_id, batch_id, document_hash, priority, status,
                   status_message, status_metadata, run_params, created_at, started_at, completed_at
            FROM workflow_runs WHERE group_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<RunStepRow>, StoreError> {
        sqlx::query_as::<_, RunStepRow>(
            r#"
            SELECT id, run_id, step_number, step_name, step_type, step_config_id, is_last,
                   retry, retries, status, worker_id, not_before, error,
                   created_at, started_at, completed_at
            FROM run_steps WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_steps_for_run(&self, run_id: Uuid) -> Result<Vec<RunStepRow>, StoreError> {
        sqlx::query_as::<_, RunStepRow>(
            r#"
            SELECT id, run_id, step_number, step_name, step_type, step_config_id, is_last,
                   retry, retries, status, worker_id, not_before, error,
                   created_at, started_at, completed_at
            FROM run_steps WHERE run_id = $1
            ORDER BY step_number
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn lifecycle_for_group(
        &self,
        group_id: Uuid,
    ) -> Result<Vec<LifecycleEventRow>, StoreError> {
        sqlx::query_as::<_, LifecycleEventRow>(
            r#"
            SELECT id, seq, kind, group_id, run_id, step_id, status, message, metadata, created_at
            FROM lifecycle_history
            WHERE group_id = $1
            ORDER BY seq
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    #[instrument(skip(self))]
    async fn delete_run_group(&self, id: Uuid) -> Result<DeletionReport, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let exists = sqlx::query("SELECT 1 AS present FROM run_groups WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(StoreError::not_found("run group", id));
        }

        let run_ids: Vec<Uuid> =
            sqlx::query("SELECT id FROM workflow_runs WHERE group_id = $1")
                .bind(id)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_err)?
                .iter()
                .map(|r| r.get("id"))
                .collect();

        let mut report = DeletionReport::default();

        report.run_steps = sqlx::query("DELETE FROM run_steps WHERE run_id = ANY($1)")
            .bind(&run_ids)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        report.lifecycle_events = sqlx::query("DELETE FROM lifecycle_history WHERE group_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        report.workflow_runs = sqlx::query("DELETE FROM workflow_runs WHERE group_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        report.run_groups = sqlx::query("DELETE FROM run_groups WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        tx.commit().await.map_err(db_err)?;
        debug!(group_id = %id, total = report.total(), "deleted run group");
        Ok(report)
    }

    #[instrument(skip(self, artifacts))]
    async fn delete_document_uri(
        &self,
        uri: &str,
        source: &str,
        artifacts: &dyn ArtifactStore,
    ) -> Result<DeletionReport, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let uri_row = sqlx::query(
            r#"
            SELECT id, document_hash FROM document_uris
            WHERE uri = $1 AND source = $2
            FOR UPDATE
            "#,
        )
        .bind(uri)
        .bind(source)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::not_found("document uri", format!("{uri} ({source})")))?;

        let uri_id: Uuid = uri_row.get("id");
        let hash: String = uri_row.get("document_hash");

        // Deletion paths are serialized by holding the document row.
        sqlx::query("SELECT hash FROM documents WHERE hash = $1 FOR UPDATE")
            .bind(&hash)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

        let references: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM document_uris WHERE document_hash = $1",
        )
        .bind(&hash)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?
        .get("n");

        let mut report = DeletionReport::default();

        if references == 1 {
            // Last reference: the document and everything hanging off it
            // goes too.
            let run_ids: Vec<Uuid> =
                sqlx::query("SELECT id FROM workflow_runs WHERE document_hash = $1")
                    .bind(&hash)
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(db_err)?
                    .iter()
                    .map(|r| r.get("id"))
                    .collect();

            report.run_steps = sqlx::query("DELETE FROM run_steps WHERE run_id = ANY($1)")
                .bind(&run_ids)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .rows_affected();

            report.lifecycle_events =
                sqlx::query("DELETE FROM lifecycle_history WHERE run_id = ANY($1)")
                    .bind(&run_ids)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?
                    .rows_affected();

            report.workflow_runs =
                sqlx::query("DELETE FROM workflow_runs WHERE document_hash = $1")
                    .bind(&hash)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?
                    .rows_affected();

            // An artifact backend error aborts the transaction before any
            // commit, leaving the rows in place.
            report.artifacts = artifacts.delete_all_for(&hash).await.map_err(|e| {
                error!(%hash, "artifact deletion failed, rolling back");
                StoreError::Artifact(e)
            })? as u64;

            report.uri_history =
                sqlx::query("DELETE FROM document_uri_history WHERE uri_id = $1")
                    .bind(uri_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?
                    .rows_affected();

            report.document_uris = sqlx::query("DELETE FROM document_uris WHERE id = $1")
                .bind(uri_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .rows_affected();

            report.documents = sqlx::query("DELETE FROM documents WHERE hash = $1")
                .bind(&hash)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .rows_affected();
        } else {
            report.uri_history =
                sqlx::query("DELETE FROM document_uri_history WHERE uri_id = $1")
                    .bind(uri_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?
                    .rows_affected();

            report.document_uris = sqlx::query("DELETE FROM document_uris WHERE id = $1")
                .bind(uri_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .rows_affected();
        }

        tx.commit().await.map_err(db_err)?;
        debug!(uri, source, total = report.total(), "deleted document uri");
        Ok(report)
    }
}

async fn append_uri_history(
    conn: &mut PgConnection,
    uri_id: Uuid,
    version: i32,
    hash: &str,
    action: UriAction,
    batch_id: Uuid,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO document_uri_history (id, uri_id, version, document_hash, action, batch_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(uri_id)
    .bind(version)
    .bind(hash)
    .bind(action.as_str())
    .bind(batch_id)
    .execute(conn)
    .await
    .map_err(db_err)?;

    Ok(())
}
