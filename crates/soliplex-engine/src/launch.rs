//! Workflow launch: materializing run groups from a batch's documents.

use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use soliplex_core::{IngesterConfig, JsonMap};
use soliplex_storage::{GroupSeed, IngestStore, RunGroupRow, RunSeed};

use crate::dispatch::materialize_step;
use crate::error::EngineError;
use crate::registry::Registry;

/// Options for starting workflows over a batch.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Workflow to run; the configured default when absent
    pub workflow_id: Option<String>,

    /// Parameter set to apply; the configured default when absent
    pub parameter_set_id: Option<String>,

    /// Priority for every run in the group (higher claims first)
    pub priority: i32,

    /// Group name; derived from the workflow and batch when absent
    pub group_name: Option<String>,
}

/// Create a run group with one workflow run per document, seeding each
/// run's first step as pending.
///
/// Duplicate hashes are allowed to run in parallel; handlers coordinate
/// through the content-addressed artifact store.
#[instrument(skip(store, registry, config, document_hashes), fields(docs = document_hashes.len()))]
pub async fn start_workflows(
    store: &Arc<dyn IngestStore>,
    registry: &Registry,
    config: &IngesterConfig,
    batch_id: Uuid,
    document_hashes: &[String],
    opts: StartOptions,
) -> Result<RunGroupRow, EngineError> {
    if document_hashes.is_empty() {
        return Err(EngineError::Validation(
            "cannot start workflows for zero documents".into(),
        ));
    }

    let batch = store
        .get_batch(batch_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("batch {batch_id}")))?;

    let workflow_id = opts
        .workflow_id
        .unwrap_or_else(|| config.default_workflow.clone());
    let parameter_set_id = opts
        .parameter_set_id
        .unwrap_or_else(|| config.default_params.clone());

    let workflow = registry
        .get_workflow(&workflow_id)
        .ok_or_else(|| EngineError::NotFound(format!("workflow definition {workflow_id}")))?;
    let params = registry
        .get_parameter_set(&parameter_set_id)
        .ok_or_else(|| EngineError::NotFound(format!("parameter set {parameter_set_id}")))?;

    params.validate_against(&workflow)?;

    for hash in document_hashes {
        if store.get_document(hash).await?.is_none() {
            return Err(EngineError::NotFound(format!("document {hash}")));
        }
    }

    let first_step = materialize_step(&workflow, &params, 1, &JsonMap::new()).ok_or_else(|| {
        EngineError::Invariant(format!("workflow {workflow_id} has no first step"))
    })?;

    let group = store
        .create_run_group(GroupSeed {
            name: opts
                .group_name
                .unwrap_or_else(|| format!("{workflow_id}/{}", batch.name)),
            workflow_id: workflow_id.clone(),
            parameter_set_id,
            batch_id,
            runs: document_hashes
                .iter()
                .map(|hash| RunSeed {
                    document_hash: hash.clone(),
                    priority: opts.priority,
                    run_params: JsonMap::new(),
                    first_step: first_step.clone(),
                })
                .collect(),
        })
        .await?;

    info!(
        group_id = %group.id,
        workflow = %workflow_id,
        runs = document_hashes.len(),
        "started workflows"
    );
    Ok(group)
}
