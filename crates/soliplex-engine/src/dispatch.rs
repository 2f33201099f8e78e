//! Dispatcher: executes claimed steps and advances the run state machine.

use std::sync::Arc;

use tracing::{error, instrument, warn};

use soliplex_core::{
    HandlerError, HandlerRegistry, JsonMap, ParameterSet, RetryPolicy, StepContext,
    WorkflowDefinition,
};
use soliplex_storage::{ClaimedStep, FailureKind, IngestStore, StepSeed};

use crate::error::EngineError;
use crate::registry::Registry;

/// Materialize the seed for step `number` of a workflow.
///
/// The step's own config is its static definition parameters overlaid by
/// the parameter set's entry for the step; the cumulative snapshot is the
/// prior snapshot merged with that config. Returns `None` past the last
/// step.
pub fn materialize_step(
    workflow: &WorkflowDefinition,
    params: &ParameterSet,
    number: u32,
    prior_cumulative: &JsonMap,
) -> Option<StepSeed> {
    let step = workflow.step_at(number)?;

    let mut config = step.params.clone();
    config.extend(params.options_for(&step.name));

    let mut cumulative = prior_cumulative.clone();
    cumulative.extend(config.clone());

    Some(StepSeed {
        step_number: number,
        step_name: step.name.clone(),
        step_type: step.step_type,
        is_last: number as usize == workflow.steps.len(),
        retries: step.retries,
        config,
        cumulative_config: cumulative,
    })
}

/// Executes claimed steps: resolves the handler, runs it, and writes the
/// outcome (advance, retry, or failure) through the store.
pub struct Dispatcher {
    store: Arc<dyn IngestStore>,
    registry: Arc<Registry>,
    handlers: Arc<HandlerRegistry>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn IngestStore>,
        registry: Arc<Registry>,
        handlers: Arc<HandlerRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            handlers,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn IngestStore> {
        &self.store
    }

    /// Claim up to `limit` steps for the worker.
    pub async fn claim(
        &self,
        worker_id: &str,
        limit: usize,
    ) -> Result<Vec<ClaimedStep>, EngineError> {
        Ok(self.store.claim_steps(worker_id, limit).await?)
    }

    /// Execute one claimed step to its terminal write.
    ///
    /// Handler failures are absorbed into the retry state machine; an `Err`
    /// from this method means the advance itself could not be persisted, in
    /// which case the step stays running and crash recovery will reclaim
    /// it.
    #[instrument(skip(self, claimed), fields(step_id = %claimed.step_id, step = %claimed.step_name))]
    pub async fn execute(&self, worker_id: &str, claimed: ClaimedStep) -> Result<(), EngineError> {
        match self.resolve_and_run(&claimed).await {
            Ok(metadata) => {
                let next = if claimed.is_last {
                    None
                } else {
                    match self.next_seed(&claimed) {
                        Ok(seed) => Some(seed),
                        Err(diagnostic) => {
                            // An impossible state: the definitions were
                            // valid at claim time. Refuse to advance and
                            // fail the run with the diagnostic.
                            error!(
                                step_id = %claimed.step_id,
                                workflow = %claimed.workflow_id,
                                %diagnostic,
                                "cannot materialize successor step"
                            );
                            self.store
                                .fail_step(
                                    claimed.step_id,
                                    worker_id,
                                    &diagnostic,
                                    FailureKind::Fatal,
                                    std::time::Duration::ZERO,
                                )
                                .await?;
                            return Ok(());
                        }
                    }
                };

                self.store
                    .complete_step(claimed.step_id, worker_id, metadata, next)
                    .await?;
                Ok(())
            }
            Err(failure) => {
                let (kind, message) = match &failure {
                    HandlerError::Retryable(msg) => (FailureKind::Transient, msg.as_str()),
                    HandlerError::Fatal(msg) => (FailureKind::Fatal, msg.as_str()),
                };
                if kind == FailureKind::Fatal {
                    error!(step = %claimed.step_name, message, "step failed fatally");
                } else {
                    warn!(step = %claimed.step_name, message, "step failed, may retry");
                }

                let delay = self.retry.delay_for_retry(claimed.retry + 1);
                self.store
                    .fail_step(claimed.step_id, worker_id, message, kind, delay)
                    .await?;
                Ok(())
            }
        }
    }

    /// Seed for the step after `claimed`, or a diagnostic for why none can
    /// be built.
    fn next_seed(&self, claimed: &ClaimedStep) -> Result<StepSeed, String> {
        let workflow = self
            .registry
            .get_workflow(&claimed.workflow_id)
            .ok_or_else(|| format!("workflow definition {} is gone", claimed.workflow_id))?;
        let params = self
            .registry
            .get_parameter_set(&claimed.parameter_set_id)
            .ok_or_else(|| format!("parameter set {} is gone", claimed.parameter_set_id))?;

        materialize_step(
            &workflow,
            &params,
            claimed.step_number + 1,
            &claimed.cumulative_config,
        )
        .ok_or_else(|| {
            format!(
                "step {} of {} is not last but the workflow has no step {}",
                claimed.step_number,
                claimed.workflow_id,
                claimed.step_number + 1
            )
        })
    }

    /// Report a panicking handler as a retryable failure.
    ///
    /// Untyped handler failures are treated as retryable; `retry` is the
    /// step's retry counter at claim time.
    pub async fn fail_panicked(
        &self,
        worker_id: &str,
        step_id: uuid::Uuid,
        retry: u32,
    ) -> Result<(), EngineError> {
        let delay = self.retry.delay_for_retry(retry + 1);
        self.store
            .fail_step(
                step_id,
                worker_id,
                "handler panicked",
                FailureKind::Transient,
                delay,
            )
            .await?;
        Ok(())
    }

    /// Resolve the handler for a claimed step and run it.
    ///
    /// Resolution failures are fatal: the definitions were validated at
    /// load time, so a missing workflow, drifted step, or unregistered
    /// handler at execution time is a deployment problem no retry fixes.
    async fn resolve_and_run(&self, claimed: &ClaimedStep) -> Result<JsonMap, HandlerError> {
        let workflow = self
            .registry
            .get_workflow(&claimed.workflow_id)
            .ok_or_else(|| {
                HandlerError::fatal(format!("workflow definition {} is gone", claimed.workflow_id))
            })?;

        let step = workflow.step_at(claimed.step_number).ok_or_else(|| {
            HandlerError::fatal(format!(
                "workflow {} has no step {}",
                claimed.workflow_id, claimed.step_number
            ))
        })?;

        if step.name != claimed.step_name {
            return Err(HandlerError::fatal(format!(
                "workflow {} step {} is now {}, expected {}",
                claimed.workflow_id, claimed.step_number, step.name, claimed.step_name
            )));
        }

        let handler = self.handlers.get(&step.handler).ok_or_else(|| {
            HandlerError::fatal(format!("no handler registered for {}", step.handler))
        })?;

        let ctx = StepContext {
            batch_id: Some(claimed.batch_id),
            document_hash: Some(claimed.document_hash.clone()),
            source: Some(claimed.source.clone()),
            step_config: claimed.step_config.clone(),
            cumulative_config: claimed.cumulative_config.clone(),
        };

        // A step may declare a soft deadline; exceeding it cancels the
        // handler and counts as a transient failure.
        let deadline = claimed
            .step_config
            .get("timeout_seconds")
            .and_then(serde_json::Value::as_u64);

        match deadline {
            Some(secs) => {
                match tokio::time::timeout(
                    std::time::Duration::from_secs(secs),
                    handler.execute(ctx),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(HandlerError::retryable(format!(
                        "step exceeded its {secs}s deadline"
                    ))),
                }
            }
            None => handler.execute(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use soliplex_core::StepType;

    fn workflow() -> WorkflowDefinition {
        WorkflowDefinition::from_yaml(
            r#"
id: wf
steps:
  - name: parse
    type: parse
    handler: h.parse
    params:
      ocr: false
  - name: chunk
    type: chunk
    handler: h.chunk
"#,
        )
        .unwrap()
    }

    fn params() -> ParameterSet {
        ParameterSet::from_yaml(
            r#"
id: p
steps:
  parse:
    ocr: true
    language: en
  chunk:
    target_tokens: 256
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_materialize_merges_static_params_and_options() {
        let seed = materialize_step(&workflow(), &params(), 1, &JsonMap::new()).unwrap();

        assert_eq!(seed.step_name, "parse");
        assert_eq!(seed.step_type, StepType::Parse);
        assert!(!seed.is_last);
        // Parameter set overrides the static default
        assert_eq!(seed.config["ocr"], json!(true));
        assert_eq!(seed.config["language"], json!("en"));
        assert_eq!(seed.cumulative_config, seed.config);
    }

    #[test]
    fn test_materialize_accumulates_cumulative_config() {
        let first = materialize_step(&workflow(), &params(), 1, &JsonMap::new()).unwrap();
        let second = materialize_step(&workflow(), &params(), 2, &first.cumulative_config).unwrap();

        assert!(second.is_last);
        assert_eq!(second.config.len(), 1);
        // Cumulative carries the parse options forward
        assert_eq!(second.cumulative_config["ocr"], json!(true));
        assert_eq!(second.cumulative_config["target_tokens"], json!(256));
    }

    #[test]
    fn test_materialize_past_last_step() {
        assert!(materialize_step(&workflow(), &params(), 3, &JsonMap::new()).is_none());
        assert!(materialize_step(&workflow(), &params(), 0, &JsonMap::new()).is_none());
    }
}
