//! Declarative workflow definitions and parameter sets.
//!
//! Both are authored as YAML files and loaded by the registry. The raw text
//! is preserved alongside the parsed form so uploads can be re-exported
//! verbatim.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::JsonMap;

/// Classification of a step, which determines its recognized options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Ingest,
    Validate,
    Parse,
    Chunk,
    Embed,
    Store,
    Enrich,
    Route,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Validate => "validate",
            Self::Parse => "parse",
            Self::Chunk => "chunk",
            Self::Embed => "embed",
            Self::Store => "store",
            Self::Enrich => "enrich",
            Self::Route => "route",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ingest" => Some(Self::Ingest),
            "validate" => Some(Self::Validate),
            "parse" => Some(Self::Parse),
            "chunk" => Some(Self::Chunk),
            "embed" => Some(Self::Embed),
            "store" => Some(Self::Store),
            "enrich" => Some(Self::Enrich),
            "route" => Some(Self::Route),
            _ => None,
        }
    }

    /// Option names this step type recognizes in a parameter set.
    ///
    /// Extensions are additive; an empty slice means the options are
    /// handler-specific and not validated here.
    pub fn recognized_options(&self) -> &'static [&'static str] {
        match self {
            Self::Ingest => &[],
            Self::Validate => &["allowed_mime_types", "max_size_bytes"],
            Self::Parse => &["ocr", "language", "backend", "table_mode"],
            Self::Chunk => &["chunker", "target_tokens", "overlap_chars", "strategy"],
            Self::Embed => &["provider", "model", "dimension", "batch_size"],
            Self::Store => &["database", "upsert"],
            Self::Enrich => &[],
            Self::Route => &["predicate", "true_branch", "false_branch"],
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name, unique within the workflow
    pub name: String,

    /// Step type, which determines the recognized option set
    #[serde(rename = "type")]
    pub step_type: StepType,

    /// Fully-qualified handler reference, resolved through the handler
    /// registry
    pub handler: String,

    /// Retry limit for transient failures (0 = never retried)
    #[serde(default)]
    pub retries: u32,

    /// Static per-step parameters baked into the definition
    #[serde(default)]
    pub params: JsonMap,
}

/// A declarative, ordered list of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identifier, unique across builtin and user origins
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: Option<String>,

    /// Ordered item steps; step numbers are 1-based positions in this list
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Parse and validate a YAML definition.
    pub fn from_yaml(text: &str) -> Result<Self, DefinitionError> {
        let def: Self = serde_yaml::from_str(text).map_err(DefinitionError::Yaml)?;
        def.validate()?;
        Ok(def)
    }

    fn validate(&self) -> Result<(), DefinitionError> {
        if self.id.trim().is_empty() {
            return Err(DefinitionError::EmptyId);
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps(self.id.clone()));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(DefinitionError::DuplicateStep {
                    workflow: self.id.clone(),
                    step: step.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// 1-based position of the named step, if present.
    pub fn step_number(&self, name: &str) -> Option<u32> {
        self.steps
            .iter()
            .position(|s| s.name == name)
            .map(|i| i as u32 + 1)
    }

    /// The step at the given 1-based number.
    pub fn step_at(&self, number: u32) -> Option<&StepDefinition> {
        if number == 0 {
            return None;
        }
        self.steps.get(number as usize - 1)
    }
}

/// Options the engine itself understands on any step, regardless of type.
pub const ENGINE_OPTIONS: &[&str] = &["timeout_seconds"];

/// A declarative bundle of per-step options selected at workflow start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSet {
    /// Stable identifier, unique across builtin and user origins
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Mapping from step name to an option map drawn from that step's
    /// recognized option set
    #[serde(default)]
    pub steps: std::collections::BTreeMap<String, JsonMap>,
}

impl ParameterSet {
    pub fn from_yaml(text: &str) -> Result<Self, DefinitionError> {
        let set: Self = serde_yaml::from_str(text).map_err(DefinitionError::Yaml)?;
        if set.id.trim().is_empty() {
            return Err(DefinitionError::EmptyId);
        }
        Ok(set)
    }

    /// Options configured for the named step, or an empty map.
    pub fn options_for(&self, step_name: &str) -> JsonMap {
        self.steps.get(step_name).cloned().unwrap_or_default()
    }

    /// Reject options a step's type does not recognize.
    ///
    /// Types with an open option set (empty recognized list) accept
    /// anything; engine-wide options are accepted on every step.
    pub fn validate_against(&self, workflow: &WorkflowDefinition) -> Result<(), DefinitionError> {
        for (step_name, options) in &self.steps {
            let Some(step) = workflow.steps.iter().find(|s| &s.name == step_name) else {
                continue;
            };
            let recognized = step.step_type.recognized_options();
            if recognized.is_empty() {
                continue;
            }
            for key in options.keys() {
                if !recognized.contains(&key.as_str()) && !ENGINE_OPTIONS.contains(&key.as_str()) {
                    return Err(DefinitionError::UnknownOption {
                        parameter_set: self.id.clone(),
                        step: step_name.clone(),
                        option: key.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Errors from parsing or validating declarative files.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to parse YAML: {0}")]
    Yaml(#[source] serde_yaml::Error),

    #[error("definition id must not be empty")]
    EmptyId,

    #[error("workflow {0} has no steps")]
    NoSteps(String),

    #[error("workflow {workflow} defines step {step} more than once")]
    DuplicateStep { workflow: String, step: String },

    #[error("parameter set {parameter_set} sets unrecognized option {option} on step {step}")]
    UnknownOption {
        parameter_set: String,
        step: String,
        option: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKFLOW_YAML: &str = r#"
id: batch_split
name: Parse, chunk, embed, store
steps:
  - name: parse
    type: parse
    handler: soliplex.steps.parse
    retries: 2
  - name: chunk
    type: chunk
    handler: soliplex.steps.chunk
    retries: 1
  - name: embed
    type: embed
    handler: soliplex.steps.embed
    retries: 2
  - name: store
    type: store
    handler: soliplex.steps.store
"#;

    const PARAMS_YAML: &str = r#"
id: default
steps:
  chunk:
    chunker: token
    target_tokens: 512
  embed:
    model: nomic-embed-text
    dimension: 768
"#;

    #[test]
    fn test_parse_workflow() {
        let def = WorkflowDefinition::from_yaml(WORKFLOW_YAML).unwrap();
        assert_eq!(def.id, "batch_split");
        assert_eq!(def.steps.len(), 4);
        assert_eq!(def.steps[0].retries, 2);
        assert_eq!(def.steps[3].retries, 0);
        assert_eq!(def.step_number("embed"), Some(3));
        assert_eq!(def.step_at(1).unwrap().name, "parse");
        assert!(def.step_at(0).is_none());
        assert!(def.step_at(5).is_none());
    }

    #[test]
    fn test_parse_parameter_set() {
        let set = ParameterSet::from_yaml(PARAMS_YAML).unwrap();
        assert_eq!(set.id, "default");
        let chunk = set.options_for("chunk");
        assert_eq!(chunk.get("target_tokens"), Some(&serde_json::json!(512)));
        assert!(set.options_for("parse").is_empty());
    }

    #[test]
    fn test_validate_against_recognized_options() {
        let def = WorkflowDefinition::from_yaml(WORKFLOW_YAML).unwrap();
        let set = ParameterSet::from_yaml(PARAMS_YAML).unwrap();
        set.validate_against(&def).unwrap();

        let bad = ParameterSet::from_yaml(
            r#"
id: bad
steps:
  embed:
    temperature: 0.7
"#,
        )
        .unwrap();
        let err = bad.validate_against(&def).unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownOption { .. }));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let err = WorkflowDefinition::from_yaml(
            r#"
id: dup
steps:
  - name: parse
    type: parse
    handler: a
  - name: parse
    type: parse
    handler: b
"#,
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateStep { .. }));
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let err = WorkflowDefinition::from_yaml("id: empty\nsteps: []").unwrap_err();
        assert!(matches!(err, DefinitionError::NoSteps(_)));
    }
}
