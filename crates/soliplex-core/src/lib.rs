//! Core domain types for the Soliplex ingestion engine.
//!
//! This crate holds everything the storage and engine layers share: status
//! enums, the artifact-kind vocabulary, content addressing, the step handler
//! contract, retry policy, declarative workflow/parameter definitions, and
//! process configuration. It has no persistence dependencies.

pub mod artifact;
pub mod config;
pub mod definition;
pub mod error;
pub mod handler;
pub mod retry;
pub mod status;

pub use artifact::{content_hash, ArtifactKind};
pub use config::{ArtifactBackend, IngesterConfig};
pub use definition::{DefinitionError, ParameterSet, StepDefinition, StepType, WorkflowDefinition};
pub use error::ConfigError;
pub use handler::{HandlerError, HandlerRegistry, StepContext, StepHandler};
pub use retry::RetryPolicy;
pub use status::{LifecycleEventKind, RunStatus, StepStatus};

/// JSON object map used for step configs, metadata, and handler output.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
