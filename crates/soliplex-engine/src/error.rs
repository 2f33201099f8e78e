//! Engine error taxonomy.

use thiserror::Error;

use soliplex_core::DefinitionError;
use soliplex_storage::{ArtifactError, StoreError};

use crate::registry::RegistryError;

/// Errors surfaced by engine operations.
///
/// The taxonomy mirrors how callers must react: validation and not-found
/// fail the call, conflicts are retried by the caller, invariant errors are
/// logged at critical severity and the affected run refuses to advance.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input; fails the current call, never retried
    #[error("validation error: {0}")]
    Validation(String),

    /// Entity missing
    #[error("not found: {0}")]
    NotFound(String),

    /// An impossible state was observed
    #[error("engine invariant violated: {0}")]
    Invariant(String),

    /// Persistence failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Artifact store failure
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// Registry failure
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Declarative file failure
    #[error(transparent)]
    Definition(#[from] DefinitionError),
}
