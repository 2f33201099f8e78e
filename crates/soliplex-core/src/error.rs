//! Shared error types that do not belong to a single layer.

use thiserror::Error;

/// Errors raised while reading process configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required key was not set
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    /// A key was set to a value that does not parse
    #[error("invalid value for {key}: {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(key: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.into(),
            reason: reason.into(),
        }
    }
}
