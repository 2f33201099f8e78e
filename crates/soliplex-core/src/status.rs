//! Status enums for groups, runs, steps, and lifecycle events.

use serde::{Deserialize, Serialize};

/// Status of a run group or workflow run.
///
/// `Error` is used only at the group level: at least one run has failed
/// while siblings are still in flight. It is non-terminal; a group settles
/// to `Completed` or `Failed` once every run is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Error,
    Failed,
}

impl RunStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted status of a run step.
///
/// A transient failure is never stored as its own state: the failing step is
/// requeued as `Pending` (with a not-before time) or settles as `Failed` in
/// the same transaction, and the failure itself is recorded in lifecycle
/// history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Kind of a lifecycle history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    GroupStart,
    GroupEnd,
    ItemStart,
    ItemEnd,
    ItemFailed,
    StepStart,
    StepEnd,
    StepFailed,
}

impl LifecycleEventKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "group_start" => Some(Self::GroupStart),
            "group_end" => Some(Self::GroupEnd),
            "item_start" => Some(Self::ItemStart),
            "item_end" => Some(Self::ItemEnd),
            "item_failed" => Some(Self::ItemFailed),
            "step_start" => Some(Self::StepStart),
            "step_end" => Some(Self::StepEnd),
            "step_failed" => Some(Self::StepFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for LifecycleEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GroupStart => write!(f, "group_start"),
            Self::GroupEnd => write!(f, "group_end"),
            Self::ItemStart => write!(f, "item_start"),
            Self::ItemEnd => write!(f, "item_end"),
            Self::ItemFailed => write!(f, "item_failed"),
            Self::StepStart => write!(f, "step_start"),
            Self::StepEnd => write!(f, "step_end"),
            Self::StepFailed => write!(f, "step_failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Error.is_terminal());
        assert!(!RunStatus::Running.is_terminal());

        assert!(StepStatus::Failed.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
    }

    #[test]
    fn test_display_round_trip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Error,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(&status.to_string()), Some(status));
        }

        for kind in [
            LifecycleEventKind::GroupStart,
            LifecycleEventKind::StepFailed,
            LifecycleEventKind::ItemEnd,
        ] {
            assert_eq!(LifecycleEventKind::parse(&kind.to_string()), Some(kind));
        }
    }

    #[test]
    fn test_unknown_status() {
        assert_eq!(RunStatus::parse("cancelled"), None);
        assert_eq!(StepStatus::parse("error"), None);
    }
}
