//! Error types for trajlog.
//!
//! All errors are strongly typed using thiserror. The taxonomy separates
//! malformed input (validation) from stale state (preconditions) so callers can
//! decide whether re-reading state and retrying makes sense.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{StepId, TrajectoryId};
use crate::step::{Producer, StepType};
use crate::storage::StorageError;

/// Validation errors that occur during input validation.
///
/// These are always synchronous and never partially applied.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing")]
    MissingField { field: String },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong { field: String, max_length: usize },

    #[error("Confidence value {value} on '{field}' is out of range [0.0, 1.0]")]
    ConfidenceOutOfRange { field: String, value: f32 },

    #[error("Step type '{step_type}' may not be produced by '{producer}'")]
    ProducerNotAllowed { step_type: StepType, producer: Producer },

    #[error("Severity {value} is out of range [0, 5]")]
    SeverityOutOfRange { value: u8 },

    #[error("Outcome must attach to a trajectory or a command")]
    EmptyAttachment,

    #[error("Metric '{name}' is not a finite number")]
    NonFiniteMetric { name: String },

    #[error("Invalid payload for '{step_type}': {reason}")]
    InvalidPayload { step_type: StepType, reason: String },

    #[error("Invalid chain position: {reason}")]
    InvalidChainPosition { reason: String },

    #[error("Field '{field}' is not serializable: {reason}")]
    Unserializable { field: String, reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// Precondition failures: a command was valid but the current aggregate state
/// does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    #[error("Trajectory not found: {id}")]
    TrajectoryNotFound { id: TrajectoryId },

    #[error("Trajectory already exists: {id}")]
    TrajectoryAlreadyExists { id: TrajectoryId },

    #[error("Trajectory already ended: {id}")]
    TrajectoryEnded { id: TrajectoryId },

    #[error("Command '{idempotency_key}' is already in flight")]
    CommandInFlight { idempotency_key: String },
}

/// Which trajectory budget was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    Steps,
    Time,
    Writes,
    Egress,
}

impl fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steps => write!(f, "steps"),
            Self::Time => write!(f, "time"),
            Self::Writes => write!(f, "writes"),
            Self::Egress => write!(f, "egress"),
        }
    }
}

/// Execution errors that occur while emitting steps.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("Budget exceeded for trajectory {trajectory_id}: {budget} (limit: {limit})")]
    BudgetExceeded {
        trajectory_id: TrajectoryId,
        budget: BudgetKind,
        limit: u64,
    },

    #[error("Trajectory {trajectory_id} was aborted and accepts no further steps")]
    TrajectoryAborted { trajectory_id: TrajectoryId },

    #[error("Trajectory {trajectory_id} has ended")]
    TrajectoryClosed { trajectory_id: TrajectoryId },

    #[error("Chain broken at {trajectory_id}#{step_seq}: {reason}")]
    ChainBroken {
        trajectory_id: TrajectoryId,
        step_seq: u64,
        step_id: Option<StepId>,
        reason: String,
    },
}

/// Errors raised by projection folds and queries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error("Projection '{name}' has not been finalized")]
    NotFinalized { name: String },

    #[error("Projection '{name}' is finalized and accepts no further entries")]
    AlreadyFinalized { name: String },

    #[error("Projection '{name}' is not registered")]
    NotRegistered { name: String },

    #[error("Projection '{name}' is registered twice")]
    DuplicateRegistration { name: String },

    #[error("Failed to serialize projection '{name}': {message}")]
    Serialization { name: String, message: String },
}

/// Top-level error type for trajlog.
#[derive(Debug, Error)]
pub enum TrajError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Projection error: {0}")]
    Projection(#[from] ProjectionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TrajError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a precondition failure.
    #[must_use]
    pub const fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }

    /// Returns true if a trajectory budget was exhausted.
    #[must_use]
    pub const fn is_budget_exceeded(&self) -> bool {
        matches!(
            self,
            Self::Execution(ExecutionError::BudgetExceeded { .. })
        )
    }

    /// Returns the exhausted budget, if any.
    #[must_use]
    pub const fn budget_kind(&self) -> Option<BudgetKind> {
        match self {
            Self::Execution(ExecutionError::BudgetExceeded { budget, .. }) => Some(*budget),
            _ => None,
        }
    }

    /// Returns true if retrying after re-reading state may succeed.
    ///
    /// Budget exhaustion is never retried automatically.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Precondition(e) => matches!(e, PreconditionError::CommandInFlight { .. }),
            Self::Storage(e) => e.is_transient(),
            Self::Validation(_)
            | Self::Execution(_)
            | Self::Projection(_)
            | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for trajlog operations.
pub type TrajResult<T> = Result<T, TrajError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_confidence() {
        let err = ValidationError::ConfidenceOutOfRange {
            field: "refs.entities[0]".to_string(),
            value: 1.5,
        };
        let msg = format!("{err}");
        assert!(msg.contains("1.5"));
        assert!(msg.contains("out of range"));
    }

    #[test]
    fn test_producer_not_allowed_message() {
        let err = ValidationError::ProducerNotAllowed {
            step_type: StepType::EntityWritten,
            producer: Producer::Human,
        };
        let msg = err.to_string();
        assert!(msg.contains("entity_written"));
        assert!(msg.contains("human"));
    }

    #[test]
    fn test_budget_exceeded_names_budget() {
        let err: TrajError = ExecutionError::BudgetExceeded {
            trajectory_id: TrajectoryId::new("t1").unwrap(),
            budget: BudgetKind::Egress,
            limit: 3,
        }
        .into();
        assert!(err.is_budget_exceeded());
        assert_eq!(err.budget_kind(), Some(BudgetKind::Egress));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("egress"));
    }

    #[test]
    fn test_precondition_is_distinct_from_validation() {
        let err: TrajError = PreconditionError::TrajectoryNotFound {
            id: TrajectoryId::new("t9").unwrap(),
        }
        .into();
        assert!(err.is_precondition());
        assert!(!err.is_validation());

        let err: TrajError = ValidationError::EmptyAttachment.into();
        assert!(err.is_validation());
        assert!(!err.is_precondition());
    }

    #[test]
    fn test_in_flight_command_is_retryable() {
        let err: TrajError = PreconditionError::CommandInFlight {
            idempotency_key: "k1".to_string(),
        }
        .into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_internal_error() {
        let err = TrajError::internal("unexpected state");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("unexpected state"));
    }
}
