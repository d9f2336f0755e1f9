//! Outcomes attached to trajectories or commands.
//!
//! Outcomes are append-only and never mutated. Their id is derived from their
//! canonical content, so re-appending an identical outcome is idempotent.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::hash::canonical_bytes;
use crate::ids::{CommandId, OutcomeId, TrajectoryId};
use crate::refs::{validate_refs, Refs};
use crate::step::SCHEMA_VERSION;

/// Highest allowed severity.
pub const MAX_SEVERITY: u8 = 5;

/// Maximum length of free-form notes.
pub const MAX_NOTES_LENGTH: usize = 8 * 1024;

/// Outcome taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    PartialSuccess,
    Failure,
    Incident,
    Rollback,
    Cancelled,
}

impl OutcomeKind {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failure => "failure",
            Self::Incident => "incident",
            Self::Rollback => "rollback",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an outcome is about. At least one side must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachesTo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trajectory_id: Option<TrajectoryId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
}

impl AttachesTo {
    /// Attaches to a trajectory.
    #[must_use]
    pub const fn trajectory(id: TrajectoryId) -> Self {
        Self {
            trajectory_id: Some(id),
            command_id: None,
        }
    }

    /// Attaches to a command.
    #[must_use]
    pub const fn command(id: CommandId) -> Self {
        Self {
            trajectory_id: None,
            command_id: Some(id),
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.trajectory_id.is_none() && self.command_id.is_none()
    }
}

/// An immutable outcome record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub outcome_id: OutcomeId,
    pub schema_version: u32,
    pub attaches_to: AttachesTo,
    pub kind: OutcomeKind,
    pub severity: u8,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub refs: Refs,
    pub timestamp: DateTime<Utc>,
}

/// Everything needed to build an outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeInput {
    pub attaches_to: AttachesTo,
    pub kind: OutcomeKind,
    pub severity: u8,
    pub metrics: BTreeMap<String, f64>,
    pub notes: Option<String>,
    pub refs: Refs,
    pub timestamp: DateTime<Utc>,
}

impl OutcomeInput {
    /// Minimal outcome attached to a trajectory.
    #[must_use]
    pub fn for_trajectory(trajectory_id: TrajectoryId, kind: OutcomeKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            attaches_to: AttachesTo::trajectory(trajectory_id),
            kind,
            severity: 0,
            metrics: BTreeMap::new(),
            notes: None,
            refs: Refs::new(),
            timestamp,
        }
    }

    #[must_use]
    pub fn severity(mut self, severity: u8) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn refs(mut self, refs: Refs) -> Self {
        self.refs = refs;
        self
    }

    #[must_use]
    pub fn metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

#[derive(Serialize)]
struct OutcomeContent<'a> {
    attaches_to: &'a AttachesTo,
    kind: OutcomeKind,
    severity: u8,
    metrics: &'a BTreeMap<String, f64>,
    notes: Option<&'a str>,
    refs: &'a Refs,
    timestamp: &'a DateTime<Utc>,
}

/// Builds a validated outcome with a content-derived id.
///
/// # Errors
///
/// - `EmptyAttachment` if neither trajectory nor command is referenced
/// - `SeverityOutOfRange` if severity exceeds 5
/// - `NonFiniteMetric` for NaN/infinite metrics
/// - `ConfidenceOutOfRange` for invalid refs
pub fn build_outcome(input: OutcomeInput) -> Result<Outcome, ValidationError> {
    if input.attaches_to.is_empty() {
        return Err(ValidationError::EmptyAttachment);
    }
    if input.severity > MAX_SEVERITY {
        return Err(ValidationError::SeverityOutOfRange {
            value: input.severity,
        });
    }
    if let Some((name, _)) = input.metrics.iter().find(|(_, v)| !v.is_finite()) {
        return Err(ValidationError::NonFiniteMetric { name: name.clone() });
    }
    if let Some(notes) = input.notes.as_deref() {
        if notes.len() > MAX_NOTES_LENGTH {
            return Err(ValidationError::FieldTooLong {
                field: "notes".to_string(),
                max_length: MAX_NOTES_LENGTH,
            });
        }
    }
    validate_refs(&input.refs)?;

    let content = canonical_bytes(&OutcomeContent {
        attaches_to: &input.attaches_to,
        kind: input.kind,
        severity: input.severity,
        metrics: &input.metrics,
        notes: input.notes.as_deref(),
        refs: &input.refs,
        timestamp: &input.timestamp,
    })
    .map_err(|e| ValidationError::Unserializable {
        field: "outcome".to_string(),
        reason: e.to_string(),
    })?;

    Ok(Outcome {
        outcome_id: OutcomeId::from_content(&content),
        schema_version: SCHEMA_VERSION,
        attaches_to: input.attaches_to,
        kind: input.kind,
        severity: input.severity,
        metrics: input.metrics,
        notes: input.notes,
        refs: input.refs,
        timestamp: input.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::RefEntry;

    fn t1() -> TrajectoryId {
        TrajectoryId::new("t1").unwrap()
    }

    #[test]
    fn build_outcome_requires_attachment() {
        let input = OutcomeInput {
            attaches_to: AttachesTo::default(),
            ..OutcomeInput::for_trajectory(t1(), OutcomeKind::Success, Utc::now())
        };
        assert_eq!(build_outcome(input).unwrap_err(), ValidationError::EmptyAttachment);
    }

    #[test]
    fn build_outcome_accepts_command_only_attachment() {
        let input = OutcomeInput {
            attaches_to: AttachesTo::command(CommandId::new("cmd-1").unwrap()),
            ..OutcomeInput::for_trajectory(t1(), OutcomeKind::Rollback, Utc::now())
        };
        let outcome = build_outcome(input).unwrap();
        assert_eq!(outcome.schema_version, SCHEMA_VERSION);
        assert!(outcome.attaches_to.trajectory_id.is_none());
    }

    #[test]
    fn build_outcome_validates_severity_and_metrics() {
        let now = Utc::now();
        let err = build_outcome(OutcomeInput::for_trajectory(t1(), OutcomeKind::Incident, now).severity(6))
            .unwrap_err();
        assert!(matches!(err, ValidationError::SeverityOutOfRange { value: 6 }));

        let err = build_outcome(
            OutcomeInput::for_trajectory(t1(), OutcomeKind::Incident, now).metric("latency", f64::NAN),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::NonFiniteMetric { .. }));

        let err = build_outcome(
            OutcomeInput::for_trajectory(t1(), OutcomeKind::Incident, now)
                .refs(Refs::new().with_entity(RefEntry::observed("svc:a").confidence(-1.0))),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::ConfidenceOutOfRange { .. }));
    }

    #[test]
    fn outcome_id_is_stable_for_identical_content() {
        let now = Utc::now();
        let a = build_outcome(OutcomeInput::for_trajectory(t1(), OutcomeKind::Success, now).severity(1)).unwrap();
        let b = build_outcome(OutcomeInput::for_trajectory(t1(), OutcomeKind::Success, now).severity(1)).unwrap();
        let c = build_outcome(OutcomeInput::for_trajectory(t1(), OutcomeKind::Success, now).severity(2)).unwrap();
        assert_eq!(a.outcome_id, b.outcome_id);
        assert_ne!(a.outcome_id, c.outcome_id);
    }
}
