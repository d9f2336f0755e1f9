//! Step envelope and hash chain.
//!
//! A step's id is a blake3 digest over
//! `(trajectory_id, step_seq, prev_step_hash, step_type, payload)`. Because
//! every step hashes its predecessor's id, changing any upstream step changes
//! every downstream id that chains through it.
//!
//! Base step types record ground-truth actions and may only be produced by the
//! host. Overlay step types (hypotheses, rationale, summaries) may never be
//! produced by the host.

use std::fmt;

use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{ExecutionError, ValidationError};
use crate::ids::{CommandId, StepId, TrajectoryId};
use crate::refs::{validate_refs, Refs};

/// Schema version stamped on every step and outcome.
pub const SCHEMA_VERSION: u32 = 1;

/// Maximum serialized payload size in bytes.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

const STEP_ID_DOMAIN: &[u8] = b"trajlog.step.v1";

/// Step taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    // Base types (host only).
    TrajectoryStarted,
    EntityRead,
    EntityWritten,
    ToolCalled,
    PolicyGateHit,
    ExternalEgressAttempted,
    TrajectoryEnded,

    // Overlay types (never host).
    Hypothesis,
    DecisionRationale,
    Annotation,
    Summary,
}

impl StepType {
    /// All step types, base first.
    pub const ALL: [Self; 11] = [
        Self::TrajectoryStarted,
        Self::EntityRead,
        Self::EntityWritten,
        Self::ToolCalled,
        Self::PolicyGateHit,
        Self::ExternalEgressAttempted,
        Self::TrajectoryEnded,
        Self::Hypothesis,
        Self::DecisionRationale,
        Self::Annotation,
        Self::Summary,
    ];

    /// Returns true for host-only ground-truth step types.
    #[must_use]
    pub const fn is_base(self) -> bool {
        matches!(
            self,
            Self::TrajectoryStarted
                | Self::EntityRead
                | Self::EntityWritten
                | Self::ToolCalled
                | Self::PolicyGateHit
                | Self::ExternalEgressAttempted
                | Self::TrajectoryEnded
        )
    }

    /// Returns true for overlay step types.
    #[must_use]
    pub const fn is_overlay(self) -> bool {
        !self.is_base()
    }

    /// Returns true for the two trajectory-boundary types.
    #[must_use]
    pub const fn is_boundary(self) -> bool {
        matches!(self, Self::TrajectoryStarted | Self::TrajectoryEnded)
    }

    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TrajectoryStarted => "trajectory_started",
            Self::EntityRead => "entity_read",
            Self::EntityWritten => "entity_written",
            Self::ToolCalled => "tool_called",
            Self::PolicyGateHit => "policy_gate_hit",
            Self::ExternalEgressAttempted => "external_egress_attempted",
            Self::TrajectoryEnded => "trajectory_ended",
            Self::Hypothesis => "hypothesis",
            Self::DecisionRationale => "decision_rationale",
            Self::Annotation => "annotation",
            Self::Summary => "summary",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who emitted a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Producer {
    /// The host runtime itself.
    Host,
    /// A plugin pack running inside the host.
    Pack,
    /// Derived by an offline process from other steps.
    Derived,
    /// A human operator.
    Human,
}

impl Producer {
    /// Returns true if this producer may emit the given step type.
    #[must_use]
    pub const fn may_emit(self, step_type: StepType) -> bool {
        match self {
            Self::Host => step_type.is_base(),
            Self::Pack | Self::Derived | Self::Human => step_type.is_overlay(),
        }
    }
}

impl fmt::Display for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Host => "host",
            Self::Pack => "pack",
            Self::Derived => "derived",
            Self::Human => "human",
        };
        f.write_str(s)
    }
}

/// What triggered a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Causation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// An immutable, hash-chained step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: StepId,
    pub schema_version: u32,
    pub trajectory_id: TrajectoryId,
    pub step_seq: u64,
    pub prev_step_hash: Option<StepId>,
    pub step_type: StepType,
    pub producer: Producer,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation: Option<Causation>,
    pub payload: JsonValue,
    #[serde(default)]
    pub refs: Refs,
}

impl Step {
    /// Tool name for `tool_called` steps.
    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        if self.step_type != StepType::ToolCalled {
            return None;
        }
        self.payload.get("tool").and_then(JsonValue::as_str)
    }

    /// Recomputes this step's id from its content.
    #[must_use]
    pub fn recompute_id(&self) -> StepId {
        compute_step_id(&StepIdInput {
            trajectory_id: &self.trajectory_id,
            step_seq: self.step_seq,
            prev_step_hash: self.prev_step_hash.as_ref(),
            step_type: self.step_type,
            payload: &self.payload,
        })
    }
}

/// The content a step id is computed over.
#[derive(Debug, Clone, Copy)]
pub struct StepIdInput<'a> {
    pub trajectory_id: &'a TrajectoryId,
    pub step_seq: u64,
    pub prev_step_hash: Option<&'a StepId>,
    pub step_type: StepType,
    pub payload: &'a JsonValue,
}

fn update_framed(h: &mut Hasher, bytes: &[u8]) {
    h.update(&(bytes.len() as u64).to_le_bytes());
    h.update(bytes);
}

/// Computes a step's content-addressed id.
///
/// Pure and deterministic: identical input always yields the identical id.
/// Fields are length-framed so adjacent fields cannot be confused.
#[must_use]
pub fn compute_step_id(input: &StepIdInput<'_>) -> StepId {
    let mut h = Hasher::new();
    h.update(STEP_ID_DOMAIN);
    update_framed(&mut h, input.trajectory_id.as_str().as_bytes());
    h.update(&input.step_seq.to_le_bytes());
    match input.prev_step_hash {
        Some(prev) => {
            h.update(&[1u8]);
            update_framed(&mut h, prev.as_str().as_bytes());
        }
        None => {
            h.update(&[0u8]);
        }
    }
    update_framed(&mut h, input.step_type.as_str().as_bytes());
    // `serde_json::Value` objects are key-sorted, so Display is canonical.
    update_framed(&mut h, input.payload.to_string().as_bytes());
    StepId::from_hash(&h.finalize())
}

/// Everything needed to build a step.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub trajectory_id: TrajectoryId,
    pub step_seq: u64,
    pub prev_step_hash: Option<StepId>,
    pub step_type: StepType,
    pub producer: Producer,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub causation: Option<Causation>,
    pub payload: JsonValue,
    pub refs: Refs,
}

fn require_str_field(step_type: StepType, payload: &JsonValue, field: &str) -> Result<(), ValidationError> {
    match payload.get(field).and_then(JsonValue::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(ValidationError::InvalidPayload {
            step_type,
            reason: format!("'{field}' must be a non-empty string"),
        }),
    }
}

fn validate_payload(step_type: StepType, payload: &JsonValue, refs: &Refs) -> Result<(), ValidationError> {
    if !payload.is_object() {
        return Err(ValidationError::InvalidPayload {
            step_type,
            reason: "payload must be a JSON object".to_string(),
        });
    }
    if payload.to_string().len() > MAX_PAYLOAD_BYTES {
        return Err(ValidationError::FieldTooLong {
            field: "payload".to_string(),
            max_length: MAX_PAYLOAD_BYTES,
        });
    }

    match step_type {
        StepType::TrajectoryStarted => require_str_field(step_type, payload, "trigger"),
        StepType::ToolCalled => require_str_field(step_type, payload, "tool"),
        StepType::PolicyGateHit => require_str_field(step_type, payload, "gate"),
        StepType::ExternalEgressAttempted => require_str_field(step_type, payload, "destination"),
        StepType::EntityRead | StepType::EntityWritten => {
            if refs.entities.is_empty() {
                return Err(ValidationError::InvalidPayload {
                    step_type,
                    reason: "at least one entity ref is required".to_string(),
                });
            }
            Ok(())
        }
        StepType::TrajectoryEnded
        | StepType::Hypothesis
        | StepType::DecisionRationale
        | StepType::Annotation
        | StepType::Summary => Ok(()),
    }
}

/// Builds a validated step with a computed id.
///
/// # Errors
///
/// - `MissingField` for an empty correlation id
/// - `InvalidChainPosition` if `step_seq == 0` disagrees with `prev_step_hash`
/// - `ProducerNotAllowed` for base/overlay producer violations
/// - `ConfidenceOutOfRange` for invalid refs
/// - `InvalidPayload` for type-specific payload violations
pub fn build_step(input: StepInput) -> Result<Step, ValidationError> {
    if input.correlation_id.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: "correlation_id".to_string(),
        });
    }
    match (input.step_seq, &input.prev_step_hash) {
        (0, Some(_)) => {
            return Err(ValidationError::InvalidChainPosition {
                reason: "step_seq 0 must not have a prev_step_hash".to_string(),
            })
        }
        (seq, None) if seq > 0 => {
            return Err(ValidationError::InvalidChainPosition {
                reason: format!("step_seq {seq} requires a prev_step_hash"),
            })
        }
        _ => {}
    }
    if !input.producer.may_emit(input.step_type) {
        return Err(ValidationError::ProducerNotAllowed {
            step_type: input.step_type,
            producer: input.producer,
        });
    }
    validate_refs(&input.refs)?;
    validate_payload(input.step_type, &input.payload, &input.refs)?;

    let step_id = compute_step_id(&StepIdInput {
        trajectory_id: &input.trajectory_id,
        step_seq: input.step_seq,
        prev_step_hash: input.prev_step_hash.as_ref(),
        step_type: input.step_type,
        payload: &input.payload,
    });

    Ok(Step {
        step_id,
        schema_version: SCHEMA_VERSION,
        trajectory_id: input.trajectory_id,
        step_seq: input.step_seq,
        prev_step_hash: input.prev_step_hash,
        step_type: input.step_type,
        producer: input.producer,
        timestamp: input.timestamp,
        correlation_id: input.correlation_id,
        causation: input.causation,
        payload: input.payload,
        refs: input.refs,
    })
}

/// Verifies one trajectory's chain, ordered by `step_seq`.
///
/// Returns the first position whose id, sequence or linkage does not match.
pub fn verify_chain(steps: &[Step]) -> Result<(), ExecutionError> {
    let mut prev: Option<&StepId> = None;
    for (expected_seq, step) in (0u64..).zip(steps.iter()) {
        let broken = |reason: String| ExecutionError::ChainBroken {
            trajectory_id: step.trajectory_id.clone(),
            step_seq: step.step_seq,
            step_id: Some(step.step_id.clone()),
            reason,
        };
        if step.step_seq != expected_seq {
            return Err(broken(format!("expected step_seq {expected_seq}")));
        }
        if step.prev_step_hash.as_ref() != prev {
            return Err(broken("prev_step_hash does not match predecessor".to_string()));
        }
        if step.recompute_id() != step.step_id {
            return Err(broken("step_id does not match content".to_string()));
        }
        prev = Some(&step.step_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::RefEntry;
    use serde_json::json;

    fn tid() -> TrajectoryId {
        TrajectoryId::new("t1").unwrap()
    }

    fn input(seq: u64, prev: Option<StepId>, step_type: StepType, producer: Producer) -> StepInput {
        StepInput {
            trajectory_id: tid(),
            step_seq: seq,
            prev_step_hash: prev,
            step_type,
            producer,
            timestamp: Utc::now(),
            correlation_id: "corr-1".to_string(),
            causation: None,
            payload: json!({"tool": "grep", "trigger": "manual"}),
            refs: Refs::entities(["file:a"]),
        }
    }

    #[test]
    fn compute_step_id_is_deterministic() {
        let t = tid();
        let payload = json!({"b": 2, "a": 1});
        let a = compute_step_id(&StepIdInput {
            trajectory_id: &t,
            step_seq: 3,
            prev_step_hash: None,
            step_type: StepType::ToolCalled,
            payload: &payload,
        });
        let b = compute_step_id(&StepIdInput {
            trajectory_id: &t,
            step_seq: 3,
            prev_step_hash: None,
            step_type: StepType::ToolCalled,
            payload: &json!({"a": 1, "b": 2}),
        });
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn changing_prev_hash_changes_id() {
        let first = build_step(input(0, None, StepType::TrajectoryStarted, Producer::Host)).unwrap();
        let other = build_step(StepInput {
            payload: json!({"trigger": "cron"}),
            ..input(0, None, StepType::TrajectoryStarted, Producer::Host)
        })
        .unwrap();
        let a = build_step(input(1, Some(first.step_id.clone()), StepType::ToolCalled, Producer::Host)).unwrap();
        let b = build_step(input(1, Some(other.step_id.clone()), StepType::ToolCalled, Producer::Host)).unwrap();
        assert_ne!(a.step_id, b.step_id);
    }

    #[test]
    fn base_step_requires_host() {
        for producer in [Producer::Pack, Producer::Derived, Producer::Human] {
            let err = build_step(input(0, None, StepType::EntityWritten, producer)).unwrap_err();
            assert!(matches!(err, ValidationError::ProducerNotAllowed { .. }));
        }
        assert!(build_step(input(0, None, StepType::EntityWritten, Producer::Host)).is_ok());
    }

    #[test]
    fn overlay_step_rejects_host() {
        for step_type in [StepType::Hypothesis, StepType::DecisionRationale] {
            let err = build_step(input(0, None, step_type, Producer::Host)).unwrap_err();
            assert!(matches!(err, ValidationError::ProducerNotAllowed { .. }));
            assert!(build_step(input(0, None, step_type, Producer::Human)).is_ok());
        }
    }

    #[test]
    fn build_step_stamps_schema_and_id() {
        let step = build_step(input(0, None, StepType::TrajectoryStarted, Producer::Host)).unwrap();
        assert_eq!(step.schema_version, SCHEMA_VERSION);
        assert_eq!(step.step_id, step.recompute_id());
    }

    #[test]
    fn build_step_validates_chain_position() {
        let err = build_step(input(2, None, StepType::ToolCalled, Producer::Host)).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidChainPosition { .. }));
        let prev = build_step(input(0, None, StepType::TrajectoryStarted, Producer::Host)).unwrap();
        let err = build_step(input(0, Some(prev.step_id), StepType::ToolCalled, Producer::Host)).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidChainPosition { .. }));
    }

    #[test]
    fn build_step_validates_payload_and_refs() {
        let err = build_step(StepInput {
            payload: json!({}),
            ..input(0, None, StepType::ToolCalled, Producer::Host)
        })
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidPayload { .. }));

        let err = build_step(StepInput {
            refs: Refs::new(),
            ..input(0, None, StepType::EntityWritten, Producer::Host)
        })
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidPayload { .. }));

        let err = build_step(StepInput {
            refs: Refs::new().with_entity(RefEntry::observed("file:a").confidence(2.0)),
            ..input(0, None, StepType::EntityRead, Producer::Host)
        })
        .unwrap_err();
        assert!(matches!(err, ValidationError::ConfidenceOutOfRange { .. }));

        let err = build_step(StepInput {
            payload: json!("scalar"),
            ..input(0, None, StepType::Annotation, Producer::Human)
        })
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidPayload { .. }));
    }

    #[test]
    fn verify_chain_detects_tampering() {
        let s0 = build_step(input(0, None, StepType::TrajectoryStarted, Producer::Host)).unwrap();
        let s1 = build_step(input(1, Some(s0.step_id.clone()), StepType::ToolCalled, Producer::Host)).unwrap();
        let s2 = build_step(input(2, Some(s1.step_id.clone()), StepType::EntityRead, Producer::Host)).unwrap();
        let mut chain = vec![s0, s1, s2];
        assert!(verify_chain(&chain).is_ok());

        chain[1].payload = json!({"tool": "rm"});
        let err = verify_chain(&chain).unwrap_err();
        assert!(matches!(err, ExecutionError::ChainBroken { step_seq: 1, .. }));
    }

    #[test]
    fn producer_matrix() {
        for t in StepType::ALL {
            assert_eq!(Producer::Host.may_emit(t), t.is_base());
            assert_eq!(Producer::Human.may_emit(t), t.is_overlay());
        }
    }

    #[test]
    fn tool_name_only_for_tool_calls() {
        let step = build_step(input(0, None, StepType::ToolCalled, Producer::Host)).unwrap();
        assert_eq!(step.tool_name(), Some("grep"));
        let step = build_step(input(0, None, StepType::TrajectoryStarted, Producer::Host)).unwrap();
        assert_eq!(step.tool_name(), None);
    }
}
