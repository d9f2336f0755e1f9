//! Trajectory ledger: lifecycle commands over the registry folded from the log.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};

use crate::entry::LogEntry;
use crate::error::{PreconditionError, TrajResult, ValidationError};
use crate::ids::{OutcomeId, StepId, TrajectoryId};
use crate::outcome::{build_outcome, OutcomeInput};
use crate::refs::Refs;
use crate::step::{build_step, Causation, Producer, StepInput, StepType};

use super::{Aggregate, CommandEnvelope, Decision, Ledger};

/// Ledger over [`TrajectoryRegistry`].
pub type TrajectoryLedger = Ledger<TrajectoryRegistry>;

/// Folded state of one trajectory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrajectoryRecord {
    pub first_step_id: StepId,
    pub last_step_id: StepId,
    pub next_seq: u64,
    pub ended: bool,
    pub outcomes: usize,
}

/// Every trajectory seen in the log.
#[derive(Debug, Clone, Default)]
pub struct TrajectoryRegistry {
    trajectories: BTreeMap<TrajectoryId, TrajectoryRecord>,
    outcome_ids: BTreeSet<OutcomeId>,
}

impl TrajectoryRegistry {
    #[must_use]
    pub fn get(&self, trajectory_id: &TrajectoryId) -> Option<&TrajectoryRecord> {
        self.trajectories.get(trajectory_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    fn open(&self, trajectory_id: &TrajectoryId) -> TrajResult<&TrajectoryRecord> {
        let record = self
            .trajectories
            .get(trajectory_id)
            .ok_or_else(|| PreconditionError::TrajectoryNotFound {
                id: trajectory_id.clone(),
            })?;
        if record.ended {
            return Err(PreconditionError::TrajectoryEnded {
                id: trajectory_id.clone(),
            }
            .into());
        }
        Ok(record)
    }
}

/// Commands accepted by the trajectory ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum TrajectoryCommand {
    /// Opens a trajectory with its `trajectory_started` step.
    Start {
        trajectory_id: TrajectoryId,
        correlation_id: String,
        trigger: String,
        context: JsonValue,
        timestamp: DateTime<Utc>,
    },
    /// Appends an overlay step (hypothesis, rationale, annotation...).
    Annotate {
        trajectory_id: TrajectoryId,
        correlation_id: String,
        step_type: StepType,
        producer: Producer,
        payload: JsonValue,
        refs: Refs,
        timestamp: DateTime<Utc>,
    },
    /// Records an outcome.
    RecordOutcome(OutcomeInput),
    /// Closes a trajectory with its `trajectory_ended` step.
    End {
        trajectory_id: TrajectoryId,
        correlation_id: String,
        outcome_summary: JsonValue,
        timestamp: DateTime<Utc>,
    },
}

impl Aggregate for TrajectoryRegistry {
    type Command = TrajectoryCommand;

    fn command_name(command: &TrajectoryCommand) -> &'static str {
        match command {
            TrajectoryCommand::Start { .. } => "trajectory.start",
            TrajectoryCommand::Annotate { .. } => "trajectory.annotate",
            TrajectoryCommand::RecordOutcome(_) => "trajectory.record_outcome",
            TrajectoryCommand::End { .. } => "trajectory.end",
        }
    }

    fn apply(&mut self, entry: &LogEntry) {
        match entry {
            LogEntry::Step(step) => {
                let ended = step.step_type == StepType::TrajectoryEnded;
                let next_seq = step.step_seq.saturating_add(1);
                self.trajectories
                    .entry(step.trajectory_id.clone())
                    .and_modify(|r| {
                        r.last_step_id = step.step_id.clone();
                        r.next_seq = next_seq;
                        r.ended |= ended;
                    })
                    .or_insert_with(|| TrajectoryRecord {
                        first_step_id: step.step_id.clone(),
                        last_step_id: step.step_id.clone(),
                        next_seq,
                        ended,
                        outcomes: 0,
                    });
            }
            LogEntry::Outcome(outcome) => {
                self.outcome_ids.insert(outcome.outcome_id);
                if let Some(record) = outcome
                    .attaches_to
                    .trajectory_id
                    .as_ref()
                    .and_then(|id| self.trajectories.get_mut(id))
                {
                    record.outcomes += 1;
                }
            }
        }
    }

    fn handle(&self, envelope: &CommandEnvelope<TrajectoryCommand>) -> TrajResult<Decision> {
        let causation = Causation {
            command_id: Some(envelope.command_id()?),
            event_id: None,
        };
        match &envelope.command {
            TrajectoryCommand::Start {
                trajectory_id,
                correlation_id,
                trigger,
                context,
                timestamp,
            } => {
                let step = build_step(StepInput {
                    trajectory_id: trajectory_id.clone(),
                    step_seq: 0,
                    prev_step_hash: None,
                    step_type: StepType::TrajectoryStarted,
                    producer: Producer::Host,
                    timestamp: *timestamp,
                    correlation_id: correlation_id.clone(),
                    causation: Some(causation),
                    payload: json!({ "trigger": trigger, "context": context }),
                    refs: Refs::new(),
                })?;
                match self.trajectories.get(trajectory_id) {
                    None => Ok(Decision::Emit(vec![step.into()])),
                    Some(record) if record.first_step_id == step.step_id => Ok(Decision::AlreadyProcessed),
                    Some(_) => Err(PreconditionError::TrajectoryAlreadyExists {
                        id: trajectory_id.clone(),
                    }
                    .into()),
                }
            }
            TrajectoryCommand::Annotate {
                trajectory_id,
                correlation_id,
                step_type,
                producer,
                payload,
                refs,
                timestamp,
            } => {
                if !step_type.is_overlay() {
                    return Err(ValidationError::InvalidPayload {
                        step_type: *step_type,
                        reason: "annotations must use an overlay step type".to_string(),
                    }
                    .into());
                }
                let record = self.open(trajectory_id)?;
                let step = build_step(StepInput {
                    trajectory_id: trajectory_id.clone(),
                    step_seq: record.next_seq,
                    prev_step_hash: Some(record.last_step_id.clone()),
                    step_type: *step_type,
                    producer: *producer,
                    timestamp: *timestamp,
                    correlation_id: correlation_id.clone(),
                    causation: Some(causation),
                    payload: payload.clone(),
                    refs: refs.clone(),
                })?;
                Ok(Decision::Emit(vec![step.into()]))
            }
            TrajectoryCommand::RecordOutcome(input) => {
                let outcome = build_outcome(input.clone())?;
                if let Some(id) = &outcome.attaches_to.trajectory_id {
                    if !self.trajectories.contains_key(id) {
                        return Err(PreconditionError::TrajectoryNotFound { id: id.clone() }.into());
                    }
                }
                if self.outcome_ids.contains(&outcome.outcome_id) {
                    return Ok(Decision::AlreadyProcessed);
                }
                Ok(Decision::Emit(vec![outcome.into()]))
            }
            TrajectoryCommand::End {
                trajectory_id,
                correlation_id,
                outcome_summary,
                timestamp,
            } => {
                let record = self.trajectories.get(trajectory_id).ok_or_else(|| {
                    PreconditionError::TrajectoryNotFound {
                        id: trajectory_id.clone(),
                    }
                })?;
                if record.ended {
                    return Ok(Decision::AlreadyProcessed);
                }
                let step = build_step(StepInput {
                    trajectory_id: trajectory_id.clone(),
                    step_seq: record.next_seq,
                    prev_step_hash: Some(record.last_step_id.clone()),
                    step_type: StepType::TrajectoryEnded,
                    producer: Producer::Host,
                    timestamp: *timestamp,
                    correlation_id: correlation_id.clone(),
                    causation: Some(causation),
                    payload: json!({ "outcome_summary": outcome_summary }),
                    refs: Refs::new(),
                })?;
                Ok(Decision::Emit(vec![step.into()]))
            }
        }
    }
}
