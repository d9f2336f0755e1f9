//! Step and outcome builders shared by analytics unit tests.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use crate::ids::TrajectoryId;
use crate::outcome::{build_outcome, Outcome, OutcomeInput, OutcomeKind};
use crate::refs::Refs;
use crate::step::{build_step, Producer, Step, StepInput, StepType};

pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn next(prev: &Step, step_type: StepType, payload: serde_json::Value, refs: Refs, secs: i64) -> Step {
    build_step(StepInput {
        trajectory_id: prev.trajectory_id.clone(),
        step_seq: prev.step_seq + 1,
        prev_step_hash: Some(prev.step_id.clone()),
        step_type,
        producer: Producer::Host,
        timestamp: at(secs),
        correlation_id: "test".to_string(),
        causation: None,
        payload,
        refs,
    })
    .unwrap()
}

pub(crate) fn started(trajectory: &str, secs: i64) -> Step {
    build_step(StepInput {
        trajectory_id: TrajectoryId::new(trajectory).unwrap(),
        step_seq: 0,
        prev_step_hash: None,
        step_type: StepType::TrajectoryStarted,
        producer: Producer::Host,
        timestamp: at(secs),
        correlation_id: "test".to_string(),
        causation: None,
        payload: json!({"trigger": "test"}),
        refs: Refs::new(),
    })
    .unwrap()
}

pub(crate) fn read_step(prev: &Step, entities: &[&str], secs: i64) -> Step {
    next(prev, StepType::EntityRead, json!({}), Refs::entities(entities.iter().copied()), secs)
}

pub(crate) fn tool_step(prev: &Step, tool: &str, entities: &[&str], secs: i64) -> Step {
    next(
        prev,
        StepType::ToolCalled,
        json!({"tool": tool}),
        Refs::entities(entities.iter().copied()),
        secs,
    )
}

pub(crate) fn ended(prev: &Step, secs: i64) -> Step {
    next(prev, StepType::TrajectoryEnded, json!({}), Refs::new(), secs)
}

pub(crate) fn outcome(trajectory: &str, kind: OutcomeKind, entities: &[&str], secs: i64) -> Outcome {
    build_outcome(
        OutcomeInput::for_trajectory(TrajectoryId::new(trajectory).unwrap(), kind, at(secs))
            .refs(Refs::entities(entities.iter().copied())),
    )
    .unwrap()
}
