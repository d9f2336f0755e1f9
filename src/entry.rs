//! Entries of the append-only log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::TrajectoryId;
use crate::outcome::Outcome;
use crate::step::Step;

/// One record of the append-only log: a step or an outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum LogEntry {
    Step(Step),
    Outcome(Outcome),
}

impl LogEntry {
    /// Event time carried by the entry.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Step(s) => s.timestamp,
            Self::Outcome(o) => o.timestamp,
        }
    }

    /// Trajectory the entry belongs to, if any.
    #[must_use]
    pub const fn trajectory_id(&self) -> Option<&TrajectoryId> {
        match self {
            Self::Step(s) => Some(&s.trajectory_id),
            Self::Outcome(o) => o.attaches_to.trajectory_id.as_ref(),
        }
    }

    #[must_use]
    pub const fn as_step(&self) -> Option<&Step> {
        match self {
            Self::Step(s) => Some(s),
            Self::Outcome(_) => None,
        }
    }

    #[must_use]
    pub const fn as_outcome(&self) -> Option<&Outcome> {
        match self {
            Self::Step(_) => None,
            Self::Outcome(o) => Some(o),
        }
    }
}

impl From<Step> for LogEntry {
    fn from(step: Step) -> Self {
        Self::Step(step)
    }
}

impl From<Outcome> for LogEntry {
    fn from(outcome: Outcome) -> Self {
        Self::Outcome(outcome)
    }
}
