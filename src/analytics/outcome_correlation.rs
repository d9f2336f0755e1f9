//! Outcome correlation table: empirical `P(outcome | entity)`.
//!
//! An outcome is credited to every entity it references directly and to every
//! entity referenced by the steps of the trajectory it attaches to. Steps and
//! outcomes of one trajectory may arrive in any order, so resolution happens
//! in `finalize`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::entry::LogEntry;
use crate::error::ProjectionError;
use crate::ids::{OutcomeId, TrajectoryId};
use crate::outcome::OutcomeKind;
use crate::projection::{Freshness, Projection};
use crate::step::StepType;

/// Outcome counters for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub counts: BTreeMap<OutcomeKind, u64>,
    pub total: u64,
    pub severity_sum: u64,
}

impl OutcomeCounts {
    fn record(&mut self, kind: OutcomeKind, severity: u8) {
        *self.counts.entry(kind).or_default() += 1;
        self.total += 1;
        self.severity_sum += u64::from(severity);
    }

    /// Empirical probability per outcome kind. Empty when nothing was counted.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn probabilities(&self) -> BTreeMap<OutcomeKind, f64> {
        if self.total == 0 {
            return BTreeMap::new();
        }
        self.counts
            .iter()
            .map(|(kind, n)| (*kind, *n as f64 / self.total as f64))
            .collect()
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_severity(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.severity_sum as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PendingOutcome {
    kind: OutcomeKind,
    severity: u8,
    entities: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct TrajectoryScratch {
    entities: BTreeSet<String>,
    step_types: BTreeSet<StepType>,
    outcomes: BTreeMap<OutcomeId, PendingOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Scratch {
    trajectories: BTreeMap<TrajectoryId, TrajectoryScratch>,
    /// Outcomes attached only to a command.
    detached: BTreeMap<OutcomeId, PendingOutcome>,
}

/// Finalized correlation tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationTables {
    /// `entity -> outcome counters`.
    pub entity_outcomes: BTreeMap<String, OutcomeCounts>,
    /// `step type present in the trajectory -> outcome counters`.
    pub pattern_outcomes: BTreeMap<StepType, OutcomeCounts>,
    pub outcomes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "data", rename_all = "snake_case")]
enum Mode {
    Accumulating(Scratch),
    Finalized(CorrelationTables),
}

/// Outcome correlation projection state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeCorrelationState {
    mode: Mode,
    #[serde(skip)]
    freshness: Freshness,
}

impl Default for OutcomeCorrelationState {
    fn default() -> Self {
        Self {
            mode: Mode::Accumulating(Scratch::default()),
            freshness: Freshness::default(),
        }
    }
}

impl OutcomeCorrelationState {
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        matches!(self.mode, Mode::Finalized(_))
    }

    pub fn tables(&self) -> Result<&CorrelationTables, ProjectionError> {
        match &self.mode {
            Mode::Finalized(tables) => Ok(tables),
            Mode::Accumulating(_) => Err(ProjectionError::NotFinalized {
                name: OutcomeCorrelationProjection::NAME.to_string(),
            }),
        }
    }

    pub fn entity(&self, entity: &str) -> Result<Option<&OutcomeCounts>, ProjectionError> {
        Ok(self.tables()?.entity_outcomes.get(entity))
    }

    pub fn pattern(&self, step_type: StepType) -> Result<Option<&OutcomeCounts>, ProjectionError> {
        Ok(self.tables()?.pattern_outcomes.get(&step_type))
    }
}

fn resolve(scratch: Scratch) -> CorrelationTables {
    let mut tables = CorrelationTables::default();
    let mut credit = |outcome: &PendingOutcome, entities: &BTreeSet<String>| {
        tables.outcomes += 1;
        for entity in entities.union(&outcome.entities) {
            tables
                .entity_outcomes
                .entry(entity.clone())
                .or_default()
                .record(outcome.kind, outcome.severity);
        }
    };
    let empty = BTreeSet::new();
    for outcome in scratch.detached.values() {
        credit(outcome, &empty);
    }
    for t in scratch.trajectories.values() {
        for outcome in t.outcomes.values() {
            credit(outcome, &t.entities);
        }
    }
    for t in scratch.trajectories.values() {
        for outcome in t.outcomes.values() {
            for step_type in &t.step_types {
                tables
                    .pattern_outcomes
                    .entry(*step_type)
                    .or_default()
                    .record(outcome.kind, outcome.severity);
            }
        }
    }
    tables
}

/// Outcome correlation projection.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutcomeCorrelationProjection;

impl Projection for OutcomeCorrelationProjection {
    const NAME: &'static str = "outcome_correlation";
    const VERSION: u32 = 1;
    type State = OutcomeCorrelationState;

    fn init(&self) -> OutcomeCorrelationState {
        OutcomeCorrelationState::default()
    }

    fn apply(&self, state: &mut OutcomeCorrelationState, entry: &LogEntry) -> Result<(), ProjectionError> {
        let Mode::Accumulating(scratch) = &mut state.mode else {
            return Err(ProjectionError::AlreadyFinalized {
                name: Self::NAME.to_string(),
            });
        };
        state.freshness.observe(entry);
        match entry {
            LogEntry::Step(step) => {
                let t = scratch.trajectories.entry(step.trajectory_id.clone()).or_default();
                t.step_types.insert(step.step_type);
                t.entities
                    .extend(step.refs.entity_ids().into_iter().map(str::to_string));
            }
            LogEntry::Outcome(outcome) => {
                let pending = PendingOutcome {
                    kind: outcome.kind,
                    severity: outcome.severity,
                    entities: outcome
                        .refs
                        .entity_ids()
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                };
                match &outcome.attaches_to.trajectory_id {
                    Some(id) => {
                        scratch
                            .trajectories
                            .entry(id.clone())
                            .or_default()
                            .outcomes
                            .insert(outcome.outcome_id, pending);
                    }
                    None => {
                        scratch.detached.insert(outcome.outcome_id, pending);
                    }
                }
            }
        }
        Ok(())
    }

    fn finalize(&self, state: &mut OutcomeCorrelationState) -> Result<(), ProjectionError> {
        if let Mode::Accumulating(scratch) = &mut state.mode {
            let scratch = std::mem::take(scratch);
            state.mode = Mode::Finalized(resolve(scratch));
        }
        Ok(())
    }

    fn freshness(&self, state: &OutcomeCorrelationState) -> Freshness {
        state.freshness.clone()
    }
}
