//! Step-type n-gram transition model.
//!
//! N-grams need each trajectory's complete ordered step sequence, but the log
//! interleaves trajectories. The fold therefore runs in two modes: while
//! accumulating it keeps per-trajectory scratch; `finalize` turns the scratch
//! into global bigram/trigram tables and discards it. Queries are only
//! answered once finalized.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::entry::LogEntry;
use crate::error::ProjectionError;
use crate::ids::TrajectoryId;
use crate::outcome::OutcomeKind;
use crate::projection::{Freshness, Projection};
use crate::refs::entity_type_of;
use crate::step::StepType;

/// Separator between step types in an n-gram key.
pub const NGRAM_SEPARATOR: &str = ">";

/// N-gram sizes extracted from each trajectory.
pub const NGRAM_SIZES: [usize; 2] = [2, 3];

/// Key of an n-gram, e.g. `entity_read>tool_called`.
#[must_use]
pub fn ngram_key(steps: &[StepType]) -> String {
    steps
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(NGRAM_SEPARATOR)
}

/// Every bigram and trigram key of a step sequence, in order.
#[must_use]
pub fn ngrams_of(steps: &[StepType]) -> Vec<String> {
    let mut out = Vec::new();
    for n in NGRAM_SIZES {
        if steps.len() >= n {
            out.extend(steps.windows(n).map(ngram_key));
        }
    }
    out
}

/// Per-trajectory scratch kept while accumulating.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryScratch {
    /// `step_seq -> step_type`.
    pub steps: BTreeMap<u64, StepType>,
    pub entity_types: BTreeSet<String>,
    pub outcomes: BTreeMap<OutcomeKind, u64>,
}

/// Global tables produced by `finalize`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionTables {
    /// `ngram -> occurrences`.
    pub ngram_counts: BTreeMap<String, u64>,
    /// `ngram -> outcome kind -> count`.
    pub ngram_outcomes: BTreeMap<String, BTreeMap<OutcomeKind, u64>>,
    /// `entity type -> ngram -> count`.
    pub entity_type_ngrams: BTreeMap<String, BTreeMap<String, u64>>,
    /// Trajectories that contributed.
    pub trajectories: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "data", rename_all = "snake_case")]
enum Mode {
    Accumulating(BTreeMap<TrajectoryId, TrajectoryScratch>),
    Finalized(TransitionTables),
}

/// Transition projection state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionState {
    mode: Mode,
    #[serde(skip)]
    freshness: Freshness,
}

impl Default for TransitionState {
    fn default() -> Self {
        Self {
            mode: Mode::Accumulating(BTreeMap::new()),
            freshness: Freshness::default(),
        }
    }
}

fn not_finalized() -> ProjectionError {
    ProjectionError::NotFinalized {
        name: TransitionProjection::NAME.to_string(),
    }
}

impl TransitionState {
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        matches!(self.mode, Mode::Finalized(_))
    }

    /// Finalized tables.
    pub fn tables(&self) -> Result<&TransitionTables, ProjectionError> {
        match &self.mode {
            Mode::Finalized(tables) => Ok(tables),
            Mode::Accumulating(_) => Err(not_finalized()),
        }
    }

    /// Occurrences of an n-gram.
    pub fn ngram_count(&self, ngram: &str) -> Result<u64, ProjectionError> {
        Ok(self.tables()?.ngram_counts.get(ngram).copied().unwrap_or(0))
    }

    /// Outcome kinds observed after trajectories containing `ngram`.
    pub fn outcome_counts(&self, ngram: &str) -> Result<Option<&BTreeMap<OutcomeKind, u64>>, ProjectionError> {
        Ok(self.tables()?.ngram_outcomes.get(ngram))
    }

    /// N-gram counts for trajectories that referenced an entity of `entity_type`.
    pub fn entity_type_counts(&self, entity_type: &str) -> Result<Option<&BTreeMap<String, u64>>, ProjectionError> {
        Ok(self.tables()?.entity_type_ngrams.get(entity_type))
    }

    /// Turns scratch into global tables. Idempotent.
    pub fn finalize(&mut self) {
        let Mode::Accumulating(scratch) = &mut self.mode else {
            return;
        };
        let scratch = std::mem::take(scratch);
        let mut tables = TransitionTables::default();
        for trajectory in scratch.into_values() {
            tables.trajectories += 1;
            let sequence: Vec<StepType> = trajectory.steps.into_values().collect();
            for gram in ngrams_of(&sequence) {
                *tables.ngram_counts.entry(gram.clone()).or_default() += 1;
                if !trajectory.outcomes.is_empty() {
                    let by_kind = tables.ngram_outcomes.entry(gram.clone()).or_default();
                    for (kind, n) in &trajectory.outcomes {
                        *by_kind.entry(*kind).or_default() += n;
                    }
                }
                for entity_type in &trajectory.entity_types {
                    *tables
                        .entity_type_ngrams
                        .entry(entity_type.clone())
                        .or_default()
                        .entry(gram.clone())
                        .or_default() += 1;
                }
            }
        }
        self.mode = Mode::Finalized(tables);
    }
}

/// Transition projection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionProjection;

impl Projection for TransitionProjection {
    const NAME: &'static str = "transitions";
    const VERSION: u32 = 1;
    type State = TransitionState;

    fn init(&self) -> TransitionState {
        TransitionState::default()
    }

    fn apply(&self, state: &mut TransitionState, entry: &LogEntry) -> Result<(), ProjectionError> {
        let Mode::Accumulating(scratch) = &mut state.mode else {
            return Err(ProjectionError::AlreadyFinalized {
                name: Self::NAME.to_string(),
            });
        };
        state.freshness.observe(entry);
        match entry {
            LogEntry::Step(step) => {
                let s = scratch.entry(step.trajectory_id.clone()).or_default();
                s.steps.insert(step.step_seq, step.step_type);
                for id in step.refs.entity_ids() {
                    s.entity_types.insert(entity_type_of(id).to_string());
                }
            }
            LogEntry::Outcome(outcome) => {
                if let Some(id) = &outcome.attaches_to.trajectory_id {
                    *scratch
                        .entry(id.clone())
                        .or_default()
                        .outcomes
                        .entry(outcome.kind)
                        .or_default() += 1;
                }
            }
        }
        Ok(())
    }

    fn finalize(&self, state: &mut TransitionState) -> Result<(), ProjectionError> {
        state.finalize();
        Ok(())
    }

    fn freshness(&self, state: &TransitionState) -> Freshness {
        state.freshness.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::testing::{ended, outcome, read_step, started, tool_step};

    #[test]
    fn ngram_extraction() {
        use StepType::{EntityRead, ToolCalled, TrajectoryStarted};
        let grams = ngrams_of(&[TrajectoryStarted, EntityRead, ToolCalled]);
        assert_eq!(
            grams,
            vec![
                "trajectory_started>entity_read",
                "entity_read>tool_called",
                "trajectory_started>entity_read>tool_called",
            ]
        );
        assert!(ngrams_of(&[EntityRead]).is_empty());
    }

    #[test]
    fn queries_require_finalize_and_apply_rejects_after() {
        let p = TransitionProjection;
        let mut state = p.init();
        let s0 = started("t1", 0);
        p.apply(&mut state, &s0.clone().into()).unwrap();
        assert!(matches!(state.ngram_count("x"), Err(ProjectionError::NotFinalized { .. })));

        p.finalize(&mut state).unwrap();
        p.finalize(&mut state).unwrap();
        assert!(state.is_finalized());
        assert_eq!(state.ngram_count("x").unwrap(), 0);
        assert!(matches!(
            p.apply(&mut state, &s0.into()),
            Err(ProjectionError::AlreadyFinalized { .. })
        ));
    }

    #[test]
    fn interleaved_trajectories_and_outcomes() {
        let a0 = started("a", 0);
        let b0 = started("b", 1);
        let a1 = read_step(&a0, &["file:x"], 2);
        let b1 = tool_step(&b0, "grep", &["db:y"], 3);
        let a2 = ended(&a1, 4);
        let entries: Vec<LogEntry> = vec![
            a0.into(),
            b0.into(),
            outcome("a", OutcomeKind::Failure, &[], 9).into(),
            a1.into(),
            b1.into(),
            a2.into(),
        ];

        let p = TransitionProjection;
        let mut state = p.init();
        for e in &entries {
            p.apply(&mut state, e).unwrap();
        }
        p.finalize(&mut state).unwrap();

        let bigram = "trajectory_started>entity_read";
        assert_eq!(state.ngram_count(bigram).unwrap(), 1);
        assert_eq!(state.ngram_count("trajectory_started>tool_called").unwrap(), 1);
        assert_eq!(
            state.ngram_count("trajectory_started>entity_read>trajectory_ended").unwrap(),
            1
        );
        let outcomes = state.outcome_counts(bigram).unwrap().unwrap();
        assert_eq!(outcomes.get(&OutcomeKind::Failure), Some(&1));
        assert!(state.outcome_counts("trajectory_started>tool_called").unwrap().is_none());

        let file = state.entity_type_counts("file").unwrap().unwrap();
        assert_eq!(file.get(bigram), Some(&1));
        assert!(!file.contains_key("trajectory_started>tool_called"));
        assert_eq!(state.tables().unwrap().trajectories, 2);
    }
}
