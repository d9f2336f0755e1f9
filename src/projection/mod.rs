//! Projection rebuild engine.
//!
//! A projection is a pure fold over the log. Rebuilding streams every entry
//! through [`Projection::apply`], runs [`Projection::finalize`] once, and
//! hashes `{name, version, state, freshness}` canonically. For a fixed log the
//! hash is identical on every rebuild, regardless of how entries of different
//! trajectories are interleaved.
//!
//! # Determinism rules for implementors
//! - Use ordered maps (`BTreeMap`/`BTreeSet`) in state.
//! - Never read the wall clock inside `apply`/`finalize`; use entry timestamps.
//! - Keep order-dependent bookkeeping out of the serialized state.

mod engine;
mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::LogEntry;
use crate::error::ProjectionError;
use crate::hash::canonical_hash;
use crate::ids::{OutcomeId, StepId, TrajectoryId};

pub use engine::rebuild_one;
pub use registry::{ProjectionRegistry, RebuildSet, RebuiltEntry};

const PROJECTION_HASH_DOMAIN: &str = "trajlog.projection.v1";

/// A deterministic fold over the log.
pub trait Projection: Send + Sync {
    /// Stable projection name.
    const NAME: &'static str;
    /// Bumped whenever the state layout or fold semantics change.
    const VERSION: u32;

    type State: Serialize + Send + 'static;

    /// Empty state.
    fn init(&self) -> Self::State;

    /// Folds one entry.
    fn apply(&self, state: &mut Self::State, entry: &LogEntry) -> Result<(), ProjectionError>;

    /// Runs once after the stream ends.
    fn finalize(&self, _state: &mut Self::State) -> Result<(), ProjectionError> {
        Ok(())
    }

    /// Freshness marker of a state.
    fn freshness(&self, state: &Self::State) -> Freshness;
}

/// How far into the log a state has been folded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Freshness {
    pub last_trajectory_id: Option<TrajectoryId>,
    pub last_step_id: Option<StepId>,
    pub last_outcome_id: Option<OutcomeId>,
    pub steps_seen: u64,
    pub outcomes_seen: u64,
    pub latest_timestamp: Option<DateTime<Utc>>,
    pub rebuilt_at: Option<DateTime<Utc>>,
}

impl Freshness {
    /// Records one folded entry.
    pub fn observe(&mut self, entry: &LogEntry) {
        match entry {
            LogEntry::Step(step) => {
                self.steps_seen += 1;
                self.last_step_id = Some(step.step_id.clone());
                self.last_trajectory_id = Some(step.trajectory_id.clone());
            }
            LogEntry::Outcome(outcome) => {
                self.outcomes_seen += 1;
                self.last_outcome_id = Some(outcome.outcome_id);
                if let Some(id) = &outcome.attaches_to.trajectory_id {
                    self.last_trajectory_id = Some(id.clone());
                }
            }
        }
        let ts = entry.timestamp();
        if self.latest_timestamp.map_or(true, |latest| ts > latest) {
            self.latest_timestamp = Some(ts);
        }
    }

    /// The part of the marker covered by the canonical hash.
    ///
    /// `last_*` ids depend on the physical interleaving of trajectories and
    /// `rebuilt_at` on the wall clock, so both are left out.
    #[must_use]
    pub const fn digest(&self) -> FreshnessDigest {
        FreshnessDigest {
            steps_seen: self.steps_seen,
            outcomes_seen: self.outcomes_seen,
            latest_timestamp: self.latest_timestamp,
        }
    }
}

/// Hashed subset of [`Freshness`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessDigest {
    pub steps_seen: u64,
    pub outcomes_seen: u64,
    pub latest_timestamp: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct HashInput<'a, S: Serialize> {
    name: &'a str,
    version: u32,
    state: &'a S,
    freshness: FreshnessDigest,
}

/// Canonical content hash of a projection state, as lowercase hex.
pub fn projection_hash<S: Serialize>(
    name: &str,
    version: u32,
    state: &S,
    freshness: &Freshness,
) -> Result<String, ProjectionError> {
    let input = HashInput {
        name,
        version,
        state,
        freshness: freshness.digest(),
    };
    canonical_hash(PROJECTION_HASH_DOMAIN, &input)
        .map(|h| h.to_hex().to_string())
        .map_err(|e| ProjectionError::Serialization {
            name: name.to_string(),
            message: e.to_string(),
        })
}

/// A rebuilt projection state with its canonical hash.
#[derive(Debug, Clone)]
pub struct Rebuilt<S> {
    pub name: &'static str,
    pub version: u32,
    pub state: S,
    pub freshness: Freshness,
    pub hash: String,
    /// Number of log entries folded.
    pub entries: u64,
}

impl<S: Serialize> Rebuilt<S> {
    /// Recomputes the hash after an explicit maintenance operation (such as
    /// pruning) changed the state.
    pub fn rehash(&mut self) -> Result<&str, ProjectionError> {
        self.hash = projection_hash(self.name, self.version, &self.state, &self.freshness)?;
        Ok(&self.hash)
    }
}
