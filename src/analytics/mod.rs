//! Derived analytics projections.
//!
//! Four independent folds over the step/outcome stream:
//! - [`cooccurrence`]: weighted entity co-occurrence graph
//! - [`transitions`]: step-type n-grams conditioned on outcomes and entity types
//! - [`signatures`]: structural entity signatures by label refinement
//! - [`outcome_correlation`]: empirical outcome distribution per entity

pub mod cooccurrence;
pub mod outcome_correlation;
mod recent;
pub mod signatures;
pub mod transitions;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::TrajlogConfig;
use crate::error::{ProjectionError, TrajResult};
use crate::projection::{ProjectionRegistry, RebuildSet};
use crate::storage::StepLog;

pub use cooccurrence::{
    prune_before, prune_cooccurrence, CooccurrenceProjection, CooccurrenceState, EdgeRecord, PruneStats,
};
pub use outcome_correlation::{
    CorrelationTables, OutcomeCorrelationProjection, OutcomeCorrelationState, OutcomeCounts,
};
pub use recent::{Contribution, RecentTrajectories};
pub use signatures::{SignatureProjection, SignatureState, SignatureTables};
pub use transitions::{TransitionProjection, TransitionState, TransitionTables};

/// Registry holding the four analytics projections configured from `config`.
pub fn standard_registry(config: &TrajlogConfig) -> Result<ProjectionRegistry, ProjectionError> {
    let mut registry = ProjectionRegistry::new();
    registry.register(CooccurrenceProjection::new(config.cooccurrence))?;
    registry.register(TransitionProjection)?;
    registry.register(SignatureProjection::new(config.signatures))?;
    registry.register(OutcomeCorrelationProjection)?;
    Ok(registry)
}

/// Finalized state of every analytics projection, as read by the simulation
/// engine.
#[derive(Debug, Clone)]
pub struct AnalyticsSnapshot {
    pub cooccurrence: CooccurrenceState,
    pub transitions: TransitionState,
    pub signatures: SignatureState,
    pub correlation: OutcomeCorrelationState,
}

impl AnalyticsSnapshot {
    /// Takes the four analytics states out of a rebuild result.
    pub fn from_rebuild(set: &mut RebuildSet) -> Result<Self, ProjectionError> {
        Ok(Self {
            cooccurrence: set.take::<CooccurrenceProjection>()?.state,
            transitions: set.take::<TransitionProjection>()?.state,
            signatures: set.take::<SignatureProjection>()?.state,
            correlation: set.take::<OutcomeCorrelationProjection>()?.state,
        })
    }

    /// Rebuilds all four projections in one pass over `log`.
    pub fn rebuild(log: &dyn StepLog, config: &TrajlogConfig) -> TrajResult<Self> {
        let mut set = standard_registry(config)?.rebuild_all(log)?;
        Ok(Self::from_rebuild(&mut set)?)
    }
}
