//! Simulation engine.
//!
//! Stateless queries over finalized analytics state. Nothing here reads the
//! log or mutates a projection; every answer carries the algorithm and
//! feature schema versions so consumers can tell when scoring changed.

mod blast_radius;
mod change;
mod similarity;

pub use blast_radius::{blast_radius, AffectedEntity, BlastRadius};
pub use change::{
    simulate_change, ChangeRequest, ChangeSimulation, PredictedOutcome, RiskFactor, RiskSource, StepTypePrior,
};
pub use similarity::{similar_trajectories, SimilarTrajectories, SimilarTrajectory};

use crate::analytics::AnalyticsSnapshot;
use crate::config::SimulationConfig;
use crate::error::{ProjectionError, ValidationError};

/// Version of the scoring algorithms.
pub const ALGORITHM_VERSION: &str = "trajlog.simulation.v1";

/// Version of the projection features the scores are computed from.
pub const FEATURE_SCHEMA_VERSION: &str = "trajlog.features.v1";

/// Laplace-style sample-size confidence `n / (n + dampener)`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn sample_confidence(n: u64, dampener: f64) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    n / (n + dampener)
}

/// Convenience wrapper binding the three queries to one snapshot.
#[derive(Debug, Clone, Copy)]
pub struct SimulationEngine<'a> {
    analytics: &'a AnalyticsSnapshot,
    config: SimulationConfig,
}

impl<'a> SimulationEngine<'a> {
    /// Binds `analytics`, rejecting a config whose dampener or result
    /// limit would make scores meaningless.
    pub fn new(analytics: &'a AnalyticsSnapshot, config: SimulationConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self { analytics, config })
    }

    #[must_use]
    pub fn blast_radius(&self, entity: &str) -> BlastRadius {
        blast_radius(&self.analytics.cooccurrence, entity, &self.config)
    }

    pub fn similar_trajectories<S: AsRef<str>>(&self, targets: &[S]) -> Result<SimilarTrajectories, ProjectionError> {
        similar_trajectories(&self.analytics.signatures, targets, &self.config)
    }

    pub fn simulate_change(&self, request: &ChangeRequest) -> Result<ChangeSimulation, ProjectionError> {
        simulate_change(
            &self.analytics.transitions,
            &self.analytics.correlation,
            request,
            &self.config,
        )
    }
}
