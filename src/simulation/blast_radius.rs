//! One-hop blast radius over the co-occurrence graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analytics::CooccurrenceState;
use crate::config::SimulationConfig;
use crate::ids::TrajectoryId;

use super::{sample_confidence, ALGORITHM_VERSION, FEATURE_SCHEMA_VERSION};

/// A neighbor that may be affected by touching the queried entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffectedEntity {
    pub entity: String,
    pub weight: u64,
    /// Most recent co-occurring trajectories, newest first.
    pub trajectories: Vec<TrajectoryId>,
    pub last_seen: DateTime<Utc>,
}

/// Answer to a blast-radius query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlastRadius {
    pub entity: String,
    pub affected: Vec<AffectedEntity>,
    /// Sum of edge weights around the entity.
    pub sample_size: u64,
    pub confidence: f64,
    pub algorithm_version: String,
    pub feature_schema_version: String,
}

/// Neighbors of `entity`, heaviest first. An unknown entity yields an empty
/// answer with confidence 0.
#[must_use]
pub fn blast_radius(state: &CooccurrenceState, entity: &str, config: &SimulationConfig) -> BlastRadius {
    let neighbors = state.neighbors(entity);
    let sample_size: u64 = neighbors.iter().map(|(_, e)| e.weight).sum();
    let affected = neighbors
        .into_iter()
        .take(config.max_results)
        .map(|(id, edge)| AffectedEntity {
            entity: id.to_string(),
            weight: edge.weight,
            trajectories: edge.trajectories.ids().cloned().collect(),
            last_seen: edge.last_seen,
        })
        .collect();
    BlastRadius {
        entity: entity.to_string(),
        affected,
        sample_size,
        confidence: sample_confidence(sample_size, config.confidence_dampener),
        algorithm_version: ALGORITHM_VERSION.to_string(),
        feature_schema_version: FEATURE_SCHEMA_VERSION.to_string(),
    }
}
