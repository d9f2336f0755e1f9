//! Structurally similar trajectories.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::analytics::SignatureState;
use crate::config::SimulationConfig;
use crate::error::ProjectionError;
use crate::ids::TrajectoryId;

use super::{ALGORITHM_VERSION, FEATURE_SCHEMA_VERSION};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarTrajectory {
    pub trajectory_id: TrajectoryId,
    /// Fraction of the target entities structurally represented in the
    /// trajectory.
    pub score: f64,
    pub matched_signatures: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarTrajectories {
    pub targets: Vec<String>,
    pub trajectories: Vec<SimilarTrajectory>,
    pub algorithm_version: String,
    pub feature_schema_version: String,
}

/// Trajectories containing any entity that shares a signature with a target.
///
/// `score = distinct target signatures matched / distinct target entities`.
/// Targets without a signature count in the denominator but match nothing.
#[allow(clippy::cast_precision_loss)]
pub fn similar_trajectories<S: AsRef<str>>(
    state: &SignatureState,
    targets: &[S],
    config: &SimulationConfig,
) -> Result<SimilarTrajectories, ProjectionError> {
    let targets: BTreeSet<&str> = targets.iter().map(|t| t.as_ref()).collect();
    let mut signatures = BTreeSet::new();
    for target in &targets {
        if let Some(sig) = state.signature_of(target)? {
            signatures.insert(sig);
        }
    }

    let mut matched: BTreeMap<&TrajectoryId, BTreeSet<&str>> = BTreeMap::new();
    for sig in &signatures {
        let Some(entities) = state.entities_with(sig)? else {
            continue;
        };
        for entity in entities {
            let Some(trajectories) = state.trajectories_of(entity)? else {
                continue;
            };
            for trajectory in trajectories {
                matched.entry(trajectory).or_default().insert(*sig);
            }
        }
    }

    let denominator = targets.len() as f64;
    let mut trajectories: Vec<SimilarTrajectory> = matched
        .into_iter()
        .map(|(id, sigs)| SimilarTrajectory {
            trajectory_id: id.clone(),
            score: sigs.len() as f64 / denominator,
            matched_signatures: sigs.len(),
        })
        .collect();
    trajectories.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.trajectory_id.cmp(&b.trajectory_id))
    });
    trajectories.truncate(config.max_results);

    Ok(SimilarTrajectories {
        targets: targets.into_iter().map(str::to_string).collect(),
        trajectories,
        algorithm_version: ALGORITHM_VERSION.to_string(),
        feature_schema_version: FEATURE_SCHEMA_VERSION.to_string(),
    })
}
