//! Entity co-occurrence graph.
//!
//! Two entities co-occur when they are referenced by the same step. Each
//! undirected edge is stored in both directions with its weight, the most
//! recent contributing trajectories and the time it was last seen.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::CooccurrenceConfig;
use crate::entry::LogEntry;
use crate::error::ProjectionError;
use crate::projection::{Freshness, Projection};

use super::recent::RecentTrajectories;

/// One direction of an undirected co-occurrence edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub weight: u64,
    pub trajectories: RecentTrajectories,
    pub last_seen: DateTime<Utc>,
}

/// Folded co-occurrence graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CooccurrenceState {
    /// `entity -> neighbor -> edge`, both directions present.
    pub edges: BTreeMap<String, BTreeMap<String, EdgeRecord>>,
    /// `entity -> most recent trajectories referencing it`.
    pub entity_trajectories: BTreeMap<String, RecentTrajectories>,
    #[serde(skip)]
    freshness: Freshness,
}

impl CooccurrenceState {
    /// Neighbors of `entity`, heaviest first, ties by id.
    #[must_use]
    pub fn neighbors(&self, entity: &str) -> Vec<(&str, &EdgeRecord)> {
        let mut out: Vec<(&str, &EdgeRecord)> = self
            .edges
            .get(entity)
            .map(|m| m.iter().map(|(k, v)| (k.as_str(), v)).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| b.1.weight.cmp(&a.1.weight).then_with(|| a.0.cmp(b.0)));
        out
    }

    #[must_use]
    pub fn edge(&self, a: &str, b: &str) -> Option<&EdgeRecord> {
        self.edges.get(a)?.get(b)
    }

    /// Number of undirected edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges
            .iter()
            .map(|(a, m)| m.keys().filter(|b| a.as_str() < b.as_str()).count())
            .sum()
    }

    /// Latest `last_seen` across all edges.
    #[must_use]
    pub fn latest_seen(&self) -> Option<DateTime<Utc>> {
        self.edges
            .values()
            .flat_map(BTreeMap::values)
            .map(|e| e.last_seen)
            .max()
    }

    fn touch(&mut self, a: &str, b: &str, entry: &LogEntry, trajectory_id: &crate::ids::TrajectoryId, k: usize) {
        let ts = entry.timestamp();
        let edge = self
            .edges
            .entry(a.to_string())
            .or_default()
            .entry(b.to_string())
            .or_insert_with(|| EdgeRecord {
                weight: 0,
                trajectories: RecentTrajectories::default(),
                last_seen: ts,
            });
        edge.weight += 1;
        edge.trajectories.observe(trajectory_id, ts, k);
        if ts > edge.last_seen {
            edge.last_seen = ts;
        }
    }
}

/// Counts removed by a prune.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneStats {
    pub edges_removed: usize,
    pub entities_removed: usize,
}

/// Removes every edge last seen more than `window_days` before the latest
/// `last_seen` in the graph. A negative window removes every edge.
///
/// Pruning changes the projection hash; rehash the rebuilt result afterwards.
pub fn prune_cooccurrence(state: &mut CooccurrenceState, window_days: i64) -> PruneStats {
    let Some(latest) = state.latest_seen() else {
        return PruneStats::default();
    };
    let cutoff = latest - Duration::days(window_days);
    prune_before(state, cutoff)
}

/// Removes every edge whose `last_seen` is before `cutoff`, then every
/// entity left without edges.
pub fn prune_before(state: &mut CooccurrenceState, cutoff: DateTime<Utc>) -> PruneStats {
    let mut stats = PruneStats::default();
    let mut orphaned = BTreeSet::new();
    for (entity, neighbors) in &mut state.edges {
        let before = neighbors.len();
        neighbors.retain(|other, edge| {
            let keep = edge.last_seen >= cutoff;
            if !keep && entity.as_str() < other.as_str() {
                stats.edges_removed += 1;
            }
            keep
        });
        if before > 0 && neighbors.is_empty() {
            orphaned.insert(entity.clone());
        }
    }
    for entity in &orphaned {
        state.edges.remove(entity);
        state.entity_trajectories.remove(entity);
    }
    stats.entities_removed = orphaned.len();
    info!(
        %cutoff,
        edges_removed = stats.edges_removed,
        entities_removed = stats.entities_removed,
        "pruned co-occurrence graph"
    );
    stats
}

/// Co-occurrence projection.
#[derive(Debug, Clone, Copy, Default)]
pub struct CooccurrenceProjection {
    config: CooccurrenceConfig,
}

impl CooccurrenceProjection {
    #[must_use]
    pub const fn new(config: CooccurrenceConfig) -> Self {
        Self { config }
    }
}

impl Projection for CooccurrenceProjection {
    const NAME: &'static str = "cooccurrence";
    const VERSION: u32 = 1;
    type State = CooccurrenceState;

    fn init(&self) -> CooccurrenceState {
        CooccurrenceState::default()
    }

    fn apply(&self, state: &mut CooccurrenceState, entry: &LogEntry) -> Result<(), ProjectionError> {
        state.freshness.observe(entry);
        let LogEntry::Step(step) = entry else {
            return Ok(());
        };
        let k = self.config.top_k_trajectories;
        // Sorted and deduplicated.
        let entities: Vec<&str> = step.refs.entity_ids().into_iter().collect();
        for entity in &entities {
            state
                .entity_trajectories
                .entry((*entity).to_string())
                .or_default()
                .observe(&step.trajectory_id, step.timestamp, k);
        }
        for (i, a) in entities.iter().enumerate() {
            for b in &entities[i + 1..] {
                state.touch(a, b, entry, &step.trajectory_id, k);
                state.touch(b, a, entry, &step.trajectory_id, k);
            }
        }
        Ok(())
    }

    fn freshness(&self, state: &CooccurrenceState) -> Freshness {
        state.freshness.clone()
    }
}
