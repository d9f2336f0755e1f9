//! Bounded "most recent trajectories" list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::TrajectoryId;

/// One contributing trajectory and the latest time it contributed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Contribution {
    pub timestamp: DateTime<Utc>,
    pub trajectory_id: TrajectoryId,
}

/// The `k` most recent trajectories by `(timestamp, trajectory_id)`, oldest
/// first.
///
/// Each trajectory appears once with its latest timestamp. The retained set
/// depends only on the multiset of observations, not on their order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecentTrajectories(Vec<Contribution>);

impl RecentTrajectories {
    pub fn observe(&mut self, trajectory_id: &TrajectoryId, timestamp: DateTime<Utc>, k: usize) {
        if let Some(existing) = self.0.iter_mut().find(|c| &c.trajectory_id == trajectory_id) {
            if timestamp <= existing.timestamp {
                return;
            }
            existing.timestamp = timestamp;
        } else {
            self.0.push(Contribution {
                timestamp,
                trajectory_id: trajectory_id.clone(),
            });
        }
        self.0.sort();
        if self.0.len() > k {
            let excess = self.0.len() - k;
            self.0.drain(..excess);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contribution> {
        self.0.iter()
    }

    /// Trajectory ids, most recent first.
    pub fn ids(&self) -> impl Iterator<Item = &TrajectoryId> {
        self.0.iter().rev().map(|c| &c.trajectory_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
