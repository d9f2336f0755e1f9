//! Volume-control policies for step emission.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::hash::unit_interval;
use crate::ids::TrajectoryId;
use crate::step::StepType;

/// What to do with a step of a given type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum VolumePolicy {
    /// Always persist.
    #[default]
    Emit,
    /// Persist with probability `rate`, decided deterministically.
    Sample { rate: f64 },
    /// Hand the raw step to a downstream summarizer instead of persisting it.
    Summarize,
    /// Hand the raw step to a downstream aggregator instead of persisting it.
    Aggregate,
    /// Never persist.
    Drop,
}

impl VolumePolicy {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Self::Sample { rate } = self {
            if !rate.is_finite() || !(0.0..=1.0).contains(rate) {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("sample rate {rate} is out of range [0.0, 1.0]"),
                });
            }
        }
        Ok(())
    }
}

/// Per step-type policies. Types without an entry use [`VolumePolicy::Emit`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumePolicies(BTreeMap<StepType, VolumePolicy>);

impl VolumePolicies {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, step_type: StepType, policy: VolumePolicy) -> Self {
        self.0.insert(step_type, policy);
        self
    }

    /// Policy for `step_type`. Boundary steps are always emitted.
    #[must_use]
    pub fn policy_for(&self, step_type: StepType) -> VolumePolicy {
        if step_type.is_boundary() {
            return VolumePolicy::Emit;
        }
        self.0.get(&step_type).copied().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (step_type, policy) in &self.0 {
            if step_type.is_boundary() && *policy != VolumePolicy::Emit {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("boundary step '{step_type}' must use the emit policy"),
                });
            }
            policy.validate()?;
        }
        Ok(())
    }
}

/// Result of applying a policy to one offered step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Persist,
    Skip(SkipReason),
    Defer(DeferMode),
}

/// Why an offered step was not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Dropped,
    SampledOut,
}

/// Downstream compaction mode for a deferred step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferMode {
    Summarize,
    Aggregate,
}

/// Deterministic sampling decision for resolved offer number `ordinal`.
#[must_use]
pub fn sample_keep(trajectory_id: &TrajectoryId, step_type: StepType, ordinal: u64, rate: f64) -> bool {
    let key = format!("{trajectory_id}:{step_type}:{ordinal}");
    unit_interval(&key) < rate
}

pub(crate) fn decide(
    policy: VolumePolicy,
    trajectory_id: &TrajectoryId,
    step_type: StepType,
    ordinal: u64,
) -> Decision {
    match policy {
        VolumePolicy::Emit => Decision::Persist,
        VolumePolicy::Sample { rate } => {
            if sample_keep(trajectory_id, step_type, ordinal, rate) {
                Decision::Persist
            } else {
                Decision::Skip(SkipReason::SampledOut)
            }
        }
        VolumePolicy::Summarize => Decision::Defer(DeferMode::Summarize),
        VolumePolicy::Aggregate => Decision::Defer(DeferMode::Aggregate),
        VolumePolicy::Drop => Decision::Skip(SkipReason::Dropped),
    }
}
