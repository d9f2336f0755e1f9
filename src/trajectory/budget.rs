//! Trajectory resource budgets.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{BudgetKind, ValidationError};
use crate::step::StepType;

/// Limits that bound a trajectory's resource usage. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    /// Maximum number of persisted steps.
    pub steps: Option<u64>,
    /// Maximum wall-clock lifetime of the context.
    pub time_ms: Option<u64>,
    /// Maximum number of `entity_written` steps.
    pub writes: Option<u64>,
    /// Maximum number of `external_egress_attempted` steps.
    pub egress: Option<u64>,
}

impl BudgetLimits {
    /// Unlimited budgets.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            steps: None,
            time_ms: None,
            writes: None,
            egress: None,
        }
    }

    #[must_use]
    pub const fn with_steps(mut self, steps: u64) -> Self {
        self.steps = Some(steps);
        self
    }

    #[must_use]
    pub const fn with_time_ms(mut self, time_ms: u64) -> Self {
        self.time_ms = Some(time_ms);
        self
    }

    #[must_use]
    pub const fn with_writes(mut self, writes: u64) -> Self {
        self.writes = Some(writes);
        self
    }

    #[must_use]
    pub const fn with_egress(mut self, egress: u64) -> Self {
        self.egress = Some(egress);
        self
    }

    /// Validate limits.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.time_ms == Some(0) {
            return Err(ValidationError::InvalidConfig {
                reason: "budgets.time_ms must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Remaining budget counters for one trajectory.
#[derive(Debug, Clone)]
pub(crate) struct BudgetTracker {
    limits: BudgetLimits,
    steps_remaining: Option<u64>,
    writes_remaining: Option<u64>,
    egress_remaining: Option<u64>,
    deadline: Option<Instant>,
}

impl BudgetTracker {
    pub(crate) fn new(limits: BudgetLimits, started: Instant) -> Self {
        Self {
            limits,
            steps_remaining: limits.steps,
            writes_remaining: limits.writes,
            egress_remaining: limits.egress,
            deadline: limits
                .time_ms
                .map(|ms| started + Duration::from_millis(ms)),
        }
    }

    /// Returns the first budget that would be breached by persisting a step
    /// of `step_type` now, together with its limit.
    pub(crate) fn check(&self, step_type: StepType, now: Instant) -> Option<(BudgetKind, u64)> {
        if let Some(deadline) = self.deadline {
            if now > deadline {
                return Some((BudgetKind::Time, self.limits.time_ms.unwrap_or_default()));
            }
        }
        if self.steps_remaining == Some(0) {
            return Some((BudgetKind::Steps, self.limits.steps.unwrap_or_default()));
        }
        if step_type == StepType::EntityWritten && self.writes_remaining == Some(0) {
            return Some((BudgetKind::Writes, self.limits.writes.unwrap_or_default()));
        }
        if step_type == StepType::ExternalEgressAttempted && self.egress_remaining == Some(0) {
            return Some((BudgetKind::Egress, self.limits.egress.unwrap_or_default()));
        }
        None
    }

    /// Charges a persisted step against the counters.
    pub(crate) fn charge(&mut self, step_type: StepType) {
        fn dec(counter: &mut Option<u64>) {
            if let Some(n) = counter {
                *n = n.saturating_sub(1);
            }
        }
        dec(&mut self.steps_remaining);
        match step_type {
            StepType::EntityWritten => dec(&mut self.writes_remaining),
            StepType::ExternalEgressAttempted => dec(&mut self.egress_remaining),
            _ => {}
        }
    }

    pub(crate) fn snapshot(&self, now: Instant) -> BudgetSnapshot {
        BudgetSnapshot {
            steps_remaining: self.steps_remaining,
            time_remaining_ms: self.deadline.map(|d| {
                u64::try_from(d.saturating_duration_since(now).as_millis()).unwrap_or(u64::MAX)
            }),
            writes_remaining: self.writes_remaining,
            egress_remaining: self.egress_remaining,
        }
    }
}

/// Remaining budgets at a point in time. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub steps_remaining: Option<u64>,
    pub time_remaining_ms: Option<u64>,
    pub writes_remaining: Option<u64>,
    pub egress_remaining: Option<u64>,
}
