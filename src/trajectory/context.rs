//! Per-trajectory emission context.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::config::TrajlogConfig;
use crate::error::{BudgetKind, ExecutionError, TrajResult, ValidationError};
use crate::ids::{StepId, TrajectoryId};
use crate::refs::Refs;
use crate::step::{build_step, Causation, Producer, Step, StepInput, StepType};
use crate::storage::StepLog;

use super::budget::{BudgetLimits, BudgetSnapshot, BudgetTracker};
use super::policy::{decide, Decision, DeferMode, SkipReason, VolumePolicies};

/// A step offered to a [`TrajectoryContext`].
#[derive(Debug, Clone, PartialEq)]
pub struct StepDraft {
    pub step_type: StepType,
    pub producer: Producer,
    pub payload: JsonValue,
    pub refs: Refs,
    pub causation: Option<Causation>,
    /// Event time; the wall clock at emission when unset.
    pub timestamp: Option<DateTime<Utc>>,
}

impl StepDraft {
    /// A host-produced draft with no refs.
    #[must_use]
    pub fn new(step_type: StepType, payload: JsonValue) -> Self {
        Self {
            step_type,
            producer: Producer::Host,
            payload,
            refs: Refs::new(),
            causation: None,
            timestamp: None,
        }
    }

    #[must_use]
    pub fn producer(mut self, producer: Producer) -> Self {
        self.producer = producer;
        self
    }

    #[must_use]
    pub fn refs(mut self, refs: Refs) -> Self {
        self.refs = refs;
        self
    }

    #[must_use]
    pub fn causation(mut self, causation: Causation) -> Self {
        self.causation = Some(causation);
        self
    }

    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// What happened to an offered step.
#[derive(Debug, Clone, PartialEq)]
pub enum EmitOutcome {
    /// The step was persisted.
    Appended(Step),
    /// An identical step was already in the log; nothing was written and no
    /// budget was charged.
    AlreadyPresent(Step),
    /// The volume policy declined to persist the step.
    Skipped { step_type: StepType, reason: SkipReason },
    /// The raw step is returned for downstream compaction and was not persisted.
    Deferred { mode: DeferMode, draft: StepDraft },
}

impl EmitOutcome {
    #[must_use]
    pub const fn step(&self) -> Option<&Step> {
        match self {
            Self::Appended(step) | Self::AlreadyPresent(step) => Some(step),
            Self::Skipped { .. } | Self::Deferred { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Open,
    Aborted(BudgetKind),
    Ended,
}

/// Mediates all step emission for one trajectory.
///
/// Callers must not share a trajectory between two contexts; each step's id
/// depends on its predecessor, so appends are serialized through `&mut self`.
pub struct TrajectoryContext {
    trajectory_id: TrajectoryId,
    correlation_id: String,
    log: Arc<dyn StepLog>,
    policies: VolumePolicies,
    budgets: BudgetTracker,
    created_at: Instant,
    next_seq: u64,
    prev_step_hash: Option<StepId>,
    offers: u64,
    status: Status,
}

impl fmt::Debug for TrajectoryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrajectoryContext")
            .field("trajectory_id", &self.trajectory_id)
            .field("correlation_id", &self.correlation_id)
            .field("next_seq", &self.next_seq)
            .field("offers", &self.offers)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl TrajectoryContext {
    /// Creates a context for a new trajectory. The whole config is validated.
    pub fn new(
        trajectory_id: TrajectoryId,
        correlation_id: impl Into<String>,
        log: Arc<dyn StepLog>,
        config: &TrajlogConfig,
    ) -> TrajResult<Self> {
        config.validate()?;
        Self::with_policies(
            trajectory_id,
            correlation_id,
            log,
            config.budgets,
            config.volume.clone(),
        )
    }

    /// Creates a context with explicit budgets and policies.
    pub fn with_policies(
        trajectory_id: TrajectoryId,
        correlation_id: impl Into<String>,
        log: Arc<dyn StepLog>,
        budgets: BudgetLimits,
        policies: VolumePolicies,
    ) -> TrajResult<Self> {
        budgets.validate()?;
        policies.validate()?;
        let correlation_id = correlation_id.into();
        if correlation_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "correlation_id".to_string(),
            }
            .into());
        }
        let created_at = Instant::now();
        Ok(Self {
            trajectory_id,
            correlation_id,
            log,
            policies,
            budgets: BudgetTracker::new(budgets, created_at),
            created_at,
            next_seq: 0,
            prev_step_hash: None,
            offers: 0,
            status: Status::Open,
        })
    }

    /// Creates a context continuing an existing trajectory from its chain tail.
    ///
    /// Budgets restart from their limits.
    pub fn resume(
        trajectory_id: TrajectoryId,
        correlation_id: impl Into<String>,
        log: Arc<dyn StepLog>,
        config: &TrajlogConfig,
    ) -> TrajResult<Self> {
        let tail = log.chain_tail(&trajectory_id)?;
        let mut ctx = Self::new(trajectory_id, correlation_id, log, config)?;
        if let Some(tail) = tail {
            ctx.next_seq = tail.next_seq;
            ctx.prev_step_hash = Some(tail.last_step_id);
            if tail.ended {
                ctx.status = Status::Ended;
            }
        }
        Ok(ctx)
    }

    #[must_use]
    pub const fn trajectory_id(&self) -> &TrajectoryId {
        &self.trajectory_id
    }

    /// Sequence number the next persisted step will carry.
    #[must_use]
    pub const fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Id of the last persisted step.
    #[must_use]
    pub const fn last_step_id(&self) -> Option<&StepId> {
        self.prev_step_hash.as_ref()
    }

    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self.status, Status::Aborted(_))
    }

    #[must_use]
    pub const fn is_ended(&self) -> bool {
        matches!(self.status, Status::Ended)
    }

    /// Remaining budgets.
    #[must_use]
    pub fn budgets(&self) -> BudgetSnapshot {
        self.budgets.snapshot(Instant::now())
    }

    /// Milliseconds since the context was created.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.created_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Offers a step for emission.
    ///
    /// # Errors
    ///
    /// - `TrajectoryClosed` after the boundary end step
    /// - `TrajectoryAborted` after a budget breach
    /// - `BudgetExceeded` naming the exhausted budget; the trajectory aborts
    /// - validation errors from step construction
    /// - storage errors from the underlying log
    pub fn emit(&mut self, draft: StepDraft) -> TrajResult<EmitOutcome> {
        match self.status {
            Status::Open => {}
            Status::Ended => {
                return Err(ExecutionError::TrajectoryClosed {
                    trajectory_id: self.trajectory_id.clone(),
                }
                .into())
            }
            Status::Aborted(_) => {
                return Err(ExecutionError::TrajectoryAborted {
                    trajectory_id: self.trajectory_id.clone(),
                }
                .into())
            }
        }
        if draft.step_type == StepType::TrajectoryStarted && self.next_seq != 0 {
            return Err(ValidationError::InvalidChainPosition {
                reason: "trajectory_started must be the first step".to_string(),
            }
            .into());
        }

        // The ordinal only advances once an offer resolves, so a draft retried
        // after an error sees the same sampling decision.
        let ordinal = self.offers;
        let policy = self.policies.policy_for(draft.step_type);
        match decide(policy, &self.trajectory_id, draft.step_type, ordinal) {
            Decision::Persist => {}
            Decision::Skip(reason) => {
                debug!(
                    trajectory_id = %self.trajectory_id,
                    step_type = %draft.step_type,
                    ?reason,
                    "step not persisted"
                );
                self.offers = self.offers.saturating_add(1);
                return Ok(EmitOutcome::Skipped {
                    step_type: draft.step_type,
                    reason,
                });
            }
            Decision::Defer(mode) => {
                debug!(
                    trajectory_id = %self.trajectory_id,
                    step_type = %draft.step_type,
                    ?mode,
                    "step deferred"
                );
                self.offers = self.offers.saturating_add(1);
                return Ok(EmitOutcome::Deferred { mode, draft });
            }
        }

        if let Some((budget, limit)) = self.budgets.check(draft.step_type, Instant::now()) {
            self.status = Status::Aborted(budget);
            warn!(
                trajectory_id = %self.trajectory_id,
                %budget,
                limit,
                "trajectory budget exhausted, aborting"
            );
            return Err(ExecutionError::BudgetExceeded {
                trajectory_id: self.trajectory_id.clone(),
                budget,
                limit,
            }
            .into());
        }

        let step = build_step(StepInput {
            trajectory_id: self.trajectory_id.clone(),
            step_seq: self.next_seq,
            prev_step_hash: self.prev_step_hash.clone(),
            step_type: draft.step_type,
            producer: draft.producer,
            timestamp: draft.timestamp.unwrap_or_else(Utc::now),
            correlation_id: self.correlation_id.clone(),
            causation: draft.causation,
            payload: draft.payload,
            refs: draft.refs,
        })?;

        let receipt = self.log.append(step.clone().into())?;
        debug!(
            trajectory_id = %self.trajectory_id,
            step_seq = step.step_seq,
            step_type = %step.step_type,
            offset = receipt.offset(),
            duplicate = receipt.is_duplicate(),
            "step appended"
        );

        self.offers = self.offers.saturating_add(1);
        self.next_seq = step.step_seq.saturating_add(1);
        self.prev_step_hash = Some(step.step_id.clone());
        if step.step_type == StepType::TrajectoryEnded {
            self.status = Status::Ended;
        }
        if receipt.is_duplicate() {
            return Ok(EmitOutcome::AlreadyPresent(step));
        }
        self.budgets.charge(step.step_type);
        Ok(EmitOutcome::Appended(step))
    }

    /// Emits the `trajectory_started` boundary step.
    pub fn start(&mut self, trigger: &str, context: JsonValue) -> TrajResult<Step> {
        let draft = StepDraft::new(
            StepType::TrajectoryStarted,
            json!({ "trigger": trigger, "context": context }),
        );
        self.emit_boundary(draft)
    }

    /// Emits the `trajectory_ended` boundary step. No further steps are accepted.
    pub fn end(&mut self, outcome_summary: JsonValue) -> TrajResult<Step> {
        let draft = StepDraft::new(
            StepType::TrajectoryEnded,
            json!({ "outcome_summary": outcome_summary }),
        );
        self.emit_boundary(draft)
    }

    fn emit_boundary(&mut self, draft: StepDraft) -> TrajResult<Step> {
        match self.emit(draft)? {
            EmitOutcome::Appended(step) | EmitOutcome::AlreadyPresent(step) => Ok(step),
            EmitOutcome::Skipped { .. } | EmitOutcome::Deferred { .. } => {
                Err(crate::error::TrajError::internal("boundary step was not persisted"))
            }
        }
    }
}
