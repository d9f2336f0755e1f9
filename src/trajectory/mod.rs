//! Trajectory emission: budgets, volume policies and the per-trajectory
//! context that appends steps through the hash chain.

mod budget;
mod context;
mod policy;

pub use budget::{BudgetLimits, BudgetSnapshot};
pub use context::{EmitOutcome, StepDraft, TrajectoryContext};
pub use policy::{sample_keep, DeferMode, SkipReason, VolumePolicies, VolumePolicy};
