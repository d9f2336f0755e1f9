//! # trajlog - Tamper-evident trajectory log with replayable analytics
//!
//! trajlog records what an agent did as hash-chained steps in an append-only
//! log, attaches outcomes to them after the fact, and derives analytics
//! views by folding that log. Every view can be thrown away and rebuilt
//! from the log to the same content hash.
//!
//! ## Core Concepts
//!
//! - **Step**: An immutable, content-addressed record of one action, chained
//!   to its predecessor by `prev_step_hash`
//! - **Outcome**: A late-arriving result attached to a trajectory or step
//! - **Trajectory context**: Emits steps under volume policies and budgets
//! - **Ledger**: Exactly-once command execution keyed by idempotency keys
//! - **Projection**: A deterministic fold over the log with a stable hash
//! - **Simulation**: Read-only queries (blast radius, similarity, change
//!   prediction) over finalized projection state
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use trajlog::{AnalyticsSnapshot, InMemoryStepLog, Refs, SimulationEngine, StepDraft, StepType,
//!     TrajectoryContext, TrajectoryId, TrajlogConfig};
//!
//! let log = Arc::new(InMemoryStepLog::new());
//! let config = TrajlogConfig::default();
//! let mut ctx = TrajectoryContext::new(TrajectoryId::new("deploy-42")?, "corr-1", log.clone(), &config)?;
//! ctx.start("cli", serde_json::json!({}))?;
//! ctx.emit(StepDraft::new(StepType::EntityRead, serde_json::json!({})).refs(Refs::entities(["db:orders"])))?;
//! ctx.end(serde_json::json!({"ok": true}))?;
//!
//! let analytics = AnalyticsSnapshot::rebuild(log.as_ref(), &config)?;
//! let radius = SimulationEngine::new(&analytics, config.simulation)?.blast_radius("db:orders");
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

// Core records
pub mod entry;
pub mod error;
pub mod hash;
pub mod ids;
pub mod outcome;
pub mod refs;
pub mod step;

// Log, emission and commands
pub mod config;
pub mod ledger;
pub mod storage;
pub mod trajectory;

// Derived views
pub mod analytics;
pub mod projection;
pub mod simulation;

pub use config::{CooccurrenceConfig, SignatureConfig, SimulationConfig, TrajlogConfig};
pub use entry::LogEntry;
pub use error::{
    BudgetKind, ExecutionError, PreconditionError, ProjectionError, TrajError, TrajResult, ValidationError,
};
pub use ids::{CommandId, OutcomeId, StepId, TrajectoryId};
pub use outcome::{build_outcome, AttachesTo, Outcome, OutcomeInput, OutcomeKind};
pub use refs::{LinkKind, RefEntry, Refs};
pub use step::{build_step, verify_chain, Causation, Producer, Step, StepInput, StepType};

pub use ledger::{
    Aggregate, CommandEnvelope, CommandOutcome, CommandReceipt, Ledger, TrajectoryCommand, TrajectoryLedger,
    TrajectoryRegistry,
};
pub use storage::{
    AppendReceipt, ChainTail, CommandLog, CommandRecord, InMemoryCommandLog, InMemoryStepLog, StepLog,
    StorageError,
};
pub use trajectory::{BudgetLimits, EmitOutcome, StepDraft, TrajectoryContext, VolumePolicies, VolumePolicy};

pub use analytics::{standard_registry, AnalyticsSnapshot};
pub use projection::{rebuild_one, Projection, ProjectionRegistry, RebuildSet, Rebuilt};
pub use simulation::{ChangeRequest, SimulationEngine};
