//! Abstract storage traits for trajlog.
//!
//! The append-only log is the single source of truth; every derived view is
//! rebuilt by streaming it. By using traits, we enable:
//! - In-memory backends for testing and embedded use
//! - A file-backed backend (feature `persistent`)
//! - Any external durable log that offers append + sequential streaming

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entry::LogEntry;
use crate::ids::{OutcomeId, StepId, TrajectoryId};
use crate::step::Step;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Key already exists with different content.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// An appended step does not extend its trajectory's chain.
    #[error("Chain conflict at {trajectory_id}#{step_seq}: {reason}")]
    ChainConflict {
        trajectory_id: TrajectoryId,
        step_seq: u64,
        reason: String,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Stored data failed an integrity check.
    #[error("Corrupted record at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },
}

impl StorageError {
    /// Returns true for failures that may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Result of appending an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AppendReceipt {
    /// The entry was written at `offset`.
    Appended { offset: u64 },
    /// An identical entry already exists at `offset`; nothing was written.
    Duplicate { offset: u64 },
}

impl AppendReceipt {
    #[must_use]
    pub const fn offset(&self) -> u64 {
        match self {
            Self::Appended { offset } | Self::Duplicate { offset } => *offset,
        }
    }

    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Current end of a trajectory's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTail {
    /// Sequence number the next step must carry.
    pub next_seq: u64,
    /// Id of the last appended step.
    pub last_step_id: StepId,
    /// Whether a `trajectory_ended` step has been appended.
    pub ended: bool,
}

/// Sequential stream of log entries in append order.
pub type EntryStream<'a> = Box<dyn Iterator<Item = Result<LogEntry, StorageError>> + Send + 'a>;

/// Append-only step/outcome log.
///
/// # Invariants
/// - Entries are never mutated or removed.
/// - A step is accepted only if it extends its trajectory's chain
///   (`step_seq == tail.next_seq` and `prev_step_hash == tail.last_step_id`).
/// - Re-appending an identical entry is a no-op returning
///   `AppendReceipt::Duplicate`; reusing an id for different content fails
///   with `StorageError::DuplicateKey`.
pub trait StepLog: Send + Sync {
    /// Appends an entry atomically.
    fn append(&self, entry: LogEntry) -> Result<AppendReceipt, StorageError>;

    /// Appends entries in order, all or nothing.
    ///
    /// Each entry is checked against the log plus the entries before it in
    /// the batch. If any is rejected, or the write fails, the log is left as
    /// it was. Receipts are returned in input order.
    fn append_batch(&self, entries: Vec<LogEntry>) -> Result<Vec<AppendReceipt>, StorageError>;

    /// Streams entries starting at `offset` (0-based, in append order).
    ///
    /// Streams are resumable: a consumer that processed `n` entries can
    /// continue with `stream_from(n)`.
    fn stream_from(&self, offset: u64) -> Result<EntryStream<'_>, StorageError>;

    /// Streams every entry in append order.
    fn stream(&self) -> Result<EntryStream<'_>, StorageError> {
        self.stream_from(0)
    }

    /// Number of entries in the log.
    fn len(&self) -> Result<u64, StorageError>;

    /// Returns true if the log has no entries.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Current chain tail of a trajectory, if it has any steps.
    fn chain_tail(&self, trajectory_id: &TrajectoryId) -> Result<Option<ChainTail>, StorageError>;

    /// Looks up a step by id.
    fn get_step(&self, step_id: &StepId) -> Result<Option<Step>, StorageError>;

    /// Looks up a step by its chain position.
    fn get_step_at(&self, trajectory_id: &TrajectoryId, step_seq: u64) -> Result<Option<Step>, StorageError>;

    /// All steps of a trajectory ordered by `step_seq`.
    fn trajectory_steps(&self, trajectory_id: &TrajectoryId) -> Result<Vec<Step>, StorageError>;
}

/// Reference to an entry produced by a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntryRef {
    Step(StepId),
    Outcome(OutcomeId),
}

impl From<&LogEntry> for EntryRef {
    fn from(entry: &LogEntry) -> Self {
        match entry {
            LogEntry::Step(s) => Self::Step(s.step_id.clone()),
            LogEntry::Outcome(o) => Self::Outcome(o.outcome_id),
        }
    }
}

/// Recorded status of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandStatus {
    /// Events were appended.
    Applied,
    /// The command's effect was already present; nothing was appended.
    AlreadyProcessed,
}

/// Outcome of a command, stored under its idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub idempotency_key: String,
    pub command_name: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub produced: Vec<EntryRef>,
    pub recorded_at: DateTime<Utc>,
}

/// Result of claiming an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStart {
    /// The key was free and is now claimed by the caller.
    Started,
    /// The key already has a recorded outcome.
    Recorded(CommandRecord),
    /// Another caller holds the key and has not recorded an outcome yet.
    InFlight,
}

/// Exactly-once command bookkeeping.
pub trait CommandLog: Send + Sync {
    /// Claims `idempotency_key` for `command_name`.
    fn try_start(&self, idempotency_key: &str, command_name: &str) -> Result<CommandStart, StorageError>;

    /// Records the outcome of a claimed command.
    fn record_outcome(&self, record: CommandRecord) -> Result<(), StorageError>;

    /// Releases a claim without recording an outcome (the command failed).
    fn release(&self, idempotency_key: &str) -> Result<(), StorageError>;

    /// Looks up a recorded outcome.
    fn lookup(&self, idempotency_key: &str) -> Result<Option<CommandRecord>, StorageError>;
}
