//! Event-sourced command execution with exactly-once semantics.
//!
//! A [`Ledger`] folds the append-only log into an [`Aggregate`], validates a
//! command against that state and appends the resulting entries. Outcomes are
//! recorded under the command's idempotency key, so a retried command returns
//! the recorded outcome without touching the log again.

mod trajectory;

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::entry::LogEntry;
use crate::error::{PreconditionError, TrajError, TrajResult, ValidationError};
use crate::ids::{CommandId, MAX_ID_LENGTH};
use crate::storage::{CommandLog, CommandRecord, CommandStart, CommandStatus, EntryRef, StepLog};

pub use trajectory::{TrajectoryCommand, TrajectoryLedger, TrajectoryRecord, TrajectoryRegistry};

/// What a command handler decided.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Append these entries, in order.
    Emit(Vec<LogEntry>),
    /// The command's effect is already present in the log.
    AlreadyProcessed,
}

/// State folded from the log that commands are validated against.
pub trait Aggregate: Default {
    type Command;

    /// Stable command name recorded with the outcome.
    fn command_name(command: &Self::Command) -> &'static str;

    /// Folds one log entry into the state.
    fn apply(&mut self, entry: &LogEntry);

    /// Validates a command against the current state.
    ///
    /// Must return a `Validation` error for malformed input and a
    /// `Precondition` error when the state does not allow the command.
    fn handle(&self, envelope: &CommandEnvelope<Self::Command>) -> TrajResult<Decision>;
}

/// A command with its idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope<C> {
    pub idempotency_key: String,
    pub command: C,
}

impl<C> CommandEnvelope<C> {
    pub fn new(idempotency_key: impl Into<String>, command: C) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            command,
        }
    }

    /// Command id derived from the idempotency key, used as step causation.
    pub fn command_id(&self) -> TrajResult<CommandId> {
        Ok(CommandId::new(self.idempotency_key.clone())?)
    }
}

/// Outcome of an executed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Applied { entries: Vec<EntryRef> },
    AlreadyProcessed,
}

impl From<&CommandRecord> for CommandOutcome {
    fn from(record: &CommandRecord) -> Self {
        match record.status {
            CommandStatus::Applied => Self::Applied {
                entries: record.produced.clone(),
            },
            CommandStatus::AlreadyProcessed => Self::AlreadyProcessed,
        }
    }
}

/// Result of [`Ledger::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReceipt {
    pub record: CommandRecord,
    /// True when the outcome was returned from the command log unchanged.
    pub replayed: bool,
}

impl CommandReceipt {
    #[must_use]
    pub fn outcome(&self) -> CommandOutcome {
        CommandOutcome::from(&self.record)
    }
}

/// Executes commands for aggregate `A` against a step log and command log.
pub struct Ledger<A: Aggregate> {
    log: Arc<dyn StepLog>,
    commands: Arc<dyn CommandLog>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate> fmt::Debug for Ledger<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

impl<A: Aggregate> Ledger<A> {
    pub fn new(log: Arc<dyn StepLog>, commands: Arc<dyn CommandLog>) -> Self {
        Self {
            log,
            commands,
            _aggregate: PhantomData,
        }
    }

    /// Folds the whole log into a fresh aggregate.
    pub fn state(&self) -> TrajResult<A> {
        let mut state = A::default();
        for entry in self.log.stream()? {
            state.apply(&entry?);
        }
        Ok(state)
    }

    /// Executes a command exactly once per idempotency key.
    ///
    /// A key with a recorded outcome returns that outcome unchanged. Validation
    /// and precondition failures release the key so a corrected command may
    /// reuse it.
    pub fn execute(&self, envelope: CommandEnvelope<A::Command>) -> TrajResult<CommandReceipt> {
        let key = envelope.idempotency_key.as_str();
        if key.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "idempotency_key".to_string(),
            }
            .into());
        }
        if key.len() > MAX_ID_LENGTH {
            return Err(ValidationError::FieldTooLong {
                field: "idempotency_key".to_string(),
                max_length: MAX_ID_LENGTH,
            }
            .into());
        }
        let command_name = A::command_name(&envelope.command);

        match self.commands.try_start(key, command_name)? {
            CommandStart::Recorded(record) => {
                debug!(idempotency_key = key, command = command_name, "command replayed");
                return Ok(CommandReceipt {
                    record,
                    replayed: true,
                });
            }
            CommandStart::InFlight => {
                return Err(PreconditionError::CommandInFlight {
                    idempotency_key: key.to_string(),
                }
                .into());
            }
            CommandStart::Started => {}
        }

        match self.run(&envelope) {
            Ok(record) => {
                if let Err(err) = self.commands.record_outcome(record.clone()) {
                    // The entries are in the log; freeing the key lets a retry
                    // fold them and resolve as already processed.
                    warn!(
                        idempotency_key = key,
                        command = command_name,
                        error = %err,
                        "failed to record command outcome"
                    );
                    if let Err(release_err) = self.commands.release(key) {
                        warn!(idempotency_key = key, error = %release_err, "failed to release command key");
                    }
                    return Err(err.into());
                }
                info!(
                    idempotency_key = key,
                    command = command_name,
                    status = ?record.status,
                    entries = record.produced.len(),
                    "command applied"
                );
                Ok(CommandReceipt {
                    record,
                    replayed: false,
                })
            }
            Err(err) => {
                warn!(idempotency_key = key, command = command_name, error = %err, "command rejected");
                if let Err(release_err) = self.commands.release(key) {
                    warn!(idempotency_key = key, error = %release_err, "failed to release command key");
                }
                Err(err)
            }
        }
    }

    fn run(&self, envelope: &CommandEnvelope<A::Command>) -> TrajResult<CommandRecord> {
        let state = self.state()?;
        let decision = state.handle(envelope)?;
        let (status, produced) = match decision {
            Decision::AlreadyProcessed => (CommandStatus::AlreadyProcessed, Vec::new()),
            Decision::Emit(entries) => {
                if entries.is_empty() {
                    return Err(TrajError::internal("command handler emitted no entries"));
                }
                let produced: Vec<EntryRef> = entries.iter().map(EntryRef::from).collect();
                self.log.append_batch(entries)?;
                (CommandStatus::Applied, produced)
            }
        };
        Ok(CommandRecord {
            idempotency_key: envelope.idempotency_key.clone(),
            command_name: A::command_name(&envelope.command).to_string(),
            status,
            produced,
            recorded_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TrajectoryId;
    use crate::refs::Refs;
    use crate::step::{build_step, Producer, StepInput, StepType};
    use crate::storage::{InMemoryCommandLog, InMemoryStepLog, StorageError};
    use serde_json::json;

    /// Counts entries; `true` commands emit nothing new.
    #[derive(Default)]
    struct Counter {
        entries: usize,
    }

    impl Aggregate for Counter {
        type Command = bool;

        fn command_name(_: &bool) -> &'static str {
            "noop"
        }

        fn apply(&mut self, _: &LogEntry) {
            self.entries += 1;
        }

        fn handle(&self, envelope: &CommandEnvelope<bool>) -> TrajResult<Decision> {
            if envelope.command {
                Ok(Decision::AlreadyProcessed)
            } else {
                Err(PreconditionError::CommandInFlight {
                    idempotency_key: "x".to_string(),
                }
                .into())
            }
        }
    }

    fn ledger() -> (Arc<InMemoryCommandLog>, Ledger<Counter>) {
        let commands = Arc::new(InMemoryCommandLog::new());
        let ledger = Ledger::new(Arc::new(InMemoryStepLog::new()), commands.clone());
        (commands, ledger)
    }

    #[test]
    fn already_processed_is_recorded_and_replayed() {
        let (commands, ledger) = ledger();
        let first = ledger.execute(CommandEnvelope::new("k1", true)).unwrap();
        assert!(!first.replayed);
        assert_eq!(first.outcome(), CommandOutcome::AlreadyProcessed);
        assert!(commands.lookup("k1").unwrap().is_some());

        let second = ledger.execute(CommandEnvelope::new("k1", true)).unwrap();
        assert!(second.replayed);
        assert_eq!(second.record, first.record);
    }

    #[test]
    fn rejected_command_releases_key() {
        let (commands, ledger) = ledger();
        assert!(ledger.execute(CommandEnvelope::new("k2", false)).is_err());
        assert!(commands.lookup("k2").unwrap().is_none());
        assert!(!ledger.execute(CommandEnvelope::new("k2", true)).unwrap().replayed);
    }

    #[test]
    fn empty_key_is_a_validation_error() {
        let (_, ledger) = ledger();
        assert!(ledger.execute(CommandEnvelope::new(" ", true)).unwrap_err().is_validation());
    }

    /// Emits a valid first step followed by one that skips ahead in the chain.
    #[derive(Default)]
    struct Gapped;

    impl Aggregate for Gapped {
        type Command = ();

        fn command_name(_: &()) -> &'static str {
            "gapped"
        }

        fn apply(&mut self, _: &LogEntry) {}

        fn handle(&self, _: &CommandEnvelope<()>) -> TrajResult<Decision> {
            let step = |seq: u64, step_type: StepType, payload| {
                build_step(StepInput {
                    trajectory_id: TrajectoryId::new("t-gap").unwrap(),
                    step_seq: seq,
                    prev_step_hash: None,
                    step_type,
                    producer: Producer::Host,
                    timestamp: Utc::now(),
                    correlation_id: "c".to_string(),
                    causation: None,
                    payload,
                    refs: Refs::new(),
                })
            };
            let first = step(0, StepType::TrajectoryStarted, json!({"trigger": "t"}))?;
            let gap = step(5, StepType::ToolCalled, json!({"tool": "ls"}))?;
            Ok(Decision::Emit(vec![first.into(), gap.into()]))
        }
    }

    #[test]
    fn partially_invalid_command_appends_nothing() {
        let log = Arc::new(InMemoryStepLog::new());
        let commands = Arc::new(InMemoryCommandLog::new());
        let ledger: Ledger<Gapped> = Ledger::new(log.clone(), commands.clone());

        let err = ledger.execute(CommandEnvelope::new("k-gap", ())).unwrap_err();
        assert!(matches!(err, TrajError::Storage(StorageError::ChainConflict { .. })));
        assert_eq!(log.len().unwrap(), 0);
        assert!(commands.lookup("k-gap").unwrap().is_none());
        assert_eq!(commands.try_start("k-gap", "gapped").unwrap(), CommandStart::Started);
    }

    /// Claims keys normally but cannot persist outcomes.
    #[derive(Default)]
    struct Unrecordable(InMemoryCommandLog);

    impl CommandLog for Unrecordable {
        fn try_start(&self, idempotency_key: &str, command_name: &str) -> Result<CommandStart, StorageError> {
            self.0.try_start(idempotency_key, command_name)
        }

        fn record_outcome(&self, _: CommandRecord) -> Result<(), StorageError> {
            Err(StorageError::Io("disk full".to_string()))
        }

        fn release(&self, idempotency_key: &str) -> Result<(), StorageError> {
            self.0.release(idempotency_key)
        }

        fn lookup(&self, idempotency_key: &str) -> Result<Option<CommandRecord>, StorageError> {
            self.0.lookup(idempotency_key)
        }
    }

    #[test]
    fn unrecorded_outcome_releases_key() {
        let commands = Arc::new(Unrecordable::default());
        let ledger: Ledger<Counter> = Ledger::new(Arc::new(InMemoryStepLog::new()), commands.clone());

        let err = ledger.execute(CommandEnvelope::new("k3", true)).unwrap_err();
        assert!(matches!(err, TrajError::Storage(StorageError::Io(_))));
        assert_eq!(commands.try_start("k3", "noop").unwrap(), CommandStart::Started);
    }
}
