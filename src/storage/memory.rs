//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use crate::entry::LogEntry;
use crate::ids::{StepId, TrajectoryId};
use crate::step::Step;

use super::index::{Admission, ChainIndex, Fingerprint};
use super::traits::{
    AppendReceipt, ChainTail, CommandLog, CommandRecord, CommandStart, EntryStream, StepLog,
    StorageError,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn to_index(offset: u64) -> Result<usize, StorageError> {
    usize::try_from(offset).map_err(|_| StorageError::BackendError(format!("offset {offset} out of range")))
}

#[derive(Debug, Default)]
struct LogState {
    arena: Vec<LogEntry>,
    index: ChainIndex,
}

impl LogState {
    fn push(&mut self, entry: LogEntry, fingerprint: Fingerprint) -> AppendReceipt {
        let offset = self.arena.len() as u64;
        self.index.record(&entry, offset, fingerprint);
        self.arena.push(entry);
        AppendReceipt::Appended { offset }
    }

    fn step_at(&self, offset: u64) -> Result<Option<Step>, StorageError> {
        Ok(self
            .arena
            .get(to_index(offset)?)
            .and_then(LogEntry::as_step)
            .cloned())
    }
}

/// Thread-safe in-memory step log.
#[derive(Debug, Default)]
pub struct InMemoryStepLog {
    state: RwLock<LogState>,
}

impl InMemoryStepLog {
    /// Create a new empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_at(&self, offset: u64) -> Result<Option<LogEntry>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("log.stream"))?;
        Ok(state.arena.get(to_index(offset)?).cloned())
    }
}

/// Cursor that reads one entry per step, holding the lock only briefly.
struct MemoryCursor<'a> {
    log: &'a InMemoryStepLog,
    next: u64,
    done: bool,
}

impl Iterator for MemoryCursor<'_> {
    type Item = Result<LogEntry, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.log.entry_at(self.next) {
            Ok(Some(entry)) => {
                self.next = self.next.saturating_add(1);
                Some(Ok(entry))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl StepLog for InMemoryStepLog {
    fn append(&self, entry: LogEntry) -> Result<AppendReceipt, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("log.append"))?;
        match state.index.admit(&entry)? {
            Admission::Duplicate(offset) => {
                debug!(offset, "duplicate log entry ignored");
                Ok(AppendReceipt::Duplicate { offset })
            }
            Admission::New(fingerprint) => Ok(state.push(entry, fingerprint)),
        }
    }

    fn append_batch(&self, entries: Vec<LogEntry>) -> Result<Vec<AppendReceipt>, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("log.append_batch"))?;
        let first = state.arena.len() as u64;
        let admissions = state.index.admit_batch(&entries, first)?;
        let receipts = entries
            .into_iter()
            .zip(admissions)
            .map(|(entry, admission)| match admission {
                Admission::Duplicate(offset) => AppendReceipt::Duplicate { offset },
                Admission::New(fingerprint) => state.push(entry, fingerprint),
            })
            .collect();
        Ok(receipts)
    }

    fn stream_from(&self, offset: u64) -> Result<EntryStream<'_>, StorageError> {
        Ok(Box::new(MemoryCursor {
            log: self,
            next: offset,
            done: false,
        }))
    }

    fn len(&self) -> Result<u64, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("log.len"))?;
        Ok(state.arena.len() as u64)
    }

    fn chain_tail(&self, trajectory_id: &TrajectoryId) -> Result<Option<ChainTail>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("log.chain_tail"))?;
        Ok(state.index.tail(trajectory_id))
    }

    fn get_step(&self, step_id: &StepId) -> Result<Option<Step>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("log.get_step"))?;
        match state.index.step_offset(step_id) {
            Some(offset) => state.step_at(offset),
            None => Ok(None),
        }
    }

    fn get_step_at(&self, trajectory_id: &TrajectoryId, step_seq: u64) -> Result<Option<Step>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("log.get_step_at"))?;
        match state.index.offset_at(trajectory_id, step_seq) {
            Some(offset) => state.step_at(offset),
            None => Ok(None),
        }
    }

    fn trajectory_steps(&self, trajectory_id: &TrajectoryId) -> Result<Vec<Step>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("log.trajectory_steps"))?;
        let mut out = Vec::new();
        for &offset in state.index.trajectory_offsets(trajectory_id) {
            if let Some(step) = state.step_at(offset)? {
                out.push(step);
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
enum CommandSlot {
    InFlight { command_name: String },
    Recorded(CommandRecord),
}

/// Thread-safe in-memory command log.
#[derive(Debug, Default)]
pub struct InMemoryCommandLog {
    slots: RwLock<HashMap<String, CommandSlot>>,
}

impl InMemoryCommandLog {
    /// Create a new empty command log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandLog for InMemoryCommandLog {
    fn try_start(&self, idempotency_key: &str, command_name: &str) -> Result<CommandStart, StorageError> {
        let mut slots = self.slots.write().map_err(|_| lock_err("command.try_start"))?;
        match slots.get(idempotency_key) {
            Some(CommandSlot::Recorded(record)) => {
                if record.command_name != command_name {
                    return Err(StorageError::DuplicateKey(format!(
                        "idempotency key '{idempotency_key}' was used for '{}'",
                        record.command_name
                    )));
                }
                Ok(CommandStart::Recorded(record.clone()))
            }
            Some(CommandSlot::InFlight { .. }) => Ok(CommandStart::InFlight),
            None => {
                slots.insert(
                    idempotency_key.to_string(),
                    CommandSlot::InFlight {
                        command_name: command_name.to_string(),
                    },
                );
                Ok(CommandStart::Started)
            }
        }
    }

    fn record_outcome(&self, record: CommandRecord) -> Result<(), StorageError> {
        let mut slots = self.slots.write().map_err(|_| lock_err("command.record_outcome"))?;
        match slots.get(&record.idempotency_key) {
            Some(CommandSlot::Recorded(_)) => Err(StorageError::DuplicateKey(record.idempotency_key)),
            Some(CommandSlot::InFlight { command_name }) if *command_name != record.command_name => {
                Err(StorageError::BackendError(format!(
                    "claim for '{}' belongs to '{command_name}'",
                    record.idempotency_key
                )))
            }
            _ => {
                slots.insert(record.idempotency_key.clone(), CommandSlot::Recorded(record));
                Ok(())
            }
        }
    }

    fn release(&self, idempotency_key: &str) -> Result<(), StorageError> {
        let mut slots = self.slots.write().map_err(|_| lock_err("command.release"))?;
        if matches!(slots.get(idempotency_key), Some(CommandSlot::InFlight { .. })) {
            slots.remove(idempotency_key);
        }
        Ok(())
    }

    fn lookup(&self, idempotency_key: &str) -> Result<Option<CommandRecord>, StorageError> {
        let slots = self.slots.read().map_err(|_| lock_err("command.lookup"))?;
        Ok(match slots.get(idempotency_key) {
            Some(CommandSlot::Recorded(record)) => Some(record.clone()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{build_outcome, OutcomeInput, OutcomeKind};
    use crate::refs::Refs;
    use crate::step::{build_step, Producer, StepInput, StepType};
    use crate::storage::traits::CommandStatus;
    use chrono::Utc;
    use serde_json::json;

    fn step(seq: u64, prev: Option<StepId>, step_type: StepType) -> Step {
        step_with(seq, prev, step_type, json!({"trigger": "test", "tool": "ls"}))
    }

    fn step_with(seq: u64, prev: Option<StepId>, step_type: StepType, payload: serde_json::Value) -> Step {
        build_step(StepInput {
            trajectory_id: TrajectoryId::new("t1").unwrap(),
            step_seq: seq,
            prev_step_hash: prev,
            step_type,
            producer: Producer::Host,
            timestamp: Utc::now(),
            correlation_id: "c".to_string(),
            causation: None,
            payload,
            refs: Refs::entities(["file:a"]),
        })
        .unwrap()
    }

    #[test]
    fn append_enforces_chain() {
        let log = InMemoryStepLog::new();
        let s0 = step(0, None, StepType::TrajectoryStarted);
        let s1 = step(1, Some(s0.step_id.clone()), StepType::ToolCalled);
        assert!(matches!(
            log.append(s1.clone().into()),
            Err(StorageError::ChainConflict { .. })
        ));
        log.append(s0.clone().into()).unwrap();
        assert_eq!(log.append(s1.clone().into()).unwrap(), AppendReceipt::Appended { offset: 1 });

        let tail = log.chain_tail(&s0.trajectory_id).unwrap().unwrap();
        assert_eq!(tail.next_seq, 2);
        assert_eq!(tail.last_step_id, s1.step_id);
    }

    #[test]
    fn reappend_is_idempotent() {
        let log = InMemoryStepLog::new();
        let s0 = step(0, None, StepType::TrajectoryStarted);
        log.append(s0.clone().into()).unwrap();
        assert_eq!(log.append(s0.into()).unwrap(), AppendReceipt::Duplicate { offset: 0 });
        assert_eq!(log.len().unwrap(), 1);
    }

    #[test]
    fn append_rejects_forked_chain_and_tampered_id() {
        let log = InMemoryStepLog::new();
        let s0 = step(0, None, StepType::TrajectoryStarted);
        log.append(s0.clone().into()).unwrap();

        let forked = step_with(0, None, StepType::TrajectoryStarted, json!({"trigger": "other"}));
        assert!(matches!(
            log.append(forked.into()),
            Err(StorageError::ChainConflict { .. })
        ));

        let s1 = step(1, Some(s0.step_id.clone()), StepType::ToolCalled);
        let mut tampered = s1;
        tampered.payload = json!({"tool": "rm"});
        assert!(matches!(
            log.append(tampered.into()),
            Err(StorageError::ChainConflict { .. })
        ));
    }

    #[test]
    fn same_id_with_different_content_is_rejected() {
        let log = InMemoryStepLog::new();
        let s0 = step(0, None, StepType::TrajectoryStarted);
        log.append(s0.clone().into()).unwrap();

        // step_id does not cover refs, so this keeps the id but changes the entry.
        let mut altered = s0.clone();
        altered.refs = Refs::entities(["file:other"]);
        assert_eq!(altered.recompute_id(), s0.step_id);
        assert!(matches!(
            log.append(altered.into()),
            Err(StorageError::DuplicateKey(_))
        ));
        assert_eq!(log.len().unwrap(), 1);
        assert_eq!(log.get_step(&s0.step_id).unwrap(), Some(s0));
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let log = InMemoryStepLog::new();
        let s0 = step(0, None, StepType::TrajectoryStarted);
        let s1 = step(1, Some(s0.step_id.clone()), StepType::ToolCalled);
        let gap = step(5, Some(s1.step_id.clone()), StepType::ToolCalled);

        let err = log
            .append_batch(vec![s0.clone().into(), s1.clone().into(), gap.into()])
            .unwrap_err();
        assert!(matches!(err, StorageError::ChainConflict { step_seq: 5, .. }));
        assert_eq!(log.len().unwrap(), 0);
        assert_eq!(log.chain_tail(&s0.trajectory_id).unwrap(), None);

        // Later entries may build on earlier ones in the same batch.
        let receipts = log
            .append_batch(vec![s0.clone().into(), s1.clone().into(), s0.clone().into()])
            .unwrap();
        assert_eq!(
            receipts,
            vec![
                AppendReceipt::Appended { offset: 0 },
                AppendReceipt::Appended { offset: 1 },
                AppendReceipt::Duplicate { offset: 0 },
            ]
        );
        assert_eq!(log.chain_tail(&s0.trajectory_id).unwrap().unwrap().next_seq, 2);
    }

    #[test]
    fn lookups_by_id_and_position() {
        let log = InMemoryStepLog::new();
        let s0 = step(0, None, StepType::TrajectoryStarted);
        let s1 = step(1, Some(s0.step_id.clone()), StepType::ToolCalled);
        log.append(s0.clone().into()).unwrap();
        log.append(s1.clone().into()).unwrap();

        assert_eq!(log.get_step(&s1.step_id).unwrap(), Some(s1.clone()));
        assert_eq!(log.get_step_at(&s0.trajectory_id, 0).unwrap(), Some(s0.clone()));
        assert_eq!(log.get_step_at(&s0.trajectory_id, 5).unwrap(), None);
        assert_eq!(log.trajectory_steps(&s0.trajectory_id).unwrap(), vec![s0, s1]);
    }

    #[test]
    fn stream_is_resumable() {
        let log = InMemoryStepLog::new();
        let s0 = step(0, None, StepType::TrajectoryStarted);
        let outcome = build_outcome(OutcomeInput::for_trajectory(
            s0.trajectory_id.clone(),
            OutcomeKind::Success,
            Utc::now(),
        ))
        .unwrap();
        log.append(s0.into()).unwrap();
        log.append(outcome.clone().into()).unwrap();
        assert!(log.append(outcome.into()).unwrap().is_duplicate());

        let all: Vec<_> = log.stream().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(all.len(), 2);
        let rest: Vec<_> = log.stream_from(1).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(rest.len(), 1);
        assert!(rest[0].as_outcome().is_some());
    }

    #[test]
    fn command_log_claims_records_and_releases() {
        let log = InMemoryCommandLog::new();
        assert_eq!(log.try_start("k1", "start").unwrap(), CommandStart::Started);
        assert_eq!(log.try_start("k1", "start").unwrap(), CommandStart::InFlight);

        log.release("k1").unwrap();
        assert_eq!(log.try_start("k1", "start").unwrap(), CommandStart::Started);

        let record = CommandRecord {
            idempotency_key: "k1".to_string(),
            command_name: "start".to_string(),
            status: CommandStatus::Applied,
            produced: Vec::new(),
            recorded_at: Utc::now(),
        };
        log.record_outcome(record.clone()).unwrap();
        assert_eq!(log.try_start("k1", "start").unwrap(), CommandStart::Recorded(record.clone()));
        assert_eq!(log.lookup("k1").unwrap(), Some(record));
        assert!(matches!(
            log.try_start("k1", "end"),
            Err(StorageError::DuplicateKey(_))
        ));
    }
}
