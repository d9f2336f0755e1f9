//! Chain index shared by log backends.
//!
//! The log itself is an arena of immutable entries addressed by offset; the
//! chain is never stored as links between records. This index maps
//! `(trajectory_id, step_seq)` and `step_id` to arena offsets and tracks each
//! trajectory's tail so appends can be checked in O(1).

use std::collections::HashMap;
use std::fmt;

use crate::entry::LogEntry;
use crate::hash::canonical_hash;
use crate::ids::{OutcomeId, StepId, TrajectoryId};
use crate::step::{Step, StepType};

use super::traits::{ChainTail, StorageError};

const ENTRY_DOMAIN: &str = "trajlog.entry.v1";

/// Canonical hash of a whole entry, used to tell a true re-append from a
/// different entry that reuses an id.
pub(crate) type Fingerprint = blake3::Hash;

pub(crate) fn fingerprint(entry: &LogEntry) -> Result<Fingerprint, StorageError> {
    canonical_hash(ENTRY_DOMAIN, entry).map_err(|e| StorageError::SerializationError(e.to_string()))
}

/// Whether an entry may be appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    New(Fingerprint),
    Duplicate(u64),
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u64,
    fingerprint: Fingerprint,
}

#[derive(Debug, Default)]
pub(crate) struct ChainIndex {
    tails: HashMap<TrajectoryId, ChainTail>,
    positions: HashMap<TrajectoryId, Vec<u64>>,
    steps: HashMap<StepId, Slot>,
    outcomes: HashMap<OutcomeId, Slot>,
}

fn conflict(trajectory_id: &TrajectoryId, step_seq: u64, reason: impl Into<String>) -> StorageError {
    StorageError::ChainConflict {
        trajectory_id: trajectory_id.clone(),
        step_seq,
        reason: reason.into(),
    }
}

fn existing<I: fmt::Display>(
    slot: Slot,
    fingerprint: Fingerprint,
    kind: &str,
    id: &I,
) -> Result<Admission, StorageError> {
    if slot.fingerprint == fingerprint {
        Ok(Admission::Duplicate(slot.offset))
    } else {
        Err(StorageError::DuplicateKey(format!(
            "{kind} {id} is already stored at offset {} with different content",
            slot.offset
        )))
    }
}

/// The index as seen by a batch: committed state plus the entries admitted
/// earlier in the same batch.
struct Staged<'a> {
    committed: &'a ChainIndex,
    tails: HashMap<TrajectoryId, ChainTail>,
    steps: HashMap<StepId, Slot>,
    outcomes: HashMap<OutcomeId, Slot>,
}

impl<'a> Staged<'a> {
    fn new(committed: &'a ChainIndex) -> Self {
        Self {
            committed,
            tails: HashMap::new(),
            steps: HashMap::new(),
            outcomes: HashMap::new(),
        }
    }

    fn tail(&self, trajectory_id: &TrajectoryId) -> Option<&ChainTail> {
        self.tails
            .get(trajectory_id)
            .or_else(|| self.committed.tails.get(trajectory_id))
    }

    fn check(&self, entry: &LogEntry) -> Result<Admission, StorageError> {
        let fp = fingerprint(entry)?;
        match entry {
            LogEntry::Step(step) => {
                let stored = self
                    .steps
                    .get(&step.step_id)
                    .or_else(|| self.committed.steps.get(&step.step_id));
                if let Some(&slot) = stored {
                    return existing(slot, fp, "step", &step.step_id);
                }
                if step.recompute_id() != step.step_id {
                    return Err(conflict(
                        &step.trajectory_id,
                        step.step_seq,
                        "step_id does not match content",
                    ));
                }
                match self.tail(&step.trajectory_id) {
                    None => {
                        if step.step_seq != 0 || step.prev_step_hash.is_some() {
                            return Err(conflict(
                                &step.trajectory_id,
                                step.step_seq,
                                "first step must have step_seq 0 and no prev_step_hash",
                            ));
                        }
                    }
                    Some(tail) => {
                        if tail.ended {
                            return Err(conflict(
                                &step.trajectory_id,
                                step.step_seq,
                                "trajectory has ended",
                            ));
                        }
                        if step.step_seq != tail.next_seq {
                            return Err(conflict(
                                &step.trajectory_id,
                                step.step_seq,
                                format!("expected step_seq {}", tail.next_seq),
                            ));
                        }
                        if step.prev_step_hash.as_ref() != Some(&tail.last_step_id) {
                            return Err(conflict(
                                &step.trajectory_id,
                                step.step_seq,
                                "prev_step_hash does not match chain tail",
                            ));
                        }
                    }
                }
                Ok(Admission::New(fp))
            }
            LogEntry::Outcome(outcome) => {
                let stored = self
                    .outcomes
                    .get(&outcome.outcome_id)
                    .or_else(|| self.committed.outcomes.get(&outcome.outcome_id));
                match stored {
                    Some(&slot) => existing(slot, fp, "outcome", &outcome.outcome_id),
                    None => Ok(Admission::New(fp)),
                }
            }
        }
    }

    fn stage(&mut self, entry: &LogEntry, offset: u64, fingerprint: Fingerprint) {
        let slot = Slot { offset, fingerprint };
        match entry {
            LogEntry::Step(step) => {
                self.steps.insert(step.step_id.clone(), slot);
                self.tails.insert(step.trajectory_id.clone(), tail_after(step));
            }
            LogEntry::Outcome(outcome) => {
                self.outcomes.insert(outcome.outcome_id, slot);
            }
        }
    }
}

fn tail_after(step: &Step) -> ChainTail {
    ChainTail {
        next_seq: step.step_seq.saturating_add(1),
        last_step_id: step.step_id.clone(),
        ended: step.step_type == StepType::TrajectoryEnded,
    }
}

impl ChainIndex {
    /// Checks whether `entry` extends the log.
    ///
    /// Re-appending a stored entry is a duplicate; reusing a stored id for
    /// different content is a `DuplicateKey` error.
    pub(crate) fn admit(&self, entry: &LogEntry) -> Result<Admission, StorageError> {
        Staged::new(self).check(entry)
    }

    /// Checks a batch as if its entries were appended one by one starting at
    /// offset `first`. Nothing is recorded; any failure rejects the batch.
    pub(crate) fn admit_batch(&self, entries: &[LogEntry], first: u64) -> Result<Vec<Admission>, StorageError> {
        let mut staged = Staged::new(self);
        let mut next = first;
        let mut admissions = Vec::with_capacity(entries.len());
        for entry in entries {
            let admission = staged.check(entry)?;
            if let Admission::New(fp) = admission {
                staged.stage(entry, next, fp);
                next = next.saturating_add(1);
            }
            admissions.push(admission);
        }
        Ok(admissions)
    }

    /// Records an admitted entry at `offset`.
    pub(crate) fn record(&mut self, entry: &LogEntry, offset: u64, fingerprint: Fingerprint) {
        let slot = Slot { offset, fingerprint };
        match entry {
            LogEntry::Step(step) => {
                self.steps.insert(step.step_id.clone(), slot);
                self.positions
                    .entry(step.trajectory_id.clone())
                    .or_default()
                    .push(offset);
                self.tails.insert(step.trajectory_id.clone(), tail_after(step));
            }
            LogEntry::Outcome(outcome) => {
                self.outcomes.insert(outcome.outcome_id, slot);
            }
        }
    }

    pub(crate) fn tail(&self, trajectory_id: &TrajectoryId) -> Option<ChainTail> {
        self.tails.get(trajectory_id).cloned()
    }

    pub(crate) fn step_offset(&self, step_id: &StepId) -> Option<u64> {
        self.steps.get(step_id).map(|slot| slot.offset)
    }

    pub(crate) fn offset_at(&self, trajectory_id: &TrajectoryId, step_seq: u64) -> Option<u64> {
        let idx = usize::try_from(step_seq).ok()?;
        self.positions.get(trajectory_id)?.get(idx).copied()
    }

    pub(crate) fn trajectory_offsets(&self, trajectory_id: &TrajectoryId) -> &[u64] {
        self.positions.get(trajectory_id).map_or(&[], Vec::as_slice)
    }
}
