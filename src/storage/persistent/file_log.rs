//! Append-only file-backed step log.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [RECORD 1: codec-encoded LogEntry]
//! [RECORD 2: codec-encoded LogEntry]
//! ...
//! ```
//!
//! On open the file is scanned once to rebuild the chain index. A truncated or
//! corrupted tail (crash mid-write) is cut off at the last valid record.
//!
//! Each append or batch is encoded in full and handed to the file in one
//! write. If the write or sync fails the file is cut back to the last
//! committed record, so the in-memory index never trails the bytes on disk.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use tracing::{debug, warn};

use crate::entry::LogEntry;
use crate::ids::{StepId, TrajectoryId};
use crate::step::Step;
use crate::storage::index::{Admission, ChainIndex, Fingerprint};
use crate::storage::traits::{AppendReceipt, ChainTail, EntryStream, StepLog, StorageError};

use super::codec::{self, FrameError};

fn io_err(context: &str, e: &std::io::Error) -> StorageError {
    StorageError::Io(format!("{context}: {e}"))
}

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn to_index(offset: u64) -> Result<usize, StorageError> {
    usize::try_from(offset).map_err(|_| StorageError::BackendError(format!("offset {offset} out of range")))
}

/// Configuration for the file-backed log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentConfig {
    /// Whether to fsync after every append (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self { sync_on_write: true }
    }
}

#[derive(Debug, Default)]
struct FileIndex {
    chain: ChainIndex,
    /// Byte position of each record, by entry offset.
    positions: Vec<u64>,
    /// Byte position where the next record will be written.
    end: u64,
}

/// Append-only step log stored in a single file.
#[derive(Debug)]
pub struct FileStepLog {
    path: PathBuf,
    writer: Mutex<File>,
    index: RwLock<FileIndex>,
    config: PersistentConfig,
}

impl FileStepLog {
    /// Open or create a log file.
    pub fn open(path: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| io_err("open log", &e))?;

        let len = file.metadata().map_err(|e| io_err("stat log", &e))?.len();
        let index = if exists && len >= codec::HEADER_LEN {
            let index = Self::scan(path)?;
            if index.end < len {
                warn!(
                    path = %path.display(),
                    valid_bytes = index.end,
                    file_bytes = len,
                    "truncating corrupted log tail"
                );
                file.set_len(index.end).map_err(|e| io_err("truncate log", &e))?;
                file.sync_all().map_err(|e| io_err("sync log", &e))?;
            }
            index
        } else {
            file.set_len(0).map_err(|e| io_err("truncate log", &e))?;
            codec::write_header(&mut file).map_err(|e| io_err("write header", &e))?;
            if config.sync_on_write {
                file.sync_all().map_err(|e| io_err("sync log", &e))?;
            }
            FileIndex {
                end: codec::HEADER_LEN,
                ..FileIndex::default()
            }
        };

        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| io_err("reopen log", &e))?;

        debug!(path = %path.display(), entries = index.positions.len(), "opened step log");

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(file),
            index: RwLock::new(index),
            config,
        })
    }

    fn scan(path: &Path) -> Result<FileIndex, StorageError> {
        let file = File::open(path).map_err(|e| io_err("open log", &e))?;
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader).map_err(|e| StorageError::Corrupted {
            offset: 0,
            reason: e.to_string(),
        })?;

        let mut index = FileIndex {
            end: codec::HEADER_LEN,
            ..FileIndex::default()
        };
        loop {
            match codec::decode::<LogEntry>(&mut reader) {
                Ok((entry, consumed)) => {
                    if let Admission::New(fingerprint) = index.chain.admit(&entry)? {
                        let offset = index.positions.len() as u64;
                        index.chain.record(&entry, offset, fingerprint);
                        index.positions.push(index.end);
                    }
                    index.end = index.end.saturating_add(consumed);
                }
                Err(FrameError::Truncated) => break,
                Err(FrameError::Io(e)) => return Err(io_err("scan log", &e)),
                Err(e @ FrameError::Corrupt(_)) => {
                    warn!(byte_offset = index.end, error = %e, "corrupted log record, stopping scan");
                    break;
                }
            }
        }
        Ok(index)
    }

    fn read_at(&self, position: u64) -> Result<LogEntry, StorageError> {
        let mut file = File::open(&self.path).map_err(|e| io_err("open log", &e))?;
        file.seek(SeekFrom::Start(position))
            .map_err(|e| io_err("seek log", &e))?;
        let mut reader = BufReader::new(file);
        codec::decode::<LogEntry>(&mut reader)
            .map(|(entry, _)| entry)
            .map_err(|e| StorageError::Corrupted {
                offset: position,
                reason: e.to_string(),
            })
    }

    fn step_at(&self, position: u64) -> Result<Option<Step>, StorageError> {
        Ok(match self.read_at(position)? {
            LogEntry::Step(step) => Some(step),
            LogEntry::Outcome(_) => None,
        })
    }

    /// Writes `frames` at the committed end of the file, cutting the file
    /// back to that end if anything fails.
    fn write_frames(&self, file: &mut File, end: u64, frames: &[u8]) -> Result<(), StorageError> {
        let result = file
            .seek(SeekFrom::Start(end))
            .and_then(|_| file.write_all(frames))
            .and_then(|()| {
                if self.config.sync_on_write {
                    file.sync_all()
                } else {
                    Ok(())
                }
            });
        if let Err(e) = result {
            warn!(path = %self.path.display(), committed_bytes = end, error = %e, "append failed, rolling back");
            if let Err(rollback) = file.set_len(end) {
                warn!(path = %self.path.display(), error = %rollback, "log rollback failed");
            }
            return Err(io_err("append", &e));
        }
        Ok(())
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Sequential reader over records, one decode per item.
struct FileCursor {
    reader: BufReader<File>,
    position: u64,
    end: u64,
    done: bool,
}

impl Iterator for FileCursor {
    type Item = Result<LogEntry, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.position >= self.end {
            return None;
        }
        match codec::decode::<LogEntry>(&mut self.reader) {
            Ok((entry, consumed)) => {
                self.position = self.position.saturating_add(consumed);
                Some(Ok(entry))
            }
            Err(e) => {
                self.done = true;
                Some(Err(StorageError::Corrupted {
                    offset: self.position,
                    reason: e.to_string(),
                }))
            }
        }
    }
}

impl StepLog for FileStepLog {
    fn append(&self, entry: LogEntry) -> Result<AppendReceipt, StorageError> {
        let mut receipts = self.append_batch(vec![entry])?;
        receipts
            .pop()
            .ok_or_else(|| StorageError::BackendError("empty append receipt".to_string()))
    }

    fn append_batch(&self, entries: Vec<LogEntry>) -> Result<Vec<AppendReceipt>, StorageError> {
        let mut file = self.writer.lock().map_err(|_| lock_err("file.append"))?;
        let mut index = self.index.write().map_err(|_| lock_err("file.append"))?;

        let admissions = index.chain.admit_batch(&entries, index.positions.len() as u64)?;

        let mut frames = Vec::new();
        let mut pending: Vec<(&LogEntry, u64, Fingerprint)> = Vec::new();
        let mut receipts = Vec::with_capacity(entries.len());
        let mut next_offset = index.positions.len() as u64;
        let mut position = index.end;
        for (entry, admission) in entries.iter().zip(admissions) {
            match admission {
                Admission::Duplicate(offset) => receipts.push(AppendReceipt::Duplicate { offset }),
                Admission::New(fingerprint) => {
                    let encoded =
                        codec::encode(entry).map_err(|e| StorageError::SerializationError(e.to_string()))?;
                    pending.push((entry, position, fingerprint));
                    position = position.saturating_add(encoded.len() as u64);
                    frames.extend_from_slice(&encoded);
                    receipts.push(AppendReceipt::Appended { offset: next_offset });
                    next_offset = next_offset.saturating_add(1);
                }
            }
        }
        if frames.is_empty() {
            return Ok(receipts);
        }
        self.write_frames(&mut file, index.end, &frames)?;

        for (entry, entry_position, fingerprint) in pending {
            let offset = index.positions.len() as u64;
            index.chain.record(entry, offset, fingerprint);
            index.positions.push(entry_position);
        }
        index.end = position;
        Ok(receipts)
    }

    fn stream_from(&self, offset: u64) -> Result<EntryStream<'_>, StorageError> {
        let (start, end) = {
            let index = self.index.read().map_err(|_| lock_err("file.stream"))?;
            let start = index
                .positions
                .get(to_index(offset)?)
                .copied()
                .unwrap_or(index.end);
            (start, index.end)
        };
        let mut file = File::open(&self.path).map_err(|e| io_err("open log", &e))?;
        file.seek(SeekFrom::Start(start))
            .map_err(|e| io_err("seek log", &e))?;
        Ok(Box::new(FileCursor {
            reader: BufReader::new(file),
            position: start,
            end,
            done: false,
        }))
    }

    fn len(&self) -> Result<u64, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("file.len"))?;
        Ok(index.positions.len() as u64)
    }

    fn chain_tail(&self, trajectory_id: &TrajectoryId) -> Result<Option<ChainTail>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("file.chain_tail"))?;
        Ok(index.chain.tail(trajectory_id))
    }

    fn get_step(&self, step_id: &StepId) -> Result<Option<Step>, StorageError> {
        let position = {
            let index = self.index.read().map_err(|_| lock_err("file.get_step"))?;
            index
                .chain
                .step_offset(step_id)
                .and_then(|offset| usize::try_from(offset).ok())
                .and_then(|i| index.positions.get(i).copied())
        };
        match position {
            Some(position) => self.step_at(position),
            None => Ok(None),
        }
    }

    fn get_step_at(&self, trajectory_id: &TrajectoryId, step_seq: u64) -> Result<Option<Step>, StorageError> {
        let position = {
            let index = self.index.read().map_err(|_| lock_err("file.get_step_at"))?;
            index
                .chain
                .offset_at(trajectory_id, step_seq)
                .and_then(|offset| usize::try_from(offset).ok())
                .and_then(|i| index.positions.get(i).copied())
        };
        match position {
            Some(position) => self.step_at(position),
            None => Ok(None),
        }
    }

    fn trajectory_steps(&self, trajectory_id: &TrajectoryId) -> Result<Vec<Step>, StorageError> {
        let positions: Vec<u64> = {
            let index = self.index.read().map_err(|_| lock_err("file.trajectory_steps"))?;
            index
                .chain
                .trajectory_offsets(trajectory_id)
                .iter()
                .filter_map(|&offset| usize::try_from(offset).ok())
                .filter_map(|i| index.positions.get(i).copied())
                .collect()
        };
        let mut out = Vec::with_capacity(positions.len());
        for position in positions {
            if let Some(step) = self.step_at(position)? {
                out.push(step);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::Refs;
    use crate::step::{build_step, Producer, StepInput, StepType};
    use chrono::Utc;
    use serde_json::json;
    use tempfile::tempdir;

    fn started(trajectory: &str) -> Step {
        build_step(StepInput {
            trajectory_id: TrajectoryId::new(trajectory).unwrap(),
            step_seq: 0,
            prev_step_hash: None,
            step_type: StepType::TrajectoryStarted,
            producer: Producer::Host,
            timestamp: Utc::now(),
            correlation_id: "c".to_string(),
            causation: None,
            payload: json!({"trigger": "test"}),
            refs: Refs::new(),
        })
        .unwrap()
    }

    #[test]
    fn append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("steps.log");
        let s0 = started("t1");
        {
            let log = FileStepLog::open(&path, PersistentConfig::default()).unwrap();
            log.append(s0.clone().into()).unwrap();
            log.append(started("t2").into()).unwrap();
        }

        let log = FileStepLog::open(&path, PersistentConfig { sync_on_write: false }).unwrap();
        assert_eq!(log.len().unwrap(), 2);
        assert_eq!(log.get_step(&s0.step_id).unwrap(), Some(s0.clone()));
        assert!(log.append(s0.into()).unwrap().is_duplicate());

        let entries: Vec<_> = log.stream_from(1).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(entries.len(), 1);
    }

    fn next_step(prev: &Step, seq: u64) -> Step {
        build_step(StepInput {
            trajectory_id: prev.trajectory_id.clone(),
            step_seq: seq,
            prev_step_hash: Some(prev.step_id.clone()),
            step_type: StepType::ToolCalled,
            producer: Producer::Host,
            timestamp: Utc::now(),
            correlation_id: "c".to_string(),
            causation: None,
            payload: json!({"tool": "ls"}),
            refs: Refs::new(),
        })
        .unwrap()
    }

    #[test]
    fn rejected_batch_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("steps.log");
        let log = FileStepLog::open(&path, PersistentConfig::default()).unwrap();
        let s0 = started("t1");
        let s1 = next_step(&s0, 1);
        let bytes_before = std::fs::metadata(&path).unwrap().len();

        let err = log
            .append_batch(vec![s0.clone().into(), next_step(&s1, 4).into()])
            .unwrap_err();
        assert!(matches!(err, StorageError::ChainConflict { .. }));
        assert_eq!(log.len().unwrap(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), bytes_before);

        let receipts = log.append_batch(vec![s0.clone().into(), s1.clone().into()]).unwrap();
        assert_eq!(receipts[1], AppendReceipt::Appended { offset: 1 });
        drop(log);

        let log = FileStepLog::open(&path, PersistentConfig::default()).unwrap();
        assert_eq!(log.trajectory_steps(&s0.trajectory_id).unwrap(), vec![s0, s1]);
    }

    #[test]
    fn failed_write_leaves_log_consistent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("steps.log");
        let log = FileStepLog::open(&path, PersistentConfig::default()).unwrap();
        let s0 = started("t1");
        log.append(s0.clone().into()).unwrap();
        let end = log.index.read().unwrap().end;

        let mut read_only = File::open(&path).unwrap();
        let err = log.write_frames(&mut read_only, end, b"partial").unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), end);

        let s1 = next_step(&s0, 1);
        log.append(s1.clone().into()).unwrap();
        drop(log);
        let log = FileStepLog::open(&path, PersistentConfig::default()).unwrap();
        assert_eq!(log.trajectory_steps(&s0.trajectory_id).unwrap(), vec![s0, s1]);
    }
}
