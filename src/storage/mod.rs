//! Storage capabilities for trajlog.
//!
//! These traits define the abstract interface for the append-only log and
//! the command log. An in-memory arena backend is always available; a
//! file-backed log is behind the `persistent` feature.

mod index;
mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::{InMemoryCommandLog, InMemoryStepLog};
pub use traits::{
    AppendReceipt, ChainTail, CommandLog, CommandRecord, CommandStart, CommandStatus, EntryRef,
    EntryStream, StepLog, StorageError,
};
