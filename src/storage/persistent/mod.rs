//! Persistent storage backend for trajlog.
//!
//! This module provides a durable, crash-tolerant append-only log with:
//! - Length-prefixed records, CRC32-checked over length and payload
//! - Truncated-tail recovery on open
//! - All-or-nothing batch appends, rolled back on a failed write
//! - Streaming reads that never buffer the whole file
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 FileStepLog                  │
//! ├──────────────────────────────────────────────┤
//! │  File (one write per batch) ChainIndex (RAM) │
//! │            │                     │           │
//! │            └──────── codec ──────┘           │
//! └──────────────────────────────────────────────┘
//! ```

mod codec;
mod file_log;

pub use file_log::{FileStepLog, PersistentConfig};
