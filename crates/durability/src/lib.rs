//! Durability layer for the Amber transaction engine
//!
//! The redo log is the only on-disk artifact the engine produces directly.
//! Each record is a transaction id plus an opaque operation buffer produced
//! by the transaction's undo log at commit time; replay reconstructs
//! committed map state before new transactions begin.
//!
//! - `record`: the framed, CRC-checked record format
//! - `redo_log`: the append-only log file
//! - `sync`: the log sync service and its three sync policies

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod record;
pub mod redo_log;
pub mod sync;

pub use record::RedoLogRecord;
pub use redo_log::RedoLog;
pub use sync::{LogSyncService, SyncCompletion, SyncMode};
