//! Optimistic multi-version transaction engine
//!
//! Transactions stage writes as pending versions on lockable cells, commit
//! by promoting them in undo-log order, and roll back by unwinding the same
//! log. Contention is handled without a global lock manager: each cell
//! carries its owner id, each transaction carries a lock-free chain of the
//! transactions blocked on it, and the holder's finalize sweep wakes every
//! waiter in one atomic step.
//!
//! Durability rides on the `amber-durability` redo log: commit serializes
//! the transaction's staged operations into one record, and a restarted
//! engine replays committed records into durable maps as they are reopened.
//!
//! - `engine`: transaction factory, registry, id/timestamp counter
//! - `transaction`: lifecycle, savepoints, commit paths, wait protocol
//! - `map`: per-transaction map views with blocking lock acquisition
//! - `value`: lockable versioned cells
//! - `undo`: the per-transaction undo log and redo-buffer encoding
//! - `chain`: lock-free wait chains and wait listeners
//! - `object_lock`: coarse exclusive locks for schema operations

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chain;
pub mod engine;
pub mod map;
pub mod object_lock;
pub mod transaction;
pub mod undo;
pub mod value;

pub use chain::{SyncWaitListener, WaitChain, WaitListener, WaitingTransaction};
pub use engine::{EngineConfig, TransactionEngine};
pub use map::{RowLockAttempt, TransactionMap};
pub use object_lock::{DbObjectKind, LockHandler, ObjectLock};
pub use transaction::{
    CommitCallback, LockWaitResult, Transaction, TransactionStatus,
};
pub use undo::{decode_redo_buffer, RedoOp, UndoLog, UndoRecord};
pub use value::{TransactionalValue, TryLockResult};
