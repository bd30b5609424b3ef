//! Amber: an optimistic multi-version transaction engine.
//!
//! This facade re-exports the public surface of the member crates:
//!
//! - [`amber_core`]: keys, values, errors and the storage traits
//! - [`amber_durability`]: the redo log and its sync service
//! - [`amber_txn`]: the transaction engine itself
//!
//! # Example
//!
//! ```
//! use amber::{EngineConfig, Key, MemoryStorage, TransactionEngine, Value};
//!
//! # fn main() -> amber::Result<()> {
//! let engine = TransactionEngine::new(EngineConfig::default())?;
//! let storage = MemoryStorage::new();
//!
//! let txn = engine.begin_transaction();
//! let map = txn.open_map("accounts", &storage)?;
//! map.put(Key::from("alice"), Value::from(100))?;
//! txn.commit()?;
//!
//! let reader = engine.begin_transaction();
//! let map = reader.open_map("accounts", &storage)?;
//! assert_eq!(map.get(&Key::from("alice"))?, Some(Value::from(100)));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use amber_core::{
    AmberError, IsolationLevel, Key, MemoryMap, MemoryStorage, Result, Storage, StorageMap, Value,
};
pub use amber_durability::{LogSyncService, RedoLogRecord, SyncMode};
pub use amber_txn::{
    DbObjectKind, EngineConfig, ObjectLock, SyncWaitListener, Transaction, TransactionEngine,
    TransactionMap, TransactionStatus, TransactionalValue, WaitListener,
};
