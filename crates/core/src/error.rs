//! Error types for the Amber transaction engine
//!
//! All user-visible failures funnel through `AmberError`. We use `thiserror`
//! for automatic `Display` and `Error` trait implementations.
//!
//! Deadlock and lock-timeout errors carry enough identification (transaction
//! names and contended keys) to diagnose the conflict without extra logging.

use crate::types::Key;
use std::io;
use thiserror::Error;

/// Result type alias for Amber operations
pub type Result<T> = std::result::Result<T, AmberError>;

/// Error types for the Amber transaction engine
#[derive(Debug, Error)]
pub enum AmberError {
    /// Operation attempted on a transaction that has already been finalized
    #[error("transaction is closed")]
    TransactionClosed,

    /// Unknown or stale savepoint name
    #[error("savepoint is invalid: {name}")]
    SavepointInvalid {
        /// The savepoint name that failed to resolve
        name: String,
    },

    /// Lock wait exceeded the configured threshold without a cycle being found
    #[error(
        "lock timeout: transaction {waiter} waits for transaction {holder} on key {key:?}"
    )]
    LockTimeout {
        /// Name of the blocked transaction
        waiter: String,
        /// Name of the transaction holding the lock
        holder: String,
        /// The contended key
        key: Key,
    },

    /// Mutual (length-2) wait cycle detected
    #[error(
        "deadlock: transaction {waiter} waits for transaction {holder} on key {waiter_key:?}; \
         transaction {holder} waits for transaction {waiter} on key {holder_key:?}"
    )]
    Deadlock {
        /// Name of the transaction that ran the check
        waiter: String,
        /// Name of the transaction blocking it
        holder: String,
        /// Key the checking transaction is waiting on
        waiter_key: Key,
        /// Key the blocking transaction is waiting on in return
        holder_key: Key,
    },

    /// I/O error from the redo log or storage
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Storage collaborator error
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<bincode::Error> for AmberError {
    fn from(e: bincode::Error) -> Self {
        AmberError::Serialization(e.to_string())
    }
}
