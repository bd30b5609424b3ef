//! Transactional map views
//!
//! A `TransactionMap` binds one transaction to one storage map whose values
//! are versioned cells. Reads follow the transaction's isolation level
//! (read committed by default); writes take the cell's exclusive lock first,
//! blocking the calling thread until the lock is won, the wait times out, or
//! a deadlock is detected.
//!
//! The lock loop is optimistic. A failed attempt enqueues the transaction in
//! the holder's wait chain and parks; the holder's finalize sweep (or a
//! targeted wake) unparks it and the attempt repeats. Enqueueing can race
//! with the holder finalizing, in which case the chain is already sealed and
//! the attempt simply repeats immediately.

use crate::chain::{SyncWaitListener, WaitListener};
use crate::transaction::{LockWaitResult, Transaction};
use crate::undo::UndoRecord;
use crate::value::{TransactionalValue, TryLockResult};
use amber_core::{IsolationLevel, Key, Result, StorageMap, Value};
use std::sync::Arc;

/// Outcome of one non-blocking lock attempt on a key.
pub enum RowLockAttempt {
    /// Lock held by the calling transaction; the cell is returned
    Acquired(Arc<TransactionalValue>),
    /// Enqueued behind the holder; wait for the listener
    Wait,
    /// Transient race with a finalizing holder; attempt again
    Retry,
}

/// One transaction's view of one map.
pub struct TransactionMap {
    txn: Arc<Transaction>,
    map: Arc<dyn StorageMap<Arc<TransactionalValue>>>,
}

impl TransactionMap {
    pub(crate) fn new(
        txn: Arc<Transaction>,
        map: Arc<dyn StorageMap<Arc<TransactionalValue>>>,
    ) -> Self {
        TransactionMap { txn, map }
    }

    /// The underlying map's name
    pub fn name(&self) -> &str {
        self.map.name()
    }

    /// The owning transaction
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.txn
    }

    /// Read a value as seen by this transaction.
    ///
    /// Under read committed (and above) that is the transaction's own
    /// pending version for cells it has locked, otherwise the last committed
    /// version. Read uncommitted sees any pending version.
    pub fn get(&self, key: &Key) -> Result<Option<Value>> {
        self.txn.check_not_closed()?;
        let Some(cell) = self.map.get(key) else {
            return Ok(None);
        };
        let value = match self.txn.isolation_level() {
            IsolationLevel::ReadUncommitted => cell.read_dirty(),
            _ => cell.read_for(self.txn.id()),
        };
        Ok(value)
    }

    /// Stage a write under this transaction. Blocks for the exclusive lock.
    pub fn put(&self, key: Key, value: Value) -> Result<()> {
        self.write(key, Some(value))
    }

    /// Stage a write only if the key has no value visible to this
    /// transaction. Returns whether the insert happened.
    pub fn insert(&self, key: Key, value: Value) -> Result<bool> {
        self.txn.check_not_closed()?;
        let cell = self.lock_exclusive(&key)?;
        if cell.read_for(self.txn.id()).is_some() {
            return Ok(false);
        }
        let prior = cell.stage(Some(value.clone()));
        self.txn
            .append_undo(UndoRecord::new(self.map.name(), key, cell, prior, Some(value)));
        Ok(true)
    }

    /// Stage a delete under this transaction. Blocks for the exclusive lock.
    pub fn remove(&self, key: Key) -> Result<()> {
        self.write(key, None)
    }

    /// Whether `key` has a value visible to this transaction
    pub fn contains_key(&self, key: &Key) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn write(&self, key: Key, value: Option<Value>) -> Result<()> {
        self.txn.check_not_closed()?;
        let cell = self.lock_exclusive(&key)?;
        let prior = cell.stage(value.clone());
        self.txn
            .append_undo(UndoRecord::new(self.map.name(), key, cell, prior, value));
        Ok(())
    }

    /// One non-blocking exclusive-lock attempt on `key`.
    ///
    /// `Wait` means the transaction is enqueued in the holder's wait chain
    /// and `listener` fires when the holder finalizes. `Retry` means a
    /// holder finalized mid-attempt; call again.
    pub fn try_lock(&self, key: &Key, listener: &Arc<dyn WaitListener>) -> Result<RowLockAttempt> {
        self.txn.check_not_closed()?;
        let cell = self
            .map
            .get_or_insert_with(key, &mut || Arc::new(TransactionalValue::empty()));
        loop {
            match cell.try_exclusive_lock(self.txn.id()) {
                TryLockResult::Acquired => {
                    self.txn.record_row_lock(cell.clone());
                    return Ok(RowLockAttempt::Acquired(cell));
                }
                TryLockResult::AlreadyOwned => return Ok(RowLockAttempt::Acquired(cell)),
                TryLockResult::HeldBy(holder_id) => {
                    let Some(holder) = self.txn.engine().find_transaction(holder_id) else {
                        // Holder is finalizing; its unlock is imminent.
                        std::hint::spin_loop();
                        continue;
                    };
                    return Ok(match holder.add_waiting_transaction(
                        key.clone(),
                        &self.txn,
                        listener.clone(),
                    ) {
                        LockWaitResult::NeedWait => RowLockAttempt::Wait,
                        LockWaitResult::NeedRetry => RowLockAttempt::Retry,
                    });
                }
            }
        }
    }

    /// Acquire the exclusive lock on `key`, blocking the calling thread.
    ///
    /// Fails with [`amber_core::AmberError::LockTimeout`] or
    /// [`amber_core::AmberError::Deadlock`] per
    /// [`Transaction::check_timeout`].
    pub fn lock_exclusive(&self, key: &Key) -> Result<Arc<TransactionalValue>> {
        let listener = SyncWaitListener::new();
        let as_listener: Arc<dyn WaitListener> = listener.clone();
        loop {
            match self.try_lock(key, &as_listener)? {
                RowLockAttempt::Acquired(cell) => return Ok(cell),
                RowLockAttempt::Retry => continue,
                RowLockAttempt::Wait => loop {
                    let woken = listener.wait_for(self.txn.lock_timeout());
                    self.txn.check_timeout()?;
                    if woken || self.txn.waiting_for().is_none() {
                        break;
                    }
                    // Spurious wake while still blocked; park again.
                },
            }
        }
    }

    /// Shared-lock a key. Shared access never conflicts in this engine, so
    /// this always succeeds; it exists for symmetry with exclusive locking.
    pub fn try_shared_lock(&self, _key: &Key) -> bool {
        true
    }

    /// Visit committed entries in key order; absent (deleted) cells are
    /// skipped. Return `false` from the visitor to stop.
    pub fn for_each_committed(&self, visit: &mut dyn FnMut(&Key, &Value) -> bool) {
        self.map.for_each(&mut |key, cell| match cell.read_committed() {
            Some(value) => visit(key, &value),
            None => true,
        });
    }

    /// Number of keys with a committed version
    pub fn len(&self) -> usize {
        let mut count = 0;
        self.map.for_each(&mut |_, cell| {
            if cell.read_committed().is_some() {
                count += 1;
            }
            true
        });
        count
    }

    /// Whether no key has a committed version
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
