//! Transactions
//!
//! A transaction moves through three states: open, waiting (blocked on a
//! lock held by another transaction) and closed. Both commit and rollback
//! close it; a closed transaction rejects every further operation.
//!
//! Finalization order matters and is fixed: de-register from the engine (the
//! idempotence point), settle the undo log, mark closed, release row and
//! object locks, and only then sweep the wait chain. Waiters woken by the
//! sweep retry their lock attempt and find the cells free.
//!
//! Deadlock detection is deliberately shallow: when a lock wait times out the
//! waiter checks whether its blocker is in turn waiting on it. A length-2
//! cycle is reported as a deadlock with both keys named; longer cycles fall
//! out as lock timeouts when each participant's wait expires.

use crate::chain::{WaitChain, WaitListener, WaitingTransaction};
use crate::engine::TransactionEngine;
use crate::map::TransactionMap;
use crate::object_lock::ObjectLock;
use crate::undo::{UndoLog, UndoRecord};
use crate::value::TransactionalValue;
use amber_core::{AmberError, IsolationLevel, Key, Result, Storage};
use amber_durability::RedoLogRecord;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const STATUS_OPEN: u8 = 0;
const STATUS_WAITING: u8 = 1;
const STATUS_CLOSED: u8 = 2;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Accepting operations
    Open,
    /// Blocked on a lock held by another transaction
    Waiting,
    /// Committed or rolled back; terminal
    Closed,
}

impl TransactionStatus {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATUS_OPEN => TransactionStatus::Open,
            STATUS_WAITING => TransactionStatus::Waiting,
            _ => TransactionStatus::Closed,
        }
    }
}

/// Outcome of enqueueing behind a lock holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWaitResult {
    /// Enqueued; the waiter will be woken when the holder finalizes
    NeedWait,
    /// The holder finalized concurrently; retry the lock attempt now
    NeedRetry,
}

/// Completion callback for an asynchronous commit
pub type CommitCallback = Box<dyn FnOnce() + Send>;

struct TransactionBody {
    undo: UndoLog,
    savepoints: HashMap<String, usize>,
    row_locks: Vec<Arc<TransactionalValue>>,
    object_locks: Vec<Arc<ObjectLock>>,
}

/// A single transaction.
///
/// Created through [`TransactionEngine::begin_transaction`]; shared by
/// `Arc` across the threads that operate on it.
pub struct Transaction {
    engine: Arc<TransactionEngine>,
    id: u64,
    name: String,
    status: AtomicU8,
    isolation: Mutex<IsolationLevel>,
    auto_commit: AtomicBool,
    lock_timeout: Mutex<Duration>,
    commit_timestamp: AtomicU64,
    // Blocked-state mirror: id of the transaction this one waits on, and
    // when the wait started. Cleared by the waker.
    blocked_on: AtomicU64,
    wait_start: Mutex<Option<Instant>>,
    waiters: WaitChain,
    body: Mutex<TransactionBody>,
    commit_callback: Mutex<Option<CommitCallback>>,
}

impl Transaction {
    pub(crate) fn new(engine: Arc<TransactionEngine>, id: u64, host: Option<&str>) -> Self {
        let lock_timeout = engine.default_lock_timeout();
        Transaction {
            engine,
            id,
            name: format!("{}:{}", host.unwrap_or("0:0"), id),
            status: AtomicU8::new(STATUS_OPEN),
            isolation: Mutex::new(IsolationLevel::default()),
            auto_commit: AtomicBool::new(false),
            lock_timeout: Mutex::new(lock_timeout),
            commit_timestamp: AtomicU64::new(0),
            blocked_on: AtomicU64::new(0),
            wait_start: Mutex::new(None),
            waiters: WaitChain::new(),
            body: Mutex::new(TransactionBody {
                undo: UndoLog::new(),
                savepoints: HashMap::new(),
                row_locks: Vec::new(),
                object_locks: Vec::new(),
            }),
            commit_callback: Mutex::new(None),
        }
    }

    /// The transaction id; odd by construction
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Diagnostic name, `host:port:id` shaped
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The engine this transaction belongs to
    pub fn engine(&self) -> &Arc<TransactionEngine> {
        &self.engine
    }

    /// Current lifecycle state
    pub fn status(&self) -> TransactionStatus {
        TransactionStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    /// Whether the transaction has been finalized
    pub fn is_closed(&self) -> bool {
        self.status() == TransactionStatus::Closed
    }

    /// Commit timestamp; even, assigned at finalize. `None` while open or
    /// after a rollback.
    pub fn commit_timestamp(&self) -> Option<u64> {
        match self.commit_timestamp.load(Ordering::Acquire) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// The isolation level carried by this transaction
    pub fn isolation_level(&self) -> IsolationLevel {
        *self.isolation.lock()
    }

    /// Set the isolation level
    pub fn set_isolation_level(&self, level: IsolationLevel) {
        *self.isolation.lock() = level;
    }

    /// Whether the transaction is in auto-commit mode
    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::Acquire)
    }

    /// Set auto-commit mode. Informational for upstream layers; the engine
    /// itself never commits implicitly.
    pub fn set_auto_commit(&self, auto_commit: bool) {
        self.auto_commit.store(auto_commit, Ordering::Release);
    }

    /// The lock wait threshold for this transaction
    pub fn lock_timeout(&self) -> Duration {
        *self.lock_timeout.lock()
    }

    /// Override the lock wait threshold
    pub fn set_lock_timeout(&self, timeout: Duration) {
        *self.lock_timeout.lock() = timeout;
    }

    /// Id of the transaction currently blocking this one, if any
    pub fn waiting_for(&self) -> Option<u64> {
        match self.blocked_on.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub(crate) fn check_not_closed(&self) -> Result<()> {
        if self.is_closed() {
            Err(AmberError::TransactionClosed)
        } else {
            Ok(())
        }
    }

    fn set_status(&self, status: TransactionStatus) {
        let raw = match status {
            TransactionStatus::Open => STATUS_OPEN,
            TransactionStatus::Waiting => STATUS_WAITING,
            TransactionStatus::Closed => STATUS_CLOSED,
        };
        self.status.store(raw, Ordering::Release);
    }

    /// Open (or reopen) a transactional view over a named map.
    ///
    /// Durable maps get committed redo operations replayed into them the
    /// first time they are opened after a restart.
    pub fn open_map(
        &self,
        name: &str,
        storage: &dyn Storage<Arc<TransactionalValue>>,
    ) -> Result<TransactionMap> {
        self.check_not_closed()?;
        let me = self
            .engine
            .find_transaction(self.id)
            .ok_or(AmberError::TransactionClosed)?;
        let map = storage.open_map(name);
        if !map.is_in_memory() {
            self.engine.replay_into(map.as_ref());
        }
        Ok(TransactionMap::new(me, map))
    }

    // ------------------------------------------------------------------
    // Savepoints
    // ------------------------------------------------------------------

    /// Current undo-log position, usable with
    /// [`Transaction::rollback_to_savepoint_id`]
    pub fn savepoint_id(&self) -> usize {
        self.body.lock().undo.log_id()
    }

    /// Record a named savepoint at the current undo-log position
    pub fn add_savepoint(&self, name: &str) -> Result<()> {
        self.check_not_closed()?;
        let mut body = self.body.lock();
        let position = body.undo.log_id();
        body.savepoints.insert(name.to_string(), position);
        Ok(())
    }

    /// Roll back to a named savepoint.
    ///
    /// Undoes every operation staged after the savepoint and discards all
    /// savepoints at or beyond its position, the target included. Locks
    /// acquired since the savepoint are kept until finalize.
    pub fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.check_not_closed()?;
        let mut body = self.body.lock();
        let position = *body
            .savepoints
            .get(name)
            .ok_or_else(|| AmberError::SavepointInvalid {
                name: name.to_string(),
            })?;
        body.undo.rollback_to(position);
        body.savepoints.retain(|_, p| *p < position);
        Ok(())
    }

    /// Roll back to an explicit undo-log position from
    /// [`Transaction::savepoint_id`]
    pub fn rollback_to_savepoint_id(&self, savepoint_id: usize) -> Result<()> {
        self.check_not_closed()?;
        let mut body = self.body.lock();
        body.undo.rollback_to(savepoint_id);
        body.savepoints.retain(|_, p| *p < savepoint_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit and rollback
    // ------------------------------------------------------------------

    /// Commit synchronously.
    ///
    /// Under instant sync the call blocks until the redo record is on disk;
    /// a failed flush surfaces here as an error and leaves the transaction
    /// open. Otherwise the record is queued (or skipped for a read-only
    /// transaction) and finalize runs immediately.
    pub fn commit(&self) -> Result<()> {
        self.check_not_closed()?;
        if self.write_redo_log(false)? {
            self.engine.commit_final(self.id);
        }
        Ok(())
    }

    /// Commit asynchronously.
    ///
    /// Returns once the redo record is queued. Under instant sync the
    /// finalize (and `on_complete`) run on the sync thread after the fsync;
    /// under the other modes they run before this call returns. If the
    /// flush fails the transaction stays open and the callback is retained
    /// for a retried commit.
    pub fn async_commit(&self, on_complete: Option<CommitCallback>) -> Result<()> {
        self.check_not_closed()?;
        *self.commit_callback.lock() = on_complete;
        if self.write_redo_log(true)? {
            self.async_commit_complete();
        }
        Ok(())
    }

    /// Hand the redo record to the sync service.
    ///
    /// Returns whether the caller should finalize now. `false` means an
    /// instant-sync asynchronous commit took ownership of finalization.
    fn write_redo_log(&self, async_commit: bool) -> Result<bool> {
        let log = self.engine.log_sync();
        let buffer = if log.needs_sync() {
            self.body.lock().undo.to_redo_buffer()?
        } else {
            None
        };
        let Some(buffer) = buffer else {
            // Read-only, or durability is off.
            return Ok(true);
        };

        let record = RedoLogRecord::new(self.id, buffer);
        if log.is_instant_sync() {
            if async_commit {
                // Keep the transaction itself alive in the completion: the
                // registry entry may already be gone by the time the flush
                // lands (a foreign commit_final can win the race), and the
                // continuation must still run after finalize.
                let txn = self
                    .engine
                    .find_transaction(self.id)
                    .ok_or(AmberError::TransactionClosed)?;
                log.async_commit(
                    record,
                    Box::new(move |result| match result {
                        Ok(()) => txn.async_commit_complete(),
                        Err(e) => {
                            tracing::error!(
                                txn = txn.id,
                                error = %e,
                                "asynchronous commit flush failed; transaction left open"
                            );
                        }
                    }),
                );
                Ok(false)
            } else {
                log.add_and_wait_for_sync(record)?;
                Ok(true)
            }
        } else {
            log.add_record(record);
            Ok(true)
        }
    }

    fn async_commit_complete(&self) {
        self.engine.commit_final(self.id);
        let callback = self.commit_callback.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Apply the committed state and tear down. Runs exactly once, after
    /// the engine has de-registered this transaction.
    pub(crate) fn finalize_commit(&self) {
        self.commit_timestamp
            .store(self.engine.next_timestamp(), Ordering::Release);
        let (row_locks, object_locks) = {
            let mut body = self.body.lock();
            body.undo.commit();
            body.undo.gc();
            body.savepoints.clear();
            (
                std::mem::take(&mut body.row_locks),
                std::mem::take(&mut body.object_locks),
            )
        };
        self.set_status(TransactionStatus::Closed);
        for cell in row_locks {
            cell.unlock(self.id);
        }
        for lock in object_locks {
            lock.unlock(self, true, None);
        }
        self.wake_up_waiting_transactions();
        tracing::debug!(txn = self.id, "transaction committed");
    }

    /// Roll back everything and close the transaction.
    ///
    /// Cleanup (de-registration, lock release, wake sweep) runs even for a
    /// transaction that staged nothing.
    pub fn rollback(&self) -> Result<()> {
        self.check_not_closed()?;
        {
            let mut body = self.body.lock();
            body.undo.rollback_to(0);
        }
        self.engine.remove_transaction(self.id);
        let (row_locks, object_locks) = {
            let mut body = self.body.lock();
            body.undo.gc();
            body.savepoints.clear();
            (
                std::mem::take(&mut body.row_locks),
                std::mem::take(&mut body.object_locks),
            )
        };
        self.set_status(TransactionStatus::Closed);
        for cell in row_locks {
            cell.unlock(self.id);
        }
        for lock in object_locks {
            lock.unlock(self, false, None);
        }
        self.wake_up_waiting_transactions();
        tracing::debug!(txn = self.id, "transaction rolled back");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Waiting and wake-up
    // ------------------------------------------------------------------

    pub(crate) fn append_undo(&self, record: UndoRecord) {
        self.body.lock().undo.append(record);
    }

    pub(crate) fn record_row_lock(&self, cell: Arc<TransactionalValue>) {
        self.body.lock().row_locks.push(cell);
    }

    pub(crate) fn record_object_lock(&self, lock: Arc<ObjectLock>) {
        let mut body = self.body.lock();
        if !body.object_locks.iter().any(|l| Arc::ptr_eq(l, &lock)) {
            body.object_locks.push(lock);
        }
    }

    /// Enqueue `waiter` behind this transaction for `key`.
    ///
    /// On `NeedWait` the waiter is marked blocked and will be woken by this
    /// transaction's finalize sweep. On `NeedRetry` this transaction
    /// finalized concurrently and the waiter must retry its lock attempt.
    pub fn add_waiting_transaction(
        &self,
        key: Key,
        waiter: &Arc<Transaction>,
        listener: Arc<dyn WaitListener>,
    ) -> LockWaitResult {
        if self.is_closed() {
            return LockWaitResult::NeedRetry;
        }
        waiter.mark_waiting(self.id);
        let entry = WaitingTransaction::new(key, waiter.clone(), listener);
        if self.waiters.push(entry) {
            LockWaitResult::NeedWait
        } else {
            // Sealed: the finalize sweep already ran.
            waiter.clear_wait();
            LockWaitResult::NeedRetry
        }
    }

    fn mark_waiting(&self, holder_id: u64) {
        self.set_status(TransactionStatus::Waiting);
        self.blocked_on.store(holder_id, Ordering::Release);
        *self.wait_start.lock() = Some(Instant::now());
    }

    pub(crate) fn clear_wait(&self) {
        self.blocked_on.store(0, Ordering::Release);
        *self.wait_start.lock() = None;
        let _ = self.status.compare_exchange(
            STATUS_WAITING,
            STATUS_OPEN,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Seal the wait chain and wake every enqueued waiter
    pub(crate) fn wake_up_waiting_transactions(&self) {
        for waiter in self.waiters.seal_and_take() {
            waiter.wake_up();
        }
    }

    /// Wake one specific waiter without finalizing, used when a single lock
    /// changes hands early
    pub fn wake_up_waiting_transaction(&self, txn_id: u64) {
        if let Some(waiter) = self.waiters.remove(txn_id) {
            waiter.wake_up();
        }
    }

    /// Check whether this transaction's current lock wait has expired.
    ///
    /// Returns `Ok(())` while within the timeout or no longer blocked. Past
    /// the timeout, a mutual wait with the blocker is reported as
    /// [`AmberError::Deadlock`]; anything else as [`AmberError::LockTimeout`].
    pub fn check_timeout(&self) -> Result<()> {
        let holder_id = match self.waiting_for() {
            Some(id) => id,
            None => return Ok(()),
        };
        let started = match *self.wait_start.lock() {
            Some(at) => at,
            None => return Ok(()),
        };
        if started.elapsed() <= self.lock_timeout() {
            return Ok(());
        }
        let holder = match self.engine.find_transaction(holder_id) {
            Some(holder) => holder,
            // Finalizing; the wake is imminent.
            None => return Ok(()),
        };
        let my_key = match holder.waiters.find_key(self.id) {
            Some(key) => key,
            // Already swept out of the chain.
            None => return Ok(()),
        };
        if let Some(holder_key) = self.waiters.find_key(holder.id) {
            Err(AmberError::Deadlock {
                waiter: self.name.clone(),
                holder: holder.name.clone(),
                waiter_key: my_key,
                holder_key,
            })
        } else {
            Err(AmberError::LockTimeout {
                waiter: self.name.clone(),
                holder: holder.name.clone(),
                key: my_key,
            })
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}
