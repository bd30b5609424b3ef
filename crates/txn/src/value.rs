//! Versioned value cells
//!
//! Every key in a transactional map points at one `TransactionalValue`: an
//! exclusive-lock word plus a committed version and at most one pending
//! (uncommitted) version owned by the locking transaction. Read-committed
//! visibility falls out directly: readers other than the owner only ever see
//! the committed slot.
//!
//! The lock word stores the owning transaction id, with 0 meaning unlocked.
//! Holders are resolved back to live transactions through the engine
//! registry, so a stale id left behind by a finalizing transaction is never
//! dereferenced, only compared.

use amber_core::Value;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock word value meaning "no owner"
pub const UNLOCKED: u64 = 0;

/// Outcome of an exclusive lock attempt on a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLockResult {
    /// The lock word was won by this call
    Acquired,
    /// The caller already held the lock
    AlreadyOwned,
    /// Another transaction holds the lock
    HeldBy(u64),
}

/// Pending (uncommitted) state of a cell.
///
/// `None` means no pending version; `Some(None)` is a staged delete;
/// `Some(Some(v))` is a staged write.
pub type PendingValue = Option<Option<Value>>;

/// A lockable, versioned cell holding one committed and at most one
/// pending version of a value.
pub struct TransactionalValue {
    lock: AtomicU64,
    committed: RwLock<Option<Value>>,
    pending: Mutex<PendingValue>,
}

impl TransactionalValue {
    /// An empty cell: no committed version, no pending version, unlocked
    pub fn empty() -> Self {
        TransactionalValue {
            lock: AtomicU64::new(UNLOCKED),
            committed: RwLock::new(None),
            pending: Mutex::new(None),
        }
    }

    /// A cell created directly in the committed state, used by redo replay
    pub fn with_committed(value: Value) -> Self {
        TransactionalValue {
            lock: AtomicU64::new(UNLOCKED),
            committed: RwLock::new(Some(value)),
            pending: Mutex::new(None),
        }
    }

    /// Attempt to take the exclusive lock for `txn_id`.
    ///
    /// Re-entrant: a transaction that already owns the cell gets
    /// `AlreadyOwned` without touching the lock word.
    pub fn try_exclusive_lock(&self, txn_id: u64) -> TryLockResult {
        match self
            .lock
            .compare_exchange(UNLOCKED, txn_id, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => TryLockResult::Acquired,
            Err(current) if current == txn_id => TryLockResult::AlreadyOwned,
            Err(current) => TryLockResult::HeldBy(current),
        }
    }

    /// The owning transaction id, if any
    pub fn owner(&self) -> Option<u64> {
        match self.lock.load(Ordering::Acquire) {
            UNLOCKED => None,
            id => Some(id),
        }
    }

    /// Release the lock if `txn_id` holds it. Returns whether it did.
    pub fn unlock(&self, txn_id: u64) -> bool {
        self.lock
            .compare_exchange(txn_id, UNLOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The committed version, or `None` if the key is absent
    pub fn read_committed(&self) -> Option<Value> {
        self.committed.read().clone()
    }

    /// Read as seen by `txn_id`: its own pending version if it owns the
    /// cell and has one, otherwise the committed version.
    pub fn read_for(&self, txn_id: u64) -> Option<Value> {
        if self.owner() == Some(txn_id) {
            if let Some(pending) = self.pending.lock().clone() {
                return pending;
            }
        }
        self.read_committed()
    }

    /// Read the pending version regardless of ownership, falling back to
    /// the committed version. This is the dirty-read path.
    pub fn read_dirty(&self) -> Option<Value> {
        if let Some(pending) = self.pending.lock().clone() {
            return pending;
        }
        self.read_committed()
    }

    /// Stage a pending write (`Some(v)`) or delete (`None`), returning the
    /// prior pending state for the caller's undo record.
    ///
    /// Callers must hold the exclusive lock.
    pub fn stage(&self, value: Option<Value>) -> PendingValue {
        let mut pending = self.pending.lock();
        std::mem::replace(&mut *pending, Some(value))
    }

    /// Restore a prior pending state captured by [`TransactionalValue::stage`]
    pub fn restore(&self, prior: PendingValue) {
        *self.pending.lock() = prior;
    }

    /// Promote the pending version (if any) to committed
    pub fn commit_pending(&self) {
        let taken = self.pending.lock().take();
        if let Some(value) = taken {
            *self.committed.write() = value;
        }
    }

    /// Drop the pending version without committing it
    pub fn discard_pending(&self) {
        *self.pending.lock() = None;
    }
}
