//! Object locks for schema operations
//!
//! Coarse exclusive locks over named schema objects (tables, indexes and the
//! like), separate from row-cell locks. The owner is a CAS word holding a
//! transaction id; completion handlers registered while the lock is held run
//! when it is released, carrying whether the protected operation succeeded.
//!
//! Shared acquisition always succeeds: reads of schema objects never
//! conflict in this engine. An exclusive unlock can transfer ownership
//! directly to a designated successor instead of opening a wake-up race.

use crate::chain::WaitListener;
use crate::transaction::{LockWaitResult, Transaction};
use crate::value::UNLOCKED;
use amber_core::Key;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Kind of schema object a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbObjectKind {
    /// A schema namespace
    Schema,
    /// A table definition
    Table,
    /// An index definition
    Index,
    /// A sequence generator
    Sequence,
}

/// Handler run at unlock; the flag tells whether the locked operation
/// committed.
pub type LockHandler = Box<dyn FnOnce(bool) + Send>;

/// An exclusive lock over one named schema object.
pub struct ObjectLock {
    kind: DbObjectKind,
    name: String,
    owner: AtomicU64,
    handlers: Mutex<Vec<LockHandler>>,
    weak: Weak<ObjectLock>,
}

impl ObjectLock {
    /// Create a lock for the named object
    pub fn new(kind: DbObjectKind, name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak| ObjectLock {
            kind,
            name,
            owner: AtomicU64::new(UNLOCKED),
            handlers: Mutex::new(Vec::new()),
            weak: weak.clone(),
        })
    }

    /// The protected object's kind
    pub fn kind(&self) -> DbObjectKind {
        self.kind
    }

    /// The protected object's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a handler to run at the next unlock
    pub fn add_handler(&self, handler: LockHandler) {
        self.handlers.lock().push(handler);
    }

    /// Shared acquisition; never conflicts
    pub fn try_shared_lock(&self, _txn: &Arc<Transaction>) -> bool {
        true
    }

    /// Attempt the exclusive lock for `txn`.
    ///
    /// Re-entrant for the current owner. On contention the transaction is
    /// enqueued in the holder's wait chain (so deadlock and timeout checks
    /// see it) and `false` is returned; `listener` fires when the holder
    /// finalizes and the caller retries.
    pub fn try_exclusive_lock(
        &self,
        txn: &Arc<Transaction>,
        listener: &Arc<dyn WaitListener>,
    ) -> bool {
        loop {
            if self
                .owner
                .compare_exchange(UNLOCKED, txn.id(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.record_into(txn);
                return true;
            }
            let holder_id = self.owner.load(Ordering::Acquire);
            if holder_id == txn.id() {
                return true;
            }
            if holder_id == UNLOCKED {
                // Released between the CAS and the load.
                continue;
            }
            let Some(holder) = txn.engine().find_transaction(holder_id) else {
                continue;
            };
            match holder.add_waiting_transaction(
                Key::from(self.name.as_bytes().to_vec()),
                txn,
                listener.clone(),
            ) {
                LockWaitResult::NeedWait => return false,
                LockWaitResult::NeedRetry => continue,
            }
        }
    }

    /// Whether any transaction holds the lock
    pub fn is_locked_exclusively(&self) -> bool {
        self.owner.load(Ordering::Acquire) != UNLOCKED
    }

    /// Whether `txn` holds the lock
    pub fn is_locked_by(&self, txn: &Transaction) -> bool {
        self.owner.load(Ordering::Acquire) == txn.id()
    }

    /// Release the lock held by `old`, optionally handing it straight to
    /// `new_owner`.
    ///
    /// Runs every registered handler with `succeeded`. A call by a
    /// non-owner is a no-op.
    pub fn unlock(&self, old: &Transaction, succeeded: bool, new_owner: Option<&Arc<Transaction>>) {
        let next = new_owner.map(|t| t.id()).unwrap_or(UNLOCKED);
        if self
            .owner
            .compare_exchange(old.id(), next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Some(new_owner) = new_owner {
            self.record_into(new_owner);
        }
        let handlers = std::mem::take(&mut *self.handlers.lock());
        for handler in handlers {
            handler(succeeded);
        }
    }

    fn record_into(&self, txn: &Arc<Transaction>) {
        if let Some(this) = self.weak.upgrade() {
            txn.record_object_lock(this);
        }
    }
}
