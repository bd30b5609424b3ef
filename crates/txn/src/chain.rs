//! Lock-free wait chains
//!
//! Each live transaction carries a chain of transactions blocked on locks it
//! holds. The chain is a copy-on-write immutable list behind an epoch-managed
//! atomic pointer: appenders CAS in a fresh list, and the finalizing holder
//! retires the whole chain with a single swap to a sealed sentinel (a tagged
//! null). Any append racing with the sweep loses its CAS, observes the seal
//! and retries the lock instead, so a waiter is either woken by the sweep or
//! never enqueued. No wake-up can be lost.
//!
//! Retired lists are reclaimed through `crossbeam_epoch` deferred
//! destruction; readers hold a pinned guard for the duration of a traversal.

use crate::transaction::Transaction;
use amber_core::Key;
use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Pointer tag marking a chain that has been swept and closed to appends
const SEALED: usize = 1;

/// Notification target for a blocked transaction.
///
/// The waker calls [`WaitListener::wake`] exactly once per wait episode,
/// after clearing the waiter's blocked state.
pub trait WaitListener: Send + Sync {
    /// Notify the waiter that its blocker has finalized
    fn wake(&self);
}

/// A blocking listener for synchronous callers: parks the thread until the
/// wake arrives or a timeout passes.
pub struct SyncWaitListener {
    woken: Mutex<bool>,
    cv: Condvar,
}

impl SyncWaitListener {
    /// Create a listener in the not-woken state
    pub fn new() -> Arc<Self> {
        Arc::new(SyncWaitListener {
            woken: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    /// Block until woken or `timeout` elapses; consumes the wake flag.
    ///
    /// Returns whether a wake arrived.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut woken = self.woken.lock();
        if !*woken {
            self.cv.wait_for(&mut woken, timeout);
        }
        std::mem::replace(&mut *woken, false)
    }
}

impl WaitListener for SyncWaitListener {
    fn wake(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.cv.notify_all();
    }
}

/// One entry in a wait chain: the blocked transaction, the key it wants,
/// and how to notify it.
#[derive(Clone)]
pub struct WaitingTransaction {
    key: Key,
    transaction: Arc<Transaction>,
    listener: Arc<dyn WaitListener>,
}

impl WaitingTransaction {
    /// Build an entry for `transaction` blocked on `key`
    pub fn new(key: Key, transaction: Arc<Transaction>, listener: Arc<dyn WaitListener>) -> Self {
        WaitingTransaction {
            key,
            transaction,
            listener,
        }
    }

    /// The contended key
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The blocked transaction
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    /// Clear the waiter's blocked state and notify its listener.
    ///
    /// Waking a transaction that has since closed is harmless; the state
    /// clear is a no-op and the listener fires into nothing.
    pub fn wake_up(&self) {
        self.transaction.clear_wait();
        self.listener.wake();
    }
}

/// The chain itself: a copy-on-write list of waiters under one atomic.
pub struct WaitChain {
    list: Atomic<Vec<WaitingTransaction>>,
}

impl Default for WaitChain {
    fn default() -> Self {
        WaitChain::new()
    }
}

impl WaitChain {
    /// An empty, unsealed chain
    pub fn new() -> Self {
        WaitChain {
            list: Atomic::null(),
        }
    }

    /// Append a waiter.
    ///
    /// Returns `false` when the chain has been sealed, meaning the holder's
    /// finalize sweep already ran; the caller must retry its lock attempt
    /// rather than wait.
    pub fn push(&self, waiter: WaitingTransaction) -> bool {
        let guard = epoch::pin();
        let mut current = self.list.load(Ordering::Acquire, &guard);
        loop {
            if current.tag() == SEALED {
                return false;
            }
            let mut next: Vec<WaitingTransaction> = match unsafe { current.as_ref() } {
                Some(list) => list.clone(),
                None => Vec::with_capacity(1),
            };
            next.push(waiter.clone());
            match self.list.compare_exchange(
                current,
                Owned::new(next),
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            ) {
                Ok(_) => {
                    if !current.is_null() {
                        unsafe { guard.defer_destroy(current) };
                    }
                    return true;
                }
                Err(e) => current = e.current,
            }
        }
    }

    /// Atomically seal the chain and take every waiter.
    ///
    /// After this call every future [`WaitChain::push`] fails. Safe to call
    /// more than once; later calls return an empty list.
    pub fn seal_and_take(&self) -> Vec<WaitingTransaction> {
        let guard = epoch::pin();
        let previous = self
            .list
            .swap(Shared::null().with_tag(SEALED), Ordering::AcqRel, &guard);
        if previous.tag() == SEALED || previous.is_null() {
            return Vec::new();
        }
        let waiters = match unsafe { previous.as_ref() } {
            Some(list) => list.clone(),
            None => Vec::new(),
        };
        unsafe { guard.defer_destroy(previous) };
        waiters
    }

    /// Remove the entry for `txn_id`, if present.
    ///
    /// Used for targeted wake-ups when a single lock changes hands without
    /// the holder finalizing.
    pub fn remove(&self, txn_id: u64) -> Option<WaitingTransaction> {
        let guard = epoch::pin();
        let mut current = self.list.load(Ordering::Acquire, &guard);
        loop {
            if current.tag() == SEALED || current.is_null() {
                return None;
            }
            let list = unsafe { current.as_ref() }?;
            let position = list
                .iter()
                .position(|w| w.transaction.id() == txn_id)?;
            let mut next = list.clone();
            let removed = next.remove(position);
            let swapped = if next.is_empty() {
                match self.list.compare_exchange(
                    current,
                    Shared::null(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    &guard,
                ) {
                    Ok(_) => true,
                    Err(e) => {
                        current = e.current;
                        false
                    }
                }
            } else {
                match self.list.compare_exchange(
                    current,
                    Owned::new(next),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    &guard,
                ) {
                    Ok(_) => true,
                    Err(e) => {
                        current = e.current;
                        false
                    }
                }
            };
            if swapped {
                unsafe { guard.defer_destroy(current) };
                return Some(removed);
            }
        }
    }

    /// The key `txn_id` is waiting on in this chain, if it is enqueued here
    pub fn find_key(&self, txn_id: u64) -> Option<Key> {
        let guard = epoch::pin();
        let current = self.list.load(Ordering::Acquire, &guard);
        if current.tag() == SEALED || current.is_null() {
            return None;
        }
        unsafe { current.as_ref() }?
            .iter()
            .find(|w| w.transaction.id() == txn_id)
            .map(|w| w.key.clone())
    }

    /// Whether `txn_id` is currently enqueued
    pub fn contains(&self, txn_id: u64) -> bool {
        self.find_key(txn_id).is_some()
    }

    /// Number of enqueued waiters
    pub fn len(&self) -> usize {
        let guard = epoch::pin();
        let current = self.list.load(Ordering::Acquire, &guard);
        match unsafe { current.as_ref() } {
            Some(list) if current.tag() != SEALED => list.len(),
            _ => 0,
        }
    }

    /// Whether the chain has no waiters
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the holder's sweep has run
    pub fn is_sealed(&self) -> bool {
        let guard = epoch::pin();
        self.list.load(Ordering::Acquire, &guard).tag() == SEALED
    }
}

impl Drop for WaitChain {
    fn drop(&mut self) {
        // Exclusive access; nothing else can observe the pointer.
        let guard = unsafe { epoch::unprotected() };
        let current = self.list.load(Ordering::Relaxed, guard);
        if !current.is_null() {
            drop(unsafe { current.into_owned() });
        }
    }
}
