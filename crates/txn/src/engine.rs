//! Transaction engine
//!
//! Owns the registry of live transactions, the shared id/timestamp counter
//! and the log sync service. Transaction ids are odd and commit timestamps
//! even, both drawn from one counter, so any id-versus-timestamp comparison
//! is unambiguous and the counter doubles as a total order across begins and
//! commits.
//!
//! The registry removal inside [`TransactionEngine::commit_final`] is the
//! idempotence point for commit: whichever caller wins the removal performs
//! finalization, every later call is a no-op. The same property makes a
//! stale lock-word id harmless; holders are only ever resolved through
//! [`TransactionEngine::find_transaction`].

use crate::transaction::Transaction;
use crate::undo::decode_redo_buffer;
use crate::value::TransactionalValue;
use amber_core::{Key, Result, StorageMap, Value};
use amber_durability::{LogSyncService, SyncMode};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Redo log durability policy
    pub sync_mode: SyncMode,
    /// Redo log file; `None` disables durability regardless of mode
    pub redo_log_path: Option<PathBuf>,
    /// Default lock wait threshold for new transactions
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sync_mode: SyncMode::Disabled,
            redo_log_path: None,
            lock_timeout: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Durable configuration: redo log at `path` with the given sync mode
    pub fn durable(path: impl Into<PathBuf>, sync_mode: SyncMode) -> Self {
        EngineConfig {
            sync_mode,
            redo_log_path: Some(path.into()),
            lock_timeout: Duration::from_secs(2),
        }
    }
}

/// The engine: transaction factory, registry and counter authority.
pub struct TransactionEngine {
    config: EngineConfig,
    transactions: DashMap<u64, Arc<Transaction>>,
    counter: AtomicU64,
    log: Arc<LogSyncService>,
    // Committed operations read back from the redo log at open, grouped by
    // map name and drained into each durable map when it is first opened.
    replay: Mutex<HashMap<String, Vec<(Key, Option<Value>)>>>,
}

impl TransactionEngine {
    /// Open an engine.
    ///
    /// Reads the redo log back (if configured) and holds the committed
    /// operations for replay into durable maps as they are opened.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        let (log, records) =
            LogSyncService::open(config.sync_mode, config.redo_log_path.as_deref())?;

        let mut replay: HashMap<String, Vec<(Key, Option<Value>)>> = HashMap::new();
        for record in records {
            for op in decode_redo_buffer(&record.operations)? {
                replay
                    .entry(op.map_name)
                    .or_default()
                    .push((op.key, op.value));
            }
        }
        if !replay.is_empty() {
            tracing::info!(maps = replay.len(), "redo log replay pending");
        }

        Ok(Arc::new(TransactionEngine {
            config,
            transactions: DashMap::new(),
            counter: AtomicU64::new(0),
            log,
            replay: Mutex::new(replay),
        }))
    }

    /// Begin a transaction and register it
    pub fn begin_transaction(self: &Arc<Self>) -> Arc<Transaction> {
        self.begin_transaction_with_host(None)
    }

    /// Begin a transaction whose name carries `host` (a `host:port` string)
    /// for cross-node diagnostics
    pub fn begin_transaction_with_host(self: &Arc<Self>, host: Option<&str>) -> Arc<Transaction> {
        let id = self.next_transaction_id();
        let txn = Arc::new(Transaction::new(self.clone(), id, host));
        self.transactions.insert(id, txn.clone());
        txn
    }

    /// Look up a live transaction by id
    pub fn find_transaction(&self, id: u64) -> Option<Arc<Transaction>> {
        self.transactions.get(&id).map(|entry| entry.value().clone())
    }

    /// De-register a transaction. Returns it if it was still registered.
    pub fn remove_transaction(&self, id: u64) -> Option<Arc<Transaction>> {
        self.transactions.remove(&id).map(|(_, txn)| txn)
    }

    /// Number of live transactions
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Finalize the commit of transaction `id`.
    ///
    /// Idempotent: the registry removal decides a single winner and every
    /// other call returns without effect.
    pub fn commit_final(&self, id: u64) {
        if let Some(txn) = self.remove_transaction(id) {
            txn.finalize_commit();
        }
    }

    /// Next odd transaction id
    fn next_transaction_id(&self) -> u64 {
        self.next_with_parity(1)
    }

    /// Next even commit timestamp
    pub fn next_timestamp(&self) -> u64 {
        self.next_with_parity(0)
    }

    fn next_with_parity(&self, parity: u64) -> u64 {
        let mut current = self.counter.load(Ordering::Acquire);
        loop {
            let next = if current % 2 == parity {
                current + 2
            } else {
                current + 1
            };
            match self.counter.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// The log sync service shared by every transaction of this engine
    pub fn log_sync(&self) -> &Arc<LogSyncService> {
        &self.log
    }

    /// Default lock wait threshold from the configuration
    pub fn default_lock_timeout(&self) -> Duration {
        self.config.lock_timeout
    }

    /// Replay committed redo operations into a freshly opened durable map.
    ///
    /// Each map's operations are applied once, in commit order; later opens
    /// of the same map find nothing pending.
    pub fn replay_into(&self, map: &dyn StorageMap<Arc<TransactionalValue>>) {
        let ops = self.replay.lock().remove(map.name());
        let Some(ops) = ops else { return };
        tracing::info!(map = map.name(), ops = ops.len(), "replaying redo operations");
        for (key, value) in ops {
            match value {
                Some(value) => {
                    map.put(key, Arc::new(TransactionalValue::with_committed(value)));
                }
                None => {
                    map.remove(&key);
                }
            }
        }
    }

    /// Shut down: stop the sync thread after draining queued records.
    ///
    /// Live transactions are left untouched; callers commit or roll them
    /// back first.
    pub fn close(&self) {
        self.log.close();
    }
}
