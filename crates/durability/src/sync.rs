//! Log sync service
//!
//! Owns the redo log and a background flush thread. Committing transactions
//! hand records over and, depending on the sync mode, either wait for the
//! fsync, register a completion callback, or return immediately.
//!
//! # Sync modes
//!
//! | Mode | Commit waits | Data loss window |
//! |----------|-------------------------|---------------------|
//! | Instant | until fsync (or callback) | zero |
//! | Periodic | no | up to one batch |
//! | Disabled | no | everything |
//!
//! The background thread drains the queue, appends, fsyncs, wakes waiters
//! and then runs completion callbacks outside the lock.
//!
//! A failed append or fsync is never confirmed: the synced sequence number
//! stops before the failed records, waiters get the error back, completions
//! receive it, and the service goes into a sticky failed state — the log's
//! on-disk tail is unknown after a failed flush, so no later record may be
//! reported durable either.

use crate::record::RedoLogRecord;
use crate::redo_log::RedoLog;
use amber_core::{AmberError, Result};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Completion callback invoked once the record's flush outcome is known.
pub type SyncCompletion = Box<dyn FnOnce(Result<()>) + Send>;

fn flush_error(msg: &str) -> AmberError {
    AmberError::Io(io::Error::new(io::ErrorKind::Other, msg.to_string()))
}

/// Durability policy for redo records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Flush before the commit is allowed to finalize
    Instant,
    /// Queue for a background flush; commit does not wait
    Periodic {
        /// Upper bound between flushes when the queue sits non-empty
        interval_ms: u64,
    },
    /// No durability; records are discarded
    Disabled,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Periodic { interval_ms: 100 }
    }
}

struct Pending {
    record: RedoLogRecord,
    seq: u64,
    completion: Option<SyncCompletion>,
}

struct SyncState {
    queue: Vec<Pending>,
    log: Option<RedoLog>,
    next_seq: u64,
    synced_seq: u64,
    // Set on the first failed append/fsync; sticky for the service lifetime.
    sync_failure: Option<String>,
    shutdown: bool,
}

/// Buffers redo records and flushes them according to the sync mode.
pub struct LogSyncService {
    mode: SyncMode,
    state: Mutex<SyncState>,
    work_cv: Condvar,
    synced_cv: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
    #[cfg(test)]
    fail_flushes: std::sync::atomic::AtomicBool,
}

impl LogSyncService {
    /// Open the service.
    ///
    /// `path` is the redo log file; `None` (or `SyncMode::Disabled`) turns
    /// durability off entirely. Returns the service plus all records read
    /// back from the existing log for replay.
    pub fn open(
        mode: SyncMode,
        path: Option<&Path>,
    ) -> Result<(Arc<Self>, Vec<RedoLogRecord>)> {
        let (log, records) = match (mode, path) {
            (SyncMode::Disabled, _) | (_, None) => (None, Vec::new()),
            (_, Some(p)) => {
                let (log, records) = RedoLog::open(p)?;
                (Some(log), records)
            }
        };

        let service = Arc::new(LogSyncService {
            mode,
            state: Mutex::new(SyncState {
                queue: Vec::new(),
                log,
                next_seq: 0,
                synced_seq: 0,
                sync_failure: None,
                shutdown: false,
            }),
            work_cv: Condvar::new(),
            synced_cv: Condvar::new(),
            thread: Mutex::new(None),
            #[cfg(test)]
            fail_flushes: std::sync::atomic::AtomicBool::new(false),
        });

        if service.needs_sync() {
            let worker = service.clone();
            let handle = std::thread::Builder::new()
                .name("amber-log-sync".to_string())
                .spawn(move || worker.run())?;
            *service.thread.lock() = Some(handle);
        }

        Ok((service, records))
    }

    /// Whether commits must hand records to this service at all
    pub fn needs_sync(&self) -> bool {
        !matches!(self.mode, SyncMode::Disabled) && self.state.lock().log.is_some()
    }

    /// Whether the mode requires the flush before commit finalizes
    pub fn is_instant_sync(&self) -> bool {
        matches!(self.mode, SyncMode::Instant)
    }

    /// Queue a record without waiting for its flush
    pub fn add_record(&self, record: RedoLogRecord) {
        let mut state = self.state.lock();
        if state.log.is_none() {
            return;
        }
        Self::enqueue(&mut state, record, None);
        self.work_cv.notify_one();
    }

    /// Queue a record and block until it has been fsynced.
    ///
    /// Returns an error when the flush fails (or already failed earlier);
    /// the record must not be treated as durable in that case.
    pub fn add_and_wait_for_sync(&self, record: RedoLogRecord) -> Result<()> {
        let mut state = self.state.lock();
        if state.log.is_none() {
            return Ok(());
        }
        if let Some(msg) = &state.sync_failure {
            return Err(flush_error(msg));
        }
        let seq = Self::enqueue(&mut state, record, None);
        self.work_cv.notify_one();
        while state.synced_seq < seq && state.sync_failure.is_none() && !state.shutdown {
            self.synced_cv.wait(&mut state);
        }
        if state.synced_seq >= seq {
            Ok(())
        } else if let Some(msg) = &state.sync_failure {
            Err(flush_error(msg))
        } else {
            Err(flush_error("log sync service shut down before the flush"))
        }
    }

    /// Queue a record; `completion` runs on the sync thread with the flush
    /// outcome.
    ///
    /// Used by asynchronous commit: finalize happens inside the completion,
    /// and only on `Ok`.
    pub fn async_commit(&self, record: RedoLogRecord, completion: SyncCompletion) {
        let mut state = self.state.lock();
        if state.log.is_none() {
            drop(state);
            completion(Ok(()));
            return;
        }
        if let Some(msg) = state.sync_failure.clone() {
            drop(state);
            completion(Err(flush_error(&msg)));
            return;
        }
        Self::enqueue(&mut state, record, Some(completion));
        self.work_cv.notify_one();
    }

    fn enqueue(state: &mut SyncState, record: RedoLogRecord, completion: Option<SyncCompletion>) -> u64 {
        state.next_seq += 1;
        let seq = state.next_seq;
        state.queue.push(Pending {
            record,
            seq,
            completion,
        });
        seq
    }

    fn run(&self) {
        loop {
            let mut state = self.state.lock();
            while state.queue.is_empty() && !state.shutdown {
                match self.mode {
                    SyncMode::Periodic { interval_ms } => {
                        self.work_cv
                            .wait_for(&mut state, Duration::from_millis(interval_ms));
                    }
                    _ => self.work_cv.wait(&mut state),
                }
            }
            if state.queue.is_empty() && state.shutdown {
                break;
            }

            let batch = std::mem::take(&mut state.queue);
            let last_seq = batch.last().map(|p| p.seq).unwrap_or(state.synced_seq);

            let mut error = state.sync_failure.clone();
            #[cfg(test)]
            if error.is_none()
                && self
                    .fail_flushes
                    .load(std::sync::atomic::Ordering::SeqCst)
            {
                error = Some("injected flush failure".to_string());
            }
            if error.is_none() {
                if let Some(log) = state.log.as_mut() {
                    for pending in &batch {
                        if let Err(e) = log.append(&pending.record) {
                            error = Some(e.to_string());
                            break;
                        }
                    }
                    if error.is_none() {
                        if let Err(e) = log.sync() {
                            error = Some(e.to_string());
                        }
                    }
                }
            }

            let mut completions = Vec::new();
            for pending in batch {
                if let Some(completion) = pending.completion {
                    completions.push(completion);
                }
            }

            match &error {
                None => state.synced_seq = last_seq,
                Some(msg) => {
                    tracing::error!(error = %msg, "redo log flush failed");
                    state.sync_failure = Some(msg.clone());
                }
            }
            self.synced_cv.notify_all();
            drop(state);

            for completion in completions {
                completion(match &error {
                    None => Ok(()),
                    Some(msg) => Err(flush_error(msg)),
                });
            }
        }
    }

    /// Stop the sync thread after draining the queue.
    ///
    /// Idempotent; also invoked by `Drop`.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            self.work_cv.notify_all();
            self.synced_cv.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LogSyncService {
    fn drop(&mut self) {
        self.close();
    }
}
