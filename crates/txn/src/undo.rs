//! Per-transaction undo log
//!
//! Append-only within a transaction: every write or delete adds one record
//! pointing at the touched cell, the pending state it replaced, and the value
//! it staged. Positions in the log double as savepoint identifiers.
//!
//! At commit the log is walked forward, promoting each cell's pending version;
//! at rollback it is walked backward, restoring each cell's prior pending
//! state. The redo-operation buffer handed to the durability layer is a
//! serialization of the same records with the cell pointers replaced by map
//! name and key.

use crate::value::{PendingValue, TransactionalValue};
use amber_core::{Key, Result, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One undo entry: a staged write or delete against a single cell.
pub struct UndoRecord {
    map_name: String,
    key: Key,
    value: Arc<TransactionalValue>,
    prior: PendingValue,
    staged: Option<Value>,
}

impl UndoRecord {
    /// Record a staged operation. `prior` is the pending state the stage
    /// replaced; `staged` is `None` for a delete.
    pub fn new(
        map_name: &str,
        key: Key,
        value: Arc<TransactionalValue>,
        prior: PendingValue,
        staged: Option<Value>,
    ) -> Self {
        UndoRecord {
            map_name: map_name.to_string(),
            key,
            value,
            prior,
            staged,
        }
    }
}

/// A single operation in a redo buffer: map, key, and the committed
/// outcome (`None` for a delete).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedoOp {
    /// Name of the map the operation applies to
    pub map_name: String,
    /// The affected key
    pub key: Key,
    /// Committed value, `None` when the key was deleted
    pub value: Option<Value>,
}

/// Decode a redo buffer produced by [`UndoLog::to_redo_buffer`]
pub fn decode_redo_buffer(buf: &[u8]) -> Result<Vec<RedoOp>> {
    Ok(bincode::deserialize(buf)?)
}

/// The transaction's ordered list of staged operations.
#[derive(Default)]
pub struct UndoLog {
    records: Vec<UndoRecord>,
}

impl UndoLog {
    /// An empty log
    pub fn new() -> Self {
        UndoLog::default()
    }

    /// Current position; doubles as the next savepoint id
    pub fn log_id(&self) -> usize {
        self.records.len()
    }

    /// Whether the transaction has staged anything
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a record
    pub fn append(&mut self, record: UndoRecord) {
        self.records.push(record);
    }

    /// Promote every staged version to committed, in log order.
    ///
    /// A cell touched more than once carries only its last staged value as
    /// pending, so repeated promotion of the same cell is a no-op.
    pub fn commit(&mut self) {
        for record in &self.records {
            record.value.commit_pending();
        }
    }

    /// Undo records back to (and excluding) position `to_log_id`, restoring
    /// each cell's prior pending state in reverse order.
    pub fn rollback_to(&mut self, to_log_id: usize) {
        while self.records.len() > to_log_id {
            if let Some(record) = self.records.pop() {
                record.value.restore(record.prior);
            }
        }
    }

    /// Serialize the staged operations for the redo log.
    ///
    /// Returns `None` when the transaction staged nothing; read-only commits
    /// write no redo record.
    pub fn to_redo_buffer(&self) -> Result<Option<Vec<u8>>> {
        if self.records.is_empty() {
            return Ok(None);
        }
        let ops: Vec<RedoOp> = self
            .records
            .iter()
            .map(|r| RedoOp {
                map_name: r.map_name.clone(),
                key: r.key.clone(),
                value: r.staged.clone(),
            })
            .collect();
        Ok(Some(bincode::serialize(&ops)?))
    }

    /// Drop all records after finalize
    pub fn gc(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TryLockResult;

    fn locked_cell(txn_id: u64, committed: Option<Value>) -> Arc<TransactionalValue> {
        let tv = match committed {
            Some(v) => TransactionalValue::with_committed(v),
            None => TransactionalValue::empty(),
        };
        assert_eq!(tv.try_exclusive_lock(txn_id), TryLockResult::Acquired);
        Arc::new(tv)
    }

    fn stage_into(
        log: &mut UndoLog,
        map: &str,
        key: &str,
        tv: &Arc<TransactionalValue>,
        value: Option<Value>,
    ) {
        let prior = tv.stage(value.clone());
        log.append(UndoRecord::new(map, Key::from(key), tv.clone(), prior, value));
    }

    #[test]
    fn test_commit_applies_in_order() {
        let mut log = UndoLog::new();
        let a = locked_cell(3, None);
        let b = locked_cell(3, Some(Value::from(1)));
        stage_into(&mut log, "t", "a", &a, Some(Value::from(10)));
        stage_into(&mut log, "t", "b", &b, None);
        stage_into(&mut log, "t", "a", &a, Some(Value::from(11)));
        log.commit();
        assert_eq!(a.read_committed(), Some(Value::from(11)));
        assert_eq!(b.read_committed(), None);
    }

    #[test]
    fn test_rollback_to_zero_restores_everything() {
        let mut log = UndoLog::new();
        let a = locked_cell(3, Some(Value::from(1)));
        stage_into(&mut log, "t", "a", &a, Some(Value::from(2)));
        stage_into(&mut log, "t", "a", &a, Some(Value::from(3)));
        log.rollback_to(0);
        assert!(log.is_empty());
        a.commit_pending();
        assert_eq!(a.read_committed(), Some(Value::from(1)));
    }

    #[test]
    fn test_partial_rollback_keeps_earlier_records() {
        let mut log = UndoLog::new();
        let a = locked_cell(3, None);
        stage_into(&mut log, "t", "a", &a, Some(Value::from(1)));
        let mark = log.log_id();
        stage_into(&mut log, "t", "a", &a, Some(Value::from(2)));
        log.rollback_to(mark);
        assert_eq!(log.log_id(), mark);
        assert_eq!(a.read_for(3), Some(Value::from(1)));
    }

    #[test]
    fn test_redo_buffer_roundtrip() {
        let mut log = UndoLog::new();
        let a = locked_cell(3, None);
        stage_into(&mut log, "t", "a", &a, Some(Value::from("v")));
        stage_into(&mut log, "t", "b", &a, None);
        let buf = log.to_redo_buffer().unwrap().unwrap();
        let ops = decode_redo_buffer(&buf).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].key, Key::from("a"));
        assert_eq!(ops[0].value, Some(Value::from("v")));
        assert_eq!(ops[1].value, None);
    }

    #[test]
    fn test_empty_log_produces_no_buffer() {
        let log = UndoLog::new();
        assert!(log.to_redo_buffer().unwrap().is_none());
    }
}
