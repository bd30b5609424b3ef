//! Key, value and isolation-level types
//!
//! Keys are ordered byte strings; the engine never interprets their contents
//! beyond ordering and equality. Values are a small enum covering the shapes
//! the storage layer persists. Both serialize with `serde`/`bincode` so they
//! can travel through redo-log operation buffers unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered byte-string key.
///
/// Cheap to clone for the sizes the engine deals in; ordering is plain
/// lexicographic byte order, which is what the storage maps iterate in.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    /// Create a key from raw bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Key(bytes)
    }

    /// The raw bytes of this key
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the key in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.as_bytes().to_vec())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key(s.into_bytes())
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key(bytes)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "{:02x?}", self.0),
        }
    }
}

/// Value stored under a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Explicit null
    Null,
    /// 64-bit signed integer
    I64(i64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

/// Transaction isolation level.
///
/// The engine's version selection implements read committed; the level is
/// carried per transaction and surfaced for upstream layers that map it to
/// driver-visible settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Dirty reads permitted
    ReadUncommitted,
    /// Only committed versions are visible (the default)
    ReadCommitted,
    /// Reads repeat within the transaction
    RepeatableRead,
    /// Full serializability
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}
