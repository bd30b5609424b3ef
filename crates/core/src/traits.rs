//! Storage collaborator traits
//!
//! The transaction engine does not own key/value persistence; it consumes an
//! ordered map interface. Any storage backend that can open named ordered
//! maps can host transactional data. `MemoryMap` in this crate is the
//! built-in implementation; embedders provide their own for durable backends.
//!
//! The value parameter `V` is generic because the engine stores its own
//! versioned cells in these maps, while the redo-replay path and tests work
//! with plain values.

use crate::types::Key;
use std::sync::Arc;

/// An ordered map from `Key` to `V`, shared across threads.
///
/// Implementations must be internally synchronized; the engine calls these
/// methods from multiple worker threads without external locking.
pub trait StorageMap<V: Clone>: Send + Sync {
    /// The map's name, unique within its storage
    fn name(&self) -> &str;

    /// Look up a value
    fn get(&self, key: &Key) -> Option<V>;

    /// Insert or replace a value, returning the previous one
    fn put(&self, key: Key, value: V) -> Option<V>;

    /// Remove a key, returning the previous value
    fn remove(&self, key: &Key) -> Option<V>;

    /// Get the value for `key`, inserting the result of `make` if absent.
    ///
    /// The insertion is atomic with respect to concurrent callers: exactly
    /// one inserted value wins and all callers observe it.
    fn get_or_insert_with(&self, key: &Key, make: &mut dyn FnMut() -> V) -> V;

    /// Visit entries in key order; return `false` from the visitor to stop.
    fn for_each(&self, visit: &mut dyn FnMut(&Key, &V) -> bool);

    /// Number of entries
    fn len(&self) -> usize;

    /// Whether the map is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this map lives only in memory.
    ///
    /// Non-memory maps get committed redo operations replayed into them when
    /// first opened after a restart.
    fn is_in_memory(&self) -> bool;
}

/// A factory of named ordered maps.
///
/// Opening the same name twice returns the same underlying map.
pub trait Storage<V: Clone>: Send + Sync {
    /// Open (or create) the named map
    fn open_map(&self, name: &str) -> Arc<dyn StorageMap<V>>;

    /// Whether a map with this name has been opened
    fn has_map(&self, name: &str) -> bool;
}
