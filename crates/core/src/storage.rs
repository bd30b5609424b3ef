//! In-memory ordered map storage
//!
//! `MemoryMap` is a `BTreeMap` behind a `parking_lot::RwLock`. It serves as
//! the reference `StorageMap` implementation and as the backend for tests.
//! A map can be constructed as `durable` purely to flip its `is_in_memory`
//! flag, so redo-log replay can be exercised without a real disk backend.

use crate::traits::{Storage, StorageMap};
use crate::types::Key;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Ordered in-memory map.
pub struct MemoryMap<V: Clone> {
    name: String,
    data: RwLock<BTreeMap<Key, V>>,
    in_memory: bool,
}

impl<V: Clone> MemoryMap<V> {
    /// Create an in-memory map (no redo replay on open)
    pub fn new(name: impl Into<String>) -> Self {
        MemoryMap {
            name: name.into(),
            data: RwLock::new(BTreeMap::new()),
            in_memory: true,
        }
    }

    /// Create a map that reports itself as durable.
    ///
    /// Contents are still held in memory; the flag only controls whether the
    /// engine replays committed redo operations into it on open.
    pub fn durable(name: impl Into<String>) -> Self {
        MemoryMap {
            name: name.into(),
            data: RwLock::new(BTreeMap::new()),
            in_memory: false,
        }
    }
}

impl<V: Clone + Send + Sync> StorageMap<V> for MemoryMap<V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &Key) -> Option<V> {
        self.data.read().get(key).cloned()
    }

    fn put(&self, key: Key, value: V) -> Option<V> {
        self.data.write().insert(key, value)
    }

    fn remove(&self, key: &Key) -> Option<V> {
        self.data.write().remove(key)
    }

    fn get_or_insert_with(&self, key: &Key, make: &mut dyn FnMut() -> V) -> V {
        if let Some(v) = self.data.read().get(key) {
            return v.clone();
        }
        let mut data = self.data.write();
        data.entry(key.clone()).or_insert_with(make).clone()
    }

    fn for_each(&self, visit: &mut dyn FnMut(&Key, &V) -> bool) {
        for (k, v) in self.data.read().iter() {
            if !visit(k, v) {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.data.read().len()
    }

    fn is_in_memory(&self) -> bool {
        self.in_memory
    }
}

/// Storage backed by `MemoryMap`s.
pub struct MemoryStorage<V: Clone> {
    maps: RwLock<HashMap<String, Arc<MemoryMap<V>>>>,
    durable: bool,
}

impl<V: Clone> MemoryStorage<V> {
    /// Storage whose maps report as in-memory
    pub fn new() -> Self {
        MemoryStorage {
            maps: RwLock::new(HashMap::new()),
            durable: false,
        }
    }

    /// Storage whose maps report as durable (subject to redo replay)
    pub fn durable() -> Self {
        MemoryStorage {
            maps: RwLock::new(HashMap::new()),
            durable: true,
        }
    }
}

impl<V: Clone> Default for MemoryStorage<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> Storage<V> for MemoryStorage<V> {
    fn open_map(&self, name: &str) -> Arc<dyn StorageMap<V>> {
        if let Some(map) = self.maps.read().get(name) {
            return map.clone();
        }
        let mut maps = self.maps.write();
        maps.entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(if self.durable {
                    MemoryMap::durable(name)
                } else {
                    MemoryMap::new(name)
                })
            })
            .clone()
    }

    fn has_map(&self, name: &str) -> bool {
        self.maps.read().contains_key(name)
    }
}
