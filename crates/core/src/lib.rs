//! Core types and traits for the Amber transaction engine
//!
//! This crate defines the foundational pieces shared by the durability and
//! transaction layers:
//! - `Key` / `Value`: the concrete key and value types the engine moves around
//! - `IsolationLevel`: carried per transaction, read-committed by default
//! - `AmberError`: error type hierarchy (`thiserror`)
//! - Traits: the storage collaborator seam (`StorageMap`, `Storage`)
//! - `MemoryMap` / `MemoryStorage`: in-memory ordered map implementation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod storage;
pub mod traits;
pub mod types;

pub use error::{AmberError, Result};
pub use storage::{MemoryMap, MemoryStorage};
pub use traits::{Storage, StorageMap};
pub use types::{IsolationLevel, Key, Value};
