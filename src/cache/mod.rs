//! Named cache stores for response snapshots.
//!
//! This module provides the storage backend the gateway is built on:
//! - A registry of named stores, one per cache generation
//! - Request-keyed response entries inside each store
//! - Atomic batch insertion (all entries land or none do)
//! - A SQLite implementation and an in-memory one for tests

#[cfg(test)]
mod memory;
mod storage;
mod traits;

#[cfg(test)]
pub use memory::MemoryStorage;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CachedEntry, RequestKey};
