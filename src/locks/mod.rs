//! Advisory Entity Locks
//!
//! Soft, TTL-bound claims on (environment, table, entity) keys. A lock tells other
//! editors that someone is working on a record; it never blocks a write.

pub mod coordinator;
pub mod store;
pub mod types;

pub use coordinator::EntityLockCoordinator;
pub use store::{LockStore, MemoryLockStore, SqlLockStore};
pub use types::*;
