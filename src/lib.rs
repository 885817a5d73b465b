// Export public modules
pub mod common;
pub mod engine;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use common::config::DatabaseConfig;
pub use engine::DatabaseEngine;
pub use index::btree::{BTreeError, BTreeIndex, BTreeIterator};
pub use storage::buffer::{BufferPoolError, BufferPoolManager};
pub use storage::disk::DiskManager;
pub use storage::page::PageError;
pub use transaction::{
    AbortReason, IsolationLevel, LockManager, LockMode, Transaction, TransactionError,
    TransactionManager, TransactionState,
};
