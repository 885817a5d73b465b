use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::common::config::DatabaseConfig;
use crate::index::btree::BTreeIndex;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::disk::DiskManager;
use crate::storage::page::{HeaderPage, HEADER_PAGE_ID};
use crate::transaction::{IsolationLevel, LockManager, Transaction, TransactionManager};

/// Top-level owner of the storage core.
///
/// Wires the disk manager, buffer pool, lock manager and transaction
/// manager together from one config; nothing in the crate is a singleton.
/// Executors receive these components by reference.
pub struct DatabaseEngine {
    config: DatabaseConfig,
    buffer_pool: Arc<BufferPoolManager>,
    lock_manager: Arc<LockManager>,
    transaction_manager: Arc<TransactionManager>,
}

impl DatabaseEngine {
    /// Open (or create) a database file and start the background deadlock
    /// detector.
    pub fn open(db_path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        let fresh = disk_manager.num_pages()? == 0;
        let buffer_pool = Arc::new(BufferPoolManager::new(&config, disk_manager)?);

        if fresh {
            // the first allocated page becomes the index directory
            let (page, page_id) = buffer_pool.new_page()?;
            debug_assert_eq!(page_id, HEADER_PAGE_ID);
            {
                let mut page_guard = page.write();
                HeaderPage::init(&mut page_guard);
            }
            buffer_pool.unpin_page(page_id, true)?;
            buffer_pool.flush_page(page_id)?;
        }

        let lock_manager = Arc::new(LockManager::new());
        let transaction_manager = Arc::new(TransactionManager::new(lock_manager.clone()));
        lock_manager.start_deadlock_detection(
            transaction_manager.clone(),
            config.cycle_detection_interval,
        );

        Ok(Self {
            config,
            buffer_pool,
            lock_manager,
            transaction_manager,
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPoolManager> {
        &self.buffer_pool
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.transaction_manager
    }

    /// Register a new B+tree index over the shared buffer pool
    pub fn create_index<K>(&self, name: impl Into<String>) -> Result<BTreeIndex<K>>
    where
        K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
    {
        let index = BTreeIndex::create(
            self.buffer_pool.clone(),
            name,
            self.config.leaf_max_size,
            self.config.internal_max_size,
        )?;
        Ok(index)
    }

    /// Open an index registered in a previous session
    pub fn open_index<K>(&self, name: impl Into<String>) -> Result<BTreeIndex<K>>
    where
        K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
    {
        let index = BTreeIndex::open(
            self.buffer_pool.clone(),
            name,
            self.config.leaf_max_size,
            self.config.internal_max_size,
        )?;
        Ok(index)
    }

    pub fn begin_transaction(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        self.transaction_manager.begin(isolation_level)
    }

    /// Stop the deadlock detector and flush every resident page
    pub fn shutdown(&self) -> Result<()> {
        self.lock_manager.stop_deadlock_detection();
        self.buffer_pool.flush_all_pages()?;
        Ok(())
    }
}

impl Drop for DatabaseEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("engine shutdown failed: {}", e);
        }
    }
}
