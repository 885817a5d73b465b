use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::NamedTempFile;

use kitedb::storage::disk::DiskManager;
use kitedb::{BufferPoolManager, DatabaseConfig, DatabaseEngine};

// Small sizes so splits, merges and evictions happen early
#[allow(dead_code)]
pub fn test_config() -> DatabaseConfig {
    DatabaseConfig {
        pool_size: 32,
        replacer_k: 2,
        leaf_max_size: 4,
        internal_max_size: 4,
        bucket_size: 4,
        cycle_detection_interval: Duration::from_millis(50),
    }
}

// Create a temporary database file for testing
#[allow(dead_code)]
pub fn create_temp_db_file() -> Result<(NamedTempFile, String)> {
    let file = NamedTempFile::new()?;
    let path = file.path().to_str().unwrap().to_string();
    Ok((file, path))
}

// Create a buffer pool manager with a temporary database
#[allow(dead_code)]
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let config = DatabaseConfig {
        pool_size,
        ..test_config()
    };
    let disk_manager = Arc::new(DiskManager::new(path)?);
    let buffer_pool = Arc::new(BufferPoolManager::new(&config, disk_manager)?);
    Ok((buffer_pool, file))
}

// Create a full engine over a temporary database
#[allow(dead_code)]
pub fn create_test_engine() -> Result<(DatabaseEngine, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let engine = DatabaseEngine::open(path, test_config())?;
    Ok((engine, file))
}
