use std::time::Duration;

/// Construction-time knobs for the storage core.
///
/// Everything is wired through constructors; nothing reads the
/// environment.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Number of frames in the buffer pool
    pub pool_size: usize,
    /// K parameter of the LRU-K replacer
    pub replacer_k: usize,
    /// Maximum number of key/value pairs in a B+tree leaf page
    pub leaf_max_size: usize,
    /// Maximum number of separator keys in a B+tree internal page
    pub internal_max_size: usize,
    /// Maximum number of entries per extendible-hash bucket
    pub bucket_size: usize,
    /// How often the deadlock detector wakes up
    pub cycle_detection_interval: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            pool_size: 64,
            replacer_k: 2,
            leaf_max_size: 32,
            internal_max_size: 32,
            bucket_size: 4,
            cycle_detection_interval: Duration::from_millis(50),
        }
    }
}
