use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;

/// Bucket holding at most `capacity` entries at a given local depth
struct Bucket<K, V> {
    entries: Vec<(K, V)>,
    depth: u32,
    capacity: usize,
}

impl<K: Eq + Clone, V: Clone> Bucket<K, V> {
    fn new(capacity: usize, depth: u32) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            depth,
            capacity,
        }
    }

    fn find(&self, key: &K) -> Option<V> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn remove(&mut self, key: &K) -> bool {
        if let Some(pos) = self.entries.iter().position(|(k, _)| k == key) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    /// Insert or update. Returns false when the bucket is full and the key
    /// is not already present.
    fn insert(&mut self, key: K, value: V) -> bool {
        if let Some(pos) = self.entries.iter().position(|(k, _)| *k == key) {
            self.entries[pos].1 = value;
            return true;
        }
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.push((key, value));
        true
    }
}

struct Directory<K, V> {
    global_depth: u32,
    num_buckets: usize,
    slots: Vec<Arc<Mutex<Bucket<K, V>>>>,
}

/// Extendible hash table used as the buffer pool's page table.
///
/// The directory holds `2^global_depth` slot references; several slots may
/// share one bucket while its local depth is below the global depth. Full
/// buckets are split on insert; shrinking is not supported, so the number
/// of buckets never decreases.
pub struct ExtendibleHashTable<K, V> {
    bucket_size: usize,
    dir: Mutex<Directory<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> ExtendibleHashTable<K, V> {
    pub fn new(bucket_size: usize) -> Self {
        let dir = Directory {
            global_depth: 0,
            num_buckets: 1,
            slots: vec![Arc::new(Mutex::new(Bucket::new(bucket_size, 0)))],
        };
        Self {
            bucket_size,
            dir: Mutex::new(dir),
        }
    }

    fn hash(key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn index_of(global_depth: u32, key: &K) -> usize {
        let mask = (1u64 << global_depth) - 1;
        (Self::hash(key) & mask) as usize
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let dir = self.dir.lock();
        let bucket = dir.slots[Self::index_of(dir.global_depth, key)].clone();
        let result = bucket.lock().find(key);
        result
    }

    pub fn remove(&self, key: &K) -> bool {
        let dir = self.dir.lock();
        let bucket = dir.slots[Self::index_of(dir.global_depth, key)].clone();
        let removed = bucket.lock().remove(key);
        removed
    }

    /// Insert the key-value pair, updating the value for a duplicate key.
    ///
    /// Splits full buckets until the target bucket accepts the entry; each
    /// round either inserts or strictly grows the structure, so the loop
    /// terminates.
    pub fn insert(&self, key: K, value: V) {
        let mut dir = self.dir.lock();

        loop {
            let index = Self::index_of(dir.global_depth, &key);
            let bucket = dir.slots[index].clone();
            let mut bucket_guard = bucket.lock();
            if bucket_guard.insert(key.clone(), value.clone()) {
                return;
            }

            // Full bucket: grow the directory if its local depth caught up
            // with the global depth, then split it one level deeper.
            if bucket_guard.depth == dir.global_depth {
                dir.global_depth += 1;
                let existing = dir.slots.clone();
                dir.slots.extend(existing);
            }

            bucket_guard.depth += 1;
            let local_depth = bucket_guard.depth;
            let mask = 1u64 << (local_depth - 1);

            let mut zero_bucket = Bucket::new(self.bucket_size, local_depth);
            let mut one_bucket = Bucket::new(self.bucket_size, local_depth);
            for (k, v) in bucket_guard.entries.drain(..) {
                if Self::hash(&k) & mask != 0 {
                    one_bucket.entries.push((k, v));
                } else {
                    zero_bucket.entries.push((k, v));
                }
            }
            drop(bucket_guard);

            let zero_bucket = Arc::new(Mutex::new(zero_bucket));
            let one_bucket = Arc::new(Mutex::new(one_bucket));
            for (slot_index, slot) in dir.slots.iter_mut().enumerate() {
                if !Arc::ptr_eq(slot, &bucket) {
                    continue;
                }
                if slot_index as u64 & mask != 0 {
                    *slot = one_bucket.clone();
                } else {
                    *slot = zero_bucket.clone();
                }
            }
            dir.num_buckets += 1;
        }
    }

    pub fn global_depth(&self) -> u32 {
        self.dir.lock().global_depth
    }

    pub fn local_depth(&self, dir_index: usize) -> u32 {
        let dir = self.dir.lock();
        let depth = dir.slots[dir_index].lock().depth;
        depth
    }

    pub fn num_buckets(&self) -> usize {
        self.dir.lock().num_buckets
    }
}
