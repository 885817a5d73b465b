use std::collections::{HashMap, VecDeque};

use crate::common::types::FrameId;

/// Eviction bookkeeping for one frame: the last K access timestamps
/// (oldest first) and whether the frame may currently be victimized.
struct FrameEntry {
    history: VecDeque<u64>,
    evictable: bool,
}

/// LRU-K page replacement policy.
///
/// A frame with fewer than K recorded accesses has an infinite backward
/// K-distance and is preferred as a victim over any frame with a full
/// history; ties within either group fall back to the earliest recorded
/// access (classic LRU on the front of the history).
pub struct LruKReplacer {
    entries: HashMap<FrameId, FrameEntry>,
    capacity: usize,
    k: usize,
    current_timestamp: u64,
    evictable_count: usize,
}

impl LruKReplacer {
    pub fn new(capacity: usize, k: usize) -> Self {
        debug_assert!(k > 0, "k must be at least 1");
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            k,
            current_timestamp: 0,
            evictable_count: 0,
        }
    }

    /// Record that a frame has been accessed, creating its entry on the
    /// first call. A frame id at or beyond the configured capacity is a
    /// caller bug.
    pub fn record_access(&mut self, frame_id: FrameId) {
        debug_assert!(
            (frame_id as usize) < self.capacity,
            "frame id {} out of range",
            frame_id
        );

        let entry = self.entries.entry(frame_id).or_insert_with(|| FrameEntry {
            history: VecDeque::new(),
            evictable: false,
        });

        entry.history.push_back(self.current_timestamp);
        self.current_timestamp += 1;
        if entry.history.len() > self.k {
            entry.history.pop_front();
        }
    }

    /// Toggle whether a frame may be evicted. Silent no-op for frames the
    /// replacer is not tracking.
    pub fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        debug_assert!(
            (frame_id as usize) < self.capacity,
            "frame id {} out of range",
            frame_id
        );

        if let Some(entry) = self.entries.get_mut(&frame_id) {
            if entry.evictable != evictable {
                entry.evictable = evictable;
                if evictable {
                    self.evictable_count += 1;
                } else {
                    self.evictable_count -= 1;
                }
            }
        }
    }

    /// Stop tracking a frame. Removing a tracked but non-evictable frame
    /// is a caller bug; removing an untracked frame is a no-op.
    pub fn remove(&mut self, frame_id: FrameId) {
        if let Some(entry) = self.entries.get(&frame_id) {
            debug_assert!(
                entry.evictable,
                "remove called on non-evictable frame {}",
                frame_id
            );
            self.entries.remove(&frame_id);
            self.evictable_count -= 1;
        }
    }

    /// Choose and remove a victim frame, or `None` if nothing is
    /// evictable.
    pub fn evict(&mut self) -> Option<FrameId> {
        let mut victim: Option<FrameId> = None;
        let mut victim_front = u64::MAX;
        let mut victim_full = true;

        for (&frame_id, entry) in &self.entries {
            if !entry.evictable {
                continue;
            }
            let Some(&front) = entry.history.front() else {
                continue;
            };
            let full = entry.history.len() == self.k;

            let better = match victim {
                None => true,
                // a partial history beats any full one; otherwise the
                // earlier first access wins
                Some(_) if full != victim_full => !full,
                Some(_) => front < victim_front,
            };
            if better {
                victim = Some(frame_id);
                victim_front = front;
                victim_full = full;
            }
        }

        if let Some(frame_id) = victim {
            self.entries.remove(&frame_id);
            self.evictable_count -= 1;
        }
        victim
    }

    /// Number of evictable frames currently tracked
    pub fn size(&self) -> usize {
        self.evictable_count
    }
}
