use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::common::config::DatabaseConfig;
use crate::common::types::{Frame, FrameId, FramePtr, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::page_table::ExtendibleHashTable;
use crate::storage::buffer::replacer::LruKReplacer;
use crate::storage::disk::DiskManager;

/// State guarded by the single pool latch
struct PoolState {
    free_list: VecDeque<FrameId>,
    replacer: LruKReplacer,
    next_page_id: PageId,
}

/// Fixed-capacity cache of disk pages.
///
/// Owns the frame array; maps resident page ids to frames through an
/// extendible hash table and picks eviction victims with an LRU-K
/// replacer. Public operations serialize under one pool latch; pin counts
/// keep latched pages out of the eviction path, so the pool only ever
/// touches the contents of unpinned (and therefore unlatched) pages.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<FramePtr>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    latch: Mutex<PoolState>,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new(config: &DatabaseConfig, disk_manager: Arc<DiskManager>) -> Result<Self, BufferPoolError> {
        let pool_size = config.pool_size;
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for i in 0..pool_size {
            let frame_id = i as FrameId;
            let page = Arc::new(parking_lot::RwLock::new(Page::new(INVALID_PAGE_ID)));
            frames.push(Arc::new(parking_lot::RwLock::new(Frame::new(frame_id, page))));
            free_list.push_back(frame_id);
        }

        // Resume the id counter past whatever the file already holds
        let next_page_id = disk_manager.num_pages()? as PageId + 1;

        Ok(Self {
            pool_size,
            frames,
            page_table: ExtendibleHashTable::new(config.bucket_size),
            latch: Mutex::new(PoolState {
                free_list,
                replacer: LruKReplacer::new(pool_size, config.replacer_k),
                next_page_id,
            }),
            disk_manager,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Allocate a fresh page and pin it
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut state = self.latch.lock();

        let frame_id = self.acquire_frame(&mut state)?;
        let page_id = state.next_page_id;
        state.next_page_id += 1;

        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);
        self.page_table.insert(page_id, frame_id);

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();
        frame_guard.pin_count = 1;
        frame_guard.is_dirty = false;

        let page_ptr = frame_guard.page.clone();
        page_ptr.write().reset(page_id);

        Ok((page_ptr, page_id))
    }

    /// Fetch a page from the buffer pool or disk, pinning it
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let mut state = self.latch.lock();

        // Resident: bump the pin count and shield the frame from eviction
        if let Some(frame_id) = self.page_table.find(&page_id) {
            let frame = &self.frames[frame_id as usize];
            let mut frame_guard = frame.write();
            frame_guard.pin_count += 1;
            state.replacer.record_access(frame_id);
            state.replacer.set_evictable(frame_id, false);
            return Ok(frame_guard.page.clone());
        }

        // Miss: take a frame and read the page image from disk
        let frame_id = self.acquire_frame(&mut state)?;
        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();
        let page_ptr = frame_guard.page.clone();

        {
            let mut page_guard = page_ptr.write();
            page_guard.reset(page_id);
            if let Err(e) = self.disk_manager.read_page(page_id, &mut page_guard) {
                // I/O failure: hand the frame back rather than leak it
                state.free_list.push_back(frame_id);
                return Err(e.into());
            }
        }

        frame_guard.pin_count = 1;
        frame_guard.is_dirty = false;
        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);
        self.page_table.insert(page_id, frame_id);

        Ok(page_ptr)
    }

    /// Unpin a page, with a sticky dirty flag
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let mut state = self.latch.lock();

        let frame_id = self
            .page_table
            .find(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();
        if frame_guard.pin_count == 0 {
            return Err(BufferPoolError::PageNotPinned(page_id));
        }

        frame_guard.pin_count -= 1;
        if is_dirty {
            frame_guard.is_dirty = true;
        }
        if frame_guard.pin_count == 0 {
            state.replacer.set_evictable(frame_id, true);
        }

        Ok(())
    }

    /// Write a resident page back to disk and clear its dirty flag
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let frame = {
            let _state = self.latch.lock();
            let frame_id = self
                .page_table
                .find(&page_id)
                .ok_or(BufferPoolError::PageNotFound(page_id))?;
            self.frames[frame_id as usize].clone()
        };

        // The pool latch is released before taking the page latch: a
        // writer may be holding the page latch while waiting on the pool.
        self.flush_frame(&frame)
    }

    /// Flush every resident page with a valid page id
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let frames: Vec<FramePtr> = {
            let _state = self.latch.lock();
            self.frames.iter().cloned().collect()
        };

        for frame in frames {
            let page_id = frame.read().page.read().page_id;
            if page_id != INVALID_PAGE_ID {
                self.flush_frame(&frame)?;
            }
        }
        Ok(())
    }

    /// Drop a page from the pool. `Ok(true)` when the page is gone (or was
    /// never resident), `Ok(false)` when a pin blocks the deletion.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool, BufferPoolError> {
        let mut state = self.latch.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(true);
        };

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();
        if frame_guard.pin_count > 0 {
            return Ok(false);
        }

        self.page_table.remove(&page_id);
        state.replacer.remove(frame_id);
        state.free_list.push_back(frame_id);

        frame_guard.is_dirty = false;
        frame_guard.page.write().reset(INVALID_PAGE_ID);

        Ok(true)
    }

    /// Write a frame's page to disk. The frame lock is never held while
    /// waiting for the page latch: a latch holder may itself be blocked on
    /// an unpin against this frame. The dirty flag is cleared up front, so
    /// a writer racing with the disk write re-marks the frame and the next
    /// flush picks its change up.
    fn flush_frame(&self, frame: &FramePtr) -> Result<(), BufferPoolError> {
        let page_ptr = {
            let mut frame_guard = frame.write();
            frame_guard.is_dirty = false;
            frame_guard.page.clone()
        };

        let page_guard = page_ptr.read();
        if page_guard.page_id == INVALID_PAGE_ID {
            return Ok(());
        }
        if let Err(e) = self.disk_manager.write_page(&page_guard) {
            frame.write().is_dirty = true;
            return Err(e.into());
        }
        Ok(())
    }

    /// Take a frame from the free list or evict a victim, flushing its
    /// dirty contents and dropping its page-table mapping.
    fn acquire_frame(&self, state: &mut MutexGuard<'_, PoolState>) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = state.replacer.evict() else {
            return Err(BufferPoolError::BufferPoolFull);
        };

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();
        let page_ptr = frame_guard.page.clone();
        let evicted_page_id = page_ptr.read().page_id;

        if frame_guard.is_dirty {
            self.disk_manager.write_page(&page_ptr.read())?;
            frame_guard.is_dirty = false;
        }
        if evicted_page_id != INVALID_PAGE_ID {
            self.page_table.remove(&evicted_page_id);
        }

        Ok(frame_id)
    }
}
