use std::sync::Arc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type
pub type PageId = u32;

/// Buffer pool frame ID type
pub type FrameId = u32;

/// Transaction ID type
pub type TxnId = u32;

/// Table OID type
pub type TableOid = u32;

/// Sentinel for "no page". Valid page ids start at 1.
pub const INVALID_PAGE_ID: PageId = 0;

/// Sentinel for "no transaction".
pub const INVALID_TXN_ID: TxnId = 0;

/// Record ID - identifies a row by the page it lives on and its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rid {
    pub page_id: PageId,
    pub slot_num: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot_num: u32) -> Self {
        Self { page_id, slot_num }
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.page_id, self.slot_num)
    }
}

/// Page structure
///
/// The surrounding `RwLock` of a `PagePtr` is the page latch. It protects
/// the page contents and is independent of the pin count, which lives in
/// the owning frame.
#[derive(Debug, Clone)]
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
        }
    }

    /// Zero the contents and retag the page
    pub fn reset(&mut self, page_id: PageId) {
        self.data.fill(0);
        self.page_id = page_id;
    }
}

/// Smart pointer to a page
pub type PagePtr = Arc<RwLock<Page>>;

/// Buffer pool frame structure
#[derive(Debug)]
pub struct Frame {
    pub page: PagePtr,
    pub frame_id: FrameId,
    pub is_dirty: bool,
    pub pin_count: u32,
}

impl Frame {
    pub fn new(frame_id: FrameId, page: PagePtr) -> Self {
        Self {
            page,
            frame_id,
            is_dirty: false,
            pin_count: 0,
        }
    }
}

/// Smart pointer to a frame
pub type FramePtr = Arc<RwLock<Frame>>;
