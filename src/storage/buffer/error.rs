use thiserror::Error;
use crate::common::types::PageId;
use crate::storage::disk::DiskManagerError;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("Page {0} not found in the buffer pool")]
    PageNotFound(PageId),

    #[error("Page {0} is not pinned")]
    PageNotPinned(PageId),

    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),

    #[error("Buffer pool is full")]
    BufferPoolFull,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Disk manager error: {0}")]
    DiskManagerError(#[from] DiskManagerError),
}
