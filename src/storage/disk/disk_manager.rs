use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// DiskManager is responsible for handling the actual disk I/O operations.
///
/// The database file is a flat sequence of fixed-size pages indexed by
/// page id. Page allocation is not the disk manager's concern - the buffer
/// pool owns the monotonic page id counter.
pub struct DiskManager {
    db_file: Mutex<File>,
}

impl DiskManager {
    /// Create a new DiskManager with the specified database file
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)
            .map_err(DiskManagerError::IoError)?;

        Ok(Self {
            db_file: Mutex::new(file),
        })
    }

    /// Read a page from disk
    ///
    /// Reading past the end of the file yields a zeroed page image, so a
    /// freshly allocated page id can be fetched before its first flush.
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), DiskManagerError> {
        if page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = Self::page_offset(page_id);
        let mut buffer = [0u8; PAGE_SIZE];

        {
            let mut file = self.db_file.lock();

            let file_size = file.metadata().map_err(DiskManagerError::IoError)?.len();

            // Page was allocated but never written back; hand out zeroes
            if offset as u64 >= file_size {
                page.reset(page_id);
                return Ok(());
            }

            file.seek(SeekFrom::Start(offset as u64))
                .map_err(DiskManagerError::IoError)?;

            file.read_exact(&mut buffer)
                .map_err(DiskManagerError::IoError)?;
        }

        page.data.copy_from_slice(&buffer);
        page.page_id = page_id;

        Ok(())
    }

    /// Write a page to disk
    pub fn write_page(&self, page: &Page) -> Result<(), DiskManagerError> {
        if page.page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page.page_id));
        }

        let offset = Self::page_offset(page.page_id);

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset as u64))
            .map_err(DiskManagerError::IoError)?;

        file.write_all(&page.data)
            .map_err(DiskManagerError::IoError)?;

        file.flush().map_err(DiskManagerError::IoError)?;

        Ok(())
    }

    /// Number of pages currently persisted in the database file
    pub fn num_pages(&self) -> Result<u64, DiskManagerError> {
        let file = self.db_file.lock();
        let file_size = file.metadata().map_err(DiskManagerError::IoError)?.len();
        Ok(file_size / PAGE_SIZE as u64)
    }

    /// Calculate the offset of a page in the file
    fn page_offset(page_id: PageId) -> usize {
        (page_id as usize - 1) * PAGE_SIZE
    }
}
