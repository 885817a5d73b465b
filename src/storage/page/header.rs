use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, PAGE_SIZE};
use crate::storage::page::error::PageError;

/// The first allocated page holds the index directory
pub const HEADER_PAGE_ID: PageId = 1;

const COUNT_SIZE: usize = 2;
const NAME_LEN_SIZE: usize = 2;
const ROOT_ID_SIZE: usize = 4;
const MAX_NAME_LEN: usize = 256;

/// Directory of `(index_name, root_page_id)` records stored in the header
/// page.
///
/// Layout: a `u16` record count followed by variable-length records, each
/// a `u16` name length, the name bytes, and a `u32` root page id. Every
/// index re-writes its record here whenever its root moves, so reopening a
/// database file finds the trees again.
pub struct HeaderPage;

impl HeaderPage {
    pub fn init(page: &mut Page) {
        LittleEndian::write_u16(&mut page.data[0..COUNT_SIZE], 0);
    }

    pub fn record_count(page: &Page) -> u16 {
        LittleEndian::read_u16(&page.data[0..COUNT_SIZE])
    }

    /// Look up the root page id recorded for an index
    pub fn get_record(page: &Page, name: &str) -> Option<PageId> {
        let mut offset = COUNT_SIZE;
        for _ in 0..Self::record_count(page) {
            let (record_name_len, record_root) = Self::read_record(page, offset);
            let name_start = offset + NAME_LEN_SIZE;
            let record_name = &page.data[name_start..name_start + record_name_len];
            if record_name == name.as_bytes() {
                return Some(record_root);
            }
            offset = name_start + record_name_len + ROOT_ID_SIZE;
        }
        None
    }

    /// Append a new `(name, root_page_id)` record
    pub fn insert_record(page: &mut Page, name: &str, root_page_id: PageId) -> Result<(), PageError> {
        if name.len() > MAX_NAME_LEN {
            return Err(PageError::NameTooLong);
        }
        if Self::get_record(page, name).is_some() {
            return Err(PageError::DuplicateRecord);
        }

        let offset = Self::end_offset(page);
        let record_size = NAME_LEN_SIZE + name.len() + ROOT_ID_SIZE;
        if offset + record_size > PAGE_SIZE {
            return Err(PageError::InsufficientSpace);
        }

        LittleEndian::write_u16(&mut page.data[offset..offset + NAME_LEN_SIZE], name.len() as u16);
        let name_start = offset + NAME_LEN_SIZE;
        page.data[name_start..name_start + name.len()].copy_from_slice(name.as_bytes());
        LittleEndian::write_u32(
            &mut page.data[name_start + name.len()..name_start + name.len() + ROOT_ID_SIZE],
            root_page_id,
        );

        let count = Self::record_count(page);
        LittleEndian::write_u16(&mut page.data[0..COUNT_SIZE], count + 1);
        Ok(())
    }

    /// Overwrite the root page id of an existing record
    pub fn update_record(page: &mut Page, name: &str, root_page_id: PageId) -> Result<(), PageError> {
        let mut offset = COUNT_SIZE;
        for _ in 0..Self::record_count(page) {
            let (record_name_len, _) = Self::read_record(page, offset);
            let name_start = offset + NAME_LEN_SIZE;
            if &page.data[name_start..name_start + record_name_len] == name.as_bytes() {
                let root_start = name_start + record_name_len;
                LittleEndian::write_u32(
                    &mut page.data[root_start..root_start + ROOT_ID_SIZE],
                    root_page_id,
                );
                return Ok(());
            }
            offset = name_start + record_name_len + ROOT_ID_SIZE;
        }
        Err(PageError::RecordNotFound)
    }

    /// Remove a record, compacting the ones after it
    pub fn delete_record(page: &mut Page, name: &str) -> Result<(), PageError> {
        let mut offset = COUNT_SIZE;
        for _ in 0..Self::record_count(page) {
            let (record_name_len, _) = Self::read_record(page, offset);
            let name_start = offset + NAME_LEN_SIZE;
            let record_end = name_start + record_name_len + ROOT_ID_SIZE;
            if &page.data[name_start..name_start + record_name_len] == name.as_bytes() {
                let tail_end = Self::end_offset(page);
                page.data.copy_within(record_end..tail_end, offset);
                page.data[tail_end - (record_end - offset)..tail_end].fill(0);
                let count = Self::record_count(page);
                LittleEndian::write_u16(&mut page.data[0..COUNT_SIZE], count - 1);
                return Ok(());
            }
            offset = record_end;
        }
        Err(PageError::RecordNotFound)
    }

    fn read_record(page: &Page, offset: usize) -> (usize, PageId) {
        let name_len = LittleEndian::read_u16(&page.data[offset..offset + NAME_LEN_SIZE]) as usize;
        let root_start = offset + NAME_LEN_SIZE + name_len;
        let root = LittleEndian::read_u32(&page.data[root_start..root_start + ROOT_ID_SIZE]);
        (name_len, root)
    }

    /// Offset one past the last record
    fn end_offset(page: &Page) -> usize {
        let mut offset = COUNT_SIZE;
        for _ in 0..Self::record_count(page) {
            let (name_len, _) = Self::read_record(page, offset);
            offset += NAME_LEN_SIZE + name_len + ROOT_ID_SIZE;
        }
        offset
    }
}
