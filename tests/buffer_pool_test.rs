use anyhow::Result;

use kitedb::BufferPoolError;

mod common;
use common::create_test_buffer_pool;

#[test]
fn test_new_page() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    let (page, page_id) = buffer_pool.new_page()?;
    assert!(page_id > 0);

    {
        let page_guard = page.read();
        assert_eq!(page_guard.page_id, page_id);
    }

    buffer_pool.unpin_page(page_id, false)?;
    Ok(())
}

#[test]
fn test_fetch_page() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    let (_, page_id) = buffer_pool.new_page()?;
    buffer_pool.unpin_page(page_id, false)?;

    let fetched_page = buffer_pool.fetch_page(page_id)?;
    {
        let page_guard = fetched_page.read();
        assert_eq!(page_guard.page_id, page_id);
    }

    buffer_pool.unpin_page(page_id, false)?;
    Ok(())
}

#[test]
fn test_pool_exhaustion_and_recovery() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    // Pin every frame
    let mut page_ids = Vec::new();
    for _ in 0..10 {
        let (_, page_id) = buffer_pool.new_page()?;
        page_ids.push(page_id);
    }

    // The eleventh allocation has no victim to evict
    let result = buffer_pool.new_page();
    assert!(matches!(result, Err(BufferPoolError::BufferPoolFull)));
    assert!(matches!(
        buffer_pool.fetch_page(page_ids[0] + 100),
        Err(BufferPoolError::BufferPoolFull)
    ));

    // Releasing one pin frees a frame
    buffer_pool.unpin_page(page_ids[0], false)?;
    let (_, new_page_id) = buffer_pool.new_page()?;
    assert!(new_page_id > page_ids[9]);

    buffer_pool.unpin_page(new_page_id, false)?;
    Ok(())
}

#[test]
fn test_dirty_page_survives_eviction() -> Result<()> {
    // Only three frames, so page 1 is evicted while we allocate the rest
    let (buffer_pool, _temp_file) = create_test_buffer_pool(3)?;

    let mut page_ids = Vec::new();
    for i in 0u8..5 {
        let (page, page_id) = buffer_pool.new_page()?;
        {
            let mut page_guard = page.write();
            page_guard.data[0..4].fill(i + 1);
        }
        buffer_pool.unpin_page(page_id, true)?;
        page_ids.push(page_id);
    }

    // Each page comes back byte-identical to what was unpinned dirty
    for (i, &page_id) in page_ids.iter().enumerate() {
        let page = buffer_pool.fetch_page(page_id)?;
        {
            let page_guard = page.read();
            assert_eq!(&page_guard.data[0..4], &[i as u8 + 1; 4]);
        }
        buffer_pool.unpin_page(page_id, false)?;
    }
    Ok(())
}

#[test]
fn test_unpin_errors() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    let (_, page_id) = buffer_pool.new_page()?;
    buffer_pool.unpin_page(page_id, false)?;

    // Pin count is already zero
    assert!(matches!(
        buffer_pool.unpin_page(page_id, false),
        Err(BufferPoolError::PageNotPinned(_))
    ));

    // Unknown page
    assert!(matches!(
        buffer_pool.unpin_page(9999, false),
        Err(BufferPoolError::PageNotFound(9999))
    ));
    Ok(())
}

#[test]
fn test_flush_page_persists_across_pools() -> Result<()> {
    let (file, path) = common::create_temp_db_file()?;

    let page_id = {
        let disk_manager = std::sync::Arc::new(kitedb::DiskManager::new(&path)?);
        let buffer_pool =
            kitedb::BufferPoolManager::new(&common::test_config(), disk_manager)?;

        let (page, page_id) = buffer_pool.new_page()?;
        {
            let mut page_guard = page.write();
            let marker = b"flushed bytes";
            page_guard.data[64..64 + marker.len()].copy_from_slice(marker);
        }
        buffer_pool.unpin_page(page_id, true)?;
        buffer_pool.flush_page(page_id)?;
        page_id
    };

    // A fresh pool over the same file sees the flushed image
    let disk_manager = std::sync::Arc::new(kitedb::DiskManager::new(&path)?);
    let buffer_pool = kitedb::BufferPoolManager::new(&common::test_config(), disk_manager)?;
    let page = buffer_pool.fetch_page(page_id)?;
    {
        let page_guard = page.read();
        assert_eq!(&page_guard.data[64..64 + 13], b"flushed bytes");
    }
    buffer_pool.unpin_page(page_id, false)?;

    drop(file);
    Ok(())
}

#[test]
fn test_flush_invalid_page_fails() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;
    assert!(matches!(
        buffer_pool.flush_page(0),
        Err(BufferPoolError::InvalidPageId(0))
    ));
    Ok(())
}

#[test]
fn test_flush_all_pages() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    let mut page_ids = Vec::new();
    for i in 0..5u8 {
        let (page, page_id) = buffer_pool.new_page()?;
        {
            let mut page_guard = page.write();
            page_guard.data[10] = i;
        }
        buffer_pool.unpin_page(page_id, true)?;
        page_ids.push(page_id);
    }

    buffer_pool.flush_all_pages()?;

    for (i, &page_id) in page_ids.iter().enumerate() {
        let page = buffer_pool.fetch_page(page_id)?;
        assert_eq!(page.read().data[10], i as u8);
        buffer_pool.unpin_page(page_id, false)?;
    }
    Ok(())
}

#[test]
fn test_delete_page() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    let (_, page_id) = buffer_pool.new_page()?;

    // Still pinned: deletion refused
    assert!(!buffer_pool.delete_page(page_id)?);

    buffer_pool.unpin_page(page_id, false)?;
    assert!(buffer_pool.delete_page(page_id)?);

    // Not resident: nothing to do
    assert!(buffer_pool.delete_page(page_id)?);
    assert!(buffer_pool.delete_page(4242)?);
    Ok(())
}

#[test]
fn test_pin_count_tracks_fetches() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(3)?;

    let (_, page_id) = buffer_pool.new_page()?;
    let _second_handle = buffer_pool.fetch_page(page_id)?;

    // Two pins: one unpin is not enough to allow deletion
    buffer_pool.unpin_page(page_id, false)?;
    assert!(!buffer_pool.delete_page(page_id)?);

    buffer_pool.unpin_page(page_id, false)?;
    assert!(buffer_pool.delete_page(page_id)?);
    Ok(())
}
