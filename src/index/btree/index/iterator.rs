use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::deserialize_node;
use crate::storage::buffer::BufferPoolManager;
use super::base::{BTreeIndex, PageReadGuard};

/// Pinned, read-latched position inside one leaf
struct LeafCursor<K> {
    page_id: PageId,
    guard: PageReadGuard,
    node: BTreeNode<K>,
    index: usize,
}

/// In-order scan over the leaf chain.
///
/// Holds the pin and the read latch on exactly one leaf at a time; both
/// are released before the next leaf is latched, and on drop.
pub struct BTreeIterator<K> {
    buffer_pool: Arc<BufferPoolManager>,
    cursor: Option<LeafCursor<K>>,
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Iterate from the smallest key
    pub fn iter(&self) -> Result<BTreeIterator<K>, BTreeError> {
        self.seek(None)
    }

    /// Iterate from the first key equal to or greater than `key`
    pub fn iter_from(&self, key: &K) -> Result<BTreeIterator<K>, BTreeError> {
        self.seek(Some(key))
    }

    fn seek(&self, key: Option<&K>) -> Result<BTreeIterator<K>, BTreeError> {
        let root_guard = self.root_latch.read();
        let root_id = *root_guard;
        if root_id == INVALID_PAGE_ID {
            return Ok(BTreeIterator {
                buffer_pool: self.buffer_pool.clone(),
                cursor: None,
            });
        }

        let page = self.buffer_pool.fetch_page(root_id)?;
        let mut guard = page.read_arc();
        drop(root_guard);

        let mut page_id = root_id;
        loop {
            let node = deserialize_node::<K>(&guard)?;
            if node.is_leaf {
                let index = match key {
                    Some(key) => node.keys.partition_point(|k| k < key),
                    None => 0,
                };
                return Ok(BTreeIterator {
                    buffer_pool: self.buffer_pool.clone(),
                    cursor: Some(LeafCursor {
                        page_id,
                        guard,
                        node,
                        index,
                    }),
                });
            }

            let child_id = match key {
                Some(key) => node.child_for(key),
                None => node.children[0],
            };
            let child_page = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child_page.read_arc();
            drop(guard);
            self.buffer_pool.unpin_page(page_id, false)?;

            guard = child_guard;
            page_id = child_id;
        }
    }
}

impl<K> BTreeIterator<K> {
    fn release_cursor(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            let page_id = cursor.page_id;
            drop(cursor);
            if let Err(e) = self.buffer_pool.unpin_page(page_id, false) {
                warn!("failed to unpin leaf {} on iterator release: {}", page_id, e);
            }
        }
    }
}

impl<K> BTreeIterator<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Release the current leaf, then pin and latch the next one
    fn move_to(&mut self, page_id: PageId) -> Result<(), BTreeError> {
        self.release_cursor();
        let page = self.buffer_pool.fetch_page(page_id)?;
        let guard = page.read_arc();
        let node = deserialize_node::<K>(&guard)?;
        self.cursor = Some(LeafCursor {
            page_id,
            guard,
            node,
            index: 0,
        });
        Ok(())
    }
}

impl<K> Iterator for BTreeIterator<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    type Item = (K, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let cursor = self.cursor.as_mut()?;
            if cursor.index < cursor.node.keys.len() {
                let item = (
                    cursor.node.keys[cursor.index].clone(),
                    cursor.node.values[cursor.index],
                );
                cursor.index += 1;
                return Some(item);
            }

            let next_leaf = cursor.node.next_leaf;
            if next_leaf == INVALID_PAGE_ID {
                self.release_cursor();
                return None;
            }
            if let Err(e) = self.move_to(next_leaf) {
                warn!("leaf chain traversal stopped at page {}: {}", next_leaf, e);
                self.release_cursor();
                return None;
            }
        }
    }
}

impl<K> Drop for BTreeIterator<K> {
    fn drop(&mut self) {
        self.release_cursor();
    }
}
