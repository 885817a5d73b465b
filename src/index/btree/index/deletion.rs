use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{internal_min_size, leaf_min_size};
use crate::index::btree::serialization::{deserialize_node, serialize_node};
use super::base::{BTreeIndex, WriteContext, WriteOp};

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Remove a key. Returns whether it was present.
    pub fn remove(&self, key: &K) -> Result<bool, BTreeError> {
        let root_guard = self.root_latch.write();
        if *root_guard == INVALID_PAGE_ID {
            return Ok(false);
        }

        let mut ctx = WriteContext {
            root_guard: Some(root_guard),
            stack: VecDeque::new(),
        };
        self.descend_for_write(&mut ctx, key, WriteOp::Remove)?;

        {
            let leaf = ctx
                .stack
                .back_mut()
                .expect("write descent leaves the target leaf latched");
            if !leaf.node.remove_from_leaf(key) {
                self.release_write_path(&mut ctx)?;
                return Ok(false);
            }
            leaf.dirty = true;
        }

        // Pages emptied by merges are reclaimed only after every latch is
        // released
        let mut freed_pages = Vec::new();
        self.rebalance_upward(&mut ctx, &mut freed_pages)?;
        self.release_write_path(&mut ctx)?;

        for page_id in freed_pages {
            self.buffer_pool.delete_page(page_id)?;
        }
        Ok(true)
    }

    /// Restore minimum occupancy from the leaf upward by stealing from an
    /// adjacent sibling or merging with it, recursing into the parent
    /// whenever a merge removed one of its separators.
    fn rebalance_upward(
        &self,
        ctx: &mut WriteContext<'_, K>,
        freed_pages: &mut Vec<PageId>,
    ) -> Result<(), BTreeError> {
        loop {
            let (is_root, is_leaf, key_count) = {
                let crumb = ctx
                    .stack
                    .back()
                    .expect("rebalance runs over a latched path");
                (
                    crumb.node.parent == INVALID_PAGE_ID,
                    crumb.node.is_leaf,
                    crumb.node.keys.len(),
                )
            };

            if is_root {
                if key_count == 0 {
                    self.shrink_root(ctx, is_leaf, freed_pages)?;
                }
                return Ok(());
            }

            let min = if is_leaf {
                leaf_min_size(self.leaf_max_size)
            } else {
                internal_min_size(self.internal_max_size)
            };
            if key_count >= min {
                return Ok(());
            }

            // The node underflowed; its parent is still latched right
            // below it on the ancestor queue.
            let mut crumb = ctx
                .stack
                .pop_back()
                .expect("underflow check just observed this crumb");
            let parent = ctx
                .stack
                .back_mut()
                .expect("an unsafe child keeps its parent latched");
            let child_pos = parent
                .node
                .child_index_of(crumb.page_id)
                .ok_or(BTreeError::InvalidPageFormat)?;

            // Prefer the left sibling when one exists
            let (sibling_pos, separator_index, sibling_is_left) = if child_pos > 0 {
                (child_pos - 1, child_pos - 1, true)
            } else {
                (child_pos + 1, child_pos, false)
            };
            let sibling_id = parent.node.children[sibling_pos];
            let sibling_page = self.buffer_pool.fetch_page(sibling_id)?;
            let mut sibling_guard = sibling_page.write_arc();
            let mut sibling = deserialize_node::<K>(&sibling_guard)?;

            if sibling.keys.len() > min {
                // Steal one entry across the shared separator
                if is_leaf {
                    if sibling_is_left {
                        crumb.node.steal_last_from_left_leaf(&mut sibling);
                        parent.node.keys[separator_index] = crumb.node.keys[0].clone();
                    } else {
                        crumb.node.steal_first_from_right_leaf(&mut sibling);
                        parent.node.keys[separator_index] = sibling.keys[0].clone();
                    }
                } else {
                    let separator = parent.node.keys[separator_index].clone();
                    let moved_child;
                    if sibling_is_left {
                        parent.node.keys[separator_index] =
                            crumb.node.steal_last_from_left_internal(&mut sibling, separator);
                        moved_child = crumb.node.children[0];
                    } else {
                        parent.node.keys[separator_index] =
                            crumb.node.steal_first_from_right_internal(&mut sibling, separator);
                        moved_child = *crumb
                            .node
                            .children
                            .last()
                            .ok_or(BTreeError::InvalidPageFormat)?;
                    }
                    self.set_parent(moved_child, crumb.page_id)?;
                }
                parent.dirty = true;

                serialize_node(&sibling, &mut sibling_guard)?;
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;

                serialize_node(&crumb.node, &mut crumb.guard)?;
                drop(crumb.guard);
                self.buffer_pool.unpin_page(crumb.page_id, true)?;
                return Ok(());
            }

            // Merge into the left page of the adjacent pair and drop the
            // separator between them from the parent
            let separator = parent.node.keys[separator_index].clone();
            if sibling_is_left {
                if is_leaf {
                    sibling.merge_right_leaf(crumb.node.clone());
                } else {
                    sibling.merge_right_internal(crumb.node.clone(), separator);
                    for &child_id in &crumb.node.children {
                        self.set_parent(child_id, sibling_id)?;
                    }
                }
                parent.node.remove_at_internal(separator_index);
                parent.dirty = true;
                freed_pages.push(crumb.page_id);

                serialize_node(&sibling, &mut sibling_guard)?;
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;

                drop(crumb.guard);
                self.buffer_pool.unpin_page(crumb.page_id, false)?;
            } else {
                let moved_children = sibling.children.clone();
                if is_leaf {
                    crumb.node.merge_right_leaf(sibling);
                } else {
                    crumb.node.merge_right_internal(sibling, separator);
                    for child_id in moved_children {
                        self.set_parent(child_id, crumb.page_id)?;
                    }
                }
                parent.node.remove_at_internal(separator_index);
                parent.dirty = true;
                freed_pages.push(sibling_id);

                serialize_node(&crumb.node, &mut crumb.guard)?;
                drop(crumb.guard);
                self.buffer_pool.unpin_page(crumb.page_id, true)?;

                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, false)?;
            }
            // the parent lost a separator and may underflow in turn
        }
    }

    /// Handle a root left with zero keys: an empty leaf root empties the
    /// tree; an internal root hands the tree to its sole child. The
    /// root-id latch is still held from the descent.
    fn shrink_root(
        &self,
        ctx: &mut WriteContext<'_, K>,
        is_leaf: bool,
        freed_pages: &mut Vec<PageId>,
    ) -> Result<(), BTreeError> {
        let crumb = ctx
            .stack
            .pop_back()
            .expect("shrink_root is called with the root latched");

        let new_root_id = if is_leaf {
            INVALID_PAGE_ID
        } else {
            crumb.node.children[0]
        };

        freed_pages.push(crumb.page_id);
        drop(crumb.guard);
        self.buffer_pool.unpin_page(crumb.page_id, false)?;

        if new_root_id != INVALID_PAGE_ID {
            self.set_parent(new_root_id, INVALID_PAGE_ID)?;
        }

        let root_guard = ctx
            .root_guard
            .as_mut()
            .expect("root latch is held whenever the root can shrink");
        **root_guard = new_root_id;
        self.persist_root(new_root_id)?;
        Ok(())
    }
}
