use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::common::types::{Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::serialize_node;
use super::base::{BTreeIndex, WriteContext, WriteOp};

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Insert a key-value pair. Returns false for a duplicate key.
    pub fn insert(&self, key: K, rid: Rid) -> Result<bool, BTreeError> {
        let mut root_guard = self.root_latch.write();

        // First insert starts a single-leaf tree
        if *root_guard == INVALID_PAGE_ID {
            let (page, page_id) = self.buffer_pool.new_page()?;
            let mut node = BTreeNode::new_leaf(INVALID_PAGE_ID);
            node.keys.push(key);
            node.values.push(rid);
            {
                let mut page_guard = page.write();
                serialize_node(&node, &mut page_guard)?;
            }
            self.buffer_pool.unpin_page(page_id, true)?;
            *root_guard = page_id;
            self.persist_root(page_id)?;
            return Ok(true);
        }

        let mut ctx = WriteContext {
            root_guard: Some(root_guard),
            stack: VecDeque::new(),
        };
        self.descend_for_write(&mut ctx, &key, WriteOp::Insert)?;

        {
            let leaf = ctx
                .stack
                .back_mut()
                .expect("write descent leaves the target leaf latched");
            if !leaf.node.insert_into_leaf(key, rid) {
                self.release_write_path(&mut ctx)?;
                return Ok(false);
            }
            leaf.dirty = true;
        }

        self.propagate_splits(&mut ctx)?;
        self.release_write_path(&mut ctx)?;
        Ok(true)
    }

    /// Split overflowing pages from the leaf upward. The ancestor queue
    /// holds every page that may overflow; anything released earlier was
    /// proven safe during the descent.
    fn propagate_splits(&self, ctx: &mut WriteContext<'_, K>) -> Result<(), BTreeError> {
        loop {
            let overflowing = {
                let crumb = ctx
                    .stack
                    .back()
                    .expect("split propagation runs over a latched path");
                let max = if crumb.node.is_leaf {
                    self.leaf_max_size
                } else {
                    self.internal_max_size
                };
                crumb.node.keys.len() >= max
            };
            if !overflowing {
                return Ok(());
            }

            let mut crumb = ctx
                .stack
                .pop_back()
                .expect("overflow check just observed this crumb");

            // Carve off the right sibling
            let (right_page, right_page_id) = self.buffer_pool.new_page()?;
            let (mut right, separator) = if crumb.node.is_leaf {
                let pair = crumb.node.split_leaf();
                crumb.node.next_leaf = right_page_id;
                pair
            } else {
                crumb.node.split_internal()
            };

            // Children that migrated to the sibling hang off it now
            if !right.is_leaf {
                for &child_id in &right.children {
                    self.set_parent(child_id, right_page_id)?;
                }
            }

            if let Some(parent) = ctx.stack.back_mut() {
                right.parent = parent.page_id;
                parent.node.insert_into_internal(separator, right_page_id);
                parent.dirty = true;

                {
                    let mut right_guard = right_page.write();
                    serialize_node(&right, &mut right_guard)?;
                }
                self.buffer_pool.unpin_page(right_page_id, true)?;

                serialize_node(&crumb.node, &mut crumb.guard)?;
                drop(crumb.guard);
                self.buffer_pool.unpin_page(crumb.page_id, true)?;
                // the parent is now at the back and may overflow in turn
            } else {
                // The root itself split: grow a new root over both halves,
                // with the root-id latch still held from the descent.
                let (root_page, new_root_id) = self.buffer_pool.new_page()?;
                let mut new_root = BTreeNode::new_internal(INVALID_PAGE_ID);
                new_root.children.push(crumb.page_id);
                new_root.keys.push(separator);
                new_root.children.push(right_page_id);

                crumb.node.parent = new_root_id;
                right.parent = new_root_id;

                {
                    let mut root_page_guard = root_page.write();
                    serialize_node(&new_root, &mut root_page_guard)?;
                }
                self.buffer_pool.unpin_page(new_root_id, true)?;

                {
                    let mut right_guard = right_page.write();
                    serialize_node(&right, &mut right_guard)?;
                }
                self.buffer_pool.unpin_page(right_page_id, true)?;

                serialize_node(&crumb.node, &mut crumb.guard)?;
                drop(crumb.guard);
                self.buffer_pool.unpin_page(crumb.page_id, true)?;

                let root_guard = ctx
                    .root_guard
                    .as_mut()
                    .expect("root latch is held whenever the root can split");
                **root_guard = new_root_id;
                self.persist_root(new_root_id)?;
                return Ok(());
            }
        }
    }
}
