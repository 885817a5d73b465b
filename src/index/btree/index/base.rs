use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{internal_min_size, leaf_min_size, BTreeNode};
use crate::index::btree::serialization::{deserialize_node, serialize_node};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::{HeaderPage, HEADER_PAGE_ID};

/// Owned read latch on a page, held across call boundaries
pub(crate) type PageReadGuard = ArcRwLockReadGuard<RawRwLock, crate::common::types::Page>;
/// Owned write latch on a page
pub(crate) type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, crate::common::types::Page>;

/// One latched page on the write path: its id, the held latch, the
/// decoded node image, and whether the image must be written back.
pub(crate) struct Breadcrumb<K> {
    pub page_id: PageId,
    pub guard: PageWriteGuard,
    pub node: BTreeNode<K>,
    pub dirty: bool,
}

/// Latches held by an in-flight insert or remove: the root-id latch (until
/// the path proves safe) and the ancestor queue, oldest first.
pub(crate) struct WriteContext<'a, K> {
    pub root_guard: Option<RwLockWriteGuard<'a, PageId>>,
    pub stack: VecDeque<Breadcrumb<K>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOp {
    Insert,
    Remove,
}

/// B+Tree index over buffer-pool pages.
///
/// The tree stores only page ids; the buffer pool owns every page.
/// Traversals pin and latch pages explicitly, using hand-over-hand
/// latching: readers hold at most a parent/child pair, writers keep the
/// path from the last unsafe ancestor downward. A dedicated root-id latch
/// guards `root_page_id` so root transitions are never observed torn.
pub struct BTreeIndex<K> {
    pub(crate) name: String,
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    pub(crate) root_latch: RwLock<PageId>,
    pub(crate) leaf_max_size: usize,
    pub(crate) internal_max_size: usize,
    pub(crate) _phantom: PhantomData<K>,
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Register a new, empty index in the header page directory
    pub fn create(
        buffer_pool: Arc<BufferPoolManager>,
        name: impl Into<String>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        debug_assert!(leaf_max_size >= 3, "leaf_max_size too small to split");
        debug_assert!(internal_max_size >= 3, "internal_max_size too small to split");
        let name = name.into();

        let header = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut page_guard = header.write();
            HeaderPage::insert_record(&mut page_guard, &name, INVALID_PAGE_ID)?;
        }
        buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;

        Ok(Self {
            name,
            buffer_pool,
            root_latch: RwLock::new(INVALID_PAGE_ID),
            leaf_max_size,
            internal_max_size,
            _phantom: PhantomData,
        })
    }

    /// Open an index previously registered in the header page
    pub fn open(
        buffer_pool: Arc<BufferPoolManager>,
        name: impl Into<String>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        let name = name.into();

        let header = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let root_page_id = {
            let page_guard = header.read();
            HeaderPage::get_record(&page_guard, &name)
        };
        buffer_pool.unpin_page(HEADER_PAGE_ID, false)?;

        let root_page_id = root_page_id.ok_or_else(|| BTreeError::IndexNotFound(name.clone()))?;

        Ok(Self {
            name,
            buffer_pool,
            root_latch: RwLock::new(root_page_id),
            leaf_max_size,
            internal_max_size,
            _phantom: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_latch.read()
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id() == INVALID_PAGE_ID
    }

    /// Point lookup with read-latch crabbing
    pub fn get_value(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        let root_guard = self.root_latch.read();
        let root_id = *root_guard;
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let page = self.buffer_pool.fetch_page(root_id)?;
        let mut guard = page.read_arc();
        drop(root_guard);

        let mut page_id = root_id;
        loop {
            let node = deserialize_node::<K>(&guard)?;
            if node.is_leaf {
                let result = node.leaf_lookup(key);
                drop(guard);
                self.buffer_pool.unpin_page(page_id, false)?;
                return Ok(result);
            }

            // latch the child before letting the parent go
            let child_id = node.child_for(key);
            let child_page = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child_page.read_arc();
            drop(guard);
            self.buffer_pool.unpin_page(page_id, false)?;

            guard = child_guard;
            page_id = child_id;
        }
    }

    /// Persist the root page id into the header directory. Callers hold
    /// the root-id latch across the transition.
    pub(crate) fn persist_root(&self, root_page_id: PageId) -> Result<(), BTreeError> {
        let header = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut page_guard = header.write();
            HeaderPage::update_record(&mut page_guard, &self.name, root_page_id)?;
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
        Ok(())
    }

    /// Rewrite a page's parent pointer in place
    pub(crate) fn set_parent(&self, page_id: PageId, parent: PageId) -> Result<(), BTreeError> {
        let page = self.buffer_pool.fetch_page(page_id)?;
        {
            let mut page_guard = page.write();
            crate::index::btree::serialization::write_parent(&mut page_guard, parent);
        }
        self.buffer_pool.unpin_page(page_id, true)?;
        Ok(())
    }

    /// Descend to the leaf covering `key`, write-latching the path and
    /// pruning ancestors as soon as the current node cannot split (insert)
    /// or underflow (remove) its parent.
    pub(crate) fn descend_for_write(
        &self,
        ctx: &mut WriteContext<'_, K>,
        key: &K,
        op: WriteOp,
    ) -> Result<(), BTreeError> {
        let mut page_id = ctx
            .root_guard
            .as_deref()
            .copied()
            .expect("write descent starts under the root-id latch");
        let mut depth = 0usize;

        loop {
            let page = self.buffer_pool.fetch_page(page_id)?;
            let guard = page.write_arc();
            let node = deserialize_node::<K>(&guard)?;

            if self.is_safe(&node, op, depth == 0) {
                self.release_write_path(ctx)?;
            }

            let next = if node.is_leaf {
                None
            } else {
                Some(node.child_for(key))
            };
            ctx.stack.push_back(Breadcrumb {
                page_id,
                guard,
                node,
                dirty: false,
            });

            match next {
                None => return Ok(()),
                Some(child_id) => {
                    page_id = child_id;
                    depth += 1;
                }
            }
        }
    }

    /// Whether an operation at or below this node can disturb its parent
    fn is_safe(&self, node: &BTreeNode<K>, op: WriteOp, is_root: bool) -> bool {
        match op {
            WriteOp::Insert => {
                let max = if node.is_leaf {
                    self.leaf_max_size
                } else {
                    self.internal_max_size
                };
                node.keys.len() < max - 1
            }
            WriteOp::Remove => {
                if is_root {
                    // a root with a single key may trigger a root transition
                    node.keys.len() > 1
                } else if node.is_leaf {
                    node.keys.len() > leaf_min_size(self.leaf_max_size)
                } else {
                    node.keys.len() > internal_min_size(self.internal_max_size)
                }
            }
        }
    }

    /// Drop the root-id latch and every held ancestor, writing back dirty
    /// node images before their latches go.
    pub(crate) fn release_write_path(&self, ctx: &mut WriteContext<'_, K>) -> Result<(), BTreeError> {
        ctx.root_guard.take();
        while let Some(crumb) = ctx.stack.pop_front() {
            self.release_crumb(crumb)?;
        }
        Ok(())
    }

    pub(crate) fn release_crumb(&self, mut crumb: Breadcrumb<K>) -> Result<(), BTreeError> {
        if crumb.dirty {
            serialize_node(&crumb.node, &mut crumb.guard)?;
        }
        let Breadcrumb {
            page_id,
            guard,
            dirty,
            ..
        } = crumb;
        drop(guard);
        self.buffer_pool.unpin_page(page_id, dirty)?;
        Ok(())
    }
}
