//! Tree-level B+tree algorithms on top of the buffer pool

use std::cmp::Ordering;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::storage::{BufferPoolManager, DiskManager, FileHandle, PageId, PageNo, PAGE_SIZE};
use crate::transaction::Transaction;

use super::error::{IndexError, IndexResult};
use super::header::IndexFileHeader;
use super::key::{compare_keys, ColumnSpec, Iid, Rid};
use super::node::{IndexSchema, NodeHandle};
use super::{FILE_HDR_PAGE, INIT_NUM_PAGES, INIT_ROOT_PAGE, LEAF_HEADER_PAGE, NO_PAGE};

/// What a descent intends to do at the leaf. Reserved for latch crabbing;
/// the current design serializes whole operations on the root latch instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Find,
    Insert,
    Delete,
}

/// Mutable tree metadata, guarded by the index root latch
struct TreeState {
    root_page: PageNo,
    first_leaf: PageNo,
    last_leaf: PageNo,
    num_pages: i32,
}

/// Handle to one open B+tree index file.
///
/// All reads and structural modifications serialize on the root latch; page
/// pins govern buffer-pool safety underneath it.
pub struct BTreeIndex {
    fd: FileHandle,
    schema: Arc<IndexSchema>,
    buffer_pool: Arc<Mutex<BufferPoolManager>>,
    disk_manager: Arc<Mutex<DiskManager>>,
    /// Root latch: one reader or writer at a time per index
    state: Mutex<TreeState>,
}

impl BTreeIndex {
    /// Create a new index file: header page, leaf-chain sentinel page and an
    /// empty root leaf.
    pub fn create<P: AsRef<Path>>(
        disk_manager: Arc<Mutex<DiskManager>>,
        buffer_pool: Arc<Mutex<BufferPoolManager>>,
        path: P,
        cols: Vec<ColumnSpec>,
        order: usize,
    ) -> IndexResult<Self> {
        let schema = Arc::new(IndexSchema::new(cols, order)?);

        let fd = disk_manager.lock().unwrap().create_file(&path)?;

        {
            let mut pool = buffer_pool.lock().unwrap();
            let hdr_frame = pool.new_page(fd)?;
            let sentinel_frame = pool.new_page(fd)?;
            let root_frame = pool.new_page(fd)?;
            debug_assert_eq!(hdr_frame.page_no(), FILE_HDR_PAGE);
            debug_assert_eq!(sentinel_frame.page_no(), LEAF_HEADER_PAGE);
            debug_assert_eq!(root_frame.page_no(), INIT_ROOT_PAGE);

            let root = NodeHandle::new(Arc::clone(&schema), root_frame);
            root.init(true, NO_PAGE, LEAF_HEADER_PAGE, LEAF_HEADER_PAGE);

            pool.unpin_page(PageId::new(fd, FILE_HDR_PAGE), true)?;
            pool.unpin_page(PageId::new(fd, LEAF_HEADER_PAGE), true)?;
            pool.unpin_page(root.page_id(), true)?;
        }

        let index = Self {
            fd,
            schema,
            buffer_pool,
            disk_manager,
            state: Mutex::new(TreeState {
                root_page: INIT_ROOT_PAGE,
                first_leaf: INIT_ROOT_PAGE,
                last_leaf: INIT_ROOT_PAGE,
                num_pages: INIT_NUM_PAGES,
            }),
        };
        index.close()?;
        Ok(index)
    }

    /// Open an existing index file and seed the page allocator past the
    /// pages it already holds
    pub fn open<P: AsRef<Path>>(
        disk_manager: Arc<Mutex<DiskManager>>,
        buffer_pool: Arc<Mutex<BufferPoolManager>>,
        path: P,
    ) -> IndexResult<Self> {
        let mut disk = disk_manager.lock().unwrap();
        let fd = disk.open_file(&path)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        disk.read_page(fd, FILE_HDR_PAGE, &mut buf)?;
        let hdr = IndexFileHeader::deserialize(&buf)?;
        disk.set_next_page_no(fd, hdr.num_pages)?;
        drop(disk);

        let schema = Arc::new(IndexSchema::new(hdr.cols, hdr.max_size)?);
        Ok(Self {
            fd,
            schema,
            buffer_pool,
            disk_manager,
            state: Mutex::new(TreeState {
                root_page: hdr.root_page,
                first_leaf: hdr.first_leaf,
                last_leaf: hdr.last_leaf,
                num_pages: hdr.num_pages,
            }),
        })
    }

    /// Persist the header and write every cached page of this index back to
    /// disk
    pub fn close(&self) -> IndexResult<()> {
        let state = self.state.lock().unwrap();
        let hdr = IndexFileHeader {
            root_page: state.root_page,
            first_leaf: state.first_leaf,
            last_leaf: state.last_leaf,
            num_pages: state.num_pages,
            max_size: self.schema.max_size,
            cols: self.schema.cols.clone(),
        };

        let mut pool = self.buffer_pool.lock().unwrap();
        let frame = pool.fetch_page(PageId::new(self.fd, FILE_HDR_PAGE))?;
        frame.write().copy_from_slice(&hdr.serialize());
        pool.unpin_page(frame.page_id(), true)?;
        pool.flush_all_pages(self.fd)?;
        Ok(())
    }

    pub fn fd(&self) -> FileHandle {
        self.fd
    }

    pub fn schema(&self) -> &Arc<IndexSchema> {
        &self.schema
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().root_page == NO_PAGE
    }

    #[cfg(test)]
    pub(crate) fn root_page(&self) -> PageNo {
        self.state.lock().unwrap().root_page
    }

    #[cfg(test)]
    pub(crate) fn first_leaf_page(&self) -> PageNo {
        self.state.lock().unwrap().first_leaf
    }

    #[cfg(test)]
    pub(crate) fn last_leaf_page(&self) -> PageNo {
        self.state.lock().unwrap().last_leaf
    }

    /// Fetch a node page, pinned. The caller must unpin it.
    pub(crate) fn fetch_node(&self, page_no: PageNo) -> IndexResult<NodeHandle> {
        let frame = self
            .buffer_pool
            .lock()
            .unwrap()
            .fetch_page(PageId::new(self.fd, page_no))?;
        Ok(NodeHandle::new(Arc::clone(&self.schema), frame))
    }

    /// Allocate a fresh node page, pinned and dirty. The caller must unpin it.
    fn create_node(&self, state: &mut TreeState) -> IndexResult<NodeHandle> {
        state.num_pages += 1;
        let frame = self.buffer_pool.lock().unwrap().new_page(self.fd)?;
        Ok(NodeHandle::new(Arc::clone(&self.schema), frame))
    }

    pub(crate) fn unpin_node(&self, node: &NodeHandle, dirty: bool) -> IndexResult<()> {
        self.buffer_pool
            .lock()
            .unwrap()
            .unpin_page(node.page_id(), dirty)?;
        Ok(())
    }

    /// Descend from the root to the leaf a key belongs to. Interior nodes
    /// are unpinned clean on the way down; the returned leaf stays pinned.
    fn find_leaf(
        &self,
        state: &TreeState,
        key: &[u8],
        _op: Operation,
        _find_first: bool,
    ) -> IndexResult<Option<NodeHandle>> {
        if state.root_page == NO_PAGE {
            return Ok(None);
        }
        let mut node = self.fetch_node(state.root_page)?;
        while !node.is_leaf() {
            let child = node.internal_lookup(key);
            self.unpin_node(&node, false)?;
            node = self.fetch_node(child)?;
        }
        Ok(Some(node))
    }

    /// Collect the rids stored under `key`, scanning forward over equal keys
    pub fn get_value(
        &self,
        key: &[u8],
        _txn: Option<&mut Transaction>,
    ) -> IndexResult<Vec<Rid>> {
        let state = self.state.lock().unwrap();
        let leaf = match self.find_leaf(&state, key, Operation::Find, false)? {
            Some(leaf) => leaf,
            None => return Ok(Vec::new()),
        };

        let mut rids = Vec::new();
        let mut pos = leaf.lower_bound(key);
        while pos < leaf.size()
            && compare_keys(&leaf.key_at(pos), key, &self.schema.cols) == Ordering::Equal
        {
            rids.push(leaf.rid_at(pos));
            pos += 1;
        }
        self.unpin_node(&leaf, false)?;
        Ok(rids)
    }

    /// Insert an entry. Returns the page number of the leaf it resides in,
    /// or `NO_PAGE` when the tree has no root. Inserting a key that already
    /// exists leaves the tree unchanged.
    pub fn insert_entry(
        &self,
        key: &[u8],
        rid: Rid,
        _txn: Option<&mut Transaction>,
    ) -> IndexResult<PageNo> {
        let mut state = self.state.lock().unwrap();
        let leaf = match self.find_leaf(&state, key, Operation::Insert, false)? {
            Some(leaf) => leaf,
            None => return Ok(NO_PAGE),
        };

        let before = leaf.size();
        let after = leaf.insert(key, rid);
        if after == before {
            self.unpin_node(&leaf, false)?;
            return Ok(leaf.page_no());
        }

        if leaf.size() > 0 {
            self.maintain_parent(&leaf)?;
        }

        let mut residing_page = leaf.page_no();
        if leaf.size() >= self.schema.max_size {
            let new_leaf = self.split(&mut state, &leaf)?;
            if compare_keys(key, &new_leaf.key_at(0), &self.schema.cols) != Ordering::Less {
                residing_page = new_leaf.page_no();
            }
            let separator = new_leaf.key_at(0);
            self.insert_into_parent(&mut state, &leaf, &separator, &new_leaf)?;
            self.unpin_node(&new_leaf, true)?;
        }

        self.unpin_node(&leaf, true)?;
        Ok(residing_page)
    }

    /// Delete the entry under `key`. Returns whether anything was removed.
    pub fn delete_entry(
        &self,
        key: &[u8],
        mut txn: Option<&mut Transaction>,
    ) -> IndexResult<bool> {
        let mut state = self.state.lock().unwrap();
        let leaf = match self.find_leaf(&state, key, Operation::Delete, false)? {
            Some(leaf) => leaf,
            None => return Ok(false),
        };

        let before = leaf.size();
        leaf.remove(key);
        if leaf.size() == before {
            self.unpin_node(&leaf, false)?;
            return Ok(false);
        }

        if leaf.size() > 0 {
            self.maintain_parent(&leaf)?;
        }
        self.coalesce_or_redistribute(&mut state, leaf, txn.as_mut().map(|t| &mut **t))?;
        Ok(true)
    }

    /// Split a full node in half, producing its new right sibling. Both
    /// nodes remain pinned for the caller.
    fn split(&self, state: &mut TreeState, node: &NodeHandle) -> IndexResult<NodeHandle> {
        let new_node = self.create_node(state)?;
        new_node.init(node.is_leaf(), node.parent(), NO_PAGE, NO_PAGE);

        let total = node.size();
        let mid = total / 2;
        let moved_keys = node.keys_from(mid);
        let moved_rids = node.rids_from(mid);
        new_node.insert_pairs(0, &moved_keys, &moved_rids);
        node.set_size(mid);
        debug!(
            "split node {} into {} ({} + {} keys)",
            node.page_no(),
            new_node.page_no(),
            mid,
            total - mid
        );

        if new_node.is_leaf() {
            new_node.set_prev_leaf(node.page_no());
            new_node.set_next_leaf(node.next_leaf());
            node.set_next_leaf(new_node.page_no());

            if new_node.next_leaf() != NO_PAGE {
                let next = self.fetch_node(new_node.next_leaf())?;
                next.set_prev_leaf(new_node.page_no());
                self.unpin_node(&next, true)?;
            }
            if state.last_leaf == node.page_no() || new_node.next_leaf() == LEAF_HEADER_PAGE {
                state.last_leaf = new_node.page_no();
            }
        } else {
            for i in 0..new_node.size() {
                self.maintain_child(&new_node, i)?;
            }
        }
        Ok(new_node)
    }

    /// After a split, push the new sibling's separator key into the parent,
    /// splitting ancestors as needed. A split root grows a fresh root above
    /// both halves.
    fn insert_into_parent(
        &self,
        state: &mut TreeState,
        left: &NodeHandle,
        separator: &[u8],
        right: &NodeHandle,
    ) -> IndexResult<()> {
        if left.parent() == NO_PAGE {
            let new_root = self.create_node(state)?;
            new_root.init(false, NO_PAGE, NO_PAGE, NO_PAGE);
            new_root.insert_pair(0, &left.key_at(0), Rid::new(left.page_no(), 0));
            new_root.insert_pair(1, separator, Rid::new(right.page_no(), 0));

            left.set_parent(new_root.page_no());
            right.set_parent(new_root.page_no());

            state.root_page = new_root.page_no();
            if state.first_leaf == NO_PAGE {
                state.first_leaf = left.page_no();
            }
            debug!("new root {} above {} and {}", new_root.page_no(), left.page_no(), right.page_no());
            self.unpin_node(&new_root, true)?;
            return Ok(());
        }

        let parent = self.fetch_node(left.parent())?;
        let pos = parent.find_child(left.page_no()) + 1;
        parent.insert_pair(pos, separator, Rid::new(right.page_no(), 0));
        right.set_parent(parent.page_no());

        if parent.size() >= self.schema.max_size {
            let parent_sibling = self.split(state, &parent)?;
            let parent_separator = parent_sibling.key_at(0);
            self.insert_into_parent(state, &parent, &parent_separator, &parent_sibling)?;
            self.unpin_node(&parent_sibling, true)?;
        }
        self.unpin_node(&parent, true)?;
        Ok(())
    }

    /// Rebalance after a deletion left `node` under-full. Consumes the
    /// handle: every page touched is unpinned here or in a callee. Returns
    /// whether a root page was removed.
    fn coalesce_or_redistribute(
        &self,
        state: &mut TreeState,
        node: NodeHandle,
        mut txn: Option<&mut Transaction>,
    ) -> IndexResult<bool> {
        if node.page_no() == state.root_page {
            let root_removed = self.adjust_root(state, &node)?;
            let root_id = node.page_id();
            self.unpin_node(&node, true)?;
            if root_removed {
                if let Some(txn) = txn.as_mut() {
                    txn.append_index_deleted_page(root_id);
                }
                self.buffer_pool.lock().unwrap().delete_page(root_id)?;
            }
            return Ok(root_removed);
        }

        if node.size() >= self.schema.min_size {
            self.unpin_node(&node, true)?;
            return Ok(false);
        }

        let parent = self.fetch_node(node.parent())?;
        let node_idx = parent.find_child(node.page_no());
        let neighbor_idx = if node_idx > 0 { node_idx - 1 } else { node_idx + 1 };
        let neighbor = self.fetch_node(parent.child_at(neighbor_idx))?;

        if node.size() + neighbor.size() >= 2 * self.schema.min_size {
            self.redistribute(&neighbor, &node, &parent, node_idx)?;
            self.unpin_node(&neighbor, true)?;
            self.unpin_node(&node, true)?;
            self.unpin_node(&parent, true)?;
            return Ok(false);
        }

        let parent_underfull = self.coalesce(state, neighbor, node, &parent, node_idx)?;
        if parent_underfull {
            return self.coalesce_or_redistribute(state, parent, txn.as_mut().map(|t| &mut **t));
        }
        self.unpin_node(&parent, true)?;
        Ok(false)
    }

    /// Move one entry from `neighbor` into `node` and refresh the parent's
    /// separator. With `node_idx == 0` the neighbor is the right sibling and
    /// donates its front entry; otherwise it is the left sibling and donates
    /// its back entry.
    fn redistribute(
        &self,
        neighbor: &NodeHandle,
        node: &NodeHandle,
        parent: &NodeHandle,
        node_idx: usize,
    ) -> IndexResult<()> {
        if node_idx == 0 {
            let key = neighbor.key_at(0);
            let rid = neighbor.rid_at(0);
            neighbor.erase_pair(0);
            node.insert_pair(node.size(), &key, rid);
            if !node.is_leaf() {
                self.maintain_child(node, node.size() - 1)?;
            }
            parent.set_key(node_idx + 1, &neighbor.key_at(0));
        } else {
            let last = neighbor.size() - 1;
            let key = neighbor.key_at(last);
            let rid = neighbor.rid_at(last);
            neighbor.erase_pair(last);
            node.insert_pair(0, &key, rid);
            if !node.is_leaf() {
                self.maintain_child(node, 0)?;
            }
            parent.set_key(node_idx, &node.key_at(0));
        }
        Ok(())
    }

    /// Merge `node` with its sibling into the left of the two, erase the
    /// separator from the parent and free the emptied page. Consumes both
    /// sibling handles. Returns whether the parent is now under-full (for a
    /// root parent: down to a single child).
    fn coalesce(
        &self,
        state: &mut TreeState,
        neighbor: NodeHandle,
        node: NodeHandle,
        parent: &NodeHandle,
        node_idx: usize,
    ) -> IndexResult<bool> {
        let (left, right, erase_idx) = if node_idx == 0 {
            (node, neighbor, 1)
        } else {
            (neighbor, node, node_idx)
        };

        let left_origin = left.size();
        let moved_keys = right.keys_from(0);
        let moved_rids = right.rids_from(0);
        left.insert_pairs(left_origin, &moved_keys, &moved_rids);
        debug!(
            "coalesced node {} into {} ({} keys)",
            right.page_no(),
            left.page_no(),
            left.size()
        );

        if left.is_leaf() {
            self.erase_leaf(&right)?;
            if state.last_leaf == right.page_no() {
                state.last_leaf = left.page_no();
            }
            if state.first_leaf == right.page_no() {
                state.first_leaf = left.page_no();
            }
        } else {
            for i in left_origin..left.size() {
                self.maintain_child(&left, i)?;
            }
        }

        parent.erase_pair(erase_idx);
        right.set_size(0);

        let right_id = right.page_id();
        self.unpin_node(&left, true)?;
        self.unpin_node(&right, true)?;
        self.buffer_pool.lock().unwrap().delete_page(right_id)?;

        if parent.page_no() == state.root_page {
            Ok(parent.size() <= 1)
        } else {
            Ok(parent.size() < self.schema.min_size)
        }
    }

    /// Shrink the tree when the root has been drained: an internal root with
    /// a single child promotes that child; an empty leaf root clears the
    /// tree. Returns whether the old root's page should be freed.
    fn adjust_root(&self, state: &mut TreeState, old_root: &NodeHandle) -> IndexResult<bool> {
        if !old_root.is_leaf() && old_root.size() == 1 {
            let child_page = old_root.child_at(0);
            state.root_page = child_page;
            let child = self.fetch_node(child_page)?;
            child.set_parent(NO_PAGE);
            self.unpin_node(&child, true)?;
            debug!("promoted node {} to root", child_page);
            return Ok(true);
        }
        if old_root.is_leaf() && old_root.size() == 0 {
            state.root_page = NO_PAGE;
            state.first_leaf = NO_PAGE;
            state.last_leaf = NO_PAGE;
            debug!("tree emptied");
            return Ok(true);
        }
        Ok(false)
    }

    /// Walk up from `node`, copying each node's minimum key into the parent
    /// slot pointing at it, until the stored separator already matches
    fn maintain_parent(&self, node: &NodeHandle) -> IndexResult<()> {
        let mut current_page = node.page_no();
        let mut current_parent = node.parent();
        let mut current_min = node.key_at(0);

        while current_parent != NO_PAGE {
            let parent = self.fetch_node(current_parent)?;
            let rank = parent.find_child(current_page);
            if parent.key_at(rank) == current_min {
                self.unpin_node(&parent, true)?;
                break;
            }
            parent.set_key(rank, &current_min);

            current_page = parent.page_no();
            current_parent = parent.parent();
            current_min = parent.key_at(0);
            self.unpin_node(&parent, true)?;
        }
        Ok(())
    }

    /// Point the parent field of `node`'s `child_idx`-th child back at `node`
    fn maintain_child(&self, node: &NodeHandle, child_idx: usize) -> IndexResult<()> {
        if !node.is_leaf() {
            let child = self.fetch_node(node.child_at(child_idx))?;
            child.set_parent(node.page_no());
            self.unpin_node(&child, true)?;
        }
        Ok(())
    }

    /// Unlink a leaf from the doubly linked leaf list before its page is
    /// freed
    fn erase_leaf(&self, leaf: &NodeHandle) -> IndexResult<()> {
        debug_assert!(leaf.is_leaf());

        let prev = self.fetch_node(leaf.prev_leaf())?;
        prev.set_next_leaf(leaf.next_leaf());
        self.unpin_node(&prev, true)?;

        let next = self.fetch_node(leaf.next_leaf())?;
        next.set_prev_leaf(leaf.prev_leaf());
        self.unpin_node(&next, true)?;
        Ok(())
    }

    /// Position of the first entry with key >= `key`, or `leaf_end()` when
    /// every key is smaller
    pub fn lower_bound(&self, key: &[u8]) -> IndexResult<Iid> {
        let state = self.state.lock().unwrap();
        self.seek_bound(&state, key, false)
    }

    /// Position just past the last entry with key <= `key`
    pub fn upper_bound(&self, key: &[u8]) -> IndexResult<Iid> {
        let state = self.state.lock().unwrap();
        self.seek_bound(&state, key, true)
    }

    fn seek_bound(&self, state: &TreeState, key: &[u8], upper: bool) -> IndexResult<Iid> {
        let mut leaf = match self.find_leaf(state, key, Operation::Find, true)? {
            Some(leaf) => leaf,
            None => return Ok(Iid::new(NO_PAGE, 0)),
        };

        loop {
            let pos = if upper {
                leaf.upper_bound(key)
            } else {
                leaf.lower_bound(key)
            };
            if pos < leaf.size() {
                let iid = Iid::new(leaf.page_no(), pos as i32);
                self.unpin_node(&leaf, false)?;
                return Ok(iid);
            }
            let next = leaf.next_leaf();
            self.unpin_node(&leaf, false)?;
            if next == LEAF_HEADER_PAGE || next == NO_PAGE {
                break;
            }
            leaf = self.fetch_node(next)?;
        }
        self.leaf_end_inner(state)
    }

    /// Position of the first entry in the index
    pub fn leaf_begin(&self) -> IndexResult<Iid> {
        let state = self.state.lock().unwrap();
        if state.first_leaf == NO_PAGE {
            return Ok(Iid::new(NO_PAGE, 0));
        }
        Ok(Iid::new(state.first_leaf, 0))
    }

    /// Position one past the last entry in the index
    pub fn leaf_end(&self) -> IndexResult<Iid> {
        let state = self.state.lock().unwrap();
        self.leaf_end_inner(&state)
    }

    fn leaf_end_inner(&self, state: &TreeState) -> IndexResult<Iid> {
        if state.last_leaf == NO_PAGE {
            return Ok(Iid::new(NO_PAGE, 0));
        }
        let node = self.fetch_node(state.last_leaf)?;
        let iid = Iid::new(state.last_leaf, node.size() as i32);
        self.unpin_node(&node, false)?;
        Ok(iid)
    }

    /// Resolve an iterator position to the rid stored there
    pub fn get_rid(&self, iid: Iid) -> IndexResult<Rid> {
        if iid.page_no == NO_PAGE {
            return Err(IndexError::EntryNotFound {
                page_no: iid.page_no,
                slot_no: iid.slot_no,
            });
        }
        let node = self.fetch_node(iid.page_no)?;
        if iid.slot_no < 0 || iid.slot_no as usize >= node.size() {
            self.unpin_node(&node, false)?;
            return Err(IndexError::EntryNotFound {
                page_no: iid.page_no,
                slot_no: iid.slot_no,
            });
        }
        let rid = node.rid_at(iid.slot_no as usize);
        self.unpin_node(&node, false)?;
        Ok(rid)
    }
}
