//! Forward iteration over a key range of an index

use crate::storage::PageNo;

use super::btree::BTreeIndex;
use super::error::IndexResult;
use super::key::{Iid, Rid};
use super::{LEAF_HEADER_PAGE, NO_PAGE};

/// Forward scan over index positions `[lower, upper)`.
///
/// Bounds come from [`BTreeIndex::lower_bound`] / [`BTreeIndex::upper_bound`]
/// or [`BTreeIndex::leaf_begin`] / [`BTreeIndex::leaf_end`]. The scan follows
/// `next_leaf` links and stops at the upper bound or the end of the leaf
/// chain, whichever comes first.
pub struct IndexScan<'a> {
    index: &'a BTreeIndex,
    iid: Iid,
    end: Iid,
}

fn chain_ended(page_no: PageNo) -> bool {
    page_no == NO_PAGE || page_no == LEAF_HEADER_PAGE
}

impl<'a> IndexScan<'a> {
    pub fn new(index: &'a BTreeIndex, lower: Iid, upper: Iid) -> Self {
        Self {
            index,
            iid: lower,
            end: upper,
        }
    }

    /// Current position
    pub fn iid(&self) -> Iid {
        self.iid
    }

    pub fn is_end(&self) -> bool {
        self.iid == self.end || chain_ended(self.iid.page_no)
    }

    /// Rid at the current position
    pub fn rid(&self) -> IndexResult<Rid> {
        self.index.get_rid(self.iid)
    }

    /// Key at the current position
    pub fn key(&self) -> IndexResult<Vec<u8>> {
        let node = self.index.fetch_node(self.iid.page_no)?;
        let key = node.key_at(self.iid.slot_no as usize);
        self.index.unpin_node(&node, false)?;
        Ok(key)
    }

    /// Advance to the next entry, hopping to the next leaf when the current
    /// one is exhausted
    pub fn next(&mut self) -> IndexResult<()> {
        debug_assert!(!self.is_end());
        let node = self.index.fetch_node(self.iid.page_no)?;
        debug_assert!(node.is_leaf());

        self.iid.slot_no += 1;
        if self.iid != self.end && self.iid.slot_no as usize >= node.size() {
            self.iid = Iid::new(node.next_leaf(), 0);
        }
        self.index.unpin_node(&node, false)?;
        Ok(())
    }
}
