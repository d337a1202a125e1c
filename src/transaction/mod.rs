//! Transaction plumbing threaded through index operations.
//!
//! The storage kernel carries a transaction parameter at its boundaries but
//! performs no locking, logging or rollback with it; the only state the
//! index layer records is the set of node pages it freed, for a later
//! recovery layer to reconcile.

use std::collections::HashSet;

use crate::storage::PageId;

pub type TxnId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Running,
    Committed,
    Aborted,
}

/// A transaction handle. Owned by the caller; the manager tracks it by id.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    state: TransactionState,
    index_deleted_pages: Vec<PageId>,
}

impl Transaction {
    fn new(id: TxnId) -> Self {
        Self {
            id,
            state: TransactionState::Running,
            index_deleted_pages: Vec::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Record an index node page freed while this transaction was active
    pub fn append_index_deleted_page(&mut self, page_id: PageId) {
        self.index_deleted_pages.push(page_id);
    }

    pub fn index_deleted_pages(&self) -> &[PageId] {
        &self.index_deleted_pages
    }
}

/// Allocates transaction ids and tracks which transactions are active
pub struct TransactionManager {
    next_txn_id: TxnId,
    active: HashSet<TxnId>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_txn_id: 0,
            active: HashSet::new(),
        }
    }

    /// Start a new transaction and return it
    pub fn begin(&mut self) -> Transaction {
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        self.active.insert(id);
        Transaction::new(id)
    }

    pub fn commit(&mut self, txn: &mut Transaction) {
        txn.index_deleted_pages.clear();
        txn.state = TransactionState::Committed;
        self.active.remove(&txn.id);
    }

    pub fn abort(&mut self, txn: &mut Transaction) {
        txn.index_deleted_pages.clear();
        txn.state = TransactionState::Aborted;
        self.active.remove(&txn.id);
    }

    pub fn is_active(&self, id: TxnId) -> bool {
        self.active.contains(&id)
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileHandle, PageId};

    #[test]
    fn test_begin_returns_fresh_transactions() {
        let mut manager = TransactionManager::new();
        let t1 = manager.begin();
        let t2 = manager.begin();

        assert_ne!(t1.id(), t2.id());
        assert_eq!(t1.state(), TransactionState::Running);
        assert!(manager.is_active(t1.id()));
        assert!(manager.is_active(t2.id()));
    }

    #[test]
    fn test_commit_and_abort() {
        let mut manager = TransactionManager::new();
        let mut t1 = manager.begin();
        let mut t2 = manager.begin();

        manager.commit(&mut t1);
        assert_eq!(t1.state(), TransactionState::Committed);
        assert!(!manager.is_active(t1.id()));

        manager.abort(&mut t2);
        assert_eq!(t2.state(), TransactionState::Aborted);
        assert!(!manager.is_active(t2.id()));
    }

    #[test]
    fn test_deleted_pages_drained_on_commit() {
        let mut manager = TransactionManager::new();
        let mut txn = manager.begin();

        let page = PageId::new(FileHandle(0), 5);
        txn.append_index_deleted_page(page);
        assert_eq!(txn.index_deleted_pages(), &[page]);

        manager.commit(&mut txn);
        assert!(txn.index_deleted_pages().is_empty());
    }
}
