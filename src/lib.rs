pub mod index;
pub mod storage;
pub mod transaction;

pub use index::{BTreeIndex, ColumnSpec, ColumnType, Iid, IndexError, IndexResult, IndexScan, Rid};
pub use storage::{
    BufferPoolManager, DiskManager, FileHandle, PageId, StorageError, StorageResult,
    BUFFER_POOL_SIZE, PAGE_SIZE,
};
pub use transaction::{Transaction, TransactionManager};
