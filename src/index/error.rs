use thiserror::Error;

use crate::storage::{PageNo, StorageError};

/// Result type for index operations
pub type IndexResult<T> = Result<T, IndexError>;

/// Errors that can occur during index operations
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid magic number in index file header")]
    InvalidMagic,

    #[error("Unsupported index file version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid column type tag: {0}")]
    InvalidColumnType(u8),

    #[error("Invalid length {actual} for a {ty} column: expected {expected}")]
    InvalidColumnLength {
        ty: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Index key has no columns")]
    EmptyKey,

    #[error("Node order {order} invalid: expected an even count between 4 and {capacity}")]
    InvalidOrder { order: usize, capacity: usize },

    #[error("Index entry not found at page {page_no}, slot {slot_no}")]
    EntryNotFound { page_no: PageNo, slot_no: i32 },
}
