use std::io;
use thiserror::Error;

use super::PageNo;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("Invalid file handle: {0}")]
    InvalidHandle(usize),

    #[error("File handle limit reached")]
    TooManyOpenFiles,

    #[error("Invalid page size: expected {expected}, got {actual}")]
    InvalidPageSize { expected: usize, actual: usize },

    #[error("Buffer pool exhausted: all frames are pinned")]
    PoolExhausted,

    #[error("Page not resident in buffer pool: page_no={0}")]
    PageNotResident(PageNo),

    #[error("Unpin on page with no outstanding pins: page_no={0}")]
    DoubleUnpin(PageNo),

    #[error("Cannot delete pinned page: page_no={page_no}, pin_count={pin_count}")]
    PagePinned { page_no: PageNo, pin_count: i32 },
}

pub type StorageResult<T> = Result<T, StorageError>;
