use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::prelude::FileExt;
use std::path::{Path, PathBuf};

use super::error::{StorageError, StorageResult};
use super::{FileHandle, PageNo, PAGE_SIZE};

/// Performs page-granular I/O against open files and hands out fresh page
/// numbers per file.
///
/// Each open file carries its own allocation cursor. Opening a file seeds
/// the cursor just past the pages already on disk; the index layer may
/// re-seed it from its header via [`DiskManager::set_next_page_no`] when the
/// header records a different high-water mark.
pub struct DiskManager {
    open_files: HashMap<FileHandle, FileEntry>,
    /// Canonical path of every open file, so reopening yields the same handle
    path_to_handle: HashMap<PathBuf, FileHandle>,
    next_handle: usize,
    max_open_files: usize,
}

struct FileEntry {
    file: File,
    path: PathBuf,
    /// Next page number this file will allocate
    next_page_no: PageNo,
}

impl DiskManager {
    pub fn new() -> Self {
        Self::with_max_files(128)
    }

    pub fn with_max_files(max_open_files: usize) -> Self {
        Self {
            open_files: HashMap::new(),
            path_to_handle: HashMap::new(),
            next_handle: 0,
            max_open_files,
        }
    }

    fn entry(&self, handle: FileHandle) -> StorageResult<&FileEntry> {
        self.open_files
            .get(&handle)
            .ok_or(StorageError::InvalidHandle(handle.0))
    }

    fn register(&mut self, file: File, path: PathBuf, next_page_no: PageNo) -> FileHandle {
        let handle = FileHandle(self.next_handle);
        self.next_handle += 1;
        self.path_to_handle.insert(path.clone(), handle);
        self.open_files.insert(
            handle,
            FileEntry {
                file,
                path,
                next_page_no,
            },
        );
        handle
    }

    /// Create a new paged file and open it. The allocation cursor starts at
    /// page 0.
    pub fn create_file<P: AsRef<Path>>(&mut self, path: P) -> StorageResult<FileHandle> {
        if self.open_files.len() >= self.max_open_files {
            return Err(StorageError::TooManyOpenFiles);
        }

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    StorageError::FileAlreadyExists(path.display().to_string())
                }
                _ => StorageError::Io(e),
            })?;

        let path = path.canonicalize()?;
        Ok(self.register(file, path, 0))
    }

    /// Open an existing paged file. Reopening a file that is already open
    /// returns its existing handle. The allocation cursor is seeded just
    /// past the pages currently on disk.
    pub fn open_file<P: AsRef<Path>>(&mut self, path: P) -> StorageResult<FileHandle> {
        let path_ref = path.as_ref();
        let path = path_ref
            .canonicalize()
            .map_err(|_| StorageError::FileNotFound(path_ref.display().to_string()))?;

        if let Some(&handle) = self.path_to_handle.get(&path) {
            return Ok(handle);
        }
        if self.open_files.len() >= self.max_open_files {
            return Err(StorageError::TooManyOpenFiles);
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let next_page_no = file.metadata()?.len().div_ceil(PAGE_SIZE as u64) as PageNo;
        Ok(self.register(file, path, next_page_no))
    }

    /// Close a file. Its handle becomes invalid; a later open yields a fresh
    /// one.
    pub fn close_file(&mut self, handle: FileHandle) -> StorageResult<()> {
        let entry = self
            .open_files
            .remove(&handle)
            .ok_or(StorageError::InvalidHandle(handle.0))?;
        self.path_to_handle.remove(&entry.path);
        Ok(())
    }

    /// Close a file and delete it from disk
    pub fn remove_file(&mut self, handle: FileHandle) -> StorageResult<()> {
        let entry = self
            .open_files
            .remove(&handle)
            .ok_or(StorageError::InvalidHandle(handle.0))?;
        self.path_to_handle.remove(&entry.path);
        std::fs::remove_file(&entry.path)?;
        Ok(())
    }

    /// Read a page. Bytes past the end of the file read as zero.
    pub fn read_page(
        &self,
        handle: FileHandle,
        page_no: PageNo,
        buffer: &mut [u8],
    ) -> StorageResult<()> {
        if buffer.len() != PAGE_SIZE {
            return Err(StorageError::InvalidPageSize {
                expected: PAGE_SIZE,
                actual: buffer.len(),
            });
        }
        debug_assert!(page_no >= 0);

        let entry = self.entry(handle)?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = entry.file.read_at(&mut buffer[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer[filled..].fill(0);
        Ok(())
    }

    /// Write a page at its offset. Writing past the current end of the file
    /// extends it; pages skipped over read back as zeros.
    pub fn write_page(
        &self,
        handle: FileHandle,
        page_no: PageNo,
        buffer: &[u8],
    ) -> StorageResult<()> {
        if buffer.len() != PAGE_SIZE {
            return Err(StorageError::InvalidPageSize {
                expected: PAGE_SIZE,
                actual: buffer.len(),
            });
        }
        debug_assert!(page_no >= 0);

        let entry = self.entry(handle)?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        entry.file.write_all_at(buffer, offset)?;
        Ok(())
    }

    /// Hand out a fresh page number for the file
    pub fn allocate_page(&mut self, handle: FileHandle) -> StorageResult<PageNo> {
        let entry = self
            .open_files
            .get_mut(&handle)
            .ok_or(StorageError::InvalidHandle(handle.0))?;
        let page_no = entry.next_page_no;
        entry.next_page_no += 1;
        Ok(page_no)
    }

    /// Override the allocation cursor, e.g. from an index file header whose
    /// page count is authoritative
    pub fn set_next_page_no(&mut self, handle: FileHandle, page_no: PageNo) -> StorageResult<()> {
        let entry = self
            .open_files
            .get_mut(&handle)
            .ok_or(StorageError::InvalidHandle(handle.0))?;
        entry.next_page_no = page_no;
        Ok(())
    }

    /// Number of pages in a file, by file length
    pub fn page_count(&self, handle: FileHandle) -> StorageResult<usize> {
        let entry = self.entry(handle)?;
        Ok(entry.file.metadata()?.len().div_ceil(PAGE_SIZE as u64) as usize)
    }

    /// Flush a file's OS buffers to disk
    pub fn sync_file(&self, handle: FileHandle) -> StorageResult<()> {
        self.entry(handle)?.file.sync_data()?;
        Ok(())
    }

    /// Flush all open files to disk
    pub fn sync_all(&self) -> StorageResult<()> {
        for entry in self.open_files.values() {
            entry.file.sync_data()?;
        }
        Ok(())
    }

    /// Check if a file is open
    pub fn is_file_open(&self, handle: FileHandle) -> bool {
        self.open_files.contains_key(&handle)
    }

    /// Number of currently open files
    pub fn open_file_count(&self) -> usize {
        self.open_files.len()
    }
}

impl Default for DiskManager {
    fn default() -> Self {
        Self::new()
    }
}
