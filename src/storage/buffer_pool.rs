use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;

use super::error::{StorageError, StorageResult};
use super::replacer::LruReplacer;
use super::{DiskManager, FileHandle, FrameId, PageId, INVALID_PAGE_NO, PAGE_SIZE};

/// Per-frame metadata, mutated only while the pool latch is held
#[derive(Debug)]
struct FrameMeta {
    /// PageId currently resident in this frame
    id: PageId,
    /// Number of outstanding borrows; the frame cannot be evicted while > 0
    pin_count: i32,
    /// Frame contents differ from the on-disk page
    dirty: bool,
}

fn vacant_page_id() -> PageId {
    PageId {
        fd: FileHandle(usize::MAX),
        page_no: INVALID_PAGE_NO,
    }
}

/// A buffer pool frame: one page-sized byte buffer plus metadata.
///
/// Frames are shared as `Arc<PageFrame>`. A frame returned by
/// [`BufferPoolManager::fetch_page`] or [`BufferPoolManager::new_page`]
/// carries one pin that the caller must release with
/// [`BufferPoolManager::unpin_page`], passing the correct dirty flag.
pub struct PageFrame {
    frame_id: FrameId,
    data: RwLock<Box<[u8]>>,
    meta: Mutex<FrameMeta>,
}

impl PageFrame {
    fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            data: RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
            meta: Mutex::new(FrameMeta {
                id: vacant_page_id(),
                pin_count: 0,
                dirty: false,
            }),
        }
    }

    fn lock_meta(&self) -> MutexGuard<'_, FrameMeta> {
        self.meta.lock().unwrap()
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn page_id(&self) -> PageId {
        self.lock_meta().id
    }

    pub fn page_no(&self) -> super::PageNo {
        self.lock_meta().id.page_no
    }

    pub fn pin_count(&self) -> i32 {
        self.lock_meta().pin_count
    }

    pub fn is_dirty(&self) -> bool {
        self.lock_meta().dirty
    }

    /// Shared access to the page bytes
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read().unwrap()
    }

    /// Exclusive access to the page bytes. Callers that modify the page must
    /// unpin it with `is_dirty = true`.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write().unwrap()
    }
}

/// Caches pages of open files in a fixed array of frames.
///
/// State transitions for a frame id: the free list (never held a page, or
/// freed by `delete_page`), the replacer's evictable set (resident, pin
/// count zero), or in use (pin count > 0). Methods take `&mut self`; callers
/// share the pool as `Arc<Mutex<BufferPoolManager>>`, and that mutex is the
/// single pool latch serializing every operation, disk I/O included.
pub struct BufferPoolManager {
    /// The frame array, fixed at construction
    frames: Vec<Arc<PageFrame>>,
    /// Resident pages: PageId -> frame holding it
    page_table: HashMap<PageId, FrameId>,
    /// Frames holding no page
    free_list: VecDeque<FrameId>,
    /// Eviction policy over unpinned resident frames
    replacer: LruReplacer,
    /// Underlying disk manager
    disk_manager: Arc<Mutex<DiskManager>>,
}

impl BufferPoolManager {
    pub fn new(disk_manager: Arc<Mutex<DiskManager>>) -> Self {
        Self::with_capacity(disk_manager, super::BUFFER_POOL_SIZE)
    }

    pub fn with_capacity(disk_manager: Arc<Mutex<DiskManager>>, pool_size: usize) -> Self {
        Self {
            frames: (0..pool_size).map(|i| Arc::new(PageFrame::new(i))).collect(),
            page_table: HashMap::new(),
            free_list: (0..pool_size).collect(),
            replacer: LruReplacer::new(pool_size),
            disk_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    /// Pick the frame to load a page into: a free frame if any, otherwise an
    /// evictable one
    fn find_victim(&mut self) -> Option<FrameId> {
        if let Some(frame_id) = self.free_list.pop_front() {
            return Some(frame_id);
        }
        self.replacer.victim()
    }

    /// Repurpose a frame for `new_page_id`: write back dirty contents, drop
    /// the old page-table entry, zero the buffer and install the new id
    fn update_page(&mut self, frame_id: FrameId, new_page_id: PageId) -> StorageResult<()> {
        let frame = Arc::clone(&self.frames[frame_id]);
        let mut meta = frame.lock_meta();

        if meta.dirty && meta.id.is_valid() {
            debug!(
                "evicting dirty page {:?} from frame {}",
                meta.id, frame_id
            );
            let data = frame.data.read().unwrap();
            self.disk_manager
                .lock()
                .unwrap()
                .write_page(meta.id.fd, meta.id.page_no, &data)?;
            meta.dirty = false;
        }
        if meta.id.is_valid() {
            self.page_table.remove(&meta.id);
        }

        frame.data.write().unwrap().fill(0);
        meta.id = new_page_id;
        meta.pin_count = 0;
        meta.dirty = false;
        self.page_table.insert(new_page_id, frame_id);
        Ok(())
    }

    /// Get the frame holding `page_id`, reading the page from disk if it is
    /// not resident. The returned frame is pinned; the caller must unpin it
    /// exactly once.
    pub fn fetch_page(&mut self, page_id: PageId) -> StorageResult<Arc<PageFrame>> {
        if let Some(&frame_id) = self.page_table.get(&page_id) {
            let frame = Arc::clone(&self.frames[frame_id]);
            frame.lock_meta().pin_count += 1;
            self.replacer.pin(frame_id);
            return Ok(frame);
        }

        let frame_id = self.find_victim().ok_or(StorageError::PoolExhausted)?;
        self.update_page(frame_id, page_id)?;

        let frame = Arc::clone(&self.frames[frame_id]);
        {
            let mut data = frame.data.write().unwrap();
            self.disk_manager
                .lock()
                .unwrap()
                .read_page(page_id.fd, page_id.page_no, &mut data)?;
        }
        frame.lock_meta().pin_count = 1;
        self.replacer.pin(frame_id);
        Ok(frame)
    }

    /// Release one pin on a resident page. At pin count zero the frame
    /// becomes evictable. The dirty flag is sticky: `is_dirty = false` never
    /// clears it.
    pub fn unpin_page(&mut self, page_id: PageId, is_dirty: bool) -> StorageResult<()> {
        let &frame_id = self
            .page_table
            .get(&page_id)
            .ok_or(StorageError::PageNotResident(page_id.page_no))?;

        let frame = &self.frames[frame_id];
        let mut meta = frame.lock_meta();
        if meta.pin_count <= 0 {
            return Err(StorageError::DoubleUnpin(page_id.page_no));
        }
        meta.pin_count -= 1;
        if meta.pin_count == 0 {
            self.replacer.unpin(frame_id);
        }
        if is_dirty {
            meta.dirty = true;
        }
        Ok(())
    }

    /// Write a resident page back to disk regardless of its pin count, and
    /// clear its dirty flag
    pub fn flush_page(&mut self, page_id: PageId) -> StorageResult<()> {
        let &frame_id = self
            .page_table
            .get(&page_id)
            .ok_or(StorageError::PageNotResident(page_id.page_no))?;

        let frame = &self.frames[frame_id];
        let data = frame.data.read().unwrap();
        self.disk_manager
            .lock()
            .unwrap()
            .write_page(page_id.fd, page_id.page_no, &data)?;
        frame.lock_meta().dirty = false;
        Ok(())
    }

    /// Allocate a fresh page on `fd` and materialize it in a frame. The
    /// returned frame is pinned and dirty; its buffer is zeroed. The
    /// assigned page number is available via [`PageFrame::page_id`].
    pub fn new_page(&mut self, fd: FileHandle) -> StorageResult<Arc<PageFrame>> {
        let frame_id = self.find_victim().ok_or(StorageError::PoolExhausted)?;

        let page_no = self.disk_manager.lock().unwrap().allocate_page(fd)?;
        let page_id = PageId::new(fd, page_no);
        self.update_page(frame_id, page_id)?;

        let frame = Arc::clone(&self.frames[frame_id]);
        {
            let mut meta = frame.lock_meta();
            meta.pin_count = 1;
            meta.dirty = true;
        }
        self.replacer.pin(frame_id);
        Ok(frame)
    }

    /// Drop a page from the pool and return its frame to the free list.
    /// A page that is not resident is already deleted as far as the pool is
    /// concerned. The disk page number is not reclaimed.
    pub fn delete_page(&mut self, page_id: PageId) -> StorageResult<()> {
        let frame_id = match self.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(()),
        };

        let frame = Arc::clone(&self.frames[frame_id]);
        let mut meta = frame.lock_meta();
        if meta.pin_count > 0 {
            return Err(StorageError::PagePinned {
                page_no: page_id.page_no,
                pin_count: meta.pin_count,
            });
        }

        self.replacer.pin(frame_id);
        if meta.dirty {
            let data = frame.data.read().unwrap();
            self.disk_manager
                .lock()
                .unwrap()
                .write_page(page_id.fd, page_id.page_no, &data)?;
        }
        self.page_table.remove(&page_id);

        frame.data.write().unwrap().fill(0);
        meta.id = PageId::invalid(page_id.fd);
        meta.pin_count = 0;
        meta.dirty = false;
        self.free_list.push_back(frame_id);
        debug!("deleted page {:?}, frame {} freed", page_id, frame_id);
        Ok(())
    }

    /// Write every resident page of `fd` back to disk and clear dirty flags
    pub fn flush_all_pages(&mut self, fd: FileHandle) -> StorageResult<()> {
        let resident: Vec<(PageId, FrameId)> = self
            .page_table
            .iter()
            .filter(|(id, _)| id.fd == fd)
            .map(|(&id, &frame_id)| (id, frame_id))
            .collect();

        let mut disk = self.disk_manager.lock().unwrap();
        for (page_id, frame_id) in resident {
            let frame = &self.frames[frame_id];
            let data = frame.data.read().unwrap();
            disk.write_page(page_id.fd, page_id.page_no, &data)?;
            frame.lock_meta().dirty = false;
        }
        Ok(())
    }

    /// Number of frames currently holding no page
    pub fn free_frame_count(&self) -> usize {
        self.free_list.len()
    }

    /// Number of unpinned resident frames
    pub fn evictable_frame_count(&self) -> usize {
        self.replacer.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_pool(pool_size: usize) -> (TempDir, Arc<Mutex<BufferPoolManager>>, FileHandle) {
        let temp_dir = tempfile::tempdir().unwrap();

        let mut disk = DiskManager::new();
        let fd = disk.create_file(temp_dir.path().join("test.db")).unwrap();

        let disk = Arc::new(Mutex::new(disk));
        let pool = Arc::new(Mutex::new(BufferPoolManager::with_capacity(
            disk, pool_size,
        )));
        (temp_dir, pool, fd)
    }

    /// Allocate `n` zeroed pages so fetches below have something to read
    fn preallocate(pool: &Arc<Mutex<BufferPoolManager>>, fd: FileHandle, n: i32) {
        let mut pool = pool.lock().unwrap();
        for _ in 0..n {
            let frame = pool.new_page(fd).unwrap();
            let id = frame.page_id();
            pool.unpin_page(id, true).unwrap();
            pool.flush_page(id).unwrap();
        }
    }

    #[test]
    fn test_new_page_pinned_and_dirty() {
        let (_dir, pool, fd) = setup_pool(4);
        let mut pool = pool.lock().unwrap();

        let frame = pool.new_page(fd).unwrap();
        assert_eq!(frame.page_no(), 0);
        assert_eq!(frame.pin_count(), 1);
        assert!(frame.is_dirty());
        assert!(frame.read().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fetch_hit_shares_frame() {
        let (_dir, pool, fd) = setup_pool(4);
        preallocate(&pool, fd, 1);
        let mut pool = pool.lock().unwrap();

        let a = pool.fetch_page(PageId::new(fd, 0)).unwrap();
        let b = pool.fetch_page(PageId::new(fd, 0)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.pin_count(), 2);
    }

    #[test]
    fn test_capacity_exhaustion() {
        let (_dir, pool, fd) = setup_pool(3);
        preallocate(&pool, fd, 4);
        let mut pool = pool.lock().unwrap();

        for page_no in 0..3 {
            pool.fetch_page(PageId::new(fd, page_no)).unwrap();
        }
        // All frames pinned: the next distinct fetch must fail
        let result = pool.fetch_page(PageId::new(fd, 3));
        assert!(matches!(result, Err(StorageError::PoolExhausted)));

        // A re-fetch of a resident page still succeeds
        pool.fetch_page(PageId::new(fd, 1)).unwrap();
    }

    #[test]
    fn test_eviction_prefers_lru() {
        // Pool of 2: fetch A and B, release A, fetch C evicts A; the next
        // fetch of A finds no victim because B and C stay pinned
        let (_dir, pool, fd) = setup_pool(2);
        preallocate(&pool, fd, 3);
        let mut pool = pool.lock().unwrap();

        let a = PageId::new(fd, 0);
        let b = PageId::new(fd, 1);
        let c = PageId::new(fd, 2);

        pool.fetch_page(a).unwrap();
        pool.fetch_page(b).unwrap();
        pool.unpin_page(a, false).unwrap();

        pool.fetch_page(c).unwrap();
        assert!(!pool.page_table.contains_key(&a));

        let result = pool.fetch_page(a);
        assert!(matches!(result, Err(StorageError::PoolExhausted)));
    }

    #[test]
    fn test_round_trip_durability() {
        // new_page -> write -> unpin dirty -> flush -> evict -> fetch
        let (_dir, pool, fd) = setup_pool(2);
        let mut pool = pool.lock().unwrap();

        let frame = pool.new_page(fd).unwrap();
        let id = frame.page_id();
        frame.write()[..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        pool.unpin_page(id, true).unwrap();
        pool.flush_page(id).unwrap();

        // Force the page out by filling the pool with new pages
        for _ in 0..2 {
            let f = pool.new_page(fd).unwrap();
            let fid = f.page_id();
            pool.unpin_page(fid, false).unwrap();
        }
        assert!(!pool.page_table.contains_key(&id));

        let frame = pool.fetch_page(id).unwrap();
        assert_eq!(&frame.read()[..4], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_dirty_page_written_back_on_eviction() {
        let (_dir, pool, fd) = setup_pool(1);
        let mut pool = pool.lock().unwrap();

        let frame = pool.new_page(fd).unwrap();
        let id = frame.page_id();
        frame.write()[0] = 77;
        pool.unpin_page(id, true).unwrap();

        // Evict by allocating another page into the only frame
        let other = pool.new_page(fd).unwrap();
        let other_id = other.page_id();
        pool.unpin_page(other_id, false).unwrap();

        let frame = pool.fetch_page(id).unwrap();
        assert_eq!(frame.read()[0], 77);
    }

    #[test]
    fn test_unpin_errors() {
        let (_dir, pool, fd) = setup_pool(2);
        let mut pool = pool.lock().unwrap();

        let missing = PageId::new(fd, 9);
        assert!(matches!(
            pool.unpin_page(missing, false),
            Err(StorageError::PageNotResident(9))
        ));

        let frame = pool.new_page(fd).unwrap();
        let id = frame.page_id();
        pool.unpin_page(id, false).unwrap();
        assert!(matches!(
            pool.unpin_page(id, false),
            Err(StorageError::DoubleUnpin(_))
        ));
    }

    #[test]
    fn test_dirty_flag_is_sticky() {
        let (_dir, pool, fd) = setup_pool(2);
        let mut pool = pool.lock().unwrap();

        let frame = pool.new_page(fd).unwrap();
        let id = frame.page_id();
        pool.unpin_page(id, false).unwrap();
        // new_page marked it dirty; the clean unpin must not clear that
        assert!(frame.is_dirty());

        pool.flush_page(id).unwrap();
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_delete_page() {
        let (_dir, pool, fd) = setup_pool(2);
        let mut pool = pool.lock().unwrap();

        // Deleting a page that is not resident succeeds
        pool.delete_page(PageId::new(fd, 42)).unwrap();

        let frame = pool.new_page(fd).unwrap();
        let id = frame.page_id();
        assert!(matches!(
            pool.delete_page(id),
            Err(StorageError::PagePinned { .. })
        ));

        pool.unpin_page(id, true).unwrap();
        pool.delete_page(id).unwrap();
        assert!(!pool.page_table.contains_key(&id));
        assert_eq!(pool.free_frame_count(), 2);

        // Contents were flushed before the frame was recycled
        let frame = pool.fetch_page(id).unwrap();
        assert_eq!(frame.pin_count(), 1);
    }

    #[test]
    fn test_at_most_one_frame_per_page() {
        let (_dir, pool, fd) = setup_pool(4);
        preallocate(&pool, fd, 2);
        let mut pool = pool.lock().unwrap();

        let a1 = pool.fetch_page(PageId::new(fd, 0)).unwrap();
        let _b = pool.fetch_page(PageId::new(fd, 1)).unwrap();
        let a2 = pool.fetch_page(PageId::new(fd, 0)).unwrap();
        assert_eq!(a1.frame_id(), a2.frame_id());

        let mut seen = std::collections::HashSet::new();
        for (_, &frame_id) in pool.page_table.iter() {
            assert!(seen.insert(frame_id), "frame mapped twice");
        }
    }

    #[test]
    fn test_flush_all_pages() {
        let temp_dir = tempfile::tempdir().unwrap();

        let mut disk = DiskManager::new();
        let fd_a = disk.create_file(temp_dir.path().join("a.db")).unwrap();
        let fd_b = disk.create_file(temp_dir.path().join("b.db")).unwrap();
        let disk = Arc::new(Mutex::new(disk));
        let mut pool = BufferPoolManager::with_capacity(disk, 4);

        for fd in [fd_a, fd_b] {
            let frame = pool.new_page(fd).unwrap();
            frame.write()[0] = fd.as_usize() as u8 + 1;
            let id = frame.page_id();
            pool.unpin_page(id, true).unwrap();
        }

        pool.flush_all_pages(fd_a).unwrap();

        // Only fd_a's page was flushed
        let a_clean = pool
            .page_table
            .iter()
            .filter(|(id, _)| id.fd == fd_a)
            .all(|(_, &f)| !pool.frames[f].is_dirty());
        let b_dirty = pool
            .page_table
            .iter()
            .filter(|(id, _)| id.fd == fd_b)
            .all(|(_, &f)| pool.frames[f].is_dirty());
        assert!(a_clean);
        assert!(b_dirty);
    }

    #[test]
    fn test_pin_accounting() {
        let (_dir, pool, fd) = setup_pool(4);
        preallocate(&pool, fd, 2);
        let mut pool = pool.lock().unwrap();

        let a = PageId::new(fd, 0);
        pool.fetch_page(a).unwrap();
        pool.fetch_page(a).unwrap();
        pool.fetch_page(a).unwrap();
        // Page 1 from preallocation is evictable, page 0 is pinned
        assert_eq!(pool.evictable_frame_count(), 1);

        pool.unpin_page(a, false).unwrap();
        pool.unpin_page(a, false).unwrap();
        // Still pinned once: not evictable yet
        assert_eq!(pool.evictable_frame_count(), 1);

        pool.unpin_page(a, false).unwrap();
        assert_eq!(pool.evictable_frame_count(), 2);
    }
}
