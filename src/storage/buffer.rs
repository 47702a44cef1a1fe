pub mod replacer;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::{PageId, PageManager, PAGE_SIZE};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use replacer::{FrameId, Replacer};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

struct Frame {
    data: Box<[u8; PAGE_SIZE]>,
    page_id: Option<PageId>,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
            page_id: None,
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    fn reset(&mut self) {
        self.page_id = None;
        self.pin_count.store(0, Ordering::SeqCst);
        self.is_dirty.store(false, Ordering::SeqCst);
        self.data.fill(0);
    }
}

/// Page cache over a single [`PageManager`] file.
///
/// Pages are pinned by fetching a guard and unpinned when the guard drops;
/// a [`PageWriteGuard`] marks its frame dirty for write-back. Unpinned frames
/// are eviction candidates in the attached [`Replacer`].
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    page_table: DashMap<PageId, FrameId>,
    frames: RwLock<HashMap<FrameId, Frame>>,
    replacer: Mutex<Box<dyn Replacer>>,
    page_manager: Mutex<PageManager>,
    next_frame_id: AtomicU32,
    max_frames: usize,
}

impl BufferPoolManager {
    pub fn new(page_manager: PageManager, replacer: Box<dyn Replacer>, max_frames: usize) -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                page_table: DashMap::new(),
                frames: RwLock::new(HashMap::with_capacity(max_frames)),
                replacer: Mutex::new(replacer),
                page_manager: Mutex::new(page_manager),
                next_frame_id: AtomicU32::new(0),
                max_frames,
            }),
        }
    }

    /// Pins the page for reading.
    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<PageReadGuard> {
        let frame_id = self.pin_frame(page_id, false)?;

        let frames = self.inner.frames.read();
        let frame = frames.get(&frame_id).unwrap();
        let data = frame.data.as_ref() as *const [u8; PAGE_SIZE];

        Ok(PageReadGuard {
            inner: self.inner.clone(),
            frame_id,
            data,
        })
    }

    /// Pins the page for mutation. The frame is marked dirty up front; the
    /// guard's release is the unpin-dirty of the page.
    pub fn fetch_page_write(&self, page_id: PageId) -> StorageResult<PageWriteGuard> {
        let frame_id = self.pin_frame(page_id, true)?;

        let mut frames = self.inner.frames.write();
        let frame = frames.get_mut(&frame_id).unwrap();
        let data = frame.data.as_mut() as *mut [u8; PAGE_SIZE];

        Ok(PageWriteGuard {
            inner: self.inner.clone(),
            frame_id,
            data,
        })
    }

    /// Allocates a fresh page in the file and returns it pinned and dirty.
    /// The page content starts zeroed.
    pub fn new_page(&self) -> StorageResult<(PageId, PageWriteGuard)> {
        let frame_id = self.take_frame()?;

        let page_id = {
            let mut page_manager = self.inner.page_manager.lock();
            page_manager.allocate_page()?
        };

        let mut frames = self.inner.frames.write();
        let frame = frames.get_mut(&frame_id).unwrap();
        frame.reset();
        frame.page_id = Some(page_id);
        frame.pin_count.store(1, Ordering::SeqCst);
        frame.is_dirty.store(true, Ordering::SeqCst);

        self.inner.page_table.insert(page_id, frame_id);
        self.inner.replacer.lock().pin(frame_id);

        let data = frame.data.as_mut() as *mut [u8; PAGE_SIZE];
        drop(frames);

        Ok((
            page_id,
            PageWriteGuard {
                inner: self.inner.clone(),
                frame_id,
                data,
            },
        ))
    }

    /// Number of frames currently pinned by outstanding guards.
    pub fn pinned_pages(&self) -> usize {
        let frames = self.inner.frames.read();
        frames
            .values()
            .filter(|f| f.pin_count.load(Ordering::SeqCst) > 0)
            .count()
    }

    /// Writes every dirty frame back to the file and syncs it. Fails with
    /// `PagesPinned` if any page is still pinned.
    pub fn flush_file(&self) -> StorageResult<()> {
        let frames = self.inner.frames.read();

        let pinned = frames
            .values()
            .filter(|f| f.pin_count.load(Ordering::SeqCst) > 0)
            .count();
        if pinned > 0 {
            return Err(StorageError::PagesPinned { pinned });
        }

        let mut page_manager = self.inner.page_manager.lock();
        for frame in frames.values() {
            if let Some(page_id) = frame.page_id {
                if frame.is_dirty.load(Ordering::SeqCst) {
                    page_manager.write_page(page_id, frame.data.as_ref())?;
                    frame.is_dirty.store(false, Ordering::SeqCst);
                }
            }
        }
        page_manager.sync()?;

        Ok(())
    }

    /// Pins the frame holding `page_id`, loading it from disk on a miss.
    fn pin_frame(&self, page_id: PageId, dirty: bool) -> StorageResult<FrameId> {
        // Hit: the page is already resident.
        if let Some(frame_id) = self.inner.page_table.get(&page_id).map(|e| *e.value()) {
            let frames = self.inner.frames.read();
            if let Some(frame) = frames.get(&frame_id) {
                frame.pin_count.fetch_add(1, Ordering::SeqCst);
                if dirty {
                    frame.is_dirty.store(true, Ordering::SeqCst);
                }
                self.inner.replacer.lock().pin(frame_id);
                return Ok(frame_id);
            }
        }

        // Miss: claim a frame and load the page from disk.
        let frame_id = self.take_frame()?;

        {
            let mut page_manager = self.inner.page_manager.lock();
            let mut frames = self.inner.frames.write();
            let frame = frames.get_mut(&frame_id).unwrap();

            if let Err(e) = page_manager.read_page(page_id, frame.data.as_mut()) {
                // The claimed frame stays empty and evictable.
                self.inner.replacer.lock().unpin(frame_id);
                return Err(e);
            }
            frame.page_id = Some(page_id);
            frame.pin_count.store(1, Ordering::SeqCst);
            frame.is_dirty.store(dirty, Ordering::SeqCst);
        }

        self.inner.page_table.insert(page_id, frame_id);
        self.inner.replacer.lock().pin(frame_id);

        Ok(frame_id)
    }

    /// Returns an empty frame: a brand-new one while under the frame limit,
    /// otherwise an evicted one (writing it back first if dirty).
    fn take_frame(&self) -> StorageResult<FrameId> {
        {
            let mut frames = self.inner.frames.write();
            if frames.len() < self.inner.max_frames {
                let frame_id = self.inner.next_frame_id.fetch_add(1, Ordering::SeqCst);
                frames.insert(frame_id, Frame::new());
                return Ok(frame_id);
            }
        }

        let victim = {
            let mut replacer = self.inner.replacer.lock();
            replacer.evict().ok_or(StorageError::BufferPoolFull)?
        };

        let (old_page_id, dirty_data) = {
            let frames = self.inner.frames.read();
            match frames.get(&victim) {
                Some(frame) => {
                    let dirty = frame.is_dirty.load(Ordering::SeqCst);
                    (frame.page_id, dirty.then(|| frame.data.clone()))
                }
                None => return Ok(victim),
            }
        };

        if let Some(page_id) = old_page_id {
            if let Some(data) = dirty_data {
                let mut page_manager = self.inner.page_manager.lock();
                page_manager.write_page(page_id, data.as_ref())?;
            }
            self.inner.page_table.remove(&page_id);
        }

        let mut frames = self.inner.frames.write();
        if let Some(frame) = frames.get_mut(&victim) {
            frame.reset();
        }

        Ok(victim)
    }
}

impl BufferPoolInner {
    fn release_pin(&self, frame_id: FrameId) {
        let should_unpin = {
            let frames = self.frames.read();
            match frames.get(&frame_id) {
                Some(frame) => frame.pin_count.fetch_sub(1, Ordering::SeqCst) == 1,
                None => false,
            }
        };

        if should_unpin {
            self.replacer.lock().unpin(frame_id);
        }
    }
}

/// Shared pin on a resident page. Dropping the guard unpins it clean.
pub struct PageReadGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    data: *const [u8; PAGE_SIZE],
}

impl Deref for PageReadGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.data }
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        self.inner.release_pin(self.frame_id);
    }
}

/// Exclusive pin on a resident page. The frame is dirty for as long as the
/// guard lives; dropping the guard unpins it with the dirty bit in place.
pub struct PageWriteGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    data: *mut [u8; PAGE_SIZE],
}

impl Deref for PageWriteGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.data }
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.data }
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        self.inner.release_pin(self.frame_id);
    }
}

// The raw data pointers stay valid while the frame is pinned.
unsafe impl Send for PageReadGuard {}
unsafe impl Sync for PageReadGuard {}
unsafe impl Send for PageWriteGuard {}
unsafe impl Sync for PageWriteGuard {}
