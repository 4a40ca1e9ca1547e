//! Manages the buffer pool, a fixed array of in-memory frames caching disk
//! pages. Eviction is least-recently-used among unpinned frames; dirty
//! victims are written through before their frame is reused.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::caprock_debug_log;
use crate::errors::{Error, Result};
use crate::file_manager::FileManager;
use crate::page::Page;
use crate::PageId;

pub const DEFAULT_POOL_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
        }
    }
}

/// A single frame in the buffer pool.
#[derive(Debug)]
struct Frame {
    page: RwLock<Page>,
    pin_count: Mutex<u32>,
    is_dirty: Mutex<bool>,
}

/// Recency links for one frame, arena-style. The list threads through
/// every resident frame; head is most recently used.
#[derive(Debug, Clone, Copy, Default)]
struct LruLink {
    prev: Option<usize>,
    next: Option<usize>,
    in_list: bool,
}

#[derive(Debug)]
struct PoolState {
    page_table: HashMap<PageId, usize>,
    resident: Vec<Option<PageId>>,
    links: Vec<LruLink>,
    head: Option<usize>,
    tail: Option<usize>,
    free_frames: Vec<usize>,
}

impl PoolState {
    fn detach(&mut self, index: usize) {
        if !self.links[index].in_list {
            return;
        }
        let LruLink { prev, next, .. } = self.links[index];
        match prev {
            Some(p) => self.links[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.links[n].prev = prev,
            None => self.tail = prev,
        }
        self.links[index] = LruLink::default();
    }

    fn push_front(&mut self, index: usize) {
        self.links[index] = LruLink {
            prev: None,
            next: self.head,
            in_list: true,
        };
        if let Some(old_head) = self.head {
            self.links[old_head].prev = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn touch(&mut self, index: usize) {
        self.detach(index);
        self.push_front(index);
    }
}

/// The buffer pool manager.
pub struct BufferPool {
    file_manager: Mutex<FileManager>,
    frames: Vec<Arc<Frame>>,
    state: Mutex<PoolState>,
}

/// An RAII guard for a pinned page. Dropping the guard performs the one
/// and only unpin for the matching fetch, carrying the accumulated dirty
/// bit into the frame.
pub struct PageGuard<'a> {
    pool: &'a Arc<BufferPool>,
    page_id: PageId,
    frame: Arc<Frame>,
    dirty: Cell<bool>,
}

impl<'a> PageGuard<'a> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.page.read()
    }

    /// Grants write access and marks the guard dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.dirty.set(true);
        self.frame.page.write()
    }
}

impl<'a> Drop for PageGuard<'a> {
    fn drop(&mut self) {
        self.pool.unpin(&self.frame, self.dirty.get());
    }
}

impl BufferPool {
    pub fn new(file_manager: FileManager, config: BufferPoolConfig) -> Self {
        let mut frames = Vec::with_capacity(config.size);
        let mut free_frames = Vec::with_capacity(config.size);
        for i in 0..config.size {
            frames.push(Arc::new(Frame {
                page: RwLock::new(Page::new(0)),
                pin_count: Mutex::new(0),
                is_dirty: Mutex::new(false),
            }));
            free_frames.push(i);
        }
        // Pop order matches frame order.
        free_frames.reverse();
        Self {
            file_manager: Mutex::new(file_manager),
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                resident: vec![None; config.size],
                links: vec![LruLink::default(); config.size],
                head: None,
                tail: None,
                free_frames,
            }),
        }
    }

    /// Pins a page, loading it from disk if it is not resident.
    pub fn fetch(self: &Arc<Self>, page_id: PageId) -> Result<PageGuard<'_>> {
        let mut state = self.state.lock();

        if let Some(&index) = state.page_table.get(&page_id) {
            let frame = self.frames[index].clone();
            *frame.pin_count.lock() += 1;
            state.touch(index);
            return Ok(PageGuard {
                pool: self,
                page_id,
                frame,
                dirty: Cell::new(false),
            });
        }

        let index = self.take_victim_frame(&mut state)?;
        let page = match self.file_manager.lock().read_page(page_id) {
            Ok(page) => page,
            Err(e) => {
                state.free_frames.push(index);
                return Err(e);
            }
        };
        Ok(self.install(&mut state, index, page))
    }

    /// Allocates a fresh page on disk and pins it with a dirty frame.
    pub fn new_page(self: &Arc<Self>) -> Result<PageGuard<'_>> {
        let mut state = self.state.lock();
        let page_id = self.file_manager.lock().allocate()?;
        let index = match self.take_victim_frame(&mut state) {
            Ok(index) => index,
            Err(e) => {
                // Give the page id back rather than leak it.
                let _ = self.file_manager.lock().deallocate(page_id);
                return Err(e);
            }
        };
        let guard = self.install(&mut state, index, Page::new(page_id));
        *guard.frame.is_dirty.lock() = true;
        guard.dirty.set(true);
        Ok(guard)
    }

    fn install<'a>(
        self: &'a Arc<Self>,
        state: &mut PoolState,
        index: usize,
        page: Page,
    ) -> PageGuard<'a> {
        let page_id = page.page_id();
        let frame = self.frames[index].clone();
        *frame.page.write() = page;
        *frame.is_dirty.lock() = false;
        *frame.pin_count.lock() = 1;
        state.page_table.insert(page_id, index);
        state.resident[index] = Some(page_id);
        state.push_front(index);
        PageGuard {
            pool: self,
            page_id,
            frame,
            dirty: Cell::new(false),
        }
    }

    /// Returns a usable frame: a never-used one if available, otherwise the
    /// least recently used unpinned frame, written through first if dirty.
    fn take_victim_frame(&self, state: &mut PoolState) -> Result<usize> {
        if let Some(index) = state.free_frames.pop() {
            return Ok(index);
        }

        let mut candidate = state.tail;
        while let Some(index) = candidate {
            if *self.frames[index].pin_count.lock() == 0 {
                if let Some(old_page_id) = state.resident[index] {
                    caprock_debug_log!(
                        "[BufferPool::take_victim_frame] Evicting page {old_page_id} from frame {index}"
                    );
                    let frame = &self.frames[index];
                    let mut is_dirty = frame.is_dirty.lock();
                    if *is_dirty {
                        let page = frame.page.read();
                        self.file_manager.lock().write_page(&page)?;
                        *is_dirty = false;
                    }
                    state.page_table.remove(&old_page_id);
                    state.resident[index] = None;
                }
                state.detach(index);
                return Ok(index);
            }
            candidate = state.links[index].prev;
        }

        Err(Error::AllFramesPinned)
    }

    fn unpin(&self, frame: &Frame, dirty: bool) {
        if dirty {
            *frame.is_dirty.lock() = true;
        }
        let mut pin_count = frame.pin_count.lock();
        if *pin_count > 0 {
            *pin_count -= 1;
        }
    }

    /// Writes a resident dirty page through to disk.
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let state = self.state.lock();
        if let Some(&index) = state.page_table.get(&page_id) {
            let frame = &self.frames[index];
            let mut is_dirty = frame.is_dirty.lock();
            if *is_dirty {
                let page = frame.page.read();
                self.file_manager.lock().write_page(&page)?;
                *is_dirty = false;
            }
        }
        Ok(())
    }

    /// Writes every dirty frame through and syncs the file.
    pub fn flush_all(&self) -> Result<()> {
        let state = self.state.lock();
        for &index in state.page_table.values() {
            let frame = &self.frames[index];
            let mut is_dirty = frame.is_dirty.lock();
            if *is_dirty {
                let page = frame.page.read();
                self.file_manager.lock().write_page(&page)?;
                *is_dirty = false;
            }
        }
        self.file_manager.lock().flush()
    }

    /// Drops a page from the pool and returns it to the file manager's
    /// free list. The page must not be pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(&index) = state.page_table.get(&page_id) {
            let frame = &self.frames[index];
            if *frame.pin_count.lock() > 0 {
                return Err(Error::PagePinned(page_id));
            }
            *frame.is_dirty.lock() = false;
            state.page_table.remove(&page_id);
            state.resident[index] = None;
            state.detach(index);
            state.free_frames.push(index);
        }
        self.file_manager.lock().deallocate(page_id)
    }

    /// Drops a resident frame without writing it back, so an aborting
    /// transaction's dirty page never reaches disk. The page must not be
    /// pinned.
    pub fn discard_page(&self, page_id: PageId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(&index) = state.page_table.get(&page_id) {
            let frame = &self.frames[index];
            if *frame.pin_count.lock() > 0 {
                return Err(Error::PagePinned(page_id));
            }
            *frame.is_dirty.lock() = false;
            state.page_table.remove(&page_id);
            state.resident[index] = None;
            state.detach(index);
            state.free_frames.push(index);
        }
        Ok(())
    }
}
