//! Heap file for the source relation.
//!
//! Page 0 of the file is a header recording the first data page; records
//! live in slotted pages chained from there. Data pages always have page
//! numbers of 1 or more, so a record id never carries page number 0 — the
//! index leaf codec reserves that value for empty slots.

use crate::access::record::RecordId;
use crate::access::scan::RecordScanner;
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::error::StorageResult;
use crate::storage::page::heap_page::{HeapPage, HeapPageMut};
use crate::storage::{BufferPoolManager, PageId, PageManager};
use std::path::Path;

const HEAP_POOL_FRAMES: usize = 32;

const HEADER_PAGE_ID: PageId = PageId(0);

pub struct RecordFile {
    buffer_pool: BufferPoolManager,
    first_page_id: Option<PageId>,
}

impl RecordFile {
    /// Creates an empty heap file, with its header page in place.
    pub fn create(path: &Path) -> StorageResult<Self> {
        let page_manager = PageManager::create(path)?;
        let buffer_pool = BufferPoolManager::new(
            page_manager,
            Box::new(LruReplacer::new()),
            HEAP_POOL_FRAMES,
        );

        let (header_page_id, guard) = buffer_pool.new_page()?;
        debug_assert_eq!(header_page_id, HEADER_PAGE_ID);
        drop(guard);

        Ok(Self {
            buffer_pool,
            first_page_id: None,
        })
    }

    /// Opens an existing heap file and reads the first-data-page link from
    /// the header.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let page_manager = PageManager::open(path)?;
        let buffer_pool = BufferPoolManager::new(
            page_manager,
            Box::new(LruReplacer::new()),
            HEAP_POOL_FRAMES,
        );

        let first_page_id = {
            let guard = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
            let raw = u32::from_le_bytes([guard[0], guard[1], guard[2], guard[3]]);
            if raw == 0 {
                None
            } else {
                Some(PageId(raw))
            }
        };

        Ok(Self {
            buffer_pool,
            first_page_id,
        })
    }

    /// Appends a record, chaining a new page when the last one is full.
    pub fn insert(&mut self, record: &[u8]) -> StorageResult<RecordId> {
        let required = HeapPageMut::required_space_for(record.len());

        if let Some(first) = self.first_page_id {
            let mut current = first;
            loop {
                let (fits, next) = {
                    let guard = self.buffer_pool.fetch_page(current)?;
                    let page = HeapPage::from_data(&guard);
                    (page.free_space() >= required, page.next_page())
                };

                if fits {
                    let mut guard = self.buffer_pool.fetch_page_write(current)?;
                    let mut page = HeapPageMut::from_data(&mut guard);
                    let slot_id = page.insert_record(record)?;
                    return Ok(RecordId::new(current, slot_id));
                }

                match next {
                    Some(next_page_id) => current = next_page_id,
                    None => {
                        let (new_page_id, mut new_guard) = self.buffer_pool.new_page()?;
                        let mut new_page = HeapPageMut::from_data(&mut new_guard);
                        new_page.init();
                        let slot_id = new_page.insert_record(record)?;
                        drop(new_guard);

                        let mut prev_guard = self.buffer_pool.fetch_page_write(current)?;
                        let mut prev_page = HeapPageMut::from_data(&mut prev_guard);
                        prev_page.set_next_page(Some(new_page_id));

                        return Ok(RecordId::new(new_page_id, slot_id));
                    }
                }
            }
        }

        // First record ever: create the first data page and point the
        // header at it.
        let (new_page_id, mut guard) = self.buffer_pool.new_page()?;
        let mut page = HeapPageMut::from_data(&mut guard);
        page.init();
        let slot_id = page.insert_record(record)?;
        drop(guard);

        let mut header = self.buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
        header[0..4].copy_from_slice(&new_page_id.0.to_le_bytes());
        drop(header);

        self.first_page_id = Some(new_page_id);
        Ok(RecordId::new(new_page_id, slot_id))
    }

    /// Reads one record back.
    pub fn get(&self, rid: RecordId) -> StorageResult<Vec<u8>> {
        let guard = self.buffer_pool.fetch_page(rid.page_id)?;
        let page = HeapPage::from_data(&guard);
        Ok(page.record(rid.slot_id)?.to_vec())
    }

    /// Sequential scan over every record in the file.
    pub fn scan(&self) -> RecordScanner {
        RecordScanner::new(self.buffer_pool.clone(), self.first_page_id)
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.buffer_pool.flush_file()
    }
}
