//! Sequential scan over a heap file.

use crate::access::record::RecordId;
use crate::storage::error::StorageResult;
use crate::storage::page::heap_page::HeapPage;
use crate::storage::{BufferPoolManager, PageId};

/// Iterator over every record of a [`RecordFile`](crate::access::RecordFile),
/// in page-chain order. Exhaustion of the iterator is how the end of the
/// relation is signalled.
pub struct RecordScanner {
    buffer_pool: BufferPoolManager,
    current_page_id: Option<PageId>,
    current_slot: u16,
}

impl RecordScanner {
    pub fn new(buffer_pool: BufferPoolManager, first_page_id: Option<PageId>) -> Self {
        Self {
            buffer_pool,
            current_page_id: first_page_id,
            current_slot: 0,
        }
    }

    fn try_next(&mut self) -> StorageResult<Option<(RecordId, Vec<u8>)>> {
        loop {
            let page_id = match self.current_page_id {
                Some(id) => id,
                None => return Ok(None),
            };

            let guard = self.buffer_pool.fetch_page(page_id)?;
            let page = HeapPage::from_data(&guard);

            if self.current_slot < page.record_count() {
                let slot_id = self.current_slot;
                self.current_slot += 1;
                let record = page.record(slot_id)?.to_vec();
                return Ok(Some((RecordId::new(page_id, slot_id), record)));
            }

            // Page exhausted, move along the chain.
            self.current_page_id = page.next_page();
            self.current_slot = 0;
        }
    }
}

impl Iterator for RecordScanner {
    type Item = StorageResult<(RecordId, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.try_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
