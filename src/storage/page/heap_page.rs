//! Slotted page for heap-file records.
//!
//! Layout: an 8-byte header (next-page link, lower and upper pointers),
//! a slot array growing down from the header, and record bytes growing up
//! from the page end.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use crate::storage::PAGE_SIZE;

const NEXT_PAGE_OFFSET: usize = 0;
const LOWER_OFFSET: usize = 4;
const UPPER_OFFSET: usize = 6;
const HEADER_SIZE: usize = 8;

// Slot entry: 2 bytes record offset, 2 bytes record length.
const SLOT_SIZE: usize = 4;

fn read_u16(data: &[u8; PAGE_SIZE], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn record_count(data: &[u8; PAGE_SIZE]) -> u16 {
    let lower = read_u16(data, LOWER_OFFSET);
    if lower < HEADER_SIZE as u16 {
        return 0;
    }
    (lower - HEADER_SIZE as u16) / SLOT_SIZE as u16
}

fn record(data: &[u8; PAGE_SIZE], slot_id: u16) -> StorageResult<&[u8]> {
    let count = record_count(data);
    if slot_id >= count {
        return Err(StorageError::InvalidSlot {
            slot_id,
            slot_count: count,
        });
    }

    let slot_off = HEADER_SIZE + slot_id as usize * SLOT_SIZE;
    let rec_off = read_u16(data, slot_off) as usize;
    let rec_len = read_u16(data, slot_off + 2) as usize;
    Ok(&data[rec_off..rec_off + rec_len])
}

fn next_page(data: &[u8; PAGE_SIZE]) -> Option<PageId> {
    let raw = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if raw == 0 {
        None
    } else {
        Some(PageId(raw))
    }
}

/// Read-only view of a heap page.
pub struct HeapPage<'a> {
    data: &'a [u8; PAGE_SIZE],
}

impl<'a> HeapPage<'a> {
    pub fn from_data(data: &'a [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    pub fn record_count(&self) -> u16 {
        record_count(self.data)
    }

    pub fn record(&self, slot_id: u16) -> StorageResult<&[u8]> {
        record(self.data, slot_id)
    }

    pub fn next_page(&self) -> Option<PageId> {
        next_page(self.data)
    }

    pub fn free_space(&self) -> usize {
        let lower = read_u16(self.data, LOWER_OFFSET);
        let upper = read_u16(self.data, UPPER_OFFSET);
        upper.saturating_sub(lower) as usize
    }
}

/// Mutable view of a heap page.
pub struct HeapPageMut<'a> {
    data: &'a mut [u8; PAGE_SIZE],
}

impl<'a> HeapPageMut<'a> {
    pub fn from_data(data: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    pub fn init(&mut self) {
        self.data[..HEADER_SIZE].fill(0);
        self.set_lower(HEADER_SIZE as u16);
        self.set_upper(PAGE_SIZE as u16);
    }

    pub fn record_count(&self) -> u16 {
        record_count(self.data)
    }

    pub fn record(&self, slot_id: u16) -> StorageResult<&[u8]> {
        record(self.data, slot_id)
    }

    pub fn next_page(&self) -> Option<PageId> {
        next_page(self.data)
    }

    pub fn set_next_page(&mut self, next: Option<PageId>) {
        let raw = next.map(|p| p.0).unwrap_or(0);
        self.data[NEXT_PAGE_OFFSET..NEXT_PAGE_OFFSET + 4].copy_from_slice(&raw.to_le_bytes());
    }

    pub fn free_space(&self) -> usize {
        let lower = read_u16(self.data, LOWER_OFFSET);
        let upper = read_u16(self.data, UPPER_OFFSET);
        upper.saturating_sub(lower) as usize
    }

    pub fn required_space_for(record_len: usize) -> usize {
        record_len + SLOT_SIZE
    }

    /// Appends a record, returning its slot id.
    pub fn insert_record(&mut self, record: &[u8]) -> StorageResult<u16> {
        let required = Self::required_space_for(record.len());
        let available = self.free_space();
        if available < required {
            return Err(StorageError::PageFull {
                required,
                available,
            });
        }

        let lower = read_u16(self.data, LOWER_OFFSET);
        let upper = read_u16(self.data, UPPER_OFFSET);
        let slot_id = self.record_count();

        // Record bytes grow up from the end of the page.
        let new_upper = upper - record.len() as u16;
        self.data[new_upper as usize..upper as usize].copy_from_slice(record);

        // Slot entry grows down from the header.
        let slot_off = lower as usize;
        self.data[slot_off..slot_off + 2].copy_from_slice(&new_upper.to_le_bytes());
        self.data[slot_off + 2..slot_off + 4]
            .copy_from_slice(&(record.len() as u16).to_le_bytes());

        self.set_lower(lower + SLOT_SIZE as u16);
        self.set_upper(new_upper);

        Ok(slot_id)
    }

    fn set_lower(&mut self, lower: u16) {
        self.data[LOWER_OFFSET..LOWER_OFFSET + 2].copy_from_slice(&lower.to_le_bytes());
    }

    fn set_upper(&mut self, upper: u16) {
        self.data[UPPER_OFFSET..UPPER_OFFSET + 2].copy_from_slice(&upper.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_fresh_page() {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = HeapPageMut::from_data(&mut data);
        page.init();

        assert_eq!(page.record_count(), 0);
        assert_eq!(page.next_page(), None);
        assert_eq!(page.free_space(), PAGE_SIZE - HEADER_SIZE);
    }

    #[test]
    fn test_insert_and_read_records() -> Result<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = HeapPageMut::from_data(&mut data);
        page.init();

        let slot0 = page.insert_record(b"first record")?;
        let slot1 = page.insert_record(b"second")?;
        assert_eq!(slot0, 0);
        assert_eq!(slot1, 1);

        let view = HeapPage::from_data(&data);
        assert_eq!(view.record_count(), 2);
        assert_eq!(view.record(0)?, b"first record");
        assert_eq!(view.record(1)?, b"second");

        Ok(())
    }

    #[test]
    fn test_invalid_slot() {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        HeapPageMut::from_data(&mut data).init();

        let view = HeapPage::from_data(&data);
        assert!(matches!(
            view.record(0),
            Err(StorageError::InvalidSlot { slot_id: 0, .. })
        ));
    }

    #[test]
    fn test_page_full() -> Result<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = HeapPageMut::from_data(&mut data);
        page.init();

        let record = vec![0xAB; 1000];
        let mut inserted = 0;
        loop {
            match page.insert_record(&record) {
                Ok(_) => inserted += 1,
                Err(StorageError::PageFull { .. }) => break,
                Err(e) => return Err(e.into()),
            }
        }

        // 1004 bytes per record and slot: eight fit in an 8 KiB page.
        assert_eq!(inserted, 8);
        assert_eq!(page.record_count(), 8);

        Ok(())
    }

    #[test]
    fn test_next_page_link() {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = HeapPageMut::from_data(&mut data);
        page.init();

        assert_eq!(page.next_page(), None);
        page.set_next_page(Some(PageId(5)));
        assert_eq!(page.next_page(), Some(PageId(5)));
        page.set_next_page(None);
        assert_eq!(page.next_page(), None);
    }

    #[test]
    fn test_empty_record() -> Result<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = HeapPageMut::from_data(&mut data);
        page.init();

        let slot = page.insert_record(b"")?;
        assert_eq!(page.record(slot)?, b"");

        Ok(())
    }
}
