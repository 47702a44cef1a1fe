//! Disk-resident B+ tree index over a single integer attribute.
//!
//! The index lives in its own paged file: page 0 is the meta page, page 1
//! the initial root (a leaf). Leaves hold sorted `(key, rid)` pairs and are
//! threaded left-to-right through right-sibling pointers; branches hold
//! separator keys and child pointers. Inserts descend recursively and
//! propagate an owned [`Promotion`] back up when a node splits; when a
//! promotion survives to the top the tree grows a new root and the meta
//! page is rewritten. Scans are bounded range scans driven by a small state
//! machine that keeps exactly one leaf pinned while active.

pub mod error;
pub mod scan;

pub use crate::storage::page::index_meta_page::Datatype;
pub use error::IndexError;
pub use scan::ScanOp;

use crate::access::heap::RecordFile;
use crate::access::record::RecordId;
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::buffer::PageWriteGuard;
use crate::storage::error::StorageError;
use crate::storage::page::btree_branch_page::{
    BTreeBranchPage, BTreeBranchPageMut, BRANCH_OCCUPANCY,
};
use crate::storage::page::btree_leaf_page::{BTreeLeafPage, BTreeLeafPageMut, LEAF_OCCUPANCY};
use crate::storage::page::index_meta_page::{
    truncated_relation_name, IndexMetaPage, IndexMetaPageMut,
};
use crate::storage::{BufferPoolManager, PageId, PageManager};
use log::{debug, info, warn};
use scan::{ActiveScan, LeafCursor, ScanRange, ScanState};
use std::cmp::Ordering;
use std::path::Path;

const INDEX_POOL_FRAMES: usize = 128;

/// The meta page is the first page of the index file.
const META_PAGE_ID: PageId = PageId(0);

/// The initial root leaf is allocated right after the meta page, on both
/// the create and the reopen path.
const FIRST_ROOT_PAGE_ID: PageId = PageId(1);

/// Name of the index file for a relation and attribute offset.
pub fn index_file_name(relation_name: &str, attr_byte_offset: i32) -> String {
    format!("{relation_name}.{attr_byte_offset}")
}

/// A `(key, rid)` pair bound for a leaf. Ordered by key, ties broken by the
/// rid's page number and slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: i32,
    pub rid: RecordId,
}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Equal => self.rid.cmp(&other.rid),
            other => other,
        }
    }
}

/// Separator key and new right sibling handed up one level after a split.
struct Promotion {
    key: i32,
    right_page_id: PageId,
}

pub struct BTreeIndex {
    buffer_pool: BufferPoolManager,
    index_name: String,
    root_page_id: PageId,
    first_root_page_id: PageId,
    attr_byte_offset: i32,
    attr_type: Datatype,
    scan: ScanState,
}

impl BTreeIndex {
    /// Opens the index for `relation_name` and `attr_byte_offset` inside
    /// `dir`, creating and bulk-loading it from `relation` if the index
    /// file does not exist yet.
    ///
    /// An existing file whose meta page names a different relation, offset,
    /// or key type fails with [`IndexError::BadIndexInfo`].
    pub fn open(
        dir: &Path,
        relation: &RecordFile,
        relation_name: &str,
        attr_byte_offset: i32,
        attr_type: Datatype,
    ) -> Result<Self, IndexError> {
        let index_name = index_file_name(relation_name, attr_byte_offset);
        let path = dir.join(&index_name);

        match PageManager::open(&path) {
            Ok(page_manager) => Self::open_existing(
                page_manager,
                index_name,
                relation_name,
                attr_byte_offset,
                attr_type,
            ),
            Err(StorageError::FileNotFound(_)) => Self::create(
                &path,
                index_name,
                relation,
                relation_name,
                attr_byte_offset,
                attr_type,
            ),
            Err(e) => Err(e.into()),
        }
    }

    fn open_existing(
        page_manager: PageManager,
        index_name: String,
        relation_name: &str,
        attr_byte_offset: i32,
        attr_type: Datatype,
    ) -> Result<Self, IndexError> {
        let buffer_pool = BufferPoolManager::new(
            page_manager,
            Box::new(LruReplacer::new()),
            INDEX_POOL_FRAMES,
        );

        let root_page_id = {
            let guard = buffer_pool.fetch_page(META_PAGE_ID)?;
            let meta = IndexMetaPage::from_data(&guard);
            if meta.relation_name() != truncated_relation_name(relation_name)
                || meta.attr_byte_offset() != attr_byte_offset
                || meta.attr_type() != Some(attr_type)
            {
                return Err(IndexError::BadIndexInfo);
            }
            meta.root_page_no()
        };

        info!("opened index {index_name}, root at {root_page_id}");

        Ok(Self {
            buffer_pool,
            index_name,
            root_page_id,
            first_root_page_id: FIRST_ROOT_PAGE_ID,
            attr_byte_offset,
            attr_type,
            scan: ScanState::Idle,
        })
    }

    fn create(
        path: &Path,
        index_name: String,
        relation: &RecordFile,
        relation_name: &str,
        attr_byte_offset: i32,
        attr_type: Datatype,
    ) -> Result<Self, IndexError> {
        let page_manager = PageManager::create(path)?;
        let buffer_pool = BufferPoolManager::new(
            page_manager,
            Box::new(LruReplacer::new()),
            INDEX_POOL_FRAMES,
        );

        let (meta_page_id, mut meta_guard) = buffer_pool.new_page()?;
        debug_assert_eq!(meta_page_id, META_PAGE_ID);
        let (root_page_id, mut root_guard) = buffer_pool.new_page()?;
        debug_assert_eq!(root_page_id, FIRST_ROOT_PAGE_ID);

        BTreeLeafPageMut::from_data(&mut root_guard).init();
        IndexMetaPageMut::from_data(&mut meta_guard).init(
            relation_name,
            attr_byte_offset,
            attr_type,
            root_page_id,
        );
        drop(root_guard);
        drop(meta_guard);

        let mut index = Self {
            buffer_pool,
            index_name,
            root_page_id,
            first_root_page_id: root_page_id,
            attr_byte_offset,
            attr_type,
            scan: ScanState::Idle,
        };

        info!(
            "created index {}, bulk-loading from relation {relation_name}",
            index.index_name
        );

        let mut entries = 0usize;
        for item in relation.scan() {
            let (rid, record) = item?;
            let key = key_at(&record, attr_byte_offset)?;
            index.insert_entry(key, rid)?;
            entries += 1;
        }
        index.flush()?;

        info!("bulk-loaded {entries} entries into {}", index.index_name);

        Ok(index)
    }

    /// Derived name of the index file.
    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn attr_byte_offset(&self) -> i32 {
        self.attr_byte_offset
    }

    pub fn attr_type(&self) -> Datatype {
        self.attr_type
    }

    /// Number of index pages currently pinned in the buffer pool. Zero
    /// between operations; one while a scan is positioned on a leaf.
    pub fn pinned_pages(&self) -> usize {
        self.buffer_pool.pinned_pages()
    }

    /// Writes all dirty index pages to disk. Fails while a scan holds its
    /// leaf pinned.
    pub fn flush(&mut self) -> Result<(), IndexError> {
        self.buffer_pool.flush_file()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Inserts a `(key, rid)` pair, preserving leaf order and growing the
    /// tree height by one when a split reaches the root. Duplicate keys are
    /// permitted.
    pub fn insert_entry(&mut self, key: i32, rid: RecordId) -> Result<(), IndexError> {
        let entry = IndexEntry { key, rid };

        let root = self.root_page_id;
        let promotion = if root == self.first_root_page_id {
            // The original leaf root has never split: the root IS a leaf.
            self.insert_into_leaf(root, entry)?
        } else {
            self.insert_into_branch(root, entry)?
        };

        if let Some(promotion) = promotion {
            self.grow_new_root(promotion)?;
        }

        Ok(())
    }

    fn insert_into_branch(
        &mut self,
        page_id: PageId,
        entry: IndexEntry,
    ) -> Result<Option<Promotion>, IndexError> {
        let (child_id, child_is_leaf) = {
            let guard = self.buffer_pool.fetch_page(page_id)?;
            let branch = BTreeBranchPage::from_data(&guard);
            let slot = branch.descend_slot(entry.key);
            let child = branch.child(slot).ok_or_else(|| {
                IndexError::Corrupted(format!("branch {page_id} has no child at slot {slot}"))
            })?;
            (child, branch.level() == 1)
        };

        let promotion = if child_is_leaf {
            self.insert_into_leaf(child_id, entry)?
        } else {
            self.insert_into_branch(child_id, entry)?
        };

        let Some(promotion) = promotion else {
            return Ok(None);
        };

        // The child split: absorb its separator here, or split in turn.
        let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
        {
            let mut branch = BTreeBranchPageMut::from_data(&mut guard);
            if !branch.is_full() {
                branch.insert(promotion.key, promotion.right_page_id);
                return Ok(None);
            }
        }
        let promotion = self.split_branch(page_id, &mut guard, promotion)?;
        Ok(Some(promotion))
    }

    fn insert_into_leaf(
        &mut self,
        page_id: PageId,
        entry: IndexEntry,
    ) -> Result<Option<Promotion>, IndexError> {
        let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
        {
            let mut leaf = BTreeLeafPageMut::from_data(&mut guard);
            if !leaf.is_full() {
                leaf.insert(entry.key, entry.rid);
                return Ok(None);
            }
        }
        let promotion = self.split_leaf(page_id, &mut guard, entry)?;
        Ok(Some(promotion))
    }

    /// Splits a full leaf, moving its upper half into a freshly allocated
    /// right sibling, linking the sibling chain, and placing the incoming
    /// entry on whichever side covers it. Promotes the new leaf's first key.
    fn split_leaf(
        &mut self,
        old_page_id: PageId,
        old_guard: &mut PageWriteGuard,
        entry: IndexEntry,
    ) -> Result<Promotion, IndexError> {
        let (new_page_id, mut new_guard) = self.buffer_pool.new_page()?;
        let mut old = BTreeLeafPageMut::from_data(old_guard);
        let mut new = BTreeLeafPageMut::from_data(&mut new_guard);

        let mut split = LEAF_OCCUPANCY / 2;
        if LEAF_OCCUPANCY % 2 == 1 && entry.key > old.key(split) {
            split += 1;
        }

        for slot in split..LEAF_OCCUPANCY {
            let rid = old.rid(slot).ok_or_else(|| {
                IndexError::Corrupted(format!("full leaf {old_page_id} has an empty slot {slot}"))
            })?;
            new.set_slot(slot - split, old.key(slot), rid);
            old.clear_slot(slot);
        }

        new.set_right_sibling(old.right_sibling());
        old.set_right_sibling(Some(new_page_id));

        if entry.key < old.key(split - 1) {
            old.insert(entry.key, entry.rid);
        } else {
            new.insert(entry.key, entry.rid);
        }

        let separator = new.key(0);
        debug!("split leaf {old_page_id}, new sibling {new_page_id}, separator {separator}");

        Ok(Promotion {
            key: separator,
            right_page_id: new_page_id,
        })
    }

    /// Splits a full branch around a separator near the midpoint. The
    /// separator itself moves up; its left child stays behind as the old
    /// node's last child pointer, and everything above it moves to the new
    /// right sibling. The incoming promotion lands on whichever side the
    /// promoted separator assigns it.
    fn split_branch(
        &mut self,
        old_page_id: PageId,
        old_guard: &mut PageWriteGuard,
        incoming: Promotion,
    ) -> Result<Promotion, IndexError> {
        let (new_page_id, mut new_guard) = self.buffer_pool.new_page()?;
        let mut old = BTreeBranchPageMut::from_data(old_guard);
        let mut new = BTreeBranchPageMut::from_data(&mut new_guard);

        let mid = BRANCH_OCCUPANCY / 2;
        let index = if BRANCH_OCCUPANCY % 2 == 0 && incoming.key < old.key(mid) {
            mid - 1
        } else {
            mid
        };
        let separator = old.key(index);

        new.set_level(old.level());
        for slot in (index + 1)..BRANCH_OCCUPANCY {
            new.set_key(slot - index - 1, old.key(slot));
            old.clear_key(slot);
        }
        for slot in (index + 1)..=BRANCH_OCCUPANCY {
            new.set_child_no(slot - index - 1, old.child_no(slot));
            old.clear_child(slot);
        }
        old.clear_key(index);

        if incoming.key < separator {
            old.insert(incoming.key, incoming.right_page_id);
        } else {
            new.insert(incoming.key, incoming.right_page_id);
        }

        debug!("split branch {old_page_id}, new sibling {new_page_id}, separator {separator}");

        Ok(Promotion {
            key: separator,
            right_page_id: new_page_id,
        })
    }

    /// Replaces the root after it split: a new branch page adopts the old
    /// root and the promoted sibling, and the meta page is rewritten to
    /// point at it.
    fn grow_new_root(&mut self, promotion: Promotion) -> Result<(), IndexError> {
        let old_root_id = self.root_page_id;
        let level = if old_root_id == self.first_root_page_id {
            1
        } else {
            0
        };

        let (new_root_id, mut guard) = self.buffer_pool.new_page()?;
        {
            let mut root = BTreeBranchPageMut::from_data(&mut guard);
            root.set_level(level);
            root.set_key(0, promotion.key);
            root.set_child(0, old_root_id);
            root.set_child(1, promotion.right_page_id);
        }
        drop(guard);

        let mut meta_guard = self.buffer_pool.fetch_page_write(META_PAGE_ID)?;
        IndexMetaPageMut::from_data(&mut meta_guard).set_root_page_no(new_root_id);
        drop(meta_guard);

        self.root_page_id = new_root_id;
        debug!("new root {new_root_id} at level {level}, old root {old_root_id}");

        Ok(())
    }

    // ------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------

    /// Positions a scan at the first entry satisfying
    /// `low (low_op) key (high_op) high`. Any scan already in progress is
    /// ended first. Fails with [`IndexError::NoSuchKeyFound`] when nothing
    /// in the tree qualifies.
    pub fn start_scan(
        &mut self,
        low: i32,
        low_op: ScanOp,
        high: i32,
        high_op: ScanOp,
    ) -> Result<(), IndexError> {
        if matches!(self.scan, ScanState::Active(_)) {
            self.scan = ScanState::Idle;
        }

        let range = ScanRange::new(low, low_op, high, high_op)?;

        // Descend to the leftmost leaf whose subtree can hold the low bound.
        let mut page_id = self.root_page_id;
        if page_id != self.first_root_page_id {
            loop {
                let guard = self.buffer_pool.fetch_page(page_id)?;
                let branch = BTreeBranchPage::from_data(&guard);
                let above_leaves = branch.level() == 1;
                let slot = branch.scan_slot(range.low);
                let child = branch.child(slot).ok_or_else(|| {
                    IndexError::Corrupted(format!("branch {page_id} has no child at slot {slot}"))
                })?;
                drop(guard);
                page_id = child;
                if above_leaves {
                    break;
                }
            }
        }

        // Walk forward through the sibling chain to the first qualifying
        // entry. Keys are sorted, so one past the high bound means no entry
        // anywhere qualifies.
        loop {
            let guard = self.buffer_pool.fetch_page(page_id)?;
            let mut found = None;
            let mut sibling = None;
            {
                let leaf = BTreeLeafPage::from_data(&guard);
                for slot in 0..LEAF_OCCUPANCY {
                    if leaf.rid(slot).is_none() {
                        break;
                    }
                    let key = leaf.key(slot);
                    if range.matches(key) {
                        found = Some(slot);
                        break;
                    }
                    if !range.within_high(key) {
                        return Err(IndexError::NoSuchKeyFound);
                    }
                }
                if found.is_none() {
                    sibling = leaf.right_sibling();
                }
            }

            if let Some(slot) = found {
                self.scan = ScanState::Active(ActiveScan {
                    range,
                    cursor: Some(LeafCursor {
                        guard,
                        next_entry: slot,
                    }),
                });
                return Ok(());
            }

            drop(guard);
            match sibling {
                Some(next) => page_id = next,
                None => return Err(IndexError::NoSuchKeyFound),
            }
        }
    }

    /// Returns the rid of the next entry satisfying the scan predicate.
    /// Keys are sorted, so the first non-qualifying entry completes the
    /// scan; so does running off the end of the sibling chain. A completed
    /// scan keeps failing with [`IndexError::IndexScanCompleted`] until
    /// [`end_scan`](Self::end_scan).
    pub fn scan_next(&mut self) -> Result<RecordId, IndexError> {
        let active = match &mut self.scan {
            ScanState::Active(active) => active,
            ScanState::Idle => return Err(IndexError::ScanNotInitialized),
        };

        let Some(mut cursor) = active.cursor.take() else {
            return Err(IndexError::IndexScanCompleted);
        };

        // Leaf exhausted: unpin it and move to the right sibling.
        let exhausted = cursor.next_entry == LEAF_OCCUPANCY
            || BTreeLeafPage::from_data(&cursor.guard)
                .rid(cursor.next_entry)
                .is_none();
        if exhausted {
            let sibling = BTreeLeafPage::from_data(&cursor.guard).right_sibling();
            match sibling {
                Some(next) => {
                    let guard = self.buffer_pool.fetch_page(next)?;
                    cursor = LeafCursor {
                        guard,
                        next_entry: 0,
                    };
                }
                None => return Err(IndexError::IndexScanCompleted),
            }
        }

        let (key, rid) = {
            let leaf = BTreeLeafPage::from_data(&cursor.guard);
            (leaf.key(cursor.next_entry), leaf.rid(cursor.next_entry))
        };
        let Some(rid) = rid else {
            return Err(IndexError::Corrupted(
                "scan positioned on an empty leaf slot".into(),
            ));
        };

        if active.range.matches(key) {
            cursor.next_entry += 1;
            active.cursor = Some(cursor);
            Ok(rid)
        } else {
            Err(IndexError::IndexScanCompleted)
        }
    }

    /// Ends the scan in progress, releasing its leaf pin.
    pub fn end_scan(&mut self) -> Result<(), IndexError> {
        match std::mem::replace(&mut self.scan, ScanState::Idle) {
            ScanState::Idle => Err(IndexError::ScanNotInitialized),
            ScanState::Active(_) => Ok(()),
        }
    }
}

impl Drop for BTreeIndex {
    fn drop(&mut self) {
        // Release any scan pin so the flush below sees an unpinned pool.
        self.scan = ScanState::Idle;
        if let Err(e) = self.buffer_pool.flush_file() {
            warn!("failed to flush index {} on close: {e}", self.index_name);
        }
    }
}

/// Reads the indexed attribute out of a relation record.
fn key_at(record: &[u8], attr_byte_offset: i32) -> Result<i32, IndexError> {
    let short = || IndexError::ShortRecord {
        len: record.len(),
        offset: attr_byte_offset,
    };
    let offset = usize::try_from(attr_byte_offset).map_err(|_| short())?;
    let bytes = record.get(offset..offset + 4).ok_or_else(short)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
