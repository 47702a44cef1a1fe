//! Meta page codec: page 0 of an index file.
//!
//! Records which relation and attribute the index was built over, plus the
//! current root page number, which is rewritten in place whenever a root
//! split promotes a new root.

use crate::storage::page::PageId;
use crate::storage::PAGE_SIZE;

/// Type of the indexed attribute as recorded on disk. Only the integer
/// node layout is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Datatype {
    Integer = 0,
    Double = 1,
    String = 2,
}

impl Datatype {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Integer),
            1 => Some(Self::Double),
            2 => Some(Self::String),
            _ => None,
        }
    }
}

/// Capacity of the fixed relation-name field; longer names are truncated
/// on write.
pub const RELATION_NAME_LEN: usize = 20;

const ATTR_BYTE_OFFSET_OFFSET: usize = RELATION_NAME_LEN;
const ATTR_TYPE_OFFSET: usize = ATTR_BYTE_OFFSET_OFFSET + 4;
const ROOT_PAGE_NO_OFFSET: usize = ATTR_TYPE_OFFSET + 4;

/// Truncates a relation name to the fixed on-disk field width.
pub fn truncated_relation_name(name: &str) -> &[u8] {
    let bytes = name.as_bytes();
    &bytes[..bytes.len().min(RELATION_NAME_LEN)]
}

/// Read-only view of the meta page.
pub struct IndexMetaPage<'a> {
    data: &'a [u8; PAGE_SIZE],
}

impl<'a> IndexMetaPage<'a> {
    pub fn from_data(data: &'a [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    /// The stored relation name with its zero padding stripped.
    pub fn relation_name(&self) -> &[u8] {
        let field = &self.data[..RELATION_NAME_LEN];
        let len = field.iter().position(|&b| b == 0).unwrap_or(RELATION_NAME_LEN);
        &field[..len]
    }

    pub fn attr_byte_offset(&self) -> i32 {
        let off = ATTR_BYTE_OFFSET_OFFSET;
        i32::from_le_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ])
    }

    pub fn attr_type(&self) -> Option<Datatype> {
        let off = ATTR_TYPE_OFFSET;
        Datatype::from_u32(u32::from_le_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ]))
    }

    pub fn root_page_no(&self) -> PageId {
        let off = ROOT_PAGE_NO_OFFSET;
        PageId(u32::from_le_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ]))
    }
}

/// Mutable view of the meta page.
pub struct IndexMetaPageMut<'a> {
    data: &'a mut [u8; PAGE_SIZE],
}

impl<'a> IndexMetaPageMut<'a> {
    pub fn from_data(data: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    pub fn init(
        &mut self,
        relation_name: &str,
        attr_byte_offset: i32,
        attr_type: Datatype,
        root_page_no: PageId,
    ) {
        self.data[..RELATION_NAME_LEN].fill(0);
        let name = truncated_relation_name(relation_name);
        self.data[..name.len()].copy_from_slice(name);

        self.data[ATTR_BYTE_OFFSET_OFFSET..ATTR_BYTE_OFFSET_OFFSET + 4]
            .copy_from_slice(&attr_byte_offset.to_le_bytes());
        self.data[ATTR_TYPE_OFFSET..ATTR_TYPE_OFFSET + 4]
            .copy_from_slice(&(attr_type as u32).to_le_bytes());
        self.set_root_page_no(root_page_no);
    }

    pub fn set_root_page_no(&mut self, root_page_no: PageId) {
        self.data[ROOT_PAGE_NO_OFFSET..ROOT_PAGE_NO_OFFSET + 4]
            .copy_from_slice(&root_page_no.0.to_le_bytes());
    }
}
