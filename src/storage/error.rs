//! Storage layer error types.

use crate::storage::page::PageId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("page {0} does not exist in the file")]
    PageNotFound(PageId),

    #[error("page is full: requires {required} bytes but only {available} available")]
    PageFull { required: usize, available: usize },

    #[error("invalid slot id: {slot_id} (page holds {slot_count} slots)")]
    InvalidSlot { slot_id: u16, slot_count: u16 },

    #[error("buffer pool is full: cannot allocate new frame")]
    BufferPoolFull,

    #[error("cannot flush file: {pinned} pages still pinned")]
    PagesPinned { pinned: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
