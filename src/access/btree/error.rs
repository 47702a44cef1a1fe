//! Index layer error types.

use crate::storage::error::StorageError;
use thiserror::Error;

/// Errors surfaced by [`BTreeIndex`](crate::access::BTreeIndex) operations.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index file metadata does not match the requested relation, offset, or key type")]
    BadIndexInfo,

    #[error("scan operators must be GT or GTE for the low bound and LT or LTE for the high bound")]
    BadOpcodes,

    #[error("bad scan range: low bound exceeds high bound")]
    BadScanrange,

    #[error("no key in the index satisfies the scan criteria")]
    NoSuchKeyFound,

    #[error("no scan is in progress")]
    ScanNotInitialized,

    #[error("index scan completed")]
    IndexScanCompleted,

    #[error("record of {len} bytes cannot hold a key at byte offset {offset}")]
    ShortRecord { len: usize, offset: i32 },

    #[error("index corrupted: {0}")]
    Corrupted(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
