//! Error types shared by every caprock subsystem.

use std::io;

use thiserror::Error;

use crate::wal::TxnId;
use crate::{PageId, SlotId};

/// The error type returned across the engine's public surface.
///
/// Corruption errors are fatal at open time; everything else is scoped to
/// the failing call and leaves the engine usable.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The file does not start with the database magic number.
    #[error("not a database file (magic 0x{found:08x})")]
    BadMagic { found: u32 },

    /// The file was written by an incompatible version of the engine.
    #[error("unsupported database version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// A page image failed checksum verification.
    #[error("checksum mismatch on page {page_id}: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    ChecksumMismatch {
        page_id: PageId,
        stored: u32,
        computed: u32,
    },

    /// The file header is structurally invalid.
    #[error("corrupt database file: {0}")]
    CorruptFile(String),

    /// A read ended before the requested number of bytes.
    #[error("short read at offset {offset}: wanted {wanted} bytes, got {got}")]
    ShortRead {
        offset: u64,
        wanted: usize,
        got: usize,
    },

    /// The page has no room for the record plus its slot entry.
    #[error("page {0} is full")]
    PageFull(PageId),

    /// The free-page list is at capacity; the page stays allocated.
    #[error("free list is full, page {0} cannot be recycled")]
    FreeListFull(PageId),

    /// The page id is past the end of the file.
    #[error("page {0} does not exist")]
    PageNotFound(PageId),

    /// The slot does not exist or has been deleted.
    #[error("slot {slot_id} on page {page_id} does not exist")]
    SlotNotFound { page_id: PageId, slot_id: SlotId },

    /// Every frame in the buffer pool is pinned.
    #[error("buffer pool is full and all pages are pinned")]
    AllFramesPinned,

    /// The operation requires the page to be unpinned.
    #[error("page {0} is pinned")]
    PagePinned(PageId),

    /// The transaction id is not active.
    #[error("transaction {0} is not active")]
    UnknownTransaction(TxnId),

    /// The lock was not granted before the deadline.
    #[error("transaction {txn_id} timed out waiting for a lock")]
    LockTimeout { txn_id: TxnId },

    /// The shared lock cannot be upgraded while other holders exist.
    #[error("transaction {txn_id} cannot upgrade its shared lock")]
    UpgradeConflict { txn_id: TxnId },
}

pub type Result<T> = std::result::Result<T, Error>;
