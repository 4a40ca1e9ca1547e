//! The Write-Ahead Log manager.
//!
//! The log is a second file holding a sequence of records, each a fixed
//! 36-byte header followed by `data_length` payload bytes. All integers
//! are little-endian. Header layout:
//!
//! | offset | size | field                        |
//! |--------|------|------------------------------|
//! | 0      | 8    | lsn                          |
//! | 8      | 8    | prev_lsn                     |
//! | 16     | 8    | txn_id                       |
//! | 24     | 4    | record type (u8, 3 pad bytes)|
//! | 28     | 4    | data_length                  |
//! | 32     | 4    | payload checksum (CRC-32)    |
//!
//! Data record payloads: `page_id: u32, slot_id: u16, old_length: u16,
//! new_length: u16, pad: u16`, then the old bytes, then the new bytes.
//! INSERT carries no old bytes and DELETE no new bytes.
//!
//! Records are appended into a 64 KiB buffer, flushed when the buffer
//! fills and forced to stable storage on commit: once `commit` returns,
//! the COMMIT record has been fsynced.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crc32fast::Hasher;

use crate::caprock_debug_log;
use crate::errors::{Error, Result};
use crate::{PageId, SlotId};

/// A transaction identifier, assigned by the WAL at `begin`.
pub type TxnId = u64;

/// A Log Sequence Number: the ordinal of a record in the log, from 1.
pub type Lsn = u64;

pub const INVALID_TXN_ID: TxnId = 0;
pub const INVALID_LSN: Lsn = 0;

pub const RECORD_HEADER_SIZE: usize = 36;
const DATA_PREFIX_SIZE: usize = 12;
const LOG_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    Begin = 0,
    Commit = 1,
    Abort = 2,
    Insert = 3,
    Update = 4,
    Delete = 5,
    Checkpoint = 6,
}

impl WalRecordType {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Begin,
            1 => Self::Commit,
            2 => Self::Abort,
            3 => Self::Insert,
            4 => Self::Update,
            5 => Self::Delete,
            6 => Self::Checkpoint,
            _ => return None,
        })
    }
}

/// Header of every WAL record.
#[derive(Debug, Clone, Copy)]
pub struct WalRecordHeader {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub txn_id: TxnId,
    pub record_type: WalRecordType,
    pub data_length: u32,
    pub checksum: u32,
}

impl WalRecordHeader {
    fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.lsn.to_le_bytes());
        buf[8..16].copy_from_slice(&self.prev_lsn.to_le_bytes());
        buf[16..24].copy_from_slice(&self.txn_id.to_le_bytes());
        buf[24] = self.record_type as u8;
        buf[28..32].copy_from_slice(&self.data_length.to_le_bytes());
        buf[32..36].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < RECORD_HEADER_SIZE {
            return None;
        }
        Some(Self {
            lsn: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            prev_lsn: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            txn_id: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            record_type: WalRecordType::from_u8(buf[24])?,
            data_length: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            checksum: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
        })
    }
}

/// Per-transaction outcome of the recovery analysis pass.
#[derive(Debug, Default, Clone)]
pub struct RecoverySummary {
    pub committed: HashSet<TxnId>,
    pub aborted: HashSet<TxnId>,
    /// Transactions with a BEGIN but no COMMIT or ABORT in the log.
    pub in_flight: HashSet<TxnId>,
}

/// The WAL manager. Callers serialize access, typically behind one mutex.
pub struct WalManager {
    file: File,
    buffer: Vec<u8>,
    next_lsn: Lsn,
    next_txn_id: TxnId,
    /// Last LSN written by each active transaction, for `prev_lsn` chains.
    active_txns: HashMap<TxnId, Lsn>,
}

impl WalManager {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        caprock_debug_log!("[WalManager::open] Opening log file at: {path:?}");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            buffer: Vec::with_capacity(LOG_BUFFER_SIZE),
            next_lsn: 1,
            next_txn_id: 1,
            active_txns: HashMap::new(),
        })
    }

    /// One past the last assigned LSN.
    pub fn current_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// Starts a transaction: assigns the next id and logs BEGIN.
    pub fn begin(&mut self) -> Result<TxnId> {
        let txn_id = self.next_txn_id;
        self.next_txn_id += 1;
        let lsn = self.append(txn_id, INVALID_LSN, WalRecordType::Begin, &[])?;
        self.active_txns.insert(txn_id, lsn);
        Ok(txn_id)
    }

    pub fn log_insert(
        &mut self,
        txn_id: TxnId,
        page_id: PageId,
        slot_id: SlotId,
        new_bytes: &[u8],
    ) -> Result<Lsn> {
        let payload = data_payload(page_id, slot_id, &[], new_bytes);
        self.append_chained(txn_id, WalRecordType::Insert, &payload)
    }

    pub fn log_update(
        &mut self,
        txn_id: TxnId,
        page_id: PageId,
        slot_id: SlotId,
        old_bytes: &[u8],
        new_bytes: &[u8],
    ) -> Result<Lsn> {
        let payload = data_payload(page_id, slot_id, old_bytes, new_bytes);
        self.append_chained(txn_id, WalRecordType::Update, &payload)
    }

    pub fn log_delete(
        &mut self,
        txn_id: TxnId,
        page_id: PageId,
        slot_id: SlotId,
        old_bytes: &[u8],
    ) -> Result<Lsn> {
        let payload = data_payload(page_id, slot_id, old_bytes, &[]);
        self.append_chained(txn_id, WalRecordType::Delete, &payload)
    }

    /// Logs COMMIT and forces it to stable storage. When this returns the
    /// transaction is durably committed.
    pub fn commit(&mut self, txn_id: TxnId) -> Result<()> {
        let last_lsn = self
            .active_txns
            .get(&txn_id)
            .copied()
            .ok_or(Error::UnknownTransaction(txn_id))?;
        self.append(txn_id, last_lsn, WalRecordType::Commit, &[])?;
        self.active_txns.remove(&txn_id);
        self.flush_buffer()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Logs ABORT. Not forced; the record reaches disk with the next flush.
    pub fn abort(&mut self, txn_id: TxnId) -> Result<()> {
        let last_lsn = self
            .active_txns
            .get(&txn_id)
            .copied()
            .ok_or(Error::UnknownTransaction(txn_id))?;
        self.append(txn_id, last_lsn, WalRecordType::Abort, &[])?;
        self.active_txns.remove(&txn_id);
        Ok(())
    }

    pub fn checkpoint(&mut self) -> Result<()> {
        self.append(INVALID_TXN_ID, INVALID_LSN, WalRecordType::Checkpoint, &[])?;
        self.flush_buffer()
    }

    /// Drains the append buffer into the file.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_buffer()
    }

    /// Analysis pass over the whole log. Classifies every transaction seen,
    /// advances `current_lsn` past the last valid record and the transaction
    /// id counter past the highest id seen, then clears the active table.
    /// A malformed or truncated trailing record ends the scan cleanly.
    pub fn recover(&mut self) -> Result<RecoverySummary> {
        let mut summary = RecoverySummary::default();
        for (header, _payload) in self.scan()? {
            self.next_lsn = self.next_lsn.max(header.lsn + 1);
            self.next_txn_id = self.next_txn_id.max(header.txn_id + 1);
            match header.record_type {
                WalRecordType::Begin => {
                    summary.in_flight.insert(header.txn_id);
                }
                WalRecordType::Commit => {
                    summary.in_flight.remove(&header.txn_id);
                    summary.committed.insert(header.txn_id);
                }
                WalRecordType::Abort => {
                    summary.in_flight.remove(&header.txn_id);
                    summary.aborted.insert(header.txn_id);
                }
                WalRecordType::Insert
                | WalRecordType::Update
                | WalRecordType::Delete
                | WalRecordType::Checkpoint => {}
            }
        }
        self.active_txns.clear();
        caprock_debug_log!(
            "[WalManager::recover] committed: {}, aborted: {}, in flight: {}",
            summary.committed.len(),
            summary.aborted.len(),
            summary.in_flight.len()
        );
        Ok(summary)
    }

    /// Reads every well-formed record from the start of the file, stopping
    /// at the first truncated, unrecognized, or checksum-failing one.
    fn scan(&mut self) -> Result<Vec<(WalRecordHeader, Vec<u8>)>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut raw = Vec::new();
        self.file.read_to_end(&mut raw)?;

        let mut records = Vec::new();
        let mut pos = 0;
        while pos + RECORD_HEADER_SIZE <= raw.len() {
            let Some(header) = WalRecordHeader::decode(&raw[pos..pos + RECORD_HEADER_SIZE]) else {
                break;
            };
            let data_start = pos + RECORD_HEADER_SIZE;
            let data_end = data_start + header.data_length as usize;
            if data_end > raw.len() {
                break;
            }
            let payload = &raw[data_start..data_end];
            if payload_checksum(payload) != header.checksum {
                break;
            }
            records.push((header, payload.to_vec()));
            pos = data_end;
        }
        Ok(records)
    }

    fn append_chained(
        &mut self,
        txn_id: TxnId,
        record_type: WalRecordType,
        payload: &[u8],
    ) -> Result<Lsn> {
        let last_lsn = self
            .active_txns
            .get(&txn_id)
            .copied()
            .ok_or(Error::UnknownTransaction(txn_id))?;
        let lsn = self.append(txn_id, last_lsn, record_type, payload)?;
        self.active_txns.insert(txn_id, lsn);
        Ok(lsn)
    }

    fn append(
        &mut self,
        txn_id: TxnId,
        prev_lsn: Lsn,
        record_type: WalRecordType,
        payload: &[u8],
    ) -> Result<Lsn> {
        let header = WalRecordHeader {
            lsn: self.next_lsn,
            prev_lsn,
            txn_id,
            record_type,
            data_length: payload.len() as u32,
            checksum: payload_checksum(payload),
        };

        let record_size = RECORD_HEADER_SIZE + payload.len();
        if self.buffer.len() + record_size > LOG_BUFFER_SIZE {
            self.flush_buffer()?;
        }
        if record_size > LOG_BUFFER_SIZE {
            // Oversized records bypass the buffer entirely.
            self.file.seek(SeekFrom::End(0))?;
            self.file.write_all(&header.encode())?;
            self.file.write_all(payload)?;
        } else {
            self.buffer.extend_from_slice(&header.encode());
            self.buffer.extend_from_slice(payload);
        }

        let lsn = self.next_lsn;
        self.next_lsn += 1;
        Ok(lsn)
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&self.buffer)?;
        self.file.flush()?;
        self.buffer.clear();
        Ok(())
    }
}

impl Drop for WalManager {
    fn drop(&mut self) {
        if self.flush_buffer().is_ok() {
            let _ = self.file.sync_all();
        }
    }
}

fn data_payload(page_id: PageId, slot_id: SlotId, old_bytes: &[u8], new_bytes: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(DATA_PREFIX_SIZE + old_bytes.len() + new_bytes.len());
    payload.extend_from_slice(&page_id.to_le_bytes());
    payload.extend_from_slice(&slot_id.to_le_bytes());
    payload.extend_from_slice(&(old_bytes.len() as u16).to_le_bytes());
    payload.extend_from_slice(&(new_bytes.len() as u16).to_le_bytes());
    payload.extend_from_slice(&0u16.to_le_bytes());
    payload.extend_from_slice(old_bytes);
    payload.extend_from_slice(new_bytes);
    payload
}

fn payload_checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}
