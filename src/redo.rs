//! Write-ahead redo log. Unlike a page-image WAL that logs raw post-image
//! pages and replays by copying them back over the data file, this logs
//! logical operations instead (store/delete/txn boundaries) so recovery can
//! replay committed work through the B-tree layer even across a checkpoint
//! that already flushed some of a transaction's dirty pages. Each record
//! still carries its own running crc, synced before the next record is
//! written, generalized to an opcode per logical operation.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32c::crc32c;

use crate::config::{DurabilityMode, IndexId, Key, TxnId, Value};
use crate::error::{Error, Result};

const OP_TIMESTAMP: u8 = 1;
const OP_RESET: u8 = 2;
const OP_SHUTDOWN: u8 = 3;
const OP_CLOSE: u8 = 4;
const OP_END_FILE: u8 = 5;
const OP_STORE: u8 = 6;
const OP_STORE_NO_LOCK: u8 = 7;
const OP_RENAME_INDEX: u8 = 8;
const OP_DELETE_INDEX: u8 = 9;
const OP_TXN_ENTER: u8 = 10;
const OP_TXN_ROLLBACK: u8 = 11;
const OP_TXN_ROLLBACK_FINAL: u8 = 12;
const OP_TXN_COMMIT: u8 = 13;
const OP_TXN_COMMIT_FINAL: u8 = 14;
const OP_TXN_STORE: u8 = 15;
const OP_TXN_STORE_COMMIT_FINAL: u8 = 16;
const OP_TXN_CUSTOM: u8 = 17;
const OP_TXN_CUSTOM_LOCK: u8 = 18;

/// One logical redo record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoOp {
    Timestamp(u64),
    Reset,
    Shutdown,
    Close,
    EndFile,
    Store { index_id: IndexId, key: Key, value: Option<Value> },
    StoreNoLock { index_id: IndexId, key: Key, value: Option<Value> },
    RenameIndex { index_id: IndexId, name: Option<String> },
    DeleteIndex { index_id: IndexId },
    TxnEnter { txn_id: TxnId },
    TxnRollback { txn_id: TxnId },
    TxnRollbackFinal { txn_id: TxnId },
    TxnCommit { txn_id: TxnId },
    TxnCommitFinal { txn_id: TxnId },
    TxnStore { txn_id: TxnId, index_id: IndexId, key: Key, value: Option<Value> },
    TxnStoreCommitFinal { txn_id: TxnId, index_id: IndexId, key: Key, value: Option<Value> },
    TxnCustom { txn_id: TxnId, message: Vec<u8> },
    TxnCustomLock { txn_id: TxnId, index_id: IndexId, key: Key, message: Vec<u8> },
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, v: &[u8]) {
    put_u64(buf, v.len() as u64);
    buf.extend_from_slice(v);
}

fn put_opt_bytes(buf: &mut Vec<u8>, v: Option<&[u8]>) {
    match v {
        Some(b) => {
            buf.push(1);
            put_bytes(buf, b);
        }
        None => buf.push(0),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u64(&mut self) -> Result<u64> {
        let end = self.pos + 8;
        let b = self.buf.get(self.pos..end).ok_or_else(|| Error::Corrupt("redo record truncated".into()))?;
        self.pos = end;
        Ok(u64::from_be_bytes(b.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u64()? as usize;
        let end = self.pos + len;
        let b = self.buf.get(self.pos..end).ok_or_else(|| Error::Corrupt("redo record truncated".into()))?;
        self.pos = end;
        Ok(b.to_vec())
    }

    fn opt_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        let tag = *self.buf.get(self.pos).ok_or_else(|| Error::Corrupt("redo record truncated".into()))?;
        self.pos += 1;
        if tag == 0 {
            Ok(None)
        } else {
            Ok(Some(self.bytes()?))
        }
    }

    fn opt_string(&mut self) -> Result<Option<String>> {
        match self.opt_bytes()? {
            None => Ok(None),
            Some(b) => String::from_utf8(b).map(Some).map_err(|_| Error::Corrupt("redo name is not utf8".into())),
        }
    }
}

impl RedoOp {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            RedoOp::Timestamp(t) => {
                buf.push(OP_TIMESTAMP);
                put_u64(&mut buf, *t);
            }
            RedoOp::Reset => buf.push(OP_RESET),
            RedoOp::Shutdown => buf.push(OP_SHUTDOWN),
            RedoOp::Close => buf.push(OP_CLOSE),
            RedoOp::EndFile => buf.push(OP_END_FILE),
            RedoOp::Store { index_id, key, value } => {
                buf.push(OP_STORE);
                put_u64(&mut buf, *index_id);
                put_bytes(&mut buf, key);
                put_opt_bytes(&mut buf, value.as_deref());
            }
            RedoOp::StoreNoLock { index_id, key, value } => {
                buf.push(OP_STORE_NO_LOCK);
                put_u64(&mut buf, *index_id);
                put_bytes(&mut buf, key);
                put_opt_bytes(&mut buf, value.as_deref());
            }
            RedoOp::RenameIndex { index_id, name } => {
                buf.push(OP_RENAME_INDEX);
                put_u64(&mut buf, *index_id);
                put_opt_bytes(&mut buf, name.as_deref().map(str::as_bytes));
            }
            RedoOp::DeleteIndex { index_id } => {
                buf.push(OP_DELETE_INDEX);
                put_u64(&mut buf, *index_id);
            }
            RedoOp::TxnEnter { txn_id } => {
                buf.push(OP_TXN_ENTER);
                put_u64(&mut buf, *txn_id);
            }
            RedoOp::TxnRollback { txn_id } => {
                buf.push(OP_TXN_ROLLBACK);
                put_u64(&mut buf, *txn_id);
            }
            RedoOp::TxnRollbackFinal { txn_id } => {
                buf.push(OP_TXN_ROLLBACK_FINAL);
                put_u64(&mut buf, *txn_id);
            }
            RedoOp::TxnCommit { txn_id } => {
                buf.push(OP_TXN_COMMIT);
                put_u64(&mut buf, *txn_id);
            }
            RedoOp::TxnCommitFinal { txn_id } => {
                buf.push(OP_TXN_COMMIT_FINAL);
                put_u64(&mut buf, *txn_id);
            }
            RedoOp::TxnStore { txn_id, index_id, key, value } => {
                buf.push(OP_TXN_STORE);
                put_u64(&mut buf, *txn_id);
                put_u64(&mut buf, *index_id);
                put_bytes(&mut buf, key);
                put_opt_bytes(&mut buf, value.as_deref());
            }
            RedoOp::TxnStoreCommitFinal { txn_id, index_id, key, value } => {
                buf.push(OP_TXN_STORE_COMMIT_FINAL);
                put_u64(&mut buf, *txn_id);
                put_u64(&mut buf, *index_id);
                put_bytes(&mut buf, key);
                put_opt_bytes(&mut buf, value.as_deref());
            }
            RedoOp::TxnCustom { txn_id, message } => {
                buf.push(OP_TXN_CUSTOM);
                put_u64(&mut buf, *txn_id);
                put_bytes(&mut buf, message);
            }
            RedoOp::TxnCustomLock { txn_id, index_id, key, message } => {
                buf.push(OP_TXN_CUSTOM_LOCK);
                put_u64(&mut buf, *txn_id);
                put_u64(&mut buf, *index_id);
                put_bytes(&mut buf, key);
                put_bytes(&mut buf, message);
            }
        }
        buf
    }

    fn decode(opcode: u8, body: &[u8]) -> Result<RedoOp> {
        let mut r = Reader { buf: body, pos: 0 };
        Ok(match opcode {
            OP_TIMESTAMP => RedoOp::Timestamp(r.u64()?),
            OP_RESET => RedoOp::Reset,
            OP_SHUTDOWN => RedoOp::Shutdown,
            OP_CLOSE => RedoOp::Close,
            OP_END_FILE => RedoOp::EndFile,
            OP_STORE => RedoOp::Store { index_id: r.u64()?, key: r.bytes()?, value: r.opt_bytes()? },
            OP_STORE_NO_LOCK => RedoOp::StoreNoLock { index_id: r.u64()?, key: r.bytes()?, value: r.opt_bytes()? },
            OP_RENAME_INDEX => RedoOp::RenameIndex { index_id: r.u64()?, name: r.opt_string()? },
            OP_DELETE_INDEX => RedoOp::DeleteIndex { index_id: r.u64()? },
            OP_TXN_ENTER => RedoOp::TxnEnter { txn_id: r.u64()? },
            OP_TXN_ROLLBACK => RedoOp::TxnRollback { txn_id: r.u64()? },
            OP_TXN_ROLLBACK_FINAL => RedoOp::TxnRollbackFinal { txn_id: r.u64()? },
            OP_TXN_COMMIT => RedoOp::TxnCommit { txn_id: r.u64()? },
            OP_TXN_COMMIT_FINAL => RedoOp::TxnCommitFinal { txn_id: r.u64()? },
            OP_TXN_STORE => RedoOp::TxnStore { txn_id: r.u64()?, index_id: r.u64()?, key: r.bytes()?, value: r.opt_bytes()? },
            OP_TXN_STORE_COMMIT_FINAL => {
                RedoOp::TxnStoreCommitFinal { txn_id: r.u64()?, index_id: r.u64()?, key: r.bytes()?, value: r.opt_bytes()? }
            }
            OP_TXN_CUSTOM => RedoOp::TxnCustom { txn_id: r.u64()?, message: r.bytes()? },
            OP_TXN_CUSTOM_LOCK => {
                RedoOp::TxnCustomLock { txn_id: r.u64()?, index_id: r.u64()?, key: r.bytes()?, message: r.bytes()? }
            }
            other => return Err(Error::Corrupt(format!("unknown redo opcode {other}"))),
        })
    }

    /// True for the opcodes that close out a transaction (used by recovery
    /// to know when a txn's buffered operations become visible).
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            RedoOp::TxnRollbackFinal { .. } | RedoOp::TxnCommitFinal { .. } | RedoOp::TxnStoreCommitFinal { .. }
        )
    }
}

/// Append-only log of [`RedoOp`] records, each framed with a length prefix
/// and a crc32c trailer.
pub struct RedoLog {
    file: Mutex<File>,
    path: PathBuf,
}

impl RedoLog {
    pub fn open(path: &Path) -> Result<RedoLog> {
        let file = OpenOptions::new().read(true).write(true).create(true).append(false).open(path)?;
        Ok(RedoLog { file: Mutex::new(file), path: path.to_path_buf() })
    }

    /// Appends one record, honoring `mode`'s durability guarantee: `Sync`
    /// blocks until the write is fsync'd; `NoSync`/`NoFlush` write through
    /// the OS without waiting; `NoRedo` skips the log entirely. Durability
    /// mode only gates whether/how long the caller waits — the record is
    /// always written except under `NoRedo`.
    pub fn append(&self, op: &RedoOp, mode: DurabilityMode) -> Result<u64> {
        if mode == DurabilityMode::NoRedo {
            let file = self.file.lock().unwrap();
            return Ok(file.metadata()?.len());
        }
        let body = op.encode();
        let crc = crc32c(&body);
        let mut file = self.file.lock().unwrap();
        let pos = file.metadata()?.len();
        let mut record = Vec::with_capacity(4 + body.len() + 4);
        record.extend_from_slice(&(body.len() as u32).to_be_bytes());
        record.extend_from_slice(&body);
        record.extend_from_slice(&crc.to_be_bytes());
        file.write_all_at(&record, pos)?;
        if mode == DurabilityMode::Sync {
            file.sync_data()?;
        }
        Ok(pos + record.len() as u64)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().unwrap().sync_data()?;
        Ok(())
    }

    pub fn position(&self) -> Result<u64> {
        Ok(self.file.lock().unwrap().metadata()?.len())
    }

    /// Truncates the log back to empty; called by the checkpoint
    /// coordinator once every record up to the checkpoint position has been
    /// made durable in the page file.
    pub fn reset(&self) -> Result<()> {
        let file = self.file.lock().unwrap();
        file.set_len(0)?;
        file.sync_all()?;
        Ok(())
    }

    /// Reads every well-formed record from `path` for crash recovery. Stops
    /// (without error) at the first truncated or crc-mismatched record,
    /// since that's exactly what an interrupted append looks like.
    pub fn replay(path: &Path) -> Result<Vec<RedoOp>> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut ops = Vec::new();
        let mut pos = 0usize;
        while pos + 4 <= data.len() {
            let len = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            let body_start = pos + 4;
            let body_end = body_start + len;
            let crc_end = body_end + 4;
            if crc_end > data.len() {
                break;
            }
            let body = &data[body_start..body_end];
            let stored_crc = u32::from_be_bytes(data[body_end..crc_end].try_into().unwrap());
            if crc32c(body) != stored_crc {
                break;
            }
            if body.is_empty() {
                break;
            }
            let op = RedoOp::decode(body[0], &body[1..])?;
            ops.push(op);
            pos = crc_end;
        }
        Ok(ops)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_store_and_txn_ops() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let log = RedoLog::open(&path).unwrap();
        log.append(&RedoOp::TxnEnter { txn_id: 1 }, DurabilityMode::Sync).unwrap();
        log.append(
            &RedoOp::TxnStore { txn_id: 1, index_id: 0, key: b"k".to_vec(), value: Some(b"v".to_vec()) },
            DurabilityMode::Sync,
        )
        .unwrap();
        log.append(&RedoOp::TxnCommitFinal { txn_id: 1 }, DurabilityMode::Sync).unwrap();

        let ops = RedoLog::replay(&path).unwrap();
        assert_eq!(ops.len(), 3);
        assert!(ops.last().unwrap().is_final());
    }

    #[test]
    fn no_redo_mode_skips_the_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let log = RedoLog::open(&path).unwrap();
        log.append(&RedoOp::TxnEnter { txn_id: 1 }, DurabilityMode::NoRedo).unwrap();
        assert_eq!(RedoLog::replay(&path).unwrap().len(), 0);
    }

    #[test]
    fn replay_stops_cleanly_at_truncated_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let log = RedoLog::open(&path).unwrap();
        log.append(&RedoOp::TxnEnter { txn_id: 7 }, DurabilityMode::Sync).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]).unwrap();
        }
        let ops = RedoLog::replay(&path).unwrap();
        assert_eq!(ops, vec![RedoOp::TxnEnter { txn_id: 7 }]);
    }
}
