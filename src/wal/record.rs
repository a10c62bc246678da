// Log record model and on-disk codec.
//
// Entry layout: a fixed 48-byte header followed by a variable payload.
//
// ```text
// header:  lsn (8) | payload_len (4) | crc32 (4) | timestamp_ms (8)
//          | op (1) | reserved (23)
// payload: txn_id | collection? | document_id? | before? | after?
//          | active_txns (checkpoint only)
// ```
//
// Strings are u32-length-prefixed UTF-8; nullable fields carry a one-byte
// presence flag; document images are self-describing JSON. The CRC32 covers
// the payload only; all integers are little-endian.

use std::io::Read;

use chrono::{DateTime, Utc};

use crate::common::{self, Lsn, TransactionId};
use crate::document::Document;
use crate::error::{DbError, Result};

/// Size of the fixed per-entry header.
pub const ENTRY_HEADER_LEN: usize = 48;

/// Upper bound on a single payload, to fail fast on garbage length fields.
const MAX_PAYLOAD_LEN: u32 = 256 * 1024 * 1024;

/// Operation kind of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogOp {
    Begin,
    Commit,
    Rollback,
    Insert,
    Update,
    Delete,
    Checkpoint,
}

impl LogOp {
    pub fn code(self) -> u8 {
        match self {
            LogOp::Begin => 1,
            LogOp::Commit => 2,
            LogOp::Rollback => 3,
            LogOp::Insert => 4,
            LogOp::Update => 5,
            LogOp::Delete => 6,
            LogOp::Checkpoint => 7,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => LogOp::Begin,
            2 => LogOp::Commit,
            3 => LogOp::Rollback,
            4 => LogOp::Insert,
            5 => LogOp::Update,
            6 => LogOp::Delete,
            7 => LogOp::Checkpoint,
            other => {
                return Err(DbError::corruption(format!(
                    "unknown log op code {other}"
                )))
            }
        })
    }

    /// True for record kinds that change document state.
    pub fn is_data_op(self) -> bool {
        matches!(self, LogOp::Insert | LogOp::Update | LogOp::Delete)
    }
}

/// One write-ahead log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TransactionId,
    pub op: LogOp,
    pub collection: Option<String>,
    pub document_id: Option<String>,
    pub before: Option<Document>,
    pub after: Option<Document>,
    /// Transactions active at checkpoint time; empty for other ops.
    pub active_txns: Vec<TransactionId>,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    fn bare(txn_id: TransactionId, op: LogOp) -> Self {
        LogRecord {
            lsn: 0,
            txn_id,
            op,
            collection: None,
            document_id: None,
            before: None,
            after: None,
            active_txns: Vec::new(),
            timestamp: common::now(),
        }
    }

    pub fn begin(txn_id: TransactionId) -> Self {
        Self::bare(txn_id, LogOp::Begin)
    }

    pub fn commit(txn_id: TransactionId) -> Self {
        Self::bare(txn_id, LogOp::Commit)
    }

    pub fn rollback(txn_id: TransactionId) -> Self {
        Self::bare(txn_id, LogOp::Rollback)
    }

    pub fn insert(txn_id: TransactionId, collection: &str, after: Document) -> Self {
        let mut rec = Self::bare(txn_id, LogOp::Insert);
        rec.collection = Some(collection.to_string());
        rec.document_id = Some(after.id.clone());
        rec.after = Some(after);
        rec
    }

    pub fn update(
        txn_id: TransactionId,
        collection: &str,
        before: Document,
        after: Document,
    ) -> Self {
        let mut rec = Self::bare(txn_id, LogOp::Update);
        rec.collection = Some(collection.to_string());
        rec.document_id = Some(after.id.clone());
        rec.before = Some(before);
        rec.after = Some(after);
        rec
    }

    pub fn delete(txn_id: TransactionId, collection: &str, before: Document) -> Self {
        let mut rec = Self::bare(txn_id, LogOp::Delete);
        rec.collection = Some(collection.to_string());
        rec.document_id = Some(before.id.clone());
        rec.before = Some(before);
        rec
    }

    pub fn checkpoint(active_txns: Vec<TransactionId>) -> Self {
        let mut rec = Self::bare(TransactionId::from_string("checkpoint"), LogOp::Checkpoint);
        rec.active_txns = active_txns;
        rec
    }

    /// The inverse record used to compensate this operation during undo.
    pub fn compensation(&self) -> Option<LogRecord> {
        let collection = self.collection.as_deref()?;
        match self.op {
            LogOp::Insert => Some(LogRecord::delete(
                self.txn_id.clone(),
                collection,
                self.after.clone()?,
            )),
            LogOp::Update => Some(LogRecord::update(
                self.txn_id.clone(),
                collection,
                self.after.clone()?,
                self.before.clone()?,
            )),
            LogOp::Delete => Some(LogRecord::insert(
                self.txn_id.clone(),
                collection,
                self.before.clone()?,
            )),
            _ => None,
        }
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    fn encode_payload(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(128);
        put_string(&mut buf, self.txn_id.as_str());
        put_opt_string(&mut buf, self.collection.as_deref());
        put_opt_string(&mut buf, self.document_id.as_deref());
        put_opt_document(&mut buf, self.before.as_ref())?;
        put_opt_document(&mut buf, self.after.as_ref())?;
        if self.op == LogOp::Checkpoint {
            buf.extend_from_slice(&(self.active_txns.len() as u32).to_le_bytes());
            for txn in &self.active_txns {
                put_string(&mut buf, txn.as_str());
            }
        }
        Ok(buf)
    }

    /// Serialises the full entry (header + payload) for appending.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = self.encode_payload()?;
        let crc = crc32fast::hash(&payload);

        let mut buf = Vec::with_capacity(ENTRY_HEADER_LEN + payload.len());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&common::epoch_millis(self.timestamp).to_le_bytes());
        buf.push(self.op.code());
        buf.extend_from_slice(&[0u8; 23]);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Reads one entry from `reader`.
    ///
    /// Returns `Ok(None)` at a clean end of file or on a torn tail (the
    /// partially written final record of a crashed run). A full-length entry
    /// whose CRC does not validate is `Corruption`.
    pub fn read_from(reader: &mut impl Read) -> Result<Option<LogRecord>> {
        let mut header = [0u8; ENTRY_HEADER_LEN];
        match read_exact_or_eof(reader, &mut header)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Partial => return Ok(None),
            ReadOutcome::Full => {}
        }

        let lsn = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let payload_len = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let crc = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let timestamp_ms = u64::from_le_bytes(header[16..24].try_into().unwrap());
        let op = LogOp::from_code(header[24])?;

        if payload_len > MAX_PAYLOAD_LEN {
            return Err(DbError::corruption(format!(
                "entry at LSN {lsn} declares payload of {payload_len} bytes"
            )));
        }

        let mut payload = vec![0u8; payload_len as usize];
        match read_exact_or_eof(reader, &mut payload)? {
            ReadOutcome::Full => {}
            _ => return Ok(None),
        }

        if crc32fast::hash(&payload) != crc {
            return Err(DbError::corruption(format!(
                "CRC mismatch at LSN {lsn}"
            )));
        }

        let mut cursor = Cursor::new(&payload);
        let txn_id = TransactionId::from_string(cursor.string()?);
        let collection = cursor.opt_string()?;
        let document_id = cursor.opt_string()?;
        let before = cursor.opt_document()?;
        let after = cursor.opt_document()?;
        let mut active_txns = Vec::new();
        if op == LogOp::Checkpoint {
            let count = cursor.u32()?;
            for _ in 0..count {
                active_txns.push(TransactionId::from_string(cursor.string()?));
            }
        }

        Ok(Some(LogRecord {
            lsn,
            txn_id,
            op,
            collection,
            document_id,
            before,
            after,
            active_txns,
            timestamp: common::from_epoch_millis(timestamp_ms),
        }))
    }
}

// =============================================================================
// Byte-level helpers
// =============================================================================

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_opt_string(buf: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.push(1);
            put_string(buf, s);
        }
        None => buf.push(0),
    }
}

fn put_opt_document(buf: &mut Vec<u8>, doc: Option<&Document>) -> Result<()> {
    match doc {
        Some(doc) => {
            buf.push(1);
            let json = serde_json::to_vec(doc)?;
            buf.extend_from_slice(&(json.len() as u32).to_le_bytes());
            buf.extend_from_slice(&json);
        }
        None => buf.push(0),
    }
    Ok(())
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ReadOutcome::Full)
}

/// Bounds-checked reader over a decoded payload.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(DbError::corruption("payload truncated"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DbError::corruption("payload string is not UTF-8"))
    }

    fn opt_string(&mut self) -> Result<Option<String>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.string()?)),
            other => Err(DbError::corruption(format!(
                "invalid presence flag {other}"
            ))),
        }
    }

    fn opt_document(&mut self) -> Result<Option<Document>> {
        match self.u8()? {
            0 => Ok(None),
            1 => {
                let len = self.u32()? as usize;
                let bytes = self.take(len)?;
                Ok(Some(serde_json::from_slice(bytes)?))
            }
            other => Err(DbError::corruption(format!(
                "invalid presence flag {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Cursor as IoCursor;

    use super::*;
    use crate::document::Value;

    fn sample_doc() -> Document {
        let mut data = BTreeMap::new();
        data.insert("n".to_string(), Value::Int(7));
        data.insert("s".to_string(), Value::from("text"));
        Document::new("d1", data).unwrap()
    }

    fn txn() -> TransactionId {
        TransactionId::from_string("txn_20250301120000_00000001_00000000000000000000000000000abc")
    }

    #[test]
    fn test_record_round_trip() {
        let mut rec = LogRecord::update(txn(), "c", sample_doc(), sample_doc());
        rec.lsn = 42;

        let bytes = rec.to_bytes().unwrap();
        let decoded = LogRecord::read_from(&mut IoCursor::new(bytes))
            .unwrap()
            .unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let mut rec = LogRecord::checkpoint(vec![txn()]);
        rec.lsn = 9;

        let bytes = rec.to_bytes().unwrap();
        let decoded = LogRecord::read_from(&mut IoCursor::new(bytes))
            .unwrap()
            .unwrap();
        assert_eq!(decoded.active_txns, vec![txn()]);
        assert_eq!(decoded.op, LogOp::Checkpoint);
    }

    #[test]
    fn test_crc_mismatch_is_corruption() {
        let mut rec = LogRecord::begin(txn());
        rec.lsn = 1;
        let mut bytes = rec.to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let err = LogRecord::read_from(&mut IoCursor::new(bytes)).unwrap_err();
        assert!(matches!(err, DbError::Corruption(_)));
    }

    #[test]
    fn test_torn_tail_is_end_of_log() {
        let mut rec = LogRecord::begin(txn());
        rec.lsn = 1;
        let bytes = rec.to_bytes().unwrap();
        let torn = &bytes[..bytes.len() - 3];

        assert!(LogRecord::read_from(&mut IoCursor::new(torn.to_vec()))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_compensation_inverts_ops() {
        let ins = LogRecord::insert(txn(), "c", sample_doc());
        let comp = ins.compensation().unwrap();
        assert_eq!(comp.op, LogOp::Delete);
        assert_eq!(comp.before, ins.after);

        let del = LogRecord::delete(txn(), "c", sample_doc());
        assert_eq!(del.compensation().unwrap().op, LogOp::Insert);

        assert!(LogRecord::commit(txn()).compensation().is_none());
    }
}
