// Append path, file format, and rotation for the write-ahead log.
//
// File layout: a 32-byte header followed by entries.
//
// ```text
// header: magic "DOCUWALF" (8) | version (2) | reserved (6)
//         | current LSN (8) | created_ms (8)
// ```
//
// The header's LSN field is refreshed on rotation and close; the true tip is
// always recoverable by scanning entries, so a crash between refreshes loses
// nothing.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::common::{self, Lsn, TransactionId};
use crate::document::Document;
use crate::error::{DbError, Result};
use crate::events::{EngineEvent, EventBus};

use super::checkpoint::{self, CheckpointMeta};
use super::record::{LogOp, LogRecord};
use super::{SyncMode, WalConfig, CHECKPOINT_FILE, CURRENT_FILE};

const MAGIC: &[u8; 8] = b"DOCUWALF";
const FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 32;
/// Byte offset of the current-LSN field inside the file header.
const HEADER_LSN_OFFSET: u64 = 16;

/// Counters for observability. All monotonically increasing.
#[derive(Debug, Default, Clone)]
pub struct WalStats {
    pub appends: u64,
    pub bytes_written: u64,
    pub fsyncs: u64,
    pub rotations: u64,
    pub checkpoints: u64,
}

struct Appender {
    file: File,
    written: u64,
    next_lsn: Lsn,
}

/// Append-only write-ahead log over one directory.
pub struct WriteAheadLog {
    config: WalConfig,
    appender: Mutex<Appender>,
    /// Separate flush domain; holds its own handle to the same descriptor.
    flush_handle: Mutex<File>,
    /// Mirror of the next LSN for lock-free reads.
    tip: AtomicU64,
    last_checkpoint_lsn: AtomicU64,
    stats: Mutex<WalStats>,
    events: EventBus,
}

impl WriteAheadLog {
    /// Opens (or creates) the log in `config.dir`.
    pub fn open(config: WalConfig, events: EventBus) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let current = config.dir.join(CURRENT_FILE);

        let (file, written, next_lsn) = if current.exists() {
            open_existing(&current)?
        } else {
            (create_log_file(&current, 0)?, FILE_HEADER_LEN as u64, 1)
        };

        let flush_handle = file.try_clone()?;
        let checkpoint_lsn = checkpoint::load(&config.dir.join(CHECKPOINT_FILE))
            .map(|meta| meta.lsn)
            .unwrap_or(0);

        debug!(next_lsn, checkpoint_lsn, "write-ahead log opened");

        Ok(WriteAheadLog {
            config,
            appender: Mutex::new(Appender {
                file,
                written,
                next_lsn,
            }),
            flush_handle: Mutex::new(flush_handle),
            tip: AtomicU64::new(next_lsn),
            last_checkpoint_lsn: AtomicU64::new(checkpoint_lsn),
            stats: Mutex::new(WalStats::default()),
            events,
        })
    }

    // =========================================================================
    // Append operations
    // =========================================================================

    pub fn append_begin(&self, txn_id: TransactionId) -> Result<Lsn> {
        self.append(LogRecord::begin(txn_id))
    }

    pub fn append_commit(&self, txn_id: TransactionId) -> Result<Lsn> {
        self.append(LogRecord::commit(txn_id))
    }

    pub fn append_rollback(&self, txn_id: TransactionId) -> Result<Lsn> {
        self.append(LogRecord::rollback(txn_id))
    }

    pub fn append_insert(
        &self,
        txn_id: TransactionId,
        collection: &str,
        after: Document,
    ) -> Result<Lsn> {
        self.append(LogRecord::insert(txn_id, collection, after))
    }

    pub fn append_update(
        &self,
        txn_id: TransactionId,
        collection: &str,
        before: Document,
        after: Document,
    ) -> Result<Lsn> {
        self.append(LogRecord::update(txn_id, collection, before, after))
    }

    pub fn append_delete(
        &self,
        txn_id: TransactionId,
        collection: &str,
        before: Document,
    ) -> Result<Lsn> {
        self.append(LogRecord::delete(txn_id, collection, before))
    }

    /// Appends any record, assigning the next LSN. Assignment and write
    /// happen under one mutex acquisition; nothing else suspends while the
    /// guard is held.
    pub fn append(&self, mut record: LogRecord) -> Result<Lsn> {
        let mut guard = self.appender.lock();

        record.lsn = guard.next_lsn;
        let bytes = record.to_bytes()?;
        guard.file.write_all(&bytes)?;
        guard.written += bytes.len() as u64;
        guard.next_lsn += 1;
        self.tip.store(guard.next_lsn, Ordering::Release);

        if record.op == LogOp::Commit && self.config.sync_mode == SyncMode::Synchronous {
            guard.file.sync_data()?;
            self.stats.lock().fsyncs += 1;
        }

        {
            let mut stats = self.stats.lock();
            stats.appends += 1;
            stats.bytes_written += bytes.len() as u64;
        }

        if guard.written >= self.config.max_file_size {
            self.rotate_locked(&mut guard)?;
        }

        Ok(record.lsn)
    }

    /// Forces all buffered records to durable storage.
    pub fn flush(&self) -> Result<()> {
        let handle = self.flush_handle.lock();
        handle.sync_data()?;
        self.stats.lock().fsyncs += 1;
        Ok(())
    }

    // =========================================================================
    // Checkpointing
    // =========================================================================

    /// Creates a checkpoint: flush, append a Checkpoint record naming the
    /// active transactions, then atomically replace the metadata file.
    ///
    /// The metadata write goes temp-file → fsync → rename so a crash during
    /// checkpointing leaves the previous checkpoint intact.
    pub fn create_checkpoint(&self, active_txns: &[TransactionId]) -> Result<Lsn> {
        self.flush()?;
        let lsn = self.append(LogRecord::checkpoint(active_txns.to_vec()))?;
        self.flush()?;

        let meta = CheckpointMeta {
            lsn,
            timestamp: common::now(),
            active_txns: active_txns.to_vec(),
        };
        checkpoint::store(&self.config.dir.join(CHECKPOINT_FILE), &meta)?;

        self.last_checkpoint_lsn.store(lsn, Ordering::Release);
        self.stats.lock().checkpoints += 1;
        self.events.publish(EngineEvent::CheckpointCreated {
            lsn,
            active_transactions: active_txns.len(),
        });
        info!(lsn, active = active_txns.len(), "checkpoint created");
        Ok(lsn)
    }

    /// LSN of the most recent durable checkpoint; 0 when none exists.
    pub fn last_checkpoint_lsn(&self) -> Lsn {
        self.last_checkpoint_lsn.load(Ordering::Acquire)
    }

    /// Highest LSN assigned so far; 0 when the log is empty.
    pub fn current_lsn(&self) -> Lsn {
        self.tip.load(Ordering::Acquire).saturating_sub(1)
    }

    /// Discards archives made fully obsolete by the last checkpoint. An
    /// archive survives until the checkpoint LSN strictly surpasses its
    /// highest LSN, so the Checkpoint record itself stays replayable.
    ///
    /// Returns the number of files removed. Records in the current file are
    /// never truncated in place; they age out through rotation.
    pub fn truncate(&self) -> Result<usize> {
        let checkpoint = self.last_checkpoint_lsn();
        let mut removed = 0;
        for (path, max_lsn) in self.archives()? {
            if max_lsn < checkpoint {
                fs::remove_file(&path)?;
                removed += 1;
                debug!(?path, max_lsn, "archive discarded");
            }
        }
        Ok(removed)
    }

    // =========================================================================
    // Replay
    // =========================================================================

    /// Lazy ordered sequence of records with `lsn >= start_lsn`, spanning
    /// archives and the current file. Uses independent read handles, so it
    /// runs concurrently with appends.
    pub fn replay_from(&self, start_lsn: Lsn) -> Result<WalReader> {
        let mut files: Vec<PathBuf> = self
            .archives()?
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        files.push(self.config.dir.join(CURRENT_FILE));
        Ok(WalReader {
            files: files.into_iter().collect(),
            current: None,
            start_lsn,
        })
    }

    pub fn stats(&self) -> WalStats {
        self.stats.lock().clone()
    }

    /// Flushes and persists the header tip. Called on clean shutdown.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.appender.lock();
        let tip = guard.next_lsn;
        write_header_lsn(&mut guard.file, tip)?;
        guard.file.sync_all()?;
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Archives as `(path, highest LSN in file)`, oldest first.
    fn archives(&self) -> Result<Vec<(PathBuf, Lsn)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.config.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(lsn) = parse_archive_name(&name) {
                out.push((entry.path(), lsn));
            }
        }
        out.sort_by_key(|(_, lsn)| *lsn);
        Ok(out)
    }

    /// Rotates the current file. Caller holds the append mutex.
    fn rotate_locked(&self, guard: &mut Appender) -> Result<()> {
        let last_lsn = guard.next_lsn - 1;
        write_header_lsn(&mut guard.file, guard.next_lsn)?;
        guard.file.sync_all()?;

        let archive_name = format!(
            "wal.{}.{}",
            Utc::now().format("%Y%m%d%H%M%S%3f"),
            last_lsn
        );
        let current_path = self.config.dir.join(CURRENT_FILE);
        let archive_path = self.config.dir.join(&archive_name);
        fs::rename(&current_path, &archive_path)?;

        let file = create_log_file(&current_path, guard.next_lsn)?;
        *self.flush_handle.lock() = file.try_clone()?;
        guard.file = file;
        guard.written = FILE_HEADER_LEN as u64;

        self.stats.lock().rotations += 1;
        self.prune_archives()?;
        self.events.publish(EngineEvent::LogRotated {
            archive: archive_path.clone(),
            last_lsn,
        });
        info!(archive = %archive_path.display(), last_lsn, "log rotated");
        Ok(())
    }

    /// Deletes surplus archives, oldest first, but only once the checkpoint
    /// LSN has passed the file's highest LSN.
    fn prune_archives(&self) -> Result<()> {
        let archives = self.archives()?;
        if archives.len() <= self.config.max_retained_files {
            return Ok(());
        }
        let checkpoint = self.last_checkpoint_lsn();
        let surplus = archives.len() - self.config.max_retained_files;
        for (path, max_lsn) in archives.into_iter().take(surplus) {
            if max_lsn < checkpoint {
                fs::remove_file(&path)?;
                debug!(?path, "surplus archive pruned");
            } else {
                warn!(
                    ?path,
                    max_lsn, checkpoint, "retaining surplus archive until checkpoint passes it"
                );
                break;
            }
        }
        Ok(())
    }
}

/// Lazy record iterator over archive files followed by the current file.
pub struct WalReader {
    files: std::collections::VecDeque<PathBuf>,
    current: Option<BufReader<File>>,
    start_lsn: Lsn,
}

impl Iterator for WalReader {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let path = self.files.pop_front()?;
                let mut reader = match File::open(&path) {
                    Ok(f) => BufReader::new(f),
                    Err(e) => return Some(Err(e.into())),
                };
                if let Err(e) = validate_header(&mut reader, &path) {
                    return Some(Err(e));
                }
                self.current = Some(reader);
            }

            let reader = self.current.as_mut().expect("reader installed above");
            match LogRecord::read_from(reader) {
                Ok(Some(record)) => {
                    if record.lsn >= self.start_lsn {
                        return Some(Ok(record));
                    }
                    // Below the requested start; keep scanning.
                }
                Ok(None) => {
                    self.current = None;
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

fn create_log_file(path: &Path, current_lsn: Lsn) -> Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(path)?;

    let mut header = [0u8; FILE_HEADER_LEN];
    header[0..8].copy_from_slice(MAGIC);
    header[8..10].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    // 6 reserved bytes stay zero.
    header[16..24].copy_from_slice(&current_lsn.to_le_bytes());
    header[24..32].copy_from_slice(&common::epoch_millis(common::now()).to_le_bytes());
    file.write_all(&header)?;
    file.sync_all()?;
    Ok(file)
}

/// Opens an existing current file, scanning to find the tip LSN and size.
fn open_existing(path: &Path) -> Result<(File, u64, Lsn)> {
    let mut reader = BufReader::new(File::open(path)?);
    let header_lsn = validate_header(&mut reader, path)?;

    let mut max_lsn = 0u64;
    while let Some(record) = LogRecord::read_from(&mut reader)? {
        max_lsn = max_lsn.max(record.lsn);
    }
    let next_lsn = max_lsn.max(header_lsn) + 1;

    // Plain write mode, not append: the header-LSN refresh seeks back into
    // the fixed header, which O_APPEND would silently redirect to the end.
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let written = file.seek(SeekFrom::End(0))?;
    Ok((file, written, next_lsn))
}

/// Checks magic and version; returns the header's current-LSN field.
fn validate_header(reader: &mut impl Read, path: &Path) -> Result<Lsn> {
    let mut header = [0u8; FILE_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(|_| DbError::corruption(format!("log file {} has no header", path.display())))?;

    if &header[0..8] != MAGIC {
        return Err(DbError::corruption(format!(
            "log file {} has bad magic",
            path.display()
        )));
    }
    let version = u16::from_le_bytes(header[8..10].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(DbError::corruption(format!(
            "log file {} has unsupported version {version}",
            path.display()
        )));
    }
    Ok(u64::from_le_bytes(header[16..24].try_into().unwrap()))
}

fn write_header_lsn(file: &mut File, lsn: Lsn) -> Result<()> {
    let pos = file.stream_position()?;
    file.seek(SeekFrom::Start(HEADER_LSN_OFFSET))?;
    file.write_all(&lsn.to_le_bytes())?;
    file.seek(SeekFrom::Start(pos))?;
    Ok(())
}

/// Parses `wal.<ts>.<lsn>` archive names; None for anything else.
fn parse_archive_name(name: &str) -> Option<Lsn> {
    let rest = name.strip_prefix("wal.")?;
    if rest == "current" || rest == "checkpoint" {
        return None;
    }
    let (_, lsn) = rest.rsplit_once('.')?;
    lsn.parse().ok()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::tempdir;

    use super::*;
    use crate::document::Value;

    fn txn(n: u64) -> TransactionId {
        TransactionId::from_string(format!("txn_20250301120000_{n:08}_0"))
    }

    fn doc(id: &str) -> Document {
        let mut data = BTreeMap::new();
        data.insert("v".to_string(), Value::Int(1));
        Document::new(id, data).unwrap()
    }

    fn open(dir: &Path) -> WriteAheadLog {
        WriteAheadLog::open(WalConfig::new(dir), EventBus::new()).unwrap()
    }

    #[test]
    fn test_lsns_are_sequential() {
        let dir = tempdir().unwrap();
        let wal = open(dir.path());

        let a = wal.append_begin(txn(1)).unwrap();
        let b = wal.append_insert(txn(1), "c", doc("d1")).unwrap();
        let c = wal.append_commit(txn(1)).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(wal.current_lsn(), 3);
    }

    #[test]
    fn test_replay_returns_appended_records() {
        let dir = tempdir().unwrap();
        let wal = open(dir.path());

        wal.append_begin(txn(1)).unwrap();
        wal.append_insert(txn(1), "c", doc("d1")).unwrap();
        wal.append_commit(txn(1)).unwrap();
        wal.flush().unwrap();

        let records: Vec<LogRecord> = wal
            .replay_from(1)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].op, LogOp::Begin);
        assert_eq!(records[1].op, LogOp::Insert);
        assert_eq!(records[1].after.as_ref().unwrap().id, "d1");
        assert_eq!(records[2].op, LogOp::Commit);
    }

    #[test]
    fn test_reopen_continues_lsn_sequence() {
        let dir = tempdir().unwrap();
        {
            let wal = open(dir.path());
            wal.append_begin(txn(1)).unwrap();
            wal.append_commit(txn(1)).unwrap();
            wal.close().unwrap();
        }
        let wal = open(dir.path());
        assert_eq!(wal.append_begin(txn(2)).unwrap(), 3);
    }

    #[test]
    fn test_rotation_archives_and_continues() {
        let dir = tempdir().unwrap();
        let mut config = WalConfig::new(dir.path());
        config.max_file_size = 256; // rotate almost immediately
        let wal = WriteAheadLog::open(config, EventBus::new()).unwrap();

        for i in 0..10 {
            wal.append_insert(txn(1), "c", doc(&format!("d{i}"))).unwrap();
        }
        wal.flush().unwrap();

        let archives = wal.archives().unwrap();
        assert!(!archives.is_empty());

        // Replay still sees every record in order.
        let records: Vec<LogRecord> = wal
            .replay_from(1)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 10);
        let lsns: Vec<Lsn> = records.iter().map(|r| r.lsn).collect();
        assert_eq!(lsns, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_checkpoint_then_truncate() {
        let dir = tempdir().unwrap();
        let mut config = WalConfig::new(dir.path());
        config.max_file_size = 256;
        let wal = WriteAheadLog::open(config, EventBus::new()).unwrap();

        for i in 0..10 {
            wal.append_insert(txn(1), "c", doc(&format!("d{i}"))).unwrap();
        }
        let ckpt = wal.create_checkpoint(&[]).unwrap();
        assert_eq!(wal.last_checkpoint_lsn(), ckpt);

        let removed = wal.truncate().unwrap();
        assert!(removed > 0);

        // Records after the checkpoint are still replayable.
        let remaining: Vec<LogRecord> = wal
            .replay_from(ckpt)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert!(remaining.iter().any(|r| r.op == LogOp::Checkpoint));
    }
}
