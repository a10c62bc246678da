// Checkpoint metadata persistence.
//
// The metadata lives in its own file, separate from the log, so a crash
// while writing it can never corrupt log ordering. The file starts with a
// one-line magic followed by a self-describing JSON payload, and is replaced
// atomically: write to a temp file, fsync, rename over the old one.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::common::{Lsn, TransactionId};
use crate::error::Result;

const MAGIC_LINE: &str = "DOCUCKPT v1";

/// Durable description of the most recent checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// LSN of the Checkpoint record in the log.
    pub lsn: Lsn,
    pub timestamp: DateTime<Utc>,
    /// Transactions that were active when the checkpoint was taken.
    pub active_txns: Vec<TransactionId>,
}

/// Loads the checkpoint metadata, or None when the file is absent or not a
/// valid checkpoint (recovery then starts from the beginning of the log).
pub fn load(path: &Path) -> Option<CheckpointMeta> {
    let mut raw = String::new();
    File::open(path).ok()?.read_to_string(&mut raw).ok()?;

    let (magic, payload) = raw.split_once('\n')?;
    if magic.trim_end() != MAGIC_LINE {
        warn!(path = %path.display(), "checkpoint file has bad magic; ignoring");
        return None;
    }
    match serde_json::from_str(payload) {
        Ok(meta) => Some(meta),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "checkpoint file unreadable; ignoring");
            None
        }
    }
}

/// Atomically replaces the checkpoint metadata file.
pub fn store(path: &Path, meta: &CheckpointMeta) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        writeln!(file, "{MAGIC_LINE}")?;
        file.write_all(serde_json::to_string_pretty(meta)?.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::common;

    #[test]
    fn test_store_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.checkpoint");

        let meta = CheckpointMeta {
            lsn: 17,
            timestamp: common::now(),
            active_txns: vec![TransactionId::from_string("txn_a")],
        };
        store(&path, &meta).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.lsn, 17);
        assert_eq!(loaded.active_txns, meta.active_txns);
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempdir().unwrap();
        assert!(load(&dir.path().join("wal.checkpoint")).is_none());
    }

    #[test]
    fn test_bad_magic_is_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.checkpoint");
        fs::write(&path, "NOT A CHECKPOINT\n{}").unwrap();
        assert!(load(&path).is_none());
    }

    #[test]
    fn test_store_replaces_previous(){
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.checkpoint");

        for lsn in [5u64, 9] {
            let meta = CheckpointMeta {
                lsn,
                timestamp: common::now(),
                active_txns: Vec::new(),
            };
            store(&path, &meta).unwrap();
        }
        assert_eq!(load(&path).unwrap().lsn, 9);
    }
}
