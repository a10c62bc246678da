// Write-ahead log: append-only records, rotation, checkpoints, and
// ARIES-style recovery.
//
// Appends are serialised by a single mutex so LSN assignment and the write
// are one indivisible step. Replay readers use independent file handles and
// run concurrently with appends.

pub mod checkpoint;
pub mod log;
pub mod record;
pub mod recovery;

pub use checkpoint::CheckpointMeta;
pub use log::{WalStats, WriteAheadLog};
pub use record::{LogOp, LogRecord};
pub use recovery::{RecoveryOutcome, RecoveryReport};

use std::path::PathBuf;

/// Durability mode for commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// fsync after every Commit record before the append returns.
    Synchronous,
    /// Leave syncing to explicit flushes and checkpoints.
    Lazy,
}

/// Write-ahead log configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding `wal.current`, rotated archives, and the
    /// checkpoint metadata file.
    pub dir: PathBuf,
    pub sync_mode: SyncMode,
    /// Rotation threshold for the current file.
    pub max_file_size: u64,
    /// Archives beyond this count become eligible for deletion once the
    /// checkpoint LSN passes them.
    pub max_retained_files: usize,
}

impl WalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        WalConfig {
            dir: dir.into(),
            sync_mode: SyncMode::Synchronous,
            max_file_size: 64 * 1024 * 1024,
            max_retained_files: 8,
        }
    }
}

/// Name of the active log file inside the data directory.
pub const CURRENT_FILE: &str = "wal.current";

/// Name of the checkpoint metadata file.
pub const CHECKPOINT_FILE: &str = "wal.checkpoint";
