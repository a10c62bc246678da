// Tombstone retention and deferred physical deletion.
//
// Every successful delete or collection drop leaves a tombstone. Once the
// retention period elapses, a collection pass reclaims the backing file (if
// any) and drops the tombstone. Passes are bounded so a backlog cannot
// stall the engine; failures are counted and skipped, not fatal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::{self, TransactionId};

/// Record of a deleted document awaiting physical reclamation.
#[derive(Debug, Clone)]
pub struct Tombstone {
    pub collection: String,
    pub document_id: String,
    /// Document version at deletion time.
    pub version: u64,
    pub deleted_at: DateTime<Utc>,
    /// Backing file to reclaim, when the store is persistent.
    pub file_path: Option<PathBuf>,
    /// Transaction that performed the delete, when transactional.
    pub txn_id: Option<TransactionId>,
}

impl Tombstone {
    pub fn new(collection: impl Into<String>, document_id: impl Into<String>, version: u64) -> Self {
        Tombstone {
            collection: collection.into(),
            document_id: document_id.into(),
            version,
            deleted_at: common::now(),
            file_path: None,
            txn_id: None,
        }
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_txn(mut self, txn_id: TransactionId) -> Self {
        self.txn_id = Some(txn_id);
        self
    }
}

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// How long tombstones are retained before reclamation.
    pub retention_period: Duration,
    /// Upper bound on tombstones processed per pass.
    pub max_tombstones_per_run: usize,
    /// Period of the background pass.
    pub interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            retention_period: Duration::from_secs(24 * 60 * 60),
            max_tombstones_per_run: 1_000,
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct GcStats {
    pub passes: u64,
    pub tombstones_reclaimed: u64,
    pub bytes_freed: u64,
    pub failures: u64,
}

/// Tombstone store and reclamation passes.
pub struct GarbageCollector {
    config: GcConfig,
    tombstones: Mutex<Vec<Tombstone>>,
    stats: Mutex<GcStats>,
}

impl GarbageCollector {
    pub fn new(config: GcConfig) -> Self {
        GarbageCollector {
            config,
            tombstones: Mutex::new(Vec::new()),
            stats: Mutex::new(GcStats::default()),
        }
    }

    /// Records a tombstone for a deleted document.
    pub fn record(&self, tombstone: Tombstone) {
        self.tombstones.lock().push(tombstone);
    }

    pub fn pending(&self) -> usize {
        self.tombstones.lock().len()
    }

    /// Withdraws pending tombstones for a document, e.g. when the delete
    /// that produced them was rolled back. Returns the number removed.
    pub fn cancel(&self, collection: &str, document_id: &str) -> usize {
        let mut tombstones = self.tombstones.lock();
        let before = tombstones.len();
        tombstones.retain(|ts| ts.collection != collection || ts.document_id != document_id);
        before - tombstones.len()
    }

    /// One bounded reclamation pass. Returns the number of tombstones
    /// reclaimed.
    pub fn run_pass(&self) -> usize {
        let cutoff = common::now()
            - chrono::Duration::from_std(self.config.retention_period)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));

        // Take at most `max_tombstones_per_run` expired entries.
        let batch: Vec<Tombstone> = {
            let mut tombstones = self.tombstones.lock();
            let mut batch = Vec::new();
            let mut kept = Vec::with_capacity(tombstones.len());
            for ts in tombstones.drain(..) {
                if ts.deleted_at <= cutoff && batch.len() < self.config.max_tombstones_per_run {
                    batch.push(ts);
                } else {
                    kept.push(ts);
                }
            }
            *tombstones = kept;
            batch
        };

        let mut reclaimed = 0usize;
        let mut bytes = 0u64;
        let mut failures = 0u64;
        for ts in batch {
            match reclaim_file(&ts) {
                Ok(freed) => {
                    bytes += freed;
                    reclaimed += 1;
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        collection = %ts.collection,
                        id = %ts.document_id,
                        error = %e,
                        "tombstone reclamation failed"
                    );
                    // Put it back for a later pass.
                    self.tombstones.lock().push(ts);
                }
            }
        }

        let mut stats = self.stats.lock();
        stats.passes += 1;
        stats.tombstones_reclaimed += reclaimed as u64;
        stats.bytes_freed += bytes;
        stats.failures += failures;
        drop(stats);

        if reclaimed > 0 {
            debug!(reclaimed, bytes, "garbage collection pass complete");
        }
        reclaimed
    }

    /// Spawns the periodic reclamation loop.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let gc = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gc.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                gc.run_pass();
            }
        })
    }

    pub fn stats(&self) -> GcStats {
        self.stats.lock().clone()
    }
}

/// Deletes the tombstone's backing file, returning bytes freed.
fn reclaim_file(ts: &Tombstone) -> std::io::Result<u64> {
    let Some(path) = &ts.file_path else {
        return Ok(0);
    };
    match std::fs::metadata(path) {
        Ok(meta) => {
            let size = meta.len();
            std::fs::remove_file(path)?;
            Ok(size)
        }
        // Already gone: nothing to free.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn immediate_config() -> GcConfig {
        GcConfig {
            retention_period: Duration::ZERO,
            max_tombstones_per_run: 10,
            interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_retention_period_is_honoured() {
        let gc = GarbageCollector::new(GcConfig::default());
        gc.record(Tombstone::new("c", "d1", 3));

        // 24h retention: nothing is reclaimed yet.
        assert_eq!(gc.run_pass(), 0);
        assert_eq!(gc.pending(), 1);
    }

    #[test]
    fn test_expired_tombstones_are_reclaimed() {
        let gc = GarbageCollector::new(immediate_config());
        gc.record(Tombstone::new("c", "d1", 1));
        gc.record(Tombstone::new("c", "d2", 1));

        assert_eq!(gc.run_pass(), 2);
        assert_eq!(gc.pending(), 0);
        assert_eq!(gc.stats().tombstones_reclaimed, 2);
    }

    #[test]
    fn test_backing_file_is_deleted_and_counted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d1.json");
        std::fs::write(&path, b"0123456789").unwrap();

        let gc = GarbageCollector::new(immediate_config());
        gc.record(Tombstone::new("c", "d1", 1).with_file(path.clone()));

        assert_eq!(gc.run_pass(), 1);
        assert!(!path.exists());
        assert_eq!(gc.stats().bytes_freed, 10);
    }

    #[test]
    fn test_missing_backing_file_is_not_a_failure() {
        let dir = tempdir().unwrap();
        let gc = GarbageCollector::new(immediate_config());
        gc.record(Tombstone::new("c", "d1", 1).with_file(dir.path().join("absent.json")));

        assert_eq!(gc.run_pass(), 1);
        assert_eq!(gc.stats().failures, 0);
    }

    #[test]
    fn test_cancel_withdraws_pending_tombstones() {
        let gc = GarbageCollector::new(immediate_config());
        gc.record(Tombstone::new("c", "d1", 1));
        gc.record(Tombstone::new("c", "d2", 1));

        assert_eq!(gc.cancel("c", "d1"), 1);
        assert_eq!(gc.cancel("c", "d1"), 0);
        assert_eq!(gc.pending(), 1);
    }

    #[test]
    fn test_pass_is_bounded() {
        let mut config = immediate_config();
        config.max_tombstones_per_run = 3;
        let gc = GarbageCollector::new(config);
        for i in 0..10 {
            gc.record(Tombstone::new("c", format!("d{i}"), 1));
        }

        assert_eq!(gc.run_pass(), 3);
        assert_eq!(gc.pending(), 7);
        assert_eq!(gc.run_pass(), 3);
        assert_eq!(gc.pending(), 4);
    }
}
