// Crash recovery over the write-ahead log.
//
// One forward pass from the last checkpoint builds a transaction table
// mapping txn → (operations, status). Transactions with a Commit record are
// redone; transactions with neither Commit nor Rollback are undone by
// iterating their operations in reverse and appending compensating records.
// A CRC mismatch anywhere in the pass is fatal.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::common::{Lsn, TransactionId};
use crate::error::Result;

use super::log::WriteAheadLog;
use super::record::{LogOp, LogRecord};

/// What recovery found, per the recovery contract.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub committed_txns: Vec<TransactionId>,
    pub incomplete_txns: Vec<TransactionId>,
    pub replayed_count: usize,
}

/// Report plus the record streams the engine applies to its stores.
#[derive(Debug)]
pub struct RecoveryOutcome {
    pub report: RecoveryReport,
    /// Data operations of committed transactions, in LSN order. Applying
    /// these to empty stores reproduces the committed state.
    pub committed_ops: Vec<LogRecord>,
    /// Compensating operations for incomplete transactions, in undo order.
    /// Already appended to the log; the engine applies them to any state
    /// hydrated from disk.
    pub undo_ops: Vec<LogRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnStatus {
    InFlight,
    Committed,
    RolledBack,
}

struct TxnEntry {
    status: TxnStatus,
    ops: Vec<LogRecord>,
}

impl WriteAheadLog {
    /// Runs recovery: replays from the last checkpoint (or log start),
    /// classifies transactions, and writes compensating records for the
    /// incomplete ones.
    pub fn recover(&self) -> Result<RecoveryOutcome> {
        let start_lsn = match self.last_checkpoint_lsn() {
            0 => 1,
            lsn => lsn,
        };

        let mut table: HashMap<TransactionId, TxnEntry> = HashMap::new();
        let mut order: Vec<TransactionId> = Vec::new();
        let mut replayed = 0usize;

        for record in self.replay_from(start_lsn)? {
            let record = record?; // Corruption propagates and ends the run.
            replayed += 1;

            match record.op {
                LogOp::Begin => {
                    table
                        .entry(record.txn_id.clone())
                        .or_insert_with(|| TxnEntry {
                            status: TxnStatus::InFlight,
                            ops: Vec::new(),
                        });
                    order.push(record.txn_id.clone());
                }
                LogOp::Commit => {
                    if let Some(entry) = table.get_mut(&record.txn_id) {
                        entry.status = TxnStatus::Committed;
                    }
                }
                LogOp::Rollback => {
                    if let Some(entry) = table.get_mut(&record.txn_id) {
                        entry.status = TxnStatus::RolledBack;
                    }
                }
                LogOp::Insert | LogOp::Update | LogOp::Delete => {
                    let entry = table
                        .entry(record.txn_id.clone())
                        .or_insert_with(|| {
                            // Started before the checkpoint window.
                            order.push(record.txn_id.clone());
                            TxnEntry {
                                status: TxnStatus::InFlight,
                                ops: Vec::new(),
                            }
                        });
                    entry.ops.push(record);
                }
                LogOp::Checkpoint => {
                    for txn in &record.active_txns {
                        table.entry(txn.clone()).or_insert_with(|| {
                            order.push(txn.clone());
                            TxnEntry {
                                status: TxnStatus::InFlight,
                                ops: Vec::new(),
                            }
                        });
                    }
                }
            }
        }

        // Redo set: committed transactions' data ops in LSN order.
        let mut committed_ops: Vec<LogRecord> = Vec::new();
        let mut committed_txns = Vec::new();
        let mut incomplete_txns = Vec::new();
        for txn in &order {
            let entry = match table.get(txn) {
                Some(e) => e,
                None => continue,
            };
            match entry.status {
                TxnStatus::Committed => {
                    if !committed_txns.contains(txn) {
                        committed_txns.push(txn.clone());
                        committed_ops.extend(entry.ops.iter().cloned());
                    }
                }
                TxnStatus::InFlight => {
                    if !incomplete_txns.contains(txn) {
                        incomplete_txns.push(txn.clone());
                    }
                }
                TxnStatus::RolledBack => {}
            }
        }
        committed_ops.sort_by_key(|r| r.lsn);

        // Undo set: incomplete transactions, operations reversed, with
        // compensating records appended to the log.
        let mut undo_ops = Vec::new();
        for txn in &incomplete_txns {
            let entry = &table[txn];
            for op in entry.ops.iter().rev() {
                if let Some(compensation) = op.compensation() {
                    self.append(compensation.clone())?;
                    undo_ops.push(compensation);
                }
            }
            self.append_rollback(txn.clone())?;
            warn!(txn = %txn, ops = entry.ops.len(), "incomplete transaction rolled back");
        }
        if !incomplete_txns.is_empty() {
            self.flush()?;
        }

        info!(
            replayed,
            committed = committed_txns.len(),
            incomplete = incomplete_txns.len(),
            "recovery pass complete"
        );

        Ok(RecoveryOutcome {
            report: RecoveryReport {
                committed_txns,
                incomplete_txns,
                replayed_count: replayed,
            },
            committed_ops,
            undo_ops,
        })
    }
}

/// First LSN worth replaying after `checkpoint_lsn`; exposed for tests.
pub fn replay_start(checkpoint_lsn: Lsn) -> Lsn {
    if checkpoint_lsn == 0 {
        1
    } else {
        checkpoint_lsn
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::tempdir;

    use super::*;
    use crate::document::{Document, Value};
    use crate::events::EventBus;
    use crate::wal::{WalConfig, WriteAheadLog};

    fn txn(n: u64) -> TransactionId {
        TransactionId::from_string(format!("txn_20250301120000_{n:08}_0"))
    }

    fn doc(id: &str, v: i64) -> Document {
        let mut data = BTreeMap::new();
        data.insert("v".to_string(), Value::Int(v));
        Document::new(id, data).unwrap()
    }

    fn open(dir: &std::path::Path) -> WriteAheadLog {
        WriteAheadLog::open(WalConfig::new(dir), EventBus::new()).unwrap()
    }

    #[test]
    fn test_committed_and_incomplete_classification() {
        let dir = tempdir().unwrap();
        {
            let wal = open(dir.path());
            // T1 commits.
            wal.append_begin(txn(1)).unwrap();
            wal.append_insert(txn(1), "c", doc("d1", 1)).unwrap();
            wal.append_commit(txn(1)).unwrap();
            // T2 crashes mid-flight.
            wal.append_begin(txn(2)).unwrap();
            wal.append_update(txn(2), "c", doc("d1", 1), doc("d1", 2))
                .unwrap();
            wal.flush().unwrap();
        }

        let wal = open(dir.path());
        let outcome = wal.recover().unwrap();
        assert_eq!(outcome.report.committed_txns, vec![txn(1)]);
        assert_eq!(outcome.report.incomplete_txns, vec![txn(2)]);
        assert!(outcome.report.replayed_count >= 5);

        // Redo stream holds exactly T1's insert.
        assert_eq!(outcome.committed_ops.len(), 1);
        assert_eq!(outcome.committed_ops[0].op, LogOp::Insert);

        // T2's update was compensated with the inverse update.
        assert_eq!(outcome.undo_ops.len(), 1);
        assert_eq!(outcome.undo_ops[0].op, LogOp::Update);
        assert_eq!(
            outcome.undo_ops[0].after.as_ref().unwrap().get("v").unwrap(),
            Some(&Value::Int(1))
        );
    }

    #[test]
    fn test_rolled_back_txn_is_neither() {
        let dir = tempdir().unwrap();
        {
            let wal = open(dir.path());
            wal.append_begin(txn(1)).unwrap();
            wal.append_insert(txn(1), "c", doc("d1", 1)).unwrap();
            wal.append_rollback(txn(1)).unwrap();
            wal.flush().unwrap();
        }

        let wal = open(dir.path());
        let outcome = wal.recover().unwrap();
        assert!(outcome.report.committed_txns.is_empty());
        assert!(outcome.report.incomplete_txns.is_empty());
        assert!(outcome.committed_ops.is_empty());
    }

    #[test]
    fn test_recovery_is_idempotent_after_clean_close() {
        let dir = tempdir().unwrap();
        {
            let wal = open(dir.path());
            wal.append_begin(txn(1)).unwrap();
            wal.append_insert(txn(1), "c", doc("d1", 1)).unwrap();
            wal.append_commit(txn(1)).unwrap();
            wal.close().unwrap();
        }

        for _ in 0..2 {
            let wal = open(dir.path());
            let outcome = wal.recover().unwrap();
            assert_eq!(outcome.report.committed_txns, vec![txn(1)]);
            assert!(outcome.report.incomplete_txns.is_empty());
            wal.close().unwrap();
        }
    }

    #[test]
    fn test_recovery_starts_from_checkpoint() {
        let dir = tempdir().unwrap();
        {
            let wal = open(dir.path());
            wal.append_begin(txn(1)).unwrap();
            wal.append_insert(txn(1), "c", doc("d1", 1)).unwrap();
            wal.append_commit(txn(1)).unwrap();
            wal.create_checkpoint(&[]).unwrap();
            wal.append_begin(txn(2)).unwrap();
            wal.append_insert(txn(2), "c", doc("d2", 1)).unwrap();
            wal.append_commit(txn(2)).unwrap();
            wal.flush().unwrap();
        }

        let wal = open(dir.path());
        let outcome = wal.recover().unwrap();
        // T1 sits entirely before the checkpoint and is not replayed.
        assert_eq!(outcome.report.committed_txns, vec![txn(2)]);
    }

    #[test]
    fn test_replay_start_boundaries() {
        assert_eq!(replay_start(0), 1);
        assert_eq!(replay_start(7), 7);
    }
}
