// Transaction coordinator: lifecycle, undo application, savepoints, and
// the timeout sweeper.
//
// Commit is two-phase within the node: Active → Preparing, Commit record
// appended and made durable, locks released atomically, then Committed.
// Rollback and abort replay the in-memory before-images in reverse before
// releasing locks. Any failure along the commit path lands the transaction
// in Failed with its locks released and its entry removed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::common::{self, TransactionId};
use crate::document::Collections;
use crate::error::{DbError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::gc::GarbageCollector;
use crate::index::IndexManager;
use crate::lock::LockManager;
use crate::store::DiskStore;
use crate::ttl::TtlService;
use crate::wal::WriteAheadLog;

use super::context::{IsolationLevel, TransactionContext, TxnState, UndoEntry};

/// Reason recorded when the sweeper aborts an expired transaction.
const TIMEOUT_REASON: &str = "Transaction timed out.";

/// Options for [`TransactionCoordinator::begin`].
#[derive(Debug, Clone, Default)]
pub struct TxnOptions {
    pub isolation: IsolationLevel,
    /// Overrides the coordinator's default transaction timeout.
    pub timeout: Option<Duration>,
}

impl TxnOptions {
    pub fn with_isolation(isolation: IsolationLevel) -> Self {
        TxnOptions {
            isolation,
            ..Default::default()
        }
    }
}

/// Coordinates transaction lifecycle across the WAL, lock manager, and
/// document stores.
pub struct TransactionCoordinator {
    wal: Arc<WriteAheadLog>,
    locks: Arc<LockManager>,
    collections: Arc<Collections>,
    indexes: Arc<IndexManager>,
    ttl: Arc<TtlService>,
    gc: Arc<GarbageCollector>,
    disk: Option<Arc<DiskStore>>,
    active: DashMap<TransactionId, TransactionContext>,
    sequence: AtomicU64,
    default_timeout: Option<Duration>,
    sweep_interval: Duration,
    events: EventBus,
}

impl TransactionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wal: Arc<WriteAheadLog>,
        locks: Arc<LockManager>,
        collections: Arc<Collections>,
        indexes: Arc<IndexManager>,
        ttl: Arc<TtlService>,
        gc: Arc<GarbageCollector>,
        disk: Option<Arc<DiskStore>>,
        default_timeout: Option<Duration>,
        sweep_interval: Duration,
        events: EventBus,
    ) -> Self {
        TransactionCoordinator {
            wal,
            locks,
            collections,
            indexes,
            ttl,
            gc,
            disk,
            active: DashMap::new(),
            sequence: AtomicU64::new(0),
            default_timeout,
            sweep_interval,
            events,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts a transaction: a Begin record first, then registration. A
    /// registration failure after the append would burn the ID, which is
    /// why the insert below is infallible by construction.
    pub fn begin(&self, options: TxnOptions) -> Result<TransactionId> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let id = TransactionId::generate(common::now(), sequence, rand::random::<u128>());

        self.wal.append_begin(id.clone())?;
        let timeout = options.timeout.or(self.default_timeout);
        let ctx = TransactionContext::new(id.clone(), options.isolation, timeout);
        self.active.insert(id.clone(), ctx);

        debug!(txn = %id, isolation = %options.isolation, "transaction started");
        Ok(id)
    }

    /// Commits: Preparing → durable Commit record → atomic lock release →
    /// Committed. Any failure transitions to Failed, still releasing locks
    /// and removing the entry.
    pub fn commit(&self, txn: &TransactionId) -> Result<()> {
        {
            let mut ctx = self.get_mut(txn)?;
            ctx.ensure_active()?;
            ctx.transition(TxnState::Preparing)?;
        }

        if let Err(e) = self.wal.append_commit(txn.clone()) {
            warn!(txn = %txn, error = %e, "commit append failed; transaction Failed");
            if let Some(mut ctx) = self.active.get_mut(txn) {
                ctx.state = TxnState::Failed;
            }
            self.locks.release_all(txn);
            self.active.remove(txn);
            return Err(e);
        }

        self.locks.release_all(txn);
        if let Some(mut ctx) = self.active.get_mut(txn) {
            ctx.transition(TxnState::Committed)?;
        }
        self.active.remove(txn);

        self.events.publish(EngineEvent::TransactionCommitted {
            txn_id: txn.clone(),
        });
        debug!(txn = %txn, "transaction committed");
        Ok(())
    }

    /// Rolls back: Rollback record, before-images replayed in reverse,
    /// locks released.
    pub fn rollback(&self, txn: &TransactionId) -> Result<()> {
        self.rollback_inner(txn)?;
        self.events.publish(EngineEvent::TransactionRolledBack {
            txn_id: txn.clone(),
        });
        debug!(txn = %txn, "transaction rolled back");
        Ok(())
    }

    /// Rollback plus an event carrying the reason. Also clears deadlock
    /// victim state so the ID stops failing acquires.
    pub fn abort(&self, txn: &TransactionId, reason: &str) -> Result<()> {
        self.rollback_inner(txn)?;
        self.locks.forget(txn);
        self.events.publish(EngineEvent::TransactionAborted {
            txn_id: txn.clone(),
            reason: reason.to_string(),
        });
        info!(txn = %txn, reason, "transaction aborted");
        Ok(())
    }

    fn rollback_inner(&self, txn: &TransactionId) -> Result<()> {
        let undo_log = {
            let mut ctx = self.get_mut(txn)?;
            ctx.ensure_active()?;
            ctx.transition(TxnState::RollingBack)?;
            std::mem::take(&mut ctx.undo_log)
        };

        self.wal.append_rollback(txn.clone())?;
        for entry in undo_log.iter().rev() {
            self.apply_undo(entry);
        }

        self.locks.release_all(txn);
        if let Some(mut ctx) = self.active.get_mut(txn) {
            ctx.transition(TxnState::RolledBack)?;
        }
        self.active.remove(txn);
        Ok(())
    }

    /// Reverts one operation by restoring its before-image, keeping the
    /// indexes, TTL registrations, disk mirror, and pending tombstones in
    /// step. Best effort: a document already gone is not an error during
    /// undo.
    fn apply_undo(&self, entry: &UndoEntry) {
        let Ok(collection) = self.collections.get(&entry.collection) else {
            return;
        };
        match (&entry.before, &entry.after) {
            // Update: restore the pre-image.
            (Some(before), Some(after)) => {
                if collection.update(before.clone()).is_ok() {
                    let _ = self.indexes.on_update(&entry.collection, after, before);
                    self.ttl.register(&entry.collection, before);
                    if let Some(disk) = &self.disk {
                        let _ = disk.save(&entry.collection, before);
                    }
                }
            }
            // Insert: remove the document again.
            (None, Some(after)) => {
                if collection.delete(&entry.document_id).is_ok() {
                    self.indexes.on_remove(&entry.collection, after);
                    self.ttl.unregister(&entry.collection, &entry.document_id);
                    if let Some(disk) = &self.disk {
                        let _ = disk.remove(&entry.collection, &entry.document_id);
                    }
                }
            }
            // Delete: bring the pre-image back and withdraw its tombstone.
            (Some(before), None) => {
                if collection.insert(before.clone()).is_ok() {
                    let _ = self.indexes.on_insert(&entry.collection, before);
                    self.ttl.register(&entry.collection, before);
                    self.gc.cancel(&entry.collection, &entry.document_id);
                    if let Some(disk) = &self.disk {
                        let _ = disk.save(&entry.collection, before);
                    }
                }
            }
            (None, None) => {}
        }
    }

    /// Lands a transaction in `Failed` after an unrecoverable log append
    /// error. In-memory effects are reverted from the undo log (the log
    /// itself is unusable, so no Rollback record is written), locks are
    /// released, and the entry removed.
    pub fn fail(&self, txn: &TransactionId) {
        let undo_log = match self.active.get_mut(txn) {
            Some(mut ctx) => {
                ctx.state = TxnState::Failed;
                std::mem::take(&mut ctx.undo_log)
            }
            None => Vec::new(),
        };
        for entry in undo_log.iter().rev() {
            self.apply_undo(entry);
        }
        self.locks.release_all(txn);
        self.active.remove(txn);
        warn!(txn = %txn, "transaction failed");
    }

    // =========================================================================
    // Savepoints
    // =========================================================================

    /// Captures the current log position under `name`.
    pub fn savepoint(&self, txn: &TransactionId, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(DbError::invalid_argument("savepoint name is empty"));
        }
        let lsn = self.wal.current_lsn();
        let mut ctx = self.get_mut(txn)?;
        ctx.ensure_active()?;
        ctx.add_savepoint(name, lsn);
        Ok(())
    }

    /// Undoes operations with an LSN strictly greater than the savepoint's
    /// and discards savepoints created after it. The named savepoint stays
    /// valid, so repeating the call is a no-op.
    pub fn rollback_to_savepoint(&self, txn: &TransactionId, name: &str) -> Result<()> {
        let undone = {
            let mut ctx = self.get_mut(txn)?;
            ctx.ensure_active()?;
            let sp = ctx
                .savepoint(name)
                .ok_or_else(|| {
                    DbError::not_found(format!("savepoint '{name}' in transaction {txn}"))
                })?
                .clone();

            let split = ctx
                .undo_log
                .iter()
                .position(|entry| entry.lsn > sp.lsn)
                .unwrap_or(ctx.undo_log.len());
            let undone: Vec<UndoEntry> = ctx.undo_log.split_off(split);
            ctx.operation_count = sp.operation_count;
            ctx.savepoints
                .retain(|other| other.lsn < sp.lsn || other.name == name);
            undone
        };

        for entry in undone.iter().rev() {
            self.apply_undo(entry);
        }
        Ok(())
    }

    // =========================================================================
    // Operation bookkeeping (called by the engine's data path)
    // =========================================================================

    /// Validates that `txn` can run an operation right now. Deadlock
    /// victims fail with the distinguished error.
    pub fn ensure_operable(&self, txn: &TransactionId, resource: &str) -> Result<()> {
        if self.locks.is_victim(txn) {
            return Err(DbError::DeadlockDetected {
                victim: txn.clone(),
                resource: resource.to_string(),
            });
        }
        let ctx = self
            .active
            .get(txn)
            .ok_or_else(|| DbError::illegal_state(format!("unknown transaction {txn}")))?;
        ctx.ensure_active()
    }

    /// Records a completed write with its undo information.
    pub fn record_write(&self, txn: &TransactionId, entry: UndoEntry) -> Result<()> {
        let mut ctx = self.get_mut(txn)?;
        ctx.write_set
            .insert(format!("{}:{}", entry.collection, entry.document_id));
        ctx.operation_count += 1;
        ctx.undo_log.push(entry);
        Ok(())
    }

    /// Records a read for isolation levels that track read sets.
    pub fn record_read(&self, txn: &TransactionId, resource: &str) {
        if let Some(mut ctx) = self.active.get_mut(txn) {
            if ctx.isolation == IsolationLevel::RepeatableRead
                || ctx.isolation == IsolationLevel::Serializable
            {
                ctx.read_set.insert(resource.to_string());
            }
            ctx.operation_count += 1;
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn info(&self, txn: &TransactionId) -> Option<TransactionContext> {
        self.active.get(txn).map(|ctx| ctx.clone())
    }

    pub fn isolation(&self, txn: &TransactionId) -> Result<IsolationLevel> {
        self.active
            .get(txn)
            .map(|ctx| ctx.isolation)
            .ok_or_else(|| DbError::illegal_state(format!("unknown transaction {txn}")))
    }

    /// IDs of all live transactions.
    pub fn active(&self) -> Vec<TransactionId> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    // =========================================================================
    // Timeouts
    // =========================================================================

    /// Aborts every transaction past its expiry. Returns the IDs aborted.
    pub fn sweep_expired(&self) -> Vec<TransactionId> {
        let now = common::now();
        let expired: Vec<TransactionId> = self
            .active
            .iter()
            .filter(|e| e.value().is_expired(now) && e.value().state == TxnState::Active)
            .map(|e| e.key().clone())
            .collect();

        let mut aborted = Vec::new();
        for txn in expired {
            match self.abort(&txn, TIMEOUT_REASON) {
                Ok(()) => aborted.push(txn),
                Err(e) => warn!(txn = %txn, error = %e, "timeout abort failed"),
            }
        }
        aborted
    }

    /// Spawns the background timeout sweeper.
    pub fn start_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                coordinator.sweep_expired();
            }
        })
    }

    fn get_mut(
        &self,
        txn: &TransactionId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, TransactionId, TransactionContext>> {
        self.active
            .get_mut(txn)
            .ok_or_else(|| DbError::illegal_state(format!("unknown transaction {txn}")))
    }
}
