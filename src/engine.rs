//! Engine facade: configuration, wiring, recovery, and the transactional
//! document operations.
//!
//! Data flow per operation: the coordinator validates the transaction, the
//! lock manager grants the resource, the write-ahead log records before and
//! after images, then the collection and every index update in lock-step.
//! When two synchronisation domains are needed the acquisition order is
//! fixed (LockManager, then WAL, then Collection, then Index) so subsystems
//! cannot deadlock against each other.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::common::{self, Lsn, TransactionId};
use crate::document::{
    AtomicOp, AtomicOperators, CollectionStats, Collections, Document, Value,
};
use crate::error::{DbError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::gc::{GarbageCollector, GcConfig, GcStats, Tombstone};
use crate::index::{IndexDefinition, IndexKey, IndexManager};
use crate::lock::{AcquireOutcome, LockManager, LockManagerConfig, LockMode, LockStats};
use crate::store::DiskStore;
use crate::ttl::{DeleteFn, TtlPolicy, TtlService, TtlStats};
use crate::txn::{IsolationLevel, TransactionContext, TransactionCoordinator, TxnOptions, UndoEntry};
use crate::wal::{
    LogOp, LogRecord, RecoveryReport, SyncMode, WalConfig, WalStats, WriteAheadLog,
};

/// Engine configuration. One instance is passed to [`Engine::open`]; there
/// is no global mutable state.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub sync_mode: SyncMode,
    pub wal_max_file_size: u64,
    pub wal_max_retained_files: usize,
    /// Wait bound for transactional lock acquisition.
    pub lock_timeout: Duration,
    pub deadlock_detect_interval: Duration,
    /// Default transaction lifetime; None disables expiry.
    pub txn_timeout: Option<Duration>,
    pub txn_sweep_interval: Duration,
    pub ttl_cleanup_interval: Duration,
    pub gc: GcConfig,
    /// Mirror documents to `<data>/<collection>/<id>.json`.
    pub persistent: bool,
    /// Periodic checkpointing; None leaves checkpoints manual.
    pub checkpoint_interval: Option<Duration>,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        EngineConfig {
            data_dir: data_dir.into(),
            sync_mode: SyncMode::Synchronous,
            wal_max_file_size: 64 * 1024 * 1024,
            wal_max_retained_files: 8,
            lock_timeout: Duration::from_secs(30),
            deadlock_detect_interval: Duration::from_secs(5),
            txn_timeout: Some(Duration::from_secs(300)),
            txn_sweep_interval: Duration::from_secs(30),
            ttl_cleanup_interval: Duration::from_secs(1),
            gc: GcConfig::default(),
            persistent: false,
            checkpoint_interval: None,
        }
    }
}

/// Point-in-time counters across subsystems.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub wal: WalStats,
    pub locks: LockStats,
    pub ttl: TtlStats,
    pub gc: GcStats,
    pub active_transactions: usize,
}

/// The storage engine.
pub struct Engine {
    config: EngineConfig,
    wal: Arc<WriteAheadLog>,
    locks: Arc<LockManager>,
    coordinator: Arc<TransactionCoordinator>,
    collections: Arc<Collections>,
    indexes: Arc<IndexManager>,
    atomics: AtomicOperators,
    ttl: Arc<TtlService>,
    gc: Arc<GarbageCollector>,
    disk: Option<Arc<DiskStore>>,
    events: EventBus,
    recovery: RecoveryReport,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Opens the engine: hydrates persisted documents, runs log recovery,
    /// and (when called inside a Tokio runtime) spawns the background
    /// loops for deadlock detection, transaction timeouts, TTL cleanup,
    /// garbage collection, and optional periodic checkpoints.
    pub fn open(config: EngineConfig) -> Result<Engine> {
        let events = EventBus::new();
        let wal = Arc::new(WriteAheadLog::open(
            WalConfig {
                dir: config.data_dir.clone(),
                sync_mode: config.sync_mode,
                max_file_size: config.wal_max_file_size,
                max_retained_files: config.wal_max_retained_files,
            },
            events.clone(),
        )?);

        let collections = Arc::new(Collections::new());
        let indexes = Arc::new(IndexManager::new());
        let gc = Arc::new(GarbageCollector::new(config.gc.clone()));

        let disk = if config.persistent {
            let store = Arc::new(DiskStore::new(&config.data_dir)?);
            for name in store.collection_names()? {
                let collection = collections.get_or_create(&name)?;
                for doc in store.load_collection(&name)? {
                    let _ = collection.insert(doc);
                }
            }
            Some(store)
        } else {
            None
        };

        // Recovery: redo committed work, then apply the compensations the
        // log pass generated for in-flight transactions.
        let outcome = wal.recover()?;
        for record in outcome
            .committed_ops
            .iter()
            .chain(outcome.undo_ops.iter())
        {
            apply_record(&collections, disk.as_deref(), record);
        }
        let recovery = outcome.report;
        if !recovery.committed_txns.is_empty() || !recovery.incomplete_txns.is_empty() {
            info!(
                committed = recovery.committed_txns.len(),
                rolled_back = recovery.incomplete_txns.len(),
                "recovery applied"
            );
        }

        let ttl = Arc::new(TtlService::new(
            config.ttl_cleanup_interval,
            expired_document_purge(
                Arc::clone(&wal),
                Arc::clone(&collections),
                Arc::clone(&indexes),
                Arc::clone(&gc),
                disk.clone(),
            ),
            events.clone(),
        ));

        let locks = Arc::new(LockManager::new(
            LockManagerConfig {
                default_timeout: config.lock_timeout,
                detect_interval: config.deadlock_detect_interval,
            },
            events.clone(),
        ));
        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::clone(&wal),
            Arc::clone(&locks),
            Arc::clone(&collections),
            Arc::clone(&indexes),
            Arc::clone(&ttl),
            Arc::clone(&gc),
            disk.clone(),
            config.txn_timeout,
            config.txn_sweep_interval,
            events.clone(),
        ));

        let engine = Engine {
            config,
            wal,
            locks,
            coordinator,
            collections,
            indexes,
            atomics: AtomicOperators::new(),
            ttl,
            gc,
            disk,
            events,
            recovery,
            tasks: Mutex::new(Vec::new()),
        };
        engine.spawn_background_tasks();
        Ok(engine)
    }

    fn spawn_background_tasks(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            debug!("no async runtime; background loops not started");
            return;
        }
        let mut tasks = self.tasks.lock();
        tasks.push(Arc::clone(&self.locks).start_detector());
        tasks.push(Arc::clone(&self.coordinator).start_sweeper());
        tasks.push(Arc::clone(&self.ttl).start());
        tasks.push(Arc::clone(&self.gc).start());

        if let Some(interval) = self.config.checkpoint_interval {
            let wal = Arc::clone(&self.wal);
            let coordinator = Arc::clone(&self.coordinator);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) = wal.create_checkpoint(&coordinator.active()) {
                        warn!(error = %e, "periodic checkpoint failed");
                    }
                }
            }));
        }
    }

    /// What the opening recovery pass found.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn begin(&self) -> Result<TransactionId> {
        self.coordinator.begin(TxnOptions::default())
    }

    pub fn begin_with(&self, options: TxnOptions) -> Result<TransactionId> {
        self.coordinator.begin(options)
    }

    pub fn commit(&self, txn: &TransactionId) -> Result<()> {
        self.coordinator.commit(txn)
    }

    pub fn rollback(&self, txn: &TransactionId) -> Result<()> {
        self.coordinator.rollback(txn)
    }

    pub fn abort(&self, txn: &TransactionId, reason: &str) -> Result<()> {
        self.coordinator.abort(txn, reason)
    }

    pub fn savepoint(&self, txn: &TransactionId, name: &str) -> Result<()> {
        self.coordinator.savepoint(txn, name)
    }

    pub fn rollback_to_savepoint(&self, txn: &TransactionId, name: &str) -> Result<()> {
        self.coordinator.rollback_to_savepoint(txn, name)
    }

    pub fn transaction_info(&self, txn: &TransactionId) -> Option<TransactionContext> {
        self.coordinator.info(txn)
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        self.coordinator.active()
    }

    // =========================================================================
    // Collections
    // =========================================================================

    pub fn create_collection(&self, name: &str) -> Result<()> {
        self.collections.create(name).map(|_| ())
    }

    /// Drops a collection, tombstoning every live document and removing
    /// its indexes. Returns the number of documents tombstoned.
    pub fn drop_collection(&self, name: &str) -> Result<usize> {
        let collection = Collections::drop(&self.collections, name)?;
        let docs = collection.get_all();
        for doc in &docs {
            self.ttl.unregister(name, &doc.id);
            self.gc.record(self.tombstone_for(name, doc, None));
        }
        self.indexes.drop_collection(name);
        Ok(docs.len())
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.names()
    }

    pub fn collection_stats(&self, name: &str) -> Result<CollectionStats> {
        Ok(self.collections.get(name)?.stats())
    }

    // =========================================================================
    // Document operations (transactional)
    // =========================================================================

    /// Inserts a new document under `txn`.
    pub async fn insert(
        &self,
        txn: &TransactionId,
        collection: &str,
        id: &str,
        data: BTreeMap<String, Value>,
    ) -> Result<Document> {
        let resource = doc_resource(collection, id);
        self.coordinator.ensure_operable(txn, &resource)?;
        let col = self.collections.get_or_create(collection)?;
        self.lock(txn, &resource, LockMode::Exclusive).await?;

        let doc = Document::new(id, data)?;
        if col.exists(id) {
            return Err(DbError::already_exists(format!(
                "document '{id}' in collection '{collection}'"
            )));
        }

        // Reserve unique keys before logging, so a refused operation leaves
        // no record for recovery to redo.
        self.indexes.on_insert(collection, &doc)?;
        let lsn = match self.append_or_fail(txn, LogRecord::insert(txn.clone(), collection, doc.clone()))
        {
            Ok(lsn) => lsn,
            Err(e) => {
                self.indexes.on_remove(collection, &doc);
                return Err(e);
            }
        };
        col.insert(doc.clone())?;
        self.ttl.register(collection, &doc);
        if let Some(disk) = &self.disk {
            disk.save(collection, &doc)?;
        }

        self.coordinator.record_write(
            txn,
            UndoEntry {
                lsn,
                collection: collection.to_string(),
                document_id: id.to_string(),
                before: None,
                after: Some(doc.clone()),
            },
        )?;
        Ok(doc)
    }

    /// Reads a document under `txn` with isolation-level locking.
    pub async fn get(
        &self,
        txn: &TransactionId,
        collection: &str,
        id: &str,
    ) -> Result<Document> {
        let resource = doc_resource(collection, id);
        self.coordinator.ensure_operable(txn, &resource)?;
        let col = self.collections.get(collection)?;

        match self.coordinator.isolation(txn)? {
            IsolationLevel::ReadUncommitted => {}
            IsolationLevel::ReadCommitted => {
                // Shared lock held only for the read itself.
                let already_held = self.locks.has_lock(txn, &resource);
                self.lock(txn, &resource, LockMode::Shared).await?;
                let result = col.get(id);
                if !already_held {
                    self.locks.release(txn, &resource);
                }
                self.coordinator.record_read(txn, &resource);
                return result;
            }
            IsolationLevel::RepeatableRead => {
                self.lock(txn, &resource, LockMode::Shared).await?;
            }
            IsolationLevel::Serializable => {
                self.lock(txn, &resource, LockMode::Exclusive).await?;
            }
        }
        self.coordinator.record_read(txn, &resource);
        col.get(id)
    }

    /// Replaces a document's data under `txn`.
    pub async fn update(
        &self,
        txn: &TransactionId,
        collection: &str,
        id: &str,
        data: BTreeMap<String, Value>,
    ) -> Result<Document> {
        let resource = doc_resource(collection, id);
        self.coordinator.ensure_operable(txn, &resource)?;
        let col = self.collections.get(collection)?;
        self.lock(txn, &resource, LockMode::Exclusive).await?;

        let before = col.get(id)?;
        let mut after = before.clone();
        after.data = data;
        after.touch();

        self.indexes.on_update(collection, &before, &after)?;
        let lsn = match self.append_or_fail(
            txn,
            LogRecord::update(txn.clone(), collection, before.clone(), after.clone()),
        ) {
            Ok(lsn) => lsn,
            Err(e) => {
                let _ = self.indexes.on_update(collection, &after, &before);
                return Err(e);
            }
        };
        col.update(after.clone())?;
        self.ttl.register(collection, &after);
        if let Some(disk) = &self.disk {
            disk.save(collection, &after)?;
        }

        self.coordinator.record_write(
            txn,
            UndoEntry {
                lsn,
                collection: collection.to_string(),
                document_id: id.to_string(),
                before: Some(before),
                after: Some(after.clone()),
            },
        )?;
        Ok(after)
    }

    /// Deletes a document under `txn`, leaving a tombstone for the GC.
    pub async fn delete(
        &self,
        txn: &TransactionId,
        collection: &str,
        id: &str,
    ) -> Result<Document> {
        let resource = doc_resource(collection, id);
        self.coordinator.ensure_operable(txn, &resource)?;
        let col = self.collections.get(collection)?;
        self.lock(txn, &resource, LockMode::Exclusive).await?;

        let before = col.get(id)?;
        let lsn = self.append_or_fail(
            txn,
            LogRecord::delete(txn.clone(), collection, before.clone()),
        )?;
        col.delete(id)?;
        self.indexes.on_remove(collection, &before);
        self.ttl.unregister(collection, id);
        self.gc
            .record(self.tombstone_for(collection, &before, Some(txn.clone())));

        self.coordinator.record_write(
            txn,
            UndoEntry {
                lsn,
                collection: collection.to_string(),
                document_id: id.to_string(),
                before: Some(before.clone()),
                after: None,
            },
        )?;
        Ok(before)
    }

    /// Runs a staged, all-or-nothing sequence of atomic operators on one
    /// document under `txn`.
    pub async fn apply_atomic(
        &self,
        txn: &TransactionId,
        collection: &str,
        id: &str,
        ops: &[AtomicOp],
    ) -> Result<Document> {
        let resource = doc_resource(collection, id);
        self.coordinator.ensure_operable(txn, &resource)?;
        let col = self.collections.get(collection)?;
        self.lock(txn, &resource, LockMode::Exclusive).await?;

        // Stage the post-image without touching the collection, so the
        // document only becomes visible once the index check and the log
        // append have both succeeded, exactly as in insert/update.
        let (before, after) = self.atomics.stage(&col, id, ops)?;

        self.indexes.on_update(collection, &before, &after)?;
        let lsn = match self.append_or_fail(
            txn,
            LogRecord::update(txn.clone(), collection, before.clone(), after.clone()),
        ) {
            Ok(lsn) => lsn,
            Err(e) => {
                let _ = self.indexes.on_update(collection, &after, &before);
                return Err(e);
            }
        };
        if let Err(e) = col.update_guarded(after.clone(), before.version) {
            let _ = self.indexes.on_update(collection, &after, &before);
            return Err(e);
        }
        self.ttl.register(collection, &after);
        if let Some(disk) = &self.disk {
            disk.save(collection, &after)?;
        }

        self.coordinator.record_write(
            txn,
            UndoEntry {
                lsn,
                collection: collection.to_string(),
                document_id: id.to_string(),
                before: Some(before),
                after: Some(after.clone()),
            },
        )?;
        Ok(after)
    }

    /// Atomic numeric increment; returns the new value.
    pub async fn increment(
        &self,
        txn: &TransactionId,
        collection: &str,
        id: &str,
        path: &str,
        delta: Value,
    ) -> Result<Value> {
        let doc = self
            .apply_atomic(
                txn,
                collection,
                id,
                &[AtomicOp::Increment {
                    path: path.to_string(),
                    delta,
                }],
            )
            .await?;
        Ok(doc.get(path)?.cloned().unwrap_or(Value::Null))
    }

    // =========================================================================
    // Auto-commit conveniences
    // =========================================================================

    /// Insert outside an explicit transaction: implicit begin + commit.
    pub async fn insert_one(
        &self,
        collection: &str,
        id: &str,
        data: BTreeMap<String, Value>,
    ) -> Result<Document> {
        let txn = self.begin()?;
        match self.insert(&txn, collection, id, data).await {
            Ok(doc) => {
                self.commit(&txn)?;
                Ok(doc)
            }
            Err(e) => {
                let _ = self.rollback(&txn);
                Err(e)
            }
        }
    }

    /// Direct read of the latest version, without a transaction.
    pub fn get_one(&self, collection: &str, id: &str) -> Result<Document> {
        self.collections.get(collection)?.get(id)
    }

    /// Snapshot of every live document in a collection.
    pub fn get_all(&self, collection: &str) -> Result<Vec<Document>> {
        Ok(self.collections.get(collection)?.get_all())
    }

    pub async fn update_one(
        &self,
        collection: &str,
        id: &str,
        data: BTreeMap<String, Value>,
    ) -> Result<Document> {
        let txn = self.begin()?;
        match self.update(&txn, collection, id, data).await {
            Ok(doc) => {
                self.commit(&txn)?;
                Ok(doc)
            }
            Err(e) => {
                let _ = self.rollback(&txn);
                Err(e)
            }
        }
    }

    pub async fn delete_one(&self, collection: &str, id: &str) -> Result<Document> {
        let txn = self.begin()?;
        match self.delete(&txn, collection, id).await {
            Ok(doc) => {
                self.commit(&txn)?;
                Ok(doc)
            }
            Err(e) => {
                let _ = self.rollback(&txn);
                Err(e)
            }
        }
    }

    pub async fn increment_one(
        &self,
        collection: &str,
        id: &str,
        path: &str,
        delta: Value,
    ) -> Result<Value> {
        let txn = self.begin()?;
        match self.increment(&txn, collection, id, path, delta).await {
            Ok(v) => {
                self.commit(&txn)?;
                Ok(v)
            }
            Err(e) => {
                let _ = self.rollback(&txn);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Indexes
    // =========================================================================

    /// Creates an index, backfilling from the collection's live documents.
    pub fn create_index(&self, def: IndexDefinition) -> Result<()> {
        let existing = match self.collections.get(&def.collection) {
            Ok(col) => col.get_all(),
            Err(_) => Vec::new(),
        };
        self.indexes.create_index(def, &existing).map(|_| ())
    }

    pub fn drop_index(&self, collection: &str, fields: &[String]) -> Result<()> {
        self.indexes.drop_index(collection, fields)
    }

    pub fn list_indexes(&self, collection: &str) -> Vec<IndexDefinition> {
        self.indexes.list(collection)
    }

    /// Point lookup through an index, materialising the documents.
    pub fn find_by_index(
        &self,
        collection: &str,
        fields: &[String],
        key: &IndexKey,
    ) -> Result<Vec<Document>> {
        let col = self.collections.get(collection)?;
        let ids = self.indexes.lookup(collection, fields, key);
        Ok(ids.iter().filter_map(|id| col.get(id).ok()).collect())
    }

    /// Inclusive index range scan, materialising the documents in key
    /// order. Under `Serializable` the predicate is promoted to an
    /// exclusive lock on the whole collection.
    pub async fn query_range(
        &self,
        txn: &TransactionId,
        collection: &str,
        fields: &[String],
        start: IndexKey,
        end: IndexKey,
    ) -> Result<Vec<Document>> {
        self.coordinator.ensure_operable(txn, collection)?;
        let col = self.collections.get(collection)?;
        let index = self
            .indexes
            .get_index(collection, fields)
            .ok_or_else(|| {
                DbError::not_found(format!("index {collection}.{}", fields.join(",")))
            })?;

        match self.coordinator.isolation(txn)? {
            IsolationLevel::Serializable => {
                self.lock(txn, collection, LockMode::Exclusive).await?;
            }
            IsolationLevel::RepeatableRead => {
                self.lock(txn, collection, LockMode::Shared).await?;
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {}
        }
        self.coordinator.record_read(txn, collection);

        let ids: Vec<String> = index.tree().range(start, end).map(|(_, id)| id).collect();
        Ok(ids.iter().filter_map(|id| col.get(id).ok()).collect())
    }

    // =========================================================================
    // TTL, maintenance, observability
    // =========================================================================

    /// Enables expiration for a collection and registers its current
    /// documents.
    pub fn configure_ttl(&self, collection: &str, policy: TtlPolicy) -> Result<()> {
        self.ttl.configure(collection, policy);
        if let Ok(col) = self.collections.get(collection) {
            for doc in col.get_all() {
                self.ttl.register(collection, &doc);
            }
        }
        Ok(())
    }

    /// Manual checkpoint capturing the currently active transactions.
    pub fn checkpoint(&self) -> Result<Lsn> {
        self.wal.create_checkpoint(&self.coordinator.active())
    }

    pub fn flush(&self) -> Result<()> {
        self.wal.flush()
    }

    /// Discards log archives made obsolete by the last checkpoint.
    pub fn truncate_wal(&self) -> Result<usize> {
        self.wal.truncate()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            wal: self.wal.stats(),
            locks: self.locks.stats(),
            ttl: self.ttl.stats(),
            gc: self.gc.stats(),
            active_transactions: self.coordinator.active_count(),
        }
    }

    /// Clean shutdown: stop background loops, checkpoint, flush, and
    /// persist the log header. A subsequent open recovers instantly.
    pub fn close(&self) -> Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.wal.create_checkpoint(&self.coordinator.active())?;
        self.wal.close()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn lock(&self, txn: &TransactionId, resource: &str, mode: LockMode) -> Result<()> {
        match self
            .locks
            .acquire(txn, resource, mode, Some(self.config.lock_timeout))
            .await
        {
            AcquireOutcome::Granted => Ok(()),
            AcquireOutcome::Timeout => Err(DbError::Timeout(format!(
                "{mode} lock on '{resource}' for {txn}"
            ))),
            AcquireOutcome::DeadlockDetected => Err(DbError::DeadlockDetected {
                victim: txn.clone(),
                resource: resource.to_string(),
            }),
            AcquireOutcome::Denied => Err(DbError::illegal_state(format!(
                "lock request on '{resource}' was denied"
            ))),
        }
    }

    /// Appends a record; an I/O failure is fatal to the transaction.
    fn append_or_fail(&self, txn: &TransactionId, record: LogRecord) -> Result<Lsn> {
        self.wal.append(record).inspect_err(|e| {
            warn!(txn = %txn, error = %e, "log append failed; failing transaction");
            self.coordinator.fail(txn);
        })
    }

    fn tombstone_for(
        &self,
        collection: &str,
        doc: &Document,
        txn: Option<TransactionId>,
    ) -> Tombstone {
        let mut ts = Tombstone::new(collection, &doc.id, doc.version);
        if let Some(disk) = &self.disk {
            ts = ts.with_file(disk.document_path(collection, &doc.id));
        }
        if let Some(txn) = txn {
            ts = ts.with_txn(txn);
        }
        ts
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Resource name for a document lock, matching the latch keying.
fn doc_resource(collection: &str, id: &str) -> String {
    format!("{collection}:{id}")
}

/// Applies one recovered record to the in-memory store and disk mirror.
fn apply_record(collections: &Collections, disk: Option<&DiskStore>, record: &LogRecord) {
    let Some(name) = record.collection.as_deref() else {
        return;
    };
    let Ok(collection) = collections.get_or_create(name) else {
        return;
    };
    match record.op {
        LogOp::Insert | LogOp::Update => {
            if let Some(after) = &record.after {
                // Upsert: replayed records win over hydrated state.
                if collection.exists(&after.id) {
                    let _ = collection.update(after.clone());
                } else {
                    let _ = collection.insert(after.clone());
                }
                if let Some(disk) = disk {
                    let _ = disk.save(name, after);
                }
            }
        }
        LogOp::Delete => {
            if let Some(id) = record.document_id.as_deref() {
                let _ = collection.delete(id);
                if let Some(disk) = disk {
                    let _ = disk.remove(name, id);
                }
            }
        }
        _ => {}
    }
}

/// Builds the TTL delete callback: a logged, auto-committed purge that
/// bypasses transactional locking (expiration is an engine-internal
/// mutation, not a client operation).
fn expired_document_purge(
    wal: Arc<WriteAheadLog>,
    collections: Arc<Collections>,
    indexes: Arc<IndexManager>,
    gc: Arc<GarbageCollector>,
    disk: Option<Arc<DiskStore>>,
) -> DeleteFn {
    let sequence = Arc::new(AtomicU64::new(0));
    Arc::new(move |collection_name, id| {
        let collection = collections.get(collection_name)?;
        let doc = collection.get(id)?;

        let txn = TransactionId::generate(
            common::now(),
            sequence.fetch_add(1, Ordering::SeqCst) + 1,
            rand::random::<u128>(),
        );
        wal.append_begin(txn.clone())?;
        wal.append_delete(txn.clone(), collection_name, doc.clone())?;
        collection.delete(id)?;
        indexes.on_remove(collection_name, &doc);

        let mut tombstone = Tombstone::new(collection_name, id, doc.version);
        if let Some(disk) = &disk {
            tombstone = tombstone.with_file(disk.document_path(collection_name, id));
        }
        gc.record(tombstone);
        wal.append_commit(txn)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn config(dir: &std::path::Path) -> EngineConfig {
        let mut config = EngineConfig::new(dir);
        config.lock_timeout = Duration::from_millis(200);
        config
    }

    fn data(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_insert_get_round_trip() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();

        let inserted = engine
            .insert_one("c", "d1", data(&[("n", Value::Int(1))]))
            .await
            .unwrap();
        assert_eq!(inserted.version, 1);

        let read = engine.get_one("c", "d1").unwrap();
        assert_eq!(read, inserted);
    }

    #[tokio::test]
    async fn test_rollback_undoes_everything() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        engine
            .insert_one("c", "keep", data(&[("n", Value::Int(0))]))
            .await
            .unwrap();

        let txn = engine.begin().unwrap();
        engine
            .insert(&txn, "c", "temp", data(&[("n", Value::Int(1))]))
            .await
            .unwrap();
        engine
            .update(&txn, "c", "keep", data(&[("n", Value::Int(9))]))
            .await
            .unwrap();
        engine.rollback(&txn).unwrap();

        assert!(engine.get_one("c", "temp").is_err());
        let keep = engine.get_one("c", "keep").unwrap();
        assert_eq!(keep.get("n").unwrap(), Some(&Value::Int(0)));
    }

    #[tokio::test]
    async fn test_write_conflict_times_out() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        engine
            .insert_one("c", "d1", data(&[("n", Value::Int(0))]))
            .await
            .unwrap();

        let t1 = engine.begin().unwrap();
        engine
            .update(&t1, "c", "d1", data(&[("n", Value::Int(1))]))
            .await
            .unwrap();

        let t2 = engine.begin().unwrap();
        let err = engine
            .update(&t2, "c", "d1", data(&[("n", Value::Int(2))]))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Timeout(_)));

        engine.commit(&t1).unwrap();
        engine.rollback(&t2).unwrap();
        let doc = engine.get_one("c", "d1").unwrap();
        assert_eq!(doc.get("n").unwrap(), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn test_serializable_read_blocks_writer() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        engine
            .insert_one("c", "d1", data(&[("n", Value::Int(0))]))
            .await
            .unwrap();

        let reader = engine
            .begin_with(TxnOptions::with_isolation(IsolationLevel::Serializable))
            .unwrap();
        engine.get(&reader, "c", "d1").await.unwrap();

        let writer = engine.begin().unwrap();
        let err = engine
            .update(&writer, "c", "d1", data(&[("n", Value::Int(1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Timeout(_)));

        engine.commit(&reader).unwrap();
        engine.rollback(&writer).unwrap();
    }

    #[tokio::test]
    async fn test_read_committed_releases_read_lock() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        engine
            .insert_one("c", "d1", data(&[("n", Value::Int(0))]))
            .await
            .unwrap();

        let reader = engine.begin().unwrap();
        engine.get(&reader, "c", "d1").await.unwrap();

        // The read lock is already gone; a writer proceeds immediately.
        let writer = engine.begin().unwrap();
        engine
            .update(&writer, "c", "d1", data(&[("n", Value::Int(1))]))
            .await
            .unwrap();
        engine.commit(&writer).unwrap();
        engine.commit(&reader).unwrap();
    }

    #[tokio::test]
    async fn test_crash_recovery_discards_in_flight() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(config(dir.path())).unwrap();
            engine
                .insert_one("c", "d1", data(&[("v", Value::Int(1))]))
                .await
                .unwrap();

            // In-flight update never commits; drop the engine mid-flight.
            let t2 = engine.begin().unwrap();
            engine
                .update(&t2, "c", "d1", data(&[("v", Value::Int(2))]))
                .await
                .unwrap();
            engine.flush().unwrap();
            // Simulated crash: no commit, no close.
        }

        let engine = Engine::open(config(dir.path())).unwrap();
        let report = engine.recovery_report();
        assert_eq!(report.committed_txns.len(), 1);
        assert_eq!(report.incomplete_txns.len(), 1);
        assert!(report.replayed_count >= 4);

        let doc = engine.get_one("c", "d1").unwrap();
        assert_eq!(doc.get("v").unwrap(), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn test_drop_collection_tombstones_documents() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        for i in 0..3 {
            engine
                .insert_one("c", &format!("d{i}"), data(&[("n", Value::Int(i))]))
                .await
                .unwrap();
        }

        assert_eq!(engine.drop_collection("c").unwrap(), 3);
        assert!(engine.get_one("c", "d0").is_err());
        assert_eq!(engine.stats().gc.passes, 0);
        assert_eq!(engine.gc.pending(), 3);
    }

    #[tokio::test]
    async fn test_rollback_of_delete_withdraws_tombstone() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        engine
            .insert_one("c", "d1", data(&[("n", Value::Int(1))]))
            .await
            .unwrap();

        let txn = engine.begin().unwrap();
        engine.delete(&txn, "c", "d1").await.unwrap();
        assert_eq!(engine.gc.pending(), 1);

        engine.rollback(&txn).unwrap();
        assert_eq!(engine.gc.pending(), 0);
        assert!(engine.get_one("c", "d1").is_ok());
    }

    #[tokio::test]
    async fn test_unique_index_blocks_second_insert() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path())).unwrap();
        engine
            .create_index(IndexDefinition::new("users", vec!["email".to_string()]).unique())
            .unwrap();

        engine
            .insert_one("users", "u1", data(&[("email", Value::from("x@y"))]))
            .await
            .unwrap();
        let err = engine
            .insert_one("users", "u2", data(&[("email", Value::from("x@y"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::AlreadyExists { key: Some(_), .. }));

        // The failed insert left nothing behind.
        assert!(engine.get_one("users", "u2").is_err());
    }

    #[tokio::test]
    async fn test_persistent_mode_hydrates_on_open() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.persistent = true;
        {
            let engine = Engine::open(cfg.clone()).unwrap();
            engine
                .insert_one("c", "d1", data(&[("n", Value::Int(7))]))
                .await
                .unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(cfg).unwrap();
        let doc = engine.get_one("c", "d1").unwrap();
        assert_eq!(doc.get("n").unwrap(), Some(&Value::Int(7)));
    }
}
