// DocuDB - embedded transactional document storage engine.
//
// Core subsystems:
//
// | Module | Responsibility |
// |--------|----------------|
// | [`wal`] | Append-only log, rotation, checkpoints, crash recovery |
// | [`lock`] | Shared/exclusive locks, FIFO fairness, deadlock detection |
// | [`txn`] | Transaction lifecycle, savepoints, isolation, timeouts |
// | [`document`] | Value model, collections, atomic field operators |
// | [`index`] | Arena B+ tree, unique/sparse/compound indexes |
// | [`ttl`] | Heap-driven document expiration |
// | [`gc`] | Tombstone retention and deferred reclamation |
// | [`engine`] | Configuration and the facade tying it all together |
//
// # Quick start
//
// ```rust,ignore
// use docudb::{Engine, EngineConfig, Value};
//
// let engine = Engine::open(EngineConfig::new("./data"))?;
// let txn = engine.begin()?;
// engine.insert(&txn, "users", "u1", data).await?;
// engine.commit(&txn)?;
// ```

pub mod common;
pub mod document;
pub mod engine;
pub mod error;
pub mod events;
pub mod gc;
pub mod index;
pub mod lock;
pub mod store;
pub mod ttl;
pub mod txn;
pub mod wal;

pub use common::{Lsn, TransactionId};
pub use document::{AtomicOp, Document, Value};
pub use engine::{Engine, EngineConfig, EngineStats};
pub use error::{DbError, Result};
pub use events::{EngineEvent, EventBus};
pub use index::{IndexDefinition, IndexKey};
pub use lock::{AcquireOutcome, LockMode};
pub use ttl::TtlPolicy;
pub use txn::{IsolationLevel, TxnOptions, TxnState};
pub use wal::{RecoveryReport, SyncMode};
