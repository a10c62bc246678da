// Transaction lifecycle: contexts, savepoints, isolation levels, and the
// coordinator driving begin/commit/rollback/abort.

pub mod context;
pub mod coordinator;

pub use context::{
    IsolationLevel, SavepointRecord, TransactionContext, TxnState, UndoEntry,
};
pub use coordinator::{TransactionCoordinator, TxnOptions};
