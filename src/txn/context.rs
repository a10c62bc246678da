// Transaction context and state machine.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{self, Lsn, TransactionId};
use crate::document::Document;
use crate::error::{DbError, Result};

/// Isolation level, driving the lock policy of reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// No read locks; reads see the latest version directly.
    ReadUncommitted,
    /// Shared lock held only for the duration of the read.
    ReadCommitted,
    /// Shared locks held to commit; reads recorded in the read set.
    RepeatableRead,
    /// Exclusive locks on reads and writes; range predicates promoted to
    /// full-resource locks.
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

/// Lifecycle state.
///
/// ```text
/// Active → Preparing  → Committed
/// Active → RollingBack → RolledBack
/// Active → Aborted
/// Active → Failed        (and Preparing → Failed)
/// ```
///
/// Terminal states are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    Active,
    Preparing,
    Committed,
    RollingBack,
    RolledBack,
    Aborted,
    Failed,
}

impl TxnState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxnState::Committed | TxnState::RolledBack | TxnState::Aborted | TxnState::Failed
        )
    }

    /// Legal transitions of the state machine.
    pub fn can_transition_to(self, next: TxnState) -> bool {
        use TxnState::*;
        matches!(
            (self, next),
            (Active, Preparing)
                | (Active, RollingBack)
                | (Active, Aborted)
                | (Active, Failed)
                | (Preparing, Committed)
                | (Preparing, Failed)
                | (RollingBack, RolledBack)
                | (RollingBack, Failed)
        )
    }
}

/// A named point within a transaction for partial rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavepointRecord {
    pub name: String,
    /// Log position at creation; operations with a strictly greater LSN are
    /// undone by a rollback to this savepoint.
    pub lsn: Lsn,
    pub operation_count: u64,
    pub created_at: DateTime<Utc>,
}

/// One logged operation's undo information, kept in memory for rollback.
#[derive(Debug, Clone)]
pub struct UndoEntry {
    pub lsn: Lsn,
    pub collection: String,
    pub document_id: String,
    /// Pre-image; None when the operation was an insert.
    pub before: Option<Document>,
    /// Post-image; None when the operation was a delete.
    pub after: Option<Document>,
}

/// Live state of one transaction.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    pub id: TransactionId,
    pub state: TxnState,
    pub isolation: IsolationLevel,
    pub started_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub operation_count: u64,
    pub read_set: HashSet<String>,
    pub write_set: HashSet<String>,
    pub savepoints: Vec<SavepointRecord>,
    pub undo_log: Vec<UndoEntry>,
}

impl TransactionContext {
    pub fn new(id: TransactionId, isolation: IsolationLevel, timeout: Option<Duration>) -> Self {
        let started_at = common::now();
        let expires_at = timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .and_then(|t| started_at.checked_add_signed(t));
        TransactionContext {
            id,
            state: TxnState::Active,
            isolation,
            started_at,
            expires_at,
            operation_count: 0,
            read_set: HashSet::new(),
            write_set: HashSet::new(),
            savepoints: Vec::new(),
            undo_log: Vec::new(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    /// Fails with `IllegalState` unless the transaction accepts operations.
    pub fn ensure_active(&self) -> Result<()> {
        if self.state == TxnState::Active {
            Ok(())
        } else {
            Err(DbError::illegal_state(format!(
                "transaction {} is {:?}, not Active",
                self.id, self.state
            )))
        }
    }

    /// Validated state transition.
    pub fn transition(&mut self, next: TxnState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(DbError::illegal_state(format!(
                "transaction {} cannot go {:?} → {next:?}",
                self.id, self.state
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Registers a savepoint. Re-using a name moves it.
    pub fn add_savepoint(&mut self, name: &str, lsn: Lsn) {
        self.savepoints.retain(|sp| sp.name != name);
        self.savepoints.push(SavepointRecord {
            name: name.to_string(),
            lsn,
            operation_count: self.operation_count,
            created_at: common::now(),
        });
    }

    pub fn savepoint(&self, name: &str) -> Option<&SavepointRecord> {
        self.savepoints.iter().find(|sp| sp.name == name)
    }
}
