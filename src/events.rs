//! Engine event taxonomy and publication.
//!
//! Components publish to a broadcast channel; subscribers are optional and
//! publication with zero subscribers is a no-op. Events carry enough context
//! for observers (audit collaborators, metrics, tests) to act without
//! querying the engine back.

use std::path::PathBuf;

use tokio::sync::broadcast;

use crate::common::{Lsn, TransactionId};

/// Default buffered events per subscriber.
const DEFAULT_CAPACITY: usize = 1024;

/// Side-effect notifications emitted by the core.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TransactionCommitted {
        txn_id: TransactionId,
    },
    TransactionRolledBack {
        txn_id: TransactionId,
    },
    TransactionAborted {
        txn_id: TransactionId,
        reason: String,
    },
    DeadlockDetected {
        victim: TransactionId,
        participants: Vec<TransactionId>,
    },
    CheckpointCreated {
        lsn: Lsn,
        active_transactions: usize,
    },
    LogRotated {
        archive: PathBuf,
        last_lsn: Lsn,
    },
    DocumentsExpired {
        collection: String,
        ids: Vec<String>,
    },
}

/// Fan-out publisher for [`EngineEvent`].
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Publishes an event. Lagging or absent subscribers never fail the
    /// publishing component.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::TransactionCommitted {
            txn_id: TransactionId::from_string("txn_x"),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::DocumentsExpired {
            collection: "c".into(),
            ids: vec!["d1".into()],
        });

        match rx.recv().await.unwrap() {
            EngineEvent::DocumentsExpired { collection, ids } => {
                assert_eq!(collection, "c");
                assert_eq!(ids, vec!["d1".to_string()]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
