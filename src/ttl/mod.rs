// Document expiration driven by per-collection min-heaps.
//
// Each configured collection keeps a heap ordered by expiration time plus a
// map of each document's current expiration. Re-registering a document
// pushes a fresh heap entry without hunting down the stale one; the cleanup
// loop recognises stale entries by comparing against the map and skips
// them.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common;
use crate::document::{Document, Value};
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};

/// Callback invoked to delete an expired document.
pub type DeleteFn = Arc<dyn Fn(&str, &str) -> Result<()> + Send + Sync>;

/// Per-collection expiration policy.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    /// Field holding the expiration timestamp.
    pub field: String,
    /// Applied from creation time when the field is absent.
    pub default_ttl: Option<Duration>,
}

struct TtlState {
    policy: TtlPolicy,
    /// (expiration, document ID), min-ordered via Reverse.
    heap: BinaryHeap<Reverse<(DateTime<Utc>, String)>>,
    /// Current expiration per document; the authority for staleness.
    current: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Default, Clone)]
pub struct TtlStats {
    pub expired_documents: u64,
    pub stale_entries_skipped: u64,
    pub delete_failures: u64,
}

/// Expiration service over all configured collections.
pub struct TtlService {
    collections: DashMap<String, Mutex<TtlState>>,
    cleanup_interval: Duration,
    delete: DeleteFn,
    events: EventBus,
    stats: Mutex<TtlStats>,
}

impl TtlService {
    pub fn new(cleanup_interval: Duration, delete: DeleteFn, events: EventBus) -> Self {
        TtlService {
            collections: DashMap::new(),
            cleanup_interval,
            delete,
            events,
            stats: Mutex::new(TtlStats::default()),
        }
    }

    /// Enables expiration for a collection.
    pub fn configure(&self, collection: &str, policy: TtlPolicy) {
        self.collections.insert(
            collection.to_string(),
            Mutex::new(TtlState {
                policy,
                heap: BinaryHeap::new(),
                current: HashMap::new(),
            }),
        );
    }

    pub fn is_configured(&self, collection: &str) -> bool {
        self.collections.contains_key(collection)
    }

    /// Registers (or re-registers) a document's expiration from its current
    /// state. A previous heap entry is left in place and expires as stale.
    pub fn register(&self, collection: &str, doc: &Document) {
        let Some(state) = self.collections.get(collection) else {
            return;
        };
        let mut state = state.lock();

        let expires_at = match doc.get(&state.policy.field).ok().flatten() {
            Some(Value::Timestamp(ts)) => Some(*ts),
            Some(Value::Int(ms)) => Some(common::from_epoch_millis((*ms).max(0) as u64)),
            Some(other) => {
                warn!(
                    collection,
                    id = %doc.id,
                    field = %state.policy.field,
                    ty = other.type_name(),
                    "TTL field is not a timestamp; document will not expire"
                );
                None
            }
            None => state
                .policy
                .default_ttl
                .and_then(|ttl| doc.created_at.checked_add_signed(chrono::Duration::from_std(ttl).ok()?)),
        };

        match expires_at {
            Some(at) => {
                state.current.insert(doc.id.clone(), at);
                state.heap.push(Reverse((at, doc.id.clone())));
            }
            None => {
                state.current.remove(&doc.id);
            }
        }
    }

    /// Forgets a document, e.g. after an explicit delete.
    pub fn unregister(&self, collection: &str, id: &str) {
        if let Some(state) = self.collections.get(collection) {
            state.lock().current.remove(id);
        }
    }

    /// One cleanup pass over every configured collection. Returns the total
    /// number of documents expired.
    pub fn run_cleanup(&self) -> usize {
        let mut total = 0;
        let names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        for collection in names {
            total += self.cleanup_collection(&collection);
        }
        total
    }

    fn cleanup_collection(&self, collection: &str) -> usize {
        let now = common::now();
        let mut expired_ids = Vec::new();

        if let Some(state) = self.collections.get(collection) {
            let mut state = state.lock();
            loop {
                // The heap is time-ordered: a future top ends the pass.
                let Some(Reverse((at, id))) = state.heap.peek().cloned() else {
                    break;
                };
                if at > now {
                    break;
                }
                state.heap.pop();

                match state.current.get(&id) {
                    // Stale entry: the document was re-registered with a
                    // different expiration since this entry was pushed.
                    Some(current) if *current != at => {
                        self.stats.lock().stale_entries_skipped += 1;
                        continue;
                    }
                    None => {
                        self.stats.lock().stale_entries_skipped += 1;
                        continue;
                    }
                    Some(_) => {}
                }
                state.current.remove(&id);
                expired_ids.push(id);
            }
        }

        if expired_ids.is_empty() {
            return 0;
        }

        let mut deleted = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            match (self.delete)(collection, &id) {
                Ok(()) => deleted.push(id),
                Err(e) => {
                    self.stats.lock().delete_failures += 1;
                    warn!(collection, id = %id, error = %e, "TTL delete failed");
                }
            }
        }

        if !deleted.is_empty() {
            self.stats.lock().expired_documents += deleted.len() as u64;
            debug!(collection, count = deleted.len(), "documents expired");
            self.events.publish(EngineEvent::DocumentsExpired {
                collection: collection.to_string(),
                ids: deleted.clone(),
            });
        }
        deleted.len()
    }

    /// Spawns the periodic cleanup loop.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                service.run_cleanup();
            }
        })
    }

    pub fn stats(&self) -> TtlStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::DbError;

    fn doc_with_expiry(id: &str, at: DateTime<Utc>) -> Document {
        let mut data = BTreeMap::new();
        data.insert("expireAt".to_string(), Value::Timestamp(at));
        Document::new(id, data).unwrap()
    }

    fn service(deleted: Arc<Mutex<Vec<String>>>) -> TtlService {
        let delete: DeleteFn = Arc::new(move |_col, id| {
            deleted.lock().push(id.to_string());
            Ok(())
        });
        let svc = TtlService::new(Duration::from_millis(100), delete, EventBus::new());
        svc.configure(
            "c",
            TtlPolicy {
                field: "expireAt".to_string(),
                default_ttl: None,
            },
        );
        svc
    }

    #[test]
    fn test_expired_document_is_deleted() {
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let svc = service(Arc::clone(&deleted));

        svc.register("c", &doc_with_expiry("d1", common::now() - chrono::Duration::seconds(1)));
        svc.register("c", &doc_with_expiry("d2", common::now() + chrono::Duration::seconds(60)));

        assert_eq!(svc.run_cleanup(), 1);
        assert_eq!(*deleted.lock(), vec!["d1".to_string()]);
        // The future document is untouched.
        assert_eq!(svc.run_cleanup(), 0);
    }

    #[test]
    fn test_reregistration_leaves_stale_entry() {
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let svc = service(Arc::clone(&deleted));

        let past = common::now() - chrono::Duration::seconds(1);
        let future = common::now() + chrono::Duration::seconds(60);
        svc.register("c", &doc_with_expiry("d1", past));
        // Update pushed a fresh entry; the old one is now stale.
        svc.register("c", &doc_with_expiry("d1", future));

        assert_eq!(svc.run_cleanup(), 0);
        assert!(deleted.lock().is_empty());
        assert_eq!(svc.stats().stale_entries_skipped, 1);
    }

    #[test]
    fn test_unregister_prevents_expiry() {
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let svc = service(Arc::clone(&deleted));

        svc.register("c", &doc_with_expiry("d1", common::now() - chrono::Duration::seconds(1)));
        svc.unregister("c", "d1");

        assert_eq!(svc.run_cleanup(), 0);
        assert!(deleted.lock().is_empty());
    }

    #[test]
    fn test_default_ttl_applies_when_field_absent() {
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let deleted2 = Arc::clone(&deleted);
        let delete: DeleteFn = Arc::new(move |_col, id| {
            deleted2.lock().push(id.to_string());
            Ok(())
        });
        let svc = TtlService::new(Duration::from_millis(100), delete, EventBus::new());
        svc.configure(
            "c",
            TtlPolicy {
                field: "expireAt".to_string(),
                default_ttl: Some(Duration::ZERO),
            },
        );

        let doc = Document::new("d1", BTreeMap::new()).unwrap();
        svc.register("c", &doc);
        assert_eq!(svc.run_cleanup(), 1);
        assert_eq!(*deleted.lock(), vec!["d1".to_string()]);
    }

    #[test]
    fn test_delete_failure_counts_and_continues() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let delete: DeleteFn = Arc::new(move |_col, _id| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Err(DbError::not_found("gone"))
        });
        let svc = TtlService::new(Duration::from_millis(100), delete, EventBus::new());
        svc.configure(
            "c",
            TtlPolicy {
                field: "expireAt".to_string(),
                default_ttl: None,
            },
        );

        let past = common::now() - chrono::Duration::seconds(1);
        svc.register("c", &doc_with_expiry("d1", past));
        svc.register("c", &doc_with_expiry("d2", past));

        assert_eq!(svc.run_cleanup(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(svc.stats().delete_failures, 2);
    }

    #[tokio::test]
    async fn test_expiration_event_lists_ids() {
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let deleted2 = Arc::clone(&deleted);
        let delete: DeleteFn = Arc::new(move |_c, id| {
            deleted2.lock().push(id.to_string());
            Ok(())
        });
        let svc = TtlService::new(Duration::from_millis(100), delete, events);
        svc.configure(
            "c",
            TtlPolicy {
                field: "expireAt".to_string(),
                default_ttl: None,
            },
        );
        svc.register("c", &doc_with_expiry("d1", common::now() - chrono::Duration::seconds(1)));
        svc.run_cleanup();

        match rx.recv().await.unwrap() {
            EngineEvent::DocumentsExpired { collection, ids } => {
                assert_eq!(collection, "c");
                assert_eq!(ids, vec!["d1".to_string()]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
