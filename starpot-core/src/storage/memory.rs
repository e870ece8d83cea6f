use super::batch::{plan, CommitReceipt, WriteBatch};
use super::feed::{ChangeFeed, Subscription, WatchEvent, WatchTarget};
use super::{CollectionPath, DocPath, Document, DocumentStore};
use crate::error::{Result, StarpotError};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Default)]
struct MemoryState {
    docs: BTreeMap<DocPath, Document>,
    version: u64,
    feed: ChangeFeed,
}

fn list_docs(docs: &BTreeMap<DocPath, Document>, collection: &CollectionPath) -> Vec<Document> {
    docs.values()
        .filter(|doc| collection.contains(&doc.path))
        .cloned()
        .collect()
}

fn snapshot(docs: &BTreeMap<DocPath, Document>, target: &WatchTarget) -> WatchEvent {
    match target {
        WatchTarget::Document(path) => WatchEvent::Document {
            path: path.clone(),
            document: docs.get(path).cloned(),
        },
        WatchTarget::Collection(path) => WatchEvent::Collection {
            path: path.clone(),
            documents: list_docs(docs, path),
        },
    }
}

/// In-process [`DocumentStore`] with optional simulated network conditions.
///
/// `latency` is split across the request and the response so concurrent
/// callers interleave between their read and their commit.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    latency: Option<Duration>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Simulates an outage: operations fail with `Unavailable` and every
    /// subscriber receives an error event.
    pub fn set_available(&self, available: bool) {
        let was_offline = self.offline.swap(!available, Ordering::SeqCst);
        if !available && !was_offline {
            tracing::warn!("Memory store going offline");
            self.state.lock().feed.broadcast_error("store offline");
        } else if available && was_offline {
            tracing::info!("Memory store back online");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().feed.len()
    }

    async fn network_hop(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency / 2).await;
        }
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StarpotError::unavailable("store offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>> {
        self.network_hop().await;
        self.ensure_online()?;
        let doc = self.state.lock().docs.get(path).cloned();
        self.network_hop().await;
        Ok(doc)
    }

    async fn list(&self, collection: &CollectionPath) -> Result<Vec<Document>> {
        self.network_hop().await;
        self.ensure_online()?;
        let docs = list_docs(&self.state.lock().docs, collection);
        self.network_hop().await;
        Ok(docs)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt> {
        self.network_hop().await;
        self.ensure_online()?;

        let receipt = {
            let mut state = self.state.lock();
            let version = state.version + 1;
            let now = Utc::now();

            let planned = plan(&batch, version, now, |path| Ok(state.docs.get(path).cloned()))?;

            state.version = version;
            let mut changed = Vec::with_capacity(planned.len());
            for write in planned {
                match write.document {
                    Some(doc) => {
                        state.docs.insert(write.path.clone(), doc);
                    }
                    None => {
                        state.docs.remove(&write.path);
                    }
                }
                changed.push(write.path);
            }

            let MemoryState { docs, feed, .. } = &mut *state;
            feed.publish(&changed, |target| Ok(snapshot(docs, target)));

            CommitReceipt {
                version,
                commit_time: now,
            }
        };

        self.network_hop().await;
        Ok(receipt)
    }

    async fn subscribe(&self, target: WatchTarget) -> Result<Subscription> {
        self.network_hop().await;
        self.ensure_online()?;
        let mut state = self.state.lock();
        let initial = snapshot(&state.docs, &target);
        Ok(state.feed.register(target, initial))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CreateOutcome, Fields, Precondition, WriteOp};
    use serde_json::json;
    use std::sync::Arc;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_create_if_absent_is_exclusive() {
        let store = MemoryStore::new();
        let path = DocPath::parse("rounds/current").unwrap();

        let first = store.create_if_absent(&path, fields(json!({ "n": 1 }))).await.unwrap();
        let second = store.create_if_absent(&path, fields(json!({ "n": 2 }))).await.unwrap();

        assert_eq!(first, CreateOutcome::Created);
        assert_eq!(second, CreateOutcome::AlreadyExists);
        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.get("n"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_concurrent_increments_all_apply() {
        let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(4)));
        let path = DocPath::parse("rounds/current").unwrap();

        let tasks = (0..20).map(|_| {
            let store = store.clone();
            let path = path.clone();
            async move { store.increment(&path, "count", 1).await }
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }

        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.get("count"), Some(&json!(20)));
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_no_trace() {
        let store = MemoryStore::new();
        let round = DocPath::parse("rounds/current").unwrap();
        let member = round.collection("members").unwrap().doc("alice").unwrap();
        store.set(&round, fields(json!({ "open": false })), false).await.unwrap();
        let before = store.get(&round).await.unwrap();

        let batch = WriteBatch::new()
            .push(WriteOp::create(member.clone(), Fields::new()))
            .push(
                WriteOp::update(round.clone(), Fields::new())
                    .require(Precondition::field_equals("open", true)),
            );
        let result = store.commit(batch).await;

        assert!(matches!(result, Err(StarpotError::PreconditionFailed { .. })));
        assert!(store.get(&member).await.unwrap().is_none());
        assert_eq!(store.get(&round).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_subscription_receives_snapshots_in_order() {
        let store = MemoryStore::new();
        let round = DocPath::parse("rounds/current").unwrap();
        let members = round.collection("members").unwrap();

        let mut sub = store
            .subscribe(WatchTarget::Collection(members.clone()))
            .await
            .unwrap();
        assert!(matches!(
            sub.next().await,
            Some(WatchEvent::Collection { documents, .. }) if documents.is_empty()
        ));

        for id in ["bob", "alice"] {
            store
                .create_if_absent(&members.doc(id).unwrap(), Fields::new())
                .await
                .unwrap();
        }
        store.increment(&round, "count", 1).await.unwrap();

        let Some(WatchEvent::Collection { documents, .. }) = sub.next().await else {
            panic!("expected collection snapshot");
        };
        assert_eq!(documents.len(), 1);

        let Some(WatchEvent::Collection { documents, .. }) = sub.next().await else {
            panic!("expected collection snapshot");
        };
        let ids: Vec<&str> = documents.iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["alice", "bob"]);
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn test_outage_fails_operations_and_notifies_watchers() {
        let store = MemoryStore::new();
        let round = DocPath::parse("rounds/current").unwrap();
        let mut sub = store
            .subscribe(WatchTarget::Document(round.clone()))
            .await
            .unwrap();
        sub.next().await;

        store.set_available(false);
        assert!(matches!(
            sub.next().await,
            Some(WatchEvent::Error { .. })
        ));
        let err = store.get(&round).await.unwrap_err();
        assert!(err.is_transient());

        store.set_available(true);
        assert!(store.get(&round).await.is_ok());
    }
}
