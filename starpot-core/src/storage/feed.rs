use super::{CollectionPath, DocPath, Document};
use crate::error::Result;
use std::collections::HashMap;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    Document(DocPath),
    Collection(CollectionPath),
}

impl WatchTarget {
    fn is_affected_by(&self, path: &DocPath) -> bool {
        match self {
            WatchTarget::Document(watched) => watched == path,
            WatchTarget::Collection(collection) => collection.contains(path),
        }
    }
}

/// Snapshot pushed to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Document {
        path: DocPath,
        document: Option<Document>,
    },
    /// Full membership of the collection after the commit.
    Collection {
        path: CollectionPath,
        documents: Vec<Document>,
    },
    /// The store could not serve this target; the subscription stays open.
    Error { target: WatchTarget, reason: String },
}

/// Push channel for one [`WatchTarget`]; dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    target: WatchTarget,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Next snapshot, or `None` once the store has gone away.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Next snapshot if one is already queued.
    pub fn try_next(&mut self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        tracing::debug!("Subscription {} closed", self.id);
    }
}

struct Watcher {
    id: u64,
    target: WatchTarget,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

/// Registry of live subscriptions, owned by a store backend.
///
/// Backends call [`ChangeFeed::publish`] while still holding the lock that
/// serialised the commit, so each subscriber sees snapshots in commit order.
#[derive(Default)]
pub(crate) struct ChangeFeed {
    next_id: u64,
    watchers: Vec<Watcher>,
}

impl ChangeFeed {
    pub fn register(&mut self, target: WatchTarget, initial: WatchEvent) -> Subscription {
        self.watchers.retain(|w| !w.tx.is_closed());

        let (tx, rx) = mpsc::unbounded_channel();
        // receiver is alive, cannot fail
        let _ = tx.send(initial);

        self.next_id += 1;
        let id = self.next_id;
        self.watchers.push(Watcher {
            id,
            target: target.clone(),
            tx,
        });
        tracing::debug!("Subscription {} opened on {:?}", id, target);

        Subscription { id, target, rx }
    }

    /// Pushes a fresh snapshot to every watcher whose target was touched.
    ///
    /// Runs after the commit is durable, so a snapshot that cannot be read
    /// is delivered as [`WatchEvent::Error`] to the affected watchers rather
    /// than failing the commit.
    pub fn publish<F>(&mut self, changed: &[DocPath], mut snapshot: F)
    where
        F: FnMut(&WatchTarget) -> Result<WatchEvent>,
    {
        let mut cache: HashMap<WatchTarget, WatchEvent> = HashMap::new();

        for watcher in &self.watchers {
            if !changed.iter().any(|path| watcher.target.is_affected_by(path)) {
                continue;
            }
            let event = match cache.get(&watcher.target) {
                Some(event) => event.clone(),
                None => {
                    let event = snapshot(&watcher.target).unwrap_or_else(|e| {
                        tracing::warn!("Snapshot of {:?} failed after commit: {}", watcher.target, e);
                        WatchEvent::Error {
                            target: watcher.target.clone(),
                            reason: e.to_string(),
                        }
                    });
                    cache.insert(watcher.target.clone(), event.clone());
                    event
                }
            };
            if watcher.tx.send(event).is_err() {
                tracing::debug!("Subscription {} dropped by receiver", watcher.id);
            }
        }

        self.watchers.retain(|w| !w.tx.is_closed());
    }

    pub fn broadcast_error(&mut self, reason: &str) {
        for watcher in &self.watchers {
            let _ = watcher.tx.send(WatchEvent::Error {
                target: watcher.target.clone(),
                reason: reason.to_string(),
            });
        }
        self.watchers.retain(|w| !w.tx.is_closed());
    }

    pub fn len(&self) -> usize {
        self.watchers.iter().filter(|w| !w.tx.is_closed()).count()
    }
}
