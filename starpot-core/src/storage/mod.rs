pub mod batch;
pub mod feed;
pub mod memory;
pub mod sqlite;

pub use batch::{CommitReceipt, FieldTransform, Precondition, WriteBatch, WriteKind, WriteOp};
pub use feed::{Subscription, WatchEvent, WatchTarget};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::{Result, StarpotError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type Fields = serde_json::Map<String, Value>;

fn split_segments(raw: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = raw.split('/').collect();
    if raw.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(StarpotError::InvalidPath(raw.to_string()));
    }
    Ok(segments)
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains('/') {
        return Err(StarpotError::InvalidPath(format!("invalid id '{}'", id)));
    }
    Ok(())
}

/// Address of a single document: an even number of segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocPath(String);

impl DocPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let segments = split_segments(raw)?;
        if segments.len() % 2 != 0 {
            return Err(StarpotError::InvalidPath(format!(
                "document path needs an even number of segments: {}",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn parent(&self) -> CollectionPath {
        match self.0.rsplit_once('/') {
            Some((parent, _)) => CollectionPath(parent.to_string()),
            None => CollectionPath(String::new()),
        }
    }

    pub fn collection(&self, name: &str) -> Result<CollectionPath> {
        validate_id(name)?;
        Ok(CollectionPath(format!("{}/{}", self.0, name)))
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of a collection: an odd number of segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let segments = split_segments(raw)?;
        if segments.len() % 2 != 1 {
            return Err(StarpotError::InvalidPath(format!(
                "collection path needs an odd number of segments: {}",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn doc(&self, id: &str) -> Result<DocPath> {
        validate_id(id)?;
        Ok(DocPath(format!("{}/{}", self.0, id)))
    }

    pub fn parent(&self) -> Option<DocPath> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| DocPath(parent.to_string()))
    }

    pub fn contains(&self, path: &DocPath) -> bool {
        path.parent() == *self
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub path: DocPath,
    pub fields: Fields,
    /// Store-wide commit sequence of the last write touching this document.
    pub version: u64,
    pub update_time: DateTime<Utc>,
}

impl Document {
    pub fn id(&self) -> &str {
        self.path.id()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Remote document store consumed by the lottery coordinators.
///
/// Every mutation funnels through [`DocumentStore::commit`], which applies a
/// [`WriteBatch`] all-or-nothing. The remaining write helpers are single-op
/// batches.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>>;

    /// Documents directly under `collection`, ordered by id.
    async fn list(&self, collection: &CollectionPath) -> Result<Vec<Document>>;

    async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt>;

    /// Yields the current snapshot of `target`, then one snapshot per commit
    /// that touches it.
    async fn subscribe(&self, target: WatchTarget) -> Result<Subscription>;

    async fn set(&self, path: &DocPath, fields: Fields, merge: bool) -> Result<CommitReceipt> {
        let op = if merge {
            WriteOp::merge(path.clone(), fields)
        } else {
            WriteOp::set(path.clone(), fields)
        };
        self.commit(WriteBatch::new().push(op)).await
    }

    async fn create_if_absent(&self, path: &DocPath, fields: Fields) -> Result<CreateOutcome> {
        let batch = WriteBatch::new().push(WriteOp::create(path.clone(), fields));
        match self.commit(batch).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(StarpotError::AlreadyExists { .. }) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    async fn increment(&self, path: &DocPath, field: &str, delta: i64) -> Result<CommitReceipt> {
        let op = WriteOp::merge(path.clone(), Fields::new())
            .transform(field, FieldTransform::Increment(delta));
        self.commit(WriteBatch::new().push(op)).await
    }

    async fn delete(&self, path: &DocPath) -> Result<CommitReceipt> {
        self.commit(WriteBatch::new().push(WriteOp::delete(path.clone())))
            .await
    }
}
