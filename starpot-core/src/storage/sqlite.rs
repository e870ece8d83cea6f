use super::batch::{plan, CommitReceipt, WriteBatch};
use super::feed::{ChangeFeed, Subscription, WatchEvent, WatchTarget};
use super::{CollectionPath, DocPath, Document, DocumentStore, Fields};
use crate::error::{Result, StarpotError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;

struct SqliteInner {
    conn: Connection,
    feed: ChangeFeed,
}

/// [`DocumentStore`] persisted in a single SQLite file.
///
/// Each commit runs in one SQLite transaction. Change notifications reach
/// subscribers of this handle only; other processes sharing the file see
/// the data but not the pushes.
pub struct SqliteStore {
    inner: Mutex<SqliteInner>,
}

type RawRow = (String, String, i64, i64);

fn decode_row((path, fields, version, update_time): RawRow) -> Result<Document> {
    let fields: Fields = serde_json::from_str(&fields)?;
    Ok(Document {
        path: DocPath::parse(&path)?,
        fields,
        version: version as u64,
        update_time: DateTime::from_timestamp_millis(update_time).unwrap_or_else(Utc::now),
    })
}

fn load_doc(conn: &Connection, path: &DocPath) -> Result<Option<Document>> {
    let row: Option<RawRow> = conn
        .query_row(
            "SELECT path, fields, version, update_time FROM documents WHERE path = ?1",
            params![path.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    row.map(decode_row).transpose()
}

fn list_docs(conn: &Connection, collection: &CollectionPath) -> Result<Vec<Document>> {
    let mut stmt = conn.prepare(
        "SELECT path, fields, version, update_time
         FROM documents WHERE parent = ?1 ORDER BY path",
    )?;
    let rows = stmt
        .query_map(params![collection.as_str()], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<std::result::Result<Vec<RawRow>, _>>()?;
    rows.into_iter().map(decode_row).collect()
}

fn snapshot(conn: &Connection, target: &WatchTarget) -> Result<WatchEvent> {
    Ok(match target {
        WatchTarget::Document(path) => WatchEvent::Document {
            path: path.clone(),
            document: load_doc(conn, path)?,
        },
        WatchTarget::Collection(path) => WatchEvent::Collection {
            path: path.clone(),
            documents: list_docs(conn, path)?,
        },
    })
}

impl SqliteStore {
    pub async fn open(db_path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StarpotError::internal(format!("Failed to create directory: {}", e)))?;
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            inner: Mutex::new(SqliteInner {
                conn,
                feed: ChangeFeed::default(),
            }),
        };

        store.init_schema().await?;
        tracing::debug!("Opened document store at {}", db_path.display());
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let inner = self.inner.lock().await;

        inner.conn.execute(
            "CREATE TABLE IF NOT EXISTS documents (
                path TEXT PRIMARY KEY,
                parent TEXT NOT NULL,
                fields TEXT NOT NULL,
                version INTEGER NOT NULL,
                update_time INTEGER NOT NULL
            )",
            [],
        )?;

        inner.conn.execute(
            "CREATE INDEX IF NOT EXISTS documents_parent ON documents(parent)",
            [],
        )?;

        // Store-wide commit sequence
        inner.conn.execute(
            "CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>> {
        let inner = self.inner.lock().await;
        load_doc(&inner.conn, path)
    }

    async fn list(&self, collection: &CollectionPath) -> Result<Vec<Document>> {
        let inner = self.inner.lock().await;
        list_docs(&inner.conn, collection)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt> {
        let mut inner = self.inner.lock().await;
        let SqliteInner { conn, feed } = &mut *inner;

        let tx = conn.transaction()?;
        let last: Option<i64> = tx
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let version = last.unwrap_or(0) as u64 + 1;
        let now = Utc::now();

        // dropping `tx` on error rolls the transaction back
        let planned = plan(&batch, version, now, |path| load_doc(&tx, path))?;

        for write in &planned {
            match &write.document {
                Some(doc) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO documents (path, parent, fields, version, update_time)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            doc.path.as_str(),
                            doc.path.parent().as_str(),
                            serde_json::to_string(&doc.fields)?,
                            version as i64,
                            now.timestamp_millis(),
                        ],
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM documents WHERE path = ?1",
                        params![write.path.as_str()],
                    )?;
                }
            }
        }

        tx.execute(
            "INSERT INTO store_meta (key, value) VALUES ('version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![version as i64],
        )?;
        tx.commit()?;

        // durable from here on; notification problems go to the watchers
        let changed: Vec<DocPath> = planned.into_iter().map(|w| w.path).collect();
        feed.publish(&changed, |target| snapshot(conn, target));

        Ok(CommitReceipt {
            version,
            commit_time: now,
        })
    }

    async fn subscribe(&self, target: WatchTarget) -> Result<Subscription> {
        let mut inner = self.inner.lock().await;
        let initial = snapshot(&inner.conn, &target)?;
        Ok(inner.feed.register(target, initial))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FieldTransform, Precondition, WriteOp};
    use serde_json::json;
    use tempfile::tempdir;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_documents_survive_reopen() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("starpot.db");
        let round = DocPath::parse("rounds/current").unwrap();

        {
            let store = SqliteStore::open(&db_path).await.unwrap();
            store
                .set(&round, fields(json!({ "generation": 0 })), false)
                .await
                .unwrap();
            store.increment(&round, "count", 2).await.unwrap();
        }

        let store = SqliteStore::open(&db_path).await.unwrap();
        let doc = store.get(&round).await.unwrap().unwrap();
        assert_eq!(doc.get("generation"), Some(&json!(0)));
        assert_eq!(doc.get("count"), Some(&json!(2)));
        assert_eq!(doc.version, 2);
    }

    #[tokio::test]
    async fn test_rejected_batch_rolls_back() {
        let temp_dir = tempdir().unwrap();
        let store = SqliteStore::open(&temp_dir.path().join("starpot.db"))
            .await
            .unwrap();
        let round = DocPath::parse("rounds/current").unwrap();
        let members = round.collection("members").unwrap();
        store
            .set(&round, fields(json!({ "winner": "bob" })), false)
            .await
            .unwrap();

        let batch = WriteBatch::new()
            .push(WriteOp::create(members.doc("alice").unwrap(), Fields::new()))
            .push(
                WriteOp::update(round.clone(), Fields::new())
                    .require(Precondition::field_equals("winner", serde_json::Value::Null))
                    .transform("count", FieldTransform::Increment(1)),
            );

        assert!(store.commit(batch).await.is_err());
        assert!(store.list(&members).await.unwrap().is_empty());
        let doc = store.get(&round).await.unwrap().unwrap();
        assert_eq!(doc.get("count"), None);
        assert_eq!(doc.version, 1);
    }

    #[tokio::test]
    async fn test_unreadable_snapshot_does_not_fail_commit() {
        let temp_dir = tempdir().unwrap();
        let store = SqliteStore::open(&temp_dir.path().join("starpot.db"))
            .await
            .unwrap();
        let members = CollectionPath::parse("rounds/current/members").unwrap();
        let mut sub = store
            .subscribe(WatchTarget::Collection(members.clone()))
            .await
            .unwrap();
        sub.next().await;

        // a row whose fields are not valid JSON breaks the collection listing
        store
            .inner
            .lock()
            .await
            .conn
            .execute(
                "INSERT INTO documents (path, parent, fields, version, update_time)
                 VALUES ('rounds/current/members/zed', 'rounds/current/members', '{ nope', 0, 0)",
                [],
            )
            .unwrap();

        let alice = members.doc("alice").unwrap();
        let receipt = store
            .commit(WriteBatch::new().push(WriteOp::create(alice.clone(), Fields::new())))
            .await
            .unwrap();
        assert_eq!(receipt.version, 1);
        assert!(store.get(&alice).await.unwrap().is_some());
        assert!(matches!(sub.next().await, Some(WatchEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_collection_subscription() {
        let temp_dir = tempdir().unwrap();
        let store = SqliteStore::open(&temp_dir.path().join("starpot.db"))
            .await
            .unwrap();
        let members = CollectionPath::parse("rounds/current/members").unwrap();

        let mut sub = store
            .subscribe(WatchTarget::Collection(members.clone()))
            .await
            .unwrap();
        sub.next().await;

        store
            .create_if_absent(&members.doc("carol").unwrap(), fields(json!({ "n": 1 })))
            .await
            .unwrap();
        store.delete(&members.doc("carol").unwrap()).await.unwrap();

        let Some(WatchEvent::Collection { documents, .. }) = sub.next().await else {
            panic!("expected collection snapshot");
        };
        assert_eq!(documents.len(), 1);
        let Some(WatchEvent::Collection { documents, .. }) = sub.next().await else {
            panic!("expected collection snapshot");
        };
        assert!(documents.is_empty());
    }
}
