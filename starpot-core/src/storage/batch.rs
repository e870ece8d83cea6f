use super::{DocPath, Document, Fields};
use crate::error::{Result, StarpotError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Value computed by the store at commit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldTransform {
    /// Atomic integer add; an absent field counts as zero.
    Increment(i64),
    ServerTimestamp,
}

impl FieldTransform {
    fn apply(
        &self,
        path: &DocPath,
        field: &str,
        existing: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<Value> {
        match self {
            FieldTransform::Increment(delta) => {
                let base = match existing {
                    None | Some(Value::Null) => 0,
                    Some(value) => value.as_i64().ok_or_else(|| {
                        StarpotError::invalid_field(path.as_str(), field, "not an integer")
                    })?,
                };
                let sum = base.checked_add(*delta).ok_or_else(|| {
                    StarpotError::invalid_field(path.as_str(), field, "increment overflow")
                })?;
                Ok(Value::from(sum))
            }
            FieldTransform::ServerTimestamp => Ok(Value::String(
                now.to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
        }
    }
}

/// Condition on the pre-write state of the target document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Precondition {
    Exists,
    Missing,
    /// A missing field compares as `null`.
    FieldEquals(String, Value),
    FieldNotEquals(String, Value),
}

impl Precondition {
    pub fn field_equals(field: &str, value: impl Into<Value>) -> Self {
        Self::FieldEquals(field.to_string(), value.into())
    }

    pub fn field_not_equals(field: &str, value: impl Into<Value>) -> Self {
        Self::FieldNotEquals(field.to_string(), value.into())
    }

    fn check(&self, path: &DocPath, current: Option<&Document>) -> Result<()> {
        let existing = || {
            current.ok_or_else(|| StarpotError::precondition(path.as_str(), "document does not exist"))
        };

        match self {
            Precondition::Exists => existing().map(|_| ()),
            Precondition::Missing => match current {
                Some(_) => Err(StarpotError::precondition(
                    path.as_str(),
                    "document already exists",
                )),
                None => Ok(()),
            },
            Precondition::FieldEquals(field, expected) => {
                let actual = existing()?.get(field).unwrap_or(&Value::Null);
                if actual != expected {
                    return Err(StarpotError::precondition(
                        path.as_str(),
                        format!("{} is {} (expected {})", field, actual, expected),
                    ));
                }
                Ok(())
            }
            Precondition::FieldNotEquals(field, rejected) => {
                let actual = existing()?.get(field).unwrap_or(&Value::Null);
                if actual == rejected {
                    return Err(StarpotError::precondition(
                        path.as_str(),
                        format!("{} must not be {}", field, rejected),
                    ));
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    /// Fails with `AlreadyExists` when the document is present.
    Create,
    /// Replaces the whole document.
    Set,
    /// Overlays fields onto the existing document, creating it if needed.
    Merge,
    /// Overlays fields; fails with `NotFound` when the document is absent.
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOp {
    pub kind: WriteKind,
    pub path: DocPath,
    pub fields: Fields,
    pub transforms: Vec<(String, FieldTransform)>,
    pub preconditions: Vec<Precondition>,
}

impl WriteOp {
    fn new(kind: WriteKind, path: DocPath, fields: Fields) -> Self {
        Self {
            kind,
            path,
            fields,
            transforms: Vec::new(),
            preconditions: Vec::new(),
        }
    }

    pub fn create(path: DocPath, fields: Fields) -> Self {
        Self::new(WriteKind::Create, path, fields)
    }

    pub fn set(path: DocPath, fields: Fields) -> Self {
        Self::new(WriteKind::Set, path, fields)
    }

    pub fn merge(path: DocPath, fields: Fields) -> Self {
        Self::new(WriteKind::Merge, path, fields)
    }

    pub fn update(path: DocPath, fields: Fields) -> Self {
        Self::new(WriteKind::Update, path, fields)
    }

    pub fn delete(path: DocPath) -> Self {
        Self::new(WriteKind::Delete, path, Fields::new())
    }

    pub fn transform(mut self, field: &str, transform: FieldTransform) -> Self {
        self.transforms.push((field.to_string(), transform));
        self
    }

    pub fn require(mut self, precondition: Precondition) -> Self {
        self.preconditions.push(precondition);
        self
    }

    fn apply(
        &self,
        current: Option<Document>,
        version: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<Document>> {
        let mut fields = match (self.kind, current) {
            (WriteKind::Delete, _) => return Ok(None),
            (WriteKind::Create, Some(_)) => {
                return Err(StarpotError::AlreadyExists {
                    path: self.path.to_string(),
                })
            }
            (WriteKind::Update, None) => {
                return Err(StarpotError::NotFound {
                    path: self.path.to_string(),
                })
            }
            (WriteKind::Create, None) | (WriteKind::Set, _) => Fields::new(),
            (WriteKind::Merge, current) | (WriteKind::Update, current) => {
                current.map(|doc| doc.fields).unwrap_or_default()
            }
        };

        for (key, value) in &self.fields {
            fields.insert(key.clone(), value.clone());
        }
        for (field, transform) in &self.transforms {
            let value = transform.apply(&self.path, field, fields.get(field), now)?;
            fields.insert(field.clone(), value);
        }

        Ok(Some(Document {
            path: self.path.clone(),
            fields,
            version,
            update_time: now,
        }))
    }
}

/// Ordered list of writes committed as one indivisible unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, op: WriteOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub version: u64,
    pub commit_time: DateTime<Utc>,
}

/// Post-commit state of one document touched by a batch.
#[derive(Debug, Clone)]
pub(crate) struct PlannedWrite {
    pub path: DocPath,
    /// `None` when the document ends up deleted.
    pub document: Option<Document>,
}

/// Validates `batch` op by op and computes the resulting documents.
///
/// Each op sees the effects of the ops before it in the same batch. Nothing
/// is written here; on error the caller discards the plan, so a failed batch
/// has no observable effect.
pub(crate) fn plan<F>(
    batch: &WriteBatch,
    version: u64,
    now: DateTime<Utc>,
    mut lookup: F,
) -> Result<Vec<PlannedWrite>>
where
    F: FnMut(&DocPath) -> Result<Option<Document>>,
{
    if batch.is_empty() {
        return Err(StarpotError::internal("cannot commit an empty batch"));
    }

    let mut overlay: HashMap<DocPath, Option<Document>> = HashMap::new();
    let mut order: Vec<DocPath> = Vec::new();

    for op in batch.ops() {
        let current = match overlay.get(&op.path) {
            Some(doc) => doc.clone(),
            None => lookup(&op.path)?,
        };

        for precondition in &op.preconditions {
            precondition.check(&op.path, current.as_ref())?;
        }

        let next = op.apply(current, version, now)?;
        if !overlay.contains_key(&op.path) {
            order.push(op.path.clone());
        }
        overlay.insert(op.path.clone(), next);
    }

    Ok(order
        .into_iter()
        .map(|path| {
            let document = overlay.remove(&path).flatten();
            PlannedWrite { path, document }
        })
        .collect())
}
