//! Starpot core - document store and identity primitives
//!
//! This library provides the storage surface the lottery coordinators are
//! written against: a document store with all-or-nothing write batches,
//! conditional writes, atomic increments and a push-based change feed, plus
//! the bookkeeping amount type and anonymous identities.

pub mod error;
pub mod identity;
pub mod storage;
pub mod types;

pub use error::{Result, StarpotError};
pub use identity::{AnonymousIdentity, IdentityProvider, StaticIdentity};
pub use storage::{
    CollectionPath, CommitReceipt, CreateOutcome, DocPath, Document, DocumentStore, FieldTransform,
    Fields, MemoryStore, Precondition, SqliteStore, Subscription, WatchEvent, WatchTarget,
    WriteBatch, WriteOp,
};
pub use types::Amount;
