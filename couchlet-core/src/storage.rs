//! Storage abstraction layer
//!
//! The database needs very little from its table engine: atomic multi-table
//! transactions, unique-key lookup, ordered range scans, insert/update and an
//! auto-incrementing key for the sequence log. `Backend` and `StoreTxn` are
//! that contract; `SqliteBackend` and `MemoryBackend` implement it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::rev_tree::RevisionForest;
use crate::revision::RevisionId;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Per-id record of the document store
///
/// Created by the first accepted write for an id and never removed, not even
/// when the winning leaf is a tombstone. Local documents keep `seq` and
/// `winning_seq` at zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub id: String,
    pub forest: RevisionForest,
    /// Most recent sequence written for this document
    pub seq: u64,
    /// Sequence holding the body of the winning revision
    pub winning_seq: u64,
    /// Body of a `_local/` document, which never enters the sequence log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_body: Option<serde_json::Value>,
}

/// One immutable entry of the sequence log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub seq: u64,
    pub doc_id: String,
    pub rev: RevisionId,
    pub body: serde_json::Value,
}

/// Content-addressed attachment blob with its owning revisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub digest: String,
    pub body: Bytes,
    /// `"{doc_id}@{rev}"` references
    pub owners: BTreeSet<String>,
}

/// Inclusive id range for ordered document scans
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdRange {
    pub start: Option<String>,
    pub end: Option<String>,
    pub descending: bool,
}

/// Whether a transaction may write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    Read,
    Write,
}

/// One open transaction over all tables of a database
///
/// Dropping a transaction without calling `commit` rolls it back.
pub trait StoreTxn {
    fn get_document(&mut self, id: &str) -> Result<Option<DocumentMetadata>>;

    fn put_document(&mut self, doc: &DocumentMetadata) -> Result<()>;

    /// Documents ordered by id
    fn scan_documents_by_id(&mut self, range: &IdRange) -> Result<Vec<DocumentMetadata>>;

    /// Documents whose most recent sequence is greater than `since`,
    /// ordered by that sequence
    fn scan_documents_by_seq(&mut self, since: u64, descending: bool) -> Result<Vec<DocumentMetadata>>;

    /// Append a body to the sequence log, returning its fresh sequence
    fn append_sequence(&mut self, doc_id: &str, rev: &RevisionId, body: &serde_json::Value) -> Result<u64>;

    fn get_sequence(&mut self, seq: u64) -> Result<Option<SequenceRecord>>;

    fn get_revision(&mut self, doc_id: &str, rev: &RevisionId) -> Result<Option<SequenceRecord>>;

    fn get_attachment(&mut self, digest: &str) -> Result<Option<AttachmentRecord>>;

    fn put_attachment(&mut self, record: &AttachmentRecord) -> Result<()>;

    fn update_seq(&mut self) -> Result<u64>;

    fn set_update_seq(&mut self, seq: u64) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;
}

/// A table engine holding one database
pub trait Backend: Send + Sync {
    /// Short engine name reported by `info()`
    fn kind(&self) -> &'static str;

    /// Persistent identity of this database's storage
    fn instance_id(&self) -> &str;

    /// Creation time (Unix seconds)
    fn created_at(&self) -> i64;

    fn begin(&self, mode: TxnMode) -> Result<Box<dyn StoreTxn + '_>>;

    /// Drop every table
    fn destroy(&self) -> Result<()>;
}
