//! Couchlet Core Library
//!
//! The storage and conflict-resolution core of an embeddable document
//! database:
//! - Revision identifiers and per-document revision forests
//! - Bulk write processor (one transaction per batch)
//! - Change feed engine, one-shot and continuous
//! - Content-addressed attachment store
//! - Cross-instance change notifier
//! - SQLite (WAL mode) and in-memory storage backends

pub mod attachments;
pub mod bulk;
pub mod changes;
pub mod config;
pub mod database;
pub mod document;
pub mod error;
pub mod memory_store;
pub mod notifier;
pub mod rev_tree;
pub mod revision;
pub mod sqlite_store;
pub mod storage;

pub use bulk::{BulkDocsOptions, WriteOutcome};
pub use changes::{
    Change, ChangeCallback, ChangeFilter, ChangeFilterFn, ChangesFeed, ChangesOptions, ChangesResponse,
    ChangesStyle, FeedState,
};
pub use config::{DatabaseConfig, StorageConfig};
pub use database::{
    AllDocsOptions, AllDocsResponse, AllDocsRow, Database, DatabaseInfo, DocUpdate, GetOptions, RevsDiffEntry,
};
pub use error::{DbError, ErrorKind, Result};
pub use memory_store::MemoryBackend;
pub use notifier::ChangeNotifier;
pub use rev_tree::{MergeOutcome, RevisionForest, RevisionStatus};
pub use revision::RevisionId;
pub use sqlite_store::SqliteBackend;
pub use storage::{Backend, StorageError, StoreTxn};
