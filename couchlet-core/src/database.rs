//! Public database API
//!
//! `Database` ties one storage backend to the bulk write processor, the
//! change feed engine and the notifier. Writes within one instance are
//! serialized by an async gate; instances sharing storage coordinate only
//! through the notifier and the commutativity of revision merges.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::attachments::{encode_transport, AttachmentStore};
use crate::bulk::{BatchResult, BulkDocsOptions, BulkWriter, WriteOutcome};
use crate::changes::{
    self, ChangeCallback, ChangeFilter, ChangeFilterFn, ChangesFeed, ChangesOptions, ChangesResponse,
    FeedControl,
};
use crate::config::{DatabaseConfig, StorageConfig};
use crate::document::{is_local, validate_id, DocumentEdit, EditAttachment};
use crate::error::{DbError, Result};
use crate::memory_store::MemoryBackend;
use crate::notifier::ChangeNotifier;
use crate::revision::RevisionId;
use crate::rev_tree::RevisionStatus;
use crate::sqlite_store::SqliteBackend;
use crate::storage::{AttachmentRecord, Backend, DocumentMetadata, IdRange, StoreTxn, TxnMode};

/// Result of `info()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseInfo {
    pub db_name: String,
    /// Documents whose winner is not a tombstone
    pub doc_count: u64,
    pub update_seq: u64,
    pub instance_id: String,
    pub backend: String,
}

/// Successful single-document write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocUpdate {
    pub id: String,
    pub rev: RevisionId,
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Read this revision instead of the winner
    pub rev: Option<RevisionId>,
    /// Add `_revisions`
    pub revs: bool,
    /// Add `_revs_info`
    pub revs_info: bool,
    /// Add `_conflicts`
    pub conflicts: bool,
    /// Inline attachment bodies instead of stubs
    pub attachments: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AllDocsOptions {
    pub startkey: Option<String>,
    pub endkey: Option<String>,
    pub descending: bool,
    pub keys: Option<Vec<String>>,
    pub include_docs: bool,
    pub conflicts: bool,
    pub skip: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowValue {
    pub rev: RevisionId,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

/// One row of `all_docs`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllDocsRow {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<RowValue>,
    /// `Some(Value::Null)` for tombstones requested by key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllDocsResponse {
    pub total_rows: u64,
    pub offset: usize,
    pub rows: Vec<AllDocsRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevsDiffEntry {
    pub missing: Vec<RevisionId>,
}

/// An embeddable document database
pub struct Database {
    name: String,
    config: DatabaseConfig,
    backend: Arc<dyn Backend>,
    notifier: Arc<ChangeNotifier>,
    filters: RwLock<HashMap<String, ChangeFilterFn>>,
    feeds: Mutex<Vec<Weak<FeedControl>>>,
    write_gate: tokio::sync::Mutex<()>,
}

impl Database {
    /// Open the database described by `config` on the process-wide notifier
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        Self::open_with_notifier(config, ChangeNotifier::shared())
    }

    pub fn open_with_notifier(config: DatabaseConfig, notifier: Arc<ChangeNotifier>) -> Result<Self> {
        let backend: Arc<dyn Backend> = match &config.storage {
            StorageConfig::Memory => Arc::new(MemoryBackend::new()),
            StorageConfig::Sqlite { path } => Arc::new(SqliteBackend::open(path, config.sqlite_cache_size_kib)?),
        };
        tracing::info!("Opened database {} ({} backend)", config.name, backend.kind());
        Ok(Self::with_backend(config, backend, notifier))
    }

    /// Wrap an existing backend, e.g. one shared with another instance
    pub fn with_backend(config: DatabaseConfig, backend: Arc<dyn Backend>, notifier: Arc<ChangeNotifier>) -> Self {
        Self {
            name: config.name.clone(),
            config,
            backend,
            notifier,
            filters: RwLock::new(HashMap::new()),
            feeds: Mutex::new(Vec::new()),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Fresh in-memory database
    pub fn memory(name: &str) -> Self {
        Self::with_backend(
            DatabaseConfig::memory(name),
            Arc::new(MemoryBackend::new()),
            ChangeNotifier::shared(),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub async fn info(&self) -> Result<DatabaseInfo> {
        let mut txn = self.backend.begin(TxnMode::Read)?;
        let doc_count = txn
            .scan_documents_by_id(&IdRange::default())?
            .iter()
            .filter(|d| !is_local(&d.id) && !d.forest.is_deleted())
            .count() as u64;
        Ok(DatabaseInfo {
            db_name: self.name.clone(),
            doc_count,
            update_seq: txn.update_seq()?,
            instance_id: self.backend.instance_id().to_string(),
            backend: self.backend.kind().to_string(),
        })
    }

    /// Write a batch of documents; one outcome per input, in input order
    pub async fn bulk_docs(&self, docs: Vec<Value>, options: BulkDocsOptions) -> Result<Vec<WriteOutcome>> {
        let _gate = self.write_gate.lock().await;
        let result = BulkWriter::new(self.backend.as_ref(), self.config.max_history_depth, options).write(docs)?;
        Ok(self.committed(result))
    }

    fn committed(&self, result: BatchResult) -> Vec<WriteOutcome> {
        if result.written {
            self.notifier.notify(&self.name);
        }
        result.outcomes
    }

    /// Write one edit with new revisions
    async fn write_one(&self, edit: Result<DocumentEdit>) -> Result<DocUpdate> {
        let _gate = self.write_gate.lock().await;
        self.write_one_locked(edit)
    }

    fn write_one_locked(&self, edit: Result<DocumentEdit>) -> Result<DocUpdate> {
        let result = BulkWriter::new(self.backend.as_ref(), self.config.max_history_depth, BulkDocsOptions::default())
            .write_edits(vec![edit])?;
        let outcome = self
            .committed(result)
            .into_iter()
            .next()
            .ok_or_else(|| DbError::InfrastructureFailure("empty bulk result".into()))?;
        match outcome {
            WriteOutcome::Accepted { id, rev } => Ok(DocUpdate { id, rev }),
            WriteOutcome::Rejected { error, .. } => Err(error),
        }
    }

    /// Create or update a document; `_id` is required
    pub async fn put(&self, doc: Value) -> Result<DocUpdate> {
        if !doc.get("_id").is_some_and(Value::is_string) {
            return Err(DbError::BadRequest("Document needs a string _id".into()));
        }
        self.write_one(DocumentEdit::parse(doc, true)).await
    }

    /// Create a document under a generated id
    pub async fn post(&self, mut doc: Value) -> Result<DocUpdate> {
        let Value::Object(map) = &mut doc else {
            return Err(DbError::BadRequest("Document must be a JSON object".into()));
        };
        if !map.contains_key("_id") {
            map.insert("_id".into(), Value::String(uuid::Uuid::new_v4().simple().to_string()));
        }
        self.write_one(DocumentEdit::parse(doc, true)).await
    }

    /// Write a tombstone on top of `rev`
    pub async fn remove(&self, id: &str, rev: &RevisionId) -> Result<DocUpdate> {
        validate_id(id)?;
        let doc = serde_json::json!({"_id": id, "_rev": rev.to_string(), "_deleted": true});
        self.write_one(DocumentEdit::parse(doc, true)).await
    }

    pub async fn get(&self, id: &str, options: GetOptions) -> Result<Value> {
        validate_id(id)?;
        let mut txn = self.backend.begin(TxnMode::Read)?;
        let (meta, rev, mut body) = read_revision(txn.as_mut(), id, options.rev.as_ref())?;
        let Value::Object(map) = &mut body else {
            return Err(DbError::InfrastructureFailure(format!("{} has a non-object body", id)));
        };

        if options.revs {
            if let Some(history) = meta.forest.history(&rev) {
                map.insert("_revisions".into(), serde_json::to_value(history).map_err(internal)?);
            }
        }
        if options.revs_info {
            let info = serde_json::to_value(meta.forest.revisions_info()).map_err(internal)?;
            map.insert("_revs_info".into(), info);
        }
        if options.conflicts {
            let conflicts = meta.forest.conflicts();
            if !conflicts.is_empty() {
                let list = conflicts.iter().map(|r| Value::String(r.to_string())).collect();
                map.insert("_conflicts".into(), Value::Array(list));
            }
        }
        if let Some(Value::Object(attachments)) = map.get_mut("_attachments") {
            for stub in attachments.values_mut() {
                let Value::Object(stub) = stub else { continue };
                if options.attachments {
                    let digest = stub.get("digest").and_then(Value::as_str).unwrap_or_default().to_string();
                    let record = AttachmentStore::new(txn.as_mut()).get(&digest)?;
                    stub.insert("data".into(), Value::String(encode_transport(&record.body)));
                } else {
                    stub.insert("stub".into(), Value::Bool(true));
                }
            }
        }
        Ok(body)
    }

    pub async fn all_docs(&self, options: AllDocsOptions) -> Result<AllDocsResponse> {
        if options.keys.is_some() && (options.startkey.is_some() || options.endkey.is_some()) {
            return Err(DbError::BadRequest("keys cannot be combined with startkey or endkey".into()));
        }
        let mut txn = self.backend.begin(TxnMode::Read)?;
        let all = txn.scan_documents_by_id(&IdRange::default())?;
        let total_rows = all.iter().filter(|d| !is_local(&d.id) && !d.forest.is_deleted()).count() as u64;

        let mut rows = Vec::new();
        match &options.keys {
            Some(keys) => {
                let by_id: HashMap<&str, &DocumentMetadata> = all.iter().map(|d| (d.id.as_str(), d)).collect();
                let mut keys = keys.clone();
                if options.descending {
                    keys.reverse();
                }
                for key in keys {
                    let row = match by_id.get(key.as_str()).filter(|d| !is_local(&d.id)) {
                        None => AllDocsRow {
                            key,
                            id: None,
                            value: None,
                            doc: None,
                            error: Some("not_found".into()),
                        },
                        Some(meta) => self.doc_row(txn.as_mut(), meta, &options, true)?,
                    };
                    rows.push(row);
                }
            }
            None => {
                let range = if options.descending {
                    IdRange {
                        start: options.endkey.clone(),
                        end: options.startkey.clone(),
                        descending: true,
                    }
                } else {
                    IdRange {
                        start: options.startkey.clone(),
                        end: options.endkey.clone(),
                        descending: false,
                    }
                };
                for meta in txn.scan_documents_by_id(&range)? {
                    if is_local(&meta.id) || meta.forest.is_deleted() {
                        continue;
                    }
                    rows.push(self.doc_row(txn.as_mut(), &meta, &options, false)?);
                }
            }
        }

        let rows: Vec<AllDocsRow> = rows
            .into_iter()
            .skip(options.skip)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(AllDocsResponse {
            total_rows,
            offset: options.skip,
            rows,
        })
    }

    fn doc_row(
        &self,
        txn: &mut dyn StoreTxn,
        meta: &DocumentMetadata,
        options: &AllDocsOptions,
        by_key: bool,
    ) -> Result<AllDocsRow> {
        let winner = meta
            .forest
            .winning_revision()
            .ok_or_else(|| DbError::InfrastructureFailure(format!("{} has an empty revision tree", meta.id)))?;
        let deleted = meta.forest.is_deleted();
        let doc = if !options.include_docs {
            None
        } else if deleted {
            by_key.then_some(Value::Null)
        } else {
            let mut body = txn
                .get_sequence(meta.winning_seq)?
                .map(|r| r.body)
                .ok_or_else(|| DbError::InfrastructureFailure(format!("{} has no winning body", meta.id)))?;
            mark_stubs(&mut body);
            let conflicts = meta.forest.conflicts();
            if let (true, false, Value::Object(map)) = (options.conflicts, conflicts.is_empty(), &mut body) {
                let list = conflicts.iter().map(|r| Value::String(r.to_string())).collect();
                map.insert("_conflicts".into(), Value::Array(list));
            }
            Some(body)
        };
        Ok(AllDocsRow {
            key: meta.id.clone(),
            id: Some(meta.id.clone()),
            value: Some(RowValue { rev: winner, deleted }),
            doc,
            error: None,
        })
    }

    /// Register a predicate usable as `ChangeFilter::Named(name)`
    pub fn register_filter(&self, name: impl Into<String>, predicate: ChangeFilterFn) {
        self.filters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), predicate);
    }

    fn resolve_filter(&self, filter: Option<&ChangeFilter>) -> Result<Option<ChangeFilterFn>> {
        match filter {
            None => Ok(None),
            Some(ChangeFilter::Predicate(f)) => Ok(Some(f.clone())),
            Some(ChangeFilter::Named(name)) => self
                .filters
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| DbError::NotFound(format!("Filter {} is not registered", name))),
        }
    }

    /// One-shot change query
    pub async fn changes(&self, options: ChangesOptions) -> Result<ChangesResponse> {
        let filter = self.resolve_filter(options.filter.as_ref())?;
        let since = if options.descending { 0 } else { options.since };
        let fetched = changes::fetch(self.backend.as_ref(), &options, filter.as_ref(), since)?;
        if let Some(on_change) = &options.on_change {
            for change in &fetched.changes {
                on_change(change);
            }
        }
        Ok(ChangesResponse {
            last_seq: fetched.scanned_seq,
            results: fetched.changes,
        })
    }

    /// Continuous change feed: catches up from `options.since`, then
    /// delivers every later commit until cancelled
    pub async fn subscribe_changes(&self, options: ChangesOptions, on_change: ChangeCallback) -> Result<ChangesFeed> {
        let filter = self.resolve_filter(options.filter.as_ref())?;
        let feed = ChangesFeed::start(
            self.backend.clone(),
            self.notifier.clone(),
            &self.name,
            options,
            filter,
            on_change,
        )?;
        let mut feeds = self.feeds.lock().unwrap_or_else(|e| e.into_inner());
        feeds.retain(|f| f.strong_count() > 0);
        feeds.push(feed.control());
        Ok(feed)
    }

    /// Bytes of attachment `name` on the winning revision, exactly as they
    /// were written
    pub async fn get_attachment(&self, id: &str, name: &str) -> Result<Bytes> {
        validate_id(id)?;
        let mut txn = self.backend.begin(TxnMode::Read)?;
        let (_, _, body) = read_revision(txn.as_mut(), id, None)?;
        let digest = body
            .get("_attachments")
            .and_then(|a| a.get(name))
            .and_then(|s| s.get("digest"))
            .and_then(Value::as_str)
            .ok_or_else(|| DbError::NotFound(format!("Document {} has no attachment {}", id, name)))?;
        Ok(AttachmentStore::new(txn.as_mut()).get(digest)?.body)
    }

    /// Add or replace an attachment, creating the document when it does not
    /// exist and no `rev` is given
    pub async fn put_attachment(
        &self,
        id: &str,
        rev: Option<&RevisionId>,
        name: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<DocUpdate> {
        validate_id(id)?;
        let _gate = self.write_gate.lock().await;
        let current = self.current_body(id)?;
        let base = match current {
            Some((winner, false, body)) => {
                if rev != Some(&winner) {
                    return Err(DbError::rev_conflict());
                }
                body
            }
            Some((winner, true, _)) => {
                if rev.is_some_and(|r| *r != winner) {
                    return Err(DbError::rev_conflict());
                }
                serde_json::json!({"_id": id, "_rev": winner.to_string()})
            }
            None => {
                if rev.is_some() {
                    return Err(DbError::rev_conflict());
                }
                serde_json::json!({"_id": id})
            }
        };
        let edit = DocumentEdit::parse(base, true).map(|mut edit| {
            edit.attachments.insert(
                name.to_string(),
                EditAttachment::Inline {
                    content_type: content_type.to_string(),
                    data,
                },
            );
            edit
        });
        self.write_one_locked(edit)
    }

    /// Write a new revision without attachment `name`
    pub async fn remove_attachment(&self, id: &str, rev: &RevisionId, name: &str) -> Result<DocUpdate> {
        validate_id(id)?;
        let _gate = self.write_gate.lock().await;
        let (winner, deleted, body) = self.current_body(id)?.ok_or_else(DbError::missing_doc)?;
        if deleted {
            return Err(DbError::deleted_doc());
        }
        if *rev != winner {
            return Err(DbError::rev_conflict());
        }
        let edit = DocumentEdit::parse(body, true).and_then(|mut edit| {
            edit.attachments
                .remove(name)
                .map(|_| edit)
                .ok_or_else(|| DbError::NotFound(format!("Document {} has no attachment {}", id, name)))
        });
        self.write_one_locked(edit)
    }

    /// Winner, tombstone flag and editable body of `id`
    fn current_body(&self, id: &str) -> Result<Option<(RevisionId, bool, Value)>> {
        let mut txn = self.backend.begin(TxnMode::Read)?;
        let Some(meta) = txn.get_document(id)? else {
            return Ok(None);
        };
        let winner = meta
            .forest
            .winning_revision()
            .ok_or_else(|| DbError::InfrastructureFailure(format!("{} has an empty revision tree", id)))?;
        let stored = match meta.local_body {
            Some(body) => Some(body),
            None => txn.get_sequence(meta.winning_seq)?.map(|r| r.body),
        };
        let mut body =
            stored.ok_or_else(|| DbError::InfrastructureFailure(format!("{} has no winning body", id)))?;
        mark_stubs(&mut body);
        Ok(Some((winner, meta.forest.is_deleted(), body)))
    }

    /// Stored attachment record by digest
    pub async fn attachment_record(&self, digest: &str) -> Result<AttachmentRecord> {
        let mut txn = self.backend.begin(TxnMode::Read)?;
        AttachmentStore::new(txn.as_mut()).get(digest)
    }

    /// For each id, the given revisions this database does not hold a body for
    pub async fn revs_diff(
        &self,
        revs: BTreeMap<String, Vec<RevisionId>>,
    ) -> Result<BTreeMap<String, RevsDiffEntry>> {
        let mut txn = self.backend.begin(TxnMode::Read)?;
        let mut diff = BTreeMap::new();
        for (id, wanted) in revs {
            let meta = txn.get_document(&id)?;
            let missing: Vec<RevisionId> = wanted
                .into_iter()
                .filter(|rev| {
                    let status = meta.as_ref().and_then(|m| m.forest.status(rev));
                    matches!(status, None | Some(RevisionStatus::Missing))
                })
                .collect();
            if !missing.is_empty() {
                diff.insert(id, RevsDiffEntry { missing });
            }
        }
        Ok(diff)
    }

    /// Cancel this instance's feeds and drop all stored data
    pub async fn destroy(self) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let feeds = std::mem::take(&mut *self.feeds.lock().unwrap_or_else(|e| e.into_inner()));
        for control in feeds.iter().filter_map(Weak::upgrade) {
            control.cancel();
        }
        self.backend.destroy()?;
        tracing::info!("Destroyed database {}", self.name);
        Ok(())
    }
}

/// Metadata, revision and body of `id` at `rev`, or at the winner
fn read_revision(
    txn: &mut dyn StoreTxn,
    id: &str,
    rev: Option<&RevisionId>,
) -> Result<(DocumentMetadata, RevisionId, Value)> {
    let meta = txn.get_document(id)?.ok_or_else(DbError::missing_doc)?;
    if let Some(body) = &meta.local_body {
        let winner = meta.forest.winning_revision().ok_or_else(DbError::missing_doc)?;
        if rev.is_some_and(|r| *r != winner) {
            return Err(DbError::missing_doc());
        }
        if meta.forest.is_deleted() {
            return Err(DbError::deleted_doc());
        }
        let body = body.clone();
        return Ok((meta, winner, body));
    }
    let (rev, record) = match rev {
        None => {
            if meta.forest.is_deleted() {
                return Err(DbError::deleted_doc());
            }
            let winner = meta.forest.winning_revision().ok_or_else(DbError::missing_doc)?;
            (winner, txn.get_sequence(meta.winning_seq)?)
        }
        Some(rev) => {
            match meta.forest.status(rev) {
                None | Some(RevisionStatus::Missing) => return Err(DbError::missing_doc()),
                Some(_) => {}
            }
            (rev.clone(), txn.get_revision(id, rev)?)
        }
    };
    let record = record.ok_or_else(DbError::missing_doc)?;
    Ok((meta, rev, record.body))
}

/// Mark each attachment of a stored body as a stub
fn mark_stubs(body: &mut Value) {
    if let Some(Value::Object(attachments)) = body.get_mut("_attachments") {
        for stub in attachments.values_mut() {
            if let Value::Object(stub) = stub {
                stub.insert("stub".into(), Value::Bool(true));
            }
        }
    }
}

fn internal(err: serde_json::Error) -> DbError {
    DbError::InfrastructureFailure(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let db = Database::memory("put-get");
        let update = db.put(json!({"_id": "a", "v": 1})).await.unwrap();
        assert_eq!(update.rev.generation(), 1);
        let doc = db.get("a", GetOptions::default()).await.unwrap();
        assert_eq!(doc["v"], 1);
        assert_eq!(doc["_rev"], update.rev.to_string());
    }

    #[tokio::test]
    async fn test_put_requires_id() {
        let db = Database::memory("put-id");
        let err = db.put(json!({"v": 1})).await.unwrap_err();
        assert!(matches!(err, DbError::BadRequest(_)));
        let err = db.put(json!({"_id": "_bad"})).await.unwrap_err();
        assert!(matches!(err, DbError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_post_assigns_id() {
        let db = Database::memory("post");
        let update = db.post(json!({"v": 1})).await.unwrap();
        assert_eq!(update.id.len(), 32);
        assert!(db.get(&update.id, GetOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_get_options() {
        let db = Database::memory("get-options");
        let r1 = db.put(json!({"_id": "a", "v": 1})).await.unwrap().rev;
        let r2 = db.put(json!({"_id": "a", "_rev": r1.to_string(), "v": 2})).await.unwrap().rev;
        let doc = db
            .get(
                "a",
                GetOptions {
                    revs: true,
                    revs_info: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(doc["_revisions"]["start"], 2);
        assert_eq!(doc["_revisions"]["ids"][0], r2.hash());
        assert_eq!(doc["_revs_info"][1]["rev"], r1.to_string());
        assert_eq!(doc["_revs_info"][1]["status"], "available");

        let old = db
            .get(
                "a",
                GetOptions {
                    rev: Some(r1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(old["v"], 1);

        let unknown = RevisionId::parse("9-nope").unwrap();
        let err = db
            .get(
                "a",
                GetOptions {
                    rev: Some(unknown),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, DbError::missing_doc());
    }

    #[tokio::test]
    async fn test_info_counts_live_documents() {
        let db = Database::memory("info");
        let a = db.put(json!({"_id": "a"})).await.unwrap();
        db.put(json!({"_id": "b"})).await.unwrap();
        db.put(json!({"_id": "_local/x"})).await.unwrap();
        db.remove("a", &a.rev).await.unwrap();
        let info = db.info().await.unwrap();
        assert_eq!(info.doc_count, 1);
        assert_eq!(info.update_seq, 3);
        assert_eq!(info.backend, "memory");
        assert_eq!(info.db_name, "info");
    }

    #[tokio::test]
    async fn test_all_docs_range_and_keys() {
        let db = Database::memory("all-docs");
        for id in ["a", "b", "c", "d"] {
            db.put(json!({"_id": id})).await.unwrap();
        }
        let c = db.get("c", GetOptions::default()).await.unwrap();
        let c_rev = RevisionId::parse(c["_rev"].as_str().unwrap()).unwrap();
        db.remove("c", &c_rev).await.unwrap();
        db.put(json!({"_id": "_local/z"})).await.unwrap();

        let res = db
            .all_docs(AllDocsOptions {
                startkey: Some("d".into()),
                endkey: Some("b".into()),
                descending: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let keys: Vec<&str> = res.rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["d", "b"]);
        assert_eq!(res.total_rows, 3);

        let res = db
            .all_docs(AllDocsOptions {
                keys: Some(vec!["c".into(), "zz".into(), "a".into()]),
                include_docs: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(res.rows[0].value.as_ref().unwrap().deleted, true);
        assert_eq!(res.rows[0].doc, Some(Value::Null));
        assert_eq!(res.rows[1].error.as_deref(), Some("not_found"));
        assert_eq!(res.rows[2].doc.as_ref().unwrap()["_id"], "a");

        let err = db
            .all_docs(AllDocsOptions {
                keys: Some(vec![]),
                startkey: Some("a".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_revs_diff() {
        let db = Database::memory("revs-diff");
        db.bulk_docs(
            vec![json!({"_id": "a", "_rev": "2-b", "_revisions": {"start": 2, "ids": ["b", "a"]}})],
            BulkDocsOptions { new_edits: false },
        )
        .await
        .unwrap();
        let query = BTreeMap::from([
            (
                "a".to_string(),
                vec![RevisionId::parse("1-a").unwrap(), RevisionId::parse("2-b").unwrap()],
            ),
            ("z".to_string(), vec![RevisionId::parse("1-q").unwrap()]),
        ]);
        let diff = db.revs_diff(query).await.unwrap();
        assert_eq!(diff["a"].missing, vec![RevisionId::parse("1-a").unwrap()]);
        assert_eq!(diff["z"].missing.len(), 1);
    }

    #[tokio::test]
    async fn test_named_filter_must_exist() {
        let db = Database::memory("filters");
        db.put(json!({"_id": "a", "kind": "x"})).await.unwrap();
        db.put(json!({"_id": "b", "kind": "y"})).await.unwrap();
        let options = ChangesOptions {
            filter: Some(ChangeFilter::Named("by-kind".into())),
            ..Default::default()
        };
        assert!(matches!(db.changes(options.clone()).await, Err(DbError::NotFound(_))));

        db.register_filter("by-kind", Arc::new(|doc: &Value| doc["kind"] == "y"));
        let res = db.changes(options).await.unwrap();
        assert_eq!(res.results.len(), 1);
        assert_eq!(res.results[0].id, "b");
        assert_eq!(res.last_seq, 2);
    }

    #[tokio::test]
    async fn test_remove_attachment() {
        let db = Database::memory("remove-attachment");
        let up = db
            .put_attachment("a", None, "f.txt", Bytes::from_static(b"hi"), "text/plain")
            .await
            .unwrap();
        let err = db.remove_attachment("a", &up.rev, "nope").await.unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
        let up2 = db.remove_attachment("a", &up.rev, "f.txt").await.unwrap();
        let doc = db.get("a", GetOptions::default()).await.unwrap();
        assert!(doc.get("_attachments").is_none());
        assert!(matches!(
            db.remove_attachment("a", &up.rev, "f.txt").await,
            Err(DbError::Conflict(_))
        ));
        assert_eq!(up2.rev.generation(), 2);
    }
}
