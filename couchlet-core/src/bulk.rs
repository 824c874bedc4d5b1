//! Bulk write processor
//!
//! Turns an ordered batch of edits into revision-forest merges, sequence-log
//! appends and attachment writes, all inside one write transaction. Edits
//! are processed in submission order and every input yields exactly one
//! outcome at the same position. A storage fault anywhere aborts the whole
//! batch.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::attachments::{owner_ref, AttachmentStore, AttachmentStub};
use crate::document::{is_local, DocumentEdit, EditAttachment, DEFAULT_CONTENT_TYPE};
use crate::error::{DbError, ErrorKind, Result};
use crate::rev_tree::{MergeOutcome, RevisionPath};
use crate::revision::RevisionId;
use crate::storage::{Backend, DocumentMetadata, StoreTxn, TxnMode};

/// Options of a bulk write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkDocsOptions {
    /// Generate new revisions (`true`) or store supplied history as-is
    pub new_edits: bool,
}

impl Default for BulkDocsOptions {
    fn default() -> Self {
        Self { new_edits: true }
    }
}

/// Per-edit result of a bulk write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Accepted { id: String, rev: RevisionId },
    Rejected { id: Option<String>, error: DbError },
}

impl WriteOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, WriteOutcome::Accepted { .. })
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            WriteOutcome::Accepted { id, .. } => Some(id),
            WriteOutcome::Rejected { id, .. } => id.as_deref(),
        }
    }

    /// `{ok, id, rev}` or `{id, error, reason, status}`
    pub fn to_json(&self) -> Value {
        match self {
            WriteOutcome::Accepted { id, rev } => serde_json::json!({
                "ok": true,
                "id": id,
                "rev": rev.to_string(),
            }),
            WriteOutcome::Rejected { id, error } => {
                let mut json = error.to_json();
                if let (Some(id), Value::Object(map)) = (id, &mut json) {
                    map.insert("id".into(), Value::String(id.clone()));
                }
                json
            }
        }
    }
}

/// Result of a committed batch
#[derive(Debug)]
pub(crate) struct BatchResult {
    pub outcomes: Vec<WriteOutcome>,
    /// At least one body reached the sequence log
    pub written: bool,
}

/// What an accepted edit did to storage
enum Applied {
    /// A new body was stored; `seq` is zero for local documents
    Written { rev: RevisionId, seq: u64 },
    /// Every revision was already known; nothing was appended
    Unchanged { rev: RevisionId },
}

pub(crate) struct BulkWriter<'a> {
    backend: &'a dyn Backend,
    max_depth: usize,
    new_edits: bool,
}

impl<'a> BulkWriter<'a> {
    pub fn new(backend: &'a dyn Backend, max_depth: usize, options: BulkDocsOptions) -> Self {
        Self {
            backend,
            max_depth,
            new_edits: options.new_edits,
        }
    }

    /// Parse and commit a batch
    pub fn write(&self, docs: Vec<Value>) -> Result<BatchResult> {
        let parsed = docs
            .into_iter()
            .map(|doc| DocumentEdit::parse(doc, self.new_edits))
            .collect();
        self.write_edits(parsed)
    }

    /// Commit already parsed edits; parse failures become rejections
    pub fn write_edits(&self, parsed: Vec<Result<DocumentEdit>>) -> Result<BatchResult> {
        tracing::debug!("bulk write: {} docs, new_edits={}", parsed.len(), self.new_edits);

        if parsed.iter().all(Result::is_err) {
            let outcomes = parsed
                .into_iter()
                .filter_map(Result::err)
                .map(|error| WriteOutcome::Rejected { id: None, error })
                .collect();
            return Ok(BatchResult { outcomes, written: false });
        }

        let mut txn = self.backend.begin(TxnMode::Write)?;

        let mut docs: HashMap<String, Option<DocumentMetadata>> = HashMap::new();
        for edit in parsed.iter().flatten() {
            if !docs.contains_key(&edit.id) {
                let existing = txn.get_document(&edit.id)?;
                docs.insert(edit.id.clone(), existing);
            }
        }

        let mut update_seq = txn.update_seq()?;
        let start_seq = update_seq;
        let mut written = false;
        let mut outcomes = Vec::with_capacity(parsed.len());
        let mut previous_id: Option<String> = None;

        for slot in parsed {
            let edit = match slot {
                Ok(edit) => edit,
                Err(error) => {
                    previous_id = None;
                    outcomes.push(WriteOutcome::Rejected { id: None, error });
                    continue;
                }
            };
            if previous_id.as_deref() == Some(edit.id.as_str()) {
                outcomes.push(WriteOutcome::Rejected {
                    id: Some(edit.id.clone()),
                    error: DbError::rev_conflict(),
                });
                continue;
            }
            previous_id = Some(edit.id.clone());

            match self.apply(txn.as_mut(), &mut docs, &edit) {
                Ok(Applied::Written { rev, seq }) => {
                    if !is_local(&edit.id) {
                        written = true;
                        update_seq = seq;
                    }
                    outcomes.push(WriteOutcome::Accepted { id: edit.id, rev });
                }
                Ok(Applied::Unchanged { rev }) => {
                    outcomes.push(WriteOutcome::Accepted { id: edit.id, rev });
                }
                Err(error) if error.kind() == ErrorKind::InfrastructureFailure => {
                    tracing::warn!("bulk write aborted on {}: {}", edit.id, error);
                    return Err(error);
                }
                Err(error) => {
                    outcomes.push(WriteOutcome::Rejected {
                        id: Some(edit.id),
                        error,
                    });
                }
            }
        }

        if update_seq != start_seq {
            txn.set_update_seq(update_seq)?;
        }
        txn.commit()?;
        Ok(BatchResult { outcomes, written })
    }

    /// Apply one edit. Every rejection is decided before the first write.
    fn apply(
        &self,
        txn: &mut dyn StoreTxn,
        docs: &mut HashMap<String, Option<DocumentMetadata>>,
        edit: &DocumentEdit,
    ) -> Result<Applied> {
        let existing = docs.get(&edit.id).cloned().flatten();
        let mut forest = existing.as_ref().map(|d| d.forest.clone()).unwrap_or_default();

        let path = if self.new_edits {
            self.local_path(existing.as_ref(), edit)?
        } else {
            edit.replicated_path()?
        };
        let tip = path.tip().clone();

        let merged = forest.merge_path(&path, self.max_depth);
        let winner_deleted = existing.as_ref().is_some_and(|d| d.forest.is_deleted());
        if edit.deleted && winner_deleted && merged.leaf_written {
            return Err(DbError::rev_conflict());
        }
        if self.new_edits {
            let accepted = match merged.outcome {
                MergeOutcome::NewLeaf => true,
                MergeOutcome::NewBranch => existing.is_none() || winner_deleted,
                MergeOutcome::Existing => false,
            };
            if !accepted {
                return Err(DbError::rev_conflict());
            }
        }

        let stubs = resolve_stubs(txn, edit)?;

        let already_stored = merged.leaf_written && txn.get_revision(&edit.id, &tip)?.is_some();
        if !merged.leaf_written || already_stored {
            if let Some(mut doc) = existing {
                if doc.forest != forest {
                    doc.forest = forest;
                    txn.put_document(&doc)?;
                    docs.insert(edit.id.clone(), Some(doc));
                }
            }
            return Ok(Applied::Unchanged { rev: tip });
        }

        let owner = owner_ref(&edit.id, &tip);
        let mut store = AttachmentStore::new(txn);
        let mut attachment_stubs = Map::new();
        for (name, attachment) in &edit.attachments {
            let stub = match attachment {
                EditAttachment::Inline { content_type, data } => {
                    store.put_if_absent(data.clone(), &owner)?;
                    AttachmentStub::for_bytes(content_type.clone(), data)
                }
                EditAttachment::Stub { digest, .. } => {
                    store.add_owner(digest, &owner)?;
                    stubs.get(name).cloned().ok_or_else(|| {
                        DbError::BadRequest(format!("Attachment stub {} is unresolved", name))
                    })?
                }
            };
            attachment_stubs.insert(name.clone(), stub.to_json());
        }

        let body = stored_body(edit, &tip, attachment_stubs);
        if is_local(&edit.id) {
            let doc = DocumentMetadata {
                id: edit.id.clone(),
                forest,
                seq: 0,
                winning_seq: 0,
                local_body: Some(body),
            };
            txn.put_document(&doc)?;
            docs.insert(edit.id.clone(), Some(doc));
            return Ok(Applied::Written { rev: tip, seq: 0 });
        }
        let seq = txn.append_sequence(&edit.id, &tip, &body)?;

        let winner = forest.winning_revision();
        let winning_seq = match &winner {
            Some(w) if *w == tip => seq,
            Some(w) => match txn.get_revision(&edit.id, w)? {
                Some(record) => record.seq,
                None => existing.as_ref().map_or(seq, |d| d.winning_seq),
            },
            None => seq,
        };
        let doc = DocumentMetadata {
            id: edit.id.clone(),
            forest,
            seq,
            winning_seq,
            local_body: None,
        };
        txn.put_document(&doc)?;
        docs.insert(edit.id.clone(), Some(doc));

        Ok(Applied::Written { rev: tip, seq })
    }

    /// Path for a locally generated revision
    fn local_path(&self, existing: Option<&DocumentMetadata>, edit: &DocumentEdit) -> Result<RevisionPath> {
        let mut parent = edit.parent();
        match existing {
            None => {
                if edit.deleted {
                    return Err(DbError::missing_doc());
                }
            }
            Some(doc) if doc.forest.is_deleted() => {
                // Resurrection continues the tombstoned branch unless told otherwise.
                if parent.is_none() {
                    parent = doc.forest.winning_revision();
                }
            }
            Some(doc) => {
                if parent.is_none() || parent != doc.forest.winning_revision() {
                    return Err(DbError::rev_conflict());
                }
            }
        }
        let rev = RevisionId::next(parent.as_ref(), &edit.revision_body(), edit.deleted)?;
        Ok(RevisionPath::for_edit(parent.as_ref(), rev, edit.deleted))
    }
}

/// Look up every stub of an edit, failing with `BadRequest` on unknown digests
fn resolve_stubs(txn: &mut dyn StoreTxn, edit: &DocumentEdit) -> Result<HashMap<String, AttachmentStub>> {
    let mut stubs = HashMap::new();
    for (name, attachment) in &edit.attachments {
        if let EditAttachment::Stub { content_type, digest } = attachment {
            let record = txn.get_attachment(digest)?.ok_or_else(|| {
                DbError::BadRequest(format!("Attachment {} references unknown digest {}", name, digest))
            })?;
            stubs.insert(
                name.clone(),
                AttachmentStub {
                    content_type: content_type.clone().unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
                    digest: digest.clone(),
                    length: record.body.len() as u64,
                },
            );
        }
    }
    Ok(stubs)
}

/// Body as written to the sequence log
fn stored_body(edit: &DocumentEdit, rev: &RevisionId, attachments: Map<String, Value>) -> Value {
    let mut body = edit.fields.clone();
    body.insert("_id".into(), Value::String(edit.id.clone()));
    body.insert("_rev".into(), Value::String(rev.to_string()));
    if edit.deleted {
        body.insert("_deleted".into(), Value::Bool(true));
    }
    if !attachments.is_empty() {
        body.insert("_attachments".into(), Value::Object(attachments));
    }
    Value::Object(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryBackend;
    use serde_json::json;

    fn write(backend: &MemoryBackend, docs: Vec<Value>, new_edits: bool) -> Vec<WriteOutcome> {
        BulkWriter::new(backend, 1000, BulkDocsOptions { new_edits })
            .write(docs)
            .unwrap()
            .outcomes
    }

    fn rev_of(outcome: &WriteOutcome) -> String {
        match outcome {
            WriteOutcome::Accepted { rev, .. } => rev.to_string(),
            other => panic!("expected accepted, got {:?}", other),
        }
    }

    #[test]
    fn test_outcomes_keep_input_order() {
        let backend = MemoryBackend::new();
        let outcomes = write(
            &backend,
            vec![json!({"_id": "a"}), json!("not a doc"), json!({"_id": "b"})],
            true,
        );
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].id(), Some("a"));
        assert!(matches!(&outcomes[1], WriteOutcome::Rejected { error: DbError::BadRequest(_), .. }));
        assert_eq!(outcomes[2].id(), Some("b"));

        let mut txn = backend.begin(TxnMode::Read).unwrap();
        assert_eq!(txn.update_seq().unwrap(), 2);
    }

    #[test]
    fn test_consecutive_duplicate_is_conflict() {
        let backend = MemoryBackend::new();
        let outcomes = write(&backend, vec![json!({"_id": "a", "v": 1}), json!({"_id": "a", "v": 2})], true);
        assert!(outcomes[0].is_accepted());
        assert_eq!(
            outcomes[1],
            WriteOutcome::Rejected {
                id: Some("a".into()),
                error: DbError::rev_conflict()
            }
        );
    }

    #[test]
    fn test_non_adjacent_duplicate_sees_latest_state() {
        let backend = MemoryBackend::new();
        let outcomes = write(
            &backend,
            vec![json!({"_id": "a"}), json!({"_id": "b"}), json!({"_id": "a"})],
            true,
        );
        assert!(outcomes[0].is_accepted());
        assert!(matches!(&outcomes[2], WriteOutcome::Rejected { error: DbError::Conflict(_), .. }));
    }

    #[test]
    fn test_parent_must_be_winner() {
        let backend = MemoryBackend::new();
        let first = write(&backend, vec![json!({"_id": "a", "v": 1})], true);
        let rev1 = rev_of(&first[0]);
        let second = write(&backend, vec![json!({"_id": "a", "_rev": rev1, "v": 2})], true);
        assert!(second[0].is_accepted());
        let stale = write(&backend, vec![json!({"_id": "a", "_rev": rev1, "v": 3})], true);
        assert!(matches!(&stale[0], WriteOutcome::Rejected { error: DbError::Conflict(_), .. }));
    }

    #[test]
    fn test_delete_rules() {
        let backend = MemoryBackend::new();
        let missing = write(&backend, vec![json!({"_id": "x", "_deleted": true})], true);
        assert!(matches!(&missing[0], WriteOutcome::Rejected { error: DbError::NotFound(_), .. }));

        let created = write(&backend, vec![json!({"_id": "a"})], true);
        let deleted = write(&backend, vec![json!({"_id": "a", "_rev": rev_of(&created[0]), "_deleted": true})], true);
        let tombstone = rev_of(&deleted[0]);
        let again = write(&backend, vec![json!({"_id": "a", "_rev": tombstone, "_deleted": true})], true);
        assert!(matches!(&again[0], WriteOutcome::Rejected { error: DbError::Conflict(_), .. }));

        let revived = write(&backend, vec![json!({"_id": "a", "v": 2})], true);
        assert!(rev_of(&revived[0]).starts_with("3-"));
    }

    #[test]
    fn test_replicated_tombstone_on_deleted_doc_is_conflict() {
        let backend = MemoryBackend::new();
        write(
            &backend,
            vec![json!({"_id": "d", "_revisions": {"start": 2, "ids": ["b", "a"]}, "_deleted": true})],
            false,
        );
        let again = write(
            &backend,
            vec![json!({"_id": "d", "_revisions": {"start": 2, "ids": ["zzz", "a"]}, "_deleted": true})],
            false,
        );
        assert!(matches!(&again[0], WriteOutcome::Rejected { error: DbError::Conflict(_), .. }));

        // Re-sending the known tombstone changes nothing and is not a new delete.
        let known = write(
            &backend,
            vec![json!({"_id": "d", "_revisions": {"start": 2, "ids": ["b", "a"]}, "_deleted": true})],
            false,
        );
        assert!(known[0].is_accepted());

        let revived = write(
            &backend,
            vec![json!({"_id": "d", "_revisions": {"start": 2, "ids": ["c", "a"]}})],
            false,
        );
        assert!(revived[0].is_accepted());
        let mut txn = backend.begin(TxnMode::Read).unwrap();
        assert_eq!(txn.update_seq().unwrap(), 2);
    }

    #[test]
    fn test_generation_overflow_is_rejected() {
        let backend = MemoryBackend::new();
        let outcomes = write(
            &backend,
            vec![
                json!({"_id": "x", "_rev": "18446744073709551615-abc"}),
                json!({"_id": "y", "_revisions": {"start": u64::MAX, "ids": ["a"]}}),
            ],
            false,
        );
        for outcome in &outcomes {
            assert!(matches!(outcome, WriteOutcome::Rejected { error: DbError::BadRequest(_), .. }));
        }

        let top = format!("{}-abc", crate::revision::MAX_GENERATION);
        write(&backend, vec![json!({"_id": "z", "_rev": top.clone()})], false);
        let outcomes = write(&backend, vec![json!({"_id": "z", "_rev": top, "v": 1})], true);
        assert!(matches!(&outcomes[0], WriteOutcome::Rejected { error: DbError::BadRequest(_), .. }));
    }

    #[test]
    fn test_unparseable_batch_skips_storage() {
        struct Unreachable;
        impl Backend for Unreachable {
            fn kind(&self) -> &'static str {
                "unreachable"
            }
            fn instance_id(&self) -> &str {
                "unreachable"
            }
            fn created_at(&self) -> i64 {
                0
            }
            fn begin(&self, _mode: TxnMode) -> crate::storage::Result<Box<dyn StoreTxn + '_>> {
                Err(crate::storage::StorageError::Backend("unreachable".into()))
            }
            fn destroy(&self) -> crate::storage::Result<()> {
                Ok(())
            }
        }

        let writer = BulkWriter::new(&Unreachable, 1000, BulkDocsOptions::default());
        let result = writer.write(vec![json!("nope"), json!({"_id": "_bad"})]).unwrap();
        assert!(!result.written);
        assert_eq!(result.outcomes.len(), 2);
        for outcome in &result.outcomes {
            assert!(matches!(outcome, WriteOutcome::Rejected { error: DbError::BadRequest(_), .. }));
        }
        assert!(writer.write(vec![json!({"_id": "ok"})]).is_err());
    }

    #[test]
    fn test_replicated_history_accepts_any_branch() {
        let backend = MemoryBackend::new();
        let outcomes = write(
            &backend,
            vec![
                json!({"_id": "a", "_rev": "2-b", "_revisions": {"start": 2, "ids": ["b", "a"]}}),
                json!({"_id": "z"}),
                json!({"_id": "a", "_rev": "2-c", "_revisions": {"start": 2, "ids": ["c", "a"]}}),
            ],
            false,
        );
        assert!(outcomes[0].is_accepted());
        assert!(matches!(&outcomes[1], WriteOutcome::Rejected { error: DbError::BadRequest(_), .. }));
        assert!(outcomes[2].is_accepted());

        let mut txn = backend.begin(TxnMode::Read).unwrap();
        let doc = txn.get_document("a").unwrap().unwrap();
        assert_eq!(doc.forest.winning_revision().unwrap().to_string(), "2-c");
        assert_eq!(doc.forest.conflicts().len(), 1);
        let winner = txn.get_sequence(doc.winning_seq).unwrap().unwrap();
        assert_eq!(winner.rev.to_string(), "2-c");
    }

    #[test]
    fn test_known_revision_is_a_noop() {
        let backend = MemoryBackend::new();
        let doc = json!({"_id": "a", "_rev": "1-a"});
        write(&backend, vec![doc.clone()], false);
        let again = write(&backend, vec![doc], false);
        assert!(again[0].is_accepted());
        let mut txn = backend.begin(TxnMode::Read).unwrap();
        assert_eq!(txn.update_seq().unwrap(), 1);
    }

    #[test]
    fn test_local_docs_do_not_advance_counter() {
        let backend = MemoryBackend::new();
        let outcomes = write(&backend, vec![json!({"_id": "_local/cp", "seq": 4})], true);
        assert!(outcomes[0].is_accepted());
        let mut txn = backend.begin(TxnMode::Read).unwrap();
        assert_eq!(txn.update_seq().unwrap(), 0);
    }

    #[test]
    fn test_inline_attachment_becomes_stub() {
        let backend = MemoryBackend::new();
        let outcomes = write(
            &backend,
            vec![json!({"_id": "a", "_attachments": {"f.txt": {"content_type": "text/plain", "data": "aGk="}}})],
            true,
        );
        let rev = rev_of(&outcomes[0]);
        let mut txn = backend.begin(TxnMode::Read).unwrap();
        let doc = txn.get_document("a").unwrap().unwrap();
        let body = txn.get_sequence(doc.winning_seq).unwrap().unwrap().body;
        let stub = &body["_attachments"]["f.txt"];
        assert_eq!(stub["length"], 2);
        assert!(stub.get("data").is_none());
        let digest = stub["digest"].as_str().unwrap();
        let record = txn.get_attachment(digest).unwrap().unwrap();
        assert!(record.owners.contains(&format!("a@{}", rev)));
    }

    #[test]
    fn test_unknown_stub_is_bad_request() {
        let backend = MemoryBackend::new();
        let outcomes = write(
            &backend,
            vec![json!({"_id": "a", "_attachments": {"f": {"stub": true, "digest": "md5-none"}}})],
            true,
        );
        assert!(matches!(&outcomes[0], WriteOutcome::Rejected { error: DbError::BadRequest(_), .. }));
    }
}
