//! In-memory backend
//!
//! Keeps all tables behind one mutex. A write transaction edits the tables in
//! place and records an undo entry per change; dropping it uncommitted replays
//! the entries backwards, so an aborted batch leaves nothing behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::revision::RevisionId;
use crate::storage::{
    AttachmentRecord, Backend, DocumentMetadata, IdRange, Result, SequenceRecord, StorageError,
    StoreTxn, TxnMode,
};

#[derive(Debug, Default)]
struct Tables {
    documents: BTreeMap<String, DocumentMetadata>,
    sequences: BTreeMap<u64, SequenceRecord>,
    /// (doc id, rev) -> sequence
    revisions: HashMap<(String, String), u64>,
    attachments: HashMap<String, AttachmentRecord>,
    update_seq: u64,
    last_seq: u64,
}

/// Inverse of one write
#[derive(Debug)]
enum Undo {
    Document(String, Option<DocumentMetadata>),
    Sequence {
        seq: u64,
        key: (String, String),
        prev_last_seq: u64,
    },
    Attachment(String, Option<AttachmentRecord>),
    UpdateSeq(u64),
}

impl Tables {
    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Document(id, Some(prev)) => {
                self.documents.insert(id, prev);
            }
            Undo::Document(id, None) => {
                self.documents.remove(&id);
            }
            Undo::Sequence {
                seq,
                key,
                prev_last_seq,
            } => {
                self.sequences.remove(&seq);
                self.revisions.remove(&key);
                self.last_seq = prev_last_seq;
            }
            Undo::Attachment(digest, Some(prev)) => {
                self.attachments.insert(digest, prev);
            }
            Undo::Attachment(digest, None) => {
                self.attachments.remove(&digest);
            }
            Undo::UpdateSeq(prev) => self.update_seq = prev,
        }
    }
}

/// Backend keeping everything in process memory
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    instance_id: String,
    created_at: i64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            instance_id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Backend("memory tables poisoned".into()))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }

    fn begin(&self, mode: TxnMode) -> Result<Box<dyn StoreTxn + '_>> {
        let guard = self.lock()?;
        Ok(Box::new(MemoryTxn {
            guard,
            mode,
            undo: Vec::new(),
        }))
    }

    fn destroy(&self) -> Result<()> {
        *self.lock()? = Tables::default();
        Ok(())
    }
}

struct MemoryTxn<'a> {
    guard: MutexGuard<'a, Tables>,
    mode: TxnMode,
    /// Pending inverses, oldest first
    undo: Vec<Undo>,
}

impl MemoryTxn<'_> {
    fn writable(&self) -> Result<()> {
        match self.mode {
            TxnMode::Write => Ok(()),
            TxnMode::Read => Err(StorageError::Backend("write in a read-only transaction".into())),
        }
    }
}

impl Drop for MemoryTxn<'_> {
    fn drop(&mut self) {
        if !self.undo.is_empty() {
            tracing::debug!("memory txn rollback: {} writes", self.undo.len());
        }
        while let Some(undo) = self.undo.pop() {
            self.guard.revert(undo);
        }
    }
}

impl StoreTxn for MemoryTxn<'_> {
    fn get_document(&mut self, id: &str) -> Result<Option<DocumentMetadata>> {
        Ok(self.guard.documents.get(id).cloned())
    }

    fn put_document(&mut self, doc: &DocumentMetadata) -> Result<()> {
        self.writable()?;
        let prev = self.guard.documents.insert(doc.id.clone(), doc.clone());
        self.undo.push(Undo::Document(doc.id.clone(), prev));
        Ok(())
    }

    fn scan_documents_by_id(&mut self, range: &IdRange) -> Result<Vec<DocumentMetadata>> {
        let mut docs: Vec<DocumentMetadata> = self
            .guard
            .documents
            .values()
            .filter(|d| range.start.as_deref().is_none_or(|s| d.id.as_str() >= s))
            .filter(|d| range.end.as_deref().is_none_or(|e| d.id.as_str() <= e))
            .cloned()
            .collect();
        if range.descending {
            docs.reverse();
        }
        Ok(docs)
    }

    fn scan_documents_by_seq(&mut self, since: u64, descending: bool) -> Result<Vec<DocumentMetadata>> {
        let mut docs: Vec<DocumentMetadata> = self
            .guard
            .documents
            .values()
            .filter(|d| d.seq > since)
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.seq);
        if descending {
            docs.reverse();
        }
        Ok(docs)
    }

    fn append_sequence(&mut self, doc_id: &str, rev: &RevisionId, body: &serde_json::Value) -> Result<u64> {
        self.writable()?;
        let tables = &mut *self.guard;
        let key = (doc_id.to_string(), rev.to_string());
        if tables.revisions.contains_key(&key) {
            return Err(StorageError::Database(format!(
                "UNIQUE constraint failed: by_sequence {}@{}",
                doc_id, rev
            )));
        }
        let prev_last_seq = tables.last_seq;
        tables.last_seq += 1;
        let seq = tables.last_seq;
        tables.revisions.insert(key.clone(), seq);
        tables.sequences.insert(
            seq,
            SequenceRecord {
                seq,
                doc_id: doc_id.to_string(),
                rev: rev.clone(),
                body: body.clone(),
            },
        );
        self.undo.push(Undo::Sequence {
            seq,
            key,
            prev_last_seq,
        });
        Ok(seq)
    }

    fn get_sequence(&mut self, seq: u64) -> Result<Option<SequenceRecord>> {
        Ok(self.guard.sequences.get(&seq).cloned())
    }

    fn get_revision(&mut self, doc_id: &str, rev: &RevisionId) -> Result<Option<SequenceRecord>> {
        let tables = &*self.guard;
        let seq = tables.revisions.get(&(doc_id.to_string(), rev.to_string()));
        Ok(seq.and_then(|s| tables.sequences.get(s)).cloned())
    }

    fn get_attachment(&mut self, digest: &str) -> Result<Option<AttachmentRecord>> {
        Ok(self.guard.attachments.get(digest).cloned())
    }

    fn put_attachment(&mut self, record: &AttachmentRecord) -> Result<()> {
        self.writable()?;
        let prev = self
            .guard
            .attachments
            .insert(record.digest.clone(), record.clone());
        self.undo.push(Undo::Attachment(record.digest.clone(), prev));
        Ok(())
    }

    fn update_seq(&mut self) -> Result<u64> {
        Ok(self.guard.update_seq)
    }

    fn set_update_seq(&mut self, seq: u64) -> Result<()> {
        self.writable()?;
        let prev = std::mem::replace(&mut self.guard.update_seq, seq);
        self.undo.push(Undo::UpdateSeq(prev));
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.undo.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rev(s: &str) -> RevisionId {
        RevisionId::parse(s).unwrap()
    }

    #[test]
    fn test_uncommitted_writes_are_discarded() {
        let backend = MemoryBackend::new();
        {
            let mut txn = backend.begin(TxnMode::Write).unwrap();
            txn.append_sequence("a", &rev("1-x"), &json!({})).unwrap();
            txn.set_update_seq(1).unwrap();
        }
        let mut txn = backend.begin(TxnMode::Read).unwrap();
        assert_eq!(txn.update_seq().unwrap(), 0);
        assert!(txn.get_sequence(1).unwrap().is_none());
    }

    #[test]
    fn test_committed_sequence_is_monotone() {
        let backend = MemoryBackend::new();
        let mut txn = backend.begin(TxnMode::Write).unwrap();
        let s1 = txn.append_sequence("a", &rev("1-x"), &json!({"v": 1})).unwrap();
        let s2 = txn.append_sequence("b", &rev("1-x"), &json!({"v": 2})).unwrap();
        txn.commit().unwrap();
        assert_eq!((s1, s2), (1, 2));

        let mut txn = backend.begin(TxnMode::Read).unwrap();
        let record = txn.get_revision("b", &rev("1-x")).unwrap().unwrap();
        assert_eq!(record.seq, 2);
        assert_eq!(record.body, json!({"v": 2}));
    }

    #[test]
    fn test_duplicate_revision_is_rejected() {
        let backend = MemoryBackend::new();
        let mut txn = backend.begin(TxnMode::Write).unwrap();
        txn.append_sequence("a", &rev("1-x"), &json!({})).unwrap();
        assert!(txn.append_sequence("a", &rev("1-x"), &json!({})).is_err());
    }

    #[test]
    fn test_rollback_restores_overwritten_rows() {
        let backend = MemoryBackend::new();
        let doc = |id: &str, seq| DocumentMetadata {
            id: id.to_string(),
            forest: Default::default(),
            seq,
            winning_seq: seq,
            local_body: None,
        };
        let attachment = |length| AttachmentRecord {
            digest: "md5-x".into(),
            body: bytes::Bytes::from(vec![0u8; length]),
            owners: Default::default(),
        };
        {
            let mut txn = backend.begin(TxnMode::Write).unwrap();
            txn.append_sequence("a", &rev("1-x"), &json!({})).unwrap();
            txn.put_document(&doc("a", 1)).unwrap();
            txn.put_attachment(&attachment(1)).unwrap();
            txn.set_update_seq(1).unwrap();
            txn.commit().unwrap();
        }
        {
            let mut txn = backend.begin(TxnMode::Write).unwrap();
            let seq = txn.append_sequence("a", &rev("2-y"), &json!({})).unwrap();
            assert_eq!(seq, 2);
            txn.put_document(&doc("a", 2)).unwrap();
            txn.put_document(&doc("b", 2)).unwrap();
            txn.put_attachment(&attachment(5)).unwrap();
            txn.set_update_seq(2).unwrap();
        }

        let mut txn = backend.begin(TxnMode::Read).unwrap();
        assert_eq!(txn.update_seq().unwrap(), 1);
        assert_eq!(txn.get_document("a").unwrap().unwrap().seq, 1);
        assert!(txn.get_document("b").unwrap().is_none());
        assert!(txn.get_revision("a", &rev("2-y")).unwrap().is_none());
        assert_eq!(txn.get_attachment("md5-x").unwrap().unwrap().body.len(), 1);
        drop(txn);

        let mut txn = backend.begin(TxnMode::Write).unwrap();
        assert_eq!(txn.append_sequence("a", &rev("2-y"), &json!({})).unwrap(), 2);
    }

    #[test]
    fn test_read_txn_refuses_writes() {
        let backend = MemoryBackend::new();
        let mut txn = backend.begin(TxnMode::Read).unwrap();
        assert!(txn.set_update_seq(3).is_err());
    }
}
