//! SQLite-backed storage
//!
//! All four tables live in one SQLite file in WAL mode. A transaction holds
//! the connection lock from `BEGIN` to `COMMIT`; dropping it early issues
//! `ROLLBACK`.
//!
//! ```text
//! metadata_store (update_seq, instance_id, created_at)
//! document_store (id PK, seq, winning_seq, json)
//! by_sequence    (seq PK AUTOINCREMENT, doc_id, rev, json, UNIQUE(doc_id, rev))
//! attach_store   (digest PK, body, owners)
//! ```

use bytes::Bytes;
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::revision::RevisionId;
use crate::storage::{
    AttachmentRecord, Backend, DocumentMetadata, IdRange, Result, SequenceRecord, StorageError,
    StoreTxn, TxnMode,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS metadata_store (
        update_seq INTEGER NOT NULL,
        instance_id TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS document_store (
        id TEXT PRIMARY KEY,
        seq INTEGER NOT NULL,
        winning_seq INTEGER NOT NULL,
        json TEXT NOT NULL
    ) WITHOUT ROWID;
    CREATE INDEX IF NOT EXISTS document_store_seq ON document_store (seq);
    CREATE TABLE IF NOT EXISTS by_sequence (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        doc_id TEXT NOT NULL,
        rev TEXT NOT NULL,
        json TEXT NOT NULL,
        UNIQUE (doc_id, rev)
    );
    CREATE TABLE IF NOT EXISTS attach_store (
        digest TEXT PRIMARY KEY,
        body BLOB NOT NULL,
        owners TEXT NOT NULL
    ) WITHOUT ROWID;
";

fn open_connection(path: &Path, cache_size_kib: u32) -> Result<Connection> {
    let conn = Connection::open(path)
        .map_err(|e| StorageError::Database(format!("Failed to open SQLite database at {:?}: {}", path, e)))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", format!("-{}", cache_size_kib))?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Backend storing one database in one SQLite file
pub struct SqliteBackend {
    path: PathBuf,
    conn: Mutex<Connection>,
    instance_id: String,
    created_at: i64,
}

impl SqliteBackend {
    /// Open or create the database file at `path`
    pub fn open(path: &Path, cache_size_kib: u32) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = open_connection(path, cache_size_kib)?;

        let existing: Option<(String, i64)> = conn
            .query_row("SELECT instance_id, created_at FROM metadata_store LIMIT 1", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .optional()?;
        let (instance_id, created_at) = match existing {
            Some(row) => row,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                let now = chrono::Utc::now().timestamp();
                conn.execute(
                    "INSERT INTO metadata_store (update_seq, instance_id, created_at) VALUES (0, ?1, ?2)",
                    rusqlite::params![id, now],
                )?;
                tracing::info!("Created database file {:?} ({})", path, id);
                (id, now)
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            instance_id,
            created_at,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Backend("sqlite connection poisoned".into()))
    }
}

impl Backend for SqliteBackend {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }

    fn begin(&self, mode: TxnMode) -> Result<Box<dyn StoreTxn + '_>> {
        let conn = self.lock()?;
        conn.execute_batch(match mode {
            TxnMode::Read => "BEGIN DEFERRED",
            TxnMode::Write => "BEGIN IMMEDIATE",
        })?;
        Ok(Box::new(SqliteTxn {
            conn,
            mode,
            finished: false,
        }))
    }

    fn destroy(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "DROP TABLE IF EXISTS document_store;
             DROP TABLE IF EXISTS by_sequence;
             DROP TABLE IF EXISTS attach_store;
             DROP TABLE IF EXISTS metadata_store;",
        )?;
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

struct SqliteTxn<'a> {
    conn: MutexGuard<'a, Connection>,
    mode: TxnMode,
    finished: bool,
}

impl SqliteTxn<'_> {
    fn writable(&self) -> Result<()> {
        match self.mode {
            TxnMode::Write => Ok(()),
            TxnMode::Read => Err(StorageError::Backend("write in a read-only transaction".into())),
        }
    }

    fn documents(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<DocumentMetadata>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params, |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StorageError::from))
            .collect()
    }

    fn sequence(&self, sql: &str, params: impl rusqlite::Params) -> Result<Option<SequenceRecord>> {
        let row: Option<(i64, String, String, String)> = self
            .conn
            .query_row(sql, params, |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
            .optional()?;
        row.map(|(seq, doc_id, rev, json)| {
            Ok(SequenceRecord {
                seq: seq as u64,
                doc_id,
                rev: RevisionId::parse(&rev).map_err(|e| StorageError::Serialization(e.to_string()))?,
                body: serde_json::from_str(&json)?,
            })
        })
        .transpose()
    }
}

impl StoreTxn for SqliteTxn<'_> {
    fn get_document(&mut self, id: &str) -> Result<Option<DocumentMetadata>> {
        let json: Option<String> = self
            .conn
            .query_row("SELECT json FROM document_store WHERE id=?1", [id], |r| r.get(0))
            .optional()?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    fn put_document(&mut self, doc: &DocumentMetadata) -> Result<()> {
        self.writable()?;
        self.conn.execute(
            "INSERT INTO document_store (id,seq,winning_seq,json) VALUES (?1,?2,?3,?4) \
             ON CONFLICT(id) DO UPDATE SET seq=excluded.seq,winning_seq=excluded.winning_seq,json=excluded.json",
            rusqlite::params![doc.id, doc.seq as i64, doc.winning_seq as i64, serde_json::to_string(doc)?],
        )?;
        Ok(())
    }

    fn scan_documents_by_id(&mut self, range: &IdRange) -> Result<Vec<DocumentMetadata>> {
        let sql = if range.descending {
            "SELECT json FROM document_store WHERE (?1 IS NULL OR id >= ?1) AND (?2 IS NULL OR id <= ?2) ORDER BY id DESC"
        } else {
            "SELECT json FROM document_store WHERE (?1 IS NULL OR id >= ?1) AND (?2 IS NULL OR id <= ?2) ORDER BY id ASC"
        };
        self.documents(sql, rusqlite::params![range.start, range.end])
    }

    fn scan_documents_by_seq(&mut self, since: u64, descending: bool) -> Result<Vec<DocumentMetadata>> {
        let sql = if descending {
            "SELECT json FROM document_store WHERE seq > ?1 ORDER BY seq DESC"
        } else {
            "SELECT json FROM document_store WHERE seq > ?1 ORDER BY seq ASC"
        };
        self.documents(sql, [since as i64])
    }

    fn append_sequence(&mut self, doc_id: &str, rev: &RevisionId, body: &serde_json::Value) -> Result<u64> {
        self.writable()?;
        self.conn.execute(
            "INSERT INTO by_sequence (doc_id,rev,json) VALUES (?1,?2,?3)",
            rusqlite::params![doc_id, rev.to_string(), body.to_string()],
        )?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    fn get_sequence(&mut self, seq: u64) -> Result<Option<SequenceRecord>> {
        self.sequence(
            "SELECT seq,doc_id,rev,json FROM by_sequence WHERE seq=?1",
            [seq as i64],
        )
    }

    fn get_revision(&mut self, doc_id: &str, rev: &RevisionId) -> Result<Option<SequenceRecord>> {
        self.sequence(
            "SELECT seq,doc_id,rev,json FROM by_sequence WHERE doc_id=?1 AND rev=?2",
            rusqlite::params![doc_id, rev.to_string()],
        )
    }

    fn get_attachment(&mut self, digest: &str) -> Result<Option<AttachmentRecord>> {
        let row: Option<(Vec<u8>, String)> = self
            .conn
            .query_row(
                "SELECT body,owners FROM attach_store WHERE digest=?1",
                [digest],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        row.map(|(body, owners)| {
            Ok(AttachmentRecord {
                digest: digest.to_string(),
                body: Bytes::from(body),
                owners: serde_json::from_str::<BTreeSet<String>>(&owners)?,
            })
        })
        .transpose()
    }

    fn put_attachment(&mut self, record: &AttachmentRecord) -> Result<()> {
        self.writable()?;
        self.conn.execute(
            "INSERT INTO attach_store (digest,body,owners) VALUES (?1,?2,?3) \
             ON CONFLICT(digest) DO UPDATE SET owners=excluded.owners",
            rusqlite::params![
                record.digest,
                record.body.as_ref(),
                serde_json::to_string(&record.owners)?
            ],
        )?;
        Ok(())
    }

    fn update_seq(&mut self) -> Result<u64> {
        let seq: i64 = self
            .conn
            .query_row("SELECT update_seq FROM metadata_store LIMIT 1", [], |r| r.get(0))?;
        Ok(seq as u64)
    }

    fn set_update_seq(&mut self, seq: u64) -> Result<()> {
        self.writable()?;
        self.conn
            .execute("UPDATE metadata_store SET update_seq=?1", [seq as i64])?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }
}

impl Drop for SqliteTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!("Rollback failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rev_tree::{RevisionForest, RevisionPath};
    use serde_json::json;
    use tempfile::TempDir;

    fn rev(s: &str) -> RevisionId {
        RevisionId::parse(s).unwrap()
    }

    fn open(tmp: &TempDir) -> SqliteBackend {
        SqliteBackend::open(&tmp.path().join("db.sqlite"), 2000).unwrap()
    }

    #[test]
    fn test_open_persists_instance_id() {
        let tmp = TempDir::new().unwrap();
        let first = open(&tmp).instance_id().to_string();
        let second = open(&tmp).instance_id().to_string();
        assert_eq!(first.len(), 36);
        assert_eq!(first, second);
    }

    #[test]
    fn test_document_roundtrip_and_scans() {
        let tmp = TempDir::new().unwrap();
        let backend = open(&tmp);
        let mut forest = RevisionForest::new();
        forest.merge_path(&RevisionPath::for_edit(None, rev("1-a"), false), 10);

        let mut txn = backend.begin(TxnMode::Write).unwrap();
        for (i, id) in ["b", "a", "c"].iter().enumerate() {
            let seq = txn.append_sequence(id, &rev("1-a"), &json!({"_id": id})).unwrap();
            assert_eq!(seq, i as u64 + 1);
            txn.put_document(&DocumentMetadata {
                id: id.to_string(),
                forest: forest.clone(),
                seq,
                winning_seq: seq,
                local_body: None,
            })
            .unwrap();
        }
        txn.set_update_seq(3).unwrap();
        txn.commit().unwrap();

        let mut txn = backend.begin(TxnMode::Read).unwrap();
        assert_eq!(txn.update_seq().unwrap(), 3);
        let by_id: Vec<String> = txn
            .scan_documents_by_id(&IdRange::default())
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(by_id, vec!["a", "b", "c"]);
        let ranged = txn
            .scan_documents_by_id(&IdRange {
                start: Some("b".into()),
                end: None,
                descending: true,
            })
            .unwrap();
        assert_eq!(ranged.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["c", "b"]);
        let by_seq: Vec<u64> = txn
            .scan_documents_by_seq(1, false)
            .unwrap()
            .into_iter()
            .map(|d| d.seq)
            .collect();
        assert_eq!(by_seq, vec![2, 3]);
        let record = txn.get_sequence(2).unwrap().unwrap();
        assert_eq!(record.doc_id, "a");
        assert_eq!(txn.get_document("a").unwrap().unwrap().forest, forest);
    }

    #[test]
    fn test_dropped_txn_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let backend = open(&tmp);
        {
            let mut txn = backend.begin(TxnMode::Write).unwrap();
            txn.append_sequence("a", &rev("1-a"), &json!({})).unwrap();
            txn.set_update_seq(1).unwrap();
        }
        let mut txn = backend.begin(TxnMode::Read).unwrap();
        assert_eq!(txn.update_seq().unwrap(), 0);
        assert!(txn.get_revision("a", &rev("1-a")).unwrap().is_none());
    }

    #[test]
    fn test_attachment_owners_update() {
        let tmp = TempDir::new().unwrap();
        let backend = open(&tmp);
        let mut record = AttachmentRecord {
            digest: "md5-x".into(),
            body: Bytes::from_static(b"hello"),
            owners: BTreeSet::from(["a@1-a".to_string()]),
        };
        let mut txn = backend.begin(TxnMode::Write).unwrap();
        txn.put_attachment(&record).unwrap();
        record.owners.insert("b@1-b".into());
        txn.put_attachment(&record).unwrap();
        txn.commit().unwrap();

        let mut txn = backend.begin(TxnMode::Read).unwrap();
        let stored = txn.get_attachment("md5-x").unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[test]
    fn test_destroy_removes_file() {
        let tmp = TempDir::new().unwrap();
        let backend = open(&tmp);
        backend.destroy().unwrap();
        assert!(!tmp.path().join("db.sqlite").exists());
    }
}
