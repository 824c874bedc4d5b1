//! Content-addressed attachment storage
//!
//! Blobs are keyed by the md5 of their bytes, so identical content written
//! by different documents or revisions lands in one record whose owner set
//! grows. Bodies are stored decoded; base64 only appears on the JSON
//! transport. Nothing is ever pruned from the store.

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{DbError, Result};
use crate::revision::RevisionId;
use crate::storage::{AttachmentRecord, StoreTxn};

/// Digest of an attachment body, `"md5-<hex>"`
pub fn digest(bytes: &[u8]) -> String {
    format!("md5-{}", hex::encode(md5::compute(bytes).0))
}

/// Owner reference stored in `AttachmentRecord::owners`
pub fn owner_ref(doc_id: &str, rev: &RevisionId) -> String {
    format!("{}@{}", doc_id, rev)
}

/// Reverse the base64 transport encoding of inline attachment data
pub fn decode_transport(bytes: &[u8]) -> Result<Bytes> {
    base64::engine::general_purpose::STANDARD
        .decode(bytes)
        .map(Bytes::from)
        .map_err(|e| DbError::BadRequest(format!("Attachment is not valid base64: {}", e)))
}

/// Base64 transport form of stored bytes
pub fn encode_transport(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Metadata kept in a document body in place of the attachment bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentStub {
    pub content_type: String,
    pub digest: String,
    pub length: u64,
}

impl AttachmentStub {
    pub fn for_bytes(content_type: impl Into<String>, body: &[u8]) -> Self {
        Self {
            content_type: content_type.into(),
            digest: digest(body),
            length: body.len() as u64,
        }
    }

    /// Stub as stored inside a sequence-log body
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "content_type": self.content_type,
            "digest": self.digest,
            "length": self.length,
        })
    }
}

/// Attachment operations inside one open transaction
pub struct AttachmentStore<'t, 'b> {
    txn: &'t mut (dyn StoreTxn + 'b),
}

impl<'t, 'b> AttachmentStore<'t, 'b> {
    pub fn new(txn: &'t mut (dyn StoreTxn + 'b)) -> Self {
        Self { txn }
    }

    /// Store `body` under its digest, or add `owner` to the existing record
    ///
    /// Writing the same owner twice leaves the record unchanged.
    pub fn put_if_absent(&mut self, body: Bytes, owner: &str) -> Result<String> {
        let digest = digest(&body);
        let record = match self.txn.get_attachment(&digest)? {
            Some(mut existing) => {
                if !existing.owners.insert(owner.to_string()) {
                    return Ok(digest);
                }
                existing
            }
            None => AttachmentRecord {
                digest: digest.clone(),
                body,
                owners: BTreeSet::from([owner.to_string()]),
            },
        };
        self.txn.put_attachment(&record)?;
        Ok(digest)
    }

    /// Add `owner` to an already stored digest
    pub fn add_owner(&mut self, digest: &str, owner: &str) -> Result<()> {
        let mut record = self.txn.get_attachment(digest)?.ok_or_else(|| {
            DbError::BadRequest(format!("Attachment stub references unknown digest {}", digest))
        })?;
        if record.owners.insert(owner.to_string()) {
            self.txn.put_attachment(&record)?;
        }
        Ok(())
    }

    pub fn get(&mut self, digest: &str) -> Result<AttachmentRecord> {
        self.txn
            .get_attachment(digest)?
            .ok_or_else(|| DbError::NotFound(format!("Attachment {} is missing", digest)))
    }
}
