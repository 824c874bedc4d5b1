//! Parsing of incoming document JSON into edits

use bytes::Bytes;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::attachments;
use crate::error::{DbError, Result};
use crate::rev_tree::{RevisionHistory, RevisionPath};
use crate::revision::RevisionId;

pub const DESIGN_PREFIX: &str = "_design/";
pub const LOCAL_PREFIX: &str = "_local/";

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Reserved members accepted on input and silently dropped
const IGNORED_MEMBERS: &[&str] = &["_conflicts", "_revs_info", "_deleted_conflicts", "_local_seq"];

/// Check a document id
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(DbError::BadRequest("Document id must not be empty".into()));
    }
    if id.starts_with('_') && !id.starts_with(DESIGN_PREFIX) && !id.starts_with(LOCAL_PREFIX) {
        return Err(DbError::BadRequest(format!(
            "Only reserved document ids may start with underscore: {}",
            id
        )));
    }
    Ok(())
}

/// Local documents are versioned but never replicated or listed
pub fn is_local(id: &str) -> bool {
    id.starts_with(LOCAL_PREFIX)
}

/// An attachment carried by an edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditAttachment {
    /// New bytes supplied with the edit, already decoded from base64
    Inline { content_type: String, data: Bytes },
    /// Reference to bytes already in the attachment store
    Stub {
        content_type: Option<String>,
        digest: String,
    },
}

impl EditAttachment {
    pub fn digest(&self) -> String {
        match self {
            EditAttachment::Inline { data, .. } => attachments::digest(data),
            EditAttachment::Stub { digest, .. } => digest.clone(),
        }
    }
}

/// One parsed edit of a bulk write
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentEdit {
    pub id: String,
    pub rev: Option<RevisionId>,
    pub history: Option<RevisionHistory>,
    pub deleted: bool,
    /// User fields, without any `_`-prefixed members
    pub fields: Map<String, Value>,
    pub attachments: BTreeMap<String, EditAttachment>,
}

impl DocumentEdit {
    /// Parse a document, generating an id when none is given and
    /// `new_edits` is set
    pub fn parse(doc: Value, new_edits: bool) -> Result<Self> {
        let Value::Object(members) = doc else {
            return Err(DbError::BadRequest("Document must be a JSON object".into()));
        };

        let mut edit = DocumentEdit {
            id: String::new(),
            rev: None,
            history: None,
            deleted: false,
            fields: Map::new(),
            attachments: BTreeMap::new(),
        };
        let mut id = None;

        for (key, value) in members {
            match key.as_str() {
                "_id" => match value {
                    Value::String(s) => id = Some(s),
                    _ => return Err(DbError::BadRequest("_id must be a string".into())),
                },
                "_rev" => match value {
                    Value::String(s) => edit.rev = Some(RevisionId::parse(&s)?),
                    Value::Null => {}
                    _ => return Err(DbError::BadRequest("_rev must be a string".into())),
                },
                "_revisions" => {
                    let history: RevisionHistory = serde_json::from_value(value)
                        .map_err(|e| DbError::BadRequest(format!("Invalid _revisions: {}", e)))?;
                    edit.history = Some(history);
                }
                "_deleted" => match value {
                    Value::Bool(b) => edit.deleted = b,
                    _ => return Err(DbError::BadRequest("_deleted must be a boolean".into())),
                },
                "_attachments" => edit.attachments = parse_attachments(value)?,
                k if IGNORED_MEMBERS.contains(&k) => {}
                k if k.starts_with('_') => {
                    return Err(DbError::BadRequest(format!("Bad special document member: {}", k)));
                }
                _ => {
                    edit.fields.insert(key, value);
                }
            }
        }

        edit.id = match id {
            Some(id) => id,
            None if new_edits => uuid::Uuid::new_v4().simple().to_string(),
            None => return Err(DbError::BadRequest("Replicated documents must carry an _id".into())),
        };
        validate_id(&edit.id)?;

        if let (Some(rev), Some(history)) = (&edit.rev, &edit.history) {
            let tip = history.ids.first().map(String::as_str);
            if history.start != rev.generation() || tip != Some(rev.hash()) {
                return Err(DbError::BadRequest(format!("_revisions does not end at _rev {}", rev)));
            }
        }
        if !new_edits && edit.rev.is_none() && edit.history.is_none() {
            return Err(DbError::BadRequest(format!(
                "Replicated document {} must carry _rev or _revisions",
                edit.id
            )));
        }
        Ok(edit)
    }

    /// Revision the edit claims to extend
    pub fn parent(&self) -> Option<RevisionId> {
        if self.rev.is_some() {
            return self.rev.clone();
        }
        let history = self.history.as_ref()?;
        let hash = history.ids.first()?;
        RevisionId::new(history.start, hash.clone()).ok()
    }

    /// Path carried by a replicated edit, whose tip is the revision itself
    pub fn replicated_path(&self) -> Result<RevisionPath> {
        match (&self.history, &self.rev) {
            (Some(history), _) => RevisionPath::from_history(history, self.deleted),
            (None, Some(rev)) => Ok(RevisionPath::for_edit(None, rev.clone(), self.deleted)),
            (None, None) => Err(DbError::BadRequest("Missing _rev".into())),
        }
    }

    /// Content hashed into a locally generated revision id
    pub fn revision_body(&self) -> Value {
        let mut body = self.fields.clone();
        if !self.attachments.is_empty() {
            let digests: Map<String, Value> = self
                .attachments
                .iter()
                .map(|(name, att)| (name.clone(), Value::String(att.digest())))
                .collect();
            body.insert("_attachments".into(), Value::Object(digests));
        }
        Value::Object(body)
    }
}

fn parse_attachments(value: Value) -> Result<BTreeMap<String, EditAttachment>> {
    let Value::Object(entries) = value else {
        return Err(DbError::BadRequest("_attachments must be an object".into()));
    };
    let mut parsed = BTreeMap::new();
    for (name, entry) in entries {
        let Value::Object(entry) = entry else {
            return Err(DbError::BadRequest(format!("Attachment {} must be an object", name)));
        };
        let content_type = entry
            .get("content_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let is_stub = entry.get("stub").and_then(Value::as_bool).unwrap_or(false);
        let attachment = if is_stub {
            let digest = entry
                .get("digest")
                .and_then(Value::as_str)
                .ok_or_else(|| DbError::BadRequest(format!("Attachment stub {} has no digest", name)))?;
            EditAttachment::Stub {
                content_type,
                digest: digest.to_string(),
            }
        } else {
            let data = entry
                .get("data")
                .and_then(Value::as_str)
                .ok_or_else(|| DbError::BadRequest(format!("Attachment {} has no data", name)))?;
            let data = attachments::decode_transport(data.as_bytes())
                .map_err(|e| DbError::BadRequest(format!("Attachment {}: {}", name, e.reason())))?;
            EditAttachment::Inline {
                content_type: content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
                data,
            }
        };
        parsed.insert(name, attachment);
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_plain_document() {
        let edit = DocumentEdit::parse(json!({"_id": "a", "_rev": "1-x", "v": 1}), true).unwrap();
        assert_eq!(edit.id, "a");
        assert_eq!(edit.parent(), Some(RevisionId::parse("1-x").unwrap()));
        assert_eq!(edit.fields.get("v"), Some(&json!(1)));
        assert!(!edit.deleted);
    }

    #[test]
    fn test_missing_id_is_generated_for_new_edits() {
        let edit = DocumentEdit::parse(json!({"v": 1}), true).unwrap();
        assert_eq!(edit.id.len(), 32);
        assert!(DocumentEdit::parse(json!({"_rev": "1-a"}), false).is_err());
    }

    #[test]
    fn test_id_rules() {
        assert!(validate_id("").is_err());
        assert!(validate_id("_foo").is_err());
        assert!(validate_id("_design/x").is_ok());
        assert!(validate_id("_local/x").is_ok());
        assert!(validate_id("plain").is_ok());
        assert!(is_local("_local/x"));
    }

    #[test]
    fn test_rejects_malformed() {
        for doc in [
            json!([1, 2]),
            json!({"_id": 3}),
            json!({"_id": "a", "_rev": "bogus"}),
            json!({"_id": "a", "_deleted": "yes"}),
            json!({"_id": "a", "_unknown": 1}),
            json!({"_id": "a", "_attachments": {"f": {"content_type": "text/plain"}}}),
            json!({"_id": "a", "_attachments": {"f": {"data": "not base64!"}}}),
        ] {
            let err = DocumentEdit::parse(doc.clone(), true).unwrap_err();
            assert!(matches!(err, DbError::BadRequest(_)), "{}", doc);
        }
    }

    #[test]
    fn test_replicated_path_from_revisions() {
        let doc = json!({
            "_id": "a",
            "_rev": "3-c",
            "_revisions": {"start": 3, "ids": ["c", "b", "a"]},
        });
        let edit = DocumentEdit::parse(doc, false).unwrap();
        let path = edit.replicated_path().unwrap();
        assert_eq!(path.revisions().len(), 3);
        assert_eq!(path.tip().to_string(), "3-c");

        let mismatched = json!({"_id": "a", "_rev": "3-z", "_revisions": {"start": 3, "ids": ["c"]}});
        assert!(DocumentEdit::parse(mismatched, false).is_err());
    }

    #[test]
    fn test_attachments_parse_inline_and_stub() {
        let doc = json!({
            "_id": "a",
            "_attachments": {
                "new.txt": {"content_type": "text/plain", "data": "aGVsbG8="},
                "old.bin": {"stub": true, "digest": "md5-abc", "length": 3},
            },
            "_conflicts": ["2-x"],
        });
        let edit = DocumentEdit::parse(doc, true).unwrap();
        assert_eq!(
            edit.attachments.get("new.txt"),
            Some(&EditAttachment::Inline {
                content_type: "text/plain".into(),
                data: Bytes::from_static(b"hello"),
            })
        );
        assert_eq!(edit.attachments.get("old.bin").unwrap().digest(), "md5-abc");
        let body = edit.revision_body();
        assert_eq!(body["_attachments"]["old.bin"], "md5-abc");
        assert!(body.get("_conflicts").is_none());
    }
}
