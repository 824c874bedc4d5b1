//! Revision identifiers
//!
//! A revision is written `"{generation}-{hash}"`. Locally created revisions
//! hash their parent together with the new body, so two instances that make
//! the same edit on the same parent arrive at the same id without talking to
//! each other.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::DbError;

/// Largest generation a revision may carry
pub const MAX_GENERATION: u64 = i64::MAX as u64;

/// Identifier of one version of a document body
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId {
    generation: u64,
    hash: String,
}

impl RevisionId {
    /// Create a revision id from its parts
    pub fn new(generation: u64, hash: impl Into<String>) -> Result<Self, DbError> {
        let hash = hash.into();
        if generation == 0 {
            return Err(DbError::BadRequest("Revision generation must be positive".into()));
        }
        if generation > MAX_GENERATION {
            return Err(DbError::BadRequest(format!("Revision generation {} is too large", generation)));
        }
        if !is_valid_hash(&hash) {
            return Err(DbError::BadRequest(format!("Invalid revision hash: {:?}", hash)));
        }
        Ok(Self { generation, hash })
    }

    /// Parse `"N-hash"`
    pub fn parse(text: &str) -> Result<Self, DbError> {
        let invalid = || DbError::BadRequest(format!("Invalid rev format: {:?}", text));
        let (generation, hash) = text.split_once('-').ok_or_else(invalid)?;
        if generation.is_empty() || !generation.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let generation: u64 = generation.parse().map_err(|_| invalid())?;
        Self::new(generation, hash).map_err(|_| invalid())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Revision id for a new edit on top of `parent`
    ///
    /// The hash is an md5 over the parent id, the deletion flag and the
    /// serialized body. `serde_json` maps are key-sorted, so the
    /// serialization is canonical. Fails when `parent` is already at
    /// `MAX_GENERATION`.
    pub fn next(parent: Option<&RevisionId>, body: &serde_json::Value, deleted: bool) -> Result<Self, DbError> {
        let generation = match parent {
            None => 1,
            Some(p) => p
                .generation
                .checked_add(1)
                .filter(|g| *g <= MAX_GENERATION)
                .ok_or_else(|| DbError::BadRequest(format!("Revision {} cannot be extended", p)))?,
        };
        let mut input = Vec::new();
        if let Some(parent) = parent {
            input.extend_from_slice(parent.to_string().as_bytes());
        }
        input.push(b'\n');
        input.push(if deleted { b'1' } else { b'0' });
        input.extend_from_slice(body.to_string().as_bytes());
        let digest = md5::compute(&input);
        Ok(Self {
            generation,
            hash: hex::encode(digest.0),
        })
    }
}

fn is_valid_hash(hash: &str) -> bool {
    !hash.is_empty() && !hash.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Winner ordering: higher generation first, then lexicographically greater hash
impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for RevisionId {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RevisionId {
    type Error = DbError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RevisionId> for String {
    fn from(rev: RevisionId) -> Self {
        rev.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_parse_roundtrip() {
        let rev = RevisionId::parse("3-abc123").unwrap();
        assert_eq!(rev.generation(), 3);
        assert_eq!(rev.hash(), "abc123");
        assert_eq!(rev.to_string(), "3-abc123");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for text in ["", "abc", "0-abc", "-abc", "x-abc", "1-", "1- a", "+1-abc"] {
            let err = RevisionId::parse(text).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::BadRequest, "{:?}", text);
        }
    }

    #[test]
    fn test_hash_may_contain_dashes() {
        let rev = RevisionId::parse("2-a-b").unwrap();
        assert_eq!(rev.hash(), "a-b");
    }

    #[test]
    fn test_next_is_deterministic() {
        let parent = RevisionId::parse("1-aaaa").unwrap();
        let a = RevisionId::next(Some(&parent), &json!({"v": 1}), false).unwrap();
        let b = RevisionId::next(Some(&parent), &json!({"v": 1}), false).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.generation(), 2);
        assert_eq!(a.hash().len(), 32);

        let deleted = RevisionId::next(Some(&parent), &json!({"v": 1}), true).unwrap();
        assert_ne!(a, deleted);
        let root = RevisionId::next(None, &json!({"v": 1}), false).unwrap();
        assert_eq!(root.generation(), 1);
    }

    #[test]
    fn test_generation_limits() {
        let err = RevisionId::parse("18446744073709551615-abc").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert!(RevisionId::new(MAX_GENERATION + 1, "abc").is_err());

        let last = RevisionId::new(MAX_GENERATION, "abc").unwrap();
        let err = RevisionId::next(Some(&last), &json!({}), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn test_ordering() {
        let a = RevisionId::parse("2-aaa").unwrap();
        let b = RevisionId::parse("2-bbb").unwrap();
        let c = RevisionId::parse("10-000").unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_serde_as_string() {
        let rev = RevisionId::parse("4-feed").unwrap();
        let json = serde_json::to_string(&rev).unwrap();
        assert_eq!(json, "\"4-feed\"");
        let back: RevisionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rev);
        assert!(serde_json::from_str::<RevisionId>("\"nope\"").is_err());
    }
}
