//! Public error taxonomy
//!
//! Every public operation resolves to a value or one `DbError` with a stable
//! kind. Backend failures are folded into `InfrastructureFailure` so callers
//! never see a raw rusqlite or serde error.

use serde::Serialize;

use crate::storage::StorageError;

/// Result type for database operations
pub type Result<T> = std::result::Result<T, DbError>;

/// Errors surfaced by the public `Database` API
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("infrastructure failure: {0}")]
    InfrastructureFailure(String),
}

/// Stable discriminator for `DbError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Conflict,
    InfrastructureFailure,
}

impl ErrorKind {
    /// Wire name of the kind
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InfrastructureFailure => "infrastructure_failure",
        }
    }

    /// HTTP-like status code
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::InfrastructureFailure => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::BadRequest(_) => ErrorKind::BadRequest,
            DbError::NotFound(_) => ErrorKind::NotFound,
            DbError::Conflict(_) => ErrorKind::Conflict,
            DbError::InfrastructureFailure(_) => ErrorKind::InfrastructureFailure,
        }
    }

    /// Human-readable reason without the kind prefix
    pub fn reason(&self) -> &str {
        match self {
            DbError::BadRequest(r)
            | DbError::NotFound(r)
            | DbError::Conflict(r)
            | DbError::InfrastructureFailure(r) => r,
        }
    }

    pub fn status(&self) -> u16 {
        self.kind().status()
    }

    /// Document update conflict, the common case for rejected edits
    pub fn rev_conflict() -> Self {
        DbError::Conflict("Document update conflict".to_string())
    }

    pub fn missing_doc() -> Self {
        DbError::NotFound("missing".to_string())
    }

    pub fn deleted_doc() -> Self {
        DbError::NotFound("deleted".to_string())
    }

    /// JSON body in the `{error, reason, status}` shape
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.kind().name(),
            "reason": self.reason(),
            "status": self.status(),
        })
    }
}

impl From<StorageError> for DbError {
    fn from(err: StorageError) -> Self {
        DbError::InfrastructureFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(DbError::rev_conflict().kind().name(), "conflict");
        assert_eq!(DbError::missing_doc().status(), 404);
        assert_eq!(DbError::BadRequest("x".into()).kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn test_storage_errors_become_infrastructure_failures() {
        let err: DbError = StorageError::Database("disk I/O error".into()).into();
        assert_eq!(err.kind(), ErrorKind::InfrastructureFailure);
        assert!(err.reason().contains("disk I/O error"));
    }

    #[test]
    fn test_json_shape() {
        let json = DbError::Conflict("nope".into()).to_json();
        assert_eq!(json["error"], "conflict");
        assert_eq!(json["reason"], "nope");
        assert_eq!(json["status"], 409);
    }
}
