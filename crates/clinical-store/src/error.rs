//! Error types for the clinical store.
//!
//! Errors are arranged as a hierarchy: [`StorageError`] wraps one enum per
//! category (resource state, concurrency, validation, search, transactions and
//! backend infrastructure). Expected outcomes such as a missing resource or a
//! version conflict are ordinary variants; only [`BackendError`] represents an
//! infrastructure failure.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use serde_json::{Value, json};
use thiserror::Error;

/// The primary error type for all storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Resource state errors
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Concurrency and versioning errors
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// Validation errors
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Search operation errors
    #[error(transparent)]
    Search(#[from] SearchError),

    /// Transaction errors
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Backend-specific errors
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Errors related to resource state.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// The requested resource was not found.
    #[error("resource not found: {resource_type}/{id}")]
    NotFound { resource_type: String, id: String },

    /// A resource with the given ID already exists.
    #[error("resource already exists: {resource_type}/{id}")]
    AlreadyExists { resource_type: String, id: String },

    /// The resource has been logically deleted.
    #[error("resource deleted: {resource_type}/{id}")]
    Gone {
        resource_type: String,
        id: String,
        deleted_at: Option<chrono::DateTime<chrono::Utc>>,
    },

    /// The requested version of the resource was not found.
    #[error("version not found: {resource_type}/{id}/_history/{version_id}")]
    VersionNotFound {
        resource_type: String,
        id: String,
        version_id: String,
    },

    /// Conditional criteria matched more than one resource.
    #[error("conditional criteria '{criteria}' on {resource_type} matched {count} resources")]
    AmbiguousConditionalMatch {
        resource_type: String,
        criteria: String,
        count: usize,
    },
}

/// Errors related to concurrency control.
#[derive(Error, Debug)]
pub enum ConcurrencyError {
    /// Version conflict detected during optimistic locking.
    #[error("version conflict: expected {expected_version}, found {actual_version}")]
    VersionConflict {
        resource_type: String,
        id: String,
        expected_version: String,
        actual_version: String,
    },

    /// The database stayed locked by another writer past the busy timeout.
    #[error("write lock on {resource_type}/{id} not acquired")]
    WriteContention { resource_type: String, id: String },
}

/// Errors related to resource validation.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// The resource failed a shape check.
    #[error("invalid resource: {message}")]
    InvalidResource { message: String },

    /// The resource type is not known to the store.
    #[error("unsupported resource type: {resource_type}")]
    UnsupportedResourceType { resource_type: String },

    /// Missing required field.
    #[error("missing required field: {field}")]
    MissingRequiredField { field: String },

    /// Invalid reference format.
    #[error("invalid reference: {reference}: {message}")]
    InvalidReference { reference: String, message: String },

    /// The logical id does not satisfy the id grammar.
    #[error("invalid resource id: '{id}'")]
    InvalidId { id: String },
}

/// Errors related to search operations.
#[derive(Error, Debug)]
pub enum SearchError {
    /// The parameter is not defined for the resource type.
    #[error("unknown search parameter '{parameter}' for {resource_type}")]
    UnknownParameter {
        resource_type: String,
        parameter: String,
    },

    /// The search modifier is not supported for this parameter type.
    #[error("unsupported modifier '{modifier}' for parameter type '{param_type}'")]
    UnsupportedModifier {
        modifier: String,
        param_type: String,
    },

    /// The comparison prefix is not supported for this parameter type.
    #[error("unsupported prefix '{prefix}' for parameter type '{param_type}'")]
    UnsupportedPrefix { prefix: String, param_type: String },

    /// The value cannot be interpreted for the parameter type.
    #[error("invalid value '{value}' for parameter '{parameter}': {message}")]
    InvalidValue {
        parameter: String,
        value: String,
        message: String,
    },

    /// A chained or reverse-chained expression is malformed.
    #[error("invalid chain '{chain}': {message}")]
    InvalidChain { chain: String, message: String },

    /// Invalid cursor for pagination.
    #[error("invalid pagination cursor: {cursor}")]
    InvalidCursor { cursor: String },

    /// The query ran past the configured timeout.
    #[error("search timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
}

/// Errors related to transactions.
#[derive(Error, Debug)]
pub enum TransactionError {
    /// A transaction bundle entry failed and every entry was rolled back.
    #[error("transaction aborted at entry {index}: {source}")]
    Aborted {
        index: usize,
        #[source]
        source: Box<StorageError>,
    },

    /// Transaction was rolled back.
    #[error("transaction rolled back: {reason}")]
    RolledBack { reason: String },

    /// Transaction is no longer valid (already committed or rolled back).
    #[error("transaction no longer valid")]
    InvalidTransaction,

    /// The bundle itself is malformed.
    #[error("invalid bundle: {message}")]
    InvalidBundle { message: String },
}

/// Errors originating from the database backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Connection to the backend failed.
    #[error("connection failed to {backend_name}: {message}")]
    ConnectionFailed {
        backend_name: String,
        message: String,
    },

    /// Connection pool exhausted.
    #[error("connection pool exhausted for {backend_name}")]
    PoolExhausted { backend_name: String },

    /// Schema migration error.
    #[error("schema migration failed: {message}")]
    MigrationError { message: String },

    /// Internal backend error.
    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Returns true for a missing, deleted or unknown-version resource.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::Resource(
                ResourceError::NotFound { .. }
                    | ResourceError::Gone { .. }
                    | ResourceError::VersionNotFound { .. }
            )
        )
    }

    /// Returns true for optimistic concurrency failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Concurrency(_))
    }

    /// Returns true only for infrastructure failures.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::Backend(_))
    }

    /// The HTTP status a transport layer reports for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            StorageError::Resource(e) => match e {
                ResourceError::NotFound { .. } | ResourceError::VersionNotFound { .. } => 404,
                ResourceError::Gone { .. } => 410,
                ResourceError::AlreadyExists { .. } => 409,
                ResourceError::AmbiguousConditionalMatch { .. } => 412,
            },
            StorageError::Concurrency(ConcurrencyError::VersionConflict { .. }) => 412,
            StorageError::Concurrency(ConcurrencyError::WriteContention { .. }) => 409,
            StorageError::Validation(_) => 400,
            StorageError::Search(SearchError::Timeout { .. }) => 408,
            StorageError::Search(_) => 400,
            StorageError::Transaction(TransactionError::Aborted { source, .. }) => {
                source.http_status()
            }
            StorageError::Transaction(TransactionError::InvalidBundle { .. }) => 400,
            StorageError::Transaction(_) => 500,
            StorageError::Backend(_) => 500,
        }
    }

    /// The OperationOutcome issue code for this error.
    pub fn issue_code(&self) -> &'static str {
        match self {
            StorageError::Resource(ResourceError::NotFound { .. })
            | StorageError::Resource(ResourceError::VersionNotFound { .. }) => "not-found",
            StorageError::Resource(ResourceError::Gone { .. }) => "deleted",
            StorageError::Resource(ResourceError::AlreadyExists { .. }) => "duplicate",
            StorageError::Resource(ResourceError::AmbiguousConditionalMatch { .. }) => {
                "multiple-matches"
            }
            StorageError::Concurrency(_) => "conflict",
            StorageError::Validation(_) => "invalid",
            StorageError::Search(SearchError::Timeout { .. }) => "timeout",
            StorageError::Search(_) => "invalid",
            StorageError::Transaction(TransactionError::Aborted { source, .. }) => {
                source.issue_code()
            }
            StorageError::Transaction(_) => "transient",
            StorageError::Backend(_) => "exception",
        }
    }

    /// Renders this error as a FHIR OperationOutcome.
    pub fn to_operation_outcome(&self) -> Value {
        let mut issue = json!({
            "severity": if self.is_fatal() { "fatal" } else { "error" },
            "code": self.issue_code(),
            "diagnostics": self.to_string(),
        });
        if let StorageError::Transaction(TransactionError::Aborted { index, .. }) = self {
            issue["expression"] = json!([format!("Bundle.entry[{}]", index)]);
        }
        json!({
            "resourceType": "OperationOutcome",
            "issue": [issue],
        })
    }
}

pub(crate) fn internal_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::Internal {
        backend_name: "sqlite".to_string(),
        message,
        source: None,
    })
}

pub(crate) fn serialization_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::SerializationError { message })
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Backend(BackendError::SerializationError {
            message: err.to_string(),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        // Raised when the query deadline's progress handler fires.
        if let rusqlite::Error::SqliteFailure(ref failure, _) = err {
            if failure.code == rusqlite::ErrorCode::OperationInterrupted {
                return StorageError::Search(SearchError::Timeout { elapsed_ms: 0 });
            }
        }
        StorageError::Backend(BackendError::Internal {
            backend_name: "sqlite".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<r2d2::Error> for StorageError {
    fn from(_err: r2d2::Error) -> Self {
        StorageError::Backend(BackendError::PoolExhausted {
            backend_name: "sqlite".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Resource(ResourceError::NotFound {
            resource_type: "Patient".to_string(),
            id: "123".to_string(),
        });
        assert_eq!(err.to_string(), "resource not found: Patient/123");
        assert!(err.is_not_found());
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn test_concurrency_error_display() {
        let err = ConcurrencyError::VersionConflict {
            resource_type: "Patient".to_string(),
            id: "123".to_string(),
            expected_version: "1".to_string(),
            actual_version: "2".to_string(),
        };
        assert_eq!(err.to_string(), "version conflict: expected 1, found 2");
        assert!(StorageError::from(err).is_conflict());
    }

    #[test]
    fn test_gone_counts_as_not_found() {
        let err = StorageError::Resource(ResourceError::Gone {
            resource_type: "Patient".to_string(),
            id: "1".to_string(),
            deleted_at: None,
        });
        assert!(err.is_not_found());
        assert_eq!(err.http_status(), 410);
    }

    #[test]
    fn test_aborted_outcome_names_entry() {
        let inner = StorageError::Validation(ValidationError::MissingRequiredField {
            field: "resourceType".to_string(),
        });
        let err = StorageError::Transaction(TransactionError::Aborted {
            index: 3,
            source: Box::new(inner),
        });

        assert_eq!(err.http_status(), 400);
        let outcome = err.to_operation_outcome();
        assert_eq!(outcome["resourceType"], "OperationOutcome");
        assert_eq!(outcome["issue"][0]["code"], "invalid");
        assert_eq!(outcome["issue"][0]["expression"][0], "Bundle.entry[3]");
        assert!(
            outcome["issue"][0]["diagnostics"]
                .as_str()
                .unwrap()
                .contains("entry 3")
        );
    }

    #[test]
    fn test_backend_errors_are_fatal() {
        let err = internal_error("disk gone".to_string());
        assert!(err.is_fatal());
        assert_eq!(err.to_operation_outcome()["issue"][0]["severity"], "fatal");

        let search = StorageError::Search(SearchError::Timeout { elapsed_ms: 10 });
        assert!(!search.is_fatal());
        assert_eq!(search.issue_code(), "timeout");
    }
}
