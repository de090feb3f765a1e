//! Search-specific error types.
//!
//! This module provides error types for search parameter operations:
//! - Registry operations
//! - Path evaluation and value conversion
//! - Reindexing operations

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, StorageError, ValidationError};

/// Error during registry operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryError {
    /// Parameter with this URL already exists.
    DuplicateUrl {
        /// The duplicate URL.
        url: String,
    },

    /// A parameter with the same code is already defined for the base type.
    DuplicateCode {
        /// The base resource type.
        resource_type: String,
        /// The parameter code.
        code: String,
    },

    /// Parameter not found in registry.
    NotFound {
        /// The URL or code that was not found.
        identifier: String,
    },

    /// Invalid parameter definition.
    InvalidDefinition {
        /// Description of the problem.
        message: String,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateUrl { url } => {
                write!(f, "search parameter with URL '{}' already exists", url)
            }
            RegistryError::DuplicateCode {
                resource_type,
                code,
            } => {
                write!(
                    f,
                    "search parameter '{}' is already defined for {}",
                    code, resource_type
                )
            }
            RegistryError::NotFound { identifier } => {
                write!(f, "search parameter '{}' not found", identifier)
            }
            RegistryError::InvalidDefinition { message } => {
                write!(f, "invalid search parameter definition: {}", message)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<RegistryError> for StorageError {
    fn from(err: RegistryError) -> Self {
        StorageError::Validation(ValidationError::InvalidResource {
            message: err.to_string(),
        })
    }
}

/// Error during value extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExtractionError {
    /// The path expression could not be parsed.
    InvalidPath {
        /// The path expression.
        path: String,
        /// What is wrong with it.
        message: String,
    },

    /// Value conversion failed.
    ConversionFailed {
        /// The parameter name.
        param_name: String,
        /// The expected type.
        expected_type: String,
        /// What was actually found.
        actual_value: String,
    },

    /// Resource is not a valid JSON object.
    InvalidResource {
        /// Description of the problem.
        message: String,
    },
}

impl fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionError::InvalidPath { path, message } => {
                write!(f, "invalid path '{}': {}", path, message)
            }
            ExtractionError::ConversionFailed {
                param_name,
                expected_type,
                actual_value,
            } => {
                write!(
                    f,
                    "cannot convert '{}' to {} for parameter '{}'",
                    actual_value, expected_type, param_name
                )
            }
            ExtractionError::InvalidResource { message } => {
                write!(f, "invalid resource: {}", message)
            }
        }
    }
}

impl std::error::Error for ExtractionError {}

impl From<ExtractionError> for StorageError {
    fn from(err: ExtractionError) -> Self {
        StorageError::Validation(ValidationError::InvalidResource {
            message: err.to_string(),
        })
    }
}

/// Error during reindex operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReindexError {
    /// Reindex job not found.
    JobNotFound {
        /// The job ID.
        job_id: String,
    },

    /// Reindex job already running.
    AlreadyRunning {
        /// The existing job ID.
        existing_job_id: String,
    },

    /// Storage error during reindex.
    StorageError {
        /// Error message.
        message: String,
    },
}

impl fmt::Display for ReindexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReindexError::JobNotFound { job_id } => {
                write!(f, "reindex job '{}' not found", job_id)
            }
            ReindexError::AlreadyRunning { existing_job_id } => {
                write!(f, "reindex job '{}' is already running", existing_job_id)
            }
            ReindexError::StorageError { message } => {
                write!(f, "storage error during reindex: {}", message)
            }
        }
    }
}

impl std::error::Error for ReindexError {}

impl From<StorageError> for ReindexError {
    fn from(err: StorageError) -> Self {
        ReindexError::StorageError {
            message: err.to_string(),
        }
    }
}

impl From<ReindexError> for StorageError {
    fn from(err: ReindexError) -> Self {
        StorageError::Backend(BackendError::Internal {
            backend_name: "reindex".to_string(),
            message: err.to_string(),
            source: None,
        })
    }
}
