//! Shared test infrastructure for the clinical store integration tests.

#![allow(dead_code)]

pub mod fixtures;

pub use fixtures::*;

use helios_clinical_store::backends::sqlite::{SqliteBackend, SqliteBackendConfig};

/// A fresh in-memory backend with the schema in place.
pub fn create_backend() -> SqliteBackend {
    let backend = SqliteBackend::in_memory().expect("Failed to create SQLite backend");
    backend.init_schema().expect("Failed to initialize schema");
    backend
}

/// A fresh in-memory backend with a custom configuration.
pub fn create_backend_with(config: SqliteBackendConfig) -> SqliteBackend {
    let backend =
        SqliteBackend::with_config(":memory:", config).expect("Failed to create SQLite backend");
    backend.init_schema().expect("Failed to initialize schema");
    backend
}

/// Turns `("name", "value")` pairs into owned search parameters.
pub fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
