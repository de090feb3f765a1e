//! Helios Clinical Store
//!
//! A versioned store for clinical JSON documents (Patient, Observation,
//! Encounter, ...) with a derived search index. Every write keeps the
//! document, its version history and its index rows consistent in one
//! database transaction.
//!
//! # Features
//!
//! - **Versioning**: every write produces a new immutable version; deletes
//!   leave tombstones; vread and history read them back
//! - **Conditional writes**: create, update, delete and patch by criteria
//! - **Search**: string, token, date, number, quantity, reference, uri and
//!   composite parameters with modifiers, prefixes, chains, `_has`,
//!   `_include`/`_revinclude`, `_sort`, cursor paging and totals
//! - **Bundles**: atomic transactions with placeholder references, and
//!   batches with independent entries
//! - **Events**: one change event per committed write
//! - **Reindex**: resumable rebuild after search parameters change
//!
//! # Backend Features
//!
//! - `sqlite` (default) - SQLite with in-memory and file modes
//!
//! # Architecture
//!
//! - [`types`] - Stored resources, search queries and pagination
//! - [`error`] - Error taxonomy for all operations
//! - [`core`] - Storage traits
//! - [`search`] - Parameter registry, extraction, query parsing, reindex
//! - [`cache`] - Read-through cache of resource versions
//! - [`events`] - Post-commit change notifications
//! - [`backends`] - Backend implementations
//!
//! # Quick Start
//!
//! ```no_run
//! use helios_clinical_store::backends::sqlite::SqliteBackend;
//! use helios_clinical_store::core::{ResourceStorage, SearchProvider};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = SqliteBackend::in_memory()?;
//! backend.init_schema()?;
//!
//! backend
//!     .create(
//!         "Patient",
//!         json!({"resourceType": "Patient", "id": "p1", "name": [{"family": "Smith"}]}),
//!     )
//!     .await?;
//!
//! let result = backend
//!     .search_params("Patient", &[("family".to_string(), "smi".to_string())])
//!     .await?;
//! assert_eq!(result.resources.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Search
//!
//! Queries can also be built directly:
//!
//! ```
//! use helios_clinical_store::types::{
//!     IncludeDirective, IncludeType, SearchModifier, SearchParamType, SearchParameter,
//!     SearchQuery, SearchValue, SortDirective,
//! };
//!
//! let query = SearchQuery::new("Observation")
//!     .with_parameter(
//!         SearchParameter::new("code", SearchParamType::Token, vec![SearchValue::eq("http://loinc.org|8867-4")]),
//!     )
//!     .with_parameter(
//!         SearchParameter::new("subject", SearchParamType::Reference, vec![SearchValue::eq("Patient/p1")])
//!             .with_modifier(SearchModifier::Type("Patient".to_string())),
//!     )
//!     .with_include(IncludeDirective {
//!         include_type: IncludeType::Include,
//!         source_type: "Observation".to_string(),
//!         search_param: "subject".to_string(),
//!         target_type: Some("Patient".to_string()),
//!         iterate: false,
//!     })
//!     .with_sort(SortDirective::parse("-date"))
//!     .with_count(50);
//!
//! assert_eq!(query.parameters.len(), 2);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backends;
pub mod cache;
pub mod core;
pub mod error;
pub mod events;
pub mod search;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{StorageError, StorageResult};
pub use types::{Pagination, SearchQuery, StoredResource};

// Re-export core traits
pub use core::{
    BundleProvider, ChainedSearchProvider, ConditionalStorage, IncludeProvider,
    InstanceHistoryProvider, ResourceStorage, RevincludeProvider, SearchProvider, Transaction,
    TransactionProvider, TypeHistoryProvider, VersionedStorage,
};

pub use events::{ChangeKind, ResourceChangeEvent, ResourceChangePublisher};

#[cfg(feature = "sqlite")]
pub use backends::sqlite::{SqliteBackend, SqliteBackendConfig};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
