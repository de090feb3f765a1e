//! Search parameter management, extraction and query parsing.
//!
//! - [`registry`] - In-memory registry of active search parameters
//! - [`definitions`] - The built-in parameter table
//! - [`path`] - Interpreter for extraction paths
//! - [`reference`] - Canonicalization of reference encodings
//! - [`converters`] - Conversion of extracted elements into index values
//! - [`extractor`] - Extraction of every indexed value from a resource
//! - [`parser`] - Parsing of search requests into typed queries
//! - [`reindex`] - Background rebuild of the index
//! - [`subsetting`] - `_summary` and `_elements` reduction of documents
//! - [`errors`] - Search-specific error types
//!
//! # Parameter lifecycle
//!
//! ```text
//! 1. register(definition)
//!    └── registry revision bumped
//!    └── resources written afterwards are indexed with it
//!    └── existing resources are not (run a reindex)
//!
//! 2. reindex
//!    └── rebuilds index rows for existing resources, batch by batch
//!
//! 3. update_status(url, Retired)
//!    └── parameter no longer usable in searches or indexing
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use parking_lot::RwLock;
//! use helios_clinical_store::search::{SearchParameterExtractor, SearchParameterRegistry};
//! use serde_json::json;
//!
//! let registry = Arc::new(RwLock::new(SearchParameterRegistry::standard()));
//! let extractor = SearchParameterExtractor::new(registry);
//!
//! let patient = json!({"resourceType": "Patient", "name": [{"family": "Smith"}]});
//! let values = extractor.extract(&patient, "Patient").unwrap();
//! assert!(values.iter().any(|v| v.param_name == "family"));
//! ```

pub mod converters;
pub mod definitions;
pub mod errors;
pub mod extractor;
pub mod parser;
pub mod path;
pub mod reference;
pub mod registry;
pub mod reindex;
pub mod subsetting;

pub use converters::{IndexValue, ValueConverter, ValueShape};
pub use errors::{ExtractionError, RegistryError, ReindexError};
pub use extractor::{ExtractedValue, SearchParameterExtractor};
pub use parser::{MAX_CHAIN_DEPTH, QueryParser, normalize_criteria, parse_criteria};
pub use path::{PathExpr, PathMatch};
pub use reference::{ReferenceResolver, ReferenceTarget, ResolvedReference};
pub use registry::{
    RegistryUpdate, SearchParameterDefinition, SearchParameterRegistry, SearchParameterSource,
    SearchParameterStatus,
};
pub use reindex::{
    ReindexCursor, ReindexOperation, ReindexOutcome, ReindexProgress, ReindexRequest,
    ReindexStatus, ReindexTarget, ReindexableStorage,
};
pub use subsetting::{apply_elements, apply_summary};
