//! Core types for the clinical store.
//!
//! - [`StoredResource`] - a document with persistence metadata
//! - [`SearchParameter`], [`SearchQuery`] - search request types
//! - [`DateRange`], [`NumberRange`] - normalized comparison ranges
//! - [`Page`], [`PageCursor`] - pagination types
//!
//! # Examples
//!
//! ```
//! use helios_clinical_store::types::{
//!     SearchParamType, SearchParameter, SearchQuery, SearchValue, SortDirective,
//! };
//!
//! let query = SearchQuery::new("Patient")
//!     .with_parameter(SearchParameter::new(
//!         "name",
//!         SearchParamType::String,
//!         vec![SearchValue::eq("Smith")],
//!     ))
//!     .with_sort(SortDirective::parse("-_lastUpdated"))
//!     .with_count(20);
//!
//! assert_eq!(query.parameters.len(), 1);
//! ```

mod pagination;
mod search_params;
mod stored_resource;

pub use pagination::{CursorValue, Page, PageCursor, PageInfo, Pagination, PaginationMode};

pub use search_params::{
    ChainedParameter, DatePrecision, DateRange, IncludeDirective, IncludeType, NumberRange,
    ReverseChainedParameter, SearchModifier, SearchParamType, SearchParameter, SearchPrefix,
    SearchQuery, SearchValue, SortDirection, SortDirective, SummaryMode, TotalMode,
};

pub use stored_resource::{ReferenceWarning, ResourceMeta, ResourceMethod, StoredResource};
