//! SQL generation for search queries.
//!
//! - [`query_builder`] turns a parsed query into a filter, sort keys and
//!   cursor conditions over the `resources` table
//! - [`parameter_handlers`] build the per-type conditions over one
//!   `search_index` row

pub mod parameter_handlers;
pub mod query_builder;

pub use query_builder::{QueryBuilder, SortKey, SqlFragment, SqlParam, cursor_condition, escape_like};
