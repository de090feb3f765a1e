//! URI parameter SQL handler.

use crate::types::{SearchModifier, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam};

/// Handles URI parameter SQL generation.
///
/// URIs compare case-sensitively, so prefix tests use `substr` rather than
/// `LIKE`.
pub struct UriHandler;

impl UriHandler {
    /// Builds SQL for a URI parameter value.
    ///
    /// - no modifier: exact match
    /// - `:below`: the stored URI starts with the value
    /// - `:above`: the value starts with the stored URI
    pub fn build_sql(value: &SearchValue, modifier: Option<&SearchModifier>) -> SqlFragment {
        let uri = &value.value;
        match modifier {
            Some(SearchModifier::Below) => SqlFragment::with_params(
                "substr(value_uri, 1, length(?)) = ?",
                vec![SqlParam::string(uri), SqlParam::string(uri)],
            ),
            Some(SearchModifier::Above) => SqlFragment::with_params(
                "substr(?, 1, length(value_uri)) = value_uri",
                vec![SqlParam::string(uri)],
            ),
            _ => SqlFragment::with_params("value_uri = ?", vec![SqlParam::string(uri)]),
        }
    }
}
