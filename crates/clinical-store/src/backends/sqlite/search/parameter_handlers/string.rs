//! String parameter SQL handler.

use crate::types::{SearchModifier, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam, escape_like};

/// Handles string parameter SQL generation.
///
/// `value_string` holds the lowercased form written by the indexer, so the
/// default and `:contains` matches are case-insensitive. `:exact` compares
/// against the untouched `value_string_raw`.
pub struct StringHandler;

impl StringHandler {
    /// Builds SQL for a string parameter value.
    pub fn build_sql(value: &SearchValue, modifier: Option<&SearchModifier>) -> SqlFragment {
        match modifier {
            Some(SearchModifier::Exact) => SqlFragment::with_params(
                "value_string_raw = ?",
                vec![SqlParam::string(&value.value)],
            ),
            Some(SearchModifier::Contains) => SqlFragment::with_params(
                "value_string LIKE '%' || ? || '%' ESCAPE '\\'",
                vec![SqlParam::string(escape_like(&value.value.to_lowercase()))],
            ),
            _ => SqlFragment::with_params(
                "value_string LIKE ? || '%' ESCAPE '\\'",
                vec![SqlParam::string(escape_like(&value.value.to_lowercase()))],
            ),
        }
    }
}
