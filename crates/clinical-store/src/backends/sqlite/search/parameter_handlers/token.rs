//! Token parameter SQL handler.

use crate::types::{SearchModifier, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam, escape_like};

/// Handles token parameter SQL generation.
pub struct TokenHandler;

impl TokenHandler {
    /// Builds SQL for a token parameter value.
    ///
    /// Token values can be:
    /// - `code` - matches the code in any system
    /// - `system|code` - matches system and code
    /// - `|code` - matches the code only when no system was recorded
    /// - `system|` - matches any code in the system
    ///
    /// `:text` matches the start of the display text instead.
    pub fn build_sql(value: &SearchValue, modifier: Option<&SearchModifier>) -> SqlFragment {
        if matches!(modifier, Some(SearchModifier::Text)) {
            return SqlFragment::with_params(
                "value_token_display LIKE ? || '%' ESCAPE '\\'",
                vec![SqlParam::string(escape_like(&value.value.to_lowercase()))],
            );
        }

        match value.value.split_once('|') {
            Some(("", code)) => SqlFragment::with_params(
                "value_token_system IS NULL AND value_token_code = ?",
                vec![SqlParam::string(code)],
            ),
            Some((system, "")) => SqlFragment::with_params(
                "value_token_system = ?",
                vec![SqlParam::string(system)],
            ),
            Some((system, code)) => SqlFragment::with_params(
                "value_token_system = ? AND value_token_code = ?",
                vec![SqlParam::string(system), SqlParam::string(code)],
            ),
            None => SqlFragment::with_params(
                "value_token_code = ?",
                vec![SqlParam::string(&value.value)],
            ),
        }
    }
}
