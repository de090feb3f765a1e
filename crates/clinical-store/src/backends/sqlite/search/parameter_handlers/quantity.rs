//! Quantity parameter SQL handler.

use crate::error::SearchError;
use crate::types::{NumberRange, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam};
use super::NumberHandler;

/// Handles quantity parameter SQL generation.
pub struct QuantityHandler;

impl QuantityHandler {
    /// Builds SQL for a quantity parameter value.
    ///
    /// Values take the form `[prefix]number[|system[|code]]`. The number
    /// follows the number parameter rules. A code matches either the coded
    /// unit or the human-readable unit.
    pub fn build_sql(param_name: &str, value: &SearchValue) -> Result<SqlFragment, SearchError> {
        let mut parts = value.value.splitn(3, '|');
        let number = parts.next().unwrap_or_default();
        let system = parts.next().filter(|s| !s.is_empty());
        let code = parts.next().filter(|s| !s.is_empty());

        let range = NumberRange::parse(number).ok_or_else(|| SearchError::InvalidValue {
            parameter: param_name.to_string(),
            value: value.value.clone(),
            message: "expected number|system|code".to_string(),
        })?;

        let mut frag = NumberHandler::range_sql(value.prefix, &range, "value_quantity_value");
        if let Some(system) = system {
            frag = frag.and(SqlFragment::with_params(
                "value_quantity_system = ?",
                vec![SqlParam::string(system)],
            ));
        }
        if let Some(code) = code {
            frag = frag.and(SqlFragment::with_params(
                "(value_quantity_code = ? OR value_quantity_unit = ?)",
                vec![SqlParam::string(code), SqlParam::string(code)],
            ));
        }
        Ok(frag)
    }
}
