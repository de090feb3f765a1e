//! Number parameter SQL handler.

use crate::error::SearchError;
use crate::types::{NumberRange, SearchPrefix, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam};

/// Handles number parameter SQL generation.
pub struct NumberHandler;

impl NumberHandler {
    /// Builds SQL for a number parameter value against `column`.
    ///
    /// `eq` honors the implicit precision of the literal: `100` matches
    /// `[99.5, 100.5)`. `ap` allows 10% of the value either side.
    pub fn build_sql(
        param_name: &str,
        value: &SearchValue,
        column: &str,
    ) -> Result<SqlFragment, SearchError> {
        let range = NumberRange::parse(&value.value).ok_or_else(|| SearchError::InvalidValue {
            parameter: param_name.to_string(),
            value: value.value.clone(),
            message: "expected a decimal number".to_string(),
        })?;
        Ok(Self::range_sql(value.prefix, &range, column))
    }

    /// The comparison for an already parsed value.
    pub(crate) fn range_sql(prefix: SearchPrefix, range: &NumberRange, column: &str) -> SqlFragment {
        let compare = |op: &str, bound: f64| {
            SqlFragment::with_params(format!("{} {} ?", column, op), vec![SqlParam::float(bound)])
        };

        match prefix {
            SearchPrefix::Eq | SearchPrefix::Ne => SqlFragment::with_params(
                format!("{} >= ? AND {} < ?", column, column),
                vec![SqlParam::float(range.low), SqlParam::float(range.high)],
            ),
            SearchPrefix::Gt | SearchPrefix::Sa => compare(">", range.value),
            SearchPrefix::Lt | SearchPrefix::Eb => compare("<", range.value),
            SearchPrefix::Ge => compare(">=", range.value),
            SearchPrefix::Le => compare("<=", range.value),
            SearchPrefix::Ap => {
                let delta = (range.value.abs() * 0.1).max(range.high - range.low);
                SqlFragment::with_params(
                    format!("{} >= ? AND {} <= ?", column, column),
                    vec![
                        SqlParam::float(range.value - delta),
                        SqlParam::float(range.value + delta),
                    ],
                )
            }
        }
    }
}
