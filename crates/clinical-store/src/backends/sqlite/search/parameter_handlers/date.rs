//! Date parameter SQL handler.

use crate::error::SearchError;
use crate::types::{DateRange, SearchPrefix, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam};

/// Handles date parameter SQL generation.
///
/// Both the stored value and the search value are ranges. A stored row
/// covers `[start_col, end_col]`; the search literal covers the range its
/// precision implies, so `2024-03` means the whole of March.
pub struct DateHandler;

impl DateHandler {
    /// Builds SQL for a date parameter value.
    ///
    /// | prefix | row matches when |
    /// |--------|------------------|
    /// | eq     | the row range lies inside the search range |
    /// | gt     | the row range ends after the search range |
    /// | lt     | the row range starts before the search range |
    /// | ge     | the row range ends at or after the search start |
    /// | le     | the row range starts at or before the search end |
    /// | sa     | the row range starts after the search range |
    /// | eb     | the row range ends before the search range |
    /// | ap     | the ranges overlap once the search range is widened |
    ///
    /// `ne` builds the `eq` condition; the caller negates it.
    pub fn build_sql(
        param_name: &str,
        value: &SearchValue,
        start_col: &str,
        end_col: &str,
    ) -> Result<SqlFragment, SearchError> {
        let range = DateRange::parse(&value.value).ok_or_else(|| SearchError::InvalidValue {
            parameter: param_name.to_string(),
            value: value.value.clone(),
            message: "expected a date, dateTime or instant".to_string(),
        })?;
        let start = SqlParam::string(range.start_key());
        let end = SqlParam::string(range.end_key());

        let frag = match value.prefix {
            SearchPrefix::Eq | SearchPrefix::Ne => SqlFragment::with_params(
                format!("{} >= ? AND {} <= ?", start_col, end_col),
                vec![start, end],
            ),
            SearchPrefix::Gt => SqlFragment::with_params(format!("{} > ?", end_col), vec![end]),
            SearchPrefix::Lt => SqlFragment::with_params(format!("{} < ?", start_col), vec![start]),
            SearchPrefix::Ge => SqlFragment::with_params(format!("{} >= ?", end_col), vec![start]),
            SearchPrefix::Le => SqlFragment::with_params(format!("{} <= ?", start_col), vec![end]),
            SearchPrefix::Sa => SqlFragment::with_params(format!("{} > ?", start_col), vec![end]),
            SearchPrefix::Eb => SqlFragment::with_params(format!("{} < ?", end_col), vec![start]),
            SearchPrefix::Ap => {
                let widened = range.widened();
                SqlFragment::with_params(
                    format!("{} <= ? AND {} >= ?", start_col, end_col),
                    vec![
                        SqlParam::string(widened.end_key()),
                        SqlParam::string(widened.start_key()),
                    ],
                )
            }
        };
        Ok(frag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(prefix: SearchPrefix, value: &str) -> SqlFragment {
        DateHandler::build_sql(
            "birthdate",
            &SearchValue::new(prefix, value),
            "value_date_start",
            "value_date_end",
        )
        .unwrap()
    }

    #[test]
    fn test_date_eq_day() {
        let frag = build(SearchPrefix::Eq, "2024-01-15");

        assert!(frag.sql.contains("value_date_start >= ?"));
        assert!(frag.sql.contains("value_date_end <= ?"));
        assert_eq!(
            frag.params,
            vec![
                SqlParam::string("2024-01-15T00:00:00.000"),
                SqlParam::string("2024-01-15T23:59:59.999"),
            ]
        );
    }

    #[test]
    fn test_date_eq_month_covers_month() {
        let frag = build(SearchPrefix::Eq, "2024-02");

        assert_eq!(frag.params[1], SqlParam::string("2024-02-29T23:59:59.999"));
    }

    #[test]
    fn test_date_gt_uses_range_end() {
        let frag = build(SearchPrefix::Gt, "2024");

        assert_eq!(frag.sql, "value_date_end > ?");
        assert_eq!(frag.params, vec![SqlParam::string("2024-12-31T23:59:59.999")]);
    }

    #[test]
    fn test_date_ge_and_le() {
        let ge = build(SearchPrefix::Ge, "2024-01-15");
        assert_eq!(ge.sql, "value_date_end >= ?");
        assert_eq!(ge.params, vec![SqlParam::string("2024-01-15T00:00:00.000")]);

        let le = build(SearchPrefix::Le, "2024-01-15");
        assert_eq!(le.sql, "value_date_start <= ?");
        assert_eq!(le.params, vec![SqlParam::string("2024-01-15T23:59:59.999")]);
    }

    #[test]
    fn test_date_with_offset_normalized_to_utc() {
        let frag = build(SearchPrefix::Lt, "2024-01-15T10:00:00+02:00");

        assert_eq!(frag.params, vec![SqlParam::string("2024-01-15T08:00:00.000")]);
    }

    #[test]
    fn test_date_ap_widens() {
        let frag = build(SearchPrefix::Ap, "2024-01-15");

        assert_eq!(
            frag.params,
            vec![
                SqlParam::string("2024-01-16T23:59:59.999"),
                SqlParam::string("2024-01-14T00:00:00.000"),
            ]
        );
    }

    #[test]
    fn test_date_invalid_value() {
        let err = DateHandler::build_sql(
            "birthdate",
            &SearchValue::eq("yesterday"),
            "value_date_start",
            "value_date_end",
        )
        .unwrap_err();

        assert!(matches!(err, SearchError::InvalidValue { .. }));
    }
}
