//! Reference parameter SQL handler.

use crate::search::{ReferenceResolver, ReferenceTarget};
use crate::types::{SearchModifier, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam};
use super::TokenHandler;

/// Handles reference parameter SQL generation.
pub struct ReferenceHandler;

impl ReferenceHandler {
    /// Builds SQL for a reference parameter value.
    ///
    /// The value is resolved the same way the indexer resolves stored
    /// references, so `Patient/1`, `1` (with a single declared target or a
    /// `:Type` modifier) and `http://host/fhir/Patient/1` all match the same
    /// rows. Rows whose stored type could not be determined match any type.
    ///
    /// `:identifier` searches logical references by `system|value`.
    pub fn build_sql(
        value: &SearchValue,
        modifier: Option<&SearchModifier>,
        targets: &[String],
    ) -> SqlFragment {
        if matches!(modifier, Some(SearchModifier::Identifier)) {
            return TokenHandler::build_sql(value, None);
        }

        let type_hint = match modifier {
            Some(SearchModifier::Type(t)) => Some(t.as_str()),
            _ => None,
        };

        match ReferenceResolver::new().resolve(&value.value, type_hint, targets) {
            ReferenceTarget::Local {
                resource_type: Some(resource_type),
                id,
                ..
            } => SqlFragment::with_params(
                "value_reference_id = ? AND (value_reference_type = ? OR value_reference_type IS NULL)",
                vec![SqlParam::string(id), SqlParam::string(resource_type)],
            ),
            ReferenceTarget::Local {
                resource_type: None,
                id,
                ..
            } => SqlFragment::with_params("value_reference_id = ?", vec![SqlParam::string(id)]),
            _ => SqlFragment::with_params(
                "value_reference = ?",
                vec![SqlParam::string(value.value.trim())],
            ),
        }
    }
}
