//! Search parameter value extractor.
//!
//! Evaluates every active parameter's path against a resource and converts
//! the matches into index values.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::types::SearchParamType;

use super::converters::{IndexValue, ValueConverter};
use super::errors::ExtractionError;
use super::reference::ReferenceResolver;
use super::registry::{SearchParameterDefinition, SearchParameterRegistry};

/// A value extracted from a resource for indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedValue {
    /// The parameter name (e.g., "name", "identifier").
    pub param_name: String,

    /// The parameter type.
    pub param_type: SearchParamType,

    /// The extracted and converted value.
    pub value: IndexValue,
}

impl ExtractedValue {
    /// Creates a new extracted value.
    pub fn new(param_name: impl Into<String>, param_type: SearchParamType, value: IndexValue) -> Self {
        Self {
            param_name: param_name.into(),
            param_type,
            value,
        }
    }
}

/// Extracts searchable values from resources.
#[derive(Clone)]
pub struct SearchParameterExtractor {
    registry: Arc<RwLock<SearchParameterRegistry>>,
    resolver: ReferenceResolver,
}

impl SearchParameterExtractor {
    /// Creates a new extractor with the given registry.
    pub fn new(registry: Arc<RwLock<SearchParameterRegistry>>) -> Self {
        Self {
            registry,
            resolver: ReferenceResolver::new(),
        }
    }

    /// The registry this extractor reads.
    pub fn registry(&self) -> &Arc<RwLock<SearchParameterRegistry>> {
        &self.registry
    }

    /// Extracts all searchable values from a resource.
    ///
    /// Returns values for all active search parameters that apply to this
    /// resource type. A parameter whose values cannot be converted is
    /// skipped with a warning; the other parameters are still extracted.
    pub fn extract(
        &self,
        resource: &Value,
        resource_type: &str,
    ) -> Result<Vec<ExtractedValue>, ExtractionError> {
        let obj = resource
            .as_object()
            .ok_or_else(|| ExtractionError::InvalidResource {
                message: "Resource must be a JSON object".to_string(),
            })?;

        if let Some(rt) = obj.get("resourceType").and_then(|v| v.as_str()) {
            if rt != resource_type {
                return Err(ExtractionError::InvalidResource {
                    message: format!(
                        "Resource type mismatch: expected {}, got {}",
                        resource_type, rt
                    ),
                });
            }
        }

        let params = {
            let registry = self.registry.read();
            registry.get_active_params(resource_type)
        };

        let mut results = Vec::new();
        for param in params.iter().filter(|p| !p.is_metadata()) {
            match self.extract_for_param(resource, param) {
                Ok(values) => results.extend(values),
                Err(e) => {
                    tracing::warn!(
                        resource_type = %resource_type,
                        parameter = %param.code,
                        error = %e,
                        "failed to extract values for parameter"
                    );
                }
            }
        }

        Ok(results)
    }

    /// Extracts values for a specific parameter from a resource.
    pub fn extract_for_param(
        &self,
        resource: &Value,
        param: &SearchParameterDefinition,
    ) -> Result<Vec<ExtractedValue>, ExtractionError> {
        let path = param.path()?;
        let mut results = Vec::new();
        for m in path.evaluate(resource) {
            for value in ValueConverter::convert(&m, param, &self.resolver)? {
                results.push(ExtractedValue::new(&param.code, param.param_type, value));
            }
        }
        Ok(results)
    }
}

impl std::fmt::Debug for SearchParameterExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchParameterExtractor").finish()
    }
}
