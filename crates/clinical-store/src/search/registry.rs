//! Search parameter registry.
//!
//! The registry maintains an in-memory table of all search parameters,
//! indexed by both (resource_type, param_code) and canonical URL. It starts
//! from the standard table in [`super::definitions`]; custom parameters can
//! be registered at runtime. Every change bumps [`SearchParameterRegistry::revision`],
//! which tells a reindex job that existing index rows are stale.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::SearchParamType;

use super::converters::ValueShape;
use super::definitions::standard_definitions;
use super::errors::RegistryError;
use super::path::PathExpr;

/// Base type of parameters that apply to every resource type.
pub const RESOURCE_BASE: &str = "Resource";

/// Status of a search parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchParameterStatus {
    /// Active - can be used in searches.
    #[default]
    Active,
    /// Draft - informational, not yet active.
    Draft,
    /// Retired - disabled, not usable.
    Retired,
}

impl SearchParameterStatus {
    /// Returns true if this status allows the parameter to be used in searches.
    pub fn is_usable(&self) -> bool {
        *self == SearchParameterStatus::Active
    }
}

/// Source of a search parameter definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchParameterSource {
    /// Built-in standard parameters.
    #[default]
    Embedded,
    /// Registered at runtime.
    Custom,
}

/// Complete definition of a search parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParameterDefinition {
    /// Canonical URL (unique identifier).
    pub url: String,

    /// Parameter code (the query parameter name, e.g., "name", "identifier").
    pub code: String,

    /// The parameter type.
    pub param_type: SearchParamType,

    /// Extraction path. Empty for parameters answered from resource metadata.
    pub expression: String,

    /// Resource types this parameter applies to.
    pub base: Vec<String>,

    /// Target resource types (for reference parameters).
    pub target: Option<Vec<String>>,

    /// Shape of the element the path lands on, when fixed.
    pub shape: Option<ValueShape>,

    /// Current status.
    pub status: SearchParameterStatus,

    /// Source of this definition.
    pub source: SearchParameterSource,
}

impl SearchParameterDefinition {
    /// Creates a new definition.
    pub fn new(
        url: impl Into<String>,
        code: impl Into<String>,
        param_type: SearchParamType,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            code: code.into(),
            param_type,
            expression: expression.into(),
            base: Vec::new(),
            target: None,
            shape: None,
            status: SearchParameterStatus::Active,
            source: SearchParameterSource::Custom,
        }
    }

    /// Sets the base resource types.
    pub fn with_base<I, S>(mut self, base: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base = base.into_iter().map(Into::into).collect();
        self
    }

    /// Sets target types for reference parameters.
    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target = Some(targets.into_iter().map(Into::into).collect());
        self
    }

    /// Fixes the element shape.
    pub fn with_shape(mut self, shape: ValueShape) -> Self {
        self.shape = Some(shape);
        self
    }

    /// Sets the source.
    pub fn with_source(mut self, source: SearchParameterSource) -> Self {
        self.source = source;
        self
    }

    /// Declared reference target types.
    pub fn targets(&self) -> &[String] {
        self.target.as_deref().unwrap_or_default()
    }

    /// Returns true if a reference to `resource_type` may be indexed.
    ///
    /// A parameter without declared targets accepts any type.
    pub fn allows_target(&self, resource_type: &str) -> bool {
        let targets = self.targets();
        targets.is_empty() || targets.iter().any(|t| t == resource_type)
    }

    /// Returns true for parameters answered from the resource table
    /// (`_id`, `_lastUpdated`) rather than the index.
    pub fn is_metadata(&self) -> bool {
        self.expression.is_empty()
    }

    /// Compiles the extraction path.
    pub fn path(&self) -> Result<PathExpr, super::errors::ExtractionError> {
        PathExpr::parse(&self.expression)
    }
}

/// Update notification for registry changes.
#[derive(Debug, Clone)]
pub enum RegistryUpdate {
    /// A parameter was added.
    Added(String),
    /// A parameter's status changed.
    StatusChanged(String, SearchParameterStatus),
}

/// In-memory registry of search parameter definitions.
///
/// Provides fast lookup by (resource_type, param_code). URLs identify
/// definitions for registration and status changes. Subscribers hear about
/// every change.
pub struct SearchParameterRegistry {
    /// Parameters indexed by (resource_type, param_code).
    params_by_type: HashMap<String, HashMap<String, Arc<SearchParameterDefinition>>>,

    /// Parameters indexed by canonical URL.
    params_by_url: HashMap<String, Arc<SearchParameterDefinition>>,

    /// Bumped on every change to the set of active parameters.
    revision: u64,

    /// Notification channel for registry updates.
    update_tx: broadcast::Sender<RegistryUpdate>,
}

impl SearchParameterRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        let (update_tx, _) = broadcast::channel(64);
        Self {
            params_by_type: HashMap::new(),
            params_by_url: HashMap::new(),
            revision: 0,
            update_tx,
        }
    }

    /// Creates a registry holding the standard parameter table.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for param in standard_definitions() {
            registry.register_internal(param);
        }
        registry
    }

    /// Returns the number of registered parameters.
    pub fn len(&self) -> usize {
        self.params_by_url.len()
    }

    /// Returns true if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.params_by_url.is_empty()
    }

    /// The current revision. Starts at 0 for the standard table.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Gets all active parameters that apply to a resource type, including
    /// the `Resource`-level ones.
    pub fn get_active_params(&self, resource_type: &str) -> Vec<Arc<SearchParameterDefinition>> {
        let own = self.params_by_type.get(resource_type);
        let common = self.params_by_type.get(RESOURCE_BASE);
        let mut params: Vec<_> = own
            .into_iter()
            .chain(common)
            .flat_map(|params| params.values())
            .filter(|p| p.status.is_usable())
            .cloned()
            .collect();
        params.sort_by(|a, b| a.code.cmp(&b.code));
        params.dedup_by(|a, b| a.code == b.code);
        params
    }

    /// Gets a parameter by resource type and code, falling back to the
    /// `Resource`-level parameters.
    pub fn get_param(
        &self,
        resource_type: &str,
        code: &str,
    ) -> Option<Arc<SearchParameterDefinition>> {
        self.params_by_type
            .get(resource_type)
            .and_then(|params| params.get(code))
            .or_else(|| {
                self.params_by_type
                    .get(RESOURCE_BASE)
                    .and_then(|params| params.get(code))
            })
            .cloned()
    }

    /// Gets an active parameter by resource type and code.
    pub fn get_active_param(
        &self,
        resource_type: &str,
        code: &str,
    ) -> Option<Arc<SearchParameterDefinition>> {
        self.get_param(resource_type, code)
            .filter(|p| p.status.is_usable())
    }

    /// Returns true if the type has parameters of its own, which is what
    /// makes it storable.
    pub fn is_known_type(&self, resource_type: &str) -> bool {
        resource_type != RESOURCE_BASE && self.params_by_type.contains_key(resource_type)
    }

    /// Registers a new parameter.
    ///
    /// Resources stored before the registration are not indexed for it
    /// until they are reindexed.
    pub fn register(&mut self, param: SearchParameterDefinition) -> Result<(), RegistryError> {
        if self.params_by_url.contains_key(&param.url) {
            return Err(RegistryError::DuplicateUrl { url: param.url });
        }
        if param.base.is_empty() {
            return Err(RegistryError::InvalidDefinition {
                message: format!("'{}' has no base resource type", param.code),
            });
        }
        if let Err(e) = param.path() {
            return Err(RegistryError::InvalidDefinition {
                message: e.to_string(),
            });
        }
        for base in &param.base {
            if self
                .params_by_type
                .get(base)
                .is_some_and(|params| params.contains_key(&param.code))
            {
                return Err(RegistryError::DuplicateCode {
                    resource_type: base.clone(),
                    code: param.code,
                });
            }
        }

        let url = param.url.clone();
        tracing::info!(url = %url, code = %param.code, "registered search parameter");
        self.register_internal(param);
        self.revision += 1;
        let _ = self.update_tx.send(RegistryUpdate::Added(url));

        Ok(())
    }

    /// Internal registration without duplicate checking.
    fn register_internal(&mut self, param: SearchParameterDefinition) {
        let param = Arc::new(param);

        self.params_by_url
            .insert(param.url.clone(), Arc::clone(&param));

        for base in &param.base {
            self.params_by_type
                .entry(base.clone())
                .or_default()
                .insert(param.code.clone(), Arc::clone(&param));
        }
    }

    /// Updates a parameter's status.
    pub fn update_status(
        &mut self,
        url: &str,
        status: SearchParameterStatus,
    ) -> Result<(), RegistryError> {
        let old_param = self
            .params_by_url
            .get(url)
            .ok_or_else(|| RegistryError::NotFound {
                identifier: url.to_string(),
            })?;

        let mut new_def = (**old_param).clone();
        new_def.status = status;
        let new_param = Arc::new(new_def);

        self.params_by_url
            .insert(url.to_string(), Arc::clone(&new_param));

        for base in &new_param.base {
            if let Some(type_params) = self.params_by_type.get_mut(base) {
                type_params.insert(new_param.code.clone(), Arc::clone(&new_param));
            }
        }

        self.revision += 1;
        let _ = self
            .update_tx
            .send(RegistryUpdate::StatusChanged(url.to_string(), status));

        Ok(())
    }

    /// Subscribes to registry updates.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryUpdate> {
        self.update_tx.subscribe()
    }

    /// Returns all storable resource types, sorted.
    pub fn resource_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .params_by_type
            .keys()
            .filter(|t| t.as_str() != RESOURCE_BASE)
            .cloned()
            .collect();
        types.sort();
        types
    }
}

impl Default for SearchParameterRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for SearchParameterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchParameterRegistry")
            .field("params_count", &self.params_by_url.len())
            .field("revision", &self.revision)
            .finish()
    }
}
