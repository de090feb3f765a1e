//! Stored resource types.
//!
//! This module defines the [`StoredResource`] type, which wraps a clinical
//! document with persistence metadata such as version and timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A document with persistence metadata.
///
/// A `StoredResource` is either a live version (content holds the document)
/// or a tombstone written by a delete (content is `null`, `deleted_at` set).
/// `(resource_type, id, version_id)` identifies exactly one immutable state.
///
/// # Examples
///
/// ```
/// use helios_clinical_store::types::StoredResource;
/// use serde_json::json;
///
/// let resource = StoredResource::new(
///     "Patient",
///     "123",
///     json!({"resourceType": "Patient", "id": "123"}),
/// );
///
/// assert_eq!(resource.url(), "Patient/123");
/// assert_eq!(resource.version_id(), "1");
/// assert_eq!(resource.etag(), "W/\"1\"");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResource {
    /// The resource type (e.g., "Patient", "Observation").
    resource_type: String,

    /// The resource's logical ID.
    id: String,

    /// The version ID (monotonically increasing).
    version_id: String,

    /// The document, or `null` for a tombstone.
    content: Value,

    /// When this version was written.
    last_modified: DateTime<Utc>,

    /// If this version is a tombstone, when the delete happened.
    deleted_at: Option<DateTime<Utc>>,

    /// ETag derived from version_id.
    etag: String,

    /// Operation that produced this version.
    method: Option<ResourceMethod>,

    /// Non-fatal reference findings raised while writing this version.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<ReferenceWarning>,
}

/// Operation that created a resource version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceMethod {
    /// Resource was created via POST.
    Post,
    /// Resource was created/updated via PUT.
    Put,
    /// Resource was updated via PATCH.
    Patch,
    /// Resource was deleted via DELETE.
    Delete,
}

impl ResourceMethod {
    /// Parses the value kept in the history table.
    pub fn from_column(s: &str) -> Option<Self> {
        match s {
            "POST" => Some(ResourceMethod::Post),
            "PUT" => Some(ResourceMethod::Put),
            "PATCH" => Some(ResourceMethod::Patch),
            "DELETE" => Some(ResourceMethod::Delete),
            _ => None,
        }
    }

    /// The value kept in the history table.
    pub fn as_column(&self) -> &'static str {
        match self {
            ResourceMethod::Post => "POST",
            ResourceMethod::Put => "PUT",
            ResourceMethod::Patch => "PATCH",
            ResourceMethod::Delete => "DELETE",
        }
    }
}

/// A reference that was stored but could not be confirmed.
///
/// References are eventually consistent: a dangling target is accepted and
/// reported here instead of failing the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceWarning {
    /// Search parameter the reference was indexed under.
    pub parameter: String,
    /// The reference string as written in the document.
    pub reference: String,
    /// What was wrong with it.
    pub message: String,
}

impl StoredResource {
    /// Creates a first version of a resource stamped with the current time.
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>, content: Value) -> Self {
        Self::from_storage(resource_type, id, "1", content, Utc::now(), None)
    }

    /// Creates a stored resource from existing data (e.g., loaded from database).
    pub fn from_storage(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        version_id: impl Into<String>,
        content: Value,
        last_modified: DateTime<Utc>,
        deleted_at: Option<DateTime<Utc>>,
    ) -> Self {
        let version_id = version_id.into();
        let etag = format!("W/\"{}\"", version_id);

        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version_id,
            content,
            last_modified,
            deleted_at,
            etag,
            method: None,
            warnings: Vec::new(),
        }
    }

    /// Sets the operation that produced this version.
    pub fn with_method(mut self, method: ResourceMethod) -> Self {
        self.method = Some(method);
        self
    }

    /// Attaches reference warnings.
    pub fn with_warnings(mut self, warnings: Vec<ReferenceWarning>) -> Self {
        self.warnings = warnings;
        self
    }

    /// Replaces the document, keeping version metadata.
    pub fn map_content(mut self, f: impl FnOnce(&Value) -> Value) -> Self {
        self.content = f(&self.content);
        self
    }

    /// Returns the resource type.
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Returns the resource's logical ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the version ID.
    pub fn version_id(&self) -> &str {
        &self.version_id
    }

    /// Returns the version as a number.
    pub fn version_number(&self) -> u64 {
        self.version_id.parse().unwrap_or(0)
    }

    /// Returns the document (or `null` for a tombstone).
    pub fn content(&self) -> &Value {
        &self.content
    }

    /// Consumes self and returns the content.
    pub fn into_content(self) -> Value {
        self.content
    }

    /// Returns when this version was written.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Returns when the resource was deleted, if this is a tombstone.
    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    /// Returns `true` if this version is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Returns the ETag.
    pub fn etag(&self) -> &str {
        &self.etag
    }

    /// Returns the operation that created this version, when known.
    pub fn method(&self) -> Option<ResourceMethod> {
        self.method
    }

    /// Returns reference warnings raised by the write that produced this value.
    pub fn warnings(&self) -> &[ReferenceWarning] {
        &self.warnings
    }

    /// Returns the relative URL for this resource (e.g., "Patient/123").
    pub fn url(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    /// Returns the versioned URL path (e.g., "Patient/123/_history/1").
    pub fn versioned_url(&self) -> String {
        format!("{}/{}/_history/{}", self.resource_type, self.id, self.version_id)
    }

    /// Checks if the given ETag or bare version matches this resource.
    pub fn matches_etag(&self, etag: &str) -> bool {
        crate::core::normalize_etag(&self.etag) == crate::core::normalize_etag(etag)
    }

    /// Returns the Meta element for this version.
    pub fn meta(&self) -> ResourceMeta {
        ResourceMeta {
            version_id: self.version_id.clone(),
            last_updated: self.last_modified,
        }
    }
}

/// Meta element extracted from a stored resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMeta {
    /// The version ID.
    #[serde(rename = "versionId")]
    pub version_id: String,

    /// The last update timestamp.
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
}
