//! Core resource storage traits.
//!
//! [`ResourceStorage`] carries the CRUD interactions. [`ConditionalStorage`]
//! adds the search-criteria driven variants of create, update, delete and
//! patch.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{StorageError, StorageResult, ValidationError};
use crate::types::StoredResource;

/// Core storage trait for clinical documents.
///
/// Every mutating operation produces a new immutable version. The version ID
/// is a monotonically increasing integer (as a string) starting at "1" and is
/// used for optimistic locking.
///
/// Deletes are soft: a tombstone version is written, `read` reports the
/// resource as gone, and earlier versions remain readable via `vread`.
///
/// # Example
///
/// ```ignore
/// use helios_clinical_store::core::ResourceStorage;
///
/// async fn example<S: ResourceStorage>(storage: &S) -> Result<(), StorageError> {
///     let patient = serde_json::json!({
///         "resourceType": "Patient",
///         "name": [{"family": "Smith"}]
///     });
///     let stored = storage.create("Patient", patient).await?;
///
///     let mut content = stored.content().clone();
///     content["active"] = serde_json::json!(true);
///     let updated = storage
///         .update("Patient", stored.id(), content, Some(stored.version_id()))
///         .await?;
///     assert_eq!(updated.version_id(), "2");
///
///     storage.delete("Patient", stored.id()).await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait ResourceStorage: Send + Sync {
    /// Returns a human-readable name for this storage backend.
    fn backend_name(&self) -> &'static str;

    /// Creates a new resource.
    ///
    /// A server-assigned id is used unless the document carries a valid one
    /// that is not already taken.
    ///
    /// # Errors
    ///
    /// * `StorageError::Validation` - if the document is not a valid resource
    /// * `StorageError::Resource(AlreadyExists)` - if the supplied id is taken
    async fn create(&self, resource_type: &str, resource: Value) -> StorageResult<StoredResource>;

    /// Creates a resource with a specific ID (PUT semantics).
    ///
    /// Returns the stored resource and whether it was newly created.
    async fn create_or_update(
        &self,
        resource_type: &str,
        id: &str,
        resource: Value,
    ) -> StorageResult<(StoredResource, bool)>;

    /// Reads the current version of a resource.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(NotFound)` - if the resource never existed
    /// * `StorageError::Resource(Gone)` - if the current version is a tombstone
    async fn read(&self, resource_type: &str, id: &str) -> StorageResult<StoredResource>;

    /// Replaces a resource, producing a new version.
    ///
    /// When `expected_version` is given the write only happens if it equals
    /// the current version. Updating a deleted resource revives it.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(NotFound)` - if the resource doesn't exist
    /// * `StorageError::Concurrency(VersionConflict)` - if the version moved on
    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        resource: Value,
        expected_version: Option<&str>,
    ) -> StorageResult<StoredResource>;

    /// Soft-deletes a resource and returns the tombstone version.
    ///
    /// Deleting an already-deleted resource returns the existing tombstone
    /// without writing another version.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(NotFound)` - if the resource never existed
    async fn delete(&self, resource_type: &str, id: &str) -> StorageResult<StoredResource>;

    /// Applies a patch to the current version and stores the result.
    async fn patch(
        &self,
        resource_type: &str,
        id: &str,
        patch: &PatchFormat,
        expected_version: Option<&str>,
    ) -> StorageResult<StoredResource> {
        let current = self.read(resource_type, id).await?;
        if let Some(expected) = expected_version {
            super::check_version_match(
                resource_type,
                id,
                super::normalize_etag(expected),
                current.version_id(),
            )?;
        }
        let patched = apply_patch(current.content(), patch)?;
        self.update(resource_type, id, patched, Some(current.version_id()))
            .await
    }

    /// Checks whether a live (not deleted) resource exists.
    async fn exists(&self, resource_type: &str, id: &str) -> StorageResult<bool> {
        match self.read(resource_type, id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Reads multiple resources by their IDs.
    ///
    /// Missing and deleted resources are omitted.
    async fn read_batch(
        &self,
        resource_type: &str,
        ids: &[&str],
    ) -> StorageResult<Vec<StoredResource>> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            match self.read(resource_type, id).await {
                Ok(resource) => results.push(resource),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    /// Counts live resources of a type (or of all types).
    async fn count(&self, resource_type: Option<&str>) -> StorageResult<u64>;
}

/// Result of a conditional create operation.
#[derive(Debug, Clone)]
pub enum ConditionalCreateResult {
    /// No resource matched, so one was created.
    Created(StoredResource),
    /// Exactly one resource matched and was returned unchanged.
    Exists(StoredResource),
}

impl ConditionalCreateResult {
    /// The resource that was created or found.
    pub fn resource(&self) -> &StoredResource {
        match self {
            ConditionalCreateResult::Created(r) | ConditionalCreateResult::Exists(r) => r,
        }
    }

    /// Returns true if a new resource was written.
    pub fn is_created(&self) -> bool {
        matches!(self, ConditionalCreateResult::Created(_))
    }
}

/// Result of a conditional update operation.
#[derive(Debug, Clone)]
pub enum ConditionalUpdateResult {
    /// The single match was updated.
    Updated(StoredResource),
    /// Nothing matched, so the document was created.
    Created(StoredResource),
}

impl ConditionalUpdateResult {
    /// The resource that was written.
    pub fn resource(&self) -> &StoredResource {
        match self {
            ConditionalUpdateResult::Updated(r) | ConditionalUpdateResult::Created(r) => r,
        }
    }
}

/// Result of a conditional delete operation.
#[derive(Debug, Clone)]
pub enum ConditionalDeleteResult {
    /// The single match was deleted; holds its tombstone.
    Deleted(StoredResource),
    /// No resource matched the condition.
    NoMatch,
}

/// Result of a conditional patch operation.
#[derive(Debug, Clone)]
pub enum ConditionalPatchResult {
    /// The single match was patched.
    Patched(StoredResource),
    /// No resource matched the condition.
    NoMatch,
}

/// Patch document formats.
#[derive(Debug, Clone)]
pub enum PatchFormat {
    /// JSON Patch (RFC 6902).
    ///
    /// ```json
    /// [
    ///   {"op": "replace", "path": "/name/0/family", "value": "NewName"},
    ///   {"op": "add", "path": "/active", "value": true}
    /// ]
    /// ```
    JsonPatch(Value),

    /// JSON Merge Patch (RFC 7386).
    MergePatch(Value),
}

/// Applies a patch document to a resource body.
///
/// `resourceType` and `id` may not be changed by a patch.
pub fn apply_patch(content: &Value, patch: &PatchFormat) -> StorageResult<Value> {
    let mut patched = content.clone();
    match patch {
        PatchFormat::JsonPatch(doc) => {
            let operations: json_patch::Patch =
                serde_json::from_value(doc.clone()).map_err(|e| {
                    StorageError::Validation(ValidationError::InvalidResource {
                        message: format!("invalid JSON Patch document: {}", e),
                    })
                })?;
            json_patch::patch(&mut patched, &operations).map_err(|e| {
                StorageError::Validation(ValidationError::InvalidResource {
                    message: format!("JSON Patch failed: {}", e),
                })
            })?;
        }
        PatchFormat::MergePatch(doc) => json_patch::merge(&mut patched, doc),
    }

    for field in ["resourceType", "id"] {
        if patched.get(field) != content.get(field) {
            return Err(StorageError::Validation(ValidationError::InvalidResource {
                message: format!("patch may not change '{}'", field),
            }));
        }
    }
    Ok(patched)
}

/// Extension trait for operations selected by search criteria.
///
/// Criteria are query strings such as `identifier=http://mrn|123`. Every
/// operation fails with `ResourceError::AmbiguousConditionalMatch` when more
/// than one resource matches.
#[async_trait]
pub trait ConditionalStorage: ResourceStorage {
    /// Creates a resource only if no resource matches `criteria`.
    ///
    /// Concurrent calls with the same criteria create at most one resource.
    async fn conditional_create(
        &self,
        resource_type: &str,
        resource: Value,
        criteria: &str,
    ) -> StorageResult<ConditionalCreateResult>;

    /// Updates the single match, or creates the document if nothing matches.
    async fn conditional_update(
        &self,
        resource_type: &str,
        resource: Value,
        criteria: &str,
    ) -> StorageResult<ConditionalUpdateResult>;

    /// Deletes the single match.
    async fn conditional_delete(
        &self,
        resource_type: &str,
        criteria: &str,
    ) -> StorageResult<ConditionalDeleteResult>;

    /// Patches the single match.
    async fn conditional_patch(
        &self,
        resource_type: &str,
        criteria: &str,
        patch: &PatchFormat,
    ) -> StorageResult<ConditionalPatchResult>;
}
