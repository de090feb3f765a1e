//! Versioned storage trait.
//!
//! Extends [`ResourceStorage`] with version reads (vread) and
//! version-guarded deletes.

use async_trait::async_trait;

use crate::error::{ConcurrencyError, StorageError, StorageResult};
use crate::types::StoredResource;

use super::storage::ResourceStorage;

/// Storage trait with version-aware operations.
///
/// Each resource has a version ID that is incremented on every write,
/// including deletes. The first version is "1".
#[async_trait]
pub trait VersionedStorage: ResourceStorage {
    /// Reads a specific version of a resource.
    ///
    /// Works for versions written before a delete. Reading the tombstone
    /// version itself returns a resource with `is_deleted() == true` and a
    /// `null` body.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(VersionNotFound)` - if no such version exists
    async fn vread(
        &self,
        resource_type: &str,
        id: &str,
        version_id: &str,
    ) -> StorageResult<StoredResource>;

    /// Deletes a resource only if its current version is `expected_version`.
    async fn delete_with_match(
        &self,
        resource_type: &str,
        id: &str,
        expected_version: &str,
    ) -> StorageResult<StoredResource>;

    /// Gets the current version ID, or `None` if missing or deleted.
    async fn current_version(
        &self,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Option<String>> {
        match self.read(resource_type, id).await {
            Ok(r) => Ok(Some(r.version_id().to_string())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Lists all version IDs for a resource, oldest first.
    async fn list_versions(&self, resource_type: &str, id: &str) -> StorageResult<Vec<String>>;
}

/// Checks that the expected version equals the actual one.
pub fn check_version_match(
    resource_type: &str,
    id: &str,
    expected: &str,
    actual: &str,
) -> StorageResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(StorageError::Concurrency(ConcurrencyError::VersionConflict {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            expected_version: expected.to_string(),
            actual_version: actual.to_string(),
        }))
    }
}

/// Strips ETag decoration.
///
/// ETags may be formatted as `W/"1"`, `"1"`, or just `1`.
pub fn normalize_etag(etag: &str) -> &str {
    etag.trim_start_matches("W/")
        .trim_start_matches('"')
        .trim_end_matches('"')
}
