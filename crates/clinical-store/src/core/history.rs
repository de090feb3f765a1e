//! History provider traits.
//!
//! - [`InstanceHistoryProvider`] - history of a single resource
//! - [`TypeHistoryProvider`] - history of every resource of a type

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::StorageResult;
use crate::types::{Page, Pagination, ResourceMethod, StoredResource};

use super::versioned::VersionedStorage;

/// Parameters for history queries.
#[derive(Debug, Clone, Default)]
pub struct HistoryParams {
    /// Only include versions written at or after this time.
    pub since: Option<DateTime<Utc>>,

    /// Only include versions written before this time.
    pub before: Option<DateTime<Utc>>,

    /// Pagination settings.
    pub pagination: Pagination,

    /// If false, tombstone versions are left out.
    pub include_deleted: bool,
}

impl HistoryParams {
    /// Creates history parameters that include tombstones.
    pub fn new() -> Self {
        Self {
            include_deleted: true,
            ..Default::default()
        }
    }

    /// Sets the since filter.
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Sets the before filter.
    pub fn before(mut self, before: DateTime<Utc>) -> Self {
        self.before = Some(before);
        self
    }

    /// Sets the count limit.
    pub fn count(mut self, count: u32) -> Self {
        self.pagination = self.pagination.with_count(count);
        self
    }

    /// Continues from a cursor returned by an earlier page.
    pub fn cursor(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    /// Sets whether to include deleted versions.
    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }
}

/// A single entry in a history listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The resource at this version.
    pub resource: StoredResource,

    /// The operation that created this version.
    pub method: ResourceMethod,

    /// When this version was created.
    pub timestamp: DateTime<Utc>,
}

/// A page of history entries, newest first.
pub type HistoryPage = Page<HistoryEntry>;

/// Renders a history page as a `history` Bundle.
pub fn history_bundle(page: &HistoryPage) -> Value {
    let entries: Vec<Value> = page
        .items
        .iter()
        .map(|entry| {
            let resource = &entry.resource;
            let mut e = json!({
                "fullUrl": resource.url(),
                "request": {
                    "method": entry.method.as_column(),
                    "url": if entry.method == ResourceMethod::Post {
                        resource.resource_type().to_string()
                    } else {
                        resource.url()
                    },
                },
                "response": {
                    "status": match entry.method {
                        ResourceMethod::Post => "201",
                        ResourceMethod::Delete => "204",
                        _ => "200",
                    },
                    "etag": resource.etag(),
                    "lastModified": resource.last_modified().to_rfc3339(),
                },
            });
            if !resource.is_deleted() {
                e["resource"] = resource.content().clone();
            }
            e
        })
        .collect();

    let mut bundle = json!({
        "resourceType": "Bundle",
        "type": "history",
        "entry": entries,
    });
    if let Some(total) = page.page_info.total {
        bundle["total"] = json!(total);
    }
    bundle
}

/// Provider for instance-level history.
#[async_trait]
pub trait InstanceHistoryProvider: VersionedStorage {
    /// Gets the versions of one resource, newest first.
    ///
    /// Tombstones appear as entries with method `DELETE`.
    async fn history_instance(
        &self,
        resource_type: &str,
        id: &str,
        params: &HistoryParams,
    ) -> StorageResult<HistoryPage>;

    /// Gets the total number of versions for a resource.
    async fn history_instance_count(&self, resource_type: &str, id: &str) -> StorageResult<u64>;
}

/// Provider for type-level history.
#[async_trait]
pub trait TypeHistoryProvider: InstanceHistoryProvider {
    /// Gets the versions of all resources of a type, newest first.
    async fn history_type(
        &self,
        resource_type: &str,
        params: &HistoryParams,
    ) -> StorageResult<HistoryPage>;

    /// Gets the total number of history entries for a resource type.
    async fn history_type_count(&self, resource_type: &str) -> StorageResult<u64>;
}
