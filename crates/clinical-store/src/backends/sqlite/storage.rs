//! ResourceStorage, VersionedStorage, conditional and history implementations for SQLite.

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value;

use crate::core::history::{
    HistoryEntry, HistoryPage, HistoryParams, InstanceHistoryProvider, TypeHistoryProvider,
};
use crate::core::{
    ConditionalCreateResult, ConditionalDeleteResult, ConditionalPatchResult, ConditionalStorage,
    ConditionalUpdateResult, PatchFormat, ResourceStorage, VersionedStorage, apply_patch,
};
use crate::error::{
    ResourceError, SearchError, StorageError, StorageResult, ValidationError, internal_error,
};
use crate::types::{
    CursorValue, Page, PageCursor, PageInfo, PaginationMode, ResourceMethod, StoredResource,
};

use super::SqliteBackend;
use super::search::{SqlFragment, SqlParam};
use super::writer::{
    ChangeSet, format_timestamp, load_current, not_found, read_live, resource_from_parts,
};

#[async_trait]
impl ResourceStorage for SqliteBackend {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn create(&self, resource_type: &str, resource: Value) -> StorageResult<StoredResource> {
        self.write(|conn, changes| self.insert_resource(conn, changes, resource_type, resource))
    }

    async fn create_or_update(
        &self,
        resource_type: &str,
        id: &str,
        resource: Value,
    ) -> StorageResult<(StoredResource, bool)> {
        self.write(|conn, changes| {
            self.replace_resource(
                conn,
                changes,
                resource_type,
                id,
                resource,
                None,
                ResourceMethod::Put,
                true,
            )
        })
    }

    async fn read(&self, resource_type: &str, id: &str) -> StorageResult<StoredResource> {
        let generation = self.cache().generation(resource_type, id);
        if let Some(cached) = self.cache().get_current(resource_type, id) {
            return Ok(cached);
        }

        let resource = self.read_snapshot(|conn| read_live(conn, resource_type, id))?;
        self.cache().install_current(&resource, generation);
        Ok(resource)
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        resource: Value,
        expected_version: Option<&str>,
    ) -> StorageResult<StoredResource> {
        self.write(|conn, changes| {
            self.replace_resource(
                conn,
                changes,
                resource_type,
                id,
                resource,
                expected_version,
                ResourceMethod::Put,
                false,
            )
            .map(|(stored, _)| stored)
        })
    }

    async fn delete(&self, resource_type: &str, id: &str) -> StorageResult<StoredResource> {
        self.write(|conn, changes| self.tombstone_resource(conn, changes, resource_type, id, None))
    }

    /// Reads, patches and writes inside one transaction, so a concurrent
    /// writer cannot slip in between.
    async fn patch(
        &self,
        resource_type: &str,
        id: &str,
        patch: &PatchFormat,
        expected_version: Option<&str>,
    ) -> StorageResult<StoredResource> {
        self.write(|conn, changes| {
            self.patch_in(conn, changes, resource_type, id, patch, expected_version)
        })
    }

    async fn count(&self, resource_type: Option<&str>) -> StorageResult<u64> {
        self.read_snapshot(|conn| {
            let count: i64 = match resource_type {
                Some(rt) => conn.query_row(
                    "SELECT COUNT(*) FROM resources WHERE resource_type = ?1 AND is_deleted = 0",
                    params![rt],
                    |row| row.get(0),
                )?,
                None => conn.query_row(
                    "SELECT COUNT(*) FROM resources WHERE is_deleted = 0",
                    [],
                    |row| row.get(0),
                )?,
            };
            Ok(count as u64)
        })
    }
}

#[async_trait]
impl VersionedStorage for SqliteBackend {
    async fn vread(
        &self,
        resource_type: &str,
        id: &str,
        version_id: &str,
    ) -> StorageResult<StoredResource> {
        if let Some(cached) = self.cache().get_version(resource_type, id, version_id) {
            return Ok(cached);
        }

        let resource =
            self.read_snapshot(|conn| read_version(conn, resource_type, id, version_id))?;

        self.cache().insert_version(&resource);
        Ok(resource)
    }

    async fn delete_with_match(
        &self,
        resource_type: &str,
        id: &str,
        expected_version: &str,
    ) -> StorageResult<StoredResource> {
        self.write(|conn, changes| {
            self.tombstone_resource(conn, changes, resource_type, id, Some(expected_version))
        })
    }

    async fn list_versions(&self, resource_type: &str, id: &str) -> StorageResult<Vec<String>> {
        let versions: Vec<String> = self.read_snapshot(|conn| {
            let mut stmt = conn.prepare(
                "SELECT version_id FROM resource_history
                 WHERE resource_type = ?1 AND id = ?2
                 ORDER BY CAST(version_id AS INTEGER) ASC",
            )?;
            let rows = stmt.query_map(params![resource_type, id], |row| row.get(0))?;
            Ok(rows.collect::<Result<Vec<String>, _>>()?)
        })?;

        if versions.is_empty() {
            return Err(not_found(resource_type, id));
        }
        Ok(versions)
    }
}

#[async_trait]
impl InstanceHistoryProvider for SqliteBackend {
    async fn history_instance(
        &self,
        resource_type: &str,
        id: &str,
        params: &HistoryParams,
    ) -> StorageResult<HistoryPage> {
        self.read_snapshot(|conn| {
            if load_current(conn, resource_type, id)?.is_none() {
                return Err(not_found(resource_type, id));
            }
            self.history_page(conn, resource_type, Some(id), params)
        })
    }

    async fn history_instance_count(&self, resource_type: &str, id: &str) -> StorageResult<u64> {
        self.read_snapshot(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM resource_history WHERE resource_type = ?1 AND id = ?2",
                params![resource_type, id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}

#[async_trait]
impl TypeHistoryProvider for SqliteBackend {
    async fn history_type(
        &self,
        resource_type: &str,
        params: &HistoryParams,
    ) -> StorageResult<HistoryPage> {
        self.read_snapshot(|conn| self.history_page(conn, resource_type, None, params))
    }

    async fn history_type_count(&self, resource_type: &str) -> StorageResult<u64> {
        self.read_snapshot(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM resource_history WHERE resource_type = ?1",
                params![resource_type],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}

impl SqliteBackend {
    /// One page of history, newest first, with the total of the filtered
    /// listing taken from the same snapshot.
    ///
    /// The cursor holds the ledger row id of the last entry returned.
    fn history_page(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: Option<&str>,
        params: &HistoryParams,
    ) -> StorageResult<HistoryPage> {
        let mut filter =
            SqlFragment::with_params("resource_type = ?", vec![SqlParam::string(resource_type)]);
        if let Some(id) = id {
            filter = filter.and(SqlFragment::with_params("id = ?", vec![SqlParam::string(id)]));
        }
        if !params.include_deleted {
            filter = filter.and(SqlFragment::new("is_deleted = 0"));
        }
        if let Some(since) = params.since {
            filter = filter.and(SqlFragment::with_params(
                "last_updated >= ?",
                vec![SqlParam::string(format_timestamp(since))],
            ));
        }
        if let Some(before) = params.before {
            filter = filter.and(SqlFragment::with_params(
                "last_updated < ?",
                vec![SqlParam::string(format_timestamp(before))],
            ));
        }

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM resource_history WHERE {}", filter.sql),
            params_from_iter(filter.params.iter()),
            |row| row.get(0),
        )?;

        let count = params.pagination.count.min(self.config().max_page_size);
        if count == 0 {
            return Ok(Page::new(Vec::new(), PageInfo::end().with_total(total as u64)));
        }

        let mut page_filter = filter;
        let mut offset = 0u32;
        match &params.pagination.mode {
            PaginationMode::Cursor(Some(cursor)) => match cursor.sort_values() {
                [CursorValue::Number(history_id)] => {
                    page_filter = page_filter.and(SqlFragment::with_params(
                        "history_id < ?",
                        vec![SqlParam::integer(*history_id)],
                    ));
                }
                _ => {
                    return Err(StorageError::Search(SearchError::InvalidCursor {
                        cursor: cursor.encode(),
                    }));
                }
            },
            PaginationMode::Cursor(None) => {}
            PaginationMode::Offset(n) => offset = *n,
        }

        let sql = format!(
            "SELECT history_id, id, version_id, data, last_updated, is_deleted, method
             FROM resource_history WHERE {}
             ORDER BY history_id DESC LIMIT {} OFFSET {}",
            page_filter.sql,
            count as u64 + 1,
            offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(page_filter.params.iter()), |row| {
            Ok(HistoryRow {
                history_id: row.get(0)?,
                id: row.get(1)?,
                version_id: row.get(2)?,
                data: row.get(3)?,
                last_updated: row.get(4)?,
                is_deleted: row.get::<_, i64>(5)? != 0,
                method: row.get(6)?,
            })
        })?;
        let mut rows = rows.collect::<Result<Vec<_>, _>>()?;

        let has_next = rows.len() > count as usize;
        rows.truncate(count as usize);
        let last = rows.last().map(|row| (row.history_id, row.id.clone()));

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let method = ResourceMethod::from_column(&row.method).ok_or_else(|| {
                internal_error(format!("Unknown history method '{}'", row.method))
            })?;
            let resource = resource_from_parts(
                resource_type,
                &row.id,
                row.version_id,
                row.data,
                &row.last_updated,
                row.is_deleted,
            )?
            .with_method(method);
            entries.push(HistoryEntry {
                timestamp: resource.last_modified(),
                resource,
                method,
            });
        }

        let page_info = match last {
            Some((history_id, last_id)) if has_next => {
                PageInfo::with_next(PageCursor::new(vec![CursorValue::Number(history_id)], last_id))
            }
            _ => PageInfo::end(),
        };
        Ok(Page::new(entries, page_info.with_total(total as u64)))
    }

    /// Resolves conditional criteria to exactly zero or one live resource.
    pub(crate) fn single_match(
        &self,
        conn: &Connection,
        resource_type: &str,
        criteria: &str,
    ) -> StorageResult<Option<String>> {
        let mut ids = self.matching_ids(conn, resource_type, criteria)?;
        match ids.len() {
            0 => Ok(None),
            1 => Ok(ids.pop()),
            count => Err(StorageError::Resource(ResourceError::AmbiguousConditionalMatch {
                resource_type: resource_type.to_string(),
                criteria: criteria.to_string(),
                count,
            })),
        }
    }
}

/// One version of a resource from the history table.
pub(crate) fn read_version(
    conn: &Connection,
    resource_type: &str,
    id: &str,
    version_id: &str,
) -> StorageResult<StoredResource> {
    let row = conn
        .query_row(
            "SELECT data, last_updated, is_deleted FROM resource_history
             WHERE resource_type = ?1 AND id = ?2 AND version_id = ?3",
            params![resource_type, id, version_id],
            |row| {
                Ok((
                    row.get::<_, Option<Vec<u8>>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? != 0,
                ))
            },
        )
        .optional()?;
    let (data, last_updated, is_deleted) = row.ok_or_else(|| {
        StorageError::Resource(ResourceError::VersionNotFound {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            version_id: version_id.to_string(),
        })
    })?;
    resource_from_parts(
        resource_type,
        id,
        version_id.to_string(),
        data,
        &last_updated,
        is_deleted,
    )
}

struct HistoryRow {
    history_id: i64,
    id: String,
    version_id: String,
    data: Option<Vec<u8>>,
    last_updated: String,
    is_deleted: bool,
    method: String,
}

/// Every conditional operation runs its match and its write in one
/// immediate transaction. Writers are serialized by SQLite, so two
/// conditional creates with the same criteria cannot both see no match.
#[async_trait]
impl ConditionalStorage for SqliteBackend {
    async fn conditional_create(
        &self,
        resource_type: &str,
        resource: Value,
        criteria: &str,
    ) -> StorageResult<ConditionalCreateResult> {
        self.write(|conn, changes| {
            self.conditional_create_in(conn, changes, resource_type, resource, criteria)
        })
    }

    async fn conditional_update(
        &self,
        resource_type: &str,
        resource: Value,
        criteria: &str,
    ) -> StorageResult<ConditionalUpdateResult> {
        self.write(|conn, changes| {
            self.conditional_update_in(conn, changes, resource_type, resource, criteria)
        })
    }

    async fn conditional_delete(
        &self,
        resource_type: &str,
        criteria: &str,
    ) -> StorageResult<ConditionalDeleteResult> {
        self.write(|conn, changes| {
            self.conditional_delete_in(conn, changes, resource_type, criteria)
        })
    }

    async fn conditional_patch(
        &self,
        resource_type: &str,
        criteria: &str,
        patch: &PatchFormat,
    ) -> StorageResult<ConditionalPatchResult> {
        self.write(|conn, changes| {
            self.conditional_patch_in(conn, changes, resource_type, criteria, patch)
        })
    }
}

/// Conditional operations on an open write transaction, shared with bundle
/// processing.
impl SqliteBackend {
    pub(crate) fn conditional_create_in(
        &self,
        conn: &Connection,
        changes: &mut ChangeSet,
        resource_type: &str,
        resource: Value,
        criteria: &str,
    ) -> StorageResult<ConditionalCreateResult> {
        match self.single_match(conn, resource_type, criteria)? {
            Some(id) => Ok(ConditionalCreateResult::Exists(read_live(
                conn,
                resource_type,
                &id,
            )?)),
            None => Ok(ConditionalCreateResult::Created(self.insert_resource(
                conn,
                changes,
                resource_type,
                resource,
            )?)),
        }
    }

    pub(crate) fn conditional_update_in(
        &self,
        conn: &Connection,
        changes: &mut ChangeSet,
        resource_type: &str,
        resource: Value,
        criteria: &str,
    ) -> StorageResult<ConditionalUpdateResult> {
        let body_id = resource.get("id").and_then(Value::as_str).map(str::to_string);
        match self.single_match(conn, resource_type, criteria)? {
            Some(id) => {
                if body_id.as_deref().is_some_and(|b| b != id) {
                    return Err(StorageError::Validation(ValidationError::InvalidResource {
                        message: format!(
                            "document id does not match the resource selected by '{}'",
                            criteria
                        ),
                    }));
                }
                let (stored, _) = self.replace_resource(
                    conn,
                    changes,
                    resource_type,
                    &id,
                    resource,
                    None,
                    ResourceMethod::Put,
                    false,
                )?;
                Ok(ConditionalUpdateResult::Updated(stored))
            }
            None => {
                let stored = match body_id {
                    Some(id) => {
                        self.replace_resource(
                            conn,
                            changes,
                            resource_type,
                            &id,
                            resource,
                            None,
                            ResourceMethod::Put,
                            true,
                        )?
                        .0
                    }
                    None => self.insert_resource(conn, changes, resource_type, resource)?,
                };
                Ok(ConditionalUpdateResult::Created(stored))
            }
        }
    }

    pub(crate) fn conditional_delete_in(
        &self,
        conn: &Connection,
        changes: &mut ChangeSet,
        resource_type: &str,
        criteria: &str,
    ) -> StorageResult<ConditionalDeleteResult> {
        match self.single_match(conn, resource_type, criteria)? {
            Some(id) => Ok(ConditionalDeleteResult::Deleted(self.tombstone_resource(
                conn,
                changes,
                resource_type,
                &id,
                None,
            )?)),
            None => Ok(ConditionalDeleteResult::NoMatch),
        }
    }

    pub(crate) fn conditional_patch_in(
        &self,
        conn: &Connection,
        changes: &mut ChangeSet,
        resource_type: &str,
        criteria: &str,
        patch: &PatchFormat,
    ) -> StorageResult<ConditionalPatchResult> {
        let Some(id) = self.single_match(conn, resource_type, criteria)? else {
            return Ok(ConditionalPatchResult::NoMatch);
        };
        self.patch_in(conn, changes, resource_type, &id, patch, None)
            .map(ConditionalPatchResult::Patched)
    }

    /// Applies a patch to the live version of `id`.
    pub(crate) fn patch_in(
        &self,
        conn: &Connection,
        changes: &mut ChangeSet,
        resource_type: &str,
        id: &str,
        patch: &PatchFormat,
        expected_version: Option<&str>,
    ) -> StorageResult<StoredResource> {
        let current = read_live(conn, resource_type, id)?;
        let patched = apply_patch(current.content(), patch)?;
        let expected = expected_version.unwrap_or(current.version_id());
        self.replace_resource(
            conn,
            changes,
            resource_type,
            id,
            patched,
            Some(expected),
            ResourceMethod::Patch,
            false,
        )
        .map(|(stored, _)| stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HistoryParams;
    use crate::error::ConcurrencyError;
    use crate::types::Pagination;
    use serde_json::json;

    fn create_test_backend() -> SqliteBackend {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.init_schema().unwrap();
        backend
    }

    fn patient(family: &str) -> Value {
        json!({"resourceType": "Patient", "name": [{"family": family}]})
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let backend = create_test_backend();

        let created = backend.create("Patient", patient("Test")).await.unwrap();
        assert_eq!(created.resource_type(), "Patient");
        assert_eq!(created.version_id(), "1");
        assert_eq!(created.content()["meta"]["versionId"], "1");

        let read = backend.read("Patient", created.id()).await.unwrap();
        assert_eq!(read.version_id(), "1");
        assert_eq!(read.content()["name"][0]["family"], "Test");
    }

    #[tokio::test]
    async fn test_create_with_id() {
        let backend = create_test_backend();

        let resource = json!({"resourceType": "Patient", "id": "patient-123"});
        let created = backend.create("Patient", resource).await.unwrap();
        assert_eq!(created.id(), "patient-123");
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let backend = create_test_backend();

        let resource = json!({"resourceType": "Patient", "id": "patient-1"});
        backend.create("Patient", resource.clone()).await.unwrap();

        let result = backend.create("Patient", resource).await;
        assert!(matches!(
            result,
            Err(StorageError::Resource(ResourceError::AlreadyExists { .. }))
        ));
    }

    #[tokio::test]
    async fn test_read_nonexistent() {
        let backend = create_test_backend();

        let result = backend.read("Patient", "nonexistent").await;
        assert!(matches!(
            result,
            Err(StorageError::Resource(ResourceError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_update() {
        let backend = create_test_backend();
        let created = backend.create("Patient", patient("Original")).await.unwrap();

        let updated = backend
            .update("Patient", created.id(), patient("Updated"), Some("1"))
            .await
            .unwrap();
        assert_eq!(updated.version_id(), "2");

        let read = backend.read("Patient", created.id()).await.unwrap();
        assert_eq!(read.content()["name"][0]["family"], "Updated");
        assert_eq!(read.version_id(), "2");
    }

    #[tokio::test]
    async fn test_update_version_conflict() {
        let backend = create_test_backend();
        let created = backend.create("Patient", patient("A")).await.unwrap();
        backend
            .update("Patient", created.id(), patient("B"), None)
            .await
            .unwrap();

        let result = backend
            .update("Patient", created.id(), patient("C"), Some("W/\"1\""))
            .await;
        assert!(matches!(
            result,
            Err(StorageError::Concurrency(ConcurrencyError::VersionConflict { .. }))
        ));
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let backend = create_test_backend();

        let result = backend.update("Patient", "ghost", patient("A"), None).await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_then_read_is_gone() {
        let backend = create_test_backend();
        let created = backend.create("Patient", patient("A")).await.unwrap();

        let tombstone = backend.delete("Patient", created.id()).await.unwrap();
        assert_eq!(tombstone.version_id(), "2");
        assert!(tombstone.is_deleted());

        let result = backend.read("Patient", created.id()).await;
        assert!(matches!(
            result,
            Err(StorageError::Resource(ResourceError::Gone { .. }))
        ));

        let again = backend.delete("Patient", created.id()).await.unwrap();
        assert_eq!(again.version_id(), "2");
    }

    #[tokio::test]
    async fn test_create_or_update() {
        let backend = create_test_backend();

        let (first, created) = backend
            .create_or_update("Patient", "new-id", patient("A"))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(first.version_id(), "1");

        let (second, created) = backend
            .create_or_update("Patient", "new-id", patient("B"))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.version_id(), "2");
    }

    #[tokio::test]
    async fn test_patch() {
        let backend = create_test_backend();
        let created = backend.create("Patient", patient("A")).await.unwrap();

        let patched = backend
            .patch(
                "Patient",
                created.id(),
                &PatchFormat::JsonPatch(json!([
                    {"op": "add", "path": "/active", "value": true}
                ])),
                None,
            )
            .await
            .unwrap();
        assert_eq!(patched.version_id(), "2");
        assert_eq!(patched.content()["active"], true);
        assert_eq!(patched.method(), Some(ResourceMethod::Patch));
    }

    #[tokio::test]
    async fn test_count() {
        let backend = create_test_backend();
        backend.create("Patient", patient("A")).await.unwrap();
        let b = backend.create("Patient", patient("B")).await.unwrap();
        backend
            .create("Organization", json!({"resourceType": "Organization"}))
            .await
            .unwrap();
        backend.delete("Patient", b.id()).await.unwrap();

        assert_eq!(backend.count(Some("Patient")).await.unwrap(), 1);
        assert_eq!(backend.count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_vread_survives_delete() {
        let backend = create_test_backend();
        let created = backend.create("Patient", patient("A")).await.unwrap();
        backend.delete("Patient", created.id()).await.unwrap();

        let v1 = backend.vread("Patient", created.id(), "1").await.unwrap();
        assert_eq!(v1.content()["name"][0]["family"], "A");

        let v2 = backend.vread("Patient", created.id(), "2").await.unwrap();
        assert!(v2.is_deleted());

        let missing = backend.vread("Patient", created.id(), "3").await;
        assert!(matches!(
            missing,
            Err(StorageError::Resource(ResourceError::VersionNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_list_versions() {
        let backend = create_test_backend();
        let created = backend.create("Patient", patient("A")).await.unwrap();
        backend
            .update("Patient", created.id(), patient("B"), None)
            .await
            .unwrap();

        let versions = backend.list_versions("Patient", created.id()).await.unwrap();
        assert_eq!(versions, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_delete_with_match_conflict() {
        let backend = create_test_backend();
        let created = backend.create("Patient", patient("A")).await.unwrap();

        let result = backend.delete_with_match("Patient", created.id(), "7").await;
        assert!(result.unwrap_err().is_conflict());
        assert!(backend.read("Patient", created.id()).await.is_ok());
    }

    #[tokio::test]
    async fn test_history_instance_newest_first_with_cursor() {
        let backend = create_test_backend();
        let created = backend.create("Patient", patient("A")).await.unwrap();
        backend
            .update("Patient", created.id(), patient("B"), None)
            .await
            .unwrap();
        backend.delete("Patient", created.id()).await.unwrap();

        let first = backend
            .history_instance("Patient", created.id(), &HistoryParams::new().count(2))
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0].method, ResourceMethod::Delete);
        assert_eq!(first.items[1].resource.version_id(), "2");
        assert_eq!(first.page_info.total, Some(3));

        let cursor = first.page_info.next_cursor.clone().unwrap();
        let params = HistoryParams::new().cursor(Pagination::from_cursor(2, &cursor).unwrap());
        let second = backend
            .history_instance("Patient", created.id(), &params)
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].method, ResourceMethod::Post);
        assert!(second.page_info.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_history_type_without_tombstones() {
        let backend = create_test_backend();
        let a = backend.create("Patient", patient("A")).await.unwrap();
        backend.create("Patient", patient("B")).await.unwrap();
        backend.delete("Patient", a.id()).await.unwrap();

        let page = backend
            .history_type("Patient", &HistoryParams::new().include_deleted(false))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.items.iter().all(|e| !e.resource.is_deleted()));
        assert_eq!(backend.history_type_count("Patient").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_history_of_unknown_resource() {
        let backend = create_test_backend();
        let result = backend
            .history_instance("Patient", "ghost", &HistoryParams::new())
            .await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_conditional_create() {
        let backend = create_test_backend();
        let doc = json!({
            "resourceType": "Patient",
            "identifier": [{"system": "http://mrn", "value": "42"}]
        });

        let first = backend
            .conditional_create("Patient", doc.clone(), "identifier=http://mrn|42")
            .await
            .unwrap();
        assert!(first.is_created());

        let second = backend
            .conditional_create("Patient", doc, "identifier=http://mrn|42")
            .await
            .unwrap();
        assert!(!second.is_created());
        assert_eq!(second.resource().id(), first.resource().id());
        assert_eq!(backend.count(Some("Patient")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_conditional_ambiguous() {
        let backend = create_test_backend();
        backend.create("Patient", patient("Smith")).await.unwrap();
        backend.create("Patient", patient("Smith")).await.unwrap();

        let result = backend
            .conditional_update("Patient", patient("Jones"), "family=Smith")
            .await;
        assert!(matches!(
            result,
            Err(StorageError::Resource(ResourceError::AmbiguousConditionalMatch { count: 2, .. }))
        ));
    }

    #[tokio::test]
    async fn test_conditional_update_and_delete() {
        let backend = create_test_backend();
        let created = backend.create("Patient", patient("Smith")).await.unwrap();

        let updated = backend
            .conditional_update("Patient", patient("Smithers"), "family=Smith")
            .await
            .unwrap();
        assert!(matches!(updated, ConditionalUpdateResult::Updated(_)));
        assert_eq!(updated.resource().id(), created.id());

        let deleted = backend
            .conditional_delete("Patient", "family=Smithers")
            .await
            .unwrap();
        assert!(matches!(deleted, ConditionalDeleteResult::Deleted(_)));

        let none = backend
            .conditional_delete("Patient", "family=Smithers")
            .await
            .unwrap();
        assert!(matches!(none, ConditionalDeleteResult::NoMatch));
    }

    #[tokio::test]
    async fn test_conditional_update_creates_when_nothing_matches() {
        let backend = create_test_backend();

        let result = backend
            .conditional_update("Patient", patient("Nobody"), "family=Nobody")
            .await
            .unwrap();
        assert!(matches!(result, ConditionalUpdateResult::Created(_)));
    }

    #[tokio::test]
    async fn test_conditional_patch() {
        let backend = create_test_backend();
        backend.create("Patient", patient("Smith")).await.unwrap();

        let result = backend
            .conditional_patch(
                "Patient",
                "family=Smith",
                &PatchFormat::MergePatch(json!({"gender": "female"})),
            )
            .await
            .unwrap();
        match result {
            ConditionalPatchResult::Patched(stored) => {
                assert_eq!(stored.content()["gender"], "female");
                assert_eq!(stored.version_id(), "2");
            }
            ConditionalPatchResult::NoMatch => panic!("expected a match"),
        }
    }

    #[tokio::test]
    async fn test_read_is_served_from_cache_after_first_read() {
        let backend = create_test_backend();
        let created = backend.create("Patient", patient("A")).await.unwrap();

        backend.read("Patient", created.id()).await.unwrap();
        backend.read("Patient", created.id()).await.unwrap();
        assert!(backend.cache().stats().hits >= 1);

        backend
            .update("Patient", created.id(), patient("B"), None)
            .await
            .unwrap();
        let read = backend.read("Patient", created.id()).await.unwrap();
        assert_eq!(read.version_id(), "2");
    }
}
