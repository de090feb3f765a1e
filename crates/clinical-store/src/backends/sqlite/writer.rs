//! Write path: live rows, the version ledger and index rows.
//!
//! Every function here runs on a connection that is already inside a write
//! transaction, so a document, its history record and its index rows are
//! always committed together.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Value, json};

use crate::core::{check_version_match, normalize_etag};
use crate::error::{
    ResourceError, StorageError, StorageResult, ValidationError, internal_error,
};
use crate::events::{ChangeKind, ResourceChangeEvent};
use crate::search::reference::ID_PATTERN;
use crate::search::{IndexValue, ReferenceTarget};
use crate::types::{ReferenceWarning, ResourceMethod, StoredResource};

use super::SqliteBackend;

/// Column format of every stored instant (UTC, millisecond precision).
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// The current instant, truncated to what the columns store.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn parse_timestamp(s: &str) -> StorageResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| internal_error(format!("Failed to parse timestamp '{}': {}", s, e)))
}

/// Checks a logical id against `[A-Za-z0-9\-\.]{1,64}`.
pub(crate) fn validate_id(id: &str) -> StorageResult<()> {
    if ID_PATTERN.is_match(id) {
        Ok(())
    } else {
        Err(StorageError::Validation(ValidationError::InvalidId {
            id: id.to_string(),
        }))
    }
}

/// Changes made inside one write transaction, applied after commit.
#[derive(Debug, Default)]
pub(crate) struct ChangeSet {
    events: Vec<ResourceChangeEvent>,
    touched: Vec<(String, String)>,
}

impl ChangeSet {
    pub(crate) fn record(&mut self, kind: ChangeKind, resource: &StoredResource) {
        let key = (resource.resource_type().to_string(), resource.id().to_string());
        if !self.touched.contains(&key) {
            self.touched.push(key);
        }
        self.events
            .push(ResourceChangeEvent::from_resource(kind, resource));
    }

    pub(crate) fn events(&self) -> &[ResourceChangeEvent] {
        &self.events
    }

    pub(crate) fn touched(&self) -> &[(String, String)] {
        &self.touched
    }
}

/// The live row of a resource.
#[derive(Debug)]
pub(crate) struct CurrentRow {
    pub version_id: String,
    pub data: Option<Vec<u8>>,
    pub last_updated: String,
    pub is_deleted: bool,
}

impl CurrentRow {
    fn version_number(&self) -> StorageResult<u64> {
        self.version_id.parse().map_err(|_| {
            internal_error(format!("Corrupt version id '{}'", self.version_id))
        })
    }

    pub(crate) fn into_resource(self, resource_type: &str, id: &str) -> StorageResult<StoredResource> {
        resource_from_parts(
            resource_type,
            id,
            self.version_id,
            self.data,
            &self.last_updated,
            self.is_deleted,
        )
    }
}

/// Builds a stored resource from columns. A tombstone has no data.
pub(crate) fn resource_from_parts(
    resource_type: &str,
    id: &str,
    version_id: String,
    data: Option<Vec<u8>>,
    last_updated: &str,
    is_deleted: bool,
) -> StorageResult<StoredResource> {
    let content = match data {
        Some(bytes) => serde_json::from_slice(&bytes)?,
        None => Value::Null,
    };
    let last_modified = parse_timestamp(last_updated)?;
    Ok(StoredResource::from_storage(
        resource_type,
        id,
        version_id,
        content,
        last_modified,
        is_deleted.then_some(last_modified),
    ))
}

pub(crate) fn load_current(
    conn: &Connection,
    resource_type: &str,
    id: &str,
) -> StorageResult<Option<CurrentRow>> {
    conn.query_row(
        "SELECT version_id, data, last_updated, is_deleted
         FROM resources WHERE resource_type = ?1 AND id = ?2",
        params![resource_type, id],
        |row| {
            Ok(CurrentRow {
                version_id: row.get(0)?,
                data: row.get(1)?,
                last_updated: row.get(2)?,
                is_deleted: row.get::<_, i64>(3)? != 0,
            })
        },
    )
    .optional()
    .map_err(|e| internal_error(format!("Failed to read resource: {}", e)))
}

/// Reads the current live version, failing with `NotFound` or `Gone`.
pub(crate) fn read_live(
    conn: &Connection,
    resource_type: &str,
    id: &str,
) -> StorageResult<StoredResource> {
    match load_current(conn, resource_type, id)? {
        None => Err(not_found(resource_type, id)),
        Some(row) if row.is_deleted => {
            let deleted_at = parse_timestamp(&row.last_updated).ok();
            Err(StorageError::Resource(ResourceError::Gone {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                deleted_at,
            }))
        }
        Some(row) => row.into_resource(resource_type, id),
    }
}

pub(crate) fn is_live(conn: &Connection, resource_type: &str, id: &str) -> StorageResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM resources WHERE resource_type = ?1 AND id = ?2 AND is_deleted = 0",
            params![resource_type, id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn not_found(resource_type: &str, id: &str) -> StorageError {
    StorageError::Resource(ResourceError::NotFound {
        resource_type: resource_type.to_string(),
        id: id.to_string(),
    })
}

fn body_id(resource: &Value) -> StorageResult<Option<String>> {
    match resource.get("id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Ok(Some(id.clone())),
        Some(_) => Err(StorageError::Validation(ValidationError::InvalidResource {
            message: "id must be a string".to_string(),
        })),
    }
}

/// Writes `resourceType`, `id`, `meta.versionId` and `meta.lastUpdated`.
fn stamp(
    resource: &mut Value,
    resource_type: &str,
    id: &str,
    version_id: &str,
    last_updated: DateTime<Utc>,
) {
    if let Some(obj) = resource.as_object_mut() {
        obj.insert("resourceType".to_string(), json!(resource_type));
        obj.insert("id".to_string(), json!(id));
        let meta = obj.entry("meta").or_insert_with(|| json!({}));
        if !meta.is_object() {
            *meta = json!({});
        }
        meta["versionId"] = json!(version_id);
        meta["lastUpdated"] = json!(last_updated.to_rfc3339_opts(SecondsFormat::Millis, true));
    }
}

/// Column values of one index row.
#[derive(Debug, Default)]
struct IndexRow {
    string: Option<String>,
    string_raw: Option<String>,
    token_system: Option<String>,
    token_code: Option<String>,
    token_display: Option<String>,
    date_start: Option<String>,
    date_end: Option<String>,
    number: Option<f64>,
    quantity_value: Option<f64>,
    quantity_unit: Option<String>,
    quantity_system: Option<String>,
    quantity_code: Option<String>,
    reference: Option<String>,
    reference_type: Option<String>,
    reference_id: Option<String>,
    reference_version: Option<String>,
    uri: Option<String>,
}

impl IndexRow {
    fn from_value(value: &IndexValue) -> Self {
        match value {
            IndexValue::String { normalized, raw } => Self {
                string: Some(normalized.clone()),
                string_raw: Some(raw.clone()),
                ..Default::default()
            },
            IndexValue::Token {
                system,
                code,
                display,
            } => Self {
                token_system: system.clone(),
                token_code: (!code.is_empty()).then(|| code.clone()),
                token_display: display.as_ref().map(|d| d.to_lowercase()),
                ..Default::default()
            },
            IndexValue::Date(range) => Self {
                date_start: Some(range.start_key()),
                date_end: Some(range.end_key()),
                ..Default::default()
            },
            IndexValue::Number { value, .. } => Self {
                number: Some(*value),
                ..Default::default()
            },
            IndexValue::Quantity {
                value,
                unit,
                system,
                code,
            } => Self {
                quantity_value: Some(*value),
                quantity_unit: unit.clone(),
                quantity_system: system.clone(),
                quantity_code: code.clone(),
                ..Default::default()
            },
            IndexValue::Reference { raw, target } => match target {
                ReferenceTarget::Local {
                    resource_type,
                    id,
                    version,
                } => Self {
                    reference: raw.clone(),
                    reference_type: resource_type.clone(),
                    reference_id: Some(id.clone()),
                    reference_version: version.clone(),
                    ..Default::default()
                },
                // :identifier searches read the token columns.
                ReferenceTarget::Identifier { system, value } => Self {
                    reference: raw.clone(),
                    token_system: system.clone(),
                    token_code: Some(value.clone()),
                    ..Default::default()
                },
                ReferenceTarget::Placeholder(s)
                | ReferenceTarget::Contained(s)
                | ReferenceTarget::External(s) => Self {
                    reference: raw.clone().or_else(|| Some(s.clone())),
                    ..Default::default()
                },
            },
            IndexValue::Uri(uri) => Self {
                uri: Some(uri.clone()),
                ..Default::default()
            },
        }
    }
}

impl SqliteBackend {
    /// Checks that a document can be stored as `resource_type`.
    pub(crate) fn validate_document(
        &self,
        resource_type: &str,
        resource: &Value,
    ) -> StorageResult<()> {
        if !self.search_registry().read().is_known_type(resource_type) {
            return Err(StorageError::Validation(
                ValidationError::UnsupportedResourceType {
                    resource_type: resource_type.to_string(),
                },
            ));
        }
        let obj = resource.as_object().ok_or_else(|| {
            StorageError::Validation(ValidationError::InvalidResource {
                message: "resource must be a JSON object".to_string(),
            })
        })?;
        match obj.get("resourceType").and_then(Value::as_str) {
            None => Err(StorageError::Validation(ValidationError::MissingRequiredField {
                field: "resourceType".to_string(),
            })),
            Some(rt) if rt != resource_type => {
                Err(StorageError::Validation(ValidationError::InvalidResource {
                    message: format!(
                        "resourceType '{}' does not match target type '{}'",
                        rt, resource_type
                    ),
                }))
            }
            Some(_) => Ok(()),
        }
    }

    /// Inserts the first version of a new resource.
    ///
    /// Uses the document's id when it has one, otherwise assigns a UUID.
    pub(crate) fn insert_resource(
        &self,
        conn: &Connection,
        changes: &mut ChangeSet,
        resource_type: &str,
        resource: Value,
    ) -> StorageResult<StoredResource> {
        self.validate_document(resource_type, &resource)?;
        let id = match body_id(&resource)? {
            Some(id) => {
                validate_id(&id)?;
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        if load_current(conn, resource_type, &id)?.is_some() {
            return Err(StorageError::Resource(ResourceError::AlreadyExists {
                resource_type: resource_type.to_string(),
                id,
            }));
        }

        self.write_version(
            conn,
            changes,
            resource_type,
            &id,
            1,
            resource,
            ResourceMethod::Post,
            ChangeKind::Created,
        )
    }

    /// Stores a new version of `id`.
    ///
    /// A deleted resource is revived. A missing one is created when
    /// `allow_create` is set. Returns the version and whether the resource
    /// came (back) into existence.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn replace_resource(
        &self,
        conn: &Connection,
        changes: &mut ChangeSet,
        resource_type: &str,
        id: &str,
        resource: Value,
        expected_version: Option<&str>,
        method: ResourceMethod,
        allow_create: bool,
    ) -> StorageResult<(StoredResource, bool)> {
        validate_id(id)?;
        self.validate_document(resource_type, &resource)?;
        if let Some(body) = body_id(&resource)? {
            if body != id {
                return Err(StorageError::Validation(ValidationError::InvalidResource {
                    message: format!("document id '{}' does not match target id '{}'", body, id),
                }));
            }
        }

        let current = load_current(conn, resource_type, id)?;
        let (version, kind, created) = match current {
            None if allow_create && expected_version.is_none() => (1, ChangeKind::Created, true),
            None => return Err(not_found(resource_type, id)),
            Some(row) => {
                if let Some(expected) = expected_version {
                    check_version_match(
                        resource_type,
                        id,
                        normalize_etag(expected),
                        &row.version_id,
                    )?;
                }
                let kind = if row.is_deleted {
                    ChangeKind::Created
                } else {
                    ChangeKind::Updated
                };
                (row.version_number()? + 1, kind, row.is_deleted)
            }
        };

        let stored = self.write_version(
            conn,
            changes,
            resource_type,
            id,
            version,
            resource,
            method,
            kind,
        )?;
        Ok((stored, created))
    }

    /// Writes a tombstone version and drops the resource's index rows.
    ///
    /// An already deleted resource is left alone and its tombstone returned.
    pub(crate) fn tombstone_resource(
        &self,
        conn: &Connection,
        changes: &mut ChangeSet,
        resource_type: &str,
        id: &str,
        expected_version: Option<&str>,
    ) -> StorageResult<StoredResource> {
        let row = load_current(conn, resource_type, id)?
            .ok_or_else(|| not_found(resource_type, id))?;
        if row.is_deleted {
            return Ok(row
                .into_resource(resource_type, id)?
                .with_method(ResourceMethod::Delete));
        }
        if let Some(expected) = expected_version {
            check_version_match(resource_type, id, normalize_etag(expected), &row.version_id)?;
        }

        let version_id = (row.version_number()? + 1).to_string();
        let deleted_at = now();
        let ts = format_timestamp(deleted_at);

        conn.execute(
            "UPDATE resources
             SET version_id = ?1, data = NULL, last_updated = ?2, is_deleted = 1, deleted_at = ?2
             WHERE resource_type = ?3 AND id = ?4",
            params![version_id, ts, resource_type, id],
        )
        .map_err(|e| internal_error(format!("Failed to delete resource: {}", e)))?;
        insert_history(conn, resource_type, id, &version_id, None, &ts, ResourceMethod::Delete)?;
        self.delete_search_index(conn, resource_type, id)?;

        let tombstone = StoredResource::from_storage(
            resource_type,
            id,
            version_id,
            Value::Null,
            deleted_at,
            Some(deleted_at),
        )
        .with_method(ResourceMethod::Delete);
        changes.record(ChangeKind::Deleted, &tombstone);
        tracing::debug!(
            resource_type = %resource_type,
            id = %id,
            version = %tombstone.version_id(),
            "deleted resource"
        );
        Ok(tombstone)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_version(
        &self,
        conn: &Connection,
        changes: &mut ChangeSet,
        resource_type: &str,
        id: &str,
        version: u64,
        mut resource: Value,
        method: ResourceMethod,
        kind: ChangeKind,
    ) -> StorageResult<StoredResource> {
        let version_id = version.to_string();
        let last_updated = now();
        stamp(&mut resource, resource_type, id, &version_id, last_updated);

        let data = serde_json::to_vec(&resource)?;
        let ts = format_timestamp(last_updated);

        conn.execute(
            "INSERT INTO resources (resource_type, id, version_id, data, last_updated, is_deleted, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL)
             ON CONFLICT (resource_type, id) DO UPDATE SET
                version_id = excluded.version_id,
                data = excluded.data,
                last_updated = excluded.last_updated,
                is_deleted = 0,
                deleted_at = NULL",
            params![resource_type, id, version_id, data, ts],
        )
        .map_err(|e| internal_error(format!("Failed to write resource: {}", e)))?;
        insert_history(conn, resource_type, id, &version_id, Some(&data), &ts, method)?;

        self.delete_search_index(conn, resource_type, id)?;
        let (entries, warnings) = self.index_resource(conn, resource_type, id, &resource)?;

        let stored = StoredResource::from_storage(
            resource_type,
            id,
            version_id,
            resource,
            last_updated,
            None,
        )
        .with_method(method)
        .with_warnings(warnings);
        changes.record(kind, &stored);
        tracing::debug!(
            resource_type = %resource_type,
            id = %id,
            version = %stored.version_id(),
            entries,
            "wrote resource version"
        );
        Ok(stored)
    }

    /// Extracts and inserts the index rows of a document.
    ///
    /// Returns the number of rows and a warning for every typed reference
    /// whose target is not a live resource.
    pub(crate) fn index_resource(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: &str,
        resource: &Value,
    ) -> StorageResult<(usize, Vec<ReferenceWarning>)> {
        let values = self.search_extractor().extract(resource, resource_type)?;
        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO search_index (
                    resource_type, resource_id, param_name,
                    value_string, value_string_raw,
                    value_token_system, value_token_code, value_token_display,
                    value_date_start, value_date_end, value_number,
                    value_quantity_value, value_quantity_unit, value_quantity_system, value_quantity_code,
                    value_reference, value_reference_type, value_reference_id, value_reference_version,
                    value_uri
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            )
            .map_err(|e| internal_error(format!("Failed to prepare index insert: {}", e)))?;

        let mut warnings = Vec::new();
        for extracted in &values {
            let row = IndexRow::from_value(&extracted.value);
            stmt.execute(params![
                resource_type,
                id,
                extracted.param_name,
                row.string,
                row.string_raw,
                row.token_system,
                row.token_code,
                row.token_display,
                row.date_start,
                row.date_end,
                row.number,
                row.quantity_value,
                row.quantity_unit,
                row.quantity_system,
                row.quantity_code,
                row.reference,
                row.reference_type,
                row.reference_id,
                row.reference_version,
                row.uri,
            ])
            .map_err(|e| internal_error(format!("Failed to insert index row: {}", e)))?;

            if let IndexValue::Reference {
                raw,
                target:
                    ReferenceTarget::Local {
                        resource_type: Some(target_type),
                        id: target_id,
                        ..
                    },
            } = &extracted.value
            {
                let is_self = target_type == resource_type && target_id == id;
                if !is_self && !is_live(conn, target_type, target_id)? {
                    let reference = raw
                        .clone()
                        .unwrap_or_else(|| format!("{}/{}", target_type, target_id));
                    tracing::warn!(
                        resource_type = %resource_type,
                        id = %id,
                        parameter = %extracted.param_name,
                        reference = %reference,
                        "dangling reference stored"
                    );
                    warnings.push(ReferenceWarning {
                        parameter: extracted.param_name.clone(),
                        reference,
                        message: format!("{}/{} does not exist", target_type, target_id),
                    });
                }
            }
        }
        Ok((values.len(), warnings))
    }

    /// Deletes all index rows of a resource.
    pub(crate) fn delete_search_index(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<()> {
        conn.execute(
            "DELETE FROM search_index WHERE resource_type = ?1 AND resource_id = ?2",
            params![resource_type, id],
        )
        .map_err(|e| internal_error(format!("Failed to delete search index: {}", e)))?;
        Ok(())
    }
}

fn insert_history(
    conn: &Connection,
    resource_type: &str,
    id: &str,
    version_id: &str,
    data: Option<&[u8]>,
    last_updated: &str,
    method: ResourceMethod,
) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO resource_history (resource_type, id, version_id, data, last_updated, is_deleted, method)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            resource_type,
            id,
            version_id,
            data,
            last_updated,
            (method == ResourceMethod::Delete) as i64,
            method.as_column(),
        ],
    )
    .map_err(|e| internal_error(format!("Failed to insert history: {}", e)))?;
    Ok(())
}
