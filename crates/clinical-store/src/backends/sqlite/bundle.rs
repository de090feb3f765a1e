//! Transaction and batch bundle processing for SQLite.
//!
//! A transaction runs every entry inside one immediate write transaction, in
//! the order DELETE, POST, PUT/PATCH, GET. Before any POST or conditional PUT
//! is persisted its `fullUrl` is mapped to the `Type/id` it will receive, and references and
//! conditional criteria in the other entries are rewritten through that map.
//! A batch runs each entry in its own write transaction.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::Value;

use crate::core::{
    BundleEntry, BundleEntryResult, BundleMethod, BundleProvider, BundleResult, BundleType,
    ConditionalCreateResult, ConditionalDeleteResult, ConditionalPatchResult,
    ConditionalUpdateResult, PatchFormat, SearchProvider,
};
use crate::error::{
    ResourceError, StorageError, StorageResult, TransactionError, ValidationError,
};
use crate::search::{ReferenceResolver, normalize_criteria, parse_criteria};
use crate::types::{ResourceMethod, StoredResource};

use super::SqliteBackend;
use super::storage::read_version;
use super::writer::{ChangeSet, read_live, validate_id};

/// What an entry's request URL addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryTarget {
    /// `Type` or `Type?criteria`.
    Type {
        resource_type: String,
        criteria: Option<String>,
    },
    /// `Type/id`.
    Instance { resource_type: String, id: String },
    /// `Type/id/_history/vid`.
    Version {
        resource_type: String,
        id: String,
        version_id: String,
    },
}

impl EntryTarget {
    fn parse(url: &str) -> StorageResult<Self> {
        let url = url.trim().trim_start_matches('/');
        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (url, None),
        };
        let criteria = query.filter(|q| !q.is_empty()).map(str::to_string);
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match (segments.as_slice(), criteria) {
            ([resource_type], criteria) => Ok(EntryTarget::Type {
                resource_type: resource_type.to_string(),
                criteria,
            }),
            ([resource_type, id], None) => Ok(EntryTarget::Instance {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            }),
            ([resource_type, id, "_history", version_id], None) => Ok(EntryTarget::Version {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                version_id: version_id.to_string(),
            }),
            _ => Err(invalid_entry(format!("unsupported request url '{}'", url))),
        }
    }

    fn resource_type(&self) -> &str {
        match self {
            EntryTarget::Type { resource_type, .. }
            | EntryTarget::Instance { resource_type, .. }
            | EntryTarget::Version { resource_type, .. } => resource_type,
        }
    }

    /// `(type, id)` of an instance-level target.
    fn instance_key(&self) -> Option<(String, String)> {
        match self {
            EntryTarget::Instance { resource_type, id }
            | EntryTarget::Version {
                resource_type, id, ..
            } => Some((resource_type.clone(), id.clone())),
            EntryTarget::Type { .. } => None,
        }
    }
}

fn invalid_entry(message: String) -> StorageError {
    StorageError::Validation(ValidationError::InvalidResource { message })
}

fn aborted(index: usize, source: StorageError) -> StorageError {
    StorageError::Transaction(TransactionError::Aborted {
        index,
        source: Box::new(source),
    })
}

/// An entry ready to run: its parsed target and, for POSTs and conditional
/// PUTs, the id it was promised while placeholders were being assigned.
struct PreparedEntry {
    index: usize,
    entry: BundleEntry,
    target: EntryTarget,
    assigned_id: Option<String>,
    existing: Option<String>,
}

#[async_trait]
impl BundleProvider for SqliteBackend {
    async fn process_transaction(
        &self,
        entries: Vec<BundleEntry>,
    ) -> Result<BundleResult, TransactionError> {
        let count = entries.len();
        let result = self.write(|conn, changes| {
            let mut prepared = prepare(entries)?;
            check_distinct_targets(&prepared)?;
            prepared.sort_by_key(|p| (p.entry.method.transaction_order(), p.index));

            let resolver = ReferenceResolver::new();
            let mut placeholders = HashMap::new();
            for p in &prepared {
                if let (Some(full_url), Some(key)) = (&p.entry.full_url, p.target.instance_key()) {
                    placeholders.insert(full_url.clone(), format!("{}/{}", key.0, key.1));
                }
            }

            let mut results: Vec<Option<BundleEntryResult>> = vec![None; count];
            let mut posts_assigned = false;
            for i in 0..prepared.len() {
                if prepared[i].entry.method != BundleMethod::Delete && !posts_assigned {
                    self.assign_ids(conn, &resolver, &mut prepared, &mut placeholders)?;
                    posts_assigned = true;
                }
                let p = &mut prepared[i];
                rewrite_entry(&resolver, p, &placeholders);
                let result = self
                    .execute_entry(conn, changes, p)
                    .map_err(|e| aborted(p.index, e))?;
                results[p.index] = Some(result);
            }

            Ok(BundleResult {
                bundle_type: BundleType::Transaction,
                entries: results.into_iter().flatten().collect(),
            })
        });

        match result {
            Ok(result) => {
                tracing::info!(entries = count, "committed transaction bundle");
                Ok(result)
            }
            Err(StorageError::Transaction(TransactionError::Aborted { index, source })) => {
                tracing::warn!(index, error = %source, "transaction bundle aborted");
                Err(TransactionError::Aborted { index, source })
            }
            Err(StorageError::Transaction(other)) => Err(other),
            Err(other) => {
                tracing::warn!(error = %other, "transaction bundle rolled back");
                Err(TransactionError::RolledBack {
                    reason: other.to_string(),
                })
            }
        }
    }

    async fn process_batch(&self, entries: Vec<BundleEntry>) -> StorageResult<BundleResult> {
        let mut results = Vec::with_capacity(entries.len());

        // Batch entries may not depend on each other, so no placeholders.
        for (index, entry) in entries.into_iter().enumerate() {
            let outcome = EntryTarget::parse(&entry.url).and_then(|target| {
                let p = PreparedEntry {
                    index,
                    entry,
                    target,
                    assigned_id: None,
                    existing: None,
                };
                self.write(|conn, changes| self.execute_entry(conn, changes, &p))
            });
            let result = match outcome {
                Ok(result) => result,
                Err(err) => {
                    tracing::debug!(index, error = %err, "batch entry failed");
                    BundleEntryResult::from_error(&err)
                }
            };
            results.push(result);
        }

        let failed = results.iter().filter(|r| !r.is_success()).count();
        tracing::info!(entries = results.len(), failed, "processed batch bundle");
        Ok(BundleResult {
            bundle_type: BundleType::Batch,
            entries: results,
        })
    }
}

fn prepare(entries: Vec<BundleEntry>) -> StorageResult<Vec<PreparedEntry>> {
    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let target = EntryTarget::parse(&entry.url).map_err(|e| aborted(index, e))?;
            Ok(PreparedEntry {
                index,
                entry,
                target,
                assigned_id: None,
                existing: None,
            })
        })
        .collect()
}

/// Rejects two entries addressing the same `Type/id`.
fn check_distinct_targets(prepared: &[PreparedEntry]) -> StorageResult<()> {
    let mut seen = HashSet::new();
    for p in prepared {
        if let Some(key) = p.target.instance_key() {
            if !seen.insert(key.clone()) {
                return Err(aborted(
                    p.index,
                    invalid_entry(format!(
                        "{}/{} is addressed by more than one entry",
                        key.0, key.1
                    )),
                ));
            }
        }
    }
    Ok(())
}

/// Rewrites placeholder references in the body and criteria of an entry.
fn rewrite_entry(
    resolver: &ReferenceResolver,
    p: &mut PreparedEntry,
    placeholders: &HashMap<String, String>,
) {
    if placeholders.is_empty() {
        return;
    }
    if let Some(resource) = p.entry.resource.as_mut() {
        resolver.rewrite_placeholders(resource, placeholders);
    }
    if let EntryTarget::Type {
        criteria: Some(criteria),
        ..
    } = &mut p.target
    {
        *criteria = resolver.rewrite_criteria(criteria, placeholders);
    }
    if let Some(criteria) = p.entry.if_none_exist.as_mut() {
        *criteria = resolver.rewrite_criteria(criteria, placeholders);
    }
}

impl SqliteBackend {
    /// Decides the id of every POST and conditional PUT before any of them
    /// is persisted, so later entries can reference them by `fullUrl`.
    ///
    /// A conditional create that already matches takes the existing id, and
    /// so does a later POST in the same bundle repeating earlier criteria.
    /// Otherwise the body's id or a fresh UUID is used.
    fn assign_ids(
        &self,
        conn: &Connection,
        resolver: &ReferenceResolver,
        prepared: &mut [PreparedEntry],
        placeholders: &mut HashMap<String, String>,
    ) -> StorageResult<()> {
        let mut claimed: HashMap<(String, String), String> = HashMap::new();

        for p in prepared.iter_mut() {
            let resource_type = p.target.resource_type().to_string();
            let criteria = match (p.entry.method, &p.target) {
                (BundleMethod::Post, _) => p.entry.if_none_exist.clone(),
                (BundleMethod::Put, EntryTarget::Type { criteria, .. }) => criteria.clone(),
                _ => continue,
            };

            let mut claim = None;
            if let Some(criteria) = criteria {
                let criteria = resolver.rewrite_criteria(&criteria, placeholders);
                let key = (resource_type.clone(), normalize_criteria(&criteria));
                let matched = match claimed.get(&key) {
                    Some(id) if p.entry.method == BundleMethod::Post => Some(id.clone()),
                    _ => self
                        .single_match(conn, &resource_type, &criteria)
                        .map_err(|e| aborted(p.index, e))?,
                };
                if let Some(id) = matched {
                    map_full_url(placeholders, p, &resource_type, &id);
                    p.existing = Some(id);
                    continue;
                }
                if p.entry.method == BundleMethod::Post {
                    claim = Some(key);
                }
            }

            let id = new_entry_id(p)?;
            if let Some(key) = claim {
                claimed.insert(key, id.clone());
            }
            map_full_url(placeholders, p, &resource_type, &id);
            p.assigned_id = Some(id);
        }
        Ok(())
    }

    fn execute_entry(
        &self,
        conn: &Connection,
        changes: &mut ChangeSet,
        p: &PreparedEntry,
    ) -> StorageResult<BundleEntryResult> {
        let entry = &p.entry;
        match (entry.method, &p.target) {
            (BundleMethod::Get, EntryTarget::Instance { resource_type, id }) => {
                Ok(BundleEntryResult::ok(read_live(conn, resource_type, id)?))
            }
            (
                BundleMethod::Get,
                EntryTarget::Version {
                    resource_type,
                    id,
                    version_id,
                },
            ) => Ok(BundleEntryResult::ok(read_version(
                conn,
                resource_type,
                id,
                version_id,
            )?)),
            (BundleMethod::Get, EntryTarget::Type { resource_type, criteria }) => {
                self.search_entry(conn, resource_type, criteria.as_deref(), &entry.url)
            }

            (BundleMethod::Post, EntryTarget::Type { resource_type, criteria: None }) => {
                if let Some(id) = &p.existing {
                    return Ok(BundleEntryResult::ok(read_live(conn, resource_type, id)?));
                }
                let mut resource = body(entry)?;
                if let (Some(id), Some(obj)) = (&p.assigned_id, resource.as_object_mut()) {
                    obj.insert("id".to_string(), Value::String(id.clone()));
                }
                match entry.if_none_exist.as_deref() {
                    Some(criteria) if p.assigned_id.is_none() => {
                        match self.conditional_create_in(
                            conn,
                            changes,
                            resource_type,
                            resource,
                            criteria,
                        )? {
                            ConditionalCreateResult::Created(stored) => {
                                Ok(BundleEntryResult::created(stored))
                            }
                            ConditionalCreateResult::Exists(stored) => {
                                Ok(BundleEntryResult::ok(stored))
                            }
                        }
                    }
                    _ => Ok(BundleEntryResult::created(self.insert_resource(
                        conn,
                        changes,
                        resource_type,
                        resource,
                    )?)),
                }
            }

            (BundleMethod::Put, EntryTarget::Instance { resource_type, id }) => {
                let (stored, created) = self.replace_resource(
                    conn,
                    changes,
                    resource_type,
                    id,
                    body(entry)?,
                    entry.if_match.as_deref(),
                    ResourceMethod::Put,
                    true,
                )?;
                Ok(written(stored, created))
            }
            (
                BundleMethod::Put,
                EntryTarget::Type {
                    resource_type,
                    criteria: Some(criteria),
                },
            ) => match p.existing.as_ref().or(p.assigned_id.as_ref()) {
                Some(id) => {
                    let (stored, created) = self.replace_resource(
                        conn,
                        changes,
                        resource_type,
                        id,
                        body(entry)?,
                        None,
                        ResourceMethod::Put,
                        true,
                    )?;
                    Ok(written(stored, created))
                }
                None => match self.conditional_update_in(
                    conn,
                    changes,
                    resource_type,
                    body(entry)?,
                    criteria,
                )? {
                    ConditionalUpdateResult::Created(stored) => {
                        Ok(BundleEntryResult::created(stored))
                    }
                    ConditionalUpdateResult::Updated(stored) => Ok(BundleEntryResult::ok(stored)),
                },
            },

            (BundleMethod::Patch, EntryTarget::Instance { resource_type, id }) => {
                let stored = self.patch_in(
                    conn,
                    changes,
                    resource_type,
                    id,
                    &patch_document(entry)?,
                    entry.if_match.as_deref(),
                )?;
                Ok(BundleEntryResult::ok(stored))
            }
            (
                BundleMethod::Patch,
                EntryTarget::Type {
                    resource_type,
                    criteria: Some(criteria),
                },
            ) => match self.conditional_patch_in(
                conn,
                changes,
                resource_type,
                criteria,
                &patch_document(entry)?,
            )? {
                ConditionalPatchResult::Patched(stored) => Ok(BundleEntryResult::ok(stored)),
                ConditionalPatchResult::NoMatch => Err(no_match(resource_type, criteria)),
            },

            (BundleMethod::Delete, EntryTarget::Instance { resource_type, id }) => {
                let tombstone = self.tombstone_resource(
                    conn,
                    changes,
                    resource_type,
                    id,
                    entry.if_match.as_deref(),
                )?;
                Ok(BundleEntryResult::deleted(Some(&tombstone)))
            }
            (
                BundleMethod::Delete,
                EntryTarget::Type {
                    resource_type,
                    criteria: Some(criteria),
                },
            ) => match self.conditional_delete_in(conn, changes, resource_type, criteria)? {
                ConditionalDeleteResult::Deleted(tombstone) => {
                    Ok(BundleEntryResult::deleted(Some(&tombstone)))
                }
                ConditionalDeleteResult::NoMatch => Ok(BundleEntryResult::deleted(None)),
            },

            (method, _) => Err(invalid_entry(format!(
                "{} is not supported on '{}'",
                method, entry.url
            ))),
        }
    }

    /// A GET with a type-level URL: runs the search and answers with a
    /// `searchset` Bundle.
    fn search_entry(
        &self,
        conn: &Connection,
        resource_type: &str,
        criteria: Option<&str>,
        url: &str,
    ) -> StorageResult<BundleEntryResult> {
        let params = criteria.map(parse_criteria).unwrap_or_default();
        let query = self.parse_query(resource_type, &params)?;
        let result = self.search_on(conn, &query)?;
        Ok(BundleEntryResult {
            status: 200,
            location: None,
            etag: None,
            last_modified: None,
            resource: Some(result.to_bundle("", url)),
            outcome: None,
        })
    }
}

/// The body's id when it has a valid one, else a fresh UUID.
fn new_entry_id(p: &PreparedEntry) -> StorageResult<String> {
    match p
        .entry
        .resource
        .as_ref()
        .and_then(|r| r.get("id"))
        .and_then(Value::as_str)
    {
        Some(id) => {
            validate_id(id).map_err(|e| aborted(p.index, e))?;
            Ok(id.to_string())
        }
        None => Ok(uuid::Uuid::new_v4().to_string()),
    }
}

fn map_full_url(
    placeholders: &mut HashMap<String, String>,
    p: &PreparedEntry,
    resource_type: &str,
    id: &str,
) {
    if let Some(full_url) = &p.entry.full_url {
        placeholders.insert(full_url.clone(), format!("{}/{}", resource_type, id));
    }
}

fn body(entry: &BundleEntry) -> StorageResult<Value> {
    entry.resource.clone().ok_or_else(|| {
        StorageError::Validation(ValidationError::MissingRequiredField {
            field: "entry.resource".to_string(),
        })
    })
}

/// A JSON array is a JSON Patch; an object is a merge patch.
fn patch_document(entry: &BundleEntry) -> StorageResult<PatchFormat> {
    match body(entry)? {
        patch @ Value::Array(_) => Ok(PatchFormat::JsonPatch(patch)),
        patch @ Value::Object(_) => Ok(PatchFormat::MergePatch(patch)),
        _ => Err(invalid_entry(
            "a patch must be a JSON Patch array or a merge patch object".to_string(),
        )),
    }
}

fn written(stored: StoredResource, created: bool) -> BundleEntryResult {
    if created {
        BundleEntryResult::created(stored)
    } else {
        BundleEntryResult::ok(stored)
    }
}

fn no_match(resource_type: &str, criteria: &str) -> StorageError {
    StorageError::Resource(ResourceError::NotFound {
        resource_type: resource_type.to_string(),
        id: format!("?{}", criteria),
    })
}
