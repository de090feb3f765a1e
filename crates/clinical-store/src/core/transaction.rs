//! Transaction traits and bundle types.
//!
//! [`Transaction`] exposes CRUD inside one atomic unit of work.
//! [`BundleProvider`] processes `transaction` and `batch` bundles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{StorageError, StorageResult, TransactionError};
use crate::types::StoredResource;

use super::storage::ResourceStorage;

/// A database transaction.
///
/// Changes are only persisted when `commit()` is called. Reads inside the
/// transaction see its own uncommitted writes. Change events for the writes
/// are published after a successful commit and never on rollback.
///
/// # Example
///
/// ```ignore
/// use helios_clinical_store::core::{Transaction, TransactionProvider};
///
/// async fn admit<S: TransactionProvider>(storage: &S) -> Result<(), StorageError> {
///     let mut tx = storage.begin_transaction().await?;
///     let patient = tx.create("Patient", json!({"resourceType": "Patient"})).await?;
///     tx.create("Encounter", json!({
///         "resourceType": "Encounter",
///         "subject": {"reference": patient.url()}
///     })).await?;
///     Box::new(tx).commit().await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait Transaction: Send {
    /// Creates a new resource within this transaction.
    async fn create(&mut self, resource_type: &str, resource: Value)
    -> StorageResult<StoredResource>;

    /// Reads a resource within this transaction.
    async fn read(&mut self, resource_type: &str, id: &str) -> StorageResult<StoredResource>;

    /// Updates a resource within this transaction.
    async fn update(
        &mut self,
        resource_type: &str,
        id: &str,
        resource: Value,
        expected_version: Option<&str>,
    ) -> StorageResult<StoredResource>;

    /// Deletes a resource within this transaction.
    async fn delete(&mut self, resource_type: &str, id: &str) -> StorageResult<StoredResource>;

    /// Commits the transaction, persisting all changes.
    async fn commit(self: Box<Self>) -> StorageResult<()>;

    /// Rolls back the transaction, discarding all changes.
    async fn rollback(self: Box<Self>) -> StorageResult<()>;

    /// Returns whether this transaction is still active.
    fn is_active(&self) -> bool;
}

/// Provider for transaction support.
#[async_trait]
pub trait TransactionProvider: ResourceStorage {
    /// The transaction type returned by this provider.
    type Transaction: Transaction;

    /// Begins a new write transaction.
    ///
    /// # Errors
    ///
    /// * `StorageError::Backend` - if a connection cannot be acquired
    async fn begin_transaction(&self) -> StorageResult<Self::Transaction>;
}

/// HTTP method for bundle entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BundleMethod {
    /// Read.
    Get,
    /// Create.
    Post,
    /// Update or create.
    Put,
    /// Partial update.
    Patch,
    /// Delete.
    Delete,
}

impl BundleMethod {
    /// Processing rank inside a transaction: deletes, creates, updates, reads.
    pub fn transaction_order(&self) -> u8 {
        match self {
            BundleMethod::Delete => 0,
            BundleMethod::Post => 1,
            BundleMethod::Put | BundleMethod::Patch => 2,
            BundleMethod::Get => 3,
        }
    }
}

impl std::fmt::Display for BundleMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BundleMethod::Get => write!(f, "GET"),
            BundleMethod::Post => write!(f, "POST"),
            BundleMethod::Put => write!(f, "PUT"),
            BundleMethod::Patch => write!(f, "PATCH"),
            BundleMethod::Delete => write!(f, "DELETE"),
        }
    }
}

impl std::str::FromStr for BundleMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" | "HEAD" => Ok(BundleMethod::Get),
            "POST" => Ok(BundleMethod::Post),
            "PUT" => Ok(BundleMethod::Put),
            "PATCH" => Ok(BundleMethod::Patch),
            "DELETE" => Ok(BundleMethod::Delete),
            _ => Err(format!("unsupported bundle method: {}", s)),
        }
    }
}

/// Entry in a transaction or batch bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEntry {
    /// The HTTP method for this entry.
    pub method: BundleMethod,
    /// The request URL (`Patient`, `Patient/1`, `Patient?identifier=x`).
    pub url: String,
    /// The entry's fullUrl, possibly a `urn:uuid:` placeholder.
    pub full_url: Option<String>,
    /// The resource content (for POST and PUT) or patch document (PATCH).
    pub resource: Option<Value>,
    /// If-Match header value.
    pub if_match: Option<String>,
    /// If-None-Match header value.
    pub if_none_match: Option<String>,
    /// If-None-Exist header for conditional creates.
    pub if_none_exist: Option<String>,
}

impl BundleEntry {
    /// Creates an entry with just a method and URL.
    pub fn new(method: BundleMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            full_url: None,
            resource: None,
            if_match: None,
            if_none_match: None,
            if_none_exist: None,
        }
    }

    /// Sets the resource body.
    pub fn with_resource(mut self, resource: Value) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Sets the fullUrl.
    pub fn with_full_url(mut self, full_url: impl Into<String>) -> Self {
        self.full_url = Some(full_url.into());
        self
    }

    /// Sets the If-None-Exist criteria.
    pub fn with_if_none_exist(mut self, criteria: impl Into<String>) -> Self {
        self.if_none_exist = Some(criteria.into());
        self
    }

    /// Sets the If-Match version.
    pub fn with_if_match(mut self, etag: impl Into<String>) -> Self {
        self.if_match = Some(etag.into());
        self
    }

    /// Parses one `Bundle.entry` element.
    pub fn from_json(entry: &Value) -> StorageResult<Self> {
        let request = entry.get("request").ok_or_else(|| invalid_bundle("entry has no request"))?;
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_bundle("entry request has no method"))?
            .parse::<BundleMethod>()
            .map_err(|e| invalid_bundle(&e))?;
        let url = request
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_bundle("entry request has no url"))?;
        let text = |v: &Value, field: &str| v.get(field).and_then(Value::as_str).map(str::to_string);

        Ok(Self {
            method,
            url: url.to_string(),
            full_url: text(entry, "fullUrl"),
            resource: entry.get("resource").cloned(),
            if_match: text(request, "ifMatch"),
            if_none_match: text(request, "ifNoneMatch"),
            if_none_exist: text(request, "ifNoneExist"),
        })
    }
}

fn invalid_bundle(message: &str) -> StorageError {
    StorageError::Transaction(TransactionError::InvalidBundle {
        message: message.to_string(),
    })
}

/// Type of bundle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleType {
    /// All-or-nothing.
    Transaction,
    /// Independent operations.
    Batch,
}

/// Parses a `transaction` or `batch` Bundle into its entries.
pub fn parse_bundle(bundle: &Value) -> StorageResult<(BundleType, Vec<BundleEntry>)> {
    if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
        return Err(invalid_bundle("resourceType must be Bundle"));
    }
    let bundle_type = match bundle.get("type").and_then(Value::as_str) {
        Some("transaction") => BundleType::Transaction,
        Some("batch") => BundleType::Batch,
        other => {
            return Err(invalid_bundle(&format!(
                "bundle type must be transaction or batch, got {:?}",
                other
            )));
        }
    };
    let entries = match bundle.get("entry") {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(BundleEntry::from_json)
            .collect::<StorageResult<Vec<_>>>()?,
        Some(_) => return Err(invalid_bundle("entry must be an array")),
    };
    Ok((bundle_type, entries))
}

/// Result of a bundle entry execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEntryResult {
    /// HTTP status code.
    pub status: u16,
    /// Location header (for creates).
    pub location: Option<String>,
    /// ETag header.
    pub etag: Option<String>,
    /// Last-Modified header.
    pub last_modified: Option<String>,
    /// Response resource (for reads, creates, updates).
    pub resource: Option<Value>,
    /// OperationOutcome for errors and warnings.
    pub outcome: Option<Value>,
}

impl BundleEntryResult {
    /// Result for a create.
    pub fn created(resource: StoredResource) -> Self {
        Self::with_status(201, resource, true)
    }

    /// Result for a read or update.
    pub fn ok(resource: StoredResource) -> Self {
        Self::with_status(200, resource, false)
    }

    fn with_status(status: u16, resource: StoredResource, location: bool) -> Self {
        let outcome = warnings_outcome(&resource);
        Self {
            status,
            location: location.then(|| resource.versioned_url()),
            etag: Some(resource.etag().to_string()),
            last_modified: Some(resource.last_modified().to_rfc3339()),
            resource: Some(resource.into_content()),
            outcome,
        }
    }

    /// Result for a delete.
    pub fn deleted(tombstone: Option<&StoredResource>) -> Self {
        Self {
            status: 204,
            location: None,
            etag: tombstone.map(|t| t.etag().to_string()),
            last_modified: None,
            resource: None,
            outcome: None,
        }
    }

    /// Result for a failed entry.
    pub fn error(status: u16, outcome: Value) -> Self {
        Self {
            status,
            location: None,
            etag: None,
            last_modified: None,
            resource: None,
            outcome: Some(outcome),
        }
    }

    /// Result for an entry that failed with `err`.
    pub fn from_error(err: &StorageError) -> Self {
        Self::error(err.http_status(), err.to_operation_outcome())
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Renders the entry as a response `Bundle.entry`.
    pub fn to_json(&self) -> Value {
        let mut response = json!({"status": status_line(self.status)});
        if let Some(ref location) = self.location {
            response["location"] = json!(location);
        }
        if let Some(ref etag) = self.etag {
            response["etag"] = json!(etag);
        }
        if let Some(ref last_modified) = self.last_modified {
            response["lastModified"] = json!(last_modified);
        }
        if let Some(ref outcome) = self.outcome {
            response["outcome"] = outcome.clone();
        }
        let mut entry = json!({"response": response});
        if let Some(ref resource) = self.resource {
            entry["resource"] = resource.clone();
        }
        entry
    }
}

fn warnings_outcome(resource: &StoredResource) -> Option<Value> {
    if resource.warnings().is_empty() {
        return None;
    }
    let issues: Vec<Value> = resource
        .warnings()
        .iter()
        .map(|w| {
            json!({
                "severity": "warning",
                "code": "not-found",
                "diagnostics": format!("{} ({}): {}", w.reference, w.parameter, w.message),
            })
        })
        .collect();
    Some(json!({"resourceType": "OperationOutcome", "issue": issues}))
}

fn status_line(status: u16) -> String {
    let reason = match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        412 => "Precondition Failed",
        _ => "",
    };
    if reason.is_empty() {
        status.to_string()
    } else {
        format!("{} {}", status, reason)
    }
}

/// Result of processing a transaction or batch bundle.
#[derive(Debug, Clone)]
pub struct BundleResult {
    /// The bundle type.
    pub bundle_type: BundleType,
    /// Results for each entry, in the order of the request entries.
    pub entries: Vec<BundleEntryResult>,
}

impl BundleResult {
    /// Renders a `transaction-response` or `batch-response` Bundle.
    pub fn to_bundle(&self) -> Value {
        let bundle_type = match self.bundle_type {
            BundleType::Transaction => "transaction-response",
            BundleType::Batch => "batch-response",
        };
        json!({
            "resourceType": "Bundle",
            "type": bundle_type,
            "entry": self.entries.iter().map(BundleEntryResult::to_json).collect::<Vec<_>>(),
        })
    }
}

/// Provider for bundle operations.
#[async_trait]
pub trait BundleProvider: ResourceStorage {
    /// Processes a transaction bundle (all-or-nothing).
    ///
    /// Every entry is applied in one atomic unit. `urn:uuid:` fullUrls are
    /// replaced with the assigned ids before anything is persisted.
    ///
    /// # Errors
    ///
    /// * `TransactionError::Aborted` - names the first failing entry index;
    ///   nothing was persisted
    async fn process_transaction(
        &self,
        entries: Vec<BundleEntry>,
    ) -> Result<BundleResult, TransactionError>;

    /// Processes a batch bundle (independent operations).
    ///
    /// Each entry commits or fails on its own.
    async fn process_batch(&self, entries: Vec<BundleEntry>) -> StorageResult<BundleResult>;

    /// Parses a Bundle and dispatches on its type.
    async fn process_bundle(&self, bundle: &Value) -> StorageResult<BundleResult> {
        let (bundle_type, entries) = parse_bundle(bundle)?;
        match bundle_type {
            BundleType::Transaction => Ok(self.process_transaction(entries).await?),
            BundleType::Batch => self.process_batch(entries).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResourceError;

    #[test]
    fn test_bundle_method_parse_and_order() {
        assert_eq!("post".parse::<BundleMethod>().unwrap(), BundleMethod::Post);
        assert!("TRACE".parse::<BundleMethod>().is_err());

        let mut methods = vec![
            BundleMethod::Get,
            BundleMethod::Put,
            BundleMethod::Post,
            BundleMethod::Delete,
        ];
        methods.sort_by_key(|m| m.transaction_order());
        assert_eq!(
            methods,
            vec![
                BundleMethod::Delete,
                BundleMethod::Post,
                BundleMethod::Put,
                BundleMethod::Get
            ]
        );
    }

    #[test]
    fn test_parse_bundle() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [{
                "fullUrl": "urn:uuid:61ebe359-bfdc-4613-8bf2-c5e300945f0a",
                "resource": {"resourceType": "Patient"},
                "request": {"method": "POST", "url": "Patient", "ifNoneExist": "identifier=x|1"}
            }]
        });

        let (kind, entries) = parse_bundle(&bundle).unwrap();
        assert_eq!(kind, BundleType::Transaction);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].method, BundleMethod::Post);
        assert_eq!(entries[0].if_none_exist.as_deref(), Some("identifier=x|1"));
        assert!(entries[0].full_url.as_deref().unwrap().starts_with("urn:uuid:"));
    }

    #[test]
    fn test_parse_bundle_rejects_other_types() {
        let searchset = json!({"resourceType": "Bundle", "type": "searchset"});
        assert!(parse_bundle(&searchset).is_err());

        let no_request = json!({"resourceType": "Bundle", "type": "batch", "entry": [{}]});
        assert!(parse_bundle(&no_request).is_err());
    }

    #[test]
    fn test_bundle_entry_result_created() {
        let resource = StoredResource::new("Patient", "123", json!({"resourceType": "Patient"}));

        let result = BundleEntryResult::created(resource);
        assert_eq!(result.status, 201);
        assert_eq!(result.location.as_deref(), Some("Patient/123/_history/1"));
        assert!(result.is_success());
        assert_eq!(result.to_json()["response"]["status"], "201 Created");
    }

    #[test]
    fn test_bundle_entry_result_from_error() {
        let err = StorageError::Resource(ResourceError::NotFound {
            resource_type: "Patient".to_string(),
            id: "x".to_string(),
        });
        let result = BundleEntryResult::from_error(&err);
        assert_eq!(result.status, 404);
        assert!(!result.is_success());
        assert_eq!(result.to_json()["response"]["outcome"]["issue"][0]["code"], "not-found");
    }

    #[test]
    fn test_bundle_result_to_bundle() {
        let result = BundleResult {
            bundle_type: BundleType::Batch,
            entries: vec![BundleEntryResult::deleted(None)],
        };
        let bundle = result.to_bundle();
        assert_eq!(bundle["type"], "batch-response");
        assert_eq!(bundle["entry"][0]["response"]["status"], "204 No Content");
    }
}
