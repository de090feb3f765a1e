//! Search provider traits.
//!
//! - [`SearchProvider`] - single-type search with pagination and totals
//! - [`IncludeProvider`] - `_include`
//! - [`RevincludeProvider`] - `_revinclude`
//! - [`ChainedSearchProvider`] - chained parameters and `_has`

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::StorageResult;
use crate::types::{
    IncludeDirective, Page, ReverseChainedParameter, SearchQuery, StoredResource,
};

use super::storage::ResourceStorage;

/// Result of a search operation.
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// The matching resources.
    pub resources: Page<StoredResource>,

    /// Included resources (from _include/_revinclude).
    pub included: Vec<StoredResource>,

    /// Total count of matches (if requested via _total).
    pub total: Option<u64>,

    /// True when include expansion stopped at the depth or count cap.
    pub included_truncated: bool,
}

impl SearchResult {
    /// Creates a new search result.
    pub fn new(resources: Page<StoredResource>) -> Self {
        Self {
            resources,
            included: Vec::new(),
            total: None,
            included_truncated: false,
        }
    }

    /// Adds included resources.
    pub fn with_included(mut self, included: Vec<StoredResource>, truncated: bool) -> Self {
        self.included = included;
        self.included_truncated = truncated;
        self
    }

    /// Sets the total count.
    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    /// Ids of the matching resources, in page order.
    pub fn ids(&self) -> Vec<&str> {
        self.resources.items.iter().map(|r| r.id()).collect()
    }

    /// Converts the result to a `searchset` Bundle.
    pub fn to_bundle(&self, base_url: &str, self_link: &str) -> Value {
        let mut links = vec![json!({"relation": "self", "url": self_link})];
        if let Some(ref cursor) = self.resources.page_info.next_cursor {
            let separator = if self_link.contains('?') { '&' } else { '?' };
            links.push(json!({
                "relation": "next",
                "url": format!("{}{}_cursor={}", self_link, separator, cursor),
            }));
        }

        let matches = self.resources.items.iter().map(|r| (r, "match"));
        let includes = self.included.iter().map(|r| (r, "include"));
        let entries: Vec<Value> = matches
            .chain(includes)
            .map(|(resource, mode)| {
                json!({
                    "fullUrl": format!("{}/{}", base_url.trim_end_matches('/'), resource.url()),
                    "resource": resource.content(),
                    "search": {"mode": mode},
                })
            })
            .collect();

        let mut bundle = json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "link": links,
            "entry": entries,
        });
        if let Some(total) = self.total {
            bundle["total"] = json!(total);
        }
        if self.included_truncated {
            bundle["entry"]
                .as_array_mut()
                .map(|entries| {
                    entries.push(json!({
                        "resource": {
                            "resourceType": "OperationOutcome",
                            "issue": [{
                                "severity": "warning",
                                "code": "incomplete",
                                "diagnostics": "included resources were truncated",
                            }],
                        },
                        "search": {"mode": "outcome"},
                    }))
                });
        }
        bundle
    }
}

/// Basic search provider for single resource type queries.
///
/// # Example
///
/// ```ignore
/// use helios_clinical_store::core::SearchProvider;
///
/// async fn smiths<S: SearchProvider>(storage: &S) -> Result<(), StorageError> {
///     let params = vec![("name".to_string(), "Smith".to_string())];
///     let result = storage.search_params("Patient", &params).await?;
///     for resource in result.resources.items {
///         println!("Found: {}", resource.url());
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait SearchProvider: ResourceStorage {
    /// Searches for resources matching the query.
    ///
    /// Deleted resources never match. When a total is requested it is
    /// computed against the same snapshot as the returned page.
    ///
    /// # Errors
    ///
    /// * `StorageError::Search(InvalidCursor)` - if the cursor is malformed
    /// * `StorageError::Search(Timeout)` - if the query exceeds the timeout
    async fn search(&self, query: &SearchQuery) -> StorageResult<SearchResult>;

    /// Counts resources matching the query without returning them.
    async fn search_count(&self, query: &SearchQuery) -> StorageResult<u64>;

    /// Parses raw `(name, value)` query pairs into a [`SearchQuery`].
    ///
    /// # Errors
    ///
    /// * `StorageError::Search(UnknownParameter)` - for parameters that are
    ///   not registered for the resource type
    fn parse_query(
        &self,
        resource_type: &str,
        params: &[(String, String)],
    ) -> StorageResult<SearchQuery>;

    /// Parses and runs a query given as raw pairs.
    async fn search_params(
        &self,
        resource_type: &str,
        params: &[(String, String)],
    ) -> StorageResult<SearchResult> {
        let query = self.parse_query(resource_type, params)?;
        self.search(&query).await
    }
}

/// Search provider that supports _include.
#[async_trait]
pub trait IncludeProvider: SearchProvider {
    /// Resources referenced by `resources` through the include directives.
    async fn resolve_includes(
        &self,
        resources: &[StoredResource],
        includes: &[IncludeDirective],
    ) -> StorageResult<Vec<StoredResource>>;
}

/// Search provider that supports _revinclude.
#[async_trait]
pub trait RevincludeProvider: SearchProvider {
    /// Resources that reference `resources` through the directives.
    async fn resolve_revincludes(
        &self,
        resources: &[StoredResource],
        revincludes: &[IncludeDirective],
    ) -> StorageResult<Vec<StoredResource>>;
}

/// Search provider that supports chained parameters and _has.
///
/// `Observation?subject:Patient.name=Smith` and
/// `Patient?_has:Observation:subject:code=1234-5`.
#[async_trait]
pub trait ChainedSearchProvider: SearchProvider {
    /// Ids of `base_type` resources satisfying a chain such as
    /// `subject:Patient.name` with `value`.
    async fn resolve_chain(
        &self,
        base_type: &str,
        chain: &str,
        value: &str,
    ) -> StorageResult<Vec<String>>;

    /// Ids of `base_type` resources referenced by resources matching the
    /// reverse chain.
    async fn resolve_reverse_chain(
        &self,
        base_type: &str,
        reverse_chain: &ReverseChainedParameter,
    ) -> StorageResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PageCursor, PageInfo};

    fn patient(id: &str) -> StoredResource {
        StoredResource::new(
            "Patient",
            id,
            json!({"resourceType": "Patient", "id": id}),
        )
    }

    #[test]
    fn test_search_result_with_included() {
        let page = Page::new(vec![patient("1")], PageInfo::end());
        let result = SearchResult::new(page)
            .with_included(vec![patient("2")], false)
            .with_total(100);

        assert_eq!(result.included.len(), 1);
        assert_eq!(result.total, Some(100));
        assert_eq!(result.ids(), vec!["1"]);
    }

    #[test]
    fn test_search_result_to_bundle() {
        let page = Page::new(
            vec![patient("123")],
            PageInfo::with_next(PageCursor::new(vec![], "123")),
        );
        let result = SearchResult::new(page)
            .with_included(vec![patient("9")], true)
            .with_total(1);

        let bundle = result.to_bundle("http://example.com/fhir/", "http://example.com/fhir/Patient");

        assert_eq!(bundle["type"], "searchset");
        assert_eq!(bundle["total"], 1);
        assert_eq!(bundle["entry"][0]["fullUrl"], "http://example.com/fhir/Patient/123");
        assert_eq!(bundle["entry"][0]["search"]["mode"], "match");
        assert_eq!(bundle["entry"][1]["search"]["mode"], "include");
        assert_eq!(bundle["entry"][2]["search"]["mode"], "outcome");
        assert!(
            bundle["link"][1]["url"]
                .as_str()
                .unwrap()
                .starts_with("http://example.com/fhir/Patient?_cursor=")
        );
    }
}
