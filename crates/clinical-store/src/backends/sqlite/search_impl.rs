//! Search implementation for SQLite backend.
//!
//! A query is compiled to SQL under a read guard of the parameter registry,
//! then executed in one read snapshot: the total, the page and the include
//! expansion all see the same committed state.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, params_from_iter};

use crate::core::{
    ChainedSearchProvider, IncludeProvider, RevincludeProvider, SearchProvider, SearchResult,
};
use crate::error::{SearchError, StorageError, StorageResult, ValidationError};
use crate::search::{QueryParser, apply_elements, apply_summary, parse_criteria};
use crate::types::{
    CursorValue, IncludeDirective, IncludeType, Page, PageCursor, PageInfo,
    ReverseChainedParameter, SearchQuery, SortDirection, StoredResource, SummaryMode, TotalMode,
};

use super::SqliteBackend;
use super::search::{QueryBuilder, SortKey, SqlFragment, SqlParam, cursor_condition};
use super::writer::resource_from_parts;

/// Ids bound per `IN (...)` list.
const ID_CHUNK: usize = 500;

/// A query compiled against one registry snapshot.
struct CompiledQuery {
    resource_type: String,
    /// Filter on `resources r`, including the type and liveness checks.
    filter: SqlFragment,
    sort_keys: Vec<SortKey>,
}

#[async_trait]
impl SearchProvider for SqliteBackend {
    async fn search(&self, query: &SearchQuery) -> StorageResult<SearchResult> {
        self.read_snapshot(|conn| self.search_on(conn, query))
    }

    async fn search_count(&self, query: &SearchQuery) -> StorageResult<u64> {
        let compiled = self.compile(query)?;
        self.read_snapshot(|conn| count_matches(conn, &compiled))
    }

    fn parse_query(
        &self,
        resource_type: &str,
        params: &[(String, String)],
    ) -> StorageResult<SearchQuery> {
        let registry = self.search_registry().read();
        if !registry.is_known_type(resource_type) {
            return Err(StorageError::Validation(ValidationError::UnsupportedResourceType {
                resource_type: resource_type.to_string(),
            }));
        }
        Ok(QueryParser::new(&registry).parse(resource_type, params)?)
    }
}

#[async_trait]
impl IncludeProvider for SqliteBackend {
    async fn resolve_includes(
        &self,
        resources: &[StoredResource],
        includes: &[IncludeDirective],
    ) -> StorageResult<Vec<StoredResource>> {
        self.read_snapshot(|conn| {
            let mut found = Vec::new();
            for directive in includes
                .iter()
                .filter(|d| d.include_type == IncludeType::Include)
            {
                found.extend(resolve_directive(conn, resources, directive)?);
            }
            Ok(dedup(found))
        })
    }
}

#[async_trait]
impl RevincludeProvider for SqliteBackend {
    async fn resolve_revincludes(
        &self,
        resources: &[StoredResource],
        revincludes: &[IncludeDirective],
    ) -> StorageResult<Vec<StoredResource>> {
        self.read_snapshot(|conn| {
            let mut found = Vec::new();
            for directive in revincludes
                .iter()
                .filter(|d| d.include_type == IncludeType::Revinclude)
            {
                found.extend(resolve_directive(conn, resources, directive)?);
            }
            Ok(dedup(found))
        })
    }
}

#[async_trait]
impl ChainedSearchProvider for SqliteBackend {
    async fn resolve_chain(
        &self,
        base_type: &str,
        chain: &str,
        value: &str,
    ) -> StorageResult<Vec<String>> {
        let query = self.parse_query(base_type, &[(chain.to_string(), value.to_string())])?;
        let compiled = self.compile(&query)?;
        self.read_snapshot(|conn| matching_ids(conn, &compiled))
    }

    async fn resolve_reverse_chain(
        &self,
        base_type: &str,
        reverse_chain: &ReverseChainedParameter,
    ) -> StorageResult<Vec<String>> {
        let mut query = SearchQuery::new(base_type);
        query.reverse_chains.push(reverse_chain.clone());
        let compiled = self.compile(&query)?;
        self.read_snapshot(|conn| matching_ids(conn, &compiled))
    }
}

impl SqliteBackend {
    /// Runs a search on an open connection: the total, the page and the
    /// include expansion all read through `conn`.
    pub(crate) fn search_on(
        &self,
        conn: &Connection,
        query: &SearchQuery,
    ) -> StorageResult<SearchResult> {
        let compiled = self.compile(query)?;
        let cursor = query
            .cursor
            .as_deref()
            .map(PageCursor::decode)
            .transpose()?;
        let count = query
            .count
            .unwrap_or(self.config().default_page_size)
            .min(self.config().max_page_size);

        let total = if query.is_count_only() || query.total != Some(TotalMode::None) {
            Some(count_matches(conn, &compiled)?)
        } else {
            None
        };
        let (page, included, truncated) = if query.is_count_only() {
            (Page::empty(), Vec::new(), false)
        } else {
            let offset = if cursor.is_some() { 0 } else { query.offset.unwrap_or(0) };
            let page = fetch_page(conn, &compiled, cursor.as_ref(), count, offset)?;
            let cap = self.config().max_included_resources as usize;
            let (included, truncated) = if query.includes.is_empty() {
                (Vec::new(), false)
            } else {
                expand_includes(
                    conn,
                    &page.items,
                    &query.includes,
                    self.config().max_include_depth,
                    cap,
                )?
            };
            if truncated {
                tracing::info!(
                    resource_type = %query.resource_type,
                    cap,
                    "include expansion truncated"
                );
            }
            (page, included, truncated)
        };

        tracing::debug!(
            resource_type = %query.resource_type,
            matches = page.items.len(),
            included = included.len(),
            total = ?total,
            "search executed"
        );

        let shape = |resource: StoredResource| subset(resource, query.summary, &query.elements);
        let mut page = page.map(shape);
        let included = included.into_iter().map(shape).collect();
        let mut result = match total {
            Some(total) => {
                page.page_info = page.page_info.with_total(total);
                SearchResult::new(page).with_total(total)
            }
            None => SearchResult::new(page),
        };
        result = result.with_included(included, truncated);
        Ok(result)
    }

    fn compile(&self, query: &SearchQuery) -> StorageResult<CompiledQuery> {
        let registry = self.search_registry().read();
        if !registry.is_known_type(&query.resource_type) {
            return Err(StorageError::Validation(ValidationError::UnsupportedResourceType {
                resource_type: query.resource_type.clone(),
            }));
        }
        let builder = QueryBuilder::new(&registry);
        let filter = SqlFragment::with_params(
            "r.resource_type = ? AND r.is_deleted = 0",
            vec![SqlParam::string(&query.resource_type)],
        )
        .and(builder.build_filter(query, "r.id")?);
        let sort_keys = builder.sort_keys(&query.resource_type, &query.sort)?;

        Ok(CompiledQuery {
            resource_type: query.resource_type.clone(),
            filter,
            sort_keys,
        })
    }

    /// Ids of live resources matching conditional criteria, evaluated on
    /// `conn` so the caller's transaction sees its own writes.
    ///
    /// Criteria without any search parameter are rejected rather than
    /// matching everything.
    pub(crate) fn matching_ids(
        &self,
        conn: &Connection,
        resource_type: &str,
        criteria: &str,
    ) -> StorageResult<Vec<String>> {
        let query = self.parse_query(resource_type, &parse_criteria(criteria))?;
        if query.parameters.is_empty() && query.reverse_chains.is_empty() {
            return Err(StorageError::Search(SearchError::InvalidValue {
                parameter: "criteria".to_string(),
                value: criteria.to_string(),
                message: "conditional operations need at least one search parameter".to_string(),
            }));
        }
        let compiled = self.compile(&query)?;
        matching_ids(conn, &compiled)
    }
}

fn count_matches(conn: &Connection, compiled: &CompiledQuery) -> StorageResult<u64> {
    let sql = format!("SELECT COUNT(*) FROM resources r WHERE {}", compiled.filter.sql);
    let count: i64 = conn.query_row(&sql, params_from_iter(compiled.filter.params.iter()), |row| {
        row.get(0)
    })?;
    Ok(count as u64)
}

fn matching_ids(conn: &Connection, compiled: &CompiledQuery) -> StorageResult<Vec<String>> {
    let sql = format!(
        "SELECT r.id FROM resources r WHERE {} ORDER BY r.id",
        compiled.filter.sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(compiled.filter.params.iter()), |row| row.get(0))?;
    Ok(rows.collect::<Result<Vec<String>, _>>()?)
}

/// Fetches one page in `sort keys..., id` order, reading one row past the
/// page to learn whether another page exists.
fn fetch_page(
    conn: &Connection,
    compiled: &CompiledQuery,
    cursor: Option<&PageCursor>,
    count: u32,
    offset: u32,
) -> StorageResult<Page<StoredResource>> {
    if count == 0 {
        return Ok(Page::empty());
    }

    let mut sql = SqlFragment::new("SELECT r.id, r.version_id, r.data, r.last_updated");
    for (i, key) in compiled.sort_keys.iter().enumerate() {
        sql.push_sql(", ");
        sql.push(key.expr.clone());
        sql.push_sql(&format!(" AS sk{}", i));
    }
    sql.push_sql(" FROM resources r WHERE ");

    let mut filter = compiled.filter.clone();
    if let Some(cursor) = cursor {
        filter = filter.and(cursor_condition(&compiled.sort_keys, cursor)?);
    }
    sql.push(filter);

    let mut order: Vec<String> = compiled
        .sort_keys
        .iter()
        .enumerate()
        .map(|(i, key)| match key.direction {
            SortDirection::Ascending => format!("sk{} ASC", i),
            SortDirection::Descending => format!("sk{} DESC", i),
        })
        .collect();
    order.push("r.id ASC".to_string());
    sql.push_sql(&format!(
        " ORDER BY {} LIMIT {} OFFSET {}",
        order.join(", "),
        count as u64 + 1,
        offset
    ));

    let key_count = compiled.sort_keys.len();
    let mut stmt = conn.prepare(&sql.sql)?;
    let rows = stmt.query_map(params_from_iter(sql.params.iter()), |row| {
        let mut keys = Vec::with_capacity(key_count);
        for i in 0..key_count {
            keys.push(cursor_value(row.get_ref(4 + i)?));
        }
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Vec<u8>>(2)?,
            row.get::<_, String>(3)?,
            keys,
        ))
    })?;
    let mut rows = rows.collect::<Result<Vec<_>, _>>()?;

    let has_next = rows.len() > count as usize;
    rows.truncate(count as usize);

    let mut next = None;
    let mut items = Vec::with_capacity(rows.len());
    for (id, version_id, data, last_updated, keys) in rows {
        next = Some(PageCursor::new(keys, id.clone()));
        items.push(resource_from_parts(
            &compiled.resource_type,
            &id,
            version_id,
            Some(data),
            &last_updated,
            false,
        )?);
    }

    let page_info = match next {
        Some(cursor) if has_next => PageInfo::with_next(cursor),
        _ => PageInfo::end(),
    };
    Ok(Page::new(items, page_info))
}

fn cursor_value(value: ValueRef<'_>) -> CursorValue {
    match value {
        ValueRef::Integer(i) => CursorValue::Number(i),
        ValueRef::Real(f) => CursorValue::Decimal(f),
        ValueRef::Text(t) => CursorValue::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Null | ValueRef::Blob(_) => CursorValue::Null,
    }
}

/// Runs include and revinclude directives over the page.
///
/// The first round applies every directive to the matches. Later rounds
/// apply only `:iterate` directives to what the previous round added, for at
/// most `max_depth` rounds in total. Results exclude the matches, hold each
/// resource once, and stop at `cap` entries. The flag reports whether
/// either limit cut the expansion short.
fn expand_includes(
    conn: &Connection,
    matches: &[StoredResource],
    directives: &[IncludeDirective],
    max_depth: u32,
    cap: usize,
) -> StorageResult<(Vec<StoredResource>, bool)> {
    let mut seen: HashSet<(String, String)> = matches.iter().map(resource_key).collect();
    let mut included = Vec::new();
    let mut frontier: Vec<StoredResource> = matches.to_vec();
    let iterating: Vec<IncludeDirective> =
        directives.iter().filter(|d| d.iterate).cloned().collect();

    for round in 0..max_depth.max(1) {
        let active = if round == 0 { directives } else { iterating.as_slice() };
        if active.is_empty() || frontier.is_empty() {
            return Ok((included, false));
        }

        let mut next = Vec::new();
        for directive in active {
            for resource in resolve_directive(conn, &frontier, directive)? {
                if !seen.insert(resource_key(&resource)) {
                    continue;
                }
                if included.len() >= cap {
                    return Ok((included, true));
                }
                included.push(resource.clone());
                next.push(resource);
            }
        }
        frontier = next;
    }

    // Depth exhausted: report truncation only if another round would add.
    if iterating.is_empty() || frontier.is_empty() {
        return Ok((included, false));
    }
    for directive in &iterating {
        if resolve_directive(conn, &frontier, directive)?
            .iter()
            .any(|r| !seen.contains(&resource_key(r)))
        {
            return Ok((included, true));
        }
    }
    Ok((included, false))
}

fn resource_key(resource: &StoredResource) -> (String, String) {
    (resource.resource_type().to_string(), resource.id().to_string())
}

fn dedup(resources: Vec<StoredResource>) -> Vec<StoredResource> {
    let mut seen = HashSet::new();
    resources
        .into_iter()
        .filter(|r| seen.insert(resource_key(r)))
        .collect()
}

/// Resources one directive reaches from `sources`.
fn resolve_directive(
    conn: &Connection,
    sources: &[StoredResource],
    directive: &IncludeDirective,
) -> StorageResult<Vec<StoredResource>> {
    match directive.include_type {
        IncludeType::Include => resolve_include(conn, sources, directive),
        IncludeType::Revinclude => resolve_revinclude(conn, sources, directive),
    }
}

/// `_include=Source:param[:Target]`: targets referenced by the sources.
///
/// A stored reference without a type only resolves when the directive
/// names the target type.
fn resolve_include(
    conn: &Connection,
    sources: &[StoredResource],
    directive: &IncludeDirective,
) -> StorageResult<Vec<StoredResource>> {
    let ids: Vec<&str> = sources
        .iter()
        .filter(|r| r.resource_type() == directive.source_type)
        .map(|r| r.id())
        .collect();
    let mut targets: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for chunk in ids.chunks(ID_CHUNK) {
        let mut sql = SqlFragment::with_params(
            "SELECT DISTINCT value_reference_type, value_reference_id FROM search_index \
             WHERE resource_type = ? AND value_reference_id IS NOT NULL",
            vec![SqlParam::string(&directive.source_type)],
        );
        if directive.search_param != "*" {
            sql.push_sql(" AND param_name = ?");
            sql.params.push(SqlParam::string(&directive.search_param));
        }
        sql.push(in_list(" AND resource_id", chunk));

        let mut stmt = conn.prepare(&sql.sql)?;
        let rows = stmt.query_map(params_from_iter(sql.params.iter()), |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (target_type, target_id) = row?;
            let target_type = match (target_type, &directive.target_type) {
                (Some(t), Some(wanted)) if &t != wanted => continue,
                (Some(t), _) => t,
                (None, Some(wanted)) => wanted.clone(),
                (None, None) => continue,
            };
            let bucket = targets.entry(target_type).or_default();
            if !bucket.contains(&target_id) {
                bucket.push(target_id);
            }
        }
    }

    let mut found = Vec::new();
    for (resource_type, ids) in targets {
        found.extend(load_live(conn, &resource_type, &ids)?);
    }
    Ok(found)
}

/// `_revinclude=Source:param[:Target]`: sources referencing the given
/// resources.
fn resolve_revinclude(
    conn: &Connection,
    targets: &[StoredResource],
    directive: &IncludeDirective,
) -> StorageResult<Vec<StoredResource>> {
    let mut by_type: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for target in targets {
        if directive
            .target_type
            .as_deref()
            .is_some_and(|t| t != target.resource_type())
        {
            continue;
        }
        by_type
            .entry(target.resource_type())
            .or_default()
            .push(target.id());
    }

    let mut source_ids: Vec<String> = Vec::new();
    for (target_type, ids) in by_type {
        for chunk in ids.chunks(ID_CHUNK) {
            let mut sql = SqlFragment::with_params(
                "SELECT DISTINCT resource_id FROM search_index WHERE resource_type = ? \
                 AND (value_reference_type = ? OR value_reference_type IS NULL)",
                vec![
                    SqlParam::string(&directive.source_type),
                    SqlParam::string(target_type),
                ],
            );
            if directive.search_param != "*" {
                sql.push_sql(" AND param_name = ?");
                sql.params.push(SqlParam::string(&directive.search_param));
            }
            sql.push(in_list(" AND value_reference_id", chunk));

            let mut stmt = conn.prepare(&sql.sql)?;
            let rows = stmt.query_map(params_from_iter(sql.params.iter()), |row| {
                row.get::<_, String>(0)
            })?;
            for row in rows {
                let id = row?;
                if !source_ids.contains(&id) {
                    source_ids.push(id);
                }
            }
        }
    }

    load_live(conn, &directive.source_type, &source_ids)
}

/// `{column} IN (?, ?, ...)` over the ids.
fn in_list<S: AsRef<str>>(column: &str, ids: &[S]) -> SqlFragment {
    let placeholders = vec!["?"; ids.len()].join(", ");
    SqlFragment::with_params(
        format!("{} IN ({})", column, placeholders),
        ids.iter().map(|id| SqlParam::string(id.as_ref())).collect(),
    )
}

/// Live resources of one type by id, in id order.
fn load_live<S: AsRef<str>>(
    conn: &Connection,
    resource_type: &str,
    ids: &[S],
) -> StorageResult<Vec<StoredResource>> {
    let mut found = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(ID_CHUNK) {
        let mut sql = SqlFragment::with_params(
            "SELECT id, version_id, data, last_updated FROM resources \
             WHERE resource_type = ? AND is_deleted = 0",
            vec![SqlParam::string(resource_type)],
        );
        sql.push(in_list(" AND id", chunk));
        sql.push_sql(" ORDER BY id");

        let mut stmt = conn.prepare(&sql.sql)?;
        let rows = stmt.query_map(params_from_iter(sql.params.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        for row in rows {
            let (id, version_id, data, last_updated) = row?;
            found.push(resource_from_parts(
                resource_type,
                &id,
                version_id,
                Some(data),
                &last_updated,
                false,
            )?);
        }
    }
    Ok(found)
}

fn subset(
    resource: StoredResource,
    summary: Option<SummaryMode>,
    elements: &[String],
) -> StoredResource {
    match summary {
        Some(mode) if mode != SummaryMode::False => {
            resource.map_content(|content| apply_summary(content, mode))
        }
        _ if !elements.is_empty() => resource.map_content(|content| apply_elements(content, elements)),
        _ => resource,
    }
}
