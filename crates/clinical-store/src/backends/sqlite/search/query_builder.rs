//! SQL query builder for search.
//!
//! Translates a parsed [`SearchQuery`] into conditions on the id column of
//! the `resources` table. Every parameter becomes a membership test against
//! a subquery over `search_index`:
//!
//! ```text
//! r.id IN (SELECT resource_id FROM search_index
//!          WHERE resource_type = ? AND param_name = ? AND (<value> OR <value>))
//! ```
//!
//! Chains nest the same shape through `value_reference_id`, and `_has`
//! inverts it. All placeholders are anonymous `?`, bound in the order they
//! appear in the final SQL text.

use std::cell::Cell;

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue};

use crate::error::SearchError;
use crate::search::{SearchParameterDefinition, SearchParameterRegistry, parser::chain_targets};
use crate::types::{
    ChainedParameter, CursorValue, PageCursor, ReverseChainedParameter, SearchModifier,
    SearchParamType, SearchParameter, SearchPrefix, SearchQuery, SearchValue, SortDirection,
    SortDirective,
};

use super::parameter_handlers::{
    DateHandler, NumberHandler, QuantityHandler, ReferenceHandler, StringHandler, TokenHandler,
    UriHandler,
};

/// A fragment of SQL with bound parameters.
#[derive(Debug, Clone, Default)]
pub struct SqlFragment {
    /// The SQL clause.
    pub sql: String,
    /// Bound parameter values, in placeholder order.
    pub params: Vec<SqlParam>,
}

/// A bound SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// String parameter.
    String(String),
    /// Integer parameter.
    Integer(i64),
    /// Float parameter.
    Float(f64),
    /// Null parameter.
    Null,
}

impl SqlParam {
    /// Creates a string parameter.
    pub fn string(s: impl Into<String>) -> Self {
        SqlParam::String(s.into())
    }

    /// Creates an integer parameter.
    pub fn integer(i: i64) -> Self {
        SqlParam::Integer(i)
    }

    /// Creates a float parameter.
    pub fn float(f: f64) -> Self {
        SqlParam::Float(f)
    }

    fn from_cursor(value: &CursorValue) -> Self {
        match value {
            CursorValue::String(s) => SqlParam::String(s.clone()),
            CursorValue::Number(n) => SqlParam::Integer(*n),
            CursorValue::Decimal(d) => SqlParam::Float(*d),
            CursorValue::Null => SqlParam::Null,
        }
    }
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlParam::String(s) => ToSqlOutput::from(s.as_str()),
            SqlParam::Integer(i) => ToSqlOutput::from(*i),
            SqlParam::Float(f) => ToSqlOutput::from(*f),
            SqlParam::Null => ToSqlOutput::Owned(SqlValue::Null),
        })
    }
}

impl SqlFragment {
    /// Creates a new SQL fragment.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Creates a fragment with parameters.
    pub fn with_params(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// A condition that never holds.
    pub fn never() -> Self {
        Self::new("0")
    }

    /// Appends raw SQL text.
    pub fn push_sql(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    /// Appends another fragment verbatim, keeping parameter order.
    pub fn push(&mut self, other: SqlFragment) {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params);
    }

    /// Combines with another fragment using AND.
    pub fn and(mut self, other: SqlFragment) -> Self {
        if !self.sql.is_empty() && !other.sql.is_empty() {
            self.sql = format!("({}) AND ({})", self.sql, other.sql);
        } else if !other.sql.is_empty() {
            self.sql = other.sql;
        }
        self.params.extend(other.params);
        self
    }

    /// Combines with another fragment using OR.
    pub fn or(mut self, other: SqlFragment) -> Self {
        if !self.sql.is_empty() && !other.sql.is_empty() {
            self.sql = format!("({}) OR ({})", self.sql, other.sql);
        } else if !other.sql.is_empty() {
            self.sql = other.sql;
        }
        self.params.extend(other.params);
        self
    }

    /// Returns true if this fragment is empty.
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

/// Escapes `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
pub fn escape_like(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Where a parameter's values live.
#[derive(Debug, Clone, Copy)]
enum ValueSource<'p> {
    /// Rows of `search_index` with this `param_name`.
    Index(&'p str),
    /// The `last_updated` column of `resources`.
    LastUpdated,
}

/// A `_sort` key: an SQL expression evaluated per row of `resources r`.
#[derive(Debug, Clone)]
pub struct SortKey {
    /// Expression yielding the key.
    pub expr: SqlFragment,
    /// Direction.
    pub direction: SortDirection,
}

/// Builds SQL conditions from search parameters.
pub struct QueryBuilder<'a> {
    registry: &'a SearchParameterRegistry,
    next_alias: Cell<usize>,
}

impl<'a> QueryBuilder<'a> {
    /// Creates a builder over one registry snapshot.
    pub fn new(registry: &'a SearchParameterRegistry) -> Self {
        Self {
            registry,
            next_alias: Cell::new(0),
        }
    }

    /// Condition on `id_col` that holds for ids matching every parameter and
    /// reverse chain of the query. Empty when the query has no filters.
    pub fn build_filter(&self, query: &SearchQuery, id_col: &str) -> Result<SqlFragment, SearchError> {
        let mut filter = SqlFragment::default();
        for param in &query.parameters {
            filter = filter.and(self.parameter_condition(&query.resource_type, id_col, param)?);
        }
        for reverse in &query.reverse_chains {
            filter = filter.and(self.reverse_chain_condition(&query.resource_type, id_col, reverse)?);
        }
        Ok(filter)
    }

    /// Condition on `id_col` for one parameter of `resource_type`.
    pub fn parameter_condition(
        &self,
        resource_type: &str,
        id_col: &str,
        param: &SearchParameter,
    ) -> Result<SqlFragment, SearchError> {
        if !param.chain.is_empty() {
            return self.chain_condition(resource_type, id_col, &param.chain, param);
        }

        if param.name == "_id" {
            return Ok(self.id_condition(id_col, param));
        }

        let (source, def) = if param.name == "_lastUpdated" {
            (ValueSource::LastUpdated, None)
        } else {
            let def = self
                .registry
                .get_active_param(resource_type, &param.name)
                .ok_or_else(|| SearchError::UnknownParameter {
                    resource_type: resource_type.to_string(),
                    parameter: param.name.clone(),
                })?;
            (ValueSource::Index(param.name.as_str()), Some(def))
        };

        if param.modifier == Some(SearchModifier::Missing) {
            let missing = param.values.first().is_some_and(|v| v.value == "true");
            return Ok(match source {
                ValueSource::LastUpdated => SqlFragment::new(if missing { "0" } else { "1" }),
                _ => membership(id_col, resource_type, source, None, missing),
            });
        }

        let mut positive = SqlFragment::default();
        let mut negated = Vec::new();
        for value in &param.values {
            if value.prefix == SearchPrefix::Ne {
                let eq = SearchValue::new(SearchPrefix::Eq, value.value.clone());
                negated.push(self.value_condition(source, def.as_deref(), &eq, param)?);
            } else {
                positive = positive.or(self.value_condition(source, def.as_deref(), value, param)?);
            }
        }

        let not = param.modifier == Some(SearchModifier::Not);
        let mut condition = SqlFragment::default();
        if !positive.is_empty() {
            condition = condition.or(membership(id_col, resource_type, source, Some(positive), not));
        }
        for eq in negated {
            condition = condition.or(membership(id_col, resource_type, source, Some(eq), true));
        }
        Ok(condition)
    }

    fn value_condition(
        &self,
        source: ValueSource<'_>,
        def: Option<&SearchParameterDefinition>,
        value: &SearchValue,
        param: &SearchParameter,
    ) -> Result<SqlFragment, SearchError> {
        let modifier = param.modifier.as_ref();
        let def = match (source, def) {
            (ValueSource::LastUpdated, _) => {
                return DateHandler::build_sql(&param.name, value, "last_updated", "last_updated");
            }
            (ValueSource::Index(_), Some(def)) => def,
            (ValueSource::Index(code), None) => {
                return Err(SearchError::UnknownParameter {
                    resource_type: String::new(),
                    parameter: code.to_string(),
                });
            }
        };
        match def.param_type {
            SearchParamType::String => Ok(StringHandler::build_sql(value, modifier)),
            SearchParamType::Token => Ok(TokenHandler::build_sql(value, modifier)),
            SearchParamType::Uri => Ok(UriHandler::build_sql(value, modifier)),
            SearchParamType::Reference => {
                Ok(ReferenceHandler::build_sql(value, modifier, def.targets()))
            }
            SearchParamType::Date => {
                DateHandler::build_sql(&param.name, value, "value_date_start", "value_date_end")
            }
            SearchParamType::Number => NumberHandler::build_sql(&param.name, value, "value_number"),
            SearchParamType::Quantity => QuantityHandler::build_sql(&param.name, value),
        }
    }

    fn id_condition(&self, id_col: &str, param: &SearchParameter) -> SqlFragment {
        if param.modifier == Some(SearchModifier::Missing) {
            let missing = param.values.first().is_some_and(|v| v.value == "true");
            return SqlFragment::new(if missing { "0" } else { "1" });
        }
        let placeholders = vec!["?"; param.values.len()].join(", ");
        let not = if param.modifier == Some(SearchModifier::Not) {
            "NOT "
        } else {
            ""
        };
        SqlFragment::with_params(
            format!("{} {}IN ({})", id_col, not, placeholders),
            param
                .values
                .iter()
                .map(|v| SqlParam::string(&v.value))
                .collect(),
        )
    }

    /// Nests one subquery per hop, following `value_reference_id` into each
    /// candidate target type.
    fn chain_condition(
        &self,
        resource_type: &str,
        id_col: &str,
        hops: &[ChainedParameter],
        leaf: &SearchParameter,
    ) -> Result<SqlFragment, SearchError> {
        let Some((hop, rest)) = hops.split_first() else {
            return Err(SearchError::InvalidChain {
                chain: leaf.name.clone(),
                message: "empty chain".to_string(),
            });
        };
        let def = self
            .registry
            .get_active_param(resource_type, &hop.reference_param)
            .ok_or_else(|| SearchError::InvalidChain {
                chain: leaf.name.clone(),
                message: format!("'{}' is not defined on {}", hop.reference_param, resource_type),
            })?;
        let targets = match &hop.target_type {
            Some(t) => vec![t.clone()],
            None => chain_targets(self.registry, &def, None, &hop.target_param),
        };

        let alias = self.alias();
        let target_id_col = format!("{}.value_reference_id", alias);
        let mut alternatives = SqlFragment::default();
        for target in &targets {
            let inner = if rest.is_empty() {
                let plain = SearchParameter {
                    name: hop.target_param.clone(),
                    param_type: leaf.param_type,
                    modifier: leaf.modifier.clone(),
                    values: leaf.values.clone(),
                    chain: Vec::new(),
                };
                self.parameter_condition(target, &target_id_col, &plain)?
            } else {
                self.chain_condition(target, &target_id_col, rest, leaf)?
            };
            let mut branch = SqlFragment::with_params(
                format!(
                    "({a}.value_reference_type = ? OR {a}.value_reference_type IS NULL) AND ",
                    a = alias
                ),
                vec![SqlParam::string(target)],
            );
            branch.push_sql("(");
            branch.push(inner);
            branch.push_sql(")");
            alternatives = alternatives.or(branch);
        }
        if alternatives.is_empty() {
            return Ok(SqlFragment::never());
        }

        let mut frag = SqlFragment::with_params(
            format!(
                "{id} IN (SELECT {a}.resource_id FROM search_index {a} \
                 WHERE {a}.resource_type = ? AND {a}.param_name = ? AND (",
                id = id_col,
                a = alias
            ),
            vec![
                SqlParam::string(resource_type),
                SqlParam::string(&hop.reference_param),
            ],
        );
        frag.push(alternatives);
        frag.push_sql("))");
        Ok(frag)
    }

    /// `_has:Source:ref:param=value`: ids referenced through `ref` by a
    /// `Source` resource matching `param=value`.
    pub fn reverse_chain_condition(
        &self,
        resource_type: &str,
        id_col: &str,
        reverse: &ReverseChainedParameter,
    ) -> Result<SqlFragment, SearchError> {
        let alias = self.alias();
        let source_param = SearchParameter {
            name: reverse.search_param.clone(),
            param_type: reverse.param_type,
            modifier: reverse.modifier.clone(),
            values: reverse.values.clone(),
            chain: Vec::new(),
        };
        let inner = self.parameter_condition(
            &reverse.source_type,
            &format!("{}.resource_id", alias),
            &source_param,
        )?;

        let mut frag = SqlFragment::with_params(
            format!(
                "{id} IN (SELECT {a}.value_reference_id FROM search_index {a} \
                 WHERE {a}.resource_type = ? AND {a}.param_name = ? \
                 AND ({a}.value_reference_type = ? OR {a}.value_reference_type IS NULL) AND (",
                id = id_col,
                a = alias
            ),
            vec![
                SqlParam::string(&reverse.source_type),
                SqlParam::string(&reverse.reference_param),
                SqlParam::string(resource_type),
            ],
        );
        frag.push(inner);
        frag.push_sql("))");
        Ok(frag)
    }

    /// Sort key expressions over `resources r`.
    ///
    /// A multi-valued parameter sorts by its minimum ascending and its
    /// maximum descending.
    pub fn sort_keys(
        &self,
        resource_type: &str,
        sort: &[SortDirective],
    ) -> Result<Vec<SortKey>, SearchError> {
        sort.iter()
            .map(|directive| {
                let expr = match directive.parameter.as_str() {
                    "_id" => SqlFragment::new("r.id"),
                    "_lastUpdated" => SqlFragment::new("r.last_updated"),
                    code => {
                        let def = self.registry.get_active_param(resource_type, code).ok_or_else(
                            || SearchError::UnknownParameter {
                                resource_type: resource_type.to_string(),
                                parameter: code.to_string(),
                            },
                        )?;
                        let ascending = directive.direction == SortDirection::Ascending;
                        let column = match def.param_type {
                            SearchParamType::String => "value_string",
                            SearchParamType::Number => "value_number",
                            SearchParamType::Token => "value_token_code",
                            SearchParamType::Date if ascending => "value_date_start",
                            SearchParamType::Date => "value_date_end",
                            other => {
                                return Err(SearchError::InvalidValue {
                                    parameter: "_sort".to_string(),
                                    value: code.to_string(),
                                    message: format!("cannot sort by a {} parameter", other),
                                });
                            }
                        };
                        let aggregate = if ascending { "MIN" } else { "MAX" };
                        SqlFragment::with_params(
                            format!(
                                "(SELECT {}(s.{}) FROM search_index s WHERE s.resource_type = r.resource_type \
                                 AND s.resource_id = r.id AND s.param_name = ?)",
                                aggregate, column
                            ),
                            vec![SqlParam::string(code)],
                        )
                    }
                };
                Ok(SortKey {
                    expr,
                    direction: directive.direction,
                })
            })
            .collect()
    }

    fn alias(&self) -> String {
        let n = self.next_alias.get() + 1;
        self.next_alias.set(n);
        format!("c{}", n)
    }
}

/// Condition selecting rows strictly after `cursor` in the order
/// `keys..., r.id ASC`.
///
/// NULL keys sort first ascending and last descending, as SQLite orders
/// them; equality uses the null-safe `IS`.
pub fn cursor_condition(keys: &[SortKey], cursor: &PageCursor) -> Result<SqlFragment, SearchError> {
    let values = cursor.sort_values();
    if values.len() != keys.len() {
        return Err(SearchError::InvalidCursor {
            cursor: cursor.encode(),
        });
    }

    let mut condition = SqlFragment::default();
    for i in 0..=keys.len() {
        let mut branch = SqlFragment::default();
        for (key, value) in keys.iter().zip(values).take(i) {
            let mut eq = key.expr.clone();
            eq.push_sql(" IS ?");
            eq.params.push(SqlParam::from_cursor(value));
            branch = branch.and(eq);
        }
        let after = match keys.get(i) {
            Some(key) => after_key(key, &values[i]),
            None => SqlFragment::with_params("r.id > ?", vec![SqlParam::string(cursor.resource_id())]),
        };
        condition = condition.or(branch.and(after));
    }
    Ok(condition)
}

fn after_key(key: &SortKey, value: &CursorValue) -> SqlFragment {
    let null = matches!(value, CursorValue::Null);
    match (key.direction, null) {
        (SortDirection::Ascending, true) => {
            let mut frag = key.expr.clone();
            frag.push_sql(" IS NOT NULL");
            frag
        }
        (SortDirection::Ascending, false) => {
            let mut frag = key.expr.clone();
            frag.push_sql(" > ?");
            frag.params.push(SqlParam::from_cursor(value));
            frag
        }
        (SortDirection::Descending, true) => SqlFragment::never(),
        (SortDirection::Descending, false) => {
            let mut frag = SqlFragment::new("(");
            frag.push(key.expr.clone());
            frag.push_sql(" < ? OR ");
            frag.params.push(SqlParam::from_cursor(value));
            frag.push(key.expr.clone());
            frag.push_sql(" IS NULL)");
            frag
        }
    }
}

/// `id_col [NOT] IN (subquery over the value source [AND condition])`.
fn membership(
    id_col: &str,
    resource_type: &str,
    source: ValueSource<'_>,
    condition: Option<SqlFragment>,
    negate: bool,
) -> SqlFragment {
    let not = if negate { "NOT " } else { "" };
    let mut frag = match source {
        ValueSource::Index(param_name) => SqlFragment::with_params(
            format!(
                "{} {}IN (SELECT resource_id FROM search_index WHERE resource_type = ? AND param_name = ?",
                id_col, not
            ),
            vec![
                SqlParam::string(resource_type),
                SqlParam::string(param_name),
            ],
        ),
        ValueSource::LastUpdated => SqlFragment::with_params(
            format!(
                "{} {}IN (SELECT id FROM resources WHERE resource_type = ? AND is_deleted = 0",
                id_col, not
            ),
            vec![SqlParam::string(resource_type)],
        ),
    };
    if let Some(condition) = condition {
        frag.push_sql(" AND (");
        frag.push(condition);
        frag.push_sql(")");
    }
    frag.push_sql(")");
    frag
}
