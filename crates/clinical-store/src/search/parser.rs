//! Search request parser.
//!
//! Turns raw `(name, value)` pairs into a [`SearchQuery`] validated against
//! the parameter registry. Names take the forms:
//!
//! ```text
//! name                          plain parameter
//! name:modifier                 modified parameter
//! ref:Type.param:modifier       chained parameter (up to MAX_CHAIN_DEPTH hops)
//! _has:Source:ref:param         reverse-chained parameter
//! _include / _revinclude[:iterate], _sort, _count, _offset, _cursor,
//! _total, _summary, _elements   result-shaping directives
//! ```
//!
//! Comma-separated values are alternatives (`\,` escapes a literal comma);
//! repeating a name adds another condition.

use std::collections::BTreeSet;

use url::form_urlencoded;

use crate::error::SearchError;
use crate::types::{
    ChainedParameter, DateRange, IncludeDirective, IncludeType, NumberRange,
    ReverseChainedParameter, SearchModifier, SearchParamType, SearchParameter, SearchQuery,
    SearchValue, SortDirective, SummaryMode, TotalMode,
};

use super::registry::{SearchParameterDefinition, SearchParameterRegistry};

/// Maximum number of reference hops in a chained parameter.
pub const MAX_CHAIN_DEPTH: usize = 3;

/// Parameters accepted and ignored.
const IGNORED_PARAMS: &[&str] = &["_format", "_pretty"];

/// Parses search requests for one registry snapshot.
#[derive(Debug, Clone, Copy)]
pub struct QueryParser<'a> {
    registry: &'a SearchParameterRegistry,
}

impl<'a> QueryParser<'a> {
    /// Creates a parser over the registry.
    pub fn new(registry: &'a SearchParameterRegistry) -> Self {
        Self { registry }
    }

    /// Parses raw pairs into a query for `resource_type`.
    pub fn parse(
        &self,
        resource_type: &str,
        params: &[(String, String)],
    ) -> Result<SearchQuery, SearchError> {
        let mut query = SearchQuery::new(resource_type);

        for (name, value) in params {
            let name = name.trim();
            if name.is_empty() || IGNORED_PARAMS.contains(&name) {
                continue;
            }

            if let Some(rest) = name.strip_prefix("_has:") {
                if let Some(reverse) = self.parse_reverse_chain(resource_type, name, rest, value)? {
                    query.reverse_chains.push(reverse);
                }
                continue;
            }

            if self.parse_directive(&mut query, name, value)? {
                continue;
            }

            let parsed = if name.contains('.') {
                self.parse_chain(resource_type, name, value)?
            } else {
                self.parse_simple(resource_type, name, value)?
            };
            if let Some(param) = parsed {
                query.parameters.push(param);
            }
        }

        Ok(query)
    }

    /// Handles result-shaping parameters. Returns false for anything else.
    fn parse_directive(
        &self,
        query: &mut SearchQuery,
        name: &str,
        value: &str,
    ) -> Result<bool, SearchError> {
        let invalid = |message: &str| SearchError::InvalidValue {
            parameter: name.to_string(),
            value: value.to_string(),
            message: message.to_string(),
        };
        let value = value.trim();

        match name {
            "_count" => {
                let count = value
                    .parse::<u32>()
                    .map_err(|_| invalid("expected a non-negative integer"))?;
                query.count = Some(count);
            }
            "_offset" => {
                let offset = value
                    .parse::<u32>()
                    .map_err(|_| invalid("expected a non-negative integer"))?;
                query.offset = Some(offset);
            }
            "_cursor" => {
                if !value.is_empty() {
                    query.cursor = Some(value.to_string());
                }
            }
            "_total" => {
                query.total = Some(match value {
                    "none" => TotalMode::None,
                    "estimate" => TotalMode::Estimate,
                    "accurate" => TotalMode::Accurate,
                    _ => return Err(invalid("expected none, estimate or accurate")),
                });
            }
            "_summary" => {
                query.summary = Some(match value {
                    "true" => SummaryMode::True,
                    "false" => SummaryMode::False,
                    "text" => SummaryMode::Text,
                    "data" => SummaryMode::Data,
                    "count" => SummaryMode::Count,
                    _ => return Err(invalid("expected true, false, text, data or count")),
                });
            }
            "_elements" => {
                query.elements.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|e| !e.is_empty())
                        .map(str::to_string),
                );
            }
            "_sort" => {
                for key in value.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                    let directive = SortDirective::parse(key);
                    self.validate_sort(&query.resource_type, &directive)?;
                    query.sort.push(directive);
                }
            }
            "_include" | "_include:iterate" | "_revinclude" | "_revinclude:iterate" => {
                let include_type = if name.starts_with("_include") {
                    IncludeType::Include
                } else {
                    IncludeType::Revinclude
                };
                let iterate = name.ends_with(":iterate");
                let directive = IncludeDirective::parse(include_type, value, iterate)
                    .ok_or_else(|| invalid("expected Source:parameter[:Target]"))?;
                self.validate_include(&query.resource_type, &directive, name, value)?;
                query.includes.push(directive);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn validate_sort(&self, resource_type: &str, directive: &SortDirective) -> Result<(), SearchError> {
        if matches!(directive.parameter.as_str(), "_id" | "_lastUpdated") {
            return Ok(());
        }
        let def = self
            .registry
            .get_active_param(resource_type, &directive.parameter)
            .ok_or_else(|| SearchError::UnknownParameter {
                resource_type: resource_type.to_string(),
                parameter: directive.parameter.clone(),
            })?;
        match def.param_type {
            SearchParamType::String
            | SearchParamType::Date
            | SearchParamType::Number
            | SearchParamType::Token => Ok(()),
            other => Err(SearchError::InvalidValue {
                parameter: "_sort".to_string(),
                value: directive.parameter.clone(),
                message: format!("cannot sort by a {} parameter", other),
            }),
        }
    }

    fn validate_include(
        &self,
        resource_type: &str,
        directive: &IncludeDirective,
        name: &str,
        value: &str,
    ) -> Result<(), SearchError> {
        let invalid = |message: String| SearchError::InvalidValue {
            parameter: name.to_string(),
            value: value.to_string(),
            message,
        };

        if directive.include_type == IncludeType::Include
            && !directive.iterate
            && directive.source_type != resource_type
        {
            return Err(invalid(format!(
                "source type must be {} unless iterating",
                resource_type
            )));
        }
        if directive.search_param == "*" {
            return Ok(());
        }

        let def = self
            .registry
            .get_active_param(&directive.source_type, &directive.search_param)
            .ok_or_else(|| SearchError::UnknownParameter {
                resource_type: directive.source_type.clone(),
                parameter: directive.search_param.clone(),
            })?;
        if def.param_type != SearchParamType::Reference {
            return Err(invalid(format!(
                "'{}' is not a reference parameter",
                directive.search_param
            )));
        }
        if let Some(target) = &directive.target_type {
            if !def.allows_target(target) {
                return Err(invalid(format!(
                    "'{}' cannot reference {}",
                    directive.search_param, target
                )));
            }
        }
        Ok(())
    }

    fn parse_simple(
        &self,
        resource_type: &str,
        name: &str,
        value: &str,
    ) -> Result<Option<SearchParameter>, SearchError> {
        let (code, modifier) = split_modifier(name);
        let def = self
            .registry
            .get_active_param(resource_type, code)
            .ok_or_else(|| SearchError::UnknownParameter {
                resource_type: resource_type.to_string(),
                parameter: code.to_string(),
            })?;

        let modifier = modifier.map(|m| parse_modifier(m, &def)).transpose()?;
        let values = parse_values(code, def.param_type, modifier.as_ref(), value)?;
        if values.is_empty() {
            return Ok(None);
        }

        Ok(Some(SearchParameter {
            name: code.to_string(),
            param_type: def.param_type,
            modifier,
            values,
            chain: Vec::new(),
        }))
    }

    fn parse_chain(
        &self,
        resource_type: &str,
        name: &str,
        value: &str,
    ) -> Result<Option<SearchParameter>, SearchError> {
        let chain_error = |message: String| SearchError::InvalidChain {
            chain: name.to_string(),
            message,
        };

        let links: Vec<&str> = name.split('.').collect();
        if links.iter().any(|l| l.is_empty()) {
            return Err(chain_error("empty link".to_string()));
        }
        if links.len() - 1 > MAX_CHAIN_DEPTH {
            return Err(chain_error(format!(
                "chains may have at most {} links",
                MAX_CHAIN_DEPTH
            )));
        }

        let mut current_types = vec![resource_type.to_string()];
        let mut hops = Vec::with_capacity(links.len() - 1);

        for (i, link) in links[..links.len() - 1].iter().enumerate() {
            let (code, type_modifier) = split_modifier(link);
            let (next_code, _) = split_modifier(links[i + 1]);

            let defs = self.defs_on(&current_types, code);
            if defs.is_empty() {
                if i == 0 {
                    return Err(SearchError::UnknownParameter {
                        resource_type: resource_type.to_string(),
                        parameter: code.to_string(),
                    });
                }
                return Err(chain_error(format!(
                    "'{}' is not defined on {}",
                    code,
                    current_types.join(", ")
                )));
            }
            if defs.iter().any(|d| d.param_type != SearchParamType::Reference) {
                return Err(chain_error(format!("'{}' is not a reference parameter", code)));
            }
            if let Some(t) = type_modifier {
                if SearchModifier::parse(t).is_none_or(|m| !matches!(m, SearchModifier::Type(_))) {
                    return Err(chain_error(format!(
                        "'{}' is not a resource type modifier",
                        t
                    )));
                }
            }

            let mut targets = BTreeSet::new();
            for def in &defs {
                targets.extend(chain_targets(self.registry, def, type_modifier, next_code));
            }
            if targets.is_empty() {
                return Err(chain_error(format!(
                    "no target of '{}' defines '{}'",
                    code, next_code
                )));
            }

            let target_type = if targets.len() == 1 {
                targets.iter().next().cloned()
            } else {
                None
            };
            hops.push(ChainedParameter {
                reference_param: code.to_string(),
                target_type,
                target_param: next_code.to_string(),
            });
            current_types = targets.into_iter().collect();
        }

        let Some(leaf) = links.last() else {
            return Err(chain_error("empty chain".to_string()));
        };
        let (leaf_code, leaf_modifier) = split_modifier(leaf);
        let leaf_defs = self.defs_on(&current_types, leaf_code);
        let Some(leaf_def) = leaf_defs.first() else {
            return Err(chain_error(format!("'{}' is not defined", leaf_code)));
        };
        if leaf_defs.iter().any(|d| d.param_type != leaf_def.param_type) {
            return Err(chain_error(format!(
                "'{}' has different types on {}",
                leaf_code,
                current_types.join(", ")
            )));
        }

        let modifier = leaf_modifier
            .map(|m| parse_modifier(m, leaf_def))
            .transpose()?;
        let values = parse_values(leaf_code, leaf_def.param_type, modifier.as_ref(), value)?;
        if values.is_empty() {
            return Ok(None);
        }

        let chain_name = match leaf_modifier {
            Some(m) => name.strip_suffix(&format!(":{}", m)).unwrap_or(name),
            None => name,
        };
        Ok(Some(SearchParameter {
            name: chain_name.to_string(),
            param_type: leaf_def.param_type,
            modifier,
            values,
            chain: hops,
        }))
    }

    fn parse_reverse_chain(
        &self,
        resource_type: &str,
        name: &str,
        rest: &str,
        value: &str,
    ) -> Result<Option<ReverseChainedParameter>, SearchError> {
        let chain_error = |message: &str| SearchError::InvalidChain {
            chain: name.to_string(),
            message: message.to_string(),
        };

        let parts: Vec<&str> = rest.split(':').collect();
        if parts.contains(&"_has") {
            return Err(chain_error("nested _has is not supported"));
        }
        let (source_type, reference_param, search_param, modifier) = match parts.as_slice() {
            [s, r, p] => (*s, *r, *p, None),
            [s, r, p, m] => (*s, *r, *p, Some(*m)),
            _ => return Err(chain_error("expected _has:Type:reference:parameter")),
        };
        if search_param.contains('.') {
            return Err(chain_error("chains inside _has are not supported"));
        }
        if !self.registry.is_known_type(source_type) {
            return Err(chain_error("unknown source resource type"));
        }

        let reference_def = self
            .registry
            .get_active_param(source_type, reference_param)
            .ok_or_else(|| SearchError::UnknownParameter {
                resource_type: source_type.to_string(),
                parameter: reference_param.to_string(),
            })?;
        if reference_def.param_type != SearchParamType::Reference {
            return Err(chain_error("the link parameter is not a reference"));
        }
        if !reference_def.allows_target(resource_type) {
            return Err(SearchError::InvalidChain {
                chain: name.to_string(),
                message: format!("'{}' cannot reference {}", reference_param, resource_type),
            });
        }

        let search_def = self
            .registry
            .get_active_param(source_type, search_param)
            .ok_or_else(|| SearchError::UnknownParameter {
                resource_type: source_type.to_string(),
                parameter: search_param.to_string(),
            })?;
        let modifier = modifier
            .map(|m| parse_modifier(m, &search_def))
            .transpose()?;
        let values = parse_values(search_param, search_def.param_type, modifier.as_ref(), value)?;
        if values.is_empty() {
            return Ok(None);
        }

        Ok(Some(ReverseChainedParameter {
            source_type: source_type.to_string(),
            reference_param: reference_param.to_string(),
            search_param: search_param.to_string(),
            param_type: search_def.param_type,
            modifier,
            values,
        }))
    }

    fn defs_on(
        &self,
        resource_types: &[String],
        code: &str,
    ) -> Vec<std::sync::Arc<SearchParameterDefinition>> {
        resource_types
            .iter()
            .filter_map(|t| self.registry.get_active_param(t, code))
            .collect()
    }
}

/// Target types a chain may follow from `def` to reach `next_code`.
///
/// An explicit `:Type` must be an allowed target. Otherwise every storable
/// declared target that defines the next parameter is a candidate.
pub fn chain_targets(
    registry: &SearchParameterRegistry,
    def: &SearchParameterDefinition,
    explicit: Option<&str>,
    next_code: &str,
) -> Vec<String> {
    let candidates: Vec<String> = match explicit {
        Some(t) => vec![t.to_string()],
        None if def.targets().is_empty() => registry.resource_types(),
        None => def.targets().to_vec(),
    };
    candidates
        .into_iter()
        .filter(|t| def.allows_target(t))
        .filter(|t| registry.is_known_type(t))
        .filter(|t| registry.get_active_param(t, next_code).is_some())
        .collect()
}

/// Splits a conditional criteria string (`a=1&b=2`, optionally prefixed by
/// `Type?`) into decoded pairs.
pub fn parse_criteria(criteria: &str) -> Vec<(String, String)> {
    let query = criteria
        .split_once('?')
        .map(|(_, q)| q)
        .unwrap_or(criteria);
    form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// Canonical form of conditional criteria: pairs sorted and re-encoded.
///
/// Two requests with the same criteria in a different order share a key.
pub fn normalize_criteria(criteria: &str) -> String {
    let mut pairs = parse_criteria(criteria);
    pairs.sort();
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

fn split_modifier(name: &str) -> (&str, Option<&str>) {
    match name.split_once(':') {
        Some((code, modifier)) => (code, Some(modifier)),
        None => (name, None),
    }
}

fn parse_modifier(
    modifier: &str,
    def: &SearchParameterDefinition,
) -> Result<SearchModifier, SearchError> {
    let unsupported = || SearchError::UnsupportedModifier {
        modifier: modifier.to_string(),
        param_type: def.param_type.to_string(),
    };
    let parsed = SearchModifier::parse(modifier).ok_or_else(unsupported)?;
    if !parsed.is_valid_for(def.param_type) {
        return Err(unsupported());
    }
    if let SearchModifier::Type(t) = &parsed {
        if !def.allows_target(t) {
            return Err(unsupported());
        }
    }
    Ok(parsed)
}

fn parse_values(
    parameter: &str,
    param_type: SearchParamType,
    modifier: Option<&SearchModifier>,
    raw: &str,
) -> Result<Vec<SearchValue>, SearchError> {
    let invalid = |value: &str, message: &str| SearchError::InvalidValue {
        parameter: parameter.to_string(),
        value: value.to_string(),
        message: message.to_string(),
    };

    let mut values = Vec::new();
    for item in split_values(raw) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }

        if modifier == Some(&SearchModifier::Missing) {
            if item != "true" && item != "false" {
                return Err(invalid(item, ":missing expects true or false"));
            }
            values.push(SearchValue::eq(item));
            continue;
        }

        let value = match param_type {
            SearchParamType::Number | SearchParamType::Date | SearchParamType::Quantity => {
                SearchValue::parse(item)
            }
            _ => SearchValue::eq(item),
        };
        if !value.prefix.is_valid_for(param_type) {
            return Err(SearchError::UnsupportedPrefix {
                prefix: value.prefix.to_string(),
                param_type: param_type.to_string(),
            });
        }

        match param_type {
            SearchParamType::Date if DateRange::parse(&value.value).is_none() => {
                return Err(invalid(item, "expected a date, dateTime or instant"));
            }
            SearchParamType::Number if NumberRange::parse(&value.value).is_none() => {
                return Err(invalid(item, "expected a decimal number"));
            }
            SearchParamType::Quantity => {
                let number = value.value.split('|').next().unwrap_or_default();
                if NumberRange::parse(number).is_none() {
                    return Err(invalid(item, "expected number[|system|code]"));
                }
            }
            _ => {}
        }
        values.push(value);
    }
    Ok(values)
}

/// Splits on commas not escaped with a backslash, unescaping `\,`.
fn split_values(raw: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&',') => {
                current.push(',');
                chars.next();
            }
            ',' => values.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    values.push(current);
    values
}
