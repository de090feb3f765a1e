//! Search parameter types.
//!
//! This module defines the typed form of a search request: parameter types,
//! modifiers, comparison prefixes, chains, reverse chains, includes and the
//! result-shaping directives. [`DateRange`] and [`NumberRange`] hold the
//! normalized ranges used on both the index and query sides.

use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Search parameter types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchParamType {
    /// A simple string, like a name or description.
    String,
    /// A search against a URI.
    Uri,
    /// A search for a number.
    Number,
    /// A search for a date, dateTime, or period.
    Date,
    /// A quantity, with a number and units.
    Quantity,
    /// A code from a code system.
    Token,
    /// A reference to another resource.
    Reference,
}

impl SearchParamType {
    /// The value stored in the `param_type` index column.
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchParamType::String => "string",
            SearchParamType::Uri => "uri",
            SearchParamType::Number => "number",
            SearchParamType::Date => "date",
            SearchParamType::Quantity => "quantity",
            SearchParamType::Token => "token",
            SearchParamType::Reference => "reference",
        }
    }
}

impl fmt::Display for SearchParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchParamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "string" => Ok(SearchParamType::String),
            "uri" => Ok(SearchParamType::Uri),
            "number" => Ok(SearchParamType::Number),
            "date" => Ok(SearchParamType::Date),
            "quantity" => Ok(SearchParamType::Quantity),
            "token" => Ok(SearchParamType::Token),
            "reference" => Ok(SearchParamType::Reference),
            _ => Err(format!("unknown search parameter type: {}", s)),
        }
    }
}

/// Search modifiers that can be applied to search parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchModifier {
    /// Case-sensitive whole-value match (string parameters).
    Exact,
    /// Contains substring (string parameters).
    Contains,
    /// Display text prefix (token parameters).
    Text,
    /// Negation (token parameters).
    Not,
    /// Match if value is missing (or present, with `false`).
    Missing,
    /// URI prefix match (uri parameters).
    Below,
    /// URI ancestor match (uri parameters).
    Above,
    /// Match on `Reference.identifier` (reference parameters).
    Identifier,
    /// Restrict the reference target type (reference parameters).
    Type(String),
}

impl fmt::Display for SearchModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchModifier::Exact => write!(f, "exact"),
            SearchModifier::Contains => write!(f, "contains"),
            SearchModifier::Text => write!(f, "text"),
            SearchModifier::Not => write!(f, "not"),
            SearchModifier::Missing => write!(f, "missing"),
            SearchModifier::Below => write!(f, "below"),
            SearchModifier::Above => write!(f, "above"),
            SearchModifier::Identifier => write!(f, "identifier"),
            SearchModifier::Type(t) => write!(f, "{}", t),
        }
    }
}

impl SearchModifier {
    /// Parses a modifier string, returning None for unknown modifiers.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(SearchModifier::Exact),
            "contains" => Some(SearchModifier::Contains),
            "text" => Some(SearchModifier::Text),
            "not" => Some(SearchModifier::Not),
            "missing" => Some(SearchModifier::Missing),
            "below" => Some(SearchModifier::Below),
            "above" => Some(SearchModifier::Above),
            "identifier" => Some(SearchModifier::Identifier),
            _ => {
                // Resource type modifier, e.g. subject:Patient
                if s.chars().next().map(|c| c.is_ascii_uppercase()).unwrap_or(false)
                    && s.chars().all(|c| c.is_ascii_alphanumeric())
                {
                    Some(SearchModifier::Type(s.to_string()))
                } else {
                    None
                }
            }
        }
    }

    /// Returns true if this modifier is valid for the given parameter type.
    pub fn is_valid_for(&self, param_type: SearchParamType) -> bool {
        match self {
            SearchModifier::Exact | SearchModifier::Contains => {
                param_type == SearchParamType::String
            }
            SearchModifier::Text | SearchModifier::Not => param_type == SearchParamType::Token,
            SearchModifier::Missing => true,
            SearchModifier::Below | SearchModifier::Above => param_type == SearchParamType::Uri,
            SearchModifier::Identifier | SearchModifier::Type(_) => {
                param_type == SearchParamType::Reference
            }
        }
    }
}

/// Comparison prefixes for search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchPrefix {
    /// Equal (default).
    #[default]
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Less than.
    Lt,
    /// Greater than or equal.
    Ge,
    /// Less than or equal.
    Le,
    /// Starts after.
    Sa,
    /// Ends before.
    Eb,
    /// Approximately equal.
    Ap,
}

impl fmt::Display for SearchPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchPrefix::Eq => write!(f, "eq"),
            SearchPrefix::Ne => write!(f, "ne"),
            SearchPrefix::Gt => write!(f, "gt"),
            SearchPrefix::Lt => write!(f, "lt"),
            SearchPrefix::Ge => write!(f, "ge"),
            SearchPrefix::Le => write!(f, "le"),
            SearchPrefix::Sa => write!(f, "sa"),
            SearchPrefix::Eb => write!(f, "eb"),
            SearchPrefix::Ap => write!(f, "ap"),
        }
    }
}

impl FromStr for SearchPrefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(SearchPrefix::Eq),
            "ne" => Ok(SearchPrefix::Ne),
            "gt" => Ok(SearchPrefix::Gt),
            "lt" => Ok(SearchPrefix::Lt),
            "ge" => Ok(SearchPrefix::Ge),
            "le" => Ok(SearchPrefix::Le),
            "sa" => Ok(SearchPrefix::Sa),
            "eb" => Ok(SearchPrefix::Eb),
            "ap" => Ok(SearchPrefix::Ap),
            _ => Err(format!("unknown search prefix: {}", s)),
        }
    }
}

impl SearchPrefix {
    /// Extracts a prefix from the beginning of a value string.
    ///
    /// Returns the prefix and the remaining value. A prefix is only recognized
    /// when followed by something that can start a number or a date.
    pub fn extract(value: &str) -> (Self, &str) {
        if let (Some(head), Some(rest)) = (value.get(..2), value.get(2..)) {
            let starts_value = rest
                .chars()
                .next()
                .map(|c| c.is_ascii_digit() || c == '-' || c == '.')
                .unwrap_or(false);
            if starts_value {
                if let Ok(p) = head.parse() {
                    return (p, rest);
                }
            }
        }
        (SearchPrefix::Eq, value)
    }

    /// Returns true if this prefix is valid for the given parameter type.
    pub fn is_valid_for(&self, param_type: SearchParamType) -> bool {
        match self {
            SearchPrefix::Eq => true,
            SearchPrefix::Ne
            | SearchPrefix::Gt
            | SearchPrefix::Lt
            | SearchPrefix::Ge
            | SearchPrefix::Le
            | SearchPrefix::Ap => matches!(
                param_type,
                SearchParamType::Number | SearchParamType::Date | SearchParamType::Quantity
            ),
            SearchPrefix::Sa | SearchPrefix::Eb => param_type == SearchParamType::Date,
        }
    }
}

/// A parsed search parameter with its value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParameter {
    /// The parameter name (e.g., "name", "identifier").
    pub name: String,

    /// The parameter type (of the final parameter for chains).
    pub param_type: SearchParamType,

    /// Modifier, if any.
    pub modifier: Option<SearchModifier>,

    /// The search value(s). Multiple values are ORed.
    pub values: Vec<SearchValue>,

    /// Chained hops (e.g., subject.name=Smith). Empty for plain parameters.
    pub chain: Vec<ChainedParameter>,
}

impl SearchParameter {
    /// Creates a plain parameter with the given values.
    pub fn new(name: impl Into<String>, param_type: SearchParamType, values: Vec<SearchValue>) -> Self {
        Self {
            name: name.into(),
            param_type,
            modifier: None,
            values,
            chain: Vec::new(),
        }
    }

    /// Sets the modifier.
    pub fn with_modifier(mut self, modifier: SearchModifier) -> Self {
        self.modifier = Some(modifier);
        self
    }
}

/// A single search value with optional prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchValue {
    /// The comparison prefix.
    pub prefix: SearchPrefix,

    /// The value to search for.
    pub value: String,
}

impl SearchValue {
    /// Creates a new search value with the given prefix and value.
    pub fn new(prefix: SearchPrefix, value: impl Into<String>) -> Self {
        Self {
            prefix,
            value: value.into(),
        }
    }

    /// Creates a search value with the default (eq) prefix.
    pub fn eq(value: impl Into<String>) -> Self {
        Self::new(SearchPrefix::Eq, value)
    }

    /// Parses a value string, extracting any prefix.
    pub fn parse(s: &str) -> Self {
        let (prefix, value) = SearchPrefix::extract(s);
        Self::new(prefix, value)
    }
}

/// One hop of a chained search parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainedParameter {
    /// The reference parameter being chained through.
    pub reference_param: String,

    /// Optional type modifier on the reference.
    pub target_type: Option<String>,

    /// The parameter evaluated on the referenced resource.
    pub target_param: String,
}

/// A reverse chained parameter (_has).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseChainedParameter {
    /// The resource type that references this resource.
    pub source_type: String,

    /// The reference parameter on the source type.
    pub reference_param: String,

    /// The search parameter on the source type.
    pub search_param: String,

    /// Type of `search_param`.
    pub param_type: SearchParamType,

    /// Modifier on `search_param`, if any.
    pub modifier: Option<SearchModifier>,

    /// The search values (ORed).
    pub values: Vec<SearchValue>,
}

/// Include directive for _include and _revinclude.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncludeDirective {
    /// The type of include.
    pub include_type: IncludeType,

    /// The resource type holding the reference parameter.
    pub source_type: String,

    /// The reference parameter to follow, or `*` for all of them.
    pub search_param: String,

    /// Optional target resource type filter.
    pub target_type: Option<String>,

    /// Whether to iterate (follow includes of included resources).
    pub iterate: bool,
}

impl IncludeDirective {
    /// Parses `Source:param[:Target]`.
    pub fn parse(include_type: IncludeType, value: &str, iterate: bool) -> Option<Self> {
        let mut parts = value.split(':');
        let source_type = parts.next().filter(|s| !s.is_empty())?;
        let search_param = parts.next().filter(|s| !s.is_empty())?;
        let target_type = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            include_type,
            source_type: source_type.to_string(),
            search_param: search_param.to_string(),
            target_type,
            iterate,
        })
    }
}

/// Type of include operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncludeType {
    /// Forward include (_include).
    Include,
    /// Reverse include (_revinclude).
    Revinclude,
}

/// Sort direction for _sort parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SortDirection {
    /// Ascending order.
    #[default]
    Ascending,
    /// Descending order.
    Descending,
}

/// A sort directive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortDirective {
    /// The parameter to sort by.
    pub parameter: String,
    /// The sort direction.
    pub direction: SortDirection,
}

impl SortDirective {
    /// Parses a sort parameter value (e.g., "-date" for descending).
    pub fn parse(s: &str) -> Self {
        if let Some(stripped) = s.strip_prefix('-') {
            Self {
                parameter: stripped.to_string(),
                direction: SortDirection::Descending,
            }
        } else {
            Self {
                parameter: s.to_string(),
                direction: SortDirection::Ascending,
            }
        }
    }
}

/// A complete search query with all parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    /// The resource type being searched.
    pub resource_type: String,

    /// Standard and chained search parameters (ANDed).
    pub parameters: Vec<SearchParameter>,

    /// Reverse chain parameters (_has).
    pub reverse_chains: Vec<ReverseChainedParameter>,

    /// Include directives.
    pub includes: Vec<IncludeDirective>,

    /// Sort directives.
    pub sort: Vec<SortDirective>,

    /// Result count limit (_count).
    pub count: Option<u32>,

    /// Offset for pagination.
    pub offset: Option<u32>,

    /// Cursor for keyset pagination.
    pub cursor: Option<String>,

    /// Whether to include total count (_total).
    pub total: Option<TotalMode>,

    /// Summary mode (_summary).
    pub summary: Option<SummaryMode>,

    /// Elements to include (_elements).
    pub elements: Vec<String>,
}

/// Mode for _total parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TotalMode {
    /// No total.
    None,
    /// Estimated total (answered accurately).
    Estimate,
    /// Accurate total.
    Accurate,
}

/// Mode for _summary parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryMode {
    /// Return summary elements only.
    True,
    /// Return full resource.
    False,
    /// Return text narrative plus mandatory elements.
    Text,
    /// Return everything except the narrative.
    Data,
    /// Return count only.
    Count,
}

impl SearchQuery {
    /// Creates a new search query for the given resource type.
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ..Default::default()
        }
    }

    /// Adds a search parameter.
    pub fn with_parameter(mut self, param: SearchParameter) -> Self {
        self.parameters.push(param);
        self
    }

    /// Adds an include directive.
    pub fn with_include(mut self, include: IncludeDirective) -> Self {
        self.includes.push(include);
        self
    }

    /// Adds a sort directive.
    pub fn with_sort(mut self, sort: SortDirective) -> Self {
        self.sort.push(sort);
        self
    }

    /// Sets the count limit.
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    /// Sets the cursor for keyset pagination.
    pub fn with_cursor(mut self, cursor: String) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Returns true if only the total was asked for.
    pub fn is_count_only(&self) -> bool {
        self.summary == Some(SummaryMode::Count) || self.count == Some(0)
    }
}

/// Precision of a date or dateTime literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatePrecision {
    /// Year only (e.g., "2024")
    Year,
    /// Year and month (e.g., "2024-01")
    Month,
    /// Full date (e.g., "2024-01-15")
    Day,
    /// Date and time to hours (e.g., "2024-01-15T10")
    Hour,
    /// Date and time to minutes (e.g., "2024-01-15T10:30")
    Minute,
    /// Date and time to seconds (e.g., "2024-01-15T10:30:00")
    Second,
    /// Fractional seconds
    Millisecond,
}

impl DatePrecision {
    /// Width of the `ap` tolerance applied on each side of a value.
    pub fn approximation(&self) -> Duration {
        match self {
            DatePrecision::Year => Duration::days(365),
            DatePrecision::Month => Duration::days(30),
            DatePrecision::Day => Duration::days(1),
            DatePrecision::Hour => Duration::hours(1),
            DatePrecision::Minute => Duration::minutes(10),
            DatePrecision::Second | DatePrecision::Millisecond => Duration::seconds(10),
        }
    }
}

impl fmt::Display for DatePrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatePrecision::Year => write!(f, "year"),
            DatePrecision::Month => write!(f, "month"),
            DatePrecision::Day => write!(f, "day"),
            DatePrecision::Hour => write!(f, "hour"),
            DatePrecision::Minute => write!(f, "minute"),
            DatePrecision::Second => write!(f, "second"),
            DatePrecision::Millisecond => write!(f, "millisecond"),
        }
    }
}

const DATE_KEY_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// The closed interval of instants an imprecise date denotes.
///
/// `2024` covers the whole year, `2024-03-01T10:00` covers one minute.
/// Values without a zone are read as UTC. Both ends are inclusive and
/// millisecond-granular so their string keys compare lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    /// First instant in the range.
    pub start: NaiveDateTime,
    /// Last instant in the range.
    pub end: NaiveDateTime,
    /// Precision of the source literal.
    pub precision: DatePrecision,
}

impl DateRange {
    /// Parses a date, dateTime or instant literal.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        match value.split_once('T') {
            None => Self::parse_date(value),
            Some((date_part, time_part)) => {
                let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
                let (time_str, offset_minutes) = split_offset(time_part)?;
                let (time, precision, step) = match time_str.len() {
                    2 => (
                        NaiveTime::from_hms_opt(time_str.parse().ok()?, 0, 0)?,
                        DatePrecision::Hour,
                        Duration::hours(1),
                    ),
                    5 => (
                        NaiveTime::parse_from_str(time_str, "%H:%M").ok()?,
                        DatePrecision::Minute,
                        Duration::minutes(1),
                    ),
                    8 => (
                        NaiveTime::parse_from_str(time_str, "%H:%M:%S").ok()?,
                        DatePrecision::Second,
                        Duration::seconds(1),
                    ),
                    _ => (
                        NaiveTime::parse_from_str(time_str, "%H:%M:%S%.f").ok()?,
                        DatePrecision::Millisecond,
                        Duration::milliseconds(1),
                    ),
                };
                let start = NaiveDateTime::new(date, time) - Duration::minutes(offset_minutes);
                Some(Self {
                    start,
                    end: start + step - Duration::milliseconds(1),
                    precision,
                })
            }
        }
    }

    /// Builds the range of a Period. Missing ends are open.
    pub fn from_period(start: Option<&str>, end: Option<&str>) -> Option<Self> {
        let start_range = start.and_then(Self::parse);
        let end_range = end.and_then(Self::parse);
        if start_range.is_none() && end_range.is_none() {
            return None;
        }
        let precision = start_range
            .or(end_range)
            .map(|r| r.precision)
            .unwrap_or(DatePrecision::Day);
        Some(Self {
            start: start_range.map(|r| r.start).unwrap_or(NaiveDateTime::MIN),
            end: end_range.map(|r| r.end).unwrap_or(NaiveDateTime::MAX),
            precision,
        })
    }

    fn parse_date(value: &str) -> Option<Self> {
        let (first, next, precision) = match value.len() {
            4 => {
                let year: i32 = value.parse().ok()?;
                (
                    NaiveDate::from_ymd_opt(year, 1, 1)?,
                    NaiveDate::from_ymd_opt(year + 1, 1, 1)?,
                    DatePrecision::Year,
                )
            }
            7 => {
                let year: i32 = value.get(..4)?.parse().ok()?;
                let month: u32 = value.get(5..7)?.parse().ok()?;
                let first = NaiveDate::from_ymd_opt(year, month, 1)?;
                let next = if month == 12 {
                    NaiveDate::from_ymd_opt(year + 1, 1, 1)?
                } else {
                    NaiveDate::from_ymd_opt(year, month + 1, 1)?
                };
                (first, next, DatePrecision::Month)
            }
            10 => {
                let day = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
                (day, day.succ_opt()?, DatePrecision::Day)
            }
            _ => return None,
        };
        let start = first.and_hms_opt(0, 0, 0)?;
        let end = next.and_hms_opt(0, 0, 0)? - Duration::milliseconds(1);
        Some(Self {
            start,
            end,
            precision,
        })
    }

    /// Sortable key for the first instant.
    pub fn start_key(&self) -> String {
        format_key(self.start)
    }

    /// Sortable key for the last instant.
    pub fn end_key(&self) -> String {
        format_key(self.end)
    }

    /// The range widened by the `ap` tolerance for its precision.
    pub fn widened(&self) -> Self {
        let delta = self.precision.approximation();
        Self {
            start: self.start.checked_sub_signed(delta).unwrap_or(NaiveDateTime::MIN),
            end: self.end.checked_add_signed(delta).unwrap_or(NaiveDateTime::MAX),
            precision: self.precision,
        }
    }
}

fn format_key(value: NaiveDateTime) -> String {
    if value == NaiveDateTime::MIN {
        return "0000-01-01T00:00:00.000".to_string();
    }
    if value == NaiveDateTime::MAX {
        return "9999-12-31T23:59:59.999".to_string();
    }
    value.format(DATE_KEY_FORMAT).to_string()
}

/// Splits a time literal into the clock part and its UTC offset in minutes.
fn split_offset(time: &str) -> Option<(&str, i64)> {
    if let Some(clock) = time.strip_suffix('Z') {
        return Some((clock, 0));
    }
    match time.rfind(['+', '-']) {
        None => Some((time, 0)),
        Some(pos) => {
            let (clock, offset) = time.split_at(pos);
            let sign = if offset.starts_with('-') { -1 } else { 1 };
            let (hours, minutes) = offset.get(1..)?.split_once(':')?;
            let hours: i64 = hours.parse().ok()?;
            let minutes: i64 = minutes.parse().ok()?;
            Some((clock, sign * (hours * 60 + minutes)))
        }
    }
}

/// A decimal search value with its implicit precision range.
///
/// `100` denotes `[99.5, 100.5)` and `100.0` denotes `[99.95, 100.05)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumberRange {
    /// The value itself.
    pub value: f64,
    /// Inclusive lower bound of the implied range.
    pub low: f64,
    /// Exclusive upper bound of the implied range.
    pub high: f64,
}

impl NumberRange {
    /// Parses a decimal literal, honoring significant decimal places.
    pub fn parse(literal: &str) -> Option<Self> {
        let literal = literal.trim();
        let decimal = Decimal::from_str(literal)
            .or_else(|_| Decimal::from_scientific(literal))
            .ok()?;
        let half = Decimal::new(5, decimal.scale() + 1);
        let to_f64 = |d: Decimal| d.to_string().parse::<f64>().ok();
        Some(Self {
            value: to_f64(decimal)?,
            low: to_f64(decimal - half)?,
            high: to_f64(decimal + half)?,
        })
    }
}
